//! Self-healing broadcast/unicast overlay ("the mesh").
//!
//! Every daemon runs one [`Node`]. Nodes sharing a namespace peer over TCP,
//! gossip their adjacency with periodic Mesh State Announcements, and route
//! framed messages (commands, responses) to named recipients or to every
//! reachable host. Delivery is at-most-once with no retries: a broken next
//! hop drops the message and the caller's timeout surfaces the loss.

pub mod peer;
pub mod state;

pub use state::MeshState;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use meshbox_protocol::{Envelope, Frame, FrameKind, MsaPayload, Traversal};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use peer::PeerHandle;

/// Outbound frame queue depth per peer.
const PEER_QUEUE: usize = 64;

/// Queue depth for envelopes delivered to the local dispatcher / TID waiters.
const DELIVERY_QUEUE: usize = 256;

/// Mesh configuration, taken from the daemon's flags.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// This node's unique host identifier.
    pub host: String,
    /// Only nodes sharing a namespace connect.
    pub namespace: String,
    /// Target peer count; 0 disables autonomous dialing.
    pub degree: u32,
    /// TCP port every node in the namespace listens on.
    pub port: u16,
    /// Listen address override (tests bind `127.0.0.1:0`).
    pub bind: Option<String>,
    /// Mesh State Announcement period.
    pub msa_period: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            host: "meshbox".to_string(),
            namespace: "meshbox".to_string(),
            degree: 0,
            port: 9000,
            bind: None,
            msa_period: Duration::from_secs(10),
        }
    }
}

/// Snapshot returned by `mesh status`.
#[derive(Debug, Clone)]
pub struct MeshStatus {
    /// Local host identifier.
    pub host: String,
    /// Mesh namespace.
    pub namespace: String,
    /// Target degree.
    pub degree: u32,
    /// Listen port.
    pub port: u16,
    /// Current peer hosts, sorted.
    pub peers: Vec<String>,
    /// Number of hosts with an adjacency row.
    pub mesh_size: usize,
}

struct Inner {
    host: String,
    namespace: String,
    degree: AtomicU32,
    advertised_port: u16,
    msa_period: Duration,
    local_addr: SocketAddr,

    peers: Mutex<HashMap<String, PeerHandle>>,
    /// Learned dial addresses, from handshakes (peer IP + advertised port).
    addrs: Mutex<HashMap<String, SocketAddr>>,
    state: RwLock<MeshState>,
    /// Highest MSA epoch flooded per origin.
    seen_msa: Mutex<HashMap<String, u64>>,
    epoch: AtomicU64,
    /// Response waiters keyed by transaction ID.
    tids: Mutex<HashMap<u32, mpsc::Sender<Envelope>>>,
    /// Command envelopes addressed to this node, consumed by the dispatcher.
    commands: mpsc::Sender<Envelope>,
    shutdown: watch::Sender<bool>,
}

/// One daemon's handle on the overlay.
#[derive(Clone)]
pub struct Node {
    inner: Arc<Inner>,
}

impl Node {
    /// Bind the listen socket and start the accept and MSA timer tasks.
    ///
    /// Command envelopes addressed to this node are pushed into the returned
    /// receiver's channel; the daemon consumes them.
    pub async fn start(config: MeshConfig) -> Result<(Self, mpsc::Receiver<Envelope>)> {
        let bind = config
            .bind
            .clone()
            .unwrap_or_else(|| format!("0.0.0.0:{}", config.port));
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|e| Error::Mesh(format!("cannot bind mesh listener on {}: {}", bind, e)))?;
        let local_addr = listener.local_addr()?;

        let (commands_tx, commands_rx) = mpsc::channel(DELIVERY_QUEUE);
        let (shutdown, _) = watch::channel(false);

        // Epochs start at wall-clock millis so a restarted node's gossip is
        // never mistaken for stale announcements.
        let epoch0 = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let inner = Arc::new(Inner {
            host: config.host.clone(),
            namespace: config.namespace.clone(),
            degree: AtomicU32::new(config.degree),
            advertised_port: local_addr.port(),
            msa_period: config.msa_period,
            local_addr,
            peers: Mutex::new(HashMap::new()),
            addrs: Mutex::new(HashMap::new()),
            state: RwLock::new(MeshState::default()),
            seen_msa: Mutex::new(HashMap::new()),
            epoch: AtomicU64::new(epoch0),
            tids: Mutex::new(HashMap::new()),
            commands: commands_tx,
            shutdown,
        });
        inner
            .state
            .write()
            .expect("mesh state lock")
            .set(&config.host, Vec::new());

        let node = Self { inner };
        node.spawn_accept_loop(listener);
        node.spawn_msa_timer();

        info!(host = %config.host, namespace = %config.namespace, addr = %local_addr, "mesh node up");
        Ok((node, commands_rx))
    }

    /// The address the listener actually bound (tests bind port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Local host identifier.
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// Open a peer connection to `target` (`host` or `host:port`).
    pub async fn dial(&self, target: &str) -> Result<()> {
        let addr = self.resolve(target);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| Error::Mesh(format!("dial {}: {}", addr, e)))?;
        let peer_ip = stream.peer_addr()?.ip();
        let (mut read_half, mut write_half) = stream.into_split();

        let hello = peer::handshake_frame(
            &self.inner.host,
            &self.inner.namespace,
            self.inner.advertised_port,
        )?;
        peer::write_frame(&mut write_half, &hello).await?;
        let theirs = peer::read_handshake(&mut read_half).await?;

        if theirs.namespace != self.inner.namespace {
            return Err(Error::Mesh(format!(
                "namespace mismatch dialing {}: ours {:?}, theirs {:?}",
                target, self.inner.namespace, theirs.namespace
            )));
        }

        self.learn_addr(&theirs.host, SocketAddr::new(peer_ip, theirs.port));
        self.add_peer(theirs.host, read_half, write_half);
        Ok(())
    }

    /// Tear down the connection to `host`. The next MSA epoch re-routes or
    /// re-dials.
    pub async fn hangup(&self, host: &str) -> Result<()> {
        let removed = self
            .inner
            .peers
            .lock()
            .expect("peers lock")
            .remove(host)
            .is_some();
        if !removed {
            return Err(Error::Mesh(format!("no such peer: {}", host)));
        }
        self.peers_changed();
        Ok(())
    }

    /// Target degree.
    pub fn degree(&self) -> u32 {
        self.inner.degree.load(Ordering::SeqCst)
    }

    /// Set the target degree; healing happens on the next MSA epoch.
    pub fn set_degree(&self, degree: u32) {
        self.inner.degree.store(degree, Ordering::SeqCst);
    }

    /// Current peer hosts, sorted.
    pub fn peer_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .inner
            .peers
            .lock()
            .expect("peers lock")
            .keys()
            .cloned()
            .collect();
        hosts.sort();
        hosts
    }

    /// Every host reachable through the current mesh state, excluding self.
    pub fn reachable(&self) -> Vec<String> {
        let mut hosts = self
            .inner
            .state
            .read()
            .expect("mesh state lock")
            .reachable(&self.inner.host);
        for peer in self.peer_hosts() {
            if !hosts.contains(&peer) {
                hosts.push(peer);
            }
        }
        hosts.sort();
        hosts
    }

    /// Status snapshot for `mesh status`.
    pub fn status(&self) -> MeshStatus {
        MeshStatus {
            host: self.inner.host.clone(),
            namespace: self.inner.namespace.clone(),
            degree: self.degree(),
            port: self.inner.advertised_port,
            peers: self.peer_hosts(),
            mesh_size: self.inner.state.read().expect("mesh state lock").len(),
        }
    }

    /// Sorted adjacency dump for `mesh list`.
    pub fn adjacency(&self) -> BTreeMap<String, Vec<String>> {
        self.inner.state.read().expect("mesh state lock").dump()
    }

    /// Register a waiter for responses carrying `tid`.
    pub fn register_tid(&self, tid: u32) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(DELIVERY_QUEUE);
        self.inner
            .tids
            .lock()
            .expect("tids lock")
            .insert(tid, tx);
        rx
    }

    /// Drop the waiter for `tid`; later responses are logged and dropped.
    pub fn unregister_tid(&self, tid: u32) {
        self.inner.tids.lock().expect("tids lock").remove(&tid);
    }

    /// Send `body` to `recipients`.
    ///
    /// Returns the recipients that had no route; everything else was handed
    /// to its next hop. The local host is skipped (callers run locally
    /// themselves).
    pub async fn send(
        &self,
        recipients: &[String],
        kind: FrameKind,
        traversal: Traversal,
        tid: u32,
        body: serde_json::Value,
    ) -> Result<Vec<String>> {
        let envelope = Envelope {
            source: self.inner.host.clone(),
            recipients: recipients.to_vec(),
            tid,
            traversal,
            body,
        };
        Ok(self.route(kind, envelope).await)
    }

    /// Shut down: stop the accept loop and MSA timer, drop every peer.
    pub async fn close(&self) {
        let _ = self.inner.shutdown.send(true);
        self.inner.peers.lock().expect("peers lock").clear();
        info!(host = %self.inner.host, "mesh node closed");
    }

    // -- internals ---------------------------------------------------------

    fn resolve(&self, target: &str) -> String {
        if target.contains(':') {
            return target.to_string();
        }
        if let Some(addr) = self
            .inner
            .addrs
            .lock()
            .expect("addrs lock")
            .get(target)
        {
            return addr.to_string();
        }
        format!("{}:{}", target, self.inner.advertised_port)
    }

    fn learn_addr(&self, host: &str, addr: SocketAddr) {
        self.inner
            .addrs
            .lock()
            .expect("addrs lock")
            .insert(host.to_string(), addr);
    }

    fn spawn_accept_loop(&self, listener: TcpListener) {
        let node = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((stream, addr)) = accepted else { break };
                        let node = node.clone();
                        tokio::spawn(async move {
                            if let Err(e) = node.accept_peer(stream).await {
                                warn!(%addr, error = %e, "mesh accept failed");
                            }
                        });
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    async fn accept_peer(&self, stream: TcpStream) -> Result<()> {
        let peer_ip = stream.peer_addr()?.ip();
        let (mut read_half, mut write_half) = stream.into_split();

        let theirs = peer::read_handshake(&mut read_half).await?;
        if theirs.namespace != self.inner.namespace {
            return Err(Error::Mesh(format!(
                "refusing {}: namespace {:?} != {:?}",
                theirs.host, theirs.namespace, self.inner.namespace
            )));
        }

        let hello = peer::handshake_frame(
            &self.inner.host,
            &self.inner.namespace,
            self.inner.advertised_port,
        )?;
        peer::write_frame(&mut write_half, &hello).await?;

        self.learn_addr(&theirs.host, SocketAddr::new(peer_ip, theirs.port));
        self.add_peer(theirs.host, read_half, write_half);
        Ok(())
    }

    fn add_peer(
        &self,
        host: String,
        mut read_half: tokio::net::tcp::OwnedReadHalf,
        mut write_half: tokio::net::tcp::OwnedWriteHalf,
    ) {
        {
            let peers = self.inner.peers.lock().expect("peers lock");
            if peers.contains_key(&host) {
                debug!(%host, "dropping duplicate peer connection");
                return;
            }
        }

        let (tx, mut rx) = mpsc::channel::<Frame>(PEER_QUEUE);

        let writer_host = host.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = peer::write_frame(&mut write_half, &frame).await {
                    // Next hop broke: the frame is dropped, the caller's
                    // timeout surfaces the loss.
                    warn!(host = %writer_host, error = %e, "peer write failed, dropping");
                    break;
                }
            }
        });

        let node = self.clone();
        let reader_host = host.clone();
        let reader = tokio::spawn(async move {
            loop {
                match peer::read_frame(&mut read_half).await {
                    Ok(frame) => node.handle_frame(&reader_host, frame).await,
                    Err(e) => {
                        debug!(host = %reader_host, error = %e, "peer connection closed");
                        break;
                    }
                }
            }
            node.drop_peer(&reader_host);
        });

        self.inner.peers.lock().expect("peers lock").insert(
            host.clone(),
            PeerHandle {
                host,
                tx,
                reader,
                writer,
            },
        );
        self.peers_changed();
    }

    fn drop_peer(&self, host: &str) {
        let removed = self
            .inner
            .peers
            .lock()
            .expect("peers lock")
            .remove(host)
            .is_some();
        if removed {
            self.peers_changed();
        }
    }

    /// Refresh the local adjacency row and gossip it immediately.
    fn peers_changed(&self) {
        let peers = self.peer_hosts();
        self.inner
            .state
            .write()
            .expect("mesh state lock")
            .set(&self.inner.host, peers);
        let node = self.clone();
        tokio::spawn(async move { node.send_msa().await });
    }

    fn spawn_msa_timer(&self) {
        let node = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        let period = self.inner.msa_period;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => node.send_msa().await,
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    async fn send_msa(&self) {
        let neighbors = self.peer_hosts();
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let envelope = Envelope {
            source: self.inner.host.clone(),
            recipients: Vec::new(),
            tid: 0,
            traversal: Traversal::Unordered,
            body: match serde_json::to_value(MsaPayload { neighbors, epoch }) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "cannot encode MSA");
                    return;
                }
            },
        };
        let Ok(frame) = Frame::from_envelope(FrameKind::Msa, &envelope) else {
            return;
        };
        for tx in self.peer_txs(None) {
            let _ = tx.send(frame.clone()).await;
        }
    }

    /// Sender handles for every peer, optionally skipping one host.
    fn peer_txs(&self, except: Option<&str>) -> Vec<mpsc::Sender<Frame>> {
        self.inner
            .peers
            .lock()
            .expect("peers lock")
            .values()
            .filter(|p| Some(p.host.as_str()) != except)
            .map(|p| p.tx.clone())
            .collect()
    }

    fn peer_tx(&self, host: &str) -> Option<mpsc::Sender<Frame>> {
        self.inner
            .peers
            .lock()
            .expect("peers lock")
            .get(host)
            .map(|p| p.tx.clone())
    }

    async fn handle_frame(&self, from: &str, frame: Frame) {
        match frame.kind {
            FrameKind::Handshake => {
                warn!(%from, "unexpected handshake after connection setup");
            }
            FrameKind::Msa => self.handle_msa(from, frame).await,
            FrameKind::Command | FrameKind::Response => {
                let envelope = match frame.envelope() {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(%from, error = %e, "undecodable envelope, dropping");
                        return;
                    }
                };
                self.deliver_and_forward(frame.kind, envelope).await;
            }
        }
    }

    async fn handle_msa(&self, from: &str, frame: Frame) {
        let Ok(envelope) = frame.envelope() else {
            warn!(%from, "undecodable MSA, dropping");
            return;
        };
        if envelope.source == self.inner.host {
            return;
        }
        let Ok(payload) = serde_json::from_value::<MsaPayload>(envelope.body.clone()) else {
            warn!(source = %envelope.source, "malformed MSA body, dropping");
            return;
        };

        // Flood each (origin, epoch) announcement at most once.
        {
            let mut seen = self.inner.seen_msa.lock().expect("seen lock");
            let known = seen.entry(envelope.source.clone()).or_insert(0);
            if *known >= payload.epoch {
                return;
            }
            *known = payload.epoch;
        }

        debug!(source = %envelope.source, epoch = payload.epoch, "MSA update");
        self.inner
            .state
            .write()
            .expect("mesh state lock")
            .set(&envelope.source, payload.neighbors);

        for tx in self.peer_txs(Some(from)) {
            let _ = tx.send(frame.clone()).await;
        }

        self.heal_degree();
    }

    /// Dial a candidate when the peer count has fallen below the target
    /// degree. Degree is a floor, not a ceiling: excess peers are kept.
    fn heal_degree(&self) {
        let degree = self.degree() as usize;
        if degree == 0 {
            return;
        }
        let (count, peered): (usize, HashSet<String>) = {
            let peers = self.inner.peers.lock().expect("peers lock");
            (peers.len(), peers.keys().cloned().collect())
        };
        if count >= degree {
            return;
        }

        let candidates = self
            .inner
            .state
            .read()
            .expect("mesh state lock")
            .dial_candidates(&self.inner.host, &peered);
        let Some(target) = candidates.into_iter().next() else {
            return;
        };

        let node = self.clone();
        tokio::spawn(async move {
            info!(%target, "below target degree, dialing");
            if let Err(e) = node.dial(&target).await {
                warn!(%target, error = %e, "degree-heal dial failed");
            }
        });
    }

    async fn deliver_and_forward(&self, kind: FrameKind, envelope: Envelope) {
        let mine = envelope.recipients.is_empty()
            || envelope.recipients.iter().any(|r| r == &self.inner.host);

        if mine {
            self.deliver_local(kind, &envelope).await;
        }

        let rest: Vec<String> = envelope
            .recipients
            .iter()
            .filter(|r| *r != &self.inner.host)
            .cloned()
            .collect();
        if !rest.is_empty() {
            let forward = Envelope {
                recipients: rest,
                ..envelope
            };
            let dropped = self.route(kind, forward).await;
            if !dropped.is_empty() {
                warn!(hosts = ?dropped, "unroutable recipients, dropping");
            }
        }
    }

    async fn deliver_local(&self, kind: FrameKind, envelope: &Envelope) {
        match kind {
            FrameKind::Command => {
                if self.inner.commands.send(envelope.clone()).await.is_err() {
                    warn!("dispatcher gone, dropping command envelope");
                }
            }
            FrameKind::Response => {
                let waiter = self
                    .inner
                    .tids
                    .lock()
                    .expect("tids lock")
                    .get(&envelope.tid)
                    .cloned();
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(envelope.clone()).await;
                    }
                    None => {
                        warn!(tid = envelope.tid, source = %envelope.source,
                              "dropping response with unknown TID");
                    }
                }
            }
            _ => {}
        }
    }

    /// Partition recipients by next hop and hand each subset to its peer.
    ///
    /// Returns the recipients that had no route. A hop equal to the
    /// message's source is never taken.
    async fn route(&self, kind: FrameKind, envelope: Envelope) -> Vec<String> {
        let mut by_hop: HashMap<String, Vec<String>> = HashMap::new();
        let mut unroutable = Vec::new();

        {
            let peers = self.inner.peers.lock().expect("peers lock");
            let state = self.inner.state.read().expect("mesh state lock");
            for recipient in &envelope.recipients {
                if recipient == &self.inner.host {
                    continue;
                }
                let hop = if peers.contains_key(recipient) {
                    Some(recipient.clone())
                } else {
                    state.next_hop(&self.inner.host, recipient)
                };
                match hop {
                    Some(h) if h == envelope.source => {
                        // Never forward a message back to its source.
                        warn!(%recipient, "route leads back to source, dropping");
                    }
                    Some(h) if peers.contains_key(&h) => {
                        by_hop.entry(h).or_default().push(recipient.clone());
                    }
                    Some(h) => {
                        // The state still routes through a peer that is
                        // gone: drop; the caller's timeout surfaces it.
                        warn!(%recipient, hop = %h, "next hop not connected, dropping");
                    }
                    None => unroutable.push(recipient.clone()),
                }
            }
        }

        match envelope.traversal {
            // One branch at a time, bounding work amplification.
            Traversal::Depth => {
                for (hop, recipients) in by_hop {
                    self.forward_to(&hop, kind, &envelope, recipients).await;
                }
            }
            // Fan out to every branch of this hop level at once.
            Traversal::Breadth | Traversal::Unordered => {
                let mut futures = Vec::new();
                for (hop, recipients) in by_hop {
                    let node = self.clone();
                    let envelope = envelope.clone();
                    futures.push(async move {
                        node.forward_to(&hop, kind, &envelope, recipients).await;
                    });
                }
                futures_util::future::join_all(futures).await;
            }
        }

        unroutable
    }

    async fn forward_to(
        &self,
        hop: &str,
        kind: FrameKind,
        envelope: &Envelope,
        recipients: Vec<String>,
    ) {
        let subset = Envelope {
            recipients,
            ..envelope.clone()
        };
        let Ok(frame) = Frame::from_envelope(kind, &subset) else {
            warn!("cannot encode envelope for forwarding");
            return;
        };
        match self.peer_tx(hop) {
            Some(tx) => {
                if tx.send(frame).await.is_err() {
                    warn!(%hop, "peer queue closed, dropping message");
                }
            }
            None => warn!(%hop, "next hop vanished, dropping message"),
        }
    }
}

/// Generate a fresh random transaction identifier.
pub fn random_tid() -> u32 {
    let mut buf = [0u8; 4];
    // getrandom only fails on broken platforms; fall back to the clock.
    if getrandom::fill(&mut buf).is_err() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        return nanos;
    }
    u32::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(host: &str) -> MeshConfig {
        MeshConfig {
            host: host.to_string(),
            namespace: "testing".to_string(),
            degree: 0,
            port: 0,
            bind: Some("127.0.0.1:0".to_string()),
            msa_period: Duration::from_millis(50),
        }
    }

    async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn dial_and_namespace_gate() {
        let (a, _arx) = Node::start(config("a")).await.unwrap();
        let (b, _brx) = Node::start(config("b")).await.unwrap();

        a.dial(&b.local_addr().to_string()).await.unwrap();
        wait_until("a-b peering", || {
            a.peer_hosts() == vec!["b".to_string()] && b.peer_hosts() == vec!["a".to_string()]
        })
        .await;

        let mut other = config("c");
        other.namespace = "elsewhere".to_string();
        let (c, _crx) = Node::start(other).await.unwrap();
        assert!(c.dial(&b.local_addr().to_string()).await.is_err());

        a.close().await;
        b.close().await;
        c.close().await;
    }

    #[tokio::test]
    async fn msa_converges_line_topology() {
        let (a, _arx) = Node::start(config("a")).await.unwrap();
        let (b, _brx) = Node::start(config("b")).await.unwrap();
        let (c, _crx) = Node::start(config("c")).await.unwrap();

        a.dial(&b.local_addr().to_string()).await.unwrap();
        c.dial(&b.local_addr().to_string()).await.unwrap();

        wait_until("full reachability at a", || {
            a.reachable() == vec!["b".to_string(), "c".to_string()]
        })
        .await;
        wait_until("full reachability at c", || {
            c.reachable() == vec!["a".to_string(), "b".to_string()]
        })
        .await;

        a.close().await;
        b.close().await;
        c.close().await;
    }

    #[tokio::test]
    async fn unicast_routes_through_intermediate() {
        let (a, _arx) = Node::start(config("a")).await.unwrap();
        let (b, _brx) = Node::start(config("b")).await.unwrap();
        let (c, mut crx) = Node::start(config("c")).await.unwrap();

        a.dial(&b.local_addr().to_string()).await.unwrap();
        c.dial(&b.local_addr().to_string()).await.unwrap();
        wait_until("routing state at a", || {
            a.reachable().contains(&"c".to_string())
        })
        .await;

        let unroutable = a
            .send(
                &["c".to_string()],
                FrameKind::Command,
                Traversal::Unordered,
                42,
                serde_json::json!({"original": "version", "record": false}),
            )
            .await
            .unwrap();
        assert!(unroutable.is_empty());

        let envelope = tokio::time::timeout(Duration::from_secs(5), crx.recv())
            .await
            .expect("delivery within timeout")
            .expect("channel open");
        assert_eq!(envelope.source, "a");
        assert_eq!(envelope.tid, 42);

        a.close().await;
        b.close().await;
        c.close().await;
    }

    #[tokio::test]
    async fn unroutable_host_reported() {
        let (a, _arx) = Node::start(config("a")).await.unwrap();
        let unroutable = a
            .send(
                &["ghost".to_string()],
                FrameKind::Command,
                Traversal::Unordered,
                7,
                serde_json::Value::Null,
            )
            .await
            .unwrap();
        assert_eq!(unroutable, vec!["ghost".to_string()]);
        a.close().await;
    }

    #[tokio::test]
    async fn response_correlates_by_tid() {
        let (a, _arx) = Node::start(config("a")).await.unwrap();
        let (b, _brx) = Node::start(config("b")).await.unwrap();
        a.dial(&b.local_addr().to_string()).await.unwrap();
        wait_until("peering", || !a.peer_hosts().is_empty()).await;

        let mut waiter = a.register_tid(99);
        b.send(
            &["a".to_string()],
            FrameKind::Response,
            Traversal::Unordered,
            99,
            serde_json::json!([{"host": "b", "response": "ok"}]),
        )
        .await
        .unwrap();

        let envelope = tokio::time::timeout(Duration::from_secs(5), waiter.recv())
            .await
            .expect("delivery within timeout")
            .expect("channel open");
        assert_eq!(envelope.tid, 99);
        a.unregister_tid(99);

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn degree_heal_dials_known_host() {
        let (a, _arx) = Node::start(config("a")).await.unwrap();
        let (b, _brx) = Node::start(config("b")).await.unwrap();
        let (c, _crx) = Node::start(config("c")).await.unwrap();

        a.dial(&b.local_addr().to_string()).await.unwrap();
        c.dial(&b.local_addr().to_string()).await.unwrap();

        // c wants two peers; it knows of a through b's gossip and a's
        // address from nothing yet — teach it the address, as a DNS-backed
        // deployment would resolve the hostname.
        c.set_degree(2);
        c.learn_addr("a", a.local_addr());

        wait_until("c heals to degree 2", || c.peer_hosts().len() >= 2).await;

        a.close().await;
        b.close().await;
        c.close().await;
    }
}
