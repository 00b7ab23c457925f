//! Bridge and tap plumbing shared by both VM variants.
//!
//! Taps are created on a software bridge (OVS) and handed to the hypervisor,
//! or created as veth pairs whose far end lands inside a container's network
//! namespace. All bridge mutations run external tooling (`ovs-vsctl`, `ip`)
//! and are serialized by a single command lock.
//!
//! Guest IPs are learned passively: a per-VM snooper polls the host neighbor
//! table and matches entries against the fleet's MACs.

use std::collections::HashMap;
use std::process::Output;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Default bridge every NIC joins unless configured otherwise.
pub const DEFAULT_BRIDGE: &str = "meshbox0";

/// Bridge and tap manager. One per daemon.
pub struct NetworkManager {
    /// Serializes every external bridge mutation.
    ovs_lock: Mutex<()>,
    /// Monotonic suffix for generated tap names.
    tap_counter: AtomicU32,
    /// Bridges this daemon created and must tear down.
    created_bridges: Mutex<Vec<String>>,
}

impl Default for NetworkManager {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkManager {
    /// A manager with no bridges created yet.
    pub fn new() -> Self {
        Self {
            ovs_lock: Mutex::new(()),
            tap_counter: AtomicU32::new(0),
            created_bridges: Mutex::new(Vec::new()),
        }
    }

    /// Next generated tap name (`mega_tapN`).
    pub fn next_tap_name(&self) -> String {
        let n = self.tap_counter.fetch_add(1, Ordering::SeqCst);
        format!("mega_tap{}", n)
    }

    /// Ensure `bridge` exists, creating it when needed.
    pub async fn ensure_bridge(&self, bridge: &str) -> Result<()> {
        let _guard = self.ovs_lock.lock().await;
        let exists = run("ovs-vsctl", &["br-exists", bridge]).await?;
        if exists.status.success() {
            return Ok(());
        }
        check(run("ovs-vsctl", &["add-br", bridge]).await?, "add-br")?;
        check(run("ip", &["link", "set", bridge, "up"]).await?, "bridge up")?;
        self.created_bridges.lock().await.push(bridge.to_string());
        debug!(%bridge, "created bridge");
        Ok(())
    }

    /// Create a hypervisor tap on `bridge` tagged with `vlan`.
    pub async fn create_tap(&self, bridge: &str, tap: &str, vlan: u32) -> Result<()> {
        self.ensure_bridge(bridge).await?;
        let _guard = self.ovs_lock.lock().await;
        check(
            run("ip", &["tuntap", "add", "mode", "tap", tap]).await?,
            "tuntap add",
        )?;
        check(run("ip", &["link", "set", tap, "up"]).await?, "tap up")?;
        let tag = format!("tag={}", vlan);
        if let Err(e) = check(
            run("ovs-vsctl", &["add-port", bridge, tap, &tag]).await?,
            "add-port",
        ) {
            // Roll the half-made tap back before surfacing the error.
            let _ = run("ip", &["tuntap", "del", "mode", "tap", tap]).await;
            return Err(e);
        }
        debug!(%bridge, %tap, vlan, "created tap");
        Ok(())
    }

    /// Create a veth pair: `tap` on `bridge`, the far end inside `netns`.
    ///
    /// Used for containers, where the guest side must live in the VM's
    /// network namespace; the namespace must already be linked under
    /// `/var/run/netns`.
    pub async fn create_veth(
        &self,
        bridge: &str,
        tap: &str,
        vlan: u32,
        netns: &str,
        guest_dev: &str,
    ) -> Result<()> {
        self.ensure_bridge(bridge).await?;
        let _guard = self.ovs_lock.lock().await;
        check(
            run(
                "ip",
                &[
                    "link", "add", tap, "type", "veth", "peer", "name", guest_dev, "netns", netns,
                ],
            )
            .await?,
            "veth add",
        )?;
        check(run("ip", &["link", "set", tap, "up"]).await?, "veth up")?;
        check(
            run("ip", &["-n", netns, "link", "set", guest_dev, "up"]).await?,
            "guest veth up",
        )?;
        let tag = format!("tag={}", vlan);
        if let Err(e) = check(
            run("ovs-vsctl", &["add-port", bridge, tap, &tag]).await?,
            "add-port",
        ) {
            let _ = run("ip", &["link", "del", tap]).await;
            return Err(e);
        }
        debug!(%bridge, %tap, %netns, vlan, "created veth pair");
        Ok(())
    }

    /// Remove `tap` from `bridge` and delete it. Best effort on teardown.
    pub async fn destroy_tap(&self, bridge: &str, tap: &str) -> Result<()> {
        let _guard = self.ovs_lock.lock().await;
        let _ = run("ovs-vsctl", &["del-port", bridge, tap]).await;
        let deleted = run("ip", &["link", "del", tap]).await?;
        if !deleted.status.success() {
            // tuntap taps need the tuntap deletion form.
            check(
                run("ip", &["tuntap", "del", "mode", "tap", tap]).await?,
                "tap del",
            )?;
        }
        debug!(%bridge, %tap, "destroyed tap");
        Ok(())
    }

    /// Tear down every bridge this daemon created.
    pub async fn teardown(&self) {
        let _guard = self.ovs_lock.lock().await;
        for bridge in self.created_bridges.lock().await.drain(..) {
            if let Ok(out) = run("ovs-vsctl", &["del-br", &bridge]).await {
                if !out.status.success() {
                    warn!(%bridge, "could not remove bridge");
                }
            }
        }
    }
}

/// One pass over the host neighbor table: MAC → (IPv4, IPv6).
///
/// The per-VM snooper task calls this periodically and copies matches onto
/// the VM's NICs.
pub async fn neighbor_addresses() -> Result<HashMap<String, (Option<String>, Option<String>)>> {
    let out = run("ip", &["neigh", "show"]).await?;
    let text = String::from_utf8_lossy(&out.stdout);
    let mut table: HashMap<String, (Option<String>, Option<String>)> = HashMap::new();

    // Lines look like: `10.0.0.5 dev meshbox0 lladdr de:ad:be:ef:00:01 REACHABLE`
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(pos) = fields.iter().position(|f| *f == "lladdr") else {
            continue;
        };
        let (Some(addr), Some(mac)) = (fields.first(), fields.get(pos + 1)) else {
            continue;
        };
        let entry = table.entry(mac.to_lowercase()).or_default();
        if addr.contains(':') {
            entry.1.get_or_insert_with(|| (*addr).to_string());
        } else {
            entry.0.get_or_insert_with(|| (*addr).to_string());
        }
    }
    Ok(table)
}

async fn run(program: &str, args: &[&str]) -> Result<Output> {
    debug!(%program, ?args, "exec");
    Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::Network(format!("{} failed to run: {}", program, e)))
}

fn check(output: Output, what: &str) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    Err(Error::Network(format!(
        "{}: {}",
        what,
        String::from_utf8_lossy(&output.stderr).trim()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_names_are_unique() {
        let manager = NetworkManager::new();
        let a = manager.next_tap_name();
        let b = manager.next_tap_name();
        assert_ne!(a, b);
        assert!(a.starts_with("mega_tap"));
    }
}
