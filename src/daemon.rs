//! The daemon: every process-wide collaborator packed into one struct.
//!
//! `main` builds a [`Daemon`] and hands an `Arc` of it to every handler and
//! frontend; there are no globals, so tests construct several daemons in
//! one process. The daemon also runs the task that executes commands
//! arriving over the mesh and streams their responses back to the origin.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use meshbox_protocol::{CommandPayload, Envelope, FrameKind};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{info, warn};

use crate::cli::{CommandSource, History, Registry, Response, Responses};
use crate::error::{Error, Result};
use crate::mesh::{MeshConfig, Node};
use crate::network::NetworkManager;
use crate::vm::{VmConfig, VmRegistry, VmState};
use crate::{dispatch, vm};

/// Bounded wait for VMs to reach QUIT during teardown.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Daemon construction parameters, filled from flags.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Base directory for per-VM and per-node state.
    pub base: PathBuf,
    /// Host identifier; defaults to the system hostname.
    pub hostname: Option<String>,
    /// Mesh namespace.
    pub namespace: String,
    /// Mesh target degree.
    pub degree: u32,
    /// Mesh TCP port.
    pub port: u16,
    /// Mesh listen override (tests bind `127.0.0.1:0`).
    pub mesh_bind: Option<String>,
    /// Mesh State Announcement period.
    pub msa_period: Duration,
    /// Initial `mesh send` response timeout.
    pub mesh_timeout: Duration,
    /// Cgroup filesystem root (containers).
    pub cgroup_root: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            base: PathBuf::from("/tmp/meshbox"),
            hostname: None,
            namespace: "meshbox".to_string(),
            degree: 0,
            port: 9000,
            mesh_bind: None,
            msa_period: Duration::from_secs(10),
            mesh_timeout: Duration::from_secs(10),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
        }
    }
}

/// One daemon instance.
pub struct Daemon {
    /// This node's host identifier.
    pub hostname: String,
    /// Construction parameters.
    pub config: DaemonConfig,
    /// The command registry, fixed after startup.
    pub registry: Registry,
    /// The VM registry.
    pub vms: VmRegistry,
    /// Bridge and tap manager.
    pub network: NetworkManager,
    /// The mesh node.
    pub mesh: Node,
    /// The launch template edited by `vm config`.
    pub vm_config: StdMutex<VmConfig>,
    /// Command history ring.
    pub history: StdMutex<History>,
    /// Process-wide command serialization lock.
    pub cmd_lock: Mutex<()>,
    mesh_timeout_secs: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl Daemon {
    /// Build the registry, bind the mesh, and start the mesh command task.
    ///
    /// Failing to create the base directory or bind the mesh listener is a
    /// fatal init error; the caller exits nonzero.
    pub async fn start(config: DaemonConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.base)
            .map_err(|e| Error::Io(std::io::Error::new(e.kind(), format!(
                "cannot create base directory {}: {}",
                config.base.display(),
                e
            ))))?;

        let hostname = match &config.hostname {
            Some(hostname) => hostname.clone(),
            None => system_hostname(),
        };

        let mut registry = Registry::new();
        registry.register_all(dispatch::handlers())?;
        registry.register_all(dispatch::host::handlers())?;
        registry.register_all(vm::handlers::handlers())?;

        let (mesh, mesh_commands) = Node::start(MeshConfig {
            host: hostname.clone(),
            namespace: config.namespace.clone(),
            degree: config.degree,
            port: config.port,
            bind: config.mesh_bind.clone(),
            msa_period: config.msa_period,
        })
        .await?;

        let (shutdown, _) = watch::channel(false);
        let mesh_timeout_secs = AtomicU64::new(config.mesh_timeout.as_secs().max(1));

        let daemon = Arc::new(Self {
            hostname,
            config,
            registry,
            vms: VmRegistry::new(),
            network: NetworkManager::new(),
            mesh,
            vm_config: StdMutex::new(VmConfig::default()),
            history: StdMutex::new(History::default()),
            cmd_lock: Mutex::new(()),
            mesh_timeout_secs,
            shutdown,
        });

        let pid_file = daemon.pid_file();
        if let Err(e) = std::fs::write(&pid_file, format!("{}\n", std::process::id())) {
            warn!(error = %e, "cannot write pid file");
        }

        spawn_mesh_command_task(daemon.clone(), mesh_commands);
        info!(host = %daemon.hostname, base = %daemon.config.base.display(), "daemon up");
        Ok(daemon)
    }

    /// The `mesh send` response timeout.
    pub fn mesh_timeout(&self) -> Duration {
        Duration::from_secs(self.mesh_timeout_secs.load(Ordering::SeqCst))
    }

    /// Set the `mesh send` response timeout (seconds, minimum 1).
    pub fn set_mesh_timeout(&self, secs: u64) {
        self.mesh_timeout_secs.store(secs.max(1), Ordering::SeqCst);
    }

    /// The unix control socket path under the base directory.
    pub fn socket_path(&self) -> PathBuf {
        self.config.base.join("meshbox.sock")
    }

    fn pid_file(&self) -> PathBuf {
        self.config.base.join("meshbox.pid")
    }

    /// Signal every frontend to wind down.
    pub fn begin_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Subscribe to the shutdown signal.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Graceful teardown: kill every VM, close the mesh, remove created
    /// bridges, unlink the pid file.
    pub async fn shutdown(&self) {
        info!(host = %self.hostname, "shutting down");

        for vm in self.vms.list() {
            if vm.state().intersects(VmState::ALIVE) {
                vm.signal_kill();
            }
        }
        let deadline = tokio::time::Instant::now() + TEARDOWN_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            let alive = self
                .vms
                .list()
                .iter()
                .any(|vm| vm.state().intersects(VmState::ALIVE));
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        self.mesh.close().await;
        self.network.teardown().await;
        let _ = std::fs::remove_file(self.pid_file());
        let _ = std::fs::remove_file(self.socket_path());
    }
}

fn system_hostname() -> String {
    #[cfg(target_os = "linux")]
    {
        if let Ok(hostname) = nix::unistd::gethostname() {
            if let Ok(hostname) = hostname.into_string() {
                return hostname;
            }
        }
    }
    "meshbox".to_string()
}

/// Consume command envelopes delivered by the mesh: recompile, run, and
/// stream the collected responses back to the origin under the same TID.
fn spawn_mesh_command_task(daemon: Arc<Daemon>, mut commands: mpsc::Receiver<Envelope>) {
    tokio::spawn(async move {
        while let Some(envelope) = commands.recv().await {
            let daemon = daemon.clone();
            tokio::spawn(async move {
                handle_mesh_command(daemon, envelope).await;
            });
        }
    });
}

async fn handle_mesh_command(daemon: Arc<Daemon>, envelope: Envelope) {
    let payload: CommandPayload = match serde_json::from_value(envelope.body.clone()) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(source = %envelope.source, error = %e, "undecodable mesh command");
            return;
        }
    };

    let mut responses: Responses = match daemon.registry.compile(&payload.original) {
        Err(e) => vec![Response::error(&daemon.hostname, e.to_string())],
        Ok(None) => Vec::new(),
        Ok(Some(mut cmd)) => {
            cmd.source = CommandSource::Meshage;
            cmd.record = cmd.record && payload.record;
            match dispatch::run_commands(&daemon, cmd) {
                Ok(rx) => dispatch::collect(rx).await,
                Err(e) => vec![Response::error(&daemon.hostname, e.to_string())],
            }
        }
    };
    for response in &mut responses {
        if response.host.is_empty() {
            response.host = daemon.hostname.clone();
        }
    }

    let body = match serde_json::to_value(&responses) {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "cannot encode responses");
            return;
        }
    };
    if let Err(e) = daemon
        .mesh
        .send(
            &[envelope.source.clone()],
            FrameKind::Response,
            envelope.traversal,
            envelope.tid,
            body,
        )
        .await
    {
        warn!(source = %envelope.source, error = %e, "cannot return responses");
    }
}
