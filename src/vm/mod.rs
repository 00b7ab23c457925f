//! The polymorphic VM subsystem.
//!
//! Two variants — KVM and container — share one base record and one state
//! machine:
//!
//! ```text
//!                     Launch
//!               ───────────────▶ BUILDING
//!                                   │ launch() succeeds
//!                                   ▼
//!    ┌──────── Stop ──────── RUNNING ──── Kill ───▶ QUIT
//!    │                          ▲                    │
//!    ▼                          │                    ▼ (relaunch)
//!  PAUSED ──────── Start ───────┘                  BUILDING
//!                                   any failure ▶ ERROR
//! ```
//!
//! Transitions are gated by the VM's runtime lock and written durably to the
//! instance-dir `state` file before they become observable. A process-wide
//! registry owns every VM by integer ID; spawned tasks (child wait, network
//! snooper) hold only the ID and exit when the registry lookup fails.

pub mod config;
pub mod container;
pub mod handlers;
pub mod kvm;
pub mod qmp;

pub use config::{NetSpec, VmConfig};

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::error::{Error, Result};

bitflags! {
    /// VM lifecycle states. A mask so `vm info` filters can name several at
    /// once (`state=running|paused`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmState: u32 {
        /// Launch accepted, resources being assembled.
        const BUILDING = 1 << 0;
        /// Guest executing.
        const RUNNING = 1 << 1;
        /// Guest frozen/stopped, resumable.
        const PAUSED = 1 << 2;
        /// Guest exited; artifacts remain until flush.
        const QUIT = 1 << 3;
        /// Launch or runtime failure; relaunchable or flushable.
        const ERROR = 1 << 4;
    }
}

impl VmState {
    /// States in which the VM holds host resources and blocks conflicts.
    pub const ALIVE: VmState = VmState::BUILDING.union(VmState::RUNNING).union(VmState::PAUSED);

    /// Parse one state name as used by `vm info` filters.
    pub fn parse(name: &str) -> Result<Self> {
        Ok(match name {
            "building" => VmState::BUILDING,
            "running" => VmState::RUNNING,
            "paused" => VmState::PAUSED,
            "quit" => VmState::QUIT,
            "error" => VmState::ERROR,
            _ => return Err(Error::Invalid(format!("unknown state: {:?}", name))),
        })
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (VmState::BUILDING, "building"),
            (VmState::RUNNING, "running"),
            (VmState::PAUSED, "paused"),
            (VmState::QUIT, "quit"),
            (VmState::ERROR, "error"),
        ]
        .iter()
        .filter(|(bit, _)| self.contains(*bit))
        .map(|(_, name)| *name)
        .collect();
        write!(f, "{}", names.join("|"))
    }
}

/// VM variant tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmType {
    /// Hardware-virtualized guest driven over the hypervisor monitor.
    Kvm,
    /// Namespaced process tree with a cgroup freezer.
    Container,
}

impl fmt::Display for VmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmType::Kvm => write!(f, "kvm"),
            VmType::Container => write!(f, "container"),
        }
    }
}

/// One NIC of a launched VM.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Nic {
    /// Bridge the tap joined.
    pub bridge: String,
    /// VLAN tag.
    pub vlan: u32,
    /// MAC, resolved at launch.
    pub mac: String,
    /// Guest device driver.
    pub driver: String,
    /// Host-side tap name, assigned at launch.
    pub tap: String,
    /// IPv4 learned from the neighbor table.
    pub ip4: String,
    /// IPv6 learned from the neighbor table.
    pub ip6: String,
}

/// Variant-specific runtime payload.
#[derive(Debug)]
pub enum VmKind {
    /// KVM payload.
    Kvm(kvm::KvmRuntime),
    /// Container payload.
    Container(container::ContainerRuntime),
}

/// Mutable runtime half of a VM, behind the VM lock.
#[derive(Debug)]
pub struct VmRuntime {
    /// Current lifecycle state.
    pub state: VmState,
    /// Error text when `state` contains ERROR.
    pub error: Option<String>,
    /// NICs with launch-time taps and snooped IPs.
    pub networks: Vec<Nic>,
    /// Variant payload.
    pub kind: VmKind,
}

/// One virtual machine owned by the registry.
#[derive(Debug)]
pub struct Vm {
    /// Monotonic registry ID.
    pub id: u32,
    /// Unique name.
    pub name: String,
    /// Variant tag.
    pub vm_type: VmType,
    /// Unique UUID (auto-generated when not configured).
    pub uuid: String,
    /// Per-VM directory holding config/name/state/taps/uuid and sockets.
    pub instance_path: PathBuf,
    /// Launch-time snapshot of the config template.
    pub config: VmConfig,
    /// MACs reserved at launch preamble; conflict-checked fleet-wide.
    pub macs: StdMutex<Vec<String>>,
    /// Single-use teardown signal; the wait task consumes it.
    kill: StdMutex<watch::Sender<bool>>,
    /// Lock-free mirror of `runtime.state` for conflict checks and filters.
    state_mirror: AtomicU32,
    runtime: Mutex<VmRuntime>,
}

impl Vm {
    fn new(
        id: u32,
        name: String,
        vm_type: VmType,
        uuid: String,
        instance_path: PathBuf,
        config: VmConfig,
        networks: Vec<Nic>,
        kind: VmKind,
    ) -> Self {
        let (kill, _) = watch::channel(false);
        Self {
            id,
            name,
            vm_type,
            uuid,
            instance_path,
            config,
            macs: StdMutex::new(Vec::new()),
            kill: StdMutex::new(kill),
            state_mirror: AtomicU32::new(VmState::BUILDING.bits()),
            runtime: Mutex::new(VmRuntime {
                state: VmState::BUILDING,
                error: None,
                networks,
                kind,
            }),
        }
    }

    /// Current state without taking the runtime lock.
    pub fn state(&self) -> VmState {
        VmState::from_bits_truncate(self.state_mirror.load(Ordering::SeqCst))
    }

    /// Lock the runtime half for a transition or inspection.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, VmRuntime> {
        self.runtime.lock().await
    }

    /// Transition to `state` under the runtime lock, durably rewriting the
    /// instance `state` file before the transition becomes observable.
    pub fn write_state(&self, runtime: &mut VmRuntime, state: VmState) {
        runtime.state = state;
        if let Err(e) = std::fs::write(self.instance_path.join("state"), format!("{}\n", state)) {
            warn!(vm = %self.name, error = %e, "cannot persist state file");
        }
        self.state_mirror.store(state.bits(), Ordering::SeqCst);
        info!(vm = %self.name, id = self.id, %state, "vm state");
    }

    /// Record a failure: state ERROR plus the descriptive error string.
    pub fn write_error(&self, runtime: &mut VmRuntime, error: impl Into<String>) {
        let error = error.into();
        runtime.error = Some(error.clone());
        self.write_state(runtime, VmState::ERROR);
        warn!(vm = %self.name, id = self.id, %error, "vm error");
    }

    /// Signal teardown. Idempotent: later calls are no-ops.
    pub fn signal_kill(&self) {
        let _ = self.kill.lock().expect("kill lock").send(true);
    }

    /// Subscribe to the teardown signal (wait tasks).
    pub fn kill_signal(&self) -> watch::Receiver<bool> {
        self.kill.lock().expect("kill lock").subscribe()
    }

    /// Replace the consumed teardown signal ahead of a relaunch.
    pub fn rearm_kill(&self) {
        let (fresh, _) = watch::channel(false);
        *self.kill.lock().expect("kill lock") = fresh;
    }
}

/// Generate a random MAC in the locally-administered qemu range.
pub fn random_mac() -> String {
    let mut tail = [0u8; 3];
    if getrandom::fill(&mut tail).is_err() {
        tail = [0, 0, 1];
    }
    format!("52:54:00:{:02x}:{:02x}:{:02x}", tail[0], tail[1], tail[2])
}

/// Process-wide VM registry: exclusive owner of every VM.
#[derive(Default)]
pub struct VmRegistry {
    next_id: AtomicU32,
    vms: StdMutex<HashMap<u32, Arc<Vm>>>,
}

impl VmRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look a VM up by ID; `None` after flush/teardown, which is the exit
    /// condition for tasks holding the ID.
    pub fn get(&self, id: u32) -> Option<Arc<Vm>> {
        self.vms.lock().expect("vm registry lock").get(&id).cloned()
    }

    /// Look a VM up by name.
    pub fn find(&self, name: &str) -> Option<Arc<Vm>> {
        self.vms
            .lock()
            .expect("vm registry lock")
            .values()
            .find(|vm| vm.name == name)
            .cloned()
    }

    /// Snapshot of every VM, ordered by ID.
    pub fn list(&self) -> Vec<Arc<Vm>> {
        let mut vms: Vec<Arc<Vm>> = self
            .vms
            .lock()
            .expect("vm registry lock")
            .values()
            .cloned()
            .collect();
        vms.sort_by_key(|vm| vm.id);
        vms
    }

    /// Remove one VM (flush or teardown).
    pub fn remove(&self, id: u32) -> Option<Arc<Vm>> {
        self.vms.lock().expect("vm registry lock").remove(&id)
    }

    /// Validate naming and resource conflicts, reserve an ID, resolve MACs,
    /// and insert the new VM, all under the registry lock. The child spawn
    /// happens later, without the lock.
    pub fn prepare(
        &self,
        base: &Path,
        name: Option<String>,
        vm_type: VmType,
        config: &VmConfig,
    ) -> Result<Arc<Vm>> {
        let mut vms = self.vms.lock().expect("vm registry lock");

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let name = name.unwrap_or_else(|| format!("vm-{}", id));

        if vms.values().any(|vm| vm.name == name) {
            return Err(Error::Vm(format!("vm name {:?} already in use", name)));
        }

        let uuid = uuid::Uuid::new_v4().to_string();
        if vms.values().any(|vm| vm.uuid == uuid) {
            // v4 collision is effectively impossible; treat as fatal.
            return Err(Error::Vm("uuid collision".into()));
        }

        // Persistent (non-snapshot) disk and filesystem paths must be unique
        // across the alive fleet; snapshot-mode images alias freely.
        if !config.snapshot {
            let mut paths: Vec<&String> = config.disks.iter().collect();
            if vm_type == VmType::Container && !config.filesystem.is_empty() {
                paths.push(&config.filesystem);
            }
            for other in vms.values() {
                if !other.state().intersects(VmState::ALIVE) || other.config.snapshot {
                    continue;
                }
                for path in paths.iter().copied() {
                    if other.config.disks.contains(path) || other.config.filesystem == *path {
                        return Err(Error::Vm(format!(
                            "disk path {:?} already in use by {:?}",
                            path, other.name
                        )));
                    }
                }
            }
        }

        // Resolve MACs: configured ones must not collide; empty ones are
        // generated with random retry against the fleet and this VM itself.
        let mut fleet_macs: Vec<String> = Vec::new();
        for other in vms.values() {
            if other.state().intersects(VmState::ALIVE) {
                fleet_macs.extend(other.macs.lock().expect("macs lock").iter().cloned());
            }
        }

        let mut networks = Vec::new();
        let mut chosen: Vec<String> = Vec::new();
        for spec in &config.networks {
            let mac = if spec.mac.is_empty() {
                let mut mac = random_mac();
                let mut tries = 0;
                while fleet_macs.contains(&mac) || chosen.contains(&mac) {
                    mac = random_mac();
                    tries += 1;
                    if tries > 32 {
                        return Err(Error::Vm("cannot find a free mac".into()));
                    }
                }
                mac
            } else {
                if fleet_macs.contains(&spec.mac) || chosen.contains(&spec.mac) {
                    return Err(Error::Vm(format!("mac {} already in use", spec.mac)));
                }
                spec.mac.clone()
            };
            chosen.push(mac.clone());
            networks.push(Nic {
                bridge: spec.bridge.clone(),
                vlan: spec.vlan,
                mac,
                driver: spec.driver.clone(),
                ..Default::default()
            });
        }

        let instance_path = base.join(id.to_string());
        let kind = match vm_type {
            VmType::Kvm => VmKind::Kvm(kvm::KvmRuntime::default()),
            VmType::Container => VmKind::Container(container::ContainerRuntime::default()),
        };

        let vm = Arc::new(Vm::new(
            id,
            name,
            vm_type,
            uuid,
            instance_path,
            config.clone(),
            networks,
            kind,
        ));
        *vm.macs.lock().expect("macs lock") = chosen;

        vms.insert(id, vm.clone());
        Ok(vm)
    }

    /// Write the per-VM instance files created at launch.
    pub fn write_instance_files(&self, vm: &Vm) -> Result<()> {
        std::fs::create_dir_all(&vm.instance_path)?;
        std::fs::write(vm.instance_path.join("config"), vm.config.dump())?;
        std::fs::write(vm.instance_path.join("name"), format!("{}\n", vm.name))?;
        std::fs::write(vm.instance_path.join("uuid"), format!("{}\n", vm.uuid))?;
        std::fs::write(
            vm.instance_path.join("state"),
            format!("{}\n", VmState::BUILDING),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (VmRegistry, tempfile::TempDir) {
        (VmRegistry::new(), tempfile::tempdir().unwrap())
    }

    #[test]
    fn prepare_assigns_ids_and_names() {
        let (reg, dir) = registry();
        let config = VmConfig::default();
        let a = reg.prepare(dir.path(), None, VmType::Kvm, &config).unwrap();
        let b = reg
            .prepare(dir.path(), Some("named".into()), VmType::Kvm, &config)
            .unwrap();
        assert_eq!(a.id, 0);
        assert_eq!(a.name, "vm-0");
        assert_eq!(b.name, "named");
        assert_ne!(a.uuid, b.uuid);
    }

    #[test]
    fn duplicate_names_rejected() {
        let (reg, dir) = registry();
        let config = VmConfig::default();
        reg.prepare(dir.path(), Some("a".into()), VmType::Kvm, &config)
            .unwrap();
        assert!(reg
            .prepare(dir.path(), Some("a".into()), VmType::Kvm, &config)
            .is_err());
    }

    #[test]
    fn mac_conflicts_detected_across_alive_fleet() {
        let (reg, dir) = registry();
        let mut config = VmConfig::default();
        config
            .set("net", &["100,de:ad:be:ef:00:01".to_string()])
            .unwrap();

        reg.prepare(dir.path(), Some("a".into()), VmType::Kvm, &config)
            .unwrap();
        let err = reg
            .prepare(dir.path(), Some("b".into()), VmType::Kvm, &config)
            .unwrap_err();
        assert!(err.to_string().contains("already in use"));
    }

    #[test]
    fn generated_macs_avoid_fleet_and_self() {
        let (reg, dir) = registry();
        let mut config = VmConfig::default();
        config
            .set("net", &["100".to_string(), "200".to_string()])
            .unwrap();
        let vm = reg
            .prepare(dir.path(), Some("a".into()), VmType::Kvm, &config)
            .unwrap();
        let macs = vm.macs.lock().unwrap().clone();
        assert_eq!(macs.len(), 2);
        assert_ne!(macs[0], macs[1]);
        assert!(macs.iter().all(|m| m.starts_with("52:54:00:")));
    }

    #[test]
    fn nonsnapshot_disk_conflict_rejected() {
        let (reg, dir) = registry();
        let mut config = VmConfig::default();
        config.set("snapshot", &["false".to_string()]).unwrap();
        config.set("disk", &["/tmp/shared.img".to_string()]).unwrap();

        reg.prepare(dir.path(), Some("a".into()), VmType::Kvm, &config)
            .unwrap();
        assert!(reg
            .prepare(dir.path(), Some("b".into()), VmType::Kvm, &config)
            .is_err());

        // Snapshot mode may alias the same image freely.
        let mut aliasing = config.clone();
        aliasing.set("snapshot", &["true".to_string()]).unwrap();
        assert!(reg
            .prepare(dir.path(), Some("c".into()), VmType::Kvm, &aliasing)
            .is_ok());
    }

    #[tokio::test]
    async fn state_transitions_persist() {
        let (reg, dir) = registry();
        let vm = reg
            .prepare(dir.path(), Some("a".into()), VmType::Kvm, &VmConfig::default())
            .unwrap();
        reg.write_instance_files(&vm).unwrap();

        {
            let mut runtime = vm.lock().await;
            vm.write_state(&mut runtime, VmState::RUNNING);
        }
        assert_eq!(vm.state(), VmState::RUNNING);
        let on_disk = std::fs::read_to_string(vm.instance_path.join("state")).unwrap();
        assert_eq!(on_disk.trim(), "running");

        {
            let mut runtime = vm.lock().await;
            vm.write_error(&mut runtime, "spawn failed");
        }
        assert_eq!(vm.state(), VmState::ERROR);
        assert_eq!(
            std::fs::read_to_string(vm.instance_path.join("state"))
                .unwrap()
                .trim(),
            "error"
        );
    }

    #[test]
    fn state_display_and_parse() {
        assert_eq!(VmState::RUNNING.to_string(), "running");
        assert_eq!(
            (VmState::RUNNING | VmState::PAUSED).to_string(),
            "running|paused"
        );
        assert_eq!(VmState::parse("quit").unwrap(), VmState::QUIT);
        assert!(VmState::parse("bogus").is_err());
    }
}
