//! KVM variant: drives a hypervisor child process over its QMP monitor.
//!
//! Launch builds the hypervisor argv from the VM's config snapshot, applies
//! the configured pairwise string-rewrite overrides, spawns the child with
//! captured output, and opens the monitor socket. Start/Stop map to the
//! monitor's `cont`/`stop`; Kill asks the monitor to quit and escalates to
//! SIGKILL after a bounded wait.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::daemon::Daemon;
use crate::error::{Error, Result};
use crate::vm::qmp::Qmp;
use crate::vm::{Nic, Vm, VmKind, VmState};

/// Bounded wait between a monitor `quit` and SIGKILL.
const QUIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime payload of a KVM VM.
#[derive(Debug, Default)]
pub struct KvmRuntime {
    /// Hypervisor child pid.
    pub pid: Option<u32>,
    /// Monitor session, opened post-spawn.
    pub qmp: Option<Qmp>,
}

/// Build the hypervisor argv for one VM.
pub fn build_args(vm: &Vm, networks: &[Nic]) -> Vec<String> {
    let config = &vm.config;
    let instance = &vm.instance_path;
    let mut args: Vec<String> = Vec::new();

    let mut push = |parts: &[&str]| {
        args.extend(parts.iter().map(|s| s.to_string()));
    };

    // -S: launch frozen; `vm start` continues the guest over the monitor.
    push(&["-enable-kvm", "-S", "-name", &vm.name, "-uuid", &vm.uuid]);
    push(&["-m", &config.memory.to_string()]);
    push(&["-smp", &config.vcpus.to_string()]);
    push(&["-cpu", &config.cpu]);
    push(&["-nographic", "-vga", "none"]);
    push(&[
        "-qmp",
        &format!("unix:{},server,nowait", instance.join("qmp").display()),
    ]);

    if !config.kernel.is_empty() {
        push(&["-kernel", &config.kernel]);
        if !config.initrd.is_empty() {
            push(&["-initrd", &config.initrd]);
        }
        if !config.append.is_empty() {
            push(&["-append", &config.append]);
        }
    }

    if config.snapshot && !config.disks.is_empty() {
        push(&["-snapshot"]);
    }
    for disk in &config.disks {
        push(&["-drive", &format!("file={},media=disk", disk)]);
    }
    if !config.cdrom.is_empty() {
        push(&["-drive", &format!("file={},media=cdrom", config.cdrom)]);
    }

    for n in 0..config.serial_ports {
        push(&[
            "-serial",
            &format!(
                "unix:{},server,nowait",
                instance.join(format!("serial{}", n)).display()
            ),
        ]);
    }
    if config.virtio_ports > 0 {
        push(&["-device", "virtio-serial"]);
        for n in 0..config.virtio_ports {
            let path = instance.join(format!("virtio-serial{}", n));
            push(&[
                "-chardev",
                &format!("socket,id=charvio{},path={},server=on,wait=off", n, path.display()),
            ]);
            push(&[
                "-device",
                &format!("virtserialport,chardev=charvio{},name=serial{}", n, n),
            ]);
        }
    }

    for (n, nic) in networks.iter().enumerate() {
        push(&[
            "-netdev",
            &format!("tap,id=net{},ifname={},script=no,downscript=no", n, nic.tap),
        ]);
        push(&[
            "-device",
            &format!("{},netdev=net{},mac={}", nic.driver, n, nic.mac),
        ]);
    }

    if !config.migrate_path.is_empty() {
        push(&["-incoming", &format!("exec:cat {}", config.migrate_path)]);
    }

    args.extend(config.qemu_append.iter().cloned());
    args
}

/// Apply the ordered pairwise string-rewrite overrides.
///
/// Overrides operate on the argv rendered as one space-joined string, so a
/// single override can rewrite across argument boundaries.
pub fn apply_overrides(args: Vec<String>, overrides: &[(String, String)]) -> Vec<String> {
    if overrides.is_empty() {
        return args;
    }
    let mut joined = args.join(" ");
    for (from, to) in overrides {
        joined = joined.replace(from.as_str(), to.as_str());
    }
    joined.split_whitespace().map(str::to_string).collect()
}

/// Spawn the hypervisor and its wait task. The VM must be in BUILDING.
pub async fn launch(daemon: &Arc<Daemon>, id: u32) -> Result<()> {
    let Some(vm) = daemon.vms.get(id) else {
        return Err(Error::Vm(format!("no vm with id {}", id)));
    };

    // Taps first: the argv references their names.
    let networks = match setup_taps(daemon, &vm).await {
        Ok(networks) => networks,
        Err(e) => {
            let mut runtime = vm.lock().await;
            vm.write_error(&mut runtime, e.to_string());
            return Err(e);
        }
    };

    let args = apply_overrides(build_args(&vm, &networks), &vm.config.qemu_override);
    debug!(vm = %vm.name, ?args, "hypervisor argv");

    let spawn = spawn_hypervisor(&vm, &args);
    let mut child = match spawn {
        Ok(child) => child,
        Err(e) => {
            teardown_taps(daemon, &networks).await;
            let mut runtime = vm.lock().await;
            vm.write_error(&mut runtime, format!("hypervisor spawn: {}", e));
            return Err(e);
        }
    };

    let qmp = match Qmp::connect(&vm.instance_path.join("qmp")).await {
        Ok(qmp) => qmp,
        Err(e) => {
            let _ = child.kill().await;
            teardown_taps(daemon, &networks).await;
            let mut runtime = vm.lock().await;
            vm.write_error(&mut runtime, e.to_string());
            return Err(e);
        }
    };

    {
        let mut runtime = vm.lock().await;
        runtime.networks = networks;
        if let VmKind::Kvm(kvm) = &mut runtime.kind {
            kvm.pid = child.id();
            kvm.qmp = Some(qmp);
        }
    }
    info!(vm = %vm.name, id = vm.id, pid = ?child.id(), "hypervisor up");

    spawn_wait_task(daemon.clone(), id, child);
    spawn_snooper(daemon.clone(), id);
    Ok(())
}

fn spawn_hypervisor(vm: &Vm, args: &[String]) -> Result<Child> {
    let stdout = std::fs::File::create(vm.instance_path.join("qemu.stdout"))?;
    let stderr = std::fs::File::create(vm.instance_path.join("qemu.stderr"))?;
    Command::new(&vm.config.qemu_path)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .spawn()
        .map_err(|e| Error::Vm(format!("cannot spawn {}: {}", vm.config.qemu_path, e)))
}

async fn setup_taps(daemon: &Arc<Daemon>, vm: &Arc<Vm>) -> Result<Vec<Nic>> {
    let mut networks = vm.lock().await.networks.clone();
    let mut created: Vec<Nic> = Vec::new();

    for nic in &mut networks {
        nic.tap = daemon.network.next_tap_name();
        if let Err(e) = daemon.network.create_tap(&nic.bridge, &nic.tap, nic.vlan).await {
            teardown_taps(daemon, &created).await;
            return Err(e);
        }
        created.push(nic.clone());
    }

    let tap_lines: String = networks.iter().map(|n| format!("{}\n", n.tap)).collect();
    std::fs::write(vm.instance_path.join("taps"), tap_lines)?;
    Ok(networks)
}

pub(crate) async fn teardown_taps(daemon: &Arc<Daemon>, networks: &[Nic]) {
    for nic in networks {
        if nic.tap.is_empty() {
            continue;
        }
        if let Err(e) = daemon.network.destroy_tap(&nic.bridge, &nic.tap).await {
            warn!(tap = %nic.tap, error = %e, "tap teardown failed");
        }
    }
}

/// The per-VM wait task: owns the child, holds only the VM's ID, and exits
/// once the child is gone. Kill escalates monitor quit → SIGKILL.
fn spawn_wait_task(daemon: Arc<Daemon>, id: u32, mut child: Child) {
    tokio::spawn(async move {
        let Some(vm) = daemon.vms.get(id) else {
            let _ = child.kill().await;
            return;
        };
        let mut kill = vm.kill_signal();
        drop(vm);

        // A kill signalled before this task subscribed must not be lost.
        let exited = if *kill.borrow() {
            None
        } else {
            tokio::select! {
                status = child.wait() => Some(status),
                _ = kill.changed() => None,
            }
        };
        let status = match exited {
            Some(status) => status,
            None => {
                // Kill: ask the monitor to quit, escalate to SIGKILL. The
                // VM is re-looked up; flush may have raced us out.
                if let Some(vm) = daemon.vms.get(id) {
                    let mut runtime = vm.lock().await;
                    if let VmKind::Kvm(kvm) = &mut runtime.kind {
                        if let Some(qmp) = kvm.qmp.as_mut() {
                            let _ = tokio::time::timeout(QUIT_TIMEOUT, qmp.quit()).await;
                        }
                    }
                }
                match tokio::time::timeout(QUIT_TIMEOUT, child.wait()).await {
                    Ok(status) => status,
                    Err(_) => {
                        warn!(id, "hypervisor ignored quit, sending SIGKILL");
                        let _ = child.kill().await;
                        child.wait().await
                    }
                }
            }
        };

        let Some(vm) = daemon.vms.get(id) else { return };
        let killed = *vm.kill_signal().borrow();

        let networks = {
            let mut runtime = vm.lock().await;
            if let VmKind::Kvm(kvm) = &mut runtime.kind {
                kvm.qmp = None;
                kvm.pid = None;
            }
            match status {
                Ok(status) if status.success() || killed => {
                    vm.write_state(&mut runtime, VmState::QUIT);
                }
                Ok(status) => {
                    let stderr = std::fs::read_to_string(vm.instance_path.join("qemu.stderr"))
                        .unwrap_or_default();
                    vm.write_error(
                        &mut runtime,
                        format!("hypervisor exited {}: {}", status, stderr.trim()),
                    );
                }
                Err(e) => {
                    vm.write_error(&mut runtime, format!("wait failed: {}", e));
                }
            }
            std::mem::take(&mut runtime.networks)
        };

        teardown_taps(&daemon, &networks).await;
        info!(id, vm = %vm.name, "hypervisor down");
    });
}

/// Per-VM network snooper: copies neighbor-table entries matching the VM's
/// MACs onto its NICs. Exits when the VM leaves the registry or dies.
pub(crate) fn spawn_snooper(daemon: Arc<Daemon>, id: u32) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            let Some(vm) = daemon.vms.get(id) else { break };
            if !vm.state().intersects(VmState::ALIVE) {
                break;
            }
            let Ok(table) = crate::network::neighbor_addresses().await else {
                continue;
            };
            let mut runtime = vm.lock().await;
            for nic in &mut runtime.networks {
                if let Some((ip4, ip6)) = table.get(&nic.mac) {
                    if let Some(ip4) = ip4 {
                        nic.ip4 = ip4.clone();
                    }
                    if let Some(ip6) = ip6 {
                        nic.ip6 = ip6.clone();
                    }
                }
            }
        }
        debug!(id, "snooper exiting");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{VmConfig, VmRegistry, VmType};

    fn prepared_vm(config: VmConfig) -> (Arc<Vm>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let registry = VmRegistry::new();
        let vm = registry
            .prepare(dir.path(), Some("a".into()), VmType::Kvm, &config)
            .unwrap();
        (vm, dir)
    }

    #[test]
    fn args_reflect_config() {
        let mut config = VmConfig::default();
        config.set("memory", &["512".to_string()]).unwrap();
        config.set("disk", &["/tmp/x.img".to_string()]).unwrap();
        config.set("serial", &["2".to_string()]).unwrap();
        let (vm, _dir) = prepared_vm(config);

        let args = build_args(&vm, &[]);
        let joined = args.join(" ");
        assert!(joined.contains("-m 512"));
        assert!(joined.contains("file=/tmp/x.img,media=disk"));
        assert!(joined.contains("-snapshot"));
        assert_eq!(args.iter().filter(|a| a.as_str() == "-serial").count(), 2);
    }

    #[test]
    fn nic_args_carry_tap_and_mac() {
        let mut config = VmConfig::default();
        config
            .set("net", &["100,de:ad:be:ef:00:01".to_string()])
            .unwrap();
        let (vm, _dir) = prepared_vm(config);

        let networks = vec![Nic {
            bridge: "meshbox0".into(),
            vlan: 100,
            mac: "de:ad:be:ef:00:01".into(),
            driver: "e1000".into(),
            tap: "mega_tap0".into(),
            ..Default::default()
        }];
        let args = build_args(&vm, &networks);
        let joined = args.join(" ");
        assert!(joined.contains("ifname=mega_tap0"));
        assert!(joined.contains("mac=de:ad:be:ef:00:01"));
    }

    #[test]
    fn overrides_apply_in_order() {
        let args = vec!["-m".to_string(), "2048".to_string()];
        let overridden = apply_overrides(
            args,
            &[
                ("-m 2048".to_string(), "-m 4096".to_string()),
                ("4096".to_string(), "8192".to_string()),
            ],
        );
        assert_eq!(overridden, vec!["-m", "8192"]);
    }
}
