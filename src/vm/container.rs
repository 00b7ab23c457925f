//! Container variant: a namespaced process tree behind a cgroup freezer.
//!
//! Launch is a two-process protocol, because namespace setup must run
//! *after* clone but *before* exec of the user's init:
//!
//! 1. the parent creates six pipes (log, stdin, stdout, stderr, ready,
//!    unfreeze) and clones a child into fresh NET/IPC/NS/PID/UTS
//!    namespaces, re-execing this same binary with the `container-shim`
//!    sentinel;
//! 2. the shim performs all in-namespace setup (hostname, rootfs, pseudo
//!    filesystems, devices, cgroup join, chroot, capability drop), closes
//!    the ready pipe, and blocks reading the unfreeze pipe;
//! 3. the parent, on ready, freezes the cgroup and attaches networking
//!    through the child's netns — which is why network setup happens after
//!    launch, not before;
//! 4. `vm start` thaws the freezer and closes the unfreeze pipe; the shim
//!    execs init as pid 1.
//!
//! Spawning a shell instead of re-execing would not work: the setup has to
//! execute inside the new PID namespace.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::daemon::Daemon;
use crate::error::{Error, Result};
use crate::vm::{Vm, VmKind, VmState};

/// Bounded wait for the cgroup to empty after SIGKILL.
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Capabilities retained by container init (everything else is dropped and
/// removed from the bounding set).
pub const DEFAULT_CAPS: &[u32] = &[
    0,  // CAP_CHOWN
    1,  // CAP_DAC_OVERRIDE
    4,  // CAP_FSETID
    3,  // CAP_FOWNER
    27, // CAP_MKNOD
    13, // CAP_NET_RAW
    6,  // CAP_SETGID
    7,  // CAP_SETUID
    31, // CAP_SETFCAP
    8,  // CAP_SETPCAP
    10, // CAP_NET_BIND_SERVICE
    18, // CAP_SYS_CHROOT
    5,  // CAP_KILL
    29, // CAP_AUDIT_WRITE
];

/// Device nodes created in the container's /dev: (name, type, major, minor).
const DEVICE_NODES: &[(&str, char, u64, u64)] = &[
    ("null", 'c', 1, 3),
    ("zero", 'c', 1, 5),
    ("full", 'c', 1, 7),
    ("random", 'c', 1, 8),
    ("urandom", 'c', 1, 9),
    ("tty", 'c', 5, 0),
    ("console", 'c', 5, 1),
];

/// Cgroup directories for one container, one per controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cgroup {
    /// Freezer controller directory.
    pub freezer: PathBuf,
    /// Memory controller directory.
    pub memory: PathBuf,
    /// Devices controller directory.
    pub devices: PathBuf,
}

impl Cgroup {
    /// Controller paths under `root` for VM `id`.
    pub fn new(root: &std::path::Path, id: u32) -> Self {
        Self {
            freezer: root.join("freezer/meshbox").join(id.to_string()),
            memory: root.join("memory/meshbox").join(id.to_string()),
            devices: root.join("devices/meshbox").join(id.to_string()),
        }
    }

    /// Create all controller directories.
    pub fn create(&self) -> Result<()> {
        for dir in [&self.freezer, &self.memory, &self.devices] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Write `FROZEN` to the freezer.
    pub fn freeze(&self) -> Result<()> {
        std::fs::write(self.freezer.join("freezer.state"), "FROZEN\n")?;
        Ok(())
    }

    /// Write `THAWED` to the freezer.
    pub fn thaw(&self) -> Result<()> {
        std::fs::write(self.freezer.join("freezer.state"), "THAWED\n")?;
        Ok(())
    }

    /// Whether the freezer's task list is empty.
    pub fn tasks_empty(&self) -> bool {
        std::fs::read_to_string(self.freezer.join("tasks"))
            .map(|tasks| tasks.trim().is_empty())
            .unwrap_or(true)
    }

    /// Best-effort removal of the controller directories.
    pub fn remove(&self) {
        for dir in [&self.freezer, &self.memory, &self.devices] {
            if let Err(e) = std::fs::remove_dir(dir) {
                debug!(dir = %dir.display(), error = %e, "cgroup rmdir");
            }
        }
    }
}

/// Everything the shim needs, written as JSON into the instance directory
/// before clone and read back by the re-exec'd binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShimArgs {
    /// VM name, for log lines.
    pub name: String,
    /// Container hostname (defaults to the VM name).
    pub hostname: String,
    /// Configured root filesystem path.
    pub filesystem: String,
    /// Effective root after overlay/bind mounting.
    pub rootfs: PathBuf,
    /// Overlay upper/work dirs when snapshotting, prepared by the parent.
    pub overlay: Option<(PathBuf, PathBuf)>,
    /// Host UUID file, bind-mounted over product_uuid.
    pub uuid_file: PathBuf,
    /// Host-side FIFO files, bind-mounted under /dev/fifos.
    pub fifo_files: Vec<PathBuf>,
    /// Memory hard limit in MB.
    pub memory_mb: u64,
    /// Controller directories to join.
    pub cgroup: Cgroup,
    /// Hook executed inside the namespaces before capability drop.
    pub preinit: String,
    /// Init argv, exec'd as pid 1 on unfreeze.
    pub init: Vec<String>,
}

/// Runtime payload of a container VM.
#[derive(Debug, Default)]
pub struct ContainerRuntime {
    /// Shim (then init) pid in the host namespace.
    pub pid: Option<i32>,
    /// Network namespace link name under /var/run/netns.
    pub netns: String,
    /// Overlay mountpoint to unmount on QUIT.
    pub overlay: Option<PathBuf>,
    /// Cgroup directories.
    pub cgroup: Option<Cgroup>,
    /// Parent side of the ready/unfreeze sync pipes.
    pub sync: Option<SyncPipes>,
}

/// Parent-side ends of the two one-shot sync pipes.
#[derive(Debug)]
pub struct SyncPipes {
    /// Closed by the shim when it is ready to be frozen.
    pub ready: Option<std::os::fd::OwnedFd>,
    /// Closed by the parent to tell the shim to exec init.
    pub unfreeze: Option<std::os::fd::OwnedFd>,
}

/// The netns link name for a VM.
pub fn netns_name(id: u32) -> String {
    format!("meshbox_{}", id)
}

#[cfg(target_os = "linux")]
pub use linux::{launch, shim_main};

#[cfg(not(target_os = "linux"))]
/// Containers require Linux namespaces.
pub async fn launch(_daemon: &Arc<Daemon>, _id: u32) -> Result<()> {
    Err(Error::Vm("containers require linux".into()))
}

/// Thaw a launched container so the shim execs init; later calls only touch
/// the freezer.
pub async fn start(vm: &Vm, runtime: &mut crate::vm::VmRuntime) -> Result<()> {
    let VmKind::Container(container) = &mut runtime.kind else {
        return Err(Error::Vm(format!("{} is not a container", vm.name)));
    };
    let cgroup = container
        .cgroup
        .as_ref()
        .ok_or_else(|| Error::Vm(format!("{} has no cgroup", vm.name)))?;
    cgroup.thaw()?;
    if let Some(sync) = container.sync.as_mut() {
        // First start: closing the unfreeze pipe releases the shim's read
        // and it execs init.
        sync.unfreeze.take();
    }
    Ok(())
}

/// Freeze a running container.
pub async fn stop(vm: &Vm, runtime: &mut crate::vm::VmRuntime) -> Result<()> {
    let VmKind::Container(container) = &runtime.kind else {
        return Err(Error::Vm(format!("{} is not a container", vm.name)));
    };
    container
        .cgroup
        .as_ref()
        .ok_or_else(|| Error::Vm(format!("{} has no cgroup", vm.name)))?
        .freeze()?;
    Ok(())
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;

    use std::ffi::CString;
    use std::os::fd::{AsRawFd, OwnedFd};

    use nix::mount::{mount, umount2, MntFlags, MsFlags};
    use nix::sys::signal::{kill as send_signal, Signal};
    use nix::sys::stat::{makedev, mknod, Mode, SFlag};
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    use nix::unistd::{chdir, chroot, mkfifo, pipe, sethostname, Pid};

    /// Shim-side fixed fd numbers, established by dup2 before re-exec.
    const FD_LOG: i32 = 3;
    const FD_READY: i32 = 4;
    const FD_UNFREEZE: i32 = 5;

    struct ClonePipes {
        // (parent end, child end) per pipe; stdio child ends land on 0/1/2.
        stdin: (OwnedFd, OwnedFd),
        stdout: (OwnedFd, OwnedFd),
        stderr: (OwnedFd, OwnedFd),
        log: (OwnedFd, OwnedFd),
        ready: (OwnedFd, OwnedFd),
        unfreeze: (OwnedFd, OwnedFd),
    }

    fn make_pipes() -> Result<ClonePipes> {
        // Direction per pipe: (read end, write end) = pipe().
        let (stdin_r, stdin_w) = pipe()?;
        let (stdout_r, stdout_w) = pipe()?;
        let (stderr_r, stderr_w) = pipe()?;
        let (log_r, log_w) = pipe()?;
        let (ready_r, ready_w) = pipe()?;
        let (unfreeze_r, unfreeze_w) = pipe()?;
        Ok(ClonePipes {
            stdin: (stdin_w, stdin_r),
            stdout: (stdout_r, stdout_w),
            stderr: (stderr_r, stderr_w),
            log: (log_r, log_w),
            ready: (ready_r, ready_w),
            unfreeze: (unfreeze_w, unfreeze_r),
        })
    }

    /// Clone the shim into fresh namespaces and re-exec this binary.
    fn clone_shim(vm: &Vm, pipes: &ClonePipes) -> Result<Pid> {
        let exe = CString::new("/proc/self/exe").expect("static path");
        let argv0 = CString::new("meshbox").expect("static arg");
        let sentinel = CString::new("container-shim").expect("static arg");
        let instance = CString::new(vm.instance_path.to_string_lossy().as_bytes())
            .map_err(|_| Error::Vm("instance path contains NUL".into()))?;

        let stdin_fd = pipes.stdin.1.as_raw_fd();
        let stdout_fd = pipes.stdout.1.as_raw_fd();
        let stderr_fd = pipes.stderr.1.as_raw_fd();
        let log_fd = pipes.log.1.as_raw_fd();
        let ready_fd = pipes.ready.1.as_raw_fd();
        let unfreeze_fd = pipes.unfreeze.1.as_raw_fd();

        let mut stack = vec![0u8; 1024 * 1024];
        let cb = Box::new(move || -> isize {
            // Child context: only async-signal-safe calls until exec.
            unsafe {
                libc::dup2(stdin_fd, 0);
                libc::dup2(stdout_fd, 1);
                libc::dup2(stderr_fd, 2);
                libc::dup2(log_fd, FD_LOG);
                libc::dup2(ready_fd, FD_READY);
                libc::dup2(unfreeze_fd, FD_UNFREEZE);
                libc::execv(
                    exe.as_ptr(),
                    [
                        argv0.as_ptr(),
                        sentinel.as_ptr(),
                        instance.as_ptr(),
                        std::ptr::null(),
                    ]
                    .as_ptr(),
                );
            }
            // exec failed; the parent sees the pipes close.
            127
        });

        let flags = nix::sched::CloneFlags::CLONE_NEWNET
            | nix::sched::CloneFlags::CLONE_NEWIPC
            | nix::sched::CloneFlags::CLONE_NEWNS
            | nix::sched::CloneFlags::CLONE_NEWPID
            | nix::sched::CloneFlags::CLONE_NEWUTS;

        // SAFETY: the callback only dup2s inherited fds and execs.
        let pid = unsafe { nix::sched::clone(cb, &mut stack, flags, Some(libc::SIGCHLD)) }?;
        Ok(pid)
    }

    /// Full container launch: pipes, clone, freeze-at-ready, network attach.
    pub async fn launch(daemon: &Arc<Daemon>, id: u32) -> Result<()> {
        let Some(vm) = daemon.vms.get(id) else {
            return Err(Error::Vm(format!("no vm with id {}", id)));
        };
        if vm.config.filesystem.is_empty() {
            let mut runtime = vm.lock().await;
            vm.write_error(&mut runtime, "no filesystem configured");
            return Err(Error::Vm("no filesystem configured".into()));
        }

        match launch_inner(daemon, &vm).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let mut runtime = vm.lock().await;
                vm.write_error(&mut runtime, e.to_string());
                Err(e)
            }
        }
    }

    async fn launch_inner(daemon: &Arc<Daemon>, vm: &Arc<Vm>) -> Result<()> {
        let instance = &vm.instance_path;

        // Host-side FIFOs, bind-mounted into the guest by the shim.
        let mut fifo_files = Vec::new();
        for n in 0..vm.config.fifos {
            let path = instance.join(format!("fifo{}", n));
            if !path.exists() {
                mkfifo(&path, Mode::from_bits_truncate(0o600))?;
            }
            fifo_files.push(path);
        }

        let cgroup = Cgroup::new(&daemon.config.cgroup_root, vm.id);
        cgroup.create()?;

        // Overlay scaffolding when snapshotting; the shim performs the
        // mounts inside its own mount namespace.
        let (rootfs, overlay) = if vm.config.snapshot {
            let upper = instance.join("upper");
            let work = instance.join("work");
            let merged = instance.join("rootfs");
            for dir in [&upper, &work, &merged] {
                std::fs::create_dir_all(dir)?;
            }
            (merged, Some((upper, work)))
        } else {
            (PathBuf::from(&vm.config.filesystem), None)
        };

        let shim_args = ShimArgs {
            name: vm.name.clone(),
            hostname: if vm.config.hostname.is_empty() {
                vm.name.clone()
            } else {
                vm.config.hostname.clone()
            },
            filesystem: vm.config.filesystem.clone(),
            rootfs: rootfs.clone(),
            overlay,
            uuid_file: instance.join("uuid"),
            fifo_files,
            memory_mb: vm.config.memory,
            cgroup: cgroup.clone(),
            preinit: vm.config.preinit.clone(),
            init: vm.config.init.clone(),
        };
        std::fs::write(
            instance.join("shim_args"),
            serde_json::to_vec_pretty(&shim_args)?,
        )?;

        let pipes = make_pipes()?;
        let pid = clone_shim(vm, &pipes)?;
        info!(vm = %vm.name, id = vm.id, pid = pid.as_raw(), "shim cloned");

        // Parent keeps only its ends; the child's copies close here.
        let ClonePipes {
            stdin: (stdin_w, stdin_child),
            stdout: (stdout_r, stdout_child),
            stderr: (stderr_r, stderr_child),
            log: (log_r, log_child),
            ready: (ready_r, ready_child),
            unfreeze: (unfreeze_w, unfreeze_child),
        } = pipes;
        drop((stdin_child, stdout_child, stderr_child, log_child, ready_child, unfreeze_child));

        spawn_log_task(instance.join("container.log"), log_r);

        // The shim closes its ready end when it is about to block on the
        // unfreeze pipe; EOF here is the "freeze me" signal.
        let ready_ok = tokio::task::spawn_blocking(move || {
            let fd = ready_r.as_raw_fd();
            let mut buf = [0u8; 1];
            loop {
                let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), 1) };
                match n {
                    0 => return true,
                    n if n > 0 => continue,
                    _ if std::io::Error::last_os_error().kind()
                        == std::io::ErrorKind::Interrupted =>
                    {
                        continue
                    }
                    _ => return false,
                }
            }
        })
        .await
        .unwrap_or(false);

        if !ready_ok || matches!(waitpid(pid, Some(WaitPidFlag::WNOHANG)), Ok(WaitStatus::Exited(..))) {
            let log = std::fs::read_to_string(instance.join("container.log")).unwrap_or_default();
            let _ = send_signal(pid, Signal::SIGKILL);
            let _ = waitpid(pid, None);
            return Err(Error::ContainerSetup {
                step: "shim",
                message: log.lines().last().unwrap_or("shim died before ready").to_string(),
            });
        }

        cgroup.freeze()?;

        // Network attach happens against the frozen child's namespace.
        let netns = netns_name(vm.id);
        if let Err(e) = link_netns(pid, &netns) {
            return teardown_partial(vm, pid, &rootfs, e).await;
        }
        let networks = {
            let mut networks = vm.lock().await.networks.clone();
            for (n, nic) in networks.iter_mut().enumerate() {
                nic.tap = daemon.network.next_tap_name();
                let guest_dev = format!("veth{}", n);
                if let Err(e) = daemon
                    .network
                    .create_veth(&nic.bridge, &nic.tap, nic.vlan, &netns, &guest_dev)
                    .await
                {
                    unlink_netns(&netns);
                    return teardown_partial(vm, pid, &rootfs, e).await;
                }
            }
            networks
        };
        let tap_lines: String = networks.iter().map(|n| format!("{}\n", n.tap)).collect();
        std::fs::write(instance.join("taps"), tap_lines)?;

        {
            let mut runtime = vm.lock().await;
            runtime.networks = networks;
            if let VmKind::Container(container) = &mut runtime.kind {
                container.pid = Some(pid.as_raw());
                container.netns = netns;
                container.overlay = vm.config.snapshot.then(|| rootfs.clone());
                container.cgroup = Some(cgroup);
                container.sync = Some(SyncPipes {
                    ready: None,
                    unfreeze: Some(unfreeze_w),
                });
            }
        }

        spawn_console_task(daemon.clone(), vm.id, stdin_w, stdout_r, stderr_r);
        spawn_wait_task(daemon.clone(), vm.id, pid);
        crate::vm::kvm::spawn_snooper(daemon.clone(), vm.id);
        Ok(())
    }

    /// Kill the shim and unwind a partially-launched container.
    async fn teardown_partial(
        vm: &Arc<Vm>,
        pid: Pid,
        rootfs: &std::path::Path,
        cause: Error,
    ) -> Result<()> {
        warn!(vm = %vm.name, error = %cause, "network attach failed, tearing down");
        let _ = send_signal(pid, Signal::SIGKILL);
        let _ = waitpid(pid, None);
        if vm.config.snapshot {
            let _ = umount2(rootfs, MntFlags::MNT_DETACH);
        }
        Err(cause)
    }

    fn link_netns(pid: Pid, netns: &str) -> Result<()> {
        let dir = std::path::Path::new("/var/run/netns");
        std::fs::create_dir_all(dir)?;
        let link = dir.join(netns);
        let target = format!("/proc/{}/ns/net", pid.as_raw());
        if link.exists() {
            std::fs::remove_file(&link)?;
        }
        std::os::unix::fs::symlink(target, &link)?;
        Ok(())
    }

    pub(super) fn unlink_netns(netns: &str) {
        let link = std::path::Path::new("/var/run/netns").join(netns);
        if let Err(e) = std::fs::remove_file(&link) {
            debug!(netns, error = %e, "netns unlink");
        }
    }

    /// Drain the shim's log pipe into the instance log file.
    fn spawn_log_task(path: PathBuf, log_r: OwnedFd) {
        tokio::task::spawn_blocking(move || {
            use std::io::Write;
            let Ok(mut file) = std::fs::File::create(&path) else { return };
            let fd = log_r.as_raw_fd();
            let mut buf = [0u8; 4096];
            loop {
                let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
                if n > 0 {
                    let _ = file.write_all(&buf[..n as usize]);
                } else if n < 0
                    && std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted
                {
                    continue;
                } else {
                    break;
                }
            }
        });
    }

    /// Serve the instance `console` socket: one client at a time, bytes
    /// shuttled between the socket and the container's stdio pipes.
    fn spawn_console_task(
        daemon: Arc<Daemon>,
        id: u32,
        stdin_w: OwnedFd,
        stdout_r: OwnedFd,
        stderr_r: OwnedFd,
    ) {
        tokio::spawn(async move {
            let Some(vm) = daemon.vms.get(id) else { return };
            let path = vm.instance_path.join("console");
            let mut kill = vm.kill_signal();
            drop(vm);

            let _ = std::fs::remove_file(&path);
            let Ok(listener) = tokio::net::UnixListener::bind(&path) else {
                warn!(id, "cannot bind console socket");
                return;
            };

            let Ok(mut stdin_tx) = fd_sender(stdin_w) else { return };
            let Ok(mut stdout_rx) = fd_receiver(stdout_r) else { return };
            let Ok(mut stderr_rx) = fd_receiver(stderr_r) else { return };

            loop {
                let client = tokio::select! {
                    accepted = listener.accept() => accepted,
                    _ = kill.changed() => break,
                };
                let Ok((stream, _)) = client else { break };
                let (mut client_r, mut client_w) = stream.into_split();

                // stdout and stderr interleave onto the client; stdin flows
                // back. One client at a time.
                let guest_to_client = async {
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    enum Side {
                        Out(usize),
                        Err(usize),
                        Closed,
                    }
                    let mut out_buf = [0u8; 4096];
                    let mut err_buf = [0u8; 4096];
                    loop {
                        let side = tokio::select! {
                            n = stdout_rx.read(&mut out_buf) => {
                                n.map(Side::Out).unwrap_or(Side::Closed)
                            }
                            n = stderr_rx.read(&mut err_buf) => {
                                n.map(Side::Err).unwrap_or(Side::Closed)
                            }
                        };
                        let (buf, n) = match side {
                            Side::Out(n) => (&out_buf, n),
                            Side::Err(n) => (&err_buf, n),
                            Side::Closed => break,
                        };
                        if n == 0 || client_w.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                };

                tokio::select! {
                    _ = guest_to_client => {}
                    _ = tokio::io::copy(&mut client_r, &mut stdin_tx) => {}
                    _ = kill.changed() => break,
                }
            }
            debug!(id, "console task exiting");
        });
    }

    fn fd_sender(fd: OwnedFd) -> Result<tokio::net::unix::pipe::Sender> {
        tokio::net::unix::pipe::Sender::from_owned_fd(fd).map_err(Error::Io)
    }

    fn fd_receiver(fd: OwnedFd) -> Result<tokio::net::unix::pipe::Receiver> {
        tokio::net::unix::pipe::Receiver::from_owned_fd(fd).map_err(Error::Io)
    }

    /// The per-VM wait task. Kill closes the parent pipe ends, SIGKILLs the
    /// shim, and polls the cgroup task list with a bounded timeout.
    fn spawn_wait_task(daemon: Arc<Daemon>, id: u32, pid: Pid) {
        tokio::spawn(async move {
            let Some(vm) = daemon.vms.get(id) else { return };
            let mut kill = vm.kill_signal();
            drop(vm);

            let mut reap = tokio::task::spawn_blocking(move || waitpid(pid, None));

            // A kill signalled before this task subscribed must not be lost.
            let first = if *kill.borrow() {
                None
            } else {
                tokio::select! {
                    status = &mut reap => Some(status),
                    _ = kill.changed() => None,
                }
            };
            let (status, killed) = match first {
                Some(status) => (status.ok().and_then(|s| s.ok()), false),
                None => {
                    if let Some(vm) = daemon.vms.get(id) {
                        let mut runtime = vm.lock().await;
                        if let VmKind::Container(container) = &mut runtime.kind {
                            // Closing the control pipes unblocks anything
                            // still reading them.
                            container.sync.take();
                        }
                        // A frozen cgroup never delivers SIGKILL; thaw first.
                        if let VmKind::Container(container) = &runtime.kind {
                            if let Some(cgroup) = &container.cgroup {
                                let _ = cgroup.thaw();
                            }
                        }
                    }
                    let _ = send_signal(pid, Signal::SIGKILL);

                    let deadline = tokio::time::Instant::now() + KILL_TIMEOUT;
                    let mut emptied = false;
                    while tokio::time::Instant::now() < deadline {
                        if cgroup_empty(&daemon, id).await {
                            emptied = true;
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    if !emptied {
                        warn!(id, "container kill timeout");
                    }
                    (reap.await.ok().and_then(|s| s.ok()), true)
                }
            };

            let Some(vm) = daemon.vms.get(id) else { return };
            let networks = {
                let mut runtime = vm.lock().await;
                let clean_exit = matches!(status, Some(WaitStatus::Exited(_, 0)));
                if clean_exit || killed {
                    vm.write_state(&mut runtime, VmState::QUIT);
                } else {
                    let log = std::fs::read_to_string(vm.instance_path.join("container.log"))
                        .unwrap_or_default();
                    vm.write_error(
                        &mut runtime,
                        format!(
                            "container exited: {}",
                            log.lines().last().unwrap_or("unknown failure")
                        ),
                    );
                }

                // Overlay unmount and netns cleanup belong to the QUIT
                // transition.
                if let VmKind::Container(container) = &mut runtime.kind {
                    container.pid = None;
                    container.sync = None;
                    if let Some(overlay) = container.overlay.take() {
                        let _ = umount2(&overlay, MntFlags::MNT_DETACH);
                    }
                    if !container.netns.is_empty() {
                        unlink_netns(&container.netns);
                    }
                }
                std::mem::take(&mut runtime.networks)
            };

            crate::vm::kvm::teardown_taps(&daemon, &networks).await;
            info!(id, vm = %vm.name, "container down");
        });
    }

    async fn cgroup_empty(daemon: &Arc<Daemon>, id: u32) -> bool {
        let Some(vm) = daemon.vms.get(id) else { return true };
        let runtime = vm.lock().await;
        match &runtime.kind {
            VmKind::Container(container) => container
                .cgroup
                .as_ref()
                .map(Cgroup::tasks_empty)
                .unwrap_or(true),
            _ => true,
        }
    }

    // -- shim side ---------------------------------------------------------

    /// Entry point of the re-exec'd binary inside the new namespaces.
    ///
    /// Performs the full setup sequence, reporting the first failing step on
    /// the log pipe, then synchronizes with the parent and execs init.
    pub fn shim_main(instance_path: &str) -> ! {
        let result = shim_setup(instance_path);
        match result {
            Ok(init) => {
                // Ready: close the ready pipe, then block until the parent
                // closes the unfreeze pipe.
                unsafe { libc::close(FD_READY) };
                let mut buf = [0u8; 1];
                loop {
                    let n = unsafe { libc::read(FD_UNFREEZE, buf.as_mut_ptr().cast(), 1) };
                    if n <= 0 {
                        break;
                    }
                }
                let argv: Vec<CString> = init
                    .iter()
                    .filter_map(|a| CString::new(a.as_str()).ok())
                    .collect();
                if let Some(program) = argv.first() {
                    let _ = nix::unistd::execv(program, &argv);
                }
                shim_log("exec init failed");
                std::process::exit(127);
            }
            Err(e) => {
                shim_log(&e.to_string());
                std::process::exit(1);
            }
        }
    }

    fn shim_log(message: &str) {
        let line = format!("{}\n", message);
        unsafe {
            libc::write(FD_LOG, line.as_ptr().cast(), line.len());
        }
    }

    fn shim_setup(instance_path: &str) -> Result<Vec<String>> {
        let step = |name: &'static str, e: String| Error::ContainerSetup {
            step: name,
            message: e,
        };

        let args: ShimArgs = serde_json::from_slice(
            &std::fs::read(std::path::Path::new(instance_path).join("shim_args"))
                .map_err(|e| step("args", e.to_string()))?,
        )
        .map_err(|e| step("args", e.to_string()))?;

        sethostname(&args.hostname).map_err(|e| step("hostname", e.to_string()))?;

        // Stop mount events from leaking back to the host.
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&str>,
        )
        .map_err(|e| step("mount-private", e.to_string()))?;

        mount_rootfs(&args).map_err(|e| step("rootfs", e.to_string()))?;
        mount_pseudo_filesystems(&args.rootfs).map_err(|e| step("pseudofs", e.to_string()))?;
        populate_dev(&args.rootfs).map_err(|e| step("devices", e.to_string()))?;
        bind_uuid(&args).map_err(|e| step("uuid", e.to_string()))?;
        bind_fifos(&args).map_err(|e| step("fifos", e.to_string()))?;
        mask_proc(&args.rootfs).map_err(|e| step("proc-mask", e.to_string()))?;
        join_cgroup(&args).map_err(|e| step("cgroup", e.to_string()))?;

        if !args.preinit.is_empty() {
            let status = std::process::Command::new(&args.preinit)
                .status()
                .map_err(|e| step("preinit", e.to_string()))?;
            if !status.success() {
                return Err(step("preinit", format!("exited {}", status)));
            }
        }

        chroot(&args.rootfs).map_err(|e| step("chroot", e.to_string()))?;
        chdir("/").map_err(|e| step("chroot", e.to_string()))?;
        drop_capabilities().map_err(|e| step("caps", e.to_string()))?;

        Ok(args.init)
    }

    fn mount_rootfs(args: &ShimArgs) -> std::result::Result<(), String> {
        match &args.overlay {
            Some((upper, work)) => {
                let options = format!(
                    "lowerdir={},upperdir={},workdir={}",
                    args.filesystem,
                    upper.display(),
                    work.display()
                );
                mount(
                    Some("overlay"),
                    &args.rootfs,
                    Some("overlay"),
                    MsFlags::empty(),
                    Some(options.as_str()),
                )
                .map_err(|e| e.to_string())
            }
            None => mount(
                Some(&args.rootfs),
                &args.rootfs,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
            .map_err(|e| e.to_string()),
        }
    }

    fn mount_pseudo_filesystems(rootfs: &std::path::Path) -> std::result::Result<(), String> {
        let mounts: &[(&str, &str, &str, MsFlags, Option<&str>)] = &[
            ("proc", "proc", "proc", MsFlags::empty(), None),
            ("sysfs", "sys", "sysfs", MsFlags::empty(), None),
            ("tmpfs", "dev", "tmpfs", MsFlags::MS_NOSUID, Some("mode=755")),
            ("devpts", "dev/pts", "devpts", MsFlags::empty(), Some("newinstance,ptmxmode=0666")),
        ];
        for (source, target, fstype, flags, data) in mounts {
            let target = rootfs.join(target);
            std::fs::create_dir_all(&target).map_err(|e| e.to_string())?;
            mount(Some(*source), &target, Some(*fstype), *flags, *data)
                .map_err(|e| format!("{}: {}", fstype, e))?;
        }
        Ok(())
    }

    fn populate_dev(rootfs: &std::path::Path) -> std::result::Result<(), String> {
        for (name, _kind, major, minor) in DEVICE_NODES {
            let path = rootfs.join("dev").join(name);
            mknod(
                &path,
                SFlag::S_IFCHR,
                Mode::from_bits_truncate(0o666),
                makedev(*major, *minor),
            )
            .map_err(|e| format!("{}: {}", name, e))?;
        }
        std::os::unix::fs::symlink("pts/ptmx", rootfs.join("dev/ptmx"))
            .map_err(|e| e.to_string())?;
        for link in [("fd", "/proc/self/fd"), ("stdin", "/proc/self/fd/0"),
                     ("stdout", "/proc/self/fd/1"), ("stderr", "/proc/self/fd/2")] {
            std::os::unix::fs::symlink(link.1, rootfs.join("dev").join(link.0))
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    fn bind_uuid(args: &ShimArgs) -> std::result::Result<(), String> {
        let target = args
            .rootfs
            .join("sys/devices/virtual/dmi/id/product_uuid");
        if !target.exists() {
            // Not all kernels expose DMI under sysfs; skip quietly.
            return Ok(());
        }
        mount(
            Some(&args.uuid_file),
            &target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| e.to_string())
    }

    fn bind_fifos(args: &ShimArgs) -> std::result::Result<(), String> {
        if args.fifo_files.is_empty() {
            return Ok(());
        }
        let dir = args.rootfs.join("dev/fifos");
        std::fs::create_dir_all(&dir).map_err(|e| e.to_string())?;
        for (n, host_fifo) in args.fifo_files.iter().enumerate() {
            let target = dir.join(format!("fifo{}", n));
            std::fs::File::create(&target).map_err(|e| e.to_string())?;
            mount(
                Some(host_fifo),
                &target,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
            .map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    fn mask_proc(rootfs: &std::path::Path) -> std::result::Result<(), String> {
        // kcore leaks physical memory; hide it behind /dev/null.
        let kcore = rootfs.join("proc/kcore");
        if kcore.exists() {
            mount(
                Some(&rootfs.join("dev/null")),
                &kcore,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
            .map_err(|e| e.to_string())?;
        }

        for sub in ["proc/sys", "proc/irq", "proc/bus", "proc/sysrq-trigger"] {
            let target = rootfs.join(sub);
            if !target.exists() {
                continue;
            }
            mount(
                Some(&target),
                &target,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
            .map_err(|e| e.to_string())?;
            mount(
                None::<&str>,
                &target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    fn join_cgroup(args: &ShimArgs) -> std::result::Result<(), String> {
        let pid = std::process::id().to_string();

        // Deny all devices, then allow the enumerated set.
        std::fs::write(args.cgroup.devices.join("devices.deny"), "a\n")
            .map_err(|e| e.to_string())?;
        for (_name, kind, major, minor) in DEVICE_NODES {
            let rule = format!("{} {}:{} rwm\n", kind, major, minor);
            std::fs::write(args.cgroup.devices.join("devices.allow"), rule)
                .map_err(|e| e.to_string())?;
        }
        // devpts ptmx and pts slaves.
        std::fs::write(args.cgroup.devices.join("devices.allow"), "c 136:* rwm\n")
            .map_err(|e| e.to_string())?;
        std::fs::write(args.cgroup.devices.join("devices.allow"), "c 5:2 rwm\n")
            .map_err(|e| e.to_string())?;

        std::fs::write(
            args.cgroup.memory.join("memory.limit_in_bytes"),
            format!("{}\n", args.memory_mb * 1024 * 1024),
        )
        .map_err(|e| e.to_string())?;

        for dir in [&args.cgroup.freezer, &args.cgroup.memory, &args.cgroup.devices] {
            std::fs::write(dir.join("tasks"), &pid).map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    /// Drop the bounding set to `DEFAULT_CAPS` and install that set as the
    /// permitted/effective/inheritable capabilities.
    fn drop_capabilities() -> std::result::Result<(), String> {
        let keep: u64 = DEFAULT_CAPS.iter().fold(0, |mask, cap| mask | 1 << cap);

        let last_cap = std::fs::read_to_string("/proc/sys/kernel/cap_last_cap")
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .unwrap_or(40);
        for cap in 0..=last_cap {
            if keep & (1 << cap) != 0 {
                continue;
            }
            let rc = unsafe {
                libc::prctl(
                    libc::PR_CAPBSET_DROP,
                    cap as libc::c_ulong,
                    0 as libc::c_ulong,
                    0 as libc::c_ulong,
                    0 as libc::c_ulong,
                )
            };
            if rc != 0 {
                return Err(format!("bounding drop cap {}", cap));
            }
        }

        #[repr(C)]
        struct CapHeader {
            version: u32,
            pid: i32,
        }
        #[repr(C)]
        struct CapData {
            effective: u32,
            permitted: u32,
            inheritable: u32,
        }

        // _LINUX_CAPABILITY_VERSION_3: 64-bit caps as two 32-bit halves.
        let header = CapHeader {
            version: 0x2008_0522,
            pid: 0,
        };
        let data = [
            CapData {
                effective: keep as u32,
                permitted: keep as u32,
                inheritable: keep as u32,
            },
            CapData {
                effective: (keep >> 32) as u32,
                permitted: (keep >> 32) as u32,
                inheritable: (keep >> 32) as u32,
            },
        ];
        let rc = unsafe { libc::syscall(libc::SYS_capset, &header, data.as_ptr()) };
        if rc != 0 {
            return Err("capset failed".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cgroup_paths_per_controller() {
        let cgroup = Cgroup::new(std::path::Path::new("/sys/fs/cgroup"), 3);
        assert_eq!(
            cgroup.freezer,
            PathBuf::from("/sys/fs/cgroup/freezer/meshbox/3")
        );
        assert_eq!(
            cgroup.memory,
            PathBuf::from("/sys/fs/cgroup/memory/meshbox/3")
        );
    }

    #[test]
    fn freezer_round_trip_in_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let cgroup = Cgroup::new(dir.path(), 0);
        cgroup.create().unwrap();

        cgroup.freeze().unwrap();
        assert_eq!(
            std::fs::read_to_string(cgroup.freezer.join("freezer.state"))
                .unwrap()
                .trim(),
            "FROZEN"
        );
        cgroup.thaw().unwrap();
        assert_eq!(
            std::fs::read_to_string(cgroup.freezer.join("freezer.state"))
                .unwrap()
                .trim(),
            "THAWED"
        );

        // No tasks file yet: treated as empty.
        assert!(cgroup.tasks_empty());
        std::fs::write(cgroup.freezer.join("tasks"), "1234\n").unwrap();
        assert!(!cgroup.tasks_empty());
    }

    #[test]
    fn netns_names_are_per_id() {
        assert_eq!(netns_name(7), "meshbox_7");
    }

    #[test]
    fn shim_args_round_trip() {
        let args = ShimArgs {
            name: "c0".into(),
            hostname: "c0".into(),
            filesystem: "/images/base".into(),
            rootfs: "/tmp/meshbox/0/rootfs".into(),
            overlay: Some(("/tmp/u".into(), "/tmp/w".into())),
            uuid_file: "/tmp/meshbox/0/uuid".into(),
            fifo_files: vec!["/tmp/meshbox/0/fifo0".into()],
            memory_mb: 512,
            cgroup: Cgroup::new(std::path::Path::new("/sys/fs/cgroup"), 0),
            preinit: String::new(),
            init: vec!["/init".into()],
        };
        let json = serde_json::to_string(&args).unwrap();
        let back: ShimArgs = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "c0");
        assert_eq!(back.init, vec!["/init"]);
        assert!(back.overlay.is_some());
    }

    #[test]
    fn default_caps_is_the_documented_set() {
        // CAP_SYS_ADMIN (21) and CAP_NET_ADMIN (12) must never be granted.
        assert!(!DEFAULT_CAPS.contains(&21));
        assert!(!DEFAULT_CAPS.contains(&12));
        assert!(DEFAULT_CAPS.contains(&18)); // CAP_SYS_CHROOT
    }
}
