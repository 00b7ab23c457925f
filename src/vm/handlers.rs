//! CLI handlers for the VM subsystem.

use std::sync::Arc;

use tracing::info;

use crate::cli::{Command, Handler, Response, Responses};
use crate::daemon::Daemon;
use crate::dispatch::range;
use crate::error::{Error, Result};
use crate::vm::{self, config::CONFIG_FIELDS, Vm, VmKind, VmState, VmType};

/// Columns `vm info` can print; also the accepted mask names.
pub const INFO_COLUMNS: &[&str] = &[
    "id", "name", "type", "state", "memory", "vcpus", "uuid", "disk", "filesystem", "vlan",
    "bridge", "tap", "mac", "ip", "ip6", "tags", "error",
];

/// Default `vm info` columns.
const INFO_DEFAULT: &[&str] = &[
    "id", "name", "type", "state", "memory", "vcpus", "vlan", "tap", "mac", "ip",
];

/// Handlers contributed by this module, installed by `register_all`.
pub fn handlers() -> Vec<Handler> {
    vec![
        Handler::streaming(
            "launch virtual machines in a paused state",
            "Launch one or more VMs of the given type. The argument is a \
             comma-separated list of names, name ranges (a[0-4]), or counts; \
             a count launches that many auto-named VMs. Launched VMs start \
             in the BUILDING state; use \"vm start\" to run them.",
            vec!["vm launch <kvm,container> <names>"],
            |daemon, cmd, sink| async move {
                let responses = vm_launch(&daemon, &cmd).await;
                let _ = sink.send(responses).await;
            },
        ),
        Handler::simple(
            "start, pause, or kill virtual machines",
            "Operate on the named VMs (a name, a comma-separated list with \
             ranges, or \"all\" for every VM). Start resumes a paused or \
             freshly launched VM (relaunching it if it has already quit); \
             stop pauses it; kill begins teardown.",
            vec!["vm <start,stop,kill> <target>"],
            |daemon, cmd| async move { vm_lifecycle(&daemon, &cmd).await },
        ),
        Handler::simple(
            "discard quit and errored virtual machines",
            "Remove every VM in the QUIT or ERROR state from the registry, \
             deleting its instance directory and any remaining artifacts.",
            vec!["vm flush"],
            |daemon, _| async move { vm_flush(&daemon).await },
        ),
        Handler::simple(
            "print information about virtual machines",
            "With no arguments, print the default columns for every VM. \
             Arguments name output columns (masks); the word \"filter\" \
             introduces a key=value, key!=value, or key~value expression \
             restricting the rows.",
            vec!["vm info [args]..."],
            |daemon, cmd| async move { vm_info(&daemon, &cmd).await },
        ),
        Handler::simple(
            "configure the template for future vm launches",
            "With no arguments, print the whole launch template. With a \
             field, print that field; with a field and values, set it.",
            vec!["vm config", "vm config <field> [value]..."],
            |daemon, cmd| async move { vm_config(&daemon, &cmd) },
        ),
        Handler::simple(
            "reset the vm launch template",
            "Reset every field of the launch template, or just the named one.",
            vec!["clear vm config", "clear vm config <field>"],
            |daemon, cmd| async move { clear_vm_config(&daemon, &cmd) },
        ),
    ]
}

async fn vm_launch(daemon: &Arc<Daemon>, cmd: &Command) -> Responses {
    let vm_type = if cmd.has_bool("container") {
        VmType::Container
    } else {
        VmType::Kvm
    };
    let spec = cmd.string("names").unwrap_or_default();

    let names = match expand_launch_names(spec) {
        Ok(names) => names,
        Err(e) => return vec![Response::error(&daemon.hostname, e.to_string())],
    };

    let config = daemon.vm_config.lock().expect("vm config lock").clone();
    let mut launched = 0usize;
    let mut responses = Vec::new();

    for name in names {
        let prepared = daemon
            .vms
            .prepare(&daemon.config.base, name, vm_type, &config)
            .and_then(|vm| {
                daemon.vms.write_instance_files(&vm)?;
                Ok(vm)
            });
        match prepared {
            Ok(vm) => {
                launched += 1;
                spawn_launch(daemon.clone(), vm.id, vm_type);
                info!(vm = %vm.name, id = vm.id, %vm_type, "launch scheduled");
            }
            Err(e) => responses.push(Response::error(&daemon.hostname, e.to_string())),
        }
    }

    if launched > 0 || responses.is_empty() {
        responses.insert(
            0,
            Response::new(&daemon.hostname, format!("launched {} vms", launched)),
        );
    }
    responses
}

/// `2` → two auto-named VMs; `a,b[0-1]` → named VMs via range expansion.
fn expand_launch_names(spec: &str) -> Result<Vec<Option<String>>> {
    if let Ok(count) = spec.parse::<usize>() {
        if count == 0 {
            return Err(Error::Invalid("cannot launch 0 vms".into()));
        }
        return Ok(vec![None; count]);
    }
    Ok(range::expand(spec)?.into_iter().map(Some).collect())
}

fn spawn_launch(daemon: Arc<Daemon>, id: u32, vm_type: VmType) {
    tokio::spawn(async move {
        let result = match vm_type {
            VmType::Kvm => vm::kvm::launch(&daemon, id).await,
            VmType::Container => vm::container::launch(&daemon, id).await,
        };
        if let Err(e) = result {
            // State is already ERROR; the log carries the details.
            tracing::warn!(id, error = %e, "launch failed");
        }
    });
}

async fn vm_lifecycle(daemon: &Arc<Daemon>, cmd: &Command) -> Responses {
    let target = cmd.string("target").unwrap_or_default();
    let mut responses = Vec::new();

    let vms: Vec<Arc<Vm>> = if target == "all" {
        daemon.vms.list()
    } else {
        let names = match range::expand(target) {
            Ok(names) => names,
            Err(e) => return vec![Response::error(&daemon.hostname, e.to_string())],
        };
        let mut vms = Vec::new();
        for name in names {
            match daemon.vms.find(&name) {
                Some(vm) => vms.push(vm),
                None => responses.push(Response::error(
                    &daemon.hostname,
                    format!("vm not found: {:?}", name),
                )),
            }
        }
        vms
    };

    for vm in vms {
        let result = if cmd.has_bool("start") {
            vm_start(daemon, &vm).await
        } else if cmd.has_bool("stop") {
            vm_stop(&vm).await
        } else {
            vm_kill(&vm).await
        };
        if let Err(e) = result {
            responses.push(Response::error(&daemon.hostname, e.to_string()));
        }
    }

    if responses.is_empty() {
        responses.push(Response::new(&daemon.hostname, ""));
    }
    responses
}

async fn vm_start(daemon: &Arc<Daemon>, vm: &Arc<Vm>) -> Result<()> {
    let mut runtime = vm.lock().await;
    match runtime.state {
        state if state.intersects(VmState::BUILDING | VmState::PAUSED) => {
            match vm.vm_type {
                VmType::Kvm => {
                    let VmKind::Kvm(kvm) = &mut runtime.kind else {
                        return Err(Error::Vm(format!("{}: variant mismatch", vm.name)));
                    };
                    let qmp = kvm
                        .qmp
                        .as_mut()
                        .ok_or_else(|| Error::Vm(format!("{}: no monitor", vm.name)))?;
                    qmp.cont().await?;
                }
                VmType::Container => vm::container::start(vm, &mut runtime).await?,
            }
            vm.write_state(&mut runtime, VmState::RUNNING);
            Ok(())
        }
        state if state.intersects(VmState::QUIT | VmState::ERROR) => {
            // Relaunch: back through BUILDING with a fresh teardown signal.
            runtime.error = None;
            vm.rearm_kill();
            vm.write_state(&mut runtime, VmState::BUILDING);
            drop(runtime);
            spawn_launch(daemon.clone(), vm.id, vm.vm_type);
            Ok(())
        }
        state if state == VmState::RUNNING => {
            Err(Error::Vm(format!("{} is already running", vm.name)))
        }
        state => Err(Error::Vm(format!("cannot start {} in state {}", vm.name, state))),
    }
}

async fn vm_stop(vm: &Arc<Vm>) -> Result<()> {
    let mut runtime = vm.lock().await;
    if runtime.state != VmState::RUNNING {
        return Err(Error::Vm(format!("{} is not running", vm.name)));
    }
    match vm.vm_type {
        VmType::Kvm => {
            let VmKind::Kvm(kvm) = &mut runtime.kind else {
                return Err(Error::Vm(format!("{}: variant mismatch", vm.name)));
            };
            let qmp = kvm
                .qmp
                .as_mut()
                .ok_or_else(|| Error::Vm(format!("{}: no monitor", vm.name)))?;
            qmp.stop().await?;
        }
        VmType::Container => vm::container::stop(vm, &mut runtime).await?,
    }
    vm.write_state(&mut runtime, VmState::PAUSED);
    Ok(())
}

async fn vm_kill(vm: &Arc<Vm>) -> Result<()> {
    if !vm.state().intersects(VmState::ALIVE) {
        return Err(Error::Vm(format!("{} is not running", vm.name)));
    }
    vm.signal_kill();
    Ok(())
}

async fn vm_flush(daemon: &Arc<Daemon>) -> Responses {
    let mut flushed = 0usize;
    for vm in daemon.vms.list() {
        if !vm.state().intersects(VmState::QUIT | VmState::ERROR) {
            continue;
        }
        {
            let mut runtime = vm.lock().await;
            if let VmKind::Container(container) = &mut runtime.kind {
                if let Some(cgroup) = container.cgroup.take() {
                    cgroup.remove();
                }
            }
        }
        if let Err(e) = std::fs::remove_dir_all(&vm.instance_path) {
            tracing::debug!(vm = %vm.name, error = %e, "instance dir removal");
        }
        daemon.vms.remove(vm.id);
        flushed += 1;
        info!(vm = %vm.name, id = vm.id, "flushed");
    }
    vec![Response::new(
        &daemon.hostname,
        format!("flushed {} vms", flushed),
    )]
}

/// One `vm info` filter expression.
enum Filter {
    Equals(String, String),
    NotEquals(String, String),
    Contains(String, String),
}

impl Filter {
    fn parse(expr: &str) -> Result<Self> {
        if let Some((key, value)) = expr.split_once("!=") {
            return Ok(Self::NotEquals(key.to_string(), value.to_string()));
        }
        if let Some((key, value)) = expr.split_once('~') {
            return Ok(Self::Contains(key.to_string(), value.to_string()));
        }
        if let Some((key, value)) = expr.split_once('=') {
            return Ok(Self::Equals(key.to_string(), value.to_string()));
        }
        Err(Error::Invalid(format!("invalid filter: {:?}", expr)))
    }

    fn key(&self) -> &str {
        match self {
            Self::Equals(k, _) | Self::NotEquals(k, _) | Self::Contains(k, _) => k,
        }
    }

    fn accepts(&self, cell: &str) -> bool {
        match self {
            Self::Equals(_, v) => cell == v,
            Self::NotEquals(_, v) => cell != v,
            Self::Contains(_, v) => cell.contains(v.as_str()),
        }
    }
}

async fn vm_info(daemon: &Arc<Daemon>, cmd: &Command) -> Responses {
    let mut columns: Vec<String> = Vec::new();
    let mut filters: Vec<Filter> = Vec::new();

    let args = cmd.list("args");
    let mut i = 0;
    while i < args.len() {
        if args[i] == "filter" {
            let Some(expr) = args.get(i + 1) else {
                return vec![Response::error(
                    &daemon.hostname,
                    "filter requires an expression",
                )];
            };
            match Filter::parse(expr) {
                Ok(filter) => filters.push(filter),
                Err(e) => return vec![Response::error(&daemon.hostname, e.to_string())],
            }
            i += 2;
            continue;
        }
        for mask in args[i].split(',') {
            if !INFO_COLUMNS.contains(&mask) {
                return vec![Response::error(
                    &daemon.hostname,
                    format!("unknown column: {:?}", mask),
                )];
            }
            columns.push(mask.to_string());
        }
        i += 1;
    }
    if columns.is_empty() {
        columns = INFO_DEFAULT.iter().map(|c| c.to_string()).collect();
    }
    for filter in &filters {
        if !INFO_COLUMNS.contains(&filter.key()) {
            return vec![Response::error(
                &daemon.hostname,
                format!("unknown filter column: {:?}", filter.key()),
            )];
        }
    }

    let mut rows = Vec::new();
    for vm in daemon.vms.list() {
        let runtime = vm.lock().await;
        let cell = |column: &str| -> String {
            let join_nics = |f: &dyn Fn(&vm::Nic) -> String| -> String {
                runtime
                    .networks
                    .iter()
                    .map(|n| f(n))
                    .collect::<Vec<_>>()
                    .join("|")
            };
            match column {
                "id" => vm.id.to_string(),
                "name" => vm.name.clone(),
                "type" => vm.vm_type.to_string(),
                "state" => runtime.state.to_string(),
                "memory" => vm.config.memory.to_string(),
                "vcpus" => vm.config.vcpus.to_string(),
                "uuid" => vm.uuid.clone(),
                "disk" => vm.config.disks.join("|"),
                "filesystem" => vm.config.filesystem.clone(),
                "vlan" => join_nics(&|n| n.vlan.to_string()),
                "bridge" => join_nics(&|n| n.bridge.clone()),
                "tap" => join_nics(&|n| n.tap.clone()),
                "mac" => join_nics(&|n| n.mac.clone()),
                "ip" => join_nics(&|n| n.ip4.clone()),
                "ip6" => join_nics(&|n| n.ip6.clone()),
                "tags" => {
                    let mut tags: Vec<String> = vm
                        .config
                        .tags
                        .iter()
                        .map(|(k, v)| format!("{}={}", k, v))
                        .collect();
                    tags.sort();
                    tags.join("|")
                }
                "error" => runtime.error.clone().unwrap_or_default(),
                _ => String::new(),
            }
        };

        if !filters.iter().all(|f| f.accepts(&cell(f.key()))) {
            continue;
        }
        rows.push(columns.iter().map(|c| cell(c)).collect::<Vec<String>>());
    }

    vec![Response::table(&daemon.hostname, columns, rows)]
}

fn vm_config(daemon: &Arc<Daemon>, cmd: &Command) -> Responses {
    let mut config = daemon.vm_config.lock().expect("vm config lock");
    let host = &daemon.hostname;

    let Some(field) = cmd.string("field") else {
        return vec![Response::new(host, config.dump())];
    };
    if !CONFIG_FIELDS.contains(&field) {
        return vec![Response::error(
            host,
            format!("unknown config field: {:?}", field),
        )];
    }

    let values = cmd.list("value");
    if values.is_empty() {
        return match config.get(field) {
            Ok(value) => vec![Response::new(host, value)],
            Err(e) => vec![Response::error(host, e.to_string())],
        };
    }
    match config.set(field, values) {
        Ok(()) => vec![Response::new(host, "")],
        Err(e) => vec![Response::error(host, e.to_string())],
    }
}

fn clear_vm_config(daemon: &Arc<Daemon>, cmd: &Command) -> Responses {
    let mut config = daemon.vm_config.lock().expect("vm config lock");
    match config.clear(cmd.string("field")) {
        Ok(()) => vec![Response::new(&daemon.hostname, "")],
        Err(e) => vec![Response::error(&daemon.hostname, e.to_string())],
    }
}
