//! VM lifecycle tests that run without KVM privileges: launch bookkeeping,
//! conflict detection, info filtering, flush.

mod common;

use common::{daemon, run, wait_until};
use meshbox::vm::VmState;

/// Launching with a missing hypervisor binary lands the VM in ERROR with a
/// descriptive error, visible in `vm info` and removable by `vm flush`.
#[tokio::test]
async fn launch_error_and_flush_round_trip() {
    let (d, _dir) = daemon("n0").await;

    // A hypervisor binary that cannot exist.
    run(&d, "vm config qemu /nonexistent/hypervisor").await;
    run(&d, "vm config memory 512").await;
    run(&d, "vm config disk /tmp/x.img").await;

    let responses = run(&d, "vm launch kvm a").await;
    assert!(responses[0].response.contains("launched 1 vms"));

    // The launch itself is asynchronous; the spawn failure surfaces as
    // ERROR.
    let vm = d.vms.find("a").expect("registered");
    assert_eq!(vm.id, 0);
    wait_until("vm errors", || vm.state() == VmState::ERROR).await;

    let info = run(&d, "vm info name state error").await;
    let row = &info[0].tabular[0];
    assert_eq!(row[0], "a");
    assert_eq!(row[1], "error");
    assert!(row[2].contains("spawn"));

    // Killing a dead VM is an error; flushing removes it.
    let kill = run(&d, "vm kill a").await;
    assert!(kill.iter().any(|r| r.error.is_some()));

    run(&d, "vm flush").await;
    assert!(d.vms.find("a").is_none());
    let info = run(&d, "vm info").await;
    assert!(info[0].tabular.is_empty());

    d.shutdown().await;
}

/// Names are unique while the first VM is registered.
#[tokio::test]
async fn duplicate_name_rejected() {
    let (d, _dir) = daemon("n0").await;

    run(&d, "vm config qemu /nonexistent/hypervisor").await;
    run(&d, "vm launch kvm a").await;
    let second = run(&d, "vm launch kvm a").await;
    assert!(second
        .iter()
        .any(|r| r.error.as_deref().is_some_and(|e| e.contains("already in use"))));

    d.shutdown().await;
}

/// A count launches that many auto-named VMs; ranges launch named ones.
#[tokio::test]
async fn launch_counts_and_ranges() {
    let (d, _dir) = daemon("n0").await;
    run(&d, "vm config qemu /nonexistent/hypervisor").await;

    run(&d, "vm launch kvm 2").await;
    run(&d, "vm launch kvm web[0-1],db").await;

    let names: Vec<String> = d.vms.list().iter().map(|vm| vm.name.clone()).collect();
    assert_eq!(names, ["vm-0", "vm-1", "web0", "web1", "db"]);

    d.shutdown().await;
}

/// Configured MACs conflict across the alive fleet; launched VMs never
/// share a name, UUID, or MAC.
#[tokio::test]
async fn fleet_uniqueness_invariants() {
    let (d, _dir) = daemon("n0").await;
    run(&d, "vm config qemu /nonexistent/hypervisor").await;
    run(&d, "vm config net 100").await;

    run(&d, "vm launch kvm a,b,c").await;

    let vms = d.vms.list();
    assert_eq!(vms.len(), 3);

    let mut names: Vec<&String> = vms.iter().map(|vm| &vm.name).collect();
    names.dedup();
    assert_eq!(names.len(), 3);

    let mut uuids: Vec<String> = vms.iter().map(|vm| vm.uuid.clone()).collect();
    uuids.sort();
    uuids.dedup();
    assert_eq!(uuids.len(), 3);

    let mut macs: Vec<String> = vms
        .iter()
        .flat_map(|vm| vm.macs.lock().unwrap().clone())
        .collect();
    assert_eq!(macs.len(), 3);
    macs.sort();
    macs.dedup();
    assert_eq!(macs.len(), 3);

    d.shutdown().await;
}

/// Lifecycle targets accept ranges; missing names surface per-name errors.
#[tokio::test]
async fn lifecycle_target_ranges() {
    let (d, _dir) = daemon("n0").await;
    run(&d, "vm config qemu /nonexistent/hypervisor").await;
    run(&d, "vm launch kvm web[0-1]").await;

    let responses = run(&d, "vm kill web[0-2]").await;
    let errors: Vec<&str> = responses
        .iter()
        .filter_map(|r| r.error.as_deref())
        .collect();
    // web2 does not exist; web0/web1 are dead already (spawn failed), so
    // every response is an error, but the missing name gets its own.
    assert!(errors.iter().any(|e| e.contains("web2")));

    d.shutdown().await;
}

/// `vm info` filters restrict rows and masks select columns.
#[tokio::test]
async fn info_masks_and_filters() {
    let (d, _dir) = daemon("n0").await;
    run(&d, "vm config qemu /nonexistent/hypervisor").await;
    run(&d, "vm launch kvm a,b").await;

    let info = run(&d, "vm info name filter name=a").await;
    assert_eq!(info[0].header, vec!["name"]);
    assert_eq!(info[0].tabular.len(), 1);
    assert_eq!(info[0].tabular[0][0], "a");

    let info = run(&d, "vm info name filter name!=a").await;
    assert_eq!(info[0].tabular.len(), 1);
    assert_eq!(info[0].tabular[0][0], "b");

    let bad = run(&d, "vm info bogus").await;
    assert!(bad[0].error.is_some());

    d.shutdown().await;
}

/// The instance directory carries config, name, uuid, and a state file
/// that tracks every transition.
#[tokio::test]
async fn instance_dir_layout() {
    let (d, _dir) = daemon("n0").await;
    run(&d, "vm config qemu /nonexistent/hypervisor").await;
    run(&d, "vm launch kvm a").await;

    let vm = d.vms.find("a").unwrap();
    let instance = &vm.instance_path;
    assert_eq!(
        std::fs::read_to_string(instance.join("name")).unwrap().trim(),
        "a"
    );
    assert_eq!(
        std::fs::read_to_string(instance.join("uuid")).unwrap().trim(),
        vm.uuid
    );
    assert!(std::fs::read_to_string(instance.join("config"))
        .unwrap()
        .contains("memory"));

    wait_until("state file settles to error", || {
        std::fs::read_to_string(instance.join("state"))
            .map(|s| s.trim() == "error")
            .unwrap_or(false)
    })
    .await;

    d.shutdown().await;
}
