//! Shared helpers for the integration tests: daemons wired for loopback.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use meshbox::cli::Responses;
use meshbox::daemon::{Daemon, DaemonConfig};
use meshbox::dispatch;
use tempfile::TempDir;

/// A daemon bound to an ephemeral loopback mesh port with a scratch base
/// directory. The temp dir must outlive the daemon.
pub async fn daemon(host: &str) -> (Arc<Daemon>, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = DaemonConfig {
        base: dir.path().join("base"),
        hostname: Some(host.to_string()),
        namespace: "testing".to_string(),
        degree: 0,
        port: 0,
        mesh_bind: Some("127.0.0.1:0".to_string()),
        msa_period: Duration::from_millis(50),
        mesh_timeout: Duration::from_secs(5),
        cgroup_root: dir.path().join("cgroup"),
    };
    let daemon = Daemon::start(config).await.expect("daemon start");
    (daemon, dir)
}

/// Run one command line and collect every response it produces.
pub async fn run(daemon: &Arc<Daemon>, line: &str) -> Responses {
    let rx = dispatch::run_command_line(daemon, line).expect("compile");
    dispatch::collect(rx).await
}

/// Poll until `cond` holds or a few seconds pass.
pub async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..150 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}
