//! Cross-daemon mesh tests: fan-out, remote execution, timeouts.

mod common;

use common::{daemon, run, wait_until};

// =============================================================================
// FAN-OUT
// =============================================================================

/// Two peered nodes: `mesh send n[0-1] vm info` yields exactly two
/// responses, keyed by host.
#[tokio::test]
async fn mesh_fan_out_two_nodes() {
    let (n0, _d0) = daemon("n0").await;
    let (n1, _d1) = daemon("n1").await;

    n0.mesh.dial(&n1.mesh.local_addr().to_string()).await.unwrap();
    wait_until("peering", || {
        !n0.mesh.peer_hosts().is_empty() && !n1.mesh.peer_hosts().is_empty()
    })
    .await;

    let responses = run(&n0, "mesh send n[0-1] vm info").await;
    assert_eq!(responses.len(), 2, "got: {:?}", responses);

    let mut hosts: Vec<&str> = responses.iter().map(|r| r.host.as_str()).collect();
    hosts.sort();
    assert_eq!(hosts, ["n0", "n1"]);
    assert!(responses.iter().all(|r| r.error.is_none()));

    n0.shutdown().await;
    n1.shutdown().await;
}

/// Remote execution round trip: the remote node actually runs the command
/// and its response text comes back under its hostname.
#[tokio::test]
async fn mesh_remote_execution() {
    let (n0, _d0) = daemon("n0").await;
    let (n1, _d1) = daemon("n1").await;

    n0.mesh.dial(&n1.mesh.local_addr().to_string()).await.unwrap();
    wait_until("peering", || !n0.mesh.peer_hosts().is_empty()).await;

    let responses = run(&n0, "mesh send n1 echo over there").await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].host, "n1");
    assert_eq!(responses[0].response, "over there");

    n0.shutdown().await;
    n1.shutdown().await;
}

/// The wildcard expands to every reachable peer plus the local node.
#[tokio::test]
async fn mesh_send_all() {
    let (n0, _d0) = daemon("n0").await;
    let (n1, _d1) = daemon("n1").await;

    n0.mesh.dial(&n1.mesh.local_addr().to_string()).await.unwrap();
    wait_until("peering", || !n0.mesh.peer_hosts().is_empty()).await;

    let responses = run(&n0, "mesh send all echo fleet").await;
    let mut hosts: Vec<&str> = responses.iter().map(|r| r.host.as_str()).collect();
    hosts.sort();
    assert_eq!(hosts, ["n0", "n1"]);
    assert!(responses.iter().all(|r| r.response == "fleet"));

    n0.shutdown().await;
    n1.shutdown().await;
}

// =============================================================================
// TIMEOUTS
// =============================================================================

/// A gossiped-but-disconnected host times out: one clean response from the
/// live node, one `meshage timeout` error for the dead one, within ~2s.
#[tokio::test]
async fn mesh_timeout_for_disconnected_host() {
    let (n0, _d0) = daemon("n0").await;
    let (n1, _d1) = daemon("n1").await;

    n0.mesh.dial(&n1.mesh.local_addr().to_string()).await.unwrap();
    wait_until("peering", || !n0.mesh.peer_hosts().is_empty()).await;

    // Disconnect n1; its stale adjacency row keeps it apparently routable.
    n1.mesh.close().await;
    wait_until("hangup observed", || n0.mesh.peer_hosts().is_empty()).await;

    run(&n0, "mesh timeout 1").await;
    let started = std::time::Instant::now();
    let responses = run(&n0, "mesh send n[0-1] vm info").await;
    assert!(started.elapsed() <= std::time::Duration::from_secs(2));

    let ok = responses.iter().find(|r| r.host == "n0").unwrap();
    assert!(ok.error.is_none());
    let timed_out = responses.iter().find(|r| r.host == "n1").unwrap();
    assert!(timed_out
        .error
        .as_deref()
        .unwrap()
        .contains("meshage timeout"));

    n0.shutdown().await;
}

// =============================================================================
// TOPOLOGY
// =============================================================================

/// After one MSA period with no change, every node sees every reachable
/// node through gossip, and routed sends cross the intermediate.
#[tokio::test]
async fn gossip_reaches_three_node_line() {
    let (n0, _d0) = daemon("n0").await;
    let (n1, _d1) = daemon("n1").await;
    let (n2, _d2) = daemon("n2").await;

    n0.mesh.dial(&n1.mesh.local_addr().to_string()).await.unwrap();
    n2.mesh.dial(&n1.mesh.local_addr().to_string()).await.unwrap();

    wait_until("n0 sees n2", || {
        n0.mesh.reachable() == vec!["n1".to_string(), "n2".to_string()]
    })
    .await;

    // A send across the line routes through n1.
    let responses = run(&n0, "mesh send n2 echo far side").await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].host, "n2");
    assert_eq!(responses[0].response, "far side");

    // mesh status reflects the adjacency.
    let status = run(&n0, "mesh status").await;
    assert_eq!(status[0].header[0], "host");
    assert_eq!(status[0].tabular[0][0], "n0");

    n0.shutdown().await;
    n1.shutdown().await;
    n2.shutdown().await;
}

/// Namespace mismatches refuse to peer.
#[tokio::test]
async fn namespace_gate() {
    let (n0, _d0) = daemon("n0").await;

    let dir = tempfile::tempdir().unwrap();
    let other = meshbox::daemon::Daemon::start(meshbox::daemon::DaemonConfig {
        base: dir.path().join("base"),
        hostname: Some("stranger".to_string()),
        namespace: "elsewhere".to_string(),
        degree: 0,
        port: 0,
        mesh_bind: Some("127.0.0.1:0".to_string()),
        msa_period: std::time::Duration::from_millis(50),
        mesh_timeout: std::time::Duration::from_secs(5),
        cgroup_root: dir.path().join("cgroup"),
    })
    .await
    .unwrap();

    let result = other.mesh.dial(&n0.mesh.local_addr().to_string()).await;
    assert!(result.is_err());
    assert!(n0.mesh.peer_hosts().is_empty());

    other.shutdown().await;
    n0.shutdown().await;
}
