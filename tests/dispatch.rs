//! Dispatcher integration tests: history, read scripts, mesh send locally.

mod common;

use common::{daemon, run};

// =============================================================================
// HISTORY
// =============================================================================

/// Recorded commands show up in history; clear empties it; write dumps it.
#[tokio::test]
async fn history_records_and_clears() {
    let (d, dir) = daemon("n0").await;

    run(&d, "echo one").await;
    run(&d, "echo two").await;

    // The history command records before it dumps, so it lists itself last.
    let history = run(&d, "history").await;
    assert_eq!(history[0].response, "echo one\necho two\nhistory\n");

    let file = dir.path().join("dump.mm");
    run(&d, &format!("write {}", file.display())).await;
    let dumped = std::fs::read_to_string(&file).unwrap();
    assert!(dumped.starts_with("echo one\necho two\n"));

    run(&d, "clear history").await;
    let history = run(&d, "history").await;
    assert_eq!(history[0].response, "history\n");

    d.shutdown().await;
}

// =============================================================================
// READ SCRIPTS
// =============================================================================

/// A script executes line by line; comments skip; quit schedules and
/// responds; the read itself is not recorded while its commands are.
#[tokio::test]
async fn read_script() {
    let (d, dir) = daemon("n0").await;

    let script = dir.path().join("script.mm");
    std::fs::write(&script, "# comment\necho first\necho second\nquit 3600\n").unwrap();

    let responses = run(&d, &format!("read {}", script.display())).await;
    let texts: Vec<&str> = responses.iter().map(|r| r.response.as_str()).collect();
    assert_eq!(texts[0], "first");
    assert_eq!(texts[1], "second");
    assert!(texts[2].starts_with("quitting after 3600"));
    assert!(responses.iter().all(|r| r.error.is_none()));

    let history = run(&d, "history").await;
    assert!(history[0].response.contains("echo first"));
    assert!(history[0].response.contains("quit 3600"));
    assert!(!history[0].response.contains("read "));

    d.shutdown().await;
}

/// A read inside a read is refused.
#[tokio::test]
async fn nested_read_refused() {
    let (d, dir) = daemon("n0").await;

    let inner = dir.path().join("script.mm");
    std::fs::write(&inner, "echo inner\n").unwrap();
    let outer = dir.path().join("script2.mm");
    std::fs::write(&outer, format!("read {}\n", inner.display())).unwrap();

    let responses = run(&d, &format!("read {}", outer.display())).await;
    let error = responses
        .iter()
        .find_map(|r| r.error.as_deref())
        .expect("an error response");
    assert_eq!(error, "cannot run nested 'read' commands");

    d.shutdown().await;
}

/// A syntactically invalid line stops the read even without `check`.
#[tokio::test]
async fn invalid_line_stops_read() {
    let (d, dir) = daemon("n0").await;

    let script = dir.path().join("script.mm");
    std::fs::write(&script, "echo first\nfrobnicate\necho never\n").unwrap();

    let responses = run(&d, &format!("read {}", script.display())).await;
    assert_eq!(responses[0].response, "first");
    assert!(responses[1].error.as_deref().unwrap().contains("unknown command"));
    assert_eq!(responses.len(), 2);

    d.shutdown().await;
}

/// `check` compiles without executing.
#[tokio::test]
async fn read_check_compiles_only() {
    let (d, dir) = daemon("n0").await;

    let script = dir.path().join("script.mm");
    std::fs::write(&script, "echo first\necho second\n").unwrap();

    let responses = run(&d, &format!("read {} check", script.display())).await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].response, "syntax ok");

    // Nothing executed: history holds only the commands run directly.
    let history = run(&d, "history").await;
    assert!(!history[0].response.contains("echo first"));

    d.shutdown().await;
}

// =============================================================================
// MESH SEND, SINGLE NODE
// =============================================================================

/// A range naming only the local host runs the subcommand locally.
#[tokio::test]
async fn mesh_send_local_only() {
    let (d, _dir) = daemon("n0").await;

    let responses = run(&d, "mesh send n0 echo hi").await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].response, "hi");
    assert_eq!(responses[0].host, "n0");

    d.shutdown().await;
}

/// A host with no path in the mesh state is unroutable immediately.
#[tokio::test]
async fn mesh_send_unroutable_host() {
    let (d, _dir) = daemon("n0").await;

    let responses = run(&d, "mesh send ghost echo hi").await;
    assert_eq!(responses.len(), 1);
    assert!(responses[0].error.as_deref().unwrap().contains("unroutable"));

    d.shutdown().await;
}

// =============================================================================
// SETTINGS HANDLERS
// =============================================================================

/// `mesh timeout` reports and sets the fan-out deadline.
#[tokio::test]
async fn mesh_timeout_setting() {
    let (d, _dir) = daemon("n0").await;

    run(&d, "mesh timeout 1").await;
    let current = run(&d, "mesh timeout").await;
    assert_eq!(current[0].response, "1");

    d.shutdown().await;
}

/// `vm config` edits and dumps the launch template.
#[tokio::test]
async fn vm_config_round_trip() {
    let (d, _dir) = daemon("n0").await;

    run(&d, "vm config memory 512").await;
    run(&d, "vm config disk /tmp/x.img").await;

    let memory = run(&d, "vm config memory").await;
    assert_eq!(memory[0].response, "512");

    let dump = run(&d, "vm config").await;
    assert!(dump[0].response.contains("512"));
    assert!(dump[0].response.contains("/tmp/x.img"));

    run(&d, "clear vm config memory").await;
    let memory = run(&d, "vm config memory").await;
    assert_eq!(memory[0].response, "2048");

    let bad = run(&d, "vm config bogus 1").await;
    assert!(bad[0].error.is_some());

    d.shutdown().await;
}

/// `version` reports the crate version.
#[tokio::test]
async fn version_reports() {
    let (d, _dir) = daemon("n0").await;

    let responses = run(&d, "version").await;
    assert!(responses[0].response.starts_with("meshbox "));

    d.shutdown().await;
}

/// `host` reports one row of machine statistics.
#[tokio::test]
async fn host_statistics() {
    let (d, _dir) = daemon("n0").await;

    let responses = run(&d, "host").await;
    assert_eq!(responses[0].header[0], "name");
    let row = &responses[0].tabular[0];
    assert_eq!(row[0], "n0");
    assert!(row[1].parse::<usize>().unwrap() >= 1);
    assert_eq!(row[5], "0");

    d.shutdown().await;
}

// =============================================================================
// FRONTENDS
// =============================================================================

/// Unix-socket round trip: a client sends a command and drains the reply
/// stream until `More=false`; errors render; suggest completes.
#[tokio::test]
async fn socket_round_trip() {
    use meshbox::dispatch::socket;

    let (d, _dir) = daemon("n0").await;
    let server = {
        let d = d.clone();
        tokio::spawn(async move { socket::serve(d).await })
    };
    // Give the listener a moment to bind.
    common::wait_until("socket file", || d.socket_path().exists()).await;

    let output = socket::run_remote(&d.socket_path(), "echo over the wire")
        .await
        .unwrap();
    assert_eq!(output, "over the wire\n");

    let output = socket::run_remote(&d.socket_path(), "frobnicate").await.unwrap();
    assert!(output.contains("unknown command"));

    d.begin_shutdown();
    let _ = server.await;
    d.shutdown().await;
}

/// HTTP frontend: POST /command returns a JSON array of responses; other
/// methods get 405.
#[tokio::test]
async fn http_round_trip() {
    use meshbox::cli::Responses;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (d, _dir) = daemon("n0").await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = {
        let d = d.clone();
        tokio::spawn(async move { meshbox::dispatch::http::serve_on(d, listener).await })
    };

    let send = |request: String| async move {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        reply
    };

    let body = r#"{"command": "echo http hello"}"#;
    let reply = send(format!(
        "POST /command HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    ))
    .await;
    assert!(reply.starts_with("HTTP/1.1 200 OK"));
    let json = reply.split("\r\n\r\n").nth(1).unwrap();
    let responses: Responses = serde_json::from_str(json).unwrap();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].response, "http hello");

    let reply = send("GET /command HTTP/1.1\r\nHost: x\r\n\r\n".to_string()).await;
    assert!(reply.starts_with("HTTP/1.1 405"));

    d.begin_shutdown();
    let _ = server.await;
    d.shutdown().await;
}
