//! The command dispatcher: the single entry point every frontend shares.
//!
//! [`run_commands`] resolves a compiled command's handler, records history,
//! and streams the handler's response batches through a bounded channel. A
//! process-wide command lock serializes handlers; the long-running `read`
//! and `mesh send` handlers run outside the lock and reacquire it per
//! subcommand so other commands can interleave.
//!
//! `mesh send <range> (command)` expands the range, forwards the serialized
//! subcommand to every named peer with a fresh transaction ID, runs it
//! locally when the local host is named, and merges remote responses in
//! arrival order — closing the stream when every host answered or the mesh
//! timeout fires, with one synthetic error response per missing host.

pub mod host;
pub mod http;
pub mod range;
pub mod socket;
pub mod tty;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use meshbox_protocol::{CommandPayload, FrameKind, Traversal};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cli::{render, Command, CommandSource, Handler, Response, Responses};
use crate::daemon::Daemon;
use crate::error::{Error, Result};
use crate::mesh::random_tid;

/// Response stream depth per in-flight command.
const RESPONSE_QUEUE: usize = 256;

/// Compile one line and run it; a nil (blank/comment) line yields an empty
/// stream.
pub fn run_command_line(daemon: &Arc<Daemon>, line: &str) -> Result<mpsc::Receiver<Responses>> {
    match daemon.registry.compile(line)? {
        Some(cmd) => run_commands(daemon, cmd),
        None => {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }
}

/// Run one compiled command, streaming its response batches.
///
/// The command lock is held for the handler's whole run (unless the handler
/// opted out), but never while the caller consumes the stream.
pub fn run_commands(daemon: &Arc<Daemon>, cmd: Command) -> Result<mpsc::Receiver<Responses>> {
    let handler = daemon
        .registry
        .handler_for(&cmd.pattern)
        .ok_or_else(|| Error::Invalid(format!("no handler for pattern {:?}", cmd.pattern)))?;

    if cmd.record {
        daemon
            .history
            .lock()
            .expect("history lock")
            .record(&cmd.original);
    }

    let (tx, rx) = mpsc::channel(RESPONSE_QUEUE);
    let daemon = daemon.clone();
    let needs_lock = handler.lock;
    tokio::spawn(async move {
        let _guard = if needs_lock {
            Some(daemon.cmd_lock.lock().await)
        } else {
            None
        };
        debug!(pattern = %cmd.pattern, locked = needs_lock, "dispatching");
        (handler.call)(daemon.clone(), cmd, tx).await;
    });
    Ok(rx)
}

/// Drain a response stream into one batch (HTTP frontend, tests).
pub async fn collect(mut rx: mpsc::Receiver<Responses>) -> Responses {
    let mut all = Vec::new();
    while let Some(responses) = rx.recv().await {
        all.extend(responses);
    }
    all
}

/// Run a line and render everything it produced (socket `-e`, scripts).
pub async fn run_and_render(daemon: &Arc<Daemon>, line: &str) -> String {
    match run_command_line(daemon, line) {
        Ok(rx) => render(&collect(rx).await),
        Err(e) => render(&[Response::error(&daemon.hostname, e.to_string())]),
    }
}

/// Handlers contributed by the dispatcher itself.
pub fn handlers() -> Vec<Handler> {
    vec![
        Handler::simple(
            "echo arguments",
            "",
            vec!["echo [args]..."],
            |daemon, cmd| async move {
                vec![Response::new(&daemon.hostname, cmd.list("args").join(" "))]
            },
        ),
        Handler::simple(
            "print the version",
            "",
            vec!["version"],
            |daemon, _| async move { vec![Response::new(&daemon.hostname, crate::VERSION)] },
        ),
        Handler::simple(
            "print help on commands",
            "With no argument, print a one-line summary of every command; \
             with a command name, print its patterns and long help.",
            vec!["help [command]"],
            |daemon, cmd| async move {
                let text = match cmd.string("command") {
                    None => daemon.registry.help_all(),
                    Some(name) => match daemon.registry.help_for(name) {
                        Some(text) => text,
                        None => {
                            return vec![Response::error(
                                &daemon.hostname,
                                format!("no help for {:?}", name),
                            )]
                        }
                    },
                };
                vec![Response::new(&daemon.hostname, text)]
            },
        ),
        Handler::simple(
            "print the command history",
            "",
            vec!["history"],
            |daemon, _| async move {
                let dump = daemon.history.lock().expect("history lock").dump();
                vec![Response::new(&daemon.hostname, dump)]
            },
        ),
        Handler::simple(
            "clear the command history",
            "",
            vec!["clear history"],
            |daemon, _| async move {
                daemon.history.lock().expect("history lock").clear();
                vec![Response::new(&daemon.hostname, "")]
            },
        ),
        Handler::simple(
            "write the command history to a file",
            "",
            vec!["write <file>"],
            |daemon, cmd| async move {
                let file = cmd.string("file").unwrap_or_default();
                let dump = daemon.history.lock().expect("history lock").dump();
                match tokio::fs::write(file, dump).await {
                    Ok(()) => vec![Response::new(&daemon.hostname, "")],
                    Err(e) => vec![Response::error(&daemon.hostname, e.to_string())],
                }
            },
        ),
        Handler::streaming(
            "read and execute commands from a file",
            "Execute the file line by line, skipping blanks and comments. \
             A syntactically invalid line stops the read. With \"check\", \
             only compile, reporting errors without executing anything.",
            vec!["read <file> [check]"],
            |daemon, cmd, sink| async move { read_file(daemon, cmd, sink).await },
        )
        .no_record()
        .unlocked(),
        Handler::simple(
            "quit the daemon",
            "Quit, optionally after a delay in seconds.",
            vec!["quit [delay]"],
            |daemon, cmd| async move {
                let delay = match cmd.string("delay").map(str::parse::<u64>) {
                    None => None,
                    Some(Ok(secs)) => Some(secs),
                    Some(Err(_)) => {
                        return vec![Response::error(
                            &daemon.hostname,
                            "delay must be an integer (seconds)",
                        )]
                    }
                };
                let text = match delay {
                    Some(secs) => format!("quitting after {} seconds", secs),
                    None => String::new(),
                };
                let host = daemon.hostname.clone();
                tokio::spawn(async move {
                    if let Some(secs) = delay {
                        tokio::time::sleep(Duration::from_secs(secs)).await;
                    }
                    daemon.begin_shutdown();
                });
                vec![Response::new(&host, text)]
            },
        ),
        Handler::simple(
            "report or set the mesh degree",
            "",
            vec!["mesh degree [degree]"],
            |daemon, cmd| async move {
                match cmd.string("degree").map(str::parse::<u32>) {
                    None => vec![Response::new(
                        &daemon.hostname,
                        daemon.mesh.degree().to_string(),
                    )],
                    Some(Ok(degree)) => {
                        daemon.mesh.set_degree(degree);
                        vec![Response::new(&daemon.hostname, "")]
                    }
                    Some(Err(_)) => {
                        vec![Response::error(&daemon.hostname, "degree must be an integer")]
                    }
                }
            },
        ),
        Handler::simple(
            "connect to a mesh peer",
            "",
            vec!["mesh dial <host>"],
            |daemon, cmd| async move {
                let host = cmd.string("host").unwrap_or_default();
                match daemon.mesh.dial(host).await {
                    Ok(()) => vec![Response::new(&daemon.hostname, "")],
                    Err(e) => vec![Response::error(&daemon.hostname, e.to_string())],
                }
            },
        ),
        Handler::simple(
            "disconnect a mesh peer",
            "",
            vec!["mesh hangup <host>"],
            |daemon, cmd| async move {
                let host = cmd.string("host").unwrap_or_default();
                match daemon.mesh.hangup(host).await {
                    Ok(()) => vec![Response::new(&daemon.hostname, "")],
                    Err(e) => vec![Response::error(&daemon.hostname, e.to_string())],
                }
            },
        ),
        Handler::simple(
            "print mesh status",
            "",
            vec!["mesh status"],
            |daemon, _| async move {
                let status = daemon.mesh.status();
                let header = ["host", "namespace", "degree", "port", "peers", "size"]
                    .map(String::from)
                    .to_vec();
                let row = vec![
                    status.host,
                    status.namespace,
                    status.degree.to_string(),
                    status.port.to_string(),
                    status.peers.join(","),
                    status.mesh_size.to_string(),
                ];
                vec![Response::table(&daemon.hostname, header, vec![row])]
            },
        ),
        Handler::simple(
            "print the mesh adjacency list",
            "",
            vec!["mesh list"],
            |daemon, _| async move {
                let mut text = String::new();
                for (host, neighbors) in daemon.mesh.adjacency() {
                    text.push_str(&format!("{}: {}\n", host, neighbors.join(" ")));
                }
                vec![Response::new(&daemon.hostname, text)]
            },
        ),
        Handler::simple(
            "report or set the mesh response timeout",
            "Seconds to wait for responses to a mesh send before emitting \
             per-host timeout errors.",
            vec!["mesh timeout [seconds]"],
            |daemon, cmd| async move {
                match cmd.string("seconds").map(str::parse::<u64>) {
                    None => vec![Response::new(
                        &daemon.hostname,
                        daemon.mesh_timeout().as_secs().to_string(),
                    )],
                    Some(Ok(secs)) => {
                        daemon.set_mesh_timeout(secs);
                        vec![Response::new(&daemon.hostname, "")]
                    }
                    Some(Err(_)) => {
                        vec![Response::error(&daemon.hostname, "timeout must be an integer")]
                    }
                }
            },
        ),
        Handler::streaming(
            "send a command to mesh peers",
            "Expand the range (a comma-separated list of hosts and \
             prefix[lo-hi] ranges; \"all\" or \"*\" means every known peer), \
             forward the subcommand to each named host, run it locally when \
             this host is named, and merge the responses.",
            vec!["mesh send <clients> (command)"],
            |daemon, cmd, sink| async move { mesh_send(daemon, cmd, sink).await },
        )
        .unlocked(),
    ]
}

/// The `read <file> [check]` loop.
async fn read_file(daemon: Arc<Daemon>, cmd: Command, sink: mpsc::Sender<Responses>) {
    let host = daemon.hostname.clone();

    if cmd.source == CommandSource::Read {
        let _ = sink
            .send(vec![Response::error(&host, "cannot run nested 'read' commands")])
            .await;
        return;
    }
    let check = match cmd.string("check") {
        None => false,
        Some("check") => true,
        Some(other) => {
            let _ = sink
                .send(vec![Response::error(
                    &host,
                    format!("expected \"check\", got {:?}", other),
                )])
                .await;
            return;
        }
    };

    let file = cmd.string("file").unwrap_or_default();
    let contents = match tokio::fs::read_to_string(file).await {
        Ok(contents) => contents,
        Err(e) => {
            let _ = sink.send(vec![Response::error(&host, e.to_string())]).await;
            return;
        }
    };

    for (lineno, line) in contents.lines().enumerate() {
        let mut sub = match daemon.registry.compile(line) {
            Ok(Some(sub)) => sub,
            Ok(None) => continue,
            Err(e) => {
                // An invalid line always stops the read.
                let _ = sink
                    .send(vec![Response::error(
                        &host,
                        format!("line {}: {}", lineno + 1, e),
                    )])
                    .await;
                return;
            }
        };
        if check {
            continue;
        }
        if sub.pattern.starts_with("read ") {
            let _ = sink
                .send(vec![Response::error(&host, "cannot run nested 'read' commands")])
                .await;
            return;
        }
        sub.source = CommandSource::Read;

        // The lock is reacquired around each command, so other commands can
        // interleave with a long-running read.
        match run_commands(&daemon, sub) {
            Ok(mut rx) => {
                while let Some(responses) = rx.recv().await {
                    if sink.send(responses).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = sink.send(vec![Response::error(&host, e.to_string())]).await;
                return;
            }
        }
    }

    if check {
        let _ = sink.send(vec![Response::new(&host, "syntax ok")]).await;
    }
}

/// The `mesh send <range> (command)` fan-out.
async fn mesh_send(daemon: Arc<Daemon>, cmd: Command, sink: mpsc::Sender<Responses>) {
    let host = daemon.hostname.clone();
    let Some(sub) = cmd.subcommand.as_deref() else {
        let _ = sink
            .send(vec![Response::error(&host, "mesh send requires a command")])
            .await;
        return;
    };
    let spec = cmd.string("clients").unwrap_or_default();

    // Expand the range. The local host runs the subcommand itself rather
    // than receiving it over the mesh.
    let (mut targets, run_local) = if spec == "all" || spec == "*" {
        (daemon.mesh.reachable(), true)
    } else {
        match range::expand(spec) {
            Ok(names) => {
                let local = names.iter().any(|n| *n == host);
                (names, local)
            }
            Err(e) => {
                let _ = sink.send(vec![Response::error(&host, e.to_string())]).await;
                return;
            }
        }
    };
    targets.retain(|t| *t != host);
    targets.sort();
    targets.dedup();

    let tid = random_tid();
    let mut waiter = daemon.mesh.register_tid(tid);

    let payload = CommandPayload {
        original: sub.original.clone(),
        record: sub.record,
    };
    let body = match serde_json::to_value(&payload) {
        Ok(body) => body,
        Err(e) => {
            daemon.mesh.unregister_tid(tid);
            let _ = sink.send(vec![Response::error(&host, e.to_string())]).await;
            return;
        }
    };

    let unroutable = match daemon
        .mesh
        .send(&targets, FrameKind::Command, Traversal::Unordered, tid, body)
        .await
    {
        Ok(unroutable) => unroutable,
        Err(e) => {
            daemon.mesh.unregister_tid(tid);
            let _ = sink.send(vec![Response::error(&host, e.to_string())]).await;
            return;
        }
    };
    for peer in &unroutable {
        let _ = sink
            .send(vec![Response::error(peer, format!("unroutable: {}", peer))])
            .await;
    }

    // Run locally, reacquiring the command lock like any other command.
    if run_local {
        let mut local_cmd = sub.clone();
        local_cmd.source = cmd.source;
        match run_commands(&daemon, local_cmd) {
            Ok(mut rx) => {
                while let Some(responses) = rx.recv().await {
                    if sink.send(responses).await.is_err() {
                        daemon.mesh.unregister_tid(tid);
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = sink.send(vec![Response::error(&host, e.to_string())]).await;
            }
        }
    }

    // Merge remote responses in arrival order until every host answered or
    // the timeout fires.
    let mut expected: HashSet<String> = targets
        .iter()
        .filter(|t| !unroutable.contains(t))
        .cloned()
        .collect();
    let deadline = tokio::time::Instant::now() + daemon.mesh_timeout();

    while !expected.is_empty() {
        match tokio::time::timeout_at(deadline, waiter.recv()).await {
            Ok(Some(envelope)) => {
                expected.remove(&envelope.source);
                match serde_json::from_value::<Responses>(envelope.body) {
                    Ok(responses) => {
                        if sink.send(responses).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(source = %envelope.source, error = %e, "undecodable responses");
                        let _ = sink
                            .send(vec![Response::error(&envelope.source, e.to_string())])
                            .await;
                    }
                }
            }
            Ok(None) => break,
            Err(_) => {
                let mut missing: Vec<String> = expected.drain().collect();
                missing.sort();
                for peer in missing {
                    let _ = sink
                        .send(vec![Response::error(
                            &peer,
                            format!("meshage timeout: {}", sub.original),
                        )])
                        .await;
                }
            }
        }
    }

    daemon.mesh.unregister_tid(tid);
}
