//! Unix-socket control channel: the RPC frontend and its client half.
//!
//! The connection carries a stream of JSON values with no framing — values
//! are decoded one at a time as bytes arrive. Requests carry either a
//! command or a completion request; command responses stream back one batch
//! per value with `More=true` until a terminating `More=false` value.
//!
//! The command's handler binding cannot cross the wire, so the server
//! recompiles `Command.Original` against its own registry on receipt.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info};

use crate::cli::{render, Command, CommandSource, Response, Responses};
use crate::daemon::Daemon;
use crate::dispatch::run_commands;
use crate::error::{Error, Result};

/// One request value sent by a client.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Request {
    /// A command to execute; only `Original` matters to the server.
    #[serde(rename = "Command", default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Command>,
    /// A partial line to complete.
    #[serde(rename = "Suggest", default, skip_serializing_if = "Option::is_none")]
    pub suggest: Option<String>,
}

/// One response value streamed back by the server.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Reply {
    /// One batch of responses.
    #[serde(rename = "Resp", default)]
    pub resp: Responses,
    /// The batch rendered for a terminal.
    #[serde(rename = "Rendered", default)]
    pub rendered: String,
    /// True on every value except the stream's last.
    #[serde(rename = "More")]
    pub more: bool,
    /// Completion candidates (suggest requests).
    #[serde(rename = "Suggest", default, skip_serializing_if = "Vec::is_empty")]
    pub suggest: Vec<String>,
}

/// Incremental JSON-value reader over a byte stream.
struct ValueReader {
    buf: Vec<u8>,
}

impl ValueReader {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Decode the next complete JSON value, reading more bytes as needed.
    /// Returns `None` on clean EOF between values.
    async fn next<T: serde::de::DeserializeOwned, R: AsyncReadExt + Unpin>(
        &mut self,
        reader: &mut R,
    ) -> Result<Option<T>> {
        loop {
            // Try to pull one value off the front of the buffer.
            let mut iter = serde_json::Deserializer::from_slice(&self.buf).into_iter::<T>();
            match iter.next() {
                Some(Ok(value)) => {
                    let consumed = iter.byte_offset();
                    self.buf.drain(..consumed);
                    return Ok(Some(value));
                }
                Some(Err(e)) if e.is_eof() => {}
                Some(Err(e)) => return Err(Error::Serde(e)),
                None => {}
            }

            let mut chunk = [0u8; 4096];
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                if self.buf.iter().all(|b| b.is_ascii_whitespace()) {
                    return Ok(None);
                }
                return Err(Error::Invalid("connection closed mid-value".into()));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

async fn write_value<T: Serialize, W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    writer.write_all(&bytes).await?;
    Ok(())
}

/// Serve the control socket until shutdown.
pub async fn serve(daemon: Arc<Daemon>) -> Result<()> {
    let path = daemon.socket_path();
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)
        .map_err(|e| Error::Io(std::io::Error::new(e.kind(), format!(
            "cannot bind control socket {}: {}",
            path.display(),
            e
        ))))?;
    info!(path = %path.display(), "control socket up");

    let mut shutdown = daemon.shutdown_signal();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { break };
                let daemon = daemon.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(daemon, stream).await {
                        debug!(error = %e, "control connection ended");
                    }
                });
            }
            _ = shutdown.changed() => break,
        }
    }
    Ok(())
}

async fn serve_connection(daemon: Arc<Daemon>, stream: UnixStream) -> Result<()> {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut values = ValueReader::new();

    while let Some(request) = values.next::<Request, _>(&mut read_half).await? {
        if let Some(partial) = request.suggest {
            let reply = Reply {
                suggest: daemon.registry.suggest(&partial),
                more: false,
                ..Default::default()
            };
            write_value(&mut write_half, &reply).await?;
            continue;
        }

        let Some(command) = request.command else {
            continue;
        };

        // Reattach the handler by recompiling the original text.
        match daemon.registry.compile(&command.original) {
            Ok(Some(mut cmd)) => {
                cmd.source = CommandSource::Socket;
                match run_commands(&daemon, cmd) {
                    Ok(mut rx) => {
                        while let Some(responses) = rx.recv().await {
                            let reply = Reply {
                                rendered: render(&responses),
                                resp: responses,
                                more: true,
                                ..Default::default()
                            };
                            write_value(&mut write_half, &reply).await?;
                        }
                    }
                    Err(e) => {
                        let responses = vec![Response::error(&daemon.hostname, e.to_string())];
                        let reply = Reply {
                            rendered: render(&responses),
                            resp: responses,
                            more: true,
                            ..Default::default()
                        };
                        write_value(&mut write_half, &reply).await?;
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                let responses = vec![Response::error(&daemon.hostname, e.to_string())];
                let reply = Reply {
                    rendered: render(&responses),
                    resp: responses,
                    more: true,
                    ..Default::default()
                };
                write_value(&mut write_half, &reply).await?;
            }
        }

        // Terminator: More=false ends this command's stream.
        write_value(&mut write_half, &Reply { more: false, ..Default::default() }).await?;
    }
    Ok(())
}

/// Client half: run one command on a running daemon (`-e`).
///
/// Returns the concatenated rendered output.
pub async fn run_remote(socket: &Path, line: &str) -> Result<String> {
    let stream = connect(socket).await?;
    let (mut read_half, mut write_half) = stream.into_split();

    let request = Request {
        command: Some(Command {
            original: line.to_string(),
            ..Default::default()
        }),
        suggest: None,
    };
    write_value(&mut write_half, &request).await?;

    let mut values = ValueReader::new();
    let mut output = String::new();
    while let Some(reply) = values.next::<Reply, _>(&mut read_half).await? {
        output.push_str(&reply.rendered);
        if !reply.more {
            break;
        }
    }
    Ok(output)
}

/// Client half: interactive attach (`--attach`): send stdin lines, print
/// rendered replies until EOF.
pub async fn attach(socket: &Path) -> Result<()> {
    use tokio::io::{stdin, stdout, AsyncBufReadExt, BufReader};

    let stream = connect(socket).await?;
    let (mut read_half, mut write_half) = stream.into_split();
    let mut values = ValueReader::new();

    let mut lines = BufReader::new(stdin()).lines();
    let mut out = stdout();

    loop {
        out.write_all(b"meshbox: ").await?;
        out.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let request = Request {
            command: Some(Command {
                original: line.clone(),
                ..Default::default()
            }),
            suggest: None,
        };
        write_value(&mut write_half, &request).await?;

        while let Some(reply) = values.next::<Reply, _>(&mut read_half).await? {
            out.write_all(reply.rendered.as_bytes()).await?;
            if !reply.more {
                break;
            }
        }
        out.flush().await?;
    }
    Ok(())
}

async fn connect(socket: &Path) -> Result<UnixStream> {
    UnixStream::connect(socket).await.map_err(|e| {
        Error::Invalid(format!(
            "cannot connect to {} (is the daemon running?): {}",
            socket.display(),
            e
        ))
    })
}
