//! Minimal QMP client for the hypervisor monitor socket.
//!
//! Covers exactly what the lifecycle handlers need: capabilities
//! negotiation on connect, then `cont` / `stop` / `quit`. Asynchronous
//! events arriving between a command and its return are discarded.

use std::path::Path;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{
    unix::{OwnedReadHalf, OwnedWriteHalf},
    UnixStream,
};
use tracing::debug;

use crate::error::{Error, Result};

/// How long to keep retrying the monitor socket after spawn.
const CONNECT_RETRIES: u32 = 20;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// One connected QMP session.
#[derive(Debug)]
pub struct Qmp {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Qmp {
    /// Connect to the monitor socket and negotiate capabilities.
    ///
    /// The hypervisor creates the socket shortly after spawn, so the
    /// connect is retried with a short backoff.
    pub async fn connect(path: &Path) -> Result<Self> {
        let mut last_err: Option<std::io::Error> = None;
        for _ in 0..CONNECT_RETRIES {
            match UnixStream::connect(path).await {
                Ok(stream) => {
                    let (read_half, write_half) = stream.into_split();
                    let mut qmp = Self {
                        reader: BufReader::new(read_half),
                        writer: write_half,
                    };
                    qmp.negotiate().await?;
                    return Ok(qmp);
                }
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(CONNECT_BACKOFF).await;
                }
            }
        }
        Err(Error::Vm(format!(
            "cannot connect to monitor {}: {}",
            path.display(),
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn negotiate(&mut self) -> Result<()> {
        // The greeting banner arrives unprompted.
        let greeting = self.read_message().await?;
        if greeting.get("QMP").is_none() {
            return Err(Error::Vm(format!(
                "unexpected monitor greeting: {}",
                greeting
            )));
        }
        self.execute("qmp_capabilities").await?;
        Ok(())
    }

    /// Run one argument-less QMP command, returning its `return` payload.
    pub async fn execute(&mut self, command: &str) -> Result<Value> {
        let request = json!({ "execute": command });
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        debug!(%command, "qmp execute");

        loop {
            let message = self.read_message().await?;
            if let Some(ret) = message.get("return") {
                return Ok(ret.clone());
            }
            if let Some(err) = message.get("error") {
                return Err(Error::Vm(format!("monitor error for {}: {}", command, err)));
            }
            // Asynchronous event; keep reading until the command returns.
            debug!(event = %message, "qmp event discarded");
        }
    }

    /// Resume guest execution.
    pub async fn cont(&mut self) -> Result<()> {
        self.execute("cont").await.map(|_| ())
    }

    /// Pause guest execution.
    pub async fn stop(&mut self) -> Result<()> {
        self.execute("stop").await.map(|_| ())
    }

    /// Ask the hypervisor to exit.
    pub async fn quit(&mut self) -> Result<()> {
        self.execute("quit").await.map(|_| ())
    }

    async fn read_message(&mut self) -> Result<Value> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(Error::Vm("monitor connection closed".into()));
        }
        Ok(serde_json::from_str(&line)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    /// A scripted monitor endpoint speaking just enough QMP.
    async fn fake_monitor(listener: UnixListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half
            .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
            .await
            .unwrap();

        let mut line = String::new();
        while reader.read_line(&mut line).await.unwrap() > 0 {
            let request: Value = serde_json::from_str(&line).unwrap();
            line.clear();
            match request["execute"].as_str() {
                Some("qmp_capabilities") | Some("cont") | Some("stop") => {
                    // An interleaved event exercises the discard path.
                    write_half
                        .write_all(b"{\"event\": \"NOISE\"}\n{\"return\": {}}\n")
                        .await
                        .unwrap();
                }
                Some("quit") => {
                    write_half.write_all(b"{\"return\": {}}\n").await.unwrap();
                    break;
                }
                other => panic!("unexpected command {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn connect_negotiate_and_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qmp.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(fake_monitor(listener));

        let mut qmp = Qmp::connect(&path).await.unwrap();
        qmp.cont().await.unwrap();
        qmp.stop().await.unwrap();
        qmp.quit().await.unwrap();

        server.await.unwrap();
    }
}
