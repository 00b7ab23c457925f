//! Interactive TTY frontend: prompt, compile, run, render.
//!
//! Signal handling lives in the binary: the first SIGINT/SIGTERM begins
//! orderly teardown (which flips the daemon's shutdown signal and ends this
//! loop); a second forces exit.

use std::sync::Arc;

use tokio::io::{stdin, stdout, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::daemon::Daemon;
use crate::dispatch::run_and_render;
use crate::error::Result;

const PROMPT: &[u8] = b"meshbox$ ";

/// Run the prompt loop until EOF or shutdown.
pub async fn run(daemon: Arc<Daemon>) -> Result<()> {
    let mut lines = BufReader::new(stdin()).lines();
    let mut out = stdout();
    let mut shutdown = daemon.shutdown_signal();

    loop {
        out.write_all(PROMPT).await?;
        out.flush().await?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = shutdown.changed() => break,
        };
        let Some(line) = line else {
            // EOF: the operator closed stdin; wind the daemon down.
            debug!("tty eof");
            daemon.begin_shutdown();
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let rendered = run_and_render(&daemon, &line).await;
        out.write_all(rendered.as_bytes()).await?;
        out.flush().await?;
    }
    Ok(())
}
