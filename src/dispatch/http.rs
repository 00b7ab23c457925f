//! HTTP frontend: `POST /command` with `{"command": "<text>"}`.
//!
//! All responses are collected before replying (no streaming); the body is
//! a JSON array of Responses. Any other method gets a 405. The server is a
//! minimal hand-rolled HTTP/1.1 responder over a `TcpListener`.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::cli::Response;
use crate::daemon::Daemon;
use crate::dispatch::{collect, run_command_line};
use crate::error::Result;

#[derive(Debug, Deserialize)]
struct CommandRequest {
    command: String,
}

/// Bind `addr` and serve HTTP until shutdown.
pub async fn serve(daemon: Arc<Daemon>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_on(daemon, listener).await
}

/// Serve HTTP on an already-bound listener until shutdown.
pub async fn serve_on(daemon: Arc<Daemon>, listener: TcpListener) -> Result<()> {
    info!(addr = ?listener.local_addr(), "http frontend up");

    let mut shutdown = daemon.shutdown_signal();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((stream, peer)) = accepted else { break };
                let daemon = daemon.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_stream(daemon, stream).await {
                        debug!(%peer, error = %e, "http connection error");
                    }
                });
            }
            _ = shutdown.changed() => break,
        }
    }
    Ok(())
}

async fn handle_stream(daemon: Arc<Daemon>, mut stream: TcpStream) -> Result<()> {
    let mut buf = vec![0u8; 64 * 1024];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Ok(());
    }

    let req = String::from_utf8_lossy(&buf[..n]).to_string();
    let request_line = req.lines().next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");

    let body = match req.find("\r\n\r\n") {
        Some(idx) => &req[idx + 4..],
        None => "",
    };

    let (status, payload) = route_request(&daemon, method, path, body).await;
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        payload.len(),
        payload
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

async fn route_request(
    daemon: &Arc<Daemon>,
    method: &str,
    path: &str,
    body: &str,
) -> (String, String) {
    if path != "/command" {
        return (
            "404 Not Found".to_string(),
            error_payload(daemon, "no such route"),
        );
    }
    if method != "POST" {
        return (
            "405 Method Not Allowed".to_string(),
            error_payload(daemon, "only POST is supported"),
        );
    }

    let request: CommandRequest = match serde_json::from_str(body) {
        Ok(request) => request,
        Err(e) => {
            return (
                "400 Bad Request".to_string(),
                error_payload(daemon, &format!("bad request body: {}", e)),
            )
        }
    };

    let responses = match run_command_line(daemon, &request.command) {
        Ok(rx) => collect(rx).await,
        Err(e) => vec![Response::error(&daemon.hostname, e.to_string())],
    };
    let payload = serde_json::to_string(&responses).unwrap_or_else(|_| "[]".into());
    ("200 OK".to_string(), payload)
}

fn error_payload(daemon: &Arc<Daemon>, message: &str) -> String {
    serde_json::to_string(&[Response::error(&daemon.hostname, message)])
        .unwrap_or_else(|_| "[]".into())
}
