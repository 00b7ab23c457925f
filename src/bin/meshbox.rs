//! meshbox daemon and client entry point.
//!
//! Usage:
//!   meshbox                          run a daemon with an interactive TTY
//!   meshbox --nostdin                run headless (socket/HTTP/mesh only)
//!   meshbox -e "vm info"             run one command on a running daemon
//!   meshbox --attach                 attach a TTY to a running daemon
//!
//! The binary doubles as the container shim: when re-exec'd with the
//! `container-shim` sentinel it performs in-namespace setup instead of
//! starting a daemon.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::error;

use meshbox::daemon::{Daemon, DaemonConfig};
use meshbox::dispatch::{http, socket, tty};

#[derive(Debug, Parser)]
#[command(name = "meshbox", version, about = "distributed VM/container orchestrator")]
struct Args {
    /// Base directory for per-VM and per-node state.
    #[arg(long, default_value = "/tmp/meshbox")]
    base: PathBuf,

    /// Mesh namespace; only nodes sharing a namespace connect.
    #[arg(long, default_value = "meshbox")]
    namespace: String,

    /// Target mesh degree; 0 disables autonomous dialing.
    #[arg(long, default_value_t = 0)]
    degree: u32,

    /// Mesh TCP port.
    #[arg(long, default_value_t = 9000)]
    port: u16,

    /// Mesh State Announcement period in seconds.
    #[arg(long, default_value_t = 10)]
    msa_timeout: u64,

    /// Run a single command on a running daemon and exit.
    #[arg(short = 'e', long = "exec", value_name = "COMMAND")]
    exec: Option<String>,

    /// Attach an interactive session to a running daemon.
    #[arg(long)]
    attach: bool,

    /// Disable the interactive TTY (daemon mode).
    #[arg(long)]
    nostdin: bool,

    /// Serve the HTTP frontend on this address.
    #[arg(long, value_name = "ADDR")]
    http: Option<SocketAddr>,

    /// Log filter (tracing EnvFilter syntax).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also log to this file.
    #[arg(long)]
    logfile: Option<PathBuf>,
}

fn main() -> ExitCode {
    // Container shim re-exec path: must run before any runtime spins up,
    // because this process is pid 1 of a fresh PID namespace.
    #[cfg(target_os = "linux")]
    {
        let argv: Vec<String> = std::env::args().collect();
        if argv.get(1).map(String::as_str) == Some("container-shim") {
            let instance = argv.get(2).cloned().unwrap_or_default();
            meshbox::vm::container::shim_main(&instance);
        }
    }

    let args = Args::parse();
    let _log_guard = init_logging(&args);
    run(args)
}

fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&args.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match &args.logfile {
        Some(path) => {
            let file = tracing_appender::rolling::never(
                path.parent().unwrap_or_else(|| std::path::Path::new(".")),
                path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("meshbox.log")),
            );
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn run(args: Args) -> ExitCode {
    let socket_path = args.base.join("meshbox.sock");

    // Client modes talk to a running daemon over its control socket.
    if let Some(command) = &args.exec {
        return match socket::run_remote(&socket_path, command).await {
            Ok(output) => {
                print!("{}", output);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("meshbox: {}", e);
                ExitCode::FAILURE
            }
        };
    }
    if args.attach {
        return match socket::attach(&socket_path).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("meshbox: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    let config = DaemonConfig {
        base: args.base.clone(),
        hostname: None,
        namespace: args.namespace.clone(),
        degree: args.degree,
        port: args.port,
        mesh_bind: None,
        msa_period: Duration::from_secs(args.msa_timeout.max(1)),
        ..Default::default()
    };

    let daemon = match Daemon::start(config).await {
        Ok(daemon) => daemon,
        Err(e) => {
            eprintln!("meshbox: fatal: {}", e);
            return ExitCode::FAILURE;
        }
    };

    {
        let daemon = daemon.clone();
        tokio::spawn(async move {
            if let Err(e) = socket::serve(daemon).await {
                error!(error = %e, "control socket failed");
            }
        });
    }
    if let Some(addr) = args.http {
        let daemon = daemon.clone();
        tokio::spawn(async move {
            if let Err(e) = http::serve(daemon, addr).await {
                error!(error = %e, "http frontend failed");
            }
        });
    }

    spawn_signal_task(daemon.clone());

    if args.nostdin {
        let mut shutdown = daemon.shutdown_signal();
        let _ = shutdown.changed().await;
    } else if let Err(e) = tty::run(daemon.clone()).await {
        error!(error = %e, "tty frontend failed");
    }

    daemon.shutdown().await;
    ExitCode::SUCCESS
}

/// First SIGINT/SIGTERM begins graceful teardown; a second forces exit.
fn spawn_signal_task(daemon: Arc<Daemon>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let Ok(mut interrupt) = signal(SignalKind::interrupt()) else { return };
        let Ok(mut terminate) = signal(SignalKind::terminate()) else { return };

        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        tracing::info!("signal received, shutting down (again to force)");
        daemon.begin_shutdown();

        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        eprintln!("meshbox: forced exit");
        std::process::exit(1);
    });
}
