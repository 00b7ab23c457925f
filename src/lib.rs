//! meshbox: Distributed KVM/Container Orchestrator
//!
//! Every node in a meshbox cluster runs the same daemon. Each daemon launches
//! and manages local KVM virtual machines and Linux containers, while all
//! nodes join a namespace-gated peer-to-peer overlay ("mesh") that lets an
//! operator issue a single command and have it executed locally, on a
//! selected subset of peers, or across the entire fleet, with responses
//! fanned back and merged.
//!
//! # Architecture
//!
//! - **[`cli`]**: a pattern-driven command compiler. Registered handlers
//!   declare templates like `vm launch kvm <name>`; one input line compiles
//!   to a [`cli::Command`] that is uniformly executable locally, over the
//!   unix control socket, over HTTP, or forwarded to peers.
//! - **[`mesh`]**: the self-healing overlay. Maintains a degree-bounded
//!   topology with periodic adjacency gossip and routes framed messages by
//!   unicast or broadcast, correlated by transaction ID.
//! - **[`dispatch`]**: the single entry point every frontend shares. Owns
//!   the process-wide command lock, mesh fan-out with per-host timeouts,
//!   the `read` script loop, and the TTY / unix-socket / HTTP frontends.
//! - **[`vm`]**: the polymorphic VM subsystem (KVM and container variants
//!   over one state machine) plus the per-VM instance directory layout.
//! - **[`network`]**: bridge and tap plumbing shared by both VM variants.
//!
//! # Example: compile and run a command
//!
//! ```no_run
//! use std::sync::Arc;
//! use meshbox::daemon::{Daemon, DaemonConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let daemon = Daemon::start(DaemonConfig::default()).await?;
//!     let mut stream = meshbox::dispatch::run_command_line(&daemon, "vm info")?;
//!     while let Some(responses) = stream.recv().await {
//!         for r in &responses {
//!             println!("[{}] {}", r.host, r.response);
//!         }
//!     }
//!     daemon.shutdown().await;
//!     Ok(())
//! }
//! ```

// Core modules
pub mod cli;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod mesh;
pub mod network;
pub mod vm;

// Re-exports for convenience
pub use error::{Error, Result};

// Prelude for common imports
pub mod prelude {
    pub use crate::cli::{Command, Response, Responses};
    pub use crate::daemon::{Daemon, DaemonConfig};
    pub use crate::error::{Error, Result};
}

/// Version string reported by the `version` handler.
pub const VERSION: &str = concat!("meshbox ", env!("CARGO_PKG_VERSION"));
