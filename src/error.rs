//! Error types for meshbox

use thiserror::Error;

/// Result type alias using meshbox Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in meshbox operations
#[derive(Error, Debug)]
pub enum Error {
    /// Command could not be compiled against the registered patterns
    #[error("{0}")]
    Compile(String),

    /// Handler rejected its arguments or the referenced object
    #[error("{0}")]
    Invalid(String),

    /// Mesh transport errors (routing, peering, framing)
    #[error("mesh error: {0}")]
    Mesh(String),

    /// A unicast destination has no path in the current mesh state
    #[error("unroutable: {0}")]
    Unroutable(String),

    /// VM lifecycle errors
    #[error("vm error: {0}")]
    Vm(String),

    /// Network plumbing errors (bridges, taps, netns)
    #[error("network error: {0}")]
    Network(String),

    /// Container namespace/cgroup setup errors, naming the failing step
    #[error("container setup failed at {step}: {message}")]
    ContainerSetup {
        /// First failing setup step.
        step: &'static str,
        /// Underlying failure description.
        message: String,
    },

    /// Timeout waiting for an operation
    #[error("Timeout: {0}")]
    Timeout(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Protocol wire-format errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] meshbox_protocol::ProtocolError),

    /// System call errors (Linux only — nix crate)
    #[cfg(target_os = "linux")]
    #[error("System error: {0}")]
    System(#[from] nix::Error),
}
