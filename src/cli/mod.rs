//! Pattern-driven command engine.
//!
//! Handlers register fixed pattern templates (`vm launch kvm <name>`,
//! `mesh send <clients> (command)`, …) with the [`Registry`]. One line of
//! operator input compiles into a [`Command`] holding the matched pattern
//! and its captured arguments; the command is then uniformly executable
//! locally, over the unix control socket, over HTTP, or forwarded through
//! the mesh — a forwarded command carries only its original text and is
//! recompiled against the receiving node's registry.

pub mod pattern;
pub mod registry;
pub mod response;

pub use pattern::{Pattern, PatternItem};
pub use registry::{Handler, HandlerFn, History, Registry};
pub use response::{render, Response, Responses};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::daemon::Daemon;

/// Where a command entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CommandSource {
    /// Typed at the local TTY or issued programmatically.
    #[default]
    Local,
    /// Received over the unix control socket or HTTP.
    Socket,
    /// Forwarded by a peer through the mesh.
    Meshage,
    /// Read from a script file by the `read` handler.
    Read,
}

/// A compiled command: one input line matched against a registered pattern.
///
/// Commands are created per input and never mutated after compilation except
/// for `source` and `record`. The handler binding does not serialize; a
/// command that crossed the wire is recompiled from `original`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Command {
    /// The input text this command was compiled from.
    pub original: String,
    /// The matched pattern template.
    pub pattern: String,
    /// Field-name → single captured token.
    #[serde(default)]
    pub string_args: HashMap<String, String>,
    /// Field-name → ordered captured tokens.
    #[serde(default)]
    pub list_args: HashMap<String, Vec<String>>,
    /// Alternation words that matched.
    #[serde(default)]
    pub bool_args: HashSet<String>,
    /// Nested command captured by a `(command)` sentinel.
    #[serde(default)]
    pub subcommand: Option<Box<Command>>,
    /// Where this command entered the system.
    #[serde(default)]
    pub source: CommandSource,
    /// Whether this command should be appended to history.
    #[serde(default)]
    pub record: bool,
}

impl Command {
    /// Captured string argument by field name.
    pub fn string(&self, name: &str) -> Option<&str> {
        self.string_args.get(name).map(String::as_str)
    }

    /// Captured list argument by field name.
    pub fn list(&self, name: &str) -> &[String] {
        self.list_args.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether an alternation word matched.
    pub fn has_bool(&self, name: &str) -> bool {
        self.bool_args.contains(name)
    }
}

/// The streaming sink a handler writes response batches into.
pub type ResponseSink = mpsc::Sender<Responses>;

/// The future type every handler call returns.
pub type HandlerFuture = BoxFuture<'static, ()>;

/// Handler call signature: daemon context, the compiled command, and the
/// sink the handler streams response batches into. Closing the sink (by
/// dropping the sender) ends the command's response stream.
pub type HandlerCall =
    Arc<dyn Fn(Arc<Daemon>, Command, ResponseSink) -> HandlerFuture + Send + Sync>;
