//! Shared wire-format types for node ↔ node mesh traffic in meshbox.
//!
//! This crate is the single source of truth for the message framing used
//! between mesh peers. Both the daemon and any external tooling depend on
//! this to avoid struct duplication.
//!
//! ## Wire Format
//!
//! Every message is framed as:
//!
//! ```text
//! ┌──────────────┬───────────┬──────────────────┐
//! │ length (4 B) │ kind (1B) │ payload (N bytes) │
//! └──────────────┴───────────┴──────────────────┘
//! ```
//!
//! - **length**: `u32` little-endian, size of the payload only (not including the 5-byte header).
//! - **kind**: one byte mapping to [`FrameKind`].
//! - **payload**: JSON-encoded [`Envelope`] (empty only for future control frames).
//!
//! The envelope's `body` is an opaque JSON value: intermediate nodes route on
//! the envelope header alone and never need to understand the body.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors that can occur during frame parsing.
#[derive(Debug)]
pub enum ProtocolError {
    /// Frame buffer too short or incomplete.
    InvalidFrame(String),
    /// The kind byte does not map to a known [`FrameKind`].
    UnknownFrameKind(u8),
    /// An I/O error occurred while reading or writing.
    Io(std::io::Error),
    /// JSON (de)serialization failed.
    Json(serde_json::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidFrame(msg) => write!(f, "Invalid frame: {}", msg),
            ProtocolError::UnknownFrameKind(b) => write!(f, "Unknown frame kind: {}", b),
            ProtocolError::Io(e) => write!(f, "IO error: {}", e),
            ProtocolError::Json(e) => write!(f, "JSON error: {}", e),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Io(e)
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Json(e)
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Header size in bytes: 4 (length) + 1 (kind).
pub const HEADER_SIZE: usize = 5;

/// Hard cap on a single frame payload. A peer announcing more than this is
/// either corrupt or hostile; the connection is dropped.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// ---------------------------------------------------------------------------
// FrameKind
// ---------------------------------------------------------------------------

/// Frame kinds for mesh traffic.
///
/// The kind byte discriminates the envelope body so a node can decide how to
/// deliver a message without decoding the body payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameKind {
    /// Namespace/identity exchange, first frame in each direction on a new connection
    Handshake = 1,
    /// Mesh State Announcement (periodic adjacency gossip)
    Msa = 2,
    /// A serialized command to execute on the recipients
    Command = 3,
    /// Responses travelling back to the command's source
    Response = 4,
}

impl TryFrom<u8> for FrameKind {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            1 => Ok(FrameKind::Handshake),
            2 => Ok(FrameKind::Msa),
            3 => Ok(FrameKind::Command),
            4 => Ok(FrameKind::Response),
            _ => Err(ProtocolError::UnknownFrameKind(byte)),
        }
    }
}

// ---------------------------------------------------------------------------
// Traversal
// ---------------------------------------------------------------------------

/// How an intermediate node schedules forwarding toward multiple next hops.
///
/// Unordered and Breadth fan out concurrently; Depth walks one branch at a
/// time to bound work amplification. No mode promises cross-branch response
/// ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Traversal {
    /// No ordering; forward in arrival order
    #[default]
    Unordered,
    /// One branch at a time
    Depth,
    /// All next hops per level concurrently
    Breadth,
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Routing header plus opaque body carried by every [`Frame`].
///
/// `recipients` empty means broadcast. `tid` is a random 32-bit transaction
/// identifier chosen by the sender; responses echo it back so the origin can
/// correlate replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Origin host of the message.
    pub source: String,
    /// Destination hosts; empty means broadcast.
    pub recipients: Vec<String>,
    /// Transaction identifier for request/response correlation.
    pub tid: u32,
    /// Forwarding discipline for intermediate nodes.
    #[serde(default)]
    pub traversal: Traversal,
    /// Opaque body, interpreted according to the frame kind.
    pub body: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Frame (wire format)
// ---------------------------------------------------------------------------

/// A framed mesh message consisting of a kind byte and a payload.
///
/// Use [`Frame::serialize`] / [`Frame::deserialize`] for in-memory
/// conversion and [`Frame::read_from_sync`] for streaming from a reader.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Kind of frame.
    pub kind: FrameKind,
    /// Frame payload (JSON-encoded envelope).
    pub payload: Vec<u8>,
}

/// Split a wire header into its frame kind and declared payload length.
///
/// Rejects unknown kind bytes and payload lengths over [`MAX_FRAME_SIZE`],
/// so every decode path shares the same sanity checks.
pub fn decode_header(header: &[u8; HEADER_SIZE]) -> Result<(FrameKind, usize), ProtocolError> {
    let &[l0, l1, l2, l3, kind_byte] = header;
    let body_len = u32::from_le_bytes([l0, l1, l2, l3]) as usize;
    if body_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::InvalidFrame(format!(
            "declared payload of {} bytes exceeds the {} byte cap",
            body_len, MAX_FRAME_SIZE
        )));
    }
    let kind = FrameKind::try_from(kind_byte)?;
    Ok((kind, body_len))
}

impl Frame {
    /// Build a frame around an envelope.
    pub fn from_envelope(kind: FrameKind, envelope: &Envelope) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind,
            payload: serde_json::to_vec(envelope)?,
        })
    }

    /// Decode the payload back into an envelope.
    pub fn envelope(&self) -> Result<Envelope, ProtocolError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Serialize this frame into a byte buffer (header + payload).
    pub fn serialize(&self) -> Vec<u8> {
        let mut wire = vec![0u8; HEADER_SIZE + self.payload.len()];
        let (header, body) = wire.split_at_mut(HEADER_SIZE);
        header[..4].copy_from_slice(&(self.payload.len() as u32).to_le_bytes());
        header[4] = self.kind as u8;
        body.copy_from_slice(&self.payload);
        wire
    }

    /// Deserialize a frame from a contiguous byte slice.
    pub fn deserialize(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::InvalidFrame(format!(
                "{} bytes is shorter than a frame header",
                data.len()
            )));
        }
        let (header, body) = data.split_at(HEADER_SIZE);
        let mut fixed = [0u8; HEADER_SIZE];
        fixed.copy_from_slice(header);
        let (kind, body_len) = decode_header(&fixed)?;

        match body.get(..body_len) {
            Some(payload) => Ok(Self {
                kind,
                payload: payload.to_vec(),
            }),
            None => Err(ProtocolError::InvalidFrame(format!(
                "payload truncated: header declares {} bytes, {} present",
                body_len,
                body.len()
            ))),
        }
    }

    /// Read a complete frame from a synchronous [`std::io::Read`] stream.
    pub fn read_from_sync<R: std::io::Read>(reader: &mut R) -> Result<Self, ProtocolError> {
        use std::io::Read;

        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header)?;
        let (kind, body_len) = decode_header(&header)?;

        let mut payload = Vec::with_capacity(body_len);
        reader.by_ref().take(body_len as u64).read_to_end(&mut payload)?;
        if payload.len() != body_len {
            return Err(ProtocolError::InvalidFrame(format!(
                "stream ended {} bytes into a {} byte payload",
                payload.len(),
                body_len
            )));
        }
        Ok(Self { kind, payload })
    }
}

// ---------------------------------------------------------------------------
// Data types: Handshake
// ---------------------------------------------------------------------------

/// First envelope body exchanged in each direction on a fresh peer
/// connection. Nodes whose namespaces differ refuse the connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakePayload {
    /// Hostname of the connecting node.
    pub host: String,
    /// Mesh namespace label; only matching nodes peer.
    pub namespace: String,
    /// Mesh listen port of the connecting node, so it can be re-dialed.
    pub port: u16,
}

// ---------------------------------------------------------------------------
// Data types: MSA
// ---------------------------------------------------------------------------

/// Mesh State Announcement: one node's view of its own adjacency.
///
/// `epoch` increases monotonically per origin; receivers use it to flood
/// each announcement at most once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsaPayload {
    /// Current neighbors of the announcing node.
    pub neighbors: Vec<String>,
    /// Monotonic announcement counter of the origin.
    pub epoch: u64,
}

// ---------------------------------------------------------------------------
// Data types: Command
// ---------------------------------------------------------------------------

/// A command forwarded through the mesh.
///
/// Only the original text and the record flag cross the wire; the receiving
/// node recompiles the text against its own handler registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPayload {
    /// Original command line as typed at the source.
    pub original: String,
    /// Whether the command should be recorded in history at the executor.
    pub record: bool,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
