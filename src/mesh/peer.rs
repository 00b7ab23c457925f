//! Framed I/O and handshake exchange for one peer connection.

use meshbox_protocol::{decode_header, Envelope, Frame, FrameKind, HandshakePayload, HEADER_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Handle to a live peer connection.
///
/// Frames pushed into `tx` are written by the connection's writer task;
/// dropping the handle closes the channel, which ends the writer and the
/// underlying socket. The reader task is aborted explicitly on hangup.
#[derive(Debug)]
pub(crate) struct PeerHandle {
    /// Remote host name (from its handshake).
    pub host: String,
    /// Outbound frame queue.
    pub tx: mpsc::Sender<Frame>,
    /// Reader task, aborted on operator hangup.
    pub reader: tokio::task::JoinHandle<()>,
    /// Writer task.
    pub writer: tokio::task::JoinHandle<()>,
}

impl Drop for PeerHandle {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Read one frame from an async stream.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let (kind, body_len) = decode_header(&header)?;

    let mut payload = vec![0u8; body_len];
    reader.read_exact(&mut payload).await?;
    Ok(Frame { kind, payload })
}

/// Write one frame to an async stream.
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    writer.write_all(&frame.serialize()).await?;
    Ok(())
}

/// Build the handshake frame a node sends on every fresh connection.
pub(crate) fn handshake_frame(host: &str, namespace: &str, port: u16) -> Result<Frame> {
    let envelope = Envelope {
        source: host.to_string(),
        recipients: Vec::new(),
        tid: 0,
        traversal: Default::default(),
        body: serde_json::to_value(HandshakePayload {
            host: host.to_string(),
            namespace: namespace.to_string(),
            port,
        })?,
    };
    Ok(Frame::from_envelope(FrameKind::Handshake, &envelope)?)
}

/// Read and decode the remote side's handshake.
pub(crate) async fn read_handshake<R: AsyncRead + Unpin>(reader: &mut R) -> Result<HandshakePayload> {
    let frame = read_frame(reader).await?;
    if frame.kind != FrameKind::Handshake {
        return Err(Error::Mesh(format!(
            "expected handshake, got {:?}",
            frame.kind
        )));
    }
    let envelope = frame.envelope()?;
    Ok(serde_json::from_value(envelope.body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_io_round_trip() {
        let frame = handshake_frame("n0", "testing", 9000).unwrap();
        let mut buf = std::io::Cursor::new(Vec::new());
        write_frame(&mut buf, &frame).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf.into_inner());
        let payload = read_handshake(&mut cursor).await.unwrap();
        assert_eq!(payload.host, "n0");
        assert_eq!(payload.namespace, "testing");
        assert_eq!(payload.port, 9000);
    }

    #[tokio::test]
    async fn non_handshake_frame_rejected() {
        let envelope = Envelope {
            source: "n0".into(),
            recipients: vec![],
            tid: 7,
            traversal: Default::default(),
            body: serde_json::Value::Null,
        };
        let frame = Frame::from_envelope(FrameKind::Msa, &envelope).unwrap();
        let mut cursor = std::io::Cursor::new(frame.serialize());
        assert!(read_handshake(&mut cursor).await.is_err());
    }
}
