// Length-delimited framing for the relay link.
//
// Wire format: a 4-byte big-endian length, then that many payload bytes. The
// payload of every link frame is one JSON-encoded `NodeMessage` or
// `RelayMessage`, but `write_frame`/`read_frame` stay format-agnostic; the
// `encode`/`decode` helpers add the JSON step.
//
// Decoding is deliberately separate from reading. A frame that was read in
// full but does not decode leaves the stream aligned on the next frame, so the
// caller can drop that one message and keep the link. An I/O error or an
// oversized length prefix means the stream is no longer usable.

use std::io::{self, Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Largest accepted frame (16 MiB). Property snapshots sent to a newly
/// connected node are the largest payloads in practice.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("frame too large: {len} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge { len: u64 },
    #[error("could not encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("could not decode message: {0}")]
    Decode(#[source] serde_json::Error),
}

impl FrameError {
    /// True when the underlying stream can no longer be trusted to be on a
    /// frame boundary.
    pub fn is_transport(&self) -> bool {
        matches!(self, FrameError::Io(_) | FrameError::TooLarge { .. })
    }
}

/// Write one frame and flush.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or(FrameError::TooLarge {
            len: payload.len() as u64,
        })?;
    let len_bytes = len.to_be_bytes();
    writer.write_all(&len_bytes)?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame. A stream closed before or inside a frame surfaces as
/// `FrameError::Io` with kind `UnexpectedEof`.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            len: u64::from(len),
        });
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// JSON-encode a message into frame payload bytes.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, FrameError> {
    serde_json::to_vec(message).map_err(FrameError::Encode)
}

/// Decode frame payload bytes into a message.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, FrameError> {
    serde_json::from_slice(payload).map_err(FrameError::Decode)
}

/// Encode and write a message as one frame.
pub fn send_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), FrameError> {
    let payload = encode(message)?;
    write_frame(writer, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{NodeMessage, RelayMessage};
    use crate::types::ServerId;
    use std::io::Cursor;

    #[test]
    fn frames_read_back_in_order() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"first").unwrap();
        write_frame(&mut buf, b"").unwrap();
        write_frame(&mut buf, b"third").unwrap();

        let mut cursor = Cursor::new(&buf);
        assert_eq!(read_frame(&mut cursor).unwrap(), b"first");
        assert_eq!(read_frame(&mut cursor).unwrap(), b"");
        assert_eq!(read_frame(&mut cursor).unwrap(), b"third");
    }

    #[test]
    fn oversized_write_is_rejected_before_touching_the_stream() {
        let big = vec![0u8; MAX_FRAME_SIZE as usize + 1];
        let mut buf = Vec::new();
        let err = write_frame(&mut buf, &big).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_length_prefix_is_a_transport_error() {
        let mut cursor = Cursor::new((MAX_FRAME_SIZE + 1).to_be_bytes().to_vec());
        let err = read_frame(&mut cursor).unwrap_err();
        assert!(err.is_transport());
    }

    #[test]
    fn truncated_frame_is_unexpected_eof() {
        let mut buf = 10u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"abc");
        let mut cursor = Cursor::new(buf);
        match read_frame(&mut cursor).unwrap_err() {
            FrameError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected Io, got {other:?}"),
        }
    }

    #[test]
    fn undecodable_frame_leaves_stream_aligned() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"{not json").unwrap();
        send_message(&mut buf, &RelayMessage::ServerConnected {
            server: ServerId::new("b"),
        })
        .unwrap();

        let mut cursor = Cursor::new(&buf);
        let garbage = read_frame(&mut cursor).unwrap();
        let err = decode::<RelayMessage>(&garbage).unwrap_err();
        assert!(!err.is_transport());

        let next = read_frame(&mut cursor).unwrap();
        assert_eq!(
            decode::<RelayMessage>(&next).unwrap(),
            RelayMessage::ServerConnected {
                server: ServerId::new("b")
            }
        );
    }

    #[test]
    fn node_message_survives_the_wire() {
        let msg = NodeMessage::Data {
            channel: "GlobalClient.playerProperties".into(),
            target_player: None,
            target_server: Some(ServerId::new("lobby")),
            payload: vec![1, 0, 255],
        };
        let mut buf = Vec::new();
        send_message(&mut buf, &msg).unwrap();
        let bytes = read_frame(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(decode::<NodeMessage>(&bytes).unwrap(), msg);
    }
}
