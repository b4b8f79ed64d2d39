//! Length-prefixed binary framing over one TCP connection.
//!
//! Wire layout, all fields big-endian:
//!
//! ```text
//! +-----------+---------------+-------------+-----------------+
//! | size: u32 | protoCode: u16| msgCode: u16|     payload     |
//! |  4 bytes  |    2 bytes    |   2 bytes   |   `size` bytes  |
//! +-----------+---------------+-------------+-----------------+
//! ```
//!
//! There is no framing checksum; corruption shows up as a parse or
//! deadline error on a later frame and terminates the peer. A connection
//! is split into an owned read half (driven by exactly one reader task)
//! and an owned write half (serialized behind the peer's write lock).

use crate::config::ConnConfig;
use crate::error::{NetworkError, NetworkResult};
use crate::message::CTL_PROTO_CODE;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

/// Frame header length in bytes.
pub const HEADER_LEN: usize = 8;

/// One length-prefixed record on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Protocol code: 1 for control, negotiated codes from 2 up.
    pub proto_code: u16,
    /// Message code, application-defined outside the control channel.
    pub msg_code: u16,
    /// Payload bytes. May be empty.
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame for a negotiated protocol code.
    pub fn new(proto_code: u16, msg_code: u16, payload: Bytes) -> Self {
        Self {
            proto_code,
            msg_code,
            payload,
        }
    }

    /// Build a payload-free control frame.
    pub fn control(msg_code: u16) -> Self {
        Self::new(CTL_PROTO_CODE, msg_code, Bytes::new())
    }

    /// Build a control frame carrying a payload.
    pub fn control_with(msg_code: u16, payload: Bytes) -> Self {
        Self::new(CTL_PROTO_CODE, msg_code, payload)
    }
}

/// Split a connected stream into framed read and write halves.
pub fn split_stream(stream: TcpStream, config: &ConnConfig) -> (FrameReader, FrameWriter) {
    let (read, write) = stream.into_split();
    (
        FrameReader {
            half: read,
            config: config.clone(),
        },
        FrameWriter {
            half: write,
            config: config.clone(),
        },
    )
}

/// Read side of a framed connection. Never shared between tasks.
pub struct FrameReader {
    half: OwnedReadHalf,
    config: ConnConfig,
}

impl FrameReader {
    /// Receive one frame, bounded by the read deadline for the header and
    /// again for the payload. A short read or an elapsed deadline fails
    /// the call and the connection is considered broken.
    pub async fn recv_frame(&mut self) -> NetworkResult<Frame> {
        let mut head = [0u8; HEADER_LEN];
        timeout(self.config.read_timeout, self.half.read_exact(&mut head))
            .await
            .map_err(|_| NetworkError::Timeout("frame header read"))??;

        let size = u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as usize;
        let proto_code = u16::from_be_bytes([head[4], head[5]]);
        let msg_code = u16::from_be_bytes([head[6], head[7]]);

        if size > self.config.max_payload {
            return Err(NetworkError::FrameTooLarge {
                size,
                max: self.config.max_payload,
            });
        }

        let mut payload = vec![0u8; size];
        if size > 0 {
            timeout(self.config.read_timeout, self.half.read_exact(&mut payload))
                .await
                .map_err(|_| NetworkError::Timeout("frame payload read"))??;
        }

        trace!(proto_code, msg_code, size, "recv frame");
        Ok(Frame {
            proto_code,
            msg_code,
            payload: payload.into(),
        })
    }
}

/// Write side of a framed connection. Callers serialize access through
/// the peer's write lock.
pub struct FrameWriter {
    half: OwnedWriteHalf,
    config: ConnConfig,
}

impl FrameWriter {
    /// Send one frame, header and payload, bounded by the write deadline.
    /// On failure the connection is considered broken.
    pub async fn send_frame(&mut self, frame: &Frame) -> NetworkResult<()> {
        let size = frame.payload.len();
        if size > self.config.max_payload {
            return Err(NetworkError::FrameTooLarge {
                size,
                max: self.config.max_payload,
            });
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + size);
        buf.put_u32(size as u32);
        buf.put_u16(frame.proto_code);
        buf.put_u16(frame.msg_code);
        buf.put_slice(&frame.payload);

        timeout(self.config.write_timeout, async {
            self.half.write_all(&buf).await?;
            self.half.flush().await
        })
        .await
        .map_err(|_| NetworkError::Timeout("frame write"))??;

        trace!(
            proto_code = frame.proto_code,
            msg_code = frame.msg_code,
            size,
            "sent frame"
        );
        Ok(())
    }

    /// Close the write direction of the connection.
    pub async fn shutdown(&mut self) {
        let _ = self.half.shutdown().await;
    }
}
