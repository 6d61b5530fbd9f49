//! Stream decoding for the speed enforcement wire protocol.
//!
//! Messages are read directly off the connection: one type byte, then the
//! fields for that type (big-endian integers, one-byte-length-prefixed
//! strings). There is no resynchronization — a short read or an unknown
//! type byte is fatal for the connection that produced it.

use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt};

use super::messages::*;

/// Errors produced while decoding a message from a stream.
#[derive(Debug)]
pub enum DecodeError {
    /// The stream ended cleanly on a message boundary.
    Closed,
    /// The stream ended or failed in the middle of a message.
    Truncated(std::io::Error),
    /// Unknown or client-illegal message type byte.
    UnknownType(u8),
    /// A string field held bytes that are not valid UTF-8.
    InvalidString,
}

impl DecodeError {
    /// Whether the peer can still be told what went wrong.
    ///
    /// Truncated or closed streams get no reply; anything else is answered
    /// with an `Error` message before the connection is dropped.
    pub fn is_reportable(&self) -> bool {
        matches!(self, DecodeError::UnknownType(_) | DecodeError::InvalidString)
    }

    fn truncated(err: std::io::Error) -> Self {
        DecodeError::Truncated(err)
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Closed => write!(f, "connection closed"),
            DecodeError::Truncated(err) => write!(f, "truncated message: {err}"),
            DecodeError::UnknownType(_) => write!(f, "message not implemented"),
            DecodeError::InvalidString => write!(f, "malformed string data"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Read one complete message from the stream.
///
/// Returns [`DecodeError::Closed`] when the peer hangs up between messages,
/// which is the one non-error way for a connection to end.
pub async fn read_message<R>(r: &mut R) -> Result<Message, DecodeError>
where
    R: AsyncRead + Unpin,
{
    let tag = match r.read_u8().await {
        Ok(tag) => tag,
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Err(DecodeError::Closed),
        Err(err) => return Err(DecodeError::Truncated(err)),
    };

    match tag {
        MSG_ERROR => {
            let msg = read_string(r).await?;
            Ok(Message::Error { msg })
        }
        MSG_PLATE => {
            let plate = read_string(r).await?;
            let timestamp = read_u32(r).await?;
            Ok(Message::Plate { plate, timestamp })
        }
        MSG_TICKET => {
            let plate = read_string(r).await?;
            let road = read_u16(r).await?;
            let mile1 = read_u16(r).await?;
            let timestamp1 = read_u32(r).await?;
            let mile2 = read_u16(r).await?;
            let timestamp2 = read_u32(r).await?;
            let speed_x100 = read_u16(r).await?;
            Ok(Message::Ticket {
                plate,
                road,
                mile1,
                timestamp1,
                mile2,
                timestamp2,
                speed_x100,
            })
        }
        MSG_WANT_HEARTBEAT => {
            let interval = read_u32(r).await?;
            Ok(Message::WantHeartbeat { interval })
        }
        MSG_HEARTBEAT => Ok(Message::Heartbeat),
        MSG_IAM_CAMERA => {
            let road = read_u16(r).await?;
            let mile = read_u16(r).await?;
            let limit = read_u16(r).await?;
            Ok(Message::IAmCamera { road, mile, limit })
        }
        MSG_IAM_DISPATCHER => {
            let numroads = r.read_u8().await.map_err(DecodeError::truncated)?;
            let mut roads = Vec::with_capacity(numroads as usize);
            for _ in 0..numroads {
                roads.push(read_u16(r).await?);
            }
            Ok(Message::IAmDispatcher { roads })
        }
        unknown => Err(DecodeError::UnknownType(unknown)),
    }
}

async fn read_u16<R: AsyncRead + Unpin>(r: &mut R) -> Result<u16, DecodeError> {
    r.read_u16().await.map_err(DecodeError::truncated)
}

async fn read_u32<R: AsyncRead + Unpin>(r: &mut R) -> Result<u32, DecodeError> {
    r.read_u32().await.map_err(DecodeError::truncated)
}

/// Read a `[length: u8][bytes: length]` string field.
async fn read_string<R: AsyncRead + Unpin>(r: &mut R) -> Result<String, DecodeError> {
    let len = r.read_u8().await.map_err(DecodeError::truncated)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await.map_err(DecodeError::truncated)?;
    String::from_utf8(buf).map_err(|_| DecodeError::InvalidString)
}
