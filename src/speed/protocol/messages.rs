//! Message set for the speed enforcement wire protocol.
//!
//! Every message is a single type byte followed by its fields in big-endian
//! byte order. Strings are length-prefixed by one byte and limited to 255
//! bytes of ASCII.

use byteorder::{BigEndian, ByteOrder};

/// Protocol violation report (Server->Client)
pub(crate) const MSG_ERROR: u8 = 0x10;

/// Number plate observation (Client->Server)
pub(crate) const MSG_PLATE: u8 = 0x20;

/// Speed violation ticket (Server->Client)
pub(crate) const MSG_TICKET: u8 = 0x21;

/// Heartbeat request (Client->Server)
pub(crate) const MSG_WANT_HEARTBEAT: u8 = 0x40;

/// Heartbeat (Server->Client)
pub(crate) const MSG_HEARTBEAT: u8 = 0x41;

/// Camera identification (Client->Server)
pub(crate) const MSG_IAM_CAMERA: u8 = 0x80;

/// Dispatcher identification (Client->Server)
pub(crate) const MSG_IAM_DISPATCHER: u8 = 0x81;

/// A complete protocol message, in either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Error {
        msg: String,
    },
    Plate {
        plate: String,
        timestamp: u32,
    },
    Ticket {
        plate: String,
        road: u16,
        mile1: u16,
        timestamp1: u32,
        mile2: u16,
        timestamp2: u32,
        speed_x100: u16,
    },
    WantHeartbeat {
        /// Interval in deciseconds; 0 requests no heartbeat.
        interval: u32,
    },
    Heartbeat,
    IAmCamera {
        road: u16,
        mile: u16,
        limit: u16,
    },
    IAmDispatcher {
        roads: Vec<u16>,
    },
}

impl Message {
    /// Wire name of the message, for error replies and logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Error { .. } => "Error",
            Message::Plate { .. } => "Plate",
            Message::Ticket { .. } => "Ticket",
            Message::WantHeartbeat { .. } => "WantHeartbeat",
            Message::Heartbeat => "Heartbeat",
            Message::IAmCamera { .. } => "IAmCamera",
            Message::IAmDispatcher { .. } => "IAmDispatcher",
        }
    }

    /// Encode the message into its wire representation.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Message::Error { msg } => {
                out.push(MSG_ERROR);
                put_str(&mut out, msg);
            }
            Message::Plate { plate, timestamp } => {
                out.push(MSG_PLATE);
                put_str(&mut out, plate);
                put_u32(&mut out, *timestamp);
            }
            Message::Ticket {
                plate,
                road,
                mile1,
                timestamp1,
                mile2,
                timestamp2,
                speed_x100,
            } => {
                out.push(MSG_TICKET);
                put_str(&mut out, plate);
                put_u16(&mut out, *road);
                put_u16(&mut out, *mile1);
                put_u32(&mut out, *timestamp1);
                put_u16(&mut out, *mile2);
                put_u32(&mut out, *timestamp2);
                put_u16(&mut out, *speed_x100);
            }
            Message::WantHeartbeat { interval } => {
                out.push(MSG_WANT_HEARTBEAT);
                put_u32(&mut out, *interval);
            }
            Message::Heartbeat => out.push(MSG_HEARTBEAT),
            Message::IAmCamera { road, mile, limit } => {
                out.push(MSG_IAM_CAMERA);
                put_u16(&mut out, *road);
                put_u16(&mut out, *mile);
                put_u16(&mut out, *limit);
            }
            Message::IAmDispatcher { roads } => {
                out.push(MSG_IAM_DISPATCHER);
                out.push(roads.len().min(u8::MAX as usize) as u8);
                for road in roads.iter().take(u8::MAX as usize) {
                    put_u16(&mut out, *road);
                }
            }
        }
        out
    }
}

fn put_u16(out: &mut Vec<u8>, value: u16) {
    let mut buf = [0u8; 2];
    BigEndian::write_u16(&mut buf, value);
    out.extend_from_slice(&buf);
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, value);
    out.extend_from_slice(&buf);
}

/// Write a length-prefixed string, truncating to the 255-byte budget.
///
/// Overlong strings keep their first 252 bytes and end in `"..."` so that
/// arbitrarily long error text stays encodable. Protocol strings are ASCII,
/// so truncation at a byte boundary is safe.
fn put_str(out: &mut Vec<u8>, s: &str) {
    const MAX: usize = u8::MAX as usize;
    let bytes = s.as_bytes();
    if bytes.len() > MAX {
        out.push(MAX as u8);
        out.extend_from_slice(&bytes[..MAX - 3]);
        out.extend_from_slice(b"...");
    } else {
        out.push(bytes.len() as u8);
        out.extend_from_slice(bytes);
    }
}
