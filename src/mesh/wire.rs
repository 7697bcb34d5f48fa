use arrayref::array_ref;
use byteorder::{ByteOrder, LittleEndian};
use chrono::Utc;
use rkyv::{from_bytes, to_bytes, AlignedVec};
use thiserror::Error;

use crate::dispatch::{CommandFrame, CommandKind};

/// prefix | sent_at | len
pub const HEADER_LEN: usize = 1 + 8 + 4;
/// Largest archived command a node accepts.
pub const MAX_MESSAGE_LEN: u32 = 1 << 20;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("could not encode message")]
    CouldNotEncodeMessage,
    #[error("could not decode message")]
    CouldNotDecodeMessage,
    #[error("message length overflowed")]
    MessageLengthOverflowed,
    #[error("frame truncated: expected {expected} bytes, got {got}")]
    TruncatedFrame { expected: usize, got: usize },
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
}

/// Message prefix is 8 bits. The first bit is set once the frame has been
/// relayed by a node other than the root sender. The second bit is unused.
/// The last 6 bits specify the message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessagePrefix(u8);

impl MessagePrefix {
    pub fn new(forwarded: bool, msg_type: MessageType) -> Self {
        let mut prefix = 0b0000_0000;
        if forwarded {
            prefix |= 0b1000_0000;
        }
        prefix |= msg_type as u8;
        Self(prefix)
    }

    pub fn forwarded(&self) -> bool {
        self.0 & 0b1000_0000 != 0
    }

    pub fn msg_type(&self) -> Result<MessageType, Error> {
        MessageType::try_from(self.0 & 0b0011_1111)
    }

    pub fn byte(&self) -> u8 {
        self.0
    }
}

impl From<u8> for MessagePrefix {
    fn from(byte: u8) -> Self {
        Self(byte)
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Join,
    Unjoin,
    RegisterUser,
    InsertTrip,
    SearchTrip,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Join),
            1 => Ok(MessageType::Unjoin),
            2 => Ok(MessageType::RegisterUser),
            3 => Ok(MessageType::InsertTrip),
            4 => Ok(MessageType::SearchTrip),
            other => Err(Error::UnknownMessageType(other)),
        }
    }
}

impl From<&CommandKind> for MessageType {
    fn from(kind: &CommandKind) -> Self {
        match kind {
            CommandKind::Join { .. } => MessageType::Join,
            CommandKind::Unjoin { .. } => MessageType::Unjoin,
            CommandKind::RegisterUser(_) => MessageType::RegisterUser,
            CommandKind::InsertTrip(_) => MessageType::InsertTrip,
            CommandKind::SearchTrip(_) => MessageType::SearchTrip,
        }
    }
}

/// A command frame read back off the wire.
#[derive(Debug)]
pub struct Received {
    pub prefix: MessagePrefix,
    /// Microseconds since the epoch, as stamped by the sending node.
    pub sent_at: i64,
    pub frame: CommandFrame,
}

/// Encodes a command as `prefix | sent_at | len | rkyv(frame)`.
pub fn encode(frame: &CommandFrame, forwarded: bool) -> Result<Vec<u8>, Error> {
    let msg = to_bytes::<_, 1024>(frame).map_err(|_| Error::CouldNotEncodeMessage)?;
    let len = u32::try_from(msg.len())
        .ok()
        .filter(|len| *len <= MAX_MESSAGE_LEN)
        .ok_or(Error::MessageLengthOverflowed)?;
    let prefix = MessagePrefix::new(forwarded, MessageType::from(&frame.kind));

    let mut buf = Vec::with_capacity(HEADER_LEN + msg.len());
    buf.push(prefix.byte()); // 1 byte
    buf.extend_from_slice(&Utc::now().timestamp_micros().to_le_bytes()); // 8 bytes
    buf.extend_from_slice(&len.to_le_bytes()); // 4 bytes
    buf.extend_from_slice(&msg); // len bytes
    Ok(buf)
}

pub fn decode(buf: &[u8]) -> Result<Received, Error> {
    if buf.len() < HEADER_LEN {
        Err(Error::TruncatedFrame {
            expected: HEADER_LEN,
            got: buf.len(),
        })?
    }
    let header = array_ref![buf, 0, HEADER_LEN];
    let prefix = MessagePrefix::from(header[0]);
    let msg_type = prefix.msg_type()?;
    let sent_at = LittleEndian::read_i64(&header[1..9]);
    let msg_len = LittleEndian::read_u32(&header[9..]);
    if msg_len > MAX_MESSAGE_LEN {
        Err(Error::MessageLengthOverflowed)?
    }

    let end = HEADER_LEN + msg_len as usize;
    if buf.len() < end {
        Err(Error::TruncatedFrame {
            expected: end,
            got: buf.len(),
        })?
    }

    // archived data has to sit at an aligned address to be validated
    let mut aligned = AlignedVec::with_capacity(msg_len as usize);
    aligned.extend_from_slice(&buf[HEADER_LEN..end]);
    let frame: CommandFrame =
        from_bytes(&aligned).map_err(|_| Error::CouldNotDecodeMessage)?;

    // the prefix and the payload have to agree on what this is
    if MessageType::from(&frame.kind) != msg_type {
        Err(Error::CouldNotDecodeMessage)?
    }

    Ok(Received {
        prefix,
        sent_at,
        frame,
    })
}
