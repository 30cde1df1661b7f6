//! The wire protocol: byte-level codec, the static packet registry and the
//! framed packet parser/serializer.

pub mod codec;
pub mod packet;
pub mod registry;

use std::fmt;

use self::codec::CodecError;

/// Protocol state of a session. The registry is keyed on it: the same id can
/// mean different payloads in different states.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum ProtocolState {
    /// Freshly accepted; handshake and login traffic only.
    Connected,
    /// Login completed; play traffic.
    Authenticated,
}

impl ProtocolState {
    #[inline]
    pub fn from_u8(value: u8) -> ProtocolState {
        match value {
            0 => ProtocolState::Connected,
            _ => ProtocolState::Authenticated,
        }
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        match self {
            ProtocolState::Connected => 0,
            ProtocolState::Authenticated => 1,
        }
    }
}

/// Direction a packet travels in.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Direction {
    Serverbound,
    Clientbound,
}

/// Errors surfaced by the packet layer. `Codec(InsufficientBytes)` never
/// escapes the parser; everything else is a protocol violation that costs the
/// peer its connection.
#[derive(Debug, PartialEq)]
pub enum ProtocolError {
    Codec(CodecError),
    /// No registry entry for the id in the current state.
    BadPacketId { state: ProtocolState, id: u32 },
}

impl From<CodecError> for ProtocolError {
    #[inline]
    fn from(err: CodecError) -> Self {
        ProtocolError::Codec(err)
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::Codec(err) => write!(f, "{}", err),
            ProtocolError::BadPacketId { state, id } => {
                write!(f, "unknown packet id {:#04x} in state {:?}", id, state)
            }
        }
    }
}

impl std::error::Error for ProtocolError {}
