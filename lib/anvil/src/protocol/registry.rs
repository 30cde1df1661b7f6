//! Static packet registry: one entry per known `(state, direction, id)`
//! tuple, each with its ordered field-codec list. Unknown ids are a hash
//! miss, nothing more.

use hashbrown::HashMap;
use lazy_static::lazy_static;

use super::codec::ArrayPrefix;
use super::{Direction, ProtocolState};

/// Wire codec of one packet field.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FieldType {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    I64,
    U64,
    F32,
    F64,
    VarInt,
    Str,
    Bytes(ArrayPrefix),
}

/// Registry entry for one packet.
#[derive(Debug)]
pub struct PacketSpec {
    pub state: ProtocolState,
    pub direction: Direction,
    pub id: u32,
    pub name: &'static str,
    pub fields: &'static [FieldType],
}

/// Well-known packet ids, named per direction.
pub mod ids {
    /// Connected-state ids.
    pub mod login {
        pub const HANDSHAKE: u32 = 0x00;
        pub const ENCRYPTION_RESPONSE: u32 = 0x01;
        pub const DISCONNECT: u32 = 0x00;
        pub const ENCRYPTION_REQUEST: u32 = 0x01;
        pub const LOGIN_SUCCESS: u32 = 0x02;
    }

    /// Authenticated-state ids.
    pub mod play {
        pub const KEEP_ALIVE: u32 = 0x00;
        pub const CHAT: u32 = 0x03;
        pub const TIME_UPDATE: u32 = 0x04;
        pub const SPAWN_POSITION: u32 = 0x06;
        pub const FLYING: u32 = 0x0A;
        pub const PLAYER_POSITION: u32 = 0x0B;
        pub const POSITION_AND_LOOK: u32 = 0x0D;
        pub const CHUNK_DATA: u32 = 0x33;
        pub const MULTI_BLOCK_CHANGE: u32 = 0x34;
        pub const BLOCK_CHANGE: u32 = 0x35;
        pub const KICK: u32 = 0xFF;
    }
}

use self::FieldType::*;
use super::Direction::{Clientbound, Serverbound};
use super::ProtocolState::{Authenticated, Connected};

/// Every packet the server understands. Order is cosmetic; lookup goes
/// through the index below.
pub static PACKETS: &[PacketSpec] = &[
    // Connected, serverbound.
    PacketSpec {
        state: Connected,
        direction: Serverbound,
        id: ids::login::HANDSHAKE,
        name: "handshake",
        fields: &[VarInt, Str, Str, I32],
    },
    PacketSpec {
        state: Connected,
        direction: Serverbound,
        id: ids::login::ENCRYPTION_RESPONSE,
        name: "encryption_response",
        fields: &[Bytes(ArrayPrefix::I16), Bytes(ArrayPrefix::I16)],
    },
    // Connected, clientbound.
    PacketSpec {
        state: Connected,
        direction: Clientbound,
        id: ids::login::DISCONNECT,
        name: "disconnect",
        fields: &[Str],
    },
    PacketSpec {
        state: Connected,
        direction: Clientbound,
        id: ids::login::ENCRYPTION_REQUEST,
        name: "encryption_request",
        fields: &[Str, Bytes(ArrayPrefix::I16), Bytes(ArrayPrefix::I16)],
    },
    PacketSpec {
        state: Connected,
        direction: Clientbound,
        id: ids::login::LOGIN_SUCCESS,
        name: "login_success",
        fields: &[Str],
    },
    // Authenticated, serverbound.
    PacketSpec {
        state: Authenticated,
        direction: Serverbound,
        id: ids::play::KEEP_ALIVE,
        name: "keep_alive",
        fields: &[U64],
    },
    PacketSpec {
        state: Authenticated,
        direction: Serverbound,
        id: ids::play::CHAT,
        name: "chat",
        fields: &[Str],
    },
    PacketSpec {
        state: Authenticated,
        direction: Serverbound,
        id: ids::play::FLYING,
        name: "flying",
        fields: &[Bool],
    },
    PacketSpec {
        state: Authenticated,
        direction: Serverbound,
        id: ids::play::PLAYER_POSITION,
        name: "player_position",
        fields: &[F64, F64, F64, F64, Bool],
    },
    // Authenticated, clientbound.
    PacketSpec {
        state: Authenticated,
        direction: Clientbound,
        id: ids::play::KEEP_ALIVE,
        name: "keep_alive",
        fields: &[U64],
    },
    PacketSpec {
        state: Authenticated,
        direction: Clientbound,
        id: ids::play::CHAT,
        name: "chat",
        fields: &[Str],
    },
    PacketSpec {
        state: Authenticated,
        direction: Clientbound,
        id: ids::play::TIME_UPDATE,
        name: "time_update",
        fields: &[U64, U64],
    },
    PacketSpec {
        state: Authenticated,
        direction: Clientbound,
        id: ids::play::SPAWN_POSITION,
        name: "spawn_position",
        fields: &[I32, I32, I32],
    },
    PacketSpec {
        state: Authenticated,
        direction: Clientbound,
        id: ids::play::POSITION_AND_LOOK,
        name: "position_and_look",
        fields: &[F64, F64, F64, F64, F32, F32, Bool],
    },
    PacketSpec {
        state: Authenticated,
        direction: Clientbound,
        id: ids::play::CHUNK_DATA,
        name: "chunk_data",
        fields: &[I32, I32, Bool, U16, U16, Bytes(ArrayPrefix::I32)],
    },
    PacketSpec {
        state: Authenticated,
        direction: Clientbound,
        id: ids::play::MULTI_BLOCK_CHANGE,
        name: "multi_block_change",
        fields: &[I32, I32, I16, Bytes(ArrayPrefix::I32)],
    },
    PacketSpec {
        state: Authenticated,
        direction: Clientbound,
        id: ids::play::BLOCK_CHANGE,
        name: "block_change",
        fields: &[I32, U8, I32, VarInt, U8],
    },
    PacketSpec {
        state: Authenticated,
        direction: Clientbound,
        id: ids::play::KICK,
        name: "kick",
        fields: &[Str],
    },
];

lazy_static! {
    static ref INDEX: HashMap<(ProtocolState, Direction, u32), &'static PacketSpec> = {
        let mut index = HashMap::with_capacity(PACKETS.len());
        for spec in PACKETS {
            let displaced = index.insert((spec.state, spec.direction, spec.id), spec);
            assert!(
                displaced.is_none(),
                "duplicate packet registration {:?}/{:?}/{:#04x}",
                spec.state,
                spec.direction,
                spec.id
            );
        }
        index
    };
}

/// Looks up the spec for a tuple. `None` means protocol violation for
/// inbound traffic and programmer error for outbound.
#[inline]
pub fn lookup(state: ProtocolState, direction: Direction, id: u32) -> Option<&'static PacketSpec> {
    INDEX.get(&(state, direction, id)).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known() {
        let spec = lookup(Connected, Serverbound, ids::login::HANDSHAKE).unwrap();
        assert_eq!(spec.name, "handshake");
        assert_eq!(spec.fields.len(), 4);
    }

    #[test]
    fn test_lookup_is_state_sensitive() {
        // 0x33 exists in play but not during login.
        assert!(lookup(Authenticated, Clientbound, ids::play::CHUNK_DATA).is_some());
        assert!(lookup(Connected, Clientbound, ids::play::CHUNK_DATA).is_none());
    }

    #[test]
    fn test_lookup_is_direction_sensitive() {
        assert!(lookup(Authenticated, Clientbound, ids::play::BLOCK_CHANGE).is_some());
        assert!(lookup(Authenticated, Serverbound, ids::play::BLOCK_CHANGE).is_none());
    }

    #[test]
    fn test_unknown_id_misses() {
        assert!(lookup(Connected, Serverbound, 0x7E).is_none());
    }

    #[test]
    fn test_index_covers_table() {
        for spec in PACKETS {
            let found = lookup(spec.state, spec.direction, spec.id).unwrap();
            assert_eq!(found.name, spec.name);
        }
    }
}
