//! Wire messages of the demo game protocol.
//!
//! A session walks handshake → identification → game. Every message except
//! [`Chat`] is encoded with postcard; chat bodies are raw UTF-8.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tether_net::{Codec, CodecError, Message, Opcode, Role, SessionState};

/// Protocol version both sides must agree on during the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Longest accepted player name, in characters.
pub const MAX_NAME_LEN: usize = 32;

pub const OP_HANDSHAKE: Opcode = 0;
pub const OP_HANDSHAKE_ACK: Opcode = 1;
pub const OP_IDENTIFY: Opcode = 2;
pub const OP_WELCOME: Opcode = 3;
pub const OP_CHAT: Opcode = 4;
pub const OP_KICK: Opcode = 5;

// ---------------------------------------------------------------------------
// Handshake (client → server)
// ---------------------------------------------------------------------------

/// First message of every session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    pub version: u32,
}

impl Message for Handshake {
    fn required_state(&self) -> Option<SessionState> {
        Some(SessionState::ExchangeHandshake)
    }
}

/// Server accepted the handshake; the client may identify.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeAck;

impl Message for HandshakeAck {}

// ---------------------------------------------------------------------------
// Identification
// ---------------------------------------------------------------------------

/// Client picks its display name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identify {
    pub name: String,
}

impl Message for Identify {
    fn required_state(&self) -> Option<SessionState> {
        Some(SessionState::ExchangeIdentification)
    }
}

/// Identification accepted; the session is in game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
    pub player_id: u64,
}

impl Message for Welcome {}

// ---------------------------------------------------------------------------
// Game
// ---------------------------------------------------------------------------

/// A line of chat. Handled as soon as it is decoded.
///
/// Chat skips the inbound queue, so it can overtake an [`Identify`] still
/// waiting for the next tick. A client must wait for [`Welcome`] before
/// chatting, or it is disconnected for chatting outside the game state.
#[derive(Debug, Clone, PartialEq)]
pub struct Chat(pub String);

impl Message for Chat {
    fn is_async(&self) -> bool {
        true
    }

    fn required_state(&self) -> Option<SessionState> {
        Some(SessionState::Game)
    }

    fn requires_origin(&self) -> bool {
        true
    }
}

/// Sent right before the server drops a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kick {
    pub reason: String,
}

impl Message for Kick {
    fn is_async(&self) -> bool {
        true
    }
}

/// Chat bodies are the UTF-8 text itself, without a length prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChatCodec;

impl Codec<Chat> for ChatCodec {
    fn encode(&self, message: &Chat, _role: Role, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.extend_from_slice(message.0.as_bytes());
        Ok(())
    }

    fn decode(&self, body: Bytes, _role: Role) -> Result<Chat, CodecError> {
        Ok(Chat(std::str::from_utf8(&body)?.to_owned()))
    }
}
