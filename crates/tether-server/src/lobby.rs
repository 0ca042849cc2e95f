//! Session handlers of the demo server and the protocol that wires them up.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use tether_net::{
    Connection, ConnectionManager, HandlerError, PostcardCodec, Protocol, RegistrationError,
    SessionState,
};

use crate::messages::{
    Chat, ChatCodec, Handshake, HandshakeAck, Identify, Kick, MAX_NAME_LEN, OP_CHAT, OP_HANDSHAKE,
    OP_HANDSHAKE_ACK, OP_IDENTIFY, OP_KICK, OP_WELCOME, PROTOCOL_VERSION, Welcome,
};

/// Attached to a connection once it has identified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Player {
    pub id: u64,
    pub name: String,
}

/// Shared state of the running server, reachable from handlers.
///
/// The manager is attached after the protocol is built, since the manager
/// itself needs the protocol.
#[derive(Debug, Default)]
pub struct Lobby {
    manager: OnceLock<Weak<ConnectionManager>>,
    next_player_id: AtomicU64,
}

impl Lobby {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route broadcasts through `manager`. Only the first call has an effect.
    pub fn attach(&self, manager: &Arc<ConnectionManager>) {
        if self.manager.set(Arc::downgrade(manager)).is_err() {
            tracing::warn!("Lobby already attached to a manager");
        }
    }

    fn manager(&self) -> Option<Arc<ConnectionManager>> {
        self.manager.get().and_then(Weak::upgrade)
    }

    fn allocate_player_id(&self) -> u64 {
        self.next_player_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn on_handshake(&self, connection: &Connection, handshake: &Handshake) -> Result<(), HandlerError> {
        if handshake.version != PROTOCOL_VERSION {
            return Err(HandlerError::rejected(format!(
                "unsupported protocol version {}, expected {PROTOCOL_VERSION}",
                handshake.version
            )));
        }

        connection.send(HandshakeAck)?;
        connection.set_state(SessionState::ExchangeIdentification);
        Ok(())
    }

    fn on_identify(&self, connection: &Connection, identify: &Identify) -> Result<(), HandlerError> {
        let name = identify.name.trim();
        if name.is_empty() {
            return Err(HandlerError::rejected("empty player name"));
        }
        if name.chars().count() > MAX_NAME_LEN {
            return Err(HandlerError::rejected(format!(
                "player name longer than {MAX_NAME_LEN} characters"
            )));
        }

        let player = Player {
            id: self.allocate_player_id(),
            name: name.to_owned(),
        };
        let player_id = player.id;
        tracing::info!(
            "Connection {} identified as {} (player {player_id})",
            connection.id(),
            player.name
        );

        connection
            .set_attachment(player)
            .map_err(|e| HandlerError::Other(Box::new(e)))?;
        connection.send(Welcome { player_id })?;
        connection.set_state(SessionState::Game);
        Ok(())
    }

    fn on_chat(&self, connection: &Connection, chat: &Chat) -> Result<(), HandlerError> {
        let Some(player) = connection.attachment_as::<Player>() else {
            return Err(HandlerError::rejected("chat from a connection without a player"));
        };

        let text = chat.0.trim();
        if text.is_empty() {
            return Ok(());
        }

        let Some(manager) = self.manager() else {
            tracing::debug!("Chat from {} dropped, no manager attached", player.name);
            return Ok(());
        };
        let recipients = manager.broadcast(Chat(format!("{}: {text}", player.name)))?;
        tracing::trace!("Chat from {} sent to {recipients} connections", player.name);
        Ok(())
    }
}

/// Build the demo protocol with an opcode table of `capacity` slots.
pub fn build_protocol(lobby: Arc<Lobby>, capacity: usize) -> Result<Protocol, RegistrationError> {
    let mut protocol = Protocol::with_capacity(capacity);

    protocol.register_codec::<Handshake, _>(OP_HANDSHAKE, PostcardCodec::new())?;
    protocol.register_codec::<HandshakeAck, _>(OP_HANDSHAKE_ACK, PostcardCodec::new())?;
    protocol.register_codec::<Identify, _>(OP_IDENTIFY, PostcardCodec::new())?;
    protocol.register_codec::<Welcome, _>(OP_WELCOME, PostcardCodec::new())?;
    protocol.register_codec::<Chat, _>(OP_CHAT, ChatCodec)?;
    protocol.register_codec::<Kick, _>(OP_KICK, PostcardCodec::new())?;

    let handshake = Arc::clone(&lobby);
    protocol.register_handler::<Handshake, _>(move |connection: &Connection, message: &Handshake| {
        handshake.on_handshake(connection, message)
    })?;

    let identify = Arc::clone(&lobby);
    protocol.register_handler::<Identify, _>(move |connection: &Connection, message: &Identify| {
        identify.on_identify(connection, message)
    })?;

    protocol.register_handler::<Chat, _>(move |connection: &Connection, message: &Chat| {
        lobby.on_chat(connection, message)
    })?;

    Ok(protocol.with_kick_message(|reason| Kick {
        reason: reason.to_owned(),
    }))
}
