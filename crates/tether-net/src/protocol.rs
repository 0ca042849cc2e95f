//! The protocol definition shared by every connection: codecs, handlers and
//! the optional kick message sent on disconnect.

use std::sync::Arc;

use crate::codec::{Codec, CodecRegistry, Opcode};
use crate::error::RegistrationError;
use crate::handler::{HandlerRegistry, MessageHandler};
use crate::message::{Message, MessageRef, MessageType};

type KickFactory = Box<dyn Fn(&str) -> MessageRef + Send + Sync>;

/// Codec and handler tables plus the disconnect notice.
///
/// Built once at startup, then shared read-only as `Arc<Protocol>` by every
/// connection and frame codec.
pub struct Protocol {
    codecs: CodecRegistry,
    handlers: HandlerRegistry,
    kick: Option<KickFactory>,
}

impl Protocol {
    /// An empty protocol covering the whole opcode space.
    pub fn new() -> Self {
        Self::from_parts(CodecRegistry::new(), HandlerRegistry::new())
    }

    /// An empty protocol whose opcode table has `capacity` slots.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::from_parts(CodecRegistry::with_capacity(capacity), HandlerRegistry::new())
    }

    /// Assemble a protocol from prebuilt registries.
    pub fn from_parts(codecs: CodecRegistry, handlers: HandlerRegistry) -> Self {
        Self {
            codecs,
            handlers,
            kick: None,
        }
    }

    /// Bind `codec` to `opcode` for message type `M`.
    pub fn register_codec<M, C>(&mut self, opcode: Opcode, codec: C) -> Result<(), RegistrationError>
    where
        M: Message,
        C: Codec<M>,
    {
        self.codecs.register::<M, C>(opcode, codec)
    }

    /// Register the handler for message type `M`.
    pub fn register_handler<M, H>(&mut self, handler: H) -> Result<(), RegistrationError>
    where
        M: Message,
        H: MessageHandler<M>,
    {
        self.handlers.register::<M, H>(handler)
    }

    /// Message sent to a peer right before it is disconnected. `factory`
    /// receives the disconnect reason.
    pub fn with_kick_message<M, F>(mut self, factory: F) -> Self
    where
        M: Message,
        F: Fn(&str) -> M + Send + Sync + 'static,
    {
        if !self.codecs.contains(MessageType::of::<M>()) {
            tracing::warn!(
                "Kick message {} has no codec, peers will not be notified",
                MessageType::of::<M>()
            );
        }
        self.kick = Some(Box::new(move |reason: &str| -> MessageRef {
            Arc::new(factory(reason))
        }));
        self
    }

    /// The codec registry.
    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    /// The handler registry.
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Build the kick message for `reason`, if the protocol defines one.
    pub fn kick_message(&self, reason: &str) -> Option<MessageRef> {
        self.kick.as_ref().map(|factory| factory(reason))
    }

    /// Log the registered codecs and handlers.
    pub fn log_summary(&self) {
        for entry in self.codecs.codecs() {
            let handled = self.handlers.lookup(entry.message_type()).is_some();
            tracing::info!(
                "opcode {:>3} -> {} (handler: {})",
                entry.opcode(),
                entry.message_type(),
                if handled { "yes" } else { "no" }
            );
        }
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("codecs", &self.codecs.len())
            .field("handlers", &self.handlers.len())
            .field("kick", &self.kick.is_some())
            .finish()
    }
}
