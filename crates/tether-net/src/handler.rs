//! Message handlers and the type-keyed handler registry.
//!
//! A [`MessageHandler`] processes one message type on behalf of a
//! connection. Closures with the right signature are handlers, so most
//! registrations look like:
//!
//! ```ignore
//! handlers.register::<Chat, _>(|connection: &Connection, chat: &Chat| {
//!     connection.send(chat.clone())?;
//!     Ok(())
//! })?;
//! ```

use std::collections::HashMap;
use std::marker::PhantomData;

use crate::connection::Connection;
use crate::error::{HandlerError, RegistrationError};
use crate::message::{Message, MessageType};

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Processes messages of type `M` for a connection.
pub trait MessageHandler<M: Message>: Send + Sync + 'static {
    /// Handle a single message. An error is reported through the
    /// connection's error hook and disconnects that connection.
    fn handle(&self, connection: &Connection, message: &M) -> Result<(), HandlerError>;
}

/// Blanket implementation for closures.
impl<M, F> MessageHandler<M> for F
where
    M: Message,
    F: Fn(&Connection, &M) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, connection: &Connection, message: &M) -> Result<(), HandlerError> {
        self(connection, message)
    }
}

trait ErasedHandler: Send + Sync {
    fn handle(&self, connection: &Connection, message: &dyn Message) -> Result<(), HandlerError>;
}

struct TypedHandler<M, H> {
    handler: H,
    _marker: PhantomData<fn(M)>,
}

impl<M: Message, H: MessageHandler<M>> ErasedHandler for TypedHandler<M, H> {
    fn handle(&self, connection: &Connection, message: &dyn Message) -> Result<(), HandlerError> {
        match message.downcast_ref::<M>() {
            Some(typed) => self.handler.handle(connection, typed),
            None => Err(HandlerError::rejected(format!(
                "handler for {} received {}",
                MessageType::of::<M>(),
                message.message_type()
            ))),
        }
    }
}

/// A handler bound to its message type.
pub struct HandlerEntry {
    message_type: MessageType,
    handler: Box<dyn ErasedHandler>,
}

impl HandlerEntry {
    /// The message type this handler serves.
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Run the handler.
    pub fn handle(
        &self,
        connection: &Connection,
        message: &dyn Message,
    ) -> Result<(), HandlerError> {
        self.handler.handle(connection, message)
    }
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("message_type", &self.message_type)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Maps message types to handlers. At most one handler per type.
pub struct HandlerRegistry {
    handlers: HashMap<MessageType, HandlerEntry>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for message type `M`.
    ///
    /// A second registration for the same type is rejected and leaves the
    /// first handler in place.
    pub fn register<M, H>(&mut self, handler: H) -> Result<(), RegistrationError>
    where
        M: Message,
        H: MessageHandler<M>,
    {
        let message_type = MessageType::of::<M>();
        if self.handlers.contains_key(&message_type) {
            return Err(RegistrationError::DuplicateHandler(message_type));
        }

        self.handlers.insert(
            message_type,
            HandlerEntry {
                message_type,
                handler: Box::new(TypedHandler {
                    handler,
                    _marker: PhantomData,
                }),
            },
        );
        tracing::debug!("Registered handler for {message_type}");
        Ok(())
    }

    /// The handler for a message type, if any.
    pub fn lookup(&self, message_type: MessageType) -> Option<&HandlerEntry> {
        self.handlers.get(&message_type)
    }

    /// Return an iterator over registered types (useful for startup logging).
    pub fn registered_types(&self) -> impl Iterator<Item = MessageType> + '_ {
        self.handlers.keys().copied()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
