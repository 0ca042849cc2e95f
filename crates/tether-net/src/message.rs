//! Message trait and the type tag used to key codecs and handlers.
//!
//! A message is an immutable value shared as [`MessageRef`]. Its concrete
//! Rust type is its logical type: the codec registry, the handler registry
//! and dispatch all key on [`MessageType`], which is derived from the
//! concrete type without any reflection.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::connection::SessionState;

/// Shared handle to a message travelling through the queues.
pub type MessageRef = Arc<dyn Message>;

/// A typed protocol message.
///
/// Every attribute has a default, so a plain message only needs
/// `impl Message for MyMessage {}`.
pub trait Message: Any + Send + Sync + fmt::Debug {
    /// Tag of the concrete type, used for codec and handler lookup.
    fn message_type(&self) -> MessageType {
        MessageType::of::<Self>()
    }

    /// Asynchronous messages are dispatched as soon as they arrive instead
    /// of waiting for the next pulse.
    fn is_async(&self) -> bool {
        false
    }

    /// The state the connection must be in for this message to be
    /// dispatched. `None` means the message is valid in every state.
    fn required_state(&self) -> Option<SessionState> {
        None
    }

    /// Whether the connection must carry an attachment (the player or
    /// entity the message originates from) before this message is accepted.
    fn requires_origin(&self) -> bool {
        false
    }
}

impl dyn Message {
    /// Borrow the message as its concrete type.
    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        let any: &dyn Any = self;
        any.downcast_ref::<M>()
    }

    /// Whether the message is of concrete type `M`.
    pub fn is<M: Message>(&self) -> bool {
        self.message_type() == MessageType::of::<M>()
    }
}

/// Key identifying the concrete type of a message.
///
/// Equality and hashing only look at the [`TypeId`]; the name is kept for
/// log output and error messages.
#[derive(Clone, Copy)]
pub struct MessageType {
    id: TypeId,
    name: &'static str,
}

impl MessageType {
    /// The tag for type `M`.
    pub fn of<M: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<M>(),
            name: std::any::type_name::<M>(),
        }
    }

    /// Fully qualified type name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Last path segment of the type name, for compact log lines.
    pub fn short_name(&self) -> &'static str {
        self.name.rsplit("::").next().unwrap_or(self.name)
    }
}

impl PartialEq for MessageType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MessageType {}

impl Hash for MessageType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}
