//! Message codecs and the opcode/type registry.
//!
//! A [`Codec`] converts the body of one message type to and from bytes. The
//! [`CodecRegistry`] binds each codec to exactly one opcode and one message
//! type, and answers lookups in both directions: by opcode when decoding an
//! inbound frame, by type when encoding an outbound message.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::connection::Role;
use crate::error::{CodecError, LookupError, RegistrationError};
use crate::message::{Message, MessageRef, MessageType};

/// Numeric wire identifier of a message type. One byte on the wire.
pub type Opcode = u8;

/// Largest table a one-byte opcode can address.
pub const MAX_OPCODES: usize = 256;

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Converts the body of messages of type `M` to and from bytes.
///
/// `role` is the role of the local end of the link. A codec may use it to
/// serialize server-origin and client-origin values differently under the
/// same opcode.
pub trait Codec<M: Message>: Send + Sync + 'static {
    /// Append the body of `message` to `dst`.
    fn encode(&self, message: &M, role: Role, dst: &mut BytesMut) -> Result<(), CodecError>;

    /// Rebuild a message from a complete frame body.
    fn decode(&self, body: Bytes, role: Role) -> Result<M, CodecError>;
}

/// Codec for any serde message, using [`postcard`] for the body.
pub struct PostcardCodec<M> {
    _marker: PhantomData<fn() -> M>,
}

impl<M> PostcardCodec<M> {
    /// Create the codec.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<M> Default for PostcardCodec<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Codec<M> for PostcardCodec<M>
where
    M: Message + Serialize + DeserializeOwned,
{
    fn encode(&self, message: &M, _role: Role, dst: &mut BytesMut) -> Result<(), CodecError> {
        let body = postcard::to_allocvec(message)?;
        dst.extend_from_slice(&body);
        Ok(())
    }

    fn decode(&self, body: Bytes, _role: Role) -> Result<M, CodecError> {
        Ok(postcard::from_bytes(&body)?)
    }
}

/// Type-erased view of a [`Codec`], so codecs of different message types
/// can share one table.
trait ErasedCodec: Send + Sync {
    fn encode(
        &self,
        message: &dyn Message,
        role: Role,
        dst: &mut BytesMut,
    ) -> Result<(), CodecError>;

    fn decode(&self, body: Bytes, role: Role) -> Result<MessageRef, CodecError>;
}

struct TypedCodec<M, C> {
    codec: C,
    _marker: PhantomData<fn() -> M>,
}

impl<M: Message, C: Codec<M>> ErasedCodec for TypedCodec<M, C> {
    fn encode(
        &self,
        message: &dyn Message,
        role: Role,
        dst: &mut BytesMut,
    ) -> Result<(), CodecError> {
        let typed = message
            .downcast_ref::<M>()
            .ok_or_else(|| CodecError::TypeMismatch {
                expected: MessageType::of::<M>(),
                actual: message.message_type(),
            })?;
        self.codec.encode(typed, role, dst)
    }

    fn decode(&self, body: Bytes, role: Role) -> Result<MessageRef, CodecError> {
        let message: MessageRef = Arc::new(self.codec.decode(body, role)?);
        Ok(message)
    }
}

/// A codec bound to its opcode and message type.
pub struct CodecEntry {
    opcode: Opcode,
    message_type: MessageType,
    codec: Box<dyn ErasedCodec>,
}

impl CodecEntry {
    /// The opcode this codec owns.
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// The message type this codec owns.
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Append the body of `message` to `dst`.
    pub fn encode(
        &self,
        message: &dyn Message,
        role: Role,
        dst: &mut BytesMut,
    ) -> Result<(), CodecError> {
        self.codec.encode(message, role, dst)
    }

    /// Rebuild a message from a frame body.
    pub fn decode(&self, body: Bytes, role: Role) -> Result<MessageRef, CodecError> {
        self.codec.decode(body, role)
    }
}

impl std::fmt::Debug for CodecEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecEntry")
            .field("opcode", &self.opcode)
            .field("message_type", &self.message_type)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Bidirectional table between opcodes, message types and codecs.
///
/// The opcode table has a fixed capacity chosen at construction, which keeps
/// opcode lookup a direct index.
pub struct CodecRegistry {
    by_opcode: Vec<Option<CodecEntry>>,
    by_type: HashMap<MessageType, Opcode>,
}

impl CodecRegistry {
    /// Create a registry covering the whole one-byte opcode space.
    pub fn new() -> Self {
        Self::with_capacity(MAX_OPCODES)
    }

    /// Create a registry accepting opcodes in `[0, capacity)`. Capacities
    /// above [`MAX_OPCODES`] are clamped.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(MAX_OPCODES);
        let mut by_opcode = Vec::with_capacity(capacity);
        by_opcode.resize_with(capacity, || None);
        Self {
            by_opcode,
            by_type: HashMap::with_capacity(capacity),
        }
    }

    /// Number of opcode slots.
    pub fn capacity(&self) -> usize {
        self.by_opcode.len()
    }

    /// Number of registered codecs.
    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    /// Whether no codec is registered.
    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    /// Bind `codec` to `opcode` for message type `M`.
    ///
    /// Fails if the opcode is outside the table, already taken, or if `M`
    /// already has a codec. Nothing is modified on failure.
    pub fn register<M, C>(&mut self, opcode: Opcode, codec: C) -> Result<(), RegistrationError>
    where
        M: Message,
        C: Codec<M>,
    {
        let message_type = MessageType::of::<M>();
        let capacity = self.capacity();

        let slot = self
            .by_opcode
            .get_mut(usize::from(opcode))
            .ok_or(RegistrationError::OpcodeOutOfRange { opcode, capacity })?;

        if let Some(existing) = slot {
            return Err(RegistrationError::DuplicateOpcode {
                opcode,
                existing: existing.message_type,
            });
        }
        if self.by_type.contains_key(&message_type) {
            return Err(RegistrationError::DuplicateType(message_type));
        }

        *slot = Some(CodecEntry {
            opcode,
            message_type,
            codec: Box::new(TypedCodec {
                codec,
                _marker: PhantomData,
            }),
        });
        self.by_type.insert(message_type, opcode);

        tracing::debug!("Registered {message_type} at opcode {opcode}");
        Ok(())
    }

    /// Look up the codec at `opcode`.
    ///
    /// An opcode outside the table is an error; an in-range opcode with no
    /// codec is `Ok(None)`.
    pub fn by_opcode(&self, opcode: Opcode) -> Result<Option<&CodecEntry>, LookupError> {
        self.by_opcode
            .get(usize::from(opcode))
            .map(Option::as_ref)
            .ok_or(LookupError {
                opcode,
                capacity: self.capacity(),
            })
    }

    /// Look up the codec bound to a message type.
    pub fn by_type(&self, message_type: MessageType) -> Option<&CodecEntry> {
        let opcode = *self.by_type.get(&message_type)?;
        self.by_opcode[usize::from(opcode)].as_ref()
    }

    /// Whether a codec is bound to the message type.
    pub fn contains(&self, message_type: MessageType) -> bool {
        self.by_type.contains_key(&message_type)
    }

    /// All registered codecs in opcode order.
    pub fn codecs(&self) -> impl Iterator<Item = &CodecEntry> {
        self.by_opcode.iter().flatten()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
