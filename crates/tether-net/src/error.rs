//! Error types for the protocol engine.

use crate::codec::Opcode;
use crate::connection::ConnectionId;
use crate::message::MessageType;

/// Errors raised while building the codec and handler tables.
///
/// These are startup failures: a server that hits one must abort
/// initialization.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    /// Another codec already owns this opcode.
    #[error("opcode {opcode} is already bound to {existing}")]
    DuplicateOpcode {
        /// The contested opcode.
        opcode: Opcode,
        /// The message type already registered at that opcode.
        existing: MessageType,
    },

    /// The message type already has a codec.
    #[error("{0} already has a codec")]
    DuplicateType(MessageType),

    /// The message type already has a handler.
    #[error("{0} already has a handler")]
    DuplicateHandler(MessageType),

    /// The opcode does not fit in the registry table.
    #[error("opcode {opcode} is outside the table capacity {capacity}")]
    OpcodeOutOfRange {
        /// The rejected opcode.
        opcode: Opcode,
        /// The table capacity.
        capacity: usize,
    },
}

/// Error returned by [`CodecRegistry::by_opcode`](crate::CodecRegistry::by_opcode)
/// for an index outside the table.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("opcode {opcode} is out of range (capacity {capacity})")]
pub struct LookupError {
    /// The requested opcode.
    pub opcode: Opcode,
    /// The table capacity.
    pub capacity: usize,
}

/// Errors produced by a codec implementation.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The body does not describe a valid message.
    #[error("malformed body: {0}")]
    Malformed(String),

    /// A text field was not valid UTF-8.
    #[error("invalid UTF-8 in body")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// Postcard (de)serialization failed.
    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),

    /// The codec was handed a message of another type.
    #[error("codec for {expected} received {actual}")]
    TypeMismatch {
        /// The type the codec is bound to.
        expected: MessageType,
        /// The type it was handed.
        actual: MessageType,
    },
}

/// Errors raised by the frame encoder/decoder.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The peer sent an opcode with no registered codec. The stream
    /// position cannot be recovered.
    #[error("unknown opcode {0}")]
    UnknownOpcode(Opcode),

    /// A codec rejected the body of a frame. The stream position cannot be
    /// recovered.
    #[error("malformed message at opcode {opcode}: {source}")]
    MalformedMessage {
        /// Opcode of the rejected frame.
        opcode: Opcode,
        /// The codec failure.
        #[source]
        source: CodecError,
    },

    /// Encoding was requested for a type without a codec. This is a local
    /// programming error and never disconnects the peer.
    #[error("no codec registered for {0}")]
    UnknownMessageType(MessageType),

    /// A codec failed to encode an outbound message. Caller-visible, never
    /// disconnects.
    #[error("failed to encode {message_type}: {source}")]
    EncodeFailed {
        /// Type of the message being encoded.
        message_type: MessageType,
        /// The codec failure.
        #[source]
        source: CodecError,
    },

    /// The encoded body does not fit the 16-bit length field.
    #[error("{message_type} body of {size} bytes exceeds the 65535 byte frame limit")]
    BodyTooLarge {
        /// Type of the offending message.
        message_type: MessageType,
        /// Encoded body size.
        size: usize,
    },

    /// An I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Whether the error leaves the inbound stream in an unknown position.
    /// Such errors are fatal for the connection.
    pub fn is_desync(&self) -> bool {
        matches!(
            self,
            FrameError::UnknownOpcode(_) | FrameError::MalformedMessage { .. }
        )
    }
}

/// Errors returned to callers of the send family.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// No codec is registered for the message type.
    #[error("no codec registered for {0}")]
    UnknownMessageType(MessageType),

    /// An urgent send could not be framed or written.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Failure reported by a message handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The handler rejected the message.
    #[error("{0}")]
    Rejected(String),

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// Sending a reply failed.
    #[error(transparent)]
    Send(#[from] SendError),

    /// Any other failure raised by handler code.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    /// Shorthand for [`HandlerError::Rejected`].
    pub fn rejected(reason: impl Into<String>) -> Self {
        HandlerError::Rejected(reason.into())
    }
}

/// Errors from [`Connection::set_attachment`](crate::Connection::set_attachment).
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum AttachmentError {
    /// The connection already carries an attachment.
    #[error("connection attachment can only be set once")]
    AlreadySet,
}

/// Errors from [`ConnectionManager`](crate::ConnectionManager) membership
/// and outgoing connections.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// The manager already holds a live connection with this id.
    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),

    /// The live-connection set is full.
    #[error("connection limit of {0} reached")]
    ConnectionLimitReached(usize),

    /// The manager has been stopped.
    #[error("connection manager is stopped")]
    Stopped,

    /// Opening an outgoing connection failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
