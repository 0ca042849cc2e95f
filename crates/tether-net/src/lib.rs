//! Protocol engine for tick-driven game servers: typed messages, opcode
//! framing, per-connection session state and the connection manager.

pub mod codec;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handler;
pub mod manager;
pub mod message;
pub mod protocol;
pub mod socket;
pub mod transport;

pub use codec::{Codec, CodecEntry, CodecRegistry, MAX_OPCODES, Opcode, PostcardCodec};
pub use connection::{
    Attachment, Connection, ConnectionId, ErrorHook, IdGenerator, Role, SessionState,
};
pub use error::{
    AttachmentError, CodecError, FrameError, HandlerError, LookupError, ManagerError,
    RegistrationError, SendError,
};
pub use frame::{FrameCodec, HEADER_LEN, MAX_BODY_LEN, encode_frame};
pub use handler::{HandlerEntry, HandlerRegistry, MessageHandler};
pub use manager::{ConnectionManager, ManagerConfig};
pub use message::{Message, MessageRef, MessageType};
pub use protocol::Protocol;
pub use socket::{SocketConfig, configure_stream, create_listener};
pub use transport::{MemoryTransport, TcpTransport, Transport};
