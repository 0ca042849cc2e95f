//! Opcode-prefixed framing for TCP streams.
//!
//! Every message on the wire is a single frame:
//!
//! ```text
//! +-----------+-------------------+--------------------+
//! | opcode    | length (2 bytes)  |   body             |
//! | u8        | u16 big-endian    |   (length bytes)   |
//! +-----------+-------------------+--------------------+
//! ```
//!
//! The length does **not** include the three header bytes. A length of 0 is a
//! valid empty body. [`FrameCodec`] implements the tokio-util
//! [`Decoder`]/[`Encoder`] pair so a socket can be wrapped in
//! `FramedRead`/`FramedWrite`.

use std::io;
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{CodecRegistry, Opcode};
use crate::connection::Role;
use crate::error::FrameError;
use crate::message::{Message, MessageRef};
use crate::protocol::Protocol;

/// Size of the opcode plus length header.
pub const HEADER_LEN: usize = 3;

/// Largest body a frame can carry.
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

/// Append one complete frame for `message` to `dst`.
///
/// On error `dst` is left as it was.
pub fn encode_frame(
    codecs: &CodecRegistry,
    role: Role,
    message: &dyn Message,
    dst: &mut BytesMut,
) -> Result<(), FrameError> {
    let message_type = message.message_type();
    let entry = codecs
        .by_type(message_type)
        .ok_or(FrameError::UnknownMessageType(message_type))?;

    let start = dst.len();
    dst.reserve(HEADER_LEN);
    dst.put_u8(entry.opcode());
    dst.put_u16(0);

    if let Err(source) = entry.encode(message, role, dst) {
        dst.truncate(start);
        return Err(FrameError::EncodeFailed {
            message_type,
            source,
        });
    }

    let size = dst.len() - start - HEADER_LEN;
    let Ok(length) = u16::try_from(size) else {
        dst.truncate(start);
        return Err(FrameError::BodyTooLarge { message_type, size });
    };
    dst[start + 1..start + HEADER_LEN].copy_from_slice(&length.to_be_bytes());
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    ReadOpcode,
    ReadLength { opcode: Opcode },
    ReadBody { opcode: Opcode, length: usize },
}

/// Incremental frame decoder and encoder bound to a protocol.
///
/// Decoding tolerates arbitrary chunking of the input: a partially received
/// header or body is kept in the state machine and nothing is consumed
/// twice. Any decode error leaves the stream position unknown and the
/// connection must be dropped.
pub struct FrameCodec {
    protocol: Arc<Protocol>,
    role: Role,
    state: DecodeState,
}

impl FrameCodec {
    /// Create a codec for the local end of a link playing `role`.
    pub fn new(protocol: Arc<Protocol>, role: Role) -> Self {
        Self {
            protocol,
            role,
            state: DecodeState::ReadOpcode,
        }
    }

    /// The role of the local end.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the decoder sits between frames.
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::ReadOpcode
    }
}

impl Decoder for FrameCodec {
    type Item = MessageRef;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<MessageRef>, FrameError> {
        loop {
            match self.state {
                DecodeState::ReadOpcode => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let opcode = src.get_u8();
                    match self.protocol.codecs().by_opcode(opcode) {
                        Ok(Some(_)) => self.state = DecodeState::ReadLength { opcode },
                        _ => return Err(FrameError::UnknownOpcode(opcode)),
                    }
                }
                DecodeState::ReadLength { opcode } => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    let length = usize::from(src.get_u16());
                    self.state = DecodeState::ReadBody { opcode, length };
                }
                DecodeState::ReadBody { opcode, length } => {
                    if src.len() < length {
                        // The full body has not arrived yet.
                        src.reserve(length - src.len());
                        return Ok(None);
                    }
                    let body = src.split_to(length).freeze();
                    self.state = DecodeState::ReadOpcode;

                    let entry = match self.protocol.codecs().by_opcode(opcode) {
                        Ok(Some(entry)) => entry,
                        _ => return Err(FrameError::UnknownOpcode(opcode)),
                    };
                    let message = entry
                        .decode(body, self.role)
                        .map_err(|source| FrameError::MalformedMessage { opcode, source })?;

                    tracing::trace!(
                        "Decoded {} ({length} bytes) at opcode {opcode}",
                        message.message_type()
                    );
                    return Ok(Some(message));
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<MessageRef>, FrameError> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() && self.is_idle() => Ok(None),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed in the middle of a frame",
            )
            .into()),
        }
    }
}

impl Encoder<MessageRef> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: MessageRef, dst: &mut BytesMut) -> Result<(), FrameError> {
        encode_frame(self.protocol.codecs(), self.role, item.as_ref(), dst)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
