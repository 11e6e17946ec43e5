//! Payload encoding: a header followed by a postcard body.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::header::{EPITAPH_ORDINAL, HEADER_SIZE, MessageHeader};
use crate::status::Status;

/// Largest message, header included, a transport has to accept.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Largest number of handles attached to a single message.
pub const MAX_HANDLES: usize = 64;

/// Errors produced while encoding or decoding messages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum CodecError {
    /// The payload could not be serialized.
    #[error("encode failed: {0}")]
    Encode(String),
    /// The payload could not be deserialized.
    #[error("decode failed: {0}")]
    Decode(String),
    /// The encoded message exceeds [`MAX_MESSAGE_BYTES`].
    #[error("message of {0} bytes exceeds the {MAX_MESSAGE_BYTES} byte limit")]
    TooLarge(usize),
    /// The header is truncated or malformed.
    #[error("invalid header: {0}")]
    Header(&'static str),
}

/// Payload of an epitaph message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epitaph {
    /// Status explaining why the sender closed the channel.
    pub error: Status,
}

/// Body of a reply to a flexible two-way call.
///
/// The receiver of a flexible call it does not know answers with
/// [`FrameworkError`](Self::FrameworkError) carrying
/// [`Status::NOT_SUPPORTED`] instead of closing the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlexibleReply<T> {
    /// The method's own reply.
    Response(T),
    /// The call never reached a handler.
    FrameworkError(Status),
}

/// Encodes a header and `payload` into a single message buffer.
pub fn encode_message<T: Serialize + ?Sized>(
    txid: u32,
    ordinal: u64,
    payload: &T,
) -> Result<Vec<u8>, CodecError> {
    encode_with_header(MessageHeader::new(txid, ordinal), payload)
}

/// Like [`encode_message`], with a caller-built header, e.g. one marked
/// [`flexible`](MessageHeader::flexible).
pub fn encode_with_header<T: Serialize + ?Sized>(
    header: MessageHeader,
    payload: &T,
) -> Result<Vec<u8>, CodecError> {
    let header = header.to_bytes().to_vec();
    let out = postcard::to_extend(payload, header).map_err(|e| CodecError::Encode(e.to_string()))?;
    if out.len() > MAX_MESSAGE_BYTES {
        return Err(CodecError::TooLarge(out.len()));
    }
    Ok(out)
}

/// Encodes an epitaph carrying `error`.
pub fn encode_epitaph(error: Status) -> Result<Vec<u8>, CodecError> {
    encode_message(0, EPITAPH_ORDINAL, &Epitaph { error })
}

/// Parses only the header of `bytes`.
pub fn decode_header(bytes: &[u8]) -> Result<MessageHeader, CodecError> {
    MessageHeader::from_bytes(bytes)
}

/// Parses the header and decodes the body of `bytes` as `T`.
pub fn decode_message<T: DeserializeOwned>(bytes: &[u8]) -> Result<(MessageHeader, T), CodecError> {
    let header = MessageHeader::from_bytes(bytes)?;
    let body = postcard::from_bytes(&bytes[HEADER_SIZE..])
        .map_err(|e| CodecError::Decode(e.to_string()))?;
    Ok((header, body))
}
