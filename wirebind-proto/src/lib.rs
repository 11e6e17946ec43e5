//! Wire layer for the wirebind binding runtime.
//!
//! Every message starts with a fixed 16-byte [`MessageHeader`] carrying the
//! transaction ID used to correlate requests with replies and the method
//! ordinal used to route them. Payloads are serialized with [`postcard`].
//!
//! Byte-stream transports (Unix sockets, TCP) additionally wrap each message
//! in a 4-byte big-endian length-prefixed frame, see [`encode`] / [`recv`].

mod codec;
mod header;
mod message;
mod status;

pub use codec::{decode, encode, recv, send};
pub use header::{
    EPITAPH_ORDINAL, FLEXIBLE_METHOD, HEADER_SIZE, MAGIC_NUMBER_INITIAL, MessageHeader,
};
pub use message::{
    CodecError, Epitaph, FlexibleReply, MAX_HANDLES, MAX_MESSAGE_BYTES, decode_header,
    decode_message, encode_epitaph, encode_message, encode_with_header,
};
pub use status::Status;
