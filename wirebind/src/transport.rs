//! Transport contract consumed by bindings.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::de::DeserializeOwned;
use wirebind_proto::{CodecError, MessageHeader, Status};

use crate::channel::Channel;

/// Future returned by [`Transport::readable`].
pub type Readable<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// A duplex, ordered, message-oriented transport.
///
/// Every [`write`](Transport::write) is delivered to the peer as exactly one
/// message. Implementations must be safe to write from several threads at
/// once; reads are only issued by the binding's single dispatch.
pub trait Transport: Send + Sync + fmt::Debug + 'static {
    /// Sends one message.
    ///
    /// Fails with [`Status::PEER_CLOSED`] once the peer is gone.
    fn write(&self, message: Message) -> Result<(), Status>;

    /// Receives one message without blocking.
    ///
    /// Returns [`Status::SHOULD_WAIT`] if nothing is queued and
    /// [`Status::PEER_CLOSED`] once the peer is gone and the queue drained.
    fn read(&self) -> Result<Message, Status>;

    /// Resolves when a [`read`](Transport::read) would not return
    /// [`Status::SHOULD_WAIT`].
    fn readable(&self) -> Readable<'_>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&self, message: Message) -> Result<(), Status> {
        (**self).write(message)
    }

    fn read(&self) -> Result<Message, Status> {
        (**self).read()
    }

    fn readable(&self) -> Readable<'_> {
        (**self).readable()
    }
}

/// A capability transferred alongside message bytes.
#[derive(Debug)]
#[non_exhaustive]
pub enum Handle {
    /// A channel endpoint.
    Channel(Channel),
}

impl Handle {
    /// Returns the channel endpoint, if this handle carries one.
    pub fn into_channel(self) -> Option<Channel> {
        match self {
            Self::Channel(channel) => Some(channel),
        }
    }
}

impl From<Channel> for Handle {
    fn from(channel: Channel) -> Self {
        Self::Channel(channel)
    }
}

/// Raw bytes plus attached handles, as moved by a [`Transport`].
#[derive(Debug, Default)]
pub struct Message {
    /// Encoded header and payload.
    pub bytes: Vec<u8>,
    /// Attached capabilities.
    pub handles: Vec<Handle>,
}

impl Message {
    /// A message without handles.
    pub const fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            handles: Vec::new(),
        }
    }

    /// A message carrying `handles`.
    pub const fn with_handles(bytes: Vec<u8>, handles: Vec<Handle>) -> Self {
        Self { bytes, handles }
    }
}

/// A received message whose header has been validated.
#[derive(Debug)]
pub struct IncomingMessage {
    /// Parsed header.
    header: MessageHeader,
    /// The raw message, header included.
    message: Message,
}

impl IncomingMessage {
    /// Validates the header of `message`.
    pub fn parse(message: Message) -> Result<Self, CodecError> {
        let header = wirebind_proto::decode_header(&message.bytes)?;
        Ok(Self { header, message })
    }

    /// The message header.
    pub const fn header(&self) -> &MessageHeader {
        &self.header
    }

    /// Transaction ID from the header.
    pub const fn txid(&self) -> u32 {
        self.header.txid
    }

    /// Method ordinal from the header.
    pub const fn ordinal(&self) -> u64 {
        self.header.ordinal
    }

    /// The raw bytes, header included.
    pub fn bytes(&self) -> &[u8] {
        &self.message.bytes
    }

    /// Decodes the payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        wirebind_proto::decode_message::<T>(&self.message.bytes).map(|(_, body)| body)
    }

    /// Takes the attached handles, leaving none behind.
    pub fn take_handles(&mut self) -> Vec<Handle> {
        std::mem::take(&mut self.message.handles)
    }

    /// Returns the underlying raw message.
    pub fn into_message(self) -> Message {
        self.message
    }
}
