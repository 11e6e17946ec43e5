//! Carrying a binding over a byte stream.
//!
//! [`bridge`] turns any tokio byte stream (a Unix socket, a TCP
//! connection) into a [`Transport`] by pumping length-prefixed frames
//! between the stream and an in-memory channel pair.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use wirebind_proto::Status;

use crate::channel::Channel;
use crate::dispatcher::Dispatcher;
use crate::transport::{Message, Readable, Transport};

/// Transport backed by a byte stream.
///
/// Handles cannot cross a byte stream; writing a message that carries any
/// fails with [`Status::NOT_SUPPORTED`].
#[derive(Debug)]
pub struct StreamTransport {
    /// Local end of the pair; the pumps own the other end.
    channel: Channel,
}

impl Transport for StreamTransport {
    fn write(&self, message: Message) -> Result<(), Status> {
        if !message.handles.is_empty() {
            return Err(Status::NOT_SUPPORTED);
        }
        self.channel.write(message)
    }

    fn read(&self) -> Result<Message, Status> {
        self.channel.read()
    }

    fn readable(&self) -> Readable<'_> {
        self.channel.readable()
    }
}

/// Bridges `stream` to a transport, running the pumps on `dispatcher`.
///
/// End of stream closes the transport; closing the transport shuts down
/// the write half of the stream once queued messages are flushed.
pub fn bridge<S>(stream: S, dispatcher: &Dispatcher) -> StreamTransport
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (local, remote) = Channel::create();
    let remote = Arc::new(remote);
    let (reader, writer) = tokio::io::split(stream);
    dispatcher.spawn(inbound(BufReader::new(reader), Arc::clone(&remote)));
    dispatcher.spawn(outbound(BufWriter::new(writer), remote));
    StreamTransport { channel: local }
}

/// Stream to channel.
async fn inbound<R: AsyncRead + Unpin>(mut reader: R, channel: Arc<Channel>) {
    loop {
        match wirebind_proto::recv::<Vec<u8>>(&mut reader).await {
            Ok(bytes) => {
                if channel.write(Message::new(bytes)).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                tracing::warn!("stream read failed: {e}");
                break;
            }
        }
    }
    channel.close();
}

/// Channel to stream.
async fn outbound<W: AsyncWrite + Unpin>(mut writer: W, channel: Arc<Channel>) {
    loop {
        channel.readable().await;
        let message = match channel.read() {
            Ok(message) => message,
            Err(status) if status == Status::SHOULD_WAIT => continue,
            Err(_) => break,
        };
        let sent = async {
            wirebind_proto::send(&mut writer, &message.bytes).await?;
            writer.flush().await
        };
        if let Err(e) = sent.await {
            tracing::warn!("stream write failed: {e}");
            break;
        }
    }
    channel.close();
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Handle;

    #[tokio::test]
    async fn frames_cross_a_duplex_stream() {
        let dispatcher = Dispatcher::current();
        let (a, b) = tokio::io::duplex(1024);
        let left = bridge(a, &dispatcher);
        let right = bridge(b, &dispatcher);

        left.write(Message::new(b"over the wire".to_vec())).unwrap();
        right.readable().await;
        assert_eq!(right.read().unwrap().bytes, b"over the wire");
    }

    #[tokio::test]
    async fn handles_are_refused() {
        let dispatcher = Dispatcher::current();
        let (a, _b) = tokio::io::duplex(64);
        let transport = bridge(a, &dispatcher);
        let (c, _d) = Channel::create();
        let err = transport
            .write(Message::with_handles(Vec::new(), vec![Handle::from(c)]))
            .unwrap_err();
        assert_eq!(err, Status::NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn dropping_one_side_closes_the_other() {
        let dispatcher = Dispatcher::current();
        let (a, b) = tokio::io::duplex(64);
        let left = bridge(a, &dispatcher);
        let right = bridge(b, &dispatcher);

        drop(left);
        right.readable().await;
        assert_eq!(right.read().unwrap_err(), Status::PEER_CLOSED);
    }
}
