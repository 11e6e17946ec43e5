//! In-memory channel pairs.

use std::collections::VecDeque;
use std::fmt;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use wirebind_proto::{MAX_HANDLES, MAX_MESSAGE_BYTES, Status};

use crate::transport::{Message, Readable, Transport};

/// Messages flowing toward one endpoint.
#[derive(Default)]
struct Queue {
    /// Undelivered messages, oldest first.
    messages: VecDeque<Message>,
    /// The writing endpoint is gone; no more messages will arrive.
    writer_closed: bool,
    /// The reading endpoint is gone; writes must fail.
    reader_closed: bool,
}

impl Queue {
    /// `true` if a read would not return `SHOULD_WAIT`.
    fn is_readable(&self) -> bool {
        !self.messages.is_empty() || self.writer_closed
    }
}

/// State shared by both endpoints of a pair.
struct Shared {
    /// `queues[i]` holds messages readable by endpoint `i`.
    queues: [Mutex<Queue>; 2],
    /// `readable[i]` wakes tasks waiting on endpoint `i`.
    readable: [Notify; 2],
}

impl Shared {
    /// Locks the queue readable by endpoint `side`.
    fn queue(&self, side: usize) -> MutexGuard<'_, Queue> {
        self.queues[side]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Wakes every task waiting on endpoint `side`.
    fn wake(&self, side: usize) {
        self.readable[side].notify_waiters();
    }
}

/// One endpoint of an in-memory, message-oriented duplex channel.
///
/// Messages keep their boundaries and arrive in the order they were written.
/// Dropping an endpoint closes it: the peer can still drain what was already
/// queued, after which reads fail with [`Status::PEER_CLOSED`].
pub struct Channel {
    /// Queues shared with the peer.
    shared: Arc<Shared>,
    /// Index of the queue this endpoint reads from.
    side: usize,
}

impl Channel {
    /// Creates a connected pair of endpoints.
    pub fn create() -> (Self, Self) {
        let shared = Arc::new(Shared {
            queues: [Mutex::default(), Mutex::default()],
            readable: [Notify::new(), Notify::new()],
        });
        (
            Self {
                shared: Arc::clone(&shared),
                side: 0,
            },
            Self { shared, side: 1 },
        )
    }

    /// `true` once the peer endpoint has been closed.
    pub fn is_peer_closed(&self) -> bool {
        self.shared.queue(self.side).writer_closed
    }

    /// Closes this endpoint without dropping it.
    ///
    /// Queued inbound messages are discarded and the peer observes
    /// `PEER_CLOSED`. Closing twice is harmless.
    pub fn close(&self) {
        let discarded = {
            let mut inbound = self.shared.queue(self.side);
            inbound.reader_closed = true;
            inbound.writer_closed = true;
            std::mem::take(&mut inbound.messages)
        };
        self.shared.queue(1 - self.side).writer_closed = true;
        // Discarded messages may carry endpoints of other channels; drop
        // them with no queue locked.
        drop(discarded);
        self.shared.wake(self.side);
        self.shared.wake(1 - self.side);
    }
}

impl Transport for Channel {
    fn write(&self, message: Message) -> Result<(), Status> {
        if message.bytes.len() > MAX_MESSAGE_BYTES || message.handles.len() > MAX_HANDLES {
            return Err(Status::OUT_OF_RANGE);
        }
        {
            let mut outbound = self.shared.queue(1 - self.side);
            if outbound.reader_closed {
                drop(outbound);
                drop(message);
                return Err(Status::PEER_CLOSED);
            }
            outbound.messages.push_back(message);
        }
        self.shared.wake(1 - self.side);
        Ok(())
    }

    fn read(&self) -> Result<Message, Status> {
        let mut inbound = self.shared.queue(self.side);
        match inbound.messages.pop_front() {
            Some(message) => Ok(message),
            None if inbound.writer_closed => Err(Status::PEER_CLOSED),
            None => Err(Status::SHOULD_WAIT),
        }
    }

    fn readable(&self) -> Readable<'_> {
        Box::pin(async move {
            let notify = &self.shared.readable[self.side];
            loop {
                let mut notified = pin!(notify.notified());
                // Registered before the check so a write in between is not missed.
                notified.as_mut().enable();
                if self.shared.queue(self.side).is_readable() {
                    return;
                }
                notified.await;
            }
        })
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("side", &self.side)
            .field("peer_closed", &self.is_peer_closed())
            .finish_non_exhaustive()
    }
}
