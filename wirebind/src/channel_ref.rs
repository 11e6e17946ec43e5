//! Reference-counted ownership of a binding's transport.
//!
//! The binding and every in-flight operation hold an `Arc<ChannelRef>`.
//! The transport closes when the last of them is dropped, unless a caller
//! is blocked in [`ChannelRefTracker::wait_for_channel`], in which case the
//! transport is handed to that caller instead.

use std::fmt;
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use wirebind_proto::Status;

use crate::transport::{Message, Readable, Transport};

/// A shared reference to a transport.
pub struct ChannelRef {
    /// The transport; only `None` while being dropped.
    transport: Option<Box<dyn Transport>>,
    /// Receives the transport instead of closing it, if set.
    release: Mutex<Option<SyncSender<Box<dyn Transport>>>>,
}

impl ChannelRef {
    /// Wraps `transport`.
    fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport: Some(transport),
            release: Mutex::new(None),
        }
    }

    /// The referenced transport.
    fn transport(&self) -> Option<&dyn Transport> {
        self.transport.as_deref()
    }
}

impl Transport for ChannelRef {
    fn write(&self, message: Message) -> Result<(), Status> {
        self.transport()
            .map_or(Err(Status::BAD_STATE), |t| t.write(message))
    }

    fn read(&self) -> Result<Message, Status> {
        self.transport().map_or(Err(Status::BAD_STATE), |t| t.read())
    }

    fn readable(&self) -> Readable<'_> {
        match self.transport() {
            Some(transport) => transport.readable(),
            None => Box::pin(std::future::ready(())),
        }
    }
}

impl Drop for ChannelRef {
    fn drop(&mut self) {
        let Some(transport) = self.transport.take() else {
            return;
        };
        let waiter = self
            .release
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(waiter) = waiter {
            // Hand the transport to the blocked waiter; it closes on drop
            // if the waiter gave up.
            let _ = waiter.send(transport);
        }
    }
}

impl fmt::Debug for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRef")
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

/// Tracker state.
#[derive(Default)]
struct TrackerState {
    /// The tracker's own reference; `None` before init and after release.
    channel: Option<Arc<ChannelRef>>,
    /// `init` has been called.
    initialized: bool,
    /// `wait_for_channel` has been called.
    waited: bool,
}

/// Owns the first reference to a binding's transport.
#[derive(Default)]
pub struct ChannelRefTracker {
    /// Guarded tracker state.
    state: Mutex<TrackerState>,
}

impl ChannelRefTracker {
    /// An empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the tracker state.
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs the first and only tracker-owned reference to `transport`.
    ///
    /// # Panics
    ///
    /// Panics if called more than once.
    pub fn init(&self, transport: Box<dyn Transport>) {
        let mut state = self.lock();
        assert!(!state.initialized, "channel tracker initialized twice");
        state.initialized = true;
        state.channel = Some(Arc::new(ChannelRef::new(transport)));
    }

    /// A new reference to the transport, or `None` once released.
    pub fn get(&self) -> Option<Arc<ChannelRef>> {
        self.lock().channel.clone()
    }

    /// Drops the tracker's reference. The transport closes as soon as every
    /// in-flight holder lets go of theirs.
    pub fn release(&self) {
        let channel = self.lock().channel.take();
        drop(channel);
    }

    /// Takes the tracker's reference and blocks until every other holder
    /// has dropped theirs, then returns the transport.
    ///
    /// Returns `None` if the tracker already released the transport. Must
    /// not be called from a thread that in-flight holders need in order to
    /// make progress.
    ///
    /// # Panics
    ///
    /// Panics if called more than once.
    pub fn wait_for_channel(&self) -> Option<Box<dyn Transport>> {
        let channel = {
            let mut state = self.lock();
            assert!(!state.waited, "wait_for_channel called twice");
            state.waited = true;
            state.channel.take()
        }?;
        let (tx, rx) = mpsc::sync_channel(1);
        *channel
            .release
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        drop(channel);
        rx.recv().ok()
    }
}

impl fmt::Debug for ChannelRefTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ChannelRefTracker")
            .field("bound", &state.channel.is_some())
            .field("waited", &state.waited)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::channel::Channel;

    #[test]
    fn release_without_refs_closes_channel() {
        let (local, remote) = Channel::create();
        let tracker = ChannelRefTracker::new();
        tracker.init(Box::new(local));
        tracker.release();
        assert!(remote.is_peer_closed());
        assert!(tracker.get().is_none());
    }

    #[test]
    fn outstanding_ref_keeps_channel_open() {
        let (local, remote) = Channel::create();
        let tracker = ChannelRefTracker::new();
        tracker.init(Box::new(local));

        let held = tracker.get().unwrap();
        tracker.release();
        assert!(!remote.is_peer_closed());
        held.write(Message::new(b"still here".to_vec())).unwrap();
        drop(held);
        assert!(remote.is_peer_closed());
        assert_eq!(remote.read().unwrap().bytes, b"still here");
    }

    #[test]
    fn wait_without_refs_returns_immediately() {
        let (local, remote) = Channel::create();
        let tracker = ChannelRefTracker::new();
        tracker.init(Box::new(local));

        let transport = tracker.wait_for_channel().unwrap();
        assert!(!remote.is_peer_closed());
        transport.write(Message::new(vec![7])).unwrap();
        assert_eq!(remote.read().unwrap().bytes, vec![7]);
        assert!(tracker.get().is_none());
    }

    #[test]
    fn wait_blocks_until_refs_release() {
        let (local, remote) = Channel::create();
        let tracker = Arc::new(ChannelRefTracker::new());
        tracker.init(Box::new(local));

        let held = tracker.get().unwrap();
        let (running_tx, running_rx) = mpsc::channel();
        let waiter = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                running_tx.send(()).unwrap();
                tracker.wait_for_channel()
            })
        };
        running_rx.recv().unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        drop(held);
        let transport = waiter.join().unwrap().unwrap();
        assert!(!remote.is_peer_closed());
        drop(transport);
        assert!(remote.is_peer_closed());
    }

    #[test]
    fn wait_after_release_yields_nothing() {
        let (local, _remote) = Channel::create();
        let tracker = ChannelRefTracker::new();
        tracker.init(Box::new(local));
        tracker.release();
        assert!(tracker.wait_for_channel().is_none());
    }

    #[test]
    #[should_panic(expected = "wait_for_channel called twice")]
    fn second_wait_panics() {
        let (local, _remote) = Channel::create();
        let tracker = ChannelRefTracker::new();
        tracker.init(Box::new(local));
        let _first = tracker.wait_for_channel();
        let _second = tracker.wait_for_channel();
    }
}
