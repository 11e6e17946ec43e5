//! Outstanding two-way calls of a client binding, keyed by transaction ID.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{Error, UnbindInfo};
use crate::transport::IncomingMessage;

/// Transaction IDs are drawn from the low 31 bits; zero is never issued.
pub const TXID_MASK: u32 = 0x7FFF_FFFF;

/// Bookkeeping for one outstanding two-way call.
pub trait ResponseContext: Send + 'static {
    /// Delivers the reply. Returns the teardown reason if the reply was
    /// unusable and the binding must stop.
    fn on_reply(self: Box<Self>, reply: IncomingMessage) -> Option<UnbindInfo>;

    /// Delivers an error instead of a reply.
    fn on_error(self: Box<Self>, error: Error);
}

/// Proof of a successful [`ResponseRegistry::allocate`], used to forget
/// exactly that registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Registration {
    /// Assigned transaction ID.
    txid: u32,
    /// Registry-unique sequence number of the registration.
    generation: u64,
}

impl Registration {
    /// The transaction ID assigned to the call.
    pub const fn txid(&self) -> u32 {
        self.txid
    }
}

/// A registered context.
struct Entry {
    /// Sequence number; orders flushes and identifies the registration.
    generation: u64,
    /// The waiting context.
    context: Box<dyn ResponseContext>,
}

/// Registry state.
struct Inner {
    /// Next candidate transaction ID, before masking.
    next_txid: u32,
    /// Next registration sequence number.
    next_generation: u64,
    /// Set by [`ResponseRegistry::flush_all_with_error`]; no further
    /// registrations are accepted.
    closed: bool,
    /// Outstanding contexts.
    contexts: HashMap<u32, Entry>,
}

/// Maps outstanding transaction IDs to their response contexts.
pub struct ResponseRegistry {
    /// Guarded state; the lock is never held while a context runs.
    inner: Mutex<Inner>,
}

impl ResponseRegistry {
    /// An empty registry whose first ID is 1.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_txid: 1,
                next_generation: 0,
                closed: false,
                contexts: HashMap::new(),
            }),
        }
    }

    /// Locks the registry state.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `context` under a fresh transaction ID.
    ///
    /// The ID is non-zero and distinct from every ID currently registered.
    /// Candidates that collide are skipped; the search only fails to end if
    /// all 2^31 - 1 IDs are outstanding at once.
    ///
    /// After a flush the context is handed back unregistered.
    pub fn allocate(
        &self,
        context: Box<dyn ResponseContext>,
    ) -> Result<Registration, Box<dyn ResponseContext>> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(context);
        }
        let txid = loop {
            let candidate = inner.next_txid & TXID_MASK;
            inner.next_txid = inner.next_txid.wrapping_add(1);
            if candidate != 0 && !inner.contexts.contains_key(&candidate) {
                break candidate;
            }
        };
        let generation = inner.next_generation;
        inner.next_generation += 1;
        inner.contexts.insert(txid, Entry { generation, context });
        Ok(Registration { txid, generation })
    }

    /// Removes the context registered by `registration`, if it is still
    /// outstanding, without notifying it.
    pub fn forget(&self, registration: Registration) -> Option<Box<dyn ResponseContext>> {
        let mut inner = self.lock();
        match inner.contexts.get(&registration.txid) {
            Some(entry) if entry.generation == registration.generation => inner
                .contexts
                .remove(&registration.txid)
                .map(|entry| entry.context),
            _ => None,
        }
    }

    /// Removes and returns the context waiting on `txid`.
    ///
    /// `None` means the peer replied to a call that is not outstanding,
    /// which is a protocol violation.
    pub fn resolve(&self, txid: u32) -> Option<Box<dyn ResponseContext>> {
        self.lock().contexts.remove(&txid).map(|entry| entry.context)
    }

    /// Removes every context and fails each with `error`, oldest first.
    ///
    /// The registry stays closed afterwards. Contexts run with the lock
    /// released, so they may call back into the registry.
    pub fn flush_all_with_error(&self, error: &Error) {
        let mut entries: Vec<Entry> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.contexts.drain().map(|(_, entry)| entry).collect()
        };
        entries.sort_by_key(|entry| entry.generation);
        for entry in entries {
            entry.context.on_error(error.clone());
        }
    }

    /// Number of outstanding calls.
    pub fn len(&self) -> usize {
        self.lock().contexts.len()
    }

    /// `true` if no calls are outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` if a call with `txid` is outstanding.
    pub fn is_pending(&self, txid: u32) -> bool {
        self.lock().contexts.contains_key(&txid)
    }

    /// Moves the ID counter; lets tests exercise wraparound.
    #[cfg(test)]
    fn set_next_txid(&self, next: u32) {
        self.lock().next_txid = next;
    }
}

impl Default for ResponseRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ResponseRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("ResponseRegistry")
            .field("outstanding", &inner.contexts.len())
            .field("closed", &inner.closed)
            .finish()
    }
}
