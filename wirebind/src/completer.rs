//! Reply obligations handed to server handlers.
//!
//! Every incoming call gets a [`Completer`]. For a two-way call it owes
//! exactly one reply, discharged by [`Completer::reply`] or
//! [`Completer::close`]. A handler that wants to answer later converts it
//! with [`Completer::to_owned`] and replies through the returned
//! [`OwnedCompleter`] from any thread.
//!
//! Replying twice panics. Dropping a completer that still owes a reply also
//! panics, unless the binding has already been torn down.

#![allow(clippy::panic)]

use std::sync::Arc;
use std::{fmt, thread};

use serde::Serialize;
use wirebind_proto::{FlexibleReply, MessageHeader, Status, encode_with_header};

use crate::binding::{AsyncBinding, BindingHandle};
use crate::error::{Error, Result, UnbindInfo};
use crate::server::ServerBindingRef;
use crate::transport::{Handle, Message};

/// The reply obligation for one incoming call.
struct Transaction {
    /// Transaction ID to echo; 0 for one-way calls.
    txid: u32,
    /// Method ordinal to echo.
    ordinal: u64,
    /// The call was flexible; replies are wrapped in [`FlexibleReply`].
    flexible: bool,
    /// The binding the call arrived on.
    binding: BindingHandle,
    /// A reply is still owed.
    reply_owed: bool,
}

impl Transaction {
    /// Opens the obligation for the call `header` (txid 0: none owed).
    const fn new(header: &MessageHeader, binding: BindingHandle) -> Self {
        Self {
            txid: header.txid,
            ordinal: header.ordinal,
            flexible: header.is_flexible(),
            binding,
            reply_owed: header.txid != 0,
        }
    }

    /// Panics unless a reply may be sent now.
    fn check_reply_owed(&self) {
        assert!(self.txid != 0, "reply on a one-way call (ordinal {})", self.ordinal);
        assert!(self.reply_owed, "reply already sent for transaction {}", self.txid);
    }

    /// Encodes and sends the reply.
    ///
    /// An encode failure leaves the obligation in place. Once encoded the
    /// obligation is discharged whether or not the write succeeds.
    fn reply<T: Serialize + ?Sized>(&mut self, payload: &T, handles: Vec<Handle>) -> Result<()> {
        self.check_reply_owed();
        let header = MessageHeader::new(self.txid, self.ordinal);
        let bytes = if self.flexible {
            encode_with_header(header.flexible(), &FlexibleReply::Response(payload))
        } else {
            encode_with_header(header, payload)
        }
        .map_err(Error::Encode)?;
        self.reply_owed = false;
        self.binding.send(Message::with_handles(bytes, handles))
    }

    /// Answers a flexible call no handler knows with a framework error.
    fn reply_unknown_method(&mut self) -> Result<()> {
        self.check_reply_owed();
        let header = MessageHeader::new(self.txid, self.ordinal).flexible();
        let body = FlexibleReply::<()>::FrameworkError(Status::NOT_SUPPORTED);
        let bytes = encode_with_header(header, &body).map_err(Error::Encode)?;
        self.reply_owed = false;
        self.binding.send(Message::new(bytes))
    }

    /// Discharges the obligation by tearing the binding down with `info`.
    fn abort(&mut self, info: UnbindInfo) {
        self.reply_owed = false;
        self.binding.start_teardown(info);
    }

    /// Discharges the obligation by closing the binding with `epitaph`.
    fn close(&mut self, epitaph: Status) {
        self.reply_owed = false;
        if let Ok(binding) = self.binding.upgrade() {
            binding.close(epitaph);
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.reply_owed && !thread::panicking() && !self.binding.is_unbound() {
            panic!(
                "completer for transaction {} (ordinal {}) dropped without a reply",
                self.txid, self.ordinal
            );
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("txid", &self.txid)
            .field("ordinal", &self.ordinal)
            .field("flexible", &self.flexible)
            .field("reply_owed", &self.reply_owed)
            .finish_non_exhaustive()
    }
}

/// Handler-scoped access to the reply of one incoming call.
pub struct Completer<'a> {
    /// Transaction ID of the call.
    txid: u32,
    /// Method ordinal of the call.
    ordinal: u64,
    /// The obligation; `None` after [`to_owned`](Self::to_owned).
    txn: Option<Transaction>,
    /// The binding, kept for [`binding`](Self::binding).
    handle: BindingHandle,
    /// The dispatch frame's strong reference, until handed back early.
    keep_alive: &'a mut Option<Arc<AsyncBinding>>,
}

impl<'a> Completer<'a> {
    /// Completer for the call `header` arriving on `handle`.
    pub(crate) fn new(
        header: &MessageHeader,
        handle: BindingHandle,
        keep_alive: &'a mut Option<Arc<AsyncBinding>>,
    ) -> Self {
        Self {
            txid: header.txid,
            ordinal: header.ordinal,
            txn: Some(Transaction::new(header, handle.clone())),
            handle,
            keep_alive,
        }
    }

    /// The live transaction.
    fn txn(&mut self) -> &mut Transaction {
        self.txn
            .as_mut()
            .unwrap_or_else(|| panic!("completer used after to_owned"))
    }

    /// Sends the reply.
    ///
    /// # Errors
    ///
    /// [`Error::Encode`] if `payload` cannot be encoded; the reply is still
    /// owed. [`Error::Canceled`] if the binding is already torn down and
    /// [`Error::Transport`] if the write failed; in both cases the binding
    /// is (being) torn down and the obligation is discharged.
    ///
    /// # Panics
    ///
    /// Panics on a one-way call, after a previous reply, or after
    /// [`to_owned`](Self::to_owned).
    pub fn reply<T: Serialize + ?Sized>(&mut self, payload: &T) -> Result<()> {
        self.txn().reply(payload, Vec::new())
    }

    /// Like [`reply`](Self::reply), attaching `handles`.
    ///
    /// # Errors
    ///
    /// As [`reply`](Self::reply).
    pub fn reply_with_handles<T: Serialize + ?Sized>(
        &mut self,
        payload: &T,
        handles: Vec<Handle>,
    ) -> Result<()> {
        self.txn().reply(payload, handles)
    }

    /// Sends an epitaph and tears the binding down. Substitutes for a
    /// reply if one was owed.
    pub fn close(&mut self, epitaph: Status) {
        self.txn().close(epitaph);
    }

    /// Moves the obligation into an object that may outlive the handler.
    ///
    /// # Panics
    ///
    /// Panics if called twice.
    pub fn to_owned(&mut self) -> OwnedCompleter {
        let txn = self
            .txn
            .take()
            .unwrap_or_else(|| panic!("completer converted to owned twice"));
        OwnedCompleter { txn }
    }

    /// Lets the binding dispatch the next message before this handler
    /// returns. On a multi-thread dispatcher the next message may then be
    /// handled in parallel. Calling it again does nothing.
    pub fn enable_next_dispatch(&mut self) {
        if let Some(binding) = self.keep_alive.take() {
            binding.resume_dispatch();
        }
    }

    /// Transaction ID of the call; 0 for one-way calls.
    pub const fn txid(&self) -> u32 {
        self.txid
    }

    /// Method ordinal of the call.
    pub const fn ordinal(&self) -> u64 {
        self.ordinal
    }

    /// The server binding the call arrived on, e.g. for sending events.
    pub fn binding(&self) -> ServerBindingRef {
        ServerBindingRef::new(self.handle.clone())
    }

    /// Discharges the obligation of an unknown flexible two-way call.
    pub(crate) fn reply_unknown_method(&mut self) -> Result<()> {
        self.txn().reply_unknown_method()
    }

    /// Drops the obligation without replying; used when the binding is
    /// about to be torn down anyway.
    pub(crate) fn abandon(&mut self) {
        if let Some(txn) = self.txn.as_mut() {
            txn.reply_owed = false;
        }
    }
}

impl fmt::Debug for Completer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("txn", &self.txn)
            .field("holds_binding", &self.keep_alive.is_some())
            .finish()
    }
}

/// A reply obligation detached from the handler that received it.
///
/// Holds only a weak reference to the binding: teardown is never blocked
/// by an outstanding owned completer.
#[derive(Debug)]
pub struct OwnedCompleter {
    /// The obligation.
    txn: Transaction,
}

impl OwnedCompleter {
    /// Sends the reply.
    ///
    /// # Errors
    ///
    /// As [`Completer::reply`], except that an encode error also tears the
    /// binding down: the consumed completer cannot try again.
    ///
    /// # Panics
    ///
    /// Panics on a one-way call.
    pub fn reply<T: Serialize + ?Sized>(mut self, payload: &T) -> Result<()> {
        let result = self.txn.reply(payload, Vec::new());
        if matches!(result, Err(Error::Encode(_))) {
            self.txn.abort(UnbindInfo::encode_error(Status::INVALID_ARGS));
        }
        result
    }

    /// Like [`reply`](Self::reply), attaching `handles`.
    ///
    /// # Errors
    ///
    /// As [`reply`](Self::reply).
    pub fn reply_with_handles<T: Serialize + ?Sized>(
        mut self,
        payload: &T,
        handles: Vec<Handle>,
    ) -> Result<()> {
        let result = self.txn.reply(payload, handles);
        if matches!(result, Err(Error::Encode(_))) {
            self.txn.abort(UnbindInfo::encode_error(Status::INVALID_ARGS));
        }
        result
    }

    /// Sends an epitaph and tears the binding down.
    pub fn close(mut self, epitaph: Status) {
        self.txn.close(epitaph);
    }

    /// `true` until a reply or close discharges the obligation.
    pub const fn is_reply_owed(&self) -> bool {
        self.txn.reply_owed
    }

    /// Transaction ID of the call.
    pub const fn txid(&self) -> u32 {
        self.txn.txid
    }
}
