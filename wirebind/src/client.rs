//! Client bindings: issuing calls and receiving replies and events.
//!
//! A [`Client`] is a cheap, cloneable handle. Calls may be issued from any
//! thread; replies and events are delivered on the dispatcher. Dropping the
//! last clone unbinds.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use wirebind_proto::{
    CodecError, Epitaph, FlexibleReply, MessageHeader, Status, encode_with_header,
};

use crate::binding::{AsyncBinding, BindingHandle, Role, UnboundObserver};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result, UnbindInfo};
use crate::registry::{ResponseContext, ResponseRegistry};
use crate::server::DispatchOutcome;
use crate::transport::{Handle, IncomingMessage, Message, Transport};

/// Receives events and the teardown notice of a client binding.
///
/// All methods run on the dispatcher.
pub trait EventHandler: Send + Sync + 'static {
    /// Handles an event (a message with transaction ID 0).
    ///
    /// [`DispatchOutcome::Failed`] tears the binding down with that
    /// reason. [`DispatchOutcome::NotFound`] does too for a strict event;
    /// a flexible one goes to [`on_unknown_event`](Self::on_unknown_event)
    /// instead. The default knows no events.
    fn on_event(&self, event: IncomingMessage) -> DispatchOutcome {
        DispatchOutcome::NotFound(event)
    }

    /// A flexible event with an ordinal [`on_event`](Self::on_event) did
    /// not know. The binding stays up.
    fn on_unknown_event(&self, _ordinal: u64) {}

    /// Called once when the binding is torn down, after outstanding calls
    /// have been canceled.
    fn on_unbound(&self, _info: UnbindInfo) {}
}

/// Client half of a binding, owned by the binding itself.
pub(crate) struct ClientBase {
    /// The binding; set right after it is created.
    handle: OnceLock<BindingHandle>,
    /// Outstanding two-way calls.
    registry: ResponseRegistry,
    /// Receives events.
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl ClientBase {
    /// Routes one message to the waiting call or the event handler.
    pub(crate) fn dispatch(&self, message: IncomingMessage) -> Option<UnbindInfo> {
        if message.txid() == 0 {
            if message.header().is_epitaph() {
                return Some(match message.decode::<Epitaph>() {
                    Ok(epitaph) => UnbindInfo::peer_closed(epitaph.error),
                    Err(e) => {
                        tracing::warn!("malformed epitaph: {e}");
                        UnbindInfo::decode_error(Status::INVALID_ARGS)
                    }
                });
            }
            return self.dispatch_event(message);
        }
        match self.registry.resolve(message.txid()) {
            Some(context) => context.on_reply(message),
            None => {
                tracing::warn!(txid = message.txid(), "reply to unknown transaction");
                Some(UnbindInfo::unexpected_message(Status::NOT_FOUND))
            }
        }
    }

    /// Offers an event to the handler; unknown flexible events are
    /// tolerated.
    fn dispatch_event(&self, message: IncomingMessage) -> Option<UnbindInfo> {
        let header = *message.header();
        let outcome = match &self.event_handler {
            Some(handler) => handler.on_event(message),
            None => DispatchOutcome::NotFound(message),
        };
        match outcome {
            DispatchOutcome::Handled => None,
            DispatchOutcome::Failed(info) => Some(info),
            DispatchOutcome::NotFound(_) if header.is_flexible() => {
                tracing::debug!(ordinal = header.ordinal, "unknown flexible event");
                if let Some(handler) = &self.event_handler {
                    handler.on_unknown_event(header.ordinal);
                }
                None
            }
            DispatchOutcome::NotFound(_) => {
                tracing::warn!(ordinal = header.ordinal, "unknown strict event");
                Some(UnbindInfo::unexpected_message(Status::NOT_SUPPORTED))
            }
        }
    }

    /// Fails outstanding calls and notifies the event handler.
    ///
    /// Calls fail with [`Error::Protocol`] when the peer broke the
    /// protocol, with [`Error::Canceled`] otherwise.
    pub(crate) fn on_teardown(&self, info: UnbindInfo) {
        let error = if info.is_protocol_error() {
            Error::Protocol(info)
        } else {
            Error::Canceled(info)
        };
        self.registry.flush_all_with_error(&error);
        if let Some(handler) = &self.event_handler {
            handler.on_unbound(info);
        }
    }

    /// The binding handle.
    fn handle(&self) -> Result<&BindingHandle> {
        self.handle
            .get()
            .ok_or(Error::Canceled(UnbindInfo::unbind()))
    }

    /// Encodes and writes a message with transaction ID 0.
    fn send_one_way<T: Serialize + ?Sized>(
        &self,
        header: MessageHeader,
        payload: &T,
        handles: Vec<Handle>,
    ) -> Result<()> {
        let bytes = encode_with_header(header, payload).map_err(Error::Encode)?;
        self.handle()?.send(Message::with_handles(bytes, handles))
    }

    /// Encodes a request, registers `context` for its reply and writes it.
    ///
    /// On `Err` the context was dropped without being notified. On `Ok`
    /// it is notified exactly once, with the reply or with an error.
    fn send_two_way<T: Serialize + ?Sized>(
        &self,
        header: MessageHeader,
        payload: &T,
        handles: Vec<Handle>,
        context: Box<dyn ResponseContext>,
    ) -> Result<()> {
        let ordinal = header.ordinal;
        let mut bytes = encode_with_header(header, payload).map_err(Error::Encode)?;
        let handle = self.handle()?;
        let binding = handle.upgrade()?;
        let Ok(registration) = self.registry.allocate(context) else {
            return Err(Error::Canceled(
                handle.unbind_info().unwrap_or_else(UnbindInfo::unbind),
            ));
        };
        MessageHeader::set_txid(&mut bytes, registration.txid());
        tracing::trace!(txid = registration.txid(), ordinal, "sending request");

        // A failed write forgets the registration before teardown can
        // flush it, so the context is never notified.
        let mut forgotten = None;
        let sent = binding.send_with_rollback(Message::with_handles(bytes, handles), || {
            forgotten = self.registry.forget(registration);
        });
        if let Err(e) = sent {
            // Without a registration to forget, teardown already flushed
            // it and the context has seen the error.
            if forgotten.is_some() || self.registry.forget(registration).is_some() {
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Delivers a decoded reply to a callback.
struct CallbackContext<R, F> {
    /// Receives the outcome.
    callback: F,
    /// The call was flexible; the reply is a [`FlexibleReply`].
    flexible: bool,
    /// Reply type.
    _response: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned, F> CallbackContext<R, F> {
    /// Decodes the reply. `Ok(None)` means the peer did not know the
    /// method.
    fn decode(&self, reply: &IncomingMessage) -> std::result::Result<Option<R>, CodecError> {
        if !self.flexible {
            return reply.decode::<R>().map(Some);
        }
        match reply.decode::<FlexibleReply<R>>()? {
            FlexibleReply::Response(response) => Ok(Some(response)),
            FlexibleReply::FrameworkError(status) if status == Status::NOT_SUPPORTED => Ok(None),
            FlexibleReply::FrameworkError(status) => Err(CodecError::Decode(format!(
                "unexpected framework error {status}"
            ))),
        }
    }
}

impl<R, F> ResponseContext for CallbackContext<R, F>
where
    R: DeserializeOwned + 'static,
    F: FnOnce(Result<R>) + Send + 'static,
{
    fn on_reply(self: Box<Self>, reply: IncomingMessage) -> Option<UnbindInfo> {
        match self.decode(&reply) {
            Ok(Some(response)) => {
                (self.callback)(Ok(response));
                None
            }
            Ok(None) => {
                (self.callback)(Err(Error::UnknownMethod));
                None
            }
            Err(e) => {
                tracing::warn!(txid = reply.txid(), "reply decode failed: {e}");
                (self.callback)(Err(Error::Decode(e)));
                Some(UnbindInfo::decode_error(Status::INVALID_ARGS))
            }
        }
    }

    fn on_error(self: Box<Self>, error: Error) {
        (self.callback)(Err(error));
    }
}

/// Wraps `callback` as a response context for a call sent with `header`.
fn callback_context<R, F>(header: &MessageHeader, callback: F) -> Box<dyn ResponseContext>
where
    R: DeserializeOwned + 'static,
    F: FnOnce(Result<R>) + Send + 'static,
{
    Box::new(CallbackContext {
        callback,
        flexible: header.is_flexible(),
        _response: PhantomData,
    })
}

/// State shared by all clones of a [`Client`].
struct ClientController {
    /// Registry and event handler, shared with the binding.
    base: Arc<ClientBase>,
    /// The binding.
    handle: BindingHandle,
}

impl Drop for ClientController {
    fn drop(&mut self) {
        self.handle.start_teardown(UnbindInfo::unbind());
    }
}

/// A client binding.
#[derive(Clone)]
pub struct Client {
    /// Shared state; its drop unbinds.
    inner: Arc<ClientController>,
}

impl Client {
    /// Binds a client without an event handler to `transport`.
    pub fn bind(dispatcher: &Dispatcher, transport: impl Transport) -> Self {
        Self::builder(dispatcher).bind(transport)
    }

    /// Returns a builder for configuring event handling.
    pub fn builder(dispatcher: &Dispatcher) -> ClientBuilder {
        ClientBuilder::new(dispatcher)
    }

    /// Sends a one-way message.
    ///
    /// # Errors
    ///
    /// [`Error::Encode`] if `payload` cannot be encoded, [`Error::Canceled`]
    /// once the binding is torn down, [`Error::Transport`] if the write
    /// failed.
    pub fn send<T: Serialize + ?Sized>(&self, ordinal: u64, payload: &T) -> Result<()> {
        let header = MessageHeader::new(0, ordinal);
        self.inner.base.send_one_way(header, payload, Vec::new())
    }

    /// Like [`send`](Self::send), attaching `handles`.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send).
    pub fn send_with_handles<T: Serialize + ?Sized>(
        &self,
        ordinal: u64,
        payload: &T,
        handles: Vec<Handle>,
    ) -> Result<()> {
        let header = MessageHeader::new(0, ordinal);
        self.inner.base.send_one_way(header, payload, handles)
    }

    /// Sends a one-way message to a flexible method. A server that does not
    /// know `ordinal` drops it and stays bound.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send).
    pub fn send_flexible<T: Serialize + ?Sized>(&self, ordinal: u64, payload: &T) -> Result<()> {
        let header = MessageHeader::new(0, ordinal).flexible();
        self.inner.base.send_one_way(header, payload, Vec::new())
    }

    /// Issues a two-way call and returns a future for its reply.
    ///
    /// The request is written before this returns; the future only waits.
    pub fn call<Req, Resp>(&self, ordinal: u64, request: &Req) -> ResponseFuture<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned + Send + 'static,
    {
        self.issue(MessageHeader::new(0, ordinal), request)
    }

    /// Issues a two-way call to a flexible method. A server that does not
    /// know `ordinal` answers with [`Error::UnknownMethod`] and stays bound.
    pub fn call_flexible<Req, Resp>(&self, ordinal: u64, request: &Req) -> ResponseFuture<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned + Send + 'static,
    {
        self.issue(MessageHeader::new(0, ordinal).flexible(), request)
    }

    /// Writes a two-way call and hands back the future for its reply.
    fn issue<Req, Resp>(&self, header: MessageHeader, request: &Req) -> ResponseFuture<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let context = callback_context(&header, move |result: Result<Resp>| {
            let _ = tx.send(result);
        });
        let failed = self
            .inner
            .base
            .send_two_way(header, request, Vec::new(), context)
            .err();
        ResponseFuture { rx, failed }
    }

    /// Issues a two-way call whose reply is passed to `callback` on the
    /// dispatcher.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send). When an error is returned `callback` is
    /// never called; otherwise it is called exactly once, with
    /// [`Error::Canceled`] if the binding is torn down first.
    pub fn call_with<Req, Resp, F>(&self, ordinal: u64, request: &Req, callback: F) -> Result<()>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned + 'static,
        F: FnOnce(Result<Resp>) + Send + 'static,
    {
        let header = MessageHeader::new(0, ordinal);
        let context = callback_context(&header, callback);
        self.inner
            .base
            .send_two_way(header, request, Vec::new(), context)
    }

    /// Issues a two-way call and blocks the current thread for its reply.
    ///
    /// Must not be called from inside an async runtime, nor on a thread the
    /// dispatcher needs to deliver the reply.
    ///
    /// # Errors
    ///
    /// As [`call_with`](Self::call_with), plus [`Error::Decode`] for an
    /// undecodable reply.
    pub fn call_sync<Req, Resp>(&self, ordinal: u64, request: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.call_with(ordinal, request, move |result: Result<Resp>| {
            let _ = tx.send(result);
        })?;
        rx.blocking_recv().unwrap_or_else(|_| Err(self.canceled()))
    }

    /// Requests teardown. Outstanding calls fail with [`Error::Canceled`].
    pub fn unbind(&self) {
        self.inner.handle.start_teardown(UnbindInfo::unbind());
    }

    /// Unbinds, then blocks until every in-flight user of the transport is
    /// done and returns it. Returns `None` if teardown had already released
    /// it.
    ///
    /// Must not be called on a thread the dispatcher needs.
    ///
    /// # Panics
    ///
    /// Panics if called twice on the same binding.
    pub fn wait_for_channel(&self) -> Option<Box<dyn Transport>> {
        self.inner.handle.upgrade().ok()?.wait_for_channel()
    }

    /// `true` while the binding dispatches and no teardown is pending.
    pub fn is_bound(&self) -> bool {
        self.inner.handle.is_bound()
    }

    /// Number of two-way calls awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.base.registry.len()
    }

    /// How the binding ended, once it has.
    pub fn unbind_info(&self) -> Option<UnbindInfo> {
        self.inner.handle.unbind_info()
    }

    /// The cancellation error for a call that lost its reply channel.
    fn canceled(&self) -> Error {
        Error::Canceled(self.unbind_info().unwrap_or_else(UnbindInfo::unbind))
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("binding", &self.inner.handle)
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

/// Builder for client bindings.
pub struct ClientBuilder {
    /// Runs the binding.
    dispatcher: Dispatcher,
    /// Receives events.
    event_handler: Option<Arc<dyn EventHandler>>,
    /// Fired once at teardown.
    on_unbound: Option<UnboundObserver>,
}

impl ClientBuilder {
    /// A builder binding on `dispatcher`.
    pub fn new(dispatcher: &Dispatcher) -> Self {
        Self {
            dispatcher: dispatcher.clone(),
            event_handler: None,
            on_unbound: None,
        }
    }

    /// Receives events and the teardown notice.
    #[must_use]
    pub fn event_handler(mut self, handler: impl EventHandler) -> Self {
        self.event_handler = Some(Arc::new(handler));
        self
    }

    /// Callback fired once when the binding is torn down, after the event
    /// handler's [`on_unbound`](EventHandler::on_unbound).
    #[must_use]
    pub fn on_unbound(mut self, f: impl FnOnce(UnbindInfo) + Send + 'static) -> Self {
        self.on_unbound = Some(Box::new(f));
        self
    }

    /// Binds to `transport` and starts receiving.
    pub fn bind(self, transport: impl Transport) -> Client {
        let base = Arc::new(ClientBase {
            handle: OnceLock::new(),
            registry: ResponseRegistry::new(),
            event_handler: self.event_handler,
        });
        let binding = AsyncBinding::bind(
            &self.dispatcher,
            Box::new(transport),
            Role::Client(Arc::clone(&base)),
            self.on_unbound,
        );
        let handle = binding.handle();
        let _ = base.handle.set(handle.clone());
        Client {
            inner: Arc::new(ClientController { base, handle }),
        }
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("dispatcher", &self.dispatcher)
            .field("event_handler", &self.event_handler.is_some())
            .field("on_unbound", &self.on_unbound.is_some())
            .finish()
    }
}

/// The reply to a call issued with [`Client::call`].
#[must_use = "the reply is discarded unless the future is awaited"]
pub struct ResponseFuture<R> {
    /// Receives the outcome from the response context.
    rx: oneshot::Receiver<Result<R>>,
    /// Set when the request never made it onto the transport.
    failed: Option<Error>,
}

impl<R> Unpin for ResponseFuture<R> {}

impl<R> Future for ResponseFuture<R> {
    type Output = Result<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(error) = this.failed.take() {
            return Poll::Ready(Err(error));
        }
        Pin::new(&mut this.rx).poll(cx).map(|result| {
            result.unwrap_or(Err(Error::Canceled(UnbindInfo::unbind())))
        })
    }
}

impl<R> fmt::Debug for ResponseFuture<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}
