//! Server bindings: routing incoming calls to handlers.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use wirebind_proto::{MessageHeader, Status, encode_with_header};

use crate::binding::{AsyncBinding, BindingHandle, Role, UnboundObserver};
use crate::completer::Completer;
use crate::dispatcher::Dispatcher;
use crate::error::{Result, UnbindInfo};
use crate::transport::{Handle, IncomingMessage, Message, Transport};

/// Result of offering a message to a [`Dispatch`] implementation.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The message was consumed.
    Handled,
    /// The ordinal is not part of this protocol; the message is handed
    /// back so another protocol may try it.
    NotFound(IncomingMessage),
    /// The message was recognised but the binding must be torn down.
    Failed(UnbindInfo),
}

/// A flexible call that no route recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownMethod {
    /// Ordinal of the call.
    pub ordinal: u64,
    /// `true` if the caller waits for a reply.
    pub two_way: bool,
}

/// Decodes incoming calls and invokes typed handlers.
///
/// Implementations must not fail on unknown ordinals; they return
/// [`DispatchOutcome::NotFound`] so protocols can be composed with
/// [`Chain`].
///
/// What happens to an unknown ordinal depends on the caller's header. A
/// strict call tears the binding down. A flexible one keeps it up: a
/// two-way call is answered with
/// [`FlexibleReply::FrameworkError`](wirebind_proto::FlexibleReply), a
/// one-way call is dropped, and either is reported to
/// [`on_unknown_method`](Self::on_unknown_method).
pub trait Dispatch: Send + Sync + 'static {
    /// Handles one call. For two-way calls `completer` owes a reply.
    fn dispatch(&self, message: IncomingMessage, completer: &mut Completer<'_>)
    -> DispatchOutcome;

    /// Observes a flexible call nothing handled. Runs after the framework
    /// reply, if any, has been sent.
    fn on_unknown_method(&self, _method: UnknownMethod) {}
}

impl<D: Dispatch + ?Sized> Dispatch for Arc<D> {
    fn dispatch(
        &self,
        message: IncomingMessage,
        completer: &mut Completer<'_>,
    ) -> DispatchOutcome {
        (**self).dispatch(message, completer)
    }

    fn on_unknown_method(&self, method: UnknownMethod) {
        (**self).on_unknown_method(method);
    }
}

impl<D: Dispatch + ?Sized> Dispatch for Box<D> {
    fn dispatch(
        &self,
        message: IncomingMessage,
        completer: &mut Completer<'_>,
    ) -> DispatchOutcome {
        (**self).dispatch(message, completer)
    }

    fn on_unknown_method(&self, method: UnknownMethod) {
        (**self).on_unknown_method(method);
    }
}

/// Serves two protocols on one binding, trying `first` then `second`.
#[derive(Debug, Clone)]
pub struct Chain<A, B> {
    /// Tried first.
    first: A,
    /// Tried when `first` does not know the ordinal.
    second: B,
}

impl<A: Dispatch, B: Dispatch> Chain<A, B> {
    /// Composes `first` and `second`.
    pub const fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

impl<A: Dispatch, B: Dispatch> Dispatch for Chain<A, B> {
    fn dispatch(
        &self,
        message: IncomingMessage,
        completer: &mut Completer<'_>,
    ) -> DispatchOutcome {
        match self.first.dispatch(message, completer) {
            DispatchOutcome::NotFound(message) => self.second.dispatch(message, completer),
            outcome => outcome,
        }
    }

    /// Both protocols are told.
    fn on_unknown_method(&self, method: UnknownMethod) {
        self.first.on_unknown_method(method);
        self.second.on_unknown_method(method);
    }
}

/// Routes one message arriving on a server binding.
pub(crate) fn dispatch_message(
    dispatch: &dyn Dispatch,
    handle: &BindingHandle,
    message: IncomingMessage,
    keep_alive: &mut Option<Arc<AsyncBinding>>,
) -> Option<UnbindInfo> {
    if message.header().is_epitaph() {
        tracing::warn!("server received an epitaph");
        return Some(UnbindInfo::unexpected_message(Status::INVALID_ARGS));
    }
    let header = *message.header();
    let mut completer = Completer::new(&header, handle.clone(), keep_alive);
    match dispatch.dispatch(message, &mut completer) {
        DispatchOutcome::Handled => None,
        DispatchOutcome::NotFound(_) if header.is_flexible() => {
            let method = UnknownMethod {
                ordinal: header.ordinal,
                two_way: header.txid != 0,
            };
            tracing::debug!(
                ordinal = method.ordinal,
                two_way = method.two_way,
                "unknown flexible method"
            );
            if method.two_way {
                // A failed write has already started teardown.
                if let Err(e) = completer.reply_unknown_method() {
                    tracing::debug!(ordinal = method.ordinal, "framework reply not sent: {e}");
                }
            }
            dispatch.on_unknown_method(method);
            None
        }
        DispatchOutcome::NotFound(_) => {
            tracing::warn!(ordinal = header.ordinal, "unknown strict method");
            completer.abandon();
            Some(UnbindInfo::unexpected_message(Status::NOT_SUPPORTED))
        }
        DispatchOutcome::Failed(info) => {
            completer.abandon();
            Some(info)
        }
    }
}

/// Binds `dispatch` to `transport` and starts serving on `dispatcher`.
///
/// `on_unbound` fires once with the reason the binding ended. The binding
/// keeps itself alive while it dispatches; dropping the returned reference
/// does not unbind it.
pub fn bind_server<T, D, F>(
    dispatcher: &Dispatcher,
    transport: T,
    dispatch: D,
    on_unbound: F,
) -> ServerBindingRef
where
    T: Transport,
    D: Dispatch,
    F: FnOnce(UnbindInfo) + Send + 'static,
{
    ServerBuilder::new(dispatcher)
        .on_unbound(on_unbound)
        .bind(transport, dispatch)
}

/// Builder for server bindings.
pub struct ServerBuilder {
    /// Runs the binding.
    dispatcher: Dispatcher,
    /// Fired once at teardown.
    on_unbound: Option<UnboundObserver>,
}

impl ServerBuilder {
    /// A builder serving on `dispatcher`.
    pub fn new(dispatcher: &Dispatcher) -> Self {
        Self {
            dispatcher: dispatcher.clone(),
            on_unbound: None,
        }
    }

    /// Callback fired once when the binding is torn down.
    #[must_use]
    pub fn on_unbound(mut self, f: impl FnOnce(UnbindInfo) + Send + 'static) -> Self {
        self.on_unbound = Some(Box::new(f));
        self
    }

    /// Binds `dispatch` to `transport` and starts serving.
    pub fn bind(self, transport: impl Transport, dispatch: impl Dispatch) -> ServerBindingRef {
        let binding = AsyncBinding::bind(
            &self.dispatcher,
            Box::new(transport),
            Role::Server(Arc::new(dispatch)),
            self.on_unbound,
        );
        ServerBindingRef::new(binding.handle())
    }
}

impl fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("dispatcher", &self.dispatcher)
            .field("on_unbound", &self.on_unbound.is_some())
            .finish()
    }
}

/// A weak reference to a server binding.
#[derive(Debug, Clone)]
pub struct ServerBindingRef {
    /// The binding.
    handle: BindingHandle,
}

impl ServerBindingRef {
    /// Wraps a binding handle.
    pub(crate) const fn new(handle: BindingHandle) -> Self {
        Self { handle }
    }

    /// Requests teardown without an epitaph.
    pub fn unbind(&self) {
        self.handle.start_teardown(UnbindInfo::unbind());
    }

    /// Sends an epitaph carrying `epitaph`, then tears down.
    pub fn close(&self, epitaph: Status) {
        if let Ok(binding) = self.handle.upgrade() {
            binding.close(epitaph);
        }
    }

    /// Sends an event (a message with transaction ID 0) to the client.
    ///
    /// # Errors
    ///
    /// [`Error::Encode`](crate::Error::Encode) if `payload` cannot be
    /// encoded, [`Error::Canceled`](crate::Error::Canceled) once torn down,
    /// [`Error::Transport`](crate::Error::Transport) if the write failed.
    pub fn send_event<T: Serialize + ?Sized>(&self, ordinal: u64, payload: &T) -> Result<()> {
        self.send_event_with_handles(ordinal, payload, Vec::new())
    }

    /// Sends an event marked flexible: a client that does not know
    /// `ordinal` reports it to
    /// [`EventHandler::on_unknown_event`](crate::EventHandler::on_unknown_event)
    /// instead of tearing down.
    ///
    /// # Errors
    ///
    /// As [`send_event`](Self::send_event).
    pub fn send_flexible_event<T: Serialize + ?Sized>(
        &self,
        ordinal: u64,
        payload: &T,
    ) -> Result<()> {
        let header = MessageHeader::new(0, ordinal).flexible();
        let bytes = encode_with_header(header, payload).map_err(crate::Error::Encode)?;
        self.handle.send(Message::new(bytes))
    }

    /// Like [`send_event`](Self::send_event), attaching `handles`.
    ///
    /// # Errors
    ///
    /// As [`send_event`](Self::send_event).
    pub fn send_event_with_handles<T: Serialize + ?Sized>(
        &self,
        ordinal: u64,
        payload: &T,
        handles: Vec<Handle>,
    ) -> Result<()> {
        let header = MessageHeader::new(0, ordinal);
        let bytes = encode_with_header(header, payload).map_err(crate::Error::Encode)?;
        self.handle.send(Message::with_handles(bytes, handles))
    }

    /// `true` while the binding dispatches and no teardown is pending.
    pub fn is_bound(&self) -> bool {
        self.handle.is_bound()
    }

    /// How the binding ended, once it has.
    pub fn unbind_info(&self) -> Option<UnbindInfo> {
        self.handle.unbind_info()
    }
}
