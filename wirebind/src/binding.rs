//! The asynchronous binding shared by clients and servers.
//!
//! An [`AsyncBinding`] couples a transport to either a client (replies and
//! events) or a server (incoming calls). Its lifecycle is
//!
//! ```text
//! Created -> Bound -> MustTeardown(info) -> Torndown(info)
//! ```
//!
//! The strong self-reference that keeps a bound binding alive lives in
//! exactly one place at a time: the pending wait on the dispatcher, the
//! dispatch currently running a handler, or a posted teardown task. Every
//! state transition happens under the binding lock.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use wirebind_proto::{Status, encode_epitaph};

use crate::channel_ref::{ChannelRef, ChannelRefTracker};
use crate::client::ClientBase;
use crate::dispatcher::{Dispatcher, Wait};
use crate::error::{Error, Result, UnbindInfo};
use crate::server::{self, Dispatch};
use crate::transport::{IncomingMessage, Message, Transport};

/// Callback fired once with the reason the binding was torn down.
pub(crate) type UnboundObserver = Box<dyn FnOnce(UnbindInfo) + Send>;

/// What sits on the other side of the binding.
pub(crate) enum Role {
    /// Receives replies and events.
    Client(Arc<ClientBase>),
    /// Receives calls.
    Server(Arc<dyn Dispatch>),
}

/// Binding lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    /// Constructed, no wait registered yet.
    Created,
    /// Dispatching messages.
    Bound,
    /// Teardown requested; performed once the current owner of the strong
    /// reference lets go.
    MustTeardown(UnbindInfo),
    /// Terminal.
    Torndown(UnbindInfo),
}

/// Where teardown runs when a dispatch cycle ends in one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    /// In the current frame, which is already a dispatcher callback.
    Inline,
    /// In a task posted to the dispatcher.
    Posted,
}

/// A wait registered under the binding lock, to be started after it is
/// released.
struct Armed {
    /// Second handle to the wait stored in [`State::wait`].
    wait: Wait,
    /// What the wait watches.
    channel: Arc<ChannelRef>,
}

/// State guarded by the binding lock.
struct State {
    /// Current lifecycle stage.
    lifecycle: Lifecycle,
    /// The pending wait, if the strong reference currently lives there.
    wait: Option<Wait>,
    /// Fired once at teardown.
    observer: Option<UnboundObserver>,
}

/// One endpoint's participation in a protocol session.
pub(crate) struct AsyncBinding {
    /// Runs waits and teardown.
    dispatcher: Dispatcher,
    /// Owns the transport.
    channel: ChannelRefTracker,
    /// Client or server half.
    role: Role,
    /// Guarded lifecycle state.
    state: Mutex<State>,
    /// Set exactly once, at teardown; shared with weak handles.
    outcome: Arc<OnceLock<UnbindInfo>>,
    /// Weak self-reference for handing out strong references.
    this: Weak<Self>,
}

impl AsyncBinding {
    /// Creates a binding over `transport` without starting it.
    fn new(
        dispatcher: &Dispatcher,
        transport: Box<dyn Transport>,
        role: Role,
        observer: Option<UnboundObserver>,
    ) -> Arc<Self> {
        let channel = ChannelRefTracker::new();
        channel.init(transport);
        Arc::new_cyclic(|this| Self {
            dispatcher: dispatcher.clone(),
            channel,
            role,
            state: Mutex::new(State {
                lifecycle: Lifecycle::Created,
                wait: None,
                observer,
            }),
            outcome: Arc::new(OnceLock::new()),
            this: this.clone(),
        })
    }

    /// Creates a binding and registers its first wait.
    pub(crate) fn bind(
        dispatcher: &Dispatcher,
        transport: Box<dyn Transport>,
        role: Role,
        observer: Option<UnboundObserver>,
    ) -> Arc<Self> {
        let binding = Self::new(dispatcher, transport, role, observer);
        binding.begin_first_wait();
        binding
    }

    /// Moves the binding from `Created` to `Bound`.
    ///
    /// # Panics
    ///
    /// Panics if the binding was already bound.
    fn begin_first_wait(&self) {
        let armed = {
            let mut state = self.lock();
            assert_eq!(
                state.lifecycle,
                Lifecycle::Created,
                "binding bound more than once"
            );
            state.lifecycle = Lifecycle::Bound;
            tracing::debug!(role = self.role_name(), "binding bound");
            match self.arm_wait(&mut state) {
                Ok(armed) => Some(armed),
                Err(info) => {
                    state.lifecycle = Lifecycle::MustTeardown(info);
                    None
                }
            }
        };
        match armed {
            Some(armed) => self.start_wait(armed),
            None => self.post_teardown(),
        }
    }

    /// A weak handle to this binding.
    pub(crate) fn handle(&self) -> BindingHandle {
        BindingHandle {
            binding: self.this.clone(),
            outcome: Arc::clone(&self.outcome),
        }
    }

    /// Locks the binding state.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Label used in log lines.
    const fn role_name(&self) -> &'static str {
        match self.role {
            Role::Client(_) => "client",
            Role::Server(_) => "server",
        }
    }

    /// `true` while the binding dispatches and no teardown is pending.
    pub(crate) fn is_bound(&self) -> bool {
        matches!(self.lock().lifecycle, Lifecycle::Bound)
    }

    /// Registers a wait that moves a strong reference into the dispatcher.
    /// It only starts watching once passed to
    /// [`start_wait`](Self::start_wait), which must happen with the lock
    /// released: on a stopped runtime the handler runs right away.
    fn arm_wait(&self, state: &mut State) -> std::result::Result<Armed, UnbindInfo> {
        let (Some(channel), Some(this)) = (self.channel.get(), self.this.upgrade()) else {
            return Err(UnbindInfo::dispatcher_error(Status::BAD_STATE));
        };
        let wait = Wait::new(move |result| this.on_readable(result));
        let armed = Armed {
            wait: wait.share(),
            channel,
        };
        state.wait = Some(wait);
        Ok(armed)
    }

    /// Starts a wait armed under the lock.
    fn start_wait(&self, armed: Armed) {
        self.dispatcher.start_wait(&armed.wait, armed.channel);
    }

    /// Wait handler: the strong reference now belongs to this frame.
    fn on_readable(self: Arc<Self>, result: std::result::Result<(), Status>) {
        let bound = {
            let mut state = self.lock();
            state.wait = None;
            matches!(state.lifecycle, Lifecycle::Bound)
        };
        let this = Arc::clone(&self);
        let mut keep_alive = Some(self);
        let error = match result {
            Err(status) => Some(UnbindInfo::dispatcher_error(status)),
            Ok(()) if bound => this.dispatch_one(&mut keep_alive),
            Ok(()) => None,
        };
        match keep_alive {
            Some(binding) => binding.finish_dispatch(error, Teardown::Inline),
            // A handler already resumed dispatching; the binding is no
            // longer ours to tear down directly.
            None => {
                if let Some(info) = error {
                    this.start_teardown(info);
                }
            }
        }
    }

    /// Reads and routes a single message. Returns the teardown reason if
    /// the binding must stop.
    fn dispatch_one(&self, keep_alive: &mut Option<Arc<Self>>) -> Option<UnbindInfo> {
        let channel = self.channel.get()?;
        let message = match channel.read() {
            Ok(message) => message,
            Err(status) if status == Status::SHOULD_WAIT => return None,
            Err(status) if status == Status::PEER_CLOSED => {
                return Some(UnbindInfo::peer_closed(status));
            }
            Err(status) => {
                tracing::warn!(role = self.role_name(), "transport read failed: {status}");
                return Some(UnbindInfo::transport_error(status));
            }
        };
        drop(channel);

        let message = match IncomingMessage::parse(message) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(role = self.role_name(), "dropping malformed message: {e}");
                return Some(UnbindInfo::unexpected_message(Status::INVALID_ARGS));
            }
        };
        tracing::trace!(
            role = self.role_name(),
            txid = message.txid(),
            ordinal = message.ordinal(),
            "dispatching message"
        );
        match &self.role {
            Role::Client(client) => client.dispatch(message),
            Role::Server(dispatch) => {
                server::dispatch_message(dispatch.as_ref(), &self.handle(), message, keep_alive)
            }
        }
    }

    /// Ends a dispatch cycle: re-arms the wait, or tears down if requested.
    fn finish_dispatch(&self, error: Option<UnbindInfo>, teardown: Teardown) {
        let armed = {
            let mut state = self.lock();
            if let Some(info) = error {
                self.request_teardown(&mut state, info);
            }
            match state.lifecycle {
                Lifecycle::Bound => match self.arm_wait(&mut state) {
                    Ok(armed) => Some(armed),
                    Err(info) => {
                        state.lifecycle = Lifecycle::MustTeardown(info);
                        None
                    }
                },
                Lifecycle::MustTeardown(_) => None,
                Lifecycle::Created | Lifecycle::Torndown(_) => return,
            }
        };
        if let Some(armed) = armed {
            self.start_wait(armed);
            return;
        }
        match teardown {
            Teardown::Inline => self.perform_teardown(),
            Teardown::Posted => self.post_teardown(),
        }
    }

    /// Hands a strong reference taken out of a dispatch back to the
    /// dispatcher. Teardown, if due, is posted rather than run in place.
    pub(crate) fn resume_dispatch(&self) {
        self.finish_dispatch(None, Teardown::Posted);
    }

    /// Moves `Bound` to `MustTeardown`. Returns `false` if teardown was
    /// already requested.
    fn request_teardown(&self, state: &mut State, info: UnbindInfo) -> bool {
        match state.lifecycle {
            Lifecycle::Created | Lifecycle::Bound => {
                tracing::debug!(role = self.role_name(), "teardown requested: {info}");
                state.lifecycle = Lifecycle::MustTeardown(info);
                true
            }
            Lifecycle::MustTeardown(_) | Lifecycle::Torndown(_) => false,
        }
    }

    /// Requests teardown with `info`. The first request wins; later ones
    /// return `false` and change nothing.
    ///
    /// Teardown itself runs on the dispatcher once the in-flight dispatch,
    /// if any, returns.
    pub(crate) fn start_teardown(&self, info: UnbindInfo) -> bool {
        let mut state = self.lock();
        if !self.request_teardown(&mut state, info) {
            return false;
        }
        if let Some(wait) = state.wait.take() {
            if wait.cancel() {
                drop(state);
                self.post_teardown();
            }
            // Otherwise the wait handler is already running and will see
            // the request when it takes the lock.
        }
        true
    }

    /// Schedules [`perform_teardown`](Self::perform_teardown) on the
    /// dispatcher.
    fn post_teardown(&self) {
        if let Some(this) = self.this.upgrade() {
            self.dispatcher.post_task(move || this.perform_teardown());
        }
    }

    /// Moves `MustTeardown` to `Torndown` and notifies everyone once.
    fn perform_teardown(&self) {
        let (info, observer) = {
            let mut state = self.lock();
            let Lifecycle::MustTeardown(info) = state.lifecycle else {
                return;
            };
            state.lifecycle = Lifecycle::Torndown(info);
            if let Some(wait) = state.wait.take() {
                wait.cancel();
            }
            (info, state.observer.take())
        };
        let _ = self.outcome.set(info);
        self.channel.release();
        if info.is_user_initiated() {
            tracing::debug!(role = self.role_name(), "{info}");
        } else {
            tracing::warn!(role = self.role_name(), "{info}");
        }

        if let Role::Client(client) = &self.role {
            client.on_teardown(info);
        }
        if let Some(observer) = observer {
            observer(info);
        }
    }

    /// A reference to the transport, unless teardown completed.
    fn channel(&self) -> Result<Arc<ChannelRef>> {
        let torn_down = match self.lock().lifecycle {
            Lifecycle::Torndown(info) => Some(info),
            _ => None,
        };
        if let Some(info) = torn_down {
            return Err(Error::Canceled(info));
        }
        self.channel.get().ok_or_else(|| {
            Error::Canceled(self.outcome.get().copied().unwrap_or_else(UnbindInfo::unbind))
        })
    }

    /// Writes one message. A failed write tears the binding down.
    pub(crate) fn send(&self, message: Message) -> Result<()> {
        self.send_with_rollback(message, || {})
    }

    /// Like [`send`](Self::send); if the write fails, `rollback` runs
    /// before teardown is requested.
    pub(crate) fn send_with_rollback(
        &self,
        message: Message,
        rollback: impl FnOnce(),
    ) -> Result<()> {
        let channel = self.channel()?;
        let result = channel.write(message);
        drop(channel);
        result.map_err(|status| {
            rollback();
            let info = if status == Status::PEER_CLOSED {
                UnbindInfo::peer_closed(status)
            } else {
                tracing::warn!(role = self.role_name(), "transport write failed: {status}");
                UnbindInfo::transport_error(status)
            };
            self.start_teardown(info);
            Error::Transport(status)
        })
    }

    /// Sends an epitaph carrying `epitaph`, best effort, and tears down.
    pub(crate) fn close(&self, epitaph: Status) {
        match encode_epitaph(epitaph) {
            Ok(bytes) => {
                if let Ok(channel) = self.channel() {
                    let _ = channel.write(Message::new(bytes));
                }
            }
            Err(e) => tracing::warn!(role = self.role_name(), "epitaph not sent: {e}"),
        }
        self.start_teardown(UnbindInfo::close(epitaph));
    }

    /// Requests teardown, then blocks until every in-flight user of the
    /// transport lets go and returns it.
    pub(crate) fn wait_for_channel(&self) -> Option<Box<dyn Transport>> {
        self.start_teardown(UnbindInfo::unbind());
        self.channel.wait_for_channel()
    }
}

impl fmt::Debug for AsyncBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncBinding")
            .field("role", &self.role_name())
            .field("lifecycle", &self.lock().lifecycle)
            .finish_non_exhaustive()
    }
}

/// A weak reference to a binding that also remembers how it ended.
#[derive(Clone)]
pub(crate) struct BindingHandle {
    /// The binding, while it is alive.
    binding: Weak<AsyncBinding>,
    /// Teardown outcome, readable after the binding is gone.
    outcome: Arc<OnceLock<UnbindInfo>>,
}

impl BindingHandle {
    /// A strong reference, or the cancellation error explaining its
    /// absence.
    pub(crate) fn upgrade(&self) -> Result<Arc<AsyncBinding>> {
        self.binding.upgrade().ok_or_else(|| {
            Error::Canceled(self.unbind_info().unwrap_or_else(UnbindInfo::unbind))
        })
    }

    /// How the binding ended, once it has.
    pub(crate) fn unbind_info(&self) -> Option<UnbindInfo> {
        self.outcome.get().copied()
    }

    /// `true` once teardown completed or the binding no longer exists.
    pub(crate) fn is_unbound(&self) -> bool {
        self.outcome.get().is_some() || self.binding.strong_count() == 0
    }

    /// `true` while the binding is alive and dispatching.
    pub(crate) fn is_bound(&self) -> bool {
        self.binding.upgrade().is_some_and(|binding| binding.is_bound())
    }

    /// Writes one message through the binding.
    pub(crate) fn send(&self, message: Message) -> Result<()> {
        self.upgrade()?.send(message)
    }

    /// Requests teardown if the binding is still alive.
    pub(crate) fn start_teardown(&self, info: UnbindInfo) -> bool {
        self.binding
            .upgrade()
            .is_some_and(|binding| binding.start_teardown(info))
    }
}

impl fmt::Debug for BindingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingHandle")
            .field("unbind_info", &self.unbind_info())
            .finish_non_exhaustive()
    }
}
