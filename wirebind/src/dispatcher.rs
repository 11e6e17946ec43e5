//! Task dispatcher bindings run their callbacks on.
//!
//! A [`Dispatcher`] is a thin handle to a tokio runtime. Both the
//! current-thread and the multi-thread flavours are supported: a binding
//! never has more than one dispatch in flight, so it needs no guarantees
//! beyond FIFO execution of a single wait registration.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Notify;
use wirebind_proto::Status;

use crate::transport::Transport;

/// Wait registered and not yet resolved.
const PENDING: u8 = 0;
/// Wait handler started (or is about to).
const FIRED: u8 = 1;
/// Wait canceled before its handler started.
const CANCELED: u8 = 2;

/// Callback invoked when a wait resolves.
type WaitHandler = Box<dyn FnOnce(Result<(), Status>) + Send>;

/// Executes binding callbacks on a tokio runtime.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    /// Runtime the callbacks are spawned onto.
    handle: Handle,
}

impl Dispatcher {
    /// Wraps an existing runtime handle.
    pub const fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Dispatcher for the runtime the caller is running on.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Like [`current`](Self::current), but returns `None` outside a runtime.
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    /// Runs `task` on the dispatcher as soon as possible.
    ///
    /// If the runtime is shutting down or gone, `task` runs instead on the
    /// thread that drops it, possibly before this returns.
    pub fn post_task(&self, task: impl FnOnce() + Send + 'static) {
        let task = PostedTask(Some(task));
        self.handle.spawn(async move { task.run() });
    }

    /// Runs `task` on the dispatcher after `delay`.
    pub fn post_delayed_task(&self, task: impl FnOnce() + Send + 'static, delay: Duration) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
    }

    /// Spawns a future onto the dispatcher's runtime.
    pub(crate) fn spawn(&self, future: impl Future<Output = ()> + Send + 'static) {
        self.handle.spawn(future);
    }

    /// Calls `handler` once `object` becomes readable or its peer closes.
    ///
    /// The handler receives `Ok(())` when the object is ready, or
    /// `Err(Status::CANCELED)` if the runtime shuts down first. It never
    /// runs after a successful [`Wait::cancel`].
    pub fn begin_wait<T>(
        &self,
        object: Arc<T>,
        handler: impl FnOnce(Result<(), Status>) + Send + 'static,
    ) -> Wait
    where
        T: Transport + ?Sized,
    {
        let wait = Wait::new(handler);
        self.start_wait(&wait, object);
        wait
    }

    /// Starts watching `object` for a wait made with [`Wait::new`].
    ///
    /// On a runtime that is gone the handler fires with `CANCELED` before
    /// this returns, so callers must not hold locks the handler takes.
    pub(crate) fn start_wait<T>(&self, wait: &Wait, object: Arc<T>)
    where
        T: Transport + ?Sized,
    {
        let guard = WaitGuard(Arc::clone(&wait.shared));
        self.handle.spawn(async move {
            tokio::select! {
                () = object.readable() => {}
                () = guard.0.canceled.notified() => {}
            }
            drop(object);
            guard.fire(Ok(()));
        });
    }
}

/// A task that runs when polled, or when dropped unpolled.
struct PostedTask<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> PostedTask<F> {
    /// Runs the task now.
    fn run(mut self) {
        if let Some(task) = self.0.take() {
            task();
        }
    }
}

impl<F: FnOnce()> Drop for PostedTask<F> {
    fn drop(&mut self) {
        if let Some(task) = self.0.take() {
            task();
        }
    }
}

/// State shared between a [`Wait`] and its spawned task.
struct WaitShared {
    /// One of [`PENDING`], [`FIRED`] or [`CANCELED`].
    state: AtomicU8,
    /// Wakes the task after cancellation so it releases its captures.
    canceled: Notify,
    /// The handler, taken exactly once by whichever side resolves the wait.
    handler: Mutex<Option<WaitHandler>>,
}

impl WaitShared {
    /// Takes the handler out, if it is still there.
    fn take_handler(&self) -> Option<WaitHandler> {
        self.handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Task-side owner of a wait. Fires with `CANCELED` if the runtime drops the
/// task before it resolved.
struct WaitGuard(Arc<WaitShared>);

impl WaitGuard {
    /// Resolves the wait with `result` unless it was canceled.
    fn fire(&self, result: Result<(), Status>) {
        let handler = self.0.take_handler();
        let won = self
            .0
            .state
            .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if let (true, Some(handler)) = (won, handler) {
            handler(result);
        }
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.fire(Err(Status::CANCELED));
    }
}

/// A pending wait registered with [`Dispatcher::begin_wait`].
pub struct Wait {
    /// State shared with the waiting task.
    shared: Arc<WaitShared>,
}

impl Wait {
    /// A wait that does nothing until passed to
    /// [`Dispatcher::start_wait`]; it can be canceled before that.
    pub(crate) fn new(handler: impl FnOnce(Result<(), Status>) + Send + 'static) -> Self {
        Self {
            shared: Arc::new(WaitShared {
                state: AtomicU8::new(PENDING),
                canceled: Notify::new(),
                handler: Mutex::new(Some(Box::new(handler))),
            }),
        }
    }

    /// Another handle to the same wait.
    pub(crate) fn share(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Cancels the wait.
    ///
    /// Returns `true` if the handler had not started and never will; it is
    /// dropped on the dispatcher. Returns `false` if the handler already
    /// fired or is about to.
    pub fn cancel(&self) -> bool {
        let canceled = self
            .shared
            .state
            .compare_exchange(PENDING, CANCELED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if canceled {
            self.shared.canceled.notify_one();
        }
        canceled
    }
}

impl std::fmt::Debug for Wait {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.shared.state.load(Ordering::Acquire) {
            PENDING => "pending",
            FIRED => "fired",
            _ => "canceled",
        };
        f.debug_struct("Wait").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    use super::*;
    use crate::channel::Channel;
    use crate::transport::Message;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wait_fires_once_readable() {
        let dispatcher = Dispatcher::current();
        let (a, b) = Channel::create();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let _wait = dispatcher.begin_wait(Arc::new(b), move |result| {
            let _ = tx.send(result);
        });
        a.write(Message::new(vec![1])).unwrap();
        assert_eq!(rx.await.unwrap(), Ok(()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn canceled_wait_never_fires() {
        let dispatcher = Dispatcher::current();
        let (a, b) = Channel::create();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        let wait = dispatcher.begin_wait(Arc::new(b), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(wait.cancel());
        assert!(!wait.cancel());

        a.write(Message::new(vec![1])).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_after_fire_reports_false() {
        let dispatcher = Dispatcher::current();
        let (a, b) = Channel::create();
        let (tx, rx) = tokio::sync::oneshot::channel();
        a.write(Message::new(vec![1])).unwrap();

        let wait = dispatcher.begin_wait(Arc::new(b), move |_| {
            let _ = tx.send(());
        });
        rx.await.unwrap();
        assert!(!wait.cancel());
    }

    #[test]
    fn runtime_shutdown_fires_canceled() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let dispatcher = Dispatcher::new(runtime.handle().clone());
        let (_a, b) = Channel::create();
        let (tx, rx) = mpsc::channel();

        let _wait = dispatcher.begin_wait(Arc::new(b), move |result| {
            let _ = tx.send(result);
        });
        drop(runtime);
        assert_eq!(rx.recv().unwrap(), Err(Status::CANCELED));
    }

    #[test]
    fn posted_task_runs_once_the_runtime_is_gone() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let dispatcher = Dispatcher::new(runtime.handle().clone());
        let (tx, rx) = mpsc::channel();

        let queued = tx.clone();
        dispatcher.post_task(move || queued.send("queued").unwrap());
        drop(runtime);
        assert_eq!(rx.recv().unwrap(), "queued");

        dispatcher.post_task(move || tx.send("after shutdown").unwrap());
        assert_eq!(rx.try_recv().unwrap(), "after shutdown");
    }

    #[test]
    fn wait_on_a_stopped_runtime_fires_before_start_returns() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let dispatcher = Dispatcher::new(runtime.handle().clone());
        drop(runtime);
        let (_a, b) = Channel::create();
        let (tx, rx) = mpsc::channel();

        let wait = Wait::new(move |result| {
            let _ = tx.send(result);
        });
        dispatcher.start_wait(&wait, Arc::new(b));
        assert_eq!(rx.try_recv().unwrap(), Err(Status::CANCELED));
        assert!(!wait.cancel());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wait_canceled_before_start_never_fires() {
        let dispatcher = Dispatcher::current();
        let (a, b) = Channel::create();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        let wait = Wait::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(wait.cancel());
        dispatcher.start_wait(&wait, Arc::new(b));
        a.write(Message::new(vec![1])).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn delayed_tasks_run_after_immediate_ones() {
        let dispatcher = Dispatcher::current();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let late = tx.clone();
        dispatcher.post_delayed_task(move || late.send("late").unwrap(), Duration::from_millis(20));
        dispatcher.post_task(move || tx.send("now").unwrap());

        assert_eq!(rx.recv().await, Some("now"));
        assert_eq!(rx.recv().await, Some("late"));
    }
}
