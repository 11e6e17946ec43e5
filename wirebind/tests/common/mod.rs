//! Shared fixtures: an echo protocol and teardown observers.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, missing_docs)]

use std::sync::mpsc;
use std::time::Duration;

use tokio::runtime::Runtime;
use wirebind::{IncomingMessage, OwnedCompleter, Router, UnbindInfo};

/// `Echo(string) -> string`.
pub const ECHO: u64 = 1;
/// `Notify(string)`, re-broadcast as [`ON_NOTIFY`].
pub const NOTIFY: u64 = 2;
/// Event carrying a notified string.
pub const ON_NOTIFY: u64 = 3;
/// `Defer(string) -> string`, answered later through an owned completer.
pub const DEFER: u64 = 4;

/// How long a test waits for something that should happen promptly.
pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

pub fn echo_router() -> Router {
    Router::new()
        .two_way(ECHO, |text: String, completer| {
            let _ = completer.reply(&text);
        })
        .one_way(NOTIFY, |text: String, completer| {
            let _ = completer.binding().send_event(ON_NOTIFY, &text);
        })
}

/// Adds [`DEFER`], handing each owned completer to the returned receiver.
pub fn deferring_router() -> (Router, mpsc::Receiver<(String, OwnedCompleter)>) {
    let (tx, rx) = mpsc::channel();
    let router = echo_router().two_way(DEFER, move |text: String, completer| {
        tx.send((text, completer.to_owned())).unwrap();
    });
    (router, rx)
}

/// Records teardown notifications.
pub struct Unbound(mpsc::Receiver<UnbindInfo>);

impl Unbound {
    pub fn new() -> (impl FnOnce(UnbindInfo) + Send + 'static, Self) {
        let (tx, rx) = mpsc::channel();
        (
            move |info| {
                let _ = tx.send(info);
            },
            Self(rx),
        )
    }

    /// Blocks until the binding is torn down.
    pub fn wait(&self) -> UnbindInfo {
        self.0.recv_timeout(TIMEOUT).expect("binding was not torn down")
    }

    /// `true` if nothing further is reported within a short grace period.
    pub fn quiet(&self) -> bool {
        self.0.recv_timeout(Duration::from_millis(100)).is_err()
    }
}

/// Decodes a string payload.
pub fn text(message: &IncomingMessage) -> String {
    message.decode::<String>().unwrap()
}
