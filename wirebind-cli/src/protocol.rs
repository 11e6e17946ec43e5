//! The echo protocol spoken by `wirebind serve`.

use std::sync::Arc;

use tokio::sync::Notify;
use wirebind::{Router, Status};

/// `Echo(string) -> string`.
pub const ECHO: u64 = 1;
/// `Notify(string)`, re-broadcast to the caller as [`ON_NOTIFY`].
pub const NOTIFY: u64 = 2;
/// Event carrying a notified string.
pub const ON_NOTIFY: u64 = 3;
/// `Shutdown()`: closes the connection with `OK` and stops the server.
pub const SHUTDOWN: u64 = 4;

/// Routes for one server connection.
pub fn router(shutdown: Arc<Notify>) -> Router {
    Router::new()
        .two_way(ECHO, |text: String, completer| {
            tracing::debug!(txid = completer.txid(), "echo {} bytes", text.len());
            if let Err(e) = completer.reply(&text) {
                tracing::warn!("echo reply failed: {e}");
            }
        })
        .one_way(NOTIFY, |text: String, completer| {
            if let Err(e) = completer.binding().send_event(ON_NOTIFY, &text) {
                tracing::warn!("notify event failed: {e}");
            }
        })
        .one_way(SHUTDOWN, move |(): (), completer| {
            completer.binding().close(Status::OK);
            shutdown.notify_one();
        })
}
