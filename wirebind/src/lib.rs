//! Binding runtime for message-based IPC.
//!
//! `wirebind` binds one end of a duplex message transport to a typed client
//! or server. A single transport carries many concurrent two-way calls,
//! correlated by transaction ID, plus one-way messages and events. Teardown
//! is safe against concurrent dispatch: it may be requested from any thread
//! at any time, and the unbind observer fires exactly once on the
//! dispatcher.
//!
//! # Quick start
//!
//! ```
//! use wirebind::{Channel, Client, Dispatcher, Router, bind_server};
//!
//! # #[tokio::main(flavor = "multi_thread", worker_threads = 2)]
//! # async fn main() -> wirebind::Result<()> {
//! let dispatcher = Dispatcher::current();
//! let (client_end, server_end) = Channel::create();
//!
//! let echo = Router::new().two_way(1, |text: String, completer| {
//!     let _ = completer.reply(&text);
//! });
//! bind_server(&dispatcher, server_end, echo, |_| {});
//!
//! let client = Client::bind(&dispatcher, client_end);
//! let reply: String = client.call(1, "hi").await?;
//! assert_eq!(reply, "hi");
//! # Ok(())
//! # }
//! ```

mod binding;
mod channel;
mod channel_ref;
mod client;
mod completer;
mod dispatcher;
mod error;
mod registry;
mod router;
mod server;
pub mod stream;
mod transport;

pub use channel::Channel;
pub use channel_ref::{ChannelRef, ChannelRefTracker};
pub use client::{Client, ClientBuilder, EventHandler, ResponseFuture};
pub use completer::{Completer, OwnedCompleter};
pub use dispatcher::{Dispatcher, Wait};
pub use error::{Error, Reason, Result, UnbindInfo};
pub use registry::{Registration, ResponseContext, ResponseRegistry, TXID_MASK};
pub use router::Router;
pub use server::{
    Chain, Dispatch, DispatchOutcome, ServerBindingRef, ServerBuilder, UnknownMethod, bind_server,
};
pub use transport::{Handle, IncomingMessage, Message, Readable, Transport};
pub use wirebind_proto as proto;
pub use wirebind_proto::{CodecError, MessageHeader, Status};
