//! Typed method routing for server bindings.

use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use wirebind_proto::Status;

use crate::completer::Completer;
use crate::error::UnbindInfo;
use crate::server::{Dispatch, DispatchOutcome, UnknownMethod};
use crate::transport::IncomingMessage;

/// Type-erased method handler.
type Handler =
    Box<dyn Fn(IncomingMessage, &mut Completer<'_>) -> Result<(), UnbindInfo> + Send + Sync>;

/// Whether a method expects a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    /// Requires a non-zero transaction ID.
    TwoWay,
    /// Requires transaction ID 0.
    OneWay,
    /// Accepts either.
    Raw,
}

/// A registered method.
struct Route {
    /// Expected call kind.
    kind: Kind,
    /// Decodes and handles the call.
    handler: Handler,
}

/// A [`Dispatch`] implementation built from per-ordinal handlers.
///
/// ```
/// use wirebind::Router;
///
/// let router = Router::new()
///     .two_way(1, |text: String, completer| {
///         let _ = completer.reply(&text);
///     })
///     .one_way(2, |_: (), completer| {
///         completer.binding().unbind();
///     });
/// assert_eq!(router.len(), 2);
/// ```
#[derive(Default)]
pub struct Router {
    /// Routes by method ordinal.
    routes: HashMap<u64, Route>,
    /// Told about flexible calls no route matched.
    unknown: Option<Box<dyn Fn(UnknownMethod) + Send + Sync>>,
}

impl Router {
    /// An empty router; every ordinal is [`DispatchOutcome::NotFound`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a two-way method. `handler` owes exactly one reply through its
    /// completer.
    ///
    /// # Panics
    ///
    /// Panics if `ordinal` is already routed.
    #[must_use]
    pub fn two_way<Req, F>(self, ordinal: u64, handler: F) -> Self
    where
        Req: DeserializeOwned,
        F: Fn(Req, &mut Completer<'_>) + Send + Sync + 'static,
    {
        self.route(ordinal, Kind::TwoWay, typed(handler))
    }

    /// Adds a one-way method.
    ///
    /// # Panics
    ///
    /// Panics if `ordinal` is already routed.
    #[must_use]
    pub fn one_way<Req, F>(self, ordinal: u64, handler: F) -> Self
    where
        Req: DeserializeOwned,
        F: Fn(Req, &mut Completer<'_>) + Send + Sync + 'static,
    {
        self.route(ordinal, Kind::OneWay, typed(handler))
    }

    /// Adds a method that receives the raw message, e.g. to take its
    /// handles. Returning an error tears the binding down.
    ///
    /// # Panics
    ///
    /// Panics if `ordinal` is already routed.
    #[must_use]
    pub fn raw<F>(self, ordinal: u64, handler: F) -> Self
    where
        F: Fn(IncomingMessage, &mut Completer<'_>) -> Result<(), UnbindInfo>
            + Send
            + Sync
            + 'static,
    {
        self.route(ordinal, Kind::Raw, Box::new(handler))
    }

    /// Observes flexible calls to ordinals that are not routed. The
    /// binding has already answered or dropped them.
    #[must_use]
    pub fn on_unknown_method(
        mut self,
        f: impl Fn(UnknownMethod) + Send + Sync + 'static,
    ) -> Self {
        self.unknown = Some(Box::new(f));
        self
    }

    /// Registers `handler` under `ordinal`.
    fn route(mut self, ordinal: u64, kind: Kind, handler: Handler) -> Self {
        let previous = self.routes.insert(ordinal, Route { kind, handler });
        assert!(previous.is_none(), "ordinal {ordinal} routed twice");
        self
    }

    /// Number of routed ordinals.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// `true` if nothing is routed.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Wraps a typed handler into one that decodes the payload first.
fn typed<Req, F>(handler: F) -> Handler
where
    Req: DeserializeOwned,
    F: Fn(Req, &mut Completer<'_>) + Send + Sync + 'static,
{
    Box::new(move |message, completer| {
        let request = message.decode::<Req>().map_err(|e| {
            tracing::warn!(ordinal = message.ordinal(), "request decode failed: {e}");
            UnbindInfo::decode_error(Status::INVALID_ARGS)
        })?;
        handler(request, completer);
        Ok(())
    })
}

impl Dispatch for Router {
    fn dispatch(
        &self,
        message: IncomingMessage,
        completer: &mut Completer<'_>,
    ) -> DispatchOutcome {
        let Some(route) = self.routes.get(&message.ordinal()) else {
            return DispatchOutcome::NotFound(message);
        };
        let two_way = message.txid() != 0;
        let expected = match route.kind {
            Kind::TwoWay => two_way,
            Kind::OneWay => !two_way,
            Kind::Raw => true,
        };
        if !expected {
            tracing::warn!(
                ordinal = message.ordinal(),
                txid = message.txid(),
                "call kind does not match the method"
            );
            return DispatchOutcome::Failed(UnbindInfo::unexpected_message(Status::INVALID_ARGS));
        }
        match (route.handler)(message, completer) {
            Ok(()) => DispatchOutcome::Handled,
            Err(info) => DispatchOutcome::Failed(info),
        }
    }

    fn on_unknown_method(&self, method: UnknownMethod) {
        if let Some(f) = &self.unknown {
            f(method);
        }
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ordinals: Vec<_> = self.routes.keys().copied().collect();
        ordinals.sort_unstable();
        f.debug_struct("Router")
            .field("ordinals", &ordinals)
            .field("on_unknown_method", &self.unknown.is_some())
            .finish()
    }
}
