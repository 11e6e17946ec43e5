//! Error and unbind-reason types for wirebind operations.

use std::fmt;

use wirebind_proto::{CodecError, Status};

/// Alias for `Result<T, wirebind::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a binding was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Reason {
    /// Local code asked for the binding to stop.
    Unbind,
    /// Local server code closed the channel with an epitaph.
    Close,
    /// The peer closed its endpoint, possibly after sending an epitaph.
    PeerClosed,
    /// The dispatcher stopped servicing the binding.
    DispatcherError,
    /// Reading from or writing to the transport failed.
    TransportError,
    /// An outgoing message could not be encoded.
    EncodeError,
    /// An incoming message could not be decoded.
    DecodeError,
    /// The peer sent something the protocol does not allow: an unknown
    /// ordinal, an unknown transaction ID or a malformed header.
    UnexpectedMessage,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unbind => "user initiated unbind",
            Self::Close => "user initiated close with epitaph",
            Self::PeerClosed => "peer closed",
            Self::DispatcherError => "dispatcher error",
            Self::TransportError => "transport error",
            Self::EncodeError => "encode error",
            Self::DecodeError => "decode error",
            Self::UnexpectedMessage => "unexpected message",
        })
    }
}

/// Reason and status delivered to teardown observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnbindInfo {
    /// Category of the teardown.
    reason: Reason,
    /// Status that accompanied it.
    status: Status,
}

impl UnbindInfo {
    /// Teardown requested by local code.
    pub const fn unbind() -> Self {
        Self::new(Reason::Unbind, Status::OK)
    }

    /// Teardown after sending an epitaph with `epitaph`.
    pub const fn close(epitaph: Status) -> Self {
        Self::new(Reason::Close, epitaph)
    }

    /// Teardown because the peer went away; `status` is the epitaph if one
    /// was received, [`Status::PEER_CLOSED`] otherwise.
    pub const fn peer_closed(status: Status) -> Self {
        Self::new(Reason::PeerClosed, status)
    }

    /// Teardown because the dispatcher abandoned the binding.
    pub const fn dispatcher_error(status: Status) -> Self {
        Self::new(Reason::DispatcherError, status)
    }

    /// Teardown because of a transport read or write failure.
    pub const fn transport_error(status: Status) -> Self {
        Self::new(Reason::TransportError, status)
    }

    /// Teardown because an outgoing message failed to encode.
    pub const fn encode_error(status: Status) -> Self {
        Self::new(Reason::EncodeError, status)
    }

    /// Teardown because an incoming message failed to decode.
    pub const fn decode_error(status: Status) -> Self {
        Self::new(Reason::DecodeError, status)
    }

    /// Teardown because of a protocol violation by the peer.
    pub const fn unexpected_message(status: Status) -> Self {
        Self::new(Reason::UnexpectedMessage, status)
    }

    /// Pairs an arbitrary reason with a status.
    pub const fn new(reason: Reason, status: Status) -> Self {
        Self { reason, status }
    }

    /// The teardown category.
    pub const fn reason(&self) -> Reason {
        self.reason
    }

    /// The accompanying status.
    pub const fn status(&self) -> Status {
        self.status
    }

    /// `true` if local code initiated the teardown.
    pub const fn is_user_initiated(&self) -> bool {
        matches!(self.reason, Reason::Unbind | Reason::Close)
    }

    /// `true` if the teardown was caused by the peer breaking the protocol,
    /// as opposed to a plain channel failure.
    pub const fn is_protocol_error(&self) -> bool {
        matches!(
            self.reason,
            Reason::UnexpectedMessage | Reason::DecodeError
        )
    }

    /// Human-readable description, e.g.
    /// `endpoint was unbound due to peer closed, status: PEER_CLOSED (-24)`.
    pub fn format_description(&self) -> String {
        format!(
            "endpoint was unbound due to {}, status: {}",
            self.reason, self.status
        )
    }
}

impl fmt::Display for UnbindInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format_description())
    }
}

/// Errors returned by binding operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The outgoing message could not be encoded. The binding is unaffected.
    #[error("encode error: {0}")]
    Encode(CodecError),

    /// A reply or event could not be decoded.
    #[error("decode error: {0}")]
    Decode(CodecError),

    /// Writing to the transport failed; the binding is being torn down.
    #[error("transport error: {0}")]
    Transport(Status),

    /// The binding was torn down before the operation could complete.
    #[error("canceled: {0}")]
    Canceled(UnbindInfo),

    /// The binding was torn down because the peer violated the protocol,
    /// e.g. by replying to an unknown transaction.
    #[error("protocol error: {0}")]
    Protocol(UnbindInfo),

    /// The peer does not know the flexible method that was called. The
    /// binding is unaffected.
    #[error("unknown method")]
    UnknownMethod,
}

impl Error {
    /// `true` for cancellation-class errors.
    pub const fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled(_))
    }

    /// The status most closely describing this error.
    pub const fn status(&self) -> Status {
        match self {
            Self::Encode(_) | Self::Decode(_) => Status::INVALID_ARGS,
            Self::Transport(status) => *status,
            Self::Canceled(_) => Status::CANCELED,
            Self::Protocol(info) => info.status(),
            Self::UnknownMethod => Status::NOT_SUPPORTED,
        }
    }

    /// The teardown that caused this error, if any.
    pub const fn unbind_info(&self) -> Option<UnbindInfo> {
        match self {
            Self::Canceled(info) | Self::Protocol(info) => Some(*info),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_names_reason_and_status() {
        assert_eq!(
            UnbindInfo::peer_closed(Status::PEER_CLOSED).format_description(),
            "endpoint was unbound due to peer closed, status: PEER_CLOSED (-24)"
        );
        assert_eq!(
            UnbindInfo::unexpected_message(Status::NOT_FOUND).to_string(),
            "endpoint was unbound due to unexpected message, status: NOT_FOUND (-25)"
        );
    }

    #[test]
    fn protocol_errors_are_told_apart_from_channel_failures() {
        assert!(UnbindInfo::unexpected_message(Status::NOT_FOUND).is_protocol_error());
        assert!(UnbindInfo::decode_error(Status::INVALID_ARGS).is_protocol_error());
        assert!(!UnbindInfo::peer_closed(Status::PEER_CLOSED).is_protocol_error());
        assert!(!UnbindInfo::transport_error(Status::IO).is_protocol_error());
        assert!(UnbindInfo::close(Status::OK).is_user_initiated());
    }

    #[test]
    fn canceled_errors_report_canceled_status() {
        let err = Error::Canceled(UnbindInfo::unbind());
        assert!(err.is_canceled());
        assert_eq!(err.status(), Status::CANCELED);
        assert_eq!(err.unbind_info(), Some(UnbindInfo::unbind()));
        assert!(!Error::Transport(Status::IO).is_canceled());
    }

    #[test]
    fn protocol_and_unknown_method_errors_keep_their_status() {
        let info = UnbindInfo::unexpected_message(Status::NOT_FOUND);
        let err = Error::Protocol(info);
        assert!(!err.is_canceled());
        assert_eq!(err.status(), Status::NOT_FOUND);
        assert_eq!(err.unbind_info(), Some(info));

        assert_eq!(Error::UnknownMethod.status(), Status::NOT_SUPPORTED);
        assert_eq!(Error::UnknownMethod.unbind_info(), None);
    }
}
