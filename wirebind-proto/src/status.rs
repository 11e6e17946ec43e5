//! Transport and epitaph status codes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A signed status code, zero for success and negative for errors.
///
/// Carried by transport failures, unbind notifications and epitaphs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Status(i32);

impl Status {
    /// Success.
    pub const OK: Self = Self(0);
    /// Internal error.
    pub const INTERNAL: Self = Self(-1);
    /// Operation not supported by this endpoint.
    pub const NOT_SUPPORTED: Self = Self(-2);
    /// Invalid argument.
    pub const INVALID_ARGS: Self = Self(-10);
    /// Value outside the allowed range.
    pub const OUT_OF_RANGE: Self = Self(-14);
    /// Buffer too small.
    pub const BUFFER_TOO_SMALL: Self = Self(-15);
    /// Object in the wrong state for the operation.
    pub const BAD_STATE: Self = Self(-20);
    /// Deadline expired.
    pub const TIMED_OUT: Self = Self(-21);
    /// Nothing to read yet; wait and retry.
    pub const SHOULD_WAIT: Self = Self(-22);
    /// Operation canceled.
    pub const CANCELED: Self = Self(-23);
    /// The other end of the transport is gone.
    pub const PEER_CLOSED: Self = Self(-24);
    /// Lookup failed.
    pub const NOT_FOUND: Self = Self(-25);
    /// Permission denied.
    pub const ACCESS_DENIED: Self = Self(-30);
    /// Generic I/O failure.
    pub const IO: Self = Self(-40);

    /// Wraps a raw status code.
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// Returns the raw status code.
    pub const fn into_raw(self) -> i32 {
        self.0
    }

    /// Returns `true` for [`Status::OK`].
    pub const fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// Symbolic name of the code, or `None` if it is not a known code.
    pub const fn name(self) -> Option<&'static str> {
        Some(match self.0 {
            0 => "OK",
            -1 => "INTERNAL",
            -2 => "NOT_SUPPORTED",
            -10 => "INVALID_ARGS",
            -14 => "OUT_OF_RANGE",
            -15 => "BUFFER_TOO_SMALL",
            -20 => "BAD_STATE",
            -21 => "TIMED_OUT",
            -22 => "SHOULD_WAIT",
            -23 => "CANCELED",
            -24 => "PEER_CLOSED",
            -25 => "NOT_FOUND",
            -30 => "ACCESS_DENIED",
            -40 => "IO",
            _ => return None,
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name().unwrap_or("UNKNOWN"), self.0)
    }
}

impl From<std::io::Error> for Status {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::UnexpectedEof => Self::PEER_CLOSED,
            ErrorKind::WouldBlock => Self::SHOULD_WAIT,
            ErrorKind::TimedOut => Self::TIMED_OUT,
            ErrorKind::PermissionDenied => Self::ACCESS_DENIED,
            ErrorKind::InvalidData | ErrorKind::InvalidInput => Self::INVALID_ARGS,
            _ => Self::IO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_known_codes() {
        assert_eq!(Status::PEER_CLOSED.to_string(), "PEER_CLOSED (-24)");
        assert_eq!(Status::OK.to_string(), "OK (0)");
        assert_eq!(Status::from_raw(-999).to_string(), "UNKNOWN (-999)");
    }

    #[test]
    fn io_errors_map_to_transport_codes() {
        let closed = std::io::Error::from(std::io::ErrorKind::BrokenPipe);
        assert_eq!(Status::from(closed), Status::PEER_CLOSED);
        let other = std::io::Error::other("boom");
        assert_eq!(Status::from(other), Status::IO);
    }
}
