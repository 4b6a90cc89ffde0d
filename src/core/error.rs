//! Error types for gatelink.
//!
//! [`CoapError`] is the taxonomy every caller sees: transport failures,
//! gateway rejections and synchronous configuration errors all resolve to one
//! of its variants. [`ChannelError`] is what a secure channel implementation
//! reports, and [`ConfigError`] covers invalid builder input.

use std::io;

use thiserror::Error;

/// The fixed set of failure kinds reported to callers.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoapError {
    /// The encrypted session could not be established.
    #[error("handshake failed")]
    HandshakeFailed,

    /// Sending a request timed out.
    #[error("write timeout")]
    WriteTimeout,

    /// Waiting for a response timed out.
    #[error("read timeout")]
    ReadTimeout,

    /// The response body could not be read.
    #[error("bad response data")]
    BadResponseData,

    /// The gateway answered with a code outside the known set.
    #[error("unknown status")]
    UnknownStatus,

    /// The gateway rejected the method for this resource.
    #[error("method not allowed")]
    MethodNotAllowed,

    /// The resource does not exist on the gateway.
    #[error("uri not found")]
    UriNotFound,

    /// The identity is not authorized for this resource.
    #[error("unauthorized")]
    Unauthorized,

    /// The gateway could not parse the request.
    #[error("bad request")]
    BadRequest,

    /// PUT or POST was called with an empty payload.
    #[error("no payload for request")]
    NoPayload,

    /// The connect loop was cancelled while retrying, or the connection was
    /// closed with the request still queued.
    #[error("connection cancelled")]
    ConnectionCancelled,

    /// The resource path is malformed.
    #[error("invalid resource path")]
    InvalidPath,

    /// The link is down and the offline queue is disabled.
    #[error("not connected")]
    NotConnected,

    /// `stop_observing` was called for a path that is not observed.
    #[error("path is not observed")]
    NotObserving,
}

impl CoapError {
    /// Failure of the link itself rather than of the request.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::HandshakeFailed | Self::WriteTimeout | Self::ReadTimeout | Self::BadResponseData
        )
    }

    /// Rejection by the gateway. These are final and never retried.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::UnknownStatus
                | Self::MethodNotAllowed
                | Self::UriNotFound
                | Self::Unauthorized
                | Self::BadRequest
        )
    }
}

/// Errors reported by a [`SecureChannel`](crate::transport::SecureChannel)
/// implementation.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Handshake with the gateway failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Write did not complete in time.
    #[error("write timeout")]
    WriteTimeout,

    /// No response arrived in time.
    #[error("read timeout")]
    ReadTimeout,

    /// A response arrived but its body was unreadable.
    #[error("bad response data: {0}")]
    BadResponseData(String),

    /// The channel has been closed.
    #[error("channel closed")]
    Closed,

    /// I/O error on the underlying socket.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl ChannelError {
    /// Whether the link should be considered dead after this error.
    ///
    /// A malformed response body is a property of the response, not of the
    /// link, so it is reported to the caller instead of triggering recovery.
    pub fn is_link_failure(&self) -> bool {
        !matches!(self, Self::BadResponseData(_))
    }
}

impl From<ChannelError> for CoapError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Handshake(_) => CoapError::HandshakeFailed,
            ChannelError::WriteTimeout => CoapError::WriteTimeout,
            ChannelError::ReadTimeout => CoapError::ReadTimeout,
            ChannelError::BadResponseData(_) => CoapError::BadResponseData,
            ChannelError::Closed => CoapError::WriteTimeout,
            ChannelError::Io(ref e) if e.kind() == io::ErrorKind::TimedOut => {
                CoapError::ReadTimeout
            }
            ChannelError::Io(_) => CoapError::WriteTimeout,
        }
    }
}

/// Invalid connection configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Gateway host is empty.
    #[error("gateway host is empty")]
    EmptyHost,

    /// Gateway port is zero.
    #[error("gateway port must be non-zero")]
    ZeroPort,

    /// PSK identity is empty.
    #[error("psk identity is empty")]
    EmptyIdentity,

    /// Pre-shared key is empty.
    #[error("pre-shared key is empty")]
    EmptyKey,

    /// A duration that must be positive is zero.
    #[error("{0} must be non-zero")]
    ZeroDuration(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_and_protocol_are_disjoint() {
        let all = [
            CoapError::HandshakeFailed,
            CoapError::WriteTimeout,
            CoapError::ReadTimeout,
            CoapError::BadResponseData,
            CoapError::UnknownStatus,
            CoapError::MethodNotAllowed,
            CoapError::UriNotFound,
            CoapError::Unauthorized,
            CoapError::BadRequest,
            CoapError::NoPayload,
            CoapError::ConnectionCancelled,
            CoapError::InvalidPath,
            CoapError::NotConnected,
            CoapError::NotObserving,
        ];
        for err in all {
            assert!(!(err.is_transport() && err.is_protocol()), "{err:?}");
        }
        assert!(CoapError::ReadTimeout.is_transport());
        assert!(CoapError::UriNotFound.is_protocol());
        assert!(!CoapError::NoPayload.is_transport());
        assert!(!CoapError::NoPayload.is_protocol());
    }

    #[test]
    fn test_channel_error_mapping() {
        assert_eq!(
            CoapError::from(ChannelError::Handshake("psk mismatch".into())),
            CoapError::HandshakeFailed
        );
        assert_eq!(CoapError::from(ChannelError::ReadTimeout), CoapError::ReadTimeout);
        assert_eq!(
            CoapError::from(ChannelError::Io(io::Error::from(io::ErrorKind::TimedOut))),
            CoapError::ReadTimeout
        );
        assert_eq!(
            CoapError::from(ChannelError::BadResponseData("truncated".into())),
            CoapError::BadResponseData
        );
    }

    #[test]
    fn test_bad_response_is_not_a_link_failure() {
        assert!(!ChannelError::BadResponseData("x".into()).is_link_failure());
        assert!(ChannelError::Closed.is_link_failure());
        assert!(ChannelError::ReadTimeout.is_link_failure());
    }
}
