//! The secure channel boundary.
//!
//! The record layer, the PSK handshake and the message codec live behind
//! these traits. A [`Dialer`] opens a [`SecureChannel`] to an [`Endpoint`];
//! the channel carries GET/PUT/POST exchanges and OBSERVE subscriptions.
//! Implementations do not need to apply timeouts: the connection bounds
//! every call itself.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::core::{ChannelError, ResourcePath, ResponseCode};

/// Request methods carried by the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Read a resource.
    Get,
    /// Replace a resource.
    Put,
    /// Create or trigger a resource.
    Post,
    /// Subscribe to a resource.
    Observe,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Put => "PUT",
            Self::Post => "POST",
            Self::Observe => "OBSERVE",
        })
    }
}

/// A response or notification from the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Response code.
    pub code: ResponseCode,
    /// Response body.
    pub payload: Vec<u8>,
}

impl Response {
    /// Create a response.
    pub fn new(code: ResponseCode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            code,
            payload: payload.into(),
        }
    }
}

/// Gateway address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Host name or IP address.
    pub host: String,
    /// UDP port.
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// PSK identity and key.
///
/// The key is zeroized on drop and never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PskCredentials {
    identity: String,
    key: Vec<u8>,
}

impl PskCredentials {
    /// Create credentials from an identity and a key.
    pub fn new(identity: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            identity: identity.into(),
            key: key.into(),
        }
    }

    /// The PSK identity (sent as the identity hint).
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// The pre-shared key.
    ///
    /// Handle with care - this exposes the secret.
    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

impl fmt::Debug for PskCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PskCredentials")
            .field("identity", &self.identity)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Receives every notification of one subscription.
///
/// Called from the channel's read path; implementations must not block.
pub type NotificationSink = Box<dyn Fn(Response) + Send + Sync>;

/// Opens secure channels.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Perform the handshake and return an established channel.
    async fn dial(
        &self,
        endpoint: &Endpoint,
        credentials: &PskCredentials,
    ) -> Result<Arc<dyn SecureChannel>, ChannelError>;
}

/// An established encrypted session.
#[async_trait]
pub trait SecureChannel: Send + Sync + 'static {
    /// GET a resource.
    async fn get(&self, path: &ResourcePath) -> Result<Response, ChannelError>;

    /// PUT a payload to a resource.
    async fn put(&self, path: &ResourcePath, payload: &[u8]) -> Result<Response, ChannelError>;

    /// POST a payload to a resource.
    async fn post(&self, path: &ResourcePath, payload: &[u8]) -> Result<Response, ChannelError>;

    /// Start observing a resource. Notifications go to `sink` until the
    /// returned subscription is cancelled.
    async fn observe(
        &self,
        path: &ResourcePath,
        sink: NotificationSink,
    ) -> Result<Box<dyn Subscription>, ChannelError>;

    /// Close the session.
    async fn close(&self) -> Result<(), ChannelError>;
}

/// A live observation on a [`SecureChannel`].
#[async_trait]
pub trait Subscription: Send + 'static {
    /// Deregister the observation on the gateway.
    async fn cancel(self: Box<Self>) -> Result<(), ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_redacts_key() {
        let creds = PskCredentials::new("gatelink-client", "eQrKSrpoWgdOPIbw");
        let debug = format!("{creds:?}");
        assert!(debug.contains("gatelink-client"));
        assert!(!debug.contains("eQrKSrpoWgdOPIbw"));
        assert_eq!(creds.key(), b"eQrKSrpoWgdOPIbw");
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::new("192.168.1.15", 5684).to_string(), "192.168.1.15:5684");
        assert_eq!(Endpoint::new("fe80::1", 5684).to_string(), "[fe80::1]:5684");
    }
}
