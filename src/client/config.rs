//! Connection configuration.
//!
//! [`ConnectionConfig`] holds everything a connection needs to reach and
//! talk to its gateway. [`ConnectionBuilder`] assembles one, validates it and
//! attaches lifecycle callbacks.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::core::{
    ConfigError, DEFAULT_SECURE_PORT, GRACE_TIMEOUT, HANDSHAKE_TIMEOUT, REQUEST_TIMEOUT,
    RETRY_INTERVAL,
};
use crate::transport::{Dialer, Endpoint, PskCredentials};

use super::connection::Connection;

/// How a connection detects links that died without telling anyone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeepaliveStrategy {
    /// Rely on request failures only.
    #[default]
    Disabled,
    /// Every observation cancels and re-registers itself at this interval.
    /// A failed re-registration tears the link down and rebuilds it.
    Resubscribe {
        /// Time between keepalive rounds.
        interval: Duration,
    },
    /// Tear the whole link down and reconnect at this interval.
    /// Observations are carried over to the new link.
    Reconnect {
        /// Time between reconnects.
        interval: Duration,
    },
}

impl KeepaliveStrategy {
    fn interval(&self) -> Option<Duration> {
        match self {
            Self::Disabled => None,
            Self::Resubscribe { interval } | Self::Reconnect { interval } => Some(*interval),
        }
    }
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Gateway address.
    pub endpoint: Endpoint,

    /// PSK identity and key.
    pub credentials: PskCredentials,

    /// Buffer requests issued while the link is down.
    pub use_queue: bool,

    /// Keep retrying the handshake until it succeeds or is cancelled.
    pub retry_on_failure: bool,

    /// Delay between handshake attempts.
    pub retry_interval: Duration,

    /// Liveness probing.
    pub keepalive: KeepaliveStrategy,

    /// Disconnect after this long without requests or observations.
    pub idle_timeout: Option<Duration>,

    /// Upper bound for one handshake.
    pub handshake_timeout: Duration,

    /// Upper bound for one request/response exchange or observe registration.
    pub request_timeout: Duration,

    /// Upper bound for cancelling a subscription or closing the channel.
    pub grace_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::new("127.0.0.1", DEFAULT_SECURE_PORT),
            credentials: PskCredentials::new(String::new(), Vec::new()),
            use_queue: true,
            retry_on_failure: true,
            retry_interval: RETRY_INTERVAL,
            keepalive: KeepaliveStrategy::Disabled,
            idle_timeout: None,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
            grace_timeout: GRACE_TIMEOUT,
        }
    }
}

impl ConnectionConfig {
    /// Check that the configuration can be used to connect.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.endpoint.port == 0 {
            return Err(ConfigError::ZeroPort);
        }
        if self.credentials.identity().is_empty() {
            return Err(ConfigError::EmptyIdentity);
        }
        if self.credentials.key().is_empty() {
            return Err(ConfigError::EmptyKey);
        }

        let durations = [
            ("retry interval", Some(self.retry_interval)),
            ("handshake timeout", Some(self.handshake_timeout)),
            ("request timeout", Some(self.request_timeout)),
            ("grace timeout", Some(self.grace_timeout)),
            ("keepalive interval", self.keepalive.interval()),
            ("idle timeout", self.idle_timeout),
        ];
        for (name, value) in durations {
            if value.is_some_and(|d| d.is_zero()) {
                return Err(ConfigError::ZeroDuration(name));
            }
        }

        Ok(())
    }
}

/// Callback invoked on a lifecycle transition.
pub type LifecycleCallback = Arc<dyn Fn() + Send + Sync>;

/// Callbacks invoked on connection lifecycle transitions.
///
/// They run on the task driving the transition and should return quickly.
#[derive(Clone, Default)]
pub struct LifecycleCallbacks {
    /// A link was established.
    pub on_connect: Option<LifecycleCallback>,
    /// A link was torn down.
    pub on_disconnect: Option<LifecycleCallback>,
    /// A retrying connect loop was cancelled.
    pub on_cancel: Option<LifecycleCallback>,
    /// A handshake attempt failed.
    pub on_connection_failed: Option<LifecycleCallback>,
}

impl LifecycleCallbacks {
    pub(crate) fn connected(&self) {
        if let Some(cb) = &self.on_connect {
            cb();
        }
    }

    pub(crate) fn disconnected(&self) {
        if let Some(cb) = &self.on_disconnect {
            cb();
        }
    }

    pub(crate) fn cancelled(&self) {
        if let Some(cb) = &self.on_cancel {
            cb();
        }
    }

    pub(crate) fn connection_failed(&self) {
        if let Some(cb) = &self.on_connection_failed {
            cb();
        }
    }
}

impl fmt::Debug for LifecycleCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleCallbacks")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_cancel", &self.on_cancel.is_some())
            .field("on_connection_failed", &self.on_connection_failed.is_some())
            .finish()
    }
}

/// Builder for creating a [`Connection`].
///
/// # Example
///
/// ```ignore
/// use gatelink::client::{ConnectionBuilder, KeepaliveStrategy};
///
/// let conn = ConnectionBuilder::new()
///     .host("192.168.1.15")
///     .identity("gatelink-client")
///     .key("eQrKSrpoWgdOPIbw")
///     .keepalive(KeepaliveStrategy::Resubscribe { interval: Duration::from_secs(60) })
///     .on_connect(|| println!("connected"))
///     .build(dialer)?;
/// ```
pub struct ConnectionBuilder {
    config: ConnectionConfig,
    identity: String,
    key: Vec<u8>,
    callbacks: LifecycleCallbacks,
}

impl ConnectionBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self {
            config: ConnectionConfig::default(),
            identity: String::new(),
            key: Vec::new(),
            callbacks: LifecycleCallbacks::default(),
        }
    }

    /// Set the gateway host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.endpoint.host = host.into();
        self
    }

    /// Set the gateway port.
    pub fn port(mut self, port: u16) -> Self {
        self.config.endpoint.port = port;
        self
    }

    /// Set the PSK identity.
    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    /// Set the pre-shared key.
    pub fn key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = key.into();
        self
    }

    /// Buffer requests while the link is down (default: on).
    pub fn use_queue(mut self, enabled: bool) -> Self {
        self.config.use_queue = enabled;
        self
    }

    /// Keep retrying failed handshakes (default: on).
    pub fn retry_on_failure(mut self, enabled: bool) -> Self {
        self.config.retry_on_failure = enabled;
        self
    }

    /// Set the delay between handshake attempts.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.config.retry_interval = interval;
        self
    }

    /// Set the keepalive strategy.
    pub fn keepalive(mut self, keepalive: KeepaliveStrategy) -> Self {
        self.config.keepalive = keepalive;
        self
    }

    /// Disconnect after this long without traffic.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = Some(timeout);
        self
    }

    /// Set the handshake timeout.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set the request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the grace timeout for cancellation and close.
    pub fn grace_timeout(mut self, timeout: Duration) -> Self {
        self.config.grace_timeout = timeout;
        self
    }

    /// Called when a link is established.
    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.on_connect = Some(Arc::new(f));
        self
    }

    /// Called when a link is torn down, and after every `disconnect()`.
    pub fn on_disconnect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.on_disconnect = Some(Arc::new(f));
        self
    }

    /// Called when a retrying connect loop is cancelled.
    pub fn on_cancel(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.on_cancel = Some(Arc::new(f));
        self
    }

    /// Called after every failed handshake attempt.
    pub fn on_connection_failed(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.on_connection_failed = Some(Arc::new(f));
        self
    }

    /// Build and validate the configuration.
    pub fn build_config(self) -> Result<(ConnectionConfig, LifecycleCallbacks), ConfigError> {
        let mut config = self.config;
        config.credentials = PskCredentials::new(self.identity, self.key);
        config.validate()?;
        Ok((config, self.callbacks))
    }

    /// Build the connection. No I/O happens until the first connect.
    pub fn build(self, dialer: impl Dialer) -> Result<Connection, ConfigError> {
        let (config, callbacks) = self.build_config()?;
        Ok(Connection::with_callbacks(config, callbacks, dialer))
    }
}

impl fmt::Debug for ConnectionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionBuilder")
            .field("endpoint", &self.config.endpoint)
            .field("identity", &self.identity)
            .field("key", &"[REDACTED]")
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
