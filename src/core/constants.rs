//! Protocol constants and connection defaults.

use std::time::Duration;

// =============================================================================
// ENDPOINT
// =============================================================================

/// Default port for CoAP over DTLS.
pub const DEFAULT_SECURE_PORT: u16 = 5684;

// =============================================================================
// RESPONSE CODE CLASSES (RFC 7252 section 12.1)
// =============================================================================

/// Success class (2.xx).
pub const CLASS_SUCCESS: u8 = 2;

/// Client error class (4.xx).
pub const CLASS_CLIENT_ERROR: u8 = 4;

/// Server error class (5.xx).
pub const CLASS_SERVER_ERROR: u8 = 5;

// =============================================================================
// TIMING
// =============================================================================

/// Delay between connect attempts while retrying.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound for a single handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for a single request/response exchange.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for cancelling a subscription or closing the channel.
pub const GRACE_TIMEOUT: Duration = Duration::from_secs(2);
