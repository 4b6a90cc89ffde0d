//! # gatelink
//!
//! Resilient client for CoAP gateways secured with DTLS pre-shared keys.
//!
//! Constrained gateways drop idle sessions, reboot, and lose datagrams.
//! gatelink keeps one logical connection alive across all of that:
//!
//! - **Reconnect**: a single connect loop with fixed-interval retry and
//!   cancellation
//! - **Offline queue**: GET/PUT/POST issued while the link is down are
//!   replayed in order once it is back
//! - **Observations**: one subscription task per resource, re-established on
//!   every new link, with an optional resubscribe keepalive
//! - **Typed errors**: every failure is a [`CoapError`]
//!
//! The record layer and the message codec are not part of this crate. A
//! transport plugs in through [`transport::Dialer`] and
//! [`transport::SecureChannel`].
//!
//! ## Feature Flags
//!
//! - `memory` (default): [`transport::MemoryGateway`], an in-process gateway
//!   with fault injection
//!
//! ## Modules
//!
//! - [`core`]: Error taxonomy, response codes, resource paths, defaults
//! - [`transport`]: Secure channel boundary
//! - [`client`]: Connection, request queue, observations
//!
//! ## Example Usage
//!
//! ```rust
//! use gatelink::prelude::*;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let gateway = MemoryGateway::new();
//! gateway.set_resource("/15001/65537".parse()?, "on");
//!
//! let conn = ConnectionBuilder::new()
//!     .host("192.168.1.15")
//!     .identity("gatelink")
//!     .key("eQrKSrpoWgdOPIbw")
//!     .build(gateway)?;
//!
//! // queued until the link is up
//! let value = conn.get("/15001/65537").await?;
//! assert_eq!(value, b"on");
//!
//! conn.observe("/15001/65537", |notification| {
//!     if let Ok(payload) = notification {
//!         println!("bulb is {}", String::from_utf8_lossy(&payload));
//!     }
//! })?;
//!
//! conn.disconnect().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod client;
pub mod core;
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::client::*;
    pub use crate::core::*;

    #[cfg(feature = "memory")]
    pub use crate::transport::MemoryGateway;
    pub use crate::transport::{
        Dialer, Endpoint, Method, NotificationSink, PskCredentials, Response, SecureChannel,
        Subscription,
    };
}

// Re-export commonly used items at crate root
pub use crate::client::{Connection, ConnectionBuilder, ConnectionConfig, ConnectionStatus};
pub use crate::core::{ChannelError, CoapError, ConfigError, ResourcePath, ResponseCode};
