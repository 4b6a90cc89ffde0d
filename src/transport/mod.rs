//! Secure channel boundary.
//!
//! gatelink does not implement the record layer or the message codec. It
//! drives any transport that implements [`Dialer`] and [`SecureChannel`]:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   Connection / queue / observations     │
//! ├─────────────────────────────────────────┤
//! │   Dialer + SecureChannel  (this module) │
//! ├─────────────────────────────────────────┤
//! │   DTLS-PSK record layer + CoAP codec    │
//! ├─────────────────────────────────────────┤
//! │              UDP                        │
//! └─────────────────────────────────────────┘
//! ```
//!
//! With the `memory` feature, [`MemoryGateway`] provides an in-process
//! implementation with fault injection.

mod channel;
#[cfg(any(test, feature = "memory"))]
mod memory;

pub use channel::*;
#[cfg(any(test, feature = "memory"))]
pub use memory::{Exchange, GatewayStats, MemoryGateway};
