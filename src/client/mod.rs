//! gatelink client.
//!
//! [`Connection`] is the entry point: build one with [`ConnectionBuilder`],
//! then issue requests and observations in any state.

mod config;
mod connection;
mod observe;
mod queue;

pub use config::*;
pub use connection::{Connection, ConnectionStatus};
pub use observe::{NotificationHandler, SubscriptionState};
pub use queue::{PostAction, QueuedRequest, RequestQueue, ResponseHandler};
