//! Client side of the invocation bridge: request building from a manifest,
//! the persistent WebSocket transport with correlation and reconnect, the
//! subscription relay, and the high-level call API.

pub mod api;
pub mod builder;
pub mod subscriptions;
pub mod transport;

pub use api::{Bridge, CallOptions, CallRequest};
pub use builder::{build_argument_list, resolve_entries, select_overload, CallArgs};
pub use subscriptions::{EventSelector, SubscriptionRecord, SubscriptionRelay};
pub use transport::{Transport, TransportConfig};
