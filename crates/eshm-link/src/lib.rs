//! Master/slave messaging over a shared-memory region.
//!
//! This is the "just works" layer. Open an [`Endpoint`] by name, and it
//! resolves its role, claims its side of the region, heartbeats, watches the
//! peer's heartbeat, and reconnects when the peer restarts. Each direction
//! is a single-slot mailbox: a write replaces whatever the reader has not yet
//! consumed, and writers never wait for readers.

pub mod channel;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod layout;
pub mod liveness;
pub mod stats;

pub use channel::{Channel, POLL_INTERVAL};
pub use config::{DisconnectBehavior, EndpointConfig, Role};
pub use endpoint::{Endpoint, DEFAULT_READ_TIMEOUT};
pub use error::{EshmError, Result};
pub use layout::{RegionLayout, LAYOUT_VERSION, MAGIC, SLOT_CAPACITY};
pub use liveness::{LinkState, LivenessEvent, LivenessMonitor, ReconnectFailure, ReconnectPolicy};
pub use stats::{inspect, ChannelStats, RegionStats, RoleStats};
