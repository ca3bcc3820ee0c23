//! Master/slave messaging over named shared memory.
//!
//! Two processes open the same region by name; one holds the master side and
//! the other the slave side. Each direction is a single-slot mailbox, each
//! side heartbeats, and a side whose peer goes quiet reconnects according to
//! its configured disconnect behavior. Messages are raw bytes or lists of
//! typed items carried in a DER-style three-sequence layout.
//!
//! # Crate Structure
//!
//! - [`region`]: named POSIX shared-memory regions and the crash-recoverable lock
//! - [`codec`]: tag/length/value codec and the three-sequence item message
//! - [`link`]: shared layout, mailboxes, liveness, and the [`Endpoint`] facade
//!
//! ```no_run
//! use eshm::{DataItem, Endpoint, EndpointConfig, Role};
//!
//! let master = Endpoint::open(EndpointConfig::new("telemetry").with_role(Role::Master))?;
//! master.write_items(&[DataItem::integer("counter", 42)])?;
//! # Ok::<(), eshm::EshmError>(())
//! ```

/// Re-export region types.
pub mod region {
    pub use eshm_region::*;
}

/// Re-export codec types.
pub mod codec {
    pub use eshm_codec::*;
}

/// Re-export link types.
pub mod link {
    pub use eshm_link::*;
}

pub use eshm_codec::{DataItem, DataType, DataValue};
pub use eshm_link::{DisconnectBehavior, Endpoint, EndpointConfig, EshmError, Role};
