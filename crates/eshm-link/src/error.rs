use std::time::Duration;

use crate::config::Role;

/// Errors that can occur in endpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum EshmError {
    /// A configuration parameter is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Region or lock failure.
    #[error("region error: {0}")]
    Region(#[from] eshm_region::RegionError),

    /// Item encode/decode failure.
    #[error("codec error: {0}")]
    Codec(#[from] eshm_codec::CodecError),

    /// OS-level failure outside the region (e.g. spawning the worker).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Nothing new is pending (non-blocking read).
    #[error("no data available")]
    NoData,

    /// A blocking read saw nothing new before the deadline.
    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    /// The peer's heartbeat stopped and the endpoint fails fast.
    #[error("{peer} is stale")]
    PeerStale { peer: Role },

    /// Reconnection exhausted its bound. Terminal for this endpoint.
    #[error("reconnection gave up after {attempts} attempts ({elapsed:?})")]
    ReconnectFailed { attempts: u32, elapsed: Duration },

    /// The payload does not fit the channel slot.
    #[error("payload of {size} bytes exceeds channel capacity {capacity}")]
    BufferFull { size: usize, capacity: usize },

    /// The caller's buffer cannot hold the pending payload.
    #[error("buffer too small: payload is {needed} bytes, buffer holds {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// The endpoint was closed.
    #[error("endpoint not initialized")]
    NotInitialized,

    /// The requested role cannot be taken on this region.
    #[error("cannot attach as {requested}: {reason}")]
    RoleMismatch { requested: Role, reason: String },

    /// The region exists but was laid out by something else.
    #[error("incompatible region (magic 0x{magic:08x}, version {version})")]
    IncompatibleRegion { magic: u32, version: u32 },
}

pub type Result<T> = std::result::Result<T, EshmError>;
