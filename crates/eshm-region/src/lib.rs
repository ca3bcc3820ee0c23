//! Named shared-memory regions and a crash-recoverable cross-process lock.
//!
//! This is the lowest layer of eshm. It knows how to create, attach,
//! detach and destroy a named block of memory visible to two processes,
//! and how to guard that block with a lock that survives its holder dying
//! mid-critical-section. It knows nothing about what lives in the block.

pub mod error;
pub mod lock;
pub mod shm;

pub use error::{RegionError, Result};
pub use lock::{current_pid, process_alive, LockGuard, RobustLock};
pub use shm::{os_name, RegionIdentity, SharedRegion, MAX_NAME_LEN};
