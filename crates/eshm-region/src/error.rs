use std::time::Duration;

/// Errors that can occur while managing a shared region or its lock.
#[derive(Debug, thiserror::Error)]
pub enum RegionError {
    /// Failed to create the named region.
    #[error("failed to create region {name}: {source}")]
    Create {
        name: String,
        source: std::io::Error,
    },

    /// Failed to attach to (open and map) an existing region.
    #[error("failed to attach region {name}: {source}")]
    Attach {
        name: String,
        source: std::io::Error,
    },

    /// Failed to unmap the region.
    #[error("failed to detach region {name}: {source}")]
    Detach {
        name: String,
        source: std::io::Error,
    },

    /// Failed to unlink the named region.
    #[error("failed to destroy region {name}: {source}")]
    Destroy {
        name: String,
        source: std::io::Error,
    },

    /// The region name does not fit the platform limit.
    #[error("region name too long ({len} bytes, max {max}): {name}")]
    NameTooLong { name: String, len: usize, max: usize },

    /// The region name is empty or contains a NUL byte.
    #[error("invalid region name: {0:?}")]
    InvalidName(String),

    /// The existing region is smaller than the layout requires.
    #[error("region {name} too small ({size} bytes, need {required})")]
    TooSmall {
        name: String,
        size: usize,
        required: usize,
    },

    /// The lock could not be initialized.
    #[error("lock init failed: {0}")]
    MutexInit(String),

    /// The lock could not be acquired before the deadline.
    #[error("lock acquisition timed out after {timeout:?} (held by pid {owner})")]
    MutexLock { timeout: Duration, owner: u32 },

    /// The lock was released by a process that does not hold it.
    #[error("lock release by pid {caller} but held by pid {owner}")]
    MutexUnlock { owner: u32, caller: u32 },

    /// Shared regions are not available on this platform.
    #[error("shared memory regions are not supported on this platform")]
    Unsupported,
}

impl RegionError {
    /// Whether a create failed because the name is already taken.
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            RegionError::Create { source, .. }
                if source.kind() == std::io::ErrorKind::AlreadyExists
        )
    }

    /// Whether an attach failed because no region exists under the name.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RegionError::Attach { source, .. }
                if source.kind() == std::io::ErrorKind::NotFound
        )
    }
}

pub type Result<T> = std::result::Result<T, RegionError>;
