use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EshmError, Result};

/// Which side of the region an endpoint holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Slave,
    /// Resolved once at open: MASTER unless a live master already holds
    /// the region.
    Auto,
}

impl Role {
    /// The opposite side. `Auto` has no peer.
    pub fn peer(self) -> Role {
        match self {
            Role::Master => Role::Slave,
            Role::Slave => Role::Master,
            Role::Auto => Role::Auto,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Master => "master",
            Role::Slave => "slave",
            Role::Auto => "auto",
        })
    }
}

/// What a stale peer means for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectBehavior {
    /// Reads and writes fail with [`EshmError::PeerStale`] while the peer
    /// is stale. No reconnection is attempted.
    Immediately,
    /// Reconnect within the configured bound, then fail for good.
    OnTimeout,
    /// Reconnect forever; staleness never surfaces as an error.
    Never,
}

impl fmt::Display for DisconnectBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DisconnectBehavior::Immediately => "immediately",
            DisconnectBehavior::OnTimeout => "on_timeout",
            DisconnectBehavior::Never => "never",
        })
    }
}

/// Endpoint configuration. Fixed for the endpoint's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Region name shared by the two peers.
    pub name: String,
    pub role: Role,
    pub disconnect_behavior: DisconnectBehavior,
    /// Heartbeat silence after which the peer is stale. Default: 100 ms.
    pub stale_threshold: Duration,
    /// Total reconnection window. `None` = unlimited. Default: 5 s.
    pub reconnect_wait: Option<Duration>,
    /// Delay between reconnection attempts. Default: 100 ms.
    pub reconnect_retry_interval: Duration,
    /// Reconnection attempt cap. `None` = unlimited. Default: 50.
    pub max_reconnect_attempts: Option<u32>,
    /// Destroy the region on close when no live peer remains.
    pub auto_cleanup: bool,
    /// Run heartbeat and monitoring on a worker thread. When off, the caller
    /// drives both through [`Endpoint::tick`](crate::Endpoint::tick) and
    /// blocking reads.
    pub use_background_threads: bool,
    /// Own heartbeat period. Default: 1 ms.
    pub heartbeat_interval: Duration,
    /// Peer liveness check period. Default: 10 ms.
    pub check_interval: Duration,
    /// Bound on acquiring the region lock. Default: 1 s.
    pub lock_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            role: Role::Auto,
            disconnect_behavior: DisconnectBehavior::OnTimeout,
            stale_threshold: Duration::from_millis(100),
            reconnect_wait: Some(Duration::from_millis(5000)),
            reconnect_retry_interval: Duration::from_millis(100),
            max_reconnect_attempts: Some(50),
            auto_cleanup: true,
            use_background_threads: true,
            heartbeat_interval: Duration::from_millis(1),
            check_interval: Duration::from_millis(10),
            lock_timeout: Duration::from_secs(1),
        }
    }
}

impl EndpointConfig {
    /// Defaults for the region `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_disconnect_behavior(mut self, behavior: DisconnectBehavior) -> Self {
        self.disconnect_behavior = behavior;
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    pub fn with_reconnect_wait(mut self, wait: Option<Duration>) -> Self {
        self.reconnect_wait = wait;
        self
    }

    pub fn with_reconnect_retry_interval(mut self, interval: Duration) -> Self {
        self.reconnect_retry_interval = interval;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_auto_cleanup(mut self, enabled: bool) -> Self {
        self.auto_cleanup = enabled;
        self
    }

    pub fn with_background_threads(mut self, enabled: bool) -> Self {
        self.use_background_threads = enabled;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Reject configurations the endpoint cannot honor.
    pub fn validate(&self) -> Result<()> {
        eshm_region::os_name(&self.name)
            .map_err(|err| EshmError::InvalidConfig(format!("name: {err}")))?;

        validate_nonzero("stale_threshold", self.stale_threshold)?;
        validate_nonzero("reconnect_retry_interval", self.reconnect_retry_interval)?;
        validate_nonzero("heartbeat_interval", self.heartbeat_interval)?;
        validate_nonzero("check_interval", self.check_interval)?;
        validate_nonzero("lock_timeout", self.lock_timeout)?;

        if self.heartbeat_interval >= self.stale_threshold {
            return Err(EshmError::InvalidConfig(format!(
                "heartbeat_interval ({:?}) must be shorter than stale_threshold ({:?})",
                self.heartbeat_interval, self.stale_threshold
            )));
        }
        if matches!(self.reconnect_wait, Some(wait) if wait.is_zero()) {
            return Err(EshmError::InvalidConfig(
                "reconnect_wait must be greater than zero (use None for unlimited)".to_string(),
            ));
        }
        if self.max_reconnect_attempts == Some(0) {
            return Err(EshmError::InvalidConfig(
                "max_reconnect_attempts must be greater than zero (use None for unlimited)"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

fn validate_nonzero(field: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(EshmError::InvalidConfig(format!(
            "{field} must be greater than zero"
        )));
    }
    Ok(())
}
