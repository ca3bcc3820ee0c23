//! Read-only snapshots of a region's shared counters.
//!
//! Snapshots are for observability only; the endpoint's liveness decisions
//! sample the live counters directly.

use std::time::Duration;

use serde::Serialize;

use crate::error::Result;
use crate::layout::{ChannelSlot, Mapping, RegionLayout, RoleSlot};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleStats {
    pub pid: u32,
    /// Claimed by a process that still exists.
    pub alive: bool,
    pub heartbeat: u64,
    /// Heartbeat advance since the previous snapshot (0 on the first).
    pub heartbeat_delta: u64,
    /// Number of times the role was claimed.
    pub generation: u32,
}

impl RoleStats {
    fn capture(slot: &RoleSlot, previous: Option<u64>) -> Self {
        let heartbeat = slot.heartbeat();
        Self {
            pid: slot.pid(),
            alive: slot.is_live(),
            heartbeat,
            heartbeat_delta: previous.map_or(0, |prev| heartbeat.wrapping_sub(prev)),
            generation: slot.generation(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub write_count: u64,
    pub read_count: u64,
}

impl ChannelStats {
    fn capture(slot: &ChannelSlot) -> Self {
        Self {
            write_count: slot.write_count(),
            read_count: slot.read_count(),
        }
    }

    /// Writes the reader never saw (overwritten or still pending).
    pub fn unread(&self) -> u64 {
        self.write_count.saturating_sub(self.read_count)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionStats {
    pub name: String,
    pub stale_threshold_ms: u64,
    pub master: RoleStats,
    pub slave: RoleStats,
    pub master_to_slave: ChannelStats,
    pub slave_to_master: ChannelStats,
    /// Times the region lock was taken over from a dead holder.
    pub lock_reclaims: u32,
}

impl RegionStats {
    /// `previous` holds the `(master, slave)` heartbeats of the last
    /// snapshot, if any.
    pub(crate) fn capture(name: &str, layout: &RegionLayout, previous: Option<(u64, u64)>) -> Self {
        let header = &layout.header;
        Self {
            name: name.to_string(),
            stale_threshold_ms: header.stale_threshold_ms(),
            master: RoleStats::capture(&header.master, previous.map(|(m, _)| m)),
            slave: RoleStats::capture(&header.slave, previous.map(|(_, s)| s)),
            master_to_slave: ChannelStats::capture(&layout.master_to_slave),
            slave_to_master: ChannelStats::capture(&layout.slave_to_master),
            lock_reclaims: header.lock.reclaim_count(),
        }
    }
}

/// Snapshot an existing region without claiming a role in it.
pub fn inspect(name: &str) -> Result<RegionStats> {
    let mapping = Mapping::open(name, Duration::ZERO)?;
    Ok(RegionStats::capture(name, mapping.layout(), None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::config::Role;

    fn zeroed_layout() -> Box<RegionLayout> {
        // SAFETY: all-zero bytes are valid for every field of the layout.
        unsafe { Box::<RegionLayout>::new_zeroed().assume_init() }
    }

    #[test]
    fn test_capture_reports_counters_and_deltas() {
        let layout = zeroed_layout();
        let timeout = Duration::from_millis(100);
        layout.header.claim(Role::Master, timeout).unwrap();
        for _ in 0..5 {
            layout.header.master.beat();
        }
        let ch = Channel::new(&layout.master_to_slave, &layout.header.lock, timeout);
        ch.write(b"a").unwrap();
        ch.write(b"b").unwrap();

        let first = RegionStats::capture("demo", &layout, None);
        assert_eq!(first.master.heartbeat, 5);
        assert_eq!(first.master.heartbeat_delta, 0);
        assert!(first.master.alive);
        assert_eq!(first.master.pid, std::process::id());
        assert!(!first.slave.alive);
        assert_eq!(first.master_to_slave.write_count, 2);
        assert_eq!(first.master_to_slave.unread(), 2);
        assert_eq!(first.slave_to_master.write_count, 0);

        layout.header.master.beat();
        layout.header.master.beat();
        let second = RegionStats::capture(
            "demo",
            &layout,
            Some((first.master.heartbeat, first.slave.heartbeat)),
        );
        assert_eq!(second.master.heartbeat_delta, 2);
        assert_eq!(second.slave.heartbeat_delta, 0);
    }

    #[test]
    fn test_stats_serialize_field_names() {
        let layout = zeroed_layout();
        let stats = RegionStats::capture("demo", &layout, None);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["name"], "demo");
        assert!(json["master"]["heartbeat_delta"].is_u64());
        assert!(json["slave_to_master"]["read_count"].is_u64());
    }
}
