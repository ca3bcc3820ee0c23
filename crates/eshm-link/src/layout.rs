//! Byte layout of the shared region.
//!
//! ```text
//! +--------------------------------------------------+
//! | RegionHeader                                     |
//! |   magic | version | slot_capacity | stale_ms     |
//! |   RobustLock                                     |
//! |   RoleSlot (master) | RoleSlot (slave)           |
//! +--------------------------------------------------+
//! | ChannelSlot master -> slave                      |
//! +--------------------------------------------------+
//! | ChannelSlot slave -> master                      |
//! +--------------------------------------------------+
//! ```
//!
//! Every field the two processes share is an atomic or sits behind the
//! region lock, so the layout can be viewed through `&RegionLayout` from
//! both sides at once.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use eshm_region::{current_pid, process_alive, RegionError, RegionIdentity, RobustLock, SharedRegion};
use tracing::{debug, info};

use crate::config::Role;
use crate::error::{EshmError, Result};

/// "ESHM" in ASCII.
pub const MAGIC: u32 = 0x4553_484D;

/// Bumped whenever the shared layout changes shape.
pub const LAYOUT_VERSION: u32 = 3;

/// Payload capacity of one direction's slot.
pub const SLOT_CAPACITY: usize = 64 * 1024;

/// Poll step while waiting for a creator to publish the header.
const HEADER_POLL: Duration = Duration::from_millis(1);

/// Per-role liveness and claim state.
#[repr(C)]
#[derive(Debug)]
pub struct RoleSlot {
    heartbeat: AtomicU64,
    pid: AtomicU32,
    alive: AtomicU32,
    generation: AtomicU32,
    _reserved: u32,
}

impl RoleSlot {
    /// Current heartbeat counter. Never reset, only advanced.
    pub fn heartbeat(&self) -> u64 {
        self.heartbeat.load(Ordering::Acquire)
    }

    pub fn beat(&self) -> u64 {
        self.heartbeat.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// Pid of the last claimant (0 if never claimed).
    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::Acquire)
    }

    pub fn alive_flag(&self) -> bool {
        self.alive.load(Ordering::Acquire) == 1
    }

    /// Number of times this role was claimed.
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Claimed by a process that still exists.
    pub fn is_live(&self) -> bool {
        self.alive_flag() && process_alive(self.pid())
    }

    fn occupy(&self, pid: u32) -> u32 {
        self.pid.store(pid, Ordering::Release);
        self.alive.store(1, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    fn vacate(&self) {
        self.alive.store(0, Ordering::Release);
    }
}

/// Fixed header at offset 0 of every region.
#[repr(C)]
#[derive(Debug)]
pub struct RegionHeader {
    magic: AtomicU32,
    version: AtomicU32,
    slot_capacity: AtomicU32,
    _reserved: u32,
    stale_threshold_ms: AtomicU64,
    pub lock: RobustLock,
    pub master: RoleSlot,
    pub slave: RoleSlot,
}

impl RegionHeader {
    pub fn magic(&self) -> u32 {
        self.magic.load(Ordering::Acquire)
    }

    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    pub fn slot_capacity(&self) -> usize {
        self.slot_capacity.load(Ordering::Acquire) as usize
    }

    /// Stale threshold configured by the region's creator.
    pub fn stale_threshold_ms(&self) -> u64 {
        self.stale_threshold_ms.load(Ordering::Acquire)
    }

    pub fn role_slot(&self, role: Role) -> &RoleSlot {
        match role {
            Role::Slave => &self.slave,
            // Auto is resolved by `claim` before any slot is touched.
            Role::Master | Role::Auto => &self.master,
        }
    }

    /// Write every field except the magic, then publish the magic.
    fn initialize(&self, stale_threshold: Duration) -> Result<()> {
        self.version.store(LAYOUT_VERSION, Ordering::Relaxed);
        self.slot_capacity
            .store(SLOT_CAPACITY as u32, Ordering::Relaxed);
        self.stale_threshold_ms.store(
            u64::try_from(stale_threshold.as_millis()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        self.lock.init()?;
        self.magic.store(MAGIC, Ordering::Release);
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let magic = self.magic();
        let version = self.version();
        if magic != MAGIC || version != LAYOUT_VERSION || self.slot_capacity() != SLOT_CAPACITY {
            return Err(EshmError::IncompatibleRegion { magic, version });
        }
        Ok(())
    }

    /// Resolve `requested` and take that side of the region.
    ///
    /// Runs under the region lock so two `Auto` attachers racing for master
    /// cannot both win. A side whose claimant died counts as free.
    pub fn claim(&self, requested: Role, lock_timeout: Duration) -> Result<Role> {
        let _guard = self.lock.lock(lock_timeout)?;

        let resolved = match requested {
            Role::Master if self.master.is_live() => {
                return Err(EshmError::RoleMismatch {
                    requested,
                    reason: format!("master is held by live pid {}", self.master.pid()),
                });
            }
            Role::Slave if self.slave.is_live() => {
                return Err(EshmError::RoleMismatch {
                    requested,
                    reason: format!("slave is held by live pid {}", self.slave.pid()),
                });
            }
            Role::Auto if !self.master.is_live() => Role::Master,
            Role::Auto if !self.slave.is_live() => Role::Slave,
            Role::Auto => {
                return Err(EshmError::RoleMismatch {
                    requested,
                    reason: "both sides are held by live processes".to_string(),
                });
            }
            role => role,
        };

        let slot = self.role_slot(resolved);
        let previous = slot.pid();
        let abandoned = slot.alive_flag();
        let pid = current_pid();
        let generation = slot.occupy(pid);
        if abandoned {
            info!(role = %resolved, pid, previous, generation, "took over stale role claim");
        } else {
            debug!(role = %resolved, pid, generation, "claimed role");
        }
        Ok(resolved)
    }

    /// Give up `role`. Returns whether the peer is still live afterwards.
    pub fn release(&self, role: Role, lock_timeout: Duration) -> Result<bool> {
        let _guard = self.lock.lock(lock_timeout)?;
        let slot = self.role_slot(role);
        if slot.pid() == current_pid() {
            slot.vacate();
        }
        Ok(self.role_slot(role.peer()).is_live())
    }
}

/// One direction's mailbox.
#[repr(C)]
pub struct ChannelSlot {
    pub(crate) write_count: AtomicU64,
    pub(crate) read_count: AtomicU64,
    pub(crate) len: AtomicU32,
    _reserved: u32,
    pub(crate) data: UnsafeCell<[u8; SLOT_CAPACITY]>,
}

// SAFETY: `data` is only touched while the region lock is held.
unsafe impl Sync for ChannelSlot {}

impl ChannelSlot {
    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::Acquire)
    }

    pub fn read_count(&self) -> u64 {
        self.read_count.load(Ordering::Acquire)
    }
}

/// The whole region as seen through a mapping.
#[repr(C)]
pub struct RegionLayout {
    pub header: RegionHeader,
    pub master_to_slave: ChannelSlot,
    pub slave_to_master: ChannelSlot,
}

impl RegionLayout {
    /// Bytes a region needs to hold the layout.
    pub const SIZE: usize = std::mem::size_of::<RegionLayout>();

    /// Slot `role` writes into.
    pub fn outgoing(&self, role: Role) -> &ChannelSlot {
        match role {
            Role::Slave => &self.slave_to_master,
            Role::Master | Role::Auto => &self.master_to_slave,
        }
    }

    /// Slot `role` reads from.
    pub fn incoming(&self, role: Role) -> &ChannelSlot {
        self.outgoing(role.peer())
    }
}

/// A mapped region known to carry a valid [`RegionLayout`].
pub(crate) struct Mapping {
    region: SharedRegion,
}

impl Mapping {
    /// Create and initialize a fresh region.
    pub(crate) fn create(name: &str, stale_threshold: Duration) -> Result<Self> {
        let region = SharedRegion::create(name, RegionLayout::SIZE)?;
        let mapping = Self { region };
        if let Err(err) = mapping.layout().header.initialize(stale_threshold) {
            discard(name);
            return Err(err);
        }
        info!(name, size = RegionLayout::SIZE, "initialized region layout");
        Ok(mapping)
    }

    /// Attach to an existing region, waiting up to `wait` for its creator to
    /// finish initializing it.
    pub(crate) fn open(name: &str, wait: Duration) -> Result<Self> {
        let deadline = Instant::now() + wait;
        loop {
            let pending = match SharedRegion::open(name, RegionLayout::SIZE) {
                Ok(region) => {
                    let mapping = Self { region };
                    let header = &mapping.layout().header;
                    if header.magic() != 0 {
                        header.validate()?;
                        return Ok(mapping);
                    }
                    EshmError::IncompatibleRegion {
                        magic: 0,
                        version: header.version(),
                    }
                }
                // The creator may not have sized the object yet.
                Err(err @ RegionError::TooSmall { .. }) => err.into(),
                Err(err) => return Err(err.into()),
            };
            if Instant::now() >= deadline {
                return Err(pending);
            }
            std::thread::sleep(HEADER_POLL);
        }
    }

    pub(crate) fn layout(&self) -> &RegionLayout {
        // SAFETY: the region is at least `RegionLayout::SIZE` bytes (checked
        // by create/open), page-aligned by mmap, and lives as long as
        // `self`. All shared fields are atomics or guarded by the lock, and
        // zeroed memory is a valid bit pattern for every field.
        unsafe { &*(self.region.as_ptr() as *const RegionLayout) }
    }

    pub(crate) fn identity(&self) -> RegionIdentity {
        self.region.identity()
    }

    pub(crate) fn created(&self) -> bool {
        self.region.created()
    }
}

/// Remove a region that never became usable. The original error is what
/// the caller reports, so a failed unlink is only logged.
fn discard(name: &str) {
    match SharedRegion::unlink(name) {
        Ok(removed) => debug!(name, removed, "discarded half-initialized region"),
        Err(err) => debug!(name, error = %err, "removing half-initialized region failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeroed_header() -> Box<RegionHeader> {
        // SAFETY: all-zero bytes are valid for every atomic field.
        unsafe { Box::<RegionHeader>::new_zeroed().assume_init() }
    }

    #[test]
    fn test_layout_alignment_and_size() {
        assert_eq!(std::mem::align_of::<RegionHeader>() % 64, 0);
        assert!(RegionLayout::SIZE >= 2 * SLOT_CAPACITY);
        assert_eq!(MAGIC.to_be_bytes(), *b"ESHM");
    }

    #[test]
    fn test_initialize_publishes_magic() {
        let header = zeroed_header();
        assert!(header.validate().is_err());
        header.initialize(Duration::from_millis(250)).unwrap();
        header.validate().unwrap();
        assert_eq!(header.stale_threshold_ms(), 250);
        assert_eq!(header.slot_capacity(), SLOT_CAPACITY);
    }

    #[test]
    fn test_version_mismatch_is_incompatible() {
        let header = zeroed_header();
        header.initialize(Duration::from_millis(100)).unwrap();
        header.version.store(LAYOUT_VERSION + 1, Ordering::Release);
        assert!(matches!(
            header.validate(),
            Err(EshmError::IncompatibleRegion { magic: MAGIC, .. })
        ));
    }

    #[test]
    fn test_auto_resolves_master_then_slave() {
        let header = zeroed_header();
        let timeout = Duration::from_millis(100);
        assert_eq!(header.claim(Role::Auto, timeout).unwrap(), Role::Master);
        assert_eq!(header.claim(Role::Auto, timeout).unwrap(), Role::Slave);
        assert!(matches!(
            header.claim(Role::Auto, timeout),
            Err(EshmError::RoleMismatch { .. })
        ));
        assert_eq!(header.master.generation(), 1);
        assert_eq!(header.slave.pid(), current_pid());
    }

    #[test]
    fn test_live_claim_blocks_same_role() {
        let header = zeroed_header();
        let timeout = Duration::from_millis(100);
        header.claim(Role::Master, timeout).unwrap();
        assert!(matches!(
            header.claim(Role::Master, timeout),
            Err(EshmError::RoleMismatch { requested: Role::Master, .. })
        ));
    }

    #[test]
    fn test_released_role_can_be_reclaimed() {
        let header = zeroed_header();
        let timeout = Duration::from_millis(100);
        header.claim(Role::Master, timeout).unwrap();
        header.claim(Role::Slave, timeout).unwrap();

        assert!(header.release(Role::Master, timeout).unwrap());
        assert!(!header.master.alive_flag());
        assert_eq!(header.claim(Role::Auto, timeout).unwrap(), Role::Master);
        assert_eq!(header.master.generation(), 2);
    }

    #[test]
    fn test_dead_claimant_counts_as_free() {
        let header = zeroed_header();
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead = child.id();
        child.wait().unwrap();

        header.master.occupy(dead);
        assert!(!header.master.is_live());
        assert_eq!(
            header.claim(Role::Master, Duration::from_millis(100)).unwrap(),
            Role::Master
        );
        assert_eq!(header.master.pid(), current_pid());
    }

    #[cfg(unix)]
    #[test]
    fn test_discard_removes_region_and_tolerates_missing() {
        let name = format!("layout-discard-{}", current_pid());
        let region = SharedRegion::create(&name, RegionLayout::SIZE).unwrap();
        discard(&name);
        assert!(!SharedRegion::exists(&name).unwrap());
        // Already gone: logged, not raised.
        discard(&name);
        drop(region);
    }

    #[test]
    fn test_heartbeat_only_advances() {
        let header = zeroed_header();
        assert_eq!(header.slave.beat(), 1);
        assert_eq!(header.slave.beat(), 2);
        header.slave.vacate();
        assert_eq!(header.slave.heartbeat(), 2);
    }
}
