use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use eshm_codec::DataItem;
use eshm_region::{RegionError, SharedRegion};
use tracing::{debug, info, warn};

use crate::channel::{Channel, POLL_INTERVAL};
use crate::config::{DisconnectBehavior, EndpointConfig, Role};
use crate::error::{EshmError, Result};
use crate::layout::{Mapping, RegionHeader};
use crate::liveness::{LinkState, LivenessEvent, LivenessMonitor, ReconnectPolicy};
use crate::stats::RegionStats;

/// Timeout of [`Endpoint::read`] and [`Endpoint::read_items`] callers that
/// do not pick one.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(1000);

/// Open/create races tolerated before giving up.
const ATTACH_ATTEMPTS: u32 = 3;

/// One side of a named master/slave link.
///
/// Opening an endpoint resolves its role, claims that side of the region,
/// and (unless background threads are off) starts a worker that heartbeats
/// and watches the peer. The endpoint is closed on drop.
///
/// ```no_run
/// use eshm_link::{Endpoint, EndpointConfig, Role};
///
/// let master = Endpoint::open(EndpointConfig::new("sensors").with_role(Role::Master))?;
/// master.write(b"ping")?;
/// # Ok::<(), eshm_link::EshmError>(())
/// ```
pub struct Endpoint {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

struct Shared {
    config: EndpointConfig,
    role: Role,
    mapping: RwLock<Arc<Mapping>>,
    monitor: Mutex<LivenessMonitor>,
    closed: AtomicBool,
    stats_baseline: Mutex<Option<(u64, u64)>>,
}

impl Endpoint {
    /// Open the endpoint described by `config`.
    pub fn open(config: EndpointConfig) -> Result<Self> {
        config.validate()?;

        let mapping = attach_region(&config)?;
        let header = &mapping.layout().header;
        let role = header.claim(config.role, config.lock_timeout)?;
        header.role_slot(role).beat();
        let peer_present = header.role_slot(role.peer()).is_live();

        info!(
            name = %config.name,
            requested = %config.role,
            role = %role,
            created = mapping.created(),
            peer_present,
            "endpoint opened"
        );

        let stale_threshold = region_stale_threshold(header, &config);
        let policy = ReconnectPolicy::for_endpoint(&config, role, stale_threshold);
        let now = Instant::now();
        let monitor = LivenessMonitor::new(policy, peer_present, now);
        let threaded = config.use_background_threads;
        let shared = Arc::new(Shared {
            config,
            role,
            mapping: RwLock::new(Arc::new(mapping)),
            monitor: Mutex::new(monitor),
            closed: AtomicBool::new(false),
            stats_baseline: Mutex::new(None),
        });

        let worker = if threaded {
            let worker_shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("eshm-{role}"))
                .spawn(move || run_worker(worker_shared));
            match handle {
                Ok(handle) => Some(handle),
                Err(err) => {
                    shared.closed.store(true, Ordering::Release);
                    shared.release_claim();
                    return Err(err.into());
                }
            }
        } else {
            None
        };

        Ok(Self { shared, worker })
    }

    /// Resolved role. Never [`Role::Auto`].
    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.shared.config
    }

    pub fn link_state(&self) -> LinkState {
        self.shared.monitor().state()
    }

    /// Whether the peer's heartbeat moved within the stale threshold.
    pub fn is_remote_alive(&self) -> bool {
        !self.shared.is_closed() && self.shared.monitor().is_peer_alive()
    }

    /// Send `payload` to the peer, replacing any message it has not read.
    pub fn write(&self, payload: &[u8]) -> Result<()> {
        self.shared.ensure_usable()?;
        let mapping = self.shared.mapping();
        self.shared.outgoing(&mapping).write(payload)
    }

    /// Read the next message, waiting up to [`DEFAULT_READ_TIMEOUT`].
    pub fn read(&self) -> Result<Bytes> {
        self.read_timeout(DEFAULT_READ_TIMEOUT)
    }

    /// Read the next message, waiting up to `timeout`.
    ///
    /// A zero `timeout` does not wait: an empty mailbox is
    /// [`EshmError::NoData`]. Otherwise an empty mailbox at the deadline is
    /// [`EshmError::Timeout`].
    pub fn read_timeout(&self, timeout: Duration) -> Result<Bytes> {
        self.poll_incoming(timeout, |channel| channel.try_read())
    }

    /// Read the next message if one is pending.
    pub fn try_read(&self) -> Result<Bytes> {
        self.read_timeout(Duration::ZERO)
    }

    /// Read the next message into `buf`, returning its length.
    ///
    /// If `buf` is too small the message stays pending and
    /// [`EshmError::BufferTooSmall`] reports the size needed.
    pub fn read_into(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.poll_incoming(timeout, |channel| channel.try_read_into(buf))
    }

    /// Encode `items` and send them as one message.
    pub fn write_items(&self, items: &[DataItem]) -> Result<()> {
        let encoded = eshm_codec::encode_items(items)?;
        self.write(&encoded)
    }

    /// Read one message and decode it into items.
    pub fn read_items(&self, timeout: Duration) -> Result<Vec<DataItem>> {
        let payload = self.read_timeout(timeout)?;
        Ok(eshm_codec::decode_items(&payload)?)
    }

    pub fn try_read_items(&self) -> Result<Vec<DataItem>> {
        self.read_items(Duration::ZERO)
    }

    /// Snapshot of the shared counters. Heartbeat deltas are relative to
    /// the previous call.
    pub fn stats(&self) -> Result<RegionStats> {
        if self.shared.is_closed() {
            return Err(EshmError::NotInitialized);
        }
        let mapping = self.shared.mapping();
        let layout = mapping.layout();
        let mut baseline = lock_ignoring_poison(&self.shared.stats_baseline);
        let stats = RegionStats::capture(&self.shared.config.name, layout, *baseline);
        *baseline = Some((stats.master.heartbeat, stats.slave.heartbeat));
        Ok(stats)
    }

    /// One heartbeat plus one liveness check.
    ///
    /// The worker does this on its own; without background threads the
    /// caller must call `tick` (blocking reads call it while they wait).
    pub fn tick(&self) {
        if self.shared.is_closed() {
            return;
        }
        self.shared.heartbeat();
        self.shared.check(Instant::now());
    }

    /// Stop the worker, release the role, and destroy the region if
    /// `auto_cleanup` is set and no live peer remains.
    ///
    /// Every operation after `close` fails with
    /// [`EshmError::NotInitialized`]. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(name = %self.shared.config.name, "endpoint worker panicked");
            }
        }
        self.shared.monitor().detach();
        self.shared.release_claim_and_cleanup()
    }

    fn poll_incoming<T>(
        &self,
        timeout: Duration,
        mut attempt: impl FnMut(&Channel<'_>) -> Result<T>,
    ) -> Result<T> {
        let deadline = Instant::now() + timeout;
        loop {
            self.shared.ensure_usable()?;
            if self.worker.is_none() {
                self.tick();
            }

            let mapping = self.shared.mapping();
            match attempt(&self.shared.incoming(&mapping)) {
                Err(EshmError::NoData) => {}
                other => return other,
            }

            if timeout.is_zero() {
                return Err(EshmError::NoData);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(EshmError::Timeout(timeout));
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            debug!(name = %self.shared.config.name, error = %err, "endpoint close on drop failed");
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.shared.config.name)
            .field("role", &self.shared.role)
            .field("state", &self.link_state())
            .finish()
    }
}

impl Shared {
    fn mapping(&self) -> Arc<Mapping> {
        Arc::clone(&self.mapping.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn monitor(&self) -> MutexGuard<'_, LivenessMonitor> {
        lock_ignoring_poison(&self.monitor)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn outgoing<'m>(&self, mapping: &'m Mapping) -> Channel<'m> {
        let layout = mapping.layout();
        Channel::new(
            layout.outgoing(self.role),
            &layout.header.lock,
            self.config.lock_timeout,
        )
    }

    fn incoming<'m>(&self, mapping: &'m Mapping) -> Channel<'m> {
        let layout = mapping.layout();
        Channel::new(
            layout.incoming(self.role),
            &layout.header.lock,
            self.config.lock_timeout,
        )
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.is_closed() {
            return Err(EshmError::NotInitialized);
        }
        let monitor = self.monitor();
        if let Some(failure) = monitor.failure() {
            return Err(EshmError::ReconnectFailed {
                attempts: failure.attempts,
                elapsed: failure.elapsed,
            });
        }
        if monitor.policy().behavior == DisconnectBehavior::Immediately && monitor.peer_lost() {
            return Err(EshmError::PeerStale {
                peer: self.role.peer(),
            });
        }
        Ok(())
    }

    fn heartbeat(&self) {
        self.mapping().layout().header.role_slot(self.role).beat();
    }

    fn peer_heartbeat(&self) -> u64 {
        self.mapping()
            .layout()
            .header
            .role_slot(self.role.peer())
            .heartbeat()
    }

    fn check(&self, now: Instant) {
        let event = self.monitor().observe(self.peer_heartbeat(), now);
        let name = &self.config.name;
        let peer = self.role.peer();

        match event {
            LivenessEvent::Steady => {}
            LivenessEvent::PeerStale { silent_for } => {
                warn!(name = %name, %peer, ?silent_for, "peer heartbeat stale");
            }
            LivenessEvent::PeerRecovered => {
                info!(name = %name, %peer, "peer heartbeat recovered");
            }
            LivenessEvent::ReconnectDue { attempt } => {
                debug!(name = %name, %peer, attempt, "reconnect attempt");
                self.reconnect_attempt(attempt, now);
            }
            LivenessEvent::GaveUp(failure) => {
                warn!(
                    name = %name,
                    %peer,
                    attempts = failure.attempts,
                    elapsed = ?failure.elapsed,
                    "reconnection gave up"
                );
            }
        }
    }

    /// A master waits for the slave's heartbeat in place. A slave also looks
    /// for a region re-created under the same name and moves over to it.
    fn reconnect_attempt(&self, attempt: u32, now: Instant) {
        let reattached = match self.role {
            Role::Slave => match self.try_reattach() {
                Ok(found) => found,
                Err(err) => {
                    debug!(name = %self.config.name, attempt, error = %err, "re-attach failed");
                    None
                }
            },
            Role::Master | Role::Auto => None,
        };

        let mut monitor = self.monitor();
        let event = match reattached {
            Some(heartbeat) => {
                info!(name = %self.config.name, attempt, "re-attached to re-created region");
                monitor.reattached(heartbeat, now)
            }
            None => monitor.attempt_failed(now),
        };
        if let LivenessEvent::GaveUp(failure) = event {
            warn!(
                name = %self.config.name,
                peer = %self.role.peer(),
                attempts = failure.attempts,
                elapsed = ?failure.elapsed,
                "reconnection gave up"
            );
        }
    }

    /// Returns the new master heartbeat if the slave moved to a new region.
    fn try_reattach(&self) -> Result<Option<u64>> {
        let current = self.mapping();
        let Some(identity) = SharedRegion::identity_of(&self.config.name)? else {
            return Ok(None);
        };
        if identity == current.identity() {
            return Ok(None);
        }

        let fresh = Mapping::open(&self.config.name, Duration::ZERO)?;
        let header = &fresh.layout().header;
        if !header.master.is_live() {
            return Ok(None);
        }
        header.claim(Role::Slave, self.config.lock_timeout)?;
        header.slave.beat();
        let heartbeat = header.master.heartbeat();

        if let Err(err) = current
            .layout()
            .header
            .release(Role::Slave, self.config.lock_timeout)
        {
            debug!(name = %self.config.name, error = %err, "releasing old region claim failed");
        }
        *self.mapping.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(fresh);
        Ok(Some(heartbeat))
    }

    fn release_claim(&self) -> bool {
        match self
            .mapping()
            .layout()
            .header
            .release(self.role, self.config.lock_timeout)
        {
            Ok(peer_live) => peer_live,
            Err(err) => {
                warn!(name = %self.config.name, error = %err, "releasing role claim failed");
                true
            }
        }
    }

    fn release_claim_and_cleanup(&self) -> Result<()> {
        let mapping = self.mapping();
        let peer_live = mapping
            .layout()
            .header
            .release(self.role, self.config.lock_timeout)?;
        info!(name = %self.config.name, role = %self.role, peer_live, "endpoint closed");

        if !self.config.auto_cleanup || peer_live {
            return Ok(());
        }
        // Only remove the name if it still refers to our region.
        if SharedRegion::identity_of(&self.config.name)? == Some(mapping.identity()) {
            SharedRegion::unlink(&self.config.name)?;
            info!(name = %self.config.name, "destroyed region");
        }
        Ok(())
    }
}

fn run_worker(shared: Arc<Shared>) {
    let heartbeat = shared.config.heartbeat_interval;
    let check = shared.config.check_interval;
    let mut next_check = Instant::now();

    debug!(name = %shared.config.name, role = %shared.role, "endpoint worker started");
    while !shared.is_closed() {
        shared.heartbeat();
        let now = Instant::now();
        if now >= next_check {
            shared.check(now);
            next_check = now + check;
        }
        thread::sleep(heartbeat);
    }
    debug!(name = %shared.config.name, role = %shared.role, "endpoint worker stopped");
}

/// Open the region for `config`, creating it when the role allows.
///
/// A slave only attaches. Master and auto attach to a valid existing
/// region (taking over a dead master's side) and replace a region whose
/// header they cannot use.
fn attach_region(config: &EndpointConfig) -> Result<Mapping> {
    let name = config.name.as_str();
    if config.role == Role::Slave {
        return Mapping::open(name, config.lock_timeout);
    }

    let mut last_err = None;
    for _ in 0..ATTACH_ATTEMPTS {
        let err = match Mapping::open(name, config.lock_timeout) {
            Ok(mapping) => return Ok(mapping),
            Err(err) => err,
        };
        match &err {
            EshmError::Region(region) if region.is_not_found() => {}
            EshmError::IncompatibleRegion { .. }
            | EshmError::Region(RegionError::TooSmall { .. }) => {
                warn!(name, error = %err, "replacing unusable region");
                SharedRegion::unlink(name)?;
            }
            _ => return Err(err),
        }

        match Mapping::create(name, config.stale_threshold) {
            Ok(mapping) => return Ok(mapping),
            // Someone else created it between our open and create.
            Err(EshmError::Region(region)) if region.is_already_exists() => {
                debug!(name, "lost region create race, attaching instead");
                last_err = Some(EshmError::Region(region));
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        EshmError::InvalidConfig(format!("could not attach region {name}"))
    }))
}

/// Both sides judge staleness by the threshold the region's creator
/// recorded, so they agree on it.
fn region_stale_threshold(header: &RegionHeader, config: &EndpointConfig) -> Duration {
    let recorded = Duration::from_millis(header.stale_threshold_ms());
    if recorded.is_zero() || recorded == config.stale_threshold {
        return config.stale_threshold;
    }
    if config.heartbeat_interval >= recorded {
        warn!(
            name = %config.name,
            recorded = ?recorded,
            heartbeat_interval = ?config.heartbeat_interval,
            "heartbeat interval is not below the region's stale threshold"
        );
    } else {
        debug!(
            name = %config.name,
            recorded = ?recorded,
            configured = ?config.stale_threshold,
            "using stale threshold recorded in region"
        );
    }
    recorded
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
