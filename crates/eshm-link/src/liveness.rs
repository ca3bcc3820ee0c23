//! Peer liveness and reconnection.
//!
//! [`LivenessMonitor`] is a pure state machine: it is fed heartbeat samples
//! and the current [`Instant`], and answers with a [`LivenessEvent`]. The
//! endpoint owns the side effects (re-opening regions, logging, failing
//! calls); this module only decides when.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::{DisconnectBehavior, EndpointConfig, Role};

/// Link state as seen by one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    AttachedLive,
    PeerStale,
    Reconnecting,
    /// Closed. Terminal.
    Detached,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LinkState::AttachedLive => "attached_live",
            LinkState::PeerStale => "peer_stale",
            LinkState::Reconnecting => "reconnecting",
            LinkState::Detached => "detached",
        })
    }
}

/// Reconnection gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectFailure {
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Outcome of one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEvent {
    /// Nothing changed.
    Steady,
    /// The peer just went silent.
    PeerStale { silent_for: Duration },
    /// The peer's heartbeat moved again after being stale.
    PeerRecovered,
    /// Time for reconnection attempt number `attempt` (1-based).
    ReconnectDue { attempt: u32 },
    /// Reconnection is exhausted.
    GaveUp(ReconnectFailure),
}

/// The reconnection knobs of [`EndpointConfig`], resolved for one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub behavior: DisconnectBehavior,
    pub stale_threshold: Duration,
    pub wait: Option<Duration>,
    pub retry_interval: Duration,
    pub max_attempts: Option<u32>,
    /// Whether the `OnTimeout` bounds end in a terminal failure. Only a
    /// slave gives up; a master keeps serving until a slave returns.
    pub gives_up: bool,
}

impl ReconnectPolicy {
    /// Policy for an endpoint resolved to `role` on a region whose peers
    /// agree on `stale_threshold`.
    pub fn for_endpoint(config: &EndpointConfig, role: Role, stale_threshold: Duration) -> Self {
        Self {
            behavior: config.disconnect_behavior,
            stale_threshold,
            wait: config.reconnect_wait,
            retry_interval: config.reconnect_retry_interval,
            max_attempts: config.max_reconnect_attempts,
            gives_up: role == Role::Slave,
        }
    }
}

#[derive(Debug)]
pub struct LivenessMonitor {
    policy: ReconnectPolicy,
    state: LinkState,
    last_heartbeat: Option<u64>,
    last_change: Instant,
    peer_seen: bool,
    reconnect_started: Option<Instant>,
    next_attempt: Instant,
    attempts: u32,
    failure: Option<ReconnectFailure>,
}

impl LivenessMonitor {
    /// `peer_present` seeds the first observation: a peer that is already
    /// claimed at attach time counts as seen.
    pub fn new(policy: ReconnectPolicy, peer_present: bool, now: Instant) -> Self {
        Self {
            policy,
            state: LinkState::AttachedLive,
            last_heartbeat: None,
            last_change: now,
            peer_seen: peer_present,
            reconnect_started: None,
            next_attempt: now,
            attempts: 0,
            failure: None,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Live means attached and the peer's heartbeat moved within the
    /// threshold at the last observation.
    pub fn is_peer_alive(&self) -> bool {
        self.state == LinkState::AttachedLive && self.peer_seen
    }

    /// The peer was live at some point and is now stale. A peer that never
    /// attached is not "lost".
    pub fn peer_lost(&self) -> bool {
        self.peer_seen && self.state == LinkState::PeerStale
    }

    /// Set once reconnection gave up; never cleared.
    pub fn failure(&self) -> Option<ReconnectFailure> {
        self.failure
    }

    /// Attempts made in the current reconnection round.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Feed one heartbeat sample of the peer.
    pub fn observe(&mut self, heartbeat: u64, now: Instant) -> LivenessEvent {
        if self.state == LinkState::Detached {
            return LivenessEvent::Steady;
        }

        let moved = match self.last_heartbeat {
            Some(previous) => previous != heartbeat,
            None => false,
        };
        self.last_heartbeat = Some(heartbeat);

        if moved {
            self.last_change = now;
            self.peer_seen = true;
            if self.state != LinkState::AttachedLive && self.failure.is_none() {
                self.recover();
                return LivenessEvent::PeerRecovered;
            }
        }

        match self.state {
            LinkState::AttachedLive => {
                let silent_for = now.saturating_duration_since(self.last_change);
                if silent_for < self.policy.stale_threshold {
                    return LivenessEvent::Steady;
                }
                if self.peer_seen && self.policy.behavior != DisconnectBehavior::Immediately {
                    self.state = LinkState::Reconnecting;
                    self.reconnect_started = Some(now);
                    self.next_attempt = now;
                    self.attempts = 0;
                } else {
                    self.state = LinkState::PeerStale;
                }
                LivenessEvent::PeerStale { silent_for }
            }
            LinkState::Reconnecting => {
                if let Some(failure) = self.wait_exhausted(now) {
                    return self.give_up(failure);
                }
                if now < self.next_attempt {
                    return LivenessEvent::Steady;
                }
                self.attempts = self.attempts.saturating_add(1);
                self.next_attempt = now + self.policy.retry_interval;
                LivenessEvent::ReconnectDue {
                    attempt: self.attempts,
                }
            }
            LinkState::PeerStale | LinkState::Detached => LivenessEvent::Steady,
        }
    }

    /// The reconnection attempt announced by the last `ReconnectDue` failed.
    pub fn attempt_failed(&mut self, now: Instant) -> LivenessEvent {
        if self.state != LinkState::Reconnecting {
            return LivenessEvent::Steady;
        }
        let exhausted = matches!(self.policy.max_attempts, Some(max) if self.attempts >= max);
        if self.bounded() && exhausted {
            let failure = ReconnectFailure {
                attempts: self.attempts,
                elapsed: self.reconnect_elapsed(now),
            };
            return self.give_up(failure);
        }
        LivenessEvent::Steady
    }

    /// The endpoint re-attached to a (possibly new) region whose peer
    /// heartbeat is now `heartbeat`.
    pub fn reattached(&mut self, heartbeat: u64, now: Instant) -> LivenessEvent {
        if self.state == LinkState::Detached || self.failure.is_some() {
            return LivenessEvent::Steady;
        }
        self.last_heartbeat = Some(heartbeat);
        self.last_change = now;
        self.peer_seen = true;
        self.recover();
        LivenessEvent::PeerRecovered
    }

    pub fn detach(&mut self) {
        self.state = LinkState::Detached;
    }

    fn recover(&mut self) {
        self.state = LinkState::AttachedLive;
        self.reconnect_started = None;
        self.attempts = 0;
    }

    fn bounded(&self) -> bool {
        self.policy.gives_up && self.policy.behavior == DisconnectBehavior::OnTimeout
    }

    fn reconnect_elapsed(&self, now: Instant) -> Duration {
        self.reconnect_started
            .map(|start| now.saturating_duration_since(start))
            .unwrap_or_default()
    }

    fn wait_exhausted(&self, now: Instant) -> Option<ReconnectFailure> {
        if !self.bounded() {
            return None;
        }
        let wait = self.policy.wait?;
        let elapsed = self.reconnect_elapsed(now);
        (elapsed >= wait).then_some(ReconnectFailure {
            attempts: self.attempts,
            elapsed,
        })
    }

    fn give_up(&mut self, failure: ReconnectFailure) -> LivenessEvent {
        self.state = LinkState::PeerStale;
        self.failure = Some(failure);
        LivenessEvent::GaveUp(failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(behavior: DisconnectBehavior) -> ReconnectPolicy {
        ReconnectPolicy {
            behavior,
            stale_threshold: Duration::from_millis(100),
            wait: None,
            retry_interval: Duration::from_millis(10),
            max_attempts: Some(3),
            gives_up: true,
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    /// Drive a monitor whose peer is beating until `t0`, then goes silent.
    fn silenced(behavior: DisconnectBehavior) -> (LivenessMonitor, Instant) {
        let t0 = Instant::now();
        let mut monitor = LivenessMonitor::new(policy(behavior), true, t0);
        assert_eq!(monitor.observe(1, t0), LivenessEvent::Steady);
        assert_eq!(monitor.observe(2, t0 + ms(5)), LivenessEvent::Steady);
        (monitor, t0 + ms(5))
    }

    #[test]
    fn test_stale_after_threshold() {
        let (mut monitor, t) = silenced(DisconnectBehavior::Immediately);
        assert!(monitor.is_peer_alive());
        assert_eq!(monitor.observe(2, t + ms(99)), LivenessEvent::Steady);
        assert!(monitor.is_peer_alive());

        assert_eq!(
            monitor.observe(2, t + ms(100)),
            LivenessEvent::PeerStale { silent_for: ms(100) }
        );
        assert!(!monitor.is_peer_alive());
        assert!(monitor.peer_lost());
        assert_eq!(monitor.state(), LinkState::PeerStale);
    }

    #[test]
    fn test_immediately_recovers_without_reconnecting() {
        let (mut monitor, t) = silenced(DisconnectBehavior::Immediately);
        monitor.observe(2, t + ms(150));
        assert_eq!(monitor.observe(2, t + ms(300)), LivenessEvent::Steady);
        assert_eq!(monitor.attempts(), 0);

        assert_eq!(monitor.observe(3, t + ms(310)), LivenessEvent::PeerRecovered);
        assert!(monitor.is_peer_alive());
    }

    #[test]
    fn test_on_timeout_gives_up_after_max_attempts() {
        let (mut monitor, t) = silenced(DisconnectBehavior::OnTimeout);
        let stale_at = t + ms(100);
        assert!(matches!(
            monitor.observe(2, stale_at),
            LivenessEvent::PeerStale { .. }
        ));
        assert_eq!(monitor.state(), LinkState::Reconnecting);

        let mut now = stale_at;
        let mut gave_up = None;
        for expected in 1..=3 {
            assert_eq!(
                monitor.observe(2, now),
                LivenessEvent::ReconnectDue { attempt: expected }
            );
            if let LivenessEvent::GaveUp(failure) = monitor.attempt_failed(now) {
                gave_up = Some(failure);
            }
            now += ms(10);
        }

        let failure = gave_up.expect("third failed attempt gives up");
        assert_eq!(failure.attempts, 3);
        assert_eq!(monitor.failure(), Some(failure));
        assert_eq!(monitor.state(), LinkState::PeerStale);
        assert_eq!(monitor.observe(2, now + ms(50)), LivenessEvent::Steady);
        // A late heartbeat does not undo the terminal failure.
        assert_eq!(monitor.observe(9, now + ms(60)), LivenessEvent::Steady);
        assert!(monitor.failure().is_some());
    }

    #[test]
    fn test_on_timeout_gives_up_after_wait() {
        let mut p = policy(DisconnectBehavior::OnTimeout);
        p.max_attempts = None;
        p.wait = Some(ms(50));
        let t0 = Instant::now();
        let mut monitor = LivenessMonitor::new(p, true, t0);
        monitor.observe(1, t0);
        monitor.observe(1, t0 + ms(100));
        assert_eq!(monitor.state(), LinkState::Reconnecting);

        assert!(matches!(
            monitor.observe(1, t0 + ms(100)),
            LivenessEvent::ReconnectDue { attempt: 1 }
        ));
        assert_eq!(monitor.attempt_failed(t0 + ms(100)), LivenessEvent::Steady);
        assert!(matches!(
            monitor.observe(1, t0 + ms(150)),
            LivenessEvent::GaveUp(ReconnectFailure { elapsed, .. }) if elapsed == ms(50)
        ));
    }

    #[test]
    fn test_retry_interval_spaces_attempts() {
        let (mut monitor, t) = silenced(DisconnectBehavior::OnTimeout);
        let stale_at = t + ms(100);
        monitor.observe(2, stale_at);
        assert!(matches!(
            monitor.observe(2, stale_at),
            LivenessEvent::ReconnectDue { attempt: 1 }
        ));
        monitor.attempt_failed(stale_at);
        assert_eq!(monitor.observe(2, stale_at + ms(5)), LivenessEvent::Steady);
        assert!(matches!(
            monitor.observe(2, stale_at + ms(10)),
            LivenessEvent::ReconnectDue { attempt: 2 }
        ));
    }

    #[test]
    fn test_never_keeps_retrying() {
        let (mut monitor, t) = silenced(DisconnectBehavior::Never);
        let mut now = t + ms(100);
        monitor.observe(2, now);
        for attempt in 1..=12 {
            assert_eq!(
                monitor.observe(2, now),
                LivenessEvent::ReconnectDue { attempt }
            );
            assert_eq!(monitor.attempt_failed(now), LivenessEvent::Steady);
            now += ms(10);
        }
        assert!(monitor.failure().is_none());
        assert_eq!(monitor.state(), LinkState::Reconnecting);
    }

    #[test]
    fn test_recovery_while_reconnecting() {
        let (mut monitor, t) = silenced(DisconnectBehavior::OnTimeout);
        monitor.observe(2, t + ms(100));
        monitor.observe(2, t + ms(100));
        monitor.attempt_failed(t + ms(100));
        assert_eq!(monitor.attempts(), 1);

        assert_eq!(monitor.observe(3, t + ms(105)), LivenessEvent::PeerRecovered);
        assert_eq!(monitor.state(), LinkState::AttachedLive);
        assert_eq!(monitor.attempts(), 0);
        assert!(monitor.is_peer_alive());
    }

    #[test]
    fn test_reattach_recovers() {
        let (mut monitor, t) = silenced(DisconnectBehavior::OnTimeout);
        monitor.observe(2, t + ms(100));
        monitor.observe(2, t + ms(100));
        assert_eq!(monitor.reattached(0, t + ms(101)), LivenessEvent::PeerRecovered);
        assert!(monitor.is_peer_alive());
        // The new region's counter is the baseline from here on.
        assert_eq!(monitor.observe(0, t + ms(150)), LivenessEvent::Steady);
    }

    #[test]
    fn test_unseen_peer_does_not_reconnect() {
        let t0 = Instant::now();
        let mut monitor =
            LivenessMonitor::new(policy(DisconnectBehavior::OnTimeout), false, t0);
        assert!(!monitor.is_peer_alive());
        assert!(matches!(
            monitor.observe(0, t0 + ms(200)),
            LivenessEvent::PeerStale { .. }
        ));
        assert_eq!(monitor.state(), LinkState::PeerStale);
        assert!(!monitor.peer_lost());
        assert!(monitor.failure().is_none());

        monitor.observe(0, t0 + ms(210));
        assert_eq!(monitor.observe(1, t0 + ms(220)), LivenessEvent::PeerRecovered);
        assert!(monitor.is_peer_alive());
    }

    #[test]
    fn test_master_side_outlasts_reconnect_bounds() {
        let mut p = policy(DisconnectBehavior::OnTimeout);
        p.gives_up = false;
        p.wait = Some(ms(50));
        let t0 = Instant::now();
        let mut monitor = LivenessMonitor::new(p, true, t0);
        monitor.observe(1, t0);
        monitor.observe(1, t0 + ms(100));
        assert_eq!(monitor.state(), LinkState::Reconnecting);

        let mut now = t0 + ms(100);
        for _ in 0..20 {
            monitor.observe(1, now);
            assert_eq!(monitor.attempt_failed(now), LivenessEvent::Steady);
            now += ms(10);
        }
        assert!(monitor.failure().is_none());
        assert_eq!(monitor.state(), LinkState::Reconnecting);

        // A restarted peer is picked up long after the window closed.
        assert_eq!(monitor.observe(0, now), LivenessEvent::PeerRecovered);
        assert!(monitor.is_peer_alive());
    }

    #[test]
    fn test_only_slave_policy_gives_up() {
        let config = EndpointConfig::new("sensors");
        let threshold = ms(250);
        let slave = ReconnectPolicy::for_endpoint(&config, Role::Slave, threshold);
        let master = ReconnectPolicy::for_endpoint(&config, Role::Master, threshold);
        assert!(slave.gives_up);
        assert!(!master.gives_up);
        assert_eq!(master.stale_threshold, threshold);
        assert_eq!(master.max_attempts, config.max_reconnect_attempts);
    }

    #[test]
    fn test_detached_is_terminal() {
        let (mut monitor, t) = silenced(DisconnectBehavior::Never);
        monitor.detach();
        assert_eq!(monitor.observe(5, t + ms(1)), LivenessEvent::Steady);
        assert_eq!(monitor.reattached(5, t + ms(2)), LivenessEvent::Steady);
        assert_eq!(monitor.state(), LinkState::Detached);
    }
}
