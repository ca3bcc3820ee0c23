use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{RegionError, Result};

/// Spins before the acquire loop starts sleeping between attempts.
const SPIN_LIMIT: u32 = 64;

/// Sleep between acquire attempts once spinning is exhausted.
const BACKOFF: Duration = Duration::from_micros(50);

/// How often (in failed attempts) the holder's liveness is re-checked.
const LIVENESS_CHECK_EVERY: u32 = 32;

/// Pid of the calling process.
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Whether a process with `pid` currently exists.
///
/// `kill(pid, 0)` delivers nothing; it only reports `ESRCH` when the pid is
/// gone. `EPERM` means the process exists but belongs to someone else.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs permission and existence checks only.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(not(unix))]
pub fn process_alive(pid: u32) -> bool {
    pid != 0
}

/// A cross-process lock that lives inside a shared region.
///
/// The lock word holds the owning pid (0 when free). A holder that dies
/// mid-critical-section leaves its pid behind; the next acquirer notices the
/// pid no longer exists and takes the lock over instead of deadlocking.
///
/// The lock is keyed by process, not thread: threads of one process still
/// exclude each other because acquisition only succeeds from the free state.
#[repr(C, align(64))]
#[derive(Debug)]
pub struct RobustLock {
    owner: AtomicU32,
    reclaims: AtomicU32,
}

impl Default for RobustLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RobustLock {
    pub const fn new() -> Self {
        Self {
            owner: AtomicU32::new(0),
            reclaims: AtomicU32::new(0),
        }
    }

    /// Reset the lock to the free state.
    ///
    /// Fails if a live process other than the caller currently holds it.
    pub fn init(&self) -> Result<()> {
        let owner = self.owner.load(Ordering::Acquire);
        if owner != 0 && owner != current_pid() && process_alive(owner) {
            return Err(RegionError::MutexInit(format!(
                "lock is held by live process {owner}"
            )));
        }
        self.owner.store(0, Ordering::Release);
        self.reclaims.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Acquire the lock, waiting at most `timeout`.
    pub fn lock(&self, timeout: Duration) -> Result<LockGuard<'_>> {
        let me = current_pid();
        let deadline = Instant::now() + timeout;
        let mut attempts = 0u32;

        loop {
            match self
                .owner
                .compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return Ok(LockGuard::new(self, me)),
                Err(holder) => {
                    if attempts % LIVENESS_CHECK_EVERY == 0 {
                        if let Some(guard) = self.try_reclaim(holder, me) {
                            return Ok(guard);
                        }
                    }
                    if Instant::now() >= deadline {
                        return Err(RegionError::MutexLock {
                            timeout,
                            owner: holder,
                        });
                    }
                }
            }

            attempts = attempts.wrapping_add(1);
            if attempts < SPIN_LIMIT {
                std::hint::spin_loop();
            } else {
                std::thread::sleep(BACKOFF);
            }
        }
    }

    /// Acquire the lock only if it is free (or held by a dead process).
    pub fn try_lock(&self) -> Option<LockGuard<'_>> {
        let me = current_pid();
        match self
            .owner
            .compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => Some(LockGuard::new(self, me)),
            Err(holder) => self.try_reclaim(holder, me),
        }
    }

    /// Pid currently recorded as the holder.
    pub fn owner(&self) -> Option<u32> {
        match self.owner.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Number of times the lock was taken over from a dead holder.
    pub fn reclaim_count(&self) -> u32 {
        self.reclaims.load(Ordering::Relaxed)
    }

    fn try_reclaim(&self, holder: u32, me: u32) -> Option<LockGuard<'_>> {
        if holder == me || process_alive(holder) {
            return None;
        }
        self.owner
            .compare_exchange(holder, me, Ordering::Acquire, Ordering::Relaxed)
            .ok()?;
        let reclaims = self.reclaims.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(dead_owner = holder, reclaims, "reclaimed lock from dead process");
        Some(LockGuard::new(self, me))
    }

    fn release(&self, pid: u32) -> Result<()> {
        self.owner
            .compare_exchange(pid, 0, Ordering::Release, Ordering::Relaxed)
            .map(|_| ())
            .map_err(|owner| RegionError::MutexUnlock { owner, caller: pid })
    }
}

/// RAII guard for [`RobustLock`]. Releases on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    lock: &'a RobustLock,
    pid: u32,
    released: bool,
}

impl<'a> LockGuard<'a> {
    fn new(lock: &'a RobustLock, pid: u32) -> Self {
        Self {
            lock,
            pid,
            released: false,
        }
    }

    /// Release the lock, reporting if it was stolen while held.
    pub fn unlock(mut self) -> Result<()> {
        self.released = true;
        self.lock.release(self.pid)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(err) = self.lock.release(self.pid) {
                debug!(error = %err, "lock release on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true")
            .spawn()
            .expect("`true` should spawn");
        let pid = child.id();
        child.wait().expect("child should exit");
        pid
    }

    #[test]
    fn test_lock_unlock() {
        let lock = RobustLock::new();
        let guard = lock.lock(Duration::from_millis(100)).unwrap();
        assert_eq!(lock.owner(), Some(current_pid()));
        guard.unlock().unwrap();
        assert_eq!(lock.owner(), None);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let lock = RobustLock::new();
        {
            let _guard = lock.lock(Duration::from_millis(100)).unwrap();
            assert!(lock.try_lock().is_none());
        }
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_lock_times_out_while_held() {
        let lock = RobustLock::new();
        let _guard = lock.lock(Duration::from_millis(100)).unwrap();
        let start = Instant::now();
        let result = lock.lock(Duration::from_millis(30));
        assert!(matches!(result, Err(RegionError::MutexLock { owner, .. }) if owner == current_pid()));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_dead_owner_is_reclaimed() {
        let lock = RobustLock::new();
        let dead = dead_pid();
        assert!(!process_alive(dead));
        lock.owner.store(dead, Ordering::Release);

        let guard = lock.lock(Duration::from_millis(100)).unwrap();
        assert_eq!(lock.owner(), Some(current_pid()));
        assert_eq!(lock.reclaim_count(), 1);
        guard.unlock().unwrap();
    }

    #[test]
    fn test_unlock_after_steal_reports_owner() {
        let lock = RobustLock::new();
        let guard = lock.lock(Duration::from_millis(100)).unwrap();
        lock.owner.store(424_242, Ordering::Release);
        let result = guard.unlock();
        assert!(matches!(
            result,
            Err(RegionError::MutexUnlock { owner: 424_242, .. })
        ));
    }

    #[test]
    fn test_init_refuses_live_foreign_owner() {
        let lock = RobustLock::new();
        // pid 1 always exists.
        lock.owner.store(1, Ordering::Release);
        assert!(matches!(lock.init(), Err(RegionError::MutexInit(_))));

        lock.owner.store(dead_pid(), Ordering::Release);
        lock.init().unwrap();
        assert_eq!(lock.owner(), None);
    }

    #[test]
    fn test_threads_exclude_each_other() {
        use std::sync::Arc;

        let lock = Arc::new(RobustLock::new());
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let _guard = lock.lock(Duration::from_secs(5)).expect("lock");
                        let v = counter.load(Ordering::Relaxed);
                        std::hint::spin_loop();
                        counter.store(v + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker should finish");
        }
        assert_eq!(counter.load(Ordering::Relaxed), 800);
    }
}
