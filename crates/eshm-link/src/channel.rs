use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use eshm_region::RobustLock;

use crate::error::{EshmError, Result};
use crate::layout::{ChannelSlot, SLOT_CAPACITY};

/// Sleep between polls while a blocking read waits for a new write.
pub const POLL_INTERVAL: Duration = Duration::from_micros(100);

/// One direction of the region: a single-slot mailbox.
///
/// A write replaces the slot contents and bumps `write_count`; a read copies
/// the slot out and sets `read_count = write_count`. Whatever the reader did
/// not pick up before the next write is gone.
pub struct Channel<'a> {
    slot: &'a ChannelSlot,
    lock: &'a RobustLock,
    lock_timeout: Duration,
}

impl<'a> Channel<'a> {
    pub fn new(slot: &'a ChannelSlot, lock: &'a RobustLock, lock_timeout: Duration) -> Self {
        Self {
            slot,
            lock,
            lock_timeout,
        }
    }

    /// Store `payload` in the slot, replacing any unread message.
    pub fn write(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > SLOT_CAPACITY {
            return Err(EshmError::BufferFull {
                size: payload.len(),
                capacity: SLOT_CAPACITY,
            });
        }

        let guard = self.lock.lock(self.lock_timeout)?;
        // SAFETY: the region lock is held, so no other writer or reader is
        // touching `data`; the length was checked against the slot above.
        unsafe {
            let data = &mut *self.slot.data.get();
            data[..payload.len()].copy_from_slice(payload);
        }
        self.slot.len.store(payload.len() as u32, Ordering::Release);
        self.slot.write_count.fetch_add(1, Ordering::AcqRel);
        guard.unlock()?;
        Ok(())
    }

    /// Whether a write is waiting to be read.
    pub fn pending(&self) -> bool {
        let (write, read) = self.counts();
        write != read
    }

    /// `(write_count, read_count)`.
    pub fn counts(&self) -> (u64, u64) {
        (self.slot.write_count(), self.slot.read_count())
    }

    /// Copy the pending message into `buf` and mark it read.
    ///
    /// Returns the payload length, which may be zero. A buffer that is too
    /// small leaves the message pending.
    pub fn try_read_into(&self, buf: &mut [u8]) -> Result<usize> {
        if !self.pending() {
            return Err(EshmError::NoData);
        }

        let guard = self.lock.lock(self.lock_timeout)?;
        let write = self.slot.write_count();
        if write == self.slot.read_count() {
            return Err(EshmError::NoData);
        }
        let len = self.stored_len();
        if len > buf.len() {
            return Err(EshmError::BufferTooSmall {
                needed: len,
                available: buf.len(),
            });
        }
        // SAFETY: the region lock is held and `len` is bounded by the slot.
        unsafe {
            let data = &*self.slot.data.get();
            buf[..len].copy_from_slice(&data[..len]);
        }
        self.slot.read_count.store(write, Ordering::Release);
        guard.unlock()?;
        Ok(len)
    }

    /// Take the pending message as an owned buffer.
    pub fn try_read(&self) -> Result<Bytes> {
        if !self.pending() {
            return Err(EshmError::NoData);
        }

        let guard = self.lock.lock(self.lock_timeout)?;
        let write = self.slot.write_count();
        if write == self.slot.read_count() {
            return Err(EshmError::NoData);
        }
        let len = self.stored_len();
        // SAFETY: the region lock is held and `len` is bounded by the slot.
        let payload = unsafe {
            let data = &*self.slot.data.get();
            Bytes::copy_from_slice(&data[..len])
        };
        self.slot.read_count.store(write, Ordering::Release);
        guard.unlock()?;
        Ok(payload)
    }

    fn stored_len(&self) -> usize {
        (self.slot.len.load(Ordering::Acquire) as usize).min(SLOT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::RegionLayout;

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn zeroed_layout() -> Box<RegionLayout> {
        // SAFETY: all-zero bytes are valid for every field of the layout.
        unsafe { Box::<RegionLayout>::new_zeroed().assume_init() }
    }

    fn channel(layout: &RegionLayout) -> Channel<'_> {
        Channel::new(&layout.master_to_slave, &layout.header.lock, TIMEOUT)
    }

    #[test]
    fn test_write_then_read() {
        let layout = zeroed_layout();
        let ch = channel(&layout);
        ch.write(b"hello").unwrap();
        assert!(ch.pending());
        assert_eq!(ch.try_read().unwrap().as_ref(), b"hello");
        assert!(!ch.pending());
        assert_eq!(ch.counts(), (1, 1));
    }

    #[test]
    fn test_second_write_overwrites_unread() {
        let layout = zeroed_layout();
        let ch = channel(&layout);
        ch.write(b"first").unwrap();
        ch.write(b"second").unwrap();
        assert_eq!(ch.counts(), (2, 0));

        assert_eq!(ch.try_read().unwrap().as_ref(), b"second");
        assert_eq!(ch.counts(), (2, 2));
        assert!(matches!(ch.try_read(), Err(EshmError::NoData)));
    }

    #[test]
    fn test_empty_read_is_no_data() {
        let layout = zeroed_layout();
        let ch = channel(&layout);
        let mut buf = [0u8; 8];
        assert!(matches!(ch.try_read_into(&mut buf), Err(EshmError::NoData)));
        assert!(matches!(ch.try_read(), Err(EshmError::NoData)));
    }

    #[test]
    fn test_zero_length_payload_is_an_event() {
        let layout = zeroed_layout();
        let ch = channel(&layout);
        ch.write(&[]).unwrap();
        let mut buf = [0u8; 0];
        assert_eq!(ch.try_read_into(&mut buf).unwrap(), 0);
        assert_eq!(ch.counts(), (1, 1));
    }

    #[test]
    fn test_oversized_write_is_buffer_full() {
        let layout = zeroed_layout();
        let ch = channel(&layout);
        let big = vec![7u8; SLOT_CAPACITY + 1];
        assert!(matches!(
            ch.write(&big),
            Err(EshmError::BufferFull { size, capacity: SLOT_CAPACITY }) if size == SLOT_CAPACITY + 1
        ));
        assert_eq!(ch.counts(), (0, 0));

        ch.write(&big[..SLOT_CAPACITY]).unwrap();
        assert_eq!(ch.try_read().unwrap().len(), SLOT_CAPACITY);
    }

    #[test]
    fn test_small_buffer_leaves_message_pending() {
        let layout = zeroed_layout();
        let ch = channel(&layout);
        ch.write(b"0123456789").unwrap();

        let mut small = [0u8; 4];
        assert!(matches!(
            ch.try_read_into(&mut small),
            Err(EshmError::BufferTooSmall { needed: 10, available: 4 })
        ));
        assert!(ch.pending());

        let mut buf = [0u8; 16];
        let n = ch.try_read_into(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"0123456789");
    }

    #[test]
    fn test_directions_are_independent() {
        let layout = zeroed_layout();
        let down = Channel::new(&layout.master_to_slave, &layout.header.lock, TIMEOUT);
        let up = Channel::new(&layout.slave_to_master, &layout.header.lock, TIMEOUT);
        down.write(b"down").unwrap();
        assert!(matches!(up.try_read(), Err(EshmError::NoData)));
        up.write(b"up").unwrap();
        assert_eq!(down.try_read().unwrap().as_ref(), b"down");
        assert_eq!(up.try_read().unwrap().as_ref(), b"up");
    }
}
