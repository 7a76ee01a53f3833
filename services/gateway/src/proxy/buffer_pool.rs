//! Fixed-capacity pool of I/O buffer pairs.
//!
//! The pool is the gateway's admission control: one slot per concurrently
//! served connection. A connection that cannot get a slot is closed before
//! any backend connection is attempted.
//!
//! Buffers are allocated once when the pool is built and are moved into the
//! lease on acquire and back into the slot on release, so the accept path
//! never allocates.

use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Default per-direction buffer size (one TLS record fits comfortably).
pub const DEFAULT_BUFFER_SIZE: usize = 2048;

/// Default number of slots.
pub const DEFAULT_MAX_CLIENTS: usize = 4;

/// How long `acquire` waits for the pool lock before giving up.
pub const ACQUIRE_LOCK_WAIT: Duration = Duration::from_millis(100);

const LOCK_RETRY: Duration = Duration::from_millis(1);

/// The two I/O buffers lent to one connection.
#[derive(Debug)]
pub struct BufferPair {
    /// Client -> backend direction.
    pub inbound: Box<[u8]>,
    /// Backend -> client direction.
    pub outbound: Box<[u8]>,
}

impl BufferPair {
    fn new(size: usize) -> Self {
        Self {
            inbound: vec![0u8; size].into_boxed_slice(),
            outbound: vec![0u8; size].into_boxed_slice(),
        }
    }
}

#[derive(Debug)]
struct Slot {
    in_use: bool,
    /// `None` while the buffers are lent out.
    buffers: Option<BufferPair>,
}

/// A fixed array of buffer pairs guarded by a mutex.
#[derive(Debug)]
pub struct BufferPool {
    slots: Mutex<Vec<Slot>>,
    buffer_size: usize,
}

impl BufferPool {
    /// Allocate `capacity` buffer pairs of `buffer_size` bytes each.
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                in_use: false,
                buffers: Some(BufferPair::new(buffer_size)),
            })
            .collect();

        info!(
            slots = capacity,
            bytes_per_slot = buffer_size * 2,
            "Buffer pool initialized"
        );

        Self {
            slots: Mutex::new(slots),
            buffer_size,
        }
    }

    /// Number of slots in the pool.
    pub fn capacity(&self) -> usize {
        match self.slots.lock() {
            Ok(slots) => slots.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Size of each buffer in a pair.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of slots currently lent out.
    pub fn in_use(&self) -> usize {
        let slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots.iter().filter(|s| s.in_use).count()
    }

    /// Number of free slots.
    pub fn available(&self) -> usize {
        self.capacity() - self.in_use()
    }

    /// Take the first free slot.
    ///
    /// Returns `None` when every slot is lent out or the pool lock cannot be
    /// taken within [`ACQUIRE_LOCK_WAIT`]; that is the signal to reject the
    /// connection.
    pub async fn acquire(self: &Arc<Self>) -> Option<BufferLease> {
        let deadline = Instant::now() + ACQUIRE_LOCK_WAIT;

        loop {
            // The guard must not live across the retry sleep.
            let retry = match self.slots.try_lock() {
                Ok(mut slots) => {
                    let (index, slot) = slots.iter_mut().enumerate().find(|(_, s)| !s.in_use)?;
                    slot.in_use = true;
                    // A slot only lacks buffers if a lease was leaked without its
                    // buffers; replace them rather than refuse the slot.
                    let buffers = slot
                        .buffers
                        .take()
                        .unwrap_or_else(|| BufferPair::new(self.buffer_size));
                    drop(slots);

                    debug!(slot = index, "Buffer slot acquired");
                    return Some(BufferLease {
                        pool: Arc::clone(self),
                        index,
                        buffers: Some(buffers),
                    });
                }
                Err(TryLockError::Poisoned(_)) => {
                    warn!("Buffer pool lock poisoned");
                    return None;
                }
                Err(TryLockError::WouldBlock) => Instant::now() < deadline,
            };

            if !retry {
                warn!(
                    wait_ms = ACQUIRE_LOCK_WAIT.as_millis() as u64,
                    "Buffer pool lock not acquired in time"
                );
                return None;
            }
            sleep(LOCK_RETRY).await;
        }
    }

    /// Return a slot to the pool. Releasing a free slot is a no-op.
    fn release(&self, index: usize, buffers: Option<BufferPair>) {
        // Release must happen even if another thread panicked while holding
        // the lock, or the slot would be lost for the process lifetime.
        let mut slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };

        let Some(slot) = slots.get_mut(index) else {
            return;
        };
        if !slot.in_use {
            debug!(slot = index, "Release of free buffer slot ignored");
            return;
        }

        slot.in_use = false;
        if buffers.is_some() {
            slot.buffers = buffers;
        }
        debug!(slot = index, "Buffer slot released");
    }
}

/// Exclusive loan of one buffer slot. Dropping the lease releases the slot.
#[derive(Debug)]
pub struct BufferLease {
    pool: Arc<BufferPool>,
    index: usize,
    buffers: Option<BufferPair>,
}

impl BufferLease {
    /// Slot index inside the pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Borrow both buffers mutably at once.
    pub fn split_mut(&mut self) -> (&mut [u8], &mut [u8]) {
        match self.buffers.as_mut() {
            Some(pair) => (&mut pair.inbound[..], &mut pair.outbound[..]),
            None => (&mut [], &mut []),
        }
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        self.pool.release(self.index, self.buffers.take());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    use super::*;

    #[tokio::test]
    async fn test_acquire_until_exhausted() {
        let pool = Arc::new(BufferPool::new(2, 64));
        assert_eq!(pool.capacity(), 2);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_ne!(a.index(), b.index());
        assert_eq!(pool.in_use(), 2);

        // The (MAX + 1)-th request is refused.
        assert!(pool.acquire().await.is_none());

        drop(a);
        assert_eq!(pool.available(), 1);
        let c = pool.acquire().await.unwrap();
        assert_eq!(pool.in_use(), 2);
        drop(b);
        drop(c);
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_lease_buffers_sized() {
        let pool = Arc::new(BufferPool::new(1, 128));
        let mut lease = pool.acquire().await.unwrap();
        let (inbound, outbound) = lease.split_mut();
        assert_eq!(inbound.len(), 128);
        assert_eq!(outbound.len(), 128);
        inbound[0] = 0xAB;
        drop(lease);

        // The same buffers come back on the next loan.
        let mut lease = pool.acquire().await.unwrap();
        assert_eq!(lease.split_mut().0[0], 0xAB);
    }

    #[tokio::test]
    async fn test_double_release_is_noop() {
        let pool = Arc::new(BufferPool::new(2, 32));
        let lease = pool.acquire().await.unwrap();
        let index = lease.index();
        drop(lease);

        pool.release(index, None);
        pool.release(index, None);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.available(), 2);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert!(pool.acquire().await.is_none());
        assert_eq!(pool.in_use(), 2);

        // Buffers were not lost by the spurious releases.
        let mut a = a;
        assert_eq!(a.split_mut().0.len(), 32);
        drop(b);
    }

    #[test]
    fn test_out_of_range_release_ignored() {
        let pool = Arc::new(BufferPool::new(1, 16));
        pool.release(7, None);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_never_exceeds_capacity() {
        let pool = Arc::new(BufferPool::new(3, 16));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    for _ in 0..200 {
                        if let Some(lease) = pool.acquire().await {
                            peak.fetch_max(pool.in_use(), Ordering::Relaxed);
                            tokio::task::yield_now().await;
                            drop(lease);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::Relaxed) <= 3);
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_acquire_gives_up_while_lock_is_held() {
        let pool = Arc::new(BufferPool::new(2, 32));
        let (held_tx, held_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let holder = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                let _slots = pool.slots.lock().unwrap();
                held_tx.send(()).unwrap();
                let _ = done_rx.recv_timeout(Duration::from_secs(5));
            })
        };
        held_rx.recv().unwrap();

        let started = std::time::Instant::now();
        assert!(pool.acquire().await.is_none());
        let waited = started.elapsed();
        assert!(waited >= ACQUIRE_LOCK_WAIT);
        assert!(waited < Duration::from_secs(1), "waited {waited:?}");

        done_tx.send(()).unwrap();
        holder.join().unwrap();

        // Nothing was taken by the failed attempt.
        assert_eq!(pool.available(), 2);
        assert!(pool.acquire().await.is_some());
    }
}
