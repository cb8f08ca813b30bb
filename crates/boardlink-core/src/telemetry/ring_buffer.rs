/*!
 * Lock-free circular sample store.
 *
 * One or more producers push without blocking; readers take consistent
 * snapshots or consume undrained samples in sequence order.
 */
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;

/// Smallest capacity a ring buffer is created with
pub const MIN_CAPACITY: usize = 2000;

/// A stored sample tagged with the sequence number it was written under.
///
/// Slots are immutable once published; overwriting swaps in a new `Arc`, so a
/// reader holding the old one can never observe a half-written sample.
struct Slot<T> {
    seq: u64,
    value: T,
}

/// Fixed-capacity circular store with a lock-free producer path.
///
/// Capacity is the requested size rounded up to the next power of two and
/// never less than [`MIN_CAPACITY`]. When full, `push` overwrites the oldest
/// sample and counts it as dropped if it had not been drained yet.
///
/// Readers (`snapshot`, `drain`) copy `Arc`s out of the slots and never block
/// the producer. A single producer never waits; concurrent producers publish
/// in reservation order.
pub struct RingBuffer<T> {
    slots: Box<[ArcSwapOption<Slot<T>>]>,
    mask: u64,
    capacity: u64,
    // next sequence handed out to a producer
    reserved: AtomicU64,
    // every sequence below this one is visible to readers
    published: AtomicU64,
    // drain cursor
    read: AtomicU64,
    dropped: AtomicU64,
}

impl<T> RingBuffer<T> {
    /// Create a ring buffer holding at least `requested` samples
    pub fn new(requested: usize) -> Self {
        let capacity = requested.max(MIN_CAPACITY).next_power_of_two();
        let slots = (0..capacity)
            .map(|_| ArcSwapOption::empty())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            mask: capacity as u64 - 1,
            capacity: capacity as u64,
            reserved: AtomicU64::new(0),
            published: AtomicU64::new(0),
            read: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Number of samples the buffer retains
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Append a sample, overwriting the oldest one when full
    pub fn push(&self, value: T) {
        let seq = self.reserved.fetch_add(1, Ordering::AcqRel);

        if seq >= self.capacity {
            let evicted = seq - self.capacity;
            if self.read.load(Ordering::Acquire) <= evicted {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }

        let fresh = Arc::new(Slot { seq, value });
        let slot = &self.slots[(seq & self.mask) as usize];
        // A slower producer must not clobber a newer lap
        slot.rcu(|current| match current {
            Some(existing) if existing.seq > seq => Some(Arc::clone(existing)),
            _ => Some(Arc::clone(&fresh)),
        });

        while self
            .published
            .compare_exchange_weak(seq, seq + 1, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    /// Total number of samples ever pushed
    pub fn total_pushed(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }

    /// Number of samples currently retained
    pub fn len(&self) -> usize {
        self.total_pushed().min(self.capacity) as usize
    }

    /// Whether nothing has been pushed yet
    pub fn is_empty(&self) -> bool {
        self.total_pushed() == 0
    }

    /// Retained samples not yet consumed by [`drain`](Self::drain)
    pub fn pending(&self) -> usize {
        let head = self.total_pushed();
        let start = self
            .read
            .load(Ordering::Acquire)
            .max(head.saturating_sub(self.capacity));
        head.saturating_sub(start) as usize
    }

    /// Samples overwritten before they were drained
    ///
    /// Overflow alone does not count: evicting a sample that
    /// [`drain`](Self::drain) already consumed loses nothing, so with a
    /// consumer that keeps up this stays at zero while
    /// [`total_pushed`](Self::total_pushed) grows past the capacity.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Consistent copy of every retained sample, oldest first
    pub fn snapshot(&self) -> Snapshot<T> {
        let head = self.total_pushed();
        self.collect(head.saturating_sub(self.capacity), head)
    }

    /// Consume up to `max` of the oldest undrained samples
    pub fn drain(&self, max: usize) -> Snapshot<T> {
        loop {
            let read = self.read.load(Ordering::Acquire);
            let head = self.total_pushed();
            let start = read.max(head.saturating_sub(self.capacity));
            let end = head.min(start.saturating_add(max as u64));

            if self
                .read
                .compare_exchange(read, end, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return self.collect(start, end);
            }
        }
    }

    fn collect(&self, start: u64, end: u64) -> Snapshot<T> {
        let mut entries = Vec::with_capacity(end.saturating_sub(start) as usize);
        for seq in start..end {
            if let Some(slot) = self.slots[(seq & self.mask) as usize].load_full() {
                // A lapped slot belongs to a newer sequence; skip it
                if slot.seq == seq {
                    entries.push(slot);
                }
            }
        }
        Snapshot { entries }
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Fixed-stride downsampling of the current contents
    pub fn decimate(&self, target: usize) -> Vec<T> {
        self.snapshot().decimate(target)
    }
}

impl<T> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("pending", &self.pending())
            .field("dropped", &self.dropped_count())
            .finish()
    }
}

/// An immutable, chronologically ordered copy of ring-buffer contents
pub struct Snapshot<T> {
    entries: Vec<Arc<Slot<T>>>,
}

impl<T> Snapshot<T> {
    /// Number of samples in the snapshot
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot holds no samples
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lazily iterate the samples, oldest first
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            inner: self.entries.iter(),
        }
    }

    /// Sequence number of the oldest sample
    pub fn first_sequence(&self) -> Option<u64> {
        self.entries.first().map(|slot| slot.seq)
    }

    /// Sequence number of the newest sample
    pub fn last_sequence(&self) -> Option<u64> {
        self.entries.last().map(|slot| slot.seq)
    }

    fn stride_indices(len: usize, target: usize) -> impl Iterator<Item = usize> {
        let (len, target) = (len as u64, target as u64);
        (0..target).map(move |i| (i * len / target) as usize)
    }
}

impl<T: Clone> Snapshot<T> {
    /// Clone the samples into a vector
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }

    /// Keep `target` samples at a fixed stride, always including the oldest
    ///
    /// Returns everything when the snapshot is already small enough.
    pub fn decimate(&self, target: usize) -> Vec<T> {
        if self.len() <= target {
            return self.to_vec();
        }
        Self::stride_indices(self.len(), target)
            .map(|i| self.entries[i].value.clone())
            .collect()
    }

    /// Min/max-preserving bucketing
    ///
    /// Splits the snapshot into `target / 2` buckets and keeps the minimum and
    /// maximum of each (by `key`), in chronological order, so spikes survive
    /// downsampling. Samples without a key are only kept when a bucket has no
    /// keyed sample at all.
    pub fn decimate_min_max<F>(&self, target: usize, key: F) -> Vec<T>
    where
        F: Fn(&T) -> Option<f64>,
    {
        if self.len() <= target {
            return self.to_vec();
        }
        if target < 2 {
            return self.decimate(target);
        }

        let len = self.len();
        let buckets = target / 2;
        let mut out = Vec::with_capacity(buckets * 2);

        for bucket in 0..buckets {
            let lo = bucket * len / buckets;
            let hi = ((bucket + 1) * len / buckets).min(len);
            if lo >= hi {
                continue;
            }

            let mut min: Option<(usize, f64)> = None;
            let mut max: Option<(usize, f64)> = None;
            for i in lo..hi {
                if let Some(k) = key(&self.entries[i].value) {
                    if min.map_or(true, |(_, m)| k < m) {
                        min = Some((i, k));
                    }
                    if max.map_or(true, |(_, m)| k > m) {
                        max = Some((i, k));
                    }
                }
            }

            match (min, max) {
                (Some((at_min, _)), Some((at_max, _))) if at_min == at_max => {
                    out.push(self.entries[at_min].value.clone())
                }
                (Some((at_min, _)), Some((at_max, _))) => {
                    let (first, second) = (at_min.min(at_max), at_min.max(at_max));
                    out.push(self.entries[first].value.clone());
                    out.push(self.entries[second].value.clone());
                }
                _ => out.push(self.entries[lo].value.clone()),
            }
        }

        out
    }
}

impl<T> fmt::Debug for Snapshot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("len", &self.len())
            .field("first_sequence", &self.first_sequence())
            .finish()
    }
}

/// Borrowing iterator over a [`Snapshot`]
pub struct Iter<'a, T> {
    inner: std::slice::Iter<'a, Arc<Slot<T>>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|slot| &slot.value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<'a, T> DoubleEndedIterator for Iter<'a, T> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back().map(|slot| &slot.value)
    }
}

impl<'a, T> ExactSizeIterator for Iter<'a, T> {}

impl<'a, T> IntoIterator for &'a Snapshot<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
