use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, warn};

/// Assigns a capacity cost to a queued item.
pub trait CostAssigner<T>: Send + Sync {
    fn cost(&self, item: &T) -> usize;
}

/// Costs a text record by its UTF-8 byte length.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteLength;

impl<T: AsRef<str>> CostAssigner<T> for ByteLength {
    fn cost(&self, item: &T) -> usize {
        item.as_ref().len()
    }
}

/// Outcome of a single `enqueue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Record queued after evicting `evicted` older records.
    Accepted { evicted: usize },
    /// Record alone exceeds the capacity and was dropped.
    Rejected { cost: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub len: usize,
    pub cost_used: usize,
    pub capacity: usize,
    /// Records evicted since creation.
    pub evicted: u64,
    /// Oversized records dropped since creation.
    pub rejected: u64,
}

/// Unsynchronised queue state. Every entry carries the cost it was admitted
/// with, so `cost_used` always equals the sum over `entries`.
struct QueueState<T> {
    entries: VecDeque<(T, usize)>,
    cost_used: usize,
    capacity: usize,
    evicted: u64,
    rejected: u64,
}

impl<T> QueueState<T> {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            cost_used: 0,
            capacity,
            evicted: 0,
            rejected: 0,
        }
    }

    /// Remove the oldest entry. Returns the cost freed.
    fn evict_oldest(&mut self) -> Option<usize> {
        let (_, cost) = self.entries.pop_front()?;
        self.cost_used -= cost;
        self.evicted += 1;
        Some(cost)
    }

    /// Evict oldest entries until `cost_used + headroom <= capacity`.
    /// Returns `(records, bytes)` evicted.
    fn make_room(&mut self, headroom: usize) -> (usize, usize) {
        let mut count = 0;
        let mut bytes = 0;
        while self.cost_used + headroom > self.capacity {
            match self.evict_oldest() {
                Some(freed) => {
                    count += 1;
                    bytes += freed;
                }
                None => break,
            }
        }
        (count, bytes)
    }

    fn push(&mut self, item: T, cost: usize) -> Admission {
        if cost > self.capacity {
            self.rejected += 1;
            return Admission::Rejected { cost };
        }
        let (evicted, _) = self.make_room(cost);
        self.entries.push_back((item, cost));
        self.cost_used += cost;
        Admission::Accepted { evicted }
    }

    fn drain(&mut self, max: usize) -> Vec<T> {
        let n = max.min(self.entries.len());
        let mut out = Vec::with_capacity(n);
        for (item, cost) in self.entries.drain(..n) {
            self.cost_used -= cost;
            out.push(item);
        }
        out
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            len: self.entries.len(),
            cost_used: self.cost_used,
            capacity: self.capacity,
            evicted: self.evicted,
            rejected: self.rejected,
        }
    }
}

struct Shared<T, C> {
    state: Mutex<QueueState<T>>,
    cost: C,
}

/// Cost-bounded FIFO shared between producers and the flusher.
///
/// Uses `std::sync::Mutex` because no operation holds the lock across an
/// `.await` or any I/O; each call is a handful of `VecDeque` operations.
/// When full, the oldest records are evicted to make room for new ones.
pub struct EvictingQueue<T = String, C = ByteLength> {
    shared: Arc<Shared<T, C>>,
}

impl<T, C> Clone for EvictingQueue<T, C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> EvictingQueue<T, ByteLength>
where
    T: AsRef<str>,
{
    pub fn new(capacity: usize) -> Self {
        Self::with_cost_assigner(capacity, ByteLength)
    }
}

impl<T, C: CostAssigner<T>> EvictingQueue<T, C> {
    pub fn with_cost_assigner(capacity: usize, cost: C) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::new(capacity)),
                cost,
            }),
        }
    }

    /// A poisoned lock only means another thread panicked mid-call; the
    /// state is still consistent between operations, so keep going.
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a record, evicting the oldest records if it would not fit.
    /// Never blocks on anything but the queue lock.
    pub fn enqueue(&self, item: T) -> Admission {
        let cost = self.shared.cost.cost(&item);
        let admission = self.lock().push(item, cost);
        match admission {
            Admission::Rejected { cost } => {
                warn!(cost, "dropping record larger than queue capacity");
            }
            Admission::Accepted { evicted } if evicted > 0 => {
                debug!(evicted, "evicted oldest records to admit new record");
            }
            Admission::Accepted { .. } => {}
        }
        admission
    }

    /// Remove up to `max` of the oldest records, in FIFO order.
    pub fn drain(&self, max: usize) -> Vec<T> {
        self.lock().drain(max)
    }

    /// Change the capacity, evicting oldest records if the queue no longer fits.
    pub fn set_capacity(&self, capacity: usize) {
        let (count, bytes) = {
            let mut state = self.lock();
            state.capacity = capacity;
            state.make_room(0)
        };
        if count > 0 {
            warn!(count, bytes, capacity, "evicted records after shrinking queue");
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn cost_used(&self) -> usize {
        self.lock().cost_used
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    pub fn stats(&self) -> QueueStats {
        self.lock().stats()
    }

    /// A handle that does not keep the queue alive.
    pub fn downgrade(&self) -> WeakQueue<T, C> {
        WeakQueue {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

/// Non-owning access to an [`EvictingQueue`].
pub struct WeakQueue<T = String, C = ByteLength> {
    shared: Weak<Shared<T, C>>,
}

impl<T, C> Clone for WeakQueue<T, C> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
        }
    }
}

impl<T, C> WeakQueue<T, C> {
    /// `None` once every owning handle has been dropped.
    pub fn upgrade(&self) -> Option<EvictingQueue<T, C>> {
        self.shared.upgrade().map(|shared| EvictingQueue { shared })
    }
}
