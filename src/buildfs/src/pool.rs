use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use crate::guid::Guid;

/// Per-chunk lifecycle within the pool.
///
/// `Downloading` and `Reading` are transitional: exactly one thread owns
/// the transition while everyone else waits on the entry's condvar.
#[derive(Debug, Clone)]
pub enum ChunkState {
    /// Not on disk; must be fetched.
    Unavailable,
    Downloading,
    /// On disk; must be loaded.
    Available,
    Reading,
    /// Decompressed bytes resident in memory.
    Readable(Arc<Vec<u8>>),
}

impl ChunkState {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, ChunkState::Downloading | ChunkState::Reading)
    }
}

#[derive(Debug)]
pub struct PoolEntry {
    pub state: Mutex<ChunkState>,
    pub ready: Condvar,
}

impl PoolEntry {
    fn new(state: ChunkState) -> Self {
        Self {
            state: Mutex::new(state),
            ready: Condvar::new(),
        }
    }

    /// Publishes a new state and wakes every waiter.
    pub fn publish(&self, state: ChunkState) {
        *self.state.lock().unwrap() = state;
        self.ready.notify_all();
    }
}

struct PoolInner {
    order: VecDeque<Guid>,
    entries: HashMap<Guid, Arc<PoolEntry>>,
}

/// Bounded pool of hot chunks, FIFO by insertion with promotion on hit.
///
/// Entries are `Arc`ed: a waiter holds its own reference, so eviction can
/// never free a buffer out from under it. The pool lock only covers
/// metadata; chunk I/O happens against the entry with the pool unlocked.
pub struct ChunkPool {
    capacity: usize,
    inner: Mutex<PoolInner>,
}

impl ChunkPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(PoolInner {
                order: VecDeque::with_capacity(capacity),
                entries: HashMap::with_capacity(capacity),
            }),
        }
    }

    /// Looks up a resident entry, promoting it to most-recently-used.
    pub fn get(&self, guid: Guid) -> Option<Arc<PoolEntry>> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entries.get(&guid)?.clone();
        if let Some(pos) = inner.order.iter().position(|g| *g == guid) {
            inner.order.remove(pos);
            inner.order.push_back(guid);
        }
        Some(entry)
    }

    /// Inserts an entry with `initial` state, evicting the oldest idle
    /// entry if the pool is full. If another thread inserted the same guid
    /// meanwhile, that entry wins and is returned instead.
    pub fn insert(&self, guid: Guid, initial: ChunkState) -> Arc<PoolEntry> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.entries.get(&guid) {
            return existing.clone();
        }

        if inner.entries.len() >= self.capacity {
            Self::evict_one(&mut inner);
        }

        let entry = Arc::new(PoolEntry::new(initial));
        inner.entries.insert(guid, entry.clone());
        inner.order.push_back(guid);
        entry
    }

    /// Drops an entry regardless of position, e.g. after its on-disk copy
    /// was replaced.
    pub fn remove(&self, guid: Guid) {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.remove(&guid).is_some() {
            if let Some(pos) = inner.order.iter().position(|g| *g == guid) {
                inner.order.remove(pos);
            }
        }
    }

    pub fn resident(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    // Oldest-first scan for an entry that is not mid-transition. In-flight
    // entries are skipped; if every resident entry is in flight the pool
    // briefly exceeds capacity by one instead of blocking the caller.
    fn evict_one(inner: &mut PoolInner) {
        let PoolInner { order, entries } = inner;
        let victim = order.iter().copied().position(|guid| match entries.get(&guid) {
            Some(entry) => match entry.state.try_lock() {
                Ok(state) => !state.is_in_flight(),
                Err(_) => false,
            },
            None => true,
        });
        if let Some(pos) = victim {
            if let Some(guid) = order.remove(pos) {
                entries.remove(&guid);
            }
        }
    }
}
