use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::PoolKey;

// Queue mutations never leave a bucket half-updated, so a poisoned lock is
// still safe to use.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An idle physical connection and the number of sweeps it has seen at the
/// head of its bucket.
#[derive(Debug)]
pub(crate) struct PooledHandle<C> {
    pub(crate) conn: C,
    pub(crate) visits: u32,
}

/// FIFO of idle connections for one key.
#[derive(Debug)]
pub(crate) struct PoolBucket<C> {
    queue: Mutex<VecDeque<PooledHandle<C>>>,
}

impl<C> Default for PoolBucket<C> {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }
}

impl<C> PoolBucket<C> {
    /// Dequeue the head; the next handle inherits its visit count.
    pub(crate) fn take_head(&self) -> Option<C> {
        let mut queue = lock(&self.queue);
        let head = queue.pop_front()?;
        if let Some(next) = queue.front_mut() {
            next.visits = head.visits;
        }
        Some(head.conn)
    }

    /// Enqueue with a fresh visit count, or hand the connection back when full.
    pub(crate) fn offer(&self, conn: C, max_idle: usize) -> Result<(), C> {
        let mut queue = lock(&self.queue);
        if queue.len() >= max_idle {
            return Err(conn);
        }
        queue.push_back(PooledHandle { conn, visits: 0 });
        Ok(())
    }

    /// Count a visit on the head; once it passes `threshold`, remove
    /// `len / 2 + 1` handles from the front and return them for closing.
    pub(crate) fn sweep(&self, threshold: u32) -> Vec<C> {
        let mut queue = lock(&self.queue);
        let Some(head) = queue.front_mut() else {
            return Vec::new();
        };
        head.visits += 1;
        if head.visits <= threshold {
            return Vec::new();
        }
        let evict = queue.len() / 2 + 1;
        queue.drain(..evict).map(|handle| handle.conn).collect()
    }

    pub(crate) fn drain(&self) -> Vec<C> {
        lock(&self.queue).drain(..).map(|handle| handle.conn).collect()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.queue).len()
    }

    #[cfg(test)]
    pub(crate) fn head_visits(&self) -> Option<u32> {
        lock(&self.queue).front().map(|handle| handle.visits)
    }
}

/// Key → bucket map. Its lock only guards map lookups and inserts.
#[derive(Debug)]
pub(crate) struct PoolRegistry<C> {
    buckets: Mutex<HashMap<PoolKey, Arc<PoolBucket<C>>>>,
}

impl<C> Default for PoolRegistry<C> {
    fn default() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }
}

impl<C> PoolRegistry<C> {
    pub(crate) fn bucket_or_insert(&self, key: &PoolKey) -> Arc<PoolBucket<C>> {
        let mut buckets = lock(&self.buckets);
        Arc::clone(buckets.entry(key.clone()).or_default())
    }

    pub(crate) fn bucket(&self, key: &PoolKey) -> Option<Arc<PoolBucket<C>>> {
        lock(&self.buckets).get(key).cloned()
    }

    pub(crate) fn snapshot(&self) -> Vec<(PoolKey, Arc<PoolBucket<C>>)> {
        lock(&self.buckets)
            .iter()
            .map(|(key, bucket)| (key.clone(), Arc::clone(bucket)))
            .collect()
    }
}
