//! Generic acquire/reset pool
//!
//! Items move between two concurrent queues: *available* and *acquired*.
//! `acquire` takes from available or creates a new item, so a pool grows to
//! the high-water mark of a frame and stays there. `reset` hands every
//! acquired item back. Items are destroyed when the pool is drained, or on
//! reset when the factory reports them unfit for reuse.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::queue::SegQueue;

use crate::render::RenderResult;

/// Creates, recycles and destroys the items of a [`ResourcePool`]
pub trait PoolItemFactory<T>: Send + Sync {
    /// Create a new item; fails only on device exhaustion
    fn create(&self) -> RenderResult<T>;

    /// Prepare an acquired item for reuse
    fn recycle(&self, _item: &T) -> RenderResult<()> {
        Ok(())
    }

    /// Whether a returned item may go back to available; otherwise it is destroyed
    fn reusable(&self, _item: &T) -> bool {
        true
    }

    /// Release an item for good
    fn destroy(&self, item: T);
}

/// Lazily grown pool of device objects
pub struct ResourcePool<T: Send, F: PoolItemFactory<T>> {
    label: &'static str,
    factory: F,
    available: SegQueue<T>,
    acquired: SegQueue<T>,
    owned: AtomicUsize,
}

impl<T: Send, F: PoolItemFactory<T>> ResourcePool<T, F> {
    /// Create an empty pool; `label` names the item kind in logs
    pub fn new(label: &'static str, factory: F) -> Self {
        Self {
            label,
            factory,
            available: SegQueue::new(),
            acquired: SegQueue::new(),
            owned: AtomicUsize::new(0),
        }
    }

    /// Take an available item, creating one if none is left
    pub fn acquire(&self) -> RenderResult<T>
    where
        T: Clone,
    {
        let item = match self.available.pop() {
            Some(item) => item,
            None => {
                let item = self.factory.create()?;
                let owned = self.owned.fetch_add(1, Ordering::Relaxed) + 1;
                log::trace!("{} pool grew to {owned} items", self.label);
                item
            }
        };
        self.acquired.push(item.clone());
        Ok(item)
    }

    /// Return every acquired item to available; returns how many moved
    ///
    /// No GPU work may still use an acquired item. Items the factory marks
    /// unfit are destroyed instead. If recycling an item fails it stays
    /// acquired and the error is returned.
    pub fn reset(&self) -> RenderResult<usize> {
        let mut returned = 0;
        let mut retired = 0;
        while let Some(item) = self.acquired.pop() {
            if !self.factory.reusable(&item) {
                self.factory.destroy(item);
                retired += 1;
                continue;
            }
            if let Err(err) = self.factory.recycle(&item) {
                log::error!("Failed to recycle {} pool item: {err}", self.label);
                self.acquired.push(item);
                return Err(err);
            }
            self.available.push(item);
            returned += 1;
        }
        if retired > 0 {
            self.owned.fetch_sub(retired, Ordering::Relaxed);
            log::trace!("{} pool reset destroyed {retired} items unfit for reuse", self.label);
        }
        if returned > 0 {
            log::trace!("{} pool reset returned {returned} items", self.label);
        }
        Ok(returned)
    }

    /// Discard every item without destroying it
    ///
    /// For items whose storage was already reclaimed in bulk, such as
    /// descriptor sets after their pool was reset.
    pub fn forget_all(&self) -> usize {
        let mut forgotten = 0;
        while self.acquired.pop().is_some() || self.available.pop().is_some() {
            forgotten += 1;
        }
        self.owned.fetch_sub(forgotten, Ordering::Relaxed);
        forgotten
    }

    /// Destroy every item the pool owns; returns how many were destroyed
    pub fn drain(&self) -> usize {
        let mut destroyed = 0;
        while let Some(item) = self.acquired.pop().or_else(|| self.available.pop()) {
            self.factory.destroy(item);
            destroyed += 1;
        }
        self.owned.fetch_sub(destroyed, Ordering::Relaxed);
        destroyed
    }

    /// Items currently owned by the pool, acquired or not
    pub fn len(&self) -> usize {
        self.owned.load(Ordering::Relaxed)
    }

    /// Whether the pool owns no items
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items ready to be acquired
    pub fn available_len(&self) -> usize {
        self.available.len()
    }

    /// Items on loan until the next reset
    pub fn acquired_len(&self) -> usize {
        self.acquired.len()
    }

    /// The factory backing this pool
    pub const fn factory(&self) -> &F {
        &self.factory
    }
}

impl<T: Send, F: PoolItemFactory<T>> Drop for ResourcePool<T, F> {
    fn drop(&mut self) {
        let destroyed = self.drain();
        if destroyed > 0 {
            log::debug!("Destroyed {destroyed} {} pool items", self.label);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::RenderError;
    use ash::vk;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[derive(Default)]
    struct Counter {
        next: AtomicU32,
        destroyed: Arc<AtomicUsize>,
        recycled: AtomicUsize,
    }

    impl PoolItemFactory<u32> for Counter {
        fn create(&self) -> RenderResult<u32> {
            Ok(self.next.fetch_add(1, Ordering::SeqCst))
        }

        fn recycle(&self, _item: &u32) -> RenderResult<()> {
            self.recycled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn destroy(&self, _item: u32) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Exhausted;

    impl PoolItemFactory<u32> for Exhausted {
        fn create(&self) -> RenderResult<u32> {
            Err(RenderError::from_vk(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY, "counter"))
        }

        fn destroy(&self, _item: u32) {}
    }

    #[test]
    fn test_acquire_grows_then_reuses() {
        let pool = ResourcePool::new("counter", Counter::default());
        let first: HashSet<u32> = (0..3).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(first.len(), 3);
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.acquired_len(), 3);

        assert_eq!(pool.reset().unwrap(), 3);
        assert_eq!(pool.available_len(), 3);
        assert_eq!(pool.factory().recycled.load(Ordering::SeqCst), 3);

        let second: HashSet<u32> = (0..3).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(first, second);
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_conservation_across_frames() {
        let pool = ResourcePool::new("counter", Counter::default());
        for frame in 0..10usize {
            for _ in 0..(frame % 4) {
                pool.acquire().unwrap();
            }
            assert_eq!(pool.available_len() + pool.acquired_len(), pool.len());
            pool.reset().unwrap();
        }
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_no_item_is_handed_out_twice_before_reset() {
        let pool = ResourcePool::new("counter", Counter::default());
        pool.acquire().unwrap();
        pool.reset().unwrap();
        let items: Vec<u32> = (0..5).map(|_| pool.acquire().unwrap()).collect();
        let unique: HashSet<u32> = items.iter().copied().collect();
        assert_eq!(unique.len(), items.len());
    }

    #[test]
    fn test_concurrent_acquire_yields_distinct_items() {
        let pool = ResourcePool::new("counter", Counter::default());
        for _ in 0..8 {
            pool.acquire().unwrap();
        }
        pool.reset().unwrap();

        let acquired: Vec<u32> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| (0..4).map(|_| pool.acquire().unwrap()).collect::<Vec<_>>())
                })
                .collect();
            workers.into_iter().flat_map(|worker| worker.join().unwrap()).collect()
        });

        let unique: HashSet<u32> = acquired.iter().copied().collect();
        assert_eq!(unique.len(), 16);
        assert_eq!(pool.len(), 16);
    }

    #[test]
    fn test_drop_destroys_every_item() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let factory = Counter { destroyed: destroyed.clone(), ..Counter::default() };
        {
            let pool = ResourcePool::new("counter", factory);
            pool.acquire().unwrap();
            pool.acquire().unwrap();
            pool.reset().unwrap();
            pool.acquire().unwrap();
        }
        assert_eq!(destroyed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_forget_all_empties_without_destroying() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let counter = Counter { destroyed: destroyed.clone(), ..Counter::default() };
        let pool = ResourcePool::new("counter", counter);
        pool.acquire().unwrap();
        pool.acquire().unwrap();
        assert_eq!(pool.forget_all(), 2);
        assert!(pool.is_empty());
        drop(pool);
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_exhaustion_propagates() {
        let pool = ResourcePool::new("counter", Exhausted);
        let err = pool.acquire().unwrap_err();
        assert_eq!(err.class(), crate::render::ErrorClass::Exhaustion);
        assert!(pool.is_empty());
    }

    struct EvenOnly(Counter);

    impl PoolItemFactory<u32> for EvenOnly {
        fn create(&self) -> RenderResult<u32> {
            self.0.create()
        }

        fn reusable(&self, item: &u32) -> bool {
            item % 2 == 0
        }

        fn destroy(&self, item: u32) {
            self.0.destroy(item);
        }
    }

    #[test]
    fn test_unfit_items_destroyed_on_reset() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let counter = Counter { destroyed: destroyed.clone(), ..Counter::default() };
        let pool = ResourcePool::new("even", EvenOnly(counter));
        for _ in 0..4 {
            pool.acquire().unwrap();
        }

        assert_eq!(pool.reset().unwrap(), 2);
        assert_eq!(destroyed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.available_len(), 2);

        let reused: HashSet<u32> = (0..2).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(reused, HashSet::from([0, 2]));
        assert_eq!(pool.acquire().unwrap(), 4);
    }
}
