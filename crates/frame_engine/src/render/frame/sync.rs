//! Semaphore and fence pools

use std::collections::HashSet;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use super::pool::{PoolItemFactory, ResourcePool};
use crate::render::backends::{GpuDevice, SemaphoreWait};
use crate::render::RenderResult;

struct SemaphoreFactory<D: GpuDevice> {
    device: Arc<D>,
    /// Signaled by a submission that no later submission waits on
    unconsumed: Mutex<HashSet<vk::Semaphore>>,
}

impl<D: GpuDevice> PoolItemFactory<vk::Semaphore> for SemaphoreFactory<D> {
    fn create(&self) -> RenderResult<vk::Semaphore> {
        self.device.create_semaphore()
    }

    // A binary semaphore left signaled cannot be signaled again.
    fn reusable(&self, item: &vk::Semaphore) -> bool {
        !self.unconsumed.lock().contains(item)
    }

    fn destroy(&self, item: vk::Semaphore) {
        self.unconsumed.lock().remove(&item);
        self.device.destroy_semaphore(item);
    }
}

struct FenceFactory<D: GpuDevice> {
    device: Arc<D>,
}

impl<D: GpuDevice> PoolItemFactory<vk::Fence> for FenceFactory<D> {
    fn create(&self) -> RenderResult<vk::Fence> {
        self.device.create_fence(false)
    }

    fn recycle(&self, item: &vk::Fence) -> RenderResult<()> {
        self.device.reset_fence(*item)
    }

    fn destroy(&self, item: vk::Fence) {
        self.device.destroy_fence(item);
    }
}

/// Binary semaphores and fences for one frame context
///
/// Fences come out unsignaled. [`SyncObjectManager::reset`] returns them to
/// the unsignaled state before they can be acquired again. Semaphores whose
/// signal was never waited on are destroyed by the reset rather than reused.
pub struct SyncObjectManager<D: GpuDevice> {
    semaphores: ResourcePool<vk::Semaphore, SemaphoreFactory<D>>,
    fences: ResourcePool<vk::Fence, FenceFactory<D>>,
}

impl<D: GpuDevice> SyncObjectManager<D> {
    /// Create empty pools
    pub fn new(device: Arc<D>) -> Self {
        Self {
            semaphores: ResourcePool::new(
                "semaphore",
                SemaphoreFactory { device: device.clone(), unconsumed: Mutex::new(HashSet::new()) },
            ),
            fences: ResourcePool::new("fence", FenceFactory { device }),
        }
    }

    /// A semaphore not signaled by any pending submission
    pub fn acquire_semaphore(&self) -> RenderResult<vk::Semaphore> {
        self.semaphores.acquire()
    }

    /// An unsignaled fence
    pub fn acquire_fence(&self) -> RenderResult<vk::Fence> {
        self.fences.acquire()
    }

    /// Track the semaphores a submission waits on and signals
    pub fn track_submission(&self, waits: &[SemaphoreWait], signals: &[vk::Semaphore]) {
        let mut unconsumed = self.semaphores.factory().unconsumed.lock();
        for wait in waits {
            unconsumed.remove(&wait.semaphore);
        }
        unconsumed.extend(signals.iter().copied());
    }

    /// Semaphores signaled since the last reset that nothing waits on yet
    pub fn unconsumed_len(&self) -> usize {
        self.semaphores.factory().unconsumed.lock().len()
    }

    /// Return every semaphore and fence, resetting the fences
    pub fn reset(&self) -> RenderResult<()> {
        self.semaphores.reset()?;
        self.fences.reset()?;
        Ok(())
    }

    /// Semaphores created so far
    pub fn semaphore_count(&self) -> usize {
        self.semaphores.len()
    }

    /// Fences created so far
    pub fn fence_count(&self) -> usize {
        self.fences.len()
    }

    /// Semaphores and fences on loan since the last reset
    pub fn acquired_len(&self) -> (usize, usize) {
        (self.semaphores.acquired_len(), self.fences.acquired_len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::{HeadlessDevice, QueueFamilies, QueueFamily, Submission};
    use std::collections::HashSet;

    fn signal(device: &HeadlessDevice, fence: vk::Fence) {
        let empty = Submission { wait: &[], command_buffers: &[], signal: &[] };
        device.submit(QueueFamily::Graphics, &empty, fence).unwrap();
    }

    #[test]
    fn test_three_fences_round_trip() {
        let device = Arc::new(HeadlessDevice::new(QueueFamilies::all()).with_auto_complete(true));
        let sync = SyncObjectManager::new(device.clone());

        let first: HashSet<vk::Fence> = (0..3).map(|_| sync.acquire_fence().unwrap()).collect();
        for fence in &first {
            signal(&device, *fence);
            assert!(device.fence_signaled(*fence).unwrap());
        }

        sync.reset().unwrap();
        let second: HashSet<vk::Fence> = (0..3).map(|_| sync.acquire_fence().unwrap()).collect();
        assert_eq!(first, second);
        for fence in &second {
            assert!(!device.fence_signaled(*fence).unwrap());
        }
        assert_eq!(sync.fence_count(), 3);
        assert!(device.violations().is_empty());
    }

    #[test]
    fn test_fence_reset_is_idempotent_when_unsignaled() {
        let device = Arc::new(HeadlessDevice::new(QueueFamilies::all()));
        let sync = SyncObjectManager::new(device.clone());
        let fence = sync.acquire_fence().unwrap();
        sync.reset().unwrap();
        assert_eq!(sync.acquire_fence().unwrap(), fence);
        sync.reset().unwrap();
        assert!(!device.fence_signaled(fence).unwrap());
    }

    #[test]
    fn test_unwaited_signal_is_not_reused() {
        let device = Arc::new(HeadlessDevice::new(QueueFamilies::all()).with_auto_complete(true));
        let sync = SyncObjectManager::new(device.clone());
        let upstream = sync.acquire_semaphore().unwrap();
        let last = sync.acquire_semaphore().unwrap();
        sync.track_submission(&[], &[upstream]);
        let wait = SemaphoreWait::new(upstream, vk::PipelineStageFlags::TRANSFER);
        sync.track_submission(&[wait], &[last]);
        assert_eq!(sync.unconsumed_len(), 1);

        sync.reset().unwrap();
        assert_eq!(sync.unconsumed_len(), 0);
        assert_eq!(sync.semaphore_count(), 1);
        assert_eq!(device.live_objects().semaphores, 1);

        let first = sync.acquire_semaphore().unwrap();
        let second = sync.acquire_semaphore().unwrap();
        assert_eq!(first, upstream);
        assert_ne!(second, last);
    }

    #[test]
    fn test_semaphores_pooled_and_destroyed_on_drop() {
        let device = Arc::new(HeadlessDevice::new(QueueFamilies::all()));
        let sync = SyncObjectManager::new(device.clone());
        let a = sync.acquire_semaphore().unwrap();
        let b = sync.acquire_semaphore().unwrap();
        assert_ne!(a, b);
        assert_eq!(sync.acquired_len(), (2, 0));
        sync.reset().unwrap();
        sync.acquire_semaphore().unwrap();
        assert_eq!(sync.semaphore_count(), 2);

        drop(sync);
        let live = device.live_objects();
        assert_eq!((live.semaphores, live.fences), (0, 0));
    }
}
