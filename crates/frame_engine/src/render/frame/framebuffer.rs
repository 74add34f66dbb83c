//! Keep-alive list for framebuffers used during a frame

use std::sync::Arc;

use crossbeam::queue::SegQueue;

use crate::render::backends::GpuDevice;
use crate::render::resources::Framebuffer;

/// Holds framebuffer references until the frame that used them is reset
pub struct FramebufferKeeper<D: GpuDevice> {
    retained: SegQueue<Arc<Framebuffer<D>>>,
}

impl<D: GpuDevice> FramebufferKeeper<D> {
    /// Create an empty keeper
    pub fn new() -> Self {
        Self { retained: SegQueue::new() }
    }

    /// Retain `framebuffer` until the next reset
    pub fn register_framebuffer(&self, framebuffer: Arc<Framebuffer<D>>) {
        self.retained.push(framebuffer);
    }

    /// Drop every retained reference; returns how many were dropped
    pub fn reset(&self) -> usize {
        let mut released = 0;
        while self.retained.pop().is_some() {
            released += 1;
        }
        released
    }

    /// References currently retained
    pub fn len(&self) -> usize {
        self.retained.len()
    }

    /// Whether nothing is retained
    pub fn is_empty(&self) -> bool {
        self.retained.is_empty()
    }
}

impl<D: GpuDevice> Default for FramebufferKeeper<D> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::{HeadlessDevice, QueueFamilies};

    #[test]
    fn test_keeper_extends_lifetime_until_reset() {
        let device = Arc::new(HeadlessDevice::new(QueueFamilies::all()));
        let keeper = FramebufferKeeper::new();
        let framebuffer =
            Arc::new(Framebuffer::new(device.clone(), device.fabricate(), &[], 4, 4).unwrap());

        keeper.register_framebuffer(framebuffer.clone());
        keeper.register_framebuffer(framebuffer.clone());
        drop(framebuffer);
        assert_eq!(keeper.len(), 2);
        assert_eq!(device.live_objects().framebuffers, 1);

        assert_eq!(keeper.reset(), 2);
        assert!(keeper.is_empty());
        assert_eq!(device.live_objects().framebuffers, 0);
    }
}
