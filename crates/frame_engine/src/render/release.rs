//! Fence-gated deferred release
//!
//! A single reaper thread owns every resource whose last GPU use is still in
//! flight. Submitters hand it `(fence, bundle)` pairs; a bundle is dropped
//! only once its fence is observed signaled, or a frame gate reports the
//! fence retired after waiting it. Release is cleanup only and never orders
//! GPU work.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use ash::vk;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::render::backends::GpuDevice;
use crate::render::{RenderError, RenderResult};

/// Resources kept alive until a fence signals
#[derive(Default)]
pub struct ReleaseBundle {
    items: Vec<Box<dyn Send>>,
}

impl ReleaseBundle {
    /// Create an empty bundle
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `item` alive until the bundle is released
    pub fn retain<T: Send + 'static>(&mut self, item: T) {
        self.items.push(Box::new(item));
    }

    /// Move every item of `other` into this bundle
    pub fn append(&mut self, other: Self) {
        self.items.extend(other.items);
    }

    /// Number of retained items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is retained
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl std::fmt::Debug for ReleaseBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseBundle").field("items", &self.items.len()).finish()
    }
}

enum ReleaseMessage {
    Defer { fence: vk::Fence, bundle: ReleaseBundle },
    Retired(Vec<vk::Fence>),
    Flush(Sender<usize>),
    Shutdown,
}

#[derive(Default)]
struct ReleaseCounters {
    deferred: AtomicUsize,
    released: AtomicUsize,
}

/// Snapshot of release activity
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseStats {
    /// Bundles handed to the reaper
    pub deferred: usize,
    /// Bundles dropped by the reaper
    pub released: usize,
}

impl ReleaseStats {
    /// Bundles still waiting on their fence
    pub const fn pending(&self) -> usize {
        self.deferred.saturating_sub(self.released)
    }
}

/// Handle to the release reaper thread
///
/// Cheap to clone; every clone talks to the same thread.
#[derive(Clone)]
pub struct ReleaseQueue {
    sender: Sender<ReleaseMessage>,
    counters: Arc<ReleaseCounters>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ReleaseQueue {
    /// Start the reaper thread
    pub fn spawn<D: GpuDevice>(
        device: Arc<D>,
        poll_interval: Duration,
        thread_name: &str,
    ) -> RenderResult<Self> {
        let (sender, receiver) = channel::unbounded();
        let counters = Arc::new(ReleaseCounters::default());

        let reaper = Reaper {
            device,
            receiver,
            poll_interval,
            counters: counters.clone(),
            pending: Vec::new(),
        };
        let handle = std::thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || reaper.run())
            .map_err(|e| {
                log::error!("Failed to spawn release thread: {e}");
                let result = vk::Result::ERROR_OUT_OF_HOST_MEMORY;
                RenderError::Exhausted { what: "release thread", result }
            })?;
        log::debug!("Release reaper '{thread_name}' started");

        Ok(Self { sender, counters, worker: Arc::new(Mutex::new(Some(handle))) })
    }

    /// Drop `bundle` once `fence` has signaled
    pub fn defer(&self, fence: vk::Fence, bundle: ReleaseBundle) {
        if bundle.is_empty() {
            return;
        }
        self.counters.deferred.fetch_add(1, Ordering::Relaxed);
        let sent = self.sender.send(ReleaseMessage::Defer { fence, bundle });
        if let Err(channel::SendError(message)) = sent {
            log::warn!("Release reaper stopped; dropping bundle for {fence:?} immediately");
            self.counters.released.fetch_add(1, Ordering::Relaxed);
            drop(message);
        }
    }

    /// Report fences a frame gate has waited; their bundles are dropped
    pub fn retire(&self, fences: Vec<vk::Fence>) {
        if fences.is_empty() {
            return;
        }
        if self.sender.send(ReleaseMessage::Retired(fences)).is_err() {
            log::trace!("Release reaper stopped; ignoring retired fences");
        }
    }

    /// Drop every pending bundle now; returns how many were dropped
    ///
    /// The caller guarantees the device is idle.
    pub fn flush(&self) -> usize {
        let (reply, released) = channel::bounded(1);
        if self.sender.send(ReleaseMessage::Flush(reply)).is_err() {
            return 0;
        }
        released.recv().unwrap_or(0)
    }

    /// Stop the reaper after it releases everything still pending
    ///
    /// Waits each outstanding fence first. Safe to call more than once.
    pub fn shutdown(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        let _ = self.sender.send(ReleaseMessage::Shutdown);
        if handle.join().is_err() {
            log::error!("Release reaper panicked");
        }
    }

    /// Release counters
    pub fn stats(&self) -> ReleaseStats {
        ReleaseStats {
            deferred: self.counters.deferred.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
        }
    }

    /// Bundles still waiting on their fence
    pub fn pending(&self) -> usize {
        self.stats().pending()
    }
}

struct Reaper<D: GpuDevice> {
    device: Arc<D>,
    receiver: Receiver<ReleaseMessage>,
    poll_interval: Duration,
    counters: Arc<ReleaseCounters>,
    pending: Vec<(vk::Fence, ReleaseBundle)>,
}

impl<D: GpuDevice> Reaper<D> {
    fn run(mut self) {
        loop {
            let message = if self.pending.is_empty() {
                match self.receiver.recv() {
                    Ok(message) => Some(message),
                    Err(_) => break,
                }
            } else {
                match self.receiver.recv_timeout(self.poll_interval) {
                    Ok(message) => Some(message),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            };

            match message {
                Some(ReleaseMessage::Defer { fence, bundle }) => self.pending.push((fence, bundle)),
                Some(ReleaseMessage::Retired(fences)) => {
                    let released = self.release_where(|fence| fences.contains(fence));
                    if released > 0 {
                        log::trace!("Released {released} bundles for retired fences");
                    }
                }
                Some(ReleaseMessage::Flush(reply)) => {
                    let released = self.release_where(|_| true);
                    let _ = reply.send(released);
                }
                Some(ReleaseMessage::Shutdown) => break,
                None => {}
            }

            self.poll();
        }

        self.drain();
    }

    fn poll(&mut self) {
        let device = self.device.clone();
        self.release_where(|&fence| match device.fence_signaled(fence) {
            Ok(signaled) => signaled,
            // A lost device runs nothing, so its resources are free.
            Err(RenderError::DeviceLost) => true,
            Err(err) => {
                log::debug!("Fence {fence:?} status unavailable ({err}); keeping its bundle");
                false
            }
        });
    }

    fn release_where(&mut self, mut done: impl FnMut(&vk::Fence) -> bool) -> usize {
        let before = self.pending.len();
        self.pending.retain(|(fence, _)| !done(fence));
        let released = before - self.pending.len();
        self.counters.released.fetch_add(released, Ordering::Relaxed);
        released
    }

    fn drain(&mut self) {
        let remaining = self.pending.len();
        for (fence, bundle) in self.pending.drain(..) {
            if let Err(err) = self.device.wait_for_fence(fence, u64::MAX) {
                log::warn!("Waiting {fence:?} before release failed: {err}");
            }
            drop(bundle);
        }
        self.counters.released.fetch_add(remaining, Ordering::Relaxed);
        log::debug!("Release reaper stopped after releasing {remaining} remaining bundles");
    }
}
