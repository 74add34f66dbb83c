//! Frame rotation against the headless device

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use frame_engine::prelude::*;

fn submit_empty(
    device: &HeadlessDevice,
    slot: &FrameSlot<HeadlessDevice>,
) -> RenderResult<(vk::Fence, u64)> {
    let context = slot.context();
    let fence = context.acquire_fence()?;
    let empty = Submission { wait: &[], command_buffers: &[], signal: &[] };
    device.submit(QueueFamily::Graphics, &empty, fence)?;
    context.record_submission(fence);
    let sequence = device.submissions().last().map_or(0, |submission| submission.sequence);
    Ok((fence, sequence))
}

/// Completes one pending submission per millisecond until stopped
struct Completer {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Completer {
    fn start(device: Arc<HeadlessDevice>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = std::thread::spawn(move || {
            while !flag.load(Ordering::SeqCst) {
                device.complete_next();
                std::thread::sleep(Duration::from_millis(1));
            }
        });
        Self { stop, handle: Some(handle) }
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
        }
    }
}

#[test]
fn frame_reuses_slot_only_after_its_previous_frame_completed() {
    const FRAMES_IN_FLIGHT: usize = 3;
    let device = Arc::new(HeadlessDevice::new(QueueFamilies::all()));
    let config = FrameConfig::default().with_frames_in_flight(FRAMES_IN_FLIGHT);
    let mut frames = FrameRotation::new(device.clone(), &TaskRegistry::new(), config).unwrap();
    let _completer = Completer::start(device.clone());

    let mut sequences: Vec<u64> = Vec::new();
    for frame in 0..20usize {
        let outcome = frames
            .render_frame(|slot, _| {
                if frame >= FRAMES_IN_FLIGHT {
                    let previous = frame - FRAMES_IN_FLIGHT;
                    let earlier = sequences[previous] as usize;
                    assert!(
                        device.submissions()[earlier].completed,
                        "frame {frame} started before frame {previous} finished"
                    );
                }
                let (fence, sequence) = submit_empty(&device, slot)?;
                sequences.push(sequence);
                Ok(fence)
            })
            .unwrap();
        let expected = frame % FRAMES_IN_FLIGHT;
        assert!(matches!(outcome, FrameOutcome::Rendered { slot, .. } if slot == expected));
    }

    frames.shutdown().unwrap();
    assert!(device.violations().is_empty(), "{:?}", device.violations());
}

#[test]
fn failed_frame_still_gates_its_slot() {
    let device = Arc::new(HeadlessDevice::new(QueueFamilies::all()));
    let config = FrameConfig::default().with_frames_in_flight(1).with_fence_timeout_ns(5_000_000);
    let mut frames = FrameRotation::new(device.clone(), &TaskRegistry::new(), config).unwrap();

    let outcome = frames
        .render_frame(|slot, _| {
            submit_empty(&device, slot)?;
            device.inject_submit_error(vk::Result::ERROR_OUT_OF_DATE_KHR);
            submit_empty(&device, slot).map(|(fence, _)| fence)
        })
        .unwrap();
    assert!(matches!(
        outcome,
        FrameOutcome::Skipped { status: vk::Result::ERROR_OUT_OF_DATE_KHR, .. }
    ));
    assert_eq!(device.pending_submissions(), 1);

    let blocked =
        frames.render_frame(|slot, _| submit_empty(&device, slot).map(|(fence, _)| fence));
    assert_eq!(blocked, Err(RenderError::Timeout { timeout_ns: 5_000_000 }));

    device.complete_all();
    let outcome = frames
        .render_frame(|slot, _| submit_empty(&device, slot).map(|(fence, _)| fence))
        .unwrap();
    assert!(matches!(outcome, FrameOutcome::Rendered { frame: 1, .. }));

    frames.shutdown().unwrap();
    assert!(device.violations().is_empty(), "{:?}", device.violations());
}

#[test]
fn pools_stop_growing_at_their_high_water_mark() {
    let device = Arc::new(HeadlessDevice::new(QueueFamilies::all()).with_auto_complete(true));
    let registry = TaskRegistry::new();
    let mut frames = FrameRotation::new(device.clone(), &registry, FrameConfig::default()).unwrap();

    for _ in 0..50 {
        frames
            .render_frame(|slot, _| {
                let context = slot.context();
                context.acquire_command_buffer(QueueFamily::Graphics)?;
                context.acquire_semaphore()?;
                context.acquire_semaphore()?;
                submit_empty(&device, slot).map(|(fence, _)| fence)
            })
            .unwrap();
    }

    for index in 0..frames.frames_in_flight() {
        let stats = frames.slot(index).unwrap().context().stats();
        assert_eq!(stats.command_buffers, 1);
        assert_eq!(stats.semaphores, 2);
        assert_eq!(stats.fences, 1);
    }
    let live = device.live_objects();
    assert_eq!(live.semaphores, 4);
    assert_eq!(live.fences, 2);

    frames.shutdown().unwrap();
    drop(frames);
    let live = device.live_objects();
    assert_eq!((live.semaphores, live.fences, live.command_pools), (0, 0, 0));
}

#[test]
fn configuration_loads_from_ron() {
    let name = format!("frame_engine_rotation_{}.ron", std::process::id());
    let path = std::env::temp_dir().join(name);
    let config = ViewerConfig::new().with_frames(FrameConfig::new().with_frames_in_flight(3));
    config.save_to_file(&path).unwrap();

    let loaded = ViewerConfig::load_from_file(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(loaded.frames.frames_in_flight, 3);
    assert!(loaded.validate().is_ok());
}
