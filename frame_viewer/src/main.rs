//! Frame viewer
//!
//! Drives the frame rotation on the headless device with a four-task graph:
//! a particle upload, a compute simulation step, an offscreen scene pass and
//! a composite pass into the slot's target. Every task waits on the previous
//! one through semaphores, and every submission's resources go to the
//! release queue.
//!
//! Usage: `frame_viewer [config.toml|config.ron]`

use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use frame_engine::foundation::logging;
use frame_engine::prelude::*;
use frame_engine::render::task::TaskCommands;
use thiserror::Error;

const PARTICLE_COUNT: u32 = 1024;
const WORKGROUP_SIZE: u32 = 64;
const SCENE_UNIFORMS: u32 = 0;

#[derive(Debug, Error)]
enum ViewerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("render error: {0}")]
    Render(#[from] RenderError),
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct Particle {
    position: [f32; 2],
    velocity: [f32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct SceneUniforms {
    tint: [f32; 4],
    time: f32,
    _padding: [f32; 3],
}

/// Resources owned by one frame slot, so slots never write what another reads
struct SlotResources {
    particles: Arc<GpuBuffer<HeadlessDevice>>,
    offscreen: Arc<Framebuffer<HeadlessDevice>>,
}

struct FrameGraph {
    upload: RenderTask<HeadlessDevice, TransferUpload<HeadlessDevice>>,
    simulate: RenderTask<HeadlessDevice, ComputeDispatch<HeadlessDevice>>,
    scene: RenderTask<HeadlessDevice, GraphicsPass<HeadlessDevice>>,
    composite: RenderTask<HeadlessDevice, GraphicsPass<HeadlessDevice>>,
    slots: Vec<SlotResources>,
}

impl FrameGraph {
    fn new(device: &Arc<HeadlessDevice>, registry: &mut TaskRegistry) -> Self {
        let simulate_pipeline = PipelineDesc::compute(
            device.fabricate(),
            device.fabricate(),
            Some(DescriptorLayoutInfo::storage_buffer(device.fabricate())),
        );
        let scene_pipeline = PipelineDesc::graphics(
            device.fabricate(),
            device.fabricate(),
            device.fabricate(),
            Some(DescriptorLayoutInfo::uniform_buffer(device.fabricate())),
        );
        let composite_pipeline = PipelineDesc::graphics(
            device.fabricate(),
            device.fabricate(),
            device.fabricate(),
            None,
        );

        Self {
            upload: TransferUpload::task(registry),
            simulate: ComputeDispatch::task(registry, "particle simulation", simulate_pipeline),
            scene: RenderTask::new(
                registry,
                "particle scene",
                GraphicsPass::new(scene_pipeline).with_clear_color([0.02, 0.02, 0.05, 1.0]),
            ),
            composite: GraphicsPass::task(registry, "composite", composite_pipeline),
            slots: Vec::new(),
        }
    }

    fn allocate_slots(
        &mut self,
        device: &Arc<HeadlessDevice>,
        frames: &mut FrameRotation<HeadlessDevice>,
        extent: (u32, u32),
    ) -> RenderResult<()> {
        let particle_bytes = u64::from(PARTICLE_COUNT) * std::mem::size_of::<Particle>() as u64;
        let usage = vk::BufferUsageFlags::TRANSFER_DST
            | vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::VERTEX_BUFFER;
        let scene_pass = self.scene.commands().pipeline().render_pass;
        let composite_pass = self.composite.commands().pipeline().render_pass;

        for index in 0..frames.frames_in_flight() {
            let attachments = [device.fabricate()];
            let target =
                Framebuffer::new(device.clone(), composite_pass, &attachments, extent.0, extent.1)?;
            frames.set_slot_targets(index, Some(Arc::new(target)))?;

            self.slots.push(SlotResources {
                particles: Arc::new(GpuBuffer::new(device.clone(), particle_bytes, usage, false)?),
                offscreen: Arc::new(Framebuffer::new(
                    device.clone(),
                    scene_pass,
                    &[device.fabricate()],
                    extent.0,
                    extent.1,
                )?),
            });
        }
        Ok(())
    }

    fn record(
        &mut self,
        slot: &FrameSlot<HeadlessDevice>,
        release: &ReleaseQueue,
        frame: u64,
    ) -> RenderResult<vk::Fence> {
        let context = slot.context();
        let resources = &self.slots[slot.index()];
        let target = slot.targets().cloned().ok_or_else(|| RenderError::InvalidOperation {
            reason: format!("frame slot {} has no target", slot.index()),
        })?;

        self.upload.set_frame_context(context.clone())?;
        self.simulate.set_frame_context(context.clone())?;
        self.scene.set_frame_context(context.clone())?;
        self.composite.set_frame_context(context.clone())?;

        self.upload.prepare_upload(&seed_particles(frame), resources.particles.clone())?;
        let uploaded = run_deferred(&mut self.upload, release)?;

        self.simulate.prepare_wait_on(&uploaded)?;
        self.simulate.prepare_inputs(vec![(0, resources.particles.clone())])?;
        self.simulate.prepare_groups(PARTICLE_COUNT.div_ceil(WORKGROUP_SIZE), 1, 1)?;
        let simulated = run_deferred(&mut self.simulate, release)?;

        let uniforms = SceneUniforms {
            tint: [1.0, 0.8, 0.6, 1.0],
            time: frame as f32 / 60.0,
            _padding: [0.0; 3],
        };
        self.scene.prepare_wait_on(&simulated)?;
        self.scene.prepare_uniforms(SCENE_UNIFORMS, &uniforms)?;
        self.scene.prepare_geometry(resources.particles.clone(), None, PARTICLE_COUNT, 1)?;
        self.scene.prepare_output(resources.offscreen.clone())?;
        let scene = run_deferred(&mut self.scene, release)?;

        self.composite.prepare_wait_on(&scene)?;
        self.composite.prepare_output(target)?;
        let composite = run_deferred(&mut self.composite, release)?;

        Ok(composite.fence)
    }
}

/// Run `task` and hand its retained resources to the release queue right away
fn run_deferred<C: TaskCommands<HeadlessDevice>>(
    task: &mut RenderTask<HeadlessDevice, C>,
    release: &ReleaseQueue,
) -> RenderResult<SubmissionRecord> {
    let mut record = task.run()?;
    release.defer(record.fence, std::mem::take(&mut record.retained));
    Ok(record)
}

fn seed_particles(frame: u64) -> Vec<Particle> {
    let phase = (frame % 360) as f32 * std::f32::consts::PI / 180.0;
    (0..PARTICLE_COUNT)
        .map(|i| {
            let angle = phase + i as f32 * 0.01;
            Particle {
                position: [angle.cos(), angle.sin()],
                velocity: [-angle.sin() * 0.1, angle.cos() * 0.1],
            }
        })
        .collect()
}

fn load_config() -> Result<ViewerConfig, ConfigError> {
    let config = match std::env::args().nth(1) {
        Some(path) => ViewerConfig::load_from_file(path)?,
        None => ViewerConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn run(config: &ViewerConfig) -> Result<(), ViewerError> {
    let device = Arc::new(HeadlessDevice::new(QueueFamilies::all()).with_auto_complete(true));
    let mut registry = TaskRegistry::new();
    let mut graph = FrameGraph::new(&device, &mut registry);

    let mut frames = FrameRotation::new(device.clone(), &registry, config.frames.clone())?;
    graph.allocate_slots(&device, &mut frames, config.extent)?;

    let mut rendered = 0u64;
    let mut skipped = 0u64;
    for frame in 0..config.frame_count {
        if config.simulate_out_of_date_at == Some(frame) {
            log::info!("Simulating an out-of-date surface on frame {frame}");
            device.inject_submit_error(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }

        match frames.render_frame(|slot, release| graph.record(slot, release, frame))? {
            FrameOutcome::Rendered { .. } => rendered += 1,
            FrameOutcome::Skipped { .. } => skipped += 1,
        }

        if frame % 60 == 59 {
            let release = frames.release_queue().stats();
            for index in 0..frames.frames_in_flight() {
                if let Some(slot) = frames.slot(index) {
                    log::debug!("{:?}", slot.context().stats());
                }
            }
            log::info!(
                "Frame {}: {rendered} rendered, {skipped} skipped, {} bundles pending release",
                frame + 1,
                release.pending()
            );
        }
    }

    frames.shutdown()?;

    let violations = device.violations();
    if violations.is_empty() {
        log::info!(
            "Finished {rendered} frames ({skipped} skipped) with no synchronization hazards"
        );
    } else {
        log::warn!("Finished with {} synchronization hazards", violations.len());
    }
    Ok(())
}

fn main() {
    let config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            logging::init_with_level("info");
            log::error!("Failed to load configuration: {err}");
            std::process::exit(1);
        }
    };
    logging::init_with_level(&config.log_level);
    log::info!("Starting frame viewer with {} frames in flight", config.frames.frames_in_flight);

    if let Err(err) = run(&config) {
        log::error!("Frame viewer failed: {err}");
        std::process::exit(1);
    }
}
