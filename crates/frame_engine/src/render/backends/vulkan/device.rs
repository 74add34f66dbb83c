//! `ash`-backed device

use std::collections::HashMap;

use ash::vk;
use parking_lot::Mutex;

use super::{find_memory_type, QueueFamilyIndices};
use crate::render::backends::device::{Command, GpuDevice, QueueFamilies, QueueFamily, Submission};
use crate::render::{RenderError, RenderResult};

/// Persistently mapped pointer into host-visible memory
struct MappedPtr(*mut u8);

// SAFETY: the mapping is only written through `write_buffer`, which holds the
// allocation lock, and is unmapped before the memory is freed.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

struct BufferAllocation {
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    mapped: Option<MappedPtr>,
}

/// [`GpuDevice`] over an externally owned `ash::Device`
///
/// Queues that share a family index share one lock, since a `VkQueue` must
/// be externally synchronized.
pub struct VulkanDevice {
    device: ash::Device,
    families: QueueFamilies,
    indices: QueueFamilyIndices,
    queues: HashMap<u32, Mutex<vk::Queue>>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    allocations: Mutex<HashMap<vk::Buffer, BufferAllocation>>,
}

impl VulkanDevice {
    /// Wrap a device created with queue 0 of each family in `indices`
    pub fn from_raw(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        indices: QueueFamilyIndices,
    ) -> Self {
        let mut families = QueueFamilies::empty();
        let mut queues = HashMap::new();
        for family in QueueFamily::ALL {
            if let Some(index) = indices.index(family) {
                families |= family.flag();
                queues
                    .entry(index)
                    .or_insert_with(|| Mutex::new(unsafe { device.get_device_queue(index, 0) }));
            }
        }

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        log::info!("Vulkan device wrapped with queue families {families:?}");

        Self {
            device,
            families,
            indices,
            queues,
            memory_properties,
            allocations: Mutex::new(HashMap::new()),
        }
    }

    /// The wrapped device
    pub const fn raw(&self) -> &ash::Device {
        &self.device
    }

    fn family_index(&self, family: QueueFamily) -> RenderResult<u32> {
        self.indices.index(family).ok_or(RenderError::UnsupportedQueueFamily(family))
    }
}

impl GpuDevice for VulkanDevice {
    fn supported_queue_families(&self) -> QueueFamilies {
        self.families
    }

    fn create_command_pool(&self, family: QueueFamily) -> RenderResult<vk::CommandPool> {
        let create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(self.family_index(family)?);

        unsafe { self.device.create_command_pool(&create_info, None) }
            .map_err(|e| RenderError::from_vk(e, "command pool"))
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> RenderResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| RenderError::from_vk(e, "command buffer"))?;
        buffers.into_iter().next().ok_or(RenderError::Api(vk::Result::ERROR_UNKNOWN))
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> RenderResult<()> {
        unsafe { self.device.reset_command_pool(pool, vk::CommandPoolResetFlags::empty()) }
            .map_err(|e| RenderError::from_vk(e, "command pool"))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RenderResult<()> {
        let flags = vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT;
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(flags);

        unsafe { self.device.begin_command_buffer(command_buffer, &begin_info) }
            .map_err(RenderError::Api)
    }

    fn record(&self, command_buffer: vk::CommandBuffer, command: &Command) {
        let device = &self.device;
        unsafe {
            match *command {
                Command::BeginRenderPass {
                    render_pass,
                    framebuffer,
                    width,
                    height,
                    clear_color,
                } => {
                    let color = vk::ClearColorValue { float32: clear_color };
                    let clear_values = [vk::ClearValue { color }];
                    let begin_info = vk::RenderPassBeginInfo::builder()
                        .render_pass(render_pass)
                        .framebuffer(framebuffer)
                        .render_area(vk::Rect2D {
                            offset: vk::Offset2D { x: 0, y: 0 },
                            extent: vk::Extent2D { width, height },
                        })
                        .clear_values(&clear_values);
                    let contents = vk::SubpassContents::INLINE;
                    device.cmd_begin_render_pass(command_buffer, &begin_info, contents);
                }
                Command::EndRenderPass => device.cmd_end_render_pass(command_buffer),
                Command::BindPipeline { bind_point, pipeline } => {
                    device.cmd_bind_pipeline(command_buffer, bind_point, pipeline);
                }
                Command::BindDescriptorSet { bind_point, layout, set } => {
                    let sets = [set];
                    device.cmd_bind_descriptor_sets(
                        command_buffer,
                        bind_point,
                        layout,
                        0,
                        &sets,
                        &[],
                    );
                }
                Command::BindVertexBuffer { buffer, offset } => {
                    device.cmd_bind_vertex_buffers(command_buffer, 0, &[buffer], &[offset]);
                }
                Command::BindIndexBuffer { buffer, offset, index_type } => {
                    device.cmd_bind_index_buffer(command_buffer, buffer, offset, index_type);
                }
                Command::Draw { vertex_count, instance_count } => {
                    device.cmd_draw(command_buffer, vertex_count, instance_count, 0, 0);
                }
                Command::DrawIndexed { index_count, instance_count } => {
                    device.cmd_draw_indexed(command_buffer, index_count, instance_count, 0, 0, 0);
                }
                Command::Dispatch { x, y, z } => device.cmd_dispatch(command_buffer, x, y, z),
                Command::CopyBuffer { src, dst, size } => {
                    let region = vk::BufferCopy { src_offset: 0, dst_offset: 0, size };
                    device.cmd_copy_buffer(command_buffer, src, dst, &[region]);
                }
            }
        }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RenderResult<()> {
        unsafe { self.device.end_command_buffer(command_buffer) }.map_err(RenderError::Api)
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> RenderResult<vk::DescriptorPool> {
        let create_info =
            vk::DescriptorPoolCreateInfo::builder().max_sets(max_sets).pool_sizes(sizes);

        unsafe { self.device.create_descriptor_pool(&create_info, None) }
            .map_err(|e| RenderError::from_vk(e, "descriptor pool"))
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> RenderResult<vk::DescriptorSet> {
        let layouts = [layout];
        let alloc_info =
            vk::DescriptorSetAllocateInfo::builder().descriptor_pool(pool).set_layouts(&layouts);

        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| RenderError::from_vk(e, "descriptor set"))?;
        sets.into_iter().next().ok_or(RenderError::Api(vk::Result::ERROR_UNKNOWN))
    }

    fn update_descriptor_buffer(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        buffer: vk::Buffer,
        range: vk::DeviceSize,
    ) {
        let buffer_info = [vk::DescriptorBufferInfo { buffer, offset: 0, range }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(binding)
            .dst_array_element(0)
            .descriptor_type(descriptor_type)
            .buffer_info(&buffer_info)
            .build();

        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> RenderResult<()> {
        unsafe { self.device.reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty()) }
            .map_err(RenderError::Api)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn create_semaphore(&self) -> RenderResult<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::default();
        unsafe { self.device.create_semaphore(&create_info, None) }
            .map_err(|e| RenderError::from_vk(e, "semaphore"))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_fence(&self, signaled: bool) -> RenderResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::builder().flags(flags);
        unsafe { self.device.create_fence(&create_info, None) }
            .map_err(|e| RenderError::from_vk(e, "fence"))
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> RenderResult<()> {
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(RenderError::Timeout { timeout_ns }),
            Err(e) => Err(RenderError::from_vk(e, "fence wait")),
        }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> RenderResult<bool> {
        unsafe { self.device.get_fence_status(fence) }
            .map_err(|e| RenderError::from_vk(e, "fence status"))
    }

    fn reset_fence(&self, fence: vk::Fence) -> RenderResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }.map_err(|e| RenderError::from_vk(e, "fence"))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        host_visible: bool,
    ) -> RenderResult<vk::Buffer> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }
            .map_err(|e| RenderError::from_vk(e, "buffer"))?;

        let properties = if host_visible {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        } else {
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        };

        let allocation = (|| {
            let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
            let type_filter = requirements.memory_type_bits;
            let memory_type_index =
                find_memory_type(&self.memory_properties, type_filter, properties)?;

            let alloc_info = vk::MemoryAllocateInfo::builder()
                .allocation_size(requirements.size)
                .memory_type_index(memory_type_index);
            let memory = unsafe { self.device.allocate_memory(&alloc_info, None) }
                .map_err(|e| RenderError::from_vk(e, "buffer memory"))?;

            let bind_and_map = || -> RenderResult<Option<MappedPtr>> {
                unsafe { self.device.bind_buffer_memory(buffer, memory, 0) }
                    .map_err(|e| RenderError::from_vk(e, "buffer memory"))?;
                if !host_visible {
                    return Ok(None);
                }
                let flags = vk::MemoryMapFlags::empty();
                let ptr = unsafe { self.device.map_memory(memory, 0, vk::WHOLE_SIZE, flags) }
                    .map_err(|e| RenderError::from_vk(e, "buffer mapping"))?;
                Ok(Some(MappedPtr(ptr.cast())))
            };

            match bind_and_map() {
                Ok(mapped) => Ok(BufferAllocation { memory, size, mapped }),
                Err(err) => {
                    unsafe { self.device.free_memory(memory, None) };
                    Err(err)
                }
            }
        })();

        match allocation {
            Ok(allocation) => {
                self.allocations.lock().insert(buffer, allocation);
                Ok(buffer)
            }
            Err(err) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                Err(err)
            }
        }
    }

    fn write_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> RenderResult<()> {
        let allocations = self.allocations.lock();
        let allocation = allocations
            .get(&buffer)
            .ok_or_else(|| RenderError::invalid(format!("unknown buffer {buffer:?}")))?;
        let mapped = allocation
            .mapped
            .as_ref()
            .ok_or_else(|| RenderError::invalid("Buffer is not host visible"))?;

        let end = offset.checked_add(data.len() as vk::DeviceSize);
        if end.map_or(true, |end| end > allocation.size) {
            return Err(RenderError::invalid("Buffer write would overflow"));
        }

        // SAFETY: the range was checked against the allocation size above.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.0.add(offset as usize), data.len());
        }
        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let allocation = self.allocations.lock().remove(&buffer);
        unsafe {
            self.device.destroy_buffer(buffer, None);
            if let Some(allocation) = allocation {
                if allocation.mapped.is_some() {
                    self.device.unmap_memory(allocation.memory);
                }
                self.device.free_memory(allocation.memory, None);
            }
        }
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        width: u32,
        height: u32,
    ) -> RenderResult<vk::Framebuffer> {
        let create_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(width)
            .height(height)
            .layers(1);

        unsafe { self.device.create_framebuffer(&create_info, None) }
            .map_err(|e| RenderError::from_vk(e, "framebuffer"))
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) };
    }

    fn submit(
        &self,
        family: QueueFamily,
        submission: &Submission<'_>,
        fence: vk::Fence,
    ) -> RenderResult<()> {
        let index = self.family_index(family)?;
        let queue = self.queues.get(&index).ok_or(RenderError::UnsupportedQueueFamily(family))?;

        let wait_semaphores: Vec<vk::Semaphore> =
            submission.wait.iter().map(|wait| wait.semaphore).collect();
        let wait_stages: Vec<vk::PipelineStageFlags> =
            submission.wait.iter().map(|wait| wait.stage).collect();
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(submission.command_buffers)
            .signal_semaphores(submission.signal)
            .build();

        let queue = queue.lock();
        unsafe { self.device.queue_submit(*queue, &[submit_info], fence) }
            .map_err(|e| RenderError::from_vk(e, "submission"))
    }

    fn wait_idle(&self) -> RenderResult<()> {
        unsafe { self.device.device_wait_idle() }
            .map_err(|e| RenderError::from_vk(e, "device idle"))
    }
}
