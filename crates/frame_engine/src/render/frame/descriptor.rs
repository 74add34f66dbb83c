//! Per-frame descriptor set allocation
//!
//! One native descriptor pool per frame context, sized from the layouts of
//! every registered task. Resetting the native pool frees every set at once,
//! so sets are only valid until the next [`DescriptorSetManager::reset`].

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;

use super::pool::{PoolItemFactory, ResourcePool};
use crate::render::backends::GpuDevice;
use crate::render::{RenderError, RenderResult};

/// A binding within a descriptor set layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutBinding {
    /// Binding index
    pub binding: u32,
    /// Type of descriptor
    pub descriptor_type: vk::DescriptorType,
    /// Number of descriptors
    pub count: u32,
}

impl LayoutBinding {
    /// Create a binding of a single descriptor
    pub const fn new(binding: u32, descriptor_type: vk::DescriptorType) -> Self {
        Self { binding, descriptor_type, count: 1 }
    }
}

/// Descriptor set layout together with the bindings it was created from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorLayoutInfo {
    /// Native layout
    pub layout: vk::DescriptorSetLayout,
    /// Bindings, used to size descriptor pools
    pub bindings: Vec<LayoutBinding>,
}

impl DescriptorLayoutInfo {
    /// Describe an existing layout
    pub fn new(layout: vk::DescriptorSetLayout, bindings: Vec<LayoutBinding>) -> Self {
        Self { layout, bindings }
    }

    /// Layout with one uniform buffer at binding 0
    pub fn uniform_buffer(layout: vk::DescriptorSetLayout) -> Self {
        Self::new(layout, vec![LayoutBinding::new(0, vk::DescriptorType::UNIFORM_BUFFER)])
    }

    /// Layout with one storage buffer at binding 0
    pub fn storage_buffer(layout: vk::DescriptorSetLayout) -> Self {
        Self::new(layout, vec![LayoutBinding::new(0, vk::DescriptorType::STORAGE_BUFFER)])
    }
}

/// Compute `(max_sets, pool sizes)` for `layouts`, allowing `sets_per_layout` sets each
pub fn pool_sizing(
    layouts: &[DescriptorLayoutInfo],
    sets_per_layout: u32,
) -> (u32, Vec<vk::DescriptorPoolSize>) {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for binding in layouts.iter().flat_map(|info| info.bindings.iter()) {
        let count = binding.count.saturating_mul(sets_per_layout);
        match sizes.iter_mut().find(|size| size.ty == binding.descriptor_type) {
            Some(size) => size.descriptor_count = size.descriptor_count.saturating_add(count),
            None => sizes.push(vk::DescriptorPoolSize {
                ty: binding.descriptor_type,
                descriptor_count: count,
            }),
        }
    }
    let max_sets = u32::try_from(layouts.len()).unwrap_or(u32::MAX).saturating_mul(sets_per_layout);
    (max_sets, sizes)
}

struct DescriptorSetFactory<D: GpuDevice> {
    device: Arc<D>,
    descriptor_pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
}

impl<D: GpuDevice> PoolItemFactory<vk::DescriptorSet> for DescriptorSetFactory<D> {
    fn create(&self) -> RenderResult<vk::DescriptorSet> {
        self.device.allocate_descriptor_set(self.descriptor_pool, self.layout)
    }

    // Sets are freed by resetting or destroying the descriptor pool.
    fn destroy(&self, _item: vk::DescriptorSet) {}
}

type SetPool<D> = ResourcePool<vk::DescriptorSet, DescriptorSetFactory<D>>;

/// Descriptor sets for one frame context
pub struct DescriptorSetManager<D: GpuDevice> {
    device: Arc<D>,
    descriptor_pool: Option<vk::DescriptorPool>,
    max_sets: u32,
    sets: HashMap<vk::DescriptorSetLayout, SetPool<D>>,
}

impl<D: GpuDevice> DescriptorSetManager<D> {
    /// Size and create the descriptor pool for `layouts`
    ///
    /// No native pool is created when there are no layouts.
    pub fn new(
        device: Arc<D>,
        layouts: &[DescriptorLayoutInfo],
        sets_per_layout: u32,
    ) -> RenderResult<Self> {
        let (max_sets, sizes) = pool_sizing(layouts, sets_per_layout);
        let descriptor_pool = if max_sets == 0 {
            None
        } else {
            let pool = device.create_descriptor_pool(max_sets, &sizes)?;
            log::debug!(
                "Created descriptor pool for {} layouts ({max_sets} sets, {} types)",
                layouts.len(),
                sizes.len()
            );
            Some(pool)
        };

        let mut sets = HashMap::new();
        if let Some(pool) = descriptor_pool {
            for info in layouts {
                sets.entry(info.layout).or_insert_with(|| {
                    ResourcePool::new(
                        "descriptor set",
                        DescriptorSetFactory {
                            device: device.clone(),
                            descriptor_pool: pool,
                            layout: info.layout,
                        },
                    )
                });
            }
        }

        Ok(Self { device, descriptor_pool, max_sets, sets })
    }

    /// Allocate a set with `layout` from this frame's pool
    pub fn acquire_set(&self, layout: vk::DescriptorSetLayout) -> RenderResult<vk::DescriptorSet> {
        self.sets.get(&layout).ok_or(RenderError::DescriptorLayoutMismatch { layout })?.acquire()
    }

    /// Reset the descriptor pool, freeing every set
    pub fn reset(&self) -> RenderResult<()> {
        if let Some(pool) = self.descriptor_pool {
            self.device.reset_descriptor_pool(pool)?;
        }
        for sets in self.sets.values() {
            sets.forget_all();
        }
        Ok(())
    }

    /// Maximum sets the pool can hold at once
    pub const fn capacity(&self) -> u32 {
        self.max_sets
    }

    /// Sets allocated since the last reset
    pub fn acquired_len(&self) -> usize {
        self.sets.values().map(ResourcePool::acquired_len).sum()
    }
}

impl<D: GpuDevice> Drop for DescriptorSetManager<D> {
    fn drop(&mut self) {
        if let Some(pool) = self.descriptor_pool.take() {
            for sets in self.sets.values() {
                sets.forget_all();
            }
            self.device.destroy_descriptor_pool(pool);
        }
    }
}
