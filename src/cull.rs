use wgpu::BindingResource;

use crate::{
    cluster::ClusterGrid,
    context::Context,
    error::Result,
    kernel::{self, Kernel, KernelDesc, Slot},
    resources::StorageBuffer,
};

pub const MAX_LIGHTS_PER_CLUSTER: u32 = 256;
pub const MAX_TOTAL_LIGHT_INDICES: u32 = 1024 * 1024;

/// Slots in the per-frame statistics buffer, shared with the other stages.
pub const STAT_CLUSTER_OVERFLOW: usize = 0;
pub const STAT_TEMPORAL_INVALIDATED: usize = 1;
pub const STAT_DISOCCLUDED: usize = 2;
pub const STAT_COUNT: usize = 4;

const CULL_KERNEL: KernelDesc = KernelDesc {
    name: "clustered_light_culling",
    entry_point: "main",
    bindings: &[
        Slot::Storage { read_only: true },  // cluster aabbs
        Slot::Storage { read_only: true },  // lights
        Slot::Storage { read_only: false }, // cluster meta
        Slot::Storage { read_only: false }, // light indices
        Slot::Storage { read_only: false }, // allocation counter
        Slot::Storage { read_only: false }, // stats
    ],
    push_constant_size: 0,
};

/// Builds the per-cluster light lists.
///
/// One dispatch per frame; every invocation owns one cluster, counts the
/// lights whose bounding volume overlaps its aabb, reserves a contiguous
/// span of `light_indices` through the global atomic counter, then writes
/// the indices. The counter and the meta buffer are cleared on the gpu at
/// the start of the dispatch chain, never from the host.
pub struct CullPhase {
    kernel: Kernel,
    cluster_meta: StorageBuffer,
    light_indices: StorageBuffer,
    counter: StorageBuffer,
}

impl CullPhase {
    pub fn new(
        context: &mut Context,
        const_layout: &wgpu::BindGroupLayout,
        cluster_count: u32,
    ) -> Result<Self> {
        let kernel = Kernel::new(
            context,
            const_layout,
            &CULL_KERNEL,
            include_str!("shaders/clustered_light_culling.wgsl"),
            "shaders/clustered_light_culling.wgsl",
            &[],
        )?;

        let cluster_meta = StorageBuffer::new(
            context,
            "cluster meta buffer",
            u64::from(cluster_count) * 8,
        )?;
        let light_indices = StorageBuffer::new(
            context,
            "light index buffer",
            u64::from(MAX_TOTAL_LIGHT_INDICES) * 4,
        )?;
        let counter = StorageBuffer::new(context, "light index counter", 4)?;

        Ok(Self {
            kernel,
            cluster_meta,
            light_indices,
            counter,
        })
    }

    pub fn record(
        &self,
        context: &Context,
        encoder: &mut wgpu::CommandEncoder,
        const_bind_group: &wgpu::BindGroup,
        grid: &ClusterGrid,
        light_buffer: &wgpu::Buffer,
        stats: &wgpu::Buffer,
    ) -> Result<()> {
        encoder.clear_buffer(&self.counter.buffer, 0, None);
        encoder.clear_buffer(&self.cluster_meta.buffer, 0, None);

        let bind_group = self.kernel.bind(
            context,
            &[
                grid.buffer().as_entire_binding(),
                BindingResource::Buffer(light_buffer.as_entire_buffer_binding()),
                self.cluster_meta.binding(),
                self.light_indices.binding(),
                self.counter.binding(),
                BindingResource::Buffer(stats.as_entire_buffer_binding()),
            ],
        )?;

        let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("light culling"),
        });

        compute_pass.set_pipeline(self.kernel.pipeline());
        compute_pass.set_bind_group(0, const_bind_group, &[]);
        compute_pass.set_bind_group(1, &bind_group, &[]);

        let (x, y, z) = kernel::cluster_groups(grid.dim());
        compute_pass.dispatch_workgroups(x, y, z);

        Ok(())
    }

    pub fn cluster_meta(&self) -> &StorageBuffer {
        &self.cluster_meta
    }

    pub fn light_indices(&self) -> &StorageBuffer {
        &self.light_indices
    }
}
