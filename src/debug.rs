use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use wgpu::BindingResource;

use crate::{
    context::Context,
    error::Result,
    kernel::{self, Kernel, KernelDesc, Slot},
    resources,
};

/// Routes an intermediate image to the output instead of the composite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebugView {
    #[default]
    None,
    /// Reservoir sample counts, normalized by the temporal cap.
    ReservoirM,
    Variance,
    HistoryLength,
    Normals,
    Depth,
    Motion,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct DebugPush {
    mode: u32,
    restir_max_m: f32,
    svgf_max_m: f32,
    padding: u32,
}

const DEBUG_KERNEL: KernelDesc = KernelDesc {
    name: "debug_view",
    entry_point: "main",
    bindings: &[
        Slot::Storage { read_only: true },   // reservoirs
        Slot::Texture { filterable: false }, // variance
        Slot::Texture { filterable: false }, // moments + history
        Slot::Texture { filterable: true },  // normal
        Slot::Texture { filterable: false }, // depth
        Slot::Texture { filterable: true },  // motion
        Slot::StorageImage {
            format: resources::OUTPUT_FORMAT,
        },
    ],
    push_constant_size: std::mem::size_of::<DebugPush>() as u32,
};

pub struct DebugPhase {
    kernel: Kernel,
}

impl DebugPhase {
    pub fn new(context: &mut Context, const_layout: &wgpu::BindGroupLayout) -> Result<Self> {
        let kernel = Kernel::new(
            context,
            const_layout,
            &DEBUG_KERNEL,
            include_str!("shaders/debug_view.wgsl"),
            "shaders/debug_view.wgsl",
            &[],
        )?;

        Ok(Self { kernel })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        context: &Context,
        encoder: &mut wgpu::CommandEncoder,
        const_bind_group: &wgpu::BindGroup,
        view: DebugView,
        reservoirs: &wgpu::Buffer,
        variance: &wgpu::TextureView,
        moments: &wgpu::TextureView,
        normal: &wgpu::TextureView,
        depth: &wgpu::TextureView,
        motion: &wgpu::TextureView,
        output: &wgpu::TextureView,
        width: u32,
        height: u32,
        restir_max_m: u32,
        svgf_max_m: u32,
    ) -> Result<()> {
        let push = DebugPush {
            mode: view as u32,
            restir_max_m: restir_max_m.max(1) as f32,
            svgf_max_m: svgf_max_m.max(1) as f32,
            padding: 0,
        };

        let bind_group = self.kernel.bind(
            context,
            &[
                BindingResource::Buffer(reservoirs.as_entire_buffer_binding()),
                BindingResource::TextureView(variance),
                BindingResource::TextureView(moments),
                BindingResource::TextureView(normal),
                BindingResource::TextureView(depth),
                BindingResource::TextureView(motion),
                BindingResource::TextureView(output),
            ],
        )?;

        let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("debug view"),
        });
        compute_pass.set_pipeline(self.kernel.pipeline());
        compute_pass.set_push_constants(0, bytemuck::bytes_of(&push));
        compute_pass.set_bind_group(0, const_bind_group, &[]);
        compute_pass.set_bind_group(1, &bind_group, &[]);

        let (x, y) = kernel::image_groups(width, height);
        compute_pass.dispatch_workgroups(x, y, 1);

        Ok(())
    }
}
