use naga_oil::compose::ShaderDefValue;

use crate::{
    context::Context,
    error::Result,
    kernel::{self, Kernel, KernelDesc, Slot},
    resources,
};

const CLEAR_COLOR_KERNEL: KernelDesc = KernelDesc {
    name: "image_clear",
    entry_point: "main",
    bindings: &[Slot::StorageImage {
        format: resources::COLOR_BUFFER_FORMAT,
    }],
    push_constant_size: 0,
};

const CLEAR_MOMENTS_KERNEL: KernelDesc = KernelDesc {
    name: "image_clear_moments",
    entry_point: "main",
    bindings: &[Slot::StorageImage {
        format: resources::MOMENTS_FORMAT,
    }],
    push_constant_size: 0,
};

/// Zero-fills viewport-sized storage images.
///
/// Used for the restir fallback when the stage is disabled, for skipped
/// frames, and for temporal-history resets. Done with a mini kernel so the
/// pipeline never depends on optional texture-clear features.
pub struct ClearPhase {
    color: Kernel,
    moments: Kernel,
}

impl ClearPhase {
    pub fn new(context: &mut Context, const_layout: &wgpu::BindGroupLayout) -> Result<Self> {
        let source = include_str!("shaders/image_clear.wgsl");
        let path = "shaders/image_clear.wgsl";

        let color = Kernel::new(context, const_layout, &CLEAR_COLOR_KERNEL, source, path, &[])?;
        let moments = Kernel::new(
            context,
            const_layout,
            &CLEAR_MOMENTS_KERNEL,
            source,
            path,
            &[("MOMENTS", ShaderDefValue::Bool(true))],
        )?;

        Ok(Self { color, moments })
    }

    pub fn record_color(
        &self,
        context: &Context,
        encoder: &mut wgpu::CommandEncoder,
        const_bind_group: &wgpu::BindGroup,
        target: &wgpu::TextureView,
        width: u32,
        height: u32,
    ) -> Result<()> {
        record(
            &self.color,
            context,
            encoder,
            const_bind_group,
            target,
            width,
            height,
        )
    }

    pub fn record_moments(
        &self,
        context: &Context,
        encoder: &mut wgpu::CommandEncoder,
        const_bind_group: &wgpu::BindGroup,
        target: &wgpu::TextureView,
        width: u32,
        height: u32,
    ) -> Result<()> {
        record(
            &self.moments,
            context,
            encoder,
            const_bind_group,
            target,
            width,
            height,
        )
    }
}

fn record(
    kernel: &Kernel,
    context: &Context,
    encoder: &mut wgpu::CommandEncoder,
    const_bind_group: &wgpu::BindGroup,
    target: &wgpu::TextureView,
    width: u32,
    height: u32,
) -> Result<()> {
    let bind_group = kernel.bind(context, &[wgpu::BindingResource::TextureView(target)])?;

    let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
        label: Some("image clear"),
    });

    compute_pass.set_pipeline(kernel.pipeline());
    compute_pass.set_bind_group(0, const_bind_group, &[]);
    compute_pass.set_bind_group(1, &bind_group, &[]);

    let (x, y) = kernel::image_groups(width, height);
    compute_pass.dispatch_workgroups(x, y, 1);

    Ok(())
}
