use bytemuck::{NoUninit, Pod, Zeroable};
use serde::{Deserialize, Serialize};
use wgpu::BindingResource;

use crate::{
    clear::ClearPhase,
    context::Context,
    error::Result,
    kernel::{self, Kernel, KernelDesc, Slot},
    profile::{GpuProfiler, Stamp},
    resources::{self, GBufferViews, PingPong, RenderTarget},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SvgfSettings {
    pub temporal_accumulation: bool,
    /// Minimum blend factor toward the new sample. The effective factor is
    /// `max(1 / (history + 1), temporal_alpha)`.
    pub temporal_alpha: f32,
    /// Cap on the per-pixel history length.
    pub temporal_max_m: u32,
    pub temporal_depth_threshold: f32,
    pub temporal_normal_threshold: f32,
    /// Neighborhood edge for the spatial variance fallback, 3 or 5.
    pub variance_kernel_size: u32,
    /// Scales the spatial variance estimate while history is short.
    pub variance_boost: f32,
    pub wavelet_iterations: u32,
    pub phi_color: f32,
    pub phi_normal: f32,
    pub phi_depth: f32,
    pub sigma_luminance: f32,
    pub use_variance_guidance: bool,
    pub adaptive_kernel: bool,
}

impl Default for SvgfSettings {
    fn default() -> Self {
        Self {
            temporal_accumulation: true,
            temporal_alpha: 0.1,
            temporal_max_m: 32,
            temporal_depth_threshold: 0.05,
            temporal_normal_threshold: 0.95,
            variance_kernel_size: 3,
            variance_boost: 1.0,
            wavelet_iterations: 5,
            phi_color: 10.0,
            phi_normal: 128.0,
            phi_depth: 1.0,
            sigma_luminance: 4.0,
            use_variance_guidance: true,
            adaptive_kernel: true,
        }
    }
}

bitflags::bitflags! {
    #[repr(C)]
    #[derive(Debug, Clone, Copy, NoUninit)]
    struct SvgfFlags: u32 {
        const TEMPORAL_DISABLED = 1 << 0;
        const VARIANCE_GUIDANCE = 1 << 1;
        const ADAPTIVE_KERNEL = 1 << 2;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct SvgfPush {
    alpha: f32,
    temporal_max_m: f32,
    depth_threshold: f32,
    normal_threshold: f32,
    kernel_radius: u32,
    variance_boost: f32,
    iteration: u32,
    phi_color: f32,
    phi_normal: f32,
    phi_depth: f32,
    sigma_luminance: f32,
    flags: u32,
}

impl SvgfPush {
    fn new(settings: &SvgfSettings, iteration: u32) -> Self {
        let mut flags = SvgfFlags::empty();
        flags.set(SvgfFlags::TEMPORAL_DISABLED, !settings.temporal_accumulation);
        flags.set(SvgfFlags::VARIANCE_GUIDANCE, settings.use_variance_guidance);
        flags.set(SvgfFlags::ADAPTIVE_KERNEL, settings.adaptive_kernel);

        Self {
            alpha: settings.temporal_alpha,
            temporal_max_m: settings.temporal_max_m.max(1) as f32,
            depth_threshold: settings.temporal_depth_threshold,
            normal_threshold: settings.temporal_normal_threshold,
            kernel_radius: (settings.variance_kernel_size.max(1) / 2).max(1),
            variance_boost: settings.variance_boost,
            iteration,
            phi_color: settings.phi_color,
            phi_normal: settings.phi_normal,
            phi_depth: settings.phi_depth,
            sigma_luminance: settings.sigma_luminance,
            flags: flags.bits(),
        }
    }
}

const PUSH_SIZE: u32 = std::mem::size_of::<SvgfPush>() as u32;

const TEMPORAL_KERNEL: KernelDesc = KernelDesc {
    name: "svgf_temporal",
    entry_point: "main",
    bindings: &[
        Slot::Texture { filterable: true },  // noisy illumination
        Slot::Texture { filterable: true },  // normal
        Slot::Texture { filterable: false }, // depth
        Slot::Texture { filterable: true },  // motion
        Slot::Texture { filterable: true },  // previous normal
        Slot::Texture { filterable: false }, // previous depth
        Slot::Texture { filterable: true },  // previous color
        Slot::Texture { filterable: false }, // previous moments + history
        Slot::StorageImage {
            format: resources::COLOR_BUFFER_FORMAT,
        },
        Slot::StorageImage {
            format: resources::MOMENTS_FORMAT,
        },
        Slot::Storage { read_only: false }, // stats
    ],
    push_constant_size: PUSH_SIZE,
};

const VARIANCE_KERNEL: KernelDesc = KernelDesc {
    name: "svgf_variance",
    entry_point: "main",
    bindings: &[
        Slot::Texture { filterable: true },  // accumulated color
        Slot::Texture { filterable: false }, // moments + history
        Slot::Texture { filterable: true },  // normal
        Slot::Texture { filterable: false }, // depth
        Slot::StorageImage {
            format: resources::VARIANCE_FORMAT,
        },
    ],
    push_constant_size: PUSH_SIZE,
};

const WAVELET_KERNEL: KernelDesc = KernelDesc {
    name: "svgf_wavelet",
    entry_point: "main",
    bindings: &[
        Slot::Texture { filterable: true },  // filter input
        Slot::Texture { filterable: false }, // variance
        Slot::Texture { filterable: false }, // moments + history
        Slot::Texture { filterable: true },  // normal
        Slot::Texture { filterable: false }, // depth
        Slot::StorageImage {
            format: resources::COLOR_BUFFER_FORMAT,
        },
    ],
    push_constant_size: PUSH_SIZE,
};

const MODULATE_KERNEL: KernelDesc = KernelDesc {
    name: "svgf_modulate",
    entry_point: "main",
    bindings: &[
        Slot::Texture { filterable: true },  // filtered illumination
        Slot::Texture { filterable: false }, // albedo
        Slot::StorageImage {
            format: resources::OUTPUT_FORMAT,
        },
    ],
    push_constant_size: PUSH_SIZE,
};

struct AccumTarget {
    color: RenderTarget,
    moments: RenderTarget,
}

/// Spatiotemporal variance-guided filtering.
///
/// Reconstructs a smooth image from the one-sample-per-pixel restir output:
/// temporal accumulation with reprojection, variance estimation from the
/// accumulated luminance moments (or a spatial neighborhood while history is
/// short), a few a-trous wavelet iterations with edge-stopping weights, and
/// a final modulation by albedo. The history length per pixel rides in the
/// z channel of the moments target.
pub struct SvgfPhase {
    temporal: Kernel,
    variance: Kernel,
    wavelet: Kernel,
    modulate: Kernel,
    accum: PingPong<AccumTarget>,
    variance_target: RenderTarget,
    filter: PingPong<RenderTarget>,
    pub settings: SvgfSettings,
}

impl SvgfPhase {
    pub fn new(
        context: &mut Context,
        const_layout: &wgpu::BindGroupLayout,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let temporal = Kernel::new(
            context,
            const_layout,
            &TEMPORAL_KERNEL,
            include_str!("shaders/svgf_temporal.wgsl"),
            "shaders/svgf_temporal.wgsl",
            &[],
        )?;
        let variance = Kernel::new(
            context,
            const_layout,
            &VARIANCE_KERNEL,
            include_str!("shaders/svgf_variance.wgsl"),
            "shaders/svgf_variance.wgsl",
            &[],
        )?;
        let wavelet = Kernel::new(
            context,
            const_layout,
            &WAVELET_KERNEL,
            include_str!("shaders/svgf_wavelet.wgsl"),
            "shaders/svgf_wavelet.wgsl",
            &[],
        )?;
        let modulate = Kernel::new(
            context,
            const_layout,
            &MODULATE_KERNEL,
            include_str!("shaders/svgf_modulate.wgsl"),
            "shaders/svgf_modulate.wgsl",
            &[],
        )?;

        let (accum, variance_target, filter) = create_targets(context, width, height)?;

        Ok(Self {
            temporal,
            variance,
            wavelet,
            modulate,
            accum,
            variance_target,
            filter,
            settings: SvgfSettings::default(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &mut self,
        context: &Context,
        encoder: &mut wgpu::CommandEncoder,
        const_bind_group: &wgpu::BindGroup,
        noisy: &wgpu::TextureView,
        gbuffer: &GBufferViews,
        prev_normal: &wgpu::TextureView,
        prev_depth: &wgpu::TextureView,
        stats: &wgpu::Buffer,
        output: &wgpu::TextureView,
        width: u32,
        height: u32,
        profiler: &GpuProfiler,
    ) -> Result<()> {
        let (groups_x, groups_y) = kernel::image_groups(width, height);
        let push = SvgfPush::new(&self.settings, 0);

        self.accum.flip();

        // 1. Temporal accumulation.
        {
            let bind_group = self.temporal.bind(
                context,
                &[
                    BindingResource::TextureView(noisy),
                    BindingResource::TextureView(&gbuffer.normal),
                    BindingResource::TextureView(&gbuffer.depth),
                    BindingResource::TextureView(&gbuffer.motion),
                    BindingResource::TextureView(prev_normal),
                    BindingResource::TextureView(prev_depth),
                    BindingResource::TextureView(&self.accum.previous().color.view),
                    BindingResource::TextureView(&self.accum.previous().moments.view),
                    BindingResource::TextureView(&self.accum.current().color.view),
                    BindingResource::TextureView(&self.accum.current().moments.view),
                    BindingResource::Buffer(stats.as_entire_buffer_binding()),
                ],
            )?;

            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("svgf temporal"),
            });
            compute_pass.set_pipeline(self.temporal.pipeline());
            compute_pass.set_push_constants(0, bytemuck::bytes_of(&push));
            compute_pass.set_bind_group(0, const_bind_group, &[]);
            compute_pass.set_bind_group(1, &bind_group, &[]);
            compute_pass.dispatch_workgroups(groups_x, groups_y, 1);
        }
        profiler.stamp(encoder, Stamp::AfterSvgfTemporal);

        // 2. Variance estimation.
        {
            let bind_group = self.variance.bind(
                context,
                &[
                    BindingResource::TextureView(&self.accum.current().color.view),
                    BindingResource::TextureView(&self.accum.current().moments.view),
                    BindingResource::TextureView(&gbuffer.normal),
                    BindingResource::TextureView(&gbuffer.depth),
                    BindingResource::TextureView(&self.variance_target.view),
                ],
            )?;

            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("svgf variance"),
            });
            compute_pass.set_pipeline(self.variance.pipeline());
            compute_pass.set_push_constants(0, bytemuck::bytes_of(&push));
            compute_pass.set_bind_group(0, const_bind_group, &[]);
            compute_pass.set_bind_group(1, &bind_group, &[]);
            compute_pass.dispatch_workgroups(groups_x, groups_y, 1);
        }
        profiler.stamp(encoder, Stamp::AfterSvgfVariance);

        // 3. A-trous wavelet iterations. Stride doubles every pass; one
        // selector advances once per iteration.
        self.filter.reset();
        for iteration in 0..self.settings.wavelet_iterations {
            let push = SvgfPush::new(&self.settings, iteration);

            let input = if iteration == 0 {
                &self.accum.current().color.view
            } else {
                &self.filter.previous().view
            };

            let bind_group = self.wavelet.bind(
                context,
                &[
                    BindingResource::TextureView(input),
                    BindingResource::TextureView(&self.variance_target.view),
                    BindingResource::TextureView(&self.accum.current().moments.view),
                    BindingResource::TextureView(&gbuffer.normal),
                    BindingResource::TextureView(&gbuffer.depth),
                    BindingResource::TextureView(&self.filter.current().view),
                ],
            )?;

            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("svgf wavelet"),
            });
            compute_pass.set_pipeline(self.wavelet.pipeline());
            compute_pass.set_push_constants(0, bytemuck::bytes_of(&push));
            compute_pass.set_bind_group(0, const_bind_group, &[]);
            compute_pass.set_bind_group(1, &bind_group, &[]);
            compute_pass.dispatch_workgroups(groups_x, groups_y, 1);
            drop(compute_pass);

            self.filter.flip();
        }
        profiler.stamp(encoder, Stamp::AfterSvgfWavelet);

        // 4. Modulation by albedo into the caller's output.
        {
            let filtered = if self.settings.wavelet_iterations == 0 {
                &self.accum.current().color.view
            } else {
                &self.filter.previous().view
            };

            let bind_group = self.modulate.bind(
                context,
                &[
                    BindingResource::TextureView(filtered),
                    BindingResource::TextureView(&gbuffer.albedo),
                    BindingResource::TextureView(output),
                ],
            )?;

            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("svgf modulate"),
            });
            compute_pass.set_pipeline(self.modulate.pipeline());
            compute_pass.set_push_constants(0, bytemuck::bytes_of(&push));
            compute_pass.set_bind_group(0, const_bind_group, &[]);
            compute_pass.set_bind_group(1, &bind_group, &[]);
            compute_pass.dispatch_workgroups(groups_x, groups_y, 1);
        }
        profiler.stamp(encoder, Stamp::AfterSvgfModulate);

        Ok(())
    }

    /// Clears the accumulated color, moments and history length. Clearing an
    /// already-cleared history is a no-op, so back-to-back resets behave the
    /// same as one.
    #[allow(clippy::too_many_arguments)]
    pub fn record_reset(
        &mut self,
        context: &Context,
        encoder: &mut wgpu::CommandEncoder,
        const_bind_group: &wgpu::BindGroup,
        clear: &ClearPhase,
        width: u32,
        height: u32,
    ) -> Result<()> {
        for target in self.accum.both() {
            clear.record_color(
                context,
                encoder,
                const_bind_group,
                &target.color.view,
                width,
                height,
            )?;
            clear.record_moments(
                context,
                encoder,
                const_bind_group,
                &target.moments.view,
                width,
                height,
            )?;
        }
        self.accum.reset();
        self.filter.reset();
        Ok(())
    }

    pub fn resize(&mut self, context: &Context, width: u32, height: u32) -> Result<()> {
        let (accum, variance_target, filter) = create_targets(context, width, height)?;
        self.accum = accum;
        self.variance_target = variance_target;
        self.filter = filter;
        Ok(())
    }

    /// Moments target of the most recent frame; history length in `z`.
    pub fn moments(&self) -> &RenderTarget {
        &self.accum.current().moments
    }

    pub fn variance(&self) -> &RenderTarget {
        &self.variance_target
    }
}

fn create_targets(
    context: &Context,
    width: u32,
    height: u32,
) -> Result<(PingPong<AccumTarget>, RenderTarget, PingPong<RenderTarget>)> {
    let accum_usage = wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::STORAGE_BINDING;

    let accum_target = |context: &Context| -> Result<AccumTarget> {
        Ok(AccumTarget {
            color: RenderTarget::new(
                context,
                "svgf accumulated color",
                width,
                height,
                resources::COLOR_BUFFER_FORMAT,
                accum_usage,
            )?,
            moments: RenderTarget::new(
                context,
                "svgf moments",
                width,
                height,
                resources::MOMENTS_FORMAT,
                accum_usage | wgpu::TextureUsages::COPY_SRC,
            )?,
        })
    };

    let accum = PingPong::new(accum_target(context)?, accum_target(context)?);

    let variance_target = RenderTarget::new(
        context,
        "svgf variance",
        width,
        height,
        resources::VARIANCE_FORMAT,
        accum_usage,
    )?;

    let filter = PingPong::new(
        RenderTarget::new(
            context,
            "svgf filter buffer",
            width,
            height,
            resources::COLOR_BUFFER_FORMAT,
            accum_usage,
        )?,
        RenderTarget::new(
            context,
            "svgf filter buffer",
            width,
            height,
            resources::COLOR_BUFFER_FORMAT,
            accum_usage,
        )?,
    );

    Ok((accum, variance_target, filter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_match_the_documented_targets() {
        let settings = SvgfSettings::default();
        assert!((settings.temporal_alpha - 0.1).abs() < f32::EPSILON);
        assert_eq!(settings.temporal_max_m, 32);
        assert_eq!(settings.variance_kernel_size, 3);
        assert_eq!(settings.wavelet_iterations, 5);
        assert!((settings.phi_normal - 128.0).abs() < f32::EPSILON);
        assert!((settings.sigma_luminance - 4.0).abs() < f32::EPSILON);
    }

    #[test]
    fn push_constants_fit_the_declared_range() {
        assert_eq!(std::mem::size_of::<SvgfPush>() as u32, PUSH_SIZE);
        assert!(PUSH_SIZE <= 128);
    }

    /// Cpu mirror of the wavelet weight product at the center tap; mirrors
    /// `shaders/svgf_wavelet.wgsl`.
    #[test]
    fn center_tap_weight_is_never_zero() {
        let b3 = [1.0 / 16.0, 1.0 / 4.0, 3.0 / 8.0, 1.0 / 4.0, 1.0 / 16.0];
        let center = b3[2] * b3[2];

        // At the center tap every edge-stopping term evaluates to one:
        // exp(0) for luminance and depth, dot(n, n)^phi = 1 for the normal.
        let luminance_weight = (0.0f32).exp();
        let normal_weight = 1.0f32.powf(128.0);
        let depth_weight = (0.0f32).exp();
        let weight = center * luminance_weight * normal_weight * depth_weight;

        assert!(weight >= 0.14 && weight <= 0.145);
    }

    #[test]
    fn blend_factor_follows_history() {
        let alpha: f32 = 0.1;
        // Young history: the new sample dominates.
        let a0 = (1.0f32 / (0.0 + 1.0)).max(alpha);
        assert_eq!(a0, 1.0);
        // Converged history: the floor wins.
        let a32 = (1.0f32 / (31.0 + 1.0)).max(alpha);
        assert!((a32 - alpha).abs() < f32::EPSILON);
    }
}
