use bytemuck::{NoUninit, Pod, Zeroable};
use serde::{Deserialize, Serialize};
use wgpu::BindingResource;

use crate::{
    context::Context,
    cull::CullPhase,
    error::Result,
    kernel::{self, Kernel, KernelDesc, Slot},
    profile::{GpuProfiler, Stamp},
    resources::{self, GBufferViews, PingPong, StorageBuffer},
};

/// Per-pixel reservoir for weighted reservoir sampling.
///
/// `light_index == -1` marks an empty reservoir. `w` is the normalized
/// contribution weight `weight_sum / (m * p_hat(selected))` and `m` the
/// effective sample count, clamped during temporal reuse.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Reservoir {
    pub light_index: i32,
    pub weight_sum: f32,
    pub w: f32,
    pub m: u32,
}

impl Reservoir {
    pub const EMPTY: Reservoir = Reservoir {
        light_index: -1,
        weight_sum: 0.0,
        w: 0.0,
        m: 0,
    };

    pub fn is_empty(&self) -> bool {
        self.light_index < 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestirSettings {
    /// Light candidates drawn per pixel during initial resampling.
    pub initial_candidates: u32,
    pub temporal_reuse: bool,
    /// Cap on the effective sample count after temporal merging. Bounds both
    /// bias accumulation and reaction latency.
    pub temporal_max_m: u32,
    pub temporal_depth_threshold: f32,
    pub temporal_normal_threshold: f32,
    pub spatial_iterations: u32,
    /// Neighbor search radius in pixels.
    pub spatial_radius: f32,
    pub spatial_samples: u32,
    pub spatial_discard_history: bool,
    /// Re-evaluate the target pdf at the receiving pixel for merged samples,
    /// restoring an unbiased estimator at some extra cost.
    pub bias_correction: bool,
    pub bias_ray_offset: f32,
}

impl Default for RestirSettings {
    fn default() -> Self {
        Self {
            initial_candidates: 32,
            temporal_reuse: true,
            temporal_max_m: 20,
            temporal_depth_threshold: 0.1,
            temporal_normal_threshold: 0.9,
            spatial_iterations: 3,
            spatial_radius: 30.0,
            spatial_samples: 5,
            spatial_discard_history: false,
            bias_correction: true,
            bias_ray_offset: 0.001,
        }
    }
}

bitflags::bitflags! {
    #[repr(C)]
    #[derive(Debug, Clone, Copy, NoUninit)]
    struct RestirFlags: u32 {
        const BIAS_CORRECTION = 1 << 0;
        const DISCARD_HISTORY = 1 << 1;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct RestirPush {
    candidates: u32,
    spatial_samples: u32,
    spatial_radius: f32,
    depth_threshold: f32,
    normal_threshold: f32,
    temporal_max_m: u32,
    flags: u32,
    iteration: u32,
    ray_offset: f32,
    padding: [u32; 3],
}

impl RestirPush {
    fn new(settings: &RestirSettings, iteration: u32) -> Self {
        let mut flags = RestirFlags::empty();
        flags.set(RestirFlags::BIAS_CORRECTION, settings.bias_correction);
        flags.set(RestirFlags::DISCARD_HISTORY, settings.spatial_discard_history);

        Self {
            candidates: settings.initial_candidates.max(1),
            spatial_samples: settings.spatial_samples,
            spatial_radius: settings.spatial_radius,
            depth_threshold: settings.temporal_depth_threshold,
            normal_threshold: settings.temporal_normal_threshold,
            temporal_max_m: settings.temporal_max_m.max(1),
            flags: flags.bits(),
            iteration,
            ray_offset: settings.bias_ray_offset,
            padding: [0; 3],
        }
    }
}

const PUSH_SIZE: u32 = std::mem::size_of::<RestirPush>() as u32;

const INITIAL_KERNEL: KernelDesc = KernelDesc {
    name: "restir_initial",
    entry_point: "main",
    bindings: &[
        Slot::Texture { filterable: false }, // position
        Slot::Texture { filterable: true },  // normal
        Slot::Texture { filterable: false }, // albedo
        Slot::Texture { filterable: false }, // depth
        Slot::Storage { read_only: true },   // cluster meta
        Slot::Storage { read_only: true },   // light indices
        Slot::Storage { read_only: true },   // lights
        Slot::Storage { read_only: false },  // reservoirs out
    ],
    push_constant_size: PUSH_SIZE,
};

const TEMPORAL_KERNEL: KernelDesc = KernelDesc {
    name: "restir_temporal",
    entry_point: "main",
    bindings: &[
        Slot::Texture { filterable: false }, // position
        Slot::Texture { filterable: true },  // normal
        Slot::Texture { filterable: false }, // albedo
        Slot::Texture { filterable: false }, // depth
        Slot::Texture { filterable: true },  // motion
        Slot::Texture { filterable: true },  // previous normal
        Slot::Texture { filterable: false }, // previous depth
        Slot::Storage { read_only: true },   // previous reservoirs
        Slot::Storage { read_only: false },  // current reservoirs
        Slot::Storage { read_only: true },   // lights
        Slot::Storage { read_only: false },  // stats
    ],
    push_constant_size: PUSH_SIZE,
};

const SPATIAL_KERNEL: KernelDesc = KernelDesc {
    name: "restir_spatial",
    entry_point: "main",
    bindings: &[
        Slot::Texture { filterable: false }, // position
        Slot::Texture { filterable: true },  // normal
        Slot::Texture { filterable: false }, // albedo
        Slot::Texture { filterable: false }, // depth
        Slot::Storage { read_only: true },   // reservoirs in
        Slot::Storage { read_only: false },  // reservoirs out
        Slot::Storage { read_only: true },   // lights
    ],
    push_constant_size: PUSH_SIZE,
};

const FINAL_KERNEL: KernelDesc = KernelDesc {
    name: "restir_final",
    entry_point: "main",
    bindings: &[
        Slot::Texture { filterable: false }, // position
        Slot::Texture { filterable: true },  // normal
        Slot::Texture { filterable: false }, // albedo
        Slot::Texture { filterable: false }, // depth
        Slot::Storage { read_only: true },   // reservoirs
        Slot::Storage { read_only: true },   // lights
        Slot::StorageImage {
            format: resources::COLOR_BUFFER_FORMAT,
        },
    ],
    push_constant_size: PUSH_SIZE,
};

/// Reservoir-based spatio-temporal importance resampling.
///
/// Four ordered sub-passes per frame, each in its own compute pass so prior
/// writes are visible downstream:
///
/// 1. Initial candidates: resampled importance sampling over the lights in
///    the pixel's cluster. Visibility is deliberately ignored here and
///    applied during final shading.
/// 2. Temporal reuse: merge with the reprojected previous-frame reservoir
///    when the surface passes the depth and normal similarity tests, then
///    clamp the sample count.
/// 3. Spatial reuse: a few iterations of merging with stratified disc
///    neighbors, ping-ponging between the two reservoir buffers.
/// 4. Final shading: evaluate the surviving sample with a screen-space
///    visibility probe and write demodulated illumination.
pub struct RestirPhase {
    initial: Kernel,
    temporal: Kernel,
    spatial: Kernel,
    shading: Kernel,
    reservoirs: PingPong<StorageBuffer>,
    pub settings: RestirSettings,
}

impl RestirPhase {
    pub fn new(
        context: &mut Context,
        const_layout: &wgpu::BindGroupLayout,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let initial = Kernel::new(
            context,
            const_layout,
            &INITIAL_KERNEL,
            include_str!("shaders/restir_initial.wgsl"),
            "shaders/restir_initial.wgsl",
            &[],
        )?;
        let temporal = Kernel::new(
            context,
            const_layout,
            &TEMPORAL_KERNEL,
            include_str!("shaders/restir_temporal.wgsl"),
            "shaders/restir_temporal.wgsl",
            &[],
        )?;
        let spatial = Kernel::new(
            context,
            const_layout,
            &SPATIAL_KERNEL,
            include_str!("shaders/restir_spatial.wgsl"),
            "shaders/restir_spatial.wgsl",
            &[],
        )?;
        let shading = Kernel::new(
            context,
            const_layout,
            &FINAL_KERNEL,
            include_str!("shaders/restir_final.wgsl"),
            "shaders/restir_final.wgsl",
            &[],
        )?;

        let reservoirs = create_reservoir_buffers(context, width, height)?;

        Ok(Self {
            initial,
            temporal,
            spatial,
            shading,
            reservoirs,
            settings: RestirSettings::default(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &mut self,
        context: &Context,
        encoder: &mut wgpu::CommandEncoder,
        const_bind_group: &wgpu::BindGroup,
        gbuffer: &GBufferViews,
        prev_normal: &wgpu::TextureView,
        prev_depth: &wgpu::TextureView,
        cull: &CullPhase,
        light_buffer: &wgpu::Buffer,
        stats: &wgpu::Buffer,
        output: &wgpu::TextureView,
        width: u32,
        height: u32,
        frame_index: u32,
        profiler: &GpuProfiler,
    ) -> Result<()> {
        let (groups_x, groups_y) = kernel::image_groups(width, height);
        let push = RestirPush::new(&self.settings, 0);

        // Hand last frame's reservoirs over to the previous slot.
        self.reservoirs.flip();

        // 1. Initial candidates.
        {
            let bind_group = self.initial.bind(
                context,
                &[
                    BindingResource::TextureView(&gbuffer.position),
                    BindingResource::TextureView(&gbuffer.normal),
                    BindingResource::TextureView(&gbuffer.albedo),
                    BindingResource::TextureView(&gbuffer.depth),
                    cull.cluster_meta().binding(),
                    cull.light_indices().binding(),
                    BindingResource::Buffer(light_buffer.as_entire_buffer_binding()),
                    self.reservoirs.current().binding(),
                ],
            )?;

            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("restir initial"),
            });
            compute_pass.set_pipeline(self.initial.pipeline());
            compute_pass.set_push_constants(0, bytemuck::bytes_of(&push));
            compute_pass.set_bind_group(0, const_bind_group, &[]);
            compute_pass.set_bind_group(1, &bind_group, &[]);
            compute_pass.dispatch_workgroups(groups_x, groups_y, 1);
        }
        profiler.stamp(encoder, Stamp::AfterRestirInitial);

        // 2. Temporal reuse. Skipped on the first frame after a reset; the
        // previous buffer holds nothing worth merging.
        if self.settings.temporal_reuse && frame_index > 0 {
            let bind_group = self.temporal.bind(
                context,
                &[
                    BindingResource::TextureView(&gbuffer.position),
                    BindingResource::TextureView(&gbuffer.normal),
                    BindingResource::TextureView(&gbuffer.albedo),
                    BindingResource::TextureView(&gbuffer.depth),
                    BindingResource::TextureView(&gbuffer.motion),
                    BindingResource::TextureView(prev_normal),
                    BindingResource::TextureView(prev_depth),
                    self.reservoirs.previous().binding(),
                    self.reservoirs.current().binding(),
                    BindingResource::Buffer(light_buffer.as_entire_buffer_binding()),
                    BindingResource::Buffer(stats.as_entire_buffer_binding()),
                ],
            )?;

            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("restir temporal"),
            });
            compute_pass.set_pipeline(self.temporal.pipeline());
            compute_pass.set_push_constants(0, bytemuck::bytes_of(&push));
            compute_pass.set_bind_group(0, const_bind_group, &[]);
            compute_pass.set_bind_group(1, &bind_group, &[]);
            compute_pass.dispatch_workgroups(groups_x, groups_y, 1);
        }
        profiler.stamp(encoder, Stamp::AfterRestirTemporal);

        // 3. Spatial reuse, ping-ponging between the two buffers.
        for iteration in 0..self.settings.spatial_iterations {
            let push = RestirPush::new(&self.settings, iteration);

            let bind_group = self.spatial.bind(
                context,
                &[
                    BindingResource::TextureView(&gbuffer.position),
                    BindingResource::TextureView(&gbuffer.normal),
                    BindingResource::TextureView(&gbuffer.albedo),
                    BindingResource::TextureView(&gbuffer.depth),
                    self.reservoirs.current().binding(),
                    self.reservoirs.previous().binding(),
                    BindingResource::Buffer(light_buffer.as_entire_buffer_binding()),
                ],
            )?;

            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("restir spatial"),
            });
            compute_pass.set_pipeline(self.spatial.pipeline());
            compute_pass.set_push_constants(0, bytemuck::bytes_of(&push));
            compute_pass.set_bind_group(0, const_bind_group, &[]);
            compute_pass.set_bind_group(1, &bind_group, &[]);
            compute_pass.dispatch_workgroups(groups_x, groups_y, 1);
            drop(compute_pass);

            self.reservoirs.flip();
        }
        profiler.stamp(encoder, Stamp::AfterRestirSpatial);

        // 4. Final shading.
        {
            let bind_group = self.shading.bind(
                context,
                &[
                    BindingResource::TextureView(&gbuffer.position),
                    BindingResource::TextureView(&gbuffer.normal),
                    BindingResource::TextureView(&gbuffer.albedo),
                    BindingResource::TextureView(&gbuffer.depth),
                    self.reservoirs.current().binding(),
                    BindingResource::Buffer(light_buffer.as_entire_buffer_binding()),
                    BindingResource::TextureView(output),
                ],
            )?;

            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("restir final"),
            });
            compute_pass.set_pipeline(self.shading.pipeline());
            compute_pass.set_push_constants(0, bytemuck::bytes_of(&push));
            compute_pass.set_bind_group(0, const_bind_group, &[]);
            compute_pass.set_bind_group(1, &bind_group, &[]);
            compute_pass.dispatch_workgroups(groups_x, groups_y, 1);
        }
        profiler.stamp(encoder, Stamp::AfterRestirFinal);

        Ok(())
    }

    /// Drops all reservoir history. The next frame starts from scratch.
    pub fn record_reset(&mut self, encoder: &mut wgpu::CommandEncoder) {
        for buffer in self.reservoirs.both() {
            encoder.clear_buffer(&buffer.buffer, 0, None);
        }
        self.reservoirs.reset();
    }

    pub fn resize(&mut self, context: &Context, width: u32, height: u32) -> Result<()> {
        self.reservoirs = create_reservoir_buffers(context, width, height)?;
        Ok(())
    }

    /// The buffer holding the most recently completed frame's reservoirs.
    pub fn reservoirs(&self) -> &StorageBuffer {
        self.reservoirs.current()
    }
}

fn create_reservoir_buffers(
    context: &Context,
    width: u32,
    height: u32,
) -> Result<PingPong<StorageBuffer>> {
    let size = u64::from(width) * u64::from(height) * std::mem::size_of::<Reservoir>() as u64;
    Ok(PingPong::new(
        StorageBuffer::new(context, "reservoir buffer", size)?,
        StorageBuffer::new(context, "reservoir buffer", size)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Cpu mirror of the reservoir math in `shaders/include/reservoir.wgsl`.
    struct CpuReservoir {
        inner: Reservoir,
    }

    impl CpuReservoir {
        fn new() -> Self {
            Self {
                inner: Reservoir::EMPTY,
            }
        }

        fn update(&mut self, light_index: i32, weight: f32, random: f32) -> bool {
            self.inner.weight_sum += weight;
            self.inner.m += 1;
            if weight > 0.0 && random * self.inner.weight_sum < weight {
                self.inner.light_index = light_index;
                return true;
            }
            false
        }

        fn merge(&mut self, other: &Reservoir, weight: f32, random: f32) {
            let m = self.inner.m;
            self.update(other.light_index, weight, random);
            self.inner.m = m + other.m;
        }

        fn finalize(&mut self, target_pdf: f32) {
            if self.inner.light_index < 0 || target_pdf <= 0.0 || self.inner.m == 0 {
                self.inner.w = 0.0;
            } else {
                self.inner.w = self.inner.weight_sum / (self.inner.m as f32 * target_pdf);
            }
        }
    }

    /// Deterministic lcg for the statistical tests.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> f32 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((self.0 >> 33) as f32) / (1u64 << 31) as f32
        }
    }

    #[test]
    fn reservoir_record_is_sixteen_bytes() {
        assert_eq!(std::mem::size_of::<Reservoir>(), 16);
    }

    #[test]
    fn empty_reservoir_has_sentinel_index() {
        assert!(Reservoir::EMPTY.is_empty());
        assert_eq!(Reservoir::EMPTY.m, 0);
    }

    #[test]
    fn uniform_candidates_normalize_exactly() {
        let mut rng = Lcg(7);
        let mut reservoir = CpuReservoir::new();

        // All candidates share target pdf 2.0 drawn from a uniform source
        // over 8 lights, so every update weight is 2.0 * 8.
        let target = 2.0;
        let weight = target * 8.0;
        for index in 0..32 {
            rng.next();
            reservoir.update(index, weight, rng.next());
        }
        reservoir.finalize(target);

        assert_eq!(reservoir.inner.m, 32);
        // W = weight_sum / (M * p_hat) = (32 * 16) / (32 * 2) = 8.
        assert!((reservoir.inner.w - 8.0).abs() < 1e-5);
    }

    #[test]
    fn selection_probability_tracks_weights() {
        // One candidate carries 3x the weight of the other; over many seeded
        // runs it must be selected roughly 3/4 of the time.
        let mut wins = 0;
        let runs = 4000;
        let mut rng = Lcg(42);

        for _ in 0..runs {
            let mut reservoir = CpuReservoir::new();
            reservoir.update(0, 1.0, rng.next());
            reservoir.update(1, 3.0, rng.next());
            if reservoir.inner.light_index == 1 {
                wins += 1;
            }
        }

        let rate = wins as f32 / runs as f32;
        assert!((rate - 0.75).abs() < 0.03, "selection rate {rate}");
    }

    #[test]
    fn temporal_merge_then_clamp_bounds_m() {
        let settings = RestirSettings::default();
        let mut rng = Lcg(3);

        // Simulate the per-frame loop: K fresh candidates merged with the
        // clamped history, exactly as restir_temporal.wgsl does it.
        let mut history = Reservoir::EMPTY;
        let mut plateau = Vec::new();

        for _ in 0..12 {
            let mut current = CpuReservoir::new();
            for index in 0..settings.initial_candidates {
                current.update(index as i32, 4.0, rng.next());
            }
            if !history.is_empty() {
                let weight = history.weight_sum;
                current.merge(&history, weight, rng.next());
            }
            current.inner.m = current.inner.m.min(settings.temporal_max_m);
            current.finalize(4.0 / 32.0);

            history = current.inner;
            plateau.push(history.m);
        }

        assert!(plateau.iter().all(|&m| m <= settings.temporal_max_m));
        assert_eq!(*plateau.last().unwrap(), settings.temporal_max_m);
    }

    #[test]
    fn default_settings_match_the_documented_targets() {
        let settings = RestirSettings::default();
        assert_eq!(settings.initial_candidates, 32);
        assert_eq!(settings.temporal_max_m, 20);
        assert_eq!(settings.spatial_iterations, 3);
        assert_eq!(settings.spatial_samples, 5);
        assert!((settings.spatial_radius - 30.0).abs() < f32::EPSILON);
        assert!(settings.bias_correction);
    }

    #[test]
    fn push_constants_fit_the_declared_range() {
        assert_eq!(std::mem::size_of::<RestirPush>() as u32, PUSH_SIZE);
        assert!(PUSH_SIZE <= 128);
    }
}
