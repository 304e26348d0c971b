use std::sync::mpsc;

use log::debug;

use crate::context::Context;

/// Timestamp slots written once per frame, in this order.
#[derive(Debug, Clone, Copy)]
#[repr(u32)]
pub enum Stamp {
    FrameStart = 0,
    AfterCull = 1,
    AfterRestirInitial = 2,
    AfterRestirTemporal = 3,
    AfterRestirSpatial = 4,
    AfterRestirFinal = 5,
    AfterSvgfTemporal = 6,
    AfterSvgfVariance = 7,
    AfterSvgfWavelet = 8,
    AfterSvgfModulate = 9,
}

pub const STAMP_COUNT: u32 = 10;

/// Gpu timings of one frame, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameTimings {
    pub cull_ms: f32,
    pub restir_initial_ms: f32,
    pub restir_temporal_ms: f32,
    pub restir_spatial_ms: f32,
    pub restir_final_ms: f32,
    pub svgf_temporal_ms: f32,
    pub svgf_variance_ms: f32,
    pub svgf_wavelet_ms: f32,
    pub svgf_modulate_ms: f32,
    pub total_ms: f32,
}

impl FrameTimings {
    pub fn restir_ms(&self) -> f32 {
        self.restir_initial_ms
            + self.restir_temporal_ms
            + self.restir_spatial_ms
            + self.restir_final_ms
    }

    pub fn svgf_ms(&self) -> f32 {
        self.svgf_temporal_ms
            + self.svgf_variance_ms
            + self.svgf_wavelet_ms
            + self.svgf_modulate_ms
    }

    fn from_timestamps(stamps: &[u64], period_ns: f32) -> Self {
        let ms = |begin: usize, end: usize| -> f32 {
            stamps[end].saturating_sub(stamps[begin]) as f32 * period_ns / 1_000_000.0
        };

        Self {
            cull_ms: ms(0, 1),
            restir_initial_ms: ms(1, 2),
            restir_temporal_ms: ms(2, 3),
            restir_spatial_ms: ms(3, 4),
            restir_final_ms: ms(4, 5),
            svgf_temporal_ms: ms(5, 6),
            svgf_variance_ms: ms(6, 7),
            svgf_wavelet_ms: ms(7, 8),
            svgf_modulate_ms: ms(8, 9),
            total_ms: ms(0, 9),
        }
    }
}

/// One-shot mappable staging buffer with deferred harvest.
pub(crate) struct DeferredReadback {
    staging: wgpu::Buffer,
    size: u64,
    receiver: Option<mpsc::Receiver<Result<(), wgpu::BufferAsyncError>>>,
}

impl DeferredReadback {
    pub fn new(device: &wgpu::Device, label: &'static str, size: u64) -> Self {
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
            size,
        });

        Self {
            staging,
            size,
            receiver: None,
        }
    }

    pub fn staging(&self) -> &wgpu::Buffer {
        &self.staging
    }

    pub fn is_pending(&self) -> bool {
        self.receiver.is_some()
    }

    /// Kick off the map. Must run after the copy into the staging buffer was
    /// submitted.
    pub fn request(&mut self) {
        debug_assert!(self.receiver.is_none(), "readback already in flight");

        let (sender, receiver) = mpsc::channel();
        self.staging
            .slice(..self.size)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = sender.send(result);
            });
        self.receiver = Some(receiver);
    }

    /// Harvest the in-flight map, waiting for the gpu if needed. Returns
    /// `None` when no readback was requested or the map failed.
    pub fn take_blocking(&mut self, device: &wgpu::Device) -> Option<Vec<u8>> {
        let receiver = self.receiver.take()?;
        device.poll(wgpu::Maintain::Wait);

        match receiver.recv() {
            Ok(Ok(())) => {
                let slice = self.staging.slice(..self.size);
                let data = slice.get_mapped_range().to_vec();
                self.staging.unmap();
                Some(data)
            }
            _ => {
                debug!("deferred readback failed to map");
                None
            }
        }
    }
}

struct ProfilerSlot {
    query_set: wgpu::QuerySet,
    resolve: wgpu::Buffer,
    readback: DeferredReadback,
}

/// Ring of timestamp query sets indexed by frame parity.
///
/// Each frame writes its stamps into its own slot and resolves them at the
/// end of the command stream; the result is harvested one frame later, so
/// the steady-state loop never waits on a query that was issued this frame.
pub struct GpuProfiler {
    slots: Option<[ProfilerSlot; 2]>,
    period_ns: f32,
    parity: usize,
}

impl GpuProfiler {
    pub fn new(context: &Context, enabled: bool) -> Self {
        let supported = enabled && context.timestamps_supported;
        let slots = supported.then(|| {
            [0, 1].map(|_| {
                let query_set = context.device.create_query_set(&wgpu::QuerySetDescriptor {
                    label: Some("frame timestamps"),
                    ty: wgpu::QueryType::Timestamp,
                    count: STAMP_COUNT,
                });

                let size = u64::from(STAMP_COUNT) * 8;
                let resolve = context.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("timestamp resolve"),
                    usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
                    mapped_at_creation: false,
                    size,
                });

                ProfilerSlot {
                    query_set,
                    resolve,
                    readback: DeferredReadback::new(&context.device, "timestamp staging", size),
                }
            })
        });

        Self {
            slots,
            period_ns: context.queue.get_timestamp_period(),
            parity: 0,
        }
    }

    /// Advances to the next slot and harvests the previous frame's stamps.
    pub fn begin_frame(&mut self, context: &Context) -> Option<FrameTimings> {
        self.parity ^= 1;

        let slots = self.slots.as_mut()?;
        let previous = &mut slots[1 - self.parity];
        let data = previous.readback.take_blocking(&context.device)?;

        let stamps: Vec<u64> = bytemuck::cast_slice(&data).to_vec();
        Some(FrameTimings::from_timestamps(&stamps, self.period_ns))
    }

    pub fn stamp(&self, encoder: &mut wgpu::CommandEncoder, stamp: Stamp) {
        if let Some(slots) = &self.slots {
            encoder.write_timestamp(&slots[self.parity].query_set, stamp as u32);
        }
    }

    pub fn resolve(&self, encoder: &mut wgpu::CommandEncoder) {
        if let Some(slots) = &self.slots {
            let slot = &slots[self.parity];
            encoder.resolve_query_set(&slot.query_set, 0..STAMP_COUNT, &slot.resolve, 0);
            encoder.copy_buffer_to_buffer(
                &slot.resolve,
                0,
                slot.readback.staging(),
                0,
                u64::from(STAMP_COUNT) * 8,
            );
        }
    }

    /// Must run right after the frame's command buffer was submitted.
    pub fn after_submit(&mut self) {
        if let Some(slots) = &mut self.slots {
            let slot = &mut slots[self.parity];
            if !slot.readback.is_pending() {
                slot.readback.request();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timings_come_from_consecutive_stamp_pairs() {
        // 1 tick per nanosecond; stage n ends at n milliseconds.
        let stamps: Vec<u64> = (0..10).map(|n| n * 1_000_000).collect();
        let timings = FrameTimings::from_timestamps(&stamps, 1.0);

        assert!((timings.cull_ms - 1.0).abs() < 1e-6);
        assert!((timings.restir_ms() - 4.0).abs() < 1e-6);
        assert!((timings.svgf_ms() - 4.0).abs() < 1e-6);
        assert!((timings.total_ms - 9.0).abs() < 1e-6);
    }

    #[test]
    fn out_of_order_stamps_saturate_instead_of_wrapping() {
        let mut stamps: Vec<u64> = (0..10).map(|n| n * 1_000_000).collect();
        stamps[1] = stamps[2] + 1;
        let timings = FrameTimings::from_timestamps(&stamps, 1.0);
        assert_eq!(timings.restir_initial_ms, 0.0);
    }
}
