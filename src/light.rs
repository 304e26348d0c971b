use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};
use log::debug;

use crate::{
    context::Context,
    error::{Error, Result},
};

/// Upper bound on lights the store will upload; one storage buffer holds the
/// whole array.
pub const MAX_LIGHTS: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightKind {
    Point = 0,
    Spot = 1,
    Directional = 2,
}

/// Gpu light record: four 16-byte lanes.
///
/// - `position.xyz` with the falloff range in `.w`.
/// - `direction.xyz` with the cosine of the inner cone half-angle in `.w`.
/// - `color.rgb` with the intensity multiplier in `.a`.
/// - `params`: cosine of the outer cone half-angle, kind, enabled, reserved.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Light {
    position: Vec4,
    direction: Vec4,
    color: Vec4,
    params: Vec4,
}

impl Light {
    pub fn point(position: Vec3, color: Vec3, intensity: f32, range: f32) -> Self {
        debug_assert!(range > 0.0, "point lights need a positive range");
        Self {
            position: position.extend(range),
            direction: Vec4::new(0.0, -1.0, 0.0, 1.0),
            color: color.extend(intensity),
            params: Vec4::new(1.0, LightKind::Point as u32 as f32, 1.0, 0.0),
        }
    }

    pub fn spot(
        position: Vec3,
        direction: Vec3,
        color: Vec3,
        intensity: f32,
        range: f32,
        inner_angle: f32,
        outer_angle: f32,
    ) -> Self {
        debug_assert!(range > 0.0, "spot lights need a positive range");
        let inner_cos = inner_angle.min(outer_angle).cos();
        let outer_cos = outer_angle.max(inner_angle).cos();
        Self {
            position: position.extend(range),
            direction: direction.normalize_or_zero().extend(inner_cos),
            color: color.extend(intensity),
            params: Vec4::new(outer_cos, LightKind::Spot as u32 as f32, 1.0, 0.0),
        }
    }

    pub fn directional(direction: Vec3, color: Vec3, intensity: f32) -> Self {
        Self {
            position: Vec4::new(0.0, 0.0, 0.0, 1.0),
            direction: direction.normalize_or_zero().extend(1.0),
            color: color.extend(intensity),
            params: Vec4::new(1.0, LightKind::Directional as u32 as f32, 1.0, 0.0),
        }
    }

    pub fn kind(&self) -> LightKind {
        match self.params.y as u32 {
            1 => LightKind::Spot,
            2 => LightKind::Directional,
            _ => LightKind::Point,
        }
    }

    pub fn position(&self) -> Vec3 {
        self.position.truncate()
    }

    pub fn range(&self) -> f32 {
        self.position.w
    }

    pub fn direction(&self) -> Vec3 {
        self.direction.truncate()
    }

    pub fn is_enabled(&self) -> bool {
        self.params.z > 0.5
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.params.z = if enabled { 1.0 } else { 0.0 };
    }
}

/// Dense light array with free-slot recycling and dirty-flag upload.
///
/// The host mutates the store between frames only; the whole array goes to
/// one storage buffer when anything changed. Removed slots stay in the array
/// as disabled records until an add recycles them, so indices handed to the
/// host remain stable.
pub struct LightStore {
    lights: Vec<Light>,
    free: Vec<u32>,
    dirty: bool,
    buffer: Option<wgpu::Buffer>,
}

impl Default for LightStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LightStore {
    pub fn new() -> Self {
        Self {
            lights: Vec::new(),
            free: Vec::new(),
            dirty: true,
            buffer: None,
        }
    }

    /// Adds a light and returns its stable index.
    pub fn add(&mut self, light: Light) -> Result<u32> {
        self.dirty = true;

        if let Some(index) = self.free.pop() {
            self.lights[index as usize] = light;
            return Ok(index);
        }

        if self.lights.len() as u32 >= MAX_LIGHTS {
            return Err(Error::ResourceExhausted {
                what: "light store",
                size: u64::from(MAX_LIGHTS) * std::mem::size_of::<Light>() as u64,
            });
        }

        self.lights.push(light);
        Ok(self.lights.len() as u32 - 1)
    }

    pub fn update(&mut self, index: u32, light: Light) -> Result<()> {
        let len = self.lights.len() as u32;
        let slot = self
            .lights
            .get_mut(index as usize)
            .ok_or(Error::IndexOutOfRange { index, len })?;
        *slot = light;
        self.dirty = true;
        Ok(())
    }

    pub fn remove(&mut self, index: u32) -> Result<()> {
        let len = self.lights.len() as u32;
        let slot = self
            .lights
            .get_mut(index as usize)
            .ok_or(Error::IndexOutOfRange { index, len })?;
        slot.set_enabled(false);
        self.free.push(index);
        self.dirty = true;
        Ok(())
    }

    pub fn get(&self, index: u32) -> Option<&Light> {
        self.lights.get(index as usize)
    }

    pub fn clear(&mut self) {
        self.lights.clear();
        self.free.clear();
        self.dirty = true;
    }

    /// Number of occupied slots, recycled-but-disabled ones included. This is
    /// the length the kernels iterate.
    pub fn len(&self) -> u32 {
        self.lights.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.lights.is_empty()
    }

    pub fn enabled_count(&self) -> u32 {
        self.lights.iter().filter(|light| light.is_enabled()).count() as u32
    }

    pub fn lights(&self) -> &[Light] {
        &self.lights
    }

    /// Uploads the array if dirty and returns the backing buffer.
    pub(crate) fn upload(&mut self, context: &Context) -> Result<&wgpu::Buffer> {
        if self.buffer.is_none() {
            let size = u64::from(MAX_LIGHTS) * std::mem::size_of::<Light>() as u64;
            if size > context.limits.max_buffer_size {
                return Err(Error::ResourceExhausted {
                    what: "light buffer",
                    size,
                });
            }

            self.buffer = Some(context.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("light buffer"),
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
                size,
            }));
            self.dirty = true;
        }

        let buffer = self.buffer.as_ref().unwrap();
        if self.dirty && !self.lights.is_empty() {
            context
                .queue
                .write_buffer(buffer, 0, bytemuck::cast_slice(&self.lights));
            debug!("uploaded {} lights", self.lights.len());
        }
        self.dirty = false;

        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn light_record_is_four_lanes() {
        assert_eq!(std::mem::size_of::<Light>(), 64);
        assert_eq!(std::mem::align_of::<Light>() % 16, 0);
    }

    #[test]
    fn free_slots_are_recycled() {
        let mut store = LightStore::new();
        let a = store.add(Light::point(Vec3::ZERO, Vec3::ONE, 1.0, 5.0)).unwrap();
        let b = store.add(Light::point(Vec3::X, Vec3::ONE, 1.0, 5.0)).unwrap();
        assert_eq!((a, b), (0, 1));

        store.remove(a).unwrap();
        assert!(!store.get(a).unwrap().is_enabled());
        assert_eq!(store.enabled_count(), 1);

        let c = store
            .add(Light::directional(-Vec3::Y, Vec3::ONE, 2.0))
            .unwrap();
        assert_eq!(c, a, "removed slot is reused first");
        assert_eq!(store.len(), 2);
        assert_eq!(store.enabled_count(), 2);
    }

    #[test]
    fn update_and_remove_reject_bad_indices() {
        let mut store = LightStore::new();
        let light = Light::point(Vec3::ZERO, Vec3::ONE, 1.0, 5.0);
        store.add(light).unwrap();

        assert!(matches!(
            store.update(3, light),
            Err(Error::IndexOutOfRange { index: 3, len: 1 })
        ));
        assert!(matches!(store.remove(9), Err(Error::IndexOutOfRange { .. })));
    }

    #[test]
    fn spot_cone_cosines_are_ordered() {
        let spot = Light::spot(
            Vec3::ZERO,
            -Vec3::Y,
            Vec3::ONE,
            1.0,
            10.0,
            0.6,
            0.3,
        );
        // Inner cone cosine must never be below the outer one, even with the
        // angles passed in the wrong order.
        assert!(spot.direction.w >= spot.params.x);
    }
}
