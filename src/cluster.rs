use bytemuck::{Pod, Zeroable};
use glam::{Mat4, UVec3, Vec2, Vec3, Vec4};
use log::debug;

use crate::{
    camera::Camera,
    context::Context,
    error::{Error, Result},
};

pub const DEFAULT_GRID_DIM: UVec3 = UVec3::new(16, 9, 24);

/// Cap on `gridX * gridY * gridZ`.
pub const MAX_CLUSTER_COUNT: u32 = 1 << 20;

/// View-space bounding box of one cluster.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ClusterAabb {
    pub min: Vec4,
    pub max: Vec4,
}

/// Subdivision of the view frustum into a 3d grid of clusters.
///
/// Screen-space x/y slices are uniform in ndc. Depth slices are exponential,
///
/// ```text
/// z_k = near * (far / near)^(k / gridZ)
/// ```
///
/// which keeps the cluster count per screen area roughly constant with
/// distance. Each cluster's view-space aabb is the hull of the 8 corners
/// found by unprojecting the 4 screen-corner rays to the two bounding depth
/// slices. The aabbs are built on the cpu, uploaded once, and cached until
/// the viewport, depth range or projection changes.
pub struct ClusterGrid {
    dim: UVec3,
    aabbs: Vec<ClusterAabb>,
    buffer: wgpu::Buffer,
    key: GridKey,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct GridKey {
    width: u32,
    height: u32,
    z_near: f32,
    z_far: f32,
    inv_proj: Mat4,
}

impl GridKey {
    fn new(width: u32, height: u32, camera: &Camera) -> Self {
        Self {
            width,
            height,
            z_near: camera.z_near,
            z_far: camera.z_far,
            inv_proj: camera.proj.inverse(),
        }
    }
}

impl ClusterGrid {
    pub fn new(
        context: &Context,
        dim: UVec3,
        width: u32,
        height: u32,
        camera: &Camera,
    ) -> Result<Self> {
        validate_dim(dim)?;

        let key = GridKey::new(width, height, camera);
        let aabbs = build_aabbs(dim, key.inv_proj, camera.z_near, camera.z_far);

        let size = (aabbs.len() * std::mem::size_of::<ClusterAabb>()) as u64;
        if size > u64::from(context.limits.max_storage_buffer_binding_size) {
            return Err(Error::ResourceExhausted {
                what: "cluster aabb buffer",
                size,
            });
        }

        let buffer = context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("cluster aabb buffer"),
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
            size,
        });
        context
            .queue
            .write_buffer(&buffer, 0, bytemuck::cast_slice(&aabbs));

        debug!(
            "built cluster grid {}x{}x{} ({} clusters)",
            dim.x,
            dim.y,
            dim.z,
            aabbs.len()
        );

        Ok(Self {
            dim,
            aabbs,
            buffer,
            key,
        })
    }

    pub fn dim(&self) -> UVec3 {
        self.dim
    }

    pub fn cluster_count(&self) -> u32 {
        self.dim.x * self.dim.y * self.dim.z
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn aabbs(&self) -> &[ClusterAabb] {
        &self.aabbs
    }

    /// Rebuilds and re-uploads the aabbs when the viewport, depth range or
    /// projection changed since the last frame.
    pub fn update(&mut self, context: &Context, width: u32, height: u32, camera: &Camera) {
        let key = GridKey::new(width, height, camera);
        if key == self.key {
            return;
        }

        self.aabbs = build_aabbs(self.dim, key.inv_proj, camera.z_near, camera.z_far);
        context
            .queue
            .write_buffer(&self.buffer, 0, bytemuck::cast_slice(&self.aabbs));
        self.key = key;

        debug!("cluster grid invalidated, rebuilt {} aabbs", self.aabbs.len());
    }
}

fn validate_dim(dim: UVec3) -> Result<()> {
    let product = u64::from(dim.x) * u64::from(dim.y) * u64::from(dim.z);
    if dim.x == 0 || dim.y == 0 || dim.z == 0 || product > u64::from(MAX_CLUSTER_COUNT) {
        return Err(Error::InvalidGrid {
            dim,
            max: MAX_CLUSTER_COUNT,
        });
    }
    Ok(())
}

/// Depth of slice boundary `k` out of `slices`.
pub fn slice_depth(z_near: f32, z_far: f32, k: u32, slices: u32) -> f32 {
    z_near * (z_far / z_near).powf(k as f32 / slices as f32)
}

fn build_aabbs(dim: UVec3, inv_proj: Mat4, z_near: f32, z_far: f32) -> Vec<ClusterAabb> {
    let mut aabbs = Vec::with_capacity((dim.x * dim.y * dim.z) as usize);

    for z in 0..dim.z {
        let slice_near = slice_depth(z_near, z_far, z, dim.z);
        let slice_far = slice_depth(z_near, z_far, z + 1, dim.z);

        for y in 0..dim.y {
            for x in 0..dim.x {
                let ndc_min = Vec2::new(
                    x as f32 / dim.x as f32 * 2.0 - 1.0,
                    y as f32 / dim.y as f32 * 2.0 - 1.0,
                );
                let ndc_max = Vec2::new(
                    (x + 1) as f32 / dim.x as f32 * 2.0 - 1.0,
                    (y + 1) as f32 / dim.y as f32 * 2.0 - 1.0,
                );

                let corners = [
                    ndc_min,
                    Vec2::new(ndc_max.x, ndc_min.y),
                    Vec2::new(ndc_min.x, ndc_max.y),
                    ndc_max,
                ];

                let mut min = Vec3::splat(f32::MAX);
                let mut max = Vec3::splat(f32::MIN);

                for ndc in corners {
                    let ray = unproject_ray(inv_proj, ndc);
                    for depth in [slice_near, slice_far] {
                        // Scale the ray to the z = -depth plane; the camera
                        // looks down negative z in view space.
                        let t = depth / -ray.z;
                        let corner = ray * t;
                        min = min.min(corner);
                        max = max.max(corner);
                    }
                }

                aabbs.push(ClusterAabb {
                    min: min.extend(0.0),
                    max: max.extend(0.0),
                });
            }
        }
    }

    aabbs
}

/// View-space point on the ray through the given ndc coordinate.
fn unproject_ray(inv_proj: Mat4, ndc: Vec2) -> Vec3 {
    let clip = Vec4::new(ndc.x, ndc.y, 1.0, 1.0);
    let view = inv_proj * clip;
    view.truncate() / view.w
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    fn test_proj() -> Mat4 {
        Mat4::perspective_rh(FRAC_PI_2, 1.0, 0.1, 10.0)
    }

    #[test]
    fn slice_boundaries_span_the_depth_range() {
        let slices = 24;
        assert!((slice_depth(0.1, 10.0, 0, slices) - 0.1).abs() < 1e-6);
        assert!((slice_depth(0.1, 10.0, slices, slices) - 10.0).abs() < 1e-4);

        for k in 0..slices {
            let near = slice_depth(0.1, 10.0, k, slices);
            let far = slice_depth(0.1, 10.0, k + 1, slices);
            assert!(far > near, "slices must be strictly increasing");
            // Exponential slicing keeps a constant ratio between boundaries.
            let ratio = far / near;
            let expected = (10.0f32 / 0.1).powf(1.0 / slices as f32);
            assert!((ratio - expected).abs() < 1e-4);
        }
    }

    #[test]
    fn single_cluster_covers_the_frustum() {
        let aabbs = build_aabbs(UVec3::ONE, test_proj().inverse(), 0.1, 10.0);
        assert_eq!(aabbs.len(), 1);

        let aabb = aabbs[0];
        // 90 degree vertical fov at aspect 1: the far plane is 20x20 units
        // at z = -10.
        assert!((aabb.min.z - -10.0).abs() < 1e-3);
        assert!((aabb.max.z - -0.1).abs() < 1e-5);
        assert!((aabb.min.x - -10.0).abs() < 1e-3);
        assert!((aabb.max.x - 10.0).abs() < 1e-3);
        assert!((aabb.min.y - -10.0).abs() < 1e-3);
        assert!((aabb.max.y - 10.0).abs() < 1e-3);
    }

    #[test]
    fn neighboring_clusters_tile_without_gaps() {
        let dim = UVec3::new(2, 2, 2);
        let aabbs = build_aabbs(dim, test_proj().inverse(), 0.1, 10.0);
        assert_eq!(aabbs.len(), 8);

        // Clusters 0 and 1 share the x boundary on the first depth slice.
        assert!((aabbs[0].max.x - aabbs[1].min.x).abs() < 1e-4);
        // Clusters 0 and 2 share the y boundary.
        assert!((aabbs[0].max.y - aabbs[2].min.y).abs() < 1e-4);
        // The second slice starts where the first ends.
        assert!((aabbs[0].min.z - aabbs[4].max.z).abs() < 1e-4);
    }

    #[test]
    fn zero_and_oversized_grids_are_rejected() {
        assert!(matches!(
            validate_dim(UVec3::new(0, 9, 24)),
            Err(Error::InvalidGrid { .. })
        ));
        assert!(matches!(
            validate_dim(UVec3::new(16, 0, 24)),
            Err(Error::InvalidGrid { .. })
        ));
        assert!(matches!(
            validate_dim(UVec3::new(1 << 10, 1 << 10, 2)),
            Err(Error::InvalidGrid { .. })
        ));
        assert!(validate_dim(DEFAULT_GRID_DIM).is_ok());
        assert!(validate_dim(UVec3::new(1 << 10, 1 << 10, 1)).is_ok());
    }
}
