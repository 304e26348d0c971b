use glam::{Mat4, Vec3};

/// Camera description consumed by the pipeline each frame.
///
/// The pipeline never drives the camera; the host hands over the view and
/// projection it rasterized the g-buffer with, plus the linear depth range.
#[derive(Debug, Clone, Copy)]
pub struct Camera {
    pub view: Mat4,
    pub proj: Mat4,
    pub z_near: f32,
    pub z_far: f32,
}

impl Camera {
    pub const UP: Vec3 = Vec3::Y;

    pub fn new(view: Mat4, proj: Mat4, z_near: f32, z_far: f32) -> Self {
        Self {
            view,
            proj,
            z_near,
            z_far,
        }
    }

    /// Convenience constructor for a right-handed perspective camera.
    pub fn perspective(
        pos: Vec3,
        target: Vec3,
        fov_y: f32,
        aspect_ratio: f32,
        z_near: f32,
        z_far: f32,
    ) -> Self {
        Self {
            view: Mat4::look_at_rh(pos, target, Self::UP),
            proj: Mat4::perspective_rh(fov_y, aspect_ratio, z_near, z_far),
            z_near,
            z_far,
        }
    }

    pub fn proj_view(&self) -> Mat4 {
        self.proj * self.view
    }

    pub fn position(&self) -> Vec3 {
        self.view.inverse().col(3).truncate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_inverts_the_view_matrix() {
        let pos = Vec3::new(1.0, 2.0, 3.0);
        let camera = Camera::perspective(pos, Vec3::ZERO, 1.0, 16.0 / 9.0, 0.1, 100.0);
        assert!((camera.position() - pos).length() < 1e-4);
    }
}
