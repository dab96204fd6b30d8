use glam::{Mat4, Vec3};
use spartan_common::{Color, Rect};
use spartan_render::ViewInput;

/// Editor fly camera. Lives outside the scene, so moving it never marks the
/// world dirty.
pub struct FlyCamera {
    pub position: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    pub fov: f32,
    pub near: f32,
    pub far: f32,
    pub speed: f32,
    pub sensitivity: f32,
    pub clear_color: Color,
}

impl Default for FlyCamera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 4.0, 10.0),
            yaw: -90.0_f32.to_radians(),
            pitch: -20.0_f32.to_radians(),
            fov: 60.0_f32.to_radians(),
            near: 0.1,
            far: 1000.0,
            speed: 8.0,
            sensitivity: 0.003,
            clear_color: Color::rgb(0.05, 0.05, 0.08),
        }
    }
}

impl FlyCamera {
    pub fn forward(&self) -> Vec3 {
        Vec3::new(
            self.yaw.cos() * self.pitch.cos(),
            self.pitch.sin(),
            self.yaw.sin() * self.pitch.cos(),
        )
        .normalize()
    }

    pub fn right(&self) -> Vec3 {
        self.forward().cross(Vec3::Y).normalize()
    }

    /// Move along the camera axes. `axis` is (right, up, forward) in units
    /// of `speed * dt`.
    pub fn translate(&mut self, axis: Vec3, dt: f32) {
        let step = self.speed * dt;
        self.position += self.right() * axis.x * step;
        self.position.y += axis.y * step;
        self.position += self.forward() * axis.z * step;
    }

    pub fn rotate(&mut self, dx: f32, dy: f32) {
        self.yaw += dx * self.sensitivity;
        self.pitch -= dy * self.sensitivity;
        self.pitch = self.pitch.clamp(-89.0_f32.to_radians(), 89.0_f32.to_radians());
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.position + self.forward(), Vec3::Y)
    }

    pub fn projection_matrix(&self, aspect: f32) -> Mat4 {
        Mat4::perspective_rh(self.fov, aspect, self.near, self.far)
    }

    /// The view the renderer draws from, replacing the scene camera.
    pub fn view_input(&self, viewport: Rect) -> ViewInput {
        ViewInput {
            view: self.view_matrix(),
            projection: self.projection_matrix(viewport.aspect()),
            position: self.position,
            viewport,
            near: self.near,
            far: self.far,
            clear_color: self.clear_color,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_input_is_finite() {
        let cam = FlyCamera::default();
        let view = cam.view_input(Rect::from_size(1280, 720));
        assert!(view.view_projection().is_finite());
        assert_eq!(view.position, cam.position);
        assert_eq!(view.viewport.width, 1280);
    }

    #[test]
    fn moving_forward_closes_distance() {
        let mut cam = FlyCamera::default();
        let viewport = Rect::from_size(64, 64);
        let target = cam.position + cam.forward() * 20.0;
        let before = cam.view_input(viewport).view_depth(target);
        cam.translate(Vec3::Z, 1.0);
        let after = cam.view_input(viewport).view_depth(target);
        assert!((before - after - cam.speed).abs() < 1e-3);
    }

    #[test]
    fn pitch_is_clamped() {
        let mut cam = FlyCamera::default();
        cam.rotate(0.0, -1.0e6);
        assert!(cam.pitch <= 89.0_f32.to_radians());
        assert!(cam.forward().is_finite());
    }
}
