//! View frustum tests and light-volume scissor rectangles.

use glam::{Mat4, Vec3, Vec4, Vec4Swizzles};
use spartan_common::Rect;
use spartan_resources::Aabb;

/// Six inward-facing planes extracted from a view-projection matrix with a
/// [0, 1] depth range. `xyz` is the unit normal, `w` the distance term.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frustum {
    planes: [Vec4; 6],
}

impl Frustum {
    pub fn from_view_projection(m: Mat4) -> Self {
        let (r0, r1, r2, r3) = (m.row(0), m.row(1), m.row(2), m.row(3));
        let planes = [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r2, r3 - r2].map(|p| {
            let len = p.xyz().length();
            if len > f32::EPSILON { p / len } else { p }
        });
        Self { planes }
    }

    pub fn intersects_sphere(&self, center: Vec3, radius: f32) -> bool {
        self.planes
            .iter()
            .all(|p| p.xyz().dot(center) + p.w >= -radius)
    }

    /// Conservative box test: only rejects boxes entirely outside one plane.
    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        self.planes.iter().all(|p| {
            let n = p.xyz();
            let positive = Vec3::select(n.cmpge(Vec3::ZERO), aabb.max, aabb.min);
            n.dot(positive) + p.w >= 0.0
        })
    }
}

/// Screen rectangle covering a light's bounding sphere, clipped to `viewport`.
///
/// Returns the whole viewport when the sphere reaches behind the near plane,
/// and `None` when the sphere is outside the frustum or covers no pixels.
pub fn sphere_scissor(
    view_projection: Mat4,
    frustum: &Frustum,
    center: Vec3,
    radius: f32,
    viewport: Rect,
) -> Option<Rect> {
    if !frustum.intersects_sphere(center, radius) {
        return None;
    }

    let mut min = glam::Vec2::splat(f32::MAX);
    let mut max = glam::Vec2::splat(f32::MIN);
    for i in 0..8 {
        let corner = center
            + Vec3::new(
                if i & 1 == 0 { -radius } else { radius },
                if i & 2 == 0 { -radius } else { radius },
                if i & 4 == 0 { -radius } else { radius },
            );
        let clip = view_projection * corner.extend(1.0);
        if clip.w <= f32::EPSILON {
            return Some(viewport);
        }
        let ndc = clip.xy() / clip.w;
        min = min.min(ndc);
        max = max.max(ndc);
    }

    // NDC y points up, pixel rows point down.
    let w = viewport.width as f32;
    let h = viewport.height as f32;
    let x0 = ((min.x * 0.5 + 0.5) * w).floor().clamp(0.0, w);
    let x1 = ((max.x * 0.5 + 0.5) * w).ceil().clamp(0.0, w);
    let y0 = ((0.5 - max.y * 0.5) * h).floor().clamp(0.0, h);
    let y1 = ((0.5 - min.y * 0.5) * h).ceil().clamp(0.0, h);
    let rect = Rect::new(
        viewport.x + x0 as u32,
        viewport.y + y0 as u32,
        (x1 - x0) as u32,
        (y1 - y0) as u32,
    );
    (!rect.is_empty()).then_some(rect)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera() -> Mat4 {
        let projection = Mat4::perspective_rh(60f32.to_radians(), 1.0, 0.1, 100.0);
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        projection * view
    }

    #[test]
    fn sphere_in_front_is_visible() {
        let f = Frustum::from_view_projection(camera());
        assert!(f.intersects_sphere(Vec3::ZERO, 1.0));
        assert!(!f.intersects_sphere(Vec3::new(0.0, 0.0, 20.0), 1.0));
        assert!(!f.intersects_sphere(Vec3::new(0.0, 0.0, -200.0), 1.0));
    }

    #[test]
    fn aabb_behind_camera_is_culled() {
        let f = Frustum::from_view_projection(camera());
        let front = Aabb {
            min: Vec3::splat(-0.5),
            max: Vec3::splat(0.5),
        };
        let behind = Aabb {
            min: Vec3::new(-0.5, -0.5, 9.0),
            max: Vec3::new(0.5, 0.5, 10.0),
        };
        assert!(f.intersects_aabb(&front));
        assert!(!f.intersects_aabb(&behind));
    }

    #[test]
    fn scissor_is_clipped_to_viewport() {
        let vp = camera();
        let f = Frustum::from_view_projection(vp);
        let viewport = Rect::from_size(200, 200);

        let centered = sphere_scissor(vp, &f, Vec3::ZERO, 0.5, viewport).unwrap();
        assert!(centered.width < 200 && centered.height < 200);
        assert!(centered.x > 0 && centered.y > 0);

        let edge = sphere_scissor(vp, &f, Vec3::new(2.8, 0.0, 0.0), 0.5, viewport).unwrap();
        assert_eq!(edge.x + edge.width, 200);

        assert_eq!(
            sphere_scissor(vp, &f, Vec3::new(0.0, 0.0, 30.0), 1.0, viewport),
            None
        );
    }

    #[test]
    fn camera_inside_volume_covers_viewport() {
        let vp = camera();
        let f = Frustum::from_view_projection(vp);
        let viewport = Rect::from_size(64, 32);
        assert_eq!(
            sphere_scissor(vp, &f, Vec3::new(0.0, 0.0, 5.0), 3.0, viewport),
            Some(viewport)
        );
    }
}
