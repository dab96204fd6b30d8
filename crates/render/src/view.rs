//! The scene-to-renderer contract: what one frame draws and from where.

use bitflags::bitflags;
use glam::{Mat4, Vec3};
use spartan_common::{Color, EntityId, MaterialHandle, MeshHandle, Rect};
use spartan_ecs::{Camera, ComponentStore, LightKind};
use spartan_resources::ResourceCache;
use spartan_scene::Scene;

/// Camera state for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewInput {
    pub view: Mat4,
    pub projection: Mat4,
    /// Camera position in world space.
    pub position: Vec3,
    pub viewport: Rect,
    pub near: f32,
    pub far: f32,
    pub clear_color: Color,
}

impl ViewInput {
    /// View of `camera` mounted on an entity with world matrix `world`.
    pub fn from_camera(world: Mat4, camera: &Camera, viewport: Rect) -> Self {
        Self {
            view: world.inverse(),
            projection: camera.projection.matrix(viewport.aspect()),
            position: world.w_axis.truncate(),
            viewport,
            near: camera.projection.near(),
            far: camera.projection.far(),
            clear_color: camera.clear_color,
        }
    }

    /// Perspective view looking from `eye` at `target`.
    pub fn look_at(eye: Vec3, target: Vec3, fov_y: f32, viewport: Rect) -> Self {
        let camera = Camera {
            projection: spartan_ecs::Projection::Perspective {
                fov_y,
                near: 0.1,
                far: 1000.0,
            },
            ..Camera::default()
        };
        let world = Mat4::look_at_rh(eye, target, Vec3::Y).inverse();
        Self::from_camera(world, &camera, viewport)
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection * self.view
    }

    /// Distance along the view direction; larger is farther away.
    pub fn view_depth(&self, point: Vec3) -> f32 {
        -self.view.transform_point3(point).z
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DrawFlags: u8 {
        const CAST_SHADOWS = 1 << 0;
    }
}

/// One renderable to draw this frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawItem {
    pub entity: EntityId,
    pub world: Mat4,
    pub mesh: MeshHandle,
    pub material: MaterialHandle,
    pub flags: DrawFlags,
}

/// One light to accumulate this frame, in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightItem {
    pub entity: EntityId,
    pub kind: LightKind,
    pub position: Vec3,
    /// Unit direction the light points in.
    pub direction: Vec3,
    pub color: Color,
    pub intensity: f32,
    pub range: f32,
    pub casts_shadows: bool,
}

/// Where the final image goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresentTarget {
    /// Only the renderer's output texture (editor viewport, headless).
    #[default]
    Offscreen,
    /// The output texture, then the device swapchain.
    Swapchain,
}

/// Everything `Renderer::render_frame` reads.
#[derive(Debug, Clone)]
pub struct FrameInput<'a> {
    /// `None` when the scene has no usable active camera.
    pub view: Option<ViewInput>,
    pub draws: Vec<DrawItem>,
    pub lights: Vec<LightItem>,
    pub resources: &'a ResourceCache,
    pub target: PresentTarget,
}

/// Build the frame input from the scene and its components.
///
/// Only visible renderables and lights on live entities are included. Entity
/// order is the component store's, so extraction is deterministic.
pub fn extract_frame<'a>(
    scene: &Scene,
    components: &ComponentStore,
    resources: &'a ResourceCache,
    viewport: Rect,
    target: PresentTarget,
) -> FrameInput<'a> {
    let view = match components.active_camera() {
        Some((entity, camera)) => match scene.world_matrix(entity) {
            Some(world) => Some(ViewInput::from_camera(world, camera, viewport)),
            None => {
                tracing::warn!(
                    camera = %entity.short(),
                    "active camera entity is not in the scene"
                );
                None
            }
        },
        None => None,
    };

    let draws = components
        .renderables()
        .iter()
        .filter(|(_, r)| r.visible)
        .filter_map(|(&entity, r)| {
            let world = scene.world_matrix(entity)?;
            let mut flags = DrawFlags::empty();
            flags.set(DrawFlags::CAST_SHADOWS, r.cast_shadows);
            Some(DrawItem {
                entity,
                world,
                mesh: r.mesh,
                material: r.material,
                flags,
            })
        })
        .collect();

    let lights = components
        .lights()
        .iter()
        .filter_map(|(&entity, light)| {
            let world = scene.world_matrix(entity)?;
            Some(LightItem {
                entity,
                kind: light.kind,
                position: world.transform_point3(Vec3::ZERO),
                direction: world
                    .transform_vector3(Vec3::NEG_Z)
                    .try_normalize()
                    .unwrap_or(Vec3::NEG_Z),
                color: light.color,
                intensity: light.intensity,
                range: light.range,
                casts_shadows: light.casts_shadows,
            })
        })
        .collect();

    FrameInput {
        view,
        draws,
        lights,
        resources,
        target,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spartan_common::Transform;
    use spartan_ecs::{Light, Renderable};
    use spartan_resources::{material_handle, mesh_handle};

    #[test]
    fn extracts_visible_renderables_and_lights() {
        let mut scene = Scene::new();
        let mut components = ComponentStore::new();
        let cache = ResourceCache::new();

        let cam = scene.spawn(Transform::from_position(Vec3::new(0.0, 0.0, 5.0)));
        components.set_camera(cam, Camera::default());

        let shown = scene.spawn(Transform::default());
        components.set_renderable(
            shown,
            Renderable::new(mesh_handle("cube"), material_handle("default")),
        );
        let hidden = scene.spawn(Transform::default());
        let mut r = Renderable::new(mesh_handle("cube"), material_handle("default"));
        r.visible = false;
        components.set_renderable(hidden, r);

        let sun = scene.spawn(Transform::default());
        components.set_light(sun, Light::directional(Color::WHITE, 3.0));

        let frame = extract_frame(
            &scene,
            &components,
            &cache,
            Rect::from_size(320, 240),
            PresentTarget::Offscreen,
        );
        let view = frame.view.unwrap();
        assert_eq!(view.position, Vec3::new(0.0, 0.0, 5.0));
        assert!((view.view_depth(Vec3::ZERO) - 5.0).abs() < 1e-5);
        assert_eq!(frame.draws.len(), 1);
        assert_eq!(frame.draws[0].entity, shown);
        assert!(frame.draws[0].flags.contains(DrawFlags::CAST_SHADOWS));
        assert_eq!(frame.lights.len(), 1);
        assert_eq!(frame.lights[0].direction, Vec3::NEG_Z);
    }

    #[test]
    fn no_camera_means_no_view() {
        let scene = Scene::new();
        let components = ComponentStore::new();
        let cache = ResourceCache::new();
        let frame = extract_frame(
            &scene,
            &components,
            &cache,
            Rect::from_size(8, 8),
            PresentTarget::Offscreen,
        );
        assert!(frame.view.is_none());
        assert!(frame.draws.is_empty());
    }
}
