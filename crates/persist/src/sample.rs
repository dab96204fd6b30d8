//! A small lit scene built from the built-in primitives.
//!
//! Used by the CLI and editor when no scene file is given, and as a fixture
//! for round-trip tests.

use glam::{Quat, Vec3};
use spartan_common::{Color, Transform};
use spartan_ecs::{Camera, ComponentStore, Light, Renderable};
use spartan_resources::{
    BlendMode, Material, ResourceCache, material_handle, mesh_handle, primitives,
};
use spartan_scene::Scene;

pub const GROUND_MATERIAL: &str = "sample:ground";
pub const RED_MATERIAL: &str = "sample:red";
pub const GLASS_MATERIAL: &str = "sample:glass";

/// Register the sample materials. Meshes come from `ResourceCache::with_builtins`.
pub fn register_materials(cache: &ResourceCache) {
    cache.insert_material(
        GROUND_MATERIAL,
        Material::named("ground").with_albedo(Color::rgb(0.45, 0.45, 0.42)),
    );
    cache.insert_material(
        RED_MATERIAL,
        Material::named("red").with_albedo(Color::rgb(0.8, 0.1, 0.08)),
    );
    cache.insert_material(
        GLASS_MATERIAL,
        Material::named("glass")
            .with_albedo(Color::rgba(0.3, 0.6, 0.9, 0.4))
            .with_blend(BlendMode::Transparent),
    );
}

/// Ground plane, a row of cubes and spheres, two glass panes, a sun, two
/// point lights and a camera.
pub fn build(cache: &ResourceCache) -> (Scene, ComponentStore) {
    register_materials(cache);
    let mut scene = Scene::new();
    let mut components = ComponentStore::new();

    let mut prop = |name: &str, transform: Transform, mesh: &str, material: &str| {
        let id = scene.spawn(transform);
        components.set_name(id, name);
        let renderable = Renderable::new(mesh_handle(mesh), material_handle(material));
        components.set_renderable(id, renderable);
        id
    };

    prop(
        "Ground",
        Transform::default().with_scale(Vec3::new(40.0, 1.0, 40.0)),
        primitives::QUAD,
        GROUND_MATERIAL,
    );
    for i in 0..5 {
        let x = (i as f32 - 2.0) * 2.5;
        let (mesh, material) = if i % 2 == 0 {
            (primitives::CUBE, Material::DEFAULT_NAME)
        } else {
            (primitives::SPHERE, RED_MATERIAL)
        };
        let transform = Transform::from_position(Vec3::new(x, 0.5, 0.0));
        prop(&format!("Prop {i}"), transform, mesh, material);
    }
    for (i, z) in [2.0, 4.0].into_iter().enumerate() {
        prop(
            &format!("Glass {i}"),
            Transform::from_position(Vec3::new(0.0, 1.0, z))
                .with_rotation(Quat::from_rotation_x(std::f32::consts::FRAC_PI_2))
                .with_scale(Vec3::new(3.0, 1.0, 2.0)),
            primitives::QUAD,
            GLASS_MATERIAL,
        );
    }

    let sun = scene.spawn(
        Transform::default().with_rotation(Quat::from_euler(glam::EulerRot::YXZ, 0.6, -0.9, 0.0)),
    );
    components.set_name(sun, "Sun");
    components.set_light(sun, Light::directional(Color::rgb(1.0, 0.96, 0.9), 2.5));

    for (name, x, color) in [
        ("Warm Light", -4.0, Color::rgb(1.0, 0.6, 0.3)),
        ("Cool Light", 4.0, Color::rgb(0.3, 0.5, 1.0)),
    ] {
        let id = scene.spawn(Transform::from_position(Vec3::new(x, 2.0, 1.5)));
        components.set_name(id, name);
        components.set_light(id, Light::point(color, 6.0, 6.0));
    }

    let eye = Vec3::new(0.0, 4.0, 12.0);
    let view = glam::Mat4::look_at_rh(eye, Vec3::new(0.0, 0.5, 0.0), Vec3::Y);
    let look = Quat::from_mat4(&view.inverse());
    let camera = scene.spawn(Transform::from_position(eye).with_rotation(look));
    components.set_name(camera, "Camera");
    components.set_camera(camera, Camera::default());

    scene.drain_events();
    components.drain_events();
    tracing::debug!(entities = scene.entity_count(), "sample scene built");
    (scene, components)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SceneFile;

    #[test]
    fn sample_scene_references_registered_resources() {
        let cache = ResourceCache::with_builtins();
        let (scene, components) = build(&cache);
        assert_eq!(scene.entity_count(), 12);
        assert!(components.active_camera().is_some());
        assert_eq!(components.lights().len(), 3);
        for r in components.renderables().values() {
            assert!(cache.mesh(r.mesh).is_ready());
            assert!(cache.material(r.material).is_ready());
        }
    }

    #[test]
    fn sample_scene_captures_by_name() {
        let cache = ResourceCache::with_builtins();
        let (scene, components) = build(&cache);
        let file = SceneFile::capture(&scene, &components, &cache);
        assert!(file.material_names().contains(&GLASS_MATERIAL));
        assert!(file.mesh_names().contains(&primitives::SPHERE));
    }
}
