use crate::store::PersistError;
use serde::{Deserialize, Serialize};
use spartan_common::{EntityId, MaterialHandle, MeshHandle, Transform};
use spartan_ecs::{Camera, ComponentStore, Light, Renderable};
use spartan_resources::{ResourceCache, material_handle, mesh_handle};
use spartan_scene::{Scene, SceneError};

/// Current scene dump schema version.
pub const SCENE_SCHEMA_VERSION: u32 = 1;

/// How a dump refers to a mesh or material.
///
/// Names are stable across runs (built-in names or resource paths). Raw ids
/// are only written for resources that were registered without a name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceRef {
    Name(String),
    Id(u64),
}

impl ResourceRef {
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Name(n) => Some(n),
            Self::Id(_) => None,
        }
    }

    fn mesh(&self) -> MeshHandle {
        match self {
            Self::Name(n) => mesh_handle(n),
            Self::Id(id) => MeshHandle(*id),
        }
    }

    fn material(&self) -> MaterialHandle {
        match self {
            Self::Name(n) => material_handle(n),
            Self::Id(id) => MaterialHandle(*id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderableRecord {
    pub mesh: ResourceRef,
    pub material: ResourceRef,
    pub visible: bool,
    pub cast_shadows: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub transform: Transform,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renderable: Option<RenderableRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub light: Option<Light>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera: Option<Camera>,
}

/// A versioned, self-contained dump of a scene and its components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneFile {
    pub version: u32,
    /// Parents always precede their children.
    pub entities: Vec<EntityRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_camera: Option<EntityId>,
}

impl SceneFile {
    /// Capture a scene. Resource handles are written as the names the cache
    /// knows them by.
    pub fn capture(scene: &Scene, components: &ComponentStore, cache: &ResourceCache) -> Self {
        let mut entities = Vec::with_capacity(scene.entity_count());
        let roots = scene
            .entities()
            .iter()
            .filter(|(_, d)| d.parent.is_none())
            .map(|(id, _)| *id);
        let mut stack: Vec<EntityId> = roots.collect();
        stack.reverse();

        while let Some(id) = stack.pop() {
            let Some(data) = scene.get(id) else {
                continue;
            };
            let renderable = components.get_renderable(id).map(|r| RenderableRecord {
                mesh: cache
                    .mesh_name(r.mesh)
                    .map_or(ResourceRef::Id(r.mesh.0), ResourceRef::Name),
                material: cache
                    .material_name(r.material)
                    .map_or(ResourceRef::Id(r.material.0), ResourceRef::Name),
                visible: r.visible,
                cast_shadows: r.cast_shadows,
            });
            entities.push(EntityRecord {
                id,
                name: components.get_name(id).map(|n| n.0.clone()),
                transform: data.transform,
                parent: data.parent,
                renderable,
                light: components.get_light(id).copied(),
                camera: components.get_camera(id).copied(),
            });
            stack.extend(scene.children(id).iter().rev());
        }

        Self {
            version: SCENE_SCHEMA_VERSION,
            entities,
            active_camera: components.active_camera().map(|(id, _)| id),
        }
    }

    /// Rebuild the scene and component store.
    ///
    /// Entities whose parent is absent from the dump are kept at the root.
    /// A parent cycle fails the whole load.
    pub fn restore(&self) -> Result<(Scene, ComponentStore), PersistError> {
        if self.version != SCENE_SCHEMA_VERSION {
            return Err(PersistError::SchemaMismatch {
                file_version: self.version,
                expected_version: SCENE_SCHEMA_VERSION,
            });
        }

        let mut scene = Scene::new();
        let mut components = ComponentStore::new();
        for record in &self.entities {
            scene.spawn_with_id(record.id, record.transform, None);
        }
        for record in &self.entities {
            let Some(parent) = record.parent else {
                continue;
            };
            match scene.set_parent(record.id, Some(parent)) {
                Ok(()) => {}
                Err(SceneError::EntityNotFound(missing)) => {
                    tracing::warn!(
                        entity = %record.id.short(),
                        parent = %missing.short(),
                        "parent missing from dump, kept at root"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        for record in &self.entities {
            if let Some(name) = &record.name {
                components.set_name(record.id, name.clone());
            }
            if let Some(r) = &record.renderable {
                components.set_renderable(
                    record.id,
                    Renderable {
                        mesh: r.mesh.mesh(),
                        material: r.material.material(),
                        visible: r.visible,
                        cast_shadows: r.cast_shadows,
                    },
                );
            }
            if let Some(light) = record.light {
                components.set_light(record.id, light);
            }
            if let Some(camera) = record.camera {
                components.set_camera(record.id, camera);
            }
        }
        if let Some(active) = self.active_camera {
            components.set_active_camera(active);
        }

        scene.drain_events();
        components.drain_events();
        tracing::debug!(entities = self.entities.len(), "scene restored");
        Ok((scene, components))
    }

    /// Mesh names the dump refers to, deduplicated, in first-use order.
    pub fn mesh_names(&self) -> Vec<&str> {
        self.referenced(|r| &r.mesh)
    }

    /// Material names the dump refers to, deduplicated, in first-use order.
    pub fn material_names(&self) -> Vec<&str> {
        self.referenced(|r| &r.material)
    }

    fn referenced(&self, field: impl Fn(&RenderableRecord) -> &ResourceRef) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for name in self
            .entities
            .iter()
            .filter_map(|e| e.renderable.as_ref())
            .filter_map(|r| field(r).name())
        {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use spartan_common::Color;
    use spartan_resources::{Material, primitives};

    fn sample() -> (Scene, ComponentStore, ResourceCache) {
        let cache = ResourceCache::with_builtins();
        let mut scene = Scene::new();
        let mut components = ComponentStore::new();

        let root = scene.spawn(Transform::from_position(Vec3::new(0.0, 1.0, 0.0)));
        let child = scene
            .spawn_child(root, Transform::from_position(Vec3::X))
            .unwrap();
        components.set_name(root, "root");
        components.set_renderable(
            child,
            Renderable::new(
                mesh_handle(primitives::CUBE),
                material_handle(Material::DEFAULT_NAME),
            ),
        );

        let lamp = scene.spawn(Transform::from_position(Vec3::new(0.0, 3.0, 0.0)));
        components.set_light(lamp, Light::point(Color::WHITE, 5.0, 10.0));

        let cam = scene.spawn(Transform::from_position(Vec3::new(0.0, 0.0, 5.0)));
        components.set_camera(cam, Camera::default());
        (scene, components, cache)
    }

    #[test]
    fn parents_precede_children() {
        let (scene, components, cache) = sample();
        let file = SceneFile::capture(&scene, &components, &cache);
        assert_eq!(file.entities.len(), 4);
        for (i, record) in file.entities.iter().enumerate() {
            if let Some(parent) = record.parent {
                let pos = file.entities.iter().position(|e| e.id == parent).unwrap();
                assert!(pos < i);
            }
        }
    }

    #[test]
    fn restore_preserves_scene_and_components() {
        let (scene, components, cache) = sample();
        let file = SceneFile::capture(&scene, &components, &cache);
        let (restored, restored_components) = file.restore().unwrap();

        assert_eq!(restored.state_hash(), scene.state_hash());
        assert_eq!(restored_components.renderables(), components.renderables());
        assert_eq!(restored_components.lights(), components.lights());
        assert_eq!(
            restored_components.active_camera().map(|(id, _)| id),
            components.active_camera().map(|(id, _)| id)
        );
        assert!(restored.events().is_empty());
    }

    #[test]
    fn builtin_resources_are_stored_by_name() {
        let (scene, components, cache) = sample();
        let file = SceneFile::capture(&scene, &components, &cache);
        assert_eq!(file.mesh_names(), vec![primitives::CUBE]);
        assert_eq!(file.material_names(), vec![Material::DEFAULT_NAME]);
    }

    #[test]
    fn unknown_version_fails_closed() {
        let (scene, components, cache) = sample();
        let mut file = SceneFile::capture(&scene, &components, &cache);
        file.version = 99;
        assert!(matches!(
            file.restore(),
            Err(PersistError::SchemaMismatch {
                file_version: 99,
                ..
            })
        ));
    }

    #[test]
    fn parent_cycle_is_rejected() {
        let a = EntityId::new();
        let b = EntityId::new();
        let record = |id, parent| EntityRecord {
            id,
            name: None,
            transform: Transform::default(),
            parent: Some(parent),
            renderable: None,
            light: None,
            camera: None,
        };
        let file = SceneFile {
            version: SCENE_SCHEMA_VERSION,
            entities: vec![record(a, b), record(b, a)],
            active_camera: None,
        };
        assert!(matches!(file.restore(), Err(PersistError::Scene(_))));
    }
}
