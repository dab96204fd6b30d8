use glam::Mat4;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use spartan_common::{EntityId, Transform};

/// An event record produced by every mutation to the scene.
///
/// The log lets tools replay or persist edits without diffing scene state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SceneEvent {
    /// Entity was spawned with the given transform and parent.
    Spawned {
        id: EntityId,
        transform: Transform,
        parent: Option<EntityId>,
    },
    /// Entity was despawned. Carries the data it had so the edit can be reversed.
    Despawned {
        id: EntityId,
        transform: Transform,
        parent: Option<EntityId>,
    },
    /// Entity local transform was updated.
    TransformUpdated {
        id: EntityId,
        old: Transform,
        new: Transform,
    },
    /// Entity moved to a new parent (or to the root).
    Reparented {
        id: EntityId,
        old: Option<EntityId>,
        new: Option<EntityId>,
    },
}

/// Errors from scene mutations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SceneError {
    #[error("entity {0:?} not found")]
    EntityNotFound(EntityId),
    #[error("parenting {child:?} under {parent:?} would create a cycle")]
    Cycle { child: EntityId, parent: EntityId },
}

/// Per-entity data stored in the scene.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityData {
    pub transform: Transform,
    pub parent: Option<EntityId>,
    /// Cached local-to-world matrix, rebuilt on every change.
    #[serde(skip, default = "identity")]
    world: Mat4,
}

fn identity() -> Mat4 {
    Mat4::IDENTITY
}

impl EntityData {
    pub fn world_matrix(&self) -> Mat4 {
        self.world
    }
}

/// The authoritative scene state.
///
/// Uses BTreeMap so iteration (and therefore draw submission before sorting)
/// is deterministic across runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scene {
    entities: BTreeMap<EntityId, EntityData>,
    #[serde(skip)]
    children: BTreeMap<EntityId, Vec<EntityId>>,
    #[serde(skip)]
    event_log: Vec<SceneEvent>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Drain and return the event log.
    pub fn drain_events(&mut self) -> Vec<SceneEvent> {
        std::mem::take(&mut self.event_log)
    }

    pub fn events(&self) -> &[SceneEvent] {
        &self.event_log
    }

    pub fn entities(&self) -> &BTreeMap<EntityId, EntityData> {
        &self.entities
    }

    pub fn get(&self, id: EntityId) -> Option<&EntityData> {
        self.entities.get(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    /// World matrix of an entity, if it exists.
    pub fn world_matrix(&self, id: EntityId) -> Option<Mat4> {
        self.entities.get(&id).map(|d| d.world)
    }

    /// Direct children of an entity, in insertion order.
    pub fn children(&self, id: EntityId) -> &[EntityId] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Spawn a root entity with the given transform. Returns its id.
    pub fn spawn(&mut self, transform: Transform) -> EntityId {
        let id = EntityId::new();
        self.insert(id, transform, None);
        id
    }

    /// Spawn an entity under `parent`.
    pub fn spawn_child(
        &mut self,
        parent: EntityId,
        transform: Transform,
    ) -> Result<EntityId, SceneError> {
        if !self.entities.contains_key(&parent) {
            return Err(SceneError::EntityNotFound(parent));
        }
        let id = EntityId::new();
        self.insert(id, transform, Some(parent));
        Ok(id)
    }

    /// Spawn an entity with a specific id (used for replay and deserialization).
    ///
    /// A missing parent is treated as root so partially loaded scenes stay usable.
    pub fn spawn_with_id(&mut self, id: EntityId, transform: Transform, parent: Option<EntityId>) {
        let parent = parent.filter(|p| {
            let exists = self.entities.contains_key(p);
            if !exists {
                tracing::warn!(
                    entity = %id.short(),
                    parent = %p.short(),
                    "parent missing, spawning at root"
                );
            }
            exists
        });
        self.insert(id, transform, parent);
    }

    fn insert(&mut self, id: EntityId, transform: Transform, parent: Option<EntityId>) {
        let parent_world = parent
            .and_then(|p| self.entities.get(&p))
            .map_or(Mat4::IDENTITY, |d| d.world);
        self.entities.insert(
            id,
            EntityData {
                transform,
                parent,
                world: parent_world * transform.to_matrix(),
            },
        );
        if let Some(p) = parent {
            self.children.entry(p).or_default().push(id);
        }
        self.event_log.push(SceneEvent::Spawned {
            id,
            transform,
            parent,
        });
    }

    /// Remove an entity and its whole subtree.
    ///
    /// Returns the removed ids, descendants before ancestors. Empty if the
    /// entity did not exist.
    pub fn despawn(&mut self, id: EntityId) -> Vec<EntityId> {
        if !self.entities.contains_key(&id) {
            return Vec::new();
        }
        let mut order = Vec::new();
        self.collect_post_order(id, &mut order);

        if let Some(parent) = self.entities.get(&id).and_then(|d| d.parent) {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.retain(|c| *c != id);
            }
        }

        for removed in &order {
            self.children.remove(removed);
            if let Some(data) = self.entities.remove(removed) {
                self.event_log.push(SceneEvent::Despawned {
                    id: *removed,
                    transform: data.transform,
                    parent: data.parent,
                });
            }
        }
        order
    }

    fn collect_post_order(&self, id: EntityId, out: &mut Vec<EntityId>) {
        for child in self.children(id) {
            self.collect_post_order(*child, out);
        }
        out.push(id);
    }

    /// Update an entity's local transform and refresh the subtree's world matrices.
    pub fn set_transform(&mut self, id: EntityId, new: Transform) -> Result<(), SceneError> {
        let data = self
            .entities
            .get_mut(&id)
            .ok_or(SceneError::EntityNotFound(id))?;
        let old = data.transform;
        data.transform = new;
        self.event_log
            .push(SceneEvent::TransformUpdated { id, old, new });
        self.refresh_subtree(id);
        Ok(())
    }

    /// Move `id` under `parent` (or to the root with `None`), keeping its local transform.
    pub fn set_parent(&mut self, id: EntityId, parent: Option<EntityId>) -> Result<(), SceneError> {
        let old = self
            .entities
            .get(&id)
            .ok_or(SceneError::EntityNotFound(id))?
            .parent;
        if let Some(p) = parent {
            if !self.entities.contains_key(&p) {
                return Err(SceneError::EntityNotFound(p));
            }
            if self.is_self_or_ancestor(id, p) {
                return Err(SceneError::Cycle { child: id, parent: p });
            }
        }
        if old == parent {
            return Ok(());
        }

        if let Some(o) = old {
            if let Some(siblings) = self.children.get_mut(&o) {
                siblings.retain(|c| *c != id);
            }
        }
        if let Some(p) = parent {
            self.children.entry(p).or_default().push(id);
        }
        if let Some(data) = self.entities.get_mut(&id) {
            data.parent = parent;
        }
        self.event_log.push(SceneEvent::Reparented {
            id,
            old,
            new: parent,
        });
        self.refresh_subtree(id);
        Ok(())
    }

    /// True if `id` is `candidate` itself or one of its ancestors.
    fn is_self_or_ancestor(&self, id: EntityId, candidate: EntityId) -> bool {
        let mut cursor = Some(candidate);
        while let Some(c) = cursor {
            if c == id {
                return true;
            }
            cursor = self.entities.get(&c).and_then(|d| d.parent);
        }
        false
    }

    fn refresh_subtree(&mut self, root: EntityId) {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let Some(data) = self.entities.get(&id) else {
                continue;
            };
            let parent_world = data
                .parent
                .and_then(|p| self.entities.get(&p))
                .map_or(Mat4::IDENTITY, |d| d.world);
            let local = data.transform.to_matrix();
            if let Some(data) = self.entities.get_mut(&id) {
                data.world = parent_world * local;
            }
            stack.extend(self.children(id).iter().copied());
        }
    }

    /// Rebuild child lists and world matrices after deserialization.
    pub fn rebuild_hierarchy(&mut self) {
        self.children.clear();
        let links: Vec<(EntityId, EntityId)> = self
            .entities
            .iter()
            .filter_map(|(id, d)| d.parent.map(|p| (p, *id)))
            .collect();
        for (parent, child) in links {
            if self.entities.contains_key(&parent) {
                self.children.entry(parent).or_default().push(child);
            } else if let Some(data) = self.entities.get_mut(&child) {
                data.parent = None;
            }
        }
        let roots: Vec<EntityId> = self
            .entities
            .iter()
            .filter(|(_, d)| d.parent.is_none())
            .map(|(id, _)| *id)
            .collect();
        for root in roots {
            self.refresh_subtree(root);
        }
    }

    /// Reconstruct a scene from a sequence of events.
    pub fn replay(events: &[SceneEvent]) -> Self {
        let mut scene = Self::new();
        for event in events {
            match event {
                SceneEvent::Spawned {
                    id,
                    transform,
                    parent,
                } => scene.spawn_with_id(*id, *transform, *parent),
                SceneEvent::Despawned { id, .. } => {
                    scene.despawn(*id);
                }
                SceneEvent::TransformUpdated { id, new, .. } => {
                    let _ = scene.set_transform(*id, *new);
                }
                SceneEvent::Reparented { id, new, .. } => {
                    let _ = scene.set_parent(*id, *new);
                }
            }
        }
        scene.event_log.clear();
        scene
    }

    /// Deterministic hash of the scene state (FNV-1a over canonical iteration order).
    pub fn state_hash(&self) -> u64 {
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        let mix = |h: &mut u64, bytes: &[u8]| {
            for &b in bytes {
                *h ^= b as u64;
                *h = h.wrapping_mul(0x0100_0000_01b3);
            }
        };
        for (id, data) in &self.entities {
            mix(&mut h, id.0.as_bytes());
            if let Some(p) = data.parent {
                mix(&mut h, p.0.as_bytes());
            }
            let t = &data.transform;
            for v in t
                .position
                .to_array()
                .iter()
                .chain(t.rotation.to_array().iter())
                .chain(t.scale.to_array().iter())
            {
                mix(&mut h, &v.to_bits().to_le_bytes());
            }
        }
        h
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    #[test]
    fn spawn_and_despawn() {
        let mut scene = Scene::new();
        let id = scene.spawn(Transform::default());
        assert_eq!(scene.entity_count(), 1);
        assert_eq!(scene.despawn(id), vec![id]);
        assert_eq!(scene.entity_count(), 0);
        assert!(scene.despawn(id).is_empty());
    }

    #[test]
    fn world_matrix_composes_parent() {
        let mut scene = Scene::new();
        let parent = scene.spawn(Transform::from_position(Vec3::new(10.0, 0.0, 0.0)));
        let child = scene
            .spawn_child(parent, Transform::from_position(Vec3::new(0.0, 2.0, 0.0)))
            .unwrap();
        let p = scene.world_matrix(child).unwrap().transform_point3(Vec3::ZERO);
        assert_eq!(p, Vec3::new(10.0, 2.0, 0.0));
    }

    #[test]
    fn moving_parent_refreshes_descendants() {
        let mut scene = Scene::new();
        let a = scene.spawn(Transform::default());
        let b = scene.spawn_child(a, Transform::from_position(Vec3::X)).unwrap();
        let c = scene.spawn_child(b, Transform::from_position(Vec3::X)).unwrap();

        scene
            .set_transform(a, Transform::default().with_scale(Vec3::splat(2.0)))
            .unwrap();
        let p = scene.world_matrix(c).unwrap().transform_point3(Vec3::ZERO);
        assert!((p - Vec3::new(4.0, 0.0, 0.0)).length() < 1e-5);
    }

    #[test]
    fn reparent_rejects_cycles() {
        let mut scene = Scene::new();
        let a = scene.spawn(Transform::default());
        let b = scene.spawn_child(a, Transform::default()).unwrap();
        assert_eq!(
            scene.set_parent(a, Some(b)),
            Err(SceneError::Cycle { child: a, parent: b })
        );
        assert_eq!(
            scene.set_parent(a, Some(a)),
            Err(SceneError::Cycle { child: a, parent: a })
        );
    }

    #[test]
    fn reparent_to_root_restores_local_space() {
        let mut scene = Scene::new();
        let a = scene.spawn(Transform::from_position(Vec3::Y * 5.0));
        let b = scene.spawn_child(a, Transform::from_position(Vec3::X)).unwrap();
        scene.set_parent(b, None).unwrap();
        let p = scene.world_matrix(b).unwrap().transform_point3(Vec3::ZERO);
        assert_eq!(p, Vec3::X);
        assert!(scene.children(a).is_empty());
    }

    #[test]
    fn despawn_removes_subtree_children_first() {
        let mut scene = Scene::new();
        let a = scene.spawn(Transform::default());
        let b = scene.spawn_child(a, Transform::default()).unwrap();
        let c = scene.spawn_child(b, Transform::default()).unwrap();
        let keep = scene.spawn(Transform::default());

        let removed = scene.despawn(a);
        assert_eq!(removed, vec![c, b, a]);
        assert_eq!(scene.entity_count(), 1);
        assert!(scene.contains(keep));
    }

    #[test]
    fn replay_reproduces_state() {
        let mut scene = Scene::new();
        let a = scene.spawn(Transform::default());
        let b = scene.spawn_child(a, Transform::from_position(Vec3::Z)).unwrap();
        scene
            .set_transform(a, Transform::default().with_rotation(Quat::from_rotation_y(1.0)))
            .unwrap();
        scene.set_parent(b, None).unwrap();

        let replayed = Scene::replay(scene.events());
        assert_eq!(replayed.state_hash(), scene.state_hash());
        assert_eq!(replayed.world_matrix(b), scene.world_matrix(b));
        assert!(replayed.events().is_empty());
    }

    #[test]
    fn rebuild_hierarchy_after_deserialize() {
        let mut scene = Scene::new();
        let a = scene.spawn(Transform::from_position(Vec3::X));
        let b = scene.spawn_child(a, Transform::from_position(Vec3::X)).unwrap();

        let json = serde_json_like_roundtrip(&scene);
        let mut restored = json;
        restored.rebuild_hierarchy();
        assert_eq!(restored.children(a), &[b]);
        let p = restored.world_matrix(b).unwrap().transform_point3(Vec3::ZERO);
        assert_eq!(p, Vec3::new(2.0, 0.0, 0.0));
    }

    /// Simulates deserialization: only serialized fields survive.
    fn serde_json_like_roundtrip(scene: &Scene) -> Scene {
        let mut out = Scene::new();
        for (id, data) in scene.entities() {
            out.entities.insert(
                *id,
                EntityData {
                    transform: data.transform,
                    parent: data.parent,
                    world: Mat4::IDENTITY,
                },
            );
        }
        out
    }
}
