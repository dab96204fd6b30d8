//! Component storage for the scene graph.
//!
//! Each component type has its own map keyed by `EntityId`; there is no
//! component base type. The renderer reads `Renderable`, `Light` and `Camera`,
//! physics and scripting only ever write transforms through the scene.
//!
//! # Invariants
//! - Iteration order is deterministic (BTreeMap).
//! - At most one camera is active; if any camera exists, one is active.
//! - All component mutations produce events.

use glam::Mat4;
use serde::{Deserialize, Serialize};
use spartan_common::{Color, EntityId, MaterialHandle, MeshHandle};
use std::collections::BTreeMap;

/// Human-readable name component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Name(pub String);

/// Draws a mesh with a material at the entity's world transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Renderable {
    pub mesh: MeshHandle,
    pub material: MaterialHandle,
    pub visible: bool,
    pub cast_shadows: bool,
}

impl Renderable {
    pub fn new(mesh: MeshHandle, material: MaterialHandle) -> Self {
        Self {
            mesh,
            material,
            visible: true,
            cast_shadows: true,
        }
    }
}

/// Light source type. Angles are in radians, measured from the cone axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LightKind {
    Directional,
    Point,
    Spot { inner_angle: f32, outer_angle: f32 },
}

/// Light component; position and direction come from the entity transform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Light {
    pub kind: LightKind,
    pub color: Color,
    pub intensity: f32,
    /// Attenuation radius for point and spot lights. Ignored for directional lights.
    pub range: f32,
    pub casts_shadows: bool,
}

impl Light {
    pub fn directional(color: Color, intensity: f32) -> Self {
        Self {
            kind: LightKind::Directional,
            color,
            intensity,
            range: 0.0,
            casts_shadows: true,
        }
    }

    pub fn point(color: Color, intensity: f32, range: f32) -> Self {
        Self {
            kind: LightKind::Point,
            color,
            intensity,
            range,
            casts_shadows: false,
        }
    }

    pub fn spot(color: Color, intensity: f32, range: f32, outer_angle: f32) -> Self {
        Self {
            kind: LightKind::Spot {
                inner_angle: outer_angle * 0.8,
                outer_angle,
            },
            color,
            intensity,
            range,
            casts_shadows: false,
        }
    }
}

/// Camera projection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Projection {
    Perspective { fov_y: f32, near: f32, far: f32 },
    Orthographic { height: f32, near: f32, far: f32 },
}

impl Projection {
    pub fn near(&self) -> f32 {
        match *self {
            Self::Perspective { near, .. } | Self::Orthographic { near, .. } => near,
        }
    }

    pub fn far(&self) -> f32 {
        match *self {
            Self::Perspective { far, .. } | Self::Orthographic { far, .. } => far,
        }
    }

    /// Right-handed projection with a [0, 1] depth range.
    pub fn matrix(&self, aspect: f32) -> Mat4 {
        match *self {
            Self::Perspective { fov_y, near, far } => {
                Mat4::perspective_rh(fov_y, aspect, near, far)
            }
            Self::Orthographic { height, near, far } => {
                let half_h = height * 0.5;
                let half_w = half_h * aspect;
                Mat4::orthographic_rh(-half_w, half_w, -half_h, half_h, near, far)
            }
        }
    }
}

/// Camera component. The view matrix is the inverse of the entity world matrix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub projection: Projection,
    pub clear_color: Color,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            projection: Projection::Perspective {
                fov_y: 60.0_f32.to_radians(),
                near: 0.1,
                far: 1000.0,
            },
            clear_color: Color::rgb(0.0, 0.0, 0.0),
        }
    }
}

/// Events produced by component mutations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ComponentEvent {
    NameSet { entity: EntityId, name: String },
    NameRemoved { entity: EntityId },
    RenderableSet { entity: EntityId, renderable: Renderable },
    RenderableRemoved { entity: EntityId },
    LightSet { entity: EntityId, light: Light },
    LightRemoved { entity: EntityId },
    CameraSet { entity: EntityId, camera: Camera },
    CameraRemoved { entity: EntityId },
    ActiveCameraChanged { entity: Option<EntityId> },
}

/// Deterministic component storage for all component types.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentStore {
    names: BTreeMap<EntityId, Name>,
    renderables: BTreeMap<EntityId, Renderable>,
    lights: BTreeMap<EntityId, Light>,
    cameras: BTreeMap<EntityId, Camera>,
    active_camera: Option<EntityId>,
    #[serde(skip)]
    events: Vec<ComponentEvent>,
}

impl ComponentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain and return all pending component events.
    pub fn drain_events(&mut self) -> Vec<ComponentEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn events(&self) -> &[ComponentEvent] {
        &self.events
    }

    // --- Name ---
    pub fn set_name(&mut self, entity: EntityId, name: impl Into<String>) {
        let name = name.into();
        self.events.push(ComponentEvent::NameSet {
            entity,
            name: name.clone(),
        });
        self.names.insert(entity, Name(name));
    }

    pub fn remove_name(&mut self, entity: EntityId) -> Option<Name> {
        let removed = self.names.remove(&entity);
        if removed.is_some() {
            self.events.push(ComponentEvent::NameRemoved { entity });
        }
        removed
    }

    pub fn get_name(&self, entity: EntityId) -> Option<&Name> {
        self.names.get(&entity)
    }

    pub fn names(&self) -> &BTreeMap<EntityId, Name> {
        &self.names
    }

    // --- Renderable ---
    pub fn set_renderable(&mut self, entity: EntityId, renderable: Renderable) {
        self.events.push(ComponentEvent::RenderableSet { entity, renderable });
        self.renderables.insert(entity, renderable);
    }

    pub fn remove_renderable(&mut self, entity: EntityId) -> Option<Renderable> {
        let removed = self.renderables.remove(&entity);
        if removed.is_some() {
            self.events.push(ComponentEvent::RenderableRemoved { entity });
        }
        removed
    }

    pub fn get_renderable(&self, entity: EntityId) -> Option<&Renderable> {
        self.renderables.get(&entity)
    }

    pub fn renderables(&self) -> &BTreeMap<EntityId, Renderable> {
        &self.renderables
    }

    // --- Light ---
    pub fn set_light(&mut self, entity: EntityId, light: Light) {
        self.events.push(ComponentEvent::LightSet { entity, light });
        self.lights.insert(entity, light);
    }

    pub fn remove_light(&mut self, entity: EntityId) -> Option<Light> {
        let removed = self.lights.remove(&entity);
        if removed.is_some() {
            self.events.push(ComponentEvent::LightRemoved { entity });
        }
        removed
    }

    pub fn get_light(&self, entity: EntityId) -> Option<&Light> {
        self.lights.get(&entity)
    }

    pub fn lights(&self) -> &BTreeMap<EntityId, Light> {
        &self.lights
    }

    // --- Camera ---
    /// Attach a camera. The first camera added becomes active.
    pub fn set_camera(&mut self, entity: EntityId, camera: Camera) {
        self.events.push(ComponentEvent::CameraSet { entity, camera });
        self.cameras.insert(entity, camera);
        if self.active_camera.is_none() {
            self.change_active(Some(entity));
        }
    }

    /// Remove a camera. If it was active, the next camera in id order takes over.
    pub fn remove_camera(&mut self, entity: EntityId) -> Option<Camera> {
        let removed = self.cameras.remove(&entity)?;
        self.events.push(ComponentEvent::CameraRemoved { entity });
        if self.active_camera == Some(entity) {
            let next = self.cameras.keys().next().copied();
            self.change_active(next);
        }
        Some(removed)
    }

    pub fn get_camera(&self, entity: EntityId) -> Option<&Camera> {
        self.cameras.get(&entity)
    }

    pub fn cameras(&self) -> &BTreeMap<EntityId, Camera> {
        &self.cameras
    }

    /// Make `entity` the active camera. Returns false if it has no camera.
    pub fn set_active_camera(&mut self, entity: EntityId) -> bool {
        if !self.cameras.contains_key(&entity) {
            tracing::warn!(entity = %entity.short(), "cannot activate entity without a camera");
            return false;
        }
        if self.active_camera != Some(entity) {
            self.change_active(Some(entity));
        }
        true
    }

    /// The active camera and its entity.
    pub fn active_camera(&self) -> Option<(EntityId, &Camera)> {
        let id = self.active_camera?;
        self.cameras.get(&id).map(|c| (id, c))
    }

    fn change_active(&mut self, entity: Option<EntityId>) {
        self.active_camera = entity;
        self.events
            .push(ComponentEvent::ActiveCameraChanged { entity });
    }

    /// Remove all components for an entity.
    pub fn remove_entity(&mut self, entity: EntityId) {
        self.remove_name(entity);
        self.remove_renderable(entity);
        self.remove_light(entity);
        self.remove_camera(entity);
    }

    /// Replay a component event.
    pub fn apply_event(&mut self, event: &ComponentEvent) {
        match event {
            ComponentEvent::NameSet { entity, name } => {
                self.names.insert(*entity, Name(name.clone()));
            }
            ComponentEvent::NameRemoved { entity } => {
                self.names.remove(entity);
            }
            ComponentEvent::RenderableSet { entity, renderable } => {
                self.renderables.insert(*entity, *renderable);
            }
            ComponentEvent::RenderableRemoved { entity } => {
                self.renderables.remove(entity);
            }
            ComponentEvent::LightSet { entity, light } => {
                self.lights.insert(*entity, *light);
            }
            ComponentEvent::LightRemoved { entity } => {
                self.lights.remove(entity);
            }
            ComponentEvent::CameraSet { entity, camera } => {
                self.cameras.insert(*entity, *camera);
            }
            ComponentEvent::CameraRemoved { entity } => {
                self.cameras.remove(entity);
            }
            ComponentEvent::ActiveCameraChanged { entity } => {
                self.active_camera = *entity;
            }
        }
    }
}
