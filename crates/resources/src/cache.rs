use crate::material::Material;
use crate::mesh::{Mesh, primitives};
use crate::texture::TextureData;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use spartan_common::{MaterialHandle, MeshHandle, TextureHandle};
use std::collections::HashMap;
use std::sync::Arc;

/// Result of looking a resource up in the cache.
#[derive(Debug, Clone)]
pub enum Lookup<T> {
    /// Loaded; `version` changes whenever the resource is replaced.
    Ready { value: Arc<T>, version: u64 },
    /// A load is in flight.
    Loading,
    /// The last load failed.
    Failed(String),
    /// Nothing registered under this handle.
    Missing,
}

impl<T> Lookup<T> {
    pub fn ready(&self) -> Option<&Arc<T>> {
        match self {
            Self::Ready { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

#[derive(Debug)]
enum Slot<T> {
    /// `previous` is the value being reloaded; it stays readable until the
    /// new one is published.
    Loading {
        generation: u64,
        previous: Option<(Arc<T>, u64)>,
    },
    Ready { value: Arc<T>, version: u64 },
    Failed { reason: String },
}

#[derive(Debug)]
struct Entry<T> {
    name: String,
    slot: Slot<T>,
}

#[derive(Debug)]
struct Store<T> {
    entries: HashMap<u64, Entry<T>>,
}

impl<T> Default for Store<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> Store<T> {
    fn lookup(&self, id: u64) -> Lookup<T> {
        match self.entries.get(&id).map(|e| &e.slot) {
            Some(Slot::Ready { value, version }) => Lookup::Ready {
                value: Arc::clone(value),
                version: *version,
            },
            Some(Slot::Loading {
                previous: Some((value, version)),
                ..
            }) => Lookup::Ready {
                value: Arc::clone(value),
                version: *version,
            },
            Some(Slot::Loading { previous: None, .. }) => Lookup::Loading,
            Some(Slot::Failed { reason }) => Lookup::Failed(reason.clone()),
            None => Lookup::Missing,
        }
    }

    fn publish(&mut self, id: u64, name: &str, value: T, version: u64) {
        self.entries.insert(
            id,
            Entry {
                name: name.to_string(),
                slot: Slot::Ready {
                    value: Arc::new(value),
                    version,
                },
            },
        );
    }

    fn begin(&mut self, id: u64, name: &str, generation: u64) {
        let previous = match self.entries.remove(&id).map(|e| e.slot) {
            Some(Slot::Ready { value, version }) => Some((value, version)),
            Some(Slot::Loading { previous, .. }) => previous,
            Some(Slot::Failed { .. }) | None => None,
        };
        self.entries.insert(
            id,
            Entry {
                name: name.to_string(),
                slot: Slot::Loading {
                    generation,
                    previous,
                },
            },
        );
    }

    fn is_current(&self, id: u64, generation: u64) -> bool {
        matches!(
            self.entries.get(&id).map(|e| &e.slot),
            Some(Slot::Loading { generation: g, .. }) if *g == generation
        )
    }

    /// Record a failed load. A failed reload keeps serving the previous value.
    fn fail(&mut self, id: u64, reason: String) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        let slot = std::mem::replace(&mut entry.slot, Slot::Failed { reason });
        if let Slot::Loading {
            previous: Some((value, version)),
            ..
        } = slot
        {
            tracing::warn!(name = %entry.name, "reload failed, keeping previous version");
            entry.slot = Slot::Ready { value, version };
        }
    }

    fn is_live(&self, id: u64) -> bool {
        self.entries
            .get(&id)
            .is_some_and(|e| !matches!(e.slot, Slot::Failed { .. }))
    }

    /// Abandon an in-flight load. A cancelled reload restores the previous
    /// value; a cancelled first load removes the entry.
    fn cancel(&mut self, id: u64) -> bool {
        let Some(entry) = self.entries.remove(&id) else {
            return false;
        };
        match entry.slot {
            Slot::Loading {
                previous: Some((value, version)),
                ..
            } => {
                self.entries.insert(
                    id,
                    Entry {
                        name: entry.name,
                        slot: Slot::Ready { value, version },
                    },
                );
                true
            }
            Slot::Loading { previous: None, .. } => true,
            slot => {
                self.entries.insert(
                    id,
                    Entry {
                        name: entry.name,
                        slot,
                    },
                );
                false
            }
        }
    }

    fn count(&self) -> (usize, usize, usize) {
        self.entries
            .values()
            .fold((0, 0, 0), |(r, l, f), e| match e.slot {
                Slot::Ready { .. } => (r + 1, l, f),
                Slot::Loading { .. } => (r, l + 1, f),
                Slot::Failed { .. } => (r, l, f + 1),
            })
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    meshes: Store<Mesh>,
    materials: Store<Material>,
    textures: Store<TextureData>,
    next_version: u64,
    next_generation: u64,
}

impl CacheInner {
    fn bump_version(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

/// Counts of cached resources by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub ready: usize,
    pub loading: usize,
    pub failed: usize,
}

/// Which of the three stores an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Mesh,
    Material,
    Texture,
}

impl Kind {
    fn tag(self) -> &'static [u8] {
        match self {
            Kind::Mesh => b"mesh",
            Kind::Material => b"material",
            Kind::Texture => b"texture",
        }
    }
}

pub(crate) fn name_hash(kind: Kind, name: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(kind.tag());
    hasher.update([0u8]);
    hasher.update(name.as_bytes());
    let result = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&result[..8]);
    u64::from_le_bytes(bytes)
}

/// Handle a mesh registered under `name` has (or will have).
pub fn mesh_handle(name: &str) -> MeshHandle {
    MeshHandle(name_hash(Kind::Mesh, name))
}

/// Handle a material registered under `name` has (or will have).
pub fn material_handle(name: &str) -> MaterialHandle {
    MaterialHandle(name_hash(Kind::Material, name))
}

/// Handle a texture registered under `name` has (or will have).
pub fn texture_handle(name: &str) -> TextureHandle {
    TextureHandle(name_hash(Kind::Texture, name))
}

/// Process-wide resource cache shared between import workers and the renderer.
#[derive(Debug, Default)]
pub struct ResourceCache {
    inner: RwLock<CacheInner>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache pre-populated with the built-in meshes and default material.
    pub fn with_builtins() -> Self {
        let cache = Self::new();
        cache.insert_mesh(primitives::CUBE, primitives::cube());
        cache.insert_mesh(primitives::QUAD, primitives::quad());
        cache.insert_mesh(primitives::SPHERE, primitives::sphere(32, 16));
        cache.insert_material(Material::DEFAULT_NAME, Material::default());
        cache
    }

    // --- insertion ---

    pub fn insert_mesh(&self, name: &str, mesh: Mesh) -> MeshHandle {
        let handle = mesh_handle(name);
        let mut inner = self.inner.write();
        let version = inner.bump_version();
        inner.meshes.publish(handle.0, name, mesh, version);
        tracing::debug!(%handle, name, version, "mesh ready");
        handle
    }

    pub fn insert_material(&self, name: &str, material: Material) -> MaterialHandle {
        let handle = material_handle(name);
        let mut inner = self.inner.write();
        let version = inner.bump_version();
        inner.materials.publish(handle.0, name, material, version);
        tracing::debug!(%handle, name, version, "material ready");
        handle
    }

    pub fn insert_texture(&self, name: &str, texture: TextureData) -> TextureHandle {
        let handle = texture_handle(name);
        let mut inner = self.inner.write();
        let version = inner.bump_version();
        inner.textures.publish(handle.0, name, texture, version);
        tracing::debug!(%handle, name, version, "texture ready");
        handle
    }

    // --- lookup ---

    pub fn mesh(&self, handle: MeshHandle) -> Lookup<Mesh> {
        self.inner.read().meshes.lookup(handle.0)
    }

    pub fn material(&self, handle: MaterialHandle) -> Lookup<Material> {
        self.inner.read().materials.lookup(handle.0)
    }

    pub fn texture(&self, handle: TextureHandle) -> Lookup<TextureData> {
        self.inner.read().textures.lookup(handle.0)
    }

    pub fn mesh_name(&self, handle: MeshHandle) -> Option<String> {
        self.inner
            .read()
            .meshes
            .entries
            .get(&handle.0)
            .map(|e| e.name.clone())
    }

    pub fn material_name(&self, handle: MaterialHandle) -> Option<String> {
        self.inner
            .read()
            .materials
            .entries
            .get(&handle.0)
            .map(|e| e.name.clone())
    }

    // --- eviction ---

    /// Remove a mesh. Outstanding `Arc`s keep the data alive until dropped.
    pub fn evict_mesh(&self, handle: MeshHandle) -> bool {
        self.inner.write().meshes.entries.remove(&handle.0).is_some()
    }

    pub fn evict_material(&self, handle: MaterialHandle) -> bool {
        self.inner.write().materials.entries.remove(&handle.0).is_some()
    }

    pub fn evict_texture(&self, handle: TextureHandle) -> bool {
        self.inner.write().textures.entries.remove(&handle.0).is_some()
    }

    // --- asynchronous loading protocol ---

    /// Mark `name` as loading and return the request generation. A newer
    /// request for the same name supersedes this one.
    pub(crate) fn begin_load(&self, kind: Kind, name: &str) -> (u64, u64) {
        let id = name_hash(kind, name);
        let mut inner = self.inner.write();
        let generation = inner.bump_generation();
        match kind {
            Kind::Mesh => inner.meshes.begin(id, name, generation),
            Kind::Material => inner.materials.begin(id, name, generation),
            Kind::Texture => inner.textures.begin(id, name, generation),
        }
        (id, generation)
    }

    /// True if `name` is ready or loading (a failed entry may be retried).
    pub(crate) fn is_live(&self, kind: Kind, name: &str) -> bool {
        let id = name_hash(kind, name);
        let inner = self.inner.read();
        match kind {
            Kind::Mesh => inner.meshes.is_live(id),
            Kind::Material => inner.materials.is_live(id),
            Kind::Texture => inner.textures.is_live(id),
        }
    }

    pub(crate) fn complete_mesh(
        &self,
        id: u64,
        generation: u64,
        result: Result<Mesh, String>,
    ) -> bool {
        let mut inner = self.inner.write();
        if !inner.meshes.is_current(id, generation) {
            return false;
        }
        match result {
            Ok(mesh) => {
                let version = inner.bump_version();
                let name = inner
                    .meshes
                    .entries
                    .get(&id)
                    .map(|e| e.name.clone())
                    .unwrap_or_else(|| mesh.name.clone());
                inner.meshes.publish(id, &name, mesh, version);
            }
            Err(reason) => inner.meshes.fail(id, reason),
        }
        true
    }

    pub(crate) fn complete_material(
        &self,
        id: u64,
        generation: u64,
        result: Result<Material, String>,
    ) -> bool {
        let mut inner = self.inner.write();
        if !inner.materials.is_current(id, generation) {
            return false;
        }
        match result {
            Ok(material) => {
                let version = inner.bump_version();
                let name = inner
                    .materials
                    .entries
                    .get(&id)
                    .map(|e| e.name.clone())
                    .unwrap_or_else(|| material.name.clone());
                inner.materials.publish(id, &name, material, version);
            }
            Err(reason) => inner.materials.fail(id, reason),
        }
        true
    }

    pub(crate) fn complete_texture(
        &self,
        id: u64,
        generation: u64,
        result: Result<TextureData, String>,
    ) -> bool {
        let mut inner = self.inner.write();
        if !inner.textures.is_current(id, generation) {
            return false;
        }
        match result {
            Ok(texture) => {
                let version = inner.bump_version();
                let name = inner
                    .textures
                    .entries
                    .get(&id)
                    .map(|e| e.name.clone())
                    .unwrap_or_else(|| texture.name.clone());
                inner.textures.publish(id, &name, texture, version);
            }
            Err(reason) => inner.textures.fail(id, reason),
        }
        true
    }

    /// Abandon an in-flight load. The worker's result will be discarded.
    pub(crate) fn cancel(&self, kind: Kind, id: u64) -> bool {
        let mut inner = self.inner.write();
        match kind {
            Kind::Mesh => inner.meshes.cancel(id),
            Kind::Material => inner.materials.cancel(id),
            Kind::Texture => inner.textures.cancel(id),
        }
    }

    /// Reserve `name` for a texture produced outside the import pool. The
    /// entry reads `Loading` until `finish_texture` publishes the result.
    pub fn reserve_texture(&self, name: &str) -> (TextureHandle, u64) {
        let (id, generation) = self.begin_load(Kind::Texture, name);
        (TextureHandle(id), generation)
    }

    /// Publish a reserved texture. Returns false if the reservation was
    /// superseded or cancelled.
    pub fn finish_texture(
        &self,
        handle: TextureHandle,
        generation: u64,
        result: Result<TextureData, String>,
    ) -> bool {
        self.complete_texture(handle.0, generation, result)
    }

    pub fn reserve_mesh(&self, name: &str) -> (MeshHandle, u64) {
        let (id, generation) = self.begin_load(Kind::Mesh, name);
        (MeshHandle(id), generation)
    }

    pub fn finish_mesh(
        &self,
        handle: MeshHandle,
        generation: u64,
        result: Result<Mesh, String>,
    ) -> bool {
        self.complete_mesh(handle.0, generation, result)
    }

    // --- stats ---

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read();
        let mut stats = CacheStats::default();
        for (r, l, f) in [inner.meshes.count(), inner.materials.count(), inner.textures.count()] {
            stats.ready += r;
            stats.loading += l;
            stats.failed += f;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spartan_common::Color;

    #[test]
    fn handles_are_stable_and_kind_scoped() {
        assert_eq!(mesh_handle("a"), mesh_handle("a"));
        assert_ne!(mesh_handle("a").0, material_handle("a").0);
        assert_ne!(texture_handle("a"), texture_handle("b"));
    }

    #[test]
    fn builtins_are_ready() {
        let cache = ResourceCache::with_builtins();
        assert!(cache.mesh(mesh_handle(primitives::CUBE)).is_ready());
        assert!(cache.material(material_handle(Material::DEFAULT_NAME)).is_ready());
        assert_eq!(cache.stats().ready, 4);
    }

    #[test]
    fn reinsert_bumps_version() {
        let cache = ResourceCache::new();
        let h = cache.insert_texture("t", TextureData::solid("t", Color::WHITE, true));
        let Lookup::Ready { version: v1, .. } = cache.texture(h) else {
            panic!("not ready");
        };
        cache.insert_texture("t", TextureData::solid("t", Color::BLACK, true));
        let Lookup::Ready { version: v2, .. } = cache.texture(h) else {
            panic!("not ready");
        };
        assert!(v2 > v1);
    }

    #[test]
    fn superseded_load_is_discarded() {
        let cache = ResourceCache::new();
        let (id, first) = cache.begin_load(Kind::Texture, "slow.png");
        let (_, second) = cache.begin_load(Kind::Texture, "slow.png");
        let stale = TextureData::solid("slow.png", Color::BLACK, true);
        assert!(!cache.complete_texture(id, first, Ok(stale)));
        assert!(matches!(cache.texture(TextureHandle(id)), Lookup::Loading));

        let fresh = TextureData::solid("slow.png", Color::WHITE, true);
        assert!(cache.complete_texture(id, second, Ok(fresh)));
        assert!(cache.texture(TextureHandle(id)).is_ready());
    }

    #[test]
    fn cancelled_load_is_discarded() {
        let cache = ResourceCache::new();
        let (id, generation) = cache.begin_load(Kind::Mesh, "m.json");
        assert!(cache.cancel(Kind::Mesh, id));
        assert!(!cache.complete_mesh(id, generation, Ok(primitives::quad())));
        assert!(matches!(cache.mesh(MeshHandle(id)), Lookup::Missing));
    }

    #[test]
    fn reload_keeps_previous_value_until_published() {
        let cache = ResourceCache::new();
        let wall = TextureData::solid("wall.png", Color::WHITE, true);
        let h = cache.insert_texture("wall.png", wall);
        let Lookup::Ready { version: before, .. } = cache.texture(h) else {
            panic!("not ready");
        };

        let (id, generation) = cache.begin_load(Kind::Texture, "wall.png");
        assert_eq!(id, h.0);
        match cache.texture(h) {
            Lookup::Ready { version, .. } => assert_eq!(version, before),
            other => panic!("reload hid the previous value: {other:?}"),
        }
        assert_eq!(cache.stats().loading, 1);

        let fresh = TextureData::solid("wall.png", Color::BLACK, true);
        assert!(cache.complete_texture(id, generation, Ok(fresh)));
        let Lookup::Ready { version: after, .. } = cache.texture(h) else {
            panic!("not ready");
        };
        assert!(after > before);
    }

    #[test]
    fn cancelled_reload_restores_previous_value() {
        let cache = ResourceCache::new();
        let wall = TextureData::solid("wall.png", Color::WHITE, true);
        let h = cache.insert_texture("wall.png", wall);
        let (id, generation) = cache.begin_load(Kind::Texture, "wall.png");

        assert!(cache.cancel(Kind::Texture, id));
        assert!(cache.texture(h).is_ready());
        assert_eq!(cache.stats(), CacheStats { ready: 1, loading: 0, failed: 0 });

        let late = TextureData::solid("wall.png", Color::BLACK, true);
        assert!(!cache.complete_texture(id, generation, Ok(late)));
        assert!(!cache.cancel(Kind::Texture, id));
    }

    #[test]
    fn failed_reload_keeps_previous_value() {
        let cache = ResourceCache::with_builtins();
        let h = mesh_handle(primitives::CUBE);
        let (id, generation) = cache.begin_load(Kind::Mesh, primitives::CUBE);
        assert!(cache.complete_mesh(id, generation, Err("truncated".into())));
        assert_eq!(cache.mesh(h).ready().map(|m| m.vertices.len()), Some(24));
    }

    #[test]
    fn failed_load_reports_reason() {
        let cache = ResourceCache::new();
        let (id, generation) = cache.begin_load(Kind::Material, "broken.json");
        cache.complete_material(id, generation, Err("bad json".into()));
        match cache.material(MaterialHandle(id)) {
            Lookup::Failed(reason) => assert_eq!(reason, "bad json"),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(cache.stats().failed, 1);
    }

    #[test]
    fn reserved_texture_reads_loading_until_finished() {
        let cache = ResourceCache::new();
        let (h, generation) = cache.reserve_texture("streamed.png");
        assert_eq!(h, texture_handle("streamed.png"));
        assert!(matches!(cache.texture(h), Lookup::Loading));
        let data = TextureData::solid("streamed.png", Color::WHITE, true);
        assert!(cache.finish_texture(h, generation, Ok(data)));
        assert!(cache.texture(h).is_ready());
    }

    #[test]
    fn evicted_data_outlives_cache_entry() {
        let cache = ResourceCache::with_builtins();
        let h = mesh_handle(primitives::CUBE);
        let held = cache.mesh(h).ready().cloned().unwrap();
        assert!(cache.evict_mesh(h));
        assert!(matches!(cache.mesh(h), Lookup::Missing));
        assert_eq!(held.vertices.len(), 24);
    }
}
