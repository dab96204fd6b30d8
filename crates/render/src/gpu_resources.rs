//! GPU copies of cached meshes and textures, and material resolution.
//!
//! Uploads happen synchronously on the render thread the first time a
//! handle is drawn, and again whenever the cache publishes a new version.
//! GPU objects of handles evicted from the cache are released by
//! `collect_garbage` at the start of the next frame, never mid-frame.

use crate::device::{
    BufferDesc, BufferId, BufferUsage, DeviceError, GraphicsDevice, TextureDesc, TextureFormat,
    TextureId, TextureUsage,
};
use crate::shader::ShaderFlags;
use spartan_common::{Color, MaterialHandle, MeshHandle, TextureHandle};
use spartan_resources::{Aabb, Lookup, Material, ResourceCache, TextureData, TextureSlot};
use std::collections::HashMap;
use std::sync::Arc;

/// A mesh resident on the GPU.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpuMesh {
    pub vertex_buffer: BufferId,
    pub index_buffer: BufferId,
    pub index_count: u32,
    /// Mesh-space bounds, for culling.
    pub bounds: Aabb,
    version: u64,
}

#[derive(Debug, Clone, Copy)]
struct GpuTexture {
    id: TextureId,
    version: u64,
}

/// 1x1 textures bound where a material has no usable texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultTextures {
    pub white: TextureId,
    pub black: TextureId,
    /// Tangent-space +Z.
    pub flat_normal: TextureId,
    /// Magenta, substituted for albedo textures that failed to load.
    pub missing: TextureId,
}

impl DefaultTextures {
    /// Neutral texture for `slot` when the material has none.
    pub fn for_slot(&self, slot: TextureSlot) -> TextureId {
        match slot {
            TextureSlot::Normal => self.flat_normal,
            TextureSlot::Emissive => self.black,
            TextureSlot::Albedo
            | TextureSlot::Roughness
            | TextureSlot::Metallic
            | TextureSlot::Occlusion => self.white,
        }
    }

    fn all(&self) -> [TextureId; 4] {
        [self.white, self.black, self.flat_normal, self.missing]
    }
}

#[derive(Debug)]
pub enum MeshResolution {
    Ready(GpuMesh),
    NotReady,
    Missing,
}

/// A material with every texture slot bound to a GPU texture.
#[derive(Debug, Clone)]
pub struct ResolvedMaterial {
    pub material: Arc<Material>,
    /// Texture features the shader variation must enable.
    pub flags: ShaderFlags,
    /// Indexed by `TextureSlot::index`.
    pub textures: [TextureId; 6],
}

impl ResolvedMaterial {
    pub fn is_transparent(&self) -> bool {
        self.material.is_transparent()
    }
}

#[derive(Debug)]
pub enum MaterialResolution {
    Ready(ResolvedMaterial),
    /// The material or one of its textures is still loading.
    NotReady,
    Missing,
}

fn slot_flag(slot: TextureSlot) -> ShaderFlags {
    match slot {
        TextureSlot::Albedo => ShaderFlags::ALBEDO_MAP,
        TextureSlot::Normal => ShaderFlags::NORMAL_MAP,
        TextureSlot::Roughness => ShaderFlags::ROUGHNESS_MAP,
        TextureSlot::Metallic => ShaderFlags::METALLIC_MAP,
        TextureSlot::Occlusion => ShaderFlags::OCCLUSION_MAP,
        TextureSlot::Emissive => ShaderFlags::EMISSIVE_MAP,
    }
}

#[derive(Debug, Default)]
pub struct GpuResources {
    meshes: HashMap<MeshHandle, GpuMesh>,
    textures: HashMap<TextureHandle, GpuTexture>,
    defaults: Option<DefaultTextures>,
}

impl GpuResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the default textures if they do not exist yet.
    pub fn ensure_defaults<D: GraphicsDevice>(
        &mut self,
        device: &mut D,
    ) -> Result<DefaultTextures, DeviceError> {
        if let Some(defaults) = self.defaults {
            return Ok(defaults);
        }
        let specs = [
            ("default_white", Color::WHITE),
            ("default_black", Color::BLACK),
            ("default_flat_normal", Color::rgb(0.5, 0.5, 1.0)),
            ("default_missing", Color::MISSING),
        ];
        let mut ids = Vec::with_capacity(specs.len());
        for (label, color) in specs {
            let desc = TextureDesc {
                label: label.into(),
                width: 1,
                height: 1,
                format: TextureFormat::Rgba8Unorm,
                usage: TextureUsage::SAMPLED | TextureUsage::COPY_DST,
            };
            match device.create_texture(&desc, Some(&color.to_rgba8())) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    for id in ids {
                        device.destroy_texture(id);
                    }
                    return Err(e);
                }
            }
        }
        let defaults = DefaultTextures {
            white: ids[0],
            black: ids[1],
            flat_normal: ids[2],
            missing: ids[3],
        };
        self.defaults = Some(defaults);
        Ok(defaults)
    }

    pub fn defaults(&self) -> Option<DefaultTextures> {
        self.defaults
    }

    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    /// GPU buffers for `handle`, uploading on first use or version change.
    pub fn resolve_mesh<D: GraphicsDevice>(
        &mut self,
        device: &mut D,
        cache: &ResourceCache,
        handle: MeshHandle,
    ) -> Result<MeshResolution, DeviceError> {
        let (mesh, version) = match cache.mesh(handle) {
            Lookup::Ready { value, version } => (value, version),
            Lookup::Loading => return Ok(MeshResolution::NotReady),
            Lookup::Failed(reason) => {
                tracing::warn!(%handle, %reason, "mesh failed to load");
                return Ok(MeshResolution::Missing);
            }
            Lookup::Missing => return Ok(MeshResolution::Missing),
        };
        if let Some(gpu) = self.meshes.get(&handle) {
            if gpu.version == version {
                return Ok(MeshResolution::Ready(*gpu));
            }
        }

        let vertices: &[u8] = bytemuck::cast_slice(&mesh.vertices);
        let indices: &[u8] = bytemuck::cast_slice(&mesh.indices);
        let vertex_buffer = device.create_buffer(
            &BufferDesc {
                label: format!("{}_vertices", mesh.name),
                size: vertices.len() as u64,
                usage: BufferUsage::VERTEX | BufferUsage::COPY_DST,
            },
            Some(vertices),
        )?;
        let index_buffer = match device.create_buffer(
            &BufferDesc {
                label: format!("{}_indices", mesh.name),
                size: indices.len() as u64,
                usage: BufferUsage::INDEX | BufferUsage::COPY_DST,
            },
            Some(indices),
        ) {
            Ok(id) => id,
            Err(e) => {
                device.destroy_buffer(vertex_buffer);
                return Err(e);
            }
        };

        let gpu = GpuMesh {
            vertex_buffer,
            index_buffer,
            index_count: mesh.index_count(),
            bounds: mesh.bounds,
            version,
        };
        if let Some(old) = self.meshes.insert(handle, gpu) {
            device.destroy_buffer(old.vertex_buffer);
            device.destroy_buffer(old.index_buffer);
            tracing::debug!(%handle, name = %mesh.name, version, "mesh re-uploaded");
        } else {
            tracing::debug!(
                %handle,
                name = %mesh.name,
                vertices = mesh.vertices.len(),
                "mesh uploaded"
            );
        }
        Ok(MeshResolution::Ready(gpu))
    }

    /// Resolve a material and every texture it references.
    ///
    /// A texture still loading makes the whole material `NotReady`. A failed
    /// or unknown albedo texture is replaced by the magenta fallback; other
    /// failed slots fall back to their neutral default with the feature off.
    pub fn resolve_material<D: GraphicsDevice>(
        &mut self,
        device: &mut D,
        cache: &ResourceCache,
        handle: MaterialHandle,
    ) -> Result<MaterialResolution, DeviceError> {
        let material = match cache.material(handle) {
            Lookup::Ready { value, .. } => value,
            Lookup::Loading => return Ok(MaterialResolution::NotReady),
            Lookup::Failed(reason) => {
                tracing::warn!(%handle, %reason, "material failed to load");
                return Ok(MaterialResolution::Missing);
            }
            Lookup::Missing => return Ok(MaterialResolution::Missing),
        };
        let defaults = self.ensure_defaults(device)?;

        let mut flags = ShaderFlags::empty();
        let mut textures = TextureSlot::ALL.map(|slot| defaults.for_slot(slot));
        let mut loading = false;
        for slot in TextureSlot::ALL {
            let Some(texture) = material.texture(slot) else {
                continue;
            };
            let bound = match cache.texture(texture) {
                Lookup::Ready { value, version } => {
                    Some(self.upload_texture(device, texture, &value, version)?)
                }
                Lookup::Loading => {
                    loading = true;
                    None
                }
                Lookup::Failed(reason) => {
                    tracing::warn!(
                        material = %material.name,
                        ?slot,
                        %texture,
                        %reason,
                        "texture failed, using fallback"
                    );
                    (slot == TextureSlot::Albedo).then_some(defaults.missing)
                }
                Lookup::Missing => {
                    tracing::warn!(
                        material = %material.name,
                        ?slot,
                        %texture,
                        "texture not in cache, using fallback"
                    );
                    (slot == TextureSlot::Albedo).then_some(defaults.missing)
                }
            };
            if let Some(id) = bound {
                textures[slot.index() as usize] = id;
                flags |= slot_flag(slot);
            }
        }
        if loading {
            return Ok(MaterialResolution::NotReady);
        }
        Ok(MaterialResolution::Ready(ResolvedMaterial {
            material,
            flags,
            textures,
        }))
    }

    fn upload_texture<D: GraphicsDevice>(
        &mut self,
        device: &mut D,
        handle: TextureHandle,
        data: &TextureData,
        version: u64,
    ) -> Result<TextureId, DeviceError> {
        if let Some(gpu) = self.textures.get(&handle) {
            if gpu.version == version {
                return Ok(gpu.id);
            }
        }
        let desc = TextureDesc {
            label: data.name.clone(),
            width: data.width,
            height: data.height,
            format: if data.srgb {
                TextureFormat::Rgba8UnormSrgb
            } else {
                TextureFormat::Rgba8Unorm
            },
            usage: TextureUsage::SAMPLED | TextureUsage::COPY_DST,
        };
        let id = device.create_texture(&desc, Some(&data.pixels))?;
        if let Some(old) = self.textures.insert(handle, GpuTexture { id, version }) {
            device.destroy_texture(old.id);
        }
        tracing::debug!(
            %handle,
            name = %data.name,
            width = data.width,
            height = data.height,
            "texture uploaded"
        );
        Ok(id)
    }

    /// Release GPU objects whose handles are no longer in the cache.
    /// Returns how many were released.
    pub fn collect_garbage<D: GraphicsDevice>(
        &mut self,
        device: &mut D,
        cache: &ResourceCache,
    ) -> usize {
        let mut released = 0;
        self.meshes.retain(|&handle, gpu| {
            if matches!(cache.mesh(handle), Lookup::Missing) {
                device.destroy_buffer(gpu.vertex_buffer);
                device.destroy_buffer(gpu.index_buffer);
                released += 1;
                false
            } else {
                true
            }
        });
        self.textures.retain(|&handle, gpu| {
            if matches!(cache.texture(handle), Lookup::Missing) {
                device.destroy_texture(gpu.id);
                released += 1;
                false
            } else {
                true
            }
        });
        if released > 0 {
            tracing::debug!(released, "released GPU copies of evicted resources");
        }
        released
    }

    /// Destroy everything, defaults included.
    pub fn release<D: GraphicsDevice>(&mut self, device: &mut D) {
        for (_, gpu) in self.meshes.drain() {
            device.destroy_buffer(gpu.vertex_buffer);
            device.destroy_buffer(gpu.index_buffer);
        }
        for (_, gpu) in self.textures.drain() {
            device.destroy_texture(gpu.id);
        }
        if let Some(defaults) = self.defaults.take() {
            for id in defaults.all() {
                device.destroy_texture(id);
            }
        }
    }

    /// Drop every id without touching the device, after it was recreated.
    pub fn forget(&mut self) {
        self.meshes.clear();
        self.textures.clear();
        self.defaults = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RecordingDevice;
    use spartan_resources::{material_handle, mesh_handle, primitives, texture_handle};

    #[test]
    fn mesh_uploads_once_per_version() {
        let mut device = RecordingDevice::new();
        let cache = ResourceCache::with_builtins();
        let mut gpu = GpuResources::new();
        let cube = mesh_handle(primitives::CUBE);

        let MeshResolution::Ready(first) = gpu.resolve_mesh(&mut device, &cache, cube).unwrap()
        else {
            panic!("cube not ready");
        };
        let MeshResolution::Ready(again) = gpu.resolve_mesh(&mut device, &cache, cube).unwrap()
        else {
            panic!("cube not ready");
        };
        assert_eq!(first, again);
        assert_eq!(first.index_count, 36);
        assert_eq!(device.live_buffers(), 2);

        cache.insert_mesh(primitives::CUBE, primitives::cube());
        let MeshResolution::Ready(updated) = gpu.resolve_mesh(&mut device, &cache, cube).unwrap()
        else {
            panic!("cube not ready");
        };
        assert_ne!(updated.vertex_buffer, first.vertex_buffer);
        assert_eq!(device.live_buffers(), 2);
    }

    #[test]
    fn unknown_and_loading_meshes() {
        let mut device = RecordingDevice::new();
        let cache = ResourceCache::new();
        let mut gpu = GpuResources::new();
        assert!(matches!(
            gpu.resolve_mesh(&mut device, &cache, mesh_handle("nope")).unwrap(),
            MeshResolution::Missing
        ));
        let (h, _) = cache.reserve_mesh("streaming.json");
        assert!(matches!(
            gpu.resolve_mesh(&mut device, &cache, h).unwrap(),
            MeshResolution::NotReady
        ));
    }

    #[test]
    fn loading_texture_makes_material_not_ready() {
        let mut device = RecordingDevice::new();
        let cache = ResourceCache::new();
        let mut gpu = GpuResources::new();
        let (tex, generation) = cache.reserve_texture("bricks.png");
        let mat = cache.insert_material(
            "bricks",
            Material::named("bricks").with_texture(TextureSlot::Normal, tex),
        );
        assert!(matches!(
            gpu.resolve_material(&mut device, &cache, mat).unwrap(),
            MaterialResolution::NotReady
        ));

        let bricks = TextureData::solid("bricks.png", Color::WHITE, false);
        cache.finish_texture(tex, generation, Ok(bricks));
        let MaterialResolution::Ready(resolved) =
            gpu.resolve_material(&mut device, &cache, mat).unwrap()
        else {
            panic!("material not ready");
        };
        assert_eq!(resolved.flags, ShaderFlags::NORMAL_MAP);
        assert_eq!(gpu.texture_count(), 1);
    }

    #[test]
    fn failed_albedo_uses_magenta_fallback() {
        let mut device = RecordingDevice::new();
        let cache = ResourceCache::new();
        let mut gpu = GpuResources::new();
        let mat = cache.insert_material(
            "broken",
            Material::named("broken")
                .with_texture(TextureSlot::Albedo, texture_handle("gone.png"))
                .with_texture(TextureSlot::Roughness, texture_handle("gone_too.png")),
        );
        let MaterialResolution::Ready(resolved) =
            gpu.resolve_material(&mut device, &cache, mat).unwrap()
        else {
            panic!("material not ready");
        };
        let defaults = gpu.defaults().unwrap();
        assert_eq!(resolved.textures[TextureSlot::Albedo.index() as usize], defaults.missing);
        assert_eq!(resolved.textures[TextureSlot::Roughness.index() as usize], defaults.white);
        assert_eq!(resolved.flags, ShaderFlags::ALBEDO_MAP);
    }

    #[test]
    fn missing_material() {
        let mut device = RecordingDevice::new();
        let cache = ResourceCache::new();
        let mut gpu = GpuResources::new();
        assert!(matches!(
            gpu.resolve_material(&mut device, &cache, material_handle("nope")).unwrap(),
            MaterialResolution::Missing
        ));
    }

    #[test]
    fn evicted_resources_are_released_on_collect() {
        let mut device = RecordingDevice::new();
        let cache = ResourceCache::with_builtins();
        let mut gpu = GpuResources::new();
        let quad = mesh_handle(primitives::QUAD);
        gpu.resolve_mesh(&mut device, &cache, quad).unwrap();
        assert_eq!(gpu.collect_garbage(&mut device, &cache), 0);

        cache.evict_mesh(quad);
        // Still resident until the next collection.
        assert_eq!(gpu.mesh_count(), 1);
        assert_eq!(gpu.collect_garbage(&mut device, &cache), 1);
        assert_eq!(gpu.mesh_count(), 0);
        assert_eq!(device.live_buffers(), 0);
    }
}
