use serde::{Deserialize, Serialize};
use spartan_common::{Color, TextureHandle};
use std::collections::BTreeMap;

/// Texture binding points of a material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextureSlot {
    Albedo,
    Normal,
    Roughness,
    Metallic,
    Occlusion,
    Emissive,
}

impl TextureSlot {
    pub const ALL: [TextureSlot; 6] = [
        Self::Albedo,
        Self::Normal,
        Self::Roughness,
        Self::Metallic,
        Self::Occlusion,
        Self::Emissive,
    ];

    /// Shader texture slot index.
    pub fn index(self) -> u32 {
        self as u32
    }

    /// Whether texels are stored in sRGB.
    pub fn is_srgb(self) -> bool {
        matches!(self, Self::Albedo | Self::Emissive)
    }
}

/// How a material is composited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlendMode {
    /// Written to the GBuffer and lit in the deferred lighting pass.
    #[default]
    Opaque,
    /// Forward shaded after lighting, sorted back to front.
    Transparent,
}

/// Surface description consumed by the renderer.
#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub name: String,
    pub albedo: Color,
    pub roughness: f32,
    pub metallic: f32,
    pub normal_strength: f32,
    pub emissive: Color,
    pub uv_tiling: [f32; 2],
    pub uv_offset: [f32; 2],
    pub blend: BlendMode,
    pub textures: BTreeMap<TextureSlot, TextureHandle>,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            name: "default".into(),
            albedo: Color::rgb(0.8, 0.8, 0.8),
            roughness: 0.5,
            metallic: 0.0,
            normal_strength: 1.0,
            emissive: Color::BLACK,
            uv_tiling: [1.0, 1.0],
            uv_offset: [0.0, 0.0],
            blend: BlendMode::Opaque,
            textures: BTreeMap::new(),
        }
    }
}

impl Material {
    pub const DEFAULT_NAME: &'static str = "builtin:default_material";

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_albedo(mut self, albedo: Color) -> Self {
        self.albedo = albedo;
        self
    }

    pub fn with_texture(mut self, slot: TextureSlot, texture: TextureHandle) -> Self {
        self.textures.insert(slot, texture);
        self
    }

    pub fn with_blend(mut self, blend: BlendMode) -> Self {
        self.blend = blend;
        self
    }

    pub fn is_transparent(&self) -> bool {
        self.blend == BlendMode::Transparent || self.albedo.a < 1.0
    }

    pub fn texture(&self, slot: TextureSlot) -> Option<TextureHandle> {
        self.textures.get(&slot).copied()
    }
}

/// On-disk material description (JSON). Texture paths are relative to the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialDesc {
    pub name: String,
    #[serde(default = "default_albedo")]
    pub albedo: [f32; 4],
    #[serde(default = "default_roughness")]
    pub roughness: f32,
    #[serde(default)]
    pub metallic: f32,
    #[serde(default = "one")]
    pub normal_strength: f32,
    #[serde(default)]
    pub emissive: [f32; 3],
    #[serde(default = "default_tiling")]
    pub uv_tiling: [f32; 2],
    #[serde(default)]
    pub uv_offset: [f32; 2],
    #[serde(default)]
    pub blend: BlendMode,
    #[serde(default)]
    pub textures: BTreeMap<TextureSlot, String>,
}

fn default_albedo() -> [f32; 4] {
    [0.8, 0.8, 0.8, 1.0]
}

fn default_roughness() -> f32 {
    0.5
}

fn one() -> f32 {
    1.0
}

fn default_tiling() -> [f32; 2] {
    [1.0, 1.0]
}

impl MaterialDesc {
    /// Build the material given already-requested texture handles.
    pub fn into_material(self, textures: BTreeMap<TextureSlot, TextureHandle>) -> Material {
        let [r, g, b, a] = self.albedo;
        let [er, eg, eb] = self.emissive;
        Material {
            name: self.name,
            albedo: Color::rgba(r, g, b, a),
            roughness: self.roughness.clamp(0.0, 1.0),
            metallic: self.metallic.clamp(0.0, 1.0),
            normal_strength: self.normal_strength,
            emissive: Color::rgb(er, eg, eb),
            uv_tiling: self.uv_tiling,
            uv_offset: self.uv_offset,
            blend: self.blend,
            textures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translucent_albedo_counts_as_transparent() {
        let m = Material::named("glass").with_albedo(Color::rgba(1.0, 1.0, 1.0, 0.4));
        assert!(m.is_transparent());
        assert!(!Material::default().is_transparent());
    }

    #[test]
    fn desc_parses_with_defaults() {
        let desc: MaterialDesc = serde_json::from_str(
            r#"{ "name": "brick", "roughness": 2.0, "textures": { "albedo": "brick.png" } }"#,
        )
        .unwrap();
        assert_eq!(desc.textures[&TextureSlot::Albedo], "brick.png");
        let m = desc.into_material(BTreeMap::new());
        assert_eq!(m.roughness, 1.0);
        assert_eq!(m.albedo, Color::rgba(0.8, 0.8, 0.8, 1.0));
        assert_eq!(m.blend, BlendMode::Opaque);
    }

    #[test]
    fn slot_indices_are_dense() {
        for (i, slot) in TextureSlot::ALL.iter().enumerate() {
            assert_eq!(slot.index() as usize, i);
        }
    }
}
