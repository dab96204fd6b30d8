//! Renderer configuration, loaded from YAML.

use serde::{Deserialize, Serialize};
use spartan_common::Color;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Tone mapping operator of the post-processing stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToneMapper {
    #[default]
    Aces,
    Reinhard,
    /// Exposure and gamma only.
    None,
}

/// Renderer options. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererSettings {
    /// Initial output size in pixels.
    pub resolution: [u32; 2],
    pub depth_prepass: bool,
    pub fxaa: bool,
    /// Sharpen strength; 0 disables the pass.
    pub sharpen_strength: f32,
    pub tone_mapper: ToneMapper,
    pub exposure: f32,
    pub gamma: f32,
    pub ambient_color: Color,
    pub ambient_intensity: f32,
    /// Restrict point and spot light passes to their projected volume.
    pub light_volume_scissor: bool,
    pub frustum_culling: bool,
    pub vsync: bool,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            resolution: [1280, 720],
            depth_prepass: true,
            fxaa: true,
            sharpen_strength: 0.0,
            tone_mapper: ToneMapper::Aces,
            exposure: 1.0,
            gamma: 2.2,
            ambient_color: Color::WHITE,
            ambient_intensity: 0.03,
            light_volume_scissor: true,
            frustum_culling: true,
            vsync: true,
        }
    }
}

impl RendererSettings {
    pub fn from_yaml(text: &str) -> Result<Self, SettingsError> {
        let settings: Self = serde_yaml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_yaml(&self) -> Result<String, SettingsError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = Self::from_yaml(&text)?;
        tracing::info!(path = %path.display(), "renderer settings loaded");
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        std::fs::write(path, self.to_yaml()?).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.resolution.contains(&0) {
            return Err(SettingsError::Invalid(format!(
                "resolution {}x{} has a zero dimension",
                self.resolution[0], self.resolution[1]
            )));
        }
        if !self.exposure.is_finite() || self.exposure <= 0.0 {
            return Err(SettingsError::Invalid(format!(
                "exposure {} must be positive",
                self.exposure
            )));
        }
        if !self.gamma.is_finite() || self.gamma <= 0.0 {
            return Err(SettingsError::Invalid(format!("gamma {} must be positive", self.gamma)));
        }
        if !(0.0..=1.0).contains(&self.sharpen_strength) {
            return Err(SettingsError::Invalid(format!(
                "sharpen_strength {} outside 0..=1",
                self.sharpen_strength
            )));
        }
        if self.ambient_intensity < 0.0 {
            return Err(SettingsError::Invalid("ambient_intensity is negative".into()));
        }
        Ok(())
    }

    /// Ambient light color premultiplied by intensity.
    pub fn ambient(&self) -> [f32; 3] {
        let c = self.ambient_color;
        let i = self.ambient_intensity;
        [c.r * i, c.g * i, c.b * i]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let s = RendererSettings::from_yaml("fxaa: false\ntone_mapper: reinhard\n").unwrap();
        assert!(!s.fxaa);
        assert_eq!(s.tone_mapper, ToneMapper::Reinhard);
        assert!(s.depth_prepass);
        assert_eq!(s.resolution, [1280, 720]);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(matches!(
            RendererSettings::from_yaml("resolution: [0, 720]"),
            Err(SettingsError::Invalid(_))
        ));
        assert!(matches!(
            RendererSettings::from_yaml("gamma: -1.0"),
            Err(SettingsError::Invalid(_))
        ));
        assert!(matches!(
            RendererSettings::from_yaml("fxaa: [1, 2]"),
            Err(SettingsError::Yaml(_))
        ));
    }

    #[test]
    fn save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("renderer.yaml");
        let settings = RendererSettings {
            sharpen_strength: 0.4,
            vsync: false,
            ..RendererSettings::default()
        };
        settings.save(&path).unwrap();
        assert_eq!(RendererSettings::load(&path).unwrap(), settings);

        let missing = dir.path().join("missing.yaml");
        assert!(matches!(RendererSettings::load(&missing), Err(SettingsError::Io { .. })));
    }
}
