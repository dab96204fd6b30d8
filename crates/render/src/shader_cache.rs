//! Compiled shader variations and the pipelines built from them.

use crate::device::{DeviceError, GraphicsDevice, PipelineId, ShaderDesc, ShaderId};
use crate::shader::{PipelineKind, ShaderFlags, ShaderSource};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariationKey {
    pub source: ShaderSource,
    pub flags: ShaderFlags,
    pub pipeline: PipelineKind,
}

impl VariationKey {
    pub fn new(source: ShaderSource, flags: ShaderFlags, pipeline: PipelineKind) -> Self {
        Self {
            source,
            flags,
            pipeline,
        }
    }
}

/// A compiled variation and the pipeline built from it; directly bindable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderVariation {
    pub shader: ShaderId,
    pub pipeline: PipelineId,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShaderCacheStats {
    /// Distinct (source, flags) pairs compiled and cached.
    pub variations: usize,
    /// Pipelines built from those variations.
    pub pipelines: usize,
    pub hits: u64,
    /// Lookups that had to compile a shader.
    pub misses: u64,
    /// Compile or pipeline creation attempts that failed.
    pub failures: u64,
}

/// Remembered failures are not retried until cleared.
#[derive(Debug)]
enum Compiled<T> {
    Ready(T),
    Failed { name: String, log: String },
}

impl<T: Copy> Compiled<T> {
    fn get(&self) -> Result<T, DeviceError> {
        match self {
            Compiled::Ready(value) => Ok(*value),
            Compiled::Failed { name, log } => Err(DeviceError::Compile {
                name: name.clone(),
                log: log.clone(),
            }),
        }
    }

    fn failed(source: ShaderSource, error: &DeviceError) -> Self {
        let (name, log) = match error {
            DeviceError::Compile { name, log } => (name.clone(), log.clone()),
            other => (source.file_name().to_string(), other.to_string()),
        };
        Compiled::Failed { name, log }
    }

    fn is_ready(&self) -> bool {
        matches!(self, Compiled::Ready(_))
    }
}

fn defines_list(flags: ShaderFlags) -> String {
    flags
        .defines()
        .into_iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Compile-on-first-use cache. Shader modules are keyed by source and flags,
/// pipelines additionally by pipeline kind, so a new pipeline kind reuses the
/// compiled module. Entries live until the cache is cleared.
#[derive(Debug, Default)]
pub struct ShaderVariationCache {
    modules: HashMap<(ShaderSource, ShaderFlags), Compiled<ShaderId>>,
    pipelines: HashMap<VariationKey, Compiled<ShaderVariation>>,
    hits: u64,
    misses: u64,
    failures: u64,
}

impl ShaderVariationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached variation for `key`, compiling it on first use.
    ///
    /// A variation that failed before fails again with the stored log and
    /// is not recompiled until `clear_failures`. Fatal device errors are
    /// returned without being remembered.
    pub fn get_or_compile<D: GraphicsDevice>(
        &mut self,
        device: &mut D,
        key: VariationKey,
    ) -> Result<ShaderVariation, DeviceError> {
        if let Some(entry) = self.pipelines.get(&key) {
            self.hits += 1;
            return entry.get();
        }
        let shader = self.module(device, key.source, key.flags)?;

        let label = format!(
            "{}:{:?}:{:#x}",
            key.source.file_name(),
            key.pipeline,
            key.flags.bits()
        );
        match device.create_pipeline(&key.pipeline.pipeline_desc(label, shader)) {
            Ok(pipeline) => {
                tracing::debug!(
                    source = key.source.file_name(),
                    flags = ?key.flags,
                    pipeline = ?key.pipeline,
                    "pipeline created"
                );
                let variation = ShaderVariation { shader, pipeline };
                self.pipelines.insert(key, Compiled::Ready(variation));
                Ok(variation)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.failures += 1;
                tracing::error!(
                    source = key.source.file_name(),
                    pipeline = ?key.pipeline,
                    defines = %defines_list(key.flags),
                    error = %e,
                    "pipeline creation failed"
                );
                self.pipelines.insert(key, Compiled::failed(key.source, &e));
                Err(e)
            }
        }
    }

    /// The compiled module for `(source, flags)`, compiling it at most once.
    fn module<D: GraphicsDevice>(
        &mut self,
        device: &mut D,
        source: ShaderSource,
        flags: ShaderFlags,
    ) -> Result<ShaderId, DeviceError> {
        if let Some(entry) = self.modules.get(&(source, flags)) {
            self.hits += 1;
            return entry.get();
        }
        self.misses += 1;

        let defines = flags.defines();
        let result = device.compile_shader(&ShaderDesc {
            name: source.file_name(),
            source: source.code(),
            defines: &defines,
        });
        match result {
            Ok(shader) => {
                tracing::debug!(source = source.file_name(), ?flags, "shader variation compiled");
                self.modules.insert((source, flags), Compiled::Ready(shader));
                Ok(shader)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.failures += 1;
                tracing::error!(
                    source = source.file_name(),
                    defines = %defines_list(flags),
                    error = %e,
                    "shader variation failed to compile"
                );
                self.modules.insert((source, flags), Compiled::failed(source, &e));
                Err(e)
            }
        }
    }

    /// Forget remembered failures so they are retried, e.g. after shader
    /// sources changed. Returns how many were dropped.
    pub fn clear_failures(&mut self) -> usize {
        let before = self.modules.len() + self.pipelines.len();
        self.modules.retain(|_, e| e.is_ready());
        self.pipelines.retain(|_, e| e.is_ready());
        before - self.modules.len() - self.pipelines.len()
    }

    pub fn stats(&self) -> ShaderCacheStats {
        ShaderCacheStats {
            variations: self.modules.values().filter(|e| e.is_ready()).count(),
            pipelines: self.pipelines.values().filter(|e| e.is_ready()).count(),
            hits: self.hits,
            misses: self.misses,
            failures: self.failures,
        }
    }

    /// Destroy every cached pipeline.
    pub fn release<D: GraphicsDevice>(&mut self, device: &mut D) {
        for (_, entry) in self.pipelines.drain() {
            if let Compiled::Ready(variation) = entry {
                device.destroy_pipeline(variation.pipeline);
            }
        }
        self.modules.clear();
    }

    /// Drop every entry without touching the device, after it was recreated.
    pub fn forget(&mut self) {
        self.modules.clear();
        self.pipelines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RecordingDevice;

    fn key(flags: ShaderFlags) -> VariationKey {
        VariationKey::new(ShaderSource::GBuffer, flags, PipelineKind::GBuffer)
    }

    #[test]
    fn cached_variation_is_not_recompiled() {
        let mut device = RecordingDevice::new();
        let mut cache = ShaderVariationCache::new();
        let a = cache.get_or_compile(&mut device, key(ShaderFlags::ALBEDO_MAP)).unwrap();
        let b = cache.get_or_compile(&mut device, key(ShaderFlags::ALBEDO_MAP)).unwrap();
        assert_eq!(a, b);
        assert_eq!(device.compile_count(), 1);

        cache.get_or_compile(&mut device, key(ShaderFlags::NORMAL_MAP)).unwrap();
        assert_eq!(device.compile_count(), 2);
        let stats = cache.stats();
        assert_eq!((stats.variations, stats.hits, stats.misses), (2, 1, 2));
    }

    #[test]
    fn new_pipeline_kind_reuses_compiled_module() {
        let mut device = RecordingDevice::new();
        let mut cache = ShaderVariationCache::new();
        let plain = cache.get_or_compile(&mut device, key(ShaderFlags::empty())).unwrap();
        let prepassed = cache
            .get_or_compile(
                &mut device,
                VariationKey::new(
                    ShaderSource::GBuffer,
                    ShaderFlags::empty(),
                    PipelineKind::GBufferPrepassed,
                ),
            )
            .unwrap();
        assert_ne!(plain.pipeline, prepassed.pipeline);
        assert_eq!(plain.shader, prepassed.shader);
        assert_eq!(device.compile_count(), 1);
        let stats = cache.stats();
        assert_eq!((stats.variations, stats.pipelines), (1, 2));
    }

    #[test]
    fn failures_are_remembered_until_cleared() {
        let mut device = RecordingDevice::new();
        device.fail_shaders_defining(Some("HAS_NORMAL_MAP"));
        let mut cache = ShaderVariationCache::new();
        let k = key(ShaderFlags::NORMAL_MAP);

        for _ in 0..3 {
            let err = cache.get_or_compile(&mut device, k).unwrap_err();
            assert!(matches!(err, DeviceError::Compile { .. }));
        }
        // Another pipeline kind over the same failed module does not retry it.
        let prepassed = VariationKey::new(
            ShaderSource::GBuffer,
            ShaderFlags::NORMAL_MAP,
            PipelineKind::GBufferPrepassed,
        );
        assert!(cache.get_or_compile(&mut device, prepassed).is_err());
        assert_eq!(device.compile_count(), 1);
        assert_eq!(cache.stats().failures, 1);

        device.fail_shaders_defining(None);
        assert_eq!(cache.clear_failures(), 1);
        assert!(cache.get_or_compile(&mut device, k).is_ok());
        assert_eq!(device.compile_count(), 2);
    }

    #[test]
    fn device_loss_is_not_cached() {
        let mut device = RecordingDevice::new();
        device.lose_device();
        let mut cache = ShaderVariationCache::new();
        let err = cache.get_or_compile(&mut device, key(ShaderFlags::empty())).unwrap_err();
        assert_eq!(err, DeviceError::Lost);
        assert_eq!(cache.stats().failures, 0);
        assert_eq!(cache.clear_failures(), 0);
    }

    #[test]
    fn release_destroys_pipelines() {
        let mut device = RecordingDevice::new();
        let mut cache = ShaderVariationCache::new();
        let variation = cache.get_or_compile(&mut device, key(ShaderFlags::empty())).unwrap();
        cache.release(&mut device);
        assert!(device.pipeline_desc(variation.pipeline).is_none());
        assert_eq!(cache.stats().pipelines, 0);
    }
}
