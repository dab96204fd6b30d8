//! What a frame did: stages, draw counts, skipped renderables, errors.

use crate::device::DeviceError;
use crate::shader_cache::ShaderCacheStats;
use spartan_common::EntityId;
use std::collections::BTreeMap;
use std::fmt;

/// Frame stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Resolve,
    DepthPrepass,
    GBuffer,
    Lighting,
    Transparency,
    PostProcess,
    Present,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Self::Resolve,
        Self::DepthPrepass,
        Self::GBuffer,
        Self::Lighting,
        Self::Transparency,
        Self::PostProcess,
        Self::Present,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Resolve => "resolve",
            Self::DepthPrepass => "depth_prepass",
            Self::GBuffer => "gbuffer",
            Self::Lighting => "lighting",
            Self::Transparency => "transparency",
            Self::PostProcess => "post_process",
            Self::Present => "present",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a renderable was left out of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    MeshMissing,
    MaterialMissing,
    /// Mesh, material or one of its textures is still loading.
    NotReady,
    /// The shader variation for its material failed to compile.
    ShaderUnavailable,
    Culled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameOutcome {
    #[default]
    Rendered,
    /// No active camera; the output was cleared and nothing was drawn.
    NoCamera,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameReport {
    pub frame_index: u64,
    pub outcome: FrameOutcome,
    /// Stages that ran, in order.
    pub stages: Vec<Stage>,
    pub draws: BTreeMap<Stage, u32>,
    pub skipped: Vec<(EntityId, SkipReason)>,
    /// View depth of each transparent draw in submission order.
    pub transparent_distances: Vec<f32>,
    pub lights_drawn: u32,
    pub lights_culled: u32,
    pub shaders: ShaderCacheStats,
}

impl FrameReport {
    pub fn draw_count(&self, stage: Stage) -> u32 {
        self.draws.get(&stage).copied().unwrap_or(0)
    }

    pub fn total_draws(&self) -> u32 {
        self.draws.values().sum()
    }

    pub fn skipped_for(&self, reason: SkipReason) -> usize {
        self.skipped.iter().filter(|(_, r)| *r == reason).count()
    }

    pub(crate) fn count_draw(&mut self, stage: Stage) {
        *self.draws.entry(stage).or_default() += 1;
    }
}

impl fmt::Display for FrameReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "frame {} ({:?})", self.frame_index, self.outcome)?;
        for stage in &self.stages {
            writeln!(f, "  {:<14} {:>5} draws", stage.name(), self.draw_count(*stage))?;
        }
        writeln!(
            f,
            "  lights: {} drawn, {} culled",
            self.lights_drawn, self.lights_culled
        )?;
        if !self.skipped.is_empty() {
            writeln!(f, "  skipped: {}", self.skipped.len())?;
            for (entity, reason) in &self.skipped {
                writeln!(f, "    {} {:?}", entity.short(), reason)?;
            }
        }
        write!(
            f,
            "  shaders: {} variations, {} pipelines, {} hits, {} misses, {} failures",
            self.shaders.variations,
            self.shaders.pipelines,
            self.shaders.hits,
            self.shaders.misses,
            self.shaders.failures
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A device call failed mid-frame. The remaining stages were not run and
    /// GPU resources are rebuilt at the start of the next frame.
    #[error("{stage} stage failed: {source}")]
    Device {
        stage: Stage,
        /// Stages fully recorded and submitted before the failure.
        completed: Vec<Stage>,
        #[source]
        source: DeviceError,
    },
    /// Rebuilding GPU resources after an earlier failure did not succeed.
    #[error("failed to recreate GPU resources: {0}")]
    Recreate(#[source] DeviceError),
}

impl FrameError {
    pub fn device_error(&self) -> &DeviceError {
        match self {
            Self::Device { source, .. } | Self::Recreate(source) => source,
        }
    }
}
