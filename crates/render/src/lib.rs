//! Deferred renderer over a backend-agnostic graphics device.
//!
//! A frame is extracted from the scene into a `FrameInput`, then rendered in
//! fixed stages: resolve, depth pre-pass, GBuffer fill, lighting,
//! transparency, post-processing and present.
//!
//! # Invariants
//! - The renderer never mutates the scene; frame state is derived from the
//!   scene, the component store and the resource cache.
//! - Every GPU object is created through `GraphicsDevice` and can be rebuilt
//!   after device loss.

pub mod device;

mod constants;
mod culling;
mod gbuffer;
mod gpu_resources;
mod renderer;
mod report;
mod settings;
mod shader;
mod shader_cache;
mod view;

pub use constants::{
    ConstantArena, FrameConstants, LightConstants, LightData, MAX_FORWARD_LIGHTS,
    MaterialConstants, ObjectConstants, PostConstants,
};
pub use culling::{Frustum, sphere_scissor};
pub use gbuffer::{GBuffer, GBufferTargets};
pub use gpu_resources::{
    DefaultTextures, GpuMesh, GpuResources, MaterialResolution, MeshResolution, ResolvedMaterial,
};
pub use renderer::Renderer;
pub use report::{FrameError, FrameOutcome, FrameReport, SkipReason, Stage};
pub use settings::{RendererSettings, SettingsError, ToneMapper};
pub use shader::{
    HDR_FORMAT, LDR_FORMAT, PipelineKind, PreprocessError, ShaderFlags, ShaderSource, preprocess,
};
pub use shader_cache::{ShaderCacheStats, ShaderVariation, ShaderVariationCache, VariationKey};
pub use view::{DrawFlags, DrawItem, FrameInput, LightItem, PresentTarget, ViewInput, extract_frame};
