//! Backend abstraction: resource creation, command recording, submission.
//!
//! Resources are referred to by opaque ids owned by the device. Binding calls
//! only record state; the device validates it when a draw is issued, so a
//! bad binding surfaces as an error from `draw`/`draw_indexed`.
//!
//! # Slots
//! - Constant buffers: 0 frame, 1 object, 2 light, 3 material.
//! - Textures: 0..=5 color textures, 6 depth texture.
//! - Samplers: 0 linear-wrap, 1 point-clamp.

mod recording;

pub use recording::{Command, RecordingDevice};

use bitflags::bitflags;
use spartan_common::{Color, Rect};

macro_rules! device_id {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);
        )*
    };
}

device_id!(
    /// A vertex, index or constant buffer.
    BufferId,
    /// A 2D texture or render target.
    TextureId,
    SamplerId,
    /// A compiled shader module (one variation).
    ShaderId,
    PipelineId,
);

pub const CONSTANT_SLOT_FRAME: u32 = 0;
pub const CONSTANT_SLOT_OBJECT: u32 = 1;
pub const CONSTANT_SLOT_LIGHT: u32 = 2;
pub const CONSTANT_SLOT_MATERIAL: u32 = 3;
pub const CONSTANT_SLOTS: u32 = 4;
pub const COLOR_TEXTURE_SLOTS: u32 = 6;
pub const DEPTH_TEXTURE_SLOT: u32 = 6;
pub const TEXTURE_SLOTS: u32 = 7;
pub const SAMPLER_SLOT_LINEAR: u32 = 0;
pub const SAMPLER_SLOT_POINT: u32 = 1;
pub const SAMPLER_SLOTS: u32 = 2;

/// Errors reported by a device.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeviceError {
    #[error("device lost")]
    Lost,
    #[error("out of GPU memory creating {0}")]
    OutOfMemory(String),
    #[error("shader {name} failed to compile: {log}")]
    Compile { name: String, log: String },
    #[error("invalid {kind} handle {id}")]
    InvalidHandle { kind: &'static str, id: u64 },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("device has no swapchain to present to")]
    NoSwapchain,
    #[error("backend error: {0}")]
    Backend(String),
}

impl DeviceError {
    /// Errors after which the device (and everything created on it) must be
    /// recreated. Other errors only affect the call that produced them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Lost | Self::OutOfMemory(_) | Self::Unsupported(_) | Self::Backend(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Ok,
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Recording,
    Vulkan,
    Dx12,
    Metal,
    Gl,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub max_texture_dimension: u32,
    /// Required alignment of constant buffer binding offsets.
    pub constant_offset_alignment: u32,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            max_texture_dimension: 8192,
            constant_offset_alignment: 256,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const CONSTANT = 1 << 2;
        const COPY_DST = 1 << 3;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const SAMPLED = 1 << 0;
        const RENDER_TARGET = 1 << 1;
        const COPY_DST = 1 << 2;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    pub label: String,
    pub size: u64,
    pub usage: BufferUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Rgba16Float,
    Depth32Float,
}

impl TextureFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::Rgba8Unorm | Self::Rgba8UnormSrgb | Self::Depth32Float => 4,
            Self::Rgba16Float => 8,
        }
    }

    pub fn is_depth(self) -> bool {
        self == Self::Depth32Float
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureDesc {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl TextureDesc {
    /// A sampled render target.
    pub fn target(
        label: impl Into<String>,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Self {
        Self {
            label: label.into(),
            width,
            height,
            format,
            usage: TextureUsage::RENDER_TARGET | TextureUsage::SAMPLED,
        }
    }

    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel() as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Linear,
    Nearest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressMode {
    Repeat,
    ClampToEdge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerDesc {
    pub label: String,
    pub filter: FilterMode,
    pub address: AddressMode,
}

/// Shader source plus the macro set for one variation.
#[derive(Debug, Clone, Copy)]
pub struct ShaderDesc<'a> {
    /// Source file name, for diagnostics.
    pub name: &'a str,
    pub source: &'a str,
    pub defines: &'a [(String, String)],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexLayout {
    /// `spartan_resources::Vertex` from slot 0, u32 indices.
    Mesh,
    /// No vertex buffer; the shader generates a full-screen triangle.
    FullScreen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendMode {
    Replace,
    Additive,
    Alpha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Less,
    LessEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColorTarget {
    pub format: TextureFormat,
    pub blend: BlendMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthState {
    pub format: TextureFormat,
    pub compare: CompareOp,
    pub write: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDesc {
    pub label: String,
    pub shader: ShaderId,
    pub vertex_layout: VertexLayout,
    /// False for depth-only pipelines.
    pub fragment: bool,
    pub color_targets: Vec<ColorTarget>,
    pub depth: Option<DepthState>,
    pub cull: CullMode,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadOp<T> {
    Clear(T),
    Load,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorAttachment {
    pub texture: TextureId,
    pub load: LoadOp<Color>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthAttachment {
    pub texture: TextureId,
    pub load: LoadOp<f32>,
    /// Depth testing only; the attachment is not written.
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PassDesc {
    pub label: String,
    pub color: Vec<ColorAttachment>,
    pub depth: Option<DepthAttachment>,
}

/// A range of a constant buffer holding one constant block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConstantSlice {
    pub buffer: BufferId,
    pub offset: u64,
    pub size: u64,
}

/// Uniform interface over graphics backends.
///
/// Passes are recorded between `begin_pass` and `end_pass` and executed in
/// recording order when `submit` is called. Submission orders GPU work; it
/// does not block the CPU.
pub trait GraphicsDevice {
    fn backend(&self) -> BackendKind;
    fn capabilities(&self) -> Capabilities;
    fn status(&self) -> DeviceStatus;
    /// Rebuild the device after loss. Every id handed out before is invalid
    /// afterwards.
    fn recreate(&mut self) -> Result<(), DeviceError>;

    fn create_buffer(&mut self, desc: &BufferDesc, data: Option<&[u8]>)
    -> Result<BufferId, DeviceError>;
    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8])
    -> Result<(), DeviceError>;
    fn destroy_buffer(&mut self, buffer: BufferId);

    /// Create a texture, optionally with tightly packed initial texels.
    fn create_texture(
        &mut self,
        desc: &TextureDesc,
        data: Option<&[u8]>,
    ) -> Result<TextureId, DeviceError>;
    fn destroy_texture(&mut self, texture: TextureId);

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerId, DeviceError>;

    fn compile_shader(&mut self, desc: &ShaderDesc<'_>) -> Result<ShaderId, DeviceError>;
    fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<PipelineId, DeviceError>;
    fn destroy_pipeline(&mut self, pipeline: PipelineId);

    fn begin_pass(&mut self, desc: &PassDesc) -> Result<(), DeviceError>;
    fn set_pipeline(&mut self, pipeline: PipelineId);
    fn set_viewport(&mut self, rect: Rect);
    fn set_scissor(&mut self, rect: Rect);
    fn bind_constant_buffer(&mut self, slot: u32, slice: ConstantSlice);
    fn bind_texture(&mut self, slot: u32, texture: TextureId);
    fn bind_sampler(&mut self, slot: u32, sampler: SamplerId);
    fn set_vertex_buffer(&mut self, buffer: BufferId);
    fn set_index_buffer(&mut self, buffer: BufferId);
    fn draw(&mut self, vertex_count: u32) -> Result<(), DeviceError>;
    fn draw_indexed(&mut self, index_count: u32) -> Result<(), DeviceError>;
    fn end_pass(&mut self) -> Result<(), DeviceError>;

    /// Queue every recorded pass for execution.
    fn submit(&mut self) -> Result<(), DeviceError>;
    /// Show `texture` on the swapchain.
    fn present(&mut self, texture: TextureId) -> Result<(), DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_errors_require_recreation() {
        assert!(DeviceError::Lost.is_fatal());
        assert!(DeviceError::OutOfMemory("gbuffer_albedo".into()).is_fatal());
        assert!(
            !DeviceError::Compile {
                name: "gbuffer.wgsl".into(),
                log: "syntax".into()
            }
            .is_fatal()
        );
        assert!(!DeviceError::NoSwapchain.is_fatal());
    }

    #[test]
    fn texture_byte_len_uses_format() {
        let desc = TextureDesc::target("hdr", 4, 2, TextureFormat::Rgba16Float);
        assert_eq!(desc.byte_len(), 64);
    }
}
