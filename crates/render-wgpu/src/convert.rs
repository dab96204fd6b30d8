//! Mapping between the device-neutral descriptors and wgpu types.

use spartan_render::device::{
    AddressMode, BackendKind, BlendMode, BufferUsage, CompareOp, CullMode, DeviceError,
    FilterMode, TextureFormat, TextureUsage,
};

pub(crate) fn texture_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
        TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
    }
}

pub(crate) fn texture_usage(usage: TextureUsage) -> wgpu::TextureUsages {
    // Every texture can be read back for screenshots.
    let mut out = wgpu::TextureUsages::COPY_SRC;
    if usage.contains(TextureUsage::SAMPLED) {
        out |= wgpu::TextureUsages::TEXTURE_BINDING;
    }
    if usage.contains(TextureUsage::RENDER_TARGET) {
        out |= wgpu::TextureUsages::RENDER_ATTACHMENT;
    }
    if usage.contains(TextureUsage::COPY_DST) {
        out |= wgpu::TextureUsages::COPY_DST;
    }
    out
}

pub(crate) fn buffer_usage(usage: BufferUsage) -> wgpu::BufferUsages {
    let mut out = wgpu::BufferUsages::COPY_DST;
    if usage.contains(BufferUsage::VERTEX) {
        out |= wgpu::BufferUsages::VERTEX;
    }
    if usage.contains(BufferUsage::INDEX) {
        out |= wgpu::BufferUsages::INDEX;
    }
    if usage.contains(BufferUsage::CONSTANT) {
        out |= wgpu::BufferUsages::UNIFORM;
    }
    out
}

pub(crate) fn blend_state(blend: BlendMode) -> wgpu::BlendState {
    match blend {
        BlendMode::Replace => wgpu::BlendState::REPLACE,
        BlendMode::Alpha => wgpu::BlendState::ALPHA_BLENDING,
        BlendMode::Additive => {
            let add = wgpu::BlendComponent {
                src_factor: wgpu::BlendFactor::One,
                dst_factor: wgpu::BlendFactor::One,
                operation: wgpu::BlendOperation::Add,
            };
            wgpu::BlendState {
                color: add,
                alpha: add,
            }
        }
    }
}

pub(crate) fn compare(op: CompareOp) -> wgpu::CompareFunction {
    match op {
        CompareOp::Less => wgpu::CompareFunction::Less,
        CompareOp::LessEqual => wgpu::CompareFunction::LessEqual,
        CompareOp::Always => wgpu::CompareFunction::Always,
    }
}

pub(crate) fn cull_mode(cull: CullMode) -> Option<wgpu::Face> {
    match cull {
        CullMode::None => None,
        CullMode::Back => Some(wgpu::Face::Back),
    }
}

pub(crate) fn filter(mode: FilterMode) -> wgpu::FilterMode {
    match mode {
        FilterMode::Linear => wgpu::FilterMode::Linear,
        FilterMode::Nearest => wgpu::FilterMode::Nearest,
    }
}

pub(crate) fn address(mode: AddressMode) -> wgpu::AddressMode {
    match mode {
        AddressMode::Repeat => wgpu::AddressMode::Repeat,
        AddressMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
    }
}

pub(crate) fn backend(backend: wgpu::Backend) -> BackendKind {
    match backend {
        wgpu::Backend::Vulkan => BackendKind::Vulkan,
        wgpu::Backend::Dx12 => BackendKind::Dx12,
        wgpu::Backend::Metal => BackendKind::Metal,
        wgpu::Backend::Gl => BackendKind::Gl,
        _ => BackendKind::Other,
    }
}

pub(crate) fn device_error(error: wgpu::Error) -> DeviceError {
    match error {
        wgpu::Error::OutOfMemory { .. } => DeviceError::OutOfMemory(error.to_string()),
        wgpu::Error::Validation { description, .. } => DeviceError::Validation(description),
        other => DeviceError::Backend(other.to_string()),
    }
}

/// Row pitch for texture-to-buffer copies, padded to wgpu's alignment.
pub(crate) fn padded_bytes_per_row(width: u32, bytes_per_pixel: u32) -> u32 {
    let unpadded = width * bytes_per_pixel;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    unpadded.div_ceil(align) * align
}

/// Round `len` up to the buffer copy alignment.
pub(crate) fn copy_aligned(len: u64) -> u64 {
    let align = wgpu::COPY_BUFFER_ALIGNMENT;
    len.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_pitch_is_aligned() {
        assert_eq!(padded_bytes_per_row(64, 4), 256);
        assert_eq!(padded_bytes_per_row(65, 4), 512);
        assert_eq!(padded_bytes_per_row(1, 4), 256);
    }

    #[test]
    fn copy_alignment_rounds_up() {
        assert_eq!(copy_aligned(0), 0);
        assert_eq!(copy_aligned(5), 8);
        assert_eq!(copy_aligned(16), 16);
    }

    #[test]
    fn render_targets_are_attachments() {
        let usage = texture_usage(TextureUsage::RENDER_TARGET | TextureUsage::SAMPLED);
        assert!(usage.contains(wgpu::TextureUsages::RENDER_ATTACHMENT));
        assert!(usage.contains(wgpu::TextureUsages::TEXTURE_BINDING));
        assert!(!usage.contains(wgpu::TextureUsages::COPY_DST));
    }

    #[test]
    fn constant_buffers_are_uniforms() {
        let usage = buffer_usage(BufferUsage::CONSTANT);
        assert!(usage.contains(wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST));
        assert!(!usage.contains(wgpu::BufferUsages::VERTEX));
    }

    #[test]
    fn additive_blend_adds() {
        let state = blend_state(BlendMode::Additive);
        assert_eq!(state.color.dst_factor, wgpu::BlendFactor::One);
        assert_eq!(state.color.operation, wgpu::BlendOperation::Add);
    }
}
