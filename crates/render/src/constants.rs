//! Constant blocks and the per-frame constant arena.
//!
//! Blocks mirror the uniform structs declared in the WGSL sources, field
//! for field; every member is 16-byte aligned so the layout is identical on
//! both sides.

use crate::device::{BufferDesc, BufferId, BufferUsage, ConstantSlice, DeviceError, GraphicsDevice};
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

/// Lights the transparency pass shades per draw.
pub const MAX_FORWARD_LIGHTS: usize = 8;

const CHUNK_SIZE: u64 = 64 * 1024;

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct FrameConstants {
    pub view: [[f32; 4]; 4],
    pub projection: [[f32; 4]; 4],
    pub view_projection: [[f32; 4]; 4],
    pub inverse_view_projection: [[f32; 4]; 4],
    pub camera_position: [f32; 4],
    /// width, height, 1/width, 1/height
    pub viewport: [f32; 4],
    pub clear_color: [f32; 4],
    /// Ambient color premultiplied by intensity.
    pub ambient: [f32; 4],
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct ObjectConstants {
    pub world: [[f32; 4]; 4],
    pub normal_matrix: [[f32; 4]; 4],
}

impl ObjectConstants {
    pub fn new(world: Mat4) -> Self {
        Self {
            world: world.to_cols_array_2d(),
            normal_matrix: world.inverse().transpose().to_cols_array_2d(),
        }
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct MaterialConstants {
    pub albedo: [f32; 4],
    pub emissive: [f32; 4],
    /// roughness, metallic, normal strength, unused
    pub params: [f32; 4],
    /// tiling.xy, offset.xy
    pub uv: [f32; 4],
}

impl MaterialConstants {
    pub fn new(material: &spartan_resources::Material) -> Self {
        Self {
            albedo: material.albedo.to_array(),
            emissive: material.emissive.to_array(),
            params: [
                material.roughness,
                material.metallic,
                material.normal_strength,
                0.0,
            ],
            uv: [
                material.uv_tiling[0],
                material.uv_tiling[1],
                material.uv_offset[0],
                material.uv_offset[1],
            ],
        }
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Pod, Zeroable)]
pub struct LightData {
    pub position_range: [f32; 4],
    /// xyz direction, w kind (0 directional, 1 point, 2 spot)
    pub direction_kind: [f32; 4],
    pub color_intensity: [f32; 4],
    /// cos(inner), cos(outer)
    pub cone: [f32; 4],
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct LightConstants {
    pub count: [u32; 4],
    pub lights: [LightData; MAX_FORWARD_LIGHTS],
}

impl LightConstants {
    /// Up to `MAX_FORWARD_LIGHTS` lights; the rest are dropped.
    pub fn new(lights: impl IntoIterator<Item = LightData>) -> Self {
        let mut block = Self::zeroed();
        let mut count = 0;
        for (slot, light) in block.lights.iter_mut().zip(lights) {
            *slot = light;
            count += 1;
        }
        block.count[0] = count;
        block
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct PostConstants {
    /// 1/width, 1/height, width, height
    pub texel: [f32; 4],
    /// exposure, gamma, sharpen strength, unused
    pub params: [f32; 4],
}

pub(crate) fn vec4(v: Vec3, w: f32) -> [f32; 4] {
    Vec4::from((v, w)).to_array()
}

/// Linear allocator for per-draw constant blocks.
///
/// Blocks are written once and never overwritten within a frame, so a
/// backend that defers uploads until submission still sees the values each
/// draw was recorded with. `reset` at the start of each frame rewinds it.
#[derive(Debug)]
pub struct ConstantArena {
    chunks: Vec<BufferId>,
    current: usize,
    cursor: u64,
    alignment: u64,
    bytes_used: u64,
}

impl ConstantArena {
    pub fn new(alignment: u32) -> Self {
        Self {
            chunks: Vec::new(),
            current: 0,
            cursor: 0,
            alignment: u64::from(alignment.max(1)),
            bytes_used: 0,
        }
    }

    /// Rewind to the first chunk. Existing chunks are reused.
    pub fn reset(&mut self) {
        self.current = 0;
        self.cursor = 0;
        self.bytes_used = 0;
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn bytes_used(&self) -> u64 {
        self.bytes_used
    }

    /// Write `value` and return where it lives.
    pub fn push<D: GraphicsDevice, T: Pod>(
        &mut self,
        device: &mut D,
        value: &T,
    ) -> Result<ConstantSlice, DeviceError> {
        let bytes = bytemuck::bytes_of(value);
        let size = bytes.len() as u64;
        debug_assert!(size <= CHUNK_SIZE);

        let mut offset = self.cursor.next_multiple_of(self.alignment);
        if self.chunks.is_empty() || offset + size > CHUNK_SIZE {
            if !self.chunks.is_empty() {
                self.current += 1;
            }
            if self.current == self.chunks.len() {
                let buffer = device.create_buffer(
                    &BufferDesc {
                        label: format!("constant_arena_{}", self.chunks.len()),
                        size: CHUNK_SIZE,
                        usage: BufferUsage::CONSTANT | BufferUsage::COPY_DST,
                    },
                    None,
                )?;
                tracing::debug!(chunk = self.chunks.len(), "constant arena grew");
                self.chunks.push(buffer);
            }
            offset = 0;
        }

        let buffer = self.chunks[self.current];
        device.write_buffer(buffer, offset, bytes)?;
        self.cursor = offset + size;
        self.bytes_used += size;
        Ok(ConstantSlice {
            buffer,
            offset,
            size,
        })
    }

    /// Destroy every chunk.
    pub fn release<D: GraphicsDevice>(&mut self, device: &mut D) {
        for buffer in self.chunks.drain(..) {
            device.destroy_buffer(buffer);
        }
        self.reset();
    }

    /// Drop chunk ids without destroying them, after the device was recreated.
    pub fn forget(&mut self) {
        self.chunks.clear();
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RecordingDevice;

    #[test]
    fn block_sizes_match_shader_layout() {
        assert_eq!(std::mem::size_of::<FrameConstants>(), 320);
        assert_eq!(std::mem::size_of::<ObjectConstants>(), 128);
        assert_eq!(std::mem::size_of::<MaterialConstants>(), 64);
        assert_eq!(std::mem::size_of::<LightConstants>(), 16 + 64 * MAX_FORWARD_LIGHTS);
        assert_eq!(std::mem::size_of::<PostConstants>(), 32);
    }

    #[test]
    fn offsets_are_aligned() {
        let mut device = RecordingDevice::new();
        let mut arena = ConstantArena::new(256);
        let a = arena.push(&mut device, &PostConstants::zeroed()).unwrap();
        let b = arena.push(&mut device, &FrameConstants::zeroed()).unwrap();
        let c = arena.push(&mut device, &PostConstants::zeroed()).unwrap();
        assert_eq!((a.offset, b.offset, c.offset), (0, 256, 768));
        assert_eq!(b.size, 320);
        assert_eq!(a.buffer, c.buffer);
    }

    #[test]
    fn grows_by_chunks_and_reuses_them_after_reset() {
        let mut device = RecordingDevice::new();
        let mut arena = ConstantArena::new(256);
        let per_chunk = (CHUNK_SIZE / 256) as usize;
        let mut last = None;
        for _ in 0..per_chunk + 1 {
            last = Some(arena.push(&mut device, &PostConstants::zeroed()).unwrap());
        }
        assert_eq!(arena.chunk_count(), 2);
        assert_eq!(last.unwrap().offset, 0);

        arena.reset();
        for _ in 0..per_chunk + 1 {
            arena.push(&mut device, &PostConstants::zeroed()).unwrap();
        }
        assert_eq!(arena.chunk_count(), 2);
        assert_eq!(device.live_buffers(), 2);

        arena.release(&mut device);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn light_block_truncates() {
        let lights = std::iter::repeat_n(LightData::default(), MAX_FORWARD_LIGHTS + 3);
        let block = LightConstants::new(lights);
        assert_eq!(block.count[0] as usize, MAX_FORWARD_LIGHTS);
    }
}
