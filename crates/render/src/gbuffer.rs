//! GBuffer: the fixed multiple-render-target set of the geometry pass.

use crate::device::{
    ColorAttachment, DepthAttachment, DeviceError, GraphicsDevice, LoadOp, PassDesc, TextureDesc,
    TextureFormat, TextureId,
};
use spartan_common::Color;

/// Create every target in `descs`, or none of them.
///
/// On failure the targets created so far are destroyed before the error is
/// returned.
pub(crate) fn create_targets<D: GraphicsDevice>(
    device: &mut D,
    descs: &[TextureDesc],
) -> Result<Vec<TextureId>, DeviceError> {
    let mut created = Vec::with_capacity(descs.len());
    for desc in descs {
        match device.create_texture(desc, None) {
            Ok(id) => created.push(id),
            Err(e) => {
                tracing::error!(
                    target = %desc.label,
                    error = %e,
                    "render target creation failed, rolling back"
                );
                for id in created {
                    device.destroy_texture(id);
                }
                return Err(e);
            }
        }
    }
    Ok(created)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GBufferTargets {
    /// RGB albedo.
    pub albedo: TextureId,
    /// World-space normal.
    pub normal: TextureId,
    /// Roughness, metallic, occlusion, emissive strength.
    pub material: TextureId,
    pub depth: TextureId,
}

/// Owns the GBuffer targets and keeps them sized to the viewport.
#[derive(Debug)]
pub struct GBuffer {
    targets: GBufferTargets,
    width: u32,
    height: u32,
}

impl GBuffer {
    pub const ALBEDO_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;
    pub const NORMAL_FORMAT: TextureFormat = TextureFormat::Rgba16Float;
    pub const MATERIAL_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;
    pub const DEPTH_FORMAT: TextureFormat = TextureFormat::Depth32Float;

    /// Color formats in attachment order.
    pub fn color_formats() -> [TextureFormat; 3] {
        [
            Self::ALBEDO_FORMAT,
            Self::NORMAL_FORMAT,
            Self::MATERIAL_FORMAT,
        ]
    }

    /// Create the targets. Zero dimensions are clamped to 1.
    pub fn new<D: GraphicsDevice>(
        device: &mut D,
        width: u32,
        height: u32,
    ) -> Result<Self, DeviceError> {
        let (width, height) = (width.max(1), height.max(1));
        let targets = Self::create_set(device, width, height)?;
        tracing::debug!(width, height, "gbuffer created");
        Ok(Self {
            targets,
            width,
            height,
        })
    }

    fn create_set<D: GraphicsDevice>(
        device: &mut D,
        width: u32,
        height: u32,
    ) -> Result<GBufferTargets, DeviceError> {
        let descs = [
            TextureDesc::target("gbuffer_albedo", width, height, Self::ALBEDO_FORMAT),
            TextureDesc::target("gbuffer_normal", width, height, Self::NORMAL_FORMAT),
            TextureDesc::target("gbuffer_material", width, height, Self::MATERIAL_FORMAT),
            TextureDesc::target("gbuffer_depth", width, height, Self::DEPTH_FORMAT),
        ];
        let ids = create_targets(device, &descs)?;
        Ok(GBufferTargets {
            albedo: ids[0],
            normal: ids[1],
            material: ids[2],
            depth: ids[3],
        })
    }

    /// Recreate all targets at the new size.
    ///
    /// Atomic: if any target fails, the previous set is kept and stays
    /// valid. Returns whether the size changed.
    pub fn resize<D: GraphicsDevice>(
        &mut self,
        device: &mut D,
        width: u32,
        height: u32,
    ) -> Result<bool, DeviceError> {
        let (width, height) = (width.max(1), height.max(1));
        if (width, height) == (self.width, self.height) {
            return Ok(false);
        }
        let targets = Self::create_set(device, width, height)?;
        let old = std::mem::replace(&mut self.targets, targets);
        Self::destroy_set(device, old);
        tracing::debug!(
            from = ?(self.width, self.height),
            to = ?(width, height),
            "gbuffer resized"
        );
        self.width = width;
        self.height = height;
        Ok(true)
    }

    /// Record the clear pass. When a depth pre-pass already produced depth
    /// for this frame, only the color targets are cleared.
    pub fn clear<D: GraphicsDevice>(
        &self,
        device: &mut D,
        clear_depth: bool,
    ) -> Result<(), DeviceError> {
        let color = [self.targets.albedo, self.targets.normal, self.targets.material]
            .into_iter()
            .map(|texture| ColorAttachment {
                texture,
                load: LoadOp::Clear(Color::rgba(0.0, 0.0, 0.0, 0.0)),
            })
            .collect();
        device.begin_pass(&PassDesc {
            label: "gbuffer_clear".into(),
            color,
            depth: clear_depth.then_some(DepthAttachment {
                texture: self.targets.depth,
                load: LoadOp::Clear(1.0),
                read_only: false,
            }),
        })?;
        device.end_pass()
    }

    pub fn targets(&self) -> &GBufferTargets {
        &self.targets
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Color attachments for the geometry pass, loading the cleared contents.
    pub fn color_attachments(&self) -> Vec<ColorAttachment> {
        [self.targets.albedo, self.targets.normal, self.targets.material]
            .into_iter()
            .map(|texture| ColorAttachment {
                texture,
                load: LoadOp::Load,
            })
            .collect()
    }

    pub fn release<D: GraphicsDevice>(self, device: &mut D) {
        Self::destroy_set(device, self.targets);
    }

    fn destroy_set<D: GraphicsDevice>(device: &mut D, targets: GBufferTargets) {
        for id in [targets.albedo, targets.normal, targets.material, targets.depth] {
            device.destroy_texture(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RecordingDevice;

    #[test]
    fn zero_size_is_clamped() {
        let mut device = RecordingDevice::new();
        let gbuffer = GBuffer::new(&mut device, 0, 0).unwrap();
        assert_eq!(gbuffer.size(), (1, 1));
        let desc = device.texture_desc(gbuffer.targets().depth).unwrap();
        assert_eq!(desc.format, TextureFormat::Depth32Float);
    }

    #[test]
    fn resize_replaces_every_target() {
        let mut device = RecordingDevice::new();
        let mut gbuffer = GBuffer::new(&mut device, 64, 64).unwrap();
        let before = *gbuffer.targets();
        assert!(gbuffer.resize(&mut device, 128, 32).unwrap());
        assert_ne!(gbuffer.targets().albedo, before.albedo);
        assert_eq!(device.live_textures(), 4);
        assert!(device.texture_desc(before.albedo).is_none());
        assert_eq!(device.texture_desc(gbuffer.targets().normal).unwrap().width, 128);
    }

    #[test]
    fn same_size_resize_is_a_noop() {
        let mut device = RecordingDevice::new();
        let mut gbuffer = GBuffer::new(&mut device, 64, 64).unwrap();
        let before = *gbuffer.targets();
        assert!(!gbuffer.resize(&mut device, 64, 64).unwrap());
        assert_eq!(*gbuffer.targets(), before);
    }

    #[test]
    fn failed_resize_keeps_previous_set() {
        let mut device = RecordingDevice::new();
        let mut gbuffer = GBuffer::new(&mut device, 64, 64).unwrap();
        let before = *gbuffer.targets();

        // Third target of the new set fails.
        device.set_texture_budget(Some(2));
        assert!(gbuffer.resize(&mut device, 256, 256).is_err());

        assert_eq!(*gbuffer.targets(), before);
        assert_eq!(gbuffer.size(), (64, 64));
        assert_eq!(device.live_textures(), 4);
        for id in [before.albedo, before.normal, before.material, before.depth] {
            assert_eq!(device.texture_desc(id).unwrap().width, 64);
        }

        device.set_texture_budget(None);
        assert!(gbuffer.resize(&mut device, 256, 256).unwrap());
        assert_eq!(gbuffer.size(), (256, 256));
    }

    #[test]
    fn clear_is_its_own_pass() {
        let mut device = RecordingDevice::new();
        let gbuffer = GBuffer::new(&mut device, 8, 8).unwrap();
        gbuffer.clear(&mut device, true).unwrap();
        assert_eq!(device.pass_labels(), vec!["gbuffer_clear"]);
        assert_eq!(device.draws_in_pass("gbuffer_clear"), 0);
    }
}
