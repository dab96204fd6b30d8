//! The fixed bind group layout every pipeline is built against.
//!
//! Group 0 holds the constant slots as uniform buffers with dynamic offsets.
//! Group 1 holds the color textures, the depth texture and both samplers
//! (bindings 7 and 8). Slots a pass leaves unbound are filled with dummies so
//! one layout serves every shader.

use crate::device::Objects;
use spartan_render::device::{
    BufferId, CONSTANT_SLOTS, COLOR_TEXTURE_SLOTS, ConstantSlice, DEPTH_TEXTURE_SLOT, DeviceError,
    SAMPLER_SLOTS, SamplerId, TEXTURE_SLOTS, TextureId,
};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::num::NonZeroU64;

const DUMMY_UNIFORM_SIZE: u64 = 256;

pub(crate) struct Layouts {
    pub constants: wgpu::BindGroupLayout,
    pub resources: wgpu::BindGroupLayout,
    pub pipeline: wgpu::PipelineLayout,
}

impl Layouts {
    pub fn new(device: &wgpu::Device) -> Self {
        let visibility = wgpu::ShaderStages::VERTEX_FRAGMENT;
        let constant_entries: Vec<_> = (0..CONSTANT_SLOTS)
            .map(|binding| wgpu::BindGroupLayoutEntry {
                binding,
                visibility,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();

        let mut resource_entries: Vec<_> = (0..COLOR_TEXTURE_SLOTS)
            .map(|binding| wgpu::BindGroupLayoutEntry {
                binding,
                visibility,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            })
            .collect();
        resource_entries.push(wgpu::BindGroupLayoutEntry {
            binding: DEPTH_TEXTURE_SLOT,
            visibility,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Depth,
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        });
        resource_entries.extend((0..SAMPLER_SLOTS).map(|slot| wgpu::BindGroupLayoutEntry {
            binding: TEXTURE_SLOTS + slot,
            visibility,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        }));

        let constants = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("constants_layout"),
            entries: &constant_entries,
        });
        let resources = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("resources_layout"),
            entries: &resource_entries,
        });
        let pipeline = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("pipeline_layout"),
            bind_group_layouts: &[&constants, &resources],
            push_constant_ranges: &[],
        });
        Self {
            constants,
            resources,
            pipeline,
        }
    }
}

/// Stand-ins for unbound slots.
pub(crate) struct Dummies {
    uniform: wgpu::Buffer,
    color: wgpu::TextureView,
    depth: wgpu::TextureView,
    sampler: wgpu::Sampler,
}

impl Dummies {
    pub fn new(device: &wgpu::Device) -> Self {
        let uniform = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("dummy_uniform"),
            size: DUMMY_UNIFORM_SIZE,
            usage: wgpu::BufferUsages::UNIFORM,
            mapped_at_creation: false,
        });
        let texture = |label, format, usage| {
            device
                .create_texture(&wgpu::TextureDescriptor {
                    label: Some(label),
                    size: wgpu::Extent3d {
                        width: 1,
                        height: 1,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format,
                    usage,
                    view_formats: &[],
                })
                .create_view(&wgpu::TextureViewDescriptor::default())
        };
        let color = texture(
            "dummy_color",
            wgpu::TextureFormat::Rgba8Unorm,
            wgpu::TextureUsages::TEXTURE_BINDING,
        );
        let depth = texture(
            "dummy_depth",
            wgpu::TextureFormat::Depth32Float,
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::RENDER_ATTACHMENT,
        );
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("dummy_sampler"),
            ..Default::default()
        });
        Self {
            uniform,
            color,
            depth,
            sampler,
        }
    }
}

/// Bindings accumulated inside a pass, consumed at each draw.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct BindState {
    pub constants: [Option<ConstantSlice>; CONSTANT_SLOTS as usize],
    pub textures: [Option<TextureId>; TEXTURE_SLOTS as usize],
    pub samplers: [Option<SamplerId>; SAMPLER_SLOTS as usize],
}

/// Buffer and bound size per constant slot; offsets are dynamic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConstantKey([Option<(BufferId, u64)>; CONSTANT_SLOTS as usize]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ResourceKey {
    textures: [Option<TextureId>; TEXTURE_SLOTS as usize],
    samplers: [Option<SamplerId>; SAMPLER_SLOTS as usize],
}

impl BindState {
    pub fn constant_key(&self) -> (ConstantKey, [u32; CONSTANT_SLOTS as usize]) {
        let mut offsets = [0u32; CONSTANT_SLOTS as usize];
        let mut key = [None; CONSTANT_SLOTS as usize];
        for (i, slice) in self.constants.iter().enumerate() {
            if let Some(slice) = slice {
                key[i] = Some((slice.buffer, slice.size));
                offsets[i] = slice.offset as u32;
            }
        }
        (ConstantKey(key), offsets)
    }

    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey {
            textures: self.textures,
            samplers: self.samplers,
        }
    }
}

/// Bind groups built so far, reused across draws and frames. Cleared when
/// any referenced object is destroyed.
#[derive(Default)]
pub(crate) struct BindGroupCache {
    constants: HashMap<ConstantKey, wgpu::BindGroup>,
    resources: HashMap<ResourceKey, wgpu::BindGroup>,
}

impl BindGroupCache {
    pub fn clear(&mut self) {
        self.constants.clear();
        self.resources.clear();
    }

    pub fn len(&self) -> usize {
        self.constants.len() + self.resources.len()
    }

    pub fn constants(
        &mut self,
        device: &wgpu::Device,
        layouts: &Layouts,
        dummies: &Dummies,
        objects: &Objects,
        key: ConstantKey,
    ) -> Result<&wgpu::BindGroup, DeviceError> {
        match self.constants.entry(key) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(v) => {
                let mut entries = Vec::with_capacity(key.0.len());
                for (binding, slot) in key.0.iter().enumerate() {
                    let (buffer, size) = match slot {
                        Some((id, size)) => (&objects.buffer(*id)?.buffer, *size),
                        None => (&dummies.uniform, DUMMY_UNIFORM_SIZE),
                    };
                    entries.push(wgpu::BindGroupEntry {
                        binding: binding as u32,
                        resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                            buffer,
                            offset: 0,
                            size: NonZeroU64::new(size),
                        }),
                    });
                }
                let group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("constants"),
                    layout: &layouts.constants,
                    entries: &entries,
                });
                Ok(v.insert(group))
            }
        }
    }

    pub fn resources(
        &mut self,
        device: &wgpu::Device,
        layouts: &Layouts,
        dummies: &Dummies,
        objects: &Objects,
        key: ResourceKey,
    ) -> Result<&wgpu::BindGroup, DeviceError> {
        match self.resources.entry(key) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(v) => {
                let mut entries = Vec::with_capacity(key.textures.len() + key.samplers.len());
                for (slot, texture) in key.textures.iter().enumerate() {
                    let view = match texture {
                        Some(id) => &objects.texture(*id)?.view,
                        None if slot as u32 == DEPTH_TEXTURE_SLOT => &dummies.depth,
                        None => &dummies.color,
                    };
                    entries.push(wgpu::BindGroupEntry {
                        binding: slot as u32,
                        resource: wgpu::BindingResource::TextureView(view),
                    });
                }
                for (slot, sampler) in key.samplers.iter().enumerate() {
                    let sampler = match sampler {
                        Some(id) => objects.sampler(*id)?,
                        None => &dummies.sampler,
                    };
                    entries.push(wgpu::BindGroupEntry {
                        binding: TEXTURE_SLOTS + slot as u32,
                        resource: wgpu::BindingResource::Sampler(sampler),
                    });
                }
                let group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("resources"),
                    layout: &layouts.resources,
                    entries: &entries,
                });
                Ok(v.insert(group))
            }
        }
    }
}
