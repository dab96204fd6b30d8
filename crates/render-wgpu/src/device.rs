//! `GraphicsDevice` over wgpu.
//!
//! Commands are recorded into passes and replayed into one command encoder
//! on `submit`. Bindings are resolved into bind groups at each draw against
//! the fixed layout in `bindings`. Creation and submission run inside error
//! scopes so validation failures come back as `DeviceError`s instead of
//! panicking in the uncaptured-error handler.

use crate::bindings::{BindGroupCache, BindState, Dummies, Layouts};
use crate::convert;
use crate::shaders::PRESENT_SHADER;
use spartan_common::Rect;
use spartan_render::device::{
    BackendKind, BufferDesc, BufferId, CONSTANT_SLOTS, Capabilities, ConstantSlice, DeviceError,
    DeviceStatus, GraphicsDevice, LoadOp, PassDesc, PipelineDesc, PipelineId, SAMPLER_SLOTS,
    SamplerDesc, SamplerId, ShaderDesc, ShaderId, TEXTURE_SLOTS, TextureDesc, TextureFormat,
    TextureId, TextureUsage, VertexLayout,
};
use spartan_resources::Vertex;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const MESH_ATTRIBUTES: [wgpu::VertexAttribute; 4] = wgpu::vertex_attr_array![
    0 => Float32x3,
    1 => Float32x3,
    2 => Float32x2,
    3 => Float32x4,
];

pub(crate) struct GpuBuffer {
    pub buffer: wgpu::Buffer,
    size: u64,
}

pub(crate) struct GpuTexture {
    texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    desc: TextureDesc,
}

struct GpuPipeline {
    pipeline: wgpu::RenderPipeline,
    vertex_layout: VertexLayout,
}

/// Every object created on the current wgpu device, by id.
#[derive(Default)]
pub(crate) struct Objects {
    buffers: HashMap<u64, GpuBuffer>,
    textures: HashMap<u64, GpuTexture>,
    samplers: HashMap<u64, wgpu::Sampler>,
    shaders: HashMap<u64, wgpu::ShaderModule>,
    pipelines: HashMap<u64, GpuPipeline>,
}

impl Objects {
    pub fn buffer(&self, id: BufferId) -> Result<&GpuBuffer, DeviceError> {
        self.buffers.get(&id.0).ok_or(DeviceError::InvalidHandle {
            kind: "buffer",
            id: id.0,
        })
    }

    pub fn texture(&self, id: TextureId) -> Result<&GpuTexture, DeviceError> {
        self.textures.get(&id.0).ok_or(DeviceError::InvalidHandle {
            kind: "texture",
            id: id.0,
        })
    }

    pub fn sampler(&self, id: SamplerId) -> Result<&wgpu::Sampler, DeviceError> {
        self.samplers.get(&id.0).ok_or(DeviceError::InvalidHandle {
            kind: "sampler",
            id: id.0,
        })
    }

    fn pipeline(&self, id: PipelineId) -> Result<&GpuPipeline, DeviceError> {
        self.pipelines.get(&id.0).ok_or(DeviceError::InvalidHandle {
            kind: "pipeline",
            id: id.0,
        })
    }

    fn clear(&mut self) {
        self.buffers.clear();
        self.textures.clear();
        self.samplers.clear();
        self.shaders.clear();
        self.pipelines.clear();
    }
}

/// Adapter, device and everything derived from them. Replaced wholesale on
/// `recreate`.
struct Context {
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    layouts: Layouts,
    dummies: Dummies,
    lost: Arc<AtomicBool>,
}

impl Context {
    fn new(
        instance: &wgpu::Instance,
        surface: Option<&wgpu::Surface<'static>>,
    ) -> Result<Self, DeviceError> {
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: surface,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| DeviceError::Unsupported("no compatible GPU adapter".into()))?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("spartan_device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default().using_resolution(adapter.limits()),
                memory_hints: Default::default(),
            },
            None,
        ))
        .map_err(|e| DeviceError::Backend(e.to_string()))?;

        let lost = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&lost);
        device.set_device_lost_callback(move |reason, message| {
            tracing::error!(?reason, %message, "wgpu device lost");
            flag.store(true, Ordering::SeqCst);
        });
        device.on_uncaptured_error(Box::new(|error: wgpu::Error| {
            tracing::error!(%error, "uncaptured wgpu error");
        }));

        let info = adapter.get_info();
        tracing::info!(
            adapter = %info.name,
            backend = info.backend.to_str(),
            "wgpu device created"
        );
        let layouts = Layouts::new(&device);
        let dummies = Dummies::new(&device);
        Ok(Self {
            adapter,
            device,
            queue,
            layouts,
            dummies,
            lost,
        })
    }

    /// Run `f` inside validation and out-of-memory error scopes.
    fn scoped<T>(&self, f: impl FnOnce(&wgpu::Device) -> T) -> (T, Option<wgpu::Error>) {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device);
        let validation = pollster::block_on(self.device.pop_error_scope());
        let oom = pollster::block_on(self.device.pop_error_scope());
        (value, validation.or(oom))
    }
}

/// Built lazily per surface format.
struct PresentBlit {
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::RenderPipeline,
    sampler: wgpu::Sampler,
}

impl PresentBlit {
    fn new(device: &wgpu::Device, format: wgpu::TextureFormat) -> Self {
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("present_layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("present_pipeline_layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("present_shader"),
            source: wgpu::ShaderSource::Wgsl(PRESENT_SHADER.into()),
        });
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("present_pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &module,
                entry_point: Some("vs_main"),
                compilation_options: Default::default(),
                buffers: &[],
            },
            fragment: Some(wgpu::FragmentState {
                module: &module,
                entry_point: Some("fs_main"),
                compilation_options: Default::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: Default::default(),
            depth_stencil: None,
            multisample: Default::default(),
            multiview: None,
            cache: None,
        });
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("present_sampler"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        Self {
            layout,
            pipeline,
            sampler,
        }
    }
}

struct SurfaceState {
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
    blit: Option<PresentBlit>,
}

impl SurfaceState {
    /// Next swapchain image. `None` when the surface had to be reconfigured
    /// and the frame should be dropped.
    fn acquire(
        &mut self,
        device: &wgpu::Device,
    ) -> Result<Option<wgpu::SurfaceTexture>, DeviceError> {
        match self.surface.get_current_texture() {
            Ok(frame) => Ok(Some(frame)),
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                tracing::debug!("surface outdated, reconfiguring");
                self.surface.configure(device, &self.config);
                Ok(None)
            }
            Err(wgpu::SurfaceError::Timeout) => {
                tracing::warn!("timed out acquiring swapchain image");
                Ok(None)
            }
            Err(wgpu::SurfaceError::OutOfMemory) => {
                Err(DeviceError::OutOfMemory("swapchain".into()))
            }
            Err(other) => Err(DeviceError::Backend(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum PassCommand {
    SetPipeline(PipelineId),
    Viewport(Rect),
    Scissor(Rect),
    Constant(u32, ConstantSlice),
    Texture(u32, TextureId),
    Sampler(u32, SamplerId),
    VertexBuffer(BufferId),
    IndexBuffer(BufferId),
    Draw { count: u32, indexed: bool },
}

struct RecordedPass {
    desc: PassDesc,
    commands: Vec<PassCommand>,
}

/// A pass being recorded, with the state needed to validate draws.
struct OpenPass {
    pass: RecordedPass,
    pipeline: Option<VertexLayout>,
    vertex_buffer: bool,
    index_buffer: bool,
    error: Option<DeviceError>,
}

impl OpenPass {
    fn note(&mut self, error: DeviceError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }
}

/// A texture read back to the CPU as tightly packed RGBA8 rows.
#[derive(Debug, Clone)]
pub struct Readback {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

/// wgpu-backed device. wgpu picks Vulkan, D3D12 or Metal at run time.
pub struct WgpuDevice {
    instance: wgpu::Instance,
    ctx: Context,
    surface: Option<SurfaceState>,
    objects: Objects,
    bind_groups: BindGroupCache,
    passes: Vec<RecordedPass>,
    open: Option<OpenPass>,
    next_id: u64,
    generation: u64,
}

impl WgpuDevice {
    /// A device without a surface; `present` fails with `NoSwapchain`.
    pub fn headless() -> Result<Self, DeviceError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });
        let ctx = Context::new(&instance, None)?;
        Ok(Self::from_parts(instance, ctx, None))
    }

    /// A device presenting to `target`, e.g. an `Arc<winit::window::Window>`.
    pub fn with_surface(
        target: impl Into<wgpu::SurfaceTarget<'static>>,
        width: u32,
        height: u32,
        vsync: bool,
    ) -> Result<Self, DeviceError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let surface = instance
            .create_surface(target)
            .map_err(|e| DeviceError::Unsupported(e.to_string()))?;
        let ctx = Context::new(&instance, Some(&surface))?;

        let caps = surface.get_capabilities(&ctx.adapter);
        let format = caps
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .or_else(|| caps.formats.first())
            .copied()
            .ok_or_else(|| DeviceError::Unsupported("surface reports no formats".into()))?;
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: width.max(1),
            height: height.max(1),
            present_mode: if vsync {
                wgpu::PresentMode::AutoVsync
            } else {
                wgpu::PresentMode::AutoNoVsync
            },
            alpha_mode: caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&ctx.device, &config);
        let state = SurfaceState {
            surface,
            config,
            blit: None,
        };
        Ok(Self::from_parts(instance, ctx, Some(state)))
    }

    fn from_parts(instance: wgpu::Instance, ctx: Context, surface: Option<SurfaceState>) -> Self {
        Self {
            instance,
            ctx,
            surface,
            objects: Objects::default(),
            bind_groups: BindGroupCache::default(),
            passes: Vec::new(),
            open: None,
            next_id: 1,
            generation: 0,
        }
    }

    pub fn raw_device(&self) -> &wgpu::Device {
        &self.ctx.device
    }

    pub fn raw_queue(&self) -> &wgpu::Queue {
        &self.ctx.queue
    }

    pub fn adapter_info(&self) -> wgpu::AdapterInfo {
        self.ctx.adapter.get_info()
    }

    /// Bumped on every `recreate`; anything built from `raw_device` must be
    /// rebuilt when it changes.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn texture_view(&self, texture: TextureId) -> Option<&wgpu::TextureView> {
        self.objects.textures.get(&texture.0).map(|t| &t.view)
    }

    pub fn bind_group_count(&self) -> usize {
        self.bind_groups.len()
    }

    pub fn surface_format(&self) -> Option<wgpu::TextureFormat> {
        self.surface.as_ref().map(|s| s.config.format)
    }

    pub fn surface_size(&self) -> Option<(u32, u32)> {
        self.surface.as_ref().map(|s| (s.config.width, s.config.height))
    }

    pub fn resize_surface(&mut self, width: u32, height: u32) {
        if let Some(state) = self.surface.as_mut() {
            state.config.width = width.max(1);
            state.config.height = height.max(1);
            state.surface.configure(&self.ctx.device, &state.config);
        }
    }

    /// Acquire the next swapchain image for drawing outside the renderer,
    /// e.g. UI overlays. `Ok(None)` means skip this frame.
    pub fn acquire_surface_texture(&mut self) -> Result<Option<wgpu::SurfaceTexture>, DeviceError> {
        self.check_alive()?;
        let state = self.surface.as_mut().ok_or(DeviceError::NoSwapchain)?;
        state.acquire(&self.ctx.device)
    }

    /// Copy an RGBA8 texture back to the CPU. Blocks until the GPU is done.
    pub fn read_texture(&mut self, texture: TextureId) -> Result<Readback, DeviceError> {
        self.check_alive()?;
        let source = self.objects.texture(texture)?;
        let desc = &source.desc;
        if !matches!(desc.format, TextureFormat::Rgba8Unorm | TextureFormat::Rgba8UnormSrgb) {
            return Err(DeviceError::Unsupported(format!(
                "readback of {:?} texture {}",
                desc.format, desc.label
            )));
        }
        let (width, height) = (desc.width, desc.height);
        let padded = convert::padded_bytes_per_row(width, 4);
        let staging = self.ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: padded as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &source.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.ctx.queue.submit(std::iter::once(encoder.finish()));

        let (tx, rx) = crossbeam_channel::bounded(1);
        let slice = staging.slice(..);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.ctx.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| DeviceError::Backend("readback callback dropped".into()))?
            .map_err(|e| DeviceError::Backend(e.to_string()))?;

        let mapped = slice.get_mapped_range();
        let row = (width * 4) as usize;
        let mut rgba = Vec::with_capacity(row * height as usize);
        for chunk in mapped.chunks(padded as usize) {
            rgba.extend_from_slice(&chunk[..row]);
        }
        drop(mapped);
        staging.unmap();
        self.check_alive()?;
        Ok(Readback {
            width,
            height,
            rgba,
        })
    }

    fn alloc(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_alive(&self) -> Result<(), DeviceError> {
        if self.ctx.lost.load(Ordering::SeqCst) {
            Err(DeviceError::Lost)
        } else {
            Ok(())
        }
    }

    fn record(&mut self, command: PassCommand) {
        if let Some(open) = self.open.as_mut() {
            open.pass.commands.push(command);
        }
    }

    /// Record a binding; an invalid one is dropped and fails the next draw.
    fn record_checked(&mut self, command: PassCommand, valid: Result<(), DeviceError>) {
        if let Some(open) = self.open.as_mut() {
            match valid {
                Ok(()) => open.pass.commands.push(command),
                Err(e) => open.note(e),
            }
        }
    }

    fn record_draw(&mut self, count: u32, indexed: bool) -> Result<(), DeviceError> {
        self.check_alive()?;
        let open = self
            .open
            .as_mut()
            .ok_or_else(|| DeviceError::Validation("draw outside of a pass".into()))?;
        if let Some(error) = open.error.take() {
            return Err(error);
        }
        let layout = open
            .pipeline
            .ok_or_else(|| DeviceError::Validation("draw without a pipeline".into()))?;
        if layout == VertexLayout::Mesh && !open.vertex_buffer {
            return Err(DeviceError::Validation("mesh pipeline needs a vertex buffer".into()));
        }
        if indexed && !open.index_buffer {
            return Err(DeviceError::Validation("indexed draw without index buffer".into()));
        }
        open.pass.commands.push(PassCommand::Draw { count, indexed });
        Ok(())
    }

    fn encode_pass(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        pass: &RecordedPass,
    ) -> Result<(), DeviceError> {
        let objects = &self.objects;
        let mut colors = Vec::with_capacity(pass.desc.color.len());
        for attachment in &pass.desc.color {
            let view = &objects.texture(attachment.texture)?.view;
            let load = match attachment.load {
                LoadOp::Clear(c) => wgpu::LoadOp::Clear(wgpu::Color {
                    r: c.r as f64,
                    g: c.g as f64,
                    b: c.b as f64,
                    a: c.a as f64,
                }),
                LoadOp::Load => wgpu::LoadOp::Load,
            };
            colors.push(Some(wgpu::RenderPassColorAttachment {
                view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load,
                    store: wgpu::StoreOp::Store,
                },
            }));
        }
        let depth = match &pass.desc.depth {
            Some(attachment) => {
                let view = &objects.texture(attachment.texture)?.view;
                // No depth ops marks the attachment read-only.
                let depth_ops = (!attachment.read_only).then(|| wgpu::Operations {
                    load: match attachment.load {
                        LoadOp::Clear(v) => wgpu::LoadOp::Clear(v),
                        LoadOp::Load => wgpu::LoadOp::Load,
                    },
                    store: wgpu::StoreOp::Store,
                });
                Some(wgpu::RenderPassDepthStencilAttachment {
                    view,
                    depth_ops,
                    stencil_ops: None,
                })
            }
            None => None,
        };

        let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some(&pass.desc.label),
            color_attachments: &colors,
            depth_stencil_attachment: depth,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        let mut state = BindState::default();
        for command in &pass.commands {
            match *command {
                PassCommand::SetPipeline(id) => rpass.set_pipeline(&objects.pipeline(id)?.pipeline),
                PassCommand::Viewport(r) => rpass.set_viewport(
                    r.x as f32,
                    r.y as f32,
                    r.width as f32,
                    r.height as f32,
                    0.0,
                    1.0,
                ),
                PassCommand::Scissor(r) => rpass.set_scissor_rect(r.x, r.y, r.width, r.height),
                PassCommand::Constant(slot, slice) => state.constants[slot as usize] = Some(slice),
                PassCommand::Texture(slot, id) => state.textures[slot as usize] = Some(id),
                PassCommand::Sampler(slot, id) => state.samplers[slot as usize] = Some(id),
                PassCommand::VertexBuffer(id) => {
                    rpass.set_vertex_buffer(0, objects.buffer(id)?.buffer.slice(..));
                }
                PassCommand::IndexBuffer(id) => {
                    rpass.set_index_buffer(
                        objects.buffer(id)?.buffer.slice(..),
                        wgpu::IndexFormat::Uint32,
                    );
                }
                PassCommand::Draw { count, indexed } => {
                    let (key, offsets) = state.constant_key();
                    let group = self.bind_groups.constants(
                        &self.ctx.device,
                        &self.ctx.layouts,
                        &self.ctx.dummies,
                        objects,
                        key,
                    )?;
                    rpass.set_bind_group(0, group, &offsets);
                    let group = self.bind_groups.resources(
                        &self.ctx.device,
                        &self.ctx.layouts,
                        &self.ctx.dummies,
                        objects,
                        state.resource_key(),
                    )?;
                    rpass.set_bind_group(1, group, &[]);
                    if indexed {
                        rpass.draw_indexed(0..count, 0, 0..1);
                    } else {
                        rpass.draw(0..count, 0..1);
                    }
                }
            }
        }
        Ok(())
    }
}

impl GraphicsDevice for WgpuDevice {
    fn backend(&self) -> BackendKind {
        convert::backend(self.ctx.adapter.get_info().backend)
    }

    fn capabilities(&self) -> Capabilities {
        let limits = self.ctx.device.limits();
        Capabilities {
            max_texture_dimension: limits.max_texture_dimension_2d,
            constant_offset_alignment: limits.min_uniform_buffer_offset_alignment,
        }
    }

    fn status(&self) -> DeviceStatus {
        if self.ctx.lost.load(Ordering::SeqCst) {
            DeviceStatus::Lost
        } else {
            DeviceStatus::Ok
        }
    }

    fn recreate(&mut self) -> Result<(), DeviceError> {
        self.passes.clear();
        self.open = None;
        self.bind_groups.clear();
        self.objects.clear();
        let ctx = Context::new(&self.instance, self.surface.as_ref().map(|s| &s.surface))?;
        if let Some(state) = self.surface.as_mut() {
            state.blit = None;
            state.surface.configure(&ctx.device, &state.config);
        }
        self.ctx = ctx;
        self.generation += 1;
        tracing::info!(generation = self.generation, "wgpu device recreated");
        Ok(())
    }

    fn create_buffer(
        &mut self,
        desc: &BufferDesc,
        data: Option<&[u8]>,
    ) -> Result<BufferId, DeviceError> {
        self.check_alive()?;
        if let Some(data) = data {
            if data.len() as u64 > desc.size {
                return Err(DeviceError::Validation(format!(
                    "{} bytes of initial data exceed buffer {} of {} bytes",
                    data.len(),
                    desc.label,
                    desc.size
                )));
            }
        }
        let size = convert::copy_aligned(desc.size.max(4));
        let (buffer, error) = self.ctx.scoped(|device| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(&desc.label),
                size,
                usage: convert::buffer_usage(desc.usage),
                mapped_at_creation: false,
            })
        });
        if let Some(e) = error {
            return Err(convert::device_error(e));
        }
        if let Some(data) = data {
            self.ctx.queue.write_buffer(&buffer, 0, &padded(data));
        }
        let id = self.alloc();
        self.objects.buffers.insert(id, GpuBuffer { buffer, size });
        Ok(BufferId(id))
    }

    fn write_buffer(
        &mut self,
        buffer: BufferId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        self.check_alive()?;
        let target = self.objects.buffer(buffer)?;
        let data = padded(data);
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 || offset + data.len() as u64 > target.size {
            return Err(DeviceError::Validation(format!(
                "write of {} bytes at {offset} does not fit buffer {} ({} bytes)",
                data.len(),
                buffer.0,
                target.size
            )));
        }
        self.ctx.queue.write_buffer(&target.buffer, offset, &data);
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        if self.objects.buffers.remove(&buffer.0).is_some() {
            self.bind_groups.clear();
        }
    }

    fn create_texture(
        &mut self,
        desc: &TextureDesc,
        data: Option<&[u8]>,
    ) -> Result<TextureId, DeviceError> {
        self.check_alive()?;
        let max = self.capabilities().max_texture_dimension;
        if desc.width == 0 || desc.height == 0 || desc.width > max || desc.height > max {
            return Err(DeviceError::Validation(format!(
                "texture {} has invalid size {}x{}",
                desc.label, desc.width, desc.height
            )));
        }
        if let Some(data) = data {
            if data.len() != desc.byte_len() {
                return Err(DeviceError::Validation(format!(
                    "texture {} expects {} bytes, got {}",
                    desc.label,
                    desc.byte_len(),
                    data.len()
                )));
            }
        }
        let mut usage = convert::texture_usage(desc.usage);
        if data.is_some() {
            usage |= wgpu::TextureUsages::COPY_DST;
        }
        let size = wgpu::Extent3d {
            width: desc.width,
            height: desc.height,
            depth_or_array_layers: 1,
        };
        let (texture, error) = self.ctx.scoped(|device| {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some(&desc.label),
                size,
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: convert::texture_format(desc.format),
                usage,
                view_formats: &[],
            })
        });
        if let Some(e) = error {
            return Err(convert::device_error(e));
        }
        if let Some(data) = data {
            self.ctx.queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: &texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                data,
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(desc.width * desc.format.bytes_per_pixel()),
                    rows_per_image: Some(desc.height),
                },
                size,
            );
        }
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let id = self.alloc();
        self.objects.textures.insert(
            id,
            GpuTexture {
                texture,
                view,
                desc: desc.clone(),
            },
        );
        Ok(TextureId(id))
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        if self.objects.textures.remove(&texture.0).is_some() {
            self.bind_groups.clear();
        }
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerId, DeviceError> {
        self.check_alive()?;
        let filter = convert::filter(desc.filter);
        let address = convert::address(desc.address);
        let sampler = self.ctx.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some(&desc.label),
            address_mode_u: address,
            address_mode_v: address,
            address_mode_w: address,
            mag_filter: filter,
            min_filter: filter,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });
        let id = self.alloc();
        self.objects.samplers.insert(id, sampler);
        Ok(SamplerId(id))
    }

    fn compile_shader(&mut self, desc: &ShaderDesc<'_>) -> Result<ShaderId, DeviceError> {
        self.check_alive()?;
        let compile_error = |log: String| DeviceError::Compile {
            name: desc.name.to_string(),
            log,
        };
        let code = spartan_render::preprocess(desc.source, desc.defines)
            .map_err(|e| compile_error(e.to_string()))?;
        let (module, error) = self.ctx.scoped(|device| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(desc.name),
                source: wgpu::ShaderSource::Wgsl(code.into()),
            })
        });
        match error {
            Some(wgpu::Error::Validation { description, .. }) => {
                return Err(compile_error(description));
            }
            Some(other) => return Err(convert::device_error(other)),
            None => {}
        }
        let id = self.alloc();
        self.objects.shaders.insert(id, module);
        Ok(ShaderId(id))
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<PipelineId, DeviceError> {
        self.check_alive()?;
        let module = self.objects.shaders.get(&desc.shader.0).ok_or(DeviceError::InvalidHandle {
            kind: "shader",
            id: desc.shader.0,
        })?;
        let targets: Vec<Option<wgpu::ColorTargetState>> = desc
            .color_targets
            .iter()
            .map(|t| {
                Some(wgpu::ColorTargetState {
                    format: convert::texture_format(t.format),
                    blend: Some(convert::blend_state(t.blend)),
                    write_mask: wgpu::ColorWrites::ALL,
                })
            })
            .collect();
        let mesh_layout = [wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<Vertex>() as u64,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &MESH_ATTRIBUTES,
        }];
        let buffers: &[wgpu::VertexBufferLayout] = match desc.vertex_layout {
            VertexLayout::Mesh => &mesh_layout,
            VertexLayout::FullScreen => &[],
        };
        let layout = &self.ctx.layouts.pipeline;
        let (pipeline, error) = self.ctx.scoped(|device| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(&desc.label),
                layout: Some(layout),
                vertex: wgpu::VertexState {
                    module,
                    entry_point: Some("vs_main"),
                    compilation_options: Default::default(),
                    buffers,
                },
                fragment: desc.fragment.then(|| wgpu::FragmentState {
                    module,
                    entry_point: Some("fs_main"),
                    compilation_options: Default::default(),
                    targets: &targets,
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: convert::cull_mode(desc.cull),
                    ..Default::default()
                },
                depth_stencil: desc.depth.map(|d| wgpu::DepthStencilState {
                    format: convert::texture_format(d.format),
                    depth_write_enabled: d.write,
                    depth_compare: convert::compare(d.compare),
                    stencil: Default::default(),
                    bias: Default::default(),
                }),
                multisample: Default::default(),
                multiview: None,
                cache: None,
            })
        });
        if let Some(e) = error {
            tracing::error!(pipeline = %desc.label, error = %e, "pipeline creation failed");
            return Err(convert::device_error(e));
        }
        let id = self.alloc();
        self.objects.pipelines.insert(
            id,
            GpuPipeline {
                pipeline,
                vertex_layout: desc.vertex_layout,
            },
        );
        Ok(PipelineId(id))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineId) {
        self.objects.pipelines.remove(&pipeline.0);
    }

    fn begin_pass(&mut self, desc: &PassDesc) -> Result<(), DeviceError> {
        self.check_alive()?;
        if self.open.is_some() {
            return Err(DeviceError::Validation(format!(
                "pass {} begun while another pass is open",
                desc.label
            )));
        }
        let attachments = desc
            .color
            .iter()
            .map(|c| c.texture)
            .chain(desc.depth.iter().map(|d| d.texture));
        for texture in attachments {
            let t = self.objects.texture(texture)?;
            if !t.desc.usage.contains(TextureUsage::RENDER_TARGET) {
                return Err(DeviceError::Validation(format!(
                    "texture {} is not a render target",
                    t.desc.label
                )));
            }
        }
        self.open = Some(OpenPass {
            pass: RecordedPass {
                desc: desc.clone(),
                commands: Vec::new(),
            },
            pipeline: None,
            vertex_buffer: false,
            index_buffer: false,
            error: None,
        });
        Ok(())
    }

    fn set_pipeline(&mut self, pipeline: PipelineId) {
        let layout = self.objects.pipeline(pipeline).map(|p| p.vertex_layout);
        if let Some(open) = self.open.as_mut() {
            match layout {
                Ok(layout) => {
                    open.pipeline = Some(layout);
                    open.pass.commands.push(PassCommand::SetPipeline(pipeline));
                }
                Err(e) => open.note(e),
            }
        }
    }

    fn set_viewport(&mut self, rect: Rect) {
        self.record(PassCommand::Viewport(rect));
    }

    fn set_scissor(&mut self, rect: Rect) {
        self.record(PassCommand::Scissor(rect));
    }

    fn bind_constant_buffer(&mut self, slot: u32, slice: ConstantSlice) {
        let valid = if slot >= CONSTANT_SLOTS {
            Err(DeviceError::Validation(format!("constant slot {slot} out of range")))
        } else {
            self.objects.buffer(slice.buffer).map(|_| ())
        };
        self.record_checked(PassCommand::Constant(slot, slice), valid);
    }

    fn bind_texture(&mut self, slot: u32, texture: TextureId) {
        let valid = if slot >= TEXTURE_SLOTS {
            Err(DeviceError::Validation(format!("texture slot {slot} out of range")))
        } else {
            self.objects.texture(texture).map(|_| ())
        };
        self.record_checked(PassCommand::Texture(slot, texture), valid);
    }

    fn bind_sampler(&mut self, slot: u32, sampler: SamplerId) {
        let valid = if slot >= SAMPLER_SLOTS {
            Err(DeviceError::Validation(format!("sampler slot {slot} out of range")))
        } else {
            self.objects.sampler(sampler).map(|_| ())
        };
        self.record_checked(PassCommand::Sampler(slot, sampler), valid);
    }

    fn set_vertex_buffer(&mut self, buffer: BufferId) {
        let valid = self.objects.buffer(buffer).map(|_| ());
        if let Some(open) = self.open.as_mut() {
            open.vertex_buffer = true;
        }
        self.record_checked(PassCommand::VertexBuffer(buffer), valid);
    }

    fn set_index_buffer(&mut self, buffer: BufferId) {
        let valid = self.objects.buffer(buffer).map(|_| ());
        if let Some(open) = self.open.as_mut() {
            open.index_buffer = true;
        }
        self.record_checked(PassCommand::IndexBuffer(buffer), valid);
    }

    fn draw(&mut self, vertex_count: u32) -> Result<(), DeviceError> {
        self.record_draw(vertex_count, false)
    }

    fn draw_indexed(&mut self, index_count: u32) -> Result<(), DeviceError> {
        self.record_draw(index_count, true)
    }

    fn end_pass(&mut self) -> Result<(), DeviceError> {
        self.check_alive()?;
        let open = self
            .open
            .take()
            .ok_or_else(|| DeviceError::Validation("end_pass without begin_pass".into()))?;
        self.passes.push(open.pass);
        Ok(())
    }

    fn submit(&mut self) -> Result<(), DeviceError> {
        self.check_alive()?;
        if self.open.is_some() {
            return Err(DeviceError::Validation("submit with an open pass".into()));
        }
        let passes = std::mem::take(&mut self.passes);
        if passes.is_empty() {
            return Ok(());
        }
        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("frame_stage"),
            });
        self.ctx.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.ctx.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let mut encoded = Ok(());
        for pass in &passes {
            encoded = self.encode_pass(&mut encoder, pass);
            if encoded.is_err() {
                break;
            }
        }
        if encoded.is_ok() {
            self.ctx.queue.submit(std::iter::once(encoder.finish()));
        }
        let validation = pollster::block_on(self.ctx.device.pop_error_scope());
        let oom = pollster::block_on(self.ctx.device.pop_error_scope());
        encoded?;
        if let Some(e) = validation.or(oom) {
            return Err(convert::device_error(e));
        }
        self.check_alive()
    }

    fn present(&mut self, texture: TextureId) -> Result<(), DeviceError> {
        self.check_alive()?;
        let state = self.surface.as_mut().ok_or(DeviceError::NoSwapchain)?;
        let source = &self.objects.texture(texture)?.view;
        let Some(frame) = state.acquire(&self.ctx.device)? else {
            return Ok(());
        };
        let device = &self.ctx.device;
        let format = state.config.format;
        let blit = state.blit.get_or_insert_with(|| PresentBlit::new(device, format));
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("present"),
            layout: &blit.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(source),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&blit.sampler),
                },
            ],
        });
        let target = frame.texture.create_view(&wgpu::TextureViewDescriptor::default());
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("present"),
        });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("present"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                ..Default::default()
            });
            pass.set_pipeline(&blit.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.draw(0..3, 0..1);
        }
        self.ctx.queue.submit(std::iter::once(encoder.finish()));
        frame.present();
        Ok(())
    }
}

/// `data` padded with zeros to the buffer copy alignment.
fn padded(data: &[u8]) -> Cow<'_, [u8]> {
    let aligned = convert::copy_aligned(data.len() as u64) as usize;
    if aligned == data.len() {
        Cow::Borrowed(data)
    } else {
        let mut owned = data.to_vec();
        owned.resize(aligned, 0);
        Cow::Owned(owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_only_copies_when_needed() {
        assert!(matches!(padded(&[1, 2, 3, 4]), Cow::Borrowed(_)));
        let p = padded(&[1, 2, 3, 4, 5]);
        assert_eq!(&*p, &[1, 2, 3, 4, 5, 0, 0, 0]);
    }

    #[test]
    fn mesh_attributes_match_vertex_layout() {
        let offsets: Vec<u64> = MESH_ATTRIBUTES.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 12, 24, 32]);
        assert_eq!(std::mem::size_of::<Vertex>(), 48);
    }
}
