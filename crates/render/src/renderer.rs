//! The deferred frame pipeline.
//!
//! # Invariants
//! - Stages run in a fixed order; each stage's commands are recorded and
//!   submitted before the next stage begins.
//! - A renderable that cannot be resolved is skipped and reported; the frame
//!   itself never fails because of scene content.
//! - A device error aborts the remaining stages. If it is fatal the next
//!   frame recreates the device and every GPU object before it starts.
//! - A shader variation that does not compile costs only the work that
//!   needed it: the draw, light or post pass is skipped or falls back.
//! - `render_frame` takes `&mut self`, so frames cannot overlap.

use crate::constants::{
    ConstantArena, FrameConstants, LightConstants, LightData, MaterialConstants, ObjectConstants,
    PostConstants, vec4,
};
use crate::culling::{Frustum, sphere_scissor};
use crate::device::{
    AddressMode, CONSTANT_SLOT_FRAME, CONSTANT_SLOT_LIGHT, CONSTANT_SLOT_MATERIAL,
    CONSTANT_SLOT_OBJECT, ColorAttachment, ConstantSlice, DEPTH_TEXTURE_SLOT, DepthAttachment,
    DeviceError, DeviceStatus, FilterMode, GraphicsDevice, LoadOp, PassDesc, PipelineId,
    SAMPLER_SLOT_LINEAR, SAMPLER_SLOT_POINT, SamplerDesc, SamplerId, TextureDesc, TextureId,
};
use crate::gbuffer::{GBuffer, GBufferTargets, create_targets};
use crate::gpu_resources::{GpuMesh, GpuResources, MaterialResolution, MeshResolution};
use crate::report::{FrameError, FrameOutcome, FrameReport, SkipReason, Stage};
use crate::settings::{RendererSettings, ToneMapper};
use crate::shader::{HDR_FORMAT, LDR_FORMAT, PipelineKind, ShaderFlags, ShaderSource};
use crate::shader_cache::{ShaderCacheStats, ShaderVariation, ShaderVariationCache, VariationKey};
use crate::view::{FrameInput, LightItem, PresentTarget, ViewInput};
use spartan_common::{Color, EntityId, Rect};
use spartan_ecs::LightKind;

#[derive(Debug, Clone, Copy)]
struct Samplers {
    linear: SamplerId,
    point: SamplerId,
}

/// Every render target the pipeline writes.
#[derive(Debug)]
struct FrameTargets {
    gbuffer: GBuffer,
    post: PostTargets,
}

/// Lighting accumulation, the LDR ping-pong pair and the output texture.
#[derive(Debug, Clone, Copy)]
struct PostTargets {
    hdr: TextureId,
    ldr: [TextureId; 2],
    output: TextureId,
}

impl PostTargets {
    fn create<D: GraphicsDevice>(
        device: &mut D,
        width: u32,
        height: u32,
    ) -> Result<Self, DeviceError> {
        let ids = create_targets(
            device,
            &[
                TextureDesc::target("hdr", width, height, HDR_FORMAT),
                TextureDesc::target("ldr_ping", width, height, LDR_FORMAT),
                TextureDesc::target("ldr_pong", width, height, LDR_FORMAT),
                TextureDesc::target("output", width, height, LDR_FORMAT),
            ],
        )?;
        Ok(Self {
            hdr: ids[0],
            ldr: [ids[1], ids[2]],
            output: ids[3],
        })
    }

    fn destroy<D: GraphicsDevice>(self, device: &mut D) {
        for id in [self.hdr, self.ldr[0], self.ldr[1], self.output] {
            device.destroy_texture(id);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TargetIds {
    gbuffer: GBufferTargets,
    post: PostTargets,
}

/// A draw with everything resolved and its constants written.
#[derive(Debug, Clone, Copy)]
struct PreparedDraw {
    entity: EntityId,
    mesh: GpuMesh,
    textures: [TextureId; 6],
    object: ConstantSlice,
    material: ConstantSlice,
    pipeline: PipelineId,
    depth_pipeline: Option<PipelineId>,
    /// View depth of the bounds center.
    depth: f32,
}

#[derive(Debug, Clone, Copy)]
struct PreparedLight {
    flags: ShaderFlags,
    constants: ConstantSlice,
    scissor: Rect,
}

#[derive(Debug)]
struct PreparedFrame {
    viewport: Rect,
    frame: ConstantSlice,
    forward_lights: ConstantSlice,
    opaque: Vec<PreparedDraw>,
    /// Back to front.
    transparent: Vec<PreparedDraw>,
    lights: Vec<PreparedLight>,
}

/// Deferred renderer over a graphics device.
pub struct Renderer<D: GraphicsDevice> {
    device: D,
    settings: RendererSettings,
    shaders: ShaderVariationCache,
    gpu: GpuResources,
    arena: ConstantArena,
    targets: Option<FrameTargets>,
    samplers: Option<Samplers>,
    width: u32,
    height: u32,
    needs_recreate: bool,
    frame_index: u64,
}

impl<D: GraphicsDevice> Renderer<D> {
    /// Create the renderer and its GPU state at `settings.resolution`.
    pub fn new(device: D, settings: RendererSettings) -> Result<Self, DeviceError> {
        let alignment = device.capabilities().constant_offset_alignment;
        let [width, height] = settings.resolution;
        let mut renderer = Self {
            device,
            settings,
            shaders: ShaderVariationCache::new(),
            gpu: GpuResources::new(),
            arena: ConstantArena::new(alignment),
            targets: None,
            samplers: None,
            width: width.max(1),
            height: height.max(1),
            needs_recreate: false,
            frame_index: 0,
        };
        renderer.build_gpu_state()?;
        tracing::info!(
            backend = ?renderer.device.backend(),
            width = renderer.width,
            height = renderer.height,
            "renderer created"
        );
        Ok(renderer)
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn settings(&self) -> &RendererSettings {
        &self.settings
    }

    /// Replace the settings. `resolution` only applies at construction; use
    /// `resize` afterwards.
    pub fn set_settings(&mut self, settings: RendererSettings) {
        self.settings = settings;
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Final LDR image of the last frame, for the editor viewport.
    pub fn output_texture(&self) -> Option<TextureId> {
        self.targets.as_ref().map(|t| t.post.output)
    }

    pub fn shader_stats(&self) -> ShaderCacheStats {
        self.shaders.stats()
    }

    pub fn gpu_resources(&self) -> &GpuResources {
        &self.gpu
    }

    /// Retry shader variations that failed to compile.
    pub fn reload_shaders(&mut self) -> usize {
        let cleared = self.shaders.clear_failures();
        tracing::info!(cleared, "shader failures cleared");
        cleared
    }

    /// Resize every render target. Atomic: on failure the previous targets
    /// stay in use and the error is returned.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), DeviceError> {
        let (width, height) = (width.max(1), height.max(1));
        if (width, height) == (self.width, self.height) {
            return Ok(());
        }
        let Some(targets) = self.targets.as_mut() else {
            // Rebuilt at this size on the next frame.
            self.width = width;
            self.height = height;
            return Ok(());
        };

        let result = PostTargets::create(&mut self.device, width, height).and_then(|post| {
            match targets.gbuffer.resize(&mut self.device, width, height) {
                Ok(_) => Ok(post),
                Err(e) => {
                    post.destroy(&mut self.device);
                    Err(e)
                }
            }
        });
        let post = match result {
            Ok(post) => post,
            Err(e) => {
                tracing::error!(
                    width,
                    height,
                    error = %e,
                    "resize failed, keeping previous targets"
                );
                if e.is_fatal() {
                    self.needs_recreate = true;
                }
                return Err(e);
            }
        };
        let old = std::mem::replace(&mut targets.post, post);
        old.destroy(&mut self.device);
        tracing::info!(width, height, "renderer resized");
        self.width = width;
        self.height = height;
        Ok(())
    }

    /// Destroy every GPU object the renderer owns. Runs on drop; the
    /// renderer rebuilds its state on the next frame if used again.
    /// Samplers are kept; the device has no call to destroy them.
    pub fn release_gpu_resources(&mut self) {
        if self.device.status() == DeviceStatus::Lost {
            // Everything died with the device.
            self.shaders.forget();
            self.gpu.forget();
            self.arena.forget();
        } else {
            self.shaders.release(&mut self.device);
            self.gpu.release(&mut self.device);
            self.arena.release(&mut self.device);
            if let Some(targets) = self.targets.take() {
                targets.gbuffer.release(&mut self.device);
                targets.post.destroy(&mut self.device);
            }
        }
        self.targets = None;
        tracing::debug!("renderer GPU resources released");
    }

    fn build_gpu_state(&mut self) -> Result<(), DeviceError> {
        let gbuffer = GBuffer::new(&mut self.device, self.width, self.height)?;
        let post = match PostTargets::create(&mut self.device, self.width, self.height) {
            Ok(post) => post,
            Err(e) => {
                gbuffer.release(&mut self.device);
                return Err(e);
            }
        };
        self.targets = Some(FrameTargets { gbuffer, post });
        self.gpu.ensure_defaults(&mut self.device)?;
        if self.samplers.is_some() {
            return Ok(());
        }
        let linear = self.device.create_sampler(&SamplerDesc {
            label: "linear_wrap".into(),
            filter: FilterMode::Linear,
            address: AddressMode::Repeat,
        })?;
        let point = self.device.create_sampler(&SamplerDesc {
            label: "point_clamp".into(),
            filter: FilterMode::Nearest,
            address: AddressMode::ClampToEdge,
        })?;
        self.samplers = Some(Samplers { linear, point });
        Ok(())
    }

    /// Recreate the device and rebuild every GPU object from scratch.
    fn recreate(&mut self) -> Result<(), DeviceError> {
        tracing::warn!(frame = self.frame_index, "recreating device and GPU resources");
        self.device.recreate()?;
        self.shaders.forget();
        self.gpu.forget();
        self.arena.forget();
        self.targets = None;
        self.samplers = None;
        self.build_gpu_state()?;
        self.needs_recreate = false;
        Ok(())
    }

    fn target_ids(&self) -> Result<TargetIds, DeviceError> {
        self.targets
            .as_ref()
            .map(|t| TargetIds {
                gbuffer: *t.gbuffer.targets(),
                post: t.post,
            })
            .ok_or_else(|| DeviceError::Validation("render targets are not created".into()))
    }

    fn samplers(&self) -> Result<Samplers, DeviceError> {
        self.samplers
            .ok_or_else(|| DeviceError::Validation("samplers are not created".into()))
    }

    /// Render one frame.
    pub fn render_frame(&mut self, input: &FrameInput<'_>) -> Result<FrameReport, FrameError> {
        let frame_index = self.frame_index;
        self.frame_index += 1;
        let _span = tracing::info_span!("render_frame", frame = frame_index).entered();

        if self.needs_recreate || self.device.status() == DeviceStatus::Lost {
            self.needs_recreate = true;
            self.recreate().map_err(FrameError::Recreate)?;
        } else if self.targets.is_none() {
            self.build_gpu_state().map_err(FrameError::Recreate)?;
        }

        let mut report = FrameReport {
            frame_index,
            ..FrameReport::default()
        };
        match self.run_stages(input, &mut report) {
            Ok(()) => {
                report.shaders = self.shaders.stats();
                tracing::debug!(
                    draws = report.total_draws(),
                    skipped = report.skipped.len(),
                    lights = report.lights_drawn,
                    "frame complete"
                );
                Ok(report)
            }
            Err((stage, source)) => {
                if source.is_fatal() {
                    tracing::error!(
                        %stage,
                        error = %source,
                        "frame aborted, GPU resources will be recreated"
                    );
                    self.needs_recreate = true;
                } else {
                    tracing::error!(%stage, error = %source, "frame aborted");
                }
                Err(FrameError::Device {
                    stage,
                    completed: report.stages,
                    source,
                })
            }
        }
    }

    fn run_stages(
        &mut self,
        input: &FrameInput<'_>,
        report: &mut FrameReport,
    ) -> Result<(), (Stage, DeviceError)> {
        let Some(view) = input.view else {
            tracing::warn!("no active camera, nothing to render");
            report.outcome = FrameOutcome::NoCamera;
            self.clear_output().map_err(|e| (Stage::Resolve, e))?;
            report.stages.push(Stage::Resolve);
            return Ok(());
        };

        let frame = self
            .resolve(input, &view, report)
            .map_err(|e| (Stage::Resolve, e))?;
        report.stages.push(Stage::Resolve);

        let prepass = self.settings.depth_prepass;
        if prepass {
            self.depth_prepass(&frame, report)
                .map_err(|e| (Stage::DepthPrepass, e))?;
            report.stages.push(Stage::DepthPrepass);
        }
        self.gbuffer_pass(&frame, prepass, report)
            .map_err(|e| (Stage::GBuffer, e))?;
        report.stages.push(Stage::GBuffer);
        self.lighting(&frame, report)
            .map_err(|e| (Stage::Lighting, e))?;
        report.stages.push(Stage::Lighting);
        self.transparency(&frame, report)
            .map_err(|e| (Stage::Transparency, e))?;
        report.stages.push(Stage::Transparency);
        let final_ldr = self
            .post_process(&frame, report)
            .map_err(|e| (Stage::PostProcess, e))?;
        report.stages.push(Stage::PostProcess);
        self.present(&frame, final_ldr, input.target, report)
            .map_err(|e| (Stage::Present, e))?;
        report.stages.push(Stage::Present);
        Ok(())
    }

    /// Compile or fetch a variation. `Ok(None)` when it does not compile.
    fn variation(&mut self, key: VariationKey) -> Result<Option<ShaderVariation>, DeviceError> {
        match self.shaders.get_or_compile(&mut self.device, key) {
            Ok(variation) => Ok(Some(variation)),
            Err(e) if e.is_fatal() => Err(e),
            Err(_) => Ok(None),
        }
    }

    fn post_pipeline(&mut self, flags: ShaderFlags) -> Result<Option<PipelineId>, DeviceError> {
        let key = VariationKey::new(ShaderSource::PostProcess, flags, PipelineKind::Post);
        Ok(self.variation(key)?.map(|v| v.pipeline))
    }

    /// The first of `candidates` that compiles. Errors only when none does.
    fn post_pipeline_with_fallback(
        &mut self,
        candidates: &[ShaderFlags],
    ) -> Result<PipelineId, DeviceError> {
        for (i, flags) in candidates.iter().enumerate() {
            if let Some(pipeline) = self.post_pipeline(*flags)? {
                if i > 0 {
                    tracing::warn!(
                        wanted = ?candidates[0],
                        using = ?flags,
                        "post variation unavailable, using fallback"
                    );
                }
                return Ok(pipeline);
            }
        }
        Err(DeviceError::Compile {
            name: ShaderSource::PostProcess.file_name().to_string(),
            log: format!("no usable variation among {candidates:?}"),
        })
    }

    fn frame_constants(&self, view: &ViewInput, viewport: Rect) -> FrameConstants {
        let view_projection = view.view_projection();
        let (w, h) = (viewport.width as f32, viewport.height as f32);
        let [r, g, b] = self.settings.ambient();
        FrameConstants {
            view: view.view.to_cols_array_2d(),
            projection: view.projection.to_cols_array_2d(),
            view_projection: view_projection.to_cols_array_2d(),
            inverse_view_projection: view_projection.inverse().to_cols_array_2d(),
            camera_position: vec4(view.position, 1.0),
            viewport: [w, h, 1.0 / w, 1.0 / h],
            clear_color: view.clear_color.to_array(),
            ambient: [r, g, b, 1.0],
        }
    }

    // --- stages ---

    fn resolve(
        &mut self,
        input: &FrameInput<'_>,
        view: &ViewInput,
        report: &mut FrameReport,
    ) -> Result<PreparedFrame, DeviceError> {
        let _span = tracing::info_span!("stage", name = Stage::Resolve.name()).entered();
        let cache = input.resources;
        self.gpu.collect_garbage(&mut self.device, cache);
        self.arena.reset();

        let viewport = Rect::from_size(self.width, self.height);
        let view_projection = view.view_projection();
        let frustum = Frustum::from_view_projection(view_projection);
        let frame_constants = self.frame_constants(view, viewport);
        let frame = self.arena.push(&mut self.device, &frame_constants)?;
        let prepass = self.settings.depth_prepass;

        let mut opaque = Vec::new();
        let mut transparent = Vec::new();
        for item in &input.draws {
            let mut skip = |reason: SkipReason| report.skipped.push((item.entity, reason));

            let mesh = match self.gpu.resolve_mesh(&mut self.device, cache, item.mesh)? {
                MeshResolution::Ready(mesh) => mesh,
                MeshResolution::NotReady => {
                    skip(SkipReason::NotReady);
                    continue;
                }
                MeshResolution::Missing => {
                    tracing::warn!(
                        entity = %item.entity.short(),
                        mesh = %item.mesh,
                        "mesh missing, skipping renderable"
                    );
                    skip(SkipReason::MeshMissing);
                    continue;
                }
            };
            let bounds = mesh.bounds.transformed(&item.world);
            if self.settings.frustum_culling && !frustum.intersects_aabb(&bounds) {
                skip(SkipReason::Culled);
                continue;
            }
            let resolved = self
                .gpu
                .resolve_material(&mut self.device, cache, item.material)?;
            let material = match resolved {
                MaterialResolution::Ready(material) => material,
                MaterialResolution::NotReady => {
                    skip(SkipReason::NotReady);
                    continue;
                }
                MaterialResolution::Missing => {
                    tracing::warn!(
                        entity = %item.entity.short(),
                        material = %item.material,
                        "material missing, skipping renderable"
                    );
                    skip(SkipReason::MaterialMissing);
                    continue;
                }
            };

            let is_transparent = material.is_transparent();
            let key = if is_transparent {
                VariationKey::new(
                    ShaderSource::Transparent,
                    material.flags | ShaderFlags::ALPHA_BLEND,
                    PipelineKind::Transparent,
                )
            } else if prepass {
                VariationKey::new(
                    ShaderSource::GBuffer,
                    material.flags,
                    PipelineKind::GBufferPrepassed,
                )
            } else {
                VariationKey::new(ShaderSource::GBuffer, material.flags, PipelineKind::GBuffer)
            };
            let Some(variation) = self.variation(key)? else {
                skip(SkipReason::ShaderUnavailable);
                continue;
            };
            let depth_pipeline = if !is_transparent && prepass {
                let key = VariationKey::new(
                    ShaderSource::GBuffer,
                    ShaderFlags::DEPTH_ONLY,
                    PipelineKind::DepthPrepass,
                );
                match self.variation(key)? {
                    Some(v) => Some(v.pipeline),
                    None => {
                        skip(SkipReason::ShaderUnavailable);
                        continue;
                    }
                }
            } else {
                None
            };

            let object = self.arena.push(&mut self.device, &ObjectConstants::new(item.world))?;
            let material_constants = self
                .arena
                .push(&mut self.device, &MaterialConstants::new(&material.material))?;
            let draw = PreparedDraw {
                entity: item.entity,
                mesh,
                textures: material.textures,
                object,
                material: material_constants,
                pipeline: variation.pipeline,
                depth_pipeline,
                depth: view.view_depth(bounds.center()),
            };
            if is_transparent {
                transparent.push(draw);
            } else {
                opaque.push(draw);
            }
        }
        transparent.sort_by(|a, b| b.depth.total_cmp(&a.depth).then(a.entity.cmp(&b.entity)));

        let mut lights = Vec::new();
        for light in &input.lights {
            let (flags, scissor) = match light.kind {
                LightKind::Directional => (ShaderFlags::DIRECTIONAL, Some(viewport)),
                LightKind::Point | LightKind::Spot { .. } => {
                    let flags = if matches!(light.kind, LightKind::Point) {
                        ShaderFlags::POINT
                    } else {
                        ShaderFlags::SPOT
                    };
                    let scissor = if self.settings.light_volume_scissor {
                        sphere_scissor(
                            view_projection,
                            &frustum,
                            light.position,
                            light.range,
                            viewport,
                        )
                    } else {
                        frustum
                            .intersects_sphere(light.position, light.range)
                            .then_some(viewport)
                    };
                    (flags, scissor)
                }
            };
            let Some(scissor) = scissor else {
                report.lights_culled += 1;
                continue;
            };
            let constants = self
                .arena
                .push(&mut self.device, &LightConstants::new([light_data(light)]))?;
            lights.push(PreparedLight {
                flags,
                constants,
                scissor,
            });
        }

        // Directional lights first so they survive truncation.
        let mut forward: Vec<&LightItem> = input.lights.iter().collect();
        forward.sort_by_key(|l| !matches!(l.kind, LightKind::Directional));
        let forward_lights = self
            .arena
            .push(&mut self.device, &LightConstants::new(forward.into_iter().map(light_data)))?;

        tracing::debug!(
            opaque = opaque.len(),
            transparent = transparent.len(),
            lights = lights.len(),
            skipped = report.skipped.len(),
            "frame resolved"
        );
        Ok(PreparedFrame {
            viewport,
            frame,
            forward_lights,
            opaque,
            transparent,
            lights,
        })
    }

    fn bind_frame(&mut self, frame: &PreparedFrame) -> Result<(), DeviceError> {
        let samplers = self.samplers()?;
        self.device.set_viewport(frame.viewport);
        self.device.set_scissor(frame.viewport);
        self.device.bind_constant_buffer(CONSTANT_SLOT_FRAME, frame.frame);
        self.device.bind_sampler(SAMPLER_SLOT_LINEAR, samplers.linear);
        self.device.bind_sampler(SAMPLER_SLOT_POINT, samplers.point);
        Ok(())
    }

    fn draw_mesh(&mut self, draw: &PreparedDraw, pipeline: PipelineId) -> Result<(), DeviceError> {
        self.device.set_pipeline(pipeline);
        self.device.bind_constant_buffer(CONSTANT_SLOT_OBJECT, draw.object);
        self.device.bind_constant_buffer(CONSTANT_SLOT_MATERIAL, draw.material);
        for (slot, texture) in draw.textures.iter().enumerate() {
            self.device.bind_texture(slot as u32, *texture);
        }
        self.device.set_vertex_buffer(draw.mesh.vertex_buffer);
        self.device.set_index_buffer(draw.mesh.index_buffer);
        self.device.draw_indexed(draw.mesh.index_count)
    }

    fn depth_prepass(
        &mut self,
        frame: &PreparedFrame,
        report: &mut FrameReport,
    ) -> Result<(), DeviceError> {
        let _span = tracing::info_span!("stage", name = Stage::DepthPrepass.name()).entered();
        let targets = self.target_ids()?;
        self.device.begin_pass(&PassDesc {
            label: "depth_prepass".into(),
            color: Vec::new(),
            depth: Some(DepthAttachment {
                texture: targets.gbuffer.depth,
                load: LoadOp::Clear(1.0),
                read_only: false,
            }),
        })?;
        self.bind_frame(frame)?;
        for draw in &frame.opaque {
            if let Some(pipeline) = draw.depth_pipeline {
                self.draw_mesh(draw, pipeline)?;
                report.count_draw(Stage::DepthPrepass);
            }
        }
        self.device.end_pass()?;
        self.device.submit()
    }

    fn gbuffer_pass(
        &mut self,
        frame: &PreparedFrame,
        prepass: bool,
        report: &mut FrameReport,
    ) -> Result<(), DeviceError> {
        let _span = tracing::info_span!("stage", name = Stage::GBuffer.name()).entered();
        let (color, depth) = {
            let targets = self
                .targets
                .as_ref()
                .ok_or_else(|| DeviceError::Validation("render targets are not created".into()))?;
            targets.gbuffer.clear(&mut self.device, !prepass)?;
            (targets.gbuffer.color_attachments(), targets.gbuffer.targets().depth)
        };
        self.device.begin_pass(&PassDesc {
            label: "gbuffer".into(),
            color,
            depth: Some(DepthAttachment {
                texture: depth,
                load: LoadOp::Load,
                read_only: prepass,
            }),
        })?;
        self.bind_frame(frame)?;
        for draw in &frame.opaque {
            self.draw_mesh(draw, draw.pipeline)?;
            report.count_draw(Stage::GBuffer);
        }
        self.device.end_pass()?;
        self.device.submit()
    }

    fn lighting(
        &mut self,
        frame: &PreparedFrame,
        report: &mut FrameReport,
    ) -> Result<(), DeviceError> {
        let _span = tracing::info_span!("stage", name = Stage::Lighting.name()).entered();
        let targets = self.target_ids()?;
        let ambient = self
            .variation(VariationKey::new(
                ShaderSource::Lighting,
                ShaderFlags::AMBIENT,
                PipelineKind::Lighting,
            ))?
            .map(|v| v.pipeline);
        let mut pipelines = Vec::with_capacity(frame.lights.len());
        for light in &frame.lights {
            let key =
                VariationKey::new(ShaderSource::Lighting, light.flags, PipelineKind::Lighting);
            pipelines.push(self.variation(key)?.map(|v| v.pipeline));
        }

        self.device.begin_pass(&PassDesc {
            label: "lighting".into(),
            color: vec![ColorAttachment {
                texture: targets.post.hdr,
                load: LoadOp::Clear(Color::rgba(0.0, 0.0, 0.0, 1.0)),
            }],
            depth: None,
        })?;
        self.bind_frame(frame)?;
        let gbuffer = targets.gbuffer;
        self.device.bind_texture(0, gbuffer.albedo);
        self.device.bind_texture(1, gbuffer.normal);
        self.device.bind_texture(2, gbuffer.material);
        self.device.bind_texture(DEPTH_TEXTURE_SLOT, gbuffer.depth);
        self.device.bind_constant_buffer(CONSTANT_SLOT_LIGHT, frame.forward_lights);

        match ambient {
            Some(pipeline) => {
                self.device.set_pipeline(pipeline);
                self.device.draw(3)?;
                report.count_draw(Stage::Lighting);
            }
            None => tracing::warn!("ambient shader unavailable, ambient term skipped"),
        }

        for (light, pipeline) in frame.lights.iter().zip(pipelines) {
            let Some(pipeline) = pipeline else {
                tracing::warn!(flags = ?light.flags, "light shader unavailable, light skipped");
                continue;
            };
            self.device.set_scissor(light.scissor);
            self.device.set_pipeline(pipeline);
            self.device.bind_constant_buffer(CONSTANT_SLOT_LIGHT, light.constants);
            self.device.draw(3)?;
            report.count_draw(Stage::Lighting);
            report.lights_drawn += 1;
        }
        self.device.end_pass()?;
        self.device.submit()
    }

    fn transparency(
        &mut self,
        frame: &PreparedFrame,
        report: &mut FrameReport,
    ) -> Result<(), DeviceError> {
        let _span = tracing::info_span!("stage", name = Stage::Transparency.name()).entered();
        let targets = self.target_ids()?;
        self.device.begin_pass(&PassDesc {
            label: "transparency".into(),
            color: vec![ColorAttachment {
                texture: targets.post.hdr,
                load: LoadOp::Load,
            }],
            depth: Some(DepthAttachment {
                texture: targets.gbuffer.depth,
                load: LoadOp::Load,
                read_only: true,
            }),
        })?;
        self.bind_frame(frame)?;
        self.device.bind_constant_buffer(CONSTANT_SLOT_LIGHT, frame.forward_lights);
        for draw in &frame.transparent {
            self.draw_mesh(draw, draw.pipeline)?;
            report.count_draw(Stage::Transparency);
            report.transparent_distances.push(draw.depth);
        }
        self.device.end_pass()?;
        self.device.submit()
    }

    fn post_pass(
        &mut self,
        label: &str,
        pipeline: PipelineId,
        constants: ConstantSlice,
        source: TextureId,
        target: TextureId,
        viewport: Rect,
    ) -> Result<(), DeviceError> {
        self.device.begin_pass(&PassDesc {
            label: label.into(),
            color: vec![ColorAttachment {
                texture: target,
                load: LoadOp::Load,
            }],
            depth: None,
        })?;
        self.device.set_viewport(viewport);
        self.device.set_scissor(viewport);
        self.device.set_pipeline(pipeline);
        self.device.bind_constant_buffer(CONSTANT_SLOT_OBJECT, constants);
        self.device.bind_texture(0, source);
        self.device.draw(3)?;
        self.device.end_pass()
    }

    /// Tone map, then the optional anti-aliasing and sharpening passes.
    /// Returns the LDR target holding the result.
    fn post_process(
        &mut self,
        frame: &PreparedFrame,
        report: &mut FrameReport,
    ) -> Result<TextureId, DeviceError> {
        let _span = tracing::info_span!("stage", name = Stage::PostProcess.name()).entered();
        let targets = self.target_ids()?;
        let (w, h) = (frame.viewport.width as f32, frame.viewport.height as f32);
        let constants = self.arena.push(
            &mut self.device,
            &PostConstants {
                texel: [1.0 / w, 1.0 / h, w, h],
                params: [
                    self.settings.exposure,
                    self.settings.gamma,
                    self.settings.sharpen_strength,
                    0.0,
                ],
            },
        )?;

        let tonemap = match self.settings.tone_mapper {
            ToneMapper::Aces => ShaderFlags::TONEMAP_ACES,
            ToneMapper::Reinhard => ShaderFlags::TONEMAP_REINHARD,
            ToneMapper::None => ShaderFlags::empty(),
        };
        let [ping, pong] = targets.post.ldr;
        // Without the tone curve the pass still applies exposure and gamma.
        let tonemap = self.post_pipeline_with_fallback(&[
            tonemap,
            ShaderFlags::empty(),
            ShaderFlags::BLIT,
        ])?;
        self.post_pass("tonemap", tonemap, constants, targets.post.hdr, ping, frame.viewport)?;
        report.count_draw(Stage::PostProcess);

        let (mut current, mut spare) = (ping, pong);
        let mut chain = Vec::new();
        if self.settings.fxaa {
            chain.push(("fxaa", ShaderFlags::FXAA));
        }
        if self.settings.sharpen_strength > 0.0 {
            chain.push(("sharpen", ShaderFlags::SHARPEN));
        }
        for (label, flags) in chain {
            let Some(pipeline) = self.post_pipeline(flags)? else {
                tracing::warn!(pass = label, "post pass shader unavailable, pass skipped");
                continue;
            };
            self.post_pass(label, pipeline, constants, current, spare, frame.viewport)?;
            report.count_draw(Stage::PostProcess);
            std::mem::swap(&mut current, &mut spare);
        }
        self.device.submit()?;
        Ok(current)
    }

    fn present(
        &mut self,
        frame: &PreparedFrame,
        source: TextureId,
        target: PresentTarget,
        report: &mut FrameReport,
    ) -> Result<(), DeviceError> {
        let _span = tracing::info_span!("stage", name = Stage::Present.name()).entered();
        let targets = self.target_ids()?;
        let constants = self.arena.push(
            &mut self.device,
            &PostConstants {
                texel: [0.0; 4],
                params: [1.0, 1.0, 0.0, 0.0],
            },
        )?;
        let blit = self.post_pipeline_with_fallback(&[ShaderFlags::BLIT])?;
        self.post_pass("present", blit, constants, source, targets.post.output, frame.viewport)?;
        report.count_draw(Stage::Present);
        self.device.submit()?;
        if target == PresentTarget::Swapchain {
            self.device.present(targets.post.output)?;
        }
        Ok(())
    }

    fn clear_output(&mut self) -> Result<(), DeviceError> {
        let targets = self.target_ids()?;
        self.device.begin_pass(&PassDesc {
            label: "clear_output".into(),
            color: vec![ColorAttachment {
                texture: targets.post.output,
                load: LoadOp::Clear(Color::BLACK),
            }],
            depth: None,
        })?;
        self.device.end_pass()?;
        self.device.submit()
    }
}

impl<D: GraphicsDevice> Drop for Renderer<D> {
    fn drop(&mut self) {
        self.release_gpu_resources();
    }
}

fn light_data(light: &LightItem) -> LightData {
    let (kind, cone) = match light.kind {
        LightKind::Directional => (0.0, [0.0; 4]),
        LightKind::Point => (1.0, [0.0; 4]),
        LightKind::Spot {
            inner_angle,
            outer_angle,
        } => (2.0, [inner_angle.cos(), outer_angle.cos(), 0.0, 0.0]),
    };
    let c = light.color;
    LightData {
        position_range: vec4(light.position, light.range),
        direction_kind: vec4(light.direction, kind),
        color_intensity: [c.r, c.g, c.b, light.intensity],
        cone,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Command, RecordingDevice};
    use crate::view::{DrawFlags, DrawItem};
    use glam::{Mat4, Vec3};
    use spartan_resources::{
        BlendMode, Material, ResourceCache, TextureData, TextureSlot, material_handle, mesh_handle,
        primitives, texture_handle,
    };

    fn settings() -> RendererSettings {
        RendererSettings {
            resolution: [320, 240],
            ..RendererSettings::default()
        }
    }

    fn renderer(settings: RendererSettings) -> Renderer<RecordingDevice> {
        Renderer::new(RecordingDevice::new(), settings).unwrap()
    }

    fn view() -> ViewInput {
        ViewInput::look_at(
            Vec3::new(0.0, 0.0, 5.0),
            Vec3::ZERO,
            60f32.to_radians(),
            Rect::from_size(320, 240),
        )
    }

    fn cube_at(position: Vec3, material: &str) -> DrawItem {
        DrawItem {
            entity: EntityId::new(),
            world: Mat4::from_translation(position),
            mesh: mesh_handle(primitives::CUBE),
            material: material_handle(material),
            flags: DrawFlags::empty(),
        }
    }

    fn sun() -> LightItem {
        LightItem {
            entity: EntityId::new(),
            kind: LightKind::Directional,
            position: Vec3::ZERO,
            direction: Vec3::new(0.0, -1.0, -1.0).normalize(),
            color: Color::WHITE,
            intensity: 3.0,
            range: 0.0,
            casts_shadows: true,
        }
    }

    fn point_light(position: Vec3, range: f32) -> LightItem {
        LightItem {
            kind: LightKind::Point,
            position,
            range,
            casts_shadows: false,
            ..sun()
        }
    }

    fn input<'a>(
        cache: &'a ResourceCache,
        draws: Vec<DrawItem>,
        lights: Vec<LightItem>,
    ) -> FrameInput<'a> {
        FrameInput {
            view: Some(view()),
            draws,
            lights,
            resources: cache,
            target: PresentTarget::Offscreen,
        }
    }

    fn submits(device: &RecordingDevice) -> usize {
        device.log().iter().filter(|c| matches!(c, Command::Submit)).count()
    }

    #[test]
    fn stages_run_in_order_and_submit_each() {
        let cache = ResourceCache::with_builtins();
        let mut renderer = renderer(settings());
        let frame = input(&cache, vec![cube_at(Vec3::ZERO, Material::DEFAULT_NAME)], vec![sun()]);

        let report = renderer.render_frame(&frame).unwrap();
        assert_eq!(report.outcome, FrameOutcome::Rendered);
        assert_eq!(report.stages, Stage::ALL.to_vec());
        assert_eq!(
            renderer.device().pass_labels(),
            vec![
                "depth_prepass",
                "gbuffer_clear",
                "gbuffer",
                "lighting",
                "transparency",
                "tonemap",
                "fxaa",
                "present"
            ]
        );
        // One submit per stage after resolve.
        assert_eq!(submits(renderer.device()), 6);
        assert_eq!(report.draw_count(Stage::DepthPrepass), 1);
        assert_eq!(report.draw_count(Stage::GBuffer), 1);
        // Ambient plus the sun.
        assert_eq!(report.draw_count(Stage::Lighting), 2);
        assert_eq!(report.lights_drawn, 1);
    }

    #[test]
    fn submit_separates_every_stage() {
        let cache = ResourceCache::with_builtins();
        let mut renderer = renderer(settings());
        let frame = input(&cache, vec![cube_at(Vec3::ZERO, Material::DEFAULT_NAME)], vec![sun()]);
        renderer.render_frame(&frame).unwrap();

        // Every stage's last pass ends before its submit, and no pass of a
        // later stage begins before that submit.
        let mut seen_submit_after = Vec::new();
        let mut last_label = String::new();
        for command in renderer.device().log() {
            match command {
                Command::BeginPass { label } => last_label = label.clone(),
                Command::Submit => seen_submit_after.push(last_label.clone()),
                _ => {}
            }
        }
        assert_eq!(
            seen_submit_after,
            vec!["depth_prepass", "gbuffer", "lighting", "transparency", "fxaa", "present"]
        );
    }

    #[test]
    fn without_prepass_gbuffer_writes_depth() {
        let cache = ResourceCache::with_builtins();
        let mut renderer = renderer(RendererSettings {
            depth_prepass: false,
            fxaa: false,
            ..settings()
        });
        let frame = input(&cache, vec![cube_at(Vec3::ZERO, Material::DEFAULT_NAME)], vec![]);
        let report = renderer.render_frame(&frame).unwrap();
        assert!(!report.stages.contains(&Stage::DepthPrepass));

        let device = renderer.device();
        assert!(!device.pass_labels().contains(&"depth_prepass"));
        let gbuffer_pipeline = device
            .log()
            .iter()
            .find_map(|c| match c {
                Command::SetPipeline { pipeline, label } if label.starts_with("gbuffer.wgsl") => {
                    Some(*pipeline)
                }
                _ => None,
            })
            .unwrap();
        let desc = device.pipeline_desc(gbuffer_pipeline).unwrap();
        assert!(desc.depth.unwrap().write);
    }

    #[test]
    fn not_ready_material_is_skipped_until_loaded() {
        let cache = ResourceCache::with_builtins();
        let (tex, generation) = cache.reserve_texture("bricks.png");
        cache.insert_material(
            "bricks",
            Material::named("bricks").with_texture(TextureSlot::Albedo, tex),
        );
        let ready = cube_at(Vec3::new(-1.0, 0.0, 0.0), Material::DEFAULT_NAME);
        let waiting = cube_at(Vec3::new(1.0, 0.0, 0.0), "bricks");
        let mut renderer = renderer(settings());

        let report = renderer
            .render_frame(&input(&cache, vec![ready, waiting], vec![]))
            .unwrap();
        assert_eq!(report.skipped, vec![(waiting.entity, SkipReason::NotReady)]);
        assert_eq!(report.draw_count(Stage::GBuffer), 1);

        let bricks = TextureData::solid("bricks.png", Color::WHITE, true);
        cache.finish_texture(tex, generation, Ok(bricks));
        let report = renderer
            .render_frame(&input(&cache, vec![ready, waiting], vec![]))
            .unwrap();
        assert!(report.skipped.is_empty());
        assert_eq!(report.draw_count(Stage::GBuffer), 2);
    }

    #[test]
    fn unresolvable_renderables_are_reported_not_fatal() {
        let cache = ResourceCache::with_builtins();
        let mut no_mesh = cube_at(Vec3::ZERO, Material::DEFAULT_NAME);
        no_mesh.mesh = mesh_handle("missing.json");
        let no_material = cube_at(Vec3::ZERO, "missing_material");
        let behind = cube_at(Vec3::new(0.0, 0.0, 20.0), Material::DEFAULT_NAME);
        let mut renderer = renderer(settings());

        let report = renderer
            .render_frame(&input(&cache, vec![no_mesh, no_material, behind], vec![]))
            .unwrap();
        assert_eq!(
            report.skipped,
            vec![
                (no_mesh.entity, SkipReason::MeshMissing),
                (no_material.entity, SkipReason::MaterialMissing),
                (behind.entity, SkipReason::Culled),
            ]
        );
        assert_eq!(report.draw_count(Stage::GBuffer), 0);
        assert_eq!(report.stages, Stage::ALL.to_vec());
    }

    #[test]
    fn failed_texture_binds_missing_fallback() {
        let cache = ResourceCache::with_builtins();
        cache.insert_material(
            "broken",
            Material::named("broken").with_texture(TextureSlot::Albedo, texture_handle("gone.png")),
        );
        let mut renderer = renderer(settings());
        let report = renderer
            .render_frame(&input(&cache, vec![cube_at(Vec3::ZERO, "broken")], vec![]))
            .unwrap();
        assert_eq!(report.draw_count(Stage::GBuffer), 1);
        let missing = renderer.gpu_resources().defaults().unwrap().missing;
        assert!(renderer.device().log().contains(&Command::BindTexture {
            slot: 0,
            texture: missing
        }));
    }

    #[test]
    fn variations_compile_once_and_failures_skip_draws() {
        let cache = ResourceCache::with_builtins();
        cache.insert_material(
            "normal_mapped",
            Material::named("normal_mapped")
                .with_texture(TextureSlot::Normal, texture_handle("n.png")),
        );
        let normal = TextureData::solid("n.png", Color::rgb(0.5, 0.5, 1.0), false);
        cache.insert_texture("n.png", normal);
        let mut renderer = renderer(settings());
        renderer.device_mut().fail_shaders_defining(Some("HAS_NORMAL_MAP"));
        let plain = cube_at(Vec3::new(-1.0, 0.0, 0.0), Material::DEFAULT_NAME);
        let mapped = cube_at(Vec3::new(1.0, 0.0, 0.0), "normal_mapped");

        let report = renderer
            .render_frame(&input(&cache, vec![plain, mapped], vec![sun()]))
            .unwrap();
        assert_eq!(report.skipped, vec![(mapped.entity, SkipReason::ShaderUnavailable)]);
        let compiles = renderer.device().compile_count();

        for _ in 0..3 {
            renderer
                .render_frame(&input(&cache, vec![plain, mapped], vec![sun()]))
                .unwrap();
        }
        assert_eq!(renderer.device().compile_count(), compiles);
        assert!(renderer.shader_stats().hits > 0);

        renderer.device_mut().fail_shaders_defining(None);
        assert_eq!(renderer.reload_shaders(), 1);
        let report = renderer
            .render_frame(&input(&cache, vec![plain, mapped], vec![sun()]))
            .unwrap();
        assert!(report.skipped.is_empty());
    }

    #[test]
    fn failed_tone_mapper_falls_back_without_recreating() {
        let cache = ResourceCache::with_builtins();
        let mut renderer = renderer(settings());
        renderer.device_mut().fail_shaders_defining(Some("TONEMAP_ACES"));
        let draws = vec![cube_at(Vec3::ZERO, Material::DEFAULT_NAME)];

        let mut compiles = Vec::new();
        for _ in 0..4 {
            let report = renderer
                .render_frame(&input(&cache, draws.clone(), vec![sun()]))
                .unwrap();
            assert_eq!(report.stages, Stage::ALL.to_vec());
            assert_eq!(report.draw_count(Stage::PostProcess), 2);
            compiles.push(renderer.device().compile_count());
        }
        assert_eq!(renderer.device().recreate_count(), 0);
        assert!(compiles.windows(2).all(|w| w[0] == w[1]), "recompiled: {compiles:?}");
        assert_eq!(renderer.shader_stats().failures, 1);
        assert!(renderer.device().pass_labels().contains(&"tonemap"));
    }

    #[test]
    fn failed_optional_passes_are_skipped() {
        let cache = ResourceCache::with_builtins();
        let draws = vec![cube_at(Vec3::ZERO, Material::DEFAULT_NAME)];

        let mut renderer = renderer(settings());
        renderer.device_mut().fail_shaders_defining(Some("PASS_FXAA"));
        let report = renderer
            .render_frame(&input(&cache, draws.clone(), vec![sun()]))
            .unwrap();
        assert_eq!(report.draw_count(Stage::PostProcess), 1);
        let labels = renderer.device().pass_labels();
        let post: Vec<&str> = labels.into_iter().skip_while(|l| *l != "tonemap").collect();
        assert_eq!(post, vec!["tonemap", "present"]);

        let mut renderer = renderer_with_defaults();
        renderer.device_mut().fail_shaders_defining(Some("LIGHT_AMBIENT"));
        let report = renderer
            .render_frame(&input(&cache, draws, vec![sun()]))
            .unwrap();
        assert_eq!(report.draw_count(Stage::Lighting), 1);
        assert_eq!(report.lights_drawn, 1);
        assert_eq!(renderer.device().recreate_count(), 0);
    }

    #[test]
    fn unusable_blit_fails_frame_without_recreating() {
        let cache = ResourceCache::with_builtins();
        let mut renderer = renderer(settings());
        renderer.device_mut().fail_shaders_defining(Some("PASS_BLIT"));
        for _ in 0..2 {
            let err = renderer.render_frame(&input(&cache, vec![], vec![])).unwrap_err();
            assert!(matches!(
                err,
                FrameError::Device {
                    stage: Stage::Present,
                    source: DeviceError::Compile { .. },
                    ..
                }
            ));
        }
        assert_eq!(renderer.device().recreate_count(), 0);
        assert_eq!(renderer.shader_stats().failures, 1);
    }

    #[test]
    fn toggling_depth_prepass_reuses_compiled_shaders() {
        let cache = ResourceCache::with_builtins();
        let mut renderer = renderer(settings());
        let draws = vec![cube_at(Vec3::ZERO, Material::DEFAULT_NAME)];
        renderer
            .render_frame(&input(&cache, draws.clone(), vec![sun()]))
            .unwrap();
        let compiles = renderer.device().compile_count();
        let pipelines = renderer.shader_stats().pipelines;

        for depth_prepass in [false, true] {
            renderer.set_settings(RendererSettings {
                depth_prepass,
                ..settings()
            });
            renderer
                .render_frame(&input(&cache, draws.clone(), vec![sun()]))
                .unwrap();
            assert_eq!(renderer.device().compile_count(), compiles);
        }
        assert_eq!(renderer.shader_stats().pipelines, pipelines + 1);
    }

    #[test]
    fn transparents_are_drawn_back_to_front() {
        let cache = ResourceCache::with_builtins();
        cache.insert_material(
            "glass",
            Material::named("glass").with_blend(BlendMode::Transparent),
        );
        let near = cube_at(Vec3::new(0.0, 0.0, 1.0), "glass");
        let far = cube_at(Vec3::new(0.0, 0.0, -2.0), "glass");
        let mid_a = cube_at(Vec3::new(-1.0, 0.0, 0.0), "glass");
        let mid_b = cube_at(Vec3::new(1.0, 0.0, 0.0), "glass");
        let opaque = cube_at(Vec3::ZERO, Material::DEFAULT_NAME);
        let mut renderer = renderer(settings());

        let report = renderer
            .render_frame(&input(&cache, vec![near, mid_a, opaque, far, mid_b], vec![sun()]))
            .unwrap();
        assert_eq!(report.draw_count(Stage::Transparency), 4);
        assert_eq!(report.draw_count(Stage::GBuffer), 1);
        let d = &report.transparent_distances;
        assert!(d.windows(2).all(|w| w[0] >= w[1]), "not back to front: {d:?}");
        assert!((d[0] - 7.0).abs() < 1e-4);
        assert!((d[3] - 4.0).abs() < 1e-4);
    }

    /// Albedo textures bound in the transparency pass, in draw order.
    fn transparent_albedo_binds(device: &RecordingDevice) -> Vec<TextureId> {
        device
            .log()
            .iter()
            .skip_while(|c| !matches!(c, Command::BeginPass { label } if label == "transparency"))
            .take_while(|c| !matches!(c, Command::EndPass))
            .filter_map(|c| match c {
                Command::BindTexture { slot: 0, texture } => Some(*texture),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn equal_depth_transparents_order_by_entity() {
        let cache = ResourceCache::with_builtins();
        for name in ["a", "b"] {
            let file = format!("{name}.png");
            let data = TextureData::solid(file.as_str(), Color::WHITE, true);
            let tex = cache.insert_texture(&file, data);
            cache.insert_material(
                name,
                Material::named(name)
                    .with_blend(BlendMode::Transparent)
                    .with_texture(TextureSlot::Albedo, tex),
            );
        }
        let a = cube_at(Vec3::new(-1.0, 0.0, 0.0), "a");
        let b = cube_at(Vec3::new(1.0, 0.0, 0.0), "b");
        let mut renderer = renderer(settings());

        renderer.render_frame(&input(&cache, vec![a], vec![])).unwrap();
        let a_texture = transparent_albedo_binds(renderer.device())[0];

        renderer.device_mut().clear_log();
        let report = renderer.render_frame(&input(&cache, vec![a, b], vec![])).unwrap();
        assert_eq!(report.transparent_distances[0], report.transparent_distances[1]);
        let forward = transparent_albedo_binds(renderer.device());

        renderer.device_mut().clear_log();
        renderer.render_frame(&input(&cache, vec![b, a], vec![])).unwrap();
        let reversed = transparent_albedo_binds(renderer.device());

        assert_eq!(forward.len(), 2);
        assert_eq!(forward, reversed);
        assert_eq!(forward[0] == a_texture, a.entity < b.entity);
    }

    #[test]
    fn off_screen_lights_are_culled() {
        let cache = ResourceCache::with_builtins();
        let mut renderer = renderer(settings());
        let lights = vec![
            sun(),
            point_light(Vec3::new(0.0, 0.0, 0.5), 1.0),
            point_light(Vec3::new(0.0, 0.0, 40.0), 2.0),
        ];
        let report = renderer
            .render_frame(&input(&cache, vec![cube_at(Vec3::ZERO, Material::DEFAULT_NAME)], lights))
            .unwrap();
        assert_eq!(report.lights_drawn, 2);
        assert_eq!(report.lights_culled, 1);

        let scissors: Vec<Rect> = renderer
            .device()
            .log()
            .iter()
            .filter_map(|c| match c {
                Command::SetScissor(r) => Some(*r),
                _ => None,
            })
            .collect();
        assert!(scissors.iter().any(|r| r.width < 320));
    }

    #[test]
    fn no_camera_renders_nothing() {
        let cache = ResourceCache::with_builtins();
        let mut renderer = renderer(settings());
        let draws = vec![cube_at(Vec3::ZERO, Material::DEFAULT_NAME)];
        let mut frame = input(&cache, draws, vec![sun()]);
        frame.view = None;
        let report = renderer.render_frame(&frame).unwrap();
        assert_eq!(report.outcome, FrameOutcome::NoCamera);
        assert_eq!(report.stages, vec![Stage::Resolve]);
        assert_eq!(report.total_draws(), 0);
        assert_eq!(renderer.device().pass_labels(), vec!["clear_output"]);
    }

    #[test]
    fn device_loss_aborts_frame_and_next_frame_recovers() {
        let cache = ResourceCache::with_builtins();
        let mut renderer = renderer(settings());
        let draws = vec![cube_at(Vec3::ZERO, Material::DEFAULT_NAME)];
        renderer.render_frame(&input(&cache, draws.clone(), vec![sun()])).unwrap();

        renderer.device_mut().lose_device_on_pass(Some("lighting"));
        let err = renderer
            .render_frame(&input(&cache, draws.clone(), vec![sun()]))
            .unwrap_err();
        match &err {
            FrameError::Device {
                stage,
                completed,
                source,
            } => {
                assert_eq!(*stage, Stage::Lighting);
                assert_eq!(completed, &vec![Stage::Resolve, Stage::DepthPrepass, Stage::GBuffer]);
                assert_eq!(*source, DeviceError::Lost);
            }
            other => panic!("unexpected error {other:?}"),
        }

        renderer.device_mut().lose_device_on_pass(None);
        let report = renderer.render_frame(&input(&cache, draws, vec![sun()])).unwrap();
        assert_eq!(report.stages, Stage::ALL.to_vec());
        assert_eq!(renderer.device().recreate_count(), 1);
        assert_eq!(renderer.gpu_resources().mesh_count(), 1);
        let output = renderer.output_texture().unwrap();
        assert!(renderer.device().texture_desc(output).is_some());
    }

    #[test]
    fn failed_recreation_is_reported() {
        let cache = ResourceCache::with_builtins();
        let mut renderer = renderer(settings());
        renderer.device_mut().lose_device();
        renderer.device_mut().set_texture_budget(Some(0));
        let err = renderer
            .render_frame(&input(&cache, vec![], vec![]))
            .unwrap_err();
        assert!(matches!(err, FrameError::Recreate(DeviceError::OutOfMemory(_))));

        renderer.device_mut().set_texture_budget(None);
        assert!(renderer.render_frame(&input(&cache, vec![], vec![])).is_ok());
    }

    #[test]
    fn failed_resize_keeps_previous_targets() {
        let mut renderer = renderer(settings());
        let output = renderer.output_texture().unwrap();
        let live = renderer.device().live_textures();

        // Post targets fit, the GBuffer set does not.
        renderer.device_mut().set_texture_budget(Some(5));
        assert!(renderer.resize(640, 480).is_err());
        assert_eq!(renderer.size(), (320, 240));
        assert_eq!(renderer.output_texture(), Some(output));
        assert_eq!(renderer.device().live_textures(), live);

        renderer.device_mut().set_texture_budget(None);
        renderer.resize(640, 480).unwrap();
        assert_eq!(renderer.size(), (640, 480));
        let output = renderer.output_texture().unwrap();
        assert_eq!(renderer.device().texture_desc(output).unwrap().width, 640);
        assert_eq!(renderer.device().live_textures(), live);
    }

    #[test]
    fn failed_post_target_resize_keeps_previous_targets() {
        let cache = ResourceCache::with_builtins();
        let mut renderer = renderer(settings());
        let output = renderer.output_texture().unwrap();
        let live = renderer.device().live_textures();

        renderer.device_mut().set_texture_budget(Some(2));
        let err = renderer.resize(640, 480).unwrap_err();
        assert!(matches!(err, DeviceError::OutOfMemory(_)));
        assert_eq!(renderer.size(), (320, 240));
        assert_eq!(renderer.output_texture(), Some(output));
        assert_eq!(renderer.device().live_textures(), live);

        // Out of memory is fatal, so the next frame starts from a new device.
        renderer.device_mut().set_texture_budget(None);
        renderer.render_frame(&input(&cache, vec![], vec![])).unwrap();
        assert_eq!(renderer.device().recreate_count(), 1);
    }

    #[test]
    fn released_renderer_frees_gpu_objects_and_rebuilds() {
        let cache = ResourceCache::with_builtins();
        let mut renderer = renderer(settings());
        let draws = vec![cube_at(Vec3::ZERO, Material::DEFAULT_NAME)];
        renderer
            .render_frame(&input(&cache, draws.clone(), vec![sun()]))
            .unwrap();
        assert!(renderer.device().live_buffers() > 0);

        renderer.release_gpu_resources();
        assert_eq!(renderer.device().live_textures(), 0);
        assert_eq!(renderer.device().live_buffers(), 0);
        assert_eq!(renderer.device().live_pipelines(), 0);
        assert_eq!(renderer.output_texture(), None);

        let report = renderer.render_frame(&input(&cache, draws, vec![sun()])).unwrap();
        assert_eq!(report.stages, Stage::ALL.to_vec());
        assert_eq!(renderer.device().recreate_count(), 0);
        assert!(renderer.output_texture().is_some());
    }

    #[test]
    fn swapchain_target_presents_output() {
        let cache = ResourceCache::with_builtins();
        let mut renderer = Renderer::new(RecordingDevice::with_swapchain(), settings()).unwrap();
        let mut frame = input(&cache, vec![cube_at(Vec3::ZERO, Material::DEFAULT_NAME)], vec![]);
        frame.target = PresentTarget::Swapchain;
        renderer.render_frame(&frame).unwrap();
        let output = renderer.output_texture().unwrap();
        assert_eq!(renderer.device().log().last(), Some(&Command::Present(output)));

        // Headless devices reject presentation; offscreen frames never ask.
        let mut headless = renderer_with_defaults();
        assert!(
            headless
                .render_frame(&input(&cache, vec![], vec![]))
                .is_ok()
        );
        assert!(!headless.device().log().iter().any(|c| matches!(c, Command::Present(_))));
    }

    fn renderer_with_defaults() -> Renderer<RecordingDevice> {
        renderer(settings())
    }

    #[test]
    fn evicted_mesh_is_released_next_frame() {
        let cache = ResourceCache::with_builtins();
        let mut renderer = renderer(settings());
        let quad = DrawItem {
            mesh: mesh_handle(primitives::QUAD),
            ..cube_at(Vec3::ZERO, Material::DEFAULT_NAME)
        };
        renderer.render_frame(&input(&cache, vec![quad], vec![])).unwrap();
        assert_eq!(renderer.gpu_resources().mesh_count(), 1);

        cache.evict_mesh(mesh_handle(primitives::QUAD));
        let report = renderer.render_frame(&input(&cache, vec![quad], vec![])).unwrap();
        assert_eq!(report.skipped, vec![(quad.entity, SkipReason::MeshMissing)]);
        assert_eq!(renderer.gpu_resources().mesh_count(), 0);
    }

    #[test]
    fn post_chain_follows_settings() {
        let cache = ResourceCache::with_builtins();
        let mut renderer = renderer(RendererSettings {
            fxaa: true,
            sharpen_strength: 0.5,
            tone_mapper: ToneMapper::Reinhard,
            ..settings()
        });
        let report = renderer.render_frame(&input(&cache, vec![], vec![])).unwrap();
        assert_eq!(report.draw_count(Stage::PostProcess), 3);
        let labels = renderer.device().pass_labels();
        let post: Vec<&str> = labels
            .into_iter()
            .skip_while(|l| *l != "tonemap")
            .collect();
        assert_eq!(post, vec!["tonemap", "fxaa", "sharpen", "present"]);
    }
}
