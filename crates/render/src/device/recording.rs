use super::*;
use std::collections::HashMap;

/// One recorded device command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BeginPass { label: String },
    SetPipeline { pipeline: PipelineId, label: String },
    SetViewport(Rect),
    SetScissor(Rect),
    BindConstantBuffer { slot: u32, slice: ConstantSlice },
    BindTexture { slot: u32, texture: TextureId },
    BindSampler { slot: u32, sampler: SamplerId },
    SetVertexBuffer(BufferId),
    SetIndexBuffer(BufferId),
    Draw { vertex_count: u32 },
    DrawIndexed { index_count: u32 },
    EndPass,
    Submit,
    Present(TextureId),
}

#[derive(Debug, Default)]
struct Faults {
    /// Texture creations still allowed before every further one fails.
    texture_budget: Option<usize>,
    /// Shader compiles fail when their macro set defines this name.
    failing_define: Option<String>,
    /// Beginning a pass with this label loses the device.
    lose_on_pass: Option<String>,
}

#[derive(Debug, Default)]
struct PassState {
    open: bool,
    pipeline: Option<PipelineId>,
    vertex_buffer: Option<BufferId>,
    index_buffer: Option<BufferId>,
    /// First invalid binding since the last draw.
    error: Option<DeviceError>,
}

/// Headless device that validates handles and records every command.
///
/// Used by tests and the CLI. Faults can be injected to exercise the
/// renderer's error paths: failing texture creation, failing shader
/// compiles and device loss.
#[derive(Debug)]
pub struct RecordingDevice {
    next_id: u64,
    status: DeviceStatus,
    swapchain: bool,
    buffers: HashMap<u64, BufferDesc>,
    textures: HashMap<u64, TextureDesc>,
    samplers: HashMap<u64, SamplerDesc>,
    shaders: HashMap<u64, String>,
    pipelines: HashMap<u64, PipelineDesc>,
    pass: PassState,
    log: Vec<Command>,
    faults: Faults,
    compile_count: usize,
    recreate_count: usize,
}

impl Default for RecordingDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            status: DeviceStatus::Ok,
            swapchain: false,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            samplers: HashMap::new(),
            shaders: HashMap::new(),
            pipelines: HashMap::new(),
            pass: PassState::default(),
            log: Vec::new(),
            faults: Faults::default(),
            compile_count: 0,
            recreate_count: 0,
        }
    }

    /// A device that accepts `present` calls.
    pub fn with_swapchain() -> Self {
        Self {
            swapchain: true,
            ..Self::new()
        }
    }

    // --- fault injection ---

    /// Allow `n` more texture creations, then fail every one after that.
    /// `None` removes the limit.
    pub fn set_texture_budget(&mut self, n: Option<usize>) {
        self.faults.texture_budget = n;
    }

    /// Fail compiles whose macro set defines `name`.
    pub fn fail_shaders_defining(&mut self, name: Option<&str>) {
        self.faults.failing_define = name.map(str::to_string);
    }

    /// Lose the device when a pass labelled `label` begins.
    pub fn lose_device_on_pass(&mut self, label: Option<&str>) {
        self.faults.lose_on_pass = label.map(str::to_string);
    }

    /// Lose the device immediately.
    pub fn lose_device(&mut self) {
        tracing::warn!("recording device: simulated device loss");
        self.status = DeviceStatus::Lost;
    }

    // --- inspection ---

    pub fn log(&self) -> &[Command] {
        &self.log
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    /// Labels of the passes begun, in order.
    pub fn pass_labels(&self) -> Vec<&str> {
        self.log
            .iter()
            .filter_map(|c| match c {
                Command::BeginPass { label } => Some(label.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Number of draws recorded inside passes labelled `label`.
    pub fn draws_in_pass(&self, label: &str) -> usize {
        let mut current: Option<&str> = None;
        let mut draws = 0;
        for command in &self.log {
            match command {
                Command::BeginPass { label: begun } => current = Some(begun.as_str()),
                Command::EndPass => current = None,
                Command::Draw { .. } | Command::DrawIndexed { .. } if current == Some(label) => {
                    draws += 1
                }
                _ => {}
            }
        }
        draws
    }

    pub fn compile_count(&self) -> usize {
        self.compile_count
    }

    pub fn recreate_count(&self) -> usize {
        self.recreate_count
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_pipelines(&self) -> usize {
        self.pipelines.len()
    }

    pub fn texture_desc(&self, texture: TextureId) -> Option<&TextureDesc> {
        self.textures.get(&texture.0)
    }

    pub fn pipeline_desc(&self, pipeline: PipelineId) -> Option<&PipelineDesc> {
        self.pipelines.get(&pipeline.0)
    }

    fn alloc(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_alive(&self) -> Result<(), DeviceError> {
        match self.status {
            DeviceStatus::Ok => Ok(()),
            DeviceStatus::Lost => Err(DeviceError::Lost),
        }
    }

    fn note_invalid(&mut self, kind: &'static str, id: u64) {
        if self.pass.error.is_none() {
            self.pass.error = Some(DeviceError::InvalidHandle { kind, id });
        }
    }

    fn validate_draw(&mut self, indexed: bool) -> Result<(), DeviceError> {
        self.check_alive()?;
        if !self.pass.open {
            return Err(DeviceError::Validation("draw outside of a pass".into()));
        }
        if let Some(err) = self.pass.error.take() {
            return Err(err);
        }
        let pipeline = self
            .pass
            .pipeline
            .and_then(|p| self.pipelines.get(&p.0))
            .ok_or_else(|| DeviceError::Validation("draw without a pipeline".into()))?;
        if pipeline.vertex_layout == VertexLayout::Mesh && self.pass.vertex_buffer.is_none() {
            return Err(DeviceError::Validation(format!(
                "pipeline {} needs a vertex buffer",
                pipeline.label
            )));
        }
        if indexed && self.pass.index_buffer.is_none() {
            return Err(DeviceError::Validation("indexed draw without index buffer".into()));
        }
        Ok(())
    }
}

impl GraphicsDevice for RecordingDevice {
    fn backend(&self) -> BackendKind {
        BackendKind::Recording
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn status(&self) -> DeviceStatus {
        self.status
    }

    fn recreate(&mut self) -> Result<(), DeviceError> {
        self.buffers.clear();
        self.textures.clear();
        self.samplers.clear();
        self.shaders.clear();
        self.pipelines.clear();
        self.pass = PassState::default();
        self.status = DeviceStatus::Ok;
        self.recreate_count += 1;
        tracing::info!(count = self.recreate_count, "recording device recreated");
        Ok(())
    }

    fn create_buffer(
        &mut self,
        desc: &BufferDesc,
        data: Option<&[u8]>,
    ) -> Result<BufferId, DeviceError> {
        self.check_alive()?;
        if data.is_some_and(|d| d.len() as u64 > desc.size) {
            let len = data.map_or(0, <[u8]>::len);
            return Err(DeviceError::Validation(format!(
                "{len} bytes of initial data exceed buffer {} of {} bytes",
                desc.label,
                desc.size
            )));
        }
        let id = self.alloc();
        self.buffers.insert(id, desc.clone());
        Ok(BufferId(id))
    }

    fn write_buffer(
        &mut self,
        buffer: BufferId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        self.check_alive()?;
        let desc = self.buffers.get(&buffer.0).ok_or(DeviceError::InvalidHandle {
            kind: "buffer",
            id: buffer.0,
        })?;
        if offset + data.len() as u64 > desc.size {
            return Err(DeviceError::Validation(format!(
                "write of {} bytes at {offset} overruns buffer {} ({} bytes)",
                data.len(),
                desc.label,
                desc.size
            )));
        }
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer.0);
    }

    fn create_texture(
        &mut self,
        desc: &TextureDesc,
        data: Option<&[u8]>,
    ) -> Result<TextureId, DeviceError> {
        self.check_alive()?;
        if let Some(budget) = self.faults.texture_budget.as_mut() {
            if *budget == 0 {
                return Err(DeviceError::OutOfMemory(desc.label.clone()));
            }
            *budget -= 1;
        }
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
        let id = self.alloc();
        self.textures.insert(id, desc.clone());
        Ok(TextureId(id))
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture.0);
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerId, DeviceError> {
        self.check_alive()?;
        let id = self.alloc();
        self.samplers.insert(id, desc.clone());
        Ok(SamplerId(id))
    }

    fn compile_shader(&mut self, desc: &ShaderDesc<'_>) -> Result<ShaderId, DeviceError> {
        self.check_alive()?;
        self.compile_count += 1;
        if let Some(bad) = &self.faults.failing_define {
            if desc.defines.iter().any(|(name, _)| name == bad) {
                return Err(DeviceError::Compile {
                    name: desc.name.to_string(),
                    log: format!("injected failure for {bad}"),
                });
            }
        }
        crate::shader::preprocess(desc.source, desc.defines).map_err(|e| DeviceError::Compile {
            name: desc.name.to_string(),
            log: e.to_string(),
        })?;
        let id = self.alloc();
        self.shaders.insert(id, desc.name.to_string());
        Ok(ShaderId(id))
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<PipelineId, DeviceError> {
        self.check_alive()?;
        if !self.shaders.contains_key(&desc.shader.0) {
            return Err(DeviceError::InvalidHandle {
                kind: "shader",
                id: desc.shader.0,
            });
        }
        let id = self.alloc();
        self.pipelines.insert(id, desc.clone());
        Ok(PipelineId(id))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineId) {
        self.pipelines.remove(&pipeline.0);
    }

    fn begin_pass(&mut self, desc: &PassDesc) -> Result<(), DeviceError> {
        self.check_alive()?;
        if self.faults.lose_on_pass.as_deref() == Some(desc.label.as_str()) {
            self.lose_device();
            return Err(DeviceError::Lost);
        }
        if self.pass.open {
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
            let Some(t) = self.textures.get(&texture.0) else {
                return Err(DeviceError::InvalidHandle {
                    kind: "texture",
                    id: texture.0,
                });
            };
            if !t.usage.contains(TextureUsage::RENDER_TARGET) {
                return Err(DeviceError::Validation(format!(
                    "texture {} is not a render target",
                    t.label
                )));
            }
        }
        self.pass = PassState {
            open: true,
            ..PassState::default()
        };
        self.log.push(Command::BeginPass {
            label: desc.label.clone(),
        });
        Ok(())
    }

    fn set_pipeline(&mut self, pipeline: PipelineId) {
        let label = match self.pipelines.get(&pipeline.0) {
            Some(p) => p.label.clone(),
            None => {
                self.note_invalid("pipeline", pipeline.0);
                String::new()
            }
        };
        self.pass.pipeline = Some(pipeline);
        self.log.push(Command::SetPipeline { pipeline, label });
    }

    fn set_viewport(&mut self, rect: Rect) {
        self.log.push(Command::SetViewport(rect));
    }

    fn set_scissor(&mut self, rect: Rect) {
        self.log.push(Command::SetScissor(rect));
    }

    fn bind_constant_buffer(&mut self, slot: u32, slice: ConstantSlice) {
        if !self.buffers.contains_key(&slice.buffer.0) {
            self.note_invalid("buffer", slice.buffer.0);
        }
        self.log.push(Command::BindConstantBuffer { slot, slice });
    }

    fn bind_texture(&mut self, slot: u32, texture: TextureId) {
        if !self.textures.contains_key(&texture.0) {
            self.note_invalid("texture", texture.0);
        }
        self.log.push(Command::BindTexture { slot, texture });
    }

    fn bind_sampler(&mut self, slot: u32, sampler: SamplerId) {
        if !self.samplers.contains_key(&sampler.0) {
            self.note_invalid("sampler", sampler.0);
        }
        self.log.push(Command::BindSampler { slot, sampler });
    }

    fn set_vertex_buffer(&mut self, buffer: BufferId) {
        if !self.buffers.contains_key(&buffer.0) {
            self.note_invalid("buffer", buffer.0);
        }
        self.pass.vertex_buffer = Some(buffer);
        self.log.push(Command::SetVertexBuffer(buffer));
    }

    fn set_index_buffer(&mut self, buffer: BufferId) {
        if !self.buffers.contains_key(&buffer.0) {
            self.note_invalid("buffer", buffer.0);
        }
        self.pass.index_buffer = Some(buffer);
        self.log.push(Command::SetIndexBuffer(buffer));
    }

    fn draw(&mut self, vertex_count: u32) -> Result<(), DeviceError> {
        self.validate_draw(false)?;
        self.log.push(Command::Draw { vertex_count });
        Ok(())
    }

    fn draw_indexed(&mut self, index_count: u32) -> Result<(), DeviceError> {
        self.validate_draw(true)?;
        self.log.push(Command::DrawIndexed { index_count });
        Ok(())
    }

    fn end_pass(&mut self) -> Result<(), DeviceError> {
        self.check_alive()?;
        if !self.pass.open {
            return Err(DeviceError::Validation("end_pass without begin_pass".into()));
        }
        self.pass.open = false;
        self.log.push(Command::EndPass);
        Ok(())
    }

    fn submit(&mut self) -> Result<(), DeviceError> {
        self.check_alive()?;
        if self.pass.open {
            return Err(DeviceError::Validation("submit with an open pass".into()));
        }
        self.log.push(Command::Submit);
        Ok(())
    }

    fn present(&mut self, texture: TextureId) -> Result<(), DeviceError> {
        self.check_alive()?;
        if !self.swapchain {
            return Err(DeviceError::NoSwapchain);
        }
        if !self.textures.contains_key(&texture.0) {
            return Err(DeviceError::InvalidHandle {
                kind: "texture",
                id: texture.0,
            });
        }
        self.log.push(Command::Present(texture));
        Ok(())
    }
}
