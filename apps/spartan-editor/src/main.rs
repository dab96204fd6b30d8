use anyhow::Result;
use clap::Parser;
use egui::Context as EguiContext;
use glam::Vec3;
use spartan_common::{EntityId, Transform};
use spartan_ecs::{ComponentStore, Renderable};
use spartan_persist::{SceneFile, sample};
use spartan_render::device::TextureId;
use spartan_render::{
    FrameReport, PresentTarget, Renderer, RendererSettings, Stage, ToneMapper, extract_frame,
};
use spartan_render_wgpu::{FlyCamera, WgpuDevice};
use spartan_resources::{
    ImportPool, Lookup, Material, ResourceCache, material_handle, mesh_handle, primitives,
};
use spartan_scene::Scene;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{DeviceEvent, ElementState, KeyEvent, MouseButton, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Window, WindowId};

#[derive(Parser)]
#[command(name = "spartan-editor", about = "Spartan scene editor")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Scene dump to open; the sample scene when omitted
    #[arg(long)]
    scene: Option<PathBuf>,

    /// Where F5 saves and F9 loads
    #[arg(long, default_value = "scene.json")]
    save_path: PathBuf,

    /// Renderer settings (YAML)
    #[arg(long)]
    settings: Option<PathBuf>,
}

/// Editor state independent of the GPU.
struct AppState {
    scene: Scene,
    components: ComponentStore,
    cache: Arc<ResourceCache>,
    pool: ImportPool,
    camera: FlyCamera,
    /// Render through the scene's active camera instead of the fly camera.
    use_scene_camera: bool,
    settings: RendererSettings,
    selected: Option<EntityId>,
    show_inspector: bool,
    save_path: PathBuf,
    last_report: Option<FrameReport>,
    last_error: Option<String>,
    reload_shaders: bool,
    // Input state
    keys_held: HashSet<KeyCode>,
    mouse_captured: bool,
    last_frame: Instant,
}

impl AppState {
    fn new(cli: &Cli) -> Self {
        let cache = Arc::new(ResourceCache::with_builtins());
        let pool = ImportPool::new(Arc::clone(&cache), 4);
        let settings = match &cli.settings {
            Some(path) => RendererSettings::load(path).unwrap_or_else(|e| {
                tracing::error!(path = %path.display(), error = %e, "bad settings, using defaults");
                RendererSettings::default()
            }),
            None => RendererSettings::default(),
        };
        sample::register_materials(&cache);
        let (scene, components) = sample::build(&cache);
        let mut state = Self {
            scene,
            components,
            cache,
            pool,
            camera: FlyCamera::default(),
            use_scene_camera: false,
            settings,
            selected: None,
            show_inspector: true,
            save_path: cli.save_path.clone(),
            last_report: None,
            last_error: None,
            reload_shaders: false,
            keys_held: HashSet::new(),
            mouse_captured: false,
            last_frame: Instant::now(),
        };
        if let Some(path) = &cli.scene {
            state.load_scene(path);
        }
        state
    }

    fn update(&mut self, dt: f32) {
        let speed_mult = if self.keys_held.contains(&KeyCode::ShiftLeft) {
            3.0
        } else {
            1.0
        };
        let mut axis = Vec3::ZERO;
        for (key, dir) in [
            (KeyCode::KeyW, Vec3::Z),
            (KeyCode::KeyS, Vec3::NEG_Z),
            (KeyCode::KeyD, Vec3::X),
            (KeyCode::KeyA, Vec3::NEG_X),
            (KeyCode::Space, Vec3::Y),
            (KeyCode::ControlLeft, Vec3::NEG_Y),
        ] {
            if self.keys_held.contains(&key) {
                axis += dir;
            }
        }
        if axis != Vec3::ZERO {
            self.camera.translate(axis, dt * speed_mult);
        }
    }

    fn handle_key(&mut self, key: KeyCode, pressed: bool) {
        if pressed {
            self.keys_held.insert(key);
        } else {
            self.keys_held.remove(&key);
        }

        if !pressed {
            return;
        }

        match key {
            KeyCode::KeyN => self.spawn_cube(),
            KeyCode::Delete | KeyCode::Backspace => self.delete_selected(),
            KeyCode::KeyR if self.keys_held.contains(&KeyCode::ControlLeft) => {
                self.reload_shaders = true;
            }
            KeyCode::F2 => {
                self.use_scene_camera = !self.use_scene_camera;
            }
            KeyCode::F5 => {
                let path = self.save_path.clone();
                self.save_scene(&path);
            }
            KeyCode::F9 => {
                let path = self.save_path.clone();
                self.load_scene(&path);
            }
            KeyCode::F1 => {
                self.show_inspector = !self.show_inspector;
            }
            KeyCode::Escape => {
                self.selected = None;
            }
            _ => {}
        }
    }

    fn spawn_cube(&mut self) {
        let position = self.camera.position + self.camera.forward() * 5.0;
        let id = self.scene.spawn(Transform::from_position(position));
        self.components.set_name(id, format!("Cube {}", id.short()));
        self.components.set_renderable(
            id,
            Renderable::new(
                mesh_handle(primitives::CUBE),
                material_handle(Material::DEFAULT_NAME),
            ),
        );
        self.selected = Some(id);
        tracing::info!(entity = %id.short(), "spawned cube");
    }

    fn delete_selected(&mut self) {
        let Some(id) = self.selected.take() else {
            return;
        };
        for removed in self.scene.despawn(id) {
            self.components.remove_entity(removed);
        }
        tracing::info!(entity = %id.short(), "deleted entity");
    }

    fn save_scene(&mut self, path: &Path) {
        let file = SceneFile::capture(&self.scene, &self.components, &self.cache);
        match spartan_persist::save(path, &file) {
            Ok(()) => tracing::info!(path = %path.display(), "scene saved"),
            Err(e) => tracing::error!(path = %path.display(), error = %e, "failed to save scene"),
        }
    }

    /// Replace the scene with a dump. Resources it names that the cache does
    /// not know are queued on the import pool; they render once loaded.
    fn load_scene(&mut self, path: &Path) {
        let file = match spartan_persist::load(path) {
            Ok(file) => file,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to load scene");
                return;
            }
        };
        for name in file.mesh_names() {
            if matches!(self.cache.mesh(mesh_handle(name)), Lookup::Missing) {
                self.pool.load_mesh(name);
            }
        }
        for name in file.material_names() {
            if matches!(self.cache.material(material_handle(name)), Lookup::Missing) {
                self.pool.load_material(name);
            }
        }
        match file.restore() {
            Ok((scene, components)) => {
                self.scene = scene;
                self.components = components;
                self.selected = None;
                tracing::info!(path = %path.display(), "scene loaded");
            }
            Err(e) => tracing::error!(
                path = %path.display(),
                error = %e,
                "failed to restore scene"
            ),
        }
    }

    /// Returns the size the viewport panel wants, in physical pixels.
    fn draw_ui(&mut self, ctx: &EguiContext, viewport: Option<egui::TextureId>) -> [u32; 2] {
        if self.show_inspector {
            egui::SidePanel::left("inspector")
                .default_width(300.0)
                .show(ctx, |ui| {
                    egui::ScrollArea::vertical().show(ui, |ui| self.inspector_ui(ui));
                });
        }

        let mut wanted = [0, 0];
        egui::CentralPanel::default().show(ctx, |ui| {
            let size = ui.available_size();
            let ppp = ctx.pixels_per_point();
            wanted = [(size.x * ppp) as u32, (size.y * ppp) as u32];
            match viewport {
                Some(id) => {
                    ui.add(egui::Image::new(egui::load::SizedTexture::new(id, size)));
                }
                None => {
                    ui.centered_and_justified(|ui| ui.label("renderer unavailable"));
                }
            }
        });
        wanted
    }

    fn inspector_ui(&mut self, ui: &mut egui::Ui) {
        ui.heading("Spartan");
        ui.separator();
        ui.label(format!("Entities: {}", self.scene.entity_count()));
        ui.label(format!("Imports pending: {}", self.pool.pending()));
        ui.checkbox(&mut self.use_scene_camera, "Scene camera (F2)");
        ui.label(format!(
            "Camera: ({:.1}, {:.1}, {:.1})",
            self.camera.position.x, self.camera.position.y, self.camera.position.z
        ));

        ui.separator();
        ui.heading("Frame");
        match &self.last_report {
            Some(report) => {
                ui.label(format!("Frame {} ({:?})", report.frame_index, report.outcome));
                for stage in Stage::ALL {
                    if report.stages.contains(&stage) {
                        ui.label(format!(
                            "{:<14} {:>5} draws",
                            stage.name(),
                            report.draw_count(stage)
                        ));
                    }
                }
                ui.label(format!(
                    "Lights: {} drawn, {} culled",
                    report.lights_drawn, report.lights_culled
                ));
                ui.label(format!("Skipped: {}", report.skipped.len()));
                ui.label(format!(
                    "Shaders: {} variations, {} failures",
                    report.shaders.variations, report.shaders.failures
                ));
            }
            None => {
                ui.label("no frame yet");
            }
        }
        if let Some(error) = &self.last_error {
            ui.colored_label(egui::Color32::LIGHT_RED, error);
        }
        if ui.button("Reload shaders (Ctrl+R)").clicked() {
            self.reload_shaders = true;
        }

        ui.separator();
        ui.heading("Settings");
        let s = &mut self.settings;
        ui.checkbox(&mut s.depth_prepass, "Depth pre-pass");
        ui.checkbox(&mut s.fxaa, "FXAA");
        ui.add(egui::Slider::new(&mut s.sharpen_strength, 0.0..=1.0).text("Sharpen"));
        egui::ComboBox::from_label("Tone mapper")
            .selected_text(format!("{:?}", s.tone_mapper))
            .show_ui(ui, |ui| {
                ui.selectable_value(&mut s.tone_mapper, ToneMapper::Aces, "Aces");
                ui.selectable_value(&mut s.tone_mapper, ToneMapper::Reinhard, "Reinhard");
                ui.selectable_value(&mut s.tone_mapper, ToneMapper::None, "None");
            });
        ui.add(egui::Slider::new(&mut s.exposure, 0.05..=8.0).text("Exposure"));
        ui.add(egui::Slider::new(&mut s.gamma, 1.0..=3.0).text("Gamma"));
        ui.add(egui::Slider::new(&mut s.ambient_intensity, 0.0..=1.0).text("Ambient"));
        ui.checkbox(&mut s.light_volume_scissor, "Light volume scissor");
        ui.checkbox(&mut s.frustum_culling, "Frustum culling");

        ui.separator();
        ui.heading("Scene");
        ui.horizontal(|ui| {
            if ui.button("Spawn cube (N)").clicked() {
                self.spawn_cube();
            }
            if ui.button("Delete (Del)").clicked() {
                self.delete_selected();
            }
        });
        ui.horizontal(|ui| {
            if ui.button("Save (F5)").clicked() {
                let path = self.save_path.clone();
                self.save_scene(&path);
            }
            if ui.button("Load (F9)").clicked() {
                let path = self.save_path.clone();
                self.load_scene(&path);
            }
        });

        ui.separator();
        let ids: Vec<EntityId> = self.scene.entities().keys().copied().collect();
        for id in &ids {
            let name = self
                .components
                .get_name(*id)
                .map(|n| n.0.clone())
                .unwrap_or_else(|| id.short());
            let is_selected = self.selected == Some(*id);
            if ui.selectable_label(is_selected, name).clicked() {
                self.selected = Some(*id);
            }
        }

        if let Some(id) = self.selected {
            ui.separator();
            ui.heading("Inspector");
            // Copied so the scene is not borrowed while editing.
            let current = self.scene.get(id).map(|d| d.transform);
            if let Some(transform) = current {
                let mut pos = transform.position.to_array();
                let mut scale = transform.scale.to_array();
                ui.label("Position:");
                let moved = vec3_editor(ui, &mut pos);
                ui.label("Scale:");
                let scaled = vec3_editor(ui, &mut scale);
                if moved || scaled {
                    let new = Transform {
                        position: Vec3::from_array(pos),
                        scale: Vec3::from_array(scale),
                        ..transform
                    };
                    if let Err(e) = self.scene.set_transform(id, new) {
                        tracing::error!(error = %e, "failed to set transform");
                    }
                }
            }
            if let Some(renderable) = self.components.get_renderable(id).copied() {
                let mut visible = renderable.visible;
                if ui.checkbox(&mut visible, "Visible").changed() {
                    self.components
                        .set_renderable(id, Renderable { visible, ..renderable });
                }
            }
            if let Some(light) = self.components.get_light(id) {
                ui.label(format!("Light: {:?}, intensity {:.1}", light.kind, light.intensity));
            }
        }

        ui.separator();
        ui.small("F1: Inspector | RMB: Look | WASD: Move | F2: Camera");
    }
}

fn vec3_editor(ui: &mut egui::Ui, v: &mut [f32; 3]) -> bool {
    let mut changed = false;
    ui.horizontal(|ui| {
        for (value, prefix) in v.iter_mut().zip(["X: ", "Y: ", "Z: "]) {
            changed |= ui
                .add(egui::DragValue::new(value).prefix(prefix).speed(0.1))
                .changed();
        }
    });
    changed
}

/// The renderer output registered as an egui texture.
struct ViewportTexture {
    egui: egui::TextureId,
    texture: TextureId,
    generation: u64,
}

/// egui state tied to one wgpu device; rebuilt when the device is recreated.
struct Ui {
    ctx: EguiContext,
    winit: egui_winit::State,
    renderer: egui_wgpu::Renderer,
    generation: u64,
    viewport: Option<ViewportTexture>,
}

impl Ui {
    fn new(window: &Window, device: &WgpuDevice) -> Option<Self> {
        let format = device.surface_format()?;
        let ctx = EguiContext::default();
        let winit = egui_winit::State::new(
            ctx.clone(),
            egui::ViewportId::ROOT,
            window,
            Some(window.scale_factor() as f32),
            None,
            None,
        );
        let renderer = egui_wgpu::Renderer::new(device.raw_device(), format, None, 1, false);
        Some(Self {
            ctx,
            winit,
            renderer,
            generation: device.generation(),
            viewport: None,
        })
    }

    /// Point the viewport texture at the renderer's current output.
    fn sync_viewport(&mut self, renderer: &Renderer<WgpuDevice>) {
        let device = renderer.device();
        let Some(output) = renderer.output_texture() else {
            return;
        };
        let Some(view) = device.texture_view(output) else {
            return;
        };
        match &mut self.viewport {
            Some(v) if v.texture == output && v.generation == device.generation() => {}
            Some(v) if v.generation == device.generation() => {
                self.renderer.update_egui_texture_from_wgpu_texture(
                    device.raw_device(),
                    view,
                    wgpu::FilterMode::Linear,
                    v.egui,
                );
                v.texture = output;
            }
            _ => {
                let egui = self.renderer.register_native_texture(
                    device.raw_device(),
                    view,
                    wgpu::FilterMode::Linear,
                );
                self.viewport = Some(ViewportTexture {
                    egui,
                    texture: output,
                    generation: device.generation(),
                });
            }
        }
    }
}

struct EditorApp {
    state: AppState,
    window: Option<Arc<Window>>,
    renderer: Option<Renderer<WgpuDevice>>,
    ui: Option<Ui>,
    viewport_size: [u32; 2],
}

impl EditorApp {
    fn new(state: AppState) -> Self {
        Self {
            state,
            window: None,
            renderer: None,
            ui: None,
            viewport_size: [0, 0],
        }
    }

    fn redraw(&mut self) {
        let now = Instant::now();
        let dt = (now - self.state.last_frame).as_secs_f32().min(0.1);
        self.state.last_frame = now;
        self.state.update(dt);

        let (Some(window), Some(renderer)) = (&self.window, &mut self.renderer) else {
            return;
        };

        if renderer.settings() != &self.state.settings {
            renderer.set_settings(self.state.settings.clone());
        }
        if std::mem::take(&mut self.state.reload_shaders) {
            let dropped = renderer.reload_shaders();
            tracing::info!(dropped, "shader variations dropped");
        }
        let [want_w, want_h] = self.viewport_size;
        if want_w > 0 && want_h > 0 && renderer.size() != (want_w, want_h) {
            if let Err(e) = renderer.resize(want_w, want_h) {
                tracing::warn!(error = %e, "viewport resize failed");
            }
        }

        let (width, height) = renderer.size();
        let viewport = spartan_common::Rect::from_size(width, height);
        let mut input = extract_frame(
            &self.state.scene,
            &self.state.components,
            &self.state.cache,
            viewport,
            PresentTarget::Offscreen,
        );
        if !self.state.use_scene_camera {
            input.view = Some(self.state.camera.view_input(viewport));
        }
        match renderer.render_frame(&input) {
            Ok(report) => {
                self.state.last_report = Some(report);
                self.state.last_error = None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "frame failed");
                self.state.last_error = Some(e.to_string());
            }
        }

        let generation = renderer.device().generation();
        if self.ui.as_ref().is_some_and(|ui| ui.generation != generation) {
            tracing::info!(generation, "device recreated, rebuilding UI renderer");
            self.ui = Ui::new(window, renderer.device());
        }
        let Some(ui) = self.ui.as_mut() else {
            return;
        };
        ui.sync_viewport(renderer);

        let raw_input = ui.winit.take_egui_input(window);
        let texture = ui.viewport.as_ref().map(|v| v.egui);
        let state = &mut self.state;
        let mut wanted = self.viewport_size;
        let full_output = ui.ctx.run(raw_input, |ctx| {
            wanted = state.draw_ui(ctx, texture);
        });
        self.viewport_size = wanted;
        ui.winit.handle_platform_output(window, full_output.platform_output);

        let device = renderer.device_mut();
        let frame = match device.acquire_surface_texture() {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(error = %e, "failed to acquire swapchain image");
                return;
            }
        };
        let Some((surface_w, surface_h)) = device.surface_size() else {
            return;
        };
        let target = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let paint_jobs = ui
            .ctx
            .tessellate(full_output.shapes, full_output.pixels_per_point);
        let screen_descriptor = egui_wgpu::ScreenDescriptor {
            size_in_pixels: [surface_w, surface_h],
            pixels_per_point: full_output.pixels_per_point,
        };
        let (raw_device, queue) = (device.raw_device(), device.raw_queue());
        for (id, image_delta) in &full_output.textures_delta.set {
            ui.renderer
                .update_texture(raw_device, queue, *id, image_delta);
        }
        let mut encoder = raw_device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("egui_encoder"),
        });
        let commands = ui.renderer.update_buffers(
            raw_device,
            queue,
            &mut encoder,
            &paint_jobs,
            &screen_descriptor,
        );
        {
            let mut pass = encoder
                .begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("egui_pass"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: &target,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: None,
                    ..Default::default()
                })
                .forget_lifetime();
            ui.renderer.render(&mut pass, &paint_jobs, &screen_descriptor);
        }
        queue.submit(commands.into_iter().chain(std::iter::once(encoder.finish())));
        for id in &full_output.textures_delta.free {
            ui.renderer.free_texture(id);
        }
        frame.present();
    }
}

impl ApplicationHandler for EditorApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let attrs = Window::default_attributes()
            .with_title("Spartan Editor")
            .with_inner_size(PhysicalSize::new(1600u32, 900));
        let window = match event_loop.create_window(attrs) {
            Ok(window) => Arc::new(window),
            Err(e) => {
                tracing::error!(error = %e, "failed to create window");
                event_loop.exit();
                return;
            }
        };

        let size = window.inner_size();
        let device = match WgpuDevice::with_surface(
            Arc::clone(&window),
            size.width,
            size.height,
            self.state.settings.vsync,
        ) {
            Ok(device) => device,
            Err(e) => {
                tracing::error!(error = %e, "failed to create GPU device");
                event_loop.exit();
                return;
            }
        };
        let adapter = device.adapter_info();
        tracing::info!(
            adapter = %adapter.name,
            backend = adapter.backend.to_str(),
            "GPU initialized"
        );

        self.ui = Ui::new(&window, &device);
        match Renderer::new(device, self.state.settings.clone()) {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(e) => {
                tracing::error!(error = %e, "failed to create renderer");
                event_loop.exit();
                return;
            }
        }
        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        if let (Some(ui), Some(window)) = (&mut self.ui, &self.window) {
            let response = ui.winit.on_window_event(window, &event);
            if response.consumed {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                event_loop.exit();
            }
            WindowEvent::Resized(new_size) => {
                if let Some(renderer) = &mut self.renderer {
                    renderer
                        .device_mut()
                        .resize_surface(new_size.width, new_size.height);
                }
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(key),
                        state: key_state,
                        ..
                    },
                ..
            } => {
                self.state
                    .handle_key(key, key_state == ElementState::Pressed);
            }
            WindowEvent::MouseInput {
                button: MouseButton::Right,
                state: btn_state,
                ..
            } => {
                self.state.mouse_captured = btn_state == ElementState::Pressed;
                if let Some(window) = &self.window {
                    window.set_cursor_visible(!self.state.mouse_captured);
                }
            }
            WindowEvent::RedrawRequested => {
                self.redraw();
                if let Some(window) = &self.window {
                    window.request_redraw();
                }
            }
            _ => {}
        }
    }

    fn device_event(
        &mut self,
        _event_loop: &ActiveEventLoop,
        _device_id: winit::event::DeviceId,
        event: DeviceEvent,
    ) {
        if let DeviceEvent::MouseMotion { delta } = event {
            if self.state.mouse_captured {
                self.state.camera.rotate(delta.0 as f32, delta.1 as f32);
            }
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("spartan-editor starting");

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = EditorApp::new(AppState::new(&cli));
    event_loop.run_app(&mut app)?;

    Ok(())
}
