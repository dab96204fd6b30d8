use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use spartan_common::Rect;
use spartan_ecs::ComponentStore;
use spartan_persist::{SceneFile, sample};
use spartan_render::device::{GraphicsDevice, RecordingDevice};
use spartan_render::{PresentTarget, Renderer, RendererSettings, extract_frame};
use spartan_render_wgpu::WgpuDevice;
use spartan_resources::{ImportPool, Lookup, ResourceCache, material_handle, mesh_handle};
use spartan_scene::Scene;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "spartan-cli", about = "Headless tools for the spartan renderer")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Record commands without a GPU and print the frame report
    Recording,
    /// Render on the GPU through wgpu
    Wgpu,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version, default settings and built-in resources
    Info,
    /// Render a scene and print per-frame reports
    Render {
        /// Scene dump to render; the sample scene when omitted
        #[arg(short, long)]
        scene: Option<PathBuf>,
        /// Renderer settings (YAML)
        #[arg(long)]
        settings: Option<PathBuf>,
        #[arg(long, value_enum, default_value = "recording")]
        backend: Backend,
        #[arg(long, default_value = "1280")]
        width: u32,
        #[arg(long, default_value = "720")]
        height: u32,
        #[arg(short, long, default_value = "1")]
        frames: u32,
        /// Write the final frame as PNG (wgpu backend only)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Write the sample scene to a dump (.json for text, anything else binary)
    DemoScene {
        #[arg(default_value = "sample.scene")]
        out: PathBuf,
    },
    /// Convert a scene dump between text and binary encodings
    Convert { input: PathBuf, output: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Info => info(),
        Commands::Render {
            scene,
            settings,
            backend,
            width,
            height,
            frames,
            output,
        } => {
            let mut settings = match settings {
                Some(path) => RendererSettings::load(&path)
                    .with_context(|| format!("loading settings from {}", path.display()))?,
                None => RendererSettings::default(),
            };
            settings.resolution = [width, height];
            settings.validate()?;

            let cache = Arc::new(ResourceCache::with_builtins());
            let (scene, components) = load_scene(scene.as_deref(), &cache)?;
            let job = RenderJob {
                scene: &scene,
                components: &components,
                cache: &cache,
                frames: frames.max(1),
            };
            match backend {
                Backend::Recording => {
                    if output.is_some() {
                        bail!("--output needs the wgpu backend");
                    }
                    let mut renderer = Renderer::new(RecordingDevice::new(), settings)?;
                    job.run(&mut renderer)?;
                    let device = renderer.device();
                    println!("passes:");
                    for label in device.pass_labels() {
                        println!("  {:<16} {:>5} draws", label, device.draws_in_pass(label));
                    }
                    println!("shader compiles: {}", device.compile_count());
                }
                Backend::Wgpu => {
                    let device = WgpuDevice::headless()?;
                    let adapter = device.adapter_info();
                    println!("adapter: {} ({})", adapter.name, adapter.backend.to_str());
                    let mut renderer = Renderer::new(device, settings)?;
                    job.run(&mut renderer)?;
                    if let Some(path) = output {
                        write_png(&mut renderer, &path)?;
                        println!("wrote {}", path.display());
                    }
                }
            }
            Ok(())
        }
        Commands::DemoScene { out } => {
            let cache = ResourceCache::with_builtins();
            let (scene, components) = sample::build(&cache);
            let file = SceneFile::capture(&scene, &components, &cache);
            spartan_persist::save(&out, &file)?;
            println!("wrote {} entities to {}", file.entities.len(), out.display());
            Ok(())
        }
        Commands::Convert { input, output } => {
            let file = spartan_persist::load(&input)?;
            spartan_persist::save(&output, &file)?;
            println!(
                "converted {} -> {} ({} entities)",
                input.display(),
                output.display(),
                file.entities.len()
            );
            Ok(())
        }
    }
}

fn info() -> Result<()> {
    println!("spartan-cli v{}", env!("CARGO_PKG_VERSION"));
    let cache = ResourceCache::with_builtins();
    let stats = cache.stats();
    println!("built-in resources: {stats:?}");
    println!("default settings:");
    print!("{}", RendererSettings::default().to_yaml()?);
    Ok(())
}

/// Load a dump, or build the sample scene. Resources the dump names by path
/// are queued on the import pool and waited for.
fn load_scene(path: Option<&Path>, cache: &Arc<ResourceCache>) -> Result<(Scene, ComponentStore)> {
    sample::register_materials(cache);
    let Some(path) = path else {
        return Ok(sample::build(cache));
    };
    let file = spartan_persist::load(path)?;
    let pool = ImportPool::new(Arc::clone(cache), 4);
    for name in file.mesh_names() {
        if matches!(cache.mesh(mesh_handle(name)), Lookup::Missing) {
            pool.load_mesh(name);
        }
    }
    for name in file.material_names() {
        if matches!(cache.material(material_handle(name)), Lookup::Missing) {
            pool.load_material(name);
        }
    }
    if !pool.wait_idle(Duration::from_secs(30)) {
        tracing::warn!(pending = pool.pending(), "imports still running, rendering without them");
    }
    Ok(file.restore()?)
}

struct RenderJob<'a> {
    scene: &'a Scene,
    components: &'a ComponentStore,
    cache: &'a ResourceCache,
    frames: u32,
}

impl RenderJob<'_> {
    fn run<D: GraphicsDevice>(&self, renderer: &mut Renderer<D>) -> Result<()> {
        let (width, height) = renderer.size();
        for _ in 0..self.frames {
            let input = extract_frame(
                self.scene,
                self.components,
                self.cache,
                Rect::from_size(width, height),
                PresentTarget::Offscreen,
            );
            let report = renderer.render_frame(&input)?;
            println!("{report}");
        }
        Ok(())
    }
}

fn write_png(renderer: &mut Renderer<WgpuDevice>, path: &Path) -> Result<()> {
    let Some(texture) = renderer.output_texture() else {
        bail!("renderer has no output texture");
    };
    let readback = renderer.device_mut().read_texture(texture)?;
    let image = image::RgbaImage::from_raw(readback.width, readback.height, readback.rgba)
        .context("readback size does not match the output texture")?;
    image
        .save(path)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
