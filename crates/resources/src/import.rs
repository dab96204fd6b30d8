use crate::cache::{Kind, ResourceCache, name_hash};
use crate::error::ResourceError;
use crate::material::{MaterialDesc, TextureSlot};
use crate::mesh::MeshDesc;
use crate::texture::TextureData;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use spartan_common::{MaterialHandle, MeshHandle, TextureHandle};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

enum Job {
    Texture {
        id: u64,
        generation: u64,
        path: PathBuf,
        srgb: bool,
    },
    Mesh {
        id: u64,
        generation: u64,
        path: PathBuf,
    },
    Material {
        id: u64,
        generation: u64,
        path: PathBuf,
    },
    Shutdown,
}

#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn add(&self) {
        *self.count.lock() += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

/// Cloneable request side of the pool, shared with workers so a material
/// job can queue its textures.
#[derive(Clone)]
struct Submitter {
    cache: Arc<ResourceCache>,
    sender: Sender<Job>,
    pending: Arc<Pending>,
}

impl Submitter {
    fn name_of(path: &Path) -> String {
        path.to_string_lossy().replace('\\', "/")
    }

    fn submit(
        &self,
        kind: Kind,
        path: &Path,
        force: bool,
        make: impl FnOnce(u64, u64) -> Job,
    ) -> u64 {
        let name = Self::name_of(path);
        if !force && self.cache.is_live(kind, &name) {
            return name_hash(kind, &name);
        }
        let (id, generation) = self.cache.begin_load(kind, &name);
        self.pending.add();
        if self.sender.send(make(id, generation)).is_err() {
            self.pending.done();
            let reason = ResourceError::PoolClosed.to_string();
            match kind {
                Kind::Mesh => self.cache.complete_mesh(id, generation, Err(reason)),
                Kind::Material => self.cache.complete_material(id, generation, Err(reason)),
                Kind::Texture => self.cache.complete_texture(id, generation, Err(reason)),
            };
            tracing::error!(name, "import pool closed, load rejected");
        } else {
            tracing::debug!(name, generation, ?kind, "load queued");
        }
        id
    }

    fn texture(&self, path: &Path, srgb: bool, force: bool) -> TextureHandle {
        let owned = path.to_path_buf();
        TextureHandle(self.submit(Kind::Texture, path, force, move |id, generation| {
            Job::Texture {
                id,
                generation,
                path: owned,
                srgb,
            }
        }))
    }

    fn mesh(&self, path: &Path, force: bool) -> MeshHandle {
        let owned = path.to_path_buf();
        MeshHandle(self.submit(Kind::Mesh, path, force, move |id, generation| Job::Mesh {
            id,
            generation,
            path: owned,
        }))
    }

    fn material(&self, path: &Path, force: bool) -> MaterialHandle {
        let owned = path.to_path_buf();
        MaterialHandle(self.submit(Kind::Material, path, force, move |id, generation| {
            Job::Material {
                id,
                generation,
                path: owned,
            }
        }))
    }
}

/// Fixed-size worker pool that loads resources from disk into the cache.
///
/// Requests return a handle immediately; the cache reports `Loading` until a
/// worker publishes the result. Re-requesting a path that is ready or
/// loading is a no-op unless `reload_*` is used, which supersedes the
/// in-flight request. A reloaded resource keeps serving its previous value
/// until the new one is published.
pub struct ImportPool {
    submitter: Submitter,
    workers: Vec<JoinHandle<()>>,
}

impl ImportPool {
    pub fn new(cache: Arc<ResourceCache>, threads: usize) -> Self {
        let threads = threads.max(1);
        let (sender, receiver) = crossbeam_channel::unbounded();
        let submitter = Submitter {
            cache,
            sender,
            pending: Arc::new(Pending::default()),
        };
        let workers = (0..threads)
            .filter_map(|i| {
                let receiver = receiver.clone();
                let submitter = submitter.clone();
                std::thread::Builder::new()
                    .name(format!("import-{i}"))
                    .spawn(move || worker_loop(receiver, submitter))
                    .map_err(|e| tracing::error!(error = %e, "failed to spawn import worker"))
                    .ok()
            })
            .collect::<Vec<_>>();
        tracing::info!(threads = workers.len(), "import pool started");
        Self { submitter, workers }
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.submitter.cache
    }

    pub fn load_texture(&self, path: impl AsRef<Path>, srgb: bool) -> TextureHandle {
        self.submitter.texture(path.as_ref(), srgb, false)
    }

    pub fn reload_texture(&self, path: impl AsRef<Path>, srgb: bool) -> TextureHandle {
        self.submitter.texture(path.as_ref(), srgb, true)
    }

    pub fn load_mesh(&self, path: impl AsRef<Path>) -> MeshHandle {
        self.submitter.mesh(path.as_ref(), false)
    }

    pub fn reload_mesh(&self, path: impl AsRef<Path>) -> MeshHandle {
        self.submitter.mesh(path.as_ref(), true)
    }

    /// Load a material description; its textures are queued as separate jobs.
    pub fn load_material(&self, path: impl AsRef<Path>) -> MaterialHandle {
        self.submitter.material(path.as_ref(), false)
    }

    pub fn reload_material(&self, path: impl AsRef<Path>) -> MaterialHandle {
        self.submitter.material(path.as_ref(), true)
    }

    /// Abandon an in-flight texture load. Returns false if it was not loading.
    pub fn cancel_texture(&self, handle: TextureHandle) -> bool {
        self.submitter.cache.cancel(Kind::Texture, handle.0)
    }

    pub fn cancel_mesh(&self, handle: MeshHandle) -> bool {
        self.submitter.cache.cancel(Kind::Mesh, handle.0)
    }

    pub fn cancel_material(&self, handle: MaterialHandle) -> bool {
        self.submitter.cache.cancel(Kind::Material, handle.0)
    }

    /// Number of queued or running jobs.
    pub fn pending(&self) -> usize {
        *self.submitter.pending.count.lock()
    }

    /// Block until every queued job has finished or `timeout` elapses.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.submitter.pending.count.lock();
        while *count > 0 {
            if self
                .submitter
                .pending
                .idle
                .wait_until(&mut count, deadline)
                .timed_out()
            {
                return *count == 0;
            }
        }
        true
    }
}

impl Drop for ImportPool {
    fn drop(&mut self) {
        for _ in &self.workers {
            let _ = self.submitter.sender.send(Job::Shutdown);
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        tracing::debug!("import pool stopped");
    }
}

fn worker_loop(receiver: Receiver<Job>, submitter: Submitter) {
    while let Ok(job) = receiver.recv() {
        match job {
            Job::Shutdown => break,
            Job::Texture {
                id,
                generation,
                path,
                srgb,
            } => {
                let result = TextureData::load(&path, srgb).map_err(|e| e.to_string());
                log_result(&path, &result);
                if !submitter.cache.complete_texture(id, generation, result) {
                    tracing::debug!(
                        path = %path.display(),
                        "texture load superseded, result dropped"
                    );
                }
            }
            Job::Mesh {
                id,
                generation,
                path,
            } => {
                let result = load_mesh(&path).map_err(|e| e.to_string());
                log_result(&path, &result);
                if !submitter.cache.complete_mesh(id, generation, result) {
                    tracing::debug!(path = %path.display(), "mesh load superseded, result dropped");
                }
            }
            Job::Material {
                id,
                generation,
                path,
            } => {
                let result = load_material(&path, &submitter).map_err(|e| e.to_string());
                log_result(&path, &result);
                if !submitter.cache.complete_material(id, generation, result) {
                    tracing::debug!(
                        path = %path.display(),
                        "material load superseded, result dropped"
                    );
                }
            }
        }
        submitter.pending.done();
    }
}

fn log_result<T>(path: &Path, result: &Result<T, String>) {
    match result {
        Ok(_) => tracing::debug!(path = %path.display(), "loaded"),
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "load failed"),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ResourceError> {
    let file = std::fs::File::open(path).map_err(|e| ResourceError::io(path, e))?;
    serde_json::from_reader(std::io::BufReader::new(file)).map_err(|e| ResourceError::json(path, e))
}

fn load_mesh(path: &Path) -> Result<crate::mesh::Mesh, ResourceError> {
    read_json::<MeshDesc>(path)?.into_mesh()
}

fn load_material(
    path: &Path,
    submitter: &Submitter,
) -> Result<crate::material::Material, ResourceError> {
    let desc: MaterialDesc = read_json(path)?;
    let base = path.parent().unwrap_or_else(|| Path::new(""));
    let textures: BTreeMap<TextureSlot, TextureHandle> = desc
        .textures
        .iter()
        .map(|(slot, rel)| (*slot, submitter.texture(&base.join(rel), slot.is_srgb(), false)))
        .collect();
    Ok(desc.into_material(textures))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Lookup;
    use crate::material::BlendMode;

    fn write_png(path: &Path) {
        image::RgbaImage::from_pixel(4, 4, image::Rgba([200, 100, 50, 255]))
            .save(path)
            .unwrap();
    }

    #[test]
    fn loads_texture_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let png = dir.path().join("albedo.png");
        write_png(&png);

        let cache = Arc::new(ResourceCache::new());
        let pool = ImportPool::new(Arc::clone(&cache), 2);
        let handle = pool.load_texture(&png, true);
        assert!(pool.wait_idle(Duration::from_secs(10)));

        let tex = cache.texture(handle).ready().cloned().unwrap();
        assert_eq!((tex.width, tex.height), (4, 4));
        assert!(tex.srgb);
    }

    #[test]
    fn missing_file_marks_failed() {
        let cache = Arc::new(ResourceCache::new());
        let pool = ImportPool::new(Arc::clone(&cache), 1);
        let handle = pool.load_mesh("/no/such/mesh.json");
        assert!(pool.wait_idle(Duration::from_secs(10)));
        assert!(matches!(cache.mesh(handle), Lookup::Failed(_)));
    }

    #[test]
    fn material_queues_its_textures() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("wall.png"));
        std::fs::write(
            dir.path().join("wall.json"),
            r#"{ "name": "wall", "blend": "transparent", "textures": { "albedo": "wall.png" } }"#,
        )
        .unwrap();

        let cache = Arc::new(ResourceCache::new());
        let pool = ImportPool::new(Arc::clone(&cache), 2);
        let handle = pool.load_material(dir.path().join("wall.json"));
        assert!(pool.wait_idle(Duration::from_secs(10)));

        let material = cache.material(handle).ready().cloned().unwrap();
        assert_eq!(material.blend, BlendMode::Transparent);
        let albedo = material.texture(TextureSlot::Albedo).unwrap();
        assert!(cache.texture(albedo).is_ready());
    }

    #[test]
    fn repeated_request_is_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let png = dir.path().join("a.png");
        write_png(&png);

        let cache = Arc::new(ResourceCache::new());
        let pool = ImportPool::new(Arc::clone(&cache), 1);
        let first = pool.load_texture(&png, false);
        assert!(pool.wait_idle(Duration::from_secs(10)));
        let Lookup::Ready { version, .. } = cache.texture(first) else {
            panic!("texture not ready");
        };

        let second = pool.load_texture(&png, false);
        assert_eq!(first, second);
        assert_eq!(pool.pending(), 0);
        let Lookup::Ready { version: again, .. } = cache.texture(second) else {
            panic!("texture not ready");
        };
        assert_eq!(version, again);
    }

    #[test]
    fn cancelled_texture_never_becomes_ready() {
        let dir = tempfile::tempdir().unwrap();
        let png = dir.path().join("c.png");
        write_png(&png);

        let cache = Arc::new(ResourceCache::new());
        // Hold the only worker busy so the cancel happens before the load runs.
        let pool = ImportPool::new(Arc::clone(&cache), 1);
        let blocker = pool.load_mesh("/no/such/blocker.json");
        let handle = pool.load_texture(&png, true);
        let cancelled = pool.cancel_texture(handle);
        assert!(pool.wait_idle(Duration::from_secs(10)));

        if cancelled {
            assert!(matches!(cache.texture(handle), Lookup::Missing));
        }
        assert!(matches!(cache.mesh(blocker), Lookup::Failed(_)));
    }
}
