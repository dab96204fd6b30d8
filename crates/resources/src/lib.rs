//! Resource cache: process-wide store of meshes, materials and textures.
//!
//! Resources are addressed by handles derived from their name or path, so a
//! scene file can refer to them before they are loaded. The renderer consumes
//! resources by handle and asks the cache whether they are ready.
//!
//! # Concurrency
//! One coarse `RwLock` guards all maps. Import workers take the write lock
//! only to publish a finished resource; the render thread takes the read lock
//! per lookup and clones the `Arc`, so eviction never frees data that a frame
//! is still using.

mod cache;
mod error;
mod import;
mod material;
mod mesh;
mod texture;

pub use cache::{CacheStats, Lookup, ResourceCache, material_handle, mesh_handle, texture_handle};
pub use error::ResourceError;
pub use import::ImportPool;
pub use material::{BlendMode, Material, MaterialDesc, TextureSlot};
pub use mesh::{Aabb, Mesh, MeshDesc, Vertex, primitives};
pub use texture::TextureData;
