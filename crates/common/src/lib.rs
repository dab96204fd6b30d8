//! Shared types for the spartan engine.
//!
//! Everything here is plain data: identifiers, spatial transforms, asset
//! handles and screen-space rectangles. Crates higher in the stack agree on
//! these types so the scene, resource cache and renderer can talk without
//! depending on each other.

mod handles;
mod types;

pub use handles::{MaterialHandle, MeshHandle, TextureHandle};
pub use types::{Color, EntityId, Rect, Transform};
