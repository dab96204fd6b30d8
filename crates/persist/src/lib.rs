//! Persistence: versioned scene dumps.
//!
//! # Invariants
//! - A dump records parents before children, so restoring is a single pass.
//! - Binary dumps are digest-verified before they are decoded.
//! - Unknown schema or format versions fail closed; nothing is partially loaded.

pub mod sample;
pub mod scene_file;
pub mod store;

pub use scene_file::{EntityRecord, RenderableRecord, ResourceRef, SCENE_SCHEMA_VERSION, SceneFile};
pub use store::{
    Encoding, PersistError, decode, from_binary, from_text, load, load_binary, load_text, save,
    save_binary, save_text, to_binary, to_text,
};
