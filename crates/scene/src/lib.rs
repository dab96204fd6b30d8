//! Scene graph: authoritative entity state and the transform hierarchy.
//!
//! # Invariants
//! - Every entity owns exactly one `Transform`.
//! - Cached world matrices are always current: any transform or parent change
//!   recomputes the affected subtree before the call returns.
//! - The hierarchy is acyclic.
//! - All mutations are recorded in the event log.

pub mod scene;

pub use scene::{EntityData, Scene, SceneError, SceneEvent};
