//! wgpu backend for the spartan renderer.
//!
//! `WgpuDevice` implements `GraphicsDevice` on whatever native API wgpu
//! selects. It runs headless for offline rendering or against a window
//! surface for the editor.
//!
//! # Invariants
//! - Every pipeline shares one bind group layout: constants in group 0,
//!   textures and samplers in group 1, numbered like the device slots.
//! - After `recreate` all ids from the previous device are invalid and
//!   `generation` has changed.

mod bindings;
mod camera;
mod convert;
mod device;
mod shaders;

pub use camera::FlyCamera;
pub use device::{Readback, WgpuDevice};
