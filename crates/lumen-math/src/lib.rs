// SPDX-License-Identifier: CEPL-1.0
//! GPU payload blocks shared by the simulation and the renderer.
//!
//! Every block is `#[repr(C)]` + `Pod` so it can be copied byte-for-byte into a
//! uniform buffer or a push-constant range. Layouts follow std140 rules (vec3s are
//! widened to vec4).
mod blocks;
mod camera;

pub use blocks::{CameraBlock, LightBlock, PushConstants};
pub use camera::{orbit_eye, shadow_view_proj, OrbitCamera};
pub use glam;
