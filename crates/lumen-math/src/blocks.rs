// SPDX-License-Identifier: CEPL-1.0
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

use crate::camera::shadow_view_proj;

/// Per-frame camera block (set 0, binding 0).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct CameraBlock {
    pub proj: Mat4,
    pub view: Mat4,
    pub view_inverse: Mat4,
    pub shadow_view_proj: Mat4,
    /// xyz = eye position, w unused
    pub position: Vec4,
    /// xyz = direction light travels in, w unused
    pub light_dir: Vec4,
}

impl Default for CameraBlock {
    fn default() -> Self {
        Self {
            proj: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            view_inverse: Mat4::IDENTITY,
            shadow_view_proj: Mat4::IDENTITY,
            position: Vec4::ZERO,
            light_dir: Vec4::new(0.0, -1.0, 0.0, 0.0),
        }
    }
}

impl CameraBlock {
    pub fn new(proj: Mat4, view: Mat4, eye: Vec3, light_dir: Vec3) -> Self {
        Self {
            proj,
            view,
            view_inverse: view.inverse(),
            shadow_view_proj: shadow_view_proj(light_dir),
            position: eye.extend(1.0),
            light_dir: light_dir.normalize_or_zero().extend(0.0),
        }
    }
}

/// Per-frame fragment lighting block (set 0, binding 2).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct LightBlock {
    pub direction: Vec4,
    pub color: Vec4,
    pub ambient: Vec4,
}

impl Default for LightBlock {
    fn default() -> Self {
        Self {
            direction: Vec4::new(-0.4, -1.0, -0.3, 0.0),
            color: Vec4::new(1.0, 0.97, 0.9, 1.0),
            ambient: Vec4::new(0.08, 0.08, 0.1, 1.0),
        }
    }
}

/// Per-draw push constant: model transform + material index.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct PushConstants {
    pub transform: Mat4,
    pub material: u32,
    pub _pad: [u32; 3],
}

impl PushConstants {
    pub fn new(transform: Mat4, material: u32) -> Self {
        Self {
            transform,
            material,
            _pad: [0; 3],
        }
    }
}
