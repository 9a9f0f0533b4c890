// SPDX-License-Identifier: CEPL-1.0
use std::path::PathBuf;

use anyhow::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

mod assets;

pub use assets::{
    AssetSink, DrawInstance, FrameScene, MaterialRange, MaterialRecord, MeshData, MeshHandle,
    Primitive, TextureData, TextureRange, TextureRole, Vertex,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn is_zero_area(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Presentation pacing requested by the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PresentPreference {
    /// Non-blocking replace-latest (mailbox), falling back to vsync.
    #[default]
    LowLatency,
    Vsync,
    /// Tearing allowed, falling back to vsync.
    Immediate,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderPaths {
    pub vertex: PathBuf,
    pub fragment: PathBuf,
}

/// Everything the backend is configured with; built by the host from its config.
#[derive(Clone, Debug)]
pub struct RenderSettings {
    pub clear_color: [f32; 4],
    pub present: PresentPreference,
    /// Number of acquire/render-complete semaphore pairs (clamped to >= 1).
    pub flight_slots: usize,
    pub require_ray_tracing: bool,
    pub validation: bool,
    /// `None` uses the shader pair compiled into the backend.
    pub shaders: Option<ShaderPaths>,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            clear_color: [0.02, 0.02, 0.04, 1.0],
            present: PresentPreference::default(),
            flight_slots: 2,
            require_ray_tracing: true,
            validation: cfg!(debug_assertions),
            shaders: None,
        }
    }
}

pub trait Renderer: AssetSink {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        settings: &RenderSettings,
    ) -> Result<Self>
    where
        Self: Sized;

    fn resize(&mut self, size: RenderSize) -> Result<()>;
    fn render(&mut self, scene: &FrameScene) -> Result<()>;
    fn set_clear_color(&mut self, rgba: [f32; 4]);
    /// Re-read shader binaries on the next swapchain rebuild.
    fn request_shader_reload(&mut self) {}
}

/// Pluggable per-application behaviour driven by the host loop.
pub trait Simulation {
    /// Push meshes, materials and textures into the renderer once at startup.
    fn load(&mut self, assets: &mut dyn AssetSink) -> Result<()>;
    fn start(&mut self, size: RenderSize);
    fn update(&mut self, dt: f32, size: RenderSize) -> FrameScene;
}
