// SPDX-License-Identifier: CEPL-1.0
//! Vulkan backend: device bring-up, resource creation, queue-ownership
//! transfers, the swapchain and its frames, and the per-tick render loop.
use anyhow::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{debug, info};

use lumen_render::{
    AssetSink, FrameScene, MaterialRange, MaterialRecord, MeshData, MeshHandle, RenderSettings,
    RenderSize, Renderer, TextureData, TextureRange,
};

mod backend;
mod debug;
mod device;
mod error;
mod frame;
mod overlay;
mod pipeline;
mod render_loop;
mod resource;
mod scene;
mod swapchain;
mod sync;
mod transfer;

pub use backend::GpuState;
pub use error::VkError;
pub use overlay::{FramePulse, OverlayRecorder};
pub use render_loop::{FrameBackend, LoopState, RecreateReason, RenderLoop, TickOutcome};

pub struct VkRenderer {
    frames: RenderLoop,
    gpu: GpuState,
    paused: bool,
}

impl VkRenderer {
    /// Replaces the current overlay; the old one is destroyed once the device is idle.
    pub fn set_overlay(&mut self, overlay: Option<Box<dyn OverlayRecorder>>) {
        self.gpu.set_overlay(overlay);
    }
}

impl Renderer for VkRenderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        settings: &RenderSettings,
    ) -> Result<Self> {
        let gpu = unsafe { GpuState::new(window, display, size, settings)? };
        let paused = size.is_zero_area();
        if paused {
            info!("vk: created at 0x0, paused until resized");
        }
        Ok(Self {
            frames: RenderLoop::new(settings.flight_slots),
            gpu,
            paused,
        })
    }

    fn resize(&mut self, size: RenderSize) -> Result<()> {
        self.gpu.set_size(size);
        if size.is_zero_area() {
            if !self.paused {
                info!("vk: resize to 0x0, paused");
            }
            self.paused = true;
            return Ok(());
        }
        let reason = if self.paused {
            info!("vk: resize to {}x{}, resumed", size.width, size.height);
            RecreateReason::RESTORED
        } else {
            RecreateReason::RESIZED
        };
        self.paused = false;
        self.frames.request_recreate(reason);
        Ok(())
    }

    fn render(&mut self, scene: &FrameScene) -> Result<()> {
        if self.paused {
            return Ok(());
        }
        match self.frames.tick(&mut self.gpu, scene) {
            Ok(TickOutcome::Skipped) => debug!("vk: frame skipped for swapchain rebuild"),
            Ok(TickOutcome::Presented { .. }) => {}
            // Rebuild hit a 0x0 surface; the next tick retries.
            Err(e) if e.is_stale() => debug!("vk: surface not ready"),
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.gpu.set_clear_color(rgba);
    }

    fn request_shader_reload(&mut self) {
        self.frames.request_recreate(RecreateReason::SHADERS);
    }
}

impl AssetSink for VkRenderer {
    fn upload_mesh_buffer(&mut self, mesh: MeshData) -> Result<MeshHandle> {
        Ok(unsafe { self.gpu.upload_mesh(mesh)? })
    }

    fn upload_materials(&mut self, records: &[MaterialRecord]) -> Result<MaterialRange> {
        Ok(unsafe { self.gpu.upload_materials(records)? })
    }

    fn register_textures(&mut self, textures: Vec<TextureData>) -> Result<TextureRange> {
        Ok(unsafe { self.gpu.register_textures(textures)? })
    }
}
