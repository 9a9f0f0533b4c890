// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use lumen_render::{
    FrameScene, MaterialRange, MaterialRecord, MeshData, MeshHandle, RenderSettings, RenderSize,
    ShaderPaths, TextureData, TextureRange,
};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{info, warn};

use crate::device::DeviceContext;
use crate::error::VkError;
use crate::frame::{Frame, PassTarget};
use crate::overlay::OverlayRecorder;
use crate::pipeline::{PipelineCache, ShaderBinaries};
use crate::render_loop::{FrameBackend, RecreateReason};
use crate::scene::SceneResources;
use crate::swapchain::{SwapchainRequest, SwapchainResources};
use crate::transfer::TransferCoordinator;

/// Everything the render loop drives. `ctx` is declared last so it drops
/// after `Drop for GpuState` has released every child object.
pub struct GpuState {
    swapchain: Option<SwapchainResources>,
    scene: SceneResources,
    transfer: TransferCoordinator,
    cache: PipelineCache,
    shaders: ShaderBinaries,
    settings: RenderSettings,
    size: RenderSize,
    clear: [f32; 4],
    overlay: Option<Box<dyn OverlayRecorder>>,
    ctx: DeviceContext,
}

/// A missing swapchain is reported as stale so the loop rebuilds it.
fn live(swapchain: &mut Option<SwapchainResources>) -> Result<&mut SwapchainResources, VkError> {
    swapchain.as_mut().ok_or(VkError::SurfaceStale)
}

fn frame_at(sc: &SwapchainResources, image: u32) -> Result<&Frame, VkError> {
    sc.frames.get(image as usize).ok_or(VkError::SurfaceStale)
}

/// Keeps the running binaries when the new ones fail to load.
fn reload_shaders(current: ShaderBinaries, paths: Option<&ShaderPaths>) -> ShaderBinaries {
    match ShaderBinaries::resolve(paths) {
        Ok(fresh) => {
            info!("shaders reloaded");
            fresh
        }
        Err(e) => {
            warn!("shader reload failed, keeping previous binaries: {e}");
            current
        }
    }
}

impl GpuState {
    /// STRICT ORDER: shaders, device context, transfer pools, scene defaults,
    /// pipeline cache, then the first swapchain (skipped while 0x0).
    pub unsafe fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        settings: &RenderSettings,
    ) -> Result<Self, VkError> {
        let shaders = ShaderBinaries::resolve(settings.shaders.as_ref())?;
        let ctx = DeviceContext::new(window, display, settings)?;
        let mut transfer = TransferCoordinator::new(&ctx)?;
        let mut scene = match SceneResources::new(&ctx, &transfer) {
            Ok(s) => s,
            Err(e) => {
                transfer.destroy(&ctx.device);
                return Err(e);
            }
        };
        let cache = match PipelineCache::create_or_load(&ctx.device, &ctx.info.properties) {
            Ok(c) => c,
            Err(e) => {
                scene.destroy(&ctx.device);
                transfer.destroy(&ctx.device);
                return Err(e);
            }
        };

        // From here on Drop cleans up.
        let mut state = Self {
            swapchain: None,
            scene,
            transfer,
            cache,
            shaders,
            settings: settings.clone(),
            size,
            clear: settings.clear_color,
            overlay: None,
            ctx,
        };
        if !size.is_zero_area() {
            state.rebuild()?;
        }
        Ok(state)
    }

    pub fn set_size(&mut self, size: RenderSize) {
        self.size = size;
    }

    pub fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.clear = rgba;
    }

    pub fn set_overlay(&mut self, overlay: Option<Box<dyn OverlayRecorder>>) {
        if let Some(mut old) = std::mem::replace(&mut self.overlay, overlay) {
            if let Err(e) = self.ctx.wait_idle() {
                warn!("wait idle before overlay swap: {e}");
            }
            old.destroy(&self.ctx.device);
        }
        if let (Some(o), Some(sc)) = (self.overlay.as_mut(), self.swapchain.as_ref()) {
            o.on_swapchain_rebuilt(sc.render_pass, sc.image_count());
        }
    }

    unsafe fn rebuild(&mut self) -> Result<(), VkError> {
        let req = SwapchainRequest {
            size: self.size,
            present: self.settings.present,
            flight_slots: self.settings.flight_slots,
            shaders: &self.shaders,
            cache: self.cache.handle,
        };
        let sc = SwapchainResources::init(&self.ctx, &req, self.swapchain.take())?;
        if let Some(o) = self.overlay.as_mut() {
            o.on_swapchain_rebuilt(sc.render_pass, sc.image_count());
        }
        self.swapchain = Some(sc);
        self.refresh_scene_descriptors();
        Ok(())
    }

    /// Bindings 1 and 3 of every frame; the device must not be using the sets.
    unsafe fn refresh_scene_descriptors(&self) {
        let Some(sc) = self.swapchain.as_ref() else {
            return;
        };
        let table = self.scene.texture_table();
        let materials = self.scene.material_buffer();
        for frame in sc.frames.iter() {
            frame.write_scene_descriptors(&self.ctx.device, &table, materials);
        }
    }

    pub unsafe fn upload_mesh(&mut self, mesh: MeshData) -> Result<MeshHandle, VkError> {
        self.scene.upload_mesh(&self.ctx, &self.transfer, mesh)
    }

    pub unsafe fn upload_materials(
        &mut self,
        records: &[MaterialRecord],
    ) -> Result<MaterialRange, VkError> {
        let range = self.scene.upload_materials(&self.ctx, &self.transfer, records)?;
        self.refresh_scene_descriptors();
        Ok(range)
    }

    pub unsafe fn register_textures(
        &mut self,
        textures: Vec<TextureData>,
    ) -> Result<TextureRange, VkError> {
        let range = self.scene.register_textures(&self.ctx, &self.transfer, textures)?;
        self.refresh_scene_descriptors();
        Ok(range)
    }
}

impl FrameBackend for GpuState {
    fn flight_slot_count(&self) -> usize {
        self.swapchain
            .as_ref()
            .map(|sc| sc.sync.slot_count())
            .unwrap_or(self.settings.flight_slots.max(1))
    }

    fn acquire(&mut self, slot: usize) -> Result<u32, VkError> {
        let Self { ctx, swapchain, .. } = self;
        let sc = live(swapchain)?;
        let (image, _) = unsafe {
            sc.sync
                .acquire(&ctx.device, &ctx.swapchain_loader, sc.swapchain, &sc.frames, slot)?
        };
        Ok(image)
    }

    fn wait_frame(&mut self, image: u32) -> Result<(), VkError> {
        let sc = live(&mut self.swapchain)?;
        unsafe { frame_at(sc, image)?.wait_and_reset(&self.ctx.device) }
    }

    fn begin_pass(&mut self, image: u32, frame_scene: &FrameScene) -> Result<(), VkError> {
        let Self {
            ctx,
            swapchain,
            clear,
            ..
        } = self;
        let sc = live(swapchain)?;
        let frame = frame_at(sc, image)?;
        let device = &ctx.device;
        let target = PassTarget {
            render_pass: sc.render_pass,
            extent: sc.extent,
            clear_color: *clear,
        };
        let cmd = frame.command_buffer;
        unsafe {
            frame.write_uniforms(
                device,
                &sc.frames.uniform_layout,
                &frame_scene.camera,
                &frame_scene.lighting,
            )?;
            frame.begin_recording(device)?;
            frame.begin_render_pass(device, &target);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, sc.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                sc.pipeline_layout,
                0,
                &[frame.descriptor_set],
                &[],
            );
        }
        Ok(())
    }

    fn record_scene(&mut self, image: u32, frame_scene: &FrameScene) -> Result<(), VkError> {
        let Self {
            ctx,
            swapchain,
            scene,
            ..
        } = self;
        let sc = live(swapchain)?;
        let frame = frame_at(sc, image)?;
        unsafe {
            scene.record_draws(
                &ctx.device,
                frame.command_buffer,
                sc.pipeline_layout,
                &frame_scene.draws,
            );
        }
        Ok(())
    }

    fn record_overlay(&mut self, image: u32) -> Result<(), VkError> {
        let Self {
            ctx,
            swapchain,
            overlay,
            ..
        } = self;
        let Some(o) = overlay.as_mut() else {
            return Ok(());
        };
        let sc = live(swapchain)?;
        let frame = frame_at(sc, image)?;
        o.record(&ctx.device, frame.command_buffer, sc.extent)
    }

    fn end_pass(&mut self, image: u32) -> Result<(), VkError> {
        let sc = live(&mut self.swapchain)?;
        let frame = frame_at(sc, image)?;
        unsafe {
            frame.end_render_pass(&self.ctx.device);
            frame.end_recording(&self.ctx.device)
        }
    }

    fn submit(&mut self, image: u32, slot: usize) -> Result<(), VkError> {
        let Self { ctx, swapchain, .. } = self;
        let sc = live(swapchain)?;
        let frame = frame_at(sc, image)?;
        unsafe { sc.sync.submit(&ctx.device, ctx.graphics_queue, frame, slot) }
    }

    fn present(&mut self, image: u32, slot: usize) -> Result<(), VkError> {
        let Self { ctx, swapchain, .. } = self;
        let sc = live(swapchain)?;
        unsafe {
            sc.sync.present(
                &ctx.swapchain_loader,
                ctx.present_queue,
                sc.swapchain,
                image,
                slot,
            )
        }
    }

    fn recreate(&mut self, reason: RecreateReason) -> Result<(), VkError> {
        if reason.contains(RecreateReason::SHADERS) {
            let current = std::mem::take(&mut self.shaders);
            self.shaders = reload_shaders(current, self.settings.shaders.as_ref());
        }
        unsafe { self.rebuild() }
    }

    fn wait_idle(&mut self) -> Result<(), VkError> {
        self.ctx.wait_idle()
    }
}

impl Drop for GpuState {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.ctx.wait_idle() {
                warn!("wait idle on shutdown: {e}");
            }
            self.cache.save(&self.ctx.device);
            if let Some(mut o) = self.overlay.take() {
                o.destroy(&self.ctx.device);
            }
            if let Some(sc) = self.swapchain.take() {
                sc.destroy(&self.ctx);
            }
            self.scene.destroy(&self.ctx.device);
            self.transfer.destroy(&self.ctx.device);
            self.cache.destroy(&self.ctx.device);
        }
        info!("gpu state released");
    }
}
