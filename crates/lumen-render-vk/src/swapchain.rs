// SPDX-License-Identifier: CEPL-1.0
//! Everything that depends on surface format or extent, rebuilt wholesale on
//! resize or when the surface goes stale.
use ash::vk;
use lumen_render::{PresentPreference, RenderSize};
use tracing::info;

use crate::device::{DeviceContext, QueueFamilies};
use crate::error::{VkCall, VkError};
use crate::frame::{FramePool, FrameTargets, UniformLayout};
use crate::pipeline::{
    create_descriptor_pool, create_descriptor_set_layout, create_graphics_pipeline,
    create_pipeline_layout, create_render_pass, ShaderBinaries,
};
use crate::resource::{Image, ResourceFactory, ResourceOwner};
use crate::sync::SyncController;

/// Preferred first.
pub const DEPTH_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
) -> Result<vk::SurfaceFormatKHR, VkError> {
    let srgb = |want: vk::Format| {
        formats
            .iter()
            .copied()
            .find(|f| f.format == want && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
    };
    srgb(vk::Format::B8G8R8A8_SRGB)
        .or_else(|| srgb(vk::Format::R8G8B8A8_SRGB))
        .or_else(|| formats.first().copied())
        .ok_or(VkError::SurfaceQuery(vk::Result::ERROR_FORMAT_NOT_SUPPORTED))
}

/// FIFO is always available and is the fallback for every preference.
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    pref: PresentPreference,
) -> vk::PresentModeKHR {
    let want = match pref {
        PresentPreference::LowLatency => vk::PresentModeKHR::MAILBOX,
        PresentPreference::Immediate => vk::PresentModeKHR::IMMEDIATE,
        PresentPreference::Vsync => vk::PresentModeKHR::FIFO,
    };
    if modes.contains(&want) {
        want
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// `current_extent` wins unless the surface leaves sizing to us (u32::MAX).
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: want
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: want
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// min + 1, capped by max when the surface has one (0 = unbounded).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let want = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        want.min(caps.max_image_count)
    } else {
        want
    }
}

/// Concurrent only when graphics and present live in different families.
pub fn sharing_mode(families: &QueueFamilies) -> (vk::SharingMode, Vec<u32>) {
    if families.graphics != families.present {
        (
            vk::SharingMode::CONCURRENT,
            vec![families.graphics, families.present],
        )
    } else {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    }
}

pub fn pick_depth_format(
    candidates: &[vk::Format],
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
    mut query: impl FnMut(vk::Format) -> vk::FormatProperties,
) -> Result<vk::Format, VkError> {
    candidates
        .iter()
        .copied()
        .find(|&f| {
            let props = query(f);
            let supported = match tiling {
                vk::ImageTiling::LINEAR => props.linear_tiling_features,
                _ => props.optimal_tiling_features,
            };
            supported.contains(features)
        })
        .ok_or(VkError::UnsupportedFormat)
}

pub fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D16_UNORM_S8_UINT
    )
}

fn pm_name(m: vk::PresentModeKHR) -> &'static str {
    match m {
        vk::PresentModeKHR::FIFO => "fifo",
        vk::PresentModeKHR::MAILBOX => "mailbox",
        vk::PresentModeKHR::IMMEDIATE => "immediate",
        vk::PresentModeKHR::FIFO_RELAXED => "fifo_relaxed",
        _ => "other",
    }
}

/// What the caller wants from the next generation.
pub struct SwapchainRequest<'a> {
    pub size: RenderSize,
    pub present: PresentPreference,
    pub flight_slots: usize,
    pub shaders: &'a ShaderBinaries,
    pub cache: vk::PipelineCache,
}

/// One swapchain generation and every object derived from it.
pub struct SwapchainResources {
    pub swapchain: vk::SwapchainKHR,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub images: Vec<vk::Image>,
    pub depth: Image,
    pub render_pass: vk::RenderPass,
    pub set_layout: vk::DescriptorSetLayout,
    pub pipeline_layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
    pub descriptor_pool: vk::DescriptorPool,
    pub frames: FramePool,
    pub sync: SyncController,
}

impl SwapchainResources {
    fn empty() -> Self {
        Self {
            swapchain: vk::SwapchainKHR::null(),
            format: vk::SurfaceFormatKHR::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            extent: vk::Extent2D::default(),
            images: Vec::new(),
            depth: Image::default(),
            render_pass: vk::RenderPass::null(),
            set_layout: vk::DescriptorSetLayout::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            frames: FramePool::empty(),
            sync: SyncController::empty(),
        }
    }

    /// STRICT ORDER: retire the previous generation (device idle, dependents
    /// destroyed, handle kept as `old_swapchain`), create the new chain, then
    /// render pass, pipeline, depth, descriptors, frames and flight slots.
    pub unsafe fn init(
        ctx: &DeviceContext,
        req: &SwapchainRequest<'_>,
        previous: Option<SwapchainResources>,
    ) -> Result<Self, VkError> {
        let old_swapchain = match previous {
            Some(mut prev) => {
                ctx.wait_idle()?;
                prev.retire(&ctx.device)
            }
            None => vk::SwapchainKHR::null(),
        };

        let mut res = Self::empty();
        let built = res.build(ctx, req, old_swapchain);
        ctx.swapchain_loader.destroy_swapchain(old_swapchain, None);
        match built {
            Ok(()) => {
                info!(
                    "swapchain {}x{} fmt={:?} cs={:?} present={} images={} slots={}",
                    res.extent.width,
                    res.extent.height,
                    res.format.format,
                    res.format.color_space,
                    pm_name(res.present_mode),
                    res.images.len(),
                    res.sync.slot_count()
                );
                Ok(res)
            }
            Err(e) => {
                res.destroy(ctx);
                Err(e)
            }
        }
    }

    unsafe fn build(
        &mut self,
        ctx: &DeviceContext,
        req: &SwapchainRequest<'_>,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<(), VkError> {
        let device = &ctx.device;
        let loader = &ctx.surface_loader;

        // 1) surface support
        let caps = loader
            .get_physical_device_surface_capabilities(ctx.phys, ctx.surface)
            .map_err(VkError::SurfaceQuery)?;
        let formats = loader
            .get_physical_device_surface_formats(ctx.phys, ctx.surface)
            .map_err(VkError::SurfaceQuery)?;
        let modes = loader
            .get_physical_device_surface_present_modes(ctx.phys, ctx.surface)
            .map_err(VkError::SurfaceQuery)?;

        self.format = choose_surface_format(&formats)?;
        self.present_mode = choose_present_mode(&modes, req.present);
        self.extent = choose_extent(&caps, req.size);
        // Minimized surfaces report 0x0; retry once the host resizes.
        if self.extent.width == 0 || self.extent.height == 0 {
            return Err(VkError::SurfaceStale);
        }

        // 2) swapchain
        let (sharing, family_indices) = sharing_mode(&ctx.families);
        let ci = vk::SwapchainCreateInfoKHR {
            surface: ctx.surface,
            min_image_count: choose_image_count(&caps),
            image_format: self.format.format,
            image_color_space: self.format.color_space,
            image_extent: self.extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: sharing,
            queue_family_index_count: family_indices.len() as u32,
            p_queue_family_indices: family_indices.as_ptr(),
            pre_transform: caps.current_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode: self.present_mode,
            clipped: vk::TRUE,
            old_swapchain,
            ..Default::default()
        };
        self.swapchain = ctx
            .swapchain_loader
            .create_swapchain(&ci, None)
            .map_err(VkError::SwapchainCreation)?;

        // 3) true image count comes from the driver
        self.images = ctx
            .swapchain_loader
            .get_swapchain_images(self.swapchain)
            .call("vkGetSwapchainImagesKHR")?;

        // 4) render pass + pipeline
        let depth_format = pick_depth_format(
            &DEPTH_CANDIDATES,
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            |f| ctx.instance.get_physical_device_format_properties(ctx.phys, f),
        )?;
        self.render_pass = create_render_pass(device, self.format.format, depth_format)?;
        self.set_layout = create_descriptor_set_layout(device)?;
        self.pipeline_layout = create_pipeline_layout(device, self.set_layout)?;
        self.pipeline = create_graphics_pipeline(
            device,
            req.cache,
            self.render_pass,
            self.pipeline_layout,
            req.shaders,
        )?;

        // 5) depth buffer
        let factory = ResourceFactory::new(device, &ctx.info.memory);
        let aspect = if has_stencil(depth_format) {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        } else {
            vk::ImageAspectFlags::DEPTH
        };
        self.depth = factory.create_image_with_view(
            self.extent,
            depth_format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            aspect,
            ResourceOwner::Swapchain,
        )?;

        // 6) descriptors, frames, flight slots
        self.descriptor_pool = create_descriptor_pool(device, self.images.len() as u32)?;
        let targets = FrameTargets {
            images: &self.images,
            format: self.format.format,
            extent: self.extent,
            render_pass: self.render_pass,
            depth_view: self.depth.view,
            set_layout: self.set_layout,
            descriptor_pool: self.descriptor_pool,
        };
        self.frames = FramePool::new(
            &factory,
            ctx.families.graphics,
            &targets,
            UniformLayout::new(ctx.info.min_uniform_alignment()),
        )?;
        self.sync = SyncController::new(device, req.flight_slots)?;
        Ok(())
    }

    /// Destroys every dependent object and hands back the raw chain so it can
    /// be passed as `old_swapchain`.
    unsafe fn retire(&mut self, device: &ash::Device) -> vk::SwapchainKHR {
        self.sync.destroy(device);
        self.frames.destroy(device);
        device.destroy_descriptor_pool(self.descriptor_pool, None);
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.pipeline_layout, None);
        device.destroy_descriptor_set_layout(self.set_layout, None);
        device.destroy_render_pass(self.render_pass, None);
        std::mem::take(&mut self.depth).destroy(device);
        self.descriptor_pool = vk::DescriptorPool::null();
        self.pipeline = vk::Pipeline::null();
        self.pipeline_layout = vk::PipelineLayout::null();
        self.set_layout = vk::DescriptorSetLayout::null();
        self.render_pass = vk::RenderPass::null();
        self.images.clear();
        std::mem::replace(&mut self.swapchain, vk::SwapchainKHR::null())
    }

    /// Caller guarantees the device is idle.
    pub unsafe fn destroy(mut self, ctx: &DeviceContext) {
        let chain = self.retire(&ctx.device);
        ctx.swapchain_loader.destroy_swapchain(chain, None);
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}
