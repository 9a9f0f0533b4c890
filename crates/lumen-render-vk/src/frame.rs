// SPDX-License-Identifier: CEPL-1.0
//! One [`Frame`] per swapchain image; all of them live and die with the swapchain.
use std::collections::HashSet;

use ash::vk;
use lumen_math::{CameraBlock, LightBlock};

use crate::error::{VkCall, VkError};
use crate::pipeline::{flipped_viewport, MAX_TEXTURES};
use crate::resource::{align_up, Buffer, ResourceFactory, ResourceOwner};

/// Placement of the two uniform blocks inside a frame's uniform buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UniformLayout {
    pub camera_offset: u64,
    pub light_offset: u64,
    pub size: u64,
}

impl UniformLayout {
    pub fn new(min_alignment: u64) -> Self {
        let camera = std::mem::size_of::<CameraBlock>() as u64;
        let light_offset = align_up(camera, min_alignment);
        Self {
            camera_offset: 0,
            light_offset,
            size: light_offset + std::mem::size_of::<LightBlock>() as u64,
        }
    }
}

/// Per-image bundle. `fence` is created signalled so the first wait passes.
pub struct Frame {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub framebuffer: vk::Framebuffer,
    pub command_buffer: vk::CommandBuffer,
    pub fence: vk::Fence,
    pub uniform: Buffer,
    pub descriptor_set: vk::DescriptorSet,
}

/// Pass-level parameters shared by every frame of a generation.
#[derive(Clone, Copy)]
pub struct PassTarget {
    pub render_pass: vk::RenderPass,
    pub extent: vk::Extent2D,
    pub clear_color: [f32; 4],
}

impl Frame {
    pub unsafe fn wait(&self, device: &ash::Device) -> Result<(), VkError> {
        device
            .wait_for_fences(&[self.fence], true, u64::MAX)
            .call("vkWaitForFences")
    }

    /// The only point where the CPU may take a command buffer back from the GPU.
    pub unsafe fn wait_and_reset(&self, device: &ash::Device) -> Result<(), VkError> {
        self.wait(device)?;
        device.reset_fences(&[self.fence]).call("vkResetFences")?;
        device
            .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())
            .call("vkResetCommandBuffer")
    }

    pub unsafe fn begin_recording(&self, device: &ash::Device) -> Result<(), VkError> {
        let bi = vk::CommandBufferBeginInfo {
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        device
            .begin_command_buffer(self.command_buffer, &bi)
            .call("vkBeginCommandBuffer")
    }

    /// Viewport and scissor match `target.extent` until [`Frame::end_render_pass`].
    pub unsafe fn begin_render_pass(&self, device: &ash::Device, target: &PassTarget) {
        let cmd = self.command_buffer;
        let clears = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: target.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];
        let area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: target.extent,
        };
        let rp_begin = vk::RenderPassBeginInfo {
            render_pass: target.render_pass,
            framebuffer: self.framebuffer,
            render_area: area,
            clear_value_count: clears.len() as u32,
            p_clear_values: clears.as_ptr(),
            ..Default::default()
        };
        device.cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE);
        device.cmd_set_viewport(cmd, 0, &[flipped_viewport(target.extent)]);
        device.cmd_set_scissor(cmd, 0, &[area]);
    }

    pub unsafe fn end_render_pass(&self, device: &ash::Device) {
        device.cmd_end_render_pass(self.command_buffer);
    }

    pub unsafe fn end_recording(&self, device: &ash::Device) -> Result<(), VkError> {
        device
            .end_command_buffer(self.command_buffer)
            .call("vkEndCommandBuffer")
    }

    pub unsafe fn write_uniforms(
        &self,
        device: &ash::Device,
        layout: &UniformLayout,
        camera: &CameraBlock,
        light: &LightBlock,
    ) -> Result<(), VkError> {
        self.uniform
            .write(device, layout.camera_offset, bytemuck::bytes_of(camera))?;
        self.uniform
            .write(device, layout.light_offset, bytemuck::bytes_of(light))
    }

    /// Bindings 0 and 2.
    unsafe fn write_uniform_descriptors(&self, device: &ash::Device, layout: &UniformLayout) {
        let camera = vk::DescriptorBufferInfo {
            buffer: self.uniform.handle,
            offset: layout.camera_offset,
            range: std::mem::size_of::<CameraBlock>() as u64,
        };
        let light = vk::DescriptorBufferInfo {
            buffer: self.uniform.handle,
            offset: layout.light_offset,
            range: std::mem::size_of::<LightBlock>() as u64,
        };
        let writes = [
            vk::WriteDescriptorSet {
                dst_set: self.descriptor_set,
                dst_binding: 0,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                p_buffer_info: &camera,
                ..Default::default()
            },
            vk::WriteDescriptorSet {
                dst_set: self.descriptor_set,
                dst_binding: 2,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                p_buffer_info: &light,
                ..Default::default()
            },
        ];
        device.update_descriptor_sets(&writes, &[]);
    }

    /// Bindings 1 (full texture table) and 3 (materials).
    pub unsafe fn write_scene_descriptors(
        &self,
        device: &ash::Device,
        textures: &[vk::DescriptorImageInfo; MAX_TEXTURES as usize],
        materials: vk::Buffer,
    ) {
        let material_info = vk::DescriptorBufferInfo {
            buffer: materials,
            offset: 0,
            range: vk::WHOLE_SIZE,
        };
        let writes = [
            vk::WriteDescriptorSet {
                dst_set: self.descriptor_set,
                dst_binding: 1,
                descriptor_count: MAX_TEXTURES,
                descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                p_image_info: textures.as_ptr(),
                ..Default::default()
            },
            vk::WriteDescriptorSet {
                dst_set: self.descriptor_set,
                dst_binding: 3,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
                p_buffer_info: &material_info,
                ..Default::default()
            },
        ];
        device.update_descriptor_sets(&writes, &[]);
    }

    unsafe fn destroy(self, device: &ash::Device) {
        device.destroy_fence(self.fence, None);
        device.destroy_framebuffer(self.framebuffer, None);
        device.destroy_image_view(self.view, None);
        self.uniform.destroy(device);
    }
}

/// Swapchain-derived inputs needed to build the frames.
pub struct FrameTargets<'a> {
    pub images: &'a [vk::Image],
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub render_pass: vk::RenderPass,
    pub depth_view: vk::ImageView,
    pub set_layout: vk::DescriptorSetLayout,
    pub descriptor_pool: vk::DescriptorPool,
}

/// Per-image handles drawn from the pools before a frame is built around them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameSeed {
    pub image: vk::Image,
    pub command_buffer: vk::CommandBuffer,
    pub descriptor_set: vk::DescriptorSet,
}

pub fn all_distinct<H: vk::Handle + Copy>(handles: impl IntoIterator<Item = H>) -> bool {
    let mut seen = HashSet::new();
    handles.into_iter().all(|h| seen.insert(h.as_raw()))
}

fn frame_alloc_err(call: &'static str) -> VkError {
    VkError::Command {
        call,
        result: vk::Result::ERROR_INITIALIZATION_FAILED,
    }
}

/// Pairs image `i` with command buffer `i` and set `i`. Every image must get
/// its own command buffer and descriptor set.
pub fn seed_frames(
    images: &[vk::Image],
    command_buffers: &[vk::CommandBuffer],
    sets: &[vk::DescriptorSet],
) -> Result<Vec<FrameSeed>, VkError> {
    if command_buffers.len() != images.len() || !all_distinct(command_buffers.iter().copied()) {
        return Err(frame_alloc_err("vkAllocateCommandBuffers"));
    }
    if sets.len() != images.len() || !all_distinct(sets.iter().copied()) {
        return Err(frame_alloc_err("vkAllocateDescriptorSets"));
    }
    Ok(images
        .iter()
        .zip(command_buffers)
        .zip(sets)
        .map(|((&image, &command_buffer), &descriptor_set)| FrameSeed {
            image,
            command_buffer,
            descriptor_set,
        })
        .collect())
}

pub struct FramePool {
    command_pool: vk::CommandPool,
    frames: Vec<Frame>,
    pub uniform_layout: UniformLayout,
}

impl FramePool {
    pub fn empty() -> Self {
        Self {
            command_pool: vk::CommandPool::null(),
            frames: Vec::new(),
            uniform_layout: UniformLayout::new(1),
        }
    }

    /// Exactly one frame per image in `targets.images`.
    pub unsafe fn new(
        factory: &ResourceFactory<'_>,
        graphics_family: u32,
        targets: &FrameTargets<'_>,
        uniform_layout: UniformLayout,
    ) -> Result<Self, VkError> {
        let device = factory.device();
        let ci = vk::CommandPoolCreateInfo {
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            queue_family_index: graphics_family,
            ..Default::default()
        };
        let command_pool = device
            .create_command_pool(&ci, None)
            .call("vkCreateCommandPool")?;
        let mut pool = Self {
            command_pool,
            frames: Vec::with_capacity(targets.images.len()),
            uniform_layout,
        };
        if let Err(e) = pool.populate(factory, targets) {
            pool.destroy(device);
            return Err(e);
        }
        Ok(pool)
    }

    unsafe fn populate(
        &mut self,
        factory: &ResourceFactory<'_>,
        targets: &FrameTargets<'_>,
    ) -> Result<(), VkError> {
        let device = factory.device();
        let count = targets.images.len() as u32;

        let ai = vk::CommandBufferAllocateInfo {
            command_pool: self.command_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: count,
            ..Default::default()
        };
        let command_buffers = device
            .allocate_command_buffers(&ai)
            .call("vkAllocateCommandBuffers")?;

        let layouts = vec![targets.set_layout; targets.images.len()];
        let si = vk::DescriptorSetAllocateInfo {
            descriptor_pool: targets.descriptor_pool,
            descriptor_set_count: count,
            p_set_layouts: layouts.as_ptr(),
            ..Default::default()
        };
        let sets = device
            .allocate_descriptor_sets(&si)
            .call("vkAllocateDescriptorSets")?;

        for (i, seed) in seed_frames(targets.images, &command_buffers, &sets)?
            .into_iter()
            .enumerate()
        {
            let view =
                factory.create_image_view(seed.image, targets.format, vk::ImageAspectFlags::COLOR)?;
            let mut frame = Frame {
                image: seed.image,
                view,
                framebuffer: vk::Framebuffer::null(),
                command_buffer: seed.command_buffer,
                fence: vk::Fence::null(),
                uniform: Buffer::default(),
                descriptor_set: seed.descriptor_set,
            };
            let built = self.finish_frame(factory, targets, &mut frame, i);
            if let Err(e) = built {
                frame.destroy(device);
                return Err(e);
            }
            frame.write_uniform_descriptors(device, &self.uniform_layout);
            self.frames.push(frame);
        }
        if !all_distinct(self.frames.iter().map(|f| f.fence)) {
            return Err(frame_alloc_err("vkCreateFence"));
        }
        Ok(())
    }

    unsafe fn finish_frame(
        &self,
        factory: &ResourceFactory<'_>,
        targets: &FrameTargets<'_>,
        frame: &mut Frame,
        index: usize,
    ) -> Result<(), VkError> {
        let device = factory.device();
        let attachments = [frame.view, targets.depth_view];
        let fb_ci = vk::FramebufferCreateInfo {
            render_pass: targets.render_pass,
            attachment_count: attachments.len() as u32,
            p_attachments: attachments.as_ptr(),
            width: targets.extent.width,
            height: targets.extent.height,
            layers: 1,
            ..Default::default()
        };
        frame.framebuffer = device
            .create_framebuffer(&fb_ci, None)
            .call("vkCreateFramebuffer")?;

        let fence_ci = vk::FenceCreateInfo {
            flags: vk::FenceCreateFlags::SIGNALED,
            ..Default::default()
        };
        frame.fence = device.create_fence(&fence_ci, None).call("vkCreateFence")?;

        frame.uniform = factory.create_buffer(
            self.uniform_layout.size,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            ResourceOwner::Frame(index),
        )?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Frame> {
        self.frames.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }

    /// Descriptor sets go back with their pool, which the swapchain owns.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for frame in self.frames.drain(..) {
            frame.destroy(device);
        }
        device.destroy_command_pool(self.command_pool, None);
        self.command_pool = vk::CommandPool::null();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn light_block_starts_on_an_aligned_offset() {
        let layout = UniformLayout::new(256);
        assert_eq!(layout.camera_offset, 0);
        assert_eq!(layout.light_offset, 512);
        assert_eq!(layout.size, 512 + 48);
    }

    fn handles<H: vk::Handle>(raw: &[u64]) -> Vec<H> {
        raw.iter().map(|&r| H::from_raw(r)).collect()
    }

    #[test]
    fn one_seed_per_image_with_its_own_command_buffer() {
        let images: Vec<vk::Image> = handles(&[1, 2, 3]);
        let cmds: Vec<vk::CommandBuffer> = handles(&[10, 20, 30]);
        let sets: Vec<vk::DescriptorSet> = handles(&[7, 8, 9]);
        let seeds = seed_frames(&images, &cmds, &sets).unwrap();
        assert_eq!(seeds.len(), images.len());
        for (i, seed) in seeds.iter().enumerate() {
            assert_eq!(seed.image, images[i]);
            assert_eq!(seed.command_buffer, cmds[i]);
            assert_eq!(seed.descriptor_set, sets[i]);
        }
        assert!(all_distinct(seeds.iter().map(|s| s.command_buffer)));
    }

    #[test]
    fn short_or_shared_allocations_are_rejected() {
        let images: Vec<vk::Image> = handles(&[1, 2, 3]);
        let sets: Vec<vk::DescriptorSet> = handles(&[7, 8, 9]);
        let short: Vec<vk::CommandBuffer> = handles(&[10, 20]);
        let shared: Vec<vk::CommandBuffer> = handles(&[10, 20, 10]);
        for cmds in [short, shared] {
            match seed_frames(&images, &cmds, &sets) {
                Err(VkError::Command { call, .. }) => assert_eq!(call, "vkAllocateCommandBuffers"),
                other => panic!("unexpected {other:?}"),
            }
        }
        let cmds: Vec<vk::CommandBuffer> = handles(&[10, 20, 30]);
        let one_set: Vec<vk::DescriptorSet> = handles(&[7, 7, 7]);
        assert!(seed_frames(&images, &cmds, &one_set).is_err());
        assert!(seed_frames(&[], &[], &[]).unwrap().is_empty());
    }

    #[test]
    fn repeated_fences_are_detected() {
        let fences: Vec<vk::Fence> = handles(&[4, 5, 6]);
        assert!(all_distinct(fences.iter().copied()));
        let repeated: Vec<vk::Fence> = handles(&[4, 5, 4]);
        assert!(!all_distinct(repeated));
    }

    #[test]
    fn small_alignment_packs_blocks_tightly() {
        let layout = UniformLayout::new(16);
        assert_eq!(layout.light_offset, std::mem::size_of::<CameraBlock>() as u64);
        assert_eq!(layout.light_offset % 16, 0);
    }
}
