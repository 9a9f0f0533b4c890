// SPDX-License-Identifier: CEPL-1.0
//! Uploads on the transfer queue followed by the release/acquire ownership
//! handshake that hands the destination to the graphics queue.
use ash::prelude::VkResult;
use ash::vk;
use tracing::debug;

use crate::device::{DeviceContext, QueueFamilies};
use crate::error::{VkCall, VkError};
use crate::resource::{Buffer, Image, ResourceFactory, ResourceOwner, ScopedBuffer};

/// How the graphics queue reads the uploaded resource first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumerAccess {
    /// Vertex + index fetch.
    VertexInput,
    /// Combined image sampler read in the fragment shader.
    FragmentSampled,
    /// Storage/uniform buffer read in the fragment shader.
    FragmentStorage,
}

impl ConsumerAccess {
    pub fn dst_access(self) -> vk::AccessFlags {
        match self {
            Self::VertexInput => vk::AccessFlags::VERTEX_ATTRIBUTE_READ | vk::AccessFlags::INDEX_READ,
            Self::FragmentSampled => vk::AccessFlags::SHADER_READ,
            Self::FragmentStorage => vk::AccessFlags::SHADER_READ | vk::AccessFlags::UNIFORM_READ,
        }
    }

    pub fn dst_stage(self) -> vk::PipelineStageFlags {
        match self {
            Self::VertexInput => vk::PipelineStageFlags::VERTEX_INPUT,
            Self::FragmentSampled | Self::FragmentStorage => vk::PipelineStageFlags::FRAGMENT_SHADER,
        }
    }
}

/// Family pair written into barriers; equal families collapse to IGNORED.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handoff {
    pub src_family: u32,
    pub dst_family: u32,
}

impl Handoff {
    pub fn new(src_family: u32, dst_family: u32) -> Self {
        if src_family == dst_family {
            Self {
                src_family: vk::QUEUE_FAMILY_IGNORED,
                dst_family: vk::QUEUE_FAMILY_IGNORED,
            }
        } else {
            Self {
                src_family,
                dst_family,
            }
        }
    }

    pub fn crosses_families(&self) -> bool {
        self.src_family != self.dst_family
    }
}

fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Transfer-queue half: drops ownership, destination access is none.
pub fn buffer_release_barrier(buffer: vk::Buffer, handoff: Handoff) -> vk::BufferMemoryBarrier<'static> {
    vk::BufferMemoryBarrier {
        src_access_mask: vk::AccessFlags::TRANSFER_WRITE,
        dst_access_mask: vk::AccessFlags::empty(),
        src_queue_family_index: handoff.src_family,
        dst_queue_family_index: handoff.dst_family,
        buffer,
        offset: 0,
        size: vk::WHOLE_SIZE,
        ..Default::default()
    }
}

/// Graphics-queue half: source access 0, destination access of the real consumer.
pub fn buffer_acquire_barrier(
    buffer: vk::Buffer,
    handoff: Handoff,
    access: ConsumerAccess,
) -> vk::BufferMemoryBarrier<'static> {
    vk::BufferMemoryBarrier {
        src_access_mask: vk::AccessFlags::empty(),
        dst_access_mask: access.dst_access(),
        src_queue_family_index: handoff.src_family,
        dst_queue_family_index: handoff.dst_family,
        buffer,
        offset: 0,
        size: vk::WHOLE_SIZE,
        ..Default::default()
    }
}

pub fn image_to_transfer_dst(image: vk::Image) -> vk::ImageMemoryBarrier<'static> {
    vk::ImageMemoryBarrier {
        src_access_mask: vk::AccessFlags::empty(),
        dst_access_mask: vk::AccessFlags::TRANSFER_WRITE,
        old_layout: vk::ImageLayout::UNDEFINED,
        new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        image,
        subresource_range: color_range(),
        ..Default::default()
    }
}

/// Release also performs the TRANSFER_DST -> SHADER_READ_ONLY transition.
pub fn image_release_barrier(image: vk::Image, handoff: Handoff) -> vk::ImageMemoryBarrier<'static> {
    vk::ImageMemoryBarrier {
        src_access_mask: vk::AccessFlags::TRANSFER_WRITE,
        dst_access_mask: vk::AccessFlags::empty(),
        old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        src_queue_family_index: handoff.src_family,
        dst_queue_family_index: handoff.dst_family,
        image,
        subresource_range: color_range(),
        ..Default::default()
    }
}

/// Must repeat the release transition when crossing families. Within one family
/// the layout change already happened, so only the memory dependency remains.
pub fn image_acquire_barrier(
    image: vk::Image,
    handoff: Handoff,
    access: ConsumerAccess,
) -> vk::ImageMemoryBarrier<'static> {
    let old_layout = if handoff.crosses_families() {
        vk::ImageLayout::TRANSFER_DST_OPTIMAL
    } else {
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    };
    vk::ImageMemoryBarrier {
        src_access_mask: vk::AccessFlags::empty(),
        dst_access_mask: access.dst_access(),
        old_layout,
        new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        src_queue_family_index: handoff.src_family,
        dst_queue_family_index: handoff.dst_family,
        image,
        subresource_range: color_range(),
        ..Default::default()
    }
}

pub enum Destination<'a> {
    Buffer(&'a mut Buffer),
    /// RGBA8 pixels tightly packed to `extent`.
    Image(&'a mut Image),
}

fn upload_err(stage: &'static str) -> impl Fn(vk::Result) -> VkError {
    move |result| VkError::Upload { stage, result }
}

/// `Ok(false)` when there is nothing to copy. An image has to be filled
/// completely, otherwise it would be handed over still `UNDEFINED`.
fn has_payload(data: &[u8], dest: &Destination<'_>) -> Result<bool, VkError> {
    match dest {
        Destination::Buffer(_) => Ok(!data.is_empty()),
        Destination::Image(img) => {
            let expected = u64::from(img.extent.width) * u64::from(img.extent.height) * 4;
            if expected == 0 || data.len() as u64 != expected {
                return Err(upload_err("image payload size")(
                    vk::Result::ERROR_FORMAT_NOT_SUPPORTED,
                ));
            }
            Ok(true)
        }
    }
}

/// Both waits have already run; the transfer error wins when both failed.
fn drained(transfer: VkResult<()>, graphics: VkResult<()>) -> Result<(), VkError> {
    transfer.and(graphics).map_err(upload_err("queue wait idle"))
}

/// One-shot primary command buffer freed back to its pool on drop.
struct ScopedCommands<'a> {
    device: &'a ash::Device,
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
}

impl<'a> ScopedCommands<'a> {
    unsafe fn begin(device: &'a ash::Device, pool: vk::CommandPool) -> Result<Self, VkError> {
        let ai = vk::CommandBufferAllocateInfo {
            command_pool: pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        let cmd = device
            .allocate_command_buffers(&ai)
            .map_err(upload_err("allocate command buffer"))?[0];
        let scoped = Self { device, pool, cmd };
        let bi = vk::CommandBufferBeginInfo {
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        device
            .begin_command_buffer(cmd, &bi)
            .map_err(upload_err("begin command buffer"))?;
        Ok(scoped)
    }
}

impl Drop for ScopedCommands<'_> {
    fn drop(&mut self) {
        unsafe { self.device.free_command_buffers(self.pool, &[self.cmd]) };
    }
}

struct ScopedSemaphore<'a> {
    device: &'a ash::Device,
    handle: vk::Semaphore,
}

impl Drop for ScopedSemaphore<'_> {
    fn drop(&mut self) {
        unsafe { self.device.destroy_semaphore(self.handle, None) };
    }
}

/// Owns the transient pools used for uploads on both sides of the handshake.
pub struct TransferCoordinator {
    transfer_pool: vk::CommandPool,
    graphics_pool: vk::CommandPool,
    transfer_queue: vk::Queue,
    graphics_queue: vk::Queue,
    families: QueueFamilies,
}

impl TransferCoordinator {
    pub unsafe fn new(ctx: &DeviceContext) -> Result<Self, VkError> {
        let make_pool = |family: u32| {
            let ci = vk::CommandPoolCreateInfo {
                flags: vk::CommandPoolCreateFlags::TRANSIENT,
                queue_family_index: family,
                ..Default::default()
            };
            ctx.device.create_command_pool(&ci, None).call("vkCreateCommandPool")
        };
        let transfer_pool = make_pool(ctx.families.transfer)?;
        let graphics_pool = match make_pool(ctx.families.graphics) {
            Ok(p) => p,
            Err(e) => {
                ctx.device.destroy_command_pool(transfer_pool, None);
                return Err(e);
            }
        };
        Ok(Self {
            transfer_pool,
            graphics_pool,
            transfer_queue: ctx.transfer_queue,
            graphics_queue: ctx.graphics_queue,
            families: ctx.families,
        })
    }

    pub fn handoff(&self) -> Handoff {
        Handoff::new(self.families.transfer, self.families.graphics)
    }

    /// Blocks until both queues are idle; the destination is owned by the
    /// graphics family afterwards.
    pub unsafe fn upload_and_transfer(
        &self,
        factory: &ResourceFactory<'_>,
        data: &[u8],
        dest: Destination<'_>,
        access: ConsumerAccess,
    ) -> Result<(), VkError> {
        if !has_payload(data, &dest)? {
            return Ok(());
        }
        let device = factory.device();
        let staging = ScopedBuffer::new(
            device,
            factory.create_buffer(
                data.len() as u64,
                vk::BufferUsageFlags::TRANSFER_SRC,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                ResourceOwner::Transfer,
            )?,
        );
        if let Some(b) = staging.get() {
            b.write(device, 0, data).map_err(|e| match e {
                VkError::Command { result, .. } => VkError::Upload {
                    stage: "write staging",
                    result,
                },
                other => other,
            })?;
        }

        let handoff = self.handoff();
        let copy = ScopedCommands::begin(device, self.transfer_pool)?;
        let acquire = ScopedCommands::begin(device, self.graphics_pool)?;

        match &dest {
            Destination::Buffer(buf) => {
                let region = vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: data.len() as u64,
                };
                device.cmd_copy_buffer(copy.cmd, staging.handle(), buf.handle, &[region]);
                device.cmd_pipeline_barrier(
                    copy.cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[buffer_release_barrier(buf.handle, handoff)],
                    &[],
                );
                device.cmd_pipeline_barrier(
                    acquire.cmd,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    access.dst_stage(),
                    vk::DependencyFlags::empty(),
                    &[],
                    &[buffer_acquire_barrier(buf.handle, handoff, access)],
                    &[],
                );
            }
            Destination::Image(img) => {
                device.cmd_pipeline_barrier(
                    copy.cmd,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[image_to_transfer_dst(img.handle)],
                );
                let region = vk::BufferImageCopy {
                    buffer_offset: 0,
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    image_offset: vk::Offset3D::default(),
                    image_extent: vk::Extent3D {
                        width: img.extent.width,
                        height: img.extent.height,
                        depth: 1,
                    },
                };
                device.cmd_copy_buffer_to_image(
                    copy.cmd,
                    staging.handle(),
                    img.handle,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
                device.cmd_pipeline_barrier(
                    copy.cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[image_release_barrier(img.handle, handoff)],
                );
                device.cmd_pipeline_barrier(
                    acquire.cmd,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    access.dst_stage(),
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[image_acquire_barrier(img.handle, handoff, access)],
                );
            }
        }

        device
            .end_command_buffer(copy.cmd)
            .map_err(upload_err("end transfer commands"))?;
        device
            .end_command_buffer(acquire.cmd)
            .map_err(upload_err("end acquire commands"))?;

        let handle = device
            .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
            .map_err(upload_err("create handoff semaphore"))?;
        let handoff_sem = ScopedSemaphore { device, handle };

        let submitted = self.submit_pair(device, copy.cmd, acquire.cmd, handoff_sem.handle);
        // Staging and command buffers are only released once both queues drained.
        let transfer_idle = device.queue_wait_idle(self.transfer_queue);
        let graphics_idle = device.queue_wait_idle(self.graphics_queue);
        submitted?;
        drained(transfer_idle, graphics_idle)?;

        match dest {
            Destination::Buffer(buf) => buf.owner_family = Some(self.families.graphics),
            Destination::Image(img) => img.owner_family = Some(self.families.graphics),
        }
        debug!("uploaded {} bytes ({access:?}, {handoff:?})", data.len());
        Ok(())
    }

    /// Release is submitted first; the acquire submission waits on its semaphore.
    unsafe fn submit_pair(
        &self,
        device: &ash::Device,
        release_cmd: vk::CommandBuffer,
        acquire_cmd: vk::CommandBuffer,
        handoff: vk::Semaphore,
    ) -> Result<(), VkError> {
        let release = vk::SubmitInfo {
            command_buffer_count: 1,
            p_command_buffers: &release_cmd,
            signal_semaphore_count: 1,
            p_signal_semaphores: &handoff,
            ..Default::default()
        };
        device
            .queue_submit(self.transfer_queue, &[release], vk::Fence::null())
            .map_err(upload_err("submit transfer"))?;

        let wait_stage = vk::PipelineStageFlags::ALL_COMMANDS;
        let acquire = vk::SubmitInfo {
            wait_semaphore_count: 1,
            p_wait_semaphores: &handoff,
            p_wait_dst_stage_mask: &wait_stage,
            command_buffer_count: 1,
            p_command_buffers: &acquire_cmd,
            ..Default::default()
        };
        device
            .queue_submit(self.graphics_queue, &[acquire], vk::Fence::null())
            .map_err(upload_err("submit acquire"))
    }

    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        device.destroy_command_pool(self.transfer_pool, None);
        device.destroy_command_pool(self.graphics_pool, None);
        self.transfer_pool = vk::CommandPool::null();
        self.graphics_pool = vk::CommandPool::null();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_drops_access_and_acquire_restores_it() {
        let h = Handoff::new(2, 0);
        let rel = buffer_release_barrier(vk::Buffer::null(), h);
        assert_eq!(rel.dst_access_mask, vk::AccessFlags::empty());
        assert_eq!((rel.src_queue_family_index, rel.dst_queue_family_index), (2, 0));

        for access in [ConsumerAccess::VertexInput, ConsumerAccess::FragmentSampled] {
            let acq = buffer_acquire_barrier(vk::Buffer::null(), h, access);
            assert_eq!(acq.src_access_mask, vk::AccessFlags::empty());
            assert_eq!(acq.dst_access_mask, access.dst_access());
            assert_eq!(
                (acq.src_queue_family_index, acq.dst_queue_family_index),
                (rel.src_queue_family_index, rel.dst_queue_family_index)
            );
        }
    }

    #[test]
    fn access_mask_follows_the_consumer() {
        assert!(ConsumerAccess::VertexInput
            .dst_access()
            .contains(vk::AccessFlags::VERTEX_ATTRIBUTE_READ | vk::AccessFlags::INDEX_READ));
        assert_eq!(ConsumerAccess::VertexInput.dst_stage(), vk::PipelineStageFlags::VERTEX_INPUT);
        assert_eq!(ConsumerAccess::FragmentSampled.dst_access(), vk::AccessFlags::SHADER_READ);
        assert_eq!(
            ConsumerAccess::FragmentSampled.dst_stage(),
            vk::PipelineStageFlags::FRAGMENT_SHADER
        );
        assert!(!ConsumerAccess::FragmentSampled
            .dst_access()
            .contains(vk::AccessFlags::VERTEX_ATTRIBUTE_READ));
    }

    #[test]
    fn shared_family_collapses_to_ignored() {
        let h = Handoff::new(1, 1);
        assert!(!h.crosses_families());
        assert_eq!(h.src_family, vk::QUEUE_FAMILY_IGNORED);
        let acq = image_acquire_barrier(vk::Image::null(), h, ConsumerAccess::FragmentSampled);
        assert_eq!(acq.old_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(acq.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    fn image(width: u32, height: u32) -> Image {
        Image {
            extent: vk::Extent2D { width, height },
            ..Default::default()
        }
    }

    #[test]
    fn empty_buffer_upload_is_a_no_op() {
        let mut buf = Buffer::default();
        assert!(!has_payload(&[], &Destination::Buffer(&mut buf)).unwrap());
        assert!(has_payload(&[1, 2, 3, 4], &Destination::Buffer(&mut buf)).unwrap());
    }

    #[test]
    fn image_upload_needs_every_texel() {
        let mut empty = image(0, 0);
        let err = has_payload(&[], &Destination::Image(&mut empty)).unwrap_err();
        assert!(matches!(err, VkError::Upload { stage: "image payload size", .. }));

        let mut img = image(2, 2);
        assert!(has_payload(&[0; 16], &Destination::Image(&mut img)).unwrap());
        assert!(has_payload(&[], &Destination::Image(&mut img)).is_err());
        assert!(has_payload(&[0; 12], &Destination::Image(&mut img)).is_err());
    }

    #[test]
    fn either_queue_failing_to_drain_is_reported() {
        let lost = vk::Result::ERROR_DEVICE_LOST;
        assert!(drained(Ok(()), Ok(())).is_ok());
        for (t, g) in [(Err(lost), Ok(())), (Ok(()), Err(lost))] {
            match drained(t, g) {
                Err(VkError::Upload { stage, result }) => {
                    assert_eq!((stage, result), ("queue wait idle", lost))
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        let both = drained(Err(lost), Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY));
        assert!(matches!(both, Err(VkError::Upload { result, .. }) if result == lost));
    }

    #[test]
    fn cross_family_image_barriers_repeat_the_transition() {
        let h = Handoff::new(2, 0);
        let rel = image_release_barrier(vk::Image::null(), h);
        let acq = image_acquire_barrier(vk::Image::null(), h, ConsumerAccess::FragmentSampled);
        assert_eq!(rel.old_layout, acq.old_layout);
        assert_eq!(rel.new_layout, acq.new_layout);
        assert_eq!(acq.dst_access_mask, vk::AccessFlags::SHADER_READ);
        assert_eq!(image_to_transfer_dst(vk::Image::null()).new_layout, rel.old_layout);
    }
}
