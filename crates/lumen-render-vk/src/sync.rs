// SPDX-License-Identifier: CEPL-1.0
use ash::khr::swapchain;
use ash::prelude::VkResult;
use ash::vk;

use crate::error::{VkCall, VkError};
use crate::frame::{Frame, FramePool};

/// Flight-slot cursor; advances once per submission regardless of image index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotRing {
    len: usize,
    index: usize,
}

impl SlotRing {
    pub fn new(len: usize) -> Self {
        Self {
            len: len.max(1),
            index: 0,
        }
    }

    pub fn current(&self) -> usize {
        self.index
    }

    /// Returns the slot the next frame will use.
    pub fn advance(&mut self) -> usize {
        self.index = (self.index + 1) % self.len;
        self.index
    }
}

/// Semaphore pair; never reused before the work it guards has finished.
pub struct FlightSlot {
    pub image_acquired: vk::Semaphore,
    pub render_complete: vk::Semaphore,
    /// Image whose frame last waited on `image_acquired`.
    last_image: Option<u32>,
}

/// SUBOPTIMAL counts as stale: the caller rebuilds and skips the frame.
pub fn classify_acquire(result: VkResult<(u32, bool)>) -> Result<u32, VkError> {
    match result {
        Ok((index, false)) => Ok(index),
        Ok((_, true)) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(VkError::SurfaceStale),
        Err(result) => Err(VkError::Command {
            call: "vkAcquireNextImageKHR",
            result,
        }),
    }
}

pub fn classify_present(result: VkResult<bool>) -> Result<(), VkError> {
    match result {
        Ok(false) => Ok(()),
        Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(VkError::SurfaceStale),
        Err(result) => Err(VkError::Command {
            call: "vkQueuePresentKHR",
            result,
        }),
    }
}

/// Recreated with each swapchain generation so no signalled-but-unwaited
/// acquire semaphore survives a rebuild.
pub struct SyncController {
    slots: Vec<FlightSlot>,
}

impl SyncController {
    pub unsafe fn new(device: &ash::Device, slot_count: usize) -> Result<Self, VkError> {
        let mut sync = Self {
            slots: Vec::with_capacity(slot_count.max(1)),
        };
        for _ in 0..slot_count.max(1) {
            let make = || {
                device
                    .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
                    .call("vkCreateSemaphore")
            };
            let slot = make().and_then(|a| match make() {
                Ok(r) => Ok((a, r)),
                Err(e) => {
                    device.destroy_semaphore(a, None);
                    Err(e)
                }
            });
            match slot {
                Ok((image_acquired, render_complete)) => sync.slots.push(FlightSlot {
                    image_acquired,
                    render_complete,
                    last_image: None,
                }),
                Err(e) => {
                    sync.destroy(device);
                    return Err(e);
                }
            }
        }
        Ok(sync)
    }

    pub fn empty() -> Self {
        Self { slots: Vec::new() }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Blocks until an image is available. Before reusing the slot's acquire
    /// semaphore, waits for the frame that last consumed it.
    pub unsafe fn acquire(
        &mut self,
        device: &ash::Device,
        loader: &swapchain::Device,
        swapchain: vk::SwapchainKHR,
        frames: &FramePool,
        slot: usize,
    ) -> Result<(u32, vk::Semaphore), VkError> {
        let s = &mut self.slots[slot];
        if let Some(frame) = s.last_image.and_then(|i| frames.get(i as usize)) {
            frame.wait(device)?;
        }
        let index = classify_acquire(loader.acquire_next_image(
            swapchain,
            u64::MAX,
            s.image_acquired,
            vk::Fence::null(),
        ))?;
        s.last_image = Some(index);
        Ok((index, s.image_acquired))
    }

    /// Signals the frame's fence and the slot's render-complete semaphore.
    pub unsafe fn submit(
        &self,
        device: &ash::Device,
        queue: vk::Queue,
        frame: &Frame,
        slot: usize,
    ) -> Result<(), VkError> {
        let s = &self.slots[slot];
        let wait_stage = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let submit = vk::SubmitInfo {
            wait_semaphore_count: 1,
            p_wait_semaphores: &s.image_acquired,
            p_wait_dst_stage_mask: &wait_stage,
            command_buffer_count: 1,
            p_command_buffers: &frame.command_buffer,
            signal_semaphore_count: 1,
            p_signal_semaphores: &s.render_complete,
            ..Default::default()
        };
        device
            .queue_submit(queue, &[submit], frame.fence)
            .call("vkQueueSubmit")
    }

    /// Waits on the slot's render-complete semaphore.
    pub unsafe fn present(
        &self,
        loader: &swapchain::Device,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image: u32,
        slot: usize,
    ) -> Result<(), VkError> {
        let s = &self.slots[slot];
        let present = vk::PresentInfoKHR {
            wait_semaphore_count: 1,
            p_wait_semaphores: &s.render_complete,
            swapchain_count: 1,
            p_swapchains: &swapchain,
            p_image_indices: &image,
            ..Default::default()
        };
        classify_present(loader.queue_present(queue, &present))
    }

    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for s in self.slots.drain(..) {
            device.destroy_semaphore(s.image_acquired, None);
            device.destroy_semaphore(s.render_complete, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_cycles_with_period_len() {
        for len in 1..=5 {
            let mut ring = SlotRing::new(len);
            let start = ring.current();
            let seen: Vec<usize> = (0..len).map(|_| ring.advance()).collect();
            assert_eq!(ring.current(), start, "len {len}");
            let mut sorted = seen.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, (0..len).collect::<Vec<_>>());
        }
    }

    #[test]
    fn zero_slots_clamps_to_one() {
        let mut ring = SlotRing::new(0);
        assert_eq!(ring.advance(), 0);
        assert_eq!(ring.advance(), 0);
        assert_eq!(ring.current(), 0);
    }

    #[test]
    fn stale_results_are_classified() {
        assert_eq!(classify_acquire(Ok((2, false))).unwrap(), 2);
        assert!(classify_acquire(Ok((2, true))).unwrap_err().is_stale());
        assert!(classify_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR))
            .unwrap_err()
            .is_stale());
        assert!(!classify_acquire(Err(vk::Result::ERROR_DEVICE_LOST))
            .unwrap_err()
            .is_stale());

        assert!(classify_present(Ok(false)).is_ok());
        assert!(classify_present(Ok(true)).unwrap_err().is_stale());
        assert!(classify_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR))
            .unwrap_err()
            .is_stale());
        assert!(!classify_present(Err(vk::Result::ERROR_SURFACE_LOST_KHR))
            .unwrap_err()
            .is_stale());
    }
}
