// SPDX-License-Identifier: CEPL-1.0
use ash::vk;

use crate::error::VkError;

/// UI drawn on top of the scene.
///
/// `record` runs inside the active render pass after every scene draw; viewport
/// and scissor already cover `extent`. Implementations bind their own pipeline.
pub trait OverlayRecorder {
    fn record(
        &mut self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        extent: vk::Extent2D,
    ) -> Result<(), VkError>;

    /// Called after the swapchain (and render pass) was rebuilt.
    fn on_swapchain_rebuilt(&mut self, _render_pass: vk::RenderPass, _image_count: usize) {}

    /// Releases GPU objects; the device is idle and still alive.
    fn destroy(&mut self, _device: &ash::Device) {}
}

const PULSE_SIZE: u32 = 16;
const PULSE_MARGIN: u32 = 8;

/// Square in the top-left corner, or `None` when the surface is too small for it.
pub fn pulse_rect(extent: vk::Extent2D) -> Option<vk::Rect2D> {
    let span = PULSE_SIZE + PULSE_MARGIN;
    if extent.width < span || extent.height < span {
        return None;
    }
    Some(vk::Rect2D {
        offset: vk::Offset2D {
            x: PULSE_MARGIN as i32,
            y: PULSE_MARGIN as i32,
        },
        extent: vk::Extent2D {
            width: PULSE_SIZE,
            height: PULSE_SIZE,
        },
    })
}

pub fn pulse_color(frame: u64) -> [f32; 4] {
    if frame % 2 == 0 {
        [1.0, 0.8, 0.1, 1.0]
    } else {
        [0.1, 0.2, 0.9, 1.0]
    }
}

/// Corner square that flips colour on every recorded frame. A frame that is
/// recorded but never presented shows up as a square stuck on one colour.
///
/// Clears through `vkCmdClearAttachments`, so it needs no pipeline of its own.
#[derive(Debug, Default)]
pub struct FramePulse {
    frame: u64,
}

impl OverlayRecorder for FramePulse {
    fn record(
        &mut self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        extent: vk::Extent2D,
    ) -> Result<(), VkError> {
        let color = pulse_color(self.frame);
        self.frame = self.frame.wrapping_add(1);
        let Some(rect) = pulse_rect(extent) else {
            return Ok(());
        };
        let attachment = vk::ClearAttachment {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            color_attachment: 0,
            clear_value: vk::ClearValue {
                color: vk::ClearColorValue { float32: color },
            },
        };
        let region = vk::ClearRect {
            rect,
            base_array_layer: 0,
            layer_count: 1,
        };
        unsafe { device.cmd_clear_attachments(cmd, &[attachment], &[region]) };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn pulse_stays_inside_the_surface() {
        let rect = pulse_rect(extent(640, 480)).unwrap();
        assert_eq!((rect.offset.x, rect.offset.y), (8, 8));
        assert!(rect.offset.x as u32 + rect.extent.width <= 640);
        assert!(rect.offset.y as u32 + rect.extent.height <= 480);
        assert!(pulse_rect(extent(24, 24)).is_some());
    }

    #[test]
    fn tiny_surfaces_get_no_pulse() {
        assert!(pulse_rect(extent(23, 480)).is_none());
        assert!(pulse_rect(extent(640, 1)).is_none());
    }

    #[test]
    fn pulse_alternates_between_frames() {
        assert_ne!(pulse_color(0), pulse_color(1));
        assert_eq!(pulse_color(0), pulse_color(2));
        let boxed: Box<dyn OverlayRecorder> = Box::new(FramePulse::default());
        drop(boxed);
    }
}
