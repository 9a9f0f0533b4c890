// SPDX-License-Identifier: CEPL-1.0
//! Typed buffers/images with memory bound 1:1 at creation and freed exactly once.
use ash::vk;
use tracing::trace;

use crate::error::{VkCall, VkError};

/// Which component is responsible for destroying a resource.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResourceOwner {
    #[default]
    Context,
    Swapchain,
    Frame(usize),
    Transfer,
    Scene,
}

pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Result<u32, VkError> {
    (0..props.memory_type_count)
        .find(|&i| {
            type_bits & (1 << i) != 0
                && props.memory_types[i as usize].property_flags.contains(flags)
        })
        .ok_or(VkError::NoCompatibleMemoryType { type_bits, flags })
}

pub fn align_up(value: u64, alignment: u64) -> u64 {
    let a = alignment.max(1);
    value.div_ceil(a) * a
}

#[derive(Debug, Default)]
pub struct Buffer {
    pub handle: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: u64,
    pub owner: ResourceOwner,
    /// Queue family currently holding ownership; `None` until first use.
    pub owner_family: Option<u32>,
}

impl Buffer {
    /// Host-visible only. Copies `bytes` at `offset` through a transient mapping.
    pub unsafe fn write(&self, device: &ash::Device, offset: u64, bytes: &[u8]) -> Result<(), VkError> {
        debug_assert!(offset + bytes.len() as u64 <= self.size);
        let ptr = device
            .map_memory(self.memory, offset, bytes.len() as u64, vk::MemoryMapFlags::empty())
            .call("vkMapMemory")?;
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>(), bytes.len());
        device.unmap_memory(self.memory);
        Ok(())
    }

    pub unsafe fn destroy(self, device: &ash::Device) {
        if self.handle != vk::Buffer::null() {
            trace!(
                "destroy buffer {:?}: {} bytes, owner {:?}, queue family {:?}",
                self.handle,
                self.size,
                self.owner,
                self.owner_family
            );
        }
        device.destroy_buffer(self.handle, None);
        device.free_memory(self.memory, None);
    }
}

#[derive(Debug, Default)]
pub struct Image {
    pub handle: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub owner: ResourceOwner,
    pub owner_family: Option<u32>,
}

impl Image {
    pub unsafe fn destroy(self, device: &ash::Device) {
        if self.handle != vk::Image::null() {
            trace!(
                "destroy image {:?}: {}x{} {:?}, owner {:?}, queue family {:?}",
                self.handle,
                self.extent.width,
                self.extent.height,
                self.format,
                self.owner,
                self.owner_family
            );
        }
        device.destroy_image_view(self.view, None);
        device.destroy_image(self.handle, None);
        device.free_memory(self.memory, None);
    }
}

/// Allocates and binds; the result is usable as soon as the call returns.
pub struct ResourceFactory<'a> {
    device: &'a ash::Device,
    memory: &'a vk::PhysicalDeviceMemoryProperties,
}

impl<'a> ResourceFactory<'a> {
    pub fn new(device: &'a ash::Device, memory: &'a vk::PhysicalDeviceMemoryProperties) -> Self {
        Self { device, memory }
    }

    pub fn device(&self) -> &'a ash::Device {
        self.device
    }

    unsafe fn allocate(
        &self,
        req: vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<vk::DeviceMemory, VkError> {
        let alloc = vk::MemoryAllocateInfo {
            allocation_size: req.size,
            memory_type_index: find_memory_type(self.memory, req.memory_type_bits, flags)?,
            ..Default::default()
        };
        self.device
            .allocate_memory(&alloc, None)
            .call("vkAllocateMemory")
    }

    pub unsafe fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        flags: vk::MemoryPropertyFlags,
        owner: ResourceOwner,
    ) -> Result<Buffer, VkError> {
        let ci = vk::BufferCreateInfo {
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let handle = self.device.create_buffer(&ci, None).call("vkCreateBuffer")?;
        let req = self.device.get_buffer_memory_requirements(handle);
        let memory = match self.allocate(req, flags) {
            Ok(m) => m,
            Err(e) => {
                self.device.destroy_buffer(handle, None);
                return Err(e);
            }
        };
        let buffer = Buffer {
            handle,
            memory,
            size,
            owner,
            owner_family: None,
        };
        if let Err(e) = self.device.bind_buffer_memory(handle, memory, 0) {
            buffer.destroy(self.device);
            return Err(VkError::Command {
                call: "vkBindBufferMemory",
                result: e,
            });
        }
        Ok(buffer)
    }

    /// 2-D, single mip, optimal tiling. The view is created separately.
    pub unsafe fn create_image(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        flags: vk::MemoryPropertyFlags,
        owner: ResourceOwner,
    ) -> Result<Image, VkError> {
        let ci = vk::ImageCreateInfo {
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        let handle = self.device.create_image(&ci, None).call("vkCreateImage")?;
        let req = self.device.get_image_memory_requirements(handle);
        let memory = match self.allocate(req, flags) {
            Ok(m) => m,
            Err(e) => {
                self.device.destroy_image(handle, None);
                return Err(e);
            }
        };
        let image = Image {
            handle,
            memory,
            format,
            extent,
            owner,
            ..Default::default()
        };
        if let Err(e) = self.device.bind_image_memory(handle, memory, 0) {
            image.destroy(self.device);
            return Err(VkError::Command {
                call: "vkBindImageMemory",
                result: e,
            });
        }
        Ok(image)
    }

    pub unsafe fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect_mask: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView, VkError> {
        let ci = vk::ImageViewCreateInfo {
            image,
            view_type: vk::ImageViewType::TYPE_2D,
            format,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            ..Default::default()
        };
        self.device
            .create_image_view(&ci, None)
            .call("vkCreateImageView")
    }

    /// Image plus its view in one step.
    pub unsafe fn create_image_with_view(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect_mask: vk::ImageAspectFlags,
        owner: ResourceOwner,
    ) -> Result<Image, VkError> {
        let mut image = self.create_image(
            extent,
            format,
            usage,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            owner,
        )?;
        match self.create_image_view(image.handle, format, aspect_mask) {
            Ok(view) => {
                image.view = view;
                Ok(image)
            }
            Err(e) => {
                image.destroy(self.device);
                Err(e)
            }
        }
    }
}

/// Transient buffer released on every exit path.
pub struct ScopedBuffer<'a> {
    device: &'a ash::Device,
    buffer: Option<Buffer>,
}

impl<'a> ScopedBuffer<'a> {
    pub fn new(device: &'a ash::Device, buffer: Buffer) -> Self {
        Self {
            device,
            buffer: Some(buffer),
        }
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer.as_ref().map(|b| b.handle).unwrap_or_default()
    }

    pub fn get(&self) -> Option<&Buffer> {
        self.buffer.as_ref()
    }
}

impl Drop for ScopedBuffer<'_> {
    fn drop(&mut self) {
        if let Some(b) = self.buffer.take() {
            unsafe { b.destroy(self.device) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut p = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: flags.len() as u32,
            ..Default::default()
        };
        for (i, &f) in flags.iter().enumerate() {
            p.memory_types[i].property_flags = f;
        }
        p
    }

    #[test]
    fn picks_first_type_in_mask_with_all_flags() {
        use vk::MemoryPropertyFlags as M;
        let p = props(&[
            M::DEVICE_LOCAL,
            M::HOST_VISIBLE,
            M::HOST_VISIBLE | M::HOST_COHERENT,
        ]);
        let host = M::HOST_VISIBLE | M::HOST_COHERENT;
        assert_eq!(find_memory_type(&p, 0b111, host).unwrap(), 2);
        assert_eq!(find_memory_type(&p, 0b111, M::DEVICE_LOCAL).unwrap(), 0);
        assert_eq!(find_memory_type(&p, 0b110, M::HOST_VISIBLE).unwrap(), 1);
    }

    #[test]
    fn type_outside_mask_is_rejected() {
        use vk::MemoryPropertyFlags as M;
        let p = props(&[M::DEVICE_LOCAL, M::HOST_VISIBLE]);
        match find_memory_type(&p, 0b10, M::DEVICE_LOCAL) {
            Err(VkError::NoCompatibleMemoryType { type_bits, .. }) => assert_eq!(type_bits, 0b10),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn types_beyond_count_are_ignored() {
        let mut p = props(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        p.memory_types[1].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE;
        assert!(find_memory_type(&p, 0b11, vk::MemoryPropertyFlags::HOST_VISIBLE).is_err());
    }

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(288, 256), 512);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(5, 0), 5);
    }

    #[test]
    fn default_resources_hold_null_handles() {
        let b = Buffer::default();
        assert_eq!(b.handle, vk::Buffer::null());
        assert_eq!(b.owner, ResourceOwner::Context);
        assert_eq!(Image::default().view, vk::ImageView::null());
    }
}
