// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use thiserror::Error;

/// One variant per failure cause. Only [`VkError::SurfaceStale`] is recoverable.
#[derive(Debug, Error)]
pub enum VkError {
    #[error("window/display handle unavailable: {0}")]
    WindowHandle(#[from] raw_window_handle::HandleError),
    #[error("instance creation failed: {0}")]
    InstanceCreation(vk::Result),
    #[error("surface creation failed: {0}")]
    SurfaceCreation(vk::Result),
    #[error("no GPU exposes graphics/present/transfer queues, swapchain support and the required features")]
    NoSuitableDevice,
    #[error("logical device creation rejected: {0}")]
    DeviceCreation(vk::Result),
    #[error("no memory type in mask {type_bits:#b} has {flags:?}")]
    NoCompatibleMemoryType {
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    },
    #[error("surface query failed: {0}")]
    SurfaceQuery(vk::Result),
    #[error("swapchain creation failed: {0}")]
    SwapchainCreation(vk::Result),
    #[error("render pass creation failed: {0}")]
    RenderPassCreation(vk::Result),
    #[error("graphics pipeline creation failed: {0}")]
    PipelineCreation(vk::Result),
    #[error("none of the depth format candidates support optimal-tiling depth attachments")]
    UnsupportedFormat,
    #[error("swapchain is out of date or suboptimal")]
    SurfaceStale,
    #[error("asset upload failed during {stage}: {result}")]
    Upload {
        stage: &'static str,
        result: vk::Result,
    },
    #[error("texture table full: {requested} requested, {free} slots free")]
    TextureLimit { requested: usize, free: usize },
    #[error("shader `{name}`: {source}")]
    Shader {
        name: String,
        source: std::io::Error,
    },
    #[error("{call} failed: {result}")]
    Command {
        call: &'static str,
        result: vk::Result,
    },
}

impl VkError {
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::SurfaceStale)
    }
}

/// Tags a raw `VkResult` with the API call that produced it.
pub(crate) trait VkCall<T> {
    fn call(self, call: &'static str) -> Result<T, VkError>;
}

impl<T> VkCall<T> for ash::prelude::VkResult<T> {
    fn call(self, call: &'static str) -> Result<T, VkError> {
        self.map_err(|result| VkError::Command { call, result })
    }
}
