// SPDX-License-Identifier: CEPL-1.0
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use ash::util::read_spv;
use ash::vk;
use lumen_math::PushConstants;
use lumen_render::{ShaderPaths, Vertex};
use tracing::{debug, warn};

use crate::error::{VkCall, VkError};

/// Size of the sampler array at binding 1.
pub const MAX_TEXTURES: u32 = 16;

pub const PUSH_CONSTANT_SIZE: u32 = std::mem::size_of::<PushConstants>() as u32;

const SHADER_ENTRY: &std::ffi::CStr = c"main";

const BUILTIN_VERT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/mesh.vert.spv"));
const BUILTIN_FRAG: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/mesh.frag.spv"));

/// SPIR-V words for the vertex/fragment pair.
#[derive(Clone, Debug, Default)]
pub struct ShaderBinaries {
    pub vertex: Vec<u32>,
    pub fragment: Vec<u32>,
}

fn decode(name: &str, bytes: &[u8]) -> Result<Vec<u32>, VkError> {
    read_spv(&mut Cursor::new(bytes)).map_err(|source| VkError::Shader {
        name: name.to_owned(),
        source,
    })
}

fn read_blob(path: &Path) -> Result<Vec<u32>, VkError> {
    let name = path.display().to_string();
    let bytes = fs::read(path).map_err(|source| VkError::Shader {
        name: name.clone(),
        source,
    })?;
    decode(&name, &bytes)
}

impl ShaderBinaries {
    /// Compiled into the crate by the build script.
    pub fn builtin() -> Result<Self, VkError> {
        Ok(Self {
            vertex: decode("builtin mesh.vert", BUILTIN_VERT)?,
            fragment: decode("builtin mesh.frag", BUILTIN_FRAG)?,
        })
    }

    pub fn load(paths: &ShaderPaths) -> Result<Self, VkError> {
        Ok(Self {
            vertex: read_blob(&paths.vertex)?,
            fragment: read_blob(&paths.fragment)?,
        })
    }

    pub fn resolve(paths: Option<&ShaderPaths>) -> Result<Self, VkError> {
        match paths {
            Some(p) => Self::load(p),
            None => Self::builtin(),
        }
    }
}

fn hex_bytes(b: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut s = String::with_capacity(b.len() * 2);
    for x in b {
        let _ = write!(&mut s, "{x:02x}");
    }
    s
}

/// Keyed on vendor/device/driver and the driver's cache UUID.
pub fn pipeline_cache_path(props: &vk::PhysicalDeviceProperties) -> PathBuf {
    PathBuf::from(format!(
        "lumen_pipeline_cache_{:04x}_{:04x}_{:08x}_{}.bin",
        props.vendor_id,
        props.device_id,
        props.driver_version,
        hex_bytes(&props.pipeline_cache_uuid)
    ))
}

/// Persisted across runs, best effort in both directions.
pub struct PipelineCache {
    pub handle: vk::PipelineCache,
    path: PathBuf,
}

impl PipelineCache {
    pub unsafe fn create_or_load(
        device: &ash::Device,
        props: &vk::PhysicalDeviceProperties,
    ) -> Result<Self, VkError> {
        let path = pipeline_cache_path(props);
        let data = fs::read(&path).unwrap_or_default();
        let ci = vk::PipelineCacheCreateInfo {
            initial_data_size: data.len(),
            p_initial_data: data.as_ptr().cast(),
            ..Default::default()
        };
        let handle = match device.create_pipeline_cache(&ci, None) {
            Ok(h) => h,
            Err(e) if !data.is_empty() => {
                warn!("discarding pipeline cache {}: {e}", path.display());
                device
                    .create_pipeline_cache(&vk::PipelineCacheCreateInfo::default(), None)
                    .call("vkCreatePipelineCache")?
            }
            Err(e) => {
                return Err(VkError::Command {
                    call: "vkCreatePipelineCache",
                    result: e,
                })
            }
        };
        debug!("pipeline cache {} ({} bytes)", path.display(), data.len());
        Ok(Self { handle, path })
    }

    pub unsafe fn save(&self, device: &ash::Device) {
        match device.get_pipeline_cache_data(self.handle) {
            Ok(bytes) => {
                if let Err(e) = fs::write(&self.path, &bytes) {
                    warn!("pipeline cache not saved: {e}");
                }
            }
            Err(e) => debug!("pipeline cache data unavailable: {e}"),
        }
    }

    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        device.destroy_pipeline_cache(self.handle, None);
        self.handle = vk::PipelineCache::null();
    }
}

/// Colour cleared and stored for presentation; depth cleared and discarded.
pub unsafe fn create_render_pass(
    device: &ash::Device,
    color_format: vk::Format,
    depth_format: vk::Format,
) -> Result<vk::RenderPass, VkError> {
    let attachments = [
        vk::AttachmentDescription {
            format: color_format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            ..Default::default()
        },
        vk::AttachmentDescription {
            format: depth_format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ..Default::default()
        },
    ];
    let color_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let depth_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };
    let subpass = vk::SubpassDescription {
        pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
        color_attachment_count: 1,
        p_color_attachments: &color_ref,
        p_depth_stencil_attachment: &depth_ref,
        ..Default::default()
    };
    // Orders attachment writes after the acquire semaphore and the previous
    // frame's depth use.
    let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
    let dependency = vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: stages | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        dst_stage_mask: stages,
        src_access_mask: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ..Default::default()
    };
    let ci = vk::RenderPassCreateInfo {
        attachment_count: attachments.len() as u32,
        p_attachments: attachments.as_ptr(),
        subpass_count: 1,
        p_subpasses: &subpass,
        dependency_count: 1,
        p_dependencies: &dependency,
        ..Default::default()
    };
    device
        .create_render_pass(&ci, None)
        .map_err(VkError::RenderPassCreation)
}

/// 0: camera UBO, 1: sampler table, 2: lighting UBO, 3: material storage buffer.
pub fn descriptor_bindings() -> [vk::DescriptorSetLayoutBinding<'static>; 4] {
    let binding = |binding, ty, count, stages| vk::DescriptorSetLayoutBinding {
        binding,
        descriptor_type: ty,
        descriptor_count: count,
        stage_flags: stages,
        ..Default::default()
    };
    [
        binding(
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            1,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        ),
        binding(
            1,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            MAX_TEXTURES,
            vk::ShaderStageFlags::FRAGMENT,
        ),
        binding(
            2,
            vk::DescriptorType::UNIFORM_BUFFER,
            1,
            vk::ShaderStageFlags::FRAGMENT,
        ),
        binding(
            3,
            vk::DescriptorType::STORAGE_BUFFER,
            1,
            vk::ShaderStageFlags::FRAGMENT,
        ),
    ]
}

pub unsafe fn create_descriptor_set_layout(
    device: &ash::Device,
) -> Result<vk::DescriptorSetLayout, VkError> {
    let bindings = descriptor_bindings();
    let ci = vk::DescriptorSetLayoutCreateInfo {
        binding_count: bindings.len() as u32,
        p_bindings: bindings.as_ptr(),
        ..Default::default()
    };
    device
        .create_descriptor_set_layout(&ci, None)
        .map_err(VkError::PipelineCreation)
}

/// Exactly what `image_count` frames need: one set each.
pub fn descriptor_pool_sizes(image_count: u32) -> ([vk::DescriptorPoolSize; 3], u32) {
    let m = image_count.max(1);
    (
        [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 2 * m,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: MAX_TEXTURES * m,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: m,
            },
        ],
        m,
    )
}

pub unsafe fn create_descriptor_pool(
    device: &ash::Device,
    image_count: u32,
) -> Result<vk::DescriptorPool, VkError> {
    let (sizes, max_sets) = descriptor_pool_sizes(image_count);
    let ci = vk::DescriptorPoolCreateInfo {
        max_sets,
        pool_size_count: sizes.len() as u32,
        p_pool_sizes: sizes.as_ptr(),
        ..Default::default()
    };
    device
        .create_descriptor_pool(&ci, None)
        .call("vkCreateDescriptorPool")
}

pub unsafe fn create_pipeline_layout(
    device: &ash::Device,
    set_layout: vk::DescriptorSetLayout,
) -> Result<vk::PipelineLayout, VkError> {
    let push = vk::PushConstantRange {
        stage_flags: vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        offset: 0,
        size: PUSH_CONSTANT_SIZE,
    };
    let ci = vk::PipelineLayoutCreateInfo {
        set_layout_count: 1,
        p_set_layouts: &set_layout,
        push_constant_range_count: 1,
        p_push_constant_ranges: &push,
        ..Default::default()
    };
    device
        .create_pipeline_layout(&ci, None)
        .map_err(VkError::PipelineCreation)
}

pub fn vertex_attributes() -> [vk::VertexInputAttributeDescription; 3] {
    let attr = |location, format, offset: usize| vk::VertexInputAttributeDescription {
        location,
        binding: 0,
        format,
        offset: offset as u32,
    };
    [
        attr(0, vk::Format::R32G32B32_SFLOAT, std::mem::offset_of!(Vertex, pos)),
        attr(1, vk::Format::R32G32B32_SFLOAT, std::mem::offset_of!(Vertex, normal)),
        attr(2, vk::Format::R32G32_SFLOAT, std::mem::offset_of!(Vertex, uv)),
    ]
}

unsafe fn create_module(device: &ash::Device, words: &[u32]) -> Result<vk::ShaderModule, VkError> {
    let ci = vk::ShaderModuleCreateInfo {
        code_size: words.len() * 4,
        p_code: words.as_ptr(),
        ..Default::default()
    };
    device
        .create_shader_module(&ci, None)
        .map_err(VkError::PipelineCreation)
}

/// Triangle list, back-face cull, depth test/write LESS, no blending.
/// Viewport and scissor are dynamic.
pub unsafe fn create_graphics_pipeline(
    device: &ash::Device,
    cache: vk::PipelineCache,
    render_pass: vk::RenderPass,
    layout: vk::PipelineLayout,
    shaders: &ShaderBinaries,
) -> Result<vk::Pipeline, VkError> {
    let vs = create_module(device, &shaders.vertex)?;
    let fs = match create_module(device, &shaders.fragment) {
        Ok(m) => m,
        Err(e) => {
            device.destroy_shader_module(vs, None);
            return Err(e);
        }
    };

    let stages = [
        vk::PipelineShaderStageCreateInfo {
            stage: vk::ShaderStageFlags::VERTEX,
            module: vs,
            p_name: SHADER_ENTRY.as_ptr(),
            ..Default::default()
        },
        vk::PipelineShaderStageCreateInfo {
            stage: vk::ShaderStageFlags::FRAGMENT,
            module: fs,
            p_name: SHADER_ENTRY.as_ptr(),
            ..Default::default()
        },
    ];

    let vb = vk::VertexInputBindingDescription {
        binding: 0,
        stride: std::mem::size_of::<Vertex>() as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    };
    let va = vertex_attributes();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo {
        vertex_binding_description_count: 1,
        p_vertex_binding_descriptions: &vb,
        vertex_attribute_description_count: va.len() as u32,
        p_vertex_attribute_descriptions: va.as_ptr(),
        ..Default::default()
    };
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
        topology: vk::PrimitiveTopology::TRIANGLE_LIST,
        ..Default::default()
    };
    let dyn_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo {
        dynamic_state_count: dyn_states.len() as u32,
        p_dynamic_states: dyn_states.as_ptr(),
        ..Default::default()
    };
    let viewport_state = vk::PipelineViewportStateCreateInfo {
        viewport_count: 1,
        scissor_count: 1,
        ..Default::default()
    };
    let raster = vk::PipelineRasterizationStateCreateInfo {
        polygon_mode: vk::PolygonMode::FILL,
        cull_mode: vk::CullModeFlags::BACK,
        front_face: vk::FrontFace::COUNTER_CLOCKWISE,
        line_width: 1.0,
        ..Default::default()
    };
    let multisample = vk::PipelineMultisampleStateCreateInfo {
        rasterization_samples: vk::SampleCountFlags::TYPE_1,
        ..Default::default()
    };
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo {
        depth_test_enable: vk::TRUE,
        depth_write_enable: vk::TRUE,
        depth_compare_op: vk::CompareOp::LESS,
        ..Default::default()
    };
    let color_blend_att = vk::PipelineColorBlendAttachmentState {
        color_write_mask: vk::ColorComponentFlags::RGBA,
        blend_enable: vk::FALSE,
        ..Default::default()
    };
    let color_blend = vk::PipelineColorBlendStateCreateInfo {
        attachment_count: 1,
        p_attachments: &color_blend_att,
        ..Default::default()
    };

    let ci = vk::GraphicsPipelineCreateInfo {
        stage_count: stages.len() as u32,
        p_stages: stages.as_ptr(),
        p_vertex_input_state: &vertex_input,
        p_input_assembly_state: &input_assembly,
        p_viewport_state: &viewport_state,
        p_rasterization_state: &raster,
        p_multisample_state: &multisample,
        p_depth_stencil_state: &depth_stencil,
        p_color_blend_state: &color_blend,
        p_dynamic_state: &dynamic_state,
        layout,
        render_pass,
        subpass: 0,
        ..Default::default()
    };

    let result = device.create_graphics_pipelines(cache, std::slice::from_ref(&ci), None);
    device.destroy_shader_module(vs, None);
    device.destroy_shader_module(fs, None);
    match result {
        Ok(p) => Ok(p[0]),
        Err((_, err)) => Err(VkError::PipelineCreation(err)),
    }
}

/// Negative-height viewport so +Y is up in clip space.
pub fn flipped_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: extent.height as f32,
        width: extent.width as f32,
        height: -(extent.height as f32),
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_sizes_cover_every_frame_exactly() {
        let (sizes, sets) = descriptor_pool_sizes(3);
        assert_eq!(sets, 3);
        let count = |ty: vk::DescriptorType| sizes.iter().find(|s| s.ty == ty).map(|s| s.descriptor_count);
        assert_eq!(count(vk::DescriptorType::UNIFORM_BUFFER), Some(6));
        assert_eq!(count(vk::DescriptorType::COMBINED_IMAGE_SAMPLER), Some(3 * MAX_TEXTURES));
        assert_eq!(count(vk::DescriptorType::STORAGE_BUFFER), Some(3));
    }

    #[test]
    fn pool_sizes_match_layout_bindings() {
        let (sizes, sets) = descriptor_pool_sizes(2);
        for ty in [
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::DescriptorType::STORAGE_BUFFER,
        ] {
            let per_set: u32 = descriptor_bindings()
                .iter()
                .filter(|b| b.descriptor_type == ty)
                .map(|b| b.descriptor_count)
                .sum();
            let pooled = sizes.iter().find(|s| s.ty == ty).map_or(0, |s| s.descriptor_count);
            assert_eq!(pooled, per_set * sets);
        }
    }

    #[test]
    fn camera_binding_is_visible_to_both_stages() {
        let b = descriptor_bindings();
        assert!(b[0]
            .stage_flags
            .contains(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT));
        assert_eq!(b[1].descriptor_count, MAX_TEXTURES);
    }

    #[test]
    fn vertex_attributes_follow_struct_layout() {
        let a = vertex_attributes();
        assert_eq!(a[0].offset, 0);
        assert_eq!(a[1].offset, 12);
        assert_eq!(a[2].offset, 24);
        assert_eq!(PUSH_CONSTANT_SIZE, 80);
    }

    #[test]
    fn builtin_shaders_decode() {
        let s = ShaderBinaries::builtin().unwrap();
        assert_eq!(s.vertex[0], 0x0723_0203);
        assert_eq!(s.fragment[0], 0x0723_0203);
    }

    #[test]
    fn missing_shader_file_names_the_path() {
        let paths = ShaderPaths {
            vertex: PathBuf::from("does/not/exist.vert.spv"),
            fragment: PathBuf::from("does/not/exist.frag.spv"),
        };
        match ShaderBinaries::load(&paths) {
            Err(VkError::Shader { name, .. }) => assert!(name.contains("exist.vert.spv")),
            _ => panic!("expected shader error"),
        }
    }

    #[test]
    fn cache_path_is_device_specific() {
        let mut props = vk::PhysicalDeviceProperties {
            vendor_id: 0x10de,
            device_id: 0x2684,
            ..Default::default()
        };
        let a = pipeline_cache_path(&props);
        props.device_id = 0x2704;
        assert_ne!(a, pipeline_cache_path(&props));
        assert!(a.to_string_lossy().contains("10de_2684"));
    }

    #[test]
    fn viewport_is_flipped() {
        let vp = flipped_viewport(vk::Extent2D {
            width: 800,
            height: 600,
        });
        assert_eq!(vp.y, 600.0);
        assert_eq!(vp.height, -600.0);
    }
}
