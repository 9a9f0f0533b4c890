// SPDX-License-Identifier: CEPL-1.0
//! Long-lived GPU copies of what the asset collaborator hands over: packed mesh
//! buffers, the material table and the texture table.
use ash::vk;
use glam::Mat4;
use lumen_math::PushConstants;
use lumen_render::{
    DrawInstance, MaterialRange, MaterialRecord, MeshData, MeshHandle, Primitive, TextureData,
    TextureRange, TextureRole,
};
use tracing::{debug, info};

use crate::device::DeviceContext;
use crate::error::{VkCall, VkError};
use crate::pipeline::{MAX_TEXTURES, PUSH_CONSTANT_SIZE};
use crate::resource::{Buffer, Image, ResourceFactory, ResourceOwner};
use crate::transfer::{ConsumerAccess, Destination, TransferCoordinator};

pub fn texture_format(role: TextureRole) -> vk::Format {
    if role.is_srgb() {
        vk::Format::R8G8B8A8_SRGB
    } else {
        vk::Format::R8G8B8A8_UNORM
    }
}

pub fn check_texture_capacity(used: usize, requested: usize) -> Result<(), VkError> {
    let free = (MAX_TEXTURES as usize).saturating_sub(used);
    if requested > free {
        Err(VkError::TextureLimit { requested, free })
    } else {
        Ok(())
    }
}

fn rejected(stage: &'static str) -> VkError {
    VkError::Upload {
        stage,
        result: vk::Result::ERROR_FORMAT_NOT_SUPPORTED,
    }
}

/// Runs over the whole batch before the first image is created.
pub fn check_texture_batch(used: usize, textures: &[TextureData]) -> Result<(), VkError> {
    check_texture_capacity(used, textures.len())?;
    for tex in textures {
        if tex.width == 0 || tex.height == 0 {
            return Err(rejected("texture extent"));
        }
        if tex.rgba.len() as u64 != u64::from(tex.width) * u64::from(tex.height) * 4 {
            return Err(rejected("texture size check"));
        }
    }
    Ok(())
}

/// Indices are `u32` after the vertices: the boundary must be 4-aligned and every
/// primitive's index range must lie inside the index block.
pub fn check_mesh_layout(mesh: &MeshData) -> Result<(), VkError> {
    let len = mesh.bytes.len() as u64;
    if mesh.index_offset > len || mesh.index_offset % 4 != 0 || (len - mesh.index_offset) % 4 != 0
    {
        return Err(rejected("mesh index offset"));
    }
    let indices = (len - mesh.index_offset) / 4;
    let in_range = |p: &Primitive| u64::from(p.first_index) + u64::from(p.index_count) <= indices;
    if !mesh.primitives.iter().all(in_range) {
        return Err(rejected("mesh primitive range"));
    }
    Ok(())
}

pub fn check_material_records(records: &[MaterialRecord]) -> Result<(), VkError> {
    if records.iter().any(|r| r.texture >= MAX_TEXTURES) {
        return Err(rejected("material texture slot"));
    }
    Ok(())
}

/// Slots past `views.len()` repeat slot 0 so every descriptor is valid.
pub fn fill_texture_table(
    views: &[vk::ImageView],
    sampler: vk::Sampler,
) -> [vk::DescriptorImageInfo; MAX_TEXTURES as usize] {
    let fallback = views.first().copied().unwrap_or_default();
    std::array::from_fn(|i| vk::DescriptorImageInfo {
        sampler,
        image_view: views.get(i).copied().unwrap_or(fallback),
        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    })
}

pub struct MeshGpu {
    pub buffer: Buffer,
    pub index_offset: u64,
    pub primitives: Vec<Primitive>,
    pub node_transforms: Vec<Mat4>,
}

/// One `drawIndexed` with its push constants.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DrawCall {
    pub mesh: usize,
    pub push: PushConstants,
    pub index_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
}

/// Instance transform times node transform, per instance and primitive.
/// Primitives whose material is outside the table are dropped.
pub fn plan_draws(
    meshes: &[MeshGpu],
    material_count: usize,
    draws: &[DrawInstance],
) -> Vec<DrawCall> {
    let mut calls = Vec::new();
    for draw in draws {
        let index = draw.mesh.0 as usize;
        let Some(mesh) = meshes.get(index) else {
            debug!("draw references unknown mesh {}", draw.mesh.0);
            continue;
        };
        for prim in &mesh.primitives {
            if prim.material as usize >= material_count {
                debug!(
                    "mesh {index} primitive uses material {} of {material_count}",
                    prim.material
                );
                continue;
            }
            let node = mesh
                .node_transforms
                .get(prim.node)
                .copied()
                .unwrap_or(Mat4::IDENTITY);
            calls.push(DrawCall {
                mesh: index,
                push: PushConstants::new(draw.transform * node, prim.material),
                index_count: prim.index_count,
                first_index: prim.first_index,
                vertex_offset: prim.vertex_offset,
            });
        }
    }
    calls
}

unsafe fn upload_texture(
    factory: &ResourceFactory<'_>,
    transfer: &TransferCoordinator,
    tex: &TextureData,
) -> Result<Image, VkError> {
    let mut image = factory.create_image_with_view(
        vk::Extent2D {
            width: tex.width,
            height: tex.height,
        },
        texture_format(tex.role),
        vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        vk::ImageAspectFlags::COLOR,
        ResourceOwner::Scene,
    )?;
    if let Err(e) = transfer.upload_and_transfer(
        factory,
        &tex.rgba,
        Destination::Image(&mut image),
        ConsumerAccess::FragmentSampled,
    ) {
        image.destroy(factory.device());
        return Err(e);
    }
    Ok(image)
}

pub struct SceneResources {
    meshes: Vec<MeshGpu>,
    materials: Vec<MaterialRecord>,
    material_buffer: Buffer,
    textures: Vec<Image>,
    sampler: vk::Sampler,
}

impl SceneResources {
    /// Sampler, white texture in slot 0 and the default material in record 0.
    pub unsafe fn new(ctx: &DeviceContext, transfer: &TransferCoordinator) -> Result<Self, VkError> {
        let sampler_ci = vk::SamplerCreateInfo {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode_u: vk::SamplerAddressMode::REPEAT,
            address_mode_v: vk::SamplerAddressMode::REPEAT,
            address_mode_w: vk::SamplerAddressMode::REPEAT,
            anisotropy_enable: vk::TRUE,
            max_anisotropy: ctx.info.max_anisotropy(),
            border_color: vk::BorderColor::INT_OPAQUE_BLACK,
            compare_op: vk::CompareOp::ALWAYS,
            ..Default::default()
        };
        let sampler = ctx
            .device
            .create_sampler(&sampler_ci, None)
            .call("vkCreateSampler")?;

        let mut scene = Self {
            meshes: Vec::new(),
            materials: Vec::new(),
            material_buffer: Buffer::default(),
            textures: Vec::new(),
            sampler,
        };
        let seeded = scene
            .register_textures(
                ctx,
                transfer,
                vec![TextureData {
                    width: 1,
                    height: 1,
                    rgba: vec![255; 4],
                    role: TextureRole::BaseColor,
                }],
            )
            .and_then(|_| scene.upload_materials(ctx, transfer, &[MaterialRecord::default()]));
        if let Err(e) = seeded {
            scene.destroy(&ctx.device);
            return Err(e);
        }
        Ok(scene)
    }

    pub unsafe fn upload_mesh(
        &mut self,
        ctx: &DeviceContext,
        transfer: &TransferCoordinator,
        mesh: MeshData,
    ) -> Result<MeshHandle, VkError> {
        check_mesh_layout(&mesh)?;
        let factory = ResourceFactory::new(&ctx.device, &ctx.info.memory);
        let mut buffer = factory.create_buffer(
            mesh.bytes.len().max(4) as u64,
            vk::BufferUsageFlags::VERTEX_BUFFER
                | vk::BufferUsageFlags::INDEX_BUFFER
                | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            ResourceOwner::Scene,
        )?;
        if let Err(e) = transfer.upload_and_transfer(
            &factory,
            &mesh.bytes,
            Destination::Buffer(&mut buffer),
            ConsumerAccess::VertexInput,
        ) {
            buffer.destroy(&ctx.device);
            return Err(e);
        }
        let handle = MeshHandle(self.meshes.len() as u32);
        info!(
            "mesh {} uploaded: {} bytes, {} primitives",
            handle.0,
            mesh.bytes.len(),
            mesh.primitives.len()
        );
        self.meshes.push(MeshGpu {
            buffer,
            index_offset: mesh.index_offset,
            primitives: mesh.primitives,
            node_transforms: mesh.node_transforms,
        });
        Ok(handle)
    }

    /// Appends and re-uploads the whole table into a fresh device-local buffer.
    pub unsafe fn upload_materials(
        &mut self,
        ctx: &DeviceContext,
        transfer: &TransferCoordinator,
        records: &[MaterialRecord],
    ) -> Result<MaterialRange, VkError> {
        check_material_records(records)?;
        let range = MaterialRange {
            first: self.materials.len() as u32,
            count: records.len() as u32,
        };
        let mut table = self.materials.clone();
        table.extend_from_slice(records);
        let bytes: &[u8] = bytemuck::cast_slice(&table);

        let factory = ResourceFactory::new(&ctx.device, &ctx.info.memory);
        let mut buffer = factory.create_buffer(
            bytes.len().max(4) as u64,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            ResourceOwner::Scene,
        )?;
        if let Err(e) = transfer.upload_and_transfer(
            &factory,
            bytes,
            Destination::Buffer(&mut buffer),
            ConsumerAccess::FragmentStorage,
        ) {
            buffer.destroy(&ctx.device);
            return Err(e);
        }
        ctx.wait_idle()?;
        std::mem::replace(&mut self.material_buffer, buffer).destroy(&ctx.device);
        self.materials = table;
        debug!("material table now {} records", self.materials.len());
        Ok(range)
    }

    pub unsafe fn register_textures(
        &mut self,
        ctx: &DeviceContext,
        transfer: &TransferCoordinator,
        textures: Vec<TextureData>,
    ) -> Result<TextureRange, VkError> {
        check_texture_batch(self.textures.len(), &textures)?;
        let range = TextureRange {
            first: self.textures.len() as u32,
            count: textures.len() as u32,
        };
        let factory = ResourceFactory::new(&ctx.device, &ctx.info.memory);
        // All or nothing: a failure releases the images this batch already built.
        let mut built = Vec::with_capacity(textures.len());
        for tex in &textures {
            match upload_texture(&factory, transfer, tex) {
                Ok(image) => built.push(image),
                Err(e) => {
                    for image in built {
                        image.destroy(&ctx.device);
                    }
                    return Err(e);
                }
            }
        }
        self.textures.extend(built);
        debug!("texture table now {} / {MAX_TEXTURES}", self.textures.len());
        Ok(range)
    }

    pub fn texture_table(&self) -> [vk::DescriptorImageInfo; MAX_TEXTURES as usize] {
        let views: Vec<vk::ImageView> = self.textures.iter().map(|t| t.view).collect();
        fill_texture_table(&views, self.sampler)
    }

    pub fn material_buffer(&self) -> vk::Buffer {
        self.material_buffer.handle
    }

    /// Expects the pipeline and descriptor set to be bound already.
    pub unsafe fn record_draws(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        draws: &[DrawInstance],
    ) {
        let mut bound: Option<usize> = None;
        for call in plan_draws(&self.meshes, self.materials.len(), draws) {
            let mesh = &self.meshes[call.mesh];
            if bound != Some(call.mesh) {
                device.cmd_bind_vertex_buffers(cmd, 0, &[mesh.buffer.handle], &[0]);
                device.cmd_bind_index_buffer(
                    cmd,
                    mesh.buffer.handle,
                    mesh.index_offset,
                    vk::IndexType::UINT32,
                );
                bound = Some(call.mesh);
            }
            let bytes = bytemuck::bytes_of(&call.push);
            debug_assert_eq!(bytes.len() as u32, PUSH_CONSTANT_SIZE);
            device.cmd_push_constants(
                cmd,
                layout,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                0,
                bytes,
            );
            device.cmd_draw_indexed(
                cmd,
                call.index_count,
                1,
                call.first_index,
                call.vertex_offset,
                0,
            );
        }
    }

    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for mesh in self.meshes.drain(..) {
            mesh.buffer.destroy(device);
        }
        for tex in self.textures.drain(..) {
            tex.destroy(device);
        }
        std::mem::take(&mut self.material_buffer).destroy(device);
        device.destroy_sampler(self.sampler, None);
        self.sampler = vk::Sampler::null();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn mesh(prims: Vec<Primitive>, nodes: Vec<Mat4>) -> MeshGpu {
        MeshGpu {
            buffer: Buffer::default(),
            index_offset: 0,
            primitives: prims,
            node_transforms: nodes,
        }
    }

    fn prim(node: usize, material: u32) -> Primitive {
        Primitive {
            first_index: 0,
            index_count: 36,
            vertex_offset: 0,
            material,
            node,
        }
    }

    #[test]
    fn draw_transform_composes_instance_and_node() {
        let node = Mat4::from_translation(Vec3::X);
        let meshes = [mesh(vec![prim(0, 3)], vec![node])];
        let instance = Mat4::from_scale(Vec3::splat(2.0));
        let calls = plan_draws(
            &meshes,
            4,
            &[DrawInstance {
                mesh: MeshHandle(0),
                transform: instance,
            }],
        );
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].push.transform, instance * node);
        assert_eq!(calls[0].push.material, 3);
    }

    #[test]
    fn one_call_per_instance_and_primitive() {
        let meshes = [mesh(vec![prim(0, 1), prim(5, 2)], vec![Mat4::IDENTITY])];
        let draw = DrawInstance {
            mesh: MeshHandle(0),
            transform: Mat4::IDENTITY,
        };
        let calls = plan_draws(&meshes, 3, &[draw, draw]);
        assert_eq!(calls.len(), 4);
        // unknown node index falls back to identity
        assert_eq!(calls[1].push.transform, Mat4::IDENTITY);
    }

    #[test]
    fn unknown_meshes_are_skipped() {
        let calls = plan_draws(
            &[],
            1,
            &[DrawInstance {
                mesh: MeshHandle(7),
                transform: Mat4::IDENTITY,
            }],
        );
        assert!(calls.is_empty());
    }

    #[test]
    fn primitives_past_the_material_table_are_skipped() {
        let meshes = [mesh(vec![prim(0, 999), prim(0, 0)], vec![Mat4::IDENTITY])];
        let draw = DrawInstance {
            mesh: MeshHandle(0),
            transform: Mat4::IDENTITY,
        };
        let calls = plan_draws(&meshes, 1, &[draw]);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].push.material, 0);
        assert!(plan_draws(&meshes, 0, &[draw]).is_empty());
    }

    fn texture(width: u32, height: u32, bytes: usize) -> TextureData {
        TextureData {
            width,
            height,
            rgba: vec![0; bytes],
            role: TextureRole::BaseColor,
        }
    }

    fn stage_of(err: VkError) -> &'static str {
        match err {
            VkError::Upload { stage, .. } => stage,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn zero_sized_textures_are_rejected() {
        for tex in [texture(0, 0, 0), texture(4, 0, 0), texture(0, 4, 0)] {
            let err = check_texture_batch(1, &[tex]).unwrap_err();
            assert_eq!(stage_of(err), "texture extent");
        }
    }

    #[test]
    fn a_bad_texture_late_in_the_batch_fails_the_whole_batch() {
        let batch = [texture(2, 2, 16), texture(1, 1, 4), texture(2, 2, 15)];
        let err = check_texture_batch(1, &batch).unwrap_err();
        assert_eq!(stage_of(err), "texture size check");
        assert!(check_texture_batch(1, &batch[..2]).is_ok());
        assert!(matches!(
            check_texture_batch(MAX_TEXTURES as usize, &batch[..1]),
            Err(VkError::TextureLimit { free: 0, .. })
        ));
    }

    fn packed(vertices: usize, indices: &[u32], prims: Vec<Primitive>) -> MeshData {
        let verts = vec![lumen_render::Vertex::default(); vertices];
        MeshData::pack(&verts, indices, prims, vec![Mat4::IDENTITY])
    }

    #[test]
    fn packed_meshes_pass_the_layout_check() {
        let two_triangles = Primitive {
            index_count: 6,
            ..prim(0, 0)
        };
        let mesh = packed(3, &[0, 1, 2, 2, 1, 0], vec![two_triangles]);
        assert!(check_mesh_layout(&mesh).is_ok());
        assert!(check_mesh_layout(&MeshData::default()).is_ok());
    }

    #[test]
    fn misplaced_index_block_is_rejected() {
        let mut mesh = packed(3, &[0, 1, 2], Vec::new());
        mesh.index_offset += 2;
        assert_eq!(stage_of(check_mesh_layout(&mesh).unwrap_err()), "mesh index offset");

        let mut past_end = packed(3, &[0, 1, 2], Vec::new());
        past_end.index_offset = past_end.bytes.len() as u64 + 4;
        assert!(check_mesh_layout(&past_end).is_err());

        let mut ragged = packed(3, &[0, 1, 2], Vec::new());
        ragged.bytes.push(0);
        assert!(check_mesh_layout(&ragged).is_err());
    }

    #[test]
    fn primitive_reading_past_the_index_block_is_rejected() {
        // prim() asks for 36 indices; only three are packed.
        let mesh = packed(3, &[0, 1, 2], vec![prim(0, 0)]);
        assert_eq!(stage_of(check_mesh_layout(&mesh).unwrap_err()), "mesh primitive range");
    }

    #[test]
    fn material_texture_slot_must_fit_the_table() {
        let ok = MaterialRecord {
            texture: MAX_TEXTURES - 1,
            ..Default::default()
        };
        assert!(check_material_records(&[MaterialRecord::default(), ok]).is_ok());
        let bad = MaterialRecord {
            texture: MAX_TEXTURES,
            ..Default::default()
        };
        let err = check_material_records(&[ok, bad]).unwrap_err();
        assert_eq!(stage_of(err), "material texture slot");
    }

    #[test]
    fn texture_format_follows_role() {
        assert_eq!(texture_format(TextureRole::BaseColor), vk::Format::R8G8B8A8_SRGB);
        assert_eq!(texture_format(TextureRole::Normal), vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn texture_table_fills_unused_slots_with_slot_zero() {
        use ash::vk::Handle;
        let views = [vk::ImageView::from_raw(11), vk::ImageView::from_raw(22)];
        let table = fill_texture_table(&views, vk::Sampler::null());
        assert_eq!(table.len(), MAX_TEXTURES as usize);
        assert_eq!(table[1].image_view, views[1]);
        assert_eq!(table[2].image_view, views[0]);
        assert_eq!(table[MAX_TEXTURES as usize - 1].image_view, views[0]);
        assert!(table
            .iter()
            .all(|i| i.image_layout == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL));
    }

    #[test]
    fn texture_capacity_is_enforced() {
        assert!(check_texture_capacity(1, 15).is_ok());
        match check_texture_capacity(10, 7) {
            Err(VkError::TextureLimit { requested, free }) => assert_eq!((requested, free), (7, 6)),
            other => panic!("unexpected {other:?}"),
        }
    }
}
