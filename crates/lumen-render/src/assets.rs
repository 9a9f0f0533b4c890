// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use lumen_math::{CameraBlock, LightBlock};

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

/// One indexed draw inside a packed mesh buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Primitive {
    pub first_index: u32,
    pub index_count: u32,
    pub vertex_offset: i32,
    /// Absolute index into the material buffer.
    pub material: u32,
    /// Index into [`MeshData::node_transforms`].
    pub node: usize,
}

/// Vertices followed by `u32` indices in one blob; `index_offset` is the boundary.
#[derive(Clone, Debug, Default)]
pub struct MeshData {
    pub bytes: Vec<u8>,
    pub index_offset: u64,
    pub primitives: Vec<Primitive>,
    pub node_transforms: Vec<Mat4>,
}

impl MeshData {
    pub fn pack(
        vertices: &[Vertex],
        indices: &[u32],
        primitives: Vec<Primitive>,
        node_transforms: Vec<Mat4>,
    ) -> Self {
        let vtx: &[u8] = bytemuck::cast_slice(vertices);
        let idx: &[u8] = bytemuck::cast_slice(indices);
        let mut bytes = Vec::with_capacity(vtx.len() + idx.len());
        bytes.extend_from_slice(vtx);
        bytes.extend_from_slice(idx);
        Self {
            bytes,
            index_offset: vtx.len() as u64,
            primitives,
            node_transforms,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MeshHandle(pub u32);

/// Storage-buffer material record (std430, 32 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct MaterialRecord {
    pub base_color: [f32; 4],
    /// Slot in the texture table; 0 is plain white.
    pub texture: u32,
    pub roughness: f32,
    pub metallic: f32,
    pub _pad: u32,
}

impl Default for MaterialRecord {
    fn default() -> Self {
        Self {
            base_color: [1.0; 4],
            texture: 0,
            roughness: 1.0,
            metallic: 0.0,
            _pad: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaterialRange {
    pub first: u32,
    pub count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureRole {
    BaseColor,
    Normal,
    MetallicRoughness,
    Occlusion,
    Emissive,
}

impl TextureRole {
    /// Base colour is stored sRGB-encoded; everything else is linear.
    pub fn is_srgb(self) -> bool {
        matches!(self, Self::BaseColor)
    }
}

/// Tightly packed RGBA8 pixels.
#[derive(Clone, Debug)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
    pub role: TextureRole,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureRange {
    pub first: u32,
    pub count: u32,
}

/// Consumption points for the asset collaborator.
pub trait AssetSink {
    fn upload_mesh_buffer(&mut self, mesh: MeshData) -> Result<MeshHandle>;
    fn upload_materials(&mut self, materials: &[MaterialRecord]) -> Result<MaterialRange>;
    fn register_textures(&mut self, textures: Vec<TextureData>) -> Result<TextureRange>;
}

#[derive(Clone, Copy, Debug)]
pub struct DrawInstance {
    pub mesh: MeshHandle,
    pub transform: Mat4,
}

/// Simulation output consumed by one render tick.
#[derive(Clone, Debug, Default)]
pub struct FrameScene {
    pub camera: CameraBlock,
    pub lighting: LightBlock,
    pub draws: Vec<DrawInstance>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_places_indices_after_vertices() {
        let verts = [Vertex::default(); 3];
        let mesh = MeshData::pack(&verts, &[0, 1, 2], Vec::new(), vec![Mat4::IDENTITY]);
        assert_eq!(mesh.index_offset, 3 * 32);
        assert_eq!(mesh.bytes.len(), 3 * 32 + 3 * 4);
        let tail: Vec<u32> = mesh.bytes[mesh.index_offset as usize..]
            .chunks_exact(4)
            .map(|c| u32::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(tail, vec![0, 1, 2]);
    }

    #[test]
    fn material_record_is_std430_sized() {
        assert_eq!(std::mem::size_of::<MaterialRecord>(), 32);
        assert_eq!(std::mem::size_of::<Vertex>(), 32);
    }

    #[test]
    fn only_colour_roles_are_srgb() {
        assert!(TextureRole::BaseColor.is_srgb());
        assert!(!TextureRole::Normal.is_srgb());
        assert!(!TextureRole::MetallicRoughness.is_srgb());
    }
}
