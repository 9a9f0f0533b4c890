// SPDX-License-Identifier: CEPL-1.0
//! Procedural stand-in scene: a textured cube on a ground plane under an
//! orbiting camera and a slowly turning sun.
use anyhow::Result;
use glam::{Mat4, Vec3, Vec4};
use lumen_math::{LightBlock, OrbitCamera};
use lumen_render::{
    AssetSink, DrawInstance, FrameScene, MaterialRecord, MeshData, MeshHandle, Primitive,
    RenderSize, Simulation, TextureData, TextureRole, Vertex,
};
use tracing::info;

const CUBE_FACES: [(Vec3, Vec3); 6] = [
    (Vec3::Z, Vec3::Y),
    (Vec3::NEG_Z, Vec3::Y),
    (Vec3::X, Vec3::Y),
    (Vec3::NEG_X, Vec3::Y),
    (Vec3::Y, Vec3::NEG_Z),
    (Vec3::NEG_Y, Vec3::Z),
];

/// Unit cube centred on the origin, four vertices per face, CCW from outside.
pub fn cube_geometry() -> (Vec<Vertex>, Vec<u32>) {
    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (normal, up) in CUBE_FACES {
        let right = up.cross(normal);
        let centre = normal * 0.5;
        let base = vertices.len() as u32;
        for (r, u, uv) in [
            (-0.5, -0.5, [0.0, 1.0]),
            (0.5, -0.5, [1.0, 1.0]),
            (0.5, 0.5, [1.0, 0.0]),
            (-0.5, 0.5, [0.0, 0.0]),
        ] {
            vertices.push(Vertex {
                pos: (centre + right * r + up * u).to_array(),
                normal: normal.to_array(),
                uv,
            });
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    (vertices, indices)
}

/// Square in the XZ plane facing +Y; `tiles` repeats the texture.
pub fn plane_geometry(half: f32, tiles: f32) -> (Vec<Vertex>, Vec<u32>) {
    let corner = |x: f32, z: f32, u: f32, v: f32| Vertex {
        pos: [x, 0.0, z],
        normal: [0.0, 1.0, 0.0],
        uv: [u, v],
    };
    let vertices = vec![
        corner(-half, half, 0.0, 0.0),
        corner(half, half, tiles, 0.0),
        corner(half, -half, tiles, tiles),
        corner(-half, -half, 0.0, tiles),
    ];
    (vertices, vec![0, 1, 2, 0, 2, 3])
}

pub fn checker_texture(size: u32, cells: u32) -> TextureData {
    let cell = (size / cells.max(1)).max(1);
    let mut rgba = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let light = ((x / cell) + (y / cell)) % 2 == 0;
            let v = if light { 235 } else { 60 };
            rgba.extend_from_slice(&[v, v, v, 255]);
        }
    }
    TextureData {
        width: size,
        height: size,
        rgba,
        role: TextureRole::BaseColor,
    }
}

/// Cube and plane packed into one buffer, one primitive and one node each.
pub fn scene_mesh(cube_material: u32, ground_material: u32) -> MeshData {
    let (mut vertices, mut indices) = cube_geometry();
    let cube_indices = indices.len() as u32;
    let (plane_v, plane_i) = plane_geometry(8.0, 8.0);
    let plane_base = vertices.len() as i32;
    vertices.extend_from_slice(&plane_v);
    indices.extend_from_slice(&plane_i);

    let primitives = vec![
        Primitive {
            first_index: 0,
            index_count: cube_indices,
            vertex_offset: 0,
            material: cube_material,
            node: 0,
        },
        Primitive {
            first_index: cube_indices,
            index_count: plane_i.len() as u32,
            vertex_offset: plane_base,
            material: ground_material,
            node: 1,
        },
    ];
    let nodes = vec![Mat4::from_translation(Vec3::new(0.0, 0.5, 0.0)), Mat4::IDENTITY];
    MeshData::pack(&vertices, &indices, primitives, nodes)
}

/// Direction the sun shines in at time `t` (seconds).
pub fn sun_direction(t: f32) -> Vec3 {
    let a = t * 0.2;
    Vec3::new(a.cos() * 0.5, -1.0, a.sin() * 0.5).normalize()
}

#[derive(Default)]
pub struct DemoSim {
    camera: OrbitCamera,
    mesh: Option<MeshHandle>,
    time: f32,
}

impl Simulation for DemoSim {
    fn load(&mut self, assets: &mut dyn AssetSink) -> Result<()> {
        let textures = assets.register_textures(vec![checker_texture(64, 8)])?;
        let materials = assets.upload_materials(&[
            MaterialRecord {
                base_color: [0.95, 0.55, 0.2, 1.0],
                roughness: 0.35,
                ..MaterialRecord::default()
            },
            MaterialRecord {
                texture: textures.first,
                roughness: 0.9,
                ..MaterialRecord::default()
            },
        ])?;
        let mesh = assets.upload_mesh_buffer(scene_mesh(materials.first, materials.first + 1))?;
        info!(
            "demo assets loaded (mesh {:?}, materials {}.., texture {})",
            mesh, materials.first, textures.first
        );
        self.mesh = Some(mesh);
        Ok(())
    }

    fn start(&mut self, size: RenderSize) {
        self.time = 0.0;
        info!("demo start at {}x{}", size.width, size.height);
    }

    fn update(&mut self, dt: f32, size: RenderSize) -> FrameScene {
        self.time += dt;
        self.camera.yaw = self.time * 0.3;
        let sun = sun_direction(self.time);
        FrameScene {
            camera: self.camera.block(size.width, size.height, sun),
            lighting: LightBlock {
                direction: sun.extend(0.0),
                color: Vec4::new(1.0, 0.96, 0.88, 1.0),
                ambient: Vec4::new(0.1, 0.1, 0.13, 1.0),
            },
            draws: self
                .mesh
                .map(|mesh| DrawInstance {
                    mesh,
                    transform: Mat4::IDENTITY,
                })
                .into_iter()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_faces_wind_outward() {
        let (v, i) = cube_geometry();
        assert_eq!((v.len(), i.len()), (24, 36));
        for tri in i.chunks_exact(3) {
            let [a, b, c] = [0usize, 1, 2].map(|k| Vec3::from_array(v[tri[k] as usize].pos));
            let face_normal = (b - a).cross(c - a).normalize();
            let n = Vec3::from_array(v[tri[0] as usize].normal);
            assert!(face_normal.dot(n) > 0.99, "{tri:?}");
        }
    }

    #[test]
    fn plane_faces_up() {
        let (v, i) = plane_geometry(2.0, 1.0);
        let [a, b, c] = [0usize, 1, 2].map(|k| Vec3::from_array(v[i[k] as usize].pos));
        assert!((b - a).cross(c - a).normalize().dot(Vec3::Y) > 0.99);
    }

    #[test]
    fn checker_alternates_cells() {
        let tex = checker_texture(16, 4);
        assert_eq!(tex.rgba.len(), 16 * 16 * 4);
        let px = |x: usize, y: usize| tex.rgba[(y * 16 + x) * 4];
        assert_ne!(px(0, 0), px(4, 0));
        assert_eq!(px(0, 0), px(4, 4));
        assert_eq!(tex.role, TextureRole::BaseColor);
    }

    #[test]
    fn scene_mesh_primitives_address_their_ranges() {
        let mesh = scene_mesh(1, 2);
        assert_eq!(mesh.primitives.len(), 2);
        assert_eq!(mesh.index_offset, 28 * 32);
        let ground = mesh.primitives[1];
        assert_eq!((ground.first_index, ground.index_count), (36, 6));
        assert_eq!(ground.vertex_offset, 24);
        assert_eq!(ground.material, 2);
        assert_eq!(mesh.node_transforms.len(), 2);
    }

    #[test]
    fn update_without_assets_draws_nothing() {
        let mut sim = DemoSim::default();
        let scene = sim.update(0.016, RenderSize { width: 640, height: 480 });
        assert!(scene.draws.is_empty());
        assert!(scene.lighting.direction.y < 0.0);
    }
}
