use std::collections::HashMap;

use glam::Vec3;

/// Vertex layout shared by the geometry buffers and the hit shaders (32
/// bytes, tightly packed so the std430 view in GLSL matches).
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

/// CPU-side triangle mesh, ready to be registered.
pub struct MeshGeometry {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

/// Where a registered mesh lives inside the shared vertex/index buffers.
/// Offsets and counts are in elements; byte accessors convert for the
/// acceleration structure build ranges.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MeshRecord {
    pub vertex_offset: u32,
    pub vertex_count: u32,
    pub index_offset: u32,
    pub index_count: u32,
}

impl MeshRecord {
    pub fn vertex_byte_offset(&self) -> u64 {
        self.vertex_offset as u64 * std::mem::size_of::<Vertex>() as u64
    }

    pub fn index_byte_offset(&self) -> u64 {
        self.index_offset as u64 * std::mem::size_of::<u32>() as u64
    }

    pub fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }
}

/// Tracks every loaded mesh and its ranges inside two process-wide,
/// append-only arrays. Records are immutable once registered and are never
/// individually freed; the registry is the sole owner of the ranges.
///
/// Offsets come from the registry's own accumulators, so building a second
/// registry (or re-running a build) can never inherit stale state.
#[derive(Default)]
pub struct GeometryRegistry {
    vertices: Vec<Vertex>,
    indices: Vec<u32>,
    meshes: Vec<MeshRecord>,
}

impl GeometryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a mesh and return its stable index. Indices stay local to the
    /// mesh; the build range's `first_vertex` rebases them.
    pub fn register(&mut self, geometry: MeshGeometry) -> u32 {
        let record = MeshRecord {
            vertex_offset: self.vertices.len() as u32,
            vertex_count: geometry.vertices.len() as u32,
            index_offset: self.indices.len() as u32,
            index_count: geometry.indices.len() as u32,
        };
        self.vertices.extend_from_slice(&geometry.vertices);
        self.indices.extend_from_slice(&geometry.indices);
        self.meshes.push(record);
        self.meshes.len() as u32 - 1
    }

    pub fn meshes(&self) -> &[MeshRecord] {
        &self.meshes
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn len(&self) -> usize {
        self.meshes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }
}

// --- Primitive generators for demo scenes and tests ---

/// 1x1 plane on the XZ axis, centered at the origin.
pub fn create_plane() -> MeshGeometry {
    let normal = [0.0, 1.0, 0.0];
    let vertices = vec![
        Vertex {
            position: [-0.5, 0.0, 0.5],
            normal,
            uv: [0.0, 1.0],
        },
        Vertex {
            position: [0.5, 0.0, 0.5],
            normal,
            uv: [1.0, 1.0],
        },
        Vertex {
            position: [-0.5, 0.0, -0.5],
            normal,
            uv: [0.0, 0.0],
        },
        Vertex {
            position: [0.5, 0.0, -0.5],
            normal,
            uv: [1.0, 0.0],
        },
    ];
    let indices = vec![0, 1, 2, 2, 1, 3];
    MeshGeometry { vertices, indices }
}

/// Unit cube centered at the origin, flat normals per face.
pub fn create_cube() -> MeshGeometry {
    let mut vertices = Vec::new();
    let mut indices = Vec::new();
    let mut base = 0u32;

    let sides = [
        (
            [0.0, 0.0, 1.0],
            [-0.5, -0.5, 0.5],
            [0.5, -0.5, 0.5],
            [0.5, 0.5, 0.5],
            [-0.5, 0.5, 0.5],
        ), // Front
        (
            [0.0, 0.0, -1.0],
            [0.5, -0.5, -0.5],
            [-0.5, -0.5, -0.5],
            [-0.5, 0.5, -0.5],
            [0.5, 0.5, -0.5],
        ), // Back
        (
            [0.0, 1.0, 0.0],
            [-0.5, 0.5, 0.5],
            [0.5, 0.5, 0.5],
            [0.5, 0.5, -0.5],
            [-0.5, 0.5, -0.5],
        ), // Top
        (
            [0.0, -1.0, 0.0],
            [-0.5, -0.5, -0.5],
            [0.5, -0.5, -0.5],
            [0.5, -0.5, 0.5],
            [-0.5, -0.5, 0.5],
        ), // Bottom
        (
            [1.0, 0.0, 0.0],
            [0.5, -0.5, 0.5],
            [0.5, -0.5, -0.5],
            [0.5, 0.5, -0.5],
            [0.5, 0.5, 0.5],
        ), // Right
        (
            [-1.0, 0.0, 0.0],
            [-0.5, -0.5, -0.5],
            [-0.5, -0.5, 0.5],
            [-0.5, 0.5, 0.5],
            [-0.5, 0.5, -0.5],
        ), // Left
    ];

    for (normal, v0, v1, v2, v3) in sides {
        let uvs = [[0.0, 1.0], [1.0, 1.0], [1.0, 0.0], [0.0, 0.0]];
        for (position, uv) in [v0, v1, v2, v3].into_iter().zip(uvs) {
            vertices.push(Vertex {
                position,
                normal,
                uv,
            });
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        base += 4;
    }

    MeshGeometry { vertices, indices }
}

/// Icosphere of radius 0.5 with smooth normals.
pub fn create_sphere(subdivisions: u32) -> MeshGeometry {
    let mut vertices = Vec::new();
    let mut indices = Vec::new();

    let t = (1.0 + 5.0f32.sqrt()) / 2.0;

    fn add_vertex(vertices: &mut Vec<Vertex>, p: [f32; 3]) -> u32 {
        let n = Vec3::from(p).normalize();
        vertices.push(Vertex {
            position: (n * 0.5).to_array(),
            normal: n.to_array(),
            uv: [0.0, 0.0], // TODO: spherical mapping
        });
        vertices.len() as u32 - 1
    }

    for p in [
        [-1.0, t, 0.0],
        [1.0, t, 0.0],
        [-1.0, -t, 0.0],
        [1.0, -t, 0.0],
        [0.0, -1.0, t],
        [0.0, 1.0, t],
        [0.0, -1.0, -t],
        [0.0, 1.0, -t],
        [t, 0.0, -1.0],
        [t, 0.0, 1.0],
        [-t, 0.0, -1.0],
        [-t, 0.0, 1.0],
    ] {
        add_vertex(&mut vertices, p);
    }

    let mut faces = vec![
        [0, 11, 5],
        [0, 5, 1],
        [0, 1, 7],
        [0, 7, 10],
        [0, 10, 11],
        [1, 5, 9],
        [5, 11, 4],
        [11, 10, 2],
        [10, 7, 6],
        [7, 1, 8],
        [3, 9, 4],
        [3, 4, 2],
        [3, 2, 6],
        [3, 6, 8],
        [3, 8, 9],
        [4, 9, 5],
        [2, 4, 11],
        [6, 2, 10],
        [8, 6, 7],
        [9, 8, 1],
    ];

    let mut midpoint_cache = HashMap::new();
    for _ in 0..subdivisions {
        let mut new_faces = Vec::new();
        for [v1, v2, v3] in faces {
            let a = get_midpoint(v1, v2, &mut vertices, &mut midpoint_cache);
            let b = get_midpoint(v2, v3, &mut vertices, &mut midpoint_cache);
            let c = get_midpoint(v3, v1, &mut vertices, &mut midpoint_cache);

            new_faces.push([v1, a, c]);
            new_faces.push([v2, b, a]);
            new_faces.push([v3, c, b]);
            new_faces.push([a, b, c]);
        }
        faces = new_faces;
    }

    for tri in faces {
        indices.extend_from_slice(&tri);
    }

    MeshGeometry { vertices, indices }
}

fn get_midpoint(
    p1: u32,
    p2: u32,
    vertices: &mut Vec<Vertex>,
    cache: &mut HashMap<(u32, u32), u32>,
) -> u32 {
    let key = if p1 < p2 { (p1, p2) } else { (p2, p1) };
    if let Some(&index) = cache.get(&key) {
        return index;
    }

    let v1 = Vec3::from(vertices[p1 as usize].position);
    let v2 = Vec3::from(vertices[p2 as usize].position);
    let n = ((v1 + v2) * 0.5).normalize();

    vertices.push(Vertex {
        position: (n * 0.5).to_array(),
        normal: n.to_array(),
        uv: [0.0, 0.0],
    });

    let index = vertices.len() as u32 - 1;
    cache.insert(key, index);
    index
}

/// Single unit triangle, handy for tests and smoke scenes.
pub fn create_triangle() -> MeshGeometry {
    let normal = [0.0, 0.0, 1.0];
    MeshGeometry {
        vertices: vec![
            Vertex {
                position: [0.0, 0.5, 0.0],
                normal,
                uv: [0.5, 0.0],
            },
            Vertex {
                position: [-0.5, -0.5, 0.0],
                normal,
                uv: [0.0, 1.0],
            },
            Vertex {
                position: [0.5, -0.5, 0.0],
                normal,
                uv: [1.0, 1.0],
            },
        ],
        indices: vec![0, 1, 2],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_assigns_stable_append_only_offsets() {
        let mut registry = GeometryRegistry::new();
        let triangle = registry.register(create_triangle());
        let plane = registry.register(create_plane());

        assert_eq!(triangle, 0);
        assert_eq!(plane, 1);

        let records = registry.meshes();
        assert_eq!(records[0].vertex_offset, 0);
        assert_eq!(records[0].vertex_count, 3);
        assert_eq!(records[0].index_offset, 0);
        assert_eq!(records[0].index_count, 3);

        assert_eq!(records[1].vertex_offset, 3);
        assert_eq!(records[1].vertex_count, 4);
        assert_eq!(records[1].index_offset, 3);
        assert_eq!(records[1].index_count, 6);

        // Registering more meshes never moves earlier records.
        let before = records[0];
        registry.register(create_cube());
        assert_eq!(registry.meshes()[0], before);
    }

    #[test]
    fn byte_offsets_follow_element_offsets() {
        let mut registry = GeometryRegistry::new();
        registry.register(create_triangle());
        registry.register(create_triangle());

        let second = registry.meshes()[1];
        assert_eq!(
            second.vertex_byte_offset(),
            3 * std::mem::size_of::<Vertex>() as u64
        );
        assert_eq!(second.index_byte_offset(), 3 * 4);
        assert_eq!(second.triangle_count(), 1);
    }

    #[test]
    fn fresh_registry_starts_at_zero() {
        // A second registry must not inherit offsets from the first.
        let mut first = GeometryRegistry::new();
        first.register(create_cube());

        let mut second = GeometryRegistry::new();
        let id = second.register(create_triangle());
        assert_eq!(id, 0);
        assert_eq!(second.meshes()[0].vertex_offset, 0);
    }

    #[test]
    fn generated_meshes_are_triangle_lists() {
        for geometry in [create_plane(), create_cube(), create_sphere(2)] {
            assert_eq!(geometry.indices.len() % 3, 0);
            let max = *geometry.indices.iter().max().unwrap();
            assert!((max as usize) < geometry.vertices.len());
        }
    }
}
