use crate::error::ResourceError;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3};
use serde::{Deserialize, Serialize};

/// GPU vertex layout shared by every mesh.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
    /// xyz = tangent, w = bitangent sign.
    pub tangent: [f32; 4],
}

impl Vertex {
    pub fn new(position: [f32; 3], normal: [f32; 3], uv: [f32; 2]) -> Self {
        Self {
            position,
            normal,
            uv,
            tangent: [1.0, 0.0, 0.0, 1.0],
        }
    }
}

/// Axis-aligned bounding box in mesh space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let (min, max) = iter.fold((first, first), |(lo, hi), p| (lo.min(p), hi.max(p)));
        Some(Self { min, max })
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn half_extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    /// Bounds of this box after transformation (conservative, axis aligned).
    pub fn transformed(&self, m: &Mat4) -> Self {
        let center = m.transform_point3(self.center());
        let h = self.half_extents();
        let x = m.x_axis.truncate().abs() * h.x;
        let y = m.y_axis.truncate().abs() * h.y;
        let z = m.z_axis.truncate().abs() * h.z;
        let extent = x + y + z;
        Self {
            min: center - extent,
            max: center + extent,
        }
    }
}

/// CPU-side mesh data. Uploaded to the GPU by the renderer on first use.
#[derive(Debug, Clone)]
pub struct Mesh {
    pub name: String,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub bounds: Aabb,
}

impl Mesh {
    /// Build a mesh, validating indices and computing bounds.
    pub fn new(
        name: impl Into<String>,
        vertices: Vec<Vertex>,
        indices: Vec<u32>,
    ) -> Result<Self, ResourceError> {
        let name = name.into();
        if indices.len() % 3 != 0 {
            return Err(ResourceError::InvalidMesh {
                name,
                reason: format!("index count {} is not a multiple of 3", indices.len()),
            });
        }
        if let Some(bad) = indices.iter().find(|&&i| i as usize >= vertices.len()) {
            return Err(ResourceError::InvalidMesh {
                name,
                reason: format!("index {bad} out of range for {} vertices", vertices.len()),
            });
        }
        let bounds = Aabb::from_points(vertices.iter().map(|v| Vec3::from(v.position))).ok_or_else(
            || ResourceError::InvalidMesh {
                name: name.clone(),
                reason: "mesh has no vertices".into(),
            },
        )?;
        Ok(Self {
            name,
            vertices,
            indices,
            bounds,
        })
    }

    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }

    /// Recompute per-vertex tangents from positions and uvs.
    pub fn compute_tangents(&mut self) {
        let mut tan = vec![Vec3::ZERO; self.vertices.len()];
        let mut bitan = vec![Vec3::ZERO; self.vertices.len()];
        for tri in self.indices.chunks_exact(3) {
            let [a, b, c] = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
            let (p0, p1, p2) = (
                Vec3::from(self.vertices[a].position),
                Vec3::from(self.vertices[b].position),
                Vec3::from(self.vertices[c].position),
            );
            let (uv0, uv1, uv2) = (
                Vec2::from(self.vertices[a].uv),
                Vec2::from(self.vertices[b].uv),
                Vec2::from(self.vertices[c].uv),
            );
            let (e1, e2) = (p1 - p0, p2 - p0);
            let (d1, d2) = (uv1 - uv0, uv2 - uv0);
            let det = d1.x * d2.y - d2.x * d1.y;
            if det.abs() < f32::EPSILON {
                continue;
            }
            let r = 1.0 / det;
            let t = (e1 * d2.y - e2 * d1.y) * r;
            let bt = (e2 * d1.x - e1 * d2.x) * r;
            for i in [a, b, c] {
                tan[i] += t;
                bitan[i] += bt;
            }
        }
        for (i, v) in self.vertices.iter_mut().enumerate() {
            let n = Vec3::from(v.normal);
            // Gram-Schmidt against the normal.
            let t = (tan[i] - n * n.dot(tan[i])).normalize_or_zero();
            let t = if t == Vec3::ZERO { n.any_orthonormal_vector() } else { t };
            let w = if n.cross(t).dot(bitan[i]) < 0.0 { -1.0 } else { 1.0 };
            v.tangent = [t.x, t.y, t.z, w];
        }
    }
}

/// On-disk mesh description (JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshDesc {
    pub name: String,
    pub positions: Vec<[f32; 3]>,
    #[serde(default)]
    pub normals: Vec<[f32; 3]>,
    #[serde(default)]
    pub uvs: Vec<[f32; 2]>,
    pub indices: Vec<u32>,
}

impl MeshDesc {
    /// Convert to a mesh. Missing normals default to +Y, missing uvs to zero.
    pub fn into_mesh(self) -> Result<Mesh, ResourceError> {
        let vertices = self
            .positions
            .iter()
            .enumerate()
            .map(|(i, p)| {
                Vertex::new(
                    *p,
                    self.normals.get(i).copied().unwrap_or([0.0, 1.0, 0.0]),
                    self.uvs.get(i).copied().unwrap_or([0.0, 0.0]),
                )
            })
            .collect();
        let mut mesh = Mesh::new(self.name, vertices, self.indices)?;
        mesh.compute_tangents();
        Ok(mesh)
    }
}

/// Built-in geometry, registered under `builtin:` names.
pub mod primitives {
    use super::{Mesh, Vertex};
    use std::f32::consts::PI;

    pub const CUBE: &str = "builtin:cube";
    pub const QUAD: &str = "builtin:quad";
    pub const SPHERE: &str = "builtin:sphere";

    fn finish(name: &str, vertices: Vec<Vertex>, indices: Vec<u32>) -> Mesh {
        let mut mesh = match Mesh::new(name, vertices, indices) {
            Ok(mesh) => mesh,
            Err(e) => unreachable!("built-in mesh {name} is malformed: {e}"),
        };
        mesh.compute_tangents();
        mesh
    }

    /// Unit cube centered at the origin.
    pub fn cube() -> Mesh {
        let faces: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
            ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
            ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
            ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
            ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
        ];
        let mut vertices = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);
        for (n, u, v) in faces {
            let base = vertices.len() as u32;
            for (su, sv, uv) in [
                (-1.0, -1.0, [0.0, 1.0]),
                (1.0, -1.0, [1.0, 1.0]),
                (1.0, 1.0, [1.0, 0.0]),
                (-1.0, 1.0, [0.0, 0.0]),
            ] {
                let p = [
                    0.5 * (n[0] + su * u[0] + sv * v[0]),
                    0.5 * (n[1] + su * u[1] + sv * v[1]),
                    0.5 * (n[2] + su * u[2] + sv * v[2]),
                ];
                vertices.push(Vertex::new(p, n, uv));
            }
            indices.extend_from_slice(&[base, base + 1, base + 2, base + 2, base + 3, base]);
        }
        finish(CUBE, vertices, indices)
    }

    /// Unit quad in the XZ plane facing +Y.
    pub fn quad() -> Mesh {
        let n = [0.0, 1.0, 0.0];
        let vertices = vec![
            Vertex::new([-0.5, 0.0, 0.5], n, [0.0, 1.0]),
            Vertex::new([0.5, 0.0, 0.5], n, [1.0, 1.0]),
            Vertex::new([0.5, 0.0, -0.5], n, [1.0, 0.0]),
            Vertex::new([-0.5, 0.0, -0.5], n, [0.0, 0.0]),
        ];
        finish(QUAD, vertices, vec![0, 1, 2, 2, 3, 0])
    }

    /// UV sphere of radius 0.5.
    pub fn sphere(segments: u32, rings: u32) -> Mesh {
        let segments = segments.max(3);
        let rings = rings.max(2);
        let mut vertices = Vec::new();
        for r in 0..=rings {
            let v = r as f32 / rings as f32;
            let theta = v * PI;
            for s in 0..=segments {
                let u = s as f32 / segments as f32;
                let phi = u * 2.0 * PI;
                let n = [theta.sin() * phi.cos(), theta.cos(), theta.sin() * phi.sin()];
                vertices.push(Vertex::new([n[0] * 0.5, n[1] * 0.5, n[2] * 0.5], n, [u, v]));
            }
        }
        let stride = segments + 1;
        let mut indices = Vec::new();
        for r in 0..rings {
            for s in 0..segments {
                let a = r * stride + s;
                let b = a + stride;
                indices.extend_from_slice(&[a, a + 1, b, b, a + 1, b + 1]);
            }
        }
        finish(SPHERE, vertices, indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_has_expected_counts_and_bounds() {
        let cube = primitives::cube();
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.index_count(), 36);
        assert_eq!(cube.bounds.min, Vec3::splat(-0.5));
        assert_eq!(cube.bounds.max, Vec3::splat(0.5));
    }

    #[test]
    fn sphere_indices_in_range() {
        let sphere = primitives::sphere(16, 8);
        let n = sphere.vertices.len() as u32;
        assert!(sphere.indices.iter().all(|&i| i < n));
    }

    #[test]
    fn rejects_out_of_range_index() {
        let v = vec![Vertex::new([0.0; 3], [0.0, 1.0, 0.0], [0.0; 2]); 3];
        let err = Mesh::new("bad", v, vec![0, 1, 3]).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn rejects_partial_triangle() {
        let v = vec![Vertex::new([0.0; 3], [0.0, 1.0, 0.0], [0.0; 2]); 3];
        assert!(Mesh::new("bad", v, vec![0, 1]).is_err());
    }

    #[test]
    fn quad_tangent_follows_u_axis() {
        let quad = primitives::quad();
        let t = quad.vertices[0].tangent;
        assert!((Vec3::new(t[0], t[1], t[2]) - Vec3::X).length() < 1e-4);
    }

    #[test]
    fn aabb_transform_is_conservative() {
        let b = Aabb {
            min: Vec3::splat(-1.0),
            max: Vec3::splat(1.0),
        };
        let m = Mat4::from_translation(Vec3::new(5.0, 0.0, 0.0))
            * Mat4::from_rotation_y(std::f32::consts::FRAC_PI_4);
        let t = b.transformed(&m);
        assert!((t.center() - Vec3::new(5.0, 0.0, 0.0)).length() < 1e-5);
        assert!(t.half_extents().x > 1.4);
    }

    #[test]
    fn mesh_desc_fills_defaults() {
        let desc = MeshDesc {
            name: "tri".into(),
            positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]],
            normals: vec![],
            uvs: vec![],
            indices: vec![0, 1, 2],
        };
        let mesh = desc.into_mesh().unwrap();
        assert_eq!(mesh.vertices[2].normal, [0.0, 1.0, 0.0]);
    }
}
