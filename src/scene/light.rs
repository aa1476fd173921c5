use glam::Vec3;

pub const LIGHT_KIND_QUAD: u32 = 0;
pub const LIGHT_KIND_SPHERE: u32 = 1;

/// GPU light record (64 bytes) used for next-event estimation in the
/// ray generation shader.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LightRecord {
    pub position: [f32; 3],
    pub kind: u32,
    /// Quad: half-extent vector along the first edge. Sphere: unused.
    pub u: [f32; 3],
    pub area: f32,
    /// Quad: half-extent vector along the second edge. Sphere: radius in x.
    pub v: [f32; 3],
    pub _pad: u32,
    /// RGB color, intensity in w.
    pub emission: [f32; 4],
}

impl LightRecord {
    /// Rectangle light. `u` and `v` run from the center to the edge
    /// midpoints, so the parallelogram area is `4 * |u x v|`.
    pub fn quad(position: [f32; 3], u: [f32; 3], v: [f32; 3], emission: [f32; 4]) -> Self {
        let area = Vec3::from(u).cross(Vec3::from(v)).length() * 4.0;
        Self {
            position,
            kind: LIGHT_KIND_QUAD,
            u,
            area,
            v,
            _pad: 0,
            emission,
        }
    }

    pub fn sphere(center: [f32; 3], radius: f32, emission: [f32; 4]) -> Self {
        Self {
            position: center,
            kind: LIGHT_KIND_SPHERE,
            u: [0.0; 3],
            area: 4.0 * std::f32::consts::PI * radius * radius,
            v: [radius, 0.0, 0.0],
            _pad: 0,
            emission,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quad_area_covers_full_rectangle() {
        // Half extents of 0.25 on both axes -> 0.5 x 0.5 rectangle.
        let light = LightRecord::quad(
            [0.0, 1.0, 0.0],
            [0.25, 0.0, 0.0],
            [0.0, 0.0, 0.25],
            [1.0, 1.0, 1.0, 10.0],
        );
        assert!((light.area - 0.25).abs() < 1e-6);
        assert_eq!(light.kind, LIGHT_KIND_QUAD);
    }

    #[test]
    fn sphere_area_and_radius_slot() {
        let light = LightRecord::sphere([0.0; 3], 0.5, [1.0; 4]);
        assert!((light.area - std::f32::consts::PI).abs() < 1e-6);
        assert_eq!(light.v[0], 0.5);
    }
}
