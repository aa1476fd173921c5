/// GPU material record (64 bytes), consumed by the closest-hit shader.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Material {
    pub base_color: [f32; 4],
    pub emission: [f32; 4],
    pub light_index: i32,
    pub roughness: f32,
    pub metallic: f32,
    pub ior: f32,
    pub transmission: f32,
    pub tex_id: u32,
    pub _pad: [u32; 2],
}

#[allow(dead_code)]
impl Material {
    pub fn new(base_color: [f32; 4]) -> Self {
        Self {
            base_color,
            emission: [0.0; 4],
            light_index: -1,
            roughness: 0.5,
            metallic: 0.0,
            ior: 1.0,
            transmission: 0.0,
            tex_id: 0, // default white texture
            _pad: [0; 2],
        }
    }

    pub fn light_index(mut self, index: i32) -> Self {
        self.light_index = index;
        self
    }

    pub fn emission(mut self, color: [f32; 3], intensity: f32) -> Self {
        self.emission = [
            color[0] * intensity,
            color[1] * intensity,
            color[2] * intensity,
            0.0,
        ];
        self
    }

    pub fn metallic(mut self, roughness: f32) -> Self {
        self.metallic = 1.0;
        self.roughness = roughness;
        self
    }

    pub fn roughness(mut self, roughness: f32) -> Self {
        self.roughness = roughness;
        self
    }

    pub fn glass(mut self, ior: f32) -> Self {
        self.metallic = 0.0;
        self.roughness = 0.0;
        self.ior = ior;
        self.transmission = 1.0;
        self
    }

    pub fn texture(mut self, id: u32) -> Self {
        self.tex_id = id;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn material_record_is_64_bytes() {
        assert_eq!(std::mem::size_of::<Material>(), 64);
    }
}
