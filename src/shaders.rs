use log::debug;

use crate::error::{Result, RtError};

/// SPIR-V binaries for every stage the pipeline binds.
pub struct ShaderSet {
    pub raygen: Vec<u32>,
    pub miss: Vec<u32>,
    pub miss_shadow: Vec<u32>,
    pub closest_hit_diffuse: Vec<u32>,
}

/// Compile the embedded GLSL sources. Shader sources ship with the crate
/// and are compiled when the pipeline is (re)built, so there is no offline
/// SPIR-V artifact to keep in sync.
pub fn compile_embedded() -> Result<ShaderSet> {
    let compiler = shaderc::Compiler::new()
        .ok_or_else(|| RtError::ShaderCompile("failed to initialize shaderc".into()))?;
    let mut options = shaderc::CompileOptions::new()
        .ok_or_else(|| RtError::ShaderCompile("failed to create compile options".into()))?;
    options.set_target_env(shaderc::TargetEnv::Vulkan, shaderc::EnvVersion::Vulkan1_2 as u32);
    options.set_target_spirv(shaderc::SpirvVersion::V1_4);

    let compile = |source: &str, kind: shaderc::ShaderKind, name: &str| -> Result<Vec<u32>> {
        let artifact = compiler
            .compile_into_spirv(source, kind, name, "main", Some(&options))
            .map_err(|err| RtError::ShaderCompile(format!("{name}: {err}")))?;
        debug!("Compiled {name} ({} words)", artifact.as_binary().len());
        Ok(artifact.as_binary().to_vec())
    };

    Ok(ShaderSet {
        raygen: compile(
            include_str!("shaders/raytrace.rgen"),
            shaderc::ShaderKind::RayGeneration,
            "raytrace.rgen",
        )?,
        miss: compile(
            include_str!("shaders/raytrace.rmiss"),
            shaderc::ShaderKind::Miss,
            "raytrace.rmiss",
        )?,
        miss_shadow: compile(
            include_str!("shaders/shadow.rmiss"),
            shaderc::ShaderKind::Miss,
            "shadow.rmiss",
        )?,
        closest_hit_diffuse: compile(
            include_str!("shaders/diffuse.rchit"),
            shaderc::ShaderKind::ClosestHit,
            "diffuse.rchit",
        )?,
    })
}
