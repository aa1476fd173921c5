use ash::vk;

/// Centralized error type for the ray tracing subsystem.
///
/// GPU API failures are not recoverable mid-frame: callers are expected to
/// log and terminate. Missing scene references degrade gracefully (the
/// object is skipped) and never surface as an error.
#[derive(thiserror::Error, Debug)]
pub enum RtError {
    #[error("Vulkan call failed: {0:?}")]
    Vulkan(vk::Result),

    #[error("Shader compilation failed: {0}")]
    ShaderCompile(String),

    #[error("Deferred pipeline compilation failed: {0}")]
    PipelineDeferred(String),

    #[error("No suitable GPU memory type (type bits {type_bits:#x}, flags {flags:?})")]
    NoSuitableMemoryType {
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    },

    #[error("Shader group {0} is out of range for the compiled pipeline")]
    InvalidShaderGroup(u32),
}

impl From<vk::Result> for RtError {
    fn from(result: vk::Result) -> Self {
        RtError::Vulkan(result)
    }
}

pub type Result<T> = std::result::Result<T, RtError>;
