use ash::vk;
use naga::valid::{Capabilities, ValidationFlags, Validator};

use crate::error::RendererError;

const SHADER_SOURCE: &str = include_str!("./shader.wgsl");

/// SPIR-V for the two entry points of the paint shader.
pub(crate) struct CompiledShaders {
    pub(crate) vertex: Vec<u32>,
    pub(crate) fragment: Vec<u32>,
}

/// Translates the embedded WGSL to SPIR-V. Runs once at backend startup;
/// any failure here is a build defect surfaced as a construction error.
pub(crate) fn compile() -> Result<CompiledShaders, RendererError> {
    let module = naga::front::wgsl::parse_str(SHADER_SOURCE)
        .map_err(|err| RendererError::ShaderCompile(err.emit_to_string(SHADER_SOURCE)))?;
    let info = Validator::new(ValidationFlags::all(), Capabilities::PUSH_CONSTANT)
        .validate(&module)
        .map_err(|err| RendererError::ShaderCompile(format!("{err:?}")))?;

    let mut options = naga::back::spv::Options::default();
    options.lang_version = (1, 0);
    // The vertex stage emits Vulkan clip space directly; no Y-flip pass.
    options
        .flags
        .remove(naga::back::spv::WriterFlags::ADJUST_COORDINATE_SPACE);
    let stage = |shader_stage, entry_point: &str| {
        let pipeline_options = naga::back::spv::PipelineOptions {
            shader_stage,
            entry_point: entry_point.to_owned(),
        };
        naga::back::spv::write_vec(&module, &info, &options, Some(&pipeline_options))
            .map_err(|err| RendererError::ShaderCompile(err.to_string()))
    };

    Ok(CompiledShaders {
        vertex: stage(naga::ShaderStage::Vertex, "vs_main")?,
        fragment: stage(naga::ShaderStage::Fragment, "fs_main")?,
    })
}

pub(crate) fn create_module(
    device: &ash::Device,
    words: &[u32],
) -> Result<vk::ShaderModule, RendererError> {
    let info = vk::ShaderModuleCreateInfo::default().code(words);
    unsafe {
        device
            .create_shader_module(&info, None)
            .map_err(RendererError::CreateShaderModule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shader_compiles_for_both_stages() {
        let shaders = compile().expect("embedded shader must compile");
        // SPIR-V streams start with the magic number.
        assert_eq!(shaders.vertex[0], 0x0723_0203);
        assert_eq!(shaders.fragment[0], 0x0723_0203);
    }
}
