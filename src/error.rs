use ash::vk;
use thiserror::Error;

/// Errors surfaced by the backend.
///
/// Every variant wrapping a [`vk::Result`] corresponds to one native call
/// site and is fatal: the device or driver is in a state this backend does
/// not attempt to recover from, so a failed frame is abandoned rather than
/// salvaged.
#[derive(Debug, Error)]
pub enum RendererError {
    #[error("could not create buffer: {0}")]
    CreateBuffer(vk::Result),
    #[error("could not allocate device memory: {0}")]
    AllocateMemory(vk::Result),
    #[error("could not bind buffer memory: {0}")]
    BindBufferMemory(vk::Result),
    #[error("could not bind image memory: {0}")]
    BindImageMemory(vk::Result),
    #[error("could not map device memory: {0}")]
    MapMemory(vk::Result),
    #[error("could not create graphics pipeline: {0}")]
    CreatePipeline(vk::Result),
    #[error("could not create pipeline layout: {0}")]
    CreatePipelineLayout(vk::Result),
    #[error("could not create descriptor set layout: {0}")]
    CreateDescriptorSetLayout(vk::Result),
    #[error("could not create descriptor pool: {0}")]
    CreateDescriptorPool(vk::Result),
    #[error("could not allocate descriptor sets: {0}")]
    AllocateDescriptorSets(vk::Result),
    #[error("could not create image: {0}")]
    CreateImage(vk::Result),
    #[error("could not create image view: {0}")]
    CreateImageView(vk::Result),
    #[error("could not create sampler: {0}")]
    CreateSampler(vk::Result),
    #[error("could not create shader module: {0}")]
    CreateShaderModule(vk::Result),
    #[error("could not create command pool: {0}")]
    CreateCommandPool(vk::Result),
    #[error("could not allocate command buffer: {0}")]
    AllocateCommandBuffer(vk::Result),
    #[error("could not begin command buffer: {0}")]
    BeginCommandBuffer(vk::Result),
    #[error("could not end command buffer: {0}")]
    EndCommandBuffer(vk::Result),
    #[error("could not submit queue: {0}")]
    Submit(vk::Result),
    #[error("could not wait for queue idle: {0}")]
    WaitIdle(vk::Result),
    /// No device memory type satisfies the requested properties. This is a
    /// device-capability mismatch that should have been ruled out before the
    /// backend was constructed, not a runtime condition.
    #[error("no compatible memory type (type bits {type_bits:#x}, flags {flags:?})")]
    NoCompatibleMemoryType {
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    },
    #[error("shader compilation failed: {0}")]
    ShaderCompile(String),
    #[error("texture {0} does not exist")]
    TextureNotFound(u32),
}
