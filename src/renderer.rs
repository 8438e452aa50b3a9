use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::caps::DeviceCaps;
use crate::descriptor::{CallSets, DescriptorAllocator};
use crate::draw_list::{CallKind, DrawCall, TextureId, UniformList, Vertex, VertexRange};
use crate::error::RendererError;
use crate::frame::FrameResources;
use crate::pipeline::{PipelineCache, PipelineKey, StrokePass};
use crate::shaders;
use crate::texture::TextureManager;

/// Everything the backend borrows from the presentation layer. The render
/// pass must be depth/stencil-backed and compatible with the framebuffers
/// the command buffers handed to [`Renderer::draw`] are recording into.
pub struct RendererDesc<'a> {
    pub instance: &'a ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: &'a ash::Device,
    pub queue: vk::Queue,
    pub queue_family_index: u32,
    pub render_pass: vk::RenderPass,
    pub frames_in_flight: u32,
    /// Draw the antialias fringe passes.
    pub edge_aa: bool,
    /// Use the three-pass stencil stroke; without it strokes are drawn in a
    /// single pass and self-overlap artifacts are accepted.
    pub stencil_strokes: bool,
}

/// The block pushed before every draw step. Matches the shader's
/// push-constant struct, including its trailing alignment padding.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct PushConstants {
    view_size: [f32; 2],
    uniform_offset: u32,
    _pad: u32,
}

const PUSH_CONSTANT_SIZE: u32 = std::mem::size_of::<PushConstants>() as u32;

/// Vulkan backend for a pre-tessellated vector-graphics draw list.
///
/// The presentation loop owns the swapchain and the render pass begin/end;
/// per frame it calls [`Renderer::before_render`] once and then
/// [`Renderer::draw`] with an open command buffer. Holds no state across
/// process restarts; every GPU object is recreated at startup.
pub struct Renderer {
    device: ash::Device,
    queue: vk::Queue,
    memory_props: vk::PhysicalDeviceMemoryProperties,
    render_pass: vk::RenderPass,
    caps: DeviceCaps,
    edge_aa: bool,
    stencil_strokes: bool,

    command_pool: vk::CommandPool,
    vertex_shader: vk::ShaderModule,
    fragment_shader: vk::ShaderModule,
    storage_layout: vk::DescriptorSetLayout,
    image_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,

    pipelines: PipelineCache,
    descriptors: DescriptorAllocator,
    frames: Vec<FrameResources>,
    frames_in_flight: usize,
    frame_slot: usize,

    uniforms: UniformList,
    textures: TextureManager,
    fallback_texture: Option<TextureId>,
    view_size: [f32; 2],
    disposed: bool,
}

impl Renderer {
    pub fn new(desc: &RendererDesc) -> Result<Self, RendererError> {
        let device = desc.device.clone();
        let caps = DeviceCaps::probe(desc.instance, &device);
        let memory_props = unsafe {
            desc.instance
                .get_physical_device_memory_properties(desc.physical_device)
        };

        // One-shot command buffers for texture layout transitions only; the
        // per-frame command buffer is owned by the presentation loop.
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(desc.queue_family_index);
        let command_pool = unsafe {
            device
                .create_command_pool(&pool_info, None)
                .map_err(RendererError::CreateCommandPool)?
        };

        let compiled = shaders::compile()?;
        let vertex_shader = shaders::create_module(&device, &compiled.vertex)?;
        let fragment_shader = shaders::create_module(&device, &compiled.fragment)?;

        let storage_binding = vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT);
        let storage_info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(std::slice::from_ref(&storage_binding));
        let storage_layout = unsafe {
            device
                .create_descriptor_set_layout(&storage_info, None)
                .map_err(RendererError::CreateDescriptorSetLayout)?
        };

        let image_bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(0)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT),
            vk::DescriptorSetLayoutBinding::default()
                .binding(1)
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT),
        ];
        let image_info =
            vk::DescriptorSetLayoutCreateInfo::default().bindings(&image_bindings);
        let image_layout = unsafe {
            device
                .create_descriptor_set_layout(&image_info, None)
                .map_err(RendererError::CreateDescriptorSetLayout)?
        };

        let push_range = vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            offset: 0,
            size: PUSH_CONSTANT_SIZE,
        };
        let set_layouts = [storage_layout, image_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(std::slice::from_ref(&push_range));
        let pipeline_layout = unsafe {
            device
                .create_pipeline_layout(&layout_info, None)
                .map_err(RendererError::CreatePipelineLayout)?
        };

        let frames_in_flight = desc.frames_in_flight.max(1) as usize;
        let frames = (0..frames_in_flight).map(|_| FrameResources::new()).collect();

        Ok(Self {
            device,
            queue: desc.queue,
            memory_props,
            render_pass: desc.render_pass,
            caps,
            edge_aa: desc.edge_aa,
            stencil_strokes: desc.stencil_strokes,
            command_pool,
            vertex_shader,
            fragment_shader,
            storage_layout,
            image_layout,
            pipeline_layout,
            pipelines: PipelineCache::new(),
            descriptors: DescriptorAllocator::new(frames_in_flight, storage_layout, image_layout),
            frames,
            frames_in_flight,
            // The first before_render wraps around to slot zero.
            frame_slot: frames_in_flight - 1,
            uniforms: UniformList::default(),
            textures: TextureManager::new(),
            fallback_texture: None,
            view_size: [0.0, 0.0],
            disposed: false,
        })
    }

    /// Updates the shader-visible viewport size used to project vertex
    /// coordinates, and makes sure the fallback texture exists.
    pub fn viewport(&mut self, width: f32, height: f32) -> Result<(), RendererError> {
        self.view_size = [width, height];
        self.ensure_fallback_texture()?;
        Ok(())
    }

    /// Must be called once at the start of each frame, before
    /// [`Renderer::draw`]: advances to the frame slot being reused and runs
    /// its deferred descriptor-pool destruction.
    pub fn before_render(&mut self) {
        self.frame_slot = (self.frame_slot + 1) % self.frames_in_flight;
        self.descriptors.before_render(&self.device, self.frame_slot);
    }

    /// Uploads the frame's vertex and uniform data and records every draw
    /// call into `cmd`, which must be recording inside the compatible render
    /// pass. Calls are processed strictly in input order.
    pub fn draw(
        &mut self,
        cmd: vk::CommandBuffer,
        calls: &[DrawCall],
        vertices: &[Vertex],
    ) -> Result<(), RendererError> {
        if calls.is_empty() || vertices.is_empty() {
            return Ok(());
        }
        self.ensure_fallback_texture()?;

        self.uniforms.rebuild(calls);
        let slot = self.frame_slot;
        self.frames[slot].vertices.upload(
            &self.device,
            &self.memory_props,
            bytemuck::cast_slice(vertices),
        )?;
        self.frames[slot].uniforms.upload(
            &self.device,
            &self.memory_props,
            bytemuck::cast_slice(self.uniforms.blocks()),
        )?;

        self.descriptors
            .ensure_capacity(&self.device, calls.len(), slot)?;
        // Rewritten every frame: a buffer regrow leaves old bindings stale.
        self.descriptors
            .write_storage_buffer(&self.device, slot, self.frames[slot].uniforms.handle());

        self.pipelines.begin_frame();
        unsafe {
            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: self.view_size[0],
                height: self.view_size[1],
                min_depth: 0.0,
                max_depth: 1.0,
            };
            let scissor = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: self.view_size[0] as u32,
                    height: self.view_size[1] as u32,
                },
            };
            self.device
                .cmd_set_viewport(cmd, 0, std::slice::from_ref(&viewport));
            self.device
                .cmd_set_scissor(cmd, 0, std::slice::from_ref(&scissor));

            self.device.cmd_bind_vertex_buffers(
                cmd,
                0,
                &[self.frames[slot].vertices.handle()],
                &[0],
            );
            self.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline_layout,
                0,
                &[self.descriptors.storage_set(slot)],
                &[],
            );
        }

        for (index, call) in calls.iter().enumerate() {
            let sets = self.descriptors.call_sets(slot, index);
            self.write_paint_images(call, sets);
            let offset = self.uniforms.offset(index);
            match call.kind {
                CallKind::Fill => self.fill(cmd, call, sets, offset)?,
                CallKind::ConvexFill => self.convex_fill(cmd, call, sets, offset)?,
                CallKind::Stroke => self.stroke(cmd, call, sets, offset)?,
                CallKind::Triangles => self.triangles(cmd, call, sets, offset)?,
            }
        }
        Ok(())
    }

    /// Fill with winding-rule emulation: accumulate winding into the stencil
    /// with the fan pass, optionally soften edges with the fringe pass, then
    /// fill the covered area while consuming and resetting the mask.
    fn fill(
        &mut self,
        cmd: vk::CommandBuffer,
        call: &DrawCall,
        sets: CallSets,
        offset: u32,
    ) -> Result<(), RendererError> {
        self.bind(cmd, PipelineKey::new(vk::PrimitiveTopology::TRIANGLE_FAN).stencil_fill())?;
        self.push_uniform_offset(cmd, offset);
        self.bind_paint_set(cmd, sets.primary);
        for path in &call.paths {
            self.draw_range(cmd, path.fill);
        }

        self.push_uniform_offset(cmd, offset + 1);
        self.bind_paint_set(cmd, sets.secondary);

        if self.edge_aa {
            self.bind(
                cmd,
                PipelineKey::new(vk::PrimitiveTopology::TRIANGLE_STRIP).stencil_test(true),
            )?;
            for path in &call.paths {
                self.draw_range(cmd, path.stroke);
            }
        }

        self.bind(
            cmd,
            PipelineKey::new(vk::PrimitiveTopology::TRIANGLE_STRIP).stencil_test(false),
        )?;
        self.draw_range(cmd, call.triangle);
        Ok(())
    }

    /// Convex shapes need no winding bookkeeping; draw the interior and, with
    /// antialiasing on, the fringe.
    fn convex_fill(
        &mut self,
        cmd: vk::CommandBuffer,
        call: &DrawCall,
        sets: CallSets,
        offset: u32,
    ) -> Result<(), RendererError> {
        self.bind(cmd, PipelineKey::new(vk::PrimitiveTopology::TRIANGLE_FAN))?;
        self.push_uniform_offset(cmd, offset);
        self.bind_paint_set(cmd, sets.primary);
        for path in &call.paths {
            self.draw_range(cmd, path.fill);
        }

        if self.edge_aa {
            self.bind(cmd, PipelineKey::new(vk::PrimitiveTopology::TRIANGLE_STRIP))?;
            for path in &call.paths {
                self.draw_range(cmd, path.stroke);
            }
        }
        Ok(())
    }

    fn stroke(
        &mut self,
        cmd: vk::CommandBuffer,
        call: &DrawCall,
        sets: CallSets,
        offset: u32,
    ) -> Result<(), RendererError> {
        let strip = PipelineKey::new(vk::PrimitiveTopology::TRIANGLE_STRIP);
        if !self.stencil_strokes {
            // Single pass; self-overlap artifacts are the accepted tradeoff.
            self.bind(cmd, strip)?;
            self.push_uniform_offset(cmd, offset);
            self.bind_paint_set(cmd, sets.primary);
            for path in &call.paths {
                self.draw_range(cmd, path.stroke);
            }
            return Ok(());
        }

        // Mark coverage once per pixel, clamped so self-overlap cannot
        // double-blend.
        self.bind(cmd, strip.stroke_pass(StrokePass::Fill))?;
        self.push_uniform_offset(cmd, offset + 1);
        self.bind_paint_set(cmd, sets.secondary);
        for path in &call.paths {
            self.draw_range(cmd, path.stroke);
        }

        // Draw the visible stroke where the stencil is still untouched.
        self.bind(cmd, strip.stroke_pass(StrokePass::DrawAa))?;
        self.push_uniform_offset(cmd, offset);
        self.bind_paint_set(cmd, sets.primary);
        for path in &call.paths {
            self.draw_range(cmd, path.stroke);
        }

        // Zero the stencil back out for the next call.
        self.bind(cmd, strip.stroke_pass(StrokePass::Clear))?;
        for path in &call.paths {
            self.draw_range(cmd, path.stroke);
        }
        Ok(())
    }

    fn triangles(
        &mut self,
        cmd: vk::CommandBuffer,
        call: &DrawCall,
        sets: CallSets,
        offset: u32,
    ) -> Result<(), RendererError> {
        // An empty batch records nothing, not even the pipeline bind.
        if call.triangle.is_empty() {
            return Ok(());
        }
        self.bind(cmd, PipelineKey::new(vk::PrimitiveTopology::TRIANGLE_LIST))?;
        self.push_uniform_offset(cmd, offset);
        self.bind_paint_set(cmd, sets.primary);
        self.draw_range(cmd, call.triangle);
        Ok(())
    }

    fn bind(&mut self, cmd: vk::CommandBuffer, key: PipelineKey) -> Result<(), RendererError> {
        self.pipelines.bind(
            &self.device,
            &self.caps,
            cmd,
            key,
            self.pipeline_layout,
            self.render_pass,
            self.vertex_shader,
            self.fragment_shader,
        )
    }

    fn push_uniform_offset(&self, cmd: vk::CommandBuffer, uniform_offset: u32) {
        let push = PushConstants {
            view_size: self.view_size,
            uniform_offset,
            _pad: 0,
        };
        unsafe {
            self.device.cmd_push_constants(
                cmd,
                self.pipeline_layout,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                0,
                bytemuck::bytes_of(&push),
            );
        }
    }

    fn bind_paint_set(&self, cmd: vk::CommandBuffer, set: vk::DescriptorSet) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline_layout,
                1,
                &[set],
                &[],
            );
        }
    }

    fn draw_range(&self, cmd: vk::CommandBuffer, range: VertexRange) {
        if range.is_empty() {
            return;
        }
        unsafe {
            self.device.cmd_draw(cmd, range.count, 1, range.first, 0);
        }
    }

    /// Normalizes a call's paint image to concrete bindings: a missing or
    /// stale handle falls back to the 1x1 white texture, so a descriptor is
    /// never left invalid.
    fn write_paint_images(&mut self, call: &DrawCall, sets: CallSets) {
        let fallback = self
            .fallback_texture
            .expect("fallback texture exists after ensure_fallback_texture");
        let texture = match call.image {
            Some(id) => match self.textures.get(id) {
                Some(texture) => texture,
                None => {
                    tracing::warn!(?id, "paint references unknown texture, using fallback");
                    self.textures.get(fallback).expect("fallback texture")
                }
            },
            None => self.textures.get(fallback).expect("fallback texture"),
        };
        let (view, sampler) = (texture.view, texture.sampler);
        self.descriptors
            .write_image(&self.device, sets.primary, view, sampler);
        self.descriptors
            .write_image(&self.device, sets.secondary, view, sampler);
    }

    fn ensure_fallback_texture(&mut self) -> Result<(), RendererError> {
        if self.fallback_texture.is_none() {
            let id = self.create_texture(1, 1)?;
            self.update_texture(id, 0, 0, 1, 1, &[0xff, 0xff, 0xff, 0xff])?;
            self.fallback_texture = Some(id);
        }
        Ok(())
    }

    pub fn create_texture(&mut self, width: u32, height: u32) -> Result<TextureId, RendererError> {
        self.textures.create(
            &self.device,
            &self.memory_props,
            self.queue,
            self.command_pool,
            width,
            height,
        )
    }

    pub fn update_texture(
        &mut self,
        id: TextureId,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        data: &[u8],
    ) -> Result<(), RendererError> {
        let texture = self
            .textures
            .get_mut(id)
            .ok_or(RendererError::TextureNotFound(id.0.get()))?;
        texture.update(x, y, width, height, data);
        Ok(())
    }

    pub fn texture_size(&self, id: TextureId) -> Option<(u32, u32)> {
        self.textures.get(id).map(|texture| texture.size())
    }

    /// Idempotent; unknown or already-deleted ids are ignored.
    pub fn delete_texture(&mut self, id: TextureId) {
        self.textures.delete(&self.device, id);
    }

    /// Destroys every GPU object this backend owns. Must only be called once
    /// no frame is in flight; also run by `Drop`.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        tracing::debug!("disposing renderer");
        unsafe {
            self.pipelines.destroy(&self.device);
            self.descriptors.destroy(&self.device);
            for frame in &mut self.frames {
                frame.destroy(&self.device);
            }
            self.textures.destroy(&self.device);
            self.device.destroy_pipeline_layout(self.pipeline_layout, None);
            self.device
                .destroy_descriptor_set_layout(self.image_layout, None);
            self.device
                .destroy_descriptor_set_layout(self.storage_layout, None);
            self.device.destroy_shader_module(self.vertex_shader, None);
            self.device
                .destroy_shader_module(self.fragment_shader, None);
            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.dispose();
    }
}
