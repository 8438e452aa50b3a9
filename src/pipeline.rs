use ash::vk;
use smallvec::SmallVec;

use crate::caps::{CapFlags, DeviceCaps};
use crate::error::RendererError;

/// Which pass of the three-pass stencil stroke a key describes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) enum StrokePass {
    #[default]
    None,
    /// Writes coverage into the stencil wherever the stroke lands.
    Fill,
    /// Draws the visible stroke color where the stencil is still zero.
    DrawAa,
    /// Unconditionally zeroes the stencil back out.
    Clear,
}

/// Identifies a distinct pipeline configuration.
///
/// `color_write` is derived from the stencil flags and must never be set by
/// callers; [`PipelineKey::normalized`] recomputes it before any comparison
/// or cache lookup.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct PipelineKey {
    pub(crate) topology: vk::PrimitiveTopology,
    pub(crate) stencil_fill: bool,
    pub(crate) stencil_test: bool,
    pub(crate) stroke_pass: StrokePass,
    pub(crate) edge_aa: bool,
    pub(crate) color_write: vk::ColorComponentFlags,
}

impl PipelineKey {
    pub(crate) fn new(topology: vk::PrimitiveTopology) -> Self {
        Self {
            topology,
            stencil_fill: false,
            stencil_test: false,
            stroke_pass: StrokePass::None,
            edge_aa: false,
            color_write: vk::ColorComponentFlags::empty(),
        }
        .normalized()
    }

    pub(crate) fn stencil_fill(mut self) -> Self {
        self.stencil_fill = true;
        self.normalized()
    }

    pub(crate) fn stencil_test(mut self, edge_aa: bool) -> Self {
        self.stencil_test = true;
        self.edge_aa = edge_aa;
        self.normalized()
    }

    pub(crate) fn stroke_pass(mut self, pass: StrokePass) -> Self {
        self.stroke_pass = pass;
        self.normalized()
    }

    /// Recomputes the derived color-write mask. Pure stencil-accumulation
    /// passes must not touch the color attachment.
    pub(crate) fn normalized(mut self) -> Self {
        self.color_write = if self.stencil_fill || self.stroke_pass == StrokePass::Clear {
            vk::ColorComponentFlags::empty()
        } else {
            vk::ColorComponentFlags::RGBA
        };
        self
    }

    /// Structural equality under the active capability set. Fields that are
    /// set through dynamic-state commands instead of being baked into the
    /// pipeline object do not participate in the comparison, so draw steps
    /// that only differ in dynamic state share one pipeline.
    pub(crate) fn matches(&self, other: &Self, caps: CapFlags) -> bool {
        if !caps.dynamic_state
            && (self.topology != other.topology
                || self.stencil_fill != other.stencil_fill
                || self.stencil_test != other.stencil_test
                || self.stroke_pass != other.stroke_pass
                || self.edge_aa != other.edge_aa)
        {
            return false;
        }
        if !caps.color_write_mask && self.color_write != other.color_write {
            return false;
        }
        true
    }

    fn cull_mode(&self) -> vk::CullModeFlags {
        // The winding-accumulation fan pass must rasterize both windings.
        if self.stencil_fill {
            vk::CullModeFlags::NONE
        } else {
            vk::CullModeFlags::BACK
        }
    }
}

/// Front/back stencil face state derived from a key, or `None` when the key
/// does not use the stencil test at all.
///
/// The derivation mirrors the two-pass non-zero-winding emulation: the fill
/// pass accumulates winding with wrap-around increments/decrements, the test
/// passes consume the accumulated mask, and the stroke passes use clamped
/// increments so self-overlap cannot double-blend.
pub(crate) fn stencil_faces(key: &PipelineKey) -> Option<(vk::StencilOpState, vk::StencilOpState)> {
    let face = |compare, fail, pass| vk::StencilOpState {
        fail_op: fail,
        pass_op: pass,
        depth_fail_op: fail,
        compare_op: compare,
        compare_mask: 0xff,
        write_mask: 0xff,
        reference: 0,
    };

    if key.stencil_fill {
        let front = face(
            vk::CompareOp::ALWAYS,
            vk::StencilOp::KEEP,
            vk::StencilOp::INCREMENT_AND_WRAP,
        );
        let back = face(
            vk::CompareOp::ALWAYS,
            vk::StencilOp::KEEP,
            vk::StencilOp::DECREMENT_AND_WRAP,
        );
        return Some((front, back));
    }
    if key.stencil_test {
        let face = if key.edge_aa {
            face(
                vk::CompareOp::EQUAL,
                vk::StencilOp::KEEP,
                vk::StencilOp::KEEP,
            )
        } else {
            face(
                vk::CompareOp::NOT_EQUAL,
                vk::StencilOp::ZERO,
                vk::StencilOp::ZERO,
            )
        };
        return Some((face, face));
    }
    match key.stroke_pass {
        StrokePass::Fill => {
            let face = face(
                vk::CompareOp::EQUAL,
                vk::StencilOp::KEEP,
                vk::StencilOp::INCREMENT_AND_CLAMP,
            );
            Some((face, face))
        }
        StrokePass::DrawAa => {
            let face = face(
                vk::CompareOp::EQUAL,
                vk::StencilOp::KEEP,
                vk::StencilOp::KEEP,
            );
            Some((face, face))
        }
        StrokePass::Clear => {
            let face = face(
                vk::CompareOp::ALWAYS,
                vk::StencilOp::ZERO,
                vk::StencilOp::ZERO,
            );
            Some((face, face))
        }
        StrokePass::None => None,
    }
}

fn blend_attachment(color_write: vk::ColorComponentFlags) -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState {
        blend_enable: vk::TRUE,
        src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
        dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        color_blend_op: vk::BlendOp::ADD,
        src_alpha_blend_factor: vk::BlendFactor::ONE,
        dst_alpha_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        alpha_blend_op: vk::BlendOp::ADD,
        color_write_mask: color_write,
    }
}

fn blend_equation() -> vk::ColorBlendEquationEXT {
    vk::ColorBlendEquationEXT {
        src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
        dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        color_blend_op: vk::BlendOp::ADD,
        src_alpha_blend_factor: vk::BlendFactor::ONE,
        dst_alpha_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        alpha_blend_op: vk::BlendOp::ADD,
    }
}

struct CachedPipeline {
    key: PipelineKey,
    pipeline: vk::Pipeline,
}

/// Lazily creates and deduplicates pipeline objects keyed by render state,
/// and suppresses redundant bind commands while a command buffer is being
/// recorded.
pub(crate) struct PipelineCache {
    entries: Vec<CachedPipeline>,
    bound: Option<vk::Pipeline>,
}

impl PipelineCache {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            bound: None,
        }
    }

    /// Forgets the bound-pipeline memo. Called once per recorded frame,
    /// since a fresh command buffer starts with no pipeline bound.
    pub(crate) fn begin_frame(&mut self) {
        self.bound = None;
    }

    /// Resolves `key` to a pipeline (creating it on first sight), binds it if
    /// it differs from the one currently bound, and emits the dynamic-state
    /// commands the device supports.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn bind(
        &mut self,
        device: &ash::Device,
        caps: &DeviceCaps,
        cmd: vk::CommandBuffer,
        key: PipelineKey,
        layout: vk::PipelineLayout,
        render_pass: vk::RenderPass,
        vert: vk::ShaderModule,
        frag: vk::ShaderModule,
    ) -> Result<(), RendererError> {
        let key = key.normalized();

        let pipeline = match self
            .entries
            .iter()
            .find(|entry| entry.key.matches(&key, caps.flags))
        {
            Some(entry) => entry.pipeline,
            None => {
                let pipeline =
                    create_pipeline(device, caps.flags, &key, layout, render_pass, vert, frag)?;
                tracing::debug!(?key, total = self.entries.len() + 1, "created pipeline");
                self.entries.push(CachedPipeline { key, pipeline });
                pipeline
            }
        };

        if self.bound != Some(pipeline) {
            unsafe {
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
            }
            self.bound = Some(pipeline);
        }

        self.set_dynamic_state(caps, cmd, &key);
        Ok(())
    }

    /// Dynamic state is re-emitted for every draw step, not only on pipeline
    /// switches: under dynamic state, distinct steps share one pipeline
    /// object and differ only here.
    fn set_dynamic_state(&self, caps: &DeviceCaps, cmd: vk::CommandBuffer, key: &PipelineKey) {
        if let Some(eds) = &caps.dynamic_state {
            unsafe {
                eds.cmd_set_primitive_topology(cmd, key.topology);
                match stencil_faces(key) {
                    Some((front, back)) => {
                        eds.cmd_set_stencil_test_enable(cmd, true);
                        eds.cmd_set_stencil_op(
                            cmd,
                            vk::StencilFaceFlags::FRONT,
                            front.fail_op,
                            front.pass_op,
                            front.depth_fail_op,
                            front.compare_op,
                        );
                        eds.cmd_set_stencil_op(
                            cmd,
                            vk::StencilFaceFlags::BACK,
                            back.fail_op,
                            back.pass_op,
                            back.depth_fail_op,
                            back.compare_op,
                        );
                    }
                    None => eds.cmd_set_stencil_test_enable(cmd, false),
                }
            }
        }
        if let Some(eds3) = &caps.dynamic_state3 {
            unsafe {
                if caps.flags.color_write_mask {
                    eds3.cmd_set_color_write_mask(cmd, 0, &[key.color_write]);
                }
                if caps.flags.blend_equation {
                    eds3.cmd_set_color_blend_equation(cmd, 0, &[blend_equation()]);
                }
            }
        }
    }

    pub(crate) fn destroy(&mut self, device: &ash::Device) {
        tracing::debug!(pipelines = self.entries.len(), "destroying pipeline cache");
        for entry in self.entries.drain(..) {
            unsafe {
                device.destroy_pipeline(entry.pipeline, None);
            }
        }
        self.bound = None;
    }
}

/// Synthesizes the full fixed-function state for a key and creates the
/// pipeline object. State covered by an available dynamic-state capability is
/// listed as dynamic instead; the baked values then only serve devices
/// without the capability.
fn create_pipeline(
    device: &ash::Device,
    caps: CapFlags,
    key: &PipelineKey,
    layout: vk::PipelineLayout,
    render_pass: vk::RenderPass,
    vert: vk::ShaderModule,
    frag: vk::ShaderModule,
) -> Result<vk::Pipeline, RendererError> {
    let stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert)
            .name(c"vs_main"),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(frag)
            .name(c"fs_main"),
    ];

    let vertex_binding = vk::VertexInputBindingDescription {
        binding: 0,
        stride: std::mem::size_of::<crate::draw_list::Vertex>() as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    };
    let vertex_attributes = [
        vk::VertexInputAttributeDescription {
            location: 0,
            binding: 0,
            format: vk::Format::R32G32_SFLOAT,
            offset: 0,
        },
        vk::VertexInputAttributeDescription {
            location: 1,
            binding: 0,
            format: vk::Format::R32G32_SFLOAT,
            offset: 8,
        },
    ];
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(std::slice::from_ref(&vertex_binding))
        .vertex_attribute_descriptions(&vertex_attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default().topology(key.topology);

    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(key.cull_mode())
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0);

    let multisample = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let (front, back, stencil_enable) = match stencil_faces(key) {
        Some((front, back)) => (front, back, true),
        None => {
            // Baked template keeps reference and masks consistent when the
            // stencil test is later toggled through dynamic state.
            let template = vk::StencilOpState {
                fail_op: vk::StencilOp::KEEP,
                pass_op: vk::StencilOp::KEEP,
                depth_fail_op: vk::StencilOp::KEEP,
                compare_op: vk::CompareOp::ALWAYS,
                compare_mask: 0xff,
                write_mask: 0xff,
                reference: 0,
            };
            (template, template, false)
        }
    };
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(false)
        .depth_write_enable(false)
        .stencil_test_enable(stencil_enable)
        .front(front)
        .back(back);

    let attachment = blend_attachment(key.color_write);
    let color_blend =
        vk::PipelineColorBlendStateCreateInfo::default().attachments(std::slice::from_ref(&attachment));

    let mut dynamic_states: SmallVec<[vk::DynamicState; 8]> =
        smallvec::smallvec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    if caps.dynamic_state {
        dynamic_states.push(vk::DynamicState::PRIMITIVE_TOPOLOGY_EXT);
        dynamic_states.push(vk::DynamicState::STENCIL_TEST_ENABLE_EXT);
        dynamic_states.push(vk::DynamicState::STENCIL_OP_EXT);
    }
    if caps.color_write_mask {
        dynamic_states.push(vk::DynamicState::COLOR_WRITE_MASK_EXT);
    }
    if caps.blend_equation {
        dynamic_states.push(vk::DynamicState::COLOR_BLEND_EQUATION_EXT);
    }
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let create_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0);

    let pipelines = unsafe {
        device
            .create_graphics_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(&create_info),
                None,
            )
            .map_err(|(_, err)| RendererError::CreatePipeline(err))?
    };
    Ok(pipelines[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_caps() -> CapFlags {
        CapFlags {
            dynamic_state: true,
            color_write_mask: true,
            blend_equation: true,
        }
    }

    #[test]
    fn color_writes_are_suppressed_for_stencil_only_passes() {
        let fill = PipelineKey::new(vk::PrimitiveTopology::TRIANGLE_FAN).stencil_fill();
        assert_eq!(fill.color_write, vk::ColorComponentFlags::empty());

        let clear =
            PipelineKey::new(vk::PrimitiveTopology::TRIANGLE_STRIP).stroke_pass(StrokePass::Clear);
        assert_eq!(clear.color_write, vk::ColorComponentFlags::empty());

        let draw =
            PipelineKey::new(vk::PrimitiveTopology::TRIANGLE_STRIP).stroke_pass(StrokePass::DrawAa);
        assert_eq!(draw.color_write, vk::ColorComponentFlags::RGBA);
    }

    #[test]
    fn normalization_overrides_caller_supplied_masks() {
        let mut key = PipelineKey::new(vk::PrimitiveTopology::TRIANGLE_FAN).stencil_fill();
        key.color_write = vk::ColorComponentFlags::RGBA;
        assert_eq!(
            key.normalized().color_write,
            vk::ColorComponentFlags::empty()
        );
    }

    #[test]
    fn stencil_fill_accumulates_winding_with_wrap() {
        let key = PipelineKey::new(vk::PrimitiveTopology::TRIANGLE_FAN).stencil_fill();
        let (front, back) = stencil_faces(&key).unwrap();
        assert_eq!(front.compare_op, vk::CompareOp::ALWAYS);
        assert_eq!(front.pass_op, vk::StencilOp::INCREMENT_AND_WRAP);
        assert_eq!(back.pass_op, vk::StencilOp::DECREMENT_AND_WRAP);
    }

    #[test]
    fn stencil_test_depends_on_edge_aa() {
        let aa = PipelineKey::new(vk::PrimitiveTopology::TRIANGLE_STRIP).stencil_test(true);
        let (front, _) = stencil_faces(&aa).unwrap();
        assert_eq!(front.compare_op, vk::CompareOp::EQUAL);
        assert_eq!(front.pass_op, vk::StencilOp::KEEP);

        let consume = PipelineKey::new(vk::PrimitiveTopology::TRIANGLE_STRIP).stencil_test(false);
        let (front, _) = stencil_faces(&consume).unwrap();
        assert_eq!(front.compare_op, vk::CompareOp::NOT_EQUAL);
        assert_eq!(front.pass_op, vk::StencilOp::ZERO);
        assert_eq!(front.fail_op, vk::StencilOp::ZERO);
    }

    #[test]
    fn stroke_passes_derive_per_table() {
        let strip = PipelineKey::new(vk::PrimitiveTopology::TRIANGLE_STRIP);

        let (front, _) = stencil_faces(&strip.stroke_pass(StrokePass::Fill)).unwrap();
        assert_eq!(front.compare_op, vk::CompareOp::EQUAL);
        assert_eq!(front.pass_op, vk::StencilOp::INCREMENT_AND_CLAMP);

        let (front, _) = stencil_faces(&strip.stroke_pass(StrokePass::DrawAa)).unwrap();
        assert_eq!(front.compare_op, vk::CompareOp::EQUAL);
        assert_eq!(front.pass_op, vk::StencilOp::KEEP);

        let (front, _) = stencil_faces(&strip.stroke_pass(StrokePass::Clear)).unwrap();
        assert_eq!(front.compare_op, vk::CompareOp::ALWAYS);
        assert_eq!(front.pass_op, vk::StencilOp::ZERO);

        assert!(stencil_faces(&strip).is_none());
    }

    #[test]
    fn key_equality_honors_capabilities() {
        let fan = PipelineKey::new(vk::PrimitiveTopology::TRIANGLE_FAN).stencil_fill();
        let strip = PipelineKey::new(vk::PrimitiveTopology::TRIANGLE_STRIP).stencil_test(true);

        // Baked pipelines: every field participates.
        assert!(!fan.matches(&strip, CapFlags::default()));
        assert!(fan.matches(&fan, CapFlags::default()));

        // Fully dynamic: the two steps share one pipeline object.
        assert!(fan.matches(&strip, all_caps()));
    }

    #[test]
    fn color_write_still_distinguishes_without_the_mask_setter() {
        let stencil = PipelineKey::new(vk::PrimitiveTopology::TRIANGLE_FAN).stencil_fill();
        let color = PipelineKey::new(vk::PrimitiveTopology::TRIANGLE_FAN);
        let caps = CapFlags {
            dynamic_state: true,
            color_write_mask: false,
            blend_equation: true,
        };
        assert!(!stencil.matches(&color, caps));

        let caps = CapFlags {
            color_write_mask: true,
            ..caps
        };
        assert!(stencil.matches(&color, caps));
    }

    /// Software model of one stencil pixel, interpreting the same
    /// [`vk::StencilOp`] values the derivation hands the device.
    #[derive(Default)]
    struct StencilPixel(u8);

    impl StencilPixel {
        fn apply(&mut self, face: &vk::StencilOpState, covered: bool) {
            if !covered {
                return;
            }
            let passes = match face.compare_op {
                vk::CompareOp::ALWAYS => true,
                vk::CompareOp::EQUAL => self.0 == face.reference as u8,
                vk::CompareOp::NOT_EQUAL => self.0 != face.reference as u8,
                other => unreachable!("unused compare op {other:?}"),
            };
            let op = if passes { face.pass_op } else { face.fail_op };
            self.0 = match op {
                vk::StencilOp::KEEP => self.0,
                vk::StencilOp::ZERO => 0,
                vk::StencilOp::INCREMENT_AND_WRAP => self.0.wrapping_add(1),
                vk::StencilOp::DECREMENT_AND_WRAP => self.0.wrapping_sub(1),
                vk::StencilOp::INCREMENT_AND_CLAMP => self.0.saturating_add(1),
                other => unreachable!("unused stencil op {other:?}"),
            };
        }
    }

    #[test]
    fn fill_state_machine_leaves_no_residual_stencil() {
        // A self-overlapping path: the pixel is covered by three front-facing
        // fan triangles and one back-facing one (net winding 2), so the fill
        // pass leaves a nonzero mask and the area pass must consume it.
        let fill_key = PipelineKey::new(vk::PrimitiveTopology::TRIANGLE_FAN).stencil_fill();
        let area_key = PipelineKey::new(vk::PrimitiveTopology::TRIANGLE_STRIP).stencil_test(false);
        let (fill_front, fill_back) = stencil_faces(&fill_key).unwrap();
        let (area_front, _) = stencil_faces(&area_key).unwrap();

        let mut pixel = StencilPixel::default();
        pixel.apply(&fill_front, true);
        pixel.apply(&fill_front, true);
        pixel.apply(&fill_back, true);
        pixel.apply(&fill_front, true);
        assert_eq!(pixel.0, 2, "non-zero winding should mark the pixel");

        // Area pass: NOT_EQUAL passes, and every outcome zeroes the stencil.
        pixel.apply(&area_front, true);
        assert_eq!(pixel.0, 0, "area pass must consume and reset the mask");

        // A pixel whose winding cancels out (net zero) is skipped by the
        // area pass and stays zero.
        let mut outside = StencilPixel::default();
        outside.apply(&fill_front, true);
        outside.apply(&fill_back, true);
        assert_eq!(outside.0, 0);
        outside.apply(&area_front, true);
        assert_eq!(outside.0, 0);
    }

    #[test]
    fn stencil_stroke_round_trip_avoids_double_blend() {
        let strip = PipelineKey::new(vk::PrimitiveTopology::TRIANGLE_STRIP);
        let (fill, _) = stencil_faces(&strip.stroke_pass(StrokePass::Fill)).unwrap();
        let (draw, _) = stencil_faces(&strip.stroke_pass(StrokePass::DrawAa)).unwrap();
        let (clear, _) = stencil_faces(&strip.stroke_pass(StrokePass::Clear)).unwrap();

        // Two overlapping stroke segments cover the same pixel: the clamped
        // increment only fires while the stencil is still zero, so coverage
        // is recorded exactly once.
        let mut pixel = StencilPixel::default();
        pixel.apply(&fill, true);
        pixel.apply(&fill, true);
        assert_eq!(pixel.0, 1);

        // The visible pass draws only where the stencil is still zero, so
        // the covered pixel cannot be blended twice.
        let mut virgin = StencilPixel::default();
        virgin.apply(&draw, true);
        assert_eq!(virgin.0, 0);

        // The clear pass resets the mask for the next call.
        pixel.apply(&clear, true);
        assert_eq!(pixel.0, 0);
    }
}
