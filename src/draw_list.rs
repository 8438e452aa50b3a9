use std::num::NonZeroU32;

use bytemuck::{Pod, Zeroable};
use smallvec::SmallVec;

/// A single tessellated vertex: position in logical pixels plus the
/// fringe/texture coordinate pair the fragment stage interprets.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 2],
    pub tcoord: [f32; 2],
}

impl Vertex {
    pub fn new(x: f32, y: f32, u: f32, v: f32) -> Self {
        Self {
            pos: [x, y],
            tcoord: [u, v],
        }
    }
}

/// Handle to a texture owned by the backend's texture arena. 1-based so the
/// niche makes `Option<TextureId>` pointer-sized; "no image" is expressed as
/// `None`, never as a sentinel id.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TextureId(pub(crate) NonZeroU32);

impl TextureId {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(NonZeroU32::new(index as u32 + 1).expect("index + 1 is nonzero"))
    }

    pub(crate) fn index(self) -> usize {
        self.0.get() as usize - 1
    }
}

/// How a paint samples its texture, mirrored by the fragment shader.
pub mod texture_kind {
    /// Texture already carries premultiplied alpha.
    pub const PREMULTIPLIED: i32 = 0;
    /// Straight-alpha RGBA, multiplied in the shader.
    pub const RGBA: i32 = 1;
    /// Single-channel coverage (glyph atlases).
    pub const ALPHA: i32 = 2;
}

/// Fragment paint selector, mirrored by the fragment shader.
pub mod paint_kind {
    pub const GRADIENT: i32 = 0;
    pub const IMAGE: i32 = 1;
    pub const STENCIL: i32 = 2;
    pub const TRIANGLES: i32 = 3;
}

/// One paint's GPU-visible parameter block.
///
/// The layout matches the WGSL storage-array stride exactly: the two affine
/// 3x3 matrices are stored as three padded vec4 columns (12 floats each) and
/// the struct is padded to a 176-byte stride.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct PaintUniforms {
    pub scissor_mat: [[f32; 4]; 3],
    pub paint_mat: [[f32; 4]; 3],
    pub inner_color: [f32; 4],
    pub outer_color: [f32; 4],
    pub scissor_ext: [f32; 2],
    pub scissor_scale: [f32; 2],
    pub extent: [f32; 2],
    pub radius: f32,
    pub feather: f32,
    pub stroke_mult: f32,
    pub stroke_thr: f32,
    pub texture_kind: i32,
    pub paint_kind: i32,
}

impl Default for PaintUniforms {
    fn default() -> Self {
        Self {
            scissor_mat: [[0.0; 4]; 3],
            paint_mat: [[0.0; 4]; 3],
            inner_color: [0.0; 4],
            outer_color: [0.0; 4],
            scissor_ext: [1.0, 1.0],
            scissor_scale: [1.0, 1.0],
            extent: [0.0, 0.0],
            radius: 0.0,
            feather: 1.0,
            stroke_mult: 1.0,
            stroke_thr: -1.0,
            texture_kind: texture_kind::PREMULTIPLIED,
            paint_kind: paint_kind::GRADIENT,
        }
    }
}

/// A contiguous run of vertices inside the frame's vertex upload.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VertexRange {
    pub first: u32,
    pub count: u32,
}

impl VertexRange {
    pub fn new(first: u32, count: u32) -> Self {
        Self { first, count }
    }

    pub fn is_empty(self) -> bool {
        self.count == 0
    }
}

/// One tessellated sub-path of a call: the fan that covers its interior and
/// the strip that forms its stroke or antialias fringe. Compound paths with
/// holes produce several of these per call.
#[derive(Copy, Clone, Debug, Default)]
pub struct PathSlice {
    pub fill: VertexRange,
    pub stroke: VertexRange,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CallKind {
    Fill,
    ConvexFill,
    Stroke,
    Triangles,
}

/// One fill/stroke/triangle batch with its paints, produced upstream and
/// read-only to the backend.
#[derive(Clone, Debug)]
pub struct DrawCall {
    pub kind: CallKind,
    pub image: Option<TextureId>,
    pub paths: SmallVec<[PathSlice; 2]>,
    pub triangle: VertexRange,
    /// Primary and secondary paint blocks. Every call carries exactly two.
    /// For `Fill`, the primary block feeds the stencil pass (a plain
    /// [`paint_kind::STENCIL`] block) and the secondary styles the fringe and
    /// area passes; for stencil strokes the secondary feeds the coverage
    /// pass. Convex fills and triangle batches only consume the primary.
    pub uniforms: [PaintUniforms; 2],
}

/// The frame's accumulated paint-uniform blocks, rebuilt on every draw and
/// uploaded as one storage buffer.
///
/// Each call contributes exactly two adjacent blocks; the recorded offset is
/// what the dispatcher pushes to the shader, so interleaved writes can never
/// drift out of sync with the upload.
#[derive(Default)]
pub(crate) struct UniformList {
    blocks: Vec<PaintUniforms>,
    offsets: Vec<u32>,
}

impl UniformList {
    pub(crate) fn rebuild(&mut self, calls: &[DrawCall]) {
        self.blocks.clear();
        self.offsets.clear();
        for call in calls {
            self.offsets.push(self.blocks.len() as u32);
            self.blocks.extend_from_slice(&call.uniforms);
        }
    }

    /// Block index of the call's primary paint; the secondary paint is the
    /// block immediately after it.
    pub(crate) fn offset(&self, call_index: usize) -> u32 {
        self.offsets[call_index]
    }

    pub(crate) fn blocks(&self) -> &[PaintUniforms] {
        &self.blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call_with(kind: CallKind) -> DrawCall {
        DrawCall {
            kind,
            image: None,
            paths: SmallVec::new(),
            triangle: VertexRange::default(),
            uniforms: [PaintUniforms::default(), PaintUniforms::default()],
        }
    }

    #[test]
    fn vertex_matches_shader_stride() {
        assert_eq!(std::mem::size_of::<Vertex>(), 16);
    }

    #[test]
    fn paint_uniforms_match_shader_stride() {
        // Must equal the WGSL storage-array stride of the paint struct.
        assert_eq!(std::mem::size_of::<PaintUniforms>(), 176);
        assert_eq!(std::mem::align_of::<PaintUniforms>(), 4);
    }

    #[test]
    fn uniform_list_appends_two_blocks_per_call() {
        let calls = [
            call_with(CallKind::Fill),
            call_with(CallKind::Stroke),
            call_with(CallKind::Triangles),
        ];
        let mut list = UniformList::default();
        list.rebuild(&calls);

        assert_eq!(list.blocks().len(), 6);
        for i in 0..calls.len() {
            assert_eq!(list.offset(i), 2 * i as u32);
        }
    }

    #[test]
    fn uniform_list_is_cleared_between_frames() {
        let mut list = UniformList::default();
        list.rebuild(&[
            call_with(CallKind::Fill),
            call_with(CallKind::Fill),
            call_with(CallKind::Fill),
        ]);
        list.rebuild(&[call_with(CallKind::Fill)]);

        assert_eq!(list.blocks().len(), 2);
        assert_eq!(list.offset(0), 0);
    }

    #[test]
    fn empty_range_is_detected() {
        assert!(VertexRange::new(10, 0).is_empty());
        assert!(!VertexRange::new(0, 3).is_empty());
    }

    #[test]
    fn texture_ids_are_one_based() {
        let id = TextureId::from_index(0);
        assert_eq!(id.0.get(), 1);
        assert_eq!(id.index(), 0);
    }
}
