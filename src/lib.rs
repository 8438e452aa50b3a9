//! A stencil-based Vulkan rendering backend for pre-tessellated vector
//! graphics.
//!
//! The widget/vector layer tessellates paths upstream and hands this crate a
//! flat list of [`DrawCall`]s plus one vertex slab per frame; the backend
//! turns them into a minimal sequence of pipeline binds, descriptor updates
//! and draw commands on a caller-provided command buffer. Fills are resolved
//! with a two-pass stencil emulation of the non-zero winding rule, so no
//! polygon boolean work happens on the CPU.

pub use ash;

mod caps;
mod descriptor;
mod draw_list;
mod error;
mod frame;
mod memory;
mod pipeline;
mod renderer;
mod shaders;
mod texture;

pub use draw_list::{
    paint_kind, texture_kind, CallKind, DrawCall, PaintUniforms, PathSlice, TextureId, Vertex,
    VertexRange,
};
pub use error::RendererError;
pub use renderer::{Renderer, RendererDesc};
