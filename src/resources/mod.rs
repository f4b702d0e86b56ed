//! Resource management
//!
//! Meshes, CPU texture data, transient render targets, per-view buffers and
//! shader asset tracking.

mod mesh;
mod rect_pack;
pub(crate) mod render_buffers;
mod render_target_pool;
mod shader;
mod texture;

pub use mesh::*;
pub use rect_pack::*;
pub use render_buffers::*;
pub use render_target_pool::*;
pub use shader::*;
pub use texture::*;
