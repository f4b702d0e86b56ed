//! Frame plan
//!
//! The frame is a fixed, ordered list of tagged passes. Each tag declares
//! the frame resources it reads and writes so the order can be validated:
//! a per-frame resource must be written before any pass reads it.

pub mod graph;
pub mod pass;
pub mod resource;

pub use graph::*;
pub use pass::*;
pub use resource::*;
