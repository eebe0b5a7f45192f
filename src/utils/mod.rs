//! Small shared helpers.

pub mod geometry;
pub mod x11rb;

pub use geometry::{Point, Rectangle, Size};
