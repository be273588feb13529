//! Framework-facing viewer plugins.

pub mod viewer_1d;
pub mod viewer_2d;
