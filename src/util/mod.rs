//! Utility types shared across the crate.
//!
//! - [`Error`] / [`Result`] - Error handling
//! - [`Aabb`] and math type re-exports from glam
//! - [`init_logging`] - tracing subscriber setup

mod error;
mod logging;
mod math;

pub use error::*;
pub use logging::*;
pub use math::*;
