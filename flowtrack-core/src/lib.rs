pub mod engine;
pub mod entity;
pub mod field;
pub mod mask;
pub mod predict;
pub mod render;

// Re-export the driver-level error type so callers only need `flowtrack_core::Error`
pub use anyhow::Error;
pub use anyhow::Result;
