//! Concrete pipelines composed from the engine's stage primitives.

pub mod fine_tune;

pub use fine_tune::{fine_tune_pipeline, PipelineSettings};
