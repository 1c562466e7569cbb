//! Tree card generation
//!
//! - [`batch`] - container-sized chunking
//! - [`message`] - default texts and personalization
//! - [`pipeline`] - the batch render pipeline

pub mod batch;
pub mod message;
pub mod pipeline;

pub use pipeline::{ArtifactBatchPipeline, GenerationReport, PipelineOptions, NO_TEMPLATE_ERROR};
