// src/lib.rs

//! Drive a display through DRM/KMS: find a connected output, allocate and
//! register a scanout buffer, render into it, switch the display to it, and
//! put everything back afterwards.

pub mod config;
pub mod error;
pub mod kms;
pub mod os;
pub mod pipeline;
pub mod probe;
pub mod release;
pub mod render;

pub use error::{PipelineError, Stage};
pub use pipeline::{DisplayPipeline, PipelineSettings, PipelineState, RunReport};
