//! Candle-Guided-Diffusion: guided latent denoising for the Candle framework.
//!
//! This crate drives a black-box noise-predicting network through a
//! diffusion schedule, combining classifier-free guidance, self-attention
//! guidance, structural control and inpainting masks. Two stepping
//! strategies are supported: discrete schedulers advanced by the pipeline,
//! and external samplers that own the loop.

pub mod conditioning;
pub mod config;
pub mod error;
pub mod guidance;
pub mod latents;
pub mod latents_bin;
pub mod mask;
pub mod mock;
pub mod pipeline;
pub mod postprocess;
pub mod sampler;
pub mod schedule;
pub mod scheduler;
pub mod strategy;
pub mod utils;

pub use conditioning::PromptInput;
pub use config::{GenerationParams, OutputType, PipelineConfig, SchedulerConfig, SchedulerKind};
pub use error::{DenoiseError, Result};
pub use pipeline::{
    CancellationToken, GeneratedImages, GenerationInputs, GenerationOutput,
    GuidedDiffusionPipeline, InferenceContext,
};
pub use strategy::{LoopHooks, StepStrategy};
