//! Configuration structures for the guided denoising engine

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DenoiseError, Result};

/// Immutable engine configuration, fixed when the pipeline is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Spatial downscale factor of the codec (pixels per latent cell)
    #[serde(default = "default_vae_scale_factor")]
    pub vae_scale_factor: usize,
    /// Multiplier applied to encoded latents (and divided out before decode)
    #[serde(default = "default_latent_scaling_factor")]
    pub latent_scaling_factor: f64,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub sag: SagConfig,
    #[serde(default)]
    pub tiling: TilingConfig,
}

fn default_vae_scale_factor() -> usize {
    8
}

fn default_latent_scaling_factor() -> f64 {
    0.18215
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            vae_scale_factor: 8,
            latent_scaling_factor: 0.18215,
            scheduler: SchedulerConfig::default(),
            sag: SagConfig::default(),
            tiling: TilingConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load a configuration from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> std::result::Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> std::result::Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        if config.vae_scale_factor == 0 {
            return Err(ConfigError::InvalidValue(
                "vae_scale_factor must be positive".to_string(),
            ));
        }
        Ok(config)
    }
}

/// Which stepping strategy drives the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// DDIM, one scheduler step per timestep
    Ddim,
    /// Euler discrete, one scheduler step per timestep
    Euler,
    /// k-diffusion Euler sampler owning the loop
    KEuler,
    /// k-diffusion Euler ancestral sampler owning the loop
    KEulerA,
}

impl SchedulerKind {
    pub fn is_external(self) -> bool {
        matches!(self, Self::KEuler | Self::KEulerA)
    }
}

/// Parse the snake_case serde name of a config enum
fn parse_snake_case<T: serde::de::DeserializeOwned>(s: &str) -> std::result::Result<T, ConfigError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| ConfigError::InvalidValue(format!("unknown value `{s}`")))
}

impl std::str::FromStr for SchedulerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        parse_snake_case(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Linear in sqrt(beta), the Stable Diffusion default
    ScaledLinear,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    Epsilon,
    VPrediction,
    Sample,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestepSpacing {
    Leading,
    Trailing,
    Linspace,
}

/// Noise schedule and stepping configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_kind")]
    pub kind: SchedulerKind,
    /// Number of training timesteps (typically 1000)
    #[serde(default = "default_num_train_timesteps")]
    pub num_train_timesteps: usize,
    #[serde(default = "default_beta_start")]
    pub beta_start: f64,
    #[serde(default = "default_beta_end")]
    pub beta_end: f64,
    #[serde(default = "default_beta_schedule")]
    pub beta_schedule: BetaSchedule,
    #[serde(default = "default_prediction_type")]
    pub prediction_type: PredictionType,
    #[serde(default = "default_timestep_spacing")]
    pub timestep_spacing: TimestepSpacing,
    /// Added to every "leading" timestep
    #[serde(default = "default_steps_offset")]
    pub steps_offset: usize,
}

fn default_scheduler_kind() -> SchedulerKind {
    SchedulerKind::Ddim
}

fn default_num_train_timesteps() -> usize {
    1000
}

fn default_beta_start() -> f64 {
    0.00085
}

fn default_beta_end() -> f64 {
    0.012
}

fn default_beta_schedule() -> BetaSchedule {
    BetaSchedule::ScaledLinear
}

fn default_prediction_type() -> PredictionType {
    PredictionType::Epsilon
}

fn default_timestep_spacing() -> TimestepSpacing {
    TimestepSpacing::Leading
}

fn default_steps_offset() -> usize {
    1
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            kind: SchedulerKind::Ddim,
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            prediction_type: PredictionType::Epsilon,
            timestep_spacing: TimestepSpacing::Leading,
            steps_offset: 1,
        }
    }
}

/// Self-attention guidance degradation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagConfig {
    /// Gaussian blur kernel size (odd)
    #[serde(default = "default_blur_kernel_size")]
    pub blur_kernel_size: usize,
    #[serde(default = "default_blur_sigma")]
    pub blur_sigma: f64,
    /// Summed attention above this marks a latent cell as salient
    #[serde(default = "default_mask_threshold")]
    pub mask_threshold: f64,
}

fn default_blur_kernel_size() -> usize {
    9
}

fn default_blur_sigma() -> f64 {
    1.0
}

fn default_mask_threshold() -> f64 {
    1.0
}

impl Default for SagConfig {
    fn default() -> Self {
        Self {
            blur_kernel_size: 9,
            blur_sigma: 1.0,
            mask_threshold: 1.0,
        }
    }
}

/// Spatial tiling for the final decode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TilingConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Tile edge in latent cells
    #[serde(default = "default_tile_latent_size")]
    pub tile_latent_size: usize,
    /// Overlap between neighbouring tiles in latent cells
    #[serde(default = "default_tile_latent_overlap")]
    pub tile_latent_overlap: usize,
}

fn default_tile_latent_size() -> usize {
    64
}

fn default_tile_latent_overlap() -> usize {
    8
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tile_latent_size: 64,
            tile_latent_overlap: 8,
        }
    }
}

/// Output representation selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    /// Decoded `image::RgbImage`s
    Pil,
    /// Decoded NHWC f32 pixels in [0, 1]
    Pixel,
    /// Raw final latents, no decode
    Latent,
}

impl std::str::FromStr for OutputType {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        parse_snake_case(s)
    }
}

/// Per-invocation scalar parameters.
///
/// Defaults follow the long-prompt-weighting pipeline: 512x512, 50 steps,
/// guidance 7.5, strength 0.8.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default = "default_size")]
    pub height: usize,
    #[serde(default = "default_size")]
    pub width: usize,
    #[serde(default = "default_num_inference_steps")]
    pub num_inference_steps: usize,
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,
    #[serde(default)]
    pub self_attention_scale: f64,
    #[serde(default = "default_strength")]
    pub strength: f64,
    #[serde(default = "default_one")]
    pub num_images_per_prompt: usize,
    /// DDIM noise-variance coefficient
    #[serde(default)]
    pub eta: f64,
    #[serde(default = "default_max_embeddings_multiples")]
    pub max_embeddings_multiples: usize,
    #[serde(default = "default_output_type")]
    pub output_type: OutputType,
    #[serde(default = "default_one")]
    pub callback_steps: usize,
    #[serde(default = "default_control_scale")]
    pub controlnet_conditioning_scale: f64,
    #[serde(default)]
    pub guess_mode: bool,
    #[serde(default)]
    pub control_guidance_start: f64,
    #[serde(default = "default_control_guidance_end")]
    pub control_guidance_end: f64,
    #[serde(default)]
    pub seed: u64,
}

fn default_size() -> usize {
    512
}

fn default_num_inference_steps() -> usize {
    50
}

fn default_guidance_scale() -> f64 {
    7.5
}

fn default_strength() -> f64 {
    0.8
}

fn default_one() -> usize {
    1
}

fn default_max_embeddings_multiples() -> usize {
    100
}

fn default_output_type() -> OutputType {
    OutputType::Pil
}

fn default_control_scale() -> f64 {
    1.0
}

fn default_control_guidance_end() -> f64 {
    1.0
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            height: 512,
            width: 512,
            num_inference_steps: 50,
            guidance_scale: 7.5,
            self_attention_scale: 0.0,
            strength: 0.8,
            num_images_per_prompt: 1,
            eta: 0.0,
            max_embeddings_multiples: 100,
            output_type: OutputType::Pil,
            callback_steps: 1,
            controlnet_conditioning_scale: 1.0,
            guess_mode: false,
            control_guidance_start: 0.0,
            control_guidance_end: 1.0,
            seed: 0,
        }
    }
}

impl GenerationParams {
    /// Classifier-free guidance is active only above 1.0
    pub fn do_classifier_free_guidance(&self) -> bool {
        self.guidance_scale > 1.0
    }

    pub fn do_self_attention_guidance(&self) -> bool {
        self.self_attention_scale > 0.0
    }

    /// Checks everything that can be checked without touching a collaborator.
    pub fn validate(&self, vae_scale_factor: usize) -> Result<()> {
        if !(0.0..=1.0).contains(&self.strength) {
            return Err(DenoiseError::invalid(format!(
                "The value of strength should in [0.0, 1.0] but is {}",
                self.strength
            )));
        }
        if self.callback_steps == 0 {
            return Err(DenoiseError::invalid(
                "`callback_steps` has to be a positive integer but is 0",
            ));
        }
        if self.num_inference_steps == 0 {
            return Err(DenoiseError::invalid(
                "`num_inference_steps` has to be a positive integer but is 0",
            ));
        }
        if self.num_images_per_prompt == 0 {
            return Err(DenoiseError::invalid(
                "`num_images_per_prompt` has to be a positive integer but is 0",
            ));
        }
        if self.guidance_scale < 0.0 || self.self_attention_scale < 0.0 {
            return Err(DenoiseError::invalid(format!(
                "guidance scales must be non-negative, got guidance={} sag={}",
                self.guidance_scale, self.self_attention_scale
            )));
        }
        if self.control_guidance_start > self.control_guidance_end {
            return Err(DenoiseError::invalid(format!(
                "control guidance start ({}) cannot be larger than end ({})",
                self.control_guidance_start, self.control_guidance_end
            )));
        }
        if self.height == 0
            || self.width == 0
            || !self.height.is_multiple_of(vae_scale_factor)
            || !self.width.is_multiple_of(vae_scale_factor)
        {
            return Err(DenoiseError::invalid(format!(
                "`height` and `width` have to be divisible by {vae_scale_factor} but are {} and {}",
                self.height, self.width
            )));
        }
        Ok(())
    }

    pub fn with_steps(mut self, steps: usize) -> Self {
        self.num_inference_steps = steps;
        self
    }

    pub fn with_guidance_scale(mut self, scale: f64) -> Self {
        self.guidance_scale = scale;
        self
    }

    pub fn with_strength(mut self, strength: f64) -> Self {
        self.strength = strength;
        self
    }

    pub fn with_size(mut self, height: usize, width: usize) -> Self {
        self.height = height;
        self.width = width;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_output_type(mut self, output_type: OutputType) -> Self {
        self.output_type = output_type;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
