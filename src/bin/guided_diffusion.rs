//! Guided Diffusion CLI
//!
//! Drives the denoising engine end to end with the deterministic mock
//! collaborators, so every guidance path can be exercised without weights.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin guided-diffusion -- \
//!     --prompt "a lighthouse at dusk" \
//!     --steps 30 --sag-scale 0.75 \
//!     --output out
//! ```

use std::cell::Cell;
use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use clap::Parser;
use tracing::{info, warn};

use candle_guided_diffusion::{
    GeneratedImages, GenerationInputs, GenerationParams, GuidedDiffusionPipeline, LoopHooks,
    OutputType, PipelineConfig, PromptInput, SchedulerKind,
    latents_bin::{read_latents, write_tensor},
    mock::{MockCodec, MockDenoiser, MockTextEncoder},
};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Guided latent denoising with mock collaborators")]
struct Args {
    /// Text prompt
    #[arg(short, long)]
    prompt: String,

    /// Negative prompt for classifier-free guidance
    #[arg(long)]
    negative_prompt: Option<String>,

    /// Number of inference steps
    #[arg(long, default_value = "50")]
    steps: usize,

    /// Classifier-free guidance scale (disabled at <= 1)
    #[arg(long, default_value = "7.5")]
    guidance_scale: f64,

    /// Self-attention guidance scale (disabled at 0)
    #[arg(long, default_value = "0.0")]
    sag_scale: f64,

    /// Fraction of the schedule applied to a reference image
    #[arg(long, default_value = "0.8")]
    strength: f64,

    /// Random seed
    #[arg(long, default_value = "42")]
    seed: u64,

    #[arg(long, default_value = "64")]
    height: usize,

    #[arg(long, default_value = "64")]
    width: usize,

    #[arg(long, default_value = "1")]
    num_images_per_prompt: usize,

    /// ddim | euler | k_euler | k_euler_a
    #[arg(long)]
    scheduler: Option<SchedulerKind>,

    /// DDIM noise-variance coefficient
    #[arg(long, default_value = "0.0")]
    eta: f64,

    /// Pipeline config JSON (scheduler, SAG, tiling)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Start from a synthetic gradient reference image
    #[arg(long)]
    img2img: bool,

    /// Inpaint the centre of a synthetic reference image
    #[arg(long, conflicts_with = "img2img")]
    inpaint: bool,

    /// Pre-drawn noise from a latent dump
    #[arg(long)]
    latents: Option<PathBuf>,

    /// pil | pixel | latent
    #[arg(long, default_value = "pil")]
    output_type: OutputType,

    /// Request cancellation once this step has run
    #[arg(long)]
    cancel_at_step: Option<usize>,

    /// Progress interval in steps
    #[arg(long, default_value = "1")]
    callback_steps: usize,

    /// Output path prefix
    #[arg(short, long, default_value = "output")]
    output: PathBuf,
}

/// Horizontal ramp in [-1, 1], `(1, 3, h, w)`
fn gradient_image(height: usize, width: usize, device: &Device) -> candle_core::Result<Tensor> {
    let row = Tensor::arange(0u32, width as u32, device)?
        .to_dtype(DType::F32)?
        .affine(2.0 / width.max(1) as f64, -1.0)?;
    row.reshape((1, 1, 1, width))?
        .broadcast_as((1, 3, height, width))?
        .contiguous()
}

/// Centre square set to 1, `(1, 1, h, w)`
fn centre_mask(height: usize, width: usize, device: &Device) -> candle_core::Result<Tensor> {
    let inner = Tensor::ones((1, 1, height / 2, width / 2), DType::F32, device)?;
    inner
        .pad_with_zeros(2, height / 4, height - height / 2 - height / 4)?
        .pad_with_zeros(3, width / 4, width - width / 2 - width / 4)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("candle_guided_diffusion=info".parse()?)
                .add_directive("guided_diffusion=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let device = Device::Cpu;

    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(kind) = args.scheduler {
        config.scheduler.kind = kind;
    }
    info!("Prompt: {}", args.prompt);
    info!(
        "Scheduler: {:?}, {} steps, guidance {}, SAG {}",
        config.scheduler.kind, args.steps, args.guidance_scale, args.sag_scale
    );

    let params = GenerationParams {
        height: args.height,
        width: args.width,
        num_inference_steps: args.steps,
        guidance_scale: args.guidance_scale,
        self_attention_scale: args.sag_scale,
        strength: args.strength,
        num_images_per_prompt: args.num_images_per_prompt,
        eta: args.eta,
        output_type: args.output_type,
        callback_steps: args.callback_steps,
        seed: args.seed,
        ..Default::default()
    };

    let scale_factor = config.vae_scale_factor;
    let in_channels = if args.inpaint { 9 } else { 4 };
    let mut pipeline = GuidedDiffusionPipeline::new(
        Box::new(MockTextEncoder::new(&device)),
        Box::new(MockDenoiser::with_in_channels(in_channels)),
        Box::new(MockCodec::new(scale_factor)),
        config,
        device.clone(),
        DType::F32,
    )?;

    let reference = gradient_image(args.height, args.width, &device)?;
    let mask = centre_mask(args.height, args.width, &device)?;
    let mut inputs = GenerationInputs::new(PromptInput::Single(args.prompt.clone()));
    if let Some(negative) = &args.negative_prompt {
        inputs = inputs.with_negative_prompt(negative.as_str());
    }
    if args.img2img || args.inpaint {
        inputs = inputs.with_image(&reference);
    }
    if args.inpaint {
        inputs = inputs.with_mask(&mask);
    }
    if let Some(path) = &args.latents {
        inputs = inputs.with_latents(read_latents(path, &device)?);
    }

    let last_step = Cell::new(None);
    let mut progress = |step: usize, timestep: f64, _latents: &Tensor| {
        last_step.set(Some(step));
        info!(step, timestep, "Progress");
    };
    let cancel_at = args.cancel_at_step;
    let is_cancelled = || matches!((cancel_at, last_step.get()), (Some(k), Some(s)) if s >= k);
    let hooks = LoopHooks::new()
        .with_progress(&mut progress)
        .with_cancellation(&is_cancelled);

    let Some(output) = pipeline.generate(inputs, &params, hooks)? else {
        warn!("Generation cancelled, nothing written");
        return Ok(());
    };

    match output.images {
        GeneratedImages::Images(images) => {
            for (i, image) in images.iter().enumerate() {
                let path = args.output.with_extension(format!("{i}.png"));
                image
                    .save(&path)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                info!("Saved {}", path.display());
            }
        }
        GeneratedImages::Pixels(pixels) => {
            let path = args.output.with_extension("pixels.bin");
            write_tensor(&path, &pixels)?;
            info!("Saved pixels {:?} to {}", pixels.dims(), path.display());
        }
        GeneratedImages::Latents(latents) => {
            let path = args.output.with_extension("latents.bin");
            write_tensor(&path, &latents)?;
            info!("Saved latents {:?} to {}", latents.dims(), path.display());
        }
    }

    info!("Generation complete!");
    Ok(())
}
