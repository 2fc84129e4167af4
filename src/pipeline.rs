//! Guided Diffusion Pipeline
//!
//! The denoising loop orchestrator and the collaborator contracts it drives.
//!
//! # Architecture Overview
//!
//! ```text
//! prompt ─► TextEncoder ─► [uncond; cond] embeddings ─┐
//! image  ─► Codec.encode ─► noised latents ───────────┤
//! mask   ─► mask latents / compositor ────────────────┤
//! control image ─► ControlAdapter residuals ──────────┤
//!                                                     ▼
//!        StepStrategy.run ─► do_denoise per step (CFG, SAG, control, mask)
//!                                                     │
//!                         Codec.decode ◄──────────────┘ ─► pixels / images
//! ```
//!
//! # Features
//!
//! - **Classifier-Free Guidance (CFG)**: on for `guidance_scale > 1`
//! - **Self-Attention Guidance (SAG)**: on for `self_attention_scale > 0`
//! - **Structural control**: residuals from a [`ControlAdapter`], with guess mode
//! - **Inpainting**: nine-channel denoisers or known-region compositing
//! - **Cancellation**: cooperative, polled at `callback_steps` granularity
//!
//! # Example
//!
//! ```rust,ignore
//! let mut pipeline = GuidedDiffusionPipeline::new(encoder, denoiser, codec, config, device, DType::F32)?;
//! let params = GenerationParams::default().with_steps(30);
//! let out = pipeline.text2img("a lighthouse at dusk", None, &params, LoopHooks::new())?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use image::RgbImage;
use tracing::{debug, info};

use crate::conditioning::{
    ConditioningBundle, ControlConditioning, MaskConditioning, PromptInput, encode_prompt,
    prepare_control, prepare_control_image, prepare_mask_and_masked_image, prepare_mask_latents,
    resolve_prompts,
};
use crate::config::{GenerationParams, OutputType, PipelineConfig, SagConfig};
use crate::error::{DenoiseError, Result};
use crate::guidance::{GuidanceConfig, apply_cfg, pad_uncond_residuals, sag_masking};
use crate::latents::{LatentShape, prepare_latents};
use crate::mask::MaskCompositor;
use crate::postprocess::{decode_latents, to_nhwc, to_rgb_images};
use crate::schedule::get_timesteps;
use crate::scheduler::Scheduler;
use crate::strategy::{LoopHooks, LoopOutcome, ModelCall, StepContext, StepStrategy, Transition};
use crate::utils::Pcg32;

// =============================================================================
// Collaborator contracts
// =============================================================================

/// Prompt → embeddings, including any prompt weighting
pub trait TextEncoder {
    /// Returns `(cond, uncond)`, each `(batch, seq, dim)`.
    ///
    /// `uncond_prompts` is only passed when classifier-free guidance is on.
    fn encode(
        &mut self,
        prompts: &[String],
        uncond_prompts: Option<&[String]>,
        max_embeddings_multiples: usize,
    ) -> candle_core::Result<(Tensor, Option<Tensor>)>;
}

/// Attention probabilities recorded during a denoiser call
#[derive(Debug, Clone)]
pub struct AttentionCapture {
    /// `(batch * heads, hw, hw)` self-attention probabilities
    pub probs: Tensor,
    pub heads: usize,
    /// Spatial size of the attention block's feature map
    pub map_size: (usize, usize),
}

impl AttentionCapture {
    /// First `batch` entries (all heads) of a capture over a doubled batch
    pub fn leading_batch(&self, batch: usize) -> candle_core::Result<Self> {
        Ok(Self {
            probs: self.probs.narrow(0, 0, batch * self.heads)?,
            heads: self.heads,
            map_size: self.map_size,
        })
    }
}

/// Result of one denoiser call
#[derive(Debug, Clone)]
pub struct DenoiserOutput {
    pub noise_pred: Tensor,
    /// Present only when the call asked for it
    pub attention: Option<AttentionCapture>,
}

/// Residual corrections produced by a [`ControlAdapter`]
#[derive(Debug, Clone)]
pub struct ControlResiduals {
    pub down_blocks: Vec<Tensor>,
    pub mid_block: Tensor,
}

/// The noise-predicting network
pub trait Denoiser {
    /// 4 for a plain latent denoiser, 9 for an inpainting one
    fn in_channels(&self) -> usize;

    fn forward(
        &mut self,
        latent_input: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
        control: Option<&ControlResiduals>,
        capture_attention: bool,
    ) -> candle_core::Result<DenoiserOutput>;
}

/// Pixel ↔ latent codec
pub trait Codec {
    fn latent_channels(&self) -> usize;

    /// `(b, 3, H, W)` in [-1, 1] → unscaled latents `(b, c, H / f, W / f)`
    fn encode(&mut self, image: &Tensor, generator: &mut Pcg32) -> candle_core::Result<Tensor>;

    /// Unscaled latents → pixels in [-1, 1]
    fn decode(&mut self, latents: &Tensor) -> candle_core::Result<Tensor>;
}

/// Structural-control network
pub trait ControlAdapter {
    /// Adapters with globally pooled conditions always run in guess mode
    fn global_pool_conditions(&self) -> bool {
        false
    }

    #[allow(clippy::too_many_arguments)]
    fn forward(
        &mut self,
        sample: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
        control_image: &Tensor,
        conditioning_scale: f64,
        guess_mode: bool,
    ) -> candle_core::Result<ControlResiduals>;
}

// =============================================================================
// Inference context and cancellation
// =============================================================================

/// Exclusive access to one compute resource for the length of an invocation
#[derive(Debug, Default)]
pub struct InferenceContext {
    name: String,
    lock: Mutex<()>,
}

impl InferenceContext {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            lock: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blocks until the resource is free. Released when the guard drops.
    pub fn acquire(&self, height: usize, width: usize) -> Result<InferenceGuard<'_>> {
        let guard = self.lock.lock().map_err(|_| DenoiseError::ContextPoisoned)?;
        debug!(context = %self.name, height, width, "Inference context acquired");
        Ok(InferenceGuard {
            _guard: guard,
            name: &self.name,
            started: Instant::now(),
        })
    }

    /// Whether the resource is currently free
    pub fn is_idle(&self) -> bool {
        self.lock.try_lock().is_ok()
    }
}

pub struct InferenceGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    name: &'a str,
    started: Instant,
}

impl Drop for InferenceGuard<'_> {
    fn drop(&mut self) {
        debug!(
            context = %self.name,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Inference context released"
        );
    }
}

/// Caller-owned interrupt flag, usable as the loop's cancellation predicate
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Call inputs and outputs
// =============================================================================

/// Tensor inputs of one invocation
#[derive(Debug, Clone)]
pub struct GenerationInputs<'a> {
    pub prompt: PromptInput,
    pub negative_prompt: Option<PromptInput>,
    /// Reference image `(b, 3, H, W)` in [-1, 1]
    pub image: Option<&'a Tensor>,
    /// Inpainting mask `(b, 1, H, W)` in [0, 1], 1 = repaint
    pub mask_image: Option<&'a Tensor>,
    /// Structural control image `(b, c, H, W)`
    pub control_image: Option<&'a Tensor>,
    /// Pre-drawn noise, `(batch, c, H / f, W / f)`
    pub latents: Option<Tensor>,
}

impl<'a> GenerationInputs<'a> {
    pub fn new(prompt: impl Into<PromptInput>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            image: None,
            mask_image: None,
            control_image: None,
            latents: None,
        }
    }

    pub fn with_negative_prompt(mut self, negative: impl Into<PromptInput>) -> Self {
        self.negative_prompt = Some(negative.into());
        self
    }

    pub fn with_image(mut self, image: &'a Tensor) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_mask(mut self, mask: &'a Tensor) -> Self {
        self.mask_image = Some(mask);
        self
    }

    pub fn with_control_image(mut self, image: &'a Tensor) -> Self {
        self.control_image = Some(image);
        self
    }

    pub fn with_latents(mut self, latents: Tensor) -> Self {
        self.latents = Some(latents);
        self
    }
}

/// Output representation of a completed run
#[derive(Debug, Clone)]
pub enum GeneratedImages {
    Images(Vec<RgbImage>),
    /// NHWC f32 in [0, 1]
    Pixels(Tensor),
    Latents(Tensor),
}

impl GeneratedImages {
    pub fn len(&self) -> usize {
        match self {
            GeneratedImages::Images(v) => v.len(),
            GeneratedImages::Pixels(t) | GeneratedImages::Latents(t) => {
                t.dims().first().copied().unwrap_or(0)
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub images: GeneratedImages,
    /// Safety checking is disabled; always `false` per image
    pub nsfw_content_detected: Vec<bool>,
}

// =============================================================================
// Per-step denoise
// =============================================================================

/// Structural control state for the loop
struct ControlStep<'s> {
    adapter: &'s mut dyn ControlAdapter,
    conditioning: &'s ControlConditioning,
}

/// Explicit per-invocation state the per-step function reads.
///
/// Built once before the loop; both step strategies call [`Self::do_denoise`].
struct DenoiseStep<'s> {
    guidance: GuidanceConfig,
    bundle: &'s ConditioningBundle,
    control: Option<ControlStep<'s>>,
    compositor: Option<&'s MaskCompositor>,
    sag: &'s SagConfig,
}

impl DenoiseStep<'_> {
    fn do_cfg(&self) -> bool {
        self.guidance.do_classifier_free_guidance()
    }

    /// Append the inpainting channels, using the first `batch` rows of them
    fn with_mask_channels(&self, latent_input: &Tensor, batch: usize) -> candle_core::Result<Tensor> {
        match &self.bundle.mask {
            Some(MaskConditioning {
                mask,
                masked_image_latents,
            }) => {
                let mask = mask.narrow(0, 0, batch)?;
                let masked = masked_image_latents.narrow(0, 0, batch)?;
                Tensor::cat(&[latent_input, &mask, &masked], 1)
            }
            None => Ok(latent_input.clone()),
        }
    }

    fn control_residuals(
        &mut self,
        scheduler: &dyn Scheduler,
        x: &Tensor,
        latent_input: &Tensor,
        ctx: &StepContext,
    ) -> candle_core::Result<Option<ControlResiduals>> {
        let do_cfg = self.do_cfg();
        let guess_mode = self.guidance.guess_mode;
        let scale = self.guidance.controlnet_conditioning_scale;
        let Some(control) = self.control.as_mut() else {
            return Ok(None);
        };
        let cond_scale = control.conditioning.conditioning_scale(scale, ctx.index);

        if guess_mode && do_cfg {
            // only the conditional half goes through the adapter
            let input = scheduler.scale_model_input(x, ctx.timestep)?;
            let embeddings = self.bundle.cond_embeddings(true)?;
            let residuals = control.adapter.forward(
                &input,
                ctx.timestep,
                &embeddings,
                &control.conditioning.image,
                cond_scale,
                true,
            )?;
            pad_uncond_residuals(residuals).map(Some)
        } else {
            control
                .adapter
                .forward(
                    latent_input,
                    ctx.timestep,
                    &self.bundle.embeddings,
                    &control.conditioning.image,
                    cond_scale,
                    guess_mode,
                )
                .map(Some)
        }
    }

    /// Guided noise prediction for latent `x` at `ctx`
    fn guided_prediction(
        &mut self,
        scheduler: &dyn Scheduler,
        x: &Tensor,
        ctx: &StepContext,
        call: &mut dyn ModelCall,
    ) -> candle_core::Result<Tensor> {
        let do_cfg = self.do_cfg();
        let do_sag = self.guidance.do_self_attention_guidance();
        let t = ctx.timestep;
        let batch = x.dim(0)?;

        let latent_input = if do_cfg {
            Tensor::cat(&[x, x], 0)?
        } else {
            x.clone()
        };
        let latent_input = scheduler.scale_model_input(&latent_input, t)?;
        let model_input = self.with_mask_channels(&latent_input, latent_input.dim(0)?)?;

        let control = self.control_residuals(scheduler, x, &latent_input, ctx)?;
        let out = call.call(&model_input, t, &self.bundle.embeddings, control.as_ref(), do_sag)?;

        let (mut noise_pred, sag_source) = if do_cfg {
            let (guided, uncond) = apply_cfg(&out.noise_pred, self.guidance.guidance_scale)?;
            (guided, uncond)
        } else {
            (out.noise_pred.clone(), out.noise_pred)
        };

        if do_sag {
            let Some(attention) = out.attention else {
                candle_core::bail!("self-attention guidance needs an attention capture from the denoiser");
            };
            let attention = if do_cfg {
                attention.leading_batch(batch)?
            } else {
                attention
            };

            let pred_x0 = scheduler.pred_x0(x, &sag_source, t)?;
            let eps = scheduler.pred_epsilon(x, &sag_source, t)?;
            let degraded = sag_masking(scheduler, &pred_x0, &attention, t, &eps, self.sag)?;

            let degraded_input = scheduler.scale_model_input(&degraded, t)?;
            let degraded_input = self.with_mask_channels(&degraded_input, batch)?;
            let embeddings = self.bundle.uncond_embeddings(do_cfg)?;
            let degraded_pred = call
                .call(&degraded_input, t, &embeddings, None, false)?
                .noise_pred;

            let correction = ((&sag_source - degraded_pred)? * self.guidance.self_attention_scale)?;
            noise_pred = (noise_pred + correction)?;
            debug!(step = ctx.index, "Applied self-attention guidance");
        }

        Ok(noise_pred)
    }

    /// Advance `x` by one step with guidance and mask compositing applied
    fn do_denoise(
        &mut self,
        x: &Tensor,
        ctx: &StepContext,
        call: &mut dyn ModelCall,
        transition: &mut dyn Transition,
    ) -> Result<Tensor> {
        let noise_pred = self.guided_prediction(transition.scheduler(), x, ctx, call)?;
        let stepped = transition.advance(&noise_pred, ctx, x)?;

        let next = match self.compositor {
            Some(compositor) => compositor.composite(
                &stepped,
                transition.scheduler(),
                transition.output_timestep(ctx),
            )?,
            None => stepped,
        };
        Ok(next)
    }
}

// =============================================================================
// Pipeline
// =============================================================================

pub struct GuidedDiffusionPipeline<'a> {
    text_encoder: Box<dyn TextEncoder + 'a>,
    denoiser: Box<dyn Denoiser + 'a>,
    codec: Box<dyn Codec + 'a>,
    control: Option<Box<dyn ControlAdapter + 'a>>,
    strategy: StepStrategy<'a>,
    config: PipelineConfig,
    context: Arc<InferenceContext>,
    device: Device,
    dtype: DType,
}

impl<'a> GuidedDiffusionPipeline<'a> {
    /// Build a pipeline; the step strategy is resolved from `config.scheduler`.
    pub fn new(
        text_encoder: Box<dyn TextEncoder + 'a>,
        denoiser: Box<dyn Denoiser + 'a>,
        codec: Box<dyn Codec + 'a>,
        config: PipelineConfig,
        device: Device,
        dtype: DType,
    ) -> Result<Self> {
        if config.vae_scale_factor == 0 {
            return Err(DenoiseError::invalid("vae_scale_factor must be positive"));
        }
        let strategy = StepStrategy::from_config(&config.scheduler)?;
        Ok(Self {
            text_encoder,
            denoiser,
            codec,
            control: None,
            strategy,
            config,
            context: InferenceContext::new(format!("{device:?}")),
            device,
            dtype,
        })
    }

    pub fn with_control_adapter(mut self, adapter: Box<dyn ControlAdapter + 'a>) -> Self {
        self.control = Some(adapter);
        self
    }

    /// Replace the strategy resolved from the config
    pub fn with_strategy(mut self, strategy: StepStrategy<'a>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Share an inference context with other pipelines on the same resource
    pub fn with_context(mut self, context: Arc<InferenceContext>) -> Self {
        self.context = context;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<InferenceContext> {
        &self.context
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn strategy(&self) -> &StepStrategy<'a> {
        &self.strategy
    }

    /// Text-to-image: start from noise over the full schedule
    pub fn text2img(
        &mut self,
        prompt: impl Into<PromptInput>,
        negative_prompt: Option<PromptInput>,
        params: &GenerationParams,
        hooks: LoopHooks<'_>,
    ) -> Result<Option<GenerationOutput>> {
        let mut inputs = GenerationInputs::new(prompt);
        inputs.negative_prompt = negative_prompt;
        self.generate(inputs, params, hooks)
    }

    /// Image-to-image: noise `image` to `strength` and denoise from there
    pub fn img2img(
        &mut self,
        prompt: impl Into<PromptInput>,
        negative_prompt: Option<PromptInput>,
        image: &Tensor,
        params: &GenerationParams,
        hooks: LoopHooks<'_>,
    ) -> Result<Option<GenerationOutput>> {
        let mut inputs = GenerationInputs::new(prompt).with_image(image);
        inputs.negative_prompt = negative_prompt;
        self.generate(inputs, params, hooks)
    }

    /// Repaint the region of `image` where `mask` is 1
    pub fn inpaint(
        &mut self,
        prompt: impl Into<PromptInput>,
        negative_prompt: Option<PromptInput>,
        image: &Tensor,
        mask: &Tensor,
        params: &GenerationParams,
        hooks: LoopHooks<'_>,
    ) -> Result<Option<GenerationOutput>> {
        let mut inputs = GenerationInputs::new(prompt)
            .with_image(image)
            .with_mask(mask);
        inputs.negative_prompt = negative_prompt;
        self.generate(inputs, params, hooks)
    }

    /// Checks that need no collaborator call
    fn validate_inputs(&self, inputs: &GenerationInputs<'_>, params: &GenerationParams) -> Result<()> {
        params.validate(self.config.vae_scale_factor)?;
        let (height, width) = (params.height, params.width);

        if let Some(image) = inputs.image {
            let (b, c, h, w) = image.dims4()?;
            if c != 3 || (h, w) != (height, width) {
                return Err(DenoiseError::shape("reference image", &[b, 3, height, width], image.dims()));
            }
        }
        if let Some(mask) = inputs.mask_image {
            if inputs.image.is_none() {
                return Err(DenoiseError::invalid("`mask_image` requires a reference `image`"));
            }
            let (b, _c, h, w) = mask.dims4()?;
            if (h, w) != (height, width) {
                return Err(DenoiseError::shape("mask image", &[b, 1, height, width], mask.dims()));
            }
        }

        match (self.control.is_some(), inputs.control_image) {
            (true, None) => {
                return Err(DenoiseError::invalid("a control adapter needs a `control_image`"));
            }
            (false, Some(_)) => {
                return Err(DenoiseError::invalid(
                    "`control_image` given but no control adapter is attached",
                ));
            }
            (true, Some(_)) if inputs.image.is_some() => {
                return Err(DenoiseError::invalid(
                    "controlled runs start from noise and cannot take a reference `image`",
                ));
            }
            _ => {}
        }

        let latent_channels = self.codec.latent_channels();
        let in_channels = self.denoiser.in_channels();
        if in_channels == 2 * latent_channels + 1 {
            if inputs.mask_image.is_none() {
                return Err(DenoiseError::invalid(format!(
                    "a {in_channels}-channel inpainting denoiser needs `mask_image`"
                )));
            }
        } else if in_channels != latent_channels {
            return Err(DenoiseError::invalid(format!(
                "denoiser expects {in_channels} input channels, codec produces {latent_channels}"
            )));
        }
        Ok(())
    }

    /// Run one invocation.
    ///
    /// Returns `Ok(None)` when cancelled; nothing is decoded in that case.
    /// Every validation error is raised before any collaborator is called.
    pub fn generate(
        &mut self,
        inputs: GenerationInputs<'_>,
        params: &GenerationParams,
        mut hooks: LoopHooks<'_>,
    ) -> Result<Option<GenerationOutput>> {
        self.validate_inputs(&inputs, params)?;
        let GenerationInputs {
            prompt,
            negative_prompt,
            image,
            mask_image,
            control_image,
            latents,
        } = inputs;
        let (prompts, negatives) = resolve_prompts(prompt, negative_prompt)?;
        hooks.callback_steps = params.callback_steps;

        let Self {
            text_encoder,
            denoiser,
            codec,
            control,
            strategy,
            config,
            context,
            device,
            dtype,
        } = self;
        let dtype = *dtype;
        let _guard = context.acquire(params.height, params.width)?;

        let guess_mode = params.guess_mode
            || control.as_ref().is_some_and(|c| c.global_pool_conditions());
        let guidance = GuidanceConfig {
            guidance_scale: params.guidance_scale,
            self_attention_scale: params.self_attention_scale,
            controlnet_conditioning_scale: params.controlnet_conditioning_scale,
            guess_mode,
        };
        let do_cfg = guidance.do_classifier_free_guidance();
        let batch_size = prompts.len() * params.num_images_per_prompt;
        let scale = config.vae_scale_factor;
        let (latent_h, latent_w) = (params.height / scale, params.width / scale);

        info!(
            batch_size,
            steps = params.num_inference_steps,
            strength = params.strength,
            guidance_scale = params.guidance_scale,
            self_attention_scale = params.self_attention_scale,
            external = strategy.is_external(),
            "Starting generation"
        );

        // Prompt embeddings
        let embeddings = encode_prompt(
            text_encoder.as_mut(),
            &prompts,
            &negatives,
            params.num_images_per_prompt,
            do_cfg,
            params.max_embeddings_multiples,
            dtype,
        )?;

        let mut generator = Pcg32::from_seed(params.seed);
        let image = image.map(|i| i.to_device(device)?.to_dtype(dtype)).transpose()?;

        // Mask conditioning
        let inpainting_denoiser = denoiser.in_channels() != codec.latent_channels();
        let mut latent_mask = None;
        let mut mask_conditioning = None;
        if let (Some(image), Some(mask)) = (image.as_ref(), mask_image) {
            let mask = mask.to_device(device)?.to_dtype(dtype)?;
            let (mask, masked_image) = prepare_mask_and_masked_image(image, &mask)?;
            if inpainting_denoiser {
                mask_conditioning = Some(prepare_mask_latents(
                    codec.as_mut(),
                    &mask,
                    &masked_image,
                    batch_size,
                    latent_h,
                    latent_w,
                    config.latent_scaling_factor,
                    do_cfg,
                    &mut generator,
                    dtype,
                )?);
            } else {
                latent_mask = Some(
                    mask.to_dtype(DType::F32)?
                        .interpolate2d(latent_h, latent_w)?
                        .to_dtype(dtype)?,
                );
            }
        }

        // Schedule
        let start_from_noise = image.is_none() || control.is_some();
        strategy.set_timesteps(params.num_inference_steps)?;
        let full = strategy.scheduler().timesteps().to_vec();
        let schedule = get_timesteps(
            &full,
            params.num_inference_steps,
            params.strength,
            start_from_noise,
        )?;

        // Structural control
        let control_conditioning = match control_image {
            Some(control_image) => {
                let prepared = prepare_control_image(
                    &control_image.to_device(device)?,
                    params.height,
                    params.width,
                    prompts.len(),
                    params.num_images_per_prompt,
                    do_cfg,
                    guess_mode,
                    dtype,
                )?;
                Some(prepare_control(
                    prepared,
                    schedule.len(),
                    params.control_guidance_start,
                    params.control_guidance_end,
                ))
            }
            None => None,
        };

        // Latents
        let shape = LatentShape {
            batch_size,
            channels: codec.latent_channels(),
            height: latent_h,
            width: latent_w,
        };
        let init = prepare_latents(
            strategy.scheduler(),
            codec.as_mut(),
            image.as_ref(),
            &schedule,
            shape,
            scale,
            config.latent_scaling_factor,
            latents,
            &mut generator,
            device,
            dtype,
        )?;

        let compositor = match (latent_mask, init.image_latents.as_ref()) {
            (Some(mask), Some(image_latents)) => {
                Some(MaskCompositor::new(image_latents, &mask, init.noise.clone())?)
            }
            _ => None,
        };

        let bundle = ConditioningBundle {
            embeddings,
            batch_size,
            control: control_conditioning,
            mask: mask_conditioning,
        };
        bundle.validate(do_cfg, (latent_h, latent_w))?;

        // Denoising loop
        let mut step = DenoiseStep {
            guidance,
            bundle: &bundle,
            control: match (control.as_mut(), bundle.control.as_ref()) {
                (Some(adapter), Some(conditioning)) => Some(ControlStep {
                    adapter: adapter.as_mut(),
                    conditioning,
                }),
                _ => None,
            },
            compositor: compositor.as_ref(),
            sag: &config.sag,
        };
        let mut apply_model = |x: &Tensor,
                               ctx: &StepContext,
                               call: &mut dyn ModelCall,
                               transition: &mut dyn Transition| {
            step.do_denoise(x, ctx, call, transition)
        };

        let started = Instant::now();
        let outcome = strategy.run(
            init.latents,
            &schedule,
            denoiser.as_mut(),
            params.eta,
            &mut generator,
            &mut hooks,
            &mut apply_model,
        )?;

        let latents = match outcome {
            LoopOutcome::Cancelled { step } => {
                info!(step, "Generation cancelled");
                return Ok(None);
            }
            LoopOutcome::Finished(latents) => latents,
        };
        info!(
            steps = schedule.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Denoising complete"
        );

        // Postprocess
        let images = match params.output_type {
            OutputType::Latent => GeneratedImages::Latents(latents),
            output_type => {
                let pixels = decode_latents(
                    codec.as_mut(),
                    &latents,
                    config.latent_scaling_factor,
                    &config.tiling,
                    scale,
                    params.height,
                    params.width,
                )?;
                match output_type {
                    OutputType::Pil => GeneratedImages::Images(to_rgb_images(&pixels)?),
                    _ => GeneratedImages::Pixels(to_nhwc(&pixels)?),
                }
            }
        };
        let nsfw_content_detected = vec![false; images.len()];

        Ok(Some(GenerationOutput {
            images,
            nsfw_content_detected,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_token_shared_between_clones() {
        let token = CancellationToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
        token.reset();
        assert!(!observer.is_cancelled());
    }

    #[test]
    fn test_inference_context_released_on_drop() -> Result<()> {
        let context = InferenceContext::new("cpu");
        {
            let _guard = context.acquire(64, 64)?;
            assert!(!context.is_idle());
        }
        assert!(context.is_idle());
        Ok(())
    }

    #[test]
    fn test_poisoned_context_reports_error() {
        let context = InferenceContext::new("cpu");
        let shared = Arc::clone(&context);
        let _ = std::thread::spawn(move || {
            let _guard = shared.acquire(8, 8);
            panic!("holder panics");
        })
        .join();
        assert!(matches!(
            context.acquire(8, 8),
            Err(DenoiseError::ContextPoisoned)
        ));
    }

    #[test]
    fn test_generated_images_len() -> candle_core::Result<()> {
        let latents = Tensor::zeros((3, 4, 2, 2), DType::F32, &Device::Cpu)?;
        assert_eq!(GeneratedImages::Latents(latents).len(), 3);
        assert!(GeneratedImages::Images(vec![]).is_empty());
        Ok(())
    }
}
