//! Conditioning Assembler
//!
//! Everything the denoiser is conditioned on, prepared once before the loop:
//! text embeddings in the `[uncond, cond]` layout, the optional structural
//! control image with its per-step keep weights, and the optional inpainting
//! mask with its masked-image latents.

use candle_core::{DType, Tensor};
use tracing::debug;

use crate::error::{DenoiseError, Result};
use crate::guidance::control_keep_weights;
use crate::pipeline::{Codec, TextEncoder};
use crate::utils::Pcg32;

// =============================================================================
// Prompts
// =============================================================================

/// A single prompt or a batch of prompts
#[derive(Debug, Clone, PartialEq)]
pub enum PromptInput {
    Single(String),
    Batch(Vec<String>),
}

impl PromptInput {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            PromptInput::Single(s) => vec![s],
            PromptInput::Batch(v) => v,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PromptInput::Single(_) => 1,
            PromptInput::Batch(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for PromptInput {
    fn from(s: &str) -> Self {
        PromptInput::Single(s.to_string())
    }
}

impl From<String> for PromptInput {
    fn from(s: String) -> Self {
        PromptInput::Single(s)
    }
}

impl From<Vec<String>> for PromptInput {
    fn from(v: Vec<String>) -> Self {
        PromptInput::Batch(v)
    }
}

impl From<Vec<&str>> for PromptInput {
    fn from(v: Vec<&str>) -> Self {
        PromptInput::Batch(v.into_iter().map(str::to_string).collect())
    }
}

/// Prompt and negative prompt lists of equal length.
///
/// A missing negative prompt becomes `""` per prompt, a single negative
/// string is repeated for every prompt.
pub fn resolve_prompts(
    prompt: PromptInput,
    negative_prompt: Option<PromptInput>,
) -> Result<(Vec<String>, Vec<String>)> {
    if prompt.is_empty() {
        return Err(DenoiseError::invalid(
            "`prompt` has to be a string or a non-empty list of strings",
        ));
    }
    let prompts = prompt.into_vec();
    let batch = prompts.len();

    let negatives = match negative_prompt {
        None => vec![String::new(); batch],
        Some(PromptInput::Single(s)) => vec![s; batch],
        Some(PromptInput::Batch(v)) if v.len() == batch => v,
        Some(PromptInput::Batch(v)) => {
            return Err(DenoiseError::BatchSizeMismatch {
                prompt: batch,
                negative: v.len(),
            });
        }
    };
    Ok((prompts, negatives))
}

/// Repeat each batch entry `n` times in place: `[a, b] -> [a, a, b, b]`
pub fn repeat_interleave_batch(x: &Tensor, n: usize) -> candle_core::Result<Tensor> {
    if n == 1 {
        return Ok(x.clone());
    }
    let b = x.dim(0)?;
    let idx: Vec<u32> = (0..b as u32)
        .flat_map(|i| std::iter::repeat_n(i, n))
        .collect();
    let idx = Tensor::new(idx.as_slice(), x.device())?;
    x.index_select(&idx, 0)
}

/// Expand text embeddings `(b, seq, dim)` to `(b * n, seq, dim)`
fn expand_embeddings(embeddings: &Tensor, n: usize) -> candle_core::Result<Tensor> {
    let (b, seq, dim) = embeddings.dims3()?;
    embeddings.repeat((1, n, 1))?.reshape((b * n, seq, dim))
}

/// Text embeddings in the layout the guidance step expects:
/// `[uncond; cond]` along the batch when CFG is on, `cond` otherwise.
pub fn encode_prompt(
    text_encoder: &mut dyn TextEncoder,
    prompts: &[String],
    negative_prompts: &[String],
    num_images_per_prompt: usize,
    do_classifier_free_guidance: bool,
    max_embeddings_multiples: usize,
    dtype: DType,
) -> Result<Tensor> {
    let batch = prompts.len();
    let uncond_input = do_classifier_free_guidance.then_some(negative_prompts);
    let (cond, uncond) = text_encoder.encode(prompts, uncond_input, max_embeddings_multiples)?;

    if cond.dim(0)? != batch {
        return Err(DenoiseError::shape(
            "prompt embeddings batch",
            &[batch],
            &[cond.dim(0)?],
        ));
    }
    let cond = expand_embeddings(&cond, num_images_per_prompt)?;

    let embeddings = if do_classifier_free_guidance {
        let uncond = uncond.ok_or_else(|| {
            DenoiseError::invalid("text encoder returned no unconditional embeddings")
        })?;
        let uncond = expand_embeddings(&uncond, num_images_per_prompt)?;
        if uncond.dims() != cond.dims() {
            return Err(DenoiseError::shape(
                "unconditional embeddings",
                cond.dims(),
                uncond.dims(),
            ));
        }
        Tensor::cat(&[&uncond, &cond], 0)?
    } else {
        cond
    };

    debug!(shape = ?embeddings.dims(), "Encoded prompt");
    Ok(embeddings.to_dtype(dtype)?)
}

// =============================================================================
// Structural control
// =============================================================================

/// Control image expanded to the denoiser batch, plus per-step keep weights
#[derive(Debug, Clone)]
pub struct ControlConditioning {
    pub image: Tensor,
    pub keep: Vec<f64>,
}

impl ControlConditioning {
    /// `scale * keep[step]`, zero past the end of the schedule
    pub fn conditioning_scale(&self, scale: f64, step: usize) -> f64 {
        scale * self.keep.get(step).copied().unwrap_or(0.0)
    }
}

/// Repeat the control image to the effective batch and double it for CFG
/// unless only the conditional half goes through the adapter.
#[allow(clippy::too_many_arguments)]
pub fn prepare_control_image(
    image: &Tensor,
    height: usize,
    width: usize,
    prompt_batch: usize,
    num_images_per_prompt: usize,
    do_classifier_free_guidance: bool,
    guess_mode: bool,
    dtype: DType,
) -> Result<Tensor> {
    let (b, c, h, w) = image.dims4()?;
    if (h, w) != (height, width) {
        return Err(DenoiseError::shape("control image", &[b, c, height, width], image.dims()));
    }
    let effective = prompt_batch * num_images_per_prompt;
    let image = if b == 1 {
        image.repeat((effective, 1, 1, 1))?
    } else if b == prompt_batch {
        repeat_interleave_batch(image, num_images_per_prompt)?
    } else {
        return Err(DenoiseError::shape(
            "control image batch",
            &[prompt_batch],
            &[b],
        ));
    };

    let image = if do_classifier_free_guidance && !guess_mode {
        Tensor::cat(&[&image, &image], 0)?
    } else {
        image
    };
    Ok(image.to_dtype(dtype)?)
}

/// Build the control conditioning for a schedule of `num_steps`
pub fn prepare_control(
    image: Tensor,
    num_steps: usize,
    guidance_start: f64,
    guidance_end: f64,
) -> ControlConditioning {
    ControlConditioning {
        image,
        keep: control_keep_weights(num_steps, guidance_start, guidance_end),
    }
}

// =============================================================================
// Inpainting mask
// =============================================================================

/// Mask and masked-image latents for the nine-channel denoiser input
#[derive(Debug, Clone)]
pub struct MaskConditioning {
    /// `(batch', 1, h, w)` binary mask at latent resolution, 1 = repaint
    pub mask: Tensor,
    /// `(batch', latent_channels, h, w)` latents of the image with the masked region removed
    pub masked_image_latents: Tensor,
}

/// Binarise the mask and blank the masked region of the reference image.
///
/// `image` is `(b, 3, H, W)` in [-1, 1], `mask` is `(b | 1, 1, H, W)` in [0, 1].
pub fn prepare_mask_and_masked_image(image: &Tensor, mask: &Tensor) -> Result<(Tensor, Tensor)> {
    let (_b, _c, h, w) = image.dims4()?;
    let (mb, mc, mh, mw) = mask.dims4()?;
    if mc != 1 || (mh, mw) != (h, w) {
        return Err(DenoiseError::shape("mask image", &[mb, 1, h, w], mask.dims()));
    }

    let dtype = image.dtype();
    let mask = mask.to_dtype(DType::F32)?.ge(0.5)?.to_dtype(dtype)?;
    let keep = mask.affine(-1.0, 1.0)?;
    let masked_image = image.broadcast_mul(&keep)?;
    Ok((mask, masked_image))
}

fn repeat_to_batch(x: &Tensor, batch: usize, what: &'static str) -> Result<Tensor> {
    let b = x.dim(0)?;
    if b == batch {
        return Ok(x.clone());
    }
    if b == 0 || !batch.is_multiple_of(b) {
        return Err(DenoiseError::shape(what, &[batch], &[b]));
    }
    Ok(x.repeat((batch / b, 1, 1, 1))?)
}

/// Resize the mask to the latent grid, encode the masked image, and expand
/// both to the effective batch (doubled for CFG).
#[allow(clippy::too_many_arguments)]
pub fn prepare_mask_latents(
    codec: &mut dyn Codec,
    mask: &Tensor,
    masked_image: &Tensor,
    batch_size: usize,
    latent_height: usize,
    latent_width: usize,
    latent_scaling_factor: f64,
    do_classifier_free_guidance: bool,
    generator: &mut Pcg32,
    dtype: DType,
) -> Result<MaskConditioning> {
    let mask = mask
        .to_dtype(DType::F32)?
        .interpolate2d(latent_height, latent_width)?
        .to_dtype(dtype)?;
    let masked_image_latents =
        (codec.encode(masked_image, generator)? * latent_scaling_factor)?.to_dtype(dtype)?;

    let mask = repeat_to_batch(&mask, batch_size, "mask batch")?;
    let masked_image_latents =
        repeat_to_batch(&masked_image_latents, batch_size, "masked image batch")?;

    let (mask, masked_image_latents) = if do_classifier_free_guidance {
        (
            Tensor::cat(&[&mask, &mask], 0)?,
            Tensor::cat(&[&masked_image_latents, &masked_image_latents], 0)?,
        )
    } else {
        (mask, masked_image_latents)
    };

    Ok(MaskConditioning {
        mask,
        masked_image_latents,
    })
}

// =============================================================================
// Bundle
// =============================================================================

/// All conditioning of one invocation.
///
/// `embeddings` carries the unconditional half first when CFG is on; every
/// tensor here agrees with the denoiser batch.
#[derive(Debug, Clone)]
pub struct ConditioningBundle {
    pub embeddings: Tensor,
    /// Conditional-only batch (`prompts * images_per_prompt`)
    pub batch_size: usize,
    pub control: Option<ControlConditioning>,
    pub mask: Option<MaskConditioning>,
}

impl ConditioningBundle {
    /// Unconditional half of the embeddings, or the sole embeddings without CFG
    pub fn uncond_embeddings(&self, do_cfg: bool) -> candle_core::Result<Tensor> {
        if do_cfg {
            self.embeddings.narrow(0, 0, self.batch_size)
        } else {
            Ok(self.embeddings.clone())
        }
    }

    /// Conditional half of the embeddings
    pub fn cond_embeddings(&self, do_cfg: bool) -> candle_core::Result<Tensor> {
        if do_cfg {
            self.embeddings.narrow(0, self.batch_size, self.batch_size)
        } else {
            Ok(self.embeddings.clone())
        }
    }

    /// Checks every member against the denoiser batch and the latent grid
    pub fn validate(&self, do_cfg: bool, latent_hw: (usize, usize)) -> Result<()> {
        let model_batch = if do_cfg { 2 * self.batch_size } else { self.batch_size };
        let eb = self.embeddings.dim(0)?;
        if eb != model_batch {
            return Err(DenoiseError::shape("embeddings batch", &[model_batch], &[eb]));
        }
        if let Some(mask) = &self.mask {
            let (b, _c, h, w) = mask.mask.dims4()?;
            if b != model_batch || (h, w) != latent_hw {
                return Err(DenoiseError::shape(
                    "mask latents",
                    &[model_batch, 1, latent_hw.0, latent_hw.1],
                    mask.mask.dims(),
                ));
            }
            let (lb, _lc, lh, lw) = mask.masked_image_latents.dims4()?;
            if lb != model_batch || (lh, lw) != latent_hw {
                return Err(DenoiseError::shape(
                    "masked image latents",
                    &[model_batch, latent_hw.0, latent_hw.1],
                    &[lb, lh, lw],
                ));
            }
        }
        Ok(())
    }
}
