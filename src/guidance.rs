//! Guidance Combiner
//!
//! Per-step corrections applied to the raw denoiser output:
//! - **CFG**: `uncond + scale * (cond - uncond)` over a batch laid out `[uncond, cond]`
//! - **Structural control**: residual zero-padding for guess mode
//! - **Self-attention guidance (SAG)**: blur the regions the denoiser attends
//!   to, re-noise, and push the prediction away from what the denoiser makes
//!   of the degraded latent

use candle_core::{DType, Device, Result, Tensor};

use crate::config::SagConfig;
use crate::pipeline::{AttentionCapture, ControlResiduals};
use crate::scheduler::Scheduler;

// =============================================================================
// Guidance parameters
// =============================================================================

/// Guidance settings, fixed for one invocation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuidanceConfig {
    pub guidance_scale: f64,
    pub self_attention_scale: f64,
    pub controlnet_conditioning_scale: f64,
    pub guess_mode: bool,
}

impl GuidanceConfig {
    pub fn do_classifier_free_guidance(&self) -> bool {
        self.guidance_scale > 1.0
    }

    pub fn do_self_attention_guidance(&self) -> bool {
        self.self_attention_scale > 0.0
    }
}

// =============================================================================
// Classifier-free guidance
// =============================================================================

/// Split a doubled batch into `(uncond, cond)` halves
pub fn split_cfg_batch(x: &Tensor) -> Result<(Tensor, Tensor)> {
    let b = x.dim(0)?;
    if b % 2 != 0 {
        candle_core::bail!("CFG batch must be even, got {b}");
    }
    let half = b / 2;
    Ok((x.narrow(0, 0, half)?, x.narrow(0, half, half)?))
}

/// `uncond + scale * (cond - uncond)`, also returning the uncond half for SAG
pub fn apply_cfg(noise_pred: &Tensor, guidance_scale: f64) -> Result<(Tensor, Tensor)> {
    let (uncond, cond) = split_cfg_batch(noise_pred)?;
    let diff = (&cond - &uncond)?;
    let guided = (&uncond + diff.affine(guidance_scale, 0.0)?)?;
    Ok((guided, uncond))
}

// =============================================================================
// Structural control
// =============================================================================

/// Prefix zero residuals for the unconditional half so adding them leaves it unchanged
pub fn pad_uncond_residuals(residuals: ControlResiduals) -> Result<ControlResiduals> {
    let pad = |d: &Tensor| -> Result<Tensor> { Tensor::cat(&[&d.zeros_like()?, d], 0) };
    let down_blocks = residuals
        .down_blocks
        .iter()
        .map(pad)
        .collect::<Result<Vec<_>>>()?;
    let mid_block = pad(&residuals.mid_block)?;
    Ok(ControlResiduals {
        down_blocks,
        mid_block,
    })
}

/// Per-step control keep weight: 1 inside `[start, end]` of the schedule, 0 outside
pub fn control_keep_weights(num_steps: usize, start: f64, end: f64) -> Vec<f64> {
    (0..num_steps)
        .map(|i| {
            let lo = i as f64 / num_steps as f64;
            let hi = (i + 1) as f64 / num_steps as f64;
            if lo < start || hi > end { 0.0 } else { 1.0 }
        })
        .collect()
}

// =============================================================================
// Self-attention guidance
// =============================================================================

/// Normalised 2D gaussian kernel, `(k, k)`
pub fn gaussian_kernel_2d(kernel_size: usize, sigma: f64, device: &Device) -> Result<Tensor> {
    let half = (kernel_size as f64 - 1.0) * 0.5;
    let pdf: Vec<f64> = (0..kernel_size)
        .map(|i| {
            let x = -half + i as f64;
            (-0.5 * (x / sigma).powi(2)).exp()
        })
        .collect();
    let total: f64 = pdf.iter().sum();
    let k1: Vec<f32> = pdf.iter().map(|v| (v / total) as f32).collect();
    let k1 = Tensor::from_vec(k1, kernel_size, device)?;
    k1.unsqueeze(1)?.matmul(&k1.unsqueeze(0)?)
}

fn reflect_indices(size: usize, pad: usize) -> Vec<u32> {
    let mut idx = Vec::with_capacity(size + 2 * pad);
    for p in (1..=pad).rev() {
        idx.push(p as u32);
    }
    idx.extend((0..size).map(|i| i as u32));
    for p in 1..=pad {
        idx.push((size - 1 - p) as u32);
    }
    idx
}

/// Reflect-pad the last two dims of a 4D tensor by `pad` on every side
pub fn reflect_pad_2d(x: &Tensor, pad: usize) -> Result<Tensor> {
    let (_b, _c, h, w) = x.dims4()?;
    if pad >= h || pad >= w {
        candle_core::bail!("reflect padding {pad} needs spatial size > {pad}, got {h}x{w}");
    }
    let device = x.device();
    let rows = Tensor::new(reflect_indices(h, pad).as_slice(), device)?;
    let cols = Tensor::new(reflect_indices(w, pad).as_slice(), device)?;
    x.index_select(&rows, 2)?.index_select(&cols, 3)
}

/// Depthwise gaussian blur with reflect padding, shape-preserving
pub fn gaussian_blur_2d(img: &Tensor, kernel_size: usize, sigma: f64) -> Result<Tensor> {
    let (_b, c, _h, _w) = img.dims4()?;
    let dtype = img.dtype();
    let kernel = gaussian_kernel_2d(kernel_size, sigma, img.device())?
        .reshape((1, 1, kernel_size, kernel_size))?
        .repeat((c, 1, 1, 1))?
        .to_dtype(DType::F32)?;
    let padded = reflect_pad_2d(&img.to_dtype(DType::F32)?, kernel_size / 2)?;
    padded.conv2d(&kernel, 0, 1, 1, c)?.to_dtype(dtype)
}

/// Binary salience mask `(b, channels, latent_h, latent_w)` from captured attention.
///
/// Attention `(b * heads, hw, hw)` is averaged over heads and summed over
/// queries; keys collecting more than `threshold` are salient.
pub fn sag_attention_mask(
    attention: &AttentionCapture,
    batch: usize,
    channels: usize,
    latent_h: usize,
    latent_w: usize,
    threshold: f64,
) -> Result<Tensor> {
    let (bh, hw1, hw2) = attention.probs.dims3()?;
    let heads = attention.heads;
    if heads == 0 || bh != batch * heads {
        candle_core::bail!(
            "attention batch {bh} does not match batch {batch} x heads {heads}"
        );
    }
    let (map_h, map_w) = attention.map_size;
    if map_h * map_w != hw2 {
        candle_core::bail!("attention map size {map_h}x{map_w} does not cover {hw2} keys");
    }

    let probs = attention
        .probs
        .to_dtype(DType::F32)?
        .reshape((batch, heads, hw1, hw2))?;
    let salience = probs.mean(1)?.sum(1)?;
    let threshold = Tensor::new(&[threshold as f32], probs.device())?;
    let mask = salience.broadcast_gt(&threshold)?.to_dtype(DType::F32)?;

    mask.reshape((batch, 1, map_h, map_w))?
        .repeat((1, channels, 1, 1))?
        .interpolate2d(latent_h, latent_w)
}

/// Degraded latent for SAG: blur salient regions of `original_latents` and
/// re-noise the result with `eps` at `timestep`.
pub fn sag_masking(
    scheduler: &dyn Scheduler,
    original_latents: &Tensor,
    attention: &AttentionCapture,
    timestep: f64,
    eps: &Tensor,
    config: &SagConfig,
) -> Result<Tensor> {
    let (b, c, h, w) = original_latents.dims4()?;
    let dtype = original_latents.dtype();
    let mask = sag_attention_mask(attention, b, c, h, w, config.mask_threshold)?.to_dtype(dtype)?;

    let blurred = gaussian_blur_2d(original_latents, config.blur_kernel_size, config.blur_sigma)?;
    let keep = mask.affine(-1.0, 1.0)?;
    let degraded = ((blurred * &mask)? + (original_latents * keep)?)?;

    scheduler.add_noise(&degraded, eps, timestep)
}
