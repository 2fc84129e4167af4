//! Mask Compositor
//!
//! Used with a mask and a plain four-channel denoiser. After every step the
//! known region is reset to the reference latent, re-noised to the level of
//! the step output, so only the masked region evolves:
//!
//! ```text
//! x = (1 - mask) * add_noise(reference, noise, t_out) + mask * x
//! ```

use candle_core::{Result, Tensor};

use crate::scheduler::Scheduler;

/// Zero-pad a `(b, c, h, w)` mask on the bottom/right to a multiple of `align`,
/// then pad or crop to exactly `target`.
pub fn pad_to_alignment(mask: &Tensor, align: usize, target: (usize, usize)) -> Result<Tensor> {
    let (_b, _c, h, w) = mask.dims4()?;
    let align = align.max(1);
    let aligned_h = h.div_ceil(align) * align;
    let aligned_w = w.div_ceil(align) * align;
    let out_h = aligned_h.max(target.0);
    let out_w = aligned_w.max(target.1);

    let padded = if out_h > h || out_w > w {
        mask.pad_with_zeros(2, 0, out_h - h)?
            .pad_with_zeros(3, 0, out_w - w)?
    } else {
        mask.clone()
    };
    padded.narrow(2, 0, target.0)?.narrow(3, 0, target.1)
}

/// Known-region state for one invocation
#[derive(Debug, Clone)]
pub struct MaskCompositor {
    /// Clean reference latents of the first image, `(1, c, h, w)`
    init_latents: Tensor,
    /// Binary mask of the first image at latent resolution, `(1, 1, h, w)`
    mask: Tensor,
    noise: Tensor,
}

impl MaskCompositor {
    /// `image_latents` and `mask` may carry a batch; only the first entry is kept
    /// and broadcast over the working batch.
    pub fn new(image_latents: &Tensor, mask: &Tensor, noise: Tensor) -> Result<Self> {
        let (_b, _c, h, w) = image_latents.dims4()?;
        let init_latents = image_latents.narrow(0, 0, 1)?;
        let mask = pad_to_alignment(&mask.narrow(0, 0, 1)?, 8, (h, w))?.to_dtype(init_latents.dtype())?;
        Ok(Self {
            init_latents,
            mask,
            noise,
        })
    }

    pub fn mask(&self) -> &Tensor {
        &self.mask
    }

    /// Blend step output `x` with the known region.
    ///
    /// `renoise_at` is the noise level of `x`; `None` keeps the reference clean,
    /// which is the case on the final step and for clean-sample estimates.
    pub fn composite(
        &self,
        x: &Tensor,
        scheduler: &dyn Scheduler,
        renoise_at: Option<f64>,
    ) -> Result<Tensor> {
        let known = match renoise_at {
            Some(t) => scheduler.add_noise(&self.init_latents, &self.noise, t)?,
            None => self.init_latents.clone(),
        };
        let keep = self.mask.affine(-1.0, 1.0)?;
        let known = known.broadcast_mul(&keep)?;
        let edited = x.broadcast_mul(&self.mask)?;
        known.broadcast_add(&edited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::scheduler::DdimScheduler;
    use candle_core::{DType, Device};

    #[test]
    fn test_pad_to_alignment_pads_and_crops() -> Result<()> {
        let mask = Tensor::ones((1, 1, 5, 6), DType::F32, &Device::Cpu)?;
        let padded = pad_to_alignment(&mask, 8, (8, 8))?;
        assert_eq!(padded.dims(), &[1, 1, 8, 8]);
        assert_eq!(padded.sum_all()?.to_scalar::<f32>()?, 30.0);

        let same = pad_to_alignment(&Tensor::ones((1, 1, 8, 8), DType::F32, &Device::Cpu)?, 8, (8, 8))?;
        assert_eq!(same.sum_all()?.to_scalar::<f32>()?, 64.0);
        Ok(())
    }

    #[test]
    fn test_zero_mask_restores_clean_reference_on_last_step() -> Result<()> {
        let device = Device::Cpu;
        let scheduler = DdimScheduler::new(SchedulerConfig::default())
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let reference = Tensor::full(0.25f32, (1, 4, 8, 8), &device)?;
        let mask = Tensor::zeros((1, 1, 8, 8), DType::F32, &device)?;
        let noise = Tensor::ones((2, 4, 8, 8), DType::F32, &device)?;
        let compositor = MaskCompositor::new(&reference, &mask, noise)?;

        let x = Tensor::full(9.0f32, (2, 4, 8, 8), &device)?;
        let out = compositor.composite(&x, &scheduler, None)?;
        assert_eq!(out.dims(), &[2, 4, 8, 8]);
        let max_err = (out - 0.25)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(max_err < 1e-6);
        Ok(())
    }

    #[test]
    fn test_full_mask_passes_step_output_through() -> Result<()> {
        let device = Device::Cpu;
        let scheduler = DdimScheduler::new(SchedulerConfig::default())
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let reference = Tensor::zeros((1, 4, 8, 8), DType::F32, &device)?;
        let mask = Tensor::ones((1, 1, 8, 8), DType::F32, &device)?;
        let noise = Tensor::ones((1, 4, 8, 8), DType::F32, &device)?;
        let compositor = MaskCompositor::new(&reference, &mask, noise)?;

        let x = Tensor::full(3.0f32, (1, 4, 8, 8), &device)?;
        let out = compositor.composite(&x, &scheduler, Some(500.0))?;
        let max_err = (out - 3.0)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(max_err < 1e-6);
        Ok(())
    }
}
