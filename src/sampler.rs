//! External samplers
//!
//! k-diffusion style samplers own the whole timestep loop. They work on
//! variance-exploding latents (`x = x0 + sigma * eps`) and wrap the
//! epsilon-predicting denoiser so the per-step function sees a
//! clean-sample estimate ("denoised") instead of raw noise.

use candle_core::{DType, Tensor};
use tracing::debug;

use crate::config::{PredictionType, SchedulerConfig};
use crate::error::Result;
use crate::pipeline::{ControlResiduals, Denoiser, DenoiserOutput};
use crate::schedule::{NoiseSchedule, spaced_timesteps};
use crate::scheduler::{Scheduler, vp_pred_epsilon};
use crate::strategy::{
    ApplyModel, LoopControl, LoopHooks, LoopOutcome, ModelCall, PassThrough, StepContext,
};
use crate::utils::Pcg32;

/// A sampler that drives the loop itself and calls back once per step
pub trait ExternalSampler: Scheduler {
    /// Run every step of `timesteps` starting from `latents`.
    ///
    /// `apply_model` receives a [`ModelCall`] returning clean-sample
    /// estimates and a pass-through transition. Progress and cancellation
    /// are polled through `hooks` after each step.
    fn sample(
        &self,
        latents: Tensor,
        timesteps: &[f64],
        denoiser: &mut dyn Denoiser,
        generator: &mut Pcg32,
        hooks: &mut LoopHooks<'_>,
        apply_model: &mut ApplyModel<'_>,
    ) -> Result<LoopOutcome>;
}

/// Denoiser wrapper producing `denoised = x - sigma * eps`.
///
/// The latent part of the input arrives already scaled by `c_in = 1 / sqrt(sigma^2 + 1)`;
/// any extra channels (inpainting mask, masked latents) pass through untouched.
pub struct SigmaScaledCall<'a> {
    pub denoiser: &'a mut dyn Denoiser,
    pub sigma: f64,
    pub alpha_prod: f64,
    pub prediction_type: PredictionType,
}

impl ModelCall for SigmaScaledCall<'_> {
    fn call(
        &mut self,
        latent_input: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
        control: Option<&ControlResiduals>,
        capture_attention: bool,
    ) -> candle_core::Result<DenoiserOutput> {
        let out = self.denoiser.forward(
            latent_input,
            timestep,
            encoder_hidden_states,
            control,
            capture_attention,
        )?;

        let channels = out.noise_pred.dim(1)?;
        let scaled = latent_input.narrow(1, 0, channels)?;
        // scaled input is exactly the variance-preserving sample at this timestep
        let eps = vp_pred_epsilon(
            self.prediction_type,
            &scaled,
            &out.noise_pred,
            self.alpha_prod,
        )?;
        let x = scaled.affine((self.sigma.powi(2) + 1.0).sqrt(), 0.0)?;
        let denoised = (x - (eps * self.sigma)?)?;

        Ok(DenoiserOutput {
            noise_pred: denoised,
            attention: out.attention,
        })
    }
}

/// k-diffusion Euler / Euler-ancestral sampler
#[derive(Debug, Clone)]
pub struct KarrasEulerSampler {
    config: SchedulerConfig,
    noise: NoiseSchedule,
    timesteps: Vec<f64>,
    ancestral: bool,
}

impl KarrasEulerSampler {
    pub fn new(config: SchedulerConfig, ancestral: bool) -> Result<Self> {
        let noise = NoiseSchedule::new(&config)?;
        Ok(Self {
            config,
            noise,
            timesteps: Vec::new(),
            ancestral,
        })
    }

    /// Split a step to `sigma_next` into a deterministic part and fresh noise
    fn ancestral_sigmas(sigma: f64, sigma_next: f64) -> (f64, f64) {
        if sigma_next <= 0.0 {
            return (0.0, 0.0);
        }
        let up = (sigma_next.powi(2) * (sigma.powi(2) - sigma_next.powi(2)) / sigma.powi(2))
            .max(0.0)
            .sqrt()
            .min(sigma_next);
        let down = (sigma_next.powi(2) - up.powi(2)).max(0.0).sqrt();
        (down, up)
    }
}

impl Scheduler for KarrasEulerSampler {
    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        self.timesteps = spaced_timesteps(&self.config, num_inference_steps)?;
        Ok(())
    }

    fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    fn noise_schedule(&self) -> &NoiseSchedule {
        &self.noise
    }

    fn prediction_type(&self) -> PredictionType {
        self.config.prediction_type
    }

    fn init_noise_sigma(&self) -> f64 {
        self.timesteps
            .first()
            .map(|&t| self.noise.sigma(t))
            .unwrap_or(1.0)
    }

    fn scale_model_input(&self, sample: &Tensor, timestep: f64) -> candle_core::Result<Tensor> {
        let sigma = self.noise.sigma(timestep);
        sample.affine(1.0 / (sigma.powi(2) + 1.0).sqrt(), 0.0)
    }

    fn add_noise(
        &self,
        original: &Tensor,
        noise: &Tensor,
        timestep: f64,
    ) -> candle_core::Result<Tensor> {
        original.broadcast_add(&noise.affine(self.noise.sigma(timestep), 0.0)?)
    }

    /// Model outputs seen by the per-step function are already clean estimates
    fn pred_x0(
        &self,
        _sample: &Tensor,
        model_output: &Tensor,
        _timestep: f64,
    ) -> candle_core::Result<Tensor> {
        Ok(model_output.clone())
    }

    fn pred_epsilon(
        &self,
        sample: &Tensor,
        model_output: &Tensor,
        timestep: f64,
    ) -> candle_core::Result<Tensor> {
        let sigma = self.noise.sigma(timestep).max(1e-8);
        (sample - model_output)? * (1.0 / sigma)
    }
}

impl ExternalSampler for KarrasEulerSampler {
    fn sample(
        &self,
        latents: Tensor,
        timesteps: &[f64],
        denoiser: &mut dyn Denoiser,
        generator: &mut Pcg32,
        hooks: &mut LoopHooks<'_>,
        apply_model: &mut ApplyModel<'_>,
    ) -> Result<LoopOutcome> {
        let mut x = latents;
        for index in 0..timesteps.len() {
            let ctx = StepContext::new(timesteps, index);
            let sigma = self.noise.sigma(ctx.timestep);
            let sigma_next = ctx
                .next_timestep
                .map(|t| self.noise.sigma(t))
                .unwrap_or(0.0);
            debug!(step = index, sigma, sigma_next, "External sampler step");

            let denoised = {
                let mut call = SigmaScaledCall {
                    denoiser: &mut *denoiser,
                    sigma,
                    alpha_prod: self.noise.alpha_prod(ctx.timestep),
                    prediction_type: self.config.prediction_type,
                };
                let mut transition = PassThrough { scheduler: self };
                apply_model(&x, &ctx, &mut call, &mut transition)?
            };

            let dtype = x.dtype();
            let x32 = x.to_dtype(DType::F32)?;
            let derivative = ((&x32 - denoised.to_dtype(DType::F32)?)? * (1.0 / sigma))?;
            x = if self.ancestral {
                let (sigma_down, sigma_up) = Self::ancestral_sigmas(sigma, sigma_next);
                let stepped = (&x32 + (derivative * (sigma_down - sigma))?)?;
                if sigma_next > 0.0 {
                    let fresh = generator.randn_like(&stepped)?;
                    (stepped + (fresh * sigma_up)?)?
                } else {
                    stepped
                }
            } else {
                (&x32 + (derivative * (sigma_next - sigma))?)?
            }
            .to_dtype(dtype)?;

            if hooks.at_step_boundary(&ctx, &x) == LoopControl::Cancel {
                return Ok(LoopOutcome::Cancelled { step: index });
            }
        }
        Ok(LoopOutcome::Finished(x))
    }
}
