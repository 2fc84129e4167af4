//! Discrete schedulers
//!
//! [`Scheduler`] is the noise-space contract shared by every stepping
//! strategy: how a latent is scaled before the denoiser sees it, how noise is
//! added at a timestep, and how the clean sample and the noise are recovered
//! from a model output. [`DiscreteScheduler`] adds the single-step transition
//! used when the orchestrator owns the loop.
//!
//! Implementations:
//! - [`DdimScheduler`]: DDIM with `eta`-controlled stochasticity, variance-preserving space
//! - [`EulerDiscreteScheduler`]: Euler ODE solver in variance-exploding (sigma) space

use candle_core::{DType, Result, Tensor};

use crate::config::{PredictionType, SchedulerConfig};
use crate::error::Result as EngineResult;
use crate::schedule::{NoiseSchedule, spaced_timesteps};
use crate::utils::Pcg32;

/// Output from a scheduler step
#[derive(Debug)]
pub struct SchedulerOutput {
    /// Latent at the next (lower) noise level
    pub prev_sample: Tensor,
    /// Predicted clean sample, if computed
    pub pred_original_sample: Option<Tensor>,
}

/// Extra per-step parameters, the counterpart of diffusers' `extra_step_kwargs`
pub struct StepExtras<'a> {
    /// Noise-variance coefficient, only DDIM reads it
    pub eta: f64,
    pub generator: &'a mut Pcg32,
}

/// Noise-space operations every stepping strategy provides
pub trait Scheduler {
    /// Rebuild the full schedule for `num_inference_steps`
    fn set_timesteps(&mut self, num_inference_steps: usize) -> EngineResult<()>;

    /// Full schedule from the last `set_timesteps`, highest noise first
    fn timesteps(&self) -> &[f64];

    fn noise_schedule(&self) -> &NoiseSchedule;

    fn prediction_type(&self) -> PredictionType;

    /// Std of the initial latent when starting from pure noise
    fn init_noise_sigma(&self) -> f64;

    fn scale_model_input(&self, sample: &Tensor, timestep: f64) -> Result<Tensor>;

    /// Forward process: noise `original` to the level of `timestep`.
    /// `original` broadcasts against `noise`.
    fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: f64) -> Result<Tensor>;

    /// Clean-sample estimate from a model output
    fn pred_x0(&self, sample: &Tensor, model_output: &Tensor, timestep: f64) -> Result<Tensor>;

    /// Noise estimate from a model output
    fn pred_epsilon(&self, sample: &Tensor, model_output: &Tensor, timestep: f64)
    -> Result<Tensor>;
}

/// A scheduler advanced one timestep per orchestrator iteration
pub trait DiscreteScheduler: Scheduler {
    /// x_t -> x_{t-1}
    fn step(
        &mut self,
        model_output: &Tensor,
        timestep: f64,
        sample: &Tensor,
        extras: &mut StepExtras<'_>,
    ) -> Result<SchedulerOutput>;
}

// =============================================================================
// Variance-preserving parameterisation helpers
// =============================================================================

/// x0 from a model output at cumulative alpha `alpha_prod_t`
pub fn vp_pred_x0(
    prediction_type: PredictionType,
    sample: &Tensor,
    model_output: &Tensor,
    alpha_prod_t: f64,
) -> Result<Tensor> {
    let beta_prod_t = 1.0 - alpha_prod_t;
    match prediction_type {
        PredictionType::Epsilon => {
            (sample - (model_output * beta_prod_t.sqrt())?)? * (1.0 / alpha_prod_t.sqrt())
        }
        PredictionType::Sample => Ok(model_output.clone()),
        PredictionType::VPrediction => {
            (sample * alpha_prod_t.sqrt())? - (model_output * beta_prod_t.sqrt())?
        }
    }
}

/// epsilon from a model output at cumulative alpha `alpha_prod_t`
pub fn vp_pred_epsilon(
    prediction_type: PredictionType,
    sample: &Tensor,
    model_output: &Tensor,
    alpha_prod_t: f64,
) -> Result<Tensor> {
    let beta_prod_t = 1.0 - alpha_prod_t;
    match prediction_type {
        PredictionType::Epsilon => Ok(model_output.clone()),
        PredictionType::Sample => {
            (sample - (model_output * alpha_prod_t.sqrt())?)? * (1.0 / beta_prod_t.sqrt())
        }
        PredictionType::VPrediction => {
            (model_output * alpha_prod_t.sqrt())? + (sample * beta_prod_t.sqrt())?
        }
    }
}

fn vp_add_noise(original: &Tensor, noise: &Tensor, alpha_prod: f64) -> Result<Tensor> {
    let a = original.affine(alpha_prod.sqrt(), 0.0)?;
    let b = noise.affine((1.0 - alpha_prod).sqrt(), 0.0)?;
    a.broadcast_add(&b)
}

// =============================================================================
// DDIM
// =============================================================================

/// Denoising Diffusion Implicit Models scheduler (clip_sample off, set_alpha_to_one off)
#[derive(Debug, Clone)]
pub struct DdimScheduler {
    config: SchedulerConfig,
    noise: NoiseSchedule,
    timesteps: Vec<f64>,
    step_ratio: usize,
}

impl DdimScheduler {
    pub fn new(config: SchedulerConfig) -> EngineResult<Self> {
        let noise = NoiseSchedule::new(&config)?;
        Ok(Self {
            config,
            noise,
            timesteps: Vec::new(),
            step_ratio: 1,
        })
    }
}

impl Scheduler for DdimScheduler {
    fn set_timesteps(&mut self, num_inference_steps: usize) -> EngineResult<()> {
        self.timesteps = spaced_timesteps(&self.config, num_inference_steps)?;
        self.step_ratio = (self.config.num_train_timesteps / num_inference_steps).max(1);
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
        1.0
    }

    fn scale_model_input(&self, sample: &Tensor, _timestep: f64) -> Result<Tensor> {
        Ok(sample.clone())
    }

    fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: f64) -> Result<Tensor> {
        vp_add_noise(original, noise, self.noise.alpha_prod(timestep))
    }

    fn pred_x0(&self, sample: &Tensor, model_output: &Tensor, timestep: f64) -> Result<Tensor> {
        vp_pred_x0(
            self.config.prediction_type,
            sample,
            model_output,
            self.noise.alpha_prod(timestep),
        )
    }

    fn pred_epsilon(
        &self,
        sample: &Tensor,
        model_output: &Tensor,
        timestep: f64,
    ) -> Result<Tensor> {
        vp_pred_epsilon(
            self.config.prediction_type,
            sample,
            model_output,
            self.noise.alpha_prod(timestep),
        )
    }
}

impl DiscreteScheduler for DdimScheduler {
    fn step(
        &mut self,
        model_output: &Tensor,
        timestep: f64,
        sample: &Tensor,
        extras: &mut StepExtras<'_>,
    ) -> Result<SchedulerOutput> {
        let original_dtype = sample.dtype();
        let sample = sample.to_dtype(DType::F32)?;
        let model_output = model_output.to_dtype(DType::F32)?;

        let prev_timestep = timestep - self.step_ratio as f64;
        let alpha_prod_t = self.noise.alpha_prod(timestep);
        // Past the start of the table the first entry stands in for the final alpha
        let alpha_prod_t_prev = self.noise.alpha_prod(prev_timestep.max(0.0));
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_t_prev = 1.0 - alpha_prod_t_prev;

        let pred_original_sample = vp_pred_x0(
            self.config.prediction_type,
            &sample,
            &model_output,
            alpha_prod_t,
        )?;
        let pred_epsilon = vp_pred_epsilon(
            self.config.prediction_type,
            &sample,
            &model_output,
            alpha_prod_t,
        )?;

        let variance = (beta_prod_t_prev / beta_prod_t) * (1.0 - alpha_prod_t / alpha_prod_t_prev);
        let std_dev_t = extras.eta * variance.max(0.0).sqrt();

        let direction = (&pred_epsilon
            * (1.0 - alpha_prod_t_prev - std_dev_t * std_dev_t).max(0.0).sqrt())?;
        let mut prev_sample = ((&pred_original_sample * alpha_prod_t_prev.sqrt())? + direction)?;

        if extras.eta > 0.0 {
            let variance_noise = extras.generator.randn_like(&prev_sample)?;
            prev_sample = (prev_sample + (variance_noise * std_dev_t)?)?;
        }

        Ok(SchedulerOutput {
            prev_sample: prev_sample.to_dtype(original_dtype)?,
            pred_original_sample: Some(pred_original_sample),
        })
    }
}

// =============================================================================
// Euler discrete
// =============================================================================

/// Euler discrete scheduler working on sigma-scaled latents
#[derive(Debug, Clone)]
pub struct EulerDiscreteScheduler {
    config: SchedulerConfig,
    noise: NoiseSchedule,
    timesteps: Vec<f64>,
    /// Per-step sigmas with terminal 0 appended
    sigmas: Vec<f64>,
}

impl EulerDiscreteScheduler {
    pub fn new(config: SchedulerConfig) -> EngineResult<Self> {
        let noise = NoiseSchedule::new(&config)?;
        Ok(Self {
            config,
            noise,
            timesteps: Vec::new(),
            sigmas: vec![0.0],
        })
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    fn step_index(&self, timestep: f64) -> Result<usize> {
        match self
            .timesteps
            .iter()
            .position(|&t| (t - timestep).abs() < 1e-6)
        {
            Some(i) => Ok(i),
            None => candle_core::bail!("timestep {timestep} is not part of the current schedule"),
        }
    }

    fn sigma_at(&self, timestep: f64) -> f64 {
        self.step_index(timestep)
            .map(|i| self.sigmas[i])
            .unwrap_or_else(|_| self.noise.sigma(timestep))
    }
}

impl Scheduler for EulerDiscreteScheduler {
    fn set_timesteps(&mut self, num_inference_steps: usize) -> EngineResult<()> {
        self.timesteps = spaced_timesteps(&self.config, num_inference_steps)?;
        let mut sigmas: Vec<f64> = self
            .timesteps
            .iter()
            .map(|&t| self.noise.sigma(t))
            .collect();
        sigmas.push(0.0);
        self.sigmas = sigmas;
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
        let max_sigma = self.sigmas.first().copied().unwrap_or(0.0);
        // diffusers: linspace/trailing use max_sigma, leading uses (max_sigma^2 + 1)^0.5
        match self.config.timestep_spacing {
            crate::config::TimestepSpacing::Leading => (max_sigma.powi(2) + 1.0).sqrt(),
            _ => max_sigma,
        }
    }

    fn scale_model_input(&self, sample: &Tensor, timestep: f64) -> Result<Tensor> {
        let sigma = self.sigma_at(timestep);
        sample.affine(1.0 / (sigma.powi(2) + 1.0).sqrt(), 0.0)
    }

    fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: f64) -> Result<Tensor> {
        let sigma = self.sigma_at(timestep);
        original.broadcast_add(&noise.affine(sigma, 0.0)?)
    }

    fn pred_x0(&self, sample: &Tensor, model_output: &Tensor, timestep: f64) -> Result<Tensor> {
        let sigma = self.sigma_at(timestep);
        match self.config.prediction_type {
            PredictionType::Epsilon => sample - (model_output * sigma)?,
            PredictionType::Sample => Ok(model_output.clone()),
            PredictionType::VPrediction => {
                let sigma_sq_plus_1 = sigma.powi(2) + 1.0;
                let c_out = -sigma / sigma_sq_plus_1.sqrt();
                let c_skip = 1.0 / sigma_sq_plus_1;
                (model_output * c_out)? + (sample * c_skip)?
            }
        }
    }

    fn pred_epsilon(
        &self,
        sample: &Tensor,
        model_output: &Tensor,
        timestep: f64,
    ) -> Result<Tensor> {
        match self.config.prediction_type {
            PredictionType::Epsilon => Ok(model_output.clone()),
            _ => {
                let sigma = self.sigma_at(timestep).max(1e-8);
                let x0 = self.pred_x0(sample, model_output, timestep)?;
                (sample - x0)? * (1.0 / sigma)
            }
        }
    }
}

impl DiscreteScheduler for EulerDiscreteScheduler {
    fn step(
        &mut self,
        model_output: &Tensor,
        timestep: f64,
        sample: &Tensor,
        _extras: &mut StepExtras<'_>,
    ) -> Result<SchedulerOutput> {
        let idx = self.step_index(timestep)?;
        let sigma = self.sigmas[idx];
        let sigma_next = self.sigmas[idx + 1];

        let original_dtype = sample.dtype();
        let sample = sample.to_dtype(DType::F32)?;
        let model_output = model_output.to_dtype(DType::F32)?;

        let pred_x0 = self.pred_x0(&sample, &model_output, timestep)?;
        // dx/dsigma = (x - x0) / sigma
        let derivative = ((&sample - &pred_x0)? * (1.0 / sigma))?;
        let prev_sample = (&sample + (derivative * (sigma_next - sigma))?)?;

        Ok(SchedulerOutput {
            prev_sample: prev_sample.to_dtype(original_dtype)?,
            pred_original_sample: Some(pred_x0),
        })
    }
}
