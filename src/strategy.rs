//! Step Strategy
//!
//! The two ways of driving the denoising loop, resolved once per invocation:
//!
//! ```text
//! DiscreteStep:     orchestrator loop ─► do_denoise(x, ctx, call, transition) ─► scheduler.step
//! ExternalSampler:  sampler loop      ─► do_denoise(x, ctx, call, transition) ─► (identity)
//! ```
//!
//! Both variants hand the same per-step function a [`ModelCall`] primitive
//! (how to invoke the denoiser at this noise level) and a [`Transition`]
//! (what turns a guided prediction into the value the loop carries forward).
//! The per-step guidance and mask logic therefore never inspects which
//! variant is running.

use candle_core::Tensor;
use tracing::{debug, info};

use crate::config::{SchedulerConfig, SchedulerKind};
use crate::error::Result;
use crate::pipeline::{ControlResiduals, Denoiser, DenoiserOutput};
use crate::sampler::{ExternalSampler, KarrasEulerSampler};
use crate::schedule::Schedule;
use crate::scheduler::{DdimScheduler, DiscreteScheduler, EulerDiscreteScheduler, Scheduler, StepExtras};
use crate::utils::Pcg32;

/// Position of one step inside the visited schedule
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepContext {
    pub index: usize,
    pub timestep: f64,
    /// Timestep of the following step, `None` on the final step
    pub next_timestep: Option<f64>,
    pub num_steps: usize,
}

impl StepContext {
    pub fn new(schedule: &[f64], index: usize) -> Self {
        Self {
            index,
            timestep: schedule[index],
            next_timestep: schedule.get(index + 1).copied(),
            num_steps: schedule.len(),
        }
    }

    pub fn is_last(&self) -> bool {
        self.next_timestep.is_none()
    }
}

/// Low-level "invoke the denoiser with this conditioning" primitive
pub trait ModelCall {
    fn call(
        &mut self,
        latent_input: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
        control: Option<&ControlResiduals>,
        capture_attention: bool,
    ) -> candle_core::Result<DenoiserOutput>;
}

/// Plain forward through the denoiser, used by the discrete strategy
pub struct DirectCall<'a> {
    pub denoiser: &'a mut dyn Denoiser,
}

impl ModelCall for DirectCall<'_> {
    fn call(
        &mut self,
        latent_input: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
        control: Option<&ControlResiduals>,
        capture_attention: bool,
    ) -> candle_core::Result<DenoiserOutput> {
        self.denoiser.forward(
            latent_input,
            timestep,
            encoder_hidden_states,
            control,
            capture_attention,
        )
    }
}

/// Turns the guided prediction of one step into the loop's next value
pub trait Transition {
    /// Noise-space operations of the running strategy
    fn scheduler(&self) -> &dyn Scheduler;

    fn advance(
        &mut self,
        guided: &Tensor,
        ctx: &StepContext,
        latents: &Tensor,
    ) -> candle_core::Result<Tensor>;

    /// Noise level of [`Self::advance`]'s output; `None` means a clean estimate
    fn output_timestep(&self, ctx: &StepContext) -> Option<f64>;
}

/// Discrete scheduler step, output sits at the next timestep
pub struct SchedulerTransition<'a, 'g> {
    pub scheduler: &'a mut dyn DiscreteScheduler,
    pub extras: StepExtras<'g>,
}

impl Transition for SchedulerTransition<'_, '_> {
    fn scheduler(&self) -> &dyn Scheduler {
        &*self.scheduler
    }

    fn advance(
        &mut self,
        guided: &Tensor,
        ctx: &StepContext,
        latents: &Tensor,
    ) -> candle_core::Result<Tensor> {
        Ok(self
            .scheduler
            .step(guided, ctx.timestep, latents, &mut self.extras)?
            .prev_sample)
    }

    fn output_timestep(&self, ctx: &StepContext) -> Option<f64> {
        ctx.next_timestep
    }
}

/// External samplers consume the guided prediction itself
pub struct PassThrough<'a> {
    pub scheduler: &'a dyn Scheduler,
}

impl Transition for PassThrough<'_> {
    fn scheduler(&self) -> &dyn Scheduler {
        self.scheduler
    }

    fn advance(
        &mut self,
        guided: &Tensor,
        _ctx: &StepContext,
        _latents: &Tensor,
    ) -> candle_core::Result<Tensor> {
        Ok(guided.clone())
    }

    fn output_timestep(&self, _ctx: &StepContext) -> Option<f64> {
        None
    }
}

/// Per-step denoise function shared by both strategies
pub type ApplyModel<'a> =
    dyn FnMut(&Tensor, &StepContext, &mut dyn ModelCall, &mut dyn Transition) -> Result<Tensor> + 'a;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Cancel,
}

/// How a loop ended
#[derive(Debug)]
pub enum LoopOutcome {
    Finished(Tensor),
    Cancelled { step: usize },
}

/// Progress reporting and cooperative cancellation
///
/// The interval is taken from `GenerationParams::callback_steps` when a
/// generation starts.
pub struct LoopHooks<'a> {
    pub(crate) callback_steps: usize,
    pub progress: Option<&'a mut dyn FnMut(usize, f64, &Tensor)>,
    pub is_cancelled: Option<&'a dyn Fn() -> bool>,
}

impl Default for LoopHooks<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> LoopHooks<'a> {
    pub fn new() -> Self {
        Self {
            callback_steps: 1,
            progress: None,
            is_cancelled: None,
        }
    }

    pub fn with_progress(mut self, progress: &'a mut dyn FnMut(usize, f64, &Tensor)) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_cancellation(mut self, is_cancelled: &'a dyn Fn() -> bool) -> Self {
        self.is_cancelled = Some(is_cancelled);
        self
    }

    /// Called after every step; only acts on multiples of `callback_steps`
    pub fn at_step_boundary(&mut self, ctx: &StepContext, latents: &Tensor) -> LoopControl {
        if !ctx.index.is_multiple_of(self.callback_steps) {
            return LoopControl::Continue;
        }
        if let Some(progress) = self.progress.as_mut() {
            progress(ctx.index, ctx.timestep, latents);
        }
        if self.is_cancelled.is_some_and(|cancelled| cancelled()) {
            info!(step = ctx.index, "Cancellation requested");
            return LoopControl::Cancel;
        }
        LoopControl::Continue
    }
}

/// Tagged stepping strategy
pub enum StepStrategy<'a> {
    DiscreteStep(Box<dyn DiscreteScheduler + 'a>),
    ExternalSampler(Box<dyn ExternalSampler + 'a>),
}

impl StepStrategy<'static> {
    pub fn from_config(config: &SchedulerConfig) -> Result<Self> {
        Ok(match config.kind {
            SchedulerKind::Ddim => Self::DiscreteStep(Box::new(DdimScheduler::new(config.clone())?)),
            SchedulerKind::Euler => {
                Self::DiscreteStep(Box::new(EulerDiscreteScheduler::new(config.clone())?))
            }
            SchedulerKind::KEuler => {
                Self::ExternalSampler(Box::new(KarrasEulerSampler::new(config.clone(), false)?))
            }
            SchedulerKind::KEulerA => {
                Self::ExternalSampler(Box::new(KarrasEulerSampler::new(config.clone(), true)?))
            }
        })
    }
}

impl<'a> StepStrategy<'a> {
    pub fn scheduler(&self) -> &dyn Scheduler {
        match self {
            Self::DiscreteStep(s) => s.as_ref(),
            Self::ExternalSampler(s) => s.as_ref(),
        }
    }

    pub fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        match self {
            Self::DiscreteStep(s) => s.set_timesteps(num_inference_steps),
            Self::ExternalSampler(s) => s.set_timesteps(num_inference_steps),
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, Self::ExternalSampler(_))
    }

    /// Drive the whole schedule.
    ///
    /// The discrete variant owns the loop here; the external variant hands
    /// control to its sampler, which calls `apply_model` once per step.
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &mut self,
        latents: Tensor,
        schedule: &Schedule,
        denoiser: &mut dyn Denoiser,
        eta: f64,
        generator: &mut Pcg32,
        hooks: &mut LoopHooks<'_>,
        apply_model: &mut ApplyModel<'_>,
    ) -> Result<LoopOutcome> {
        match self {
            Self::DiscreteStep(scheduler) => {
                let mut latents = latents;
                for index in 0..schedule.len() {
                    let ctx = StepContext::new(&schedule.timesteps, index);
                    debug!(step = index, timestep = ctx.timestep, "Discrete step");

                    let mut call = DirectCall {
                        denoiser: &mut *denoiser,
                    };
                    let mut transition = SchedulerTransition {
                        scheduler: scheduler.as_mut(),
                        extras: StepExtras {
                            eta,
                            generator: &mut *generator,
                        },
                    };
                    latents = apply_model(&latents, &ctx, &mut call, &mut transition)?;

                    if hooks.at_step_boundary(&ctx, &latents) == LoopControl::Cancel {
                        return Ok(LoopOutcome::Cancelled { step: index });
                    }
                }
                Ok(LoopOutcome::Finished(latents))
            }
            Self::ExternalSampler(sampler) => sampler.sample(
                latents,
                &schedule.timesteps,
                denoiser,
                generator,
                hooks,
                apply_model,
            ),
        }
    }
}
