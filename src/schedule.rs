//! Schedule Builder
//!
//! Two pieces live here:
//! - [`NoiseSchedule`]: the training-time beta / alpha-cumprod tables every
//!   scheduler and sampler reads noise levels from.
//! - [`get_timesteps`]: turns a requested step count and `strength` into the
//!   (possibly shortened) sequence of timesteps the loop actually visits.
//!
//! Strength mapping: `effective = min(round(steps * strength), steps)` and the
//! loop starts at `offset = steps - effective` in the full schedule. Runs that
//! start from pure noise ignore strength and visit the full schedule.

use tracing::debug;

use crate::config::{BetaSchedule, SchedulerConfig, TimestepSpacing};
use crate::error::{DenoiseError, Result};

// =============================================================================
// Noise levels
// =============================================================================

/// Cumulative alpha table of the diffusion forward process
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    alphas_cumprod: Vec<f64>,
}

impl NoiseSchedule {
    pub fn new(config: &SchedulerConfig) -> Result<Self> {
        let n = config.num_train_timesteps;
        if n < 2 {
            return Err(DenoiseError::invalid(format!(
                "num_train_timesteps must be at least 2, got {n}"
            )));
        }

        let betas: Vec<f64> = match config.beta_schedule {
            BetaSchedule::ScaledLinear => {
                linspace(config.beta_start.sqrt(), config.beta_end.sqrt(), n)
                    .into_iter()
                    .map(|b| b * b)
                    .collect()
            }
            BetaSchedule::Linear => linspace(config.beta_start, config.beta_end, n),
        };

        let mut alphas_cumprod = Vec::with_capacity(n);
        let mut cumprod = 1.0;
        for beta in betas {
            cumprod *= 1.0 - beta;
            alphas_cumprod.push(cumprod);
        }

        Ok(Self { alphas_cumprod })
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    /// `alphas_cumprod[t]` for an integer-valued timestep, clamped to the table
    pub fn alpha_prod(&self, timestep: f64) -> f64 {
        let idx = (timestep.max(0.0).round() as usize).min(self.alphas_cumprod.len() - 1);
        self.alphas_cumprod[idx]
    }

    /// Variance-exploding noise level `sqrt((1 - a) / a)` at `timestep`
    pub fn sigma(&self, timestep: f64) -> f64 {
        let a = self.alpha_prod(timestep);
        ((1.0 - a) / a).sqrt()
    }
}

/// Evenly spaced values from `start` to `end` inclusive
pub fn linspace(start: f64, end: f64, steps: usize) -> Vec<f64> {
    if steps == 0 {
        return vec![];
    }
    if steps == 1 {
        return vec![start];
    }
    let denom = (steps - 1) as f64;
    (0..steps)
        .map(|i| start + (end - start) * (i as f64) / denom)
        .collect()
}

/// Full inference schedule for `num_inference_steps`, highest noise first.
pub fn spaced_timesteps(config: &SchedulerConfig, num_inference_steps: usize) -> Result<Vec<f64>> {
    if num_inference_steps == 0 {
        return Err(DenoiseError::invalid(
            "`num_inference_steps` has to be a positive integer but is 0",
        ));
    }
    let train = config.num_train_timesteps;
    if num_inference_steps > train {
        return Err(DenoiseError::invalid(format!(
            "`num_inference_steps` ({num_inference_steps}) cannot exceed num_train_timesteps ({train})"
        )));
    }

    let timesteps = match config.timestep_spacing {
        TimestepSpacing::Leading => {
            let step_ratio = train / num_inference_steps;
            (0..num_inference_steps)
                .rev()
                .map(|i| ((i * step_ratio + config.steps_offset).min(train - 1)) as f64)
                .collect()
        }
        TimestepSpacing::Trailing => {
            let step_ratio = train as f64 / num_inference_steps as f64;
            (0..num_inference_steps)
                .map(|i| ((train as f64 - i as f64 * step_ratio).round() - 1.0).max(0.0))
                .collect()
        }
        TimestepSpacing::Linspace => linspace(0.0, (train - 1) as f64, num_inference_steps)
            .into_iter()
            .rev()
            .map(f64::round)
            .collect(),
    };
    Ok(timesteps)
}

// =============================================================================
// Strength-adjusted schedule
// =============================================================================

/// Timesteps one invocation visits, built once and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    /// Visited timesteps, strictly decreasing noise level
    pub timesteps: Vec<f64>,
    /// Effective step count (`timesteps.len()`)
    pub num_inference_steps: usize,
    /// Index into the full schedule where the loop starts
    pub offset: usize,
}

impl Schedule {
    pub fn len(&self) -> usize {
        self.timesteps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timesteps.is_empty()
    }

    /// First visited timestep, the noise level of the initial latent
    pub fn first(&self) -> Option<f64> {
        self.timesteps.first().copied()
    }
}

/// Effective step count for a strength, `min(round(steps * strength), steps)`
pub fn effective_steps(num_inference_steps: usize, strength: f64) -> usize {
    let scaled = (num_inference_steps as f64 * strength.clamp(0.0, 1.0)).round() as usize;
    scaled.min(num_inference_steps)
}

/// Slice the full schedule according to `strength`.
///
/// `full_timesteps` is the scheduler's schedule for `num_inference_steps`.
/// When `start_from_noise` is set strength is ignored.
pub fn get_timesteps(
    full_timesteps: &[f64],
    num_inference_steps: usize,
    strength: f64,
    start_from_noise: bool,
) -> Result<Schedule> {
    if num_inference_steps == 0 {
        return Err(DenoiseError::invalid(
            "`num_inference_steps` has to be a positive integer but is 0",
        ));
    }
    if !(0.0..=1.0).contains(&strength) {
        return Err(DenoiseError::invalid(format!(
            "The value of strength should in [0.0, 1.0] but is {strength}"
        )));
    }
    if full_timesteps.len() != num_inference_steps {
        return Err(DenoiseError::shape(
            "timesteps",
            &[num_inference_steps],
            &[full_timesteps.len()],
        ));
    }

    let effective = if start_from_noise {
        num_inference_steps
    } else {
        effective_steps(num_inference_steps, strength)
    };
    let offset = num_inference_steps - effective;
    let timesteps = full_timesteps[offset..].to_vec();

    debug!(
        requested = num_inference_steps,
        effective, offset, start_from_noise, "Resolved schedule"
    );

    Ok(Schedule {
        timesteps,
        num_inference_steps: effective,
        offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full(n: usize) -> Vec<f64> {
        spaced_timesteps(&SchedulerConfig::default(), n).unwrap()
    }

    #[test]
    fn test_leading_spacing_matches_stable_diffusion() {
        let ts = full(50);
        assert_eq!(ts.len(), 50);
        assert_eq!(ts[0], 981.0);
        assert_eq!(ts[49], 1.0);
        assert!(ts.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_trailing_and_linspace_spacing() {
        let mut config = SchedulerConfig {
            timestep_spacing: TimestepSpacing::Trailing,
            ..Default::default()
        };
        let ts = spaced_timesteps(&config, 10).unwrap();
        assert_eq!(ts[0], 999.0);
        assert_eq!(ts[9], 99.0);

        config.timestep_spacing = TimestepSpacing::Linspace;
        let ts = spaced_timesteps(&config, 10).unwrap();
        assert_eq!(ts[0], 999.0);
        assert_eq!(ts[9], 0.0);
    }

    #[test]
    fn test_strength_scenario_50_at_08() {
        let schedule = get_timesteps(&full(50), 50, 0.8, false).unwrap();
        assert_eq!(schedule.num_inference_steps, 40);
        assert_eq!(schedule.offset, 10);
        assert_eq!(schedule.timesteps[0], full(50)[10]);
    }

    #[test]
    fn test_start_from_noise_ignores_strength() {
        let schedule = get_timesteps(&full(20), 20, 0.3, true).unwrap();
        assert_eq!(schedule.len(), 20);
        assert_eq!(schedule.offset, 0);
    }

    #[test]
    fn test_strength_zero_is_empty() {
        let schedule = get_timesteps(&full(20), 20, 0.0, false).unwrap();
        assert!(schedule.is_empty());
        assert_eq!(schedule.first(), None);
    }

    #[test]
    fn test_zero_steps_rejected() {
        assert!(matches!(
            get_timesteps(&[], 0, 1.0, false),
            Err(DenoiseError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_alphas_cumprod_decreasing_and_sigma_increasing() {
        let ns = NoiseSchedule::new(&SchedulerConfig::default()).unwrap();
        assert_eq!(ns.num_train_timesteps(), 1000);
        assert!(ns.alphas_cumprod().windows(2).all(|w| w[0] > w[1]));
        assert!(ns.sigma(500.0) < ns.sigma(981.0));
    }
}
