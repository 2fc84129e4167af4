//! Latent Initializer
//!
//! Starting latents come from one of two places:
//! - pure noise, `randn * init_noise_sigma` over the full schedule
//! - an encoded reference image, noised to the first visited timestep
//!
//! The image path also hands back the clean reference latents and the raw
//! noise so the mask compositor can re-noise the known region later.

use candle_core::{DType, Device, Tensor};
use tracing::debug;

use crate::error::{DenoiseError, Result};
use crate::pipeline::Codec;
use crate::schedule::Schedule;
use crate::scheduler::Scheduler;
use crate::utils::Pcg32;

/// Output of [`prepare_latents`]
#[derive(Debug, Clone)]
pub struct LatentInit {
    /// Latent the loop starts from
    pub latents: Tensor,
    /// Clean encoded reference, `None` when starting from noise
    pub image_latents: Option<Tensor>,
    /// Noise tensor added to the reference (or the initial noise)
    pub noise: Tensor,
}

/// Requested latent geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatentShape {
    pub batch_size: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl LatentShape {
    pub fn dims(&self) -> [usize; 4] {
        [self.batch_size, self.channels, self.height, self.width]
    }
}

fn check_supplied(latents: &Tensor, shape: &LatentShape) -> Result<()> {
    if latents.dims() != shape.dims() {
        return Err(DenoiseError::shape("latents", &shape.dims(), latents.dims()));
    }
    Ok(())
}

/// Build the starting latent.
///
/// With `image` the reference is encoded, scaled by `latent_scaling_factor`,
/// repeated to the batch and noised to `schedule.first()`. An empty schedule
/// leaves it clean. Supplied `latents` replace the generator draw.
#[allow(clippy::too_many_arguments)]
pub fn prepare_latents(
    scheduler: &dyn Scheduler,
    codec: &mut dyn Codec,
    image: Option<&Tensor>,
    schedule: &Schedule,
    shape: LatentShape,
    vae_scale_factor: usize,
    latent_scaling_factor: f64,
    latents: Option<Tensor>,
    generator: &mut Pcg32,
    device: &Device,
    dtype: DType,
) -> Result<LatentInit> {
    let noise = match latents {
        Some(latents) => {
            check_supplied(&latents, &shape)?;
            latents.to_device(device)?.to_dtype(dtype)?
        }
        None => generator.randn(shape.dims().to_vec(), device)?.to_dtype(dtype)?,
    };

    let Some(image) = image else {
        let latents = (&noise * scheduler.init_noise_sigma())?;
        debug!(shape = ?latents.dims(), sigma = scheduler.init_noise_sigma(), "Latents from noise");
        return Ok(LatentInit {
            latents,
            image_latents: None,
            noise,
        });
    };

    let (ib, _ic, ih, iw) = image.dims4()?;
    let (height, width) = (shape.height * vae_scale_factor, shape.width * vae_scale_factor);
    if (ih, iw) != (height, width) {
        return Err(DenoiseError::shape("reference image", &[ib, 3, height, width], image.dims()));
    }

    let init = (codec.encode(image, generator)? * latent_scaling_factor)?.to_dtype(dtype)?;
    let init = if ib == shape.batch_size {
        init
    } else if shape.batch_size.is_multiple_of(ib) {
        init.repeat((shape.batch_size / ib, 1, 1, 1))?
    } else {
        return Err(DenoiseError::shape(
            "reference image batch",
            &[shape.batch_size],
            &[ib],
        ));
    };
    if init.dims() != shape.dims() {
        return Err(DenoiseError::shape("encoded reference", &shape.dims(), init.dims()));
    }

    let latents = match schedule.first() {
        Some(t0) => scheduler.add_noise(&init, &noise, t0)?,
        None => init.clone(),
    };
    debug!(shape = ?latents.dims(), timestep = ?schedule.first(), "Latents from reference image");

    Ok(LatentInit {
        latents,
        image_latents: Some(init),
        noise,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::mock::MockCodec;
    use crate::scheduler::DdimScheduler;

    fn shape() -> LatentShape {
        LatentShape {
            batch_size: 2,
            channels: 4,
            height: 4,
            width: 4,
        }
    }

    fn schedule(timesteps: Vec<f64>) -> Schedule {
        Schedule {
            num_inference_steps: timesteps.len(),
            offset: 0,
            timesteps,
        }
    }

    #[test]
    fn test_noise_latents_have_requested_shape() -> Result<()> {
        let scheduler = DdimScheduler::new(SchedulerConfig::default())?;
        let mut codec = MockCodec::new(8);
        let mut rng = Pcg32::from_seed(1);
        let init = prepare_latents(
            &scheduler,
            &mut codec,
            None,
            &schedule(vec![981.0]),
            shape(),
            8,
            0.18215,
            None,
            &mut rng,
            &Device::Cpu,
            DType::F32,
        )?;
        assert_eq!(init.latents.dims(), &[2, 4, 4, 4]);
        assert!(init.image_latents.is_none());
        Ok(())
    }

    #[test]
    fn test_supplied_latents_shape_checked() -> Result<()> {
        let scheduler = DdimScheduler::new(SchedulerConfig::default())?;
        let mut codec = MockCodec::new(8);
        let mut rng = Pcg32::from_seed(1);
        let wrong = Tensor::zeros((1, 4, 4, 4), DType::F32, &Device::Cpu)?;
        let err = prepare_latents(
            &scheduler,
            &mut codec,
            None,
            &schedule(vec![981.0]),
            shape(),
            8,
            0.18215,
            Some(wrong),
            &mut rng,
            &Device::Cpu,
            DType::F32,
        );
        assert!(matches!(err, Err(DenoiseError::ShapeMismatch { .. })));
        Ok(())
    }

    #[test]
    fn test_empty_schedule_keeps_clean_reference() -> Result<()> {
        let scheduler = DdimScheduler::new(SchedulerConfig::default())?;
        let mut codec = MockCodec::new(8);
        let mut rng = Pcg32::from_seed(3);
        let image = Tensor::full(0.5f32, (1, 3, 32, 32), &Device::Cpu)?;
        let init = prepare_latents(
            &scheduler,
            &mut codec,
            Some(&image),
            &schedule(vec![]),
            shape(),
            8,
            0.18215,
            None,
            &mut rng,
            &Device::Cpu,
            DType::F32,
        )?;
        let reference = init.image_latents.as_ref().map(|t| t.dims().to_vec());
        assert_eq!(reference, Some(vec![2, 4, 4, 4]));
        let diff = (&init.latents - init.image_latents.as_ref().unwrap_or(&init.latents))?
            .abs()?
            .max_all()?
            .to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn test_reference_size_mismatch_rejected() -> Result<()> {
        let scheduler = DdimScheduler::new(SchedulerConfig::default())?;
        let mut codec = MockCodec::new(8);
        let mut rng = Pcg32::from_seed(3);
        let image = Tensor::zeros((1, 3, 24, 32), DType::F32, &Device::Cpu)?;
        let err = prepare_latents(
            &scheduler,
            &mut codec,
            Some(&image),
            &schedule(vec![500.0]),
            shape(),
            8,
            0.18215,
            None,
            &mut rng,
            &Device::Cpu,
            DType::F32,
        );
        assert!(matches!(err, Err(DenoiseError::ShapeMismatch { .. })));
        Ok(())
    }
}
