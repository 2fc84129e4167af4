//! Deterministic stand-ins for the collaborator networks.
//!
//! They follow the tensor contracts of the real networks closely enough to
//! drive every path of the pipeline on CPU: the denoiser records each call,
//! produces attention probabilities on request and reads control residuals;
//! the codec is an exact block-average / nearest-upsample pair.

use std::cell::RefCell;
use std::rc::Rc;

use candle_core::{D, DType, Device, Result, Tensor};
use candle_nn::ops::softmax_last_dim;

use crate::pipeline::{
    AttentionCapture, Codec, ControlAdapter, ControlResiduals, Denoiser, DenoiserOutput,
    TextEncoder,
};
use crate::utils::Pcg32;

pub const MOCK_SEQ_LEN: usize = 8;
pub const MOCK_EMBED_DIM: usize = 16;
pub const MOCK_LATENT_CHANNELS: usize = 4;
const MOCK_HEADS: usize = 2;

fn prompt_seed(prompt: &str) -> u64 {
    // FNV-1a
    prompt.bytes().fold(0xcbf29ce484222325u64, |h, b| {
        (h ^ b as u64).wrapping_mul(0x100000001b3)
    })
}

// =============================================================================
// Text encoder
// =============================================================================

/// Embeds each prompt as gaussian noise seeded by the prompt text
#[derive(Debug, Clone)]
pub struct MockTextEncoder {
    device: Device,
    calls: Rc<RefCell<usize>>,
}

impl MockTextEncoder {
    pub fn new(device: &Device) -> Self {
        Self {
            device: device.clone(),
            calls: Rc::new(RefCell::new(0)),
        }
    }

    /// Shared counter of `encode` calls
    pub fn call_count(&self) -> Rc<RefCell<usize>> {
        Rc::clone(&self.calls)
    }

    fn embed(&self, prompts: &[String]) -> Result<Tensor> {
        let rows = prompts
            .iter()
            .map(|p| {
                Pcg32::from_seed(prompt_seed(p)).randn((1, MOCK_SEQ_LEN, MOCK_EMBED_DIM), &self.device)
            })
            .collect::<Result<Vec<_>>>()?;
        Tensor::cat(&rows, 0)
    }
}

impl TextEncoder for MockTextEncoder {
    fn encode(
        &mut self,
        prompts: &[String],
        uncond_prompts: Option<&[String]>,
        _max_embeddings_multiples: usize,
    ) -> Result<(Tensor, Option<Tensor>)> {
        *self.calls.borrow_mut() += 1;
        let cond = self.embed(prompts)?;
        let uncond = uncond_prompts.map(|u| self.embed(u)).transpose()?;
        Ok((cond, uncond))
    }
}

// =============================================================================
// Denoiser
// =============================================================================

/// One recorded denoiser call
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub batch: usize,
    pub channels: usize,
    pub timestep: f64,
    pub with_control: bool,
    pub captured_attention: bool,
}

pub type CallLog = Rc<RefCell<Vec<CallRecord>>>;

/// Linear noise predictor with a synthetic self-attention block
#[derive(Debug, Clone)]
pub struct MockDenoiser {
    in_channels: usize,
    log: CallLog,
}

impl MockDenoiser {
    pub fn new() -> Self {
        Self::with_in_channels(MOCK_LATENT_CHANNELS)
    }

    /// Nine channels for an inpainting denoiser
    pub fn with_in_channels(in_channels: usize) -> Self {
        Self {
            in_channels,
            log: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn call_log(&self) -> CallLog {
        Rc::clone(&self.log)
    }

    /// Two heads of attention over 2x2-pooled latent tokens
    fn attention(latents: &Tensor) -> Result<AttentionCapture> {
        let (b, c, h, w) = latents.dims4()?;
        let pooled = latents.avg_pool2d(2)?;
        let (mh, mw) = (h / 2, w / 2);
        let tokens = pooled.reshape((b, c, mh * mw))?.transpose(1, 2)?.contiguous()?;
        let scores = tokens.matmul(&tokens.transpose(1, 2)?.contiguous()?)?;

        let heads = (0..MOCK_HEADS)
            .map(|head| softmax_last_dim(&(&scores * (1.0 / (head + 1) as f64))?))
            .collect::<Result<Vec<_>>>()?;
        let probs = Tensor::stack(&heads, 1)?.reshape((b * MOCK_HEADS, mh * mw, mh * mw))?;
        Ok(AttentionCapture {
            probs,
            heads: MOCK_HEADS,
            map_size: (mh, mw),
        })
    }
}

impl Default for MockDenoiser {
    fn default() -> Self {
        Self::new()
    }
}

impl Denoiser for MockDenoiser {
    fn in_channels(&self) -> usize {
        self.in_channels
    }

    fn forward(
        &mut self,
        latent_input: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
        control: Option<&ControlResiduals>,
        capture_attention: bool,
    ) -> Result<DenoiserOutput> {
        let (b, c, _h, _w) = latent_input.dims4()?;
        if c != self.in_channels {
            candle_core::bail!("mock denoiser expects {} channels, got {c}", self.in_channels);
        }
        if encoder_hidden_states.dim(0)? != b {
            candle_core::bail!(
                "encoder batch {} does not match latent batch {b}",
                encoder_hidden_states.dim(0)?
            );
        }
        self.log.borrow_mut().push(CallRecord {
            batch: b,
            channels: c,
            timestep,
            with_control: control.is_some(),
            captured_attention: capture_attention,
        });

        let latents = latent_input.narrow(1, 0, MOCK_LATENT_CHANNELS)?;
        let cond = encoder_hidden_states
            .to_dtype(DType::F32)?
            .mean(D::Minus1)?
            .mean(D::Minus1)?
            .reshape((b, 1, 1, 1))?
            .to_dtype(latents.dtype())?;
        let t_scale = 0.1 * (1.0 + timestep / 1000.0);
        let mut eps = (latents.affine(t_scale, 0.0)? + cond.affine(0.05, 0.0)?.broadcast_as(latents.shape())?)?;

        if c > MOCK_LATENT_CHANNELS {
            let extra = latent_input.narrow(1, MOCK_LATENT_CHANNELS + 1, MOCK_LATENT_CHANNELS)?;
            eps = (eps + extra.affine(0.01, 0.0)?)?;
        }
        if let Some(residuals) = control {
            for down in &residuals.down_blocks {
                eps = eps.broadcast_add(down)?;
            }
            eps = eps.broadcast_add(&residuals.mid_block)?;
        }

        let attention = if capture_attention {
            Some(Self::attention(&latents.to_dtype(DType::F32)?)?)
        } else {
            None
        };
        Ok(DenoiserOutput {
            noise_pred: eps,
            attention,
        })
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Block-average encoder and nearest-neighbour decoder
#[derive(Debug, Clone)]
pub struct MockCodec {
    scale_factor: usize,
    decodes: Rc<RefCell<usize>>,
}

impl MockCodec {
    pub fn new(scale_factor: usize) -> Self {
        Self {
            scale_factor,
            decodes: Rc::new(RefCell::new(0)),
        }
    }

    /// Shared counter of `decode` calls
    pub fn decode_count(&self) -> Rc<RefCell<usize>> {
        Rc::clone(&self.decodes)
    }
}

impl Codec for MockCodec {
    fn latent_channels(&self) -> usize {
        MOCK_LATENT_CHANNELS
    }

    fn encode(&mut self, image: &Tensor, _generator: &mut Pcg32) -> Result<Tensor> {
        let pooled = image.avg_pool2d(self.scale_factor)?;
        let luma = pooled.mean_keepdim(1)?;
        Tensor::cat(&[&pooled, &luma], 1)
    }

    fn decode(&mut self, latents: &Tensor) -> Result<Tensor> {
        *self.decodes.borrow_mut() += 1;
        let (_b, _c, h, w) = latents.dims4()?;
        latents
            .narrow(1, 0, 3)?
            .upsample_nearest2d(h * self.scale_factor, w * self.scale_factor)
    }
}

// =============================================================================
// Control adapter
// =============================================================================

/// Residuals proportional to the pooled control image
#[derive(Debug, Clone, Default)]
pub struct MockControlAdapter {
    global_pool: bool,
    scales: Rc<RefCell<Vec<(usize, f64)>>>,
}

impl MockControlAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_global_pool_conditions(mut self) -> Self {
        self.global_pool = true;
        self
    }

    /// `(batch, conditioning_scale)` of every call
    pub fn calls(&self) -> Rc<RefCell<Vec<(usize, f64)>>> {
        Rc::clone(&self.scales)
    }
}

impl ControlAdapter for MockControlAdapter {
    fn global_pool_conditions(&self) -> bool {
        self.global_pool
    }

    fn forward(
        &mut self,
        sample: &Tensor,
        _timestep: f64,
        encoder_hidden_states: &Tensor,
        control_image: &Tensor,
        conditioning_scale: f64,
        _guess_mode: bool,
    ) -> Result<ControlResiduals> {
        let (b, c, h, _w) = sample.dims4()?;
        if control_image.dim(0)? != b || encoder_hidden_states.dim(0)? != b {
            candle_core::bail!(
                "control batch mismatch: sample {b}, image {}, embeddings {}",
                control_image.dim(0)?,
                encoder_hidden_states.dim(0)?
            );
        }
        self.scales.borrow_mut().push((b, conditioning_scale));

        let factor = control_image.dim(2)? / h;
        let pooled = control_image
            .to_dtype(sample.dtype())?
            .avg_pool2d(factor.max(1))?
            .mean_keepdim(1)?
            .repeat((1, c, 1, 1))?;
        let down = pooled.affine(0.01 * conditioning_scale, 0.0)?;
        let mid = down.mean_keepdim(3)?.mean_keepdim(2)?;
        Ok(ControlResiduals {
            down_blocks: vec![down],
            mid_block: mid,
        })
    }
}
