use candle_core::{Device, Result, Shape, Tensor};

/// PCG32 generator backing every random draw of one invocation.
///
/// Latent noise, DDIM variance noise and ancestral sampler noise all come
/// from the same stream, so a fixed seed reproduces a run bit for bit.
#[derive(Debug, Clone)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

/// Stream selector used when only a seed is supplied
const DEFAULT_STREAM: u64 = 54;

impl Pcg32 {
    pub fn new(seed: u64, inc: u64) -> Self {
        let mut rng = Self {
            state: 0,
            inc: (inc << 1) | 1,
        };
        rng.next_u32();
        rng.state = rng.state.wrapping_add(seed);
        rng.next_u32();
        rng
    }

    pub fn from_seed(seed: u64) -> Self {
        Self::new(seed, DEFAULT_STREAM)
    }

    pub fn next_u32(&mut self) -> u32 {
        let old = self.state;
        self.state = old.wrapping_mul(6364136223846793005).wrapping_add(self.inc);
        // XSH-RR output permutation
        let xorshifted = (((old >> 18) ^ old) >> 27) as u32;
        let rot = (old >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Uniform in [0, 1) with 24 bits of mantissa
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 * 5.9604645e-8
    }

    /// Box-Muller pair of standard normals
    pub fn next_gaussian(&mut self) -> (f32, f32) {
        let u1 = loop {
            let x = self.next_f32();
            if x > 1e-7 {
                break x;
            }
        };
        let u2 = self.next_f32();

        let mag = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f32::consts::PI * u2;
        (mag * theta.cos(), mag * theta.sin())
    }

    /// Standard normal F32 tensor of the given shape
    pub fn randn(&mut self, shape: impl Into<Shape>, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let elem_count = shape.elem_count();
        let mut data = Vec::with_capacity(elem_count + 1);
        while data.len() < elem_count {
            let (z0, z1) = self.next_gaussian();
            data.push(z0);
            data.push(z1);
        }
        data.truncate(elem_count);
        Tensor::from_vec(data, shape, device)
    }

    /// Standard normal tensor matching `like`'s shape, device and dtype
    pub fn randn_like(&mut self, like: &Tensor) -> Result<Tensor> {
        self.randn(like.shape(), like.device())?.to_dtype(like.dtype())
    }
}
