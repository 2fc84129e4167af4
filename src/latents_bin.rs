//! Raw latent dumps.
//!
//! Little-endian layout:
//! - ndims: u64
//! - dims: ndims * u64
//! - data: f32 * product(dims)
//!
//! Used by the CLI for `--output-type latent` and to feed pre-drawn noise
//! back in through `--latents`.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use tracing::debug;

use crate::error::{DenoiseError, Result};

/// Largest rank accepted when reading a dump
const MAX_DIMS: usize = 8;

fn read_u64(reader: &mut impl Read) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Read a dump of any rank
pub fn read_tensor(path: impl AsRef<Path>, device: &Device) -> Result<Tensor> {
    let path = path.as_ref();
    let mut reader = BufReader::new(File::open(path).map_err(candle_core::Error::from)?);

    let ndims = read_u64(&mut reader).map_err(candle_core::Error::from)? as usize;
    if ndims == 0 || ndims > MAX_DIMS {
        return Err(DenoiseError::invalid(format!(
            "{}: unsupported tensor rank {ndims}",
            path.display()
        )));
    }
    let dims = (0..ndims)
        .map(|_| read_u64(&mut reader).map(|d| d as usize))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(candle_core::Error::from)?;

    let byte_len = dims
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .and_then(|numel| numel.checked_mul(4))
        .ok_or_else(|| {
            DenoiseError::invalid(format!("{}: tensor size overflows", path.display()))
        })?;
    let mut bytes = vec![0u8; byte_len];
    reader
        .read_exact(&mut bytes)
        .map_err(candle_core::Error::from)?;
    let data: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    debug!(path = %path.display(), ?dims, "Read tensor dump");
    Ok(Tensor::from_vec(data, dims, device)?)
}

/// Read a `(batch, channels, h, w)` latent dump
pub fn read_latents(path: impl AsRef<Path>, device: &Device) -> Result<Tensor> {
    let tensor = read_tensor(path, device)?;
    if tensor.rank() != 4 {
        return Err(DenoiseError::shape("latent dump rank", &[4], &[tensor.rank()]));
    }
    Ok(tensor)
}

/// Write any tensor as f32
pub fn write_tensor(path: impl AsRef<Path>, tensor: &Tensor) -> Result<()> {
    let path = path.as_ref();
    let mut writer = BufWriter::new(File::create(path).map_err(candle_core::Error::from)?);

    let dims = tensor.dims();
    let mut header = Vec::with_capacity(8 * (dims.len() + 1));
    header.extend_from_slice(&(dims.len() as u64).to_le_bytes());
    for &d in dims {
        header.extend_from_slice(&(d as u64).to_le_bytes());
    }

    let data = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    let mut body = Vec::with_capacity(data.len() * 4);
    for v in data {
        body.extend_from_slice(&v.to_le_bytes());
    }

    writer
        .write_all(&header)
        .and_then(|_| writer.write_all(&body))
        .and_then(|_| writer.flush())
        .map_err(candle_core::Error::from)?;
    debug!(path = %path.display(), dims = ?tensor.dims(), "Wrote tensor dump");
    Ok(())
}
