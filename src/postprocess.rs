//! Postprocessor
//!
//! Latents → codec decode → `[0, 1]` pixels → requested representation.
//! Large latents can be decoded in overlapping tiles; neighbouring tiles are
//! blended linearly over the overlap before the seams are cut.

use candle_core::{DType, IndexOp, Result, Tensor};
use image::RgbImage;
use tracing::{debug, info};

use crate::config::TilingConfig;
use crate::pipeline::Codec;

/// Vertical blend of the top rows of `b` with the bottom rows of `a`
fn blend_v(a: &Tensor, b: &Tensor, blend_extent: usize) -> Result<Tensor> {
    let blend = blend_extent.min(a.dims4()?.2).min(b.dims4()?.2);
    if blend == 0 {
        return Ok(b.clone());
    }

    let w = Tensor::arange(0u32, blend as u32, b.device())?
        .to_dtype(DType::F32)?
        .affine(1.0 / (blend as f64), 0.0)?;
    let w = w.reshape((1, 1, blend, 1))?.to_dtype(b.dtype())?;
    let one_minus = w.affine(-1.0, 1.0)?;

    let b_head = b.i((.., .., 0..blend, ..))?;
    let b_tail = b.i((.., .., blend.., ..))?;
    let ah = a.dims4()?.2;
    let a_tail = a.i((.., .., (ah - blend)..ah, ..))?;

    let mixed = a_tail
        .broadcast_mul(&one_minus)?
        .add(&b_head.broadcast_mul(&w)?)?;
    Tensor::cat(&[&mixed, &b_tail], 2)
}

/// Horizontal blend of the left columns of `b` with the right columns of `a`
fn blend_h(a: &Tensor, b: &Tensor, blend_extent: usize) -> Result<Tensor> {
    let blend = blend_extent.min(a.dims4()?.3).min(b.dims4()?.3);
    if blend == 0 {
        return Ok(b.clone());
    }

    let w = Tensor::arange(0u32, blend as u32, b.device())?
        .to_dtype(DType::F32)?
        .affine(1.0 / (blend as f64), 0.0)?;
    let w = w.reshape((1, 1, 1, blend))?.to_dtype(b.dtype())?;
    let one_minus = w.affine(-1.0, 1.0)?;

    let b_head = b.i((.., .., .., 0..blend))?;
    let b_tail = b.i((.., .., .., blend..))?;
    let aw = a.dims4()?.3;
    let a_tail = a.i((.., .., .., (aw - blend)..aw))?;

    let mixed = a_tail
        .broadcast_mul(&one_minus)?
        .add(&b_head.broadcast_mul(&w)?)?;
    Tensor::cat(&[&mixed, &b_tail], 3)
}

/// Decode `latents` tile by tile.
///
/// Tiles are `tile_latent_size` wide and step by `size - overlap`; the decoded
/// overlap is blended into the previous row / column, then each tile is cut
/// to its stride before concatenation.
pub fn tiled_decode(
    codec: &mut dyn Codec,
    latents: &Tensor,
    tiling: &TilingConfig,
    scale_factor: usize,
) -> Result<Tensor> {
    let (_b, _c, lh, lw) = latents.dims4()?;
    let tile = tiling.tile_latent_size.max(1);
    let overlap = tiling.tile_latent_overlap.min(tile.saturating_sub(1));
    let stride = tile - overlap;
    let blend_extent = overlap * scale_factor;
    let sample_stride = stride * scale_factor;

    let mut rows: Vec<Vec<Tensor>> = Vec::new();
    for i in (0..lh).step_by(stride) {
        let mut row = Vec::new();
        for j in (0..lw).step_by(stride) {
            let h_end = (i + tile).min(lh);
            let w_end = (j + tile).min(lw);
            let z = latents.i((.., .., i..h_end, j..w_end))?;
            row.push(codec.decode(&z)?);
        }
        rows.push(row);
    }
    debug!(
        rows = rows.len(),
        cols = rows.first().map_or(0, Vec::len),
        "Tiled decode"
    );

    let mut result_rows = Vec::with_capacity(rows.len());
    let mut prev_row: Vec<Tensor> = Vec::new();
    for row in rows {
        let mut curr_row: Vec<Tensor> = Vec::with_capacity(row.len());
        let mut result_row = Vec::with_capacity(row.len());
        for (cj, mut tile) in row.into_iter().enumerate() {
            if let Some(above) = prev_row.get(cj) {
                tile = blend_v(above, &tile, blend_extent)?;
            }
            if let Some(left) = curr_row.last() {
                tile = blend_h(left, &tile, blend_extent)?;
            }
            curr_row.push(tile.clone());

            let h_slice = sample_stride.min(tile.dim(2)?);
            let w_slice = sample_stride.min(tile.dim(3)?);
            result_row.push(tile.i((.., .., 0..h_slice, 0..w_slice))?);
        }
        result_rows.push(Tensor::cat(&result_row, 3)?);
        prev_row = curr_row;
    }

    let decoded = Tensor::cat(&result_rows, 2)?;
    decoded.i((.., .., 0..lh * scale_factor, 0..lw * scale_factor))
}

/// Undo the latent scaling, decode, map to `[0, 1]` and crop to `height x width`.
///
/// Returns NCHW f32 pixels.
pub fn decode_latents(
    codec: &mut dyn Codec,
    latents: &Tensor,
    latent_scaling_factor: f64,
    tiling: &TilingConfig,
    scale_factor: usize,
    height: usize,
    width: usize,
) -> Result<Tensor> {
    let latents = (latents * (1.0 / latent_scaling_factor))?;
    let (_b, _c, lh, lw) = latents.dims4()?;
    let tiled = tiling.enabled && (lh > tiling.tile_latent_size || lw > tiling.tile_latent_size);
    info!(tiled, shape = ?latents.dims(), "Decoding latents");

    let image = if tiled {
        tiled_decode(codec, &latents, tiling, scale_factor)?
    } else {
        codec.decode(&latents)?
    };

    let image = ((image.to_dtype(DType::F32)? / 2.0)? + 0.5)?.clamp(0f32, 1f32)?;
    let (_b, _c, h, w) = image.dims4()?;
    image.i((.., .., 0..height.min(h), 0..width.min(w)))
}

/// NCHW → NHWC
pub fn to_nhwc(pixels: &Tensor) -> Result<Tensor> {
    pixels.permute((0, 2, 3, 1))?.contiguous()
}

/// NCHW `[0, 1]` pixels to 8-bit RGB images, one per batch entry
pub fn to_rgb_images(pixels: &Tensor) -> Result<Vec<RgbImage>> {
    let (b, c, h, w) = pixels.dims4()?;
    if c != 3 {
        candle_core::bail!("expected 3 channels for RGB output, got {c}");
    }
    let bytes = (pixels.to_dtype(DType::F32)? * 255.0)?
        .round()?
        .clamp(0f32, 255f32)?
        .to_dtype(DType::U8)?;
    let bytes = to_nhwc(&bytes)?;

    (0..b)
        .map(|i| {
            let data = bytes.i(i)?.flatten_all()?.to_vec1::<u8>()?;
            RgbImage::from_raw(w as u32, h as u32, data).ok_or_else(|| {
                candle_core::Error::Msg(format!("pixel buffer does not fit {w}x{h} image"))
            })
        })
        .collect()
}
