use candle_core::{DType, Device, Tensor};
use candle_guided_diffusion::error::DenoiseError;
use candle_guided_diffusion::latents_bin::{read_latents, read_tensor, write_tensor};
use candle_guided_diffusion::utils::Pcg32;

#[test]
fn test_latents_bin_roundtrip_f32() -> candle_guided_diffusion::Result<()> {
    let device = Device::Cpu;
    let tmp = tempfile::NamedTempFile::new().expect("tempfile");
    let path = tmp.path();

    let input = Pcg32::from_seed(3).randn((2, 4, 8, 8), &device)?;
    write_tensor(path, &input)?;

    let loaded = read_latents(path, &device)?;
    assert_eq!(loaded.dims(), input.dims());

    let diff = input.sub(&loaded)?.abs()?.max_all()?.to_scalar::<f32>()?;
    assert!(diff < 1e-6, "max diff {diff}");
    Ok(())
}

#[test]
fn test_pixels_nhwc_dump_keeps_rank() -> candle_guided_diffusion::Result<()> {
    let device = Device::Cpu;
    let tmp = tempfile::NamedTempFile::new().expect("tempfile");

    let pixels = Tensor::ones((1, 16, 16, 3), DType::F32, &device)?;
    write_tensor(tmp.path(), &pixels)?;
    let loaded = read_tensor(tmp.path(), &device)?;
    assert_eq!(loaded.dims(), &[1, 16, 16, 3]);
    Ok(())
}

#[test]
fn test_read_latents_rejects_wrong_rank() -> candle_guided_diffusion::Result<()> {
    let device = Device::Cpu;
    let tmp = tempfile::NamedTempFile::new().expect("tempfile");

    let flat = Tensor::zeros(12, DType::F32, &device)?;
    write_tensor(tmp.path(), &flat)?;
    let err = read_latents(tmp.path(), &device);
    assert!(matches!(err, Err(DenoiseError::ShapeMismatch { .. })));
    Ok(())
}

#[test]
fn test_truncated_dump_is_an_error() {
    let device = Device::Cpu;
    let tmp = tempfile::NamedTempFile::new().expect("tempfile");

    let mut bytes = Vec::new();
    bytes.extend_from_slice(&4u64.to_le_bytes());
    for d in [1u64, 4, 8, 8] {
        bytes.extend_from_slice(&d.to_le_bytes());
    }
    bytes.extend_from_slice(&[0u8; 16]);
    std::fs::write(tmp.path(), bytes).expect("write");

    assert!(read_tensor(tmp.path(), &device).is_err());
}

#[test]
fn test_oversized_header_rejected_before_allocation() {
    let device = Device::Cpu;
    let tmp = tempfile::NamedTempFile::new().expect("tempfile");

    let mut bytes = Vec::new();
    bytes.extend_from_slice(&2u64.to_le_bytes());
    for d in [u64::MAX, 2] {
        bytes.extend_from_slice(&d.to_le_bytes());
    }
    std::fs::write(tmp.path(), bytes).expect("write");

    let err = read_tensor(tmp.path(), &device);
    assert!(matches!(err, Err(DenoiseError::InvalidArgument(_))));
}

#[test]
fn test_zero_rank_header_rejected() {
    let device = Device::Cpu;
    let tmp = tempfile::NamedTempFile::new().expect("tempfile");
    std::fs::write(tmp.path(), 0u64.to_le_bytes()).expect("write");

    let err = read_tensor(tmp.path(), &device);
    assert!(matches!(err, Err(DenoiseError::InvalidArgument(_))));
}
