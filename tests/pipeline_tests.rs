//! Tests for the guided diffusion pipeline
//!
//! Drives the full orchestrator with the mock collaborators on CPU and checks
//! the observable contracts: call batch sizes, step counts, cancellation,
//! determinism, output shapes and the validation taxonomy.

use std::cell::RefCell;
use std::rc::Rc;

use candle_core::{DType, Device, Tensor};
use candle_guided_diffusion::config::{GenerationParams, OutputType, PipelineConfig, SchedulerKind};
use candle_guided_diffusion::error::DenoiseError;
use candle_guided_diffusion::mock::{
    CallLog, MockCodec, MockControlAdapter, MockDenoiser, MockTextEncoder,
};
use candle_guided_diffusion::pipeline::{
    Codec, GeneratedImages, GenerationInputs, GenerationOutput, GuidedDiffusionPipeline,
};
use candle_guided_diffusion::schedule::spaced_timesteps;
use candle_guided_diffusion::strategy::LoopHooks;
use candle_guided_diffusion::utils::Pcg32;
use candle_guided_diffusion::{CancellationToken, PromptInput};

// =============================================================================
// Helper functions
// =============================================================================

struct TestPipeline {
    pipeline: GuidedDiffusionPipeline<'static>,
    calls: CallLog,
    decodes: Rc<RefCell<usize>>,
    encodes: Rc<RefCell<usize>>,
}

fn create_test_device() -> Device {
    Device::Cpu
}

fn create_test_config(kind: SchedulerKind) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.scheduler.kind = kind;
    config
}

fn create_test_pipeline_with(config: PipelineConfig, in_channels: usize) -> TestPipeline {
    let device = create_test_device();
    let encoder = MockTextEncoder::new(&device);
    let denoiser = MockDenoiser::with_in_channels(in_channels);
    let codec = MockCodec::new(config.vae_scale_factor);
    let calls = denoiser.call_log();
    let decodes = codec.decode_count();
    let encodes = encoder.call_count();
    let pipeline = GuidedDiffusionPipeline::new(
        Box::new(encoder),
        Box::new(denoiser),
        Box::new(codec),
        config,
        device,
        DType::F32,
    )
    .expect("pipeline");
    TestPipeline {
        pipeline,
        calls,
        decodes,
        encodes,
    }
}

fn create_test_pipeline(kind: SchedulerKind) -> TestPipeline {
    create_test_pipeline_with(create_test_config(kind), 4)
}

fn create_test_params() -> GenerationParams {
    GenerationParams::default()
        .with_size(64, 64)
        .with_steps(4)
        .with_seed(7)
        .with_output_type(OutputType::Latent)
}

fn create_test_reference() -> Tensor {
    let device = create_test_device();
    let row = Tensor::arange(0u32, 64, &device)
        .unwrap()
        .to_dtype(DType::F32)
        .unwrap()
        .affine(2.0 / 64.0, -1.0)
        .unwrap();
    row.reshape((1, 1, 1, 64))
        .unwrap()
        .broadcast_as((1, 3, 64, 64))
        .unwrap()
        .contiguous()
        .unwrap()
}

fn encoded_reference(reference: &Tensor) -> Tensor {
    let mut codec = MockCodec::new(8);
    let mut rng = Pcg32::from_seed(0);
    (codec.encode(reference, &mut rng).unwrap() * 0.18215).unwrap()
}

fn latents_of(output: Option<GenerationOutput>) -> Tensor {
    match output.expect("not cancelled").images {
        GeneratedImages::Latents(latents) => latents,
        other => panic!("expected latents, got {other:?}"),
    }
}

fn flat(t: &Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

// =============================================================================
// Text-to-image
// =============================================================================

#[test]
fn test_text2img_latent_output_shape() {
    let mut t = create_test_pipeline(SchedulerKind::Ddim);
    let out = t
        .pipeline
        .text2img("a red cube", None, &create_test_params(), LoopHooks::new())
        .unwrap()
        .expect("not cancelled");
    assert_eq!(out.nsfw_content_detected, vec![false]);
    match out.images {
        GeneratedImages::Latents(latents) => assert_eq!(latents.dims(), &[1, 4, 8, 8]),
        other => panic!("unexpected output {other:?}"),
    }
    assert_eq!(*t.decodes.borrow(), 0);
}

#[test]
fn test_pil_output_two_images_per_prompt() {
    let mut t = create_test_pipeline(SchedulerKind::Ddim);
    let params = GenerationParams {
        num_images_per_prompt: 2,
        output_type: OutputType::Pil,
        ..create_test_params()
    };
    let out = t
        .pipeline
        .text2img("a red cube", None, &params, LoopHooks::new())
        .unwrap()
        .expect("not cancelled");
    assert_eq!(out.nsfw_content_detected, vec![false, false]);
    match out.images {
        GeneratedImages::Images(images) => {
            assert_eq!(images.len(), 2);
            assert_eq!(images[0].dimensions(), (64, 64));
        }
        other => panic!("unexpected output {other:?}"),
    }
    assert!(t.calls.borrow().iter().all(|c| c.batch == 4));
}

#[test]
fn test_images_per_prompt_are_sampled_independently() {
    let mut t = create_test_pipeline(SchedulerKind::Ddim);
    let params = GenerationParams {
        num_images_per_prompt: 2,
        ..create_test_params()
    };
    let latents = latents_of(
        t.pipeline
            .text2img("a red cube", None, &params, LoopHooks::new())
            .unwrap(),
    );
    assert_eq!(latents.dim(0).unwrap(), 2);
    let first = latents.narrow(0, 0, 1).unwrap();
    let second = latents.narrow(0, 1, 1).unwrap();
    assert!(max_abs_diff(&first, &second) > 1e-4);
}

#[test]
fn test_pixel_output_is_nhwc_in_unit_range() {
    let mut t = create_test_pipeline(SchedulerKind::Ddim);
    let params = create_test_params().with_output_type(OutputType::Pixel);
    let out = t
        .pipeline
        .text2img("a red cube", None, &params, LoopHooks::new())
        .unwrap()
        .expect("not cancelled");
    match out.images {
        GeneratedImages::Pixels(pixels) => {
            assert_eq!(pixels.dims(), &[1, 64, 64, 3]);
            let v = flat(&pixels);
            assert!(v.iter().all(|x| (0.0..=1.0).contains(x)));
        }
        other => panic!("unexpected output {other:?}"),
    }
    assert_eq!(*t.decodes.borrow(), 1);
}

#[test]
fn test_generation_is_deterministic() {
    let params = create_test_params().with_guidance_scale(5.0);
    let run = || {
        let mut t = create_test_pipeline(SchedulerKind::Ddim);
        latents_of(
            t.pipeline
                .text2img("determinism", Some("blurry".into()), &params, LoopHooks::new())
                .unwrap(),
        )
    };
    assert_eq!(flat(&run()), flat(&run()));
}

#[test]
fn test_ddim_eta_reproducible_and_stochastic() {
    let run = |eta: f64| {
        let mut t = create_test_pipeline(SchedulerKind::Ddim);
        let params = GenerationParams {
            eta,
            ..create_test_params()
        };
        latents_of(
            t.pipeline
                .text2img("eta", None, &params, LoopHooks::new())
                .unwrap(),
        )
    };
    assert_eq!(flat(&run(1.0)), flat(&run(1.0)));
    assert!(max_abs_diff(&run(1.0), &run(0.0)) > 1e-6);
}

// =============================================================================
// Guidance batching
// =============================================================================

#[test]
fn test_cfg_disabled_keeps_conditional_batch() {
    for scale in [0.0, 1.0] {
        let mut t = create_test_pipeline(SchedulerKind::Ddim);
        let params = create_test_params().with_guidance_scale(scale);
        t.pipeline
            .text2img("no cfg", None, &params, LoopHooks::new())
            .unwrap();
        let calls = t.calls.borrow();
        assert_eq!(calls.len(), 4);
        assert!(calls.iter().all(|c| c.batch == 1));
    }
}

#[test]
fn test_cfg_enabled_doubles_batch() {
    let mut t = create_test_pipeline(SchedulerKind::Ddim);
    t.pipeline
        .text2img("cfg", None, &create_test_params(), LoopHooks::new())
        .unwrap();
    let calls = t.calls.borrow();
    assert_eq!(calls.len(), 4);
    assert!(calls.iter().all(|c| c.batch == 2));
    assert!(calls.iter().all(|c| !c.captured_attention));
}

#[test]
fn test_sag_adds_one_unconditional_call_per_step() {
    let mut t = create_test_pipeline(SchedulerKind::Ddim);
    let params = GenerationParams {
        self_attention_scale: 0.75,
        ..create_test_params()
    };
    t.pipeline
        .text2img("sag", None, &params, LoopHooks::new())
        .unwrap();
    let calls = t.calls.borrow();
    assert_eq!(calls.len(), 8);
    for pair in calls.chunks(2) {
        assert_eq!(pair[0].batch, 2);
        assert!(pair[0].captured_attention);
        assert_eq!(pair[1].batch, 1);
        assert!(!pair[1].captured_attention);
        assert_eq!(pair[0].timestep, pair[1].timestep);
    }
}

#[test]
fn test_sag_changes_result() {
    let run = |sag: f64| {
        let mut t = create_test_pipeline(SchedulerKind::Ddim);
        let params = GenerationParams {
            self_attention_scale: sag,
            ..create_test_params()
        };
        latents_of(
            t.pipeline
                .text2img("sag", None, &params, LoopHooks::new())
                .unwrap(),
        )
    };
    assert!(max_abs_diff(&run(0.0), &run(1.0)) > 1e-6);
}

#[test]
fn test_sag_without_cfg_uses_sole_batch() {
    let mut t = create_test_pipeline(SchedulerKind::Euler);
    let params = GenerationParams {
        self_attention_scale: 0.5,
        ..create_test_params().with_guidance_scale(1.0)
    };
    t.pipeline
        .text2img("sag", None, &params, LoopHooks::new())
        .unwrap();
    let calls = t.calls.borrow();
    assert_eq!(calls.len(), 8);
    assert!(calls.iter().all(|c| c.batch == 1));
}

// =============================================================================
// Schedule and strength
// =============================================================================

#[test]
fn test_strength_scenario_50_steps_at_08() {
    let mut t = create_test_pipeline(SchedulerKind::Ddim);
    let reference = create_test_reference();
    let params = GenerationParams {
        num_inference_steps: 50,
        strength: 0.8,
        ..create_test_params().with_guidance_scale(1.0)
    };
    t.pipeline
        .img2img("strength", None, &reference, &params, LoopHooks::new())
        .unwrap();

    let full = spaced_timesteps(&create_test_config(SchedulerKind::Ddim).scheduler, 50).unwrap();
    let calls = t.calls.borrow();
    assert_eq!(calls.len(), 40);
    assert_eq!(calls[0].timestep, full[10]);
    assert_eq!(calls[39].timestep, full[49]);
}

#[test]
fn test_strength_one_visits_full_schedule() {
    let mut t = create_test_pipeline(SchedulerKind::Ddim);
    let reference = create_test_reference();
    let params = create_test_params().with_strength(1.0).with_steps(10);
    t.pipeline
        .img2img("full", None, &reference, &params, LoopHooks::new())
        .unwrap();
    assert_eq!(t.calls.borrow().len(), 10);
}

#[test]
fn test_strength_zero_returns_reference_latents() {
    let mut t = create_test_pipeline(SchedulerKind::Ddim);
    let reference = create_test_reference();
    let params = create_test_params().with_strength(0.0);
    let latents = latents_of(
        t.pipeline
            .img2img("noop", None, &reference, &params, LoopHooks::new())
            .unwrap(),
    );
    assert!(t.calls.borrow().is_empty());
    assert!(max_abs_diff(&latents, &encoded_reference(&reference)) < 1e-6);
}

#[test]
fn test_low_strength_stays_close_to_reference() {
    let reference = create_test_reference();
    let expected = encoded_reference(&reference);
    let distance = |strength: f64| {
        let mut t = create_test_pipeline(SchedulerKind::Ddim);
        let params = GenerationParams {
            num_inference_steps: 20,
            strength,
            ..create_test_params().with_guidance_scale(1.0)
        };
        let latents = latents_of(
            t.pipeline
                .img2img("near", None, &reference, &params, LoopHooks::new())
                .unwrap(),
        );
        max_abs_diff(&latents, &expected)
    };
    assert!(distance(0.05) < distance(1.0));
}

// =============================================================================
// Cancellation
// =============================================================================

#[test]
fn test_cancellation_returns_none_without_decode() {
    let mut t = create_test_pipeline(SchedulerKind::Ddim);
    let params = create_test_params()
        .with_steps(6)
        .with_output_type(OutputType::Pil);
    let token = CancellationToken::new();
    let seen = RefCell::new(Vec::new());
    let mut progress = |step: usize, _t: f64, _x: &Tensor| {
        seen.borrow_mut().push(step);
        if step == 2 {
            token.cancel();
        }
    };
    let is_cancelled = || token.is_cancelled();
    let hooks = LoopHooks::new()
        .with_progress(&mut progress)
        .with_cancellation(&is_cancelled);

    let out = t.pipeline.text2img("cancel", None, &params, hooks).unwrap();
    assert!(out.is_none());
    assert_eq!(*seen.borrow(), vec![0, 1, 2]);
    assert_eq!(t.calls.borrow().len(), 3);
    assert_eq!(*t.decodes.borrow(), 0);
    assert!(t.pipeline.context().is_idle());
}

#[test]
fn test_cancellation_polled_at_callback_interval() {
    let mut t = create_test_pipeline(SchedulerKind::KEuler);
    let params = GenerationParams {
        callback_steps: 2,
        ..create_test_params().with_steps(8)
    };
    let seen = RefCell::new(Vec::new());
    let mut progress = |step: usize, _t: f64, _x: &Tensor| seen.borrow_mut().push(step);
    let is_cancelled = || seen.borrow().last() == Some(&4);
    let hooks = LoopHooks::new()
        .with_progress(&mut progress)
        .with_cancellation(&is_cancelled);

    let out = t.pipeline.text2img("cancel", None, &params, hooks).unwrap();
    assert!(out.is_none());
    assert_eq!(*seen.borrow(), vec![0, 2, 4]);
    assert_eq!(t.calls.borrow().len(), 5);
}

// =============================================================================
// External sampler
// =============================================================================

#[test]
fn test_external_sampler_calls_once_per_step() {
    for kind in [SchedulerKind::KEuler, SchedulerKind::KEulerA] {
        let mut t = create_test_pipeline(kind);
        let latents = latents_of(
            t.pipeline
                .text2img("external", None, &create_test_params(), LoopHooks::new())
                .unwrap(),
        );
        assert!(t.pipeline.strategy().is_external());
        assert_eq!(t.calls.borrow().len(), 4);
        assert!(flat(&latents).iter().all(|v| v.is_finite()));
    }
}

#[test]
fn test_external_sampler_with_sag_and_img2img() {
    let mut t = create_test_pipeline(SchedulerKind::KEulerA);
    let reference = create_test_reference();
    let params = GenerationParams {
        self_attention_scale: 0.5,
        ..create_test_params().with_steps(10).with_strength(0.5)
    };
    let latents = latents_of(
        t.pipeline
            .img2img("external", None, &reference, &params, LoopHooks::new())
            .unwrap(),
    );
    assert_eq!(t.calls.borrow().len(), 10);
    assert!(flat(&latents).iter().all(|v| v.is_finite()));
}

// =============================================================================
// Structural control
// =============================================================================

fn create_control_pipeline(adapter: MockControlAdapter) -> TestPipeline {
    let mut t = create_test_pipeline(SchedulerKind::Ddim);
    t.pipeline = t.pipeline.with_control_adapter(Box::new(adapter));
    t
}

#[test]
fn test_control_residuals_on_full_batch() {
    let adapter = MockControlAdapter::new();
    let adapter_calls = adapter.calls();
    let mut t = create_control_pipeline(adapter);
    let control = Tensor::ones((1, 3, 64, 64), DType::F32, &create_test_device()).unwrap();
    let inputs = GenerationInputs::new("control").with_control_image(&control);
    t.pipeline
        .generate(inputs, &create_test_params(), LoopHooks::new())
        .unwrap();

    assert_eq!(*adapter_calls.borrow(), vec![(2, 1.0); 4]);
    assert!(t.calls.borrow().iter().all(|c| c.with_control && c.batch == 2));
}

#[test]
fn test_guess_mode_runs_adapter_on_conditional_half() {
    let adapter = MockControlAdapter::new();
    let adapter_calls = adapter.calls();
    let mut t = create_control_pipeline(adapter);
    let control = Tensor::ones((1, 3, 64, 64), DType::F32, &create_test_device()).unwrap();
    let params = GenerationParams {
        guess_mode: true,
        ..create_test_params()
    };
    let inputs = GenerationInputs::new("control").with_control_image(&control);
    t.pipeline
        .generate(inputs, &params, LoopHooks::new())
        .unwrap();

    assert!(adapter_calls.borrow().iter().all(|&(b, _)| b == 1));
    assert!(t.calls.borrow().iter().all(|c| c.batch == 2));
}

#[test]
fn test_global_pool_conditions_force_guess_mode() {
    let adapter = MockControlAdapter::new().with_global_pool_conditions();
    let adapter_calls = adapter.calls();
    let mut t = create_control_pipeline(adapter);
    let control = Tensor::ones((1, 3, 64, 64), DType::F32, &create_test_device()).unwrap();
    let inputs = GenerationInputs::new("control").with_control_image(&control);
    t.pipeline
        .generate(inputs, &create_test_params(), LoopHooks::new())
        .unwrap();
    assert!(adapter_calls.borrow().iter().all(|&(b, _)| b == 1));
}

#[test]
fn test_control_guidance_window_zeroes_scale() {
    let adapter = MockControlAdapter::new();
    let adapter_calls = adapter.calls();
    let mut t = create_control_pipeline(adapter);
    let control = Tensor::ones((1, 3, 64, 64), DType::F32, &create_test_device()).unwrap();
    let params = GenerationParams {
        controlnet_conditioning_scale: 0.5,
        control_guidance_start: 0.5,
        ..create_test_params()
    };
    let inputs = GenerationInputs::new("control").with_control_image(&control);
    t.pipeline
        .generate(inputs, &params, LoopHooks::new())
        .unwrap();
    let scales: Vec<f64> = adapter_calls.borrow().iter().map(|&(_, s)| s).collect();
    assert_eq!(scales, vec![0.0, 0.0, 0.5, 0.5]);
}

// =============================================================================
// Validation
// =============================================================================

#[test]
fn test_negative_prompt_batch_mismatch_before_encoding() {
    let mut t = create_test_pipeline(SchedulerKind::Ddim);
    let err = t.pipeline.text2img(
        PromptInput::from(vec!["a", "b"]),
        Some(vec!["x", "y", "z"].into()),
        &create_test_params(),
        LoopHooks::new(),
    );
    assert!(matches!(
        err,
        Err(DenoiseError::BatchSizeMismatch {
            prompt: 2,
            negative: 3
        })
    ));
    assert_eq!(*t.encodes.borrow(), 0);
    assert!(t.calls.borrow().is_empty());
}

#[test]
fn test_single_entry_negative_list_not_broadcast() {
    let mut t = create_test_pipeline(SchedulerKind::Ddim);
    let err = t.pipeline.text2img(
        PromptInput::from(vec!["a", "b"]),
        Some(vec!["x"].into()),
        &create_test_params(),
        LoopHooks::new(),
    );
    assert!(matches!(
        err,
        Err(DenoiseError::BatchSizeMismatch {
            prompt: 2,
            negative: 1
        })
    ));
    assert_eq!(*t.encodes.borrow(), 0);
}

#[test]
fn test_invalid_arguments_rejected() {
    let mut t = create_test_pipeline(SchedulerKind::Ddim);
    let cases = [
        create_test_params().with_strength(1.5),
        create_test_params().with_steps(0),
        GenerationParams {
            callback_steps: 0,
            ..create_test_params()
        },
        create_test_params().with_size(60, 64),
    ];
    for params in cases {
        let err = t
            .pipeline
            .text2img("bad", None, &params, LoopHooks::new());
        assert!(matches!(err, Err(DenoiseError::InvalidArgument(_))));
    }
    assert_eq!(*t.encodes.borrow(), 0);
}

#[test]
fn test_empty_prompt_batch_rejected() {
    let mut t = create_test_pipeline(SchedulerKind::Ddim);
    let err = t.pipeline.text2img(
        PromptInput::Batch(vec![]),
        None,
        &create_test_params(),
        LoopHooks::new(),
    );
    assert!(matches!(err, Err(DenoiseError::InvalidArgument(_))));
}

#[test]
fn test_mask_without_image_rejected() {
    let mut t = create_test_pipeline(SchedulerKind::Ddim);
    let mask = Tensor::ones((1, 1, 64, 64), DType::F32, &create_test_device()).unwrap();
    let inputs = GenerationInputs::new("mask").with_mask(&mask);
    let err = t
        .pipeline
        .generate(inputs, &create_test_params(), LoopHooks::new());
    assert!(matches!(err, Err(DenoiseError::InvalidArgument(_))));
}

#[test]
fn test_reference_image_size_mismatch() {
    let mut t = create_test_pipeline(SchedulerKind::Ddim);
    let reference = Tensor::zeros((1, 3, 32, 64), DType::F32, &create_test_device()).unwrap();
    let err = t.pipeline.img2img(
        "size",
        None,
        &reference,
        &create_test_params(),
        LoopHooks::new(),
    );
    assert!(matches!(err, Err(DenoiseError::ShapeMismatch { .. })));
}

#[test]
fn test_context_released_after_error() {
    let mut t = create_test_pipeline(SchedulerKind::Ddim);
    let wrong = Tensor::zeros((3, 4, 8, 8), DType::F32, &create_test_device()).unwrap();
    let inputs = GenerationInputs::new("latents").with_latents(wrong);
    let err = t
        .pipeline
        .generate(inputs, &create_test_params(), LoopHooks::new());
    assert!(matches!(err, Err(DenoiseError::ShapeMismatch { .. })));
    assert!(t.pipeline.context().is_idle());
}

#[test]
fn test_supplied_latents_replace_generator_draw() {
    let device = create_test_device();
    let noise = Pcg32::from_seed(99).randn((1, 4, 8, 8), &device).unwrap();
    let run = |seed: u64| {
        let mut t = create_test_pipeline(SchedulerKind::Ddim);
        let inputs = GenerationInputs::new("latents").with_latents(noise.clone());
        latents_of(
            t.pipeline
                .generate(inputs, &create_test_params().with_seed(seed), LoopHooks::new())
                .unwrap(),
        )
    };
    assert_eq!(flat(&run(1)), flat(&run(2)));
}
