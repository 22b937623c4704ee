use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use conformer_rs::model::{mask, probe};
use conformer_rs::{
    AttentionType, ConformerConfig, ConformerDecoder, ConformerEncoder, DecoderInputs, Diagnostic,
    EncoderInputs, Error,
};

fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    (varmap, vb)
}

fn randn(shape: (usize, usize, usize), device: &Device) -> Tensor {
    Tensor::randn(0.0_f32, 1.0, shape, device).unwrap()
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar()
        .unwrap()
}

fn scenario_config(causal: bool) -> ConformerConfig {
    ConformerConfig {
        kernel_size: 3,
        causal,
        ..ConformerConfig::encoder(2, 16, 64, 4)
    }
}

#[test]
fn chunked_encoder_keeps_shape() {
    let device = Device::Cpu;
    let (_varmap, vb) = make_vb(&device);
    let encoder = ConformerEncoder::load(vb, &scenario_config(false)).unwrap();

    let src = randn((2, 10, 16), &device);
    let pe = randn((1, 19, 16), &device);
    let (out, attn) = encoder
        .forward(
            &src,
            EncoderInputs {
                pos_embs: Some(&pe),
                chunk_size: Some(4),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(out.dims(), &[2, 10, 16]);
    assert_eq!(attn.len(), 2);
}

#[test]
fn causal_encoder_rejects_chunked_convolution() {
    let device = Device::Cpu;
    let (_varmap, vb) = make_vb(&device);
    let encoder = ConformerEncoder::load(vb, &scenario_config(true)).unwrap();

    let src = randn((2, 10, 16), &device);
    let pe = randn((1, 19, 16), &device);
    let err = encoder
        .forward(
            &src,
            EncoderInputs {
                pos_embs: Some(&pe),
                chunk_size: Some(4),
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, Error::CausalChunking));
}

#[test]
fn encoder_feeds_decoder() {
    let device = Device::Cpu;
    let (_varmap, vb) = make_vb(&device);
    let enc_config = ConformerConfig::encoder(2, 32, 64, 4);
    let dec_config = ConformerConfig::decoder(3, 32, 64, 4);

    let encoder = ConformerEncoder::load(vb.pp("encoder"), &enc_config).unwrap();
    let (decoder, diagnostics) = ConformerDecoder::load(vb.pp("decoder"), &dec_config).unwrap();
    assert!(diagnostics.is_empty());

    let src = randn((2, 12, 32), &device);
    let pe = randn((1, 23, 32), &device);
    let lengths = mask::padding_mask_from_lengths(&[12, 9], 12, &device).unwrap();
    let (memory, _) = encoder
        .forward(
            &src,
            EncoderInputs {
                src_key_padding_mask: Some(&lengths),
                pos_embs: Some(&pe),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(memory.dims(), &[2, 12, 32]);

    let tgt = randn((2, 5, 32), &device);
    let (out, self_attns, cross_attns) = decoder
        .forward(
            &tgt,
            &memory,
            DecoderInputs {
                memory_key_padding_mask: Some(&lengths),
                pos_embs_src: Some(&pe),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(out.dims(), &[2, 5, 32]);
    assert_eq!(self_attns.len(), 3);
    assert_eq!(cross_attns.len(), 3);
    assert_eq!(cross_attns[0].dims(), &[2, 4, 5, 12]);
}

#[test]
fn non_causal_decoder_is_built_with_a_diagnostic() {
    let device = Device::Cpu;
    let (_varmap, vb) = make_vb(&device);
    let config = ConformerConfig {
        causal: false,
        ..ConformerConfig::decoder(1, 16, 32, 2)
    };
    let (decoder, diagnostics) = ConformerDecoder::load(vb, &config).unwrap();
    assert_eq!(diagnostics, vec![Diagnostic::NonCausalDecoder { layer: 0 }]);

    let tgt = randn((1, 4, 16), &device);
    let memory = randn((1, 6, 16), &device);
    let pe = randn((1, 11, 16), &device);
    let (out, _, _) = decoder
        .forward(
            &tgt,
            &memory,
            DecoderInputs {
                pos_embs_src: Some(&pe),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(out.dims(), &[1, 4, 16]);
}

#[test]
fn json_config_builds_regular_attention_stack() {
    let json = r#"{
        "num_layers": 2,
        "d_model": 24,
        "d_ffn": 48,
        "nhead": 3,
        "kernel_size": 5,
        "attention_type": "regularMHA",
        "activation": "relu"
    }"#;
    let config = ConformerConfig::from_json_str(json).unwrap();
    assert_eq!(config.attention_type, AttentionType::RegularMha);

    let device = Device::Cpu;
    let (_varmap, vb) = make_vb(&device);
    let encoder = ConformerEncoder::load(vb, &config).unwrap();
    let src = randn((1, 9, 24), &device);
    let (out, attn) = encoder
        .forward(
            &src,
            EncoderInputs {
                chunk_size: Some(3),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(out.dims(), &[1, 9, 24]);
    assert_eq!(attn[1].dims(), &[1, 3, 9, 9]);
}

#[test]
fn length_changing_convolution_is_rejected_at_construction() {
    let device = Device::Cpu;
    let (_varmap, vb) = make_vb(&device);
    let config = ConformerConfig {
        kernel_size: 4,
        ..ConformerConfig::encoder(1, 16, 32, 4)
    };
    assert!(matches!(
        ConformerEncoder::load(vb, &config),
        Err(Error::Config(_))
    ));
}

#[test]
fn inference_is_deterministic_and_training_applies_dropout() {
    let device = Device::Cpu;
    let (_varmap, vb) = make_vb(&device);
    let config = ConformerConfig {
        dropout: 0.5,
        kernel_size: 3,
        ..ConformerConfig::encoder(1, 16, 32, 4)
    };
    let encoder = ConformerEncoder::load(vb, &config).unwrap();
    let src = randn((2, 6, 16), &device);
    let pe = randn((1, 11, 16), &device);

    let eval = EncoderInputs {
        pos_embs: Some(&pe),
        ..Default::default()
    };
    let (a, _) = encoder.forward(&src, eval).unwrap();
    let (b, _) = encoder.forward(&src, eval).unwrap();
    assert_eq!(max_abs_diff(&a, &b), 0.0);

    let (trained, _) = encoder
        .forward(&src, EncoderInputs { train: true, ..eval })
        .unwrap();
    assert!(max_abs_diff(&a, &trained) > 1e-4);
}

#[test]
fn nan_probe_runs_on_every_checkpoint() {
    let device = Device::Cpu;
    let (_varmap, vb) = make_vb(&device);
    let encoder = ConformerEncoder::load(vb, &scenario_config(false))
        .unwrap()
        .with_probe(probe::nan_probe());
    let src = randn((1, 7, 16), &device);
    let pe = randn((1, 13, 16), &device);
    let (out, _) = encoder
        .forward(
            &src,
            EncoderInputs {
                pos_embs: Some(&pe),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(probe::count_nan(&out).unwrap(), 0);
}
