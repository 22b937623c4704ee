//! Conformer smoke run — random weights, random input, one forward pass.
//!
//! Builds an encoder (and optionally a decoder attending the encoder output)
//! from a JSON config or built-in defaults, runs it once, and prints a
//! one-line JSON summary to stdout:
//!
//! ```json
//! {"device":"Cpu","encoder_out":[2,50,144],"encoder_layers":4,"elapsed_ms":12.3}
//! ```
//!
//! Exit code 0 on success, non-zero on error.

use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use conformer_rs::{
    AttentionType, ConformerConfig, ConformerDecoder, ConformerEncoder, DecoderInputs,
    EncoderInputs,
};

#[derive(Parser, Debug)]
#[command(
    name = "conformer-smoke",
    about = "Run a random-weight Conformer encoder/decoder once",
    long_about = "Builds a Conformer stack with random weights, runs one forward pass on\n\
                  random input and prints a JSON summary line to stdout."
)]
struct Args {
    /// JSON config file. Missing fields take their defaults.
    #[arg(long)]
    config: Option<String>,

    /// Batch size.
    #[arg(long, short = 'b', default_value_t = 2)]
    batch: usize,

    /// Number of input frames.
    #[arg(long, short = 't', default_value_t = 50)]
    time: usize,

    /// Run the encoder's convolution modules in dynamic chunk mode.
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Also run a decoder over the encoder output.
    #[arg(long)]
    decoder: bool,

    /// Build the decoder without causal convolution.
    #[arg(long)]
    non_causal_decoder: bool,

    /// Number of decoder target frames.
    #[arg(long, default_value_t = 20)]
    target_time: usize,

    /// Random seed for weights and inputs.
    #[arg(long, short = 's')]
    seed: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if args.batch == 0 || args.time == 0 || args.target_time == 0 {
        anyhow::bail!("batch, time and target-time must all be > 0");
    }

    let config = match &args.config {
        Some(path) => ConformerConfig::from_file(path)?,
        None => ConformerConfig::encoder(4, 144, 576, 4),
    };

    let device = Device::cuda_if_available(0)?;
    if let Some(seed) = args.seed {
        device.set_seed(seed)?;
    }
    tracing::info!("Using device: {:?}", device);

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

    let encoder = ConformerEncoder::load(vb.pp("encoder"), &config)?;
    let d_model = config.d_model;
    let needs_pos = config.attention_type == AttentionType::RelPosMhaXl;

    let src = Tensor::randn(0.0_f32, 1.0, (args.batch, args.time, d_model), &device)?;
    let pos_embs = if needs_pos {
        Some(Tensor::randn(
            0.0_f32,
            1.0,
            (1, 2 * args.time - 1, d_model),
            &device,
        )?)
    } else {
        None
    };

    let start = Instant::now();
    let (memory, enc_attn) = encoder.forward(
        &src,
        EncoderInputs {
            pos_embs: pos_embs.as_ref(),
            chunk_size: args.chunk_size,
            ..Default::default()
        },
    )?;

    let mut summary = serde_json::json!({
        "device": format!("{:?}", device),
        "encoder_out": memory.dims(),
        "encoder_layers": enc_attn.len(),
        "chunk_size": args.chunk_size,
    });

    if args.decoder {
        let dec_config = ConformerConfig {
            kernel_size: 3,
            causal: !args.non_causal_decoder,
            ..config.clone()
        };
        let (decoder, diagnostics) = ConformerDecoder::load(vb.pp("decoder"), &dec_config)?;
        for diagnostic in &diagnostics {
            tracing::warn!("{diagnostic}");
        }

        let tgt = Tensor::randn(
            0.0_f32,
            1.0,
            (args.batch, args.target_time, d_model),
            &device,
        )?;
        let (out, self_attns, cross_attns) = decoder.forward(
            &tgt,
            &memory,
            DecoderInputs {
                pos_embs_src: pos_embs.as_ref(),
                ..Default::default()
            },
        )?;
        summary["decoder_out"] = serde_json::json!(out.dims());
        summary["decoder_self_attn"] = serde_json::json!(self_attns.len());
        summary["decoder_cross_attn"] = serde_json::json!(cross_attns
            .first()
            .map(|a| a.dims().to_vec())
            .unwrap_or_default());
        summary["diagnostics"] = serde_json::json!(diagnostics
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>());
    }

    summary["elapsed_ms"] = serde_json::json!(start.elapsed().as_secs_f64() * 1e3);
    println!("{summary}");
    Ok(())
}
