//! PimLM command-line driver
//!
//! ```bash
//! # Greedy generation from a llama2-format checkpoint
//! pimlm generate --checkpoint stories15M.bin --steps 64
//!
//! # Same, on random weights with a small geometry
//! pimlm generate --dim 64 --heads 4 --layers 2 --vocab 512 --steps 16
//!
//! # Engine against the single-threaded reference, step by step
//! pimlm verify --checkpoint stories15M.bin --steps 32 --tolerance 1e-3
//!
//! # Bounded and streaming attention kernels on the same inputs
//! pimlm attention-check --head-size 128 --seq-len 1024 --pos 700
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pimlm_device::kernels::{sym, MhaKernel, MhaStreamingKernel};
use pimlm_device::{DeviceConfig, Kernel, UnitPool};
use pimlm_engine::{AttentionMode, Engine, EngineConfig};
use pimlm_model::{
    compare_vectors, forward_reference, load_checkpoint, ModelConfig, RunState, WeightSet,
};

#[derive(Parser)]
#[command(name = "pimlm")]
#[command(version)]
#[command(about = "Distributed llama-style forward pass on simulated PIM units")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Greedy token generation
    Generate {
        #[command(flatten)]
        model: ModelArgs,

        #[command(flatten)]
        engine: EngineArgs,

        /// First token fed to the model
        #[arg(long, default_value = "1")]
        token: u32,

        /// Number of forward steps
        #[arg(short, long, default_value = "32")]
        steps: usize,

        /// Print the effective configuration as JSON before running
        #[arg(long, default_value = "false")]
        show_config: bool,
    },

    /// Compare engine logits and attention against the reference pass
    Verify {
        #[command(flatten)]
        model: ModelArgs,

        #[command(flatten)]
        engine: EngineArgs,

        #[arg(long, default_value = "1")]
        token: u32,

        #[arg(short, long, default_value = "16")]
        steps: usize,

        /// Largest allowed absolute difference per element
        #[arg(long, default_value = "1e-3")]
        tolerance: f32,
    },

    /// Run bounded and streaming attention on identical random inputs
    AttentionCheck {
        #[arg(long, default_value = "64")]
        head_size: usize,

        #[arg(long, default_value = "256")]
        seq_len: usize,

        /// Query position; defaults to the last one
        #[arg(long)]
        pos: Option<usize>,

        #[arg(short, long, default_value = "16")]
        tasklets: usize,

        #[arg(long, default_value = "128")]
        score_segment: usize,

        #[arg(long, default_value = "64")]
        output_segment: usize,

        #[arg(long, default_value = "64")]
        value_segment: usize,

        #[arg(long, default_value = "7")]
        seed: u64,
    },
}

/// Where the weights come from
#[derive(Args)]
struct ModelArgs {
    /// llama2-format checkpoint; random weights are used when absent
    #[arg(short, long)]
    checkpoint: Option<PathBuf>,

    /// Seed for random weights
    #[arg(long, default_value = "42")]
    seed: u64,

    #[arg(long)]
    dim: Option<usize>,

    #[arg(long)]
    hidden_dim: Option<usize>,

    #[arg(long)]
    layers: Option<usize>,

    #[arg(long)]
    heads: Option<usize>,

    #[arg(long)]
    kv_heads: Option<usize>,

    #[arg(long)]
    vocab: Option<usize>,

    #[arg(long)]
    seq_len: Option<usize>,
}

impl ModelArgs {
    fn load(&self) -> Result<WeightSet> {
        if let Some(path) = &self.checkpoint {
            return load_checkpoint(path)
                .with_context(|| format!("loading checkpoint {}", path.display()));
        }

        let base = ModelConfig::default();
        let config = ModelConfig {
            dim: self.dim.unwrap_or(base.dim),
            hidden_dim: self.hidden_dim.unwrap_or(base.hidden_dim),
            n_layers: self.layers.unwrap_or(base.n_layers),
            n_heads: self.heads.unwrap_or(base.n_heads),
            n_kv_heads: self.kv_heads.or(self.heads).unwrap_or(base.n_kv_heads),
            vocab_size: self.vocab.unwrap_or(base.vocab_size),
            seq_len: self.seq_len.unwrap_or(base.seq_len),
        };
        tracing::info!(seed = self.seed, "using random weights");
        Ok(WeightSet::random(config, self.seed)?)
    }
}

/// Overrides on top of the `PIMLM_*` environment configuration
#[derive(Args)]
struct EngineArgs {
    /// Tasklets per unit
    #[arg(short, long)]
    tasklets: Option<usize>,

    /// auto, bounded or streaming
    #[arg(long)]
    attention: Option<AttentionMode>,

    /// Units cooperating on one row band of the residual projections
    #[arg(long)]
    reduction_splits: Option<usize>,

    /// Matrix-vector streaming segment, in words
    #[arg(long)]
    segment_words: Option<usize>,

    #[arg(long)]
    shared_units: Option<usize>,

    #[arg(long)]
    ffn_units: Option<usize>,

    #[arg(long)]
    cls_units: Option<usize>,
}

impl EngineArgs {
    fn config(&self) -> EngineConfig {
        let mut config = EngineConfig::from_env();
        if let Some(t) = self.tasklets {
            config.device.tasklets = t;
        }
        if let Some(mode) = self.attention {
            config.attention = mode;
        }
        if let Some(s) = self.reduction_splits {
            config.reduction_splits = s;
        }
        if let Some(w) = self.segment_words {
            config.segment_words = w;
        }
        config.units.shared = self.shared_units.or(config.units.shared);
        config.units.ffn1 = self.ffn_units.or(config.units.ffn1);
        config.units.cls = self.cls_units.or(config.units.cls);
        config
    }
}

fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, max), (i, &v)| {
            if v > max {
                (i, v)
            } else {
                (best, max)
            }
        })
        .0 as u32
}

fn run_generate(
    model: &ModelArgs,
    engine_args: &EngineArgs,
    token: u32,
    steps: usize,
    show_config: bool,
) -> Result<()> {
    let weights = Arc::new(model.load()?);
    let config = engine_args.config();
    if show_config {
        println!("{}", serde_json::to_string_pretty(&weights.config)?);
        println!("{}", serde_json::to_string_pretty(&config)?);
    }

    let mut engine = Engine::new(weights.clone(), config)?;
    let steps = steps.min(weights.config.seq_len);
    tracing::info!(
        attention = engine.attention_program(),
        steps,
        "starting generation"
    );

    let start = Instant::now();
    let mut tokens = vec![token];
    let mut next = token;
    for pos in 0..steps {
        let logits = engine.forward(next, pos)?;
        next = argmax(logits);
        tokens.push(next);
    }
    let elapsed = start.elapsed();

    let line: Vec<String> = tokens.iter().map(|t| t.to_string()).collect();
    println!("{}", line.join(" "));

    let stats = engine.stats();
    println!(
        "{} tokens in {:.2?} ({:.2} tok/s), {} launches, {} program loads",
        stats.tokens,
        elapsed,
        stats.tokens as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        stats.launches,
        stats.program_loads
    );
    Ok(())
}

fn run_verify(
    model: &ModelArgs,
    engine_args: &EngineArgs,
    token: u32,
    steps: usize,
    tolerance: f32,
) -> Result<()> {
    let weights = Arc::new(model.load()?);
    let mut engine = Engine::new(weights.clone(), engine_args.config())?;
    let mut state = RunState::new(&weights.config);
    let (n_heads, steps) = (weights.config.n_heads, steps.min(weights.config.seq_len));

    let mut worst = 0.0f32;
    let mut failures = 0;
    let mut next = token;
    for pos in 0..steps {
        let expected = forward_reference(&weights, &mut state, next, pos)?;
        let got = engine.forward(next, pos)?;

        let logits = compare_vectors("logits", got, expected, tolerance);
        worst = worst.max(logits.max_abs_diff);
        if !logits.within_tolerance {
            failures += 1;
            println!(
                "pos {}: logits differ by {} at {}",
                pos, logits.max_abs_diff, logits.index
            );
        }
        next = argmax(expected);

        for h in 0..n_heads {
            let att = compare_vectors(
                "attention",
                &engine.head_attention(h)[..=pos],
                &state.head_attention(h)[..=pos],
                tolerance,
            );
            if !att.within_tolerance {
                failures += 1;
                println!(
                    "pos {} head {}: attention differs by {} at {}",
                    pos, h, att.max_abs_diff, att.index
                );
            }
        }
    }

    println!(
        "{} steps, max logit difference {:.3e}, {} mismatches",
        steps, worst, failures
    );
    if failures > 0 {
        bail!("engine output exceeds tolerance {}", tolerance);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_attention_check(
    head_size: usize,
    seq_len: usize,
    pos: Option<usize>,
    tasklets: usize,
    score_segment: usize,
    output_segment: usize,
    value_segment: usize,
    seed: u64,
) -> Result<()> {
    let pos = pos.unwrap_or(seq_len.saturating_sub(1));
    if pos >= seq_len {
        bail!("position {} is outside a sequence of {}", pos, seq_len);
    }

    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let mut random = |len: usize| -> Vec<f32> {
        (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
    };
    let q = random(head_size);
    let keys = random(seq_len * head_size);
    let values = random(seq_len * head_size);

    // Units get the full scratch budget they ask for; this compares kernels, not budgets
    let run = |kernel: Arc<dyn Kernel>| -> Result<(Vec<f32>, Vec<f32>, usize)> {
        let device = DeviceConfig {
            tasklets,
            scratch_bytes: kernel.scratch_words(tasklets) * 4,
            bulk_bytes: (pimlm_device::layout_words(&kernel.symbols()) * 4).max(4096),
            profile: None,
        };
        let mut pool = UnitPool::allocate(kernel.name(), 1, &device)?;
        pool.load(kernel)?;
        pool.broadcast(sym::PARAMS, 0, &[pos as u32])?;
        pool.broadcast(sym::Q, 0, &q)?;
        pool.broadcast(sym::KC, 0, &keys[..(pos + 1) * head_size])?;
        for o in 0..head_size {
            let column: Vec<f32> = (0..=pos).map(|t| values[t * head_size + o]).collect();
            pool.broadcast(sym::VC, o * seq_len, &column)?;
        }
        let report = pool.launch()?;
        let att = pool.gather::<f32>(sym::ATT, 0, &[seq_len])?.remove(0);
        let out = pool.gather::<f32>(sym::OUT, 0, &[head_size])?.remove(0);
        Ok((att, out, report.scratch_high_water))
    };

    let bounded = MhaKernel { head_size, seq_len };
    let streaming = MhaStreamingKernel {
        head_size,
        seq_len,
        score_segment,
        output_segment,
        value_segment,
    };
    println!(
        "scratch words per unit: bounded {}, streaming {}",
        bounded.scratch_words(tasklets),
        streaming.scratch_words(tasklets)
    );

    let (att_b, out_b, high_b) = run(Arc::new(bounded))?;
    let (att_s, out_s, high_s) = run(Arc::new(streaming))?;
    println!("scratch high water: bounded {}, streaming {}", high_b, high_s);

    let att = compare_vectors("attention", &att_s, &att_b, 0.0);
    let out = compare_vectors("output", &out_s, &out_b, 0.0);
    if !(att.within_tolerance && out.within_tolerance) {
        bail!(
            "streaming attention differs from bounded (attention {:e}, output {:e})",
            att.max_abs_diff,
            out.max_abs_diff
        );
    }
    println!("streaming and bounded attention agree exactly at pos {}", pos);
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pimlm=info,pimlm_engine=info,pimlm_device=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Generate {
            model,
            engine,
            token,
            steps,
            show_config,
        } => run_generate(&model, &engine, token, steps, show_config),
        Commands::Verify {
            model,
            engine,
            token,
            steps,
            tolerance,
        } => run_verify(&model, &engine, token, steps, tolerance),
        Commands::AttentionCheck {
            head_size,
            seq_len,
            pos,
            tasklets,
            score_segment,
            output_segment,
            value_segment,
            seed,
        } => run_attention_check(
            head_size,
            seq_len,
            pos,
            tasklets,
            score_segment,
            output_segment,
            value_segment,
            seed,
        ),
    }
}
