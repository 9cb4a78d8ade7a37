//! Host pipeline for one forward pass
//!
//! Per layer the host runs, strictly in order:
//!
//! ```text
//! rmsnorm → qkv (+RoPE) → KV append → transpose → attention
//!         → attout (x += Wo·xb) → rmsnorm → ffn1 → ffn2 (x += W2·hb)
//! ```
//!
//! then a final rmsnorm and the classifier. Each stage writes its inputs
//! into the pool (broadcast or per-unit scatter), launches synchronously,
//! and gathers the results into host buffers that feed the next stage.

use std::ops::Range;
use std::sync::Arc;

use pimlm_device::kernels::{names, sym};
use pimlm_device::UnitPool;
use pimlm_model::{KvCache, LayerWeights, ModelConfig, ModelError, RunState, WeightSet};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::plan::{PoolPlan, Programs};
use crate::reduction::ReductionPlan;
use crate::transpose::{transpose_keys, transpose_values, CacheLayout};

/// Counters across the engine's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub tokens: usize,
    pub launches: usize,
    pub program_loads: usize,
}

/// Distributed forward-pass engine
///
/// Owns the unit pools, host activation buffers and KV cache for one
/// generation run at a time. Not re-entrant: `forward` takes `&mut self`.
pub struct Engine {
    weights: Arc<WeightSet>,
    config: EngineConfig,
    plan: PoolPlan,
    programs: Programs,
    pools: Option<Pools>,
    state: RunState,
    next_pos: usize,
    tokens: usize,
}

impl Engine {
    /// Plan pools and build programs; units are allocated on first use
    ///
    /// Fails with a configuration error when any program exceeds the unit's
    /// scratch budget or bulk capacity.
    pub fn new(weights: Arc<WeightSet>, config: EngineConfig) -> Result<Self> {
        let model = weights.config;
        model.validate()?;
        let plan = PoolPlan::new(&model, &config)?;
        let programs = Programs::build(&model, &config, &plan)?;

        tracing::info!(
            attention = programs.attention,
            tasklets = plan.tasklets,
            shared_units = plan.shared_units,
            head_units = plan.heads,
            ffn1_units = plan.ffn1_units(),
            cls_units = plan.cls_units(),
            reduction_splits = plan.attn_out.splits(),
            parameters = weights.num_parameters(),
            "engine planned"
        );

        let state = RunState::new(&model);
        tracing::debug!(
            kv_cache_bytes = state.kv_cache.memory_bytes(),
            "run state allocated"
        );

        Ok(Self {
            state,
            weights,
            config,
            plan,
            programs,
            pools: None,
            next_pos: 0,
            tokens: 0,
        })
    }

    /// Run one token at `pos` and return the logits
    ///
    /// Position 0 starts a new run and clears the KV cache; any other
    /// position must follow the previous call's. A failure inside the
    /// pipeline ends the run, so the next call must start again at 0.
    pub fn forward(&mut self, token: u32, pos: usize) -> Result<&[f32]> {
        let seq_len = self.weights.config.seq_len;
        if pos >= seq_len {
            return Err(ModelError::PositionOutOfRange {
                position: pos,
                seq_len,
            }
            .into());
        }
        if pos != 0 && pos != self.next_pos {
            return Err(EngineError::PositionOutOfOrder {
                expected: self.next_pos,
                got: pos,
            });
        }
        self.weights.embedding(token)?;

        if pos == 0 {
            self.state.kv_cache.clear();
        }

        match self.run_token(token, pos) {
            Ok(()) => {
                self.next_pos = pos + 1;
                self.tokens += 1;
                Ok(&self.state.logits)
            }
            Err(err) => {
                tracing::warn!(pos, error = %err, "forward failed; run must restart at position 0");
                self.next_pos = 0;
                Err(err)
            }
        }
    }

    /// Discard the current run
    pub fn reset(&mut self) {
        self.state.kv_cache.clear();
        self.next_pos = 0;
    }

    fn run_token(&mut self, token: u32, pos: usize) -> Result<()> {
        if self.pools.is_none() {
            self.pools = Some(Pools::create(
                &self.weights,
                &self.config,
                &self.plan,
                &self.programs,
            )?);
        }

        let Engine {
            weights,
            plan,
            programs,
            pools,
            state,
            ..
        } = self;
        let pools = pools
            .as_mut()
            .ok_or_else(|| EngineError::Config("unit pools unavailable".to_string()))?;
        let model = weights.config;
        let stage = Stage {
            programs,
            plan,
            model: &model,
            pos,
        };

        state.x.copy_from_slice(weights.embedding(token)?);

        for layer in 0..model.n_layers {
            let lw = weights.layer(layer);

            pools.rmsnorm(&state.x, lw.rms_att, &mut state.xb)?;
            pools.qkv(
                &stage,
                &lw,
                &state.xb,
                (&mut state.q[..], &mut state.k[..], &mut state.v[..]),
            )?;
            state.kv_cache.store(layer, pos, &state.k, &state.v)?;
            pools.attention(
                &stage,
                &state.q,
                &state.kv_cache,
                layer,
                &mut state.xb,
                &mut state.att,
            )?;
            pools.residual(
                &stage,
                names::ATTN_OUT,
                sym::V,
                &plan.attn_out,
                &state.xb,
                lw.wo,
                &mut state.x,
            )?;

            pools.rmsnorm(&state.x, lw.rms_ffn, &mut state.xb)?;
            pools.ffn1(&stage, &lw, &state.xb, &mut state.hb)?;
            pools.residual(
                &stage,
                names::FFN2,
                sym::H,
                &plan.ffn2,
                &state.hb,
                lw.w2,
                &mut state.x,
            )?;

            tracing::debug!(layer, pos, "layer complete");
        }

        pools.rmsnorm(&state.x, &weights.rms_final, &mut state.xb)?;
        pools.classify(&stage, &state.xb, &mut state.logits)?;
        Ok(())
    }

    pub fn model_config(&self) -> &ModelConfig {
        &self.weights.config
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn plan(&self) -> &PoolPlan {
        &self.plan
    }

    /// Attention program the head pool runs
    pub fn attention_program(&self) -> &'static str {
        self.programs.attention
    }

    /// Host activation buffers from the last forward pass
    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Softmax weights of head `h` in the last layer of the last pass
    pub fn head_attention(&self, h: usize) -> &[f32] {
        self.state.head_attention(h)
    }

    /// Position the next call must use to continue the run
    pub fn next_position(&self) -> usize {
        self.next_pos
    }

    pub fn pools_ready(&self) -> bool {
        self.pools.is_some()
    }

    pub fn stats(&self) -> EngineStats {
        let (launches, program_loads) = self
            .pools
            .as_ref()
            .map(|p| {
                p.all()
                    .iter()
                    .fold((0, 0), |(l, d), pool| (l + pool.launches(), d + pool.loads()))
            })
            .unwrap_or((0, 0));
        EngineStats {
            tokens: self.tokens,
            launches,
            program_loads,
        }
    }

    /// Program loads performed on the shared QKV/AttnOut/FFN2 pool
    pub fn shared_pool_loads(&self) -> usize {
        self.pools.as_ref().map(|p| p.shared.loads()).unwrap_or(0)
    }
}

/// Read-only context shared by the stages of one token
struct Stage<'a> {
    programs: &'a Programs,
    plan: &'a PoolPlan,
    model: &'a ModelConfig,
    pos: usize,
}

struct Pools {
    rmsnorm: UnitPool,
    shared: UnitPool,
    heads: UnitPool,
    ffn1: UnitPool,
    cls: UnitPool,
}

impl Pools {
    /// Allocate every pool, load the programs that never change and
    /// transfer the data that stays resident
    fn create(
        weights: &WeightSet,
        config: &EngineConfig,
        plan: &PoolPlan,
        programs: &Programs,
    ) -> Result<Self> {
        let device = &config.device;
        let registry = &programs.registry;
        let dim = weights.config.dim;

        let mut rmsnorm = UnitPool::allocate(names::RMSNORM, 1, device)?;
        rmsnorm.load_named(registry, names::RMSNORM)?;

        let shared = UnitPool::allocate("shared", plan.shared_units, device)?;

        let mut heads = UnitPool::allocate(programs.attention, plan.heads, device)?;
        heads.load_named(registry, programs.attention)?;

        let mut ffn1 = UnitPool::allocate(names::FFN1, plan.ffn1_units(), device)?;
        ffn1.load_named(registry, names::FFN1)?;
        let rows: Vec<Vec<u32>> = plan
            .ffn1_bands
            .iter()
            .map(|b| vec![b.len() as u32])
            .collect();
        ffn1.scatter(sym::PARAMS, 0, &rows)?;

        let mut cls = UnitPool::allocate(names::CLS, plan.cls_units(), device)?;
        cls.load_named(registry, names::CLS)?;
        let rows: Vec<Vec<u32>> = plan
            .cls_bands
            .iter()
            .map(|b| vec![b.len() as u32])
            .collect();
        cls.scatter(sym::PARAMS, 0, &rows)?;
        let classifier = weights.classifier();
        let bands: Vec<&[f32]> = plan
            .cls_bands
            .iter()
            .map(|b| &classifier[b.start * dim..b.end * dim])
            .collect();
        cls.scatter(sym::W, 0, &bands)?;
        tracing::info!(
            units = plan.cls_units(),
            words = classifier.len(),
            "classifier weights resident"
        );

        Ok(Self {
            rmsnorm,
            shared,
            heads,
            ffn1,
            cls,
        })
    }

    fn all(&self) -> [&UnitPool; 5] {
        [&self.rmsnorm, &self.shared, &self.heads, &self.ffn1, &self.cls]
    }

    /// `out = rmsnorm(input) · weight` on the single-unit pool
    fn rmsnorm(&mut self, input: &[f32], weight: &[f32], out: &mut [f32]) -> Result<()> {
        let pool = &mut self.rmsnorm;
        pool.broadcast(sym::X, 0, input)?;
        pool.broadcast(sym::W, 0, weight)?;
        pool.broadcast(sym::ACC, 0, &[0.0f32])?;
        pool.launch()?;
        let y = pool.gather::<f32>(sym::Y, 0, &[out.len()])?;
        out.copy_from_slice(&y[0]);
        Ok(())
    }

    /// Q, K and V for the current position, rotated
    fn qkv(
        &mut self,
        stage: &Stage<'_>,
        lw: &LayerWeights<'_>,
        xb: &[f32],
        (q, k, v): (&mut [f32], &mut [f32], &mut [f32]),
    ) -> Result<()> {
        let dim = stage.model.dim;
        let kv_dim = stage.model.kv_dim();
        let bands = &stage.plan.qkv_bands;
        let kv_rows: Vec<usize> = bands
            .iter()
            .map(|b| kv_dim.saturating_sub(b.start).min(b.len()))
            .collect();

        let pool = &mut self.shared;
        pool.ensure_loaded(&stage.programs.registry, names::QKV)?;

        let params: Vec<Vec<u32>> = bands
            .iter()
            .zip(&kv_rows)
            .map(|(b, &kv)| vec![b.start as u32, b.len() as u32, kv as u32, stage.pos as u32])
            .collect();
        pool.scatter(sym::PARAMS, 0, &params)?;
        pool.broadcast(sym::X, 0, xb)?;

        let wq: Vec<&[f32]> = bands
            .iter()
            .map(|b| &lw.wq[b.start * dim..b.end * dim])
            .collect();
        let kv_band = |w: &[f32], b: &Range<usize>, kv: usize| -> Range<usize> {
            let start = b.start.min(w.len() / dim);
            start * dim..(start + kv) * dim
        };
        let wk: Vec<&[f32]> = bands
            .iter()
            .zip(&kv_rows)
            .map(|(b, &kv)| &lw.wk[kv_band(lw.wk, b, kv)])
            .collect();
        let wv: Vec<&[f32]> = bands
            .iter()
            .zip(&kv_rows)
            .map(|(b, &kv)| &lw.wv[kv_band(lw.wv, b, kv)])
            .collect();
        pool.scatter(sym::WQ, 0, &wq)?;
        pool.scatter(sym::WK, 0, &wk)?;
        pool.scatter(sym::WV, 0, &wv)?;

        pool.launch()?;

        let lens: Vec<usize> = bands.iter().map(|b| b.len()).collect();
        for (b, part) in bands.iter().zip(pool.gather::<f32>(sym::Q, 0, &lens)?) {
            q[b.clone()].copy_from_slice(&part);
        }
        for (target, symbol) in [(k, sym::K), (v, sym::V)] {
            let parts = pool.gather::<f32>(symbol, 0, &kv_rows)?;
            for (b, part) in bands.iter().zip(parts) {
                if !part.is_empty() {
                    target[b.start..b.start + part.len()].copy_from_slice(&part);
                }
            }
        }
        tracing::debug!(units = pool.len(), "qkv stage complete");
        Ok(())
    }

    /// Per-head attention over positions `0..=pos`
    ///
    /// Writes the concatenated head outputs into `xb` and each head's
    /// softmax weights into its row of `att`.
    fn attention(
        &mut self,
        stage: &Stage<'_>,
        q: &[f32],
        cache: &KvCache,
        layer: usize,
        xb: &mut [f32],
        att: &mut [f32],
    ) -> Result<()> {
        let model = stage.model;
        let hs = model.head_size();
        let seq_len = model.seq_len;
        let kv_mul = model.kv_mul();
        let len = stage.pos + 1;
        let layout = CacheLayout {
            kv_dim: model.kv_dim(),
            head_size: hs,
            n_kv_heads: model.n_kv_heads,
        };

        let keys = transpose_keys(cache.layer_keys(layer), layout, len);
        let values = transpose_values(cache.layer_values(layer), layout, len, seq_len);

        let pool = &mut self.heads;
        pool.broadcast(sym::PARAMS, 0, &[stage.pos as u32])?;

        let heads = 0..model.n_heads;
        let q_parts: Vec<&[f32]> = heads.clone().map(|h| &q[h * hs..(h + 1) * hs]).collect();
        let k_parts: Vec<&[f32]> = heads
            .clone()
            .map(|h| {
                let kvh = h / kv_mul;
                &keys[kvh * len * hs..(kvh + 1) * len * hs]
            })
            .collect();
        let v_parts: Vec<&[f32]> = heads
            .map(|h| {
                let kvh = h / kv_mul;
                &values[kvh * hs * seq_len..(kvh + 1) * hs * seq_len]
            })
            .collect();
        pool.scatter(sym::Q, 0, &q_parts)?;
        pool.scatter(sym::KC, 0, &k_parts)?;
        pool.scatter(sym::VC, 0, &v_parts)?;

        pool.launch()?;

        let outs = pool.gather::<f32>(sym::OUT, 0, &vec![hs; model.n_heads])?;
        for (h, out) in outs.iter().enumerate() {
            xb[h * hs..(h + 1) * hs].copy_from_slice(out);
        }
        let weights = pool.gather::<f32>(sym::ATT, 0, &vec![seq_len; model.n_heads])?;
        for (h, row) in weights.iter().enumerate() {
            att[h * seq_len..(h + 1) * seq_len].copy_from_slice(row);
        }
        tracing::debug!(layer, heads = model.n_heads, len, "attention stage complete");
        Ok(())
    }

    /// `x += W·input` on the shared pool through `plan`
    #[allow(clippy::too_many_arguments)]
    fn residual(
        &mut self,
        stage: &Stage<'_>,
        program: &str,
        input_symbol: &str,
        plan: &ReductionPlan,
        input: &[f32],
        w: &[f32],
        x: &mut [f32],
    ) -> Result<()> {
        let pool = &mut self.shared;
        pool.ensure_loaded(&stage.programs.registry, program)?;

        pool.scatter(sym::PARAMS, 0, &plan.params())?;
        pool.scatter(input_symbol, 0, &plan.inputs(input))?;
        pool.scatter(sym::W, 0, &plan.weights(w))?;
        pool.scatter(sym::X, 0, &plan.seeds(x))?;

        pool.launch()?;

        let bands = pool.gather::<f32>(sym::X, 0, &plan.lens())?;
        plan.combine(&bands, x)?;
        tracing::debug!(program, units = pool.len(), "residual stage complete");
        Ok(())
    }

    /// `hb = swiglu(W1·xb, W3·xb)`
    fn ffn1(
        &mut self,
        stage: &Stage<'_>,
        lw: &LayerWeights<'_>,
        xb: &[f32],
        hb: &mut [f32],
    ) -> Result<()> {
        let dim = stage.model.dim;
        let bands = &stage.plan.ffn1_bands;
        let pool = &mut self.ffn1;

        pool.broadcast(sym::X, 0, xb)?;
        let w1: Vec<&[f32]> = bands.iter().map(|b| &lw.w1[b.start * dim..b.end * dim]).collect();
        let w3: Vec<&[f32]> = bands.iter().map(|b| &lw.w3[b.start * dim..b.end * dim]).collect();
        pool.scatter(sym::W1, 0, &w1)?;
        pool.scatter(sym::W3, 0, &w3)?;

        pool.launch()?;

        let lens: Vec<usize> = bands.iter().map(|b| b.len()).collect();
        for (b, part) in bands.iter().zip(pool.gather::<f32>(sym::H, 0, &lens)?) {
            hb[b.clone()].copy_from_slice(&part);
        }
        tracing::debug!(units = pool.len(), "ffn1 stage complete");
        Ok(())
    }

    /// Vocabulary logits against the resident classifier
    fn classify(&mut self, stage: &Stage<'_>, x: &[f32], logits: &mut [f32]) -> Result<()> {
        let bands = &stage.plan.cls_bands;
        let pool = &mut self.cls;

        pool.broadcast(sym::X, 0, x)?;
        pool.launch()?;

        let lens: Vec<usize> = bands.iter().map(|b| b.len()).collect();
        for (b, part) in bands.iter().zip(pool.gather::<f32>(sym::LOGITS, 0, &lens)?) {
            logits[b.clone()].copy_from_slice(&part);
        }
        tracing::debug!(units = pool.len(), "classifier stage complete");
        Ok(())
    }
}
