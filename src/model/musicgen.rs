//! MusicGen codebook decoder.
//!
//! A pre-norm transformer decoder over `K` parallel EnCodec codebooks:
//!
//! ```text
//! Σ_k embed_k(code_k) + sinusoidal(pos)
//!         ↓
//! 24 × [self-attn → cross-attn(text) → GELU FFN]
//!         ↓
//! layer_norm → lm_head_k   (one head per codebook)
//! ```
//!
//! Attention projections and FFN layers carry no bias. Positions are not stored
//! in the checkpoint and are rebuilt here. The decoder keeps a self-attention
//! KV cache plus projected cross-attention keys/values between steps; call
//! [`MusicgenDecoder::clear_cache`] before each new sequence.

use candle_core::{DType, Device, IndexOp, Module, Result, Tensor};
use candle_nn::{Embedding, LayerNorm, Linear, VarBuilder};
use serde::Deserialize;

/// Decoder section of the MusicGen `config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct DecoderConfig {
    pub vocab_size: usize,
    pub max_position_embeddings: usize,
    pub num_hidden_layers: usize,
    pub ffn_dim: usize,
    pub num_attention_heads: usize,
    pub hidden_size: usize,
    pub num_codebooks: usize,
    pub pad_token_id: u32,
    pub bos_token_id: u32,
    #[serde(default)]
    pub scale_embedding: bool,
}

impl DecoderConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

/// What the delay pattern puts at a given position of a codebook stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelaySlot {
    /// Still inside the codebook's start delay.
    Bos,
    /// A real token to be sampled.
    Sample,
    /// Past the codebook's last frame.
    Pad,
}

/// MusicGen's delay pattern: codebook `k` runs `k` steps behind codebook 0.
///
/// For a decoder length of `max_length` (BOS included) every codebook ends up
/// with exactly `max_length - num_codebooks` sampled frames.
#[derive(Debug, Clone, Copy)]
pub struct DelayPattern {
    pub num_codebooks: usize,
    pub max_length: usize,
}

impl DelayPattern {
    pub fn new(num_codebooks: usize, max_length: usize) -> Self {
        Self {
            num_codebooks,
            max_length,
        }
    }

    /// Number of audio frames the pattern yields per codebook.
    pub fn num_frames(&self) -> usize {
        self.max_length.saturating_sub(self.num_codebooks)
    }

    pub fn slot(&self, codebook: usize, position: usize) -> DelaySlot {
        if position <= codebook {
            DelaySlot::Bos
        } else if position + self.num_codebooks > self.max_length + codebook {
            DelaySlot::Pad
        } else {
            DelaySlot::Sample
        }
    }

    /// Undo the delay: frame `i` of codebook `k` sits at position `k + 1 + i`.
    pub fn align(&self, streams: &[Vec<u32>]) -> Vec<Vec<u32>> {
        let frames = self.num_frames();
        streams
            .iter()
            .enumerate()
            .map(|(k, stream)| stream.iter().skip(k + 1).take(frames).copied().collect())
            .collect()
    }
}

/// Sinusoidal position table `[num_positions, dim]`, cosine half first.
pub fn sinusoidal_positions(num_positions: usize, dim: usize, device: &Device) -> Result<Tensor> {
    let half = dim / 2;
    let scale = (10_000f64).ln() / (half as f64 - 1.0);
    let inv_freq: Vec<f32> = (0..half)
        .map(|i| (-(i as f64) * scale).exp() as f32)
        .collect();
    let inv_freq = Tensor::from_vec(inv_freq, (1, half), device)?;
    let positions = Tensor::arange(0u32, num_positions as u32, device)?
        .to_dtype(DType::F32)?
        .unsqueeze(1)?;
    let freqs = positions.broadcast_mul(&inv_freq)?;
    Tensor::cat(&[freqs.cos()?, freqs.sin()?], 1)
}

/// Scaled dot-product attention without bias terms.
#[derive(Debug, Clone)]
struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scaling: f64,
    kv_cache: Option<(Tensor, Tensor)>,
}

impl Attention {
    fn load(cfg: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let h = cfg.hidden_size;
        let head_dim = cfg.head_dim();
        Ok(Self {
            q_proj: candle_nn::linear_no_bias(h, h, vb.pp("q_proj"))?,
            k_proj: candle_nn::linear_no_bias(h, h, vb.pp("k_proj"))?,
            v_proj: candle_nn::linear_no_bias(h, h, vb.pp("v_proj"))?,
            out_proj: candle_nn::linear_no_bias(h, h, vb.pp("out_proj"))?,
            num_heads: cfg.num_attention_heads,
            head_dim,
            scaling: (head_dim as f64).powf(-0.5),
            kv_cache: None,
        })
    }

    /// `[B, S, H*D]` → `[B, H, S, D]`
    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, s, _) = xs.dims3()?;
        xs.reshape((b, s, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn attend(&self, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
        let (b, _, s, _) = q.dims4()?;
        let scores = q.matmul(&k.transpose(2, 3)?.contiguous()?)?;
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        let out = probs.matmul(v)?; // [B, H, S, D]
        let out = out
            .transpose(1, 2)?
            .reshape((b, s, self.num_heads * self.head_dim))?;
        self.out_proj.forward(&out)
    }

    /// Causal self-attention over the cached prefix plus `xs`.
    ///
    /// `xs` holds only new positions, so no mask is needed when stepping one
    /// token at a time.
    fn forward_self(&mut self, xs: &Tensor) -> Result<Tensor> {
        let q = self.split_heads(&(self.q_proj.forward(xs)? * self.scaling)?)?;
        let k = self.split_heads(&self.k_proj.forward(xs)?)?;
        let v = self.split_heads(&self.v_proj.forward(xs)?)?;
        let (k, v) = match &self.kv_cache {
            Some((prev_k, prev_v)) => (
                Tensor::cat(&[prev_k, &k], 2)?,
                Tensor::cat(&[prev_v, &v], 2)?,
            ),
            None => (k, v),
        };
        self.kv_cache = Some((k.clone(), v.clone()));
        self.attend(&q, &k, &v)
    }

    /// Cross-attention to the projected text encoding. Keys/values are computed once.
    fn forward_cross(&mut self, xs: &Tensor, encoder_states: &Tensor) -> Result<Tensor> {
        let q = self.split_heads(&(self.q_proj.forward(xs)? * self.scaling)?)?;
        let (k, v) = match self.kv_cache.clone() {
            Some(kv) => kv,
            None => {
                let k = self.split_heads(&self.k_proj.forward(encoder_states)?)?;
                let v = self.split_heads(&self.v_proj.forward(encoder_states)?)?;
                self.kv_cache = Some((k.clone(), v.clone()));
                (k, v)
            }
        };
        self.attend(&q, &k, &v)
    }

    fn clear_cache(&mut self) {
        self.kv_cache = None;
    }
}

#[derive(Debug, Clone)]
struct DecoderLayer {
    self_attn: Attention,
    self_attn_layer_norm: LayerNorm,
    encoder_attn: Attention,
    encoder_attn_layer_norm: LayerNorm,
    fc1: Linear,
    fc2: Linear,
    final_layer_norm: LayerNorm,
}

impl DecoderLayer {
    fn load(cfg: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let h = cfg.hidden_size;
        Ok(Self {
            self_attn: Attention::load(cfg, vb.pp("self_attn"))?,
            self_attn_layer_norm: candle_nn::layer_norm(h, 1e-5, vb.pp("self_attn_layer_norm"))?,
            encoder_attn: Attention::load(cfg, vb.pp("encoder_attn"))?,
            encoder_attn_layer_norm: candle_nn::layer_norm(
                h,
                1e-5,
                vb.pp("encoder_attn_layer_norm"),
            )?,
            fc1: candle_nn::linear_no_bias(h, cfg.ffn_dim, vb.pp("fc1"))?,
            fc2: candle_nn::linear_no_bias(cfg.ffn_dim, h, vb.pp("fc2"))?,
            final_layer_norm: candle_nn::layer_norm(h, 1e-5, vb.pp("final_layer_norm"))?,
        })
    }

    fn forward(&mut self, xs: &Tensor, encoder_states: &Tensor) -> Result<Tensor> {
        let residual = xs;
        let h = self
            .self_attn
            .forward_self(&self.self_attn_layer_norm.forward(xs)?)?;
        let xs = (residual + h)?;

        let residual = &xs;
        let h = self.encoder_attn.forward_cross(
            &self.encoder_attn_layer_norm.forward(&xs)?,
            encoder_states,
        )?;
        let xs = (residual + h)?;

        let residual = &xs;
        let h = self
            .fc2
            .forward(&self.fc1.forward(&self.final_layer_norm.forward(&xs)?)?.gelu_erf()?)?;
        residual + h
    }

    fn clear_cache(&mut self) {
        self.self_attn.clear_cache();
        self.encoder_attn.clear_cache();
    }
}

/// The full decoder with one embedding table and one LM head per codebook.
#[derive(Debug, Clone)]
pub struct MusicgenDecoder {
    embed_tokens: Vec<Embedding>,
    positions: Tensor,
    layers: Vec<DecoderLayer>,
    layer_norm: LayerNorm,
    lm_heads: Vec<Linear>,
    embed_scale: f64,
    cfg: DecoderConfig,
}

impl MusicgenDecoder {
    /// Load from the `decoder` prefix of a MusicGen checkpoint.
    pub fn load(cfg: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let model_vb = vb.pp("model").pp("decoder");
        let h = cfg.hidden_size;

        // +1 row for the shared BOS/PAD id.
        let embed_tokens = (0..cfg.num_codebooks)
            .map(|k| candle_nn::embedding(cfg.vocab_size + 1, h, model_vb.pp("embed_tokens").pp(k)))
            .collect::<Result<Vec<_>>>()?;
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| DecoderLayer::load(cfg, model_vb.pp("layers").pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let layer_norm = candle_nn::layer_norm(h, 1e-5, model_vb.pp("layer_norm"))?;
        let lm_heads = (0..cfg.num_codebooks)
            .map(|k| candle_nn::linear_no_bias(h, cfg.vocab_size, vb.pp("lm_heads").pp(k)))
            .collect::<Result<Vec<_>>>()?;
        let positions = sinusoidal_positions(cfg.max_position_embeddings, h, vb.device())?
            .to_dtype(vb.dtype())?;
        let embed_scale = if cfg.scale_embedding {
            (h as f64).sqrt()
        } else {
            1.0
        };

        Ok(Self {
            embed_tokens,
            positions,
            layers,
            layer_norm,
            lm_heads,
            embed_scale,
            cfg: cfg.clone(),
        })
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.cfg
    }

    /// Decode new positions and return logits for the last one.
    ///
    /// - `codes`: `[B, K, S]` token ids (u32) starting at position `offset`
    /// - `encoder_states`: `[B, T, hidden]` projected text encoding
    ///
    /// Returns `[B, K, vocab]`.
    pub fn forward(&mut self, codes: &Tensor, encoder_states: &Tensor, offset: usize) -> Result<Tensor> {
        let (_b, num_codebooks, seq_len) = codes.dims3()?;
        if num_codebooks != self.embed_tokens.len() {
            candle_core::bail!(
                "expected {} codebooks, got {num_codebooks}",
                self.embed_tokens.len()
            );
        }

        let mut inputs = self.embed_tokens[0].forward(&codes.i((.., 0, ..))?.contiguous()?)?;
        for (k, embed) in self.embed_tokens.iter().enumerate().skip(1) {
            inputs = (inputs + embed.forward(&codes.i((.., k, ..))?.contiguous()?)?)?;
        }
        let inputs = (inputs * self.embed_scale)?;
        let positions = self.positions.narrow(0, offset, seq_len)?;
        let mut xs = inputs.broadcast_add(&positions)?;

        for layer in self.layers.iter_mut() {
            xs = layer.forward(&xs, encoder_states)?;
        }
        let xs = self.layer_norm.forward(&xs)?;
        let last = xs.i((.., seq_len - 1, ..))?;

        let logits = self
            .lm_heads
            .iter()
            .map(|head| head.forward(&last))
            .collect::<Result<Vec<_>>>()?;
        Tensor::stack(&logits, 1)
    }

    pub fn clear_cache(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.clear_cache();
        }
    }
}

/// Classifier-free guidance over a `[2, ...]` batch of (conditional, unconditional) logits.
pub fn apply_guidance(logits: &Tensor, scale: f64) -> Result<Tensor> {
    let cond = logits.i(0)?;
    let uncond = logits.i(1)?;
    &uncond + ((cond - &uncond)? * scale)?
}
