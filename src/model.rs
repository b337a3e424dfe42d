//! Model components implemented in this crate.
//!
//! The T5 text encoder, EnCodec audio codec and the Stable Diffusion stack come
//! from `candle_transformers`; only the MusicGen codebook decoder lives here.
//!
//! - [`musicgen`]: decoder with self/cross attention, KV cache, per-codebook LM heads and the delay pattern

pub mod musicgen;
