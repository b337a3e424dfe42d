//! MusicGen text-to-music pipeline.
//!
//! ```text
//! prompt → T5 encoder → enc_to_dec_proj ──┐
//!                                          ↓ cross-attention
//!          BOS → codebook decoder (delay pattern, CFG, top-k) → codes [1, K, frames]
//!                                          ↓
//!                              EnCodec decoder → mono waveform
//! ```
//!
//! Weights, config and tokenizer come from a single HuggingFace repo
//! (`facebook/musicgen-small` by default). The request seed drives the token
//! sampler, so identical prompt + seed pairs reproduce the same tokens.

use std::path::Path;

use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{Linear, VarBuilder};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::{encodec, t5};
use hf_hub::api::sync::Api;
use serde_json::Value;
use tokenizers::Tokenizer;

use super::{AudioParams, GeneratedAudio, Pipeline};
use crate::manager::release_device;
use crate::model::musicgen::{DecoderConfig, DelayPattern, DelaySlot, MusicgenDecoder, apply_guidance};
use crate::{Error, Result};

/// Resident MusicGen model.
pub struct MusicGenPipeline {
    tokenizer: Tokenizer,
    text_encoder: t5::T5EncoderModel,
    enc_to_dec_proj: Linear,
    decoder: MusicgenDecoder,
    audio_decoder: encodec::Model,
    sample_rate: u32,
    channels: u16,
    device: Device,
}

impl MusicGenPipeline {
    /// Download (or reuse the cached copy of) `model_id` and load it onto `device`.
    pub fn load(model_id: &str, device: &Device) -> Result<Self> {
        let api = Api::new()?;
        let repo = api.model(model_id.to_string());
        let config = repo.get("config.json")?;
        let weights = repo.get("model.safetensors")?;
        let tokenizer = repo.get("tokenizer.json")?;
        Self::from_files(&config, &weights, &tokenizer, device)
    }

    /// Load from local files laid out like the HuggingFace checkpoint.
    pub fn from_files(
        config_path: &Path,
        weights_path: &Path,
        tokenizer_path: &Path,
        device: &Device,
    ) -> Result<Self> {
        let config: Value = serde_json::from_slice(&std::fs::read(config_path)?)?;
        let text_cfg: t5::Config = serde_json::from_value(section(&config, "text_encoder")?)?;
        let audio_cfg = encodec_config(section(&config, "audio_encoder")?)?;
        let decoder_cfg: DecoderConfig = serde_json::from_value(section(&config, "decoder")?)?;

        let tokenizer = Tokenizer::from_file(tokenizer_path)?;

        // MusicGen is sampled in f32 on every device.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], DType::F32, device)? };
        let text_encoder = t5::T5EncoderModel::load(vb.pp("text_encoder"), &text_cfg)?;
        let enc_to_dec_proj = candle_nn::linear(
            text_cfg.d_model,
            decoder_cfg.hidden_size,
            vb.pp("enc_to_dec_proj"),
        )?;
        let decoder = MusicgenDecoder::load(&decoder_cfg, vb.pp("decoder"))?;
        let audio_decoder = encodec::Model::new(&audio_cfg, vb.pp("audio_encoder"))?;

        tracing::info!(
            device = ?device,
            codebooks = decoder_cfg.num_codebooks,
            layers = decoder_cfg.num_hidden_layers,
            sample_rate = audio_cfg.sampling_rate,
            "MusicGen loaded"
        );

        Ok(Self {
            tokenizer,
            text_encoder,
            enc_to_dec_proj,
            decoder,
            audio_decoder,
            sample_rate: audio_cfg.sampling_rate as u32,
            channels: audio_cfg.audio_channels as u16,
            device: device.clone(),
        })
    }

    /// Text conditioning for the (conditional, unconditional) guidance batch.
    ///
    /// The unconditional half is all zeros after projection.
    fn encode_prompt(&mut self, prompt: &str) -> Result<Tensor> {
        let tokens = self.tokenizer.encode(prompt, true)?.get_ids().to_vec();
        let input_ids = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        let hidden = self.text_encoder.forward(&input_ids)?;
        let cond = self.enc_to_dec_proj.forward(&hidden)?;
        let uncond = cond.zeros_like()?;
        Ok(Tensor::cat(&[&cond, &uncond], 0)?)
    }

    /// Autoregressively sample the delayed codebook streams.
    fn sample_codes(&mut self, encoder_states: &Tensor, params: &AudioParams) -> Result<Tensor> {
        let cfg = self.decoder.config().clone();
        let num_codebooks = cfg.num_codebooks;
        let pattern = DelayPattern::new(num_codebooks, params.max_length);

        let mut sampler = LogitsProcessor::from_sampling(
            params.seed as u64,
            Sampling::TopK {
                k: params.top_k,
                temperature: 1.0,
            },
        );
        let mut streams = vec![vec![cfg.bos_token_id]; num_codebooks];

        for position in 1..params.max_length {
            let previous: Vec<u32> = streams.iter().map(|s| s[position - 1]).collect();
            let input = Tensor::new(previous.as_slice(), &self.device)?
                .reshape((1, num_codebooks, 1))?
                .repeat((2, 1, 1))?;
            let logits = self.decoder.forward(&input, encoder_states, position - 1)?;
            let logits = apply_guidance(&logits, params.guidance_scale)?.to_dtype(DType::F32)?;

            for (codebook, stream) in streams.iter_mut().enumerate() {
                let token = match pattern.slot(codebook, position) {
                    DelaySlot::Bos => cfg.bos_token_id,
                    DelaySlot::Pad => cfg.pad_token_id,
                    DelaySlot::Sample => sampler.sample(&logits.i(codebook)?)?,
                };
                stream.push(token);
            }

            if position % 100 == 0 {
                tracing::debug!(position, max_length = params.max_length, "sampling codes");
            }
        }

        let frames = pattern.num_frames();
        let codes: Vec<u32> = pattern.align(&streams).into_iter().flatten().collect();
        Ok(Tensor::from_vec(codes, (1, num_codebooks, frames), &self.device)?)
    }
}

impl Pipeline for MusicGenPipeline {
    type Params = AudioParams;
    type Output = GeneratedAudio;

    fn generate(&mut self, params: &AudioParams) -> Result<GeneratedAudio> {
        let cfg = self.decoder.config();
        if params.max_length <= cfg.num_codebooks || params.max_length > cfg.max_position_embeddings {
            return Err(Error::Config(format!(
                "max_length must be in ({}, {}], got {}",
                cfg.num_codebooks, cfg.max_position_embeddings, params.max_length
            )));
        }

        self.decoder.clear_cache();
        let encoder_states = self.encode_prompt(&params.prompt)?;
        let codes = self.sample_codes(&encoder_states, params)?;
        let waveform = self.audio_decoder.decode(&codes)?;
        let samples = waveform
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;

        tracing::info!(
            seed = params.seed,
            samples = samples.len(),
            sample_rate = self.sample_rate,
            "music generated"
        );

        Ok(GeneratedAudio {
            samples,
            sample_rate: self.sample_rate,
            channels: self.channels,
        })
    }

    fn release(&mut self) {
        self.decoder.clear_cache();
        release_device(&self.device);
    }
}

fn section(config: &Value, name: &str) -> Result<Value> {
    config
        .get(name)
        .cloned()
        .ok_or_else(|| Error::Config(format!("MusicGen config has no `{name}` section")))
}

/// Parse the `audio_encoder` section, filling keys older checkpoints omit.
///
/// MusicGen's 32 kHz EnCodec uses identity skips, so residual blocks carry no
/// shortcut convolution.
fn encodec_config(mut value: Value) -> Result<encodec::Config> {
    if let Some(obj) = value.as_object_mut() {
        obj.entry("use_conv_shortcut").or_insert(Value::Bool(false));
        obj.entry("codebook_dim").or_insert(Value::Null);
        obj.entry("chunk_length_s").or_insert(Value::Null);
        obj.entry("overlap").or_insert(Value::Null);
    }
    Ok(serde_json::from_value(value)?)
}
