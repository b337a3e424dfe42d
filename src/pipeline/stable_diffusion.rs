//! Stable Diffusion v1.5 text-to-image pipeline.
//!
//! ```text
//! prompt, negative prompt → CLIP text encoder → embeddings [2, 77, 768]
//!                                                 ↓
//!              gaussian latents → UNet + DDIM (CFG) × steps
//!                                                 ↓
//!                                  VAE decoder → RGB8 pixels
//! ```
//!
//! Accelerators run the UNet and VAE in f16 from the `.fp16` weight variants;
//! the CPU path stays in f32. Latent noise is only seeded on accelerators,
//! so CPU runs are not reproducible from the seed alone.

use std::path::PathBuf;

use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    self, StableDiffusionConfig, clip::ClipTextTransformer, schedulers::Scheduler,
    unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
};
use hf_hub::api::sync::Api;
use tokenizers::Tokenizer;

use super::{GeneratedImage, ImageParams, Pipeline};
use crate::config::ImageConfig;
use crate::manager::{is_accelerator, release_device};
use crate::{Error, Result};

/// Latent scaling factor of the v1.x VAE.
const VAE_SCALE: f64 = 0.18215;

/// Latent channels expected by the UNet.
const LATENT_CHANNELS: usize = 4;

/// Local weight files for one Stable Diffusion checkpoint.
#[derive(Debug, Clone)]
pub struct StableDiffusionFiles {
    pub tokenizer: PathBuf,
    pub clip: PathBuf,
    pub unet: PathBuf,
    pub vae: PathBuf,
}

impl StableDiffusionFiles {
    /// Fetch (or reuse cached) weights. `fp16` selects the half-precision variants.
    pub fn fetch(config: &ImageConfig, fp16: bool) -> Result<Self> {
        let api = Api::new()?;
        let suffix = if fp16 { ".fp16" } else { "" };
        let repo = api.model(config.model_id.clone());
        let tokenizer = api.model(config.tokenizer_id.clone()).get("tokenizer.json")?;
        Ok(Self {
            tokenizer,
            clip: repo.get(&format!("text_encoder/model{suffix}.safetensors"))?,
            unet: repo.get(&format!("unet/diffusion_pytorch_model{suffix}.safetensors"))?,
            vae: repo.get(&format!("vae/diffusion_pytorch_model{suffix}.safetensors"))?,
        })
    }
}

/// Resident Stable Diffusion model.
pub struct StableDiffusionPipeline {
    sd_config: StableDiffusionConfig,
    tokenizer: Tokenizer,
    pad_id: u32,
    text_model: ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    dtype: DType,
    device: Device,
}

impl StableDiffusionPipeline {
    /// Download (or reuse cached) weights and load them onto `device`.
    pub fn load(config: &ImageConfig, device: &Device) -> Result<Self> {
        let files = StableDiffusionFiles::fetch(config, is_accelerator(device))?;
        Self::from_files(config, &files, device)
    }

    pub fn from_files(config: &ImageConfig, files: &StableDiffusionFiles, device: &Device) -> Result<Self> {
        let dtype = if is_accelerator(device) { DType::F16 } else { DType::F32 };
        let sd_config =
            StableDiffusionConfig::v1_5(None, Some(config.height), Some(config.width));

        let tokenizer = Tokenizer::from_file(&files.tokenizer)?;
        let pad_token = sd_config.clip.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = tokenizer
            .token_to_id(pad_token)
            .ok_or_else(|| Error::Config(format!("tokenizer has no `{pad_token}` token")))?;

        let text_model =
            stable_diffusion::build_clip_transformer(&sd_config.clip, &files.clip, device, DType::F32)?;
        let unet = sd_config.build_unet(&files.unet, device, LATENT_CHANNELS, false, dtype)?;
        let vae = sd_config.build_vae(&files.vae, device, dtype)?;

        tracing::info!(device = ?device, dtype = ?dtype, "Stable Diffusion loaded");

        Ok(Self {
            sd_config,
            tokenizer,
            pad_id,
            text_model,
            unet,
            vae,
            dtype,
            device: device.clone(),
        })
    }

    /// Encode `text` to CLIP hidden states, padded to the context length.
    fn embed(&self, text: &str) -> Result<Tensor> {
        let max_len = self.sd_config.clip.max_position_embeddings;
        let mut tokens = self.tokenizer.encode(text, true)?.get_ids().to_vec();
        if tokens.len() > max_len {
            tracing::debug!(tokens = tokens.len(), max_len, "prompt truncated");
            tokens.truncate(max_len);
        }
        tokens.resize(max_len, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.text_model.forward(&tokens)?)
    }

    /// Unconditional (negative) and conditional embeddings, stacked in that order.
    fn text_embeddings(&self, params: &ImageParams) -> Result<Tensor> {
        let cond = self.embed(&params.prompt)?;
        let uncond = self.embed(params.negative_prompt.as_deref().unwrap_or(""))?;
        Ok(Tensor::cat(&[uncond, cond], 0)?.to_dtype(self.dtype)?)
    }
}

impl Pipeline for StableDiffusionPipeline {
    type Params = ImageParams;
    type Output = GeneratedImage;

    fn generate(&mut self, params: &ImageParams) -> Result<GeneratedImage> {
        if params.width % 8 != 0 || params.height % 8 != 0 {
            return Err(Error::Config(format!(
                "image size must be a multiple of 8, got {}x{}",
                params.width, params.height
            )));
        }

        let text_embeddings = self.text_embeddings(params)?;

        if is_accelerator(&self.device) {
            self.device.set_seed(params.seed as u64)?;
        } else {
            tracing::debug!(seed = params.seed, "CPU latents are not seeded");
        }

        let mut scheduler = self.sd_config.build_scheduler(params.steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let latents = Tensor::randn(
            0f32,
            1f32,
            (1, LATENT_CHANNELS, params.height / 8, params.width / 8),
            &self.device,
        )?;
        let mut latents = (latents * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?;

        for (index, &timestep) in timesteps.iter().enumerate() {
            let input = Tensor::cat(&[&latents, &latents], 0)?;
            let input = scheduler.scale_model_input(input, timestep)?;
            let noise = self.unet.forward(&input, timestep as f64, &text_embeddings)?;
            let noise = noise.chunk(2, 0)?;
            let (uncond, cond) = (&noise[0], &noise[1]);
            let noise = (uncond + ((cond - uncond)? * params.guidance_scale)?)?;
            latents = scheduler.step(&noise, timestep, &latents)?;
            tracing::debug!(step = index + 1, steps = timesteps.len(), "denoising");
        }

        let decoded = self.vae.decode(&(latents / VAE_SCALE)?)?;
        let decoded = ((decoded / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let decoded = (decoded.to_dtype(DType::F32)?.clamp(0f32, 1f32)? * 255.)?.to_dtype(DType::U8)?;
        let (_, height, width) = decoded.i(0)?.dims3()?;
        let pixels = decoded.i(0)?.permute((1, 2, 0))?.flatten_all()?.to_vec1::<u8>()?;

        tracing::info!(seed = params.seed, width, height, steps = params.steps, "image generated");

        Ok(GeneratedImage {
            width: width as u32,
            height: height as u32,
            pixels,
        })
    }

    fn release(&mut self) {
        release_device(&self.device);
    }
}
