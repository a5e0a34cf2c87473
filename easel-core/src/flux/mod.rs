use std::path::PathBuf;

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::clip::text_model::{
    Activation, ClipTextConfig, ClipTextTransformer,
};
use candle_transformers::models::flux::{
    autoencoder::{self, AutoEncoder},
    model, quantized_model, sampling, WithForward,
};
use candle_transformers::models::t5::{self, T5EncoderModel};
use candle_transformers::quantized_var_builder;
use image::DynamicImage;
use tokenizers::Tokenizer;
use tokio_util::sync::CancellationToken;

use crate::engine::{checkpoint, preview_due, Engine, EngineConfig};
use crate::provision::{hub_cache, local_path};
use crate::registry::{self, FluxVariant, ModelSpec, WeightFile};
use crate::{
    select_best_device, seeded_noise, tensor_to_image, tier, DeviceMap, EngineError,
    NormalizedRequest, Progress, ResourceTier,
};

/// T5 prompts are padded to this many tokens.
const T5_SEQUENCE_LEN: usize = 256;

/// Below this working-set budget the text encoders are dropped once the
/// prompt is embedded.
const RESIDENT_ENCODER_MIN_BUDGET: u64 = 256 * 1024 * 1024;

/// Channels of the autoencoder decoder at full output resolution.
const DECODER_FULL_RES_CHANNELS: u64 = 128;

/// Full-resolution decoder tensors alive at the same time.
const DECODER_LIVE_TENSORS: u64 = 3;

/// Peak activation memory of decoding a `width`x`height` image. The final
/// decoder blocks dominate the per-request working set.
fn decode_working_set(width: u32, height: u32, dtype: DType) -> u64 {
    u64::from(width)
        * u64::from(height)
        * DECODER_FULL_RES_CHANNELS
        * DECODER_LIVE_TENSORS
        * dtype.size_in_bytes() as u64
}

struct TextEncoders {
    t5_model: T5EncoderModel,
    t5_tokenizer: Tokenizer,
    clip_model: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
}

impl TextEncoders {
    fn embed(&mut self, prompt: &str, device: &Device) -> Result<(Tensor, Tensor)> {
        let mut t5_tokens = self
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        t5_tokens.resize(T5_SEQUENCE_LEN, 0);
        let input_token_ids = Tensor::new(&*t5_tokens, device)?.unsqueeze(0)?;
        let t5_emb = self.t5_model.forward(&input_token_ids)?;

        let clip_tokens = self
            .clip_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let input_token_ids_clip = Tensor::new(&*clip_tokens, device)?.unsqueeze(0)?;
        let clip_emb = self.clip_model.forward(&input_token_ids_clip)?;

        Ok((t5_emb, clip_emb))
    }
}

enum Denoiser {
    Full(model::Flux),
    Quantized(quantized_model::Flux),
}

impl Denoiser {
    #[allow(clippy::too_many_arguments)]
    fn forward(
        &self,
        img: &Tensor,
        img_ids: &Tensor,
        txt: &Tensor,
        txt_ids: &Tensor,
        timesteps: &Tensor,
        y: &Tensor,
        guidance: Option<&Tensor>,
    ) -> candle_core::Result<Tensor> {
        match self {
            Denoiser::Full(m) => m.forward(img, img_ids, txt, txt_ids, timesteps, y, guidance),
            Denoiser::Quantized(m) => {
                m.forward(img, img_ids, txt, txt_ids, timesteps, y, guidance)
            }
        }
    }

    /// Dtype of the latent state the denoiser works on.
    fn latent_dtype(&self, model_dtype: DType) -> DType {
        match self {
            Denoiser::Full(_) => model_dtype,
            Denoiser::Quantized(_) => DType::F32,
        }
    }
}

/// FLUX.1 running on candle.
pub struct FluxEngine {
    device: Device,
    dtype: DType,
    variant: FluxVariant,
    tier: ResourceTier,
    encoders: Option<TextEncoders>,
    release_encoders: bool,
    autoencoder: AutoEncoder,
    denoiser: Denoiser,
}

/// Local weight paths for one session.
struct WeightPaths {
    t5_weights: PathBuf,
    t5_config: PathBuf,
    t5_tokenizer: PathBuf,
    clip_weights: PathBuf,
    clip_tokenizer: PathBuf,
    autoencoder: PathBuf,
    denoiser: PathBuf,
}

impl WeightPaths {
    fn resolve(model_spec: &ModelSpec, config: &EngineConfig) -> Result<Self, EngineError> {
        let cache = hub_cache(config.cache_dir.as_deref());
        let path = |weight: WeightFile| {
            local_path(&cache, &weight).ok_or_else(|| {
                EngineError::Resource(format!(
                    "{}/{} is not in the local model cache",
                    weight.repo, weight.file
                ))
            })
        };
        let denoiser = if config.quantized() {
            model_spec.quantized_denoiser
        } else {
            model_spec.denoiser
        };
        Ok(Self {
            t5_weights: path(registry::T5_WEIGHTS)?,
            t5_config: path(registry::T5_CONFIG)?,
            t5_tokenizer: path(registry::T5_TOKENIZER)?,
            clip_weights: path(registry::CLIP_WEIGHTS)?,
            clip_tokenizer: path(registry::CLIP_TOKENIZER)?,
            autoencoder: path(model_spec.autoencoder)?,
            denoiser: path(denoiser)?,
        })
    }
}

impl FluxEngine {
    /// Load a session from weights already present in the local cache.
    pub fn load(
        model_spec: &ModelSpec,
        variant: FluxVariant,
        config: &EngineConfig,
        device_map: DeviceMap,
        cancel: &CancellationToken,
    ) -> Result<Self, EngineError> {
        let paths = WeightPaths::resolve(model_spec, config)?;
        Self::load_from(&paths, variant, config.tier, device_map, cancel)
    }

    fn load_from(
        paths: &WeightPaths,
        variant: FluxVariant,
        tier: ResourceTier,
        device_map: DeviceMap,
        cancel: &CancellationToken,
    ) -> Result<Self, EngineError> {
        let quantized = tier.quantized();
        let device = select_best_device(device_map).context("failed to set up device")?;
        let dtype = device.bf16_default_to_f32();

        // --- T5 model and tokenizer ---
        let t5_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[&paths.t5_weights], dtype, &device)
                .context("failed to build T5 var builder")?
        };
        let config_str =
            std::fs::read_to_string(&paths.t5_config).context("failed to read T5 config")?;
        let t5_config: t5::Config =
            serde_json::from_str(&config_str).context("failed to parse T5 config")?;
        let t5_model =
            T5EncoderModel::load(t5_vb, &t5_config).context("failed to load T5 model")?;
        let t5_tokenizer = Tokenizer::from_file(&paths.t5_tokenizer)
            .map_err(Error::msg)
            .context("failed to load T5 tokenizer")?;

        checkpoint(cancel)?;

        // --- CLIP model and tokenizer ---
        let clip_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[&paths.clip_weights], dtype, &device)
                .context("failed to build CLIP var builder")?
        };
        let clip_config = ClipTextConfig {
            vocab_size: 49408,
            projection_dim: 768,
            activation: Activation::QuickGelu,
            intermediate_size: 3072,
            embed_dim: 768,
            max_position_embeddings: 77,
            pad_with: None,
            num_hidden_layers: 12,
            num_attention_heads: 12,
        };
        let clip_model = ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_config)
            .context("failed to load CLIP model")?;
        let clip_tokenizer = Tokenizer::from_file(&paths.clip_tokenizer)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;

        checkpoint(cancel)?;

        // --- Autoencoder ---
        let autoencoder_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[&paths.autoencoder], dtype, &device)
                .context("failed to build autoencoder var builder")?
        };
        let autoencoder_config = match variant {
            FluxVariant::Schnell => autoencoder::Config::schnell(),
            FluxVariant::Dev => autoencoder::Config::dev(),
        };
        let autoencoder = AutoEncoder::new(&autoencoder_config, autoencoder_vb)
            .context("failed to load autoencoder")?;

        checkpoint(cancel)?;

        // --- Denoiser ---
        let flux_config = match variant {
            FluxVariant::Schnell => model::Config::schnell(),
            FluxVariant::Dev => model::Config::dev(),
        };
        let denoiser = if quantized {
            let vb = quantized_var_builder::VarBuilder::from_gguf(&paths.denoiser, &device)
                .context("failed to read quantized flux weights")?;
            Denoiser::Quantized(
                quantized_model::Flux::new(&flux_config, vb)
                    .context("failed to load quantized flux model")?,
            )
        } else {
            let vb = unsafe {
                candle_nn::VarBuilder::from_mmaped_safetensors(&[&paths.denoiser], dtype, &device)
                    .context("failed to build flux var builder")?
            };
            Denoiser::Full(model::Flux::new(&flux_config, vb).context("failed to load flux model")?)
        };

        let release_encoders =
            tier::working_set_budget().is_some_and(|budget| budget < RESIDENT_ENCODER_MIN_BUDGET);

        checkpoint(cancel)?;
        tracing::info!(?variant, quantized, release_encoders, "Flux session loaded");

        Ok(Self {
            device,
            dtype,
            variant,
            tier,
            encoders: Some(TextEncoders {
                t5_model,
                t5_tokenizer,
                clip_model,
                clip_tokenizer,
            }),
            release_encoders,
            autoencoder,
            denoiser,
        })
    }

    fn decode(&self, latent: &Tensor, height: usize, width: usize) -> Result<DynamicImage> {
        let unpacked = sampling::unpack(latent, height, width)?.to_dtype(self.dtype)?;
        let decoded = self.autoencoder.decode(&unpacked)?;
        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        tensor_to_image(&img.i(0)?)
    }
}

impl Engine for FluxEngine {
    fn generate(
        &mut self,
        request: &NormalizedRequest,
        on_progress: &mut dyn FnMut(Progress),
        on_preview: &mut dyn FnMut(DynamicImage),
        cancel: &CancellationToken,
    ) -> Result<DynamicImage, EngineError> {
        let working_set = decode_working_set(request.width, request.height, self.dtype);
        if !self.tier.admits(working_set) {
            return Err(EngineError::Resource(format!(
                "{}x{} needs about {} MiB to decode, above the {} tier ceiling",
                request.width,
                request.height,
                working_set / (1024 * 1024),
                self.tier
            )));
        }

        let width = request.width as usize;
        let height = request.height as usize;
        if request.negative_prompt.is_some() {
            tracing::debug!("Flux ignores negative prompts");
        }

        let encoders = self
            .encoders
            .as_mut()
            .ok_or_else(|| EngineError::pipeline("text encoders were released by an earlier run"))?;
        let (t5_emb, clip_emb) = encoders.embed(&request.prompt, &self.device)?;
        if self.release_encoders {
            self.encoders = None;
            tracing::debug!("Released text encoders");
        }

        let latent_dtype = self.denoiser.latent_dtype(self.dtype);
        let noise = seeded_noise(request.seed, height, width, &self.device)?.to_dtype(latent_dtype)?;
        let state = sampling::State::new(
            &t5_emb.to_dtype(latent_dtype)?,
            &clip_emb.to_dtype(latent_dtype)?,
            &noise,
        )?;
        let timesteps = match self.variant {
            FluxVariant::Schnell => sampling::get_schedule(request.steps as usize, None),
            FluxVariant::Dev => {
                sampling::get_schedule(request.steps as usize, Some((state.img.dim(1)?, 0.5, 1.15)))
            }
        };

        let total = timesteps.len().saturating_sub(1) as u32;
        let b_sz = state.img.dim(0)?;
        let guidance = Tensor::full(request.guidance_scale, b_sz, &self.device)?;
        let mut img = state.img.clone();

        for (index, window) in timesteps.windows(2).enumerate() {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let (t_curr, t_prev) = (window[0], window[1]);
            let t_vec = Tensor::full(t_curr as f32, b_sz, &self.device)?;
            let pred = self.denoiser.forward(
                &img,
                &state.img_ids,
                &state.txt,
                &state.txt_ids,
                &t_vec,
                &state.vec,
                Some(&guidance),
            )?;
            img = (img + pred * (t_prev - t_curr))?;

            let completed = index as u32 + 1;
            on_progress(Progress::new(completed, total));
            if preview_due(completed, total) {
                on_preview(self.decode(&img, height, width)?);
            }
        }

        Ok(self.decode(&img, height, width)?)
    }
}
