use std::path::Path;

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::{
    clip::text_model::{self, ClipTextTransformer},
    flux::{self, autoencoder::AutoEncoder},
    t5::{self, T5EncoderModel},
};
use hf_hub::api::sync::Api;
use tokenizers::Tokenizer;
use tracing::{debug, error, info, warn};

mod variant;

pub use variant::FluxVariant;

use crate::{
    select_best_device, tensor_to_rgb, DeviceMap, Engine, GenerationFailure, GenerationRequest,
};

/// FLUX latents are packed in 2x2 patches over an 8x downsampled image.
const DIMENSION_MULTIPLE: u32 = 16;

/// Where the candle engine finds the pieces that are not passed to `load_model`.
#[derive(Debug, Clone)]
pub struct FluxConfig {
    pub device_map: DeviceMap,
    pub t5_repo: String,
    pub t5_revision: String,
    pub t5_tokenizer_repo: String,
    pub t5_tokenizer_file: String,
    pub clip_repo: String,
}

impl Default for FluxConfig {
    fn default() -> Self {
        Self {
            device_map: DeviceMap::default(),
            t5_repo: "google/t5-v1_1-xxl".to_string(),
            t5_revision: "refs/pr/2".to_string(),
            t5_tokenizer_repo: "lmz/mt5-tokenizers".to_string(),
            t5_tokenizer_file: "t5-v1_1-xxl.tokenizer.json".to_string(),
            clip_repo: "openai/clip-vit-large-patch14".to_string(),
        }
    }
}

enum Transformer {
    Full(flux::model::Flux),
    Quantized(flux::quantized_model::Flux),
}

struct FluxModel {
    variant: FluxVariant,
    device: Device,
    dtype: DType,
    t5_model: T5EncoderModel,
    t5_tokenizer: Tokenizer,
    clip_model: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
    autoencoder: AutoEncoder,
    transformer: Transformer,
}

impl FluxModel {
    fn run(&mut self, request: &GenerationRequest) -> Result<Vec<u8>> {
        let width = request.width as usize;
        let height = request.height as usize;
        let steps = request.steps as usize;

        if request.seed >= 0 {
            if let Err(e) = self.device.set_seed(request.seed as u64) {
                warn!(seed = request.seed, "device ignores explicit seed: {e}");
            }
        }
        if !request.negative_prompt.is_empty() {
            debug!("negative prompt is not used by FLUX sampling");
        }

        // --- Generate noise image ---
        let noise_img =
            flux::sampling::get_noise(1, height, width, &self.device)?.to_dtype(self.dtype)?;

        // --- Compute T5 embedding ---
        let mut t5_tokens = self
            .t5_tokenizer
            .encode(request.prompt.as_str(), true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        t5_tokens.resize(256, 0);
        let input_token_ids = Tensor::new(&*t5_tokens, &self.device)?.unsqueeze(0)?;
        let t5_emb = self.t5_model.forward(&input_token_ids)?;

        // --- Compute CLIP embedding ---
        let clip_tokens = self
            .clip_tokenizer
            .encode(request.prompt.as_str(), true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let input_token_ids_clip = Tensor::new(&*clip_tokens, &self.device)?.unsqueeze(0)?;
        let clip_emb = self.clip_model.forward(&input_token_ids_clip)?;

        // --- Create sampling state and schedule ---
        let state = flux::sampling::State::new(&t5_emb, &clip_emb, &noise_img)?;
        let timesteps = match self.variant {
            FluxVariant::Schnell => flux::sampling::get_schedule(steps, None),
            FluxVariant::Dev => {
                flux::sampling::get_schedule(steps, Some((state.img.dim(1)?, 0.5, 1.15)))
            }
        };
        let guidance = request.cfg_scale as f64;

        let latent_img = match &self.transformer {
            Transformer::Full(model) => flux::sampling::denoise(
                model,
                &state.img,
                &state.img_ids,
                &state.txt,
                &state.txt_ids,
                &state.vec,
                &timesteps,
                guidance,
            )?,
            Transformer::Quantized(model) => flux::sampling::denoise(
                model,
                &state.img,
                &state.img_ids,
                &state.txt,
                &state.txt_ids,
                &state.vec,
                &timesteps,
                guidance,
            )?,
        };
        let unpacked = flux::sampling::unpack(&latent_img, height, width)?;
        debug!("generated latent image");

        let decoded = self.autoencoder.decode(&unpacked)?;
        debug!("decoded image");

        // --- Postprocessing: clamp, scale, convert type ---
        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        let (out_width, out_height, pixels) = tensor_to_rgb(&img.i(0)?)?;
        if (out_width, out_height) != (width, height) {
            anyhow::bail!("decoder produced {out_width}x{out_height}, expected {width}x{height}");
        }
        Ok(pixels)
    }
}

/// Candle implementation of the engine boundary for FLUX checkpoints.
///
/// The model file may be a `.gguf` (quantized transformer) or `.safetensors`. Text
/// encoders and the default autoencoder come from the Hugging Face hub cache.
pub struct FluxEngine {
    config: FluxConfig,
    model: Option<FluxModel>,
}

impl FluxEngine {
    pub fn new(config: FluxConfig) -> Self {
        Self {
            config,
            model: None,
        }
    }

    fn load(&self, model_path: &Path, vae_path: Option<&Path>, threads: usize) -> Result<FluxModel> {
        let variant = FluxVariant::from_path(model_path);
        let quantized = model_path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("gguf"));

        // Configure device.
        let device = select_best_device(self.config.device_map).context("failed to set up device")?;
        let dtype = if quantized {
            DType::F32
        } else {
            device.bf16_default_to_f32()
        };
        info!(
            model = %model_path.display(),
            ?variant,
            quantized,
            threads,
            "loading flux model"
        );

        let api = Api::new().context("failed to create hf hub API")?;

        // --- Load T5 Model and Tokenizer ---
        let t5_repo = api.repo(hf_hub::Repo::with_revision(
            self.config.t5_repo.clone(),
            hf_hub::RepoType::Model,
            self.config.t5_revision.clone(),
        ));
        let t5_model_file = t5_repo
            .get("model.safetensors")
            .context("failed to load T5 model file")?;
        let t5_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[t5_model_file], dtype, &device)
                .context("failed to build T5 var builder")?
        };
        let config_filename = t5_repo
            .get("config.json")
            .context("failed to get T5 config")?;
        let config_str =
            std::fs::read_to_string(&config_filename).context("failed to read T5 config")?;
        let t5_config: t5::Config =
            serde_json::from_str(&config_str).context("failed to parse T5 config")?;
        let t5_model =
            T5EncoderModel::load(t5_vb, &t5_config).context("failed to load T5 model")?;
        let t5_tokenizer_filename = api
            .model(self.config.t5_tokenizer_repo.clone())
            .get(&self.config.t5_tokenizer_file)
            .context("failed to get T5 tokenizer")?;
        let t5_tokenizer = Tokenizer::from_file(t5_tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load T5 tokenizer")?;

        // --- Load CLIP Model and Tokenizer ---
        let clip_repo = api.repo(hf_hub::Repo::model(self.config.clip_repo.clone()));
        let clip_model_file = clip_repo
            .get("model.safetensors")
            .context("failed to get CLIP model file")?;
        let clip_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[clip_model_file], dtype, &device)
                .context("failed to build CLIP var builder")?
        };
        let clip_config = text_model::ClipTextConfig {
            vocab_size: 49408,
            projection_dim: 768,
            activation: text_model::Activation::QuickGelu,
            intermediate_size: 3072,
            embed_dim: 768,
            max_position_embeddings: 77,
            pad_with: None,
            num_hidden_layers: 12,
            num_attention_heads: 12,
        };
        let clip_model = ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_config)
            .context("failed to load CLIP model")?;
        let clip_tokenizer_filename = clip_repo
            .get("tokenizer.json")
            .context("failed to get CLIP tokenizer")?;
        let clip_tokenizer = Tokenizer::from_file(clip_tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;

        // --- Load Autoencoder ---
        let autoencoder_model_file = match vae_path {
            Some(path) => path.to_path_buf(),
            None => api
                .model(variant.repo().to_string())
                .get("ae.safetensors")
                .context("failed to get default autoencoder")?,
        };
        let autoencoder_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[autoencoder_model_file], dtype, &device)
                .context("failed to build autoencoder var builder")?
        };
        let autoencoder = AutoEncoder::new(&variant.autoencoder_config(), autoencoder_vb)
            .context("failed to load autoencoder")?;

        // --- Load Flux transformer ---
        let flux_config = variant.model_config();
        let transformer = if quantized {
            let vb = candle_transformers::quantized_var_builder::VarBuilder::from_gguf(
                model_path, &device,
            )
            .context("failed to read gguf model")?;
            Transformer::Quantized(
                flux::quantized_model::Flux::new(&flux_config, vb)
                    .context("failed to load quantized flux model")?,
            )
        } else {
            let vb = unsafe {
                candle_nn::VarBuilder::from_mmaped_safetensors(&[model_path], dtype, &device)
                    .context("failed to build flux var builder")?
            };
            Transformer::Full(
                flux::model::Flux::new(&flux_config, vb).context("failed to load flux model")?,
            )
        };

        Ok(FluxModel {
            variant,
            device,
            dtype,
            t5_model,
            t5_tokenizer,
            clip_model,
            clip_tokenizer,
            autoencoder,
            transformer,
        })
    }
}

impl Engine for FluxEngine {
    fn load_model(&mut self, model_path: &Path, vae_path: Option<&Path>, threads: usize) -> bool {
        // Drop any previous model before mapping the next one.
        self.free_model();
        match self.load(model_path, vae_path, threads) {
            Ok(model) => {
                self.model = Some(model);
                info!("model loaded successfully with {threads} threads");
                true
            }
            Err(e) => {
                error!("failed to load model: {e:#}");
                false
            }
        }
    }

    fn txt2img(&mut self, request: &GenerationRequest) -> Result<Vec<u8>, GenerationFailure> {
        let Some(model) = self.model.as_mut() else {
            return Err(GenerationFailure::EmptyOutput);
        };
        if request.width % DIMENSION_MULTIPLE != 0 || request.height % DIMENSION_MULTIPLE != 0 {
            return Err(GenerationFailure::InvalidParameters(format!(
                "{}x{} is not a multiple of {DIMENSION_MULTIPLE}",
                request.width, request.height
            )));
        }
        model
            .run(request)
            .map_err(|e| GenerationFailure::Engine(format!("{e:#}")))
    }

    fn free_model(&mut self) {
        if self.model.take().is_some() {
            info!("flux model freed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_without_model_yields_no_data() {
        let mut engine = FluxEngine::new(FluxConfig::default());
        assert_eq!(
            engine.txt2img(&GenerationRequest::new("a cat")),
            Err(GenerationFailure::EmptyOutput)
        );
        // Freeing with nothing loaded is a no-op.
        engine.free_model();
        engine.free_model();
    }
}
