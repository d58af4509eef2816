pub mod device_map;
mod engine;
mod executor;
mod flux;
mod lifecycle;
mod orchestrator;
mod state;
mod status;
mod util;
mod worker;

use std::path::{Path, PathBuf};

pub use device_map::*;
pub use engine::Engine;
pub use executor::GenerationExecutor;
pub use flux::{FluxConfig, FluxEngine, FluxVariant};
use image::{DynamicImage, RgbImage};
pub use lifecycle::ModelLifecycleManager;
pub use orchestrator::Orchestrator;
use serde::{Deserialize, Serialize};
pub use state::{OrchestratorState, StateStream};
pub use status::*;
pub(crate) use util::*;

/// Seed value that lets the engine pick a random seed.
pub const RANDOM_SEED: i64 = -1;

/// Number of interleaved 8-bit channels in every generated image.
pub const CHANNELS: usize = 3;

// Define the request/response types.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    #[serde(default = "default_cfg_scale")]
    pub cfg_scale: f32,
    #[serde(default = "default_dimension")]
    pub width: u32,
    #[serde(default = "default_dimension")]
    pub height: u32,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_seed")]
    pub seed: i64,
}

fn default_cfg_scale() -> f32 {
    7.0
}

fn default_dimension() -> u32 {
    320
}

fn default_steps() -> u32 {
    15
}

fn default_seed() -> i64 {
    RANDOM_SEED
}

impl GenerationRequest {
    /// A request for `prompt` with the low-memory defaults (320x320, 15 steps, cfg 7.0, random seed).
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: String::new(),
            cfg_scale: default_cfg_scale(),
            width: default_dimension(),
            height: default_dimension(),
            steps: default_steps(),
            seed: default_seed(),
        }
    }

    /// Byte length of a well-formed RGB buffer for this request.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * CHANNELS
    }

    /// Positivity checks applied before the request reaches the engine. Ranges are the
    /// engine's business.
    pub(crate) fn check_positive(&self) -> Result<(), GenerationFailure> {
        if !(self.cfg_scale.is_finite() && self.cfg_scale > 0.0) {
            return Err(GenerationFailure::InvalidParameters(format!(
                "guidance scale must be positive, got {}",
                self.cfg_scale
            )));
        }
        if self.width == 0 || self.height == 0 {
            return Err(GenerationFailure::InvalidParameters(format!(
                "dimensions must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        if self.steps == 0 {
            return Err(GenerationFailure::InvalidParameters(
                "step count must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Raw RGB pixels produced by one generation: row-major, no padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationResult {
    pub width: u32,
    pub height: u32,
    pub buffer: Vec<u8>,
}

impl GenerationResult {
    pub fn to_image(&self) -> anyhow::Result<DynamicImage> {
        let buffer = RgbImage::from_raw(self.width, self.height, self.buffer.clone())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "{} bytes do not form a {}x{} RGB image",
                    self.buffer.len(),
                    self.width,
                    self.height
                )
            })?;
        Ok(DynamicImage::ImageRgb8(buffer))
    }
}

/// Host intent to load a model.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub model_path: PathBuf,
    /// Empty or absent selects the engine's default (low-memory) VAE.
    #[serde(default)]
    pub vae_path: Option<PathBuf>,
    pub threads: usize,
}

impl LoadRequest {
    pub fn new(model_path: impl Into<PathBuf>, vae_path: Option<PathBuf>, threads: usize) -> Self {
        Self {
            model_path: model_path.into(),
            vae_path,
            threads,
        }
    }

    pub fn vae_path(&self) -> Option<&Path> {
        self.vae_path
            .as_deref()
            .filter(|path| !path.as_os_str().is_empty())
    }

    pub(crate) fn validate(&self) -> Result<(), LoadFailure> {
        if self.threads < 1 {
            return Err(LoadFailure::InvalidInput(format!(
                "thread count must be at least 1, got {}",
                self.threads
            )));
        }
        check_readable(&self.model_path)?;
        if let Some(vae) = self.vae_path() {
            check_readable(vae)?;
        }
        Ok(())
    }
}

fn check_readable(path: &Path) -> Result<(), LoadFailure> {
    let invalid = |reason: String| LoadFailure::InvalidInput(reason);
    let metadata = std::fs::metadata(path)
        .map_err(|e| invalid(format!("{}: {e}", path.display())))?;
    if !metadata.is_file() {
        return Err(invalid(format!("{} is not a file", path.display())));
    }
    std::fs::File::open(path).map_err(|e| invalid(format!("{}: {e}", path.display())))?;
    Ok(())
}
