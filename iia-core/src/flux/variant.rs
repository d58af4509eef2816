use std::path::Path;

use candle_transformers::models::flux;

/// FLUX checkpoint family, which decides configs and the sampling schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxVariant {
    Schnell,
    Dev,
}

impl FluxVariant {
    /// Detect model variant from a model or file name
    pub fn from_name(model_name: &str) -> Self {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("SCHNELL") {
            FluxVariant::Schnell
        } else if name_upper.contains("DEV") {
            FluxVariant::Dev
        } else {
            FluxVariant::Schnell // Default to Schnell if no specific variant is found
        }
    }

    pub fn from_path(path: &Path) -> Self {
        path.file_name()
            .map(|name| Self::from_name(&name.to_string_lossy()))
            .unwrap_or(FluxVariant::Schnell)
    }

    /// Hub repository holding the reference autoencoder for this variant.
    pub fn repo(&self) -> &'static str {
        match self {
            FluxVariant::Schnell => "black-forest-labs/FLUX.1-schnell",
            FluxVariant::Dev => "black-forest-labs/FLUX.1-dev",
        }
    }

    pub(crate) fn model_config(&self) -> flux::model::Config {
        match self {
            FluxVariant::Schnell => flux::model::Config::schnell(),
            FluxVariant::Dev => flux::model::Config::dev(),
        }
    }

    pub(crate) fn autoencoder_config(&self) -> flux::autoencoder::Config {
        match self {
            FluxVariant::Schnell => flux::autoencoder::Config::schnell(),
            FluxVariant::Dev => flux::autoencoder::Config::dev(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_variant_from_file_name() {
        assert_eq!(
            FluxVariant::from_path(Path::new("/models/flux1-dev-Q4_0.gguf")),
            FluxVariant::Dev
        );
        assert_eq!(
            FluxVariant::from_path(Path::new("/models/flux1-schnell.safetensors")),
            FluxVariant::Schnell
        );
        assert_eq!(FluxVariant::from_name("model.gguf"), FluxVariant::Schnell);
    }
}
