use std::path::PathBuf;

use iia_core::{Conflict, LoadRequest, ModelStatus, Orchestrator};
use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::overlay::{OverlayState, StateView};
use crate::staging::{stage_document, staged_name, Staged};

/// Payload of the host "load" signal.
#[derive(Debug, Clone, Deserialize)]
pub struct LoadIntent {
    pub model_path: PathBuf,
    #[serde(default)]
    pub vae_path: Option<PathBuf>,
    #[serde(default)]
    pub threads: Option<usize>,
    /// Copy the documents into the cache dir before loading.
    #[serde(default)]
    pub stage: bool,
}

#[derive(Error, Debug)]
pub enum HostError {
    #[error("no cache directory configured for staging")]
    NoCacheDir,
    #[error("model and VAE would both be staged as {0}")]
    NameClash(String),
    #[error("staging failed: {0:#}")]
    Staging(anyhow::Error),
    #[error(transparent)]
    Rejected(#[from] Conflict),
}

/// Process-lifetime owner of the orchestrator. Turns host signals into core calls and
/// keeps the overlay geometry.
pub struct Host {
    orchestrator: Orchestrator,
    overlay: Mutex<OverlayState>,
    cache_dir: Option<PathBuf>,
    default_threads: usize,
    staging: tokio::sync::Mutex<()>,
}

impl Host {
    pub fn new(orchestrator: Orchestrator, cache_dir: Option<PathBuf>, default_threads: usize) -> Self {
        Self {
            orchestrator,
            overlay: Mutex::new(OverlayState::default()),
            cache_dir,
            default_threads,
            staging: tokio::sync::Mutex::new(()),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Host load signal. With `stage` set, documents are copied into the cache dir only
    /// while the load would be admitted, and moved over the cached files just before the
    /// load is issued.
    pub async fn load(&self, intent: LoadIntent) -> Result<ModelStatus, HostError> {
        let threads = intent.threads.unwrap_or(self.default_threads);
        let vae_path = intent.vae_path.filter(|p| !p.as_os_str().is_empty());
        if !intent.stage {
            return Ok(self
                .orchestrator
                .load(LoadRequest::new(intent.model_path, vae_path, threads))?);
        }

        let cache_dir = self.cache_dir.as_deref().ok_or(HostError::NoCacheDir)?;
        if let Some(vae) = &vae_path {
            let name = staged_name(vae);
            if name == staged_name(&intent.model_path) {
                return Err(HostError::NameClash(name.to_string_lossy().into_owned()));
            }
        }

        let _staging = self.staging.lock().await;
        self.orchestrator.check_load()?;
        let model = stage_document(&intent.model_path, cache_dir)
            .await
            .map_err(HostError::Staging)?;
        let vae = match vae_path {
            Some(vae) => match stage_document(&vae, cache_dir).await {
                Ok(staged) => Some(staged),
                Err(e) => {
                    model.discard().await;
                    return Err(HostError::Staging(e));
                }
            },
            None => None,
        };

        // Admission may have changed during the copy.
        if let Err(conflict) = self.orchestrator.check_load() {
            discard(model, vae).await;
            return Err(conflict.into());
        }
        let vae_path = match vae {
            Some(vae) => match vae.commit().await {
                Ok(path) => Some(path),
                Err(e) => {
                    model.discard().await;
                    return Err(HostError::Staging(e));
                }
            },
            None => None,
        };
        let model_path = model.commit().await.map_err(HostError::Staging)?;
        Ok(self
            .orchestrator
            .load(LoadRequest::new(model_path, vae_path, threads))?)
    }

    pub fn show_overlay(&self) -> OverlayState {
        let mut overlay = self.overlay.lock();
        if overlay.show() {
            info!("overlay shown");
        }
        *overlay
    }

    pub fn update_overlay(&self, f: impl FnOnce(&mut OverlayState)) -> OverlayState {
        let mut overlay = self.overlay.lock();
        f(&mut overlay);
        *overlay
    }

    pub fn view(&self) -> StateView {
        StateView::render(&self.orchestrator.snapshot(), *self.overlay.lock())
    }

    /// Stop signal: always unloads before the worker goes away.
    pub async fn stop(&self) {
        info!("stopping host");
        self.orchestrator.shutdown().await;
    }
}

async fn discard(model: Staged, vae: Option<Staged>) {
    model.discard().await;
    if let Some(vae) = vae {
        vae.discard().await;
    }
}
