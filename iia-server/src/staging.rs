use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use tracing::{info, warn};

const FALLBACK_NAME: &str = "temp_model.gguf";

static PARTIALS: AtomicU64 = AtomicU64::new(0);

/// File name a document keeps once staged.
pub fn staged_name(source: &Path) -> OsString {
    source
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from(FALLBACK_NAME))
}

/// A document copied next to its cache target but not yet moved into place.
///
/// The copy lives under a unique hidden name until [`commit`](Staged::commit) renames it
/// over the target. A file already open at the target (e.g. memory-mapped by the engine)
/// keeps its contents across the rename.
#[derive(Debug)]
pub struct Staged {
    partial: Option<PathBuf>,
    target: PathBuf,
}

impl Staged {
    pub fn target(&self) -> &Path {
        &self.target
    }

    pub async fn commit(mut self) -> Result<PathBuf> {
        if let Some(partial) = self.partial.take() {
            tokio::fs::rename(&partial, &self.target)
                .await
                .with_context(|| format!("failed to move {} into place", partial.display()))?;
        }
        Ok(self.target)
    }

    pub async fn discard(mut self) {
        if let Some(partial) = self.partial.take() {
            if let Err(e) = tokio::fs::remove_file(&partial).await {
                warn!(partial = %partial.display(), "failed to remove staged copy: {e}");
            }
        }
    }
}

/// Copies a user-picked document into `cache_dir` so the engine gets a plain local path.
/// Keeps the document's file name. A document already at its target is left alone.
pub async fn stage_document(source: &Path, cache_dir: &Path) -> Result<Staged> {
    let name = staged_name(source);
    tokio::fs::create_dir_all(cache_dir)
        .await
        .with_context(|| format!("failed to create cache dir {}", cache_dir.display()))?;
    let target = cache_dir.join(&name);
    if target == source {
        return Ok(Staged {
            partial: None,
            target,
        });
    }

    let mut partial_name = OsString::from(".");
    partial_name.push(&name);
    partial_name.push(format!(
        ".{}-{}.partial",
        std::process::id(),
        PARTIALS.fetch_add(1, Ordering::Relaxed)
    ));
    let partial = cache_dir.join(partial_name);
    let bytes = match tokio::fs::copy(source, &partial).await {
        Ok(bytes) => bytes,
        Err(e) => {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e).with_context(|| format!("failed to stage {}", source.display()));
        }
    };
    info!(source = %source.display(), target = %target.display(), bytes, "staged document");
    Ok(Staged {
        partial: Some(partial),
        target,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn copies_into_cache_with_same_name() {
        let picked = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let source = picked.path().join("sd-turbo.gguf");
        std::fs::write(&source, b"weights").unwrap();
        let models = cache.path().join("models");

        let staged = stage_document(&source, &models).await.unwrap();
        assert_eq!(staged.target(), models.join("sd-turbo.gguf"));
        assert!(!staged.target().exists());

        let target = staged.commit().await.unwrap();
        assert_eq!(target, models.join("sd-turbo.gguf"));
        assert_eq!(std::fs::read(&target).unwrap(), b"weights");
        assert_eq!(entries(&models), vec!["sd-turbo.gguf"]);
    }

    #[tokio::test]
    async fn discarded_copy_leaves_target_untouched() {
        let picked = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let source = picked.path().join("model.gguf");
        std::fs::write(&source, b"new").unwrap();
        std::fs::write(cache.path().join("model.gguf"), b"old").unwrap();

        stage_document(&source, cache.path())
            .await
            .unwrap()
            .discard()
            .await;
        assert_eq!(std::fs::read(cache.path().join("model.gguf")).unwrap(), b"old");
        assert_eq!(entries(cache.path()), vec!["model.gguf"]);
    }

    #[tokio::test]
    async fn already_staged_document_is_left_alone() {
        let cache = tempfile::tempdir().unwrap();
        let source = cache.path().join("model.gguf");
        std::fs::write(&source, b"weights").unwrap();

        let staged = stage_document(&source, cache.path()).await.unwrap();
        assert_eq!(staged.commit().await.unwrap(), source);
        assert_eq!(std::fs::read(&source).unwrap(), b"weights");
    }

    #[tokio::test]
    async fn missing_document_is_an_error() {
        let cache = tempfile::tempdir().unwrap();
        let out = cache.path().join("out");
        let result = stage_document(&cache.path().join("gone.gguf"), &out).await;
        assert!(result.is_err());
        assert!(entries(&out).is_empty());
    }
}
