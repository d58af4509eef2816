use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use iia_core::{GenerationResult, StateStream};
use image::codecs::jpeg::JpegEncoder;
use tokio::task::JoinHandle;
use tracing::{error, info};

const GALLERY_DIR: &str = "IIA_Outputs";

/// Saves `result` as a JPEG under `<output_dir>/IIA_Outputs`. Results saved within the
/// same millisecond get a numeric suffix instead of replacing each other.
pub fn save(output_dir: &Path, result: &GenerationResult) -> Result<PathBuf> {
    let dir = output_dir.join(GALLERY_DIR);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let image = result.to_image()?;

    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let (path, file) = create_unique(&dir, millis)?;
    image
        .write_with_encoder(JpegEncoder::new_with_quality(BufWriter::new(file), 100))
        .with_context(|| format!("failed to encode {}", path.display()))?;
    Ok(path)
}

fn create_unique(dir: &Path, millis: u128) -> Result<(PathBuf, File)> {
    let mut suffix = 0u32;
    loop {
        let name = match suffix {
            0 => format!("IIA_{millis}.jpg"),
            n => format!("IIA_{millis}_{n}.jpg"),
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => suffix += 1,
            Err(e) => {
                return Err(e).with_context(|| format!("failed to create {}", path.display()))
            }
        }
    }
}

/// Watches the state stream and saves every new successful result.
pub fn spawn(mut stream: StateStream, output_dir: PathBuf) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last: Option<Arc<GenerationResult>> = None;
        while let Some(state) = stream.next().await {
            let Some(result) = state.latest_result() else {
                continue;
            };
            if last.as_ref().is_some_and(|seen| Arc::ptr_eq(seen, result)) {
                continue;
            }
            last = Some(result.clone());

            let dir = output_dir.clone();
            let result = result.clone();
            match tokio::task::spawn_blocking(move || save(&dir, &result)).await {
                Ok(Ok(path)) => info!(path = %path.display(), "saved to gallery"),
                Ok(Err(e)) => error!("failed to save image: {e:#}"),
                Err(e) => error!("gallery task failed: {e}"),
            }
        }
    })
}
