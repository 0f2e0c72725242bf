//! Reading attachment files from disk

use anyhow::{bail, Context, Result};
use parley_core::session::Attachment;
use std::path::Path;

/// Largest payload sent inline with a request
pub const MAX_ATTACHMENT_BYTES: u64 = 20 * 1024 * 1024;

/// Top-level types the generation service accepts inline
const SUPPORTED_TYPES: [&str; 3] = ["image", "audio", "text"];

/// MIME type for a supported file, guessed from its extension
pub fn mime_for_path(path: &Path) -> Option<String> {
    let mime = mime_guess::from_path(path).first()?;
    let supported = SUPPORTED_TYPES.contains(&mime.type_().as_str())
        || mime.essence_str() == "application/pdf";
    supported.then(|| mime.essence_str().to_string())
}

/// Read `path` into an attachment after checking its type and size
pub async fn load_attachment(path: &Path) -> Result<Attachment> {
    let Some(mime) = mime_for_path(path) else {
        bail!("unsupported attachment type: {}", path.display());
    };

    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;
    if !metadata.is_file() {
        bail!("{} is not a file", path.display());
    }
    if metadata.len() > MAX_ATTACHMENT_BYTES {
        bail!(
            "{} is larger than {} MiB",
            path.display(),
            MAX_ATTACHMENT_BYTES / (1024 * 1024)
        );
    }

    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;
    Ok(Attachment::new(mime, data))
}
