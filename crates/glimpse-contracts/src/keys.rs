use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// Model identity folded into every cache key. An explicit context override
/// changes the signature because it changes what the backend can produce.
pub fn model_signature(model: Option<&str>, explicit_context: Option<u32>) -> String {
    let base = model
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("default");
    match explicit_context {
        Some(ctx) => format!("{base}|ctx={ctx}"),
        None => base.to_string(),
    }
}

/// Cheap cache key from file metadata only. Reads nothing but `stat`.
pub fn fast_key(sources: &[PathBuf], prompt: &str, model_sig: &str) -> Result<String> {
    let mut parts = Vec::with_capacity(sources.len());
    for path in sources {
        parts.push(stat_signature(path)?);
    }
    Ok(digest_key(model_sig, &parts, prompt))
}

/// Authoritative cache key over the mirrored copies. Mirror filenames embed
/// ordinal, stem, byte size and mtime, so hashing the names is enough; this
/// is a size+mtime identity, not a content hash (accepted trade-off).
pub fn content_key(mirrored: &[PathBuf], prompt: &str, model_sig: &str) -> String {
    let parts: Vec<String> = mirrored
        .iter()
        .map(|path| {
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
        .collect();
    digest_key(model_sig, &parts, prompt)
}

/// `name|size|mtime_ns` for one source file.
pub fn stat_signature(path: &Path) -> Result<String> {
    let meta = fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(format!("{name}|{}|{}", meta.len(), mtime_nanos(&meta)))
}

pub fn mtime_nanos(meta: &fs::Metadata) -> u128 {
    meta.modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|duration| duration.as_nanos())
        .unwrap_or(0)
}

fn digest_key(model_sig: &str, file_parts: &[String], prompt: &str) -> String {
    let material = format!(
        "model:{model_sig}\nfiles:{}\nprompt:{prompt}",
        file_parts.join(",")
    );
    let mut hasher = Sha256::new();
    hasher.update(material.as_bytes());
    hex::encode(hasher.finalize())
}
