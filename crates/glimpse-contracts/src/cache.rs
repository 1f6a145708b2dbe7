use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::analysis::{ScreenAnalysis, StoredResult};

/// Durable fast-key to content-key mapping, one JSON object per file.
///
/// Reads degrade to a miss on any failure; writes rewrite the whole file
/// atomically so an interrupted process can never leave a torn index.
/// Entries are never expired.
#[derive(Debug, Clone)]
pub struct CacheIndex {
    path: PathBuf,
}

impl CacheIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lookup(&self, fast_key: &str) -> Option<String> {
        self.load().remove(fast_key)
    }

    pub fn insert(&self, fast_key: &str, content_key: &str) -> Result<()> {
        let mut entries = self.load();
        entries.insert(fast_key.to_string(), content_key.to_string());
        let payload = serde_json::to_string_pretty(&entries)?;
        atomic_write_text(&self.path, &payload)
    }

    fn load(&self) -> BTreeMap<String, String> {
        fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }
}

/// One result file per content key: `{key}.json` for structured analyses,
/// `{key}.txt` for raw text. Files are written atomically and never hold
/// failed attempts.
#[derive(Debug, Clone)]
pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// A missing or unparsable file is a miss, never an error; the index
    /// may legitimately point at a result that no longer exists.
    pub fn load(&self, content_key: &str) -> Option<StoredResult> {
        let structured = self.dir.join(format!("{content_key}.json"));
        if let Ok(raw) = fs::read_to_string(&structured) {
            return serde_json::from_str::<ScreenAnalysis>(&raw)
                .ok()
                .map(StoredResult::Structured);
        }
        fs::read_to_string(self.dir.join(format!("{content_key}.txt")))
            .ok()
            .map(StoredResult::Raw)
    }

    pub fn store(&self, content_key: &str, result: &StoredResult) -> Result<()> {
        match result {
            StoredResult::Structured(analysis) => atomic_write_text(
                &self.dir.join(format!("{content_key}.json")),
                &serde_json::to_string(analysis)?,
            ),
            StoredResult::Raw(text) => {
                atomic_write_text(&self.dir.join(format!("{content_key}.txt")), text)
            }
        }
    }
}

/// Persists one unit of cached work. The result file always lands before
/// the index entry, so a reader never follows the index to a result that
/// was never written.
pub fn commit(
    index: &CacheIndex,
    results: &ResultStore,
    fast_key: &str,
    content_key: &str,
    result: &StoredResult,
) -> Result<()> {
    results.store(content_key, result)?;
    index.insert(fast_key, content_key)
}

/// Write-to-temp-then-rename so readers observe either the old or the new
/// content, never a partial file.
pub fn atomic_write_text(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, text).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to move {} into place", tmp.display()))
}
