use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};

use crate::keys::mtime_nanos;

pub const DEFAULT_MAX_FILES: usize = 20;
pub const DEFAULT_MAX_BYTES: u64 = 100 * 1024 * 1024;

/// Local mirror of input images. Copies are named from the source's ordinal,
/// stem, size and mtime so an unchanged source maps to an existing file and
/// a changed one maps to a fresh name. Single active writer assumed; no
/// locking.
#[derive(Debug, Clone)]
pub struct MirrorStore {
    dir: PathBuf,
}

impl MirrorStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copies each source into the mirror directory unless a file with the
    /// deterministic name already exists. Unchanged sources cost one stat.
    pub fn ensure_mirrored(&self, sources: &[PathBuf]) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create mirror dir {}", self.dir.display()))?;
        let mut mirrored = Vec::with_capacity(sources.len());
        for (ordinal, source) in sources.iter().enumerate() {
            let target = self.dir.join(mirror_name(source, ordinal)?);
            if !target.exists() {
                fs::copy(source, &target).with_context(|| {
                    format!(
                        "failed to mirror {} to {}",
                        source.display(),
                        target.display()
                    )
                })?;
            }
            mirrored.push(target);
        }
        Ok(mirrored)
    }

    /// Deletes oldest-by-mtime files until at most `max_files` remain, then
    /// keeps deleting oldest-first until the directory is under `max_bytes`.
    pub fn prune(&self, max_files: usize, max_bytes: u64) -> Result<()> {
        let mut files: Vec<(PathBuf, u64, SystemTime)> = Vec::new();
        let mut total: u64 = 0;
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to list {}", self.dir.display()))
            }
        };
        for entry in entries {
            let entry = entry?;
            let meta = match entry.metadata() {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };
            total += meta.len();
            files.push((
                entry.path(),
                meta.len(),
                meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            ));
        }
        files.sort_by_key(|(_, _, mtime)| *mtime);

        let mut queue = files.into_iter();
        let mut remaining = queue.len();
        while remaining > max_files {
            let Some((path, size, _)) = queue.next() else {
                break;
            };
            remove_quietly(&path)?;
            total = total.saturating_sub(size);
            remaining -= 1;
        }
        while total > max_bytes {
            let Some((path, size, _)) = queue.next() else {
                break;
            };
            remove_quietly(&path)?;
            total = total.saturating_sub(size);
        }
        Ok(())
    }
}

/// `{ordinal:02}__{stem}__{size}__{mtime_ns}{ext}`. The name pins the exact
/// source bytes at copy time as far as size+mtime can.
pub fn mirror_name(source: &Path, ordinal: usize) -> Result<String> {
    let meta = fs::metadata(source)
        .with_context(|| format!("failed to stat {}", source.display()))?;
    let stem = source
        .file_stem()
        .map(|stem| stem.to_string_lossy().replace(' ', "_"))
        .unwrap_or_default();
    let ext = source
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
        .unwrap_or_default();
    Ok(format!(
        "{ordinal:02}__{stem}__{}__{}{ext}",
        meta.len(),
        mtime_nanos(&meta)
    ))
}

// Another invocation may have pruned the same file already.
fn remove_quietly(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}
