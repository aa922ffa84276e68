//! File-backed credential source
//!
//! Every regular file in the credentials directory holds one secret. A file
//! named `<source>.ban` is loaded disabled. Credentials are ordered by source
//! name so ids stay stable across restarts and enable/disable toggles.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::credential_pool::CredentialSeed;

/// File name suffix marking a disabled credential
pub const DISABLED_SUFFIX: &str = ".ban";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Credential store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No file for credential '{0}'")]
    Missing(String),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read every credential file, creating the directory when missing.
    /// Empty or unreadable files are skipped with a warning.
    pub async fn load(&self) -> Result<Vec<CredentialSeed>, StoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(io_error(&self.dir))?;

        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(io_error(&self.dir))?;

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error(&self.dir))? {
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false);
            if !is_file {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                tracing::warn!(path = %entry.path().display(), "Skipping credential file with non UTF-8 name");
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let (source, enabled) = match name.strip_suffix(DISABLED_SUFFIX) {
                Some(base) => (base.to_string(), false),
                None => (name.clone(), true),
            };
            if source.is_empty() {
                continue;
            }
            files.push((source, enabled, name));
        }
        // Enabled file wins when both forms of a source exist
        files.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

        let mut seen = HashSet::new();
        let mut seeds = Vec::with_capacity(files.len());
        for (source, enabled, name) in files {
            if !seen.insert(source.clone()) {
                tracing::warn!(source = %source, file = %name, "Duplicate credential file ignored");
                continue;
            }

            let path = self.dir.join(&name);
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) => {
                    tracing::warn!(file = %name, error = %e, "Skipping unreadable credential file");
                    continue;
                }
            };
            let secret = content.trim();
            if secret.is_empty() {
                tracing::warn!(file = %name, "Skipping empty credential file");
                continue;
            }

            let seed = CredentialSeed::new(source, secret);
            seeds.push(if enabled { seed } else { seed.disabled() });
        }

        tracing::info!(
            dir = %self.dir.display(),
            count = seeds.len(),
            disabled = seeds.iter().filter(|s| !s.enabled).count(),
            "Loaded credentials"
        );
        Ok(seeds)
    }

    /// Overwrite the secret of `source`, wherever its file currently lives
    pub async fn persist_secret(&self, source: &str, secret: &str) -> Result<PathBuf, StoreError> {
        let path = match self.current_path(source).await {
            Some(path) => path,
            None => self.dir.join(source),
        };
        tokio::fs::write(&path, secret)
            .await
            .map_err(io_error(&path))?;
        tracing::debug!(path = %path.display(), "Persisted credential secret");
        Ok(path)
    }

    /// Rename the file of `source` to add or drop the disabled suffix
    pub async fn persist_enabled(&self, source: &str, enabled: bool) -> Result<PathBuf, StoreError> {
        let current = self
            .current_path(source)
            .await
            .ok_or_else(|| StoreError::Missing(source.to_string()))?;
        let target = self.path_for(source, enabled);
        if current != target {
            tokio::fs::rename(&current, &target)
                .await
                .map_err(io_error(&current))?;
            tracing::debug!(
                from = %current.display(),
                to = %target.display(),
                "Renamed credential file"
            );
        }
        Ok(target)
    }

    fn path_for(&self, source: &str, enabled: bool) -> PathBuf {
        if enabled {
            self.dir.join(source)
        } else {
            self.dir.join(format!("{source}{DISABLED_SUFFIX}"))
        }
    }

    async fn current_path(&self, source: &str) -> Option<PathBuf> {
        for enabled in [true, false] {
            let path = self.path_for(source, enabled);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Some(path);
            }
        }
        None
    }
}
