// Action Cache
// Locates pre-fetched external actions in a local cache directory

use crate::actions::reference::ActionRef;

use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors that can occur while fetching actions
#[derive(Debug, Error)]
pub enum ActionFetchError {
    #[error("Invalid action reference for fetching: {0}")]
    InvalidReference(String),

    #[error("Failed to fetch action {0}: {1}")]
    FetchFailed(String, String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

/// Supplies the on-disk contents of external actions.
///
/// `Ok(None)` means the action is not available locally and is treated as an
/// opaque unit handed to the `ActionHost`.
#[async_trait]
pub trait ActionFetcher: Send + Sync {
    async fn fetch(
        &self,
        reference: &ActionRef,
        fetch_key: &str,
    ) -> Result<Option<PathBuf>, ActionFetchError>;
}

/// Cache key for an external action: `owner/repo@version`
pub fn fetch_key(reference: &ActionRef) -> Option<String> {
    match reference {
        ActionRef::External {
            owner,
            repo,
            version,
            ..
        } => Some(format!("{}/{}@{}", owner, repo, version)),
        ActionRef::Local { .. } => None,
    }
}

/// Directory-backed action cache laid out as `<cache_dir>/<owner>/<repo>/<version>`
pub struct ActionCache {
    cache_dir: PathBuf,
    /// Fetch keys already looked up on disk
    known: Arc<RwLock<HashMap<String, Option<PathBuf>>>>,
}

impl ActionCache {
    /// Create a cache rooted at the default directory (`~/.gantry/actions`)
    pub fn new() -> Self {
        Self::with_cache_dir(default_cache_dir())
    }

    /// Create a cache with a specific cache directory
    pub fn with_cache_dir(cache_dir: impl AsRef<Path>) -> Self {
        Self {
            cache_dir: cache_dir.as_ref().to_path_buf(),
            known: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get the cache directory
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Path where the repository of an action would be cached
    fn repo_path(&self, reference: &ActionRef) -> Option<PathBuf> {
        match reference {
            ActionRef::External {
                owner,
                repo,
                version,
                ..
            } => Some(self.cache_dir.join(owner).join(repo).join(version)),
            ActionRef::Local { .. } => None,
        }
    }

    /// List all cached actions as `owner/repo@version`
    pub fn list_cached_actions(&self) -> io::Result<Vec<String>> {
        let mut actions = Vec::new();

        if !self.cache_dir.exists() {
            return Ok(actions);
        }

        for owner in fs::read_dir(&self.cache_dir)? {
            let owner = owner?;
            if !owner.file_type()?.is_dir() {
                continue;
            }
            for repo in fs::read_dir(owner.path())? {
                let repo = repo?;
                if !repo.file_type()?.is_dir() {
                    continue;
                }
                for version in fs::read_dir(repo.path())? {
                    let version = version?;
                    if version.file_type()?.is_dir() {
                        actions.push(format!(
                            "{}/{}@{}",
                            owner.file_name().to_string_lossy(),
                            repo.file_name().to_string_lossy(),
                            version.file_name().to_string_lossy()
                        ));
                    }
                }
            }
        }

        actions.sort();
        Ok(actions)
    }
}

impl Default for ActionCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionFetcher for ActionCache {
    async fn fetch(
        &self,
        reference: &ActionRef,
        fetch_key: &str,
    ) -> Result<Option<PathBuf>, ActionFetchError> {
        // Check in-memory cache first
        {
            let known = self.known.read().await;
            if let Some(path) = known.get(fetch_key) {
                return Ok(path.clone().map(|p| with_subpath(p, reference)));
            }
        }

        let repo_path = self
            .repo_path(reference)
            .ok_or_else(|| ActionFetchError::InvalidReference(reference.to_string()))?;
        let found = repo_path.is_dir().then_some(repo_path);

        let mut known = self.known.write().await;
        known.insert(fetch_key.to_string(), found.clone());

        Ok(found.map(|p| with_subpath(p, reference)))
    }
}

fn with_subpath(repo_path: PathBuf, reference: &ActionRef) -> PathBuf {
    match reference {
        ActionRef::External {
            path: Some(path), ..
        } => repo_path.join(path),
        _ => repo_path,
    }
}

/// `~/.gantry/actions`
pub fn default_cache_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".gantry")
        .join("actions")
}
