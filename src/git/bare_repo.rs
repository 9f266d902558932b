//! Creation of managed bare repositories.
//!
//! A repository is built under a hidden staging name next to its final
//! location: make the directory, run `git init --bare`, install the hook set.
//! Only a complete repository is renamed into place, so other sessions never
//! see a half-initialised one.  On failure the staging directory is removed.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, instrument, warn};

use super::commands::GitExecutor;
use super::hooks::HookSet;
use crate::sandbox::{RepositoryHandle, Sandbox, SandboxError};

/// Conventional suffix of bare repositories.
pub const BARE_SUFFIX: &str = ".git";

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Invalid repository name")]
    InvalidName,
    #[error("Repository already exists: {0}")]
    AlreadyExists(String),
    #[error("Failed to create repository: {0:#}")]
    Failed(anyhow::Error),
}

// ---------------------------------------------------------------------------
// Name handling
// ---------------------------------------------------------------------------

/// Validate a caller-supplied repository name and append [`BARE_SUFFIX`] if
/// it is missing.  Names may not contain separators or `..`, so creation
/// never reaches below the top level of the root.  Leading dots are reserved
/// for staging directories.
pub fn canonical_repo_name(name: &str) -> Result<String, ProvisionError> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains("..")
        || name.contains('/')
        || name.contains('\\')
        || name.chars().any(|c| c.is_control() || c.is_whitespace())
    {
        return Err(ProvisionError::InvalidName);
    }

    let canonical = if name.ends_with(BARE_SUFFIX) {
        name.to_string()
    } else {
        format!("{name}{BARE_SUFFIX}")
    };

    if canonical == BARE_SUFFIX {
        return Err(ProvisionError::InvalidName);
    }
    Ok(canonical)
}

// ---------------------------------------------------------------------------
// Provisioner
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Provisioner {
    sandbox: Arc<Sandbox>,
    git: Arc<dyn GitExecutor>,
    hooks: HookSet,
}

impl Provisioner {
    pub fn new(sandbox: Arc<Sandbox>, git: Arc<dyn GitExecutor>, hooks: HookSet) -> Self {
        Self {
            sandbox,
            git,
            hooks,
        }
    }

    /// Create a new bare repository named `name` directly under the root.
    #[instrument(skip(self))]
    pub async fn create(&self, name: &str) -> Result<RepositoryHandle, ProvisionError> {
        let canonical = canonical_repo_name(name)?;

        let handle = self.sandbox.resolve(&canonical).map_err(|e| match e {
            SandboxError::Violation | SandboxError::NotFound(_) => ProvisionError::InvalidName,
        })?;
        if handle.path.parent() != Some(self.sandbox.root()) {
            return Err(ProvisionError::InvalidName);
        }

        if tokio::fs::symlink_metadata(&handle.path).await.is_ok() {
            return Err(ProvisionError::AlreadyExists(canonical));
        }

        let staging = self.staging_path(&canonical);
        tokio::fs::create_dir(&staging).await.map_err(|e| {
            ProvisionError::Failed(
                anyhow::Error::new(e).context(format!("failed to create directory {canonical}")),
            )
        })?;

        if let Err(e) = self.initialise(&staging).await {
            error!(repo = %canonical, error = %format!("{e:#}"), "repository initialisation failed");
            discard(&staging, &canonical).await;
            return Err(ProvisionError::Failed(e));
        }

        // rename(2) cannot replace a non-empty directory, so a concurrent
        // creator that finished first makes this fail instead of being
        // overwritten.
        if let Err(e) = publish(&staging, &handle.path).await {
            discard(&staging, &canonical).await;
            if tokio::fs::symlink_metadata(&handle.path).await.is_ok() {
                return Err(ProvisionError::AlreadyExists(canonical));
            }
            return Err(ProvisionError::Failed(
                anyhow::Error::new(e).context(format!("failed to publish repository {canonical}")),
            ));
        }

        info!(repo = %canonical, path = %handle.path.display(), "repository created");
        Ok(RepositoryHandle {
            exists: true,
            ..handle
        })
    }

    /// A unique hidden sibling of the final directory.
    fn staging_path(&self, canonical: &str) -> PathBuf {
        let seq = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
        self.sandbox
            .root()
            .join(format!(".{canonical}.tmp-{}-{seq}", std::process::id()))
    }

    async fn initialise(&self, path: &Path) -> anyhow::Result<()> {
        self.git.init_bare(path).await?;
        self.hooks.install(path).await?;
        Ok(())
    }
}

/// Move a finished repository into place.  An existing directory at `dest`
/// is never replaced.
async fn publish(staging: &Path, dest: &Path) -> io::Result<()> {
    if tokio::fs::symlink_metadata(dest).await.is_ok() {
        return Err(io::Error::from(io::ErrorKind::AlreadyExists));
    }
    tokio::fs::rename(staging, dest).await
}

async fn discard(staging: &Path, canonical: &str) {
    if let Err(e) = tokio::fs::remove_dir_all(staging).await {
        warn!(
            repo = %canonical,
            staging = %staging.display(),
            error = %e,
            "failed to remove partially created repository"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
