//! OpenSSH-style authorized keys store.
//!
//! Records are single lines of the form
//! `[options] key-type base64-material [comment]`.  Blank lines, `#`
//! comments, and lines whose key material does not parse are skipped.  Key
//! material is decoded with `russh-keys`, and keys are compared by their
//! SSH wire encoding, byte for byte.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use russh_keys::PublicKeyBase64;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// One parsed authorized-keys line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedKey {
    /// Key algorithm reported by the decoded key, e.g. `ssh-ed25519`.
    pub algorithm: String,
    /// Public key in SSH wire format.
    pub blob: Vec<u8>,
    pub comment: Option<String>,
}

impl AuthorizedKey {
    /// Parse a single line.  Returns `None` for blanks, comments and
    /// anything without decodable key material.
    ///
    /// The key is the first token `russh-keys` accepts as base64 public key
    /// material; option and key-type tokens before it never decode, and
    /// everything after it is the comment.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        let (index, key) = tokens.iter().enumerate().find_map(|(i, token)| {
            russh_keys::parse_public_key_base64(token)
                .ok()
                .map(|key| (i, key))
        })?;

        let rest = &tokens[index + 1..];
        let comment = if rest.is_empty() {
            None
        } else {
            Some(rest.join(" "))
        };

        Some(Self {
            algorithm: key.name().to_string(),
            blob: key.public_key_bytes(),
            comment,
        })
    }

    /// Exact comparison against a presented key blob.
    pub fn matches(&self, presented: &[u8]) -> bool {
        self.blob == presented
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.blob)
    }
}

/// SHA-256 fingerprint of a key blob in the `ssh-keygen -l` format.
pub fn fingerprint(blob: &[u8]) -> String {
    let hash = Sha256::digest(blob);
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{encoded}")
}

// ---------------------------------------------------------------------------
// Store port
// ---------------------------------------------------------------------------

/// Source of authorized keys, consulted on every authentication attempt.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Return the first record whose blob equals `presented`.
    async fn find(&self, presented: &[u8]) -> Result<Option<AuthorizedKey>>;
}

/// Authorized keys kept in a flat file, re-read on every lookup.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create an empty, owner-only store if none exists yet.
    pub async fn ensure_exists(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create directory: {}", parent.display()))?;
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        match options.open(&self.path).await {
            Ok(_) => {
                info!(path = %self.path.display(), "created empty authorized keys file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e).with_context(|| {
                format!("failed to create authorized keys file: {}", self.path.display())
            }),
        }
    }
}

#[async_trait]
impl KeyStore for FileKeyStore {
    async fn find(&self, presented: &[u8]) -> Result<Option<AuthorizedKey>> {
        self.ensure_exists().await?;

        let file = tokio::fs::File::open(&self.path)
            .await
            .with_context(|| format!("failed to open authorized keys: {}", self.path.display()))?;
        let mut lines = BufReader::new(file).lines();

        let mut line_no = 0usize;
        while let Some(line) = lines
            .next_line()
            .await
            .with_context(|| format!("failed to read authorized keys: {}", self.path.display()))?
        {
            line_no += 1;
            match AuthorizedKey::parse_line(&line) {
                Some(key) if key.matches(presented) => return Ok(Some(key)),
                Some(_) => {}
                None if line.trim().is_empty() || line.trim_start().starts_with('#') => {}
                None => debug!(line = line_no, "skipping unparseable authorized keys record"),
            }
        }
        Ok(None)
    }
}

/// In-memory store, mainly for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MemoryKeyStore {
    keys: Vec<AuthorizedKey>,
}

impl MemoryKeyStore {
    pub fn new(keys: Vec<AuthorizedKey>) -> Self {
        Self { keys }
    }

    /// Build from authorized-keys text, skipping unparseable lines.
    pub fn from_text(text: &str) -> Self {
        Self::new(text.lines().filter_map(AuthorizedKey::parse_line).collect())
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn find(&self, presented: &[u8]) -> Result<Option<AuthorizedKey>> {
        Ok(self.keys.iter().find(|k| k.matches(presented)).cloned())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
