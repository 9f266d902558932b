//! Accept or reject a presented public key.
//!
//! Only key material decides; the claimed user name is carried through for
//! audit logging.

use std::sync::Arc;

use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use tracing::{error, info, warn};

use super::authorized_keys::{fingerprint, AuthorizedKey, KeyStore};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The authenticated caller, valid for one transport connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    pub key: AuthorizedKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Accept(Identity),
    Reject,
}

impl AuthDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept(_))
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// Public-key authentication against a [`KeyStore`].
///
/// The store is keyed by key material only; the claimed user name never
/// influences the decision and is recorded for audit purposes alone.
#[derive(Clone)]
pub struct AuthenticationGate {
    store: Arc<dyn KeyStore>,
}

impl AuthenticationGate {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self { store }
    }

    pub async fn authenticate(&self, user: &str, key: &PublicKey) -> AuthDecision {
        self.authenticate_blob(user, &key.public_key_bytes()).await
    }

    /// Decide on a raw SSH wire-format key blob.  Store errors reject.
    pub async fn authenticate_blob(&self, user: &str, presented: &[u8]) -> AuthDecision {
        let fp = fingerprint(presented);
        match self.store.find(presented).await {
            Ok(Some(key)) => {
                info!(user = %user, fingerprint = %fp, "public key accepted");
                AuthDecision::Accept(Identity {
                    user: user.to_string(),
                    key,
                })
            }
            Ok(None) => {
                warn!(user = %user, fingerprint = %fp, "public key not authorized");
                AuthDecision::Reject
            }
            Err(e) => {
                error!(
                    user = %user,
                    fingerprint = %fp,
                    error = %format!("{e:#}"),
                    "authorized keys store unavailable; rejecting"
                );
                AuthDecision::Reject
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::authorized_keys::tests::{blob, generated, record};
    use crate::auth::authorized_keys::{FileKeyStore, MemoryKeyStore};
    use async_trait::async_trait;

    struct BrokenStore;

    #[async_trait]
    impl KeyStore for BrokenStore {
        async fn find(&self, _presented: &[u8]) -> anyhow::Result<Option<AuthorizedKey>> {
            anyhow::bail!("disk on fire")
        }
    }

    #[tokio::test]
    async fn empty_store_rejects_everyone() {
        let gate = AuthenticationGate::new(Arc::new(MemoryKeyStore::default()));
        let decision = gate.authenticate_blob("git", &blob(&generated())).await;
        assert_eq!(decision, AuthDecision::Reject);
    }

    #[tokio::test]
    async fn matching_key_is_accepted_regardless_of_user() {
        let public = generated();
        let store = MemoryKeyStore::from_text(&record(&public, "erin"));
        let gate = AuthenticationGate::new(Arc::new(store));

        for user in ["git", "root", "nobody"] {
            match gate.authenticate_blob(user, &blob(&public)).await {
                AuthDecision::Accept(identity) => {
                    assert_eq!(identity.user, user);
                    assert_eq!(identity.key.comment.as_deref(), Some("erin"));
                }
                AuthDecision::Reject => panic!("expected accept for {user}"),
            }
        }
    }

    #[tokio::test]
    async fn store_failure_fails_closed() {
        let gate = AuthenticationGate::new(Arc::new(BrokenStore));
        let decision = gate.authenticate_blob("git", &blob(&generated())).await;
        assert!(!decision.is_accept());
    }

    #[tokio::test]
    async fn generated_key_round_trips_through_file_store() {
        let pair = russh_keys::key::KeyPair::generate_ed25519();
        let public = pair.clone_public_key().unwrap();
        let other = russh_keys::key::KeyPair::generate_ed25519()
            .clone_public_key()
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        let line = format!("{} {} test@host\n", public.name(), public.public_key_base64());
        std::fs::write(&path, line).unwrap();

        let gate = AuthenticationGate::new(Arc::new(FileKeyStore::new(&path)));
        assert!(gate.authenticate("git", &public).await.is_accept());
        assert!(!gate.authenticate("git", &other).await.is_accept());
    }

    #[tokio::test]
    async fn missing_file_store_bootstraps_and_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        let gate = AuthenticationGate::new(Arc::new(FileKeyStore::new(&path)));
        let decision = gate.authenticate_blob("git", &blob(&generated())).await;
        assert_eq!(decision, AuthDecision::Reject);
        assert!(path.is_file());
    }
}
