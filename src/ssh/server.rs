//! SSH server bootstrap and the [`russh::server::Server`] implementation.

use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server::{self, Server};
use russh::MethodSet;
use russh_keys::key::KeyPair;
use tracing::info;

use super::session::SshSession;
use crate::config::SshConfig;
use crate::AppState;

// ---------------------------------------------------------------------------
// Server type
// ---------------------------------------------------------------------------

/// Top-level SSH server that hands off each incoming connection to an
/// [`SshSession`] handler.
pub struct SshServer {
    state: Arc<AppState>,
}

impl SshServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

impl server::Server for SshServer {
    type Handler = SshSession;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        info!(peer = ?peer_addr, "new SSH client connection");
        SshSession::new(Arc::clone(&self.state), peer_addr)
    }
}

// ---------------------------------------------------------------------------
// Host key
// ---------------------------------------------------------------------------

/// Load the host key from `path`, generating and persisting a fresh Ed25519
/// key (mode 0600) first if the file does not exist.  A file that exists but
/// cannot be decoded is an error, never silently replaced.
pub fn load_or_generate_host_key(path: &Path) -> Result<KeyPair> {
    if !path.exists() {
        generate_host_key(path)?;
    }

    let key = russh_keys::load_secret_key(path, None)
        .with_context(|| format!("failed to load SSH host key: {}", path.display()))?;
    info!(path = %path.display(), "loaded SSH host key");
    Ok(key)
}

fn generate_host_key(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create host key directory: {}", parent.display()))?;
    }

    let key = KeyPair::generate_ed25519();
    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem).context("failed to encode generated host key")?;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("failed to create host key file: {}", path.display()))?;
    file.write_all(&pem)
        .and_then(|()| file.sync_all())
        .with_context(|| format!("failed to write host key file: {}", path.display()))?;

    info!(path = %path.display(), "generated new Ed25519 SSH host key");
    Ok(())
}

// ---------------------------------------------------------------------------
// Server config
// ---------------------------------------------------------------------------

pub fn server_config(ssh: &SshConfig, host_key: KeyPair) -> server::Config {
    server::Config {
        keys: vec![host_key],
        methods: MethodSet::PUBLICKEY,
        inactivity_timeout: Some(Duration::from_secs(ssh.inactivity_timeout_secs)),
        auth_rejection_time: Duration::from_secs(ssh.auth_rejection_time_secs),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        max_auth_attempts: ssh.max_auth_attempts,
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Start the SSH listener.  Runs until the server is shut down or an
/// unrecoverable error occurs.
pub async fn start_ssh_server(state: Arc<AppState>) -> Result<()> {
    let ssh = &state.config.ssh;
    let listen_addr: SocketAddr = ssh
        .listen
        .parse()
        .with_context(|| format!("invalid SSH listen address: {:?}", ssh.listen))?;

    let host_key = load_or_generate_host_key(&ssh.host_key_path)?;
    let config = Arc::new(server_config(ssh, host_key));

    info!(address = %listen_addr, "starting SSH server");

    let mut ssh_server = SshServer::new(state);
    ssh_server
        .run_on_address(config, listen_addr)
        .await
        .context("SSH server exited with error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use russh_keys::PublicKeyBase64;

    #[test]
    fn host_key_is_generated_once_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssh").join("host_key");

        let first = load_or_generate_host_key(&path).unwrap();
        let second = load_or_generate_host_key(&path).unwrap();
        assert_eq!(
            first.clone_public_key().unwrap().public_key_base64(),
            second.clone_public_key().unwrap().public_key_base64()
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn corrupt_host_key_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host_key");
        std::fs::write(&path, "not a key").unwrap();

        assert!(load_or_generate_host_key(&path).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "not a key");
    }

    #[test]
    fn server_config_follows_ssh_settings() {
        let dir = tempfile::tempdir().unwrap();
        let key = load_or_generate_host_key(&dir.path().join("host_key")).unwrap();
        let ssh = SshConfig {
            inactivity_timeout_secs: 60,
            max_auth_attempts: 2,
            ..SshConfig::default()
        };

        let config = server_config(&ssh, key);
        assert_eq!(config.methods, MethodSet::PUBLICKEY);
        assert_eq!(config.inactivity_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.max_auth_attempts, 2);
        assert_eq!(config.keys.len(), 1);
    }
}
