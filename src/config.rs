use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub repos: ReposConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

// ---------------------------------------------------------------------------
// SSH listener
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    /// Socket address for the SSH listener (e.g. `0.0.0.0:2222`).
    #[serde(default = "default_ssh_listen")]
    pub listen: String,
    /// Private host key.  Generated (Ed25519) on first start if absent.
    #[serde(default = "default_host_key_path")]
    pub host_key_path: PathBuf,
    /// OpenSSH-style authorized keys file, re-read on every auth attempt.
    #[serde(default = "default_authorized_keys_path")]
    pub authorized_keys_path: PathBuf,
    /// Idle connections are dropped after this many seconds.
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,
    /// Delay applied to every rejected authentication attempt.
    #[serde(default = "default_auth_rejection_time")]
    pub auth_rejection_time_secs: u64,
    #[serde(default = "default_max_auth_attempts")]
    pub max_auth_attempts: usize,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            listen: default_ssh_listen(),
            host_key_path: default_host_key_path(),
            authorized_keys_path: default_authorized_keys_path(),
            inactivity_timeout_secs: default_inactivity_timeout(),
            auth_rejection_time_secs: default_auth_rejection_time(),
            max_auth_attempts: default_max_auth_attempts(),
        }
    }
}

fn default_ssh_listen() -> String {
    "0.0.0.0:2222".to_string()
}

fn default_host_key_path() -> PathBuf {
    PathBuf::from("/var/lib/agito/ssh/host_key")
}

fn default_authorized_keys_path() -> PathBuf {
    PathBuf::from("/var/lib/agito/ssh/authorized_keys")
}

fn default_inactivity_timeout() -> u64 {
    3600
}

fn default_auth_rejection_time() -> u64 {
    3
}

fn default_max_auth_attempts() -> usize {
    6
}

// ---------------------------------------------------------------------------
// Repository root
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ReposConfig {
    /// Directory whose immediate children are the managed bare repositories.
    #[serde(default = "default_repos_root")]
    pub root: PathBuf,
}

impl Default for ReposConfig {
    fn default() -> Self {
        Self {
            root: default_repos_root(),
        }
    }
}

fn default_repos_root() -> PathBuf {
    PathBuf::from("/var/lib/agito/repos")
}

// ---------------------------------------------------------------------------
// Git executable
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct GitConfig {
    /// Name or path of the `git` executable.
    #[serde(default = "default_git_binary")]
    pub binary: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            binary: default_git_binary(),
        }
    }
}

fn default_git_binary() -> String {
    "git".to_string()
}

// ---------------------------------------------------------------------------
// Hooks / pipeline
// ---------------------------------------------------------------------------

/// What the `post-receive` hook reports when a pipeline script fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineFailurePolicy {
    /// Log the failure and report success to the pusher.
    #[default]
    Ignore,
    /// Exit the hook with the failing pipeline's status.
    Propagate,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HooksConfig {
    /// Pipeline script file name, relative to the bare repository.
    #[serde(default = "default_pipeline_script")]
    pub pipeline_script: String,
    #[serde(default)]
    pub pipeline_failure: PipelineFailurePolicy,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            pipeline_script: default_pipeline_script(),
            pipeline_failure: PipelineFailurePolicy::default(),
        }
    }
}

fn default_pipeline_script() -> String {
    "agito-ci.sh".to_string()
}

// ---------------------------------------------------------------------------
// Health / metrics HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HttpConfig {
    /// Socket address for `/healthz` and `/metrics`.  Disabled when unset.
    #[serde(default)]
    pub listen: Option<String>,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config = parse_config(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    Ok(config)
}

/// Parse and validate a YAML document.
pub fn parse_config(contents: &str) -> Result<Config> {
    // An empty document deserialises to unit, not to an all-defaults map.
    if contents.trim().is_empty() {
        let config = Config::default();
        validate_config(&config)?;
        return Ok(config);
    }
    let config: Config = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<()> {
    config
        .ssh
        .listen
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid ssh.listen address: {:?}", config.ssh.listen))?;
    if let Some(ref listen) = config.http.listen {
        listen
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid http.listen address: {listen:?}"))?;
    }
    anyhow::ensure!(
        config.ssh.max_auth_attempts >= 1,
        "ssh.max_auth_attempts must be at least 1"
    );
    anyhow::ensure!(!config.git.binary.trim().is_empty(), "git.binary must not be empty");

    let script = &config.hooks.pipeline_script;
    anyhow::ensure!(
        !script.is_empty()
            && !script.contains('/')
            && !script.contains('\\')
            && !script.contains("..")
            && !script.contains(['\'', '"', '$', '`']),
        "hooks.pipeline_script must be a plain file name, got {script:?}"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
