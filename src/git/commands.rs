//! External-process port for the `git` executable.
//!
//! The dispatcher never talks to `git` directly; it goes through
//! [`GitExecutor`] so that session handling can be exercised with an
//! in-memory fake.  [`SystemGit`] is the production implementation built on
//! [`tokio::process::Command`].

use std::fmt;
use std::future::Future;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tracing::{debug, instrument};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The two transport services a client may run against a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GitService {
    UploadPack,
    ReceivePack,
}

impl GitService {
    /// The `git` subcommand implementing this service.
    pub fn subcommand(&self) -> &'static str {
        match self {
            Self::UploadPack => "upload-pack",
            Self::ReceivePack => "receive-pack",
        }
    }
}

impl fmt::Display for GitService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "git-{}", self.subcommand())
    }
}

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Resolves to the exit code.  Dropping it before completion terminates the
/// underlying process.
pub type ExitFuture = Pin<Box<dyn Future<Output = io::Result<i32>> + Send>>;

/// A running service with its standard streams detached.
pub struct ServiceProcess {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: BoxedReader,
    pub exit: ExitFuture,
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

#[async_trait]
pub trait GitExecutor: Send + Sync {
    /// Start `git <service> <repo>` with piped standard streams.
    fn spawn_service(
        &self,
        service: GitService,
        repo: &Path,
        git_protocol: Option<&str>,
    ) -> Result<ServiceProcess>;

    /// Run `git init --bare <path>` on an existing, empty directory.  No
    /// template is copied, so the repository starts without any hooks.
    async fn init_bare(&self, path: &Path) -> Result<()>;
}

// ---------------------------------------------------------------------------
// System git
// ---------------------------------------------------------------------------

/// [`GitExecutor`] backed by the installed `git` binary.
#[derive(Debug, Clone)]
pub struct SystemGit {
    binary: String,
}

impl SystemGit {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl GitExecutor for SystemGit {
    #[instrument(skip(self), fields(repo = %repo.display()))]
    fn spawn_service(
        &self,
        service: GitService,
        repo: &Path,
        git_protocol: Option<&str>,
    ) -> Result<ServiceProcess> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(service.subcommand()).arg(repo);

        // Forward the client's GIT_PROTOCOL so the service speaks the
        // protocol version the client negotiated.
        if let Some(proto) = git_protocol {
            cmd.env("GIT_PROTOCOL", proto);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {} {}", self.binary, service.subcommand()))?;
        debug!(pid = ?child.id(), "spawned git service");

        let stdin = child.stdin.take().context("child stdin was not piped")?;
        let stdout = child.stdout.take().context("child stdout was not piped")?;
        let stderr = child.stderr.take().context("child stderr was not piped")?;

        let exit: ExitFuture = Box::pin(async move {
            let status = child.wait().await?;
            Ok(status.code().unwrap_or(1))
        });

        Ok(ServiceProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            exit,
        })
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    async fn init_bare(&self, path: &Path) -> Result<()> {
        let output = Command::new(&self.binary)
            .arg("init")
            .arg("--bare")
            // An empty template keeps system-wide sample or custom hooks out
            // of the repository; agito installs its own set afterwards.
            .arg("--template=")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("failed to spawn git init --bare")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "git init --bare failed (status {}): {}",
                output.status,
                stderr.trim(),
            );
        }

        debug!("bare repo initialised");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
