//! Transport-agnostic execution of one session command.
//!
//! The [`Dispatcher`] receives an already classified [`Request`], routes it
//! to the sandbox + git subprocess or to the provisioner, streams data in
//! both directions, and always ends the session with an exit status.  It
//! writes through the [`SessionOutput`] port so the SSH layer stays a thin
//! adapter.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::command::{usage_message, Command, Request, Verb};
use crate::git::{GitExecutor, GitService, ProvisionError, Provisioner, ServiceProcess};
use crate::metrics::{CommandOutcome, MetricsRegistry, VerbLabel, VerbLabels};
use crate::sandbox::{Sandbox, SandboxError};

const PUMP_BUFFER: usize = 65536;

// ---------------------------------------------------------------------------
// Output port
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Where a session's output goes.
#[async_trait]
pub trait SessionOutput: Send + Sync {
    /// Write a chunk to the client.  An error means the client is gone.
    async fn write(&self, stream: Stream, data: &[u8]) -> Result<()>;

    /// Report the exit status and close the session.
    async fn finish(&self, exit_status: u32);
}

/// Per-session facts the dispatcher needs besides the command itself.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub user: String,
    pub peer: Option<SocketAddr>,
    /// `GIT_PROTOCOL` announced by the client through an `env` request.
    pub git_protocol: Option<String>,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Shared, read-only routing state.  One instance serves every session.
#[derive(Clone)]
pub struct Dispatcher {
    sandbox: Arc<Sandbox>,
    provisioner: Provisioner,
    git: Arc<dyn GitExecutor>,
    metrics: MetricsRegistry,
}

impl Dispatcher {
    pub fn new(
        sandbox: Arc<Sandbox>,
        provisioner: Provisioner,
        git: Arc<dyn GitExecutor>,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            sandbox,
            provisioner,
            git,
            metrics,
        }
    }

    /// Run `request` to completion and return its exit status.
    ///
    /// `input` carries client data for the subprocess; the sender side is
    /// dropped on client EOF.  When `cancel` fires (channel or connection
    /// closed) any subprocess is killed and no exit status is sent.
    pub async fn serve(
        &self,
        ctx: &SessionContext,
        request: Request,
        input: Receiver<Vec<u8>>,
        output: &dyn SessionOutput,
        cancel: CancellationToken,
    ) -> u32 {
        let metrics = &self.metrics.metrics;
        metrics.active_sessions.inc();

        let (verb, status, outcome) = match request {
            Request::Unknown(raw) => {
                warn!(user = %ctx.user, peer = ?ctx.peer, command = %raw, "unknown command");
                send_error(output, &format!("Unknown command: {raw}\n")).await;
                (VerbLabel::Unknown, 1, CommandOutcome::Rejected)
            }
            Request::Usage(verb) => {
                send_error(output, &usage_message(verb)).await;
                (verb.into(), 1, CommandOutcome::Rejected)
            }
            Request::Run(Command { verb, argument }) => {
                let (status, outcome) = match verb {
                    Verb::Service(service) => {
                        self.run_service(ctx, service, &argument, input, output, &cancel)
                            .await
                    }
                    Verb::CreateRepo => self.create_repo(ctx, &argument, output).await,
                };
                (verb.into(), status, outcome)
            }
        };

        metrics.record_command(verb, outcome);
        metrics.active_sessions.dec();

        if !cancel.is_cancelled() {
            output.finish(status).await;
        }
        status
    }

    async fn run_service(
        &self,
        ctx: &SessionContext,
        service: GitService,
        argument: &str,
        input: Receiver<Vec<u8>>,
        output: &dyn SessionOutput,
        cancel: &CancellationToken,
    ) -> (u32, CommandOutcome) {
        let handle = match self.sandbox.locate(argument) {
            Ok(handle) => handle,
            Err(e @ SandboxError::Violation) => {
                warn!(
                    target: "agito::audit",
                    user = %ctx.user,
                    peer = ?ctx.peer,
                    service = %service,
                    requested = %argument,
                    "sandbox violation"
                );
                self.metrics.metrics.sandbox_violations.inc();
                send_error(output, &format!("{e}\n")).await;
                return (1, CommandOutcome::Rejected);
            }
            Err(e @ SandboxError::NotFound(_)) => {
                info!(user = %ctx.user, service = %service, requested = %argument, "repository not found");
                send_error(output, &format!("{e}\n")).await;
                return (1, CommandOutcome::Failure);
            }
        };

        let process = match self.git.spawn_service(
            service,
            &handle.path,
            ctx.git_protocol.as_deref(),
        ) {
            Ok(p) => p,
            Err(e) => {
                error!(service = %service, repo = %handle.relative.display(), error = %format!("{e:#}"), "failed to spawn git service");
                send_error(output, &format!("Failed to start {service}\n")).await;
                return (1, CommandOutcome::Failure);
            }
        };

        info!(
            user = %ctx.user,
            service = %service,
            repo = %handle.relative.display(),
            "starting git service"
        );
        let started = Instant::now();
        let status = stream_service(process, input, output, cancel).await;
        self.metrics
            .metrics
            .service_duration_seconds
            .get_or_create(&VerbLabels {
                verb: Verb::Service(service).into(),
            })
            .observe(started.elapsed().as_secs_f64());

        match status {
            Some(code) => {
                info!(service = %service, repo = %handle.relative.display(), exit_code = code, "git service finished");
                let outcome = if code == 0 {
                    CommandOutcome::Success
                } else {
                    CommandOutcome::Failure
                };
                (code, outcome)
            }
            None => {
                info!(service = %service, repo = %handle.relative.display(), "git service cancelled");
                (1, CommandOutcome::Failure)
            }
        }
    }

    async fn create_repo(
        &self,
        ctx: &SessionContext,
        name: &str,
        output: &dyn SessionOutput,
    ) -> (u32, CommandOutcome) {
        // Provisioning is not cancellable: it either completes or cleans up.
        match self.provisioner.create(name).await {
            Ok(handle) => {
                info!(user = %ctx.user, repo = %handle.relative.display(), "provisioned repository");
                self.metrics.metrics.repos_provisioned.inc();
                let msg = format!("Repository created: {}\n", handle.relative.display());
                let _ = output.write(Stream::Stdout, msg.as_bytes()).await;
                (0, CommandOutcome::Success)
            }
            Err(e) => {
                match &e {
                    ProvisionError::InvalidName => {
                        warn!(target: "agito::audit", user = %ctx.user, peer = ?ctx.peer, requested = %name, "invalid repository name")
                    }
                    ProvisionError::AlreadyExists(repo) => {
                        info!(user = %ctx.user, repo = %repo, "repository already exists")
                    }
                    ProvisionError::Failed(_) => {}
                }
                send_error(output, &format!("{e}\n")).await;
                let outcome = match e {
                    ProvisionError::Failed(_) => CommandOutcome::Failure,
                    _ => CommandOutcome::Rejected,
                };
                (1, outcome)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

async fn send_error(output: &dyn SessionOutput, msg: &str) {
    if let Err(e) = output.write(Stream::Stderr, msg.as_bytes()).await {
        debug!(error = %e, "failed to deliver error message");
    }
}

/// Wire the subprocess to the session until it exits.  Returns `None` when
/// cancelled, in which case the process has been killed.
async fn stream_service(
    process: ServiceProcess,
    mut input: Receiver<Vec<u8>>,
    output: &dyn SessionOutput,
    cancel: &CancellationToken,
) -> Option<u32> {
    let ServiceProcess {
        mut stdin,
        stdout,
        stderr,
        exit,
    } = process;

    // Client -> stdin runs on its own task: the client may never send EOF
    // before the service exits, so it must not gate completion.
    let stdin_pump = tokio::spawn(async move {
        while let Some(chunk) = input.recv().await {
            if let Err(e) = stdin.write_all(&chunk).await {
                debug!(error = %e, "service stdin closed");
                return;
            }
        }
        let _ = stdin.shutdown().await;
    });

    let run = async {
        let (exit, (), ()) = tokio::join!(
            exit,
            pump(stdout, output, Stream::Stdout),
            pump(stderr, output, Stream::Stderr),
        );
        match exit {
            Ok(code) => u32::try_from(code).unwrap_or(1),
            Err(e) => {
                error!(error = %e, "failed waiting for git service");
                1
            }
        }
    };

    // Dropping `run` drops the exit future, which kills the process.
    let status = tokio::select! {
        status = run => Some(status),
        () = cancel.cancelled() => None,
    };
    stdin_pump.abort();
    status
}

/// Copy `reader` to the session until EOF.  Once the client stops accepting
/// data the rest is drained and discarded so the process cannot block on a
/// full pipe.
async fn pump<R>(mut reader: R, output: &dyn SessionOutput, stream: Stream)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; PUMP_BUFFER];
    let mut client_open = true;
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if client_open && output.write(stream, &buf[..n]).await.is_err() {
                    debug!(?stream, "client stopped accepting data; draining");
                    client_open = false;
                }
            }
            Err(e) => {
                debug!(?stream, error = %e, "error reading service output");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::PipelineFailurePolicy;
    use crate::git::HookSet;
    use crate::ssh::command::parse_request;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc::channel;

    /// Records every spawn and runs an in-memory "service" that announces
    /// itself, echoes stdin to stdout, and exits with `exit_code`.
    pub(crate) struct FakeGit {
        pub spawned: Mutex<Vec<(GitService, PathBuf, Option<String>)>>,
        pub exit_code: i32,
    }

    impl FakeGit {
        pub(crate) fn new(exit_code: i32) -> Self {
            Self {
                spawned: Mutex::new(Vec::new()),
                exit_code,
            }
        }

        pub(crate) fn spawn_count(&self) -> usize {
            self.spawned.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl GitExecutor for FakeGit {
        fn spawn_service(
            &self,
            service: GitService,
            repo: &Path,
            git_protocol: Option<&str>,
        ) -> Result<ServiceProcess> {
            self.spawned.lock().unwrap().push((
                service,
                repo.to_path_buf(),
                git_protocol.map(str::to_string),
            ));

            let (stdin_w, mut stdin_r) = tokio::io::duplex(PUMP_BUFFER);
            let (mut stdout_w, stdout_r) = tokio::io::duplex(PUMP_BUFFER);
            let (mut stderr_w, stderr_r) = tokio::io::duplex(PUMP_BUFFER);
            let banner = format!("{} {}\n", service.subcommand(), repo.display());
            let code = self.exit_code;

            let task = tokio::spawn(async move {
                stdout_w.write_all(banner.as_bytes()).await?;
                stderr_w.write_all(b"fake stderr\n").await?;
                drop(stderr_w);
                tokio::io::copy(&mut stdin_r, &mut stdout_w).await?;
                Ok::<_, std::io::Error>(code)
            });
            let exit: crate::git::commands::ExitFuture = Box::pin(async move {
                task.await.map_err(std::io::Error::other)?
            });

            Ok(ServiceProcess {
                stdin: Box::new(stdin_w),
                stdout: Box::new(stdout_r),
                stderr: Box::new(stderr_r),
                exit,
            })
        }

        async fn init_bare(&self, path: &Path) -> Result<()> {
            std::fs::write(path.join("HEAD"), "ref: refs/heads/main\n")?;
            std::fs::create_dir_all(path.join("refs"))?;
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingOutput {
        pub stdout: Mutex<Vec<u8>>,
        pub stderr: Mutex<Vec<u8>>,
        pub status: Mutex<Option<u32>>,
    }

    impl RecordingOutput {
        pub(crate) fn stdout_text(&self) -> String {
            String::from_utf8_lossy(&self.stdout.lock().unwrap()).into_owned()
        }

        pub(crate) fn stderr_text(&self) -> String {
            String::from_utf8_lossy(&self.stderr.lock().unwrap()).into_owned()
        }

        pub(crate) fn status(&self) -> Option<u32> {
            *self.status.lock().unwrap()
        }
    }

    #[async_trait]
    impl SessionOutput for RecordingOutput {
        async fn write(&self, stream: Stream, data: &[u8]) -> Result<()> {
            match stream {
                Stream::Stdout => self.stdout.lock().unwrap().extend_from_slice(data),
                Stream::Stderr => self.stderr.lock().unwrap().extend_from_slice(data),
            }
            Ok(())
        }

        async fn finish(&self, exit_status: u32) {
            *self.status.lock().unwrap() = Some(exit_status);
        }
    }

    pub(crate) fn dispatcher(
        root: &Path,
        git: Arc<FakeGit>,
    ) -> (Dispatcher, MetricsRegistry) {
        let sandbox = Arc::new(Sandbox::new(root).unwrap());
        let hooks = HookSet::new("agito-ci.sh", PipelineFailurePolicy::Ignore);
        let provisioner = Provisioner::new(sandbox.clone(), git.clone(), hooks);
        let metrics = MetricsRegistry::new();
        (
            Dispatcher::new(sandbox, provisioner, git, metrics.clone()),
            metrics,
        )
    }

    fn ctx() -> SessionContext {
        SessionContext {
            user: "git".to_string(),
            peer: None,
            git_protocol: Some("version=2".to_string()),
        }
    }

    async fn serve_line(
        dispatcher: &Dispatcher,
        line: &str,
        stdin: &[u8],
    ) -> RecordingOutput {
        let (tx, rx) = channel(1);
        if !stdin.is_empty() {
            tx.send(stdin.to_vec()).await.unwrap();
        }
        drop(tx);
        let output = RecordingOutput::default();
        let request = parse_request(line.as_bytes()).unwrap();
        dispatcher
            .serve(&ctx(), request, rx, &output, CancellationToken::new())
            .await;
        output
    }

    #[tokio::test]
    async fn unknown_command_spawns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let git = Arc::new(FakeGit::new(0));
        let (d, _) = dispatcher(dir.path(), git.clone());

        let out = serve_line(&d, "rm -rf /", b"").await;
        assert_eq!(out.stderr_text(), "Unknown command: rm -rf /\n");
        assert_eq!(out.status(), Some(1));
        assert_eq!(git.spawn_count(), 0);
    }

    #[tokio::test]
    async fn traversal_is_rejected_before_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let git = Arc::new(FakeGit::new(0));
        let (d, metrics) = dispatcher(dir.path(), git.clone());

        for line in [
            "git-upload-pack '../../etc/passwd'",
            "git-receive-pack '/../../etc'",
            "git-upload-pack 'foo/../../bar'",
        ] {
            let out = serve_line(&d, line, b"").await;
            assert_eq!(out.stderr_text(), "Invalid repository path\n", "{line}");
            assert_eq!(out.status(), Some(1));
        }
        assert_eq!(git.spawn_count(), 0);
        assert_eq!(metrics.metrics.sandbox_violations.get(), 3);
    }

    #[tokio::test]
    async fn missing_repository_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let git = Arc::new(FakeGit::new(0));
        let (d, _) = dispatcher(dir.path(), git.clone());

        let out = serve_line(&d, "git-upload-pack '/ghost.git'", b"").await;
        assert_eq!(out.stderr_text(), "Repository not found: ghost.git\n");
        assert_eq!(out.status(), Some(1));
        assert_eq!(git.spawn_count(), 0);
    }

    #[tokio::test]
    async fn service_streams_both_ways_and_propagates_status() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("demo.git")).unwrap();
        let git = Arc::new(FakeGit::new(0));
        let (d, _) = dispatcher(dir.path(), git.clone());

        let out = serve_line(&d, "git-receive-pack '/demo.git'", b"0000pack-data").await;

        let repo = std::fs::canonicalize(dir.path().join("demo.git")).unwrap();
        assert_eq!(
            out.stdout_text(),
            format!("receive-pack {}\n0000pack-data", repo.display())
        );
        assert_eq!(out.stderr_text(), "fake stderr\n");
        assert_eq!(out.status(), Some(0));

        let spawned = git.spawned.lock().unwrap();
        assert_eq!(
            *spawned,
            vec![(GitService::ReceivePack, repo, Some("version=2".to_string()))]
        );
    }

    #[tokio::test]
    async fn non_zero_exit_is_propagated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("demo.git")).unwrap();
        let git = Arc::new(FakeGit::new(7));
        let (d, _) = dispatcher(dir.path(), git);

        let out = serve_line(&d, "git-upload-pack demo", b"").await;
        assert_eq!(out.status(), Some(7));
    }

    #[tokio::test]
    async fn create_repo_then_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let git = Arc::new(FakeGit::new(0));
        let (d, metrics) = dispatcher(dir.path(), git.clone());

        let out = serve_line(&d, "agito-create-repo demo", b"").await;
        assert_eq!(out.stdout_text(), "Repository created: demo.git\n");
        assert_eq!(out.status(), Some(0));
        assert!(dir.path().join("demo.git").join("HEAD").is_file());

        let out = serve_line(&d, "agito-create-repo demo", b"").await;
        assert_eq!(out.stderr_text(), "Repository already exists: demo.git\n");
        assert_eq!(out.status(), Some(1));

        let out = serve_line(&d, "agito-create-repo ../evil", b"").await;
        assert_eq!(out.stderr_text(), "Invalid repository name\n");
        assert_eq!(out.status(), Some(1));

        assert_eq!(metrics.metrics.repos_provisioned.get(), 1);
        assert_eq!(git.spawn_count(), 0);
    }

    #[tokio::test]
    async fn usage_for_missing_argument() {
        let dir = tempfile::tempdir().unwrap();
        let (d, _) = dispatcher(dir.path(), Arc::new(FakeGit::new(0)));
        let out = serve_line(&d, "git-upload-pack", b"").await;
        assert_eq!(out.stderr_text(), "Usage: git-upload-pack <repository-path>\n");
        assert_eq!(out.status(), Some(1));
    }

    #[tokio::test]
    async fn cancellation_stops_a_running_service() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("demo.git")).unwrap();
        let git = Arc::new(FakeGit::new(0));
        let (d, metrics) = dispatcher(dir.path(), git);

        // Keep the sender alive: the fake service waits for stdin EOF forever.
        let (tx, rx) = channel::<Vec<u8>>(1);
        let output = RecordingOutput::default();
        let cancel = CancellationToken::new();
        let request = parse_request(b"git-upload-pack demo.git").unwrap();
        let ctx = ctx();

        let canceller = {
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            }
        };
        let (status, ()) = tokio::time::timeout(
            Duration::from_secs(5),
            async { tokio::join!(d.serve(&ctx, request, rx, &output, cancel.clone()), canceller) },
        )
        .await
        .expect("serve did not return after cancellation");

        assert_eq!(status, 1);
        assert_eq!(output.status(), None);
        assert_eq!(metrics.metrics.active_sessions.get(), 0);
        drop(tx);
    }

    #[tokio::test]
    async fn sessions_run_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("a.git")).unwrap();
        std::fs::create_dir(dir.path().join("b.git")).unwrap();
        let git = Arc::new(FakeGit::new(0));
        let (d, _) = dispatcher(dir.path(), git.clone());

        let (a, b) = tokio::join!(
            serve_line(&d, "git-upload-pack a.git", b"first"),
            serve_line(&d, "git-upload-pack b.git", b"second"),
        );
        assert!(a.stdout_text().ends_with("first"));
        assert!(b.stdout_text().ends_with("second"));
        assert_eq!(git.spawn_count(), 2);
    }
}
