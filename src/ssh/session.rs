//! SSH session handler implementing the `russh` 0.46 [`Handler`] trait.
//!
//! Each inbound connection is served by a dedicated [`SshSession`].  The
//! handler authenticates through the [`crate::auth::AuthenticationGate`], tracks one
//! [`ChannelState`] per session channel, and hands every accepted `exec`
//! request to the [`super::dispatch::Dispatcher`] on a spawned task.  Everything else a
//! client may ask for (shells, ptys, subsystems, forwarding) is refused.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use russh_keys::key::PublicKey;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::command::parse_request;
use super::dispatch::{SessionContext, SessionOutput, Stream};
use crate::auth::{AuthDecision, Identity};
use crate::AppState;

/// Client data chunks queued for a command before `data` waits for it.
const INPUT_QUEUE_CHUNKS: usize = 16;

/// How long a full input queue may stay full before the command is
/// cancelled.
const INPUT_STALL_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Channel output
// ---------------------------------------------------------------------------

/// [`SessionOutput`] that writes to one SSH channel through a session
/// [`Handle`], usable from outside the handler callbacks.
pub struct ChannelOutput {
    handle: Handle,
    channel: ChannelId,
}

impl ChannelOutput {
    pub fn new(handle: Handle, channel: ChannelId) -> Self {
        Self { handle, channel }
    }
}

#[async_trait]
impl SessionOutput for ChannelOutput {
    async fn write(&self, stream: Stream, data: &[u8]) -> Result<()> {
        let buf = CryptoVec::from_slice(data);
        let sent = match stream {
            Stream::Stdout => self.handle.data(self.channel, buf).await,
            Stream::Stderr => self.handle.extended_data(self.channel, 1, buf).await,
        };
        sent.map_err(|_| anyhow!("channel {:?} is closed", self.channel))
    }

    /// Send exit-status, EOF, and close in the order required by RFC 4254.
    /// Git's SSH transport treats a close without exit-status as "the remote
    /// end hung up unexpectedly".
    async fn finish(&self, exit_status: u32) {
        let _ = self.handle.exit_status_request(self.channel, exit_status).await;
        let _ = self.handle.eof(self.channel).await;
        let _ = self.handle.close(self.channel).await;
    }
}

// ---------------------------------------------------------------------------
// Per-channel state
// ---------------------------------------------------------------------------

/// Lifecycle of one session channel: open, then at most one command.
#[derive(Debug)]
pub struct ChannelState {
    /// Client data for the running command.  `None` before exec and after
    /// client EOF.
    input: Option<Sender<Vec<u8>>>,
    git_protocol: Option<String>,
    exec_started: bool,
    cancel: CancellationToken,
}

/// Outcome of an `exec` request against the channel table.
#[derive(Debug)]
pub enum ExecAdmission {
    Accepted {
        input: Receiver<Vec<u8>>,
        git_protocol: Option<String>,
        cancel: CancellationToken,
    },
    /// The channel already ran a command; it has been cancelled.
    Duplicate,
    UnknownChannel,
}

/// All open channels of one connection, keyed by channel id.  Every channel
/// token is a child of the connection token, so cancelling the connection
/// cancels them all.
#[derive(Debug)]
pub struct ChannelTable<K = ChannelId> {
    channels: HashMap<K, ChannelState>,
    cancel: CancellationToken,
    queue_chunks: usize,
    stall_timeout: Duration,
}

impl<K: Copy + Eq + Hash + Debug> ChannelTable<K> {
    pub fn new(cancel: CancellationToken) -> Self {
        Self::with_limits(cancel, INPUT_QUEUE_CHUNKS, INPUT_STALL_TIMEOUT)
    }

    pub fn with_limits(
        cancel: CancellationToken,
        queue_chunks: usize,
        stall_timeout: Duration,
    ) -> Self {
        Self {
            channels: HashMap::new(),
            cancel,
            queue_chunks: queue_chunks.max(1),
            stall_timeout,
        }
    }

    pub fn open(&mut self, id: K) {
        self.channels.insert(
            id,
            ChannelState {
                input: None,
                git_protocol: None,
                exec_started: false,
                cancel: self.cancel.child_token(),
            },
        );
    }

    pub fn set_git_protocol(&mut self, id: K, value: &str) {
        if let Some(state) = self.channels.get_mut(&id) {
            state.git_protocol = Some(value.to_string());
        }
    }

    pub fn begin_exec(&mut self, id: K) -> ExecAdmission {
        let Some(state) = self.channels.get_mut(&id) else {
            return ExecAdmission::UnknownChannel;
        };
        if state.exec_started {
            state.input = None;
            state.cancel.cancel();
            return ExecAdmission::Duplicate;
        }
        state.exec_started = true;

        let (tx, rx) = channel(self.queue_chunks);
        state.input = Some(tx);
        ExecAdmission::Accepted {
            input: rx,
            git_protocol: state.git_protocol.clone(),
            cancel: state.cancel.clone(),
        }
    }

    /// Mark a channel as used without running anything on it.
    pub fn refuse(&mut self, id: K) {
        if let Some(state) = self.channels.get_mut(&id) {
            state.exec_started = true;
        }
    }

    /// Queue client data for the running command.  Data arriving before an
    /// exec or after EOF is dropped.
    ///
    /// The queue is bounded: while it is full this waits, which stops the
    /// connection from reading further packets.  A command that leaves the
    /// queue full for longer than the stall timeout is cancelled.
    pub async fn forward(&mut self, id: K, data: &[u8]) {
        let stall_timeout = self.stall_timeout;
        let Some(state) = self.channels.get_mut(&id) else {
            return;
        };
        let Some(tx) = state.input.clone() else {
            return;
        };

        match tokio::time::timeout(stall_timeout, tx.send(data.to_vec())).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                debug!(channel = ?id, "command no longer reading input");
                state.input = None;
            }
            Err(_) => {
                warn!(channel = ?id, "command stopped reading input; cancelling");
                state.input = None;
                state.cancel.cancel();
            }
        }
    }

    /// Client EOF: close the command's stdin.
    pub fn eof(&mut self, id: K) {
        if let Some(state) = self.channels.get_mut(&id) {
            state.input = None;
        }
    }

    /// Channel closed by the client: stop whatever runs on it.
    pub fn close(&mut self, id: K) {
        if let Some(state) = self.channels.remove(&id) {
            state.cancel.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Per-connection SSH session state.
pub struct SshSession {
    state: Arc<AppState>,
    peer_addr: Option<SocketAddr>,
    identity: Option<Identity>,
    channels: ChannelTable,
    cancel: CancellationToken,
}

impl SshSession {
    /// Create a new session for an incoming connection.
    pub fn new(state: Arc<AppState>, peer_addr: Option<SocketAddr>) -> Self {
        let cancel = CancellationToken::new();
        Self {
            state,
            peer_addr,
            identity: None,
            channels: ChannelTable::new(cancel.clone()),
            cancel,
        }
    }

    fn user(&self) -> String {
        self.identity
            .as_ref()
            .map(|identity| identity.user.clone())
            .unwrap_or_default()
    }

    fn refuse(&mut self, channel: ChannelId, session: &mut Session) {
        self.channels.refuse(channel);
        session.channel_failure(channel);
        session.close(channel);
    }
}

impl Drop for SshSession {
    /// The connection is gone: kill every subprocess it started.
    fn drop(&mut self) {
        debug!(peer = ?self.peer_addr, "SSH connection closed");
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Handler implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl Handler for SshSession {
    type Error = anyhow::Error;

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let decision = self.state.gate.authenticate(user, key).await;
        self.state.metrics.metrics.record_auth(decision.is_accept());

        match decision {
            AuthDecision::Accept(identity) => {
                info!(
                    peer = ?self.peer_addr,
                    user = %identity.user,
                    fingerprint = %identity.key.fingerprint(),
                    "SSH client authenticated"
                );
                self.identity = Some(identity);
                Ok(Auth::Accept)
            }
            AuthDecision::Reject => Ok(Auth::Reject {
                proceed_with_methods: None,
            }),
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.open(channel.id());
        Ok(true)
    }

    /// Git clients send `GIT_PROTOCOL=version=2` before the exec request.
    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if variable_name == "GIT_PROTOCOL" {
            debug!(value = %variable_value, "captured GIT_PROTOCOL from client");
            self.channels.set_git_protocol(channel, variable_value);
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.forward(channel, data).await;
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.eof(channel);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.close(channel);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let user = self.user();
        debug!(
            peer = ?self.peer_addr,
            user = %user,
            command = %String::from_utf8_lossy(data),
            "SSH exec request"
        );

        let (input, git_protocol, cancel) = match self.channels.begin_exec(channel_id) {
            ExecAdmission::Accepted {
                input,
                git_protocol,
                cancel,
            } => (input, git_protocol, cancel),
            ExecAdmission::Duplicate => {
                warn!(peer = ?self.peer_addr, user = %user, "second exec on one channel");
                session.channel_failure(channel_id);
                session.close(channel_id);
                return Ok(());
            }
            ExecAdmission::UnknownChannel => {
                session.channel_failure(channel_id);
                return Ok(());
            }
        };

        let request = match parse_request(data) {
            Ok(request) => request,
            Err(e) => {
                warn!(peer = ?self.peer_addr, user = %user, error = %e, "malformed exec request");
                session.channel_failure(channel_id);
                session.close(channel_id);
                return Ok(());
            }
        };
        session.channel_success(channel_id);

        let ctx = SessionContext {
            user,
            peer: self.peer_addr,
            git_protocol,
        };
        let output = ChannelOutput::new(session.handle(), channel_id);
        let dispatcher = self.state.dispatcher.clone();
        tokio::spawn(async move {
            dispatcher.serve(&ctx, request, input, &output, cancel).await;
        });
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        warn!(peer = ?self.peer_addr, user = %self.user(), "refused shell request");
        self.refuse(channel, session);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        warn!(peer = ?self.peer_addr, user = %self.user(), subsystem = %name, "refused subsystem request");
        self.refuse(channel, session);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(peer = ?self.peer_addr, "refused pty request");
        self.refuse(channel, session);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn admitted(admission: ExecAdmission) -> (Receiver<Vec<u8>>, Option<String>, CancellationToken) {
        match admission {
            ExecAdmission::Accepted {
                input,
                git_protocol,
                cancel,
            } => (input, git_protocol, cancel),
            other => panic!("expected Accepted, got {other:?}"),
        }
    }

    #[test]
    fn exec_on_unknown_channel_is_refused() {
        let mut table = ChannelTable::<u32>::new(CancellationToken::new());
        assert!(matches!(
            table.begin_exec(7u32),
            ExecAdmission::UnknownChannel
        ));
    }

    #[tokio::test]
    async fn data_flows_until_eof() {
        let mut table = ChannelTable::<u32>::new(CancellationToken::new());
        let id = 0u32;
        table.open(id);
        table.set_git_protocol(id, "version=2");

        // Data before exec has nowhere to go.
        table.forward(id, b"early").await;

        let (mut input, proto, _) = admitted(table.begin_exec(id));
        assert_eq!(proto.as_deref(), Some("version=2"));

        table.forward(id, b"one").await;
        table.forward(id, b"two").await;
        table.eof(id);
        table.forward(id, b"late").await;

        assert_eq!(input.recv().await.as_deref(), Some(&b"one"[..]));
        assert_eq!(input.recv().await.as_deref(), Some(&b"two"[..]));
        assert_eq!(input.recv().await, None);
    }

    #[test]
    fn second_exec_cancels_the_first() {
        let mut table = ChannelTable::<u32>::new(CancellationToken::new());
        let id = 1u32;
        table.open(id);

        let (_input, _, cancel) = admitted(table.begin_exec(id));
        assert!(matches!(table.begin_exec(id), ExecAdmission::Duplicate));
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn refused_channel_accepts_no_exec() {
        let mut table = ChannelTable::<u32>::new(CancellationToken::new());
        let id = 2u32;
        table.open(id);
        table.refuse(id);
        assert!(matches!(table.begin_exec(id), ExecAdmission::Duplicate));
    }

    #[test]
    fn close_cancels_only_that_channel() {
        let mut table = ChannelTable::<u32>::new(CancellationToken::new());
        let (a, b) = (3u32, 4u32);
        table.open(a);
        table.open(b);
        let (_ia, _, cancel_a) = admitted(table.begin_exec(a));
        let (_ib, _, cancel_b) = admitted(table.begin_exec(b));

        table.close(a);
        assert!(cancel_a.is_cancelled());
        assert!(!cancel_b.is_cancelled());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn connection_cancel_reaches_every_channel() {
        let connection = CancellationToken::new();
        let mut table = ChannelTable::<u32>::new(connection.clone());
        let (a, b) = (5u32, 6u32);
        table.open(a);
        table.open(b);
        let (_ia, _, cancel_a) = admitted(table.begin_exec(a));
        let (_ib, _, cancel_b) = admitted(table.begin_exec(b));

        connection.cancel();
        assert!(cancel_a.is_cancelled());
        assert!(cancel_b.is_cancelled());
    }

    #[tokio::test]
    async fn full_input_queue_applies_back_pressure() {
        let mut table =
            ChannelTable::<u32>::with_limits(CancellationToken::new(), 2, Duration::from_secs(5));
        let id = 8u32;
        table.open(id);
        let (mut input, _, cancel) = admitted(table.begin_exec(id));

        table.forward(id, b"a").await;
        table.forward(id, b"b").await;

        // The third chunk only goes in once the reader makes room.
        let reader = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut seen = Vec::new();
            while let Some(chunk) = input.recv().await {
                seen.push(chunk);
            }
            seen
        });
        table.forward(id, b"c").await;
        table.eof(id);

        let seen = reader.await.unwrap();
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn stalled_command_is_cancelled_and_queue_stays_bounded() {
        let mut table =
            ChannelTable::<u32>::with_limits(CancellationToken::new(), 2, Duration::from_millis(50));
        let id = 9u32;
        table.open(id);
        let (mut input, _, cancel) = admitted(table.begin_exec(id));

        for _ in 0..5 {
            tokio::time::timeout(Duration::from_secs(5), table.forward(id, &[0u8; 1024]))
                .await
                .expect("forward must not block past the stall timeout");
        }
        assert!(cancel.is_cancelled());

        // Only what fit in the queue was ever buffered; the rest was refused.
        let mut queued = 0;
        while let Some(chunk) = input.recv().await {
            assert_eq!(chunk.len(), 1024);
            queued += 1;
        }
        assert_eq!(queued, 2);
    }
}
