//! agito: a sandboxed Git-over-SSH gateway.
//!
//! Authenticated clients may run `git-upload-pack` or `git-receive-pack`
//! against bare repositories under a single root, or create new ones with
//! `agito-create-repo`.  Pushes trigger a per-repository pipeline script
//! through the installed `post-receive` hook.

pub mod auth;
pub mod client;
pub mod config;
pub mod git;
pub mod health;
pub mod metrics;
pub mod sandbox;
pub mod ssh;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::auth::{AuthenticationGate, KeyStore};
use crate::config::Config;
use crate::git::{GitExecutor, HookSet, Provisioner};
use crate::metrics::MetricsRegistry;
use crate::sandbox::Sandbox;
use crate::ssh::Dispatcher;

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared by every SSH connection and the health endpoint.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub gate: AuthenticationGate,
    pub dispatcher: Dispatcher,
    pub sandbox: Arc<Sandbox>,
    pub metrics: MetricsRegistry,
}

impl AppState {
    /// Wire the components together.  The repository root must exist.
    pub fn new(
        config: Arc<Config>,
        keys: Arc<dyn KeyStore>,
        git: Arc<dyn GitExecutor>,
        metrics: MetricsRegistry,
    ) -> Result<Self> {
        let sandbox = Arc::new(
            Sandbox::new(&config.repos.root).context("failed to open repository root")?,
        );
        let provisioner = Provisioner::new(
            Arc::clone(&sandbox),
            Arc::clone(&git),
            HookSet::from_config(&config.hooks),
        );
        let dispatcher = Dispatcher::new(Arc::clone(&sandbox), provisioner, git, metrics.clone());

        Ok(Self {
            config,
            gate: AuthenticationGate::new(keys),
            dispatcher,
            sandbox,
            metrics,
        })
    }
}
