use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::git::GitService;
use crate::ssh::command::Verb;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum AuthOutcome {
    Accepted,
    Rejected,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AuthLabels {
    pub outcome: AuthOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum VerbLabel {
    UploadPack,
    ReceivePack,
    CreateRepo,
    Unknown,
}

impl From<Verb> for VerbLabel {
    fn from(verb: Verb) -> Self {
        match verb {
            Verb::Service(GitService::UploadPack) => Self::UploadPack,
            Verb::Service(GitService::ReceivePack) => Self::ReceivePack,
            Verb::CreateRepo => Self::CreateRepo,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CommandOutcome {
    Success,
    Failure,
    Rejected,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CommandLabels {
    pub verb: VerbLabel,
    pub outcome: CommandOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct VerbLabels {
    pub verb: VerbLabel,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the gateway.
pub struct Metrics {
    pub auth_attempts: Family<AuthLabels, Counter>,
    pub commands: Family<CommandLabels, Counter>,
    pub sandbox_violations: Counter,
    pub repos_provisioned: Counter,
    pub active_sessions: Gauge,
    pub service_duration_seconds: Family<VerbLabels, Histogram>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let auth_attempts = Family::<AuthLabels, Counter>::default();
        registry.register(
            "agito_auth_attempts",
            "Public-key authentication attempts by outcome",
            auth_attempts.clone(),
        );

        let commands = Family::<CommandLabels, Counter>::default();
        registry.register(
            "agito_commands",
            "Session commands by verb and outcome",
            commands.clone(),
        );

        let sandbox_violations = Counter::default();
        registry.register(
            "agito_sandbox_violations",
            "Repository paths rejected for escaping the root",
            sandbox_violations.clone(),
        );

        let repos_provisioned = Counter::default();
        registry.register(
            "agito_repos_provisioned",
            "Repositories created through agito-create-repo",
            repos_provisioned.clone(),
        );

        let active_sessions: Gauge = Gauge::default();
        registry.register(
            "agito_active_sessions",
            "Sessions currently running a command",
            active_sessions.clone(),
        );

        let service_duration_seconds = Family::<VerbLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.01, 2.0, 16))
        });
        registry.register(
            "agito_service_duration_seconds",
            "Wall time of git service subprocesses",
            service_duration_seconds.clone(),
        );

        Self {
            auth_attempts,
            commands,
            sandbox_violations,
            repos_provisioned,
            active_sessions,
            service_duration_seconds,
        }
    }

    pub fn record_auth(&self, accepted: bool) {
        let outcome = if accepted {
            AuthOutcome::Accepted
        } else {
            AuthOutcome::Rejected
        };
        self.auth_attempts.get_or_create(&AuthLabels { outcome }).inc();
    }

    pub fn record_command(&self, verb: VerbLabel, outcome: CommandOutcome) {
        self.commands
            .get_or_create(&CommandLabels { verb, outcome })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all gateway metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in the OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
