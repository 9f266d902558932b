//! Git process plumbing and bare repository management.
//!
//! All repository semantics are delegated to the `git` binary; this module
//! only decides which subprocess to start, with which streams, and which
//! hook scripts a freshly created repository receives.

pub mod bare_repo;
pub mod commands;
pub mod hooks;

pub use bare_repo::{canonical_repo_name, ProvisionError, Provisioner};
pub use commands::{GitExecutor, GitService, ServiceProcess, SystemGit};
pub use hooks::{HookSet, HOOK_TEMPLATE_VERSION};
