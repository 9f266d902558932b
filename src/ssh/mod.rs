//! SSH front end of the gateway.
//!
//! Accepts SSH connections from git clients, authenticates them by public
//! key, and runs exactly one of `git-upload-pack`, `git-receive-pack` or
//! `agito-create-repo` per session channel.  Nothing else is executable.

pub mod command;
pub mod dispatch;
pub mod server;
pub mod session;

pub use dispatch::{Dispatcher, SessionContext, SessionOutput, Stream};
pub use server::start_ssh_server;
