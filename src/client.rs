//! Helpers behind the `agito` command-line client.
//!
//! The client never speaks SSH itself: `create` shells out to `ssh` to run
//! `agito-create-repo` on the server, and everything else is `git`.

use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::Command;

use crate::git::bare_repo::BARE_SUFFIX;

pub const DEFAULT_SERVER: &str = "localhost:2222";
pub const DEFAULT_USER: &str = "git";
const DEFAULT_SSH_PORT: &str = "22";

// ---------------------------------------------------------------------------
// Server address
// ---------------------------------------------------------------------------

/// `host[:port]` as given in `AGITO_SERVER`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: String,
}

impl ServerAddress {
    pub fn parse(server: &str) -> Self {
        match server.rsplit_once(':') {
            Some((host, port)) if !port.is_empty() => Self {
                host: host.to_string(),
                port: port.to_string(),
            },
            _ => Self {
                host: server.trim_end_matches(':').to_string(),
                port: DEFAULT_SSH_PORT.to_string(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Invocations
// ---------------------------------------------------------------------------

/// A program plus arguments, built separately from running it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    /// Run with inherited standard streams and return the exit code.
    pub async fn run(&self) -> Result<i32> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .with_context(|| format!("failed to execute {}", self.program))?;
        Ok(status.code().unwrap_or(1))
    }
}

/// `ssh -p <port> <user>@<host> agito-create-repo <name>.git`
pub fn create_repo(server: &ServerAddress, user: &str, name: &str) -> Invocation {
    let name = if name.ends_with(BARE_SUFFIX) {
        name.to_string()
    } else {
        format!("{name}{BARE_SUFFIX}")
    };
    Invocation {
        program: "ssh".to_string(),
        args: vec![
            "-p".to_string(),
            server.port.clone(),
            format!("{user}@{}", server.host),
            format!("agito-create-repo {name}"),
        ],
    }
}

/// `git clone <url> [args..]`
pub fn clone(url: &str, extra: &[String]) -> Invocation {
    let mut args = vec!["clone".to_string(), url.to_string()];
    args.extend(extra.iter().cloned());
    Invocation {
        program: "git".to_string(),
        args,
    }
}

/// Any other subcommand goes straight to `git`.
pub fn passthrough(args: &[String]) -> Invocation {
    Invocation {
        program: "git".to_string(),
        args: args.to_vec(),
    }
}

/// URL to clone a repository created with [`create_repo`].
pub fn clone_url(server: &ServerAddress, user: &str, name: &str) -> String {
    format!("ssh://{user}@{}:{}/{name}", server.host, server.port)
}
