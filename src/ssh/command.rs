//! Parsing of the single command line a client may run on a session.

use thiserror::Error;

use crate::git::GitService;

/// Upper bound on an exec payload.  Git sends a verb plus one quoted path.
pub const MAX_COMMAND_LEN: usize = 4096;

const UPLOAD_PACK: &str = "git-upload-pack";
const RECEIVE_PACK: &str = "git-receive-pack";
const CREATE_REPO: &str = "agito-create-repo";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The closed set of operations a session can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Service(GitService),
    CreateRepo,
}

impl Verb {
    /// Wire name of the verb.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Service(GitService::UploadPack) => UPLOAD_PACK,
            Self::Service(GitService::ReceivePack) => RECEIVE_PACK,
            Self::CreateRepo => CREATE_REPO,
        }
    }

    /// Shape of the argument, for usage messages.
    fn argument_name(&self) -> &'static str {
        match self {
            Self::Service(_) => "<repository-path>",
            Self::CreateRepo => "<repo-name>",
        }
    }

    fn classify(token: &str) -> Option<Self> {
        [
            Self::Service(GitService::UploadPack),
            Self::Service(GitService::ReceivePack),
            Self::CreateRepo,
        ]
        .into_iter()
        .find(|verb| token == verb.as_str())
    }
}

/// A validated command: verb plus its single argument, as sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub verb: Verb,
    pub argument: String,
}

/// Result of parsing a well-formed exec payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Run(Command),
    /// A recognised verb with no argument.
    Usage(Verb),
    /// Anything that is not one of the recognised verbs.
    Unknown(String),
}

/// The payload could not be read as a command line at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRequest {
    #[error("empty command")]
    Empty,
    #[error("command exceeds {MAX_COMMAND_LEN} bytes")]
    TooLong,
    #[error("command is not valid UTF-8")]
    NotUtf8,
    #[error("command contains a NUL byte")]
    Nul,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse an exec payload such as:
///
/// ```text
/// git-upload-pack '/demo.git'
/// git-receive-pack 'team/app.git'
/// agito-create-repo demo
/// ```
///
/// The verb must be followed by whitespace or the end of the line, so
/// `git-upload-packx` is unknown rather than a prefix match.
pub fn parse_request(payload: &[u8]) -> Result<Request, MalformedRequest> {
    if payload.len() > MAX_COMMAND_LEN {
        return Err(MalformedRequest::TooLong);
    }
    if payload.contains(&0) {
        return Err(MalformedRequest::Nul);
    }
    let line = std::str::from_utf8(payload).map_err(|_| MalformedRequest::NotUtf8)?;
    let line = line.trim();
    if line.is_empty() {
        return Err(MalformedRequest::Empty);
    }

    let mut parts = line.split_whitespace();
    let Some(verb) = parts.next().and_then(Verb::classify) else {
        return Ok(Request::Unknown(line.to_string()));
    };

    Ok(match parts.next() {
        Some(argument) => Request::Run(Command {
            verb,
            argument: argument.to_string(),
        }),
        None => Request::Usage(verb),
    })
}

/// Text written back for a [`Request::Usage`].
pub fn usage_message(verb: Verb) -> String {
    format!("Usage: {} {}\n", verb.as_str(), verb.argument_name())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
