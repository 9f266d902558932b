//! Confinement of caller-supplied repository paths to the managed root.
//!
//! Every path that reaches a `git` subprocess goes through [`Sandbox::resolve`]
//! first.  Resolution is purely lexical: `.` and `..` segments are collapsed
//! without consulting the filesystem, and any `..` that cannot be collapsed
//! is kept, so a rooted input such as `/../../etc` still escapes and is
//! rejected instead of silently clamping to `/etc`.  Once a path is known to
//! be inside the root, [`Sandbox::locate`] checks that it exists and that its
//! canonical form (symlinks resolved) is still inside the canonical root.

use std::io;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Why a caller-supplied path could not be turned into a repository.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SandboxError {
    /// The path resolves outside of (or exactly onto) the repository root.
    #[error("Invalid repository path")]
    Violation,
    /// The path is inside the root but no such directory exists.
    #[error("Repository not found: {0}")]
    NotFound(String),
}

/// A repository path that is guaranteed to lie strictly inside the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryHandle {
    /// Absolute path under the root.
    pub path: PathBuf,
    /// Root-relative form, safe to echo back to the caller.
    pub relative: PathBuf,
    /// Whether `path` was a directory at resolution time.
    pub exists: bool,
}

/// The managed repository root, canonicalised once.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// Canonicalise `root` and build a sandbox around it.  The directory must
    /// already exist.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let root = std::fs::canonicalize(root)
            .with_context(|| format!("failed to canonicalise repository root: {}", root.display()))?;
        anyhow::ensure!(root.is_dir(), "repository root is not a directory: {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a caller-supplied path onto the root, or fail with
    /// [`SandboxError::Violation`].  Does not require the target to exist.
    pub fn resolve(&self, requested: &str) -> Result<RepositoryHandle, SandboxError> {
        let unquoted = strip_quotes(requested.trim());

        let cleaned = normalize(Path::new(unquoted));
        // Caller input is always relative to the root, even when written as
        // an absolute path.  Only one leading separator is dropped.
        let relative_input = cleaned.strip_prefix("/").unwrap_or(&cleaned);

        let joined = normalize(&self.root.join(relative_input));
        let relative = joined
            .strip_prefix(&self.root)
            .map_err(|_| SandboxError::Violation)?
            .to_path_buf();

        if relative.as_os_str().is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(SandboxError::Violation);
        }

        let exists = joined.is_dir();
        Ok(RepositoryHandle {
            path: joined,
            relative,
            exists,
        })
    }

    /// Resolve `requested` and require that it names an existing directory
    /// whose canonical location is still inside the root.
    ///
    /// Git clients often omit the `.git` suffix, so when the literal path is
    /// absent the suffixed sibling is tried as well.  Dot-prefixed entries
    /// (repositories still being provisioned) are never located.
    pub fn locate(&self, requested: &str) -> Result<RepositoryHandle, SandboxError> {
        let handle = self.resolve(requested)?;
        if is_hidden(&handle.relative) {
            return Err(SandboxError::NotFound(handle.relative.display().to_string()));
        }
        let handle = if handle.exists {
            handle
        } else {
            match with_git_suffix(&handle) {
                Some(candidate) if candidate.exists => candidate,
                _ => return Err(SandboxError::NotFound(handle.relative.display().to_string())),
            }
        };

        match std::fs::canonicalize(&handle.path) {
            Ok(canonical) if canonical.starts_with(&self.root) && canonical != self.root => {
                Ok(RepositoryHandle {
                    path: canonical,
                    ..handle
                })
            }
            Ok(_) => Err(SandboxError::Violation),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(SandboxError::NotFound(handle.relative.display().to_string()))
            }
            Err(_) => Err(SandboxError::Violation),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn strip_quotes(s: &str) -> &str {
    s.trim_matches('\'').trim_matches('"')
}

fn is_hidden(relative: &Path) -> bool {
    relative.components().any(|c| match c {
        Component::Normal(name) => name.to_string_lossy().starts_with('.'),
        _ => false,
    })
}

fn with_git_suffix(handle: &RepositoryHandle) -> Option<RepositoryHandle> {
    let name = handle.path.file_name()?.to_str()?;
    if name.ends_with(".git") {
        return None;
    }
    let suffixed = format!("{name}.git");
    let path = handle.path.with_file_name(&suffixed);
    let relative = handle.relative.with_file_name(&suffixed);
    let exists = path.is_dir();
    Some(RepositoryHandle {
        path,
        relative,
        exists,
    })
}

/// Lexically collapse `.` and `name/..` pairs.
///
/// A `..` with nothing left to collapse is preserved, including directly
/// after the root, so that escapes remain visible to the caller.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    out.iter().collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> (tempfile::TempDir, Sandbox) {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::new(dir.path()).unwrap();
        (dir, sandbox)
    }

    #[test]
    fn normalize_collapses_dots() {
        assert_eq!(normalize(Path::new("a/./b/../c")), PathBuf::from("a/c"));
        assert_eq!(normalize(Path::new("foo/../../bar")), PathBuf::from("../bar"));
        assert_eq!(normalize(Path::new("/../../etc")), PathBuf::from("/../../etc"));
        assert_eq!(normalize(Path::new("/srv/repos/../x")), PathBuf::from("/srv/x"));
    }

    #[test]
    fn traversal_attempts_are_violations() {
        let (_dir, sb) = sandbox();
        for attempt in [
            "../../etc/passwd",
            "/../../etc",
            "foo/../../bar",
            "'../secret.git'",
            "\"/../../../../root\"",
            "..",
            "a/b/../../..",
        ] {
            assert_eq!(sb.resolve(attempt), Err(SandboxError::Violation), "{attempt}");
        }
    }

    #[test]
    fn root_itself_is_a_violation() {
        let (_dir, sb) = sandbox();
        for attempt in ["", "/", ".", "'/'", "demo.git/.."] {
            assert_eq!(sb.resolve(attempt), Err(SandboxError::Violation), "{attempt:?}");
        }
    }

    #[test]
    fn absolute_and_quoted_paths_map_under_root() {
        let (_dir, sb) = sandbox();
        for input in ["demo.git", "/demo.git", "'/demo.git'", "\"demo.git\"", "./x/../demo.git"] {
            let handle = sb.resolve(input).unwrap();
            assert_eq!(handle.path, sb.root().join("demo.git"), "{input}");
            assert_eq!(handle.relative, PathBuf::from("demo.git"));
            assert!(!handle.exists);
        }
    }

    #[test]
    fn resolved_paths_are_descendants_of_root() {
        let (_dir, sb) = sandbox();
        let inputs = ["a", "a/b", "/a/../b", "x/./y/../z.git", "//double", "a//b"];
        for input in inputs {
            let handle = sb.resolve(input).unwrap();
            assert!(handle.path.starts_with(sb.root()), "{input}");
            assert_ne!(handle.path, sb.root());
        }
    }

    #[test]
    fn locate_reports_missing_repository() {
        let (_dir, sb) = sandbox();
        assert_eq!(
            sb.locate("'/nope.git'"),
            Err(SandboxError::NotFound("nope.git".to_string()))
        );
    }

    #[test]
    fn locate_finds_existing_directory() {
        let (dir, sb) = sandbox();
        std::fs::create_dir(dir.path().join("demo.git")).unwrap();
        let handle = sb.locate("'/demo.git'").unwrap();
        assert!(handle.exists);
        assert_eq!(handle.path, sb.root().join("demo.git"));
    }

    #[test]
    fn locate_falls_back_to_git_suffix() {
        let (dir, sb) = sandbox();
        std::fs::create_dir(dir.path().join("demo.git")).unwrap();
        let handle = sb.locate("/demo").unwrap();
        assert_eq!(handle.relative, PathBuf::from("demo.git"));
        assert_eq!(handle.path, sb.root().join("demo.git"));
    }

    #[test]
    fn locate_skips_hidden_entries() {
        let (dir, sb) = sandbox();
        std::fs::create_dir(dir.path().join(".demo.git.tmp-1-0")).unwrap();
        std::fs::create_dir_all(dir.path().join("team").join(".secret.git")).unwrap();
        for attempt in [".demo.git.tmp-1-0", "/team/.secret.git", "team/.secret"] {
            assert!(
                matches!(sb.locate(attempt), Err(SandboxError::NotFound(_))),
                "{attempt}"
            );
        }
    }

    #[test]
    fn locate_rejects_plain_file() {
        let (dir, sb) = sandbox();
        std::fs::write(dir.path().join("file.git"), b"x").unwrap();
        assert!(matches!(sb.locate("file.git"), Err(SandboxError::NotFound(_))));
    }

    #[cfg(unix)]
    #[test]
    fn locate_rejects_symlink_escaping_root() {
        let outside = tempfile::tempdir().unwrap();
        let (dir, sb) = sandbox();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape.git")).unwrap();
        assert_eq!(sb.locate("escape.git"), Err(SandboxError::Violation));
    }

    #[test]
    fn not_found_message_is_root_relative() {
        let (_dir, sb) = sandbox();
        let err = sb.locate("/team/missing.git").unwrap_err();
        let msg = err.to_string();
        assert_eq!(msg, "Repository not found: team/missing.git");
        assert!(!msg.contains(&*sb.root().to_string_lossy()));
    }
}
