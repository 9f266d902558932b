//! Server-side hook scripts installed into every provisioned repository.
//!
//! Hooks are rendered from versioned templates at creation time and are
//! never rewritten afterwards.  The `post-receive` hook is the entry point
//! for the per-repository pipeline script: for every `old new ref` line it
//! receives, it runs the script (when present) with the branch name and the
//! two revisions.

use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;

use crate::config::{HooksConfig, PipelineFailurePolicy};

/// Bumped whenever a template changes.  Embedded in every rendered hook.
pub const HOOK_TEMPLATE_VERSION: u32 = 1;

const PRE_RECEIVE_TEMPLATE: &str = r#"#!/bin/sh
# agito pre-receive hook (template v{{VERSION}})
# Runs once per push before any ref is updated.  Input lines are
# "<old-rev> <new-rev> <ref-name>".  Exit non-zero to reject the push.

while read -r oldrev newrev refname; do
    :
done

exit 0
"#;

const UPDATE_TEMPLATE: &str = r#"#!/bin/sh
# agito update hook (template v{{VERSION}})
# Runs once per ref as: update <ref-name> <old-rev> <new-rev>.
# Exit non-zero to reject this ref only.

refname="$1"
oldrev="$2"
newrev="$3"

exit 0
"#;

const POST_RECEIVE_TEMPLATE: &str = r#"#!/bin/sh
# agito post-receive hook (template v{{VERSION}})
# Runs once per push after all refs are updated.  Input lines are
# "<old-rev> <new-rev> <ref-name>", one per updated ref, in push order.

repo_dir=$(cd "${GIT_DIR:-.}" && pwd)
pipeline="$repo_dir/{{PIPELINE_SCRIPT}}"
propagate={{PROPAGATE}}
status=0

while read -r oldrev newrev refname; do
    [ -n "$refname" ] || continue

    case "$refname" in
        refs/heads/*) branch=${refname#refs/heads/} ;;
        refs/tags/*) branch=${refname#refs/tags/} ;;
        refs/*) branch=${refname#refs/} ;;
        *) branch=$refname ;;
    esac

    echo "agito: $refname $oldrev -> $newrev"

    if [ -f "$pipeline" ]; then
        echo "agito: running pipeline for $branch"
        (cd "$repo_dir" && sh "$pipeline" "$branch" "$oldrev" "$newrev" </dev/null)
        rc=$?
        if [ "$rc" -ne 0 ]; then
            echo "agito: pipeline for $branch failed with status $rc" >&2
            status=$rc
        fi
    fi
done

if [ "$propagate" = 1 ]; then
    exit "$status"
fi
exit 0
"#;

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// A hook ready to be written, relative to the repository's `hooks/` dir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedHook {
    pub name: &'static str,
    pub contents: String,
}

/// Parameters shared by all installed hooks.
#[derive(Debug, Clone)]
pub struct HookSet {
    pipeline_script: String,
    failure_policy: PipelineFailurePolicy,
}

impl HookSet {
    pub fn new(pipeline_script: impl Into<String>, failure_policy: PipelineFailurePolicy) -> Self {
        Self {
            pipeline_script: pipeline_script.into(),
            failure_policy,
        }
    }

    pub fn from_config(config: &HooksConfig) -> Self {
        Self::new(config.pipeline_script.clone(), config.pipeline_failure)
    }

    pub fn render(&self) -> Vec<RenderedHook> {
        let propagate = match self.failure_policy {
            PipelineFailurePolicy::Ignore => "0",
            PipelineFailurePolicy::Propagate => "1",
        };
        let fill = |template: &str| {
            template
                .replace("{{VERSION}}", &HOOK_TEMPLATE_VERSION.to_string())
                .replace("{{PIPELINE_SCRIPT}}", &self.pipeline_script)
                .replace("{{PROPAGATE}}", propagate)
        };

        vec![
            RenderedHook {
                name: "pre-receive",
                contents: fill(PRE_RECEIVE_TEMPLATE),
            },
            RenderedHook {
                name: "update",
                contents: fill(UPDATE_TEMPLATE),
            },
            RenderedHook {
                name: "post-receive",
                contents: fill(POST_RECEIVE_TEMPLATE),
            },
        ]
    }

    /// Write every hook into `<repo>/hooks` with mode 0755.  Existing hook
    /// files are an error; they are never overwritten.
    pub async fn install(&self, repo: &Path) -> Result<()> {
        let hooks_dir = repo.join("hooks");
        tokio::fs::create_dir_all(&hooks_dir)
            .await
            .with_context(|| format!("failed to create hooks dir: {}", hooks_dir.display()))?;

        for hook in self.render() {
            let path = hooks_dir.join(hook.name);
            let mut options = tokio::fs::OpenOptions::new();
            options.write(true).create_new(true);
            #[cfg(unix)]
            options.mode(0o755);

            let mut file = match options.open(&path).await {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    anyhow::bail!("hook already exists: {}", path.display())
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("failed to create hook: {}", path.display()))
                }
            };
            file.write_all(hook.contents.as_bytes())
                .await
                .with_context(|| format!("failed to write hook: {}", path.display()))?;
            file.flush().await?;

            // The open mode is filtered through the umask; make sure the
            // hook ends up executable regardless.
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                    .await
                    .with_context(|| format!("failed to chmod hook: {}", path.display()))?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
