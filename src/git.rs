//! Version control access.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::VcsError;

/// Clones repositories into the workspace.
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Clones `url` into `dest`.
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<(), VcsError>;
}

/// Shells out to the `git` binary.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            program: PathBuf::from("git"),
        }
    }
}

impl GitCli {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a specific git executable.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }
}

#[async_trait]
impl VersionControl for GitCli {
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<(), VcsError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        debug!(%url, dest = %dest.display(), "Running git clone");
        let status = Command::new(&self.program)
            .arg("clone")
            .arg(url)
            .arg(dest)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await?;

        if !status.success() {
            return Err(VcsError::CommandFailed {
                command: format!("clone {url}"),
                code: status.code(),
            });
        }

        info!(%url, dest = %dest.display(), "Repository cloned");
        Ok(())
    }
}

/// Derives the repository name from a URL, `owner/name` shorthand or path:
/// the last path segment with any `.git` suffix removed.
pub fn repo_name(input: &str) -> Result<String, VcsError> {
    let trimmed = input.trim().trim_end_matches('/');
    let last = trimmed
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(trimmed);
    let name = last.strip_suffix(".git").unwrap_or(last);

    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(name.to_string())
    } else {
        Err(VcsError::InvalidRepository(input.to_string()))
    }
}

/// Whether `repo` already has a git checkout in `workspace`.
pub fn is_cloned(workspace: &Path, repo: &str) -> bool {
    workspace.join(repo).join(".git").exists()
}
