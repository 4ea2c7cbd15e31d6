//! Repository fetching
//!
//! Clones or updates a remote repository into a scratch directory owned by
//! the returned [`Workspace`]. The scratch dir is a `TempDir` handle, so it
//! is released on every exit path, including cancellation, the moment the
//! workspace drops.
//!
//! PR scans fetch base and head, leave the working tree at head, and carry
//! the changed-file list plus the unified diff.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Output;
use tempfile::TempDir;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::cancel::{CancelToken, Canceled};
use crate::models::{JobKind, RepoRef};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("repository unreachable: {url}: {detail}")]
    UnreachableRepo { url: String, detail: String },

    #[error("authentication failed for {url}")]
    AuthFailed { url: String },

    #[error("ref not found: {reference}")]
    RefNotFound { reference: String },

    #[error("disk full while fetching")]
    DiskFull,

    #[error("git failed: {detail}")]
    GitFailed { detail: String },

    #[error(transparent)]
    Canceled(#[from] Canceled),

    #[error("i/o error during fetch: {0}")]
    Io(#[from] std::io::Error),
}

/// A checked-out working tree. Owns its scratch directory when one was
/// created; dropping the workspace removes it.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    _scratch: Option<TempDir>,
}

impl Workspace {
    /// Wrap an existing directory without taking ownership of its lifetime.
    pub fn existing(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            _scratch: None,
        }
    }

    fn scratch(dir: TempDir) -> Self {
        Self {
            root: dir.path().to_path_buf(),
            _scratch: Some(dir),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// One changed file of a pull request, with head content when it still
/// exists there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedFile {
    pub path: String,
    /// `added`, `modified`, `deleted`, `renamed`.
    pub status: String,
    pub content: Option<String>,
}

/// Extra data only a PR scan produces.
#[derive(Debug, Clone, Default)]
pub struct PrDelta {
    pub changed_files: Vec<ChangedFile>,
    pub diff: String,
}

/// Result of a fetch: the working tree plus PR context when applicable.
#[derive(Debug)]
pub struct Fetched {
    pub workspace: Workspace,
    pub head_commit: Option<String>,
    pub pr: Option<PrDelta>,
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(
        &self,
        repo_ref: &RepoRef,
        kind: JobKind,
        cancel: &CancelToken,
    ) -> Result<Fetched, FetchError>;
}

/// Fetcher shelling out to the `git` CLI.
#[derive(Debug, Default)]
pub struct GitFetcher;

impl GitFetcher {
    pub fn new() -> Self {
        Self
    }

    async fn git(args: &[&str], cwd: Option<&Path>) -> Result<Output, FetchError> {
        let mut command = Command::new("git");
        command.args(args);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        debug!(?args, "running git");
        Ok(command.output().await?)
    }

    async fn git_checked(
        args: &[&str],
        cwd: Option<&Path>,
        repo_ref: &RepoRef,
    ) -> Result<Output, FetchError> {
        let output = Self::git(args, cwd).await?;
        if output.status.success() {
            return Ok(output);
        }
        Err(classify_git_failure(
            &String::from_utf8_lossy(&output.stderr),
            repo_ref,
        ))
    }

    async fn head_commit(root: &Path) -> Option<String> {
        let output = Self::git(&["rev-parse", "HEAD"], Some(root)).await.ok()?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn pr_delta(
        root: &Path,
        base_branch: &str,
        repo_ref: &RepoRef,
    ) -> Result<PrDelta, FetchError> {
        Self::git_checked(
            &["fetch", "origin", base_branch],
            Some(root),
            repo_ref,
        )
        .await?;
        let merge_base = format!("origin/{base_branch}...HEAD");

        let status_output = Self::git_checked(
            &["diff", "--name-status", &merge_base],
            Some(root),
            repo_ref,
        )
        .await?;
        let mut changed_files = Vec::new();
        for line in String::from_utf8_lossy(&status_output.stdout).lines() {
            let mut parts = line.split_whitespace();
            let (Some(code), Some(path)) = (parts.next(), parts.next()) else {
                continue;
            };
            // Renames list old then new path; the new one is what head has.
            let path = parts.next().unwrap_or(path).to_string();
            let status = match code.chars().next() {
                Some('A') => "added",
                Some('M') => "modified",
                Some('D') => "deleted",
                Some('R') => "renamed",
                _ => "modified",
            };
            let content = if status == "deleted" {
                None
            } else {
                std::fs::read_to_string(root.join(&path)).ok()
            };
            changed_files.push(ChangedFile {
                path,
                status: status.to_string(),
                content,
            });
        }

        let diff_output =
            Self::git_checked(&["diff", &merge_base], Some(root), repo_ref).await?;
        Ok(PrDelta {
            changed_files,
            diff: String::from_utf8_lossy(&diff_output.stdout).into_owned(),
        })
    }
}

#[async_trait]
impl SourceFetcher for GitFetcher {
    async fn fetch(
        &self,
        repo_ref: &RepoRef,
        kind: JobKind,
        cancel: &CancelToken,
    ) -> Result<Fetched, FetchError> {
        cancel.ensure_active()?;
        let scratch = TempDir::new()?;
        let target = scratch.path().to_string_lossy().into_owned();

        // Commit pins need history; branch-only scans get a shallow clone.
        if repo_ref.commit.is_some() {
            Self::git_checked(
                &["clone", "--branch", &repo_ref.branch, &repo_ref.url, &target],
                None,
                repo_ref,
            )
            .await?;
        } else {
            Self::git_checked(
                &[
                    "clone",
                    "--depth",
                    "50",
                    "--branch",
                    &repo_ref.branch,
                    &repo_ref.url,
                    &target,
                ],
                None,
                repo_ref,
            )
            .await?;
        }
        cancel.ensure_active()?;

        if let Some(commit) = &repo_ref.commit {
            Self::git_checked(&["checkout", commit], Some(scratch.path()), repo_ref).await?;
        }

        let pr = match (kind, &repo_ref.pr) {
            (JobKind::PrScan, Some(pr)) => {
                cancel.ensure_active()?;
                Some(Self::pr_delta(scratch.path(), &pr.base_branch, repo_ref).await?)
            }
            _ => None,
        };

        let head_commit = Self::head_commit(scratch.path()).await;
        info!(
            url = %repo_ref.url,
            branch = %repo_ref.branch,
            head = head_commit.as_deref().unwrap_or("unknown"),
            "fetched repository"
        );
        Ok(Fetched {
            workspace: Workspace::scratch(scratch),
            head_commit,
            pr,
        })
    }
}

/// Fetcher for sources already on disk; used by the one-shot CLI scan and
/// by tests. No cleanup happens on drop.
#[derive(Debug)]
pub struct PathFetcher {
    root: PathBuf,
}

impl PathFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SourceFetcher for PathFetcher {
    async fn fetch(
        &self,
        _repo_ref: &RepoRef,
        _kind: JobKind,
        cancel: &CancelToken,
    ) -> Result<Fetched, FetchError> {
        cancel.ensure_active()?;
        if !self.root.is_dir() {
            return Err(FetchError::UnreachableRepo {
                url: self.root.to_string_lossy().into_owned(),
                detail: "not a directory".to_string(),
            });
        }
        Ok(Fetched {
            workspace: Workspace::existing(&self.root),
            head_commit: None,
            pr: None,
        })
    }
}

/// Map git stderr onto the fetch error taxonomy.
fn classify_git_failure(stderr: &str, repo_ref: &RepoRef) -> FetchError {
    let lower = stderr.to_lowercase();
    if lower.contains("no space left") {
        return FetchError::DiskFull;
    }
    if lower.contains("authentication failed")
        || lower.contains("could not read username")
        || lower.contains("permission denied")
    {
        return FetchError::AuthFailed {
            url: repo_ref.url.clone(),
        };
    }
    if lower.contains("remote branch")
        || lower.contains("unknown revision")
        || lower.contains("couldn't find remote ref")
        || lower.contains("pathspec")
    {
        return FetchError::RefNotFound {
            reference: repo_ref
                .commit
                .clone()
                .unwrap_or_else(|| repo_ref.branch.clone()),
        };
    }
    if lower.contains("could not resolve host")
        || lower.contains("unable to access")
        || lower.contains("repository not found")
        || lower.contains("does not exist")
    {
        return FetchError::UnreachableRepo {
            url: repo_ref.url.clone(),
            detail: stderr.trim().to_string(),
        };
    }
    FetchError::GitFailed {
        detail: stderr.trim().to_string(),
    }
}
