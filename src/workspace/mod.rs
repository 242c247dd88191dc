//! Session provisioning: directory tree, terminal pane grid, and per-worker
//! git worktrees.
//!
//! Splits are applied right-to-left so earlier pane indices never shift
//! once later panes are added — the same invariant the teacher's grid
//! layout relies on for persisting pane coordinates across restarts.

use std::path::{Path, PathBuf};

use agentmesh_term::{PaneId, SplitDirection, TerminalAdapter};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{RuntimeConfig, SessionConfig};
use crate::error::{AgentMeshError, Result};
use crate::git::shell::ShellWorktreeManager;

/// One pane of the initial grid, in creation order.
#[derive(Debug, Clone)]
pub struct GridPane {
    pub pane: PaneId,
    pub role: GridRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridRole {
    Admin,
    Worker(u32),
}

/// Outcome of `init_tmux_workspace`.
#[derive(Debug, Clone)]
pub struct WorkspaceHandle {
    pub session_dir: PathBuf,
    pub session_name: String,
    pub panes: Vec<GridPane>,
    pub enable_git: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeEntry {
    pub agent_id: String,
    pub path: PathBuf,
    pub branch: String,
    pub head_commit: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub merged: Vec<String>,
    pub already_merged: Vec<String>,
    pub failed: Vec<String>,
    pub conflicts: Vec<String>,
    pub working_tree_updated: bool,
    pub base_head: String,
    pub success: bool,
}

/// Produces a ready session out of a project root: directory tree, pane
/// grid, and (when git is enabled) a worktree root for workers.
pub struct WorkspaceProvisioner<'a> {
    project_root: PathBuf,
    mcp_dir: String,
    terminal: &'a dyn TerminalAdapter,
}

impl<'a> WorkspaceProvisioner<'a> {
    pub fn new(project_root: PathBuf, config: &RuntimeConfig, terminal: &'a dyn TerminalAdapter) -> Self {
        Self {
            project_root,
            mcp_dir: config.mcp_dir.clone(),
            terminal,
        }
    }

    fn mcp_root(&self) -> PathBuf {
        self.project_root.join(&self.mcp_dir)
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.mcp_root().join(session_id)
    }

    fn worktrees_root(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("worktrees")
    }

    /// Lay out `1 + worker_count` panes: pane 0 is the admin, the rest are
    /// workers, split off to the right in increasing order then applied
    /// right-to-left so no earlier pane's index moves. Rolls back the
    /// session on any failure.
    async fn lay_out_grid(&self, session_name: &str, cwd: &str, worker_count: u32) -> Result<Vec<GridPane>> {
        let admin_pane = self
            .terminal
            .create_session(session_name, cwd)
            .await
            .map_err(AgentMeshError::from)?;

        let mut targets = vec![admin_pane.clone()];
        for _ in 0..worker_count {
            let last = targets.last().unwrap().clone();
            match self
                .terminal
                .split_pane(&last, SplitDirection::Vertical, cwd)
                .await
            {
                Ok(new_pane) => targets.push(new_pane),
                Err(e) => {
                    warn!(error = %e, "grid layout failed, rolling back session");
                    let _ = self.terminal.kill_session(session_name).await;
                    return Err(e.into());
                }
            }
        }

        let mut panes = Vec::with_capacity(targets.len());
        for (idx, pane) in targets.into_iter().enumerate() {
            let role = if idx == 0 {
                GridRole::Admin
            } else {
                GridRole::Worker(idx as u32)
            };
            panes.push(GridPane { pane, role });
        }
        Ok(panes)
    }

    /// `enable_git` resolution order: call arg > existing `config.json` >
    /// env/config file > default. Rewrites `config.json` when the resolved
    /// value differs from what was on disk.
    pub async fn init_tmux_workspace(
        &self,
        session_id: &str,
        runtime: &RuntimeConfig,
        enable_git_arg: Option<bool>,
        worker_count: u32,
        mcp_tool_prefix: &str,
    ) -> Result<WorkspaceHandle> {
        let session_dir = self.session_dir(session_id);
        tokio::fs::create_dir_all(&session_dir).await?;
        for sub in ["tasks", "reports", "ipc", "memory"] {
            tokio::fs::create_dir_all(session_dir.join(sub)).await?;
        }

        let config_path = self.mcp_root().join("config.json");
        let existing = SessionConfig::load(&config_path).await?;
        let enable_git = runtime.resolve_enable_git(enable_git_arg, existing.as_ref());

        let config = SessionConfig {
            session_id: session_id.to_string(),
            enable_git,
            mcp_tool_prefix: mcp_tool_prefix.to_string(),
        };
        if existing.as_ref().map(|s| s.enable_git) != Some(enable_git) {
            config.save(&config_path).await?;
        }

        if enable_git {
            let worktrees_root = self.worktrees_root(session_id);
            tokio::fs::create_dir_all(&worktrees_root).await?;
            ShellWorktreeManager::init_if_needed(&self.project_root).await.map_err(AgentMeshError::git_source)?;
        }

        let panes = self
            .lay_out_grid(session_id, self.project_root.to_string_lossy().as_ref(), worker_count)
            .await?;

        info!(session_id, worker_count, enable_git, "workspace initialized");
        Ok(WorkspaceHandle {
            session_dir,
            session_name: session_id.to_string(),
            panes,
            enable_git,
        })
    }

    /// Create a worker's working copy on `branch` (optionally forked off
    /// `base_branch`), refusing if another worktree already has that branch
    /// checked out.
    pub async fn create_worktree(
        &self,
        session_id: &str,
        agent_id: &str,
        branch: &str,
        base_branch: Option<&str>,
    ) -> Result<WorktreeEntry> {
        let mgr = ShellWorktreeManager::new(self.project_root.clone()).map_err(AgentMeshError::git_source)?;

        if let Some(base) = base_branch {
            mgr.checkout(base).await.map_err(AgentMeshError::git_source)?;
        }

        let existing = mgr.list_worktrees().await.map_err(AgentMeshError::git_source)?;
        if existing.iter().any(|w| w.branch == branch) {
            return Err(AgentMeshError::validation(format!(
                "branch '{branch}' already checked out in another worktree"
            )));
        }

        let worktree_path = self.worktrees_root(session_id).join(agent_id);
        let info = mgr
            .create_worktree(&worktree_path, branch)
            .await
            .map_err(AgentMeshError::git_source)?;

        Ok(WorktreeEntry {
            agent_id: agent_id.to_string(),
            path: info.path,
            branch: info.branch,
            head_commit: info.head_commit,
        })
    }

    pub async fn list_worktrees(&self) -> Result<Vec<WorktreeEntry>> {
        let mgr = ShellWorktreeManager::new(self.project_root.clone()).map_err(AgentMeshError::git_source)?;
        let worktrees = mgr.list_worktrees().await.map_err(AgentMeshError::git_source)?;
        Ok(worktrees
            .into_iter()
            .map(|w| WorktreeEntry {
                agent_id: w
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default(),
                path: w.path,
                branch: w.branch,
                head_commit: w.head_commit,
            })
            .collect())
    }

    pub async fn remove_worktree(&self, worktree_path: &Path, force: bool) -> Result<()> {
        let mgr = ShellWorktreeManager::new(self.project_root.clone()).map_err(AgentMeshError::git_source)?;
        mgr.remove_worktree_full(worktree_path, force)
            .await
            .map_err(AgentMeshError::git_source)
    }

    /// Preview-merge the branches of every `completed` task into
    /// `base_branch`, leaving the union of changes unstaged and `HEAD`
    /// unmoved. See the module contract for the per-branch algorithm.
    pub async fn merge_completed_tasks(
        &self,
        base_branch: &str,
        strategy: &str,
        completed_branches: &[String],
    ) -> Result<MergeOutcome> {
        let mgr = ShellWorktreeManager::new(self.project_root.clone()).map_err(AgentMeshError::git_source)?;
        mgr.checkout(base_branch).await.map_err(AgentMeshError::git_source)?;
        let base_head = mgr.head_commit().await.map_err(AgentMeshError::git_source)?;

        let mut outcome = MergeOutcome {
            base_head: base_head.clone(),
            ..Default::default()
        };

        let mut unique: Vec<&String> = Vec::new();
        for branch in completed_branches {
            if !unique.contains(&branch) {
                unique.push(branch);
            }
        }

        for branch in unique {
            let is_ancestor = mgr
                .is_ancestor(branch, "HEAD")
                .await
                .map_err(AgentMeshError::git_source)?;
            if is_ancestor {
                outcome.already_merged.push(branch.clone());
                continue;
            }

            match mgr.apply_without_commit(branch, strategy).await {
                Ok(true) => outcome.merged.push(branch.clone()),
                Ok(false) => outcome.conflicts.push(branch.clone()),
                Err(e) => {
                    warn!(branch, error = %e, "merge application failed");
                    outcome.failed.push(branch.clone());
                }
            }
        }

        if !outcome.merged.is_empty() {
            mgr.reset_mixed(&base_head).await.map_err(AgentMeshError::git_source)?;
            outcome.working_tree_updated = true;
        }

        outcome.success = outcome.failed.is_empty() && outcome.conflicts.is_empty();
        Ok(outcome)
    }

    /// Tear down the session's panes and, when requested, its worktree
    /// root. Leaves the session directory's task/report history in place.
    pub async fn cleanup_workspace(&self, session_id: &str, remove_worktrees: bool) -> Result<()> {
        self.terminal
            .kill_session(session_id)
            .await
            .map_err(AgentMeshError::from)?;

        if remove_worktrees {
            let worktrees_root = self.worktrees_root(session_id);
            if worktrees_root.exists() {
                tokio::fs::remove_dir_all(&worktrees_root).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use agentmesh_term::FakeTerminalAdapter;
    use tempfile::TempDir;

    #[tokio::test]
    async fn grid_layout_creates_admin_plus_workers() {
        let dir = TempDir::new().unwrap();
        let term = FakeTerminalAdapter::new();
        let runtime = RuntimeConfig::default();
        let provisioner = WorkspaceProvisioner::new(dir.path().to_path_buf(), &runtime, &term);

        let handle = provisioner
            .init_tmux_workspace("s1", &runtime, Some(false), 2, "agentmesh")
            .await
            .unwrap();

        assert_eq!(handle.panes.len(), 3);
        assert_eq!(handle.panes[0].role, GridRole::Admin);
        assert_eq!(handle.panes[1].role, GridRole::Worker(1));
        assert_eq!(handle.panes[2].role, GridRole::Worker(2));
        assert!(!handle.enable_git);
    }

    #[tokio::test]
    async fn grid_layout_rolls_back_session_on_split_failure() {
        let dir = TempDir::new().unwrap();
        let term = FakeTerminalAdapter::new();
        let runtime = RuntimeConfig::default();
        let provisioner = WorkspaceProvisioner::new(dir.path().to_path_buf(), &runtime, &term);

        term.create_session("s1", dir.path().to_str().unwrap()).await.unwrap();
        let result = provisioner
            .init_tmux_workspace("s1", &runtime, Some(false), 1, "agentmesh")
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn merge_completed_tasks_reports_clean_and_conflicting_branches() {
        let dir = TempDir::new().unwrap();
        let repo_path = dir.path().to_path_buf();
        ShellWorktreeManager::init_if_needed(&repo_path).await.unwrap();
        for (key, value) in [("user.email", "t@example.com"), ("user.name", "T")] {
            let _ = tokio::process::Command::new("git")
                .args(["config", key, value])
                .current_dir(&repo_path)
                .output()
                .await;
        }
        let default_branch = String::from_utf8_lossy(
            &tokio::process::Command::new("git")
                .args(["rev-parse", "--abbrev-ref", "HEAD"])
                .current_dir(&repo_path)
                .output()
                .await
                .unwrap()
                .stdout,
        )
        .trim()
        .to_string();

        tokio::process::Command::new("git")
            .args(["checkout", "-b", "clean-branch"])
            .current_dir(&repo_path)
            .output()
            .await
            .unwrap();
        tokio::fs::write(repo_path.join("clean.txt"), "ok").await.unwrap();
        tokio::process::Command::new("git").args(["add", "."]).current_dir(&repo_path).output().await.unwrap();
        tokio::process::Command::new("git")
            .args(["commit", "-m", "clean change"])
            .current_dir(&repo_path)
            .output()
            .await
            .unwrap();
        tokio::process::Command::new("git")
            .args(["checkout", &default_branch])
            .current_dir(&repo_path)
            .output()
            .await
            .unwrap();

        let term = FakeTerminalAdapter::new();
        let runtime = RuntimeConfig::default();
        let provisioner = WorkspaceProvisioner::new(repo_path.clone(), &runtime, &term);

        let outcome = provisioner
            .merge_completed_tasks(&default_branch, "merge", &["clean-branch".to_string()])
            .await
            .unwrap();

        assert_eq!(outcome.merged, vec!["clean-branch".to_string()]);
        assert!(outcome.conflicts.is_empty());
        assert!(outcome.success);
        assert!(repo_path.join("clean.txt").exists());
    }
}
