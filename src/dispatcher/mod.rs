//! Pushes a task brief and a launch command into a worker's pane.
//!
//! Settings are re-resolved from the runtime config on every dispatch; the
//! agent record's cached `ai_cli` is informational only and is never read
//! for dispatch decisions, so a stale value on disk can't leak into a
//! launched subprocess.

use std::path::PathBuf;

use agentmesh_term::{PaneId, TerminalAdapter};
use tracing::info;

use crate::config::RuntimeConfig;
use crate::error::{AgentMeshError, Result};
use crate::registry::{Agent, AgentRegistry, AgentStatus};

pub struct Dispatcher<'a> {
    session_dir: PathBuf,
    registry: &'a AgentRegistry,
    terminal: &'a dyn TerminalAdapter,
}

impl<'a> Dispatcher<'a> {
    pub fn new(session_dir: PathBuf, registry: &'a AgentRegistry, terminal: &'a dyn TerminalAdapter) -> Self {
        Self {
            session_dir,
            registry,
            terminal,
        }
    }

    fn task_file_path(&self, agent_id: &str) -> PathBuf {
        self.session_dir.join("tasks").join(format!("{agent_id}.md"))
    }

    /// Compose the CLI launch command for `agent` using the resolution
    /// chain: per-worker override > uniform setting > profile default >
    /// global default. Not public: callers go through `send_task`.
    fn launch_command(&self, agent: &Agent, runtime: &RuntimeConfig, task_path: &std::path::Path) -> String {
        let cli = runtime.resolve_worker_cli(agent.worker_slot.unwrap_or(0));
        format!("{cli} --task-file {}", task_path.display())
    }

    /// Write the task brief, resolve the launch command fresh, and send it
    /// to the agent's pane. Rejects a `session_id` that doesn't match the
    /// agent's own session, to keep task files centralized under one
    /// session directory.
    pub async fn send_task(
        &self,
        agent_id: &str,
        task_content: &str,
        session_id: &str,
        runtime: &RuntimeConfig,
    ) -> Result<()> {
        let agent = self.registry.lookup(agent_id).await?;
        if agent.session_name != session_id {
            return Err(AgentMeshError::validation(format!(
                "agent '{agent_id}' belongs to session '{}', not '{session_id}'",
                agent.session_name
            )));
        }

        let task_path = self.task_file_path(agent_id);
        if let Some(parent) = task_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        crate::lock::atomic_write(&task_path, task_content).await?;

        let command = self.launch_command(&agent, runtime, &task_path);
        let pane = PaneId::new(agent.session_name.clone(), agent.window_index, agent.pane_index);
        self.terminal.send_keys(&pane, &command).await?;

        let resolved_cli = runtime.resolve_worker_cli(agent.worker_slot.unwrap_or(0));
        self.registry
            .update(agent_id, |a| {
                a.ai_cli = resolved_cli;
                a.status = AgentStatus::Busy;
            })
            .await?;

        info!(agent_id, session_id, "task dispatched");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AgentRole;
    use agentmesh_term::FakeTerminalAdapter;
    use chrono::Utc;
    use tempfile::TempDir;

    fn sample_agent(id: &str, session: &str) -> Agent {
        Agent {
            id: id.to_string(),
            role: AgentRole::Worker,
            status: AgentStatus::Idle,
            session_name: session.to_string(),
            window_index: 0,
            pane_index: 1,
            working_dir: PathBuf::from("/tmp"),
            worktree_path: None,
            branch: None,
            ai_cli: "stale-cli".into(),
            worker_slot: Some(1),
            current_task_id: None,
            last_activity: Utc::now(),
        }
    }

    #[tokio::test]
    async fn dispatch_writes_task_file_and_sends_command() {
        let dir = TempDir::new().unwrap();
        let registry = AgentRegistry::new(
            dir.path().join("session"),
            dir.path().join("global"),
            dir.path().join("project"),
            "s1".into(),
        );
        registry.register(sample_agent("w1", "s1")).await.unwrap();

        let term = FakeTerminalAdapter::new();
        term.create_session("s1", "/tmp").await.unwrap();

        let dispatcher = Dispatcher::new(dir.path().join("session"), &registry, &term);
        let runtime = RuntimeConfig::default();
        dispatcher.send_task("w1", "do the thing", "s1", &runtime).await.unwrap();

        let task_file = dir.path().join("session").join("tasks").join("w1.md");
        assert_eq!(tokio::fs::read_to_string(task_file).await.unwrap(), "do the thing");

        let agent = registry.lookup("w1").await.unwrap();
        assert_eq!(agent.ai_cli, "claude");
        assert_eq!(agent.status, AgentStatus::Busy);
    }

    #[tokio::test]
    async fn rejects_mismatched_session_id() {
        let dir = TempDir::new().unwrap();
        let registry = AgentRegistry::new(
            dir.path().join("session"),
            dir.path().join("global"),
            dir.path().join("project"),
            "s1".into(),
        );
        registry.register(sample_agent("w1", "s1")).await.unwrap();
        let term = FakeTerminalAdapter::new();
        let dispatcher = Dispatcher::new(dir.path().join("session"), &registry, &term);
        let runtime = RuntimeConfig::default();

        let result = dispatcher.send_task("w1", "x", "other-session", &runtime).await;
        assert!(result.is_err());
    }
}
