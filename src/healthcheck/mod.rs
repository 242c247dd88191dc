//! Liveness detection and staged recovery.
//!
//! A task moves through `start -> attempted -> full_attempted ->
//! failed_task` as soft recovery, then hard recovery, then task failure are
//! tried in order. A stalled task's attempt count lives on its dashboard
//! metadata, so a hard recovery's replacement agent inherits the same
//! budget instead of resetting it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use agentmesh_term::{PaneId, TerminalAdapter};
use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use crate::dashboard::{AgentSummary, DashboardStore, TaskStatus};
use crate::error::Result;
use crate::registry::{Agent, AgentRegistry, AgentRole, AgentStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Start,
    Attempted,
    FullAttempted,
    FailedTask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    SessionDead,
    Stalled,
}

#[derive(Debug, Clone)]
pub struct HealthcheckConfig {
    pub stall_timeout: Duration,
    pub max_recovery_attempts: u32,
    pub idle_stop_consecutive: u32,
}

impl Default for HealthcheckConfig {
    fn default() -> Self {
        Self {
            stall_timeout: Duration::from_secs(300),
            max_recovery_attempts: 3,
            idle_stop_consecutive: 5,
        }
    }
}

/// Single point-in-time check for one agent.
pub async fn check_agent(
    agent: &Agent,
    terminal: &dyn TerminalAdapter,
    config: &HealthcheckConfig,
    pane_tail_hash_changed: bool,
) -> HealthVerdict {
    if agent.status == AgentStatus::Terminated {
        return HealthVerdict::Healthy;
    }
    if !terminal.session_alive(&agent.session_name).await {
        return HealthVerdict::SessionDead;
    }
    if agent.current_task_id.is_some() {
        let stalled_by_time = Utc::now()
            .signed_duration_since(agent.last_activity)
            .to_std()
            .map(|d| d >= config.stall_timeout)
            .unwrap_or(false);
        if stalled_by_time && !pane_tail_hash_changed {
            return HealthVerdict::Stalled;
        }
    }
    HealthVerdict::Healthy
}

/// Recovery state tracked per task (falling back to agent id for agents with
/// no current task), in-process. Keying by task rather than by agent lets
/// the state survive a hard recovery, which replaces the agent id but keeps
/// the task id the same. Reset whenever the pair returns to healthy.
pub struct RecoveryTracker {
    states: Mutex<HashMap<String, RecoveryState>>,
}

impl Default for RecoveryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryTracker {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, key: &str) -> RecoveryState {
        *self
            .states
            .lock()
            .unwrap()
            .get(key)
            .unwrap_or(&RecoveryState::Start)
    }

    fn set(&self, key: String, state: RecoveryState) {
        self.states.lock().unwrap().insert(key, state);
    }

    fn clear(&self, key: &str) {
        self.states.lock().unwrap().remove(key);
    }
}

pub struct HealthcheckEngine<'a> {
    pub registry: &'a AgentRegistry,
    pub dashboard: &'a DashboardStore,
    pub terminal: &'a dyn TerminalAdapter,
    pub config: HealthcheckConfig,
    pub tracker: RecoveryTracker,
}

impl<'a> HealthcheckEngine<'a> {
    pub fn new(registry: &'a AgentRegistry, dashboard: &'a DashboardStore, terminal: &'a dyn TerminalAdapter) -> Self {
        Self {
            registry,
            dashboard,
            terminal,
            config: HealthcheckConfig::default(),
            tracker: RecoveryTracker::new(),
        }
    }

    pub async fn unhealthy_agents(&self) -> Result<Vec<(Agent, HealthVerdict)>> {
        let agents = self.registry.list().await?;
        let mut out = Vec::new();
        for agent in agents {
            if agent.status == AgentStatus::Terminated {
                continue;
            }
            let verdict = check_agent(&agent, self.terminal, &self.config, false).await;
            if verdict != HealthVerdict::Healthy {
                out.push((agent, verdict));
            }
        }
        Ok(out)
    }

    /// Soft recovery: recreate the session and reattach to the same pane
    /// coordinates, or nudge a stalled pane. Preserves agent identity,
    /// worktree, and task assignment.
    pub async fn attempt_recovery(&self, agent: &Agent, verdict: HealthVerdict) -> Result<bool> {
        let key = task_key(agent);
        match verdict {
            HealthVerdict::SessionDead => {
                let pane = self
                    .terminal
                    .create_session(&agent.session_name, agent.working_dir.to_string_lossy().as_ref())
                    .await;
                match pane {
                    Ok(_) => {
                        self.tracker.set(key, RecoveryState::Attempted);
                        self.dashboard.increment_recovery_count().await?;
                        info!(agent_id = %agent.id, "soft recovery: session recreated");
                        Ok(true)
                    }
                    Err(e) => {
                        warn!(agent_id = %agent.id, error = %e, "soft recovery failed");
                        self.tracker.set(key, RecoveryState::Attempted);
                        Ok(false)
                    }
                }
            }
            HealthVerdict::Stalled => {
                let pane = PaneId::new(agent.session_name.clone(), agent.window_index, agent.pane_index);
                if let Err(e) = self.terminal.send_keys(&pane, "").await {
                    warn!(agent_id = %agent.id, error = %e, "stall nudge failed to reach pane");
                }

                // The nudge itself rarely fails against a live pane, so it
                // can't be what tells us the agent is still stuck. Count
                // attempts against the task instead, so a pane that keeps
                // accepting keystrokes without making progress still
                // escalates once the budget is spent.
                let attempts = match &agent.current_task_id {
                    Some(task_id) => self.dashboard.bump_task_recovery_attempts(task_id).await?,
                    None => self.config.max_recovery_attempts,
                };

                if self.tracker.get(&key) != RecoveryState::FullAttempted {
                    self.tracker.set(key, RecoveryState::Attempted);
                }

                if attempts < self.config.max_recovery_attempts {
                    self.dashboard.increment_recovery_count().await?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            HealthVerdict::Healthy => Ok(true),
        }
    }

    /// Hard recovery: terminate the old agent, rebuild its worktree (when
    /// git is enabled), spawn a replacement in the same pane slot, and
    /// reassign the unfinished task.
    pub async fn full_recovery(&self, agent: &Agent, new_agent_id: &str) -> Result<Agent> {
        let key = task_key(agent);
        self.registry.terminate(&agent.id).await?;

        // A stalled agent's session is still alive; a dead one's is not.
        // Either way the replacement gets a fresh session, so drop the old
        // one first rather than assume it's already gone.
        let _ = self.terminal.kill_session(&agent.session_name).await;
        let pane = self
            .terminal
            .create_session(&agent.session_name, agent.working_dir.to_string_lossy().as_ref())
            .await?;

        let mut replacement = agent.clone();
        replacement.id = new_agent_id.to_string();
        replacement.status = AgentStatus::Idle;
        replacement.pane_index = pane.pane;
        replacement.last_activity = Utc::now();
        self.registry.register(replacement.clone()).await?;

        if let Some(task_id) = &agent.current_task_id {
            self.dashboard.assign_task_to_agent(task_id, new_agent_id).await?;
        }

        self.dashboard.increment_recovery_count().await?;
        self.tracker.set(key, RecoveryState::FullAttempted);
        info!(old_agent_id = %agent.id, new_agent_id, "hard recovery complete");
        Ok(replacement)
    }

    /// When recovery attempts for a `(agent, task)` pair are exhausted: fail
    /// the task, free the worker, and notify the admin.
    pub async fn exhaust_recovery(&self, agent: &Agent, admin_mailbox_notify: impl FnOnce() -> Result<()>) -> Result<()> {
        let key = task_key(agent);
        self.tracker.set(key.clone(), RecoveryState::FailedTask);

        if let Some(task_id) = &agent.current_task_id {
            self.dashboard
                .update_task_status(task_id, TaskStatus::Failed, None, Some("recovery exhausted".into()))
                .await?;
        }
        self.registry
            .update(&agent.id, |a| {
                a.current_task_id = None;
                a.status = AgentStatus::Idle;
            })
            .await?;
        self.dashboard.increment_crash_count().await?;
        admin_mailbox_notify()?;
        error!(agent_id = %agent.id, "recovery exhausted, task failed");
        self.tracker.clear(&key);
        Ok(())
    }

    pub fn recovery_state(&self, agent: &Agent) -> RecoveryState {
        self.tracker.get(&task_key(agent))
    }

    /// One full monitor-loop pass: list agents, check each, recover the
    /// unhealthy ones in turn. Returns whether every worker is idle with no
    /// in-progress task, the self-termination signal for the daemon loop.
    pub async fn run_pass(&self) -> Result<bool> {
        let unhealthy = self.unhealthy_agents().await?;
        for (agent, verdict) in unhealthy {
            let recovered = self.attempt_recovery(&agent, verdict).await.unwrap_or(false);
            if recovered {
                continue;
            }
            match self.recovery_state(&agent) {
                RecoveryState::Attempted => {
                    let new_id = format!("{}-recovered", agent.id);
                    let _ = self.full_recovery(&agent, &new_id).await;
                }
                RecoveryState::FullAttempted => {
                    let _ = self
                        .exhaust_recovery(&agent, || {
                            info!(agent_id = %agent.id, "would notify admin via ipc");
                            Ok(())
                        })
                        .await;
                }
                _ => {}
            }
        }

        let agents = self.registry.list().await?;
        let all_idle = agents
            .iter()
            .filter(|a| a.role == AgentRole::Worker && a.status != AgentStatus::Terminated)
            .all(|a| a.status == AgentStatus::Idle && a.current_task_id.is_none());
        let tasks = self.dashboard.list_tasks().await?;
        let none_in_progress = !tasks.iter().any(|t| t.status == TaskStatus::InProgress);
        Ok(all_idle && none_in_progress)
    }

    pub async fn refresh_agent_summaries(&self) -> Result<()> {
        for agent in self.registry.list().await? {
            self.dashboard
                .upsert_agent_summary(AgentSummary {
                    id: agent.id.clone(),
                    role: format!("{:?}", agent.role).to_lowercase(),
                    status: format!("{:?}", agent.status).to_lowercase(),
                    current_task_id: agent.current_task_id.clone(),
                    worktree: agent.worktree_path.map(|p| p.display().to_string()),
                })
                .await?;
        }
        Ok(())
    }
}

fn task_key(agent: &Agent) -> String {
    agent
        .current_task_id
        .clone()
        .unwrap_or_else(|| agent.id.clone())
}

pub fn recovery_metadata(reason: &str) -> serde_json::Value {
    json!({
        "last_recovery_reason": reason,
        "last_recovery_at": Utc::now().to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentmesh_term::FakeTerminalAdapter;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn sample_agent(id: &str, session: &str) -> Agent {
        Agent {
            id: id.to_string(),
            role: AgentRole::Worker,
            status: AgentStatus::Busy,
            session_name: session.to_string(),
            window_index: 0,
            pane_index: 1,
            working_dir: PathBuf::from("/tmp"),
            worktree_path: None,
            branch: None,
            ai_cli: "claude".into(),
            worker_slot: Some(1),
            current_task_id: Some("t1".into()),
            last_activity: Utc::now(),
        }
    }

    #[tokio::test]
    async fn dead_session_is_unhealthy() {
        let term = FakeTerminalAdapter::new();
        let agent = sample_agent("w1", "dead-session");
        let verdict = check_agent(&agent, &term, &HealthcheckConfig::default(), false).await;
        assert_eq!(verdict, HealthVerdict::SessionDead);
    }

    #[tokio::test]
    async fn live_session_without_stall_is_healthy() {
        let term = FakeTerminalAdapter::new();
        term.create_session("live", "/tmp").await.unwrap();
        let mut agent = sample_agent("w1", "live");
        agent.last_activity = Utc::now();
        let verdict = check_agent(&agent, &term, &HealthcheckConfig::default(), false).await;
        assert_eq!(verdict, HealthVerdict::Healthy);
    }

    #[tokio::test]
    async fn terminated_agents_are_skipped() {
        let dir = TempDir::new().unwrap();
        let registry = AgentRegistry::new(
            dir.path().join("session"),
            dir.path().join("global"),
            dir.path().join("project"),
            "s1".into(),
        );
        let mut agent = sample_agent("w1", "s1");
        agent.status = AgentStatus::Idle;
        registry.register(agent).await.unwrap();
        registry.terminate("w1").await.unwrap();

        let dashboard = DashboardStore::new(dir.path().join("session"));
        dashboard.init("w1", dir.path().to_path_buf()).await.unwrap();
        let term = FakeTerminalAdapter::new();
        let engine = HealthcheckEngine::new(&registry, &dashboard, &term);
        assert!(engine.unhealthy_agents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn repeated_stall_escalates_to_failed_task() {
        let dir = TempDir::new().unwrap();
        let registry = AgentRegistry::new(
            dir.path().join("session"),
            dir.path().join("global"),
            dir.path().join("project"),
            "s1".into(),
        );
        let dashboard = DashboardStore::new(dir.path().join("session"));
        dashboard.init("s1", dir.path().to_path_buf()).await.unwrap();
        let task = dashboard.create_task("t", "d", Default::default()).await.unwrap();

        let term = FakeTerminalAdapter::new();
        term.create_session("s1", "/tmp").await.unwrap();
        let mut agent = sample_agent("w1", "s1");
        agent.current_task_id = Some(task.id.clone());
        registry.register(agent.clone()).await.unwrap();

        let mut engine = HealthcheckEngine::new(&registry, &dashboard, &term);
        engine.config.max_recovery_attempts = 2;

        assert!(engine.attempt_recovery(&agent, HealthVerdict::Stalled).await.unwrap());
        assert_eq!(engine.recovery_state(&agent), RecoveryState::Attempted);

        // Second stall spends the soft-recovery budget.
        assert!(!engine.attempt_recovery(&agent, HealthVerdict::Stalled).await.unwrap());
        assert_eq!(engine.recovery_state(&agent), RecoveryState::Attempted);

        let replacement = engine.full_recovery(&agent, "w1-recovered").await.unwrap();
        assert_eq!(engine.recovery_state(&replacement), RecoveryState::FullAttempted);

        // The replacement agent keeps spending the same task's counter, so a
        // further stall does not reopen the soft-recovery branch.
        assert!(!engine
            .attempt_recovery(&replacement, HealthVerdict::Stalled)
            .await
            .unwrap());
        assert_eq!(engine.recovery_state(&replacement), RecoveryState::FullAttempted);

        let task = dashboard.get_task(&task.id).await.unwrap();
        assert_eq!(task.metadata["recovery_attempts"], serde_json::json!(3));

        engine
            .exhaust_recovery(&replacement, || Ok(()))
            .await
            .unwrap();
        let task = dashboard.get_task(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_message.as_deref(), Some("recovery exhausted"));

        let freed = registry.lookup("w1-recovered").await.unwrap();
        assert!(freed.current_task_id.is_none());
        assert_eq!(freed.status, AgentStatus::Idle);
    }
}
