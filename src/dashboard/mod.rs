//! Durable task dashboard: a single `dashboard.md` file per session holding
//! YAML front matter (the machine-readable state) followed by a rendered
//! markdown view. Every mutation takes the dashboard lock, re-reads the
//! file, applies the change, re-renders, and writes back atomically.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::error::{AgentMeshError, Result};
use crate::lock::{atomic_write, FileLock};

pub const LOCK_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Blocked,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    fn allowed_next(self) -> &'static [TaskStatus] {
        use TaskStatus::*;
        match self {
            Pending => &[InProgress, Cancelled, Blocked],
            InProgress => &[Completed, Failed, Cancelled, Blocked],
            Blocked => &[InProgress, Cancelled, Failed],
            Completed | Failed | Cancelled => &[],
        }
    }

    fn can_transition_to(self, next: TaskStatus) -> bool {
        self.allowed_next().contains(&next)
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub assigned_agent_id: Option<String>,
    pub previous_agent_id: Option<String>,
    pub branch: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub task_file_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskAssign,
    TaskProgress,
    TaskComplete,
    TaskFailed,
    TaskApproved,
    StatusUpdate,
    Request,
    Response,
    Broadcast,
    System,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub sender_id: String,
    pub receiver_id: String,
    pub message_type: MessageType,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub id: String,
    pub role: String,
    pub status: String,
    pub current_task_id: Option<String>,
    pub worktree: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dashboard {
    pub workspace_id: String,
    pub workspace_path: PathBuf,
    pub updated_at: DateTime<Utc>,
    pub tasks: Vec<Task>,
    pub agents: Vec<AgentSummary>,
    pub session_started_at: Option<DateTime<Utc>>,
    pub session_finished_at: Option<DateTime<Utc>>,
    pub process_crash_count: u32,
    pub process_recovery_count: u32,
    pub messages: Vec<LogEntry>,
}

impl Dashboard {
    fn new(workspace_id: String, workspace_path: PathBuf) -> Self {
        Self {
            workspace_id,
            workspace_path,
            updated_at: Utc::now(),
            tasks: Vec::new(),
            agents: Vec::new(),
            session_started_at: None,
            session_finished_at: None,
            process_crash_count: 0,
            process_recovery_count: 0,
            messages: Vec::new(),
        }
    }

    fn all_tasks_terminal(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(|t| t.status.is_terminal())
    }

    /// Render the current state as the markdown body appended after the
    /// YAML front matter. Pure function over the front matter, so repeated
    /// renders of the same state are byte-identical.
    fn render_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("# Dashboard: {}\n\n", self.workspace_id));

        out.push_str("## Agents\n\n");
        out.push_str("| id | role | status | task | worktree |\n");
        out.push_str("|---|---|---|---|---|\n");
        for a in &self.agents {
            out.push_str(&format!(
                "| {} | {} | {} | {} | {} |\n",
                a.id,
                a.role,
                a.status,
                a.current_task_id.as_deref().unwrap_or("-"),
                a.worktree.as_deref().unwrap_or("-"),
            ));
        }

        out.push_str("\n## Tasks\n\n");
        out.push_str("| id | title | status | progress | assignee | branch |\n");
        out.push_str("|---|---|---|---|---|---|\n");
        for t in &self.tasks {
            out.push_str(&format!(
                "| {} | {} | {} | {}% | {} | {} |\n",
                t.id,
                t.title,
                t.status.as_str(),
                t.progress,
                t.assigned_agent_id.as_deref().unwrap_or("-"),
                t.branch.as_deref().unwrap_or("-"),
            ));
        }

        out.push_str("\n## Session\n\n");
        out.push_str(&format!(
            "started: {}\nfinished: {}\ncrashes: {}\nrecoveries: {}\n",
            self.session_started_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into()),
            self.session_finished_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into()),
            self.process_crash_count,
            self.process_recovery_count,
        ));

        out.push_str("\n## Recent Messages\n\n");
        for m in self.messages.iter().rev().take(20) {
            out.push_str(&format!(
                "- [{}] {} -> {} ({:?}): {}\n",
                m.timestamp.to_rfc3339(),
                m.sender_id,
                m.receiver_id,
                m.message_type,
                m.content
            ));
        }

        out
    }

    fn to_file_contents(&self) -> Result<String> {
        let front_matter = serde_yaml::to_string(self)?;
        Ok(format!("---\n{front_matter}---\n\n{}", self.render_markdown()))
    }

    fn from_file_contents(contents: &str) -> Result<Self> {
        let front_matter = contents
            .strip_prefix("---\n")
            .and_then(|rest| rest.split_once("\n---\n"))
            .map(|(fm, _)| fm)
            .ok_or_else(|| AgentMeshError::validation("dashboard file missing YAML front matter"))?;
        Ok(serde_yaml::from_str(front_matter)?)
    }
}

/// Result of applying an incoming message to the dashboard during the
/// admin's mailbox auto-sync. Never propagated as an error.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub applied: u32,
    pub skipped: Vec<(String, String)>,
}

/// The file-backed dashboard store for one session.
pub struct DashboardStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl DashboardStore {
    pub fn new(session_dir: PathBuf) -> Self {
        let dir = session_dir.join("dashboard");
        Self {
            path: dir.join("dashboard.md"),
            lock_path: dir.join("dashboard.lock"),
        }
    }

    async fn lock(&self) -> Result<FileLock> {
        FileLock::acquire(&self.lock_path, LOCK_TIMEOUT, "dashboard").await
    }

    async fn read(&self) -> Result<Dashboard> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Dashboard::from_file_contents(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(AgentMeshError::not_found("dashboard", self.path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, dashboard: &Dashboard) -> Result<()> {
        atomic_write(&self.path, &dashboard.to_file_contents()?).await
    }

    pub async fn init(&self, workspace_id: &str, workspace_path: PathBuf) -> Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        let dashboard = Dashboard::new(workspace_id.to_string(), workspace_path);
        self.write(&dashboard).await
    }

    pub async fn get_dashboard(&self) -> Result<Dashboard> {
        self.read().await
    }

    /// Render the current dashboard as the same YAML-front-matter +
    /// markdown text that's written to disk, for display by a CLI.
    pub async fn render_file_contents(&self) -> Result<String> {
        self.read().await?.to_file_contents()
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.read().await?.tasks)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        self.read()
            .await?
            .tasks
            .into_iter()
            .find(|t| t.id == task_id)
            .ok_or_else(|| AgentMeshError::not_found("task", task_id))
    }

    pub async fn create_task(
        &self,
        title: &str,
        description: &str,
        metadata: HashMap<String, Value>,
    ) -> Result<Task> {
        let _guard = self.lock().await?;
        let mut dashboard = self.read().await?;

        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            description: description.to_string(),
            status: TaskStatus::Pending,
            progress: 0,
            assigned_agent_id: None,
            previous_agent_id: None,
            branch: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            metadata,
            task_file_path: None,
        };
        dashboard.tasks.push(task.clone());
        dashboard.updated_at = Utc::now();
        self.write(&dashboard).await?;
        info!(task_id = %task.id, "task created");
        Ok(task)
    }

    pub async fn assign_task_to_agent(&self, task_id: &str, agent_id: &str) -> Result<()> {
        let _guard = self.lock().await?;
        let mut dashboard = self.read().await?;

        for other in dashboard.tasks.iter_mut() {
            if other.assigned_agent_id.as_deref() == Some(agent_id) && other.id != task_id {
                other.assigned_agent_id = None;
            }
        }
        let task = dashboard
            .tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| AgentMeshError::not_found("task", task_id))?;
        task.assigned_agent_id = Some(agent_id.to_string());
        dashboard.updated_at = Utc::now();
        self.write(&dashboard).await
    }

    /// Record the branch a worker is developing a task's changes on, so a
    /// later merge preview has something to look up.
    pub async fn set_task_branch(&self, task_id: &str, branch: &str) -> Result<()> {
        let _guard = self.lock().await?;
        let mut dashboard = self.read().await?;
        let task = dashboard
            .tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| AgentMeshError::not_found("task", task_id))?;
        task.branch = Some(branch.to_string());
        dashboard.updated_at = Utc::now();
        self.write(&dashboard).await
    }

    /// Validate and apply a status transition. Returns the allowed set for
    /// the current status when the requested transition is rejected.
    pub async fn update_task_status(
        &self,
        task_id: &str,
        new_status: TaskStatus,
        progress: Option<u8>,
        error_message: Option<String>,
    ) -> Result<Task> {
        let _guard = self.lock().await?;
        let mut dashboard = self.read().await?;
        let idx = dashboard
            .tasks
            .iter()
            .position(|t| t.id == task_id)
            .ok_or_else(|| AgentMeshError::not_found("task", task_id))?;

        let current = dashboard.tasks[idx].status;
        if !current.can_transition_to(new_status) {
            return Err(AgentMeshError::InvalidTransition {
                task_id: task_id.to_string(),
                from: current.as_str().to_string(),
                to: new_status.as_str().to_string(),
                allowed: current.allowed_next().iter().map(|s| s.as_str().to_string()).collect(),
            });
        }

        {
            let task = &mut dashboard.tasks[idx];
            task.status = new_status;
            if let Some(p) = progress {
                task.progress = p;
            }
            if new_status == TaskStatus::InProgress && task.started_at.is_none() {
                task.started_at = Some(Utc::now());
            }
            if new_status.is_terminal() {
                task.completed_at = Some(Utc::now());
                task.error_message = error_message;
            }
        }

        if dashboard.session_started_at.is_none()
            && dashboard.tasks.iter().any(|t| t.status != TaskStatus::Pending)
        {
            dashboard.session_started_at = Some(Utc::now());
        }
        if dashboard.all_tasks_terminal() {
            dashboard.session_finished_at = Some(Utc::now());
        }
        dashboard.updated_at = Utc::now();

        let task = dashboard.tasks[idx].clone();
        self.write(&dashboard).await?;
        Ok(task)
    }

    /// Reset a terminal task back to `pending`, preserving metadata and
    /// history pointers.
    pub async fn reopen_task(&self, task_id: &str) -> Result<Task> {
        let _guard = self.lock().await?;
        let mut dashboard = self.read().await?;
        let idx = dashboard
            .tasks
            .iter()
            .position(|t| t.id == task_id)
            .ok_or_else(|| AgentMeshError::not_found("task", task_id))?;

        if !dashboard.tasks[idx].status.is_terminal() {
            return Err(AgentMeshError::TerminalStateImmutable(task_id.to_string()));
        }
        {
            let task = &mut dashboard.tasks[idx];
            task.previous_agent_id = task.assigned_agent_id.take();
            task.status = TaskStatus::Pending;
            task.completed_at = None;
            task.error_message = None;
            task.progress = 0;
        }
        dashboard.updated_at = Utc::now();
        let task = dashboard.tasks[idx].clone();
        self.write(&dashboard).await?;
        Ok(task)
    }

    pub async fn report_task_progress(&self, task_id: &str, progress: u8, message: &str, sender_id: &str) -> Result<()> {
        let _guard = self.lock().await?;
        let mut dashboard = self.read().await?;
        let task = dashboard
            .tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| AgentMeshError::not_found("task", task_id))?;

        if task.status.is_terminal() {
            return Err(AgentMeshError::TerminalStateImmutable(task_id.to_string()));
        }
        task.progress = progress;

        dashboard.messages.push(LogEntry {
            sender_id: sender_id.to_string(),
            receiver_id: "admin".to_string(),
            message_type: MessageType::TaskProgress,
            content: message.to_string(),
            timestamp: Utc::now(),
        });
        dashboard.updated_at = Utc::now();
        self.write(&dashboard).await
    }

    pub async fn remove_task(&self, task_id: &str) -> Result<()> {
        let _guard = self.lock().await?;
        let mut dashboard = self.read().await?;
        let before = dashboard.tasks.len();
        dashboard.tasks.retain(|t| t.id != task_id);
        if dashboard.tasks.len() == before {
            return Err(AgentMeshError::not_found("task", task_id));
        }
        dashboard.updated_at = Utc::now();
        self.write(&dashboard).await
    }

    pub async fn upsert_agent_summary(&self, summary: AgentSummary) -> Result<()> {
        let _guard = self.lock().await?;
        let mut dashboard = self.read().await?;
        dashboard.agents.retain(|a| a.id != summary.id);
        dashboard.agents.push(summary);
        dashboard.updated_at = Utc::now();
        self.write(&dashboard).await
    }

    pub async fn increment_recovery_count(&self) -> Result<()> {
        let _guard = self.lock().await?;
        let mut dashboard = self.read().await?;
        dashboard.process_recovery_count += 1;
        dashboard.updated_at = Utc::now();
        self.write(&dashboard).await
    }

    pub async fn increment_crash_count(&self) -> Result<()> {
        let _guard = self.lock().await?;
        let mut dashboard = self.read().await?;
        dashboard.process_crash_count += 1;
        dashboard.updated_at = Utc::now();
        self.write(&dashboard).await
    }

    /// Bump and return a task's recovery-attempt counter, persisted in its
    /// metadata so it survives a process restart.
    pub async fn bump_task_recovery_attempts(&self, task_id: &str) -> Result<u32> {
        let _guard = self.lock().await?;
        let mut dashboard = self.read().await?;
        let task = dashboard
            .tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| AgentMeshError::not_found("task", task_id))?;
        let count = task
            .metadata
            .get("recovery_attempts")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32
            + 1;
        task.metadata.insert("recovery_attempts".to_string(), json!(count));
        dashboard.updated_at = Utc::now();
        self.write(&dashboard).await?;
        Ok(count)
    }

    /// Apply a batch of incoming messages that carry a `task_id` as
    /// progress/complete/failed updates. Never fails the caller: rejected
    /// transitions are recorded as skipped, not propagated. A message that
    /// merely confirms the task's current status (e.g. a stale
    /// `task_complete` re-read after the status was already set directly)
    /// is a true no-op — neither applied nor skipped.
    pub async fn sync_from_messages(
        &self,
        updates: Vec<(String, TaskStatus, Option<u8>, String)>,
    ) -> Result<SyncOutcome> {
        let mut outcome = SyncOutcome::default();
        for (task_id, status, progress, reason) in updates {
            match self.get_task(&task_id).await {
                Ok(task) if task.status == status => continue,
                _ => {}
            }
            match self.update_task_status(&task_id, status, progress, None).await {
                Ok(_) => outcome.applied += 1,
                Err(AgentMeshError::InvalidTransition { .. }) | Err(AgentMeshError::NotFound { .. }) => {
                    outcome.skipped.push((task_id, reason));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> DashboardStore {
        DashboardStore::new(dir.path().to_path_buf())
    }

    #[tokio::test]
    async fn rejects_transition_from_terminal_state() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.init("w1", dir.path().to_path_buf()).await.unwrap();
        let task = store.create_task("t", "d", HashMap::new()).await.unwrap();
        store
            .update_task_status(&task.id, TaskStatus::InProgress, None, None)
            .await
            .unwrap();
        store
            .update_task_status(&task.id, TaskStatus::Completed, None, None)
            .await
            .unwrap();

        let result = store
            .update_task_status(&task.id, TaskStatus::InProgress, None, None)
            .await;
        assert!(matches!(result, Err(AgentMeshError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn reopen_resets_to_pending_and_allows_reentry() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.init("w1", dir.path().to_path_buf()).await.unwrap();
        let task = store.create_task("t", "d", HashMap::new()).await.unwrap();
        store.update_task_status(&task.id, TaskStatus::Cancelled, None, None).await.unwrap();

        let reopened = store.reopen_task(&task.id).await.unwrap();
        assert_eq!(reopened.status, TaskStatus::Pending);
        store.update_task_status(&task.id, TaskStatus::InProgress, None, None).await.unwrap();
    }

    #[tokio::test]
    async fn render_is_idempotent_over_same_front_matter() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.init("w1", dir.path().to_path_buf()).await.unwrap();
        store.create_task("t", "d", HashMap::new()).await.unwrap();
        let d1 = store.read().await.unwrap();
        let d2 = store.read().await.unwrap();
        assert_eq!(d1.render_markdown(), d2.render_markdown());
    }

    #[tokio::test]
    async fn sync_skips_invalid_transitions_without_failing() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.init("w1", dir.path().to_path_buf()).await.unwrap();
        let task = store.create_task("t", "d", HashMap::new()).await.unwrap();
        store.update_task_status(&task.id, TaskStatus::InProgress, None, None).await.unwrap();
        store.update_task_status(&task.id, TaskStatus::Completed, None, None).await.unwrap();

        let outcome = store
            .sync_from_messages(vec![(task.id.clone(), TaskStatus::InProgress, None, "late message".into())])
            .await
            .unwrap();
        assert_eq!(outcome.applied, 0);
        assert_eq!(outcome.skipped.len(), 1);
    }
}
