//! Agent registry: the persistent source of truth for agents, shared across
//! independent server processes that serve the same session.
//!
//! Storage is `{session_dir}/agents.json` plus a per-user global pointer
//! file at `{user_home}/.<mcp_dir>/agents/{agent_id}.json` mapping an agent
//! id to its owning project/session. Both are authoritative: the in-memory
//! cache is discarded whenever the file's mtime moves past what we last
//! read, so concurrent writers never split-brain.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{AgentMeshError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Owner,
    Admin,
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Blocked,
    Terminated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub role: AgentRole,
    pub status: AgentStatus,
    pub session_name: String,
    pub window_index: u32,
    pub pane_index: u32,
    pub working_dir: PathBuf,
    pub worktree_path: Option<PathBuf>,
    pub branch: Option<String>,
    pub ai_cli: String,
    pub worker_slot: Option<u32>,
    pub current_task_id: Option<String>,
    pub last_activity: DateTime<Utc>,
}

impl Agent {
    fn pane_key(&self) -> (String, u32, u32) {
        (self.session_name.clone(), self.window_index, self.pane_index)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistrySnapshot {
    #[serde(default)]
    agents: Vec<Agent>,
    #[serde(default)]
    owner_wait_active: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct GlobalPointer {
    project_root: PathBuf,
    session_id: String,
}

struct Cache {
    agents: HashMap<String, Agent>,
    owner_wait_active: bool,
    read_at: Option<SystemTime>,
}

/// File-backed registry for one session. Holds an in-memory cache that is
/// always validated against the file's mtime before being trusted.
pub struct AgentRegistry {
    session_dir: PathBuf,
    global_dir: PathBuf,
    project_root: PathBuf,
    session_id: String,
    cache: RwLock<Cache>,
}

impl AgentRegistry {
    pub fn new(session_dir: PathBuf, global_dir: PathBuf, project_root: PathBuf, session_id: String) -> Self {
        Self {
            session_dir,
            global_dir,
            project_root,
            session_id,
            cache: RwLock::new(Cache {
                agents: HashMap::new(),
                owner_wait_active: false,
                read_at: None,
            }),
        }
    }

    fn agents_file(&self) -> PathBuf {
        self.session_dir.join("agents.json")
    }

    async fn file_mtime(&self) -> Option<SystemTime> {
        tokio::fs::metadata(self.agents_file())
            .await
            .ok()
            .and_then(|m| m.modified().ok())
    }

    /// Reload from disk if the file has changed since our last read. The
    /// file is authoritative; our cache exists only to avoid re-parsing on
    /// every call.
    async fn refresh(&self) -> Result<()> {
        let mtime = self.file_mtime().await;
        let mut cache = self.cache.write().await;
        if mtime.is_some() && mtime == cache.read_at {
            return Ok(());
        }

        let snapshot = match tokio::fs::read_to_string(self.agents_file()).await {
            Ok(content) => serde_json::from_str::<RegistrySnapshot>(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RegistrySnapshot::default(),
            Err(e) => return Err(e.into()),
        };

        cache.agents = snapshot
            .agents
            .into_iter()
            .map(|a| (a.id.clone(), a))
            .collect();
        cache.owner_wait_active = snapshot.owner_wait_active;
        cache.read_at = mtime;
        Ok(())
    }

    async fn persist(&self, cache: &Cache) -> Result<()> {
        let snapshot = RegistrySnapshot {
            agents: cache.agents.values().cloned().collect(),
            owner_wait_active: cache.owner_wait_active,
        };
        let content = serde_json::to_string_pretty(&snapshot)?;
        crate::lock::atomic_write(&self.agents_file(), &content).await?;
        Ok(())
    }

    async fn write_global_pointer(&self, agent_id: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.global_dir).await?;
        let path = self.global_dir.join(format!("{agent_id}.json"));
        let pointer = GlobalPointer {
            project_root: self.project_root.clone(),
            session_id: self.session_id.clone(),
        };
        crate::lock::atomic_write(&path, &serde_json::to_string_pretty(&pointer)?).await
    }

    pub async fn register(&self, agent: Agent) -> Result<()> {
        self.refresh().await?;
        let mut cache = self.cache.write().await;

        if cache.agents.contains_key(&agent.id) {
            return Err(AgentMeshError::validation(format!(
                "agent '{}' already registered",
                agent.id
            )));
        }
        if cache
            .agents
            .values()
            .any(|a| a.status != AgentStatus::Terminated && a.pane_key() == agent.pane_key())
        {
            return Err(AgentMeshError::validation(format!(
                "pane {:?} is already occupied",
                agent.pane_key()
            )));
        }
        if agent.role == AgentRole::Owner && cache.agents.values().any(|a| a.role == AgentRole::Owner) {
            return Err(AgentMeshError::validation("session already has an owner"));
        }
        if agent.role == AgentRole::Admin && cache.agents.values().any(|a| a.role == AgentRole::Admin) {
            return Err(AgentMeshError::validation("session already has an admin"));
        }

        let id = agent.id.clone();
        cache.agents.insert(id.clone(), agent);
        self.persist(&cache).await?;
        self.write_global_pointer(&id).await?;
        info!(agent_id = %id, "agent registered");
        Ok(())
    }

    pub async fn terminate(&self, agent_id: &str) -> Result<()> {
        self.refresh().await?;
        let mut cache = self.cache.write().await;
        let agent = cache
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| AgentMeshError::not_found("agent", agent_id))?;
        agent.status = AgentStatus::Terminated;
        self.persist(&cache).await?;
        info!(agent_id, "agent terminated");
        Ok(())
    }

    pub async fn lookup(&self, agent_id: &str) -> Result<Agent> {
        self.refresh().await?;
        let cache = self.cache.read().await;
        cache
            .agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| AgentMeshError::not_found("agent", agent_id))
    }

    pub async fn list(&self) -> Result<Vec<Agent>> {
        self.refresh().await?;
        let cache = self.cache.read().await;
        Ok(cache.agents.values().cloned().collect())
    }

    pub async fn update<F>(&self, agent_id: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Agent),
    {
        self.refresh().await?;
        let mut cache = self.cache.write().await;
        let agent = cache
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| AgentMeshError::not_found("agent", agent_id))?;
        mutate(agent);
        self.persist(&cache).await?;
        Ok(())
    }

    /// Lowest free worker slot not exceeding `max_workers`.
    pub async fn resolve_worker_slot(&self, max_workers: usize) -> Result<u32> {
        self.refresh().await?;
        let cache = self.cache.read().await;
        let taken: std::collections::HashSet<u32> = cache
            .agents
            .values()
            .filter(|a| a.role == AgentRole::Worker && a.status != AgentStatus::Terminated)
            .filter_map(|a| a.worker_slot)
            .collect();
        for slot in 1..=max_workers as u32 {
            if !taken.contains(&slot) {
                return Ok(slot);
            }
        }
        Err(AgentMeshError::WorkerLimitReached(max_workers))
    }

    pub async fn owner_wait_active(&self) -> Result<bool> {
        self.refresh().await?;
        Ok(self.cache.read().await.owner_wait_active)
    }

    pub async fn set_owner_wait(&self, active: bool) -> Result<()> {
        self.refresh().await?;
        let mut cache = self.cache.write().await;
        cache.owner_wait_active = active;
        self.persist(&cache).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_agent(id: &str, role: AgentRole, pane: u32) -> Agent {
        Agent {
            id: id.to_string(),
            role,
            status: AgentStatus::Idle,
            session_name: "s1".into(),
            window_index: 0,
            pane_index: pane,
            working_dir: PathBuf::from("/tmp"),
            worktree_path: None,
            branch: None,
            ai_cli: "claude".into(),
            worker_slot: None,
            current_task_id: None,
            last_activity: Utc::now(),
        }
    }

    fn registry(dir: &TempDir) -> AgentRegistry {
        AgentRegistry::new(
            dir.path().join("session"),
            dir.path().join("global"),
            dir.path().join("project"),
            "s1".into(),
        )
    }

    #[tokio::test]
    async fn rejects_duplicate_pane() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        reg.register(sample_agent("owner", AgentRole::Owner, 0)).await.unwrap();
        let clash = sample_agent("admin", AgentRole::Admin, 0);
        assert!(reg.register(clash).await.is_err());
    }

    #[tokio::test]
    async fn rejects_second_owner() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        reg.register(sample_agent("owner", AgentRole::Owner, 0)).await.unwrap();
        let second = sample_agent("owner2", AgentRole::Owner, 1);
        assert!(reg.register(second).await.is_err());
    }

    #[tokio::test]
    async fn worker_slot_is_lowest_free() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let mut w1 = sample_agent("w1", AgentRole::Worker, 1);
        w1.worker_slot = Some(1);
        reg.register(w1).await.unwrap();
        assert_eq!(reg.resolve_worker_slot(4).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn terminated_agent_frees_its_pane() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        reg.register(sample_agent("w1", AgentRole::Worker, 1)).await.unwrap();
        reg.terminate("w1").await.unwrap();
        let reuse = sample_agent("w2", AgentRole::Worker, 1);
        assert!(reg.register(reuse).await.is_ok());
    }
}
