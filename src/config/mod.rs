//! Layered configuration resolution.
//!
//! Precedence, highest first: explicit call argument > session
//! `config.json` > process environment / `.env` > built-in default. Callers
//! that accept a per-call override (e.g. `enable_git` on
//! `init_tmux_workspace`) apply it themselves; this module resolves
//! everything below that.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ErrorContext, Result};

pub const DEFAULT_MCP_DIR: &str = ".agentmesh";

/// Worker CLI/model assignment mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerCliMode {
    Uniform,
    PerWorker,
}

impl Default for WorkerCliMode {
    fn default() -> Self {
        Self::Uniform
    }
}

/// A named bundle of model/CLI defaults, selected by `model_profile`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelProfile {
    pub admin_cli: String,
    pub worker_cli: String,
    pub admin_model: String,
    pub worker_model: String,
    pub default_worker_count: usize,
    pub thinking_token_budget: u32,
}

fn standard_profile() -> ModelProfile {
    ModelProfile {
        admin_cli: "claude".into(),
        worker_cli: "claude".into(),
        admin_model: "standard".into(),
        worker_model: "standard".into(),
        default_worker_count: 2,
        thinking_token_budget: 4096,
    }
}

fn performance_profile() -> ModelProfile {
    ModelProfile {
        admin_cli: "claude".into(),
        worker_cli: "claude".into(),
        admin_model: "performance".into(),
        worker_model: "performance".into(),
        default_worker_count: 4,
        thinking_token_budget: 16384,
    }
}

/// Per-session persisted settings, round-tripped at `{session_dir}/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub session_id: String,
    #[serde(default = "default_true")]
    pub enable_git: bool,
    #[serde(default = "default_mcp_tool_prefix")]
    pub mcp_tool_prefix: String,
}

fn default_true() -> bool {
    true
}

fn default_mcp_tool_prefix() -> String {
    "agentmesh".into()
}

impl SessionConfig {
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Some(
                serde_json::from_str(&content)
                    .with_context(|| format!("parsing session config at {}", path.display()))?,
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        crate::lock::atomic_write(path, &content).await
    }
}

/// The fully-resolved, in-memory view of configuration for one process.
/// Built once at startup; `resolve_enable_git` re-derives the precedence
/// chain on demand so stale cached values never leak into a dispatch.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub mcp_dir: String,
    pub max_workers: usize,
    pub model_profile_name: String,
    pub worker_cli_mode: WorkerCliMode,
    pub per_worker_cli: HashMap<u32, String>,
    pub healthcheck_interval_seconds: u64,
    pub healthcheck_stall_timeout_seconds: u64,
    pub healthcheck_max_recovery_attempts: u32,
    pub healthcheck_idle_stop_consecutive: u32,
    pub cost_warning_threshold_usd: f64,
    pub quality_check_max_iterations: u32,
    pub quality_check_same_issue_limit: u32,
    env_enable_git: Option<bool>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mcp_dir: DEFAULT_MCP_DIR.to_string(),
            max_workers: 4,
            model_profile_name: "standard".into(),
            worker_cli_mode: WorkerCliMode::Uniform,
            per_worker_cli: HashMap::new(),
            healthcheck_interval_seconds: 30,
            healthcheck_stall_timeout_seconds: 300,
            healthcheck_max_recovery_attempts: 3,
            healthcheck_idle_stop_consecutive: 5,
            cost_warning_threshold_usd: 10.0,
            quality_check_max_iterations: 5,
            quality_check_same_issue_limit: 3,
            env_enable_git: None,
        }
    }
}

impl RuntimeConfig {
    /// Load `.env` and environment variables, and a project-level
    /// `config.json` if present at `{project_root}/<mcp_dir>/config.json`,
    /// layering over [`RuntimeConfig::default`].
    pub async fn load(project_root: &Path) -> Result<Self> {
        let mut cfg = Self::default();

        let env_path = project_root.join(&cfg.mcp_dir).join(".env");
        if env_path.exists() {
            if let Err(e) = dotenv_file(&env_path) {
                warn!(error = %e, path = %env_path.display(), "failed to load .env");
            }
        }

        if let Ok(v) = std::env::var("AGENTMESH_MAX_WORKERS") {
            if let Ok(n) = v.parse() {
                cfg.max_workers = n;
            }
        }
        if let Ok(v) = std::env::var("AGENTMESH_MODEL_PROFILE") {
            cfg.model_profile_name = v;
        }
        if let Ok(v) = std::env::var("AGENTMESH_ENABLE_GIT") {
            cfg.env_enable_git = parse_bool(&v);
        }

        let builder = config::Config::builder()
            .add_source(config::Environment::with_prefix("AGENTMESH").separator("__"));
        if let Ok(built) = builder.build() {
            if let Ok(n) = built.get::<usize>("max_workers") {
                cfg.max_workers = n;
            }
        }

        debug!(max_workers = cfg.max_workers, profile = %cfg.model_profile_name, "resolved runtime config");
        Ok(cfg)
    }

    pub fn model_profile(&self) -> ModelProfile {
        match self.model_profile_name.as_str() {
            "performance" => performance_profile(),
            _ => standard_profile(),
        }
    }

    /// Precedence chain for `enable_git`: call arg > session config.json >
    /// env/.env > default (true).
    pub fn resolve_enable_git(&self, call_arg: Option<bool>, session: Option<&SessionConfig>) -> bool {
        call_arg
            .or_else(|| session.map(|s| s.enable_git))
            .or(self.env_enable_git)
            .unwrap_or(true)
    }

    /// CLI resolution chain for a worker at `slot`, per the dispatcher's
    /// contract: per-worker override > uniform setting > profile default >
    /// global default.
    pub fn resolve_worker_cli(&self, slot: u32) -> String {
        if self.worker_cli_mode == WorkerCliMode::PerWorker {
            if let Some(cli) = self.per_worker_cli.get(&slot) {
                return cli.clone();
            }
        }
        let profile = self.model_profile();
        if !profile.worker_cli.is_empty() {
            return profile.worker_cli;
        }
        "claude".to_string()
    }

    pub fn session_dir(&self, project_root: &Path, session_id: &str) -> PathBuf {
        project_root.join(&self.mcp_dir).join(session_id)
    }

    pub fn global_registry_dir(&self) -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(format!(".{}", self.mcp_dir.trim_start_matches('.')))
            .join("agents")
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn dotenv_file(path: &Path) -> Result<()> {
    dotenvy::from_path(path).with_context(|| format!("loading {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enable_git_precedence_prefers_call_arg() {
        let cfg = RuntimeConfig::default();
        let session = SessionConfig {
            session_id: "s1".into(),
            enable_git: false,
            mcp_tool_prefix: "agentmesh".into(),
        };
        assert!(cfg.resolve_enable_git(Some(true), Some(&session)));
        assert!(!cfg.resolve_enable_git(None, Some(&session)));
        assert!(cfg.resolve_enable_git(None, None));
    }

    #[test]
    fn worker_cli_falls_back_to_profile_default() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.resolve_worker_cli(1), "claude");
    }

    #[test]
    fn per_worker_override_wins_in_per_worker_mode() {
        let mut cfg = RuntimeConfig::default();
        cfg.worker_cli_mode = WorkerCliMode::PerWorker;
        cfg.per_worker_cli.insert(2, "codex".into());
        assert_eq!(cfg.resolve_worker_cli(2), "codex");
        assert_eq!(cfg.resolve_worker_cli(3), "claude");
    }
}
