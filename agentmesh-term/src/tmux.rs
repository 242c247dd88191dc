//! Real `tmux`(1)-backed implementation of [`TerminalAdapter`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::adapter::{PaneId, SplitDirection, TerminalAdapter, TerminalError};

/// Tunables for the tmux adapter.
#[derive(Debug, Clone)]
pub struct TmuxConfig {
    pub command_timeout: Duration,
    pub auto_start_server: bool,
    pub global_env: HashMap<String, String>,
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(30),
            auto_start_server: true,
            global_env: HashMap::new(),
        }
    }
}

pub struct TmuxAdapter {
    config: TmuxConfig,
}

impl TmuxAdapter {
    pub fn new() -> Self {
        Self::with_config(TmuxConfig::default())
    }

    pub fn with_config(config: TmuxConfig) -> Self {
        Self { config }
    }

    fn validate_session_name(name: &str) -> Result<(), TerminalError> {
        if name.is_empty() {
            return Err(TerminalError::InvalidSessionName(
                "session name cannot be empty".into(),
            ));
        }
        if name.contains(':') || name.contains('.') {
            return Err(TerminalError::InvalidSessionName(
                "session name cannot contain ':' or '.'".into(),
            ));
        }
        Ok(())
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output, TerminalError> {
        let output = tokio::time::timeout(
            self.config.command_timeout,
            Command::new("tmux").args(args).output(),
        )
        .await
        .map_err(|_| TerminalError::CommandFailed("tmux command timed out".into()))?
        .map_err(TerminalError::Io)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            debug!(?args, stderr, "tmux command failed");
            return Err(TerminalError::CommandFailed(stderr));
        }
        Ok(output)
    }

    async fn session_exists(&self, session: &str) -> bool {
        self.run(&["has-session", "-t", session]).await.is_ok()
    }

    async fn ensure_server_running(&self) -> Result<(), TerminalError> {
        if !self.config.auto_start_server {
            return Ok(());
        }
        let running = Command::new("tmux")
            .args(["list-sessions"])
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false);
        if !running {
            self.run(&["start-server"]).await?;
        }
        Ok(())
    }
}

impl Default for TmuxAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TerminalAdapter for TmuxAdapter {
    async fn create_session(&self, session: &str, cwd: &str) -> Result<PaneId, TerminalError> {
        Self::validate_session_name(session)?;
        self.ensure_server_running().await?;

        if self.session_exists(session).await {
            return Err(TerminalError::CommandFailed(format!(
                "session '{session}' already exists"
            )));
        }

        self.run(&["new-session", "-d", "-s", session, "-c", cwd])
            .await?;

        for (key, value) in &self.config.global_env {
            let _ = self.run(&["set-environment", "-t", session, key, value]).await;
        }

        Ok(PaneId::new(session, 0, 0))
    }

    async fn kill_session(&self, session: &str) -> Result<(), TerminalError> {
        if !self.session_exists(session).await {
            return Err(TerminalError::SessionNotFound(session.to_string()));
        }
        self.run(&["kill-session", "-t", session]).await?;
        Ok(())
    }

    async fn split_pane(
        &self,
        target: &PaneId,
        direction: SplitDirection,
        cwd: &str,
    ) -> Result<PaneId, TerminalError> {
        if !self.session_exists(&target.session).await {
            return Err(TerminalError::SessionNotFound(target.session.clone()));
        }

        let flag = match direction {
            SplitDirection::Horizontal => "-h",
            SplitDirection::Vertical => "-v",
        };
        let target_str = target.target();
        let out = self
            .run(&[
                "split-window",
                flag,
                "-t",
                &target_str,
                "-c",
                cwd,
                "-P",
                "-F",
                "#{pane_index}",
            ])
            .await?;
        let pane_index: u32 = String::from_utf8_lossy(&out.stdout)
            .trim()
            .parse()
            .map_err(|_| TerminalError::CommandFailed("could not parse new pane index".into()))?;

        Ok(PaneId::new(target.session.clone(), target.window, pane_index))
    }

    async fn send_keys(&self, pane: &PaneId, line: &str) -> Result<(), TerminalError> {
        if !self.session_exists(&pane.session).await {
            return Err(TerminalError::SessionNotFound(pane.session.clone()));
        }
        let target = pane.target();
        self.run(&["send-keys", "-t", &target, line, "Enter"])
            .await?;
        Ok(())
    }

    async fn session_alive(&self, session: &str) -> bool {
        self.session_exists(session).await
    }

    async fn pane_tail(&self, pane: &PaneId, lines: u32) -> Result<String, TerminalError> {
        if !self.session_exists(&pane.session).await {
            return Err(TerminalError::SessionNotFound(pane.session.clone()));
        }
        let target = pane.target();
        let start = format!("-{lines}");
        let out = self
            .run(&["capture-pane", "-t", &target, "-p", "-S", &start])
            .await?;
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    async fn notify(&self, text: &str) -> Result<(), TerminalError> {
        // Best-effort desktop notification for the paneless owner case.
        // Falls back to a warn-level log line when no notifier is present.
        let result = Command::new("notify-send")
            .arg("agentmesh")
            .arg(text)
            .output()
            .await;
        match result {
            Ok(out) if out.status.success() => Ok(()),
            _ => {
                warn!(text, "no desktop notifier available, dropping notification");
                Ok(())
            }
        }
    }
}
