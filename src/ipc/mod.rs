//! File-backed inter-agent mailbox, paired with a pane notification so a
//! recipient doesn't have to poll. One file per message, one directory per
//! recipient: `{session_dir}/ipc/{receiver_id}/{stamp}_{id8}.md`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use agentmesh_term::{PaneId, TerminalAdapter};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{AgentMeshError, Result};

static UNSAFE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[<>:"/\\|?*]"#).unwrap());

/// Collapse a receiver id down to a filesystem-safe directory segment.
pub fn sanitize_segment(raw: &str) -> String {
    let replaced = UNSAFE_CHARS.replace_all(raw, "_");
    let trimmed = replaced.trim_matches(|c: char| c.is_whitespace() || c == '.');
    if trimmed.is_empty() {
        "entry".to_string()
    } else {
        trimmed.to_string()
    }
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub message_type: MessageType,
    #[serde(default)]
    pub priority: Priority,
    pub subject: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// task id carried by task_* message types, used by dashboard auto-sync
    pub task_id: Option<String>,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl Message {
    fn file_contents(&self) -> Result<String> {
        let front_matter = serde_yaml::to_string(self)?;
        let body = self.subject.clone().unwrap_or_default();
        Ok(format!("---\n{front_matter}---\n\n{body}\n\n{}\n", self.content))
    }

    fn from_file_contents(contents: &str) -> Result<Self> {
        let front_matter = contents
            .strip_prefix("---\n")
            .and_then(|rest| rest.split_once("\n---\n"))
            .map(|(fm, _)| fm)
            .ok_or_else(|| AgentMeshError::validation("message file missing YAML front matter"))?;
        Ok(serde_yaml::from_str(front_matter)?)
    }

    fn file_name(&self) -> String {
        format!(
            "{}_{}.md",
            self.created_at.format("%Y%m%d_%H%M%S_%6f"),
            &self.id[..8.min(self.id.len())]
        )
    }
}

static CONSECUTIVE_EMPTY_READS: AtomicU32 = AtomicU32::new(0);
const POLLING_BLOCKED_THRESHOLD: u32 = 3;

/// File-backed mailbox system for one session.
pub struct Mailbox {
    ipc_dir: PathBuf,
}

impl Mailbox {
    pub fn new(session_dir: PathBuf) -> Self {
        Self {
            ipc_dir: session_dir.join("ipc"),
        }
    }

    fn receiver_dir(&self, receiver_id: &str) -> PathBuf {
        self.ipc_dir.join(sanitize_segment(receiver_id))
    }

    /// Write one message and best-effort notify the recipient's pane (or
    /// desktop notification if they have none, e.g. a paneless owner).
    pub async fn send_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        message_type: MessageType,
        priority: Priority,
        subject: Option<String>,
        content: String,
        task_id: Option<String>,
        terminal: &dyn TerminalAdapter,
        receiver_pane: Option<&PaneId>,
    ) -> Result<Message> {
        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            message_type,
            priority,
            subject,
            content,
            created_at: Utc::now(),
            read_at: None,
            metadata: serde_json::Map::new(),
            task_id,
        };

        let dir = self.receiver_dir(receiver_id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(message.file_name());
        crate::lock::atomic_write(&path, &message.file_contents()?).await?;

        let notice = format!("[IPC] 新しいメッセージ: {:?} from {sender_id}", message.message_type);
        let notify_result = match receiver_pane {
            Some(pane) => terminal.send_keys(pane, &format!("echo '{notice}'")).await,
            None => terminal.notify(&notice).await,
        };
        if let Err(e) = notify_result {
            warn!(error = %e, receiver_id, "failed to deliver ipc notification");
        }

        Ok(message)
    }

    /// Broadcast to every id in `receivers`. Best-effort: one recipient's
    /// delivery failure never aborts the rest of the batch.
    pub async fn broadcast(
        &self,
        sender_id: &str,
        receivers: &[(String, Option<PaneId>)],
        content: &str,
        terminal: &dyn TerminalAdapter,
    ) -> Vec<Result<Message>> {
        let mut results = Vec::with_capacity(receivers.len());
        for (receiver_id, pane) in receivers {
            let result = self
                .send_message(
                    sender_id,
                    receiver_id,
                    MessageType::Broadcast,
                    Priority::Normal,
                    None,
                    content.to_string(),
                    None,
                    terminal,
                    pane.as_ref(),
                )
                .await;
            results.push(result);
        }
        results
    }

    async fn list_message_paths(&self, receiver_id: &str) -> Result<Vec<PathBuf>> {
        let dir = self.receiver_dir(receiver_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().and_then(|e| e.to_str()) == Some("md") {
                paths.push(entry.path());
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Returns messages in filename (chronological) order.
    pub async fn read_messages(
        &self,
        receiver_id: &str,
        unread_only: bool,
        mark_as_read: bool,
    ) -> Result<Vec<Message>> {
        let paths = self.list_message_paths(receiver_id).await?;
        let mut out = Vec::new();
        for path in paths {
            let content = tokio::fs::read_to_string(&path).await?;
            let mut message = Message::from_file_contents(&content)?;
            if unread_only && message.read_at.is_some() {
                continue;
            }
            if mark_as_read && message.read_at.is_none() {
                message.read_at = Some(Utc::now());
                crate::lock::atomic_write(&path, &message.file_contents()?).await?;
            }
            out.push(message);
        }

        if unread_only {
            if out.is_empty() {
                CONSECUTIVE_EMPTY_READS.fetch_add(1, Ordering::SeqCst);
            } else {
                CONSECUTIVE_EMPTY_READS.store(0, Ordering::SeqCst);
            }
        }

        Ok(out)
    }

    pub async fn get_unread_count(&self, receiver_id: &str) -> Result<usize> {
        Ok(self.read_messages(receiver_id, true, false).await?.len())
    }

    /// Owner-side polling guard: once `read_messages(unread_only=true)` has
    /// returned nothing for `POLLING_BLOCKED_THRESHOLD` consecutive calls,
    /// further calls short-circuit without touching disk.
    pub fn polling_blocked() -> bool {
        CONSECUTIVE_EMPTY_READS.load(Ordering::SeqCst) > POLLING_BLOCKED_THRESHOLD
    }

    pub fn reset_polling_guard() {
        CONSECUTIVE_EMPTY_READS.store(0, Ordering::SeqCst);
    }
}

pub fn is_within(root: &Path, candidate: &Path) -> bool {
    candidate.starts_with(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentmesh_term::FakeTerminalAdapter;
    use tempfile::TempDir;

    #[tokio::test]
    async fn send_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let mailbox = Mailbox::new(dir.path().to_path_buf());
        let term = FakeTerminalAdapter::new();

        mailbox
            .send_message(
                "admin",
                "worker-1",
                MessageType::TaskAssign,
                Priority::Normal,
                Some("new task".into()),
                "do the thing".into(),
                Some("t1".into()),
                &term,
                None,
            )
            .await
            .unwrap();

        let unread = mailbox.read_messages("worker-1", true, false).await.unwrap();
        assert_eq!(unread.len(), 1);
        assert!(unread[0].read_at.is_none());

        let after_mark = mailbox.read_messages("worker-1", false, true).await.unwrap();
        assert!(after_mark[0].read_at.is_some());

        let still_there = mailbox.read_messages("worker-1", false, false).await.unwrap();
        assert_eq!(still_there.len(), 1);
        assert_eq!(still_there[0].content, "do the thing");
    }

    #[tokio::test]
    async fn path_traversal_receiver_id_is_sanitized() {
        let dir = TempDir::new().unwrap();
        let mailbox = Mailbox::new(dir.path().to_path_buf());
        let term = FakeTerminalAdapter::new();

        mailbox
            .send_message(
                "admin",
                "../../etc",
                MessageType::System,
                Priority::Low,
                None,
                "hi".into(),
                None,
                &term,
                None,
            )
            .await
            .unwrap();

        let safe_dir = mailbox.receiver_dir("../../etc");
        assert!(is_within(&mailbox.ipc_dir, &safe_dir));
        assert!(safe_dir.starts_with(dir.path()));
    }

    #[test]
    fn sanitizes_unsafe_characters() {
        assert_eq!(sanitize_segment("a/b:c"), "a_b_c");
        assert_eq!(sanitize_segment("   "), "entry");
    }
}
