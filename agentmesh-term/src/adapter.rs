use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by a [`TerminalAdapter`] implementation.
#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("terminal multiplexer not found or not installed")]
    BackendNotFound,
    #[error("session '{0}' not found")]
    SessionNotFound(String),
    #[error("pane '{0}' not found")]
    PaneNotFound(String),
    #[error("invalid session name: {0}")]
    InvalidSessionName(String),
    #[error("command failed: {0}")]
    CommandFailed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Direction to split a pane when growing the session grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitDirection {
    Horizontal,
    Vertical,
}

/// Address of a single pane inside a multiplexer session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaneId {
    pub session: String,
    pub window: u32,
    pub pane: u32,
}

impl PaneId {
    pub fn new(session: impl Into<String>, window: u32, pane: u32) -> Self {
        Self {
            session: session.into(),
            window,
            pane,
        }
    }

    /// Multiplexer target string, e.g. `session:window.pane`.
    pub fn target(&self) -> String {
        format!("{}:{}.{}", self.session, self.window, self.pane)
    }
}

/// Abstraction over a terminal multiplexer, implemented once for the real
/// binary and once for tests.
///
/// Every method that touches an external process is async so a caller never
/// blocks the executor on a subprocess.
#[async_trait]
pub trait TerminalAdapter: Send + Sync {
    /// Create a new session with one pane, rooted at `cwd`.
    async fn create_session(&self, session: &str, cwd: &str) -> Result<PaneId, TerminalError>;

    /// Destroy a session and all its panes.
    async fn kill_session(&self, session: &str) -> Result<(), TerminalError>;

    /// Split `target` in the given direction, returning the new pane.
    async fn split_pane(
        &self,
        target: &PaneId,
        direction: SplitDirection,
        cwd: &str,
    ) -> Result<PaneId, TerminalError>;

    /// Send a single line of input to a pane, followed by Enter.
    async fn send_keys(&self, pane: &PaneId, line: &str) -> Result<(), TerminalError>;

    /// Whether the pane's session is still alive.
    async fn session_alive(&self, session: &str) -> bool;

    /// Capture the last `lines` of a pane's scrollback.
    async fn pane_tail(&self, pane: &PaneId, lines: u32) -> Result<String, TerminalError>;

    /// Best-effort desktop notification for panes that have no owning
    /// terminal pane (the human owner running outside the multiplexer).
    async fn notify(&self, text: &str) -> Result<(), TerminalError>;
}
