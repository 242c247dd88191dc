//! In-memory [`TerminalAdapter`] for deterministic tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::adapter::{PaneId, SplitDirection, TerminalAdapter, TerminalError};

/// One recorded interaction with a [`FakeTerminalAdapter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalCall {
    CreateSession { session: String, cwd: String },
    KillSession { session: String },
    SplitPane { target: PaneId, cwd: String },
    SendKeys { pane: PaneId, line: String },
    Notify { text: String },
}

struct FakeState {
    sessions: HashMap<String, Vec<PaneId>>,
    sent_keys: HashMap<PaneId, Vec<String>>,
    calls: Vec<TerminalCall>,
    next_pane_index: u32,
}

/// A terminal adapter backed by in-memory state, used by unit tests for
/// every component that depends on [`TerminalAdapter`] without spawning a
/// real multiplexer.
pub struct FakeTerminalAdapter {
    state: Mutex<FakeState>,
}

impl FakeTerminalAdapter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                sessions: HashMap::new(),
                sent_keys: HashMap::new(),
                calls: Vec::new(),
                next_pane_index: 1,
            }),
        }
    }

    pub fn calls(&self) -> Vec<TerminalCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn keys_sent_to(&self, pane: &PaneId) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .sent_keys
            .get(pane)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for FakeTerminalAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TerminalAdapter for FakeTerminalAdapter {
    async fn create_session(&self, session: &str, cwd: &str) -> Result<PaneId, TerminalError> {
        let mut state = self.state.lock().unwrap();
        if state.sessions.contains_key(session) {
            return Err(TerminalError::CommandFailed(format!(
                "session '{session}' already exists"
            )));
        }
        let pane = PaneId::new(session, 0, 0);
        state.sessions.insert(session.to_string(), vec![pane.clone()]);
        state.calls.push(TerminalCall::CreateSession {
            session: session.to_string(),
            cwd: cwd.to_string(),
        });
        Ok(pane)
    }

    async fn kill_session(&self, session: &str) -> Result<(), TerminalError> {
        let mut state = self.state.lock().unwrap();
        if state.sessions.remove(session).is_none() {
            return Err(TerminalError::SessionNotFound(session.to_string()));
        }
        state.calls.push(TerminalCall::KillSession {
            session: session.to_string(),
        });
        Ok(())
    }

    async fn split_pane(
        &self,
        target: &PaneId,
        _direction: SplitDirection,
        cwd: &str,
    ) -> Result<PaneId, TerminalError> {
        let mut state = self.state.lock().unwrap();
        if !state.sessions.contains_key(&target.session) {
            return Err(TerminalError::SessionNotFound(target.session.clone()));
        }
        let index = state.next_pane_index;
        state.next_pane_index += 1;
        let new_pane = PaneId::new(target.session.clone(), target.window, index);
        state
            .sessions
            .get_mut(&target.session)
            .unwrap()
            .push(new_pane.clone());
        state.calls.push(TerminalCall::SplitPane {
            target: target.clone(),
            cwd: cwd.to_string(),
        });
        Ok(new_pane)
    }

    async fn send_keys(&self, pane: &PaneId, line: &str) -> Result<(), TerminalError> {
        let mut state = self.state.lock().unwrap();
        if !state.sessions.contains_key(&pane.session) {
            return Err(TerminalError::SessionNotFound(pane.session.clone()));
        }
        state
            .sent_keys
            .entry(pane.clone())
            .or_default()
            .push(line.to_string());
        state.calls.push(TerminalCall::SendKeys {
            pane: pane.clone(),
            line: line.to_string(),
        });
        Ok(())
    }

    async fn session_alive(&self, session: &str) -> bool {
        self.state.lock().unwrap().sessions.contains_key(session)
    }

    async fn pane_tail(&self, pane: &PaneId, _lines: u32) -> Result<String, TerminalError> {
        let state = self.state.lock().unwrap();
        if !state.sessions.contains_key(&pane.session) {
            return Err(TerminalError::SessionNotFound(pane.session.clone()));
        }
        Ok(state
            .sent_keys
            .get(pane)
            .map(|lines| lines.join("\n"))
            .unwrap_or_default())
    }

    async fn notify(&self, text: &str) -> Result<(), TerminalError> {
        self.state.lock().unwrap().calls.push(TerminalCall::Notify {
            text: text.to_string(),
        });
        Ok(())
    }
}
