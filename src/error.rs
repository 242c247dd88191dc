use thiserror::Error;

/// Crate-wide error type for agentmesh.
///
/// Every variant maps to one of the stable `error_code` strings the tool
/// façade puts on the wire; `error_code()` is the single place that mapping
/// lives, so adding a wire-visible error means adding both a variant here and
/// an arm there.
///
/// # Examples
///
/// ```rust
/// use agentmesh::error::AgentMeshError;
///
/// let err = AgentMeshError::NotFound {
///     kind: "task".into(),
///     id: "t-1".into(),
/// };
/// assert_eq!(err.error_code(), "NotFound");
/// ```
#[derive(Error, Debug)]
pub enum AgentMeshError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),

    #[error("configuration error: {message}")]
    Configuration {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: String, id: String },

    #[error("permission denied: {rule}")]
    PermissionDenied { rule: String },

    #[error("invalid transition for task '{task_id}': {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
        allowed: Vec<String>,
    },

    #[error("task '{0}' is in a terminal state and cannot be mutated directly")]
    TerminalStateImmutable(String),

    #[error("owner is wait-locked; only read_messages, get_unread_count and unlock_owner_wait are permitted")]
    OwnerWaitActive,

    #[error("polling blocked after repeated empty reads; wait for a notification")]
    PollingBlocked,

    #[error("timed out waiting {0:?} for a lock on '{1}'")]
    ConcurrencyTimeout(std::time::Duration, String),

    #[error("worker limit reached ({0} workers)")]
    WorkerLimitReached(usize),

    #[error("git integration is disabled for this session")]
    GitDisabled,

    #[error("branch '{0}' not found")]
    BranchNotFound(String),

    #[error("merge conflict on branch '{0}'")]
    MergeConflict(String),

    #[error("recovery exhausted for agent '{agent_id}' on task '{task_id}'")]
    RecoveryExhausted { agent_id: String, task_id: String },

    #[error("terminal adapter error: {0}")]
    Terminal(#[from] agentmesh_term::TerminalError),

    #[error("git operation failed: {message}")]
    Git {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("{message}")]
    Other {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl From<String> for AgentMeshError {
    fn from(message: String) -> Self {
        Self::Other {
            message,
            source: None,
        }
    }
}

impl From<&str> for AgentMeshError {
    fn from(message: &str) -> Self {
        Self::Other {
            message: message.to_string(),
            source: None,
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentMeshError>;

/// Extension trait for attaching a human-readable message to any error.
pub trait ErrorContext<T> {
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AgentMeshError::Other {
            message: f(),
            source: Some(Box::new(e)),
        })
    }
}

/// Severity used to pick the tracing level a caller logs an error at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
}

impl AgentMeshError {
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn permission_denied(rule: impl Into<String>) -> Self {
        Self::PermissionDenied { rule: rule.into() }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            source: None,
        }
    }

    pub fn git(message: impl Into<String>) -> Self {
        Self::Git {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap an `anyhow::Error` from the shell-based git adapter, which has
    /// no typed error of its own.
    pub fn git_source(source: anyhow::Error) -> Self {
        Self::Git {
            message: source.to_string(),
            source: Some(source.into()),
        }
    }

    /// Stable wire identifier, per the tool façade's contract.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Io(_) | Self::SerdeJson(_) | Self::SerdeYaml(_) => "Io",
            Self::Configuration { .. } => "Configuration",
            Self::Validation { .. } => "Validation",
            Self::NotFound { .. } => "NotFound",
            Self::PermissionDenied { .. } => "PermissionDenied",
            Self::InvalidTransition { .. } => "InvalidTransition",
            Self::TerminalStateImmutable(_) => "TerminalStateImmutable",
            Self::OwnerWaitActive => "OwnerWaitActive",
            Self::PollingBlocked => "PollingBlocked",
            Self::ConcurrencyTimeout(..) => "ConcurrencyTimeout",
            Self::WorkerLimitReached(_) => "WorkerLimitReached",
            Self::GitDisabled => "GitDisabled",
            Self::BranchNotFound(_) => "BranchNotFound",
            Self::MergeConflict(_) => "MergeConflict",
            Self::RecoveryExhausted { .. } => "RecoveryExhausted",
            Self::Terminal(_) => "Terminal",
            Self::Git { .. } => "Git",
            Self::Other { .. } => "Other",
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::ConcurrencyTimeout(..) | Self::RecoveryExhausted { .. } => ErrorSeverity::Error,
            Self::PermissionDenied { .. }
            | Self::OwnerWaitActive
            | Self::PollingBlocked
            | Self::InvalidTransition { .. }
            | Self::MergeConflict(_) => ErrorSeverity::Warning,
            _ => ErrorSeverity::Info,
        }
    }

    /// Whether a caller should retry the exact same operation (as opposed to
    /// surfacing the failure).
    pub fn should_retry(&self) -> bool {
        matches!(self, Self::ConcurrencyTimeout(..))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_is_stable_per_variant() {
        assert_eq!(AgentMeshError::not_found("task", "t1").error_code(), "NotFound");
        assert_eq!(AgentMeshError::OwnerWaitActive.error_code(), "OwnerWaitActive");
        assert_eq!(
            AgentMeshError::WorkerLimitReached(4).error_code(),
            "WorkerLimitReached"
        );
    }

    #[test]
    fn concurrency_timeout_should_retry() {
        let err = AgentMeshError::ConcurrencyTimeout(std::time::Duration::from_secs(1), "dashboard".into());
        assert!(err.should_retry());
        assert_eq!(err.severity(), ErrorSeverity::Error);
    }
}
