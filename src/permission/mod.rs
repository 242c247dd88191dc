//! Single chokepoint between the tool façade and every stateful operation.
//!
//! A capability table maps `(role, tool_name)` to a rule. Handlers never
//! duplicate a role check themselves; they call [`PermissionGuard::check`]
//! before any side effect.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::error::{AgentMeshError, Result};
use crate::registry::AgentRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Allowed,
    Denied,
    SelfOnly,
}

static TABLE: Lazy<HashMap<(AgentRole, &'static str), Capability>> = Lazy::new(|| {
    use AgentRole::*;
    use Capability::*;
    let mut m = HashMap::new();

    for tool in [
        "create_agent",
        "create_workers_batch",
        "terminate_agent",
        "send_task",
        "broadcast_command",
        "merge_completed_tasks",
        "cleanup_workspace",
        "check_all_tasks_completed",
        "cleanup_on_completion",
    ] {
        m.insert((Owner, tool), Allowed);
        m.insert((Admin, tool), Denied);
        m.insert((Worker, tool), Denied);
    }

    for tool in [
        "list_agents",
        "get_agent_status",
        "list_tasks",
        "get_task",
        "get_dashboard",
        "get_dashboard_summary",
        "list_worktrees",
        "get_worktree_status",
        "get_unread_count",
        "healthcheck_all",
        "get_unhealthy_agents",
    ] {
        m.insert((Owner, tool), Allowed);
        m.insert((Admin, tool), Allowed);
        m.insert((Worker, tool), Allowed);
    }

    for tool in [
        "create_task",
        "assign_task_to_agent",
        "update_task_status",
        "reopen_task",
        "remove_task",
        "create_worktree",
        "remove_worktree",
        "assign_worktree",
        "attempt_recovery",
        "full_recovery",
        "monitor_and_recover_workers",
    ] {
        m.insert((Owner, tool), Allowed);
        m.insert((Admin, tool), Allowed);
        m.insert((Worker, tool), Denied);
    }

    // A worker reports against its own current task; there's no separate
    // target id to check, so these are plainly allowed rather than self_only.
    for tool in ["report_task_progress", "report_task_completion"] {
        m.insert((Owner, tool), Allowed);
        m.insert((Admin, tool), Allowed);
        m.insert((Worker, tool), Allowed);
    }

    for tool in ["send_command", "get_output", "healthcheck_agent"] {
        m.insert((Owner, tool), Allowed);
        m.insert((Admin, tool), Allowed);
        m.insert((Worker, tool), SelfOnly);
    }

    for tool in ["send_message", "read_messages", "register_agent_to_ipc"] {
        m.insert((Owner, tool), Allowed);
        m.insert((Admin, tool), Allowed);
        m.insert((Worker, tool), SelfOnly);
    }

    m.insert((Owner, "unlock_owner_wait"), Allowed);
    m.insert((Admin, "unlock_owner_wait"), Denied);
    m.insert((Worker, "unlock_owner_wait"), Denied);

    m
});

/// Stateless lookup over the static capability table.
pub struct PermissionGuard;

impl PermissionGuard {
    /// `caller_agent_id` and `target_agent_id` are compared only for
    /// `SelfOnly` rules; pass the same value for tools with no separate
    /// target (the guard just needs to know the caller matches itself).
    pub fn check(
        role: AgentRole,
        tool_name: &str,
        caller_agent_id: &str,
        target_agent_id: &str,
    ) -> Result<()> {
        match TABLE.get(&(role, tool_name)) {
            Some(Capability::Allowed) => Ok(()),
            Some(Capability::SelfOnly) if caller_agent_id == target_agent_id => Ok(()),
            Some(Capability::SelfOnly) => Err(AgentMeshError::permission_denied(format!(
                "{tool_name} is self_only for role {role:?}; caller {caller_agent_id} != target {target_agent_id}"
            ))),
            Some(Capability::Denied) | None => Err(AgentMeshError::permission_denied(format!(
                "role {role:?} may not call {tool_name}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_may_create_agents() {
        assert!(PermissionGuard::check(AgentRole::Owner, "create_agent", "owner", "owner").is_ok());
    }

    #[test]
    fn worker_cannot_create_agents() {
        assert!(PermissionGuard::check(AgentRole::Worker, "create_agent", "w1", "w1").is_err());
    }

    #[test]
    fn worker_can_read_own_mailbox_but_not_anothers() {
        assert!(PermissionGuard::check(AgentRole::Worker, "read_messages", "w1", "w1").is_ok());
        assert!(PermissionGuard::check(AgentRole::Worker, "read_messages", "w1", "admin").is_err());
    }

    #[test]
    fn unknown_tool_is_denied() {
        assert!(PermissionGuard::check(AgentRole::Owner, "not_a_real_tool", "owner", "owner").is_err());
    }
}
