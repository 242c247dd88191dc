//! Tool façade: one request, one response, permission-checked before any
//! side effect.
//!
//! Each tool is a row in a static descriptor table rather than a
//! hand-registered handler tree — the table is also the source the
//! permission guard consults, so there is exactly one place that maps a
//! tool name to the role it requires.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use agentmesh_term::{PaneId, TerminalAdapter};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::RuntimeConfig;
use crate::dashboard::{AgentSummary, DashboardStore, SyncOutcome, TaskStatus};
use crate::dispatcher::Dispatcher;
use crate::error::{AgentMeshError, Result};
use crate::healthcheck::HealthcheckEngine;
use crate::ipc::{Mailbox, MessageType, Priority};
use crate::permission::PermissionGuard;
use crate::registry::{Agent, AgentRegistry, AgentRole, AgentStatus};
use crate::workspace::WorkspaceProvisioner;

/// One incoming tool invocation, exactly as it arrives over the transport.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub caller_agent_id: Option<String>,
    #[serde(default)]
    pub args: Value,
}

/// Always has the same shape on the wire: a success flag, a domain
/// payload, and an optional stable error code.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResponse {
    pub success: bool,
    pub data: Value,
    pub error: Option<String>,
    pub error_code: Option<&'static str>,
}

impl ToolResponse {
    fn ok(data: Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
            error_code: None,
        }
    }

    fn err(e: &AgentMeshError) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(e.to_string()),
            error_code: Some(e.error_code()),
        }
    }

    /// Built directly by a transport (e.g. the stdio CLI loop) when a
    /// request couldn't even be parsed into a [`ToolCall`].
    pub fn malformed(detail: &str) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(format!("malformed request: {detail}")),
            error_code: Some("Validation"),
        }
    }
}

/// Shared state every tool handler needs. Built once per process and
/// reused across calls; subsystems that take a fresh lock per operation
/// (dashboard, registry) are safe to share this way.
pub struct ToolContext {
    pub project_root: PathBuf,
    pub session_id: String,
    pub runtime: RuntimeConfig,
    pub registry: AgentRegistry,
    pub dashboard: DashboardStore,
    pub mailbox: Mailbox,
    pub terminal: Arc<dyn TerminalAdapter>,
}

impl ToolContext {
    fn session_dir(&self) -> PathBuf {
        self.runtime.session_dir(&self.project_root, &self.session_id)
    }

    fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher::new(self.session_dir(), &self.registry, self.terminal.as_ref())
    }

    fn provisioner(&self) -> WorkspaceProvisioner<'_> {
        WorkspaceProvisioner::new(self.project_root.clone(), &self.runtime, self.terminal.as_ref())
    }

    fn healthcheck(&self) -> HealthcheckEngine<'_> {
        HealthcheckEngine::new(&self.registry, &self.dashboard, self.terminal.as_ref())
    }

    async fn agent_pane(&self, agent_id: &str) -> Option<PaneId> {
        self.registry
            .lookup(agent_id)
            .await
            .ok()
            .map(|a| PaneId::new(a.session_name, a.window_index, a.pane_index))
    }

    /// The role backing `caller_agent_id`, used by the permission guard.
    /// Tools that run before any agent exists pass no caller and skip the
    /// lookup entirely (the descriptor table marks them as such by having
    /// no `Owner`-only/`self_only` rule that needs a caller role).
    async fn caller_role(&self, caller_agent_id: &str) -> Result<AgentRole> {
        Ok(self.registry.lookup(caller_agent_id).await?.role)
    }
}

/// Route one call through the permission guard and into its handler.
pub async fn dispatch(ctx: &ToolContext, call: ToolCall) -> ToolResponse {
    match handle(ctx, &call).await {
        Ok(data) => ToolResponse::ok(data),
        Err(e) => ToolResponse::err(&e),
    }
}

async fn guard(ctx: &ToolContext, call: &ToolCall, target_agent_id: &str) -> Result<()> {
    let caller = call
        .caller_agent_id
        .as_deref()
        .ok_or_else(|| AgentMeshError::validation(format!("{} requires caller_agent_id", call.tool)))?;
    let role = ctx.caller_role(caller).await?;
    PermissionGuard::check(role, &call.tool, caller, target_agent_id)
}

fn arg_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| AgentMeshError::validation(format!("missing or non-string arg '{key}'")))
}

fn arg_str_opt<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

fn arg_u64(args: &Value, key: &str, default: u64) -> u64 {
    args.get(key).and_then(Value::as_u64).unwrap_or(default)
}

fn arg_bool_opt(args: &Value, key: &str) -> Option<bool> {
    args.get(key).and_then(Value::as_bool)
}

async fn handle(ctx: &ToolContext, call: &ToolCall) -> Result<Value> {
    let args = &call.args;

    if !matches!(call.tool.as_str(), "read_messages" | "get_unread_count" | "unlock_owner_wait") {
        if let Some(caller_id) = call.caller_agent_id.as_deref() {
            if let Ok(caller_agent) = ctx.registry.lookup(caller_id).await {
                if caller_agent.role == AgentRole::Owner && ctx.registry.owner_wait_active().await? {
                    return Err(AgentMeshError::OwnerWaitActive);
                }
            }
        }
    }

    match call.tool.as_str() {
        "init_tmux_workspace" => {
            let worker_count = arg_u64(args, "worker_count", 2) as u32;
            let enable_git = arg_bool_opt(args, "enable_git");
            let prefix = arg_str_opt(args, "mcp_tool_prefix").unwrap_or("agentmesh");
            let handle = ctx
                .provisioner()
                .init_tmux_workspace(&ctx.session_id, &ctx.runtime, enable_git, worker_count, prefix)
                .await?;
            Ok(json!({ "session_dir": handle.session_dir, "panes": handle.panes.len(), "enable_git": handle.enable_git }))
        }

        "create_agent" => {
            let role_str = arg_str(args, "role")?;
            let role = match role_str {
                "owner" => AgentRole::Owner,
                "admin" => AgentRole::Admin,
                "worker" => AgentRole::Worker,
                other => return Err(AgentMeshError::validation(format!("unknown role '{other}'"))),
            };
            if role != AgentRole::Owner {
                guard(ctx, call, "").await?;
            }
            let agent_id = arg_str_opt(args, "agent_id")
                .map(str::to_string)
                .unwrap_or_else(|| format!("{role_str}-{}", uuid::Uuid::new_v4()));
            let worker_slot = if role == AgentRole::Worker {
                Some(ctx.registry.resolve_worker_slot(ctx.runtime.max_workers).await?)
            } else {
                None
            };
            let pane_index = worker_slot.unwrap_or(0);
            // The owner has no pane of its own (notifications reach it via
            // `TerminalAdapter::notify`, not send_keys); park it on a
            // reserved window so it never collides with the admin's pane 0.
            let window_index = if role == AgentRole::Owner { u32::MAX } else { 0 };
            let agent = Agent {
                id: agent_id.clone(),
                role,
                status: AgentStatus::Idle,
                session_name: ctx.session_id.clone(),
                window_index,
                pane_index,
                working_dir: ctx.project_root.clone(),
                worktree_path: None,
                branch: None,
                ai_cli: ctx.runtime.resolve_worker_cli(pane_index),
                worker_slot,
                current_task_id: None,
                last_activity: chrono::Utc::now(),
            };
            ctx.registry.register(agent.clone()).await?;
            ctx.dashboard
                .upsert_agent_summary(AgentSummary {
                    id: agent.id.clone(),
                    role: format!("{role:?}").to_lowercase(),
                    status: "idle".into(),
                    current_task_id: None,
                    worktree: None,
                })
                .await?;
            Ok(json!({ "agent_id": agent_id }))
        }

        "terminate_agent" => {
            let agent_id = arg_str(args, "agent_id")?;
            guard(ctx, call, agent_id).await?;
            ctx.registry.terminate(agent_id).await?;
            Ok(json!({ "agent_id": agent_id }))
        }

        "list_agents" => {
            guard(ctx, call, "").await?;
            let agents = ctx.registry.list().await?;
            Ok(json!(agents.iter().map(agent_view).collect::<Vec<_>>()))
        }

        "get_agent_status" => {
            let agent_id = arg_str(args, "agent_id")?;
            guard(ctx, call, "").await?;
            let agent = ctx.registry.lookup(agent_id).await?;
            Ok(agent_view(&agent))
        }

        "send_task" => {
            let agent_id = arg_str(args, "agent_id")?;
            guard(ctx, call, agent_id).await?;
            let content = arg_str(args, "content")?;
            let session_id = arg_str_opt(args, "session_id").unwrap_or(&ctx.session_id);
            ctx.dispatcher().send_task(agent_id, content, session_id, &ctx.runtime).await?;
            if let Some(caller_id) = call.caller_agent_id.as_deref() {
                if ctx.caller_role(caller_id).await.ok() == Some(AgentRole::Owner) {
                    ctx.registry.set_owner_wait(true).await?;
                }
            }
            Ok(json!({ "agent_id": agent_id }))
        }

        "send_command" => {
            let agent_id = arg_str(args, "agent_id")?;
            guard(ctx, call, agent_id).await?;
            let command = arg_str(args, "command")?;
            let pane = ctx
                .agent_pane(agent_id)
                .await
                .ok_or_else(|| AgentMeshError::not_found("agent", agent_id))?;
            ctx.terminal.send_keys(&pane, command).await?;
            Ok(json!({ "agent_id": agent_id }))
        }

        "get_output" => {
            let agent_id = arg_str(args, "agent_id")?;
            guard(ctx, call, agent_id).await?;
            let lines = arg_u64(args, "lines", 100) as u32;
            let pane = ctx
                .agent_pane(agent_id)
                .await
                .ok_or_else(|| AgentMeshError::not_found("agent", agent_id))?;
            let output = ctx.terminal.pane_tail(&pane, lines).await?;
            Ok(json!({ "output": output }))
        }

        "broadcast_command" => {
            guard(ctx, call, "").await?;
            let command = arg_str(args, "command")?;
            let sender = call.caller_agent_id.as_deref().unwrap_or("owner");
            let mut receivers = Vec::new();
            for agent in ctx.registry.list().await? {
                if agent.status != AgentStatus::Terminated {
                    receivers.push((agent.id.clone(), ctx.agent_pane(&agent.id).await));
                }
            }
            let results = ctx.mailbox.broadcast(sender, &receivers, command, ctx.terminal.as_ref()).await;
            Ok(json!({ "sent": results.iter().filter(|r| r.is_ok()).count() }))
        }

        "create_task" => {
            guard(ctx, call, "").await?;
            let title = arg_str(args, "title")?;
            let description = arg_str_opt(args, "description").unwrap_or("");
            let mut metadata: HashMap<String, Value> = args
                .get("metadata")
                .and_then(Value::as_object)
                .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default();
            metadata.entry("output_dir".to_string()).or_insert_with(|| {
                json!(ctx.session_dir().join("reports").to_string_lossy().to_string())
            });
            let task = ctx.dashboard.create_task(title, description, metadata).await?;
            Ok(json!({ "task_id": task.id }))
        }

        "assign_task_to_agent" => {
            guard(ctx, call, "").await?;
            let task_id = arg_str(args, "task_id")?;
            let agent_id = arg_str(args, "agent_id")?;
            ctx.dashboard.assign_task_to_agent(task_id, agent_id).await?;
            ctx.registry
                .update(agent_id, |a| a.current_task_id = Some(task_id.to_string()))
                .await?;
            Ok(json!({ "task_id": task_id, "agent_id": agent_id }))
        }

        "update_task_status" => {
            guard(ctx, call, "").await?;
            let task_id = arg_str(args, "task_id")?;
            let status = parse_status(arg_str(args, "status")?)?;
            let progress = args.get("progress").and_then(Value::as_u64).map(|p| p as u8);
            let error_message = arg_str_opt(args, "error_message").map(str::to_string);
            let task = ctx.dashboard.update_task_status(task_id, status, progress, error_message).await?;
            Ok(json!({ "task_id": task.id, "status": task.status.as_str() }))
        }

        "reopen_task" => {
            guard(ctx, call, "").await?;
            let task_id = arg_str(args, "task_id")?;
            let task = ctx.dashboard.reopen_task(task_id).await?;
            Ok(json!({ "task_id": task.id, "status": task.status.as_str() }))
        }

        "report_task_progress" => {
            let caller = call.caller_agent_id.clone().unwrap_or_default();
            guard(ctx, call, &caller).await?;
            let task_id = arg_str(args, "task_id")?;
            let progress = arg_u64(args, "progress", 0) as u8;
            let message = arg_str_opt(args, "message").unwrap_or("");
            ctx.dashboard.report_task_progress(task_id, progress, message, &caller).await?;
            Ok(json!({ "task_id": task_id }))
        }

        "report_task_completion" => {
            let caller = call.caller_agent_id.clone().unwrap_or_default();
            guard(ctx, call, &caller).await?;
            let task_id = arg_str(args, "task_id")?;
            let status = parse_status(arg_str_opt(args, "status").unwrap_or("completed"))?;
            let message = arg_str_opt(args, "message").unwrap_or("");
            let task = ctx.dashboard.update_task_status(task_id, status, Some(100), None).await?;

            let admin = ctx
                .registry
                .list()
                .await?
                .into_iter()
                .find(|a| a.role == AgentRole::Admin)
                .map(|a| a.id);
            if let Some(admin_id) = admin {
                let pane = ctx.agent_pane(&admin_id).await;
                let _ = ctx
                    .mailbox
                    .send_message(
                        &caller,
                        &admin_id,
                        MessageType::TaskComplete,
                        Priority::Normal,
                        Some(format!("task {task_id} {status:?}")),
                        message.to_string(),
                        Some(task_id.to_string()),
                        ctx.terminal.as_ref(),
                        pane.as_ref(),
                    )
                    .await;
            }
            if task.status.is_terminal() && !caller.is_empty() {
                ctx.registry
                    .update(&caller, |a| {
                        a.current_task_id = None;
                        a.status = AgentStatus::Idle;
                    })
                    .await?;
            }
            Ok(json!({ "task_id": task.id, "status": task.status.as_str() }))
        }

        "remove_task" => {
            guard(ctx, call, "").await?;
            let task_id = arg_str(args, "task_id")?;
            ctx.dashboard.remove_task(task_id).await?;
            Ok(json!({ "task_id": task_id }))
        }

        "list_tasks" => {
            guard(ctx, call, "").await?;
            let tasks = ctx.dashboard.list_tasks().await?;
            Ok(json!(tasks.iter().map(|t| json!({ "id": t.id, "title": t.title, "status": t.status.as_str() })).collect::<Vec<_>>()))
        }

        "get_task" => {
            guard(ctx, call, "").await?;
            let task_id = arg_str(args, "task_id")?;
            let task = ctx.dashboard.get_task(task_id).await?;
            Ok(json!({ "id": task.id, "title": task.title, "status": task.status.as_str(), "progress": task.progress }))
        }

        "get_dashboard" | "get_dashboard_summary" => {
            guard(ctx, call, "").await?;
            let dashboard = ctx.dashboard.get_dashboard().await?;
            Ok(json!({
                "workspace_id": dashboard.workspace_id,
                "tasks": dashboard.tasks.len(),
                "agents": dashboard.agents.len(),
                "process_crash_count": dashboard.process_crash_count,
                "process_recovery_count": dashboard.process_recovery_count,
            }))
        }

        "create_worktree" => {
            guard(ctx, call, "").await?;
            let agent_id = arg_str(args, "agent_id")?;
            let branch = arg_str(args, "branch")?;
            let base_branch = arg_str_opt(args, "base_branch");
            let entry = ctx
                .provisioner()
                .create_worktree(&ctx.session_id, agent_id, branch, base_branch)
                .await?;
            if let Ok(agent) = ctx.registry.lookup(agent_id).await {
                if let Some(task_id) = &agent.current_task_id {
                    ctx.dashboard.set_task_branch(task_id, branch).await?;
                }
            }
            Ok(json!({ "path": entry.path, "branch": entry.branch }))
        }

        "list_worktrees" => {
            guard(ctx, call, "").await?;
            let worktrees = ctx.provisioner().list_worktrees().await?;
            Ok(json!(worktrees))
        }

        "get_worktree_status" => {
            guard(ctx, call, "").await?;
            let worktrees = ctx.provisioner().list_worktrees().await?;
            let agent_id = arg_str(args, "agent_id")?;
            let entry = worktrees.into_iter().find(|w| w.agent_id == agent_id);
            Ok(json!(entry))
        }

        "remove_worktree" => {
            guard(ctx, call, "").await?;
            let path = PathBuf::from(arg_str(args, "path")?);
            let force = arg_bool_opt(args, "force").unwrap_or(false);
            ctx.provisioner().remove_worktree(&path, force).await?;
            Ok(json!({ "removed": true }))
        }

        "merge_completed_tasks" => {
            guard(ctx, call, "").await?;
            let base_branch = arg_str(args, "base_branch")?;
            let strategy = arg_str_opt(args, "strategy").unwrap_or("merge");
            let tasks = ctx.dashboard.list_tasks().await?;
            let branches: Vec<String> = tasks
                .into_iter()
                .filter(|t| t.status == TaskStatus::Completed)
                .filter_map(|t| t.branch)
                .collect();
            let outcome = ctx.provisioner().merge_completed_tasks(base_branch, strategy, &branches).await?;
            Ok(serde_json::to_value(outcome)?)
        }

        "cleanup_workspace" => {
            guard(ctx, call, "").await?;
            let remove_worktrees = arg_bool_opt(args, "remove_worktrees").unwrap_or(false);
            ctx.provisioner().cleanup_workspace(&ctx.session_id, remove_worktrees).await?;
            Ok(json!({ "cleaned": true }))
        }

        "check_all_tasks_completed" => {
            guard(ctx, call, "").await?;
            let tasks = ctx.dashboard.list_tasks().await?;
            Ok(json!({ "all_completed": !tasks.is_empty() && tasks.iter().all(|t| t.status == TaskStatus::Completed) }))
        }

        "cleanup_on_completion" => {
            guard(ctx, call, "").await?;
            let tasks = ctx.dashboard.list_tasks().await?;
            let all_completed = !tasks.is_empty() && tasks.iter().all(|t| t.status == TaskStatus::Completed);
            if all_completed {
                let remove_worktrees = arg_bool_opt(args, "remove_worktrees").unwrap_or(false);
                ctx.provisioner().cleanup_workspace(&ctx.session_id, remove_worktrees).await?;
            }
            Ok(json!({ "all_completed": all_completed, "cleaned": all_completed }))
        }

        "send_message" => {
            let caller = call.caller_agent_id.clone().unwrap_or_default();
            let receiver_id = arg_str(args, "receiver_id")?;
            guard(ctx, call, &caller).await?;
            let content = arg_str(args, "content")?;
            let pane = ctx.agent_pane(receiver_id).await;
            let message = ctx
                .mailbox
                .send_message(
                    &caller,
                    receiver_id,
                    MessageType::Request,
                    Priority::Normal,
                    arg_str_opt(args, "subject").map(str::to_string),
                    content.to_string(),
                    arg_str_opt(args, "task_id").map(str::to_string),
                    ctx.terminal.as_ref(),
                    pane.as_ref(),
                )
                .await?;
            Ok(json!({ "message_id": message.id }))
        }

        "read_messages" => {
            let caller = call.caller_agent_id.clone().unwrap_or_default();
            let target = arg_str_opt(args, "agent_id").unwrap_or(&caller);
            guard(ctx, call, target).await?;
            let unread_only = arg_bool_opt(args, "unread_only").unwrap_or(true);
            let caller_role = ctx.caller_role(&caller).await.ok();

            if caller_role == Some(AgentRole::Owner) && unread_only && Mailbox::polling_blocked() {
                return Err(AgentMeshError::PollingBlocked);
            }

            let mark_as_read = arg_bool_opt(args, "mark_as_read").unwrap_or(true);
            let messages = ctx.mailbox.read_messages(target, unread_only, mark_as_read).await?;

            // A reply from the admin clears the owner's wait-lock; the owner
            // doesn't have to call unlock_owner_wait itself.
            if caller_role == Some(AgentRole::Owner) && ctx.registry.owner_wait_active().await.unwrap_or(false) {
                let mut admin_replied = false;
                for message in &messages {
                    if ctx.caller_role(&message.sender_id).await.ok() == Some(AgentRole::Admin) {
                        admin_replied = true;
                        break;
                    }
                }
                if admin_replied {
                    ctx.registry.set_owner_wait(false).await?;
                    Mailbox::reset_polling_guard();
                }
            }

            // The admin's mailbox doubles as a task-status feed: progress,
            // completion, and failure reports project onto the dashboard.
            let mut updates = Vec::new();
            if caller_role == Some(AgentRole::Admin) {
                for message in &messages {
                    let Some(task_id) = &message.task_id else { continue };
                    let status = match message.message_type {
                        MessageType::TaskProgress => Some(TaskStatus::InProgress),
                        MessageType::TaskComplete => Some(TaskStatus::Completed),
                        MessageType::TaskFailed => Some(TaskStatus::Failed),
                        _ => None,
                    };
                    if let Some(status) = status {
                        let reason = message.subject.clone().unwrap_or_else(|| message.content.clone());
                        updates.push((task_id.clone(), status, None, reason));
                    }
                }
            }
            let outcome = if updates.is_empty() {
                SyncOutcome::default()
            } else {
                ctx.dashboard.sync_from_messages(updates).await?
            };

            Ok(json!({
                "messages": messages.len(),
                "dashboard_updates_applied": outcome.applied,
                "dashboard_updates_skipped": outcome
                    .skipped
                    .iter()
                    .map(|(task_id, reason)| json!({ "task_id": task_id, "reason": reason }))
                    .collect::<Vec<_>>(),
            }))
        }

        "get_unread_count" => {
            let caller = call.caller_agent_id.clone().unwrap_or_default();
            let target = arg_str_opt(args, "agent_id").unwrap_or(&caller);
            guard(ctx, call, target).await?;
            let count = ctx.mailbox.get_unread_count(target).await?;
            Ok(json!({ "unread": count }))
        }

        "register_agent_to_ipc" => {
            let agent_id = arg_str(args, "agent_id")?;
            guard(ctx, call, agent_id).await?;
            Ok(json!({ "agent_id": agent_id }))
        }

        "unlock_owner_wait" => {
            guard(ctx, call, "").await?;
            ctx.registry.set_owner_wait(false).await?;
            Mailbox::reset_polling_guard();
            Ok(json!({ "owner_wait_active": false }))
        }

        "healthcheck_agent" => {
            let agent_id = arg_str(args, "agent_id")?;
            guard(ctx, call, agent_id).await?;
            let agent = ctx.registry.lookup(agent_id).await?;
            let verdict = crate::healthcheck::check_agent(
                &agent,
                ctx.terminal.as_ref(),
                &Default::default(),
                false,
            )
            .await;
            Ok(json!({ "healthy": matches!(verdict, crate::healthcheck::HealthVerdict::Healthy) }))
        }

        "healthcheck_all" | "monitor_and_recover_workers" => {
            guard(ctx, call, "").await?;
            let idle = ctx.healthcheck().run_pass().await?;
            Ok(json!({ "all_idle": idle }))
        }

        "get_unhealthy_agents" => {
            guard(ctx, call, "").await?;
            let unhealthy = ctx.healthcheck().unhealthy_agents().await?;
            Ok(json!(unhealthy.iter().map(|(a, _)| a.id.clone()).collect::<Vec<_>>()))
        }

        "attempt_recovery" => {
            guard(ctx, call, "").await?;
            let agent_id = arg_str(args, "agent_id")?;
            let agent = ctx.registry.lookup(agent_id).await?;
            let verdict = crate::healthcheck::check_agent(&agent, ctx.terminal.as_ref(), &Default::default(), false).await;
            let recovered = ctx.healthcheck().attempt_recovery(&agent, verdict).await?;
            Ok(json!({ "recovered": recovered }))
        }

        "full_recovery" => {
            guard(ctx, call, "").await?;
            let agent_id = arg_str(args, "agent_id")?;
            let new_agent_id = arg_str_opt(args, "new_agent_id")
                .map(str::to_string)
                .unwrap_or_else(|| format!("{agent_id}-recovered"));
            let agent = ctx.registry.lookup(agent_id).await?;
            let replacement = ctx.healthcheck().full_recovery(&agent, &new_agent_id).await?;
            Ok(json!({ "agent_id": replacement.id }))
        }

        "create_workers_batch" => {
            guard(ctx, call, "").await?;
            let count = arg_u64(args, "count", 1);
            let mut ids = Vec::new();
            for _ in 0..count {
                let slot = ctx.registry.resolve_worker_slot(ctx.runtime.max_workers).await?;
                let agent_id = format!("worker-{}", uuid::Uuid::new_v4());
                let agent = Agent {
                    id: agent_id.clone(),
                    role: AgentRole::Worker,
                    status: AgentStatus::Idle,
                    session_name: ctx.session_id.clone(),
                    window_index: 0,
                    pane_index: slot,
                    working_dir: ctx.project_root.clone(),
                    worktree_path: None,
                    branch: None,
                    ai_cli: ctx.runtime.resolve_worker_cli(slot),
                    worker_slot: Some(slot),
                    current_task_id: None,
                    last_activity: chrono::Utc::now(),
                };
                ctx.registry.register(agent).await?;
                ids.push(agent_id);
            }
            Ok(json!({ "agent_ids": ids }))
        }

        "assign_worktree" => {
            guard(ctx, call, "").await?;
            let agent_id = arg_str(args, "agent_id")?;
            let path = PathBuf::from(arg_str(args, "path")?);
            ctx.registry
                .update(agent_id, |a| a.worktree_path = Some(path.clone()))
                .await?;
            Ok(json!({ "agent_id": agent_id }))
        }

        "initialize_agent" => {
            let agent_id = arg_str(args, "agent_id")?;
            guard(ctx, call, agent_id).await?;
            ctx.registry.update(agent_id, |a| a.status = AgentStatus::Idle).await?;
            Ok(json!({ "agent_id": agent_id }))
        }

        "open_session" => {
            guard(ctx, call, "").await?;
            let session = arg_str(args, "session")?;
            let cwd = arg_str_opt(args, "cwd").unwrap_or(".");
            let pane = ctx.terminal.create_session(session, cwd).await?;
            Ok(json!({ "pane": pane.target() }))
        }

        other => Err(AgentMeshError::validation(format!("unknown tool '{other}'"))),
    }
}

fn parse_status(raw: &str) -> Result<TaskStatus> {
    match raw {
        "pending" => Ok(TaskStatus::Pending),
        "in_progress" => Ok(TaskStatus::InProgress),
        "completed" => Ok(TaskStatus::Completed),
        "failed" => Ok(TaskStatus::Failed),
        "cancelled" => Ok(TaskStatus::Cancelled),
        "blocked" => Ok(TaskStatus::Blocked),
        other => Err(AgentMeshError::validation(format!("unknown task status '{other}'"))),
    }
}

fn agent_view(agent: &Agent) -> Value {
    json!({
        "id": agent.id,
        "role": format!("{:?}", agent.role).to_lowercase(),
        "status": format!("{:?}", agent.status).to_lowercase(),
        "current_task_id": agent.current_task_id,
        "worker_slot": agent.worker_slot,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentmesh_term::FakeTerminalAdapter;
    use tempfile::TempDir;

    async fn context(dir: &TempDir) -> ToolContext {
        let session_dir = dir.path().join(".agentmesh").join("s1");
        let ctx = ToolContext {
            project_root: dir.path().to_path_buf(),
            session_id: "s1".into(),
            runtime: RuntimeConfig::default(),
            registry: AgentRegistry::new(session_dir.clone(), dir.path().join("global"), dir.path().to_path_buf(), "s1".into()),
            dashboard: DashboardStore::new(session_dir.clone()),
            mailbox: Mailbox::new(session_dir.clone()),
            terminal: Arc::new(FakeTerminalAdapter::new()),
        };
        ctx.dashboard.init("s1", dir.path().to_path_buf()).await.unwrap();
        ctx
    }

    #[tokio::test]
    async fn owner_creation_then_admin_requires_no_prior_caller() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;

        let owner_resp = dispatch(
            &ctx,
            ToolCall { tool: "create_agent".into(), caller_agent_id: None, args: json!({ "role": "owner", "agent_id": "owner" }) },
        )
        .await;
        assert!(owner_resp.success, "{:?}", owner_resp.error);

        let admin_resp = dispatch(
            &ctx,
            ToolCall {
                tool: "create_agent".into(),
                caller_agent_id: Some("owner".into()),
                args: json!({ "role": "admin", "agent_id": "admin" }),
            },
        )
        .await;
        assert!(admin_resp.success, "{:?}", admin_resp.error);
    }

    #[tokio::test]
    async fn worker_cannot_create_agents() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;
        ctx.registry
            .register(Agent {
                id: "w1".into(),
                role: AgentRole::Worker,
                status: AgentStatus::Idle,
                session_name: "s1".into(),
                window_index: 0,
                pane_index: 1,
                working_dir: dir.path().to_path_buf(),
                worktree_path: None,
                branch: None,
                ai_cli: "claude".into(),
                worker_slot: Some(1),
                current_task_id: None,
                last_activity: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let resp = dispatch(
            &ctx,
            ToolCall {
                tool: "create_agent".into(),
                caller_agent_id: Some("w1".into()),
                args: json!({ "role": "worker" }),
            },
        )
        .await;
        assert!(!resp.success);
        assert_eq!(resp.error_code, Some("PermissionDenied"));
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;
        let resp = dispatch(&ctx, ToolCall { tool: "not_a_tool".into(), caller_agent_id: None, args: Value::Null }).await;
        assert!(!resp.success);
    }
}
