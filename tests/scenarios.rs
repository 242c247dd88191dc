//! End-to-end scenarios over the tool façade, exercising the owner/admin/
//! worker flows the unit tests in each module don't cover on their own.

use std::sync::Arc;

use agentmesh::config::RuntimeConfig;
use agentmesh::dashboard::DashboardStore;
use agentmesh::ipc::Mailbox;
use agentmesh::registry::AgentRegistry;
use agentmesh::{dispatch, ToolCall, ToolContext};
use agentmesh_term::FakeTerminalAdapter;
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

async fn context(dir: &TempDir) -> ToolContext {
    let session_dir = dir.path().join(".agentmesh").join("s1");
    let ctx = ToolContext {
        project_root: dir.path().to_path_buf(),
        session_id: "s1".into(),
        runtime: RuntimeConfig::default(),
        registry: AgentRegistry::new(
            session_dir.clone(),
            dir.path().join("global"),
            dir.path().to_path_buf(),
            "s1".into(),
        ),
        dashboard: DashboardStore::new(session_dir.clone()),
        mailbox: Mailbox::new(session_dir.clone()),
        terminal: Arc::new(FakeTerminalAdapter::new()),
    };
    ctx.dashboard.init("s1", dir.path().to_path_buf()).await.unwrap();
    ctx
}

async fn create_agent(ctx: &ToolContext, role: &str, agent_id: &str, caller: Option<&str>) {
    let resp = dispatch(
        ctx,
        ToolCall {
            tool: "create_agent".into(),
            caller_agent_id: caller.map(str::to_string),
            args: json!({ "role": role, "agent_id": agent_id }),
        },
    )
    .await;
    assert!(resp.success, "create_agent({agent_id}) failed: {:?}", resp.error);
}

/// S1 — plan dispatch: owner creates admin, sends it a task, and the owner
/// wait-lock comes up so only the three exempt tools remain callable for it.
#[tokio::test]
async fn owner_dispatch_locks_owner_wait() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir).await;

    create_agent(&ctx, "owner", "owner", None).await;
    create_agent(&ctx, "admin", "admin", Some("owner")).await;

    ctx.terminal.create_session("s1", dir.path().to_str().unwrap()).await.unwrap();

    let send = dispatch(
        &ctx,
        ToolCall {
            tool: "send_task".into(),
            caller_agent_id: Some("owner".into()),
            args: json!({ "agent_id": "admin", "content": "build X" }),
        },
    )
    .await;
    assert!(send.success, "{:?}", send.error);
    assert!(ctx.registry.owner_wait_active().await.unwrap());

    let task_file = ctx
        .runtime
        .session_dir(dir.path(), "s1")
        .join("tasks")
        .join("admin.md");
    assert_eq!(tokio::fs::read_to_string(task_file).await.unwrap(), "build X");

    // Any other tool is rejected while the owner is wait-locked...
    let blocked = dispatch(
        &ctx,
        ToolCall {
            tool: "list_agents".into(),
            caller_agent_id: Some("owner".into()),
            args: json!({}),
        },
    )
    .await;
    assert!(!blocked.success);
    assert_eq!(blocked.error_code, Some("OwnerWaitActive"));

    // ...but the three exempt tools still work.
    let unread = dispatch(
        &ctx,
        ToolCall {
            tool: "get_unread_count".into(),
            caller_agent_id: Some("owner".into()),
            args: json!({}),
        },
    )
    .await;
    assert!(unread.success);

    let unlock = dispatch(
        &ctx,
        ToolCall {
            tool: "unlock_owner_wait".into(),
            caller_agent_id: Some("owner".into()),
            args: json!({}),
        },
    )
    .await;
    assert!(unlock.success);
    assert!(!ctx.registry.owner_wait_active().await.unwrap());
}

/// S2 — worker completion: a worker finishes its assigned task, the admin
/// gets notified over IPC, and the dashboard reflects the terminal status.
#[tokio::test]
async fn worker_completion_notifies_admin() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir).await;

    create_agent(&ctx, "owner", "owner", None).await;
    create_agent(&ctx, "admin", "admin", Some("owner")).await;
    create_agent(&ctx, "worker", "w1", Some("owner")).await;

    let create_task = dispatch(
        &ctx,
        ToolCall {
            tool: "create_task".into(),
            caller_agent_id: Some("admin".into()),
            args: json!({ "title": "t", "description": "do the thing" }),
        },
    )
    .await;
    assert!(create_task.success, "{:?}", create_task.error);
    let task_id = create_task.data["task_id"].as_str().unwrap().to_string();

    let assign = dispatch(
        &ctx,
        ToolCall {
            tool: "assign_task_to_agent".into(),
            caller_agent_id: Some("admin".into()),
            args: json!({ "task_id": task_id, "agent_id": "w1" }),
        },
    )
    .await;
    assert!(assign.success, "{:?}", assign.error);

    let start = dispatch(
        &ctx,
        ToolCall {
            tool: "update_task_status".into(),
            caller_agent_id: Some("admin".into()),
            args: json!({ "task_id": task_id, "status": "in_progress" }),
        },
    )
    .await;
    assert!(start.success, "{:?}", start.error);

    let complete = dispatch(
        &ctx,
        ToolCall {
            tool: "report_task_completion".into(),
            caller_agent_id: Some("w1".into()),
            args: json!({ "task_id": task_id, "status": "completed", "message": "done", "summary": "summary" }),
        },
    )
    .await;
    assert!(complete.success, "{:?}", complete.error);
    assert_eq!(complete.data["status"], "completed");

    let task = ctx.dashboard.get_task(&task_id).await.unwrap();
    assert_eq!(task.status, agentmesh::dashboard::TaskStatus::Completed);

    let agent = ctx.registry.lookup("w1").await.unwrap();
    assert!(agent.current_task_id.is_none(), "worker should be freed on completion");

    let read = dispatch(
        &ctx,
        ToolCall {
            tool: "read_messages".into(),
            caller_agent_id: Some("admin".into()),
            args: json!({ "unread_only": true }),
        },
    )
    .await;
    assert!(read.success, "{:?}", read.error);
    assert_eq!(read.data["messages"], json!(1));
    // The task was already moved to `completed` by report_task_completion
    // itself, so the redundant task_complete message is a no-op: neither
    // applied nor skipped.
    assert_eq!(read.data["dashboard_updates_applied"], json!(0));
    assert_eq!(read.data["dashboard_updates_skipped"].as_array().unwrap().len(), 0);
}

/// S2 — the admin's mailbox doubles as a task-status feed: a worker's
/// task_progress notification read by the admin projects straight onto the
/// dashboard without a separate update_task_status call.
#[tokio::test]
async fn admin_read_auto_syncs_progress_to_dashboard() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir).await;

    create_agent(&ctx, "owner", "owner", None).await;
    create_agent(&ctx, "admin", "admin", Some("owner")).await;
    create_agent(&ctx, "worker", "w1", Some("owner")).await;

    let create_task = dispatch(
        &ctx,
        ToolCall {
            tool: "create_task".into(),
            caller_agent_id: Some("admin".into()),
            args: json!({ "title": "t" }),
        },
    )
    .await;
    let task_id = create_task.data["task_id"].as_str().unwrap().to_string();

    dispatch(
        &ctx,
        ToolCall {
            tool: "assign_task_to_agent".into(),
            caller_agent_id: Some("admin".into()),
            args: json!({ "task_id": task_id, "agent_id": "w1" }),
        },
    )
    .await;

    let pane = ctx.agent_pane("admin").await;
    ctx.mailbox
        .send_message(
            "w1",
            "admin",
            agentmesh::ipc::MessageType::TaskProgress,
            agentmesh::ipc::Priority::Normal,
            Some(format!("task {task_id} InProgress")),
            "halfway there".into(),
            Some(task_id.clone()),
            ctx.terminal.as_ref(),
            pane.as_ref(),
        )
        .await
        .unwrap();

    let read = dispatch(
        &ctx,
        ToolCall {
            tool: "read_messages".into(),
            caller_agent_id: Some("admin".into()),
            args: json!({ "unread_only": true }),
        },
    )
    .await;
    assert!(read.success, "{:?}", read.error);
    assert_eq!(read.data["dashboard_updates_applied"], json!(1));
    assert_eq!(read.data["dashboard_updates_skipped"].as_array().unwrap().len(), 0);

    let task = ctx.dashboard.get_task(&task_id).await.unwrap();
    assert_eq!(task.status, agentmesh::dashboard::TaskStatus::InProgress);
}

/// S2 — once the owner blocks on a reply, a single read_messages call that
/// surfaces an admin message clears the wait-lock without a separate
/// unlock_owner_wait call.
#[tokio::test]
async fn owner_wait_lock_clears_on_admin_reply() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir).await;

    create_agent(&ctx, "owner", "owner", None).await;
    create_agent(&ctx, "admin", "admin", Some("owner")).await;

    ctx.registry.set_owner_wait(true).await.unwrap();
    assert!(ctx.registry.owner_wait_active().await.unwrap());

    let pane = ctx.agent_pane("owner").await;
    ctx.mailbox
        .send_message(
            "admin",
            "owner",
            agentmesh::ipc::MessageType::Response,
            agentmesh::ipc::Priority::Normal,
            Some("status update".into()),
            "all workers idle".into(),
            None,
            ctx.terminal.as_ref(),
            pane.as_ref(),
        )
        .await
        .unwrap();

    let read = dispatch(
        &ctx,
        ToolCall {
            tool: "read_messages".into(),
            caller_agent_id: Some("owner".into()),
            args: json!({ "unread_only": true }),
        },
    )
    .await;
    assert!(read.success, "{:?}", read.error);
    assert_eq!(read.data["messages"], json!(1));
    assert!(!ctx.registry.owner_wait_active().await.unwrap());
}

/// S3 — invalid transition: a completed task can't be moved straight back
/// to in_progress; reopening it first resets the graph.
#[tokio::test]
async fn invalid_transition_then_reopen() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir).await;
    create_agent(&ctx, "owner", "owner", None).await;
    create_agent(&ctx, "admin", "admin", Some("owner")).await;

    let create_task = dispatch(
        &ctx,
        ToolCall {
            tool: "create_task".into(),
            caller_agent_id: Some("admin".into()),
            args: json!({ "title": "t" }),
        },
    )
    .await;
    let task_id = create_task.data["task_id"].as_str().unwrap().to_string();

    for status in ["in_progress", "completed"] {
        let resp = dispatch(
            &ctx,
            ToolCall {
                tool: "update_task_status".into(),
                caller_agent_id: Some("admin".into()),
                args: json!({ "task_id": task_id, "status": status }),
            },
        )
        .await;
        assert!(resp.success, "{status}: {:?}", resp.error);
    }

    let rejected = dispatch(
        &ctx,
        ToolCall {
            tool: "update_task_status".into(),
            caller_agent_id: Some("admin".into()),
            args: json!({ "task_id": task_id, "status": "in_progress" }),
        },
    )
    .await;
    assert!(!rejected.success);
    assert_eq!(rejected.error_code, Some("InvalidTransition"));

    let reopened = dispatch(
        &ctx,
        ToolCall {
            tool: "reopen_task".into(),
            caller_agent_id: Some("admin".into()),
            args: json!({ "task_id": task_id }),
        },
    )
    .await;
    assert!(reopened.success, "{:?}", reopened.error);
    assert_eq!(reopened.data["status"], "pending");

    let retry = dispatch(
        &ctx,
        ToolCall {
            tool: "update_task_status".into(),
            caller_agent_id: Some("admin".into()),
            args: json!({ "task_id": task_id, "status": "in_progress" }),
        },
    )
    .await;
    assert!(retry.success, "{:?}", retry.error);
}

/// S6 — permission: a worker may only read its own mailbox.
#[tokio::test]
async fn worker_mailbox_is_self_only() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir).await;
    create_agent(&ctx, "owner", "owner", None).await;
    create_agent(&ctx, "admin", "admin", Some("owner")).await;
    create_agent(&ctx, "worker", "w1", Some("owner")).await;

    let denied = dispatch(
        &ctx,
        ToolCall {
            tool: "read_messages".into(),
            caller_agent_id: Some("w1".into()),
            args: json!({ "agent_id": "admin" }),
        },
    )
    .await;
    assert!(!denied.success);
    assert_eq!(denied.error_code, Some("PermissionDenied"));

    let allowed = dispatch(
        &ctx,
        ToolCall {
            tool: "read_messages".into(),
            caller_agent_id: Some("w1".into()),
            args: json!({ "agent_id": "w1" }),
        },
    )
    .await;
    assert!(allowed.success, "{:?}", allowed.error);
}
