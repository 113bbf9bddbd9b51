//! Integration tests for Conduit
//!
//! These tests verify that the components below the agent loop work
//! together: history persistence with the context manager, the tool
//! pipeline with approval and hooks, and configuration loading.

use std::sync::Arc;
use std::time::Duration;

use conduit::agent::{ContextManager, ProviderFamily};
use conduit::bus::{AgentEvent, EventKind, SessionEventBus};
use conduit::config::{ApprovalConfig, ApprovalMode, Config, ContextConfig};
use conduit::hooks::{HookAction, HookRule, HooksConfig};
use conduit::session::{FileHistoryProvider, HistoryProvider, Role, ToolCall};
use conduit::tools::{
    ApprovalCoordinator, ApprovalDecision, ApprovalStatus, ToolManager, ToolRegistry, ToolResult,
};
use serde_json::json;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

// ============================================================================
// History + context
// ============================================================================

#[tokio::test]
async fn test_file_history_survives_reload() {
    let dir = tempdir().unwrap();
    let history: Arc<dyn HistoryProvider> =
        Arc::new(FileHistoryProvider::with_path(dir.path().to_path_buf()).unwrap());
    let config = ContextConfig::default();

    {
        let mut ctx = ContextManager::load("web:42", history.clone(), &config, ProviderFamily::Anthropic)
            .await
            .unwrap();
        ctx.add_user_message("remember the number 7", None, None)
            .await
            .unwrap();
        ctx.add_assistant_message("Noted: 7.", Vec::new(), None)
            .await
            .unwrap();
        ctx.update_actual_token_count(321).await.unwrap();
    }

    let ctx = ContextManager::load("web:42", history, &config, ProviderFamily::Anthropic)
        .await
        .unwrap();
    let messages = ctx.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].text(), "remember the number 7");
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(ctx.session().budget.last_actual_tokens, Some(321));
    assert_eq!(ctx.session().provider_family, Some(ProviderFamily::Anthropic));
}

#[tokio::test]
async fn test_provider_switch_flattens_persisted_tool_history() {
    let dir = tempdir().unwrap();
    let history: Arc<dyn HistoryProvider> =
        Arc::new(FileHistoryProvider::with_path(dir.path().to_path_buf()).unwrap());
    let config = ContextConfig::default();

    {
        let mut ctx = ContextManager::load("s1", history.clone(), &config, ProviderFamily::OpenAI)
            .await
            .unwrap();
        ctx.add_user_message("what time is it", None, None)
            .await
            .unwrap();
        ctx.add_assistant_message(
            "",
            vec![ToolCall::new("call_abc", "clock", json!({}))],
            None,
        )
        .await
        .unwrap();
        ctx.add_tool_result(&ToolResult::ok("call_abc", "clock", "12:00".into(), json!("12:00")))
            .await
            .unwrap();
    }

    let ctx = ContextManager::load("s1", history.clone(), &config, ProviderFamily::Anthropic)
        .await
        .unwrap();
    assert!(ctx
        .messages()
        .iter()
        .all(|m| !m.has_tool_calls() && !m.is_tool_result()));
    assert!(ctx.messages()[1].text().contains("clock"));

    // The flattened log is what is stored now.
    let stored = history.load("s1").await.unwrap().unwrap();
    assert!(stored.messages.iter().all(|m| m.role != Role::Tool));
    assert_eq!(stored.provider_family, Some(ProviderFamily::Anthropic));
}

// ============================================================================
// Tool pipeline
// ============================================================================

fn workspace_manager(workspace: &str, approval: ApprovalConfig) -> ToolManager {
    let mut config = Config::default();
    config.tools.workspace = Some(workspace.to_string());
    config.approval = approval.clone();
    let mut registry = ToolRegistry::new();
    registry.register_filesystem_tools();
    ToolManager::from_config(registry, ApprovalCoordinator::new(&approval), &config)
}

fn no_approval() -> ApprovalConfig {
    ApprovalConfig {
        mode: ApprovalMode::Never,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_filesystem_tools_through_manager() {
    let dir = tempdir().unwrap();
    let manager = workspace_manager(&dir.path().to_string_lossy(), no_approval());
    let cancel = CancellationToken::new();

    let write = ToolCall::new(
        "c1",
        "write_file",
        json!({"path": "notes/todo.md", "content": "- ship it"}),
    );
    let result = manager.execute_tool(&write, "s1", &cancel).await;
    assert!(result.success, "{}", result.sanitized);

    let read = ToolCall::new("c2", "read_file", json!({"path": "notes/todo.md"}));
    let result = manager.execute_tool(&read, "s1", &cancel).await;
    assert!(result.success);
    assert_eq!(result.sanitized, "- ship it");

    let escape = ToolCall::new("c3", "read_file", json!({"path": "../../etc/hostname"}));
    let result = manager.execute_tool(&escape, "s1", &cancel).await;
    assert!(!result.success);
    assert!(result.sanitized.contains("outside the workspace"));
}

#[tokio::test]
async fn test_missing_required_argument_is_validation_failure() {
    let dir = tempdir().unwrap();
    let manager = workspace_manager(&dir.path().to_string_lossy(), no_approval());

    let call = ToolCall::new("c1", "write_file", json!({"path": "a.txt"}));
    let result = manager
        .execute_tool(&call, "s1", &CancellationToken::new())
        .await;
    assert!(!result.success);
    assert!(result.sanitized.contains("content"));
}

#[tokio::test]
async fn test_approve_always_covers_directory() {
    let dir = tempdir().unwrap();
    let manager = workspace_manager(&dir.path().to_string_lossy(), ApprovalConfig::default());
    let approvals = manager.approvals().clone();
    let mut feed = approvals.subscribe("s1", "web");
    let cancel = CancellationToken::new();

    let first = ToolCall::new("c1", "write_file", json!({"path": "out/a.txt", "content": "a"}));
    let pending = {
        let approvals = approvals.clone();
        tokio::spawn(async move {
            let request = feed.recv().await.unwrap();
            assert_eq!(request.policy_key.as_deref(), Some("write_file:out"));
            assert!(approvals.resolve(&request.id, ApprovalDecision::ApproveAlways, "web"));
            feed
        })
    };
    let result = manager.execute_tool(&first, "s1", &cancel).await;
    assert!(result.success, "{}", result.sanitized);
    let mut feed = pending.await.unwrap();

    // Same directory: no new request.
    let second = ToolCall::new("c2", "write_file", json!({"path": "out/b.txt", "content": "b"}));
    let result = manager.execute_tool(&second, "s1", &cancel).await;
    assert!(result.success);
    assert!(feed.try_recv().is_none());
    assert!(approvals.is_auto_approved("s1", "write_file:out"));
}

#[tokio::test]
async fn test_no_transport_denies_gated_call() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("keep.txt"), "x").unwrap();
    let manager = workspace_manager(&dir.path().to_string_lossy(), ApprovalConfig::default());

    let call = ToolCall::new("c1", "delete_file", json!({"path": "keep.txt"}));
    let result = manager
        .execute_tool(&call, "s1", &CancellationToken::new())
        .await;
    assert!(!result.success);
    assert!(dir.path().join("keep.txt").exists());
}

#[tokio::test]
async fn test_hook_block_stops_call() {
    let dir = tempdir().unwrap();
    let mut config = Config::default();
    config.tools.workspace = Some(dir.path().to_string_lossy().to_string());
    config.approval = no_approval();
    config.hooks = HooksConfig {
        enabled: true,
        before_tool: vec![HookRule {
            action: HookAction::Block,
            tools: vec!["delete_file".into()],
            message: Some("deletes are off today".into()),
            ..Default::default()
        }],
        ..Default::default()
    };
    std::fs::write(dir.path().join("keep.txt"), "x").unwrap();
    let mut registry = ToolRegistry::new();
    registry.register_filesystem_tools();
    let manager = ToolManager::from_config(
        registry,
        ApprovalCoordinator::new(&config.approval),
        &config,
    );

    let call = ToolCall::new("c1", "delete_file", json!({"path": "keep.txt"}));
    let result = manager
        .execute_tool(&call, "s1", &CancellationToken::new())
        .await;
    assert!(!result.success);
    assert!(result.sanitized.contains("deletes are off today"));
    assert!(dir.path().join("keep.txt").exists());
}

// ============================================================================
// Approval + event bus
// ============================================================================

#[tokio::test]
async fn test_approval_lifecycle_is_published() {
    let bus = SessionEventBus::new();
    let approvals = ApprovalCoordinator::new(&ApprovalConfig::default()).with_bus(bus.clone());
    let mut events = bus.subscribe("s1");
    let mut feed = approvals.subscribe("s1", "cli");

    let waiter = {
        let approvals = approvals.clone();
        tokio::spawn(async move {
            approvals
                .request_approval("s1", "delete_file", &json!({"path": "x"}), None)
                .await
        })
    };

    let request = feed.recv().await.unwrap();
    assert!(approvals.resolve(&request.id, ApprovalDecision::Deny, "cli"));
    let outcome = waiter.await.unwrap();
    assert_eq!(outcome.status, ApprovalStatus::Denied);
    assert_eq!(outcome.source, "cli");

    let requested = events.recv().await.unwrap();
    assert_eq!(requested.kind(), EventKind::ApprovalRequested);
    match events.recv().await.unwrap() {
        AgentEvent::ApprovalResolved { status, source, .. } => {
            assert_eq!(status, ApprovalStatus::Denied);
            assert_eq!(source, "cli");
        }
        other => panic!("unexpected event {:?}", other.kind()),
    }
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_approval_times_out() {
    let approvals = ApprovalCoordinator::new(&ApprovalConfig::default())
        .with_timeout(Duration::from_secs(30));
    let _feed = approvals.subscribe("s1", "cli");

    let outcome = approvals
        .request_approval("s1", "delete_file", &json!({"path": "x"}), None)
        .await;
    assert_eq!(outcome.status, ApprovalStatus::Timeout);
    assert!(approvals.pending("s1").is_empty());
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_config_file_drives_tool_manager() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(
        &path,
        format!(
            r#"{{
                "tools": {{"workspace": "{}", "timeout_secs": 5}},
                "approval": {{"mode": "never"}},
                "context": {{"max_input_tokens": 8000, "keep_recent_turns": 2}}
            }}"#,
            dir.path().display()
        ),
    )
    .unwrap();

    let config = Config::load_from_path(&path).unwrap();
    assert_eq!(config.tools.timeout_secs, 5);
    assert_eq!(config.approval.mode, ApprovalMode::Never);
    assert_eq!(config.context.max_input_tokens, Some(8000));
    assert_eq!(config.context.keep_recent_turns, 2);
    assert_eq!(
        config.tools.workspace.as_deref(),
        Some(dir.path().to_string_lossy().as_ref())
    );
}
