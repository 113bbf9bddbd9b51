//! Tool execution pipeline.
//!
//! [`ToolManager::execute_tool`] takes a model's tool call through lookup,
//! schema validation, `before_tool` hooks, the permission policy, approval,
//! a timed execution and output sanitization. Whatever goes wrong is turned
//! into a failed [`ToolResult`]; the loop never sees an `Err`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::hooks::{HookEngine, HookResult};
use crate::session::ToolCall;
use crate::utils::sanitize::{render_payload, sanitize_tool_result, DEFAULT_MAX_RESULT_BYTES};

use super::approval::{ApprovalCoordinator, ApprovalStatus};
use super::policy::{AllowAll, ApprovalRequirement, ConfigPolicy, PermissionPolicy};
use super::validate::validate_arguments;
use super::{DenialReason, Tool, ToolContext, ToolErrorKind, ToolRegistry, ToolResult};

/// Default per-call execution timeout
const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// Runs tool calls for the agent loop.
pub struct ToolManager {
    registry: ToolRegistry,
    approvals: ApprovalCoordinator,
    policy: Arc<dyn PermissionPolicy>,
    hooks: HookEngine,
    timeout: Duration,
    max_result_bytes: usize,
    workspace: Option<String>,
}

impl ToolManager {
    /// Manager with no approval requirements, no hooks and default limits.
    pub fn new(registry: ToolRegistry, approvals: ApprovalCoordinator) -> Self {
        Self {
            registry,
            approvals,
            policy: Arc::new(AllowAll),
            hooks: HookEngine::default(),
            timeout: DEFAULT_TOOL_TIMEOUT,
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
            workspace: None,
        }
    }

    /// Manager wired from the `approval`, `hooks` and `tools` config sections.
    pub fn from_config(registry: ToolRegistry, approvals: ApprovalCoordinator, config: &Config) -> Self {
        let manager = Self::new(registry, approvals)
            .with_policy(Arc::new(ConfigPolicy::new(config.approval.clone())))
            .with_hooks(HookEngine::new(config.hooks.clone()))
            .with_timeout(Duration::from_secs(config.tools.timeout_secs))
            .with_max_result_bytes(config.tools.max_result_bytes);
        match config.tools.workspace.as_deref() {
            Some(workspace) => manager.with_workspace(workspace),
            None => manager,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn PermissionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_hooks(mut self, hooks: HookEngine) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_result_bytes(mut self, max: usize) -> Self {
        self.max_result_bytes = max;
        self
    }

    pub fn with_workspace(mut self, workspace: &str) -> Self {
        self.workspace = Some(workspace.to_string());
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn approvals(&self) -> &ApprovalCoordinator {
        &self.approvals
    }

    /// Execute one call. Always yields a result.
    pub async fn execute_tool(
        &self,
        call: &ToolCall,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> ToolResult {
        let started = Instant::now();
        let result = self.run(call, session_id, cancel).await;
        let elapsed = started.elapsed();

        match &result.error {
            None => {
                self.hooks
                    .after_tool(&call.name, &result.sanitized, elapsed, session_id);
                info!(
                    session = %session_id,
                    tool = %call.name,
                    latency_ms = elapsed.as_millis() as u64,
                    "Tool executed successfully"
                );
            }
            Some(error) => {
                self.hooks.on_error(&call.name, &error.message, session_id);
                warn!(
                    session = %session_id,
                    tool = %call.name,
                    kind = %error.kind,
                    error = %error.message,
                    "Tool call failed"
                );
            }
        }
        result.with_duration(elapsed.as_millis() as u64)
    }

    /// Execute the calls of one iteration concurrently. Results come back in
    /// call order.
    pub async fn execute_all(
        &self,
        calls: &[ToolCall],
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Vec<ToolResult> {
        join_all(
            calls
                .iter()
                .map(|call| self.execute_tool(call, session_id, cancel)),
        )
        .await
    }

    async fn run(&self, call: &ToolCall, session_id: &str, cancel: &CancellationToken) -> ToolResult {
        let Some(tool) = self.registry.get(&call.name) else {
            let available = self.registry.names().join(", ");
            return ToolResult::failure(
                &call.id,
                &call.name,
                ToolErrorKind::ValidationError,
                format!("Unknown tool '{}'. Available tools: {}", call.name, available),
            );
        };

        let mut args = match validate_arguments(&call.arguments, &tool.parameters()) {
            Ok(args) => args,
            Err(e) => {
                return ToolResult::failure(
                    &call.id,
                    &call.name,
                    ToolErrorKind::ValidationError,
                    format!("Invalid arguments for '{}': {}", call.name, e),
                )
            }
        };

        match self.hooks.before_tool(&call.name, &args, session_id) {
            HookResult::Continue => {}
            HookResult::Block(msg) => {
                return ToolResult::denied(&call.id, &call.name, DenialReason::SystemDenied, msg)
            }
            HookResult::Patch(patched) => {
                args = match validate_arguments(&patched, &tool.parameters()) {
                    Ok(args) => args,
                    Err(e) => {
                        return ToolResult::failure(
                            &call.id,
                            &call.name,
                            ToolErrorKind::ValidationError,
                            format!("Hook-patched arguments for '{}' are invalid: {}", call.name, e),
                        )
                    }
                };
            }
        }

        if let Some(denied) = self.check_approval(call, tool.as_ref(), &args, session_id, cancel).await {
            return denied;
        }

        self.execute(call, tool, args, session_id, cancel).await
    }

    async fn check_approval(
        &self,
        call: &ToolCall,
        tool: &dyn Tool,
        args: &Value,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Option<ToolResult> {
        let requirement = self
            .policy
            .requirement(session_id, &call.name, tool.category(), args);
        if !requirement.needs_approval() {
            return None;
        }

        let policy_key = match requirement {
            ApprovalRequirement::Always => None,
            _ => Some(tool.policy_key(args)),
        };
        debug!(session = %session_id, tool = %call.name, "Awaiting approval");

        let outcome = tokio::select! {
            outcome = self.approvals.request_approval(session_id, &call.name, args, policy_key.as_deref()) => outcome,
            _ = cancel.cancelled() => {
                return Some(ToolResult::denied(
                    &call.id,
                    &call.name,
                    DenialReason::SystemDenied,
                    "Run cancelled while awaiting approval",
                ));
            }
        };

        let (reason, message) = match outcome.status {
            ApprovalStatus::Approved => return None,
            ApprovalStatus::Denied => (
                DenialReason::UserDenied,
                format!("User denied '{}' ({})", call.name, outcome.source),
            ),
            ApprovalStatus::Timeout => (
                DenialReason::Timeout,
                format!("Approval for '{}' timed out", call.name),
            ),
            ApprovalStatus::SystemDenied | ApprovalStatus::Pending => (
                DenialReason::SystemDenied,
                format!("'{}' was denied by the system ({})", call.name, outcome.source),
            ),
        };
        Some(ToolResult::denied(&call.id, &call.name, reason, message))
    }

    async fn execute(
        &self,
        call: &ToolCall,
        tool: Arc<dyn Tool>,
        args: Value,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> ToolResult {
        let mut ctx = ToolContext::new(session_id, &call.id).with_cancel(cancel.child_token());
        if let Some(ws) = &self.workspace {
            ctx = ctx.with_workspace(ws);
        }
        let tool_cancel = ctx.cancel.clone();

        // Run on its own task so a panicking tool surfaces as a JoinError.
        let mut handle = tokio::spawn(async move { tool.execute(args, &ctx).await });

        let joined = tokio::select! {
            joined = tokio::time::timeout(self.timeout, &mut handle) => joined,
            _ = cancel.cancelled() => {
                tool_cancel.cancel();
                handle.abort();
                return ToolResult::failure(
                    &call.id,
                    &call.name,
                    ToolErrorKind::ExecutionError,
                    "Tool execution cancelled",
                );
            }
        };

        match joined {
            Err(_) => {
                tool_cancel.cancel();
                handle.abort();
                ToolResult::failure(
                    &call.id,
                    &call.name,
                    ToolErrorKind::Timeout,
                    format!("Tool '{}' timed out after {}s", call.name, self.timeout.as_secs()),
                )
            }
            Ok(Err(join_err)) => {
                let msg = if join_err.is_panic() {
                    format!("Tool '{}' panicked", call.name)
                } else {
                    format!("Tool '{}' was aborted", call.name)
                };
                ToolResult::failure(&call.id, &call.name, ToolErrorKind::ExecutionError, msg)
            }
            Ok(Ok(Err(e))) => ToolResult::failure(
                &call.id,
                &call.name,
                ToolErrorKind::ExecutionError,
                e.to_string(),
            ),
            Ok(Ok(Ok(output))) => {
                let text = output
                    .for_llm
                    .unwrap_or_else(|| render_payload(&output.raw));
                let sanitized = sanitize_tool_result(&text, self.max_result_bytes);
                ToolResult::ok(&call.id, &call.name, sanitized, output.raw)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConduitError, Result};
    use crate::hooks::{HookAction, HookRule, HooksConfig};
    use crate::tools::approval::ApprovalDecision;
    use crate::tools::{EchoTool, ToolCategory, ToolOutput};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct DeleteFileTool {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for DeleteFileTool {
        fn name(&self) -> &str {
            "delete_file"
        }
        fn description(&self) -> &str {
            "Delete a file"
        }
        fn parameters(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            })
        }
        fn category(&self) -> ToolCategory {
            ToolCategory::FilesystemWrite
        }
        async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(ToolOutput::text(format!("deleted {}", args["path"].as_str().unwrap_or(""))))
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "fail"
        }
        fn description(&self) -> &str {
            "Always fails"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        fn category(&self) -> ToolCategory {
            ToolCategory::FilesystemRead
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
            Err(ConduitError::Tool("disk on fire".into()))
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "Sleeps for a minute"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        fn category(&self) -> ToolCategory {
            ToolCategory::FilesystemRead
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ToolOutput::text("done"))
        }
    }

    struct PanicTool;

    #[async_trait]
    impl Tool for PanicTool {
        fn name(&self) -> &str {
            "panic"
        }
        fn description(&self) -> &str {
            "Panics"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        fn category(&self) -> ToolCategory {
            ToolCategory::FilesystemRead
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
            panic!("tool bug");
        }
    }

    fn registry(runs: Arc<AtomicUsize>) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(DeleteFileTool { runs }));
        registry.register(Arc::new(FailingTool));
        registry.register(Arc::new(SlowTool));
        registry.register(Arc::new(PanicTool));
        registry
    }

    fn gated_manager(runs: Arc<AtomicUsize>) -> ToolManager {
        let config = Config::default();
        let approvals = ApprovalCoordinator::new(&config.approval);
        ToolManager::from_config(registry(runs), approvals, &config)
    }

    fn call(id: &str, name: &str, args: Value) -> ToolCall {
        ToolCall::new(id, name, args)
    }

    #[tokio::test]
    async fn test_unknown_tool_is_validation_error() {
        let manager = gated_manager(Arc::default());
        let result = manager
            .execute_tool(&call("c1", "nope", json!({})), "s", &CancellationToken::new())
            .await;
        assert!(!result.success);
        assert_eq!(result.error_kind(), Some(ToolErrorKind::ValidationError));
        assert!(result.sanitized.contains("Unknown tool 'nope'"));
    }

    #[tokio::test]
    async fn test_missing_required_argument() {
        let manager = gated_manager(Arc::default());
        let result = manager
            .execute_tool(&call("c1", "echo", json!({})), "s", &CancellationToken::new())
            .await;
        assert_eq!(result.error_kind(), Some(ToolErrorKind::ValidationError));
        assert!(result.sanitized.contains("missing required field 'message'"));
    }

    #[tokio::test]
    async fn test_echo_success_is_sanitized() {
        let manager = gated_manager(Arc::default()).with_max_result_bytes(10);
        let result = manager
            .execute_tool(
                &call("c1", "echo", json!({"message": "a".repeat(100)})),
                "s",
                &CancellationToken::new(),
            )
            .await;
        assert!(result.success);
        assert!(result.sanitized.contains("truncated"));
        assert_eq!(result.raw, json!("a".repeat(100)));
    }

    #[tokio::test]
    async fn test_execution_error_becomes_result() {
        let manager = gated_manager(Arc::default());
        let result = manager
            .execute_tool(&call("c1", "fail", json!({})), "s", &CancellationToken::new())
            .await;
        assert_eq!(result.error_kind(), Some(ToolErrorKind::ExecutionError));
        assert!(result.sanitized.contains("disk on fire"));
    }

    #[tokio::test]
    async fn test_panic_becomes_execution_error() {
        let manager = gated_manager(Arc::default());
        let result = manager
            .execute_tool(&call("c1", "panic", json!({})), "s", &CancellationToken::new())
            .await;
        assert_eq!(result.error_kind(), Some(ToolErrorKind::ExecutionError));
        assert!(result.sanitized.contains("panicked"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let manager = gated_manager(Arc::default()).with_timeout(Duration::from_secs(2));
        let result = manager
            .execute_tool(&call("c1", "slow", json!({})), "s", &CancellationToken::new())
            .await;
        assert_eq!(result.error_kind(), Some(ToolErrorKind::Timeout));
    }

    #[tokio::test]
    async fn test_no_transport_means_system_denied() {
        let runs = Arc::new(AtomicUsize::new(0));
        let manager = gated_manager(runs.clone());
        let result = manager
            .execute_tool(
                &call("c1", "delete_file", json!({"path": "x"})),
                "s",
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result.denial_reason(), Some(DenialReason::SystemDenied));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_parallel_identical_calls_share_approval() {
        let runs = Arc::new(AtomicUsize::new(0));
        let manager = Arc::new(gated_manager(runs.clone()));
        let mut ui = manager.approvals().subscribe("s", "cli");

        let calls = vec![
            call("c1", "delete_file", json!({"path": "x"})),
            call("c2", "delete_file", json!({"path": "x"})),
        ];
        let m = manager.clone();
        let task = tokio::spawn(async move {
            m.execute_all(&calls, "s", &CancellationToken::new()).await
        });

        let request = ui.recv().await.unwrap();
        while manager.approvals().waiters(&request.id) < 2 {
            tokio::task::yield_now().await;
        }
        assert!(manager
            .approvals()
            .resolve(&request.id, ApprovalDecision::Approve, "cli"));

        let results = task.await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].call_id, "c1");
        assert_eq!(results[1].call_id, "c2");
        assert!(results.iter().all(|r| r.success));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(ui.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_user_denial() {
        let manager = Arc::new(gated_manager(Arc::default()));
        let mut ui = manager.approvals().subscribe("s", "web");
        let m = manager.clone();
        let task = tokio::spawn(async move {
            m.execute_tool(
                &call("c1", "delete_file", json!({"path": "x"})),
                "s",
                &CancellationToken::new(),
            )
            .await
        });
        let request = ui.recv().await.unwrap();
        manager
            .approvals()
            .resolve(&request.id, ApprovalDecision::Deny, "web");
        let result = task.await.unwrap();
        assert_eq!(result.denial_reason(), Some(DenialReason::UserDenied));
        assert!(result.sanitized.starts_with("Error (denied: user_denied)"));
    }

    #[tokio::test]
    async fn test_hook_block_and_patch() {
        let mut set = serde_json::Map::new();
        set.insert("message".into(), json!("patched"));
        let hooks = HookEngine::new(HooksConfig {
            enabled: true,
            before_tool: vec![
                HookRule {
                    action: HookAction::Patch,
                    tools: vec!["echo".into()],
                    set_args: set,
                    ..Default::default()
                },
                HookRule {
                    action: HookAction::Block,
                    tools: vec!["fail".into()],
                    ..Default::default()
                },
            ],
            ..Default::default()
        });
        let manager = gated_manager(Arc::default()).with_hooks(hooks);
        let cancel = CancellationToken::new();

        let echoed = manager
            .execute_tool(&call("c1", "echo", json!({"message": "orig"})), "s", &cancel)
            .await;
        assert_eq!(echoed.sanitized, "patched");

        let blocked = manager
            .execute_tool(&call("c2", "fail", json!({})), "s", &cancel)
            .await;
        assert_eq!(blocked.denial_reason(), Some(DenialReason::SystemDenied));
    }

    #[tokio::test]
    async fn test_cancel_during_approval() {
        let manager = Arc::new(gated_manager(Arc::default()));
        let _ui = manager.approvals().subscribe("s", "cli");
        let cancel = CancellationToken::new();
        let m = manager.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            m.execute_tool(&call("c1", "delete_file", json!({"path": "x"})), "s", &token)
                .await
        });
        while manager.approvals().pending("s").is_empty() {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        let result = task.await.unwrap();
        assert_eq!(result.denial_reason(), Some(DenialReason::SystemDenied));
    }
}
