//! Agent loop implementation
//!
//! [`LLMService`] runs the agentic loop for any [`ProviderAdapter`]:
//!
//! ```text
//! Thinking ──> ProviderCall ──┬── no tool calls ──> Done
//!    ^                        │
//!    └──── ExecuteTools <─────┴── tool calls
//! ```
//!
//! bounded by `agent.max_iterations`. Provider failures, cancellation and the
//! iteration ceiling all end the run with a text result and never with `Err`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::bus::{AgentEvent, EventKind, SessionEventBus, Subscription};
use crate::config::Config;
use crate::error::{ConduitError, ProviderError, Result};
use crate::providers::error_classifier::user_facing_message;
use crate::providers::retry::is_retryable;
use crate::providers::{
    build_adapter, ChatOptions, ProviderAdapter, ProviderRequest, ProviderResponse, RetryPolicy,
};
use crate::session::{FileData, HistoryProvider, ImageData, TokenUsage};
use crate::tools::{
    ApprovalCoordinator, ApprovalDecision, DenialReason, ToolManager, ToolRegistry, ToolResult,
};

use super::context::{ContextManager, ContributorContext, LlmContext};
use super::stream::StreamAssembler;

/// Resolution source recorded for approvals answered through [`LLMService::resolve_approval`].
const API_SOURCE: &str = "api";

/// Text appended when a run stops at the iteration ceiling.
pub fn max_iterations_marker(max_iterations: u32) -> String {
    format!("[reached maximum iterations ({})]", max_iterations)
}

/// One user turn to run.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub session_id: String,
    pub input: String,
    pub image: Option<ImageData>,
    pub file: Option<FileData>,
    /// Stream the provider call. `None` uses `agent.streaming`.
    pub stream: Option<bool>,
    /// Extra system-prompt sections for this run
    pub context: ContributorContext,
}

impl RunRequest {
    pub fn new(session_id: &str, input: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            input: input.to_string(),
            ..Default::default()
        }
    }

    pub fn with_image(mut self, image: ImageData) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_file(mut self, file: FileData) -> Self {
        self.file = Some(file);
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn with_context(mut self, context: ContributorContext) -> Self {
        self.context = context;
        self
    }
}

/// Effective provider settings of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmServiceConfig {
    pub provider: String,
    pub model: String,
    /// `context.max_input_tokens` as configured, before capping
    pub configured_max_input_tokens: Option<usize>,
    pub model_max_input_tokens: usize,
}

/// Provider-agnostic agentic loop.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use conduit::agent::{LLMService, RunRequest};
/// use conduit::config::Config;
/// use conduit::session::MemoryHistoryProvider;
/// use conduit::tools::{EchoTool, ToolRegistry};
///
/// # async fn example() -> conduit::Result<()> {
/// let mut registry = ToolRegistry::new();
/// registry.register(Arc::new(EchoTool));
///
/// let service = LLMService::from_config(
///     Config::load()?,
///     registry,
///     Arc::new(MemoryHistoryProvider::new()),
/// )?;
/// let answer = service.run(RunRequest::new("cli:1", "Say hi")).await;
/// println!("{}", answer);
/// # Ok(())
/// # }
/// ```
pub struct LLMService {
    config: Config,
    adapter: Arc<dyn ProviderAdapter>,
    model: String,
    tools: ToolManager,
    approvals: ApprovalCoordinator,
    history: Arc<dyn HistoryProvider>,
    bus: SessionEventBus,
    retry: RetryPolicy,
    /// Per-session locks; iterations of one session never overlap
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LLMService {
    /// Build a service around `adapter`. Fails if `config` does not validate.
    pub fn new(
        config: Config,
        adapter: Arc<dyn ProviderAdapter>,
        registry: ToolRegistry,
        history: Arc<dyn HistoryProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let bus = SessionEventBus::new();
        let approvals = ApprovalCoordinator::new(&config.approval).with_bus(bus.clone());
        let tools = ToolManager::from_config(registry, approvals.clone(), &config);
        let model = config
            .agent
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| adapter.default_model().to_string());
        let retry = RetryPolicy::from_config(&config.providers.retry);

        info!(
            provider = adapter.name(),
            model = %model,
            tools = tools.registry().len(),
            "LLM service ready"
        );

        Ok(Self {
            config,
            adapter,
            model,
            tools,
            approvals,
            history,
            bus,
            retry,
            session_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Build a service with the adapter selected by `agent.provider`.
    pub fn from_config(
        config: Config,
        registry: ToolRegistry,
        history: Arc<dyn HistoryProvider>,
    ) -> Result<Self> {
        let adapter = build_adapter(&config)?;
        Self::new(config, adapter, registry, history)
    }

    /// Replace the tool manager, e.g. to install a custom permission policy.
    pub fn with_tool_manager(mut self, tools: ToolManager) -> Self {
        self.approvals = tools.approvals().clone();
        self.tools = tools;
        self
    }

    /// Run one user turn to completion.
    pub async fn run(&self, request: RunRequest) -> String {
        self.run_with_cancel(request, CancellationToken::new()).await
    }

    /// Run one user turn, stopping early when `cancel` fires.
    ///
    /// Returns the final assistant text, `"Error: ..."` when the provider
    /// fails for good, or `"Cancelled"`.
    pub async fn run_with_cancel(&self, request: RunRequest, cancel: CancellationToken) -> String {
        let session_id = request.session_id.clone();
        let lock = self.session_lock(&session_id).await;
        let text = {
            let _guard = lock.lock().await;
            self.run_guarded(request, &cancel).await
        };
        self.release_session_lock(&session_id, lock).await;
        text
    }

    async fn run_guarded(&self, request: RunRequest, cancel: &CancellationToken) -> String {
        let session_id = request.session_id.clone();
        let span = info_span!("run", session_id = %session_id);
        match self.run_locked(request, cancel).instrument(span).await {
            Ok(text) => text,
            Err(ConduitError::Cancelled) => {
                self.approvals.cancel_session(&session_id);
                info!(session_id = %session_id, "Run cancelled");
                self.emit(AgentEvent::Error {
                    session_id,
                    error: "Cancelled".into(),
                    context: "run".into(),
                    recoverable: true,
                });
                "Cancelled".to_string()
            }
            Err(err) => {
                error!(session_id = %session_id, error = %err, "Run failed");
                let text = failure_text(&err);
                self.emit(AgentEvent::Error {
                    session_id,
                    error: err.to_string(),
                    context: error_context(&err).into(),
                    recoverable: is_retryable(&err),
                });
                text
            }
        }
    }

    async fn run_locked(&self, request: RunRequest, cancel: &CancellationToken) -> Result<String> {
        let session_id = request.session_id.as_str();
        let mut ctx = ContextManager::load(
            session_id,
            self.history.clone(),
            &self.config.context,
            self.adapter.family(),
        )
        .await?;
        ctx.add_user_message(&request.input, request.image.clone(), request.file.clone())
            .await?;

        let stream = request.stream.unwrap_or(self.config.agent.streaming);
        let llm = self.llm_context();
        let options = ChatOptions::new()
            .with_max_tokens(self.config.agent.max_tokens)
            .with_temperature(self.config.agent.temperature);

        let max_iterations = self.config.agent.max_iterations;
        let mut total_usage = TokenUsage::default();
        let mut last_prompt_tokens = None;
        let mut best_text = String::new();

        for iteration in 1..=max_iterations {
            if cancel.is_cancelled() {
                return Err(ConduitError::Cancelled);
            }
            self.emit(AgentEvent::Thinking {
                session_id: session_id.to_string(),
                iteration,
            });

            let formatted = ctx
                .get_formatted_messages_with_compression(
                    &request.context,
                    &llm,
                    &self.config.agent.system_prompt,
                )
                .await?;
            if let Some(checkpoint) = formatted.compaction.clone() {
                self.emit(AgentEvent::Compaction {
                    session_id: session_id.to_string(),
                    checkpoint,
                });
            }

            let provider_request = ProviderRequest {
                model: self.model.clone(),
                prompt: formatted.prompt(),
                tools: llm.tools.clone(),
                options: options.clone(),
            };
            debug!(
                iteration,
                stream,
                estimated_tokens = formatted.tokens_used,
                "Calling provider"
            );
            let response = if stream {
                self.call_streaming(session_id, &provider_request, cancel).await?
            } else {
                self.call_batch(&provider_request, cancel).await?
            };

            total_usage.accumulate(&response.usage);
            ctx.record_usage(&self.model, &response.usage);
            if response.usage.input_tokens > 0 {
                last_prompt_tokens = Some(response.usage.input_tokens as usize);
            }
            if !response.text.is_empty() {
                best_text = response.text.clone();
            }

            if !response.has_tool_calls() {
                ctx.add_assistant_message(&response.text, Vec::new(), Some(response.usage))
                    .await?;
                return self
                    .finish(&mut ctx, response.text, total_usage, last_prompt_tokens)
                    .await;
            }

            let assistant = ctx
                .add_assistant_message(&response.text, response.tool_calls, Some(response.usage))
                .await?;
            let calls = assistant.tool_calls.unwrap_or_default();
            info!(iteration, calls = calls.len(), "Executing tool calls");
            for call in &calls {
                self.emit(AgentEvent::ToolCall {
                    session_id: session_id.to_string(),
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    args: call.arguments.clone(),
                });
            }

            let results = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // Late results are dropped; the log still needs an answer per call.
                    for call in &calls {
                        let result = ToolResult::denied(
                            &call.id,
                            &call.name,
                            DenialReason::SystemDenied,
                            "Cancelled before completion",
                        );
                        ctx.add_tool_result(&result).await?;
                    }
                    return Err(ConduitError::Cancelled);
                }
                results = self.tools.execute_all(&calls, session_id, cancel) => results,
            };

            for result in results {
                ctx.add_tool_result(&result).await?;
                self.emit(AgentEvent::ToolResult {
                    session_id: session_id.to_string(),
                    call_id: result.call_id.clone(),
                    tool_name: result.tool_name.clone(),
                    success: result.success,
                    result,
                });
            }
        }

        warn!(
            max_iterations,
            "Tool loop reached maximum iterations, returning partial response"
        );
        let marker = max_iterations_marker(max_iterations);
        let text = if best_text.is_empty() {
            marker
        } else {
            format!("{}\n\n{}", best_text, marker)
        };
        ctx.add_assistant_message(&text, Vec::new(), None).await?;
        self.finish(&mut ctx, text, total_usage, last_prompt_tokens)
            .await
    }

    async fn finish(
        &self,
        ctx: &mut ContextManager,
        text: String,
        usage: TokenUsage,
        last_prompt_tokens: Option<usize>,
    ) -> Result<String> {
        if let Some(tokens) = last_prompt_tokens {
            ctx.update_actual_token_count(tokens).await?;
        }
        info!(
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "Run complete"
        );
        self.emit(AgentEvent::Response {
            session_id: ctx.session().id.clone(),
            content: text.clone(),
            model: self.model.clone(),
            token_usage: usage,
        });
        Ok(text)
    }

    async fn call_batch(
        &self,
        request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<ProviderResponse> {
        let adapter = self.adapter.as_ref();
        self.retry
            .run("chat", cancel, |_| async move {
                let body = adapter.send(request).await?;
                Ok(ProviderResponse::from_body(adapter, &body))
            })
            .await
    }

    /// Stream one call to `Done`, forwarding text deltas as `chunk` events.
    /// A failure anywhere in the stream retries the whole call.
    async fn call_streaming(
        &self,
        session_id: &str,
        request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<ProviderResponse> {
        let adapter = self.adapter.as_ref();
        let bus = &self.bus;
        self.retry
            .run("chat_stream", cancel, |_| async move {
                let mut rx = adapter.send_stream(request).await?;
                let mut assembler = StreamAssembler::new();
                while let Some(chunk) = rx.recv().await {
                    if let Some(delta) = assembler.push(chunk)? {
                        bus.emit(AgentEvent::Chunk {
                            session_id: session_id.to_string(),
                            content: delta,
                            is_complete: false,
                        });
                    }
                    if assembler.is_done() {
                        break;
                    }
                }
                if !assembler.is_done() {
                    return Err(
                        ProviderError::ServerError("stream closed before completion".into()).into(),
                    );
                }
                bus.emit(AgentEvent::Chunk {
                    session_id: session_id.to_string(),
                    content: String::new(),
                    is_complete: true,
                });
                Ok(assembler.finish())
            })
            .await
    }

    fn llm_context(&self) -> LlmContext {
        let definitions = self.tools.registry().definitions();
        let tools = if definitions.is_empty() {
            Vec::new()
        } else {
            self.adapter.format_tools(&definitions)
        };
        LlmContext {
            provider: self.adapter.name().to_string(),
            model: self.model.clone(),
            family: self.adapter.family(),
            tools,
            model_max_input_tokens: self.adapter.model_max_input_tokens(&self.model),
        }
    }

    async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the session's lock entry unless another run holds or awaits it.
    async fn release_session_lock(&self, session_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.session_locks.lock().await;
        let idle = locks
            .get(session_id)
            .is_some_and(|held| Arc::ptr_eq(held, &lock) && Arc::strong_count(held) == 2);
        if idle {
            locks.remove(session_id);
        }
    }

    /// Number of sessions with a run in progress or queued.
    pub async fn active_sessions(&self) -> usize {
        self.session_locks.lock().await.len()
    }

    fn emit(&self, event: AgentEvent) {
        self.bus.emit(event);
    }

    /// Call `handler` for every event of `kind`, across sessions.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(AgentEvent) + Send + Sync + 'static,
    {
        self.bus.on(kind, handler)
    }

    /// Receive every event of one session.
    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<AgentEvent> {
        self.bus.subscribe(session_id)
    }

    /// Answer a pending approval request. Returns `false` if it was already
    /// resolved or does not exist.
    pub fn resolve_approval(&self, request_id: &str, decision: ApprovalDecision) -> bool {
        self.approvals.resolve(request_id, decision, API_SOURCE)
    }

    /// Approval table, for transports that subscribe to requests.
    pub fn approvals(&self) -> &ApprovalCoordinator {
        &self.approvals
    }

    pub fn bus(&self) -> &SessionEventBus {
        &self.bus
    }

    pub fn get_config(&self) -> LlmServiceConfig {
        LlmServiceConfig {
            provider: self.adapter.name().to_string(),
            model: self.model.clone(),
            configured_max_input_tokens: self.config.context.max_input_tokens,
            model_max_input_tokens: self.adapter.model_max_input_tokens(&self.model),
        }
    }
}

/// Text returned to the caller for a failed run.
fn failure_text(err: &ConduitError) -> String {
    match err {
        ConduitError::ProviderTyped(e) => user_facing_message(e),
        other => format!("Error: {}", other),
    }
}

fn error_context(err: &ConduitError) -> &'static str {
    match err {
        ConduitError::ProviderTyped(_) | ConduitError::Provider(_) | ConduitError::Http(_) => {
            "provider"
        }
        ConduitError::ContextOverflow { .. } => "context",
        ConduitError::Session(_) | ConduitError::Io(_) | ConduitError::Json(_) => "history",
        _ => "run",
    }
}
