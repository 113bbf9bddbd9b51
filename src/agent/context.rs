//! Conversation context for agent runs
//!
//! [`ContextManager`] owns one session's message log while a run holds it.
//! It appends and persists messages, keeps the token budget, compacts
//! history when the estimate crosses the compaction threshold, and formats
//! the log for the provider family of the current call.
//!
//! [`ContributorContext`] and [`RuntimeContext`] assemble the extra
//! system-prompt sections (runtime environment, skills, free-form notes)
//! that are sent in front of the history.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::config::ContextConfig;
use crate::error::{ConduitError, Result};
use crate::providers::{flatten_tool_history, formatter_for, WirePrompt};
use crate::session::{
    CompactionCheckpoint, FileData, HistoryProvider, ImageData, Message, Session, TokenUsage,
    ToolCall,
};
use crate::tools::ToolResult;

use super::compaction::{compact, CompactionSettings};
use super::tokenizer::{HeuristicTokenizer, ProviderFamily, Tokenizer};

/// Runtime context injected into the system prompt to make agents environment-aware.
///
/// When rendered, it produces a `## Runtime Context` section appended to the
/// system prompt.
///
/// # Example
///
/// ```rust
/// use conduit::agent::RuntimeContext;
///
/// let ctx = RuntimeContext::new()
///     .with_transport("cli")
///     .with_tools(vec!["shell".to_string(), "read_file".to_string()])
///     .with_workspace("/home/user/project");
///
/// let rendered = ctx.render().unwrap();
/// assert!(rendered.contains("Transport: cli"));
/// assert!(rendered.contains("shell, read_file"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct RuntimeContext {
    /// Transport the request came in on (e.g., "cli", "web", "webhook")
    pub transport: Option<String>,
    /// Names of available tools
    pub available_tools: Vec<String>,
    /// Current timestamp (RFC 3339)
    pub current_time: Option<String>,
    /// Workspace path
    pub workspace: Option<String>,
    /// OS/platform info (e.g., "linux x86_64")
    pub os_info: Option<String>,
}

impl RuntimeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transport(mut self, transport: &str) -> Self {
        self.transport = Some(transport.to_string());
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.available_tools = tools;
        self
    }

    /// Set the current time to now (UTC, RFC 3339).
    pub fn with_current_time(mut self) -> Self {
        self.current_time = Some(chrono::Utc::now().to_rfc3339());
        self
    }

    pub fn with_workspace(mut self, workspace: &str) -> Self {
        self.workspace = Some(workspace.to_string());
        self
    }

    /// Set the OS/platform info from the current environment.
    pub fn with_os_info(mut self) -> Self {
        self.os_info = Some(format!(
            "{} {}",
            std::env::consts::OS,
            std::env::consts::ARCH
        ));
        self
    }

    /// Returns `true` if no fields have been populated.
    pub fn is_empty(&self) -> bool {
        self.transport.is_none()
            && self.available_tools.is_empty()
            && self.current_time.is_none()
            && self.workspace.is_none()
            && self.os_info.is_none()
    }

    /// Render the context as a markdown section, or `None` if nothing is set.
    pub fn render(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }

        let mut parts = Vec::new();
        if let Some(ref transport) = self.transport {
            parts.push(format!("- Transport: {}", transport));
        }
        if !self.available_tools.is_empty() {
            parts.push(format!(
                "- Available tools: {}",
                self.available_tools.join(", ")
            ));
        }
        if let Some(ref time) = self.current_time {
            parts.push(format!("- Current time: {}", time));
        }
        if let Some(ref workspace) = self.workspace {
            parts.push(format!("- Workspace: {}", workspace));
        }
        if let Some(ref os) = self.os_info {
            parts.push(format!("- Platform: {}", os));
        }

        Some(format!("## Runtime Context\n\n{}", parts.join("\n")))
    }
}

/// Extra system-prompt material contributed by the caller of a run.
///
/// # Example
///
/// ```rust
/// use conduit::agent::{ContributorContext, RuntimeContext};
///
/// let ctx = ContributorContext::new()
///     .with_skills("- /search: Search the web")
///     .with_runtime_context(RuntimeContext::new().with_transport("web"));
/// let prompt = ctx.build_system_prompt("You are helpful.");
/// assert!(prompt.starts_with("You are helpful."));
/// assert!(prompt.contains("## Available Skills"));
/// assert!(prompt.contains("Transport: web"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ContributorContext {
    runtime: Option<RuntimeContext>,
    skills: Option<String>,
    sections: Vec<String>,
}

impl ContributorContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add runtime context. An empty context is ignored.
    pub fn with_runtime_context(mut self, ctx: RuntimeContext) -> Self {
        if !ctx.is_empty() {
            self.runtime = Some(ctx);
        }
        self
    }

    /// Skills text, rendered under an "Available Skills" heading.
    pub fn with_skills(mut self, skills: &str) -> Self {
        self.skills = Some(skills.to_string());
        self
    }

    /// Append a free-form section verbatim.
    pub fn with_section(mut self, section: &str) -> Self {
        if !section.trim().is_empty() {
            self.sections.push(section.to_string());
        }
        self
    }

    /// The full system prompt: `base` followed by skills, runtime context and
    /// any extra sections, separated by blank lines.
    pub fn build_system_prompt(&self, base: &str) -> String {
        let mut content = base.to_string();
        let mut push = |section: &str| {
            if !content.is_empty() {
                content.push_str("\n\n");
            }
            content.push_str(section);
        };
        if let Some(ref skills) = self.skills {
            push(&format!("## Available Skills\n\n{}", skills));
        }
        if let Some(rendered) = self.runtime.as_ref().and_then(RuntimeContext::render) {
            push(&rendered);
        }
        for section in &self.sections {
            push(section);
        }
        content
    }
}

/// Provider-side facts for one call.
#[derive(Debug, Clone)]
pub struct LlmContext {
    pub provider: String,
    pub model: String,
    pub family: ProviderFamily,
    /// Tool schemas in the provider's wire shape
    pub tools: Vec<Value>,
    pub model_max_input_tokens: usize,
}

/// History formatted for one provider call.
#[derive(Debug, Clone)]
pub struct FormattedContext {
    /// Wire messages
    pub messages: Vec<Value>,
    /// Full system text: base prompt, contributor sections, summary notes
    pub system_prompt: String,
    /// Estimated prompt size including system prompt and tool schemas
    pub tokens_used: usize,
    /// Tokens available to history after the reserve
    pub budget: usize,
    /// Set when this call had to compact first
    pub compaction: Option<CompactionCheckpoint>,
}

impl FormattedContext {
    /// The prompt in the shape [`ProviderRequest`](crate::providers::ProviderRequest) takes.
    pub fn prompt(&self) -> WirePrompt {
        WirePrompt {
            system: (!self.system_prompt.is_empty()).then(|| self.system_prompt.clone()),
            messages: self.messages.clone(),
        }
    }
}

/// Owns one session's log and token budget for the duration of a run.
pub struct ContextManager {
    session: Session,
    history: Arc<dyn HistoryProvider>,
    tokenizer: HeuristicTokenizer,
    config: ContextConfig,
    /// Tokens spent on system prompt and tool schemas in the last formatted call
    last_overhead: usize,
    /// Messages included in the last formatted call
    formatted_len: usize,
}

impl ContextManager {
    /// Load `session_id` from `history`, or start a new session.
    ///
    /// A log last written under a different provider family has its tool
    /// traffic flattened to text, because call ids do not carry over.
    pub async fn load(
        session_id: &str,
        history: Arc<dyn HistoryProvider>,
        config: &ContextConfig,
        family: ProviderFamily,
    ) -> Result<Self> {
        let mut session = history
            .load(session_id)
            .await?
            .unwrap_or_else(|| Session::new(session_id));

        let switched = session
            .provider_family
            .is_some_and(|prev| wire_family(prev) != wire_family(family));
        if switched {
            let has_tool_traffic = session
                .messages
                .iter()
                .any(|m| m.has_tool_calls() || m.is_tool_result());
            if has_tool_traffic {
                info!(
                    session_id = %session_id,
                    from = ?session.provider_family,
                    to = ?family,
                    "Flattening tool history for provider switch"
                );
                session.messages = flatten_tool_history(&session.messages);
                history.replace(session_id, &session.messages).await?;
            }
            session.budget.last_actual_tokens = None;
            session.budget.actual_covers_messages = 0;
        }
        if session.provider_family != Some(family) {
            session.provider_family = Some(family);
            if !session.is_empty() {
                history.save_meta(&session).await?;
            }
        }

        Ok(Self {
            session,
            history,
            tokenizer: HeuristicTokenizer::new(family),
            config: config.clone(),
            last_overhead: 0,
            formatted_len: 0,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn messages(&self) -> &[Message] {
        &self.session.messages
    }

    /// Append a user turn with optional attachments.
    pub async fn add_user_message(
        &mut self,
        text: &str,
        image: Option<ImageData>,
        file: Option<FileData>,
    ) -> Result<()> {
        let message = if image.is_none() && file.is_none() {
            Message::user(text)
        } else {
            Message::user_with_attachments(text, image, file)
        };
        self.push(message).await
    }

    /// Append an assistant message and return it. Tool calls get their
    /// `message_id` set to the new message.
    pub async fn add_assistant_message(
        &mut self,
        text: &str,
        tool_calls: Vec<ToolCall>,
        usage: Option<TokenUsage>,
    ) -> Result<Message> {
        let mut message = if tool_calls.is_empty() {
            Message::assistant(text)
        } else {
            Message::assistant_with_tools(text, tool_calls)
        };
        if let Some(usage) = usage.filter(|u| !u.is_empty()) {
            message = message.with_usage(usage);
        }
        self.push(message.clone()).await?;
        Ok(message)
    }

    /// Append the outcome of a tool call.
    pub async fn add_tool_result(&mut self, result: &ToolResult) -> Result<()> {
        let message = Message::tool_result(
            &result.call_id,
            &result.tool_name,
            &result.sanitized,
            !result.success,
        );
        self.push(message).await
    }

    async fn push(&mut self, message: Message) -> Result<()> {
        self.history.append(&self.session.id, &message).await?;
        self.session.add_message(message);
        Ok(())
    }

    /// Format history for one call, compacting first if the estimate is
    /// above `compaction_threshold` of the budget.
    ///
    /// The budget is `min(configured max, model max)` minus the reserve for
    /// the system prompt, tool schemas and the safety buffer.
    pub async fn get_formatted_messages_with_compression(
        &mut self,
        contributor: &ContributorContext,
        llm: &LlmContext,
        base_system_prompt: &str,
    ) -> Result<FormattedContext> {
        let system_prompt = contributor.build_system_prompt(base_system_prompt);
        let overhead = self.tokenizer.estimate_text(&system_prompt)
            + llm
                .tools
                .iter()
                .map(|t| self.tokenizer.estimate_json(t))
                .sum::<usize>();

        let max_input = self
            .config
            .max_input_tokens
            .map_or(llm.model_max_input_tokens, |n| n.min(llm.model_max_input_tokens));
        let reserved = overhead + self.config.safety_buffer_tokens;
        let budget = max_input.saturating_sub(reserved);
        let target = (budget as f64 * self.config.compaction_threshold).floor() as usize;

        let mut history_tokens = self.history_tokens(overhead);
        let mut compaction = None;
        if history_tokens > target {
            let checkpoint = self.compact(history_tokens, target, budget).await?;
            history_tokens = checkpoint.tokens_after + history_tokens.saturating_sub(checkpoint.tokens_before);
            compaction = Some(checkpoint);
        }

        let wire = formatter_for(llm.family).format(&self.session.messages);
        let system_prompt = match wire.system {
            Some(notes) if !system_prompt.is_empty() => format!("{}\n\n{}", system_prompt, notes),
            Some(notes) => notes,
            None => system_prompt,
        };

        self.last_overhead = overhead;
        self.formatted_len = self.session.messages.len();
        self.session.budget.max_input_tokens = max_input;
        self.session.budget.reserved_tokens = reserved;
        self.session.budget.estimated_tokens = history_tokens;

        debug!(
            session_id = %self.session.id,
            model = %llm.model,
            messages = self.formatted_len,
            tokens = overhead + history_tokens,
            budget = budget,
            "Formatted context"
        );

        Ok(FormattedContext {
            messages: wire.messages,
            system_prompt,
            tokens_used: overhead + history_tokens,
            budget,
            compaction,
        })
    }

    /// Replace the running estimate with the provider-reported prompt size
    /// of the last call.
    ///
    /// `prompt_tokens` must already include cache reads; adapters report it
    /// that way. From here on the history estimate is exactly this number
    /// plus estimates for messages appended after that call.
    pub async fn update_actual_token_count(&mut self, prompt_tokens: usize) -> Result<()> {
        self.session.budget.last_actual_tokens = Some(prompt_tokens);
        self.session.budget.actual_covers_messages = self.formatted_len;
        self.session.budget.estimated_tokens = prompt_tokens.saturating_sub(self.last_overhead);
        self.history.save_meta(&self.session).await
    }

    /// Record provider usage for `model` in the session's per-model totals.
    pub fn record_usage(&mut self, model: &str, usage: &TokenUsage) {
        self.session.record_usage(model, usage);
    }

    /// Current estimate of the full prompt (system, tools and history) for
    /// the next call.
    pub fn estimated_prompt_tokens(&self) -> usize {
        self.last_overhead + self.history_tokens(self.last_overhead)
    }

    fn history_tokens(&self, overhead: usize) -> usize {
        let budget = &self.session.budget;
        match budget.last_actual_tokens {
            Some(actual) if budget.actual_covers_messages <= self.session.messages.len() => {
                let tail = &self.session.messages[budget.actual_covers_messages..];
                actual.saturating_sub(overhead) + self.tokenizer.estimate_messages(tail)
            }
            _ => self.tokenizer.estimate_messages(&self.session.messages),
        }
    }

    async fn compact(
        &mut self,
        history_tokens: usize,
        target: usize,
        budget: usize,
    ) -> Result<CompactionCheckpoint> {
        // Reported counts can run ahead of the heuristic. Compaction works in
        // estimate space, so scale the limits by reported/estimated; a fixed
        // offset would stay constant while the log shrinks.
        let estimated = self.tokenizer.estimate_messages(&self.session.messages);
        let scale = DriftScale::new(history_tokens, estimated);
        let settings = CompactionSettings {
            keep_recent_turns: self.config.keep_recent_turns,
            summary_max_chars: self.config.summary_max_chars,
        };
        let compacted = compact(
            self.session.messages.clone(),
            &self.tokenizer,
            scale.to_estimate(target),
            scale.to_estimate(budget),
            settings,
        )
        .map_err(|e| match e {
            ConduitError::ContextOverflow { estimated, .. } => ConduitError::ContextOverflow {
                estimated: scale.to_reported(estimated),
                budget,
            },
            other => other,
        })?;

        let mut checkpoint = compacted.checkpoint;
        checkpoint.tokens_before = history_tokens;
        checkpoint.tokens_after = scale.to_reported(checkpoint.tokens_after);
        checkpoint.target_tokens = target;

        self.history
            .replace(&self.session.id, &compacted.messages)
            .await?;
        self.session.messages = compacted.messages;
        self.session.compactions.push(checkpoint.clone());
        self.session.budget.last_actual_tokens = None;
        self.session.budget.actual_covers_messages = 0;
        self.history.save_meta(&self.session).await?;

        info!(
            session_id = %self.session.id,
            tokens_before = checkpoint.tokens_before,
            tokens_after = checkpoint.tokens_after,
            target = target,
            pruned = checkpoint.pruned_tool_results,
            dropped = checkpoint.dropped_messages,
            phase = ?checkpoint.phase,
            "Compacted conversation history"
        );
        Ok(checkpoint)
    }
}

/// Ratio between the history size the provider reported and the heuristic
/// estimate of the same messages. Identity when the estimate is not lower.
#[derive(Debug, Clone, Copy)]
struct DriftScale {
    reported: usize,
    estimated: usize,
}

impl DriftScale {
    fn new(reported: usize, estimated: usize) -> Self {
        if estimated == 0 || reported <= estimated {
            Self {
                reported: 1,
                estimated: 1,
            }
        } else {
            Self {
                reported,
                estimated,
            }
        }
    }

    /// Rounds down, so a limit never grows in conversion.
    fn to_estimate(self, tokens: usize) -> usize {
        (tokens as u128 * self.estimated as u128 / self.reported as u128) as usize
    }

    /// Rounds up.
    fn to_reported(self, tokens: usize) -> usize {
        let scaled = (tokens as u128 * self.reported as u128).div_ceil(self.estimated as u128);
        scaled as usize
    }
}

/// Families that share a wire format can share tool-call ids.
fn wire_family(family: ProviderFamily) -> ProviderFamily {
    formatter_for(family).family()
}
