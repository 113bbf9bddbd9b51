//! Agent module - the agentic loop and conversation context
//!
//! - [`LLMService`]: runs a user turn as a bounded loop of provider calls and
//!   tool executions for any [`ProviderAdapter`](crate::providers::ProviderAdapter)
//! - [`ContextManager`]: message log, token budget and compaction trigger
//! - [`compaction`]: the deterministic three-phase history compaction
//! - [`stream`]: folds streamed chunks into a batch-equivalent response
//! - [`tokenizer`]: heuristic token estimates per provider family
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────────┐
//! │ RunRequest  │────>│ LLMService  │────>│ ProviderAdapter │
//! └─────────────┘     │             │     │ (Claude/OpenAI) │
//!                     └─────────────┘     └─────────────────┘
//!                       │    │    │
//!                       ▼    │    ▼
//!          ┌────────────────┐│ ┌─────────────┐     ┌─────────────────────┐
//!          │ ContextManager ││ │ ToolManager │────>│ ApprovalCoordinator │
//!          └────────────────┘│ └─────────────┘     └─────────────────────┘
//!                            ▼
//!                  ┌─────────────────┐
//!                  │ SessionEventBus │
//!                  └─────────────────┘
//! ```

pub mod compaction;
mod context;
mod r#loop;
pub mod stream;
pub mod tokenizer;

pub use context::{ContextManager, ContributorContext, FormattedContext, LlmContext, RuntimeContext};
pub use r#loop::{max_iterations_marker, LLMService, LlmServiceConfig, RunRequest};
pub use stream::StreamAssembler;
pub use tokenizer::{HeuristicTokenizer, ProviderFamily, Tokenizer};
