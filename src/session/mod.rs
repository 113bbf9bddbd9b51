//! Session module - conversation state and persistence
//!
//! - [`types`]: messages, tool calls, token budget and compaction records
//! - [`usage`]: provider token usage and per-model cost tracking
//! - [`history`]: the [`HistoryProvider`] storage seam with memory and
//!   JSONL file implementations
//!
//! # Example
//!
//! ```
//! use conduit::session::{HistoryProvider, MemoryHistoryProvider, Message};
//!
//! #[tokio::main]
//! async fn main() {
//!     let history = MemoryHistoryProvider::new();
//!     history.append("cli:1", &Message::user("Hello!")).await.unwrap();
//!
//!     let session = history.load("cli:1").await.unwrap().unwrap();
//!     assert_eq!(session.messages.len(), 1);
//! }
//! ```

pub mod history;
pub mod types;
pub mod usage;

pub use history::{FileHistoryProvider, HistoryProvider, MemoryHistoryProvider};
pub use types::{
    CompactionCheckpoint, CompactionPhase, ContentPart, FileData, ImageData, Message, Role,
    Session, TokenBudget, ToolCall,
};
pub use usage::{ModelUsage, TokenUsage};
