//! Stream assembly.
//!
//! [`StreamAssembler`] folds [`StreamChunk`]s into the same
//! [`ProviderResponse`] the batch path produces. Tool-call fragments are
//! correlated through an arena of partial calls indexed both by stream index
//! and by call id, so a fragment that arrives before its call's start chunk,
//! or carries only one of the two keys, still lands in the right call.

use std::collections::HashMap;

use crate::error::{ConduitError, Result};
use crate::providers::{ProviderResponse, StreamChunk};
use crate::session::{TokenUsage, ToolCall};

#[derive(Debug, Default)]
struct PartialCall {
    index: usize,
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Accumulates one streamed response.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    text: String,
    calls: Vec<PartialCall>,
    by_index: HashMap<usize, usize>,
    by_id: HashMap<String, usize>,
    usage: TokenUsage,
    done: bool,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one chunk. Returns the text delta to forward, if any.
    ///
    /// An [`StreamChunk::Error`] chunk is returned as `Err` so the caller can
    /// run it through the retry policy like any other provider failure.
    pub fn push(&mut self, chunk: StreamChunk) -> Result<Option<String>> {
        match chunk {
            StreamChunk::Text(delta) => {
                self.text.push_str(&delta);
                return Ok(Some(delta));
            }
            StreamChunk::ToolCallStart { index, id, name } => {
                let slot = self.slot(index, Some(&id));
                let call = &mut self.calls[slot];
                call.id = Some(id);
                call.name = Some(name);
            }
            StreamChunk::ToolCallDelta {
                index,
                id,
                arguments,
            } => {
                let slot = self.slot(index, id.as_deref());
                let call = &mut self.calls[slot];
                if call.id.is_none() {
                    call.id = id;
                }
                call.arguments.push_str(&arguments);
            }
            StreamChunk::Usage(usage) => merge_usage(&mut self.usage, &usage),
            StreamChunk::Done => self.done = true,
            StreamChunk::Error(err) => return Err(ConduitError::ProviderTyped(err)),
        }
        Ok(None)
    }

    /// Whether a `Done` chunk has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Text accumulated so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Finish assembly. Calls are ordered by stream index; a call that never
    /// received an id gets `call_<index>`.
    pub fn finish(self) -> ProviderResponse {
        let mut calls = self.calls;
        calls.sort_by_key(|c| c.index);
        let tool_calls = calls
            .into_iter()
            .map(|c| {
                let id = c.id.unwrap_or_else(|| format!("call_{}", c.index));
                ToolCall::from_raw(&id, c.name.as_deref().unwrap_or_default(), &c.arguments)
            })
            .collect();
        ProviderResponse {
            text: self.text,
            tool_calls,
            usage: self.usage,
        }
    }

    fn slot(&mut self, index: usize, id: Option<&str>) -> usize {
        let found = id
            .and_then(|id| self.by_id.get(id).copied())
            .or_else(|| self.by_index.get(&index).copied());
        let slot = match found {
            Some(slot) => slot,
            None => {
                self.calls.push(PartialCall {
                    index,
                    ..Default::default()
                });
                self.calls.len() - 1
            }
        };
        self.by_index.entry(index).or_insert(slot);
        if let Some(id) = id {
            self.by_id.entry(id.to_string()).or_insert(slot);
        }
        slot
    }
}

/// Later reports win field by field; a zero never overwrites a real count.
fn merge_usage(into: &mut TokenUsage, from: &TokenUsage) {
    let pick = |old: u64, new: u64| if new > 0 { new } else { old };
    into.input_tokens = pick(into.input_tokens, from.input_tokens);
    into.output_tokens = pick(into.output_tokens, from.output_tokens);
    into.reasoning_tokens = pick(into.reasoning_tokens, from.reasoning_tokens);
    into.cache_read_tokens = pick(into.cache_read_tokens, from.cache_read_tokens);
    into.cache_write_tokens = pick(into.cache_write_tokens, from.cache_write_tokens);
}
