//! Deterministic history compaction.
//!
//! History is split into a preamble (leading system notes) and turns, where a
//! turn starts at a user message and runs up to the next one, so an
//! assistant's tool calls and their results always share a turn. The most
//! recent `keep_recent_turns` turns form the recent window.
//!
//! Phases run in order and stop as soon as the estimate is at or below the
//! target:
//!
//! 1. Prune tool-result payloads outside the recent window, oldest first.
//! 2. Drop the oldest turns outside the recent window, folding their text
//!    into one `[Conversation Summary]` system note.
//! 3. Prune tool results inside the recent window, then drop recent turns
//!    (oldest first) until only the last turn remains.
//!
//! If the result still exceeds the hard budget the run fails with
//! [`ConduitError::ContextOverflow`] and the caller's history is untouched.

use std::collections::VecDeque;

use chrono::Utc;

use crate::error::{ConduitError, Result};
use crate::session::{CompactionCheckpoint, CompactionPhase, Message, Role};
use crate::utils::string::{prefix_chars, squash_whitespace};

use super::tokenizer::Tokenizer;

/// First line of every summary note.
pub const SUMMARY_HEADER: &str = "[Conversation Summary]";

/// Prefix of a pruned tool-result placeholder.
pub const PRUNED_PREFIX: &str = "[tool result pruned:";

/// Characters kept from each dropped message in the summary.
const SUMMARY_LINE_CHARS: usize = 120;

/// Knobs for one compaction run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionSettings {
    pub keep_recent_turns: usize,
    pub summary_max_chars: usize,
}

/// A successful compaction.
#[derive(Debug, Clone)]
pub struct Compacted {
    pub messages: Vec<Message>,
    pub checkpoint: CompactionCheckpoint,
}

/// Placeholder text for a pruned tool result.
///
/// ```
/// use conduit::agent::compaction::pruned_placeholder;
///
/// assert_eq!(pruned_placeholder("shell", 2048), "[tool result pruned: shell, 2048 bytes]");
/// ```
pub fn pruned_placeholder(tool: &str, bytes: usize) -> String {
    format!("{} {}, {} bytes]", PRUNED_PREFIX, tool, bytes)
}

/// Whether `msg` is a summary note produced by an earlier compaction.
pub fn is_summary_note(msg: &Message) -> bool {
    msg.role == Role::System && msg.text().starts_with(SUMMARY_HEADER)
}

struct Entry {
    msg: Message,
    tokens: usize,
}

struct Working<'a> {
    tokenizer: &'a dyn Tokenizer,
    settings: CompactionSettings,
    preamble: Vec<Entry>,
    turns: VecDeque<Vec<Entry>>,
    /// Summary text carried over from an earlier note, without its header
    prior_summary: Option<String>,
    /// The earlier note itself, reused unchanged when nothing new is dropped
    prior_note: Option<Message>,
    summary_lines: Vec<String>,
    summary_tokens: usize,
    body_tokens: usize,
    pruned: usize,
    dropped: usize,
}

impl<'a> Working<'a> {
    fn new(messages: Vec<Message>, tokenizer: &'a dyn Tokenizer, settings: CompactionSettings) -> Self {
        let mut working = Self {
            tokenizer,
            settings,
            preamble: Vec::new(),
            turns: VecDeque::new(),
            prior_summary: None,
            prior_note: None,
            summary_lines: Vec::new(),
            summary_tokens: 0,
            body_tokens: 0,
            pruned: 0,
            dropped: 0,
        };

        let mut in_preamble = true;
        for msg in messages {
            if in_preamble && msg.role == Role::System {
                if is_summary_note(&msg) && working.prior_note.is_none() {
                    let text = msg.text();
                    working.prior_summary = Some(
                        text[SUMMARY_HEADER.len()..].trim_start_matches('\n').to_string(),
                    );
                    working.summary_tokens = tokenizer.estimate_message(&msg);
                    working.prior_note = Some(msg);
                    continue;
                }
                let tokens = tokenizer.estimate_message(&msg);
                working.body_tokens += tokens;
                working.preamble.push(Entry { msg, tokens });
                continue;
            }
            in_preamble = false;
            if msg.role == Role::User || working.turns.is_empty() {
                working.turns.push_back(Vec::new());
            }
            let tokens = tokenizer.estimate_message(&msg);
            working.body_tokens += tokens;
            if let Some(turn) = working.turns.back_mut() {
                turn.push(Entry { msg, tokens });
            }
        }
        working
    }

    fn total(&self) -> usize {
        self.body_tokens + self.summary_tokens
    }

    fn old_turn_count(&self) -> usize {
        self.turns.len().saturating_sub(self.settings.keep_recent_turns)
    }

    /// Prune tool results in turns `[from, to)`, oldest first, until the
    /// total reaches `target`. Returns whether the target was reached.
    fn prune_tool_results(&mut self, from: usize, to: usize, target: usize) -> bool {
        for t in from..to {
            for i in 0..self.turns[t].len() {
                if self.total() <= target {
                    return true;
                }
                let entry = &mut self.turns[t][i];
                if entry.msg.role != Role::Tool {
                    continue;
                }
                let text = entry.msg.text();
                if text.starts_with(PRUNED_PREFIX) {
                    continue;
                }
                let placeholder =
                    pruned_placeholder(entry.msg.tool_name.as_deref().unwrap_or("tool"), text.len());
                entry.msg.set_text(placeholder);
                let tokens = self.tokenizer.estimate_message(&entry.msg);
                self.body_tokens = self.body_tokens - entry.tokens + tokens;
                entry.tokens = tokens;
                self.pruned += 1;
            }
        }
        self.total() <= target
    }

    /// Drop turns from the front while more than `keep` remain and the total
    /// exceeds `target`.
    fn drop_turns(&mut self, keep: usize, target: usize) -> bool {
        while self.total() > target && self.turns.len() > keep {
            let Some(turn) = self.turns.pop_front() else {
                break;
            };
            for entry in turn {
                self.body_tokens -= entry.tokens;
                self.dropped += 1;
                if let Some(line) = summary_line(&entry.msg) {
                    self.summary_lines.push(line);
                }
            }
            self.summary_tokens = self.tokenizer.estimate_message(&self.summary_note());
        }
        self.total() <= target
    }

    fn summary_text(&self) -> String {
        let mut text = self.prior_summary.clone().unwrap_or_default();
        for line in &self.summary_lines {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(line);
        }
        let max = self.settings.summary_max_chars;
        let count = text.chars().count();
        if count > max {
            // keep the most recent part
            let tail: String = text.chars().skip(count - max).collect();
            text = format!("...{}", tail);
        }
        text
    }

    fn summary_note(&self) -> Message {
        Message::system(&format!("{}\n{}", SUMMARY_HEADER, self.summary_text()))
    }

    fn into_messages(self) -> Vec<Message> {
        let note = if !self.summary_lines.is_empty() {
            Some(self.summary_note())
        } else {
            self.prior_note.clone()
        };
        let mut out: Vec<Message> = self.preamble.into_iter().map(|e| e.msg).collect();
        out.extend(note);
        for turn in self.turns {
            out.extend(turn.into_iter().map(|e| e.msg));
        }
        out
    }
}

/// One extractive line for a dropped message, or `None` if it carries
/// nothing worth keeping. Tool results are left out; the call that produced
/// them is noted on the assistant line.
fn summary_line(msg: &Message) -> Option<String> {
    match msg.role {
        Role::Tool => None,
        _ => {
            let mut line = squash_whitespace(&msg.text());
            let calls: Vec<&str> = msg
                .tool_calls
                .iter()
                .flatten()
                .map(|c| c.name.as_str())
                .collect();
            if !calls.is_empty() {
                if !line.is_empty() {
                    line.push(' ');
                }
                line.push_str(&format!("(called {})", calls.join(", ")));
            }
            if line.is_empty() {
                return None;
            }
            let mut clipped = prefix_chars(&line, SUMMARY_LINE_CHARS);
            if clipped.len() < line.len() {
                clipped.push_str("...");
            }
            Some(format!("- {}: {}", msg.role, clipped))
        }
    }
}

/// Compact `messages` until their estimate is at or below `target`.
///
/// `budget` is the hard limit: if the best achievable result is still above
/// it, returns [`ConduitError::ContextOverflow`].
pub fn compact(
    messages: Vec<Message>,
    tokenizer: &dyn Tokenizer,
    target: usize,
    budget: usize,
    settings: CompactionSettings,
) -> Result<Compacted> {
    let mut working = Working::new(messages, tokenizer, settings);
    let tokens_before = working.total();

    let old = working.old_turn_count();
    let mut phase = CompactionPhase::PruneToolResults;
    let mut done = working.prune_tool_results(0, old, target);

    if !done {
        phase = CompactionPhase::DropOldTurns;
        let keep = settings.keep_recent_turns.max(1);
        done = working.drop_turns(keep, target);
    }

    if !done {
        phase = CompactionPhase::ShrinkRecent;
        let len = working.turns.len();
        done = working.prune_tool_results(0, len, target);
        if !done {
            working.drop_turns(1, target);
        }
    }

    let tokens_after = working.total();
    if tokens_after > budget {
        return Err(ConduitError::ContextOverflow {
            estimated: tokens_after,
            budget,
        });
    }

    let checkpoint = CompactionCheckpoint {
        timestamp: Utc::now(),
        tokens_before,
        tokens_after,
        target_tokens: target,
        pruned_tool_results: working.pruned,
        dropped_messages: working.dropped,
        summarized: !working.summary_lines.is_empty(),
        phase,
    };
    Ok(Compacted {
        messages: working.into_messages(),
        checkpoint,
    })
}
