//! Message formatting between the internal [`Message`] log and provider wire
//! shapes.
//!
//! Each provider family has one [`MessageFormatter`]. Within a family,
//! `parse(format(messages))` reproduces roles, text, attachments, tool calls
//! and tool results. Across families tool-call ids are not portable, so a
//! history written under another family is passed through
//! [`flatten_tool_history`] first, which turns tool traffic into plain text
//! notes.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::agent::tokenizer::ProviderFamily;
use crate::session::{ContentPart, Message, Role};

/// A formatted prompt: the system text plus wire messages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WirePrompt {
    pub system: Option<String>,
    pub messages: Vec<Value>,
}

/// Converts between internal messages and one provider family's wire format.
pub trait MessageFormatter: Send + Sync {
    fn family(&self) -> ProviderFamily;

    /// Format a message log. System messages are merged into
    /// [`WirePrompt::system`] in order, separated by blank lines.
    fn format(&self, messages: &[Message]) -> WirePrompt;

    /// Rebuild internal messages from a wire prompt.
    fn parse(&self, prompt: &WirePrompt) -> Vec<Message>;
}

/// The formatter used for `family`. Generic endpoints speak the OpenAI
/// shape.
pub fn formatter_for(family: ProviderFamily) -> Box<dyn MessageFormatter> {
    match family {
        ProviderFamily::Anthropic => Box::new(super::claude::ClaudeFormatter),
        ProviderFamily::OpenAI | ProviderFamily::Generic => {
            Box::new(super::openai::OpenAIFormatter)
        }
    }
}

/// Rewrite tool calls and tool results as plain text so the log can be sent
/// to a provider family other than the one that produced it.
///
/// Assistant tool calls become a `[called <tool>(<args>)]` line appended to
/// the assistant text; tool results become user messages prefixed with
/// `[<tool> result]` (or `[<tool> error]`). Message ids are preserved.
pub fn flatten_tool_history(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .map(|msg| match msg.role {
            Role::Assistant if msg.has_tool_calls() => {
                let mut text = msg.text();
                for call in msg.tool_calls.iter().flatten() {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(&format!("[called {}({})]", call.name, call.arguments));
                }
                let mut flat = msg.clone();
                flat.tool_calls = None;
                flat.set_text(text);
                flat
            }
            Role::Tool => {
                let tool = msg.tool_name.as_deref().unwrap_or("tool");
                let label = if msg.is_error { "error" } else { "result" };
                let mut flat = msg.clone();
                flat.role = Role::User;
                flat.tool_call_id = None;
                flat.tool_name = None;
                flat.is_error = false;
                flat.set_text(format!("[{} {}] {}", tool, label, msg.text()));
                flat
            }
            _ => msg.clone(),
        })
        .collect()
}

/// Split off system messages, returning their joined text and the rest.
pub(crate) fn split_system(messages: &[Message]) -> (Option<String>, Vec<&Message>) {
    let mut system: Vec<String> = Vec::new();
    let mut rest = Vec::with_capacity(messages.len());
    for msg in messages {
        if msg.role == Role::System {
            let text = msg.text();
            if !text.is_empty() {
                system.push(text);
            }
        } else {
            rest.push(msg);
        }
    }
    let system = if system.is_empty() {
        None
    } else {
        Some(system.join("\n\n"))
    };
    (system, rest)
}

/// Text parts only, joined by newlines. Used for assistant content.
pub(crate) fn text_parts(parts: &[ContentPart]) -> String {
    let mut out = String::new();
    for part in parts {
        if let ContentPart::Text { text } = part {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(text);
        }
    }
    out
}

static FILE_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)\A<file name="([^"]*)" type="([^"]*)">\n(.*)\n</file>\z"#).unwrap()
});

/// Render an attached text file as a tagged text block.
///
/// Neither wire format has a portable text-file part, so both formatters
/// inline files this way and recognize the same shape on parse.
pub(crate) fn file_block(name: &str, media_type: &str, content: &str) -> String {
    format!(
        "<file name=\"{}\" type=\"{}\">\n{}\n</file>",
        name.replace('"', "'"),
        media_type.replace('"', "'"),
        content
    )
}

/// Inverse of [`file_block`]: the content part for `text`.
pub(crate) fn text_or_file(text: &str) -> ContentPart {
    match FILE_BLOCK.captures(text) {
        Some(caps) => ContentPart::File {
            name: caps[1].to_string(),
            media_type: caps[2].to_string(),
            content: caps[3].to_string(),
        },
        None => ContentPart::text(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ToolCall;
    use serde_json::json;

    #[test]
    fn test_flatten_tool_history() {
        let call = ToolCall::new("toolu_1", "read_file", json!({"path": "a.txt"}));
        let assistant = Message::assistant_with_tools("Let me look.", vec![call]);
        let result = Message::tool_result("toolu_1", "read_file", "hello", false);
        let flat = flatten_tool_history(&[Message::user("hi"), assistant.clone(), result]);

        assert_eq!(flat.len(), 3);
        assert!(!flat[1].has_tool_calls());
        assert_eq!(flat[1].id, assistant.id);
        assert_eq!(
            flat[1].text(),
            "Let me look.\n[called read_file({\"path\":\"a.txt\"})]"
        );
        assert_eq!(flat[2].role, Role::User);
        assert_eq!(flat[2].text(), "[read_file result] hello");
        assert!(flat[2].tool_call_id.is_none());
    }

    #[test]
    fn test_file_block_round_trip() {
        let text = file_block("notes.md", "text/markdown", "# Title\n\nbody");
        assert_eq!(
            text_or_file(&text),
            ContentPart::File {
                name: "notes.md".into(),
                media_type: "text/markdown".into(),
                content: "# Title\n\nbody".into(),
            }
        );
        assert_eq!(text_or_file("plain"), ContentPart::text("plain"));
    }

    #[test]
    fn test_split_system_joins_in_order() {
        let msgs = vec![
            Message::system("one"),
            Message::user("hi"),
            Message::system("two"),
        ];
        let (system, rest) = split_system(&msgs);
        assert_eq!(system.as_deref(), Some("one\n\ntwo"));
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn test_formatter_for_generic_uses_openai_shape() {
        assert_eq!(
            formatter_for(ProviderFamily::Generic).family(),
            ProviderFamily::OpenAI
        );
        assert_eq!(
            formatter_for(ProviderFamily::Anthropic).family(),
            ProviderFamily::Anthropic
        );
    }
}
