//! Tool result sanitization.
//!
//! Strips base64 data URIs, long hex blobs and terminal escape sequences,
//! then truncates oversized results before they are fed back to the model.
//! The raw payload is kept separately for the UI.

use once_cell::sync::Lazy;
use regex::Regex;

use super::string::truncate_at_char_boundary;

/// Default maximum result size in bytes (50 KB).
pub const DEFAULT_MAX_RESULT_BYTES: usize = 51_200;

/// Minimum length of a contiguous hex string to be stripped.
const MIN_HEX_BLOB_LEN: usize = 200;

static BASE64_URI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"data:[a-zA-Z0-9/+\-\.]+;base64,[A-Za-z0-9+/=]+").expect("static regex")
});

static HEX_BLOB_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"[0-9a-fA-F]{{{},}}", MIN_HEX_BLOB_LEN)).expect("static regex")
});

static ANSI_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("static regex"));

/// Sanitize a tool result string.
///
/// 1. Remove ANSI escape sequences.
/// 2. Replace `data:...;base64,...` URIs with a placeholder.
/// 3. Replace hex blobs (>= 200 hex chars) with a placeholder.
/// 4. Truncate to `max_bytes` if still too large.
pub fn sanitize_tool_result(result: &str, max_bytes: usize) -> String {
    let mut out = ANSI_ESCAPE_RE.replace_all(result, "").into_owned();

    out = BASE64_URI_RE
        .replace_all(&out, |caps: &regex::Captures| {
            format!("[base64 data removed, {} bytes]", caps[0].len())
        })
        .into_owned();

    out = HEX_BLOB_RE
        .replace_all(&out, |caps: &regex::Captures| {
            format!("[hex data removed, {} chars]", caps[0].len())
        })
        .into_owned();

    if out.len() > max_bytes {
        let total = out.len();
        truncate_at_char_boundary(&mut out, max_bytes);
        out.push_str(&format!("\n...[truncated, {} total bytes]", total));
    }

    out
}

/// Render a JSON tool payload as model-facing text.
///
/// Strings pass through unquoted; everything else is compact JSON.
pub fn render_payload(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_no_change_for_normal_text() {
        let input = "Hello, world! This is a normal tool result.";
        assert_eq!(sanitize_tool_result(input, DEFAULT_MAX_RESULT_BYTES), input);
    }

    #[test]
    fn test_strips_base64_data_uri() {
        let b64 = "A".repeat(500);
        let input = format!("before data:image/png;base64,{} after", b64);
        let result = sanitize_tool_result(&input, DEFAULT_MAX_RESULT_BYTES);
        assert!(!result.contains(&b64));
        assert!(result.contains("[base64 data removed,"));
        assert!(result.starts_with("before"));
        assert!(result.ends_with("after"));
    }

    #[test]
    fn test_strips_hex_blob() {
        let hex = "a1b2c3d4e5f6".repeat(40);
        let input = format!("prefix {} suffix", hex);
        let result = sanitize_tool_result(&input, DEFAULT_MAX_RESULT_BYTES);
        assert!(!result.contains(&hex));
        assert!(result.contains("[hex data removed, 480 chars]"));
    }

    #[test]
    fn test_short_hex_not_stripped() {
        let result = sanitize_tool_result("hash: abcdef1234", DEFAULT_MAX_RESULT_BYTES);
        assert!(result.contains("abcdef1234"));
    }

    #[test]
    fn test_strips_ansi_escapes() {
        let result = sanitize_tool_result("\x1b[31mred\x1b[0m text", DEFAULT_MAX_RESULT_BYTES);
        assert_eq!(result, "red text");
    }

    #[test]
    fn test_truncation() {
        let input = "x".repeat(1000);
        let result = sanitize_tool_result(&input, 100);
        assert!(result.starts_with(&"x".repeat(100)));
        assert!(result.contains("[truncated, 1000 total bytes]"));
    }

    #[test]
    fn test_truncation_multibyte() {
        let input = "é".repeat(100);
        let result = sanitize_tool_result(&input, 51);
        assert!(result.starts_with(&"é".repeat(25)));
        assert!(result.contains("[truncated, 200 total bytes]"));
    }

    #[test]
    fn test_render_payload() {
        assert_eq!(render_payload(&json!("plain")), "plain");
        assert_eq!(render_payload(&json!({"a": 1})), r#"{"a":1}"#);
        assert_eq!(render_payload(&serde_json::Value::Null), "");
    }
}
