//! UTF-8 safe string preview helpers.
//!
//! Take the first N chars of a string without slicing by byte index, which
//! panics on multibyte characters.

/// Return the first `n` characters of `s` as a `String` (no ellipsis).
pub fn prefix_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

/// Return a preview of `s` up to `n` characters. If `s` is longer than `n`
/// characters, the returned string will include a trailing ellipsis `...`.
pub fn preview(s: &str, n: usize) -> String {
    let mut prefix = prefix_chars(s, n);
    if s.chars().count() > n {
        prefix.push_str("...");
    }
    prefix
}

/// Collapse all runs of whitespace (including newlines) into single spaces.
pub fn squash_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate `s` to at most `max_bytes`, backing off to a char boundary.
pub fn truncate_at_char_boundary(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_basic_ascii() {
        let s = "hello world";
        assert_eq!(preview(s, 5), "hello...");
        assert_eq!(preview(s, 20), "hello world");
    }

    #[test]
    fn preview_multibyte_characters() {
        let s = "日本語のテキストです、長い文章";
        let p = preview(s, 4);
        assert_eq!(p, "日本語の...");
    }

    #[test]
    fn squash_whitespace_collapses_newlines() {
        assert_eq!(squash_whitespace("a\n\n  b\tc "), "a b c");
    }

    #[test]
    fn truncate_respects_char_boundary() {
        let mut s = "héllo".to_string();
        truncate_at_char_boundary(&mut s, 2);
        assert_eq!(s, "h");

        let mut short = "abc".to_string();
        truncate_at_char_boundary(&mut short, 10);
        assert_eq!(short, "abc");
    }
}
