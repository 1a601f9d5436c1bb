//! Outgoing message formatting.

use std::borrow::Cow;

/// Telegram's hard limit on message bodies.
pub const MAX_MESSAGE_LEN: usize = 4096;

const TRUNCATION_MARKER: &str = "\n[truncated]";

/// Clamp a body to [`MAX_MESSAGE_LEN`] characters, appending a marker when
/// anything was dropped. Cuts on a char boundary.
pub fn truncate_message(text: &str) -> Cow<'_, str> {
    if text.chars().count() <= MAX_MESSAGE_LEN {
        return Cow::Borrowed(text);
    }
    let keep = MAX_MESSAGE_LEN - TRUNCATION_MARKER.chars().count();
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(TRUNCATION_MARKER);
    Cow::Owned(out)
}

/// One-line label for a tool invocation in the coalesced tool message.
pub fn tool_line(name: &str, input: &serde_json::Value) -> String {
    let detail = input
        .get("command")
        .or_else(|| input.get("file_path"))
        .or_else(|| input.get("path"))
        .or_else(|| input.get("url"))
        .or_else(|| input.get("pattern"))
        .and_then(serde_json::Value::as_str);

    match detail {
        Some(detail) => {
            let mut snippet: String = detail.chars().take(120).collect();
            if detail.chars().count() > 120 {
                snippet.push('…');
            }
            format!("🔧 {name}: {snippet}")
        }
        None => format!("🔧 {name}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_message_untouched() {
        let body = "hello";
        assert!(matches!(truncate_message(body), Cow::Borrowed(_)));
    }

    #[test]
    fn test_long_message_truncated_with_marker() {
        let body = "x".repeat(MAX_MESSAGE_LEN + 100);
        let out = truncate_message(&body);
        assert_eq!(out.chars().count(), MAX_MESSAGE_LEN);
        assert!(out.ends_with("[truncated]"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let body = "é".repeat(MAX_MESSAGE_LEN + 10);
        let out = truncate_message(&body);
        assert!(out.ends_with("[truncated]"));
    }

    #[test]
    fn test_tool_line_detail_extraction() {
        let input = serde_json::json!({"command": "grep -r TODO ."});
        assert_eq!(tool_line("Bash", &input), "🔧 Bash: grep -r TODO .");

        let input = serde_json::json!({"file_path": "/tmp/a.rs"});
        assert_eq!(tool_line("Edit", &input), "🔧 Edit: /tmp/a.rs");

        let input = serde_json::json!({"questions": []});
        assert_eq!(tool_line("AskUserQuestion", &input), "🔧 AskUserQuestion");
    }
}
