//! Token estimates for memory budgeting.
//!
//! Four bytes to a token, rounded up. Good enough to keep history inside the
//! model's window without shipping a tokenizer per model.

use docchat_core::message::Message;

/// Role and delimiter framing around every message.
const MESSAGE_FRAMING: usize = 4;

pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Content, tool-call names and arguments, plus framing.
pub fn estimate_message_tokens(message: &Message) -> usize {
    let calls: usize = message
        .tool_calls
        .iter()
        .map(|c| estimate_tokens(&c.name) + estimate_tokens(&c.arguments))
        .sum();
    MESSAGE_FRAMING + estimate_tokens(&message.content) + calls
}

#[cfg(test)]
mod tests {
    use super::*;
    use docchat_core::message::MessageToolCall;

    #[test]
    fn rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("hello"), 2);
        assert_eq!(estimate_tokens(&"a".repeat(100)), 25);
    }

    #[test]
    fn tool_calls_count_toward_a_message() {
        let plain = Message::assistant("");
        assert_eq!(estimate_message_tokens(&plain), 4);

        let calling = Message::assistant("").with_tool_calls(vec![MessageToolCall {
            id: "c1".into(),
            name: "document_tool_0".into(),
            arguments: r#"{"input":"revenue by region"}"#.into(),
        }]);
        assert!(estimate_message_tokens(&calling) > estimate_message_tokens(&plain) + 8);
    }
}
