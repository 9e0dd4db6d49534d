use crate::error::FormattingError;
use regex::Regex;
use tutorloop_core::config::PromptSettings;
use tutorloop_core::{HistoryMessage, Role};

pub const SYSTEM_MARKER: &str = "<|system|>";
pub const USER_MARKER: &str = "<|user|>";
pub const ASSISTANT_MARKER: &str = "<|assistant|>";
pub const END_MARKER: &str = "<|end|>";

const PAST_CONTEXT_START: &str = "===PAST CONVERSATION FOR CONTEXT===";
const PAST_CONTEXT_END: &str = "===PAST CONVERSATION FOR CONTEXT END===";
const CURRENT_CONTEXT_START: &str = "===CURRENT CONVERSATION FOR CONTEXT===";
const CURRENT_CONTEXT_END: &str = "===CURRENT CONVERSATION FOR CONTEXT END===";

/// Strips chat markup that leaked into a raw user message.
///
/// A `<|user|> ... <|end|>` pair is taken to wrap the real message. A leading
/// user marker is dropped, anything from an assistant marker onwards is cut,
/// and `User:` labels are removed wherever they appear.
#[derive(Debug, Clone)]
pub struct MessageSanitizer {
    user_label: Regex,
}

impl Default for MessageSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageSanitizer {
    pub fn new() -> Self {
        Self {
            user_label: Regex::new(r"User\s*:").expect("Valid user label regex"),
        }
    }

    pub fn sanitize(&self, raw: &str) -> String {
        let mut message = raw.to_string();

        if let Some(start) = message.find(USER_MARKER) {
            let inner = start + USER_MARKER.len();
            if let Some(len) = message[inner..].find(END_MARKER) {
                message = message[inner..inner + len].trim().to_string();
            }
        }

        if let Some(rest) = message.strip_prefix(USER_MARKER) {
            message = rest.trim().to_string();
        }

        if let Some((before, _)) = message.split_once(ASSISTANT_MARKER) {
            message = before.trim().to_string();
        }

        self.user_label.replace_all(&message, "").trim().to_string()
    }
}

/// Builds the single text blob handed to the generation engine.
///
/// Layout, pieces joined by newlines:
///
/// ```text
/// ===PAST CONVERSATION FOR CONTEXT===
/// <up to context_window - 1 prior turns>
/// ===PAST CONVERSATION FOR CONTEXT END===
/// <|system|> instruction <|end|>
/// ===CURRENT CONVERSATION FOR CONTEXT===
/// <up to recent_window - 1 prior turns, repeated>
/// ===CURRENT CONVERSATION FOR CONTEXT END===
/// <|user|> message <|end|>
/// <|assistant|>
/// ```
///
/// The recent turns are deliberately repeated after the system block.
#[derive(Debug, Clone)]
pub struct PromptFormatter {
    system_prompt: String,
    context_window: usize,
    recent_window: usize,
    max_prompt_chars: Option<usize>,
    sanitizer: MessageSanitizer,
}

impl PromptFormatter {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            context_window: 100,
            recent_window: 5,
            max_prompt_chars: None,
            sanitizer: MessageSanitizer::new(),
        }
    }

    pub fn from_settings(settings: &PromptSettings) -> Self {
        Self {
            system_prompt: settings.system_prompt.clone(),
            context_window: settings.context_window,
            recent_window: settings.recent_window,
            max_prompt_chars: settings.max_prompt_chars,
            sanitizer: MessageSanitizer::new(),
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn sanitize(&self, raw: &str) -> String {
        self.sanitizer.sanitize(raw)
    }

    /// Format `history` (stored turns, oldest first, excluding the current
    /// message) followed by the current `message`. Pure: equal inputs give
    /// byte-identical output.
    pub fn format(
        &self,
        history: &[HistoryMessage],
        message: &str,
    ) -> Result<String, FormattingError> {
        if message.trim().is_empty() {
            return Err(FormattingError::EmptyMessage);
        }

        // Windows count the current message, which is rendered separately.
        let past = tail(history, self.context_window.saturating_sub(1));
        let recent = tail(history, self.recent_window.saturating_sub(1));

        let mut pieces = Vec::with_capacity(past.len() + recent.len() + 4);
        pieces.push(format!("{}\n", PAST_CONTEXT_START));
        pieces.extend(past.iter().map(render_turn));
        pieces.push(format!(
            "\n{}\n{}\n{}\n{}\n{}",
            PAST_CONTEXT_END, SYSTEM_MARKER, self.system_prompt, END_MARKER, CURRENT_CONTEXT_START
        ));
        pieces.extend(recent.iter().map(render_turn));
        pieces.push(format!(
            "\n{}\n{}\n{}{}",
            CURRENT_CONTEXT_END, USER_MARKER, message, END_MARKER
        ));
        pieces.push(ASSISTANT_MARKER.to_string());

        let prompt = pieces.join("\n");

        if let Some(max) = self.max_prompt_chars {
            let len = prompt.chars().count();
            if len > max {
                return Err(FormattingError::TooLong { len, max });
            }
        }

        Ok(prompt)
    }
}

fn tail(history: &[HistoryMessage], n: usize) -> &[HistoryMessage] {
    &history[history.len().saturating_sub(n)..]
}

fn render_turn(message: &HistoryMessage) -> String {
    let marker = match message.role {
        Role::User => USER_MARKER,
        Role::Assistant => ASSISTANT_MARKER,
    };
    format!("{}\n{}{}", marker, message.content, END_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turns(n: usize) -> Vec<HistoryMessage> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    HistoryMessage::user(format!("turn {}.", i))
                } else {
                    HistoryMessage::assistant(format!("turn {}.", i))
                }
            })
            .collect()
    }

    #[test]
    fn test_first_turn_layout() {
        let formatter = PromptFormatter::new("SYS");
        let prompt = formatter.format(&[], "Yesterday I go to park").unwrap();
        assert_eq!(
            prompt,
            "===PAST CONVERSATION FOR CONTEXT===\n\n\n\
             ===PAST CONVERSATION FOR CONTEXT END===\n<|system|>\nSYS\n<|end|>\n\
             ===CURRENT CONVERSATION FOR CONTEXT===\n\n\
             ===CURRENT CONVERSATION FOR CONTEXT END===\n<|user|>\nYesterday I go to park<|end|>\n\
             <|assistant|>"
        );
    }

    #[test]
    fn test_default_persona_is_embedded_verbatim() {
        let formatter = PromptFormatter::from_settings(&PromptSettings::default());
        let prompt = formatter.format(&[], "Me want to going store").unwrap();
        assert!(prompt.contains("<|system|>\n\nYou are Emma, a friendly AI English"));
        assert!(prompt.contains("3. **Double Correction**\nUser: \"Me want to going store\""));
        assert!(prompt.contains("   Example:\n   User: \"I eat breakfast already\""));
        assert!(prompt.contains("What do you need to buy?\"\n\n<|end|>\n===CURRENT"));
    }

    #[test]
    fn test_recent_turns_are_repeated() {
        let formatter = PromptFormatter::new("SYS");
        let history = turns(7);
        let prompt = formatter.format(&history, "now").unwrap();

        // Last four stored turns appear in both sections.
        for i in 3..7 {
            assert_eq!(prompt.matches(&format!("turn {}.", i)).count(), 2, "turn {}", i);
        }
        for i in 0..3 {
            assert_eq!(prompt.matches(&format!("turn {}.", i)).count(), 1, "turn {}", i);
        }

        let system_at = prompt.find("<|system|>").unwrap();
        let first_repeat = prompt.rfind("turn 3.").unwrap();
        assert!(first_repeat > system_at);
        assert!(prompt.contains("<|assistant|>\nturn 1.<|end|>"));
        assert!(prompt.ends_with("<|user|>\nnow<|end|>\n<|assistant|>"));
    }

    #[test]
    fn test_context_window_is_bounded() {
        let formatter = PromptFormatter::new("SYS");
        let history = turns(150);
        let prompt = formatter.format(&history, "now").unwrap();

        assert!(!prompt.contains("turn 50."));
        assert!(prompt.contains("turn 51."));
        assert_eq!(prompt.matches("<|end|>").count(), 99 + 1 + 4 + 1);
    }

    #[test]
    fn test_formatting_is_deterministic() {
        let formatter = PromptFormatter::new("SYS");
        let history = turns(12);
        let a = formatter.format(&history, "She is doctor").unwrap();
        let b = formatter.format(&history, "She is doctor").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_message_is_rejected() {
        let formatter = PromptFormatter::new("SYS");
        assert!(matches!(
            formatter.format(&[], "   "),
            Err(FormattingError::EmptyMessage)
        ));
    }

    #[test]
    fn test_prompt_length_limit() {
        let settings = PromptSettings {
            system_prompt: "SYS".into(),
            max_prompt_chars: Some(50),
            ..Default::default()
        };
        let formatter = PromptFormatter::from_settings(&settings);
        assert!(matches!(
            formatter.format(&[], "hello"),
            Err(FormattingError::TooLong { max: 50, .. })
        ));
    }

    #[test]
    fn test_sanitize_extracts_wrapped_message() {
        let sanitizer = MessageSanitizer::new();
        assert_eq!(
            sanitizer.sanitize("<|user|> I eat breakfast already<|end|><|assistant|>"),
            "I eat breakfast already"
        );
    }

    #[test]
    fn test_sanitize_strips_labels_and_assistant_tail() {
        let formatter = PromptFormatter::new("SYS");
        assert_eq!(formatter.sanitize("<|user|>hello there"), "hello there");
        assert_eq!(formatter.sanitize("hi<|assistant|>Sure!"), "hi");
        assert_eq!(formatter.sanitize("User: She is doctor"), "She is doctor");
        assert_eq!(formatter.sanitize("User :me want go"), "me want go");
        assert_eq!(formatter.sanitize("plain text"), "plain text");
    }
}
