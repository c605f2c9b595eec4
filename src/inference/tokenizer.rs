//! Tokenizer capability used to align cache prefixes with backend tokens.
//!
//! The tokenizer handed to the prefix cache should split text the same way
//! the backend does. A mismatch never corrupts output; it only makes prefix
//! reuse under- or over-count.

/// Splits text into ordered token strings and joins them back.
pub trait Tokenizer: Send + Sync {
    /// Ordered tokens of `text`. Calling it twice on the same text yields the
    /// same sequence.
    fn tokenize(&self, text: &str) -> Vec<String>;

    /// Rebuild text from tokens. May be lossy with respect to the original.
    fn join(&self, tokens: &[String]) -> String;
}

/// Splits on space, tab, newline and carriage return; joins with one space.
///
/// Joining loses the original inter-token spacing, which is fine for cache
/// keys and wrong for anything shown to a user.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceTokenizer;

fn is_separator(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\r')
}

impl Tokenizer for WhitespaceTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        text.split(is_separator)
            .filter(|span| !span.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn join(&self, tokens: &[String]) -> String {
        tokens.join(" ")
    }
}
