//! Text analysis: turning field text into a stream of tokens.
//!
//! The index writer only consumes the [`Analyzer`] trait. Each call to
//! [`Analyzer::token_stream`] returns a fresh stream, so one analyzer can
//! serve any number of fields and threads.

use std::fmt::Debug;

use unicode_segmentation::UnicodeSegmentation;

use crate::error::Result;

/// A single token produced by an analyzer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// The token text.
    pub text: String,
    /// Distance from the previous token's position. Zero stacks the token on
    /// the previous position (synonyms).
    pub position_increment: u32,
    /// Byte offset of the first character in the source text.
    pub start_offset: u32,
    /// Byte offset one past the last character in the source text.
    pub end_offset: u32,
    /// Optional per-position payload.
    pub payload: Option<Vec<u8>>,
}

impl Token {
    /// Create a token at the next position.
    pub fn new<S: Into<String>>(text: S, start_offset: u32, end_offset: u32) -> Self {
        Token {
            text: text.into(),
            position_increment: 1,
            start_offset,
            end_offset,
            payload: None,
        }
    }

    /// Set the position increment.
    pub fn with_position_increment(mut self, increment: u32) -> Self {
        self.position_increment = increment;
        self
    }

    /// Attach a payload.
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// A stream of tokens.
pub type TokenStream = Box<dyn Iterator<Item = Token> + Send>;

/// Converts text into tokens.
pub trait Analyzer: Send + Sync + Debug {
    /// Analyze `text` from `field`.
    fn token_stream(&self, field: &str, text: &str) -> Result<TokenStream>;

    /// Position gap inserted between values of a multi-valued field.
    fn position_increment_gap(&self, _field: &str) -> u32 {
        0
    }

    /// Offset gap inserted between values of a multi-valued field.
    fn offset_gap(&self, _field: &str) -> u32 {
        1
    }

    /// Get the name of this analyzer.
    fn name(&self) -> &'static str;
}

/// Splits on Unicode word boundaries and lowercases.
#[derive(Debug, Clone, Default)]
pub struct StandardAnalyzer {
    /// Tokens longer than this (in bytes) are dropped.
    pub max_token_length: usize,
}

impl StandardAnalyzer {
    /// Create an analyzer with the default maximum token length (255).
    pub fn new() -> Self {
        StandardAnalyzer {
            max_token_length: 255,
        }
    }
}

impl Analyzer for StandardAnalyzer {
    fn token_stream(&self, _field: &str, text: &str) -> Result<TokenStream> {
        let max_len = if self.max_token_length == 0 {
            255
        } else {
            self.max_token_length
        };
        let mut skipped = 0u32;
        let tokens: Vec<Token> = text
            .unicode_word_indices()
            .filter_map(|(start, word)| {
                if word.len() > max_len {
                    skipped += 1;
                    return None;
                }
                let increment = 1 + std::mem::take(&mut skipped);
                Some(
                    Token::new(
                        word.to_lowercase(),
                        start as u32,
                        (start + word.len()) as u32,
                    )
                    .with_position_increment(increment),
                )
            })
            .collect();
        Ok(Box::new(tokens.into_iter()))
    }

    fn name(&self) -> &'static str {
        "standard"
    }
}

/// Emits the whole input as a single token.
#[derive(Debug, Clone, Default)]
pub struct KeywordAnalyzer;

impl Analyzer for KeywordAnalyzer {
    fn token_stream(&self, _field: &str, text: &str) -> Result<TokenStream> {
        let token = Token::new(text, 0, text.len() as u32);
        Ok(Box::new(std::iter::once(token)))
    }

    fn name(&self) -> &'static str {
        "keyword"
    }
}

/// Splits on whitespace without changing case.
#[derive(Debug, Clone, Default)]
pub struct WhitespaceAnalyzer;

impl Analyzer for WhitespaceAnalyzer {
    fn token_stream(&self, _field: &str, text: &str) -> Result<TokenStream> {
        let base = text.as_ptr() as usize;
        let tokens: Vec<Token> = text
            .split_whitespace()
            .map(|word| {
                let start = word.as_ptr() as usize - base;
                Token::new(word, start as u32, (start + word.len()) as u32)
            })
            .collect();
        Ok(Box::new(tokens.into_iter()))
    }

    fn name(&self) -> &'static str {
        "whitespace"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(stream: TokenStream) -> Vec<String> {
        stream.map(|t| t.text).collect()
    }

    #[test]
    fn test_standard_analyzer() {
        let analyzer = StandardAnalyzer::new();
        let tokens: Vec<Token> = analyzer
            .token_stream("body", "Hello, World! Rust's great.")
            .unwrap()
            .collect();

        let words: Vec<&str> = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(words, vec!["hello", "world", "rust's", "great"]);
        assert_eq!(tokens[1].start_offset, 7);
        assert_eq!(tokens[1].end_offset, 12);
        assert!(tokens.iter().all(|t| t.position_increment == 1));
    }

    #[test]
    fn test_standard_analyzer_skips_long_tokens() {
        let analyzer = StandardAnalyzer {
            max_token_length: 3,
        };
        let tokens: Vec<Token> = analyzer
            .token_stream("f", "a looooong b")
            .unwrap()
            .collect();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[1].text, "b");
        assert_eq!(tokens[1].position_increment, 2);
    }

    #[test]
    fn test_keyword_analyzer() {
        let analyzer = KeywordAnalyzer;
        assert_eq!(
            texts(analyzer.token_stream("id", "Doc 42").unwrap()),
            vec!["Doc 42"]
        );
    }

    #[test]
    fn test_whitespace_analyzer_offsets() {
        let analyzer = WhitespaceAnalyzer;
        let tokens: Vec<Token> = analyzer.token_stream("f", "  Foo  bar").unwrap().collect();
        assert_eq!(tokens[0].text, "Foo");
        assert_eq!(tokens[0].start_offset, 2);
        assert_eq!(tokens[1].start_offset, 7);
    }

    #[test]
    fn test_streams_are_independent() {
        let analyzer = StandardAnalyzer::new();
        let first = analyzer.token_stream("a", "one two").unwrap();
        let second = analyzer.token_stream("b", "three").unwrap();
        assert_eq!(texts(second), vec!["three"]);
        assert_eq!(texts(first), vec!["one", "two"]);
    }
}
