//! Topic tokenizer
//!
//! Splits topic names and filters on `/` into [`Token`]s. Every separator
//! produces a segment, so leading, trailing and doubled separators yield
//! [`Token::Empty`] segments rather than being collapsed.
//!
//! Rules for filters:
//! - `#` must be the last segment
//! - `+` and `#` must occupy a whole segment
//!
//! Publish topics never carry wildcard semantics; `+` and `#` in a topic name
//! are ordinary literal text.

use std::fmt;

use compact_str::CompactString;
use smallvec::SmallVec;

use super::TopicError;

/// One segment of a topic path
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Token {
    /// Zero-length segment
    Empty,
    /// Single-level wildcard (`+`)
    SingleLevel,
    /// Multi-level wildcard (`#`)
    MultiLevel,
    /// Non-empty literal segment
    Literal(CompactString),
}

impl Token {
    fn literal(segment: &str) -> Self {
        if segment.is_empty() {
            Token::Empty
        } else {
            Token::Literal(CompactString::new(segment))
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Empty => Ok(()),
            Token::SingleLevel => f.write_str("+"),
            Token::MultiLevel => f.write_str("#"),
            Token::Literal(s) => f.write_str(s),
        }
    }
}

/// Tokens of a typical topic fit inline
pub type Tokens = SmallVec<[Token; 8]>;

/// Tokenize a subscription filter, validating wildcard placement
pub fn parse_filter(filter: &str) -> Result<Tokens, TopicError> {
    let mut tokens = Tokens::new();
    let mut segments = filter.split('/').peekable();

    while let Some(segment) = segments.next() {
        let token = match segment {
            "#" => {
                if segments.peek().is_some() {
                    return Err(TopicError::InvalidFilter(
                        "multi-level wildcard must be the last segment",
                    ));
                }
                Token::MultiLevel
            }
            "+" => Token::SingleLevel,
            s if s.contains('#') => {
                return Err(TopicError::InvalidFilter(
                    "multi-level wildcard must occupy a whole segment",
                ))
            }
            s if s.contains('+') => {
                return Err(TopicError::InvalidFilter(
                    "single-level wildcard must occupy a whole segment",
                ))
            }
            s => Token::literal(s),
        };
        tokens.push(token);
    }

    Ok(tokens)
}

/// Tokenize a publish topic; wildcard characters stay literal
pub fn parse_topic(topic: &str) -> Tokens {
    topic.split('/').map(Token::literal).collect()
}

/// Match tokenized topic against tokenized filter
pub(crate) fn tokens_match(topic: &[Token], filter: &[Token]) -> bool {
    match (filter.split_first(), topic.split_first()) {
        (Some((Token::MultiLevel, _)), _) => true,
        (None, None) => true,
        (Some((Token::SingleLevel, f_rest)), Some((_, t_rest))) => tokens_match(t_rest, f_rest),
        (Some((f, f_rest)), Some((t, t_rest))) => f == t && tokens_match(t_rest, f_rest),
        _ => false,
    }
}

/// Check whether a concrete topic matches a subscription filter.
///
/// An invalid filter matches nothing.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    match parse_filter(filter) {
        Ok(filter) => tokens_match(&parse_topic(topic), &filter),
        Err(_) => false,
    }
}
