//! Grouping functions: total functions from a received message to a string
//! key. Two instances are configured, one to split messages into separate
//! summary emails (the batch key) and one to collapse like messages within a
//! summary (the group key).

use failmail_common::message::ReceivedMessage;
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid {which} pattern {pattern:?}: {source}")]
pub struct PatternError {
    which: &'static str,
    pattern: String,
    #[source]
    source: regex::Error,
}

/// How messages are keyed.
///
/// Patterns are applied exactly as written. A `MatchingSubject` pattern that
/// matches nothing yields the key `""` for every message, collapsing them all
/// into a single batch or group; anchor patterns accordingly.
#[derive(Debug, Clone)]
pub enum GroupBy {
    /// The value of the named header, or the default when absent.
    Header { name: String, default: String },

    /// The raw `Subject:` header, trimmed.
    SameSubject,

    /// Concatenation of every match of the pattern against the subject.
    MatchingSubject(Regex),

    /// The subject with every match of the pattern replaced, so that
    /// `job 17 failed` and `job 42 failed` collapse to `job * failed`.
    ReplacedSubject { pattern: Regex, replacement: String },
}

impl GroupBy {
    /// Batch-key selection: `match` wins over `replace` wins over the header.
    ///
    /// # Errors
    /// If the chosen pattern does not compile.
    pub fn batch(
        subject_match: Option<&str>,
        subject_replace: Option<&str>,
        header: &str,
    ) -> Result<Self, PatternError> {
        if let Some(pattern) = subject_match {
            return Ok(Self::MatchingSubject(compile("batch-subject-match", pattern)?));
        }
        if let Some(pattern) = subject_replace {
            return Ok(Self::ReplacedSubject {
                pattern: compile("batch-subject-replace", pattern)?,
                replacement: "*".to_string(),
            });
        }
        Ok(Self::Header {
            name: header.to_string(),
            default: String::new(),
        })
    }

    /// Group-key selection: `match` wins over `replace` wins over the raw
    /// subject.
    ///
    /// # Errors
    /// If the chosen pattern does not compile.
    pub fn group(
        subject_match: Option<&str>,
        subject_replace: Option<&str>,
    ) -> Result<Self, PatternError> {
        if let Some(pattern) = subject_match {
            return Ok(Self::MatchingSubject(compile("group-subject-match", pattern)?));
        }
        if let Some(pattern) = subject_replace {
            return Ok(Self::ReplacedSubject {
                pattern: compile("group-subject-replace", pattern)?,
                replacement: "*".to_string(),
            });
        }
        Ok(Self::SameSubject)
    }

    /// The key for a message. Total: every message keys to something.
    #[must_use]
    pub fn key(&self, message: &ReceivedMessage) -> String {
        match self {
            Self::Header { name, default } => message
                .headers()
                .get_first(name)
                .unwrap_or(default)
                .to_string(),
            Self::SameSubject => message.subject().trim().to_string(),
            Self::MatchingSubject(pattern) => pattern
                .find_iter(message.subject())
                .map(|found| found.as_str())
                .collect(),
            Self::ReplacedSubject {
                pattern,
                replacement,
            } => pattern
                .replace_all(message.subject(), replacement.as_str())
                .into_owned(),
        }
    }
}

fn compile(which: &'static str, pattern: &str) -> Result<Regex, PatternError> {
    Regex::new(pattern).map_err(|source| PatternError {
        which,
        pattern: pattern.to_string(),
        source,
    })
}
