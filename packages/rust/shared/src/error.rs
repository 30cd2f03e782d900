//! Error types for Postforge.
//!
//! Library crates use [`PostforgeError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Soft dedup verdicts are not errors; they live in the core crate as
//! `DedupVerdict`. Only a hard conflict found at save time surfaces here.

use std::path::PathBuf;

/// Top-level error type for all Postforge operations.
#[derive(Debug, thiserror::Error)]
pub enum PostforgeError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Transport or service error from the LLM or embedding endpoint.
    #[error("llm service error: {0}")]
    Llm(String),

    /// Model output still failed schema validation after the corrective retry.
    #[error("{stage}: schema validation failed: {message}")]
    Schema { stage: String, message: String },

    /// Topic still violated the weekday format policy after the corrective retry.
    #[error("topic engine: topic format rejected: {message}")]
    TopicFormat { message: String },

    /// A post with the same topic hash already exists inside the hard window.
    #[error("duplicate topic {topic_hash}: conflicts with post {existing_id} dated {existing_date}")]
    DuplicateTopic {
        topic_hash: String,
        existing_id: String,
        existing_date: String,
    },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller exceeded an in-memory quota.
    #[error("rate limit exceeded for {action}: retry in {retry_after_secs}s")]
    RateLimited {
        action: String,
        retry_after_secs: u64,
    },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad input, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PostforgeError>;

impl PostforgeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a schema error attributed to a pipeline stage.
    pub fn schema(stage: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Schema {
            stage: stage.into(),
            message: msg.into(),
        }
    }

    /// Create a topic-format error.
    pub fn topic_format(msg: impl Into<String>) -> Self {
        Self::TopicFormat {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = PostforgeError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = PostforgeError::schema("content engine", "missing field `caption`");
        assert_eq!(
            err.to_string(),
            "content engine: schema validation failed: missing field `caption`"
        );
    }

    #[test]
    fn duplicate_topic_names_the_conflict() {
        let err = PostforgeError::DuplicateTopic {
            topic_hash: "abc".into(),
            existing_id: "p-1".into(),
            existing_date: "2026-03-02".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("abc"));
        assert!(msg.contains("p-1"));
        assert!(msg.contains("2026-03-02"));
    }
}
