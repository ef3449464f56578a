//! Error types for credit pool operations
//!
//! Only conditions that must stop the caller are errors. Unknown keys, denied
//! grants and stale deltas are reported through return values instead.

/// Errors from credit pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),

    #[error("credit already exists: {0}")]
    DuplicateKey(String),
}

impl Error {
    /// Prefix the message with where the error occurred.
    pub(crate) fn context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            Error::MalformedSnapshot(msg) => Error::MalformedSnapshot(format!("{ctx}: {msg}")),
            Error::DuplicateKey(msg) => Error::DuplicateKey(format!("{ctx}: {msg}")),
        }
    }
}

/// Result alias for credit pool operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages_are_descriptive() {
        assert_eq!(
            Error::MalformedSnapshot("missing imsi".into()).to_string(),
            "malformed snapshot: missing imsi"
        );
        assert_eq!(
            Error::DuplicateKey("rg:5".into()).to_string(),
            "credit already exists: rg:5"
        );
    }
}
