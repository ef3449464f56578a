//! Error types for session persistence

/// Errors from session store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("session file parse error: {0}")]
    Parse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Pool(#[from] credit_pool::Error),
}

/// Result alias for session store operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_convert_transparently() {
        let err: Error = credit_pool::Error::MalformedSnapshot("no imsi".into()).into();
        assert!(matches!(err, Error::Pool(_)));
        assert_eq!(err.to_string(), "malformed snapshot: no imsi");
    }
}
