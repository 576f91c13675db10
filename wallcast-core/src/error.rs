use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("External tool '{tool}' failed: {reason}")]
    ExternalTool { tool: String, reason: String },

    #[error("Integrity violation: {0}")]
    Integrity(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn external_tool(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ExternalTool {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// Integrity violations are logged on a dedicated target so they can be
    /// routed to security review independently of the normal log stream.
    pub fn integrity(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::warn!(target: "security", "integrity violation: {message}");
        Self::Integrity(message)
    }

    /// Whether re-invoking the failed operation can succeed without operator
    /// intervention. Validation and not-found failures never retry.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ExternalTool { .. } | Self::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_tool_errors_are_retryable() {
        let err = Error::external_tool("ffmpeg", "exit status 1");
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "External tool 'ffmpeg' failed: exit status 1"
        );
    }

    #[test]
    fn validation_errors_are_not_retryable() {
        assert!(!Error::Validation("bad id".into()).is_retryable());
        assert!(!Error::NotFound("tv1".into()).is_retryable());
        assert!(!Error::integrity("path escape".to_string()).is_retryable());
    }
}
