use thiserror::Error;

/// Errors that can occur when talking to a quill node.
#[derive(Debug, Error)]
pub enum SdkError {
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),
    #[error("url error: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server error (status {status}): {message}")]
    ServerError { status: u16, message: String },
    #[error("encoding error: {0}")]
    Encoding(#[from] quill_types::TxError),
    #[error("parse error: {0}")]
    Parse(String),
}

impl SdkError {
    pub(crate) fn parse_error(msg: impl Into<String>) -> Self {
        SdkError::Parse(msg.into())
    }

    pub(crate) fn server_error(status: u16, message: impl Into<String>) -> Self {
        SdkError::ServerError {
            status,
            message: message.into(),
        }
    }

    /// Whether a retry may succeed: transport failures, 404 (not yet
    /// visible) and 5xx responses.
    pub fn is_transient(&self) -> bool {
        match self {
            SdkError::Http(_) => true,
            SdkError::ServerError { status, .. } => *status == 404 || *status >= 500,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SdkError::ServerError { status: 404, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_failures() {
        assert!(SdkError::server_error(404, "transaction not found").is_transient());
        assert!(SdkError::server_error(503, "busy").is_transient());
        assert!(!SdkError::server_error(400, "invalid nonce").is_transient());
        assert!(!SdkError::parse_error("bad").is_transient());
    }
}
