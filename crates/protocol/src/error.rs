//! Errors returned by the transport collaborator.

/// Failure of a single transport call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The request never produced a response (connect, reset, timeout).
    #[error("network error: {0}")]
    Network(String),

    /// The service answered with an error status.
    #[error("server error {status_code} {code}: {message} (request id: {request_id})")]
    Server {
        status_code: u16,
        code: String,
        message: String,
        request_id: String,
    },

    /// The request could not be built or sent (invalid input, local body read).
    #[error("client error: {0}")]
    Client(String),
}

impl TransportError {
    /// Builds a server error with only a status code and message.
    pub fn server(status_code: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status_code,
            code: String::new(),
            message: message.into(),
            request_id: String::new(),
        }
    }

    /// Returns the response status code, if the service answered.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Server { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_only_for_server_errors() {
        assert_eq!(TransportError::server(503, "slow down").status_code(), Some(503));
        assert_eq!(TransportError::Network("reset".into()).status_code(), None);
        assert_eq!(TransportError::Client("bad".into()).status_code(), None);
    }

    #[test]
    fn server_error_display_names_status() {
        let err = TransportError::Server {
            status_code: 404,
            code: "NoSuchKey".into(),
            message: "missing".into(),
            request_id: "req-1".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("404"));
        assert!(msg.contains("NoSuchKey"));
        assert!(msg.contains("req-1"));
    }
}
