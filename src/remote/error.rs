use thiserror::Error;

#[derive(Error, Debug)]
pub enum RemoteError {
    /// The session is no longer valid; the caller must log in again.
    #[error("Authentication required: {0}")]
    AuthRequired(String),
    #[error("Credentials rejected: {0}")]
    Rejected(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Remote service error: {0}")]
    Service(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    pub fn is_auth_required(&self) -> bool {
        matches!(self, RemoteError::AuthRequired(_))
    }

    /// Connection drops and server-side hiccups are worth another attempt;
    /// missing items and auth failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Connection(_) | RemoteError::Service(_) => true,
            RemoteError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::UnexpectedEof
            ),
            RemoteError::AuthRequired(_) | RemoteError::Rejected(_) | RemoteError::NotFound(_) => {
                false
            }
        }
    }
}
