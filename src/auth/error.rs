use thiserror::Error;

use crate::remote::RemoteError;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("No credential available for {0}")]
    NoCredential(String),

    #[error("Credentials rejected: {0}")]
    Rejected(String),

    #[error("Second-factor authentication is still pending for {0}")]
    SecondFactorPending(String),

    #[error("Secret store error: {0}")]
    SecretStore(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl From<keyring::Error> for AuthError {
    fn from(e: keyring::Error) -> Self {
        AuthError::SecretStore(e.to_string())
    }
}
