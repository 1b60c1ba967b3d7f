use std::fmt;

/// A failure caused by the caller's input rather than by the service.
///
/// Library code returns it inside `anyhow::Error`; the HTTP layer downcasts it
/// to answer with 400 instead of 500.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientError(pub String);

impl ClientError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ClientError {}

pub fn client_error(message: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(ClientError::new(message))
}
