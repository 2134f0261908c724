use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnPoolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// No idle connection was usable and a fresh dial failed.
    /// Timed out dials carry `io::ErrorKind::TimedOut`.
    #[error("Failed to dial {address}: {source}")]
    DialFailed {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ConnPoolError {
    pub(crate) fn dial(address: impl Into<String>, source: io::Error) -> Self {
        Self::DialFailed {
            address: address.into(),
            source,
        }
    }

    /// Kind of the underlying IO failure, if any.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Io(e) => Some(e.kind()),
            Self::DialFailed { source, .. } => Some(source.kind()),
            Self::Config(_) => None,
        }
    }

    pub fn is_dial_failure(&self) -> bool {
        matches!(self, Self::DialFailed { .. })
    }
}

pub type Result<T> = std::result::Result<T, ConnPoolError>;
