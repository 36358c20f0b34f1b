use std::io;

use thiserror::Error;

/// Errors produced on the replication side of the proxy.
///
/// One enum covers the whole pipeline so that the supervisor loop can decide
/// between "reconnect", "drop the event" and "stop" from the variant alone.
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("{0}")]
    Io(#[from] io::Error),

    /// Malformed event payload. Localized to the current event.
    #[error("decode error: {0}")]
    Decode(String),

    /// A DDL statement that could not be parsed. The statement is skipped.
    #[error("parse error: {0}")]
    Parse(String),

    /// Schema registry inconsistency, e.g. a column count mismatch.
    #[error("schema error: {0}")]
    Schema(String),

    /// The durable replication state could not be read.
    #[error("state error: {0}")]
    State(String),

    /// The upstream connection failed or was lost.
    #[error("connection error: {0}")]
    Connection(String),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ReplicationError>;

impl ReplicationError {
    /// True for errors that are fixed by reconnecting to the upstream.
    pub fn is_transient(&self) -> bool {
        matches!(self, ReplicationError::Connection(_))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn connection_errors_are_transient() {
        assert!(ReplicationError::Connection("gone".into()).is_transient());
        assert!(!ReplicationError::Decode("bad".into()).is_transient());
    }

    #[test]
    fn io_error_converts() {
        fn failing() -> Result<()> {
            Err(io::Error::new(io::ErrorKind::NotFound, "missing"))?;
            Ok(())
        }

        let err = failing().unwrap_err();
        assert!(matches!(err, ReplicationError::Io(_)));
    }
}
