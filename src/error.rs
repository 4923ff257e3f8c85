//! Error types for netmux

use thiserror::Error;

/// Main error type for netmux
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed or oversized metadata, unknown discriminator bytes.
    /// Always fatal to the physical connection that produced it.
    #[error("Frame error: {0}")]
    Frame(String),

    #[error("Pipe closed")]
    ClosedPipe,

    #[error("Read timeout")]
    ReadTimeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Session manager closed")]
    ManagerClosed,

    #[error("Unable to find an available mux client")]
    NoAvailableWorker,

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Session {id}: {source}")]
    Session {
        id: u16,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap an error with the id of the session it belongs to
    pub fn in_session(self, id: u16) -> Self {
        Error::Session {
            id,
            source: Box::new(self),
        }
    }

    /// Clean end-of-stream, never worth reporting as a failure
    pub fn is_eof(&self) -> bool {
        match self {
            Error::Io(e) => e.kind() == std::io::ErrorKind::UnexpectedEof,
            Error::Session { source, .. } => source.is_eof(),
            _ => false,
        }
    }
}

/// Result type alias for netmux
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_context_keeps_eof() {
        let eof = Error::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"));
        let wrapped = eof.in_session(7);
        assert!(wrapped.is_eof());
        assert_eq!(wrapped.to_string(), "Session 7: IO error: eof");
    }

    #[test]
    fn test_frame_error_is_not_eof() {
        assert!(!Error::Frame("invalid metalen".into()).is_eof());
        assert!(!Error::ClosedPipe.is_eof());
    }
}
