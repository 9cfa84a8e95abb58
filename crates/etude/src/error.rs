// src/error.rs
use std::io;
use thiserror::Error;

/// Central error type for the etude server.
///
/// Per-request protocol failures never surface here: they are answered on the
/// wire (see [`crate::parser::ParseError`] and [`crate::file::FileError`]).
#[derive(Debug, Error)]
pub enum EtudeError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The configuration file is not valid TOML.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// A dotted configuration path resolved to nothing.
    #[error("missing config key: {0}")]
    MissingKey(String),

    /// A configuration value exists but has the wrong shape.
    #[error("invalid config value at {path}: expected {expected}")]
    InvalidValue { path: String, expected: &'static str },

    /// Worker pool constructed with a zero thread count or queue bound.
    #[error("invalid worker pool: {0}")]
    InvalidPool(&'static str),

    /// The job queue is at its bound; the job was not accepted.
    #[error("job queue is full")]
    QueueFull,

    /// The pool has been shut down and accepts no more jobs.
    #[error("worker pool is closed")]
    PoolClosed,

    /// Every connection slot is occupied.
    #[error("connection table is full")]
    TableFull,

    /// A composed response header does not fit the write buffer.
    #[error("write buffer is full")]
    WriteBufferFull,
}

impl EtudeError {
    /// True for errors that reject work at a capacity boundary.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            EtudeError::QueueFull | EtudeError::TableFull | EtudeError::PoolClosed
        )
    }
}

pub type EtudeResult<T> = Result<T, EtudeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert() {
        let err: EtudeError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert!(matches!(err, EtudeError::Io(_)));
        assert!(!err.is_capacity());
    }

    #[test]
    fn capacity_errors_are_flagged() {
        assert!(EtudeError::QueueFull.is_capacity());
        assert!(EtudeError::TableFull.is_capacity());
        assert_eq!(EtudeError::QueueFull.to_string(), "job queue is full");
    }
}
