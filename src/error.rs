//! gavel errors. All errors are serializable, so they can be propagated from
//! the Raft leader to the client that submitted a command.

use serde::{Deserialize, Serialize};

/// A gavel error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The accepting leader lost leadership before the command was committed.
    /// The command may or may not be applied later; the client must retry.
    Deposed,
    /// Invalid data, typically decoding errors or corrupted state.
    InvalidData(String),
    /// Invalid user input, typically a malformed or rejected command.
    InvalidInput(String),
    /// An IO error.
    IO(String),
    /// The node is not the leader. Carries the current leader, if known, so
    /// the client can retry against it.
    NotLeader { leader: Option<String> },
    /// The request timed out before a result was produced.
    Timeout,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Deposed => write!(f, "leader deposed before commit"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::NotLeader { leader: Some(leader) } => write!(f, "not leader, try {leader}"),
            Error::NotLeader { leader: None } => write!(f, "not leader, and no leader known"),
            Error::Timeout => write!(f, "request timed out"),
        }
    }
}

impl Error {
    /// Returns whether the error is deterministic, i.e. guaranteed to be the
    /// same if the same command is applied on all replicas. State machine
    /// apply errors that are non-deterministic must halt the node, since they
    /// would otherwise cause replica divergence.
    pub fn is_deterministic(&self) -> bool {
        match self {
            // Command validation is a pure function of the replicated command
            // and the replicated state preceding it.
            Error::InvalidInput(_) => true,
            // IO and data corruption errors are local to the node.
            Error::InvalidData(_) | Error::IO(_) => false,
            // These are request-routing errors, never emitted during apply.
            Error::Deposed | Error::NotLeader { .. } | Error::Timeout => false,
        }
    }
}

/// Constructs an Error::InvalidData via format!() and into().
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput via format!() and into().
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// Allows `return errdata!(...)` and `return errinput!(...)` in functions
/// returning Result.
impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            // Socket read timeouts surface as WouldBlock or TimedOut
            // depending on the platform.
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Error::Timeout,
            _ => Error::IO(err.to_string()),
        }
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        match *err {
            bincode::ErrorKind::Io(err) => Error::from(err),
            err => Error::InvalidData(err.to_string()),
        }
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(_: crossbeam::channel::SendError<T>) -> Self {
        Error::IO("channel disconnected".to_string())
    }
}

impl<T> From<crossbeam::channel::TrySendError<T>> for Error {
    fn from(_: crossbeam::channel::TrySendError<T>) -> Self {
        Error::IO("channel disconnected or full".to_string())
    }
}

impl From<crossbeam::channel::RecvError> for Error {
    fn from(_: crossbeam::channel::RecvError) -> Self {
        Error::IO("channel disconnected".to_string())
    }
}

impl From<crossbeam::channel::RecvTimeoutError> for Error {
    fn from(err: crossbeam::channel::RecvTimeoutError) -> Self {
        match err {
            crossbeam::channel::RecvTimeoutError::Timeout => Error::Timeout,
            crossbeam::channel::RecvTimeoutError::Disconnected => {
                Error::IO("channel disconnected".to_string())
            }
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

/// A gavel Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;
