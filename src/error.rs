// src/error.rs  —  the one error type the engine exposes at its public boundary
use std::fmt;
use thiserror::Error;

/// Error kinds named in the engine's failure-mode design.
///
/// These are kinds, not a hierarchy of types — every fallible operation
/// returns one of exactly these, wrapped in a [`CwError`] with a
/// human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Range/shape validation failure on a setter argument.
    InvalidArgument,
    /// Character or representation has no known lookup entry.
    NotFound,
    /// Operation is disallowed in the current mode (e.g. set_recv_speed under adaptive).
    NotPermitted,
    /// A competing subsystem (straight key, keyer, or the tone queue itself) is active.
    Busy,
    /// The tone queue is at capacity.
    QueueFull,
    /// The receive representation buffer is full.
    NoMemory,
    /// The decision cannot be made yet; the caller should retry later.
    TryAgain,
    /// A mark was rejected as a noise spike.
    Ignored,
    /// A `wait_*` call was requested while dispatcher delivery is masked.
    Deadlock,
    /// The operation is not legal from the current state.
    StateError,
    /// An underlying I/O or device error.
    System,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::NotFound => "not found",
            ErrorKind::NotPermitted => "not permitted",
            ErrorKind::Busy => "busy",
            ErrorKind::QueueFull => "queue full",
            ErrorKind::NoMemory => "no memory",
            ErrorKind::TryAgain => "try again",
            ErrorKind::Ignored => "ignored",
            ErrorKind::Deadlock => "deadlock",
            ErrorKind::StateError => "state error",
            ErrorKind::System => "system",
        };
        f.write_str(s)
    }
}

/// The engine's single public error type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct CwError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CwError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

/// Shorthand macro-free constructors for the call sites that raise these a lot.
impl CwError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, msg)
    }
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }
    pub fn not_permitted(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotPermitted, msg)
    }
    pub fn busy(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Busy, msg)
    }
    pub fn queue_full() -> Self {
        Self::new(ErrorKind::QueueFull, "tone queue is at capacity")
    }
    pub fn no_memory() -> Self {
        Self::new(ErrorKind::NoMemory, "representation buffer is full")
    }
    pub fn try_again() -> Self {
        Self::new(ErrorKind::TryAgain, "decision not yet possible")
    }
    pub fn ignored(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Ignored, msg)
    }
    pub fn deadlock() -> Self {
        Self::new(ErrorKind::Deadlock, "dispatcher delivery is masked")
    }
    pub fn state_error(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::StateError, msg)
    }
    pub fn system(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::System, msg)
    }
}

pub type CwResult<T> = Result<T, CwError>;
