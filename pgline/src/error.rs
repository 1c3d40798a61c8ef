//! `pgline` error types.
use std::{backtrace::Backtrace, fmt, io};

use crate::{
    common::unit_error,
    config::ConfigError,
    protocol::{DatabaseError, ProtocolError},
    types::CodecError,
};

/// A specialized [`Result`] type for `pgline` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `pgline` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub(crate) fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// Returns `true` if the connection that produced this error is
    /// permanently unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Protocol(_) | ErrorKind::Io(_) | ErrorKind::Broken(_),
        )
    }
}

/// All possible error kind from `pgline` library.
pub enum ErrorKind {
    /// Connection string or environment configuration failure.
    Config(ConfigError),
    /// Framing or sequencing violation; the connection is broken.
    Protocol(ProtocolError),
    /// Transport failure; the connection is broken.
    Io(io::Error),
    /// Structured error reported by the server; recoverable.
    Database(DatabaseError),
    /// Type mapping or value conversion failure, reported before any
    /// bytes were sent for the offending command.
    Codec(CodecError),
    /// The connection already failed earlier; no I/O was attempted.
    Broken(BrokenError),
    /// The server requested an authentication method this library does not speak.
    UnsupportedAuth(UnsupportedAuth),
}

unit_error! {
    /// Operation on a connection that is permanently unusable.
    pub struct BrokenError("connection is broken and permanently unusable");
}

unit_error! {
    /// The server requested an authentication method this library does not speak.
    pub struct UnsupportedAuth("unsupported authentication method");
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ConfigError>e => ErrorKind::Config(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<io::Error>e => ErrorKind::Io(e));
from!(<DatabaseError>e => ErrorKind::Database(e));
from!(<CodecError>e => ErrorKind::Codec(e));
from!(<BrokenError>e => ErrorKind::Broken(e));
from!(<UnsupportedAuth>e => ErrorKind::UnsupportedAuth(e));

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Database(e) => e.fmt(f),
            Self::Codec(e) => e.fmt(f),
            Self::Broken(e) => e.fmt(f),
            Self::UnsupportedAuth(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
