//! Protocol and server error types.
use std::fmt;

use bytes::{Buf, Bytes};

use super::BackendMessage;
use crate::{common::ByteStr, ext::BytesExt};

/// An error when translating buffer from postgres.
///
/// Any `ProtocolError` is fatal for the connection that produced it:
/// the stream position can no longer be trusted.
pub enum ProtocolError {
    Unexpected {
        expect: Option<&'static str>,
        found: u8,
        phase: Option<&'static str>,
    },
    UnknownAuth {
        auth: i32,
    },
    FrameTooLarge {
        len: usize,
        max: usize,
    },
    BadLength {
        len: i32,
    },
    UnknownFormat {
        code: i16,
    },
    UnknownTransactionStatus {
        status: u8,
    },
    Truncated {
        what: &'static str,
    },
    MissingNul,
    NonUtf8(std::str::Utf8Error),
}

impl std::error::Error for ProtocolError { }

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ProtocolError::Unexpected { expect, found, phase } => {
                let found = BackendMessage::message_name(found);
                match expect {
                    Some(m) => write!(f, "expected message `{m}` found `{found}`")?,
                    None => write!(f, "unexpected message `{found}`")?,
                }
                if let Some(phase) = phase {
                    write!(f, " in `{phase}`")?
                }
                Ok(())
            },
            ProtocolError::UnknownAuth { auth } => {
                write!(f, "unknown authentication method ({auth})")
            },
            ProtocolError::FrameTooLarge { len, max } => {
                write!(f, "declared frame length {len} exceeds maximum {max}")
            },
            ProtocolError::BadLength { len } => {
                write!(f, "declared frame length {len} below the 4 byte minimum")
            },
            ProtocolError::UnknownFormat { code } => {
                write!(f, "unknown format code {code}")
            },
            ProtocolError::UnknownTransactionStatus { status } => {
                write!(f, "unknown transaction status {:?}", status as char)
            },
            ProtocolError::Truncated { what } => {
                write!(f, "message body truncated in {what}")
            },
            ProtocolError::MissingNul => {
                f.write_str("string field is not nul terminated")
            },
            ProtocolError::NonUtf8(e) => {
                write!(f, "non utf8 string field: {e}")
            },
        }
    }
}

impl fmt::Debug for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl ProtocolError {
    pub(crate) fn unknown(found: u8) -> ProtocolError {
        Self::Unexpected { expect: None, found, phase: None }
    }

    pub(crate) fn unexpected(expect: &'static str, found: u8) -> ProtocolError {
        Self::Unexpected { expect: Some(expect), found, phase: None }
    }

    pub(crate) fn unexpected_phase(found: u8, phase: &'static str) -> ProtocolError {
        Self::Unexpected { expect: None, found, phase: Some(phase) }
    }

    pub(crate) fn unknown_auth(auth: i32) -> ProtocolError {
        Self::UnknownAuth { auth }
    }

    pub(crate) fn frame_too_large(len: usize, max: usize) -> ProtocolError {
        Self::FrameTooLarge { len, max }
    }

    pub(crate) fn bad_length(len: i32) -> ProtocolError {
        Self::BadLength { len }
    }

    pub(crate) fn unknown_format(code: i16) -> ProtocolError {
        Self::UnknownFormat { code }
    }

    pub(crate) fn truncated(what: &'static str) -> ProtocolError {
        Self::Truncated { what }
    }

    pub(crate) fn missing_nul() -> ProtocolError {
        Self::MissingNul
    }

    pub(crate) fn non_utf8(err: std::str::Utf8Error) -> ProtocolError {
        Self::NonUtf8(err)
    }
}

/// A structured error reported by the server.
///
/// Parsed from the `ErrorResponse` field stream: each field is a one byte
/// identifier followed by a nul terminated string, terminated by a zero byte.
/// Unrecognized fields are skipped.
#[derive(Clone)]
pub struct DatabaseError {
    severity: ByteStr,
    code: ByteStr,
    message: ByteStr,
    detail: Option<ByteStr>,
    position: Option<u32>,
}

impl DatabaseError {
    /// SQLSTATE code for a query cancelled at the caller's request.
    pub(crate) const QUERY_CANCELED: &'static str = "57014";

    /// Severity, e.g. `ERROR`, `FATAL`, or `PANIC`.
    pub fn severity(&self) -> &str {
        &self.severity
    }

    /// The SQLSTATE code for the error.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// The primary human-readable error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Optional secondary error message carrying more detail.
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// Error cursor position as an index into the original query string, if any.
    pub fn position(&self) -> Option<u32> {
        self.position
    }

    pub(crate) fn parse(mut body: Bytes) -> Result<Self, ProtocolError> {
        let mut severity = ByteStr::default();
        let mut code = ByteStr::default();
        let mut message = ByteStr::default();
        let mut detail = None;
        let mut position = None;

        while body.has_remaining() {
            let field = body.get_u8();
            if field == 0 {
                break;
            }
            let value = body.get_nul_bytestr()?;
            match field {
                b'S' => severity = value,
                b'C' => code = value,
                b'M' => message = value,
                b'D' => detail = Some(value),
                b'P' => position = value.parse().ok(),
                // frontends should silently ignore fields of unrecognized type
                _ => { },
            }
        }

        Ok(Self { severity, code, message, detail, position })
    }
}

impl std::error::Error for DatabaseError { }

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.code)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use bytes::{BufMut, BytesMut};

    use super::DatabaseError;

    fn field_stream(fields: &[(u8, &str)]) -> bytes::Bytes {
        let mut buf = BytesMut::new();
        for (tag, value) in fields {
            buf.put_u8(*tag);
            buf.put(value.as_bytes());
            buf.put_u8(0);
        }
        buf.put_u8(0);
        buf.freeze()
    }

    #[test]
    fn parses_documented_fields_and_skips_unknown() {
        let body = field_stream(&[
            (b'S', "ERROR"),
            (b'C', "23505"),
            (b'M', "duplicate key value"),
            (b'X', "future field"),
            (b'P', "12"),
        ]);
        let err = DatabaseError::parse(body).unwrap();
        assert_eq!(err.severity(), "ERROR");
        assert_eq!(err.code(), "23505");
        assert_eq!(err.message(), "duplicate key value");
        assert_eq!(err.position(), Some(12));
        assert!(err.detail().is_none());
    }
}
