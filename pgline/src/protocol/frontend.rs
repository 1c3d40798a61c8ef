//! Postgres Frontend Messages
//!
//! <https://www.postgresql.org/docs/current/protocol-message-formats.html>
use bytes::{BufMut, Bytes, BytesMut};

use super::PgFormat;
use crate::ext::{BufMutExt, StrExt, UsizeExt};
use crate::types::Oid;

/// Write a frontend message to `buf`.
pub fn write<F: FrontendProtocol>(msg: F, buf: &mut BytesMut) {
    // msgtype + length
    const PREFIX: usize = 1 + 4;

    let size_hint = msg.size_hint();
    buf.reserve(PREFIX + size_hint as usize);

    let offset = buf.len();
    buf.put_u8(F::MSGTYPE);
    buf.put_u32(4 + size_hint);

    msg.encode(&mut *buf);

    debug_assert_eq!(
        buf.len() - offset,
        PREFIX + size_hint as usize,
        "frontend message body size not equal to size hint"
    );
}

/// A type which can be encoded into postgres frontend message
pub trait FrontendProtocol {
    /// Message type.
    const MSGTYPE: u8;

    /// Size of the main body.
    ///
    /// Note that this is **only** the size of main body as oppose of actual postgres message which
    /// include the length itself.
    fn size_hint(&self) -> u32;

    /// Write the main body of the message.
    ///
    /// The length of body written must be equal to the
    /// length returned by [`size_hint`][FrontendProtocol::size_hint].
    fn encode(self, buf: impl BufMut);
}

/// Postgres Startup frontend message
///
/// For historical reasons, the very first message sent by the client (the [`Startup`] message)
/// has no initial message-type byte, thus [`Startup`] does not implement [`FrontendProtocol`].
///
/// To write startup message, use [`Startup::write`].
#[derive(Debug)]
pub struct Startup<'a> {
    /// The database user name to connect as. Required; there is no default.
    pub user: &'a str,
    /// The database to connect to. Defaults to the user name.
    pub database: Option<&'a str>,
    /// Used to connect in streaming replication mode, where a small set of
    /// replication commands can be issued instead of SQL statements.
    ///
    /// Value can be true, false, or database, and the default is false.
    pub replication: Option<&'a str>,
}

impl Startup<'_> {
    pub fn write(self, buf: &mut BytesMut) {
        let offset = buf.len();

        // Length of message contents in bytes, including self.
        // reserve 4 bytes for length
        buf.put_u32(0);

        // Int32(196608)
        // The protocol version number.
        // The most significant 16 bits are the major version number (3 for the protocol described here).
        // The least significant 16 bits are the minor version number (0 for the protocol described here).
        buf.put_u32(196_608);

        // The protocol version number is followed by one or more pairs of parameter name and value strings.

        buf.put_nul_string("user");
        buf.put_nul_string(self.user);

        if let Some(db) = self.database {
            buf.put_nul_string("database");
            buf.put_nul_string(db);
        }

        if let Some(repl) = self.replication {
            buf.put_nul_string("replication");
            buf.put_nul_string(repl);
        }

        // A zero byte is required as a terminator after the last name/value pair.
        buf.put_u8(b'\0');

        // write the length
        let mut written_buf = &mut buf[offset..];
        written_buf.put_u32(written_buf.len().to_u32());
    }
}

/// Cancel request, sent over a *separate* connection instead of the one
/// running the query to be cancelled.
///
/// Like [`Startup`], the message has no initial message-type byte and thus
/// does not implement [`FrontendProtocol`]; use [`CancelRequest::write`].
#[derive(Debug, Clone, Copy)]
pub struct CancelRequest {
    /// The process ID of the target backend.
    pub process_id: i32,
    /// The secret key for the target backend.
    pub secret_key: i32,
}

impl CancelRequest {
    /// Int32(80877102), the cancel request code.
    ///
    /// The value is chosen to contain 1234 in the most significant 16 bits,
    /// and 5678 in the least significant 16 bits.
    const CODE: u32 = (1234 << 16) | 5678;

    pub fn write(self, buf: &mut BytesMut) {
        // Int32(16) Length of message contents in bytes, including self.
        buf.put_u32(16);
        buf.put_u32(Self::CODE);
        buf.put_i32(self.process_id);
        buf.put_i32(self.secret_key);
    }
}

macro_rules! size_of {
    ($self:tt.$field:ident) => {
        u32::try_from(size_of_val(&$self.$field)).expect("data type size too large for postgres")
    };
}

/// Carries the password in response to a cleartext authentication request.
#[derive(Debug)]
pub struct PasswordMessage<'a> {
    /// The password (encrypted, if requested)
    pub password: &'a str,
}

impl FrontendProtocol for PasswordMessage<'_> {
    const MSGTYPE: u8 = b'p';

    fn size_hint(&self) -> u32 {
        self.password.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.password);
    }
}

/// Identifies the message as a simple query
pub struct Query<'a> {
    /// the query string itself
    pub sql: &'a str,
}

impl FrontendProtocol for Query<'_> {
    const MSGTYPE: u8 = b'Q';

    fn size_hint(&self) -> u32 {
        self.sql.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.sql);
    }
}

/// Identifies the message as a Parse command
pub struct Parse<'a> {
    /// prepared statement name (an empty string selects the unnamed prepared statement).
    pub prepare_name: &'a str,
    /// The query string to be parsed.
    pub sql: &'a str,
    /// Specifies the object ID of each parameter data type.
    ///
    /// Note that this is not an indication of the number of parameters that might appear in the
    /// query string, only the number that the frontend wants to prespecify types for.
    /// Placing a zero is equivalent to leaving the type unspecified.
    pub param_oids: &'a [Oid],
}

impl FrontendProtocol for Parse<'_> {
    const MSGTYPE: u8 = b'P';

    fn size_hint(&self) -> u32 {
        self.prepare_name.nul_string_len()
            + self.sql.nul_string_len()
            + 2
            + 4 * self.param_oids.len().to_u32()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.prepare_name);
        buf.put_nul_string(self.sql);
        buf.put_u16(self.param_oids.len().to_u16());
        for oid in self.param_oids {
            buf.put_u32(*oid);
        }
    }
}

/// Identifies the message as a Bind command.
///
/// Parameter values are pre-encoded in binary format; `None` binds NULL,
/// transmitted as the special length -1 with no value bytes following.
pub struct Bind<'a> {
    /// The name of the destination portal (an empty string selects the unnamed portal).
    pub portal_name: &'a str,
    /// The name of the source prepared statement (an empty string selects the unnamed prepared statement).
    pub stmt_name: &'a str,
    /// The parameter values, already encoded in binary format.
    pub params: &'a [Option<Bytes>],
    /// The single format code applied to all result columns (if any).
    pub result_format: PgFormat,
}

impl FrontendProtocol for Bind<'_> {
    const MSGTYPE: u8 = b'B';

    fn size_hint(&self) -> u32 {
        let params: u32 = self
            .params
            .iter()
            .map(|p| 4 + p.as_ref().map(|b| b.len().to_u32()).unwrap_or(0))
            .sum();
        self.portal_name.nul_string_len()
            + self.stmt_name.nul_string_len()
            + 2 // parameter format code count
            + 2 // the single parameter format code
            + 2 // parameter count
            + params
            + 2 // result format code count
            + 2 // the single result format code
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.portal_name);
        buf.put_nul_string(self.stmt_name);

        // one format code applied to all parameters
        buf.put_u16(1);
        buf.put_u16(PgFormat::Binary.format_code());

        buf.put_u16(self.params.len().to_u16());
        for param in self.params {
            match param {
                Some(value) => {
                    buf.put_i32(value.len().try_into().expect("parameter too large for protocol"));
                    buf.put(value.clone());
                },
                // -1 indicates a NULL parameter value
                None => buf.put_i32(-1),
            }
        }

        // one format code applied to all result columns
        buf.put_u16(1);
        buf.put_u16(self.result_format.format_code());
    }
}

/// Identifies the message as a Describe command.
pub struct Describe<'a> {
    /// 'S' to describe a prepared statement; or 'P' to describe a portal.
    pub kind: u8,
    /// The name of the prepared statement or portal to describe
    /// (an empty string selects the unnamed prepared statement or portal).
    pub name: &'a str,
}

impl FrontendProtocol for Describe<'_> {
    const MSGTYPE: u8 = b'D';

    fn size_hint(&self) -> u32 {
        size_of!(self.kind) + self.name.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.kind);
        buf.put_nul_string(self.name);
    }
}

/// Identifies the message as a Execute command
pub struct Execute<'a> {
    /// The name of the portal to execute (an empty string selects the unnamed portal).
    pub portal_name: &'a str,
    /// Maximum number of rows to return, if portal contains a query that returns rows
    /// (ignored otherwise). Zero denotes “no limit”.
    pub max_row: u32,
}

impl FrontendProtocol for Execute<'_> {
    const MSGTYPE: u8 = b'E';

    fn size_hint(&self) -> u32 {
        self.portal_name.nul_string_len() + size_of!(self.max_row)
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.portal_name);
        buf.put_u32(self.max_row);
    }
}

/// Identifies the message as a Close command
pub struct Close<'a> {
    /// 'S' to close a prepared statement; or 'P' to close a portal.
    pub variant: u8,
    /// The name of the prepared statement or portal to close
    /// (an empty string selects the unnamed prepared statement or portal).
    pub name: &'a str,
}

impl Close<'_> {
    pub const STATEMENT: u8 = b'S';
}

impl FrontendProtocol for Close<'_> {
    const MSGTYPE: u8 = b'C';

    fn size_hint(&self) -> u32 {
        size_of!(self.variant) + self.name.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.variant);
        buf.put_nul_string(self.name);
    }
}

/// Identifies the message as a Sync command
pub struct Sync;

impl FrontendProtocol for Sync {
    const MSGTYPE: u8 = b'S';

    fn size_hint(&self) -> u32 { 0 }

    fn encode(self, _: impl BufMut) { }
}

/// Identifies the message as a Flush command
pub struct Flush;

impl FrontendProtocol for Flush {
    const MSGTYPE: u8 = b'H';

    fn size_hint(&self) -> u32 { 0 }

    fn encode(self, _: impl BufMut) { }
}

/// Identifies the message as a termination message, sent before closing the connection.
pub struct Terminate;

impl FrontendProtocol for Terminate {
    const MSGTYPE: u8 = b'X';

    fn size_hint(&self) -> u32 { 0 }

    fn encode(self, _: impl BufMut) { }
}

/// Data that forms part of a COPY or replication data stream.
pub struct CopyData<'a> {
    pub data: &'a [u8],
}

impl FrontendProtocol for CopyData<'_> {
    const MSGTYPE: u8 = b'd';

    fn size_hint(&self) -> u32 {
        self.data.len().to_u32()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put(self.data);
    }
}

/// Standby status update, the replication consumer's progress report.
///
/// Sent inside [`CopyData`] framing while a replication stream is active.
#[derive(Debug, Clone, Copy)]
pub struct StandbyStatus {
    /// The location of the last WAL byte + 1 received and written to disk in the standby.
    pub wal_written: u64,
    /// The location of the last WAL byte + 1 flushed to disk in the standby.
    pub wal_flushed: u64,
    /// The location of the last WAL byte + 1 applied in the standby.
    pub wal_applied: u64,
    /// The client's system clock, microseconds since midnight 2000-01-01.
    pub client_clock: i64,
    /// If 1, the client requests the server to reply to this message immediately.
    pub reply: u8,
}

impl FrontendProtocol for StandbyStatus {
    const MSGTYPE: u8 = b'd';

    fn size_hint(&self) -> u32 {
        1 + 8 + 8 + 8 + 8 + 1
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(b'r');
        buf.put_u64(self.wal_written);
        buf.put_u64(self.wal_flushed);
        buf.put_u64(self.wal_applied);
        buf.put_i64(self.client_clock);
        buf.put_u8(self.reply);
    }
}

#[cfg(test)]
mod test {
    use bytes::{Buf, BytesMut};

    use super::*;

    #[test]
    fn framed_length_includes_itself_but_not_the_tag() {
        let mut buf = BytesMut::new();
        write(Execute { portal_name: "p1", max_row: 7 }, &mut buf);

        assert_eq!(buf.get_u8(), b'E');
        let len = buf.get_u32();
        assert_eq!(len as usize, buf.remaining() + 4);
    }

    #[test]
    fn bind_writes_null_as_negative_length() {
        let mut buf = BytesMut::new();
        let params = [None];
        write(
            Bind {
                portal_name: "",
                stmt_name: "s1",
                params: &params,
                result_format: PgFormat::Binary,
            },
            &mut buf,
        );

        // declared length covers everything but the tag
        assert_eq!(buf[0], b'B');
        let declared = u32::from_be_bytes(buf[1..5].try_into().unwrap());
        assert_eq!(declared as usize, buf.len() - 1);
        // portal nul, stmt nul, fmt count/code, param count, then -1
        let tail = &buf[5..];
        let null_at = 1 + 3 + 2 + 2 + 2;
        assert_eq!(&tail[null_at..null_at + 4], &(-1i32).to_be_bytes()[..]);
    }

    #[test]
    fn startup_has_no_tag_byte() {
        let mut buf = BytesMut::new();
        Startup { user: "admin", database: Some("db"), replication: None }.write(&mut buf);
        let declared = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        assert_eq!(declared as usize, buf.len());
        assert_eq!(u32::from_be_bytes(buf[4..8].try_into().unwrap()), 196_608);
    }
}
