//! Logical replication decoding.
//!
//! [`PgOutputDecoder`] parses the payloads delivered inside CopyData
//! frames into [`ReplicationMessage`] values, tracking which transactions
//! are currently streamed. [`ReplicationStream`] adapts a transport into a
//! [`Stream`] of decoded messages.
//!
//! Frame payload layout: `variant-tag:1 | WAL-start:8 | WAL-end:8 |
//! server-clock:8`, then variant-specific fields.
use std::{
    collections::HashSet,
    task::{Context, Poll, ready},
};

use bytes::{Buf, Bytes};
use futures_core::Stream;

use crate::{
    Result,
    common::verbose,
    ext::BytesExt,
    protocol::{ProtocolError, backend, frontend},
    transport::{PgTransport, PgTransportExt},
};

mod message;

pub use message::{
    Lsn, Relation, RelationColumn, ReplicationBody, ReplicationMessage, StreamAbort, TupleData,
    TupleValue,
};

fn need(body: &Bytes, len: usize, what: &'static str) -> Result<(), ProtocolError> {
    match body.remaining() < len {
        true => Err(ProtocolError::truncated(what)),
        false => Ok(()),
    }
}

/// Decoder for the `pgoutput` logical replication byte stream.
///
/// The decoder is stateful: streamed transactions interleave
/// `StreamStart`/`StreamStop` blocks, and row-change message shapes differ
/// once streaming is active (an explicit transaction id accompanies each
/// change instead of being implied by connection-wide state).
#[derive(Debug, Default)]
pub struct PgOutputDecoder {
    /// Transactions that have started streaming and not yet ended.
    streaming: HashSet<u32>,
    /// The transaction owning the currently open stream block.
    in_stream: Option<u32>,
}

impl PgOutputDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` while `xid` is in the streaming state.
    pub fn is_streaming(&self, xid: u32) -> bool {
        self.streaming.contains(&xid)
    }

    /// Decode one replication frame payload.
    pub fn decode(&mut self, mut body: Bytes) -> Result<ReplicationMessage, ProtocolError> {
        need(&body, 1 + 8 + 8 + 8, "replication prelude")?;
        let tag = body.get_u8();
        let wal_start = Lsn(body.get_u64());
        let wal_end = Lsn(body.get_u64());
        let server_clock = body.get_i64();

        let body = self.decode_body(tag, body)?;
        Ok(ReplicationMessage { wal_start, wal_end, server_clock, body })
    }

    fn decode_body(&mut self, tag: u8, mut body: Bytes) -> Result<ReplicationBody, ProtocolError> {
        // inside a stream block, row-change and schema messages carry the
        // owning transaction explicitly
        let stream_xid = |body: &mut Bytes| -> Result<Option<u32>, ProtocolError> {
            match self.in_stream {
                Some(_) => {
                    need(body, 4, "stream transaction id")?;
                    Ok(Some(body.get_u32()))
                },
                None => Ok(None),
            }
        };

        let decoded = match tag {
            b'B' => {
                need(&body, 8 + 8 + 4, "begin")?;
                ReplicationBody::Begin {
                    final_lsn: Lsn(body.get_u64()),
                    commit_time: body.get_i64(),
                    xid: body.get_u32(),
                }
            },
            b'C' => {
                need(&body, 1 + 8 + 8 + 8, "commit")?;
                ReplicationBody::Commit {
                    flags: body.get_u8(),
                    commit_lsn: Lsn(body.get_u64()),
                    end_lsn: Lsn(body.get_u64()),
                    commit_time: body.get_i64(),
                }
            },
            b'O' => {
                need(&body, 8, "origin")?;
                ReplicationBody::Origin {
                    commit_lsn: Lsn(body.get_u64()),
                    name: body.get_nul_bytestr()?,
                }
            },
            b'R' => {
                let xid = stream_xid(&mut body)?;
                need(&body, 4, "relation")?;
                let oid = body.get_u32();
                let namespace = body.get_nul_bytestr()?;
                let name = body.get_nul_bytestr()?;
                need(&body, 1 + 2, "relation")?;
                let replica_identity = body.get_u8();
                let column_len = body.get_i16();

                let mut columns = Vec::with_capacity(column_len.max(0) as usize);
                for _ in 0..column_len {
                    need(&body, 1, "relation column")?;
                    let flags = body.get_u8();
                    let name = body.get_nul_bytestr()?;
                    need(&body, 4 + 4, "relation column")?;
                    columns.push(RelationColumn {
                        flags,
                        name,
                        type_oid: body.get_u32(),
                        type_modifier: body.get_i32(),
                    });
                }
                ReplicationBody::Relation(Relation {
                    xid,
                    oid,
                    namespace,
                    name,
                    replica_identity,
                    columns,
                })
            },
            b'Y' => {
                let xid = stream_xid(&mut body)?;
                need(&body, 4, "type descriptor")?;
                ReplicationBody::TypeDescriptor {
                    xid,
                    oid: body.get_u32(),
                    namespace: body.get_nul_bytestr()?,
                    name: body.get_nul_bytestr()?,
                }
            },
            b'I' => {
                let xid = stream_xid(&mut body)?;
                need(&body, 4 + 1, "insert")?;
                let relation_oid = body.get_u32();
                match body.get_u8() {
                    b'N' => { },
                    tag => return Err(ProtocolError::unexpected_phase(tag, "insert tuple")),
                }
                ReplicationBody::Insert {
                    xid,
                    relation_oid,
                    new: decode_tuple(&mut body)?,
                }
            },
            b'U' => {
                let xid = stream_xid(&mut body)?;
                need(&body, 4, "update")?;
                let relation_oid = body.get_u32();

                let mut key = None;
                let mut old = None;
                let new = loop {
                    need(&body, 1, "update tuple")?;
                    match body.get_u8() {
                        b'K' => key = Some(decode_tuple(&mut body)?),
                        b'O' => old = Some(decode_tuple(&mut body)?),
                        b'N' => break decode_tuple(&mut body)?,
                        tag => return Err(ProtocolError::unexpected_phase(tag, "update tuple")),
                    }
                };
                ReplicationBody::Update { xid, relation_oid, key, old, new }
            },
            b'D' => {
                let xid = stream_xid(&mut body)?;
                need(&body, 4 + 1, "delete")?;
                let relation_oid = body.get_u32();

                let (mut key, mut old) = (None, None);
                match body.get_u8() {
                    b'K' => key = Some(decode_tuple(&mut body)?),
                    b'O' => old = Some(decode_tuple(&mut body)?),
                    tag => return Err(ProtocolError::unexpected_phase(tag, "delete tuple")),
                }
                ReplicationBody::Delete { xid, relation_oid, key, old }
            },
            b'T' => {
                let xid = stream_xid(&mut body)?;
                need(&body, 4 + 1, "truncate")?;
                let relation_len = body.get_i32();
                let options = body.get_u8();
                let mut relation_oids = Vec::with_capacity(relation_len.max(0) as usize);
                for _ in 0..relation_len {
                    need(&body, 4, "truncate relation")?;
                    relation_oids.push(body.get_u32());
                }
                ReplicationBody::Truncate { xid, options, relation_oids }
            },
            b'S' => {
                need(&body, 4 + 1, "stream start")?;
                let xid = body.get_u32();
                let first_segment = body.get_u8() == 1;
                self.in_stream = Some(xid);
                self.streaming.insert(xid);
                verbose!("stream block opened for xid {xid}");
                ReplicationBody::StreamStart { xid, first_segment }
            },
            b'E' => {
                self.in_stream = None;
                ReplicationBody::StreamStop
            },
            b'c' => {
                need(&body, 4 + 1 + 8 + 8 + 8, "stream commit")?;
                let xid = body.get_u32();
                self.streaming.remove(&xid);
                ReplicationBody::StreamCommit {
                    xid,
                    flags: body.get_u8(),
                    commit_lsn: Lsn(body.get_u64()),
                    end_lsn: Lsn(body.get_u64()),
                    commit_time: body.get_i64(),
                }
            },
            b'A' => {
                need(&body, 4 + 4, "stream abort")?;
                let abort = StreamAbort {
                    xid: body.get_u32(),
                    subtransaction_xid: body.get_u32(),
                };
                if abort.is_top_level() {
                    self.streaming.remove(&abort.xid);
                }
                ReplicationBody::StreamAbort(abort)
            },
            tag => return Err(ProtocolError::unexpected_phase(tag, "replication stream")),
        };
        Ok(decoded)
    }
}

fn decode_tuple(body: &mut Bytes) -> Result<TupleData, ProtocolError> {
    need(body, 2, "tuple")?;
    let column_len = body.get_i16();
    let mut values = Vec::with_capacity(column_len.max(0) as usize);

    for _ in 0..column_len {
        need(body, 1, "tuple column")?;
        let value = match body.get_u8() {
            b'n' => TupleValue::Null,
            b'u' => TupleValue::Toast,
            kind @ (b't' | b'b') => {
                need(body, 4, "tuple column")?;
                let len = body.get_i32();
                if len < 0 || body.remaining() < len as usize {
                    return Err(ProtocolError::truncated("tuple column"));
                }
                let bytes = body.split_to(len as usize);
                match kind {
                    b't' => TupleValue::Text(bytes),
                    _ => TupleValue::Binary(bytes),
                }
            },
            tag => return Err(ProtocolError::unexpected_phase(tag, "tuple column")),
        };
        values.push(value);
    }
    Ok(TupleData(values))
}

/// A transport adapted into a stream of decoded replication messages.
///
/// Built on the frame codec alone: frames arrive as CopyData, the stream
/// ends at CopyDone, and progress acks go out as CopyData in the other
/// direction.
#[derive(Debug)]
pub struct ReplicationStream<T> {
    io: T,
    decoder: PgOutputDecoder,
    done: bool,
}

impl<T: PgTransport> ReplicationStream<T> {
    /// Issue a `START_REPLICATION` command over `io` (which must be a
    /// connection in replication mode) and enter copy-both mode.
    pub async fn start(mut io: T, command: &str) -> Result<Self> {
        io.send(frontend::Query { sql: command });
        io.flush().await?;

        loop {
            let (tag, body) = io.recv_frame().await?;
            match tag {
                backend::CopyBothResponse::MSGTYPE => {
                    return Ok(Self { io, decoder: PgOutputDecoder::new(), done: false });
                },
                backend::NoticeResponse::MSGTYPE => continue,
                backend::ErrorResponse::MSGTYPE => {
                    let err = backend::ErrorResponse { body };
                    return Err(err.to_db_error()?.into());
                },
                tag => return Err(ProtocolError::unexpected_phase(tag, "starting replication").into()),
            }
        }
    }

    pub fn decoder(&self) -> &PgOutputDecoder {
        &self.decoder
    }

    /// Report consumer progress to the server.
    pub async fn status_update(&mut self, status: frontend::StandbyStatus) -> Result<()> {
        self.io.send(status);
        self.io.flush().await?;
        Ok(())
    }

    /// Produce the next message, `None` once the server ends the stream.
    pub async fn next_message(&mut self) -> Result<Option<ReplicationMessage>> {
        std::future::poll_fn(|cx| self.poll_next_message(cx)).await.transpose()
    }

    fn poll_next_message(
        &mut self,
        cx: &mut Context,
    ) -> Poll<Option<Result<ReplicationMessage>>> {
        if self.done {
            return Poll::Ready(None);
        }
        loop {
            let (tag, body) = match ready!(self.io.poll_recv_frame(cx)) {
                Ok(frame) => frame,
                Err(err) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(err)));
                },
            };
            match tag {
                backend::CopyData::MSGTYPE => match self.decoder.decode(body) {
                    Ok(message) => return Poll::Ready(Some(Ok(message))),
                    Err(err) => {
                        self.done = true;
                        return Poll::Ready(Some(Err(err.into())));
                    },
                },
                backend::CopyDone::MSGTYPE => {
                    self.done = true;
                    return Poll::Ready(None);
                },
                backend::NoticeResponse::MSGTYPE => continue,
                backend::ErrorResponse::MSGTYPE => {
                    self.done = true;
                    let err = backend::ErrorResponse { body };
                    return Poll::Ready(Some(match err.to_db_error() {
                        Ok(db) => Err(db.into()),
                        Err(protocol) => Err(protocol.into()),
                    }));
                },
                tag => {
                    self.done = true;
                    let err = ProtocolError::unexpected_phase(tag, "replication stream");
                    return Poll::Ready(Some(Err(err.into())));
                },
            }
        }
    }
}

impl<T: PgTransport> Stream for ReplicationStream<T> {
    type Item = Result<ReplicationMessage>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_next_message(cx)
    }
}

#[cfg(test)]
mod test {
    use bytes::{BufMut, BytesMut};

    use super::*;

    fn payload(tag: u8, build: impl FnOnce(&mut BytesMut)) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(tag);
        buf.put_u64(100); // wal start
        buf.put_u64(200); // wal end
        buf.put_i64(300); // server clock
        build(&mut buf);
        buf.freeze()
    }

    fn insert_payload(xid: Option<u32>) -> Bytes {
        payload(b'I', |buf| {
            if let Some(xid) = xid {
                buf.put_u32(xid);
            }
            buf.put_u32(4242); // relation oid
            buf.put_u8(b'N');
            buf.put_i16(2);
            buf.put_u8(b't');
            buf.put_i32(2);
            buf.put_slice(b"42");
            buf.put_u8(b'n');
        })
    }

    #[test]
    fn prelude_is_shared_by_every_variant() {
        let mut decoder = PgOutputDecoder::new();
        let msg = decoder
            .decode(payload(b'B', |buf| {
                buf.put_u64(500);
                buf.put_i64(600);
                buf.put_u32(77);
            }))
            .unwrap();

        assert_eq!(msg.wal_start, Lsn(100));
        assert_eq!(msg.wal_end, Lsn(200));
        assert_eq!(msg.server_clock, 300);
        assert!(matches!(
            msg.body,
            ReplicationBody::Begin { final_lsn: Lsn(500), commit_time: 600, xid: 77 },
        ));
    }

    #[test]
    fn stream_abort_classification() {
        let abort = |xid: u32, sub: u32| {
            let mut decoder = PgOutputDecoder::new();
            let msg = decoder
                .decode(payload(b'A', |buf| {
                    buf.put_u32(xid);
                    buf.put_u32(sub);
                }))
                .unwrap();
            match msg.body {
                ReplicationBody::StreamAbort(abort) => abort,
                body => panic!("expected StreamAbort, got {body:?}"),
            }
        };

        assert!(abort(77, 77).is_top_level(), "equal ids abort the whole transaction");
        assert!(!abort(77, 81).is_top_level(), "a subtransaction-only abort");
    }

    #[test]
    fn row_changes_carry_explicit_xid_only_while_streaming() {
        let mut decoder = PgOutputDecoder::new();

        // outside any stream block the transaction is implied
        let msg = decoder.decode(insert_payload(None)).unwrap();
        let ReplicationBody::Insert { xid: None, relation_oid: 4242, ref new } = msg.body else {
            panic!("unexpected body {:?}", msg.body);
        };
        assert_eq!(new.0.len(), 2);

        decoder
            .decode(payload(b'S', |buf| {
                buf.put_u32(5);
                buf.put_u8(1);
            }))
            .unwrap();
        assert!(decoder.is_streaming(5));

        let msg = decoder.decode(insert_payload(Some(5))).unwrap();
        assert!(matches!(msg.body, ReplicationBody::Insert { xid: Some(5), .. }));

        // after the block closes, plain changes are implied again
        decoder.decode(payload(b'E', |_| { })).unwrap();
        let msg = decoder.decode(insert_payload(None)).unwrap();
        assert!(matches!(msg.body, ReplicationBody::Insert { xid: None, .. }));
        assert!(decoder.is_streaming(5), "xid 5 still streams until commit or abort");

        decoder
            .decode(payload(b'c', |buf| {
                buf.put_u32(5);
                buf.put_u8(0);
                buf.put_u64(0);
                buf.put_u64(0);
                buf.put_i64(0);
            }))
            .unwrap();
        assert!(!decoder.is_streaming(5));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut decoder = PgOutputDecoder::new();
        let err = decoder.decode(Bytes::from_static(&[b'B', 0, 0])).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { .. }));
    }

    #[tokio::test]
    async fn stream_yields_messages_until_copy_done() {
        use crate::transport::mock::{self, MockTransport};

        let io = MockTransport::new(vec![
            mock::copy_both_response(),
            mock::copy_data(&insert_payload(None)),
            mock::copy_done(),
        ]);
        let mut stream = ReplicationStream::start(io, "START_REPLICATION SLOT s LOGICAL 0/0")
            .await
            .unwrap();

        let first = stream.next_message().await.unwrap().unwrap();
        assert!(matches!(first.body, ReplicationBody::Insert { .. }));
        assert!(stream.next_message().await.unwrap().is_none());
        // the stream stays finished
        assert!(stream.next_message().await.unwrap().is_none());
    }
}
