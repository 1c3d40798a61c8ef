//! The [`PgTransport`] trait.
use std::{
    io,
    task::{Context, Poll},
};

use bytes::Bytes;

use crate::{
    Result,
    protocol::{BackendProtocol, FrontendProtocol, frontend},
};

/// A buffered stream which can send and receive postgres message.
///
/// This is the seam between the protocol engine and the byte transport:
/// the engine is handed an already-open transport and never dials or
/// encrypts sockets itself.
pub trait PgTransport: Unpin {
    /// Poll to flush the underlying io.
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>>;

    /// Poll to receive one full frame, `(tag, payload)`.
    ///
    /// A partial frame is never returned; implementors buffer until the
    /// declared length is available. The payload excludes the tag and the
    /// length field.
    fn poll_recv_frame(&mut self, cx: &mut Context) -> Poll<Result<(u8, Bytes)>>;

    /// Send message to the backend.
    ///
    /// Note that this send is buffered, caller must also call
    /// [`poll_flush`][1] or [`flush`][2] afterwards.
    ///
    /// [1]: PgTransport::poll_flush
    /// [2]: PgTransportExt::flush
    fn send<F: FrontendProtocol>(&mut self, message: F);

    /// Send [`Startup`][1] message to the backend.
    ///
    /// For historical reasons, the very first message sent by the client (the startup message)
    /// has no initial message-type byte.
    ///
    /// Thus, [`Startup`][1] does not implement [`FrontendProtocol`]
    ///
    /// [1]: frontend::Startup
    fn send_startup(&mut self, startup: frontend::Startup);

    /// Send a [`CancelRequest`][1], which also has no message-type byte.
    ///
    /// Only meaningful on a *separate* connection from the one running the
    /// query to be cancelled.
    ///
    /// [1]: frontend::CancelRequest
    fn send_cancel(&mut self, cancel: frontend::CancelRequest);
}

impl<P> PgTransport for &mut P where P: PgTransport {
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        P::poll_flush(self, cx)
    }

    fn poll_recv_frame(&mut self, cx: &mut Context) -> Poll<Result<(u8, Bytes)>> {
        P::poll_recv_frame(self, cx)
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        P::send(self, message);
    }

    fn send_startup(&mut self, startup: frontend::Startup) {
        P::send_startup(self, startup);
    }

    fn send_cancel(&mut self, cancel: frontend::CancelRequest) {
        P::send_cancel(self, cancel);
    }
}

/// An extension trait to provide `Future` API for [`PgTransport`].
pub trait PgTransportExt: PgTransport {
    /// Flush the underlying io.
    fn flush(&mut self) -> impl Future<Output = io::Result<()>> {
        std::future::poll_fn(|cx| self.poll_flush(cx))
    }

    /// Receive one raw frame.
    fn recv_frame(&mut self) -> impl Future<Output = Result<(u8, Bytes)>> {
        std::future::poll_fn(|cx| self.poll_recv_frame(cx))
    }

    /// Receive and decode a backend message.
    fn recv<B: BackendProtocol>(&mut self) -> impl Future<Output = Result<B>> {
        async {
            let (tag, body) = self.recv_frame().await?;
            Ok(B::decode(tag, body)?)
        }
    }
}

impl<T> PgTransportExt for T where T: PgTransport { }

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted in-memory transport for state machine tests.
    use std::collections::VecDeque;

    use bytes::{BufMut, BytesMut};

    use super::*;
    use crate::protocol::frontend;

    pub(crate) struct MockTransport {
        script: VecDeque<(u8, Bytes)>,
        sent: BytesMut,
        /// Offset where tagged traffic begins, past untagged startup/cancel
        /// messages.
        tagged_from: usize,
        pub flushes: usize,
    }

    impl MockTransport {
        pub fn new(script: Vec<(u8, Bytes)>) -> Self {
            Self { script: script.into(), sent: BytesMut::new(), tagged_from: 0, flushes: 0 }
        }

        /// Bytes of frontend traffic written so far.
        pub fn sent_len(&self) -> usize {
            self.sent.len()
        }

        /// Raw frontend traffic written so far.
        pub fn sent(&self) -> &[u8] {
            &self.sent
        }

        /// Tags of framed messages written so far, in order, skipping any
        /// leading untagged startup/cancel traffic.
        pub fn sent_tags(&self) -> Vec<u8> {
            let mut tags = Vec::new();
            let mut rest = &self.sent[self.tagged_from..];
            while rest.len() >= 5 {
                tags.push(rest[0]);
                let len = u32::from_be_bytes(rest[1..5].try_into().unwrap()) as usize;
                rest = &rest[1 + len..];
            }
            tags
        }
    }

    impl PgTransport for MockTransport {
        fn poll_flush(&mut self, _: &mut Context) -> Poll<io::Result<()>> {
            self.flushes += 1;
            Poll::Ready(Ok(()))
        }

        fn poll_recv_frame(&mut self, _: &mut Context) -> Poll<Result<(u8, Bytes)>> {
            match self.script.pop_front() {
                Some(frame) => Poll::Ready(Ok(frame)),
                None => Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "mock script exhausted",
                )
                .into())),
            }
        }

        fn send<F: FrontendProtocol>(&mut self, message: F) {
            frontend::write(message, &mut self.sent);
        }

        fn send_startup(&mut self, startup: frontend::Startup) {
            startup.write(&mut self.sent);
            self.tagged_from = self.sent.len();
        }

        fn send_cancel(&mut self, cancel: frontend::CancelRequest) {
            cancel.write(&mut self.sent);
            self.tagged_from = self.sent.len();
        }
    }

    fn frame(tag: u8, body: &[u8]) -> (u8, Bytes) {
        (tag, Bytes::copy_from_slice(body))
    }

    pub(crate) fn auth_ok() -> (u8, Bytes) {
        frame(b'R', &0i32.to_be_bytes())
    }

    pub(crate) fn auth_cleartext() -> (u8, Bytes) {
        frame(b'R', &3i32.to_be_bytes())
    }

    pub(crate) fn backend_key_data(process_id: i32, secret_key: i32) -> (u8, Bytes) {
        let mut body = BytesMut::new();
        body.put_i32(process_id);
        body.put_i32(secret_key);
        (b'K', body.freeze())
    }

    pub(crate) fn parameter_status(name: &str, value: &str) -> (u8, Bytes) {
        let mut body = BytesMut::new();
        body.put(name.as_bytes());
        body.put_u8(0);
        body.put(value.as_bytes());
        body.put_u8(0);
        (b'S', body.freeze())
    }

    pub(crate) fn ready(status: u8) -> (u8, Bytes) {
        frame(b'Z', &[status])
    }

    pub(crate) fn parse_complete() -> (u8, Bytes) {
        frame(b'1', &[])
    }

    pub(crate) fn bind_complete() -> (u8, Bytes) {
        frame(b'2', &[])
    }

    pub(crate) fn close_complete() -> (u8, Bytes) {
        frame(b'3', &[])
    }

    pub(crate) fn no_data() -> (u8, Bytes) {
        frame(b'n', &[])
    }

    pub(crate) fn command_complete(tag: &str) -> (u8, Bytes) {
        let mut body = BytesMut::from(tag.as_bytes());
        body.put_u8(0);
        (b'C', body.freeze())
    }

    pub(crate) fn error_response(code: &str) -> (u8, Bytes) {
        let mut body = BytesMut::new();
        for (tag, value) in [(b'S', "ERROR"), (b'C', code), (b'M', "scripted failure")] {
            body.put_u8(tag);
            body.put(value.as_bytes());
            body.put_u8(0);
        }
        body.put_u8(0);
        (b'E', body.freeze())
    }

    pub(crate) fn row_description(columns: &[(&str, u32)]) -> (u8, Bytes) {
        let mut body = BytesMut::new();
        body.put_i16(columns.len() as i16);
        for (name, oid) in columns {
            body.put(name.as_bytes());
            body.put_u8(0);
            body.put_u32(0); // table oid
            body.put_i16(0); // attribute
            body.put_u32(*oid);
            body.put_i16(-1); // type size
            body.put_i32(-1); // type modifier
            body.put_i16(1); // binary
        }
        (b'T', body.freeze())
    }

    pub(crate) fn data_row(values: &[Option<&[u8]>]) -> (u8, Bytes) {
        let mut body = BytesMut::new();
        body.put_u16(values.len() as u16);
        for value in values {
            match value {
                Some(v) => {
                    body.put_i32(v.len() as i32);
                    body.put(*v);
                },
                None => body.put_i32(-1),
            }
        }
        (b'D', body.freeze())
    }

    pub(crate) fn copy_both_response() -> (u8, Bytes) {
        let mut body = BytesMut::new();
        body.put_i8(0);
        body.put_i16(0);
        (b'W', body.freeze())
    }

    pub(crate) fn copy_data(payload: &[u8]) -> (u8, Bytes) {
        frame(b'd', payload)
    }

    pub(crate) fn copy_done() -> (u8, Bytes) {
        frame(b'c', &[])
    }
}
