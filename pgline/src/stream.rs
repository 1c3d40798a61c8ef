//! Buffered frame codec over a byte stream.
use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{
    Result,
    common::verbose,
    config::DEFAULT_MAX_FRAME_LEN,
    protocol::{BACKEND_TAGS, FrontendProtocol, ProtocolError, frontend},
    transport::PgTransport,
};

const DEFAULT_BUF_CAPACITY: usize = 1024;

/// Buffered connection to postgres.
///
/// Reads and writes length-prefixed, tag-identified frames; it has no
/// knowledge of statement semantics. Outgoing messages accumulate in the
/// write buffer until an explicit flush, so a caller controls the
/// pipelining boundaries.
#[derive(Debug)]
pub struct PgStream<IO> {
    io: IO,
    read_buf: BytesMut,
    write_buf: BytesMut,
    max_frame_len: usize,
}

impl<IO> PgStream<IO> {
    pub fn new(io: IO) -> Self {
        Self::with_max_frame_len(io, DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(io: IO, max_frame_len: usize) -> Self {
        Self {
            io,
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            max_frame_len,
        }
    }

    /// Consume self into the underlying io.
    pub fn into_inner(self) -> IO {
        self.io
    }
}

impl<IO> PgTransport for PgStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = ready!(Pin::new(&mut self.io).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.advance(n);
        }
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_recv_frame(&mut self, cx: &mut Context) -> Poll<Result<(u8, Bytes)>> {
        loop {
            if let Some(mut header) = self.read_buf.get(..5) {
                let msgtype = header.get_u8();
                let len = header.get_i32();

                if len < 4 {
                    return Poll::Ready(Err(ProtocolError::bad_length(len).into()));
                }
                let body_len = len as usize - 4;
                if body_len > self.max_frame_len {
                    return Poll::Ready(Err(
                        ProtocolError::frame_too_large(body_len, self.max_frame_len).into(),
                    ));
                }

                // No semantic validation here; an unknown tag passes through
                // for the state machine to reject.
                debug_assert!(
                    BACKEND_TAGS.contains(&msgtype),
                    "unknown backend message tag {:?}",
                    msgtype as char,
                );

                if self.read_buf.len() >= 5 + body_len {
                    self.read_buf.advance(5);
                    let body = self.read_buf.split_to(body_len).freeze();
                    verbose!("recv frame {:?} ({} bytes)", msgtype as char, body.len());
                    return Poll::Ready(Ok((msgtype, body)));
                }

                self.read_buf.reserve(5 + body_len - self.read_buf.len());
            } else {
                self.read_buf.reserve(DEFAULT_BUF_CAPACITY);
            }

            let n = {
                let dst = self.read_buf.chunk_mut();
                let dst = unsafe { dst.as_uninit_slice_mut() };
                let mut buf = ReadBuf::uninit(dst);
                let ptr = buf.filled().as_ptr();
                ready!(Pin::new(&mut self.io).poll_read(cx, &mut buf)?);

                // Ensure the pointer does not change from under us
                assert_eq!(ptr, buf.filled().as_ptr());
                buf.filled().len()
            };

            if n == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed mid frame",
                )
                .into()));
            }

            // Safety: This is guaranteed to be the number of initialized (and read)
            // bytes due to the invariants provided by `ReadBuf::filled`.
            unsafe {
                self.read_buf.advance_mut(n);
            }
        }
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        frontend::write(message, &mut self.write_buf);
    }

    fn send_startup(&mut self, startup: frontend::Startup) {
        startup.write(&mut self.write_buf);
    }

    fn send_cancel(&mut self, cancel: frontend::CancelRequest) {
        cancel.write(&mut self.write_buf);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{error::ErrorKind, transport::PgTransportExt};

    fn frame_bytes(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut buf = vec![tag];
        buf.extend_from_slice(&(body.len() as u32 + 4).to_be_bytes());
        buf.extend_from_slice(body);
        buf
    }

    #[tokio::test]
    async fn reassembles_a_frame_split_across_reads() {
        let (client, mut server) = tokio::io::duplex(16);
        let mut stream = PgStream::new(client);

        let bytes = frame_bytes(b'Z', b"I");
        let write = async {
            use tokio::io::AsyncWriteExt;
            for chunk in bytes.chunks(2) {
                server.write_all(chunk).await.unwrap();
            }
        };
        let (frame, _) = tokio::join!(stream.recv_frame(), write);
        let (tag, body) = frame.unwrap();
        assert_eq!(tag, b'Z');
        assert_eq!(&body[..], b"I");
    }

    #[tokio::test]
    async fn oversized_declared_length_is_a_framing_error() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = PgStream::with_max_frame_len(client, 16);

        use tokio::io::AsyncWriteExt;
        let mut bytes = vec![b'D'];
        bytes.extend_from_slice(&1024u32.to_be_bytes());
        server.write_all(&bytes).await.unwrap();

        let err = stream.recv_frame().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Protocol(ProtocolError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn declared_length_below_minimum_is_a_framing_error() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = PgStream::new(client);

        use tokio::io::AsyncWriteExt;
        let mut bytes = vec![b'Z'];
        bytes.extend_from_slice(&1u32.to_be_bytes());
        server.write_all(&bytes).await.unwrap();

        let err = stream.recv_frame().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Protocol(ProtocolError::BadLength { .. })));
    }

    #[tokio::test]
    async fn stream_closing_mid_frame_is_an_error() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = PgStream::new(client);

        use tokio::io::AsyncWriteExt;
        // declared 16 byte body, then hang up after 2
        let mut bytes = frame_bytes(b'D', &[0u8; 16]);
        bytes.truncate(7);
        server.write_all(&bytes).await.unwrap();
        drop(server);

        let err = stream.recv_frame().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Io(_)));
    }

    #[tokio::test]
    async fn sends_are_buffered_until_flush() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut stream = PgStream::new(client);

        stream.send(frontend::Sync);
        stream.send(frontend::Flush);

        stream.flush().await.unwrap();

        use tokio::io::AsyncReadExt;
        let mut read = vec![0u8; 10];
        server.read_exact(&mut read).await.unwrap();
        assert_eq!(read, [b'S', 0, 0, 0, 4, b'H', 0, 0, 0, 4]);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "unknown backend message tag")]
    fn unknown_tag_trips_the_debug_assertion() {
        let (client, _server) = tokio::io::duplex(64);
        let mut stream = PgStream::new(client);
        stream.read_buf.extend_from_slice(&frame_bytes(b'@', b""));

        let mut cx = Context::from_waker(std::task::Waker::noop());
        let _ = stream.poll_recv_frame(&mut cx);
    }
}
