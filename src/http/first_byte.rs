use crate::http::tracer::Tracer;
use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Holds the tracer of the request currently in flight on a connection.
///
/// Armed right before a request is written; the first non-empty read that
/// follows takes the tracer out and fires its first-byte hook.
#[derive(Clone, Debug, Default)]
pub struct FirstByteSlot(Arc<Mutex<Option<Tracer>>>);

impl FirstByteSlot {
    pub fn arm(&self, tracer: Tracer) {
        *self.0.lock() = Some(tracer);
    }

    fn fire(&self) {
        let armed = self.0.lock().take();
        if let Some(tracer) = armed {
            tracer.on_first_response_byte();
        }
    }
}

/// A connection stream that reports when response bytes start arriving.
#[derive(Debug)]
pub struct FirstByteStream<S> {
    inner: S,
    slot: FirstByteSlot,
}

impl<S> FirstByteStream<S> {
    pub fn new(inner: S) -> (Self, FirstByteSlot) {
        let slot = FirstByteSlot::default();
        (
            Self {
                inner,
                slot: slot.clone(),
            },
            slot,
        )
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for FirstByteStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            if buf.filled().len() > before {
                this.slot.fire();
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for FirstByteStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_reads_before_arm_do_not_fire() {
        let (client, mut server) = tokio::io::duplex(64);
        let (mut stream, slot) = FirstByteStream::new(client);
        let tracer = Tracer::new();

        server.write_all(b"leftover").await.unwrap();
        let mut buf = [0u8; 8];
        stream.read_exact(&mut buf).await.unwrap();

        slot.arm(tracer.clone());
        assert!(tracer.timestamps().first_byte.is_none());

        server.write_all(b"HTTP/1.1").await.unwrap();
        stream.read_exact(&mut buf).await.unwrap();
        assert!(tracer.timestamps().first_byte.is_some());
    }

    #[tokio::test]
    async fn test_eof_does_not_fire() {
        let (client, server) = tokio::io::duplex(64);
        let (mut stream, slot) = FirstByteStream::new(client);
        let tracer = Tracer::new();
        slot.arm(tracer.clone());

        drop(server);
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert!(tracer.timestamps().first_byte.is_none());
    }

    #[tokio::test]
    async fn test_armed_read_fires_once() {
        let (client, mut server) = tokio::io::duplex(64);
        let (mut stream, slot) = FirstByteStream::new(client);
        let tracer = Tracer::new();
        slot.arm(tracer.clone());

        server.write_all(b"HTTP/1.1 ").await.unwrap();
        let mut buf = [0u8; 9];
        stream.read_exact(&mut buf).await.unwrap();
        let first = tracer.timestamps().first_byte;
        assert!(first.is_some());

        server.write_all(b"200 OK\r\n").await.unwrap();
        let mut buf = [0u8; 8];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(tracer.timestamps().first_byte, first);
    }
}
