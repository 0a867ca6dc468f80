//! Module to rewind a readable stream after prefix sniffing.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// An IO wrapper which replays bytes already read from `inner` before reading any more.
#[derive(Debug)]
pub struct Rewind<IO> {
    inner: IO,
    prefix: Option<Bytes>,
}

impl<IO> Rewind<IO> {
    pub(crate) fn new<B>(inner: IO, prefix: B) -> Self
    where
        B: Into<Bytes>,
    {
        let prefix = prefix.into();
        Self {
            inner,
            prefix: (!prefix.is_empty()).then_some(prefix),
        }
    }

    /// Bytes which have been sniffed but not yet replayed.
    #[cfg(test)]
    pub(crate) fn pending(&self) -> &[u8] {
        self.prefix.as_deref().unwrap_or_default()
    }

    pub(crate) fn get_ref(&self) -> &IO {
        &self.inner
    }
}

impl<IO> AsyncRead for Rewind<IO>
where
    IO: AsyncRead + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(mut prefix) = self.prefix.take() {
            let n = prefix.len().min(buf.remaining());
            buf.put_slice(&prefix[..n]);
            prefix.advance(n);

            if !prefix.is_empty() {
                self.prefix = Some(prefix);
            }
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<IO> AsyncWrite for Rewind<IO>
where
    IO: AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
