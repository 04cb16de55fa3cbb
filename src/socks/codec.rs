use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::cipher::Transform;

/// Read half of the client socket; decrypts everything it reads.
pub struct DecodeReader<R> {
    inner: R,
    transform: Box<dyn Transform>,
}

impl<R: AsyncRead + Unpin> DecodeReader<R> {
    pub fn new(inner: R, transform: Box<dyn Transform>) -> Self {
        DecodeReader { inner, transform }
    }

    /// A single read, decrypted in place. `Ok(0)` is end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf).await?;
        self.transform.decrypt(&mut buf[..n]);
        Ok(n)
    }
}

/// Write half of the client socket; encrypts everything it writes.
pub struct EncodeWriter<W> {
    inner: W,
    transform: Box<dyn Transform>,
}

impl<W: AsyncWrite + Unpin> EncodeWriter<W> {
    pub fn new(inner: W, transform: Box<dyn Transform>) -> Self {
        EncodeWriter { inner, transform }
    }

    /// Encrypts a copy of `msg` and writes it. Returns how many bytes went
    /// out; anything below `msg.len()` is a short write.
    pub async fn write(&mut self, msg: &[u8]) -> io::Result<usize> {
        let mut buf: super::Bytes = msg.into();
        self.write_in_place(&mut buf).await
    }

    /// Like [`EncodeWriter::write`], but encrypts `buf` itself.
    pub async fn write_in_place(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.transform.encrypt(buf);
        write_counted(&mut self.inner, buf).await
    }
}

/// Writes as much of `buf` as the peer accepts, stopping early only if a
/// write makes no progress.
pub async fn write_counted(w: &mut (impl AsyncWrite + Unpin), buf: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < buf.len() {
        match w.write(&buf[written..]).await? {
            0 => break,
            n => written += n,
        }
    }
    Ok(written)
}
