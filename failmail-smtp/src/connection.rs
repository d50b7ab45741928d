//! A server-side connection that can be upgraded from plain TCP to TLS in
//! place, with buffered line-oriented reading.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{server::TlsStream, TlsAcceptor};

const READ_CHUNK: usize = 8192;

/// Longest line the server will buffer before giving up on the client.
const MAX_LINE: usize = 64 * 1024;

enum Inner<Stream> {
    Plain(Stream),
    Tls(Box<TlsStream<Stream>>),
    /// Transient state while a STARTTLS handshake is in flight; observable
    /// only if the handshake fails and the session is being torn down.
    Upgrading,
}

pub struct Connection<Stream> {
    inner: Inner<Stream>,
    /// Bytes read but not yet consumed as lines.
    buffer: Vec<u8>,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Connection<Stream> {
    pub fn new(stream: Stream) -> Self {
        Self {
            inner: Inner::Plain(stream),
            buffer: Vec::new(),
        }
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self.inner, Inner::Tls(_))
    }

    /// Send one CRLF-terminated line.
    pub async fn send_line(&mut self, line: &str) -> io::Result<()> {
        let mut bytes = Vec::with_capacity(line.len() + 2);
        bytes.extend_from_slice(line.as_bytes());
        bytes.extend_from_slice(b"\r\n");

        match &mut self.inner {
            Inner::Plain(stream) => stream.write_all(&bytes).await,
            Inner::Tls(stream) => stream.write_all(&bytes).await,
            Inner::Upgrading => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    /// Read one line, without its terminator. `None` means a clean EOF.
    ///
    /// # Errors
    /// On connection errors, or when the client exceeds the line cap.
    pub async fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(line));
            }

            if self.buffer.len() > MAX_LINE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "line too long",
                ));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let read = match &mut self.inner {
                Inner::Plain(stream) => stream.read(&mut chunk).await?,
                Inner::Tls(stream) => stream.read(&mut chunk).await?,
                Inner::Upgrading => {
                    return Err(io::Error::from(io::ErrorKind::NotConnected));
                }
            };

            if read == 0 {
                return Ok(None);
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }

    /// Upgrade the connection in place after a successful `STARTTLS`
    /// exchange. Any bytes the client pipelined ahead of the handshake are
    /// discarded along with the rest of the pre-TLS session state.
    ///
    /// # Errors
    /// If the TLS handshake fails or the connection is already TLS. After a
    /// handshake failure the connection is unusable and should be dropped.
    pub async fn upgrade(&mut self, acceptor: &TlsAcceptor) -> io::Result<()> {
        match std::mem::replace(&mut self.inner, Inner::Upgrading) {
            Inner::Plain(stream) => {
                let stream = acceptor.accept(stream).await?;
                self.inner = Inner::Tls(Box::new(stream));
                self.buffer.clear();
                Ok(())
            }
            tls @ Inner::Tls(_) => {
                self.inner = tls;
                Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "connection is already TLS",
                ))
            }
            Inner::Upgrading => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lines_split_on_crlf_and_bare_lf() {
        let (client, server) = tokio::io::duplex(1024);
        let mut connection = Connection::new(server);

        let (mut read_half, mut write_half) = tokio::io::split(client);
        write_half.write_all(b"EHLO box\r\nNOOP\nQUIT\r\n").await.unwrap();

        assert_eq!(connection.read_line().await.unwrap().unwrap(), b"EHLO box");
        assert_eq!(connection.read_line().await.unwrap().unwrap(), b"NOOP");
        assert_eq!(connection.read_line().await.unwrap().unwrap(), b"QUIT");

        drop(write_half);
        assert!(connection.read_line().await.unwrap().is_none());

        connection.send_line("220 hi").await.unwrap();
        let mut reply = [0u8; 8];
        read_half.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"220 hi\r\n");
    }

    #[tokio::test]
    async fn oversized_lines_are_an_error() {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let mut connection = Connection::new(server);

        let (_read_half, mut write_half) = tokio::io::split(client);
        write_half.write_all(&vec![b'a'; MAX_LINE + 2]).await.unwrap();

        assert!(connection.read_line().await.is_err());
    }
}
