//! Transport layer: a buffered, line-oriented connection that can be
//! upgraded from plaintext to TLS in place.
//!
//! The connection owns the unconsumed read buffer, which is what makes
//! both pipelining and the STARTTLS injection check work: pipelined
//! commands simply wait in the buffer, and a nonempty buffer at upgrade
//! time is visible to the session as evidence of smuggled plaintext.

use std::{fmt::Write as _, fs::File, io::BufReader, sync::Arc};

use arrayvec::ArrayString;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ServerConfig,
        pki_types::{CertificateDer, PrivateKeyDer},
    },
    server::TlsStream,
};

use crate::{
    error::{ConnectionError, ConnectionResult, TlsError, TlsResult},
    options::TlsContext,
    reply::Reply,
};

const READ_CHUNK: usize = 4096;

/// One line of the DATA phase, after dot-unstuffing.
#[derive(Debug, PartialEq, Eq)]
pub enum DataLine {
    /// A body line, terminator stripped.
    Line(Vec<u8>),
    /// The lone `.` terminator.
    EndOfMessage,
}

enum Transport<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    Plain(Stream),
    Tls(Box<TlsStream<Stream>>),
    /// Transient state while STARTTLS swaps the stream. Only observable
    /// if the handshake failed, after which the session is torn down;
    /// any I/O against it reports the connection as closed.
    Upgrading,
}

pub struct Connection<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    transport: Transport<Stream>,
    /// Bytes read from the peer but not yet consumed as lines.
    buffer: Vec<u8>,
    max_line_length: usize,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Connection<Stream> {
    pub fn new(stream: Stream, max_line_length: usize) -> Self {
        Self {
            transport: Transport::Plain(stream),
            buffer: Vec::new(),
            max_line_length,
        }
    }

    /// Whether the session has been upgraded to TLS.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self.transport, Transport::Tls(_))
    }

    /// Unconsumed bytes sitting in the read buffer.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Read one CRLF-terminated command line, without the terminator.
    ///
    /// # Errors
    ///
    /// `Closed` on EOF, `LineTooLong` past the cap (the offending
    /// bytes are drained through the next CRLF so the session can
    /// answer 500 and carry on).
    pub async fn read_line(&mut self) -> ConnectionResult<Vec<u8>> {
        loop {
            if let Some(pos) = find_crlf(&self.buffer) {
                let mut line: Vec<u8> = self.buffer.drain(..pos + 2).collect();
                line.truncate(pos);

                if pos > self.max_line_length {
                    return Err(ConnectionError::LineTooLong(self.max_line_length));
                }
                return Ok(line);
            }

            if self.buffer.len() > self.max_line_length + 2 {
                self.discard_through(b"\r\n").await?;
                return Err(ConnectionError::LineTooLong(self.max_line_length));
            }

            self.fill().await?;
        }
    }

    /// Read one DATA-phase line: bare LF is tolerated as a terminator,
    /// a leading dot is unstuffed, and a lone dot is the end-of-message
    /// sentinel.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`read_line`](Self::read_line).
    pub async fn read_data_line(&mut self) -> ConnectionResult<DataLine> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }

                if line.len() > self.max_line_length {
                    return Err(ConnectionError::LineTooLong(self.max_line_length));
                }

                if line == b"." {
                    return Ok(DataLine::EndOfMessage);
                }
                if line.first() == Some(&b'.') {
                    line.remove(0);
                }
                return Ok(DataLine::Line(line));
            }

            if self.buffer.len() > self.max_line_length + 2 {
                self.discard_through(b"\n").await?;
                return Err(ConnectionError::LineTooLong(self.max_line_length));
            }

            self.fill().await?;
        }
    }

    /// Serialize and send a reply. Each wire line is formatted into a
    /// stack buffer, which also enforces the 512-octet reply line cap.
    pub async fn send(&mut self, reply: &Reply) -> ConnectionResult<usize> {
        let mut sent = 0;
        let last = reply.lines().len().saturating_sub(1);

        for (idx, line) in reply.lines().iter().enumerate() {
            let mut buffer = ArrayString::<512>::new();
            let separator = if idx == last { ' ' } else { '-' };
            write!(&mut buffer, "{}{}{}\r\n", reply.code(), separator, line)?;

            self.write_all(buffer.as_bytes()).await?;
            sent += buffer.len();
        }

        self.flush().await?;
        Ok(sent)
    }

    pub async fn flush(&mut self) -> ConnectionResult<()> {
        match &mut self.transport {
            Transport::Plain(stream) => stream.flush().await?,
            Transport::Tls(stream) => stream.flush().await?,
            Transport::Upgrading => return Err(ConnectionError::Closed),
        }
        Ok(())
    }

    /// Shut down the write half, signalling close to the peer.
    pub async fn shutdown(&mut self) {
        let _ = match &mut self.transport {
            Transport::Plain(stream) => stream.shutdown().await,
            Transport::Tls(stream) => stream.shutdown().await,
            Transport::Upgrading => Ok(()),
        };
    }

    /// Swap the plaintext transport for a TLS one, in place. The read
    /// buffer must be empty; the caller verifies that before replying
    /// 220.
    ///
    /// # Errors
    ///
    /// Handshake failure, or an attempt to upgrade twice. After a
    /// failure the connection is unusable and must be dropped.
    pub async fn upgrade(&mut self, acceptor: &TlsAcceptor) -> TlsResult<()> {
        match std::mem::replace(&mut self.transport, Transport::Upgrading) {
            Transport::Plain(stream) => {
                let stream = acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| TlsError::Handshake(e.to_string()))?;

                self.transport = Transport::Tls(Box::new(stream));
                Ok(())
            }
            tls @ Transport::Tls(_) => {
                self.transport = tls;
                Err(TlsError::Handshake(
                    "session is already encrypted".to_string(),
                ))
            }
            Transport::Upgrading => Err(TlsError::Handshake(
                "upgrade already in progress".to_string(),
            )),
        }
    }

    async fn write_all(&mut self, bytes: &[u8]) -> ConnectionResult<()> {
        match &mut self.transport {
            Transport::Plain(stream) => stream.write_all(bytes).await?,
            Transport::Tls(stream) => stream.write_all(bytes).await?,
            Transport::Upgrading => return Err(ConnectionError::Closed),
        }
        Ok(())
    }

    /// Pull more bytes from the transport into the buffer.
    async fn fill(&mut self) -> ConnectionResult<()> {
        let mut chunk = [0; READ_CHUNK];

        let read = match &mut self.transport {
            Transport::Plain(stream) => stream.read(&mut chunk).await?,
            Transport::Tls(stream) => stream.read(&mut chunk).await?,
            Transport::Upgrading => 0,
        };

        if read == 0 {
            return Err(ConnectionError::Closed);
        }

        self.buffer.extend_from_slice(&chunk[..read]);
        Ok(())
    }

    /// Drop buffered bytes up to and including `terminator`, reading
    /// more as needed. Used to resynchronize after an overlong line.
    async fn discard_through(&mut self, terminator: &[u8]) -> ConnectionResult<()> {
        loop {
            if let Some(pos) = find_subsequence(&self.buffer, terminator) {
                self.buffer.drain(..pos + terminator.len());
                return Ok(());
            }

            // Keep the tail in case the terminator straddles a read
            let keep = terminator.len().saturating_sub(1);
            if self.buffer.len() > keep {
                self.buffer.drain(..self.buffer.len() - keep);
            }
            self.fill().await?;
        }
    }
}

fn find_crlf(buffer: &[u8]) -> Option<usize> {
    find_subsequence(buffer, b"\r\n")
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Build the TLS acceptor from PEM certificate and key files. Done once
/// at server start; every STARTTLS upgrade shares the acceptor.
///
/// # Errors
///
/// Returns `TlsError` when the certificate chain or key cannot be
/// loaded or the rustls config rejects them.
pub fn build_acceptor(context: &TlsContext) -> TlsResult<TlsAcceptor> {
    let certs = load_certs(context)?;
    let key = load_key(context)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(context: &TlsContext) -> TlsResult<Vec<CertificateDer<'static>>> {
    let open = |path: &std::path::Path| {
        File::open(path).map_err(|e| TlsError::CertificateLoad {
            path: path.display().to_string(),
            source: e,
        })
    };

    rustls_pemfile::certs(&mut BufReader::new(open(&context.certificate)?))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateLoad {
            path: context.certificate.display().to_string(),
            source: e,
        })
}

fn load_key(context: &TlsContext) -> TlsResult<PrivateKeyDer<'static>> {
    let path = context.key.display().to_string();
    let mut reader = BufReader::new(File::open(&context.key).map_err(|e| TlsError::KeyLoad {
        path: path.clone(),
        reason: e.to_string(),
    })?);

    match rustls_pemfile::read_one(&mut reader).map_err(|e| TlsError::KeyLoad {
        path: path.clone(),
        reason: e.to_string(),
    })? {
        Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
        Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
        Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
        _ => Err(TlsError::KeyLoad {
            path,
            reason: "Unable to determine key file format (expected PKCS1, PKCS8, or SEC1)"
                .to_string(),
        }),
    }
}

#[cfg(test)]
mod test {
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn reads_crlf_lines() {
        let (client, server) = tokio::io::duplex(1024);
        let mut connection = Connection::new(server, 998);

        let mut client = client;
        client.write_all(b"EHLO one\r\nNOOP\r\n").await.unwrap();

        assert_eq!(connection.read_line().await.unwrap(), b"EHLO one");
        assert_eq!(connection.read_line().await.unwrap(), b"NOOP");
        assert_eq!(connection.buffered(), 0);
    }

    #[tokio::test]
    async fn command_lines_require_crlf() {
        let (client, server) = tokio::io::duplex(1024);
        let mut connection = Connection::new(server, 998);

        let mut client = client;
        client.write_all(b"NOOP\nQUIT\r\n").await.unwrap();

        // The bare LF does not terminate; the line runs to the CRLF
        assert_eq!(connection.read_line().await.unwrap(), b"NOOP\nQUIT");
    }

    #[tokio::test]
    async fn eof_is_closed() {
        let (client, server) = tokio::io::duplex(1024);
        let mut connection = Connection::new(server, 998);
        drop(client);

        assert!(matches!(
            connection.read_line().await,
            Err(ConnectionError::Closed)
        ));
    }

    #[tokio::test]
    async fn overlong_line_recovers() {
        let (client, server) = tokio::io::duplex(4096);
        let mut connection = Connection::new(server, 16);

        let mut client = client;
        let long = "x".repeat(100);
        client
            .write_all(format!("{long}\r\nNOOP\r\n").as_bytes())
            .await
            .unwrap();

        assert!(matches!(
            connection.read_line().await,
            Err(ConnectionError::LineTooLong(16))
        ));
        // The next line is still readable
        assert_eq!(connection.read_line().await.unwrap(), b"NOOP");
    }

    #[tokio::test]
    async fn data_lines_unstuff_dots() {
        let (client, server) = tokio::io::duplex(1024);
        let mut connection = Connection::new(server, 998);

        let mut client = client;
        client
            .write_all(b"..hello\r\n.normal\r\nplain\r\n.\r\n")
            .await
            .unwrap();

        assert_eq!(
            connection.read_data_line().await.unwrap(),
            DataLine::Line(b".hello".to_vec())
        );
        assert_eq!(
            connection.read_data_line().await.unwrap(),
            DataLine::Line(b"normal".to_vec())
        );
        assert_eq!(
            connection.read_data_line().await.unwrap(),
            DataLine::Line(b"plain".to_vec())
        );
        assert_eq!(
            connection.read_data_line().await.unwrap(),
            DataLine::EndOfMessage
        );
    }

    #[tokio::test]
    async fn data_lines_tolerate_bare_lf() {
        let (client, server) = tokio::io::duplex(1024);
        let mut connection = Connection::new(server, 998);

        let mut client = client;
        client.write_all(b"sloppy\n.\n").await.unwrap();

        assert_eq!(
            connection.read_data_line().await.unwrap(),
            DataLine::Line(b"sloppy".to_vec())
        );
        assert_eq!(
            connection.read_data_line().await.unwrap(),
            DataLine::EndOfMessage
        );
    }

    #[tokio::test]
    async fn send_formats_multiline() {
        let (client, server) = tokio::io::duplex(1024);
        let mut connection = Connection::new(server, 998);

        let reply = Reply::new(250, "mx.test").with_line("PIPELINING").with_line("OK");
        connection.send(&reply).await.unwrap();
        drop(connection);

        let mut client = client;
        let mut received = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut client, &mut received)
            .await
            .unwrap();
        assert_eq!(received, b"250-mx.test\r\n250-PIPELINING\r\n250 OK\r\n");
    }

    #[tokio::test]
    async fn send_rejects_oversized_reply_line() {
        let (_client, server) = tokio::io::duplex(1024);
        let mut connection = Connection::new(server, 998);

        let reply = Reply::new(250, "y".repeat(600));
        assert!(matches!(
            connection.send(&reply).await,
            Err(ConnectionError::Format(_))
        ));
    }

    #[tokio::test]
    async fn pipelined_bytes_stay_buffered() {
        let (client, server) = tokio::io::duplex(1024);
        let mut connection = Connection::new(server, 998);

        let mut client = client;
        client
            .write_all(b"STARTTLS\r\nMAIL FROM:<a@b.test>\r\n")
            .await
            .unwrap();

        assert_eq!(connection.read_line().await.unwrap(), b"STARTTLS");
        assert!(connection.buffered() > 0);
    }
}
