//! A one-shot SMTP client for relaying a single message upstream.
//!
//! Each send opens a fresh connection, walks the transaction, and quits; no
//! pooling. STARTTLS is used opportunistically when the relay advertises it,
//! and AUTH PLAIN is attempted when credentials are configured.

use std::sync::Arc;

use failmail_common::{incoming, message::OutgoingMessage, outgoing};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{
    rustls::{pki_types::ServerName, ClientConfig, RootCertStore},
    TlsConnector,
};

use crate::{auth::encode_plain, response::Response};

const BUFFER_SIZE: usize = 8192;

/// Relay credentials for AUTH PLAIN.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed by server")]
    ConnectionClosed,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("malformed reply: {0}")]
    Parse(String),

    #[error("server rejected {command}: {code} {message}")]
    Rejected {
        command: String,
        code: u16,
        message: String,
    },
}

enum ClientConnection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl ClientConnection {
    async fn send(&mut self, data: &[u8]) -> Result<(), ClientError> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await?,
            Self::Tls(stream) => stream.write_all(data).await?,
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ClientError> {
        let read = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if read == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(read)
    }
}

pub struct SmtpClient {
    connection: Option<ClientConnection>,
    buffer: Vec<u8>,
    /// Hostname part of the relay address, for TLS server-name validation.
    server_name: String,
}

impl SmtpClient {
    /// Connect to the relay.
    ///
    /// # Errors
    /// If the TCP connection fails.
    pub async fn connect(address: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(address).await?;
        let server_name = address
            .rsplit_once(':')
            .map_or(address, |(host, _)| host)
            .to_string();

        Ok(Self {
            connection: Some(ClientConnection::Plain(stream)),
            buffer: Vec::new(),
            server_name,
        })
    }

    /// Read the 220 greeting.
    ///
    /// # Errors
    /// If reading fails or the server refuses the connection.
    pub async fn read_greeting(&mut self) -> Result<Response, ClientError> {
        let greeting = self.read_response().await?;
        if greeting.code != 220 {
            return Err(rejected("connect", &greeting));
        }
        Ok(greeting)
    }

    /// Send one command line and read the reply.
    ///
    /// # Errors
    /// If sending or reading fails.
    pub async fn command(&mut self, line: &str) -> Result<Response, ClientError> {
        outgoing!("{line}");
        self.connection()?
            .send(format!("{line}\r\n").as_bytes())
            .await?;
        self.read_response().await
    }

    /// EHLO, returning the advertised extensions.
    ///
    /// # Errors
    /// If the server rejects the greeting.
    pub async fn ehlo(&mut self, domain: &str) -> Result<Response, ClientError> {
        let response = self.command(&format!("EHLO {domain}")).await?;
        if !response.is_success() {
            return Err(rejected("EHLO", &response));
        }
        Ok(response)
    }

    /// Upgrade the connection with STARTTLS, verifying the relay's
    /// certificate against the system roots.
    ///
    /// # Errors
    /// If the server refuses or the handshake fails.
    pub async fn starttls(&mut self) -> Result<(), ClientError> {
        let response = self.command("STARTTLS").await?;
        if response.code != 220 {
            return Err(rejected("STARTTLS", &response));
        }

        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for certificate in native.certs {
            roots
                .add(certificate)
                .map_err(|e| ClientError::Tls(format!("failed to add root certificate: {e}")))?;
        }
        if !native.errors.is_empty() {
            tracing::warn!(target: "failmail", errors = ?native.errors, "some root certificates could not be loaded");
        }

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(self.server_name.clone())
            .map_err(|e| ClientError::Tls(format!("invalid server name: {e}")))?;

        match self.connection.take() {
            Some(ClientConnection::Plain(stream)) => {
                let stream = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| ClientError::Tls(e.to_string()))?;
                self.connection = Some(ClientConnection::Tls(Box::new(stream)));
                self.buffer.clear();
                Ok(())
            }
            Some(tls @ ClientConnection::Tls(_)) => {
                self.connection = Some(tls);
                Err(ClientError::Tls("connection is already TLS".to_string()))
            }
            None => Err(ClientError::ConnectionClosed),
        }
    }

    /// Authenticate with AUTH PLAIN.
    ///
    /// # Errors
    /// If the server rejects the credentials.
    pub async fn auth_plain(&mut self, credentials: &Credentials) -> Result<(), ClientError> {
        let payload = encode_plain(&credentials.username, &credentials.password);
        let response = self.command(&format!("AUTH PLAIN {payload}")).await?;
        if response.code != 235 {
            return Err(rejected("AUTH PLAIN", &response));
        }
        Ok(())
    }

    /// Run the `MAIL FROM` / `RCPT TO` / `DATA` transaction for one message,
    /// dot-stuffing the payload.
    ///
    /// # Errors
    /// If any step is rejected.
    pub async fn send_message(&mut self, message: &OutgoingMessage) -> Result<(), ClientError> {
        let mail = self
            .command(&format!("MAIL FROM:<{}>", message.sender()))
            .await?;
        if !mail.is_success() {
            return Err(rejected("MAIL FROM", &mail));
        }

        for recipient in message.recipients() {
            let rcpt = self.command(&format!("RCPT TO:<{recipient}>")).await?;
            if !rcpt.is_success() {
                return Err(rejected("RCPT TO", &rcpt));
            }
        }

        let data = self.command("DATA").await?;
        if !data.is_intermediate() {
            return Err(rejected("DATA", &data));
        }

        let payload = dot_stuff(message.data());
        self.connection()?.send(&payload).await?;
        let finished = self.read_response().await?;
        if !finished.is_success() {
            return Err(rejected("message data", &finished));
        }

        Ok(())
    }

    /// Say goodbye. Failures here are not interesting.
    pub async fn quit(&mut self) {
        let _ = self.command("QUIT").await;
    }

    fn connection(&mut self) -> Result<&mut ClientConnection, ClientError> {
        self.connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)
    }

    async fn read_response(&mut self) -> Result<Response, ClientError> {
        loop {
            if let Some((response, consumed)) =
                Response::parse(&self.buffer).map_err(ClientError::Parse)?
            {
                self.buffer.drain(..consumed);
                incoming!("{} {}", response.code, response.message());
                return Ok(response);
            }

            let mut chunk = [0u8; BUFFER_SIZE];
            let read = self.connection()?.read(&mut chunk).await?;
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }
}

fn rejected(command: &str, response: &Response) -> ClientError {
    ClientError::Rejected {
        command: command.to_string(),
        code: response.code,
        message: response.message(),
    }
}

/// RFC 5321 §4.5.2 transparency: prefix dot-lines with an extra dot, ensure
/// CRLF line endings, and append the terminator.
fn dot_stuff(data: &[u8]) -> Vec<u8> {
    let mut stuffed = Vec::with_capacity(data.len() + 8);

    for line in data.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.first() == Some(&b'.') {
            stuffed.push(b'.');
        }
        stuffed.extend_from_slice(line);
        stuffed.extend_from_slice(b"\r\n");
    }

    // A trailing newline in the input would otherwise leave a stray blank
    // line before the terminator.
    if data.ends_with(b"\n") {
        stuffed.truncate(stuffed.len() - 2);
    }

    stuffed.extend_from_slice(b".\r\n");
    stuffed
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::TcpListener,
    };

    use super::*;

    #[test]
    fn dot_stuffing_escapes_leading_dots() {
        let stuffed = dot_stuff(b"one\r\n.two\r\nthree");
        assert_eq!(stuffed, b"one\r\n..two\r\nthree\r\n.\r\n");
    }

    #[test]
    fn dot_stuffing_normalizes_bare_newlines() {
        let stuffed = dot_stuff(b"one\ntwo\n");
        assert_eq!(stuffed, b"one\r\ntwo\r\n.\r\n");
    }

    /// A canned relay that accepts one transaction and records the payload.
    async fn fake_relay(listener: TcpListener) -> Vec<String> {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let mut seen = Vec::new();

        write_half.write_all(b"220 fake ready\r\n").await.unwrap();

        let mut in_data = false;
        while let Ok(Some(line)) = lines.next_line().await {
            seen.push(line.clone());

            if in_data {
                if line == "." {
                    in_data = false;
                    write_half.write_all(b"250 queued\r\n").await.unwrap();
                }
                continue;
            }

            let reply: &[u8] = if line.starts_with("EHLO") {
                b"250-fake\r\n250 AUTH PLAIN\r\n"
            } else if line.starts_with("AUTH PLAIN") {
                b"235 2.7.0 ok\r\n"
            } else if line.starts_with("MAIL") || line.starts_with("RCPT") {
                b"250 ok\r\n"
            } else if line == "DATA" {
                in_data = true;
                b"354 go\r\n"
            } else if line == "QUIT" {
                write_half.write_all(b"221 bye\r\n").await.unwrap();
                break;
            } else {
                b"500 what\r\n"
            };
            write_half.write_all(reply).await.unwrap();
        }

        seen
    }

    #[tokio::test]
    async fn full_relay_transaction() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let relay = tokio::spawn(fake_relay(listener));

        let message = OutgoingMessage::new(
            "from@x",
            vec!["to@y".to_string()],
            b"Subject: s\r\n\r\n.dotted\r\nbody".to_vec(),
        );

        let mut client = SmtpClient::connect(&address.to_string()).await.unwrap();
        client.read_greeting().await.unwrap();
        let ehlo = client.ehlo("failmail").await.unwrap();
        assert!(ehlo.advertises("AUTH"));
        client
            .auth_plain(&Credentials {
                username: "user".to_string(),
                password: "secret".to_string(),
            })
            .await
            .unwrap();
        client.send_message(&message).await.unwrap();
        client.quit().await;

        let seen = relay.await.unwrap();
        assert!(seen.contains(&"MAIL FROM:<from@x>".to_string()));
        assert!(seen.contains(&"RCPT TO:<to@y>".to_string()));
        assert!(seen.contains(&"..dotted".to_string()));
        assert!(seen.contains(&".".to_string()));
    }

    #[tokio::test]
    async fn rejected_recipient_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();

            write_half.write_all(b"220 fake\r\n").await.unwrap();
            while let Ok(Some(line)) = lines.next_line().await {
                let reply: &[u8] = if line.starts_with("RCPT") {
                    b"550 no such user\r\n"
                } else {
                    b"250 ok\r\n"
                };
                write_half.write_all(reply).await.unwrap();
            }
        });

        let message = OutgoingMessage::new(
            "from@x",
            vec!["to@y".to_string()],
            b"Subject: s\r\n\r\nb".to_vec(),
        );

        let mut client = SmtpClient::connect(&address.to_string()).await.unwrap();
        client.read_greeting().await.unwrap();
        client.ehlo("failmail").await.unwrap();

        let err = client.send_message(&message).await.unwrap_err();
        assert!(matches!(err, ClientError::Rejected { code: 550, .. }));
    }
}
