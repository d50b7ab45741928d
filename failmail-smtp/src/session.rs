//! Per-connection SMTP session handling.
//!
//! Each accepted connection gets one `Session`, which walks the minimal
//! state machine `Connect → Greeted → MailFrom → RcptTo → (DATA) → Greeted`
//! and hands every completed message to the coordinator over the bounded
//! `received` channel. A full channel blocks the session: backpressure is
//! the intended behavior when the upstream has slowed, so a wedged relay
//! eventually stops the listener from accepting new `DATA` payloads.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use failmail_common::{
    env::Environment,
    error::SessionError,
    incoming, internal,
    message::ReceivedMessage,
    outgoing, Signal,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{broadcast, mpsc},
};
use tokio_rustls::TlsAcceptor;

use crate::{
    auth::{decode_plain, Authenticator},
    command::{Command, HeloVariant},
    connection::Connection,
};

/// Hard cap on accepted message data; larger payloads get a 554.
const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Read-only configuration shared by every session of a listener.
pub struct SessionConfig {
    /// Hostname used in the banner and EHLO response.
    pub banner: String,
    /// When set, EHLO advertises AUTH PLAIN and MAIL requires a prior
    /// successful authentication.
    pub auth: Option<Arc<dyn Authenticator>>,
    /// When set, EHLO advertises STARTTLS.
    pub tls: Option<TlsAcceptor>,
    pub env: Arc<dyn Environment>,
    /// How long in-flight sessions get to finish their current message once
    /// a shutdown signal arrives.
    pub shutdown_timeout: Duration,
}

impl SessionConfig {
    #[must_use]
    pub fn new(banner: impl Into<String>, env: Arc<dyn Environment>) -> Self {
        Self {
            banner: banner.into(),
            auth: None,
            tls: None,
            env,
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub fn with_auth(mut self, auth: Option<Arc<dyn Authenticator>>) -> Self {
        self.auth = auth;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: Option<TlsAcceptor>) -> Self {
        self.tls = tls;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Connect,
    Greeted,
    MailFrom {
        sender: String,
    },
    RcptTo {
        sender: String,
        recipients: Vec<String>,
    },
}

impl State {
    const fn in_transaction(&self) -> bool {
        matches!(self, Self::MailFrom { .. } | Self::RcptTo { .. })
    }
}

pub struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send> {
    peer: SocketAddr,
    connection: Connection<Stream>,
    config: Arc<SessionConfig>,
    received: mpsc::Sender<Arc<ReceivedMessage>>,
    state: State,
    authenticated: bool,
    closing: bool,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    pub(crate) fn create(
        stream: Stream,
        peer: SocketAddr,
        config: Arc<SessionConfig>,
        received: mpsc::Sender<Arc<ReceivedMessage>>,
    ) -> Self {
        Self {
            peer,
            connection: Connection::new(stream),
            config,
            received,
            state: State::Connect,
            authenticated: false,
            closing: false,
        }
    }

    /// Drive the session to completion.
    ///
    /// # Errors
    /// On connection failures or when the pipeline has shut down underneath
    /// the session.
    pub async fn run(
        mut self,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        internal!(level = DEBUG, "connected: {}", self.peer);
        self.reply(&format!("220 {} failmail", self.config.banner))
            .await?;

        loop {
            let line = tokio::select! {
                // The signal wins over an already-buffered command line.
                biased;

                _ = shutdown.recv(), if !self.closing => {
                    // Stop at the command boundary; an in-flight DATA body is
                    // read to completion elsewhere.
                    self.closing = true;
                    continue;
                }
                line = self.connection.read_line() => line?,
            };

            if self.closing {
                self.reply("421 4.4.2 server shutting down").await.ok();
                return Ok(());
            }

            let Some(line) = line else {
                internal!(level = DEBUG, "disconnected: {}", self.peer);
                return Ok(());
            };

            let text = String::from_utf8_lossy(&line).into_owned();
            incoming!("{text}");

            let close = match Command::try_from(text.as_str()) {
                Ok(command) => self.handle(command).await?,
                Err(_) => {
                    self.reply("500 5.5.2 unrecognized command").await?;
                    false
                }
            };

            if close {
                return Ok(());
            }
        }
    }

    async fn reply(&mut self, line: &str) -> Result<(), SessionError> {
        outgoing!("{line}");
        self.connection.send_line(line).await?;
        Ok(())
    }

    /// Handle one parsed command; returns `true` when the session should
    /// close.
    async fn handle(&mut self, command: Command) -> Result<bool, SessionError> {
        match command {
            Command::Helo(variant) => self.greet(variant).await?,
            Command::MailFrom(sender) => self.mail_from(sender).await?,
            Command::RcptTo(recipient) => self.rcpt_to(recipient).await?,
            Command::Data => return self.data().await,
            Command::Rset => {
                if self.state != State::Connect {
                    self.state = State::Greeted;
                }
                self.reply("250 2.0.0 ok").await?;
            }
            Command::Noop => self.reply("250 2.0.0 ok").await?,
            Command::Quit => {
                self.reply("221 2.0.0 goodbye").await?;
                return Ok(true);
            }
            Command::StartTls => self.start_tls().await?,
            Command::Auth { mechanism, initial } => self.auth(&mechanism, initial).await?,
            Command::Invalid(_) => self.reply("500 5.5.2 unrecognized command").await?,
        }

        Ok(false)
    }

    async fn greet(&mut self, variant: HeloVariant) -> Result<(), SessionError> {
        // A fresh HELO/EHLO abandons any half-built transaction.
        self.state = State::Greeted;

        match variant {
            HeloVariant::Helo(id) => {
                self.reply(&format!("250 {} says hello to {id}", self.config.banner))
                    .await
            }
            HeloVariant::Ehlo(id) => {
                let mut extensions = Vec::new();
                if self.config.tls.is_some() && !self.connection.is_tls() {
                    extensions.push("STARTTLS");
                }
                if self.config.auth.is_some() {
                    extensions.push("AUTH PLAIN");
                }

                let banner = format!("{} says hello to {id}", self.config.banner);
                match extensions.split_last() {
                    None => self.reply(&format!("250 {banner}")).await,
                    Some((last, rest)) => {
                        self.reply(&format!("250-{banner}")).await?;
                        for extension in rest {
                            self.reply(&format!("250-{extension}")).await?;
                        }
                        self.reply(&format!("250 {last}")).await
                    }
                }
            }
        }
    }

    async fn mail_from(&mut self, sender: String) -> Result<(), SessionError> {
        if self.config.auth.is_some() && !self.authenticated {
            return self.reply("530 5.7.0 authentication required").await;
        }

        if matches!(self.state, State::Connect) {
            return self.reply("503 5.5.1 say hello first").await;
        }
        if self.state.in_transaction() {
            return self.reply("503 5.5.1 nested MAIL command").await;
        }

        self.state = State::MailFrom { sender };
        self.reply("250 2.1.0 ok").await
    }

    async fn rcpt_to(&mut self, recipient: String) -> Result<(), SessionError> {
        let state = std::mem::replace(&mut self.state, State::Connect);
        let (state, reply) = match state {
            State::MailFrom { sender } => (
                State::RcptTo {
                    sender,
                    recipients: vec![recipient],
                },
                "250 2.1.5 ok",
            ),
            State::RcptTo {
                sender,
                mut recipients,
            } => {
                recipients.push(recipient);
                (State::RcptTo { sender, recipients }, "250 2.1.5 ok")
            }
            other => (other, "503 5.5.1 need MAIL before RCPT"),
        };

        self.state = state;
        self.reply(reply).await
    }

    async fn data(&mut self) -> Result<bool, SessionError> {
        let (sender, recipients) = match &self.state {
            State::RcptTo { sender, recipients } => (sender.clone(), recipients.clone()),
            State::MailFrom { .. } => {
                self.reply("503 5.5.1 need RCPT before DATA").await?;
                return Ok(false);
            }
            _ => {
                self.reply("503 5.5.1 need MAIL before DATA").await?;
                return Ok(false);
            }
        };

        self.reply("354 end data with <CR><LF>.<CR><LF>").await?;

        let mut data: Vec<u8> = Vec::new();
        let mut oversized = false;
        loop {
            let Some(line) = self.connection.read_line().await? else {
                // Client vanished mid-body; nothing to salvage.
                return Ok(true);
            };

            if line == b"." {
                break;
            }

            if data.len() + line.len() > MAX_MESSAGE_SIZE {
                oversized = true;
                continue;
            }

            // Reverse the transparency dot-stuffing of RFC 5321 §4.5.2.
            let line = if line.starts_with(b"..") { &line[1..] } else { &line[..] };
            data.extend_from_slice(line);
            data.extend_from_slice(b"\r\n");
        }

        self.state = State::Greeted;

        if oversized {
            self.reply("554 5.3.4 message too large").await?;
            return Ok(false);
        }

        let message = Arc::new(ReceivedMessage::new(
            sender,
            recipients,
            data,
            self.config.env.now(),
        ));

        internal!(
            level = DEBUG,
            "received message from {} ({} bytes)",
            self.peer,
            message.data().len()
        );

        // Intentional backpressure: a full channel blocks this session.
        if self.received.send(message).await.is_err() {
            self.reply("451 4.3.0 temporary failure").await?;
            return Err(SessionError::ReceiverClosed);
        }

        self.reply("250 2.0.0 ok").await?;
        Ok(false)
    }

    async fn start_tls(&mut self) -> Result<(), SessionError> {
        let Some(acceptor) = self.config.tls.clone() else {
            return self.reply("502 5.5.1 STARTTLS not supported").await;
        };

        if self.connection.is_tls() {
            return self.reply("503 5.5.1 already using TLS").await;
        }
        if self.state.in_transaction() {
            return self.reply("503 5.5.1 STARTTLS not allowed during mail transaction").await;
        }

        self.reply("220 2.0.0 ready to start TLS").await?;

        match self.connection.upgrade(&acceptor).await {
            Ok(()) => {
                // All prior session state, including EHLO and auth, resets.
                self.state = State::Connect;
                self.authenticated = false;
                internal!(level = DEBUG, "connection upgraded to TLS: {}", self.peer);
                Ok(())
            }
            Err(err) => {
                internal!(level = ERROR, "TLS handshake failed for {}: {err}", self.peer);
                Err(SessionError::Protocol(format!("TLS handshake failed: {err}")))
            }
        }
    }

    async fn auth(
        &mut self,
        mechanism: &str,
        initial: Option<String>,
    ) -> Result<(), SessionError> {
        if self.config.auth.is_none() {
            return self.reply("502 5.5.1 AUTH not supported").await;
        }
        if self.authenticated {
            return self.reply("503 5.5.1 already authenticated").await;
        }
        if self.state.in_transaction() {
            return self.reply("503 5.5.1 AUTH not allowed during mail transaction").await;
        }
        if mechanism != "PLAIN" {
            return self.reply("504 5.5.4 unrecognized authentication type").await;
        }

        let payload = match initial {
            Some(payload) => payload,
            None => {
                self.reply("334 ").await?;
                match self.connection.read_line().await? {
                    Some(line) if line != b"*" => String::from_utf8_lossy(&line).into_owned(),
                    Some(_) => return self.reply("501 5.7.0 authentication cancelled").await,
                    None => return Ok(()),
                }
            }
        };

        let authenticated = decode_plain(&payload)
            .map(|(authzid, authcid, password)| {
                self.config
                    .auth
                    .as_ref()
                    .is_some_and(|auth| auth.authenticate(&authzid, &authcid, &password))
            })
            .unwrap_or(false);

        if authenticated {
            self.authenticated = true;
            self.reply("235 2.7.0 authentication successful").await
        } else {
            self.reply("535 5.7.8 authentication credentials invalid").await
        }
    }
}
