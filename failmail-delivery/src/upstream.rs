//! Composable sinks for outgoing messages.
//!
//! An upstream is anything with a `send`. The effective chain is fixed by
//! configuration at startup: an optional external command, then an optional
//! archive maildir, then the primary relay (live SMTP or the debug writer).

use std::{io::Write, process::Stdio, sync::Arc, sync::Mutex};

use async_trait::async_trait;
use failmail_common::message::OutgoingMessage;
use failmail_maildir::{Maildir, MaildirError};
use failmail_smtp::client::{ClientError, Credentials, SmtpClient};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("SMTP relay failed: {0}")]
    Relay(#[from] ClientError),

    #[error("archive write failed: {0}")]
    Archive(#[from] MaildirError),

    #[error("relay command failed: {0}")]
    Command(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A sink for outgoing messages. Implementations own the bytes from the
/// moment `send` is called until it returns.
#[async_trait]
pub trait Upstream: Send + Sync + std::fmt::Debug {
    /// Deliver one message.
    ///
    /// # Errors
    /// Any error routes the message to the failure spool.
    async fn send(&self, message: &OutgoingMessage) -> Result<(), UpstreamError>;
}

/// Relays through a real SMTP server, one connection per send.
#[derive(Debug)]
pub struct LiveUpstream {
    address: String,
    credentials: Option<Credentials>,
}

impl LiveUpstream {
    #[must_use]
    pub fn new(address: impl Into<String>, credentials: Option<Credentials>) -> Self {
        Self {
            address: address.into(),
            credentials,
        }
    }
}

#[async_trait]
impl Upstream for LiveUpstream {
    async fn send(&self, message: &OutgoingMessage) -> Result<(), UpstreamError> {
        let mut client = SmtpClient::connect(&self.address).await?;
        client.read_greeting().await?;

        let ehlo = client.ehlo("failmail").await?;
        if ehlo.advertises("STARTTLS") {
            client.starttls().await?;
            client.ehlo("failmail").await?;
        }

        if let Some(credentials) = &self.credentials {
            client.auth_plain(credentials).await?;
        }

        client.send_message(message).await?;
        client.quit().await;
        Ok(())
    }
}

/// Writes raw message bytes to a writer; `--relay debug` selects this with
/// stdout.
pub struct DebugUpstream<W: Write + Send> {
    writer: Mutex<W>,
}

impl DebugUpstream<std::io::Stdout> {
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> DebugUpstream<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send> std::fmt::Debug for DebugUpstream<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugUpstream").finish_non_exhaustive()
    }
}

#[async_trait]
impl<W: Write + Send> Upstream for DebugUpstream<W> {
    async fn send(&self, message: &OutgoingMessage) -> Result<(), UpstreamError> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| UpstreamError::Command("debug writer poisoned".to_string()))?;
        writer.write_all(message.data())?;
        writer.flush()?;
        Ok(())
    }
}

/// Mirrors every message into a maildir.
#[derive(Debug)]
pub struct MaildirUpstream {
    maildir: Arc<Maildir>,
}

impl MaildirUpstream {
    #[must_use]
    pub fn new(maildir: Arc<Maildir>) -> Self {
        Self { maildir }
    }
}

#[async_trait]
impl Upstream for MaildirUpstream {
    async fn send(&self, message: &OutgoingMessage) -> Result<(), UpstreamError> {
        self.maildir.write(message.data())?;
        Ok(())
    }
}

/// Pipes message bytes to a shell command's standard input; a non-zero exit
/// is a delivery failure.
#[derive(Debug)]
pub struct ExecUpstream {
    command: String,
}

impl ExecUpstream {
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl Upstream for ExecUpstream {
    async fn send(&self, message: &OutgoingMessage) -> Result<(), UpstreamError> {
        let mut child = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(message.data()).await?;
            drop(stdin);
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(UpstreamError::Command(format!(
                "{:?} exited with {status}",
                self.command
            )));
        }
        Ok(())
    }
}

/// Fans a message out to several sinks in order. Every sink is attempted
/// even after a failure; the first error wins.
#[derive(Debug)]
pub struct MultiUpstream {
    upstreams: Vec<Arc<dyn Upstream>>,
}

impl MultiUpstream {
    #[must_use]
    pub fn new(upstreams: Vec<Arc<dyn Upstream>>) -> Self {
        Self { upstreams }
    }
}

#[async_trait]
impl Upstream for MultiUpstream {
    async fn send(&self, message: &OutgoingMessage) -> Result<(), UpstreamError> {
        let mut first_error = None;
        for upstream in &self.upstreams {
            if let Err(err) = upstream.send(message).await {
                tracing::error!(target: "failmail", %err, "upstream sink failed");
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Records sent messages in memory; the mock the tests drive the pipeline
/// with.
#[derive(Debug, Default)]
pub struct RecordingUpstream {
    sent: Mutex<Vec<OutgoingMessage>>,
    fail: bool,
    notify: tokio::sync::Notify,
}

impl RecordingUpstream {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A recorder whose every send fails, for exercising the failure spool.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Messages sent so far.
    ///
    /// # Panics
    /// If the mutex is poisoned.
    #[must_use]
    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().expect("RecordingUpstream mutex poisoned").clone()
    }

    /// Wait until at least `expected` messages have arrived.
    ///
    /// # Errors
    /// If the timeout elapses first.
    pub async fn wait_for_count(
        &self,
        expected: usize,
        timeout: std::time::Duration,
    ) -> Result<(), tokio::time::error::Elapsed> {
        tokio::time::timeout(timeout, async {
            loop {
                if self.sent().len() >= expected {
                    return;
                }
                self.notify.notified().await;
            }
        })
        .await
    }
}

#[async_trait]
impl Upstream for RecordingUpstream {
    async fn send(&self, message: &OutgoingMessage) -> Result<(), UpstreamError> {
        self.sent
            .lock()
            .map_err(|_| UpstreamError::Command("recorder poisoned".to_string()))?
            .push(message.clone());
        self.notify.notify_waiters();

        if self.fail {
            return Err(UpstreamError::Command("recording upstream set to fail".to_string()));
        }
        Ok(())
    }
}

/// Assemble the configured chain: command sink, then archive maildir, then
/// the primary relay.
#[must_use]
pub fn build_upstream(
    relay: &str,
    credentials: Option<Credentials>,
    archive: Option<Arc<Maildir>>,
    relay_command: Option<&str>,
) -> Arc<dyn Upstream> {
    let primary: Arc<dyn Upstream> = if relay == "debug" {
        Arc::new(DebugUpstream::stdout())
    } else {
        Arc::new(LiveUpstream::new(relay, credentials))
    };

    let mut chain: Vec<Arc<dyn Upstream>> = Vec::new();
    if let Some(command) = relay_command {
        chain.push(Arc::new(ExecUpstream::new(command)));
    }
    if let Some(maildir) = archive {
        chain.push(Arc::new(MaildirUpstream::new(maildir)));
    }

    if chain.is_empty() {
        primary
    } else {
        chain.push(primary);
        Arc::new(MultiUpstream::new(chain))
    }
}
