//! Self-contained test harness running the whole failmail pipeline in
//! process: SMTP listener, coordinator, upstream pump, and a recording
//! upstream standing in for the relay.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use failmail::coordinator::Coordinator;
use failmail_common::{
    env::{Environment, SystemEnvironment},
    message::OutgoingMessage,
    Signal,
};
use failmail_delivery::{pump, RecordingUpstream, Upstream};
use failmail_maildir::Maildir;
use failmail_smtp::{auth::SingleUserPlainAuth, Listener, SessionConfig};
use failmail_summary::{GroupBy, MessageBuffer, RateCounter, SummaryRenderer};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::broadcast,
    task::JoinHandle,
};

pub struct PipelineHarness {
    smtp_addr: SocketAddr,
    upstream: Arc<RecordingUpstream>,
    failures: Arc<Maildir>,
    shutdown: broadcast::Sender<Signal>,
    listener_task: JoinHandle<()>,
    coordinator_task: JoinHandle<Signal>,
    pump_task: JoinHandle<()>,
    _tmp: tempfile::TempDir,
}

pub struct PipelineHarnessBuilder {
    wait: Duration,
    relay_all: bool,
    failing_upstream: bool,
    auth: Option<(String, String)>,
}

impl PipelineHarnessBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            // Short enough that summaries flush on the next coordinator
            // tick, long enough that a burst coalesces.
            wait: Duration::from_millis(250),
            relay_all: false,
            failing_upstream: false,
            auth: None,
        }
    }

    #[must_use]
    pub fn with_relay_all(mut self) -> Self {
        self.relay_all = true;
        self
    }

    #[must_use]
    pub fn with_failing_upstream(mut self) -> Self {
        self.failing_upstream = true;
        self
    }

    #[must_use]
    pub fn with_auth(mut self, username: &str, password: &str) -> Self {
        self.auth = Some((username.to_string(), password.to_string()));
        self
    }

    pub async fn build(self) -> anyhow::Result<PipelineHarness> {
        let tmp = tempfile::tempdir()?;
        let env: Arc<dyn Environment> = Arc::new(SystemEnvironment);

        let failures = Arc::new(Maildir::create(tmp.path().join("failed"), Arc::clone(&env))?);
        let upstream = Arc::new(if self.failing_upstream {
            RecordingUpstream::failing()
        } else {
            RecordingUpstream::new()
        });

        let (received_tx, received_rx) = tokio::sync::mpsc::channel(64);
        let (sending_tx, sending_rx) = tokio::sync::mpsc::channel(64);
        let (shutdown, _) = broadcast::channel(16);

        let mut session_config = SessionConfig::new("e2e-test", Arc::clone(&env));
        if let Some((username, password)) = &self.auth {
            session_config = session_config
                .with_auth(Some(Arc::new(SingleUserPlainAuth::new(username, password))));
        }

        let listener = Listener::bind("127.0.0.1:0", session_config, received_tx).await?;
        let smtp_addr = listener.local_addr()?;

        let buffer = MessageBuffer::new(
            self.wait,
            Duration::from_secs(60),
            GroupBy::Header {
                name: "X-Failmail-Split".to_string(),
                default: String::new(),
            },
            GroupBy::SameSubject,
        );
        let (coordinator, _stats) = Coordinator::new(
            buffer,
            RateCounter::new(0, 5),
            Duration::from_secs(60),
            self.relay_all,
            SummaryRenderer::new("failmail@e2e-test"),
            Arc::clone(&env),
        );

        let listener_task = tokio::spawn(listener.serve(shutdown.subscribe()));
        let coordinator_task = tokio::spawn(coordinator.run(
            received_rx,
            sending_tx,
            shutdown.subscribe(),
        ));
        let pump_task = tokio::spawn(pump(
            sending_rx,
            Arc::clone(&upstream) as Arc<dyn Upstream>,
            Arc::clone(&failures),
        ));

        Ok(PipelineHarness {
            smtp_addr,
            upstream,
            failures,
            shutdown,
            listener_task,
            coordinator_task,
            pump_task,
            _tmp: tmp,
        })
    }
}

impl PipelineHarness {
    #[must_use]
    pub fn builder() -> PipelineHarnessBuilder {
        PipelineHarnessBuilder::new()
    }

    /// Open a raw SMTP connection to the listener, past the greeting.
    pub async fn connect(&self) -> anyhow::Result<SmtpConversation> {
        let stream = TcpStream::connect(self.smtp_addr).await?;
        let (read_half, write_half) = stream.into_split();
        let mut conversation = SmtpConversation {
            replies: BufReader::new(read_half).lines(),
            writer: write_half,
        };

        let greeting = conversation.reply().await?;
        anyhow::ensure!(greeting.starts_with("220"), "unexpected greeting {greeting}");
        Ok(conversation)
    }

    /// Send one message through a complete SMTP transaction.
    pub async fn send_email(&self, from: &str, to: &str, message: &str) -> anyhow::Result<()> {
        let mut conversation = self.connect().await?;

        conversation.expect("EHLO e2e-client", "250").await?;
        conversation
            .expect(&format!("MAIL FROM:<{from}>"), "250")
            .await?;
        conversation.expect(&format!("RCPT TO:<{to}>"), "250").await?;
        conversation.expect("DATA", "354").await?;

        for line in message.lines() {
            conversation.send(line).await?;
        }
        conversation.expect(".", "250").await?;
        conversation.expect("QUIT", "221").await?;
        Ok(())
    }

    /// Everything the fake relay has been handed so far.
    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.upstream.sent()
    }

    /// A handle on the fake relay that outlives `shutdown`.
    #[must_use]
    pub fn upstream(&self) -> Arc<RecordingUpstream> {
        Arc::clone(&self.upstream)
    }

    /// Wait until the fake relay has seen at least `expected` messages.
    pub async fn wait_for_sent(&self, expected: usize, timeout: Duration) -> anyhow::Result<()> {
        self.upstream
            .wait_for_count(expected, timeout)
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for {expected} upstream sends"))
    }

    #[must_use]
    pub fn failures(&self) -> &Maildir {
        &self.failures
    }

    /// Signal shutdown and wait for every task to finish.
    pub async fn shutdown(self) -> anyhow::Result<Signal> {
        let _ = self.shutdown.send(Signal::Shutdown);

        let signal = tokio::time::timeout(Duration::from_secs(10), self.coordinator_task).await??;
        tokio::time::timeout(Duration::from_secs(10), self.pump_task).await??;
        tokio::time::timeout(Duration::from_secs(10), self.listener_task).await??;
        Ok(signal)
    }
}

/// A raw SMTP client conversation, one reply line at a time.
pub struct SmtpConversation {
    replies: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl SmtpConversation {
    pub async fn send(&mut self, line: &str) -> anyhow::Result<()> {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await?;
        Ok(())
    }

    /// Read one complete reply, returning its final line.
    pub async fn reply(&mut self) -> anyhow::Result<String> {
        loop {
            let Some(line) = self.replies.next_line().await? else {
                anyhow::bail!("server closed the connection");
            };
            if line.len() < 4 || line.as_bytes()[3] != b'-' {
                return Ok(line);
            }
        }
    }

    /// Send a command and assert on the reply code.
    pub async fn expect(&mut self, line: &str, code: &str) -> anyhow::Result<String> {
        self.send(line).await?;
        let reply = self.reply().await?;
        anyhow::ensure!(
            reply.starts_with(code),
            "expected {code} for {line:?}, got {reply:?}"
        );
        Ok(reply)
    }
}
