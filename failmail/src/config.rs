//! Command-line configuration.

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use failmail_common::{env::Environment, error::ConfigError};
use failmail_smtp::{
    auth::{Authenticator, SingleUserPlainAuth},
    client::Credentials,
    tls::{self, TlsAcceptor, TlsError},
};
use failmail_summary::{grouping::PatternError, GroupBy};

/// Accept mail, batch it up, and relay summaries upstream.
#[derive(Parser, Debug, Clone)]
#[command(name = "failmail", version, about)]
pub struct Options {
    /// Local bind address for the SMTP listener
    #[arg(long, default_value = "localhost:2525")]
    pub bind: String,

    /// Relay server address, or "debug" to write messages to stdout
    #[arg(long, default_value = "localhost:25")]
    pub relay: String,

    /// Wait this long for more batchable messages
    #[arg(long, default_value = "30s")]
    pub wait: humantime::Duration,

    /// Wait at most this long from the first message to sending a summary
    #[arg(long = "max-wait", default_value = "5m")]
    pub max_wait: humantime::Duration,

    /// From address for summaries (default: failmail@<hostname>)
    #[arg(long)]
    pub from: Option<String>,

    /// Write failed sends to this maildir
    #[arg(long = "fail-dir", default_value = "failed")]
    pub fail_dir: PathBuf,

    /// Write all sends to this maildir
    #[arg(long = "all-dir")]
    pub all_dir: Option<PathBuf>,

    /// Alert if this many messages arrive within the rate window (0 disables)
    #[arg(long = "rate-limit", default_value_t = 0)]
    pub rate_limit: u64,

    /// How often to check whether the rate limit was exceeded
    #[arg(long = "rate-check", default_value = "1m")]
    pub rate_check: humantime::Duration,

    /// The size of the rate limit window, in check intervals
    #[arg(long = "rate-window", default_value_t = 5)]
    pub rate_window: usize,

    /// Header used to split messages into summary mails
    #[arg(long = "batch-header", default_value = "X-Failmail-Split")]
    pub batch_header: String,

    /// Batch messages whose subjects are the same after keeping only the
    /// characters that match this pattern
    #[arg(long = "batch-subject-match")]
    pub batch_subject_match: Option<String>,

    /// Batch messages whose subjects are the same after stripping out the
    /// characters that match this pattern
    #[arg(long = "batch-subject-replace")]
    pub batch_subject_replace: Option<String>,

    /// Group messages within summaries by the matching part of the subject
    #[arg(long = "group-subject-match")]
    pub group_subject_match: Option<String>,

    /// Group messages within summaries after stripping the matching part of
    /// the subject
    #[arg(long = "group-subject-replace")]
    pub group_subject_replace: Option<String>,

    /// Local bind address for the HTTP status endpoint
    #[arg(long = "bind-http", default_value = "localhost:8025")]
    pub bind_http: String,

    /// Also relay every received message un-summarized
    #[arg(long = "relay-all")]
    pub relay_all: bool,

    /// Username for AUTH PLAIN to the relay server
    #[arg(long = "relay-user")]
    pub relay_user: Option<String>,

    /// Password for AUTH PLAIN to the relay server
    #[arg(long = "relay-password")]
    pub relay_password: Option<String>,

    /// user:pass credentials clients must present via AUTH PLAIN
    #[arg(long)]
    pub auth: Option<String>,

    /// PEM certificate file; with --tls-key, enables STARTTLS
    #[arg(long = "tls-cert")]
    pub tls_cert: Option<PathBuf>,

    /// PEM key file; with --tls-cert, enables STARTTLS
    #[arg(long = "tls-key")]
    pub tls_key: Option<PathBuf>,

    /// Relay messages by piping them to this command's standard input
    #[arg(long = "relay-command")]
    pub relay_command: Option<String>,

    /// SMTP session script to run against the listener
    #[arg(long)]
    pub script: Option<PathBuf>,

    /// Write the process id here; fails if the file already exists
    #[arg(long)]
    pub pidfile: Option<PathBuf>,
}

impl Options {
    /// The batch grouping function.
    ///
    /// # Errors
    /// If a configured pattern does not compile.
    pub fn batch_key(&self) -> Result<GroupBy, PatternError> {
        GroupBy::batch(
            self.batch_subject_match.as_deref(),
            self.batch_subject_replace.as_deref(),
            &self.batch_header,
        )
    }

    /// The group grouping function.
    ///
    /// # Errors
    /// If a configured pattern does not compile.
    pub fn group_key(&self) -> Result<GroupBy, PatternError> {
        GroupBy::group(
            self.group_subject_match.as_deref(),
            self.group_subject_replace.as_deref(),
        )
    }

    /// The listener-side authenticator, when `--auth` is given.
    ///
    /// # Errors
    /// If the credentials are not in `user:pass` form.
    pub fn authenticator(&self) -> Result<Option<Arc<dyn Authenticator>>, ConfigError> {
        self.auth
            .as_deref()
            .map(|credentials| {
                SingleUserPlainAuth::from_credentials(credentials)
                    .map(|auth| Arc::new(auth) as Arc<dyn Authenticator>)
            })
            .transpose()
    }

    /// Credentials for the live relay, when both halves are given.
    #[must_use]
    pub fn relay_credentials(&self) -> Option<Credentials> {
        match (&self.relay_user, &self.relay_password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }

    /// The STARTTLS acceptor, when both `--tls-cert` and `--tls-key` are
    /// given.
    ///
    /// # Errors
    /// If the PEM material cannot be loaded.
    pub fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>, TlsError> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(certificate), Some(key)) => tls::acceptor(certificate, key).map(Some),
            _ => Ok(None),
        }
    }

    /// The summary From address, defaulting to `failmail@<hostname>`.
    #[must_use]
    pub fn from_address(&self, env: &dyn Environment) -> String {
        self.from.clone().unwrap_or_else(|| {
            let host = env
                .hostname()
                .unwrap_or_else(|_| "localhost".to_string());
            format!("failmail@{host}")
        })
    }

    #[must_use]
    pub fn wait_period(&self) -> Duration {
        *self.wait
    }

    #[must_use]
    pub fn max_wait(&self) -> Duration {
        *self.max_wait
    }

    #[must_use]
    pub fn rate_check_interval(&self) -> Duration {
        *self.rate_check
    }
}
