//! Append-only maildir sink.
//!
//! Messages are written directly to `cur/` with the `:2,S` (Seen) suffix,
//! since nothing ever moves them through `new/`. Filenames follow the
//! standard `<unix-seconds>.<pid>_<n>.<hostname>` scheme, where `n` is a
//! per-process counter; the counter keeps names distinct within a run and
//! the time/pid prefix disambiguates across runs.

use std::{
    fs,
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use failmail_common::{
    env::Environment,
    message::HeaderMap,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MaildirError {
    #[error("failed to create maildir at {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no message named {0}")]
    NoSuchMessage(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A message read back out of the maildir.
#[derive(Debug)]
pub struct StoredMessage {
    pub headers: HeaderMap,
    pub data: Vec<u8>,
}

impl StoredMessage {
    /// The `Subject:` header, or `""` when absent.
    #[must_use]
    pub fn subject(&self) -> &str {
        self.headers.get_first("subject").unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct Maildir {
    path: PathBuf,
    env: Arc<dyn Environment>,
    sequence: AtomicU64,
}

impl Maildir {
    /// Open the maildir at `path`, creating `cur/`, `new/`, and `tmp/` as
    /// needed. The parent of `path` must already exist.
    ///
    /// # Errors
    /// If any of the directories cannot be created.
    pub fn create(path: impl Into<PathBuf>, env: Arc<dyn Environment>) -> Result<Self, MaildirError> {
        let path = path.into();

        for dir in [path.clone(), path.join("cur"), path.join("new"), path.join("tmp")] {
            ensure_dir(&dir).map_err(|source| MaildirError::Create { path: dir, source })?;
        }

        Ok(Self {
            path,
            env,
            sequence: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The next filename in the `<seconds>.<pid>_<n>.<host>` scheme.
    ///
    /// Names are pairwise distinct for the life of the process: the counter
    /// is atomic and never reused.
    ///
    /// # Errors
    /// If the hostname cannot be determined.
    pub fn next_unique_name(&self) -> io::Result<String> {
        let host = self.env.hostname()?;
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;

        Ok(format!(
            "{}.{}_{}.{}",
            self.env.now().timestamp(),
            self.env.pid(),
            sequence,
            host
        ))
    }

    /// Write `data` as a new seen message, returning its filename.
    ///
    /// # Errors
    /// If the name cannot be generated or the file cannot be written.
    pub fn write(&self, data: &[u8]) -> Result<String, MaildirError> {
        let name = format!("{}:2,S", self.next_unique_name()?);
        fs::write(self.path.join("cur").join(&name), data)?;

        tracing::debug!(target: "failmail", name, bytes = data.len(), "wrote maildir message");
        Ok(name)
    }

    /// Filenames of every message in `cur/`, sorted.
    ///
    /// # Errors
    /// If the directory cannot be read.
    pub fn list(&self) -> Result<Vec<String>, MaildirError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.path.join("cur"))? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    /// Read a message back by filename.
    ///
    /// # Errors
    /// If the message does not exist or cannot be read.
    pub fn read(&self, name: &str) -> Result<StoredMessage, MaildirError> {
        let path = self.path.join("cur").join(name);
        if !path.is_file() {
            return Err(MaildirError::NoSuchMessage(name.to_string()));
        }

        let data = fs::read(path)?;
        let headers = HeaderMap::parse(&data);
        Ok(StoredMessage { headers, data })
    }
}

#[cfg(unix)]
fn ensure_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    if path.is_dir() {
        return Ok(());
    }
    fs::DirBuilder::new().mode(0o755).create(path)
}

#[cfg(not(unix))]
fn ensure_dir(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    fs::DirBuilder::new().create(path)
}
