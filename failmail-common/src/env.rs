//! Ambient inputs reified as an injectable environment.
//!
//! Unique maildir names and flush deadlines depend on the hostname, the
//! process id, and the wall clock. Components take an `Arc<dyn Environment>`
//! instead of reading OS primitives directly so that tests can pin all three.

use std::io;

use chrono::{DateTime, Utc};

pub trait Environment: Send + Sync + std::fmt::Debug {
    /// The local hostname, used as the final component of maildir filenames.
    ///
    /// # Errors
    /// If the hostname cannot be determined.
    fn hostname(&self) -> io::Result<String>;

    fn pid(&self) -> u32;

    fn now(&self) -> DateTime<Utc>;
}

/// Production environment backed by OS primitives.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemEnvironment;

impl Environment for SystemEnvironment {
    fn hostname(&self) -> io::Result<String> {
        match std::env::var("HOSTNAME") {
            Ok(host) if !host.is_empty() => Ok(host),
            _ => std::fs::read_to_string("/proc/sys/kernel/hostname")
                .map(|host| host.trim().to_string())
                .or_else(|_| Ok("localhost".to_string())),
        }
    }

    fn pid(&self) -> u32 {
        std::process::id()
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Environment with every input pinned, for tests.
#[derive(Debug, Clone)]
pub struct FixedEnvironment {
    /// `None` makes `hostname()` fail, for exercising error paths.
    pub hostname: Option<String>,
    pub pid: u32,
    pub now: DateTime<Utc>,
}

impl FixedEnvironment {
    /// The conventional fixture: host `test`, pid 1000, `t=1393650000`.
    #[must_use]
    pub fn pinned() -> Self {
        Self {
            hostname: Some("test".to_string()),
            pid: 1000,
            now: DateTime::from_timestamp(1_393_650_000, 0).unwrap_or_default(),
        }
    }
}

impl Environment for FixedEnvironment {
    fn hostname(&self) -> io::Result<String> {
        self.hostname
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "couldn't get hostname"))
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn now(&self) -> DateTime<Utc> {
        self.now
    }
}
