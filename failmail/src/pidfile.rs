//! Pidfile management: create-exclusive on startup, removed on exit.

use std::{
    fs::OpenOptions,
    io::Write,
    path::PathBuf,
};

use failmail_common::{env::Environment, error::ConfigError};

/// Holds the pidfile for the life of the process; dropping it removes the
/// file.
#[derive(Debug)]
pub struct Pidfile {
    path: PathBuf,
}

impl Pidfile {
    /// Write the process id to `path`. Startup fails when the file already
    /// exists, since another instance probably owns it.
    ///
    /// # Errors
    /// If the file exists or cannot be written.
    pub fn create(path: PathBuf, env: &dyn Environment) -> Result<Self, ConfigError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| {
                if source.kind() == std::io::ErrorKind::AlreadyExists {
                    ConfigError::PidfileExists {
                        path: path.display().to_string(),
                    }
                } else {
                    ConfigError::Io(source)
                }
            })?;

        writeln!(file, "{}", env.pid())?;
        Ok(Self { path })
    }
}

impl Drop for Pidfile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
