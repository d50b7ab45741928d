//! Shared foundation for the failmail workspace: the termination signal,
//! ambient-environment injection, message types, logging, and error types.

pub mod env;
pub mod error;
pub mod logging;
pub mod message;

pub use tracing;

/// Signal broadcast to every long-lived task.
///
/// Both variants drain the message buffer identically; the outer driver
/// re-runs the pipeline on `Reload` and exits on `Shutdown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Reload,
}
