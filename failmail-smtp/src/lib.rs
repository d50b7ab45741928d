//! SMTP plumbing for failmail: the server side (listener, per-connection
//! session state machine, AUTH PLAIN, STARTTLS) and the client side (the
//! one-shot relay transaction used by the live upstream).

pub mod auth;
pub mod client;
pub mod command;
pub mod connection;
pub mod listener;
pub mod response;
pub mod session;
pub mod tls;

pub use auth::{Authenticator, SingleUserPlainAuth};
pub use client::{Credentials, SmtpClient};
pub use command::Command;
pub use listener::Listener;
pub use session::SessionConfig;
