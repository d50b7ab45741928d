//! The SMTP accept loop.

use std::{io, net::SocketAddr, sync::Arc};

use failmail_common::{
    error::ListenerError, internal, message::ReceivedMessage, Signal,
};
use futures_util::future::join_all;
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc},
};

use crate::session::{Session, SessionConfig};

/// Accepts connections on the configured socket and runs one session task
/// per connection until a shutdown signal arrives.
pub struct Listener {
    listener: TcpListener,
    config: Arc<SessionConfig>,
    received: mpsc::Sender<Arc<ReceivedMessage>>,
}

impl Listener {
    /// Bind the listen socket. Bind failures are fatal at startup.
    ///
    /// # Errors
    /// If the address cannot be bound.
    pub async fn bind(
        address: &str,
        config: SessionConfig,
        received: mpsc::Sender<Arc<ReceivedMessage>>,
    ) -> Result<Self, ListenerError> {
        let listener =
            TcpListener::bind(address)
                .await
                .map_err(|source| ListenerError::BindFailed {
                    address: address.to_string(),
                    source,
                })?;

        Ok(Self {
            listener,
            config: Arc::new(config),
            received,
        })
    }

    /// The bound address; useful when binding to port 0.
    ///
    /// # Errors
    /// If the socket is gone.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until shutdown. On a signal the listener stops accepting and
    /// waits up to the configured shutdown timeout for in-flight sessions to
    /// finish their current message, then abandons them.
    pub async fn serve(self, mut shutdown: broadcast::Receiver<Signal>) {
        internal!(
            "listening for SMTP on {}",
            self.listener
                .local_addr()
                .map_or_else(|_| "<unknown>".to_string(), |addr| addr.to_string())
        );

        let mut sessions: Vec<tokio::task::JoinHandle<()>> = Vec::new();

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    internal!("SMTP listener draining {} sessions", sessions.len());

                    let drain = join_all(sessions.iter_mut());
                    if tokio::time::timeout(self.config.shutdown_timeout, drain)
                        .await
                        .is_err()
                    {
                        internal!(level = WARN, "abandoning sessions still in flight");
                        for session in &sessions {
                            session.abort();
                        }
                    }
                    return;
                }

                connection = self.listener.accept() => {
                    let (stream, peer) = match connection {
                        Ok(connection) => connection,
                        Err(err) => {
                            internal!(level = ERROR, "accept failed: {err}");
                            continue;
                        }
                    };

                    let session = Session::create(
                        stream,
                        peer,
                        Arc::clone(&self.config),
                        self.received.clone(),
                    );
                    let session_shutdown = shutdown.resubscribe();

                    sessions.push(tokio::spawn(async move {
                        if let Err(err) = session.run(session_shutdown).await {
                            if err.is_client_error() {
                                internal!(level = WARN, "session ended: {err}");
                            } else {
                                internal!(level = ERROR, "session failed: {err}");
                            }
                        }
                    }));

                    // Completed sessions are cheap to keep, but don't let an
                    // idle burst grow the list without bound.
                    sessions.retain(|session| !session.is_finished());
                }
            }
        }
    }
}
