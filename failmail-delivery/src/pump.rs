//! The upstream pump: drains the `sending` channel into the configured
//! chain, spooling anything the chain rejects.

use std::sync::Arc;

use failmail_common::{internal, message::OutgoingMessage};
use failmail_maildir::Maildir;
use tokio::sync::mpsc;

use crate::upstream::Upstream;

/// Run until the `sending` channel is closed and drained. Send errors route
/// the bytes to the failure maildir; a failing spool write is logged and
/// never re-raised.
pub async fn pump(
    mut sending: mpsc::Receiver<OutgoingMessage>,
    upstream: Arc<dyn Upstream>,
    failures: Arc<Maildir>,
) {
    while let Some(message) = sending.recv().await {
        if let Err(send_err) = upstream.send(&message).await {
            internal!(level = ERROR, "couldn't send message: {send_err}");
            if let Err(save_err) = failures.write(message.data()) {
                internal!(level = ERROR, "couldn't save message: {save_err}");
            }
        }
    }

    internal!("done sending");
}
