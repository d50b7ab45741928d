//! The single event loop at the center of the pipeline.
//!
//! The coordinator exclusively owns the message buffer and the rate counter.
//! It multiplexes four inputs: the one-second flush tick, the rate-check
//! tick, message arrivals, and the termination signal. After every event it
//! publishes a buffer snapshot for the HTTP status endpoint.

use std::{sync::Arc, time::Duration};

use failmail_common::{
    env::Environment,
    internal,
    message::{OutgoingMessage, ReceivedMessage},
    Signal,
};
use failmail_summary::{BufferStats, MessageBuffer, RateCounter, SummaryRenderer};
use tokio::{
    sync::{broadcast, mpsc, watch},
    time::MissedTickBehavior,
};

pub struct Coordinator {
    buffer: MessageBuffer,
    rate: RateCounter,
    rate_check: Duration,
    relay_all: bool,
    renderer: SummaryRenderer,
    env: Arc<dyn Environment>,
    stats: watch::Sender<BufferStats>,
}

impl Coordinator {
    /// Build the coordinator and the stats snapshot feed for the status
    /// endpoint.
    #[must_use]
    pub fn new(
        buffer: MessageBuffer,
        rate: RateCounter,
        rate_check: Duration,
        relay_all: bool,
        renderer: SummaryRenderer,
        env: Arc<dyn Environment>,
    ) -> (Self, watch::Receiver<BufferStats>) {
        let (stats, stats_rx) = watch::channel(BufferStats::default());

        (
            Self {
                buffer,
                rate,
                // A zero interval would panic in tokio; nobody wants a
                // sub-second rate check anyway.
                rate_check: rate_check.max(Duration::from_secs(1)),
                relay_all,
                renderer,
                env,
                stats,
            },
            stats_rx,
        )
    }

    /// Run until a termination signal arrives, then drain the buffer into
    /// `sending` and return the signal. Dropping `sending` on return is what
    /// lets the upstream pump exit once it has drained the channel.
    pub async fn run(
        mut self,
        mut received: mpsc::Receiver<Arc<ReceivedMessage>>,
        sending: mpsc::Sender<OutgoingMessage>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Signal {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut rate_tick = tokio::time::interval(self.rate_check);
        rate_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut received_open = true;

        loop {
            tokio::select! {
                _ = tick.tick() => self.flush_due(&sending).await,

                _ = rate_tick.tick() => self.check_rate(),

                message = received.recv(), if received_open => match message {
                    Some(message) => self.accept(message, &sending).await,
                    None => received_open = false,
                },

                signal = shutdown.recv() => {
                    let signal = signal.unwrap_or(Signal::Shutdown);
                    internal!("cleaning up");

                    // Accepted messages may still be queued on the channel;
                    // fold them in before the final flush so nothing the
                    // listener acknowledged is dropped.
                    while let Ok(message) = received.try_recv() {
                        self.accept(message, &sending).await;
                    }

                    self.drain(&sending).await;
                    return signal;
                }
            }

            let _ = self.stats.send(self.buffer.stats());
        }
    }

    async fn accept(
        &mut self,
        message: Arc<ReceivedMessage>,
        sending: &mpsc::Sender<OutgoingMessage>,
    ) {
        self.rate.add(1);

        if self.relay_all {
            // Pass the raw message through alongside its eventual summary.
            if sending.send(OutgoingMessage::from(message.as_ref())).await.is_err() {
                internal!(level = ERROR, "sending channel closed; dropping pass-through");
            }
        }

        self.buffer.add(message);
    }

    async fn flush_due(&mut self, sending: &mpsc::Sender<OutgoingMessage>) {
        let now = self.env.now();
        for summary in self.buffer.flush(false, now) {
            let outgoing = self.renderer.render(&summary, now);
            if sending.send(outgoing).await.is_err() {
                internal!(level = ERROR, "sending channel closed; dropping summary");
            }
        }
    }

    fn check_rate(&mut self) {
        let (exceeded, count) = self.rate.check_and_advance();
        if exceeded {
            internal!(level = WARN, "rate limit check exceeded: {count} messages");
        }
    }

    async fn drain(&mut self, sending: &mpsc::Sender<OutgoingMessage>) {
        let now = self.env.now();
        for summary in self.buffer.flush(true, now) {
            let outgoing = self.renderer.render(&summary, now);
            if sending.send(outgoing).await.is_err() {
                internal!(level = ERROR, "sending channel closed; dropping summary");
            }
        }
        let _ = self.stats.send(self.buffer.stats());
    }
}
