use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use failmail::{
    config::Options,
    coordinator::Coordinator,
    pidfile::Pidfile,
    script,
};
use failmail_common::{
    env::{Environment, SystemEnvironment},
    internal, logging, Signal,
};
use failmail_delivery::{build_upstream, pump};
use failmail_http::StatusServer;
use failmail_maildir::Maildir;
use failmail_smtp::{Listener, SessionConfig};
use failmail_summary::{MessageBuffer, RateCounter, SummaryRenderer};
use tokio::sync::{broadcast, mpsc};

#[cfg(not(unix))]
compile_error!("failmail only supports unix targets");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    logging::init();

    let env: Arc<dyn Environment> = Arc::new(SystemEnvironment);

    let _pidfile = options
        .pidfile
        .clone()
        .map(|path| Pidfile::create(path, env.as_ref()))
        .transpose()
        .context("failed to write pidfile")?;

    // One broadcast channel and one signal driver for the life of the
    // process; every run of the pipeline subscribes afresh.
    let (signal_tx, _) = broadcast::channel(16);
    tokio::spawn(watch_signals(signal_tx.clone()));

    loop {
        match run(&options, Arc::clone(&env), &signal_tx).await? {
            Signal::Reload => {
                internal!("reloading");
            }
            Signal::Shutdown => return Ok(()),
        }
    }
}

/// SIGINT/SIGTERM request a shutdown; SIGHUP requests a drain-and-reload.
async fn watch_signals(signals: broadcast::Sender<Signal>) {
    use tokio::signal::unix::{signal, SignalKind};

    let Ok(mut terminate) = signal(SignalKind::terminate()) else {
        return;
    };
    let Ok(mut hangup) = signal(SignalKind::hangup()) else {
        return;
    };

    loop {
        let caught = tokio::select! {
            _ = tokio::signal::ctrl_c() => Signal::Shutdown,
            _ = terminate.recv() => Signal::Shutdown,
            _ = hangup.recv() => Signal::Reload,
        };

        internal!("caught signal: {caught:?}");
        if signals.send(caught).is_err() {
            return;
        }
    }
}

/// Build and run the whole pipeline once; returns the signal that ended it.
async fn run(
    options: &Options,
    env: Arc<dyn Environment>,
    signal_tx: &broadcast::Sender<Signal>,
) -> anyhow::Result<Signal> {
    let batch = options.batch_key().context("invalid batch pattern")?;
    let group = options.group_key().context("invalid group pattern")?;
    let authenticator = options.authenticator().context("invalid --auth value")?;
    let tls = options.tls_acceptor().context("failed to load TLS material")?;
    let from = options.from_address(env.as_ref());

    // Any messages we can't hand to the upstream end up here; failure to
    // create it is fatal.
    let failures = Arc::new(
        Maildir::create(options.fail_dir.clone(), Arc::clone(&env))
            .context("failed to create maildir for failed messages")?,
    );

    let archive = options
        .all_dir
        .as_ref()
        .map(|dir| Maildir::create(dir.clone(), Arc::clone(&env)).map(Arc::new))
        .transpose()
        .context("failed to create maildir for the archive")?;

    let upstream = build_upstream(
        &options.relay,
        options.relay_credentials(),
        archive,
        options.relay_command.as_deref(),
    );

    let (received_tx, received_rx) = mpsc::channel(64);
    let (sending_tx, sending_rx) = mpsc::channel(64);

    // Subscribe every task before any of them starts, so a signal arriving
    // during startup is seen by all of them.
    let listener_signals = signal_tx.subscribe();
    let status_signals = signal_tx.subscribe();
    let coordinator_signals = signal_tx.subscribe();

    let banner = env.hostname().unwrap_or_else(|_| "localhost".to_string());
    let session_config = SessionConfig::new(banner, Arc::clone(&env))
        .with_auth(authenticator)
        .with_tls(tls);

    let listener = Listener::bind(&options.bind, session_config, received_tx)
        .await
        .context("failed to bind SMTP listener")?;
    let listen_addr = listener.local_addr()?;

    let buffer = MessageBuffer::new(options.wait_period(), options.max_wait(), batch, group);
    let rate = RateCounter::new(options.rate_limit, options.rate_window);
    let (coordinator, stats_rx) = Coordinator::new(
        buffer,
        rate,
        options.rate_check_interval(),
        options.relay_all,
        SummaryRenderer::new(from),
        Arc::clone(&env),
    );

    let status = StatusServer::bind(&options.bind_http, stats_rx)
        .await
        .context("failed to bind HTTP status endpoint")?;

    let listener_task = tokio::spawn(listener.serve(listener_signals));
    let status_task = tokio::spawn(status.serve(status_signals));
    let pump_task = tokio::spawn(pump(sending_rx, upstream, Arc::clone(&failures)));

    if let Some(script_path) = options.script.clone() {
        let script_signals = signal_tx.clone();
        tokio::spawn(async move {
            if let Err(err) = script::run_script(&script_path, listen_addr).await {
                internal!(level = ERROR, "script failed: {err}");
            }
            let _ = script_signals.send(Signal::Shutdown);
        });
    }

    let signal = coordinator
        .run(received_rx, sending_tx, coordinator_signals)
        .await;

    // The coordinator has dropped its sender; wait for the pump to flush the
    // tail of the queue (and any failure-spool writes) before returning.
    pump_task.await.context("upstream pump failed")?;
    let _ = listener_task.await;
    let _ = status_task.await;

    Ok(signal)
}
