//! Server wiring: logging, secrets, the chain client, and the component
//! tasks, run until a termination signal arrives.

use crate::chain::{signer_from_secret, ChainClient};
use crate::config::Config;
use crate::reporter::events::EventSubscriber;
use crate::reporter::mq::MqConsumer;
use crate::reporter::store::{MarketItemStore, SharedVotingPeriod, StoreDispatcher};
use crate::reporter::verify::VerifierClient;
use crate::reporter::{ReporterHandle, TxSender, REPORTING_TX_BUFFER};
use crate::secrets::{self, SecretsManagerConfig, REPORTER_KEY};
use anyhow::Context;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Install the global tracing subscriber. Level comes from `RUST_LOG`
/// (default `info`); format is text or JSON per the config/flag.
pub fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Bootstrap every component and run until SIGINT/SIGTERM. Errors returned
/// here are startup errors; once the components are up, failures are
/// handled by their own supervision loops.
pub async fn run(config: Config) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data dir ({})", config.data_dir.display()))?;

    let secrets_config = match &config.secrets_config {
        Some(path) => {
            Some(SecretsManagerConfig::read(path).context("unable to read secrets config file")?)
        }
        None => None,
    };
    let secrets_manager = secrets::new_secrets_manager(secrets_config.as_ref(), &config.data_dir)?;

    let key_bytes = secrets_manager
        .get_secret(REPORTER_KEY)
        .context("reporter key missing; run `secrets init --ecdsa` first")?;
    let signer = signer_from_secret(&key_bytes).context("failed to parse reporter key")?;
    info!(address = %signer.address(), "loaded reporter identity");

    let reporter_config = &config.reporter;
    let chain = Arc::new(
        ChainClient::connect(
            &reporter_config.json_rpc_url,
            reporter_config.nonce_rpc_url(),
            reporter_config.outcome_reporter_address.unwrap_or_default(),
            signer,
        )
        .await
        .context("failed to connect chain client")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let store = Arc::new(MarketItemStore::new());
    let voting_period = SharedVotingPeriod::new();

    let (queue_tx, queue_rx) = mpsc::channel(REPORTING_TX_BUFFER);
    let verifier = VerifierClient::new(reporter_config.verify_outcome_api_url.clone());
    let handle = ReporterHandle::new(queue_tx, verifier);

    let sender = TxSender::new(
        chain.clone(),
        store.clone(),
        reporter_config.sx_node_address,
        queue_rx,
        shutdown_rx.clone(),
    );
    tasks.push(tokio::spawn(sender.run()));

    if reporter_config.amqp_uri.is_empty() {
        info!("no 'amqp_uri' configured, message consumer disabled");
    } else {
        let consumer = MqConsumer::new(
            reporter_config.amqp_uri.clone(),
            reporter_config.amqp_exchange_name.clone(),
            reporter_config.amqp_queue_name.clone(),
            handle.clone(),
            shutdown_rx.clone(),
        );
        tasks.push(tokio::spawn(consumer.run()));
    }

    if reporter_config.verify_outcome_api_url.is_empty() {
        warn!(
            "reporter 'verify_outcome_api_url' is missing but required for outcome voting and \
             reporting; skipping outcome voting and reporting"
        );
    } else {
        let subscriber = EventSubscriber::new(
            reporter_config.ws_rpc_url.clone(),
            reporter_config.outcome_reporter_address.unwrap_or_default(),
            chain.clone(),
            voting_period.clone(),
            store.clone(),
            handle.clone(),
            shutdown_rx.clone(),
        );
        tasks.push(
            subscriber
                .start()
                .await
                .context("failed to subscribe to outcome events")?,
        );

        let dispatcher = StoreDispatcher::new(
            store.clone(),
            voting_period.clone(),
            handle.clone(),
            shutdown_rx.clone(),
        );
        tasks.push(tokio::spawn(dispatcher.run()));
    }

    // the producers own the remaining handle clones
    drop(handle);

    info!("reporter agent running");
    wait_for_signal().await;

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }

    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            error!(error = %err, "failed to install SIGTERM handler, watching SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received interrupt signal"),
        _ = sigterm.recv() => info!("received termination signal"),
    }
}
