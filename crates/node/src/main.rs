//! `jobforge-node`: a single job node on the in-memory stack.

mod jobs;

use std::sync::{Arc, mpsc};

use anyhow::Context;
use tracing::{info, warn};

use jobforge_events::{InMemoryBroker, InMemoryEventSink, MessageTransport};
use jobforge_infra::JobsConfig;
use jobforge_infra::jobs::{
    CronScheduler, InMemoryJobCurator, JobCurator, JobManager, JobMessageReceiver, JobScheduler, Mode, ModeChange,
    ReceiverConfig, TransportJobDispatcher,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    jobforge_observability::init();

    let config = JobsConfig::from_env().context("invalid job configuration")?;
    info!(
        node = %config.node_name,
        threads = config.threads,
        scheduler_enabled = config.scheduler_enabled,
        publish = %config.publish_address,
        consume = %config.consume_address,
        "starting job node"
    );

    let broker = InMemoryBroker::new();
    let transport: Arc<dyn MessageTransport> = Arc::new(broker);
    let curator: Arc<dyn JobCurator> = InMemoryJobCurator::arc();
    let registry = Arc::new(jobs::registry(&config.node_name, curator.clone())?);

    let dispatcher = Arc::new(TransportJobDispatcher::new(transport.clone(), config.publish_address.clone())?);

    let mut receiver_config = ReceiverConfig::new(config.consume_address.clone()).with_threads(config.threads);
    if let Some(filter) = &config.consume_filter {
        receiver_config = receiver_config.with_filter(filter.clone());
    }
    let receiver = JobMessageReceiver::new(transport, receiver_config)?;

    let manager = JobManager::builder(config, registry, curator, dispatcher, InMemoryEventSink::arc())
        .with_receiver(receiver)
        .with_scheduler(|callback| Arc::new(CronScheduler::new(callback)) as Arc<dyn JobScheduler>)
        .build();

    let (mode_tx, mode_rx) = mpsc::channel();
    manager.attach_mode_channel(mode_rx)?;
    manager.initialize()?;
    manager.start()?;
    info!(node = %manager.node_name(), jobs = ?manager.registry().keys(), "job node running");

    wait_for_signals(&mode_tx).await;

    drop(mode_tx);
    manager.shutdown()?;
    info!("job node stopped");
    Ok(())
}

/// Wait for SIGINT/SIGTERM. On Unix, SIGUSR1 suspends the node and SIGUSR2
/// resumes it, through the same channel a mode controller would use.
async fn wait_for_signals(modes: &mpsc::Sender<ModeChange>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let (Ok(mut terminate), Ok(mut suspend), Ok(mut resume)) = (
            signal(SignalKind::terminate()),
            signal(SignalKind::user_defined1()),
            signal(SignalKind::user_defined2()),
        ) else {
            warn!("unable to install signal handlers; waiting for Ctrl-C only");
            ctrl_c().await;
            return;
        };

        let mut mode = Mode::Normal;
        loop {
            tokio::select! {
                () = ctrl_c() => {
                    info!("received SIGINT, shutting down");
                    return;
                }
                _ = terminate.recv() => {
                    info!("received SIGTERM, shutting down");
                    return;
                }
                _ = suspend.recv() => {
                    mode = send_mode(modes, mode, Mode::Suspend);
                }
                _ = resume.recv() => {
                    mode = send_mode(modes, mode, Mode::Normal);
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = modes;
        ctrl_c().await;
        info!("received Ctrl-C, shutting down");
    }
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "unable to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
fn send_mode(modes: &mpsc::Sender<ModeChange>, previous: Mode, current: Mode) -> Mode {
    info!(?previous, ?current, "operational mode change requested");
    if modes.send(ModeChange::new(previous, current)).is_err() {
        warn!("mode listener is gone; ignoring mode change");
        return previous;
    }
    current
}
