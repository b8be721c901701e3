//! Service wiring: config → store → chain client → engine jobs → shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use escrow_core::{config::Config, constants::DEFAULT_MAX_LEASE_AGE};
use escrow_chain::client::{ChainClient, HttpChainClient};
use escrow_engine::{
    events::StateEventRx,
    lifecycle::{EngineConfig, LifecycleEngine},
    monitor::{ChainMonitor, MonitorNudge},
    scheduler::{self, ReaperConfig},
    store::MemoryStore,
};
use escrow_tokio::{shutdown::Shutdown, task::{self, Task}};
use tracing::info;

use crate::RunArgs;

/// How long in-flight ticks get to finish after a shutdown signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) async fn run(args: RunArgs) -> anyhow::Result<()> {
    // Fatal on missing encryption key or malformed env: refuse to start.
    let config = Config::from_env().context("Invalid configuration")?;
    info!(network = %config.network, "Starting escrowd");

    let chain: Arc<dyn ChainClient> = if args.mock_chain {
        info!("Using the in-process mock ledger");
        Arc::new(escrow_engine::testing::MockChain::new())
    } else {
        Arc::new(
            HttpChainClient::new(
                config.chain_api_url.clone(),
                config.chain_api_key.clone(),
            )
            .context("Could not build chain client")?,
        )
    };

    let store = MemoryStore::new();

    let engine = LifecycleEngine::new(
        store.clone(),
        chain.clone(),
        EngineConfig {
            seal_key: config.seal_key.clone(),
            cooldown_pad: config.cooldown_pad,
            time_buffer: config.time_buffer,
            max_batch_size: config.max_batch_size,
        },
    );
    let monitor =
        ChainMonitor::new(store.clone(), chain.clone(), config.tx_stuck);

    let shutdown = Shutdown::new();
    let monitor_nudge = MonitorNudge::new();
    // The intent API is the seam the (external) admin/public surface calls
    // into. Kept alive here so its monitor nudges stay connected.
    let _intents = escrow_engine::intents::Intents::new(
        store.clone(),
        monitor_nudge.clone(),
    );

    let events = store.events().subscribe();
    let mut tasks = scheduler::spawn_jobs(
        engine,
        monitor,
        store.clone(),
        config.scheduler_tick,
        ReaperConfig {
            max_lease_age: DEFAULT_MAX_LEASE_AGE,
            tx_stuck: config.tx_stuck,
        },
        monitor_nudge,
        shutdown.clone(),
    );
    tasks.push(spawn_event_logger(events, shutdown.clone()));

    // Complete in-flight ticks, then exit.
    let signal_shutdown = shutdown.clone();
    Task::spawn("signal listener", async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
        }
        signal_shutdown.send();
    })
    .detach();

    task::join_tasks_and_shutdown(
        "escrowd",
        tasks,
        shutdown,
        SHUTDOWN_TIMEOUT,
    )
    .await;
    info!("Bye");
    Ok(())
}

/// The logging observer: every persisted state change becomes one info
/// line. Webhook and metrics sinks subscribe to the same bus.
fn spawn_event_logger(
    mut events: StateEventRx,
    mut shutdown: Shutdown,
) -> Task<()> {
    Task::spawn("event logger", async move {
        loop {
            tokio::select! {
                biased;
                () = shutdown.recv() => break,
                event = events.next() => {
                    // `None` means the store (and with it the bus) is gone.
                    let Some(event) = event else { break };
                    info!(
                        event = event.kind.as_str(),
                        entity = %event.entity_id,
                        source = %event.payment_source_id,
                        old = event.old_state.unwrap_or("-"),
                        new = event.new_state,
                        "state change"
                    );
                }
            }
        }
    })
}
