//! Singleflight periodic job driver.
//!
//! Every job (one per lifecycle action, the chain monitor, the lease
//! reaper) runs as a named task on its own cadence. A per-job singleflight
//! mutex guarantees at most one running instance per process: a tick that
//! finds the previous one still running is an expected no-op, not an
//! error. On shutdown, in-flight ticks complete before the task exits.

use std::{sync::Arc, time::Duration};

use escrow_core::time::TimestampMs;
use escrow_tokio::{shutdown::Shutdown, task::Task};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::{
    lifecycle::{HANDLED_ACTIONS, LifecycleEngine},
    locker,
    monitor::{ChainMonitor, MonitorNudge},
    store::MemoryStore,
};

/// Cadence of the chain monitor.
const MONITOR_INTERVAL: Duration = Duration::from_secs(30);
/// Cadence of the wallet-lease reaper.
const REAPER_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// A process-wide mutual exclusion guard for one named job.
#[derive(Clone)]
pub struct Singleflight {
    name: &'static str,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Singleflight {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Run `fut` unless another instance of this job is already running,
    /// in which case return `None` immediately.
    pub async fn run<F>(&self, fut: F) -> Option<F::Output>
    where
        F: Future,
    {
        match self.lock.try_lock() {
            Ok(_guard) => Some(fut.await),
            Err(_busy) => {
                debug!("Job '{}' still running; skipping tick", self.name);
                None
            }
        }
    }
}

/// Reaper timing knobs.
#[derive(Copy, Clone)]
pub struct ReaperConfig {
    pub max_lease_age: Duration,
    pub tx_stuck: Duration,
}

/// Spawn every engine job. The returned tasks run until `shutdown` fires
/// and are meant to be joined via
/// [`join_tasks_and_shutdown`](escrow_tokio::task::join_tasks_and_shutdown).
pub fn spawn_jobs(
    engine: LifecycleEngine,
    monitor: ChainMonitor,
    store: MemoryStore,
    scheduler_tick: Duration,
    reaper: ReaperConfig,
    monitor_nudge: MonitorNudge,
    shutdown: Shutdown,
) -> Vec<Task<()>> {
    let mut tasks = Vec::new();

    for action in HANDLED_ACTIONS {
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        let label: &'static str = action.into();
        tasks.push(Task::spawn(format!("job {label}"), async move {
            run_periodic(label, scheduler_tick, shutdown, move || {
                let engine = engine.clone();
                async move { engine.tick(action).await }
            })
            .await;
        }));
    }

    tasks.push(spawn_monitor_job(monitor, monitor_nudge, shutdown.clone()));

    {
        let shutdown = shutdown.clone();
        tasks.push(Task::spawn("job lease-reaper", async move {
            run_periodic("lease-reaper", REAPER_INTERVAL, shutdown, move || {
                let store = store.clone();
                async move {
                    let now = TimestampMs::now();
                    let outcome = store
                        .run_serializable(move |data| {
                            locker::reap(
                                data,
                                now,
                                reaper.max_lease_age,
                                reaper.tx_stuck,
                            )
                        })
                        .await?;
                    if outcome.released + outcome.escalated > 0 {
                        info!(
                            released = outcome.released,
                            escalated = outcome.escalated,
                            "Reaper recovered leases"
                        );
                    }
                    Ok(())
                }
            })
            .await;
        }));
    }

    tasks
}

/// The monitor job also wakes on nudges (e.g. an intent that wants its
/// effect observed promptly).
fn spawn_monitor_job(
    monitor: ChainMonitor,
    nudge: MonitorNudge,
    mut shutdown: Shutdown,
) -> Task<()> {
    Task::spawn("job chain-monitor", async move {
        let singleflight = Singleflight::new("chain-monitor");
        let mut ticker = time::interval(MONITOR_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let trigger = async {
                tokio::select! {
                    _ = ticker.tick() => (),
                    () = nudge.nudged() => (),
                }
            };
            tokio::select! {
                biased;
                () = shutdown.recv() => break,
                () = trigger => {
                    let result = singleflight
                        .run(monitor.tick())
                        .await;
                    if let Some(Err(e)) = result {
                        error!("chain-monitor tick failed: {e:#}");
                    }
                }
            }
        }
        info!("chain-monitor shutting down");
    })
}

async fn run_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: Shutdown,
    mut tick_fn: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let singleflight = Singleflight::new(name);
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = shutdown.recv() => break,
            _ = ticker.tick() => {
                if let Some(Err(e)) = singleflight.run(tick_fn()).await {
                    error!("{name} tick failed: {e:#}");
                }
            }
        }
    }
    info!("{name} shutting down");
}
