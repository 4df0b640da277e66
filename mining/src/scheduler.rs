/// Periodic background tasks
///
/// Three independent loops drive the engine:
/// - energy regeneration
/// - completion sweep
/// - storage cleanup
///
/// Each loop runs its job to completion before waiting for the next tick,
/// so runs of the same task never overlap. A failing run is logged and the
/// loop keeps going.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::engine::MiningEngine;
use crate::error::MiningError;

pub const ENERGY_REGENERATION: &str = "energy-regeneration";
pub const COMPLETION_SWEEP: &str = "completion-sweep";
pub const STORAGE_CLEANUP: &str = "storage-cleanup";

/// A named loop on its own tokio task. Dropping it without `stop` also
/// ends the loop at its next wake-up.
pub struct PeriodicTask {
    name: &'static str,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
    runs: Arc<AtomicU64>,
}

impl PeriodicTask {
    /// First run happens one `period` after spawning.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, job: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), MiningError>> + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let runs = Arc::new(AtomicU64::new(0));
        let counter = runs.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = interval.tick() => {}
                }
                if *stop_rx.borrow() {
                    break;
                }
                if let Err(e) = job().await {
                    tracing::error!(task = name, "Periodic task run failed: {}", e);
                }
                counter.fetch_add(1, Ordering::Relaxed);
            }
            tracing::debug!(task = name, "Periodic task stopped");
        });

        Self { name, stop_tx, handle, runs }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Completed runs, failed ones included.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    /// Signal the loop and wait for an in-flight run to finish.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.handle.await {
            tracing::error!(task = self.name, "Periodic task aborted: {}", e);
        }
    }
}

/// Wrap an engine job so a run after the engine is gone does nothing.
fn with_engine<F, Fut>(
    engine: &Arc<MiningEngine>,
    job: F,
) -> impl Fn() -> BoxedRun + Send + Sync + 'static
where
    F: Fn(Arc<MiningEngine>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), MiningError>> + Send + 'static,
{
    let engine: Weak<MiningEngine> = Arc::downgrade(engine);
    move || {
        let run: BoxedRun = match engine.upgrade() {
            Some(engine) => Box::pin(job(engine)),
            None => Box::pin(async { Ok(()) }),
        };
        run
    }
}

type BoxedRun = Pin<Box<dyn Future<Output = Result<(), MiningError>> + Send>>;

pub struct Scheduler {
    tasks: Vec<PeriodicTask>,
}

impl Scheduler {
    /// Tasks hold the engine weakly. Once the last strong handle is gone
    /// the scheduler is dropped with it and every loop winds down.
    pub fn start(engine: &Arc<MiningEngine>) -> Self {
        let config = engine.config().clone();

        let regen = PeriodicTask::spawn(
            ENERGY_REGENERATION,
            Duration::from_secs(config.regen_interval_secs),
            with_engine(engine, |engine| async move { engine.regenerate_energy().await.map(|_| ()) }),
        );

        let sweep = PeriodicTask::spawn(
            COMPLETION_SWEEP,
            Duration::from_secs(config.sweep_interval_secs),
            with_engine(engine, |engine| async move { engine.sweep_completions().await.map(|_| ()) }),
        );

        let cleanup = PeriodicTask::spawn(
            STORAGE_CLEANUP,
            Duration::from_secs(config.cleanup_interval_secs),
            with_engine(engine, |engine| async move { engine.cleanup().await.map(|_| ()) }),
        );

        tracing::info!(
            "Scheduler started: regen={}s sweep={}s cleanup={}s",
            config.regen_interval_secs,
            config.sweep_interval_secs,
            config.cleanup_interval_secs
        );
        Self { tasks: vec![regen, sweep, cleanup] }
    }

    pub fn task(&self, name: &str) -> Option<&PeriodicTask> {
        self.tasks.iter().find(|t| t.name() == name)
    }

    /// Stop a single task, leaving the others running.
    pub async fn stop_task(&mut self, name: &str) -> bool {
        match self.tasks.iter().position(|t| t.name() == name) {
            Some(i) => {
                self.tasks.remove(i).stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn stop(self) {
        for task in self.tasks {
            task.stop().await;
        }
        tracing::info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::MiningConfig;
    use crate::memory::{MemoryCache, MemoryNotifier, MemoryStore};
    use chrono::{DateTime, Utc};
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn task_runs_once_per_period() {
        let task = PeriodicTask::spawn("test", Duration::from_secs(10), || async { Ok(()) });
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(task.runs(), 0);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(task.runs(), 3);
        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn slow_runs_never_overlap() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let task = {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            PeriodicTask::spawn("slow", Duration::from_secs(1), move || {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(3500)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };
        tokio::time::sleep(Duration::from_secs(20)).await;
        task.stop().await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_run_does_not_stop_the_loop() {
        let task = PeriodicTask::spawn("failing", Duration::from_secs(1), || async {
            Err(MiningError::NotMining)
        });
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(task.runs(), 3);
        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_task_completes_due_sessions() {
        let store = Arc::new(MemoryStore::new());
        store.add_miner(1, 1);
        let clock = Arc::new(ManualClock::new(
            DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
        ));
        let engine = Arc::new(
            MiningEngine::new(
                MiningConfig::default(),
                store.clone(),
                Arc::new(MemoryCache::new()),
                Arc::new(MemoryNotifier::new()),
            )
            .with_clock(clock.clone()),
        );
        engine.start_mining(1).await.unwrap();

        let mut scheduler = Scheduler::start(&engine);
        clock.advance_ms(180_000);
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(store.blocks().len(), 1);
        assert!(scheduler.task(COMPLETION_SWEEP).unwrap().runs() >= 1);

        assert!(scheduler.stop_task(ENERGY_REGENERATION).await);
        assert!(scheduler.task(ENERGY_REGENERATION).is_none());
        assert!(scheduler.task(STORAGE_CLEANUP).is_some());
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_task_stops_its_loop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let task = {
            let calls = calls.clone();
            PeriodicTask::spawn("dropped", Duration::from_secs(1), move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(task);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn running_scheduler_does_not_keep_the_engine_alive() {
        let engine = Arc::new(MiningEngine::new(
            MiningConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryCache::new()),
            Arc::new(MemoryNotifier::new()),
        ));
        engine.initialize().await.unwrap();
        assert!(engine.is_running().await);

        let weak = Arc::downgrade(&engine);
        drop(engine);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(weak.upgrade().is_none());
    }
}
