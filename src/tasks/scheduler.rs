//! Runs a task once, or on a cron schedule with a random delay before each firing.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Local;
use futures::FutureExt;
use futures::future::BoxFuture;
use rand::Rng;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{backup_task, restore_task};
use crate::config::{Config, Schedule};
use crate::cron::CronSchedule;
use crate::sources::Source;
use crate::stores::Store;
use crate::{Error, Result};

/// The unit of work a scheduler triggers.
pub type TaskFn = Arc<dyn Fn(Arc<Config>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub struct Scheduler {
    config: Arc<Config>,
    task: TaskFn,
    shutdown: CancellationToken,
    driver: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new<F, Fut>(config: Config, task: F) -> Self
    where
        F: Fn(Arc<Config>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            config: Arc::new(config),
            task: Arc::new(move |config: Arc<Config>| task(config).boxed()),
            shutdown: CancellationToken::new(),
            driver: None,
        }
    }

    /// Schedules [`backup_task`] for `source` and `store`.
    pub fn backup(config: Config, source: Arc<dyn Source>, store: Arc<dyn Store>) -> Self {
        Self::new(config, move |config| {
            let source = Arc::clone(&source);
            let store = Arc::clone(&store);
            async move { backup_task(&config, source.as_ref(), store.as_ref()).await }
        })
    }

    /// Schedules [`restore_task`] for `source` and `store`.
    pub fn restore(config: Config, source: Arc<dyn Source>, store: Arc<dyn Store>) -> Self {
        Self::new(config, move |config| {
            let source = Arc::clone(&source);
            let store = Arc::clone(&store);
            async move { restore_task(&config, source.as_ref(), store.as_ref()).await }
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Without a schedule, runs the task to completion and returns its result.
    /// With one, spawns the background driver and returns right away.
    pub async fn start(&mut self) -> Result<()> {
        let schedule = match self.config.schedule() {
            Schedule::Immediate => {
                info!("Running task directly");
                return (self.task)(Arc::clone(&self.config)).await;
            }
            Schedule::Cron(schedule) => schedule.clone(),
        };

        if self.driver.is_some() || self.shutdown.is_cancelled() {
            return Err(Error::Config(
                "scheduler can only be started once".to_string(),
            ));
        }

        info!(schedule = %schedule, "Starting scheduled task");
        let driver = Arc::new(Driver {
            schedule,
            config: Arc::clone(&self.config),
            task: Arc::clone(&self.task),
            shutdown: self.shutdown.clone(),
            running: AtomicBool::new(false),
        });
        self.driver = Some(tokio::spawn(driver.run()));
        Ok(())
    }

    /// Cancels pending triggers and random delays, then waits for the driver
    /// and for any execution already in progress to finish.
    pub async fn stop(&mut self) -> Result<()> {
        self.shutdown.cancel();
        if let Some(driver) = self.driver.take() {
            driver.await?;
        }
        Ok(())
    }

    /// Starts the scheduler, then blocks until SIGINT or SIGTERM and stops it.
    pub async fn run_until_shutdown(mut self) -> Result<()> {
        self.start().await?;
        if self.driver.is_none() {
            return Ok(());
        }

        wait_for_signal().await?;
        self.stop().await
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let context = || "cannot install signal handler".to_string();
    let mut sigterm = signal(SignalKind::terminate()).map_err(|source| Error::Io {
        context: context(),
        source,
    })?;
    let mut sigint = signal(SignalKind::interrupt()).map_err(|source| Error::Io {
        context: context(),
        source,
    })?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await.map_err(|source| Error::Io {
        context: "cannot install signal handler".to_string(),
        source,
    })?;
    info!("Received Ctrl+C");
    Ok(())
}

/// State shared by the schedule loop and every firing it spawns.
struct Driver {
    schedule: CronSchedule,
    config: Arc<Config>,
    task: TaskFn,
    shutdown: CancellationToken,
    /// Set while an execution is in progress.
    running: AtomicBool,
}

impl Driver {
    async fn run(self: Arc<Self>) {
        let mut firings = JoinSet::new();
        let mut last = Local::now().naive_local();
        loop {
            while let Some(done) = firings.try_join_next() {
                log_firing(done);
            }

            let now = Local::now().naive_local();
            let Some(next) = self.schedule.next_after(now.max(last)) else {
                warn!(schedule = %self.schedule, "Schedule has no upcoming trigger");
                break;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            last = next;

            let driver = Arc::clone(&self);
            firings.spawn(async move { driver.fire().await });
        }
        info!("Stopping scheduled task");

        // delayed firings return on cancellation, running ones complete
        if !firings.is_empty() {
            info!("Waiting for {} scheduled runs to finish", firings.len());
        }
        while let Some(done) = firings.join_next().await {
            log_firing(done);
        }
    }

    async fn fire(&self) {
        self.execute_after(jitter(self.config.random_delay())).await;
    }

    /// Waits `delay` unless cancelled, then runs the task once.
    async fn execute_after(&self, delay: Duration) {
        if !delay.is_zero() {
            info!(
                "Waiting for {} seconds before starting scheduled job",
                delay.as_secs()
            );
        }
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                info!("Random delay cancelled");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        let _guard = if self.config.allow_overlap() {
            None
        } else {
            match RunningGuard::acquire(&self.running) {
                Some(guard) => Some(guard),
                None => {
                    warn!("Previous run is still executing, skipping this trigger");
                    return;
                }
            }
        };

        info!("Running scheduled task");
        if let Err(err) = (self.task)(Arc::clone(&self.config)).await {
            error!("Failed to run scheduled task: {err}");
        }
    }
}

fn log_firing(done: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(err) = done {
        error!("Scheduled run aborted: {err}");
    }
}

/// Clears the running flag when the execution ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunningGuard(flag))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Uniform delay in `[0, bound)` whole seconds, rolled afresh on every call.
fn jitter(bound: u64) -> Duration {
    Duration::from_secs(rand::thread_rng().gen_range(0..bound.max(1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(
        counter: &Arc<AtomicUsize>,
    ) -> impl Fn(Arc<Config>) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static {
        let counter = Arc::clone(counter);
        move |_: Arc<Config>| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        }
    }

    fn driver(config: Config, task: TaskFn) -> Driver {
        Driver {
            schedule: CronSchedule::parse("* * * * * *").unwrap(),
            config: Arc::new(config),
            task,
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
        }
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..100 {
            assert!(jitter(3) < Duration::from_secs(3));
        }
        assert_eq!(jitter(1), Duration::ZERO);
        assert_eq!(jitter(0), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_immediate_runs_in_caller() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new(Config::immediate(), counting(&counter));

        scheduler.start().await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(scheduler.driver.is_none());
    }

    #[tokio::test]
    async fn test_immediate_returns_task_error() {
        let mut scheduler = Scheduler::new(Config::immediate(), |_| async {
            Err::<(), _>(Error::NotFound("/backups".to_string()))
        });
        let err = scheduler.start().await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_cron_fires_repeatedly() {
        let counter = Arc::new(AtomicUsize::new(0));
        let config = Config::new("* * * * * *").unwrap();
        let mut scheduler = Scheduler::new(config, counting(&counter));

        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(3500)).await;
        scheduler.stop().await.unwrap();

        assert!(counter.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let config = Config::new("@yearly").unwrap();
        let mut scheduler = Scheduler::new(config, |_| async { Ok(()) });

        scheduler.start().await.unwrap();
        assert!(matches!(scheduler.start().await, Err(Error::Config(_))));
        scheduler.stop().await.unwrap();
        assert!(scheduler.start().await.is_err());
    }

    #[tokio::test]
    async fn test_stop_ends_driver_promptly() {
        let config = Config::new("@yearly").unwrap();
        let mut scheduler = Scheduler::new(config, |_| async { Ok(()) });

        scheduler.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), scheduler.stop())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_waits_for_running_execution() {
        let finished = Arc::new(AtomicBool::new(false));
        let started = Arc::new(tokio::sync::Notify::new());
        let config = Config::new("* * * * * *").unwrap();
        let mut scheduler = Scheduler::new(config, {
            let finished = Arc::clone(&finished);
            let started = Arc::clone(&started);
            move |_: Arc<Config>| {
                let finished = Arc::clone(&finished);
                let started = Arc::clone(&started);
                async move {
                    started.notify_one();
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    finished.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }
        });

        scheduler.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(3), started.notified())
            .await
            .unwrap();
        scheduler.stop().await.unwrap();

        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_during_random_delay() {
        let counter = Arc::new(AtomicUsize::new(0));
        let driver = driver(Config::immediate(), Arc::new(counting(&counter)));

        driver.shutdown.cancel();
        tokio::time::timeout(
            Duration::from_secs(1),
            driver.execute_after(Duration::from_secs(60)),
        )
        .await
        .unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_skips_while_previous_run_executes() {
        let counter = Arc::new(AtomicUsize::new(0));
        let driver = driver(Config::immediate(), Arc::new(counting(&counter)));

        driver.running.store(true, Ordering::SeqCst);
        driver.execute_after(Duration::ZERO).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        driver.running.store(false, Ordering::SeqCst);
        driver.execute_after(Duration::ZERO).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!driver.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_overlap_allowed() {
        let counter = Arc::new(AtomicUsize::new(0));
        let config = Config::immediate().with_allow_overlap(true);
        let driver = driver(config, Arc::new(counting(&counter)));

        driver.running.store(true, Ordering::SeqCst);
        driver.execute_after(Duration::ZERO).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_execution_keeps_schedule() {
        let driver = driver(
            Config::immediate(),
            Arc::new(|_: Arc<Config>| {
                async { Err(Error::Config("boom".to_string())) }.boxed()
            }),
        );
        driver.execute_after(Duration::ZERO).await;
        assert!(!driver.running.load(Ordering::SeqCst));
    }
}
