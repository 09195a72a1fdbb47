//! The cron engine: entry table, tick loop, and invocation wrapping.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use conveyor_telemetry::with_correlation_id;

/// Granularity of the shared tick loop.
const TICK_INTERVAL: Duration = Duration::from_millis(250);

type CronJob = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Cron scheduler configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct CronConfig {
    /// When `true`, expressions carry a leading seconds field (6 fields);
    /// otherwise the classic 5-field format applies.
    pub with_seconds: bool,
}

/// Errors raised by cron scheduler operations.
#[derive(Debug, thiserror::Error)]
pub enum CronError {
    /// An entry already exists under the name.
    #[error("cron task name already registered")]
    DuplicateName {
        /// Name that was registered twice.
        name: String,
    },
    /// No entry exists under the name.
    #[error("cron task not found")]
    NotFound {
        /// Name that had no entry.
        name: String,
    },
    /// The cron expression did not parse.
    #[error("invalid cron expression")]
    InvalidSpec {
        /// Offending expression.
        spec: String,
        /// Parser failure detail.
        #[source]
        source: cron::error::Error,
    },
    /// The cron expression had the wrong number of fields for the
    /// configured format.
    #[error("cron expression has the wrong number of fields")]
    FieldCount {
        /// Offending expression.
        spec: String,
        /// Field count the configured format requires.
        expected: usize,
        /// Field count the expression carried.
        found: usize,
    },
}

/// Snapshot of one cron entry.
#[derive(Debug, Clone)]
pub struct CronTaskSnapshot {
    /// Unique entry name.
    pub name: String,
    /// Cron expression as supplied by the caller.
    pub spec: String,
    /// Whether the entry currently fires.
    pub enabled: bool,
    /// Next scheduled fire time, when enabled.
    pub next_fire: Option<DateTime<Utc>>,
    /// Most recent fire time, if the entry has fired.
    pub prev_fire: Option<DateTime<Utc>>,
}

struct CronEntry {
    spec: String,
    schedule: Schedule,
    enabled: bool,
    job: CronJob,
    next_fire: Option<DateTime<Utc>>,
    prev_fire: Option<DateTime<Utc>>,
}

/// Named cron scheduler with dynamic entry management.
pub struct CronScheduler {
    config: CronConfig,
    entries: Arc<Mutex<HashMap<String, CronEntry>>>,
    running_jobs: Arc<AtomicU64>,
    lifecycle: Mutex<Lifecycle>,
}

#[derive(Default)]
struct Lifecycle {
    shutdown: Option<watch::Sender<bool>>,
    ticker: Option<JoinHandle<()>>,
}

impl CronScheduler {
    /// Create a scheduler with the given parser configuration.
    #[must_use]
    pub fn new(config: CronConfig) -> Self {
        Self {
            config,
            entries: Arc::new(Mutex::new(HashMap::new())),
            running_jobs: Arc::new(AtomicU64::new(0)),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    /// Register a named entry; fails when the name is taken.
    ///
    /// # Errors
    ///
    /// Returns [`CronError::DuplicateName`] or [`CronError::InvalidSpec`].
    pub fn add_task<F, Fut>(
        &self,
        name: impl Into<String>,
        spec: impl Into<String>,
        job: F,
    ) -> Result<(), CronError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let spec = spec.into();
        let schedule = self.parse_spec(&spec)?;

        let boxed: CronJob =
            Arc::new(move || -> Pin<Box<dyn Future<Output = ()> + Send>> { Box::pin(job()) });

        let mut entries = lock_entries(&self.entries);
        if entries.contains_key(&name) {
            return Err(CronError::DuplicateName { name });
        }
        let next_fire = schedule.upcoming(Utc).next();
        entries.insert(
            name.clone(),
            CronEntry {
                spec,
                schedule,
                enabled: true,
                job: boxed,
                next_fire,
                prev_fire: None,
            },
        );
        debug!(task = %name, "cron task registered");
        Ok(())
    }

    /// Drop an entry.
    ///
    /// # Errors
    ///
    /// Returns [`CronError::NotFound`] when no entry exists.
    pub fn remove_task(&self, name: &str) -> Result<(), CronError> {
        let mut entries = lock_entries(&self.entries);
        entries
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CronError::NotFound {
                name: name.to_string(),
            })
    }

    /// Re-attach a disabled entry to the schedule.
    ///
    /// # Errors
    ///
    /// Returns [`CronError::NotFound`] when no entry exists.
    pub fn enable_task(&self, name: &str) -> Result<(), CronError> {
        self.with_entry(name, |entry| {
            entry.enabled = true;
            entry.next_fire = entry.schedule.upcoming(Utc).next();
        })
    }

    /// Detach an entry from the schedule without forgetting it.
    ///
    /// No fires occur after this returns until the entry is enabled again;
    /// an invocation already running is allowed to finish.
    ///
    /// # Errors
    ///
    /// Returns [`CronError::NotFound`] when no entry exists.
    pub fn disable_task(&self, name: &str) -> Result<(), CronError> {
        self.with_entry(name, |entry| {
            entry.enabled = false;
            entry.next_fire = None;
        })
    }

    /// Replace an entry's schedule, preserving its enabled state.
    ///
    /// # Errors
    ///
    /// Returns [`CronError::NotFound`] or [`CronError::InvalidSpec`].
    pub fn update_spec(&self, name: &str, spec: impl Into<String>) -> Result<(), CronError> {
        let spec = spec.into();
        let schedule = self.parse_spec(&spec)?;
        self.with_entry(name, move |entry| {
            entry.next_fire = if entry.enabled {
                schedule.upcoming(Utc).next()
            } else {
                None
            };
            entry.spec = spec;
            entry.schedule = schedule;
        })
    }

    /// Invoke an entry once, out of band, without touching its schedule.
    ///
    /// # Errors
    ///
    /// Returns [`CronError::NotFound`] when no entry exists.
    pub fn run_now(&self, name: &str) -> Result<(), CronError> {
        let job = {
            let entries = lock_entries(&self.entries);
            let entry = entries.get(name).ok_or_else(|| CronError::NotFound {
                name: name.to_string(),
            })?;
            Arc::clone(&entry.job)
        };
        spawn_invocation(name, &job, &self.running_jobs);
        Ok(())
    }

    /// Start the tick loop; idempotent.
    pub fn start(&self) {
        let mut lifecycle = lock_lifecycle(&self.lifecycle);
        if lifecycle.shutdown.is_some() {
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let entries = Arc::clone(&self.entries);
        let running = Arc::clone(&self.running_jobs);

        lifecycle.ticker = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    () = tokio::time::sleep(TICK_INTERVAL) => {}
                }
                fire_due_entries(&entries, &running);
            }
        }));
        lifecycle.shutdown = Some(shutdown_tx);
        info!("cron scheduler started");
    }

    /// Stop the tick loop and wait for in-flight invocations; idempotent.
    pub async fn stop(&self) {
        let (shutdown, ticker) = {
            let mut lifecycle = lock_lifecycle(&self.lifecycle);
            (lifecycle.shutdown.take(), lifecycle.ticker.take())
        };
        let Some(shutdown) = shutdown else {
            return;
        };
        let _ = shutdown.send(true);
        if let Some(ticker) = ticker {
            if let Err(err) = ticker.await
                && err.is_panic()
            {
                error!("cron tick loop panicked");
            }
        }
        while self.running_jobs.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        info!("cron scheduler stopped");
    }

    /// Snapshot all entries, sorted by name.
    #[must_use]
    pub fn tasks(&self) -> Vec<CronTaskSnapshot> {
        let entries = lock_entries(&self.entries);
        let mut snapshots: Vec<CronTaskSnapshot> = entries
            .iter()
            .map(|(name, entry)| snapshot(name, entry))
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Snapshot one entry by name.
    #[must_use]
    pub fn task(&self, name: &str) -> Option<CronTaskSnapshot> {
        let entries = lock_entries(&self.entries);
        entries.get(name).map(|entry| snapshot(name, entry))
    }

    fn parse_spec(&self, spec: &str) -> Result<Schedule, CronError> {
        let expected = if self.config.with_seconds { 6 } else { 5 };
        let found = spec.split_whitespace().count();
        if found != expected {
            return Err(CronError::FieldCount {
                spec: spec.to_string(),
                expected,
                found,
            });
        }
        // The parser always wants a seconds field; the classic 5-field
        // format gains a literal zero.
        let normalized = if self.config.with_seconds {
            spec.to_string()
        } else {
            format!("0 {spec}")
        };
        Schedule::from_str(&normalized).map_err(|source| CronError::InvalidSpec {
            spec: spec.to_string(),
            source,
        })
    }

    fn with_entry(
        &self,
        name: &str,
        mutate: impl FnOnce(&mut CronEntry),
    ) -> Result<(), CronError> {
        let mut entries = lock_entries(&self.entries);
        let entry = entries.get_mut(name).ok_or_else(|| CronError::NotFound {
            name: name.to_string(),
        })?;
        mutate(entry);
        Ok(())
    }
}

fn snapshot(name: &str, entry: &CronEntry) -> CronTaskSnapshot {
    CronTaskSnapshot {
        name: name.to_string(),
        spec: entry.spec.clone(),
        enabled: entry.enabled,
        next_fire: entry.next_fire,
        prev_fire: entry.prev_fire,
    }
}

/// Fire every enabled entry whose next fire time has passed.
///
/// Jobs are spawned while the entry table is locked, so `disable_task`
/// observes a consistent boundary: once it returns, no further fires of that
/// entry can start.
fn fire_due_entries(entries: &Arc<Mutex<HashMap<String, CronEntry>>>, running: &Arc<AtomicU64>) {
    let now = Utc::now();
    let mut table = lock_entries(entries);
    for (name, entry) in table.iter_mut() {
        if !entry.enabled {
            continue;
        }
        let Some(due) = entry.next_fire else {
            continue;
        };
        if due > now {
            continue;
        }
        entry.prev_fire = Some(now);
        entry.next_fire = entry.schedule.upcoming(Utc).next();
        spawn_invocation(name, &entry.job, running);
    }
}

/// Run one invocation on its own task: fresh correlation id, dedicated span,
/// and panic containment through a watched inner task.
fn spawn_invocation(name: &str, job: &CronJob, running: &Arc<AtomicU64>) {
    let correlation_id = Uuid::new_v4();
    let span = info_span!("cron_fire", task = %name, correlation_id = %correlation_id);
    let fut = with_correlation_id(correlation_id, job()).instrument(span);

    running.fetch_add(1, Ordering::SeqCst);
    let running = Arc::clone(running);
    let task_name = name.to_string();
    tokio::spawn(async move {
        let result = tokio::spawn(fut).await;
        if let Err(err) = result
            && err.is_panic()
        {
            warn!(
                task = %task_name,
                correlation_id = %correlation_id,
                "cron invocation panicked"
            );
        }
        running.fetch_sub(1, Ordering::SeqCst);
    });
}

fn lock_entries(
    entries: &Arc<Mutex<HashMap<String, CronEntry>>>,
) -> MutexGuard<'_, HashMap<String, CronEntry>> {
    match entries.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!("cron entry table poisoned; continuing with recovered guard");
            poisoned.into_inner()
        }
    }
}

fn lock_lifecycle(lifecycle: &Mutex<Lifecycle>) -> MutexGuard<'_, Lifecycle> {
    match lifecycle.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!("cron lifecycle state poisoned; continuing with recovered guard");
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counter_job(
        counter: &Arc<AtomicU32>,
    ) -> impl Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static {
        let counter = Arc::clone(counter);
        move || -> Pin<Box<dyn Future<Output = ()> + Send>> {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let scheduler = CronScheduler::new(CronConfig::default());
        let counter = Arc::new(AtomicU32::new(0));
        scheduler
            .add_task("sync", "*/5 * * * *", counter_job(&counter))
            .unwrap();
        let second = scheduler.add_task("sync", "*/1 * * * *", counter_job(&counter));
        assert!(matches!(second, Err(CronError::DuplicateName { .. })));

        // The original registration survives untouched.
        let snapshot = scheduler.task("sync").unwrap();
        assert_eq!(snapshot.spec, "*/5 * * * *");
        assert!(snapshot.enabled);
    }

    #[tokio::test]
    async fn five_and_six_field_specs_parse_by_config() {
        let classic = CronScheduler::new(CronConfig::default());
        let counter = Arc::new(AtomicU32::new(0));
        classic
            .add_task("five", "*/5 * * * *", counter_job(&counter))
            .unwrap();
        assert!(
            matches!(
                classic.add_task("six", "*/2 * * * * *", counter_job(&counter)),
                Err(CronError::FieldCount {
                    expected: 5,
                    found: 6,
                    ..
                })
            ),
            "six fields must not parse in five-field mode"
        );

        let seconds = CronScheduler::new(CronConfig { with_seconds: true });
        seconds
            .add_task("six", "*/2 * * * * *", counter_job(&counter))
            .unwrap();
    }

    #[tokio::test]
    async fn every_second_entry_fires() {
        let scheduler = CronScheduler::new(CronConfig { with_seconds: true });
        let counter = Arc::new(AtomicU32::new(0));
        scheduler
            .add_task("tick", "* * * * * *", counter_job(&counter))
            .unwrap();
        scheduler.start();
        scheduler.start();

        tokio::time::timeout(Duration::from_secs(5), async {
            while counter.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("entry never fired");

        let snapshot = scheduler.task("tick").unwrap();
        assert!(snapshot.prev_fire.is_some());
        scheduler.stop().await;
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn disabled_entries_do_not_fire() {
        let scheduler = CronScheduler::new(CronConfig { with_seconds: true });
        let counter = Arc::new(AtomicU32::new(0));
        scheduler
            .add_task("quiet", "* * * * * *", counter_job(&counter))
            .unwrap();
        scheduler.disable_task("quiet").unwrap();
        scheduler.start();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        // Re-enabling re-attaches the entry to the schedule.
        scheduler.enable_task("quiet").unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while counter.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("re-enabled entry never fired");
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn run_now_fires_out_of_band() {
        let scheduler = CronScheduler::new(CronConfig::default());
        let counter = Arc::new(AtomicU32::new(0));
        // A schedule that will not fire during the test.
        scheduler
            .add_task("manual", "0 0 1 1 *", counter_job(&counter))
            .unwrap();

        scheduler.run_now("manual").unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while counter.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("manual invocation never ran");

        assert!(matches!(
            scheduler.run_now("missing"),
            Err(CronError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn update_spec_preserves_enabled_state() {
        let scheduler = CronScheduler::new(CronConfig::default());
        let counter = Arc::new(AtomicU32::new(0));
        scheduler
            .add_task("reshaped", "*/5 * * * *", counter_job(&counter))
            .unwrap();
        scheduler.disable_task("reshaped").unwrap();
        scheduler.update_spec("reshaped", "*/10 * * * *").unwrap();

        let snapshot = scheduler.task("reshaped").unwrap();
        assert_eq!(snapshot.spec, "*/10 * * * *");
        assert!(!snapshot.enabled);
        assert!(snapshot.next_fire.is_none());

        scheduler.enable_task("reshaped").unwrap();
        let snapshot = scheduler.task("reshaped").unwrap();
        assert!(snapshot.next_fire.is_some());
    }

    #[tokio::test]
    async fn panicking_job_does_not_kill_the_engine() {
        let scheduler = CronScheduler::new(CronConfig { with_seconds: true });
        scheduler
            .add_task("explosive", "* * * * * *", || async {
                panic!("scripted cron panic");
            })
            .unwrap();
        let counter = Arc::new(AtomicU32::new(0));
        scheduler
            .add_task("survivor", "* * * * * *", counter_job(&counter))
            .unwrap();
        scheduler.start();

        tokio::time::timeout(Duration::from_secs(5), async {
            while counter.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("survivor stopped firing alongside a panicking job");
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn stop_waits_for_running_invocations() {
        let scheduler = CronScheduler::new(CronConfig::default());
        let counter = Arc::new(AtomicU32::new(0));
        let finish_counter = Arc::clone(&counter);
        scheduler
            .add_task("slow", "0 0 1 1 *", move || {
                let counter = Arc::clone(&finish_counter);
                async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();
        scheduler.start();
        scheduler.run_now("slow").unwrap();
        // Give the spawned invocation a moment to begin.
        tokio::time::sleep(Duration::from_millis(50)).await;

        scheduler.stop().await;
        assert_eq!(
            counter.load(Ordering::SeqCst),
            1,
            "stop must wait for the in-flight invocation"
        );
    }

    #[tokio::test]
    async fn remove_task_forgets_the_entry() {
        let scheduler = CronScheduler::new(CronConfig::default());
        let counter = Arc::new(AtomicU32::new(0));
        scheduler
            .add_task("gone", "*/5 * * * *", counter_job(&counter))
            .unwrap();
        scheduler.remove_task("gone").unwrap();
        assert!(scheduler.task("gone").is_none());
        assert!(matches!(
            scheduler.remove_task("gone"),
            Err(CronError::NotFound { .. })
        ));
        assert!(scheduler.tasks().is_empty());
    }
}
