//! Thread-driven cron scheduler.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, mpsc};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tracing::{debug, info, warn};

use super::scheduler::{JobScheduler, ScheduledJob, SchedulerError, SchedulerJobKey, Trigger, TriggerKey};

/// Invoked with the job key of every fired trigger.
pub type TriggerCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct ArmedTrigger {
    trigger: Trigger,
    schedule: Schedule,
    next: Option<DateTime<Utc>>,
}

impl ArmedTrigger {
    fn arm(&mut self, from: DateTime<Utc>) {
        self.next = self.schedule.after(&from).next();
    }
}

struct Entry {
    job: ScheduledJob,
    triggers: Vec<ArmedTrigger>,
}

impl Entry {
    fn detail(&self) -> ScheduledJob {
        ScheduledJob {
            key: self.job.key.clone(),
            job_key: self.job.job_key.clone(),
            triggers: self.triggers.iter().map(|t| t.trigger.clone()).collect(),
        }
    }
}

struct Inner {
    jobs: Mutex<BTreeMap<SchedulerJobKey, Entry>>,
    firing: AtomicBool,
    shut_down: AtomicBool,
    callback: TriggerCallback,
}

impl Inner {
    fn jobs(&self) -> Result<MutexGuard<'_, BTreeMap<SchedulerJobKey, Entry>>, SchedulerError> {
        self.jobs
            .lock()
            .map_err(|_| SchedulerError::Internal("job table lock poisoned".to_string()))
    }

    fn fire_due(&self, now: DateTime<Utc>) -> usize {
        if !self.firing.load(Ordering::SeqCst) {
            return 0;
        }

        let due: Vec<String> = match self.jobs() {
            Ok(mut jobs) => jobs
                .values_mut()
                .flat_map(|entry| {
                    let job_key = entry.job.job_key.clone();
                    entry.triggers.iter_mut().filter_map(move |t| match t.next {
                        Some(at) if at <= now => {
                            t.arm(now);
                            Some(job_key.clone())
                        }
                        _ => None,
                    })
                })
                .collect(),
            Err(err) => {
                warn!(error = %err, "cron scheduler unable to read job table");
                return 0;
            }
        };

        // Callbacks run without the table lock; they may call back into the scheduler.
        for job_key in &due {
            debug!(job_key = %job_key, "cron trigger fired");
            (self.callback)(job_key);
        }
        due.len()
    }
}

/// [`JobScheduler`] backed by the `cron` crate.
///
/// - One ticker thread, spawned by the first `start`
/// - `standby` stops firing; triggers missed while standing by are skipped
/// - Expressions use the `cron` crate syntax (seconds field first)
pub struct CronScheduler {
    inner: Arc<Inner>,
    tick: Duration,
    worker: Mutex<Option<(mpsc::Sender<()>, thread::JoinHandle<()>)>>,
}

impl CronScheduler {
    pub fn new(callback: TriggerCallback) -> Self {
        Self::with_tick(callback, Duration::from_millis(500))
    }

    pub fn with_tick(callback: TriggerCallback, tick: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: Mutex::new(BTreeMap::new()),
                firing: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                callback,
            }),
            tick,
            worker: Mutex::new(None),
        }
    }

    pub fn is_firing(&self) -> bool {
        self.inner.firing.load(Ordering::SeqCst)
    }

    /// Fire every trigger due at `now`. Returns how many fired.
    pub fn fire_due(&self, now: DateTime<Utc>) -> usize {
        self.inner.fire_due(now)
    }

    /// Next fire time of a trigger, while it is armed.
    pub fn next_fire_time(&self, key: &TriggerKey) -> Option<DateTime<Utc>> {
        let jobs = self.inner.jobs().ok()?;
        jobs.values()
            .flat_map(|entry| entry.triggers.iter())
            .find(|t| &t.trigger.key == key)
            .and_then(|t| t.next)
    }

    fn ensure_open(&self) -> Result<(), SchedulerError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShutDown);
        }
        Ok(())
    }

    fn spawn_ticker(&self) -> Result<(), SchedulerError> {
        let mut worker = self
            .worker
            .lock()
            .map_err(|_| SchedulerError::Internal("worker lock poisoned".to_string()))?;
        if worker.is_some() {
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let inner = self.inner.clone();
        let tick = self.tick;

        let join = thread::Builder::new()
            .name("cron-scheduler".to_string())
            .spawn(move || {
                loop {
                    match shutdown_rx.recv_timeout(tick) {
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            inner.fire_due(Utc::now());
                        }
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("cron scheduler ticker stopped");
            })
            .map_err(|e| SchedulerError::Internal(format!("unable to spawn ticker thread: {e}")))?;

        *worker = Some((shutdown_tx, join));
        Ok(())
    }
}

impl JobScheduler for CronScheduler {
    fn schedule_job(&self, job: ScheduledJob) -> Result<(), SchedulerError> {
        self.ensure_open()?;

        let now = Utc::now();
        let firing = self.is_firing();
        let mut triggers = Vec::with_capacity(job.triggers.len());

        for trigger in &job.triggers {
            let schedule = Schedule::from_str(&trigger.cron).map_err(|e| SchedulerError::InvalidSchedule {
                expression: trigger.cron.clone(),
                reason: e.to_string(),
            })?;

            let mut armed = ArmedTrigger {
                trigger: trigger.clone(),
                schedule,
                next: None,
            };
            if firing {
                armed.arm(now);
            }
            triggers.push(armed);
        }

        self.inner.jobs()?.insert(job.key.clone(), Entry { job, triggers });
        Ok(())
    }

    fn delete_job(&self, key: &SchedulerJobKey) -> Result<bool, SchedulerError> {
        Ok(self.inner.jobs()?.remove(key).is_some())
    }

    fn unschedule_triggers(&self, keys: &[TriggerKey]) -> Result<(), SchedulerError> {
        let mut jobs = self.inner.jobs()?;
        for entry in jobs.values_mut() {
            entry.triggers.retain(|t| !keys.contains(&t.trigger.key));
        }
        Ok(())
    }

    fn job_keys(&self) -> Result<Vec<SchedulerJobKey>, SchedulerError> {
        Ok(self.inner.jobs()?.keys().cloned().collect())
    }

    fn job_detail(&self, key: &SchedulerJobKey) -> Result<Option<ScheduledJob>, SchedulerError> {
        Ok(self.inner.jobs()?.get(key).map(Entry::detail))
    }

    fn triggers_of_job(&self, key: &SchedulerJobKey) -> Result<Vec<Trigger>, SchedulerError> {
        Ok(self
            .inner
            .jobs()?
            .get(key)
            .map(|entry| entry.triggers.iter().map(|t| t.trigger.clone()).collect())
            .unwrap_or_default())
    }

    fn start(&self) -> Result<(), SchedulerError> {
        self.ensure_open()?;

        let now = Utc::now();
        for entry in self.inner.jobs()?.values_mut() {
            for trigger in &mut entry.triggers {
                trigger.arm(now);
            }
        }

        self.inner.firing.store(true, Ordering::SeqCst);
        self.spawn_ticker()?;
        info!("cron scheduler started");
        Ok(())
    }

    fn standby(&self) -> Result<(), SchedulerError> {
        self.ensure_open()?;
        self.inner.firing.store(false, Ordering::SeqCst);
        info!("cron scheduler in standby");
        Ok(())
    }

    fn shutdown(&self) -> Result<(), SchedulerError> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.firing.store(false, Ordering::SeqCst);

        let worker = self
            .worker
            .lock()
            .map_err(|_| SchedulerError::Internal("worker lock poisoned".to_string()))?
            .take();
        if let Some((shutdown, join)) = worker {
            let _ = shutdown.send(());
            // A trigger callback may drop the last owner on the ticker thread.
            if join.thread().id() != thread::current().id() && join.join().is_err() {
                warn!("cron scheduler ticker panicked");
            }
        }

        info!("cron scheduler shut down");
        Ok(())
    }
}

impl Drop for CronScheduler {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "cron scheduler shutdown on drop failed");
        }
    }
}

impl core::fmt::Debug for CronScheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CronScheduler")
            .field("tick", &self.tick)
            .field("firing", &self.is_firing())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn recording() -> (TriggerCallback, Arc<Mutex<Vec<String>>>) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        let callback: TriggerCallback = Arc::new(move |key: &str| sink.lock().unwrap().push(key.to_string()));
        (callback, fired)
    }

    #[test]
    fn rejects_invalid_expressions() {
        let (callback, _) = recording();
        let scheduler = CronScheduler::new(callback);

        let err = scheduler
            .schedule_job(ScheduledJob::cron("refresh", "not a cron"))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule { .. }));
        assert!(scheduler.job_keys().unwrap().is_empty());
    }

    #[test]
    fn fires_due_triggers_only_while_started() {
        let (callback, fired) = recording();
        let scheduler = CronScheduler::with_tick(callback, Duration::from_secs(3600));
        scheduler.schedule_job(ScheduledJob::cron("every_second", "* * * * * *")).unwrap();
        scheduler.schedule_job(ScheduledJob::cron("yearly", "0 0 0 1 1 *")).unwrap();

        let later = Utc::now() + ChronoDuration::seconds(5);
        assert_eq!(scheduler.fire_due(later), 0);

        scheduler.start().unwrap();
        assert!(scheduler.next_fire_time(&TriggerKey::for_job("every_second")).is_some());
        assert_eq!(scheduler.fire_due(later), 1);
        assert_eq!(*fired.lock().unwrap(), vec!["every_second".to_string()]);

        scheduler.standby().unwrap();
        assert_eq!(scheduler.fire_due(later + ChronoDuration::seconds(5)), 0);

        scheduler.shutdown().unwrap();
    }

    #[test]
    fn unscheduled_triggers_stop_firing_but_job_remains() {
        let (callback, fired) = recording();
        let scheduler = CronScheduler::with_tick(callback, Duration::from_secs(3600));
        scheduler.schedule_job(ScheduledJob::cron("refresh", "* * * * * *")).unwrap();
        scheduler.start().unwrap();

        scheduler.unschedule_triggers(&[TriggerKey::for_job("refresh")]).unwrap();
        assert_eq!(scheduler.fire_due(Utc::now() + ChronoDuration::seconds(5)), 0);
        assert!(fired.lock().unwrap().is_empty());

        let key = SchedulerJobKey::for_job("refresh");
        assert!(scheduler.triggers_of_job(&key).unwrap().is_empty());
        assert!(scheduler.delete_job(&key).unwrap());
        assert!(!scheduler.delete_job(&key).unwrap());
    }

    #[test]
    fn shutdown_is_final_and_idempotent() {
        let (callback, _) = recording();
        let scheduler = CronScheduler::with_tick(callback, Duration::from_millis(10));
        scheduler.start().unwrap();

        scheduler.shutdown().unwrap();
        scheduler.shutdown().unwrap();
        assert_eq!(scheduler.start(), Err(SchedulerError::ShutDown));
        assert!(!scheduler.is_firing());
    }
}
