//! Job lifecycle manager.
//!
//! Orchestrates queuing (constraints → persist → dispatch), execution (load →
//! ownership check → run → classify → persist → maybe requeue), administrative
//! operations and the manager's own lifecycle.

use std::collections::{BTreeSet, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak, mpsc};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use jobforge_auth::{Permission, Principal, authorize};
use jobforge_core::{JobId, JobState};
use jobforge_events::EventSink;

use crate::config::JobsConfig;
use crate::workers::{ModeListener, WorkerHandle};

use super::config::JobConfig;
use super::cron_scheduler::TriggerCallback;
use super::dispatcher::JobDispatcher;
use super::error::{JobError, JobExecutionError};
use super::logging::LoggingContext;
use super::message::JobMessage;
use super::mode::{Mode, ModeChange};
use super::receiver::{JobMessageHandler, JobMessageReceiver};
use super::registry::{JobExecutionContext, JobRegistry};
use super::scheduler::{self, JobScheduler};
use super::status::JobStatus;
use super::store::{JobCurator, QueryArgs};

/// Principal recorded on jobs queued by cron triggers.
pub const SCHEDULER_PRINCIPAL: &str = "scheduler";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagerState {
    Created,
    Initialized,
    Running,
    Suspended,
    Shutdown,
}

impl core::fmt::Display for ManagerState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            ManagerState::Created => "CREATED",
            ManagerState::Initialized => "INITIALIZED",
            ManagerState::Running => "RUNNING",
            ManagerState::Suspended => "SUSPENDED",
            ManagerState::Shutdown => "SHUTDOWN",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: ManagerState,
    mode: Mode,
}

type SchedulerFactory = Box<dyn FnOnce(TriggerCallback) -> Arc<dyn JobScheduler> + Send>;

/// Wires a [`JobManager`] together.
pub struct JobManagerBuilder {
    config: JobsConfig,
    registry: Arc<JobRegistry>,
    curator: Arc<dyn JobCurator>,
    dispatcher: Arc<dyn JobDispatcher>,
    events: Arc<dyn EventSink>,
    scheduler: Option<SchedulerFactory>,
    receiver: Option<JobMessageReceiver>,
}

impl JobManagerBuilder {
    /// Attach a scheduler. `make` receives the callback its triggers must fire.
    pub fn with_scheduler<F>(mut self, make: F) -> Self
    where
        F: FnOnce(TriggerCallback) -> Arc<dyn JobScheduler> + Send + 'static,
    {
        self.scheduler = Some(Box::new(make));
        self
    }

    pub fn with_receiver(mut self, receiver: JobMessageReceiver) -> Self {
        self.receiver = Some(receiver);
        self
    }

    pub fn build(self) -> Arc<JobManager> {
        Arc::new_cyclic(|weak: &Weak<JobManager>| {
            let scheduler = self.scheduler.map(|make| make(trigger_callback(weak.clone())));

            JobManager {
                config: self.config,
                registry: self.registry,
                curator: self.curator,
                dispatcher: self.dispatcher,
                events: self.events,
                scheduler,
                receiver: self.receiver,
                lifecycle: Mutex::new(Lifecycle {
                    state: ManagerState::Created,
                    mode: Mode::Normal,
                }),
                control: Mutex::new(None),
                self_ref: weak.clone(),
            }
        })
    }
}

fn trigger_callback(manager: Weak<JobManager>) -> TriggerCallback {
    Arc::new(move |job_key: &str| {
        let Some(manager) = manager.upgrade() else {
            return;
        };
        if let Err(err) = manager.schedule_job(job_key) {
            error!(job_key = %job_key, error = %err, "unable to queue scheduled job");
        }
    })
}

/// Entry point of the job system on one node.
pub struct JobManager {
    config: JobsConfig,
    registry: Arc<JobRegistry>,
    curator: Arc<dyn JobCurator>,
    dispatcher: Arc<dyn JobDispatcher>,
    events: Arc<dyn EventSink>,
    scheduler: Option<Arc<dyn JobScheduler>>,
    receiver: Option<JobMessageReceiver>,
    lifecycle: Mutex<Lifecycle>,
    control: Mutex<Option<WorkerHandle>>,
    self_ref: Weak<JobManager>,
}

impl JobManager {
    pub fn builder(
        config: JobsConfig,
        registry: Arc<JobRegistry>,
        curator: Arc<dyn JobCurator>,
        dispatcher: Arc<dyn JobDispatcher>,
        events: Arc<dyn EventSink>,
    ) -> JobManagerBuilder {
        JobManagerBuilder {
            config,
            registry,
            curator,
            dispatcher,
            events,
            scheduler: None,
            receiver: None,
        }
    }

    pub fn state(&self) -> ManagerState {
        self.lifecycle().state
    }

    pub fn mode(&self) -> Mode {
        self.lifecycle().mode
    }

    pub fn node_name(&self) -> &str {
        &self.config.node_name
    }

    pub fn is_scheduler_enabled(&self) -> bool {
        self.config.scheduler_enabled && self.scheduler.is_some()
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn receiver(&self) -> Option<&JobMessageReceiver> {
        self.receiver.as_ref()
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Lifecycle

    /// Schedule cron triggers, drop dead ones and recover jobs this node
    /// abandoned in a previous run.
    pub fn initialize(&self) -> Result<(), JobError> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state != ManagerState::Created {
            return Err(JobError::illegal_state(format!(
                "job manager cannot be initialized from state {}",
                lifecycle.state
            )));
        }

        if let Some(scheduler) = self.enabled_scheduler() {
            let scheduled = scheduler::schedule_registered_jobs(scheduler.as_ref(), &self.registry, |key| {
                self.config.schedule_for(key).map(str::to_string)
            });
            let removed = scheduler::reconcile_dead_triggers(scheduler.as_ref(), &self.registry);
            info!(scheduled, removed, "job scheduler configured");
        } else {
            info!("job scheduler disabled on this node");
        }

        let recovered = self.recover_abandoned_jobs()?;
        if recovered > 0 {
            info!(node = %self.config.node_name, recovered, "recovered abandoned jobs");
        }

        lifecycle.state = ManagerState::Initialized;
        info!(node = %self.config.node_name, "job manager initialized");
        Ok(())
    }

    pub fn start(&self) -> Result<(), JobError> {
        let mut lifecycle = self.lifecycle();
        self.ensure_started(&lifecycle, "start")?;

        if lifecycle.mode == Mode::Suspend {
            info!("operational mode is SUSPEND; starting suspended");
            self.pause_components();
            lifecycle.state = ManagerState::Suspended;
            return Ok(());
        }

        self.resume_components()?;
        lifecycle.state = ManagerState::Running;
        info!(node = %self.config.node_name, "job manager started");
        Ok(())
    }

    pub fn suspend(&self) -> Result<(), JobError> {
        let mut lifecycle = self.lifecycle();
        self.ensure_started(&lifecycle, "suspend")?;

        self.pause_components();
        lifecycle.state = ManagerState::Suspended;
        info!(node = %self.config.node_name, "job manager suspended");
        Ok(())
    }

    pub fn resume(&self) -> Result<(), JobError> {
        let mut lifecycle = self.lifecycle();
        self.ensure_started(&lifecycle, "resume")?;

        self.resume_components()?;
        lifecycle.state = ManagerState::Running;
        info!(node = %self.config.node_name, "job manager resumed");
        Ok(())
    }

    /// Stop the scheduler, the receiver and the mode control loop.
    pub fn shutdown(&self) -> Result<(), JobError> {
        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state == ManagerState::Shutdown {
                return Err(JobError::illegal_state("job manager is already shut down"));
            }
            lifecycle.state = ManagerState::Shutdown;
        }

        let control = self
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(control) = control {
            control.shutdown();
        }

        if let Some(scheduler) = &self.scheduler {
            if let Err(err) = scheduler.shutdown() {
                warn!(error = %err, "job scheduler shutdown failed");
            }
        }
        if let Some(receiver) = &self.receiver {
            receiver.shutdown();
        }

        info!(node = %self.config.node_name, "job manager shut down");
        Ok(())
    }

    /// React to an operational mode change.
    ///
    /// Before initialization the mode is only recorded; `start` honours it.
    pub fn handle_mode_change(&self, previous: Mode, current: Mode) -> Result<(), JobError> {
        let state = {
            let mut lifecycle = self.lifecycle();
            lifecycle.mode = current;
            lifecycle.state
        };
        info!(?previous, ?current, state = %state, "operational mode changed");

        match state {
            ManagerState::Created | ManagerState::Shutdown => Ok(()),
            _ => match current {
                Mode::Suspend => self.suspend(),
                Mode::Normal => self.resume(),
            },
        }
    }

    /// Listen for mode changes on `changes` until shutdown.
    pub fn attach_mode_channel(&self, changes: mpsc::Receiver<ModeChange>) -> Result<(), JobError> {
        let mut control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        if control.is_some() {
            return Err(JobError::illegal_state("a mode channel is already attached"));
        }

        let manager = self.self_ref.clone();
        let handle = ModeListener::spawn("job-mode-listener", changes, move |change| {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            if let Err(err) = manager.handle_mode_change(change.previous, change.current) {
                warn!(error = %err, "unable to apply operational mode change");
            }
        })
        .map_err(|e| JobError::Configuration(format!("unable to spawn mode listener: {e}")))?;

        *control = Some(handle);
        Ok(())
    }

    fn ensure_started(&self, lifecycle: &Lifecycle, operation: &str) -> Result<(), JobError> {
        match lifecycle.state {
            ManagerState::Created | ManagerState::Shutdown => Err(JobError::illegal_state(format!(
                "job manager cannot {operation} from state {}",
                lifecycle.state
            ))),
            _ => Ok(()),
        }
    }

    fn enabled_scheduler(&self) -> Option<&Arc<dyn JobScheduler>> {
        self.scheduler.as_ref().filter(|_| self.config.scheduler_enabled)
    }

    fn resume_components(&self) -> Result<(), JobError> {
        if let Some(scheduler) = self.enabled_scheduler() {
            if let Err(err) = scheduler.start() {
                error!(error = %err, "unable to start job scheduler");
            }
        }

        if let Some(receiver) = &self.receiver {
            let handler: Weak<dyn JobMessageHandler> = self.self_ref.clone();
            receiver.start(handler, self.dispatcher.clone())?;
        }
        Ok(())
    }

    fn pause_components(&self) {
        if let Some(scheduler) = self.enabled_scheduler() {
            if let Err(err) = scheduler.standby() {
                warn!(error = %err, "unable to put job scheduler in standby");
            }
        }
        if let Some(receiver) = &self.receiver {
            receiver.suspend();
        }
    }

    fn recover_abandoned_jobs(&self) -> Result<usize, JobError> {
        let args = QueryArgs::new()
            .with_states([JobState::Running])
            .with_executors([self.config.node_name.clone()]);

        let mut recovered = 0;
        for job in self.curator.find_jobs(Some(&args))? {
            let job_id = job.id();
            if !job.has_attempts_left() {
                let failed = self.exhaust(job)?;
                warn!(job_id = %job_id, job_key = %failed.job_key(), attempts = failed.attempts(), "abandoned job has no attempts left");
                continue;
            }

            let queued = self.update_state(job, JobState::Queued)?;

            if let Err(err) = self.dispatcher.post_message(&queued.message()) {
                error!(job_id = %job_id, error = %err, "unable to dispatch recovered job");
                continue;
            }
            warn!(job_id = %job_id, job_key = %queued.job_key(), "requeued job abandoned by a previous run");
            recovered += 1;
        }
        Ok(recovered)
    }

    // Queuing

    /// Queue a job, unless one of its constraints is violated.
    ///
    /// A blocked job is persisted as ABORTED and returned without being
    /// dispatched. A job whose message cannot be published is persisted as
    /// FAILED and returned.
    pub fn queue_job(&self, config: JobConfig) -> Result<JobStatus, JobError> {
        config.validate()?;
        let mut status = config.to_status(&self.config.node_name);

        if !config.constraints().is_empty() {
            let active = self.curator.get_non_terminal_jobs()?;
            let blocking: BTreeSet<JobId> = config
                .constraints()
                .iter()
                .flat_map(|constraint| constraint.test(&status, &active))
                .collect();

            if !blocking.is_empty() {
                let ids: Vec<String> = blocking.iter().map(JobId::to_string).collect();
                status
                    .transition_to(JobState::Aborted)
                    .map_err(|e| JobError::illegal_state(e.to_string()))?;
                status.set_result(Some(format!(
                    "Job blocked by the following existing jobs: {}",
                    ids.join(", ")
                )));

                let status = self.curator.create(&status)?;
                info!(job_id = %status.id(), job_key = %status.job_key(), blocking = %ids.join(", "), "job blocked by constraints");
                return Ok(status);
            }
        }

        let created = self.curator.create(&status)?;

        if let Err(err) = self.dispatcher.post_message(&created.message()) {
            error!(job_id = %created.id(), job_key = %created.job_key(), error = %err, "unable to dispatch job message");
            let mut failed = created;
            failed.set_result(Some(format!("Unable to dispatch job message: {err}")));
            return self.update_state(failed, JobState::Failed);
        }

        let mut queued = created;
        queued
            .transition_to(JobState::Queued)
            .map_err(|e| JobError::illegal_state(e.to_string()))?;

        match self.curator.merge(&queued) {
            Ok(persisted) => {
                info!(job_id = %persisted.id(), job_key = %persisted.job_key(), "job queued");
                Ok(persisted)
            }
            Err(err) => {
                // The message is out; a worker may already own the record.
                warn!(job_id = %queued.id(), error = %err, "unable to persist QUEUED state after dispatch");
                Ok(queued)
            }
        }
    }

    /// Queue a registered job right away, as a cron trigger would.
    pub fn schedule_job(&self, job_key: &str) -> Result<JobStatus, JobError> {
        if !self.registry.contains(job_key) {
            return Err(JobError::initialization(None, format!("Unknown job key: {job_key}")));
        }

        let status = self.queue_job(JobConfig::for_job(job_key).with_principal_name(SCHEDULER_PRINCIPAL))?;
        debug!(job_id = %status.id(), job_key = %job_key, state = %status.state(), "scheduled job queued");
        Ok(status)
    }

    // Execution

    /// Run the job `message` refers to.
    ///
    /// A non-terminal execution error means a retry message was already
    /// posted. Any other non-terminal error asks the caller to redeliver.
    pub fn execute_job(&self, message: &JobMessage) -> Result<JobStatus, JobError> {
        let job_id = message.job_id();

        let status = self.curator.lock_and_load(job_id)?.ok_or_else(|| {
            JobError::initialization(Some(job_id), format!("Unable to find job status for job {job_id}"))
        })?;

        let job_key = status.job_key().trim().to_string();
        if job_key.is_empty() {
            return Err(JobError::initialization(Some(job_id), format!("Job status {job_id} has no job key")));
        }

        let job = self.registry.instantiate(&job_key).map_err(|err| match err {
            JobError::Initialization { message, .. } => JobError::initialization(Some(job_id), message),
            other => other,
        })?;

        match status.state() {
            JobState::Running => match status.executor() {
                Some(executor) if executor == self.config.node_name => {
                    debug!(job_id = %job_id, "resuming job already owned by this node");
                }
                executor => {
                    return Err(JobError::illegal_state(format!(
                        "Job {job_id} is already running on {}",
                        executor.unwrap_or("an unknown node")
                    )));
                }
            },
            state if state.is_terminal() => {
                return Err(JobError::initialization(
                    Some(job_id),
                    format!("Job {job_id} is in an unknown or terminal state: {state}"),
                ));
            }
            _ => {}
        }

        if !status.has_attempts_left() {
            let failed = self.exhaust(status)?;
            warn!(job_id = %job_id, attempts = failed.attempts(), "job has no attempts left");
            return Err(JobError::Execution(JobExecutionError::terminal(
                failed.result().unwrap_or_default().to_string(),
            )));
        }

        let mut status = status;
        status.set_executor(Some(self.config.node_name.clone()));
        status.increment_attempts();
        status.set_start_time(Some(Utc::now()));
        status.set_end_time(None);
        let status = self.update_state(status, JobState::Running)?;

        let logging = LoggingContext::resolve(&status, self.config.default_log_level.as_deref());
        let span = logging.span();
        let _entered = span.enter();

        info!(attempt = status.attempts(), max_attempts = status.max_attempts(), "starting job");

        let mut ctx = JobExecutionContext::new(&status, self.events.as_ref(), &logging);
        let run = panic::catch_unwind(AssertUnwindSafe(|| job.execute(&mut ctx)));
        let result = ctx.into_result();

        match run {
            Ok(Ok(())) => self.complete(status, result),
            Ok(Err(err)) => self.fail(status, err),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(panic = %message, "job panicked");
                self.fail(status, JobExecutionError::terminal(format!("Job panicked: {message}")))
            }
        }
    }

    fn complete(&self, mut status: JobStatus, result: Option<String>) -> Result<JobStatus, JobError> {
        match self.events.send_events() {
            Ok(sent) if sent > 0 => debug!(sent, "job events sent"),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "unable to send job events"),
        }

        status.set_end_time(Some(Utc::now()));
        status.set_result(result);
        let status = self.update_state(status, JobState::Finished)?;
        info!("job finished");
        Ok(status)
    }

    fn fail(&self, mut status: JobStatus, err: JobExecutionError) -> Result<JobStatus, JobError> {
        let dropped = self.events.rollback();
        if dropped > 0 {
            debug!(dropped, "discarded events of failed job");
        }

        status.set_end_time(Some(Utc::now()));
        status.set_result(Some(err.message().to_string()));

        if !err.is_terminal() && status.attempts() < status.max_attempts() {
            let status = self.update_state(status, JobState::FailedWithRetry)?;
            self.dispatcher.post_message(&status.message())?;
            let status = self.update_state(status, JobState::Queued)?;

            warn!(
                attempt = status.attempts(),
                max_attempts = status.max_attempts(),
                error = %err,
                "job failed; retry queued"
            );
            return Err(JobError::Execution(err));
        }

        self.update_state(status, JobState::Failed)?;
        error!(error = %err, "job failed");
        Err(JobError::Execution(err.into_terminal()))
    }

    /// Fail a job whose attempts are used up without running it again.
    fn exhaust(&self, mut status: JobStatus) -> Result<JobStatus, JobError> {
        status.set_end_time(Some(Utc::now()));
        status.set_result(Some(format!(
            "Job {} has no attempts left ({} of {})",
            status.id(),
            status.attempts(),
            status.max_attempts()
        )));
        self.update_state(status, JobState::Failed)
    }

    fn update_state(&self, mut status: JobStatus, state: JobState) -> Result<JobStatus, JobError> {
        let job_id = status.id();
        status
            .transition_to(state)
            .map_err(|e| JobError::illegal_state(format!("job {job_id}: {e}")))?;

        self.curator
            .merge(&status)
            .map_err(|e| JobError::state_management(job_id, state, e))
    }

    // Administration

    /// Cancel a job. A running job is not interrupted; it simply gets no
    /// further attempts.
    pub fn cancel_job(&self, job_id: JobId) -> Result<Option<JobStatus>, JobError> {
        let Some(mut status) = self.curator.get(job_id)? else {
            return Ok(None);
        };

        if status.is_terminal() {
            return Err(JobError::illegal_state(format!(
                "Job {job_id} is already in a terminal state: {}",
                status.state()
            )));
        }

        let updated = if status.state() == JobState::Running {
            status.set_max_attempts(status.attempts());
            self.curator
                .merge(&status)
                .map_err(|e| JobError::state_management(job_id, JobState::Running, e))?
        } else {
            self.update_state(status, JobState::Canceled)?
        };

        info!(job_id = %job_id, state = %updated.state(), "job canceled");
        Ok(Some(updated))
    }

    /// Look up a job on behalf of `principal`.
    ///
    /// Jobs of an owner the principal may not read are reported as absent.
    pub fn find_job(&self, job_id: JobId, principal: &Principal) -> Result<Option<JobStatus>, JobError> {
        let Some(status) = self.curator.get(job_id)? else {
            return Ok(None);
        };

        if let Some(owner_id) = status.owner_id() {
            if let Err(err) = authorize(principal, owner_id, &Permission::JOBS_READ) {
                debug!(job_id = %job_id, principal = %principal.name(), error = %err, "job hidden from principal");
                return Ok(None);
            }
        }
        Ok(Some(status))
    }

    pub fn find_jobs(&self, args: Option<QueryArgs>) -> Result<Vec<JobStatus>, JobError> {
        Ok(self.curator.find_jobs(args.as_ref())?)
    }

    /// Delete terminal jobs matching `args`. Non-terminal states in the
    /// filter are ignored.
    pub fn cleanup_jobs(&self, args: Option<QueryArgs>) -> Result<usize, JobError> {
        let Some(args) = restrict_states(args, JobState::terminal_states()) else {
            return Ok(0);
        };

        let deleted = self.curator.delete_jobs(&args)?;
        info!(deleted, "terminal jobs cleaned up");
        Ok(deleted)
    }

    /// Abort non-terminal jobs matching `args`. Terminal states in the
    /// filter are ignored.
    pub fn abort_non_terminal_jobs(&self, args: Option<QueryArgs>) -> Result<usize, JobError> {
        let Some(args) = restrict_states(args, JobState::non_terminal_states()) else {
            return Ok(0);
        };

        let aborted = self.curator.update_job_state(&args, JobState::Aborted)?;
        info!(aborted, "non-terminal jobs aborted");
        Ok(aborted)
    }
}

/// Intersect the state filter of `args` with `allowed`. An absent or empty
/// filter means every allowed state. `None` when nothing is left.
fn restrict_states(args: Option<QueryArgs>, allowed: impl Iterator<Item = JobState>) -> Option<QueryArgs> {
    let mut args = args.unwrap_or_default();
    let allowed: HashSet<JobState> = allowed.collect();

    let states: HashSet<JobState> = match args.states.take() {
        Some(requested) if !requested.is_empty() => requested.intersection(&allowed).copied().collect(),
        _ => allowed,
    };

    if states.is_empty() {
        return None;
    }
    args.states = Some(states);
    Some(args)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl JobMessageHandler for JobManager {
    fn execute_job(&self, message: &JobMessage) -> Result<JobStatus, JobError> {
        JobManager::execute_job(self, message)
    }
}

impl core::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobManager")
            .field("node", &self.config.node_name)
            .field("state", &self.state())
            .field("jobs", &self.registry.keys())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::constraint::UniqueByArguments;
    use crate::jobs::registry::JobDefinition;
    use crate::jobs::scheduler::ScheduledJob;
    use crate::jobs::status::OwnerContext;
    use crate::jobs::store::CuratorError;
    use crate::jobs::testing::*;
    use jobforge_auth::OwnerMembership;
    use jobforge_core::OwnerId;
    use jobforge_events::{InMemoryEventSink, JobEvent};
    use proptest::prelude::*;

    const NODE: &str = "node-a";

    fn emit_then_succeed(ctx: &mut JobExecutionContext<'_>) -> Result<(), JobExecutionError> {
        ctx.queue_event(JobEvent::new("pool.refreshed", serde_json::json!({ "pools": 2 })));
        ctx.set_job_result(serde_json::json!({ "refreshed": 2 }))
    }

    fn emit_then_fail(ctx: &mut JobExecutionContext<'_>) -> Result<(), JobExecutionError> {
        ctx.queue_event(JobEvent::new("pool.refreshed", serde_json::Value::Null));
        Err(JobExecutionError::retryable("lost connection"))
    }

    fn fatal_on_third_attempt(ctx: &mut JobExecutionContext<'_>) -> Result<(), JobExecutionError> {
        if ctx.status().attempts() < 3 {
            Err(JobExecutionError::retryable("try again"))
        } else {
            Err(JobExecutionError::terminal("giving up"))
        }
    }

    fn registry() -> Arc<JobRegistry> {
        let mut registry = JobRegistry::new();
        registry.register(JobDefinition::from_fn("succeed", || succeed)).unwrap();
        registry.register(JobDefinition::from_fn("retry", || fail_retryable)).unwrap();
        registry.register(JobDefinition::from_fn("terminal", || fail_terminal)).unwrap();
        registry.register(JobDefinition::from_fn("panic", || explode)).unwrap();
        registry.register(JobDefinition::from_fn("emit", || emit_then_succeed)).unwrap();
        registry.register(JobDefinition::from_fn("emit_fail", || emit_then_fail)).unwrap();
        registry
            .register(JobDefinition::from_fn("fatal_third", || fatal_on_third_attempt))
            .unwrap();
        registry
            .register(JobDefinition::from_fn("nightly", || succeed).with_schedule("0 0 3 * * *"))
            .unwrap();
        Arc::new(registry)
    }

    struct Fixture {
        manager: Arc<JobManager>,
        curator: Arc<RecordingCurator>,
        dispatcher: Arc<RecordingDispatcher>,
        events: Arc<InMemoryEventSink>,
    }

    fn fixture() -> Fixture {
        fixture_with(JobsConfig::default().with_node_name(NODE).with_scheduler_enabled(false), None)
    }

    fn fixture_with(config: JobsConfig, scheduler: Option<Arc<RecordingScheduler>>) -> Fixture {
        let curator = RecordingCurator::arc();
        let dispatcher = RecordingDispatcher::arc();
        let events = InMemoryEventSink::arc();

        let mut builder = JobManager::builder(config, registry(), curator.clone(), dispatcher.clone(), events.clone());
        if let Some(scheduler) = scheduler {
            builder = builder.with_scheduler(move |_callback| scheduler as Arc<dyn JobScheduler>);
        }

        Fixture {
            manager: builder.build(),
            curator,
            dispatcher,
            events,
        }
    }

    fn queued(f: &Fixture, config: JobConfig) -> JobStatus {
        let status = f.manager.queue_job(config).unwrap();
        assert_eq!(status.state(), JobState::Queued);
        status
    }

    // Queuing

    #[test]
    fn queue_job_persists_and_dispatches() {
        let f = fixture();
        let status = queued(&f, JobConfig::for_job("succeed").with_raw_argument("owner", "acme"));

        assert_eq!(status.origin(), Some(NODE));
        assert_eq!(status.attempts(), 0);
        assert_eq!(f.curator.stored(status.id()).state(), JobState::Queued);

        let posted = f.dispatcher.posted();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].job_id(), status.id());
        assert_eq!(posted[0].job_key(), "succeed");
    }

    #[test]
    fn queue_job_rejects_blank_key() {
        let f = fixture();
        let err = f.manager.queue_job(JobConfig::for_job("  ")).unwrap_err();

        assert!(matches!(err, JobError::Configuration(_)));
        assert!(f.dispatcher.posted().is_empty());
    }

    #[test]
    fn blocked_job_is_aborted_and_not_dispatched() {
        let f = fixture();
        let unique = UniqueByArguments::new(["owner"]);
        let first = queued(&f, JobConfig::for_job("succeed").with_raw_argument("owner", "acme"));

        let blocked = f
            .manager
            .queue_job(
                JobConfig::for_job("succeed")
                    .with_raw_argument("owner", "acme")
                    .with_constraint(unique.clone()),
            )
            .unwrap();

        assert_eq!(blocked.state(), JobState::Aborted);
        assert_eq!(
            blocked.result(),
            Some(format!("Job blocked by the following existing jobs: {}", first.id()).as_str())
        );
        assert_eq!(f.curator.stored(blocked.id()).state(), JobState::Aborted);
        assert_eq!(f.dispatcher.posted().len(), 1);

        // A different argument value is not blocked.
        queued(
            &f,
            JobConfig::for_job("succeed")
                .with_raw_argument("owner", "globex")
                .with_constraint(unique),
        );
    }

    #[test]
    fn dispatch_failure_marks_job_failed() {
        let f = fixture();
        f.dispatcher.fail_posts(true);

        let status = f.manager.queue_job(JobConfig::for_job("succeed")).unwrap();

        assert_eq!(status.state(), JobState::Failed);
        assert!(status.result().unwrap().contains("broker unreachable"));
        assert_eq!(f.curator.stored(status.id()).state(), JobState::Failed);
    }

    #[test]
    fn schedule_job_requires_registered_key() {
        let f = fixture();

        let err = f.manager.schedule_job("unknown").unwrap_err();
        assert!(matches!(err, JobError::Initialization { .. }));

        let status = f.manager.schedule_job("nightly").unwrap();
        assert_eq!(status.principal(), Some(SCHEDULER_PRINCIPAL));
        assert_eq!(status.state(), JobState::Queued);
    }

    // Execution

    #[test]
    fn successful_job_runs_then_finishes() {
        let f = fixture();
        let status = queued(&f, JobConfig::for_job("emit"));

        let done = f.manager.execute_job(&status.message()).unwrap();

        assert_eq!(done.state(), JobState::Finished);
        assert_eq!(done.attempts(), 1);
        assert_eq!(done.executor(), Some(NODE));
        assert_eq!(done.result(), Some(r#"{"refreshed":2}"#));
        assert!(done.start_time().is_some());
        assert!(done.end_time().is_some());
        assert_eq!(
            f.curator.merged_states(status.id()),
            vec![JobState::Queued, JobState::Running, JobState::Finished]
        );
        assert_eq!(f.events.sent().len(), 1);
        assert_eq!(f.dispatcher.posted().len(), 1);
    }

    #[test]
    fn retryable_failure_requeues_with_a_new_message() {
        let f = fixture();
        let status = queued(&f, JobConfig::for_job("retry").with_retry_count(2));

        let err = f.manager.execute_job(&status.message()).unwrap_err();

        assert!(matches!(&err, JobError::Execution(e) if !e.is_terminal()));
        assert!(!err.is_terminal());
        assert_eq!(
            f.curator.merged_states(status.id()),
            vec![
                JobState::Queued,
                JobState::Running,
                JobState::FailedWithRetry,
                JobState::Queued
            ]
        );

        let stored = f.curator.stored(status.id());
        assert_eq!(stored.attempts(), 1);
        assert_eq!(stored.result(), Some("upstream timed out"));

        let posted = f.dispatcher.posted();
        assert_eq!(posted.len(), 2);
        assert_eq!(posted[1].job_id(), status.id());
        assert_eq!(posted[1].job_key(), "retry");
    }

    #[test]
    fn last_attempt_failure_is_terminal() {
        let f = fixture();
        let status = queued(&f, JobConfig::for_job("retry"));

        let err = f.manager.execute_job(&status.message()).unwrap_err();

        assert!(err.is_terminal());
        assert_eq!(
            f.curator.merged_states(status.id()),
            vec![JobState::Queued, JobState::Running, JobState::Failed]
        );
        assert_eq!(f.dispatcher.posted().len(), 1);
    }

    #[test]
    fn terminal_failure_ignores_remaining_attempts() {
        let f = fixture();
        let status = queued(&f, JobConfig::for_job("terminal").with_retry_count(5));

        let err = f.manager.execute_job(&status.message()).unwrap_err();

        assert!(err.is_terminal());
        let stored = f.curator.stored(status.id());
        assert_eq!(stored.state(), JobState::Failed);
        assert_eq!(stored.result(), Some("bad input"));
        assert_eq!(f.dispatcher.posted().len(), 1);
    }

    #[test]
    fn panicking_job_fails_terminally() {
        let f = fixture();
        let status = queued(&f, JobConfig::for_job("panic").with_retry_count(5));

        let err = f.manager.execute_job(&status.message()).unwrap_err();

        assert!(err.is_terminal());
        let stored = f.curator.stored(status.id());
        assert_eq!(stored.state(), JobState::Failed);
        assert_eq!(stored.result(), Some("Job panicked: kaboom"));
    }

    #[test]
    fn failed_attempt_discards_its_events() {
        let f = fixture();
        let status = queued(&f, JobConfig::for_job("emit_fail").with_retry_count(1));

        let _ = f.manager.execute_job(&status.message());

        assert!(f.events.sent().is_empty());
        assert!(f.events.pending().is_empty());
    }

    #[test]
    fn retries_until_a_terminal_failure() {
        let f = fixture();
        let status = queued(&f, JobConfig::for_job("fatal_third").with_retry_count(2));
        let message = status.message();

        assert!(!f.manager.execute_job(&message).unwrap_err().is_terminal());
        assert!(!f.manager.execute_job(&message).unwrap_err().is_terminal());
        assert!(f.manager.execute_job(&message).unwrap_err().is_terminal());

        let stored = f.curator.stored(status.id());
        assert_eq!(stored.state(), JobState::Failed);
        assert_eq!(stored.attempts(), 3);
        assert_eq!(stored.result(), Some("giving up"));
        assert_eq!(f.dispatcher.posted().len(), 3);
    }

    #[test]
    fn missing_job_is_an_initialization_error() {
        let f = fixture();
        let message = JobMessage::new(JobId::new(), "succeed");

        let err = f.manager.execute_job(&message).unwrap_err();

        assert!(matches!(err, JobError::Initialization { job_id: Some(id), .. } if id == message.job_id()));
        assert!(err.is_terminal());
    }

    #[test]
    fn unregistered_key_is_an_initialization_error() {
        let f = fixture();
        let status = f.curator.seed(JobStatus::new("retired_job").in_state(JobState::Queued));

        let err = f.manager.execute_job(&status.message()).unwrap_err();

        assert!(matches!(err, JobError::Initialization { .. }));
        assert!(f.curator.merged_states(status.id()).is_empty());
    }

    #[test]
    fn terminal_job_is_not_executed() {
        let f = fixture();
        for state in [JobState::Finished, JobState::Canceled, JobState::Aborted] {
            let status = f.curator.seed(JobStatus::new("succeed").in_state(state));

            let err = f.manager.execute_job(&status.message()).unwrap_err();

            assert!(matches!(err, JobError::Initialization { .. }), "{state}");
            assert_eq!(f.curator.stored(status.id()).state(), state);
        }
    }

    #[test]
    fn job_running_on_another_node_is_rejected() {
        let f = fixture();
        let status = f.curator.seed(
            JobStatus::new("succeed")
                .in_state(JobState::Running)
                .with_executor("node-b")
                .with_attempts(1),
        );

        let err = f.manager.execute_job(&status.message()).unwrap_err();

        assert!(matches!(err, JobError::IllegalState(_)));
        let stored = f.curator.stored(status.id());
        assert_eq!(stored.executor(), Some("node-b"));
        assert_eq!(stored.attempts(), 1);
        assert!(f.curator.merged_states(status.id()).is_empty());
    }

    #[test]
    fn job_running_on_this_node_may_continue() {
        let f = fixture();
        let status = f.curator.seed(
            JobStatus::new("succeed")
                .in_state(JobState::Running)
                .with_executor(NODE)
                .with_attempts(1)
                .with_max_attempts(3),
        );

        let done = f.manager.execute_job(&status.message()).unwrap();

        assert_eq!(done.state(), JobState::Finished);
        assert_eq!(done.attempts(), 2);
    }

    #[test]
    fn redelivery_without_attempts_left_fails_the_job() {
        let f = fixture();
        let status = f.curator.seed(
            JobStatus::new("succeed")
                .in_state(JobState::Running)
                .with_executor(NODE)
                .with_attempts(1),
        );

        let err = f.manager.execute_job(&status.message()).unwrap_err();

        assert!(matches!(&err, JobError::Execution(e) if e.is_terminal()));
        let stored = f.curator.stored(status.id());
        assert_eq!(stored.state(), JobState::Failed);
        assert_eq!(stored.attempts(), 1);
        assert_eq!(f.curator.merged_states(status.id()), vec![JobState::Failed]);
    }

    #[test]
    fn canceled_running_job_is_not_run_again() {
        let f = fixture();
        let status = f.curator.seed(
            JobStatus::new("succeed")
                .in_state(JobState::Running)
                .with_executor(NODE)
                .with_attempts(2)
                .with_max_attempts(5),
        );
        f.manager.cancel_job(status.id()).unwrap();

        assert!(f.manager.execute_job(&status.message()).unwrap_err().is_terminal());
        let stored = f.curator.stored(status.id());
        assert_eq!(stored.state(), JobState::Failed);
        assert_eq!(stored.attempts(), 2);
    }

    #[test]
    fn losing_a_concurrent_update_is_retryable() {
        let f = fixture();
        let status = queued(&f, JobConfig::for_job("succeed").with_retry_count(1));
        let snapshot = f.curator.stored(status.id());

        let done = f.manager.execute_job(&status.message()).unwrap();
        assert_eq!(done.state(), JobState::Finished);

        // A second delivery read the record before the first run persisted it.
        f.curator.serve_next_load(snapshot);
        let err = f.manager.execute_job(&status.message()).unwrap_err();

        assert!(matches!(
            &err,
            JobError::StateManagement {
                state: JobState::Running,
                terminal: false,
                source: CuratorError::Conflict { .. },
                ..
            }
        ));
        assert!(!err.is_terminal());

        let stored = f.curator.stored(status.id());
        assert_eq!(stored.state(), JobState::Finished);
        assert_eq!(stored.attempts(), 1);
    }

    proptest! {
        #[test]
        fn terminal_jobs_never_exceed_max_attempts(retries in 0u32..5, redeliveries in 0usize..4) {
            let f = fixture();
            let status = queued(&f, JobConfig::for_job("retry").with_retry_count(retries));
            let message = status.message();

            while !f.curator.stored(status.id()).is_terminal() {
                let _ = f.manager.execute_job(&message);
            }
            for _ in 0..redeliveries {
                prop_assert!(f.manager.execute_job(&message).unwrap_err().is_terminal());
            }

            let stored = f.curator.stored(status.id());
            prop_assert_eq!(stored.state(), JobState::Failed);
            prop_assert_eq!(stored.attempts(), stored.max_attempts());
            prop_assert_eq!(stored.max_attempts(), retries + 1);
        }
    }

    #[test]
    fn persistence_failure_takes_priority() {
        let f = fixture();
        let status = queued(&f, JobConfig::for_job("succeed"));
        f.curator.fail_merges_to(JobState::Finished);

        let err = f.manager.execute_job(&status.message()).unwrap_err();

        assert!(matches!(err, JobError::StateManagement { state: JobState::Finished, .. }));
        assert!(err.is_terminal());
    }

    #[test]
    fn persistence_failure_before_running_is_retryable() {
        let f = fixture();
        let status = queued(&f, JobConfig::for_job("succeed"));
        f.curator.fail_merges_to(JobState::Running);

        let err = f.manager.execute_job(&status.message()).unwrap_err();

        assert!(matches!(err, JobError::StateManagement { state: JobState::Running, .. }));
        assert!(!err.is_terminal());
        assert_eq!(f.curator.stored(status.id()).state(), JobState::Queued);
    }

    #[test]
    fn retry_dispatch_failure_is_retryable() {
        let f = fixture();
        let status = queued(&f, JobConfig::for_job("retry").with_retry_count(1));
        f.dispatcher.fail_posts(true);

        let err = f.manager.execute_job(&status.message()).unwrap_err();

        assert!(matches!(err, JobError::Dispatch(_)));
        assert!(!err.is_terminal());
        assert_eq!(f.curator.stored(status.id()).state(), JobState::FailedWithRetry);
    }

    // Administration

    #[test]
    fn cancel_queued_job() {
        let f = fixture();
        let status = queued(&f, JobConfig::for_job("succeed"));

        let canceled = f.manager.cancel_job(status.id()).unwrap().unwrap();

        assert_eq!(canceled.state(), JobState::Canceled);
        let err = f.manager.execute_job(&status.message()).unwrap_err();
        assert!(matches!(err, JobError::Initialization { .. }));
    }

    #[test]
    fn cancel_running_job_only_limits_attempts() {
        let f = fixture();
        let status = f.curator.seed(
            JobStatus::new("retry")
                .in_state(JobState::Running)
                .with_executor(NODE)
                .with_attempts(1)
                .with_max_attempts(5),
        );

        let updated = f.manager.cancel_job(status.id()).unwrap().unwrap();

        assert_eq!(updated.state(), JobState::Running);
        assert_eq!(updated.max_attempts(), 1);
    }

    #[test]
    fn cancel_terminal_job_is_illegal() {
        let f = fixture();
        let status = f.curator.seed(JobStatus::new("succeed").in_state(JobState::Finished));

        let err = f.manager.cancel_job(status.id()).unwrap_err();

        assert!(matches!(err, JobError::IllegalState(_)));
    }

    #[test]
    fn cancel_unknown_job_returns_none() {
        let f = fixture();
        assert!(f.manager.cancel_job(JobId::new()).unwrap().is_none());
    }

    #[test]
    fn find_job_hides_jobs_of_foreign_owners() {
        let f = fixture();
        let acme = OwnerId::new();
        let status = queued(&f, JobConfig::for_job("succeed").with_owner(OwnerContext::new(acme, "acme")));

        let member = Principal::user("alice", vec![OwnerMembership::new(acme, [Permission::JOBS_READ])]);
        let outsider = Principal::user("mallory", vec![OwnerMembership::new(OwnerId::new(), [Permission::JOBS_READ])]);

        assert!(f.manager.find_job(status.id(), &member).unwrap().is_some());
        assert!(f.manager.find_job(status.id(), &outsider).unwrap().is_none());
        assert!(f.manager.find_job(status.id(), &Principal::system("admin")).unwrap().is_some());
    }

    #[test]
    fn find_job_without_owner_is_visible() {
        let f = fixture();
        let status = queued(&f, JobConfig::for_job("succeed"));
        let principal = Principal::user("alice", Vec::new());

        assert!(f.manager.find_job(status.id(), &principal).unwrap().is_some());
    }

    #[test]
    fn cleanup_only_deletes_terminal_jobs() {
        let f = fixture();
        let finished = f.curator.seed(JobStatus::new("succeed").in_state(JobState::Finished));
        let failed = f.curator.seed(JobStatus::new("succeed").in_state(JobState::Failed));
        let pending = queued(&f, JobConfig::for_job("succeed"));

        let deleted = f
            .manager
            .cleanup_jobs(Some(QueryArgs::new().with_states([JobState::Finished, JobState::Queued])))
            .unwrap();

        assert_eq!(deleted, 1);
        assert!(f.curator.get(finished.id()).unwrap().is_none());
        assert!(f.curator.get(failed.id()).unwrap().is_some());
        assert!(f.curator.get(pending.id()).unwrap().is_some());

        assert_eq!(f.manager.cleanup_jobs(None).unwrap(), 1);
        assert!(f.curator.get(pending.id()).unwrap().is_some());
    }

    #[test]
    fn cleanup_with_only_non_terminal_states_is_a_no_op() {
        let f = fixture();
        queued(&f, JobConfig::for_job("succeed"));

        let deleted = f
            .manager
            .cleanup_jobs(Some(QueryArgs::new().with_states([JobState::Queued, JobState::Running])))
            .unwrap();

        assert_eq!(deleted, 0);
        assert_eq!(f.curator.bulk_calls(), 0);
    }

    #[test]
    fn abort_only_touches_non_terminal_jobs() {
        let f = fixture();
        let finished = f.curator.seed(JobStatus::new("succeed").in_state(JobState::Finished));
        let pending = queued(&f, JobConfig::for_job("succeed"));
        let other = queued(&f, JobConfig::for_job("retry"));

        let aborted = f
            .manager
            .abort_non_terminal_jobs(Some(QueryArgs::new().with_job_keys(["succeed"])))
            .unwrap();

        assert_eq!(aborted, 1);
        assert_eq!(f.curator.stored(pending.id()).state(), JobState::Aborted);
        assert_eq!(f.curator.stored(other.id()).state(), JobState::Queued);
        assert_eq!(f.curator.stored(finished.id()).state(), JobState::Finished);

        let none = f
            .manager
            .abort_non_terminal_jobs(Some(QueryArgs::new().with_states([JobState::Finished])))
            .unwrap();
        assert_eq!(none, 0);
        assert_eq!(f.curator.bulk_calls(), 1);
    }

    // Lifecycle

    #[test]
    fn lifecycle_requires_initialization() {
        let f = fixture();

        assert!(matches!(f.manager.start(), Err(JobError::IllegalState(_))));
        assert!(matches!(f.manager.suspend(), Err(JobError::IllegalState(_))));
        assert!(matches!(f.manager.resume(), Err(JobError::IllegalState(_))));

        f.manager.initialize().unwrap();
        assert!(matches!(f.manager.initialize(), Err(JobError::IllegalState(_))));

        f.manager.start().unwrap();
        assert_eq!(f.manager.state(), ManagerState::Running);
        f.manager.suspend().unwrap();
        assert_eq!(f.manager.state(), ManagerState::Suspended);
        f.manager.resume().unwrap();
        assert_eq!(f.manager.state(), ManagerState::Running);

        f.manager.shutdown().unwrap();
        assert_eq!(f.manager.state(), ManagerState::Shutdown);
        assert!(matches!(f.manager.shutdown(), Err(JobError::IllegalState(_))));
        assert!(matches!(f.manager.start(), Err(JobError::IllegalState(_))));
    }

    #[test]
    fn initialize_recovers_jobs_abandoned_by_this_node() {
        let f = fixture();
        let mine = f.curator.seed(
            JobStatus::new("succeed")
                .in_state(JobState::Running)
                .with_executor(NODE)
                .with_attempts(1)
                .with_max_attempts(2),
        );
        let theirs = f.curator.seed(
            JobStatus::new("succeed")
                .in_state(JobState::Running)
                .with_executor("node-b")
                .with_attempts(1),
        );

        f.manager.initialize().unwrap();

        assert_eq!(f.curator.stored(mine.id()).state(), JobState::Queued);
        assert_eq!(f.curator.stored(theirs.id()).state(), JobState::Running);

        let posted = f.dispatcher.posted();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].job_id(), mine.id());

        let done = f.manager.execute_job(&posted[0]).unwrap();
        assert_eq!(done.state(), JobState::Finished);
        assert_eq!(done.attempts(), 2);
    }

    #[test]
    fn initialize_fails_abandoned_jobs_without_attempts_left() {
        let f = fixture();
        let spent = f.curator.seed(
            JobStatus::new("succeed")
                .in_state(JobState::Running)
                .with_executor(NODE)
                .with_attempts(1),
        );

        f.manager.initialize().unwrap();

        let stored = f.curator.stored(spent.id());
        assert_eq!(stored.state(), JobState::Failed);
        assert_eq!(stored.attempts(), 1);
        assert!(stored.end_time().is_some());
        assert!(f.dispatcher.posted().is_empty());
    }

    #[test]
    fn initialize_schedules_jobs_and_removes_dead_triggers() {
        let scheduler = Arc::new(RecordingScheduler::with_jobs([ScheduledJob::cron("retired_job", "0 0 1 * * *")]));
        let config = JobsConfig::default()
            .with_node_name(NODE)
            .with_schedule("succeed", "0 */10 * * * *");
        let f = fixture_with(config, Some(scheduler.clone()));

        f.manager.initialize().unwrap();
        assert_eq!(scheduler.job_keys_sorted(), vec!["nightly", "succeed"]);

        f.manager.start().unwrap();
        f.manager.suspend().unwrap();
        f.manager.shutdown().unwrap();
        assert_eq!(scheduler.calls(), vec!["start", "standby", "shutdown"]);
    }

    #[test]
    fn disabled_scheduler_is_left_alone() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let config = JobsConfig::default().with_node_name(NODE).with_scheduler_enabled(false);
        let f = fixture_with(config, Some(scheduler.clone()));

        f.manager.initialize().unwrap();
        f.manager.start().unwrap();

        assert!(!f.manager.is_scheduler_enabled());
        assert!(scheduler.job_keys_sorted().is_empty());
        assert!(scheduler.calls().is_empty());
    }

    #[test]
    fn mode_change_before_start_is_honoured() {
        let f = fixture();

        f.manager.handle_mode_change(Mode::Normal, Mode::Suspend).unwrap();
        assert_eq!(f.manager.state(), ManagerState::Created);

        f.manager.initialize().unwrap();
        f.manager.start().unwrap();
        assert_eq!(f.manager.state(), ManagerState::Suspended);

        f.manager.handle_mode_change(Mode::Suspend, Mode::Normal).unwrap();
        assert_eq!(f.manager.state(), ManagerState::Running);
        assert_eq!(f.manager.mode(), Mode::Normal);
    }

    #[test]
    fn mode_changes_arrive_over_a_channel() {
        let f = fixture();
        f.manager.initialize().unwrap();
        f.manager.start().unwrap();

        let (tx, rx) = mpsc::channel();
        f.manager.attach_mode_channel(rx).unwrap();
        tx.send(ModeChange::new(Mode::Normal, Mode::Suspend)).unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while f.manager.state() != ManagerState::Suspended && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(f.manager.state(), ManagerState::Suspended);

        f.manager.shutdown().unwrap();
    }

    #[test]
    fn scheduler_callback_queues_the_job() {
        let captured: Arc<Mutex<Option<TriggerCallback>>> = Arc::new(Mutex::new(None));
        let curator = RecordingCurator::arc();
        let dispatcher = RecordingDispatcher::arc();

        let slot = captured.clone();
        let manager = JobManager::builder(
            JobsConfig::default().with_node_name(NODE),
            registry(),
            curator.clone(),
            dispatcher.clone(),
            InMemoryEventSink::arc(),
        )
        .with_scheduler(move |callback| {
            *slot.lock().unwrap() = Some(callback);
            Arc::new(RecordingScheduler::default()) as Arc<dyn JobScheduler>
        })
        .build();

        let callback = captured.lock().unwrap().clone().unwrap();
        callback("nightly");

        let jobs = manager.find_jobs(Some(QueryArgs::new().with_job_keys(["nightly"]))).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].principal(), Some(SCHEDULER_PRINCIPAL));
        assert_eq!(dispatcher.posted().len(), 1);
    }
}
