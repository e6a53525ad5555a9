//! Job scheduler
//!
//! One coordinating task wakes every tick, collects finished runs, and
//! dispatches each idle job whose interval has elapsed since its previous run
//! completed. Each dispatch runs on its own task, so different jobs run
//! concurrently while one job never overlaps itself.
//!
//! A failed run is handled per [`FailurePolicy`]: either the whole pipeline
//! stops, or only the failing job is disabled. The first failure is kept and
//! exposed through [`PipelineManager::error`].

use anyhow::{anyhow, bail, Result};
use futures::FutureExt;
use std::{
    any::Any,
    mem,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, OnceLock},
    time::Duration,
};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::{JobOutcome, JobRunSummary, JobSchedule, PipelineJob};
use crate::config::{FailurePolicy, SchedulerConfig};

type RunResult = (PipelineJob, Result<JobOutcome>, Duration);

enum SlotState {
    Idle { job: PipelineJob, next_run: Instant },
    Running(JoinHandle<RunResult>),
    /// Will not run again but still needs `shutdown()`
    Retired(PipelineJob),
    /// The job was lost with its interrupted task
    Gone,
}

struct JobSlot {
    job_type: String,
    interruptible: bool,
    state: SlotState,
}

impl JobSlot {
    fn is_running(&self) -> bool {
        matches!(self.state, SlotState::Running(_))
    }

    fn is_schedulable(&self) -> bool {
        matches!(self.state, SlotState::Idle { .. } | SlotState::Running(_))
    }
}

pub struct PipelineManager {
    config: SchedulerConfig,
    jobs: Mutex<Option<Vec<PipelineJob>>>,
    cancel: CancellationToken,
    error: Arc<OnceLock<Arc<anyhow::Error>>>,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PipelineManager {
    pub fn new(config: SchedulerConfig, jobs: Vec<PipelineJob>) -> Self {
        Self {
            config,
            jobs: Mutex::new(Some(jobs)),
            cancel: CancellationToken::new(),
            error: Arc::new(OnceLock::new()),
            handle: tokio::sync::Mutex::new(None),
        }
    }

    /// Begin dispatching. Fails when called a second time.
    pub async fn start(&self) -> Result<()> {
        let jobs = self
            .jobs
            .lock()
            .map_err(|_| anyhow!("Pipeline manager lock poisoned"))?
            .take();
        let Some(jobs) = jobs else {
            bail!("Pipeline manager already started");
        };

        info!(
            jobs = ?jobs.iter().map(PipelineJob::job_type).collect::<Vec<_>>(),
            tick = ?self.config.tick(),
            policy = ?self.config.failure_policy,
            "Starting pipeline"
        );

        let runner = Runner {
            tick: self.config.tick(),
            failure_policy: self.config.failure_policy,
            cancel: self.cancel.clone(),
            error: Arc::clone(&self.error),
        };
        *self.handle.lock().await = Some(tokio::spawn(runner.run(jobs)));
        Ok(())
    }

    /// Stop dispatching new runs. Runs already in progress finish unless their
    /// job is interruptible.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            info!("Stopping pipeline");
        }
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until the scheduler loop and every job's shutdown have finished.
    /// Returns immediately when the manager was never started. Cancel safe:
    /// dropping the future leaves the scheduler running.
    pub async fn await_completion(&self) {
        let mut handle = self.handle.lock().await;
        let Some(running) = handle.as_mut() else {
            return;
        };
        let result = running.await;
        *handle = None;

        if let Err(e) = result {
            error!("Pipeline scheduler task failed: {}", e);
            let _ = self
                .error
                .set(Arc::new(anyhow!("Pipeline scheduler task failed: {}", e)));
        }
    }

    /// The first job failure, if any
    pub fn error(&self) -> Option<Arc<anyhow::Error>> {
        self.error.get().cloned()
    }
}

struct Runner {
    tick: Duration,
    failure_policy: FailurePolicy,
    cancel: CancellationToken,
    error: Arc<OnceLock<Arc<anyhow::Error>>>,
}

impl Runner {
    async fn run(self, jobs: Vec<PipelineJob>) {
        let now = Instant::now();
        let mut slots: Vec<JobSlot> = jobs
            .into_iter()
            .map(|job| JobSlot {
                job_type: job.job_type(),
                interruptible: job.is_interruptible(),
                state: SlotState::Idle { job, next_run: now },
            })
            .collect();

        let mut interrupted = false;
        loop {
            for slot in slots.iter_mut() {
                self.collect_finished(slot).await;
            }

            if self.cancel.is_cancelled() {
                if !interrupted {
                    for slot in slots.iter().filter(|s| s.interruptible) {
                        if let SlotState::Running(handle) = &slot.state {
                            info!(job = %slot.job_type, "Interrupting running job");
                            handle.abort();
                        }
                    }
                    interrupted = true;
                }
                if !slots.iter().any(JobSlot::is_running) {
                    break;
                }
            } else {
                if !slots.iter().any(JobSlot::is_schedulable) {
                    info!("No jobs left to schedule");
                    break;
                }
                let now = Instant::now();
                for slot in slots.iter_mut() {
                    dispatch_if_due(slot, now);
                }
            }

            if self.cancel.is_cancelled() {
                tokio::time::sleep(self.tick).await;
            } else {
                tokio::select! {
                    _ = self.cancel.cancelled() => {},
                    _ = tokio::time::sleep(self.tick) => {},
                }
            }
        }

        for slot in slots.iter_mut() {
            if let SlotState::Idle { job, .. } | SlotState::Retired(job) = &mut slot.state {
                job.shutdown().await;
            }
        }
        info!("Pipeline stopped");
    }

    async fn collect_finished(&self, slot: &mut JobSlot) {
        let finished = matches!(&slot.state, SlotState::Running(handle) if handle.is_finished());
        if !finished {
            return;
        }
        let SlotState::Running(handle) = mem::replace(&mut slot.state, SlotState::Gone) else {
            return;
        };

        let (job, result, elapsed) = match handle.await {
            Ok(run) => run,
            Err(e) if e.is_cancelled() => {
                info!(job = %slot.job_type, "Job interrupted");
                return;
            },
            Err(e) => {
                let err = anyhow!("Job {} task failed: {}", slot.job_type, e);
                self.record_failure(&slot.job_type, err);
                return;
            },
        };

        let summary = JobRunSummary {
            job_type: slot.job_type.clone(),
            elapsed,
            outcome: result.as_ref().copied().map_err(|e| format!("{:#}", e)),
        };

        match result {
            Ok(outcome) => {
                if outcome == JobOutcome::WorkDone {
                    info!("{}", summary);
                } else {
                    debug!("{}", summary);
                }
                slot.state = match job.schedule() {
                    JobSchedule::Interval(interval) => SlotState::Idle {
                        job,
                        next_run: Instant::now() + interval,
                    },
                    JobSchedule::RunOnce => SlotState::Retired(job),
                };
            },
            Err(e) => {
                error!("{}", summary);
                slot.state = SlotState::Retired(job);
                self.record_failure(&slot.job_type, e);
            },
        }
    }

    fn record_failure(&self, job_type: &str, error: anyhow::Error) {
        let _ = self.error.set(Arc::new(error));
        match self.failure_policy {
            FailurePolicy::StopPipeline => {
                error!(job = %job_type, "Job failed; stopping pipeline");
                self.cancel.cancel();
            },
            FailurePolicy::DisableJob => {
                warn!(job = %job_type, "Job failed; disabling it");
            },
        }
    }
}

fn dispatch_if_due(slot: &mut JobSlot, now: Instant) {
    let due = matches!(&slot.state, SlotState::Idle { next_run, .. } if *next_run <= now);
    if !due {
        return;
    }
    let SlotState::Idle { mut job, .. } = mem::replace(&mut slot.state, SlotState::Gone) else {
        return;
    };

    let run_id = Uuid::new_v4();
    debug!(job = %slot.job_type, %run_id, "Dispatching job");
    let span = info_span!("job_run", job = %slot.job_type, %run_id);
    slot.state = SlotState::Running(tokio::spawn(
        async move {
            let started = Instant::now();
            let job_type = job.job_type();
            // A panic is caught here so the job comes back and still gets `shutdown()`.
            let result = match AssertUnwindSafe(job.call()).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(anyhow!("Job {} panicked: {}", job_type, panic_message(&*panic))),
            };
            (job, result, started.elapsed())
        }
        .instrument(span),
    ));
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown cause"
    }
}
