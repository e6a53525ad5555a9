//! Pipeline jobs and their scheduler
//!
//! Every job the pipeline runs is a [`PipelineJob`]. The [`PipelineManager`]
//! runs each job on its own schedule, never overlapping a job with itself,
//! until it is stopped or a job fails.

pub mod manager;

use anyhow::Result;
use async_trait::async_trait;
use std::{fmt, time::Duration};
use tracing::{error, info};

use crate::{ccw::CcwRifLoadJob, rda::RdaLoadJob};

pub use manager::PipelineManager;

/// When a job runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSchedule {
    /// Again this long after the previous run completed
    Interval(Duration),
    /// Once, then never again
    RunOnce,
}

/// Result of one successful run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    NothingToDo,
    WorkDone,
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::NothingToDo => f.write_str("NOTHING_TO_DO"),
            JobOutcome::WorkDone => f.write_str("WORK_DONE"),
        }
    }
}

/// Jobs outside the two ingestion jobs
#[async_trait]
pub trait CustomJob: Send + Sync {
    fn job_type(&self) -> String;

    fn schedule(&self) -> JobSchedule;

    fn is_interruptible(&self) -> bool {
        false
    }

    async fn is_smoke_test_successful(&self) -> Result<bool> {
        Ok(true)
    }

    async fn call(&mut self) -> Result<JobOutcome>;

    async fn shutdown(&mut self) {}
}

pub enum PipelineJob {
    CcwRifLoad(Box<CcwRifLoadJob>),
    RdaLoad(Box<RdaLoadJob>),
    Custom(Box<dyn CustomJob>),
}

impl PipelineJob {
    pub fn job_type(&self) -> String {
        match self {
            PipelineJob::CcwRifLoad(_) => crate::ccw::job::JOB_TYPE.to_string(),
            PipelineJob::RdaLoad(job) => job.job_type().to_string(),
            PipelineJob::Custom(job) => job.job_type(),
        }
    }

    pub fn schedule(&self) -> JobSchedule {
        match self {
            PipelineJob::CcwRifLoad(job) => job.schedule(),
            PipelineJob::RdaLoad(job) => job.schedule(),
            PipelineJob::Custom(job) => job.schedule(),
        }
    }

    pub fn is_interruptible(&self) -> bool {
        match self {
            PipelineJob::CcwRifLoad(job) => job.is_interruptible(),
            PipelineJob::RdaLoad(job) => job.is_interruptible(),
            PipelineJob::Custom(job) => job.is_interruptible(),
        }
    }

    pub async fn is_smoke_test_successful(&self) -> bool {
        match self {
            PipelineJob::CcwRifLoad(job) => job.is_smoke_test_successful().await,
            PipelineJob::RdaLoad(job) => job.is_smoke_test_successful().await,
            PipelineJob::Custom(job) => match job.is_smoke_test_successful().await {
                Ok(passed) => passed,
                Err(e) => {
                    error!("Smoke test failed for {}: {:#}", job.job_type(), e);
                    false
                },
            },
        }
    }

    pub async fn call(&mut self) -> Result<JobOutcome> {
        match self {
            PipelineJob::CcwRifLoad(job) => job.call().await,
            PipelineJob::RdaLoad(job) => job.call().await,
            PipelineJob::Custom(job) => job.call().await,
        }
    }

    pub async fn shutdown(&mut self) {
        match self {
            PipelineJob::CcwRifLoad(job) => job.shutdown().await,
            PipelineJob::RdaLoad(job) => job.shutdown().await,
            PipelineJob::Custom(job) => job.shutdown().await,
        }
    }
}

impl fmt::Debug for PipelineJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PipelineJob").field(&self.job_type()).finish()
    }
}

impl From<CcwRifLoadJob> for PipelineJob {
    fn from(job: CcwRifLoadJob) -> Self {
        PipelineJob::CcwRifLoad(Box::new(job))
    }
}

impl From<RdaLoadJob> for PipelineJob {
    fn from(job: RdaLoadJob) -> Self {
        PipelineJob::RdaLoad(Box::new(job))
    }
}

/// Job types whose smoke test failed. Every job is tested, even after a
/// failure, so the log names all of them.
pub async fn smoke_test_failures(jobs: &[PipelineJob]) -> Vec<String> {
    let mut failed = Vec::new();
    for job in jobs {
        info!(job = %job.job_type(), "Running smoke test");
        if !job.is_smoke_test_successful().await {
            failed.push(job.job_type());
        }
    }
    failed
}

pub async fn any_smoke_test_failed(jobs: &[PipelineJob]) -> bool {
    !smoke_test_failures(jobs).await.is_empty()
}

/// What one dispatch of a job did, for the run log
#[derive(Debug, Clone)]
pub struct JobRunSummary {
    pub job_type: String,
    pub elapsed: Duration,
    pub outcome: std::result::Result<JobOutcome, String>,
}

impl JobRunSummary {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

impl fmt::Display for JobRunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            Ok(outcome) => write!(
                f,
                "Job run complete: job='{}', outcome={}, duration={:?}",
                self.job_type, outcome, self.elapsed
            ),
            Err(error) => write!(
                f,
                "Job run failed: job='{}', duration={:?}, error={}",
                self.job_type, self.elapsed, error
            ),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    struct Probe {
        name: &'static str,
        smoke: Result<bool>,
    }

    #[async_trait]
    impl CustomJob for Probe {
        fn job_type(&self) -> String {
            self.name.to_string()
        }

        fn schedule(&self) -> JobSchedule {
            JobSchedule::RunOnce
        }

        async fn is_smoke_test_successful(&self) -> Result<bool> {
            match &self.smoke {
                Ok(passed) => Ok(*passed),
                Err(e) => Err(anyhow!("{}", e)),
            }
        }

        async fn call(&mut self) -> Result<JobOutcome> {
            Ok(JobOutcome::NothingToDo)
        }
    }

    fn probe(name: &'static str, smoke: Result<bool>) -> PipelineJob {
        PipelineJob::Custom(Box::new(Probe { name, smoke }))
    }

    #[tokio::test]
    async fn test_smoke_tests_all_run() {
        let jobs = vec![
            probe("first", Ok(false)),
            probe("second", Ok(true)),
            probe("third", Err(anyhow!("unreachable"))),
        ];

        assert_eq!(smoke_test_failures(&jobs).await, vec!["first", "third"]);
        assert!(any_smoke_test_failed(&jobs).await);
        assert!(!any_smoke_test_failed(&[probe("ok", Ok(true))]).await);
    }

    #[tokio::test]
    async fn test_custom_job_defaults() {
        let mut job = probe("defaults", Ok(true));
        assert!(!job.is_interruptible());
        assert_eq!(job.schedule(), JobSchedule::RunOnce);
        assert_eq!(job.call().await.unwrap(), JobOutcome::NothingToDo);
        assert_eq!(format!("{:?}", job), "PipelineJob(\"defaults\")");
    }

    #[test]
    fn test_run_summary_distinguishes_failure() {
        let ok = JobRunSummary {
            job_type: "CcwRifLoadJob".to_string(),
            elapsed: Duration::from_millis(1500),
            outcome: Ok(JobOutcome::WorkDone),
        };
        let failed = JobRunSummary {
            outcome: Err("sink unavailable".to_string()),
            ..ok.clone()
        };

        assert!(ok.is_success());
        assert!(ok.to_string().starts_with("Job run complete: job='CcwRifLoadJob', outcome=WORK_DONE"));
        assert!(!failed.is_success());
        assert!(failed.to_string().starts_with("Job run failed: job='CcwRifLoadJob'"));
        assert!(failed.to_string().ends_with("error=sink unavailable"));
    }
}
