use std::collections::BTreeMap;

use log::{info, warn};

use crate::BatchError;

use super::{
    execution::JobExecution,
    job::Job,
    launcher::JobLauncher,
    parameters::JobParameters,
    repository::JobRepository,
};

/// Jobs known to a [`JobOperator`], by name.
#[derive(Default)]
pub struct JobRegistry<'a> {
    jobs: BTreeMap<String, &'a dyn Job>,
}

impl<'a> JobRegistry<'a> {
    pub fn new() -> Self {
        Self {
            jobs: BTreeMap::new(),
        }
    }

    /// Registers `job` under its name.
    ///
    /// Fails with `BatchError::Configuration` if the name is already taken.
    pub fn register(&mut self, job: &'a dyn Job) -> Result<(), BatchError> {
        if self.jobs.contains_key(job.name()) {
            return Err(BatchError::Configuration(format!(
                "a job named '{}' is already registered",
                job.name()
            )));
        }
        self.jobs.insert(job.name().to_string(), job);
        Ok(())
    }

    pub fn get_job(&self, job_name: &str) -> Result<&'a dyn Job, BatchError> {
        self.jobs
            .get(job_name)
            .copied()
            .ok_or_else(|| BatchError::NoSuchJob(job_name.to_string()))
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.keys().map(String::as_str).collect()
    }
}

/// Name and id based control over registered jobs and their executions.
///
/// `launch` and `restart` run the job on the calling thread and return the
/// id of the execution they created, whatever its outcome; query it with
/// [`JobOperator::get_status`]. `stop` and `abandon` only touch the stored
/// status, so they may be called from another thread while the job runs.
pub struct JobOperator<'a> {
    registry: &'a JobRegistry<'a>,
    repository: &'a dyn JobRepository,
}

impl<'a> JobOperator<'a> {
    pub fn new(registry: &'a JobRegistry<'a>, repository: &'a dyn JobRepository) -> Self {
        Self {
            registry,
            repository,
        }
    }

    pub fn launch(&self, job_name: &str, parameters: &JobParameters) -> Result<i64, BatchError> {
        let job = self.registry.get_job(job_name)?;
        let result = JobLauncher::new(self.repository).run(job, parameters);
        Self::execution_id_of(result)
    }

    /// Current snapshot of an execution, as stored in the repository.
    pub fn get_status(&self, execution_id: i64) -> Result<JobExecution, BatchError> {
        self.repository
            .get_job_execution(execution_id)?
            .ok_or(BatchError::NoSuchJobExecution(execution_id))
    }

    /// Requests a running execution to stop.
    ///
    /// The step in progress finishes; no further step is started and the
    /// execution ends `STOPPED`. The status check and the write are one
    /// repository operation, so an execution that has just finished is
    /// never turned back into `STOPPING`.
    pub fn stop(&self, execution_id: i64) -> Result<(), BatchError> {
        self.repository.request_stop(execution_id)?;
        warn!("Stop requested for job execution {}", execution_id);
        Ok(())
    }

    /// Marks a finished execution `ABANDONED` so its instance is never
    /// restarted.
    pub fn abandon(&self, execution_id: i64) -> Result<(), BatchError> {
        self.repository.abandon_job_execution(execution_id)?;
        info!("Abandoned job execution {}", execution_id);
        Ok(())
    }

    /// Runs the job of `execution_id` again with the same parameters.
    pub fn restart(&self, execution_id: i64) -> Result<i64, BatchError> {
        let previous = self.get_status(execution_id)?;
        let job = self.registry.get_job(previous.job_name())?;

        info!(
            "Restarting job {} from execution {}",
            job.name(),
            execution_id
        );
        let result = JobLauncher::new(self.repository).restart(job, &previous.parameters);
        Self::execution_id_of(result)
    }

    fn execution_id_of(result: Result<JobExecution, BatchError>) -> Result<i64, BatchError> {
        match result {
            Ok(job_execution) => Ok(job_execution.id),
            Err(err) => match err.execution_id() {
                Some(execution_id) => Ok(execution_id),
                None => Err(err),
            },
        }
    }
}
