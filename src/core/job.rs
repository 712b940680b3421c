use std::{
    collections::HashSet,
    panic::{self, AssertUnwindSafe},
};

use chrono::Utc;
use log::{debug, error, info, warn};

use crate::BatchError;

use super::{
    execution::{BatchStatus, JobExecution, StepExecution},
    parameters::{JobParameters, JobParametersValidator},
    repository::JobRepository,
    step::{Step, StepRunner},
};

/// A job: a named, ordered sequence of steps with a restart policy.
///
/// A job is a definition; each launch produces a [`JobExecution`] that the
/// job drives to a terminal status through [`Job::execute`].
///
/// # Example
///
/// ```
/// use batch_core::core::{
///     execution::StepExecution,
///     job::{Job, JobBuilder},
///     step::{RepeatStatus, StepBuilder},
/// };
/// use batch_core::BatchError;
///
/// let noop = |_: &mut StepExecution| -> Result<RepeatStatus, BatchError> {
///     Ok(RepeatStatus::Finished)
/// };
/// let play_load = StepBuilder::new("playLoad").tasklet(&noop).build();
/// let game_load = StepBuilder::new("gameLoad").tasklet(&noop).build();
///
/// let job = JobBuilder::new("footballJob")
///     .steps(vec![&play_load, &game_load])
///     .prevent_restart()
///     .build()
///     .unwrap();
///
/// assert_eq!(job.name(), "footballJob");
/// assert!(!job.is_restartable());
/// ```
pub trait Job {
    fn name(&self) -> &str;

    /// Whether a failed or stopped instance of this job may be run again.
    fn is_restartable(&self) -> bool;

    /// Checks the launch parameters. Must not have side effects.
    fn validate(&self, parameters: &JobParameters) -> Result<(), BatchError>;

    /// Drives `job_execution` from `STARTING` to a terminal status.
    ///
    /// The final status is persisted and the completion listener notified
    /// before this returns, whatever the outcome.
    ///
    /// # Returns
    /// - `Ok(())` when the execution ended `COMPLETED` or `STOPPED`
    /// - `Err(BatchError::StepExecution)` when a step failed; the execution
    ///   is recorded as `FAILED`
    /// - `Err(BatchError::Repository)` when the repository failed
    fn execute(
        &self,
        repository: &dyn JobRepository,
        job_execution: &mut JobExecution,
    ) -> Result<(), BatchError>;
}

/// Lifecycle callbacks of a job execution.
///
/// `after_job` is called exactly once per job execution, after the final
/// status has been persisted, whether the job completed, failed or stopped.
/// Errors it returns (and panics it raises) are logged and never change the
/// recorded outcome.
///
/// Closures taking a `&JobExecution` are listeners:
///
/// ```
/// use batch_core::core::execution::{BatchStatus, JobExecution};
///
/// let listener = |execution: &JobExecution| {
///     if execution.status == BatchStatus::Failed {
///         eprintln!("job {} failed", execution.job_name());
///     }
/// };
/// ```
pub trait JobExecutionListener {
    /// Called once the execution is `STARTED`, before the first step.
    fn before_job(&self, _job_execution: &JobExecution) -> Result<(), BatchError> {
        Ok(())
    }

    fn after_job(&self, job_execution: &JobExecution) -> Result<(), BatchError>;
}

impl<F> JobExecutionListener for F
where
    F: Fn(&JobExecution),
{
    fn after_job(&self, job_execution: &JobExecution) -> Result<(), BatchError> {
        self(job_execution);
        Ok(())
    }
}

/// The default [`Job`]: runs its steps strictly in sequence.
pub struct SimpleJob<'a> {
    name: String,
    steps: Vec<&'a dyn Step>,
    restartable: bool,
    validator: Option<&'a dyn JobParametersValidator>,
    listener: Option<&'a dyn JobExecutionListener>,
}

impl SimpleJob<'_> {
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    /// Marks the execution `STARTED` and runs the steps.
    ///
    /// Returns the status the execution should end with.
    fn run(
        &self,
        repository: &dyn JobRepository,
        job_execution: &mut JobExecution,
    ) -> Result<BatchStatus, BatchError> {
        job_execution.status = BatchStatus::Started;
        job_execution.start_time = Some(Utc::now());
        repository.update_job_execution(job_execution)?;

        if let Some(listener) = self.listener {
            if let Err(err) = listener.before_job(job_execution) {
                warn!("Listener before_job failed for job {}: {}", self.name, err);
            }
        }

        let runner = StepRunner::new(repository);

        for step in &self.steps {
            if self.is_stop_requested(repository, job_execution)? {
                warn!(
                    "Stop requested for job {}, execution {}: not starting step {}",
                    self.name,
                    job_execution.id,
                    step.name()
                );
                return Ok(BatchStatus::Stopped);
            }

            let Some(mut step_execution) = self.prepare_step(repository, job_execution, *step)?
            else {
                continue;
            };

            let result = runner.run(*step, &mut step_execution);
            job_execution.step_executions.push(step_execution);
            result?;
        }

        Ok(BatchStatus::Completed)
    }

    fn is_stop_requested(
        &self,
        repository: &dyn JobRepository,
        job_execution: &mut JobExecution,
    ) -> Result<bool, BatchError> {
        let stored = repository
            .get_job_execution(job_execution.id)?
            .ok_or(BatchError::NoSuchJobExecution(job_execution.id))?;

        if stored.status == BatchStatus::Stopping {
            job_execution.status = BatchStatus::Stopping;
            return Ok(true);
        }
        Ok(false)
    }

    /// Decides whether `step` runs in this execution.
    ///
    /// A step whose last execution on this instance completed is skipped
    /// unless it allows start-if-complete. A restarted step inherits the
    /// execution context of its previous attempt.
    fn prepare_step(
        &self,
        repository: &dyn JobRepository,
        job_execution: &JobExecution,
        step: &dyn Step,
    ) -> Result<Option<StepExecution>, BatchError> {
        let instance = &job_execution.job_instance;
        let last = repository.find_last_step_execution(instance, step.name())?;

        if let Some(last) = &last {
            if last.status == BatchStatus::Completed && !step.allow_start_if_complete() {
                debug!(
                    "Step {} already completed for instance {}, skipping",
                    step.name(),
                    instance.id
                );
                return Ok(None);
            }
        }

        if let Some(limit) = step.start_limit() {
            if repository.count_step_executions(instance, step.name())? >= limit {
                return Err(BatchError::StepExecution {
                    step: step.name().to_string(),
                    execution_id: job_execution.id,
                    source: Box::new(BatchError::StartLimitExceeded {
                        step: step.name().to_string(),
                        limit,
                    }),
                });
            }
        }

        let mut step_execution = StepExecution::new(step.name(), job_execution.id);
        if let Some(last) = last {
            if last.status != BatchStatus::Completed {
                step_execution.execution_context = last.execution_context;
            }
        }

        Ok(Some(step_execution))
    }

    fn notify_after_job(&self, job_execution: &JobExecution) {
        let Some(listener) = self.listener else {
            return;
        };

        match panic::catch_unwind(AssertUnwindSafe(|| listener.after_job(job_execution))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("Listener after_job failed for job {}: {}", self.name, err),
            Err(_) => error!("Listener after_job panicked for job {}", self.name),
        }
    }
}

impl Job for SimpleJob<'_> {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_restartable(&self) -> bool {
        self.restartable
    }

    fn validate(&self, parameters: &JobParameters) -> Result<(), BatchError> {
        match self.validator {
            Some(validator) => validator.validate(parameters),
            None => Ok(()),
        }
    }

    fn execute(
        &self,
        repository: &dyn JobRepository,
        job_execution: &mut JobExecution,
    ) -> Result<(), BatchError> {
        info!(
            "Start of job: {}, execution id: {}",
            self.name, job_execution.id
        );

        let outcome = match self.run(repository, job_execution) {
            Ok(status) => {
                if status == BatchStatus::Stopped {
                    job_execution.exit_message = Some("Stopped by request".to_string());
                }
                job_execution.status = status;
                Ok(())
            }
            Err(err) => {
                error!("Job {} failed: {}", self.name, err);
                job_execution.status = BatchStatus::Failed;
                job_execution.exit_message = Some(err.to_string());
                Err(err)
            }
        };

        job_execution.end_time = Some(Utc::now());
        let persisted = repository.update_job_execution(job_execution);
        if let Err(err) = &persisted {
            error!(
                "Could not record final status of job execution {}: {}",
                job_execution.id, err
            );
        }

        self.notify_after_job(job_execution);

        info!(
            "End of job: {}, execution id: {}, status: {}",
            self.name, job_execution.id, job_execution.status
        );

        outcome.and(persisted)
    }
}

/// Builder for a [`SimpleJob`].
///
/// The step sequence is given as one ordered list; `build` rejects an empty
/// list and duplicate step names.
pub struct JobBuilder<'a> {
    name: String,
    steps: Vec<&'a dyn Step>,
    restartable: bool,
    validator: Option<&'a dyn JobParametersValidator>,
    listener: Option<&'a dyn JobExecutionListener>,
}

impl<'a> JobBuilder<'a> {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            steps: Vec::new(),
            restartable: true,
            validator: None,
            listener: None,
        }
    }

    /// Sets the steps of the job, in execution order.
    pub fn steps(mut self, steps: Vec<&'a dyn Step>) -> Self {
        self.steps = steps;
        self
    }

    /// Every launch of this job must target a new job instance.
    pub fn prevent_restart(mut self) -> Self {
        self.restartable = false;
        self
    }

    pub fn validator(mut self, validator: &'a dyn JobParametersValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn listener(mut self, listener: &'a dyn JobExecutionListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn build(self) -> Result<SimpleJob<'a>, BatchError> {
        if self.name.trim().is_empty() {
            return Err(BatchError::Configuration(
                "job name must not be empty".to_string(),
            ));
        }

        if self.steps.is_empty() {
            return Err(BatchError::Configuration(format!(
                "job '{}' has no steps",
                self.name
            )));
        }

        let mut names = HashSet::new();
        for step in &self.steps {
            if !names.insert(step.name()) {
                return Err(BatchError::Configuration(format!(
                    "job '{}' declares step '{}' more than once",
                    self.name,
                    step.name()
                )));
            }
        }

        Ok(SimpleJob {
            name: self.name,
            steps: self.steps,
            restartable: self.restartable,
            validator: self.validator,
            listener: self.listener,
        })
    }
}
