use log::{info, warn};

use crate::BatchError;

use super::{
    execution::JobExecution,
    job::Job,
    parameters::JobParameters,
    repository::{JobRepository, check_relaunch},
};

/// Starts jobs against a [`JobRepository`].
///
/// The launcher checks the restart policy against the last execution of the
/// job instance before creating anything. The repository applies the same
/// policy again when it creates the execution, so a launch racing another
/// one cannot slip past it.
///
/// # Example
///
/// ```
/// use batch_core::core::{
///     execution::{BatchStatus, StepExecution},
///     job::JobBuilder,
///     launcher::JobLauncher,
///     parameters::JobParametersBuilder,
///     repository::InMemoryJobRepository,
///     step::{RepeatStatus, StepBuilder},
/// };
/// use batch_core::BatchError;
///
/// let load = |_: &mut StepExecution| -> Result<RepeatStatus, BatchError> {
///     Ok(RepeatStatus::Finished)
/// };
/// let step = StepBuilder::new("playLoad").tasklet(&load).build();
/// let job = JobBuilder::new("footballJob").steps(vec![&step]).build().unwrap();
///
/// let repository = InMemoryJobRepository::new();
/// let launcher = JobLauncher::new(&repository);
/// let parameters = JobParametersBuilder::new().add_long("season", 2023).build();
///
/// let execution = launcher.run(&job, &parameters).unwrap();
/// assert_eq!(execution.status, BatchStatus::Completed);
///
/// // A completed instance cannot run again.
/// assert!(matches!(
///     launcher.run(&job, &parameters),
///     Err(BatchError::DuplicateJob(_))
/// ));
/// ```
pub struct JobLauncher<'a> {
    repository: &'a dyn JobRepository,
}

impl<'a> JobLauncher<'a> {
    pub fn new(repository: &'a dyn JobRepository) -> Self {
        Self { repository }
    }

    /// Launches `job` with `parameters` and runs it to completion on the
    /// calling thread.
    ///
    /// # Returns
    /// - `Ok(JobExecution)` when the execution ended `COMPLETED` or `STOPPED`
    /// - `Err(BatchError::InvalidParameters)` when validation rejected the
    ///   parameters; nothing was recorded
    /// - `Err(BatchError::DuplicateJob)` when the instance is running or
    ///   already complete
    /// - `Err(BatchError::JobRestart)` when the instance exists and the job
    ///   is not restartable, or its last execution was abandoned
    /// - `Err(BatchError::StepExecution)` when a step failed; the recorded
    ///   execution is `FAILED` and its id is carried by the error
    pub fn run(
        &self,
        job: &dyn Job,
        parameters: &JobParameters,
    ) -> Result<JobExecution, BatchError> {
        job.validate(parameters)?;

        let restartable = job.is_restartable();
        if let Some(last) = self.repository.find_last_execution(job.name(), parameters)? {
            if let Err(err) = check_relaunch(job.name(), last.id, last.status, restartable) {
                warn!(
                    "Job {} rejected: execution {} is {}",
                    job.name(),
                    last.id,
                    last.status
                );
                return Err(err);
            }
            info!(
                "Restarting job: {} (last execution {} ended {})",
                job.name(),
                last.id,
                last.status
            );
        }

        let mut job_execution = self
            .repository
            .create_job_execution(job.name(), parameters, restartable)?;

        info!(
            "Job: [{}] launched with the following parameters: [{}]",
            job.name(),
            parameters.identifying_key()
        );

        job.execute(self.repository, &mut job_execution)?;

        info!(
            "Job: [{}] finished with status: [{}] in {}ms",
            job.name(),
            job_execution.status,
            job_execution
                .duration()
                .map_or(0, |duration| duration.num_milliseconds())
        );

        Ok(job_execution)
    }

    /// Runs `job` again for an instance that has already been executed.
    ///
    /// Fails with `BatchError::NoSuchJobInstance` when no execution exists
    /// for these parameters; otherwise behaves like [`JobLauncher::run`].
    pub fn restart(
        &self,
        job: &dyn Job,
        parameters: &JobParameters,
    ) -> Result<JobExecution, BatchError> {
        if self
            .repository
            .find_last_execution(job.name(), parameters)?
            .is_none()
        {
            return Err(BatchError::NoSuchJobInstance(job.name().to_string()));
        }

        self.run(job, parameters)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::core::{
        execution::{BatchStatus, JobInstance, StepExecution},
        job::JobBuilder,
        parameters::{DefaultJobParametersValidator, JobParametersBuilder},
        repository::InMemoryJobRepository,
        step::{RepeatStatus, StepBuilder},
    };

    fn season(year: i64) -> JobParameters {
        JobParametersBuilder::new().add_long("season", year).build()
    }

    fn finished(_: &mut StepExecution) -> Result<RepeatStatus, BatchError> {
        Ok(RepeatStatus::Finished)
    }

    #[test]
    fn invalid_parameters_should_record_nothing() {
        let repository = InMemoryJobRepository::new();
        let validator = DefaultJobParametersValidator::new().required_key("season");
        let step = StepBuilder::new("playLoad").tasklet(&finished).build();
        let job = JobBuilder::new("footballJob")
            .steps(vec![&step])
            .validator(&validator)
            .build()
            .unwrap();

        let result = JobLauncher::new(&repository).run(&job, &JobParameters::new());

        assert!(matches!(result, Err(BatchError::InvalidParameters(_))));
        assert_eq!(repository.job_execution_count().unwrap(), 0);
    }

    #[test]
    fn failed_step_should_report_execution_id() {
        let repository = InMemoryJobRepository::new();
        let failing = |_: &mut StepExecution| -> Result<RepeatStatus, BatchError> {
            Err(BatchError::Tasklet("corrupt games file".to_string()))
        };
        let step = StepBuilder::new("gameLoad").tasklet(&failing).build();
        let job = JobBuilder::new("footballJob")
            .steps(vec![&step])
            .build()
            .unwrap();

        let err = JobLauncher::new(&repository)
            .run(&job, &season(2023))
            .unwrap_err();

        let execution_id = err.execution_id().unwrap();
        let stored = repository.get_job_execution(execution_id).unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Failed);
        assert!(
            stored
                .exit_message
                .unwrap_or_default()
                .contains("corrupt games file")
        );
    }

    #[test]
    fn restartable_job_should_resume_after_failure() {
        let repository = InMemoryJobRepository::new();
        let attempts = Cell::new(0);
        let flaky = |_: &mut StepExecution| -> Result<RepeatStatus, BatchError> {
            attempts.set(attempts.get() + 1);
            if attempts.get() == 1 {
                Err(BatchError::Tasklet("database unavailable".to_string()))
            } else {
                Ok(RepeatStatus::Finished)
            }
        };
        let play_load = StepBuilder::new("playLoad").tasklet(&finished).build();
        let game_load = StepBuilder::new("gameLoad").tasklet(&flaky).build();
        let job = JobBuilder::new("footballJob")
            .steps(vec![&play_load, &game_load])
            .build()
            .unwrap();
        let launcher = JobLauncher::new(&repository);

        let first = launcher.run(&job, &season(2023)).unwrap_err();
        let second = launcher.restart(&job, &season(2023)).unwrap();

        assert_eq!(first.execution_id(), Some(1));
        assert_eq!(second.id, 2);
        assert_eq!(second.status, BatchStatus::Completed);
        // playLoad completed in the first execution and is skipped.
        assert!(second.step_execution("playLoad").is_none());
        assert_eq!(
            second.step_execution("gameLoad").map(|step| step.status),
            Some(BatchStatus::Completed)
        );
    }

    /// Answers every lookup with "never ran", as a launcher would see it
    /// if another launch created the instance right after the lookup.
    struct StaleLookup {
        inner: InMemoryJobRepository,
    }

    impl JobRepository for StaleLookup {
        fn create_job_execution(
            &self,
            job_name: &str,
            parameters: &JobParameters,
            restartable: bool,
        ) -> Result<JobExecution, BatchError> {
            self.inner.create_job_execution(job_name, parameters, restartable)
        }

        fn update_job_execution(
            &self,
            job_execution: &mut JobExecution,
        ) -> Result<(), BatchError> {
            self.inner.update_job_execution(job_execution)
        }

        fn request_stop(&self, execution_id: i64) -> Result<(), BatchError> {
            self.inner.request_stop(execution_id)
        }

        fn abandon_job_execution(&self, execution_id: i64) -> Result<(), BatchError> {
            self.inner.abandon_job_execution(execution_id)
        }

        fn save_step_execution(
            &self,
            step_execution: &mut StepExecution,
        ) -> Result<(), BatchError> {
            self.inner.save_step_execution(step_execution)
        }

        fn find_last_execution(
            &self,
            _job_name: &str,
            _parameters: &JobParameters,
        ) -> Result<Option<JobExecution>, BatchError> {
            Ok(None)
        }

        fn get_job_execution(
            &self,
            execution_id: i64,
        ) -> Result<Option<JobExecution>, BatchError> {
            self.inner.get_job_execution(execution_id)
        }

        fn find_last_step_execution(
            &self,
            job_instance: &JobInstance,
            step_name: &str,
        ) -> Result<Option<StepExecution>, BatchError> {
            self.inner.find_last_step_execution(job_instance, step_name)
        }

        fn count_step_executions(
            &self,
            job_instance: &JobInstance,
            step_name: &str,
        ) -> Result<usize, BatchError> {
            self.inner.count_step_executions(job_instance, step_name)
        }
    }

    #[test]
    fn non_restartable_job_should_be_refused_even_after_a_stale_lookup() {
        let repository = StaleLookup {
            inner: InMemoryJobRepository::new(),
        };
        let failing = |_: &mut StepExecution| -> Result<RepeatStatus, BatchError> {
            Err(BatchError::Tasklet("corrupt games file".to_string()))
        };
        let step = StepBuilder::new("gameLoad").tasklet(&failing).build();
        let job = JobBuilder::new("footballJob")
            .steps(vec![&step])
            .prevent_restart()
            .build()
            .unwrap();
        let launcher = JobLauncher::new(&repository);

        let first = launcher.run(&job, &season(2023)).unwrap_err();
        let second = launcher.run(&job, &season(2023));

        assert_eq!(first.execution_id(), Some(1));
        assert!(matches!(second, Err(BatchError::JobRestart { .. })));
        assert_eq!(repository.inner.job_execution_count().unwrap(), 1);
    }

    #[test]
    fn restart_without_prior_execution_should_fail() {
        let repository = InMemoryJobRepository::new();
        let step = StepBuilder::new("playLoad").tasklet(&finished).build();
        let job = JobBuilder::new("footballJob")
            .steps(vec![&step])
            .build()
            .unwrap();

        let result = JobLauncher::new(&repository).restart(&job, &season(2023));

        assert!(matches!(result, Err(BatchError::NoSuchJobInstance(_))));
        assert_eq!(repository.job_execution_count().unwrap(), 0);
    }
}
