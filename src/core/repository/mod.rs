use crate::BatchError;

use super::{
    execution::{BatchStatus, JobExecution, JobInstance, StepExecution},
    parameters::JobParameters,
};

/// In-memory repository, useful for tests and for jobs whose metadata does
/// not need to outlive the process.
pub mod memory;

#[cfg(feature = "rdbc-sqlite")]
#[cfg_attr(docsrs, doc(cfg(feature = "rdbc-sqlite")))]
/// Repository backed by an SQLite database through sqlx.
pub mod sqlite;

pub use memory::InMemoryJobRepository;
#[cfg(feature = "rdbc-sqlite")]
pub use sqlite::SqliteJobRepository;

/// Persistence of job instances, job executions, step executions and their
/// execution contexts.
///
/// Every method is one atomic unit against the backing store: it either
/// commits fully or leaves the store untouched. Status checks and the writes
/// they guard happen inside that unit, never on a snapshot read earlier.
pub trait JobRepository {
    /// Creates a new `STARTING` execution for the instance identified by
    /// `job_name` and the identifying `parameters`, creating the instance on
    /// first launch.
    ///
    /// The new execution starts with the job-level execution context of the
    /// instance's previous execution, if any.
    ///
    /// # Errors
    /// - `BatchError::DuplicateJob` if the last execution of the instance is
    ///   running or completed
    /// - `BatchError::JobRestart` if the instance already has an execution
    ///   and `restartable` is false, or its last execution was abandoned
    /// - `BatchError::Repository` if the store fails
    fn create_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
        restartable: bool,
    ) -> Result<JobExecution, BatchError>;

    /// Persists status, timestamps, exit message and execution context.
    ///
    /// A stop request already stored (`STOPPING`) is never overwritten by a
    /// running status; in that case `job_execution.status` is updated to
    /// `STOPPING` so the caller sees the request.
    fn update_job_execution(&self, job_execution: &mut JobExecution) -> Result<(), BatchError>;

    /// Marks a running execution `STOPPING`.
    ///
    /// # Errors
    /// - `BatchError::NoSuchJobExecution` for an unknown id
    /// - `BatchError::JobExecutionNotRunning` if the stored status is not
    ///   running; nothing is written
    fn request_stop(&self, execution_id: i64) -> Result<(), BatchError>;

    /// Marks a finished execution `ABANDONED`, setting its end time if it
    /// has none.
    ///
    /// # Errors
    /// - `BatchError::NoSuchJobExecution` for an unknown id
    /// - `BatchError::JobExecutionAlreadyRunning` if the stored status is
    ///   running; nothing is written
    fn abandon_job_execution(&self, execution_id: i64) -> Result<(), BatchError>;

    /// Inserts the step execution when it has no id yet (assigning one),
    /// updates it otherwise.
    fn save_step_execution(&self, step_execution: &mut StepExecution) -> Result<(), BatchError>;

    /// Latest execution of the instance identified by `job_name` and
    /// `parameters`, with its step executions.
    fn find_last_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobExecution>, BatchError>;

    /// Snapshot of one job execution, with its step executions in start order.
    fn get_job_execution(&self, execution_id: i64) -> Result<Option<JobExecution>, BatchError>;

    /// Latest execution of `step_name` across all executions of `job_instance`.
    fn find_last_step_execution(
        &self,
        job_instance: &JobInstance,
        step_name: &str,
    ) -> Result<Option<StepExecution>, BatchError>;

    /// Number of times `step_name` was started across all executions of
    /// `job_instance`.
    fn count_step_executions(
        &self,
        job_instance: &JobInstance,
        step_name: &str,
    ) -> Result<usize, BatchError>;
}

/// Status to persist when `incoming` replaces `stored`.
pub(crate) fn synchronize_status(stored: BatchStatus, incoming: BatchStatus) -> BatchStatus {
    if stored == BatchStatus::Stopping
        && matches!(incoming, BatchStatus::Starting | BatchStatus::Started)
    {
        BatchStatus::Stopping
    } else {
        incoming
    }
}

/// Whether an instance whose last execution is `last_id` with `last_status`
/// may get a new execution.
pub(crate) fn check_relaunch(
    job_name: &str,
    last_id: i64,
    last_status: BatchStatus,
    restartable: bool,
) -> Result<(), BatchError> {
    if last_status.is_running() || last_status == BatchStatus::Completed {
        return Err(BatchError::DuplicateJob(job_name.to_string()));
    }

    if !restartable {
        return Err(BatchError::JobRestart {
            job_name: job_name.to_string(),
            reason: format!(
                "the job is not restartable and execution {} already ended {}",
                last_id, last_status
            ),
        });
    }

    if last_status == BatchStatus::Abandoned {
        return Err(BatchError::JobRestart {
            job_name: job_name.to_string(),
            reason: format!("execution {} was abandoned", last_id),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relaunch_rules() {
        assert!(matches!(
            check_relaunch("footballJob", 1, BatchStatus::Started, true),
            Err(BatchError::DuplicateJob(_))
        ));
        assert!(matches!(
            check_relaunch("footballJob", 1, BatchStatus::Completed, false),
            Err(BatchError::DuplicateJob(_))
        ));
        assert!(matches!(
            check_relaunch("footballJob", 1, BatchStatus::Failed, false),
            Err(BatchError::JobRestart { .. })
        ));
        assert!(matches!(
            check_relaunch("footballJob", 1, BatchStatus::Abandoned, true),
            Err(BatchError::JobRestart { .. })
        ));
        assert!(check_relaunch("footballJob", 1, BatchStatus::Stopped, true).is_ok());
    }

    #[test]
    fn stop_request_should_survive_running_updates() {
        assert_eq!(
            synchronize_status(BatchStatus::Stopping, BatchStatus::Started),
            BatchStatus::Stopping
        );
        assert_eq!(
            synchronize_status(BatchStatus::Stopping, BatchStatus::Stopped),
            BatchStatus::Stopped
        );
        assert_eq!(
            synchronize_status(BatchStatus::Started, BatchStatus::Completed),
            BatchStatus::Completed
        );
    }
}
