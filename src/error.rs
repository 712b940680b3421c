use thiserror::Error;

#[derive(Error, Debug)]
/// Batch error
pub enum BatchError {
    #[error("Invalid job parameters: {0}")]
    InvalidParameters(String),

    #[error("A job execution for job '{0}' is already running or complete for these parameters")]
    DuplicateJob(String),

    #[error("Job '{job_name}' cannot be restarted: {reason}")]
    JobRestart { job_name: String, reason: String },

    #[error("No job instance of '{0}' exists for these parameters")]
    NoSuchJobInstance(String),

    #[error("Step '{step}' failed in job execution {execution_id}: {source}")]
    StepExecution {
        step: String,
        execution_id: i64,
        #[source]
        source: Box<BatchError>,
    },

    #[error("Step '{step}' has already been started {limit} time(s)")]
    StartLimitExceeded { step: String, limit: usize },

    #[error("Tasklet from: {0}")]
    Tasklet(String),

    #[error("JobRepository from: {0}")]
    Repository(String),

    #[error("ExecutionContext from: {0}")]
    ExecutionContext(String),

    #[error("Invalid job configuration: {0}")]
    Configuration(String),

    #[error("No job registered under name '{0}'")]
    NoSuchJob(String),

    #[error("No job execution with id {0}")]
    NoSuchJobExecution(i64),

    #[error("Job execution {0} is not running")]
    JobExecutionNotRunning(i64),

    #[error("Job execution {0} is still running")]
    JobExecutionAlreadyRunning(i64),
}

impl BatchError {
    /// Id of the job execution the error was recorded against, if any.
    pub fn execution_id(&self) -> Option<i64> {
        match self {
            BatchError::StepExecution { execution_id, .. } => Some(*execution_id),
            _ => None,
        }
    }
}
