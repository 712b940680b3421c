use std::{fmt, str::FromStr};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{context::ExecutionContext, parameters::JobParameters};

/// Status of a job or step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    /// Status of a batch job prior to its execution.
    Starting,
    /// Status of a batch job that is running.
    Started,
    /// Status of a batch job waiting for the current step to end before stopping.
    Stopping,
    /// Status of a batch job that has been stopped by request.
    Stopped,
    /// The batch job has successfully completed its execution.
    Completed,
    /// Status of a batch job that has failed during its execution.
    Failed,
    /// Status of a batch job that did not stop properly and can not be restarted.
    Abandoned,
    /// Status of a batch job that is in an uncertain state.
    Unknown,
}

impl BatchStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Starting | Self::Started | Self::Stopping)
    }

    pub fn is_unsuccessful(&self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Stopped | Self::Abandoned | Self::Unknown
        )
    }

    /// No further transition is expected from this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Stopped | Self::Abandoned
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "STARTING"),
            Self::Started => write!(f, "STARTED"),
            Self::Stopping => write!(f, "STOPPING"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Abandoned => write!(f, "ABANDONED"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STARTING" => Ok(Self::Starting),
            "STARTED" => Ok(Self::Started),
            "STOPPING" => Ok(Self::Stopping),
            "STOPPED" => Ok(Self::Stopped),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "ABANDONED" => Ok(Self::Abandoned),
            "UNKNOWN" => Ok(Self::Unknown),
            _ => Err(format!("Invalid batch status: {s}")),
        }
    }
}

/// Logical run of a job: one job name with one set of identifying parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: i64,
    pub job_name: String,
    /// Hash of the job name and identifying parameters.
    pub job_key: Uuid,
}

/// One attempt to run a [`JobInstance`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: i64,
    pub job_instance: JobInstance,
    pub parameters: JobParameters,
    pub status: BatchStatus,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    /// Description of why the execution ended the way it did.
    pub exit_message: Option<String>,
    /// Step executions of this attempt, in the order they were started.
    pub step_executions: Vec<StepExecution>,
    pub execution_context: ExecutionContext,
}

impl JobExecution {
    /// A freshly created execution, in `STARTING` status.
    pub fn new(id: i64, job_instance: JobInstance, parameters: JobParameters) -> Self {
        Self {
            id,
            job_instance,
            parameters,
            status: BatchStatus::Starting,
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
            last_updated: None,
            exit_message: None,
            step_executions: Vec::new(),
            execution_context: ExecutionContext::new(),
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_instance.job_name
    }

    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }

    pub fn duration(&self) -> Option<Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    pub fn step_execution(&self, step_name: &str) -> Option<&StepExecution> {
        self.step_executions
            .iter()
            .rev()
            .find(|step_execution| step_execution.step_name == step_name)
    }
}

/// One attempt to run a step within a [`JobExecution`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    /// Assigned by the repository on first save.
    pub id: Option<i64>,
    pub job_execution_id: i64,
    pub step_name: String,
    pub status: BatchStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Number of items successfully read
    pub read_count: usize,
    /// Number of items successfully written
    pub write_count: usize,
    /// Number of items skipped
    pub skip_count: usize,
    pub exit_message: Option<String>,
    pub execution_context: ExecutionContext,
}

impl StepExecution {
    pub fn new(step_name: &str, job_execution_id: i64) -> Self {
        Self {
            id: None,
            job_execution_id,
            step_name: step_name.to_string(),
            status: BatchStatus::Starting,
            start_time: None,
            end_time: None,
            read_count: 0,
            write_count: 0,
            skip_count: 0,
            exit_message: None,
            execution_context: ExecutionContext::new(),
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_should_round_trip_through_its_persisted_name() {
        for status in [
            BatchStatus::Starting,
            BatchStatus::Started,
            BatchStatus::Stopping,
            BatchStatus::Stopped,
            BatchStatus::Completed,
            BatchStatus::Failed,
            BatchStatus::Abandoned,
            BatchStatus::Unknown,
        ] {
            assert_eq!(status.to_string().parse::<BatchStatus>(), Ok(status));
        }
        assert!("DONE".parse::<BatchStatus>().is_err());
    }

    #[test]
    fn status_classification() {
        assert!(BatchStatus::Stopping.is_running());
        assert!(!BatchStatus::Stopping.is_terminal());
        assert!(BatchStatus::Completed.is_terminal());
        assert!(!BatchStatus::Completed.is_unsuccessful());
        assert!(BatchStatus::Abandoned.is_unsuccessful());
        assert!(!BatchStatus::Unknown.is_terminal());
    }

    #[test]
    fn step_execution_lookup_should_return_latest_attempt() {
        let instance = JobInstance {
            id: 1,
            job_name: "footballJob".to_string(),
            job_key: Uuid::nil(),
        };
        let mut execution = JobExecution::new(1, instance, JobParameters::new());

        let mut first = StepExecution::new("gameLoad", 1);
        first.status = BatchStatus::Failed;
        let mut second = StepExecution::new("gameLoad", 1);
        second.status = BatchStatus::Completed;
        execution.step_executions = vec![first, second];

        assert_eq!(
            execution.step_execution("gameLoad").map(|s| s.status),
            Some(BatchStatus::Completed)
        );
        assert!(execution.step_execution("playLoad").is_none());
        assert!(execution.duration().is_none());
    }
}
