use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
};

use chrono::Utc;
use log::{debug, error, info};

use crate::BatchError;

use super::{
    execution::{BatchStatus, StepExecution},
    repository::JobRepository,
};

/// Outcome of one tasklet invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatStatus {
    /// The tasklet has more work and must be invoked again.
    Continuable,
    /// The tasklet has finished executing.
    Finished,
}

/// The body of a step: a single callback invoked until it reports
/// [`RepeatStatus::Finished`].
///
/// The tasklet receives the step execution so it can record counts and
/// checkpoint data in the step's execution context. On restart the context
/// holds whatever the failed attempt stored.
///
/// Closures of the right shape are tasklets:
///
/// ```
/// use batch_core::core::step::{RepeatStatus, StepBuilder};
/// use batch_core::core::execution::StepExecution;
/// use batch_core::BatchError;
///
/// let load = |execution: &mut StepExecution| -> Result<RepeatStatus, BatchError> {
///     execution.read_count += 10;
///     Ok(RepeatStatus::Finished)
/// };
/// let step = StepBuilder::new("playLoad").tasklet(&load).build();
/// ```
pub trait Tasklet {
    fn execute(&self, step_execution: &mut StepExecution) -> Result<RepeatStatus, BatchError>;
}

impl<F> Tasklet for F
where
    F: Fn(&mut StepExecution) -> Result<RepeatStatus, BatchError>,
{
    fn execute(&self, step_execution: &mut StepExecution) -> Result<RepeatStatus, BatchError> {
        self(step_execution)
    }
}

/// A named unit of work within a job.
///
/// A step is opaque to the job engine: it either succeeds or fails. Status
/// bookkeeping and persistence are handled by the [`StepRunner`].
pub trait Step {
    fn name(&self) -> &str;

    /// Whether a step that already completed on this job instance runs again
    /// when the instance is restarted.
    fn allow_start_if_complete(&self) -> bool {
        false
    }

    /// Maximum number of times this step may be started on one job instance.
    fn start_limit(&self) -> Option<usize> {
        None
    }

    fn execute(&self, step_execution: &mut StepExecution) -> Result<(), BatchError>;
}

/// A step that delegates its work to a [`Tasklet`].
pub struct TaskletStep<'a> {
    name: String,
    tasklet: &'a dyn Tasklet,
    allow_start_if_complete: bool,
    start_limit: Option<usize>,
}

impl Step for TaskletStep<'_> {
    fn name(&self) -> &str {
        &self.name
    }

    fn allow_start_if_complete(&self) -> bool {
        self.allow_start_if_complete
    }

    fn start_limit(&self) -> Option<usize> {
        self.start_limit
    }

    fn execute(&self, step_execution: &mut StepExecution) -> Result<(), BatchError> {
        let mut iteration = 0;
        loop {
            iteration += 1;
            debug!("Step {}: tasklet iteration {}", self.name, iteration);

            if self.tasklet.execute(step_execution)? == RepeatStatus::Finished {
                return Ok(());
            }
        }
    }
}

/// Entry point for building steps.
pub struct StepBuilder {
    name: String,
}

impl StepBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    pub fn tasklet<'a>(self, tasklet: &'a dyn Tasklet) -> TaskletBuilder<'a> {
        TaskletBuilder {
            name: self.name,
            tasklet,
            allow_start_if_complete: false,
            start_limit: None,
        }
    }
}

pub struct TaskletBuilder<'a> {
    name: String,
    tasklet: &'a dyn Tasklet,
    allow_start_if_complete: bool,
    start_limit: Option<usize>,
}

impl<'a> TaskletBuilder<'a> {
    pub fn allow_start_if_complete(mut self, allow: bool) -> Self {
        self.allow_start_if_complete = allow;
        self
    }

    pub fn start_limit(mut self, start_limit: usize) -> Self {
        self.start_limit = Some(start_limit);
        self
    }

    pub fn build(self) -> TaskletStep<'a> {
        TaskletStep {
            name: self.name,
            tasklet: self.tasklet,
            allow_start_if_complete: self.allow_start_if_complete,
            start_limit: self.start_limit,
        }
    }
}

/// Runs one step and records its outcome in the repository.
pub struct StepRunner<'a> {
    repository: &'a dyn JobRepository,
}

impl<'a> StepRunner<'a> {
    pub fn new(repository: &'a dyn JobRepository) -> Self {
        Self { repository }
    }

    /// Executes `step`, moving `step_execution` through STARTED to COMPLETED
    /// or FAILED and persisting it at both ends.
    ///
    /// # Returns
    /// - `Ok(())` when the step completed and its final state was saved
    /// - `Err(BatchError::StepExecution)` wrapping the step's failure; a
    ///   panic inside the step is reported as `BatchError::Tasklet`
    /// - `Err(BatchError::Repository)` when the execution could not be saved
    pub fn run(
        &self,
        step: &dyn Step,
        step_execution: &mut StepExecution,
    ) -> Result<(), BatchError> {
        step_execution.status = BatchStatus::Started;
        step_execution.start_time = Some(Utc::now());
        self.repository.save_step_execution(step_execution)?;

        info!(
            "Start of step: {}, job execution id: {}",
            step_execution.step_name, step_execution.job_execution_id
        );

        let result = panic::catch_unwind(AssertUnwindSafe(|| step.execute(step_execution)))
            .unwrap_or_else(|payload| {
                Err(BatchError::Tasklet(format!(
                    "step panicked: {}",
                    panic_message(payload.as_ref())
                )))
            });

        step_execution.end_time = Some(Utc::now());
        match &result {
            Ok(()) => step_execution.status = BatchStatus::Completed,
            Err(err) => {
                error!("Step {} failed: {}", step_execution.step_name, err);
                step_execution.status = BatchStatus::Failed;
                step_execution.exit_message = Some(err.to_string());
            }
        }

        let saved = self.repository.save_step_execution(step_execution);

        info!(
            "End of step: {}, status: {}",
            step_execution.step_name, step_execution.status
        );

        result.map_err(|source| BatchError::StepExecution {
            step: step_execution.step_name.clone(),
            execution_id: step_execution.job_execution_id,
            source: Box::new(source),
        })?;
        saved
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause")
}
