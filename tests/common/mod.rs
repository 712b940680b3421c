#![allow(dead_code)]

mod mocks;

pub use mocks::MockRepository;

use std::cell::RefCell;

use batch_core::{
    BatchError,
    core::{
        execution::{BatchStatus, JobExecution, StepExecution},
        job::JobExecutionListener,
        parameters::{JobParameters, JobParametersBuilder},
        step::RepeatStatus,
    },
};

pub fn season(year: i64) -> JobParameters {
    JobParametersBuilder::new().add_long("season", year).build()
}

pub fn finished(_: &mut StepExecution) -> Result<RepeatStatus, BatchError> {
    Ok(RepeatStatus::Finished)
}

pub fn failing(execution: &mut StepExecution) -> Result<RepeatStatus, BatchError> {
    Err(BatchError::Tasklet(format!(
        "{} could not read its input",
        execution.step_name
    )))
}

/// Keeps the status of every execution it is notified of.
#[derive(Default)]
pub struct RecordingListener {
    pub notified: RefCell<Vec<(i64, BatchStatus)>>,
}

impl RecordingListener {
    pub fn statuses(&self) -> Vec<BatchStatus> {
        self.notified
            .borrow()
            .iter()
            .map(|(_, status)| *status)
            .collect()
    }
}

impl JobExecutionListener for RecordingListener {
    fn after_job(&self, job_execution: &JobExecution) -> Result<(), BatchError> {
        self.notified
            .borrow_mut()
            .push((job_execution.id, job_execution.status));
        Ok(())
    }
}
