use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use chrono::Utc;
use log::debug;

use crate::{
    BatchError,
    core::{
        context::ExecutionContext,
        execution::{BatchStatus, JobExecution, JobInstance, StepExecution},
        parameters::JobParameters,
    },
};

use super::{JobRepository, check_relaunch, synchronize_status};

#[derive(Default)]
struct Store {
    instances: Vec<JobInstance>,
    /// Job executions without their step executions.
    executions: BTreeMap<i64, JobExecution>,
    step_executions: BTreeMap<i64, StepExecution>,
    last_instance_id: i64,
    last_execution_id: i64,
    last_step_execution_id: i64,
}

impl Store {
    fn find_instance(&self, job_name: &str, parameters: &JobParameters) -> Option<&JobInstance> {
        let job_key = parameters.instance_key(job_name);
        self.instances
            .iter()
            .find(|instance| instance.job_name == job_name && instance.job_key == job_key)
    }

    fn last_execution_id(&self, instance_id: i64) -> Option<i64> {
        self.executions
            .values()
            .filter(|execution| execution.job_instance.id == instance_id)
            .map(|execution| execution.id)
            .max()
    }

    fn assemble(&self, execution_id: i64) -> Option<JobExecution> {
        let mut execution = self.executions.get(&execution_id)?.clone();
        execution.step_executions = self
            .step_executions
            .values()
            .filter(|step_execution| step_execution.job_execution_id == execution_id)
            .cloned()
            .collect();
        Some(execution)
    }

    fn step_executions_of<'s>(
        &'s self,
        job_instance: &'s JobInstance,
        step_name: &'s str,
    ) -> impl Iterator<Item = &'s StepExecution> + 's {
        self.step_executions.values().filter(move |step_execution| {
            step_execution.step_name == step_name
                && self
                    .executions
                    .get(&step_execution.job_execution_id)
                    .is_some_and(|execution| execution.job_instance.id == job_instance.id)
        })
    }
}

/// A [`JobRepository`] keeping everything in process memory.
///
/// The internal mutex is the transaction boundary: each method observes and
/// mutates the store under a single lock, so concurrent launches of the same
/// instance are serialized.
#[derive(Default)]
pub struct InMemoryJobRepository {
    store: Mutex<Store>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of job executions recorded so far.
    pub fn job_execution_count(&self) -> Result<usize, BatchError> {
        Ok(self.lock()?.executions.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Store>, BatchError> {
        self.store
            .lock()
            .map_err(|_| BatchError::Repository("in-memory store lock poisoned".to_string()))
    }
}

impl JobRepository for InMemoryJobRepository {
    fn create_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
        restartable: bool,
    ) -> Result<JobExecution, BatchError> {
        let mut store = self.lock()?;

        let mut execution_context = ExecutionContext::new();
        let job_instance = match store.find_instance(job_name, parameters).cloned() {
            Some(job_instance) => {
                let last = store
                    .last_execution_id(job_instance.id)
                    .and_then(|id| store.executions.get(&id));
                if let Some(last) = last {
                    check_relaunch(job_name, last.id, last.status, restartable)?;
                    execution_context = last.execution_context.clone();
                }
                job_instance
            }
            None => {
                store.last_instance_id += 1;
                let job_instance = JobInstance {
                    id: store.last_instance_id,
                    job_name: job_name.to_string(),
                    job_key: parameters.instance_key(job_name),
                };
                store.instances.push(job_instance.clone());
                job_instance
            }
        };

        store.last_execution_id += 1;
        let mut execution =
            JobExecution::new(store.last_execution_id, job_instance, parameters.clone());
        execution.execution_context = execution_context;
        store.executions.insert(execution.id, execution.clone());

        debug!(
            "Created job execution {} for instance {} of {}",
            execution.id, execution.job_instance.id, job_name
        );

        Ok(execution)
    }

    fn update_job_execution(&self, job_execution: &mut JobExecution) -> Result<(), BatchError> {
        let mut store = self.lock()?;

        let stored = store
            .executions
            .get_mut(&job_execution.id)
            .ok_or(BatchError::NoSuchJobExecution(job_execution.id))?;

        job_execution.status = synchronize_status(stored.status, job_execution.status);
        job_execution.last_updated = Some(Utc::now());

        let mut record = job_execution.clone();
        record.step_executions.clear();
        *stored = record;

        debug!(
            "Updated job execution {} to {}",
            job_execution.id, job_execution.status
        );

        Ok(())
    }

    fn request_stop(&self, execution_id: i64) -> Result<(), BatchError> {
        let mut store = self.lock()?;

        let stored = store
            .executions
            .get_mut(&execution_id)
            .ok_or(BatchError::NoSuchJobExecution(execution_id))?;
        if !stored.status.is_running() {
            return Err(BatchError::JobExecutionNotRunning(execution_id));
        }

        stored.status = BatchStatus::Stopping;
        stored.last_updated = Some(Utc::now());

        Ok(())
    }

    fn abandon_job_execution(&self, execution_id: i64) -> Result<(), BatchError> {
        let mut store = self.lock()?;

        let stored = store
            .executions
            .get_mut(&execution_id)
            .ok_or(BatchError::NoSuchJobExecution(execution_id))?;
        if stored.status.is_running() {
            return Err(BatchError::JobExecutionAlreadyRunning(execution_id));
        }

        let now = Utc::now();
        stored.status = BatchStatus::Abandoned;
        stored.end_time.get_or_insert(now);
        stored.last_updated = Some(now);

        Ok(())
    }

    fn save_step_execution(&self, step_execution: &mut StepExecution) -> Result<(), BatchError> {
        let mut store = self.lock()?;

        if !store
            .executions
            .contains_key(&step_execution.job_execution_id)
        {
            return Err(BatchError::NoSuchJobExecution(
                step_execution.job_execution_id,
            ));
        }

        let id = match step_execution.id {
            Some(id) => id,
            None => {
                store.last_step_execution_id += 1;
                step_execution.id = Some(store.last_step_execution_id);
                store.last_step_execution_id
            }
        };
        store.step_executions.insert(id, step_execution.clone());

        Ok(())
    }

    fn find_last_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobExecution>, BatchError> {
        let store = self.lock()?;

        Ok(store
            .find_instance(job_name, parameters)
            .and_then(|instance| store.last_execution_id(instance.id))
            .and_then(|id| store.assemble(id)))
    }

    fn get_job_execution(&self, execution_id: i64) -> Result<Option<JobExecution>, BatchError> {
        Ok(self.lock()?.assemble(execution_id))
    }

    fn find_last_step_execution(
        &self,
        job_instance: &JobInstance,
        step_name: &str,
    ) -> Result<Option<StepExecution>, BatchError> {
        let store = self.lock()?;
        Ok(store
            .step_executions_of(job_instance, step_name)
            .last()
            .cloned())
    }

    fn count_step_executions(
        &self,
        job_instance: &JobInstance,
        step_name: &str,
    ) -> Result<usize, BatchError> {
        let store = self.lock()?;
        Ok(store.step_executions_of(job_instance, step_name).count())
    }
}
