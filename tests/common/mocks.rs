//! Mock version of the job repository.
use mockall::mock;

use batch_core::{
    BatchError,
    core::{
        execution::{JobExecution, JobInstance, StepExecution},
        parameters::JobParameters,
        repository::JobRepository,
    },
};

mock! {
    pub Repository {}
    impl JobRepository for Repository {
        fn create_job_execution(
            &self,
            job_name: &str,
            parameters: &JobParameters,
            restartable: bool,
        ) -> Result<JobExecution, BatchError>;
        fn update_job_execution(&self, job_execution: &mut JobExecution) -> Result<(), BatchError>;
        fn request_stop(&self, execution_id: i64) -> Result<(), BatchError>;
        fn abandon_job_execution(&self, execution_id: i64) -> Result<(), BatchError>;
        fn save_step_execution(&self, step_execution: &mut StepExecution) -> Result<(), BatchError>;
        fn find_last_execution(
            &self,
            job_name: &str,
            parameters: &JobParameters,
        ) -> Result<Option<JobExecution>, BatchError>;
        fn get_job_execution(&self, execution_id: i64) -> Result<Option<JobExecution>, BatchError>;
        fn find_last_step_execution(
            &self,
            job_instance: &JobInstance,
            step_name: &str,
        ) -> Result<Option<StepExecution>, BatchError>;
        fn count_step_executions(
            &self,
            job_instance: &JobInstance,
            step_name: &str,
        ) -> Result<usize, BatchError>;
    }
}
