mod common;

use batch_core::{
    BatchError,
    core::{
        execution::{BatchStatus, JobExecution, JobInstance},
        job::JobBuilder,
        launcher::JobLauncher,
        operator::{JobOperator, JobRegistry},
        parameters::DefaultJobParametersValidator,
        step::StepBuilder,
    },
};
use mockall::predicate::eq;

use common::{MockRepository, RecordingListener, finished, season};

fn football_execution(id: i64) -> JobExecution {
    let job_instance = JobInstance {
        id: 1,
        job_name: "footballJob".to_string(),
        job_key: season(2023).instance_key("footballJob"),
    };
    JobExecution::new(id, job_instance, season(2023))
}

#[test]
fn validation_failure_should_not_touch_the_repository() {
    // No expectation is set: any repository call fails the test.
    let repository = MockRepository::new();
    let validator = DefaultJobParametersValidator::new().required_key("league");
    let step = StepBuilder::new("playLoad").tasklet(&finished).build();
    let job = JobBuilder::new("footballJob")
        .steps(vec![&step])
        .validator(&validator)
        .build()
        .unwrap();

    let result = JobLauncher::new(&repository).run(&job, &season(2023));

    assert!(matches!(result, Err(BatchError::InvalidParameters(_))));
}

#[test]
fn lookup_failure_should_abort_the_launch() {
    let mut repository = MockRepository::new();
    repository
        .expect_find_last_execution()
        .times(1)
        .returning(|_, _| Err(BatchError::Repository("database is locked".to_string())));
    repository.expect_create_job_execution().never();
    let step = StepBuilder::new("playLoad").tasklet(&finished).build();
    let job = JobBuilder::new("footballJob")
        .steps(vec![&step])
        .build()
        .unwrap();

    let result = JobLauncher::new(&repository).run(&job, &season(2023));

    assert!(matches!(result, Err(BatchError::Repository(_))));
}

#[test]
fn lost_creation_race_should_report_duplicate_without_listener_call() {
    let mut repository = MockRepository::new();
    repository
        .expect_find_last_execution()
        .returning(|_, _| Ok(None));
    repository
        .expect_create_job_execution()
        .withf(|_, _, restartable| !*restartable)
        .times(1)
        .returning(|job_name, _, _| Err(BatchError::DuplicateJob(job_name.to_string())));
    let listener = RecordingListener::default();
    let step = StepBuilder::new("playLoad").tasklet(&finished).build();
    let job = JobBuilder::new("footballJob")
        .steps(vec![&step])
        .prevent_restart()
        .listener(&listener)
        .build()
        .unwrap();

    let result = JobLauncher::new(&repository).run(&job, &season(2023));

    assert!(matches!(result, Err(BatchError::DuplicateJob(_))));
    assert!(listener.statuses().is_empty());
}

#[test]
fn final_update_failure_should_still_notify_listener() {
    let mut repository = MockRepository::new();
    repository
        .expect_find_last_execution()
        .returning(|_, _| Ok(None));
    repository
        .expect_create_job_execution()
        .times(1)
        .returning(|_, _, _| Ok(football_execution(7)));
    repository
        .expect_update_job_execution()
        .withf(|execution| execution.status == BatchStatus::Started)
        .times(1)
        .returning(|_| Ok(()));
    repository
        .expect_update_job_execution()
        .withf(|execution| execution.status == BatchStatus::Completed)
        .times(1)
        .returning(|_| Err(BatchError::Repository("disk full".to_string())));
    repository
        .expect_get_job_execution()
        .with(eq(7))
        .returning(|id| {
            let mut execution = football_execution(id);
            execution.status = BatchStatus::Started;
            Ok(Some(execution))
        });
    repository
        .expect_find_last_step_execution()
        .returning(|_, _| Ok(None));
    repository
        .expect_save_step_execution()
        .times(2)
        .returning(|step_execution| {
            step_execution.id = Some(1);
            Ok(())
        });
    let listener = RecordingListener::default();
    let step = StepBuilder::new("playLoad").tasklet(&finished).build();
    let job = JobBuilder::new("footballJob")
        .steps(vec![&step])
        .listener(&listener)
        .build()
        .unwrap();

    let result = JobLauncher::new(&repository).run(&job, &season(2023));

    assert!(matches!(result, Err(BatchError::Repository(_))));
    assert_eq!(listener.statuses(), vec![BatchStatus::Completed]);
}

#[test]
fn step_save_failure_should_fail_the_job() {
    let mut repository = MockRepository::new();
    repository
        .expect_find_last_execution()
        .returning(|_, _| Ok(None));
    repository
        .expect_create_job_execution()
        .returning(|_, _, _| Ok(football_execution(3)));
    repository
        .expect_update_job_execution()
        .times(2)
        .returning(|_| Ok(()));
    repository.expect_get_job_execution().returning(|id| {
        let mut execution = football_execution(id);
        execution.status = BatchStatus::Started;
        Ok(Some(execution))
    });
    repository
        .expect_find_last_step_execution()
        .returning(|_, _| Ok(None));
    repository
        .expect_save_step_execution()
        .times(1)
        .returning(|_| Err(BatchError::Repository("constraint violated".to_string())));
    let listener = RecordingListener::default();
    let step = StepBuilder::new("playLoad").tasklet(&finished).build();
    let job = JobBuilder::new("footballJob")
        .steps(vec![&step])
        .listener(&listener)
        .build()
        .unwrap();

    let result = JobLauncher::new(&repository).run(&job, &season(2023));

    assert!(matches!(result, Err(BatchError::Repository(_))));
    assert_eq!(listener.notified.borrow()[0], (3, BatchStatus::Failed));
}

#[test]
fn operator_stop_should_leave_the_status_check_to_the_repository() {
    let mut repository = MockRepository::new();
    repository
        .expect_request_stop()
        .with(eq(7))
        .times(1)
        .returning(|id| Err(BatchError::JobExecutionNotRunning(id)));
    repository.expect_get_job_execution().never();
    repository.expect_update_job_execution().never();
    let registry = JobRegistry::new();
    let operator = JobOperator::new(&registry, &repository);

    let result = operator.stop(7);

    assert!(matches!(result, Err(BatchError::JobExecutionNotRunning(7))));
}
