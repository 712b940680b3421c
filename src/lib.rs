#![cfg_attr(docsrs, feature(doc_cfg))]

/*!
 # Batch Core for Rust

 A small job execution core: jobs made of ordered steps, identified by their
 parameters, recorded in a job repository so that a failed run can be
 restarted where it stopped, and so that a job which must not run twice for
 the same parameters never does.

 ## Core Concepts

- **Job:** a named, ordered list of `Step`s, with a restart policy, an
  optional `JobParametersValidator` and an optional `JobExecutionListener`.
- **JobInstance:** one logical run of a job, identified by the job name and
  its identifying `JobParameters`.
- **JobExecution:** one attempt at running a `JobInstance`. A failed instance
  may accumulate several executions when its job is restartable.
- **Step:** an independent, sequential phase of a job. `TaskletStep` calls a
  `Tasklet` until it reports `RepeatStatus::Finished`.
- **ExecutionContext:** key/value state of a job or step execution, handed to
  the next execution when an unsuccessful one is restarted.
- **JobRepository:** persistence of all of the above. An in-memory and an
  SQLite implementation are provided.

 ## Features

| **Feature**   | **Description**                                        |
|---------------|--------------------------------------------------------|
| rdbc-sqlite   | Enables the SQLite `JobRepository`, built on sqlx      |
| full          | Enables all available features                         |

 ## Getting Started

```toml
[dependencies]
batch-core-rs = { version = "<version>", features = ["rdbc-sqlite"] }
```

```rust
use batch_core::{
    core::{
        execution::{BatchStatus, JobExecution, StepExecution},
        job::JobBuilder,
        launcher::JobLauncher,
        parameters::{DefaultJobParametersValidator, JobParametersBuilder},
        repository::InMemoryJobRepository,
        step::{RepeatStatus, StepBuilder},
    },
    BatchError,
};

fn main() -> Result<(), BatchError> {
    let load = |execution: &mut StepExecution| -> Result<RepeatStatus, BatchError> {
        execution.write_count += 1;
        Ok(RepeatStatus::Finished)
    };
    let play_load = StepBuilder::new("playLoad").tasklet(&load).build();
    let game_load = StepBuilder::new("gameLoad").tasklet(&load).build();

    let validator = DefaultJobParametersValidator::new().required_key("season");
    let listener = |execution: &JobExecution| {
        println!("{} ended {}", execution.job_name(), execution.status);
    };

    let job = JobBuilder::new("footballJob")
        .steps(vec![&play_load, &game_load])
        .prevent_restart()
        .validator(&validator)
        .listener(&listener)
        .build()?;

    let repository = InMemoryJobRepository::new();
    let launcher = JobLauncher::new(&repository);
    let parameters = JobParametersBuilder::new().add_long("season", 2023).build();

    let execution = launcher.run(&job, &parameters)?;
    assert_eq!(execution.status, BatchStatus::Completed);

    // The same instance is never run twice.
    assert!(matches!(
        launcher.run(&job, &parameters),
        Err(BatchError::DuplicateJob(_))
    ));

    Ok(())
}
```

 ## Demos
+ `demos/football_job.rs`: a non-restartable job recorded in SQLite

 ## License
 Licensed under either of

 -   Apache License, Version 2.0
     ([LICENSE-APACHE](LICENSE-APACHE) or <http://www.apache.org/licenses/LICENSE-2.0>)
 -   MIT license
     ([LICENSE-MIT](LICENSE-MIT) or <http://opensource.org/licenses/MIT>)

 at your option.
 */

/// Jobs, steps, executions and their repositories
pub mod core;

/// Error types for batch operations
pub mod error;

#[doc(inline)]
pub use error::*;
