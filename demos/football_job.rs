//! Runs a non-restartable `footballJob` against an embedded SQLite job
//! repository, then shows that a second launch with the same parameters is
//! refused.
//!
//! ```sh
//! RUST_LOG=info cargo run --example football_job --features rdbc-sqlite
//! ```

use batch_core::{
    BatchError,
    core::{
        execution::{BatchStatus, JobExecution, StepExecution},
        job::{Job, JobBuilder, JobExecutionListener},
        launcher::JobLauncher,
        parameters::{DefaultJobParametersValidator, JobParametersBuilder},
        repository::SqliteJobRepository,
        step::{RepeatStatus, StepBuilder},
    },
};
use sqlx::sqlite::SqlitePoolOptions;

/// Reports the outcome of every football job execution.
struct FootballJobListener;

impl JobExecutionListener for FootballJobListener {
    fn before_job(&self, job_execution: &JobExecution) -> Result<(), BatchError> {
        println!(
            "▶️  {} started (execution {})",
            job_execution.job_name(),
            job_execution.id
        );
        Ok(())
    }

    fn after_job(&self, job_execution: &JobExecution) -> Result<(), BatchError> {
        match job_execution.status {
            BatchStatus::Completed => println!(
                "✅ {} completed in {}ms",
                job_execution.job_name(),
                job_execution
                    .duration()
                    .map_or(0, |duration| duration.num_milliseconds())
            ),
            BatchStatus::Failed => println!(
                "❌ {} failed: {}",
                job_execution.job_name(),
                job_execution.exit_message.as_deref().unwrap_or("unknown error")
            ),
            status => println!("ℹ️  {} ended {}", job_execution.job_name(), status),
        }
        Ok(())
    }
}

fn play_load(execution: &mut StepExecution) -> Result<RepeatStatus, BatchError> {
    execution.read_count = 120;
    execution.write_count = 120;
    Ok(RepeatStatus::Finished)
}

fn game_load(execution: &mut StepExecution) -> Result<RepeatStatus, BatchError> {
    execution.read_count = 17;
    execution.write_count = 17;
    execution.execution_context.put_long("games.loaded", 17);
    Ok(RepeatStatus::Finished)
}

fn player_summarization(execution: &mut StepExecution) -> Result<RepeatStatus, BatchError> {
    execution.write_count = 53;
    Ok(RepeatStatus::Finished)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // Embedded database: a single connection keeps every query on the same
    // in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    let repository = SqliteJobRepository::new(&pool);
    repository.initialize_schema()?;

    let play_load_step = StepBuilder::new("playLoad").tasklet(&play_load).build();
    let game_load_step = StepBuilder::new("gameLoad").tasklet(&game_load).build();
    let summarization_step = StepBuilder::new("playerSummarization")
        .tasklet(&player_summarization)
        .build();

    let validator = DefaultJobParametersValidator::new()
        .required_key("season")
        .optional_key("run.date");
    let listener = FootballJobListener;

    let job = JobBuilder::new("footballJob")
        .prevent_restart()
        .validator(&validator)
        .listener(&listener)
        .steps(vec![&play_load_step, &game_load_step, &summarization_step])
        .build()?;

    let launcher = JobLauncher::new(&repository);
    let parameters = JobParametersBuilder::new()
        .add_long("season", 2023)
        .add_date("run.date", chrono::Utc::now())
        .build();

    let execution = launcher.run(&job, &parameters)?;
    for step in &execution.step_executions {
        println!(
            "   • {}: {} (read {}, written {})",
            step.step_name, step.status, step.read_count, step.write_count
        );
    }

    match launcher.run(&job, &parameters) {
        Err(BatchError::DuplicateJob(job_name)) => {
            println!("🔒 {} already ran for these parameters", job_name)
        }
        Err(err) => return Err(err.into()),
        Ok(_) => println!("⚠️  {} ran twice", job.name()),
    }

    Ok(())
}
