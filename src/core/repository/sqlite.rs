use std::future::Future;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use sqlx::{Pool, Row, Sqlite, SqliteConnection, pool::PoolConnection, sqlite::SqliteRow};
use tokio::runtime::RuntimeFlavor;
use uuid::Uuid;

use crate::{
    BatchError,
    core::{
        context::ExecutionContext,
        execution::{BatchStatus, JobExecution, JobInstance, StepExecution},
        parameters::JobParameters,
    },
};

use super::{JobRepository, check_relaunch, synchronize_status};

/// Schema of the batch metadata tables.
pub const SCHEMA: &str = include_str!("schema-sqlite.sql");

const JOB_EXECUTION_SELECT: &str = "SELECT e.job_execution_id, e.status, e.create_time, \
     e.start_time, e.end_time, e.last_updated, e.exit_message, e.job_parameters, \
     i.job_instance_id, i.job_name, i.job_key, c.serialized_context \
     FROM batch_job_execution e \
     JOIN batch_job_instance i ON i.job_instance_id = e.job_instance_id \
     LEFT JOIN batch_job_execution_context c ON c.job_execution_id = e.job_execution_id";

const STEP_EXECUTION_SELECT: &str = "SELECT s.step_execution_id, s.job_execution_id, \
     s.step_name, s.status, s.start_time, s.end_time, s.read_count, s.write_count, \
     s.skip_count, s.exit_message, c.serialized_context \
     FROM batch_step_execution s \
     LEFT JOIN batch_step_execution_context c ON c.step_execution_id = s.step_execution_id";

/// A [`JobRepository`] storing batch metadata in SQLite.
///
/// # Design
///
/// - The connection pool is supplied by the caller, who decides between a
///   file-based (`sqlite://path/to/batch.db`) and an embedded in-memory
///   (`sqlite::memory:`) database
/// - Every repository method runs in its own transaction, so a failed
///   operation leaves no partial rows behind. Methods that check a status
///   before writing open it with `BEGIN IMMEDIATE`, taking the write lock
///   up front
/// - `UNIQUE (job_name, job_key)` and a partial unique index on running
///   executions make "create an execution if none is active" safe even when
///   several processes share the database
///
/// The trait is synchronous while sqlx is async: calls are bridged with
/// `tokio::task::block_in_place`, which requires a multi-threaded tokio
/// runtime. Calls made from a current-thread runtime fail with
/// `BatchError::Repository`.
///
/// # Examples
///
/// ```no_run
/// use batch_core::core::repository::SqliteJobRepository;
/// use sqlx::SqlitePool;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = SqlitePool::connect("sqlite://batch.db?mode=rwc").await?;
/// let repository = SqliteJobRepository::new(&pool);
/// repository.initialize_schema()?;
/// # Ok(())
/// # }
/// ```
pub struct SqliteJobRepository<'a> {
    pool: &'a Pool<Sqlite>,
}

impl<'a> SqliteJobRepository<'a> {
    pub fn new(pool: &'a Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Creates the batch metadata tables if they do not exist yet.
    pub fn initialize_schema(&self) -> Result<(), BatchError> {
        self.block_on(async {
            for statement in SCHEMA
                .split(';')
                .map(str::trim)
                .filter(|statement| !statement.is_empty())
            {
                sqlx::query(statement)
                    .execute(self.pool)
                    .await
                    .map_err(db_error)?;
            }
            debug!("Batch metadata schema initialized");
            Ok(())
        })
    }

    fn block_on<T, F>(&self, future: F) -> Result<T, BatchError>
    where
        F: Future<Output = Result<T, BatchError>>,
    {
        let handle = tokio::runtime::Handle::try_current().map_err(|error| {
            BatchError::Repository(format!("SQLite repository needs a tokio runtime: {}", error))
        })?;
        if handle.runtime_flavor() == RuntimeFlavor::CurrentThread {
            return Err(BatchError::Repository(
                "SQLite repository needs a multi-threaded tokio runtime".to_string(),
            ));
        }
        tokio::task::block_in_place(|| handle.block_on(future))
    }

    /// Takes the database write lock before anything is read, so status
    /// checks and the writes they guard see the same state.
    async fn begin_immediate(&self) -> Result<PoolConnection<Sqlite>, BatchError> {
        let mut connection = self.pool.acquire().await.map_err(db_error)?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *connection)
            .await
            .map_err(db_error)?;
        Ok(connection)
    }

    async fn ensure_exists(&self, execution_id: i64) -> Result<(), BatchError> {
        sqlx::query("SELECT job_execution_id FROM batch_job_execution WHERE job_execution_id = ?")
            .bind(execution_id)
            .fetch_optional(self.pool)
            .await
            .map_err(db_error)?
            .map(|_| ())
            .ok_or(BatchError::NoSuchJobExecution(execution_id))
    }

    async fn load_step_executions(
        &self,
        job_execution_id: i64,
    ) -> Result<Vec<StepExecution>, BatchError> {
        let query = format!(
            "{} WHERE s.job_execution_id = ? ORDER BY s.step_execution_id",
            STEP_EXECUTION_SELECT
        );
        let rows = sqlx::query(&query)
            .bind(job_execution_id)
            .fetch_all(self.pool)
            .await
            .map_err(db_error)?;

        rows.iter().map(map_step_execution).collect()
    }

    /// Maps a job execution row and attaches its step executions.
    async fn with_step_executions(
        &self,
        row: Option<SqliteRow>,
    ) -> Result<Option<JobExecution>, BatchError> {
        match row {
            Some(row) => {
                let mut execution = map_job_execution(&row)?;
                execution.step_executions = self.load_step_executions(execution.id).await?;
                Ok(Some(execution))
            }
            None => Ok(None),
        }
    }
}

impl JobRepository for SqliteJobRepository<'_> {
    fn create_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
        restartable: bool,
    ) -> Result<JobExecution, BatchError> {
        self.block_on(async {
            let mut connection = self.begin_immediate().await?;
            let result =
                insert_job_execution(&mut connection, job_name, parameters, restartable).await;
            finish_transaction(&mut connection, result).await
        })
    }

    fn update_job_execution(&self, job_execution: &mut JobExecution) -> Result<(), BatchError> {
        self.block_on(async {
            let mut connection = self.begin_immediate().await?;
            let result = write_job_execution(&mut connection, job_execution).await;
            finish_transaction(&mut connection, result).await
        })
    }

    fn request_stop(&self, execution_id: i64) -> Result<(), BatchError> {
        self.block_on(async {
            let stopped = sqlx::query(
                "UPDATE batch_job_execution SET status = 'STOPPING', last_updated = ? \
                 WHERE job_execution_id = ? AND status IN ('STARTING', 'STARTED', 'STOPPING')",
            )
            .bind(Utc::now().to_rfc3339())
            .bind(execution_id)
            .execute(self.pool)
            .await
            .map_err(db_error)?;

            if stopped.rows_affected() == 0 {
                self.ensure_exists(execution_id).await?;
                return Err(BatchError::JobExecutionNotRunning(execution_id));
            }
            Ok(())
        })
    }

    fn abandon_job_execution(&self, execution_id: i64) -> Result<(), BatchError> {
        self.block_on(async {
            let now = Utc::now().to_rfc3339();
            let abandoned = sqlx::query(
                "UPDATE batch_job_execution SET status = 'ABANDONED', \
                 end_time = COALESCE(end_time, ?), last_updated = ? \
                 WHERE job_execution_id = ? \
                 AND status NOT IN ('STARTING', 'STARTED', 'STOPPING')",
            )
            .bind(now.as_str())
            .bind(now.as_str())
            .bind(execution_id)
            .execute(self.pool)
            .await
            .map_err(db_error)?;

            if abandoned.rows_affected() == 0 {
                self.ensure_exists(execution_id).await?;
                return Err(BatchError::JobExecutionAlreadyRunning(execution_id));
            }
            Ok(())
        })
    }

    fn save_step_execution(&self, step_execution: &mut StepExecution) -> Result<(), BatchError> {
        self.block_on(async {
            let mut connection = self.begin_immediate().await?;
            let result = write_step_execution(&mut connection, step_execution).await;
            finish_transaction(&mut connection, result).await
        })
    }

    fn find_last_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobExecution>, BatchError> {
        let job_key = parameters.instance_key(job_name).to_string();
        self.block_on(async {
            let query = format!(
                "{} WHERE i.job_name = ? AND i.job_key = ? \
                 ORDER BY e.job_execution_id DESC LIMIT 1",
                JOB_EXECUTION_SELECT
            );
            let row = sqlx::query(&query)
                .bind(job_name)
                .bind(job_key)
                .fetch_optional(self.pool)
                .await
                .map_err(db_error)?;

            self.with_step_executions(row).await
        })
    }

    fn get_job_execution(&self, execution_id: i64) -> Result<Option<JobExecution>, BatchError> {
        self.block_on(async {
            let query = format!("{} WHERE e.job_execution_id = ?", JOB_EXECUTION_SELECT);
            let row = sqlx::query(&query)
                .bind(execution_id)
                .fetch_optional(self.pool)
                .await
                .map_err(db_error)?;

            self.with_step_executions(row).await
        })
    }

    fn find_last_step_execution(
        &self,
        job_instance: &JobInstance,
        step_name: &str,
    ) -> Result<Option<StepExecution>, BatchError> {
        self.block_on(async {
            let query = format!(
                "{} JOIN batch_job_execution e ON e.job_execution_id = s.job_execution_id \
                 WHERE e.job_instance_id = ? AND s.step_name = ? \
                 ORDER BY s.step_execution_id DESC LIMIT 1",
                STEP_EXECUTION_SELECT
            );
            let row = sqlx::query(&query)
                .bind(job_instance.id)
                .bind(step_name)
                .fetch_optional(self.pool)
                .await
                .map_err(db_error)?;

            row.as_ref().map(map_step_execution).transpose()
        })
    }

    fn count_step_executions(
        &self,
        job_instance: &JobInstance,
        step_name: &str,
    ) -> Result<usize, BatchError> {
        self.block_on(async {
            let row = sqlx::query(
                "SELECT COUNT(*) AS step_count FROM batch_step_execution s \
                 JOIN batch_job_execution e ON e.job_execution_id = s.job_execution_id \
                 WHERE e.job_instance_id = ? AND s.step_name = ?",
            )
            .bind(job_instance.id)
            .bind(step_name)
            .fetch_one(self.pool)
            .await
            .map_err(db_error)?;

            let count: i64 = row.try_get("step_count").map_err(db_error)?;
            Ok(count as usize)
        })
    }
}

/// Commits on success. On failure the transaction is rolled back and the
/// original error is returned.
async fn finish_transaction<T>(
    connection: &mut SqliteConnection,
    result: Result<T, BatchError>,
) -> Result<T, BatchError> {
    let outcome = match result {
        Ok(value) => match sqlx::query("COMMIT").execute(&mut *connection).await {
            Ok(_) => return Ok(value),
            Err(error) => db_error(error),
        },
        Err(error) => error,
    };

    if let Err(rollback_error) = sqlx::query("ROLLBACK").execute(&mut *connection).await {
        warn!("SQLite rollback failed: {}", rollback_error);
    }
    Err(outcome)
}

async fn insert_job_execution(
    connection: &mut SqliteConnection,
    job_name: &str,
    parameters: &JobParameters,
    restartable: bool,
) -> Result<JobExecution, BatchError> {
    let job_key = parameters.instance_key(job_name);

    let instance_row = sqlx::query(
        "SELECT job_instance_id FROM batch_job_instance WHERE job_name = ? AND job_key = ?",
    )
    .bind(job_name)
    .bind(job_key.to_string())
    .fetch_optional(&mut *connection)
    .await
    .map_err(db_error)?;

    let mut execution_context = ExecutionContext::new();
    let instance_id = match instance_row {
        Some(row) => {
            let instance_id: i64 = row.try_get("job_instance_id").map_err(db_error)?;

            let last = sqlx::query(
                "SELECT e.job_execution_id, e.status, c.serialized_context \
                 FROM batch_job_execution e \
                 LEFT JOIN batch_job_execution_context c \
                 ON c.job_execution_id = e.job_execution_id \
                 WHERE e.job_instance_id = ? ORDER BY e.job_execution_id DESC LIMIT 1",
            )
            .bind(instance_id)
            .fetch_optional(&mut *connection)
            .await
            .map_err(db_error)?;

            if let Some(last) = last {
                let last_id: i64 = last.try_get("job_execution_id").map_err(db_error)?;
                let status: String = last.try_get("status").map_err(db_error)?;
                let status = parse_status(&status)?;
                check_relaunch(job_name, last_id, status, restartable)?;
                if let Some(json) = last
                    .try_get::<Option<String>, _>("serialized_context")
                    .map_err(db_error)?
                {
                    execution_context = ExecutionContext::from_json(&json)?;
                }
            }
            instance_id
        }
        None => sqlx::query("INSERT INTO batch_job_instance (job_name, job_key) VALUES (?, ?)")
            .bind(job_name)
            .bind(job_key.to_string())
            .execute(&mut *connection)
            .await
            .map_err(|error| insert_error(job_name, error))?
            .last_insert_rowid(),
    };

    let job_instance = JobInstance {
        id: instance_id,
        job_name: job_name.to_string(),
        job_key,
    };
    let mut execution = JobExecution::new(0, job_instance, parameters.clone());
    execution.execution_context = execution_context;

    execution.id = sqlx::query(
        "INSERT INTO batch_job_execution \
         (job_instance_id, status, create_time, job_parameters) VALUES (?, ?, ?, ?)",
    )
    .bind(instance_id)
    .bind(execution.status.to_string())
    .bind(execution.create_time.to_rfc3339())
    .bind(parameters.to_json()?)
    .execute(&mut *connection)
    .await
    .map_err(|error| insert_error(job_name, error))?
    .last_insert_rowid();

    save_job_context(connection, execution.id, &execution.execution_context).await?;

    debug!(
        "Created job execution {} for instance {} of {}",
        execution.id, instance_id, job_name
    );

    Ok(execution)
}

async fn write_job_execution(
    connection: &mut SqliteConnection,
    job_execution: &mut JobExecution,
) -> Result<(), BatchError> {
    let stored = sqlx::query("SELECT status FROM batch_job_execution WHERE job_execution_id = ?")
        .bind(job_execution.id)
        .fetch_optional(&mut *connection)
        .await
        .map_err(db_error)?
        .ok_or(BatchError::NoSuchJobExecution(job_execution.id))?;
    let stored_status: String = stored.try_get("status").map_err(db_error)?;
    let stored_status = parse_status(&stored_status)?;

    let status = synchronize_status(stored_status, job_execution.status);
    let last_updated = Utc::now();

    sqlx::query(
        "UPDATE batch_job_execution SET status = ?, start_time = ?, end_time = ?, \
         last_updated = ?, exit_message = ? WHERE job_execution_id = ?",
    )
    .bind(status.to_string())
    .bind(job_execution.start_time.map(|time| time.to_rfc3339()))
    .bind(job_execution.end_time.map(|time| time.to_rfc3339()))
    .bind(last_updated.to_rfc3339())
    .bind(job_execution.exit_message.clone())
    .bind(job_execution.id)
    .execute(&mut *connection)
    .await
    .map_err(db_error)?;

    save_job_context(connection, job_execution.id, &job_execution.execution_context).await?;

    job_execution.status = status;
    job_execution.last_updated = Some(last_updated);

    debug!(
        "Updated job execution {} to {}",
        job_execution.id, job_execution.status
    );

    Ok(())
}

async fn write_step_execution(
    connection: &mut SqliteConnection,
    step_execution: &mut StepExecution,
) -> Result<(), BatchError> {
    let id = match step_execution.id {
        None => {
            let parent = sqlx::query(
                "SELECT job_execution_id FROM batch_job_execution WHERE job_execution_id = ?",
            )
            .bind(step_execution.job_execution_id)
            .fetch_optional(&mut *connection)
            .await
            .map_err(db_error)?;
            if parent.is_none() {
                return Err(BatchError::NoSuchJobExecution(
                    step_execution.job_execution_id,
                ));
            }

            sqlx::query(
                "INSERT INTO batch_step_execution (job_execution_id, step_name, status, \
                 start_time, end_time, read_count, write_count, skip_count, exit_message, \
                 last_updated) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(step_execution.job_execution_id)
            .bind(step_execution.step_name.as_str())
            .bind(step_execution.status.to_string())
            .bind(step_execution.start_time.map(|time| time.to_rfc3339()))
            .bind(step_execution.end_time.map(|time| time.to_rfc3339()))
            .bind(step_execution.read_count as i64)
            .bind(step_execution.write_count as i64)
            .bind(step_execution.skip_count as i64)
            .bind(step_execution.exit_message.clone())
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *connection)
            .await
            .map_err(db_error)?
            .last_insert_rowid()
        }
        Some(id) => {
            let updated = sqlx::query(
                "UPDATE batch_step_execution SET status = ?, start_time = ?, end_time = ?, \
                 read_count = ?, write_count = ?, skip_count = ?, exit_message = ?, \
                 last_updated = ? WHERE step_execution_id = ?",
            )
            .bind(step_execution.status.to_string())
            .bind(step_execution.start_time.map(|time| time.to_rfc3339()))
            .bind(step_execution.end_time.map(|time| time.to_rfc3339()))
            .bind(step_execution.read_count as i64)
            .bind(step_execution.write_count as i64)
            .bind(step_execution.skip_count as i64)
            .bind(step_execution.exit_message.clone())
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&mut *connection)
            .await
            .map_err(db_error)?;

            if updated.rows_affected() == 0 {
                return Err(BatchError::Repository(format!(
                    "step execution {} does not exist",
                    id
                )));
            }
            id
        }
    };

    sqlx::query(
        "INSERT INTO batch_step_execution_context (step_execution_id, serialized_context) \
         VALUES (?, ?) ON CONFLICT (step_execution_id) \
         DO UPDATE SET serialized_context = excluded.serialized_context",
    )
    .bind(id)
    .bind(step_execution.execution_context.to_json()?)
    .execute(&mut *connection)
    .await
    .map_err(db_error)?;

    step_execution.id = Some(id);

    Ok(())
}

async fn save_job_context(
    connection: &mut SqliteConnection,
    job_execution_id: i64,
    context: &ExecutionContext,
) -> Result<(), BatchError> {
    sqlx::query(
        "INSERT INTO batch_job_execution_context (job_execution_id, serialized_context) \
         VALUES (?, ?) ON CONFLICT (job_execution_id) \
         DO UPDATE SET serialized_context = excluded.serialized_context",
    )
    .bind(job_execution_id)
    .bind(context.to_json()?)
    .execute(connection)
    .await
    .map_err(db_error)?;
    Ok(())
}

fn map_job_execution(row: &SqliteRow) -> Result<JobExecution, BatchError> {
    let job_key: String = row.try_get("job_key").map_err(db_error)?;
    let parameters: String = row.try_get("job_parameters").map_err(db_error)?;
    let status: String = row.try_get("status").map_err(db_error)?;
    let create_time: String = row.try_get("create_time").map_err(db_error)?;
    let context: Option<String> = row.try_get("serialized_context").map_err(db_error)?;

    Ok(JobExecution {
        id: row.try_get("job_execution_id").map_err(db_error)?,
        job_instance: JobInstance {
            id: row.try_get("job_instance_id").map_err(db_error)?,
            job_name: row.try_get("job_name").map_err(db_error)?,
            job_key: Uuid::parse_str(&job_key)
                .map_err(|error| BatchError::Repository(format!("invalid job key: {}", error)))?,
        },
        parameters: JobParameters::from_json(&parameters)?,
        status: parse_status(&status)?,
        create_time: parse_time(&create_time)?,
        start_time: parse_optional_time(row.try_get("start_time").map_err(db_error)?)?,
        end_time: parse_optional_time(row.try_get("end_time").map_err(db_error)?)?,
        last_updated: parse_optional_time(row.try_get("last_updated").map_err(db_error)?)?,
        exit_message: row.try_get("exit_message").map_err(db_error)?,
        step_executions: Vec::new(),
        execution_context: match context {
            Some(json) => ExecutionContext::from_json(&json)?,
            None => ExecutionContext::new(),
        },
    })
}

fn map_step_execution(row: &SqliteRow) -> Result<StepExecution, BatchError> {
    let status: String = row.try_get("status").map_err(db_error)?;
    let read_count: i64 = row.try_get("read_count").map_err(db_error)?;
    let write_count: i64 = row.try_get("write_count").map_err(db_error)?;
    let skip_count: i64 = row.try_get("skip_count").map_err(db_error)?;
    let context: Option<String> = row.try_get("serialized_context").map_err(db_error)?;

    Ok(StepExecution {
        id: Some(row.try_get("step_execution_id").map_err(db_error)?),
        job_execution_id: row.try_get("job_execution_id").map_err(db_error)?,
        step_name: row.try_get("step_name").map_err(db_error)?,
        status: parse_status(&status)?,
        start_time: parse_optional_time(row.try_get("start_time").map_err(db_error)?)?,
        end_time: parse_optional_time(row.try_get("end_time").map_err(db_error)?)?,
        read_count: read_count as usize,
        write_count: write_count as usize,
        skip_count: skip_count as usize,
        exit_message: row.try_get("exit_message").map_err(db_error)?,
        execution_context: match context {
            Some(json) => ExecutionContext::from_json(&json)?,
            None => ExecutionContext::new(),
        },
    })
}

fn parse_status(status: &str) -> Result<BatchStatus, BatchError> {
    status.parse().map_err(BatchError::Repository)
}

fn parse_time(time: &str) -> Result<DateTime<Utc>, BatchError> {
    DateTime::parse_from_rfc3339(time)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|error| BatchError::Repository(format!("invalid timestamp '{}': {}", time, error)))
}

fn parse_optional_time(time: Option<String>) -> Result<Option<DateTime<Utc>>, BatchError> {
    time.as_deref().map(parse_time).transpose()
}

fn db_error(error: sqlx::Error) -> BatchError {
    BatchError::Repository(format!("SQLite: {}", error))
}

/// Unique violations on instance or running-execution rows mean another
/// launch of the same instance won the race.
fn insert_error(job_name: &str, error: sqlx::Error) -> BatchError {
    if let sqlx::Error::Database(database_error) = &error {
        if database_error.is_unique_violation() {
            return BatchError::DuplicateJob(job_name.to_string());
        }
    }
    db_error(error)
}
