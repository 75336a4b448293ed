//! SQLite-based persistence store

use crate::core::job::{CheckpointId, Job, JobId};
use crate::persistence::{Checkpoint, JobBackend, JobFilter, Snapshot};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, tenant_id, job_type, state, progress, stage, stage_order, params, result, \
                           error, manifest, max_runtime_secs, created_at, started_at, finished_at";

const CHECKPOINT_COLUMNS: &str = "id, job_id, stage, stage_order, schema_version, payload, digest, created_at";

/// SQLite job and checkpoint store
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Open (creating if needed) the database at `db_path`; `:memory:` is supported
    pub async fn new(db_path: &str) -> Result<Self> {
        let in_memory = db_path == ":memory:";
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path))
            .context("Invalid database path")?
            .create_if_missing(true);

        // Every connection to :memory: is a separate database
        let max_connections = if in_memory { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let db_path = path
            .to_str()
            .with_context(|| format!("Database path is not valid UTF-8: {}", path.display()))?;
        Self::new(db_path).await
    }

    /// Create store with default path
    pub async fn with_default_path() -> Result<Self> {
        Self::open(default_database_path()).await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                job_type TEXT NOT NULL,
                state TEXT NOT NULL,
                progress REAL NOT NULL DEFAULT 0.0,
                stage TEXT,
                stage_order INTEGER,
                params TEXT NOT NULL,
                result TEXT,
                error TEXT,
                manifest TEXT,
                max_runtime_secs INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_tenant ON jobs(tenant_id);
            CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
            CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);

            CREATE TABLE IF NOT EXISTS checkpoints (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id),
                stage TEXT NOT NULL,
                stage_order INTEGER NOT NULL,
                schema_version INTEGER NOT NULL,
                payload TEXT NOT NULL,
                digest TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_checkpoints_job_order
                ON checkpoints(job_id, stage_order);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize schema")?;

        Ok(())
    }

    /// Convert DateTime<Utc> to NaiveDateTime for SQLite
    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    /// Convert NaiveDateTime to DateTime<Utc>
    fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(dt, Utc)
    }

    async fn checkpoint_ids(&self, job_id: JobId) -> Result<Vec<CheckpointId>> {
        let rows = sqlx::query("SELECT id FROM checkpoints WHERE job_id = ?1 ORDER BY stage_order ASC")
            .bind(job_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context("Failed to list checkpoint ids")?;

        rows.iter()
            .map(|row| Uuid::parse_str(&row.get::<String, _>("id")).map_err(anyhow::Error::from))
            .collect()
    }

    async fn with_checkpoint_ids(&self, mut job: Job) -> Result<Job> {
        job.checkpoints = self.checkpoint_ids(job.id).await?;
        Ok(job)
    }
}

/// `<data dir>/jobflow/jobs.db`
pub fn default_database_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("jobflow")
        .join("jobs.db")
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("Failed to serialize column")
}

fn to_json_opt<T: Serialize>(value: &Option<T>) -> Result<Option<String>> {
    value.as_ref().map(to_json).transpose()
}

fn from_json_opt<T: DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<Option<T>> {
    row.get::<Option<String>, _>(column)
        .map(|text| serde_json::from_str(&text).with_context(|| format!("Invalid JSON in column {}", column)))
        .transpose()
}

fn row_to_job(row: &SqliteRow) -> Result<Job> {
    let params: String = row.get("params");
    Ok(Job {
        id: Uuid::parse_str(&row.get::<String, _>("id"))?,
        tenant_id: row.get("tenant_id"),
        job_type: row.get::<String, _>("job_type").parse()?,
        state: row.get::<String, _>("state").parse()?,
        progress: row.get("progress"),
        stage: row.get("stage"),
        stage_order: row.get::<Option<i64>, _>("stage_order").map(|order| order as u32),
        params: serde_json::from_str(&params).context("Invalid JSON in column params")?,
        result: from_json_opt(row, "result")?,
        error: from_json_opt(row, "error")?,
        manifest: from_json_opt(row, "manifest")?,
        max_runtime_secs: row.get::<i64, _>("max_runtime_secs") as u64,
        created_at: SqliteBackend::from_naive(row.get("created_at")),
        started_at: row.get::<Option<NaiveDateTime>, _>("started_at").map(SqliteBackend::from_naive),
        finished_at: row.get::<Option<NaiveDateTime>, _>("finished_at").map(SqliteBackend::from_naive),
        checkpoints: Vec::new(),
    })
}

fn row_to_checkpoint(row: &SqliteRow) -> Result<Checkpoint> {
    let payload: String = row.get("payload");
    Ok(Checkpoint {
        id: Uuid::parse_str(&row.get::<String, _>("id"))?,
        job_id: Uuid::parse_str(&row.get::<String, _>("job_id"))?,
        stage: row.get("stage"),
        stage_order: row.get::<i64, _>("stage_order") as u32,
        snapshot: Snapshot {
            schema_version: row.get::<i64, _>("schema_version") as u32,
            payload: serde_json::from_str(&payload).context("Invalid JSON in column payload")?,
            digest: row.get("digest"),
        },
        created_at: SqliteBackend::from_naive(row.get("created_at")),
    })
}

#[async_trait::async_trait]
impl JobBackend for SqliteBackend {
    async fn insert_job(&self, job: &Job) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO jobs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            JOB_COLUMNS
        ))
        .bind(job.id.to_string())
        .bind(&job.tenant_id)
        .bind(job.job_type.as_str())
        .bind(job.state.as_str())
        .bind(job.progress)
        .bind(&job.stage)
        .bind(job.stage_order.map(i64::from))
        .bind(to_json(&job.params)?)
        .bind(to_json_opt(&job.result)?)
        .bind(to_json_opt(&job.error)?)
        .bind(to_json_opt(&job.manifest)?)
        .bind(job.max_runtime_secs as i64)
        .bind(Self::to_naive(job.created_at))
        .bind(job.started_at.map(Self::to_naive))
        .bind(job.finished_at.map(Self::to_naive))
        .execute(&self.pool)
        .await
        .context("Failed to insert job")?;

        Ok(())
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        let outcome = sqlx::query(
            r#"
            UPDATE jobs
            SET state = ?2, progress = ?3, stage = ?4, stage_order = ?5, result = ?6,
                error = ?7, manifest = ?8, started_at = ?9, finished_at = ?10
            WHERE id = ?1
            "#,
        )
        .bind(job.id.to_string())
        .bind(job.state.as_str())
        .bind(job.progress)
        .bind(&job.stage)
        .bind(job.stage_order.map(i64::from))
        .bind(to_json_opt(&job.result)?)
        .bind(to_json_opt(&job.error)?)
        .bind(to_json_opt(&job.manifest)?)
        .bind(job.started_at.map(Self::to_naive))
        .bind(job.finished_at.map(Self::to_naive))
        .execute(&self.pool)
        .await
        .context("Failed to save job")?;

        if outcome.rows_affected() == 0 {
            anyhow::bail!("Job {} does not exist", job.id);
        }
        Ok(())
    }

    async fn load_job(&self, job_id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS))
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load job")?;

        match row {
            Some(row) => Ok(Some(self.with_checkpoint_ids(row_to_job(&row)?).await?)),
            None => Ok(None),
        }
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut query = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM jobs WHERE 1 = 1", JOB_COLUMNS));
        if let Some(tenant_id) = &filter.tenant_id {
            query.push(" AND tenant_id = ").push_bind(tenant_id.clone());
        }
        if let Some(job_type) = filter.job_type {
            query.push(" AND job_type = ").push_bind(job_type.as_str());
        }
        if !filter.states.is_empty() {
            query.push(" AND state IN (");
            let mut states = query.separated(", ");
            for state in &filter.states {
                states.push_bind(state.as_str());
            }
            states.push_unseparated(")");
        }
        query.push(" ORDER BY created_at DESC, rowid DESC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .context("Failed to list jobs")?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            jobs.push(self.with_checkpoint_ids(row_to_job(row)?).await?);
        }
        Ok(jobs)
    }

    async fn append_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO checkpoints ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            CHECKPOINT_COLUMNS
        ))
        .bind(checkpoint.id.to_string())
        .bind(checkpoint.job_id.to_string())
        .bind(&checkpoint.stage)
        .bind(checkpoint.stage_order as i64)
        .bind(checkpoint.snapshot.schema_version as i64)
        .bind(to_json(&checkpoint.snapshot.payload)?)
        .bind(&checkpoint.snapshot.digest)
        .bind(Self::to_naive(checkpoint.created_at))
        .execute(&self.pool)
        .await
        .context("Failed to append checkpoint")?;

        Ok(())
    }

    async fn list_checkpoints(&self, job_id: JobId) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM checkpoints WHERE job_id = ?1 ORDER BY stage_order ASC",
            CHECKPOINT_COLUMNS
        ))
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list checkpoints")?;

        rows.iter().map(row_to_checkpoint).collect()
    }

    async fn load_checkpoint(&self, checkpoint_id: CheckpointId) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(&format!("SELECT {} FROM checkpoints WHERE id = ?1", CHECKPOINT_COLUMNS))
            .bind(checkpoint_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load checkpoint")?;

        row.as_ref().map(row_to_checkpoint).transpose()
    }
}
