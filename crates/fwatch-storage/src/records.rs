//! Job record store: the contract the ingestion run needs plus SQLite and in-memory
//! implementations.

use std::collections::BTreeSet;
use std::str::FromStr;

use async_trait::async_trait;
use fwatch_core::JobRecord;
use serde::{Deserialize, Serialize};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;

static MIGRATOR: Migrator = sqlx::migrate!();

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("running migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("job {0} is already stored")]
    Duplicate(String),
    #[error("job {0} not found")]
    NotFound(String),
}

/// Aggregate counts over the whole store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total: usize,
    pub with_description: usize,
    pub verified_records: usize,
    pub unverified_records: usize,
    /// Distinct standard names among verified rows.
    pub verified_facilities: usize,
    /// Distinct raw names among unverified rows that have one.
    pub unverified_facilities: usize,
}

impl StoreStats {
    pub fn from_records(records: &[JobRecord]) -> Self {
        let verified_records = records.iter().filter(|r| r.verified_facility).count();
        Self {
            total: records.len(),
            with_description: records.iter().filter(|r| has_description(r)).count(),
            verified_records,
            unverified_records: records.len() - verified_records,
            verified_facilities: verified_facility_names(records).len(),
            unverified_facilities: unverified_facility_names(records).len(),
        }
    }
}

/// Keyed on `job_id`. Identifying fields are write-once; only the description and
/// facility columns change after insert.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn exists(&self, job_id: &str) -> Result<bool, StoreError>;

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError>;

    async fn insert(&self, record: &JobRecord) -> Result<(), StoreError>;

    async fn update_description_and_facility(
        &self,
        job_id: &str,
        description: &str,
        raw: Option<&str>,
        standard: Option<&str>,
        verified: bool,
    ) -> Result<(), StoreError>;

    async fn update_description(&self, job_id: &str, description: &str) -> Result<(), StoreError>;

    /// Ids of rows whose description is still null or empty, in insertion order.
    async fn missing_description_ids(&self) -> Result<Vec<String>, StoreError>;

    async fn all_records(&self) -> Result<Vec<JobRecord>, StoreError>;

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.all_records().await?.len())
    }

    /// `(job_id, description)` for every row with a non-null description.
    async fn all_descriptions(&self) -> Result<Vec<(String, String)>, StoreError> {
        Ok(self
            .all_records()
            .await?
            .into_iter()
            .filter_map(|r| r.description.map(|d| (r.job_id, d)))
            .collect())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        Ok(StoreStats::from_records(&self.all_records().await?))
    }

    /// Distinct non-null raw facility names, sorted.
    async fn distinct_raw_facilities(&self) -> Result<Vec<String>, StoreError> {
        let names = self
            .all_records()
            .await?
            .into_iter()
            .filter_map(|r| r.facility_name_raw)
            .collect::<BTreeSet<_>>();
        Ok(names.into_iter().collect())
    }

    async fn verified_facility_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(verified_facility_names(&self.all_records().await?))
    }

    async fn unverified_facility_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(unverified_facility_names(&self.all_records().await?))
    }
}

fn has_description(record: &JobRecord) -> bool {
    record.description.as_deref().is_some_and(|d| !d.is_empty())
}

fn verified_facility_names(records: &[JobRecord]) -> Vec<String> {
    records
        .iter()
        .filter(|r| r.verified_facility)
        .filter_map(|r| r.facility_name_standard.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn unverified_facility_names(records: &[JobRecord]) -> Vec<String> {
    records
        .iter()
        .filter(|r| !r.verified_facility)
        .filter_map(|r| r.facility_name_raw.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// SQLite-backed store. A single connection is held for the run's lifetime.
#[derive(Debug, Clone)]
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn count_where(&self, sql: &str) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar(sql).fetch_one(&self.pool).await?;
        Ok(count as usize)
    }
}

fn record_from_row(row: &SqliteRow) -> Result<JobRecord, sqlx::Error> {
    Ok(JobRecord {
        job_id: row.try_get("job_id")?,
        title: row.try_get("title")?,
        url: row.try_get("url")?,
        location: row.try_get("location")?,
        posted_date: row.try_get("posted_date")?,
        description: row.try_get("description")?,
        facility_name_raw: row.try_get("facility_name_raw")?,
        facility_name_standard: row.try_get("facility_name_standard")?,
        verified_facility: row.try_get("verified_facility")?,
    })
}

const SELECT_RECORD: &str = "SELECT job_id, title, url, location, posted_date, description, \
     facility_name_raw, facility_name_standard, verified_facility FROM jobs";

fn ensure_updated(rows_affected: u64, job_id: &str) -> Result<(), StoreError> {
    if rows_affected == 0 {
        Err(StoreError::NotFound(job_id.to_string()))
    } else {
        Ok(())
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn exists(&self, job_id: &str) -> Result<bool, StoreError> {
        let found = sqlx::query("SELECT 1 FROM jobs WHERE job_id = ?1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query(&format!("{SELECT_RECORD} WHERE job_id = ?1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(record_from_row).transpose()?)
    }

    async fn insert(&self, record: &JobRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO jobs (job_id, title, url, location, posted_date, description, \
             facility_name_raw, facility_name_standard, verified_facility) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&record.job_id)
        .bind(&record.title)
        .bind(&record.url)
        .bind(&record.location)
        .bind(&record.posted_date)
        .bind(&record.description)
        .bind(&record.facility_name_raw)
        .bind(&record.facility_name_standard)
        .bind(record.verified_facility)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Duplicate(record.job_id.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update_description_and_facility(
        &self,
        job_id: &str,
        description: &str,
        raw: Option<&str>,
        standard: Option<&str>,
        verified: bool,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET description = ?1, facility_name_raw = ?2, \
             facility_name_standard = ?3, verified_facility = ?4 WHERE job_id = ?5",
        )
        .bind(description)
        .bind(raw)
        .bind(standard)
        .bind(verified)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        ensure_updated(result.rows_affected(), job_id)
    }

    async fn update_description(&self, job_id: &str, description: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE jobs SET description = ?1 WHERE job_id = ?2")
            .bind(description)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        ensure_updated(result.rows_affected(), job_id)
    }

    async fn missing_description_ids(&self) -> Result<Vec<String>, StoreError> {
        let ids = sqlx::query_scalar(
            "SELECT job_id FROM jobs WHERE description IS NULL OR description = '' ORDER BY rowid",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn all_records(&self) -> Result<Vec<JobRecord>, StoreError> {
        let rows = sqlx::query(&format!("{SELECT_RECORD} ORDER BY rowid"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        self.count_where("SELECT COUNT(*) FROM jobs").await
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let total = self.count().await?;
        let verified_records = self
            .count_where("SELECT COUNT(*) FROM jobs WHERE verified_facility = 1")
            .await?;
        Ok(StoreStats {
            total,
            with_description: self
                .count_where(
                    "SELECT COUNT(*) FROM jobs WHERE description IS NOT NULL AND description != ''",
                )
                .await?,
            verified_records,
            unverified_records: total - verified_records,
            verified_facilities: self
                .count_where(
                    "SELECT COUNT(DISTINCT facility_name_standard) FROM jobs \
                     WHERE verified_facility = 1",
                )
                .await?,
            unverified_facilities: self
                .count_where(
                    "SELECT COUNT(DISTINCT facility_name_raw) FROM jobs \
                     WHERE verified_facility = 0 AND facility_name_raw IS NOT NULL",
                )
                .await?,
        })
    }
}

/// In-process store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    rows: Mutex<Vec<JobRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<JobRecord>) -> Self {
        Self {
            rows: Mutex::new(records),
        }
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn exists(&self, job_id: &str) -> Result<bool, StoreError> {
        Ok(self.rows.lock().await.iter().any(|r| r.job_id == job_id))
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .find(|r| r.job_id == job_id)
            .cloned())
    }

    async fn insert(&self, record: &JobRecord) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        if rows.iter().any(|r| r.job_id == record.job_id) {
            return Err(StoreError::Duplicate(record.job_id.clone()));
        }
        rows.push(record.clone());
        Ok(())
    }

    async fn update_description_and_facility(
        &self,
        job_id: &str,
        description: &str,
        raw: Option<&str>,
        standard: Option<&str>,
        verified: bool,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .iter_mut()
            .find(|r| r.job_id == job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
        row.description = Some(description.to_string());
        row.facility_name_raw = raw.map(ToString::to_string);
        row.facility_name_standard = standard.map(ToString::to_string);
        row.verified_facility = verified;
        Ok(())
    }

    async fn update_description(&self, job_id: &str, description: &str) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .iter_mut()
            .find(|r| r.job_id == job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
        row.description = Some(description.to_string());
        Ok(())
    }

    async fn missing_description_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .filter(|r| !has_description(r))
            .map(|r| r.job_id.clone())
            .collect())
    }

    async fn all_records(&self) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self.rows.lock().await.clone())
    }
}
