//! Ingestion run orchestration, roster maintenance and store inspection.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use fwatch_adapters::{
    CareersApiSource, CareersHtmlSource, FixturePostingSource, PostingSource, SourceError,
};
use fwatch_core::{
    extract, extract_from_title, normalize, roster, CanonicalRoster, JobRecord, Posting, RosterError,
    CROSSCHECK_THRESHOLD, PIPELINE_THRESHOLD,
};
use fwatch_storage::{
    HttpClientConfig, HttpFetcher, RecordStore, SqliteRecordStore, StoreError, StoreStats,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fwatch-sync";

/// Lower bound on the pause between consecutive detail requests.
pub const MIN_DETAIL_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Api,
    Html,
    Fixture,
}

impl FromStr for SourceKind {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "api" => Ok(Self::Api),
            "html" => Ok(Self::Html),
            "fixture" => Ok(Self::Fixture),
            other => Err(SyncError::Config(format!(
                "unknown posting source {other:?} (expected api, html or fixture)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub roster_path: PathBuf,
    pub source: SourceKind,
    pub listing_url: Option<String>,
    pub detail_url_template: Option<String>,
    pub fixture_path: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub detail_delay: Duration,
    pub match_threshold: f64,
    pub crosscheck_threshold: f64,
    pub backfill_descriptions: bool,
    pub reports_dir: Option<PathBuf>,
    pub scheduler_cron: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://jobs.db".to_string(),
            roster_path: PathBuf::from("clean_prisons.txt"),
            source: SourceKind::Api,
            listing_url: None,
            detail_url_template: None,
            fixture_path: None,
            user_agent: "fwatch-bot/0.1".to_string(),
            http_timeout_secs: 20,
            detail_delay: MIN_DETAIL_DELAY,
            match_threshold: PIPELINE_THRESHOLD,
            crosscheck_threshold: CROSSCHECK_THRESHOLD,
            backfill_descriptions: true,
            reports_dir: None,
            scheduler_cron: "0 0 6 * * *".to_string(),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parsed<T: FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.trim().parse().ok())
}

/// Configured detail delay, never below `MIN_DETAIL_DELAY`.
pub fn detail_delay_from_millis(millis: u64) -> Duration {
    Duration::from_millis(millis).max(MIN_DETAIL_DELAY)
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, SyncError> {
        let defaults = Self::default();
        let source = match env_string("FWATCH_SOURCE") {
            Some(value) => value.parse()?,
            None => defaults.source,
        };
        Ok(Self {
            database_url: env_string("DATABASE_URL").unwrap_or(defaults.database_url),
            roster_path: env_string("FWATCH_ROSTER_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.roster_path),
            source,
            listing_url: env_string("FWATCH_LISTING_URL"),
            detail_url_template: env_string("FWATCH_DETAIL_URL_TEMPLATE"),
            fixture_path: env_string("FWATCH_FIXTURE_PATH").map(PathBuf::from),
            user_agent: env_string("FWATCH_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parsed("FWATCH_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            detail_delay: env_parsed("FWATCH_DETAIL_DELAY_MS")
                .map(detail_delay_from_millis)
                .unwrap_or(defaults.detail_delay),
            match_threshold: env_parsed("FWATCH_MATCH_THRESHOLD")
                .unwrap_or(defaults.match_threshold),
            crosscheck_threshold: env_parsed("FWATCH_CROSSCHECK_THRESHOLD")
                .unwrap_or(defaults.crosscheck_threshold),
            backfill_descriptions: env_string("FWATCH_BACKFILL_DESCRIPTIONS")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.backfill_descriptions),
            reports_dir: env_string("FWATCH_REPORTS_DIR").map(PathBuf::from),
            scheduler_cron: env_string("FWATCH_SCHEDULER_CRON").unwrap_or(defaults.scheduler_cron),
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("posting source unavailable: {0}")]
    SourceUnavailable(#[source] SourceError),
    #[error("detail fetch failed for {job_id}: {source}")]
    DetailFetchFailed {
        job_id: String,
        #[source]
        source: SourceError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Roster(#[from] RosterError),
    #[error("configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn required<'a>(value: &'a Option<String>, key: &str, source: SourceKind) -> Result<&'a str, SyncError> {
    value
        .as_deref()
        .ok_or_else(|| SyncError::Config(format!("{key} is required for the {source:?} source")))
}

/// Posting source selected by `config.source`.
pub fn build_source(config: &SyncConfig) -> Result<Box<dyn PostingSource>, SyncError> {
    match config.source {
        SourceKind::Fixture => {
            let path = config.fixture_path.as_ref().ok_or_else(|| {
                SyncError::Config("FWATCH_FIXTURE_PATH is required for the fixture source".into())
            })?;
            Ok(Box::new(FixturePostingSource::load(path)?))
        }
        kind @ (SourceKind::Api | SourceKind::Html) => {
            let listing_url = required(&config.listing_url, "FWATCH_LISTING_URL", kind)?;
            let detail_template =
                required(&config.detail_url_template, "FWATCH_DETAIL_URL_TEMPLATE", kind)?;
            let http = HttpFetcher::new(config.http_client_config())?;
            Ok(match kind {
                SourceKind::Html => Box::new(CareersHtmlSource::new(http, listing_url, detail_template)),
                _ => Box::new(CareersApiSource::new(http, listing_url, detail_template)),
            })
        }
    }
}

/// Run-end counts. `stats` describes the whole store after the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub listed: usize,
    pub new: usize,
    pub duplicates: usize,
    pub new_verified: usize,
    pub new_unverified: usize,
    pub new_without_facility: usize,
    pub descriptions_updated: usize,
    pub facilities_from_description: usize,
    pub detail_failures: usize,
    pub store_failures: usize,
    pub stats: StoreStats,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {} ({})", self.run_id, self.source_id)?;
        writeln!(f, "Postings listed: {}", self.listed)?;
        writeln!(
            f,
            "New jobs: {} ({} verified, {} unverified, {} without facility)",
            self.new, self.new_verified, self.new_unverified, self.new_without_facility
        )?;
        writeln!(f, "Already stored: {}", self.duplicates)?;
        writeln!(f, "Descriptions updated: {}", self.descriptions_updated)?;
        writeln!(f, "Detail fetch failures: {}", self.detail_failures)?;
        writeln!(f, "Store failures: {}", self.store_failures)?;
        writeln!(f, "Total jobs in store: {}", self.stats.total)?;
        writeln!(f, "Verified records: {}", self.stats.verified_records)?;
        writeln!(f, "Unverified records: {}", self.stats.unverified_records)?;
        writeln!(f, "Verified facilities: {}", self.stats.verified_facilities)?;
        write!(f, "Unverified facilities: {}", self.stats.unverified_facilities)
    }
}

enum Ingested {
    Duplicate,
    New { record: JobRecord, score: f64 },
}

enum Enrichment {
    DescriptionOnly,
    WithFacility { found: bool },
}

/// One posting source, one record store, one roster. Runs never overlap.
pub struct SyncPipeline {
    config: SyncConfig,
    source: Box<dyn PostingSource>,
    store: Box<dyn RecordStore>,
    roster: CanonicalRoster,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        source: Box<dyn PostingSource>,
        store: Box<dyn RecordStore>,
        roster: CanonicalRoster,
    ) -> Self {
        Self {
            config,
            source,
            store,
            roster,
            run_lock: Mutex::new(()),
        }
    }

    pub async fn from_config(config: SyncConfig) -> Result<Self, SyncError> {
        let roster = CanonicalRoster::load(&config.roster_path)?;
        if roster.is_empty() {
            warn!(path = %config.roster_path.display(), "canonical roster is empty; nothing will verify");
        }
        let store = SqliteRecordStore::connect(&config.database_url).await?;
        let source = build_source(&config)?;
        info!(
            roster = roster.len(),
            source = source.source_id(),
            database = %config.database_url,
            "sync pipeline ready"
        );
        Ok(Self::new(config, source, Box::new(store), roster))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn RecordStore {
        self.store.as_ref()
    }

    pub fn roster(&self) -> &CanonicalRoster {
        &self.roster
    }

    pub async fn run_once(&self) -> Result<RunSummary, SyncError> {
        let _guard = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, source = self.source.source_id());
        let summary = self.run_inner(run_id).instrument(span).await?;

        if let Some(reports_dir) = &self.config.reports_dir {
            let dir = write_run_reports(reports_dir, &summary).await?;
            info!(run_id = %summary.run_id, dir = %dir.display(), "run reports written");
        }
        Ok(summary)
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<RunSummary, SyncError> {
        let started_at = Utc::now();
        let postings = self.source.list_postings().await.map_err(|err| {
            error!(error = %err, "listing fetch failed; aborting run");
            SyncError::SourceUnavailable(err)
        })?;
        info!(count = postings.len(), "postings listed");

        let mut summary = RunSummary {
            run_id,
            source_id: self.source.source_id().to_string(),
            started_at,
            finished_at: started_at,
            listed: postings.len(),
            new: 0,
            duplicates: 0,
            new_verified: 0,
            new_unverified: 0,
            new_without_facility: 0,
            descriptions_updated: 0,
            facilities_from_description: 0,
            detail_failures: 0,
            store_failures: 0,
            stats: StoreStats::default(),
        };

        let mut pending = Vec::new();
        for posting in &postings {
            let record = match self.ingest(posting).await {
                Ok(Ingested::Duplicate) => {
                    debug!(job_id = %posting.id, "already stored");
                    summary.duplicates += 1;
                    continue;
                }
                Ok(Ingested::New { record, score }) => {
                    info!(
                        job_id = %record.job_id,
                        title = %record.title,
                        facility = %record.facility_status(),
                        score,
                        "new job"
                    );
                    record
                }
                Err(err) => {
                    error!(job_id = %posting.id, error = %err, "storing posting failed");
                    summary.store_failures += 1;
                    continue;
                }
            };
            match (record.verified_facility, record.facility_name_raw.is_some()) {
                (true, _) => summary.new_verified += 1,
                (false, true) => summary.new_unverified += 1,
                (false, false) => summary.new_without_facility += 1,
            }
            summary.new += 1;
            pending.push(record.job_id);
        }
        info!(new = summary.new, duplicates = summary.duplicates, "listing ingested");

        if self.config.backfill_descriptions {
            let mut seen = pending.iter().cloned().collect::<HashSet<_>>();
            for job_id in self.store.missing_description_ids().await? {
                if seen.insert(job_id.clone()) {
                    pending.push(job_id);
                }
            }
        }
        if pending.is_empty() {
            info!("no descriptions to fetch");
        } else {
            info!(count = pending.len(), "fetching descriptions");
        }

        for (index, job_id) in pending.iter().enumerate() {
            if index > 0 && !self.config.detail_delay.is_zero() {
                tokio::time::sleep(self.config.detail_delay).await;
            }
            match self.enrich(job_id).await {
                Ok(Some(outcome)) => {
                    summary.descriptions_updated += 1;
                    if let Enrichment::WithFacility { found: true } = outcome {
                        summary.facilities_from_description += 1;
                    }
                }
                Ok(None) => {}
                Err(err @ SyncError::DetailFetchFailed { .. }) => {
                    warn!(error = %err, "will retry next run");
                    summary.detail_failures += 1;
                }
                Err(err) => {
                    error!(job_id = %job_id, error = %err, "attaching description failed");
                    summary.store_failures += 1;
                }
            }
        }

        summary.stats = self.store.stats().await?;
        summary.finished_at = Utc::now();
        info!(
            new = summary.new,
            descriptions = summary.descriptions_updated,
            detail_failures = summary.detail_failures,
            store_failures = summary.store_failures,
            total = summary.stats.total,
            "run complete"
        );
        Ok(summary)
    }

    /// Insert a posting not seen before, classified by its title.
    async fn ingest(&self, posting: &Posting) -> Result<Ingested, StoreError> {
        if self.store.exists(&posting.id).await? {
            return Ok(Ingested::Duplicate);
        }
        let candidate = extract_from_title(&posting.title);
        let matched = self
            .roster
            .best_match(candidate.as_deref(), self.config.match_threshold);
        let record = JobRecord::from_posting(posting, candidate, &matched);
        self.store.insert(&record).await?;
        Ok(Ingested::New {
            record,
            score: matched.score,
        })
    }

    /// Attach a description. A row whose title produced no candidate is re-extracted
    /// from the description and its facility fields rewritten; otherwise only the
    /// description changes.
    async fn enrich(&self, job_id: &str) -> Result<Option<Enrichment>, SyncError> {
        let detail = self
            .source
            .get_detail(job_id)
            .await
            .map_err(|source| SyncError::DetailFetchFailed {
                job_id: job_id.to_string(),
                source,
            })?;
        let description = normalize(&detail.description);

        let Some(record) = self.store.get(job_id).await? else {
            warn!(job_id, "row vanished before enrichment");
            return Ok(None);
        };

        if record.facility_name_raw.is_some() {
            self.store.update_description(job_id, &description).await?;
            debug!(job_id, "description attached");
            return Ok(Some(Enrichment::DescriptionOnly));
        }

        let candidate = extract(&record.title, Some(&description));
        let matched = self
            .roster
            .best_match(candidate.as_deref(), self.config.match_threshold);
        self.store
            .update_description_and_facility(
                job_id,
                &description,
                candidate.as_deref(),
                matched.standard_name.as_deref(),
                matched.verified,
            )
            .await?;
        if let Some(candidate) = &candidate {
            info!(job_id, facility = %candidate, verified = matched.verified, "facility found in description");
        }
        Ok(Some(Enrichment::WithFacility {
            found: candidate.is_some(),
        }))
    }
}

pub async fn run_sync_once_from_env() -> Result<RunSummary, SyncError> {
    let pipeline = SyncPipeline::from_config(SyncConfig::from_env()?).await?;
    pipeline.run_once().await
}

/// Scheduler that triggers `run_once` on `cron` (six-field, seconds first).
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>, cron: &str) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(run_id = %summary.run_id, new = summary.new, "scheduled sync finished"),
                Err(err) => error!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// `<reports_dir>/<run_id>/run_summary.json` and `summary.md`.
pub async fn write_run_reports(reports_dir: &Path, summary: &RunSummary) -> anyhow::Result<PathBuf> {
    let dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;

    let markdown = format!(
        "# Facility Watch Run\n\n- Run ID: `{}`\n- Source: {}\n- Started: {}\n- Finished: {}\n\n## Counts\n\n{}\n",
        summary.run_id,
        summary.source_id,
        summary.started_at,
        summary.finished_at,
        summary
            .to_string()
            .lines()
            .skip(1)
            .map(|line| format!("- {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    );
    fs::write(dir.join("summary.md"), markdown)
        .await
        .context("writing summary.md")?;
    Ok(dir)
}

/// Read a raw facility list, build the roster and write it in roster file format.
/// Returns the number of facilities written.
pub async fn build_roster_file(input: &Path, output: &Path) -> anyhow::Result<usize> {
    let raw = fs::read_to_string(input)
        .await
        .with_context(|| format!("reading {}", input.display()))?;
    let entries = roster::build(&raw);
    fs::write(output, roster::render(&entries))
        .await
        .with_context(|| format!("writing {}", output.display()))?;
    info!(facilities = entries.len(), output = %output.display(), "roster written");
    Ok(entries.len())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrosscheckEntry {
    pub raw: String,
    pub matched: Option<String>,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrosscheckReport {
    pub threshold: f64,
    pub entries: Vec<CrosscheckEntry>,
}

impl CrosscheckReport {
    pub fn matched_count(&self) -> usize {
        self.entries.iter().filter(|e| e.matched.is_some()).count()
    }
}

impl fmt::Display for CrosscheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== FACILITY MATCHING RESULTS ===\n")?;
        for entry in &self.entries {
            match &entry.matched {
                Some(name) => {
                    writeln!(f, "\u{2713} {}", entry.raw)?;
                    writeln!(f, "  -> {} ({:.2})", name, entry.score)?;
                }
                None => {
                    writeln!(f, "\u{2717} {}", entry.raw)?;
                    writeln!(f, "  -> No match found")?;
                }
            }
            writeln!(f)?;
        }
        write!(
            f,
            "Matched: {}/{} facilities",
            self.matched_count(),
            self.entries.len()
        )
    }
}

/// Match every distinct stored raw facility name against the roster.
pub async fn crosscheck(
    store: &dyn RecordStore,
    roster: &CanonicalRoster,
    threshold: f64,
) -> Result<CrosscheckReport, StoreError> {
    let entries = store
        .distinct_raw_facilities()
        .await?
        .into_iter()
        .map(|raw| {
            let result = roster.best_match(Some(&raw), threshold);
            CrosscheckEntry {
                raw,
                matched: result.standard_name,
                score: result.score,
            }
        })
        .collect();
    Ok(CrosscheckReport { threshold, entries })
}

/// Re-normalize stored descriptions; returns how many rows changed.
pub async fn clean_descriptions(store: &dyn RecordStore) -> Result<usize, StoreError> {
    let mut cleaned = 0;
    for (job_id, description) in store.all_descriptions().await? {
        let normalized = normalize(&description);
        if normalized != description {
            store.update_description(&job_id, &normalized).await?;
            cleaned += 1;
        }
    }
    info!(cleaned, "descriptions cleaned");
    Ok(cleaned)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreReport {
    pub stats: StoreStats,
    pub verified_facilities: Vec<String>,
    pub unverified_facilities: Vec<String>,
}

impl fmt::Display for StoreReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== DATABASE SUMMARY ===")?;
        writeln!(f, "Total jobs: {}", self.stats.total)?;
        writeln!(f, "Jobs with descriptions: {}", self.stats.with_description)?;
        writeln!(f, "Verified records: {}", self.stats.verified_records)?;
        writeln!(f, "Unverified records: {}", self.stats.unverified_records)?;
        writeln!(f, "Verified facilities: {}", self.stats.verified_facilities)?;
        writeln!(f, "Unverified facilities: {}", self.stats.unverified_facilities)?;
        writeln!(f, "\n=== VERIFIED FACILITIES ===")?;
        for name in &self.verified_facilities {
            writeln!(f, "- {name}")?;
        }
        write!(f, "\n=== UNVERIFIED FACILITIES ===")?;
        for name in &self.unverified_facilities {
            write!(f, "\n- {name}")?;
        }
        Ok(())
    }
}

pub async fn store_report(store: &dyn RecordStore) -> Result<StoreReport, StoreError> {
    Ok(StoreReport {
        stats: store.stats().await?,
        verified_facilities: store.verified_facility_names().await?,
        unverified_facilities: store.unverified_facility_names().await?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fwatch_adapters::FixtureListing;
    use fwatch_core::{FacilityStatus, PostingDetail};
    use fwatch_storage::MemoryRecordStore;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;
    use tokio::time::Instant;

    fn roster() -> CanonicalRoster {
        CanonicalRoster::new(vec![
            "Example County Jail".to_string(),
            "Riverbend Correctional Facility".to_string(),
            "Lake Erie Correctional Institution".to_string(),
        ])
    }

    fn posting(id: &str, title: &str) -> Posting {
        Posting {
            id: id.to_string(),
            title: title.to_string(),
            city: "Springfield".to_string(),
            state: "IL".to_string(),
            posted_at: Some("2026-03-02".to_string()),
            url: format!("https://careers.example.com/job-details?req_id={id}"),
        }
    }

    fn fixture_source() -> FixturePostingSource {
        let details = HashMap::from([
            (
                "1".to_string(),
                "<p>Prepare meals at <b>Example County Jail</b>.</p>".to_string(),
            ),
            (
                "3".to_string(),
                "<p>Cook at   Lake Erie Correctional Institution.</p>".to_string(),
            ),
        ]);
        FixturePostingSource::new(FixtureListing {
            postings: vec![
                posting("1", "Cook - Example County Jail - WC - (110/125)"),
                posting("2", "Cashier - Harbor Street Market"),
                posting("3", "Line Cook"),
            ],
            details,
        })
    }

    fn config() -> SyncConfig {
        SyncConfig {
            detail_delay: Duration::ZERO,
            ..SyncConfig::default()
        }
    }

    fn pipeline(config: SyncConfig, source: impl PostingSource + 'static) -> SyncPipeline {
        SyncPipeline::new(config, Box::new(source), Box::new(MemoryRecordStore::new()), roster())
    }

    struct UnavailableSource;

    #[async_trait]
    impl PostingSource for UnavailableSource {
        fn source_id(&self) -> &'static str {
            "unavailable"
        }

        async fn list_postings(&self) -> Result<Vec<Posting>, SourceError> {
            Err(SourceError::Message("connection refused".to_string()))
        }

        async fn get_detail(&self, id: &str) -> Result<PostingDetail, SourceError> {
            Err(SourceError::MissingDetail(id.to_string()))
        }
    }

    /// Records when each detail request arrives.
    struct TimedSource {
        inner: FixturePostingSource,
        requests: Arc<StdMutex<Vec<Instant>>>,
    }

    #[async_trait]
    impl PostingSource for TimedSource {
        fn source_id(&self) -> &'static str {
            "timed"
        }

        async fn list_postings(&self) -> Result<Vec<Posting>, SourceError> {
            self.inner.list_postings().await
        }

        async fn get_detail(&self, id: &str) -> Result<PostingDetail, SourceError> {
            self.requests.lock().expect("requests lock").push(Instant::now());
            self.inner.get_detail(id).await
        }
    }

    /// Memory store whose description writes fail for one job id.
    struct FlakyStore {
        inner: MemoryRecordStore,
        broken_id: &'static str,
    }

    #[async_trait]
    impl RecordStore for FlakyStore {
        async fn exists(&self, job_id: &str) -> Result<bool, StoreError> {
            self.inner.exists(job_id).await
        }

        async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
            self.inner.get(job_id).await
        }

        async fn insert(&self, record: &JobRecord) -> Result<(), StoreError> {
            self.inner.insert(record).await
        }

        async fn update_description_and_facility(
            &self,
            job_id: &str,
            description: &str,
            raw: Option<&str>,
            standard: Option<&str>,
            verified: bool,
        ) -> Result<(), StoreError> {
            if job_id == self.broken_id {
                return Err(StoreError::NotFound(job_id.to_string()));
            }
            self.inner
                .update_description_and_facility(job_id, description, raw, standard, verified)
                .await
        }

        async fn update_description(&self, job_id: &str, description: &str) -> Result<(), StoreError> {
            if job_id == self.broken_id {
                return Err(StoreError::NotFound(job_id.to_string()));
            }
            self.inner.update_description(job_id, description).await
        }

        async fn missing_description_ids(&self) -> Result<Vec<String>, StoreError> {
            self.inner.missing_description_ids().await
        }

        async fn all_records(&self) -> Result<Vec<JobRecord>, StoreError> {
            self.inner.all_records().await
        }
    }

    #[test]
    fn source_kind_parses_case_insensitively() {
        assert_eq!("API".parse::<SourceKind>().expect("api"), SourceKind::Api);
        assert_eq!(" html ".parse::<SourceKind>().expect("html"), SourceKind::Html);
        assert!(matches!(
            "selenium".parse::<SourceKind>(),
            Err(SyncError::Config(_))
        ));
        assert!(parse_flag("true") && parse_flag("1") && !parse_flag("no"));
    }

    #[test]
    fn detail_delay_never_drops_below_floor() {
        assert_eq!(detail_delay_from_millis(0), MIN_DETAIL_DELAY);
        assert_eq!(detail_delay_from_millis(100), MIN_DETAIL_DELAY);
        assert_eq!(detail_delay_from_millis(1500), Duration::from_millis(1500));
        assert_eq!(SyncConfig::default().detail_delay, MIN_DETAIL_DELAY);
    }

    #[test]
    fn network_sources_require_urls() {
        let missing = build_source(&SyncConfig::default());
        assert!(matches!(missing, Err(SyncError::Config(msg)) if msg.contains("FWATCH_LISTING_URL")));

        let fixture = build_source(&SyncConfig {
            source: SourceKind::Fixture,
            ..SyncConfig::default()
        });
        assert!(matches!(fixture, Err(SyncError::Config(_))));
    }

    #[tokio::test]
    async fn run_classifies_new_postings_and_enriches_descriptions() {
        let pipeline = pipeline(config(), fixture_source());
        let summary = pipeline.run_once().await.expect("run");

        assert_eq!(summary.listed, 3);
        assert_eq!(summary.new, 3);
        assert_eq!(summary.duplicates, 0);
        assert_eq!(summary.new_verified, 1);
        assert_eq!(summary.new_unverified, 1);
        assert_eq!(summary.new_without_facility, 1);
        assert_eq!(summary.descriptions_updated, 2);
        assert_eq!(summary.facilities_from_description, 1);
        assert_eq!(summary.detail_failures, 1);

        let store = pipeline.store();
        let jail = store.get("1").await.expect("get").expect("row");
        assert_eq!(
            jail.facility_status(),
            FacilityStatus::Verified("Example County Jail".to_string())
        );
        assert_eq!(
            jail.description.as_deref(),
            Some("Prepare meals at Example County Jail.")
        );

        let market = store.get("2").await.expect("get").expect("row");
        assert_eq!(
            market.facility_status(),
            FacilityStatus::Unverified("Harbor Street Market".to_string())
        );
        assert_eq!(market.description, None);

        let line_cook = store.get("3").await.expect("get").expect("row");
        assert_eq!(
            line_cook.facility_name_raw.as_deref(),
            Some("Lake Erie Correctional Institution")
        );
        assert!(line_cook.verified_facility);
        assert_eq!(
            line_cook.description.as_deref(),
            Some("Cook at Lake Erie Correctional Institution.")
        );
    }

    #[tokio::test]
    async fn second_run_only_retries_missing_descriptions() {
        let pipeline = pipeline(config(), fixture_source());
        pipeline.run_once().await.expect("first run");
        let second = pipeline.run_once().await.expect("second run");

        assert_eq!(second.new, 0);
        assert_eq!(second.duplicates, 3);
        assert_eq!(second.descriptions_updated, 0);
        assert_eq!(second.detail_failures, 1);
        assert_eq!(second.stats.total, 3);
    }

    #[tokio::test]
    async fn backfill_can_be_disabled() {
        let pipeline = pipeline(
            SyncConfig {
                backfill_descriptions: false,
                ..config()
            },
            fixture_source(),
        );
        pipeline.run_once().await.expect("first run");
        let second = pipeline.run_once().await.expect("second run");
        assert_eq!(second.detail_failures, 0);
        assert_eq!(second.descriptions_updated, 0);
    }

    #[tokio::test]
    async fn listing_failure_aborts_without_writes() {
        let pipeline = pipeline(config(), UnavailableSource);
        let result = pipeline.run_once().await;
        assert!(matches!(result, Err(SyncError::SourceUnavailable(_))));
        assert_eq!(pipeline.store().count().await.expect("count"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn detail_requests_are_spaced_by_the_configured_delay() {
        let delay = Duration::from_secs(2);
        let requests = Arc::new(StdMutex::new(Vec::new()));
        let source = TimedSource {
            inner: fixture_source(),
            requests: Arc::clone(&requests),
        };
        let pipeline = pipeline(
            SyncConfig {
                detail_delay: delay,
                ..config()
            },
            source,
        );

        let started = Instant::now();
        let summary = pipeline.run_once().await.expect("run");
        assert_eq!(summary.descriptions_updated + summary.detail_failures, 3);

        let requests = requests.lock().expect("requests lock").clone();
        assert_eq!(requests.len(), 3);
        for pair in requests.windows(2) {
            assert!(pair[1] - pair[0] >= delay);
        }
        assert!(started.elapsed() >= delay * 2);
    }

    #[tokio::test]
    async fn store_failure_on_one_posting_does_not_stop_the_run() {
        let store = FlakyStore {
            inner: MemoryRecordStore::new(),
            broken_id: "1",
        };
        let pipeline = SyncPipeline::new(config(), Box::new(fixture_source()), Box::new(store), roster());

        let summary = pipeline.run_once().await.expect("run");
        assert_eq!(summary.new, 3);
        assert_eq!(summary.store_failures, 1);
        assert_eq!(summary.detail_failures, 1);
        assert_eq!(summary.descriptions_updated, 1);

        let store = pipeline.store();
        assert_eq!(store.get("1").await.expect("get").expect("row").description, None);
        assert_eq!(
            store.get("3").await.expect("get").expect("row").description.as_deref(),
            Some("Cook at Lake Erie Correctional Institution.")
        );
        assert!(summary.to_string().contains("Store failures: 1"));
    }

    #[tokio::test]
    async fn detail_failure_is_reported_with_its_job_id() {
        let err = SyncError::DetailFetchFailed {
            job_id: "2".to_string(),
            source: SourceError::MissingDetail("2".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "detail fetch failed for 2: no detail returned for posting 2"
        );

        let pipeline = pipeline(config(), fixture_source());
        let result = pipeline.enrich("2").await;
        assert!(matches!(
            result,
            Err(SyncError::DetailFetchFailed { job_id, .. }) if job_id == "2"
        ));
    }

    #[tokio::test]
    async fn description_without_facility_keeps_row_not_found() {
        let source = FixturePostingSource::new(FixtureListing {
            postings: vec![posting("9", "Line Cook")],
            details: HashMap::from([("9".to_string(), "Serve &amp; clean.".to_string())]),
        });
        let pipeline = pipeline(config(), source);
        let summary = pipeline.run_once().await.expect("run");
        assert_eq!(summary.descriptions_updated, 1);
        assert_eq!(summary.facilities_from_description, 0);

        let row = pipeline.store().get("9").await.expect("get").expect("row");
        assert_eq!(row.description.as_deref(), Some("Serve & clean."));
        assert_eq!(row.facility_status(), FacilityStatus::NotFound);
    }

    #[tokio::test]
    async fn reports_are_written_when_configured() {
        let dir = tempdir().expect("tempdir");
        let pipeline = pipeline(
            SyncConfig {
                reports_dir: Some(dir.path().join("reports")),
                ..config()
            },
            fixture_source(),
        );
        let summary = pipeline.run_once().await.expect("run");

        let run_dir = dir.path().join("reports").join(summary.run_id.to_string());
        let json = std::fs::read_to_string(run_dir.join("run_summary.json")).expect("summary json");
        let parsed: RunSummary = serde_json::from_str(&json).expect("parse summary");
        assert_eq!(parsed.new, 3);
        let markdown = std::fs::read_to_string(run_dir.join("summary.md")).expect("summary md");
        assert!(markdown.contains("- New jobs: 3"));
    }

    #[tokio::test]
    async fn crosscheck_uses_its_own_threshold() {
        let store = MemoryRecordStore::new();
        for (id, raw) in [
            ("1", "Example County Jail"),
            ("2", "Riverbend Corr Facility"),
            ("3", "Harbor Street Market"),
        ] {
            let record = JobRecord::from_posting(
                &posting(id, "Cook"),
                Some(raw.to_string()),
                &fwatch_core::MatchResult::unverified(0.0),
            );
            store.insert(&record).await.expect("insert");
        }

        let report = crosscheck(&store, &roster(), CROSSCHECK_THRESHOLD)
            .await
            .expect("crosscheck");
        assert_eq!(report.entries.len(), 3);
        assert_eq!(report.matched_count(), 2);
        assert!(report.to_string().ends_with("Matched: 2/3 facilities"));

        let strict = crosscheck(&store, &roster(), 0.99).await.expect("crosscheck");
        assert_eq!(strict.matched_count(), 1);
    }

    #[tokio::test]
    async fn clean_descriptions_only_touches_dirty_rows() {
        let mut dirty = JobRecord::from_posting(
            &posting("1", "Cook"),
            None,
            &fwatch_core::MatchResult::unverified(0.0),
        );
        dirty.description = Some("<p>Serve  meals</p>".to_string());
        let mut clean = dirty.clone();
        clean.job_id = "2".to_string();
        clean.description = Some("Serve meals".to_string());
        let store = MemoryRecordStore::with_records(vec![dirty, clean]);

        assert_eq!(clean_descriptions(&store).await.expect("clean"), 1);
        let row = store.get("1").await.expect("get").expect("row");
        assert_eq!(row.description.as_deref(), Some("Serve meals"));
        assert_eq!(clean_descriptions(&store).await.expect("clean again"), 0);
    }

    #[tokio::test]
    async fn store_report_lists_facilities() {
        let pipeline = pipeline(config(), fixture_source());
        pipeline.run_once().await.expect("run");
        let report = store_report(pipeline.store()).await.expect("report");
        assert_eq!(report.stats.total, 3);
        assert_eq!(
            report.verified_facilities,
            vec!["Example County Jail", "Lake Erie Correctional Institution"]
        );
        assert_eq!(report.unverified_facilities, vec!["Harbor Street Market"]);
        assert!(report.to_string().contains("Jobs with descriptions: 2"));
    }

    #[tokio::test]
    async fn roster_file_is_built_from_raw_source() {
        let fixtures = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/roster");
        let dir = tempdir().expect("tempdir");
        let output = dir.path().join("clean_prisons.txt");

        let written = build_roster_file(&fixtures.join("prisons.txt"), &output)
            .await
            .expect("build roster");
        assert_eq!(written, 3);

        let built = std::fs::read_to_string(&output).expect("read output");
        let expected =
            std::fs::read_to_string(fixtures.join("clean_prisons.txt")).expect("read expected");
        assert_eq!(built, expected);
    }
}
