//! Listing persistence (Postgres + in-memory) and HTTP fetch utilities for jobfeed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use jobfeed_core::{Employer, JobRecord};
use reqwest::StatusCode;
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "jobfeed-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    /// `key` is the row's natural key: a listing URL or an employer name.
    #[error("store rejected row {key}: {reason}")]
    RowRejected { key: String, reason: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store inconsistent: {0}")]
    Inconsistent(String),
    #[error(transparent)]
    Backend(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    /// True when only the offending row is bad and the rest of the batch can proceed.
    pub fn is_row_level(&self) -> bool {
        matches!(self, StoreError::RowRejected { .. })
    }
}

/// How a re-observed listing with unchanged content is written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ScrapedAtPolicy {
    /// Rewrite only on content change; otherwise just advance `scraped_at`.
    #[default]
    Touch,
    /// `scraped_at` takes part in the field diff like any other column.
    Diff,
}

impl FromStr for ScrapedAtPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "touch" => Ok(ScrapedAtPolicy::Touch),
            "diff" => Ok(ScrapedAtPolicy::Diff),
            other => Err(format!("unknown scraped_at policy `{other}` (expected touch|diff)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Content identical; only `scraped_at` moved forward.
    Touched,
    Unchanged,
}

impl UpsertOutcome {
    pub fn is_affected(self) -> bool {
        matches!(self, UpsertOutcome::Inserted | UpsertOutcome::Updated)
    }
}

/// Decides what an upsert does given the currently stored row.
pub fn plan_upsert(
    stored: Option<&JobRecord>,
    incoming: &JobRecord,
    policy: ScrapedAtPolicy,
) -> UpsertOutcome {
    let Some(stored) = stored else {
        return UpsertOutcome::Inserted;
    };
    if incoming.content_differs(stored) {
        return UpsertOutcome::Updated;
    }
    if incoming.scraped_at == stored.scraped_at {
        return UpsertOutcome::Unchanged;
    }
    match policy {
        ScrapedAtPolicy::Touch => UpsertOutcome::Touched,
        ScrapedAtPolicy::Diff => UpsertOutcome::Updated,
    }
}

#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn active_keywords(&self) -> Result<Vec<String>, StoreError>;

    /// Atomic insert-or-ignore on the unique name. Returns true if a row was created.
    async fn insert_employer_if_absent(&self, name: &str) -> Result<bool, StoreError>;

    async fn employer_ids(&self, names: &[String]) -> Result<HashMap<String, i64>, StoreError>;

    async fn upsert_job(
        &self,
        record: &JobRecord,
        policy: ScrapedAtPolicy,
    ) -> Result<UpsertOutcome, StoreError>;
}

const JOB_COLUMNS: [&str; 13] = [
    "listing_url",
    "site",
    "title",
    "title_key",
    "employer_id",
    "location",
    "description",
    "employment_type",
    "pay_interval",
    "pay_min",
    "pay_max",
    "posted_at",
    "scraped_at",
];

fn upsert_sql(policy: ScrapedAtPolicy) -> String {
    let placeholders = (1..=JOB_COLUMNS.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let updatable = &JOB_COLUMNS[1..];
    let assignments = updatable
        .iter()
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    let compared: Vec<&str> = match policy {
        ScrapedAtPolicy::Touch => updatable
            .iter()
            .copied()
            .filter(|c| *c != "scraped_at")
            .collect(),
        ScrapedAtPolicy::Diff => updatable.to_vec(),
    };
    let predicate = compared
        .iter()
        .map(|c| format!("jobs.{c} IS DISTINCT FROM EXCLUDED.{c}"))
        .collect::<Vec<_>>()
        .join(" OR ");
    format!(
        "INSERT INTO jobs ({}) VALUES ({placeholders}) \
         ON CONFLICT (listing_url) DO UPDATE SET {assignments} \
         WHERE {predicate} \
         RETURNING (xmax = 0) AS inserted",
        JOB_COLUMNS.join(", ")
    )
}

fn classify_sqlx_error(err: sqlx::Error, key: &str) -> StoreError {
    let row_level = match &err {
        // Class 22 is data exceptions, 23 integrity violations.
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| code.starts_with("22") || code.starts_with("23")),
        sqlx::Error::Encode(_) => true,
        _ => false,
    };
    if row_level {
        StoreError::RowRejected {
            key: key.to_string(),
            reason: err.to_string(),
        }
    } else {
        StoreError::Backend(err)
    }
}

/// Postgres-backed store. Every statement relies on the unique keys for
/// conflict resolution, so concurrent runs never duplicate rows.
#[derive(Debug, Clone)]
pub struct PgListingStore {
    pool: PgPool,
    upsert_touch_sql: Arc<str>,
    upsert_diff_sql: Arc<str>,
}

impl PgListingStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            upsert_touch_sql: upsert_sql(ScrapedAtPolicy::Touch).into(),
            upsert_diff_sql: upsert_sql(ScrapedAtPolicy::Diff).into(),
        }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to listing store")?;
        Ok(Self::from_pool(pool))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ListingStore for PgListingStore {
    async fn active_keywords(&self) -> Result<Vec<String>, StoreError> {
        let names = sqlx::query_scalar::<_, String>("SELECT name FROM keywords WHERE is_active = TRUE")
            .fetch_all(&self.pool)
            .await?;
        Ok(names)
    }

    async fn insert_employer_if_absent(&self, name: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("INSERT INTO employers (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error(e, name))?;
        Ok(result.rows_affected() == 1)
    }

    async fn employer_ids(&self, names: &[String]) -> Result<HashMap<String, i64>, StoreError> {
        if names.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query_as::<_, (i64, String)>("SELECT id, name FROM employers WHERE name = ANY($1)")
            .bind(names)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id, name)| (name, id)).collect())
    }

    async fn upsert_job(
        &self,
        record: &JobRecord,
        policy: ScrapedAtPolicy,
    ) -> Result<UpsertOutcome, StoreError> {
        let url = record.listing_url.as_str();
        let sql = match policy {
            ScrapedAtPolicy::Touch => &*self.upsert_touch_sql,
            ScrapedAtPolicy::Diff => &*self.upsert_diff_sql,
        };

        let mut tx = self.pool.begin().await?;
        let written = sqlx::query(sql)
            .bind(&record.listing_url)
            .bind(&record.site)
            .bind(&record.title)
            .bind(&record.title_key)
            .bind(record.employer_id)
            .bind(&record.location)
            .bind(&record.description)
            .bind(&record.employment_type)
            .bind(&record.pay_interval)
            .bind(record.pay_min)
            .bind(record.pay_max)
            .bind(record.posted_at)
            .bind(record.scraped_at)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| classify_sqlx_error(e, url))?;

        let outcome = match written {
            Some(row) => {
                let inserted: bool = row.try_get("inserted").map_err(|e| classify_sqlx_error(e, url))?;
                if inserted {
                    UpsertOutcome::Inserted
                } else {
                    UpsertOutcome::Updated
                }
            }
            None if policy == ScrapedAtPolicy::Touch => {
                let touched = sqlx::query(
                    "UPDATE jobs SET scraped_at = $2 WHERE listing_url = $1 AND scraped_at IS DISTINCT FROM $2",
                )
                .bind(url)
                .bind(record.scraped_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| classify_sqlx_error(e, url))?;
                if touched.rows_affected() > 0 {
                    UpsertOutcome::Touched
                } else {
                    UpsertOutcome::Unchanged
                }
            }
            None => UpsertOutcome::Unchanged,
        };
        tx.commit().await?;
        Ok(outcome)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    keywords: Vec<(String, bool)>,
    employers: BTreeMap<String, i64>,
    next_employer_id: i64,
    jobs: BTreeMap<String, JobRecord>,
    rejected_urls: HashSet<String>,
    unavailable: bool,
}

/// In-process store with the same conflict and diff rules as the Postgres store.
#[derive(Debug, Default)]
pub struct MemoryListingStore {
    state: Mutex<MemoryState>,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keywords<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = (S, bool)>,
        S: Into<String>,
    {
        let state = MemoryState {
            keywords: keywords.into_iter().map(|(k, active)| (k.into(), active)).collect(),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    /// Makes every later upsert of `listing_url` fail as a rejected row.
    pub async fn reject_url(&self, listing_url: &str) {
        self.state.lock().await.rejected_urls.insert(listing_url.to_string());
    }

    /// Simulates a lost connection for every operation while set.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    pub async fn employers(&self) -> Vec<Employer> {
        self.state
            .lock()
            .await
            .employers
            .iter()
            .map(|(name, id)| Employer {
                id: *id,
                name: name.clone(),
            })
            .collect()
    }

    pub async fn job(&self, listing_url: &str) -> Option<JobRecord> {
        self.state.lock().await.jobs.get(listing_url).cloned()
    }

    pub async fn job_count(&self) -> usize {
        self.state.lock().await.jobs.len()
    }
}

fn ensure_available(state: &MemoryState) -> Result<(), StoreError> {
    if state.unavailable {
        Err(StoreError::Unavailable("memory store marked unavailable".into()))
    } else {
        Ok(())
    }
}

// Postgres text columns refuse NUL with SQLSTATE 22021.
const NUL_REJECTION: &str = "invalid byte sequence for encoding \"UTF8\": 0x00";

fn memory_row_check(state: &MemoryState, record: &JobRecord) -> Result<(), String> {
    if state.rejected_urls.contains(&record.listing_url) {
        return Err("row rejected".into());
    }
    let texts = [
        Some(&record.site),
        Some(&record.title),
        record.location.as_ref(),
        record.description.as_ref(),
        record.employment_type.as_ref(),
        record.pay_interval.as_ref(),
    ];
    if texts.into_iter().flatten().any(|t| t.contains('\0')) {
        return Err(NUL_REJECTION.into());
    }
    if let Some(employer_id) = record.employer_id {
        if !state.employers.values().any(|id| *id == employer_id) {
            return Err(format!("employer_id {employer_id} violates foreign key"));
        }
    }
    Ok(())
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn active_keywords(&self) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        ensure_available(&state)?;
        Ok(state
            .keywords
            .iter()
            .filter(|(_, active)| *active)
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn insert_employer_if_absent(&self, name: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        ensure_available(&state)?;
        if name.contains('\0') {
            return Err(StoreError::RowRejected {
                key: name.to_string(),
                reason: NUL_REJECTION.into(),
            });
        }
        if state.employers.contains_key(name) {
            return Ok(false);
        }
        state.next_employer_id += 1;
        let id = state.next_employer_id;
        state.employers.insert(name.to_string(), id);
        Ok(true)
    }

    async fn employer_ids(&self, names: &[String]) -> Result<HashMap<String, i64>, StoreError> {
        let state = self.state.lock().await;
        ensure_available(&state)?;
        Ok(names
            .iter()
            .filter_map(|name| state.employers.get(name).map(|id| (name.clone(), *id)))
            .collect())
    }

    async fn upsert_job(
        &self,
        record: &JobRecord,
        policy: ScrapedAtPolicy,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        ensure_available(&state)?;
        memory_row_check(&state, record).map_err(|reason| StoreError::RowRejected {
            key: record.listing_url.clone(),
            reason,
        })?;

        let outcome = plan_upsert(state.jobs.get(&record.listing_url), record, policy);
        match outcome {
            UpsertOutcome::Inserted | UpsertOutcome::Updated => {
                state.jobs.insert(record.listing_url.clone(), record.clone());
            }
            UpsertOutcome::Touched => {
                if let Some(stored) = state.jobs.get_mut(&record.listing_url) {
                    stored.scraped_at = record.scraped_at;
                }
            }
            UpsertOutcome::Unchanged => {}
        }
        Ok(outcome)
    }
}

/// 429 and the gateway/unavailable family are worth another attempt; any other
/// non-success status is the provider refusing the query.
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

pub fn is_transient_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Capped doubling pauses between provider call attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub first_pause: Duration,
    pub pause_ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            first_pause: Duration::from_secs(2),
            pause_ceiling: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Pause before retry number `retry` (0-based), or `None` once the budget is spent.
    pub fn pause_before(&self, retry: u32) -> Option<Duration> {
        if retry >= self.retries {
            return None;
        }
        let pause = self.first_pause.saturating_mul(2u32.saturating_pow(retry));
        Some(pause.min(self.pause_ceiling))
    }
}

#[derive(Debug, Clone)]
pub struct ProviderClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
}

impl Default for ProviderClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            user_agent: None,
            max_in_flight: 1,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderReply {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum ProviderCallError {
    #[error("provider unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("provider answered {status} at {endpoint}")]
    Status { status: u16, endpoint: String },
}

/// JSON-over-HTTP client for the scrape service, retrying transient failures.
#[derive(Debug)]
pub struct ProviderClient {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl ProviderClient {
    pub fn new(config: ProviderClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        Ok(Self {
            client: builder.build().context("building provider http client")?,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            retry: config.retry,
        })
    }

    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<ProviderReply, ProviderCallError> {
        let span = info_span!("provider_call", endpoint);
        self.post_with_retry(endpoint, body).instrument(span).await
    }

    async fn post_with_retry<B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<ProviderReply, ProviderCallError> {
        // Owned by self and never closed, so acquire cannot fail.
        let _permit = self.in_flight.acquire().await.ok();

        let mut retry = 0;
        loop {
            let failure = match self.client.post(endpoint).json(body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let body = resp.bytes().await?.to_vec();
                    return Ok(ProviderReply { status, body });
                }
                Ok(resp) => {
                    let status = resp.status();
                    let failure = ProviderCallError::Status {
                        status: status.as_u16(),
                        endpoint: endpoint.to_string(),
                    };
                    if !is_transient_status(status) {
                        return Err(failure);
                    }
                    failure
                }
                Err(err) if is_transient_transport(&err) => ProviderCallError::Transport(err),
                Err(err) => return Err(err.into()),
            };

            let Some(pause) = self.retry.pause_before(retry) else {
                return Err(failure);
            };
            debug!(retry, ?pause, error = %failure, "provider call failed, retrying");
            tokio::time::sleep(pause).await;
            retry += 1;
        }
    }
}
