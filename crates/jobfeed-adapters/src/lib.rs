//! Source provider contracts: HTTP scrape service and on-disk fixtures.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use jobfeed_core::{fields, RawListing, RawValue};
use jobfeed_storage::{ProviderCallError, ProviderClient, ProviderClientConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "jobfeed-adapters";

/// One provider call: which boards to search, for what, and through which identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub sites: Vec<String>,
    pub term: String,
    pub location: String,
    /// Country for boards that search by country (Indeed, Glassdoor).
    pub country: String,
    pub max_results: u64,
    pub max_age_hours: u32,
    pub proxy: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("provider request failed: {0}")]
    Http(#[from] ProviderCallError),
    #[error("decoding provider response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait SourceProvider: Send + Sync {
    fn provider_id(&self) -> &'static str;

    async fn fetch(&self, query: &SearchQuery) -> Result<Vec<RawListing>, AdapterError>;
}

/// Proxy and user-agent pools handed to the provider, read from YAML.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProviderProfile {
    #[serde(default)]
    pub proxies: Vec<String>,
    #[serde(default)]
    pub user_agents: Vec<String>,
}

impl ProviderProfile {
    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(text).context("parsing provider profile")
    }

    /// A missing file yields an empty profile (no proxy, provider default UA).
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_yaml_str(&text).with_context(|| format!("reading {}", path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderIdentity {
    pub proxy: Option<String>,
    pub user_agent: Option<String>,
}

/// Round-robin rotation over a [`ProviderProfile`]; each call advances both pools.
#[derive(Debug, Default)]
pub struct RotationPool {
    profile: ProviderProfile,
    cursor: AtomicUsize,
}

impl RotationPool {
    pub fn new(profile: ProviderProfile) -> Self {
        Self {
            profile,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn next_identity(&self) -> ProviderIdentity {
        let turn = self.cursor.fetch_add(1, Ordering::Relaxed);
        ProviderIdentity {
            proxy: pick(&self.profile.proxies, turn),
            user_agent: pick(&self.profile.user_agents, turn),
        }
    }
}

fn pick(pool: &[String], turn: usize) -> Option<String> {
    if pool.is_empty() {
        None
    } else {
        Some(pool[turn % pool.len()].clone())
    }
}

/// Request body understood by the scrape service.
#[derive(Debug, Serialize)]
struct ScrapeRequest<'a> {
    site_name: &'a [String],
    search_term: &'a str,
    location: &'a str,
    country_indeed: &'a str,
    results_wanted: u64,
    hours_old: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    proxies: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_agent: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ScrapeResponse {
    Bare(Vec<RawListing>),
    Wrapped(JobsEnvelope),
}

#[derive(Debug, Deserialize)]
struct JobsEnvelope {
    #[serde(deserialize_with = "required_jobs")]
    jobs: Vec<RawListing>,
}

// The key must be present; an explicit null means no results.
fn required_jobs<'de, D>(deserializer: D) -> Result<Vec<RawListing>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<RawListing>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Decodes either a bare JSON array of listings or `{"jobs": [...]}`. Any
/// other object, such as an error body served with 200, is a decode error.
pub fn decode_listings(body: &[u8]) -> Result<Vec<RawListing>, AdapterError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let listings = match serde_json::from_slice::<ScrapeResponse>(body)? {
        ScrapeResponse::Bare(listings) => listings,
        ScrapeResponse::Wrapped(envelope) => envelope.jobs,
    };
    Ok(listings)
}

/// Scrape service reached over HTTP.
#[derive(Debug)]
pub struct HttpSourceProvider {
    endpoint: String,
    http: ProviderClient,
}

impl HttpSourceProvider {
    pub fn new(endpoint: impl Into<String>, config: ProviderClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            endpoint: endpoint.into(),
            http: ProviderClient::new(config)?,
        })
    }
}

#[async_trait]
impl SourceProvider for HttpSourceProvider {
    fn provider_id(&self) -> &'static str {
        "http"
    }

    async fn fetch(&self, query: &SearchQuery) -> Result<Vec<RawListing>, AdapterError> {
        let request = ScrapeRequest {
            site_name: &query.sites,
            search_term: &query.term,
            location: &query.location,
            country_indeed: &query.country,
            results_wanted: query.max_results,
            hours_old: query.max_age_hours,
            proxies: query.proxy.as_deref().into_iter().collect(),
            user_agent: query.user_agent.as_deref(),
        };
        let response = self.http.post_json(&self.endpoint, &request).await?;
        let listings = decode_listings(&response.body)?;
        debug!(
            term = %query.term,
            status = %response.status,
            listings = listings.len(),
            "provider responded"
        );
        Ok(listings)
    }
}

/// Reads `<root>/<keyword-slug>.json`. A keyword without a fixture has no results.
#[derive(Debug, Clone)]
pub struct FixtureSourceProvider {
    root: PathBuf,
}

impl FixtureSourceProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn fixture_path(&self, term: &str) -> PathBuf {
        self.root.join(format!("{}.json", keyword_slug(term)))
    }
}

#[async_trait]
impl SourceProvider for FixtureSourceProvider {
    fn provider_id(&self) -> &'static str {
        "fixtures"
    }

    async fn fetch(&self, query: &SearchQuery) -> Result<Vec<RawListing>, AdapterError> {
        let path = self.fixture_path(&query.term);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("reading fixture {}", path.display()))
                    .into())
            }
        };

        let listings = decode_listings(&bytes)?
            .into_iter()
            .filter(|listing| site_requested(listing, &query.sites))
            .take(usize::try_from(query.max_results).unwrap_or(usize::MAX))
            .collect();
        Ok(listings)
    }
}

fn site_requested(listing: &RawListing, sites: &[String]) -> bool {
    match listing.get(fields::SITE) {
        Some(RawValue::Text(site)) if !sites.is_empty() => sites.iter().any(|s| s == site),
        _ => true,
    }
}

/// Lowercase, alphanumerics kept, everything else folded into single dashes.
pub fn keyword_slug(input: &str) -> String {
    let mapped = input
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>();
    let mut out = String::with_capacity(mapped.len());
    let mut prev_dash = false;
    for c in mapped.chars() {
        if c == '-' {
            if !prev_dash && !out.is_empty() {
                out.push('-');
            }
            prev_dash = true;
        } else {
            out.push(c);
            prev_dash = false;
        }
    }
    out.trim_end_matches('-').to_string()
}
