//! Listing data model and field normalization for jobfeed.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "jobfeed-core";

/// Column names emitted by the scrape provider for one listing.
pub mod fields {
    pub const SITE: &str = "site";
    pub const TITLE: &str = "title";
    pub const COMPANY: &str = "company";
    pub const LOCATION: &str = "location";
    pub const DESCRIPTION: &str = "description";
    pub const JOB_TYPE: &str = "job_type";
    pub const INTERVAL: &str = "interval";
    pub const MIN_AMOUNT: &str = "min_amount";
    pub const MAX_AMOUNT: &str = "max_amount";
    pub const JOB_URL: &str = "job_url";
    pub const DATE_POSTED: &str = "date_posted";
}

/// One scraped field value of whatever type the provider happened to emit.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Other(JsonValue),
}

impl From<JsonValue> for RawValue {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => RawValue::Null,
            JsonValue::Bool(b) => RawValue::Bool(b),
            JsonValue::Number(n) => n.as_f64().map_or(RawValue::Null, RawValue::Number),
            JsonValue::String(s) => RawValue::Text(s),
            other => RawValue::Other(other),
        }
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::Text(value.to_string())
    }
}

impl From<String> for RawValue {
    fn from(value: String) -> Self {
        RawValue::Text(value)
    }
}

impl From<f64> for RawValue {
    fn from(value: f64) -> Self {
        RawValue::Number(value)
    }
}

impl<'de> Deserialize<'de> for RawValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        JsonValue::deserialize(deserializer).map(RawValue::from)
    }
}

/// Untyped field map for one scraped job post, exactly as the provider sent it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct RawListing {
    fields: BTreeMap<String, RawValue>,
}

impl RawListing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<RawValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<RawValue>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&RawValue> {
        self.fields.get(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<RawValue>> FromIterator<(K, V)> for RawListing {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// A listing that cannot become a persistable row.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RowDefect {
    #[error("field `{field}` expected a number, got {value:?}")]
    NonNumeric { field: &'static str, value: String },
}

/// Canonical form of one listing, produced once per batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedListing {
    pub source_site: String,
    pub title_raw: String,
    pub title_key: String,
    pub employer_name: Option<String>,
    pub location: Option<String>,
    pub description: Option<String>,
    pub employment_type: Option<String>,
    pub pay_interval: Option<String>,
    pub pay_min: Option<f64>,
    pub pay_max: Option<f64>,
    pub listing_url: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub observed_at: DateTime<Utc>,
}

impl NormalizedListing {
    /// Runs every field cleaner over `raw`. Only a non-numeric pay amount
    /// rejects the listing; all other fields degrade to empty or absent.
    pub fn from_raw(raw: &RawListing, observed_at: DateTime<Utc>) -> Result<Self, RowDefect> {
        let title_raw = clean_text(raw.get(fields::TITLE)).unwrap_or_default();
        Ok(Self {
            source_site: clean_text(raw.get(fields::SITE)).unwrap_or_default(),
            title_key: normalize_title(&title_raw),
            title_raw,
            employer_name: clean_employer_name(raw.get(fields::COMPANY)),
            location: clean_text(raw.get(fields::LOCATION)),
            description: clean_text(raw.get(fields::DESCRIPTION)),
            employment_type: clean_text(raw.get(fields::JOB_TYPE)),
            pay_interval: clean_text(raw.get(fields::INTERVAL)),
            pay_min: parse_amount(fields::MIN_AMOUNT, raw.get(fields::MIN_AMOUNT))?,
            pay_max: parse_amount(fields::MAX_AMOUNT, raw.get(fields::MAX_AMOUNT))?,
            listing_url: clean_text(raw.get(fields::JOB_URL)).map(|url| url.trim().to_string()),
            posted_at: parse_timestamp(raw.get(fields::DATE_POSTED)),
            observed_at,
        })
    }
}

/// Stored employer. Names are unique, case-sensitive and trimmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Employer {
    pub id: i64,
    pub name: String,
}

/// Persisted job row, identified by `listing_url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub listing_url: String,
    pub site: String,
    pub title: String,
    pub title_key: String,
    pub employer_id: Option<i64>,
    pub location: Option<String>,
    pub description: Option<String>,
    pub employment_type: Option<String>,
    pub pay_interval: Option<String>,
    pub pay_min: Option<f64>,
    pub pay_max: Option<f64>,
    pub posted_at: Option<DateTime<Utc>>,
    pub scraped_at: DateTime<Utc>,
}

impl JobRecord {
    /// Returns `None` when the listing has no natural key.
    pub fn from_listing(listing: &NormalizedListing, employer_id: Option<i64>) -> Option<Self> {
        let listing_url = listing.listing_url.as_deref().filter(|url| !url.is_empty())?;
        Some(Self {
            listing_url: listing_url.to_string(),
            site: listing.source_site.clone(),
            title: listing.title_raw.clone(),
            title_key: listing.title_key.clone(),
            employer_id,
            location: listing.location.clone(),
            description: listing.description.clone(),
            employment_type: listing.employment_type.clone(),
            pay_interval: listing.pay_interval.clone(),
            pay_min: listing.pay_min,
            pay_max: listing.pay_max,
            posted_at: listing.posted_at,
            scraped_at: listing.observed_at,
        })
    }

    /// Column-by-column inequality over everything except `scraped_at`.
    pub fn content_differs(&self, stored: &JobRecord) -> bool {
        self.site != stored.site
            || self.title != stored.title
            || self.title_key != stored.title_key
            || self.employer_id != stored.employer_id
            || self.location != stored.location
            || self.description != stored.description
            || self.employment_type != stored.employment_type
            || self.pay_interval != stored.pay_interval
            || self.pay_min != stored.pay_min
            || self.pay_max != stored.pay_max
            || self.posted_at != stored.posted_at
    }
}

/// Lowercases, drops ASCII punctuation and collapses whitespace runs.
pub fn normalize_title(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    raw.to_lowercase()
        .chars()
        .filter(|c| !c.is_ascii_punctuation())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Employer names arrive as text, as numbers coerced by the provider, or as the
/// textual `nan` sentinel. Numbers are kept as display strings.
pub fn clean_employer_name(raw: Option<&RawValue>) -> Option<String> {
    match raw? {
        RawValue::Text(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        RawValue::Number(n) if n.is_nan() => None,
        RawValue::Number(n) => Some(display_number(*n)),
        _ => None,
    }
}

/// Strict ISO-8601 parse of a textual value. Numeric values are never guessed
/// as epochs.
pub fn parse_timestamp(raw: Option<&RawValue>) -> Option<DateTime<Utc>> {
    match raw? {
        RawValue::Text(text) => parse_iso8601(text.trim()),
        _ => None,
    }
}

/// Opaque text pass-through. Empty strings and float NaN become absent.
pub fn clean_text(raw: Option<&RawValue>) -> Option<String> {
    match raw? {
        RawValue::Text(text) if text.trim().is_empty() => None,
        RawValue::Text(text) => Some(text.clone()),
        RawValue::Number(n) if n.is_nan() => None,
        RawValue::Number(n) => Some(display_number(*n)),
        RawValue::Bool(b) => Some(b.to_string()),
        RawValue::Null | RawValue::Other(_) => None,
    }
}

/// Pay amount as a number. Absent, empty, NaN and `nan` are absent; any other
/// non-numeric value is a row defect.
pub fn parse_amount(field: &'static str, raw: Option<&RawValue>) -> Result<Option<f64>, RowDefect> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match raw {
        RawValue::Null => Ok(None),
        RawValue::Number(n) if n.is_nan() => Ok(None),
        RawValue::Number(n) if n.is_finite() => Ok(Some(*n)),
        RawValue::Text(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
                return Ok(None);
            }
            match trimmed.replace(',', "").parse::<f64>() {
                Ok(n) if n.is_finite() => Ok(Some(n)),
                _ => Err(RowDefect::NonNumeric {
                    field,
                    value: text.clone(),
                }),
            }
        }
        other => Err(RowDefect::NonNumeric {
            field,
            value: format!("{other:?}"),
        }),
    }
}

fn display_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

const NAIVE_DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

fn parse_iso8601(text: &str) -> Option<DateTime<Utc>> {
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
