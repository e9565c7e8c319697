use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use bytes::Bytes;
use serde::Deserialize;
use thiserror::Error;
use time::{Duration, OffsetDateTime};

use crate::cache::CacheEntry;
use crate::request::ReturnStrategy;

/// Entry lifetimes beyond a century either way are rejected.
const MAX_LIFETIME_MS: i64 = 100 * 365 * 24 * 60 * 60 * 1000;

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to read scenario `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse scenario: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid scenario {section} #{index}: {reason}")]
    Invalid {
        section: &'static str,
        index: usize,
        reason: String,
    },
}

/// Cache contents and a request sequence to replay through a dispatcher.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default)]
    pub entries: Vec<SeedEntry>,
    #[serde(default)]
    pub requests: Vec<ScenarioRequest>,
}

/// A cache entry seeded before the dispatcher starts.
///
/// Lifetimes are relative to the moment the scenario runs; negative values
/// produce entries that are already expired.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedEntry {
    pub key: String,
    pub data: String,
    pub ttl_ms: i64,
    /// Defaults to `ttl_ms`.
    #[serde(default)]
    pub soft_ttl_ms: Option<i64>,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpireAction {
    Hard,
    Soft,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioRequest {
    pub key: String,
    #[serde(default)]
    pub cache_only: bool,
    #[serde(default)]
    pub strategy: ReturnStrategy,
    /// Falls back to the configured triage tolerance.
    #[serde(default)]
    pub soft_ttl_tolerance_ms: Option<u64>,
    /// Cancel before the request is enqueued.
    #[serde(default)]
    pub canceled: bool,
    /// Expire the cached entry through the dispatcher right before enqueueing.
    #[serde(default)]
    pub expire: Option<ExpireAction>,
}

impl Scenario {
    pub fn from_toml(source: &str) -> Result<Self, ScenarioError> {
        let scenario: Scenario = toml::from_str(source)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn load(path: &Path) -> Result<Self, ScenarioError> {
        let source = std::fs::read_to_string(path).map_err(|source| ScenarioError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&source)
    }

    pub fn validate(&self) -> Result<(), ScenarioError> {
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.key.is_empty() {
                return Err(invalid("entry", index, "key must not be empty"));
            }
            let lifetimes = [Some(entry.ttl_ms), entry.soft_ttl_ms];
            if lifetimes
                .into_iter()
                .flatten()
                .any(|ms| ms.unsigned_abs() > MAX_LIFETIME_MS.unsigned_abs())
            {
                return Err(invalid(
                    "entry",
                    index,
                    "ttl_ms and soft_ttl_ms must be within 100 years of now",
                ));
            }
            if entry.soft_ttl_ms.is_some_and(|soft| soft > entry.ttl_ms) {
                return Err(invalid("entry", index, "soft_ttl_ms must not exceed ttl_ms"));
            }
        }
        for (index, request) in self.requests.iter().enumerate() {
            if request.key.is_empty() {
                return Err(invalid("request", index, "key must not be empty"));
            }
        }
        Ok(())
    }
}

impl SeedEntry {
    pub fn to_entry(&self, now: OffsetDateTime) -> CacheEntry {
        let soft_ttl_ms = self.soft_ttl_ms.unwrap_or(self.ttl_ms);
        CacheEntry {
            data: Bytes::from(self.data.clone()),
            etag: self.etag.clone(),
            response_headers: self.headers.clone(),
            expires_at: now.saturating_add(Duration::milliseconds(self.ttl_ms)),
            soft_expires_at: now.saturating_add(Duration::milliseconds(soft_ttl_ms)),
        }
    }
}

impl ScenarioRequest {
    pub fn tolerance_or(&self, default: StdDuration) -> StdDuration {
        self.soft_ttl_tolerance_ms
            .map(StdDuration::from_millis)
            .unwrap_or(default)
    }
}

fn invalid(section: &'static str, index: usize, reason: &str) -> ScenarioError {
    ScenarioError::Invalid {
        section,
        index,
        reason: reason.to_string(),
    }
}
