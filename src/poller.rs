use chrono::{DateTime, Utc};

use crate::models::{OrganizationCandidate, RawUsage, RawWindow, UsageSnapshot, UsageWindow};
use crate::resolver;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    #[error("Not logged in to claude.ai")]
    NotAuthenticated,
    #[error("Failed to fetch usage")]
    FetchFailed,
    #[error("Invalid API response structure")]
    MalformedResponse,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("{0}")]
    Transport(String),
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("Unexpected response body: {0}")]
    Decode(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Relay not available: {0}")]
    Unreachable(String),
}

/// Authenticated upstream reads. Both calls are idempotent.
pub trait UsageSource {
    fn list_organizations(&self) -> Result<Vec<OrganizationCandidate>, SourceError>;
    fn fetch_usage(&self, org_id: &str) -> Result<RawUsage, SourceError>;
}

/// Where successful snapshots are pushed.
pub trait UsageSink {
    fn push(&self, snapshot: &UsageSnapshot) -> Result<(), RelayError>;
}

/// The resolved organization id, kept across cycles until cleared.
#[derive(Debug, Default)]
pub struct OrgIdCache {
    value: Option<String>,
}

impl OrgIdCache {
    pub fn get(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn set(&mut self, id: String) {
        self.value = Some(id);
    }

    pub fn clear(&mut self) {
        self.value = None;
    }
}

/// Terminal state of the most recent cycle.
#[derive(Clone, Debug)]
pub struct PollRecord {
    pub result: Result<UsageSnapshot, PollError>,
    pub at: DateTime<Utc>,
}

pub struct UsagePoller<S, K> {
    source: S,
    sink: K,
    org_id: OrgIdCache,
    last: Option<PollRecord>,
}

impl<S: UsageSource, K: UsageSink> UsagePoller<S, K> {
    pub fn new(source: S, sink: K) -> Self {
        Self {
            source,
            sink,
            org_id: OrgIdCache::default(),
            last: None,
        }
    }

    pub fn org_id(&self) -> Option<&str> {
        self.org_id.get()
    }

    pub fn clear_org_id(&mut self) {
        self.org_id.clear();
    }

    pub fn last(&self) -> Option<&PollRecord> {
        self.last.as_ref()
    }

    /// Run one cycle and record its outcome.
    pub fn poll_once(&mut self) -> Result<UsageSnapshot, PollError> {
        let result = self.cycle();
        match &result {
            Ok(snapshot) => {
                tracing::info!(
                    five_hour = snapshot.five_hour.utilization,
                    seven_day = ?snapshot.seven_day.as_ref().map(|w| w.utilization),
                    "Usage data updated"
                );
            }
            Err(e) => tracing::warn!("Poll failed: {e}"),
        }
        self.last = Some(PollRecord {
            result: result.clone(),
            at: Utc::now(),
        });
        result
    }

    fn cycle(&mut self) -> Result<UsageSnapshot, PollError> {
        let org_id = match self.org_id.get() {
            Some(id) => id.to_string(),
            None => {
                let id = self.resolve_org_id()?;
                self.org_id.set(id.clone());
                id
            }
        };

        let raw = match self.source.fetch_usage(&org_id) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(org = %org_id, "Failed to fetch usage: {e}");
                // The id may have been revoked; re-resolve next cycle.
                self.org_id.clear();
                return Err(PollError::FetchFailed);
            }
        };

        let snapshot = normalize(raw, Utc::now())?;

        if let Err(e) = self.sink.push(&snapshot) {
            tracing::info!("{e}");
        }

        Ok(snapshot)
    }

    fn resolve_org_id(&self) -> Result<String, PollError> {
        let orgs = self.source.list_organizations().map_err(|e| {
            tracing::warn!("Failed to list organizations: {e}");
            PollError::NotAuthenticated
        })?;
        resolver::resolve(&orgs).map_err(|e| {
            tracing::warn!("{e}");
            PollError::NotAuthenticated
        })
    }
}

fn normalize_window(raw: RawWindow) -> UsageWindow {
    UsageWindow {
        utilization: raw.utilization.unwrap_or(0.0),
        resets_at: raw.resets_at.unwrap_or_default(),
    }
}

/// Validate an upstream payload and turn it into a snapshot stamped `at`.
pub fn normalize(raw: RawUsage, at: DateTime<Utc>) -> Result<UsageSnapshot, PollError> {
    let five_hour = raw.five_hour.ok_or(PollError::MalformedResponse)?;
    Ok(UsageSnapshot::new(
        normalize_window(five_hour),
        raw.seven_day.map(normalize_window),
        at,
    ))
}
