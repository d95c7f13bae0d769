use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a work item came from so requeue decisions can tell fresh cursor IDs from backfill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Minted by advancing the shared cursor.
    Fresh,
    /// Popped from the shared retry queue.
    Retry,
}

/// One ID to classify within a single batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    pub id: u64,
    pub provenance: Provenance,
}

impl WorkItem {
    pub const fn fresh(id: u64) -> Self {
        Self {
            id,
            provenance: Provenance::Fresh,
        }
    }

    pub const fn retry(id: u64) -> Self {
        Self {
            id,
            provenance: Provenance::Retry,
        }
    }
}

/// Profile fields extracted from a found page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: u64,
    pub nickname: String,
    pub registered_at: String,
    pub rating: Option<f64>,
    pub review_count: u32,
    pub lot_count: u32,
    pub is_banned: bool,
    pub is_support: bool,
    pub scraped_at: DateTime<Utc>,
}

/// Result of classifying exactly one ID.
#[derive(Debug, Clone, PartialEq)]
pub enum ScrapeOutcome {
    Found(Profile),
    NotFound,
    RateLimited,
    ServerError { code: u16 },
    Timeout,
    Fatal { reason: String },
}

impl ScrapeOutcome {
    /// Anything other than a found profile counts against the success streak.
    pub fn is_error(&self) -> bool {
        !matches!(self, ScrapeOutcome::Found(_))
    }
}

impl fmt::Display for ScrapeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScrapeOutcome::Found(profile) => write!(f, "found ({})", profile.nickname),
            ScrapeOutcome::NotFound => write!(f, "not found"),
            ScrapeOutcome::RateLimited => write!(f, "rate limited"),
            ScrapeOutcome::ServerError { code } => write!(f, "server error {}", code),
            ScrapeOutcome::Timeout => write!(f, "timeout"),
            ScrapeOutcome::Fatal { reason } => write!(f, "fatal: {}", reason),
        }
    }
}

/// A found profile as persisted, tagged with the worker that scraped it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    #[serde(flatten)]
    pub profile: Profile,
    pub scraped_by: String,
}

/// Minimal record marking an ID as confirmed not found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub id: u64,
    pub scraped_at: DateTime<Utc>,
    pub scraped_by: String,
}

/// The durable unit, unique per ID. The last write for an ID wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PersistedRecord {
    Found(ProfileRecord),
    NotFound(Tombstone),
}

impl PersistedRecord {
    pub fn found(profile: Profile, worker_id: &str) -> Self {
        PersistedRecord::Found(ProfileRecord {
            profile,
            scraped_by: worker_id.to_string(),
        })
    }

    pub fn tombstone(id: u64, worker_id: &str) -> Self {
        PersistedRecord::NotFound(Tombstone {
            id,
            scraped_at: Utc::now(),
            scraped_by: worker_id.to_string(),
        })
    }

    pub fn id(&self) -> u64 {
        match self {
            PersistedRecord::Found(record) => record.profile.id,
            PersistedRecord::NotFound(tombstone) => tombstone.id,
        }
    }

    pub fn as_found(&self) -> Option<&ProfileRecord> {
        match self {
            PersistedRecord::Found(record) => Some(record),
            PersistedRecord::NotFound(_) => None,
        }
    }

    pub fn is_found(&self) -> bool {
        self.as_found().is_some()
    }
}

/// Per-worker liveness and cancellation signal stored in the coordination store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    StopRequested,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::StopRequested => "stopping",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(RunStatus::Running),
            "stopping" => Some(RunStatus::StopRequested),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
