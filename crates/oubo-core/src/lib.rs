//! Core domain model for the applicant-source analytics engine.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "oubo-core";

/// Canonical recruiting-channel key.
///
/// Channels are an open-ish alphabet (one key per job board plus the
/// `Direct` sentinel), so this is a tagged string value rather than an
/// enum; the known set, labels and aliases live in the channel registry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channel(String);

pub const DIRECT_KEY: &str = "Direct";

impl Channel {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The sentinel for "could not be attributed to any known channel".
    pub fn direct() -> Self {
        Self(DIRECT_KEY.to_string())
    }

    pub fn is_direct(&self) -> bool {
        self.0 == DIRECT_KEY
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One inbound applicant-notification event, harvested from email by the
/// external feed. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: String,
    pub source_message_id: String,
    pub thread_id: Option<String>,
    pub from_address: String,
    pub to_address: Option<String>,
    pub company_id: Option<String>,
    pub company_name: Option<String>,
    pub job_id: Option<String>,
    pub subject: String,
    pub snippet: Option<String>,
    pub received_at: DateTime<Utc>,
    /// Raw, possibly empty or aliased channel identifier stored with the
    /// event. Resolution happens downstream per metric, not at ingest.
    pub channel_hint: String,
    /// Free-text funnel state as recorded by the source.
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Per-channel publication state on a job posting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SiteState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A job posting. A job counts as "posted" on a channel iff its
/// publication-status map contains that channel as a key, regardless of
/// the stored value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub company_id: Option<String>,
    pub title: String,
    /// Keyed by raw channel identifiers; canonicalize before counting.
    #[serde(default)]
    pub site_status: BTreeMap<String, SiteState>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub id: String,
    pub name: String,
}

/// The immutable input of one aggregation pass: the result of one
/// completed ingestion plus its caveats. Derived outputs are pure
/// functions of a snapshot and a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Snapshot {
    pub events: Vec<RawEvent>,
    pub jobs: Vec<Job>,
    pub companies: Vec<Company>,
    /// True when ingestion hit a page/row safety cap and stopped early.
    pub truncated: bool,
    /// First source error encountered; aggregation still ran over
    /// whatever was ingested successfully.
    pub load_error: Option<String>,
}

/// Calendar-month filter: everything, or one `YYYY-MM` month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MonthFilter {
    #[default]
    All,
    Month(String),
}

impl MonthFilter {
    pub fn is_all(&self) -> bool {
        matches!(self, MonthFilter::All)
    }

    pub fn month(&self) -> Option<&str> {
        match self {
            MonthFilter::All => None,
            MonthFilter::Month(ym) => Some(ym),
        }
    }
}

/// Filter selection for one aggregation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Scope {
    pub company_id: Option<String>,
    pub month: MonthFilter,
}

/// Derived per-channel performance row. Recomputed on every pass, never
/// persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteRow {
    pub channel: Channel,
    pub label: String,
    pub posted_jobs: u32,
    pub applications: u32,
    /// `None` when `posted_jobs == 0`: the rate is not computable and
    /// is never rendered as 0.00.
    pub app_rate: Option<f64>,
    /// Last 28 local calendar days, oldest first.
    pub spark: Vec<u32>,
}

/// Derived per-job performance row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRow {
    pub job_id: String,
    pub title: String,
    pub company_name: String,
    pub applications: u32,
    pub top_channel: Option<Channel>,
}

/// One month of the rolling 6-month time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthBucket {
    pub ym: String,
    pub total: u32,
    pub by_channel: BTreeMap<Channel, u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    Good,
    Warn,
    Bad,
    Neutral,
}

/// Human-facing derived insight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub tone: Tone,
    pub title: String,
    pub detail: String,
}

/// Month-over-month regression alert for one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub channel: Channel,
    pub label: String,
    pub percent_change: f64,
}

/// Closed funnel-stage set an application event currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunnelStage {
    New,
    Registered,
    Ng,
    Interview,
    Offer,
    Other,
}

impl FunnelStage {
    /// Case-insensitive exact match against the known values; anything
    /// else is `Other`.
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "new" => FunnelStage::New,
            "registered" => FunnelStage::Registered,
            "ng" => FunnelStage::Ng,
            "interview" => FunnelStage::Interview,
            "offer" => FunnelStage::Offer,
            _ => FunnelStage::Other,
        }
    }

    pub const ALL: [FunnelStage; 6] = [
        FunnelStage::New,
        FunnelStage::Registered,
        FunnelStage::Ng,
        FunnelStage::Interview,
        FunnelStage::Offer,
        FunnelStage::Other,
    ];
}

/// Per-company funnel breakdown over a status snapshot.
///
/// The ratios are percentages of the current status snapshot; events
/// never record a status history, so these are not transition rates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelSummary {
    pub total: u32,
    pub counts: BTreeMap<FunnelStage, u32>,
    pub last_7_days: u32,
    pub latest_received_at: Option<DateTime<Utc>>,
    pub registered_per_new: Option<f64>,
    pub interview_per_registered: Option<f64>,
    pub offer_per_interview: Option<f64>,
    pub interview_per_new: Option<f64>,
    pub offer_per_new: Option<f64>,
}

/// Headline totals for the current scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Totals {
    pub posted_jobs: u32,
    pub applications: u32,
    pub channels: u32,
    pub jobs_with_applications: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_sentinel_round_trips() {
        let direct = Channel::direct();
        assert!(direct.is_direct());
        assert_eq!(direct.as_str(), DIRECT_KEY);
        assert!(!Channel::new("Indeed").is_direct());
    }

    #[test]
    fn funnel_stage_normalization_is_case_insensitive_and_closed() {
        assert_eq!(FunnelStage::from_raw("Registered"), FunnelStage::Registered);
        assert_eq!(FunnelStage::from_raw("NG"), FunnelStage::Ng);
        assert_eq!(FunnelStage::from_raw(" offer "), FunnelStage::Offer);
        assert_eq!(FunnelStage::from_raw("採用済み"), FunnelStage::Other);
        assert_eq!(FunnelStage::from_raw(""), FunnelStage::Other);
    }

    #[test]
    fn month_filter_accessors() {
        assert!(MonthFilter::All.is_all());
        assert_eq!(MonthFilter::All.month(), None);
        let m = MonthFilter::Month("2026-08".into());
        assert_eq!(m.month(), Some("2026-08"));
    }
}
