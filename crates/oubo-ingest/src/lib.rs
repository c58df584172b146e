//! Feed ingestion for the analytics engine.
//!
//! Pulls applicant events, jobs and companies from the CRM feed API
//! into an in-memory [`Snapshot`]. Ingestion is bounded by hard page
//! and row caps, filters out reply/forward mail threads, and degrades
//! instead of aborting: a mid-run source failure yields a snapshot of
//! whatever was already ingested plus the error, never an empty one.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, Utc};
use oubo_core::{Company, Job, RawEvent, SiteState, Snapshot};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "oubo-ingest";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("feed returned http {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Feed endpoint and safety-cap configuration.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub page_size: usize,
    /// Hard page cap per ingestion, independent of `has_next`.
    pub max_pages: usize,
    /// Hard row cap per ingestion across all pages.
    pub max_rows: usize,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api".to_string(),
            api_token: None,
            page_size: 200,
            max_pages: 2000,
            max_rows: 30000,
            timeout_secs: 20,
            user_agent: "oubo-bot/0.1".to_string(),
        }
    }
}

impl FeedConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("OUBO_FEED_URL").unwrap_or(defaults.base_url),
            api_token: std::env::var("OUBO_FEED_TOKEN").ok(),
            page_size: std::env::var("OUBO_FEED_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.page_size),
            max_pages: std::env::var("OUBO_FEED_MAX_PAGES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_pages),
            max_rows: std::env::var("OUBO_FEED_MAX_ROWS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_rows),
            timeout_secs: std::env::var("OUBO_FEED_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.timeout_secs),
            user_agent: std::env::var("OUBO_USER_AGENT").unwrap_or(defaults.user_agent),
        }
    }
}

/// Result of one bounded event ingestion.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub events: Vec<RawEvent>,
    /// True when a page or row cap stopped the walk before `has_next`
    /// went false.
    pub truncated: bool,
    /// First error hit mid-walk; the events ingested before it are
    /// still returned.
    pub partial_error: Option<String>,
}

/// Detects reply and forward subjects so the inbox count reflects
/// applicants, not conversations about applicants.
///
/// Leading bracketed tags such as `[社外] [広告]` are stripped before
/// matching, since mail gateways prepend them in front of the `Re:`.
#[derive(Debug)]
pub struct ReplyFilter {
    leading_tags: Regex,
    latin_marker: Regex,
    ja_marker: Regex,
}

impl Default for ReplyFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyFilter {
    pub fn new() -> Self {
        Self {
            leading_tags: Regex::new(r"^\s*(\[[^\]]+\]\s*)*").expect("static pattern compiles"),
            latin_marker: Regex::new(r"(?i)(^|\s)(re|fw|fwd)\s*[:：]")
                .expect("static pattern compiles"),
            ja_marker: Regex::new(r"(^|\s)(返信|転送)\s*[:：]").expect("static pattern compiles"),
        }
    }

    pub fn is_reply_or_forward(&self, subject: &str) -> bool {
        let stripped = self.leading_tags.replace(subject, "");
        self.latin_marker.is_match(&stripped) || self.ja_marker.is_match(&stripped)
    }
}

/// One event row as the feed serializes it. The feed has shipped both
/// camelCase and snake_case over time, so every field takes aliases.
#[derive(Debug, Clone, Deserialize)]
struct WireEvent {
    #[serde(default)]
    id: Option<String>,
    #[serde(default, alias = "messageId", alias = "message_id")]
    message_id: Option<String>,
    #[serde(default, alias = "threadId", alias = "thread_id")]
    thread_id: Option<String>,
    #[serde(default, alias = "fromEmail", alias = "from_email")]
    from: Option<String>,
    #[serde(default, alias = "toEmail", alias = "to_email")]
    to: Option<String>,
    #[serde(default, alias = "companyId", alias = "company_id")]
    company_id: Option<String>,
    #[serde(default, alias = "companyName", alias = "company_name")]
    company_name: Option<String>,
    #[serde(default, alias = "jobId", alias = "job_id")]
    job_id: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default, alias = "bodySnippet", alias = "body_snippet")]
    snippet: Option<String>,
    #[serde(default, alias = "receivedAt", alias = "received_at")]
    received_at: Option<String>,
    #[serde(default, alias = "siteKey", alias = "site_key")]
    site_key: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, alias = "createdAt", alias = "created_at")]
    created_at: Option<String>,
    #[serde(default, alias = "updatedAt", alias = "updated_at")]
    updated_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireEventPage {
    #[serde(default, alias = "emails", alias = "rows")]
    items: Vec<WireEvent>,
    #[serde(default)]
    page: Option<WirePageInfo>,
    #[serde(default, alias = "hasNext")]
    has_next: Option<bool>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct WirePageInfo {
    #[serde(default, alias = "hasNext")]
    has_next: bool,
}

impl WireEventPage {
    /// The feed has served the flag both top-level and nested under
    /// `page`; absence means the walk is done.
    fn has_next(&self) -> bool {
        self.has_next
            .or(self.page.map(|p| p.has_next))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct WireJob {
    id: String,
    #[serde(default, alias = "companyId", alias = "company_id")]
    company_id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, alias = "siteStatus", alias = "site_status")]
    site_status: HashMap<String, WireSiteState>,
    #[serde(default, alias = "updatedAt", alias = "updated_at")]
    updated_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireSiteState {
    #[serde(default)]
    status: Option<String>,
    #[serde(default, alias = "updatedAt", alias = "updated_at")]
    updated_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireCompany {
    id: String,
    #[serde(default, alias = "company_name", alias = "companyName")]
    name: Option<String>,
}

/// Jobs and companies arrive either as a bare array or wrapped in an
/// envelope, depending on the feed version.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum WireList<T> {
    Bare(Vec<T>),
    Wrapped {
        #[serde(alias = "jobs", alias = "companies", alias = "rows")]
        items: Vec<T>,
    },
}

impl<T> WireList<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            WireList::Bare(items) | WireList::Wrapped { items } => items,
        }
    }
}

/// Accepts RFC 3339 as well as the bare `YYYY-MM-DD HH:MM:SS` shape
/// older feed rows carry, read as UTC.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Wire row to domain event. Rows with no usable timestamp are dropped
/// with a warning; an event that cannot be placed in time cannot be
/// bucketed or compared, and zero of them have been seen in practice.
fn convert_event(raw: WireEvent, filter: &ReplyFilter) -> Option<RawEvent> {
    let subject = raw.subject.unwrap_or_default();
    if filter.is_reply_or_forward(&subject) {
        return None;
    }
    let received_raw = raw.received_at.unwrap_or_default();
    let received_at = match parse_timestamp(&received_raw) {
        Some(ts) => ts,
        None => {
            warn!(raw = %received_raw, "skipping event with unparseable receivedAt");
            return None;
        }
    };
    let message_id = raw.message_id.or_else(|| raw.id.clone()).unwrap_or_default();
    let id = raw.id.unwrap_or_else(|| message_id.clone());
    if id.is_empty() {
        warn!("skipping event with no id");
        return None;
    }
    Some(RawEvent {
        id,
        source_message_id: message_id,
        thread_id: raw.thread_id,
        from_address: raw.from.unwrap_or_default(),
        to_address: raw.to,
        company_id: raw.company_id.filter(|v| !v.is_empty()),
        company_name: raw.company_name.filter(|v| !v.is_empty()),
        job_id: raw.job_id.filter(|v| !v.is_empty()),
        subject,
        snippet: raw.snippet,
        received_at,
        channel_hint: raw.site_key.unwrap_or_default(),
        status: raw.status.unwrap_or_else(|| "new".to_string()),
        created_at: raw.created_at.as_deref().and_then(parse_timestamp),
        updated_at: raw.updated_at.as_deref().and_then(parse_timestamp),
    })
}

/// Newest first (stable, so same-instant rows keep feed order), then
/// duplicate ids dropped keeping the first occurrence. The feed
/// re-serves rows at page boundaries when mail arrives mid-walk, so
/// duplicates are expected, not an error.
fn sort_and_dedup(events: &mut Vec<RawEvent>) {
    events.sort_by(|a, b| b.received_at.cmp(&a.received_at));
    let mut seen = std::collections::HashSet::new();
    events.retain(|e| seen.insert(e.id.clone()));
}

/// Fills missing per-event company ids by case-insensitive company
/// name. Older rows predate the company-id column.
fn backfill_company_ids(events: &mut [RawEvent], companies: &[Company]) {
    let by_name: HashMap<String, &str> = companies
        .iter()
        .map(|c| (c.name.trim().to_lowercase(), c.id.as_str()))
        .collect();
    for event in events.iter_mut() {
        if event.company_id.is_some() {
            continue;
        }
        if let Some(name) = &event.company_name {
            if let Some(id) = by_name.get(&name.trim().to_lowercase()) {
                event.company_id = Some((*id).to_string());
            }
        }
    }
}

pub struct FeedClient {
    client: reqwest::Client,
    config: FeedConfig,
    filter: ReplyFilter,
}

impl FeedClient {
    pub fn new(config: FeedConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .context("building feed http client")?;
        Ok(Self {
            client,
            config,
            filter: ReplyFilter::new(),
        })
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, FeedError> {
        let mut req = self.client.get(url);
        if let Some(token) = &self.config.api_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FeedError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp.json::<T>().await?)
    }

    /// Walks the paginated event feed under the configured caps.
    pub async fn fetch_events(&self, run_id: Uuid) -> IngestOutcome {
        let mut events: Vec<RawEvent> = Vec::new();
        let mut truncated = false;
        let mut partial_error = None;
        let mut page = 1usize;

        loop {
            if page > self.config.max_pages {
                warn!(%run_id, page, "event feed hit page cap");
                truncated = true;
                break;
            }
            let url = format!(
                "{}/emails?limit={}&page={}",
                self.config.base_url, self.config.page_size, page
            );
            let span = info_span!("feed_fetch", %run_id, page);
            let wire: WireEventPage = match self.get_json(&url).instrument(span).await {
                Ok(p) => p,
                Err(err) => {
                    warn!(%run_id, page, error = %err, "event feed page failed, keeping partial snapshot");
                    partial_error = Some(err.to_string());
                    break;
                }
            };
            let has_next = wire.has_next();
            for raw in wire.items {
                if let Some(event) = convert_event(raw, &self.filter) {
                    events.push(event);
                }
                if events.len() >= self.config.max_rows {
                    break;
                }
            }
            if events.len() >= self.config.max_rows {
                warn!(%run_id, rows = events.len(), "event feed hit row cap");
                truncated = true;
                break;
            }
            if !has_next {
                break;
            }
            page += 1;
        }

        sort_and_dedup(&mut events);
        IngestOutcome {
            events,
            truncated,
            partial_error,
        }
    }

    pub async fn fetch_jobs(&self) -> Result<Vec<Job>, FeedError> {
        let url = format!("{}/jobs", self.config.base_url);
        let wire: WireList<WireJob> = self.get_json(&url).await?;
        Ok(wire
            .into_vec()
            .into_iter()
            .map(|j| Job {
                id: j.id,
                company_id: j.company_id.filter(|v| !v.is_empty()),
                title: j.title.unwrap_or_default(),
                site_status: j
                    .site_status
                    .into_iter()
                    .map(|(key, state)| {
                        (
                            key,
                            SiteState {
                                status: state.status.unwrap_or_default(),
                                updated_at: state.updated_at.as_deref().and_then(parse_timestamp),
                            },
                        )
                    })
                    .collect(),
                updated_at: j.updated_at.as_deref().and_then(parse_timestamp),
            })
            .collect())
    }

    pub async fn fetch_companies(&self) -> Result<Vec<Company>, FeedError> {
        let url = format!("{}/companies", self.config.base_url);
        let wire: WireList<WireCompany> = self.get_json(&url).await?;
        Ok(wire
            .into_vec()
            .into_iter()
            .map(|c| Company {
                name: c.name.unwrap_or_else(|| c.id.clone()),
                id: c.id,
            })
            .collect())
    }

    /// One full ingestion pass. Jobs and companies failing to load
    /// degrade to empty collections with the error carried on the
    /// snapshot, so aggregation still runs over the events.
    pub async fn fetch_snapshot(&self, run_id: Uuid) -> Snapshot {
        let outcome = self.fetch_events(run_id).await;
        let mut load_error = outcome.partial_error;

        let jobs = match self.fetch_jobs().await {
            Ok(jobs) => jobs,
            Err(err) => {
                warn!(%run_id, error = %err, "job feed failed, continuing without jobs");
                load_error.get_or_insert_with(|| err.to_string());
                Vec::new()
            }
        };
        let companies = match self.fetch_companies().await {
            Ok(companies) => companies,
            Err(err) => {
                warn!(%run_id, error = %err, "company feed failed, continuing without companies");
                load_error.get_or_insert_with(|| err.to_string());
                Vec::new()
            }
        };

        let mut events = outcome.events;
        backfill_company_ids(&mut events, &companies);

        Snapshot {
            events,
            jobs,
            companies,
            truncated: outcome.truncated,
            load_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn wire_event(json: serde_json::Value) -> WireEvent {
        serde_json::from_value(json).expect("wire event")
    }

    #[test]
    fn reply_and_forward_subjects_are_rejected() {
        let filter = ReplyFilter::new();
        assert!(filter.is_reply_or_forward("Re: 応募がありました"));
        assert!(filter.is_reply_or_forward("FW： 応募通知"));
        assert!(filter.is_reply_or_forward("fwd: candidate"));
        assert!(filter.is_reply_or_forward("転送: 応募のお知らせ"));
        assert!(filter.is_reply_or_forward("[社外] [重要] Re: 応募"));
        assert!(filter.is_reply_or_forward("Re: 応募のご連絡"));
        assert!(filter.is_reply_or_forward("[PR] Fwd: hello"));
        assert!(!filter.is_reply_or_forward("ご応募ありがとうございます"));
        assert!(!filter.is_reply_or_forward("応募がありました"));
        // Markers must sit at a word boundary with a colon.
        assert!(!filter.is_reply_or_forward("hire now"));
        assert!(!filter.is_reply_or_forward("返信をお待ちしています"));
    }

    #[test]
    fn wire_event_accepts_both_casings() {
        let camel = wire_event(serde_json::json!({
            "id": "e1",
            "messageId": "m1",
            "fromEmail": "a@example.com",
            "companyName": "ACME",
            "subject": "応募",
            "receivedAt": "2026-08-01T09:00:00+09:00",
            "siteKey": "Indeed"
        }));
        let snake = wire_event(serde_json::json!({
            "id": "e1",
            "message_id": "m1",
            "from_email": "a@example.com",
            "company_name": "ACME",
            "subject": "応募",
            "received_at": "2026-08-01T09:00:00+09:00",
            "site_key": "Indeed"
        }));
        let filter = ReplyFilter::new();
        let a = convert_event(camel, &filter).expect("camel converts");
        let b = convert_event(snake, &filter).expect("snake converts");
        assert_eq!(a, b);
        assert_eq!(a.channel_hint, "Indeed");
        assert_eq!(a.received_at, Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn job_and_company_lists_accept_bare_and_wrapped_shapes() {
        let bare: WireList<WireCompany> =
            serde_json::from_value(serde_json::json!([{ "id": "c-1", "name": "ACME" }]))
                .expect("bare list");
        assert_eq!(bare.into_vec().len(), 1);
        let wrapped: WireList<WireJob> = serde_json::from_value(serde_json::json!({
            "jobs": [{ "id": "j-1", "title": "調理スタッフ", "siteStatus": { "Indeed": {} } }]
        }))
        .expect("wrapped list");
        let jobs = wrapped.into_vec();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].site_status.contains_key("Indeed"));
    }

    #[test]
    fn page_envelope_reads_both_flag_placements() {
        let nested: WireEventPage =
            serde_json::from_value(serde_json::json!({ "items": [], "page": { "hasNext": true } }))
                .expect("nested envelope");
        assert!(nested.has_next());
        let flat: WireEventPage =
            serde_json::from_value(serde_json::json!({ "emails": [], "hasNext": true }))
                .expect("flat envelope");
        assert!(flat.has_next());
        let terminal: WireEventPage =
            serde_json::from_value(serde_json::json!({ "items": [] })).expect("bare envelope");
        assert!(!terminal.has_next());
    }

    #[test]
    fn timestamp_fallback_and_unparseable_rows() {
        assert_eq!(
            parse_timestamp("2026-08-01 12:30:00"),
            Some(Utc.with_ymd_and_hms(2026, 8, 1, 12, 30, 0).unwrap())
        );
        assert_eq!(parse_timestamp("not a date"), None);

        let filter = ReplyFilter::new();
        let bad = wire_event(serde_json::json!({
            "id": "e9",
            "subject": "応募",
            "receivedAt": "yesterday-ish"
        }));
        assert!(convert_event(bad, &filter).is_none());
    }

    #[test]
    fn events_sort_newest_first_and_dedup_by_id() {
        let filter = ReplyFilter::new();
        let mut events: Vec<RawEvent> = ["e1", "e2", "e1", "e3"]
            .iter()
            .enumerate()
            .filter_map(|(i, id)| {
                convert_event(
                    wire_event(serde_json::json!({
                        "id": id,
                        "subject": "応募",
                        "receivedAt": format!("2026-08-0{}T00:00:00Z", i + 1)
                    })),
                    &filter,
                )
            })
            .collect();
        sort_and_dedup(&mut events);
        let ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e3", "e1", "e2"]);
    }

    #[test]
    fn company_ids_backfill_by_name_case_insensitively() {
        let filter = ReplyFilter::new();
        let mut events = vec![convert_event(
            wire_event(serde_json::json!({
                "id": "e1",
                "subject": "応募",
                "companyName": "Acme Foods ",
                "receivedAt": "2026-08-01T00:00:00Z"
            })),
            &filter,
        )
        .expect("converts")];
        let companies = vec![Company {
            id: "c-9".into(),
            name: "ACME FOODS".into(),
        }];
        backfill_company_ids(&mut events, &companies);
        assert_eq!(events[0].company_id.as_deref(), Some("c-9"));
    }
}
