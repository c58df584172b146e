//! Aggregation over an ingested snapshot.
//!
//! Everything here is a pure function of one [`Snapshot`], one
//! [`Scope`] and one captured clock instant. Rows, series, insights
//! and funnels are recomputed on every pass and never persisted.
//!
//! Time bucketing is calendar-local: an event lands in the day and
//! month of the viewer's timezone, not UTC. The sparkline deliberately
//! ignores the month filter so a trend stays visible while a single
//! month is selected.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Datelike, Days, Local, NaiveDate, TimeZone, Utc};
use oubo_channel::ChannelResolver;
use oubo_core::{
    Alert, Channel, FunnelStage, FunnelSummary, Insight, Job, JobRow, MonthBucket, MonthFilter,
    RawEvent, Scope, SiteRow, Snapshot, Tone, Totals,
};
use serde::Serialize;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "oubo-analytics";

/// Days covered by the per-channel sparkline.
pub const SPARK_DAYS: usize = 28;
/// Months covered by the rolling time series.
pub const SERIES_MONTHS: usize = 6;
/// Month-over-month drop (percent) below which an alert fires.
pub const ALERT_DROP_PERCENT: f64 = -30.0;
/// Applications per posted job considered healthy.
pub const GOOD_RATE: f64 = 0.3;
/// Rate under which a channel with meaningful postings is flagged.
pub const LOW_RATE: f64 = 0.1;
/// Posted jobs needed before a low rate is worth flagging.
pub const LOW_RATE_MIN_POSTED: u32 = 5;

/// Maps UTC instants onto the viewer's calendar.
///
/// The clock is captured once at construction so every window in a
/// pass agrees on what "today" is, including across a midnight rollover
/// mid-pass.
#[derive(Debug, Clone)]
pub struct TimeBucketer<Tz: TimeZone> {
    tz: Tz,
    now_utc: DateTime<Utc>,
    today: NaiveDate,
}

impl TimeBucketer<Local> {
    pub fn local(now: DateTime<Utc>) -> Self {
        Self::new(Local, now)
    }
}

impl<Tz: TimeZone> TimeBucketer<Tz> {
    pub fn new(tz: Tz, now: DateTime<Utc>) -> Self {
        let today = now.with_timezone(&tz).date_naive();
        Self {
            tz,
            now_utc: now,
            today,
        }
    }

    pub fn now_utc(&self) -> DateTime<Utc> {
        self.now_utc
    }

    /// Local calendar day of an instant, `YYYY-MM-DD`.
    pub fn day_key(&self, ts: DateTime<Utc>) -> String {
        ts.with_timezone(&self.tz)
            .date_naive()
            .format("%Y-%m-%d")
            .to_string()
    }

    /// Local calendar month of an instant, `YYYY-MM`.
    pub fn month_key(&self, ts: DateTime<Utc>) -> String {
        ts.with_timezone(&self.tz)
            .date_naive()
            .format("%Y-%m")
            .to_string()
    }

    pub fn current_month_key(&self) -> String {
        self.today.format("%Y-%m").to_string()
    }

    pub fn is_in_month(&self, ts: DateTime<Utc>, ym: &str) -> bool {
        self.month_key(ts) == ym
    }

    /// The trailing window of local days ending today, oldest first.
    pub fn last_day_keys(&self, days: usize) -> Vec<String> {
        (0..days as u64)
            .rev()
            .filter_map(|back| self.today.checked_sub_days(Days::new(back)))
            .map(|d| d.format("%Y-%m-%d").to_string())
            .collect()
    }

    /// The trailing window of calendar months ending the current one,
    /// oldest first.
    pub fn last_month_keys(&self, months: usize) -> Vec<String> {
        let anchor = self.today.year() * 12 + self.today.month() as i32 - 1;
        (0..months as i32)
            .rev()
            .map(|back| {
                let idx = anchor - back;
                format!("{:04}-{:02}", idx.div_euclid(12), idx.rem_euclid(12) + 1)
            })
            .collect()
    }
}

/// One complete derived report, serialized as-is by the web layer.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsReport {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub scope: Scope,
    pub totals: Totals,
    pub site_rows: Vec<SiteRowView>,
    pub job_rows: Vec<JobRow>,
    pub months: Vec<MonthBucket>,
    pub insights: Vec<Insight>,
    pub alerts: Vec<Alert>,
    pub truncated: bool,
    pub load_error: Option<String>,
}

/// [`SiteRow`] plus the icon the registry knows for the channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SiteRowView {
    #[serde(flatten)]
    pub row: SiteRow,
    pub icon: Option<String>,
}

pub struct AggregationEngine<Tz: TimeZone> {
    resolver: ChannelResolver,
    bucketer: TimeBucketer<Tz>,
}

impl<Tz: TimeZone> AggregationEngine<Tz> {
    pub fn new(resolver: ChannelResolver, bucketer: TimeBucketer<Tz>) -> Self {
        Self { resolver, bucketer }
    }

    pub fn resolver(&self) -> &ChannelResolver {
        &self.resolver
    }

    pub fn bucketer(&self) -> &TimeBucketer<Tz> {
        &self.bucketer
    }

    fn in_company<'a>(&self, events: &'a [RawEvent], scope: &Scope) -> Vec<&'a RawEvent> {
        events
            .iter()
            .filter(|e| match &scope.company_id {
                Some(id) => e.company_id.as_deref() == Some(id.as_str()),
                None => true,
            })
            .collect()
    }

    fn in_month<'a>(&self, events: &[&'a RawEvent], scope: &Scope) -> Vec<&'a RawEvent> {
        match scope.month.month() {
            None => events.to_vec(),
            Some(ym) => events
                .iter()
                .copied()
                .filter(|e| self.bucketer.is_in_month(e.received_at, ym))
                .collect(),
        }
    }

    fn scoped_jobs<'a>(&self, jobs: &'a [Job], scope: &Scope) -> Vec<&'a Job> {
        jobs.iter()
            .filter(|j| match &scope.company_id {
                Some(id) => j.company_id.as_deref() == Some(id.as_str()),
                None => true,
            })
            .collect()
    }

    /// Jobs currently posted per canonical channel. A job counts once
    /// per channel key present in its publication map, whatever the
    /// stored state says.
    pub fn posted_by_channel(&self, jobs: &[&Job]) -> BTreeMap<Channel, u32> {
        let registry = self.resolver.registry();
        let mut posted: BTreeMap<Channel, u32> = BTreeMap::new();
        for job in jobs {
            let channels: HashSet<Channel> = job
                .site_status
                .keys()
                .map(|raw| registry.canonicalize(raw))
                .collect();
            for channel in channels {
                *posted.entry(channel).or_insert(0) += 1;
            }
        }
        posted
    }

    /// Per-channel performance rows for the scope.
    ///
    /// Application counts honor both filters; the sparkline honors only
    /// the company filter.
    pub fn site_rows(&self, snapshot: &Snapshot, scope: &Scope) -> Vec<SiteRowView> {
        let registry = self.resolver.registry();
        let company_events = self.in_company(&snapshot.events, scope);
        let month_events = self.in_month(&company_events, scope);

        let mut apps: BTreeMap<Channel, u32> = BTreeMap::new();
        for event in &month_events {
            *apps.entry(self.resolver.resolve(event)).or_insert(0) += 1;
        }

        let posted = self.posted_by_channel(&self.scoped_jobs(&snapshot.jobs, scope));

        let day_keys = self.bucketer.last_day_keys(SPARK_DAYS);
        let slot_of: HashMap<&str, usize> = day_keys
            .iter()
            .enumerate()
            .map(|(i, k)| (k.as_str(), i))
            .collect();
        let mut sparks: BTreeMap<Channel, Vec<u32>> = BTreeMap::new();
        for event in &company_events {
            let key = self.bucketer.day_key(event.received_at);
            if let Some(&slot) = slot_of.get(key.as_str()) {
                let spark = sparks
                    .entry(self.resolver.resolve(event))
                    .or_insert_with(|| vec![0u32; SPARK_DAYS]);
                spark[slot] += 1;
            }
        }

        // Known channels always render, even at zero, with extras the
        // data surfaced appended after.
        let mut channels: Vec<Channel> =
            registry.display_order().map(|d| d.key.clone()).collect();
        for extra in apps.keys().chain(posted.keys()) {
            if !channels.contains(extra) {
                channels.push(extra.clone());
            }
        }

        let mut rows: Vec<SiteRowView> = channels
            .into_iter()
            .map(|channel| {
                let applications = apps.get(&channel).copied().unwrap_or(0);
                let posted_jobs = posted.get(&channel).copied().unwrap_or(0);
                let app_rate = if posted_jobs > 0 {
                    Some(f64::from(applications) / f64::from(posted_jobs))
                } else {
                    None
                };
                let spark = sparks
                    .get(&channel)
                    .cloned()
                    .unwrap_or_else(|| vec![0u32; SPARK_DAYS]);
                SiteRowView {
                    icon: registry.icon(&channel).map(str::to_string),
                    row: SiteRow {
                        label: registry.label(&channel),
                        channel,
                        posted_jobs,
                        applications,
                        app_rate,
                        spark,
                    },
                }
            })
            .collect();

        rows.sort_by(|a, b| {
            b.row
                .applications
                .cmp(&a.row.applications)
                .then_with(|| {
                    let ra = a.row.app_rate.unwrap_or(-1.0);
                    let rb = b.row.app_rate.unwrap_or(-1.0);
                    rb.total_cmp(&ra)
                })
                .then_with(|| a.row.label.cmp(&b.row.label))
        });
        rows
    }

    /// Per-job application counts for the scope, most applied first.
    pub fn job_rows(&self, snapshot: &Snapshot, scope: &Scope) -> Vec<JobRow> {
        let company_events = self.in_company(&snapshot.events, scope);
        let month_events = self.in_month(&company_events, scope);

        let jobs_by_id: HashMap<&str, &Job> =
            snapshot.jobs.iter().map(|j| (j.id.as_str(), j)).collect();
        let companies_by_id: HashMap<&str, &str> = snapshot
            .companies
            .iter()
            .map(|c| (c.id.as_str(), c.name.as_str()))
            .collect();

        let mut counts: HashMap<&str, u32> = HashMap::new();
        let mut by_channel: HashMap<&str, BTreeMap<Channel, u32>> = HashMap::new();
        let mut fallback_company: HashMap<&str, &str> = HashMap::new();
        for event in &month_events {
            let Some(job_id) = event.job_id.as_deref() else {
                continue;
            };
            *counts.entry(job_id).or_insert(0) += 1;
            *by_channel
                .entry(job_id)
                .or_default()
                .entry(self.resolver.resolve(event))
                .or_insert(0) += 1;
            if let Some(name) = event.company_name.as_deref() {
                fallback_company.entry(job_id).or_insert(name);
            }
        }

        let mut rows: Vec<JobRow> = counts
            .into_iter()
            .map(|(job_id, applications)| {
                let job = jobs_by_id.get(job_id).copied();
                let title = job
                    .map(|j| j.title.clone())
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| "(不明な求人)".to_string());
                let company_name = job
                    .and_then(|j| j.company_id.as_deref())
                    .and_then(|cid| companies_by_id.get(cid).copied())
                    .or_else(|| fallback_company.get(job_id).copied())
                    .unwrap_or_default()
                    .to_string();
                // Ties go to the lexicographically smaller label so the
                // ranking is stable run to run.
                let registry = self.resolver.registry();
                let top_channel = by_channel.get(job_id).and_then(|m| {
                    m.iter()
                        .max_by(|(ka, va), (kb, vb)| {
                            va.cmp(vb)
                                .then_with(|| registry.label(kb).cmp(&registry.label(ka)))
                        })
                        .map(|(k, _)| k.clone())
                });
                JobRow {
                    job_id: job_id.to_string(),
                    title,
                    company_name,
                    applications,
                    top_channel,
                }
            })
            .collect();

        rows.sort_by(|a, b| {
            b.applications
                .cmp(&a.applications)
                .then_with(|| a.title.cmp(&b.title))
        });
        rows
    }

    /// Rolling six-month series ending the current local month. Only
    /// the company filter applies; the series is the context a month
    /// filter is judged against.
    pub fn month_series(&self, snapshot: &Snapshot, scope: &Scope) -> Vec<MonthBucket> {
        let company_events = self.in_company(&snapshot.events, scope);
        let keys = self.bucketer.last_month_keys(SERIES_MONTHS);
        let mut buckets: BTreeMap<&str, MonthBucket> = keys
            .iter()
            .map(|ym| {
                (
                    ym.as_str(),
                    MonthBucket {
                        ym: ym.clone(),
                        total: 0,
                        by_channel: BTreeMap::new(),
                    },
                )
            })
            .collect();
        for event in &company_events {
            let ym = self.bucketer.month_key(event.received_at);
            if let Some(bucket) = buckets.get_mut(ym.as_str()) {
                bucket.total += 1;
                *bucket
                    .by_channel
                    .entry(self.resolver.resolve(event))
                    .or_insert(0) += 1;
            }
        }
        keys.iter()
            .filter_map(|ym| buckets.remove(ym.as_str()))
            .collect()
    }

    /// Channels whose applications dropped more than the threshold
    /// against the previous month. Only meaningful when a single month
    /// is selected; ordered worst drop first.
    pub fn alerts(&self, months: &[MonthBucket], scope: &Scope) -> Vec<Alert> {
        let Some(ym) = scope.month.month() else {
            return Vec::new();
        };
        let Some(pos) = months.iter().position(|b| b.ym == ym) else {
            return Vec::new();
        };
        if pos == 0 {
            return Vec::new();
        }
        let current = &months[pos];
        let previous = &months[pos - 1];

        let registry = self.resolver.registry();
        let mut alerts: Vec<Alert> = previous
            .by_channel
            .iter()
            .filter(|(_, prev)| **prev > 0)
            .filter_map(|(channel, prev)| {
                let cur = current.by_channel.get(channel).copied().unwrap_or(0);
                let change = (f64::from(cur) - f64::from(*prev)) / f64::from(*prev) * 100.0;
                (change < ALERT_DROP_PERCENT).then(|| Alert {
                    channel: channel.clone(),
                    label: registry.label(channel),
                    percent_change: change,
                })
            })
            .collect();
        alerts.sort_by(|a, b| a.percent_change.total_cmp(&b.percent_change));
        alerts
    }

    /// The four fixed-slot insights over the current rows.
    pub fn insights(&self, rows: &[SiteRowView]) -> Vec<Insight> {
        let mut out = Vec::with_capacity(4);

        // Strongest inbound channel, direct mail excluded.
        let top = rows
            .iter()
            .filter(|r| !r.row.channel.is_direct())
            .max_by_key(|r| r.row.applications);
        out.push(match top.filter(|r| r.row.applications > 0) {
            Some(r) => Insight {
                tone: Tone::Good,
                title: "主要流入".to_string(),
                detail: format!(
                    "応募が最も多いのは{}({}件)です。",
                    r.row.label, r.row.applications
                ),
            },
            None => Insight {
                tone: Tone::Neutral,
                title: "主要流入".to_string(),
                detail: "媒体経由の応募はまだありません。".to_string(),
            },
        });

        // Best applications-per-posting among channels with a
        // computable rate.
        let best = rows
            .iter()
            .filter(|r| !r.row.channel.is_direct())
            .filter_map(|r| r.row.app_rate.map(|rate| (r, rate)))
            .max_by(|(_, a), (_, b)| a.total_cmp(b));
        out.push(match best {
            Some((r, rate)) => Insight {
                tone: if rate >= GOOD_RATE {
                    Tone::Good
                } else {
                    Tone::Warn
                },
                title: "効率".to_string(),
                detail: format!("応募/掲載が最も高いのは{}({:.2})です。", r.row.label, rate),
            },
            None => Insight {
                tone: Tone::Neutral,
                title: "効率".to_string(),
                detail: "掲載中の媒体がありません。".to_string(),
            },
        });

        // Applications arriving on channels with no recorded posting
        // usually mean the posting map is stale or misattributed.
        let mismatched: Vec<&SiteRowView> = rows
            .iter()
            .filter(|r| r.row.posted_jobs == 0 && r.row.applications > 0)
            .collect();
        out.push(if mismatched.is_empty() {
            Insight {
                tone: Tone::Good,
                title: "定義ズレ".to_string(),
                detail: "掲載と応募の対応にズレはありません。".to_string(),
            }
        } else {
            let names: Vec<&str> = mismatched
                .iter()
                .take(2)
                .map(|r| r.row.label.as_str())
                .collect();
            Insight {
                tone: Tone::Warn,
                title: "定義ズレ".to_string(),
                detail: format!(
                    "掲載なしで応募が届いている媒体があります: {}。求人の掲載設定を確認してください。",
                    names.join("、")
                ),
            }
        });

        // A channel carrying real posting volume but near-zero return.
        let worst = rows
            .iter()
            .filter(|r| !r.row.channel.is_direct())
            .filter_map(|r| {
                r.row
                    .app_rate
                    .filter(|rate| r.row.posted_jobs >= LOW_RATE_MIN_POSTED && *rate < LOW_RATE)
                    .map(|rate| (r, rate))
            })
            .min_by(|(_, a), (_, b)| a.total_cmp(b));
        out.push(match worst {
            Some((r, rate)) => Insight {
                tone: Tone::Bad,
                title: "低効率".to_string(),
                detail: format!(
                    "{}は掲載{}件に対し応募{}件(率{:.2})と低調です。",
                    r.row.label, r.row.posted_jobs, r.row.applications, rate
                ),
            },
            None => Insight {
                tone: Tone::Neutral,
                title: "低効率".to_string(),
                detail: "掲載数に見合わない低効率の媒体はありません。".to_string(),
            },
        });

        out
    }

    pub fn totals(&self, snapshot: &Snapshot, scope: &Scope, rows: &[SiteRowView]) -> Totals {
        let company_events = self.in_company(&snapshot.events, scope);
        let month_events = self.in_month(&company_events, scope);
        let jobs_with_applications = month_events
            .iter()
            .filter_map(|e| e.job_id.as_deref())
            .collect::<HashSet<_>>()
            .len() as u32;
        Totals {
            posted_jobs: self.scoped_jobs(&snapshot.jobs, scope).len() as u32,
            applications: month_events.len() as u32,
            channels: rows.iter().filter(|r| r.row.applications > 0).count() as u32,
            jobs_with_applications,
        }
    }

    /// Current-status funnel for one company, optionally narrowed to
    /// one calendar month.
    pub fn funnel(&self, snapshot: &Snapshot, company_id: &str, month: &MonthFilter) -> FunnelSummary {
        let scope = Scope {
            company_id: Some(company_id.to_string()),
            month: month.clone(),
        };
        let events = self.in_company(&snapshot.events, &scope);
        let events = self.in_month(&events, &scope);

        let mut counts: BTreeMap<FunnelStage, u32> =
            FunnelStage::ALL.iter().map(|s| (*s, 0)).collect();
        for event in &events {
            *counts.entry(FunnelStage::from_raw(&event.status)).or_insert(0) += 1;
        }
        let total = events.len() as u32;
        let week_ago = self.bucketer.now_utc() - chrono::Duration::days(7);
        let last_7_days = events.iter().filter(|e| e.received_at >= week_ago).count() as u32;
        let latest_received_at = events.iter().map(|e| e.received_at).max();

        let registered = counts[&FunnelStage::Registered];
        let interview = counts[&FunnelStage::Interview];
        let offer = counts[&FunnelStage::Offer];
        let ratio = |num: u32, den: u32| (den > 0).then(|| f64::from(num) / f64::from(den));

        FunnelSummary {
            total,
            last_7_days,
            latest_received_at,
            registered_per_new: ratio(registered, total),
            interview_per_registered: ratio(interview, registered),
            offer_per_interview: ratio(offer, interview),
            interview_per_new: ratio(interview, total),
            offer_per_new: ratio(offer, total),
            counts,
        }
    }

    /// Full derived report for one scope.
    pub fn run_pass(&self, snapshot: &Snapshot, scope: &Scope) -> AnalyticsReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("analytics_pass", %run_id, company = scope.company_id.as_deref().unwrap_or("all"));
        let _guard = span.enter();

        let site_rows = self.site_rows(snapshot, scope);
        let job_rows = self.job_rows(snapshot, scope);
        let months = self.month_series(snapshot, scope);
        let alerts = self.alerts(&months, scope);
        let insights = self.insights(&site_rows);
        let totals = self.totals(snapshot, scope, &site_rows);

        AnalyticsReport {
            run_id,
            generated_at: self.bucketer.now_utc(),
            scope: scope.clone(),
            totals,
            site_rows,
            job_rows,
            months,
            insights,
            alerts,
            truncated: snapshot.truncated,
            load_error: snapshot.load_error.clone(),
        }
    }
}

/// Per-channel rows as CSV, the shape operators paste into
/// spreadsheets. The rate column renders `-` when not computable,
/// never a fake zero.
pub fn site_rows_csv(rows: &[SiteRowView]) -> String {
    let mut out = String::from("媒体,掲載求人,応募数,応募/掲載,28日トレンド合計\n");
    for row in rows {
        let rate = match row.row.app_rate {
            Some(rate) => format!("{rate:.2}"),
            None => "-".to_string(),
        };
        let trend: u32 = row.row.spark.iter().sum();
        out.push_str(&format!(
            "{},{},{},{},{}\n",
            csv_field(&row.row.label),
            row.row.posted_jobs,
            row.row.applications,
            rate,
            trend
        ));
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;
    use oubo_core::Company;

    fn jst() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).expect("offset")
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 30, 3, 0, 0).unwrap()
    }

    fn bucketer() -> TimeBucketer<FixedOffset> {
        TimeBucketer::new(jst(), now())
    }

    fn engine() -> AggregationEngine<FixedOffset> {
        AggregationEngine::new(ChannelResolver::default(), bucketer())
    }

    fn event(id: &str, from: &str, hint: &str, received: DateTime<Utc>) -> RawEvent {
        RawEvent {
            id: id.to_string(),
            source_message_id: format!("m-{id}"),
            thread_id: None,
            from_address: from.to_string(),
            to_address: None,
            company_id: Some("c-1".to_string()),
            company_name: Some("テスト商事".to_string()),
            job_id: Some("j-1".to_string()),
            subject: "応募がありました".to_string(),
            snippet: None,
            received_at: received,
            channel_hint: hint.to_string(),
            status: "new".to_string(),
            created_at: None,
            updated_at: None,
        }
    }

    fn job(id: &str, channels: &[&str]) -> Job {
        Job {
            id: id.to_string(),
            company_id: Some("c-1".to_string()),
            title: format!("求人{id}"),
            site_status: channels
                .iter()
                .map(|c| (c.to_string(), Default::default()))
                .collect(),
            updated_at: None,
        }
    }

    fn snapshot(events: Vec<RawEvent>, jobs: Vec<Job>) -> Snapshot {
        Snapshot {
            events,
            jobs,
            companies: vec![Company {
                id: "c-1".into(),
                name: "テスト商事".into(),
            }],
            truncated: false,
            load_error: None,
        }
    }

    #[test]
    fn day_bucketing_follows_local_midnight() {
        let b = bucketer();
        // 14:30 UTC is already the next local day at +09:00.
        let ts = Utc.with_ymd_and_hms(2026, 8, 1, 14, 30, 0).unwrap();
        assert_eq!(b.day_key(ts), "2026-08-01");
        let ts = Utc.with_ymd_and_hms(2026, 8, 1, 15, 30, 0).unwrap();
        assert_eq!(b.day_key(ts), "2026-08-02");
        assert_eq!(b.month_key(Utc.with_ymd_and_hms(2026, 7, 31, 16, 0, 0).unwrap()), "2026-08");
    }

    #[test]
    fn trailing_windows_end_today_and_cross_year_boundaries() {
        let b = bucketer();
        let days = b.last_day_keys(SPARK_DAYS);
        assert_eq!(days.len(), SPARK_DAYS);
        assert_eq!(days.first().map(String::as_str), Some("2026-08-03"));
        assert_eq!(days.last().map(String::as_str), Some("2026-08-30"));

        let months = b.last_month_keys(SERIES_MONTHS);
        assert_eq!(months, vec!["2026-03", "2026-04", "2026-05", "2026-06", "2026-07", "2026-08"]);

        let january = TimeBucketer::new(jst(), Utc.with_ymd_and_hms(2026, 1, 15, 0, 0, 0).unwrap());
        assert_eq!(
            january.last_month_keys(3),
            vec!["2025-11", "2025-12", "2026-01"]
        );
    }

    #[test]
    fn site_rows_attribute_by_cascade_not_stored_hint() {
        let e = engine();
        // One event attributed by its stored hint, one whose jmty
        // sender domain overrides a missing hint. Only Indeed has a
        // live posting.
        let snap = snapshot(
            vec![
                event("e1", "someone@example.com", "indeed", now()),
                event("e2", "info@vm.jmty.jp", "", now()),
            ],
            vec![job("j-1", &["Indeed"])],
        );
        let rows = e.site_rows(&snap, &Scope::default());
        let jmty = rows.iter().find(|r| r.row.channel.as_str() == "ジモティー").unwrap();
        let indeed = rows.iter().find(|r| r.row.channel.as_str() == "Indeed").unwrap();
        assert_eq!(indeed.row.applications, 1);
        assert_eq!(indeed.row.posted_jobs, 1);
        assert_eq!(indeed.row.app_rate, Some(1.0));
        assert_eq!(jmty.row.applications, 1);
        assert_eq!(jmty.row.posted_jobs, 0);
        // Never posted means the rate is not computable, not zero.
        assert_eq!(jmty.row.app_rate, None);

        // Applications without a posting surface as the mismatch insight.
        let insights = e.insights(&rows);
        assert_eq!(insights[2].tone, Tone::Warn);
        assert!(insights[2].detail.contains("ジモティー"));
    }

    #[test]
    fn sparkline_ignores_month_filter() {
        let e = engine();
        let early = Utc.with_ymd_and_hms(2026, 8, 9, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2026, 8, 29, 0, 0, 0).unwrap();
        let snap = snapshot(
            vec![
                event("e1", "no-reply@indeedemail.com", "", early),
                event("e2", "no-reply@indeedemail.com", "", late),
            ],
            vec![],
        );
        let scope = Scope {
            company_id: None,
            month: MonthFilter::Month("2026-09".into()),
        };
        let rows = e.site_rows(&snap, &scope);
        let indeed = rows.iter().find(|r| r.row.channel.as_str() == "Indeed").unwrap();
        // No September applications, but the 28-day trend still shows both.
        assert_eq!(indeed.row.applications, 0);
        assert_eq!(indeed.row.spark.iter().sum::<u32>(), 2);
    }

    #[test]
    fn rows_order_by_applications_then_rate_then_label() {
        let e = engine();
        let mk = |id: &str, from: &str| event(id, from, "", now());
        let snap = snapshot(
            vec![
                mk("e1", "a@saiyo-kakaricho.com"),
                mk("e2", "b@saiyo-kakaricho.com"),
                mk("e3", "no-reply@indeedemail.com"),
                mk("e4", "x@en-gage.net"),
            ],
            vec![job("j-1", &["Indeed"]), job("j-2", &["Engage", "Indeed"])],
        );
        let rows = e.site_rows(&snap, &Scope::default());
        let keys: Vec<&str> = rows.iter().take(3).map(|r| r.row.channel.as_str()).collect();
        // 採用係長 has 2 apps; Indeed and Engage have 1 each but Engage's
        // rate (1/1) beats Indeed's (1/2).
        assert_eq!(keys, vec!["採用係長", "Engage", "Indeed"]);
    }

    #[test]
    fn month_over_month_alerts_fire_below_threshold() {
        let e = engine();
        let prev = Utc.with_ymd_and_hms(2026, 7, 10, 0, 0, 0).unwrap();
        let cur = Utc.with_ymd_and_hms(2026, 8, 10, 0, 0, 0).unwrap();
        let mut events = Vec::new();
        // Indeed: 5 -> 3, a 40 percent drop. Engage: 5 -> 4, only 20.
        for i in 0..5 {
            events.push(event(&format!("i{i}"), "no-reply@indeedemail.com", "", prev));
            events.push(event(&format!("g{i}"), "x@en-gage.net", "", prev));
        }
        for i in 0..3 {
            events.push(event(&format!("ic{i}"), "no-reply@indeedemail.com", "", cur));
        }
        for i in 0..4 {
            events.push(event(&format!("gc{i}"), "x@en-gage.net", "", cur));
        }
        let snap = snapshot(events, vec![]);

        let all = e.alerts(&e.month_series(&snap, &Scope::default()), &Scope::default());
        assert!(all.is_empty());

        let scope = Scope {
            company_id: None,
            month: MonthFilter::Month("2026-08".into()),
        };
        let alerts = e.alerts(&e.month_series(&snap, &scope), &scope);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].channel.as_str(), "Indeed");
        assert!((alerts[0].percent_change - -40.0).abs() < 1e-9);
    }

    #[test]
    fn insights_flag_posting_mismatch_and_low_efficiency() {
        let e = engine();
        let mut events: Vec<RawEvent> = (0..2)
            .map(|i| event(&format!("j{i}"), "info@vm.jmty.jp", "", now()))
            .collect();
        events.push(event("i0", "no-reply@indeedemail.com", "", now()));
        // Indeed posted on 15 jobs but only 1 application.
        let jobs: Vec<Job> = (0..15)
            .map(|i| job(&format!("j-{i}"), &["Indeed"]))
            .collect();
        let snap = snapshot(events, jobs);
        let rows = e.site_rows(&snap, &Scope::default());
        let insights = e.insights(&rows);
        assert_eq!(insights.len(), 4);

        let mismatch = &insights[2];
        assert_eq!(mismatch.tone, Tone::Warn);
        assert!(mismatch.detail.contains("ジモティー"));

        let low = &insights[3];
        assert_eq!(low.tone, Tone::Bad);
        assert!(low.detail.contains("indeed"));
    }

    #[test]
    fn funnel_ratios_skip_zero_denominators() {
        let e = engine();
        let mut events = Vec::new();
        for (i, status) in ["new", "registered", "registered", "interview", "ng", "選考中"]
            .iter()
            .enumerate()
        {
            let mut ev = event(&format!("e{i}"), "a@example.com", "", now());
            ev.status = status.to_string();
            events.push(ev);
        }
        let snap = snapshot(events, vec![]);
        let funnel = e.funnel(&snap, "c-1", &MonthFilter::All);

        assert_eq!(funnel.total, 6);
        assert_eq!(funnel.counts[&FunnelStage::Registered], 2);
        assert_eq!(funnel.counts[&FunnelStage::Other], 1);
        assert_eq!(funnel.registered_per_new, Some(2.0 / 6.0));
        assert_eq!(funnel.interview_per_registered, Some(0.5));
        // No offers yet, but the interview denominator exists, so the
        // ratio is a real zero rather than "not computable".
        assert_eq!(funnel.offer_per_interview, Some(0.0));
        assert_eq!(funnel.offer_per_new, Some(0.0));
        assert_eq!(funnel.last_7_days, 6);

        let empty = e.funnel(&snapshot(vec![], vec![]), "c-1", &MonthFilter::All);
        assert_eq!(empty.total, 0);
        assert_eq!(empty.registered_per_new, None);
        assert_eq!(empty.interview_per_registered, None);
        assert_eq!(empty.latest_received_at, None);
    }

    #[test]
    fn csv_renders_dash_for_unpostable_rate_and_quotes_fields() {
        let rows = vec![SiteRowView {
            icon: None,
            row: SiteRow {
                channel: Channel::new("Weird,Board"),
                label: "Weird,Board".to_string(),
                posted_jobs: 0,
                applications: 3,
                app_rate: None,
                spark: vec![1; SPARK_DAYS],
            },
        }];
        let csv = site_rows_csv(&rows);
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("媒体,掲載求人,応募数,応募/掲載,28日トレンド合計"));
        assert_eq!(lines.next(), Some("\"Weird,Board\",0,3,-,28"));
    }

    #[test]
    fn report_carries_snapshot_caveats() {
        let e = engine();
        let mut snap = snapshot(vec![event("e1", "a@example.com", "", now())], vec![]);
        snap.truncated = true;
        snap.load_error = Some("feed returned http 502".to_string());
        let report = e.run_pass(&snap, &Scope::default());
        assert!(report.truncated);
        assert_eq!(report.load_error.as_deref(), Some("feed returned http 502"));
        assert_eq!(report.totals.applications, 1);
        assert_eq!(report.insights.len(), 4);
    }

    #[test]
    fn totals_count_jobs_not_yet_posted_anywhere() {
        let e = engine();
        // j-2 has no site listings yet; the headline job count still
        // includes it, while per-channel posted counts do not.
        let snap = snapshot(
            vec![event("e1", "a@example.com", "Indeed", now())],
            vec![job("j-1", &["Indeed"]), job("j-2", &[])],
        );
        let report = e.run_pass(&snap, &Scope::default());
        assert_eq!(report.totals.posted_jobs, 2);
        let indeed = report
            .site_rows
            .iter()
            .find(|r| r.row.channel.as_str() == "Indeed")
            .unwrap();
        assert_eq!(indeed.row.posted_jobs, 1);
    }
}
