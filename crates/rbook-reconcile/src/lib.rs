//! Request reconciliation: normalization, record matching, request dedup,
//! roster mutation, and batch runs with journaled write-back.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, NaiveDateTime, Timelike, Utc};
use rbook_core::{
    CoreError, FieldMapping, FieldPair, Identity, RequestAction, RequestColumns, RequestLayout,
    RequestLog, RequestRow, ResolvedMapping, RosterColumns, RosterTable,
};
use rbook_storage::{
    render_csv, CommitJournal, CsvFileSource, HttpClientConfig, HttpCsvSource, HttpFetcher,
    RecoveryOutcome, SheetSource,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{info, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rbook-reconcile";

/// First and last request columns of the legacy positional payload range.
pub const PAYLOAD_START: &str = "First Name";
pub const PAYLOAD_END: &str = "Upload Resume";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("request row {position} asks to {action} a resume but has no email in either email column")]
    MissingIdentity {
        position: usize,
        action: RequestAction,
    },
    #[error(transparent)]
    Core(#[from] CoreError),
}

// Normalization

/// Lower-cases and strips every whitespace character.
pub fn normalize_identity(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Upper-cases the first character and lower-cases the rest.
pub fn capitalize_display(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}

pub fn normalize_requests(log: &mut RequestLog) {
    let columns = log.layout().identity_columns();
    for row in log.rows_mut() {
        for &idx in &columns {
            if let Some(cell) = row.cells.get_mut(idx) {
                *cell = normalize_identity(cell);
            }
        }
    }
}

pub fn normalize_roster(roster: &mut RosterTable) {
    let layout = *roster.layout();
    for record in roster.records_mut() {
        for idx in [layout.email, layout.first_name, layout.last_name] {
            if let Some(cell) = record.cells.get_mut(idx) {
                *cell = normalize_identity(cell);
            }
        }
    }
}

pub fn recapitalize_roster(roster: &mut RosterTable) {
    let layout = *roster.layout();
    for record in roster.records_mut() {
        for idx in [layout.first_name, layout.last_name] {
            if let Some(cell) = record.cells.get_mut(idx) {
                *cell = capitalize_display(cell);
            }
        }
    }
}

// Record matcher

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKey {
    Email,
    Name,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    pub key: MatchKey,
    pub positions: Vec<usize>,
}

/// Roster positions matching `identity` under `key`, in table order.
pub fn find_matches(identity: &Identity, roster: &RosterTable, key: MatchKey) -> Vec<usize> {
    let layout = roster.layout();
    roster
        .records()
        .iter()
        .enumerate()
        .filter(|(_, record)| match key {
            MatchKey::Email => identity.emails().any(|e| e == record.cell(layout.email)),
            MatchKey::Name => {
                identity.has_name()
                    && record.cell(layout.first_name) == identity.first_name
                    && record.cell(layout.last_name) == identity.last_name
            }
        })
        .map(|(position, _)| position)
        .collect()
}

/// Email matches, or name matches when no record matched by email.
pub fn match_with_fallback(identity: &Identity, roster: &RosterTable) -> MatchResult {
    let positions = find_matches(identity, roster, MatchKey::Email);
    if !positions.is_empty() {
        return MatchResult {
            key: MatchKey::Email,
            positions,
        };
    }
    MatchResult {
        key: MatchKey::Name,
        positions: find_matches(identity, roster, MatchKey::Name),
    }
}

/// The most recently inserted record among `positions`.
pub fn newest(roster: &RosterTable, positions: &[usize]) -> Option<usize> {
    positions
        .iter()
        .copied()
        .filter_map(|p| roster.record(p).map(|r| (p, r.inserted_at)))
        .max_by_key(|&(_, inserted_at)| inserted_at)
        .map(|(p, _)| p)
}

pub fn require_email(
    identity: &Identity,
    position: usize,
    action: RequestAction,
) -> Result<(), ReconcileError> {
    if identity.has_email() {
        Ok(())
    } else {
        Err(ReconcileError::MissingIdentity { position, action })
    }
}

// Request deduplicator

/// Keeps the latest request per primary email, then per (first, last) name.
pub fn dedupe(rows: Vec<RequestRow>, layout: &RequestLayout) -> Vec<RequestRow> {
    let rows = keep_last_by(rows, |row| row.cell(layout.email).to_string());
    keep_last_by(rows, |row| {
        (
            row.cell(layout.first_name).to_string(),
            row.cell(layout.last_name).to_string(),
        )
    })
}

fn keep_last_by<K, F>(rows: Vec<RequestRow>, key: F) -> Vec<RequestRow>
where
    K: Eq + Hash,
    F: Fn(&RequestRow) -> K,
{
    let mut last = HashMap::new();
    for (idx, row) in rows.iter().enumerate() {
        last.insert(key(row), idx);
    }
    rows.into_iter()
        .enumerate()
        .filter(|(idx, row)| last.get(&key(row)) == Some(idx))
        .map(|(_, row)| row)
        .collect()
}

// Roster mutator

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdatePolicy {
    /// Every pre-existing match is removed; the new record is the only survivor.
    #[default]
    Supersede,
    /// Pre-existing duplicates are pruned down to the newest one, which stays
    /// next to the appended record.
    LegacyPrune,
}

impl FromStr for UpdatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "supersede" => Ok(Self::Supersede),
            "legacy-prune" => Ok(Self::LegacyPrune),
            other => Err(format!(
                "unknown update policy {other:?} (expected supersede or legacy-prune)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Superseded,
    KeptNewest,
    DeletedAll,
    Aborted,
}

/// Recoverable findings reported alongside a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    AmbiguousMatch {
        position: usize,
        action: RequestAction,
        key: MatchKey,
        candidates: usize,
        resolution: Resolution,
        identity: String,
    },
    StaleLeftover {
        position: usize,
        inserted_at: u64,
        identity: String,
    },
    NotFound {
        position: usize,
        action: RequestAction,
        identity: String,
    },
    AddCollision {
        position: usize,
        existing: usize,
        identity: String,
    },
}

impl Notice {
    pub fn is_warning(&self) -> bool {
        !matches!(self, Self::NotFound { .. })
    }

    fn emit(&self) {
        match self {
            Self::AmbiguousMatch {
                position,
                action,
                key,
                candidates,
                resolution,
                identity,
            } => warn!(
                position,
                %action,
                ?key,
                candidates,
                ?resolution,
                identity = identity.as_str(),
                "multiple roster records match request"
            ),
            Self::StaleLeftover {
                position,
                inserted_at,
                identity,
            } => warn!(
                position,
                inserted_at,
                identity = identity.as_str(),
                "pre-update record left next to the updated one"
            ),
            Self::NotFound {
                position,
                action,
                identity,
            } => info!(
                position,
                %action,
                identity = identity.as_str(),
                "no roster record matches request"
            ),
            Self::AddCollision {
                position,
                existing,
                identity,
            } => warn!(
                position,
                existing,
                identity = identity.as_str(),
                "add request collides with existing roster records; appending anyway"
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationOutcome {
    pub appended: usize,
    pub removed: usize,
    pub notices: Vec<Notice>,
}

impl MutationOutcome {
    fn notice(&mut self, notice: Notice) {
        notice.emit();
        self.notices.push(notice);
    }

    pub fn absorb(&mut self, other: MutationOutcome) {
        self.appended += other.appended;
        self.removed += other.removed;
        self.notices.extend(other.notices);
    }
}

/// Applies single requests to a roster in place.
pub struct RosterMutator<'a> {
    mapping: &'a ResolvedMapping,
    layout: &'a RequestLayout,
    policy: UpdatePolicy,
}

impl<'a> RosterMutator<'a> {
    pub fn new(mapping: &'a ResolvedMapping, layout: &'a RequestLayout, policy: UpdatePolicy) -> Self {
        Self {
            mapping,
            layout,
            policy,
        }
    }

    /// Appends the request payload; identity collisions are reported, never prevented.
    pub fn add(&self, row: &RequestRow, roster: &mut RosterTable) -> MutationOutcome {
        let mut outcome = MutationOutcome::default();
        let identity = self.layout.identity(row);
        let existing = match_with_fallback(&identity, roster).positions.len();
        if existing > 0 {
            outcome.notice(Notice::AddCollision {
                position: row.position,
                existing,
                identity: identity.to_string(),
            });
        }
        roster.append(self.mapping.project(row));
        outcome.appended = 1;
        outcome
    }

    pub fn update(
        &self,
        row: &RequestRow,
        roster: &mut RosterTable,
    ) -> Result<MutationOutcome, ReconcileError> {
        let identity = self.layout.identity(row);
        require_email(&identity, row.position, RequestAction::Update)?;
        Ok(match self.policy {
            UpdatePolicy::Supersede => self.update_supersede(row, &identity, roster),
            UpdatePolicy::LegacyPrune => self.update_legacy_prune(row, &identity, roster),
        })
    }

    fn update_supersede(
        &self,
        row: &RequestRow,
        identity: &Identity,
        roster: &mut RosterTable,
    ) -> MutationOutcome {
        let mut outcome = MutationOutcome::default();
        let matched = match_with_fallback(identity, roster);
        match matched.positions.len() {
            0 => outcome.notice(Notice::NotFound {
                position: row.position,
                action: RequestAction::Update,
                identity: identity.to_string(),
            }),
            1 => {}
            candidates => outcome.notice(Notice::AmbiguousMatch {
                position: row.position,
                action: RequestAction::Update,
                key: matched.key,
                candidates,
                resolution: Resolution::Superseded,
                identity: identity.to_string(),
            }),
        }
        outcome.removed = roster.remove_positions(&matched.positions);
        roster.append(self.mapping.project(row));
        outcome.appended = 1;
        outcome
    }

    fn update_legacy_prune(
        &self,
        row: &RequestRow,
        identity: &Identity,
        roster: &mut RosterTable,
    ) -> MutationOutcome {
        let mut outcome = MutationOutcome::default();
        let new_ordinal = roster.append(self.mapping.project(row));
        outcome.appended = 1;

        for key in [MatchKey::Email, MatchKey::Name] {
            let previous = pre_existing(roster, find_matches(identity, roster, key), new_ordinal);
            if previous.len() < 2 {
                continue;
            }
            let Some(keep) = newest(roster, &previous) else {
                continue;
            };
            outcome.notice(Notice::AmbiguousMatch {
                position: row.position,
                action: RequestAction::Update,
                key,
                candidates: previous.len(),
                resolution: Resolution::KeptNewest,
                identity: identity.to_string(),
            });
            let stale = previous.into_iter().filter(|&p| p != keep).collect::<Vec<_>>();
            outcome.removed += roster.remove_positions(&stale);
        }

        let mut leftovers = pre_existing(
            roster,
            find_matches(identity, roster, MatchKey::Email),
            new_ordinal,
        );
        leftovers.extend(pre_existing(
            roster,
            find_matches(identity, roster, MatchKey::Name),
            new_ordinal,
        ));
        leftovers.sort_unstable();
        leftovers.dedup();

        if leftovers.is_empty() {
            outcome.notice(Notice::NotFound {
                position: row.position,
                action: RequestAction::Update,
                identity: identity.to_string(),
            });
        }
        for position in leftovers {
            if let Some(record) = roster.record(position) {
                outcome.notice(Notice::StaleLeftover {
                    position: row.position,
                    inserted_at: record.inserted_at,
                    identity: identity.to_string(),
                });
            }
        }
        outcome
    }

    /// Deletes every email match; falls back to a unique name match.
    pub fn remove(
        &self,
        row: &RequestRow,
        roster: &mut RosterTable,
    ) -> Result<MutationOutcome, ReconcileError> {
        let identity = self.layout.identity(row);
        require_email(&identity, row.position, RequestAction::Remove)?;
        let mut outcome = MutationOutcome::default();

        let by_email = find_matches(&identity, roster, MatchKey::Email);
        if by_email.len() > 1 {
            outcome.notice(Notice::AmbiguousMatch {
                position: row.position,
                action: RequestAction::Remove,
                key: MatchKey::Email,
                candidates: by_email.len(),
                resolution: Resolution::DeletedAll,
                identity: identity.to_string(),
            });
        }
        if !by_email.is_empty() {
            outcome.removed = roster.remove_positions(&by_email);
            return Ok(outcome);
        }

        let by_name = find_matches(&identity, roster, MatchKey::Name);
        match by_name.len() {
            0 => outcome.notice(Notice::NotFound {
                position: row.position,
                action: RequestAction::Remove,
                identity: identity.to_string(),
            }),
            1 => outcome.removed = roster.remove_positions(&by_name),
            candidates => outcome.notice(Notice::AmbiguousMatch {
                position: row.position,
                action: RequestAction::Remove,
                key: MatchKey::Name,
                candidates,
                resolution: Resolution::Aborted,
                identity: identity.to_string(),
            }),
        }
        Ok(outcome)
    }
}

fn pre_existing(roster: &RosterTable, positions: Vec<usize>, new_ordinal: u64) -> Vec<usize> {
    positions
        .into_iter()
        .filter(|&p| roster.record(p).is_some_and(|r| r.inserted_at != new_ordinal))
        .collect()
}

// Batch reconciler

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCounts {
    pub add: usize,
    pub update: usize,
    pub remove: usize,
    pub unknown: usize,
}

impl ActionCounts {
    pub fn get(&self, action: RequestAction) -> usize {
        match action {
            RequestAction::Add => self.add,
            RequestAction::Update => self.update,
            RequestAction::Remove => self.remove,
        }
    }

    pub fn total(&self) -> usize {
        self.add + self.update + self.remove + self.unknown
    }
}

pub fn pending_counts(log: &RequestLog) -> ActionCounts {
    let layout = log.layout();
    let mut counts = ActionCounts::default();
    for row in log.pending() {
        match layout.action(row) {
            Ok(RequestAction::Add) => counts.add += 1,
            Ok(RequestAction::Update) => counts.update += 1,
            Ok(RequestAction::Remove) => counts.remove += 1,
            Err(_) => counts.unknown += 1,
        }
    }
    counts
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Idle,
    Normalizing,
    ApplyAdd,
    ApplyUpdate,
    ApplyRemove,
    PostClean,
    Persisted,
}

impl RunStage {
    pub fn apply(action: RequestAction) -> Self {
        match action {
            RequestAction::Add => Self::ApplyAdd,
            RequestAction::Update => Self::ApplyUpdate,
            RequestAction::Remove => Self::ApplyRemove,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileSettings {
    pub update_policy: UpdatePolicy,
    /// Reconcile one partition only; the others stay pending.
    pub only: Option<RequestAction>,
}

/// Tables a run reads from. The run never modifies them; it returns new ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileContext {
    pub requests: RequestLog,
    pub roster: RosterTable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub action: RequestAction,
    pub requests: usize,
    pub deduplicated: usize,
    pub roster_before: usize,
    pub roster_after: usize,
    pub appended: usize,
    pub removed: usize,
    pub notices: Vec<Notice>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub update_policy: UpdatePolicy,
    pub pending: ActionCounts,
    pub roster_before: usize,
    pub roster_after: usize,
    pub flagged_done: usize,
    pub stages: Vec<StageReport>,
    pub transitions: Vec<RunStage>,
}

impl ReconcileReport {
    pub fn warnings(&self) -> impl Iterator<Item = &Notice> {
        self.stages
            .iter()
            .flat_map(|s| s.notices.iter())
            .filter(|n| n.is_warning())
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub context: ReconcileContext,
    pub report: ReconcileReport,
}

pub struct Reconciler {
    mapping: FieldMapping,
    settings: ReconcileSettings,
}

impl Reconciler {
    pub fn new(mapping: FieldMapping, settings: ReconcileSettings) -> Self {
        Self { mapping, settings }
    }

    /// Runs the whole batch against copies of the context's tables.
    ///
    /// Any fatal error leaves the caller's tables as they were; nothing is
    /// partially applied.
    pub fn run(&self, context: &ReconcileContext) -> Result<ReconcileOutcome, ReconcileError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("reconcile", %run_id);
        let _guard = span.enter();

        let mut transitions = vec![RunStage::Normalizing];
        let mut requests = context.requests.clone();
        let mut roster = context.roster.clone();
        normalize_requests(&mut requests);
        normalize_roster(&mut roster);

        let layout = *requests.layout();
        let mapping = self
            .mapping
            .resolve(requests.headers(), &layout, roster.headers())?;
        mapping.check_identity(&layout, roster.headers(), roster.layout())?;

        let pending = pending_counts(&requests);
        let mut partitions: BTreeMap<RequestAction, Vec<RequestRow>> = BTreeMap::new();
        for row in requests.pending() {
            let action = layout.action(row)?;
            partitions.entry(action).or_default().push(row.clone());
        }
        info!(
            add = pending.add,
            update = pending.update,
            remove = pending.remove,
            roster = roster.len(),
            "pending requests loaded"
        );

        let roster_before = roster.len();
        let mutator = RosterMutator::new(&mapping, &layout, self.settings.update_policy);
        let mut stages = Vec::new();
        let mut processed = Vec::new();

        for action in RequestAction::ALL {
            if self.settings.only.is_some_and(|only| only != action) {
                continue;
            }
            transitions.push(RunStage::apply(action));
            let rows = partitions.remove(&action).unwrap_or_default();
            processed.extend(rows.iter().map(|r| r.position));
            stages.push(apply_partition(action, rows, &layout, &mutator, &mut roster)?);
        }

        transitions.push(RunStage::PostClean);
        recapitalize_roster(&mut roster);
        roster.renumber();
        for &position in &processed {
            requests.mark_done(position);
        }

        let report = ReconcileReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            update_policy: self.settings.update_policy,
            pending,
            roster_before,
            roster_after: roster.len(),
            flagged_done: processed.len(),
            stages,
            transitions,
        };
        info!(
            roster_before,
            roster_after = report.roster_after,
            flagged_done = report.flagged_done,
            "reconciliation finished"
        );

        Ok(ReconcileOutcome {
            context: ReconcileContext { requests, roster },
            report,
        })
    }
}

fn apply_partition(
    action: RequestAction,
    rows: Vec<RequestRow>,
    layout: &RequestLayout,
    mutator: &RosterMutator<'_>,
    roster: &mut RosterTable,
) -> Result<StageReport, ReconcileError> {
    let requests = rows.len();
    let rows = match action {
        RequestAction::Update => dedupe(rows, layout),
        RequestAction::Add | RequestAction::Remove => rows,
    };
    let deduplicated = requests - rows.len();
    if deduplicated > 0 {
        info!(deduplicated, remaining = rows.len(), "same-user updates collapsed");
    }

    let roster_before = roster.len();
    let mut outcome = MutationOutcome::default();
    for row in &rows {
        let step = match action {
            RequestAction::Add => mutator.add(row, roster),
            RequestAction::Update => mutator.update(row, roster)?,
            RequestAction::Remove => mutator.remove(row, roster)?,
        };
        outcome.absorb(step);
    }

    info!(
        %action,
        requests,
        roster_before,
        roster_after = roster.len(),
        appended = outcome.appended,
        removed = outcome.removed,
        "stage applied"
    );

    Ok(StageReport {
        action,
        requests,
        deduplicated,
        roster_before,
        roster_after: roster.len(),
        appended: outcome.appended,
        removed: outcome.removed,
        notices: outcome.notices,
    })
}

// Request activity

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestActivity {
    pub today: NaiveDate,
    /// Sunday-started weeks, oldest first. `None` marks days after `today`.
    pub weeks: Vec<[Option<usize>; 7]>,
    /// Hour of day (fractional) of each request inside the window.
    pub hours: Vec<f64>,
    pub unparsed_timestamps: usize,
}

const TIMESTAMP_FORMATS: [&str; 5] = [
    "%m/%d/%Y %H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%Y-%m-%d %H:%M",
];

pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
}

/// Per-day request counts for the current and two previous weeks.
pub fn request_activity(log: &RequestLog, today: NaiveDate) -> RequestActivity {
    let layout = log.layout();
    // None only for dates at the very start of the calendar range.
    let window_start = today
        .checked_sub_signed(ChronoDuration::days(i64::from(
            today.weekday().num_days_from_sunday(),
        )))
        .and_then(|week_start| week_start.checked_sub_signed(ChronoDuration::days(14)));

    let mut per_day: BTreeMap<NaiveDate, usize> = BTreeMap::new();
    let mut hours = Vec::new();
    let mut unparsed_timestamps = 0usize;
    for row in log.rows() {
        let Some(stamp) = parse_timestamp(layout.timestamp(row)) else {
            unparsed_timestamps += 1;
            continue;
        };
        let date = stamp.date();
        if !window_start.is_some_and(|start| date >= start) || date > today {
            continue;
        }
        *per_day.entry(date).or_default() += 1;
        hours.push(f64::from(stamp.hour()) + f64::from(stamp.minute()) / 60.0);
    }

    let weeks = (0..3i64)
        .map(|week| {
            let mut days = [None; 7];
            for (offset, slot) in (0i64..).zip(days.iter_mut()) {
                let date = window_start.and_then(|start| {
                    start.checked_add_signed(ChronoDuration::days(week * 7 + offset))
                });
                if let Some(date) = date.filter(|d| *d <= today) {
                    *slot = Some(per_day.get(&date).copied().unwrap_or(0));
                }
            }
            days
        })
        .collect();

    RequestActivity {
        today,
        weeks,
        hours,
        unparsed_timestamps,
    }
}

// Configuration

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub requests_csv: PathBuf,
    pub roster_csv: PathBuf,
    pub requests_url: Option<String>,
    pub roster_url: Option<String>,
    pub field_map: Option<PathBuf>,
    pub reports_dir: PathBuf,
    pub journal_path: PathBuf,
    pub update_policy: UpdatePolicy,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl ReconcileConfig {
    pub fn from_env() -> Result<Self> {
        let update_policy = match std::env::var("RBOOK_UPDATE_POLICY") {
            Ok(value) => value.parse().map_err(anyhow::Error::msg)?,
            Err(_) => UpdatePolicy::default(),
        };
        Ok(Self {
            requests_csv: std::env::var("RBOOK_REQUESTS_CSV")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/requests.csv")),
            roster_csv: std::env::var("RBOOK_ROSTER_CSV")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/roster.csv")),
            requests_url: std::env::var("RBOOK_REQUESTS_URL").ok().filter(|v| !v.is_empty()),
            roster_url: std::env::var("RBOOK_ROSTER_URL").ok().filter(|v| !v.is_empty()),
            field_map: std::env::var("RBOOK_FIELD_MAP").ok().map(PathBuf::from),
            reports_dir: std::env::var("RBOOK_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            journal_path: std::env::var("RBOOK_JOURNAL")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/.rbook-journal.json")),
            update_policy,
            user_agent: std::env::var("RBOOK_USER_AGENT")
                .unwrap_or_else(|_| "rbook/0.1".to_string()),
            http_timeout_secs: std::env::var("RBOOK_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        })
    }

    /// Request and roster sources; an export URL takes precedence over the local file.
    pub fn sources(&self) -> Result<(Box<dyn SheetSource>, Box<dyn SheetSource>)> {
        let http_config = HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        };
        let requests: Box<dyn SheetSource> = match &self.requests_url {
            Some(url) => Box::new(HttpCsvSource::new(HttpFetcher::new(http_config.clone())?, url)),
            None => Box::new(CsvFileSource::new(&self.requests_csv)),
        };
        let roster: Box<dyn SheetSource> = match &self.roster_url {
            Some(url) => Box::new(HttpCsvSource::new(HttpFetcher::new(http_config)?, url)),
            None => Box::new(CsvFileSource::new(&self.roster_csv)),
        };
        Ok((requests, roster))
    }

    /// Local-file configuration rooted at `dir`; used by tests and demos.
    pub fn local(dir: &Path) -> Self {
        Self {
            requests_csv: dir.join("requests.csv"),
            roster_csv: dir.join("roster.csv"),
            requests_url: None,
            roster_url: None,
            field_map: None,
            reports_dir: dir.join("reports"),
            journal_path: dir.join(".rbook-journal.json"),
            update_policy: UpdatePolicy::default(),
            user_agent: "rbook/0.1".to_string(),
            http_timeout_secs: 20,
        }
    }
}

/// Declared field mapping plus optional column-name overrides.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FieldMapFile {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub request_columns: RequestColumns,
    #[serde(default)]
    pub roster_columns: RosterColumns,
    #[serde(default)]
    pub fields: Vec<FieldPair>,
}

impl FieldMapFile {
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn mapping(&self) -> FieldMapping {
        FieldMapping {
            fields: self.fields.clone(),
        }
    }
}

// Pipeline

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub only: Option<RequestAction>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub report: ReconcileReport,
    pub reports_dir: String,
    pub persisted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub pending: ActionCounts,
    pub total_requests: usize,
    pub roster_records: usize,
    pub activity: RequestActivity,
    pub unfinished_commit: Option<Uuid>,
}

pub struct ReconcilePipeline {
    config: ReconcileConfig,
    field_map: Option<FieldMapFile>,
    requests_source: Box<dyn SheetSource>,
    roster_source: Box<dyn SheetSource>,
    journal: CommitJournal,
}

impl ReconcilePipeline {
    pub fn new(config: ReconcileConfig) -> Result<Self> {
        let field_map = config
            .field_map
            .as_deref()
            .map(FieldMapFile::from_path)
            .transpose()?;
        let (requests_source, roster_source) = config.sources()?;
        let journal = CommitJournal::new(&config.journal_path);
        Ok(Self {
            config,
            field_map,
            requests_source,
            roster_source,
            journal,
        })
    }

    pub fn with_sources(
        mut self,
        requests: Box<dyn SheetSource>,
        roster: Box<dyn SheetSource>,
    ) -> Self {
        self.requests_source = requests;
        self.roster_source = roster;
        self
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub async fn load(&self) -> Result<ReconcileContext> {
        let request_columns = self
            .field_map
            .as_ref()
            .map(|f| f.request_columns.clone())
            .unwrap_or_default();
        let roster_columns = self
            .field_map
            .as_ref()
            .map(|f| f.roster_columns.clone())
            .unwrap_or_default();

        let requests = self
            .requests_source
            .read()
            .await
            .with_context(|| format!("loading requests from {}", self.requests_source.describe()))?;
        let roster = self
            .roster_source
            .read()
            .await
            .with_context(|| format!("loading roster from {}", self.roster_source.describe()))?;

        Ok(ReconcileContext {
            requests: RequestLog::from_sheet(requests, &request_columns)?,
            roster: RosterTable::from_sheet(roster, &roster_columns)?,
        })
    }

    /// The declared mapping, or the legacy positional one when none is configured.
    pub fn field_mapping(&self, context: &ReconcileContext) -> Result<FieldMapping> {
        if let Some(file) = &self.field_map {
            return Ok(file.mapping());
        }
        let headers = context.requests.headers();
        let action_header = headers
            .get(context.requests.layout().action)
            .cloned()
            .unwrap_or_default();
        let mapping = FieldMapping::positional(
            headers,
            context.roster.headers(),
            PAYLOAD_START,
            PAYLOAD_END,
            &[action_header.as_str()],
        )?;
        Ok(mapping)
    }

    pub async fn run_once(&self, options: RunOptions) -> Result<RunSummary> {
        self.journal.ensure_clean().await?;
        let context = self.load().await?;
        let mapping = self.field_mapping(&context)?;
        let reconciler = Reconciler::new(
            mapping,
            ReconcileSettings {
                update_policy: self.config.update_policy,
                only: options.only,
            },
        );
        let ReconcileOutcome { context, mut report } = reconciler.run(&context)?;

        let persisted = !options.dry_run;
        if persisted {
            let writes = vec![
                (self.config.roster_csv.clone(), render_csv(&context.roster.to_sheet())?),
                (self.config.requests_csv.clone(), render_csv(&context.requests.to_sheet())?),
            ];
            self.journal.commit(report.run_id, &writes).await?;
            report.transitions.push(RunStage::Persisted);
        }
        report.transitions.push(RunStage::Idle);

        let reports_dir = self.write_reports(&report, persisted).await?;
        Ok(RunSummary {
            report,
            reports_dir: reports_dir.display().to_string(),
            persisted,
        })
    }

    pub async fn status(&self, today: NaiveDate) -> Result<StatusSummary> {
        let context = self.load().await?;
        Ok(StatusSummary {
            pending: pending_counts(&context.requests),
            total_requests: context.requests.len(),
            roster_records: context.roster.len(),
            activity: request_activity(&context.requests, today),
            unfinished_commit: self.journal.pending().await?.map(|e| e.run_id),
        })
    }

    pub async fn recover(&self) -> Result<RecoveryOutcome> {
        self.journal.recover().await
    }

    async fn write_reports(&self, report: &ReconcileReport, persisted: bool) -> Result<PathBuf> {
        let dir = self.config.reports_dir.join(report.run_id.to_string());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let json = serde_json::to_vec_pretty(&serde_json::json!({
            "persisted": persisted,
            "report": report,
        }))
        .context("serializing run report")?;
        fs::write(dir.join("run_report.json"), json)
            .await
            .context("writing run_report.json")?;
        fs::write(dir.join("summary.md"), render_summary_markdown(report, persisted))
            .await
            .context("writing summary.md")?;
        Ok(dir)
    }
}

pub async fn run_reconcile_once_from_env(options: RunOptions) -> Result<RunSummary> {
    let config = ReconcileConfig::from_env()?;
    ReconcilePipeline::new(config)?.run_once(options).await
}

pub fn render_summary_markdown(report: &ReconcileReport, persisted: bool) -> String {
    let mut lines = vec![
        "# Resume Book Reconciliation".to_string(),
        String::new(),
        format!("- Run ID: `{}`", report.run_id),
        format!("- Started: {}", report.started_at),
        format!("- Finished: {}", report.finished_at),
        format!("- Update policy: {:?}", report.update_policy),
        format!(
            "- Pending: {} add, {} update, {} remove",
            report.pending.add, report.pending.update, report.pending.remove
        ),
        format!(
            "- Roster: {} -> {} records",
            report.roster_before, report.roster_after
        ),
        format!("- Requests flagged done: {}", report.flagged_done),
        format!("- Written back: {}", if persisted { "yes" } else { "no (dry run)" }),
        String::new(),
        "## Stages".to_string(),
    ];
    for stage in &report.stages {
        lines.push(format!(
            "- {}: {} requests ({} collapsed), roster {} -> {}, +{} / -{}",
            stage.action,
            stage.requests,
            stage.deduplicated,
            stage.roster_before,
            stage.roster_after,
            stage.appended,
            stage.removed
        ));
    }
    let warnings = report.warnings().collect::<Vec<_>>();
    if !warnings.is_empty() {
        lines.push(String::new());
        lines.push("## Warnings".to_string());
        for notice in warnings {
            lines.push(format!("- {}", describe_notice(notice)));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

pub fn describe_notice(notice: &Notice) -> String {
    match notice {
        Notice::AmbiguousMatch {
            position,
            action,
            key,
            candidates,
            resolution,
            identity,
        } => format!(
            "row {position} ({action} {identity}): {candidates} records match by {key:?}, {resolution:?}"
        ),
        Notice::StaleLeftover {
            position,
            inserted_at,
            identity,
        } => format!("row {position} ({identity}): stale record #{inserted_at} kept"),
        Notice::NotFound {
            position,
            action,
            identity,
        } => format!("row {position} ({action} {identity}): no matching record"),
        Notice::AddCollision {
            position,
            existing,
            identity,
        } => format!("row {position} (add {identity}): {existing} existing records"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rbook_core::{Sheet, ADD_FORM_VALUE, REMOVE_FORM_VALUE, UPDATE_FORM_VALUE};
    use tempfile::tempdir;

    const REQUEST_HEADERS: [&str; 9] = [
        "Timestamp",
        "Email ",
        "Email Address",
        "First Name",
        "Last Name",
        "Do you want to add, update, or remove your resume?",
        "Role",
        "Upload Resume",
        "Done?",
    ];
    const ROSTER_HEADERS: [&str; 4] = ["Email", "First Name", "Last Name", "Role"];

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn request(email: &str, email2: &str, first: &str, last: &str, action: &str, role: &str) -> Vec<String> {
        strings(&["10/14/2026 09:30:00", email, email2, first, last, action, role, "resume", ""])
    }

    fn roster_row(email: &str, first: &str, last: &str, role: &str) -> Vec<String> {
        strings(&[email, first, last, role])
    }

    fn context(requests: Vec<Vec<String>>, roster: Vec<Vec<String>>) -> ReconcileContext {
        ReconcileContext {
            requests: RequestLog::from_sheet(
                Sheet::new(strings(&REQUEST_HEADERS), requests),
                &RequestColumns::default(),
            )
            .unwrap(),
            roster: RosterTable::from_sheet(
                Sheet::new(strings(&ROSTER_HEADERS), roster),
                &RosterColumns::default(),
            )
            .unwrap(),
        }
    }

    fn mapping() -> FieldMapping {
        let pair = |request: &str, roster: &str| FieldPair {
            request: request.into(),
            roster: roster.into(),
        };
        FieldMapping {
            fields: vec![
                pair("Email ", "Email"),
                pair("First Name", "First Name"),
                pair("Last Name", "Last Name"),
                pair("Role", "Role"),
            ],
        }
    }

    fn run(ctx: &ReconcileContext, policy: UpdatePolicy) -> ReconcileOutcome {
        Reconciler::new(
            mapping(),
            ReconcileSettings {
                update_policy: policy,
                only: None,
            },
        )
        .run(ctx)
        .unwrap()
    }

    fn roles_for(roster: &RosterTable, email: &str) -> Vec<String> {
        let layout = roster.layout();
        roster
            .records()
            .iter()
            .filter(|r| r.cell(layout.email) == email)
            .map(|r| r.cell(3).to_string())
            .collect()
    }

    #[test]
    fn normalization_is_case_and_whitespace_insensitive() {
        assert_eq!(normalize_identity("Jane.Doe@X.com "), normalize_identity("jane.doe@x.com"));
        assert_eq!(normalize_identity(" Mary\tAnn "), "maryann");
        let once = normalize_identity("  A.B@C.D ");
        assert_eq!(normalize_identity(&once), once);
        assert_eq!(capitalize_display("mcDONALD"), "Mcdonald");
        assert_eq!(capitalize_display(""), "");
    }

    #[test]
    fn normalization_leaves_payload_columns_alone() {
        let mut ctx = context(
            vec![request("A@X.com ", "", "Ann ", "One", ADD_FORM_VALUE, "Data Science")],
            vec![roster_row(" B@X.COM", "Bo", "Two", "Product Management")],
        );
        normalize_requests(&mut ctx.requests);
        normalize_roster(&mut ctx.roster);
        let row = &ctx.requests.rows()[0];
        assert_eq!(row.cell(1), "a@x.com");
        assert_eq!(row.cell(3), "ann");
        assert_eq!(row.cell(6), "Data Science");
        assert_eq!(ctx.roster.records()[0].cells, strings(&["b@x.com", "bo", "two", "Product Management"]));
    }

    #[test]
    fn matcher_falls_back_to_names_and_prefers_newest() {
        let ctx = context(
            vec![],
            vec![
                roster_row("a@x.com", "a", "one", "r1"),
                roster_row("old@x.com", "b", "two", "r1"),
                roster_row("a@x.com", "a", "one", "r2"),
            ],
        );
        let by_email = Identity {
            email: "a@x.com".into(),
            first_name: "b".into(),
            last_name: "two".into(),
            ..Default::default()
        };
        let result = match_with_fallback(&by_email, &ctx.roster);
        assert_eq!(result.key, MatchKey::Email);
        assert_eq!(result.positions, vec![0, 2]);
        assert_eq!(newest(&ctx.roster, &result.positions), Some(2));

        let secondary_only = Identity {
            secondary_email: "old@x.com".into(),
            ..Default::default()
        };
        assert_eq!(find_matches(&secondary_only, &ctx.roster, MatchKey::Email), vec![1]);

        let by_name = Identity {
            email: "new@x.com".into(),
            first_name: "b".into(),
            last_name: "two".into(),
            ..Default::default()
        };
        let result = match_with_fallback(&by_name, &ctx.roster);
        assert_eq!(result.key, MatchKey::Name);
        assert_eq!(result.positions, vec![1]);

        let nobody = Identity::default();
        assert!(match_with_fallback(&nobody, &ctx.roster).positions.is_empty());
    }

    #[test]
    fn dedupe_keeps_latest_submission_and_is_idempotent() {
        let ctx = context(
            vec![
                request("a@x.com", "", "a", "one", UPDATE_FORM_VALUE, "r1"),
                request("b@x.com", "", "b", "two", UPDATE_FORM_VALUE, "r1"),
                request("a@x.com", "", "a", "one", UPDATE_FORM_VALUE, "r2"),
                request("c@x.com", "", "b", "two", UPDATE_FORM_VALUE, "r3"),
            ],
            vec![],
        );
        let layout = *ctx.requests.layout();
        let once = dedupe(ctx.requests.rows().to_vec(), &layout);
        let positions = once.iter().map(|r| r.position).collect::<Vec<_>>();
        assert_eq!(positions, vec![2, 3]);
        assert_eq!(dedupe(once.clone(), &layout), once);
    }

    #[test]
    fn add_appends_payload_even_for_known_identity() {
        let ctx = context(
            vec![
                request("a@x.com", "", "a", "one", ADD_FORM_VALUE, "r1"),
                request("a@x.com", "", "a", "one", ADD_FORM_VALUE, "r1"),
            ],
            vec![roster_row("z@x.com", "z", "last", "r0")],
        );
        let outcome = run(&ctx, UpdatePolicy::Supersede);
        let roster = &outcome.context.roster;
        assert_eq!(roster.len(), ctx.roster.len() + 2);
        assert_eq!(roles_for(roster, "a@x.com"), vec!["r1", "r1"]);
        let stage = &outcome.report.stages[0];
        assert_eq!(stage.action, RequestAction::Add);
        assert!(stage
            .notices
            .iter()
            .any(|n| matches!(n, Notice::AddCollision { existing: 1, .. })));
    }

    #[test]
    fn update_replaces_the_single_matching_record() {
        let ctx = context(
            vec![request("a@x.com", "", "A", "One", UPDATE_FORM_VALUE, "r2")],
            vec![
                roster_row("a@x.com", "A", "One", "r1"),
                roster_row("b@x.com", "B", "Two", "r1"),
            ],
        );
        let outcome = run(&ctx, UpdatePolicy::Supersede);
        let roster = &outcome.context.roster;
        assert_eq!(roster.len(), 2);
        assert_eq!(roles_for(roster, "a@x.com"), vec!["r2"]);
        assert_eq!(roles_for(roster, "b@x.com"), vec!["r1"]);
        let record = roster.records().last().unwrap();
        assert_eq!(record.cell(1), "A");
        assert_eq!(record.cell(2), "One");
    }

    #[test]
    fn supersede_clears_duplicates_while_legacy_prune_leaves_a_stale_record() {
        let ctx = context(
            vec![request("a@x.com", "", "a", "one", UPDATE_FORM_VALUE, "r3")],
            vec![
                roster_row("a@x.com", "a", "one", "r1"),
                roster_row("a@x.com", "a", "one", "r2"),
            ],
        );

        let supersede = run(&ctx, UpdatePolicy::Supersede);
        assert_eq!(roles_for(&supersede.context.roster, "a@x.com"), vec!["r3"]);

        let legacy = run(&ctx, UpdatePolicy::LegacyPrune);
        assert_eq!(roles_for(&legacy.context.roster, "a@x.com"), vec!["r2", "r3"]);
        let notices = &legacy.report.stages[1].notices;
        assert!(notices.iter().any(|n| matches!(
            n,
            Notice::AmbiguousMatch {
                resolution: Resolution::KeptNewest,
                candidates: 2,
                ..
            }
        )));
        assert!(notices.iter().any(|n| matches!(n, Notice::StaleLeftover { .. })));
    }

    #[test]
    fn update_without_email_is_fatal_and_leaves_tables_untouched() {
        let ctx = context(
            vec![
                request("a@x.com", "", "a", "one", ADD_FORM_VALUE, "r1"),
                request("", "", "b", "two", UPDATE_FORM_VALUE, "r2"),
            ],
            vec![roster_row("b@x.com", "b", "two", "r1")],
        );
        let snapshot = ctx.clone();
        let err = Reconciler::new(mapping(), ReconcileSettings::default())
            .run(&ctx)
            .unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::MissingIdentity {
                position: 1,
                action: RequestAction::Update
            }
        ));
        assert_eq!(ctx, snapshot);
    }

    #[test]
    fn secondary_email_is_enough_identity() {
        let ctx = context(
            vec![request("", "b@x.com", "b", "two", REMOVE_FORM_VALUE, "")],
            vec![roster_row("b@x.com", "b", "two", "r1")],
        );
        let outcome = run(&ctx, UpdatePolicy::Supersede);
        assert!(outcome.context.roster.is_empty());
    }

    #[test]
    fn remove_deletes_exactly_the_matching_record() {
        let ctx = context(
            vec![request("a@x.com", "", "a", "one", REMOVE_FORM_VALUE, "")],
            vec![
                roster_row("a@x.com", "a", "one", "r1"),
                roster_row("b@x.com", "b", "two", "r1"),
                roster_row("c@x.com", "a", "two", "r1"),
            ],
        );
        let outcome = run(&ctx, UpdatePolicy::Supersede);
        let roster = &outcome.context.roster;
        assert_eq!(roster.len(), 2);
        let emails = roster.records().iter().map(|r| r.cell(0)).collect::<Vec<_>>();
        assert_eq!(emails, vec!["b@x.com", "c@x.com"]);
    }

    #[test]
    fn remove_deletes_all_records_sharing_an_email() {
        let ctx = context(
            vec![request("a@x.com", "", "a", "one", REMOVE_FORM_VALUE, "")],
            vec![
                roster_row("a@x.com", "a", "one", "r1"),
                roster_row("b@x.com", "b", "two", "r1"),
                roster_row("a@x.com", "a", "one", "r2"),
            ],
        );
        let outcome = run(&ctx, UpdatePolicy::Supersede);
        assert_eq!(outcome.context.roster.len(), ctx.roster.len() - 2);
        assert!(outcome.report.warnings().any(|n| matches!(
            n,
            Notice::AmbiguousMatch {
                resolution: Resolution::DeletedAll,
                ..
            }
        )));
    }

    #[test]
    fn remove_by_name_aborts_when_ambiguous() {
        let ctx = context(
            vec![
                request("gone@x.com", "", "a", "one", REMOVE_FORM_VALUE, ""),
                request("else@x.com", "", "b", "two", REMOVE_FORM_VALUE, ""),
                request("nobody@x.com", "", "c", "three", REMOVE_FORM_VALUE, ""),
            ],
            vec![
                roster_row("a1@x.com", "a", "one", "r1"),
                roster_row("a2@x.com", "a", "one", "r1"),
                roster_row("b1@x.com", "b", "two", "r1"),
            ],
        );
        let outcome = run(&ctx, UpdatePolicy::Supersede);
        let emails = outcome
            .context
            .roster
            .records()
            .iter()
            .map(|r| r.cell(0).to_string())
            .collect::<Vec<_>>();
        assert_eq!(emails, vec!["a1@x.com", "a2@x.com"]);
        let notices = &outcome.report.stages[2].notices;
        assert!(notices.iter().any(|n| matches!(
            n,
            Notice::AmbiguousMatch {
                key: MatchKey::Name,
                resolution: Resolution::Aborted,
                ..
            }
        )));
        assert!(notices.iter().any(|n| matches!(n, Notice::NotFound { position: 2, .. })));
    }

    #[test]
    fn unknown_action_aborts_before_any_mutation() {
        let ctx = context(
            vec![
                request("a@x.com", "", "a", "one", ADD_FORM_VALUE, "r1"),
                request("b@x.com", "", "b", "two", "Archive my resume", "r1"),
            ],
            vec![],
        );
        let err = Reconciler::new(mapping(), ReconcileSettings::default())
            .run(&ctx)
            .unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Core(CoreError::UnknownAction { position: 1, .. })
        ));
        assert_eq!(pending_counts(&ctx.requests).unknown, 1);
    }

    #[test]
    fn every_processed_request_is_flagged_done() {
        let mut rows = vec![
            request("a@x.com", "", "a", "one", UPDATE_FORM_VALUE, "r1"),
            request("a@x.com", "", "a", "one", UPDATE_FORM_VALUE, "r2"),
            request("b@x.com", "", "b", "two", REMOVE_FORM_VALUE, ""),
            request("c@x.com", "", "c", "three", ADD_FORM_VALUE, "r1"),
        ];
        rows[3][8] = "yes".into();
        let ctx = context(rows, vec![roster_row("a@x.com", "a", "one", "r0")]);

        let only_updates = Reconciler::new(
            mapping(),
            ReconcileSettings {
                update_policy: UpdatePolicy::Supersede,
                only: Some(RequestAction::Update),
            },
        )
        .run(&ctx)
        .unwrap();
        let requests = &only_updates.context.requests;
        let done = requests
            .rows()
            .iter()
            .map(|r| requests.layout().is_done(r))
            .collect::<Vec<_>>();
        assert_eq!(done, vec![true, true, false, true]);
        assert_eq!(only_updates.report.stages.len(), 1);
        assert_eq!(only_updates.report.stages[0].deduplicated, 1);
        assert_eq!(roles_for(&only_updates.context.roster, "a@x.com"), vec!["r2"]);

        let full = run(&ctx, UpdatePolicy::Supersede);
        assert_eq!(full.report.flagged_done, 3);
        assert_eq!(full.context.requests.pending().count(), 0);
        assert_eq!(
            full.report.transitions,
            vec![
                RunStage::Normalizing,
                RunStage::ApplyAdd,
                RunStage::ApplyUpdate,
                RunStage::ApplyRemove,
                RunStage::PostClean
            ]
        );
    }

    #[test]
    fn post_clean_capitalizes_names_and_densifies_ordinals() {
        let ctx = context(
            vec![request("D@X.com", "", "DANA", "de la cruz", ADD_FORM_VALUE, "r1")],
            vec![
                roster_row("a@x.com", "ann", "ONE", "r1"),
                roster_row("b@x.com", "bo", "two", "r1"),
            ],
        );
        let mut ctx = ctx;
        ctx.roster.remove_positions(&[0]);
        let outcome = run(&ctx, UpdatePolicy::Supersede);
        let roster = &outcome.context.roster;
        let names = roster
            .records()
            .iter()
            .map(|r| format!("{} {}", r.cell(1), r.cell(2)))
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["Bo Two", "Dana Delacruz"]);
        let ordinals = roster.records().iter().map(|r| r.inserted_at).collect::<Vec<_>>();
        assert_eq!(ordinals, vec![0, 1]);
    }

    #[test]
    fn activity_grid_masks_future_days() {
        let mut rows = vec![
            request("a@x.com", "", "a", "one", ADD_FORM_VALUE, ""),
            request("b@x.com", "", "b", "two", ADD_FORM_VALUE, ""),
            request("c@x.com", "", "c", "three", ADD_FORM_VALUE, ""),
            request("d@x.com", "", "d", "four", ADD_FORM_VALUE, ""),
        ];
        rows[0][0] = "10/14/2026 09:30:00".into();
        rows[1][0] = "2026-10-14 18:15:00".into();
        rows[2][0] = "10/4/2026 23:00:00".into();
        rows[3][0] = "not a date".into();
        let ctx = context(rows, vec![]);
        // 2026-10-15 is a Thursday.
        let today = NaiveDate::from_ymd_opt(2026, 10, 15).unwrap();
        let activity = request_activity(&ctx.requests, today);

        assert_eq!(activity.weeks.len(), 3);
        assert_eq!(activity.weeks[2][3], Some(2));
        assert_eq!(activity.weeks[2][4], Some(0));
        assert_eq!(activity.weeks[2][5], None);
        assert_eq!(activity.weeks[1][0], Some(1));
        assert_eq!(activity.unparsed_timestamps, 1);
        assert_eq!(activity.hours.len(), 3);
        assert!(activity.hours.contains(&18.25));
    }

    #[test]
    fn activity_handles_calendar_edges() {
        let ctx = context(
            vec![request("a@x.com", "", "a", "one", ADD_FORM_VALUE, "")],
            vec![],
        );
        let earliest = request_activity(&ctx.requests, NaiveDate::MIN);
        assert_eq!(earliest.weeks.len(), 3);
        assert!(earliest.weeks.iter().flatten().all(Option::is_none));
        assert!(earliest.hours.is_empty());

        let latest = request_activity(&ctx.requests, NaiveDate::MAX);
        assert_eq!(latest.weeks.len(), 3);
        assert!(latest.weeks.iter().flatten().filter(|d| d.is_some()).count() >= 15);
        assert!(latest.hours.is_empty());
    }

    #[test]
    fn summary_lists_stage_counts_and_warnings() {
        let ctx = context(
            vec![request("a@x.com", "", "a", "one", REMOVE_FORM_VALUE, "")],
            vec![
                roster_row("a@x.com", "a", "one", "r1"),
                roster_row("a@x.com", "a", "one", "r2"),
            ],
        );
        let outcome = run(&ctx, UpdatePolicy::Supersede);
        let text = render_summary_markdown(&outcome.report, false);
        assert!(text.contains("- Roster: 2 -> 0 records"));
        assert!(text.contains("- remove: 1 requests (0 collapsed), roster 2 -> 0, +0 / -2"));
        assert!(text.contains("## Warnings"));
        assert!(text.contains("no (dry run)"));
    }

    fn write_fixture(dir: &Path) {
        let requests = Sheet::new(
            strings(&REQUEST_HEADERS),
            vec![
                request("a@x.com", "", "a", "one", UPDATE_FORM_VALUE, "r2"),
                request("n@x.com", "", "new", "person", ADD_FORM_VALUE, "r1"),
            ],
        );
        let roster = Sheet::new(
            strings(&ROSTER_HEADERS),
            vec![roster_row("a@x.com", "A", "One", "r1")],
        );
        std::fs::write(dir.join("requests.csv"), render_csv(&requests).unwrap()).unwrap();
        std::fs::write(dir.join("roster.csv"), render_csv(&roster).unwrap()).unwrap();
        let field_map = FieldMapFile {
            version: 1,
            fields: mapping().fields,
            ..Default::default()
        };
        std::fs::write(dir.join("field_map.yaml"), serde_yaml::to_string(&field_map).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn pipeline_commits_roster_and_request_log_together() {
        let dir = tempdir().expect("tempdir");
        write_fixture(dir.path());
        let mut config = ReconcileConfig::local(dir.path());
        config.field_map = Some(dir.path().join("field_map.yaml"));
        let pipeline = ReconcilePipeline::new(config).unwrap();

        let summary = pipeline.run_once(RunOptions::default()).await.unwrap();
        assert!(summary.persisted);
        assert_eq!(summary.report.roster_after, 2);
        assert_eq!(summary.report.transitions.last(), Some(&RunStage::Idle));
        assert!(Path::new(&summary.reports_dir).join("summary.md").exists());

        let context = pipeline.load().await.unwrap();
        assert_eq!(context.requests.pending().count(), 0);
        assert_eq!(roles_for(&context.roster, "a@x.com"), vec!["r2"]);

        let again = pipeline.run_once(RunOptions::default()).await.unwrap();
        assert_eq!(again.report.pending.total(), 0);
        assert_eq!(again.report.roster_after, 2);
    }

    #[tokio::test]
    async fn dry_run_writes_reports_only() {
        let dir = tempdir().expect("tempdir");
        write_fixture(dir.path());
        let before = std::fs::read(dir.path().join("roster.csv")).unwrap();
        let mut config = ReconcileConfig::local(dir.path());
        config.field_map = Some(dir.path().join("field_map.yaml"));
        let pipeline = ReconcilePipeline::new(config).unwrap();

        let summary = pipeline
            .run_once(RunOptions {
                only: None,
                dry_run: true,
            })
            .await
            .unwrap();
        assert!(!summary.persisted);
        assert!(!summary.report.transitions.contains(&RunStage::Persisted));
        assert_eq!(std::fs::read(dir.path().join("roster.csv")).unwrap(), before);

        let status = pipeline
            .status(NaiveDate::from_ymd_opt(2026, 10, 15).unwrap())
            .await
            .unwrap();
        assert_eq!(status.pending.add, 1);
        assert_eq!(status.pending.update, 1);
        assert_eq!(status.roster_records, 1);
        assert_eq!(status.unfinished_commit, None);
    }

    #[tokio::test]
    async fn positional_mapping_mismatch_fails_fast() {
        let dir = tempdir().expect("tempdir");
        write_fixture(dir.path());
        let pipeline = ReconcilePipeline::new(ReconcileConfig::local(dir.path())).unwrap();
        let err = pipeline.run_once(RunOptions::default()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::Mapping(_))
        ));
    }
}
