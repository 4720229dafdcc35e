//! Core roster and request-log model for the resume book tools.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "rbook-core";

pub const ADD_FORM_VALUE: &str = "Add my first resume to this resume book";
pub const UPDATE_FORM_VALUE: &str = "I already have a resume in this book and want to update it to a newer version or update my information in the survey.";
pub const REMOVE_FORM_VALUE: &str =
    "I am no longer looking for a position and wish to remove my resume.";

/// Value written into the `Done?` column once a request has been applied.
pub const DONE_MARK: &str = "yes";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("request row {position} has unknown action {value:?}")]
    UnknownAction { position: usize, value: String },
    #[error("{table} sheet is missing required column {column:?}")]
    MissingColumn { table: &'static str, column: String },
    #[error("field mapping rejected: {0}")]
    Mapping(String),
}

/// Raw tabular exchange format shared by every source and sink.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sheet {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Sheet {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let mut sheet = Self { headers, rows };
        sheet.pad_rows();
        sheet
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        find_column(&self.headers, name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Pads short rows with empty cells so every row spans the header width.
    pub fn pad_rows(&mut self) {
        let width = self.headers.len();
        for row in &mut self.rows {
            if row.len() < width {
                row.resize(width, String::new());
            }
        }
    }
}

/// Looks a header up by exact name, then by trimmed name.
///
/// Form exports carry stray whitespace in headers (`"Email "`), so a trimmed
/// comparison is accepted when no exact header exists.
pub fn find_column(headers: &[String], name: &str) -> Option<usize> {
    headers
        .iter()
        .position(|h| h == name)
        .or_else(|| headers.iter().position(|h| h.trim() == name.trim()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestAction {
    Add,
    Update,
    Remove,
}

impl RequestAction {
    pub const ALL: [RequestAction; 3] = [Self::Add, Self::Update, Self::Remove];

    pub fn from_form_value(value: &str) -> Option<Self> {
        match value.trim() {
            v if v == ADD_FORM_VALUE => Some(Self::Add),
            v if v == UPDATE_FORM_VALUE => Some(Self::Update),
            v if v == REMOVE_FORM_VALUE => Some(Self::Remove),
            _ => None,
        }
    }

    pub fn form_value(self) -> &'static str {
        match self {
            Self::Add => ADD_FORM_VALUE,
            Self::Update => UPDATE_FORM_VALUE,
            Self::Remove => REMOVE_FORM_VALUE,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Remove => "remove",
        }
    }
}

impl fmt::Display for RequestAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for RequestAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "add" => Ok(Self::Add),
            "update" => Ok(Self::Update),
            "remove" => Ok(Self::Remove),
            _ => Self::from_form_value(s)
                .ok_or_else(|| format!("unknown action {s:?} (expected add, update or remove)")),
        }
    }
}

/// Identifying fields of a submitter or roster entry. Empty string means missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub email: String,
    pub secondary_email: String,
    pub first_name: String,
    pub last_name: String,
}

impl Identity {
    pub fn has_email(&self) -> bool {
        !self.email.is_empty() || !self.secondary_email.is_empty()
    }

    pub fn has_name(&self) -> bool {
        !self.first_name.is_empty() && !self.last_name.is_empty()
    }

    /// Non-empty email values, primary first.
    pub fn emails(&self) -> impl Iterator<Item = &str> {
        [self.email.as_str(), self.secondary_email.as_str()]
            .into_iter()
            .filter(|e| !e.is_empty())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.email.is_empty(), self.secondary_email.is_empty()) {
            (false, _) => write!(f, "{} ({} {})", self.email, self.first_name, self.last_name),
            (true, false) => write!(
                f,
                "{} ({} {})",
                self.secondary_email, self.first_name, self.last_name
            ),
            (true, true) => write!(f, "{} {}", self.first_name, self.last_name),
        }
    }
}

/// Header names of the intake-form request sheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestColumns {
    pub timestamp: String,
    pub email: String,
    pub secondary_email: String,
    pub first_name: String,
    pub last_name: String,
    pub action: String,
    pub done: String,
}

impl Default for RequestColumns {
    fn default() -> Self {
        Self {
            timestamp: "Timestamp".to_string(),
            email: "Email ".to_string(),
            secondary_email: "Email Address".to_string(),
            first_name: "First Name".to_string(),
            last_name: "Last Name".to_string(),
            action: "Do you want to add, update, or remove your resume?".to_string(),
            done: "Done?".to_string(),
        }
    }
}

/// Resolved column positions within a request sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLayout {
    pub timestamp: Option<usize>,
    pub email: usize,
    pub secondary_email: Option<usize>,
    pub first_name: usize,
    pub last_name: usize,
    pub action: usize,
    pub done: usize,
}

impl RequestLayout {
    pub fn identity(&self, row: &RequestRow) -> Identity {
        Identity {
            email: row.cell(self.email).to_string(),
            secondary_email: self
                .secondary_email
                .map(|idx| row.cell(idx).to_string())
                .unwrap_or_default(),
            first_name: row.cell(self.first_name).to_string(),
            last_name: row.cell(self.last_name).to_string(),
        }
    }

    pub fn action(&self, row: &RequestRow) -> Result<RequestAction, CoreError> {
        let value = row.cell(self.action);
        RequestAction::from_form_value(value).ok_or_else(|| CoreError::UnknownAction {
            position: row.position,
            value: value.to_string(),
        })
    }

    pub fn timestamp<'a>(&self, row: &'a RequestRow) -> &'a str {
        self.timestamp.map(|idx| row.cell(idx)).unwrap_or_default()
    }

    pub fn is_done(&self, row: &RequestRow) -> bool {
        row.cell(self.done).trim().eq_ignore_ascii_case(DONE_MARK)
    }

    /// Columns holding identity values, in the order normalization visits them.
    pub fn identity_columns(&self) -> Vec<usize> {
        let mut cols = vec![self.email];
        cols.extend(self.secondary_email);
        cols.push(self.first_name);
        cols.push(self.last_name);
        cols
    }
}

/// One form submission. `position` is the row's index in the request sheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRow {
    pub position: usize,
    pub cells: Vec<String>,
}

impl RequestRow {
    pub fn cell(&self, idx: usize) -> &str {
        self.cells.get(idx).map(String::as_str).unwrap_or_default()
    }
}

/// The full request sheet, done and pending rows alike.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLog {
    headers: Vec<String>,
    layout: RequestLayout,
    rows: Vec<RequestRow>,
}

impl RequestLog {
    /// Resolves the layout against `sheet`. A missing `Done?` column is appended.
    pub fn from_sheet(sheet: Sheet, columns: &RequestColumns) -> Result<Self, CoreError> {
        let mut sheet = sheet;
        sheet.pad_rows();
        let required = |name: &String| {
            sheet.column(name).ok_or_else(|| CoreError::MissingColumn {
                table: "request",
                column: name.clone(),
            })
        };
        let email = required(&columns.email)?;
        let first_name = required(&columns.first_name)?;
        let last_name = required(&columns.last_name)?;
        let action = required(&columns.action)?;
        let timestamp = sheet.column(&columns.timestamp);
        let secondary_email = sheet.column(&columns.secondary_email);

        let done = match sheet.column(&columns.done) {
            Some(idx) => idx,
            None => {
                sheet.headers.push(columns.done.clone());
                for row in &mut sheet.rows {
                    row.push(String::new());
                }
                sheet.headers.len() - 1
            }
        };

        let rows = sheet
            .rows
            .into_iter()
            .enumerate()
            .map(|(position, cells)| RequestRow { position, cells })
            .collect();

        Ok(Self {
            headers: sheet.headers,
            layout: RequestLayout {
                timestamp,
                email,
                secondary_email,
                first_name,
                last_name,
                action,
                done,
            },
            rows,
        })
    }

    pub fn to_sheet(&self) -> Sheet {
        Sheet {
            headers: self.headers.clone(),
            rows: self.rows.iter().map(|r| r.cells.clone()).collect(),
        }
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn layout(&self) -> &RequestLayout {
        &self.layout
    }

    pub fn rows(&self) -> &[RequestRow] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut [RequestRow] {
        &mut self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = &RequestRow> {
        self.rows.iter().filter(|r| !self.layout.is_done(r))
    }

    pub fn mark_done(&mut self, position: usize) {
        let done = self.layout.done;
        if let Some(row) = self.rows.get_mut(position) {
            if let Some(cell) = row.cells.get_mut(done) {
                *cell = DONE_MARK.to_string();
            }
        }
    }
}

/// Header names of the roster sheet's identity columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RosterColumns {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

impl Default for RosterColumns {
    fn default() -> Self {
        Self {
            email: "Email".to_string(),
            first_name: "First Name".to_string(),
            last_name: "Last Name".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RosterLayout {
    pub email: usize,
    pub first_name: usize,
    pub last_name: usize,
}

impl RosterLayout {
    pub fn identity(&self, record: &RosterRecord) -> Identity {
        Identity {
            email: record.cell(self.email).to_string(),
            secondary_email: String::new(),
            first_name: record.cell(self.first_name).to_string(),
            last_name: record.cell(self.last_name).to_string(),
        }
    }
}

/// One resume-book entry. `inserted_at` orders records by recency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterRecord {
    pub inserted_at: u64,
    pub cells: Vec<String>,
}

impl RosterRecord {
    pub fn cell(&self, idx: usize) -> &str {
        self.cells.get(idx).map(String::as_str).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterTable {
    headers: Vec<String>,
    layout: RosterLayout,
    records: Vec<RosterRecord>,
    next_ordinal: u64,
}

impl RosterTable {
    /// Ordinals follow sheet row order on load.
    pub fn from_sheet(sheet: Sheet, columns: &RosterColumns) -> Result<Self, CoreError> {
        let mut sheet = sheet;
        sheet.pad_rows();
        let required = |name: &String| {
            sheet.column(name).ok_or_else(|| CoreError::MissingColumn {
                table: "roster",
                column: name.clone(),
            })
        };
        let layout = RosterLayout {
            email: required(&columns.email)?,
            first_name: required(&columns.first_name)?,
            last_name: required(&columns.last_name)?,
        };
        let records: Vec<RosterRecord> = sheet
            .rows
            .into_iter()
            .zip(0u64..)
            .map(|(cells, inserted_at)| RosterRecord { inserted_at, cells })
            .collect();
        let next_ordinal = records.len() as u64;
        Ok(Self {
            headers: sheet.headers,
            layout,
            records,
            next_ordinal,
        })
    }

    /// Emits records oldest first.
    pub fn to_sheet(&self) -> Sheet {
        let mut records = self.records.iter().collect::<Vec<_>>();
        records.sort_by_key(|r| r.inserted_at);
        Sheet {
            headers: self.headers.clone(),
            rows: records.into_iter().map(|r| r.cells.clone()).collect(),
        }
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn layout(&self) -> &RosterLayout {
        &self.layout
    }

    pub fn records(&self) -> &[RosterRecord] {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut [RosterRecord] {
        &mut self.records
    }

    pub fn record(&self, position: usize) -> Option<&RosterRecord> {
        self.records.get(position)
    }

    pub fn identity_at(&self, position: usize) -> Option<Identity> {
        self.records.get(position).map(|r| self.layout.identity(r))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Appends a record (cells in roster header order) and returns its ordinal.
    pub fn append(&mut self, mut cells: Vec<String>) -> u64 {
        cells.resize(self.headers.len(), String::new());
        let inserted_at = self.next_ordinal;
        self.next_ordinal += 1;
        self.records.push(RosterRecord { inserted_at, cells });
        inserted_at
    }

    /// Removes the records at `positions`; returns how many were removed.
    pub fn remove_positions(&mut self, positions: &[usize]) -> usize {
        let before = self.records.len();
        let mut idx = 0usize;
        self.records.retain(|_| {
            let keep = !positions.contains(&idx);
            idx += 1;
            keep
        });
        before - self.records.len()
    }

    /// Reassigns dense 0-based ordinals in current recency order.
    pub fn renumber(&mut self) {
        self.records.sort_by_key(|r| r.inserted_at);
        for (record, ordinal) in self.records.iter_mut().zip(0u64..) {
            record.inserted_at = ordinal;
        }
        self.next_ordinal = self.records.len() as u64;
    }
}

/// Declared request-column to roster-column pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldPair {
    pub request: String,
    pub roster: String,
}

/// Explicit payload mapping from the request sheet onto the roster sheet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub fields: Vec<FieldPair>,
}

/// A mapping checked against concrete headers; indexed by roster column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMapping {
    sources: Vec<usize>,
}

impl FieldMapping {
    /// Zips the request columns `start..=end` (minus `skip`) onto the roster
    /// headers in order. Fails when the two ranges differ in length, or when a
    /// header name present on both sides would be paired with a different one.
    pub fn positional(
        request_headers: &[String],
        roster_headers: &[String],
        start: &str,
        end: &str,
        skip: &[&str],
    ) -> Result<Self, CoreError> {
        let missing = |column: &str| CoreError::MissingColumn {
            table: "request",
            column: column.to_string(),
        };
        let from = find_column(request_headers, start).ok_or_else(|| missing(start))?;
        let to = find_column(request_headers, end).ok_or_else(|| missing(end))?;
        if to < from {
            return Err(CoreError::Mapping(format!(
                "payload range {start:?}..{end:?} is reversed"
            )));
        }
        let sources = request_headers[from..=to]
            .iter()
            .filter(|h| !skip.iter().any(|s| h.trim() == s.trim()))
            .collect::<Vec<_>>();
        if sources.len() != roster_headers.len() {
            return Err(CoreError::Mapping(format!(
                "payload range {start:?}..{end:?} has {} columns but the roster has {}",
                sources.len(),
                roster_headers.len()
            )));
        }
        for (idx, (request, roster)) in sources.iter().zip(roster_headers).enumerate() {
            if request.trim() == roster.trim() {
                continue;
            }
            let request_elsewhere = roster_headers.iter().any(|r| r.trim() == request.trim());
            let roster_elsewhere = sources.iter().any(|s| s.trim() == roster.trim());
            if request_elsewhere || roster_elsewhere {
                return Err(CoreError::Mapping(format!(
                    "payload column {} would fill roster column {:?} from {:?}; \
                     the two sheets list their columns in a different order",
                    idx + 1,
                    roster,
                    request
                )));
            }
        }
        Ok(Self {
            fields: sources
                .into_iter()
                .zip(roster_headers)
                .map(|(request, roster)| FieldPair {
                    request: request.clone(),
                    roster: roster.clone(),
                })
                .collect(),
        })
    }

    pub fn resolve(
        &self,
        request_headers: &[String],
        request_layout: &RequestLayout,
        roster_headers: &[String],
    ) -> Result<ResolvedMapping, CoreError> {
        let mut sources: Vec<Option<usize>> = vec![None; roster_headers.len()];
        for pair in &self.fields {
            let source = find_column(request_headers, &pair.request).ok_or_else(|| {
                CoreError::Mapping(format!("request column {:?} does not exist", pair.request))
            })?;
            if source == request_layout.action || source == request_layout.done {
                return Err(CoreError::Mapping(format!(
                    "request column {:?} is not part of the profile payload",
                    pair.request
                )));
            }
            let target = find_column(roster_headers, &pair.roster).ok_or_else(|| {
                CoreError::Mapping(format!("roster column {:?} does not exist", pair.roster))
            })?;
            if sources[target].replace(source).is_some() {
                return Err(CoreError::Mapping(format!(
                    "roster column {:?} is mapped more than once",
                    pair.roster
                )));
            }
        }
        let unmapped = roster_headers
            .iter()
            .zip(&sources)
            .filter(|(_, s)| s.is_none())
            .map(|(h, _)| h.as_str())
            .collect::<Vec<_>>();
        if !unmapped.is_empty() {
            return Err(CoreError::Mapping(format!(
                "roster columns without a source: {}",
                unmapped.join(", ")
            )));
        }
        Ok(ResolvedMapping {
            sources: sources.into_iter().flatten().collect(),
        })
    }
}

impl ResolvedMapping {
    /// Request column feeding roster column `target`.
    pub fn source_of(&self, target: usize) -> Option<usize> {
        self.sources.get(target).copied()
    }

    /// Roster identity columns must be filled from the matching request
    /// identity columns, or matching would compare unrelated values.
    pub fn check_identity(
        &self,
        request: &RequestLayout,
        roster_headers: &[String],
        roster: &RosterLayout,
    ) -> Result<(), CoreError> {
        let emails = [Some(request.email), request.secondary_email];
        let checks = [
            (
                roster.email,
                self.source_of(roster.email)
                    .is_some_and(|source| emails.contains(&Some(source))),
            ),
            (
                roster.first_name,
                self.source_of(roster.first_name) == Some(request.first_name),
            ),
            (
                roster.last_name,
                self.source_of(roster.last_name) == Some(request.last_name),
            ),
        ];
        for (target, ok) in checks {
            if !ok {
                let name = roster_headers.get(target).map(String::as_str).unwrap_or("?");
                return Err(CoreError::Mapping(format!(
                    "roster identity column {name:?} is not filled from its request counterpart"
                )));
            }
        }
        Ok(())
    }

    /// Builds roster cells (roster header order) from a request row.
    pub fn project(&self, row: &RequestRow) -> Vec<String> {
        self.sources.iter().map(|&idx| row.cell(idx).to_string()).collect()
    }

    pub fn width(&self) -> usize {
        self.sources.len()
    }
}
