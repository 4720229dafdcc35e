//! Recruiter-facing roster figures and keyword search.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::Context;
use rbook_core::{CoreError, Sheet};
use serde::{Deserialize, Serialize};

/// Position preferences in display order; anything else sorts after these.
pub const POSITION_ORDER: [&str; 3] = ["Internship", "Full time", "Both"];

/// Roles must appear at least this often to be listed in the overview.
pub const MIN_ROLE_COUNT: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecruiterColumns {
    pub grad_year: String,
    pub grad_quarter: String,
    pub position: String,
    pub roles: String,
    pub resume_text: String,
}

impl Default for RecruiterColumns {
    fn default() -> Self {
        Self {
            grad_year: "Grad Year".to_string(),
            grad_quarter: "Grad Quarter".to_string(),
            position: "Are you looking for an internship or full-time position?".to_string(),
            roles: "What types of roles are you looking for?".to_string(),
            resume_text: "Resume Full Text".to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RecruiterSection {
    #[serde(default)]
    recruiter_columns: RecruiterColumns,
}

impl RecruiterColumns {
    /// Reads the optional `recruiter_columns` section of a field map file.
    pub fn from_field_map(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let section: RecruiterSection =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(section.recruiter_columns)
    }
}

#[derive(Debug, Clone, Copy)]
struct RecruiterLayout {
    grad_year: usize,
    grad_quarter: usize,
    position: usize,
    roles: usize,
    resume_text: usize,
}

impl RecruiterLayout {
    fn resolve(sheet: &Sheet, columns: &RecruiterColumns) -> Result<Self, CoreError> {
        let find = |name: &String| {
            sheet.column(name).ok_or_else(|| CoreError::MissingColumn {
                table: "roster",
                column: name.clone(),
            })
        };
        Ok(Self {
            grad_year: find(&columns.grad_year)?,
            grad_quarter: find(&columns.grad_quarter)?,
            position: find(&columns.position)?,
            roles: find(&columns.roles)?,
            resume_text: find(&columns.resume_text)?,
        })
    }
}

fn cell(row: &[String], idx: usize) -> &str {
    row.get(idx).map(|s| s.trim()).unwrap_or("")
}

/// Grad years arrive as "2026" or, from some spreadsheet exports, "2026.0".
pub fn parse_grad_year(value: &str) -> Option<i32> {
    let value = value.trim();
    if let Ok(year) = value.parse::<i32>() {
        return Some(year);
    }
    let float = value.parse::<f64>().ok()?;
    if float.fract() == 0.0 && float >= f64::from(i32::MIN) && float <= f64::from(i32::MAX) {
        Some(float as i32)
    } else {
        None
    }
}

/// Splits a multi-select answer the way the form joins it.
pub fn split_roles(value: &str) -> impl Iterator<Item = &str> {
    value.split(", ").map(str::trim).filter(|r| !r.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountRow {
    pub label: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarterBreakdown {
    pub year: i32,
    pub quarters: Vec<CountRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterOverview {
    pub records: usize,
    pub grad_years: Vec<CountRow>,
    pub quarter_breakdown: Option<QuarterBreakdown>,
    pub positions: Vec<CountRow>,
    pub roles: Vec<CountRow>,
}

/// Counts for the overview page. `year` picks the quarter breakdown; the
/// latest grad year present is used when it is absent.
pub fn roster_overview(
    sheet: &Sheet,
    columns: &RecruiterColumns,
    year: Option<i32>,
) -> Result<RosterOverview, CoreError> {
    let layout = RecruiterLayout::resolve(sheet, columns)?;

    let mut years: BTreeMap<i32, usize> = BTreeMap::new();
    let mut positions: HashMap<&str, usize> = HashMap::new();
    let mut roles: HashMap<&str, usize> = HashMap::new();
    for row in &sheet.rows {
        if let Some(y) = parse_grad_year(cell(row, layout.grad_year)) {
            *years.entry(y).or_default() += 1;
        }
        let position = cell(row, layout.position);
        if !position.is_empty() {
            *positions.entry(position).or_default() += 1;
        }
        for role in split_roles(cell(row, layout.roles)) {
            *roles.entry(role).or_default() += 1;
        }
    }

    let selected = year.or_else(|| years.keys().next_back().copied());
    let quarter_breakdown = selected.map(|year| {
        let mut quarters: BTreeMap<&str, usize> = BTreeMap::new();
        for row in &sheet.rows {
            if parse_grad_year(cell(row, layout.grad_year)) != Some(year) {
                continue;
            }
            let quarter = cell(row, layout.grad_quarter);
            if !quarter.is_empty() {
                *quarters.entry(quarter).or_default() += 1;
            }
        }
        QuarterBreakdown {
            year,
            quarters: by_count(quarters.into_iter()),
        }
    });

    let mut positions = positions
        .into_iter()
        .map(|(label, count)| CountRow {
            label: label.to_string(),
            count,
        })
        .collect::<Vec<_>>();
    positions.sort_by(|a, b| {
        let rank = |label: &str| {
            POSITION_ORDER
                .iter()
                .position(|p| *p == label)
                .unwrap_or(POSITION_ORDER.len())
        };
        rank(&a.label)
            .cmp(&rank(&b.label))
            .then_with(|| a.label.cmp(&b.label))
    });

    let roles = by_count(roles.into_iter().filter(|(_, count)| *count >= MIN_ROLE_COUNT));

    Ok(RosterOverview {
        records: sheet.len(),
        grad_years: years
            .into_iter()
            .map(|(y, count)| CountRow {
                label: y.to_string(),
                count,
            })
            .collect(),
        quarter_breakdown,
        positions,
        roles,
    })
}

fn by_count<'a>(counts: impl Iterator<Item = (&'a str, usize)>) -> Vec<CountRow> {
    let mut rows = counts
        .map(|(label, count)| CountRow {
            label: label.to_string(),
            count,
        })
        .collect::<Vec<_>>();
    rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.label.cmp(&b.label)));
    rows
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub year_from: Option<i32>,
    pub year_to: Option<i32>,
    /// Empty means every quarter.
    pub quarters: Vec<String>,
    /// Empty means every role; otherwise any substring hit passes.
    pub roles: Vec<String>,
    pub keywords: Vec<String>,
}

impl SearchQuery {
    fn normalized_keywords(&self) -> Vec<String> {
        let mut keywords = Vec::new();
        for kw in &self.keywords {
            let kw = kw.trim().to_lowercase();
            if !kw.is_empty() && !keywords.contains(&kw) {
                keywords.push(kw);
            }
        }
        keywords
    }

    fn admits(&self, row: &[String], layout: &RecruiterLayout) -> bool {
        if self.year_from.is_some() || self.year_to.is_some() {
            let Some(year) = parse_grad_year(cell(row, layout.grad_year)) else {
                return false;
            };
            if self.year_from.is_some_and(|from| year < from)
                || self.year_to.is_some_and(|to| year > to)
            {
                return false;
            }
        }
        if !self.quarters.is_empty() {
            let quarter = cell(row, layout.grad_quarter);
            if !self.quarters.iter().any(|q| q.trim() == quarter) {
                return false;
            }
        }
        if !self.roles.is_empty() {
            let roles = cell(row, layout.roles);
            if roles.is_empty() || !self.roles.iter().any(|r| roles.contains(r.trim())) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    /// Index into the searched sheet's rows.
    pub row: usize,
    pub matched_keywords: Vec<String>,
    pub match_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResults {
    pub keywords: Vec<String>,
    /// Rows passing the filters, keywords ignored.
    pub filtered: usize,
    pub exact_matches: usize,
    pub partial_matches: usize,
    pub max_match: usize,
    pub hits: Vec<SearchHit>,
}

pub fn search_roster(
    sheet: &Sheet,
    columns: &RecruiterColumns,
    query: &SearchQuery,
) -> Result<SearchResults, CoreError> {
    let layout = RecruiterLayout::resolve(sheet, columns)?;
    let keywords = query.normalized_keywords();

    let hits = sheet
        .rows
        .iter()
        .enumerate()
        .filter(|(_, row)| query.admits(row, &layout))
        .map(|(idx, row)| {
            let text = cell(row, layout.resume_text).to_lowercase();
            let matched_keywords = keywords
                .iter()
                .filter(|kw| text.contains(kw.as_str()))
                .cloned()
                .collect::<Vec<_>>();
            SearchHit {
                row: idx,
                match_count: matched_keywords.len(),
                matched_keywords,
            }
        })
        .collect::<Vec<_>>();

    let exact_matches = hits.iter().filter(|h| h.match_count == keywords.len()).count();
    let partial_matches = hits
        .iter()
        .filter(|h| h.match_count > 0 && h.match_count < keywords.len())
        .count();
    let max_match = hits.iter().map(|h| h.match_count).max().unwrap_or(0);

    Ok(SearchResults {
        keywords,
        filtered: hits.len(),
        exact_matches,
        partial_matches,
        max_match,
        hits,
    })
}

/// Hits with at least `min_matches` keywords, as a sheet with the match
/// columns appended.
pub fn export_sheet(sheet: &Sheet, results: &SearchResults, min_matches: usize) -> Sheet {
    let mut headers = sheet.headers.clone();
    headers.push("matched_keywords".to_string());
    headers.push("match_count".to_string());
    let rows = results
        .hits
        .iter()
        .filter(|hit| hit.match_count >= min_matches)
        .filter_map(|hit| {
            let mut row = sheet.rows.get(hit.row)?.clone();
            row.resize(sheet.headers.len(), String::new());
            row.push(hit.matched_keywords.join(", "));
            row.push(hit.match_count.to_string());
            Some(row)
        })
        .collect();
    Sheet::new(headers, rows)
}
