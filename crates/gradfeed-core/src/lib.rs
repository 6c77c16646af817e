//! Core domain model for gradfeed: survey records, natural keys and the per-run dataset.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "gradfeed-core";

/// Scheme + host every canonical record URL starts with.
pub const SOURCE_ORIGIN: &str = "https://www.thegradcafe.com";
pub const RESULT_PATH_PREFIX: &str = "/result/";

pub const GPA_RANGE: RangeInclusive<f64> = 0.0..=5.0;
/// Valid range for the quantitative and verbal GRE section scores.
pub const GRE_SECTION_RANGE: RangeInclusive<f64> = 130.0..=170.0;

/// Natural identifier of one survey entry, the integer in `/result/<id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKey(pub i64);

impl RecordKey {
    /// Parses a result link in relative (`/result/123`) or absolute form.
    /// Anything else, including other hosts or non-numeric ids, yields `None`.
    pub fn from_result_href(href: &str) -> Option<Self> {
        let href = href.trim();
        let path = if href.starts_with('/') {
            href
        } else {
            href.strip_prefix(SOURCE_ORIGIN)?
        };
        let id = path.strip_prefix(RESULT_PATH_PREFIX)?;
        let id = id.strip_suffix('/').unwrap_or(id);
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        id.parse().ok().map(Self)
    }

    pub fn canonical_url(self) -> String {
        format!("{SOURCE_ORIGIN}{RESULT_PATH_PREFIX}{}", self.0)
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One fetched result-list page. Never persisted except by the raw page archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPage {
    pub page: u32,
    pub markup: String,
}

/// Markup of a single entry: the main row plus the optional detail and comment rows.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawFragment {
    pub main: String,
    pub detail: Option<String>,
    pub comment: Option<String>,
}

/// Admission outcome. Only acceptances and rejections carry a decision date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Status {
    Accepted { on: Option<NaiveDate> },
    Rejected { on: Option<NaiveDate> },
    WaitListed,
    Other,
}

impl Status {
    pub fn label(&self) -> &'static str {
        match self {
            Status::Accepted { .. } => "Accepted",
            Status::Rejected { .. } => "Rejected",
            Status::WaitListed => "Wait-listed",
            Status::Other => "Other",
        }
    }

    pub fn decision_date(&self) -> Option<NaiveDate> {
        match self {
            Status::Accepted { on } | Status::Rejected { on } => *on,
            Status::WaitListed | Status::Other => None,
        }
    }

    /// Rebuilds a status from its stored label and decision date.
    pub fn from_label(label: &str, on: Option<NaiveDate>) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "accepted" => Status::Accepted { on },
            "rejected" => Status::Rejected { on },
            "wait-listed" | "wait listed" | "waitlisted" => Status::WaitListed,
            _ => Status::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Season {
    Spring,
    Summer,
    Fall,
    Winter,
}

impl Season {
    pub fn as_str(&self) -> &'static str {
        match self {
            Season::Spring => "Spring",
            Season::Summer => "Summer",
            Season::Fall => "Fall",
            Season::Winter => "Winter",
        }
    }

    fn parse(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "spring" => Some(Season::Spring),
            "summer" => Some(Season::Summer),
            "fall" => Some(Season::Fall),
            "winter" => Some(Season::Winter),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term {
    pub season: Season,
    pub year: i32,
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.season.as_str(), self.year)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermParseError(pub String);

impl fmt::Display for TermParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "not a term: {:?}", self.0)
    }
}

impl std::error::Error for TermParseError {}

impl FromStr for Term {
    type Err = TermParseError;

    /// Accepts `<Season> <four-digit year>`, case-insensitive on the season.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let (Some(season), Some(year), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(TermParseError(s.to_string()));
        };
        let season = Season::parse(season).ok_or_else(|| TermParseError(s.to_string()))?;
        if year.len() != 4 || !year.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TermParseError(s.to_string()));
        }
        let year = year.parse().map_err(|_| TermParseError(s.to_string()))?;
        Ok(Term { season, year })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    International,
    American,
    Unknown,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::International => "International",
            Origin::American => "American",
            Origin::Unknown => "Unknown",
        }
    }

    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "international" => Origin::International,
            "american" | "us" => Origin::American,
            _ => Origin::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Degree {
    Masters,
    PhD,
    Other,
    Unknown,
}

impl Degree {
    pub fn as_str(&self) -> &'static str {
        match self {
            Degree::Masters => "Masters",
            Degree::PhD => "PhD",
            Degree::Other => "Other",
            Degree::Unknown => "Unknown",
        }
    }

    pub fn from_label(label: &str) -> Self {
        let normalized = label
            .trim()
            .to_ascii_lowercase()
            .replace(['.', '\''], "");
        match normalized.as_str() {
            "" | "unknown" => Degree::Unknown,
            "masters" | "master" | "ms" | "ma" | "msc" | "meng" => Degree::Masters,
            "phd" => Degree::PhD,
            _ => Degree::Other,
        }
    }
}

/// Program/university pair, the only part of a record enrichment may rewrite.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamePair {
    pub program: String,
    pub university: String,
}

/// One applicant entry. Optional fields stay `None` when absent or invalid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredRecord {
    pub key: RecordKey,
    pub url: String,
    pub program: String,
    pub university: String,
    pub comments: Option<String>,
    pub added_date: NaiveDate,
    pub status: Status,
    pub term: Option<Term>,
    pub origin: Origin,
    pub degree: Degree,
    pub gpa: Option<f64>,
    pub gre: Option<f64>,
    pub gre_verbal: Option<f64>,
    pub gre_aw: Option<f64>,
}

impl StructuredRecord {
    pub fn names(&self) -> NamePair {
        NamePair {
            program: self.program.clone(),
            university: self.university.clone(),
        }
    }

    pub fn apply_names(&mut self, names: NamePair) {
        self.program = names.program;
        self.university = names.university;
    }

    /// True when `url` is the canonical URL for `key`.
    pub fn url_matches_key(&self) -> bool {
        RecordKey::from_result_href(&self.url) == Some(self.key)
    }

    /// Downgrades out-of-range numerics to absent; returns how many were dropped.
    pub fn sanitize(&mut self) -> usize {
        let before = self.present_scores();
        self.gpa = within(&GPA_RANGE, self.gpa);
        self.gre = within(&GRE_SECTION_RANGE, self.gre);
        self.gre_verbal = within(&GRE_SECTION_RANGE, self.gre_verbal);
        self.gre_aw = self.gre_aw.filter(|v| v.is_finite());
        before - self.present_scores()
    }

    fn present_scores(&self) -> usize {
        [self.gpa, self.gre, self.gre_verbal, self.gre_aw]
            .iter()
            .filter(|v| v.is_some())
            .count()
    }
}

/// Keeps `value` only if it is finite and inside `range`.
pub fn within(range: &RangeInclusive<f64>, value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && range.contains(v))
}

/// Records accumulated by one ingestion run, in fetch order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Dataset {
    pub records: Vec<StructuredRecord>,
    /// Already-stored keys that showed up on fetched pages during the run.
    #[serde(default)]
    pub known_duplicates: BTreeSet<RecordKey>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<StructuredRecord>) -> Self {
        let mut dataset = Self::new();
        for record in records {
            dataset.push_unique(record);
        }
        dataset
    }

    /// Appends a record unless one with the same key is already present.
    pub fn push_unique(&mut self, record: StructuredRecord) -> bool {
        if self.records.iter().any(|r| r.key == record.key) {
            return false;
        }
        self.records.push(record);
        true
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn keys(&self) -> BTreeSet<RecordKey> {
        self.records.iter().map(|r| r.key).collect()
    }
}
