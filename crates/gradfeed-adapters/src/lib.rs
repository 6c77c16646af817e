//! Listing sources and the survey markup parser.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use gradfeed_core::{
    Degree, Origin, RawFragment, RawPage, RecordKey, Status, StructuredRecord, Term,
};
use gradfeed_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "gradfeed-adapters";

pub const DEFAULT_LISTING_URL: &str = "https://www.thegradcafe.com/survey/?page={page}";
pub const PAGE_PLACEHOLDER: &str = "{page}";

/// A main listing row has at least this many cells.
const MAIN_ROW_MIN_CELLS: usize = 5;

const ADDED_DATE_FORMATS: &[&str] = &["%B %d, %Y", "%b %d, %Y", "%Y-%m-%d", "%d/%m/%Y"];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetching listing page {page}: {source}")]
    Fetch {
        page: u32,
        #[source]
        source: FetchError,
    },
    #[error("reading fixture page {path:?}: {source}")]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("listing url template has no {{page}} placeholder: {0}")]
    InvalidTemplate(String),
    #[error("invalid selector {selector:?}: {message}")]
    Selector {
        selector: &'static str,
        message: String,
    },
}

/// Why one record's markup could not become a [`StructuredRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("result link does not match /result/<id>: {0:?}")]
    InvalidUrl(String),
    #[error("unparseable added date {0:?}")]
    InvalidDate(String),
}

/// A record fresh out of the extractor, with the number of numeric fields
/// that were present but out of range and therefore dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub record: StructuredRecord,
    pub downgraded: usize,
}

/// Where listing pages come from.
#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn fetch_page(&self, run_id: Uuid, page: u32) -> Result<RawPage, AdapterError>;

    fn describe(&self) -> String;
}

/// Markup-facing half of the pipeline. Keeps HTML details out of the controller.
pub trait ListingParser: Send + Sync {
    /// Keys linked from `markup`, found without building a document tree.
    fn scan_keys(&self, markup: &str) -> BTreeSet<RecordKey> {
        scan_result_hrefs(markup)
            .filter_map(RecordKey::from_result_href)
            .collect()
    }

    fn split_fragments(&self, markup: &str) -> Vec<RawFragment>;

    fn fragment_key(&self, fragment: &RawFragment) -> Option<RecordKey> {
        scan_result_hrefs(&fragment.main).find_map(RecordKey::from_result_href)
    }

    fn extract(&self, fragment: &RawFragment) -> Result<Extracted, ExtractionError>;
}

/// Yields the raw value of every quoted `href` attribute in `markup`.
pub fn scan_result_hrefs(markup: &str) -> impl Iterator<Item = &str> {
    let mut rest = markup;
    std::iter::from_fn(move || loop {
        let at = rest.find("href=")?;
        rest = &rest[at + "href=".len()..];
        let quote = rest.chars().next()?;
        if quote != '"' && quote != '\'' {
            continue;
        }
        let body = &rest[1..];
        let end = body.find(quote)?;
        rest = &body[end + 1..];
        return Some(&body[..end]);
    })
}

#[derive(Debug)]
pub struct HttpListingSource {
    template: String,
    fetcher: HttpFetcher,
}

impl HttpListingSource {
    pub fn new(template: impl Into<String>, fetcher: HttpFetcher) -> Result<Self, AdapterError> {
        let template = template.into();
        if !template.contains(PAGE_PLACEHOLDER) {
            return Err(AdapterError::InvalidTemplate(template));
        }
        Ok(Self { template, fetcher })
    }

    pub fn page_url(&self, page: u32) -> String {
        self.template.replace(PAGE_PLACEHOLDER, &page.to_string())
    }
}

#[async_trait]
impl ListingSource for HttpListingSource {
    async fn fetch_page(&self, run_id: Uuid, page: u32) -> Result<RawPage, AdapterError> {
        let url = self.page_url(page);
        let response = self
            .fetcher
            .fetch_text(run_id, &url)
            .await
            .map_err(|source| AdapterError::Fetch { page, source })?;
        Ok(RawPage {
            page,
            markup: response.body,
        })
    }

    fn describe(&self) -> String {
        self.template.clone()
    }
}

/// Replays saved listing pages named `page_<n>.html`. A missing file reads as
/// an empty page, which is what the live site serves past its last page.
#[derive(Debug, Clone)]
pub struct FixtureListingSource {
    dir: PathBuf,
}

impl FixtureListingSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn page_path(&self, page: u32) -> PathBuf {
        self.dir.join(format!("page_{page}.html"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ListingSource for FixtureListingSource {
    async fn fetch_page(&self, _run_id: Uuid, page: u32) -> Result<RawPage, AdapterError> {
        let path = self.page_path(page);
        let markup = match tokio::fs::read_to_string(&path).await {
            Ok(markup) => markup,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(source) => return Err(AdapterError::Fixture { path, source }),
        };
        Ok(RawPage { page, markup })
    }

    fn describe(&self) -> String {
        format!("fixtures:{}", self.dir.display())
    }
}

#[derive(Debug)]
struct SurveySelectors {
    row: Selector,
    cell: Selector,
    university: Selector,
    program: Selector,
    degree: Selector,
    link: Selector,
    div: Selector,
    comment: Selector,
}

fn selector(css: &'static str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector {
        selector: css,
        message: e.to_string(),
    })
}

impl SurveySelectors {
    fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            row: selector("tr")?,
            cell: selector("td")?,
            university: selector("div.tw-font-medium")?,
            program: selector("span:not(.tw-text-gray-500)")?,
            degree: selector("span.tw-text-gray-500")?,
            link: selector("a[href]")?,
            div: selector("div")?,
            comment: selector("p.tw-text-gray-500")?,
        })
    }
}

/// Parser for the survey result table. Each entry spans a main row (five
/// cells), an optional detail row of badge divs and an optional comment row.
#[derive(Debug)]
pub struct SurveyParser {
    sel: SurveySelectors,
}

impl SurveyParser {
    pub fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            sel: SurveySelectors::new()?,
        })
    }

    fn is_main_row(&self, row: &ElementRef<'_>) -> bool {
        row.select(&self.sel.cell).count() >= MAIN_ROW_MIN_CELLS
    }

    fn is_comment_row(&self, row: &ElementRef<'_>) -> bool {
        row.select(&self.sel.comment).next().is_some()
    }

    fn parse_main_row(&self, row: ElementRef<'_>) -> Result<StructuredRecord, ExtractionError> {
        let cells: Vec<ElementRef<'_>> = row.select(&self.sel.cell).collect();

        let university = cells
            .first()
            .and_then(|td| td.select(&self.sel.university).next())
            .and_then(|div| text_or_none(element_text(div)))
            .ok_or(ExtractionError::MissingField("university"))?;

        let program_cell = cells.get(1);
        let program = program_cell
            .and_then(|td| td.select(&self.sel.program).next())
            .and_then(|span| text_or_none(element_text(span)))
            .ok_or(ExtractionError::MissingField("program"))?;
        let degree = program_cell
            .and_then(|td| td.select(&self.sel.degree).next())
            .map(|span| Degree::from_label(&element_text(span)))
            .unwrap_or(Degree::Unknown);

        let href = cells
            .get(4)
            .and_then(|td| {
                td.select(&self.sel.link)
                    .filter_map(|a| a.value().attr("href"))
                    .find(|href| *href != "#")
            })
            .ok_or(ExtractionError::MissingField("url"))?;
        let key = RecordKey::from_result_href(href)
            .ok_or_else(|| ExtractionError::InvalidUrl(href.to_string()))?;

        let added_text = cells
            .get(2)
            .and_then(|td| text_or_none(element_text(*td)))
            .ok_or(ExtractionError::MissingField("added_date"))?;
        let added_date = parse_added_date(&added_text)
            .ok_or_else(|| ExtractionError::InvalidDate(added_text.clone()))?;

        let status = cells
            .get(3)
            .map(|td| parse_status(&element_text(*td), added_date))
            .unwrap_or(Status::Other);

        Ok(StructuredRecord {
            key,
            url: key.canonical_url(),
            program,
            university,
            comments: None,
            added_date,
            status,
            term: None,
            origin: Origin::Unknown,
            degree,
            gpa: None,
            gre: None,
            gre_verbal: None,
            gre_aw: None,
        })
    }

    /// Text of every innermost `div` in the detail row ("Fall 2026", "GPA 3.89", ...).
    fn detail_badges(&self, row: ElementRef<'_>) -> Vec<String> {
        row.select(&self.sel.div)
            .filter(|div| {
                !div.descendants().skip(1).any(|node| {
                    node.value()
                        .as_element()
                        .is_some_and(|el| el.name() == "div")
                })
            })
            .filter_map(|div| text_or_none(element_text(div)))
            .collect()
    }
}

impl ListingParser for SurveyParser {
    fn split_fragments(&self, markup: &str) -> Vec<RawFragment> {
        let document = Html::parse_document(markup);
        let rows: Vec<ElementRef<'_>> = document.select(&self.sel.row).collect();
        let mut fragments = Vec::new();

        let mut i = 0;
        while i < rows.len() {
            if !self.is_main_row(&rows[i]) {
                i += 1;
                continue;
            }
            let mut fragment = RawFragment {
                main: rows[i].html(),
                ..RawFragment::default()
            };
            let mut next = i + 1;
            if let Some(row) = rows.get(next) {
                if !self.is_main_row(row) && !self.is_comment_row(row) {
                    fragment.detail = Some(row.html());
                    next += 1;
                }
            }
            if let Some(row) = rows.get(next) {
                if !self.is_main_row(row) && self.is_comment_row(row) {
                    fragment.comment = Some(row.html());
                    next += 1;
                }
            }
            fragments.push(fragment);
            i = next;
        }
        fragments
    }

    fn extract(&self, fragment: &RawFragment) -> Result<Extracted, ExtractionError> {
        let main = Html::parse_fragment(&wrap_rows(&fragment.main));
        let row = main
            .select(&self.sel.row)
            .next()
            .ok_or(ExtractionError::MissingField("university"))?;
        let mut record = self.parse_main_row(row)?;

        if let Some(detail) = &fragment.detail {
            let detail = Html::parse_fragment(&wrap_rows(detail));
            if let Some(row) = detail.select(&self.sel.row).next() {
                for badge in self.detail_badges(row) {
                    apply_badge(&mut record, &badge);
                }
            }
        }

        if let Some(comment) = &fragment.comment {
            let comment = Html::parse_fragment(&wrap_rows(comment));
            record.comments = comment
                .select(&self.sel.comment)
                .next()
                .and_then(|p| text_or_none(element_text(p)));
        }

        let downgraded = record.sanitize();
        Ok(Extracted { record, downgraded })
    }
}

/// Table rows only survive HTML5 fragment parsing inside a table.
fn wrap_rows(rows: &str) -> String {
    format!("<table>{rows}</table>")
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn apply_badge(record: &mut StructuredRecord, badge: &str) {
    if let Ok(term) = badge.parse::<Term>() {
        record.term = Some(term);
        return;
    }
    match Origin::from_label(badge) {
        Origin::Unknown => {}
        origin => {
            record.origin = origin;
            return;
        }
    }
    if let Some(rest) = badge.strip_prefix("GRE AW") {
        record.gre_aw = first_number(rest);
    } else if let Some(rest) = badge.strip_prefix("GRE V") {
        record.gre_verbal = first_number(rest);
    } else if let Some(rest) = badge.strip_prefix("GRE") {
        record.gre = first_number(rest);
    } else if let Some(rest) = badge.strip_prefix("GPA") {
        record.gpa = first_number(rest);
    }
}

fn first_number(text: &str) -> Option<f64> {
    extract_numbers(text).first().copied()
}

/// Every number in `text`, in order. A `-` directly before a digit is kept so
/// negative scores reach range validation instead of passing as positive.
fn extract_numbers(text: &str) -> Vec<f64> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        let starts_negative =
            ch == '-' && current.is_empty() && chars.peek().is_some_and(char::is_ascii_digit);
        let continues = ch.is_ascii_digit()
            || starts_negative
            || (ch == '.' && !current.is_empty() && !current.contains('.'));
        if continues {
            current.push(ch);
        } else if !current.is_empty() {
            out.extend(current.parse::<f64>().ok());
            current.clear();
        }
    }
    out.extend(current.parse::<f64>().ok());
    out
}

fn parse_added_date(text: &str) -> Option<NaiveDate> {
    ADDED_DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text.trim(), fmt).ok())
}

/// "Accepted on 12 Sep", "Rejected on 3 Feb 2025", "Wait listed on 1 Mar", "Interview on ...".
fn parse_status(text: &str, added_date: NaiveDate) -> Status {
    let lower = text.trim().to_ascii_lowercase();
    let on = lower
        .split_once(" on ")
        .and_then(|(_, date)| parse_decision_date(date, added_date));
    if lower.starts_with("accepted") {
        Status::Accepted { on }
    } else if lower.starts_with("rejected") {
        Status::Rejected { on }
    } else if lower.starts_with("wait") {
        Status::WaitListed
    } else {
        Status::Other
    }
}

/// Decision dates usually omit the year. They take the added date's year and
/// step back a year when that would put the decision after the entry was added.
fn parse_decision_date(text: &str, added_date: NaiveDate) -> Option<NaiveDate> {
    let mut parts = text.split_whitespace();
    let day: u32 = parts.next()?.trim_end_matches(',').parse().ok()?;
    let month = month_number(parts.next()?)?;
    if let Some(year) = parts.next().and_then(|y| y.parse::<i32>().ok()) {
        return NaiveDate::from_ymd_opt(year, month, day);
    }
    let same_year = NaiveDate::from_ymd_opt(added_date.year(), month, day)?;
    if same_year > added_date {
        NaiveDate::from_ymd_opt(added_date.year() - 1, month, day)
    } else {
        Some(same_year)
    }
}

fn month_number(word: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    let word = word.trim_end_matches([',', '.']).to_ascii_lowercase();
    let prefix = word.get(..3)?;
    MONTHS
        .iter()
        .position(|m| *m == prefix)
        .and_then(|i| u32::try_from(i + 1).ok())
}
