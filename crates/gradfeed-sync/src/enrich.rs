//! Program/university name enrichment over a whole run's batch.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use gradfeed_core::{NamePair, StructuredRecord};
use gradfeed_storage::HttpFetcher;
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_FUZZY_THRESHOLD: f64 = 0.95;

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("enrichment service unavailable: {0}")]
    Unavailable(String),
    #[error("enricher returned {got} name pairs for {expected} records")]
    LengthMismatch { expected: usize, got: usize },
}

/// Rewrites (program, university) pairs. Output is positionally aligned with input.
#[async_trait]
pub trait Enricher: Send + Sync {
    fn name(&self) -> &'static str;

    async fn normalize(&self, names: &[NamePair]) -> Result<Vec<NamePair>, EnrichError>;
}

/// Runs `enricher` over `records`. Only program and university can change.
/// On any failure the records are left as they were and `false` is returned.
pub async fn enrich_records(enricher: &dyn Enricher, records: &mut [StructuredRecord]) -> bool {
    if records.is_empty() {
        return true;
    }
    let names: Vec<NamePair> = records.iter().map(StructuredRecord::names).collect();
    let result = enricher.normalize(&names).await.and_then(|out| {
        if out.len() == names.len() {
            Ok(out)
        } else {
            Err(EnrichError::LengthMismatch {
                expected: names.len(),
                got: out.len(),
            })
        }
    });

    match result {
        Ok(normalized) => {
            let changed = names
                .iter()
                .zip(&normalized)
                .filter(|(before, after)| before != after)
                .count();
            for (record, pair) in records.iter_mut().zip(normalized) {
                record.apply_names(pair);
            }
            info!(enricher = enricher.name(), records = records.len(), changed, "enrichment applied");
            true
        }
        Err(err) => {
            warn!(enricher = enricher.name(), error = %err, "enrichment unavailable; keeping names as scraped");
            false
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEnricher;

#[async_trait]
impl Enricher for NoopEnricher {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn normalize(&self, names: &[NamePair]) -> Result<Vec<NamePair>, EnrichError> {
        Ok(names.to_vec())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NameRows {
    rows: Vec<NamePair>,
}

/// Delegates to an external normalization service speaking `{"rows": [...]}`.
#[derive(Debug)]
pub struct RemoteEnricher {
    url: String,
    http: HttpFetcher,
}

impl RemoteEnricher {
    pub fn new(url: impl Into<String>, http: HttpFetcher) -> Self {
        Self {
            url: url.into(),
            http,
        }
    }
}

#[async_trait]
impl Enricher for RemoteEnricher {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn normalize(&self, names: &[NamePair]) -> Result<Vec<NamePair>, EnrichError> {
        let request = NameRows {
            rows: names.to_vec(),
        };
        let response: NameRows = self
            .http
            .post_json(&self.url, &request)
            .await
            .map_err(|e| EnrichError::Unavailable(e.to_string()))?;
        Ok(response.rows)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct NameRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default = "default_threshold")]
    fuzzy_threshold: f64,
    #[serde(default)]
    universities: Vec<CanonicalName>,
    #[serde(default)]
    programs: Vec<CanonicalName>,
}

fn default_threshold() -> f64 {
    DEFAULT_FUZZY_THRESHOLD
}

#[derive(Debug, Clone, Deserialize)]
pub struct CanonicalName {
    pub canonical: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Lowercased alphanumeric words, used as the comparison key for names.
pub fn normalize_key_fragment(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Default)]
struct NameTable {
    exact: HashMap<String, String>,
    threshold: f64,
}

impl NameTable {
    fn new(entries: &[CanonicalName], threshold: f64) -> Self {
        let mut exact = HashMap::new();
        for entry in entries {
            for alias in &entry.aliases {
                exact.insert(normalize_key_fragment(alias), entry.canonical.clone());
            }
        }
        // Canonical spellings win over any alias that collides with them.
        for entry in entries {
            exact.insert(normalize_key_fragment(&entry.canonical), entry.canonical.clone());
        }
        Self { exact, threshold }
    }

    fn resolve(&self, raw: &str) -> Option<String> {
        let key = normalize_key_fragment(raw);
        if let Some(canonical) = self.exact.get(&key) {
            return Some(canonical.clone());
        }
        self.exact
            .iter()
            .map(|(known, canonical)| (jaro_winkler(&key, known), known, canonical))
            .filter(|(score, _, _)| *score >= self.threshold)
            .max_by(|a, b| a.0.total_cmp(&b.0).then_with(|| b.1.cmp(a.1)))
            .map(|(_, _, canonical)| canonical.clone())
    }

    /// Resolves every value against the table; values the table does not know
    /// are merged with same-key spellings in the batch, picking the most common.
    fn normalize_column(&self, values: Vec<String>) -> Vec<String> {
        let resolved: Vec<Option<String>> = values.iter().map(|v| self.resolve(v)).collect();

        let mut spellings: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
        for (value, hit) in values.iter().zip(&resolved) {
            if hit.is_none() {
                *spellings
                    .entry(normalize_key_fragment(value))
                    .or_default()
                    .entry(value.trim().to_string())
                    .or_default() += 1;
            }
        }
        let chosen: BTreeMap<String, String> = spellings
            .into_iter()
            .filter_map(|(key, counts)| {
                counts
                    .into_iter()
                    .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
                    .map(|(spelling, _)| (key, spelling))
            })
            .collect();

        values
            .into_iter()
            .zip(resolved)
            .map(|(value, hit)| match hit {
                Some(canonical) => canonical,
                None => chosen
                    .get(&normalize_key_fragment(&value))
                    .cloned()
                    .unwrap_or(value),
            })
            .collect()
    }
}

/// Rule-driven name normalizer loaded from `rules/names.yaml`.
#[derive(Debug, Clone, Default)]
pub struct NameNormalizer {
    universities: NameTable,
    programs: NameTable,
}

impl NameNormalizer {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let rules: NameRulesFile = serde_yaml::from_str(yaml).context("parsing name rules")?;
        Ok(Self {
            universities: NameTable::new(&rules.universities, rules.fuzzy_threshold),
            programs: NameTable::new(&rules.programs, rules.fuzzy_threshold),
        })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&yaml).with_context(|| format!("loading {}", path.display()))
    }

    pub fn normalize_pairs(&self, names: &[NamePair]) -> Vec<NamePair> {
        let programs = self
            .programs
            .normalize_column(names.iter().map(|n| n.program.clone()).collect());
        let universities = self
            .universities
            .normalize_column(names.iter().map(|n| n.university.clone()).collect());
        programs
            .into_iter()
            .zip(universities)
            .map(|(program, university)| NamePair {
                program,
                university,
            })
            .collect()
    }
}

#[async_trait]
impl Enricher for NameNormalizer {
    fn name(&self) -> &'static str {
        "name-rules"
    }

    async fn normalize(&self, names: &[NamePair]) -> Result<Vec<NamePair>, EnrichError> {
        Ok(self.normalize_pairs(names))
    }
}
