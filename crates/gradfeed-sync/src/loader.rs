use std::sync::Arc;

use gradfeed_core::Dataset;
use gradfeed_storage::{ApplicantStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadResult {
    /// Newly inserted rows.
    pub loaded: usize,
    /// Existing rows whose stored values changed.
    pub updated: usize,
    /// Already-stored keys seen during the run plus re-submitted rows that were identical.
    pub skipped_duplicates: usize,
    /// Rows whose url belongs to another key.
    pub skipped_conflicts: usize,
    /// Rows whose url does not point at their own result key.
    pub skipped_invalid: usize,
    /// Numeric values dropped by range validation just before staging.
    pub downgraded: usize,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("upserting batch")]
    Store(#[from] StoreError),
}

/// Validates a dataset and upserts the valid records as one all-or-nothing
/// batch. Invalid records are counted and left out.
#[derive(Clone)]
pub struct Loader {
    store: Arc<dyn ApplicantStore>,
}

impl Loader {
    pub fn new(store: Arc<dyn ApplicantStore>) -> Self {
        Self { store }
    }

    pub async fn load(&self, dataset: &Dataset) -> Result<LoadResult, LoadError> {
        let mut batch = Vec::with_capacity(dataset.records.len());
        let mut downgraded = 0;
        let mut skipped_invalid = 0;
        for record in &dataset.records {
            if !record.url_matches_key() {
                warn!(key = %record.key, url = %record.url, "url does not match record key; skipping");
                skipped_invalid += 1;
                continue;
            }
            let mut record = record.clone();
            downgraded += record.sanitize();
            batch.push(record);
        }

        let counts = if batch.is_empty() {
            Default::default()
        } else {
            self.store.upsert_batch(&batch).await?
        };

        let result = LoadResult {
            loaded: counts.inserted,
            updated: counts.updated,
            skipped_duplicates: dataset.known_duplicates.len() + counts.unchanged,
            skipped_conflicts: counts.conflicts,
            skipped_invalid,
            downgraded,
        };
        info!(
            loaded = result.loaded,
            updated = result.updated,
            skipped_duplicates = result.skipped_duplicates,
            skipped_conflicts = result.skipped_conflicts,
            skipped_invalid = result.skipped_invalid,
            "batch loaded"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use gradfeed_core::{Degree, Origin, RecordKey, Status, StructuredRecord};
    use gradfeed_storage::MemoryApplicantStore;

    fn record(key: i64) -> StructuredRecord {
        StructuredRecord {
            key: RecordKey(key),
            url: RecordKey(key).canonical_url(),
            program: "Statistics".into(),
            university: "University of Michigan".into(),
            comments: None,
            added_date: NaiveDate::from_ymd_opt(2025, 9, 13).unwrap(),
            status: Status::WaitListed,
            term: None,
            origin: Origin::American,
            degree: Degree::Masters,
            gpa: None,
            gre: None,
            gre_verbal: None,
            gre_aw: None,
        }
    }

    #[tokio::test]
    async fn reports_duplicates_from_the_run_and_identical_rows() {
        let store = Arc::new(MemoryApplicantStore::with_records([record(1), record(2)]));
        let loader = Loader::new(store.clone());
        let mut dataset = Dataset::from_records(vec![record(2), record(3)]);
        dataset.known_duplicates.insert(RecordKey(1));

        let result = loader.load(&dataset).await.unwrap();

        assert_eq!(result.loaded, 1);
        assert_eq!(result.skipped_duplicates, 2);
        assert_eq!(store.records().await.len(), 3);
    }

    #[tokio::test]
    async fn rerunning_the_same_dataset_is_idempotent() {
        let store = Arc::new(MemoryApplicantStore::new());
        let loader = Loader::new(store.clone());
        let dataset = Dataset::from_records(vec![record(1), record(2)]);

        let first = loader.load(&dataset).await.unwrap();
        let after_first = store.records().await;
        let second = loader.load(&dataset).await.unwrap();

        assert_eq!(first.loaded, 2);
        assert_eq!(second.loaded, 0);
        assert_eq!(second.skipped_duplicates, 2);
        assert_eq!(store.records().await, after_first);
    }

    #[tokio::test]
    async fn out_of_range_values_are_dropped_before_staging() {
        let store = Arc::new(MemoryApplicantStore::new());
        let mut bad = record(4);
        bad.gpa = Some(12.0);
        bad.gre_verbal = Some(100.0);

        let result = Loader::new(store.clone())
            .load(&Dataset::from_records(vec![bad]))
            .await
            .unwrap();

        assert_eq!(result.downgraded, 2);
        let stored = store.records().await;
        assert_eq!((stored[0].gpa, stored[0].gre_verbal), (None, None));
    }

    #[tokio::test]
    async fn url_not_matching_key_skips_only_that_record() {
        let store = Arc::new(MemoryApplicantStore::new());
        let mut foreign = record(5);
        foreign.url = "https://www.thegradcafe.com/result/6".into();
        let mut wrong_host = record(2);
        wrong_host.url = "http://thegradcafe.com/result/2".into();

        let result = Loader::new(store.clone())
            .load(&Dataset::from_records(vec![record(1), foreign, wrong_host, record(3)]))
            .await
            .unwrap();

        assert_eq!(result.loaded, 2);
        assert_eq!(result.skipped_invalid, 2);
        let keys = store.existing_keys().await.unwrap();
        assert_eq!(keys, [RecordKey(1), RecordKey(3)].into_iter().collect());
    }

    #[tokio::test]
    async fn failure_mid_batch_commits_nothing() {
        let store = Arc::new(MemoryApplicantStore::with_records([record(1)]));
        store.fail_next_batch_after(2);
        let dataset = Dataset::from_records((10..14).map(record).collect());

        let err = Loader::new(store.clone()).load(&dataset).await.unwrap_err();

        assert!(matches!(err, LoadError::Store(StoreError::InjectedFailure { staged: 2 })));
        assert_eq!(store.records().await, vec![record(1)]);
    }
}
