//! The `applicants` relational store.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use gradfeed_core::{RecordKey, StructuredRecord};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const CREATE_APPLICANTS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS applicants (
    p_id                SERIAL PRIMARY KEY,
    record_key          BIGINT NOT NULL UNIQUE,
    url                 TEXT NOT NULL UNIQUE,
    program             TEXT NOT NULL,
    university          TEXT NOT NULL,
    comments            TEXT,
    added_date          DATE NOT NULL,
    status              TEXT NOT NULL,
    decision_date       DATE,
    term                TEXT,
    us_or_international TEXT NOT NULL,
    degree              TEXT NOT NULL,
    gpa                 DOUBLE PRECISION,
    gre                 DOUBLE PRECISION,
    gre_v               DOUBLE PRECISION,
    gre_aw              DOUBLE PRECISION,
    loaded_at           TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const UPSERT_APPLICANT_SQL: &str = r#"
INSERT INTO applicants (
    record_key, url, program, university, comments, added_date, status,
    decision_date, term, us_or_international, degree, gpa, gre, gre_v, gre_aw
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
ON CONFLICT (record_key) DO UPDATE SET
    url = EXCLUDED.url,
    program = EXCLUDED.program,
    university = EXCLUDED.university,
    comments = EXCLUDED.comments,
    added_date = EXCLUDED.added_date,
    status = EXCLUDED.status,
    decision_date = EXCLUDED.decision_date,
    term = EXCLUDED.term,
    us_or_international = EXCLUDED.us_or_international,
    degree = EXCLUDED.degree,
    gpa = EXCLUDED.gpa,
    gre = EXCLUDED.gre,
    gre_v = EXCLUDED.gre_v,
    gre_aw = EXCLUDED.gre_aw,
    loaded_at = NOW()
WHERE (applicants.url, applicants.program, applicants.university, applicants.comments,
       applicants.added_date, applicants.status, applicants.decision_date, applicants.term,
       applicants.us_or_international, applicants.degree, applicants.gpa, applicants.gre,
       applicants.gre_v, applicants.gre_aw)
   IS DISTINCT FROM
      (EXCLUDED.url, EXCLUDED.program, EXCLUDED.university, EXCLUDED.comments,
       EXCLUDED.added_date, EXCLUDED.status, EXCLUDED.decision_date, EXCLUDED.term,
       EXCLUDED.us_or_international, EXCLUDED.degree, EXCLUDED.gpa, EXCLUDED.gre,
       EXCLUDED.gre_v, EXCLUDED.gre_aw)
RETURNING (xmax = 0) AS inserted
"#;

const SUMMARY_SQL: &str = r#"
SELECT COUNT(*)                                                        AS total,
       COUNT(*) FILTER (WHERE status = 'Accepted')                     AS accepted,
       COUNT(*) FILTER (WHERE status = 'Rejected')                     AS rejected,
       COUNT(*) FILTER (WHERE status = 'Wait-listed')                  AS wait_listed,
       COUNT(*) FILTER (WHERE us_or_international = 'International')  AS international,
       COUNT(*) FILTER (WHERE us_or_international = 'American')       AS american,
       AVG(gpa)                                                        AS avg_gpa,
       AVG(gre)                                                        AS avg_gre,
       AVG(gre_v)                                                      AS avg_gre_verbal,
       AVG(gre_aw)                                                     AS avg_gre_aw
  FROM applicants
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("injected failure after {staged} staged records")]
    InjectedFailure { staged: usize },
}

/// Per-batch outcome of an upsert. The four counts sum to the batch length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertCounts {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Records skipped because their url already belongs to another key.
    pub conflicts: usize,
}

/// Headline numbers for the read path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSummary {
    pub total: i64,
    pub accepted: i64,
    pub rejected: i64,
    pub wait_listed: i64,
    pub international: i64,
    pub american: i64,
    pub avg_gpa: Option<f64>,
    pub avg_gre: Option<f64>,
    pub avg_gre_verbal: Option<f64>,
    pub avg_gre_aw: Option<f64>,
}

impl StoreSummary {
    pub fn acceptance_percent(&self) -> Option<f64> {
        (self.total > 0).then(|| self.accepted as f64 * 100.0 / self.total as f64)
    }

    pub fn international_percent(&self) -> Option<f64> {
        (self.total > 0).then(|| self.international as f64 * 100.0 / self.total as f64)
    }
}

#[async_trait]
pub trait ApplicantStore: Send + Sync {
    async fn existing_keys(&self) -> Result<BTreeSet<RecordKey>, StoreError>;

    /// Upserts the whole batch atomically: on error nothing is committed.
    async fn upsert_batch(&self, records: &[StructuredRecord]) -> Result<UpsertCounts, StoreError>;

    async fn summary(&self) -> Result<StoreSummary, StoreError>;

    async fn create_schema(&self) -> Result<(), StoreError>;

    async fn drop_schema(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgApplicantStore {
    pool: PgPool,
}

impl PgApplicantStore {
    /// Builds a pool that connects on first use, so a down database only
    /// fails the operations that need it.
    pub fn connect_lazy(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ApplicantStore for PgApplicantStore {
    async fn existing_keys(&self) -> Result<BTreeSet<RecordKey>, StoreError> {
        let rows = sqlx::query("SELECT record_key FROM applicants")
            .fetch_all(&self.pool)
            .await?;
        let mut keys = BTreeSet::new();
        for row in rows {
            keys.insert(RecordKey(row.try_get::<i64, _>("record_key")?));
        }
        Ok(keys)
    }

    async fn upsert_batch(&self, records: &[StructuredRecord]) -> Result<UpsertCounts, StoreError> {
        let mut counts = UpsertCounts::default();
        let mut tx = self.pool.begin().await?;

        for record in records {
            let owner: Option<i64> =
                sqlx::query_scalar("SELECT record_key FROM applicants WHERE url = $1")
                    .bind(&record.url)
                    .fetch_optional(&mut *tx)
                    .await?;
            if matches!(owner, Some(owner) if owner != record.key.0) {
                warn!(key = %record.key, url = %record.url, "url already stored under another key; skipping");
                counts.conflicts += 1;
                continue;
            }

            let returned = sqlx::query(UPSERT_APPLICANT_SQL)
                .bind(record.key.0)
                .bind(&record.url)
                .bind(&record.program)
                .bind(&record.university)
                .bind(record.comments.as_deref())
                .bind(record.added_date)
                .bind(record.status.label())
                .bind(record.status.decision_date())
                .bind(record.term.map(|t| t.to_string()))
                .bind(record.origin.as_str())
                .bind(record.degree.as_str())
                .bind(record.gpa)
                .bind(record.gre)
                .bind(record.gre_verbal)
                .bind(record.gre_aw)
                .fetch_optional(&mut *tx)
                .await?;

            match returned {
                Some(row) if row.try_get::<bool, _>("inserted")? => counts.inserted += 1,
                Some(_) => counts.updated += 1,
                None => counts.unchanged += 1,
            }
        }

        tx.commit().await?;
        debug!(?counts, "applicant batch committed");
        Ok(counts)
    }

    async fn summary(&self) -> Result<StoreSummary, StoreError> {
        let row = sqlx::query(SUMMARY_SQL).fetch_one(&self.pool).await?;
        Ok(StoreSummary {
            total: row.try_get("total")?,
            accepted: row.try_get("accepted")?,
            rejected: row.try_get("rejected")?,
            wait_listed: row.try_get("wait_listed")?,
            international: row.try_get("international")?,
            american: row.try_get("american")?,
            avg_gpa: row.try_get("avg_gpa")?,
            avg_gre: row.try_get("avg_gre")?,
            avg_gre_verbal: row.try_get("avg_gre_verbal")?,
            avg_gre_aw: row.try_get("avg_gre_aw")?,
        })
    }

    async fn create_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_APPLICANTS_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn drop_schema(&self) -> Result<(), StoreError> {
        sqlx::query("DROP TABLE IF EXISTS applicants")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Process-local store with the same batch semantics as Postgres: a batch is
/// applied to a staged copy and swapped in only when every record succeeded.
#[derive(Debug, Default)]
pub struct MemoryApplicantStore {
    rows: RwLock<BTreeMap<RecordKey, StructuredRecord>>,
    fail_after_staged: std::sync::Mutex<Option<usize>>,
}

impl MemoryApplicantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = StructuredRecord>) -> Self {
        let rows = records.into_iter().map(|r| (r.key, r)).collect();
        Self {
            rows: RwLock::new(rows),
            fail_after_staged: std::sync::Mutex::new(None),
        }
    }

    /// Makes the next batch fail once `staged` of its records have been staged.
    pub fn fail_next_batch_after(&self, staged: usize) {
        *self
            .fail_after_staged
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(staged);
    }

    pub async fn records(&self) -> Vec<StructuredRecord> {
        self.rows.read().await.values().cloned().collect()
    }

    fn take_injected_failure(&self) -> Option<usize> {
        self.fail_after_staged
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }
}

#[async_trait]
impl ApplicantStore for MemoryApplicantStore {
    async fn existing_keys(&self) -> Result<BTreeSet<RecordKey>, StoreError> {
        Ok(self.rows.read().await.keys().copied().collect())
    }

    async fn upsert_batch(&self, records: &[StructuredRecord]) -> Result<UpsertCounts, StoreError> {
        let mut rows = self.rows.write().await;
        let mut staged = rows.clone();
        let mut counts = UpsertCounts::default();
        let fail_after = self.take_injected_failure();

        for (index, record) in records.iter().enumerate() {
            if fail_after == Some(index) {
                return Err(StoreError::InjectedFailure { staged: index });
            }
            let url_owner = staged
                .values()
                .find(|r| r.url == record.url)
                .map(|r| r.key);
            if matches!(url_owner, Some(owner) if owner != record.key) {
                counts.conflicts += 1;
                continue;
            }
            match staged.get(&record.key) {
                None => counts.inserted += 1,
                Some(existing) if existing == record => {
                    counts.unchanged += 1;
                    continue;
                }
                Some(_) => counts.updated += 1,
            }
            staged.insert(record.key, record.clone());
        }

        *rows = staged;
        Ok(counts)
    }

    async fn summary(&self) -> Result<StoreSummary, StoreError> {
        let rows = self.rows.read().await;
        let mut summary = StoreSummary {
            total: rows.len() as i64,
            ..StoreSummary::default()
        };
        for record in rows.values() {
            match record.status.label() {
                "Accepted" => summary.accepted += 1,
                "Rejected" => summary.rejected += 1,
                "Wait-listed" => summary.wait_listed += 1,
                _ => {}
            }
            match record.origin {
                gradfeed_core::Origin::International => summary.international += 1,
                gradfeed_core::Origin::American => summary.american += 1,
                gradfeed_core::Origin::Unknown => {}
            }
        }
        summary.avg_gpa = average(rows.values().filter_map(|r| r.gpa));
        summary.avg_gre = average(rows.values().filter_map(|r| r.gre));
        summary.avg_gre_verbal = average(rows.values().filter_map(|r| r.gre_verbal));
        summary.avg_gre_aw = average(rows.values().filter_map(|r| r.gre_aw));
        Ok(summary)
    }

    async fn create_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn drop_schema(&self) -> Result<(), StoreError> {
        self.rows.write().await.clear();
        Ok(())
    }
}

fn average(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use gradfeed_core::{Degree, Origin, Status};

    fn record(key: i64) -> StructuredRecord {
        StructuredRecord {
            key: RecordKey(key),
            url: RecordKey(key).canonical_url(),
            program: "Computer Science".into(),
            university: "Georgetown University".into(),
            comments: None,
            added_date: NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
            status: Status::Accepted { on: None },
            term: None,
            origin: Origin::International,
            degree: Degree::PhD,
            gpa: Some(3.5),
            gre: None,
            gre_verbal: None,
            gre_aw: None,
        }
    }

    #[tokio::test]
    async fn upsert_counts_inserts_updates_and_unchanged() {
        let store = MemoryApplicantStore::with_records([record(1), record(2)]);
        let mut changed = record(2);
        changed.program = "Statistics".into();

        let counts = store
            .upsert_batch(&[record(1), changed, record(3)])
            .await
            .unwrap();

        assert_eq!(
            counts,
            UpsertCounts {
                inserted: 1,
                updated: 1,
                unchanged: 1,
                conflicts: 0
            }
        );
        let keys = store.existing_keys().await.unwrap();
        assert_eq!(keys, BTreeSet::from([RecordKey(1), RecordKey(2), RecordKey(3)]));
    }

    #[tokio::test]
    async fn url_owned_by_another_key_is_skipped() {
        let store = MemoryApplicantStore::with_records([record(1)]);
        let mut clash = record(9);
        clash.url = record(1).url;

        let counts = store.upsert_batch(&[clash]).await.unwrap();

        assert_eq!(counts.conflicts, 1);
        assert!(!store.existing_keys().await.unwrap().contains(&RecordKey(9)));
    }

    #[tokio::test]
    async fn injected_failure_leaves_store_untouched_for_every_prefix() {
        let batch: Vec<_> = (10..15).map(record).collect();
        for staged in 0..batch.len() {
            let store = MemoryApplicantStore::with_records([record(1)]);
            store.fail_next_batch_after(staged);

            let err = store.upsert_batch(&batch).await.unwrap_err();

            assert!(matches!(err, StoreError::InjectedFailure { staged: s } if s == staged));
            assert_eq!(store.records().await, vec![record(1)]);
        }
    }

    #[tokio::test]
    async fn summary_counts_statuses_origins_and_averages() {
        let mut rejected = record(2);
        rejected.status = Status::Rejected { on: None };
        rejected.origin = Origin::American;
        rejected.gpa = Some(3.9);
        let store = MemoryApplicantStore::with_records([record(1), rejected]);

        let summary = store.summary().await.unwrap();

        assert_eq!(summary.total, 2);
        assert_eq!(summary.accepted, 1);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.international, 1);
        assert_eq!(summary.american, 1);
        assert!((summary.avg_gpa.unwrap() - 3.7).abs() < 1e-9);
        assert_eq!(summary.avg_gre, None);
        assert_eq!(summary.acceptance_percent(), Some(50.0));
    }

    async fn clear_range(store: &PgApplicantStore, base: i64) {
        sqlx::query("DELETE FROM applicants WHERE record_key BETWEEN $1 AND $2")
            .bind(base)
            .bind(base + 99)
            .execute(store.pool())
            .await
            .unwrap();
    }

    /// Runs against a real database only when `DATABASE_URL` is set. Touches
    /// nothing outside its own key range.
    #[tokio::test]
    async fn postgres_upsert_splits_counts_and_rolls_back() {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            eprintln!("DATABASE_URL not set; skipping postgres upsert test");
            return;
        };
        const BASE: i64 = 9_100_000_000;
        let store = PgApplicantStore::connect_lazy(&url, 2).unwrap();
        store.create_schema().await.unwrap();
        clear_range(&store, BASE).await;

        let first = store
            .upsert_batch(&[record(BASE + 1), record(BASE + 2)])
            .await
            .unwrap();
        assert_eq!(first.inserted, 2);

        let mut changed = record(BASE + 2);
        changed.gpa = Some(3.1);
        let mut clash = record(BASE + 3);
        clash.url = record(BASE + 1).url;
        let second = store
            .upsert_batch(&[record(BASE + 1), changed, clash, record(BASE + 4)])
            .await
            .unwrap();
        assert_eq!(
            second,
            UpsertCounts {
                inserted: 1,
                updated: 1,
                unchanged: 1,
                conflicts: 1
            }
        );

        // Postgres rejects NUL in text, failing the batch after one staged row.
        let mut broken = record(BASE + 6);
        broken.university = "bad\0name".into();
        assert!(store
            .upsert_batch(&[record(BASE + 5), broken])
            .await
            .is_err());
        let keys = store.existing_keys().await.unwrap();
        assert!(!keys.contains(&RecordKey(BASE + 5)));
        assert!(!keys.contains(&RecordKey(BASE + 3)));
        assert!(keys.contains(&RecordKey(BASE + 4)));

        clear_range(&store, BASE).await;
    }
}
