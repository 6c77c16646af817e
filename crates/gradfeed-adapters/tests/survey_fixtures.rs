use std::collections::BTreeSet;
use std::path::PathBuf;

use gradfeed_adapters::{
    ExtractionError, FixtureListingSource, ListingParser, ListingSource, SurveyParser,
};
use gradfeed_core::{Origin, RecordKey, Status};
use uuid::Uuid;

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/survey")
        .canonicalize()
        .expect("fixtures dir")
}

#[tokio::test]
async fn fixture_pages_replay_and_run_out() {
    let source = FixtureListingSource::new(fixtures_dir());
    let run_id = Uuid::new_v4();

    let first = source.fetch_page(run_id, 1).await.unwrap();
    let past_end = source.fetch_page(run_id, 3).await.unwrap();

    assert_eq!(first.page, 1);
    assert!(first.markup.contains("Johns Hopkins University"));
    assert_eq!(past_end.page, 3);
    assert!(past_end.markup.is_empty());
}

#[tokio::test]
async fn page_one_extracts_every_entry() {
    let source = FixtureListingSource::new(fixtures_dir());
    let parser = SurveyParser::new().unwrap();
    let page = source.fetch_page(Uuid::new_v4(), 1).await.unwrap();

    assert_eq!(
        parser.scan_keys(&page.markup),
        BTreeSet::from([RecordKey(986540), RecordKey(986542), RecordKey(986543)])
    );

    let records: Vec<_> = parser
        .split_fragments(&page.markup)
        .iter()
        .map(|fragment| parser.extract(fragment).unwrap().record)
        .collect();

    assert_eq!(records.len(), 3);
    assert_eq!(records[0].comments.as_deref(), Some("Got the call from the PI on a Friday afternoon."));
    assert_eq!(records[1].origin, Origin::American);
    assert!(matches!(records[1].status, Status::Rejected { on: Some(_) }));
    assert_eq!(records[2].status, Status::WaitListed);
    assert_eq!(records[2].comments.as_deref(), Some("Still hoping."));
    assert_eq!(records[2].term, None);
}

#[tokio::test]
async fn page_two_has_one_bad_entry_and_one_downgraded_gpa() {
    let source = FixtureListingSource::new(fixtures_dir());
    let parser = SurveyParser::new().unwrap();
    let page = source.fetch_page(Uuid::new_v4(), 2).await.unwrap();

    let results: Vec<_> = parser
        .split_fragments(&page.markup)
        .iter()
        .map(|fragment| parser.extract(fragment))
        .collect();

    assert_eq!(results.len(), 2);
    let good = results[0].as_ref().unwrap();
    assert_eq!(good.record.status, Status::Other);
    assert_eq!(good.record.gpa, None);
    assert_eq!(good.downgraded, 1);
    assert_eq!(
        results[1].as_ref().unwrap_err(),
        &ExtractionError::MissingField("university")
    );
}
