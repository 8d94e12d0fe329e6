//! Cruncher integration tests over in-memory stores.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use tokio::sync::mpsc;

use reader::cruncher::{CrunchEvent, Cruncher};
use reader::storage::{
    CrawledRecord, MemoryObjectStore, MemoryRecordStore, ObjectStore, snapshot_object_name,
};
use reader::{CrunchConfig, Formatter, Snapshot};

/// Seed `count` records on the given day with stored snapshot blobs
async fn seed_day(
    objects: &MemoryObjectStore,
    day: chrono::DateTime<Utc>,
    count: usize,
) -> Vec<CrawledRecord> {
    let mut records = Vec::with_capacity(count);
    for i in 0..count {
        let id = format!("rec-{i:05}");
        let snapshot = Snapshot {
            href: format!("https://example.com/p/{i}"),
            title: format!("Page {i}"),
            content: format!("<p>body {i}</p>"),
            text_content: format!("body {i}"),
            html: format!("<html><body><p>body {i}</p></body></html>"),
            published_time: None,
        };
        let path = snapshot_object_name(&id);
        objects
            .put(
                &path,
                serde_json::to_vec(&snapshot).unwrap(),
                "application/json",
            )
            .await
            .unwrap();
        records.push(CrawledRecord {
            id,
            created_at: day + Duration::seconds(i as i64),
            snapshot_path: path,
        });
    }
    records
}

fn config() -> CrunchConfig {
    CrunchConfig {
        prefix: "crunched".into(),
        rev: 2,
        t_minus_days: 1,
        batch_size: 10_000,
        max_inflight: 100,
    }
}

fn line_count(bytes: &[u8]) -> usize {
    bytes.split(|b| *b == b'\n').filter(|l| !l.is_empty()).count()
}

#[tokio::test]
async fn day_with_24999_records_yields_three_offset_files() {
    let objects = Arc::new(MemoryObjectStore::new());
    let day = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    let records = seed_day(&objects, day, 24_999).await;
    let store = Arc::new(MemoryRecordStore::new(records));
    let formatter = Arc::new(Formatter::new(Arc::clone(&objects) as Arc<dyn ObjectStore>));

    let cruncher = Cruncher::new(
        store,
        Arc::clone(&objects) as Arc<dyn ObjectStore>,
        formatter,
        config(),
    );

    let now = Utc.with_ymd_and_hms(2024, 3, 2, 2, 0, 0).unwrap();
    let (tx, mut rx) = mpsc::channel(64);
    let report = cruncher.crunch(now, Some(tx)).await.unwrap();

    assert_eq!(report.files_uploaded, 3);
    assert_eq!(report.records_archived, 24_999);

    let first = objects.get("crunched/r2/2024-03-01-00000.jsonl").await.unwrap();
    let second = objects.get("crunched/r2/2024-03-01-10000.jsonl").await.unwrap();
    let third = objects.get("crunched/r2/2024-03-01-20000.jsonl").await.unwrap();
    assert_eq!(line_count(&first), 10_000);
    assert_eq!(line_count(&second), 10_000);
    assert_eq!(line_count(&third), 4_999);

    // Every line is a {url, html, content} object.
    let line: serde_json::Value =
        serde_json::from_slice(first.split(|b| *b == b'\n').next().unwrap()).unwrap();
    assert!(line["url"].as_str().unwrap().starts_with("https://example.com/p/"));
    assert!(line["html"].as_str().unwrap().contains("<html>"));
    assert!(line["content"].as_str().unwrap().contains("body"));

    // Progress: start sentinel, one frame per file, end sentinel.
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert_eq!(events.first(), Some(&CrunchEvent::Started));
    assert_eq!(events.last(), Some(&CrunchEvent::Finished { files: 3 }));
    let files: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            CrunchEvent::File { name } => Some(name.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        files,
        vec![
            "crunched/r2/2024-03-01-00000.jsonl",
            "crunched/r2/2024-03-01-10000.jsonl",
            "crunched/r2/2024-03-01-20000.jsonl",
        ]
    );
}

#[tokio::test]
async fn second_run_uploads_nothing() {
    let objects = Arc::new(MemoryObjectStore::new());
    let day = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    let records = seed_day(&objects, day, 12_500).await;
    let store = Arc::new(MemoryRecordStore::new(records));
    let formatter = Arc::new(Formatter::new(Arc::clone(&objects) as Arc<dyn ObjectStore>));

    let cruncher = Cruncher::new(
        store,
        Arc::clone(&objects) as Arc<dyn ObjectStore>,
        formatter,
        config(),
    );
    let now = Utc.with_ymd_and_hms(2024, 3, 2, 2, 0, 0).unwrap();

    let first = cruncher.crunch(now, None).await.unwrap();
    assert_eq!(first.files_uploaded, 2);
    let objects_after_first = {
        let mut names = objects.object_names();
        names.sort();
        names
    };

    let second = cruncher.crunch(now, None).await.unwrap();
    assert_eq!(second.files_uploaded, 0);
    assert_eq!(second.records_archived, 0);
    let objects_after_second = {
        let mut names = objects.object_names();
        names.sort();
        names
    };
    assert_eq!(objects_after_first, objects_after_second);
}

#[tokio::test]
async fn unparseable_snapshots_are_skipped_not_fatal() {
    let objects = Arc::new(MemoryObjectStore::new());
    let day = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    let mut records = seed_day(&objects, day, 10).await;

    // One record whose blob is garbage, one whose blob is missing.
    objects
        .put("snapshots/broken", b"not json at all".to_vec(), "application/json")
        .await
        .unwrap();
    records.push(CrawledRecord {
        id: "broken".into(),
        created_at: day + Duration::seconds(100),
        snapshot_path: "snapshots/broken".into(),
    });
    records.push(CrawledRecord {
        id: "missing".into(),
        created_at: day + Duration::seconds(101),
        snapshot_path: "snapshots/missing".into(),
    });

    let store = Arc::new(MemoryRecordStore::new(records));
    let formatter = Arc::new(Formatter::new(Arc::clone(&objects) as Arc<dyn ObjectStore>));
    let cruncher = Cruncher::new(
        store,
        Arc::clone(&objects) as Arc<dyn ObjectStore>,
        formatter,
        config(),
    );

    let now = Utc.with_ymd_and_hms(2024, 3, 2, 2, 0, 0).unwrap();
    let report = cruncher.crunch(now, None).await.unwrap();
    assert_eq!(report.files_uploaded, 1);
    assert_eq!(report.records_archived, 10);
}

#[tokio::test]
async fn window_excludes_today() {
    let objects = Arc::new(MemoryObjectStore::new());
    let today = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();
    // Records created today must not be archived yet.
    let records = seed_day(&objects, today, 5).await;
    let store = Arc::new(MemoryRecordStore::new(records));
    let formatter = Arc::new(Formatter::new(Arc::clone(&objects) as Arc<dyn ObjectStore>));
    let cruncher = Cruncher::new(
        store,
        Arc::clone(&objects) as Arc<dyn ObjectStore>,
        formatter,
        config(),
    );

    let now = Utc.with_ymd_and_hms(2024, 3, 2, 12, 0, 0).unwrap();
    let report = cruncher.crunch(now, None).await.unwrap();
    assert_eq!(report.files_uploaded, 0);
}
