mod common;

use common::FakePage;
use driftguard_common::{DriftError, ForensicsSettings, ResolutionStage};
use driftguard_engine::ForensicRecorder;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

fn settings(root: &Path, max: usize) -> ForensicsSettings {
    ForensicsSettings {
        enabled: true,
        root_dir: root.to_path_buf(),
        max_incidents_per_tenant: max,
        max_dom_chars: 500_000,
        recent_buffer: 50,
    }
}

fn not_resolved(path: &str) -> DriftError {
    DriftError::ElementNotResolved {
        path: path.to_string(),
        tried: vec!["#email".into(), "input[type=email]".into()],
        stage: ResolutionStage::Css,
        action: Some("fill".into()),
    }
}

fn tried() -> Vec<String> {
    vec!["#email".into(), "input[type=email]".into()]
}

#[tokio::test]
async fn capture_writes_three_artifacts_with_digests() {
    common::init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let recorder = ForensicRecorder::open(&settings(dir.path(), 10), "es")
        .await
        .unwrap();
    let page = FakePage::new(&[]);
    let mut context = BTreeMap::new();
    context.insert("workflow".to_string(), "appointment-search".to_string());

    let incident = recorder
        .capture(&page, &not_resolved("login.email"), &context, &tried())
        .await;

    assert!(incident.capture_errors.is_empty(), "{:?}", incident.capture_errors);
    assert_eq!(incident.tenant, "es");
    assert_eq!(incident.error_kind, "element_not_resolved");
    assert_eq!(incident.path.as_deref(), Some("login.email"));
    assert_eq!(incident.action.as_deref(), Some("fill"));
    assert_eq!(incident.stage, Some(ResolutionStage::Css));
    assert_eq!(incident.tried_selectors, tried());
    assert_eq!(incident.context.get("workflow").map(String::as_str), Some("appointment-search"));

    let date = incident.timestamp.format("%Y-%m-%d").to_string();
    let partition = dir.path().join("es").join(&date);
    let shot = incident.captures.screenshot.clone().unwrap();
    let dom = incident.captures.dom.clone().unwrap();
    let ctx = incident.captures.context.clone().unwrap();
    assert_eq!(shot.path, partition.join(format!("{}.png", incident.id)));
    assert_eq!(dom.path, partition.join(format!("{}.html", incident.id)));
    assert_eq!(ctx, partition.join(format!("{}.json", incident.id)));

    let png = std::fs::read(&shot.path).unwrap();
    assert_eq!(shot.blake3, blake3::hash(&png).to_hex().to_string());
    assert_eq!(shot.bytes, png.len() as u64);

    let doc: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&ctx).unwrap()).unwrap();
    assert_eq!(doc["page"]["url"], "https://vendor.example/login");
    assert_eq!(doc["page"]["title"], "Sign in");
    assert_eq!(doc["page"]["viewport"]["width"], 1440);
    assert_eq!(doc["page"]["cookies"][0]["name"], "session_id");
    assert_eq!(doc["page"]["cookies"][0]["value"], "***");
    assert_eq!(doc["page"]["local_storage"]["auth_token"], "***");
    assert_eq!(doc["page"]["session_storage"]["cart"], "***");
    assert!(doc["stack_trace"].as_str().is_some());
    assert_eq!(doc["incident"]["id"], incident.id.as_str());

    let report = recorder.verify(&incident.id).await.unwrap();
    assert!(report.is_intact());
}

#[tokio::test]
async fn failed_screenshot_does_not_block_other_artifacts() {
    common::init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let recorder = ForensicRecorder::open(&settings(dir.path(), 10), "es")
        .await
        .unwrap();
    let page = FakePage::new(&[]).with_failing_screenshot();

    let incident = recorder
        .capture(&page, &not_resolved("login.email"), &BTreeMap::new(), &tried())
        .await;

    assert!(incident.captures.screenshot.is_none());
    assert!(incident.captures.dom.is_some());
    assert!(incident.captures.context.is_some());
    assert_eq!(incident.capture_errors.len(), 1);
    assert!(incident.capture_errors[0].contains("screenshot"));
    assert_eq!(recorder.status().capture_errors, 1);
    assert!(recorder.get_by_id(&incident.id).await.is_some());
}

#[tokio::test]
async fn oversized_dom_is_truncated_with_marker() {
    common::init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = settings(dir.path(), 10);
    cfg.max_dom_chars = 64;
    let recorder = ForensicRecorder::open(&cfg, "es").await.unwrap();
    let page = FakePage::new(&[]).with_html(format!("<html>{}</html>", "x".repeat(1_000)));

    let incident = recorder
        .capture(&page, &not_resolved("login.email"), &BTreeMap::new(), &tried())
        .await;

    assert!(incident.dom_truncated);
    let dom = std::fs::read_to_string(&incident.captures.dom.unwrap().path).unwrap();
    assert!(dom.starts_with("<html>xxx"));
    assert!(dom.contains("DOM truncated to 64 of 1013 characters"));
    assert!(dom.chars().count() < 200);
}

#[tokio::test]
async fn retention_evicts_exactly_the_oldest() {
    common::init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let recorder = ForensicRecorder::open(&settings(dir.path(), 3), "es")
        .await
        .unwrap();
    let page = FakePage::new(&[]);

    let mut ids = Vec::new();
    for i in 0..5 {
        let incident = recorder
            .capture(&page, &not_resolved(&format!("path.{i}")), &BTreeMap::new(), &tried())
            .await;
        ids.push(incident.id);
    }

    for evicted in &ids[..2] {
        assert!(recorder.get_by_id(evicted).await.is_none(), "{evicted} survived");
    }
    for kept in &ids[2..] {
        assert!(recorder.get_by_id(kept).await.is_some(), "{kept} was evicted");
    }
    assert_eq!(recorder.status().evicted, 2);

    let recent: Vec<String> = recorder.get_recent(10).into_iter().map(|i| i.id).collect();
    let newest_first: Vec<String> = ids[2..].iter().rev().cloned().collect();
    assert_eq!(recent, newest_first);
    assert_eq!(recorder.get_recent(1)[0].id, ids[4]);

    let json_files = walkdir::WalkDir::new(dir.path().join("es"))
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|x| x == "json"))
        .count();
    assert_eq!(json_files, 3);
}

fn count_with_extension(root: &Path, ext: &str) -> usize {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|x| x == ext))
        .count()
}

#[tokio::test]
async fn abandoned_capture_artifacts_are_evicted_with_the_rest() {
    common::init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let recorder = ForensicRecorder::open(&settings(dir.path(), 3), "es")
        .await
        .unwrap();

    let stalled = FakePage::new(&[]).with_hanging_url();
    let abandoned = tokio::time::timeout(
        Duration::from_millis(200),
        recorder.capture(&stalled, &not_resolved("login.email"), &BTreeMap::new(), &tried()),
    )
    .await;
    assert!(abandoned.is_err(), "capture should still be waiting on the page url");
    let tenant_dir = dir.path().join("es");
    assert_eq!(count_with_extension(&tenant_dir, "png"), 1);
    assert_eq!(count_with_extension(&tenant_dir, "json"), 0);

    let page = FakePage::new(&[]);
    for i in 0..6 {
        recorder
            .capture(&page, &not_resolved(&format!("path.{i}")), &BTreeMap::new(), &tried())
            .await;
    }

    for ext in ["json", "png", "html"] {
        assert_eq!(count_with_extension(&tenant_dir, ext), 3, "{ext} files");
    }
    assert_eq!(recorder.get_recent(10).len(), 3);
}

#[tokio::test]
async fn unwritable_partition_still_records_the_incident() {
    common::init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let recorder = ForensicRecorder::open(&settings(dir.path(), 3), "es")
        .await
        .unwrap();
    let tenant_dir = dir.path().join("es");
    std::fs::remove_dir_all(&tenant_dir).unwrap();
    std::fs::write(&tenant_dir, b"not a directory").unwrap();

    let page = FakePage::new(&[]);
    let incident = recorder
        .capture(&page, &not_resolved("login.email"), &BTreeMap::new(), &tried())
        .await;

    assert!(
        incident.capture_errors.iter().any(|e| e.contains("partition")),
        "{:?}",
        incident.capture_errors
    );
    assert_eq!(incident.captures, Default::default());
    let status = recorder.status();
    assert_eq!(status.captured, 1);
    assert_eq!(status.capture_errors, 1);
    assert_eq!(recorder.get_recent(1)[0].id, incident.id);
    assert_eq!(recorder.get_by_id(&incident.id).await, Some(incident));
}

#[tokio::test]
async fn reopened_recorder_hydrates_and_finds_by_id_on_disk() {
    common::init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let page = FakePage::new(&[]);
    let id = {
        let recorder = ForensicRecorder::open(&settings(dir.path(), 10), "es")
            .await
            .unwrap();
        recorder
            .capture(&page, &not_resolved("login.email"), &BTreeMap::new(), &tried())
            .await
            .id
    };

    let reopened = ForensicRecorder::open(&settings(dir.path(), 10), "es")
        .await
        .unwrap();
    assert_eq!(reopened.get_recent(5).len(), 1);
    assert_eq!(reopened.get_recent(5)[0].id, id);

    // a recorder for another tenant finds it through the partition scan
    let other = ForensicRecorder::open(&settings(dir.path(), 10), "fr")
        .await
        .unwrap();
    assert!(other.get_recent(5).is_empty());
    let found = other.get_by_id(&id).await.unwrap();
    assert_eq!(found.tenant, "es");
    assert!(other.get_by_id("0190aaaa-0000-7000-8000-000000000000").await.is_none());
}

#[tokio::test]
async fn verify_detects_tampered_dom() {
    common::init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let recorder = ForensicRecorder::open(&settings(dir.path(), 10), "es")
        .await
        .unwrap();
    let page = FakePage::new(&[]);
    let incident = recorder
        .capture(&page, &not_resolved("login.email"), &BTreeMap::new(), &tried())
        .await;

    std::fs::write(&incident.captures.dom.as_ref().unwrap().path, "<html>edited</html>").unwrap();

    let report = recorder.verify(&incident.id).await.unwrap();
    assert_eq!(report.screenshot_intact, Some(true));
    assert_eq!(report.dom_intact, Some(false));
    assert!(!report.is_intact());
}
