//! Dump stage integration tests
//!
//! Exercise the worker pool against a real directory tree.

mod common;

use std::sync::Arc;
use std::time::Duration;

use sdkmirror::core::{discover_work_set, DumpPool};
use sdkmirror::domain::WorkItem;
use tempfile::TempDir;

use common::*;

fn framework(name: &str) -> String {
    format!("Library/Frameworks/{0}.framework/{0}", name)
}

#[tokio::test]
async fn test_one_failure_does_not_stop_the_batch() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let names = ["Alpha", "Bravo", "Charlie", "Delta", "Echo"];
    for name in names {
        touch(&root.join(framework(name)));
    }

    let items = discover_work_set(root, false).unwrap();
    assert_eq!(items.len(), 5);

    let generator = Arc::new(FakeGenerator::failing_on(&["Charlie"]));
    let summary = DumpPool::new(generator.clone(), 3)
        .run(items.clone())
        .await
        .unwrap();

    assert_eq!(summary.total, 5);
    assert_eq!(summary.succeeded, 4);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].item, framework("Charlie"));
    assert_eq!(generator.generated.lock().unwrap().len(), 5);
    assert_eq!(generator.version_calls.load(std::sync::atomic::Ordering::SeqCst), 1);

    for item in &items {
        let failed = item.relative.ends_with("Charlie");
        assert_eq!(item.stub_path().is_file(), !failed, "{}", item.display_name());
        assert_eq!(item.json_path().is_file(), !failed, "{}", item.display_name());
        assert_eq!(item.headers_dir().is_dir(), !failed, "{}", item.display_name());
        assert_eq!(item.has_failed_before(), failed, "{}", item.display_name());
    }

    // Only the failed binary is left to do
    let remaining = discover_work_set(root, false).unwrap();
    assert_eq!(remaining, vec![WorkItem::new(root, framework("Charlie"))]);
    assert!(discover_work_set(root, true).unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_work_set_calls_nothing() {
    let generator = Arc::new(FakeGenerator::default());
    let summary = DumpPool::new(generator.clone(), 4).run(Vec::new()).await.unwrap();

    assert_eq!(summary.total, 0);
    assert!(summary.is_clean());
    assert_eq!(generator.call_count(), 0);
}

#[tokio::test]
async fn test_more_workers_than_items_with_throttle() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    touch(&root.join("usr/lib/libobjc.A.dylib"));

    let generator = Arc::new(FakeGenerator::default());
    let items = discover_work_set(root, false).unwrap();
    let summary = DumpPool::new(generator, 8)
        .with_throttle(Duration::from_millis(5))
        .run(items)
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert!(root.join("usr/lib/libobjc.A.dylib.tbd").is_file());
    assert!(root.join("usr/lib/Headers/libobjc.A.dylib.h").is_file());
}
