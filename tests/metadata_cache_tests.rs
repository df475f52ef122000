#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::ffi::OsStr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use rfs_client::cache::{CacheSettings, MetadataCache, Removal};
use rfs_client::fs::Uuid;
use rfs_client::FsError;

use common::mocks::MockProvider;
use common::{dir_attr, file_attr};

fn cache_with(provider: &MockProvider, max_entries: usize) -> MetadataCache<MockProvider> {
    MetadataCache::new(
        provider.clone(),
        CacheSettings {
            max_entries,
            ..CacheSettings::default()
        },
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn getattr_caches_and_second_call_is_local() {
    let provider = MockProvider::new();
    provider.state.add(file_attr("f1", "root", "a.txt", 42));
    let cache = cache_with(&provider, 100);
    let id = Uuid::from("f1");

    let first = cache.getattr(&id).await.unwrap();
    assert!(cache.contains(&id), "getattr should populate the cache");
    let second = cache.getattr(&id).await.unwrap();

    assert_eq!(first, second, "cached attributes should be identical");
    assert_eq!(provider.state.calls("get_attr"), 1, "second getattr must not go remote");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn getattr_of_missing_entry_is_not_found() {
    let provider = MockProvider::new();
    let cache = cache_with(&provider, 100);

    let err = cache.getattr(&Uuid::from("nope")).await.unwrap_err();

    assert_eq!(err, FsError::NotFound);
    assert!(!cache.contains(&Uuid::from("nope")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_misses_share_one_request() {
    let provider = MockProvider::new();
    provider.state.add(file_attr("f1", "root", "a.txt", 1));
    provider.state.attr_delay_ms.store(50, Ordering::Relaxed);
    let cache = Arc::new(cache_with(&provider, 100));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.getattr(&Uuid::from("f1")).await })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap().size, 1);
    }

    assert_eq!(provider.state.calls("get_attr"), 1, "misses should be deduplicated");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn capacity_bound_holds_and_pinned_entries_survive() {
    let provider = MockProvider::new();
    let cache = cache_with(&provider, 3);
    cache.put(file_attr("pinned", "root", "p", 0));
    assert!(cache.pin(&Uuid::from("pinned")));

    for i in 0..10 {
        cache.put(file_attr(&format!("f{i}"), "root", &format!("n{i}"), 0));
        assert!(cache.size() <= 3, "size exceeded capacity after insert {i}");
    }

    assert!(cache.contains(&Uuid::from("pinned")), "pinned entry was evicted");
    assert!(cache.contains(&Uuid::from("f9")), "latest insert should be cached");
    assert!(!cache.contains(&Uuid::from("f0")), "oldest entry should be evicted");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn least_recently_used_entry_is_evicted_first() {
    let provider = MockProvider::new();
    let cache = cache_with(&provider, 2);
    cache.put(file_attr("a", "root", "a", 0));
    cache.put(file_attr("b", "root", "b", 0));

    let _ = cache.get(&Uuid::from("a"));
    cache.put(file_attr("c", "root", "c", 0));

    assert!(cache.contains(&Uuid::from("a")));
    assert!(!cache.contains(&Uuid::from("b")));
    assert!(cache.contains(&Uuid::from("c")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cached_parent_outlives_its_cached_children() {
    let provider = MockProvider::new();
    let cache = cache_with(&provider, 2);
    cache.put(dir_attr("d", Some("root"), "d"));
    cache.put(file_attr("child", "d", "x", 0));

    cache.put(file_attr("other", "root", "o", 0));

    assert!(
        !cache.contains(&Uuid::from("child")) || cache.contains(&Uuid::from("d")),
        "a child must never stay cached without its parent"
    );
    assert!(cache.size() <= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lookup_uses_name_index_after_first_miss() {
    let provider = MockProvider::new();
    provider.state.add(file_attr("f1", "root", "a.txt", 3));
    let cache = cache_with(&provider, 100);

    let first = cache.lookup(&Uuid::from("root"), OsStr::new("a.txt")).await.unwrap();
    let second = cache.lookup(&Uuid::from("root"), OsStr::new("a.txt")).await.unwrap();

    assert_eq!(first.uuid, Uuid::from("f1"));
    assert_eq!(first, second);
    assert_eq!(provider.state.calls("get_child_attr"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn removing_pinned_entry_is_deferred_until_unpin() {
    let provider = MockProvider::new();
    let cache = cache_with(&provider, 100);
    let id = Uuid::from("f1");
    cache.put(file_attr("f1", "root", "a", 0));
    cache.pin(&id);

    assert_eq!(cache.remove(&id), Removal::Deferred);
    assert!(cache.get(&id).is_some(), "open entry stays readable");

    cache.unpin(&id);
    assert!(!cache.contains(&id), "removal should happen on last unpin");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleted_entries_are_not_resurrected() {
    let provider = MockProvider::new();
    provider.state.add(file_attr("f1", "root", "a", 0));
    let cache = cache_with(&provider, 100);
    let id = Uuid::from("f1");
    cache.getattr(&id).await.unwrap();

    cache.apply_deleted(&id);

    assert!(cache.is_deleted(&id));
    assert_eq!(cache.getattr(&id).await.unwrap_err(), FsError::NotFound);
    assert!(cache.apply_attr_changed(&file_attr("f1", "root", "a", 9)).is_none());
    assert!(!cache.contains(&id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn attribute_merge_keeps_newest_times_and_reports_shrink() {
    let provider = MockProvider::new();
    let cache = cache_with(&provider, 100);
    let mut cached = file_attr("f1", "root", "a", 100);
    cached.mtime = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(50);
    cache.put(cached.clone());

    let mut fresh = file_attr("f1", "root", "a", 10);
    fresh.mtime = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(20);
    fresh.uid = 7;

    assert_eq!(cache.apply_attr_changed(&fresh), Some(10));
    let merged = cache.get(&Uuid::from("f1")).unwrap();
    assert_eq!(merged.mtime, cached.mtime, "timestamps never move backwards");
    assert_eq!(merged.uid, 7);
    assert_eq!(merged.size, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn attribute_update_from_other_parent_is_ignored() {
    let provider = MockProvider::new();
    let cache = cache_with(&provider, 100);
    cache.put(file_attr("f1", "root", "a", 100));

    assert_eq!(cache.apply_attr_changed(&file_attr("f1", "elsewhere", "a", 1)), None);
    assert_eq!(cache.get(&Uuid::from("f1")).unwrap().size, 100);
}
