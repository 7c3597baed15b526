//! Property tests for the encrypted TTL cache.

use std::time::Duration;

use serde_json::json;
use tabwire::cache::{Cache, CacheError, CacheOptions, Metadata};
use tabwire::protocol::Row;
use tempfile::TempDir;

const KEY_16: &[u8] = b"abcdefghijklmnop";

fn options(root: &TempDir, segments: &[&str]) -> CacheOptions {
    CacheOptions {
        segments: segments.iter().map(|s| s.to_string()).collect(),
        encryption_key: KEY_16.to_vec(),
        base_dir: Some(root.path().to_path_buf()),
        ..Default::default()
    }
}

fn sample_rows() -> Vec<Row> {
    vec![
        vec![json!("a"), json!("b")],
        vec![json!("c"), json!("d")],
    ]
}

fn sample_metadata() -> Metadata {
    [
        ("hello".to_string(), json!("world")),
        ("foo".to_string(), json!("bar")),
        ("number".to_string(), json!(42)),
    ]
    .into_iter()
    .collect()
}

#[test]
fn test_round_trip() {
    let root = TempDir::new().unwrap();
    let cache = Cache::open(options(&root, &["test", "cache1"])).unwrap();

    cache
        .set("key", &sample_rows(), &sample_metadata(), Some(Duration::from_secs(3600)))
        .unwrap();

    let (rows, metadata) = cache.get("key").unwrap();
    assert_eq!(rows, sample_rows());
    assert_eq!(metadata, sample_metadata());
}

#[test]
fn test_round_trip_of_every_scalar_kind_and_empty_rows() {
    let root = TempDir::new().unwrap();
    let cache = Cache::open(options(&root, &["test", "scalars"])).unwrap();

    let rows: Vec<Row> = vec![
        vec![json!(null), json!(1), json!(2.5), json!("text"), json!(true)],
        vec![],
    ];
    let metadata: Metadata = [
        ("none".to_string(), json!(null)),
        ("count".to_string(), json!(7)),
        ("ratio".to_string(), json!(0.5)),
        ("label".to_string(), json!("x")),
        ("flag".to_string(), json!(false)),
    ]
    .into_iter()
    .collect();

    cache.set("mixed", &rows, &metadata, None).unwrap();
    let (rows2, metadata2) = cache.get("mixed").unwrap();
    assert_eq!(rows, rows2);
    assert_eq!(metadata, metadata2);

    // Entirely empty values round-trip too.
    cache.set("empty", &[], &Metadata::new(), None).unwrap();
    let (rows3, metadata3) = cache.get("empty").unwrap();
    assert!(rows3.is_empty());
    assert!(metadata3.is_empty());
}

#[test]
fn test_missing_key_is_a_miss() {
    let root = TempDir::new().unwrap();
    let cache = Cache::open(options(&root, &["test", "missing"])).unwrap();

    assert!(matches!(cache.get("absent"), Err(CacheError::Miss)));
}

#[test]
fn test_values_expire() {
    let root = TempDir::new().unwrap();
    let cache = Cache::open(options(&root, &["test", "cache3"])).unwrap();

    cache
        .set("key", &sample_rows(), &sample_metadata(), Some(Duration::from_secs(1)))
        .unwrap();

    let (rows, metadata) = cache.get("key").unwrap();
    assert_eq!(rows, sample_rows());
    assert_eq!(metadata, sample_metadata());

    std::thread::sleep(Duration::from_millis(1100));

    assert!(matches!(cache.get("key"), Err(CacheError::Miss)));
}

#[test]
fn test_values_can_be_deleted() {
    let root = TempDir::new().unwrap();
    let cache = Cache::open(options(&root, &["test", "cache4"])).unwrap();

    cache
        .set("key", &sample_rows(), &sample_metadata(), None)
        .unwrap();
    assert!(cache.get("key").is_ok());

    cache.delete("key").unwrap();
    assert!(matches!(cache.get("key"), Err(CacheError::Miss)));
}

#[test]
fn test_prefix_clear_spares_other_keys() {
    let root = TempDir::new().unwrap();
    let cache = Cache::open(options(&root, &["test", "cache5"])).unwrap();

    for key in ["key-a", "key-b", "other"] {
        cache
            .set(key, &sample_rows(), &sample_metadata(), None)
            .unwrap();
    }

    cache.clear_with_prefix("key").unwrap();

    assert!(matches!(cache.get("key-a"), Err(CacheError::Miss)));
    assert!(matches!(cache.get("key-b"), Err(CacheError::Miss)));

    let (rows, metadata) = cache.get("other").unwrap();
    assert_eq!(rows, sample_rows());
    assert_eq!(metadata, sample_metadata());

    // A full clear wipes the rest.
    cache.clear().unwrap();
    assert!(matches!(cache.get("other"), Err(CacheError::Miss)));
}

#[test]
fn test_caches_with_different_segments_are_isolated() {
    let root = TempDir::new().unwrap();
    let cache_a = Cache::open(options(&root, &["plugin-a", "boards"])).unwrap();
    let cache_b = Cache::open(options(&root, &["plugin-b", "boards"])).unwrap();

    cache_a
        .set("key", &sample_rows(), &sample_metadata(), None)
        .unwrap();

    assert!(cache_a.get("key").is_ok());
    assert!(matches!(cache_b.get("key"), Err(CacheError::Miss)));
}

#[test]
fn test_concurrent_open_of_the_same_path_falls_back() {
    let root = TempDir::new().unwrap();

    let cache1 = Cache::open(options(&root, &["test", "cache2"])).unwrap();
    let cache2 = Cache::open(options(&root, &["test", "cache2"])).unwrap();

    // Both constructions succeed, on distinct files.
    assert_ne!(cache1.path(), cache2.path());

    // The two handles are independent: liveness was traded for sharing.
    cache1
        .set("key", &sample_rows(), &sample_metadata(), None)
        .unwrap();
    assert!(cache1.get("key").is_ok());
    assert!(matches!(cache2.get("key"), Err(CacheError::Miss)));

    // The fallback handle is fully usable.
    cache2
        .set("key2", &sample_rows(), &sample_metadata(), None)
        .unwrap();
    assert!(cache2.get("key2").is_ok());
}

#[test]
fn test_closed_cache_fails_cleanly_and_frees_the_lock() {
    let root = TempDir::new().unwrap();

    let mut cache1 = Cache::open(options(&root, &["test", "cache6"])).unwrap();
    let original_path = cache1.path().to_path_buf();

    cache1
        .set("key", &sample_rows(), &sample_metadata(), None)
        .unwrap();
    cache1.close().unwrap();

    // The handle is dead.
    assert!(matches!(cache1.get("key"), Err(CacheError::Closed)));
    assert!(matches!(
        cache1.set("key", &sample_rows(), &sample_metadata(), None),
        Err(CacheError::Closed)
    ));
    assert!(matches!(cache1.delete("key"), Err(CacheError::Closed)));

    // The lock is released: a new cache lands on the same file and sees the
    // persisted entry.
    let cache2 = Cache::open(options(&root, &["test", "cache6"])).unwrap();
    assert_eq!(cache2.path(), original_path.as_path());

    let (rows, metadata) = cache2.get("key").unwrap();
    assert_eq!(rows, sample_rows());
    assert_eq!(metadata, sample_metadata());
}

#[test]
fn test_stats_count_both_records_of_an_entry() {
    let root = TempDir::new().unwrap();
    let cache = Cache::open(options(&root, &["test", "stats"])).unwrap();

    cache
        .set("key", &sample_rows(), &sample_metadata(), None)
        .unwrap();

    let stats = cache.stats().unwrap();
    assert_eq!(stats.record_count, 2);
    assert!(stats.total_size_bytes > 0);
}

#[test]
fn test_wrong_key_material_reads_as_miss() {
    let root = TempDir::new().unwrap();

    let mut cache = Cache::open(options(&root, &["test", "rekeyed"])).unwrap();
    cache
        .set("key", &sample_rows(), &sample_metadata(), None)
        .unwrap();
    cache.close().unwrap();

    // Reopen the same file with a different key: entries are undecodable
    // and must surface as ordinary misses, not as fatal errors.
    let mut opts = options(&root, &["test", "rekeyed"]);
    opts.encryption_key = b"ponmlkjihgfedcba".to_vec();
    let cache = Cache::open(opts).unwrap();

    assert!(matches!(cache.get("key"), Err(CacheError::Miss)));
}
