//! Media cache integration tests
//!
//! Exercises the cache against real files on disk: lecture videos exposed
//! through a local cloud folder, random-access playback patterns and
//! restarts between sessions.

use bytes::Bytes;
use lectern_cache::{
    ByteRange, CacheKey, FileUpstream, LocalFolderProvider, MediaCache, MemoryUpstream, INDEX_FILE,
};
use lectern_core::provider::CloudFileProvider;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn video_bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| ((i * 7 + seed as usize) % 256) as u8).collect()
}

fn span_files(dir: &Path) -> Vec<u64> {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("span-"))
        .map(|e| e.metadata().unwrap().len())
        .collect()
}

#[tokio::test]
async fn test_cloud_folder_video_is_served_from_cache_after_source_disappears() {
    let root = TempDir::new().unwrap();
    let course = root.path().join("course");
    std::fs::create_dir_all(&course).unwrap();
    let video = video_bytes(64 * 1024, 3);
    std::fs::write(course.join("week1.mp4"), &video).unwrap();
    std::fs::write(course.join("week1.pdf"), b"%PDF-1.4").unwrap();

    let provider = LocalFolderProvider::new(root.path());
    let listing = provider.list_folder(Some("course")).await.unwrap();
    let file = listing.iter().find(|f| f.is_video()).unwrap();
    assert_eq!(file.size, Some(video.len() as u64));

    let key = CacheKey::for_cloud_file(&provider, &file.id).await.unwrap();
    assert!(key.upstream_url.starts_with("file://"));

    let cache_dir = TempDir::new().unwrap();
    let cache = MediaCache::open(cache_dir.path(), 1024 * 1024, Arc::new(FileUpstream))
        .await
        .unwrap();

    let head = cache.read(&key, ByteRange::new(0, 16 * 1024)).await.unwrap();
    assert_eq!(&head[..], &video[..16 * 1024]);

    std::fs::remove_file(course.join("week1.mp4")).unwrap();

    let again = cache.read(&key, ByteRange::new(4096, 1024)).await.unwrap();
    assert_eq!(&again[..], &video[4096..5120]);

    // Bytes that were never cached now fail.
    assert!(cache.read(&key, ByteRange::new(32 * 1024, 10)).await.is_err());
}

#[tokio::test]
async fn test_random_seeks_never_exceed_budget() {
    let cache_dir = TempDir::new().unwrap();
    let upstream = Arc::new(MemoryUpstream::new());
    let streams: Vec<(CacheKey, Vec<u8>)> = (0..3u8)
        .map(|i| {
            let url = format!("https://cdn.example/lecture-{i}.mp4");
            let data = video_bytes(200_000, i);
            upstream.insert(url.clone(), data.clone());
            (CacheKey::new(format!("lecture-{i}"), url), data)
        })
        .collect();

    let budget = 50_000;
    let cache = MediaCache::open(cache_dir.path(), budget, upstream.clone())
        .await
        .unwrap();

    // Deterministic pseudo-random seek pattern.
    let mut state: u64 = 0x2545_f491;
    for _ in 0..300 {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let (key, data) = &streams[(state >> 33) as usize % streams.len()];
        let start = (state >> 11) % 200_000;
        let len = 1 + (state >> 40) % 12_000;

        let got = cache.read(key, ByteRange::new(start, len)).await.unwrap();
        let end = (start + len).min(data.len() as u64) as usize;
        assert_eq!(got, Bytes::copy_from_slice(&data[start as usize..end]));

        let stats = cache.stats().await;
        assert!(stats.total_bytes <= budget, "{} > {}", stats.total_bytes, budget);
    }

    let stats = cache.stats().await;
    assert!(stats.evictions > 0);
    assert_eq!(stats.hits + stats.misses, 300);
    let on_disk: u64 = span_files(cache_dir.path()).iter().sum();
    assert_eq!(on_disk, stats.total_bytes);
    assert_eq!(span_files(cache_dir.path()).len(), stats.entries);
}

#[tokio::test]
async fn test_recency_survives_restart() {
    let cache_dir = TempDir::new().unwrap();
    let upstream = Arc::new(MemoryUpstream::new());
    upstream.insert("mem://v", video_bytes(10_000, 9));
    let key = CacheKey::new("v", "mem://v");
    let a = ByteRange::new(0, 300);
    let b = ByteRange::new(1_000, 300);
    let c = ByteRange::new(2_000, 300);

    {
        let cache = MediaCache::open(cache_dir.path(), 1_000, upstream.clone())
            .await
            .unwrap();
        cache.read(&key, a).await.unwrap();
        cache.read(&key, b).await.unwrap();
        cache.read(&key, c).await.unwrap();
        // Hit on a makes b the oldest; persisted by flush.
        cache.read(&key, a).await.unwrap();
        cache.flush().await.unwrap();
    }

    let cache = MediaCache::open(cache_dir.path(), 1_000, upstream.clone())
        .await
        .unwrap();
    assert_eq!(cache.stats().await.entries, 3);
    let fetches = upstream.fetch_count();
    cache.read(&key, c).await.unwrap();
    assert_eq!(upstream.fetch_count(), fetches, "c should be a hit after restart");

    cache.read(&key, ByteRange::new(5_000, 300)).await.unwrap();
    assert!(!cache.contains(&key, b).await);
    assert!(cache.contains(&key, a).await);
    assert!(cache.contains(&key, c).await);
    assert!(cache.stats().await.total_bytes <= 1_000);
}

#[tokio::test]
async fn test_corrupt_index_starts_empty_and_removes_orphans() {
    let cache_dir = TempDir::new().unwrap();
    let upstream = Arc::new(MemoryUpstream::new());
    upstream.insert("mem://v", video_bytes(4_000, 1));
    let key = CacheKey::new("v", "mem://v");

    {
        let cache = MediaCache::open(cache_dir.path(), 10_000, upstream.clone())
            .await
            .unwrap();
        cache.read(&key, ByteRange::new(0, 1_000)).await.unwrap();
        cache.read(&key, ByteRange::new(2_000, 1_000)).await.unwrap();
    }
    assert_eq!(span_files(cache_dir.path()).len(), 2);

    std::fs::write(cache_dir.path().join(INDEX_FILE), b"{ not json").unwrap();

    let cache = MediaCache::open(cache_dir.path(), 10_000, upstream.clone())
        .await
        .unwrap();
    let stats = cache.stats().await;
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.total_bytes, 0);
    assert!(span_files(cache_dir.path()).is_empty());

    // Still fully usable.
    let data = cache.read(&key, ByteRange::new(0, 10)).await.unwrap();
    assert_eq!(data.len(), 10);
}
