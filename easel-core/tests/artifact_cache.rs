use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use easel_core::{
    ArtifactCache, BlobSource, CacheLimits, HistoryStore, NewRecord, NormalizedRequest,
    OutputFormat, RecordId, StoreResult,
};
use image::{DynamicImage, ImageFormat};
use parking_lot::Mutex;

fn png(width: u32, height: u32) -> Vec<u8> {
    let mut bytes = Vec::new();
    DynamicImage::new_rgb8(width, height)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

/// In-memory blobs with an optional read delay.
#[derive(Default)]
struct Blobs {
    blobs: Mutex<HashMap<RecordId, Vec<u8>>>,
    delay: Option<Duration>,
}

impl Blobs {
    fn with(entries: impl IntoIterator<Item = (RecordId, Vec<u8>)>) -> Self {
        Self {
            blobs: Mutex::new(entries.into_iter().collect()),
            delay: None,
        }
    }
}

#[async_trait]
impl BlobSource for Blobs {
    async fn load_blob(&self, id: RecordId) -> StoreResult<Option<Vec<u8>>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.blobs.lock().get(&id).cloned())
    }
}

#[tokio::test]
async fn test_repeat_get_is_bit_identical_hit() {
    let id = RecordId::new();
    let cache = ArtifactCache::with_default_limits(Arc::new(Blobs::with([(id, png(640, 480))])));

    let first = cache.get(id, 100).await.unwrap();
    let second = cache.get(id, 100).await.unwrap();

    assert_eq!((first.width(), first.height()), (200, 150));
    assert_eq!(first.pixels(), second.pixels());
    assert!(Arc::ptr_eq(&first, &second));

    let stats = cache.stats();
    assert_eq!(stats.decodes, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.entries, 1);
}

#[tokio::test]
async fn test_sizes_are_cached_separately() {
    let id = RecordId::new();
    let cache = ArtifactCache::with_default_limits(Arc::new(Blobs::with([(id, png(640, 480))])));

    let small = cache.get(id, 50).await.unwrap();
    let large = cache.get(id, 1000).await.unwrap();

    assert_eq!(small.width(), 100);
    assert_eq!(large.width(), 640);
    assert_eq!(cache.stats().entries, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_share_one_decode() {
    let id = RecordId::new();
    let source = Blobs {
        delay: Some(Duration::from_millis(50)),
        ..Blobs::with([(id, png(256, 256))])
    };
    let cache = Arc::new(ArtifactCache::with_default_limits(Arc::new(source)));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get(id, 64).await })
        })
        .collect();
    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap().unwrap());
    }

    assert_eq!(cache.stats().decodes, 1);
    assert!(results.iter().all(|t| Arc::ptr_eq(t, &results[0])));
}

#[tokio::test]
async fn test_corrupt_and_missing_blobs_yield_none() {
    let corrupt = RecordId::new();
    let cache = ArtifactCache::with_default_limits(Arc::new(Blobs::with([(
        corrupt,
        b"definitely not a png".to_vec(),
    )])));

    assert!(cache.get(corrupt, 64).await.is_none());
    assert!(cache.get(RecordId::new(), 64).await.is_none());
    assert_eq!(cache.stats().entries, 0);

    // Failures are not cached; a retry decodes again.
    assert!(cache.get(corrupt, 64).await.is_none());
    assert_eq!(cache.stats().decodes, 2);
}

#[tokio::test]
async fn test_invalidate_forces_reload() {
    let id = RecordId::new();
    let source = Arc::new(Blobs::with([(id, png(64, 64))]));
    let cache = ArtifactCache::with_default_limits(source.clone());

    assert_eq!(cache.get(id, 64).await.unwrap().width(), 64);
    source.blobs.lock().insert(id, png(32, 32));
    // Still served from the cache.
    assert_eq!(cache.get(id, 64).await.unwrap().width(), 64);

    cache.invalidate(id);
    assert_eq!(cache.stats().entries, 0);
    assert_eq!(cache.get(id, 64).await.unwrap().width(), 32);
}

#[tokio::test]
async fn test_limits_bound_entries_and_cost() {
    let ids: Vec<RecordId> = (0..4).map(|_| RecordId::new()).collect();
    let source = Blobs::with(ids.iter().map(|id| (*id, png(16, 16))));
    // 16x16 RGBA is 1 KiB.
    let cache = ArtifactCache::new(
        Arc::new(source),
        CacheLimits {
            max_entries: 3,
            max_cost: 2048,
        },
    );

    for id in &ids {
        assert!(cache.get(*id, 16).await.is_some());
    }
    let stats = cache.stats();
    assert_eq!(stats.entries, 2);
    assert!(stats.cost <= 2048);
    assert_eq!(stats.evictions, 2);

    cache.clear();
    assert_eq!(cache.stats().entries, 0);
}

#[tokio::test]
async fn test_reads_from_history_store() {
    let store = HistoryStore::open_in_memory().await.unwrap();
    let request = NormalizedRequest {
        prompt: "a red kite".to_string(),
        negative_prompt: None,
        steps: 4,
        guidance_scale: 0.0,
        width: 320,
        height: 192,
        seed: 11,
        output_format: OutputFormat::Jpeg,
        model_id: "flux.1-schnell".to_string(),
    };
    let encoded = OutputFormat::Jpeg
        .encode(&DynamicImage::new_rgb8(320, 192))
        .unwrap();
    let id = store.append(NewRecord::new(request, encoded)).await.unwrap();

    let cache = ArtifactCache::with_default_limits(Arc::new(store.clone()));
    let thumb = cache.get(id, 40).await.unwrap();
    assert_eq!((thumb.width(), thumb.height()), (80, 48));

    store.delete(id).await.unwrap();
    cache.invalidate(id);
    assert!(cache.get(id, 40).await.is_none());
}
