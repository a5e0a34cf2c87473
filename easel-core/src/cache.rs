//! Thumbnail cache for history listings.
//!
//! The [`ArtifactCache`] maps `(record, display size)` to a decoded RGBA
//! thumbnail. It is a derived view of the history store and can be cleared
//! at any time. Capacity is bounded both by entry count and by total
//! decoded bytes; least-recently-used entries are evicted until both hold.
//!
//! Misses decode on a blocking worker. Concurrent misses for the same key
//! share a single decode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use image::{ImageFormat, RgbaImage};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::OnceCell;

use crate::{CacheDecodeError, HistoryStore, RecordId, StoreResult};

/// Default entry-count ceiling.
pub const DEFAULT_MAX_ENTRIES: usize = 100;

/// Default decoded-bytes ceiling: 50 MiB.
pub const DEFAULT_MAX_COST: usize = 50 * 1024 * 1024;

/// Thumbnails are decoded at up to this multiple of the display edge so
/// they stay sharp on high-density screens.
pub const DENSITY_FACTOR: u32 = 2;

/// Where the cache reads encoded images from.
#[async_trait]
pub trait BlobSource: Send + Sync {
    async fn load_blob(&self, id: RecordId) -> StoreResult<Option<Vec<u8>>>;
}

#[async_trait]
impl BlobSource for HistoryStore {
    async fn load_blob(&self, id: RecordId) -> StoreResult<Option<Vec<u8>>> {
        self.load_image(id).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub record_id: RecordId,
    /// Longest edge, in display points, the thumbnail is shown at.
    pub display_edge: u32,
}

impl CacheKey {
    pub fn new(record_id: RecordId, display_edge: u32) -> Self {
        Self {
            record_id,
            display_edge,
        }
    }
}

/// A decoded, immutable thumbnail.
#[derive(Debug, Clone, PartialEq)]
pub struct Thumbnail {
    image: RgbaImage,
}

impl Thumbnail {
    pub fn new(image: RgbaImage) -> Self {
        Self { image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    /// Approximate memory footprint in bytes.
    pub fn cost(&self) -> usize {
        self.image.as_raw().len()
    }

    pub fn encode_png(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut bytes = Vec::new();
        self.image
            .write_to(&mut std::io::Cursor::new(&mut bytes), ImageFormat::Png)?;
        Ok(bytes)
    }
}

/// Decode encoded image bytes and shrink them to at most
/// `DENSITY_FACTOR * display_edge` on the longest side. Never upscales.
pub fn decode_thumbnail(bytes: &[u8], display_edge: u32) -> Result<Thumbnail, image::ImageError> {
    let img = image::load_from_memory(bytes)?;
    let bound = display_edge.saturating_mul(DENSITY_FACTOR).max(1);
    let img = if img.width() > bound || img.height() > bound {
        img.thumbnail(bound, bound)
    } else {
        img
    };
    Ok(Thumbnail::new(img.to_rgba8()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLimits {
    pub max_entries: usize,
    pub max_cost: usize,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            max_cost: DEFAULT_MAX_COST,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub cost: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Decodes actually performed.
    pub decodes: u64,
}

#[derive(Debug)]
struct Entry {
    thumbnail: Arc<Thumbnail>,
    cost: usize,
    /// Monotonically increasing access counter for LRU eviction.
    last_access: u64,
}

/// Eviction bookkeeping. Only this is locked; thumbnails are shared
/// immutably.
#[derive(Debug, Default)]
struct Lru {
    entries: HashMap<CacheKey, Entry>,
    total_cost: usize,
    access_counter: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl Lru {
    fn tick(&mut self) -> u64 {
        self.access_counter += 1;
        self.access_counter
    }

    fn get(&mut self, key: &CacheKey) -> Option<Arc<Thumbnail>> {
        let now = self.tick();
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.last_access = now;
                self.hits += 1;
                Some(Arc::clone(&entry.thumbnail))
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Returns whether the thumbnail was retained.
    fn insert(&mut self, key: CacheKey, thumbnail: Arc<Thumbnail>, limits: &CacheLimits) -> bool {
        let cost = thumbnail.cost();
        if limits.max_entries == 0 || cost > limits.max_cost {
            return false;
        }

        if let Some(old) = self.entries.remove(&key) {
            self.total_cost = self.total_cost.saturating_sub(old.cost);
        }

        while !self.entries.is_empty()
            && (self.entries.len() + 1 > limits.max_entries
                || self.total_cost + cost > limits.max_cost)
        {
            self.evict_lru();
        }

        let now = self.tick();
        self.total_cost += cost;
        self.entries.insert(
            key,
            Entry {
                thumbnail,
                cost,
                last_access: now,
            },
        );
        true
    }

    fn evict_lru(&mut self) {
        if let Some((&lru_key, _)) = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_access)
        {
            if let Some(entry) = self.entries.remove(&lru_key) {
                self.total_cost = self.total_cost.saturating_sub(entry.cost);
                self.evictions += 1;
                tracing::trace!(
                    record_id = %lru_key.record_id,
                    display_edge = lru_key.display_edge,
                    cost = entry.cost,
                    total_cost = self.total_cost,
                    "Evicted thumbnail"
                );
            }
        }
    }

    fn remove_record(&mut self, record_id: RecordId) -> usize {
        let keys: Vec<CacheKey> = self
            .entries
            .keys()
            .filter(|key| key.record_id == record_id)
            .copied()
            .collect();
        for key in &keys {
            if let Some(entry) = self.entries.remove(key) {
                self.total_cost = self.total_cost.saturating_sub(entry.cost);
            }
        }
        keys.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.total_cost = 0;
    }
}

type Flight = Arc<OnceCell<Option<Arc<Thumbnail>>>>;

pub struct ArtifactCache {
    source: Arc<dyn BlobSource>,
    limits: CacheLimits,
    lru: Mutex<Lru>,
    inflight: Mutex<HashMap<CacheKey, Flight>>,
    decodes: AtomicU64,
}

impl ArtifactCache {
    pub fn new(source: Arc<dyn BlobSource>, limits: CacheLimits) -> Self {
        Self {
            source,
            limits,
            lru: Mutex::new(Lru::default()),
            inflight: Mutex::new(HashMap::new()),
            decodes: AtomicU64::new(0),
        }
    }

    pub fn with_default_limits(source: Arc<dyn BlobSource>) -> Self {
        Self::new(source, CacheLimits::default())
    }

    /// The thumbnail of `record_id` for a `display_edge`-point slot.
    ///
    /// Returns `None` when the record has no image or its bytes cannot be
    /// decoded; the failure is logged, not propagated.
    pub async fn get(&self, record_id: RecordId, display_edge: u32) -> Option<Arc<Thumbnail>> {
        let key = CacheKey::new(record_id, display_edge);
        if let Some(hit) = self.lru.lock().get(&key) {
            return Some(hit);
        }

        let flight = Arc::clone(self.inflight.lock().entry(key).or_default());
        let result = flight.get_or_init(|| self.load(key)).await.clone();

        let mut inflight = self.inflight.lock();
        if inflight
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(current, &flight))
        {
            inflight.remove(&key);
        }
        result
    }

    async fn load(&self, key: CacheKey) -> Option<Arc<Thumbnail>> {
        match self.decode(key).await {
            Ok(thumbnail) => {
                let thumbnail = Arc::new(thumbnail);
                let retained = self
                    .lru
                    .lock()
                    .insert(key, Arc::clone(&thumbnail), &self.limits);
                if !retained {
                    tracing::debug!(
                        record_id = %key.record_id,
                        cost = thumbnail.cost(),
                        "Thumbnail exceeds cache ceiling, not retained"
                    );
                }
                Some(thumbnail)
            }
            Err(err) => {
                tracing::warn!(
                    record_id = %key.record_id,
                    display_edge = key.display_edge,
                    error = %err,
                    "Failed to decode thumbnail"
                );
                None
            }
        }
    }

    async fn decode(&self, key: CacheKey) -> Result<Thumbnail, CacheDecodeError> {
        let bytes = self
            .source
            .load_blob(key.record_id)
            .await
            .map_err(|e| CacheDecodeError::Load(e.to_string()))?
            .ok_or(CacheDecodeError::Missing)?;

        self.decodes.fetch_add(1, Ordering::Relaxed);
        let display_edge = key.display_edge;
        let thumbnail =
            tokio::task::spawn_blocking(move || decode_thumbnail(&bytes, display_edge)).await??;
        Ok(thumbnail)
    }

    /// Drop every cached size of a record.
    pub fn invalidate(&self, record_id: RecordId) {
        let removed = self.lru.lock().remove_record(record_id);
        if removed > 0 {
            tracing::debug!(%record_id, removed, "Invalidated thumbnails");
        }
    }

    pub fn clear(&self) {
        self.lru.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        let lru = self.lru.lock();
        CacheStats {
            entries: lru.entries.len(),
            cost: lru.total_cost,
            hits: lru.hits,
            misses: lru.misses,
            evictions: lru.evictions,
            decodes: self.decodes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thumb(side: u32) -> Arc<Thumbnail> {
        Arc::new(Thumbnail::new(RgbaImage::new(side, side)))
    }

    fn key(record_id: RecordId) -> CacheKey {
        CacheKey::new(record_id, 64)
    }

    #[test]
    fn test_count_ceiling_evicts_oldest() {
        let limits = CacheLimits {
            max_entries: 2,
            max_cost: usize::MAX,
        };
        let mut lru = Lru::default();
        let (a, b, c) = (RecordId::new(), RecordId::new(), RecordId::new());
        lru.insert(key(a), thumb(2), &limits);
        lru.insert(key(b), thumb(2), &limits);
        lru.insert(key(c), thumb(2), &limits);

        assert_eq!(lru.entries.len(), 2);
        assert!(!lru.entries.contains_key(&key(a)));
        assert_eq!(lru.evictions, 1);
    }

    #[test]
    fn test_touch_protects_from_eviction() {
        let limits = CacheLimits {
            max_entries: 2,
            max_cost: usize::MAX,
        };
        let mut lru = Lru::default();
        let (a, b, c) = (RecordId::new(), RecordId::new(), RecordId::new());
        lru.insert(key(a), thumb(2), &limits);
        lru.insert(key(b), thumb(2), &limits);
        assert!(lru.get(&key(a)).is_some());
        lru.insert(key(c), thumb(2), &limits);

        assert!(lru.entries.contains_key(&key(a)));
        assert!(!lru.entries.contains_key(&key(b)));
        assert!(lru.entries.contains_key(&key(c)));
    }

    #[test]
    fn test_cost_ceiling_evicts_until_it_fits() {
        // Each 4x4 RGBA thumbnail costs 64 bytes.
        let limits = CacheLimits {
            max_entries: 100,
            max_cost: 150,
        };
        let mut lru = Lru::default();
        let ids: Vec<RecordId> = (0..3).map(|_| RecordId::new()).collect();
        for id in &ids {
            lru.insert(key(*id), thumb(4), &limits);
        }
        assert_eq!(lru.entries.len(), 2);
        assert_eq!(lru.total_cost, 128);
        assert!(!lru.entries.contains_key(&key(ids[0])));
    }

    #[test]
    fn test_oversized_entry_not_retained() {
        let limits = CacheLimits {
            max_entries: 10,
            max_cost: 100,
        };
        let mut lru = Lru::default();
        let small = RecordId::new();
        lru.insert(key(small), thumb(2), &limits);
        assert!(!lru.insert(key(RecordId::new()), thumb(16), &limits));
        assert_eq!(lru.entries.len(), 1);
        assert!(lru.entries.contains_key(&key(small)));
    }

    #[test]
    fn test_reinsert_replaces_cost() {
        let limits = CacheLimits::default();
        let mut lru = Lru::default();
        let id = RecordId::new();
        lru.insert(key(id), thumb(4), &limits);
        lru.insert(key(id), thumb(2), &limits);
        assert_eq!(lru.entries.len(), 1);
        assert_eq!(lru.total_cost, 16);
    }

    #[test]
    fn test_remove_record_drops_all_sizes() {
        let limits = CacheLimits::default();
        let mut lru = Lru::default();
        let (a, b) = (RecordId::new(), RecordId::new());
        lru.insert(CacheKey::new(a, 64), thumb(2), &limits);
        lru.insert(CacheKey::new(a, 128), thumb(2), &limits);
        lru.insert(CacheKey::new(b, 64), thumb(2), &limits);

        assert_eq!(lru.remove_record(a), 2);
        assert_eq!(lru.entries.len(), 1);
        assert_eq!(lru.total_cost, 16);
    }

    #[test]
    fn test_decode_thumbnail_bounds_size() {
        let img = image::DynamicImage::new_rgb8(400, 200);
        let mut bytes = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();

        let small = decode_thumbnail(&bytes, 50).unwrap();
        assert_eq!((small.width(), small.height()), (100, 50));

        // Never upscaled.
        let large = decode_thumbnail(&bytes, 1000).unwrap();
        assert_eq!((large.width(), large.height()), (400, 200));

        assert!(decode_thumbnail(b"not an image", 50).is_err());
    }
}
