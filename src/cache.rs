use crate::GeneratedImage;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Position-indexed store of generated images.
///
/// Holds at most `max_entries` images. When a write pushes it over, the
/// entries closest to the current scroll position survive and the newest
/// write wins a tie.
#[derive(Debug)]
pub struct ImageCache {
    entries: HashMap<u64, GeneratedImage>,
    preloaded: HashSet<String>,
    max_entries: usize,
    next_seq: u64,
}

impl ImageCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            preloaded: HashSet::new(),
            max_entries,
            next_seq: 0,
        }
    }

    pub fn get(&self, position: u64) -> Option<&GeneratedImage> {
        self.entries.get(&position)
    }

    pub fn contains(&self, position: u64) -> bool {
        self.entries.contains_key(&position)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn is_preloaded(&self, url: &str) -> bool {
        self.preloaded.contains(url)
    }

    pub fn preloaded_len(&self) -> usize {
        self.preloaded.len()
    }

    /// Highest cached feed position.
    pub fn max_position(&self) -> Option<u64> {
        self.entries.keys().copied().max()
    }

    /// Stores `image` at its position, marks its URL preloaded and evicts
    /// down to the limit. Returns the evicted images.
    pub fn put(&mut self, mut image: GeneratedImage, scroll_position: u64) -> Vec<GeneratedImage> {
        image.cached = true;
        image.seq = self.next_seq;
        self.next_seq += 1;

        self.preloaded.insert(image.url.clone());
        if let Some(previous) = self.entries.insert(image.position, image) {
            warn!(
                position = previous.position,
                previous_id = %previous.id,
                "Cache position already occupied, overwriting"
            );
            let still_used = self.entries.values().any(|e| e.url == previous.url);
            if !still_used {
                self.preloaded.remove(&previous.url);
            }
        }

        if self.entries.len() > self.max_entries {
            self.evict(scroll_position)
        } else {
            Vec::new()
        }
    }

    /// Keeps the `max_entries` images nearest to `scroll_position`.
    pub fn evict(&mut self, scroll_position: u64) -> Vec<GeneratedImage> {
        if self.entries.len() <= self.max_entries {
            return Vec::new();
        }

        let mut ranked: Vec<(u64, u64, u64)> = self
            .entries
            .values()
            .map(|e| (e.position.abs_diff(scroll_position), e.seq, e.position))
            .collect();
        ranked.sort_unstable_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

        let evicted: Vec<GeneratedImage> = ranked[self.max_entries..]
            .iter()
            .filter_map(|&(_, _, position)| self.entries.remove(&position))
            .collect();
        for image in &evicted {
            self.preloaded.remove(&image.url);
        }

        debug!(
            evicted = evicted.len(),
            retained = self.entries.len(),
            scroll_position,
            "Evicted distant cache entries"
        );
        evicted
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.preloaded.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn image(position: u64) -> GeneratedImage {
        GeneratedImage {
            id: Uuid::new_v4(),
            url: format!("mem://{position}"),
            prompt: format!("prompt {position}"),
            position,
            cached: false,
            fallback: false,
            created_at: Utc::now(),
            seq: 0,
        }
    }

    #[test]
    fn test_put_and_get() {
        let mut cache = ImageCache::new(10);
        assert!(cache.get(3).is_none());

        cache.put(image(3), 0);

        let stored = cache.get(3).unwrap();
        assert!(stored.cached);
        assert!(cache.is_preloaded("mem://3"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_get_is_idempotent() {
        let mut cache = ImageCache::new(10);
        cache.put(image(1), 0);
        let first = cache.get(1).cloned();
        let second = cache.get(1).cloned();
        assert_eq!(first, second);
    }

    #[test]
    fn test_overwrite_last_writer_wins() {
        let mut cache = ImageCache::new(10);
        cache.put(image(5), 0);
        let mut replacement = image(5);
        replacement.url = "mem://5-b".into();
        cache.put(replacement, 0);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(5).unwrap().url, "mem://5-b");
        assert!(!cache.is_preloaded("mem://5"));
        assert!(cache.is_preloaded("mem://5-b"));
    }

    #[test]
    fn test_eviction_keeps_nearest_to_scroll() {
        let mut cache = ImageCache::new(3);
        for position in [0, 10, 20, 30] {
            cache.put(image(position), 19);
        }

        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(0));
        assert!(cache.contains(10));
        assert!(cache.contains(20));
        assert!(cache.contains(30));
        assert!(!cache.is_preloaded("mem://0"));
    }

    #[test]
    fn test_eviction_tie_prefers_newest() {
        let mut cache = ImageCache::new(2);
        cache.put(image(10), 10);
        cache.put(image(8), 10);
        // 12 ties with 8 at distance 2 and is newer.
        let evicted = cache.put(image(12), 10);

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].position, 8);
        assert!(cache.contains(10));
        assert!(cache.contains(12));
    }

    #[test]
    fn test_size_never_exceeds_limit() {
        let mut cache = ImageCache::new(5);
        for position in 0..50 {
            cache.put(image(position), position / 2);
            assert!(cache.len() <= 5);
        }
        assert_eq!(cache.preloaded_len(), 5);
    }

    #[test]
    fn test_max_position_and_clear() {
        let mut cache = ImageCache::new(10);
        assert_eq!(cache.max_position(), None);
        cache.put(image(4), 0);
        cache.put(image(9), 0);
        assert_eq!(cache.max_position(), Some(9));

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.preloaded_len(), 0);
    }
}
