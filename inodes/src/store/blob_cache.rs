//! Bounded in-memory cache of immutable blob contents.
//!
//! Blobs are retained by three mechanisms:
//!
//!  - a total byte budget, evicting least-recently-used entries first,
//!  - a short recency window: the most recently accessed entries are kept
//!    even when they blow the byte budget, so one huge blob being actively
//!    read is not thrashed out,
//!  - outstanding [BlobInterestHandle]s with [Interest::WantHandle], which
//!    pin their entry until dropped.
//!
//! The cache is process-global state, shared across mounts; interest
//! handles are the unit of sharing.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{Blob, ObjectId};

/// How long the requester expects to care about a blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interest {
    /// Admit the blob, but it may be evicted as soon as the requester
    /// releases its handle.
    UnlikelyNeededAgain,
    /// Keep the blob at least until the returned handle drops.
    WantHandle,
    /// Normal retention under the byte budget.
    LikelyNeededAgain,
}

struct CacheItem {
    blob: Arc<Blob>,
    /// Outstanding WantHandle pins.
    pins: usize,
}

#[derive(Default)]
struct CacheState {
    items: HashMap<ObjectId, CacheItem>,
    /// Recency order, oldest at the front. Each id appears exactly once.
    order: VecDeque<ObjectId>,
    total_bytes: u64,
}

impl CacheState {
    fn touch(&mut self, id: &ObjectId) {
        self.order.retain(|o| o != id);
        self.order.push_back(id.clone());
    }

    fn evict_id(&mut self, id: &ObjectId) {
        if let Some(item) = self.items.remove(id) {
            self.total_bytes -= item.blob.len();
            self.order.retain(|o| o != id);
        }
    }
}

/// See the module documentation.
pub struct BlobCache {
    state: Mutex<CacheState>,
    max_bytes: u64,
    recent_window: usize,
}

/// Result of a cache lookup: the blob on a hit, plus the handle expressing
/// the caller's interest. On a miss the caller fetches from the object
/// store and [inserts](BlobCache::insert) the result.
pub struct CacheLookup {
    pub blob: Option<Arc<Blob>>,
    pub handle: BlobInterestHandle,
}

impl BlobCache {
    pub fn new(max_bytes: u64, recent_window: usize) -> Arc<Self> {
        Arc::new(BlobCache {
            state: Mutex::new(CacheState::default()),
            max_bytes,
            recent_window,
        })
    }

    pub fn get(self: &Arc<Self>, id: &ObjectId, interest: Interest) -> CacheLookup {
        let mut state = self.state.lock();
        match state.items.get_mut(id) {
            Some(item) => {
                if interest == Interest::WantHandle {
                    item.pins += 1;
                }
                let blob = item.blob.clone();
                state.touch(id);
                CacheLookup {
                    blob: Some(blob),
                    handle: BlobInterestHandle {
                        cache: Arc::downgrade(self),
                        id: Some(id.clone()),
                        interest,
                    },
                }
            }
            None => CacheLookup {
                blob: None,
                handle: BlobInterestHandle::empty(),
            },
        }
    }

    /// Admits a freshly fetched blob and returns a handle for it.
    pub fn insert(
        self: &Arc<Self>,
        id: ObjectId,
        blob: Arc<Blob>,
        interest: Interest,
    ) -> BlobInterestHandle {
        let mut state = self.state.lock();
        let pins = usize::from(interest == Interest::WantHandle);
        match state.items.get_mut(&id) {
            Some(item) => item.pins += pins,
            None => {
                state.total_bytes += blob.len();
                state.items.insert(id.clone(), CacheItem { blob, pins });
            }
        }
        state.touch(&id);
        self.evict_excess(&mut state);
        BlobInterestHandle {
            cache: Arc::downgrade(self),
            id: Some(id),
            interest,
        }
    }

    fn release(&self, id: &ObjectId, interest: Interest) {
        let mut state = self.state.lock();
        match interest {
            Interest::WantHandle => {
                if let Some(item) = state.items.get_mut(id) {
                    item.pins = item.pins.saturating_sub(1);
                }
                self.evict_excess(&mut state);
            }
            Interest::UnlikelyNeededAgain => {
                let unpinned = state.items.get(id).is_some_and(|item| item.pins == 0);
                if unpinned {
                    state.evict_id(id);
                }
            }
            Interest::LikelyNeededAgain => {}
        }
    }

    fn evict_excess(&self, state: &mut CacheState) {
        let mut idx = 0;
        while state.total_bytes > self.max_bytes {
            // The newest recent_window entries stay even over budget.
            let evictable = state.order.len().saturating_sub(self.recent_window);
            if idx >= evictable {
                break;
            }
            let id = state.order[idx].clone();
            if state.items.get(&id).is_some_and(|item| item.pins > 0) {
                idx += 1;
                continue;
            }
            state.evict_id(&id);
        }
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.state.lock().items.contains_key(id)
    }

    pub fn total_bytes(&self) -> u64 {
        self.state.lock().total_bytes
    }
}

/// Scoped token extending the retention of a cached blob.
///
/// Dropping the handle releases the interest; for
/// [Interest::UnlikelyNeededAgain] that makes the entry immediately
/// evictable.
pub struct BlobInterestHandle {
    cache: Weak<BlobCache>,
    id: Option<ObjectId>,
    interest: Interest,
}

impl BlobInterestHandle {
    /// A handle referring to nothing; dropping it is a no-op.
    pub fn empty() -> Self {
        BlobInterestHandle {
            cache: Weak::new(),
            id: None,
            interest: Interest::LikelyNeededAgain,
        }
    }

    /// Re-reads the referenced blob from the cache, if it is still there.
    pub fn blob(&self) -> Option<Arc<Blob>> {
        let id = self.id.as_ref()?;
        let cache = self.cache.upgrade()?;
        let state = cache.state.lock();
        state.items.get(id).map(|item| item.blob.clone())
    }

    /// Releases the interest before the handle is dropped.
    pub fn reset(&mut self) {
        if let (Some(id), Some(cache)) = (self.id.take(), self.cache.upgrade()) {
            cache.release(&id, self.interest);
        }
        self.id = None;
    }
}

impl Drop for BlobInterestHandle {
    fn drop(&mut self) {
        self.reset();
    }
}

impl Default for BlobInterestHandle {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob_of_size(n: usize) -> Arc<Blob> {
        Arc::new(Blob::new(vec![0u8; n]))
    }

    #[test]
    fn byte_budget_evicts_oldest_first() {
        let cache = BlobCache::new(100, 0);
        cache.insert(ObjectId::from("a"), blob_of_size(60), Interest::LikelyNeededAgain);
        cache.insert(ObjectId::from("b"), blob_of_size(60), Interest::LikelyNeededAgain);
        assert!(!cache.contains(&ObjectId::from("a")));
        assert!(cache.contains(&ObjectId::from("b")));
    }

    #[test]
    fn recent_window_overrides_the_budget() {
        let cache = BlobCache::new(10, 1);
        cache.insert(ObjectId::from("big"), blob_of_size(1000), Interest::LikelyNeededAgain);
        // Over budget, but it's the single most recent entry.
        assert!(cache.contains(&ObjectId::from("big")));

        cache.insert(ObjectId::from("next"), blob_of_size(1000), Interest::LikelyNeededAgain);
        // "big" fell out of the window and gets evicted; "next" is retained.
        assert!(!cache.contains(&ObjectId::from("big")));
        assert!(cache.contains(&ObjectId::from("next")));
    }

    #[test]
    fn want_handle_pins_across_eviction() {
        let cache = BlobCache::new(100, 0);
        let handle = cache.insert(ObjectId::from("pinned"), blob_of_size(80), Interest::WantHandle);
        cache.insert(ObjectId::from("other"), blob_of_size(80), Interest::LikelyNeededAgain);

        // Both are over budget together but the pinned one survives.
        assert!(cache.contains(&ObjectId::from("pinned")));
        assert!(handle.blob().is_some());

        drop(handle);
        cache.insert(ObjectId::from("third"), blob_of_size(80), Interest::LikelyNeededAgain);
        assert!(!cache.contains(&ObjectId::from("pinned")));
    }

    #[test]
    fn unlikely_needed_again_evicts_on_release() {
        let cache = BlobCache::new(1000, 0);
        let handle = cache.insert(
            ObjectId::from("scratch"),
            blob_of_size(10),
            Interest::UnlikelyNeededAgain,
        );
        assert!(cache.contains(&ObjectId::from("scratch")));
        drop(handle);
        assert!(!cache.contains(&ObjectId::from("scratch")));
    }

    #[test]
    fn hits_refresh_recency() {
        let cache = BlobCache::new(100, 0);
        cache.insert(ObjectId::from("a"), blob_of_size(40), Interest::LikelyNeededAgain);
        cache.insert(ObjectId::from("b"), blob_of_size(40), Interest::LikelyNeededAgain);
        // Touch "a" so "b" becomes the eviction candidate.
        assert!(cache.get(&ObjectId::from("a"), Interest::LikelyNeededAgain).blob.is_some());
        cache.insert(ObjectId::from("c"), blob_of_size(40), Interest::LikelyNeededAgain);
        assert!(cache.contains(&ObjectId::from("a")));
        assert!(!cache.contains(&ObjectId::from("b")));
    }
}
