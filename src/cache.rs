//! A bounded, optionally expiring cache of pending values.

use std::{
    any::{self, Any, TypeId},
    collections::{BTreeMap, HashMap},
    fmt::{self, Debug, Formatter},
    hash::{Hash, Hasher},
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::debug;

trait ErasedKey: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn eq_erased(&self, other: &dyn ErasedKey) -> bool;
    fn hash_erased(&self, state: &mut dyn Hasher);
    fn type_name(&self) -> &'static str;
}

impl<T: Hash + Eq + Send + Sync + 'static> ErasedKey for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_erased(&self, other: &dyn ErasedKey) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .map_or(false, |other| self == other)
    }

    fn hash_erased(&self, mut state: &mut dyn Hasher) {
        TypeId::of::<T>().hash(&mut state);
        self.hash(&mut state);
    }

    fn type_name(&self) -> &'static str {
        any::type_name::<T>()
    }
}

/// The key a value is stored under in a [`TaskCache`].
///
/// A `CacheKey` erases the type of the key it wraps, but not its identity:
/// two keys are only equal if they have the same type *and* compare equal,
/// so the string `"1"` and the integer `1` never collide, even in the same
/// cache.
#[derive(Clone)]
pub struct CacheKey(Arc<dyn ErasedKey>);

impl CacheKey {
    pub fn new<T: Hash + Eq + Send + Sync + 'static>(key: T) -> Self {
        CacheKey(Arc::new(key))
    }

    /// Get the wrapped key back, if it has type `T`.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        (*self.0).as_any().downcast_ref()
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        (*self.0).eq_erased(&*other.0)
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (*self.0).hash_erased(state)
    }
}

impl Debug for CacheKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheKey")
            .field(&(*self.0).type_name())
            .finish()
    }
}

#[derive(Debug)]
struct Entry<T> {
    value: T,
    last_access: Instant,
    // Position of this entry in the recency index
    stamp: u64,
}

#[derive(Debug)]
struct Entries<T> {
    map: HashMap<CacheKey, Entry<T>>,

    // Least recently accessed first. Stamps are an ever-increasing counter;
    // a u64 won't run out.
    recency: BTreeMap<u64, CacheKey>,
    next_stamp: u64,
}

impl<T> Entries<T> {
    fn stamp(&mut self) -> u64 {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        stamp
    }

    fn remove(&mut self, key: &CacheKey) -> Option<T> {
        let entry = self.map.remove(key)?;
        self.recency.remove(&entry.stamp);
        Some(entry.value)
    }

    fn push(&mut self, key: CacheKey, value: T, now: Instant) {
        let stamp = self.stamp();
        self.recency.insert(stamp, key.clone());
        self.map.insert(
            key,
            Entry {
                value,
                last_access: now,
                stamp,
            },
        );
    }
}

/// A fixed-capacity map from [`CacheKey`] to values, usually [`Promise`]s.
///
/// - Once full, adding an entry evicts the least recently accessed one.
/// - With a non-zero sliding expiration, an entry that hasn't been accessed
///   for that long is treated as absent and purged when it's next seen.
///
/// All operations take `&self`; the cache is safe to share between threads.
///
/// [`Promise`]: crate::Promise
pub struct TaskCache<T> {
    capacity: usize,
    sliding_expiration: Duration,
    entries: Mutex<Entries<T>>,
}

impl<T> Debug for TaskCache<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCache")
            .field("capacity", &self.capacity)
            .field("sliding_expiration", &self.sliding_expiration)
            .field("entries", &self.entries.lock().map.len())
            .finish()
    }
}

impl<T> TaskCache<T> {
    /// The maximum number of entries.
    #[inline]
    pub fn size(&self) -> usize {
        self.capacity
    }

    /// Remove the entry for `key`. Returns true if there was one; removing an
    /// absent key is a no-op.
    pub fn remove(&self, key: &CacheKey) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.map.clear();
        entries.recency.clear();
    }
}

impl<T: Clone> TaskCache<T> {
    /// Create a cache holding at most `capacity` entries. A capacity of 0 is
    /// treated as 1. A `sliding_expiration` of zero means entries never
    /// expire.
    pub fn new(capacity: usize, sliding_expiration: Duration) -> Self {
        let capacity = capacity.max(1);

        Self {
            capacity,
            sliding_expiration,
            entries: Mutex::new(Entries {
                map: HashMap::with_capacity(capacity.min(1024)),
                recency: BTreeMap::new(),
                next_stamp: 0,
            }),
        }
    }

    /// The number of live entries. Expired entries are purged first.
    pub fn usage(&self) -> usize {
        let mut entries = self.entries.lock();
        self.purge_expired(&mut entries, Instant::now());
        entries.map.len()
    }

    fn is_expired(&self, entry: &Entry<T>, now: Instant) -> bool {
        !self.sliding_expiration.is_zero()
            && now.saturating_duration_since(entry.last_access) >= self.sliding_expiration
    }

    fn purge_expired(&self, entries: &mut Entries<T>, now: Instant) {
        if self.sliding_expiration.is_zero() {
            return;
        }

        let expired: Vec<CacheKey> = entries
            .map
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now))
            .map(|(key, _)| key.clone())
            .collect();

        if !expired.is_empty() {
            debug!(count = expired.len(), "purging expired cache entries");
        }

        for key in expired {
            entries.remove(&key);
        }
    }

    fn evict_to_capacity(&self, entries: &mut Entries<T>, now: Instant) {
        if entries.map.len() < self.capacity {
            return;
        }

        self.purge_expired(entries, now);

        while entries.map.len() >= self.capacity {
            let Some((_, key)) = entries.recency.pop_first() else {
                break;
            };
            debug!(?key, "evicting least recently used cache entry");
            entries.map.remove(&key);
        }
    }

    /// Add `value` under `key`, unless a live entry already exists. Returns
    /// true if the value was added.
    pub fn try_add(&self, key: CacheKey, value: T) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.map.get(&key) {
            if !self.is_expired(entry, now) {
                return false;
            }
            entries.remove(&key);
        }

        self.evict_to_capacity(&mut entries, now);
        entries.push(key, value, now);
        true
    }

    /// Add `value` under `key`, replacing any existing entry.
    pub fn insert(&self, key: CacheKey, value: T) {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        entries.remove(&key);
        self.evict_to_capacity(&mut entries, now);
        entries.push(key, value, now);
    }

    /// Look up `key`. A hit refreshes the entry's access time and makes it
    /// the most recently used entry.
    pub fn try_get(&self, key: &CacheKey) -> Option<T> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let stamp = entries.stamp();
        let entries = &mut *entries;

        let entry = entries.map.get_mut(key)?;
        if self.is_expired(entry, now) {
            debug!(?key, "cache entry expired");
            entries.remove(key);
            return None;
        }

        let previous = std::mem::replace(&mut entry.stamp, stamp);
        entry.last_access = now;
        let value = entry.value.clone();

        entries.recency.remove(&previous);
        entries.recency.insert(stamp, key.clone());
        Some(value)
    }

    /// Remove the entry for `key` only if `predicate` accepts its value.
    pub fn remove_if(&self, key: &CacheKey, predicate: impl FnOnce(&T) -> bool) -> bool {
        let mut entries = self.entries.lock();

        match entries.map.get(key) {
            Some(entry) if predicate(&entry.value) => entries.remove(key).is_some(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheKey, TaskCache};
    use crate::Promise;
    use std::{thread::sleep, time::Duration};

    fn key(name: &'static str) -> CacheKey {
        CacheKey::new(name)
    }

    #[test]
    fn keys_of_different_types_never_collide() {
        assert_ne!(CacheKey::new("1"), CacheKey::new(1i32));
        assert_ne!(CacheKey::new(1i64), CacheKey::new(1i32));
        assert_eq!(CacheKey::new(String::from("a")), CacheKey::new(String::from("a")));

        let cache = TaskCache::new(10, Duration::ZERO);
        assert!(cache.try_add(CacheKey::new("1"), "string"));
        assert!(cache.try_add(CacheKey::new(1i32), "integer"));

        assert_eq!(cache.usage(), 2);
        assert_eq!(cache.try_get(&CacheKey::new("1")), Some("string"));
        assert_eq!(cache.try_get(&CacheKey::new(1i32)), Some("integer"));
    }

    #[test]
    fn downcast_recovers_the_key() {
        let key = CacheKey::new(42u8);

        assert_eq!(key.downcast_ref::<u8>(), Some(&42));
        assert_eq!(key.downcast_ref::<u16>(), None);
    }

    #[test]
    fn zero_capacity_is_one() {
        let cache: TaskCache<i32> = TaskCache::new(0, Duration::ZERO);
        assert_eq!(cache.size(), 1);

        assert!(cache.try_add(key("a"), 1));
        assert!(cache.try_add(key("b"), 2));
        assert_eq!(cache.usage(), 1);
        assert_eq!(cache.try_get(&key("b")), Some(2));
    }

    #[test]
    fn try_add_never_overwrites() {
        let cache = TaskCache::new(10, Duration::ZERO);
        let first = Promise::resolved("first");

        assert!(cache.try_add(key("k"), first.clone()));
        assert!(!cache.try_add(key("k"), Promise::resolved("second")));

        let found = cache.try_get(&key("k")).unwrap();
        assert!(found.ptr_eq(&first));
    }

    #[test]
    fn insert_overwrites() {
        let cache = TaskCache::new(10, Duration::ZERO);

        cache.insert(key("k"), 1);
        cache.insert(key("k"), 2);

        assert_eq!(cache.usage(), 1);
        assert_eq!(cache.try_get(&key("k")), Some(2));
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache = TaskCache::new(10, Duration::ZERO);

        for i in 0..10 {
            assert!(cache.try_add(CacheKey::new(i), i));
        }

        // Touch 0, so that 1 and 2 are now the oldest
        assert_eq!(cache.try_get(&CacheKey::new(0)), Some(0));

        assert!(cache.try_add(CacheKey::new(10), 10));
        assert!(cache.try_add(CacheKey::new(11), 11));

        assert_eq!(cache.usage(), 10);
        assert_eq!(cache.try_get(&CacheKey::new(0)), Some(0));
        assert_eq!(cache.try_get(&CacheKey::new(1)), None);
        assert_eq!(cache.try_get(&CacheKey::new(2)), None);
        assert_eq!(cache.try_get(&CacheKey::new(11)), Some(11));
    }

    #[test]
    fn sliding_expiration_purges_idle_entries() {
        let cache = TaskCache::new(10, Duration::from_millis(100));

        assert!(cache.try_add(key("a"), 1));
        sleep(Duration::from_millis(300));

        assert_eq!(cache.try_get(&key("a")), None);
        assert_eq!(cache.usage(), 0);
    }

    #[test]
    fn access_slides_the_expiration() {
        let cache = TaskCache::new(10, Duration::from_millis(200));

        assert!(cache.try_add(key("a"), 1));
        for _ in 0..4 {
            sleep(Duration::from_millis(80));
            assert_eq!(cache.try_get(&key("a")), Some(1));
        }
    }

    #[test]
    fn expired_entries_can_be_replaced() {
        let cache = TaskCache::new(10, Duration::from_millis(50));

        assert!(cache.try_add(key("a"), 1));
        sleep(Duration::from_millis(100));

        assert!(cache.try_add(key("a"), 2));
        assert_eq!(cache.try_get(&key("a")), Some(2));
    }

    #[test]
    fn remove_is_idempotent() {
        let cache = TaskCache::new(10, Duration::ZERO);

        cache.insert(key("a"), 1);
        assert!(cache.remove(&key("a")));
        assert!(!cache.remove(&key("a")));
        assert_eq!(cache.usage(), 0);
    }

    #[test]
    fn remove_if_checks_the_value() {
        let cache = TaskCache::new(10, Duration::ZERO);

        cache.insert(key("a"), 1);
        assert!(!cache.remove_if(&key("a"), |value| *value == 2));
        assert!(cache.remove_if(&key("a"), |value| *value == 1));
        assert_eq!(cache.usage(), 0);
    }

    #[test]
    fn clear_empties_the_cache() {
        let cache = TaskCache::new(10, Duration::ZERO);

        cache.insert(key("a"), 1);
        cache.insert(key("b"), 2);
        cache.clear();

        assert_eq!(cache.usage(), 0);
        assert_eq!(cache.try_get(&key("a")), None);
    }
}
