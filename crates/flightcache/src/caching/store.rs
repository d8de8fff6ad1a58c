use std::any::{Any, type_name};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::{CacheError, CacheKey};

/// A cached value of unknown type.
pub type ErasedValue = Arc<dyn Any + Send + Sync>;

/// A cached value together with its key, expiration time and version.
///
/// Entries are immutable. The value is shared behind an [`Arc`], so handing out clones of an
/// entry never exposes the store's own copy to mutation.
pub struct CacheEntry<T: ?Sized = dyn Any + Send + Sync> {
    key: CacheKey,
    value: Arc<T>,
    expires_at: Instant,
    version: u64,
}

impl<T: ?Sized> CacheEntry<T> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn value(&self) -> &Arc<T> {
        &self.value
    }

    pub fn into_value(self) -> Arc<T> {
        self.value
    }

    /// The instant after which this entry is treated as absent.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// The version of this entry.
    ///
    /// Versions strictly increase with every population and invalidation, so a caller holding
    /// on to an entry can detect that it was superseded.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

impl CacheEntry {
    /// Recovers the concrete type of the cached value.
    pub fn downcast<T: Any + Send + Sync>(self) -> Result<CacheEntry<T>, CacheError> {
        let Self {
            key,
            value,
            expires_at,
            version,
        } = self;

        match value.downcast::<T>() {
            Ok(value) => Ok(CacheEntry {
                key,
                value,
                expires_at,
                version,
            }),
            Err(_) => Err(CacheError::TypeMismatch {
                key: key.to_string(),
                expected: type_name::<T>(),
            }),
        }
    }
}

// Not derived, as that would require `T: Clone`.
impl<T: ?Sized> Clone for CacheEntry<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            value: Arc::clone(&self.value),
            expires_at: self.expires_at,
            version: self.version,
        }
    }
}

impl<T: ?Sized> fmt::Debug for CacheEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("expires_at", &self.expires_at)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// A struct implementing [`moka::Expiry`] that uses the [`CacheEntry`] [`Instant`] as the explicit
/// expiration time.
struct EntryExpiration;

/// Returns the duration between the `current_time` and `target_time` in the future.
/// In case the `target_time` is already elapsed (it is in the past relative to `current_time`), this
/// will return `Some(ZERO)`.
fn saturating_duration_since(current_time: Instant, target_time: Instant) -> Option<Duration> {
    Some(
        target_time
            .checked_duration_since(current_time)
            .unwrap_or_default(),
    )
}

impl moka::Expiry<CacheKey, CacheEntry> for EntryExpiration {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &CacheEntry,
        current_time: Instant,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.expires_at)
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &CacheEntry,
        current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.expires_at)
    }
}

/// Adds `ttl` to `now`, clamping TTLs too large to be represented.
fn deadline(now: Instant, ttl: Duration) -> Instant {
    // About a century, which `Instant` can represent on every supported platform.
    const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

    now.checked_add(ttl.min(MAX_TTL))
        .unwrap_or_else(|| now + Duration::from_secs(u32::MAX.into()))
}

/// The in-memory store holding all cache entries.
///
/// Expired entries are treated as absent as soon as their deadline passes, and are physically
/// removed by the backing [`moka`] cache at some later point.
pub struct EntryStore {
    entries: moka::sync::Cache<CacheKey, CacheEntry>,
    versions: AtomicU64,
}

impl EntryStore {
    /// Creates a new store, optionally bounded to `max_entries`.
    ///
    /// Without a bound, entries only leave the store when they expire or are removed.
    pub fn new(max_entries: Option<u64>) -> Self {
        let mut builder =
            moka::sync::Cache::<CacheKey, CacheEntry>::builder().expire_after(EntryExpiration);
        if let Some(max_entries) = max_entries {
            builder = builder.max_capacity(max_entries);
        }

        Self {
            entries: builder.build(),
            versions: AtomicU64::new(0),
        }
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns the entry under `key`, unless it is missing or expired.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.get(key)?;
        if entry.is_expired_at(Instant::now()) {
            return None;
        }
        Some(entry)
    }

    /// Stores `value` under `key` for `ttl`, superseding any previous entry.
    pub fn put(&self, key: CacheKey, value: ErasedValue, ttl: Duration) -> CacheEntry {
        let entry = CacheEntry {
            key: key.clone(),
            value,
            expires_at: deadline(Instant::now(), ttl),
            version: self.next_version(),
        };
        self.entries.insert(key, entry.clone());
        entry
    }

    /// Removes the entry under `key`, if any.
    ///
    /// This consumes a version even if no entry existed, so a later population is always
    /// newer than anything observed before the removal.
    pub fn remove(&self, key: &CacheKey) {
        self.next_version();
        self.entries.invalidate(key);
    }

    /// Returns the version of the live entry under `key`.
    pub fn version_of(&self, key: &CacheKey) -> Option<u64> {
        self.get(key).map(|entry| entry.version)
    }

    /// Removes all entries.
    pub fn clear(&self) {
        self.next_version();
        self.entries.invalidate_all();
    }

    /// An approximate count of the entries, which may include expired ones.
    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }
}

impl fmt::Debug for EntryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryStore")
            .field("entries", &self.entries.entry_count())
            .field("version", &self.versions.load(Ordering::Relaxed))
            .finish()
    }
}
