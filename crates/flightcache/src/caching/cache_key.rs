use std::any::{TypeId, type_name};
use std::fmt;
use std::sync::Arc;

use super::CacheError;

/// Longest explicit key accepted by [`CacheKey::explicit`], in bytes.
pub const MAX_EXPLICIT_KEY_LEN: usize = 250;

/// The key under which a value is cached.
///
/// Keys come from two disjoint spaces:
///
/// - *type keys*, derived from a Rust type via [`CacheKey::of`]. Their identity is the
///   [`TypeId`] of the type, so two distinct types never share a key, even if their names
///   happen to be identical.
/// - *explicit keys*, supplied by the caller via [`CacheKey::explicit`]. These are meant for
///   parameterized queries that must not collide with the whole-type entry.
///
/// An explicit key never equals a type key, whatever its text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    inner: KeyInner,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum KeyInner {
    Type {
        id: TypeId,
        // only used for display, the `id` is the identity
        name: &'static str,
    },
    Explicit(Arc<str>),
}

impl CacheKey {
    /// Derives the key for the type `T`.
    ///
    /// This is stable for the lifetime of the process.
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            inner: KeyInner::Type {
                id: TypeId::of::<T>(),
                name: type_name::<T>(),
            },
        }
    }

    /// Creates a key from a caller-supplied string.
    ///
    /// The key is rejected with [`CacheError::InvalidKey`] if it is empty or only whitespace,
    /// longer than [`MAX_EXPLICIT_KEY_LEN`] bytes, or contains control characters.
    pub fn explicit(key: impl Into<String>) -> Result<Self, CacheError> {
        let key = key.into();

        if key.trim().is_empty() {
            return Err(CacheError::InvalidKey("key is empty".into()));
        }
        if key.len() > MAX_EXPLICIT_KEY_LEN {
            return Err(CacheError::InvalidKey(format!(
                "key is {} bytes long, at most {MAX_EXPLICIT_KEY_LEN} are allowed",
                key.len()
            )));
        }
        if key.chars().any(char::is_control) {
            return Err(CacheError::InvalidKey(format!(
                "key {key:?} contains control characters"
            )));
        }

        Ok(Self {
            inner: KeyInner::Explicit(key.into()),
        })
    }

    /// Whether this key was supplied by the caller rather than derived from a type.
    pub fn is_explicit(&self) -> bool {
        matches!(self.inner, KeyInner::Explicit(_))
    }

    /// The text of the key: the caller's string, or the type name for type keys.
    ///
    /// This is meant for logging. Two type keys may have the same name and still differ.
    pub fn name(&self) -> &str {
        match &self.inner {
            KeyInner::Type { name, .. } => name,
            KeyInner::Explicit(key) => key,
        }
    }

    /// A short tag describing the key space, used for metrics.
    pub(crate) fn kind(&self) -> &'static str {
        match self.inner {
            KeyInner::Type { .. } => "type",
            KeyInner::Explicit(_) => "explicit",
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            KeyInner::Type { name, .. } => write!(f, "type:{name}"),
            KeyInner::Explicit(key) => write!(f, "key:{key}"),
        }
    }
}
