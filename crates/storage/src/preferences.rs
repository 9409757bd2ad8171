//! Typed preference keys and immutable preference snapshots
//!
//! A [`Preferences`] value is a complete, read-only view of every stored
//! preference at one instant. Changes are made on a [`MutablePreferences`]
//! edit buffer, which is frozen back into a new snapshot.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// A typed key naming one stored preference
///
/// # Example
///
/// ```rust
/// use storage::preferences::{PreferenceKey, Preferences};
///
/// const IS_DARK_THEME: PreferenceKey<bool> = PreferenceKey::new("is_dark_theme");
///
/// let mut edit = Preferences::empty().to_mutable();
/// edit.set(&IS_DARK_THEME, true);
/// let prefs = edit.freeze();
/// assert_eq!(prefs.get(&IS_DARK_THEME), Some(true));
/// ```
pub struct PreferenceKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PreferenceKey<T> {
    /// Create a key with the given stored name
    pub const fn new(name: &'static str) -> Self {
        Self { name, _marker: PhantomData }
    }

    /// The name this key is stored under
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for PreferenceKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PreferenceKey<T> {}

impl<T> PartialEq for PreferenceKey<T> {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl<T> Eq for PreferenceKey<T> {}

impl<T> fmt::Debug for PreferenceKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PreferenceKey").field(&self.name).finish()
    }
}

impl<T> fmt::Display for PreferenceKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Create a boolean preference key
pub const fn bool_key(name: &'static str) -> PreferenceKey<bool> {
    PreferenceKey::new(name)
}

/// Immutable snapshot of all stored preferences
///
/// Cloning is cheap; the entries are shared. A snapshot is never modified
/// after it has been built.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Preferences {
    entries: Arc<BTreeMap<String, Value>>,
}

impl Preferences {
    /// The empty snapshot, used as the fallback when storage can't be read
    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn from_entries(entries: BTreeMap<String, Value>) -> Self {
        Self { entries: Arc::new(entries) }
    }

    /// Get a typed value
    ///
    /// Returns `None` when the key is absent or the stored value doesn't
    /// decode as `T`.
    pub fn get<T>(&self, key: &PreferenceKey<T>) -> Option<T>
    where
        T: DeserializeOwned,
    {
        self.entries
            .get(key.name())
            .and_then(|value| T::deserialize(value).ok())
    }

    /// Get the raw stored value by name
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.entries.get(name)
    }

    /// Check if a key is present
    pub fn contains<T>(&self, key: &PreferenceKey<T>) -> bool {
        self.entries.contains_key(key.name())
    }

    /// Number of stored preferences
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the snapshot holds no preferences
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(name, value)` pairs in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Start an edit from this snapshot
    pub fn to_mutable(&self) -> MutablePreferences {
        MutablePreferences { entries: (*self.entries).clone() }
    }
}

/// Edit buffer for building a new [`Preferences`] snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutablePreferences {
    entries: BTreeMap<String, Value>,
}

impl MutablePreferences {
    /// Get a typed value from the buffer
    pub fn get<T>(&self, key: &PreferenceKey<T>) -> Option<T>
    where
        T: DeserializeOwned,
    {
        self.entries
            .get(key.name())
            .and_then(|value| T::deserialize(value).ok())
    }

    /// Set a value
    pub fn set<T>(&mut self, key: &PreferenceKey<T>, value: T) -> &mut Self
    where
        T: Into<Value>,
    {
        self.entries.insert(key.name().to_string(), value.into());
        self
    }

    /// Remove a value, returning whether it was present
    pub fn remove<T>(&mut self, key: &PreferenceKey<T>) -> bool {
        self.entries.remove(key.name()).is_some()
    }

    /// Remove every value
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Freeze the buffer into an immutable snapshot
    pub fn freeze(self) -> Preferences {
        Preferences::from_entries(self.entries)
    }
}
