//! Storage layer for Emoji Release
//!
//! This crate provides the durable key-value preference store and the typed,
//! immutable preference snapshots it hands out.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod kv;
pub mod preferences;

pub use kv::{
    DataStore, DataStoreExt, KvConfig, KvError, KvStore, SnapshotStream, Transform,
    DEFAULT_TREE_NAME,
};
pub use preferences::{bool_key, MutablePreferences, PreferenceKey, Preferences};
