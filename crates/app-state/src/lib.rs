//! Preference-driven UI state for the emoji release demo
//!
//! This crate turns the raw preference store into typed preference streams,
//! combines them into a single UI state, and shares that state between
//! observers with an idle grace window before the store is released.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod app;
pub mod repository;
pub mod shared_state;
#[cfg(test)]
pub(crate) mod test_utils;
pub mod view_model;

pub use app::{AppConfig, AppError, EmojiReleaseApplication};
pub use repository::{RepositoryError, UserPreferencesRepository};
pub use shared_state::{SharedState, SharingPolicy, SharingStatus, StateSubscription};
pub use view_model::{
    EmojiReleaseUiState, EmojiScreenViewModel, LayoutIcon, RetryConfig, ViewModelConfig,
};
