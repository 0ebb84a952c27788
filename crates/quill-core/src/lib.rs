//! # quill-core
//!
//! Core types for the quill AI job coordination layer.
//!
//! This crate provides the job data model, the typed failure taxonomy,
//! the shared error type and the centralized defaults that `quill-jobs`
//! builds on.

pub mod defaults;
pub mod error;
pub mod events;
pub mod models;
pub mod taxonomy;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use events::EventBus;
pub use models::*;
pub use taxonomy::*;
pub use uuid_utils::{is_v7, new_v7};
