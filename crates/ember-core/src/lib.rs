//! # ember-core
//!
//! Core types for the Ember realtime chat engine.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Event** - The uniform transport record with content-hash identity
//! - **User / Room / Source** - Identity records embedded in every event
//! - **HistoryRing** - Bounded per-room buffer of recent events
//! - **Store** - The abstract persistence port backends implement
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Session   │────▶│     Hub     │────▶│ HistoryRing │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │
//!                            ▼
//!                     ┌─────────────┐
//!                     │    Store    │
//!                     └─────────────┘
//! ```

pub mod event;
pub mod history;
pub mod model;
pub mod store;

pub use event::Event;
pub use history::{HistoryRing, DEFAULT_HISTORY_SIZE};
pub use model::{Room, Source, TagKind, TagUpdate, Tags, User};
pub use store::{Store, StoreError};
