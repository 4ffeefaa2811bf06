//! Abstract persistence port.
//!
//! Concrete backends live in `ember-storage`; the hub only ever sees this
//! trait. A missing store at boot is allowed — the hub then operates in
//! memory-only mode and serves one default room.

use crate::event::Event;
use crate::model::{Room, TagUpdate, User};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested record does not exist. Consumers interpret this as
    /// "create if applicable" — it is not a backend failure.
    #[error("record not found")]
    NotFound,

    /// Anything the backend could not do.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }
}

/// Operations every durable store must provide.
///
/// `store_*` upserts by primary key. `update_*_tags` runs its
/// read-modify-write inside a transaction so concurrent updates do not lose
/// writes. `store_events` is atomic across the supplied batch.
#[async_trait]
pub trait Store: Send + Sync {
    async fn store_user(&self, user: &User) -> Result<(), StoreError>;
    async fn get_user(&self, id: &str) -> Result<User, StoreError>;
    async fn get_users(&self) -> Result<Vec<User>, StoreError>;
    async fn update_user_tags(
        &self,
        id: &str,
        updates: &[TagUpdate],
    ) -> Result<Vec<bool>, StoreError>;
    async fn delete_user(&self, id: &str) -> Result<(), StoreError>;

    async fn store_room(&self, room: &Room) -> Result<(), StoreError>;
    async fn get_room(&self, id: &str) -> Result<Room, StoreError>;
    async fn get_rooms(&self) -> Result<Vec<Room>, StoreError>;
    async fn update_room_tags(
        &self,
        id: &str,
        updates: &[TagUpdate],
    ) -> Result<Vec<bool>, StoreError>;
    async fn delete_room(&self, id: &str) -> Result<(), StoreError>;

    /// Persist a batch of events atomically. Events already present (by id)
    /// are left untouched.
    async fn store_events(&self, room: &Room, events: &[Event]) -> Result<(), StoreError>;

    /// Range scan over `[from, to)` ordered by `created` descending, then by
    /// a backend tiebreaker so events within the same second keep a total
    /// order. Every returned event has `history = true`.
    async fn get_event_history(
        &self,
        room: &Room,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError>;

    async fn close(&self) -> Result<(), StoreError>;
}
