//! In-memory store.
//!
//! Backs the test suites and `type = "memory"` deployments that want the
//! store-dependent features (login reload, tag transactions, backfill)
//! without a database file. Contents die with the process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ember_core::{Event, Room, Store, StoreError, TagUpdate, User};
use std::collections::BTreeMap;
use std::sync::RwLock;

#[derive(Default)]
struct Inner {
    users: BTreeMap<String, User>,
    rooms: BTreeMap<String, Room>,
    /// Events per room in append order.
    events: BTreeMap<String, Vec<Event>>,
}

/// A store that forgets everything on restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn store_user(&self, user: &User) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner.users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn get_user(&self, id: &str) -> Result<User, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner.users.get(id).cloned().ok_or(StoreError::NotFound)
    }

    async fn get_users(&self) -> Result<Vec<User>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner.users.values().cloned().collect())
    }

    async fn update_user_tags(
        &self,
        id: &str,
        updates: &[TagUpdate],
    ) -> Result<Vec<bool>, StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let user = inner.users.get_mut(id).ok_or(StoreError::NotFound)?;
        Ok(ember_filter::update_tags(&mut user.tags, updates))
    }

    async fn delete_user(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner.users.remove(id);
        Ok(())
    }

    async fn store_room(&self, room: &Room) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner.rooms.insert(room.id.clone(), room.clone());
        Ok(())
    }

    async fn get_room(&self, id: &str) -> Result<Room, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner.rooms.get(id).cloned().ok_or(StoreError::NotFound)
    }

    async fn get_rooms(&self) -> Result<Vec<Room>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner.rooms.values().cloned().collect())
    }

    async fn update_room_tags(
        &self,
        id: &str,
        updates: &[TagUpdate],
    ) -> Result<Vec<bool>, StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let room = inner.rooms.get_mut(id).ok_or(StoreError::NotFound)?;
        Ok(ember_filter::update_tags(&mut room.tags, updates))
    }

    async fn delete_room(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner.rooms.remove(id);
        Ok(())
    }

    async fn store_events(&self, room: &Room, events: &[Event]) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let log = inner.events.entry(room.id.clone()).or_default();
        for event in events {
            if log.iter().any(|stored| stored.id == event.id) {
                continue;
            }
            log.push(event.clone());
        }
        Ok(())
    }

    async fn get_event_history(
        &self,
        room: &Room,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        let log = inner.events.get(&room.id).cloned().unwrap_or_default();
        let mut matching: Vec<Event> = log
            .into_iter()
            .filter(|event| event.created >= from && event.created < to)
            .collect();
        // Newest first; `created` keeps sub-second precision in memory, so
        // it already is the total order.
        matching.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|mut event| {
                event.history = true;
                event
            })
            .collect())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::event::kind;
    use ember_core::{Source, Tags};

    fn room() -> Room {
        Room::new("default", User::new("admin", "admin"))
    }

    fn chat(room: &Room, n: usize) -> Event {
        let mut tags = Tags::new();
        tags.insert("message".into(), n.to_string());
        Event::new(
            room.clone(),
            Source::client(User::new("alice", "alice")),
            "",
            "en",
            kind::CHAT,
            tags,
        )
    }

    #[tokio::test]
    async fn not_found_is_distinct() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get_user("ghost").await,
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            store.get_room("ghost").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn last_n_events_newest_first() {
        let store = MemoryStore::new();
        let room = room();
        let events: Vec<Event> = (0..5).map(|n| chat(&room, n)).collect();
        store.store_events(&room, &events).await.unwrap();

        let history = store
            .get_event_history(
                &room,
                DateTime::UNIX_EPOCH,
                Utc::now() + chrono::Duration::minutes(1),
                0,
                3,
            )
            .await
            .unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].tags["message"], "4");
        assert_eq!(history[2].tags["message"], "2");
        assert!(history.iter().all(|e| e.history));
    }

    #[tokio::test]
    async fn delete_removes_records() {
        let store = MemoryStore::new();
        store.store_user(&User::new("alice", "Alice")).await.unwrap();
        store.store_room(&room()).await.unwrap();

        store.delete_user("alice").await.unwrap();
        store.delete_room("default").await.unwrap();
        assert!(store.get_user("alice").await.is_err());
        assert!(store.get_room("default").await.is_err());

        // Deleting something absent is not an error.
        store.delete_user("alice").await.unwrap();
    }

    #[tokio::test]
    async fn update_tags_round_trip() {
        let store = MemoryStore::new();
        let mut user = User::new("alice", "Alice");
        user.tags.insert("n".into(), "1".into());
        store.store_user(&user).await.unwrap();

        let applied = store
            .update_user_tags(
                "alice",
                &[TagUpdate {
                    name: "n".into(),
                    kind: ember_core::TagKind::Int,
                    index: 0,
                    expression: r#"AsInt(Tags["n"]) + 1"#.into(),
                }],
            )
            .await
            .unwrap();
        assert_eq!(applied, [true]);
        assert_eq!(store.get_user("alice").await.unwrap().tags["n"], "2");
    }
}
