//! SQLite-backed store.
//!
//! The reference durable backend: users, rooms and events in three tables,
//! tag maps as JSON text, timestamps as unix seconds with a nanosecond
//! tiebreaker column so events created within the same second keep a total
//! order.

use crate::blocking;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ember_core::{Event, Room, Source, Store, StoreError, TagUpdate, Tags, User};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id          TEXT PRIMARY KEY,
    nick        TEXT NOT NULL UNIQUE,
    language    TEXT NOT NULL DEFAULT 'en',
    last_online INTEGER NOT NULL DEFAULT 0,
    tags        TEXT NOT NULL DEFAULT '{}'
);
CREATE TABLE IF NOT EXISTS rooms (
    id       TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    tags     TEXT NOT NULL DEFAULT '{}',
    FOREIGN KEY (owner_id) REFERENCES users (id) ON DELETE CASCADE ON UPDATE CASCADE
);
CREATE TABLE IF NOT EXISTS events (
    id            TEXT PRIMARY KEY,
    room_id       TEXT NOT NULL,
    user_id       TEXT,
    user_nick     TEXT NOT NULL DEFAULT '',
    plugin_name   TEXT NOT NULL DEFAULT '',
    name          TEXT NOT NULL,
    language      TEXT NOT NULL DEFAULT '',
    tags          TEXT NOT NULL DEFAULT '{}',
    target_filter TEXT NOT NULL DEFAULT '',
    created       INTEGER NOT NULL DEFAULT 0,
    created_sort  INTEGER NOT NULL DEFAULT 0,
    sent          INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (room_id) REFERENCES rooms (id) ON DELETE CASCADE ON UPDATE CASCADE,
    FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE SET NULL ON UPDATE CASCADE
);
CREATE INDEX IF NOT EXISTS events_created_idx ON events (created, created_sort);
";

/// Store backed by a single SQLite database file (or `:memory:`).
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (and migrate) the database at `dsn`.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be opened or the schema cannot be
    /// created.
    pub fn open(dsn: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(dsn).map_err(backend)?;
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }
}

fn backend(err: rusqlite::Error) -> StoreError {
    match err {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
        other => StoreError::Backend(other.to_string()),
    }
}

fn tags_to_json(tags: &Tags) -> String {
    serde_json::to_string(tags).unwrap_or_else(|_| "{}".to_string())
}

fn tags_from_json(raw: &str) -> Tags {
    serde_json::from_str(raw).unwrap_or_default()
}

fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

fn ts_with_nanos(secs: i64, nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, nanos.clamp(0, 999_999_999) as u32)
        .unwrap_or(DateTime::UNIX_EPOCH)
}

fn row_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let tags_raw: String = row.get("tags")?;
    Ok(User {
        id: row.get("id")?,
        nick: row.get("nick")?,
        language: row.get("language")?,
        tags: tags_from_json(&tags_raw),
        last_online: ts(row.get("last_online")?),
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn store_user(&self, user: &User) -> Result<(), StoreError> {
        let conn = self.conn();
        let user = user.clone();
        blocking(move || {
            let conn = conn.lock().expect("sqlite lock poisoned");
            conn.execute(
                "INSERT INTO users (id, nick, language, last_online, tags)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (id) DO UPDATE SET
                     nick = excluded.nick,
                     language = excluded.language,
                     last_online = excluded.last_online,
                     tags = excluded.tags",
                params![
                    user.id,
                    user.nick,
                    user.language,
                    user.last_online.timestamp(),
                    tags_to_json(&user.tags),
                ],
            )
            .map_err(backend)?;
            Ok(())
        })
        .await
    }

    async fn get_user(&self, id: &str) -> Result<User, StoreError> {
        let conn = self.conn();
        let id = id.to_string();
        blocking(move || {
            let conn = conn.lock().expect("sqlite lock poisoned");
            conn.query_row(
                "SELECT id, nick, language, last_online, tags FROM users WHERE id = ?1",
                params![id],
                |row| row_user(row),
            )
            .map_err(backend)
        })
        .await
    }

    async fn get_users(&self) -> Result<Vec<User>, StoreError> {
        let conn = self.conn();
        blocking(move || {
            let conn = conn.lock().expect("sqlite lock poisoned");
            let mut stmt = conn
                .prepare("SELECT id, nick, language, last_online, tags FROM users")
                .map_err(backend)?;
            let users = stmt
                .query_map([], |row| row_user(row))
                .map_err(backend)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(backend)?;
            Ok(users)
        })
        .await
    }

    async fn update_user_tags(
        &self,
        id: &str,
        updates: &[TagUpdate],
    ) -> Result<Vec<bool>, StoreError> {
        let conn = self.conn();
        let id = id.to_string();
        let updates = updates.to_vec();
        blocking(move || {
            let mut conn = conn.lock().expect("sqlite lock poisoned");
            let tx = conn.transaction().map_err(backend)?;
            let raw: String = tx
                .query_row("SELECT tags FROM users WHERE id = ?1", params![id], |row| {
                    row.get(0)
                })
                .map_err(backend)?;
            let mut tags = tags_from_json(&raw);
            let applied = ember_filter::update_tags(&mut tags, &updates);
            tx.execute(
                "UPDATE users SET tags = ?1 WHERE id = ?2",
                params![tags_to_json(&tags), id],
            )
            .map_err(backend)?;
            tx.commit().map_err(backend)?;
            Ok(applied)
        })
        .await
    }

    async fn delete_user(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn();
        let id = id.to_string();
        blocking(move || {
            let conn = conn.lock().expect("sqlite lock poisoned");
            conn.execute("DELETE FROM users WHERE id = ?1", params![id])
                .map_err(backend)?;
            Ok(())
        })
        .await
    }

    async fn store_room(&self, room: &Room) -> Result<(), StoreError> {
        let conn = self.conn();
        let room = room.clone();
        blocking(move || {
            let conn = conn.lock().expect("sqlite lock poisoned");
            conn.execute(
                "INSERT INTO rooms (id, owner_id, tags) VALUES (?1, ?2, ?3)
                 ON CONFLICT (id) DO UPDATE SET
                     owner_id = excluded.owner_id,
                     tags = excluded.tags",
                params![room.id, room.owner.id, tags_to_json(&room.tags)],
            )
            .map_err(backend)?;
            Ok(())
        })
        .await
    }

    async fn get_room(&self, id: &str) -> Result<Room, StoreError> {
        let conn = self.conn();
        let id = id.to_string();
        blocking(move || {
            let conn = conn.lock().expect("sqlite lock poisoned");
            conn.query_row(
                "SELECT r.id AS room_id, r.tags AS room_tags,
                        u.id, u.nick, u.language, u.last_online, u.tags
                 FROM rooms AS r INNER JOIN users AS u ON r.owner_id = u.id
                 WHERE r.id = ?1",
                params![id],
                |row| {
                    let room_tags: String = row.get("room_tags")?;
                    Ok(Room {
                        id: row.get("room_id")?,
                        owner: row_user(row)?,
                        tags: tags_from_json(&room_tags),
                    })
                },
            )
            .map_err(backend)
        })
        .await
    }

    async fn get_rooms(&self) -> Result<Vec<Room>, StoreError> {
        let conn = self.conn();
        blocking(move || {
            let conn = conn.lock().expect("sqlite lock poisoned");
            let mut stmt = conn
                .prepare(
                    "SELECT r.id AS room_id, r.tags AS room_tags,
                            u.id, u.nick, u.language, u.last_online, u.tags
                     FROM rooms AS r INNER JOIN users AS u ON r.owner_id = u.id",
                )
                .map_err(backend)?;
            let rooms = stmt
                .query_map([], |row| {
                    let room_tags: String = row.get("room_tags")?;
                    Ok(Room {
                        id: row.get("room_id")?,
                        owner: row_user(row)?,
                        tags: tags_from_json(&room_tags),
                    })
                })
                .map_err(backend)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(backend)?;
            Ok(rooms)
        })
        .await
    }

    async fn update_room_tags(
        &self,
        id: &str,
        updates: &[TagUpdate],
    ) -> Result<Vec<bool>, StoreError> {
        let conn = self.conn();
        let id = id.to_string();
        let updates = updates.to_vec();
        blocking(move || {
            let mut conn = conn.lock().expect("sqlite lock poisoned");
            let tx = conn.transaction().map_err(backend)?;
            let raw: String = tx
                .query_row("SELECT tags FROM rooms WHERE id = ?1", params![id], |row| {
                    row.get(0)
                })
                .map_err(backend)?;
            let mut tags = tags_from_json(&raw);
            let applied = ember_filter::update_tags(&mut tags, &updates);
            tx.execute(
                "UPDATE rooms SET tags = ?1 WHERE id = ?2",
                params![tags_to_json(&tags), id],
            )
            .map_err(backend)?;
            tx.commit().map_err(backend)?;
            Ok(applied)
        })
        .await
    }

    async fn delete_room(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn();
        let id = id.to_string();
        blocking(move || {
            let conn = conn.lock().expect("sqlite lock poisoned");
            conn.execute("DELETE FROM rooms WHERE id = ?1", params![id])
                .map_err(backend)?;
            Ok(())
        })
        .await
    }

    async fn store_events(&self, room: &Room, events: &[Event]) -> Result<(), StoreError> {
        let conn = self.conn();
        let room_id = room.id.clone();
        let events = events.to_vec();
        blocking(move || {
            let mut conn = conn.lock().expect("sqlite lock poisoned");
            let tx = conn.transaction().map_err(backend)?;
            {
                let mut stmt = tx
                    .prepare(
                        "INSERT INTO events (id, room_id, user_id, user_nick, plugin_name,
                                             name, language, tags, target_filter,
                                             created, created_sort, sent)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                         ON CONFLICT (id) DO NOTHING",
                    )
                    .map_err(backend)?;
                for event in &events {
                    let user_id = if event.source.user.id.is_empty() {
                        None
                    } else {
                        Some(event.source.user.id.clone())
                    };
                    stmt.execute(params![
                        event.id,
                        room_id,
                        user_id,
                        event.source.user.nick,
                        event.source.plugin_name,
                        event.name,
                        event.language,
                        tags_to_json(&event.tags),
                        event.target_filter,
                        event.created.timestamp(),
                        event.created.timestamp_subsec_nanos(),
                        event.sent.timestamp(),
                    ])
                    .map_err(backend)?;
                }
            }
            tx.commit().map_err(backend)?;
            Ok(())
        })
        .await
    }

    async fn get_event_history(
        &self,
        room: &Room,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        let conn = self.conn();
        let room = room.clone();
        let (from, to) = (from.timestamp(), to.timestamp());
        blocking(move || {
            let conn = conn.lock().expect("sqlite lock poisoned");
            let mut stmt = conn
                .prepare(
                    "SELECT e.id, e.user_id, e.user_nick, e.plugin_name, e.name,
                            e.language, e.tags, e.target_filter,
                            e.created, e.created_sort, e.sent,
                            u.nick AS u_nick, u.language AS u_language,
                            u.last_online AS u_last_online, u.tags AS u_tags
                     FROM events AS e LEFT JOIN users AS u ON u.id = e.user_id
                     WHERE e.room_id = ?1 AND e.created >= ?2 AND e.created < ?3
                     ORDER BY e.created DESC, e.created_sort DESC
                     LIMIT ?4 OFFSET ?5",
                )
                .map_err(backend)?;
            let events = stmt
                .query_map(
                    params![room.id, from, to, limit as i64, offset as i64],
                    |row| {
                        let user_id: Option<String> = row.get("user_id")?;
                        let stored_nick: String = row.get("user_nick")?;
                        let user = match user_id {
                            Some(id) => {
                                let nick: Option<String> = row.get("u_nick")?;
                                let tags_raw: Option<String> = row.get("u_tags")?;
                                User {
                                    id,
                                    // Guests are not in the users table; their
                                    // nick travels on the event row.
                                    nick: nick.unwrap_or_else(|| stored_nick.clone()),
                                    language: row
                                        .get::<_, Option<String>>("u_language")?
                                        .unwrap_or_default(),
                                    tags: tags_raw
                                        .as_deref()
                                        .map(tags_from_json)
                                        .unwrap_or_default(),
                                    last_online: ts(row
                                        .get::<_, Option<i64>>("u_last_online")?
                                        .unwrap_or(0)),
                                }
                            }
                            None => User {
                                nick: stored_nick,
                                ..User::default()
                            },
                        };
                        let tags_raw: String = row.get("tags")?;
                        Ok(Event {
                            id: row.get("id")?,
                            room: room.clone(),
                            source: Source {
                                user,
                                plugin_name: row.get("plugin_name")?,
                            },
                            created: ts_with_nanos(
                                row.get("created")?,
                                row.get("created_sort")?,
                            ),
                            sent: ts(row.get("sent")?),
                            language: row.get("language")?,
                            name: row.get("name")?,
                            tags: tags_from_json(&tags_raw),
                            history: true,
                            target_filter: row.get("target_filter")?,
                        })
                    },
                )
                .map_err(backend)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(backend)?;
            Ok(events)
        })
        .await
    }

    async fn close(&self) -> Result<(), StoreError> {
        // The connection closes when the last reference drops.
        Ok(())
    }
}
