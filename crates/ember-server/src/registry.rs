//! Process-wide room registry and the reverse-call bridge.
//!
//! One hub per room for the process lifetime. At startup the durable store
//! is scanned; an empty store gets a `default` room owned by the configured
//! admin user with guests allowed. Incoming connections resolve their room
//! here; plugins' reverse calls are routed here too.

use crate::auth;
use crate::config::Config;
use crate::hub::{Hub, PluginMap};
use async_trait::async_trait;
use dashmap::DashMap;
use ember_core::model::TAG_ALLOW_GUESTS;
use ember_core::{Event, Room, Store, Tags, User};
use ember_plugin::HostCallbacks;
use ember_protocol::rpc::{Call, Reply};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Room ids match `^[a-z][a-z0-9_-]+$`.
#[must_use]
pub fn valid_room_id(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_lowercase() {
        return false;
    }
    let mut rest = 0;
    for c in chars {
        if !(c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-') {
            return false;
        }
        rest += 1;
    }
    rest >= 1
}

/// Map from room id to its hub.
#[derive(Default)]
pub struct Registry {
    hubs: DashMap<String, Arc<Hub>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn get(&self, room_id: &str) -> Option<Arc<Hub>> {
        self.hubs.get(room_id).map(|entry| Arc::clone(&entry))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.hubs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hubs.is_empty()
    }

    /// Scan the store (or fall back to the memory-only default room) and
    /// spawn one hub per room.
    ///
    /// # Errors
    ///
    /// Fails when the store is reachable but cannot answer the scan or
    /// persist the default room; that is a startup failure.
    pub async fn bootstrap(
        self: &Arc<Self>,
        cfg: Arc<Config>,
        store: Option<Arc<dyn Store>>,
        plugins: PluginMap,
    ) -> anyhow::Result<()> {
        let rooms = match &store {
            Some(store) => {
                let mut rooms = store.get_rooms().await?;
                if rooms.is_empty() {
                    let room = default_room(&cfg, Some(store.clone())).await?;
                    store.store_room(&room).await?;
                    rooms = vec![room];
                }
                rooms
            }
            None => vec![default_room(&cfg, None).await?],
        };

        for room in rooms {
            info!(room = %room.id, "creating hub");
            let (hub, channels) = Hub::new(room.clone(), Arc::clone(&cfg), store.clone(), Arc::clone(&plugins));
            hub.bootstrap().await;
            hub.start(channels);
            self.hubs.insert(room.id, hub);
        }
        Ok(())
    }
}

/// The first-start room: owned by the admin user, guests welcome.
async fn default_room(
    cfg: &Config,
    store: Option<Arc<dyn Store>>,
) -> anyhow::Result<Room> {
    let mut admin = User::new(&cfg.admin_user, &cfg.admin_user);
    admin.language = "en".to_string();

    if let Some(store) = store {
        match store.get_user(&cfg.admin_user).await {
            Ok(existing) => admin = existing,
            Err(err) if err.is_not_found() => store.store_user(&admin).await?,
            Err(err) => return Err(err.into()),
        }
    }

    let mut tags = Tags::new();
    tags.insert(TAG_ALLOW_GUESTS.to_string(), "true".to_string());
    Ok(Room {
        id: "default".to_string(),
        owner: admin,
        tags,
    })
}

/// Serves the reverse endpoint plugins call back into: event reinjection,
/// lookups, authentication and tag mutations.
pub struct HostBridge {
    registry: Arc<Registry>,
    store: Option<Arc<dyn Store>>,
    cfg: Arc<Config>,
}

impl HostBridge {
    #[must_use]
    pub fn new(registry: Arc<Registry>, store: Option<Arc<dyn Store>>, cfg: Arc<Config>) -> Self {
        Self {
            registry,
            store,
            cfg,
        }
    }

    /// Route plugin-emitted events into their rooms' pipelines, with the
    /// emitting plugin excluded from the chain re-run.
    async fn emit_events(&self, plugin_name: &str, events: Vec<Event>) -> Reply {
        let mut by_room: HashMap<String, Vec<Event>> = HashMap::new();
        for event in events {
            by_room.entry(event.room.id.clone()).or_default().push(event);
        }
        for (room_id, batch) in by_room {
            let Some(hub) = self.registry.get(&room_id) else {
                warn!(plugin = plugin_name, room = %room_id, "emitted events for unknown room");
                continue;
            };
            let skip: HashSet<String> = [plugin_name.to_string()].into();
            Arc::clone(&hub).handle_plugins(batch.clone(), skip).await;
            hub.handle_events(batch).await;
        }
        Reply::Ack
    }

    async fn authenticate_user(&self, id_token: &str, provider: &str) -> Reply {
        let user_id = match auth::authenticate(id_token, provider, &self.cfg.oidc).await {
            Ok(user_id) => user_id,
            Err(err) => return Reply::error(err),
        };
        let mut user = User::new(&user_id, &user_id);
        if !user_id.is_empty() {
            if let Some(store) = &self.store {
                match store.get_user(&user_id).await {
                    Ok(found) => user = found,
                    Err(err) if err.is_not_found() => {}
                    Err(err) => return Reply::error(err),
                }
            }
        }
        Reply::User { user }
    }

    async fn change_room_tags(
        &self,
        id: &str,
        updates: Vec<ember_core::TagUpdate>,
    ) -> Reply {
        let Some(store) = &self.store else {
            return Reply::error("no store configured");
        };
        let applied = match store.update_room_tags(id, &updates).await {
            Ok(applied) => applied,
            Err(err) => return Reply::error(err),
        };
        // Keep the hub's cached room in sync with what the store now holds.
        if let Some(hub) = self.registry.get(id) {
            match store.get_room(id).await {
                Ok(room) => hub.replace_room_tags(room.tags),
                Err(err) => warn!(room = id, error = %err, "could not refresh room tags"),
            }
        }
        Reply::TagsChanged { applied }
    }
}

#[async_trait]
impl HostCallbacks for HostBridge {
    async fn handle(&self, plugin_name: &str, call: Call) -> Reply {
        debug!(plugin = plugin_name, "reverse call");
        match call {
            Call::EmitEvents { events } => self.emit_events(plugin_name, events).await,
            Call::AuthenticateUser { id_token, provider } => {
                self.authenticate_user(&id_token, &provider).await
            }
            Call::GetUser { id } => match &self.store {
                Some(store) => match store.get_user(&id).await {
                    Ok(user) => Reply::User { user },
                    Err(err) => Reply::error(err),
                },
                None => Reply::error("no store configured"),
            },
            Call::GetRoom { id } => match &self.store {
                Some(store) => match store.get_room(&id).await {
                    Ok(room) => Reply::Room { room },
                    Err(err) => Reply::error(err),
                },
                None => Reply::error("no store configured"),
            },
            Call::ChangeUserTags { id, updates } => match &self.store {
                Some(store) => match store.update_user_tags(&id, &updates).await {
                    Ok(applied) => Reply::TagsChanged { applied },
                    Err(err) => Reply::error(err),
                },
                None => Reply::error("no store configured"),
            },
            Call::ChangeRoomTags { id, updates } => self.change_room_tags(&id, updates).await,
            other => {
                warn!(plugin = plugin_name, call = ?other, "unexpected call on the reverse endpoint");
                Reply::error("not a reverse call")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_id_pattern() {
        assert!(valid_room_id("default"));
        assert!(valid_room_id("room-2_x"));
        assert!(!valid_room_id(""));
        assert!(!valid_room_id("a")); // needs at least two characters
        assert!(!valid_room_id("Default"));
        assert!(!valid_room_id("2room"));
        assert!(!valid_room_id("room!"));
    }

    #[tokio::test]
    async fn bootstrap_without_store_serves_default() {
        let registry = Registry::new();
        let cfg = Arc::new(Config::default());
        registry
            .bootstrap(cfg, None, Arc::new(HashMap::new()))
            .await
            .unwrap();
        assert_eq!(registry.len(), 1);

        let hub = registry.get("default").unwrap();
        let room = hub.room();
        assert_eq!(room.owner.id, "admin");
        assert!(room.allows_guests());
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn bootstrap_persists_the_default_room() {
        let registry = Registry::new();
        let cfg = Arc::new(Config::default());
        let store: Arc<dyn Store> = Arc::new(ember_storage::MemoryStore::new());
        registry
            .bootstrap(cfg, Some(store.clone()), Arc::new(HashMap::new()))
            .await
            .unwrap();

        let stored = store.get_room("default").await.unwrap();
        assert!(stored.allows_guests());
        assert_eq!(store.get_user("admin").await.unwrap().nick, "admin");
    }
}
