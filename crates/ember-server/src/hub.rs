//! The per-room coordinator.
//!
//! One hub task owns each room: it registers and unregisters sessions, fans
//! events out to matching clients, commits batches to the history ring and
//! the durable store, drives plugin cron schedules and supervises the
//! long-lived reverse streams.

use crate::config::Config;
use crate::cron::CronSpec;
use crate::metrics;
use crate::session::Client;
use ember_core::event::kind;
use ember_core::{Event, HistoryRing, Room, Source, Store, Tags, User};
use ember_filter::{compile, evaluate_plugin_gate, evaluate_target, Program, Recipient};
use ember_plugin::PluginHandle;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Maximum inbound websocket frame size in bytes.
pub const MAX_MESSAGE_SIZE: usize = ember_protocol::MAX_INBOUND_FRAME;
/// How long the reader waits for traffic (pongs included) before giving up.
pub const PONG_WAIT: Duration = Duration::from_secs(120);
/// Ping cadence; must stay strictly below [`PONG_WAIT`].
pub const PING_PERIOD: Duration = Duration::from_secs(60);
/// Per-frame write deadline.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

const BROADCAST_CHANNEL_SIZE: usize = 1000;
const HISTORY_CHANNEL_SIZE: usize = 1000;
const REVERSE_STREAM_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// A configured, connected plugin as the hubs see it.
#[derive(Clone)]
pub struct PluginSpec {
    pub name: String,
    pub handle: PluginHandle,
    /// Empty when the plugin declared no schedule.
    pub cron_spec: String,
    /// Gating expression; `None` passes every event.
    pub event_filter: Option<Program>,
}

/// The process-wide plugin set, shared by every hub.
pub type PluginMap = Arc<HashMap<String, PluginSpec>>;

/// Register message: the hub signals `ready` once the client is present in
/// its set, and the connection handler blocks on it before pushing initial
/// events.
pub struct Registration {
    pub client: Arc<Client>,
    pub ready: oneshot::Sender<()>,
}

/// Receiver halves of the hub's channels, consumed by [`Hub::start`].
pub struct HubChannels {
    register_rx: mpsc::Receiver<Registration>,
    unregister_rx: mpsc::Receiver<u64>,
    broadcast_rx: mpsc::Receiver<Vec<Event>>,
    history_rx: mpsc::Receiver<Vec<Event>>,
}

pub struct Hub {
    room: RwLock<Room>,
    cfg: Arc<Config>,
    store: Option<Arc<dyn Store>>,
    history: HistoryRing,
    clients: RwLock<HashMap<u64, Arc<Client>>>,
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<u64>,
    broadcast_tx: mpsc::Sender<Vec<Event>>,
    history_tx: mpsc::Sender<Vec<Event>>,
    plugins: PluginMap,
}

impl Hub {
    /// Build a hub for `room`. Call [`Hub::bootstrap`] to backfill history,
    /// then [`Hub::start`] with the returned channels.
    pub fn new(
        room: Room,
        cfg: Arc<Config>,
        store: Option<Arc<dyn Store>>,
        plugins: PluginMap,
    ) -> (Arc<Self>, HubChannels) {
        let (register_tx, register_rx) = mpsc::channel(16);
        let (unregister_tx, unregister_rx) = mpsc::channel(16);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_CHANNEL_SIZE);
        let (history_tx, history_rx) = mpsc::channel(HISTORY_CHANNEL_SIZE);
        let hub = Arc::new(Self {
            room: RwLock::new(room),
            history: HistoryRing::new(cfg.history.history_size),
            cfg,
            store,
            clients: RwLock::new(HashMap::new()),
            register_tx,
            unregister_tx,
            broadcast_tx,
            history_tx,
            plugins,
        });
        (
            hub,
            HubChannels {
                register_rx,
                unregister_rx,
                broadcast_rx,
                history_rx,
            },
        )
    }

    /// Backfill the ring with the most recent persisted events,
    /// oldest-first.
    pub async fn bootstrap(&self) {
        let Some(store) = &self.store else { return };
        let room = self.room();
        let until = chrono::Utc::now() + chrono::Duration::minutes(1);
        match store
            .get_event_history(
                &room,
                chrono::DateTime::UNIX_EPOCH,
                until,
                0,
                self.history.capacity(),
            )
            .await
        {
            Ok(mut events) => {
                // The store answers newest-first; the ring wants oldest-first.
                events.reverse();
                self.history.append(&events);
                debug!(room = %room.id, loaded = events.len(), "history backfilled");
            }
            Err(err) => {
                error!(room = %room.id, error = %err, "could not load persisted events");
                metrics::record_store_error();
            }
        }
    }

    /// Spawn the event loop, the cron driver and one reverse-stream
    /// supervisor per plugin.
    pub fn start(self: &Arc<Self>, channels: HubChannels) {
        let hub = Arc::clone(self);
        tokio::spawn(hub.run(channels));

        for spec in self.plugins.values() {
            self.spawn_reverse_stream(spec.clone());
            if spec.cron_spec.is_empty() {
                continue;
            }
            match CronSpec::parse(&spec.cron_spec) {
                Ok(schedule) => self.spawn_cron(spec.clone(), schedule),
                Err(err) => {
                    warn!(plugin = %spec.name, error = %err, "unusable cron spec, skipping");
                }
            }
        }
    }

    /// Current room snapshot.
    #[must_use]
    pub fn room(&self) -> Room {
        self.room.read().expect("room lock poisoned").clone()
    }

    /// Swap the room's tag map (reverse `change_room_tags` keeps the cached
    /// copy in sync with the store).
    pub fn replace_room_tags(&self, tags: Tags) {
        self.room.write().expect("room lock poisoned").tags = tags;
    }

    #[must_use]
    pub fn config(&self) -> &Arc<Config> {
        &self.cfg
    }

    #[must_use]
    pub fn store(&self) -> Option<Arc<dyn Store>> {
        self.store.clone()
    }

    /// Copy of the ring, oldest-first, flagged as history.
    #[must_use]
    pub fn history_snapshot(&self) -> Vec<Event> {
        self.history.snapshot()
    }

    /// Register a session and wait until the hub has it in its client set.
    pub async fn register(&self, client: Arc<Client>) {
        let (ready, registered) = oneshot::channel();
        if self
            .register_tx
            .send(Registration { client, ready })
            .await
            .is_ok()
        {
            let _ = registered.await;
        }
    }

    /// Ask the hub to dismantle a session.
    pub async fn unregister(&self, client_id: u64) {
        let _ = self.unregister_tx.send(client_id).await;
    }

    /// Queue events for delivery to matching clients.
    pub async fn broadcast(&self, events: Vec<Event>) {
        if !events.is_empty() {
            let _ = self.broadcast_tx.send(events).await;
        }
    }

    /// Queue events for the ring and the durable store.
    pub async fn append_history(&self, events: Vec<Event>) {
        if !events.is_empty() {
            let _ = self.history_tx.send(events).await;
        }
    }

    /// Feed events into both delivery and persistence.
    pub async fn handle_events(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        for event in &events {
            metrics::record_events(&event.name, 1);
        }
        self.broadcast(events.clone()).await;
        self.append_history(events).await;
    }

    /// Run the plugin chain over `events`.
    ///
    /// Recursive fixed-point: each plugin not in `skip` sees the events its
    /// gate accepts; whatever it derives re-enters the chain with that
    /// plugin added to `skip`, then lands in [`Hub::handle_events`].
    /// Termination follows from `skip` growing strictly over a finite set.
    pub fn handle_plugins(
        self: Arc<Self>,
        events: Vec<Event>,
        skip: HashSet<String>,
    ) -> BoxFuture<'static, ()> {
        async move {
            if events.is_empty() {
                return;
            }
            for (name, spec) in self.plugins.iter() {
                if skip.contains(name) {
                    continue;
                }
                // Snapshot state before the RPC; no hub lock may be held
                // across a plugin call.
                let room = self.room();
                let pass: Vec<Event> = events
                    .iter()
                    .filter(|event| {
                        evaluate_plugin_gate(
                            spec.event_filter.as_ref(),
                            &room,
                            &event.source,
                            event,
                        )
                    })
                    .cloned()
                    .collect();
                if pass.is_empty() {
                    continue;
                }
                match spec.handle.handle_events(pass).await {
                    Ok(derived) if !derived.is_empty() => {
                        debug!(plugin = %name, derived = derived.len(), "plugin produced events");
                        let mut next_skip = skip.clone();
                        next_skip.insert(name.clone());
                        Arc::clone(&self)
                            .handle_plugins(derived.clone(), next_skip)
                            .await;
                        self.handle_events(derived).await;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(plugin = %name, error = %err, "plugin call failed, dropping events for it");
                        metrics::record_plugin_error(name);
                    }
                }
            }
        }
        .boxed()
    }

    /// Roster snapshot as an `info` event: one tag per connected client,
    /// id mapped to nick. Carries no target filter, so everyone gets it.
    #[must_use]
    pub fn roster_info(&self) -> Event {
        let mut tags = Tags::new();
        {
            let clients = self.clients.read().expect("clients lock poisoned");
            for client in clients.values() {
                let user = client.user();
                tags.insert(user.id, user.nick);
            }
        }
        Event::new(
            self.room(),
            Source::server(User::default()),
            "",
            "",
            kind::INFO,
            tags,
        )
    }

    async fn run(self: Arc<Self>, mut channels: HubChannels) {
        let room_id = self.room().id;
        info!(room = %room_id, "hub running");
        loop {
            tokio::select! {
                Some(registration) = channels.register_rx.recv() => {
                    self.handle_register(registration);
                }
                Some(client_id) = channels.unregister_rx.recv() => {
                    self.handle_unregister(client_id);
                }
                Some(events) = channels.broadcast_rx.recv() => {
                    self.fan_out(events).await;
                }
                Some(events) = channels.history_rx.recv() => {
                    self.commit(events).await;
                }
                else => break,
            }
        }
        info!(room = %room_id, "hub stopped");
    }

    fn handle_register(self: &Arc<Self>, registration: Registration) {
        let Registration { client, ready } = registration;
        debug!(client = client.id(), "register new client");
        {
            let mut clients = self.clients.write().expect("clients lock poisoned");
            clients.insert(client.id(), client);
        }
        let _ = ready.send(());
        metrics::record_connection();
        self.spawn_info_broadcast();
    }

    fn handle_unregister(self: &Arc<Self>, client_id: u64) {
        let removed = {
            let mut clients = self.clients.write().expect("clients lock poisoned");
            clients.remove(&client_id)
        };
        if let Some(client) = removed {
            debug!(client = client_id, "unregister client");
            // Waking the done signal cascades through the session's writer
            // and plugin fan-in; the channels close when the last sender
            // drops with this reference.
            client.shutdown();
            metrics::record_disconnection();
            self.spawn_info_broadcast();
        }
    }

    /// The loop must not send to its own broadcast channel, so roster info
    /// goes out from a task. The snapshot is taken when the task runs, the
    /// same way the client count settles after the change that caused it.
    fn spawn_info_broadcast(self: &Arc<Self>) {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let info = hub.roster_info();
            hub.broadcast(vec![info]).await;
        });
    }

    /// Evaluate each event's filter per client and enqueue the accepted
    /// ones, preserving batch order. Filters compile once per distinct
    /// expression per batch.
    async fn fan_out(&self, events: Vec<Event>) {
        let clients: Vec<Arc<Client>> = {
            let clients = self.clients.read().expect("clients lock poisoned");
            clients.values().cloned().collect()
        };
        if clients.is_empty() {
            return;
        }
        let room = self.room();

        enum Gate {
            Pass,
            Deny,
            Program(Program),
        }
        let mut gates: HashMap<String, Gate> = HashMap::new();
        let mut queues: Vec<Vec<Event>> = vec![Vec::new(); clients.len()];

        for event in events {
            let gate = gates
                .entry(event.target_filter.clone())
                .or_insert_with(|| {
                    if event.target_filter.is_empty() {
                        Gate::Pass
                    } else {
                        match compile(&event.target_filter) {
                            Ok(program) => Gate::Program(program),
                            Err(err) => {
                                warn!(filter = %event.target_filter, error = %err, "could not compile filter");
                                Gate::Deny
                            }
                        }
                    }
                });
            for (client, queue) in clients.iter().zip(queues.iter_mut()) {
                let deliver = match gate {
                    Gate::Pass => true,
                    Gate::Deny => false,
                    Gate::Program(program) => {
                        let (user, language) = client.identity();
                        evaluate_target(
                            Some(&*program),
                            &room,
                            &event.source,
                            Recipient {
                                user: &user,
                                client_language: &language,
                            },
                            &event,
                        )
                    }
                };
                if deliver {
                    queue.push(event.clone());
                }
            }
        }

        for (client, queue) in clients.iter().zip(queues) {
            if !queue.is_empty() {
                client.send_events(queue).await;
            }
        }
    }

    /// Stamp, ring-append and persist one batch. Persistence failure logs
    /// and does not block delivery.
    async fn commit(&self, mut events: Vec<Event>) {
        for event in &mut events {
            event.mark_sent();
        }
        self.history.append(&events);
        metrics::set_history_len(self.history.len());

        if let Some(store) = &self.store {
            let room = self.room();
            if let Err(err) = store.store_events(&room, &events).await {
                error!(room = %room.id, error = %err, "could not persist events");
                metrics::record_store_error();
            }
        }
    }

    fn spawn_cron(self: &Arc<Self>, spec: PluginSpec, schedule: CronSpec) {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                // Wake shortly after each minute boundary; a firing that is
                // still running skips the ticks it covers.
                let now = chrono::Utc::now();
                let wait = 61 - (now.timestamp() % 60) as u64;
                tokio::time::sleep(Duration::from_secs(wait)).await;

                if !schedule.matches(chrono::Utc::now()) {
                    continue;
                }
                let room = hub.room();
                match spec.handle.cron(&room).await {
                    Ok(events) if !events.is_empty() => {
                        debug!(plugin = %spec.name, events = events.len(), "cron produced events");
                        let skip: HashSet<String> = [spec.name.clone()].into();
                        Arc::clone(&hub).handle_plugins(events.clone(), skip).await;
                        hub.handle_events(events).await;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(plugin = %spec.name, error = %err, "cron call failed");
                        metrics::record_plugin_error(&spec.name);
                    }
                }
            }
        });
    }

    /// Keep one reverse stream open per (plugin, room), restarting with
    /// exponential back-off. A stream that survived a while resets the
    /// back-off.
    fn spawn_reverse_stream(self: &Arc<Self>, spec: PluginSpec) {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            loop {
                let room = hub.room();
                let started = std::time::Instant::now();
                match spec.handle.init_emit_events(&room).await {
                    Ok(()) => {
                        debug!(plugin = %spec.name, room = %room.id, "reverse stream ended");
                    }
                    Err(err) => {
                        warn!(plugin = %spec.name, room = %room.id, error = %err, "reverse stream failed");
                        metrics::record_plugin_error(&spec.name);
                    }
                }
                if started.elapsed() > REVERSE_STREAM_MAX_BACKOFF {
                    backoff = Duration::from_secs(1);
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(REVERSE_STREAM_MAX_BACKOFF);
            }
        });
    }
}
