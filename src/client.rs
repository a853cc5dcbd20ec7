//! `SyncClient` – single owner of every engine component.
//!
//! The host feeds it three things, all on one task:
//!
//! ```text
//! receive_frame(bytes, now)   inbound frame, decoded and handled in order
//! tick(now)                   timers: teardown, poof, selection, grace
//! intents (move_to, say, …)   player actions, sent through the channel
//! ```
//!
//! and drains [`ClientEvent`]s after each call. UI threads that only need
//! connection/queue/selection state read the shared [`UiState`] handle
//! instead of the client itself.

use crate::channel::{MethodChannel, ServerHandler, Transport};
use crate::connection::{AccountApi, ConnectionManager, ConnectionState, JoinTicket};
use crate::context::{EntityInfo, SessionContext};
use crate::error::{JoinError, ProtocolError};
use crate::events::ClientEvent;
use crate::protocol::{
    CharacterEntry, ClientCall, FriendEntry, LeaveReason, Notification, PartyMember, ServerMessage,
};
use crate::replication::WorldSync;
use crate::subscription::{Observer, SubscriptionHandle, SubscriptionMux, SubscriptionRequest};
use crate::types::{EntityId, SyncConfig, TileType, Vec2};
use crate::world::WorldModel;
use log::{debug, info};
use parking_lot::RwLock;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;

/// Identifies one live keyed value on the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub collection: String,
    pub key: String,
}

impl SubscriptionKey {
    pub fn new(collection: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
        }
    }
}

/// Snapshot of the state a UI layer polls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UiState {
    pub connection: ConnectionState,
    pub queue_position: u32,
    pub player_id: Option<EntityId>,
    pub selected: Option<EntityId>,
    pub notifications: usize,
}

pub type SharedUiState = Arc<RwLock<UiState>>;

#[derive(Debug)]
pub struct SyncClient {
    channel: MethodChannel,
    connection: ConnectionManager,
    sync: WorldSync,
    context: SessionContext,
    subscriptions: SubscriptionMux<SubscriptionKey, serde_json::Value>,
    ui: SharedUiState,
    notifications: BTreeMap<u32, Notification>,
    party: Vec<PartyMember>,
    characters: Vec<CharacterEntry>,
    friends: BTreeMap<String, FriendEntry>,
    character_id: Option<String>,
    events: VecDeque<ClientEvent>,
}

impl SyncClient {
    pub fn new(config: SyncConfig) -> Result<Self, ProtocolError> {
        Ok(Self {
            channel: MethodChannel::new()?,
            connection: ConnectionManager::new(config.clone()),
            subscriptions: SubscriptionMux::new(config.teardown_grace()),
            sync: WorldSync::new(config),
            context: SessionContext::new(),
            ui: Arc::new(RwLock::new(UiState::default())),
            notifications: BTreeMap::new(),
            party: Vec::new(),
            characters: Vec::new(),
            friends: BTreeMap::new(),
            character_id: None,
            events: VecDeque::new(),
        })
    }

    /// Replace the connection manager (e.g. one without transport support).
    pub fn with_connection(mut self, connection: ConnectionManager) -> Self {
        self.connection = connection;
        self
    }

    // -----------------------------------------------------------------------
    // Read access
    // -----------------------------------------------------------------------

    pub fn world(&self) -> &WorldModel {
        self.sync.world()
    }

    pub fn sync(&self) -> &WorldSync {
        &self.sync
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn ui_state(&self) -> SharedUiState {
        self.ui.clone()
    }

    pub fn notifications(&self) -> impl Iterator<Item = &Notification> {
        self.notifications.values()
    }

    pub fn party(&self) -> &[PartyMember] {
        &self.party
    }

    pub fn characters(&self) -> &[CharacterEntry] {
        &self.characters
    }

    pub fn friends(&self) -> impl Iterator<Item = &FriendEntry> {
        self.friends.values()
    }

    pub fn character_id(&self) -> Option<&str> {
        self.character_id.as_deref()
    }

    pub fn value(&self, collection: &str, key: &str) -> Option<&serde_json::Value> {
        self.subscriptions
            .value(&SubscriptionKey::new(collection, key))
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        self.connection.is_stale(now)
    }

    pub fn drain_events(&mut self) -> Vec<ClientEvent> {
        self.events.drain(..).collect()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub async fn join<A: AccountApi>(
        &mut self,
        api: &mut A,
        character_id: &str,
    ) -> Result<JoinTicket, JoinError> {
        let result = self.connection.join(api, character_id).await;
        if result.is_ok() {
            self.character_id = Some(character_id.to_string());
        }
        self.flush();
        result
    }

    /// Attach an open transport. Any previous session state is dropped and
    /// live keyed subscriptions are re-sent.
    pub fn connect(&mut self, transport: Box<dyn Transport>, now: Instant) {
        self.channel.attach(transport);
        self.sync.reset();
        self.context = SessionContext::new();
        self.connection.transport_opened(now);
        self.subscriptions.resubscribe_all();
        self.flush();
    }

    /// The transport closed underneath us.
    pub fn transport_closed(&mut self, now: Instant) {
        self.channel.detach();
        self.connection.disconnected(now);
        self.flush();
    }

    /// Leave the session. Tells the server if it can still hear us.
    pub fn leave(&mut self, reason: LeaveReason) {
        self.channel.call(&ClientCall::Leave);
        self.end_session(reason);
    }

    fn end_session(&mut self, reason: LeaveReason) {
        self.channel.detach();
        self.connection.leave(reason);
        self.reset_session();
        self.flush();
    }

    fn reset_session(&mut self) {
        self.sync.reset();
        self.subscriptions.cancel_timers();
        self.context = SessionContext::new();
        self.notifications.clear();
        self.party.clear();
    }

    // -----------------------------------------------------------------------
    // Driving
    // -----------------------------------------------------------------------

    /// Handle one inbound frame. Bad frames are dropped.
    pub fn receive_frame(&mut self, frame: &[u8], now: Instant) {
        self.connection.packet_received(now);
        if let Some(message) = self.channel.receive(frame) {
            self.handle(message, now);
        }
        self.flush();
    }

    pub fn tick(&mut self, now: Instant) {
        self.sync.tick(now);
        self.subscriptions.tick(now);
        if let Some(reason) = self.connection.tick(now) {
            info!("Session timed out ({})", reason);
            self.channel.detach();
            self.reset_session();
        }
        self.flush();
    }

    /// Send queued outbound calls and collect events.
    fn flush(&mut self) {
        for call in self.sync.drain_outbound() {
            self.channel.call(&call);
        }
        for request in self.subscriptions.drain_requests() {
            let call = match request {
                SubscriptionRequest::Subscribe(k) => ClientCall::Subscribe {
                    collection: k.collection,
                    key: k.key,
                },
                SubscriptionRequest::Unsubscribe(k) => ClientCall::Unsubscribe {
                    collection: k.collection,
                    key: k.key,
                },
            };
            self.channel.call(&call);
        }
        self.events
            .extend(self.connection.drain_events().into_iter().map(ClientEvent::from));
        self.events
            .extend(self.sync.drain_events().into_iter().map(ClientEvent::from));
        self.publish_ui();
    }

    fn publish_ui(&self) {
        let mut ui = self.ui.write();
        ui.connection = self.connection.state();
        ui.queue_position = self.connection.queue_position();
        ui.player_id = self.sync.world().player_id();
        ui.selected = self.sync.selected();
        ui.notifications = self.notifications.len();
    }

    // -----------------------------------------------------------------------
    // Player intents
    // -----------------------------------------------------------------------

    /// Predict the move locally and send the encoded delta.
    pub fn move_to(&mut self, position: Vec2, velocity: Vec2, encoded: Vec<u8>, now: Instant) {
        self.sync.move_player(position, velocity, now);
        self.channel.call(&ClientCall::Move { data: encoded });
        self.flush();
    }

    pub fn action(&mut self, code: u8) -> bool {
        self.channel.call(&ClientCall::Action { code })
    }

    pub fn interact(&mut self, entity: EntityId) -> bool {
        self.channel.call(&ClientCall::Interact { entity })
    }

    pub fn say(&mut self, target: EntityId, text: &str, chat_type: u8) -> bool {
        self.channel.call(&ClientCall::Say {
            target,
            text: text.to_string(),
            chat_type,
        })
    }

    pub fn change_tile(&mut self, x: i32, y: i32, tile: TileType) -> bool {
        self.channel.call(&ClientCall::ChangeTile { x, y, tile })
    }

    pub fn select(&mut self, id: Option<EntityId>) {
        self.sync.select(id);
        self.flush();
    }

    pub fn set_local_facing(&mut self, facing_right: bool) {
        self.sync.set_local_facing(facing_right);
        self.flush();
    }

    pub fn set_local_head_turned(&mut self, head_turned: bool) {
        self.sync.set_local_head_turned(head_turned);
        self.flush();
    }

    pub fn set_local_posture(&mut self, posture: u8) {
        self.sync.set_local_posture(posture);
        self.flush();
    }

    // -----------------------------------------------------------------------
    // Keyed subscriptions
    // -----------------------------------------------------------------------

    pub fn subscribe(
        &mut self,
        collection: &str,
        key: &str,
        observer: impl Observer<serde_json::Value> + 'static,
    ) -> SubscriptionHandle {
        let handle = self
            .subscriptions
            .subscribe(SubscriptionKey::new(collection, key), observer);
        self.flush();
        handle
    }

    pub fn unsubscribe(&mut self, handle: SubscriptionHandle, now: Instant) -> bool {
        let removed = self.subscriptions.unsubscribe(handle, now);
        self.flush();
        removed
    }

    pub fn wait_for(
        &mut self,
        collection: &str,
        key: &str,
        now: Instant,
    ) -> oneshot::Receiver<serde_json::Value> {
        let rx = self
            .subscriptions
            .wait_for(SubscriptionKey::new(collection, key), now);
        self.flush();
        rx
    }
}

impl ServerHandler for SyncClient {
    fn handle(&mut self, message: ServerMessage, now: Instant) {
        match message {
            ServerMessage::Queue { position } => self.connection.queue(position),
            ServerMessage::WorldState { state, initial } => {
                self.context.apply_world_state(state, initial);
                self.events.push_back(ClientEvent::SessionChanged);
            }
            ServerMessage::MapState { info, state } => {
                self.context.apply_map_state(info, state);
                self.events.push_back(ClientEvent::SessionChanged);
            }
            ServerMessage::MapUpdate { state } => {
                self.context.apply_map_update(state);
                self.events.push_back(ClientEvent::SessionChanged);
            }
            ServerMessage::MyEntity {
                id,
                name,
                info,
                character_id,
                crc,
            } => {
                info!("Playing as entity {} ({})", id, name);
                self.context.remember_entity(
                    id,
                    EntityInfo {
                        name,
                        crc,
                        name_bad: false,
                    },
                );
                self.context.set_player_info(info);
                self.character_id = Some(character_id);
                self.sync.set_player(id);
                self.connection.handshake_complete(id);
            }
            ServerMessage::Update {
                unsubscribes,
                subscribes,
                updates,
                regions,
                says,
            } => self
                .sync
                .apply_update(&unsubscribes, &subscribes, &updates, &regions, &says, now),
            ServerMessage::FixPosition { x, y, safe } => self.sync.fix_position(x, y, safe, now),
            ServerMessage::Left { reason } => {
                info!("Server ended session: {}", reason);
                self.end_session(reason);
            }
            ServerMessage::AddNotification(n) => {
                self.notifications.insert(n.id, n.clone());
                self.events.push_back(ClientEvent::NotificationAdded(n));
            }
            ServerMessage::RemoveNotification { id } => {
                if self.notifications.remove(&id).is_some() {
                    self.events.push_back(ClientEvent::NotificationRemoved { id });
                }
            }
            ServerMessage::UpdateSelection { current, new } => {
                self.sync.update_selection(current, new)
            }
            ServerMessage::UpdateParty { members } => {
                self.party = members;
                self.events.push_back(ClientEvent::PartyChanged);
            }
            ServerMessage::UpdatePonies { characters } => {
                for c in characters {
                    match self.characters.iter_mut().find(|e| e.id == c.id) {
                        Some(existing) => *existing = c,
                        None => self.characters.push(c),
                    }
                }
                self.events.push_back(ClientEvent::CharactersChanged);
            }
            ServerMessage::UpdateFriends {
                friends,
                remove_missing,
            } => {
                if remove_missing {
                    self.friends
                        .retain(|id, _| friends.iter().any(|f| &f.account_id == id));
                }
                for f in friends {
                    self.friends.insert(f.account_id.clone(), f);
                }
                self.events.push_back(ClientEvent::FriendsChanged);
            }
            ServerMessage::EntityInfo {
                id,
                name,
                crc,
                name_bad,
            } => {
                self.context
                    .remember_entity(id, EntityInfo { name, crc, name_bad });
                self.sync.entity_info_resolved(id);
            }
            ServerMessage::SubscribedValue {
                collection,
                key,
                value,
            } => {
                let k = SubscriptionKey::new(collection, key);
                if self.subscriptions.update(&k, value) {
                    self.events.push_back(ClientEvent::ValueChanged {
                        collection: k.collection,
                        key: k.key,
                    });
                } else {
                    debug!("Value for {}/{} arrived after unsubscribe", k.collection, k.key);
                }
            }
        }
    }
}
