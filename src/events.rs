//! Semantic events delivered from the engine to the host.
//!
//! The engine never calls into renderers or UI directly. Every observable
//! change is queued as one of these and drained by the host once per tick
//! through [`crate::client::SyncClient::drain_events`].

use crate::protocol::{LeaveReason, Notification};
use crate::types::{EntityId, RegionCoord, TileType};

/// A change to the local world model.
#[derive(Debug, Clone, PartialEq)]
pub enum WorldEvent {
    // ------------------------------------------------------------------
    // Regions
    // ------------------------------------------------------------------
    /// A region snapshot was materialized (or replaced).
    RegionAdded { coord: RegionCoord },
    /// A region and every entity inside it were torn down.
    RegionRemoved { coord: RegionCoord },
    /// A tile changed. The containing region is now dirty.
    TileChanged {
        region: RegionCoord,
        x: i32,
        y: i32,
        tile: TileType,
    },

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------
    EntityAdded { id: EntityId },
    EntityUpdated { id: EntityId },
    /// Region membership changed after a switch-region update.
    EntityMoved {
        id: EntityId,
        from: RegionCoord,
        to: RegionCoord,
    },
    EntityRemoved { id: EntityId },

    /// The local player's entity arrived for the first time this session.
    PlayerReady { id: EntityId },
    /// Authoritative position correction applied to the local player.
    PositionFixed { x: f32, y: f32, safe: bool },

    /// Transient placeholder shown while the new appearance is decoded.
    PoofStarted { id: EntityId },
    /// Visual info blob should be (re)decoded for this entity.
    AppearanceSwapped { id: EntityId, crc: u32 },

    /// Speech bubble attached to an entity.
    Said {
        id: EntityId,
        message: String,
        kind: u8,
    },

    /// UI selection changed. `None` clears it.
    SelectionChanged { id: Option<EntityId> },
}

/// Connection lifecycle transitions.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Joining,
    Connected,
    /// Place in the server's admission queue changed.
    Queued { position: u32 },
    Playing,
    /// Transport dropped; the grace timer is running.
    Interrupted,
    /// Session ended. Emitted on every `leave()`, even repeated ones.
    Left { reason: LeaveReason },
}

/// Everything the host can observe, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    World(WorldEvent),
    Connection(ConnectionEvent),
    NotificationAdded(Notification),
    NotificationRemoved { id: u32 },
    PartyChanged,
    CharactersChanged,
    FriendsChanged,
    /// `worldState` or `mapState` replaced session metadata.
    SessionChanged,
    /// A live keyed subscription received a value.
    ValueChanged { collection: String, key: String },
}

impl From<WorldEvent> for ClientEvent {
    fn from(e: WorldEvent) -> Self {
        ClientEvent::World(e)
    }
}

impl From<ConnectionEvent> for ClientEvent {
    fn from(e: ConnectionEvent) -> Self {
        ClientEvent::Connection(e)
    }
}
