//! Binary method protocol.
//!
//! This module owns **every method that crosses the connection** between
//! the client engine and the authoritative server.
//!
//! ## Framing
//!
//! Every frame is one opcode byte followed by the method's fixed binary
//! schema (see [`crate::codec`] for the primitive encodings).
//!
//! | Range         | Direction        | Enum         |
//! |---------------|------------------|--------------|
//! | `0x01..=0x3f` | client → server  | [`ClientOp`] |
//! | `0x40..=0x7f` | server → client  | [`ServerOp`] |
//!
//! ## Design rules
//!
//! 1. Every declared method has exactly one entry in [`OUTBOUND`] or
//!    [`INBOUND`]; [`validate_schema`] checks this at channel startup.
//! 2. Update blobs are carried opaque here and decoded by
//!    [`crate::update`] so a bad blob never fails the whole frame.
//! 3. Loosely-typed server documents (`worldState`, `mapState`) travel as
//!    JSON strings inside the binary frame.

use crate::codec::{FrameReader, FrameWriter};
use crate::error::ProtocolError;
use crate::types::{EntityId, RegionCoord, TileType};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ClientOp {
    Subscribe = 0x01,
    Unsubscribe = 0x02,
    Move = 0x03,
    Action = 0x04,
    Interact = 0x05,
    Say = 0x06,
    ChangeTile = 0x07,
    FixedPositionAck = 0x08,
    Leave = 0x09,
    ResolveEntity = 0x0a,
}

impl ClientOp {
    pub const ALL: [ClientOp; 10] = [
        ClientOp::Subscribe,
        ClientOp::Unsubscribe,
        ClientOp::Move,
        ClientOp::Action,
        ClientOp::Interact,
        ClientOp::Say,
        ClientOp::ChangeTile,
        ClientOp::FixedPositionAck,
        ClientOp::Leave,
        ClientOp::ResolveEntity,
    ];

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|op| *op as u8 == v)
    }

    pub fn label(self) -> &'static str {
        match self {
            ClientOp::Subscribe => "Subscribe",
            ClientOp::Unsubscribe => "Unsubscribe",
            ClientOp::Move => "Move",
            ClientOp::Action => "Action",
            ClientOp::Interact => "Interact",
            ClientOp::Say => "Say",
            ClientOp::ChangeTile => "ChangeTile",
            ClientOp::FixedPositionAck => "FixedPositionAck",
            ClientOp::Leave => "Leave",
            ClientOp::ResolveEntity => "ResolveEntity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServerOp {
    Queue = 0x40,
    WorldState = 0x41,
    MapState = 0x42,
    MapUpdate = 0x43,
    MyEntity = 0x44,
    Update = 0x45,
    FixPosition = 0x46,
    Left = 0x47,
    AddNotification = 0x48,
    RemoveNotification = 0x49,
    UpdateSelection = 0x4a,
    UpdateParty = 0x4b,
    UpdatePonies = 0x4c,
    UpdateFriends = 0x4d,
    EntityInfo = 0x4e,
    SubscribedValue = 0x4f,
}

impl ServerOp {
    pub const ALL: [ServerOp; 16] = [
        ServerOp::Queue,
        ServerOp::WorldState,
        ServerOp::MapState,
        ServerOp::MapUpdate,
        ServerOp::MyEntity,
        ServerOp::Update,
        ServerOp::FixPosition,
        ServerOp::Left,
        ServerOp::AddNotification,
        ServerOp::RemoveNotification,
        ServerOp::UpdateSelection,
        ServerOp::UpdateParty,
        ServerOp::UpdatePonies,
        ServerOp::UpdateFriends,
        ServerOp::EntityInfo,
        ServerOp::SubscribedValue,
    ];

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|op| *op as u8 == v)
    }

    pub fn label(self) -> &'static str {
        match self {
            ServerOp::Queue => "Queue",
            ServerOp::WorldState => "WorldState",
            ServerOp::MapState => "MapState",
            ServerOp::MapUpdate => "MapUpdate",
            ServerOp::MyEntity => "MyEntity",
            ServerOp::Update => "Update",
            ServerOp::FixPosition => "FixPosition",
            ServerOp::Left => "Left",
            ServerOp::AddNotification => "AddNotification",
            ServerOp::RemoveNotification => "RemoveNotification",
            ServerOp::UpdateSelection => "UpdateSelection",
            ServerOp::UpdateParty => "UpdateParty",
            ServerOp::UpdatePonies => "UpdatePonies",
            ServerOp::UpdateFriends => "UpdateFriends",
            ServerOp::EntityInfo => "EntityInfo",
            ServerOp::SubscribedValue => "SubscribedValue",
        }
    }
}

// ---------------------------------------------------------------------------
// Shared payload types
// ---------------------------------------------------------------------------

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    /// Player asked to leave.
    Requested,
    Kicked,
    /// Transport dropped and did not come back within the grace period.
    Timeout,
    /// Same account joined from elsewhere.
    Swapped,
    ServerShutdown,
    Other(u8),
}

impl LeaveReason {
    pub fn to_u8(self) -> u8 {
        match self {
            LeaveReason::Requested => 0,
            LeaveReason::Kicked => 1,
            LeaveReason::Timeout => 2,
            LeaveReason::Swapped => 3,
            LeaveReason::ServerShutdown => 4,
            LeaveReason::Other(v) => v,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LeaveReason::Requested,
            1 => LeaveReason::Kicked,
            2 => LeaveReason::Timeout,
            3 => LeaveReason::Swapped,
            4 => LeaveReason::ServerShutdown,
            other => LeaveReason::Other(other),
        }
    }
}

impl std::fmt::Display for LeaveReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaveReason::Requested => write!(f, "requested"),
            LeaveReason::Kicked => write!(f, "kicked"),
            LeaveReason::Timeout => write!(f, "timeout"),
            LeaveReason::Swapped => write!(f, "swapped"),
            LeaveReason::ServerShutdown => write!(f, "server shutdown"),
            LeaveReason::Other(v) => write!(f, "reason #{v}"),
        }
    }
}

/// Server-provided session metadata (`worldState`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldState {
    pub server: String,
    pub version: String,
    pub features: Vec<String>,
    /// Entity type id → editor name, scoped to this session.
    pub entity_types: BTreeMap<u16, String>,
}

/// Static description of the current map (`mapState` first argument).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapInfo {
    pub kind: String,
    /// Map width in regions.
    pub regions_x: u32,
    /// Map height in regions.
    pub regions_y: u32,
    pub default_tile: TileType,
}

impl Default for MapInfo {
    fn default() -> Self {
        Self {
            kind: "main".into(),
            regions_x: 0,
            regions_y: 0,
            default_tile: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SayTuple {
    pub entity: EntityId,
    pub message: String,
    pub kind: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub id: u32,
    pub entity: EntityId,
    pub name: String,
    pub message: String,
    pub flags: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartyMember {
    pub id: EntityId,
    pub flags: u8,
}

/// One of the account's characters (`updatePonies`).
#[derive(Debug, Clone, PartialEq)]
pub struct CharacterEntry {
    pub id: String,
    pub name: String,
    pub info: Vec<u8>,
    pub last_used: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FriendEntry {
    pub account_id: String,
    pub name: String,
    /// Entity id when online, 0 otherwise.
    pub entity: EntityId,
    pub online: bool,
}

// ---------------------------------------------------------------------------
// Outbound calls (client → server)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ClientCall {
    Subscribe { collection: String, key: String },
    Unsubscribe { collection: String, key: String },
    /// Opaque movement delta produced by the local simulation.
    Move { data: Vec<u8> },
    Action { code: u8 },
    Interact { entity: EntityId },
    Say { target: EntityId, text: String, chat_type: u8 },
    ChangeTile { x: i32, y: i32, tile: TileType },
    FixedPositionAck,
    Leave,
    /// Ask the server for `entityInfo` about an id we cannot resolve.
    ResolveEntity { id: EntityId },
}

impl ClientCall {
    pub fn op(&self) -> ClientOp {
        match self {
            ClientCall::Subscribe { .. } => ClientOp::Subscribe,
            ClientCall::Unsubscribe { .. } => ClientOp::Unsubscribe,
            ClientCall::Move { .. } => ClientOp::Move,
            ClientCall::Action { .. } => ClientOp::Action,
            ClientCall::Interact { .. } => ClientOp::Interact,
            ClientCall::Say { .. } => ClientOp::Say,
            ClientCall::ChangeTile { .. } => ClientOp::ChangeTile,
            ClientCall::FixedPositionAck => ClientOp::FixedPositionAck,
            ClientCall::Leave => ClientOp::Leave,
            ClientCall::ResolveEntity { .. } => ClientOp::ResolveEntity,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut w = FrameWriter::with_opcode(self.op() as u8);
        match self {
            ClientCall::Subscribe { collection, key }
            | ClientCall::Unsubscribe { collection, key } => {
                w.put_str(collection);
                w.put_str(key);
            }
            ClientCall::Move { data } => w.put_blob(data),
            ClientCall::Action { code } => w.put_u8(*code),
            ClientCall::Interact { entity } => w.put_u32(*entity),
            ClientCall::Say {
                target,
                text,
                chat_type,
            } => {
                w.put_u32(*target);
                w.put_str(text);
                w.put_u8(*chat_type);
            }
            ClientCall::ChangeTile { x, y, tile } => {
                w.put_i32(*x);
                w.put_i32(*y);
                w.put_u8(*tile);
            }
            ClientCall::FixedPositionAck | ClientCall::Leave => {}
            ClientCall::ResolveEntity { id } => w.put_u32(*id),
        }
        w.finish()
    }

    /// Server-side decoding of an outbound frame.
    pub fn decode(frame: &[u8]) -> Result<ClientCall, ProtocolError> {
        let (&opcode, rest) = frame.split_first().ok_or(ProtocolError::EmptyFrame)?;
        let op = ClientOp::from_u8(opcode).ok_or(ProtocolError::UnknownOpcode(opcode))?;
        let mut r = FrameReader::new(rest);
        let call = match op {
            ClientOp::Subscribe => ClientCall::Subscribe {
                collection: r.read_str()?,
                key: r.read_str()?,
            },
            ClientOp::Unsubscribe => ClientCall::Unsubscribe {
                collection: r.read_str()?,
                key: r.read_str()?,
            },
            ClientOp::Move => ClientCall::Move {
                data: r.read_blob()?,
            },
            ClientOp::Action => ClientCall::Action { code: r.read_u8()? },
            ClientOp::Interact => ClientCall::Interact {
                entity: r.read_u32()?,
            },
            ClientOp::Say => ClientCall::Say {
                target: r.read_u32()?,
                text: r.read_str()?,
                chat_type: r.read_u8()?,
            },
            ClientOp::ChangeTile => ClientCall::ChangeTile {
                x: r.read_i32()?,
                y: r.read_i32()?,
                tile: r.read_u8()?,
            },
            ClientOp::FixedPositionAck => ClientCall::FixedPositionAck,
            ClientOp::Leave => ClientCall::Leave,
            ClientOp::ResolveEntity => ClientCall::ResolveEntity { id: r.read_u32()? },
        };
        r.expect_end(outbound_name(op))?;
        Ok(call)
    }
}

// ---------------------------------------------------------------------------
// Inbound messages (server → client)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Queue {
        position: u32,
    },
    WorldState {
        state: WorldState,
        initial: bool,
    },
    MapState {
        info: MapInfo,
        state: serde_json::Value,
    },
    MapUpdate {
        state: serde_json::Value,
    },
    MyEntity {
        id: EntityId,
        name: String,
        info: Vec<u8>,
        character_id: String,
        crc: u32,
    },
    Update {
        unsubscribes: Vec<RegionCoord>,
        subscribes: Vec<Vec<u8>>,
        updates: Vec<u8>,
        regions: Vec<Vec<u8>>,
        says: Vec<SayTuple>,
    },
    FixPosition {
        x: f32,
        y: f32,
        safe: bool,
    },
    Left {
        reason: LeaveReason,
    },
    AddNotification(Notification),
    RemoveNotification {
        id: u32,
    },
    UpdateSelection {
        current: EntityId,
        new: EntityId,
    },
    UpdateParty {
        members: Vec<PartyMember>,
    },
    UpdatePonies {
        characters: Vec<CharacterEntry>,
    },
    UpdateFriends {
        friends: Vec<FriendEntry>,
        remove_missing: bool,
    },
    EntityInfo {
        id: EntityId,
        name: String,
        crc: u32,
        name_bad: bool,
    },
    SubscribedValue {
        collection: String,
        key: String,
        value: serde_json::Value,
    },
}

impl ServerMessage {
    pub fn op(&self) -> ServerOp {
        match self {
            ServerMessage::Queue { .. } => ServerOp::Queue,
            ServerMessage::WorldState { .. } => ServerOp::WorldState,
            ServerMessage::MapState { .. } => ServerOp::MapState,
            ServerMessage::MapUpdate { .. } => ServerOp::MapUpdate,
            ServerMessage::MyEntity { .. } => ServerOp::MyEntity,
            ServerMessage::Update { .. } => ServerOp::Update,
            ServerMessage::FixPosition { .. } => ServerOp::FixPosition,
            ServerMessage::Left { .. } => ServerOp::Left,
            ServerMessage::AddNotification(_) => ServerOp::AddNotification,
            ServerMessage::RemoveNotification { .. } => ServerOp::RemoveNotification,
            ServerMessage::UpdateSelection { .. } => ServerOp::UpdateSelection,
            ServerMessage::UpdateParty { .. } => ServerOp::UpdateParty,
            ServerMessage::UpdatePonies { .. } => ServerOp::UpdatePonies,
            ServerMessage::UpdateFriends { .. } => ServerOp::UpdateFriends,
            ServerMessage::EntityInfo { .. } => ServerOp::EntityInfo,
            ServerMessage::SubscribedValue { .. } => ServerOp::SubscribedValue,
        }
    }

    /// Decode one inbound frame through the [`INBOUND`] schema table.
    pub fn decode(frame: &[u8]) -> Result<ServerMessage, ProtocolError> {
        let (&opcode, rest) = frame.split_first().ok_or(ProtocolError::EmptyFrame)?;
        let schema = inbound_schema(opcode).ok_or(ProtocolError::UnknownOpcode(opcode))?;
        let mut r = FrameReader::new(rest);
        let message = (schema.decode)(&mut r)?;
        r.expect_end(schema.name)?;
        Ok(message)
    }

    /// Server-side encoding; the client only decodes these.
    pub fn encode(&self) -> Bytes {
        let mut w = FrameWriter::with_opcode(self.op() as u8);
        match self {
            ServerMessage::Queue { position } => w.put_u32(*position),
            ServerMessage::WorldState { state, initial } => {
                w.put_str(&serde_json::to_string(state).unwrap_or_default());
                w.put_bool(*initial);
            }
            ServerMessage::MapState { info, state } => {
                w.put_str(&serde_json::to_string(info).unwrap_or_default());
                w.put_json(state);
            }
            ServerMessage::MapUpdate { state } => w.put_json(state),
            ServerMessage::MyEntity {
                id,
                name,
                info,
                character_id,
                crc,
            } => {
                w.put_u32(*id);
                w.put_str(name);
                w.put_blob(info);
                w.put_str(character_id);
                w.put_u32(*crc);
            }
            ServerMessage::Update {
                unsubscribes,
                subscribes,
                updates,
                regions,
                says,
            } => {
                w.put_array(unsubscribes, |w, c| {
                    w.put_i16(c.x as i16);
                    w.put_i16(c.y as i16);
                });
                w.put_array(subscribes, |w, b| w.put_blob(b));
                w.put_blob(updates);
                w.put_array(regions, |w, b| w.put_blob(b));
                w.put_array(says, |w, s| {
                    w.put_u32(s.entity);
                    w.put_str(&s.message);
                    w.put_u8(s.kind);
                });
            }
            ServerMessage::FixPosition { x, y, safe } => {
                w.put_f32(*x);
                w.put_f32(*y);
                w.put_bool(*safe);
            }
            ServerMessage::Left { reason } => w.put_u8(reason.to_u8()),
            ServerMessage::AddNotification(n) => {
                w.put_u32(n.id);
                w.put_u32(n.entity);
                w.put_str(&n.name);
                w.put_str(&n.message);
                w.put_u8(n.flags);
            }
            ServerMessage::RemoveNotification { id } => w.put_u32(*id),
            ServerMessage::UpdateSelection { current, new } => {
                w.put_u32(*current);
                w.put_u32(*new);
            }
            ServerMessage::UpdateParty { members } => w.put_array(members, |w, m| {
                w.put_u32(m.id);
                w.put_u8(m.flags);
            }),
            ServerMessage::UpdatePonies { characters } => w.put_array(characters, |w, c| {
                w.put_str(&c.id);
                w.put_str(&c.name);
                w.put_blob(&c.info);
                w.put_u64(c.last_used);
            }),
            ServerMessage::UpdateFriends {
                friends,
                remove_missing,
            } => {
                w.put_array(friends, |w, f| {
                    w.put_str(&f.account_id);
                    w.put_str(&f.name);
                    w.put_u32(f.entity);
                    w.put_bool(f.online);
                });
                w.put_bool(*remove_missing);
            }
            ServerMessage::EntityInfo {
                id,
                name,
                crc,
                name_bad,
            } => {
                w.put_u32(*id);
                w.put_str(name);
                w.put_u32(*crc);
                w.put_bool(*name_bad);
            }
            ServerMessage::SubscribedValue {
                collection,
                key,
                value,
            } => {
                w.put_str(collection);
                w.put_str(key);
                w.put_json(value);
            }
        }
        w.finish()
    }
}

// ---------------------------------------------------------------------------
// Inbound decoders
// ---------------------------------------------------------------------------

fn read_typed_json<T: serde::de::DeserializeOwned>(
    r: &mut FrameReader<'_>,
    field: &'static str,
) -> Result<T, ProtocolError> {
    let value = r.read_json(field)?;
    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidJson {
        field,
        reason: e.to_string(),
    })
}

fn decode_queue(r: &mut FrameReader<'_>) -> Result<ServerMessage, ProtocolError> {
    Ok(ServerMessage::Queue {
        position: r.read_u32()?,
    })
}

fn decode_world_state(r: &mut FrameReader<'_>) -> Result<ServerMessage, ProtocolError> {
    Ok(ServerMessage::WorldState {
        state: read_typed_json(r, "worldState")?,
        initial: r.read_bool()?,
    })
}

fn decode_map_state(r: &mut FrameReader<'_>) -> Result<ServerMessage, ProtocolError> {
    Ok(ServerMessage::MapState {
        info: read_typed_json(r, "mapInfo")?,
        state: r.read_json("mapState")?,
    })
}

fn decode_map_update(r: &mut FrameReader<'_>) -> Result<ServerMessage, ProtocolError> {
    Ok(ServerMessage::MapUpdate {
        state: r.read_json("mapState")?,
    })
}

fn decode_my_entity(r: &mut FrameReader<'_>) -> Result<ServerMessage, ProtocolError> {
    Ok(ServerMessage::MyEntity {
        id: r.read_u32()?,
        name: r.read_str()?,
        info: r.read_blob()?,
        character_id: r.read_str()?,
        crc: r.read_u32()?,
    })
}

fn decode_update(r: &mut FrameReader<'_>) -> Result<ServerMessage, ProtocolError> {
    Ok(ServerMessage::Update {
        unsubscribes: r.read_array(|r| {
            Ok(RegionCoord::new(r.read_i16()? as i32, r.read_i16()? as i32))
        })?,
        subscribes: r.read_array(|r| r.read_blob())?,
        updates: r.read_blob()?,
        regions: r.read_array(|r| r.read_blob())?,
        says: r.read_array(|r| {
            Ok(SayTuple {
                entity: r.read_u32()?,
                message: r.read_str()?,
                kind: r.read_u8()?,
            })
        })?,
    })
}

fn decode_fix_position(r: &mut FrameReader<'_>) -> Result<ServerMessage, ProtocolError> {
    Ok(ServerMessage::FixPosition {
        x: r.read_f32()?,
        y: r.read_f32()?,
        safe: r.read_bool()?,
    })
}

fn decode_left(r: &mut FrameReader<'_>) -> Result<ServerMessage, ProtocolError> {
    Ok(ServerMessage::Left {
        reason: LeaveReason::from_u8(r.read_u8()?),
    })
}

fn decode_add_notification(r: &mut FrameReader<'_>) -> Result<ServerMessage, ProtocolError> {
    Ok(ServerMessage::AddNotification(Notification {
        id: r.read_u32()?,
        entity: r.read_u32()?,
        name: r.read_str()?,
        message: r.read_str()?,
        flags: r.read_u8()?,
    }))
}

fn decode_remove_notification(r: &mut FrameReader<'_>) -> Result<ServerMessage, ProtocolError> {
    Ok(ServerMessage::RemoveNotification { id: r.read_u32()? })
}

fn decode_update_selection(r: &mut FrameReader<'_>) -> Result<ServerMessage, ProtocolError> {
    Ok(ServerMessage::UpdateSelection {
        current: r.read_u32()?,
        new: r.read_u32()?,
    })
}

fn decode_update_party(r: &mut FrameReader<'_>) -> Result<ServerMessage, ProtocolError> {
    Ok(ServerMessage::UpdateParty {
        members: r.read_array(|r| {
            Ok(PartyMember {
                id: r.read_u32()?,
                flags: r.read_u8()?,
            })
        })?,
    })
}

fn decode_update_ponies(r: &mut FrameReader<'_>) -> Result<ServerMessage, ProtocolError> {
    Ok(ServerMessage::UpdatePonies {
        characters: r.read_array(|r| {
            Ok(CharacterEntry {
                id: r.read_str()?,
                name: r.read_str()?,
                info: r.read_blob()?,
                last_used: r.read_u64()?,
            })
        })?,
    })
}

fn decode_update_friends(r: &mut FrameReader<'_>) -> Result<ServerMessage, ProtocolError> {
    Ok(ServerMessage::UpdateFriends {
        friends: r.read_array(|r| {
            Ok(FriendEntry {
                account_id: r.read_str()?,
                name: r.read_str()?,
                entity: r.read_u32()?,
                online: r.read_bool()?,
            })
        })?,
        remove_missing: r.read_bool()?,
    })
}

fn decode_entity_info(r: &mut FrameReader<'_>) -> Result<ServerMessage, ProtocolError> {
    Ok(ServerMessage::EntityInfo {
        id: r.read_u32()?,
        name: r.read_str()?,
        crc: r.read_u32()?,
        name_bad: r.read_bool()?,
    })
}

fn decode_subscribed_value(r: &mut FrameReader<'_>) -> Result<ServerMessage, ProtocolError> {
    Ok(ServerMessage::SubscribedValue {
        collection: r.read_str()?,
        key: r.read_str()?,
        value: r.read_json("value")?,
    })
}

// ---------------------------------------------------------------------------
// Schema tables
// ---------------------------------------------------------------------------

pub type DecodeFn = fn(&mut FrameReader<'_>) -> Result<ServerMessage, ProtocolError>;

#[derive(Debug, Clone, Copy)]
pub struct OutboundSchema {
    pub op: ClientOp,
    pub name: &'static str,
}

#[derive(Clone, Copy)]
pub struct InboundSchema {
    pub op: ServerOp,
    pub name: &'static str,
    pub decode: DecodeFn,
}

impl std::fmt::Debug for InboundSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundSchema")
            .field("op", &self.op)
            .field("name", &self.name)
            .finish()
    }
}

pub static OUTBOUND: &[OutboundSchema] = &[
    OutboundSchema { op: ClientOp::Subscribe, name: "subscribe" },
    OutboundSchema { op: ClientOp::Unsubscribe, name: "unsubscribe" },
    OutboundSchema { op: ClientOp::Move, name: "move" },
    OutboundSchema { op: ClientOp::Action, name: "action" },
    OutboundSchema { op: ClientOp::Interact, name: "interact" },
    OutboundSchema { op: ClientOp::Say, name: "say" },
    OutboundSchema { op: ClientOp::ChangeTile, name: "changeTile" },
    OutboundSchema { op: ClientOp::FixedPositionAck, name: "fixedPosition" },
    OutboundSchema { op: ClientOp::Leave, name: "leave" },
    OutboundSchema { op: ClientOp::ResolveEntity, name: "resolveEntity" },
];

pub static INBOUND: &[InboundSchema] = &[
    InboundSchema { op: ServerOp::Queue, name: "queue", decode: decode_queue },
    InboundSchema { op: ServerOp::WorldState, name: "worldState", decode: decode_world_state },
    InboundSchema { op: ServerOp::MapState, name: "mapState", decode: decode_map_state },
    InboundSchema { op: ServerOp::MapUpdate, name: "mapUpdate", decode: decode_map_update },
    InboundSchema { op: ServerOp::MyEntity, name: "myEntity", decode: decode_my_entity },
    InboundSchema { op: ServerOp::Update, name: "update", decode: decode_update },
    InboundSchema { op: ServerOp::FixPosition, name: "fixPosition", decode: decode_fix_position },
    InboundSchema { op: ServerOp::Left, name: "left", decode: decode_left },
    InboundSchema { op: ServerOp::AddNotification, name: "addNotification", decode: decode_add_notification },
    InboundSchema { op: ServerOp::RemoveNotification, name: "removeNotification", decode: decode_remove_notification },
    InboundSchema { op: ServerOp::UpdateSelection, name: "updateSelection", decode: decode_update_selection },
    InboundSchema { op: ServerOp::UpdateParty, name: "updateParty", decode: decode_update_party },
    InboundSchema { op: ServerOp::UpdatePonies, name: "updatePonies", decode: decode_update_ponies },
    InboundSchema { op: ServerOp::UpdateFriends, name: "updateFriends", decode: decode_update_friends },
    InboundSchema { op: ServerOp::EntityInfo, name: "entityInfo", decode: decode_entity_info },
    InboundSchema { op: ServerOp::SubscribedValue, name: "subscribedValue", decode: decode_subscribed_value },
];

pub fn inbound_schema(opcode: u8) -> Option<&'static InboundSchema> {
    INBOUND.iter().find(|s| s.op as u8 == opcode)
}

pub fn outbound_name(op: ClientOp) -> &'static str {
    OUTBOUND
        .iter()
        .find(|s| s.op == op)
        .map(|s| s.name)
        .unwrap_or("unknown")
}

pub fn inbound_name(op: ServerOp) -> &'static str {
    INBOUND
        .iter()
        .find(|s| s.op == op)
        .map(|s| s.name)
        .unwrap_or("unknown")
}

/// Check that every declared method has exactly one binary schema.
pub fn validate_schema() -> Result<(), ProtocolError> {
    validate_table(
        &ClientOp::ALL.map(|op| (op as u8, op.label())),
        &OUTBOUND.iter().map(|s| s.op as u8).collect::<Vec<_>>(),
    )?;
    validate_table(
        &ServerOp::ALL.map(|op| (op as u8, op.label())),
        &INBOUND.iter().map(|s| s.op as u8).collect::<Vec<_>>(),
    )
}

fn validate_table(declared: &[(u8, &'static str)], registered: &[u8]) -> Result<(), ProtocolError> {
    for &(opcode, label) in declared {
        match registered.iter().filter(|r| **r == opcode).count() {
            0 => return Err(ProtocolError::MissingSchema(label)),
            1 => {}
            _ => return Err(ProtocolError::DuplicateSchema(opcode)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_tables_are_complete() {
        assert_eq!(validate_schema(), Ok(()));
    }

    #[test]
    fn missing_entry_is_reported() {
        let err = validate_table(&[(1, "Subscribe"), (2, "Unsubscribe")], &[1]).unwrap_err();
        assert_eq!(err, ProtocolError::MissingSchema("Unsubscribe"));
    }

    #[test]
    fn duplicate_entry_is_reported() {
        let err = validate_table(&[(1, "Subscribe")], &[1, 1]).unwrap_err();
        assert_eq!(err, ProtocolError::DuplicateSchema(1));
    }

    #[test]
    fn opcode_ranges_do_not_overlap() {
        for op in ClientOp::ALL {
            assert!((op as u8) < 0x40, "{op:?}");
        }
        for op in ServerOp::ALL {
            assert!((0x40..0x80).contains(&(op as u8)), "{op:?}");
        }
    }

    #[test]
    fn update_frame_decodes_all_sections() {
        let msg = ServerMessage::Update {
            unsubscribes: vec![RegionCoord::new(-1, 2)],
            subscribes: vec![vec![1, 2, 3]],
            updates: vec![0],
            regions: vec![],
            says: vec![SayTuple {
                entity: 5,
                message: "hi".into(),
                kind: 1,
            }],
        };
        assert_eq!(ServerMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn world_state_json_populates_type_table() {
        let mut state = WorldState::default();
        state.entity_types.insert(12, "tree".into());
        let msg = ServerMessage::WorldState {
            state,
            initial: true,
        };
        match ServerMessage::decode(&msg.encode()).unwrap() {
            ServerMessage::WorldState { state, initial } => {
                assert!(initial);
                assert_eq!(state.entity_types.get(&12).map(String::as_str), Some("tree"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_and_empty_frames_are_errors() {
        assert_eq!(ServerMessage::decode(&[]), Err(ProtocolError::EmptyFrame));
        assert_eq!(
            ServerMessage::decode(&[0x7e]),
            Err(ProtocolError::UnknownOpcode(0x7e))
        );
    }

    #[test]
    fn trailing_bytes_fail_the_frame() {
        let mut frame = ServerMessage::Queue { position: 3 }.encode().to_vec();
        frame.push(0);
        assert_eq!(
            ServerMessage::decode(&frame),
            Err(ProtocolError::TrailingBytes {
                method: "queue",
                len: 1
            })
        );
    }

    #[test]
    fn client_calls_decode_back() {
        let call = ClientCall::Say {
            target: 0,
            text: "hello".into(),
            chat_type: 2,
        };
        assert_eq!(ClientCall::decode(&call.encode()).unwrap(), call);
        assert_eq!(ClientCall::decode(&ClientCall::Leave.encode()).unwrap(), ClientCall::Leave);
    }

    #[test]
    fn leave_reason_keeps_unknown_codes() {
        assert_eq!(LeaveReason::from_u8(2), LeaveReason::Timeout);
        assert_eq!(LeaveReason::from_u8(77), LeaveReason::Other(77));
        assert_eq!(LeaveReason::Other(77).to_u8(), 77);
    }
}
