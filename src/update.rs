//! Region and entity update blobs.
//!
//! An update blob is a sequence of records, each starting with a one-byte
//! [`RecordType`]. A `None` byte (or the end of the buffer) terminates it.
//!
//! ```text
//! AddEntity     id:u32 type:u16 x:f32 y:f32 vx:f32 vy:f32 state:u16 player_state:u8
//!               options:opt<json> name:opt<str> info:opt<blob> crc:opt<u32>
//! UpdateEntity  id:u32 fields:u16 [x y] [vx vy] [state] [player_state]
//!               [options] [name] [info] [crc]
//! RemoveEntity  id:u32
//! UpdateTile    x:i32 y:i32 tile:u8          (world tile coordinates)
//! ```
//!
//! Region snapshot blobs are `rx:i16 ry:i16 tiles:blob entities:array<AddEntity>`.
//! Region update blobs are `rx:i16 ry:i16 changes:array<(lx:u8 ly:u8 tile:u8)>`.

use crate::codec::{FrameReader, FrameWriter};
use crate::error::ProtocolError;
use crate::types::{EntityId, RegionCoord, TileType, Vec2};
use bitflags::bitflags;
use bytes::Bytes;

// ---------------------------------------------------------------------------
// Record type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    None = 0,
    AddEntity = 1,
    UpdateEntity = 2,
    RemoveEntity = 3,
    UpdateTile = 4,
}

impl RecordType {
    pub fn from_u8(v: u8) -> Result<Self, ProtocolError> {
        match v {
            0 => Ok(Self::None),
            1 => Ok(Self::AddEntity),
            2 => Ok(Self::UpdateEntity),
            3 => Ok(Self::RemoveEntity),
            4 => Ok(Self::UpdateTile),
            other => Err(ProtocolError::UnknownRecord(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Bitmasks
// ---------------------------------------------------------------------------

bitflags! {
    /// Optional fields present in an `UpdateEntity` record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UpdateFields: u16 {
        const POSITION      = 1 << 0;
        const VELOCITY      = 1 << 1;
        const STATE         = 1 << 2;
        const PLAYER_STATE  = 1 << 3;
        const OPTIONS       = 1 << 4;
        const NAME          = 1 << 5;
        const INFO          = 1 << 6;
        const CRC           = 1 << 7;
        /// Position moved the entity across a region boundary.
        const SWITCH_REGION = 1 << 8;
    }
}

bitflags! {
    /// Visibility and moderation flags of an entity, relative to the local player.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct PlayerState: u8 {
        const HIDDEN    = 1 << 0;
        const IGNORED   = 1 << 1;
        const FRIEND    = 1 << 2;
        const MUTED     = 1 << 3;
        const MODERATOR = 1 << 4;
    }
}

/// Entity state bitmask: facing, head-turn, posture and animation bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct EntityState(pub u16);

impl EntityState {
    pub const FACING_RIGHT: u16 = 0x0001;
    pub const HEAD_TURNED: u16 = 0x0002;
    pub const POSTURE_MASK: u16 = 0x00f0;
    pub const POSTURE_SHIFT: u16 = 4;
    pub const ANIMATION_MASK: u16 = 0xff00;

    pub fn facing_right(self) -> bool {
        self.0 & Self::FACING_RIGHT != 0
    }

    pub fn head_turned(self) -> bool {
        self.0 & Self::HEAD_TURNED != 0
    }

    pub fn posture(self) -> u8 {
        ((self.0 & Self::POSTURE_MASK) >> Self::POSTURE_SHIFT) as u8
    }

    pub fn with_facing_right(self, on: bool) -> Self {
        Self(set_bits(self.0, Self::FACING_RIGHT, on))
    }

    pub fn with_head_turned(self, on: bool) -> Self {
        Self(set_bits(self.0, Self::HEAD_TURNED, on))
    }

    pub fn with_posture(self, posture: u8) -> Self {
        let bits = ((posture as u16) << Self::POSTURE_SHIFT) & Self::POSTURE_MASK;
        Self((self.0 & !Self::POSTURE_MASK) | bits)
    }
}

fn set_bits(value: u16, mask: u16, on: bool) -> u16 {
    if on {
        value | mask
    } else {
        value & !mask
    }
}

/// Posture values stored in [`EntityState`].
pub mod posture {
    pub const STANDING: u8 = 0;
    pub const WALKING: u8 = 1;
    pub const SITTING: u8 = 2;
    pub const LYING: u8 = 3;
    pub const FLYING: u8 = 4;
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Full description of an entity, as carried by `AddEntity` and snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySpawn {
    pub id: EntityId,
    pub type_id: u16,
    pub position: Vec2,
    pub velocity: Vec2,
    pub state: EntityState,
    pub player_state: PlayerState,
    pub options: Option<serde_json::Value>,
    pub name: Option<String>,
    pub info: Option<Vec<u8>>,
    pub crc: Option<u32>,
}

impl EntitySpawn {
    /// Minimal spawn at `position` with every optional field empty.
    pub fn new(id: EntityId, type_id: u16, position: Vec2) -> Self {
        Self {
            id,
            type_id,
            position,
            velocity: Vec2::zero(),
            state: EntityState::default(),
            player_state: PlayerState::empty(),
            options: None,
            name: None,
            info: None,
            crc: None,
        }
    }
}

/// Partial entity update. `None` fields are left untouched.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntityPatch {
    pub id: EntityId,
    pub position: Option<Vec2>,
    pub velocity: Option<Vec2>,
    pub state: Option<EntityState>,
    pub player_state: Option<PlayerState>,
    pub options: Option<serde_json::Value>,
    pub name: Option<String>,
    pub info: Option<Vec<u8>>,
    pub crc: Option<u32>,
    pub switch_region: bool,
}

impl EntityPatch {
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    fn fields(&self) -> UpdateFields {
        let mut f = UpdateFields::empty();
        f.set(UpdateFields::POSITION, self.position.is_some());
        f.set(UpdateFields::VELOCITY, self.velocity.is_some());
        f.set(UpdateFields::STATE, self.state.is_some());
        f.set(UpdateFields::PLAYER_STATE, self.player_state.is_some());
        f.set(UpdateFields::OPTIONS, self.options.is_some());
        f.set(UpdateFields::NAME, self.name.is_some());
        f.set(UpdateFields::INFO, self.info.is_some());
        f.set(UpdateFields::CRC, self.crc.is_some());
        f.set(UpdateFields::SWITCH_REGION, self.switch_region);
        f
    }
}

/// Tile mutation addressed by region and region-local coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileChange {
    pub region: RegionCoord,
    pub local_x: u32,
    pub local_y: u32,
    pub tile: TileType,
}

impl TileChange {
    pub fn from_world(x: i32, y: i32, tile: TileType, region_size: u32) -> Self {
        let size = region_size.max(1) as i32;
        Self {
            region: RegionCoord::of_tile(x, y, region_size),
            local_x: x.rem_euclid(size) as u32,
            local_y: y.rem_euclid(size) as u32,
            tile,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateRecord {
    Add(EntitySpawn),
    Update(EntityPatch),
    Remove(EntityId),
    /// Tile change in world tile coordinates.
    Tile { x: i32, y: i32, tile: TileType },
}

// ---------------------------------------------------------------------------
// Entity bodies
// ---------------------------------------------------------------------------

fn write_vec2(w: &mut FrameWriter, v: Vec2) {
    w.put_f32(v.x);
    w.put_f32(v.y);
}

fn read_vec2(r: &mut FrameReader<'_>) -> Result<Vec2, ProtocolError> {
    Ok(Vec2::new(r.read_f32()?, r.read_f32()?))
}

pub fn write_spawn(w: &mut FrameWriter, e: &EntitySpawn) {
    w.put_u32(e.id);
    w.put_u16(e.type_id);
    write_vec2(w, e.position);
    write_vec2(w, e.velocity);
    w.put_u16(e.state.0);
    w.put_u8(e.player_state.bits());
    w.put_opt(e.options.as_ref(), |w, v| w.put_json(v));
    w.put_opt(e.name.as_deref(), |w, v| w.put_str(v));
    w.put_opt(e.info.as_deref(), |w, v| w.put_blob(v));
    w.put_opt(e.crc, |w, v| w.put_u32(v));
}

pub fn read_spawn(r: &mut FrameReader<'_>) -> Result<EntitySpawn, ProtocolError> {
    Ok(EntitySpawn {
        id: r.read_u32()?,
        type_id: r.read_u16()?,
        position: read_vec2(r)?,
        velocity: read_vec2(r)?,
        state: EntityState(r.read_u16()?),
        player_state: PlayerState::from_bits_truncate(r.read_u8()?),
        options: r.read_opt(|r| r.read_json("options"))?,
        name: r.read_opt(|r| r.read_str())?,
        info: r.read_opt(|r| r.read_blob())?,
        crc: r.read_opt(|r| r.read_u32())?,
    })
}

fn write_patch(w: &mut FrameWriter, p: &EntityPatch) {
    w.put_u32(p.id);
    w.put_u16(p.fields().bits());
    if let Some(v) = p.position {
        write_vec2(w, v);
    }
    if let Some(v) = p.velocity {
        write_vec2(w, v);
    }
    if let Some(s) = p.state {
        w.put_u16(s.0);
    }
    if let Some(ps) = p.player_state {
        w.put_u8(ps.bits());
    }
    if let Some(o) = &p.options {
        w.put_json(o);
    }
    if let Some(n) = &p.name {
        w.put_str(n);
    }
    if let Some(i) = &p.info {
        w.put_blob(i);
    }
    if let Some(c) = p.crc {
        w.put_u32(c);
    }
}

fn read_patch(r: &mut FrameReader<'_>) -> Result<EntityPatch, ProtocolError> {
    let id = r.read_u32()?;
    let fields = UpdateFields::from_bits_truncate(r.read_u16()?);
    let mut p = EntityPatch::new(id);
    if fields.contains(UpdateFields::POSITION) {
        p.position = Some(read_vec2(r)?);
    }
    if fields.contains(UpdateFields::VELOCITY) {
        p.velocity = Some(read_vec2(r)?);
    }
    if fields.contains(UpdateFields::STATE) {
        p.state = Some(EntityState(r.read_u16()?));
    }
    if fields.contains(UpdateFields::PLAYER_STATE) {
        p.player_state = Some(PlayerState::from_bits_truncate(r.read_u8()?));
    }
    if fields.contains(UpdateFields::OPTIONS) {
        p.options = Some(r.read_json("options")?);
    }
    if fields.contains(UpdateFields::NAME) {
        p.name = Some(r.read_str()?);
    }
    if fields.contains(UpdateFields::INFO) {
        p.info = Some(r.read_blob()?);
    }
    if fields.contains(UpdateFields::CRC) {
        p.crc = Some(r.read_u32()?);
    }
    p.switch_region = fields.contains(UpdateFields::SWITCH_REGION);
    Ok(p)
}

// ---------------------------------------------------------------------------
// Update blob
// ---------------------------------------------------------------------------

pub fn encode_updates(records: &[UpdateRecord]) -> Bytes {
    let mut w = FrameWriter::new();
    for record in records {
        match record {
            UpdateRecord::Add(e) => {
                w.put_u8(RecordType::AddEntity as u8);
                write_spawn(&mut w, e);
            }
            UpdateRecord::Update(p) => {
                w.put_u8(RecordType::UpdateEntity as u8);
                write_patch(&mut w, p);
            }
            UpdateRecord::Remove(id) => {
                w.put_u8(RecordType::RemoveEntity as u8);
                w.put_u32(*id);
            }
            UpdateRecord::Tile { x, y, tile } => {
                w.put_u8(RecordType::UpdateTile as u8);
                w.put_i32(*x);
                w.put_i32(*y);
                w.put_u8(*tile);
            }
        }
    }
    w.put_u8(RecordType::None as u8);
    w.finish()
}

/// Decode every record of an update blob.
///
/// A malformed record fails the whole blob: records after a decode error
/// cannot be located, and applying a prefix would break per-id ordering.
pub fn decode_updates(blob: &[u8]) -> Result<Vec<UpdateRecord>, ProtocolError> {
    let mut r = FrameReader::new(blob);
    let mut records = Vec::new();
    while !r.is_empty() {
        match RecordType::from_u8(r.read_u8()?)? {
            RecordType::None => break,
            RecordType::AddEntity => records.push(UpdateRecord::Add(read_spawn(&mut r)?)),
            RecordType::UpdateEntity => records.push(UpdateRecord::Update(read_patch(&mut r)?)),
            RecordType::RemoveEntity => records.push(UpdateRecord::Remove(r.read_u32()?)),
            RecordType::UpdateTile => records.push(UpdateRecord::Tile {
                x: r.read_i32()?,
                y: r.read_i32()?,
                tile: r.read_u8()?,
            }),
        }
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// Region blobs
// ---------------------------------------------------------------------------

/// Initial state of one region.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionSnapshot {
    pub coord: RegionCoord,
    pub tiles: Vec<TileType>,
    pub entities: Vec<EntitySpawn>,
}

pub fn encode_region_snapshot(snapshot: &RegionSnapshot) -> Bytes {
    let mut w = FrameWriter::new();
    w.put_i16(snapshot.coord.x as i16);
    w.put_i16(snapshot.coord.y as i16);
    w.put_blob(&snapshot.tiles);
    w.put_array(&snapshot.entities, write_spawn);
    w.finish()
}

/// Decode a snapshot and check its tile array against `region_size`.
pub fn decode_region_snapshot(
    blob: &[u8],
    region_size: u32,
) -> Result<RegionSnapshot, ProtocolError> {
    let mut r = FrameReader::new(blob);
    let coord = RegionCoord::new(r.read_i16()? as i32, r.read_i16()? as i32);
    let tiles = r.read_blob()?;
    let expected = (region_size * region_size) as usize;
    if tiles.len() != expected {
        return Err(ProtocolError::TileCount {
            coord,
            expected,
            actual: tiles.len(),
        });
    }
    let entities = r.read_array(read_spawn)?;
    r.expect_end("region snapshot")?;
    Ok(RegionSnapshot {
        coord,
        tiles,
        entities,
    })
}

pub fn encode_region_update(coord: RegionCoord, changes: &[TileChange]) -> Bytes {
    let mut w = FrameWriter::new();
    w.put_i16(coord.x as i16);
    w.put_i16(coord.y as i16);
    w.put_array(changes, |w, c| {
        w.put_u8(c.local_x as u8);
        w.put_u8(c.local_y as u8);
        w.put_u8(c.tile);
    });
    w.finish()
}

pub fn decode_region_update(blob: &[u8]) -> Result<Vec<TileChange>, ProtocolError> {
    let mut r = FrameReader::new(blob);
    let region = RegionCoord::new(r.read_i16()? as i32, r.read_i16()? as i32);
    let changes = r.read_array(|r| {
        Ok(TileChange {
            region,
            local_x: r.read_u8()? as u32,
            local_y: r.read_u8()? as u32,
            tile: r.read_u8()?,
        })
    })?;
    r.expect_end("region update")?;
    Ok(changes)
}
