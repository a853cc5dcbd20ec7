//! `WorldModel` – local mirror of the subscribed part of the world.
//!
//! Regions own a dense tile array and the set of entity ids inside them;
//! entities live in a single id index. Only [`crate::replication`] mutates
//! this; renderers read it.
//!
//! Invariants kept here:
//! - an entity id appears at most once in the index;
//! - every indexed entity is listed in exactly one loaded region's set, the
//!   region recorded in [`Entity::region`];
//! - the local player is the one exception: while its region is not loaded
//!   it stays indexed but detached, and is attached when that region
//!   arrives.

use crate::update::{EntitySpawn, EntityState, PlayerState, TileChange};
use crate::types::{EntityId, RegionCoord, TileType, Vec2};
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;

/// Type id the server uses for player avatars.
pub const AVATAR_TYPE: u16 = 1;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Avatar,
    Object(u16),
}

impl EntityKind {
    pub fn from_type(type_id: u16) -> Self {
        if type_id == AVATAR_TYPE {
            EntityKind::Avatar
        } else {
            EntityKind::Object(type_id)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Speech {
    pub message: String,
    pub kind: u8,
    pub expires_at: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub type_id: u16,
    pub position: Vec2,
    pub velocity: Vec2,
    pub state: EntityState,
    pub player_state: PlayerState,
    pub options: Option<serde_json::Value>,
    pub name: Option<String>,
    pub info: Option<Vec<u8>>,
    /// Version of `info`.
    pub crc: Option<u32>,
    /// Version of the appearance currently shown. Lags `crc` during a poof.
    pub appearance_crc: Option<u32>,
    pub region: RegionCoord,
    pub speech: Vec<Speech>,
}

impl Entity {
    pub fn from_spawn(spawn: EntitySpawn, region_size: u32) -> Self {
        let crc = spawn
            .crc
            .or_else(|| spawn.info.as_deref().map(info_crc));
        Self {
            id: spawn.id,
            kind: EntityKind::from_type(spawn.type_id),
            type_id: spawn.type_id,
            region: RegionCoord::containing(spawn.position, region_size),
            position: spawn.position,
            velocity: spawn.velocity,
            state: spawn.state,
            player_state: spawn.player_state,
            options: spawn.options,
            name: spawn.name,
            info: spawn.info,
            crc,
            appearance_crc: crc,
            speech: Vec::new(),
        }
    }

    pub fn is_hidden(&self) -> bool {
        self.player_state.contains(PlayerState::HIDDEN)
    }

    pub fn is_avatar(&self) -> bool {
        self.kind == EntityKind::Avatar
    }
}

/// Version tag for a visual-info blob: the first four bytes of its MD5
/// digest, little-endian. Used when the server omits the crc.
pub fn info_crc(info: &[u8]) -> u32 {
    let digest = md5::compute(info);
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub coord: RegionCoord,
    pub size: u32,
    pub tiles: Vec<TileType>,
    /// Set on any tile mutation; cleared by the renderer via
    /// [`WorldModel::take_dirty_regions`].
    pub dirty: bool,
    pub entities: BTreeSet<EntityId>,
}

impl Region {
    pub fn new(coord: RegionCoord, size: u32, tiles: Vec<TileType>) -> Self {
        Self {
            coord,
            size,
            tiles,
            dirty: false,
            entities: BTreeSet::new(),
        }
    }

    fn index(&self, local_x: u32, local_y: u32) -> Option<usize> {
        if local_x >= self.size || local_y >= self.size {
            return None;
        }
        Some((local_y * self.size + local_x) as usize)
    }

    pub fn tile(&self, local_x: u32, local_y: u32) -> Option<TileType> {
        self.index(local_x, local_y)
            .and_then(|i| self.tiles.get(i).copied())
    }

    /// Returns `false` when the local coordinates are out of range.
    pub fn set_tile(&mut self, local_x: u32, local_y: u32, tile: TileType) -> bool {
        match self.index(local_x, local_y).and_then(|i| self.tiles.get_mut(i)) {
            Some(slot) => {
                *slot = tile;
                self.dirty = true;
                true
            }
            None => false,
        }
    }
}

/// Result of applying a position to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    Unknown,
    Stayed,
    Switched { from: RegionCoord, to: RegionCoord },
    /// Target region is not loaded; the entity was dropped from the model.
    LeftView { from: RegionCoord },
    /// The local player moved into a region that is not loaded yet.
    Detached { from: RegionCoord, to: RegionCoord },
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct WorldModel {
    region_size: u32,
    regions: BTreeMap<RegionCoord, Region>,
    entities: HashMap<EntityId, Entity>,
    player_id: Option<EntityId>,
}

impl WorldModel {
    pub fn new(region_size: u32) -> Self {
        Self {
            region_size: region_size.max(1),
            regions: BTreeMap::new(),
            entities: HashMap::new(),
            player_id: None,
        }
    }

    pub fn region_size(&self) -> u32 {
        self.region_size
    }

    // ------------------------------------------------------------------
    // Regions
    // ------------------------------------------------------------------

    /// Materialize a region. An existing region at `coord` is replaced and
    /// its entities are dropped; the ids are returned. A detached player
    /// standing inside `coord` is attached to the new region.
    pub fn insert_region(&mut self, coord: RegionCoord, tiles: Vec<TileType>) -> Vec<EntityId> {
        let dropped = self.remove_region(coord).unwrap_or_default();
        if !dropped.is_empty() {
            debug!("Region {} replaced, dropped {} entities", coord, dropped.len());
        }
        self.regions
            .insert(coord, Region::new(coord, self.region_size, tiles));
        self.attach_player(coord);
        dropped
    }

    /// Discard every entity in the region, then delete it. The local player
    /// is kept, detached. Returns the removed entity ids, or `None` if the
    /// region was not loaded.
    pub fn remove_region(&mut self, coord: RegionCoord) -> Option<Vec<EntityId>> {
        let region = self.regions.remove(&coord)?;
        let mut ids = Vec::with_capacity(region.entities.len());
        for id in region.entities {
            if self.player_id == Some(id) {
                debug!("Player {} detached from region {}", id, coord);
                continue;
            }
            self.entities.remove(&id);
            ids.push(id);
        }
        Some(ids)
    }

    fn attach_player(&mut self, coord: RegionCoord) {
        let Some(id) = self.player_id else {
            return;
        };
        let Some(player) = self.entities.get_mut(&id) else {
            return;
        };
        if RegionCoord::containing(player.position, self.region_size) != coord {
            return;
        }
        let from = std::mem::replace(&mut player.region, coord);
        if from != coord {
            if let Some(r) = self.regions.get_mut(&from) {
                r.entities.remove(&id);
            }
        }
        if let Some(r) = self.regions.get_mut(&coord) {
            r.entities.insert(id);
        }
        debug!("Player {} attached to region {}", id, coord);
    }

    pub fn region(&self, coord: RegionCoord) -> Option<&Region> {
        self.regions.get(&coord)
    }

    pub fn has_region(&self, coord: RegionCoord) -> bool {
        self.regions.contains_key(&coord)
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Coordinates of dirty regions; clears their flags.
    pub fn take_dirty_regions(&mut self) -> Vec<RegionCoord> {
        self.regions
            .values_mut()
            .filter(|r| r.dirty)
            .map(|r| {
                r.dirty = false;
                r.coord
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Tiles
    // ------------------------------------------------------------------

    pub fn tile_at(&self, x: i32, y: i32) -> Option<TileType> {
        let c = TileChange::from_world(x, y, 0, self.region_size);
        self.regions.get(&c.region)?.tile(c.local_x, c.local_y)
    }

    /// Apply a tile change. Returns `false` if the region is not loaded.
    pub fn apply_tile(&mut self, change: &TileChange) -> bool {
        match self.regions.get_mut(&change.region) {
            Some(region) => region.set_tile(change.local_x, change.local_y, change.tile),
            None => {
                debug!("Tile change for unloaded region {}", change.region);
                false
            }
        }
    }

    pub fn set_tile(&mut self, x: i32, y: i32, tile: TileType) -> bool {
        self.apply_tile(&TileChange::from_world(x, y, tile, self.region_size))
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    /// Insert or overwrite an entity in the region recorded on it.
    ///
    /// Returns `false` if that region is not loaded. Any entity already
    /// indexed under the same id is dropped in that case too. The local
    /// player is never rejected; it is stored detached instead.
    pub fn insert_entity(&mut self, entity: Entity) -> bool {
        if !self.regions.contains_key(&entity.region) && !self.is_player(entity.id) {
            warn!(
                "Entity {} added in unloaded region {}, skipping",
                entity.id, entity.region
            );
            if self.remove_entity(entity.id).is_some() {
                debug!("Dropped stale entity {}", entity.id);
            }
            return false;
        }
        if let Some(old) = self.entities.remove(&entity.id) {
            if let Some(r) = self.regions.get_mut(&old.region) {
                r.entities.remove(&old.id);
            }
        }
        if let Some(r) = self.regions.get_mut(&entity.region) {
            r.entities.insert(entity.id);
        }
        self.entities.insert(entity.id, entity);
        true
    }

    pub fn remove_entity(&mut self, id: EntityId) -> Option<Entity> {
        let entity = self.entities.remove(&id)?;
        if let Some(r) = self.regions.get_mut(&entity.region) {
            r.entities.remove(&id);
        }
        Some(entity)
    }

    /// Set an entity's position. Region membership only changes when
    /// `switch_region` is set.
    pub fn move_entity(&mut self, id: EntityId, position: Vec2, switch_region: bool) -> MoveOutcome {
        let region_size = self.region_size;
        let Some(entity) = self.entities.get_mut(&id) else {
            return MoveOutcome::Unknown;
        };
        entity.position = position;
        if !switch_region {
            return MoveOutcome::Stayed;
        }
        let from = entity.region;
        let to = RegionCoord::containing(position, region_size);
        if from == to {
            return MoveOutcome::Stayed;
        }
        if !self.regions.contains_key(&to) && self.player_id == Some(id) {
            entity.region = to;
            if let Some(r) = self.regions.get_mut(&from) {
                r.entities.remove(&id);
            }
            debug!("Player {} waiting for region {}", id, to);
            return MoveOutcome::Detached { from, to };
        }
        if !self.regions.contains_key(&to) {
            debug!("Entity {} left view into unloaded region {}", id, to);
            self.remove_entity(id);
            return MoveOutcome::LeftView { from };
        }
        entity.region = to;
        if let Some(r) = self.regions.get_mut(&from) {
            r.entities.remove(&id);
        }
        if let Some(r) = self.regions.get_mut(&to) {
            r.entities.insert(id);
        }
        MoveOutcome::Switched { from, to }
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    /// Whether the entity is listed in a loaded region.
    pub fn is_attached(&self, id: EntityId) -> bool {
        self.entities
            .get(&id)
            .and_then(|e| self.regions.get(&e.region))
            .is_some_and(|r| r.entities.contains(&id))
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub(crate) fn entities_mut(&mut self) -> impl Iterator<Item = &mut Entity> {
        self.entities.values_mut()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    // ------------------------------------------------------------------
    // Player
    // ------------------------------------------------------------------

    pub fn set_player_id(&mut self, id: Option<EntityId>) {
        self.player_id = id;
    }

    pub fn player_id(&self) -> Option<EntityId> {
        self.player_id
    }

    pub fn is_player(&self, id: EntityId) -> bool {
        self.player_id == Some(id)
    }

    pub fn player(&self) -> Option<&Entity> {
        self.player_id.and_then(|id| self.entities.get(&id))
    }

    /// Reset all state (called on disconnect).
    pub fn clear(&mut self) {
        self.regions.clear();
        self.entities.clear();
        self.player_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> WorldModel {
        let mut w = WorldModel::new(8);
        w.insert_region(RegionCoord::new(0, 0), vec![0; 64]);
        w
    }

    fn entity(id: EntityId, x: f32, y: f32) -> Entity {
        Entity::from_spawn(EntitySpawn::new(id, 5, Vec2::new(x, y)), 8)
    }

    // ---------------------------------------------------------------
    // Regions
    // ---------------------------------------------------------------

    #[test]
    fn removing_region_drops_its_entities() {
        let mut w = model();
        w.insert_entity(entity(1, 1.0, 1.0));
        w.insert_entity(entity(2, 2.0, 2.0));
        let mut removed = w.remove_region(RegionCoord::new(0, 0)).unwrap();
        removed.sort();
        assert_eq!(removed, vec![1, 2]);
        assert_eq!(w.entity_count(), 0);
        assert_eq!(w.region_count(), 0);
    }

    #[test]
    fn removing_unknown_region_is_none() {
        let mut w = WorldModel::new(8);
        assert_eq!(w.remove_region(RegionCoord::new(3, 3)), None);
    }

    #[test]
    fn tile_writes_mark_region_dirty() {
        let mut w = model();
        assert!(w.set_tile(3, 4, 9));
        assert_eq!(w.tile_at(3, 4), Some(9));
        assert_eq!(w.take_dirty_regions(), vec![RegionCoord::new(0, 0)]);
        assert!(w.take_dirty_regions().is_empty());
        assert!(!w.set_tile(-1, 0, 9));
    }

    // ---------------------------------------------------------------
    // Entities
    // ---------------------------------------------------------------

    #[test]
    fn duplicate_insert_keeps_one_entity() {
        let mut w = model();
        w.insert_entity(entity(1, 1.0, 1.0));
        w.insert_entity(entity(1, 6.0, 6.0));
        assert_eq!(w.entity_count(), 1);
        assert_eq!(w.entity(1).unwrap().position, Vec2::new(6.0, 6.0));
        assert_eq!(w.region(RegionCoord::new(0, 0)).unwrap().entities.len(), 1);
    }

    #[test]
    fn insert_into_unloaded_region_is_skipped() {
        let mut w = model();
        assert!(!w.insert_entity(entity(1, 100.0, 1.0)));
        assert!(!w.contains(1));
    }

    #[test]
    fn rejected_insert_drops_stale_copy() {
        let mut w = model();
        w.insert_entity(entity(1, 1.0, 1.0));
        assert!(!w.insert_entity(entity(1, 100.0, 1.0)));
        assert!(!w.contains(1));
        assert!(w.region(RegionCoord::new(0, 0)).unwrap().entities.is_empty());
    }

    #[test]
    fn switch_region_moves_membership() {
        let mut w = model();
        w.insert_region(RegionCoord::new(1, 0), vec![0; 64]);
        w.insert_entity(entity(1, 1.0, 1.0));

        assert_eq!(w.move_entity(1, Vec2::new(9.0, 1.0), false), MoveOutcome::Stayed);
        assert_eq!(w.entity(1).unwrap().region, RegionCoord::new(0, 0));

        assert_eq!(
            w.move_entity(1, Vec2::new(9.0, 1.0), true),
            MoveOutcome::Switched {
                from: RegionCoord::new(0, 0),
                to: RegionCoord::new(1, 0)
            }
        );
        assert!(w.region(RegionCoord::new(0, 0)).unwrap().entities.is_empty());
        assert!(w.region(RegionCoord::new(1, 0)).unwrap().entities.contains(&1));
    }

    #[test]
    fn switch_into_unloaded_region_drops_entity() {
        let mut w = model();
        w.insert_entity(entity(1, 1.0, 1.0));
        assert_eq!(
            w.move_entity(1, Vec2::new(50.0, 50.0), true),
            MoveOutcome::LeftView {
                from: RegionCoord::new(0, 0)
            }
        );
        assert!(!w.contains(1));
    }

    #[test]
    fn player_waits_detached_until_its_region_loads() {
        let mut w = model();
        w.set_player_id(Some(1));
        w.insert_entity(entity(1, 1.0, 1.0));

        assert_eq!(
            w.move_entity(1, Vec2::new(50.0, 50.0), true),
            MoveOutcome::Detached {
                from: RegionCoord::new(0, 0),
                to: RegionCoord::new(6, 6)
            }
        );
        assert!(w.contains(1));
        assert!(!w.is_attached(1));
        assert!(w.region(RegionCoord::new(0, 0)).unwrap().entities.is_empty());

        assert!(w.insert_region(RegionCoord::new(6, 6), vec![0; 64]).is_empty());
        assert!(w.is_attached(1));
        assert_eq!(w.entity(1).unwrap().region, RegionCoord::new(6, 6));
    }

    #[test]
    fn replacing_player_region_keeps_player() {
        let mut w = model();
        w.set_player_id(Some(1));
        w.insert_entity(entity(1, 1.0, 1.0));
        w.insert_entity(entity(2, 2.0, 2.0));

        assert_eq!(w.insert_region(RegionCoord::new(0, 0), vec![0; 64]), vec![2]);
        assert!(w.is_attached(1));
        assert!(!w.contains(2));

        assert_eq!(w.remove_region(RegionCoord::new(0, 0)), Some(vec![]));
        assert!(w.contains(1));
        assert!(!w.is_attached(1));
    }

    #[test]
    fn missing_crc_is_derived_from_info() {
        let mut spawn = EntitySpawn::new(3, AVATAR_TYPE, Vec2::zero());
        spawn.info = Some(vec![1, 2, 3]);
        let e = Entity::from_spawn(spawn, 8);
        assert!(e.is_avatar());
        assert_eq!(e.crc, Some(info_crc(&[1, 2, 3])));
        assert_eq!(e.appearance_crc, e.crc);
    }

    #[test]
    fn clear_resets_everything() {
        let mut w = model();
        w.insert_entity(entity(1, 1.0, 1.0));
        w.set_player_id(Some(1));
        w.clear();
        assert_eq!(w.region_count(), 0);
        assert_eq!(w.entity_count(), 0);
        assert_eq!(w.player_id(), None);
    }
}
