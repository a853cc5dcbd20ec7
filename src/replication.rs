//! `WorldSync` – applies region and entity updates to the world model.
//!
//! ## Processing order
//!
//! One `update` frame is applied in a fixed order:
//!
//! ```text
//! 1. region teardowns     (detach + drop entities, delete region)
//! 2. region snapshots     (materialize, full-add entities)
//! 3. update blob records  (add / update / remove / tile, in blob order)
//! 4. region update blobs  (region-local tile changes)
//! 5. says
//! ```
//!
//! Nothing inside a step is reordered, so a remove followed by an add of
//! the same id always leaves the entity present with the new fields.
//!
//! ## Player authority
//!
//! The local player's position and velocity are owned by the client.
//! `UpdateEntity` records for the player only patch the non-movement
//! fields; the server moves the player exclusively through
//! [`WorldSync::fix_position`], which is acknowledged upstream.
//!
//! Side effects for the host are queued as [`WorldEvent`]s, outbound
//! requests as [`ClientCall`]s; both are drained by the owner each tick.

use crate::events::WorldEvent;
use crate::protocol::{ClientCall, SayTuple};
use crate::scheduler::{Scheduler, TimerHandle};
use crate::types::{EntityId, RegionCoord, SyncConfig, TileType, Vec2};
use crate::update::{
    decode_region_snapshot, decode_region_update, decode_updates, EntityPatch, EntitySpawn,
    EntityState, UpdateRecord,
};
use crate::world::{info_crc, Entity, MoveOutcome, Speech, WorldModel};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncTimer {
    /// Swap the shown appearance to `crc` once the poof has played.
    Poof { id: EntityId, crc: u32 },
    /// Clear the selection if `id` has not come back.
    ClearSelection { id: EntityId },
}

/// Facing/head/posture set locally, waiting to be merged into the next
/// server state for the player.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalOverrides {
    pub facing_right: Option<bool>,
    pub head_turned: Option<bool>,
    pub posture: Option<u8>,
}

impl LocalOverrides {
    pub fn is_empty(&self) -> bool {
        self.facing_right.is_none() && self.head_turned.is_none() && self.posture.is_none()
    }

    pub fn apply(&self, mut state: EntityState) -> EntityState {
        if let Some(v) = self.facing_right {
            state = state.with_facing_right(v);
        }
        if let Some(v) = self.head_turned {
            state = state.with_head_turned(v);
        }
        if let Some(v) = self.posture {
            state = state.with_posture(v);
        }
        state
    }
}

/// A say for an entity that was not known when it arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSay {
    pub entity: EntityId,
    pub message: String,
    pub kind: u8,
    pub received_at: Instant,
}

#[derive(Debug)]
pub struct WorldSync {
    config: SyncConfig,
    world: WorldModel,
    timers: Scheduler<SyncTimer>,
    poof_timers: HashMap<EntityId, TimerHandle>,
    selection: Option<EntityId>,
    selection_timer: Option<TimerHandle>,
    pending_says: VecDeque<PendingSay>,
    resolve_requested: HashSet<EntityId>,
    overrides: LocalOverrides,
    player_ready: bool,
    events: VecDeque<WorldEvent>,
    outbound: VecDeque<ClientCall>,
}

impl WorldSync {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            world: WorldModel::new(config.region_size),
            config,
            timers: Scheduler::new(),
            poof_timers: HashMap::new(),
            selection: None,
            selection_timer: None,
            pending_says: VecDeque::new(),
            resolve_requested: HashSet::new(),
            overrides: LocalOverrides::default(),
            player_ready: false,
            events: VecDeque::new(),
            outbound: VecDeque::new(),
        }
    }

    pub fn world(&self) -> &WorldModel {
        &self.world
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn selected(&self) -> Option<EntityId> {
        self.selection
    }

    pub fn pending_says(&self) -> impl Iterator<Item = &PendingSay> {
        self.pending_says.iter()
    }

    pub fn overrides(&self) -> LocalOverrides {
        self.overrides
    }

    pub fn is_player_ready(&self) -> bool {
        self.player_ready
    }

    /// Number of scheduled poof/selection timers.
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    pub fn drain_events(&mut self) -> Vec<WorldEvent> {
        self.events.drain(..).collect()
    }

    pub fn drain_outbound(&mut self) -> Vec<ClientCall> {
        self.outbound.drain(..).collect()
    }

    fn emit(&mut self, event: WorldEvent) {
        self.events.push_back(event);
    }

    // -----------------------------------------------------------------------
    // Session
    // -----------------------------------------------------------------------

    /// Record the local player's id (`myEntity`).
    pub fn set_player(&mut self, id: EntityId) {
        if self.world.player_id() != Some(id) {
            self.player_ready = false;
        }
        self.world.set_player_id(Some(id));
        if self.world.contains(id) {
            self.complete_player_setup(id);
        }
    }

    fn complete_player_setup(&mut self, id: EntityId) {
        if self.player_ready {
            return;
        }
        self.player_ready = true;
        info!("Player entity {} ready", id);
        self.emit(WorldEvent::PlayerReady { id });
    }

    /// Drop all world state and cancel every timer.
    pub fn reset(&mut self) {
        self.timers.clear();
        self.poof_timers.clear();
        self.selection = None;
        self.selection_timer = None;
        self.pending_says.clear();
        self.resolve_requested.clear();
        self.overrides = LocalOverrides::default();
        self.player_ready = false;
        self.outbound.clear();
        self.world.clear();
    }

    // -----------------------------------------------------------------------
    // Update frame
    // -----------------------------------------------------------------------

    /// Apply one `update` frame. Malformed blobs are logged and skipped
    /// individually; the rest of the frame is still applied.
    pub fn apply_update(
        &mut self,
        unsubscribes: &[RegionCoord],
        subscribes: &[Vec<u8>],
        updates: &[u8],
        regions: &[Vec<u8>],
        says: &[SayTuple],
        now: Instant,
    ) {
        for coord in unsubscribes {
            self.teardown_region(*coord, now);
        }
        for blob in subscribes {
            self.apply_snapshot_blob(blob, now);
        }
        if !updates.is_empty() {
            self.apply_update_blob(updates, now);
        }
        for blob in regions {
            self.apply_region_update_blob(blob);
        }
        for say in says {
            self.say(say.entity, &say.message, say.kind, now);
        }
    }

    pub fn apply_snapshot_blob(&mut self, blob: &[u8], now: Instant) {
        match decode_region_snapshot(blob, self.world.region_size()) {
            Ok(snapshot) => {
                for id in self.world.insert_region(snapshot.coord, snapshot.tiles) {
                    self.entity_gone(id, now);
                }
                debug!(
                    "Region {} subscribed with {} entities",
                    snapshot.coord,
                    snapshot.entities.len()
                );
                self.emit(WorldEvent::RegionAdded {
                    coord: snapshot.coord,
                });
                for spawn in snapshot.entities {
                    self.add_entity(spawn, now);
                }
            }
            Err(e) => warn!("Skipping region snapshot: {}", e),
        }
    }

    pub fn apply_update_blob(&mut self, blob: &[u8], now: Instant) {
        match decode_updates(blob) {
            Ok(records) => {
                for record in records {
                    self.apply_record(record, now);
                }
            }
            Err(e) => warn!("Skipping update blob ({} bytes): {}", blob.len(), e),
        }
    }

    pub fn apply_region_update_blob(&mut self, blob: &[u8]) {
        let changes = match decode_region_update(blob) {
            Ok(changes) => changes,
            Err(e) => {
                warn!("Skipping region update: {}", e);
                return;
            }
        };
        let size = self.world.region_size() as i32;
        for change in changes {
            if self.world.apply_tile(&change) {
                self.emit(WorldEvent::TileChanged {
                    region: change.region,
                    x: change.region.x * size + change.local_x as i32,
                    y: change.region.y * size + change.local_y as i32,
                    tile: change.tile,
                });
            }
        }
    }

    pub fn apply_record(&mut self, record: UpdateRecord, now: Instant) {
        match record {
            UpdateRecord::Add(spawn) => self.add_entity(spawn, now),
            UpdateRecord::Update(patch) => self.update_entity(patch, now),
            UpdateRecord::Remove(id) => self.remove_entity(id, now),
            UpdateRecord::Tile { x, y, tile } => self.change_tile(x, y, tile),
        }
    }

    // -----------------------------------------------------------------------
    // Regions and tiles
    // -----------------------------------------------------------------------

    pub fn teardown_region(&mut self, coord: RegionCoord, now: Instant) {
        match self.world.remove_region(coord) {
            Some(ids) => {
                for id in ids {
                    self.entity_gone(id, now);
                }
                self.emit(WorldEvent::RegionRemoved { coord });
            }
            None => debug!("Teardown for unloaded region {}", coord),
        }
    }

    pub fn change_tile(&mut self, x: i32, y: i32, tile: TileType) {
        if self.world.set_tile(x, y, tile) {
            let region = RegionCoord::of_tile(x, y, self.world.region_size());
            self.emit(WorldEvent::TileChanged { region, x, y, tile });
        }
    }

    // -----------------------------------------------------------------------
    // Entities
    // -----------------------------------------------------------------------

    /// Insert an entity, overwriting any entity with the same id.
    pub fn add_entity(&mut self, spawn: EntitySpawn, now: Instant) {
        let id = spawn.id;
        let is_player = self.world.is_player(id);
        let existed = self.world.contains(id);
        let mut entity = Entity::from_spawn(spawn, self.world.region_size());

        if let Some(old) = self.world.entity(id) {
            entity.speech = old.speech.clone();
            if is_player {
                entity.position = old.position;
                entity.velocity = old.velocity;
                entity.region = old.region;
            }
        }

        if !self.world.insert_entity(entity) {
            if existed {
                self.entity_gone(id, now);
            }
            return;
        }
        if let Some(handle) = self.poof_timers.remove(&id) {
            self.timers.cancel(handle);
        }
        if self.selection == Some(id) {
            if let Some(handle) = self.selection_timer.take() {
                self.timers.cancel(handle);
            }
        }
        self.emit(WorldEvent::EntityAdded { id });
        if is_player {
            self.complete_player_setup(id);
        }
        self.flush_pending_says(id, now);
    }

    pub fn update_entity(&mut self, patch: EntityPatch, now: Instant) {
        let id = patch.id;
        let is_player = self.world.is_player(id);
        let poof_delay = self.config.poof_delay();
        let Some(entity) = self.world.entity_mut(id) else {
            debug!("Update for unknown entity {}", id);
            return;
        };

        if let Some(state) = patch.state {
            entity.state = if is_player {
                let merged = self.overrides.apply(state);
                self.overrides = LocalOverrides::default();
                merged
            } else {
                state
            };
        }
        if let Some(ps) = patch.player_state {
            entity.player_state = ps;
        }
        if let Some(options) = patch.options {
            entity.options = Some(options);
        }
        if let Some(name) = patch.name {
            entity.name = Some(name);
        }

        let mut appearance = None;
        match patch.info {
            Some(info) => {
                let crc = patch.crc.unwrap_or_else(|| info_crc(&info));
                entity.info = Some(info);
                if entity.crc != Some(crc) {
                    entity.crc = Some(crc);
                    appearance = Some((crc, entity.is_hidden()));
                }
            }
            None => {
                if patch.crc.is_some() {
                    entity.crc = patch.crc;
                }
            }
        }

        if !is_player {
            if let Some(v) = patch.velocity {
                entity.velocity = v;
            }
        }

        match appearance {
            Some((crc, true)) => {
                if let Some(e) = self.world.entity_mut(id) {
                    e.appearance_crc = Some(crc);
                }
                self.emit(WorldEvent::AppearanceSwapped { id, crc });
            }
            Some((crc, false)) => {
                if let Some(handle) = self.poof_timers.remove(&id) {
                    self.timers.cancel(handle);
                }
                let handle = self
                    .timers
                    .schedule_after(now, poof_delay, SyncTimer::Poof { id, crc });
                self.poof_timers.insert(id, handle);
                self.emit(WorldEvent::PoofStarted { id });
            }
            None => {}
        }

        if !is_player {
            if let Some(position) = patch.position {
                match self.world.move_entity(id, position, patch.switch_region) {
                    MoveOutcome::Switched { from, to } => {
                        self.emit(WorldEvent::EntityMoved { id, from, to });
                    }
                    MoveOutcome::LeftView { .. } => {
                        self.entity_gone(id, now);
                        return;
                    }
                    MoveOutcome::Stayed | MoveOutcome::Unknown | MoveOutcome::Detached { .. } => {}
                }
            }
        }
        self.emit(WorldEvent::EntityUpdated { id });
    }

    pub fn remove_entity(&mut self, id: EntityId, now: Instant) {
        if self.world.remove_entity(id).is_some() {
            self.entity_gone(id, now);
        } else {
            debug!("Remove for unknown entity {}", id);
        }
    }

    /// Bookkeeping after `id` left the model.
    fn entity_gone(&mut self, id: EntityId, now: Instant) {
        if let Some(handle) = self.poof_timers.remove(&id) {
            self.timers.cancel(handle);
        }
        if self.selection == Some(id) && self.selection_timer.is_none() {
            let handle = self.timers.schedule_after(
                now,
                self.config.selection_grace(),
                SyncTimer::ClearSelection { id },
            );
            self.selection_timer = Some(handle);
        }
        self.emit(WorldEvent::EntityRemoved { id });
    }

    // -----------------------------------------------------------------------
    // Says
    // -----------------------------------------------------------------------

    pub fn say(&mut self, entity: EntityId, message: &str, kind: u8, now: Instant) {
        let expires_at = now + self.config.speech_ttl();
        if let Some(e) = self.world.entity_mut(entity) {
            e.speech.push(Speech {
                message: message.to_string(),
                kind,
                expires_at,
            });
            self.emit(WorldEvent::Said {
                id: entity,
                message: message.to_string(),
                kind,
            });
            return;
        }

        if self.pending_says.len() >= self.config.pending_say_limit {
            if let Some(dropped) = self.pending_says.pop_front() {
                debug!("Pending say list full, dropping say for {}", dropped.entity);
                self.forget_resolve_if_idle(dropped.entity);
            }
        }
        if self.config.pending_say_limit == 0 {
            return;
        }
        self.pending_says.push_back(PendingSay {
            entity,
            message: message.to_string(),
            kind,
            received_at: now,
        });
        if self.resolve_requested.insert(entity) {
            self.outbound.push_back(ClientCall::ResolveEntity { id: entity });
        }
    }

    /// Deliver pending says for `id` now that the entity is in the model.
    fn flush_pending_says(&mut self, id: EntityId, now: Instant) {
        if !self.resolve_requested.remove(&id) {
            return;
        }
        let (ready, rest): (Vec<_>, Vec<_>) = self
            .pending_says
            .drain(..)
            .partition(|p| p.entity == id);
        self.pending_says = rest.into();
        for p in ready {
            self.say(p.entity, &p.message, p.kind, now);
        }
    }

    /// `entityInfo` arrived for an entity that is still not in view: hand
    /// its pending says to the chat log without attaching speech bubbles.
    pub fn entity_info_resolved(&mut self, id: EntityId) {
        if self.world.contains(id) || !self.resolve_requested.remove(&id) {
            return;
        }
        let (ready, rest): (Vec<_>, Vec<_>) = self
            .pending_says
            .drain(..)
            .partition(|p| p.entity == id);
        self.pending_says = rest.into();
        for p in ready {
            self.emit(WorldEvent::Said {
                id,
                message: p.message,
                kind: p.kind,
            });
        }
    }

    fn forget_resolve_if_idle(&mut self, id: EntityId) {
        if !self.pending_says.iter().any(|p| p.entity == id) {
            self.resolve_requested.remove(&id);
        }
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    pub fn select(&mut self, id: Option<EntityId>) {
        if let Some(handle) = self.selection_timer.take() {
            self.timers.cancel(handle);
        }
        if self.selection != id {
            self.selection = id;
            self.emit(WorldEvent::SelectionChanged { id });
        }
    }

    /// Server-driven selection change: only applies if `current` is still
    /// what the user has selected. `new == 0` clears it.
    pub fn update_selection(&mut self, current: EntityId, new: EntityId) {
        if self.selection == Some(current) {
            self.select((new != 0).then_some(new));
        }
    }

    // -----------------------------------------------------------------------
    // Local player
    // -----------------------------------------------------------------------

    /// Authoritative correction of the player's position.
    pub fn fix_position(&mut self, x: f32, y: f32, safe: bool, now: Instant) {
        if let Some(id) = self.world.player_id() {
            if let Some(player) = self.world.entity_mut(id) {
                player.velocity = Vec2::zero();
            }
            self.relocate_player(id, Vec2::new(x, y), now);
        }
        self.emit(WorldEvent::PositionFixed { x, y, safe });
        self.outbound.push_back(ClientCall::FixedPositionAck);
    }

    /// Client-predicted movement of the local player.
    pub fn move_player(&mut self, position: Vec2, velocity: Vec2, now: Instant) {
        let Some(id) = self.world.player_id() else {
            return;
        };
        if let Some(player) = self.world.entity_mut(id) {
            player.velocity = velocity;
        }
        self.relocate_player(id, position, now);
    }

    fn relocate_player(&mut self, id: EntityId, position: Vec2, now: Instant) {
        match self.world.move_entity(id, position, true) {
            MoveOutcome::Switched { from, to } => {
                self.emit(WorldEvent::EntityMoved { id, from, to });
            }
            MoveOutcome::Detached { to, .. } => {
                debug!("Player {} ahead of loaded regions, waiting for {}", id, to);
            }
            MoveOutcome::LeftView { .. } => self.entity_gone(id, now),
            MoveOutcome::Stayed | MoveOutcome::Unknown => {}
        }
    }

    pub fn set_local_facing(&mut self, facing_right: bool) {
        self.overrides.facing_right = Some(facing_right);
        self.apply_overrides_locally();
    }

    pub fn set_local_head_turned(&mut self, head_turned: bool) {
        self.overrides.head_turned = Some(head_turned);
        self.apply_overrides_locally();
    }

    pub fn set_local_posture(&mut self, posture: u8) {
        self.overrides.posture = Some(posture);
        self.apply_overrides_locally();
    }

    fn apply_overrides_locally(&mut self) {
        let overrides = self.overrides;
        let Some(id) = self.world.player_id() else {
            return;
        };
        if let Some(player) = self.world.entity_mut(id) {
            player.state = overrides.apply(player.state);
            self.emit(WorldEvent::EntityUpdated { id });
        }
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Fire due timers and expire speech and pending says.
    pub fn tick(&mut self, now: Instant) {
        for (handle, timer) in self.timers.drain_due(now) {
            match timer {
                SyncTimer::Poof { id, crc } => {
                    if self.poof_timers.get(&id) == Some(&handle) {
                        self.poof_timers.remove(&id);
                    }
                    let Some(entity) = self.world.entity_mut(id) else {
                        continue;
                    };
                    if entity.crc == Some(crc) {
                        entity.appearance_crc = Some(crc);
                        self.emit(WorldEvent::AppearanceSwapped { id, crc });
                    }
                }
                SyncTimer::ClearSelection { id } => {
                    if self.selection_timer == Some(handle) {
                        self.selection_timer = None;
                    }
                    if self.selection == Some(id) && !self.world.contains(id) {
                        self.selection = None;
                        self.emit(WorldEvent::SelectionChanged { id: None });
                    }
                }
            }
        }

        for entity in self.world.entities_mut() {
            entity.speech.retain(|s| s.expires_at > now);
        }

        let ttl = self.config.pending_say_ttl();
        let before = self.pending_says.len();
        self.pending_says.retain(|p| p.received_at + ttl > now);
        if self.pending_says.len() != before {
            debug!("Dropped {} unresolved says", before - self.pending_says.len());
            let live: HashSet<EntityId> = self.pending_says.iter().map(|p| p.entity).collect();
            self.resolve_requested.retain(|id| live.contains(id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::{encode_region_snapshot, encode_updates, RegionSnapshot, TileChange};
    use std::time::Duration;

    fn sync() -> WorldSync {
        WorldSync::new(SyncConfig::default())
    }

    fn snapshot(coord: RegionCoord, entities: Vec<EntitySpawn>) -> Vec<u8> {
        encode_region_snapshot(&RegionSnapshot {
            coord,
            tiles: vec![0; 64],
            entities,
        })
        .to_vec()
    }

    fn spawn(id: EntityId, x: f32, y: f32) -> EntitySpawn {
        EntitySpawn::new(id, 7, Vec2::new(x, y))
    }

    #[test]
    fn teardown_runs_before_snapshot_in_one_frame() {
        let now = Instant::now();
        let mut s = sync();
        let origin = RegionCoord::new(0, 0);
        s.apply_snapshot_blob(&snapshot(origin, vec![spawn(1, 1.0, 1.0)]), now);

        s.apply_update(
            &[origin],
            &[snapshot(origin, vec![spawn(2, 2.0, 2.0)])],
            &[],
            &[],
            &[],
            now,
        );
        assert!(!s.world().contains(1));
        assert!(s.world().contains(2));
    }

    #[test]
    fn bad_snapshot_does_not_block_the_rest_of_the_frame() {
        let now = Instant::now();
        let mut s = sync();
        let good = snapshot(RegionCoord::new(0, 0), vec![spawn(1, 1.0, 1.0)]);
        s.apply_update(&[], &[vec![1, 2], good], &[], &[], &[], now);
        assert!(s.world().contains(1));
    }

    #[test]
    fn region_update_blob_changes_tiles() {
        let now = Instant::now();
        let mut s = sync();
        s.apply_snapshot_blob(&snapshot(RegionCoord::new(1, 0), vec![]), now);
        let change = TileChange::from_world(9, 2, 4, 8);
        let blob = crate::update::encode_region_update(change.region, &[change]);
        s.apply_region_update_blob(&blob);
        assert_eq!(s.world().tile_at(9, 2), Some(4));
        assert!(s.drain_events().contains(&WorldEvent::TileChanged {
            region: RegionCoord::new(1, 0),
            x: 9,
            y: 2,
            tile: 4
        }));
    }

    #[test]
    fn info_change_poofs_then_swaps() {
        let t0 = Instant::now();
        let mut s = sync();
        s.apply_snapshot_blob(&snapshot(RegionCoord::new(0, 0), vec![spawn(3, 1.0, 1.0)]), t0);
        s.drain_events();

        let mut patch = EntityPatch::new(3);
        patch.info = Some(vec![9, 9]);
        s.update_entity(patch.clone(), t0);
        let crc = info_crc(&[9, 9]);
        assert_eq!(s.world().entity(3).unwrap().crc, Some(crc));
        assert_eq!(s.world().entity(3).unwrap().appearance_crc, None);
        assert!(s.drain_events().contains(&WorldEvent::PoofStarted { id: 3 }));

        s.tick(t0 + Duration::from_millis(299));
        assert_eq!(s.world().entity(3).unwrap().appearance_crc, None);
        s.tick(t0 + Duration::from_millis(300));
        assert_eq!(s.world().entity(3).unwrap().appearance_crc, Some(crc));

        // Same blob again: crc unchanged, no second poof.
        s.drain_events();
        s.update_entity(patch, t0);
        assert!(!s.drain_events().contains(&WorldEvent::PoofStarted { id: 3 }));
    }

    #[test]
    fn hidden_entity_swaps_without_poof() {
        let now = Instant::now();
        let mut s = sync();
        let mut e = spawn(3, 1.0, 1.0);
        e.player_state = crate::update::PlayerState::HIDDEN;
        s.apply_snapshot_blob(&snapshot(RegionCoord::new(0, 0), vec![e]), now);
        let mut patch = EntityPatch::new(3);
        patch.info = Some(vec![1]);
        patch.crc = Some(44);
        s.update_entity(patch, now);
        assert_eq!(s.world().entity(3).unwrap().appearance_crc, Some(44));
        assert_eq!(s.pending_timers(), 0);
    }

    #[test]
    fn selection_survives_quick_readd() {
        let t0 = Instant::now();
        let mut s = sync();
        s.apply_snapshot_blob(&snapshot(RegionCoord::new(0, 0), vec![spawn(5, 1.0, 1.0)]), t0);
        s.select(Some(5));

        s.apply_update_blob(
            &encode_updates(&[UpdateRecord::Remove(5), UpdateRecord::Add(spawn(5, 2.0, 2.0))]),
            t0,
        );
        s.tick(t0 + Duration::from_secs(5));
        assert_eq!(s.selected(), Some(5));
    }

    #[test]
    fn selection_clears_after_grace() {
        let t0 = Instant::now();
        let mut s = sync();
        s.apply_snapshot_blob(&snapshot(RegionCoord::new(0, 0), vec![spawn(5, 1.0, 1.0)]), t0);
        s.select(Some(5));
        s.remove_entity(5, t0);

        s.tick(t0 + Duration::from_millis(999));
        assert_eq!(s.selected(), Some(5));
        s.tick(t0 + Duration::from_millis(1000));
        assert_eq!(s.selected(), None);
    }

    #[test]
    fn say_for_unknown_entity_waits_and_requests_once() {
        let t0 = Instant::now();
        let mut s = sync();
        s.apply_snapshot_blob(&snapshot(RegionCoord::new(0, 0), vec![]), t0);
        s.say(8, "hi", 0, t0);
        s.say(8, "again", 0, t0);
        assert_eq!(s.drain_outbound(), vec![ClientCall::ResolveEntity { id: 8 }]);
        assert_eq!(s.pending_says().count(), 2);

        s.add_entity(spawn(8, 1.0, 1.0), t0);
        assert_eq!(s.pending_says().count(), 0);
        assert_eq!(s.world().entity(8).unwrap().speech.len(), 2);
    }

    #[test]
    fn pending_says_expire_and_are_bounded() {
        let t0 = Instant::now();
        let mut s = WorldSync::new(SyncConfig {
            pending_say_limit: 2,
            ..SyncConfig::default()
        });
        s.say(1, "a", 0, t0);
        s.say(2, "b", 0, t0);
        s.say(3, "c", 0, t0);
        let ids: Vec<_> = s.pending_says().map(|p| p.entity).collect();
        assert_eq!(ids, vec![2, 3]);

        s.tick(t0 + Duration::from_secs(10));
        assert_eq!(s.pending_says().count(), 0);
    }

    #[test]
    fn speech_expires() {
        let t0 = Instant::now();
        let mut s = sync();
        s.apply_snapshot_blob(&snapshot(RegionCoord::new(0, 0), vec![spawn(1, 1.0, 1.0)]), t0);
        s.say(1, "hello", 0, t0);
        assert_eq!(s.world().entity(1).unwrap().speech.len(), 1);
        s.tick(t0 + Duration::from_secs(6));
        assert!(s.world().entity(1).unwrap().speech.is_empty());
    }

    #[test]
    fn reset_cancels_timers() {
        let t0 = Instant::now();
        let mut s = sync();
        s.apply_snapshot_blob(&snapshot(RegionCoord::new(0, 0), vec![spawn(3, 1.0, 1.0)]), t0);
        let mut patch = EntityPatch::new(3);
        patch.info = Some(vec![1]);
        s.update_entity(patch, t0);
        s.select(Some(3));
        s.remove_entity(3, t0);
        assert_eq!(s.pending_timers(), 1);

        s.reset();
        assert_eq!(s.pending_timers(), 0);
        assert_eq!(s.world().region_count(), 0);
        assert_eq!(s.selected(), None);
    }
}
