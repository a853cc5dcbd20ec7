//! Per-session lookup tables.
//!
//! Built when a session starts and dropped with it, so nothing learned from
//! one server leaks into the next join.

use crate::protocol::{MapInfo, WorldState};
use crate::types::EntityId;
use std::collections::{BTreeMap, HashMap};

/// What `entityInfo` told us about an entity we could not resolve locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityInfo {
    pub name: String,
    pub crc: u32,
    pub name_bad: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub server: String,
    pub version: String,
    pub features: Vec<String>,
    entity_types: BTreeMap<u16, String>,
    entity_info: HashMap<EntityId, EntityInfo>,
    player_info: Option<Vec<u8>>,
    pub map: MapInfo,
    pub map_state: serde_json::Value,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `worldState`. An initial state replaces the type table, later
    /// ones extend it.
    pub fn apply_world_state(&mut self, state: WorldState, initial: bool) {
        if initial {
            self.entity_types.clear();
        }
        self.server = state.server;
        self.version = state.version;
        self.features = state.features;
        self.entity_types.extend(state.entity_types);
    }

    pub fn apply_map_state(&mut self, info: MapInfo, state: serde_json::Value) {
        self.map = info;
        self.map_state = state;
    }

    /// Shallow-merge a `mapUpdate` into the current map state.
    pub fn apply_map_update(&mut self, update: serde_json::Value) {
        match (&mut self.map_state, update) {
            (serde_json::Value::Object(current), serde_json::Value::Object(patch)) => {
                current.extend(patch);
            }
            (slot, other) => *slot = other,
        }
    }

    pub fn type_name(&self, type_id: u16) -> Option<&str> {
        self.entity_types.get(&type_id).map(String::as_str)
    }

    pub fn type_id(&self, name: &str) -> Option<u16> {
        self.entity_types
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(id, _)| *id)
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }

    pub fn remember_entity(&mut self, id: EntityId, info: EntityInfo) {
        self.entity_info.insert(id, info);
    }

    pub fn entity_info(&self, id: EntityId) -> Option<&EntityInfo> {
        self.entity_info.get(&id)
    }

    /// Appearance blob `myEntity` sent for the local player.
    pub fn set_player_info(&mut self, info: Vec<u8>) {
        self.player_info = Some(info);
    }

    pub fn player_info(&self) -> Option<&[u8]> {
        self.player_info.as_deref()
    }

    /// Display name for an entity, hiding names the server flagged as bad.
    pub fn display_name(&self, id: EntityId) -> Option<&str> {
        self.entity_info
            .get(&id)
            .filter(|i| !i.name_bad)
            .map(|i| i.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(types: &[(u16, &str)]) -> WorldState {
        WorldState {
            server: "main".into(),
            version: "1.2".into(),
            features: vec!["editor".into()],
            entity_types: types.iter().map(|(id, n)| (*id, n.to_string())).collect(),
        }
    }

    #[test]
    fn initial_world_state_replaces_type_table() {
        let mut ctx = SessionContext::new();
        ctx.apply_world_state(state(&[(3, "tree")]), true);
        ctx.apply_world_state(state(&[(4, "rock")]), false);
        assert_eq!(ctx.type_name(3), Some("tree"));
        assert_eq!(ctx.type_id("rock"), Some(4));

        ctx.apply_world_state(state(&[(5, "lamp")]), true);
        assert_eq!(ctx.type_name(3), None);
        assert!(ctx.has_feature("editor"));
    }

    #[test]
    fn map_update_merges_objects() {
        let mut ctx = SessionContext::new();
        ctx.apply_map_state(MapInfo::default(), json!({ "time": 1, "season": "winter" }));
        ctx.apply_map_update(json!({ "time": 2 }));
        assert_eq!(ctx.map_state, json!({ "time": 2, "season": "winter" }));
    }

    #[test]
    fn bad_names_are_not_displayed() {
        let mut ctx = SessionContext::new();
        ctx.remember_entity(
            9,
            EntityInfo {
                name: "rude".into(),
                crc: 1,
                name_bad: true,
            },
        );
        assert_eq!(ctx.display_name(9), None);
        assert_eq!(ctx.entity_info(9).map(|i| i.crc), Some(1));
    }
}
