//! Core types shared across all modules.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Server-assigned entity identifier. Unique for the lifetime of the entity.
pub type EntityId = u32;

/// Tile type stored in a region's dense tile array.
pub type TileType = u8;

// ---------------------------------------------------------------------------
// Basic math
// ---------------------------------------------------------------------------

/// Position or velocity in world tile units.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn zero() -> Self {
        Self::new(0.0, 0.0)
    }
}

impl std::fmt::Display for Vec2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.2}, {:.2})", self.x, self.y)
    }
}

// ---------------------------------------------------------------------------
// Spatial partitioning
// ---------------------------------------------------------------------------

/// Integer coordinate of a region in the world grid.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RegionCoord {
    pub x: i32,
    pub y: i32,
}

impl RegionCoord {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Region containing the world position `pos` for regions of
    /// `region_size` tiles per side.
    pub fn containing(pos: Vec2, region_size: u32) -> Self {
        let size = region_size.max(1) as f32;
        Self::new((pos.x / size).floor() as i32, (pos.y / size).floor() as i32)
    }

    /// Region containing the integer tile `(x, y)`.
    pub fn of_tile(x: i32, y: i32, region_size: u32) -> Self {
        let size = region_size.max(1) as i32;
        Self::new(x.div_euclid(size), y.div_euclid(size))
    }
}

impl std::fmt::Display for RegionCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{}]", self.x, self.y)
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Timing and sizing constants for one client instance.
///
/// Every duration is stored in milliseconds so the struct can be layered
/// from TOML files and environment variables without custom parsers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Width/height of a region in tiles.
    pub region_size: u32,
    /// Delay before an unobserved subscription is torn down upstream.
    pub teardown_grace_ms: u64,
    /// Delay between the "poof" placeholder and the appearance swap.
    pub poof_delay_ms: u64,
    /// Delay before a removed selected entity clears the selection.
    pub selection_grace_ms: u64,
    /// How long a speech bubble stays attached to an entity.
    pub speech_ttl_ms: u64,
    /// How long a say for an unknown entity waits for that entity.
    pub pending_say_ttl_ms: u64,
    /// Upper bound on unresolved says kept at once.
    pub pending_say_limit: usize,
    /// Grace period after a transport drop before a timeout leave.
    pub disconnect_grace_ms: u64,
    /// A session with no inbound packet for this long is stale.
    pub stale_after_ms: u64,
    /// Status poll interval before the first successful status.
    pub status_poll_fast_ms: u64,
    /// Status poll interval after a successful status.
    pub status_poll_slow_ms: u64,
    /// Backoff between join attempts rejected by the account-creation limit.
    pub account_retry_delay_ms: u64,
    /// Number of join attempts made before giving up on the creation limit.
    pub account_retry_attempts: u32,
}

impl SyncConfig {
    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }

    pub fn poof_delay(&self) -> Duration {
        Duration::from_millis(self.poof_delay_ms)
    }

    pub fn selection_grace(&self) -> Duration {
        Duration::from_millis(self.selection_grace_ms)
    }

    pub fn speech_ttl(&self) -> Duration {
        Duration::from_millis(self.speech_ttl_ms)
    }

    pub fn pending_say_ttl(&self) -> Duration {
        Duration::from_millis(self.pending_say_ttl_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn status_poll_fast(&self) -> Duration {
        Duration::from_millis(self.status_poll_fast_ms)
    }

    pub fn status_poll_slow(&self) -> Duration {
        Duration::from_millis(self.status_poll_slow_ms)
    }

    pub fn account_retry_delay(&self) -> Duration {
        Duration::from_millis(self.account_retry_delay_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            region_size: 8,
            teardown_grace_ms: 5_000,
            poof_delay_ms: 300,
            selection_grace_ms: 1_000,
            speech_ttl_ms: 6_000,
            pending_say_ttl_ms: 10_000,
            pending_say_limit: 64,
            disconnect_grace_ms: 10_000,
            stale_after_ms: 15_000,
            status_poll_fast_ms: 2_000,
            status_poll_slow_ms: 10_000,
            account_retry_delay_ms: 5_000,
            account_retry_attempts: 3,
        }
    }
}
