//! WorldSync
//!
//! Client-side replication engine for a tile/region based multiplayer world.
//! Keeps a local model of the regions and entities the server has streamed to
//! us, and mediates everything the player does back to the server.
//!
//! ## Architecture
//!
//! ```text
//! SyncClient  (client.rs)           ← single owner, ServerHandler
//!   ├── MethodChannel  (channel.rs) ← opcode dispatch over a Transport
//!   ├── ConnectionManager  (connection.rs)
//!   ├── WorldSync  (replication.rs) ← update application, timers
//!   │     └── WorldModel  (world.rs)
//!   ├── SessionContext  (context.rs)
//!   └── SubscriptionMux  (subscription.rs)
//! WatermarkedCollection  (collection.rs) ← incremental account data
//! StatusPoller  (status.rs)               ← health while disconnected
//! ```
//!
//! Nothing here blocks or spawns: hosts feed frames and `Instant`s in and
//! drain events out. The `net` feature adds the TCP framing helpers and the
//! `worldsync-client` binary.

// Wire layer.
pub mod codec;
pub mod protocol;
pub mod update;

pub mod error;
pub mod events;
pub mod scheduler;
pub mod types;

// Client state.
pub mod channel;
pub mod client;
pub mod collection;
pub mod connection;
pub mod context;
pub mod replication;
pub mod status;
pub mod subscription;
pub mod transport;
pub mod world;

pub use channel::{MethodChannel, ServerHandler, Transport};
pub use client::{SharedUiState, SubscriptionKey, SyncClient, UiState};
pub use collection::{CollectionSource, DeletePolicy, PollOutcome, WatermarkedCollection};
pub use connection::{AccountApi, ConnectionManager, ConnectionState, JoinResponse, JoinTicket};
pub use error::{CollectionError, JoinError, ProtocolError, StatusError, TransportError};
pub use events::{ClientEvent, ConnectionEvent, WorldEvent};
pub use protocol::{ClientCall, LeaveReason, ServerMessage};
pub use replication::WorldSync;
pub use status::{ServerHealth, ServerStatus, StatusPoller, StatusSource};
pub use transport::{OutboxHandle, QueuedTransport};
pub use types::{EntityId, RegionCoord, SyncConfig, TileType, Vec2};
pub use world::{Entity, Region, WorldModel};
