//! Zone Protocol Library
//!
//! The protocol core of a zone server: everything between the socket and
//! the game rules.
//!
//! ## Modules
//!
//! - `broadcast` - Send targets and the broadcast router
//! - `config` - Server configuration management
//! - `crypto` - Opcode obfuscation key schedule
//! - `error` - Error types and result definitions
//! - `net` - Sessions, outbound buffers and the TCP transport
//! - `protocol` - Versions, layouts, codec, packet table and dispatch
//! - `scheduler` - Delayed packet emission
//! - `server` - The zone simulation loop
//! - `visibility` - Who sees whom, and the packets that say so
//! - `world` - Entities and the world map

pub mod broadcast;
pub mod config;
pub mod crypto;
pub mod error;
pub mod net;
pub mod protocol;
pub mod scheduler;
pub mod server;
pub mod visibility;
pub mod world;

// Re-export commonly used types
pub use broadcast::{AreaConfig, Router, SendTarget};
pub use config::ServerConfig;
pub use error::{Result, ZoneError};
pub use scheduler::{DelayedEmitter, Tick};
pub use server::{InboundEvent, ZoneServer};
pub use visibility::{ClearReason, VisibilityEngine};
pub use world::{BlockId, Entity, Position, WorldMap};

/// Server version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
