//! Protocol module
//!
//! Everything between raw bytes and typed requests:
//! - Client versions and version-keyed packet layouts
//! - The layout-driven codec
//! - The per-version packet table and inbound dispatch
//! - Opcode obfuscation
//! - Core inbound handlers and outbound packet builders

pub mod builders;
pub mod codec;
pub mod dispatch;
pub mod handlers;
pub mod layout;
pub mod obfuscation;
pub mod packet_db;
pub mod version;

pub use codec::{decode, encode, DecodedPacket, FieldValue, FieldValues};
pub use dispatch::Dispatcher;
pub use handlers::{ActionKind, ClientRequest};
pub use packet_db::{PacketDb, PacketDbBuilder, PacketDescriptor};
pub use version::PacketVersion;
