//! Cryptography module
//!
//! Opcode obfuscation keys used by clients that scramble packet ids.

pub mod packet_keys;

// Re-export commonly used types
pub use packet_keys::{CryptKey, PacketKeys};
