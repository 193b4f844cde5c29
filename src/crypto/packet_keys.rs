//! Opcode obfuscation key schedule
//!
//! Obfuscating clients XOR every opcode with bits of a per-session key. The
//! key starts at `k0 * k1 + k2` and advances to `key * k1 + k2` after each
//! packet, all in wrapping 32-bit arithmetic.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The three constants a client build obfuscates with
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketKeys {
    pub k0: u32,
    pub k1: u32,
    pub k2: u32,
}

impl PacketKeys {
    pub const fn new(k0: u32, k1: u32, k2: u32) -> Self {
        Self { k0, k1, k2 }
    }

    pub fn is_zero(&self) -> bool {
        self.k0 == 0 && self.k1 == 0 && self.k2 == 0
    }

    /// Key a fresh session starts with
    #[inline]
    pub fn initial(&self) -> u32 {
        self.k0.wrapping_mul(self.k1).wrapping_add(self.k2)
    }

    /// Key following `key`
    #[inline]
    pub fn advance(&self, key: u32) -> u32 {
        key.wrapping_mul(self.k1).wrapping_add(self.k2)
    }
}

impl fmt::Debug for PacketKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PacketKeys(0x{:08x}, 0x{:08x}, 0x{:08x})",
            self.k0, self.k1, self.k2
        )
    }
}

/// Per-session key state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptKey {
    keys: PacketKeys,
    current: u32,
}

impl CryptKey {
    pub fn new(keys: PacketKeys) -> Self {
        Self {
            keys,
            current: keys.initial(),
        }
    }

    #[inline]
    pub fn current(&self) -> u32 {
        self.current
    }

    /// Mask applied to the next opcode
    #[inline]
    pub fn mask(&self) -> u16 {
        ((self.current >> 16) & 0x7FFF) as u16
    }

    /// Recover the real opcode from an obfuscated one
    #[inline]
    pub fn decrypt(&self, cmd: u16) -> u16 {
        cmd ^ self.mask()
    }

    /// Obfuscate an opcode the way the client does
    #[inline]
    pub fn encrypt(&self, opcode: u16) -> u16 {
        opcode ^ self.mask()
    }

    /// Move to the next key once a packet has been consumed
    #[inline]
    pub fn advance(&mut self) {
        self.current = self.keys.advance(self.current);
    }
}
