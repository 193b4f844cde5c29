//! Opcode obfuscation modes and the per-session opcode decoder
//!
//! In auto-detect mode a session starts undetermined. The first opcode is
//! tried raw, then decrypted; whichever is a known opcode pins the session
//! for the rest of its life.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::crypto::{CryptKey, PacketKeys};

/// Server-wide obfuscation setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObfuscationMode {
    #[default]
    #[serde(rename = "none")]
    Disabled,
    Always,
    Auto,
}

impl FromStr for ObfuscationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "0" => Ok(Self::Disabled),
            "always" | "1" => Ok(Self::Always),
            "auto" | "2" => Ok(Self::Auto),
            other => Err(format!("unknown obfuscation mode '{}'", other)),
        }
    }
}

/// How a pinned session reads opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    Raw,
    Decrypt,
}

/// Decoder state of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Undetermined,
    Pinned(DecodeMode),
}

/// Per-session opcode decoder
#[derive(Debug, Clone)]
pub struct OpcodeDecoder {
    state: DecoderState,
    key: CryptKey,
}

impl OpcodeDecoder {
    pub fn new(mode: ObfuscationMode, keys: PacketKeys) -> Self {
        let state = match mode {
            ObfuscationMode::Disabled => DecoderState::Pinned(DecodeMode::Raw),
            ObfuscationMode::Always => DecoderState::Pinned(DecodeMode::Decrypt),
            ObfuscationMode::Auto => DecoderState::Undetermined,
        };
        Self {
            state,
            key: CryptKey::new(keys),
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn key(&self) -> &CryptKey {
        &self.key
    }

    /// Resolve a wire opcode, pinning an undetermined session
    ///
    /// When neither interpretation is known the raw opcode comes back
    /// unchanged and the session stays undetermined.
    pub fn resolve(&mut self, cmd: u16, is_known: impl Fn(u16) -> bool) -> u16 {
        match self.state {
            DecoderState::Pinned(DecodeMode::Raw) => cmd,
            DecoderState::Pinned(DecodeMode::Decrypt) => self.key.decrypt(cmd),
            DecoderState::Undetermined => {
                if is_known(cmd) {
                    self.state = DecoderState::Pinned(DecodeMode::Raw);
                    return cmd;
                }
                let decrypted = self.key.decrypt(cmd);
                if is_known(decrypted) {
                    self.state = DecoderState::Pinned(DecodeMode::Decrypt);
                    return decrypted;
                }
                cmd
            }
        }
    }

    /// Advance the key after a packet has been fully consumed
    pub fn packet_consumed(&mut self) {
        if self.state == DecoderState::Pinned(DecodeMode::Decrypt) {
            self.key.advance();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEYS: PacketKeys = PacketKeys::new(0x053D5CED, 0x3DED6DED, 0x6DED6DED);

    fn known(op: u16) -> bool {
        matches!(op, 0x0072 | 0x007d | 0x0085)
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("none".parse(), Ok(ObfuscationMode::Disabled));
        assert_eq!("ALWAYS".parse(), Ok(ObfuscationMode::Always));
        assert_eq!("2".parse(), Ok(ObfuscationMode::Auto));
        assert!("sometimes".parse::<ObfuscationMode>().is_err());
    }

    #[test]
    fn test_disabled_is_raw() {
        let mut dec = OpcodeDecoder::new(ObfuscationMode::Disabled, KEYS);
        assert_eq!(dec.resolve(0x0072, known), 0x0072);
        let before = dec.key().current();
        dec.packet_consumed();
        assert_eq!(dec.key().current(), before);
    }

    #[test]
    fn test_auto_pins_raw() {
        let mut dec = OpcodeDecoder::new(ObfuscationMode::Auto, KEYS);
        assert_eq!(dec.resolve(0x0072, known), 0x0072);
        assert_eq!(dec.state(), DecoderState::Pinned(DecodeMode::Raw));
    }

    #[test]
    fn test_auto_pins_decrypt() {
        let mut client = CryptKey::new(KEYS);
        let mut dec = OpcodeDecoder::new(ObfuscationMode::Auto, KEYS);

        let wire = client.encrypt(0x0072);
        assert_eq!(dec.resolve(wire, known), 0x0072);
        assert_eq!(dec.state(), DecoderState::Pinned(DecodeMode::Decrypt));
        dec.packet_consumed();
        client.advance();

        let wire = client.encrypt(0x0085);
        assert_eq!(dec.resolve(wire, known), 0x0085);
    }

    #[test]
    fn test_auto_unknown_stays_undetermined() {
        let mut dec = OpcodeDecoder::new(ObfuscationMode::Auto, KEYS);
        assert_eq!(dec.resolve(0x1111, known), 0x1111);
        assert_eq!(dec.state(), DecoderState::Undetermined);
    }
}
