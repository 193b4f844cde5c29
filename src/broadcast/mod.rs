//! Broadcast routing
//!
//! Every server-to-client packet leaves through the router, addressed by a
//! `SendTarget` relative to an origin entity.

pub mod router;
pub mod target;

pub use router::{AllyOnlyScope, Router};
pub use target::SendTarget;

/// Radii used by area targets, in cells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AreaConfig {
    pub area_size: i16,
    /// Radius of `AreaChatWithoutChat`
    pub chat_area_size: i16,
    /// Radius of `AreaDead`
    pub dead_area_size: i16,
}

impl Default for AreaConfig {
    fn default() -> Self {
        Self {
            area_size: 14,
            chat_area_size: 9,
            dead_area_size: 32,
        }
    }
}
