//! Networking module
//!
//! - Bounded outbound packet buffers
//! - Sessions and the session table owned by the simulation task
//! - TCP transport feeding the simulation task through channels

pub mod buffer;
pub mod session;
pub mod transport;
