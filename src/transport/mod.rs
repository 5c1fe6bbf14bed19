//! Concrete chat transports

pub mod bridge;

pub use bridge::{BridgeSession, BridgeTransport};
