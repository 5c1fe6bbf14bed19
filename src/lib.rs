//! Clinic appointment-reminder messenger
//!
//! Supervises one chat transport session and sends reminder batches
//! through it, tracking per-message delivery acknowledgements.

pub mod api;
pub mod messaging;
pub mod middleware;
pub mod storage;
pub mod transport;
