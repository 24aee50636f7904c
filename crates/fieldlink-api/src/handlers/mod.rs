//! HTTP handlers.

pub mod basic;
pub mod commands;
pub mod sensors;

pub use crate::server::ServerState;
