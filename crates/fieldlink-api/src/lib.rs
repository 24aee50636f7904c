//! FieldLink HTTP surface and service wiring.
//!
//! [`server::run`] starts every component in order, serves the query API
//! and tears everything down again on Ctrl+C / SIGTERM.

pub mod handlers;
pub mod models;
pub mod server;
pub mod shutdown;

pub use server::{create_router, run, ServerState, Services};
