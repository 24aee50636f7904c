//! Durable storage for FieldLink.
//!
//! Provides [`RedbStore`], the redb-backed implementation of the
//! [`PersistenceGateway`](fieldlink_core::PersistenceGateway) contract.

pub mod error;
pub mod store;

pub use error::{Error, Result};
pub use store::RedbStore;
