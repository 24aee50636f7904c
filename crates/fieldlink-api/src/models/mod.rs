//! API response models.

pub mod error;

pub use error::ErrorResponse;
