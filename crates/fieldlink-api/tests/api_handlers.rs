//! Handler tests, called directly with extracted state.

mod common;
mod handlers;
