//! Persistence layer: models and the SQLite store.

mod models;
mod store;

pub use models::*;
pub use store::*;
