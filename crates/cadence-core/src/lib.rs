//! `cadence-core`: configuration, base error type and shared identifiers
//! used by every Cadence crate.

pub mod config;
pub mod error;
pub mod types;

pub use config::CadenceConfig;
pub use error::{CadenceError, Result};
pub use types::{new_row_id, parse_db_timestamp, to_db_timestamp, OwnerId};
