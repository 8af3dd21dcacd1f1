//! Model records
//!
//! - [`ModelEntry`]: one configured model (source, arguments, download state)
//! - [`ModelStore`]: atomic per-record persistence
//! - spec parsing from aliases, `REPO:FILE` pairs and hub URLs

pub mod entry;
pub mod store;

pub use entry::{ModelEntry, ModelSource, derive_id, parse_model_spec, validate_id};
pub use store::{ModelStore, PutMode};
