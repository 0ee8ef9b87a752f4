//! Local-file registry backend
//!
//! - `backup`: TOML backup file format, atomic writes and content checksum
//! - `registry`: in-memory cache with write-through persistence and polling reload

pub mod backup;
pub mod registry;

pub use backup::BackupError;
pub use registry::{LocalRegistry, ReconcileOutcome};
