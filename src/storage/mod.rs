//! Storage and collaborator backends
//!
//! The engine never talks to a database or external service directly; it goes
//! through the traits in [`traits`]. Two families of implementations ship
//! here:
//!
//! - [`memory`]: in-memory stores for standalone deployments and tests
//! - [`sqlite`]: SQLite persistence (behind the `storage-sqlite` feature)

pub mod error;
pub mod memory;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;
pub mod traits;

pub use error::{StorageError, StorageResult};
pub use memory::{
    MemoryAlarmStore, MemoryConfigStore, MemoryDeviceRegistry, MemoryMetricStore,
    MemoryTaskArchive,
};
#[cfg(feature = "storage-sqlite")]
pub use sqlite::SqliteBackend;
pub use traits::{
    AlarmStore, ConfigStore, DeviceFilter, DeviceRegistry, MetricStore, TaskArchive,
};
