//! # Instance Store
//!
//! On-disk persistence for CIM instances. Each collection (one class in one
//! namespace) is a pair of files:
//!
//! - **Index**: an ordered directory of `{key, offset, size, live}` entries
//!   with logical delete and in-place location updates
//! - **Data**: an append-only heap of encoded instances with single-slot
//!   checkpoint/rollback
//!
//! The [`Compactor`] reclaims free index entries and orphaned data bytes
//! while keeping every live instance readable, and [`InstanceStore`] wraps
//! the pair behind a mutex with caching and automatic reclamation.
//!
//! ## Example
//!
//! ```ignore
//! use instance_store::{InstanceStore, ObjectPath, StoreConfig};
//!
//! let store = InstanceStore::open(StoreConfig::new("./repository/root_cimv2", "cim_disk"))?;
//!
//! let key = ObjectPath::new("CIM_Disk").with_binding("DeviceID", "sda").key()?;
//! store.put(&key, &encoded_instance)?;
//!
//! let bytes = store.get(&key)?;
//! store.remove(&key)?;
//! store.reclaim()?;
//! ```

pub mod compactor;
pub mod error;
pub mod instances;
pub mod store;
pub mod types;

// Re-exports
pub use compactor::{CompactionPlan, CompactionStats, Compactor, Relocation};
pub use error::{Result, StoreError};
pub use instances::{DataStore, IndexStore};
pub use store::{InstanceStore, StoreConfig};
pub use types::*;
