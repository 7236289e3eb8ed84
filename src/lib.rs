//! Collision-free map and export queue layered over a transactional sorted
//! key-value store.
//!
//! Writers queue per-key updates into uniquely named cells so that concurrent
//! transactions never conflict; a notification-driven processor later merges
//! them with a user [`map::Combiner`]. See [`map::CollisionFreeMap`] and
//! [`export::ExportQueue`].

pub mod bucket;
pub mod codec;
pub mod config;
pub mod error;
pub mod export;
pub mod map;
pub mod offline;
pub mod registry;
pub mod storage;

pub use config::{AppConfig, MapOptions, MemoryStoreConfig, QueueOptions};
pub use error::{CfmError, CfmErrorCode};
pub use export::{ExportQueue, Exporter, SequencedExport};
pub use map::{CollisionFreeMap, Combiner, SummingCombiner, Update, UpdateObserver};
pub use registry::PluginRegistry;
pub use storage::memory::MemoryStore;
