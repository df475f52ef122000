//! Client-side metadata cache and block synchronization engine for a remote filesystem.
//!
//! [`RemoteFs`] is the entry point: it serves filesystem calls from a bounded metadata cache,
//! fetches directory listings page by page, synchronizes unknown byte ranges before reads, and
//! applies push events from the remote side in delivery order.

/// Metadata caching and eviction.
pub mod cache;
/// Runtime configuration.
pub mod config;
/// Error types.
pub mod error;
/// Push events and their application.
pub mod events;
/// Filesystem-facing types and operations.
pub mod fs;
/// Tracing subscriber setup.
pub mod trc;

pub use cache::{CacheSettings, MetadataCache};
pub use config::{Config, ConfigError};
pub use error::{FsError, RemoteResult, Status};
pub use events::{AttrChange, Event, EventChannelClosed, EventSender};
pub use fs::provider::RemoteProvider;
pub use fs::helper::{HelperSession, StorageHelper};
pub use fs::{FileAttr, FileType, RemoteFs, Uuid};
