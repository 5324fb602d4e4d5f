//! # needlestore
//!
//! Storage side of a distributed blob store, one node:
//! - Small files ("needles") appended to large volume files
//! - A compact in-memory index per volume, persisted to a companion file
//! - Volumes spread over several directories with per-directory quotas
//! - Per-needle and per-volume TTLs
//! - Status and heartbeat reports for a cluster coordinator
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Store                              │
//! │        (placement, routing, status, heartbeats)             │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │DiskLocation │   ...    │DiskLocation │
//!   │  (RwLock)   │          │  (RwLock)   │
//!   └──────┬──────┘          └─────────────┘
//!          │
//!          ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │   Volume    │─────────►│  NeedleMap  │
//!   │ (.dat file) │          │ (.idx file) │
//!   └──────┬──────┘          └──────┬──────┘
//!          │                        │
//!          ▼                        ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │   Needle    │          │ CompactMap  │
//!   │   codec     │          │ (sections)  │
//!   └─────────────┘          └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod needle;
pub mod index;
pub mod volume;
pub mod store;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Result, StorageError};
pub use config::{ConfigBuilder, StoreConfig};
pub use needle::{FileId, Needle, Ttl, Version};
pub use store::{Heartbeat, Store, VolumeInfo};
pub use volume::{ReplicaPlacement, Volume, VolumeId};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of needlestore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
