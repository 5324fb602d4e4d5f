//! Status and heartbeat records reported by a store

use serde::{Deserialize, Serialize};

use crate::needle::Ttl;
use crate::volume::{ReplicaPlacement, Volume, VolumeId};

/// Local view of one volume, as returned by `Store::status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub id: VolumeId,
    /// Logical bytes written
    pub size: u64,
    pub collection: String,
    pub replica_placement: ReplicaPlacement,
    pub version: u8,
    pub ttl: Ttl,
    pub file_count: u64,
    pub delete_count: u64,
    pub deleted_byte_count: u64,
    pub read_only: bool,
}

impl VolumeInfo {
    pub fn from_volume(v: &Volume) -> Self {
        Self {
            id: v.id(),
            size: v.content_size(),
            collection: v.collection().to_string(),
            replica_placement: v.replica_placement(),
            version: v.version().as_byte(),
            ttl: v.ttl(),
            file_count: v.file_count(),
            delete_count: v.deleted_count(),
            deleted_byte_count: v.deleted_size(),
            read_only: v.is_read_only(),
        }
    }
}

/// Per-volume entry of a heartbeat, in wire-friendly integer form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInformation {
    pub id: u32,
    /// Physical size of the data file
    pub size: u64,
    pub collection: String,
    pub file_count: u64,
    pub delete_count: u64,
    pub deleted_byte_count: u64,
    pub read_only: bool,
    pub replica_placement: u32,
    pub version: u32,
    pub ttl: u32,
}

impl VolumeInformation {
    pub fn from_volume(v: &Volume) -> Self {
        Self {
            id: v.id().0,
            size: v.data_file_size(),
            collection: v.collection().to_string(),
            file_count: v.file_count(),
            delete_count: v.deleted_count(),
            deleted_byte_count: v.deleted_size(),
            read_only: v.is_read_only(),
            replica_placement: u32::from(v.replica_placement().as_byte()),
            version: u32::from(v.version().as_byte()),
            ttl: v.ttl().as_u32(),
        }
    }
}

/// Periodic report of a storage node to the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub ip: String,
    pub port: u16,
    pub public_url: String,
    pub max_volume_count: u32,
    pub max_file_key: u64,
    pub data_center: String,
    pub rack: String,
    pub volumes: Vec<VolumeInformation>,
}
