//! Store Module
//!
//! A storage node: every configured disk location and the volumes in them.
//!
//! ## Responsibilities
//! - Load existing volumes from each directory at startup
//! - Place new volumes in the location with the most free slots
//! - Route needle reads, writes and deletes to the owning volume
//! - Summarize local state into status records and heartbeats, dropping
//!   volumes whose TTL ran out long enough ago

mod heartbeat;
mod location;

use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel::Sender;
use parking_lot::{Mutex, RwLock};

use crate::config::StoreConfig;
use crate::error::{Result, StorageError};
use crate::needle::{Needle, Ttl};
use crate::volume::{now_unix, ReplicaPlacement, Volume, VolumeId};

pub use heartbeat::{Heartbeat, VolumeInfo, VolumeInformation};
pub use location::{parse_volume_file_name, DiskLocation};

/// Upper bound, in minutes, of the grace period between a volume's TTL
/// expiring and the volume being deleted
pub const MAX_TTL_VOLUME_REMOVAL_DELAY: u32 = 10;

/// All volumes of one storage node
pub struct Store {
    ip: String,
    port: u16,
    public_url: String,
    locations: Vec<DiskLocation>,

    data_center: RwLock<String>,
    rack: RwLock<String>,
    /// Assigned by the cluster; 0 until known
    volume_size_limit: AtomicU64,
    heartbeat_sender: Mutex<Option<Sender<Heartbeat>>>,

    /// Serializes volume placement so two callers cannot add the same id
    placement: Mutex<()>,
}

impl Store {
    /// Open every configured location and load the volumes found there
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;

        let mut locations = Vec::with_capacity(config.locations.len());
        for loc in &config.locations {
            fs::create_dir_all(&loc.directory)?;
            let location = DiskLocation::new(&loc.directory, loc.max_volume_count);
            location.load_existing_volumes(config.load_concurrency)?;
            locations.push(location);
        }

        Ok(Self {
            public_url: config.effective_public_url(),
            ip: config.ip,
            port: config.port,
            locations,
            data_center: RwLock::new(config.data_center),
            rack: RwLock::new(config.rack),
            volume_size_limit: AtomicU64::new(config.volume_size_limit),
            heartbeat_sender: Mutex::new(None),
            placement: Mutex::new(()),
        })
    }

    // =========================================================================
    // Volume Management
    // =========================================================================

    /// Create the volumes listed in `ids`, e.g. `"1,4-6"`.
    ///
    /// Every id is attempted; the first error encountered is returned.
    pub fn add_volume(
        &self,
        ids: &str,
        collection: &str,
        replication: &str,
        ttl: &str,
        preallocate: u64,
    ) -> Result<()> {
        let replica_placement: ReplicaPlacement = replication.parse()?;
        let ttl: Ttl = ttl.parse()?;

        let mut first_err = None;
        for vid in parse_volume_ids(ids)? {
            if let Err(e) = self.add_one_volume(vid, collection, replica_placement, ttl, preallocate)
            {
                tracing::warn!("cannot add volume {}: {}", vid, e);
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn add_one_volume(
        &self,
        vid: VolumeId,
        collection: &str,
        replica_placement: ReplicaPlacement,
        ttl: Ttl,
        preallocate: u64,
    ) -> Result<()> {
        let _guard = self.placement.lock();
        if self.has_volume(vid) {
            return Err(StorageError::VolumeAlreadyExists(vid));
        }
        let location = self.find_free_location().ok_or(StorageError::NoFreeSpace)?;

        tracing::info!(
            "in dir {} adds volume {} collection={:?} replication={} ttl={}",
            location.directory().display(),
            vid,
            collection,
            replica_placement,
            ttl
        );
        let volume = Volume::open(
            location.directory(),
            collection,
            vid,
            replica_placement,
            ttl,
            preallocate,
        )?;
        location.set_volume(vid, Arc::new(volume));
        Ok(())
    }

    /// Location with the most free slots; the first one wins ties
    fn find_free_location(&self) -> Option<&DiskLocation> {
        let mut best: Option<&DiskLocation> = None;
        let mut max = 0;
        for location in &self.locations {
            let free = location.free_slots();
            if free > max {
                max = free;
                best = Some(location);
            }
        }
        best
    }

    /// Destroy every volume of `collection` in every location
    pub fn delete_collection(&self, collection: &str) -> Result<()> {
        for location in &self.locations {
            location.delete_collection(collection)?;
        }
        Ok(())
    }

    pub fn mark_volume_read_only(&self, vid: VolumeId, read_only: bool) -> Result<()> {
        self.require_volume(vid)?.set_read_only(read_only)
    }

    pub fn has_volume(&self, vid: VolumeId) -> bool {
        self.get_volume(vid).is_some()
    }

    pub fn get_volume(&self, vid: VolumeId) -> Option<Arc<Volume>> {
        self.locations.iter().find_map(|l| l.find_volume(vid))
    }

    fn require_volume(&self, vid: VolumeId) -> Result<Arc<Volume>> {
        self.get_volume(vid).ok_or(StorageError::VolumeNotFound(vid))
    }

    // =========================================================================
    // Needle Operations
    // =========================================================================

    /// Write `n` into volume `vid`. Returns the payload size.
    ///
    /// When the volume is getting close to the size limit a heartbeat is
    /// pushed right away so the cluster can stop assigning to it.
    pub fn write(&self, vid: VolumeId, n: &mut Needle) -> Result<u32> {
        let v = self.require_volume(vid)?;
        if v.is_read_only() {
            return Err(StorageError::ReadOnlyVolume(vid));
        }

        let size = v.write(n)?;

        let limit = self.volume_size_limit();
        if limit > 0 && v.content_size() + 3 * u64::from(size) > limit {
            tracing::info!(
                "volume {} size {} will exceed limit {}",
                vid,
                v.content_size(),
                limit
            );
            self.send_heartbeat();
        }
        Ok(size)
    }

    /// Delete `n` from volume `vid`. Returns the size freed.
    pub fn delete(&self, vid: VolumeId, n: &Needle) -> Result<u32> {
        let v = self.require_volume(vid)?;
        if v.is_read_only() {
            return Err(StorageError::ReadOnlyVolume(vid));
        }
        v.delete(n)
    }

    /// Fill `n` from volume `vid`. Returns the payload size.
    pub fn read_volume_needle(&self, vid: VolumeId, n: &mut Needle) -> Result<usize> {
        self.require_volume(vid)?.read(n)
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    /// One record per volume, ascending by id
    pub fn status(&self) -> Vec<VolumeInfo> {
        let mut stats: Vec<VolumeInfo> = self
            .locations
            .iter()
            .flat_map(|l| l.volumes())
            .map(|v| VolumeInfo::from_volume(&v))
            .collect();
        stats.sort_by_key(|s| s.id);
        stats
    }

    pub fn collect_heartbeat(&self) -> Heartbeat {
        self.collect_heartbeat_at(now_unix())
    }

    /// Build a heartbeat as of `now` (unix seconds).
    ///
    /// Expired volumes are left out. Once past their grace period they are
    /// also deleted from disk.
    pub fn collect_heartbeat_at(&self, now: u64) -> Heartbeat {
        let limit = self.volume_size_limit();
        let mut volumes = Vec::new();
        let mut max_volume_count = 0usize;
        let mut max_file_key = 0u64;

        for location in &self.locations {
            max_volume_count += location.max_volume_count();
            for v in location.volumes() {
                max_file_key = max_file_key.max(v.max_file_key());

                if !v.expired_at(limit, now) {
                    volumes.push(VolumeInformation::from_volume(&v));
                } else if v.expired_long_enough_at(MAX_TTL_VOLUME_REMOVAL_DELAY, now) {
                    match location.delete_volume(v.id()) {
                        Ok(_) => tracing::info!("volume {} is deleted", v.id()),
                        Err(e) => tracing::warn!("cannot delete expired volume {}: {}", v.id(), e),
                    }
                } else {
                    tracing::info!("volume {} is expired", v.id());
                }
            }
        }

        Heartbeat {
            ip: self.ip.clone(),
            port: self.port,
            public_url: self.public_url.clone(),
            max_volume_count: max_volume_count as u32,
            max_file_key,
            data_center: self.data_center(),
            rack: self.rack(),
            volumes,
        }
    }

    fn send_heartbeat(&self) {
        let sender = self.heartbeat_sender.lock().clone();
        if let Some(sender) = sender {
            if let Err(e) = sender.send(self.collect_heartbeat()) {
                tracing::warn!("error when reporting size: {}", e);
            }
        }
    }

    // =========================================================================
    // Settings
    // =========================================================================

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    pub fn volume_size_limit(&self) -> u64 {
        self.volume_size_limit.load(Ordering::Acquire)
    }

    pub fn set_volume_size_limit(&self, limit: u64) {
        self.volume_size_limit.store(limit, Ordering::Release);
    }

    pub fn data_center(&self) -> String {
        self.data_center.read().clone()
    }

    pub fn set_data_center(&self, data_center: impl Into<String>) {
        *self.data_center.write() = data_center.into();
    }

    pub fn rack(&self) -> String {
        self.rack.read().clone()
    }

    pub fn set_rack(&self, rack: impl Into<String>) {
        *self.rack.write() = rack.into();
    }

    /// Channel that receives heartbeats pushed outside the regular cycle
    pub fn set_heartbeat_sender(&self, sender: Sender<Heartbeat>) {
        *self.heartbeat_sender.lock() = Some(sender);
    }

    pub fn locations(&self) -> &[DiskLocation] {
        &self.locations
    }

    /// Sync every volume in every location
    pub fn close(&self) -> Result<()> {
        for location in &self.locations {
            location.close()?;
        }
        Ok(())
    }
}

/// Expand `"1,3-5"` into `[1, 3, 4, 5]`
pub fn parse_volume_ids(ids: &str) -> Result<Vec<VolumeId>> {
    let mut out = Vec::new();
    for part in ids.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            None => out.push(part.parse()?),
            Some((start, end)) => {
                let start: VolumeId = start.parse()?;
                let end: VolumeId = end.parse()?;
                if start > end {
                    return Err(StorageError::InvalidVolumeId(part.to_string()));
                }
                out.extend((start.0..=end.0).map(VolumeId));
            }
        }
    }
    if out.is_empty() {
        return Err(StorageError::InvalidVolumeId(ids.to_string()));
    }
    Ok(out)
}
