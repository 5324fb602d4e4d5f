//! Disk Location
//!
//! One volume directory and the volumes opened from it.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam::channel;
use parking_lot::RwLock;

use crate::error::Result;
use crate::volume::{Volume, VolumeId};

/// A directory holding at most `max_volume_count` volumes
pub struct DiskLocation {
    directory: PathBuf,
    max_volume_count: usize,
    volumes: RwLock<HashMap<VolumeId, Arc<Volume>>>,
}

impl DiskLocation {
    pub fn new(directory: impl Into<PathBuf>, max_volume_count: usize) -> Self {
        Self {
            directory: directory.into(),
            max_volume_count,
            volumes: RwLock::new(HashMap::new()),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn max_volume_count(&self) -> usize {
        self.max_volume_count
    }

    // =========================================================================
    // Startup
    // =========================================================================

    /// Open every `.dat` file in the directory.
    ///
    /// One thread lists the directory into a bounded queue that `concurrency`
    /// workers drain. Files that fail to open are logged and skipped.
    pub fn load_existing_volumes(&self, concurrency: usize) -> Result<()> {
        let workers = concurrency.max(1);
        let entries = fs::read_dir(&self.directory)?;
        let (tx, rx) = channel::bounded::<PathBuf>(10 * workers);

        crossbeam::scope(|s| {
            s.spawn(move |_| {
                for entry in entries {
                    let path = match entry {
                        Ok(entry) => entry.path(),
                        Err(e) => {
                            tracing::warn!(
                                "cannot read an entry of {}: {}",
                                self.directory.display(),
                                e
                            );
                            continue;
                        }
                    };
                    if tx.send(path).is_err() {
                        break;
                    }
                }
            });

            for _ in 0..workers {
                let rx = rx.clone();
                s.spawn(move |_| {
                    for path in rx.iter() {
                        self.load_existing_volume(&path);
                    }
                });
            }
        })
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "volume loader thread panicked"))?;

        tracing::info!(
            "store started on dir {} with {} volumes, max {}",
            self.directory.display(),
            self.volumes_len(),
            self.max_volume_count
        );
        Ok(())
    }

    fn load_existing_volume(&self, path: &Path) {
        if !path.is_file() {
            return;
        }
        let (collection, vid) = match path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(parse_volume_file_name)
        {
            Some(parsed) => parsed,
            None => return,
        };

        if self.volumes.read().contains_key(&vid) {
            return;
        }

        // Opening may rebuild an index, so no lock is held here
        match Volume::load(&self.directory, &collection, vid) {
            Ok(v) => {
                tracing::info!(
                    "data file {}, replication={} version={} size={} ttl={}",
                    path.display(),
                    v.replica_placement(),
                    v.version(),
                    v.data_file_size(),
                    v.ttl()
                );
                self.volumes.write().entry(vid).or_insert_with(|| Arc::new(v));
            }
            Err(e) => {
                tracing::warn!("cannot load volume from {}: {}", path.display(), e);
            }
        }
    }

    // =========================================================================
    // Volume Map
    // =========================================================================

    pub fn set_volume(&self, vid: VolumeId, volume: Arc<Volume>) {
        self.volumes.write().insert(vid, volume);
    }

    pub fn find_volume(&self, vid: VolumeId) -> Option<Arc<Volume>> {
        self.volumes.read().get(&vid).cloned()
    }

    pub fn volumes_len(&self) -> usize {
        self.volumes.read().len()
    }

    /// Ids of the volumes in this location, ascending
    pub fn volume_ids(&self) -> Vec<VolumeId> {
        let mut ids: Vec<VolumeId> = self.volumes.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Snapshot of the open volumes, ascending by id
    pub fn volumes(&self) -> Vec<Arc<Volume>> {
        let mut volumes: Vec<Arc<Volume>> = self.volumes.read().values().cloned().collect();
        volumes.sort_unstable_by_key(|v| v.id());
        volumes
    }

    /// How many more volumes this location can take
    pub fn free_slots(&self) -> usize {
        self.max_volume_count.saturating_sub(self.volumes_len())
    }

    /// Destroy volume `vid` and forget it. Returns whether it was present.
    ///
    /// The location lock is not held while the volume is destroyed; a volume
    /// that fails to destroy stays in the map.
    pub fn delete_volume(&self, vid: VolumeId) -> Result<bool> {
        let v = match self.find_volume(vid) {
            Some(v) => v,
            None => return Ok(false),
        };
        v.destroy()?;
        forget(&mut self.volumes.write(), &v);
        Ok(true)
    }

    /// Destroy every volume of `collection`, stopping at the first failure
    pub fn delete_collection(&self, collection: &str) -> Result<()> {
        let targets: Vec<Arc<Volume>> = self
            .volumes
            .read()
            .values()
            .filter(|v| v.collection() == collection)
            .cloned()
            .collect();

        let mut destroyed = Vec::with_capacity(targets.len());
        let mut result = Ok(());
        for v in targets {
            match v.destroy() {
                Ok(()) => destroyed.push(v),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        let mut volumes = self.volumes.write();
        for v in &destroyed {
            forget(&mut volumes, v);
        }
        result
    }

    /// Sync every volume
    pub fn close(&self) -> Result<()> {
        for v in self.volumes.read().values() {
            v.close()?;
        }
        Ok(())
    }
}

/// Drop `v` from the map unless its slot was reused meanwhile
fn forget(volumes: &mut HashMap<VolumeId, Arc<Volume>>, v: &Arc<Volume>) {
    if volumes.get(&v.id()).is_some_and(|cur| Arc::ptr_eq(cur, v)) {
        volumes.remove(&v.id());
    }
}

/// Split `<collection>_<id>.dat` (or `<id>.dat`) into collection and id.
/// The collection ends at the last underscore.
pub fn parse_volume_file_name(name: &str) -> Option<(String, VolumeId)> {
    let base = name.strip_suffix(".dat")?;
    let (collection, id) = match base.rfind('_') {
        Some(i) if i > 0 => (&base[..i], &base[i + 1..]),
        _ => ("", base),
    };
    let vid = id.parse::<VolumeId>().ok()?;
    Some((collection.to_string(), vid))
}
