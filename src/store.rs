//! Durable pin and photo storage for pinphotos.
//!
//! Pins and their photo records live in a single YAML index file. Cached
//! image bytes live next to it, one file per photo under
//! `<cache_dir>/<pin>/<photo>.img`, with the index recording each file's
//! size and MD5 checksum.
//!
//! Every mutation is applied to a copy of the index, written to disk, and
//! only then swapped in. A failed write leaves both the file and the
//! in-memory state as they were and reports a [`StoreError`].

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use crate::flickr::PhotoRecord;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize index: {0}")]
    Serialize(#[source] serde_yaml::Error),
    #[error("failed to parse index {path}: {source}")]
    Deserialize {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("unknown pin {0}")]
    UnknownPin(Uuid),
    #[error(
        "cached image for photo {key} is corrupt: expected checksum {expected}, got {actual}"
    )]
    Corrupt {
        key: Uuid,
        expected: String,
        actual: String,
    },
}

impl StoreError {
    /// A cached image file that is gone or no longer matches its checksum
    pub fn is_missing_or_corrupt(&self) -> bool {
        match self {
            StoreError::Io { source, .. } => source.kind() == ErrorKind::NotFound,
            StoreError::Corrupt { .. } => true,
            _ => false,
        }
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A saved location on the map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pin {
    pub id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
    pub created_at: DateTime<Utc>,
}

impl Pin {
    /// Whether a coordinate falls within `tolerance` degrees of this pin on both axes
    pub fn is_near(&self, latitude: f64, longitude: f64, tolerance: f64) -> bool {
        (self.latitude - latitude).abs() <= tolerance
            && (self.longitude - longitude).abs() <= tolerance
    }
}

/// Reference to image bytes cached on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedImage {
    /// File name relative to the cache directory
    pub file: String,
    pub size: u64,
    /// Hex MD5 of the cached bytes
    pub checksum: String,
}

/// A photo record owned by a pin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Photo {
    /// Local identity, stable across reloads
    pub key: Uuid,
    /// Owning pin
    pub pin: Uuid,
    /// Remote id; absent on records written before ids were stored
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    /// Insertion sequence, used to order photos that share or lack an id
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub image: Option<CachedImage>,
}

impl Photo {
    pub fn has_image(&self) -> bool {
        self.image.is_some()
    }
}

/// Display order: by id ascending, id-less photos last, ties by insertion sequence
pub fn display_order(a: &Photo, b: &Photo) -> Ordering {
    let by_id = match (&a.id, &b.id) {
        (Some(x), Some(y)) => x.cmp(y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_id.then(a.seq.cmp(&b.seq))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreIndex {
    last_updated: DateTime<Utc>,
    #[serde(default)]
    next_seq: u64,
    #[serde(default)]
    pins: Vec<Pin>,
    #[serde(default)]
    photos: Vec<Photo>,
}

impl StoreIndex {
    fn new() -> Self {
        Self {
            last_updated: Utc::now(),
            next_seq: 0,
            pins: Vec::new(),
            photos: Vec::new(),
        }
    }

    fn has_pin(&self, pin: Uuid) -> bool {
        self.pins.iter().any(|p| p.id == pin)
    }

    fn sorted_photos(&self, pin: Uuid) -> Vec<&Photo> {
        let mut photos: Vec<&Photo> = self.photos.iter().filter(|p| p.pin == pin).collect();
        photos.sort_by(|a, b| display_order(a, b));
        photos
    }
}

/// The single source of truth for pins, photos and cached image bytes
#[derive(Debug)]
pub struct PhotoStore {
    data_file: PathBuf,
    cache_dir: PathBuf,
    index: StoreIndex,
}

impl PhotoStore {
    /// Opens the store, starting empty if the index file doesn't exist yet
    pub fn open(data_file: &Path, cache_dir: &Path) -> Result<Self, StoreError> {
        let index = if data_file.exists() {
            let yaml = fs::read_to_string(data_file).map_err(io_error(data_file))?;
            serde_yaml::from_str(&yaml).map_err(|source| StoreError::Deserialize {
                path: data_file.to_path_buf(),
                source,
            })?
        } else {
            StoreIndex::new()
        };

        Ok(Self {
            data_file: data_file.to_path_buf(),
            cache_dir: cache_dir.to_path_buf(),
            index,
        })
    }

    pub fn data_file(&self) -> &Path {
        &self.data_file
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.index.last_updated
    }

    /// Writes `next` to disk and makes it the current state
    fn commit(&mut self, mut next: StoreIndex) -> Result<(), StoreError> {
        next.last_updated = Utc::now();
        let yaml = serde_yaml::to_string(&next).map_err(StoreError::Serialize)?;
        write_atomic(&self.data_file, yaml.as_bytes())?;
        self.index = next;
        Ok(())
    }

    // Pins

    /// All pins in creation order
    pub fn pins(&self) -> &[Pin] {
        &self.index.pins
    }

    pub fn pin(&self, id: Uuid) -> Option<&Pin> {
        self.index.pins.iter().find(|p| p.id == id)
    }

    /// Finds the pin at a coordinate. When several pins match, the oldest wins.
    pub fn find_pin(&self, latitude: f64, longitude: f64, tolerance: f64) -> Option<&Pin> {
        let mut matches = self
            .index
            .pins
            .iter()
            .filter(|p| p.is_near(latitude, longitude, tolerance));

        let first = matches.next();
        let extra = matches.count();
        if extra > 0 {
            warn!(
                "{} pins match {latitude}, {longitude}; using the oldest",
                extra + 1
            );
        }
        first
    }

    /// Creates a pin, or returns the existing one within `tolerance`
    pub fn add_pin(
        &mut self,
        latitude: f64,
        longitude: f64,
        tolerance: f64,
    ) -> Result<Pin, StoreError> {
        if let Some(existing) = self.find_pin(latitude, longitude, tolerance) {
            debug!("Reusing pin {} at {latitude}, {longitude}", existing.id);
            return Ok(existing.clone());
        }

        let pin = Pin {
            id: Uuid::new_v4(),
            latitude,
            longitude,
            created_at: Utc::now(),
        };

        let mut next = self.index.clone();
        next.pins.push(pin.clone());
        self.commit(next)?;

        Ok(pin)
    }

    /// Removes a pin together with all its photos and their cached bytes.
    /// Returns the number of photos removed.
    pub fn remove_pin(&mut self, pin: Uuid) -> Result<usize, StoreError> {
        if !self.index.has_pin(pin) {
            return Err(StoreError::UnknownPin(pin));
        }

        let mut next = self.index.clone();
        next.pins.retain(|p| p.id != pin);
        let removed: Vec<Photo> = next.photos.iter().filter(|p| p.pin == pin).cloned().collect();
        next.photos.retain(|p| p.pin != pin);
        self.commit(next)?;

        self.remove_cached_files(&removed);
        let pin_dir = self.cache_dir.join(pin.to_string());
        if pin_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&pin_dir) {
                warn!("Failed to remove cache directory {}: {}", pin_dir.display(), e);
            }
        }

        Ok(removed.len())
    }

    // Photos

    /// A pin's photos in display order
    pub fn photos_for(&self, pin: Uuid) -> Vec<Photo> {
        self.index.sorted_photos(pin).into_iter().cloned().collect()
    }

    pub fn photo(&self, key: Uuid) -> Option<&Photo> {
        self.index.photos.iter().find(|p| p.key == key)
    }

    /// Position of a photo in its pin's display order
    pub fn position_of(&self, key: Uuid) -> Option<usize> {
        let photo = self.photo(key)?;
        self.index
            .sorted_photos(photo.pin)
            .iter()
            .position(|p| p.key == key)
    }

    pub fn count(&self, pin: Uuid) -> usize {
        self.index.photos.iter().filter(|p| p.pin == pin).count()
    }

    /// Total number of photos across all pins
    pub fn photo_count(&self) -> usize {
        self.index.photos.len()
    }

    /// Number of photos with cached bytes
    pub fn cached_count(&self) -> usize {
        self.index.photos.iter().filter(|p| p.has_image()).count()
    }

    /// Inserts records for a pin, skipping any whose id the pin already holds.
    /// Returns the keys of the inserted photos in record order.
    pub fn insert_many(
        &mut self,
        pin: Uuid,
        records: &[PhotoRecord],
    ) -> Result<Vec<Uuid>, StoreError> {
        if !self.index.has_pin(pin) {
            return Err(StoreError::UnknownPin(pin));
        }

        let mut next = self.index.clone();
        let mut seen: HashSet<String> = next
            .photos
            .iter()
            .filter(|p| p.pin == pin)
            .filter_map(|p| p.id.clone())
            .collect();

        let mut keys = Vec::with_capacity(records.len());
        for record in records {
            if let Some(id) = &record.id {
                if !seen.insert(id.clone()) {
                    debug!("Skipping duplicate photo {id} for pin {pin}");
                    continue;
                }
            }

            let key = Uuid::new_v4();
            next.photos.push(Photo {
                key,
                pin,
                id: record.id.clone(),
                title: record.title.clone(),
                image_url: record.image_url.clone(),
                seq: next.next_seq,
                image: None,
            });
            next.next_seq += 1;
            keys.push(key);
        }

        if keys.is_empty() {
            return Ok(keys);
        }

        self.commit(next)?;
        Ok(keys)
    }

    /// Removes every photo owned by a pin, returning them in the display order they had
    pub fn delete_all(&mut self, pin: Uuid) -> Result<Vec<Photo>, StoreError> {
        if !self.index.has_pin(pin) {
            return Err(StoreError::UnknownPin(pin));
        }

        let removed = self.photos_for(pin);
        if removed.is_empty() {
            return Ok(removed);
        }

        let mut next = self.index.clone();
        next.photos.retain(|p| p.pin != pin);
        self.commit(next)?;

        self.remove_cached_files(&removed);
        Ok(removed)
    }

    /// Removes the photos at the given display positions. Positions past the
    /// end are ignored. Returns the removed photos with the positions they had.
    pub fn delete_selected(
        &mut self,
        pin: Uuid,
        positions: &BTreeSet<usize>,
    ) -> Result<Vec<(usize, Photo)>, StoreError> {
        if !self.index.has_pin(pin) {
            return Err(StoreError::UnknownPin(pin));
        }

        let view = self.photos_for(pin);
        let removed: Vec<(usize, Photo)> = positions
            .iter()
            .filter_map(|&pos| match view.get(pos) {
                Some(photo) => Some((pos, photo.clone())),
                None => {
                    warn!("Ignoring position {pos}; pin {pin} has {} photos", view.len());
                    None
                }
            })
            .collect();

        if removed.is_empty() {
            return Ok(removed);
        }

        let keys: HashSet<Uuid> = removed.iter().map(|(_, p)| p.key).collect();
        let mut next = self.index.clone();
        next.photos.retain(|p| !keys.contains(&p.key));
        self.commit(next)?;

        let photos: Vec<Photo> = removed.iter().map(|(_, p)| p.clone()).collect();
        self.remove_cached_files(&photos);
        Ok(removed)
    }

    /// Cache file name for a photo's image, relative to the cache directory.
    /// `None` when the photo is unknown.
    pub fn image_file(&self, key: Uuid) -> Option<String> {
        let photo = self.photo(key)?;
        Some(format!("{}/{}.img", photo.pin, key))
    }

    /// Location and record of a photo's cached image, if it has one
    pub fn cached_image(&self, key: Uuid) -> Option<(PathBuf, CachedImage)> {
        let cached = self.photo(key)?.image.clone()?;
        Some((self.cache_dir.join(&cached.file), cached))
    }

    /// Moves staged image bytes into place and records them against the photo.
    ///
    /// The photo is revalidated first: when it was deleted, or another request
    /// cached its image in the meantime, the staged file is discarded and the
    /// store is left as it was.
    pub fn commit_image(
        &mut self,
        key: Uuid,
        staged: StagedImage,
    ) -> Result<ImageCommit, StoreError> {
        let Some(photo) = self.photo(key) else {
            staged.discard();
            return Ok(ImageCommit::PhotoGone);
        };
        if photo.has_image() {
            staged.discard();
            return Ok(ImageCommit::AlreadyCached);
        }

        let path = self.cache_dir.join(&staged.cached.file);
        if let Err(source) = fs::rename(&staged.tmp, &path) {
            let _ = fs::remove_file(&staged.tmp);
            return Err(StoreError::Io { path, source });
        }

        let mut next = self.index.clone();
        if let Some(photo) = next.photos.iter_mut().find(|p| p.key == key) {
            photo.image = Some(staged.cached);
        }

        if let Err(e) = self.commit(next) {
            let _ = fs::remove_file(&path);
            return Err(e);
        }

        Ok(ImageCommit::Stored)
    }

    /// Forgets a photo's cached image when it still matches `stale`, removing
    /// the file if any of it is left
    pub fn clear_image(&mut self, key: Uuid, stale: &CachedImage) -> Result<(), StoreError> {
        if self.photo(key).and_then(|p| p.image.as_ref()) != Some(stale) {
            return Ok(());
        }

        let mut next = self.index.clone();
        if let Some(photo) = next.photos.iter_mut().find(|p| p.key == key) {
            photo.image = None;
        }
        self.commit(next)?;

        let path = self.cache_dir.join(&stale.file);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove cached image {}: {}", path.display(), e);
            }
        }
        Ok(())
    }

    fn remove_cached_files(&self, photos: &[Photo]) {
        for cached in photos.iter().filter_map(|p| p.image.as_ref()) {
            let path = self.cache_dir.join(&cached.file);
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove cached image {}: {}", path.display(), e);
            }
        }
    }
}

/// Writes through a sibling temp file so readers never see a partial file
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes).map_err(io_error(&tmp))?;
    fs::rename(&tmp, path).map_err(io_error(path))
}

/// What happened to staged image bytes on commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageCommit {
    Stored,
    /// The photo already had an image; the staged bytes were dropped
    AlreadyCached,
    /// The photo was deleted; the staged bytes were dropped
    PhotoGone,
}

/// Image bytes written to a temp file in the cache but not yet recorded
#[derive(Debug)]
pub struct StagedImage {
    tmp: PathBuf,
    cached: CachedImage,
}

impl StagedImage {
    fn discard(self) {
        if let Err(e) = fs::remove_file(&self.tmp) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove staged image {}: {}", self.tmp.display(), e);
            }
        }
        // Leaves no empty directory behind for a pin removed meanwhile
        if let Some(dir) = self.tmp.parent() {
            let _ = fs::remove_dir(dir);
        }
    }
}

/// Writes image bytes next to their cache file, ready for
/// [`PhotoStore::commit_image`]. Runs without touching the index.
pub async fn stage_image(
    cache_dir: &Path,
    file: String,
    bytes: &[u8],
) -> Result<StagedImage, StoreError> {
    let path = cache_dir.join(&file);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(io_error(parent))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.tmp", Uuid::new_v4()));
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await.map_err(io_error(&tmp))?;

    let cached = CachedImage {
        file,
        size: bytes.len() as u64,
        checksum: format!("{:x}", md5::compute(bytes)),
    };
    Ok(StagedImage { tmp, cached })
}

/// Reads cached image bytes, verifying them against the recorded checksum
pub async fn read_image(
    key: Uuid,
    path: &Path,
    cached: &CachedImage,
) -> Result<Vec<u8>, StoreError> {
    let bytes = tokio::fs::read(path).await.map_err(io_error(path))?;

    let actual = format!("{:x}", md5::compute(&bytes));
    if actual != cached.checksum {
        return Err(StoreError::Corrupt {
            key,
            expected: cached.checksum.clone(),
            actual,
        });
    }

    Ok(bytes)
}
