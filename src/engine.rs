//! Pin/photo synchronization for pinphotos.
//!
//! The `SyncEngine` decides, per pin, whether photos come from the local
//! store or from a fresh search, reconciles search results into the store,
//! and lazily caches image bytes for individual photos. Every structural
//! mutation is reported back as a [`ChangeSet`] so a view can update in
//! place rather than reloading.
//!
//! Each pin has a slot holding:
//! - an async mutex, so reconciliation passes and deletes for one pin never
//!   interleave
//! - its [`PinState`]
//! - cancellation generations for searches and for image fetches. Deleting
//!   all of a pin's photos or the pin itself bumps the search generation
//!   before waiting for the lock, and the image generation once the delete
//!   has committed; suspended work for that pin gives up as soon as it
//!   notices
//!
//! The store sits behind a plain mutex that is never held across an await,
//! and image payloads are read and written outside it. Anything that resumes
//! after a suspension re-checks that its target still exists before writing.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::changes::{ChangeSet, ChangeTracker};
use crate::fetch::{FetchError, ImageSource};
use crate::flickr::{PhotoSearch, SearchError};
use crate::selection::SelectionSet;
use crate::store::{ImageCommit, Photo, PhotoStore, Pin, StoreError, read_image, stage_image};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("unknown pin {0}")]
    UnknownPin(Uuid),
    #[error("unknown photo {0}")]
    UnknownPhoto(Uuid),
    #[error("operation cancelled")]
    Cancelled,
}

/// Where a pin is in its fetch lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinState {
    /// No photos stored; the next display triggers a search
    Empty,
    /// A search is in flight
    Fetching,
    /// Photos are stored and served without touching the network
    Populated,
    /// Photos were cleared and a replacement search is in flight
    Refreshing,
}

/// Why a photo is shown with a placeholder instead of its image
#[derive(Debug)]
pub enum PlaceholderReason {
    NoImageUrl,
    FetchFailed(FetchError),
    /// The pin's photos were cleared while the fetch was in flight
    Cancelled,
    /// The photo was deleted while the fetch was in flight
    Removed,
}

/// Result of ensuring a photo's bytes are cached
#[derive(Debug)]
pub enum ImageOutcome {
    /// Bytes were already cached; nothing was fetched
    Cached(Vec<u8>),
    /// Bytes were fetched and cached; `changes` carries the updated position
    Fetched { bytes: Vec<u8>, changes: ChangeSet },
    Placeholder(PlaceholderReason),
}

impl ImageOutcome {
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            ImageOutcome::Cached(bytes) | ImageOutcome::Fetched { bytes, .. } => Some(bytes),
            ImageOutcome::Placeholder(_) => None,
        }
    }
}

/// What a view should show right now for a pin
#[derive(Debug)]
pub struct DisplayView {
    /// Current photos in display order
    pub photos: Vec<Photo>,
    /// Reconciliation started because the pin had no photos
    pub pending: Option<JoinHandle<Result<ChangeSet, EngineError>>>,
}

struct PinSlot {
    lock: tokio::sync::Mutex<()>,
    state: Mutex<PinState>,
    searches: watch::Sender<u64>,
    images: watch::Sender<u64>,
}

impl PinSlot {
    fn new(state: PinState) -> Self {
        let (searches, _) = watch::channel(0);
        let (images, _) = watch::channel(0);
        Self {
            lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(state),
            searches,
            images,
        }
    }

    fn state(&self) -> PinState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: PinState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Moves an idle empty pin to `Fetching`; any other state is kept
    fn mark_fetching(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == PinState::Empty {
            *state = PinState::Fetching;
        }
    }

    /// Abandons every suspended search for this pin
    fn cancel_searches(&self) {
        self.searches.send_modify(|generation| *generation += 1);
    }

    /// Abandons every suspended image fetch for this pin
    fn cancel_images(&self) {
        self.images.send_modify(|generation| *generation += 1);
    }
}

pub struct SyncEngine {
    store: Mutex<PhotoStore>,
    search: Arc<dyn PhotoSearch>,
    images: Arc<dyn ImageSource>,
    pin_tolerance: f64,
    slots: Mutex<HashMap<Uuid, Arc<PinSlot>>>,
}

impl SyncEngine {
    pub fn new(
        store: PhotoStore,
        search: Arc<dyn PhotoSearch>,
        images: Arc<dyn ImageSource>,
        pin_tolerance: f64,
    ) -> Self {
        Self {
            store: Mutex::new(store),
            search,
            images,
            pin_tolerance,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn store(&self) -> MutexGuard<'_, PhotoStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, pin: Uuid) -> Result<Arc<PinSlot>, EngineError> {
        let initial = {
            let store = self.store();
            if store.pin(pin).is_none() {
                return Err(EngineError::UnknownPin(pin));
            }
            if store.count(pin) > 0 {
                PinState::Populated
            } else {
                PinState::Empty
            }
        };

        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(
            slots
                .entry(pin)
                .or_insert_with(|| Arc::new(PinSlot::new(initial))),
        ))
    }

    /// The state a pin rests in when nothing is in flight
    fn settled_state(&self, pin: Uuid) -> PinState {
        if self.store().count(pin) > 0 {
            PinState::Populated
        } else {
            PinState::Empty
        }
    }

    // Pins

    pub fn pins(&self) -> Vec<Pin> {
        self.store().pins().to_vec()
    }

    pub fn find_pin(&self, latitude: f64, longitude: f64) -> Option<Pin> {
        self.store()
            .find_pin(latitude, longitude, self.pin_tolerance)
            .cloned()
    }

    /// Drops a pin at a coordinate, reusing an existing pin within tolerance
    pub fn add_pin(&self, latitude: f64, longitude: f64) -> Result<Pin, EngineError> {
        let pin = self
            .store()
            .add_pin(latitude, longitude, self.pin_tolerance)?;
        info!("Pin {} at {latitude}, {longitude}", pin.id);
        Ok(pin)
    }

    /// Removes a pin with all its photos, abandoning any in-flight work for it
    pub async fn remove_pin(&self, pin: Uuid) -> Result<usize, EngineError> {
        let slot = self.slot(pin)?;
        slot.cancel_searches();
        let _guard = slot.lock.lock().await;

        let removed = self.store().remove_pin(pin)?;
        slot.cancel_images();
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pin);

        info!("Removed pin {pin} and {removed} photos");
        Ok(removed)
    }

    pub fn pin_state(&self, pin: Uuid) -> Result<PinState, EngineError> {
        Ok(self.slot(pin)?.state())
    }

    // Photos

    /// A pin's stored photos in display order, without triggering a search
    pub fn photos(&self, pin: Uuid) -> Result<Vec<Photo>, EngineError> {
        let store = self.store();
        if store.pin(pin).is_none() {
            return Err(EngineError::UnknownPin(pin));
        }
        Ok(store.photos_for(pin))
    }

    /// Returns the pin's photos as they are now. When there are none, a
    /// reconciliation pass is started in the background and handed back as
    /// `pending`.
    pub fn photos_for_display(self: &Arc<Self>, pin: Uuid) -> Result<DisplayView, EngineError> {
        let slot = self.slot(pin)?;
        let photos = self.store().photos_for(pin);

        if !photos.is_empty() {
            return Ok(DisplayView {
                photos,
                pending: None,
            });
        }

        slot.mark_fetching();
        let engine = Arc::clone(self);
        let pending = tokio::spawn(async move { engine.refresh(pin).await });

        Ok(DisplayView {
            photos,
            pending: Some(pending),
        })
    }

    /// Runs a reconciliation pass if the pin has no photos. A pin that already
    /// has photos is left alone and an empty change set is returned.
    pub async fn refresh(&self, pin: Uuid) -> Result<ChangeSet, EngineError> {
        let slot = self.slot(pin)?;
        let _guard = slot.lock.lock().await;

        let mut tracker = ChangeTracker::new();
        tracker.begin();
        self.fetch_locked(pin, &slot, PinState::Fetching, tracker)
            .await
    }

    /// The fetch path. The caller holds the pin lock.
    async fn fetch_locked(
        &self,
        pin: Uuid,
        slot: &PinSlot,
        fetching_state: PinState,
        mut tracker: ChangeTracker,
    ) -> Result<ChangeSet, EngineError> {
        let (latitude, longitude) = {
            let store = self.store();
            let Some(p) = store.pin(pin) else {
                return Err(EngineError::UnknownPin(pin));
            };
            if store.count(pin) > 0 {
                slot.set_state(PinState::Populated);
                return Ok(tracker.finish());
            }
            (p.latitude, p.longitude)
        };

        slot.set_state(fetching_state);
        let mut cancelled = slot.searches.subscribe();

        let result = tokio::select! {
            result = self.search.search(latitude, longitude) => result,
            _ = cancelled.changed() => {
                debug!("Search for pin {pin} cancelled");
                slot.set_state(PinState::Empty);
                return Err(EngineError::Cancelled);
            }
        };

        let records = match result {
            Ok(records) => records,
            Err(e) => {
                warn!("Photo search for pin {pin} failed: {e}");
                slot.set_state(PinState::Empty);
                return Err(e.into());
            }
        };

        let mut store = self.store();
        let keys = match store.insert_many(pin, &records) {
            Ok(keys) => keys,
            Err(e) => {
                slot.set_state(PinState::Empty);
                return Err(e.into());
            }
        };

        let view = store.photos_for(pin);
        let positions: HashMap<Uuid, usize> = view
            .iter()
            .enumerate()
            .map(|(pos, photo)| (photo.key, pos))
            .collect();
        for key in &keys {
            if let Some(&pos) = positions.get(key) {
                tracker.record_insert(pos);
            }
        }

        if view.is_empty() {
            info!("No photos found around pin {pin}");
            slot.set_state(PinState::Empty);
        } else {
            info!("Stored {} photos for pin {pin}", keys.len());
            slot.set_state(PinState::Populated);
        }

        Ok(tracker.finish())
    }

    /// Clears every photo of a pin and immediately searches again. Deleted
    /// positions refer to the old list, inserted positions to the new one.
    pub async fn delete_all(&self, pin: Uuid) -> Result<ChangeSet, EngineError> {
        let slot = self.slot(pin)?;
        slot.cancel_searches();
        let _guard = slot.lock.lock().await;

        let mut tracker = ChangeTracker::new();
        tracker.begin();

        slot.set_state(PinState::Refreshing);
        let result = self.store().delete_all(pin);
        let removed = match result {
            Ok(removed) => removed,
            Err(e) => {
                slot.set_state(self.settled_state(pin));
                return Err(e.into());
            }
        };
        slot.cancel_images();
        for pos in 0..removed.len() {
            tracker.record_delete(pos);
        }
        debug!("Cleared {} photos from pin {pin}", removed.len());

        self.fetch_locked(pin, &slot, PinState::Refreshing, tracker)
            .await
    }

    /// Deletes the selected photos and clears the selection
    pub async fn delete_selected(
        &self,
        pin: Uuid,
        selection: &mut SelectionSet,
    ) -> Result<ChangeSet, EngineError> {
        let slot = self.slot(pin)?;
        let _guard = slot.lock.lock().await;

        let mut tracker = ChangeTracker::new();
        tracker.begin();

        let removed = self.store().delete_selected(pin, selection.positions())?;
        for (pos, _) in &removed {
            tracker.record_delete(*pos);
        }

        selection.clear();
        slot.set_state(self.settled_state(pin));

        Ok(tracker.finish())
    }

    // Images

    /// Makes sure a photo's image bytes are cached, fetching them on first
    /// request. Fetch failures are logged and reported as a placeholder; the
    /// next request tries again.
    pub async fn ensure_image(&self, key: Uuid) -> Result<ImageOutcome, EngineError> {
        let photo = self.store().photo(key).cloned();
        let photo = photo.ok_or(EngineError::UnknownPhoto(key))?;
        if let Some(bytes) = self.cached_bytes(key).await? {
            return Ok(ImageOutcome::Cached(bytes));
        }

        let Some(url) = photo.image_url.as_deref() else {
            return Ok(ImageOutcome::Placeholder(PlaceholderReason::NoImageUrl));
        };

        let slot = self.slot(photo.pin)?;
        let mut cancelled = slot.images.subscribe();

        let fetched = tokio::select! {
            result = self.images.fetch(url) => result,
            _ = cancelled.changed() => {
                debug!("Image fetch for photo {key} cancelled");
                return Ok(ImageOutcome::Placeholder(PlaceholderReason::Cancelled));
            }
        };

        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to fetch image for photo {key} from {url}: {e}");
                return Ok(ImageOutcome::Placeholder(PlaceholderReason::FetchFailed(e)));
            }
        };

        let target = {
            let store = self.store();
            store
                .image_file(key)
                .map(|file| (store.cache_dir().to_path_buf(), file))
        };
        let Some((cache_dir, file)) = target else {
            debug!("Photo {key} was deleted while its image was fetched");
            return Ok(ImageOutcome::Placeholder(PlaceholderReason::Removed));
        };
        let staged = stage_image(&cache_dir, file, &bytes).await?;

        let (commit, position) = {
            let mut store = self.store();
            let commit = store.commit_image(key, staged)?;
            (commit, store.position_of(key))
        };

        match commit {
            ImageCommit::Stored => {
                let mut tracker = ChangeTracker::new();
                tracker.begin();
                if let Some(pos) = position {
                    tracker.record_update(pos);
                }
                Ok(ImageOutcome::Fetched {
                    bytes,
                    changes: tracker.finish(),
                })
            }
            // Another request cached it while this one was suspended
            ImageCommit::AlreadyCached => {
                let existing = self.cached_bytes(key).await?;
                Ok(ImageOutcome::Cached(existing.unwrap_or(bytes)))
            }
            ImageCommit::PhotoGone => {
                debug!("Photo {key} was deleted while its image was fetched");
                Ok(ImageOutcome::Placeholder(PlaceholderReason::Removed))
            }
        }
    }

    /// Cached bytes for a photo. A cache file that has gone missing or no
    /// longer matches its checksum is forgotten so the image is fetched again.
    async fn cached_bytes(&self, key: Uuid) -> Result<Option<Vec<u8>>, EngineError> {
        let cached = self.store().cached_image(key);
        let Some((path, cached)) = cached else {
            return Ok(None);
        };

        match read_image(key, &path, &cached).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.is_missing_or_corrupt() => {
                warn!("Discarding cached image for photo {key}: {e}");
                self.store().clear_image(key, &cached)?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Runs [`ensure_image`](Self::ensure_image) in the background and hands
    /// the outcome to `on_complete`
    pub fn ensure_image_with<F>(self: &Arc<Self>, key: Uuid, on_complete: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<ImageOutcome, EngineError>) + Send + 'static,
    {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = engine.ensure_image(key).await;
            on_complete(outcome);
        })
    }

    /// Number of photos with cached images, across all pins
    pub fn cached_count(&self) -> usize {
        self.store().cached_count()
    }
}
