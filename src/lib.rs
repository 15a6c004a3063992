//! # pinphotos
//!
//! Drop pins on a map and browse a page of nearby Flickr photos for each,
//! cached locally so revisiting a pin doesn't hit the network again.
//!
//! ## Features
//!
//! - One randomised photo search per empty pin, never repeated while photos are stored
//! - Durable YAML index of pins and photo records
//! - Image bytes fetched lazily on first display and cached on disk
//! - Incremental change sets (inserted/deleted/updated positions) for every mutation
//! - Delete-all-and-refetch or delete a selection of photos
//! - In-flight work for a cleared pin is cancelled, and late results for deleted photos are dropped

// Export modules for integration testing
pub mod changes;
pub mod config;
pub mod engine;
pub mod fetch;
pub mod flickr;
pub mod mock;
pub mod selection;
pub mod store;
