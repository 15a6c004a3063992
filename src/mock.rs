//! In-process stand-ins for the photo search and image download services.
//!
//! Both fakes count their calls and can be gated: a gated fake signals
//! `started` when a call begins and then waits for the gate to be notified
//! before answering, which lets tests interleave deletes with in-flight work.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

use crate::fetch::{FetchError, ImageSource};
use crate::flickr::{PhotoRecord, PhotoSearch, SearchError};

type SearchHandler = Box<dyn Fn(f64, f64) -> Result<Vec<PhotoRecord>, SearchError> + Send + Sync>;
type FetchHandler = Box<dyn Fn(&str) -> Result<Vec<u8>, FetchError> + Send + Sync>;

/// A few records shaped like a real search response
pub fn create_mock_records() -> Vec<PhotoRecord> {
    vec![
        PhotoRecord::new("mock3", "Mock Photo 3", "https://example.com/mock3.jpg"),
        PhotoRecord::new("mock1", "Mock Photo 1", "https://example.com/mock1.jpg"),
        PhotoRecord {
            id: Some("mock2".to_string()),
            title: None,
            image_url: None,
        },
    ]
}

pub struct MockSearch {
    handler: SearchHandler,
    calls: AtomicUsize,
    started: Arc<Notify>,
    gate: Option<Arc<Notify>>,
}

impl MockSearch {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(f64, f64) -> Result<Vec<PhotoRecord>, SearchError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            calls: AtomicUsize::new(0),
            started: Arc::new(Notify::new()),
            gate: None,
        }
    }

    /// Answers every search with the same records
    pub fn returning(records: Vec<PhotoRecord>) -> Self {
        Self::new(move |_, _| Ok(records.clone()))
    }

    /// Holds every search until the returned gate is notified
    pub fn gated(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.gate = Some(Arc::clone(&gate));
        (self, gate)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Notified each time a search begins
    pub fn started(&self) -> Arc<Notify> {
        Arc::clone(&self.started)
    }
}

#[async_trait]
impl PhotoSearch for MockSearch {
    async fn search(&self, latitude: f64, longitude: f64) -> Result<Vec<PhotoRecord>, SearchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        (self.handler)(latitude, longitude)
    }
}

pub struct MockImageSource {
    handler: FetchHandler,
    calls: AtomicUsize,
    started: Arc<Notify>,
    gate: Option<Arc<Notify>>,
}

impl MockImageSource {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str) -> Result<Vec<u8>, FetchError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            calls: AtomicUsize::new(0),
            started: Arc::new(Notify::new()),
            gate: None,
        }
    }

    /// Answers every fetch with the URL's own bytes
    pub fn echo() -> Self {
        Self::new(|url| Ok(url.as_bytes().to_vec()))
    }

    /// Fails every fetch
    pub fn failing() -> Self {
        Self::new(|_| Err(FetchError::NoData))
    }

    pub fn gated(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.gate = Some(Arc::clone(&gate));
        (self, gate)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> Arc<Notify> {
        Arc::clone(&self.started)
    }
}

#[async_trait]
impl ImageSource for MockImageSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        (self.handler)(url)
    }
}
