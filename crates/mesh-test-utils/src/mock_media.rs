//! Mock local media for coordinator tests.
//!
//! Records every acquire, release and track toggle so tests can assert that
//! muting never touched a link and that media is released exactly once.
//!
//! # Example
//!
//! ```rust,ignore
//! use mesh_test_utils::MockMedia;
//!
//! let media = MockMedia::builder().device_unavailable("camera busy").build();
//! ```

use async_trait::async_trait;
use mesh_coordinator::media::{LocalMedia, MediaError, MediaHandle, TrackKind};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// One `set_enabled` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackToggle {
    pub handle: MediaHandle,
    pub track: TrackKind,
    pub enabled: bool,
}

#[derive(Debug, Default)]
struct MediaLog {
    live: HashSet<MediaHandle>,
    acquired: Vec<MediaHandle>,
    released: Vec<MediaHandle>,
    toggles: Vec<TrackToggle>,
}

/// Mock `LocalMedia`.
#[derive(Debug, Default)]
pub struct MockMedia {
    unavailable: Option<String>,
    next_handle: AtomicU64,
    log: Mutex<MediaLog>,
}

impl MockMedia {
    /// Media that always acquires.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn builder() -> MockMediaBuilder {
        MockMediaBuilder::default()
    }

    /// Handles acquired so far, in order.
    #[must_use]
    pub fn acquired(&self) -> Vec<MediaHandle> {
        self.log.lock().unwrap().acquired.clone()
    }

    /// Handles released so far, in order.
    #[must_use]
    pub fn released(&self) -> Vec<MediaHandle> {
        self.log.lock().unwrap().released.clone()
    }

    /// Every `set_enabled` call, in order.
    #[must_use]
    pub fn toggles(&self) -> Vec<TrackToggle> {
        self.log.lock().unwrap().toggles.clone()
    }

    /// Whether a handle is acquired and not yet released.
    #[must_use]
    pub fn is_live(&self, handle: MediaHandle) -> bool {
        self.log.lock().unwrap().live.contains(&handle)
    }

    /// Number of live handles.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.log.lock().unwrap().live.len()
    }
}

#[async_trait]
impl LocalMedia for MockMedia {
    async fn acquire(&self) -> Result<MediaHandle, MediaError> {
        if let Some(reason) = &self.unavailable {
            return Err(MediaError::DeviceUnavailable(reason.clone()));
        }
        let handle = MediaHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        let mut log = self.log.lock().unwrap();
        log.live.insert(handle);
        log.acquired.push(handle);
        Ok(handle)
    }

    async fn release(&self, handle: MediaHandle) {
        let mut log = self.log.lock().unwrap();
        if log.live.remove(&handle) {
            log.released.push(handle);
        }
    }

    async fn set_enabled(
        &self,
        handle: MediaHandle,
        track: TrackKind,
        enabled: bool,
    ) -> Result<(), MediaError> {
        let mut log = self.log.lock().unwrap();
        if !log.live.contains(&handle) {
            return Err(MediaError::UnknownHandle);
        }
        log.toggles.push(TrackToggle {
            handle,
            track,
            enabled,
        });
        Ok(())
    }
}

/// Builder for `MockMedia`.
#[derive(Debug, Default)]
pub struct MockMediaBuilder {
    unavailable: Option<String>,
}

impl MockMediaBuilder {
    /// Every acquire fails with `DeviceUnavailable`.
    #[must_use]
    pub fn device_unavailable(mut self, reason: impl Into<String>) -> Self {
        self.unavailable = Some(reason.into());
        self
    }

    #[must_use]
    pub fn build(self) -> MockMedia {
        MockMedia {
            unavailable: self.unavailable,
            ..MockMedia::default()
        }
    }
}
