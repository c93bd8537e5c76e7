//! In-memory collaborators for testing.
//!
//! Each double plays back a script of outcomes and records what it was asked
//! to do, so tests can drive the sync engine through exact failure sequences.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use camsync_common::{CameraId, ConnectivityState, ImageId};

use crate::capture::{CaptureError, CaptureSource};
use crate::probe::ReachabilityProbe;
use crate::upload::{UploadClient, UploadOutcome, UploadRequest};

type AttemptHook = Box<dyn Fn(usize, &UploadRequest) + Send + Sync>;

/// Scripted upload client.
///
/// Outcomes are consumed front to back; once the script is empty every
/// attempt is delivered. Delivered image ids are recorded in order.
pub struct MemoryUploadClient {
    script: Mutex<VecDeque<UploadOutcome>>,
    delivered: Mutex<Vec<ImageId>>,
    attempts: AtomicUsize,
    hook: Option<AttemptHook>,
}

impl MemoryUploadClient {
    /// Create a client that delivers everything.
    pub fn new() -> Self {
        Self::with_script(Vec::new())
    }

    /// Create a client that plays back `outcomes` before delivering.
    pub fn with_script(outcomes: Vec<UploadOutcome>) -> Self {
        Self {
            script: Mutex::new(outcomes.into()),
            delivered: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            hook: None,
        }
    }

    /// Run `hook` at the start of every attempt with the 1-based attempt
    /// number, before the outcome is decided.
    pub fn with_hook(
        mut self,
        hook: impl Fn(usize, &UploadRequest) + Send + Sync + 'static,
    ) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Ids of delivered images, in delivery order.
    pub fn delivered(&self) -> Vec<ImageId> {
        self.delivered.lock().unwrap().clone()
    }

    /// Total number of upload attempts.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Default for MemoryUploadClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UploadClient for MemoryUploadClient {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upload(&self, request: &UploadRequest) -> UploadOutcome {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = &self.hook {
            hook(attempt, request);
        }

        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(UploadOutcome::Delivered { location: None });

        match outcome {
            UploadOutcome::Delivered { location } => {
                self.delivered.lock().unwrap().push(request.image_id);
                UploadOutcome::Delivered {
                    location: location.or_else(|| {
                        Some(format!("memory://{}/{}", request.camera_id, request.image_id))
                    }),
                }
            }
            other => other,
        }
    }
}

/// Reachability probe returning scripted states, then a fixed fallback.
pub struct StaticProbe {
    script: Mutex<VecDeque<ConnectivityState>>,
    fallback: Mutex<ConnectivityState>,
    probes: AtomicUsize,
}

impl StaticProbe {
    pub fn new(state: ConnectivityState) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(state),
            probes: AtomicUsize::new(0),
        }
    }

    /// Play back `states` before falling back to the fixed state.
    pub fn with_script(mut self, states: Vec<ConnectivityState>) -> Self {
        self.script = Mutex::new(states.into());
        self
    }

    /// Change the fixed state.
    pub fn set(&self, state: ConnectivityState) {
        *self.fallback.lock().unwrap() = state;
    }

    /// Number of probes answered.
    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReachabilityProbe for StaticProbe {
    async fn probe(&self) -> ConnectivityState {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| *self.fallback.lock().unwrap())
    }
}

/// Capture source serving fixed bytes per camera.
///
/// Cameras without an image fail with `CaptureError::NotConfigured`.
pub struct MemoryCaptureSource {
    images: HashMap<CameraId, Bytes>,
    captures: AtomicUsize,
}

impl MemoryCaptureSource {
    pub fn new() -> Self {
        Self {
            images: HashMap::new(),
            captures: AtomicUsize::new(0),
        }
    }

    /// Serve `image` for `camera`.
    pub fn with_image(mut self, camera: CameraId, image: impl Into<Bytes>) -> Self {
        self.images.insert(camera, image.into());
        self
    }

    /// Number of successful captures.
    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

impl Default for MemoryCaptureSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureSource for MemoryCaptureSource {
    async fn capture(&self, camera: CameraId) -> Result<Bytes, CaptureError> {
        let image = self
            .images
            .get(&camera)
            .cloned()
            .ok_or(CaptureError::NotConfigured(camera))?;
        self.captures.fetch_add(1, Ordering::SeqCst);
        Ok(image)
    }
}
