//! Network-facing collaborators for camsync.
//!
//! This module provides trait-based interfaces for everything the sync engine
//! reaches over the network, plus HTTP implementations and in-memory doubles:
//!
//! - [`UploadClient`]: one upload attempt against the remote storage API
//! - [`ReachabilityProbe`]: one bounded connectivity check
//! - [`CaptureSource`]: one snapshot from a camera
//!
//! # Design Principles
//! - Single attempt per call: no implementation retries internally
//! - Typed outcomes: transport failures are classified, never raised
//! - Bounded: every network call carries a timeout

pub mod capture;
pub mod http;
pub mod memory;
pub mod probe;
pub mod upload;

pub use capture::{CameraEndpoint, CaptureError, CaptureSource, HttpSnapshotSource};
pub use http::{HttpUploadClient, UploadConfig};
pub use memory::{MemoryCaptureSource, MemoryUploadClient, StaticProbe};
pub use probe::{HttpProbe, ReachabilityProbe};
pub use upload::{UploadClient, UploadOutcome, UploadRequest, DEFAULT_CONTENT_TYPE};
