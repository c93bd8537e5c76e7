//! Common utilities and types shared across camsync crates.
//!
//! This module provides the foundational value types used by the capture,
//! network and sync layers, together with the shared error taxonomy.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{CameraId, ConnectivityState, ImageId, UnmappedTriggerPolicy};
