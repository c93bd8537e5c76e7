//! Common types used throughout camsync.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of one of the two trigger-driven cameras.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CameraId {
    #[serde(rename = "camera_1")]
    Camera1,
    #[serde(rename = "camera_2")]
    Camera2,
}

impl CameraId {
    /// All known cameras, in trigger order.
    pub const ALL: [CameraId; 2] = [CameraId::Camera1, CameraId::Camera2];

    /// Wire name of this camera.
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraId::Camera1 => "camera_1",
            CameraId::Camera2 => "camera_2",
        }
    }

    /// Match free-form trigger text against the known camera keywords.
    ///
    /// `camera_1`/`rfid_1` select camera 1 and `camera_2`/`rfid_2` select
    /// camera 2, case-insensitively and anywhere in the text. Camera 1
    /// keywords win when both appear. Returns `None` for unmapped input.
    pub fn from_trigger(text: &str) -> Option<Self> {
        let text = text.to_ascii_lowercase();
        if text.contains("camera_1") || text.contains("rfid_1") {
            Some(CameraId::Camera1)
        } else if text.contains("camera_2") || text.contains("rfid_2") {
            Some(CameraId::Camera2)
        } else {
            None
        }
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CameraId {
    type Err = crate::Error;

    /// Strict parse of the wire name; trigger text goes through
    /// [`UnmappedTriggerPolicy::resolve`] instead.
    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim() {
            "camera_1" => Ok(CameraId::Camera1),
            "camera_2" => Ok(CameraId::Camera2),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown camera id: {}",
                other
            ))),
        }
    }
}

/// What to do with trigger text that names no known camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnmappedTriggerPolicy {
    /// Refuse the trigger; nothing is captured.
    #[default]
    Reject,
    /// Fall back to a fixed camera.
    DefaultTo(CameraId),
}

impl UnmappedTriggerPolicy {
    /// Resolve trigger text to a camera under this policy.
    ///
    /// # Errors
    /// - `InvalidInput` if the text is unmapped and the policy is `Reject`
    pub fn resolve(&self, text: &str) -> crate::Result<CameraId> {
        match (CameraId::from_trigger(text), self) {
            (Some(camera), _) => Ok(camera),
            (None, UnmappedTriggerPolicy::DefaultTo(camera)) => Ok(*camera),
            (None, UnmappedTriggerPolicy::Reject) => Err(crate::Error::InvalidInput(format!(
                "Unmapped trigger: {:?}",
                text
            ))),
        }
    }
}

/// Unique identifier assigned to an image at capture time.
///
/// Never reused; ordering of captures is tracked separately by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(Uuid);

impl ImageId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ImageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ImageId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidInput(format!("Invalid image id {:?}: {}", s, e)))
    }
}

/// Process-wide network reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Online,
    Offline,
}

impl ConnectivityState {
    pub fn is_online(&self) -> bool {
        matches!(self, ConnectivityState::Online)
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectivityState::Online => f.write_str("online"),
            ConnectivityState::Offline => f.write_str("offline"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_camera_id_parse() {
        assert_eq!("camera_1".parse::<CameraId>().unwrap(), CameraId::Camera1);
        assert_eq!("camera_2".parse::<CameraId>().unwrap(), CameraId::Camera2);
        assert!("camera_3".parse::<CameraId>().is_err());
        assert!("".parse::<CameraId>().is_err());
    }

    #[test]
    fn test_camera_id_serde_uses_wire_name() {
        let json = serde_json::to_string(&CameraId::Camera2).unwrap();
        assert_eq!(json, "\"camera_2\"");
        let back: CameraId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, CameraId::Camera2);
    }

    #[test]
    fn test_trigger_keywords() {
        assert_eq!(CameraId::from_trigger("RFID_1 tag=abc"), Some(CameraId::Camera1));
        assert_eq!(CameraId::from_trigger("please camera_2"), Some(CameraId::Camera2));
        assert_eq!(CameraId::from_trigger("rfid_2"), Some(CameraId::Camera2));
        assert_eq!(CameraId::from_trigger("camera_1 camera_2"), Some(CameraId::Camera1));
        assert_eq!(CameraId::from_trigger("hello"), None);
    }

    #[test]
    fn test_unmapped_policy() {
        assert!(UnmappedTriggerPolicy::Reject.resolve("ping").is_err());
        assert_eq!(
            UnmappedTriggerPolicy::DefaultTo(CameraId::Camera1)
                .resolve("ping")
                .unwrap(),
            CameraId::Camera1
        );
        assert_eq!(
            UnmappedTriggerPolicy::Reject.resolve("rfid_2").unwrap(),
            CameraId::Camera2
        );
    }

    #[test]
    fn test_unmapped_policy_serde() {
        let policy: UnmappedTriggerPolicy = serde_json::from_str("\"reject\"").unwrap();
        assert_eq!(policy, UnmappedTriggerPolicy::Reject);

        let policy: UnmappedTriggerPolicy =
            serde_json::from_str(r#"{"default_to":"camera_2"}"#).unwrap();
        assert_eq!(policy, UnmappedTriggerPolicy::DefaultTo(CameraId::Camera2));
    }

    #[test]
    fn test_image_id_roundtrip_and_uniqueness() {
        let a = ImageId::new();
        let b = ImageId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().parse::<ImageId>().unwrap(), a);
        assert!("not-a-uuid".parse::<ImageId>().is_err());
    }

    proptest! {
        #[test]
        fn prop_reject_policy_never_invents_a_camera(text in "[a-z0-9 _]{0,24}") {
            let resolved = UnmappedTriggerPolicy::Reject.resolve(&text).ok();
            prop_assert_eq!(resolved, CameraId::from_trigger(&text));
        }
    }
}
