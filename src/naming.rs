//! Filename-encoded image metadata.
//!
//! Staged images are named `{cameraId}_{locationId}_{epochSeconds}.jpg`. The
//! name is the only channel carrying location and capture time between the
//! fetch, classify and archive stages, so every stage goes through this module
//! to read or write it.

use std::fmt;
use std::path::Path;

pub const IMAGE_EXTENSION: &str = "jpg";

/// Parsed staged-image name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageName {
    pub camera_id: u64,
    pub location_id: u64,
    pub timestamp: u64,
}

impl ImageName {
    pub fn new(camera_id: u64, location_id: u64, timestamp: u64) -> Self {
        Self {
            camera_id,
            location_id,
            timestamp,
        }
    }

    /// File name for this image, e.g. `126_123_1539560991.jpg`.
    pub fn file_name(&self) -> String {
        self.to_string()
    }

    /// Parse a staged file name.
    ///
    /// The first field is carried along but not interpreted; the location and
    /// timestamp fields must be numeric and the timestamp non-zero. Anything
    /// else (`.DS_Store`, partial downloads, foreign files) is unidentifiable.
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(&format!(".{}", IMAGE_EXTENSION))?;
        let mut fields = stem.split('_');
        let camera = fields.next()?;
        let location = fields.next()?;
        let timestamp = fields.next()?;
        if fields.next().is_some() {
            return None;
        }
        let location_id: u64 = location.parse().ok()?;
        let timestamp: u64 = timestamp.parse().ok()?;
        if timestamp == 0 {
            return None;
        }
        let camera_id = camera.parse().unwrap_or(0);
        Some(Self {
            camera_id,
            location_id,
            timestamp,
        })
    }

    /// Parse the final component of a path.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.file_name()
            .and_then(|name| name.to_str())
            .and_then(Self::parse)
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}.{}",
            self.camera_id, self.location_id, self.timestamp, IMAGE_EXTENSION
        )
    }
}

/// Legacy accessor returning `(timestamp, locationId)`, or `(0, 0)` when the
/// name cannot be identified. Callers must discard on the sentinel.
pub fn timestamp_and_location(file_name: &str) -> (u64, u64) {
    ImageName::parse(file_name)
        .map(|name| (name.timestamp, name.location_id))
        .unwrap_or((0, 0))
}
