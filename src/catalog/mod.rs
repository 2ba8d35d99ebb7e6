//! Camera catalog discovery.
//!
//! The remote source publishes a marker list (one per camera location) and a
//! per-location popup page that embeds the camera's image URL. Resolution is
//! two-phase: list locations, then scrape each detail page for the numeric
//! camera id. Only fully resolved records are handed to the fetch pool.

mod http;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StageError;

pub use http::HttpCatalogSource;

/// Location known to the catalog, before its camera id is resolved.
#[derive(Clone, Debug, PartialEq)]
pub struct LocationRecord {
    pub location_id: u64,
    pub latitude: f64,
    pub longitude: f64,
    pub name: String,
}

/// Location with a resolved camera id. Only these are ever fetched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraRecord {
    pub camera_id: u64,
    pub location_id: u64,
    pub latitude: f64,
    pub longitude: f64,
    pub name: String,
}

impl LocationRecord {
    pub fn with_camera_id(self, camera_id: u64) -> CameraRecord {
        CameraRecord {
            camera_id,
            location_id: self.location_id,
            latitude: self.latitude,
            longitude: self.longitude,
            name: self.name,
        }
    }
}

/// Raw access to the catalog endpoints.
pub trait CatalogSource {
    /// Body of the marker list endpoint.
    fn location_list(&self) -> Result<String>;

    /// Body of the detail page for one location.
    fn detail_page(&self, location_id: u64) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct MarkerList {
    markers: Vec<Marker>,
}

#[derive(Debug, Deserialize)]
struct Marker {
    id: Value,
    latitude: Value,
    longitude: Value,
    #[serde(default)]
    content: Option<String>,
}

pub struct CatalogResolver<S> {
    source: S,
    max_locations: usize,
}

impl<S: CatalogSource> CatalogResolver<S> {
    pub fn new(source: S, max_locations: usize) -> Self {
        Self {
            source,
            max_locations,
        }
    }

    /// Locations from the marker list, capped at `max_locations`.
    pub fn list_locations(&self) -> Result<Vec<LocationRecord>, StageError> {
        let body = self
            .source
            .location_list()
            .map_err(|e| StageError::CatalogUnavailable(format!("{:#}", e)))?;
        let list: MarkerList = serde_json::from_str(&body)
            .map_err(|e| StageError::CatalogUnavailable(format!("malformed marker list: {}", e)))?;

        list.markers
            .into_iter()
            .take(self.max_locations)
            .map(|marker| {
                Ok(LocationRecord {
                    location_id: lenient_u64(&marker.id).ok_or_else(|| {
                        StageError::CatalogUnavailable(format!("marker id {} is not numeric", marker.id))
                    })?,
                    latitude: lenient_f64(&marker.latitude).ok_or_else(|| {
                        StageError::CatalogUnavailable(format!("marker {} has no latitude", marker.id))
                    })?,
                    longitude: lenient_f64(&marker.longitude).ok_or_else(|| {
                        StageError::CatalogUnavailable(format!("marker {} has no longitude", marker.id))
                    })?,
                    name: marker.content.unwrap_or_default(),
                })
            })
            .collect()
    }

    pub fn resolve_camera_id(&self, location_id: u64) -> Result<u64, StageError> {
        let page = self
            .source
            .detail_page(location_id)
            .map_err(|e| StageError::CameraResolutionFailed {
                location_id,
                reason: format!("{:#}", e),
            })?;
        scrape_camera_id(&page).ok_or_else(|| StageError::CameraResolutionFailed {
            location_id,
            reason: "no camera id next to a .jpg reference".to_string(),
        })
    }

    /// Full bootstrap: list, then resolve each location, skipping failures.
    pub fn resolve_all(&self) -> Result<Vec<CameraRecord>, StageError> {
        let locations = self.list_locations()?;
        let total = locations.len();
        let mut cameras = Vec::with_capacity(total);
        for (idx, location) in locations.into_iter().enumerate() {
            match self.resolve_camera_id(location.location_id) {
                Ok(camera_id) => {
                    log::debug!(
                        "resolved {} of {}: location {} -> camera {}",
                        idx + 1,
                        total,
                        location.location_id,
                        camera_id
                    );
                    cameras.push(location.with_camera_id(camera_id));
                }
                Err(e) => log::warn!("skipping location: {}", e),
            }
        }
        log::info!("catalog resolved {} of {} locations", cameras.len(), total);
        Ok(cameras)
    }
}

/// Camera id embedded as `...cctv261.jpg...` in a detail page.
///
/// Looks back at most five characters from the first `.jpg` for the `v`
/// that precedes the digits.
pub fn scrape_camera_id(page: &str) -> Option<u64> {
    let bytes = page.as_bytes();
    let jpg = page.find(".jpg")?;
    (1..=5)
        .filter_map(|back| jpg.checked_sub(back))
        .find(|&idx| bytes[idx] == b'v')
        .and_then(|v_idx| page.get(v_idx + 1..jpg))
        .filter(|digits| !digits.is_empty())
        .and_then(|digits| digits.parse().ok())
}

fn lenient_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn lenient_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
