//! Traffic camera counting pipeline.
//!
//! The pipeline discovers public traffic cameras, downloads one still image
//! per camera per cycle, counts cars, trucks and people in each image with an
//! object detector, writes one count record per image to a telemetry store
//! and archives every processed image to object storage.
//!
//! # Module Structure
//!
//! - `catalog`: camera discovery (location list + per-location camera id)
//! - `fetch`: bounded parallel image download into the raw directory
//! - `detect`: detector backends, label map, threshold and per-class tally
//! - `telemetry`: count records and the sinks they are written to
//! - `archive`: object keys, object stores and the background uploader
//! - `annotate`: sampled spot-check copies with detection boxes drawn in
//! - `orchestrator`: the bootstrap / cycle / drain state machine
//! - `naming`: the `{camera}_{location}_{epoch}.jpg` file name contract

use std::time::{SystemTime, UNIX_EPOCH};

pub mod annotate;
pub mod archive;
pub mod catalog;
pub mod config;
pub mod detect;
pub mod error;
pub mod fetch;
pub mod naming;
pub mod orchestrator;
pub mod telemetry;

pub use archive::{
    ArchivalUploader, Category, Disposition, DrainReport, FilesystemObjectStore, ObjectStore,
    UploadOutcome, UploadTask,
};
pub use catalog::{CameraRecord, CatalogResolver, CatalogSource, HttpCatalogSource};
pub use config::PipelineConfig;
pub use detect::{ClassTally, ClassificationEngine, Detection, DetectorBackend, StubBackend};
pub use error::StageError;
pub use fetch::{FetchOutcome, FetchReport, FetchWorkerPool, ImageSource};
pub use naming::ImageName;
pub use orchestrator::{CycleReport, Orchestrator, PipelineParts, PipelineState};
pub use telemetry::{
    InMemoryTelemetrySink, ResultAggregator, SqliteTelemetrySink, TelemetrySink, TrafficResult,
};

/// Current wall-clock time in whole seconds since the Unix epoch.
pub fn now_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
