use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::CountBucket;

const DEFAULT_CATALOG_LIST_URL: &str = "http://dotsignals.org/new-data.php?query=";
const DEFAULT_CATALOG_DETAIL_URL: &str = "http://dotsignals.org/google_popup.php?cid=";
const DEFAULT_IMAGE_BASE_URL: &str = "http://207.251.86.238/cctv";
const DEFAULT_IMAGE_QUERY_SUFFIX: &str = ".jpg?math=0.011125243364920934";
const DEFAULT_MAX_LOCATIONS: usize = 50;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RAW_DIR: &str = "/tmp/rawimages/";
const DEFAULT_UPLOAD_DIR: &str = "/tmp/uploading/";
const DEFAULT_ARCHIVE_DIR: &str = "/tmp/preprocessed/";
const DEFAULT_POOL_WIDTH: usize = 20;
const DEFAULT_MIN_IMAGE_BYTES: u64 = 11_000;
const DEFAULT_DETECT_BACKEND: &str = crate::detect::STUB_BACKEND;
const DEFAULT_THRESHOLD: f32 = 0.4;
const DEFAULT_INPUT_SIZE: u32 = 300;
const DEFAULT_ARCHIVE_STORE: &str = "file:///tmp/archive-store";
const DEFAULT_BUCKET: &str = "ourcamera";
const DEFAULT_UPLOAD_WORKERS: usize = 4;
const DEFAULT_GRACE_SECS: u64 = 30;
const DEFAULT_TELEMETRY_SINK: &str = "sqlite:traffic.db";
const DEFAULT_MAX_IN_FLIGHT: usize = 200;
const DEFAULT_BACKPRESSURE_SLEEP_MS: u64 = 5_000;
const DEFAULT_CYCLE_INTERVAL_MS: u64 = 1_000;
const MIN_CYCLE_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_ANNOTATE_SAMPLE_RATE: f64 = 0.01;

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    catalog: Option<CatalogConfigFile>,
    dirs: Option<DirConfigFile>,
    fetch: Option<FetchConfigFile>,
    detect: Option<DetectConfigFile>,
    archive: Option<ArchiveConfigFile>,
    telemetry: Option<TelemetryConfigFile>,
    pipeline: Option<LoopConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CatalogConfigFile {
    list_url: Option<String>,
    detail_url: Option<String>,
    image_base_url: Option<String>,
    image_query_suffix: Option<String>,
    max_locations: Option<usize>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DirConfigFile {
    raw_dir: Option<PathBuf>,
    upload_dir: Option<PathBuf>,
    archive_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct FetchConfigFile {
    pool_width: Option<usize>,
    min_image_bytes: Option<u64>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    label_map_path: Option<PathBuf>,
    threshold: Option<f32>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    buckets: Option<BTreeMap<String, CountBucket>>,
}

#[derive(Debug, Deserialize, Default)]
struct ArchiveConfigFile {
    store: Option<String>,
    bucket: Option<String>,
    access_key: Option<String>,
    secret_key: Option<String>,
    upload_workers: Option<usize>,
    grace_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct TelemetryConfigFile {
    sink: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LoopConfigFile {
    max_files_in_flight: Option<usize>,
    backpressure_sleep_ms: Option<u64>,
    cycle_interval_ms: Option<u64>,
    annotate_sample_rate: Option<f64>,
}

/// Runtime configuration, built once at startup and handed to each component.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub catalog: CatalogSettings,
    pub dirs: DirSettings,
    pub fetch: FetchSettings,
    pub detect: DetectSettings,
    pub archive: ArchiveSettings,
    pub telemetry_sink: String,
    pub pipeline: LoopSettings,
}

#[derive(Debug, Clone)]
pub struct CatalogSettings {
    pub list_url: String,
    pub detail_url: String,
    pub image_base_url: String,
    pub image_query_suffix: String,
    pub max_locations: usize,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DirSettings {
    pub raw_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub archive_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub pool_width: usize,
    /// Responses at or below this size are source placeholder images.
    pub min_image_bytes: u64,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DetectSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub label_map_path: Option<PathBuf>,
    pub threshold: f32,
    pub input_width: u32,
    pub input_height: u32,
    pub buckets: BTreeMap<String, CountBucket>,
}

#[derive(Clone)]
pub struct ArchiveSettings {
    pub store: String,
    pub bucket: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub upload_workers: usize,
    pub grace: Duration,
}

impl std::fmt::Debug for ArchiveSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveSettings")
            .field("store", &self.store)
            .field("bucket", &self.bucket)
            .field("access_key", &self.access_key.as_ref().map(|_| "<set>"))
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<set>"))
            .field("upload_workers", &self.upload_workers)
            .field("grace", &self.grace)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_files_in_flight: usize,
    pub backpressure_sleep: Duration,
    pub cycle_interval: Duration,
    pub annotate_sample_rate: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_file(PipelineConfigFile::default())
    }
}

impl PipelineConfig {
    /// Defaults, then the file named by `TRAFFIC_CONFIG`, then env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("TRAFFIC_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => PipelineConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Self {
        let catalog = file.catalog.unwrap_or_default();
        let dirs = file.dirs.unwrap_or_default();
        let fetch = file.fetch.unwrap_or_default();
        let detect = file.detect.unwrap_or_default();
        let archive = file.archive.unwrap_or_default();
        let pipeline = file.pipeline.unwrap_or_default();

        Self {
            catalog: CatalogSettings {
                list_url: catalog
                    .list_url
                    .unwrap_or_else(|| DEFAULT_CATALOG_LIST_URL.to_string()),
                detail_url: catalog
                    .detail_url
                    .unwrap_or_else(|| DEFAULT_CATALOG_DETAIL_URL.to_string()),
                image_base_url: catalog
                    .image_base_url
                    .unwrap_or_else(|| DEFAULT_IMAGE_BASE_URL.to_string()),
                image_query_suffix: catalog
                    .image_query_suffix
                    .unwrap_or_else(|| DEFAULT_IMAGE_QUERY_SUFFIX.to_string()),
                max_locations: catalog.max_locations.unwrap_or(DEFAULT_MAX_LOCATIONS),
                timeout: Duration::from_secs(
                    catalog.timeout_secs.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
                ),
            },
            dirs: DirSettings {
                raw_dir: dirs.raw_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_RAW_DIR)),
                upload_dir: dirs
                    .upload_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR)),
                archive_dir: dirs
                    .archive_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_ARCHIVE_DIR)),
            },
            fetch: FetchSettings {
                pool_width: fetch.pool_width.unwrap_or(DEFAULT_POOL_WIDTH),
                min_image_bytes: fetch.min_image_bytes.unwrap_or(DEFAULT_MIN_IMAGE_BYTES),
                timeout: Duration::from_secs(
                    fetch.timeout_secs.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
                ),
            },
            detect: DetectSettings {
                backend: detect
                    .backend
                    .unwrap_or_else(|| DEFAULT_DETECT_BACKEND.to_string()),
                model_path: detect.model_path,
                label_map_path: detect.label_map_path,
                threshold: detect.threshold.unwrap_or(DEFAULT_THRESHOLD),
                input_width: detect.input_width.unwrap_or(DEFAULT_INPUT_SIZE),
                input_height: detect.input_height.unwrap_or(DEFAULT_INPUT_SIZE),
                buckets: detect
                    .buckets
                    .unwrap_or_else(CountBucket::default_mapping),
            },
            archive: ArchiveSettings {
                store: archive
                    .store
                    .unwrap_or_else(|| DEFAULT_ARCHIVE_STORE.to_string()),
                bucket: archive.bucket.unwrap_or_else(|| DEFAULT_BUCKET.to_string()),
                access_key: archive.access_key,
                secret_key: archive.secret_key,
                upload_workers: archive.upload_workers.unwrap_or(DEFAULT_UPLOAD_WORKERS),
                grace: Duration::from_secs(archive.grace_secs.unwrap_or(DEFAULT_GRACE_SECS)),
            },
            telemetry_sink: file
                .telemetry
                .and_then(|telemetry| telemetry.sink)
                .unwrap_or_else(|| DEFAULT_TELEMETRY_SINK.to_string()),
            pipeline: LoopSettings {
                max_files_in_flight: pipeline
                    .max_files_in_flight
                    .unwrap_or(DEFAULT_MAX_IN_FLIGHT),
                backpressure_sleep: Duration::from_millis(
                    pipeline
                        .backpressure_sleep_ms
                        .unwrap_or(DEFAULT_BACKPRESSURE_SLEEP_MS),
                ),
                cycle_interval: Duration::from_millis(
                    pipeline
                        .cycle_interval_ms
                        .unwrap_or(DEFAULT_CYCLE_INTERVAL_MS),
                ),
                annotate_sample_rate: pipeline
                    .annotate_sample_rate
                    .unwrap_or(DEFAULT_ANNOTATE_SAMPLE_RATE),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(dir) = env_nonempty("TRAFFIC_RAW_DIR") {
            self.dirs.raw_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_nonempty("TRAFFIC_UPLOAD_DIR") {
            self.dirs.upload_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_nonempty("TRAFFIC_ARCHIVE_DIR") {
            self.dirs.archive_dir = PathBuf::from(dir);
        }
        if let Some(store) = env_nonempty("TRAFFIC_ARCHIVE_STORE") {
            self.archive.store = store;
        }
        if let Some(sink) = env_nonempty("TRAFFIC_TELEMETRY_SINK") {
            self.telemetry_sink = sink;
        }
        if let Some(key) = env_nonempty("TRAFFIC_ACCESS_KEY") {
            self.archive.access_key = Some(key);
        }
        if let Some(secret) = env_nonempty("TRAFFIC_SECRET_KEY") {
            self.archive.secret_key = Some(secret);
        }
        if let Some(max) = env_nonempty("TRAFFIC_MAX_IN_FLIGHT") {
            self.pipeline.max_files_in_flight = max
                .parse()
                .map_err(|_| anyhow!("TRAFFIC_MAX_IN_FLIGHT must be a positive integer"))?;
        }
        if let Some(threshold) = env_nonempty("TRAFFIC_THRESHOLD") {
            self.detect.threshold = threshold
                .parse()
                .map_err(|_| anyhow!("TRAFFIC_THRESHOLD must be a number between 0 and 1"))?;
        }
        if let Some(rate) = env_nonempty("TRAFFIC_SAMPLE_RATE") {
            self.pipeline.annotate_sample_rate = rate
                .parse()
                .map_err(|_| anyhow!("TRAFFIC_SAMPLE_RATE must be a number between 0 and 1"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.detect.threshold) {
            return Err(anyhow!("detection threshold must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.pipeline.annotate_sample_rate) {
            return Err(anyhow!("annotate sample rate must be within [0, 1]"));
        }
        if self.fetch.pool_width == 0 {
            return Err(anyhow!("fetch pool width must be greater than zero"));
        }
        if self.archive.upload_workers == 0 {
            return Err(anyhow!("upload worker count must be greater than zero"));
        }
        if self.pipeline.max_files_in_flight == 0 {
            return Err(anyhow!("max files in flight must be greater than zero"));
        }
        if self.pipeline.cycle_interval < MIN_CYCLE_INTERVAL {
            return Err(anyhow!(
                "cycle interval must be at least {:?}; image names carry whole seconds",
                MIN_CYCLE_INTERVAL
            ));
        }
        for (name, value) in [
            ("catalog.list_url", &self.catalog.list_url),
            ("catalog.detail_url", &self.catalog.detail_url),
            ("catalog.image_base_url", &self.catalog.image_base_url),
            ("archive.store", &self.archive.store),
        ] {
            url::Url::parse(value).map_err(|e| anyhow!("{} is not a valid url: {}", name, e))?;
        }
        Ok(())
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path.extension().and_then(|ext| ext.to_str()) == Some("toml");
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_the_camera_source() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.fetch.pool_width, 20);
        assert_eq!(cfg.fetch.min_image_bytes, 11_000);
        assert_eq!(cfg.detect.threshold, 0.4);
        assert_eq!(cfg.catalog.max_locations, 50);
        assert_eq!(cfg.archive.bucket, "ourcamera");
        assert_eq!(
            cfg.detect.buckets.get("ups"),
            Some(&CountBucket::Trucks)
        );
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let mut cfg = PipelineConfig::default();
        cfg.detect.threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_sub_second_cycle_interval() {
        let mut cfg = PipelineConfig::default();
        cfg.pipeline.cycle_interval = Duration::from_millis(0);
        assert!(cfg.validate().is_err());
        cfg.pipeline.cycle_interval = Duration::from_millis(999);
        assert!(cfg.validate().is_err());
        cfg.pipeline.cycle_interval = Duration::from_secs(1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn debug_output_hides_credentials() {
        let mut cfg = PipelineConfig::default();
        cfg.archive.secret_key = Some("hunter2".into());
        let rendered = format!("{:?}", cfg.archive);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<set>"));
    }
}
