//! Pipeline driver: bootstrap, steady-state cycles, drain.
//!
//! A raw image moves through the filesystem as follows. The fetch pool
//! writes it into `raw_dir`. The cycle claims it by renaming it into
//! `upload_dir/raw/`, which makes it invisible to later scans, and only then
//! classifies it, so one image is counted once. The uploader finally renames
//! it into `archive_dir`. Annotated copies and camera maps live in
//! `upload_dir/annotated/` and `upload_dir/map/` and are deleted once
//! uploaded. Whatever is still under `upload_dir` at startup is re-enqueued
//! without being classified again.
//!
//! Names carry whole seconds, so fetches are stamped with strictly
//! increasing epochs and a claim or archive rename never replaces an
//! existing file.

use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::annotate::{self, AnnotationSampler};
use crate::archive::{
    self, object_key_now, ArchivalUploader, Category, Disposition, DrainReport, ObjectStore,
    UploadTask,
};
use crate::catalog::{CameraRecord, CatalogResolver, CatalogSource, HttpCatalogSource};
use crate::config::PipelineConfig;
use crate::detect::{ClassificationEngine, STUB_BACKEND};
use crate::error::StageError;
use crate::fetch::{
    sweep_partials, FetchWorkerPool, HttpImageSource, ImageSource, PARTIAL_SUFFIX,
};
use crate::naming::ImageName;
use crate::now_s;
use crate::telemetry::{self, ResultAggregator, TelemetrySink, TrafficResult};

const SLEEP_SLICE: Duration = Duration::from_millis(100);
const EPOCH_POLL: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Bootstrapping,
    Running,
    Draining,
    Stopped,
}

/// Counters for one steady-state cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Staging depth was at or above the ceiling; no fetch was issued.
    pub fetch_skipped: bool,
    pub staging_depth: usize,
    pub fetched: usize,
    pub rejected: usize,
    pub transport_errors: usize,
    pub classified: usize,
    pub discarded: usize,
    pub emitted: usize,
    pub dropped: usize,
    pub annotated: usize,
    pub uploads_queued: usize,
}

/// Outcome of one raw file.
#[derive(Clone, Debug, PartialEq, Eq)]
enum FileOutcome {
    Classified { emitted: bool, annotated: bool, queued: usize },
    Discarded(StageError),
    Skipped(StageError),
}

/// Collaborators the orchestrator drives. Production wiring uses the HTTP
/// implementations; tests swap in local ones.
pub struct PipelineParts<C> {
    pub catalog: C,
    pub images: Arc<dyn ImageSource>,
    pub engine: ClassificationEngine,
    pub sink: Box<dyn TelemetrySink>,
    pub store: Arc<dyn ObjectStore>,
}

impl PipelineParts<HttpCatalogSource> {
    /// Production wiring. Refuses the stub detector, which reports zero
    /// counts for every image.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        if config.detect.backend == STUB_BACKEND {
            return Err(anyhow!(
                "detect.backend is '{}', which counts nothing; configure a real detector or run with --dry-run",
                STUB_BACKEND
            ));
        }
        Self::wire(config)
    }

    /// Wiring that also accepts the stub detector, for exercising the
    /// fetch and archive path without a model.
    pub fn dry_run(config: &PipelineConfig) -> Result<Self> {
        let parts = Self::wire(config)?;
        if parts.engine.backend_name() == STUB_BACKEND {
            log::warn!("dry run: stub detector in use; every image will be recorded with zero counts");
        }
        Ok(parts)
    }

    fn wire(config: &PipelineConfig) -> Result<Self> {
        Ok(Self {
            catalog: HttpCatalogSource::new(&config.catalog),
            images: Arc::new(HttpImageSource::new(&config.catalog, &config.fetch)),
            engine: ClassificationEngine::from_settings(&config.detect)?,
            sink: telemetry::open_sink(&config.telemetry_sink)?,
            store: Arc::from(archive::open_store(&config.archive)?),
        })
    }
}

pub struct Orchestrator<C> {
    config: PipelineConfig,
    catalog: CatalogResolver<C>,
    fetch: FetchWorkerPool,
    engine: ClassificationEngine,
    aggregator: ResultAggregator,
    uploader: Option<ArchivalUploader>,
    sampler: AnnotationSampler,
    cameras: Vec<CameraRecord>,
    state: PipelineState,
    shutdown: Arc<AtomicBool>,
    last_fetch_epoch: u64,
}

impl<C: CatalogSource> Orchestrator<C> {
    pub fn new(config: PipelineConfig, parts: PipelineParts<C>) -> Self {
        let fetch = FetchWorkerPool::new(
            parts.images,
            &config.dirs.raw_dir,
            config.fetch.min_image_bytes,
            config.fetch.pool_width,
        );
        let uploader = ArchivalUploader::start(parts.store, config.archive.upload_workers);
        Self {
            catalog: CatalogResolver::new(parts.catalog, config.catalog.max_locations),
            fetch,
            engine: parts.engine,
            aggregator: ResultAggregator::new(parts.sink),
            uploader: Some(uploader),
            sampler: AnnotationSampler::new(config.pipeline.annotate_sample_rate),
            cameras: Vec::new(),
            state: PipelineState::Bootstrapping,
            shutdown: Arc::new(AtomicBool::new(false)),
            last_fetch_epoch: 0,
            config,
        }
    }

    /// Replace the random sampler, e.g. with a seeded one.
    pub fn with_sampler(mut self, sampler: AnnotationSampler) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn cameras(&self) -> &[CameraRecord] {
        &self.cameras
    }

    /// Flag that moves the loop into `Draining` once set.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Prepare directories, recover leftovers, resolve the camera catalog.
    ///
    /// An unreachable catalog is fatal; nothing else here is.
    pub fn bootstrap(&mut self) -> Result<()> {
        self.ensure_dirs()?;
        let swept = sweep_partials(&self.config.dirs.raw_dir);
        if swept > 0 {
            log::info!("removed {} interrupted downloads from the raw directory", swept);
        }
        let recovered = self.recover_upload_dir();
        if recovered > 0 {
            log::info!("re-enqueued {} files left in the upload directory", recovered);
        }

        self.cameras = self.catalog.resolve_all().map_err(anyhow::Error::new)?;
        if self.cameras.is_empty() {
            log::warn!("catalog resolved no cameras; cycles will only drain the raw directory");
        }
        if let Err(e) = self.upload_camera_map() {
            log::warn!("camera map upload skipped: {:#}", e);
        }
        self.state = PipelineState::Running;
        Ok(())
    }

    /// Bootstrap, cycle until shutdown is requested, then drain.
    pub fn run(&mut self) -> Result<DrainReport> {
        if self.state == PipelineState::Bootstrapping {
            self.bootstrap()?;
        }
        while !self.shutdown.load(Ordering::SeqCst) {
            let report = self.run_cycle();
            let pause = if report.fetch_skipped {
                self.config.pipeline.backpressure_sleep
            } else {
                self.config.pipeline.cycle_interval
            };
            self.sleep_unless_shutdown(pause);
        }
        log::info!("shutdown requested; draining uploads");
        Ok(self.drain())
    }

    /// One steady-state cycle: backpressure check, fetch, then process every
    /// complete file in the raw directory.
    pub fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport {
            staging_depth: self.staging_depth(),
            ..CycleReport::default()
        };

        if report.staging_depth >= self.config.pipeline.max_files_in_flight {
            report.fetch_skipped = true;
            log::warn!(
                "staging depth {} at or above ceiling {}; skipping fetch",
                report.staging_depth,
                self.config.pipeline.max_files_in_flight
            );
        } else if !self.cameras.is_empty() {
            let epoch = self.next_fetch_epoch();
            let fetch = self.fetch.fetch_all(&self.cameras, epoch);
            report.fetched = fetch.saved;
            report.rejected = fetch.rejected;
            report.transport_errors = fetch.transport_errors;
        }

        for path in self.scan_raw_dir() {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            match self.process_file(&path) {
                FileOutcome::Classified {
                    emitted,
                    annotated,
                    queued,
                } => {
                    report.classified += 1;
                    if emitted {
                        report.emitted += 1;
                    } else {
                        report.dropped += 1;
                    }
                    if annotated {
                        report.annotated += 1;
                    }
                    report.uploads_queued += queued;
                }
                FileOutcome::Discarded(e) => {
                    log::warn!("discarded {}: {}", path.display(), e);
                    report.discarded += 1;
                }
                FileOutcome::Skipped(e) => {
                    log::warn!("left {} for the next cycle: {}", path.display(), e);
                }
            }
        }

        log::info!(
            "cycle: fetched={} rejected={} transport_errors={} classified={} discarded={} emitted={} dropped={} annotated={} uploads_queued={}",
            report.fetched,
            report.rejected,
            report.transport_errors,
            report.classified,
            report.discarded,
            report.emitted,
            report.dropped,
            report.annotated,
            report.uploads_queued
        );
        report
    }

    /// Stop the uploader, giving in-flight uploads the configured grace period.
    pub fn drain(&mut self) -> DrainReport {
        self.state = PipelineState::Draining;
        let report = match self.uploader.take() {
            Some(uploader) => uploader.drain(self.config.archive.grace),
            None => DrainReport {
                stats: Default::default(),
                abandoned: 0,
            },
        };
        log::info!(
            "uploads: completed={} failed={} abandoned={}",
            report.stats.completed,
            report.stats.failed,
            report.abandoned
        );
        self.state = PipelineState::Stopped;
        report
    }

    /// A second later than the previous fetch, waiting for the clock if
    /// needed, so image names never repeat within a run.
    fn next_fetch_epoch(&mut self) -> u64 {
        let mut now = now_s();
        while now <= self.last_fetch_epoch {
            std::thread::sleep(EPOCH_POLL);
            now = now_s();
        }
        self.last_fetch_epoch = now;
        now
    }

    fn process_file(&mut self, path: &Path) -> FileOutcome {
        let file_name = path.file_name().and_then(|n| n.to_str()).map(str::to_owned);
        let (Some(file_name), Some(name)) = (file_name, ImageName::from_path(path)) else {
            let _ = fs::remove_file(path);
            return FileOutcome::Discarded(StageError::Unidentifiable(path.display().to_string()));
        };

        let size = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) => return FileOutcome::Skipped(StageError::Storage(e.to_string())),
        };
        if size <= self.config.fetch.min_image_bytes {
            let _ = fs::remove_file(path);
            return FileOutcome::Discarded(StageError::InvalidImage(format!(
                "{} bytes is not above the {} byte minimum",
                size, self.config.fetch.min_image_bytes
            )));
        }

        let claimed = self.category_dir(Category::Raw).join(&file_name);
        if claimed.exists() {
            return FileOutcome::Skipped(StageError::Storage(format!(
                "{} is still awaiting upload",
                claimed.display()
            )));
        }
        if let Err(e) = fs::rename(path, &claimed) {
            return FileOutcome::Skipped(StageError::Storage(format!("claim failed: {}", e)));
        }
        self.process_claimed(path, &claimed, &file_name, &name)
    }

    /// Classify, emit and enqueue a file already moved into `upload_dir/raw`.
    fn process_claimed(
        &mut self,
        raw_path: &Path,
        claimed: &Path,
        file_name: &str,
        name: &ImageName,
    ) -> FileOutcome {
        let started = Instant::now();
        let bytes = match fs::read(claimed) {
            Ok(bytes) => bytes,
            Err(e) => return self.release_claim(raw_path, claimed, e),
        };
        let classified = match self.engine.classify(&bytes) {
            Ok(classified) => classified,
            Err(e) => {
                let _ = fs::remove_file(claimed);
                return FileOutcome::Discarded(e);
            }
        };

        let tally = self.engine.tally(&classified.detections);
        let result = TrafficResult::from_tally(name, tally);
        let emitted = match self.aggregator.emit(&result) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("dropped result for {}: {}", name, e);
                false
            }
        };

        let mut queued = 0;
        let mut annotated = false;
        if self.sampler.sample() {
            let dir = self.category_dir(Category::Annotated);
            match annotate::write_annotated(&self.engine, &classified, file_name, &dir) {
                Ok(copy) => {
                    annotated = true;
                    if self.enqueue(&copy, Category::Annotated, Disposition::Delete) {
                        queued += 1;
                    }
                }
                Err(e) => log::warn!("annotated copy of {} failed: {:#}", name, e),
            }
        }

        let archived = self.config.dirs.archive_dir.join(file_name);
        if self.enqueue(claimed, Category::Raw, Disposition::RenameTo(archived)) {
            queued += 1;
        }

        log::debug!(
            "{}: cars={} trucks={} people={} in {:?}",
            name,
            tally.cars,
            tally.trucks,
            tally.people,
            started.elapsed()
        );
        FileOutcome::Classified {
            emitted,
            annotated,
            queued,
        }
    }

    /// An unreadable claimed file goes back to the raw directory for the
    /// next cycle. If even that fails it is deleted.
    fn release_claim(&self, raw_path: &Path, claimed: &Path, err: std::io::Error) -> FileOutcome {
        match fs::rename(claimed, raw_path) {
            Ok(()) => FileOutcome::Skipped(StageError::Storage(format!(
                "read failed ({}); returned to the raw directory",
                err
            ))),
            Err(back) => {
                let _ = fs::remove_file(claimed);
                FileOutcome::Discarded(StageError::InvalidImage(format!(
                    "read failed ({}) and could not be returned ({})",
                    err, back
                )))
            }
        }
    }

    fn enqueue(&self, path: &Path, category: Category, disposition: Disposition) -> bool {
        let Some(uploader) = &self.uploader else {
            return false;
        };
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let key = object_key_now(&self.config.archive.bucket, category, file_name);
        let queued = UploadTask::new(path, key, disposition).and_then(|task| uploader.submit(task));
        match queued {
            Ok(()) => true,
            Err(e) => {
                log::warn!("could not queue upload of {}: {:#}", path.display(), e);
                false
            }
        }
    }

    fn upload_camera_map(&self) -> Result<()> {
        let path = self
            .category_dir(Category::Map)
            .join(format!("cameras_{}.json", now_s()));
        let json = serde_json::to_vec_pretty(&self.cameras)?;
        fs::write(&path, json).with_context(|| format!("write {}", path.display()))?;
        if !self.enqueue(&path, Category::Map, Disposition::Delete) {
            return Err(anyhow!("uploader rejected {}", path.display()));
        }
        Ok(())
    }

    fn recover_upload_dir(&self) -> usize {
        let mut recovered = 0;
        for category in Category::ALL {
            for path in regular_files(&self.category_dir(category)) {
                let disposition = match category {
                    Category::Raw => match path.file_name() {
                        Some(name) => Disposition::RenameTo(self.config.dirs.archive_dir.join(name)),
                        None => continue,
                    },
                    Category::Annotated | Category::Map => Disposition::Delete,
                };
                if self.enqueue(&path, category, disposition) {
                    recovered += 1;
                }
            }
        }
        recovered
    }

    fn ensure_dirs(&self) -> Result<()> {
        let dirs = &self.config.dirs;
        for dir in [&dirs.raw_dir, &dirs.upload_dir, &dirs.archive_dir] {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        for category in Category::ALL {
            let dir = self.category_dir(category);
            fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        }
        Ok(())
    }

    fn category_dir(&self, category: Category) -> PathBuf {
        self.config.dirs.upload_dir.join(category.as_str())
    }

    /// Complete files in the raw directory, oldest name first.
    fn scan_raw_dir(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = regular_files(&self.config.dirs.raw_dir)
            .into_iter()
            .filter(|path| !is_partial(path))
            .collect();
        files.sort();
        files
    }

    /// Files waiting in the raw directory plus files awaiting upload.
    pub fn staging_depth(&self) -> usize {
        let raw = regular_files(&self.config.dirs.raw_dir)
            .into_iter()
            .filter(|path| !is_partial(path))
            .count();
        let uploading: usize = Category::ALL
            .iter()
            .map(|category| regular_files(&self.category_dir(*category)).len())
            .sum();
        raw + uploading
    }

    fn sleep_unless_shutdown(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while !self.shutdown.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

fn is_partial(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.ends_with(PARTIAL_SUFFIX))
        .unwrap_or(false)
}

fn regular_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|entry| entry.path())
        .collect()
}
