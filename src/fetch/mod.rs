//! Camera image acquisition.
//!
//! A bounded pool of worker threads pulls camera records off a shared queue,
//! downloads one image per camera and stages it in the raw directory under
//! its `{camera}_{location}_{epoch}.jpg` name. Payloads at or below the
//! minimum size are the source's "camera unavailable" placeholder and are
//! never written.
//!
//! Workers never propagate errors into the pool: every camera yields exactly
//! one `FetchOutcome`, so a dead camera cannot abort its siblings.

mod http;

use anyhow::{anyhow, Context, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::catalog::CameraRecord;
use crate::naming::ImageName;

pub use http::HttpImageSource;

/// Suffix of in-progress downloads; the raw-directory scanner skips these.
pub const PARTIAL_SUFFIX: &str = ".part";

/// Where camera images come from.
pub trait ImageSource: Send + Sync {
    /// Download the current image for a camera.
    fn fetch_image(&self, camera_id: u64) -> Result<Vec<u8>>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    Saved { path: PathBuf, size_bytes: u64 },
    Rejected { camera_id: u64, reason: String },
    TransportError { camera_id: u64, message: String },
}

/// Per-cycle fetch counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub saved: usize,
    pub rejected: usize,
    pub transport_errors: usize,
    pub outcomes: Vec<FetchOutcome>,
}

impl FetchReport {
    fn record(&mut self, outcome: FetchOutcome) {
        match &outcome {
            FetchOutcome::Saved { .. } => self.saved += 1,
            FetchOutcome::Rejected { .. } => self.rejected += 1,
            FetchOutcome::TransportError { .. } => self.transport_errors += 1,
        }
        self.outcomes.push(outcome);
    }
}

pub struct FetchWorkerPool {
    source: Arc<dyn ImageSource>,
    raw_dir: PathBuf,
    min_image_bytes: u64,
    width: usize,
}

impl FetchWorkerPool {
    pub fn new(
        source: Arc<dyn ImageSource>,
        raw_dir: impl Into<PathBuf>,
        min_image_bytes: u64,
        width: usize,
    ) -> Self {
        Self {
            source,
            raw_dir: raw_dir.into(),
            min_image_bytes,
            width: width.max(1),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Fetch one image for one camera, stamped with `epoch_s`.
    pub fn fetch(&self, camera: &CameraRecord, epoch_s: u64) -> FetchOutcome {
        let bytes = match self.source.fetch_image(camera.camera_id) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!(
                    "fetch camera {} (location {}): transport error: {:#}",
                    camera.camera_id,
                    camera.location_id,
                    e
                );
                return FetchOutcome::TransportError {
                    camera_id: camera.camera_id,
                    message: format!("{:#}", e),
                };
            }
        };

        let size_bytes = bytes.len() as u64;
        if size_bytes <= self.min_image_bytes {
            log::debug!(
                "fetch camera {}: rejected placeholder image ({} bytes)",
                camera.camera_id,
                size_bytes
            );
            return FetchOutcome::Rejected {
                camera_id: camera.camera_id,
                reason: format!(
                    "{} bytes is not above the {} byte minimum",
                    size_bytes, self.min_image_bytes
                ),
            };
        }

        let name = ImageName::new(camera.camera_id, camera.location_id, epoch_s);
        match stage_file(&self.raw_dir, &name.file_name(), &bytes) {
            Ok(path) => FetchOutcome::Saved { path, size_bytes },
            Err(e) => {
                log::warn!("fetch camera {}: staging failed: {:#}", camera.camera_id, e);
                FetchOutcome::Rejected {
                    camera_id: camera.camera_id,
                    reason: format!("staging failed: {:#}", e),
                }
            }
        }
    }

    /// Fetch every camera once, `width` cameras at a time.
    pub fn fetch_all(&self, cameras: &[CameraRecord], epoch_s: u64) -> FetchReport {
        let mut report = FetchReport::default();
        if cameras.is_empty() {
            return report;
        }

        let (job_tx, job_rx) = crossbeam_channel::unbounded::<&CameraRecord>();
        let (out_tx, out_rx) = crossbeam_channel::unbounded::<FetchOutcome>();
        for camera in cameras {
            // Receiver is alive until the scope below ends.
            let _ = job_tx.send(camera);
        }
        drop(job_tx);

        let workers = self.width.min(cameras.len());
        std::thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let out_tx = out_tx.clone();
                scope.spawn(move || {
                    for camera in job_rx.iter() {
                        if out_tx.send(self.fetch(camera, epoch_s)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(out_tx);
            for outcome in out_rx.iter() {
                report.record(outcome);
            }
        });

        report
    }
}

/// Write to `<name>.part` and rename, so the scanner never sees a torn file.
/// An image already staged under the same name is never replaced.
fn stage_file(dir: &Path, file_name: &str, bytes: &[u8]) -> Result<PathBuf> {
    let final_path = dir.join(file_name);
    if final_path.exists() {
        return Err(anyhow!("{} is already staged", file_name));
    }
    let tmp_path = dir.join(format!("{}{}", file_name, PARTIAL_SUFFIX));
    publish(&tmp_path, &final_path, bytes)?;
    Ok(final_path)
}

/// Write `bytes` to `tmp_path` and rename it to `final_path`. The temporary
/// file is removed on every failure.
fn publish(tmp_path: &Path, final_path: &Path, bytes: &[u8]) -> Result<()> {
    let written = File::create(tmp_path)
        .with_context(|| format!("create {}", tmp_path.display()))
        .and_then(|mut file| {
            file.write_all(bytes)
                .with_context(|| format!("write {}", tmp_path.display()))?;
            file.sync_all()
                .with_context(|| format!("sync {}", tmp_path.display()))
        })
        .and_then(|()| {
            fs::rename(tmp_path, final_path)
                .with_context(|| format!("rename {} into place", tmp_path.display()))
        });
    if written.is_err() {
        let _ = fs::remove_file(tmp_path);
    }
    written
}

/// Remove `.part` files left behind by an interrupted download.
pub fn sweep_partials(dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.ends_with(PARTIAL_SUFFIX))
                .unwrap_or(false)
        })
        .filter(|path| match fs::remove_file(path) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("could not remove stale {}: {}", path.display(), e);
                false
            }
        })
        .count()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted image source keyed by camera id.
    #[derive(Default)]
    pub(crate) struct ScriptedImageSource {
        pub responses: HashMap<u64, Result<Vec<u8>, String>>,
        pub calls: AtomicUsize,
    }

    impl ImageSource for ScriptedImageSource {
        fn fetch_image(&self, camera_id: u64) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.responses.get(&camera_id) {
                Some(Ok(bytes)) => Ok(bytes.clone()),
                Some(Err(e)) => Err(anyhow!(e.clone())),
                None => Err(anyhow!("connection refused")),
            }
        }
    }

    pub(crate) fn camera(camera_id: u64, location_id: u64) -> CameraRecord {
        CameraRecord {
            camera_id,
            location_id,
            latitude: 40.7,
            longitude: -73.9,
            name: format!("camera {}", camera_id),
        }
    }

    fn raw_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn saves_image_under_encoded_name() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let source = ScriptedImageSource {
            responses: HashMap::from([(126, Ok(vec![7u8; 200]))]),
            ..Default::default()
        };
        let pool = FetchWorkerPool::new(Arc::new(source), dir.path(), 100, 4);
        let outcome = pool.fetch(&camera(126, 123), 1_539_560_991);
        assert_eq!(
            outcome,
            FetchOutcome::Saved {
                path: dir.path().join("126_123_1539560991.jpg"),
                size_bytes: 200
            }
        );
        assert_eq!(raw_files(dir.path()), vec!["126_123_1539560991.jpg"]);
        Ok(())
    }

    #[test]
    fn undersized_response_is_never_staged() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let source = ScriptedImageSource {
            responses: HashMap::from([(1, Ok(vec![0u8; 100])), (2, Ok(vec![0u8; 5]))]),
            ..Default::default()
        };
        let pool = FetchWorkerPool::new(Arc::new(source), dir.path(), 100, 4);
        assert!(matches!(
            pool.fetch(&camera(1, 10), 1_700_000_000),
            FetchOutcome::Rejected { camera_id: 1, .. }
        ));
        assert!(matches!(
            pool.fetch(&camera(2, 20), 1_700_000_000),
            FetchOutcome::Rejected { camera_id: 2, .. }
        ));
        assert!(raw_files(dir.path()).is_empty());
        Ok(())
    }

    #[test]
    fn one_failing_camera_does_not_abort_siblings() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut responses = HashMap::new();
        for id in 1..=30u64 {
            responses.insert(id, Ok(vec![1u8; 500]));
        }
        responses.insert(7, Err("timed out".to_string()));
        responses.insert(8, Ok(vec![1u8; 10]));
        let source = Arc::new(ScriptedImageSource {
            responses,
            ..Default::default()
        });
        let pool = FetchWorkerPool::new(source.clone(), dir.path(), 100, 20);
        let cameras: Vec<CameraRecord> = (1..=30u64).map(|id| camera(id, id + 1000)).collect();

        let report = pool.fetch_all(&cameras, 1_700_000_000);

        assert_eq!(source.calls.load(Ordering::SeqCst), 30);
        assert_eq!(report.saved, 28);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.transport_errors, 1);
        assert_eq!(report.outcomes.len(), 30);
        assert_eq!(raw_files(dir.path()).len(), 28);
        assert!(raw_files(dir.path())
            .iter()
            .all(|name| !name.ends_with(PARTIAL_SUFFIX)));
        Ok(())
    }

    #[test]
    fn already_staged_name_is_not_overwritten() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let staged = dir.path().join("126_123_1539560991.jpg");
        fs::write(&staged, b"first image")?;
        let source = ScriptedImageSource {
            responses: HashMap::from([(126, Ok(vec![7u8; 200]))]),
            ..Default::default()
        };
        let pool = FetchWorkerPool::new(Arc::new(source), dir.path(), 100, 4);

        let outcome = pool.fetch(&camera(126, 123), 1_539_560_991);
        assert!(matches!(outcome, FetchOutcome::Rejected { camera_id: 126, .. }));
        assert_eq!(fs::read(&staged)?, b"first image");
        assert_eq!(raw_files(dir.path()), vec!["126_123_1539560991.jpg"]);
        Ok(())
    }

    #[test]
    fn failed_rename_removes_partial_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let final_path = dir.path().join("126_123_1539560991.jpg");
        // A non-empty directory at the final name makes the rename fail.
        fs::create_dir(&final_path)?;
        fs::write(final_path.join("occupant"), b"x")?;
        let tmp_path = dir.path().join("126_123_1539560991.jpg.part");

        assert!(publish(&tmp_path, &final_path, &[7u8; 200]).is_err());
        assert!(!tmp_path.exists());
        assert!(raw_files(dir.path())
            .iter()
            .all(|name| !name.ends_with(PARTIAL_SUFFIX)));
        Ok(())
    }

    #[test]
    fn sweep_removes_only_partial_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("126_123_1539560991.jpg.part"), b"torn")?;
        fs::write(dir.path().join("126_123_1539560992.jpg"), b"whole")?;

        assert_eq!(sweep_partials(dir.path()), 1);
        assert_eq!(raw_files(dir.path()), vec!["126_123_1539560992.jpg"]);
        Ok(())
    }
}
