//! Archival upload of raw images, annotated copies and camera maps.
//!
//! Uploads are fire-and-forget from the pipeline's point of view. A worker
//! pool drains the task queue; each task streams one file into the object
//! store under a time-partitioned key and, once the store has acknowledged
//! every byte, disposes of the local file (rename into the archive directory
//! or delete). Failed uploads leave the file where it is; the orchestrator
//! re-enqueues leftovers from the upload directory on the next start.

mod progress;
mod store;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};
use crossbeam_channel::{Receiver, Sender};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::StageError;

pub use progress::UploadProgress;
pub use store::{open_store, FilesystemObjectStore, HttpObjectStore, ObjectStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    Raw,
    Annotated,
    Map,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Raw, Category::Annotated, Category::Map];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Raw => "raw",
            Category::Annotated => "annotated",
            Category::Map => "map",
        }
    }
}

/// `{bucket}/{category}/{year}/{month}/{day}/{hour}/{file_name}`, local time,
/// components unpadded.
pub fn object_key<Tz: TimeZone>(
    bucket: &str,
    category: Category,
    at: &DateTime<Tz>,
    file_name: &str,
) -> String {
    format!(
        "{}/{}/{}/{}/{}/{}/{}",
        bucket,
        category.as_str(),
        at.year(),
        at.month(),
        at.day(),
        at.hour(),
        file_name
    )
}

pub fn object_key_now(bucket: &str, category: Category, file_name: &str) -> String {
    object_key(bucket, category, &Local::now(), file_name)
}

/// What happens to the local file once the store holds every byte.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    RenameTo(PathBuf),
    Delete,
}

#[derive(Debug)]
pub struct UploadTask {
    pub file_path: PathBuf,
    pub object_key: String,
    pub disposition: Disposition,
    progress: UploadProgress,
}

impl UploadTask {
    pub fn new(
        file_path: impl Into<PathBuf>,
        object_key: impl Into<String>,
        disposition: Disposition,
    ) -> Result<Self> {
        let file_path = file_path.into();
        let total = fs::metadata(&file_path)
            .with_context(|| format!("stat {}", file_path.display()))?
            .len();
        Ok(Self {
            file_path,
            object_key: object_key.into(),
            disposition,
            progress: UploadProgress::new(total),
        })
    }

    pub fn total_bytes(&self) -> u64 {
        self.progress.total()
    }

    pub fn progress(&self) -> &UploadProgress {
        &self.progress
    }

    /// Feed acknowledged bytes. Returns `true` if this call ran the disposition.
    pub fn on_progress(&self, bytes: u64) -> bool {
        if self.progress.record(bytes) {
            self.dispose();
            return true;
        }
        false
    }

    fn dispose(&self) {
        let result = match &self.disposition {
            Disposition::RenameTo(dest) => move_file(&self.file_path, dest),
            Disposition::Delete => fs::remove_file(&self.file_path)
                .with_context(|| format!("delete {}", self.file_path.display())),
        };
        match result {
            Ok(()) => log::debug!("disposed {} after upload", self.file_path.display()),
            Err(e) => log::warn!("upload of {} finished but disposition failed: {:#}", self.object_key, e),
        }
    }
}

/// Move `from` to `to`, never replacing a file already at `to`.
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    if to.exists() {
        return Err(anyhow!("{} already exists", to.display()));
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    // Archive may live on another filesystem.
    fs::copy(from, to).with_context(|| format!("copy {} to {}", from.display(), to.display()))?;
    fs::remove_file(from).with_context(|| format!("remove {}", from.display()))?;
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    Completed,
    Failed(String),
}

/// Run one upload to completion on the calling thread.
pub fn run_upload(store: &dyn ObjectStore, task: &UploadTask) -> UploadOutcome {
    let started = Instant::now();
    match store.put_object(&task.object_key, &task.file_path, &|n| {
        task.on_progress(n);
    }) {
        Ok(()) => {
            if task.progress.complete() {
                task.dispose();
            }
            log::info!(
                "uploaded {} ({} bytes) to {} in {:?}",
                task.file_path.display(),
                task.total_bytes(),
                task.object_key,
                started.elapsed()
            );
            UploadOutcome::Completed
        }
        Err(e) => {
            let err = StageError::Transport(format!("upload {}: {:#}", task.object_key, e));
            if task.progress.is_complete() {
                log::warn!("{} after the object was fully acknowledged", err);
            } else {
                log::warn!("{}; leaving {} in place", err, task.file_path.display());
            }
            UploadOutcome::Failed(err.to_string())
        }
    }
}

#[derive(Debug, Default)]
struct UploadCounters {
    queued: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub queued: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrainReport {
    pub stats: UploadStats,
    /// Tasks still queued or running when the grace period ran out.
    pub abandoned: usize,
}

/// Worker pool that drains upload tasks in the background.
pub struct ArchivalUploader {
    tx: Option<Sender<UploadTask>>,
    workers: Vec<JoinHandle<()>>,
    counters: Arc<UploadCounters>,
    cancel: Arc<AtomicBool>,
}

impl ArchivalUploader {
    pub fn start(store: Arc<dyn ObjectStore>, workers: usize) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<UploadTask>();
        let counters = Arc::new(UploadCounters::default());
        let cancel = Arc::new(AtomicBool::new(false));
        let workers = (0..workers.max(1))
            .map(|idx| {
                let rx = rx.clone();
                let store = store.clone();
                let counters = counters.clone();
                let cancel = cancel.clone();
                std::thread::Builder::new()
                    .name(format!("upload-{}", idx))
                    .spawn(move || upload_worker(rx, store, counters, cancel))
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    log::error!("failed to spawn upload worker: {}", e);
                    None
                }
            })
            .collect();
        Self {
            tx: Some(tx),
            workers,
            counters,
            cancel,
        }
    }

    /// Queue a task and return immediately.
    pub fn submit(&self, task: UploadTask) -> Result<()> {
        if self.workers.is_empty() {
            return Err(anyhow!("no upload workers running"));
        }
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| anyhow!("uploader is draining"))?;
        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        tx.send(task).map_err(|e| {
            self.counters.queued.fetch_sub(1, Ordering::SeqCst);
            anyhow!("upload queue closed; dropping {}", e.0.object_key)
        })
    }

    pub fn stats(&self) -> UploadStats {
        UploadStats {
            queued: self.counters.queued.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
        }
    }

    pub fn pending(&self) -> usize {
        let stats = self.stats();
        stats.queued.saturating_sub(stats.completed + stats.failed)
    }

    /// Stop accepting work and wait up to `grace` for queued uploads.
    ///
    /// Work still outstanding afterwards is abandoned; its files stay in the
    /// upload directory for the next start.
    pub fn drain(mut self, grace: Duration) -> DrainReport {
        drop(self.tx.take());
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline && self.workers.iter().any(|w| !w.is_finished()) {
            std::thread::sleep(Duration::from_millis(20));
        }
        let abandoned = self.pending();
        if abandoned > 0 {
            self.cancel.store(true, Ordering::SeqCst);
            log::warn!(
                "upload grace period of {:?} expired with {} uploads outstanding",
                grace,
                abandoned
            );
        }
        for worker in self.workers.drain(..) {
            if worker.is_finished() {
                let _ = worker.join();
            }
        }
        DrainReport {
            stats: self.stats(),
            abandoned,
        }
    }
}

fn upload_worker(
    rx: Receiver<UploadTask>,
    store: Arc<dyn ObjectStore>,
    counters: Arc<UploadCounters>,
    cancel: Arc<AtomicBool>,
) {
    for task in rx.iter() {
        if cancel.load(Ordering::SeqCst) {
            break;
        }
        match run_upload(store.as_ref(), &task) {
            UploadOutcome::Completed => counters.completed.fetch_add(1, Ordering::SeqCst),
            UploadOutcome::Failed(_) => counters.failed.fetch_add(1, Ordering::SeqCst),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::Mutex;
    use std::thread::JoinHandle;

    /// Store that fails every key in `failing` and records the rest.
    #[derive(Default)]
    struct RecordingStore {
        failing: Vec<String>,
        stored: Mutex<Vec<String>>,
    }

    impl ObjectStore for RecordingStore {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn put_object(&self, key: &str, source: &Path, progress: &dyn Fn(u64)) -> Result<()> {
            if self.failing.iter().any(|k| k == key) {
                return Err(anyhow!("503 slow down"));
            }
            let len = fs::metadata(source)?.len();
            progress(len / 2);
            progress(len - len / 2);
            self.stored.lock().unwrap().push(key.to_string());
            Ok(())
        }
    }

    /// Accept one PUT, read its whole body, then answer with `status`.
    /// The handle yields the number of body bytes received.
    fn answer_one_put(status: u16) -> Result<(String, JoinHandle<usize>)> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let endpoint = format!("http://{}", listener.local_addr()?);
        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap() == 0 || line.trim_end().is_empty() {
                    break;
                }
                if let Some((name, value)) = line.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        content_length = value.trim().parse().unwrap();
                    }
                }
            }
            let mut body = vec![0u8; content_length];
            reader.read_exact(&mut body).unwrap();
            let reason = if status < 300 { "OK" } else { "Internal Server Error" };
            let mut stream = stream;
            write!(
                stream,
                "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                status, reason
            )
            .unwrap();
            body.len()
        });
        Ok((endpoint, handle))
    }

    #[test]
    fn http_upload_disposes_only_after_success_response() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("126_123_1539560991.jpg");
        fs::write(&src, vec![5u8; 20_000])?;
        let task = UploadTask::new(&src, "ourcamera/raw/126_123_1539560991.jpg", Disposition::Delete)?;

        let (endpoint, server) = answer_one_put(200)?;
        let store = HttpObjectStore::new(&endpoint, None, None, Duration::from_secs(10));
        assert_eq!(run_upload(&store, &task), UploadOutcome::Completed);

        assert_eq!(server.join().unwrap(), 20_000);
        assert!(task.progress().is_complete());
        assert_eq!(task.progress().acked(), 20_000);
        assert!(!src.exists());
        Ok(())
    }

    #[test]
    fn http_error_after_full_body_keeps_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("126_123_1539560991.jpg");
        fs::write(&src, vec![5u8; 20_000])?;
        let dest = dir.path().join("archive/126_123_1539560991.jpg");
        let task = UploadTask::new(
            &src,
            "ourcamera/raw/126_123_1539560991.jpg",
            Disposition::RenameTo(dest.clone()),
        )?;

        let (endpoint, server) = answer_one_put(500)?;
        let store = HttpObjectStore::new(&endpoint, None, None, Duration::from_secs(10));
        let outcome = run_upload(&store, &task);

        assert!(matches!(outcome, UploadOutcome::Failed(ref msg) if msg.contains("HTTP 500")));
        // Every byte reached the server, yet the tail was never acknowledged.
        assert_eq!(server.join().unwrap(), 20_000);
        assert!(!task.progress().is_complete());
        assert!(task.progress().acked() < 20_000);
        assert!(src.exists());
        assert!(!dest.exists());
        Ok(())
    }

    #[test]
    fn archive_rename_never_replaces_an_archived_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("126_123_1539560991.jpg");
        fs::write(&src, b"second frame")?;
        let dest = dir.path().join("archive/126_123_1539560991.jpg");
        fs::create_dir_all(dest.parent().unwrap())?;
        fs::write(&dest, b"first frame")?;
        let task = UploadTask::new(&src, "b/raw/x.jpg", Disposition::RenameTo(dest.clone()))?;

        assert_eq!(run_upload(&RecordingStore::default(), &task), UploadOutcome::Completed);
        assert_eq!(fs::read(&dest)?, b"first frame");
        assert_eq!(fs::read(&src)?, b"second frame");
        Ok(())
    }

    #[test]
    fn object_key_is_time_partitioned() {
        let at = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2018, 10, 14, 23, 49, 51)
            .unwrap();
        assert_eq!(
            object_key("ourcamera", Category::Raw, &at, "126_123_1539560991.jpg"),
            "ourcamera/raw/2018/10/14/23/126_123_1539560991.jpg"
        );
        let at = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2019, 3, 2, 4, 0, 0)
            .unwrap();
        assert_eq!(
            object_key("ourcamera", Category::Map, &at, "cameras_1.json"),
            "ourcamera/map/2019/3/2/4/cameras_1.json"
        );
    }

    #[test]
    fn successful_upload_renames_into_archive() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("126_123_1539560991.jpg");
        fs::write(&src, vec![3u8; 4096])?;
        let dest = dir.path().join("archive/126_123_1539560991.jpg");
        let task = UploadTask::new(&src, "b/raw/x.jpg", Disposition::RenameTo(dest.clone()))?;

        let store = RecordingStore::default();
        assert_eq!(run_upload(&store, &task), UploadOutcome::Completed);
        assert!(!src.exists());
        assert_eq!(fs::read(&dest)?.len(), 4096);
        Ok(())
    }

    #[test]
    fn failed_upload_leaves_file_in_place() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("a.jpg");
        fs::write(&src, b"payload")?;
        let task = UploadTask::new(&src, "b/raw/a.jpg", Disposition::Delete)?;
        let store = RecordingStore {
            failing: vec!["b/raw/a.jpg".into()],
            ..Default::default()
        };
        let outcome = run_upload(&store, &task);
        assert!(matches!(outcome, UploadOutcome::Failed(ref msg) if msg.starts_with("TRANSPORT_ERROR")));
        assert!(src.exists());
        Ok(())
    }

    #[test]
    fn concurrent_partial_callbacks_dispose_exactly_once() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("a.jpg");
        fs::write(&src, vec![0u8; 1000])?;
        let task = Arc::new(UploadTask::new(&src, "b/annotated/a.jpg", Disposition::Delete)?);

        let handles: Vec<_> = [500u64, 500, 500, 250, 250]
            .into_iter()
            .map(|n| {
                let task = task.clone();
                std::thread::spawn(move || task.on_progress(n))
            })
            .collect();
        let fired = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|fired| *fired)
            .count();
        assert_eq!(fired, 1);
        assert!(!src.exists());
        Ok(())
    }

    #[test]
    fn idempotent_reupload_through_pool() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store: Arc<dyn ObjectStore> =
            Arc::new(FilesystemObjectStore::new(dir.path().join("store")));
        let uploader = ArchivalUploader::start(store, 1);

        for round in 0..2 {
            let src = dir.path().join(format!("copy{}.jpg", round));
            fs::write(&src, b"identical frame")?;
            uploader.submit(UploadTask::new(&src, "bucket/raw/2018/10/14/23/f.jpg", Disposition::Delete)?)?;
        }

        let report = uploader.drain(Duration::from_secs(10));
        assert_eq!(report.abandoned, 0);
        assert_eq!(report.stats.completed, 2);
        assert_eq!(report.stats.failed, 0);
        assert!(!dir.path().join("copy0.jpg").exists());
        assert!(!dir.path().join("copy1.jpg").exists());
        assert_eq!(
            fs::read(dir.path().join("store/bucket/raw/2018/10/14/23/f.jpg"))?,
            b"identical frame"
        );
        Ok(())
    }

    #[test]
    fn pool_counts_failures_and_keeps_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("bad.jpg");
        fs::write(&src, b"x")?;
        let store: Arc<dyn ObjectStore> = Arc::new(RecordingStore {
            failing: vec!["k".into()],
            ..Default::default()
        });
        let uploader = ArchivalUploader::start(store, 1);
        uploader.submit(UploadTask::new(&src, "k", Disposition::Delete)?)?;
        let report = uploader.drain(Duration::from_secs(10));
        assert_eq!(report.stats.failed, 1);
        assert!(src.exists());
        Ok(())
    }
}
