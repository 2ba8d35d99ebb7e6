use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::ArchiveSettings;

const CHUNK_BYTES: usize = 64 * 1024;

/// Durable object store the archive writes into.
///
/// `progress` receives byte counts as the store acknowledges them. A store
/// must not acknowledge the final bytes of an object until the object is
/// durable: reaching the total triggers local disposition of the source file.
pub trait ObjectStore: Send + Sync {
    fn name(&self) -> &'static str;

    fn put_object(&self, key: &str, source: &Path, progress: &dyn Fn(u64)) -> Result<()>;
}

/// Open the store named by `archive.store`: `file://<dir>` or `http(s)://<endpoint>`.
pub fn open_store(settings: &ArchiveSettings) -> Result<Box<dyn ObjectStore>> {
    if let Some(root) = settings.store.strip_prefix("file://") {
        return Ok(Box::new(FilesystemObjectStore::new(root)));
    }
    if settings.store.starts_with("http://") || settings.store.starts_with("https://") {
        return Ok(Box::new(HttpObjectStore::new(
            &settings.store,
            settings.access_key.clone(),
            settings.secret_key.clone(),
            Duration::from_secs(60),
        )));
    }
    Err(anyhow!(
        "unsupported archive store '{}'; expected file://<dir> or http(s)://<endpoint>",
        settings.store
    ))
}

/// Objects stored as plain files under `root/<key>`.
pub struct FilesystemObjectStore {
    root: PathBuf,
}

impl FilesystemObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn object_path(&self, key: &str) -> PathBuf {
        key.split('/')
            .filter(|part| !part.is_empty() && *part != "." && *part != "..")
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    /// Every object key under `prefix`, sorted.
    pub fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let base = self.object_path(prefix);
        let mut keys = Vec::new();
        if base.is_dir() {
            collect_keys(&self.root, &base, &mut keys)?;
        }
        keys.sort();
        Ok(keys)
    }

    /// Copy one object to `dest`, returning its size.
    pub fn get_object(&self, key: &str, dest: &Path) -> Result<u64> {
        let source = self.object_path(key);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::copy(&source, dest).with_context(|| format!("copy {} to {}", key, dest.display()))
    }
}

fn collect_keys(root: &Path, dir: &Path, keys: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("list {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            collect_keys(root, &path, keys)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            let key: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            keys.push(key.join("/"));
        }
    }
    Ok(())
}

impl ObjectStore for FilesystemObjectStore {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    fn put_object(&self, key: &str, source: &Path, progress: &dyn Fn(u64)) -> Result<()> {
        let dest = self.object_path(key);
        let total = fs::metadata(source)
            .with_context(|| format!("stat {}", source.display()))?
            .len();

        if dest.exists() && sha256_file(&dest)? == sha256_file(source)? {
            log::debug!("object {} already stored; skipping copy", key);
            progress(total);
            return Ok(());
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }

        let mut input =
            File::open(source).with_context(|| format!("open {}", source.display()))?;
        let mut output = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&dest)
            .with_context(|| format!("open {}", dest.display()))?;

        let mut buf = vec![0u8; CHUNK_BYTES];
        let mut written = 0u64;
        loop {
            let n = input.read(&mut buf)?;
            if n == 0 {
                break;
            }
            output
                .write_all(&buf[..n])
                .with_context(|| format!("write {}", dest.display()))?;
            written += n as u64;
            if written >= total {
                // Final chunk is acknowledged only once the object is on disk.
                output.sync_all()?;
            }
            progress(n as u64);
        }
        if written == 0 {
            output.sync_all()?;
            progress(0);
        }
        Ok(())
    }
}

/// PUTs objects to `{endpoint}/{key}`.
pub struct HttpObjectStore {
    agent: ureq::Agent,
    endpoint: String,
    access_key: Option<String>,
    secret_key: Option<String>,
}

impl HttpObjectStore {
    pub fn new(
        endpoint: &str,
        access_key: Option<String>,
        secret_key: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            access_key,
            secret_key,
        }
    }

    pub fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.endpoint, key.trim_start_matches('/'))
    }
}

impl ObjectStore for HttpObjectStore {
    fn name(&self) -> &'static str {
        "http"
    }

    fn put_object(&self, key: &str, source: &Path, progress: &dyn Fn(u64)) -> Result<()> {
        let url = self.object_url(key);
        let file = File::open(source).with_context(|| format!("open {}", source.display()))?;
        let total = file.metadata()?.len();

        let mut request = self
            .agent
            .put(&url)
            .set("Content-Type", content_type(key))
            .set("Content-Length", &total.to_string());
        if let Some(access_key) = &self.access_key {
            request = request.set("X-Access-Key", access_key);
        }
        if let Some(secret_key) = &self.secret_key {
            request = request.set("Authorization", &format!("Bearer {}", secret_key));
        }

        let reader = ProgressReader::new(file, total, progress);
        let held = reader.held_back();
        match request.send(reader) {
            Ok(_) => {
                progress(held.get());
                Ok(())
            }
            Err(ureq::Error::Status(code, _)) => Err(anyhow!("PUT {} returned HTTP {}", url, code)),
            Err(e) => Err(anyhow!("PUT {} failed: {}", url, e)),
        }
    }
}

/// Reports bytes handed to the transport, holding back the tail of the body
/// until the server has answered.
struct ProgressReader<'a, R> {
    inner: R,
    remaining: u64,
    progress: &'a dyn Fn(u64),
    held: std::rc::Rc<std::cell::Cell<u64>>,
}

impl<'a, R: Read> ProgressReader<'a, R> {
    fn new(inner: R, total: u64, progress: &'a dyn Fn(u64)) -> Self {
        Self {
            inner,
            remaining: total,
            progress,
            held: std::rc::Rc::new(std::cell::Cell::new(0)),
        }
    }

    fn held_back(&self) -> std::rc::Rc<std::cell::Cell<u64>> {
        self.held.clone()
    }
}

impl<R: Read> Read for ProgressReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        let n64 = n as u64;
        self.remaining = self.remaining.saturating_sub(n64);
        if self.remaining == 0 {
            self.held.set(self.held.get() + n64);
        } else {
            (self.progress)(n64);
        }
        Ok(n)
    }
}

fn content_type(key: &str) -> &'static str {
    if key.ends_with(".json") {
        "application/json"
    } else if key.ends_with(".jpg") || key.ends_with(".jpeg") {
        "image/jpeg"
    } else {
        "application/octet-stream"
    }
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_BYTES];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
