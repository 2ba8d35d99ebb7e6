use anyhow::{anyhow, Context, Result};
use std::io::Read;

use super::ImageSource;
use crate::config::{CatalogSettings, FetchSettings};

const MAX_IMAGE_BYTES: u64 = 5 * 1024 * 1024;

/// Snapshot endpoint: `{base_url}{cameraId}{query_suffix}`.
pub struct HttpImageSource {
    agent: ureq::Agent,
    base_url: String,
    query_suffix: String,
}

impl HttpImageSource {
    pub fn new(catalog: &CatalogSettings, fetch: &FetchSettings) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(fetch.timeout).build();
        Self {
            agent,
            base_url: catalog.image_base_url.clone(),
            query_suffix: catalog.image_query_suffix.clone(),
        }
    }

    pub fn image_url(&self, camera_id: u64) -> String {
        format!("{}{}{}", self.base_url, camera_id, self.query_suffix)
    }
}

impl ImageSource for HttpImageSource {
    fn fetch_image(&self, camera_id: u64) -> Result<Vec<u8>> {
        let url = self.image_url(camera_id);
        let response = match self.agent.get(&url).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                return Err(anyhow!("GET {} returned HTTP {}", url, code))
            }
            Err(e) => return Err(anyhow!("GET {} failed: {}", url, e)),
        };
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_IMAGE_BYTES + 1)
            .read_to_end(&mut bytes)
            .with_context(|| format!("read image body from {}", url))?;
        if bytes.len() as u64 > MAX_IMAGE_BYTES {
            return Err(anyhow!("image from {} exceeds {} bytes", url, MAX_IMAGE_BYTES));
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;

    #[test]
    fn builds_deterministic_snapshot_url() {
        let cfg = PipelineConfig::default();
        let source = HttpImageSource::new(&cfg.catalog, &cfg.fetch);
        assert_eq!(
            source.image_url(261),
            "http://207.251.86.238/cctv261.jpg?math=0.011125243364920934"
        );
    }
}
