use anyhow::{anyhow, Context, Result};

use super::CatalogSource;
use crate::config::CatalogSettings;

/// Catalog endpoints reached over plain HTTP.
pub struct HttpCatalogSource {
    agent: ureq::Agent,
    list_url: String,
    detail_url: String,
}

impl HttpCatalogSource {
    pub fn new(settings: &CatalogSettings) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(settings.timeout)
            .build();
        Self {
            agent,
            list_url: settings.list_url.clone(),
            detail_url: settings.detail_url.clone(),
        }
    }

    fn get_text(&self, url: &str) -> Result<String> {
        let response = match self.agent.get(url).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                return Err(anyhow!("GET {} returned HTTP {}", url, code))
            }
            Err(e) => return Err(anyhow!("GET {} failed: {}", url, e)),
        };
        response
            .into_string()
            .with_context(|| format!("read body of {}", url))
    }
}

impl CatalogSource for HttpCatalogSource {
    fn location_list(&self) -> Result<String> {
        self.get_text(&self.list_url)
    }

    fn detail_page(&self, location_id: u64) -> Result<String> {
        self.get_text(&format!("{}{}", self.detail_url, location_id))
    }
}
