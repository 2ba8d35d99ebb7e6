//! Traffic count records and the sinks they are written to.
//!
//! One `TrafficResult` is produced per classified image and written once,
//! keyed by `(timestamp, cameraLocationId)`. A sink outage drops the record:
//! by the time the sink is consulted the image has already left the raw
//! directory, so there is nothing to re-process later.

mod sqlite;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::detect::ClassTally;
use crate::error::StageError;
use crate::naming::ImageName;

pub use sqlite::SqliteTelemetrySink;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrafficResult {
    pub timestamp: u64,
    pub camera_location_id: u64,
    pub number_cars: u32,
    pub number_trucks: u32,
    pub number_people: u32,
}

impl TrafficResult {
    pub fn from_tally(name: &ImageName, tally: ClassTally) -> Self {
        Self {
            timestamp: name.timestamp,
            camera_location_id: name.location_id,
            number_cars: tally.cars,
            number_trucks: tally.trucks,
            number_people: tally.people,
        }
    }

    pub fn key(&self) -> (u64, u64) {
        (self.timestamp, self.camera_location_id)
    }

    /// Wire shape shared with the telemetry store.
    pub fn to_record(&self) -> SinkRecord {
        SinkRecord {
            timestamp: self.timestamp.to_string(),
            camera_location_id: self.camera_location_id.to_string(),
            cars: self.number_cars,
            trucks: self.number_trucks,
            people: self.number_people,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkRecord {
    pub timestamp: String,
    pub camera_location_id: String,
    pub cars: u32,
    pub trucks: u32,
    pub people: u32,
}

pub trait TelemetrySink: Send {
    fn name(&self) -> &'static str;

    /// Store one record. Writing the same key twice replaces the first write.
    fn put(&mut self, result: &TrafficResult) -> Result<()>;
}

/// Hands classified tallies to the sink, one record per image.
pub struct ResultAggregator {
    sink: Box<dyn TelemetrySink>,
}

impl ResultAggregator {
    pub fn new(sink: Box<dyn TelemetrySink>) -> Self {
        Self { sink }
    }

    pub fn emit(&mut self, result: &TrafficResult) -> Result<(), StageError> {
        self.sink.put(result).map_err(|e| {
            StageError::SinkUnavailable(format!(
                "{} sink rejected record ({}, {}): {:#}",
                self.sink.name(),
                result.timestamp,
                result.camera_location_id,
                e
            ))
        })
    }
}

/// Open a sink from `sqlite:<path>`, `memory`, or an `http(s)://` endpoint.
pub fn open_sink(spec: &str) -> Result<Box<dyn TelemetrySink>> {
    if let Some(path) = spec.strip_prefix("sqlite:") {
        return Ok(Box::new(SqliteTelemetrySink::open(path)?));
    }
    if spec == "memory" {
        return Ok(Box::new(InMemoryTelemetrySink::default()));
    }
    if spec.starts_with("http://") || spec.starts_with("https://") {
        return Ok(Box::new(HttpTelemetrySink::new(spec, Duration::from_secs(10))));
    }
    Err(anyhow!(
        "unsupported telemetry sink '{}'; expected sqlite:<path>, memory or http(s)://",
        spec
    ))
}

/// Posts each record as JSON to a key-value store front end.
pub struct HttpTelemetrySink {
    agent: ureq::Agent,
    endpoint: String,
}

impl HttpTelemetrySink {
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            endpoint: endpoint.to_string(),
        }
    }
}

impl TelemetrySink for HttpTelemetrySink {
    fn name(&self) -> &'static str {
        "http"
    }

    fn put(&mut self, result: &TrafficResult) -> Result<()> {
        let body = serde_json::to_string(&result.to_record())?;
        self.agent
            .post(&self.endpoint)
            .set("Content-Type", "application/json")
            .send_string(&body)
            .with_context(|| format!("POST {}", self.endpoint))?;
        Ok(())
    }
}

/// Process-local sink. Clones share the same storage.
#[derive(Clone, Debug, Default)]
pub struct InMemoryTelemetrySink {
    records: Arc<Mutex<Vec<TrafficResult>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryTelemetrySink {
    pub fn records(&self) -> Vec<TrafficResult> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    /// Simulate an outage: every `put` fails while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

impl TelemetrySink for InMemoryTelemetrySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn put(&mut self, result: &TrafficResult) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow!("sink unavailable"));
        }
        let mut records = self
            .records
            .lock()
            .map_err(|_| anyhow!("in-memory sink lock poisoned"))?;
        records.retain(|existing| existing.key() != result.key());
        records.push(*result);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result() -> TrafficResult {
        TrafficResult::from_tally(
            &ImageName::new(126, 123, 1_539_560_991),
            ClassTally {
                cars: 1,
                trucks: 0,
                people: 1,
            },
        )
    }

    #[test]
    fn record_uses_string_keys_and_camel_case() {
        let json = serde_json::to_value(result().to_record()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "timestamp": "1539560991",
                "cameraLocationId": "123",
                "cars": 1,
                "trucks": 0,
                "people": 1
            })
        );
    }

    #[test]
    fn sink_outage_surfaces_as_sink_unavailable() {
        let sink = InMemoryTelemetrySink::default();
        let mut aggregator = ResultAggregator::new(Box::new(sink.clone()));
        sink.set_unavailable(true);
        let err = aggregator.emit(&result()).unwrap_err();
        assert_eq!(err.code(), "SINK_UNAVAILABLE");
        assert!(sink.records().is_empty());

        sink.set_unavailable(false);
        aggregator.emit(&result()).unwrap();
        aggregator.emit(&result()).unwrap();
        assert_eq!(sink.records(), vec![result()]);
    }

    #[test]
    fn rejects_unknown_sink_spec() {
        assert!(open_sink("dynamo://table").is_err());
        assert_eq!(open_sink("memory").unwrap().name(), "memory");
    }
}
