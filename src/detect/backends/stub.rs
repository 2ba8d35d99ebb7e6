use anyhow::Result;
use std::collections::VecDeque;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;

/// Scripted backend for tests and dry runs.
///
/// Each `detect` call pops the next scripted frame; once the script is
/// exhausted the fallback detections are returned for every image.
#[derive(Clone, Debug, Default)]
pub struct StubBackend {
    script: VecDeque<Vec<Detection>>,
    fallback: Vec<Detection>,
    calls: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the same detections for every image.
    pub fn with_detections(detections: Vec<Detection>) -> Self {
        Self {
            fallback: detections,
            ..Self::default()
        }
    }

    /// Queue detections for the next image.
    pub fn push_frame(&mut self, detections: Vec<Detection>) {
        self.script.push_back(detections);
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _pixels: &[u8], _width: u32, _height: u32) -> Result<Vec<Detection>> {
        self.calls += 1;
        Ok(self
            .script
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}
