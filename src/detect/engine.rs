use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use image::{GenericImageView, RgbImage};

use crate::config::DetectSettings;
use crate::detect::backend::DetectorBackend;
use crate::detect::backends::StubBackend;
use crate::detect::labels::{CountBucket, LabelMap};
use crate::detect::result::{ClassTally, Detection};
use crate::error::StageError;

/// Backend name of the scripted detector, which counts nothing in production.
pub const STUB_BACKEND: &str = "stub";

/// Decoded image together with everything the backend reported for it.
pub struct ClassifiedImage {
    pub image: RgbImage,
    pub detections: Vec<Detection>,
}

/// Single model handle plus the threshold and counting policy.
///
/// The engine is owned by the orchestrator loop; `&mut self` on `classify`
/// keeps every inference call on one thread against one loaded model.
pub struct ClassificationEngine {
    backend: Box<dyn DetectorBackend>,
    labels: LabelMap,
    buckets: BTreeMap<String, CountBucket>,
    threshold: f32,
}

impl ClassificationEngine {
    pub fn new(
        backend: Box<dyn DetectorBackend>,
        labels: LabelMap,
        buckets: BTreeMap<String, CountBucket>,
        threshold: f32,
    ) -> Self {
        Self {
            backend,
            labels,
            buckets,
            threshold,
        }
    }

    /// Build the configured backend, load labels and warm the model up.
    pub fn from_settings(settings: &DetectSettings) -> Result<Self> {
        let labels = match &settings.label_map_path {
            Some(path) => LabelMap::load(path)?,
            None => LabelMap::default(),
        };
        let mut backend = build_backend(settings)?;
        backend.warm_up()?;
        log::info!(
            "detector backend '{}' ready ({} labels, threshold {:.2})",
            backend.name(),
            labels.len(),
            settings.threshold
        );
        Ok(Self::new(
            backend,
            labels,
            settings.buckets.clone(),
            settings.threshold,
        ))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Decode and run the detector on one image.
    pub fn classify(&mut self, image_bytes: &[u8]) -> Result<ClassifiedImage, StageError> {
        let decoded = image::load_from_memory(image_bytes)
            .map_err(|e| StageError::Decode(e.to_string()))?;
        let (width, height) = decoded.dimensions();
        if width == 0 || height == 0 {
            return Err(StageError::Decode("image has zero dimension".into()));
        }
        let image = decoded.into_rgb8();
        let detections = self
            .backend
            .detect(image.as_raw(), width, height)
            .map_err(|e| StageError::Decode(format!("detector failed: {:#}", e)))?;
        Ok(ClassifiedImage { image, detections })
    }

    /// Detections strictly above the threshold.
    pub fn kept<'a>(&self, detections: &'a [Detection]) -> Vec<&'a Detection> {
        detections
            .iter()
            .filter(|d| d.score > self.threshold)
            .collect()
    }

    pub fn bucket_for(&self, class_id: u32) -> Option<CountBucket> {
        self.buckets.get(self.labels.name(class_id)).copied()
    }

    /// Count kept detections per bucket; classes without a bucket are ignored.
    pub fn tally(&self, detections: &[Detection]) -> ClassTally {
        let mut tally = ClassTally::default();
        for detection in self.kept(detections) {
            match self.bucket_for(detection.class_id) {
                Some(CountBucket::Cars) => tally.cars += 1,
                Some(CountBucket::Trucks) => tally.trucks += 1,
                Some(CountBucket::People) => tally.people += 1,
                None => {}
            }
        }
        tally
    }
}

pub fn build_backend(settings: &DetectSettings) -> Result<Box<dyn DetectorBackend>> {
    match settings.backend.as_str() {
        STUB_BACKEND => Ok(Box::new(StubBackend::new())),
        #[cfg(feature = "backend-tract")]
        "tract" => {
            let model_path = settings
                .model_path
                .as_ref()
                .ok_or_else(|| anyhow!("tract backend requires detect.model_path"))?;
            Ok(Box::new(crate::detect::backends::TractBackend::new(
                model_path,
                settings.input_width,
                settings.input_height,
            )?))
        }
        #[cfg(not(feature = "backend-tract"))]
        "tract" => Err(anyhow!(
            "tract backend requires the backend-tract feature"
        )),
        other => Err(anyhow!("unknown detector backend '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::BoundingBox;
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;

    fn det(class_id: u32, score: f32) -> Detection {
        Detection {
            bbox: BoundingBox::new(0.1, 0.1, 0.4, 0.4),
            class_id,
            score,
        }
    }

    fn jpeg_bytes() -> Vec<u8> {
        let img = RgbImage::from_pixel(16, 16, Rgb([90, 120, 30]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Jpeg).unwrap();
        out.into_inner()
    }

    fn engine(detections: Vec<Detection>) -> ClassificationEngine {
        ClassificationEngine::new(
            Box::new(StubBackend::with_detections(detections)),
            LabelMap::default(),
            CountBucket::default_mapping(),
            0.4,
        )
    }

    #[test]
    fn counts_only_detections_above_threshold() {
        // car=1, pedestrian=2, truck=3 in the built-in label map.
        let detections = vec![det(1, 0.91), det(3, 0.2), det(2, 0.55), det(1, 0.4)];
        let mut engine = engine(detections);
        let classified = engine.classify(&jpeg_bytes()).unwrap();
        let tally = engine.tally(&classified.detections);
        assert_eq!(
            tally,
            ClassTally {
                cars: 1,
                trucks: 0,
                people: 1
            }
        );
    }

    #[test]
    fn unmapped_classes_are_ignored() {
        // bicycle (6) and an unknown id never count.
        let engine = engine(vec![]);
        let tally = engine.tally(&[det(6, 0.99), det(42, 0.99), det(4, 0.8), det(5, 0.8)]);
        assert_eq!(tally.cars, 0);
        assert_eq!(tally.people, 0);
        assert_eq!(tally.trucks, 2);
    }

    #[test]
    fn no_detections_is_an_all_zero_tally() {
        let mut engine = engine(vec![]);
        let classified = engine.classify(&jpeg_bytes()).unwrap();
        assert_eq!(engine.tally(&classified.detections), ClassTally::default());
    }

    #[test]
    fn truncated_image_is_a_decode_error() {
        let mut engine = engine(vec![det(1, 0.9)]);
        let bytes = jpeg_bytes();
        let err = engine.classify(&bytes[..10]).err().unwrap();
        assert_eq!(err.code(), "DECODE_ERROR");
        let err = engine.classify(b"<html>camera offline</html>").err().unwrap();
        assert_eq!(err.code(), "DECODE_ERROR");
    }

    #[test]
    fn unknown_backend_name_is_rejected() {
        let mut settings = crate::config::PipelineConfig::default().detect;
        settings.backend = "gpu-magic".into();
        assert!(build_backend(&settings).is_err());
    }
}
