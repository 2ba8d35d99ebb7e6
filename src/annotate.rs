//! Spot-check copies of classified images with the kept boxes drawn in.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};

use crate::detect::{ClassificationEngine, ClassifiedImage, CountBucket};

const JPEG_QUALITY: u8 = 85;
const BOX_THICKNESS: i32 = 2;

/// Decides which images get an annotated copy.
pub struct AnnotationSampler {
    rate: f64,
    rng: StdRng,
}

impl AnnotationSampler {
    pub fn new(rate: f64) -> Self {
        Self {
            rate: bounded_rate(rate),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(rate: f64, seed: u64) -> Self {
        Self {
            rate: bounded_rate(rate),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn sample(&mut self) -> bool {
        self.rng.gen_bool(self.rate)
    }
}

/// Clamp into `[0, 1]`; a NaN or infinite rate samples nothing.
fn bounded_rate(rate: f64) -> f64 {
    if rate.is_finite() {
        rate.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn bucket_color(bucket: Option<CountBucket>) -> Rgb<u8> {
    match bucket {
        Some(CountBucket::Cars) => Rgb([230, 40, 40]),
        Some(CountBucket::Trucks) => Rgb([40, 90, 230]),
        Some(CountBucket::People) => Rgb([40, 200, 60]),
        None => Rgb([240, 220, 30]),
    }
}

/// Copy of the decoded image with every above-threshold detection outlined.
pub fn render(engine: &ClassificationEngine, classified: &ClassifiedImage) -> RgbImage {
    let mut canvas = classified.image.clone();
    let (width, height) = canvas.dimensions();
    for detection in engine.kept(&classified.detections) {
        let (x, y, w, h) = detection.bbox.to_pixels(width, height);
        let color = bucket_color(engine.bucket_for(detection.class_id));
        for inset in 0..BOX_THICKNESS {
            let w = w as i32 - 2 * inset;
            let h = h as i32 - 2 * inset;
            if w <= 0 || h <= 0 {
                break;
            }
            let rect = Rect::at(x + inset, y + inset).of_size(w as u32, h as u32);
            draw_hollow_rect_mut(&mut canvas, rect, color);
        }
    }
    canvas
}

pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
        .encode_image(image)
        .context("encode annotated jpeg")?;
    Ok(out)
}

/// Render, encode and write the annotated copy into `dir` as `file_name`.
pub fn write_annotated(
    engine: &ClassificationEngine,
    classified: &ClassifiedImage,
    file_name: &str,
    dir: &Path,
) -> Result<PathBuf> {
    let bytes = encode_jpeg(&render(engine, classified))?;
    let path = dir.join(file_name);
    fs::write(&path, bytes).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}
