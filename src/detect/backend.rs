use anyhow::Result;

use crate::detect::result::Detection;

/// Detector backend trait.
///
/// A backend is loaded once and then invoked for every image. Implementations
/// are not required to be reentrant: `detect` takes `&mut self`, and the
/// classification engine owns exactly one backend handle, so calls are
/// serialized by construction.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on an RGB8 frame.
    ///
    /// Returns every raw detection; thresholding and class filtering happen in
    /// the engine.
    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
