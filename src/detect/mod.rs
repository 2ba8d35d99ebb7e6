mod backend;
mod backends;
mod engine;
mod labels;
mod result;

pub use backend::DetectorBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use engine::{build_backend, ClassificationEngine, ClassifiedImage, STUB_BACKEND};
pub use labels::{CountBucket, LabelMap, UNKNOWN_LABEL};
pub use result::{BoundingBox, ClassTally, Detection};
