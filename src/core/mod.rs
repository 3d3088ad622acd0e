//! Core data structures for RustFusion

pub mod camera;
pub mod frame;
pub mod image;
pub mod pose;
pub mod preprocess;

pub use camera::Intrinsics;
pub use frame::{Frame, FrameFeatures, FramePyramid, NUM_PYRS};
pub use image::ImageBuffer;
pub use pose::SE3;
