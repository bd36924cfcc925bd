//! Vision capture and detection streaming.

pub mod camera;
pub mod pipeline;
pub mod stream;

pub use camera::{Camera, CameraWorker, Frame, SyntheticCamera};
pub use pipeline::{NullPipeline, Pipeline, ProcessOptions};
pub use stream::{FrameHandler, RoiHandle, VisionLoop};
