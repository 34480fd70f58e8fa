//! Video output paced against the shared clock
pub mod output;

pub use output::{HeadlessSink, VideoFrame, VideoOutput, VideoSink};
