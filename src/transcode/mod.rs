//! Transcode pipeline
//!
//! Ingest of compressed elementary frames, supervision of the external
//! encoder process, and parsing/classification of its fragmented-MP4
//! output.

pub mod encoder;
pub mod ingest;
pub mod mp4;

pub use encoder::{EncoderSession, EncoderSettings, EncoderState};
pub use ingest::{FrameIngress, PipelineSignal};
pub use mp4::{BoxParser, FourCc, Mp4Box, SegmentClassifier, StreamItem};
