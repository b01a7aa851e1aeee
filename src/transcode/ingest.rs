//! Frame ingress
//!
//! Adapts the driver's per-frame deliveries into the encoder's two input
//! sinks, materializes stream metadata from the first frames, and raises
//! pipeline signals (encoder needed, resolution changed) for the session
//! controller. Never propagates failures back to the driver.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::encoder::EncoderSession;
use crate::driver::{AudioMetadata, VideoMetadata};

/// Frames buffered while the encoder is still spawning
const PENDING_FRAME_CAP: usize = 256;

/// Signals from the frame path to the session controller
pub enum PipelineSignal {
    /// First video metadata arrived and no encoder session is running
    EncoderNeeded(VideoMetadata),
    /// Video geometry changed mid-stream
    ResolutionChanged(VideoMetadata),
    /// The encoder output pump finished for the given session
    EncoderExited {
        session: Arc<EncoderSession>,
        unexpected: bool,
    },
}

/// One frame parked until the encoder session exists
#[derive(Debug, Clone)]
enum PendingFrame {
    Video(Bytes),
    Audio(Bytes),
}

pub struct FrameIngress {
    /// Current encoder session, installed by the controller
    encoder: ArcSwapOption<EncoderSession>,
    video_meta: Mutex<Option<VideoMetadata>>,
    audio_meta: Mutex<Option<AudioMetadata>>,
    pending: Mutex<VecDeque<PendingFrame>>,
    start_requested: AtomicBool,
    signal_tx: mpsc::UnboundedSender<PipelineSignal>,
}

impl FrameIngress {
    pub fn new(signal_tx: mpsc::UnboundedSender<PipelineSignal>) -> Arc<Self> {
        Arc::new(Self {
            encoder: ArcSwapOption::empty(),
            video_meta: Mutex::new(None),
            audio_meta: Mutex::new(None),
            pending: Mutex::new(VecDeque::with_capacity(64)),
            start_requested: AtomicBool::new(false),
            signal_tx,
        })
    }

    /// Video frame from the driver
    pub async fn on_video_frame(&self, data: Bytes, meta: VideoMetadata) {
        {
            let mut current = self.video_meta.lock();
            match *current {
                None => {
                    tracing::info!(
                        "Video stream: {} {}x{} @ {} fps",
                        meta.codec,
                        meta.width,
                        meta.height,
                        meta.fps
                    );
                    *current = Some(meta);
                }
                Some(prev) if prev.width != meta.width || prev.height != meta.height => {
                    tracing::warn!(
                        "Video resolution changed: {}x{} -> {}x{}",
                        prev.width,
                        prev.height,
                        meta.width,
                        meta.height
                    );
                    *current = Some(meta);
                    let _ = self.signal_tx.send(PipelineSignal::ResolutionChanged(meta));
                }
                Some(_) => {}
            }
        }

        match self.encoder.load_full() {
            Some(encoder) => {
                if let Err(e) = encoder.write_video(&data).await {
                    tracing::debug!("Dropped video frame ({} bytes): {}", data.len(), e);
                }
            }
            None => {
                self.park(PendingFrame::Video(data));
                if !self.start_requested.swap(true, Ordering::SeqCst) {
                    let _ = self.signal_tx.send(PipelineSignal::EncoderNeeded(meta));
                }
            }
        }
    }

    /// Audio frame from the driver
    ///
    /// Audio never triggers encoder startup; video metadata alone is
    /// sufficient and the encoder muxes whatever audio arrives.
    pub async fn on_audio_frame(&self, data: Bytes, meta: AudioMetadata) {
        {
            let mut current = self.audio_meta.lock();
            if current.is_none() {
                tracing::info!("Audio stream: {:?}", meta.codec);
                *current = Some(meta);
            }
        }

        match self.encoder.load_full() {
            Some(encoder) => {
                if let Err(e) = encoder.write_audio(&data).await {
                    tracing::debug!("Dropped audio frame ({} bytes): {}", data.len(), e);
                }
            }
            None => self.park(PendingFrame::Audio(data)),
        }
    }

    fn park(&self, frame: PendingFrame) {
        let mut pending = self.pending.lock();
        if pending.len() == PENDING_FRAME_CAP {
            pending.pop_front();
        }
        pending.push_back(frame);
    }

    /// Install a freshly spawned encoder and flush parked frames to it
    pub async fn install_encoder(&self, encoder: Arc<EncoderSession>) {
        self.encoder.store(Some(encoder.clone()));
        self.start_requested.store(false, Ordering::SeqCst);

        let parked: Vec<PendingFrame> = self.pending.lock().drain(..).collect();
        for frame in parked {
            let result = match frame {
                PendingFrame::Video(data) => encoder.write_video(&data).await,
                PendingFrame::Audio(data) => encoder.write_audio(&data).await,
            };
            if let Err(e) = result {
                tracing::debug!("Dropped parked frame: {}", e);
            }
        }
    }

    /// Remove the encoder; subsequent frames park again
    pub fn clear_encoder(&self) {
        self.encoder.store(None);
        self.start_requested.store(false, Ordering::SeqCst);
    }

    /// Forget captured metadata and parked frames (session teardown)
    pub fn reset(&self) {
        *self.video_meta.lock() = None;
        *self.audio_meta.lock() = None;
        self.pending.lock().clear();
        self.start_requested.store(false, Ordering::SeqCst);
    }

    pub fn video_meta(&self) -> Option<VideoMetadata> {
        *self.video_meta.lock()
    }

    pub fn audio_meta(&self) -> Option<AudioMetadata> {
        *self.audio_meta.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{AudioCodec, VideoCodec};

    fn meta(width: u32, height: u32) -> VideoMetadata {
        VideoMetadata {
            codec: VideoCodec::H264,
            width,
            height,
            fps: 20,
        }
    }

    #[tokio::test]
    async fn test_first_frame_requests_encoder_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ingress = FrameIngress::new(tx);

        ingress
            .on_video_frame(Bytes::from_static(b"frame0"), meta(1920, 1080))
            .await;
        ingress
            .on_video_frame(Bytes::from_static(b"frame1"), meta(1920, 1080))
            .await;

        assert!(matches!(
            rx.try_recv().unwrap(),
            PipelineSignal::EncoderNeeded(m) if m.width == 1920
        ));
        // Second frame does not re-request
        assert!(rx.try_recv().is_err());
        assert_eq!(ingress.video_meta().unwrap().height, 1080);
    }

    #[tokio::test]
    async fn test_resolution_change_signals_controller() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ingress = FrameIngress::new(tx);

        ingress
            .on_video_frame(Bytes::from_static(b"a"), meta(1920, 1080))
            .await;
        let _ = rx.try_recv();

        ingress
            .on_video_frame(Bytes::from_static(b"b"), meta(1280, 720))
            .await;

        assert!(matches!(
            rx.try_recv().unwrap(),
            PipelineSignal::ResolutionChanged(m) if m.width == 1280 && m.height == 720
        ));
        // Metadata replaced, not kept
        assert_eq!(ingress.video_meta().unwrap().width, 1280);
    }

    #[tokio::test]
    async fn test_audio_does_not_request_encoder() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ingress = FrameIngress::new(tx);

        ingress
            .on_audio_frame(Bytes::from_static(b"aac"), AudioMetadata { codec: AudioCodec::Aac })
            .await;

        assert!(rx.try_recv().is_err());
        assert!(ingress.audio_meta().is_some());
    }

    #[tokio::test]
    async fn test_pending_buffer_is_bounded() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let ingress = FrameIngress::new(tx);

        for _ in 0..(PENDING_FRAME_CAP + 50) {
            ingress
                .on_video_frame(Bytes::from_static(b"x"), meta(1920, 1080))
                .await;
        }
        assert_eq!(ingress.pending.lock().len(), PENDING_FRAME_CAP);
    }

    #[tokio::test]
    async fn test_reset_clears_state() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let ingress = FrameIngress::new(tx);

        ingress
            .on_video_frame(Bytes::from_static(b"x"), meta(1920, 1080))
            .await;
        ingress.reset();

        assert!(ingress.video_meta().is_none());
        assert!(ingress.pending.lock().is_empty());
    }
}
