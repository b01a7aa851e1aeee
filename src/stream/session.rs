//! Session controller
//!
//! Owns the single active camera: device mutual exclusion, encoder
//! lifecycle, the two-stage drain/release grace period, and best-effort
//! restarts on resolution change or encoder crash. Every lifecycle
//! transition serializes through one mutex; media delivery never takes
//! that lock.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::hub::{StreamFlags, StreamHub, Subscriber};
use super::snapshot::SnapshotWriter;
use crate::config::ConfigStore;
use crate::driver::{DriverManager, LivestreamPacket, VideoMetadata};
use crate::error::{AppError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::transcode::{
    BoxParser, EncoderSession, EncoderSettings, EncoderState, FrameIngress, PipelineSignal,
    SegmentClassifier, StreamItem,
};

/// Grace period after the last subscriber leaves before the stream stops
const DRAIN_DELAY: Duration = Duration::from_secs(5);
/// Further delay before the device itself is released
const RELEASE_DELAY: Duration = Duration::from_secs(2);
/// Encoder output read chunk
const OUTPUT_READ_CHUNK: usize = 64 * 1024;

struct SessionState {
    current_device: Option<String>,
    encoder: Option<Arc<EncoderSession>>,
    output_pump: Option<JoinHandle<()>>,
    driver_pump: Option<JoinHandle<()>>,
    drain_timer: Option<JoinHandle<()>>,
    release_timer: Option<JoinHandle<()>>,
    timer_generation: u64,
}

pub struct SessionController {
    state: Mutex<SessionState>,
    hub: Arc<StreamHub>,
    flags: Arc<StreamFlags>,
    ingress: Arc<FrameIngress>,
    driver: Arc<DriverManager>,
    events: Arc<EventBus>,
    config: ConfigStore,
    snapshots: Arc<SnapshotWriter>,
    latest_keyframe: ArcSwapOption<Bytes>,
    signal_tx: mpsc::UnboundedSender<PipelineSignal>,
}

impl SessionController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hub: Arc<StreamHub>,
        flags: Arc<StreamFlags>,
        ingress: Arc<FrameIngress>,
        driver: Arc<DriverManager>,
        events: Arc<EventBus>,
        config: ConfigStore,
        snapshots: Arc<SnapshotWriter>,
        signal_tx: mpsc::UnboundedSender<PipelineSignal>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SessionState {
                current_device: None,
                encoder: None,
                output_pump: None,
                driver_pump: None,
                drain_timer: None,
                release_timer: None,
                timer_generation: 0,
            }),
            hub,
            flags,
            ingress,
            driver,
            events,
            config,
            snapshots,
            latest_keyframe: ArcSwapOption::empty(),
            signal_tx,
        })
    }

    /// Consume pipeline signals; call once at startup
    pub fn spawn_signal_loop(
        self: &Arc<Self>,
        mut signal_rx: mpsc::UnboundedReceiver<PipelineSignal>,
    ) {
        let controller = self.clone();
        tokio::spawn(async move {
            while let Some(signal) = signal_rx.recv().await {
                match signal {
                    PipelineSignal::EncoderNeeded(meta) => {
                        controller.start_encoder(meta).await;
                    }
                    PipelineSignal::ResolutionChanged(_) => {
                        controller.on_resolution_change().await;
                    }
                    PipelineSignal::EncoderExited {
                        session,
                        unexpected,
                    } => {
                        controller.on_encoder_exit(session, unexpected).await;
                    }
                }
            }
        });
    }

    /// Watch for driver connection loss and end the stream when it
    /// happens; subscribers see end-of-stream, not an HTTP error
    pub fn spawn_driver_watch(self: &Arc<Self>) {
        let controller = self.clone();
        let mut rx = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(SystemEvent::DriverDisconnected { .. }) => {
                        controller.on_driver_disconnect().await;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(_) => break,
                }
            }
        });
    }

    async fn on_driver_disconnect(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if state.current_device.is_none()
            || (state.driver_pump.is_none() && state.encoder.is_none())
        {
            return;
        }
        tracing::warn!("Driver disconnected with an active session, ending stream");
        self.teardown_pipeline(&mut state).await;
        // End-of-stream every subscriber; their leave calls drive the
        // drain and release of the device
        self.hub.shutdown();
    }

    // ========================================================================
    // Subscriber lifecycle
    // ========================================================================

    /// Join a subscriber for one camera
    ///
    /// First join claims the device and asks the driver for the
    /// livestream; a join for a different camera while one is claimed is
    /// a conflict.
    pub async fn join(
        self: &Arc<Self>,
        serial: &str,
    ) -> Result<(Arc<Subscriber>, mpsc::Receiver<Bytes>)> {
        let mut state = self.state.lock().await;

        match state.current_device.clone() {
            None => {
                self.cancel_timers(&mut state);
                state.current_device = Some(serial.to_string());
                if let Err(e) = self.request_livestream(&mut state, serial).await {
                    state.current_device = None;
                    return Err(e);
                }
            }
            Some(ref current) if current == serial => {
                self.cancel_timers(&mut state);
                // The stream may already be drained (join inside the
                // release window); bring it back
                if state.driver_pump.is_none() {
                    self.request_livestream(&mut state, serial).await?;
                }
            }
            Some(current) => {
                return Err(AppError::DeviceConflict {
                    current,
                    requested: serial.to_string(),
                });
            }
        }

        Ok(self.hub.register(serial))
    }

    /// Deregister a subscriber; an empty set starts the drain timer
    pub async fn leave(self: &Arc<Self>, id: Uuid) {
        let mut state = self.state.lock().await;
        let remaining = self.hub.remove(id);
        if remaining == 0
            && state.current_device.is_some()
            && state.drain_timer.is_none()
            && state.release_timer.is_none()
        {
            self.schedule_drain(&mut state);
        }
    }

    async fn request_livestream(
        self: &Arc<Self>,
        state: &mut SessionState,
        serial: &str,
    ) -> Result<()> {
        let rx = self.driver.start_livestream(serial).await?;
        state.driver_pump = Some(self.spawn_driver_pump(rx));
        self.events.publish(SystemEvent::LivestreamStarted {
            serial: serial.to_string(),
        });
        Ok(())
    }

    fn spawn_driver_pump(
        self: &Arc<Self>,
        mut rx: mpsc::Receiver<LivestreamPacket>,
    ) -> JoinHandle<()> {
        let ingress = self.ingress.clone();
        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                match packet {
                    LivestreamPacket::Video { data, meta } => {
                        ingress.on_video_frame(data, meta).await;
                    }
                    LivestreamPacket::Audio { data, meta } => {
                        ingress.on_audio_frame(data, meta).await;
                    }
                }
            }
            tracing::debug!("Driver livestream channel closed");
        })
    }

    // ========================================================================
    // Drain and release timers
    // ========================================================================

    fn cancel_timers(&self, state: &mut SessionState) {
        state.timer_generation += 1;
        if let Some(timer) = state.drain_timer.take() {
            timer.abort();
        }
        if let Some(timer) = state.release_timer.take() {
            timer.abort();
        }
    }

    fn schedule_drain(self: &Arc<Self>, state: &mut SessionState) {
        state.timer_generation += 1;
        let generation = state.timer_generation;
        let controller = self.clone();
        state.drain_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(DRAIN_DELAY).await;
            controller.drain_fire(generation).await;
        }));
    }

    async fn drain_fire(self: &Arc<Self>, generation: u64) {
        let mut state = self.state.lock().await;
        if state.timer_generation != generation {
            return;
        }
        state.drain_timer = None;
        if self.hub.count() > 0 {
            return;
        }

        tracing::info!("Drain window elapsed, stopping stream");
        self.teardown_pipeline(&mut state).await;

        if let Some(serial) = state.current_device.clone() {
            if let Err(e) = self.driver.stop_livestream(&serial).await {
                tracing::warn!("Livestream stop for {} failed: {}", serial, e);
            }
            self.events
                .publish(SystemEvent::LivestreamStopped { serial });
        }

        let generation = state.timer_generation;
        let controller = self.clone();
        state.release_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(RELEASE_DELAY).await;
            controller.release_fire(generation).await;
        }));
    }

    async fn release_fire(self: &Arc<Self>, generation: u64) {
        let mut state = self.state.lock().await;
        if state.timer_generation != generation {
            return;
        }
        state.release_timer = None;
        if self.hub.count() > 0 {
            return;
        }
        if let Some(serial) = state.current_device.take() {
            tracing::info!("Released device {}", serial);
        }
    }

    /// Stop the encoder and driver pump, forget stream state
    async fn teardown_pipeline(&self, state: &mut SessionState) {
        if let Some(pump) = state.driver_pump.take() {
            pump.abort();
        }
        self.flags.transcoding.store(false, Ordering::SeqCst);
        self.flags.output_available.store(false, Ordering::SeqCst);
        self.ingress.clear_encoder();
        if let Some(encoder) = state.encoder.take() {
            encoder.drain().await;
        }
        state.output_pump = None;
        self.ingress.reset();
        self.hub.reset_for_new_session();
    }

    // ========================================================================
    // Encoder lifecycle
    // ========================================================================

    async fn start_encoder(self: &Arc<Self>, meta: VideoMetadata) {
        let mut state = self.state.lock().await;
        if state.encoder.is_some() || state.current_device.is_none() {
            return;
        }

        let settings = EncoderSettings::from_config(
            &self.config.get(),
            meta.codec,
            self.driver.livestream_has_audio(),
        );
        let encoder = match EncoderSession::spawn(&settings) {
            Ok(encoder) => encoder,
            Err(e) => {
                tracing::error!("Encoder spawn failed: {}", e);
                return;
            }
        };

        self.flags.transcoding.store(true, Ordering::SeqCst);
        state.encoder = Some(encoder.clone());
        state.output_pump = Some(self.spawn_output_pump(encoder.clone()));
        self.ingress.install_encoder(encoder).await;
    }

    /// Single reader of the encoder output: drives the box parser and
    /// dispatches to init cache, fan-out hub, and snapshot seed
    fn spawn_output_pump(self: &Arc<Self>, encoder: Arc<EncoderSession>) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            let Some(mut output) = encoder.take_output().await else {
                return;
            };

            let mut parser = BoxParser::new();
            let mut classifier = SegmentClassifier::new();
            let mut buf = BytesMut::with_capacity(OUTPUT_READ_CHUNK);
            let mut items: Vec<StreamItem> = Vec::new();
            let mut parse_failed = false;

            'read: loop {
                buf.clear();
                match output.read_buf(&mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        encoder.mark_running();
                        controller
                            .flags
                            .output_available
                            .store(true, Ordering::SeqCst);

                        parser.push(&buf);
                        loop {
                            match parser.next_box() {
                                Ok(Some(bx)) => classifier.accept(bx, &mut items),
                                Ok(None) => break,
                                Err(e) => {
                                    tracing::error!(
                                        "Encoder output violates box framing: {}",
                                        e
                                    );
                                    parse_failed = true;
                                    break 'read;
                                }
                            }
                        }

                        for item in items.drain(..) {
                            match item {
                                StreamItem::InitSegment(init) => {
                                    controller.hub.set_init_segment(init);
                                }
                                StreamItem::Media(bx) => {
                                    controller.hub.deliver(&bx);
                                }
                                StreamItem::KeyframeFragment(seed) => {
                                    controller.latest_keyframe.store(Some(Arc::new(seed)));
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::debug!("Encoder output read error: {}", e);
                        break;
                    }
                }
            }

            let was_draining = matches!(
                encoder.state(),
                EncoderState::Draining | EncoderState::Terminated
            );
            if !parse_failed {
                if let Some(status) = encoder.finish().await {
                    if !status.success() && !was_draining {
                        for line in encoder.stderr_tail() {
                            tracing::warn!("[encoder] {}", line);
                        }
                    }
                }
            }

            let _ = controller.signal_tx.send(PipelineSignal::EncoderExited {
                session: encoder,
                unexpected: parse_failed || !was_draining,
            });
        })
    }

    /// Encoder finished, crashed, or its output broke framing
    ///
    /// The snapshot writer gets its flush chance on every exit. A stale
    /// signal for a session that was already replaced must not touch the
    /// current encoder, so everything else is gated on identity.
    async fn on_encoder_exit(self: &Arc<Self>, session: Arc<EncoderSession>, unexpected: bool) {
        let mut state = self.state.lock().await;

        self.flush_snapshot(&state);

        let is_current = state
            .encoder
            .as_ref()
            .is_some_and(|e| Arc::ptr_eq(e, &session));
        if !is_current {
            return;
        }

        state.encoder = None;
        self.flags.transcoding.store(false, Ordering::SeqCst);
        self.flags.output_available.store(false, Ordering::SeqCst);
        self.ingress.clear_encoder();
        if session.state() != EncoderState::Terminated {
            session.drain().await;
        }
        state.output_pump = None;

        if unexpected && self.hub.count() > 0 {
            tracing::info!("Encoder exited unexpectedly with subscribers attached, restarting");
            self.restart_session(&mut state).await;
        }
    }

    /// Mid-stream geometry change: replace the whole encoder session
    async fn on_resolution_change(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if self.hub.count() == 0 {
            return;
        }
        tracing::info!("Resolution changed mid-stream, restarting session");

        self.flags.transcoding.store(false, Ordering::SeqCst);
        self.flags.output_available.store(false, Ordering::SeqCst);
        self.ingress.clear_encoder();
        if let Some(encoder) = state.encoder.take() {
            encoder.drain().await;
        }
        state.output_pump = None;

        self.restart_session(&mut state).await;
    }

    /// Clear stream state and re-request the livestream for the current
    /// device; the next video frame brings a fresh encoder and init
    async fn restart_session(self: &Arc<Self>, state: &mut SessionState) {
        self.ingress.reset();
        self.hub.reset_for_new_session();

        let Some(serial) = state.current_device.clone() else {
            return;
        };
        if let Some(pump) = state.driver_pump.take() {
            pump.abort();
        }
        if let Err(e) = self.driver.stop_livestream(&serial).await {
            tracing::debug!("Livestream stop before restart failed: {}", e);
        }
        match self.driver.start_livestream(&serial).await {
            Ok(rx) => {
                state.driver_pump = Some(self.spawn_driver_pump(rx));
            }
            Err(e) => {
                tracing::error!("Livestream restart for {} failed: {}", serial, e);
            }
        }
    }

    /// Tear down and re-create the encoder with current settings; used
    /// when transcode configuration changes under an active session
    pub async fn restart_encoder(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        let Some(encoder) = state.encoder.take() else {
            return;
        };
        tracing::info!("Restarting encoder after configuration change");

        self.flags.transcoding.store(false, Ordering::SeqCst);
        self.flags.output_available.store(false, Ordering::SeqCst);
        self.ingress.clear_encoder();
        encoder.drain().await;
        state.output_pump = None;
        self.hub.reset_for_new_session();
        // Metadata is kept: the next video frame raises EncoderNeeded
        // and the new session captures a fresh init segment
    }

    fn flush_snapshot(&self, state: &SessionState) {
        let Some(serial) = state.current_device.clone() else {
            return;
        };
        let Some(seed) = self.latest_keyframe.load_full() else {
            return;
        };
        let snapshots = self.snapshots.clone();
        tokio::spawn(async move {
            if let Err(e) = snapshots.write_still(&serial, (*seed).clone()).await {
                tracing::warn!("Snapshot on session end failed: {}", e);
            }
        });
    }

    // ========================================================================
    // Introspection and shutdown
    // ========================================================================

    pub async fn current_device(&self) -> Option<String> {
        self.state.lock().await.current_device.clone()
    }

    pub fn is_transcoding(&self) -> bool {
        self.flags.is_transcoding()
    }

    pub fn has_keyframe_fragment(&self) -> bool {
        self.latest_keyframe.load().is_some()
    }

    /// Stop everything for process shutdown
    pub async fn shutdown(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        self.cancel_timers(&mut state);
        self.teardown_pipeline(&mut state).await;
        if let Some(serial) = state.current_device.take() {
            let _ = self.driver.stop_livestream(&serial).await;
            self.events
                .publish(SystemEvent::LivestreamStopped { serial });
        }
        self.hub.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Driver, DriverEvent};
    use crate::events::EntitySource;
    use async_trait::async_trait;
    use parking_lot::Mutex as ParkingMutex;
    use serde_json::{json, Value};
    use tokio::sync::broadcast;

    /// Records livestream start/stop calls and keeps channels open
    struct MockDriver {
        event_tx: broadcast::Sender<DriverEvent>,
        starts: ParkingMutex<Vec<String>>,
        stops: ParkingMutex<Vec<String>>,
        open_streams: ParkingMutex<Vec<mpsc::Sender<LivestreamPacket>>>,
    }

    impl MockDriver {
        fn new() -> Arc<Self> {
            let (event_tx, _) = broadcast::channel(16);
            Arc::new(Self {
                event_tx,
                starts: ParkingMutex::new(Vec::new()),
                stops: ParkingMutex::new(Vec::new()),
                open_streams: ParkingMutex::new(Vec::new()),
            })
        }

        fn start_count(&self) -> usize {
            self.starts.lock().len()
        }

        fn stop_count(&self) -> usize {
            self.stops.lock().len()
        }
    }

    #[async_trait]
    impl Driver for MockDriver {
        fn version(&self) -> String {
            "mock/1.0".to_string()
        }

        async fn connect(&self) -> Result<()> {
            let _ = self.event_tx.send(DriverEvent::Connected {
                stations: vec![],
                devices: vec!["CAM1".to_string(), "CAM2".to_string()],
            });
            Ok(())
        }

        async fn disconnect(&self) {}

        fn is_connected(&self) -> bool {
            true
        }

        fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
            self.event_tx.subscribe()
        }

        async fn properties(&self, _source: EntitySource, _serial: &str) -> Result<Value> {
            Ok(json!({}))
        }

        async fn commands(&self, _serial: &str) -> Result<Vec<String>> {
            Ok(vec![])
        }

        async fn start_livestream(
            &self,
            serial: &str,
        ) -> Result<mpsc::Receiver<LivestreamPacket>> {
            self.starts.lock().push(serial.to_string());
            let (tx, rx) = mpsc::channel(4);
            self.open_streams.lock().push(tx);
            Ok(rx)
        }

        async fn stop_livestream(&self, serial: &str) -> Result<()> {
            self.stops.lock().push(serial.to_string());
            Ok(())
        }

        async fn download_image(&self, _serial: &str) -> Result<()> {
            Ok(())
        }

        async fn query_latest_info(&self, _serial: &str) -> Result<()> {
            Ok(())
        }

        async fn preset_position(&self, _serial: &str, _position: u32) -> Result<()> {
            Ok(())
        }

        async fn pan_and_tilt(&self, _serial: &str, _direction: i32) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        controller: Arc<SessionController>,
        mock: Arc<MockDriver>,
        hub: Arc<StreamHub>,
        events: Arc<EventBus>,
        _dir: tempfile::TempDir,
    }

    async fn controller_fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(EventBus::new());
        let config = ConfigStore::new(&dir.path().join("config.json"))
            .await
            .unwrap();
        let flags = Arc::new(StreamFlags::default());
        let hub = StreamHub::new(flags.clone());
        let (signal_tx, _signal_rx) = mpsc::unbounded_channel();
        let ingress = FrameIngress::new(signal_tx.clone());
        let mock = MockDriver::new();
        let driver = DriverManager::new(mock.clone(), events.clone());
        let snapshots = SnapshotWriter::new(dir.path(), events.clone());

        let controller = SessionController::new(
            hub.clone(),
            flags,
            ingress,
            driver,
            events.clone(),
            config,
            snapshots,
            signal_tx,
        );
        Fixture {
            controller,
            mock,
            hub,
            events,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_first_join_claims_device() {
        let Fixture { controller, mock, _dir, .. } = controller_fixture().await;

        let (sub, _rx) = controller.join("CAM1").await.unwrap();
        assert_eq!(controller.current_device().await.as_deref(), Some("CAM1"));
        assert_eq!(mock.start_count(), 1);
        assert_eq!(sub.serial, "CAM1");
    }

    #[tokio::test]
    async fn test_second_camera_conflicts() {
        let Fixture { controller, _dir, .. } = controller_fixture().await;

        let _a = controller.join("CAM1").await.unwrap();
        let err = controller.join("CAM2").await.unwrap_err();
        match err {
            AppError::DeviceConflict { current, requested } => {
                assert_eq!(current, "CAM1");
                assert_eq!(requested, "CAM2");
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_same_camera_join_accepted() {
        let Fixture { controller, mock, hub, _dir, .. } = controller_fixture().await;

        let _a = controller.join("CAM1").await.unwrap();
        let _b = controller.join("CAM1").await.unwrap();
        assert_eq!(hub.count(), 2);
        // Livestream requested only once
        assert_eq!(mock.start_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_and_release_sequence() {
        let Fixture { controller, mock, _dir, .. } = controller_fixture().await;

        let (a, _rx_a) = controller.join("CAM1").await.unwrap();
        let (b, _rx_b) = controller.join("CAM1").await.unwrap();

        // First leave with another subscriber attached: no timer fires
        controller.leave(a.id).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(mock.stop_count(), 0);

        controller.leave(b.id).await;

        // Before the 5 s drain window closes nothing has stopped
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(mock.stop_count(), 0);
        assert_eq!(controller.current_device().await.as_deref(), Some("CAM1"));

        // Drain fires at 5 s; device held through the release window
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(mock.stop_count(), 1);
        assert_eq!(controller.current_device().await.as_deref(), Some("CAM1"));

        // Release fires 2 s later
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(controller.current_device().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejoin_within_drain_window_cancels_stop() {
        let Fixture { controller, mock, _dir, .. } = controller_fixture().await;

        let (a, _rx_a) = controller.join("CAM1").await.unwrap();
        controller.leave(a.id).await;

        tokio::time::sleep(Duration::from_secs(3)).await;
        let (_b, _rx_b) = controller.join("CAM1").await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(mock.stop_count(), 0);
        assert_eq!(mock.start_count(), 1);
        assert_eq!(controller.current_device().await.as_deref(), Some("CAM1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_persists_through_grace_window() {
        let Fixture { controller, _dir, .. } = controller_fixture().await;

        let (a, _rx_a) = controller.join("CAM1").await.unwrap();
        controller.leave(a.id).await;

        // Inside the 7 s window CAM2 is still refused
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(matches!(
            controller.join("CAM2").await,
            Err(AppError::DeviceConflict { .. })
        ));

        // After release the device is free
        tokio::time::sleep(Duration::from_secs(2)).await;
        let result = controller.join("CAM2").await;
        assert!(result.is_ok());
        assert_eq!(controller.current_device().await.as_deref(), Some("CAM2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_during_release_restarts_livestream() {
        let Fixture { controller, mock, _dir, .. } = controller_fixture().await;

        let (a, _rx_a) = controller.join("CAM1").await.unwrap();
        controller.leave(a.id).await;

        // Past the drain, inside the release window
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(mock.stop_count(), 1);

        let (_b, _rx_b) = controller.join("CAM1").await.unwrap();
        // The drained livestream was re-requested
        assert_eq!(mock.start_count(), 2);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(controller.current_device().await.as_deref(), Some("CAM1"));
    }

    #[tokio::test]
    async fn test_driver_disconnect_ends_stream() {
        let Fixture {
            controller,
            hub,
            events,
            _dir,
            ..
        } = controller_fixture().await;
        controller.spawn_driver_watch();

        let (_a, mut rx) = controller.join("CAM1").await.unwrap();
        assert_eq!(hub.count(), 1);

        events.publish(SystemEvent::DriverDisconnected {
            reason: "connection lost".to_string(),
        });

        // Subscribers are end-of-streamed once the watcher runs
        assert!(rx.recv().await.is_none());
        assert_eq!(hub.count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_clears_session() {
        let Fixture { controller, mock, hub, _dir, .. } = controller_fixture().await;

        let _a = controller.join("CAM1").await.unwrap();
        controller.shutdown().await;

        assert_eq!(controller.current_device().await, None);
        assert_eq!(hub.count(), 0);
        assert_eq!(mock.stop_count(), 1);
    }
}
