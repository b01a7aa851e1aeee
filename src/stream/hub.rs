//! Fan-out hub
//!
//! Single producer (the encoder output pump), many consumers (HTTP
//! subscribers). Every subscriber receives the session's init segment
//! first, then the live box sequence in hub-arrival order starting at a
//! fragment boundary. Slow or dead subscribers are dropped, never
//! awaited: the pump must not stall.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use parking_lot::{Mutex as ParkingMutex, RwLock as ParkingRwLock};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::transcode::{FourCc, Mp4Box};

/// Per-subscriber queue depth in boxes; a consumer this far behind the
/// live edge is dropped
const SUBSCRIBER_QUEUE_BOXES: usize = 64;
/// How long a joining subscriber may wait for transcoding + init
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
/// Poll cadence while waiting for the pipeline to come up
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pipeline readiness flags, written by the session controller and the
/// output pump, read by joining subscribers
#[derive(Default)]
pub struct StreamFlags {
    pub transcoding: AtomicBool,
    pub output_available: AtomicBool,
}

impl StreamFlags {
    pub fn is_transcoding(&self) -> bool {
        self.transcoding.load(Ordering::SeqCst)
    }

    pub fn output_available(&self) -> bool {
        self.output_available.load(Ordering::SeqCst)
    }
}

/// One attached HTTP client
#[derive(Debug)]
pub struct Subscriber {
    pub id: Uuid,
    pub serial: String,
    tx: ParkingMutex<Option<mpsc::Sender<Bytes>>>,
    active: AtomicBool,
    attached: AtomicBool,
    init_received: AtomicBool,
    awaiting_fragment: AtomicBool,
}

impl Subscriber {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn has_received_init(&self) -> bool {
        self.init_received.load(Ordering::SeqCst)
    }
}

pub struct StreamHub {
    subscribers: ParkingRwLock<HashMap<Uuid, Arc<Subscriber>>>,
    init_segment: ArcSwapOption<Bytes>,
    init_notify: broadcast::Sender<()>,
    flags: Arc<StreamFlags>,
}

impl StreamHub {
    pub fn new(flags: Arc<StreamFlags>) -> Arc<Self> {
        let (init_notify, _) = broadcast::channel(4);
        Arc::new(Self {
            subscribers: ParkingRwLock::new(HashMap::new()),
            init_segment: ArcSwapOption::empty(),
            init_notify,
            flags,
        })
    }

    pub fn flags(&self) -> &StreamFlags {
        &self.flags
    }

    /// Register a new subscriber in init-pending state
    pub fn register(&self, serial: &str) -> (Arc<Subscriber>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_BOXES);
        let subscriber = Arc::new(Subscriber {
            id: Uuid::new_v4(),
            serial: serial.to_string(),
            tx: ParkingMutex::new(Some(tx)),
            active: AtomicBool::new(true),
            attached: AtomicBool::new(false),
            init_received: AtomicBool::new(false),
            awaiting_fragment: AtomicBool::new(false),
        });
        self.subscribers
            .write()
            .insert(subscriber.id, subscriber.clone());
        tracing::info!(
            "Subscriber {} joined for {} (total: {})",
            subscriber.id,
            serial,
            self.count()
        );
        (subscriber, rx)
    }

    /// Remove a subscriber; returns how many remain
    pub fn remove(&self, id: Uuid) -> usize {
        let removed = self.subscribers.write().remove(&id);
        if let Some(subscriber) = removed {
            subscriber.active.store(false, Ordering::SeqCst);
            // Dropping the sender end-of-streams the HTTP body
            subscriber.tx.lock().take();
            tracing::info!(
                "Subscriber {} left {} (remaining: {})",
                id,
                subscriber.serial,
                self.count()
            );
        }
        self.count()
    }

    pub fn count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn has_init_segment(&self) -> bool {
        self.init_segment.load().is_some()
    }

    /// Install the init segment for the current session and feed it to
    /// every attached subscriber still waiting for it
    pub fn set_init_segment(&self, init: Bytes) {
        tracing::info!("Init segment captured: {} bytes", init.len());
        self.init_segment.store(Some(Arc::new(init)));

        let waiting: Vec<Arc<Subscriber>> = {
            let subs = self.subscribers.read();
            subs.values()
                .filter(|s| s.attached.load(Ordering::SeqCst))
                .cloned()
                .collect()
        };
        for subscriber in waiting {
            self.push_init(&subscriber);
        }

        let _ = self.init_notify.send(());
    }

    /// Write the cached init segment to one subscriber exactly once
    ///
    /// The subscriber's tx mutex serializes this against `deliver`, so a
    /// media box can never enter the queue ahead of the init bytes.
    fn push_init(&self, subscriber: &Subscriber) {
        let Some(init) = self.init_segment.load_full() else {
            return;
        };

        let sent = {
            let guard = subscriber.tx.lock();
            if subscriber
                .init_received
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
            subscriber.awaiting_fragment.store(true, Ordering::SeqCst);
            match guard.as_ref() {
                Some(tx) => tx.try_send((*init).clone()).is_ok(),
                None => false,
            }
        };
        if !sent {
            self.mark_inactive(subscriber);
        }
    }

    /// Forward one live box to every gated subscriber
    ///
    /// Fire-and-forget per subscriber: a full or closed queue marks the
    /// subscriber inactive, it is never retried and never awaited.
    pub fn deliver(&self, bx: &Mp4Box) {
        let targets: Vec<Arc<Subscriber>> = {
            let subs = self.subscribers.read();
            subs.values().cloned().collect()
        };

        for subscriber in targets {
            if !subscriber.active.load(Ordering::SeqCst)
                || !subscriber.attached.load(Ordering::SeqCst)
            {
                continue;
            }

            let sent = {
                let guard = subscriber.tx.lock();
                if !subscriber.init_received.load(Ordering::SeqCst) {
                    continue;
                }
                // Join the media sequence at a fragment boundary so
                // nobody starts mid-fragment
                if subscriber.awaiting_fragment.load(Ordering::SeqCst) {
                    if bx.kind != FourCc::MOOF {
                        continue;
                    }
                    subscriber.awaiting_fragment.store(false, Ordering::SeqCst);
                }
                match guard.as_ref() {
                    Some(tx) => tx.try_send(bx.data.clone()).is_ok(),
                    None => false,
                }
            };
            if !sent {
                tracing::debug!("Subscriber {} fell behind, dropping", subscriber.id);
                self.mark_inactive(&subscriber);
            }
        }
    }

    fn mark_inactive(&self, subscriber: &Subscriber) {
        subscriber.active.store(false, Ordering::SeqCst);
        subscriber.tx.lock().take();
    }

    /// Block until the subscriber is attached and has its init segment,
    /// or fail after the join timeout
    pub async fn gate(&self, subscriber: &Arc<Subscriber>) -> Result<()> {
        let deadline = tokio::time::Instant::now() + JOIN_TIMEOUT;
        let mut init_rx = self.init_notify.subscribe();

        // Phase 1: wait for the pipeline to be up
        loop {
            if self.flags.is_transcoding() && self.flags.output_available() {
                subscriber.attached.store(true, Ordering::SeqCst);
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AppError::Unavailable(
                    "stream did not start in time".to_string(),
                ));
            }
            tokio::time::sleep(JOIN_POLL_INTERVAL).await;
        }

        // Phase 2: wait for the init segment
        loop {
            if self.has_init_segment() {
                self.push_init(subscriber);
            }
            if subscriber.has_received_init() {
                return Ok(());
            }
            if !subscriber.is_active() {
                return Err(AppError::Unavailable("subscriber dropped".to_string()));
            }
            tokio::select! {
                _ = init_rx.recv() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(AppError::Unavailable(
                        "no init segment within join window".to_string(),
                    ));
                }
            }
        }
    }

    /// New encoder session: drop the cached init and re-gate everyone so
    /// each subscriber receives the fresh init before new media
    pub fn reset_for_new_session(&self) {
        self.init_segment.store(None);
        self.flags.output_available.store(false, Ordering::SeqCst);
        let subs = self.subscribers.read();
        for subscriber in subs.values() {
            subscriber.init_received.store(false, Ordering::SeqCst);
            subscriber.awaiting_fragment.store(false, Ordering::SeqCst);
        }
    }

    /// Detach everyone and end their streams (pipeline shutdown)
    pub fn shutdown(&self) {
        let mut subs = self.subscribers.write();
        for subscriber in subs.values() {
            subscriber.active.store(false, Ordering::SeqCst);
            subscriber.tx.lock().take();
        }
        subs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media_box(kind: &[u8; 4], body_len: usize) -> Mp4Box {
        let size = (8 + body_len) as u32;
        let mut raw = Vec::with_capacity(size as usize);
        raw.extend_from_slice(&size.to_be_bytes());
        raw.extend_from_slice(kind);
        raw.extend(std::iter::repeat(0u8).take(body_len));
        Mp4Box {
            kind: FourCc(*kind),
            data: Bytes::from(raw),
        }
    }

    fn ready_hub() -> Arc<StreamHub> {
        let flags = Arc::new(StreamFlags::default());
        flags.transcoding.store(true, Ordering::SeqCst);
        flags.output_available.store(true, Ordering::SeqCst);
        StreamHub::new(flags)
    }

    #[tokio::test]
    async fn test_init_before_media() {
        let hub = ready_hub();
        hub.set_init_segment(Bytes::from_static(b"INIT"));

        let (sub, mut rx) = hub.register("CAM1");
        hub.gate(&sub).await.unwrap();

        hub.deliver(&media_box(b"moof", 10));
        hub.deliver(&media_box(b"mdat", 10));

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"INIT"));
        assert_eq!(rx.recv().await.unwrap()[4..8], *b"moof");
        assert_eq!(rx.recv().await.unwrap()[4..8], *b"mdat");
    }

    #[tokio::test]
    async fn test_join_aligns_to_fragment_boundary() {
        let hub = ready_hub();
        hub.set_init_segment(Bytes::from_static(b"INIT"));

        let (sub, mut rx) = hub.register("CAM1");
        hub.gate(&sub).await.unwrap();

        // An mdat from a fragment whose moof predates the join is skipped
        hub.deliver(&media_box(b"mdat", 10));
        hub.deliver(&media_box(b"moof", 10));
        hub.deliver(&media_box(b"mdat", 12));

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"INIT"));
        assert_eq!(rx.recv().await.unwrap()[4..8], *b"moof");
        let mdat = rx.recv().await.unwrap();
        assert_eq!(mdat.len(), 20);
    }

    #[tokio::test]
    async fn test_media_requires_init_gate() {
        let hub = ready_hub();
        let (sub, mut rx) = hub.register("CAM1");
        // Attached but init not yet captured
        sub.attached.store(true, Ordering::SeqCst);

        hub.deliver(&media_box(b"moof", 10));
        assert!(rx.try_recv().is_err());

        hub.set_init_segment(Bytes::from_static(b"INIT"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"INIT"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_times_out_without_pipeline() {
        let flags = Arc::new(StreamFlags::default());
        let hub = StreamHub::new(flags);
        let (sub, _rx) = hub.register("CAM1");

        let result = hub.gate(&sub).await;
        assert!(matches!(result, Err(AppError::Unavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_times_out_without_init() {
        let hub = ready_hub();
        let (sub, _rx) = hub.register("CAM1");

        let result = hub.gate(&sub).await;
        assert!(matches!(result, Err(AppError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_slow_subscriber_dropped() {
        let hub = ready_hub();
        hub.set_init_segment(Bytes::from_static(b"INIT"));

        let (sub, rx) = hub.register("CAM1");
        hub.gate(&sub).await.unwrap();

        // Fill the queue without consuming; first box must be a moof to
        // clear the fragment gate
        for _ in 0..(SUBSCRIBER_QUEUE_BOXES + 8) {
            hub.deliver(&media_box(b"moof", 10));
        }
        assert!(!sub.is_active());
        drop(rx);
    }

    #[tokio::test]
    async fn test_reset_for_new_session_regates() {
        let hub = ready_hub();
        hub.set_init_segment(Bytes::from_static(b"OLD"));

        let (sub, mut rx) = hub.register("CAM1");
        hub.gate(&sub).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"OLD"));

        hub.reset_for_new_session();
        assert!(!sub.has_received_init());

        // Media is withheld until the new init arrives
        hub.deliver(&media_box(b"moof", 10));
        assert!(rx.try_recv().is_err());

        hub.set_init_segment(Bytes::from_static(b"NEW!"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"NEW!"));
    }

    #[tokio::test]
    async fn test_remove_ends_stream() {
        let hub = ready_hub();
        let (sub, mut rx) = hub.register("CAM1");
        assert_eq!(hub.count(), 1);

        let remaining = hub.remove(sub.id);
        assert_eq!(remaining, 0);
        // Channel closed: recv yields None
        assert!(rx.recv().await.is_none());
    }
}
