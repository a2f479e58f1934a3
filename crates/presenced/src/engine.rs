use chrono::{DateTime, Utc};
use presence_core::types::SinkError;
use presence_core::{
    AttendanceCoordinator, AttendanceResult, AttendanceSink, CoordinatorConfig, Diagnostics,
    EmbeddingCache, FaceObservation, Preprocessor, YuvFrame,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::embedder::{Embedder, EmbedderError};
use crate::store::AttendanceStore;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("embedder error: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// One frame from the camera/detector collaborator: the raw planar frame
/// plus the primary face detection.
pub struct FramePacket {
    pub frame: YuvFrame,
    pub face: FaceObservation,
}

/// Messages handled by the engine thread.
enum EngineRequest {
    /// Full pipeline: preprocess → infer → coordinate.
    Frame(Box<FramePacket>),
    /// Skip preprocessing/inference — the caller already holds a raw
    /// embedding (external analyzers, integration tests).
    Detection {
        raw_embedding: Vec<f32>,
        eyes: presence_core::EyeProbs,
    },
    FaceLost,
    ForceReset,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    result_rx: watch::Receiver<AttendanceResult>,
    diag_rx: watch::Receiver<Diagnostics>,
}

impl EngineHandle {
    /// Hand a frame to the engine. Returns false when a frame is already in
    /// flight — the new frame is dropped, not queued, so per-frame latency
    /// stays bounded and the state machine never races itself.
    pub fn submit_frame(&self, packet: FramePacket) -> bool {
        self.try_submit(EngineRequest::Frame(Box::new(packet)))
    }

    /// Hand a pre-extracted embedding to the engine. Same single-flight
    /// drop semantics as [`submit_frame`](Self::submit_frame).
    pub fn submit_detection(&self, raw_embedding: Vec<f32>, eyes: presence_core::EyeProbs) -> bool {
        self.try_submit(EngineRequest::Detection {
            raw_embedding,
            eyes,
        })
    }

    fn try_submit(&self, req: EngineRequest) -> bool {
        match self.tx.try_send(req) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::trace!("frame in flight — dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("engine channel closed — frame dropped");
                false
            }
        }
    }

    /// Visual tracking lost the face. Never dropped: waits for a slot.
    pub async fn face_lost(&self) -> Result<(), EngineError> {
        self.tx
            .send(EngineRequest::FaceLost)
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }

    /// External cancel. Never dropped: waits for a slot.
    pub async fn force_reset(&self) -> Result<(), EngineError> {
        self.tx
            .send(EngineRequest::ForceReset)
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }

    /// Stream of per-frame attendance results for the UI collaborator.
    pub fn results(&self) -> watch::Receiver<AttendanceResult> {
        self.result_rx.clone()
    }

    /// Stream of operator-facing diagnostics. Informational only.
    pub fn diagnostics(&self) -> watch::Receiver<Diagnostics> {
        self.diag_rx.clone()
    }
}

/// Attendance sink backed by the SQLite store. The engine thread is not a
/// runtime worker, so blocking on the handle is safe here.
struct StoreSink {
    store: AttendanceStore,
    runtime: tokio::runtime::Handle,
}

impl AttendanceSink for StoreSink {
    fn record(
        &mut self,
        identity_id: &str,
        display_name: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), SinkError> {
        self.runtime
            .block_on(self.store.record_checkin(identity_id, display_name, timestamp))
            .map(|_id| ())
            .map_err(|e| SinkError(e.to_string()))
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the preprocessor, the embedding model, and the
/// coordinator; the capacity-1 request channel gives the coordinator the
/// serialized, single-flight frame stream it requires. Frames are dropped
/// when busy; control requests are sent with backpressure and never dropped.
pub fn spawn_engine<E: Embedder + 'static>(
    cache: Arc<EmbeddingCache>,
    store: AttendanceStore,
    embedder: E,
    config: CoordinatorConfig,
    runtime: tokio::runtime::Handle,
) -> EngineHandle {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(1);
    let (result_tx, result_rx) = watch::channel(AttendanceResult::Idle);
    let (diag_tx, diag_rx) = watch::channel(Diagnostics::default());

    let sink = StoreSink { store, runtime };
    let mut coordinator = AttendanceCoordinator::new(cache, sink, config);
    let preprocessor = Preprocessor::default();
    let mut embedder = embedder;

    std::thread::Builder::new()
        .name("presence-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Frame(packet) => {
                        let tensor = match preprocessor.run(
                            &packet.frame,
                            packet.face.rect,
                            packet.face.rotation,
                            packet.face.mirrored,
                        ) {
                            Ok(t) => t,
                            Err(e) => {
                                // Recovered per-frame: skip and continue.
                                tracing::debug!(error = %e, "preprocess failed — frame skipped");
                                continue;
                            }
                        };
                        let raw = match embedder.infer(&tensor) {
                            Ok(r) => r,
                            Err(e) => {
                                tracing::warn!(error = %e, "inference failed — frame skipped");
                                continue;
                            }
                        };
                        let result = coordinator.process_frame(&raw, packet.face.eyes);
                        result_tx.send_replace(result);
                        diag_tx.send_replace(coordinator.diagnostics().clone());
                    }
                    EngineRequest::Detection {
                        raw_embedding,
                        eyes,
                    } => {
                        let result = coordinator.process_frame(&raw_embedding, eyes);
                        result_tx.send_replace(result);
                        diag_tx.send_replace(coordinator.diagnostics().clone());
                    }
                    EngineRequest::FaceLost => {
                        coordinator.on_face_lost();
                        result_tx.send_replace(AttendanceResult::Idle);
                        diag_tx.send_replace(coordinator.diagnostics().clone());
                    }
                    EngineRequest::ForceReset => {
                        coordinator.force_reset();
                        result_tx.send_replace(AttendanceResult::Idle);
                        diag_tx.send_replace(coordinator.diagnostics().clone());
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    EngineHandle {
        tx,
        result_rx,
        diag_rx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_core::types::EMBEDDING_DIM;
    use presence_core::{Embedding, EyeProbs, FaceProfile, FaceRect, FaceTensor};
    use std::path::Path;

    /// Deterministic embedder: returns a fixed vector regardless of input.
    struct FixedEmbedder(Vec<f32>);

    impl Embedder for FixedEmbedder {
        fn infer(&mut self, _tensor: &FaceTensor) -> Result<Vec<f32>, EmbedderError> {
            Ok(self.0.clone())
        }
    }

    fn basis(dim: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[dim] = 1.0;
        v
    }

    fn alice() -> FaceProfile {
        FaceProfile {
            identity_id: "alice".into(),
            display_name: "ALICE".into(),
            embedding: Embedding::normalized_lossy(basis(0)),
            metadata: None,
        }
    }

    fn frame_packet(eyes: EyeProbs) -> FramePacket {
        let (w, h) = (64u32, 48u32);
        let y = vec![128u8; (w * h) as usize];
        let uv = vec![128u8; (w * h / 4) as usize];
        FramePacket {
            frame: YuvFrame::i420(y, uv.clone(), uv, w, h).unwrap(),
            face: FaceObservation {
                rect: FaceRect {
                    x: 8,
                    y: 8,
                    width: 32,
                    height: 32,
                },
                rotation: 0,
                mirrored: false,
                eyes,
            },
        }
    }

    async fn await_result(
        rx: &mut watch::Receiver<AttendanceResult>,
    ) -> AttendanceResult {
        tokio::time::timeout(std::time::Duration::from_secs(5), rx.changed())
            .await
            .expect("engine result timed out")
            .expect("engine result channel closed");
        rx.borrow_and_update().clone()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_frame_pipeline_reaches_awaiting_blink() {
        let cache = Arc::new(EmbeddingCache::new());
        cache.refresh(vec![alice()]);
        let store = AttendanceStore::open(Path::new(":memory:")).await.unwrap();

        let handle = spawn_engine(
            cache,
            store,
            FixedEmbedder(basis(0)),
            CoordinatorConfig::default(),
            tokio::runtime::Handle::current(),
        );

        let mut results = handle.results();
        assert!(handle.submit_frame(frame_packet(EyeProbs::both(0.9, 0.9))));
        let result = await_result(&mut results).await;
        assert_eq!(
            result,
            AttendanceResult::AwaitingBlink {
                name: "ALICE".into()
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_detection_path_accepts_and_persists() {
        let cache = Arc::new(EmbeddingCache::new());
        cache.refresh(vec![alice()]);
        let store = AttendanceStore::open(Path::new(":memory:")).await.unwrap();

        let handle = spawn_engine(
            cache,
            store.clone(),
            FixedEmbedder(basis(0)),
            CoordinatorConfig::default(),
            tokio::runtime::Handle::current(),
        );

        let mut results = handle.results();
        let open = EyeProbs::both(0.9, 0.9);
        let closed = EyeProbs::both(0.1, 0.1);

        // Blink, then four qualifying frames. Submissions are paced by
        // waiting for each result, so none are dropped.
        assert!(handle.submit_detection(basis(0), closed));
        await_result(&mut results).await;
        for _ in 0..3 {
            assert!(handle.submit_detection(basis(0), open));
            await_result(&mut results).await;
        }
        assert!(handle.submit_detection(basis(0), open));
        let result = await_result(&mut results).await;
        assert_eq!(
            result,
            AttendanceResult::Accepted {
                name: "ALICE".into()
            }
        );

        let checkins = store.recent_checkins(10).await.unwrap();
        assert_eq!(checkins.len(), 1);
        assert_eq!(checkins[0].identity_id, "alice");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_face_lost_resets_to_idle() {
        let cache = Arc::new(EmbeddingCache::new());
        cache.refresh(vec![alice()]);
        let store = AttendanceStore::open(Path::new(":memory:")).await.unwrap();

        let handle = spawn_engine(
            cache,
            store,
            FixedEmbedder(basis(0)),
            CoordinatorConfig::default(),
            tokio::runtime::Handle::current(),
        );

        let mut results = handle.results();
        handle.submit_detection(basis(0), EyeProbs::both(0.9, 0.9));
        await_result(&mut results).await;

        handle.face_lost().await.unwrap();
        let result = await_result(&mut results).await;
        assert_eq!(result, AttendanceResult::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_burst_of_frames_drops_excess() {
        let cache = Arc::new(EmbeddingCache::new());
        cache.refresh(vec![alice()]);
        let store = AttendanceStore::open(Path::new(":memory:")).await.unwrap();

        let handle = spawn_engine(
            cache,
            store,
            FixedEmbedder(basis(0)),
            CoordinatorConfig::default(),
            tokio::runtime::Handle::current(),
        );

        // Fire a burst without waiting. The channel holds one request, so
        // at least one later submission must report a drop.
        let accepted: Vec<bool> = (0..500)
            .map(|_| handle.submit_detection(basis(0), EyeProbs::both(0.9, 0.9)))
            .collect();
        assert!(accepted[0]);
        assert!(accepted.iter().any(|&a| !a), "expected dropped frames in a burst");
    }
}
