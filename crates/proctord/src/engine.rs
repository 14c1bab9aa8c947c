use std::sync::Arc;

use proctor_core::{
    ImagePayload, MovementMonitor, MovementReport, ProctorError, VerificationService, Verdict,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Request(#[from] ProctorError),
    #[error("engine task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl EngineError {
    /// Machine-readable failure code carried by the verdict.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(e) => e.kind(),
            Self::Join(_) => "internal",
        }
    }
}

impl From<&EngineError> for Verdict {
    fn from(err: &EngineError) -> Self {
        match err {
            EngineError::Request(e) => Verdict::from(e),
            EngineError::Join(e) => Verdict {
                success: false,
                message: Some(e.to_string()),
                error: Some("internal".to_string()),
                retryable: true,
                ..Default::default()
            },
        }
    }
}

/// Clone-safe handle to the verification service and the movement monitor.
///
/// Every inbound payload is a base64 image, optionally carrying a
/// `data:<mime>;base64,` prefix.
#[derive(Clone)]
pub struct EngineHandle {
    service: Arc<VerificationService>,
    monitor: Arc<MovementMonitor>,
}

impl EngineHandle {
    pub fn new(service: Arc<VerificationService>, monitor: Arc<MovementMonitor>) -> Self {
        Self { service, monitor }
    }

    pub fn service(&self) -> &VerificationService {
        &self.service
    }

    pub fn monitor(&self) -> &MovementMonitor {
        &self.monitor
    }

    /// Run a CPU-bound service step on the blocking pool.
    async fn blocking<T, F>(&self, step: F) -> Result<T, EngineError>
    where
        F: FnOnce(&VerificationService) -> Result<T, ProctorError> + Send + 'static,
        T: Send + 'static,
    {
        let service = Arc::clone(&self.service);
        Ok(tokio::task::spawn_blocking(move || step(&*service)).await??)
    }

    pub async fn register(
        &self,
        user_id: &str,
        name: &str,
        image: &str,
    ) -> Result<Verdict, EngineError> {
        let (user_id, name, image) = (user_id.to_string(), name.to_string(), image.to_string());
        let record = self
            .blocking(move |svc| {
                svc.prepare_registration(&user_id, &name, ImagePayload::Base64(&image))
            })
            .await?;
        let registration = self.service.save_registration(record).await?;
        Ok(registration.into())
    }

    /// Verify against every record, or against `user_id` when it is non-empty.
    ///
    /// Decoding and scoring run on the blocking pool; only the store
    /// round-trips stay on the runtime.
    pub async fn verify(&self, image: &str, user_id: &str) -> Result<Verdict, EngineError> {
        let user_id = Some(user_id.trim())
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        let image = image.to_string();
        let sample = self
            .blocking(move |svc| {
                let sample = svc.sample(ImagePayload::Base64(&image))?;
                sample.require_single_face()?;
                Ok(sample)
            })
            .await?;

        let candidates = self.service.candidates(user_id.as_deref()).await?;
        let requested = user_id.clone();
        let ranking = self
            .blocking(move |svc| Ok(svc.rank(&sample, requested.as_deref(), candidates)))
            .await?;
        Ok(self.service.conclude(ranking, user_id.as_deref()).await?)
    }

    pub async fn monitor_identity(&self, user_id: &str, image: &str) -> Result<Verdict, EngineError> {
        let user = user_id.to_string();
        let image = image.to_string();
        let sample = self
            .blocking(move |svc| svc.identity_sample(&user, ImagePayload::Base64(&image)))
            .await?;

        // A missing or crowded frame is judged without a store round-trip.
        let record = match sample.face_count {
            Some(n) if n != 1 => None,
            _ => self.service.lookup(user_id).await?,
        };
        let user = user_id.to_string();
        self.blocking(move |svc| Ok(svc.judge_identity(&user, &sample, record)))
            .await
    }

    pub async fn check_faces(&self, image: &str) -> Result<Verdict, EngineError> {
        let image = image.to_string();
        let face_count = self
            .blocking(move |svc| svc.check_faces(ImagePayload::Base64(&image)))
            .await?;
        Ok(Verdict {
            face_count: Some(face_count),
            ..Verdict::ok()
        })
    }

    /// Score one frame of a monitoring session.
    ///
    /// Decoding and comparison run on the blocking pool; the session's own
    /// lock serializes frames of the same session.
    pub async fn detect_movement(
        &self,
        session_id: &str,
        image: &str,
    ) -> Result<MovementReport, EngineError> {
        let missing: Vec<&str> = [
            ("sessionId", session_id.trim().is_empty()),
            ("image", ImagePayload::Base64(image).is_empty()),
        ]
        .into_iter()
        .filter_map(|(field, absent)| absent.then_some(field))
        .collect();
        if !missing.is_empty() {
            return Err(ProctorError::MissingFields(missing.join(", ")).into());
        }

        let monitor = Arc::clone(&self.monitor);
        let session_id = session_id.to_string();
        let image = image.to_string();
        let report = tokio::task::spawn_blocking(move || {
            let frame = ImagePayload::Base64(&image)
                .decode()
                .map_err(ProctorError::from)?;
            Ok::<_, ProctorError>(monitor.detect(&session_id, &frame))
        })
        .await??;
        Ok(report)
    }

    pub fn end_session(&self, session_id: &str) -> bool {
        self.monitor.end_session(session_id)
    }
}

/// Serialize an operation result as a JSON verdict.
///
/// Errors become failure verdicts; storage failures are logged at error
/// level and marked retryable.
pub fn respond<T: Serialize>(operation: &'static str, result: Result<T, EngineError>) -> String {
    let body = match result {
        Ok(value) => serde_json::to_string(&value),
        Err(err) => {
            if matches!(&err, EngineError::Request(e) if e.is_retryable())
                || matches!(err, EngineError::Join(_))
            {
                tracing::error!(operation, error = %err, "request failed");
            } else {
                tracing::debug!(operation, kind = err.kind(), error = %err, "request rejected");
            }
            serde_json::to_string(&Verdict::from(&err))
        }
    };
    body.unwrap_or_else(|e| {
        tracing::error!(operation, error = %e, "response serialization failed");
        r#"{"success":false,"error":"internal","retryable":true}"#.to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use base64::Engine as _;
    use chrono::{DateTime, Utc};
    use image::{DynamicImage, GrayImage, Luma};
    use proctor_core::{
        ComparatorKind, FaceRecord, IdentityStore, InMemorySessionStore, MemoryIdentityStore,
        MonitorConfig, SessionPolicy, StorageError, UpsertOutcome, VerifyConfig,
    };
    use proctor_core::SimilarityEngine;
    use serde_json::Value;
    use std::sync::Mutex;
    use std::time::Duration;

    fn b64(image: &DynamicImage) -> String {
        let png = proctor_core::codec::encode_png(image).unwrap();
        base64::engine::general_purpose::STANDARD.encode(png)
    }

    fn scene(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_fn(width, height, |x, y| {
            let dx = x as i64 - width as i64 / 2;
            let dy = y as i64 - height as i64 / 2;
            Luma([((dx * dx + dy * dy) / 8 % 256) as u8])
        }))
    }

    fn engine_with(store: Arc<dyn IdentityStore>) -> EngineHandle {
        let comparator = ComparatorKind::default().build();
        let service = VerificationService::new(store, comparator.clone(), VerifyConfig::default());
        let sessions = Arc::new(InMemorySessionStore::new(SessionPolicy::default()));
        let monitor = MovementMonitor::new(comparator, sessions, MonitorConfig::default());
        EngineHandle::new(Arc::new(service), Arc::new(monitor))
    }

    fn engine() -> EngineHandle {
        engine_with(Arc::new(MemoryIdentityStore::new()))
    }

    fn json(body: &str) -> Value {
        serde_json::from_str(body).unwrap()
    }

    struct DownStore;

    #[async_trait]
    impl IdentityStore for DownStore {
        async fn get(&self, _: &str) -> Result<Option<FaceRecord>, StorageError> {
            Err(StorageError::new("database is locked"))
        }
        async fn put(&self, _: &str, _: &FaceRecord) -> Result<UpsertOutcome, StorageError> {
            Err(StorageError::new("database is locked"))
        }
        async fn all(&self) -> Result<Vec<FaceRecord>, StorageError> {
            Err(StorageError::new("database is locked"))
        }
        async fn record_verification(&self, _: &str, _: DateTime<Utc>) -> Result<(), StorageError> {
            Err(StorageError::new("database is locked"))
        }
    }

    #[tokio::test]
    async fn test_register_then_verify_json() {
        let engine = engine();
        let image = b64(&scene(160, 160));

        let body = json(&respond("register", engine.register("u1", "Ada", &image).await));
        assert_eq!(body["success"], true);
        assert_eq!(body["outcome"], "inserted");

        let body = json(&respond("verify", engine.verify(&image, "").await));
        assert_eq!(body["success"], true);
        assert_eq!(body["match"], true);
        assert_eq!(body["userId"], "u1");
        assert_eq!(body["confidence"], 1.0);
    }

    #[tokio::test]
    async fn test_failures_become_verdicts() {
        let engine = engine();

        let body = json(&respond("register", engine.register("", "Ada", "").await));
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "missing_fields");
        assert!(body.get("retryable").is_none());

        let body = json(&respond("verify", engine.verify("not base64!", "").await));
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "invalid_image");

        let body = json(&respond("check_faces", engine.check_faces("AAAA").await));
        assert_eq!(body["error"], "unsupported");
    }

    #[tokio::test]
    async fn test_storage_failure_is_retryable() {
        let engine = engine_with(Arc::new(DownStore));
        let image = b64(&scene(160, 160));

        let body = json(&respond("verify", engine.verify(&image, "").await));
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "storage_failure");
        assert_eq!(body["retryable"], true);
    }

    /// Comparator that blocks its first call until the runtime thread
    /// answers. Scoring on the runtime thread itself would time out at 0.0.
    struct Handshake {
        started: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
        proceed: Mutex<Option<std::sync::mpsc::Receiver<()>>>,
    }

    impl SimilarityEngine for Handshake {
        fn name(&self) -> &'static str {
            "handshake"
        }

        fn compare(&self, _: &DynamicImage, _: &DynamicImage) -> f64 {
            let Some(started) = self.started.lock().unwrap().take() else {
                return 1.0;
            };
            let _ = started.send(());
            let proceed = self.proceed.lock().unwrap().take().unwrap();
            match proceed.recv_timeout(Duration::from_secs(5)) {
                Ok(()) => 1.0,
                Err(_) => 0.0,
            }
        }
    }

    #[tokio::test]
    async fn test_verify_scores_off_the_runtime_thread() {
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (proceed_tx, proceed_rx) = std::sync::mpsc::channel();
        let comparator: Arc<dyn SimilarityEngine> = Arc::new(Handshake {
            started: Mutex::new(Some(started_tx)),
            proceed: Mutex::new(Some(proceed_rx)),
        });
        let store = Arc::new(MemoryIdentityStore::new());
        let service = VerificationService::new(store, comparator.clone(), VerifyConfig::default());
        let sessions = Arc::new(InMemorySessionStore::new(SessionPolicy::default()));
        let monitor = MovementMonitor::new(comparator, sessions, MonitorConfig::default());
        let engine = EngineHandle::new(Arc::new(service), Arc::new(monitor));

        let reference = b64(&scene(160, 160));
        engine.register("u1", "Ada", &reference).await.unwrap();

        let other = b64(&scene(150, 170));
        let task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.verify(&other, "u1").await })
        };
        started_rx.await.unwrap();
        proceed_tx.send(()).unwrap();

        let verdict = task.await.unwrap().unwrap();
        assert!(verdict.matched);
        assert_eq!(verdict.confidence, 1.0);
        assert_eq!(verdict.user_id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn test_monitor_identity_on_engine() {
        let engine = engine();
        let image = b64(&scene(160, 160));

        let body = json(&respond(
            "monitor_identity",
            engine.monitor_identity("u1", &image).await,
        ));
        assert_eq!(body["success"], true);
        assert_eq!(body["warning"], "not_registered");

        engine.register("u1", "Ada", &image).await.unwrap();
        let body = json(&respond(
            "monitor_identity",
            engine.monitor_identity("u1", &image).await,
        ));
        assert_eq!(body["match"], true);
        assert_eq!(body["userId"], "u1");

        let body = json(&respond(
            "monitor_identity",
            engine.monitor_identity("", &image).await,
        ));
        assert_eq!(body["error"], "missing_fields");
    }

    #[tokio::test]
    async fn test_detect_movement_report() {
        let engine = engine();
        let image = b64(&scene(64, 64));

        let first = engine.detect_movement("s1", &image).await.unwrap();
        assert!(first.success);
        assert_eq!(first.history_size, 0);

        let second = engine.detect_movement("s1", &image).await.unwrap();
        assert!(second.raw_movement < 1e-9);
        assert_eq!(second.history_size, 1);

        let body = json(&respond("detect_movement", Ok::<_, EngineError>(second)));
        assert_eq!(body["sessionId"], "s1");
        assert_eq!(body["movementDetected"], false);

        assert!(engine.end_session("s1"));
        assert!(!engine.end_session("s1"));
    }

    #[tokio::test]
    async fn test_detect_movement_rejects_missing_fields() {
        let engine = engine();
        let err = engine.detect_movement(" ", "").await.unwrap_err();
        assert_eq!(err.kind(), "missing_fields");
        assert!(err.to_string().contains("sessionId, image"));

        let err = engine.detect_movement("s1", "@@@").await.unwrap_err();
        assert_eq!(err.kind(), "invalid_image");
        assert!(engine.monitor().sessions().is_empty());
    }
}
