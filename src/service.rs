use serde::Serialize;
use std::{io, path::PathBuf, sync::Arc, time::Duration};
use uuid::Uuid;

use crate::{
    config::ServiceCfg,
    error::{CompareError, SimilarityError},
    events::{CompareEvent, EventSink, Metric, Stage},
    hasher,
    similarity::{KeypointOutcome, SimilarityEngine},
    upload::{CompareRequest, ScratchSet, Slot, StoredAsset, UploadGateway},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict { Identical, DifferentOrForged }

impl Verdict {
    pub fn from_digests(a: &str, b: &str) -> Self {
        if a == b { Verdict::Identical } else { Verdict::DifferentOrForged }
    }

    pub fn message(self) -> &'static str {
        match self {
            Verdict::Identical => "Images are identical.",
            Verdict::DifferentOrForged => "Images are different or forged.",
        }
    }
}

/// Outcome of one request. The verdict comes from the digests alone; the
/// perceptual metrics are informational and may individually have failed.
#[derive(Debug)]
pub struct ComparisonResult {
    pub request_id: Uuid,
    pub hash1: String,
    pub hash2: String,
    pub verdict: Verdict,
    /// `None` when SSIM is disabled.
    pub ssim: Option<Result<f64, SimilarityError>>,
    /// `None` when keypoint matching is disabled.
    pub keypoints: Option<Result<KeypointOutcome, SimilarityError>>,
}

pub struct CompareService {
    cfg: ServiceCfg,
    gateway: UploadGateway,
    engine: Arc<SimilarityEngine>,
    events: Arc<dyn EventSink>,
}

enum Blocking<T> {
    Done(T),
    TimedOut,
    Panicked(String),
}

async fn blocking<T, F>(limit: Duration, f: F) -> Blocking<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    match tokio::time::timeout(limit, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(v)) => Blocking::Done(v),
        Ok(Err(e)) => Blocking::Panicked(e.to_string()),
        Err(_) => Blocking::TimedOut,
    }
}

impl CompareService {
    pub fn new(cfg: ServiceCfg, events: Arc<dyn EventSink>) -> Self {
        Self {
            gateway: UploadGateway::new(&cfg),
            engine: Arc::new(SimilarityEngine::new(cfg.keypoints.clone())),
            cfg,
            events,
        }
    }

    pub fn config(&self) -> &ServiceCfg { &self.cfg }

    /// Validates, stores, hashes and compares the two uploads. Scratch files
    /// are removed before this returns, whatever the outcome.
    pub async fn compare(&self, req: CompareRequest) -> Result<ComparisonResult, CompareError> {
        let request_id = Uuid::new_v4();
        let mut stage = Stage::ReceivingUpload;
        self.enter(request_id, &mut stage, Stage::ReceivingUpload);

        let mut scratch = ScratchSet::new();
        let outcome = self.run(request_id, &mut stage, req, &mut scratch).await;
        let failed_at = stage;

        if !scratch.is_empty() {
            self.enter(request_id, &mut stage, Stage::CleaningUp);
            for (path, e) in scratch.cleanup().await {
                self.events.emit(CompareEvent::CleanupWarning { request_id, path, error: e.to_string() });
            }
        }

        self.enter(request_id, &mut stage, Stage::Responding);
        match &outcome {
            Ok(r) => self.events.emit(CompareEvent::Succeeded { request_id, identical: r.verdict == Verdict::Identical }),
            Err(e) => self.events.emit(CompareEvent::Failed { request_id, stage: failed_at, error: e.to_string() }),
        }
        outcome
    }

    async fn run(
        &self,
        request_id: Uuid,
        stage: &mut Stage,
        req: CompareRequest,
        scratch: &mut ScratchSet,
    ) -> Result<ComparisonResult, CompareError> {
        self.enter(request_id, stage, Stage::Validating);
        let [up1, up2] = self.gateway.validate(req)?;

        self.enter(request_id, stage, Stage::Persisting);
        let a1 = self.gateway.persist(up1, scratch).await?;
        self.persisted(request_id, &a1);
        let a2 = self.gateway.persist(up2, scratch).await?;
        self.persisted(request_id, &a2);

        let limit = Duration::from_millis(self.cfg.compute_timeout_ms);
        let (p1, p2) = (a1.path.clone(), a2.path.clone());

        self.enter(request_id, stage, Stage::Hashing);
        let hash1 = self.digest(limit, Slot::Image1, p1.clone());
        let hash2 = self.digest(limit, Slot::Image2, p2.clone());

        let metrics = self.cfg.metrics.clone();
        if metrics.ssim || metrics.keypoints {
            self.enter(request_id, stage, Stage::Comparing);
        }
        let ssim = async {
            if !metrics.ssim { return None; }
            let (engine, a, b) = (self.engine.clone(), p1.clone(), p2.clone());
            Some(metric(limit, blocking(limit, move || engine.structural_similarity(&a, &b)).await))
        };
        let keypoints = async {
            if !metrics.keypoints { return None; }
            let (engine, a, b) = (self.engine.clone(), p1.clone(), p2.clone());
            Some(metric(limit, blocking(limit, move || engine.keypoint_matches(&a, &b)).await))
        };

        let (hash1, hash2, ssim, keypoints) = tokio::join!(hash1, hash2, ssim, keypoints);
        let (hash1, hash2) = (hash1?, hash2?);
        self.events.emit(CompareEvent::Hashed { request_id, hash1: hash1.clone(), hash2: hash2.clone() });

        if let Some(Err(e)) = &ssim {
            self.events.emit(CompareEvent::MetricFailed { request_id, metric: Metric::Ssim, error: e.to_string() });
        }
        if let Some(Err(e)) = &keypoints {
            self.events.emit(CompareEvent::MetricFailed { request_id, metric: Metric::Keypoints, error: e.to_string() });
        }

        Ok(ComparisonResult {
            request_id,
            verdict: Verdict::from_digests(&hash1, &hash2),
            hash1,
            hash2,
            ssim,
            keypoints,
        })
    }

    async fn digest(&self, limit: Duration, slot: Slot, path: PathBuf) -> Result<String, CompareError> {
        match blocking(limit, move || hasher::digest(&path)).await {
            Blocking::Done(Ok(h)) => Ok(h),
            Blocking::Done(Err(source)) => Err(CompareError::Hash { slot, source }),
            Blocking::TimedOut => Err(CompareError::Timeout(limit)),
            Blocking::Panicked(msg) => Err(CompareError::Hash { slot, source: io::Error::other(msg) }),
        }
    }

    fn enter(&self, request_id: Uuid, current: &mut Stage, next: Stage) {
        *current = next;
        self.events.emit(CompareEvent::Stage { request_id, stage: next });
    }

    fn persisted(&self, request_id: Uuid, asset: &StoredAsset) {
        self.events.emit(CompareEvent::Persisted {
            request_id,
            slot: asset.slot,
            path: asset.path.clone(),
            bytes: asset.size,
            sniffed: asset.sniffed.map(|f| format!("{f:?}").to_lowercase()),
            format_mismatch: asset.format_mismatch(),
        });
    }
}

fn metric<T>(limit: Duration, r: Blocking<Result<T, SimilarityError>>) -> Result<T, SimilarityError> {
    match r {
        Blocking::Done(v) => v,
        Blocking::TimedOut => Err(SimilarityError::Timeout(limit)),
        Blocking::Panicked(msg) => Err(SimilarityError::Worker(msg)),
    }
}
