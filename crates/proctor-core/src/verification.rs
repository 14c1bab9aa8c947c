use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use image::DynamicImage;

use crate::analyzer::{EmbeddingComparator, FaceAnalyzer, EMBEDDING_THRESHOLD};
use crate::codec::{require_min_size, ImagePayload, MIN_REGISTRATION_EDGE};
use crate::error::ProctorError;
use crate::fingerprint::Fingerprint;
use crate::similarity::SimilarityEngine;
use crate::store::IdentityStore;
use crate::types::{FaceRecord, UpsertOutcome, Verdict, Warning};
use crate::variations;

/// Which records a targeted verification is scored against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentityCheck {
    /// Score every record; a best match belonging to someone other than the
    /// requested user is rejected as an identity mismatch.
    #[default]
    Global,
    /// Score only the requested user's record.
    Target,
}

impl FromStr for IdentityCheck {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "global" => Ok(Self::Global),
            "target" => Ok(Self::Target),
            other => Err(format!("unknown identity check '{other}' (expected 'global' or 'target')")),
        }
    }
}

impl fmt::Display for IdentityCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Global => "global",
            Self::Target => "target",
        })
    }
}

#[derive(Debug, Clone)]
pub struct VerifyConfig {
    /// Minimum best similarity for a verification match.
    pub threshold: f64,
    /// Minimum fingerprint similarity for an identity-monitoring match.
    pub monitor_threshold: f64,
    pub identity_check: IdentityCheck,
    /// Synthesize shifted, rotated and brightness-scaled references.
    pub generate_variations: bool,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            monitor_threshold: 0.8,
            identity_check: IdentityCheck::Global,
            generate_variations: true,
        }
    }
}

/// Result of a successful registration.
#[derive(Debug, Clone)]
pub struct Registration {
    pub user_id: String,
    pub name: String,
    pub outcome: UpsertOutcome,
    pub variations: usize,
}

impl From<Registration> for Verdict {
    fn from(reg: Registration) -> Self {
        let message = match reg.outcome {
            UpsertOutcome::Inserted => "face registered",
            UpsertOutcome::Updated => "face registration updated",
        };
        Self {
            outcome: Some(reg.outcome),
            ..Verdict::ok()
        }
        .with_user(reg.user_id, reg.name)
        .with_message(message)
    }
}

/// A decoded sample image, ready for scoring.
#[derive(Debug, Clone)]
pub struct Sample {
    pub fingerprint: Fingerprint,
    /// Grayscale working copy used for comparison.
    pub image: DynamicImage,
    /// Faces found by the analyzer; `None` without one.
    pub face_count: Option<usize>,
}

impl Sample {
    /// Reject samples without exactly one face. Always passes without an
    /// analyzer.
    pub fn require_single_face(&self) -> Result<(), ProctorError> {
        match self.face_count {
            None | Some(1) => Ok(()),
            Some(0) => Err(ProctorError::NoFaceDetected),
            Some(n) => Err(ProctorError::MultipleFacesDetected(n)),
        }
    }
}

/// Best candidate of a verification scan.
#[derive(Debug, Clone)]
pub struct Ranking {
    /// Highest-scoring record with a score above zero.
    pub best: Option<(FaceRecord, f64)>,
    pub scanned: usize,
}

/// Registration, verification and identity monitoring over an
/// [`IdentityStore`].
///
/// Each operation is a sequence of synchronous CPU steps ([`Self::sample`],
/// [`Self::prepare_registration`], [`Self::rank`], [`Self::judge_identity`])
/// and async store steps. The `async` convenience methods chain them inline;
/// callers on a shared runtime can run the CPU steps on a blocking pool.
pub struct VerificationService {
    store: Arc<dyn IdentityStore>,
    engine: Arc<dyn SimilarityEngine>,
    analyzer: Option<Arc<dyn FaceAnalyzer>>,
    config: VerifyConfig,
}

impl VerificationService {
    /// Degraded mode: statistical image comparison only.
    pub fn new(
        store: Arc<dyn IdentityStore>,
        engine: Arc<dyn SimilarityEngine>,
        config: VerifyConfig,
    ) -> Self {
        Self {
            store,
            engine,
            analyzer: None,
            config,
        }
    }

    /// Switch to full-feature mode: face-count gating and embedding scoring.
    /// Both thresholds drop to the embedding threshold.
    pub fn with_analyzer(mut self, analyzer: Arc<dyn FaceAnalyzer>) -> Self {
        self.engine = Arc::new(EmbeddingComparator::new(Arc::clone(&analyzer)));
        self.analyzer = Some(analyzer);
        self.config.threshold = EMBEDDING_THRESHOLD;
        self.config.monitor_threshold = EMBEDDING_THRESHOLD;
        self
    }

    pub fn config(&self) -> &VerifyConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<dyn SimilarityEngine> {
        &self.engine
    }

    pub fn has_analyzer(&self) -> bool {
        self.analyzer.is_some()
    }

    /// Register or re-register a user's reference face.
    pub async fn register(
        &self,
        user_id: &str,
        name: &str,
        image: ImagePayload<'_>,
    ) -> Result<Registration, ProctorError> {
        let record = self.prepare_registration(user_id, name, image)?;
        self.save_registration(record).await
    }

    /// Validate and decode a registration and build its record, variations
    /// included. No store access.
    pub fn prepare_registration(
        &self,
        user_id: &str,
        name: &str,
        image: ImagePayload<'_>,
    ) -> Result<FaceRecord, ProctorError> {
        require_fields(&[
            ("userId", user_id.trim().is_empty()),
            ("name", name.trim().is_empty()),
            ("image", image.is_empty()),
        ])?;

        let decoded = image.decode()?;
        require_min_size(&decoded, MIN_REGISTRATION_EDGE)?;
        let sample = self.sample_decoded(&decoded)?;
        sample.require_single_face()?;

        let variations = if self.config.generate_variations {
            variations::generate(&sample.image)
        } else {
            Vec::new()
        };

        Ok(FaceRecord::new(
            user_id,
            name,
            sample.fingerprint,
            Some(sample.image),
            variations,
            Utc::now(),
        ))
    }

    /// Upsert a prepared record.
    pub async fn save_registration(&self, record: FaceRecord) -> Result<Registration, ProctorError> {
        let outcome = self.store.put(&record.user_id, &record).await?;
        let variations = record.variations.len();

        tracing::info!(user_id = %record.user_id, ?outcome, variations, "face registered");
        Ok(Registration {
            user_id: record.user_id,
            name: record.name,
            outcome,
            variations,
        })
    }

    /// Find the best-matching registered face for a sample image.
    ///
    /// With `user_id` and [`IdentityCheck::Global`], a different user that
    /// strictly outscores the requested one fails the request with
    /// [`ProctorError::IdentityMismatch`] whatever the score.
    pub async fn verify(
        &self,
        image: ImagePayload<'_>,
        user_id: Option<&str>,
    ) -> Result<Verdict, ProctorError> {
        let user_id = user_id.map(str::trim).filter(|u| !u.is_empty());
        let sample = self.sample(image)?;
        sample.require_single_face()?;

        let candidates = self.candidates(user_id).await?;
        let ranking = self.rank(&sample, user_id, candidates);
        self.conclude(ranking, user_id).await
    }

    /// Decode an image into a [`Sample`], counting faces when an analyzer is
    /// configured.
    pub fn sample(&self, image: ImagePayload<'_>) -> Result<Sample, ProctorError> {
        require_fields(&[("image", image.is_empty())])?;
        let decoded = image.decode()?;
        self.sample_decoded(&decoded)
    }

    /// Records a verification is scored against.
    pub async fn candidates(&self, user_id: Option<&str>) -> Result<Vec<FaceRecord>, ProctorError> {
        match (user_id, self.config.identity_check) {
            (None, _) => Ok(self.store.all().await?),
            (Some(user), IdentityCheck::Target) => match self.store.get(user).await? {
                Some(record) => Ok(vec![record]),
                None => Err(ProctorError::NoRegisteredFace(Some(user.to_string()))),
            },
            (Some(user), IdentityCheck::Global) => {
                let all = self.store.all().await?;
                if !all.is_empty() && !all.iter().any(|r| r.user_id == user) {
                    return Err(ProctorError::NoRegisteredFace(Some(user.to_string())));
                }
                Ok(all)
            }
        }
    }

    /// Score every candidate and keep the best one.
    ///
    /// Only scores above zero count. On a tie the requested user wins, so the
    /// result never depends on candidate order.
    pub fn rank(&self, sample: &Sample, user_id: Option<&str>, candidates: Vec<FaceRecord>) -> Ranking {
        let scanned = candidates.len();
        let mut best: Option<(FaceRecord, f64)> = None;
        for record in candidates {
            let score = self.score(sample, &record);
            tracing::debug!(candidate = %record.user_id, score, "candidate scored");
            let better = match &best {
                None => score > 0.0,
                Some((_, top)) => {
                    score > *top || (score == *top && user_id == Some(record.user_id.as_str()))
                }
            };
            if better {
                best = Some((record, score));
            }
        }
        Ranking { best, scanned }
    }

    /// Apply the decision rule to a ranking and record a successful match.
    pub async fn conclude(
        &self,
        ranking: Ranking,
        user_id: Option<&str>,
    ) -> Result<Verdict, ProctorError> {
        if ranking.scanned == 0 {
            return Err(ProctorError::NoRegisteredFace(None));
        }
        let Some((best_record, confidence)) = ranking.best else {
            return Ok(not_recognized(0.0));
        };

        if let Some(requested) = user_id {
            if best_record.user_id != requested {
                tracing::warn!(
                    requested,
                    matched = %best_record.user_id,
                    confidence,
                    "identity mismatch"
                );
                return Err(ProctorError::IdentityMismatch {
                    requested: requested.to_string(),
                    confidence,
                });
            }
        }

        if confidence < self.config.threshold {
            tracing::info!(confidence, threshold = self.config.threshold, "verify: no match");
            return Ok(not_recognized(confidence));
        }

        self.store
            .record_verification(&best_record.user_id, Utc::now())
            .await?;
        tracing::info!(user_id = %best_record.user_id, confidence, "verify complete");

        Ok(Verdict {
            matched: true,
            confidence,
            ..Verdict::ok()
        }
        .with_user(best_record.user_id, best_record.name))
    }

    /// Per-frame check that the registered user is still the one on camera.
    ///
    /// Absent faces, multiple faces, unknown users and a different person are
    /// all reported as warnings on a successful verdict.
    pub async fn monitor_identity(
        &self,
        user_id: &str,
        image: ImagePayload<'_>,
    ) -> Result<Verdict, ProctorError> {
        let sample = self.identity_sample(user_id, image)?;
        if let Some(verdict) = face_count_warning(user_id, &sample) {
            return Ok(verdict);
        }
        let record = self.lookup(user_id).await?;
        Ok(self.judge_identity(user_id, &sample, record))
    }

    /// The stored record for `user_id`, if any.
    pub async fn lookup(&self, user_id: &str) -> Result<Option<FaceRecord>, ProctorError> {
        Ok(self.store.get(user_id).await?)
    }

    /// Validate and decode an identity-monitoring frame.
    pub fn identity_sample(&self, user_id: &str, image: ImagePayload<'_>) -> Result<Sample, ProctorError> {
        require_fields(&[
            ("userId", user_id.trim().is_empty()),
            ("image", image.is_empty()),
        ])?;
        self.sample(image)
    }

    /// Score a monitoring sample against the user's record, if any.
    pub fn judge_identity(&self, user_id: &str, sample: &Sample, record: Option<FaceRecord>) -> Verdict {
        if let Some(verdict) = face_count_warning(user_id, sample) {
            return verdict;
        }
        let Some(record) = record else {
            return Verdict {
                user_id: Some(user_id.to_string()),
                ..Verdict::warning(Warning::NotRegistered, "no face registered for this user")
            };
        };

        let confidence = match (&self.analyzer, &record.reference) {
            (Some(_), Some(reference)) => self.engine.compare(&sample.image, reference),
            _ => sample.fingerprint.similarity(&record.fingerprint),
        };

        if confidence >= self.config.monitor_threshold {
            return Verdict {
                matched: true,
                confidence,
                ..Verdict::ok()
            }
            .with_user(record.user_id, record.name);
        }

        tracing::warn!(user_id, confidence, "different person on camera");
        Verdict {
            confidence,
            ..Verdict::warning(Warning::DifferentPerson, "face does not match the registered user")
        }
        .with_user(record.user_id, record.name)
    }

    /// Number of faces in an image. Requires a [`FaceAnalyzer`].
    pub fn check_faces(&self, image: ImagePayload<'_>) -> Result<usize, ProctorError> {
        if self.analyzer.is_none() {
            return Err(ProctorError::Unsupported("face detection"));
        }
        Ok(self.sample(image)?.face_count.unwrap_or_default())
    }

    fn sample_decoded(&self, decoded: &DynamicImage) -> Result<Sample, ProctorError> {
        let face_count = match &self.analyzer {
            Some(analyzer) => Some(
                analyzer
                    .detect(decoded)
                    .map_err(|e| ProctorError::InvalidImage(e.to_string()))?
                    .len(),
            ),
            None => None,
        };
        Ok(Sample {
            fingerprint: Fingerprint::of(decoded),
            image: variations::working_copy(decoded),
            face_count,
        })
    }

    /// Best similarity of the sample against one record.
    fn score(&self, sample: &Sample, record: &FaceRecord) -> f64 {
        if sample.fingerprint == record.fingerprint {
            return 1.0;
        }
        let Some(reference) = &record.reference else {
            return sample.fingerprint.similarity(&record.fingerprint);
        };
        record
            .variations
            .iter()
            .map(|v| self.engine.compare(&sample.image, &v.image))
            .fold(self.engine.compare(&sample.image, reference), f64::max)
    }
}

/// Below-threshold verification: the call worked, nobody matched.
fn not_recognized(confidence: f64) -> Verdict {
    Verdict {
        confidence,
        ..Verdict::ok()
    }
    .with_message("face not recognized")
}

fn face_count_warning(user_id: &str, sample: &Sample) -> Option<Verdict> {
    match sample.face_count? {
        0 => Some(Verdict::warning(Warning::FaceMissing, "no face detected")),
        1 => None,
        n => {
            tracing::warn!(user_id, faces = n, "multiple faces during monitoring");
            Some(Verdict {
                face_count: Some(n),
                ..Verdict::warning(Warning::MultipleFaces, format!("{n} faces detected"))
            })
        }
    }
}

fn require_fields(fields: &[(&str, bool)]) -> Result<(), ProctorError> {
    let missing: Vec<&str> = fields
        .iter()
        .filter(|(_, absent)| *absent)
        .map(|(name, _)| *name)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ProctorError::MissingFields(missing.join(", ")))
    }
}
