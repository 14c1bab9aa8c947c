//! proctor-core: face registration, verification and movement monitoring
//! for proctored exam sessions.
//!
//! Runs without any trained model: identity is scored with a perceptual
//! fingerprint and a normalized, region-tiled image comparison. A
//! [`FaceAnalyzer`] can be plugged in for detection and embedding scoring.

pub mod analyzer;
pub mod codec;
pub mod error;
pub mod fingerprint;
pub mod movement;
pub mod session;
pub mod similarity;
pub mod store;
pub mod types;
pub mod variations;
pub mod verification;

pub use analyzer::{EmbeddingComparator, FaceAnalyzer, FaceRegion};
pub use codec::ImagePayload;
pub use error::{ProctorError, StorageError};
pub use fingerprint::Fingerprint;
pub use movement::{MonitorConfig, MovementMonitor};
pub use session::{InMemorySessionStore, SessionPolicy, SessionStore};
pub use similarity::{ComparatorKind, SimilarityEngine};
pub use store::{IdentityStore, MemoryIdentityStore};
pub use types::{FaceRecord, MovementReport, UpsertOutcome, Variation, VariationKind, Verdict, Warning};
pub use verification::{
    IdentityCheck, Sample, Ranking, Registration, VerificationService, VerifyConfig,
};
