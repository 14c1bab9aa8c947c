use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::error::ProctorError;
use crate::fingerprint::Fingerprint;

/// How a reference variation was derived from the registration image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VariationKind {
    Shift { dx: i32, dy: i32 },
    Rotate { degrees: f32 },
    Brightness { factor: f32 },
}

/// A synthetic reference image generated at registration.
#[derive(Debug, Clone)]
pub struct Variation {
    pub index: u32,
    pub kind: VariationKind,
    pub image: DynamicImage,
}

/// One registered user. Exactly one record exists per `user_id`.
#[derive(Debug, Clone)]
pub struct FaceRecord {
    pub user_id: String,
    pub name: String,
    pub fingerprint: Fingerprint,
    /// Retained working copy of the registration image. `None` only for
    /// records that were stored without one, in which case verification falls
    /// back to fingerprint similarity.
    pub reference: Option<DynamicImage>,
    pub variations: Vec<Variation>,
    pub verification_count: u64,
    pub last_verified_at: Option<DateTime<Utc>>,
    pub is_verified: bool,
    pub registered_at: DateTime<Utc>,
}

impl FaceRecord {
    /// A freshly registered record with zeroed verification stats.
    pub fn new(
        user_id: impl Into<String>,
        name: impl Into<String>,
        fingerprint: Fingerprint,
        reference: Option<DynamicImage>,
        variations: Vec<Variation>,
        registered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            fingerprint,
            reference,
            variations,
            verification_count: 0,
            last_verified_at: None,
            is_verified: false,
            registered_at,
        }
    }
}

/// Whether an upsert created a record or replaced an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Advisory signal carried by a successful monitoring response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Warning {
    FaceMissing,
    MultipleFaces,
    DifferentPerson,
    ExcessiveMovement,
    NotRegistered,
}

impl Warning {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FaceMissing => "face_missing",
            Self::MultipleFaces => "multiple_faces",
            Self::DifferentPerson => "different_person",
            Self::ExcessiveMovement => "excessive_movement",
            Self::NotRegistered => "not_registered",
        }
    }
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured result of a registration, verification or identity check.
///
/// Failures carry the machine-readable `error` code and whether the caller
/// may retry; warnings are advisory and ride on `success: true`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub success: bool,
    #[serde(rename = "match")]
    pub matched: bool,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<Warning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<UpsertOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retryable: bool,
}

impl Verdict {
    /// Successful call with no match decision attached.
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    /// Successful call that reports an advisory warning.
    pub fn warning(warning: Warning, message: impl Into<String>) -> Self {
        Self {
            success: true,
            warning: Some(warning),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>, name: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self.name = Some(name.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl From<&ProctorError> for Verdict {
    fn from(err: &ProctorError) -> Self {
        let confidence = match err {
            ProctorError::IdentityMismatch { confidence, .. } => *confidence,
            _ => 0.0,
        };
        Self {
            success: false,
            confidence,
            message: Some(err.to_string()),
            error: Some(err.kind().to_string()),
            retryable: err.is_retryable(),
            ..Default::default()
        }
    }
}

/// Per-frame result of the movement monitor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementReport {
    pub success: bool,
    pub session_id: String,
    /// Smoothed movement magnitude.
    pub movement: f64,
    pub raw_movement: f64,
    pub avg_movement: f64,
    pub movement_detected: bool,
    /// Value of the consecutive-movement score after this frame, before any
    /// reset caused by a warning.
    pub consecutive_movements: f64,
    pub threshold: f64,
    pub similarity: f64,
    pub history_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_since_last_detection: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<Warning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;

    #[test]
    fn test_verdict_wire_shape() {
        let verdict = Verdict {
            success: true,
            matched: true,
            confidence: 0.82,
            ..Default::default()
        }
        .with_user("u1", "Ada");

        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["match"], true);
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["name"], "Ada");
        assert!(json.get("warning").is_none());
        assert!(json.get("retryable").is_none());
    }

    #[test]
    fn test_failure_verdict_from_error() {
        let err = ProctorError::StorageFailure(StorageError::new("disk full"));
        let verdict = Verdict::from(&err);
        assert!(!verdict.success);
        assert_eq!(verdict.error.as_deref(), Some("storage_failure"));
        assert!(verdict.retryable);

        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(json["retryable"], true);
        assert_eq!(json["error"], "storage_failure");
    }

    #[test]
    fn test_mismatch_verdict_carries_score_only() {
        let err = ProctorError::IdentityMismatch {
            requested: "bob".into(),
            confidence: 0.95,
        };
        let json = serde_json::to_value(Verdict::from(&err)).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["match"], false);
        assert_eq!(json["confidence"], 0.95);
        assert_eq!(json["error"], "identity_mismatch");
        assert_eq!(json["message"], "identity mismatch: face does not belong to bob");
        assert!(json.get("userId").is_none());
    }

    #[test]
    fn test_warning_serializes_snake_case() {
        let verdict = Verdict::warning(Warning::DifferentPerson, "face does not match");
        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(json["warning"], "different_person");
        assert_eq!(json["success"], true);
        assert_eq!(Warning::ExcessiveMovement.to_string(), "excessive_movement");
    }

    #[test]
    fn test_variation_kind_tagged() {
        let json = serde_json::to_string(&VariationKind::Shift { dx: 5, dy: 0 }).unwrap();
        assert_eq!(json, r#"{"type":"shift","dx":5,"dy":0}"#);
        let back: VariationKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, VariationKind::Shift { dx: 5, dy: 0 });
    }

    #[test]
    fn test_movement_report_camel_case() {
        let report = MovementReport {
            success: true,
            session_id: "s1".into(),
            raw_movement: 0.2,
            history_size: 2,
            ..Default::default()
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["rawMovement"], 0.2);
        assert_eq!(json["historySize"], 2);
        assert_eq!(json["movementDetected"], false);
        assert!(json.get("secondsSinceLastDetection").is_none());
    }
}
