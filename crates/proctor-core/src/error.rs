use thiserror::Error;

use crate::codec::CodecError;

/// Failure reported by an [`IdentityStore`](crate::store::IdentityStore) backend.
///
/// Backends convert their own error types into this at the trait seam so the
/// core never depends on a particular database crate.
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct StorageError(pub String);

impl StorageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Request-level failure taxonomy.
///
/// Every variant except [`ProctorError::StorageFailure`] is terminal for the
/// request that produced it and requires the caller to correct its input.
#[derive(Error, Debug)]
pub enum ProctorError {
    #[error("missing required fields: {0}")]
    MissingFields(String),
    #[error("invalid image data: {0}")]
    InvalidImage(String),
    #[error("image is too small ({width}x{height}, minimum {min}px per side)")]
    ImageTooSmall { width: u32, height: u32, min: u32 },
    #[error("no face detected in the image")]
    NoFaceDetected,
    #[error("multiple faces detected ({0}); provide an image with exactly one face")]
    MultipleFacesDetected(usize),
    #[error("{}", no_face_message(.0))]
    NoRegisteredFace(Option<String>),
    /// The submitted face matches another registered user better than the one
    /// claimed. The other user's identity stays out of the message.
    #[error("identity mismatch: face does not belong to {requested}")]
    IdentityMismatch { requested: String, confidence: f64 },
    #[error("storage failure: {0}")]
    StorageFailure(#[from] StorageError),
    #[error("{0} is not supported in this deployment mode")]
    Unsupported(&'static str),
}

fn no_face_message(user: &Option<String>) -> String {
    match user {
        Some(user) => format!("no face registered for user {user}"),
        None => "no registered faces found".to_string(),
    }
}

impl ProctorError {
    /// Stable machine-readable code for this failure.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingFields(_) => "missing_fields",
            Self::InvalidImage(_) => "invalid_image",
            Self::ImageTooSmall { .. } => "image_too_small",
            Self::NoFaceDetected => "no_face_detected",
            Self::MultipleFacesDetected(_) => "multiple_faces_detected",
            Self::NoRegisteredFace(_) => "no_registered_face",
            Self::IdentityMismatch { .. } => "identity_mismatch",
            Self::StorageFailure(_) => "storage_failure",
            Self::Unsupported(_) => "unsupported",
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageFailure(_))
    }
}

impl From<CodecError> for ProctorError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::TooSmall { width, height, min } => {
                Self::ImageTooSmall { width, height, min }
            }
            other => Self::InvalidImage(other.to_string()),
        }
    }
}
