use std::{path::PathBuf, time::Duration};
use thiserror::Error;

use crate::upload::Slot;

/// Client-side problems with the upload. Raised before any file is written.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Please upload two images.")]
    MissingParts,

    #[error("No selected file(s).")]
    EmptyFilename,

    #[error("Invalid file type. Allowed types are {allowed}.")]
    InvalidFileType { allowed: String },

    #[error("Upload exceeds the maximum size of {limit} bytes.")]
    TooLarge { limit: u64 },
}

/// Failures of a whole comparison request.
#[derive(Error, Debug)]
pub enum CompareError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Writing or verifying a scratch file failed.
    #[error("{message}")]
    Storage {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to hash {slot}.")]
    Hash {
        slot: Slot,
        #[source]
        source: std::io::Error,
    },

    #[error("Comparison timed out after {0:?}.")]
    Timeout(Duration),
}

impl CompareError {
    pub fn storage(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Storage { message: message.into(), source }
    }

    /// Stable machine-readable code for the JSON error body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(ValidationError::MissingParts) => "missing_images",
            Self::Validation(ValidationError::EmptyFilename) => "empty_filename",
            Self::Validation(ValidationError::InvalidFileType { .. }) => "invalid_file_type",
            Self::Validation(ValidationError::TooLarge { .. }) => "payload_too_large",
            Self::Storage { .. } => "storage_error",
            Self::Hash { .. } => "hash_error",
            Self::Timeout(_) => "timeout",
        }
    }
}

/// Why a perceptual metric could not be computed.
#[derive(Error, Debug)]
pub enum SimilarityError {
    #[error("could not read image: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not decode image: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("image is {width}x{height}; at least {min}x{min} is required")]
    TooSmall { width: u32, height: u32, min: u32 },

    #[error("images differ in size: {a:?} vs {b:?}")]
    DimensionMismatch { a: (u32, u32), b: (u32, u32) },

    #[error("computation timed out after {0:?}")]
    Timeout(Duration),

    #[error("worker failed: {0}")]
    Worker(String),
}
