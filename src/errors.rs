use crate::{
    metadata::{MetadataError, SWORD_CONTEXT},
    models::{deposit::DepositError, tags::TagError},
    packaging::PackagingError,
    services::{staging_service::StagingError, storage_service::StorageError},
};
use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{SecondsFormat, Utc};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// HTTP-facing error, one variant per SWORD error type.
///
/// Rendered as a JSON-LD error document with the matching status code.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    ContentMalformed(String),
    #[error("{0}")]
    ContentTypeNotAcceptable(String),
    #[error("{0}")]
    MetadataFormatNotAcceptable(String),
    #[error("{0}")]
    PackagingFormatNotAcceptable(String),
    #[error("{0}")]
    ValidationFailed(String),
    #[error("{message}")]
    BadRequest { message: String, errors: Vec<String> },
    #[error("{0}")]
    InvalidSegmentSize(String),
    #[error("{0}")]
    MaxUploadSizeExceeded(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        AppError::NotFound(msg.into())
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        AppError::Internal(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::ContentMalformed(_)
            | AppError::ValidationFailed(_)
            | AppError::BadRequest { .. }
            | AppError::InvalidSegmentSize(_) => StatusCode::BAD_REQUEST,
            AppError::ContentTypeNotAcceptable(_)
            | AppError::MetadataFormatNotAcceptable(_)
            | AppError::PackagingFormatNotAcceptable(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::MaxUploadSizeExceeded(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The SWORD error `@type`.
    pub fn sword_type(&self) -> &'static str {
        match self {
            AppError::ContentMalformed(_) => "ContentMalformed",
            AppError::ContentTypeNotAcceptable(_) => "ContentTypeNotAcceptable",
            AppError::MetadataFormatNotAcceptable(_) => "MetadataFormatNotAcceptable",
            AppError::PackagingFormatNotAcceptable(_) => "PackagingFormatNotAcceptable",
            AppError::ValidationFailed(_) => "ValidationFailed",
            AppError::BadRequest { .. } => "BadRequest",
            AppError::InvalidSegmentSize(_) => "InvalidSegmentSize",
            AppError::MaxUploadSizeExceeded(_) => "MaxUploadSizeExceeded",
            AppError::Conflict(_) => "Conflict",
            AppError::NotFound(_) => "NotFound",
            AppError::Internal(_) => "InternalServerError",
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            AppError::ContentMalformed(_) => "The request body could not be processed",
            AppError::ContentTypeNotAcceptable(_) => "The Content-Type is not acceptable",
            AppError::MetadataFormatNotAcceptable(_) => "The Metadata-Format is not supported",
            AppError::PackagingFormatNotAcceptable(_) => "The Packaging format is not supported",
            AppError::ValidationFailed(_) => "The deposit failed validation",
            AppError::BadRequest { .. } => "The request was malformed",
            AppError::InvalidSegmentSize(_) => "The segment has the wrong size",
            AppError::MaxUploadSizeExceeded(_) => "The upload is larger than the server accepts",
            AppError::Conflict(_) => "The request conflicts with the state of the deposit",
            AppError::NotFound(_) => "The resource does not exist",
            AppError::Internal(_) => "The server encountered an internal error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }

        let mut body = json!({
            "@context": SWORD_CONTEXT,
            "@type": self.sword_type(),
            "error": self.reason(),
            "log": self.to_string(),
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        });
        if let AppError::BadRequest { errors, .. } = &self {
            body["errors"] = json!(errors);
        }

        let mut response = (status, Json(body)).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/ld+json"),
        );
        response
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::BucketNotFound(_)
            | StorageError::ObjectNotFound(_)
            | StorageError::VersionNotFound(_)
            | StorageError::MissingPayload(_) => AppError::NotFound(err.to_string()),
            StorageError::InvalidObjectKey(_) => AppError::ContentMalformed(err.to_string()),
            StorageError::PayloadTooLarge { .. } => AppError::MaxUploadSizeExceeded(err.to_string()),
            StorageError::Tag(err) => err.into(),
            StorageError::CorruptRecord(_) | StorageError::Sqlx(_) | StorageError::Io(_) => {
                AppError::Internal(err.to_string())
            }
        }
    }
}

impl From<TagError> for AppError {
    fn from(err: TagError) -> Self {
        AppError::ContentMalformed(err.to_string())
    }
}

impl From<MetadataError> for AppError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::UnsupportedMediaType { .. } => {
                AppError::ContentTypeNotAcceptable(err.to_string())
            }
            MetadataError::MalformedContent(_) => AppError::ContentMalformed(err.to_string()),
            MetadataError::TypeMismatch => AppError::Conflict(err.to_string()),
            MetadataError::UnknownFormat(_) => AppError::MetadataFormatNotAcceptable(err.to_string()),
            MetadataError::Storage(err) => err.into(),
        }
    }
}

impl From<PackagingError> for AppError {
    fn from(err: PackagingError) -> Self {
        match err {
            PackagingError::ContentTypeNotAcceptable { .. } => {
                AppError::ContentTypeNotAcceptable(err.to_string())
            }
            PackagingError::ContentMalformed(_) => AppError::ContentMalformed(err.to_string()),
            PackagingError::UnpackedTooLarge { .. } => {
                AppError::MaxUploadSizeExceeded(err.to_string())
            }
            PackagingError::ValidationFailed(_) => AppError::ValidationFailed(err.to_string()),
            PackagingError::UnknownFormat(_) => {
                AppError::PackagingFormatNotAcceptable(err.to_string())
            }
            PackagingError::Metadata(err) => err.into(),
            PackagingError::Storage(err) => err.into(),
            PackagingError::Io(_) => AppError::Internal(err.to_string()),
        }
    }
}

impl From<DepositError> for AppError {
    fn from(err: DepositError) -> Self {
        match err {
            DepositError::NotDraft(_) | DepositError::InvalidTransition(_) => {
                AppError::Conflict(err.to_string())
            }
            DepositError::Corrupt { .. } => AppError::Internal(err.to_string()),
        }
    }
}

impl From<StagingError> for AppError {
    fn from(err: StagingError) -> Self {
        match err {
            StagingError::InvalidParameters(errors) => AppError::BadRequest {
                message: format!("invalid segmented upload parameters: {}", errors.join(", ")),
                errors,
            },
            StagingError::InvalidSegmentSize { .. } => AppError::InvalidSegmentSize(err.to_string()),
            StagingError::NotFound(_) => AppError::NotFound(err.to_string()),
            StagingError::Storage(err) => err.into(),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}
