use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use patchsync_core::{PatchSyncError, SerializableError};
use thiserror::Error;

/// Errors surfaced by HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unknown entity type '{0}'")]
    UnknownEntityType(String),

    #[error("Unknown method '{method}' on entity type '{entity_type}'")]
    UnknownMethod { entity_type: String, method: String },

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Sync(#[from] PatchSyncError),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::UnknownEntityType(_) | ApiError::UnknownMethod { .. } => {
                StatusCode::NOT_FOUND
            }
            ApiError::InvalidArguments(_) => StatusCode::BAD_REQUEST,
            ApiError::Rejected(_) => StatusCode::CONFLICT,
            ApiError::Sync(err) => sync_status(err),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::UnknownEntityType(_) => "UnknownEntityType",
            ApiError::UnknownMethod { .. } => "UnknownMethod",
            ApiError::InvalidArguments(_) => "InvalidArguments",
            ApiError::Rejected(_) => "Rejected",
            ApiError::Sync(err) => err.kind(),
        }
    }

    pub fn to_serializable(&self) -> SerializableError {
        match self {
            ApiError::Sync(err) => err.to_serializable(),
            other => SerializableError {
                kind: other.kind().to_string(),
                message: other.to_string(),
                path: None,
            },
        }
    }
}

fn sync_status(err: &PatchSyncError) -> StatusCode {
    match err {
        PatchSyncError::UnknownEntity(_) => StatusCode::NOT_FOUND,
        PatchSyncError::Json(_)
        | PatchSyncError::MalformedPayload(_)
        | PatchSyncError::InvalidPath { .. }
        | PatchSyncError::MissingArgument { .. }
        | PatchSyncError::EmptyMutation(_) => StatusCode::BAD_REQUEST,
        PatchSyncError::NotAuthoritative(_)
        | PatchSyncError::EntityAlreadyRegistered(_)
        | PatchSyncError::PathConflict { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected ({}): {}", status, self);
        }
        (status, Json(self.to_serializable())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::UnknownEntityType("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(PatchSyncError::UnknownEntity("board:1".into())).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(PatchSyncError::MalformedPayload("eof".into())).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(PatchSyncError::NotAuthoritative("board:1".into())).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(PatchSyncError::Storage("disk full".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_serializable_kind() {
        let err = ApiError::UnknownMethod {
            entity_type: "board".into(),
            method: "fly".into(),
        };
        let body = err.to_serializable();
        assert_eq!(body.kind, "UnknownMethod");
        assert!(body.message.contains("fly"));
    }
}
