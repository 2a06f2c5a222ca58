use std::error::Error as StdError;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use datagate_api_types::ErrorBody;
use thiserror::Error;

use crate::{application::repos::RepoError, domain::error::DomainError, infra::error::InfraError};

/// Error detail carried in response extensions for the logging middleware.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = vec![error.to_string()];
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("resource not found")]
    NotFound,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Repo(RepoError::NotFound) | AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Repo(RepoError::InvalidInput { .. })
            | AppError::Domain(_)
            | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Repo(RepoError::Duplicate { .. }) => StatusCode::CONFLICT,
            AppError::Repo(RepoError::Unconfigured) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Repo(RepoError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Repo(RepoError::Persistence(_) | RepoError::Integrity { .. })
            | AppError::Infra(_)
            | AppError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn presentation_message(&self) -> String {
        match self {
            AppError::Repo(RepoError::NotFound) | AppError::NotFound => {
                "Resource not found".to_string()
            }
            AppError::Repo(RepoError::InvalidInput { message }) => message.clone(),
            AppError::Domain(err) => err.to_string(),
            AppError::Validation(message) => message.clone(),
            AppError::Repo(RepoError::Duplicate { .. }) => "Record already exists".to_string(),
            AppError::Repo(RepoError::Unconfigured) => {
                "Service temporarily unavailable".to_string()
            }
            AppError::Repo(RepoError::Timeout) => "Database timed out".to_string(),
            AppError::Repo(RepoError::Persistence(_) | RepoError::Integrity { .. })
            | AppError::Infra(_)
            | AppError::Unexpected(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody::new(self.presentation_message());
        let report = ErrorReport::from_error("application::error::AppError", status, &self);
        let mut response = (status, Json(body)).into_response();
        report.attach(&mut response);
        response
    }
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;

    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn validation_is_bad_request_with_message() {
        let response = AppError::validation("page must be a number").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.extensions().get::<ErrorReport>().is_some());
        let json = body_json(response).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "page must be a number");
    }

    #[tokio::test]
    async fn persistence_detail_is_hidden() {
        let response =
            AppError::from(RepoError::from_persistence("connection reset by peer")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert_eq!(json["error"], "Internal server error");
    }

    #[test]
    fn unconfigured_store_is_unavailable() {
        assert_eq!(
            AppError::from(RepoError::Unconfigured).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
