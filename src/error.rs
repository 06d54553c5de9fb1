use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyticsError {
    #[error("Authentication required")]
    Unauthenticated,

    #[error("Company #{0} not found")]
    NotFound(i64),

    #[error("Unsupported export format '{0}' (expected csv or json)")]
    UnsupportedExportFormat(String),

    #[error("Tenant history exceeds the read limit of {limit} records")]
    RecordLimitExceeded { limit: usize },

    #[error("Reading tenant data timed out")]
    TimedOut,

    #[error("Report request was cancelled")]
    Cancelled,

    #[error("Storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl AnalyticsError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::UnsupportedExportFormat(_) => StatusCode::BAD_REQUEST,
            Self::RecordLimitExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::TimedOut => StatusCode::GATEWAY_TIMEOUT,
            Self::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AnalyticsError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "analytics request failed");
        } else {
            tracing::debug!(error = %self, "analytics request rejected");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AnalyticsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(AnalyticsError::Unauthenticated.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(AnalyticsError::NotFound(3).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            AnalyticsError::UnsupportedExportFormat("xml".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AnalyticsError::Storage(anyhow::anyhow!("disk gone")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_messages() {
        assert_eq!(AnalyticsError::NotFound(7).to_string(), "Company #7 not found");
        assert_eq!(
            AnalyticsError::UnsupportedExportFormat("xml".into()).to_string(),
            "Unsupported export format 'xml' (expected csv or json)"
        );
    }
}
