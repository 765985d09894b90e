//! # 에러 처리 모듈
//!
//! 애플리케이션에서 발생할 수 있는 모든 에러 타입을 정의합니다.
//!
//! 이 모듈의 핵심:
//! - `AppError` 열거형(enum): 모든 에러 종류를 하나의 타입으로 통합
//! - `IntoResponse` 구현: 에러를 HTTP 응답으로 자동 변환
//!
//! ## 에러 분류
//! - 요청 단계에서 동기적으로 거부되는 에러: `InvalidTransition`, `Validation`, `JobInProgress`
//!   → 제공자(provider) 호출 전에 반환되며, 스토리 상태는 변하지 않습니다.
//! - 생성 결과를 쓸 수 없는 에러: `PageCountMismatch`, `GenerationFailed`
//!   → 오케스트레이터가 스토리를 호출 전 상태로 되돌린 뒤 반환합니다.
//! - 버전 관리 에러: `VersionNotFound`

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::models::StoryStatus;
use crate::services::workflow::WorkflowEvent;

/// 애플리케이션에서 발생할 수 있는 모든 에러 종류
///
/// 각 에러 variant는 적절한 HTTP 상태 코드와 메시지로 변환됩니다.
#[derive(Debug, Error)]
pub enum AppError {
    /// 요청한 리소스를 찾을 수 없음 (HTTP 404)
    #[error("Resource not found")]
    NotFound,

    /// 현재 상태에서 허용되지 않는 워크플로 이벤트 (HTTP 409)
    /// 입력을 바꾸지 않고 재시도해도 성공하지 않습니다.
    #[error("'{event}' is not allowed while the story is '{from}'")]
    InvalidTransition {
        from: StoryStatus,
        event: WorkflowEvent,
    },

    /// 단계별 최소 입력 조건을 만족하지 않음 (HTTP 422)
    #[error("Validation failed: {0}")]
    Validation(String),

    /// 같은 스토리에 대해 이미 생성 작업이 진행 중 (HTTP 409)
    /// 대기열에 넣지 않습니다. 호출자가 나중에 다시 시도해야 합니다.
    #[error("A generation job is already running for story {0}")]
    JobInProgress(String),

    /// 제공자가 돌려준 페이지 수가 스토리의 total_pages와 다름 (HTTP 502)
    #[error("Provider returned {actual} pages, expected {expected}")]
    PageCountMismatch { expected: usize, actual: usize },

    /// 생성 제공자 호출 실패 또는 결과가 손상됨 (HTTP 502)
    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    /// 복원하려는 이미지 버전이 해당 페이지 이력에 없음 (HTTP 404)
    #[error("Image version not found")]
    VersionNotFound,

    /// 서버 내부 오류 (HTTP 500)
    #[error("Internal error: {0}")]
    Internal(String),

    /// 데이터베이스 오류 (HTTP 500)
    /// #[from]: sqlx::Error → AppError::Database 자동 변환
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl AppError {
    /// 응답 본문의 `code` 필드와 HTTP 상태 코드
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            AppError::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
            AppError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation_error"),
            AppError::JobInProgress(_) => (StatusCode::CONFLICT, "job_in_progress"),
            AppError::PageCountMismatch { .. } => (StatusCode::BAD_GATEWAY, "page_count_mismatch"),
            AppError::GenerationFailed(_) => (StatusCode::BAD_GATEWAY, "generation_failed"),
            AppError::VersionNotFound => (StatusCode::NOT_FOUND, "version_not_found"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
        }
    }
}

impl IntoResponse for AppError {
    /// AppError를 HTTP 응답으로 변환합니다.
    ///
    /// 내부 에러(Database, Internal)는 실제 에러 내용을 로그에만 기록하고,
    /// 클라이언트에는 일반적인 메시지만 반환합니다.
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        let message = match self {
            AppError::Internal(ref msg) => {
                tracing::error!("Internal error: {}", msg);
                "An internal error occurred".to_string()
            }
            AppError::Database(ref e) => {
                tracing::error!("Database error: {}", e);
                "A database error occurred".to_string()
            }
            AppError::GenerationFailed(ref msg) => {
                tracing::warn!("Generation failed: {}", msg);
                self.to_string()
            }
            AppError::Validation(ref msg) => msg.clone(),
            _ => self.to_string(),
        };

        // 결과: { "error": { "code": "job_in_progress", "message": "..." } }
        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}
