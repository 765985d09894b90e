//! # 리비전(Revision) 핸들러
//!
//! ## 엔드포인트
//! - `GET  /api/v1/stories/{id}/revisions`                    → 리비전 목록 (스냅샷 본문 제외)
//! - `POST /api/v1/stories/{id}/revisions`                    → 현재 상태를 리비전으로 저장
//! - `GET  /api/v1/stories/{id}/revisions/{number}`           → 리비전 (스냅샷 포함)
//! - `POST /api/v1/stories/{id}/revisions/{number}/restore`   → 리비전으로 복원
//!
//! 복원은 현재 작업 상태를 먼저 자동 체크포인트로 남긴 뒤 덮어씁니다.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};

use super::AppState;
use crate::{
    db,
    error::AppError,
    middleware::auth::AuthUser,
    models::*,
    services::orchestrator::RevisionRestore,
};

async fn ensure_owner(state: &AppState, story_id: &str, user_id: &str) -> Result<(), AppError> {
    db::get_story(&state.pool, story_id, user_id)
        .await?
        .map(|_| ())
        .ok_or(AppError::NotFound)
}

/// `GET /stories/{id}/revisions`
pub async fn list_revisions(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    ensure_owner(&state, &id, &auth.user_id).await?;
    let revisions = db::list_revisions(&state.pool, &id).await?;
    Ok(Json(json!({ "revisions": revisions })))
}

/// `POST /stories/{id}/revisions`
///
/// 요청 본문: `{ "step_completed": "text_approved", "description": "..." }` (모두 선택)
pub async fn create_revision(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
    Json(req): Json<CreateRevisionRequest>,
) -> Result<(StatusCode, Json<StoryRevision>), AppError> {
    let revision = state
        .orchestrator
        .create_revision(&id, &auth.user_id, &req)
        .await?;
    Ok((StatusCode::CREATED, Json(revision)))
}

/// `GET /stories/{id}/revisions/{number}`
pub async fn get_revision(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((id, number)): Path<(String, i64)>,
) -> Result<Json<StoryRevision>, AppError> {
    ensure_owner(&state, &id, &auth.user_id).await?;
    let revision = db::get_revision(&state.pool, &id, number)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(revision))
}

/// `POST /stories/{id}/revisions/{number}/restore`
pub async fn restore_revision(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((id, number)): Path<(String, i64)>,
) -> Result<Json<RevisionRestore>, AppError> {
    let restored = state
        .orchestrator
        .restore_revision(&id, &auth.user_id, number)
        .await?;
    Ok(Json(restored))
}
