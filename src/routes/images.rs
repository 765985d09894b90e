//! # 페이지 이미지 버전 핸들러
//!
//! ## 엔드포인트
//! - `GET  /api/v1/stories/{id}/pages/{page}/images`                       → 이미지 이력 (최신순)
//! - `POST /api/v1/stories/{id}/pages/{page}/images/regenerate`            → 새 버전 생성
//! - `POST /api/v1/stories/{id}/pages/{page}/images/{version_id}/restore`  → 이전 버전 활성화
//!
//! 이력은 추가 전용입니다. 재생성과 복원 모두 활성 표시만 옮기고 버전을 지우지 않습니다.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};

use super::AppState;
use crate::{db, error::AppError, middleware::auth::AuthUser, models::*};

/// `GET /stories/{id}/pages/{page}/images`
pub async fn list_page_images(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((id, page_number)): Path<(String, i64)>,
) -> Result<Json<Value>, AppError> {
    let story = db::get_story(&state.pool, &id, &auth.user_id)
        .await?
        .ok_or(AppError::NotFound)?;
    let page = story.page(page_number).ok_or(AppError::NotFound)?;

    Ok(Json(json!({
        "page_number": page.page_number,
        "image_url": page.image_url,
        "versions": page.image_history,
    })))
}

/// `POST /stories/{id}/pages/{page}/images/regenerate`
///
/// 요청 본문: `{ "custom_prompt": "..." }` (선택). 새 버전이 활성 버전이 됩니다.
pub async fn regenerate_page_image(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((id, page_number)): Path<(String, i64)>,
    Json(req): Json<RegenerateImageRequest>,
) -> Result<(StatusCode, Json<ImageVersion>), AppError> {
    let version = state
        .orchestrator
        .regenerate_image(&id, &auth.user_id, page_number, req.custom_prompt.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(version)))
}

/// `POST /stories/{id}/pages/{page}/images/{version_id}/restore`
///
/// 이 페이지 이력에 없는 버전이면 404(`version_not_found`).
pub async fn restore_image_version(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((id, page_number, version_id)): Path<(String, i64, String)>,
) -> Result<Json<StoryPage>, AppError> {
    let page = state
        .orchestrator
        .restore_image_version(&id, &auth.user_id, page_number, &version_id)
        .await?;
    Ok(Json(page))
}
