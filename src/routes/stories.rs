//! # 스토리(Story) 라우트 핸들러
//!
//! 스토리 CRUD와 워크플로 단계 승인을 처리하는 HTTP 핸들러 함수들입니다.
//!
//! ## 엔드포인트
//! - `GET    /api/v1/stories`                                  → 내 스토리 목록
//! - `POST   /api/v1/stories`                                  → 새 스토리 (draft)
//! - `GET    /api/v1/stories/{id}`                             → 스토리 전체 조회
//! - `PATCH  /api/v1/stories/{id}`                             → 제목/북마크 수정
//! - `POST   /api/v1/stories/{id}/setting/expand`              → 설정 확장 제안
//! - `POST   /api/v1/stories/{id}/setting/approve`             → 설정 승인 → 캐릭터 추출
//! - `POST   /api/v1/stories/{id}/characters/approve`          → 캐릭터 승인 → 본문 생성
//! - `POST   /api/v1/stories/{id}/characters/{character_id}/image` → 캐릭터 초상화
//! - `POST   /api/v1/stories/{id}/text/approve`                → 본문 수정 저장
//! - `POST   /api/v1/stories/{id}/images/generate`             → 이미지 생성 시작 (202)
//! - `POST   /api/v1/stories/{id}/core-image/regenerate`       → 코어 이미지 재생성
//!
//! ## 단계 승인 응답
//! 단계 승인은 제공자 호출이 끝날 때까지 기다렸다가 `StageOutcome`을 돌려줍니다:
//! `{ "story": {...}, "generation_mode": "live" | "offline" }`
//!
//! 이미지 생성만은 페이지 수만큼 오래 걸리므로 `202 Accepted`로 바로 응답하고,
//! 진행 상황은 WebSocket 이벤트(`image_generation_*`)로 전달합니다.

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
    services::orchestrator::StageOutcome,
    services::workflow::{Transition, TransitionRequest},
};

/// 워크플로 전이 결과를 단계 응답으로 바꿉니다.
///
/// 동기 단계(설정/캐릭터/본문 승인)는 항상 `Completed`를 돌려줍니다.
fn stage_response(transition: Transition) -> Result<Json<StageOutcome>, AppError> {
    match transition {
        Transition::Completed(outcome) => Ok(Json(outcome)),
        Transition::Scheduled(job) => Err(AppError::Internal(format!(
            "Unexpected background job for story {}",
            job.story_id()
        ))),
    }
}

/// `GET /stories`: 내 스토리 목록 (북마크 먼저, 최근 수정순)
pub async fn list_stories(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Value>, AppError> {
    let stories = db::list_stories(&state.pool, &auth.user_id).await?;
    Ok(Json(json!({ "stories": stories })))
}

/// `POST /stories`: 새 스토리를 `draft` 상태로 만듭니다.
///
/// # 반환값
/// HTTP 201 Created + 생성된 스토리 JSON
pub async fn create_story(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<CreateStoryRequest>,
) -> Result<(StatusCode, Json<Story>), AppError> {
    let story = state.workflow.create_story(&auth.user_id, &req).await?;
    Ok((StatusCode::CREATED, Json(story)))
}

/// `GET /stories/{id}`: 캐릭터, 페이지, 페이지별 이미지 이력까지 포함한 스토리
///
/// 다른 사용자의 스토리는 404로 응답합니다 (존재 여부도 드러내지 않음).
pub async fn get_story(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Story>, AppError> {
    let story = db::get_story(&state.pool, &id, &auth.user_id)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(story))
}

/// `PATCH /stories/{id}`: 제목/북마크만 수정합니다. 워크플로 상태는 바뀌지 않습니다.
pub async fn update_story(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
    Json(req): Json<UpdateStoryRequest>,
) -> Result<Json<Story>, AppError> {
    if let Some(title) = &req.title {
        let len = title.trim().chars().count();
        if len == 0 || len > 200 {
            return Err(AppError::Validation(
                "title must be between 1 and 200 characters".to_string(),
            ));
        }
    }

    let story = db::update_story(&state.pool, &id, &auth.user_id, &req)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(story))
}

/// `POST /stories/{id}/setting/expand`: 설정 확장 제안 (draft 유지)
pub async fn expand_setting(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<StageOutcome>, AppError> {
    let outcome = state.orchestrator.expand_setting(&id, &auth.user_id).await?;
    Ok(Json(outcome))
}

/// `POST /stories/{id}/setting/approve`: 확장 설정을 승인하고 캐릭터를 추출합니다.
pub async fn approve_setting(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
    Json(req): Json<ApproveSettingRequest>,
) -> Result<Json<StageOutcome>, AppError> {
    let transition = state
        .workflow
        .request_transition(&id, &auth.user_id, TransitionRequest::ApproveSetting(req))
        .await?;
    stage_response(transition)
}

/// `POST /stories/{id}/characters/approve`: 캐릭터를 승인하고 본문을 생성합니다.
pub async fn approve_characters(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
    Json(req): Json<ApproveCharactersRequest>,
) -> Result<Json<StageOutcome>, AppError> {
    let transition = state
        .workflow
        .request_transition(&id, &auth.user_id, TransitionRequest::ApproveCharacters(req))
        .await?;
    stage_response(transition)
}

/// `POST /stories/{id}/text/approve`: 사용자가 다듬은 본문을 저장합니다.
pub async fn approve_text(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
    Json(req): Json<ApproveTextRequest>,
) -> Result<Json<StageOutcome>, AppError> {
    let transition = state
        .workflow
        .request_transition(&id, &auth.user_id, TransitionRequest::ApproveText(req))
        .await?;
    stage_response(transition)
}

/// `POST /stories/{id}/images/generate`: 이미지 생성을 시작합니다.
///
/// 전이 확인과 `generating_images` 기록까지는 요청 안에서 끝나므로
/// 이미 실행 중이면 409(`job_in_progress`)가 바로 반환됩니다.
/// 실제 생성은 `tokio::spawn`으로 띄운 백그라운드 태스크가 이어갑니다.
pub async fn generate_images(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let job = match state
        .workflow
        .request_transition(&id, &auth.user_id, TransitionRequest::StartImageGeneration)
        .await?
    {
        Transition::Scheduled(job) => job,
        Transition::Completed(outcome) => {
            let body = serde_json::to_value(outcome).map_err(|e| AppError::Internal(e.to_string()))?;
            return Ok((StatusCode::OK, Json(body)));
        }
    };

    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        let story_id = job.story_id().to_string();
        // 실패는 이미 error 이벤트로 발행되고 상태도 되돌려졌으므로 기록만 남깁니다
        if let Err(e) = orchestrator.run_image_job(job).await {
            tracing::warn!(story_id = %story_id, error = %e, "Background image generation failed");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "story_id": id,
            "status": StoryStatus::GeneratingImages,
        })),
    ))
}

/// `POST /stories/{id}/core-image/regenerate`: 코어(표지) 이미지 재생성
///
/// 요청 본문: `{ "custom_prompt": "..." }` (선택)
pub async fn regenerate_core_image(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
    Json(req): Json<RegenerateImageRequest>,
) -> Result<Json<StageOutcome>, AppError> {
    let outcome = state
        .orchestrator
        .regenerate_core_image(&id, &auth.user_id, req.custom_prompt.as_deref())
        .await?;
    Ok(Json(outcome))
}

/// `POST /stories/{id}/characters/{character_id}/image`: 캐릭터 초상화 생성
pub async fn generate_character_image(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((id, character_id)): Path<(String, String)>,
) -> Result<Json<Character>, AppError> {
    let character = state
        .orchestrator
        .generate_character_image(&id, &auth.user_id, &character_id)
        .await?;
    Ok(Json(character))
}
