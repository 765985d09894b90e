//! # 라우트 핸들러 모듈
//!
//! HTTP 요청을 처리하는 핸들러 함수들을 모아둔 모듈입니다.
//! Axum에서 핸들러는 HTTP 요청을 받아 응답을 반환하는 async 함수입니다.
//!
//! 각 하위 모듈:
//! - `stories`: 스토리 CRUD와 단계 승인(워크플로 전이) 핸들러
//! - `images`: 페이지 이미지 이력, 재생성, 버전 복원
//! - `revisions`: 리비전 생성/조회/복원
//! - `progress`: 진행 이벤트 WebSocket 스트림
//! - `health`: 서버 상태 확인 (헬스체크)

pub mod health;
pub mod images;
pub mod progress;
pub mod revisions;
pub mod stories;

// 각 모듈의 핸들러 함수들을 재공개하여 `routes::list_stories`처럼 바로 접근 가능하게 합니다.
pub use health::*;
pub use images::*;
pub use progress::*;
pub use revisions::*;
pub use stories::*;

use axum::{
    routing::{get, post},
    Router,
};
use sqlx::SqlitePool;

use crate::services::events::EventBus;
use crate::services::orchestrator::Orchestrator;
use crate::services::provider::ProviderAdapter;
use crate::services::workflow::Workflow;

/// 애플리케이션 공유 상태
///
/// 모든 요청 핸들러가 `State(state): State<AppState>`로 접근합니다.
/// 안의 값들은 모두 내부적으로 Arc를 사용하므로 clone해도 같은 자원을 가리킵니다.
#[derive(Clone)]
pub struct AppState {
    /// SQLite 연결 풀
    pub pool: SqlitePool,
    /// JWT 검증용 비밀키 (외부 인증 서비스와 공유)
    pub jwt_secret: String,
    /// 상태 머신 + 요청 검증
    pub workflow: Workflow,
    /// 단계 실행과 페이지 단위 동작
    pub orchestrator: Orchestrator,
    /// 진행 이벤트 구독용
    pub events: EventBus,
}

impl AppState {
    pub fn new(
        pool: SqlitePool,
        jwt_secret: String,
        provider: ProviderAdapter,
        event_channel_capacity: usize,
    ) -> Self {
        let events = EventBus::new(event_channel_capacity);
        let orchestrator = Orchestrator::new(pool.clone(), provider, events.clone());
        let workflow = Workflow::new(pool.clone(), orchestrator.clone());

        Self {
            pool,
            jwt_secret,
            workflow,
            orchestrator,
            events,
        }
    }
}

/// `/api/v1` 아래에 붙는 API 라우터.
///
/// 경로 파라미터는 axum 0.8 문법(`{id}`)을 사용합니다.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        // 스토리 CRUD
        .route("/stories", get(list_stories).post(create_story))
        .route("/stories/{id}", get(get_story).patch(update_story))
        // 워크플로 단계
        .route("/stories/{id}/setting/expand", post(expand_setting))
        .route("/stories/{id}/setting/approve", post(approve_setting))
        .route("/stories/{id}/characters/approve", post(approve_characters))
        .route(
            "/stories/{id}/characters/{character_id}/image",
            post(generate_character_image),
        )
        .route("/stories/{id}/text/approve", post(approve_text))
        .route("/stories/{id}/images/generate", post(generate_images))
        .route("/stories/{id}/core-image/regenerate", post(regenerate_core_image))
        // 페이지 이미지 버전
        .route("/stories/{id}/pages/{page}/images", get(list_page_images))
        .route(
            "/stories/{id}/pages/{page}/images/regenerate",
            post(regenerate_page_image),
        )
        .route(
            "/stories/{id}/pages/{page}/images/{version_id}/restore",
            post(restore_image_version),
        )
        // 리비전
        .route("/stories/{id}/revisions", get(list_revisions).post(create_revision))
        .route("/stories/{id}/revisions/{number}", get(get_revision))
        .route("/stories/{id}/revisions/{number}/restore", post(restore_revision))
        // 진행 이벤트 스트림 (토큰은 쿼리로)
        .route("/ws", get(progress_stream))
        // 헬스체크 API (인증 없음)
        .route("/health", get(health_check))
        .with_state(state)
}
