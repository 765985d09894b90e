//! # 헬스체크(Health Check) 핸들러
//!
//! ## 엔드포인트
//! - `GET /api/v1/health` → `{ "status": "ok", "generation_mode": "live" | "offline" }`
//!
//! 인증 없이 호출할 수 있습니다. `generation_mode`는 제공자 API 키가 설정되어 있는지를 보여주며,
//! `offline`이면 모든 생성 결과가 자리표시 콘텐츠입니다.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use super::AppState;
use crate::models::GenerationMode;

/// `GET /health`
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let mode = if state.orchestrator.provider_is_live() {
        GenerationMode::Live
    } else {
        GenerationMode::Offline
    };

    Json(json!({
        "status": "ok",
        "generation_mode": mode,
    }))
}
