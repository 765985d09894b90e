//! # 서비스 계층
//!
//! - `workflow`: 상태 머신과 요청 검증
//! - `orchestrator`: 단계 실행, 커밋, 실패 시 되돌리기
//! - `provider`: 생성 제공자 트레이트, OpenAI 호환 클라이언트, 오프라인 대체
//! - `events`: 스토리별 진행 이벤트 버스
//! - `jobs`: 스토리 작업 슬롯과 페이지 잠금

pub mod events;
pub mod jobs;
pub mod orchestrator;
pub mod provider;
pub mod workflow;
