//! # 데이터 모델 모듈
//!
//! 애플리케이션에서 사용하는 데이터 구조체(struct)들을 정의합니다.
//! - `story`: 스토리, 캐릭터, 페이지, 이미지 버전과 단계별 요청 타입
//! - `revision`: 스토리 리비전(불변 스냅샷)
//!
//! `pub use X::*;`로 재공개하여 `crate::models::Story`처럼 짧게 접근합니다.

pub mod revision;
pub mod story;

pub use revision::*;
pub use story::*;
