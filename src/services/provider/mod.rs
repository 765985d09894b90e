//! # 생성 제공자(Generation Provider) 인터페이스
//!
//! 텍스트/이미지 생성 API를 감싸는 공통 트레이트와 요청/응답 타입입니다.
//!
//! ## 구성
//! - `GenerationProvider`: 구현에 독립적인 생성 기능 트레이트
//! - `openai`: OpenAI 호환 HTTP API 구현 (실제 생성)
//! - `offline`: 결정적(deterministic) 대체 콘텐츠 구현
//! - `adapter`: 호출마다 실제/오프라인을 고르는 `ProviderAdapter`
//!
//! 제공자 에러는 HTTP 상태 코드와 응답의 구조화된 에러 코드로 분류되며,
//! 에러 메시지 문자열로 판단하지 않습니다.

pub mod adapter;
pub mod offline;
pub mod openai;

#[cfg(test)]
pub(crate) mod testing;

pub use adapter::ProviderAdapter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use thiserror::Error;

use crate::error::AppError;
use crate::models::{Character, GenerationMode, PageText};

/// 분류된 제공자 에러
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("provider call timed out")]
    Timeout,

    #[error("provider rate limit reached: {0}")]
    RateLimited(String),

    #[error("provider quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("provider returned {actual} pages, expected {expected}")]
    PageCountMismatch { expected: usize, actual: usize },

    #[error("malformed provider output: {0}")]
    Malformed(String),

    /// 인증 실패, 5xx, 전송 오류 등 대체 콘텐츠로 넘어가지 않는 실패
    #[error("provider call failed: {0}")]
    Failed(String),
}

impl ProviderError {
    /// 오프라인 대체 콘텐츠로 한 번 다시 시도할 수 있는 에러인지 여부
    pub fn allows_fallback(&self) -> bool {
        !matches!(self, ProviderError::Failed(_))
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::PageCountMismatch { expected, actual } => {
                AppError::PageCountMismatch { expected, actual }
            }
            other => AppError::GenerationFailed(other.to_string()),
        }
    }
}

/// 생성 결과와 그 결과가 어디서 왔는지(실제/오프라인)
#[derive(Debug, Clone, PartialEq)]
pub struct Generated<T> {
    pub value: T,
    pub mode: GenerationMode,
}

impl<T> Generated<T> {
    pub fn live(value: T) -> Self {
        Self { value, mode: GenerationMode::Live }
    }

    pub fn offline(value: T) -> Self {
        Self { value, mode: GenerationMode::Offline }
    }
}

#[derive(Debug, Clone)]
pub struct SettingRequest<'a> {
    pub setting: &'a str,
    pub plot: &'a str,
    pub age_group: &'a str,
}

#[derive(Debug, Clone)]
pub struct CharacterRequest<'a> {
    pub setting: &'a str,
    pub characters: &'a str,
    pub plot: &'a str,
}

/// 추출된 캐릭터 초안 (ID는 저장 시점에 부여)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterDraft {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct StoryTextSpec<'a> {
    pub title: &'a str,
    pub setting: &'a str,
    pub characters: &'a [Character],
    pub plot: &'a str,
    pub age_group: &'a str,
    pub total_pages: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryText {
    pub title: String,
    pub pages: Vec<PageText>,
}

#[derive(Debug, Clone)]
pub struct CoreImageRequest<'a> {
    pub setting: &'a str,
    pub characters: &'a [Character],
    pub custom_prompt: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct CharacterImageRequest<'a> {
    pub name: &'a str,
    pub description: &'a str,
    pub setting: &'a str,
}

#[derive(Debug, Clone)]
pub struct PageImageRequest<'a> {
    pub page_number: i64,
    pub page_text: &'a str,
    pub core_image: Option<&'a str>,
    /// 직전 페이지의 이미지 URL (시각적 연속성 유지용)
    pub previous_image: Option<&'a str>,
    pub custom_prompt: Option<&'a str>,
}

/// 생성된 이미지 참조 (URL 또는 data URL)와 사용된 프롬프트
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRef {
    pub url: String,
    pub prompt: Option<String>,
}

/// 텍스트/이미지 생성 기능
///
/// 각 호출은 호출자 입장에서 숨은 상태가 없습니다.
#[async_trait]
pub trait GenerationProvider: Send + Sync + Debug {
    async fn expand_setting(&self, req: &SettingRequest<'_>) -> Result<String, ProviderError>;

    async fn extract_characters(
        &self,
        req: &CharacterRequest<'_>,
    ) -> Result<Vec<CharacterDraft>, ProviderError>;

    async fn generate_story_text(&self, spec: &StoryTextSpec<'_>) -> Result<StoryText, ProviderError>;

    async fn generate_core_image(&self, req: &CoreImageRequest<'_>) -> Result<ImageRef, ProviderError>;

    async fn generate_character_image(
        &self,
        req: &CharacterImageRequest<'_>,
    ) -> Result<ImageRef, ProviderError>;

    async fn generate_page_image(&self, req: &PageImageRequest<'_>) -> Result<ImageRef, ProviderError>;
}

// ── 출력 검증 ──
// 실제 제공자 결과와 오프라인 결과 모두 같은 검증을 거칩니다.

pub fn validate_text(text: String) -> Result<String, ProviderError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ProviderError::Malformed("empty text".to_string()));
    }
    Ok(trimmed.to_string())
}

pub fn validate_characters(
    characters: Vec<CharacterDraft>,
) -> Result<Vec<CharacterDraft>, ProviderError> {
    if characters.is_empty() {
        return Err(ProviderError::Malformed("no characters returned".to_string()));
    }
    if characters.iter().any(|c| c.name.trim().is_empty()) {
        return Err(ProviderError::Malformed("character without a name".to_string()));
    }
    Ok(characters)
}

/// 페이지를 번호순으로 정렬하고 개수/연속성/본문을 확인합니다.
pub fn validate_story_text(mut text: StoryText, expected: usize) -> Result<StoryText, ProviderError> {
    if text.pages.len() != expected {
        return Err(ProviderError::PageCountMismatch {
            expected,
            actual: text.pages.len(),
        });
    }

    text.pages.sort_by_key(|p| p.page_number);
    for (index, page) in text.pages.iter().enumerate() {
        if page.page_number != index as i64 + 1 {
            return Err(ProviderError::Malformed(format!(
                "page numbers are not contiguous at position {}",
                index + 1
            )));
        }
        if page.text.trim().is_empty() {
            return Err(ProviderError::Malformed(format!(
                "page {} has no text",
                page.page_number
            )));
        }
    }

    if text.title.trim().is_empty() {
        return Err(ProviderError::Malformed("story title is missing".to_string()));
    }
    Ok(text)
}

pub fn validate_image(image: ImageRef) -> Result<ImageRef, ProviderError> {
    if image.url.trim().is_empty() {
        return Err(ProviderError::Malformed("image reference is empty".to_string()));
    }
    Ok(image)
}
