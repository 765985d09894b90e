//! # 스토리(Story) 모델 정의
//!
//! 그림 동화 한 권을 나타내는 데이터 구조체들입니다.
//!
//! ## 구성
//! ```text
//! Story ─┬─ Character (추출된 캐릭터, 순서 있음)
//!        └─ StoryPage (1부터 시작하는 연속 페이지 번호)
//!              └─ ImageVersion (페이지별 이미지 이력, 활성 버전은 최대 1개)
//! ```
//!
//! 스토리는 생성한 사용자만 소유하며, 상태(status)는 워크플로 상태 머신을 통해서만 바뀝니다.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 스토리 워크플로 상태
///
/// DB에는 snake_case 문자열("draft", "text_approved" 등)로 저장됩니다.
/// 전이 규칙은 `services::workflow`의 전이 테이블이 단독으로 관리합니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum StoryStatus {
    Draft,
    SettingExpansion,
    CharactersExtracted,
    TextApproved,
    GeneratingImages,
    Completed,
}

impl StoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoryStatus::Draft => "draft",
            StoryStatus::SettingExpansion => "setting_expansion",
            StoryStatus::CharactersExtracted => "characters_extracted",
            StoryStatus::TextApproved => "text_approved",
            StoryStatus::GeneratingImages => "generating_images",
            StoryStatus::Completed => "completed",
        }
    }

    /// 워크플로상의 순서 (draft = 0 ... completed = 5)
    pub fn rank(&self) -> u8 {
        match self {
            StoryStatus::Draft => 0,
            StoryStatus::SettingExpansion => 1,
            StoryStatus::CharactersExtracted => 2,
            StoryStatus::TextApproved => 3,
            StoryStatus::GeneratingImages => 4,
            StoryStatus::Completed => 5,
        }
    }

    /// 생성 작업이 진행되는 동안에만 머무는 중간 상태가 아닌지 여부.
    /// 리비전의 step_completed는 항상 이 상태 중 하나입니다.
    pub fn is_resting(&self) -> bool {
        !matches!(
            self,
            StoryStatus::SettingExpansion | StoryStatus::GeneratingImages
        )
    }
}

impl fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 생성 결과가 실제 제공자에서 왔는지, 오프라인 대체 콘텐츠인지 나타내는 플래그.
/// 에러 메시지를 보고 추측하지 않도록 결과와 함께 명시적으로 전달합니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum GenerationMode {
    Live,
    Offline,
}

impl GenerationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationMode::Live => "live",
            GenerationMode::Offline => "offline",
        }
    }

    /// 여러 번의 호출 결과를 합칠 때: 하나라도 오프라인이면 오프라인
    pub fn combine(self, other: GenerationMode) -> GenerationMode {
        if self == GenerationMode::Offline || other == GenerationMode::Offline {
            GenerationMode::Offline
        } else {
            GenerationMode::Live
        }
    }
}

/// 스토리 엔티티: `stories` 테이블 한 행 + 캐릭터/페이지 목록
///
/// `extracted_characters`와 `pages`는 별도 테이블에서 채워지므로
/// `#[sqlx(skip)]`으로 행 매핑에서 제외합니다.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Story {
    pub id: String,
    #[serde(skip_serializing)]
    pub user_id: String,
    pub title: String,
    pub setting: String,
    pub expanded_setting: Option<String>,
    /// 사용자가 처음 입력한 캐릭터 설명 원문
    pub characters: String,
    pub plot: String,
    pub age_group: String,
    pub total_pages: i64,
    pub core_image_url: Option<String>,
    pub status: StoryStatus,
    pub bookmarked: bool,
    pub current_revision: i64,
    pub created_at: String,
    pub updated_at: String,
    #[sqlx(skip)]
    pub extracted_characters: Vec<Character>,
    #[sqlx(skip)]
    pub pages: Vec<StoryPage>,
}

impl Story {
    pub fn page(&self, page_number: i64) -> Option<&StoryPage> {
        self.pages.iter().find(|p| p.page_number == page_number)
    }

    /// 이미지 생성에 쓰는 배경 설명: 확장된 설정이 있으면 그것을 사용합니다.
    pub fn effective_setting(&self) -> &str {
        self.expanded_setting.as_deref().unwrap_or(&self.setting)
    }
}

/// 캐릭터 추출 단계에서 생성되는 캐릭터
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Character {
    pub id: String,
    pub name: String,
    pub description: String,
    pub image_url: Option<String>,
}

/// 스토리 페이지: `story_pages` 테이블 한 행 + 이미지 이력
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoryPage {
    pub page_number: i64,
    pub text: String,
    pub image_url: Option<String>,
    pub image_prompt: Option<String>,
    /// 최신순 정렬. 항목은 삭제되지 않고 비활성화만 됩니다.
    #[sqlx(skip)]
    #[serde(default)]
    pub image_history: Vec<ImageVersion>,
}

/// 페이지 이미지의 한 버전: `image_versions` 테이블 한 행
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ImageVersion {
    pub id: String,
    #[serde(skip_serializing)]
    pub story_id: String,
    pub page_number: i64,
    pub url: String,
    pub prompt: Option<String>,
    pub generation_mode: GenerationMode,
    pub is_active: bool,
    pub created_at: String,
}

/// 스토리 생성 요청: `POST /api/v1/stories`
#[derive(Debug, Clone, Deserialize)]
pub struct CreateStoryRequest {
    pub title: Option<String>,
    pub setting: String,
    pub characters: String,
    pub plot: String,
    pub age_group: String,
    pub total_pages: i64,
}

/// 스토리 메타데이터 수정 요청: `PATCH /api/v1/stories/{id}`
#[derive(Debug, Default, Deserialize)]
pub struct UpdateStoryRequest {
    pub title: Option<String>,
    pub bookmarked: Option<bool>,
}

/// 설정 승인 요청: 사용자가 다듬은 확장 설정
#[derive(Debug, Clone, Deserialize)]
pub struct ApproveSettingRequest {
    pub expanded_setting: String,
}

/// 캐릭터 승인 요청의 캐릭터 한 명
#[derive(Debug, Clone, Deserialize)]
pub struct CharacterInput {
    /// 기존 캐릭터를 수정하는 경우 그 ID (이미지 URL을 유지하기 위해 사용)
    pub id: Option<String>,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApproveCharactersRequest {
    pub characters: Vec<CharacterInput>,
}

/// 페이지 번호와 본문 한 장 (제공자 생성 결과, 사용자 수정 요청 공통)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageText {
    pub page_number: i64,
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApproveTextRequest {
    pub title: Option<String>,
    pub pages: Vec<PageText>,
}

/// 이미지 재생성 요청 (페이지 이미지, 코어 이미지 공통)
#[derive(Debug, Default, Deserialize)]
pub struct RegenerateImageRequest {
    pub custom_prompt: Option<String>,
}
