//! # 스토리 리비전(Revision) 모델 정의
//!
//! 리비전은 워크플로의 특정 시점에 찍어둔 스토리 전체의 **불변 스냅샷**입니다.
//! `parent_revision`은 같은 스토리의 `revision_number`를 가리키는 정수일 뿐이며,
//! 객체 참조가 아니므로 리비전들은 (story_id, revision_number)로 색인되는 트리를 이룹니다.
//!
//! ```text
//! r1 ── r2 ── r3
//!        └─── r4   (r2로 복원한 뒤 만든 리비전은 r2에서 갈라집니다)
//! ```

use serde::{Deserialize, Serialize};
use sqlx::types::Json;

use super::{Character, Story, StoryStatus};

/// `story_revisions` 테이블 한 행
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoryRevision {
    pub id: String,
    pub story_id: String,
    pub revision_number: i64,
    pub parent_revision: Option<i64>,
    pub step_completed: StoryStatus,
    pub description: Option<String>,
    pub snapshot: Json<StorySnapshot>,
    pub created_at: String,
}

/// 목록 조회용 요약 (스냅샷 본문 제외)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoryRevisionSummary {
    pub id: String,
    pub story_id: String,
    pub revision_number: i64,
    pub parent_revision: Option<i64>,
    pub step_completed: StoryStatus,
    pub description: Option<String>,
    pub created_at: String,
}

/// 리비전에 저장되는 비정규화된 스토리 필드들
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorySnapshot {
    pub title: String,
    pub setting: String,
    pub expanded_setting: Option<String>,
    pub characters: String,
    pub extracted_characters: Vec<Character>,
    pub plot: String,
    pub age_group: String,
    pub total_pages: i64,
    pub pages: Vec<PageSnapshot>,
    pub core_image_url: Option<String>,
}

/// 스냅샷 안의 페이지. 이미지 이력은 스냅샷에 넣지 않습니다
/// (이력은 추가 전용이라 리비전과 무관하게 계속 쌓입니다).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub page_number: i64,
    pub text: String,
    pub image_url: Option<String>,
    pub image_prompt: Option<String>,
}

impl From<&Story> for StorySnapshot {
    fn from(story: &Story) -> Self {
        Self {
            title: story.title.clone(),
            setting: story.setting.clone(),
            expanded_setting: story.expanded_setting.clone(),
            characters: story.characters.clone(),
            extracted_characters: story.extracted_characters.clone(),
            plot: story.plot.clone(),
            age_group: story.age_group.clone(),
            total_pages: story.total_pages,
            pages: story
                .pages
                .iter()
                .map(|p| PageSnapshot {
                    page_number: p.page_number,
                    text: p.text.clone(),
                    image_url: p.image_url.clone(),
                    image_prompt: p.image_prompt.clone(),
                })
                .collect(),
            core_image_url: story.core_image_url.clone(),
        }
    }
}

/// 리비전 생성 요청: `POST /api/v1/stories/{id}/revisions`
#[derive(Debug, Default, Deserialize)]
pub struct CreateRevisionRequest {
    /// 기록할 단계. 없으면 스토리의 현재 상태를 사용합니다.
    pub step_completed: Option<StoryStatus>,
    pub description: Option<String>,
}
