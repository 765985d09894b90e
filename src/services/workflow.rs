//! # 워크플로 상태 머신 (Workflow State Machine)
//!
//! 스토리 상태 전이를 `(현재 상태, 이벤트) → 다음 상태` 테이블 하나로 관리합니다.
//!
//! ```text
//! draft ──approve_setting──▶ setting_expansion ──characters_ready──▶ characters_extracted
//!   ──approve_characters──▶ text_approved ──start_image_generation──▶ generating_images
//!   ──images_ready──▶ completed
//! ```
//!
//! - `text_approved`의 `approve_text`는 자기 전이입니다 (사용자 본문 수정, 제공자 호출 없음).
//! - 재생성/복원 같은 제자리 동작도 허용되는 상태를 이 테이블에서 확인합니다.
//! - 뒤로 가는 전이는 없습니다. 리비전 복원만 상태를 되돌릴 수 있습니다.
//!
//! 요청 처리 순서: 작업 슬롯 확보 → 스토리 로드 → 전이 확인 → 입력 검증 → 오케스트레이터 위임.
//! 전이/검증 에러는 제공자 호출 전에 반환되며 스토리는 바뀌지 않습니다.

use std::collections::HashMap;
use std::fmt;

use sqlx::SqlitePool;

use crate::db;
use crate::error::AppError;
use crate::models::*;
use crate::services::orchestrator::{ImageJob, Orchestrator, StageOutcome};

pub const AGE_GROUPS: [&str; 3] = ["3-5", "6-8", "9-12"];
pub const MIN_PAGES: i64 = 5;
pub const MAX_PAGES: i64 = 50;
pub const MAX_CHARACTERS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkflowEvent {
    ExpandSetting,
    ApproveSetting,
    /// 캐릭터 추출 완료 (내부 이벤트)
    CharactersReady,
    ApproveCharacters,
    ApproveText,
    StartImageGeneration,
    /// 모든 페이지 이미지 커밋 완료 (내부 이벤트)
    ImagesReady,
    RegenerateCoreImage,
    GenerateCharacterImage,
    RegeneratePageImage,
    RestoreImageVersion,
}

impl WorkflowEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowEvent::ExpandSetting => "expand_setting",
            WorkflowEvent::ApproveSetting => "approve_setting",
            WorkflowEvent::CharactersReady => "characters_ready",
            WorkflowEvent::ApproveCharacters => "approve_characters",
            WorkflowEvent::ApproveText => "approve_text",
            WorkflowEvent::StartImageGeneration => "start_image_generation",
            WorkflowEvent::ImagesReady => "images_ready",
            WorkflowEvent::RegenerateCoreImage => "regenerate_core_image",
            WorkflowEvent::GenerateCharacterImage => "generate_character_image",
            WorkflowEvent::RegeneratePageImage => "regenerate_page_image",
            WorkflowEvent::RestoreImageVersion => "restore_image_version",
        }
    }
}

impl fmt::Display for WorkflowEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 전이 테이블. 제자리 동작은 같은 상태로의 전이로 표현합니다.
pub fn next_status(current: StoryStatus, event: WorkflowEvent) -> Option<StoryStatus> {
    use StoryStatus::*;
    use WorkflowEvent::*;

    match (current, event) {
        (Draft, ExpandSetting) => Some(Draft),
        (Draft, ApproveSetting) => Some(SettingExpansion),
        (SettingExpansion, CharactersReady) => Some(CharactersExtracted),
        (CharactersExtracted, ApproveCharacters) => Some(TextApproved),
        (TextApproved, ApproveText) => Some(TextApproved),
        (TextApproved, StartImageGeneration) => Some(GeneratingImages),
        (GeneratingImages, ImagesReady) => Some(Completed),
        (CharactersExtracted | TextApproved | Completed, RegenerateCoreImage) => Some(current),
        (CharactersExtracted | TextApproved | Completed, GenerateCharacterImage) => Some(current),
        (TextApproved | Completed, RegeneratePageImage) => Some(current),
        (TextApproved | Completed, RestoreImageVersion) => Some(current),
        _ => None,
    }
}

/// 허용되지 않는 이벤트면 `InvalidTransition`
pub fn check_transition(current: StoryStatus, event: WorkflowEvent) -> Result<StoryStatus, AppError> {
    next_status(current, event).ok_or(AppError::InvalidTransition { from: current, event })
}

fn char_len(value: &str) -> usize {
    value.trim().chars().count()
}

fn require_min(field: &str, value: &str, min: usize) -> Result<(), AppError> {
    if char_len(value) < min {
        return Err(AppError::Validation(format!(
            "{} must be at least {} characters",
            field, min
        )));
    }
    Ok(())
}

/// 스토리 생성 입력 검증
pub fn validate_new_story(req: &CreateStoryRequest) -> Result<(), AppError> {
    if let Some(title) = &req.title {
        if char_len(title) > 200 {
            return Err(AppError::Validation(
                "title must be at most 200 characters".to_string(),
            ));
        }
    }
    require_min("setting", &req.setting, 10)?;
    require_min("characters", &req.characters, 10)?;
    require_min("plot", &req.plot, 20)?;

    if !(MIN_PAGES..=MAX_PAGES).contains(&req.total_pages) {
        return Err(AppError::Validation(format!(
            "totalPages must be between {} and {}",
            MIN_PAGES, MAX_PAGES
        )));
    }
    if !AGE_GROUPS.contains(&req.age_group.as_str()) {
        return Err(AppError::Validation(format!(
            "ageGroup must be one of {}",
            AGE_GROUPS.join(", ")
        )));
    }
    Ok(())
}

pub fn validate_expanded_setting(expanded: &str) -> Result<String, AppError> {
    require_min("expandedSetting", expanded, 20)?;
    Ok(expanded.trim().to_string())
}

/// 승인된 캐릭터 목록을 만듭니다.
///
/// 기존 캐릭터 ID가 주어지면 그 ID와 초상화 URL을 유지하고,
/// 새 캐릭터에는 새 ID를 부여합니다.
pub fn approved_characters(
    existing: &[Character],
    inputs: &[CharacterInput],
) -> Result<Vec<Character>, AppError> {
    if inputs.is_empty() || inputs.len() > MAX_CHARACTERS {
        return Err(AppError::Validation(format!(
            "between 1 and {} characters are required",
            MAX_CHARACTERS
        )));
    }

    let known: HashMap<&str, &Character> = existing.iter().map(|c| (c.id.as_str(), c)).collect();

    inputs
        .iter()
        .map(|input| {
            if input.name.trim().is_empty() {
                return Err(AppError::Validation("character name is required".to_string()));
            }
            require_min(
                &format!("description of '{}'", input.name.trim()),
                &input.description,
                10,
            )?;

            let previous = input.id.as_deref().and_then(|id| known.get(id));
            Ok(Character {
                id: previous
                    .map(|c| c.id.clone())
                    .unwrap_or_else(|| uuid::Uuid::now_v7().to_string()),
                name: input.name.trim().to_string(),
                description: input.description.trim().to_string(),
                image_url: previous.and_then(|c| c.image_url.clone()),
            })
        })
        .collect()
}

/// 본문 수정 입력 검증: 정확히 total_pages 장, 1..=n 번호, 빈 본문 없음.
pub fn validate_page_texts(pages: &[PageText], total_pages: i64) -> Result<Vec<PageText>, AppError> {
    if pages.len() as i64 != total_pages {
        return Err(AppError::Validation(format!(
            "exactly {} pages are required, got {}",
            total_pages,
            pages.len()
        )));
    }

    let mut sorted = pages.to_vec();
    sorted.sort_by_key(|p| p.page_number);
    for (index, page) in sorted.iter().enumerate() {
        if page.page_number != index as i64 + 1 {
            return Err(AppError::Validation(format!(
                "pages must be numbered 1 to {}",
                total_pages
            )));
        }
        if page.text.trim().is_empty() {
            return Err(AppError::Validation(format!(
                "page {} has no text",
                page.page_number
            )));
        }
    }
    Ok(sorted)
}

/// 사용자가 요청하는 상태 전이와 그 입력
#[derive(Debug, Clone)]
pub enum TransitionRequest {
    ApproveSetting(ApproveSettingRequest),
    ApproveCharacters(ApproveCharactersRequest),
    ApproveText(ApproveTextRequest),
    StartImageGeneration,
}

impl TransitionRequest {
    pub fn event(&self) -> WorkflowEvent {
        match self {
            TransitionRequest::ApproveSetting(_) => WorkflowEvent::ApproveSetting,
            TransitionRequest::ApproveCharacters(_) => WorkflowEvent::ApproveCharacters,
            TransitionRequest::ApproveText(_) => WorkflowEvent::ApproveText,
            TransitionRequest::StartImageGeneration => WorkflowEvent::StartImageGeneration,
        }
    }
}

/// 전이 결과: 이미 끝났거나, 백그라운드에서 실행할 이미지 작업이 준비됨
#[derive(Debug)]
pub enum Transition {
    Completed(StageOutcome),
    Scheduled(ImageJob),
}

#[derive(Debug, Clone)]
pub struct Workflow {
    pool: SqlitePool,
    orchestrator: Orchestrator,
}

impl Workflow {
    pub fn new(pool: SqlitePool, orchestrator: Orchestrator) -> Self {
        Self { pool, orchestrator }
    }

    /// 새 스토리를 `draft` 상태로 만듭니다.
    pub async fn create_story(&self, user_id: &str, req: &CreateStoryRequest) -> Result<Story, AppError> {
        validate_new_story(req)?;

        let id = uuid::Uuid::now_v7().to_string();
        let title = req.title.as_deref().map(str::trim).unwrap_or("");
        let story = db::create_story(&self.pool, &id, user_id, title, req).await?;

        tracing::info!(story_id = %story.id, total_pages = story.total_pages, "Created story");
        Ok(story)
    }

    pub async fn request_transition(
        &self,
        story_id: &str,
        user_id: &str,
        request: TransitionRequest,
    ) -> Result<Transition, AppError> {
        let (guard, story) = self.orchestrator.claim_story(story_id, user_id).await?;
        let event = request.event();
        let next = check_transition(story.status, event)?;

        tracing::debug!(
            story_id = %story_id,
            event = %event,
            from = %story.status,
            to = %next,
            "Accepted workflow transition"
        );

        match request {
            TransitionRequest::ApproveSetting(req) => {
                let expanded = validate_expanded_setting(&req.expanded_setting)?;
                let outcome = self
                    .orchestrator
                    .extract_characters(guard, story, expanded)
                    .await?;
                Ok(Transition::Completed(outcome))
            }
            TransitionRequest::ApproveCharacters(req) => {
                let characters = approved_characters(&story.extracted_characters, &req.characters)?;
                let outcome = self
                    .orchestrator
                    .generate_story_text(guard, story, characters)
                    .await?;
                Ok(Transition::Completed(outcome))
            }
            TransitionRequest::ApproveText(req) => {
                let pages = validate_page_texts(&req.pages, story.total_pages)?;
                if let Some(title) = &req.title {
                    if char_len(title) == 0 || char_len(title) > 200 {
                        return Err(AppError::Validation(
                            "title must be between 1 and 200 characters".to_string(),
                        ));
                    }
                }

                db::update_page_texts(&self.pool, story_id, req.title.as_deref(), &pages).await?;
                drop(guard);

                let story = db::get_story(&self.pool, story_id, user_id)
                    .await?
                    .ok_or(AppError::NotFound)?;
                Ok(Transition::Completed(StageOutcome::without_generation(story)))
            }
            TransitionRequest::StartImageGeneration => {
                let job = self.orchestrator.begin_image_generation(guard, story).await?;
                Ok(Transition::Scheduled(job))
            }
        }
    }
}
