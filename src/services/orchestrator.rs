//! # 생성 오케스트레이터 (Generation Orchestrator)
//!
//! 단계별로 제공자 호출을 순서대로 실행하고, 진행 이벤트를 발행하고,
//! 결과를 한 트랜잭션으로 커밋합니다.
//!
//! ## 규칙
//! - 스토리당 동시에 하나의 작업만 실행합니다 (`JobRegistry`). 두 번째 요청은 `JobInProgress`.
//! - 트랜잭션은 제공자 호출 동안 열어두지 않습니다. 결과를 모두 모은 뒤 한 번에 커밋합니다.
//! - 단계가 실패하면 중간 상태(`setting_expansion`, `generating_images`)를 호출 전 상태로 되돌린 뒤
//!   `error` 이벤트를 발행합니다. 부분 커밋은 없습니다.
//! - 단계 future가 끝나지 못하고 drop되어도(태스크 abort, 클라이언트 연결 끊김) `StageRollback`이
//!   중간 상태를 되돌리고, 그 다음에 작업 슬롯을 풉니다.
//! - 이미지 단계는 페이지 번호 오름차순으로 생성하며, 각 페이지는 직전 페이지의 이미지 URL을 참조합니다.
//! - 페이지 이미지의 활성 버전 전환(재생성/복원)은 스토리의 공유 슬롯을 쥔 채
//!   (story_id, page_number) 잠금으로 직렬화합니다. 단독 작업과는 동시에 돌지 않습니다.
//! - 소유자 확인이 슬롯 확인보다 먼저입니다. 남의 스토리에는 항상 `NotFound`.

use serde::Serialize;
use sqlx::SqlitePool;

use crate::db::{self, NewImageVersion};
use crate::error::AppError;
use crate::models::*;
use crate::services::events::{EventBus, ProgressEvent, Stage};
use crate::services::jobs::{JobGuard, JobRegistry, PageLocks};
use crate::services::provider::*;
use crate::services::workflow::{check_transition, WorkflowEvent, MAX_CHARACTERS};

/// 단계 실행 결과
#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    pub story: Story,
    /// 제공자를 호출한 단계에서만 설정됩니다. 하나라도 대체되었으면 `offline`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_mode: Option<GenerationMode>,
    /// 오프라인 대체 이미지가 들어간 페이지 번호
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub offline_pages: Vec<i64>,
}

impl StageOutcome {
    pub fn without_generation(story: Story) -> Self {
        Self { story, generation_mode: None, offline_pages: Vec::new() }
    }

    fn generated(story: Story, mode: GenerationMode) -> Self {
        Self { story, generation_mode: Some(mode), offline_pages: Vec::new() }
    }
}

/// 리비전 복원 결과: 복원된 스토리와 복원 직전 상태를 담은 자동 체크포인트
#[derive(Debug, Clone, Serialize)]
pub struct RevisionRestore {
    pub story: Story,
    pub checkpoint: StoryRevision,
}

/// 중간 상태를 기록한 단계의 되돌리기 담당.
///
/// 단계가 커밋되면 `disarm`, 실패하면 `revert`로 소비됩니다. 둘 다 없이 drop되면
/// 백그라운드에서 상태를 되돌리고, 되돌린 뒤에 작업 슬롯을 풉니다.
#[derive(Debug)]
#[must_use]
struct StageRollback {
    pool: SqlitePool,
    guard: Option<JobGuard>,
    during: StoryStatus,
    prior: StoryStatus,
}

impl StageRollback {
    fn arm(pool: &SqlitePool, guard: JobGuard, during: StoryStatus, prior: StoryStatus) -> Self {
        Self {
            pool: pool.clone(),
            guard: Some(guard),
            during,
            prior,
        }
    }

    fn story_id(&self) -> &str {
        self.guard.as_ref().map(JobGuard::story_id).unwrap_or_default()
    }

    fn disarm(mut self) {
        self.guard.take();
    }

    async fn revert(mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        revert_status(&self.pool, guard.story_id(), self.during, self.prior).await;
    }
}

impl Drop for StageRollback {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                story_id = %guard.story_id(),
                "Stage dropped without a runtime, status is reset on next startup"
            );
            return;
        };

        tracing::warn!(story_id = %guard.story_id(), "Stage interrupted, rolling back status");
        let (pool, during, prior) = (self.pool.clone(), self.during, self.prior);
        runtime.spawn(async move {
            revert_status(&pool, guard.story_id(), during, prior).await;
            drop(guard);
        });
    }
}

async fn revert_status(pool: &SqlitePool, story_id: &str, from: StoryStatus, to: StoryStatus) {
    match db::set_status(pool, story_id, from, to).await {
        Ok(true) => tracing::debug!(story_id = %story_id, "Rolled back story status to '{}'", to),
        Ok(false) => tracing::warn!(
            story_id = %story_id,
            expected = %from,
            "Story left '{}' before rollback",
            from
        ),
        Err(err) => tracing::error!(
            story_id = %story_id,
            error = %err,
            "Failed to roll back story status to '{}'",
            to
        ),
    }
}

/// 작업 슬롯을 쥐고 실행을 기다리는 이미지 생성 작업.
/// 상태는 이미 `generating_images`로 바뀌어 있고, 실행되지 않고 drop되면 되돌려집니다.
#[derive(Debug)]
pub struct ImageJob {
    rollback: StageRollback,
    story: Story,
}

impl ImageJob {
    pub fn story_id(&self) -> &str {
        self.rollback.story_id()
    }
}

#[derive(Debug, Clone)]
pub struct Orchestrator {
    pool: SqlitePool,
    provider: ProviderAdapter,
    events: EventBus,
    jobs: JobRegistry,
    page_locks: PageLocks,
}

impl Orchestrator {
    pub fn new(pool: SqlitePool, provider: ProviderAdapter, events: EventBus) -> Self {
        Self {
            pool,
            provider,
            events,
            jobs: JobRegistry::new(),
            page_locks: PageLocks::new(),
        }
    }

    #[cfg(test)]
    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    pub fn provider_is_live(&self) -> bool {
        self.provider.is_live()
    }

    async fn reload(&self, story_id: &str) -> Result<Story, AppError> {
        let mut conn = self.pool.acquire().await?;
        db::load_story(&mut conn, story_id)
            .await?
            .ok_or(AppError::NotFound)
    }

    async fn owned_story(&self, story_id: &str, user_id: &str) -> Result<Story, AppError> {
        db::get_story(&self.pool, story_id, user_id)
            .await?
            .ok_or(AppError::NotFound)
    }

    /// 소유자 확인 → 단독 슬롯 → 슬롯을 쥔 상태에서 스토리를 다시 읽습니다.
    pub async fn claim_story(&self, story_id: &str, user_id: &str) -> Result<(JobGuard, Story), AppError> {
        if !db::story_belongs_to(&self.pool, story_id, user_id).await? {
            return Err(AppError::NotFound);
        }
        let guard = self.jobs.try_acquire(story_id)?;
        let story = self.owned_story(story_id, user_id).await?;
        Ok((guard, story))
    }

    /// `claim_story`의 페이지 작업판: 공유 슬롯을 차지합니다.
    async fn claim_page(&self, story_id: &str, user_id: &str) -> Result<(JobGuard, Story), AppError> {
        if !db::story_belongs_to(&self.pool, story_id, user_id).await? {
            return Err(AppError::NotFound);
        }
        let guard = self.jobs.try_share(story_id)?;
        let story = self.owned_story(story_id, user_id).await?;
        Ok((guard, story))
    }

    /// 단계 실패 처리: 상태 되돌리기 → `error` 이벤트 발행.
    ///
    /// `started`는 단계 시작 때 발행한 이벤트로, 페이지/캐릭터 정보를 그대로 가져갑니다.
    async fn fail_stage(
        &self,
        started: &ProgressEvent,
        rollback: Option<StageRollback>,
        err: impl Into<AppError>,
    ) -> AppError {
        let err = err.into();

        if let Some(rollback) = rollback {
            rollback.revert().await;
        }

        tracing::warn!(
            story_id = %started.story_id,
            stage = ?started.stage,
            error = %err,
            "Generation stage failed"
        );

        self.events.publish(started.clone().into_error(err.to_string()));
        err
    }

    /// 설정 확장 제안 (`draft`에서만, 상태는 그대로)
    pub async fn expand_setting(&self, story_id: &str, user_id: &str) -> Result<StageOutcome, AppError> {
        let (_guard, story) = self.claim_story(story_id, user_id).await?;
        check_transition(story.status, WorkflowEvent::ExpandSetting)?;

        let started = ProgressEvent::start(story_id, Stage::SettingExpansion);
        self.events.publish(started.clone());

        let req = SettingRequest {
            setting: &story.setting,
            plot: &story.plot,
            age_group: &story.age_group,
        };
        let generated = match self.provider.expand_setting(&req).await {
            Ok(generated) => generated,
            Err(err) => return Err(self.fail_stage(&started, None, err).await),
        };

        if let Err(err) = db::save_expanded_setting(&self.pool, story_id, &generated.value).await {
            return Err(self.fail_stage(&started, None, err).await);
        }

        self.events
            .publish(ProgressEvent::complete(story_id, Stage::SettingExpansion).mode(generated.mode));
        Ok(StageOutcome::generated(self.reload(story_id).await?, generated.mode))
    }

    /// 설정 승인 이후: `setting_expansion`을 기록하고 캐릭터를 추출해 `characters_extracted`로 커밋합니다.
    pub async fn extract_characters(
        &self,
        guard: JobGuard,
        story: Story,
        expanded_setting: String,
    ) -> Result<StageOutcome, AppError> {
        let story_id = story.id.as_str();
        let prior = story.status;
        let during = check_transition(prior, WorkflowEvent::ApproveSetting)?;
        let after = check_transition(during, WorkflowEvent::CharactersReady)?;

        db::begin_setting_approval(&self.pool, story_id, &expanded_setting, prior, during).await?;
        let rollback = StageRollback::arm(&self.pool, guard, during, prior);

        let started = ProgressEvent::start(story_id, Stage::CharacterExtraction);
        self.events.publish(started.clone());

        let req = CharacterRequest {
            setting: &expanded_setting,
            characters: &story.characters,
            plot: &story.plot,
        };
        let generated = match self.provider.extract_characters(&req).await {
            Ok(generated) => generated,
            Err(err) => return Err(self.fail_stage(&started, Some(rollback), err).await),
        };
        let mode = generated.mode;

        let characters: Vec<Character> = generated
            .value
            .into_iter()
            .take(MAX_CHARACTERS)
            .map(|draft| Character {
                id: uuid::Uuid::now_v7().to_string(),
                name: draft.name.trim().to_string(),
                description: draft.description.trim().to_string(),
                image_url: None,
            })
            .collect();

        if let Err(err) = db::commit_characters(&self.pool, story_id, &characters, during, after).await {
            return Err(self.fail_stage(&started, Some(rollback), err).await);
        }
        rollback.disarm();

        self.events.publish(
            ProgressEvent::complete(story_id, Stage::CharacterExtraction)
                .message(format!("{} characters extracted", characters.len()))
                .mode(mode),
        );
        Ok(StageOutcome::generated(self.reload(story_id).await?, mode))
    }

    /// 캐릭터 승인 이후: 본문을 생성하고 캐릭터/페이지와 함께 `text_approved`로 커밋합니다.
    pub async fn generate_story_text(
        &self,
        _guard: JobGuard,
        story: Story,
        characters: Vec<Character>,
    ) -> Result<StageOutcome, AppError> {
        let story_id = story.id.as_str();
        let prior = story.status;
        let after = check_transition(prior, WorkflowEvent::ApproveCharacters)?;

        let started = ProgressEvent::start(story_id, Stage::StoryText);
        self.events.publish(started.clone());

        let spec = StoryTextSpec {
            title: &story.title,
            setting: story.effective_setting(),
            characters: &characters,
            plot: &story.plot,
            age_group: &story.age_group,
            total_pages: story.total_pages as usize,
        };
        let generated = match self.provider.generate_story_text(&spec).await {
            Ok(generated) => generated,
            Err(err) => return Err(self.fail_stage(&started, None, err).await),
        };

        // 사용자가 제목을 정하지 않았을 때만 생성된 제목을 씁니다
        let title = if story.title.trim().is_empty() {
            generated.value.title.as_str()
        } else {
            story.title.as_str()
        };

        if let Err(err) = db::commit_story_text(
            &self.pool,
            story_id,
            title,
            &characters,
            &generated.value.pages,
            prior,
            after,
        )
        .await
        {
            return Err(self.fail_stage(&started, None, err).await);
        }

        self.events.publish(
            ProgressEvent::complete(story_id, Stage::StoryText)
                .message(format!("{} pages written", generated.value.pages.len()))
                .mode(generated.mode),
        );
        Ok(StageOutcome::generated(self.reload(story_id).await?, generated.mode))
    }

    /// 이미지 단계를 시작 상태로 만듭니다 (`generating_images` 기록).
    ///
    /// 실제 생성은 반환된 작업을 `run_image_job`으로 실행할 때 일어납니다.
    pub async fn begin_image_generation(&self, guard: JobGuard, story: Story) -> Result<ImageJob, AppError> {
        let event = WorkflowEvent::StartImageGeneration;
        let during = check_transition(story.status, event)?;

        if story.pages.len() as i64 != story.total_pages {
            return Err(AppError::PageCountMismatch {
                expected: story.total_pages as usize,
                actual: story.pages.len(),
            });
        }

        if !db::set_status(&self.pool, &story.id, story.status, during).await? {
            return Err(AppError::InvalidTransition { from: story.status, event });
        }

        tracing::info!(story_id = %story.id, pages = story.pages.len(), "Image generation scheduled");
        let rollback = StageRollback::arm(&self.pool, guard, during, story.status);
        Ok(ImageJob { rollback, story })
    }

    /// 코어 이미지 → 페이지 1..n 순서로 생성하고 한 트랜잭션으로 `completed`까지 커밋합니다.
    pub async fn run_image_job(&self, job: ImageJob) -> Result<StageOutcome, AppError> {
        let ImageJob { rollback, story } = job;
        let story_id = story.id.as_str();
        let during = rollback.during;

        let started = ProgressEvent::start(story_id, Stage::Images)
            .message(format!("{} pages", story.pages.len()));
        self.events.publish(started.clone());

        let core_req = CoreImageRequest {
            setting: story.effective_setting(),
            characters: &story.extracted_characters,
            custom_prompt: None,
        };
        let core = match self.provider.generate_core_image(&core_req).await {
            Ok(core) => core,
            Err(err) => return Err(self.fail_stage(&started, Some(rollback), err).await),
        };
        self.events.publish(
            ProgressEvent::progress(story_id, Stage::Images)
                .message("core image ready")
                .image(&core.value.url, core.mode),
        );

        let mut mode = core.mode;
        let mut offline_pages = Vec::new();
        let mut versions = Vec::with_capacity(story.pages.len());
        let mut previous: Option<String> = None;

        for page in &story.pages {
            let req = PageImageRequest {
                page_number: page.page_number,
                page_text: &page.text,
                core_image: Some(&core.value.url),
                previous_image: previous.as_deref(),
                custom_prompt: None,
            };
            let generated = match self.provider.generate_page_image(&req).await {
                Ok(generated) => generated,
                Err(err) => return Err(self.fail_stage(&started, Some(rollback), err).await),
            };

            self.events.publish(
                ProgressEvent::progress(story_id, Stage::Images)
                    .page(page.page_number)
                    .image(&generated.value.url, generated.mode),
            );

            if generated.mode == GenerationMode::Offline {
                offline_pages.push(page.page_number);
            }
            mode = mode.combine(generated.mode);
            previous = Some(generated.value.url.clone());
            versions.push(NewImageVersion {
                page_number: page.page_number,
                url: generated.value.url,
                prompt: generated.value.prompt,
                mode: generated.mode,
            });
        }

        let after = match check_transition(during, WorkflowEvent::ImagesReady) {
            Ok(after) => after,
            Err(err) => return Err(self.fail_stage(&started, Some(rollback), err).await),
        };
        if let Err(err) =
            db::commit_images(&self.pool, story_id, &core.value.url, &versions, during, after).await
        {
            return Err(self.fail_stage(&started, Some(rollback), err).await);
        }
        rollback.disarm();

        self.events
            .publish(ProgressEvent::complete(story_id, Stage::Images).mode(mode));
        tracing::info!(
            story_id = %story_id,
            pages = versions.len(),
            mode = mode.as_str(),
            offline_pages = offline_pages.len(),
            "Image generation completed"
        );

        Ok(StageOutcome {
            story: self.reload(story_id).await?,
            generation_mode: Some(mode),
            offline_pages,
        })
    }

    /// 페이지 이미지 한 장을 다시 생성해 새 활성 버전으로 추가합니다.
    pub async fn regenerate_image(
        &self,
        story_id: &str,
        user_id: &str,
        page_number: i64,
        custom_prompt: Option<&str>,
    ) -> Result<ImageVersion, AppError> {
        let (_slot, story) = self.claim_page(story_id, user_id).await?;
        check_transition(story.status, WorkflowEvent::RegeneratePageImage)?;
        let page = story.page(page_number).ok_or(AppError::NotFound)?;

        let _page_lock = self.page_locks.lock(story_id, page_number).await;

        let started = ProgressEvent::start(story_id, Stage::PageImage).page(page_number);
        self.events.publish(started.clone());

        let req = PageImageRequest {
            page_number,
            page_text: &page.text,
            core_image: story.core_image_url.as_deref(),
            previous_image: story
                .page(page_number - 1)
                .and_then(|p| p.image_url.as_deref()),
            custom_prompt: custom_prompt.map(str::trim).filter(|p| !p.is_empty()),
        };
        let generated = match self.provider.generate_page_image(&req).await {
            Ok(generated) => generated,
            Err(err) => return Err(self.fail_stage(&started, None, err).await),
        };

        let new = NewImageVersion {
            page_number,
            url: generated.value.url,
            prompt: generated.value.prompt,
            mode: generated.mode,
        };
        let version = match db::append_page_version(&self.pool, story_id, &new).await {
            Ok(version) => version,
            Err(err) => return Err(self.fail_stage(&started, None, err).await),
        };

        self.events.publish(
            ProgressEvent::complete(story_id, Stage::PageImage)
                .page(page_number)
                .image(&version.url, version.generation_mode),
        );
        Ok(version)
    }

    /// 이력의 버전을 다시 활성화합니다. 이력에 없으면 `VersionNotFound`.
    pub async fn restore_image_version(
        &self,
        story_id: &str,
        user_id: &str,
        page_number: i64,
        version_id: &str,
    ) -> Result<StoryPage, AppError> {
        let (_slot, story) = self.claim_page(story_id, user_id).await?;
        check_transition(story.status, WorkflowEvent::RestoreImageVersion)?;
        story.page(page_number).ok_or(AppError::NotFound)?;

        let _page_lock = self.page_locks.lock(story_id, page_number).await;
        let page = db::activate_version(&self.pool, story_id, page_number, version_id).await?;

        tracing::info!(
            story_id = %story_id,
            page_number,
            version_id = %version_id,
            "Restored image version"
        );
        Ok(page)
    }

    /// 코어(표지) 이미지를 다시 생성합니다.
    pub async fn regenerate_core_image(
        &self,
        story_id: &str,
        user_id: &str,
        custom_prompt: Option<&str>,
    ) -> Result<StageOutcome, AppError> {
        let (_guard, story) = self.claim_story(story_id, user_id).await?;
        check_transition(story.status, WorkflowEvent::RegenerateCoreImage)?;

        let started = ProgressEvent::start(story_id, Stage::CoreImage);
        self.events.publish(started.clone());

        let req = CoreImageRequest {
            setting: story.effective_setting(),
            characters: &story.extracted_characters,
            custom_prompt: custom_prompt.map(str::trim).filter(|p| !p.is_empty()),
        };
        let generated = match self.provider.generate_core_image(&req).await {
            Ok(generated) => generated,
            Err(err) => return Err(self.fail_stage(&started, None, err).await),
        };

        if let Err(err) = db::set_core_image_url(&self.pool, story_id, &generated.value.url).await {
            return Err(self.fail_stage(&started, None, err).await);
        }

        self.events.publish(
            ProgressEvent::complete(story_id, Stage::CoreImage)
                .image(&generated.value.url, generated.mode),
        );
        Ok(StageOutcome::generated(self.reload(story_id).await?, generated.mode))
    }

    /// 캐릭터 초상화를 생성해 캐릭터의 image_url에 저장합니다.
    pub async fn generate_character_image(
        &self,
        story_id: &str,
        user_id: &str,
        character_id: &str,
    ) -> Result<Character, AppError> {
        let (_guard, story) = self.claim_story(story_id, user_id).await?;
        check_transition(story.status, WorkflowEvent::GenerateCharacterImage)?;
        let character = story
            .extracted_characters
            .iter()
            .find(|c| c.id == character_id)
            .ok_or(AppError::NotFound)?;

        let started = ProgressEvent::start(story_id, Stage::CharacterImage).character(character_id);
        self.events.publish(started.clone());

        let req = CharacterImageRequest {
            name: &character.name,
            description: &character.description,
            setting: story.effective_setting(),
        };
        let generated = match self.provider.generate_character_image(&req).await {
            Ok(generated) => generated,
            Err(err) => return Err(self.fail_stage(&started, None, err).await),
        };

        match db::set_character_image_url(&self.pool, story_id, character_id, &generated.value.url).await {
            Ok(true) => {}
            Ok(false) => return Err(self.fail_stage(&started, None, AppError::NotFound).await),
            Err(err) => return Err(self.fail_stage(&started, None, err).await),
        }

        self.events.publish(
            ProgressEvent::complete(story_id, Stage::CharacterImage)
                .character(character_id)
                .image(&generated.value.url, generated.mode),
        );
        Ok(Character {
            image_url: Some(generated.value.url),
            ..character.clone()
        })
    }

    /// 현재 상태를 리비전으로 남깁니다.
    ///
    /// `step_completed`를 지정하면 현재보다 앞선(또는 같은) 휴지 상태여야 합니다.
    pub async fn create_revision(
        &self,
        story_id: &str,
        user_id: &str,
        req: &CreateRevisionRequest,
    ) -> Result<StoryRevision, AppError> {
        let (_guard, story) = self.claim_story(story_id, user_id).await?;

        let step = req.step_completed.unwrap_or(story.status);
        if !step.is_resting() || step.rank() > story.status.rank() {
            return Err(AppError::Validation(format!(
                "stepCompleted '{}' is not a completed step of a story in '{}'",
                step, story.status
            )));
        }

        let description = req
            .description
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty());
        let revision = db::create_revision(&self.pool, story_id, step, description).await?;

        tracing::info!(
            story_id = %story_id,
            revision = revision.revision_number,
            parent = ?revision.parent_revision,
            step = %step,
            "Created story revision"
        );
        Ok(revision)
    }

    /// 리비전으로 복원합니다. 복원 직전 상태는 자동 체크포인트로 남습니다.
    pub async fn restore_revision(
        &self,
        story_id: &str,
        user_id: &str,
        revision_number: i64,
    ) -> Result<RevisionRestore, AppError> {
        // 단독 슬롯이므로 페이지 작업(공유 슬롯)과 겹치지 않습니다
        let (_guard, _story) = self.claim_story(story_id, user_id).await?;

        let checkpoint = db::restore_revision(&self.pool, story_id, revision_number).await?;
        Ok(RevisionRestore {
            story: self.reload(story_id).await?,
            checkpoint,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::Notify;

    use super::*;
    use crate::db::testing::memory_pool;
    use crate::services::events::EventKind;
    use crate::services::provider::offline::OfflineProvider;
    use crate::services::provider::testing::{PageCall, PageHold, ScriptedProvider};
    use crate::services::workflow::{Transition, TransitionRequest, Workflow};

    const USER: &str = "user-1";

    struct Harness {
        pool: SqlitePool,
        events: EventBus,
        orchestrator: Orchestrator,
        workflow: Workflow,
        page_log: Arc<std::sync::Mutex<Vec<PageCall>>>,
        page_hold: PageHold,
    }

    async fn harness(live: ScriptedProvider) -> Harness {
        let pool = memory_pool().await;
        let page_log = live.page_log();
        let page_hold = live.page_hold();
        let provider = ProviderAdapter::new(
            Some(Arc::new(live)),
            Arc::new(OfflineProvider),
            Duration::from_secs(5),
        );
        let events = EventBus::new(64);
        let orchestrator = Orchestrator::new(pool.clone(), provider, events.clone());
        let workflow = Workflow::new(pool.clone(), orchestrator.clone());

        Harness { pool, events, orchestrator, workflow, page_log, page_hold }
    }

    fn create_request(total_pages: i64) -> CreateStoryRequest {
        CreateStoryRequest {
            title: Some("The Lantern Fox".into()),
            setting: "A quiet forest by the sea".into(),
            characters: "Mori the fox, Bell the owl, Pip the crab".into(),
            plot: "Mori looks for the moon that fell into the sea".into(),
            age_group: "6-8".into(),
            total_pages,
        }
    }

    fn completed(transition: Transition) -> StageOutcome {
        match transition {
            Transition::Completed(outcome) => outcome,
            Transition::Scheduled(_) => panic!("expected a completed transition"),
        }
    }

    fn scheduled(transition: Transition) -> ImageJob {
        match transition {
            Transition::Scheduled(job) => job,
            Transition::Completed(_) => panic!("expected a scheduled image job"),
        }
    }

    fn three_characters() -> Vec<CharacterInput> {
        ["Mori", "Bell", "Pip"]
            .iter()
            .map(|name| CharacterInput {
                id: None,
                name: name.to_string(),
                description: format!("{} is kind and brave", name),
            })
            .collect()
    }

    async fn approve_setting(h: &Harness, story_id: &str) -> StageOutcome {
        let request = TransitionRequest::ApproveSetting(ApproveSettingRequest {
            expanded_setting: "A quiet forest by the sea at dusk".into(),
        });
        completed(h.workflow.request_transition(story_id, USER, request).await.unwrap())
    }

    async fn story_with_text(h: &Harness) -> Story {
        let story = h.workflow.create_story(USER, &create_request(5)).await.unwrap();
        approve_setting(h, &story.id).await;

        let request = TransitionRequest::ApproveCharacters(ApproveCharactersRequest {
            characters: three_characters(),
        });
        completed(h.workflow.request_transition(&story.id, USER, request).await.unwrap()).story
    }

    async fn start_images(h: &Harness, story_id: &str) -> Result<ImageJob, AppError> {
        h.workflow
            .request_transition(story_id, USER, TransitionRequest::StartImageGeneration)
            .await
            .map(scheduled)
    }

    async fn completed_story(h: &Harness) -> Story {
        let story = story_with_text(h).await;
        let job = start_images(h, &story.id).await.unwrap();
        h.orchestrator.run_image_job(job).await.unwrap().story
    }

    fn active_versions(page: &StoryPage) -> Vec<&ImageVersion> {
        page.image_history.iter().filter(|v| v.is_active).collect()
    }

    #[tokio::test]
    async fn five_page_story_runs_from_draft_to_completed() {
        let h = harness(ScriptedProvider::new()).await;

        let story = h.workflow.create_story(USER, &create_request(5)).await.unwrap();
        assert_eq!(story.status, StoryStatus::Draft);

        let outcome = approve_setting(&h, &story.id).await;
        assert_eq!(outcome.story.status, StoryStatus::CharactersExtracted);
        assert_eq!(outcome.story.extracted_characters.len(), 2);
        assert_eq!(outcome.generation_mode, Some(GenerationMode::Live));

        let request = TransitionRequest::ApproveCharacters(ApproveCharactersRequest {
            characters: three_characters(),
        });
        let outcome = completed(h.workflow.request_transition(&story.id, USER, request).await.unwrap());
        assert_eq!(outcome.story.status, StoryStatus::TextApproved);
        assert_eq!(outcome.story.pages.len(), 5);
        assert_eq!(outcome.story.extracted_characters.len(), 3);
        assert_eq!(outcome.story.title, "The Lantern Fox");

        let mut rx = h.events.subscribe(&story.id);
        let job = start_images(&h, &story.id).await.unwrap();
        assert_eq!(h.orchestrator.reload(&story.id).await.unwrap().status, StoryStatus::GeneratingImages);

        let outcome = h.orchestrator.run_image_job(job).await.unwrap();
        let story = outcome.story;
        assert_eq!(story.status, StoryStatus::Completed);
        assert!(story.core_image_url.is_some());
        assert!(outcome.offline_pages.is_empty());
        for page in &story.pages {
            assert_eq!(page.image_history.len(), 1);
            let active = active_versions(page);
            assert_eq!(active.len(), 1);
            assert_eq!(page.image_url.as_deref(), Some(active[0].url.as_str()));
        }

        // 페이지는 오름차순으로, 직전 페이지 이미지를 참조하며 생성됨
        let calls = h.page_log.lock().unwrap().clone();
        let numbers: Vec<i64> = calls.iter().map(|c| c.page_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
        assert_eq!(calls[0].previous_image, None);
        for (call, previous_page) in calls.iter().skip(1).zip(&story.pages) {
            assert_eq!(call.previous_image, previous_page.image_url);
            assert_eq!(call.core_image, story.core_image_url);
        }

        // start → core 진행 → 페이지 5개 진행 → complete
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push((event.kind, event.page_number));
        }
        assert_eq!(kinds.first(), Some(&(EventKind::Start, None)));
        assert_eq!(kinds.last(), Some(&(EventKind::Complete, None)));
        let pages: Vec<i64> = kinds.iter().filter_map(|(_, page)| *page).collect();
        assert_eq!(pages, vec![1, 2, 3, 4, 5]);
        assert_eq!(kinds.len(), 8);
    }

    #[tokio::test]
    async fn quota_error_on_page_three_falls_back_and_still_completes() {
        let live = ScriptedProvider::new()
            .fail_page(3, ProviderError::QuotaExceeded("insufficient_quota".into()));
        let h = harness(live).await;

        let story = story_with_text(&h).await;
        let job = start_images(&h, &story.id).await.unwrap();
        let outcome = h.orchestrator.run_image_job(job).await.unwrap();

        assert_eq!(outcome.story.status, StoryStatus::Completed);
        assert_eq!(outcome.generation_mode, Some(GenerationMode::Offline));
        assert_eq!(outcome.offline_pages, vec![3]);

        let page3 = outcome.story.page(3).unwrap();
        assert_eq!(page3.image_history[0].generation_mode, GenerationMode::Offline);
        assert!(page3.image_url.as_deref().unwrap().starts_with("https://placehold.co/"));
        let page4 = outcome.story.page(4).unwrap();
        assert_eq!(page4.image_history[0].generation_mode, GenerationMode::Live);

        // 4페이지는 오프라인으로 대체된 3페이지 이미지를 이어받음
        let calls = h.page_log.lock().unwrap().clone();
        assert_eq!(calls[3].previous_image, page3.image_url);
    }

    #[tokio::test]
    async fn hard_provider_failure_rolls_back_without_partial_commit() {
        let live = ScriptedProvider::new().fail_page(2, ProviderError::Failed("HTTP 500".into()));
        let h = harness(live).await;

        let story = story_with_text(&h).await;
        let mut rx = h.events.subscribe(&story.id);
        let job = start_images(&h, &story.id).await.unwrap();
        let err = h.orchestrator.run_image_job(job).await.unwrap_err();
        assert!(matches!(err, AppError::GenerationFailed(_)));

        let story = h.orchestrator.reload(&story.id).await.unwrap();
        assert_eq!(story.status, StoryStatus::TextApproved);
        assert!(story.core_image_url.is_none());
        assert!(story.pages.iter().all(|p| p.image_history.is_empty() && p.image_url.is_none()));
        assert!(!h.orchestrator.jobs().is_busy(&story.id));

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        let last = last.unwrap();
        assert_eq!(last.kind, EventKind::Error);
        assert_eq!(last.stage, Stage::Images);
        assert!(last.error.is_some());
    }

    #[tokio::test]
    async fn second_image_request_is_rejected_while_first_is_running() {
        let gate = Arc::new(Notify::new());
        let h = harness(ScriptedProvider::new().gated(Arc::clone(&gate))).await;

        let story = story_with_text(&h).await;
        let job = start_images(&h, &story.id).await.unwrap();
        assert_eq!(job.story_id(), story.id);

        let orchestrator = h.orchestrator.clone();
        let running = tokio::spawn(async move { orchestrator.run_image_job(job).await });

        let err = start_images(&h, &story.id).await.unwrap_err();
        assert!(matches!(err, AppError::JobInProgress(_)));
        let err = h
            .orchestrator
            .regenerate_image(&story.id, USER, 1, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::JobInProgress(_)));

        gate.notify_one();
        let outcome = running.await.unwrap().unwrap();
        assert_eq!(outcome.story.status, StoryStatus::Completed);

        // 작업이 끝나면 다음 요청은 성공
        let version = h
            .orchestrator
            .regenerate_image(&story.id, USER, 1, None)
            .await
            .unwrap();
        assert!(version.is_active);
    }

    #[tokio::test]
    async fn failed_image_stage_can_be_retried() {
        let live = ScriptedProvider::new().fail_core_once(ProviderError::Failed("HTTP 503".into()));
        let h = harness(live).await;
        let story = story_with_text(&h).await;

        let job = start_images(&h, &story.id).await.unwrap();
        assert!(h.orchestrator.run_image_job(job).await.is_err());

        let job = start_images(&h, &story.id).await.unwrap();
        let outcome = h.orchestrator.run_image_job(job).await.unwrap();
        assert_eq!(outcome.story.status, StoryStatus::Completed);
    }

    #[tokio::test]
    async fn approve_text_from_draft_fails_without_side_effects() {
        let h = harness(ScriptedProvider::new()).await;
        let story = h.workflow.create_story(USER, &create_request(5)).await.unwrap();

        let request = TransitionRequest::ApproveText(ApproveTextRequest {
            title: None,
            pages: Vec::new(),
        });
        let err = h.workflow.request_transition(&story.id, USER, request).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { from: StoryStatus::Draft, .. }));

        let after = h.orchestrator.reload(&story.id).await.unwrap();
        assert_eq!(after.status, StoryStatus::Draft);
        assert_eq!(after.updated_at, story.updated_at);
        assert!(after.pages.is_empty());
        assert!(!h.orchestrator.jobs().is_busy(&story.id));
    }

    #[tokio::test]
    async fn invalid_expanded_setting_keeps_story_in_draft() {
        let h = harness(ScriptedProvider::new()).await;
        let story = h.workflow.create_story(USER, &create_request(5)).await.unwrap();

        let request = TransitionRequest::ApproveSetting(ApproveSettingRequest {
            expanded_setting: "too short".into(),
        });
        let err = h.workflow.request_transition(&story.id, USER, request).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(h.orchestrator.reload(&story.id).await.unwrap().status, StoryStatus::Draft);

        // 설정 확장 제안은 draft에서만, 상태는 그대로
        let outcome = h.orchestrator.expand_setting(&story.id, USER).await.unwrap();
        assert_eq!(outcome.story.status, StoryStatus::Draft);
        assert!(outcome.story.expanded_setting.unwrap().starts_with("A quiet forest by the sea"));
    }

    #[tokio::test]
    async fn failed_text_generation_leaves_characters_extracted() {
        let live = ScriptedProvider::new().fail_text(ProviderError::Failed("HTTP 401".into()));
        let h = harness(live).await;
        let story = h.workflow.create_story(USER, &create_request(5)).await.unwrap();
        approve_setting(&h, &story.id).await;

        let request = TransitionRequest::ApproveCharacters(ApproveCharactersRequest {
            characters: three_characters(),
        });
        let err = h.workflow.request_transition(&story.id, USER, request).await.unwrap_err();
        assert!(matches!(err, AppError::GenerationFailed(_)));

        let after = h.orchestrator.reload(&story.id).await.unwrap();
        assert_eq!(after.status, StoryStatus::CharactersExtracted);
        assert_eq!(after.extracted_characters.len(), 2);
        assert!(after.pages.is_empty());
    }

    #[tokio::test]
    async fn wrong_page_count_is_replaced_by_offline_text() {
        let h = harness(ScriptedProvider::new().text_pages(4)).await;
        let story = story_with_text(&h).await;

        assert_eq!(story.status, StoryStatus::TextApproved);
        assert_eq!(story.pages.len() as i64, story.total_pages);
    }

    #[tokio::test]
    async fn edited_text_stays_text_approved() {
        let h = harness(ScriptedProvider::new()).await;
        let story = completed_story(&h).await;

        // completed에서는 본문 수정 불가
        let pages: Vec<PageText> = story
            .pages
            .iter()
            .map(|p| PageText { page_number: p.page_number, text: format!("Edited {}", p.page_number) })
            .collect();
        let request = TransitionRequest::ApproveText(ApproveTextRequest { title: None, pages: pages.clone() });
        assert!(matches!(
            h.workflow.request_transition(&story.id, USER, request).await,
            Err(AppError::InvalidTransition { .. })
        ));

        let story = story_with_text(&h).await;
        let request = TransitionRequest::ApproveText(ApproveTextRequest {
            title: Some("Moon Fox".into()),
            pages,
        });
        let outcome = completed(h.workflow.request_transition(&story.id, USER, request).await.unwrap());
        assert_eq!(outcome.story.status, StoryStatus::TextApproved);
        assert_eq!(outcome.story.title, "Moon Fox");
        assert_eq!(outcome.story.page(1).unwrap().text, "Edited 1");
        assert_eq!(outcome.generation_mode, None);
    }

    #[tokio::test]
    async fn restoring_an_older_version_on_page_two() {
        let h = harness(ScriptedProvider::new()).await;
        let story = completed_story(&h).await;
        let original = story.page(2).unwrap().image_history[0].clone();

        let newer = h
            .orchestrator
            .regenerate_image(&story.id, USER, 2, Some("a brighter moon"))
            .await
            .unwrap();
        assert_ne!(newer.url, original.url);
        assert_eq!(newer.prompt.as_deref(), Some("a brighter moon"));

        let page = h
            .orchestrator
            .restore_image_version(&story.id, USER, 2, &original.id)
            .await
            .unwrap();
        assert_eq!(page.image_url.as_deref(), Some(original.url.as_str()));
        assert_eq!(page.image_history.len(), 2);
        let active = active_versions(&page);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, original.id);
        assert!(!page.image_history.iter().find(|v| v.id == newer.id).unwrap().is_active);

        // 다른 페이지의 버전이나 없는 버전은 VersionNotFound, 아무것도 바뀌지 않음
        let page3_version = story.page(3).unwrap().image_history[0].id.clone();
        for bogus in [page3_version.as_str(), "missing"] {
            let err = h
                .orchestrator
                .restore_image_version(&story.id, USER, 2, bogus)
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::VersionNotFound));
        }
        let page2 = h.orchestrator.reload(&story.id).await.unwrap();
        assert_eq!(page2.page(2).unwrap().image_url.as_deref(), Some(original.url.as_str()));
    }

    #[tokio::test]
    async fn image_history_never_shrinks() {
        let h = harness(ScriptedProvider::new()).await;
        let story = completed_story(&h).await;

        let mut lengths = vec![1];
        let mut first_id = None;
        for round in 0..3 {
            let version = h.orchestrator.regenerate_image(&story.id, USER, 1, None).await.unwrap();
            first_id.get_or_insert(version.id.clone());
            lengths.push(db::list_page_history(&h.pool, &story.id, 1).await.unwrap().len());

            if round == 1 {
                let id = first_id.clone().unwrap();
                h.orchestrator.restore_image_version(&story.id, USER, 1, &id).await.unwrap();
                lengths.push(db::list_page_history(&h.pool, &story.id, 1).await.unwrap().len());
            }
        }

        assert!(lengths.windows(2).all(|w| w[0] <= w[1]), "{:?}", lengths);
        assert_eq!(lengths.last(), Some(&4));
    }

    #[tokio::test]
    async fn character_portrait_survives_character_approval() {
        let h = harness(ScriptedProvider::new()).await;
        let story = h.workflow.create_story(USER, &create_request(5)).await.unwrap();
        let outcome = approve_setting(&h, &story.id).await;
        let mori = outcome.story.extracted_characters[0].clone();

        let mut rx = h.events.subscribe(&story.id);
        let portrait = h
            .orchestrator
            .generate_character_image(&story.id, USER, &mori.id)
            .await
            .unwrap();
        assert!(portrait.image_url.is_some());
        let complete = std::iter::from_fn(|| rx.try_recv().ok()).last().unwrap();
        assert_eq!(complete.character_id.as_deref(), Some(mori.id.as_str()));

        let request = TransitionRequest::ApproveCharacters(ApproveCharactersRequest {
            characters: vec![CharacterInput {
                id: Some(mori.id.clone()),
                name: mori.name.clone(),
                description: "A curious red fox with a lantern".into(),
            }],
        });
        let outcome = completed(h.workflow.request_transition(&story.id, USER, request).await.unwrap());
        assert_eq!(outcome.story.extracted_characters[0].id, mori.id);
        assert_eq!(outcome.story.extracted_characters[0].image_url, portrait.image_url);
    }

    #[tokio::test]
    async fn revisions_branch_and_restore_with_checkpoint() {
        let h = harness(ScriptedProvider::new()).await;
        let story = story_with_text(&h).await;

        let first = h
            .orchestrator
            .create_revision(&story.id, USER, &CreateRevisionRequest {
                step_completed: None,
                description: Some("first draft".into()),
            })
            .await
            .unwrap();
        assert_eq!(first.revision_number, 1);
        assert_eq!(first.parent_revision, None);
        assert_eq!(first.step_completed, StoryStatus::TextApproved);

        let job = start_images(&h, &story.id).await.unwrap();
        h.orchestrator.run_image_job(job).await.unwrap();

        let second = h
            .orchestrator
            .create_revision(&story.id, USER, &CreateRevisionRequest::default())
            .await
            .unwrap();
        assert_eq!(second.revision_number, 2);
        assert_eq!(second.parent_revision, Some(1));

        let restored = h.orchestrator.restore_revision(&story.id, USER, 1).await.unwrap();
        assert_eq!(restored.checkpoint.revision_number, 3);
        assert_eq!(restored.checkpoint.parent_revision, Some(2));
        assert_eq!(restored.checkpoint.step_completed, StoryStatus::Completed);
        assert_eq!(
            restored.checkpoint.description.as_deref(),
            Some("Auto-saved before restoring revision 1")
        );

        let story = restored.story;
        assert_eq!(story.status, StoryStatus::TextApproved);
        assert_eq!(story.current_revision, 1);
        assert!(story.core_image_url.is_none());
        for page in &story.pages {
            // 이력은 남고, 스냅샷에 이미지가 없으므로 활성 버전은 없음
            assert_eq!(page.image_history.len(), 1);
            assert!(active_versions(page).is_empty());
            assert!(page.image_url.is_none());
        }

        // 복원한 지점에서 새 가지
        let branch = h
            .orchestrator
            .create_revision(&story.id, USER, &CreateRevisionRequest::default())
            .await
            .unwrap();
        assert_eq!(branch.revision_number, 4);
        assert_eq!(branch.parent_revision, Some(1));

        // 체크포인트로 돌아가면 완료 상태와 활성 이미지가 돌아옴
        let back = h.orchestrator.restore_revision(&story.id, USER, 3).await.unwrap().story;
        assert_eq!(back.status, StoryStatus::Completed);
        for page in &back.pages {
            let active = active_versions(page);
            assert_eq!(active.len(), 1);
            assert_eq!(page.image_url.as_deref(), Some(active[0].url.as_str()));
        }

        let missing = h.orchestrator.restore_revision(&story.id, USER, 99).await.unwrap_err();
        assert!(matches!(missing, AppError::NotFound));
    }

    #[tokio::test]
    async fn revision_step_must_not_be_ahead_of_the_story() {
        let h = harness(ScriptedProvider::new()).await;
        let story = story_with_text(&h).await;

        for step in [StoryStatus::Completed, StoryStatus::GeneratingImages] {
            let err = h
                .orchestrator
                .create_revision(&story.id, USER, &CreateRevisionRequest {
                    step_completed: Some(step),
                    description: None,
                })
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::Validation(_)));
        }

        let earlier = h
            .orchestrator
            .create_revision(&story.id, USER, &CreateRevisionRequest {
                step_completed: Some(StoryStatus::CharactersExtracted),
                description: None,
            })
            .await
            .unwrap();
        assert_eq!(earlier.step_completed, StoryStatus::CharactersExtracted);
    }

    #[tokio::test]
    async fn other_users_cannot_touch_a_story() {
        let h = harness(ScriptedProvider::new()).await;
        let story = completed_story(&h).await;

        let err = h
            .orchestrator
            .regenerate_image(&story.id, "someone-else", 1, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound));
        let err = h
            .workflow
            .request_transition(&story.id, "someone-else", TransitionRequest::StartImageGeneration)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound));
    }

    #[tokio::test]
    async fn interrupted_image_job_rolls_back_and_can_be_retried() {
        let gate = Arc::new(Notify::new());
        let h = harness(ScriptedProvider::new().gated(Arc::clone(&gate))).await;
        let story = story_with_text(&h).await;

        let job = start_images(&h, &story.id).await.unwrap();
        let orchestrator = h.orchestrator.clone();
        let running = tokio::spawn(async move { orchestrator.run_image_job(job).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        running.abort();
        assert!(running.await.unwrap_err().is_cancelled());

        // 되돌리기는 백그라운드에서 끝나고, 그 뒤에 슬롯이 풀림
        let reverted = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let current = h.orchestrator.reload(&story.id).await.unwrap();
                if current.status == StoryStatus::TextApproved
                    && !h.orchestrator.jobs().is_busy(&story.id)
                {
                    break current;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(reverted.core_image_url.is_none());

        gate.notify_one();
        let job = start_images(&h, &story.id).await.unwrap();
        let outcome = h.orchestrator.run_image_job(job).await.unwrap();
        assert_eq!(outcome.story.status, StoryStatus::Completed);
    }

    #[tokio::test]
    async fn unstarted_image_job_is_rolled_back_when_dropped() {
        let h = harness(ScriptedProvider::new()).await;
        let story = story_with_text(&h).await;

        let job = start_images(&h, &story.id).await.unwrap();
        drop(job);

        tokio::time::timeout(Duration::from_secs(1), async {
            while h.orchestrator.jobs().is_busy(&story.id) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let story = h.orchestrator.reload(&story.id).await.unwrap();
        assert_eq!(story.status, StoryStatus::TextApproved);
    }

    #[tokio::test]
    async fn startup_resets_stages_left_in_flight() {
        let h = harness(ScriptedProvider::new()).await;
        let drafting = h.workflow.create_story(USER, &create_request(5)).await.unwrap();
        let imaging = story_with_text(&h).await;

        db::set_status(&h.pool, &drafting.id, StoryStatus::Draft, StoryStatus::SettingExpansion)
            .await
            .unwrap();
        db::set_status(&h.pool, &imaging.id, StoryStatus::TextApproved, StoryStatus::GeneratingImages)
            .await
            .unwrap();

        assert_eq!(db::reset_interrupted_stages(&h.pool).await.unwrap(), 2);
        assert_eq!(
            h.orchestrator.reload(&drafting.id).await.unwrap().status,
            StoryStatus::Draft
        );
        assert_eq!(
            h.orchestrator.reload(&imaging.id).await.unwrap().status,
            StoryStatus::TextApproved
        );
        assert_eq!(db::reset_interrupted_stages(&h.pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn page_regeneration_in_flight_blocks_story_jobs() {
        let h = harness(ScriptedProvider::new()).await;
        let story = story_with_text(&h).await;
        h.orchestrator
            .create_revision(&story.id, USER, &CreateRevisionRequest::default())
            .await
            .unwrap();
        let job = start_images(&h, &story.id).await.unwrap();
        h.orchestrator.run_image_job(job).await.unwrap();

        h.page_hold.arm();
        let orchestrator = h.orchestrator.clone();
        let story_id = story.id.clone();
        let regenerating = tokio::spawn(async move {
            orchestrator.regenerate_image(&story_id, USER, 2, None).await
        });
        h.page_hold.entered().await;

        let err = h.orchestrator.restore_revision(&story.id, USER, 1).await.unwrap_err();
        assert!(matches!(err, AppError::JobInProgress(_)));
        let err = h
            .workflow
            .request_transition(&story.id, USER, TransitionRequest::StartImageGeneration)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::JobInProgress(_)));
        let err = h
            .orchestrator
            .regenerate_core_image(&story.id, USER, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::JobInProgress(_)));

        // 남의 스토리라면 작업 중이어도 존재 자체를 드러내지 않음
        let err = h
            .orchestrator
            .restore_revision(&story.id, "someone-else", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound));

        h.page_hold.release();
        let regenerated = regenerating.await.unwrap().unwrap();

        // 재생성이 끝난 뒤의 복원은 그 이미지를 남기지 않음
        let restored = h.orchestrator.restore_revision(&story.id, USER, 1).await.unwrap().story;
        assert_eq!(restored.status, StoryStatus::TextApproved);
        let page2 = restored.page(2).unwrap();
        assert!(page2.image_url.is_none());
        assert!(active_versions(page2).is_empty());
        assert!(page2.image_history.iter().any(|v| v.id == regenerated.id));
    }

    #[tokio::test]
    async fn regenerate_and_restore_on_one_page_take_turns() {
        let h = harness(ScriptedProvider::new()).await;
        let story = completed_story(&h).await;
        let original = story.page(2).unwrap().image_history[0].clone();

        h.page_hold.arm();
        let orchestrator = h.orchestrator.clone();
        let story_id = story.id.clone();
        let regenerating = tokio::spawn(async move {
            orchestrator.regenerate_image(&story_id, USER, 2, Some("a brighter moon")).await
        });
        h.page_hold.entered().await;

        let orchestrator = h.orchestrator.clone();
        let story_id = story.id.clone();
        let original_id = original.id.clone();
        let restoring = tokio::spawn(async move {
            orchestrator
                .restore_image_version(&story_id, USER, 2, &original_id)
                .await
        });

        // 복원은 같은 페이지의 재생성이 끝날 때까지 기다림
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!restoring.is_finished());

        h.page_hold.release();
        let newer = regenerating.await.unwrap().unwrap();
        let page = restoring.await.unwrap().unwrap();

        assert_eq!(page.image_history.len(), 2);
        let active = active_versions(&page);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, original.id);
        assert_eq!(page.image_url.as_deref(), Some(original.url.as_str()));
        assert!(!page.image_history.iter().find(|v| v.id == newer.id).unwrap().is_active);
    }

    #[tokio::test]
    async fn rewritten_text_leaves_no_active_images() {
        let h = harness(ScriptedProvider::new()).await;
        let story = completed_story(&h).await;

        let revision = h
            .orchestrator
            .create_revision(&story.id, USER, &CreateRevisionRequest {
                step_completed: Some(StoryStatus::CharactersExtracted),
                description: None,
            })
            .await
            .unwrap();
        let restored = h
            .orchestrator
            .restore_revision(&story.id, USER, revision.revision_number)
            .await
            .unwrap()
            .story;
        assert_eq!(restored.status, StoryStatus::CharactersExtracted);

        let request = TransitionRequest::ApproveCharacters(ApproveCharactersRequest {
            characters: three_characters(),
        });
        let outcome = completed(h.workflow.request_transition(&story.id, USER, request).await.unwrap());
        assert_eq!(outcome.story.status, StoryStatus::TextApproved);
        for page in &outcome.story.pages {
            assert!(page.image_url.is_none());
            assert!(active_versions(page).is_empty());
            assert_eq!(page.image_history.len(), 1);
        }
    }
}
