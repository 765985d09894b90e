//! # 스토리 데이터베이스 쿼리 모듈
//!
//! `stories`, `story_characters`, `story_pages` 테이블에 대한 쿼리와
//! 단계별 결과 커밋 함수들입니다.
//!
//! ## 트랜잭션 규칙
//! 단계 결과(상태 + 콘텐츠 + 이미지 버전)는 하나의 트랜잭션으로 함께 커밋되거나
//! 전혀 커밋되지 않습니다. 상태 변경은 항상 compare-and-set
//! (`UPDATE ... WHERE status = 기대값`)으로 수행합니다.

use sqlx::{SqliteConnection, SqlitePool};

use super::images::{self, NewImageVersion};
use crate::error::AppError;
use crate::models::*;

/// 새 스토리를 `draft` 상태로 생성합니다.
pub async fn create_story(
    pool: &SqlitePool,
    id: &str,
    user_id: &str,
    title: &str,
    req: &CreateStoryRequest,
) -> Result<Story, AppError> {
    sqlx::query(
        r#"
        INSERT INTO stories (id, user_id, title, setting, characters, plot, age_group, total_pages)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(id)
    .bind(user_id)
    .bind(title)
    .bind(req.setting.trim())
    .bind(req.characters.trim())
    .bind(req.plot.trim())
    .bind(&req.age_group)
    .bind(req.total_pages)
    .execute(pool)
    .await?;

    get_story(pool, id, user_id)
        .await?
        .ok_or(AppError::Internal("Failed to retrieve created story".to_string()))
}

/// 사용자의 스토리 목록 (캐릭터/페이지는 채우지 않음)
///
/// 북마크한 스토리가 먼저, 그 다음 최근 수정순으로 정렬합니다.
pub async fn list_stories(pool: &SqlitePool, user_id: &str) -> Result<Vec<Story>, AppError> {
    let stories = sqlx::query_as::<_, Story>(
        r#"
        SELECT id, user_id, title, setting, expanded_setting, characters, plot, age_group,
               total_pages, core_image_url, status, bookmarked, current_revision,
               created_at, updated_at
        FROM stories
        WHERE user_id = ?
        ORDER BY bookmarked DESC, updated_at DESC
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(stories)
}

/// 소유자를 확인하며 스토리 전체(캐릭터, 페이지, 이미지 이력 포함)를 조회합니다.
///
/// 다른 사용자의 스토리는 존재하지 않는 것과 똑같이 `None`을 반환합니다.
pub async fn get_story(
    pool: &SqlitePool,
    id: &str,
    user_id: &str,
) -> Result<Option<Story>, AppError> {
    let mut conn = pool.acquire().await?;
    let story = load_story(&mut conn, id).await?;
    Ok(story.filter(|s| s.user_id == user_id))
}

/// 소유자 확인 없이 스토리 전체를 읽습니다. 트랜잭션 안에서도 사용합니다.
pub async fn load_story(conn: &mut SqliteConnection, id: &str) -> Result<Option<Story>, AppError> {
    let story = sqlx::query_as::<_, Story>(
        r#"
        SELECT id, user_id, title, setting, expanded_setting, characters, plot, age_group,
               total_pages, core_image_url, status, bookmarked, current_revision,
               created_at, updated_at
        FROM stories
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(mut story) = story else {
        return Ok(None);
    };

    story.extracted_characters = sqlx::query_as::<_, Character>(
        "SELECT id, name, description, image_url FROM story_characters WHERE story_id = ? ORDER BY position",
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;

    let mut pages = sqlx::query_as::<_, StoryPage>(
        r#"
        SELECT page_number, text, image_url, image_prompt
        FROM story_pages
        WHERE story_id = ?
        ORDER BY page_number
        "#,
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;

    // 이력은 한 번에 읽어서 페이지별로 나눠 담습니다 (최신순 유지)
    let history = images::list_story_history(&mut *conn, id).await?;
    for version in history {
        if let Some(page) = pages.iter_mut().find(|p| p.page_number == version.page_number) {
            page.image_history.push(version);
        }
    }
    story.pages = pages;

    Ok(Some(story))
}

/// 제목/북마크를 부분 수정합니다. 워크플로 상태와 무관한 메타데이터만 다룹니다.
pub async fn update_story(
    pool: &SqlitePool,
    id: &str,
    user_id: &str,
    req: &UpdateStoryRequest,
) -> Result<Option<Story>, AppError> {
    if get_story(pool, id, user_id).await?.is_none() {
        return Ok(None);
    }

    if let Some(title) = &req.title {
        sqlx::query("UPDATE stories SET title = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = ?")
            .bind(title.trim())
            .bind(id)
            .execute(pool)
            .await?;
    }

    if let Some(bookmarked) = req.bookmarked {
        sqlx::query("UPDATE stories SET bookmarked = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = ?")
            .bind(bookmarked)
            .bind(id)
            .execute(pool)
            .await?;
    }

    get_story(pool, id, user_id).await
}

/// 상태를 `from`에서 `to`로 바꿉니다 (compare-and-set).
///
/// 현재 상태가 `from`이 아니면 아무것도 바꾸지 않고 `false`를 반환합니다.
pub async fn transition_status(
    conn: &mut SqliteConnection,
    id: &str,
    from: StoryStatus,
    to: StoryStatus,
) -> Result<bool, AppError> {
    let result = sqlx::query(
        r#"
        UPDATE stories
        SET status = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
        WHERE id = ? AND status = ?
        "#,
    )
    .bind(to)
    .bind(id)
    .bind(from)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// compare-and-set이 실패하면 커밋을 중단시키는 에러로 바꿉니다.
fn ensure_transitioned(changed: bool, id: &str, from: StoryStatus) -> Result<(), AppError> {
    if changed {
        Ok(())
    } else {
        Err(AppError::Internal(format!(
            "story {} was no longer '{}' at commit time",
            id, from
        )))
    }
}

/// 스토리가 이 사용자의 것인지만 확인합니다.
pub async fn story_belongs_to(pool: &SqlitePool, id: &str, user_id: &str) -> Result<bool, AppError> {
    let owned = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM stories WHERE id = ? AND user_id = ?")
        .bind(id)
        .bind(user_id)
        .fetch_one(pool)
        .await?;

    Ok(owned > 0)
}

/// 서버 시작 시: 이전 프로세스에서 끝나지 못한 단계의 중간 상태를 단계 전 상태로 되돌립니다.
///
/// 되돌린 스토리 수를 반환합니다.
pub async fn reset_interrupted_stages(pool: &SqlitePool) -> Result<u64, AppError> {
    let mut tx = pool.begin().await?;
    let mut reset = 0;

    for (during, prior) in [
        (StoryStatus::SettingExpansion, StoryStatus::Draft),
        (StoryStatus::GeneratingImages, StoryStatus::TextApproved),
    ] {
        let result = sqlx::query(
            r#"
            UPDATE stories
            SET status = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
            WHERE status = ?
            "#,
        )
        .bind(prior)
        .bind(during)
        .execute(&mut *tx)
        .await?;
        reset += result.rows_affected();
    }

    tx.commit().await?;
    Ok(reset)
}

/// 상태만 바꿉니다 (단계 시작 표시, 실패 시 되돌리기).
pub async fn set_status(
    pool: &SqlitePool,
    id: &str,
    from: StoryStatus,
    to: StoryStatus,
) -> Result<bool, AppError> {
    let mut conn = pool.acquire().await?;
    transition_status(&mut conn, id, from, to).await
}

/// 설정 확장 제안을 저장합니다. 상태는 바꾸지 않습니다 (`draft` 유지).
pub async fn save_expanded_setting(
    pool: &SqlitePool,
    id: &str,
    expanded_setting: &str,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE stories
        SET expanded_setting = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
        WHERE id = ? AND status = 'draft'
        "#,
    )
    .bind(expanded_setting)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

/// 설정 승인: 승인된 확장 설정을 저장하고 상태를 `from` → `to`로 바꿉니다.
pub async fn begin_setting_approval(
    pool: &SqlitePool,
    id: &str,
    expanded_setting: &str,
    from: StoryStatus,
    to: StoryStatus,
) -> Result<(), AppError> {
    let mut tx = pool.begin().await?;

    let changed = transition_status(&mut tx, id, from, to).await?;
    ensure_transitioned(changed, id, from)?;

    sqlx::query("UPDATE stories SET expanded_setting = ? WHERE id = ?")
        .bind(expanded_setting.trim())
        .bind(id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

/// 캐릭터 목록을 통째로 교체합니다 (트랜잭션 내부용).
async fn replace_characters(
    conn: &mut SqliteConnection,
    id: &str,
    characters: &[Character],
) -> Result<(), AppError> {
    sqlx::query("DELETE FROM story_characters WHERE story_id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;

    for (position, character) in characters.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO story_characters (id, story_id, position, name, description, image_url)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&character.id)
        .bind(id)
        .bind(position as i64)
        .bind(character.name.trim())
        .bind(character.description.trim())
        .bind(&character.image_url)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

/// 캐릭터 추출 결과를 커밋합니다: 캐릭터 교체 + 상태 전이.
pub async fn commit_characters(
    pool: &SqlitePool,
    id: &str,
    characters: &[Character],
    from: StoryStatus,
    to: StoryStatus,
) -> Result<(), AppError> {
    let mut tx = pool.begin().await?;

    let changed = transition_status(&mut tx, id, from, to).await?;
    ensure_transitioned(changed, id, from)?;
    replace_characters(&mut tx, id, characters).await?;

    tx.commit().await?;
    Ok(())
}

/// 본문 생성 결과를 커밋합니다: 승인된 캐릭터, 제목, 페이지 전체 + 상태 전이.
pub async fn commit_story_text(
    pool: &SqlitePool,
    id: &str,
    title: &str,
    characters: &[Character],
    pages: &[PageText],
    from: StoryStatus,
    to: StoryStatus,
) -> Result<(), AppError> {
    let mut tx = pool.begin().await?;

    let changed = transition_status(&mut tx, id, from, to).await?;
    ensure_transitioned(changed, id, from)?;
    replace_characters(&mut tx, id, characters).await?;

    sqlx::query("UPDATE stories SET title = ? WHERE id = ?")
        .bind(title.trim())
        .bind(id)
        .execute(&mut *tx)
        .await?;

    sqlx::query("DELETE FROM story_pages WHERE story_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    // 새 페이지에는 이미지가 없으므로 이전 이력의 활성 표시도 내립니다
    images::deactivate_story(&mut tx, id).await?;

    for page in pages {
        sqlx::query("INSERT INTO story_pages (story_id, page_number, text) VALUES (?, ?, ?)")
            .bind(id)
            .bind(page.page_number)
            .bind(page.text.trim())
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// 사용자가 수정한 본문을 저장합니다 (`text_approved` 안에서의 자기 전이).
///
/// 페이지 개수와 번호는 바뀌지 않고 본문만 교체되므로, 이미지 필드는 유지됩니다.
pub async fn update_page_texts(
    pool: &SqlitePool,
    id: &str,
    title: Option<&str>,
    pages: &[PageText],
) -> Result<(), AppError> {
    let mut tx = pool.begin().await?;

    if let Some(title) = title {
        sqlx::query("UPDATE stories SET title = ? WHERE id = ?")
            .bind(title.trim())
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }

    for page in pages {
        let result = sqlx::query("UPDATE story_pages SET text = ? WHERE story_id = ? AND page_number = ?")
            .bind(page.text.trim())
            .bind(id)
            .bind(page.page_number)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            // 트랜잭션은 drop되며 롤백됩니다
            return Err(AppError::Validation(format!(
                "page {} does not exist",
                page.page_number
            )));
        }
    }

    sqlx::query("UPDATE stories SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

/// 이미지 생성 단계 결과를 커밋합니다.
///
/// 코어 이미지, 모든 페이지의 새 활성 이미지 버전, 상태 전이를 한 트랜잭션으로 처리합니다.
pub async fn commit_images(
    pool: &SqlitePool,
    id: &str,
    core_image_url: &str,
    pages: &[NewImageVersion],
    from: StoryStatus,
    to: StoryStatus,
) -> Result<Vec<ImageVersion>, AppError> {
    let mut tx = pool.begin().await?;

    let changed = transition_status(&mut tx, id, from, to).await?;
    ensure_transitioned(changed, id, from)?;

    sqlx::query("UPDATE stories SET core_image_url = ? WHERE id = ?")
        .bind(core_image_url)
        .bind(id)
        .execute(&mut *tx)
        .await?;

    let mut versions = Vec::with_capacity(pages.len());
    for page in pages {
        versions.push(images::append_active_version(&mut tx, id, page).await?);
    }

    tx.commit().await?;
    Ok(versions)
}

/// 코어 이미지만 교체합니다 (코어 이미지 재생성).
pub async fn set_core_image_url(pool: &SqlitePool, id: &str, url: &str) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE stories SET core_image_url = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = ?",
    )
    .bind(url)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

/// 캐릭터 초상화 URL을 저장합니다. 캐릭터가 없으면 `false`.
pub async fn set_character_image_url(
    pool: &SqlitePool,
    story_id: &str,
    character_id: &str,
    url: &str,
) -> Result<bool, AppError> {
    let result = sqlx::query("UPDATE story_characters SET image_url = ? WHERE story_id = ? AND id = ?")
        .bind(url)
        .bind(story_id)
        .bind(character_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// 리비전 스냅샷으로 스토리의 작업 상태를 덮어씁니다 (트랜잭션 내부용).
///
/// 페이지 행은 스냅샷 내용으로 다시 쓰이지만, 이미지 이력은 건드리지 않습니다.
pub async fn overwrite_from_snapshot(
    conn: &mut SqliteConnection,
    id: &str,
    snapshot: &StorySnapshot,
    status: StoryStatus,
    revision_number: i64,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE stories
        SET title = ?, setting = ?, expanded_setting = ?, characters = ?, plot = ?,
            age_group = ?, core_image_url = ?, status = ?, current_revision = ?,
            updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
        WHERE id = ?
        "#,
    )
    .bind(&snapshot.title)
    .bind(&snapshot.setting)
    .bind(&snapshot.expanded_setting)
    .bind(&snapshot.characters)
    .bind(&snapshot.plot)
    .bind(&snapshot.age_group)
    .bind(&snapshot.core_image_url)
    .bind(status)
    .bind(revision_number)
    .bind(id)
    .execute(&mut *conn)
    .await?;

    replace_characters(&mut *conn, id, &snapshot.extracted_characters).await?;

    sqlx::query("DELETE FROM story_pages WHERE story_id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;

    // 스냅샷에 없는 페이지는 표시되는 이미지가 없으므로 활성 버전도 없어야 합니다
    images::deactivate_story(&mut *conn, id).await?;

    for page in &snapshot.pages {
        sqlx::query(
            r#"
            INSERT INTO story_pages (story_id, page_number, text, image_url, image_prompt)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(page.page_number)
        .bind(&page.text)
        .bind(&page.image_url)
        .bind(&page.image_prompt)
        .execute(&mut *conn)
        .await?;

        images::sync_active_to_url(&mut *conn, id, page.page_number, page.image_url.as_deref())
            .await?;
    }

    Ok(())
}
