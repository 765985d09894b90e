//! # 페이지 이미지 버전 저장소
//!
//! `image_versions` 테이블은 **추가 전용(append-only)** 입니다.
//! 항목은 절대 삭제하지 않고 `is_active`만 바꿉니다.
//!
//! ## 불변식
//! - 페이지마다 `is_active = 1`인 버전은 최대 하나 (부분 UNIQUE 인덱스로도 보장)
//! - 활성 버전 전환은 "기존 활성 해제 → 새 버전 활성화 → 페이지 표시 필드 갱신"을
//!   한 트랜잭션에서 처리합니다.

use sqlx::{SqliteConnection, SqlitePool};

use crate::error::AppError;
use crate::models::{GenerationMode, ImageVersion, StoryPage};

/// 새로 추가할 이미지 버전
#[derive(Debug, Clone)]
pub struct NewImageVersion {
    pub page_number: i64,
    pub url: String,
    pub prompt: Option<String>,
    pub mode: GenerationMode,
}

/// 스토리 전체의 이미지 이력 (페이지 번호순, 페이지 안에서는 최신순)
pub async fn list_story_history(
    conn: &mut SqliteConnection,
    story_id: &str,
) -> Result<Vec<ImageVersion>, AppError> {
    let versions = sqlx::query_as::<_, ImageVersion>(
        r#"
        SELECT id, story_id, page_number, url, prompt, generation_mode, is_active, created_at
        FROM image_versions
        WHERE story_id = ?
        ORDER BY page_number, created_at DESC, rowid DESC
        "#,
    )
    .bind(story_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(versions)
}

/// 한 페이지의 이미지 이력 (최신순)
pub async fn list_page_history(
    pool: &SqlitePool,
    story_id: &str,
    page_number: i64,
) -> Result<Vec<ImageVersion>, AppError> {
    let versions = sqlx::query_as::<_, ImageVersion>(
        r#"
        SELECT id, story_id, page_number, url, prompt, generation_mode, is_active, created_at
        FROM image_versions
        WHERE story_id = ? AND page_number = ?
        ORDER BY created_at DESC, rowid DESC
        "#,
    )
    .bind(story_id)
    .bind(page_number)
    .fetch_all(pool)
    .await?;

    Ok(versions)
}

async fn get_version(
    conn: &mut SqliteConnection,
    id: &str,
) -> Result<Option<ImageVersion>, AppError> {
    let version = sqlx::query_as::<_, ImageVersion>(
        r#"
        SELECT id, story_id, page_number, url, prompt, generation_mode, is_active, created_at
        FROM image_versions
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(version)
}

async fn deactivate_page(
    conn: &mut SqliteConnection,
    story_id: &str,
    page_number: i64,
) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE image_versions SET is_active = 0 WHERE story_id = ? AND page_number = ? AND is_active = 1",
    )
    .bind(story_id)
    .bind(page_number)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// 스토리의 모든 활성 버전을 해제합니다 (리비전 복원 직전에 사용).
pub async fn deactivate_story(conn: &mut SqliteConnection, story_id: &str) -> Result<(), AppError> {
    sqlx::query("UPDATE image_versions SET is_active = 0 WHERE story_id = ? AND is_active = 1")
        .bind(story_id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

/// 페이지의 표시 필드(image_url, image_prompt)를 갱신합니다.
async fn set_page_image(
    conn: &mut SqliteConnection,
    story_id: &str,
    page_number: i64,
    url: &str,
    prompt: Option<&str>,
) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE story_pages SET image_url = ?, image_prompt = ? WHERE story_id = ? AND page_number = ?",
    )
    .bind(url)
    .bind(prompt)
    .bind(story_id)
    .bind(page_number)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// 새 버전을 활성 상태로 추가합니다. 호출자가 트랜잭션을 열고 닫습니다.
///
/// 이전 활성 버전은 삭제되지 않고 비활성화됩니다.
pub async fn append_active_version(
    conn: &mut SqliteConnection,
    story_id: &str,
    new: &NewImageVersion,
) -> Result<ImageVersion, AppError> {
    let id = uuid::Uuid::now_v7().to_string();

    deactivate_page(&mut *conn, story_id, new.page_number).await?;

    sqlx::query(
        r#"
        INSERT INTO image_versions (id, story_id, page_number, url, prompt, generation_mode, is_active)
        VALUES (?, ?, ?, ?, ?, ?, 1)
        "#,
    )
    .bind(&id)
    .bind(story_id)
    .bind(new.page_number)
    .bind(&new.url)
    .bind(&new.prompt)
    .bind(new.mode)
    .execute(&mut *conn)
    .await?;

    set_page_image(&mut *conn, story_id, new.page_number, &new.url, new.prompt.as_deref()).await?;

    get_version(&mut *conn, &id)
        .await?
        .ok_or(AppError::Internal("Failed to retrieve created image version".to_string()))
}

/// 재생성된 이미지 한 장을 독립적인 트랜잭션으로 추가합니다.
pub async fn append_page_version(
    pool: &SqlitePool,
    story_id: &str,
    new: &NewImageVersion,
) -> Result<ImageVersion, AppError> {
    let mut tx = pool.begin().await?;
    let version = append_active_version(&mut tx, story_id, new).await?;
    tx.commit().await?;

    tracing::debug!(
        story_id = %story_id,
        page_number = new.page_number,
        version_id = %version.id,
        "Appended active image version"
    );
    Ok(version)
}

/// 이력의 특정 버전을 다시 활성화하고 페이지 표시 필드에 복사합니다.
///
/// 버전이 이 스토리/페이지의 이력에 없으면 `VersionNotFound`를 반환하며,
/// 이 경우 아무것도 바뀌지 않습니다.
pub async fn activate_version(
    pool: &SqlitePool,
    story_id: &str,
    page_number: i64,
    version_id: &str,
) -> Result<StoryPage, AppError> {
    let mut tx = pool.begin().await?;

    let version = get_version(&mut tx, version_id)
        .await?
        .filter(|v| v.story_id == story_id && v.page_number == page_number)
        .ok_or(AppError::VersionNotFound)?;

    deactivate_page(&mut tx, story_id, page_number).await?;

    sqlx::query("UPDATE image_versions SET is_active = 1 WHERE id = ?")
        .bind(&version.id)
        .execute(&mut *tx)
        .await?;

    set_page_image(&mut tx, story_id, page_number, &version.url, version.prompt.as_deref()).await?;

    let mut page = sqlx::query_as::<_, StoryPage>(
        "SELECT page_number, text, image_url, image_prompt FROM story_pages WHERE story_id = ? AND page_number = ?",
    )
    .bind(story_id)
    .bind(page_number)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(AppError::NotFound)?;

    tx.commit().await?;

    page.image_history = list_page_history(pool, story_id, page_number).await?;
    Ok(page)
}

/// 페이지의 활성 버전을 표시 URL과 일치하는 가장 최근 이력 항목으로 맞춥니다.
///
/// 일치하는 항목이 없거나 URL이 없으면 활성 버전 없이 둡니다.
pub async fn sync_active_to_url(
    conn: &mut SqliteConnection,
    story_id: &str,
    page_number: i64,
    url: Option<&str>,
) -> Result<(), AppError> {
    deactivate_page(&mut *conn, story_id, page_number).await?;

    let Some(url) = url else {
        return Ok(());
    };

    sqlx::query(
        r#"
        UPDATE image_versions SET is_active = 1
        WHERE id = (
            SELECT id FROM image_versions
            WHERE story_id = ? AND page_number = ? AND url = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT 1
        )
        "#,
    )
    .bind(story_id)
    .bind(page_number)
    .bind(url)
    .execute(&mut *conn)
    .await?;

    Ok(())
}
