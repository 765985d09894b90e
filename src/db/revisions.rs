//! # 스토리 리비전 쿼리 모듈
//!
//! 리비전은 (story_id, revision_number)로 색인되는 불변 레코드입니다.
//! 한 번 INSERT된 행은 UPDATE하지 않습니다.

use sqlx::types::Json;
use sqlx::{SqliteConnection, SqlitePool};

use super::stories;
use crate::error::AppError;
use crate::models::*;

/// 스냅샷 행을 추가하고 스토리의 current_revision을 새 번호로 옮깁니다 (트랜잭션 내부용).
///
/// 번호는 `MAX + 1`, 부모는 스토리의 current_revision 번호의 리비전이 실제로 있을 때만 설정됩니다.
async fn insert_revision(
    conn: &mut SqliteConnection,
    story: &Story,
    step_completed: StoryStatus,
    description: Option<&str>,
) -> Result<StoryRevision, AppError> {
    let next_number: i64 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(revision_number), 0) + 1 FROM story_revisions WHERE story_id = ?",
    )
    .bind(&story.id)
    .fetch_one(&mut *conn)
    .await?;

    let parent: Option<i64> = sqlx::query_scalar(
        "SELECT revision_number FROM story_revisions WHERE story_id = ? AND revision_number = ?",
    )
    .bind(&story.id)
    .bind(story.current_revision)
    .fetch_optional(&mut *conn)
    .await?;

    let id = uuid::Uuid::now_v7().to_string();
    sqlx::query(
        r#"
        INSERT INTO story_revisions
            (id, story_id, revision_number, parent_revision, step_completed, description, snapshot)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&story.id)
    .bind(next_number)
    .bind(parent)
    .bind(step_completed)
    .bind(description)
    .bind(Json(StorySnapshot::from(story)))
    .execute(&mut *conn)
    .await?;

    sqlx::query("UPDATE stories SET current_revision = ? WHERE id = ?")
        .bind(next_number)
        .bind(&story.id)
        .execute(&mut *conn)
        .await?;

    fetch_revision(&mut *conn, &story.id, next_number)
        .await?
        .ok_or(AppError::Internal("Failed to retrieve created revision".to_string()))
}

async fn fetch_revision(
    conn: &mut SqliteConnection,
    story_id: &str,
    revision_number: i64,
) -> Result<Option<StoryRevision>, AppError> {
    let revision = sqlx::query_as::<_, StoryRevision>(
        r#"
        SELECT id, story_id, revision_number, parent_revision, step_completed,
               description, snapshot, created_at
        FROM story_revisions
        WHERE story_id = ? AND revision_number = ?
        "#,
    )
    .bind(story_id)
    .bind(revision_number)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(revision)
}

/// 스토리의 현재 상태로 리비전을 만듭니다.
pub async fn create_revision(
    pool: &SqlitePool,
    story_id: &str,
    step_completed: StoryStatus,
    description: Option<&str>,
) -> Result<StoryRevision, AppError> {
    let mut tx = pool.begin().await?;

    let story = stories::load_story(&mut tx, story_id)
        .await?
        .ok_or(AppError::NotFound)?;
    let revision = insert_revision(&mut tx, &story, step_completed, description).await?;

    tx.commit().await?;
    Ok(revision)
}

/// 리비전 목록 (최신순, 스냅샷 본문 제외)
pub async fn list_revisions(
    pool: &SqlitePool,
    story_id: &str,
) -> Result<Vec<StoryRevisionSummary>, AppError> {
    let revisions = sqlx::query_as::<_, StoryRevisionSummary>(
        r#"
        SELECT id, story_id, revision_number, parent_revision, step_completed, description, created_at
        FROM story_revisions
        WHERE story_id = ?
        ORDER BY revision_number DESC
        "#,
    )
    .bind(story_id)
    .fetch_all(pool)
    .await?;

    Ok(revisions)
}

pub async fn get_revision(
    pool: &SqlitePool,
    story_id: &str,
    revision_number: i64,
) -> Result<Option<StoryRevision>, AppError> {
    let mut conn = pool.acquire().await?;
    fetch_revision(&mut conn, story_id, revision_number).await
}

/// 리비전으로 복원합니다.
///
/// 1. 현재 작업 상태를 자동 체크포인트 리비전으로 남기고
/// 2. 대상 스냅샷으로 스토리 필드/캐릭터/페이지를 덮어쓰고
/// 3. 상태를 스냅샷의 step_completed로, current_revision을 대상 번호로 설정합니다.
///
/// 전체가 한 트랜잭션입니다. 대상 리비전이 없으면 아무것도 바뀌지 않습니다.
pub async fn restore_revision(
    pool: &SqlitePool,
    story_id: &str,
    revision_number: i64,
) -> Result<StoryRevision, AppError> {
    let mut tx = pool.begin().await?;

    let target = fetch_revision(&mut tx, story_id, revision_number)
        .await?
        .ok_or(AppError::NotFound)?;
    let story = stories::load_story(&mut tx, story_id)
        .await?
        .ok_or(AppError::NotFound)?;

    let checkpoint_note = format!("Auto-saved before restoring revision {}", revision_number);
    let checkpoint =
        insert_revision(&mut tx, &story, story.status, Some(&checkpoint_note)).await?;

    stories::overwrite_from_snapshot(
        &mut tx,
        story_id,
        &target.snapshot,
        target.step_completed,
        target.revision_number,
    )
    .await?;

    tx.commit().await?;

    tracing::info!(
        story_id = %story_id,
        restored = revision_number,
        checkpoint = checkpoint.revision_number,
        "Restored story revision"
    );
    Ok(checkpoint)
}
