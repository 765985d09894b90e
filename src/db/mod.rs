//! # 데이터베이스 접근 계층 (Data Access Layer)
//!
//! 데이터베이스와 직접 상호작용하는 함수들을 모아둔 모듈입니다.
//! 서비스(services/)와 라우트 핸들러(routes/)에서 호출합니다.
//!
//! 각 하위 모듈:
//! - `stories`: 스토리/캐릭터/페이지 CRUD와 단계별 결과 커밋
//! - `images`: 페이지별 이미지 버전 이력 (추가 전용)
//! - `revisions`: 스토리 리비전 스냅샷

pub mod images;
pub mod revisions;
pub mod stories;

pub use images::*;
pub use revisions::*;
pub use stories::*;

#[cfg(test)]
pub(crate) mod testing {
    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::SqlitePool;

    /// 마이그레이션이 적용된 인메모리 DB.
    /// 인메모리 SQLite는 연결마다 별개의 DB이므로 연결을 하나로 고정합니다.
    pub async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .expect("open in-memory sqlite");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("run migrations");
        pool
    }
}
