//! # Storyloom 웹 서버 진입점
//!
//! 그림 동화 생성 파이프라인 서버의 **시작점(entry point)**입니다.
//!
//! 이 파일이 수행하는 작업:
//! 1. 환경변수(.env) 로딩
//! 2. 로깅(tracing) 초기화
//! 3. SQLite 데이터베이스 연결 풀 생성, 마이그레이션, 중단된 단계 정리
//! 4. 생성 제공자 선택 (API 키가 없으면 오프라인 대체 전용)
//! 5. 공유 상태(워크플로, 오케스트레이터, 이벤트 버스) 구성
//! 6. API 라우터와 미들웨어 설정
//! 7. HTTP 서버 시작

// ── 모듈 선언 ──
// Rust에서는 파일 시스템 구조가 곧 모듈 구조입니다.
mod config;
mod db;
mod error;
mod middleware;
mod models;
mod routes;
mod services;

use anyhow::Result; // main()에서만 쓰는 범용 Result 타입
use axum::Router;
use config::Config;
use routes::AppState;
use services::provider::ProviderAdapter;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tower_http::{
    cors::{Any, CorsLayer},          // CORS(Cross-Origin Resource Sharing) 설정
    services::{ServeDir, ServeFile}, // 정적 파일 서빙 서비스
    trace::TraceLayer,               // HTTP 요청/응답 로깅 미들웨어
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1단계: 환경변수 로딩 ──
    // .env 파일이 없어도 에러 없이 넘어갑니다.
    dotenvy::dotenv().ok();

    // ── 2단계: 로깅(tracing) 초기화 ──
    // RUST_LOG가 없으면 storyloom, tower_http, axum 모듈을 debug 레벨로 출력합니다.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "storyloom=debug,tower_http=debug,axum=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // ── 3단계: 설정 로딩 ──
    // DATABASE_URL, JWT_SECRET은 필수입니다. 없으면 여기서 종료됩니다.
    let config = Config::from_env()?;
    tracing::info!("Starting Storyloom server on {}:{}", config.host, config.port);

    // ── 4단계: SQLite 연결 풀 생성 ──
    // "sqlite:data/storyloom.db" 같은 파일 경로면 상위 디렉토리를 먼저 만듭니다.
    if let Some(dir) = config
        .database_url
        .strip_prefix("sqlite:")
        .filter(|path| !path.starts_with(":memory:"))
        .map(|path| path.trim_start_matches("//"))
        .and_then(|path| Path::new(path).parent())
        .filter(|dir| !dir.as_os_str().is_empty() && !dir.exists())
    {
        tokio::fs::create_dir_all(dir).await?;
        tracing::info!("Created database directory: {}", dir.display());
    }

    // create_if_missing: DB 파일이 없으면 새로 만듭니다.
    let options = SqliteConnectOptions::from_str(&config.database_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    // ── 5단계: 데이터베이스 마이그레이션 실행 ──
    // ./migrations 폴더의 SQL 파일들이 컴파일 타임에 바이너리에 포함됩니다.
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    // 이전 프로세스가 단계 도중에 종료되었으면 중간 상태를 단계 전 상태로 되돌립니다.
    let reset = db::reset_interrupted_stages(&pool).await?;
    if reset > 0 {
        tracing::warn!(stories = reset, "Reset stories left in an interrupted generation stage");
    }

    // ── 6단계: 생성 제공자 선택 ──
    let provider = ProviderAdapter::from_config(&config.provider);
    if provider.is_live() {
        tracing::info!(
            base_url = %config.provider.base_url,
            text_model = %config.provider.text_model,
            image_model = %config.provider.image_model,
            "Generation provider: live"
        );
    } else {
        tracing::warn!("OPENAI_API_KEY not set, every generation will use offline placeholders");
    }

    // ── 7단계: 애플리케이션 상태(State) 생성 ──
    // 워크플로, 오케스트레이터, 이벤트 버스가 같은 풀과 작업 레지스트리를 공유합니다.
    let state = AppState::new(
        pool,
        config.jwt_secret.clone(),
        provider,
        config.event_channel_capacity,
    );

    // ── 8단계: 미들웨어 설정 ──
    // 개발 환경에서는 CORS를 모두 허용합니다. 프로덕션에서는 특정 도메인만 허용해야 합니다.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // ── 9단계: 라우터 조립 ──
    // API는 /api/v1 아래에 두고, 빌드된 프론트엔드가 있으면 나머지 경로를 SPA로 서빙합니다.
    let router = Router::new().nest("/api/v1", routes::api_router(state));
    let frontend_dist = Path::new(&config.frontend_dist);
    let app = if frontend_dist.exists() {
        tracing::info!("Serving frontend static files from {}", config.frontend_dist);

        // 찾을 수 없는 경로는 index.html로 돌려보냅니다 (SPA 라우팅)
        let serve_dir = ServeDir::new(frontend_dist)
            .not_found_service(ServeFile::new(frontend_dist.join("index.html")));

        router
            .fallback_service(serve_dir)
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    } else {
        tracing::warn!("Frontend dist directory not found, serving API only");

        router.layer(cors).layer(TraceLayer::new_for_http())
    };

    // ── 10단계: 서버 시작 ──
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
