//! # 애플리케이션 설정(Configuration) 모듈
//!
//! 환경변수에서 서버 설정값을 읽어오는 모듈입니다.
//! `.env` 파일이나 시스템 환경변수에서 값을 가져옵니다.
//!
//! 설정 항목:
//! - `DATABASE_URL`: SQLite 데이터베이스 경로
//! - `JWT_SECRET`: 외부 인증 서비스와 공유하는 JWT 서명 비밀키
//! - `HOST` / `PORT`: 서버 바인딩 주소와 포트
//! - `FRONTEND_DIST`: 빌드된 프론트엔드 정적 파일 디렉토리
//! - `OPENAI_API_KEY`, `OPENAI_BASE_URL`, `TEXT_MODEL`, `IMAGE_MODEL`: 생성 제공자 설정
//! - `PROVIDER_TIMEOUT_SECS`: 제공자 호출 1회당 제한 시간
//! - `EVENT_CHANNEL_CAPACITY`: 스토리별 진행 이벤트 버퍼 크기

use std::env;

/// 애플리케이션 전체 설정을 담는 구조체
///
/// 서버 시작 시 환경변수에서 한 번 읽어온 후,
/// 애플리케이션 전체에서 공유됩니다.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite 데이터베이스 URL (예: "sqlite:data/storyloom.db?mode=rwc")
    pub database_url: String,
    /// JWT 토큰 검증에 사용하는 비밀키
    pub jwt_secret: String,
    /// 서버가 바인딩할 호스트 주소 (기본값: "0.0.0.0")
    pub host: String,
    /// 서버 포트 번호 (기본값: 3000)
    pub port: u16,
    /// 프론트엔드 빌드 결과물 경로 (없으면 API만 서빙)
    pub frontend_dist: String,
    /// 텍스트/이미지 생성 제공자 설정
    pub provider: ProviderConfig,
    /// 스토리 하나의 진행 이벤트 채널에 쌓아둘 수 있는 최대 이벤트 수
    pub event_channel_capacity: usize,
}

/// 생성 제공자(OpenAI 호환 API) 설정
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// API 키. `None`이면 모든 호출이 오프라인 대체 모드로 동작합니다.
    pub api_key: Option<String>,
    pub base_url: String,
    pub text_model: String,
    pub image_model: String,
    /// 제공자 호출 1회당 제한 시간(초). 초과하면 오프라인 대체 콘텐츠를 사용합니다.
    pub timeout_secs: u64,
}

impl Config {
    /// 환경변수에서 설정값을 읽어 Config 인스턴스를 생성합니다.
    ///
    /// # 에러
    /// `DATABASE_URL`과 `JWT_SECRET`은 필수이며, 없으면 에러가 발생합니다.
    /// 나머지 설정은 기본값이 있어 환경변수가 없어도 동작합니다.
    pub fn from_env() -> Result<Self, env::VarError> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")?, // 필수
            jwt_secret: env::var("JWT_SECRET")?,     // 필수
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .unwrap_or(3000),
            frontend_dist: env::var("FRONTEND_DIST")
                .unwrap_or_else(|_| "../frontend/dist".to_string()),
            provider: ProviderConfig::from_env(),
            event_channel_capacity: env::var("EVENT_CHANNEL_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|capacity| *capacity > 0)
                .unwrap_or(64),
        })
    }
}

impl ProviderConfig {
    fn from_env() -> Self {
        Self {
            // 빈 문자열 키는 "자격 증명 없음"으로 취급합니다.
            api_key: env::var("OPENAI_API_KEY")
                .ok()
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty()),
            base_url: env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            text_model: env::var("TEXT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            image_model: env::var("IMAGE_MODEL").unwrap_or_else(|_| "dall-e-3".to_string()),
            timeout_secs: env::var("PROVIDER_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(90),
        }
    }
}
