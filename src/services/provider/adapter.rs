//! # 제공자 어댑터
//!
//! 호출마다 실제 제공자를 먼저 시도하고, 대체 가능한 실패
//! (시간 초과, 요청 한도, 할당량, 출력 형식 오류)이면 오프라인 제공자로 한 번 다시 생성합니다.
//!
//! - 자격 증명이 없으면 처음부터 오프라인 제공자만 사용합니다.
//! - 선택은 호출 단위이며, 한 번 대체되었다고 이후 호출까지 오프라인으로 고정되지 않습니다.
//! - 대체 결과도 검증에 실패하면 그 에러를 그대로 반환합니다.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;

use super::offline::OfflineProvider;
use super::openai::OpenAiProvider;
use super::*;
use crate::config::ProviderConfig;

#[derive(Debug, Clone)]
pub struct ProviderAdapter {
    live: Option<Arc<dyn GenerationProvider>>,
    fallback: Arc<dyn GenerationProvider>,
    timeout: Duration,
}

impl ProviderAdapter {
    pub fn new(
        live: Option<Arc<dyn GenerationProvider>>,
        fallback: Arc<dyn GenerationProvider>,
        timeout: Duration,
    ) -> Self {
        Self { live, fallback, timeout }
    }

    /// 설정에 API 키가 있으면 OpenAI 호환 제공자를, 없으면 오프라인 제공자만 사용합니다.
    pub fn from_config(config: &ProviderConfig) -> Self {
        let live = config.api_key.as_ref().map(|key| {
            Arc::new(OpenAiProvider::new(
                &config.base_url,
                key,
                &config.text_model,
                &config.image_model,
                Duration::from_secs(config.timeout_secs),
            )) as Arc<dyn GenerationProvider>
        });

        Self::new(
            live,
            Arc::new(OfflineProvider),
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    /// 실제 제공자 호출 → 검증 → (필요하면) 오프라인 대체 한 번
    async fn call<'a, T>(
        &'a self,
        operation: &'static str,
        invoke: impl Fn(&'a dyn GenerationProvider) -> BoxFuture<'a, Result<T, ProviderError>>,
        validate: impl Fn(T) -> Result<T, ProviderError>,
    ) -> Result<Generated<T>, ProviderError> {
        let Some(live) = self.live.as_deref() else {
            let value = validate(invoke(self.fallback.as_ref()).await?)?;
            return Ok(Generated::offline(value));
        };

        let outcome = match tokio::time::timeout(self.timeout, invoke(live)).await {
            Ok(result) => result.and_then(&validate),
            Err(_) => Err(ProviderError::Timeout),
        };

        match outcome {
            Ok(value) => Ok(Generated::live(value)),
            Err(err) if err.allows_fallback() => {
                tracing::warn!(
                    operation,
                    error = %err,
                    "Live provider call failed, substituting offline content"
                );
                let value = validate(invoke(self.fallback.as_ref()).await?)?;
                Ok(Generated::offline(value))
            }
            Err(err) => {
                tracing::error!(operation, error = %err, "Live provider call failed");
                Err(err)
            }
        }
    }

    pub async fn expand_setting(
        &self,
        req: &SettingRequest<'_>,
    ) -> Result<Generated<String>, ProviderError> {
        self.call("expand_setting", |p| p.expand_setting(req), validate_text)
            .await
    }

    pub async fn extract_characters(
        &self,
        req: &CharacterRequest<'_>,
    ) -> Result<Generated<Vec<CharacterDraft>>, ProviderError> {
        self.call("extract_characters", |p| p.extract_characters(req), validate_characters)
            .await
    }

    pub async fn generate_story_text(
        &self,
        spec: &StoryTextSpec<'_>,
    ) -> Result<Generated<StoryText>, ProviderError> {
        self.call(
            "generate_story_text",
            |p| p.generate_story_text(spec),
            |text| validate_story_text(text, spec.total_pages),
        )
        .await
    }

    pub async fn generate_core_image(
        &self,
        req: &CoreImageRequest<'_>,
    ) -> Result<Generated<ImageRef>, ProviderError> {
        self.call("generate_core_image", |p| p.generate_core_image(req), validate_image)
            .await
    }

    pub async fn generate_character_image(
        &self,
        req: &CharacterImageRequest<'_>,
    ) -> Result<Generated<ImageRef>, ProviderError> {
        self.call(
            "generate_character_image",
            |p| p.generate_character_image(req),
            validate_image,
        )
        .await
    }

    pub async fn generate_page_image(
        &self,
        req: &PageImageRequest<'_>,
    ) -> Result<Generated<ImageRef>, ProviderError> {
        self.call("generate_page_image", |p| p.generate_page_image(req), validate_image)
            .await
    }
}
