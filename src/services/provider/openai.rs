//! # OpenAI 호환 제공자
//!
//! - 텍스트: `POST {base_url}/chat/completions` (구조화 결과는 `json_object` 형식)
//! - 이미지: `POST {base_url}/images/generations` (`url` 또는 `b64_json` 응답)
//!
//! ## 에러 분류
//! 응답 상태 코드와 본문의 `error.code` / `error.type` 필드만 사용합니다.
//!
//! | 조건 | 분류 |
//! |---|---|
//! | 429 + `insufficient_quota` | `QuotaExceeded` |
//! | 429 | `RateLimited` |
//! | 402 | `QuotaExceeded` |
//! | 408, 504, 클라이언트 시간 초과 | `Timeout` |
//! | 그 외 (401, 5xx, 전송 오류 등) | `Failed` |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::*;

#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    api_key: String,
    text_model: String,
    image_model: String,
}

impl OpenAiProvider {
    pub fn new(
        base_url: &str,
        api_key: &str,
        text_model: &str,
        image_model: &str,
        timeout: Duration,
    ) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent("storyloom/0.1")
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            text_model: text_model.to_string(),
            image_model: image_model.to_string(),
        }
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<String, ProviderError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let text = response.text().await.map_err(classify_transport)?;
        if !status.is_success() {
            return Err(classify(status, &text));
        }
        Ok(text)
    }

    /// 채팅 완성 한 번. `json`이면 JSON 객체 응답을 요청합니다.
    async fn chat(&self, system: &str, user: &str, json: bool) -> Result<String, ProviderError> {
        let request = ChatRequest {
            model: &self.text_model,
            messages: vec![
                ChatMessage { role: "system", content: system },
                ChatMessage { role: "user", content: user },
            ],
            response_format: json.then_some(ResponseFormat { kind: "json_object" }),
        };

        let body = self.post("/chat/completions", &request).await?;
        let response: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::Malformed(format!("chat response: {}", e)))?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::Malformed("chat response has no content".to_string()))
    }

    async fn image(&self, prompt: String) -> Result<ImageRef, ProviderError> {
        let request = ImageRequest {
            model: &self.image_model,
            prompt: &prompt,
            n: 1,
            size: "1024x1024",
        };

        let body = self.post("/images/generations", &request).await?;
        let response: ImageResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::Malformed(format!("image response: {}", e)))?;

        let data = response
            .data
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Malformed("image response has no data".to_string()))?;

        let url = match (data.url, data.b64_json) {
            (Some(url), _) => url,
            (None, Some(b64)) => format!("data:image/png;base64,{}", b64),
            (None, None) => {
                return Err(ProviderError::Malformed("image has neither url nor data".to_string()))
            }
        };

        Ok(ImageRef {
            url,
            prompt: Some(data.revised_prompt.unwrap_or(prompt)),
        })
    }
}

// ── 요청/응답 본문 ──

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct ImageRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u8,
    size: &'static str,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    url: Option<String>,
    b64_json: Option<String>,
    revised_prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CharactersPayload {
    characters: Vec<CharacterDraft>,
}

#[derive(Debug, Deserialize)]
struct StoryPayload {
    title: String,
    pages: Vec<PagePayload>,
}

#[derive(Debug, Deserialize)]
struct PagePayload {
    #[serde(alias = "pageNumber")]
    page_number: i64,
    text: String,
}

/// 실패 응답을 분류합니다.
pub fn classify(status: StatusCode, body: &str) -> ProviderError {
    let error = serde_json::from_str::<ErrorEnvelope>(body).ok().map(|e| e.error);
    let code = error
        .as_ref()
        .and_then(|e| e.code.as_deref().or(e.kind.as_deref()))
        .unwrap_or("");
    let detail = error
        .as_ref()
        .and_then(|e| e.message.clone())
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

    match status {
        StatusCode::TOO_MANY_REQUESTS if code == "insufficient_quota" => {
            ProviderError::QuotaExceeded(detail)
        }
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited(detail),
        StatusCode::PAYMENT_REQUIRED => ProviderError::QuotaExceeded(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ProviderError::Timeout,
        _ => ProviderError::Failed(format!("HTTP {}: {}", status.as_u16(), detail)),
    }
}

fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Failed(format!("transport error: {}", err))
    }
}

fn character_list(characters: &[Character]) -> String {
    characters
        .iter()
        .map(|c| format!("- {}: {}", c.name, c.description))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl GenerationProvider for OpenAiProvider {
    async fn expand_setting(&self, req: &SettingRequest<'_>) -> Result<String, ProviderError> {
        let user = format!(
            "Setting: {}\nPlot: {}\nReader age: {}\n\nExpand the setting into one vivid paragraph for a picture book.",
            req.setting, req.plot, req.age_group
        );
        self.chat("You write settings for illustrated children's stories.", &user, false)
            .await
    }

    async fn extract_characters(
        &self,
        req: &CharacterRequest<'_>,
    ) -> Result<Vec<CharacterDraft>, ProviderError> {
        let user = format!(
            "Setting: {}\nCharacters: {}\nPlot: {}\n\nReturn JSON {{\"characters\": [{{\"name\", \"description\"}}]}} with at most 10 characters.",
            req.setting, req.characters, req.plot
        );
        let content = self
            .chat("You extract characters for a children's story.", &user, true)
            .await?;

        serde_json::from_str::<CharactersPayload>(&content)
            .map(|payload| payload.characters)
            .map_err(|e| ProviderError::Malformed(format!("characters: {}", e)))
    }

    async fn generate_story_text(&self, spec: &StoryTextSpec<'_>) -> Result<StoryText, ProviderError> {
        let user = format!(
            "Title: {}\nSetting: {}\nCharacters:\n{}\nPlot: {}\nReader age: {}\n\n\
             Write the story in exactly {} pages. Return JSON {{\"title\", \"pages\": [{{\"page_number\", \"text\"}}]}}.",
            spec.title,
            spec.setting,
            character_list(spec.characters),
            spec.plot,
            spec.age_group,
            spec.total_pages
        );
        let content = self
            .chat("You write illustrated children's stories.", &user, true)
            .await?;

        let payload: StoryPayload = serde_json::from_str(&content)
            .map_err(|e| ProviderError::Malformed(format!("story text: {}", e)))?;

        Ok(StoryText {
            title: payload.title,
            pages: payload
                .pages
                .into_iter()
                .map(|p| PageText { page_number: p.page_number, text: p.text })
                .collect(),
        })
    }

    async fn generate_core_image(&self, req: &CoreImageRequest<'_>) -> Result<ImageRef, ProviderError> {
        let prompt = match req.custom_prompt {
            Some(custom) => custom.to_string(),
            None => format!(
                "Children's picture book cover art. Setting: {}. Characters:\n{}",
                req.setting,
                character_list(req.characters)
            ),
        };
        self.image(prompt).await
    }

    async fn generate_character_image(
        &self,
        req: &CharacterImageRequest<'_>,
    ) -> Result<ImageRef, ProviderError> {
        let prompt = format!(
            "Children's picture book character portrait of {}: {}. Background: {}",
            req.name, req.description, req.setting
        );
        self.image(prompt).await
    }

    async fn generate_page_image(&self, req: &PageImageRequest<'_>) -> Result<ImageRef, ProviderError> {
        let mut prompt = match req.custom_prompt {
            Some(custom) => custom.to_string(),
            None => format!("Children's picture book illustration: {}", req.page_text),
        };
        if let Some(core) = req.core_image {
            prompt.push_str(&format!("\nMatch the style of the cover image {}", core));
        }
        if let Some(previous) = req.previous_image {
            prompt.push_str(&format!("\nContinue visually from the previous page {}", previous));
        }
        self.image(prompt).await
    }
}
