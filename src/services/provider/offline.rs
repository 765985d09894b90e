//! # 오프라인 대체 제공자
//!
//! 네트워크 없이 입력만으로 결정되는 자리표시(placeholder) 콘텐츠를 만듭니다.
//! 페이지 수와 필드 형태는 실제 제공자 결과와 같으므로 워크플로가 끝까지 진행될 수 있습니다.

use async_trait::async_trait;

use super::*;

const PLACEHOLDER_HOST: &str = "https://placehold.co";

#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineProvider;

/// 자리표시 이미지 URL (같은 라벨이면 항상 같은 URL)
fn placeholder_url(size: &str, label: &str) -> String {
    let text: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '+' })
        .collect();
    format!("{}/{}/png?text={}", PLACEHOLDER_HOST, size, text)
}

/// "이름: 설명" 또는 "이름 - 설명" 한 줄을 캐릭터로 나눕니다.
fn split_character(entry: &str) -> Option<CharacterDraft> {
    let entry = entry.trim();
    if entry.is_empty() {
        return None;
    }

    let (name, description) = entry
        .split_once(':')
        .or_else(|| entry.split_once(" - "))
        .map(|(name, rest)| (name.trim(), rest.trim()))
        .unwrap_or((entry, ""));

    let description = if description.chars().count() >= 10 {
        description.to_string()
    } else {
        format!("{}, a friendly character in this story", name)
    };

    Some(CharacterDraft {
        name: name.to_string(),
        description,
    })
}

#[async_trait]
impl GenerationProvider for OfflineProvider {
    async fn expand_setting(&self, req: &SettingRequest<'_>) -> Result<String, ProviderError> {
        Ok(format!(
            "{} The place is calm and full of small wonders, just right for readers aged {}.",
            req.setting.trim(),
            req.age_group
        ))
    }

    async fn extract_characters(
        &self,
        req: &CharacterRequest<'_>,
    ) -> Result<Vec<CharacterDraft>, ProviderError> {
        let mut characters: Vec<CharacterDraft> = req
            .characters
            .split(['\n', ';', ','])
            .filter_map(split_character)
            .take(10)
            .collect();

        if characters.is_empty() {
            characters.push(CharacterDraft {
                name: "Hero".to_string(),
                description: "The brave main character of this story".to_string(),
            });
        }
        Ok(characters)
    }

    async fn generate_story_text(&self, spec: &StoryTextSpec<'_>) -> Result<StoryText, ProviderError> {
        let hero = spec
            .characters
            .first()
            .map(|c| c.name.as_str())
            .unwrap_or("our friend");
        let title = if spec.title.trim().is_empty() {
            format!("The Adventure of {}", hero)
        } else {
            spec.title.trim().to_string()
        };

        let last = spec.total_pages as i64;
        let pages = (1..=last)
            .map(|n| {
                let text = match n {
                    1 => format!("Once upon a time, {} lived in {}.", hero, spec.setting.trim()),
                    n if n == last => format!("And so {}'s adventure came to a happy end.", hero),
                    n => format!("On page {}, {} took another step: {}", n, hero, spec.plot.trim()),
                };
                PageText { page_number: n, text }
            })
            .collect();

        Ok(StoryText { title, pages })
    }

    async fn generate_core_image(&self, _req: &CoreImageRequest<'_>) -> Result<ImageRef, ProviderError> {
        Ok(ImageRef {
            url: placeholder_url("1024x1024", "Story Cover"),
            prompt: None,
        })
    }

    async fn generate_character_image(
        &self,
        req: &CharacterImageRequest<'_>,
    ) -> Result<ImageRef, ProviderError> {
        Ok(ImageRef {
            url: placeholder_url("512x512", req.name),
            prompt: None,
        })
    }

    async fn generate_page_image(&self, req: &PageImageRequest<'_>) -> Result<ImageRef, ProviderError> {
        Ok(ImageRef {
            url: placeholder_url("1024x1024", &format!("Page {}", req.page_number)),
            prompt: Some(req.custom_prompt.unwrap_or(req.page_text).to_string()),
        })
    }
}
