//! 테스트용 스크립트 제공자.
//!
//! 페이지별 에러 주입, 본문 페이지 수 조작, 코어 이미지 호출 대기(gate),
//! 다음 페이지 이미지 호출 붙잡기(`PageHold`)를 지원하고 페이지 이미지 호출 순서를 기록합니다.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::*;

#[derive(Debug, Clone, PartialEq)]
pub struct PageCall {
    pub page_number: i64,
    pub core_image: Option<String>,
    pub previous_image: Option<String>,
}

/// 다음 페이지 이미지 호출 하나를 붙잡아 두는 핸들
#[derive(Debug, Clone, Default)]
pub struct PageHold {
    armed: Arc<AtomicBool>,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl PageHold {
    /// 다음 페이지 이미지 호출이 `release()`까지 멈춥니다.
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// 붙잡힌 호출이 들어올 때까지 기다립니다.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    async fn wait_if_armed(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
    }
}

#[derive(Debug, Default)]
pub struct ScriptedProvider {
    page_errors: HashMap<i64, ProviderError>,
    core_error_once: Mutex<Option<ProviderError>>,
    text_error: Option<ProviderError>,
    text_pages: Option<usize>,
    gate: Option<Arc<Notify>>,
    hold: PageHold,
    counter: AtomicUsize,
    page_calls: Arc<Mutex<Vec<PageCall>>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// 해당 페이지 이미지 호출은 항상 이 에러로 실패합니다.
    pub fn fail_page(mut self, page_number: i64, err: ProviderError) -> Self {
        self.page_errors.insert(page_number, err);
        self
    }

    /// 다음 코어 이미지 호출 한 번만 실패합니다.
    pub fn fail_core_once(self, err: ProviderError) -> Self {
        *self.core_error_once.lock().unwrap() = Some(err);
        self
    }

    pub fn fail_text(mut self, err: ProviderError) -> Self {
        self.text_error = Some(err);
        self
    }

    /// 본문 생성 시 요청과 다른 페이지 수를 돌려줍니다.
    pub fn text_pages(mut self, pages: usize) -> Self {
        self.text_pages = Some(pages);
        self
    }

    /// 코어 이미지 호출이 `notify_one()`을 받을 때까지 멈춥니다.
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// 페이지 이미지 호출 기록을 공유하는 핸들
    pub fn page_log(&self) -> Arc<Mutex<Vec<PageCall>>> {
        Arc::clone(&self.page_calls)
    }

    pub fn page_hold(&self) -> PageHold {
        self.hold.clone()
    }

    fn next_id(&self) -> usize {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl GenerationProvider for ScriptedProvider {
    async fn expand_setting(&self, req: &SettingRequest<'_>) -> Result<String, ProviderError> {
        Ok(format!("{} Lanterns glow along every winding path.", req.setting))
    }

    async fn extract_characters(
        &self,
        _req: &CharacterRequest<'_>,
    ) -> Result<Vec<CharacterDraft>, ProviderError> {
        Ok(vec![
            CharacterDraft {
                name: "Mori".into(),
                description: "A curious red fox with a lantern".into(),
            },
            CharacterDraft {
                name: "Bell".into(),
                description: "A sleepy owl who knows the stars".into(),
            },
        ])
    }

    async fn generate_story_text(&self, spec: &StoryTextSpec<'_>) -> Result<StoryText, ProviderError> {
        if let Some(err) = &self.text_error {
            return Err(err.clone());
        }
        let count = self.text_pages.unwrap_or(spec.total_pages);
        Ok(StoryText {
            title: "The Lantern Fox".into(),
            pages: (1..=count as i64)
                .map(|n| PageText {
                    page_number: n,
                    text: format!("Scripted page {} text.", n),
                })
                .collect(),
        })
    }

    async fn generate_core_image(&self, _req: &CoreImageRequest<'_>) -> Result<ImageRef, ProviderError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(err) = self.core_error_once.lock().unwrap().take() {
            return Err(err);
        }
        Ok(ImageRef {
            url: format!("https://scripted.test/core-{}.png", self.next_id()),
            prompt: Some("core".into()),
        })
    }

    async fn generate_character_image(
        &self,
        req: &CharacterImageRequest<'_>,
    ) -> Result<ImageRef, ProviderError> {
        Ok(ImageRef {
            url: format!("https://scripted.test/character-{}-{}.png", req.name, self.next_id()),
            prompt: None,
        })
    }

    async fn generate_page_image(&self, req: &PageImageRequest<'_>) -> Result<ImageRef, ProviderError> {
        self.page_calls.lock().unwrap().push(PageCall {
            page_number: req.page_number,
            core_image: req.core_image.map(str::to_string),
            previous_image: req.previous_image.map(str::to_string),
        });
        self.hold.wait_if_armed().await;
        if let Some(err) = self.page_errors.get(&req.page_number) {
            return Err(err.clone());
        }
        Ok(ImageRef {
            url: format!(
                "https://scripted.test/page-{}-{}.png",
                req.page_number,
                self.next_id()
            ),
            prompt: Some(req.custom_prompt.unwrap_or(req.page_text).to_string()),
        })
    }
}
