//! # 진행 이벤트 버스 (Progress Event Bus)
//!
//! 스토리 ID마다 하나의 토픽(`tokio::sync::broadcast` 채널)을 두고,
//! 오케스트레이터가 발행한 단계 진행 이벤트를 구독자들에게 실시간으로 전달합니다.
//!
//! ## 전달 보장
//! - 최대 한 번, 최선형(best-effort): 저장/재전송 없음
//! - 구독 이전에 발행된 이벤트는 받지 못함
//! - 같은 스토리 안에서는 발행 순서(FIFO) 유지, 스토리 사이의 순서는 보장하지 않음
//! - 버퍼보다 뒤처진 구독자는 밀린 이벤트를 잃습니다 (`RecvError::Lagged`)
//!
//! ## 와이어 형식
//! ```json
//! { "type": "image_generation_progress", "storyId": "...",
//!   "data": { "stage": "images", "pageNumber": 3, "imageRef": "https://...", "mode": "offline" } }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::GenerationMode;

/// 이벤트를 발생시키는 생성 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    SettingExpansion,
    CharacterExtraction,
    StoryText,
    CoreImage,
    CharacterImage,
    Images,
    PageImage,
}

impl Stage {
    /// 와이어 `type` 접두사: 이미지 단계는 `image_generation`, 텍스트 단계는 `text_generation`
    pub fn topic_prefix(&self) -> &'static str {
        match self {
            Stage::SettingExpansion | Stage::CharacterExtraction | Stage::StoryText => {
                "text_generation"
            }
            Stage::CoreImage | Stage::CharacterImage | Stage::Images | Stage::PageImage => {
                "image_generation"
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Start,
    Progress,
    Complete,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::Progress => "progress",
            EventKind::Complete => "complete",
            EventKind::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::Complete | EventKind::Error)
    }
}

/// 단계 진행 이벤트 하나
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub kind: EventKind,
    pub story_id: String,
    pub stage: Stage,
    pub page_number: Option<i64>,
    pub character_id: Option<String>,
    pub message: Option<String>,
    pub image_ref: Option<String>,
    pub error: Option<String>,
    pub mode: Option<GenerationMode>,
}

impl ProgressEvent {
    pub fn new(kind: EventKind, story_id: &str, stage: Stage) -> Self {
        Self {
            kind,
            story_id: story_id.to_string(),
            stage,
            page_number: None,
            character_id: None,
            message: None,
            image_ref: None,
            error: None,
            mode: None,
        }
    }

    pub fn start(story_id: &str, stage: Stage) -> Self {
        Self::new(EventKind::Start, story_id, stage)
    }

    pub fn progress(story_id: &str, stage: Stage) -> Self {
        Self::new(EventKind::Progress, story_id, stage)
    }

    pub fn complete(story_id: &str, stage: Stage) -> Self {
        Self::new(EventKind::Complete, story_id, stage)
    }

    /// 같은 단계/페이지/캐릭터의 `error` 이벤트로 바꿉니다.
    pub fn into_error(mut self, error: impl Into<String>) -> Self {
        self.kind = EventKind::Error;
        self.error = Some(error.into());
        self
    }

    pub fn page(mut self, page_number: i64) -> Self {
        self.page_number = Some(page_number);
        self
    }

    pub fn character(mut self, character_id: &str) -> Self {
        self.character_id = Some(character_id.to_string());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn image(mut self, image_ref: &str, mode: GenerationMode) -> Self {
        self.image_ref = Some(image_ref.to_string());
        self.mode = Some(mode);
        self
    }

    pub fn mode(mut self, mode: GenerationMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// 예: `image_generation_start`
    pub fn wire_type(&self) -> String {
        format!("{}_{}", self.stage.topic_prefix(), self.kind.as_str())
    }

    pub fn to_wire(&self) -> WireEvent<'_> {
        WireEvent {
            kind: self.wire_type(),
            story_id: &self.story_id,
            data: EventData {
                stage: self.stage,
                page_number: self.page_number,
                character_id: self.character_id.as_deref(),
                message: self.message.as_deref(),
                image_ref: self.image_ref.as_deref(),
                error: self.error.as_deref(),
                mode: self.mode,
            },
        }
    }
}

/// 클라이언트로 보내는 이벤트 직렬화 형태
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent<'a> {
    #[serde(rename = "type")]
    pub kind: String,
    pub story_id: &'a str,
    pub data: EventData<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData<'a> {
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_number: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub character_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<GenerationMode>,
}

/// 스토리별 발행/구독 채널 모음
#[derive(Debug, Clone)]
pub struct EventBus {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<ProgressEvent>>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// 스토리 토픽을 구독합니다. 구독 시점 이후의 이벤트만 받습니다.
    pub fn subscribe(&self, story_id: &str) -> broadcast::Receiver<ProgressEvent> {
        let mut topics = self.topics.lock().unwrap_or_else(|p| p.into_inner());
        topics
            .entry(story_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// 이벤트를 발행하고, 전달받은 구독자 수를 반환합니다.
    ///
    /// 구독자가 없는 토픽은 이 시점에 정리합니다.
    pub fn publish(&self, event: ProgressEvent) -> usize {
        let mut topics = self.topics.lock().unwrap_or_else(|p| p.into_inner());

        let Some(sender) = topics.get(&event.story_id) else {
            return 0;
        };
        if sender.receiver_count() == 0 {
            topics.remove(&event.story_id);
            return 0;
        }

        tracing::trace!(
            story_id = %event.story_id,
            event = %event.wire_type(),
            "Publishing progress event"
        );
        sender.send(event).unwrap_or(0)
    }

    /// 구독자가 남지 않은 토픽을 정리합니다. 정리했으면 `true`.
    ///
    /// 구독 해제나 연결 종료 뒤에 불러, 이후 발행이 없는 스토리의 토픽도 남지 않게 합니다.
    pub fn release(&self, story_id: &str) -> bool {
        let mut topics = self.topics.lock().unwrap_or_else(|p| p.into_inner());
        match topics.get(story_id) {
            Some(sender) if sender.receiver_count() == 0 => {
                topics.remove(story_id);
                true
            }
            _ => false,
        }
    }

    /// 살아 있는 토픽 수
    pub fn topic_count(&self) -> usize {
        self.topics.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn subscriber_count(&self, story_id: &str) -> usize {
        let topics = self.topics.lock().unwrap_or_else(|p| p.into_inner());
        topics
            .get(story_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    #[tokio::test]
    async fn subscribers_receive_events_in_publish_order() {
        let bus = EventBus::new(16);
        let mut first = bus.subscribe("s1");
        let mut second = bus.subscribe("s1");

        bus.publish(ProgressEvent::start("s1", Stage::Images));
        bus.publish(ProgressEvent::progress("s1", Stage::Images).page(1));
        bus.publish(ProgressEvent::progress("s1", Stage::Images).page(2));
        let delivered = bus.publish(ProgressEvent::complete("s1", Stage::Images));
        assert_eq!(delivered, 2);

        for rx in [&mut first, &mut second] {
            assert_eq!(rx.recv().await.unwrap().kind, EventKind::Start);
            assert_eq!(rx.recv().await.unwrap().page_number, Some(1));
            assert_eq!(rx.recv().await.unwrap().page_number, Some(2));
            assert!(rx.recv().await.unwrap().kind.is_terminal());
        }
    }

    #[tokio::test]
    async fn late_subscriber_does_not_see_earlier_events() {
        let bus = EventBus::new(16);
        let _early = bus.subscribe("s1");
        bus.publish(ProgressEvent::start("s1", Stage::Images));

        let mut late = bus.subscribe("s1");
        assert!(matches!(late.try_recv(), Err(TryRecvError::Empty)));

        bus.publish(ProgressEvent::complete("s1", Stage::Images));
        assert_eq!(late.recv().await.unwrap().kind, EventKind::Complete);
    }

    #[test]
    fn idle_topics_are_released_once_unsubscribed() {
        let bus = EventBus::new(16);
        let first = bus.subscribe("quiet");
        let second = bus.subscribe("quiet");
        assert_eq!(bus.topic_count(), 1);

        drop(first);
        assert!(!bus.release("quiet"));
        assert_eq!(bus.topic_count(), 1);

        drop(second);
        assert!(bus.release("quiet"));
        assert_eq!(bus.topic_count(), 0);
        assert!(!bus.release("quiet"));
    }

    #[test]
    fn topics_are_isolated_per_story_and_cleaned_up() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe("a");

        assert_eq!(bus.publish(ProgressEvent::start("b", Stage::StoryText)), 0);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        drop(rx);
        assert_eq!(bus.publish(ProgressEvent::start("a", Stage::StoryText)), 0);
        assert_eq!(bus.subscriber_count("a"), 0);
    }

    #[tokio::test]
    async fn lagging_subscriber_loses_oldest_events() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe("s1");
        for page in 1..=4 {
            bus.publish(ProgressEvent::progress("s1", Stage::Images).page(page));
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(2))));
        assert_eq!(rx.recv().await.unwrap().page_number, Some(3));
    }

    #[test]
    fn wire_format_uses_prefixed_type_and_camel_case() {
        let event = ProgressEvent::progress("s1", Stage::Images)
            .page(3)
            .image("https://img/3.png", GenerationMode::Offline);
        let wire = serde_json::to_value(event.to_wire()).unwrap();

        assert_eq!(wire["type"], "image_generation_progress");
        assert_eq!(wire["storyId"], "s1");
        assert_eq!(wire["data"]["pageNumber"], 3);
        assert_eq!(wire["data"]["imageRef"], "https://img/3.png");
        assert_eq!(wire["data"]["mode"], "offline");
        assert!(wire["data"].get("error").is_none());

        let failed = ProgressEvent::start("s1", Stage::StoryText).page(2).into_error("boom");
        assert_eq!(failed.wire_type(), "text_generation_error");
        assert_eq!(failed.page_number, Some(2));
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }
}
