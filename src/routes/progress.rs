//! # 진행 이벤트 스트림 (WebSocket)
//!
//! `GET /api/v1/ws?token=<jwt>` 로 연결한 뒤 스토리별로 구독합니다.
//!
//! ## 클라이언트 → 서버
//! ```json
//! {"action": "subscribe", "storyId": "..."}
//! {"action": "unsubscribe", "storyId": "..."}
//! ```
//!
//! ## 서버 → 클라이언트
//! - 진행 이벤트: `{"type": "image_generation_progress", "storyId": "...", "data": {...}}`
//! - 제어 메시지: `{"type": "subscribed", "storyId": "..."}`, `{"type": "error", "message": "..."}`
//!
//! 구독하기 전에 발행된 이벤트는 받을 수 없고, 재연결하면 다시 구독해야 합니다.
//! 구독마다 포워더 태스크가 하나씩 돌며 브로드캐스트 수신기를 연결의 송신 채널로 옮깁니다.

use std::collections::HashMap;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::AppState;
use crate::{
    db,
    middleware::auth::{AuthError, AuthUser},
    services::events::ProgressEvent,
};

/// 연결 하나의 송신 대기열 길이
const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe {
        #[serde(rename = "storyId")]
        story_id: String,
    },
    Unsubscribe {
        #[serde(rename = "storyId")]
        story_id: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlMessage<'a> {
    Subscribed {
        #[serde(rename = "storyId")]
        story_id: &'a str,
    },
    Unsubscribed {
        #[serde(rename = "storyId")]
        story_id: &'a str,
    },
    Error {
        message: String,
    },
}

impl ControlMessage<'_> {
    fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error"}"#.to_string())
    }
}

/// `GET /ws?token=...`: 토큰을 먼저 검증하고 WebSocket으로 업그레이드합니다.
pub async fn progress_stream(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
    ws: WebSocketUpgrade,
) -> Result<Response, AuthError> {
    let user = AuthUser::from_token(params.token.as_deref(), &state.jwt_secret)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user)))
}

async fn handle_socket(socket: WebSocket, state: AppState, user: AuthUser) {
    let (mut sink, mut stream) = socket.split();
    let (outbound, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);

    tracing::debug!(user_id = %user.user_id, "Progress stream connected");

    let writer = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut subscriptions = Subscriptions::default();
    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                let reply = subscriptions
                    .handle(&state, &user, text.as_str(), &outbound)
                    .await;
                if outbound.send(reply).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    subscriptions.clear(&state).await;
    writer.abort();
    tracing::debug!(
        user_id = %user.user_id,
        topics = state.events.topic_count(),
        "Progress stream closed"
    );
}

/// 연결 하나가 가진 구독 목록 (story_id → 포워더 태스크)
#[derive(Default)]
struct Subscriptions {
    forwarders: HashMap<String, JoinHandle<()>>,
}

impl Subscriptions {
    /// 클라이언트 메시지 하나를 처리하고, 돌려보낼 제어 메시지를 반환합니다.
    async fn handle(
        &mut self,
        state: &AppState,
        user: &AuthUser,
        text: &str,
        outbound: &mpsc::Sender<String>,
    ) -> String {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                return ControlMessage::Error {
                    message: format!("Malformed message: {}", e),
                }
                .to_text()
            }
        };

        match message {
            ClientMessage::Subscribe { story_id } => {
                match db::get_story(&state.pool, &story_id, &user.user_id).await {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        return ControlMessage::Error {
                            message: format!("Story {} not found", story_id),
                        }
                        .to_text()
                    }
                    Err(e) => {
                        tracing::error!(story_id = %story_id, error = %e, "Subscription lookup failed");
                        return ControlMessage::Error {
                            message: "Subscription failed".to_string(),
                        }
                        .to_text();
                    }
                }

                if !self.forwarders.contains_key(&story_id) {
                    let receiver = state.events.subscribe(&story_id);
                    let task = spawn_forwarder(receiver, outbound.clone());
                    self.forwarders.insert(story_id.clone(), task);
                    tracing::debug!(
                        story_id = %story_id,
                        user_id = %user.user_id,
                        subscribers = state.events.subscriber_count(&story_id),
                        "Subscribed to story progress"
                    );
                }
                ControlMessage::Subscribed { story_id: &story_id }.to_text()
            }
            ClientMessage::Unsubscribe { story_id } => {
                if let Some(task) = self.forwarders.remove(&story_id) {
                    stop_forwarder(task).await;
                    state.events.release(&story_id);
                }
                ControlMessage::Unsubscribed { story_id: &story_id }.to_text()
            }
        }
    }

    async fn clear(&mut self, state: &AppState) {
        for (story_id, task) in self.forwarders.drain() {
            stop_forwarder(task).await;
            state.events.release(&story_id);
        }
    }
}

/// 포워더를 멈추고, 수신기가 실제로 drop될 때까지 기다립니다.
async fn stop_forwarder(task: JoinHandle<()>) {
    task.abort();
    // 취소된 태스크의 JoinError는 무시합니다
    let _ = task.await;
}

/// 브로드캐스트 수신기 → 연결 송신 채널
///
/// 느린 클라이언트는 밀린 이벤트를 잃고(Lagged) 최신 이벤트부터 다시 받습니다.
fn spawn_forwarder(
    mut receiver: broadcast::Receiver<ProgressEvent>,
    outbound: mpsc::Sender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if event.kind.is_terminal() {
                        tracing::debug!(
                            story_id = %event.story_id,
                            event = %event.wire_type(),
                            "Forwarding terminal event"
                        );
                    }
                    let text = match serde_json::to_string(&event.to_wire()) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to serialize progress event");
                            continue;
                        }
                    };
                    if outbound.send(text).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Progress subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
