//! VisionLink 백엔드 서버
//!
//! 저시력 사용자와 봉사자를 잇는 매칭 엔진, WebRTC 시그널링 릴레이,
//! 블록체인 보상 큐를 하나의 프로세스로 제공한다.

mod api;
mod config;
mod error;
mod handlers;
mod identity;
mod matching;
mod protocol;
mod rewards;
mod state;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use config::Config;
use futures::{SinkExt, StreamExt};
use protocol::{to_envelope, ClientMessage};
use rewards::InMemoryLedger;
use state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 운영 배포에서는 실측 원장 클라이언트로 교체한다. 프로세스 내
    // 원장도 LedgerClient 뒤에 있으므로 큐 동작은 동일하다.
    let funding_balance: f64 = std::env::var("FUNDING_BALANCE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(10.0);
    let ledger = Arc::new(InMemoryLedger::with_balance(
        &config.reward.funding_account,
        funding_balance,
    ));

    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState::new(config, ledger));
    let shutdown = CancellationToken::new();

    // 보상 큐 소비 루프 + 실패 재시도 스윕
    tokio::spawn(state.rewards.clone().run(shutdown.child_token()));
    tokio::spawn(state.rewards.clone().run_retry_sweep(shutdown.child_token()));

    // 주기적 정리: 대기열 타임아웃, 통화 기록, 오래된 방
    {
        let state = state.clone();
        let shutdown = shutdown.child_token();
        tokio::spawn(async move {
            let period = Duration::from_secs(state.config.matching.cleanup_interval_secs);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {
                        state.matching.cleanup();
                        handlers::room::cleanup_old_rooms(state.clone()).await;
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }

    // 하트비트 스윕
    {
        let state = state.clone();
        let shutdown = shutdown.child_token();
        tokio::spawn(async move {
            let period = Duration::from_secs(state.config.room.heartbeat_interval_secs);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {
                        handlers::connection::heartbeat_sweep(state.clone()).await;
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }

    let app = Router::new()
        .route("/", get(|| async { "VisionLink Backend" }))
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "OK" }))
        .with_state(state.clone())
        .merge(api::router(state.clone()))
        .layer(CorsLayer::permissive());

    tracing::info!(%addr, "VisionLink backend listening");

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Shutdown signal received");
                shutdown.cancel();
            }
        })
        .await?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// WebSocket 연결 수명주기. 송신은 전용 태스크, 수신은 이 루프가 맡고,
/// 하트비트 타임아웃 취소 토큰이 양쪽을 끝낸다.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let (connection_id, cancel) = handlers::connection::handle_connection(state.clone(), tx).await;

    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let envelope = to_envelope(&message);
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize outbound message");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(connection_id = %connection_id, "Connection force-terminated");
                break;
            }
            message = ws_receiver.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(msg) => {
                                handle_client_message(state.clone(), &connection_id, msg).await;
                            }
                            Err(e) => {
                                tracing::warn!(
                                    connection_id = %connection_id,
                                    error = %e,
                                    "Unparseable client message"
                                );
                                if let Some(session) = state.connections.get(&connection_id) {
                                    let _ = session.sender.send(protocol::ServerMessage::Error {
                                        code: "INVALID_MESSAGE".to_string(),
                                        message: "message could not be parsed".to_string(),
                                    });
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(connection_id = %connection_id, error = %e, "WebSocket error");
                        break;
                    }
                }
            }
        }
    }

    handlers::connection::handle_disconnect(state, &connection_id).await;
    send_task.abort();
}

/// 수신 메시지 디스패치
async fn handle_client_message(state: Arc<AppState>, connection_id: &str, message: ClientMessage) {
    match message {
        ClientMessage::JoinRoom {
            room_id,
            user_id,
            user_type,
        } => {
            handlers::room::handle_join_room(state, connection_id, &room_id, &user_id, user_type)
                .await;
        }
        ClientMessage::LeaveRoom => {
            handlers::room::handle_leave_room(state, connection_id).await;
        }
        ClientMessage::Offer {
            target_user_id,
            sdp,
        } => {
            handlers::signaling::handle_offer(state, connection_id, &target_user_id, sdp).await;
        }
        ClientMessage::Answer {
            target_user_id,
            sdp,
        } => {
            handlers::signaling::handle_answer(state, connection_id, &target_user_id, sdp).await;
        }
        ClientMessage::IceCandidate {
            target_user_id,
            candidate,
        } => {
            handlers::signaling::handle_ice_candidate(
                state,
                connection_id,
                &target_user_id,
                candidate,
            )
            .await;
        }
        ClientMessage::CallStatus { status, reason } => {
            handlers::signaling::handle_call_status(state, connection_id, status, reason).await;
        }
        ClientMessage::Ping => {
            if let Some(session) = state.connections.get(connection_id) {
                handlers::connection::handle_ping(&session.sender);
            }
        }
        ClientMessage::Pong => {
            handlers::connection::handle_pong(&state, connection_id).await;
        }
    }
}
