use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::Agent;
use crate::config::InvocationConfig;
use crate::models::StreamFrame;
use crate::relay::{ChatRequest, StreamRelay};
use crate::tool_events::ToolEventQueue;
use crate::transport::{ConnectionRouter, ConnectionTarget, FrameSender, Payload};

pub struct AppState {
    pub agent: Arc<dyn Agent>,
    pub invocation: InvocationConfig,
    pub router: ConnectionRouter,
    pub relay: StreamRelay,
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(handle_ws))
        .route("/health", get(handle_health))
        .with_state(state)
}

pub async fn handle_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

pub async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "open_sockets": state.router.len(),
        "active_streams": state.relay.heartbeat().get_active_connection_count(),
        "metrics": state.relay.metrics().snapshot(),
    }))
}

async fn serve_socket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = Uuid::new_v4().to_string();
    let mut outbound = state.router.register(&connection_id);
    let (mut sink, mut inbound) = socket.split();
    info!(connection_id = %connection_id, "WebSocket connected");

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if sink.send(Message::Text(message.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = inbound.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "WebSocket read failed");
                break;
            }
        };

        match serde_json::from_str::<ChatRequest>(text.as_str()) {
            Ok(request) => spawn_relay(&state, &connection_id, request),
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "Rejected malformed request");
                let frame = StreamFrame::Error {
                    message: format!("Invalid request: {}", e),
                    agent_name: state.invocation.use_case_name.clone(),
                    model_id: state.invocation.model_id.clone(),
                };
                if state
                    .router
                    .send(&connection_id, "", &Payload::Frame(frame), "")
                    .is_err()
                {
                    break;
                }
            }
        }
    }

    state.relay.heartbeat().stop_keep_alive(&connection_id);
    state.router.unregister(&connection_id);
    writer.abort();
    info!(connection_id = %connection_id, "WebSocket disconnected");
}

fn spawn_relay(state: &Arc<AppState>, connection_id: &str, request: ChatRequest) {
    let target = ConnectionTarget::new(
        connection_id,
        request
            .conversation_id
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        request
            .message_id
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
    );
    let state = Arc::clone(state);

    tokio::spawn(async move {
        let result = state
            .relay
            .relay(
                Arc::clone(&state.agent),
                state.invocation.clone(),
                &target,
                request.question,
                ToolEventQueue::new(),
            )
            .await;

        if let Err(e) = result {
            error!(
                connection_id = %target.connection_id,
                conversation_id = %target.conversation_id,
                error = %e,
                "Failed to deliver answer"
            );
        }
    });
}
