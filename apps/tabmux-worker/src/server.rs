use std::sync::Arc;

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
use serde_json::{Value, json};
use tabmux::coordinator::Coordinator;
use tabmux::message::Frame;
use tabmux::port::{self, PortIo};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct AppState {
    coordinator: Arc<Coordinator>,
}

pub fn build_router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/port", get(open_port))
        .with_state(AppState { coordinator })
}

async fn healthz(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "tabs": state.coordinator.registry().len(),
        "serviceWorkerOnline": state.coordinator.is_service_worker_online(),
    }))
}

async fn open_port(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| bridge_port(state.coordinator, socket))
}

/// Carries frames between one WebSocket and a coordinator port, one JSON
/// text message per frame.
async fn bridge_port(coordinator: Arc<Coordinator>, socket: WebSocket) {
    let (tab_io, worker_io) = port::pair();
    let PortIo {
        outbound: to_worker,
        inbound: mut from_worker,
    } = tab_io;
    let (mut sink, mut stream) = socket.split();

    let serve_task = tokio::spawn(async move { coordinator.serve(worker_io).await });
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = from_worker.recv().await {
            let payload = match serde_json::to_string(&frame) {
                Ok(payload) => payload,
                Err(error) => {
                    warn!(%error, "failed to encode frame");
                    continue;
                }
            };
            if sink.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<Frame>(&text) {
                Ok(frame) => {
                    if to_worker.send(frame).is_err() {
                        break;
                    }
                }
                Err(error) => warn!(%error, "dropping malformed frame"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(error) => {
                debug!(%error, "websocket read failed");
                break;
            }
        }
    }

    drop(to_worker);
    let _ = serve_task.await;
    writer_task.abort();
}
