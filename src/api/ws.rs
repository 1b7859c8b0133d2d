//! WebSocket bridge between operator clients and the fan-out hub. One task
//! drains the hub queue onto the socket; the request task handles inbound
//! frames. Unparseable frames are ignored rather than fatal.

use crate::hub::LogTarget;
use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use common::{ClientFrame, MacAddr, ServerEvent};
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};

pub async fn upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle(state, socket))
}

async fn handle(state: AppState, socket: WebSocket) {
    let (mut sink, mut source) = socket.split();
    let (id, mut events) = state.hub.subscribe().await;
    debug!("ws subscriber {id} connected");

    let writer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let frame = match serde_json::to_string(&event) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!("ws frame serialization failed: {err}");
                    continue;
                }
            };
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = source.next().await {
        let message = match message {
            Ok(message) => message,
            Err(_) => break,
        };
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => handle_frame(&state, id, frame).await,
                Err(err) => debug!("ws subscriber {id} sent unparseable frame: {err}"),
            },
            Message::Close(_) => break,
            // Pings are answered by the protocol layer.
            _ => {}
        }
    }

    state.hub.unsubscribe(id).await;
    writer.abort();
    debug!("ws subscriber {id} disconnected");
}

async fn handle_frame(state: &AppState, id: u64, frame: ClientFrame) {
    match frame {
        ClientFrame::SubscribeLogs { device_id } => {
            if let Some(target) = log_target(&device_id) {
                state.hub.set_log_subscription(id, target, true).await;
            }
        }
        ClientFrame::UnsubscribeLogs { device_id } => {
            if let Some(target) = log_target(&device_id) {
                state.hub.set_log_subscription(id, target, false).await;
            }
        }
        ClientFrame::SubscribeConsole { device_id } => {
            if let Ok(mac) = MacAddr::parse(&device_id) {
                state.hub.set_console_subscription(id, mac, true).await;
            }
        }
        ClientFrame::UnsubscribeConsole { device_id } => {
            if let Ok(mac) = MacAddr::parse(&device_id) {
                state.hub.set_console_subscription(id, mac, false).await;
            }
        }
        ClientFrame::SendCommand {
            device_id,
            command,
            payload,
        } => {
            let Ok(mac) = MacAddr::parse(&device_id) else {
                debug!("ws subscriber {id} sent command for invalid MAC {device_id:?}");
                return;
            };
            if let Err(err) = state.pipe.enqueue_command(&mac, command, payload).await {
                warn!("ws command enqueue for {mac} failed: {err}");
            }
        }
        ClientFrame::Ping => {
            state.hub.send_to(id, ServerEvent::Pong).await;
        }
    }
}

fn log_target(device_id: &str) -> Option<LogTarget> {
    if device_id.eq_ignore_ascii_case("all") {
        return Some(LogTarget::All);
    }
    MacAddr::parse(device_id).ok().map(LogTarget::Device)
}
