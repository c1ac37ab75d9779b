//! WebSocket 路由处理器

use crate::server::websocket::message::{WsClientMessage, WsServerMessage};
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// WebSocket 路由处理器
///
/// 升级 HTTP 连接为 WebSocket，处理消息收发
pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// 处理 WebSocket 连接
async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4().to_string();
    info!("新的 WebSocket 连接: {}", connection_id);

    let (mut sender, mut receiver) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<WsServerMessage>();
    let mut events = state.events.subscribe();
    let subscriptions: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

    let connected_msg = WsServerMessage::connected(connection_id.clone());
    if send_message(&mut sender, &connected_msg).await.is_err() {
        error!("发送连接成功消息失败");
        return;
    }

    // 发送任务：客户端回复与引擎事件
    let send_state = state.clone();
    let send_subs = subscriptions.clone();
    let send_task = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                reply = reply_rx.recv() => match reply {
                    Some(reply) => reply,
                    None => break,
                },
                event = events.recv() => match event {
                    Ok(event) => {
                        let wanted = {
                            let subs = send_subs.lock();
                            subs.is_empty() || subs.contains(event.record_id())
                        };
                        if !wanted {
                            continue;
                        }
                        WsServerMessage::event(event)
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("WebSocket 事件积压，跳过 {} 条，改发快照", skipped);
                        snapshot(&send_state)
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            if send_message(&mut sender, &message).await.is_err() {
                break;
            }
        }
    });

    // 接收任务
    let conn_id_recv = connection_id.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Text(text) => {
                    handle_client_message(&state, &subscriptions, &reply_tx, &conn_id_recv, &text);
                }
                Message::Binary(data) => {
                    if let Ok(text) = String::from_utf8(data) {
                        handle_client_message(&state, &subscriptions, &reply_tx, &conn_id_recv, &text);
                    }
                }
                Message::Ping(_) | Message::Pong(_) => {
                    debug!("收到心跳: {}", conn_id_recv);
                }
                Message::Close(_) => {
                    info!("收到关闭消息: {}", conn_id_recv);
                    break;
                }
            }
        }
    });

    // 等待任一任务结束
    tokio::select! {
        _ = send_task => {
            debug!("发送任务结束: {}", connection_id);
        }
        _ = recv_task => {
            debug!("接收任务结束: {}", connection_id);
        }
    }

    info!("WebSocket 连接已关闭: {}", connection_id);
}

async fn send_message<S>(sender: &mut S, message: &WsServerMessage) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
{
    match serde_json::to_string(message) {
        Ok(json) => sender.send(Message::Text(json)).await.map_err(|_| ()),
        Err(e) => {
            error!("序列化消息失败: {}", e);
            Ok(())
        }
    }
}

fn snapshot(state: &AppState) -> WsServerMessage {
    WsServerMessage::Snapshot {
        active: state.engine.active_download_data_models(),
        finished: state.engine.finished_download_data_models(),
    }
}

/// 处理客户端消息
fn handle_client_message(
    state: &AppState,
    subscriptions: &Mutex<HashSet<String>>,
    reply: &mpsc::UnboundedSender<WsServerMessage>,
    connection_id: &str,
    text: &str,
) {
    let response = match serde_json::from_str::<WsClientMessage>(text) {
        Ok(WsClientMessage::Ping { timestamp }) => WsServerMessage::pong(Some(timestamp)),
        Ok(WsClientMessage::RequestSnapshot) => {
            debug!("收到状态快照请求: {}", connection_id);
            snapshot(state)
        }
        Ok(WsClientMessage::Subscribe { ids }) => {
            debug!("收到订阅请求: {} - {:?}", connection_id, ids);
            let mut subs = subscriptions.lock();
            subs.extend(ids);
            WsServerMessage::Subscriptions {
                ids: subs.iter().cloned().collect(),
            }
        }
        Ok(WsClientMessage::Unsubscribe { ids }) => {
            debug!("收到取消订阅请求: {} - {:?}", connection_id, ids);
            let mut subs = subscriptions.lock();
            for id in &ids {
                subs.remove(id);
            }
            WsServerMessage::Subscriptions {
                ids: subs.iter().cloned().collect(),
            }
        }
        Err(e) => {
            warn!("解析客户端消息失败: {} - {}", connection_id, e);
            WsServerMessage::error("PARSE_ERROR", format!("消息解析失败: {}", e))
        }
    };
    let _ = reply.send(response);
}
