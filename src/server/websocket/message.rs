//! WebSocket 消息类型定义

use crate::downloader::{DownloadRecord, EngineEvent};
use serde::{Deserialize, Serialize};

/// 客户端发送给服务端的消息
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsClientMessage {
    /// 心跳 Ping
    Ping {
        /// 客户端时间戳（毫秒）
        timestamp: i64,
    },
    /// 请求状态快照
    RequestSnapshot,
    /// 只接收指定任务的事件
    ///
    /// 未订阅任何任务时接收全部事件。
    Subscribe {
        /// 任务ID列表
        ids: Vec<String>,
    },
    /// 取消订阅
    Unsubscribe {
        ids: Vec<String>,
    },
}

/// 服务端发送给客户端的消息
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsServerMessage {
    /// 心跳 Pong
    Pong {
        /// 服务端时间戳（毫秒）
        timestamp: i64,
        /// 回显客户端时间戳（用于计算延迟）
        client_timestamp: Option<i64>,
    },
    /// 引擎事件
    Event {
        /// 服务端时间戳
        timestamp: i64,
        event: EngineEvent,
    },
    /// 状态快照
    Snapshot {
        active: Vec<DownloadRecord>,
        finished: Vec<DownloadRecord>,
    },
    /// 连接成功
    Connected {
        /// 连接 ID
        connection_id: String,
        /// 服务端时间戳
        timestamp: i64,
    },
    /// 错误消息
    Error {
        /// 错误码
        code: String,
        /// 错误信息
        message: String,
    },
    /// 当前订阅列表
    Subscriptions {
        ids: Vec<String>,
    },
}

impl WsServerMessage {
    /// 创建 Pong 消息
    pub fn pong(client_timestamp: Option<i64>) -> Self {
        Self::Pong {
            timestamp: chrono::Utc::now().timestamp_millis(),
            client_timestamp,
        }
    }

    /// 创建 Connected 消息
    pub fn connected(connection_id: String) -> Self {
        Self::Connected {
            connection_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// 创建错误消息
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// 创建事件消息
    pub fn event(event: EngineEvent) -> Self {
        Self::Event {
            timestamp: chrono::Utc::now().timestamp_millis(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_parsing() {
        let json = r#"{"type":"ping","timestamp":1234567890}"#;
        let msg: WsClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            WsClientMessage::Ping { timestamp } => assert_eq!(timestamp, 1234567890),
            _ => panic!("Expected Ping message"),
        }

        let json = r#"{"type":"subscribe","ids":["a","b"]}"#;
        match serde_json::from_str::<WsClientMessage>(json).unwrap() {
            WsClientMessage::Subscribe { ids } => assert_eq!(ids, vec!["a", "b"]),
            _ => panic!("Expected Subscribe message"),
        }
    }

    #[test]
    fn test_event_message_serialization() {
        let msg = WsServerMessage::event(EngineEvent::Removed {
            id: "task-1".to_string(),
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["event"]["event_type"], "removed");
        assert_eq!(value["event"]["id"], "task-1");
    }
}
