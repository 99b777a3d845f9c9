/// WebSocket RPC 消息信封

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::RpcError;

/// 消息类型
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// 请求（期望响应），Agent 只用于注册
    Request,
    Response,
    /// 单向通知：任务下发、进度上报、心跳
    Notification,
}

/// RPC 消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMessage {
    pub id: String,

    #[serde(rename = "type")]
    pub message_type: MessageType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,

    /// 仅错误响应携带
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorInfo>,
}

/// RPC 错误信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorInfo {
    pub code: String,
    pub message: String,
}

impl RpcMessage {
    pub fn request(method: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: format!("req-{}", Uuid::new_v4()),
            message_type: MessageType::Request,
            method: Some(method.into()),
            payload: Some(payload),
            error: None,
        }
    }

    pub fn response(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            message_type: MessageType::Response,
            method: None,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn error_response(id: impl Into<String>, err: &RpcError) -> Self {
        Self {
            id: id.into(),
            message_type: MessageType::Response,
            method: None,
            payload: None,
            error: Some(RpcErrorInfo {
                code: err.code.as_str().to_string(),
                message: err.message.clone(),
            }),
        }
    }

    pub fn notification(method: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: format!("notif-{}", Uuid::new_v4()),
            message_type: MessageType::Notification,
            method: Some(method.into()),
            payload: Some(payload),
            error: None,
        }
    }

    /// 以强类型负载构造通知
    pub fn typed_notification<T: Serialize>(method: impl Into<String>, payload: &T) -> Result<Self, RpcError> {
        Ok(Self::notification(method, serde_json::to_value(payload)?))
    }

    /// 解析负载
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        let payload = self
            .payload
            .clone()
            .ok_or_else(|| RpcError::invalid_params("消息缺少负载"))?;
        serde_json::from_value(payload).map_err(|e| RpcError::invalid_params(format!("负载格式错误: {}", e)))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn is_error(&self) -> bool {
        self.message_type == MessageType::Response && self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws_rpc::{JobSignalNotification, RpcErrorCode};
    use crate::models::JobSignal;
    use serde_json::json;

    #[test]
    fn test_typed_notification_roundtrip() {
        let job_uuid = Uuid::new_v4();
        let msg = RpcMessage::typed_notification(
            "job_signal",
            &JobSignalNotification { job_uuid, signal: JobSignal::Pause },
        )
        .unwrap();
        assert_eq!(msg.message_type, MessageType::Notification);
        assert!(msg.id.starts_with("notif-"));

        let parsed = RpcMessage::from_json(&msg.to_json().unwrap()).unwrap();
        let signal: JobSignalNotification = parsed.parse_payload().unwrap();
        assert_eq!(signal.job_uuid, job_uuid);
        assert_eq!(signal.signal, JobSignal::Pause);
    }

    #[test]
    fn test_parse_payload_errors() {
        let msg = RpcMessage::notification("job_progress", json!({"unexpected": true}));
        let err = msg.parse_payload::<JobSignalNotification>().unwrap_err();
        assert_eq!(err.code, RpcErrorCode::InvalidParams);

        let mut empty = RpcMessage::notification("heartbeat", json!({}));
        empty.payload = None;
        assert!(empty.parse_payload::<serde_json::Value>().is_err());
    }

    #[test]
    fn test_error_response() {
        let msg = RpcMessage::error_response("req-1", &RpcError::node_not_found("cn-9"));
        assert!(msg.is_error());
        assert_eq!(msg.error.as_ref().unwrap().code, "NODE_NOT_FOUND");
    }
}
