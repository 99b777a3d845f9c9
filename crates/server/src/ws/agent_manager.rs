/// Agent 连接管理器
///
/// 负责管理所有 Agent 的 WebSocket 连接

use common::ws_rpc::{RpcError, RpcMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::services::capacity_service::NodeRegistry;

/// Agent 连接信息
pub struct AgentConnection {
    /// 节点 ID
    pub node_id: String,

    /// 节点主机名
    pub hostname: String,

    /// 节点 IP 地址
    pub ip_address: String,

    /// 发送消息的通道
    sender: mpsc::UnboundedSender<RpcMessage>,

    /// 最后心跳时间
    last_heartbeat: RwLock<Instant>,
}

impl AgentConnection {
    /// 发送消息
    pub fn send(&self, msg: RpcMessage) -> Result<(), RpcError> {
        self.sender
            .send(msg)
            .map_err(|_| RpcError::connection_closed())
    }

    /// 发送通知
    pub fn notify(&self, method: impl Into<String>, payload: serde_json::Value) -> Result<(), RpcError> {
        self.send(RpcMessage::notification(method, payload))
    }

    /// 更新最后心跳时间
    pub async fn update_heartbeat(&self) {
        let mut last_heartbeat = self.last_heartbeat.write().await;
        *last_heartbeat = Instant::now();
    }

    /// 获取距离上次心跳的时间（秒）
    pub async fn heartbeat_elapsed(&self) -> u64 {
        let last_heartbeat = self.last_heartbeat.read().await;
        last_heartbeat.elapsed().as_secs()
    }
}

/// Agent 连接管理器
#[derive(Clone)]
pub struct AgentConnectionManager {
    /// 所有连接的映射：node_id -> AgentConnection
    connections: Arc<RwLock<HashMap<String, Arc<AgentConnection>>>>,
}

impl AgentConnectionManager {
    /// 创建新的连接管理器
    pub fn new() -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 注册新的 Agent 连接，同一节点重复注册时替换旧连接
    pub async fn register(
        &self,
        node_id: String,
        hostname: String,
        ip_address: String,
        sender: mpsc::UnboundedSender<RpcMessage>,
    ) -> Arc<AgentConnection> {
        let connection = Arc::new(AgentConnection {
            node_id: node_id.clone(),
            hostname,
            ip_address,
            sender,
            last_heartbeat: RwLock::new(Instant::now()),
        });

        let mut connections = self.connections.write().await;
        connections.insert(node_id.clone(), connection.clone());

        info!("Agent 已注册: {}", node_id);
        connection
    }

    /// 注销 Agent 连接
    pub async fn unregister(&self, node_id: &str) {
        let mut connections = self.connections.write().await;
        if connections.remove(node_id).is_some() {
            info!("Agent 已注销: {}", node_id);
        }
    }

    /// 获取指定节点的连接
    pub async fn get(&self, node_id: &str) -> Option<Arc<AgentConnection>> {
        let connections = self.connections.read().await;
        connections.get(node_id).cloned()
    }

    /// 检查节点是否在线
    pub async fn is_online(&self, node_id: &str) -> bool {
        let connections = self.connections.read().await;
        connections.contains_key(node_id)
    }

    /// 清理超时的连接
    /// 返回被清理的节点 ID 列表
    pub async fn cleanup_timeout_connections(&self, timeout_secs: u64) -> Vec<String> {
        let mut to_remove = Vec::new();

        {
            let connections = self.connections.read().await;
            for (node_id, conn) in connections.iter() {
                let elapsed = conn.heartbeat_elapsed().await;
                if elapsed > timeout_secs {
                    warn!("节点心跳超时: {} ({}秒)", node_id, elapsed);
                    to_remove.push(node_id.clone());
                }
            }
        }

        if !to_remove.is_empty() {
            let mut connections = self.connections.write().await;
            for node_id in &to_remove {
                connections.remove(node_id);
                info!("已清理超时节点: {}", node_id);
            }
        }

        to_remove
    }

    /// 向指定节点发送通知
    pub async fn notify(
        &self,
        node_id: &str,
        method: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<(), RpcError> {
        let method = method.into();
        debug!("[Server -> Agent] 发送通知: node={}, method={}", node_id, method);
        let connection = self
            .get(node_id)
            .await
            .ok_or_else(|| RpcError::node_not_found(node_id))?;

        connection.notify(method, payload)
    }

    /// 启动心跳超时检查任务，超时节点的容量数据一并移除
    pub fn start_heartbeat_monitor(self, nodes: NodeRegistry, timeout_secs: u64, check_interval_secs: u64) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(check_interval_secs.max(1)));

            loop {
                interval.tick().await;

                let removed = self.cleanup_timeout_connections(timeout_secs).await;
                if !removed.is_empty() {
                    warn!("心跳监控: 清理了 {} 个超时节点", removed.len());
                }
                for node_id in &removed {
                    nodes.remove(node_id).await;
                }
            }
        });
    }
}

impl Default for AgentConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ws_rpc::RpcErrorCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_notify_reaches_registered_agent() {
        let manager = AgentConnectionManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.register("cn-1".into(), "host".into(), "10.0.0.1".into(), tx).await;

        manager.notify("cn-1", "job_submit", json!({"a": 1})).await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.method.as_deref(), Some("job_submit"));

        let err = manager.notify("cn-2", "job_submit", json!({})).await.unwrap_err();
        assert_eq!(err.code, RpcErrorCode::NodeNotFound);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_fresh_connections() {
        let manager = AgentConnectionManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.register("cn-1".into(), "host".into(), "10.0.0.1".into(), tx).await;

        assert!(manager.cleanup_timeout_connections(60).await.is_empty());
        assert!(manager.is_online("cn-1").await);

        manager.unregister("cn-1").await;
        assert!(!manager.is_online("cn-1").await);
    }
}
