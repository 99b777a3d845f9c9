/// 节点容量服务
///
/// 计算节点通过 Agent 上报可用 RAM/磁盘/CPU，控制面只读取这些数据做准入判断。

use async_trait::async_trait;
use chrono::Utc;
use common::models::NodeCapacity;
use common::ws_rpc::NodeCapacityReport;
use common::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// 容量查询接口
#[async_trait]
pub trait CapacityOracle: Send + Sync {
    /// 查询单个节点，未知节点返回 NotFound
    async fn query(&self, node_id: &str) -> Result<NodeCapacity>;

    /// 所有已知节点
    async fn list(&self) -> Vec<NodeCapacity>;
}

/// 由 Agent 上报填充的节点容量表
#[derive(Clone, Default)]
pub struct NodeRegistry {
    nodes: Arc<RwLock<HashMap<String, NodeCapacity>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次容量上报
    pub async fn report(&self, report: NodeCapacityReport) {
        debug!(
            "节点容量上报: node={}, ram={}, disk={}, cpu={}",
            report.node_id, report.available_ram, report.available_disk, report.available_cpu
        );
        let capacity = NodeCapacity {
            node_id: report.node_id.clone(),
            available_ram: report.available_ram,
            available_disk: report.available_disk,
            available_cpu: report.available_cpu,
            reported_at: Utc::now(),
        };
        let mut nodes = self.nodes.write().await;
        nodes.insert(report.node_id, capacity);
    }

    /// 节点离线后移除其容量数据
    pub async fn remove(&self, node_id: &str) {
        let mut nodes = self.nodes.write().await;
        if nodes.remove(node_id).is_some() {
            info!("已移除节点容量数据: {}", node_id);
        }
    }
}

#[async_trait]
impl CapacityOracle for NodeRegistry {
    async fn query(&self, node_id: &str) -> Result<NodeCapacity> {
        let nodes = self.nodes.read().await;
        nodes
            .get(node_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("Server {} not found", node_id)))
    }

    async fn list(&self) -> Vec<NodeCapacity> {
        let nodes = self.nodes.read().await;
        let mut list: Vec<NodeCapacity> = nodes.values().cloned().collect();
        list.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        list
    }
}
