/// 应用全局状态

use std::sync::Arc;

use crate::config::Config;
use crate::migration::WatchHub;
use crate::services::capacity_service::{CapacityOracle, NodeRegistry};
use crate::services::job_service::{AgentJobRunner, JobRunner};
use crate::store::InstanceStore;
use crate::ws::AgentConnectionManager;

/// 应用状态
#[derive(Clone)]
pub struct AppState {
    /// 实例/迁移/任务存储
    store: Arc<dyn InstanceStore>,
    /// 任务执行
    jobs: Arc<dyn JobRunner>,
    /// 节点容量（由 Agent 上报）
    nodes: NodeRegistry,
    /// Agent WebSocket 连接管理器
    agent_manager: AgentConnectionManager,
    /// 迁移进度订阅
    watch_hub: WatchHub,
    config: Arc<Config>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn InstanceStore>,
        jobs: Arc<dyn JobRunner>,
        nodes: NodeRegistry,
        agent_manager: AgentConnectionManager,
    ) -> Self {
        Self {
            store,
            jobs,
            nodes,
            agent_manager,
            watch_hub: WatchHub::new(),
            config: Arc::new(config),
        }
    }

    /// 任务经由 Agent 下发的生产配置
    pub fn with_agents(config: Config, store: Arc<dyn InstanceStore>) -> Self {
        let agent_manager = AgentConnectionManager::new();
        let jobs = Arc::new(AgentJobRunner::new(store.clone(), agent_manager.clone()));
        Self::new(config, store, jobs, NodeRegistry::new(), agent_manager)
    }

    pub fn store(&self) -> &dyn InstanceStore {
        self.store.as_ref()
    }

    pub fn jobs(&self) -> &dyn JobRunner {
        self.jobs.as_ref()
    }

    pub fn capacity(&self) -> &dyn CapacityOracle {
        &self.nodes
    }

    /// 获取节点容量表
    pub fn nodes(&self) -> NodeRegistry {
        self.nodes.clone()
    }

    /// 获取 Agent 连接管理器
    pub fn agent_manager(&self) -> AgentConnectionManager {
        self.agent_manager.clone()
    }

    pub fn watch_hub(&self) -> &WatchHub {
        &self.watch_hub
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
