/// WebSocket RPC 负载定义
///
/// Server -> Agent: job_submit / job_signal
/// Agent -> Server: register / heartbeat / node_capacity / job_progress / job_finished

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ChainResult, Job, JobExecution, JobSignal};

/// 方法名
pub mod methods {
    pub const REGISTER: &str = "register";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const NODE_CAPACITY: &str = "node_capacity";
    pub const JOB_SUBMIT: &str = "job_submit";
    pub const JOB_SIGNAL: &str = "job_signal";
    pub const JOB_PROGRESS: &str = "job_progress";
    pub const JOB_FINISHED: &str = "job_finished";
}

// ============================================================================
// Agent 注册
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub node_id: String,
    pub hostname: String,
    pub ip_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub success: bool,
    pub message: String,
}

// ============================================================================
// 节点容量上报
// ============================================================================

/// 节点可用容量 (MiB / CPU 百分比)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCapacityReport {
    pub node_id: String,
    pub available_ram: i64,
    pub available_disk: i64,
    pub available_cpu: i64,
}

// ============================================================================
// 任务下发与上报
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmitNotification {
    pub job: Job,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSignalNotification {
    pub job_uuid: Uuid,
    pub signal: JobSignal,
}

/// 执行中的进度上报
///
/// 迁移任务按阶段语义填写：begin/switch 为百分比，sync 为已传输字节数。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobProgressNotification {
    pub job_uuid: Uuid,
    pub current_progress: u64,
    pub total_progress: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_bytes_second: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_ms: Option<u64>,
}

/// 任务结束上报
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobFinishedNotification {
    pub job_uuid: Uuid,
    pub execution: JobExecution,
    #[serde(default)]
    pub chain_results: Vec<ChainResult>,
    /// sync 任务本轮实际传输的字节数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transferred_bytes: Option<u64>,
}
