/// 共享数据模型
///
/// 定义控制面与 Job Runner Agent 共享的数据结构

pub mod instance;
pub mod job;
pub mod migration;

pub use instance::*;
pub use job::*;
pub use migration::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 计算节点可用容量（由 Capacity Oracle 提供）
///
/// 数值可能为负：节点被超量分配时剩余容量小于零。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeCapacity {
    pub node_id: String,
    /// 可用内存 (MiB)
    pub available_ram: i64,
    /// 可用磁盘 (MiB)
    pub available_disk: i64,
    /// 可用 CPU（百分比，100 = 一个核心）
    pub available_cpu: i64,
    pub reported_at: DateTime<Utc>,
}

/// 常量定义
pub mod constants {
    /// 默认 Server 端口
    pub const DEFAULT_SERVER_PORT: u16 = 3000;

    /// 默认心跳间隔（秒）
    pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 30;

    /// 默认节点离线超时（秒）
    pub const DEFAULT_NODE_TIMEOUT: u64 = 180;

    /// 自动迁移完成阈值：单轮增量同步少于该字节数即进入 switch
    pub const DEFAULT_SYNC_THRESHOLD_BYTES: u64 = 1024 * 1024 * 1024;

    /// 自动迁移最多执行的同步轮数
    pub const DEFAULT_MAX_AUTO_SYNCS: u32 = 10;

    /// estimate 使用的默认传输速率 (bytes/s)
    pub const DEFAULT_TRANSFER_RATE_BYTES: u64 = 100 * 1024 * 1024;

    /// 禁止迁移的实例标签
    pub const TAG_SMARTDC_TYPE: &str = "smartdc_type";
    pub const TAG_SMARTDC_ROLE: &str = "smartdc_role";
}
