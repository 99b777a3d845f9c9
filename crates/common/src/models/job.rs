/// 异步任务模型
///
/// 控制面只提交任务并观察结果，实际执行由 Job Runner 完成。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::MigrationPhase;

/// 任务类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Provision,
    Start,
    Stop,
    Reboot,
    Resize,
    CreateDisk,
    ResizeDisk,
    DeleteDisk,
    MigrateBegin,
    MigrateSync,
    MigrateSwitch,
    MigrateAbort,
    MigrateFinalize,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Provision => "provision",
            JobKind::Start => "start",
            JobKind::Stop => "stop",
            JobKind::Reboot => "reboot",
            JobKind::Resize => "resize",
            JobKind::CreateDisk => "create_disk",
            JobKind::ResizeDisk => "resize_disk",
            JobKind::DeleteDisk => "delete_disk",
            JobKind::MigrateBegin => "migrate_begin",
            JobKind::MigrateSync => "migrate_sync",
            JobKind::MigrateSwitch => "migrate_switch",
            JobKind::MigrateAbort => "migrate_abort",
            JobKind::MigrateFinalize => "migrate_finalize",
        }
    }

    /// 迁移阶段任务对应的阶段
    pub fn migration_phase(&self) -> Option<MigrationPhase> {
        match self {
            JobKind::MigrateBegin => Some(MigrationPhase::Begin),
            JobKind::MigrateSync => Some(MigrationPhase::Sync),
            JobKind::MigrateSwitch => Some(MigrationPhase::Switch),
            _ => None,
        }
    }

    /// 迁移相关任务（阶段任务与清理任务）
    pub fn is_migration(&self) -> bool {
        matches!(
            self,
            JobKind::MigrateBegin
                | JobKind::MigrateSync
                | JobKind::MigrateSwitch
                | JobKind::MigrateAbort
                | JobKind::MigrateFinalize
        )
    }

    /// 修改实例磁盘或套餐的任务，同一实例同时至多一个
    pub fn is_instance_mutation(&self) -> bool {
        matches!(
            self,
            JobKind::Resize | JobKind::CreateDisk | JobKind::ResizeDisk | JobKind::DeleteDisk
        )
    }

    pub fn for_phase(phase: MigrationPhase) -> Self {
        match phase {
            MigrationPhase::Begin => JobKind::MigrateBegin,
            MigrationPhase::Sync => JobKind::MigrateSync,
            MigrationPhase::Switch => JobKind::MigrateSwitch,
        }
    }
}

/// 任务执行状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobExecution {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobExecution {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobExecution::Queued => "queued",
            JobExecution::Running => "running",
            JobExecution::Succeeded => "succeeded",
            JobExecution::Failed => "failed",
            JobExecution::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobExecution::Succeeded | JobExecution::Failed | JobExecution::Cancelled
        )
    }
}

impl From<String> for JobExecution {
    fn from(s: String) -> Self {
        match s.as_str() {
            "running" => JobExecution::Running,
            "succeeded" => JobExecution::Succeeded,
            "failed" => JobExecution::Failed,
            "cancelled" => JobExecution::Cancelled,
            _ => JobExecution::Queued,
        }
    }
}

/// 任务链中单步的执行结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainResult {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// 提交给 Job Runner 的请求
///
/// 任务 UUID 在提交前分配，调用方可以先把它写入迁移记录再下发。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRequest {
    pub uuid: Uuid,
    pub kind: JobKind,
    pub vm_uuid: Uuid,
    /// 执行任务的计算节点
    pub node_id: String,
    pub params: JsonValue,
}

impl JobRequest {
    pub fn new(kind: JobKind, vm_uuid: Uuid, node_id: impl Into<String>, params: JsonValue) -> Self {
        Self {
            uuid: crate::utils::generate_uuid(),
            kind,
            vm_uuid,
            node_id: node_id.into(),
            params,
        }
    }
}

/// 任务记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub uuid: Uuid,
    pub kind: JobKind,
    pub vm_uuid: Uuid,
    pub node_id: String,
    pub params: JsonValue,
    pub execution: JobExecution,
    #[serde(default)]
    pub chain_results: Vec<ChainResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn from_request(request: JobRequest) -> Self {
        let now = Utc::now();
        Self {
            uuid: request.uuid,
            kind: request.kind,
            vm_uuid: request.vm_uuid,
            node_id: request.node_id,
            params: request.params,
            execution: JobExecution::Queued,
            chain_results: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// 最后一个带错误的链结果
    pub fn last_error(&self) -> Option<&str> {
        self.chain_results
            .iter()
            .rev()
            .find_map(|r| r.error.as_deref())
    }
}

/// 协作式取消信号
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobSignal {
    Pause,
    Abort,
}
