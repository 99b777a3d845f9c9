/// 迁移记录与进度模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 迁移阶段
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MigrationPhase {
    Begin,
    Sync,
    Switch,
}

impl MigrationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationPhase::Begin => "begin",
            MigrationPhase::Sync => "sync",
            MigrationPhase::Switch => "switch",
        }
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 迁移状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MigrationState {
    Running,
    Paused,
    Successful,
    Failed,
}

impl MigrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationState::Running => "running",
            MigrationState::Paused => "paused",
            MigrationState::Successful => "successful",
            MigrationState::Failed => "failed",
        }
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 迁移动作
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MigrationAction {
    Estimate,
    Begin,
    Sync,
    Switch,
    Pause,
    Abort,
    Finalize,
}

impl MigrationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationAction::Estimate => "estimate",
            MigrationAction::Begin => "begin",
            MigrationAction::Sync => "sync",
            MigrationAction::Switch => "switch",
            MigrationAction::Pause => "pause",
            MigrationAction::Abort => "abort",
            MigrationAction::Finalize => "finalize",
        }
    }
}

impl fmt::Display for MigrationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "estimate" => Ok(MigrationAction::Estimate),
            "begin" => Ok(MigrationAction::Begin),
            "sync" => Ok(MigrationAction::Sync),
            "switch" => Ok(MigrationAction::Switch),
            "pause" => Ok(MigrationAction::Pause),
            "abort" => Ok(MigrationAction::Abort),
            "finalize" => Ok(MigrationAction::Finalize),
            other => Err(format!("unknown migration action \"{}\"", other)),
        }
    }
}

/// 进度条目
///
/// 处于 running 时原地更新，进入终态后不再修改。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressEntry {
    pub phase: MigrationPhase,
    pub state: MigrationState,
    pub current_progress: u64,
    pub total_progress: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub started_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_bytes_second: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_uuid: Option<Uuid>,
}

impl ProgressEntry {
    /// begin/switch 以百分比计，sync 的总量在任务上报前未知
    pub fn start(phase: MigrationPhase, job_uuid: Uuid) -> Self {
        let total_progress = match phase {
            MigrationPhase::Sync => 0,
            _ => 100,
        };
        Self {
            phase,
            state: MigrationState::Running,
            current_progress: 0,
            total_progress,
            message: None,
            started_timestamp: Utc::now(),
            finished_timestamp: None,
            transfer_bytes_second: None,
            eta_ms: None,
            job_uuid: Some(job_uuid),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state != MigrationState::Running
    }
}

/// 迁移记录（每个实例至多一条）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationRecord {
    pub vm_uuid: Uuid,
    pub phase: MigrationPhase,
    pub state: MigrationState,
    pub automatic: bool,
    pub source_node_id: String,
    pub target_node_id: String,
    /// 源与目标在同一节点时目标实例使用的覆盖身份
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_vm_uuid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_alias: Option<String>,
    /// 当前阶段对应的任务
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_uuid: Option<Uuid>,
    /// 已完成的同步轮数
    #[serde(default)]
    pub sync_rounds: u32,
    /// switch 成功后源实例已失效
    #[serde(default)]
    pub source_inactive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub progress_history: Vec<ProgressEntry>,
    pub created_timestamp: DateTime<Utc>,
    pub updated_timestamp: DateTime<Utc>,
    /// 乐观并发版本号，每次写入递增
    #[serde(default)]
    pub version: u64,
}

impl MigrationRecord {
    /// switch 成功是唯一的终态
    pub fn is_terminal(&self) -> bool {
        self.phase == MigrationPhase::Switch && self.state == MigrationState::Successful
    }

    /// 当前阶段的进度条目（最后一条且阶段一致）
    pub fn current_entry(&self) -> Option<&ProgressEntry> {
        self.progress_history.last().filter(|e| e.phase == self.phase)
    }

    pub fn current_entry_mut(&mut self) -> Option<&mut ProgressEntry> {
        let phase = self.phase;
        self.progress_history.last_mut().filter(|e| e.phase == phase)
    }
}

/// 进度流事件（按行输出的 JSON）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WatchEvent {
    Progress {
        phase: MigrationPhase,
        state: MigrationState,
        current_progress: u64,
        total_progress: u64,
        message: Option<String>,
        started_timestamp: DateTime<Utc>,
        finished_timestamp: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transfer_bytes_second: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        eta_ms: Option<u64>,
    },
    End {
        phase: MigrationPhase,
        state: MigrationState,
    },
}

impl WatchEvent {
    pub fn progress(entry: &ProgressEntry) -> Self {
        WatchEvent::Progress {
            phase: entry.phase,
            state: entry.state,
            current_progress: entry.current_progress,
            total_progress: entry.total_progress,
            message: entry.message.clone(),
            started_timestamp: entry.started_timestamp,
            finished_timestamp: entry.finished_timestamp,
            transfer_bytes_second: entry.transfer_bytes_second,
            eta_ms: entry.eta_ms,
        }
    }

    pub fn end(phase: MigrationPhase, state: MigrationState) -> Self {
        WatchEvent::End { phase, state }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, WatchEvent::End { .. })
    }

    /// 序列化为一行 JSON（含换行符）
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_from_str() {
        assert_eq!("switch".parse::<MigrationAction>().unwrap(), MigrationAction::Switch);
        assert!("rollback".parse::<MigrationAction>().is_err());
    }

    #[test]
    fn test_watch_event_wire_format() {
        let mut entry = ProgressEntry::start(MigrationPhase::Sync, Uuid::new_v4());
        entry.current_progress = 512;
        entry.total_progress = 2048;
        entry.transfer_bytes_second = Some(64);

        let line = WatchEvent::progress(&entry).to_line().unwrap();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["type"], "progress");
        assert_eq!(value["phase"], "sync");
        assert_eq!(value["state"], "running");
        assert_eq!(value["current_progress"], 512);
        assert_eq!(value["transfer_bytes_second"], 64);
        assert!(value.get("eta_ms").is_none());

        let end = serde_json::to_value(WatchEvent::end(MigrationPhase::Sync, MigrationState::Successful)).unwrap();
        assert_eq!(end, serde_json::json!({"type": "end", "phase": "sync", "state": "successful"}));
    }

    #[test]
    fn test_begin_entry_is_percentage() {
        let entry = ProgressEntry::start(MigrationPhase::Begin, Uuid::new_v4());
        assert_eq!(entry.total_progress, 100);
        assert!(!entry.is_finished());
    }
}
