/// 迁移进度记录
///
/// 当前阶段的条目在 running 时原地更新，进入终态后不再修改；新阶段追加新条目。

use chrono::Utc;
use common::models::{Job, JobExecution, MigrationPhase, MigrationRecord, MigrationState, ProgressEntry};
use common::ws_rpc::JobProgressNotification;
use uuid::Uuid;

/// 阶段任务的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    Succeeded { transferred_bytes: Option<u64> },
    Failed { message: String },
}

impl PhaseOutcome {
    /// 非 succeeded 的终态都视为阶段失败，错误取最后一个链结果
    pub fn from_job(job: &Job, transferred_bytes: Option<u64>) -> Self {
        match job.execution {
            JobExecution::Succeeded => PhaseOutcome::Succeeded { transferred_bytes },
            execution => PhaseOutcome::Failed {
                message: job
                    .last_error()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Job {} {}", job.uuid, execution.as_str())),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PhaseOutcome::Succeeded { .. })
    }
}

/// 进入新阶段
pub fn start_phase(record: &mut MigrationRecord, phase: MigrationPhase, job_uuid: Uuid) {
    record.phase = phase;
    record.state = MigrationState::Running;
    record.job_uuid = Some(job_uuid);
    record.error = None;
    record.progress_history.push(ProgressEntry::start(phase, job_uuid));
    record.updated_timestamp = Utc::now();
}

/// 应用一次进度上报，返回更新后的条目；阶段已结束时忽略
pub fn apply_progress(record: &mut MigrationRecord, progress: &JobProgressNotification) -> Option<ProgressEntry> {
    if record.state != MigrationState::Running || record.job_uuid != Some(progress.job_uuid) {
        return None;
    }

    let entry = record.current_entry_mut()?;
    if entry.is_finished() {
        return None;
    }

    entry.current_progress = progress.current_progress;
    entry.total_progress = progress.total_progress;
    if progress.message.is_some() {
        entry.message = progress.message.clone();
    }
    entry.transfer_bytes_second = progress.transfer_bytes_second;
    entry.eta_ms = progress.eta_ms.or_else(|| {
        let rate = progress.transfer_bytes_second.filter(|r| *r > 0)?;
        let left = progress.total_progress.checked_sub(progress.current_progress)?;
        Some(left.saturating_mul(1000) / rate)
    });

    let entry = entry.clone();
    record.updated_timestamp = Utc::now();
    Some(entry)
}

/// 结束当前阶段，返回终态条目
pub fn finish_phase(record: &mut MigrationRecord, outcome: &PhaseOutcome) -> Option<ProgressEntry> {
    let phase = record.phase;
    let now = Utc::now();

    let entry = record.current_entry_mut()?;
    match outcome {
        PhaseOutcome::Succeeded { transferred_bytes } => {
            entry.state = MigrationState::Successful;
            match phase {
                // sync 的单位是字节，完成时 current == total
                MigrationPhase::Sync => {
                    let done = transferred_bytes
                        .unwrap_or(entry.total_progress)
                        .max(entry.current_progress);
                    entry.current_progress = done;
                    entry.total_progress = done;
                }
                _ => {
                    entry.current_progress = 100;
                    entry.total_progress = 100;
                }
            }
            entry.eta_ms = None;
        }
        PhaseOutcome::Failed { message } => {
            entry.state = MigrationState::Failed;
            entry.message = Some(message.clone());
        }
    }
    entry.finished_timestamp = Some(now);
    let entry = entry.clone();

    match outcome {
        PhaseOutcome::Succeeded { .. } => {
            record.state = MigrationState::Successful;
            if phase == MigrationPhase::Sync {
                record.sync_rounds += 1;
            }
            if phase == MigrationPhase::Switch {
                record.source_inactive = true;
            }
        }
        PhaseOutcome::Failed { message } => {
            record.state = MigrationState::Failed;
            record.error = Some(match phase {
                MigrationPhase::Switch => format!("{} (manual intervention required)", message),
                _ => message.clone(),
            });
        }
    }
    record.updated_timestamp = now;
    Some(entry)
}

/// 暂停：running 条目以 paused 结束；已成功的条目保持不变
pub fn pause_phase(record: &mut MigrationRecord) -> Option<ProgressEntry> {
    let now = Utc::now();
    let was_running = record.state == MigrationState::Running;
    record.state = MigrationState::Paused;
    record.updated_timestamp = now;

    if !was_running {
        return None;
    }
    let entry = record.current_entry_mut()?;
    entry.state = MigrationState::Paused;
    entry.finished_timestamp = Some(now);
    entry.message = Some("paused".to_string());
    Some(entry.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::models::{JobKind, JobRequest};
    use serde_json::json;

    fn record() -> MigrationRecord {
        MigrationRecord {
            vm_uuid: Uuid::new_v4(),
            phase: MigrationPhase::Begin,
            state: MigrationState::Running,
            automatic: false,
            source_node_id: "cn-1".into(),
            target_node_id: "cn-2".into(),
            target_vm_uuid: None,
            target_alias: None,
            job_uuid: None,
            sync_rounds: 0,
            source_inactive: false,
            error: None,
            progress_history: Vec::new(),
            created_timestamp: Utc::now(),
            updated_timestamp: Utc::now(),
            version: 1,
        }
    }

    fn progress(job_uuid: Uuid, current: u64, total: u64) -> JobProgressNotification {
        JobProgressNotification {
            job_uuid,
            current_progress: current,
            total_progress: total,
            message: Some("sending".into()),
            transfer_bytes_second: Some(1000),
            eta_ms: None,
        }
    }

    #[test]
    fn test_sync_progress_then_success() {
        let mut record = record();
        let job = Uuid::new_v4();
        start_phase(&mut record, MigrationPhase::Sync, job);
        assert_eq!(record.progress_history.len(), 1);
        assert_eq!(record.current_entry().unwrap().total_progress, 0);

        let entry = apply_progress(&mut record, &progress(job, 4000, 10000)).unwrap();
        assert_eq!(entry.current_progress, 4000);
        assert_eq!(entry.eta_ms, Some(6000));

        // 其他任务的上报被忽略
        assert!(apply_progress(&mut record, &progress(Uuid::new_v4(), 1, 2)).is_none());

        let done = finish_phase(&mut record, &PhaseOutcome::Succeeded { transferred_bytes: Some(10000) }).unwrap();
        assert_eq!(done.current_progress, done.total_progress);
        assert_eq!(done.state, MigrationState::Successful);
        assert!(done.finished_timestamp.is_some());
        assert_eq!(record.sync_rounds, 1);

        // 终态条目不再变化
        assert!(apply_progress(&mut record, &progress(job, 1, 2)).is_none());
        assert_eq!(record.current_entry().unwrap(), &done);
    }

    #[test]
    fn test_new_phase_appends_entry() {
        let mut record = record();
        start_phase(&mut record, MigrationPhase::Begin, Uuid::new_v4());
        finish_phase(&mut record, &PhaseOutcome::Succeeded { transferred_bytes: None });
        start_phase(&mut record, MigrationPhase::Sync, Uuid::new_v4());

        assert_eq!(record.progress_history.len(), 2);
        assert_eq!(record.progress_history[0].state, MigrationState::Successful);
        assert_eq!(record.progress_history[0].current_progress, 100);
        assert_eq!(record.progress_history[1].state, MigrationState::Running);
    }

    #[test]
    fn test_switch_failure_flags_manual_intervention() {
        let mut record = record();
        start_phase(&mut record, MigrationPhase::Switch, Uuid::new_v4());
        finish_phase(&mut record, &PhaseOutcome::Failed { message: "zone boot failed".into() });

        assert_eq!(record.state, MigrationState::Failed);
        assert!(record.error.as_deref().unwrap().contains("manual intervention"));
        assert!(!record.source_inactive);
    }

    #[test]
    fn test_pause_running_and_successful() {
        let mut record = record();
        start_phase(&mut record, MigrationPhase::Sync, Uuid::new_v4());
        let entry = pause_phase(&mut record).unwrap();
        assert_eq!(entry.state, MigrationState::Paused);
        assert_eq!(record.state, MigrationState::Paused);

        let mut record = self::record();
        start_phase(&mut record, MigrationPhase::Begin, Uuid::new_v4());
        finish_phase(&mut record, &PhaseOutcome::Succeeded { transferred_bytes: None });
        assert!(pause_phase(&mut record).is_none());
        assert_eq!(record.state, MigrationState::Paused);
        assert_eq!(record.progress_history[0].state, MigrationState::Successful);
    }

    #[test]
    fn test_outcome_from_job() {
        let mut job = Job::from_request(JobRequest::new(JobKind::MigrateSync, Uuid::new_v4(), "cn-1", json!({})));
        job.execution = JobExecution::Cancelled;
        match PhaseOutcome::from_job(&job, None) {
            PhaseOutcome::Failed { message } => assert!(message.contains("cancelled")),
            other => panic!("unexpected outcome {:?}", other),
        }

        job.execution = JobExecution::Succeeded;
        assert!(PhaseOutcome::from_job(&job, Some(5)).is_success());
    }
}
