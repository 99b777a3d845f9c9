/// 任务服务
///
/// 控制面不直接执行实例变更，而是把任务交给计算节点上的 Agent，
/// 并根据 Agent 上报的进度与结果维护任务记录。

use async_trait::async_trait;
use chrono::Utc;
use common::models::{Job, JobExecution, JobKind, JobRequest, JobSignal};
use common::ws_rpc::{
    methods, JobFinishedNotification, JobProgressNotification, JobSignalNotification,
    JobSubmitNotification,
};
use common::{Error, Result};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::metrics;
use crate::store::InstanceStore;
use crate::ws::AgentConnectionManager;

/// 异步任务执行接口
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// 提交任务，立即返回任务 UUID
    async fn submit(&self, request: JobRequest) -> Result<Uuid>;

    async fn poll(&self, job_uuid: Uuid) -> Result<Job>;

    /// 协作式取消：只发送信号，由执行方自行停止
    async fn signal(&self, job_uuid: Uuid, signal: JobSignal) -> Result<()>;
}

/// 通过 Agent WebSocket 下发任务
pub struct AgentJobRunner {
    store: Arc<dyn InstanceStore>,
    agents: AgentConnectionManager,
}

impl AgentJobRunner {
    pub fn new(store: Arc<dyn InstanceStore>, agents: AgentConnectionManager) -> Self {
        Self { store, agents }
    }
}

#[async_trait]
impl JobRunner for AgentJobRunner {
    async fn submit(&self, request: JobRequest) -> Result<Uuid> {
        let mut job = Job::from_request(request);
        self.store.put_job(&job).await?;

        let payload = serde_json::to_value(JobSubmitNotification { job: job.clone() })?;
        if let Err(e) = self.agents.notify(&job.node_id, methods::JOB_SUBMIT, payload).await {
            warn!("任务下发失败: job={}, node={}, error={}", job.uuid, job.node_id, e);
            job.execution = JobExecution::Failed;
            job.updated_at = Utc::now();
            self.store.put_job(&job).await?;
            return Err(Error::Internal(format!(
                "Server {} is not connected: {}",
                job.node_id, e
            )));
        }

        metrics::job_submitted(job.kind.as_str());
        info!("任务已提交: job={}, kind={}, vm={}, node={}", job.uuid, job.kind.as_str(), job.vm_uuid, job.node_id);
        Ok(job.uuid)
    }

    async fn poll(&self, job_uuid: Uuid) -> Result<Job> {
        self.store
            .get_job(job_uuid)
            .await?
            .ok_or_else(|| Error::not_found(format!("Job {} not found", job_uuid)))
    }

    async fn signal(&self, job_uuid: Uuid, signal: JobSignal) -> Result<()> {
        let job = self.poll(job_uuid).await?;
        if job.execution.is_terminal() {
            return Ok(());
        }

        let payload = serde_json::to_value(JobSignalNotification { job_uuid, signal })?;
        self.agents.notify(&job.node_id, methods::JOB_SIGNAL, payload).await?;
        info!("已发送任务信号: job={}, signal={:?}", job_uuid, signal);
        Ok(())
    }
}

/// 记录进度上报，任务转入 running
pub async fn record_progress(
    store: &dyn InstanceStore,
    progress: &JobProgressNotification,
) -> Result<Option<Job>> {
    let Some(mut job) = store.get_job(progress.job_uuid).await? else {
        warn!("收到未知任务的进度: {}", progress.job_uuid);
        return Ok(None);
    };
    if job.execution.is_terminal() {
        return Ok(Some(job));
    }

    if job.execution != JobExecution::Running {
        job.execution = JobExecution::Running;
        job.updated_at = Utc::now();
        store.put_job(&job).await?;
    }
    Ok(Some(job))
}

/// 记录任务结束上报，返回更新后的任务；重复上报时返回 None
pub async fn record_finished(
    store: &dyn InstanceStore,
    finished: &JobFinishedNotification,
) -> Result<Option<Job>> {
    let Some(mut job) = store.get_job(finished.job_uuid).await? else {
        warn!("收到未知任务的结果: {}", finished.job_uuid);
        return Ok(None);
    };
    if job.execution.is_terminal() {
        return Ok(None);
    }

    job.execution = if finished.execution.is_terminal() {
        finished.execution
    } else {
        JobExecution::Failed
    };
    job.chain_results = finished.chain_results.clone();
    job.updated_at = Utc::now();
    store.put_job(&job).await?;

    info!("任务已结束: job={}, kind={}, execution={}", job.uuid, job.kind.as_str(), job.execution.as_str());
    Ok(Some(job))
}

/// 失败任务对应的错误；switch 失败需要人工介入
pub fn job_failure(job: &Job) -> Option<Error> {
    match job.execution {
        JobExecution::Failed | JobExecution::Cancelled => Some(Error::JobFailed {
            job_uuid: job.uuid,
            message: job
                .last_error()
                .unwrap_or(job.execution.as_str())
                .to_string(),
            manual_intervention: job.kind == JobKind::MigrateSwitch,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use common::models::ChainResult;
    use serde_json::json;

    fn finished(job_uuid: Uuid, execution: JobExecution) -> JobFinishedNotification {
        JobFinishedNotification {
            job_uuid,
            execution,
            chain_results: vec![ChainResult {
                name: "receive".into(),
                result: None,
                error: Some("disk full".into()),
                started_at: None,
                finished_at: None,
            }],
            transferred_bytes: None,
        }
    }

    #[tokio::test]
    async fn test_submit_without_agent_fails_and_marks_job() {
        let store = Arc::new(MemoryStore::new());
        let runner = AgentJobRunner::new(store.clone(), AgentConnectionManager::new());

        let request = JobRequest::new(JobKind::Start, Uuid::new_v4(), "cn-offline", json!({}));
        let job_uuid = request.uuid;
        assert!(runner.submit(request).await.is_err());

        let job = runner.poll(job_uuid).await.unwrap();
        assert_eq!(job.execution, JobExecution::Failed);
    }

    #[tokio::test]
    async fn test_finished_is_recorded_once() {
        let store = MemoryStore::new();
        let job = Job::from_request(JobRequest::new(JobKind::MigrateSync, Uuid::new_v4(), "cn-1", json!({})));
        store.put_job(&job).await.unwrap();

        let progress = JobProgressNotification {
            job_uuid: job.uuid,
            current_progress: 10,
            total_progress: 100,
            message: None,
            transfer_bytes_second: None,
            eta_ms: None,
        };
        let running = record_progress(&store, &progress).await.unwrap().unwrap();
        assert_eq!(running.execution, JobExecution::Running);

        let done = record_finished(&store, &finished(job.uuid, JobExecution::Failed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.last_error(), Some("disk full"));

        // 重复上报被忽略
        assert!(record_finished(&store, &finished(job.uuid, JobExecution::Succeeded))
            .await
            .unwrap()
            .is_none());
        let stored = store.get_job(job.uuid).await.unwrap().unwrap();
        assert_eq!(stored.execution, JobExecution::Failed);
    }

    #[test]
    fn test_job_failure_flags_switch() {
        let mut job = Job::from_request(JobRequest::new(JobKind::MigrateSwitch, Uuid::new_v4(), "cn-1", json!({})));
        assert!(job_failure(&job).is_none());

        job.execution = JobExecution::Failed;
        match job_failure(&job) {
            Some(Error::JobFailed { manual_intervention, message, .. }) => {
                assert!(manual_intervention);
                assert_eq!(message, "failed");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
