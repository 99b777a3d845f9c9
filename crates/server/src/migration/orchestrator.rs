/// 迁移编排服务
///
/// 每个实例至多一条迁移记录。所有写入都是基于版本号的比较并交换，
/// 并发请求只会在记录写入处竞争，失败方得到 PreconditionFailed。
/// 实际工作由 Job Runner 执行，这里只推进状态并转发进度。

use chrono::Utc;
use common::models::{
    Instance, InstanceState, Job, JobExecution, JobKind, JobRequest, JobSignal, MigrationAction,
    MigrationPhase, MigrationRecord, MigrationState, NodeCapacity, WatchEvent,
};
use common::utils::{estimate_duration_secs, format_bytes, mib_to_bytes};
use common::ws_rpc::{JobFinishedNotification, JobProgressNotification};
use common::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::progress::{self, PhaseOutcome};
use super::state::{check_transition, position};
use crate::allocation::validate_migration_target;
use crate::app_state::AppState;
use crate::metrics;
use crate::store::{mutation_pending, require_instance};

/// 结束事件写入的最大重试次数
const MAX_SAVE_ATTEMPTS: usize = 3;

/// 迁移动作参数
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MigrateOptions {
    /// 自动串联 sync / switch
    #[serde(default)]
    pub automatic: bool,
    /// 指定目标节点；未指定时按可用内存选择
    pub target_node_id: Option<String>,
    /// 目标实例覆盖身份（同节点迁移时必需，未提供则自动生成）
    pub override_uuid: Option<Uuid>,
    pub override_alias: Option<String>,
}

/// estimate 结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationEstimate {
    /// 预计传输字节数
    pub size: u64,
    /// 预计耗时（秒）
    pub duration: u64,
    /// 估算使用的速率 (bytes/s)
    pub transfer_rate: u64,
}

/// 状态变更动作的结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationOutcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_uuid: Option<Uuid>,
    /// abort 之后记录已删除
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration: Option<MigrationRecord>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MigrateResponse {
    Estimate(MigrationEstimate),
    Action(MigrationOutcome),
}

pub struct MigrationService {
    state: AppState,
}

impl MigrationService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// 迁移动作入口
    pub async fn migrate(
        &self,
        vm_uuid: Uuid,
        action: MigrationAction,
        options: MigrateOptions,
    ) -> Result<MigrateResponse> {
        info!("迁移请求: vm={}, action={}", vm_uuid, action);
        let response = match action {
            MigrationAction::Estimate => MigrateResponse::Estimate(self.estimate(vm_uuid).await?),
            MigrationAction::Begin => MigrateResponse::Action(self.begin(vm_uuid, options).await?),
            MigrationAction::Sync => MigrateResponse::Action(self.sync(vm_uuid).await?),
            MigrationAction::Switch => MigrateResponse::Action(self.switch(vm_uuid).await?),
            MigrationAction::Pause => MigrateResponse::Action(self.pause(vm_uuid).await?),
            MigrationAction::Abort => MigrateResponse::Action(self.abort(vm_uuid).await?),
            MigrationAction::Finalize => MigrateResponse::Action(self.finalize(vm_uuid).await?),
        };
        Ok(response)
    }

    /// 读取实例与迁移记录并检查守卫条件
    async fn load(
        &self,
        vm_uuid: Uuid,
        action: MigrationAction,
    ) -> Result<(Instance, Option<MigrationRecord>)> {
        let instance = require_instance(self.state.store(), vm_uuid).await?;
        if let Some(reason) = instance.migration_exclusion() {
            warn!("迁移被拒绝: vm={}, action={}, reason={}", vm_uuid, action, reason);
            return Err(Error::precondition(reason));
        }

        let record = self.state.store().get_migration(vm_uuid).await?;
        if let Err(e) = check_transition(&vm_uuid, position(record.as_ref()), action) {
            warn!("迁移动作不合法: vm={}, action={}, error={}", vm_uuid, action, e);
            return Err(e);
        }
        Ok((instance, record))
    }

    async fn load_record(&self, vm_uuid: Uuid, action: MigrationAction) -> Result<MigrationRecord> {
        let (_, record) = self.load(vm_uuid, action).await?;
        record.ok_or_else(|| Error::not_found(format!("No migration found for VM {}", vm_uuid)))
    }

    /// 只读：估算需要传输的数据量与耗时
    pub async fn estimate(&self, vm_uuid: Uuid) -> Result<MigrationEstimate> {
        let (instance, _) = self.load(vm_uuid, MigrationAction::Estimate).await?;

        let mib = if instance.brand.has_disks() {
            instance.total_disk_usage()
        } else {
            instance.quota
        };
        let size = mib_to_bytes(mib);
        let transfer_rate = self.state.config().migration.transfer_rate_bytes;
        let duration = estimate_duration_secs(size, transfer_rate);
        debug!("迁移预估: vm={}, size={}, duration={}s", vm_uuid, format_bytes(size), duration);

        Ok(MigrationEstimate {
            size,
            duration,
            transfer_rate,
        })
    }

    /// 创建迁移记录并提交 begin 任务
    pub async fn begin(&self, vm_uuid: Uuid, options: MigrateOptions) -> Result<MigrationOutcome> {
        let (instance, existing) = self.load(vm_uuid, MigrationAction::Begin).await?;
        if let Some(job_uuid) = self.state.store().pending_mutation(vm_uuid).await? {
            return Err(mutation_pending(vm_uuid, job_uuid));
        }

        if !matches!(instance.state, InstanceState::Running | InstanceState::Stopped) {
            return Err(Error::precondition(format!(
                "Cannot migrate a VM in state {}",
                instance.state.as_str()
            )));
        }
        let source_node_id = instance
            .node_id
            .clone()
            .ok_or_else(|| Error::precondition(format!("VM {} is not assigned to a server", vm_uuid)))?;

        let target_node_id = self
            .select_target(&instance, &source_node_id, options.target_node_id.as_deref())
            .await?;

        // 同节点迁移时目标实例必须使用不同身份
        let target_vm_uuid = if target_node_id == source_node_id {
            Some(options.override_uuid.unwrap_or_else(Uuid::new_v4))
        } else {
            options.override_uuid
        };

        let request = JobRequest::new(
            JobKind::MigrateBegin,
            vm_uuid,
            source_node_id.clone(),
            json!({
                "target_node_id": target_node_id,
                "target_vm_uuid": target_vm_uuid,
                "target_alias": options.override_alias,
                "automatic": options.automatic,
            }),
        );

        let now = Utc::now();
        let mut record = MigrationRecord {
            vm_uuid,
            phase: MigrationPhase::Begin,
            state: MigrationState::Running,
            automatic: options.automatic,
            source_node_id,
            target_node_id,
            target_vm_uuid,
            target_alias: options.override_alias,
            job_uuid: None,
            sync_rounds: 0,
            source_inactive: false,
            error: None,
            progress_history: Vec::new(),
            created_timestamp: now,
            updated_timestamp: now,
            version: 0,
        };
        progress::start_phase(&mut record, MigrationPhase::Begin, request.uuid);

        // 原子创建：已终结的旧记录按版本替换，否则仅在不存在时插入
        let saved = self
            .state
            .store()
            .save_migration(record, existing.map(|r| r.version))
            .await?;
        info!(
            "迁移已开始: vm={}, source={}, target={}, automatic={}",
            vm_uuid, saved.source_node_id, saved.target_node_id, saved.automatic
        );

        self.submit_phase(saved, request).await
    }

    pub async fn sync(&self, vm_uuid: Uuid) -> Result<MigrationOutcome> {
        let record = self.load_record(vm_uuid, MigrationAction::Sync).await?;
        self.advance(record, MigrationPhase::Sync).await
    }

    pub async fn switch(&self, vm_uuid: Uuid) -> Result<MigrationOutcome> {
        let record = self.load_record(vm_uuid, MigrationAction::Switch).await?;
        self.advance(record, MigrationPhase::Switch).await
    }

    /// 暂停：记录先转入 paused，再通知任务协作停止
    pub async fn pause(&self, vm_uuid: Uuid) -> Result<MigrationOutcome> {
        let record = self.load_record(vm_uuid, MigrationAction::Pause).await?;
        let running_job = (record.state == MigrationState::Running)
            .then_some(record.job_uuid)
            .flatten();

        let expected = record.version;
        let mut next = record;
        let entry = progress::pause_phase(&mut next);
        let saved = self.state.store().save_migration(next, Some(expected)).await?;

        if let Some(job_uuid) = running_job {
            if let Err(e) = self.state.jobs().signal(job_uuid, JobSignal::Pause).await {
                warn!("暂停信号发送失败: vm={}, job={}, error={}", vm_uuid, job_uuid, e);
            }
        }

        let hub = self.state.watch_hub();
        if let Some(entry) = entry {
            hub.publish(vm_uuid, &WatchEvent::progress(&entry)).await;
        }
        hub.end_phase(vm_uuid, &WatchEvent::end(saved.phase, saved.state), false)
            .await;

        info!("迁移已暂停: vm={}, phase={}", vm_uuid, saved.phase);
        Ok(MigrationOutcome {
            job_uuid: saved.job_uuid,
            migration: Some(saved),
        })
    }

    /// 中止：删除迁移记录并提交目标端清理任务，源实例保持不变
    pub async fn abort(&self, vm_uuid: Uuid) -> Result<MigrationOutcome> {
        let record = self.load_record(vm_uuid, MigrationAction::Abort).await?;
        self.state
            .store()
            .delete_migration(vm_uuid, record.version)
            .await?;

        if record.state == MigrationState::Running {
            if let Some(job_uuid) = record.job_uuid {
                if let Err(e) = self.state.jobs().signal(job_uuid, JobSignal::Abort).await {
                    warn!("中止信号发送失败: vm={}, job={}, error={}", vm_uuid, job_uuid, e);
                }
            }
        }

        let final_state = match record.state {
            MigrationState::Running => MigrationState::Failed,
            other => other,
        };
        self.state
            .watch_hub()
            .end_phase(vm_uuid, &WatchEvent::end(record.phase, final_state), false)
            .await;

        let request = JobRequest::new(
            JobKind::MigrateAbort,
            vm_uuid,
            record.target_node_id.clone(),
            json!({
                "source_node_id": record.source_node_id,
                "target_vm_uuid": record.target_vm_uuid,
                "phase": record.phase,
            }),
        );
        let job_uuid = self.state.jobs().submit(request).await.map_err(|e| {
            warn!("迁移已中止但目标端清理任务提交失败，需要人工清理: vm={}, error={}", vm_uuid, e);
            e
        })?;

        info!("迁移已中止: vm={}, cleanup_job={}", vm_uuid, job_uuid);
        Ok(MigrationOutcome {
            job_uuid: Some(job_uuid),
            migration: None,
        })
    }

    /// switch 成功后清理源节点上的失效实例，任务成功后删除迁移记录
    pub async fn finalize(&self, vm_uuid: Uuid) -> Result<MigrationOutcome> {
        let record = self.load_record(vm_uuid, MigrationAction::Finalize).await?;
        let request = JobRequest::new(
            JobKind::MigrateFinalize,
            vm_uuid,
            record.source_node_id.clone(),
            json!({ "target_node_id": record.target_node_id }),
        );

        let expected = record.version;
        let mut next = record;
        next.job_uuid = Some(request.uuid);
        next.updated_timestamp = Utc::now();
        let saved = self.state.store().save_migration(next, Some(expected)).await?;

        let job_uuid = self.state.jobs().submit(request).await?;
        Ok(MigrationOutcome {
            job_uuid: Some(job_uuid),
            migration: Some(saved),
        })
    }

    pub async fn get(&self, vm_uuid: Uuid) -> Result<MigrationRecord> {
        require_instance(self.state.store(), vm_uuid).await?;
        self.state
            .store()
            .get_migration(vm_uuid)
            .await?
            .ok_or_else(|| Error::not_found(format!("No migration found for VM {}", vm_uuid)))
    }

    pub async fn list(&self) -> Result<Vec<MigrationRecord>> {
        self.state.store().list_migrations().await
    }

    /// 订阅进度流
    ///
    /// 只转发订阅之后的事件。阶段已结束时立即返回最后的 end 事件并关闭；
    /// 自动模式在阶段之间保持打开。
    pub async fn watch(&self, vm_uuid: Uuid) -> Result<mpsc::UnboundedReceiver<WatchEvent>> {
        require_instance(self.state.store(), vm_uuid).await?;

        // 先订阅再读记录，避免错过读取与订阅之间结束的阶段
        let hub = self.state.watch_hub();
        let (subscription, receiver) = hub.subscribe(vm_uuid).await;

        let record = match self.state.store().get_migration(vm_uuid).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                hub.unsubscribe(vm_uuid, subscription).await;
                return Err(Error::not_found(format!("No migration found for VM {}", vm_uuid)));
            }
            Err(e) => {
                hub.unsubscribe(vm_uuid, subscription).await;
                return Err(e);
            }
        };

        let chain_pending = record.automatic
            && record.state == MigrationState::Successful
            && record.phase != MigrationPhase::Switch;
        if record.state == MigrationState::Running || chain_pending {
            return Ok(receiver);
        }

        hub.unsubscribe(vm_uuid, subscription).await;
        let (sender, receiver) = mpsc::unbounded_channel();
        // 接收端在本函数返回后才会被丢弃，发送不会失败
        let _ = sender.send(WatchEvent::end(record.phase, record.state));
        Ok(receiver)
    }

    /// 处理迁移任务的进度上报
    pub async fn handle_job_progress(&self, job: &Job, update: &JobProgressNotification) -> Result<()> {
        if job.kind.migration_phase().is_none() {
            return Ok(());
        }
        let Some(mut record) = self.state.store().get_migration(job.vm_uuid).await? else {
            return Ok(());
        };

        let expected = record.version;
        let Some(entry) = progress::apply_progress(&mut record, update) else {
            debug!("忽略过期的迁移进度: vm={}, job={}", job.vm_uuid, job.uuid);
            return Ok(());
        };

        match self.state.store().save_migration(record, Some(expected)).await {
            Ok(_) => {
                self.state
                    .watch_hub()
                    .publish(job.vm_uuid, &WatchEvent::progress(&entry))
                    .await;
                Ok(())
            }
            // 进度可以丢弃，下一次上报会覆盖
            Err(Error::PreconditionFailed(_)) => {
                debug!("迁移记录已变化，丢弃本次进度: vm={}", job.vm_uuid);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// 处理迁移任务结束
    pub async fn handle_job_finished(&self, job: &Job, finished: &JobFinishedNotification) -> Result<()> {
        match job.kind {
            JobKind::MigrateFinalize => return self.finish_finalize(job).await,
            JobKind::MigrateAbort => {
                if job.execution == JobExecution::Succeeded {
                    info!("迁移清理完成: vm={}", job.vm_uuid);
                } else {
                    warn!(
                        "迁移清理任务失败，目标端可能残留: vm={}, error={}",
                        job.vm_uuid,
                        job.last_error().unwrap_or("unknown")
                    );
                }
                return Ok(());
            }
            kind if kind.migration_phase().is_none() => return Ok(()),
            _ => {}
        }

        let outcome = PhaseOutcome::from_job(job, finished.transferred_bytes);
        for _ in 0..MAX_SAVE_ATTEMPTS {
            let Some(mut record) = self.state.store().get_migration(job.vm_uuid).await? else {
                return Ok(());
            };
            // 已暂停或已进入下一阶段
            if record.job_uuid != Some(job.uuid) || record.state != MigrationState::Running {
                debug!("忽略过期的迁移任务结果: vm={}, job={}", job.vm_uuid, job.uuid);
                return Ok(());
            }

            let expected = record.version;
            let Some(entry) = progress::finish_phase(&mut record, &outcome) else {
                return Ok(());
            };
            match self.state.store().save_migration(record, Some(expected)).await {
                Ok(saved) => return self.after_phase(saved, entry, &outcome).await,
                Err(Error::PreconditionFailed(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        warn!("迁移记录持续冲突，放弃写入任务结果: vm={}, job={}", job.vm_uuid, job.uuid);
        Ok(())
    }

    async fn finish_finalize(&self, job: &Job) -> Result<()> {
        if job.execution != JobExecution::Succeeded {
            warn!("迁移收尾失败: vm={}, error={}", job.vm_uuid, job.last_error().unwrap_or("unknown"));
            return Ok(());
        }
        let Some(record) = self.state.store().get_migration(job.vm_uuid).await? else {
            return Ok(());
        };
        if record.job_uuid == Some(job.uuid) {
            self.state
                .store()
                .delete_migration(job.vm_uuid, record.version)
                .await?;
            info!("迁移记录已删除: vm={}", job.vm_uuid);
        }
        Ok(())
    }

    /// 阶段结束后的推送、实例更新与自动串联
    async fn after_phase(
        &self,
        saved: MigrationRecord,
        entry: common::models::ProgressEntry,
        outcome: &PhaseOutcome,
    ) -> Result<()> {
        let vm_uuid = saved.vm_uuid;
        info!(
            "迁移阶段结束: vm={}, phase={}, state={}",
            vm_uuid, saved.phase, saved.state
        );

        metrics::migration_phase_finished(saved.phase.as_str(), saved.state.as_str());

        if saved.phase == MigrationPhase::Switch && outcome.is_success() {
            let target_node_id = saved.target_node_id.clone();
            self.state
                .store()
                .update_instance(
                    vm_uuid,
                    Box::new(move |instance| {
                        instance.node_id = Some(target_node_id);
                        instance.updated_at = Utc::now();
                        Ok(())
                    }),
                )
                .await?;
            info!("实例已切换到目标节点: vm={}, node={}", vm_uuid, saved.target_node_id);
        }

        let chain = saved.automatic && outcome.is_success() && saved.phase != MigrationPhase::Switch;
        let hub = self.state.watch_hub();
        hub.publish(vm_uuid, &WatchEvent::progress(&entry)).await;
        hub.end_phase(vm_uuid, &WatchEvent::end(saved.phase, saved.state), chain)
            .await;

        if chain {
            let transferred = match outcome {
                PhaseOutcome::Succeeded { transferred_bytes } => transferred_bytes.unwrap_or(0),
                PhaseOutcome::Failed { .. } => 0,
            };
            let next = self.next_automatic_phase(&saved, transferred);
            if let Err(e) = self.advance(saved, next).await {
                warn!("自动迁移中止: vm={}, next={}, error={}", vm_uuid, next, e);
                hub.close(vm_uuid).await;
            }
        }
        Ok(())
    }

    /// begin 之后同步；同步增量低于阈值或达到轮数上限后切换
    fn next_automatic_phase(&self, record: &MigrationRecord, transferred_bytes: u64) -> MigrationPhase {
        let config = &self.state.config().migration;
        match record.phase {
            MigrationPhase::Begin => MigrationPhase::Sync,
            _ if transferred_bytes < config.sync_threshold_bytes
                || record.sync_rounds >= config.max_auto_syncs =>
            {
                MigrationPhase::Switch
            }
            _ => MigrationPhase::Sync,
        }
    }

    /// 进入下一阶段并提交任务
    async fn advance(&self, record: MigrationRecord, phase: MigrationPhase) -> Result<MigrationOutcome> {
        let params = match phase {
            MigrationPhase::Sync => json!({
                "target_node_id": record.target_node_id,
                "target_vm_uuid": record.target_vm_uuid,
                "round": record.sync_rounds + 1,
            }),
            _ => json!({
                "target_node_id": record.target_node_id,
                "target_vm_uuid": record.target_vm_uuid,
                "target_alias": record.target_alias,
            }),
        };
        let request = JobRequest::new(
            JobKind::for_phase(phase),
            record.vm_uuid,
            record.source_node_id.clone(),
            params,
        );

        let expected = record.version;
        let mut next = record;
        progress::start_phase(&mut next, phase, request.uuid);
        let saved = self.state.store().save_migration(next, Some(expected)).await?;
        info!("迁移进入阶段: vm={}, phase={}", saved.vm_uuid, phase);

        self.submit_phase(saved, request).await
    }

    /// 提交阶段任务；提交失败时阶段以 failed 结束
    async fn submit_phase(&self, saved: MigrationRecord, request: JobRequest) -> Result<MigrationOutcome> {
        let vm_uuid = saved.vm_uuid;
        match self.state.jobs().submit(request).await {
            Ok(job_uuid) => {
                if let Some(entry) = saved.current_entry() {
                    self.state
                        .watch_hub()
                        .publish(vm_uuid, &WatchEvent::progress(entry))
                        .await;
                }
                Ok(MigrationOutcome {
                    job_uuid: Some(job_uuid),
                    migration: Some(saved),
                })
            }
            Err(e) => {
                warn!("迁移任务提交失败: vm={}, phase={}, error={}", vm_uuid, saved.phase, e);
                let expected = saved.version;
                let mut failed = saved;
                let outcome = PhaseOutcome::Failed {
                    message: format!("Failed to submit job: {}", e),
                };
                progress::finish_phase(&mut failed, &outcome);
                let (phase, state) = (failed.phase, failed.state);
                if let Err(save_err) = self.state.store().save_migration(failed, Some(expected)).await {
                    warn!("无法记录迁移失败: vm={}, error={}", vm_uuid, save_err);
                }
                self.state
                    .watch_hub()
                    .end_phase(vm_uuid, &WatchEvent::end(phase, state), false)
                    .await;
                Err(e)
            }
        }
    }

    /// 选择目标节点
    ///
    /// 指定节点时只检查该节点；否则排除源节点，按可用内存从多到少取第一个容量足够的节点。
    async fn select_target(
        &self,
        instance: &Instance,
        source_node_id: &str,
        requested: Option<&str>,
    ) -> Result<String> {
        if let Some(node_id) = requested {
            let capacity = self.state.capacity().query(node_id).await?;
            validate_migration_target(instance, &capacity)?;
            return Ok(node_id.to_string());
        }

        let mut candidates: Vec<NodeCapacity> = self
            .state
            .capacity()
            .list()
            .await
            .into_iter()
            .filter(|n| n.node_id != source_node_id)
            .collect();
        candidates.sort_by(|a, b| b.available_ram.cmp(&a.available_ram));

        let mut rejection = None;
        for candidate in &candidates {
            match validate_migration_target(instance, candidate) {
                Ok(()) => return Ok(candidate.node_id.clone()),
                Err(e) => {
                    debug!("节点容量不足: node={}, error={}", candidate.node_id, e);
                    rejection.get_or_insert(e);
                }
            }
        }

        Err(rejection.unwrap_or_else(|| {
            Error::precondition("No server available to receive the migration")
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::job_service::record_finished;
    use crate::services::testing::{bhyve_instance, test_env, test_env_with, TestEnv};
    use crate::config::Config;
    use crate::store::InstanceStore;
    use common::models::constants::{TAG_SMARTDC_ROLE, TAG_SMARTDC_TYPE};
    use std::sync::Arc;

    async fn env_with_vm() -> (TestEnv, MigrationService, Instance) {
        let env = test_env();
        env.add_node("cn-1", 65536, 1_000_000).await;
        env.add_node("cn-2", 65536, 1_000_000).await;
        let vm = bhyve_instance();
        env.add_instance(&vm).await;
        let svc = MigrationService::new(env.state.clone());
        (env, svc, vm)
    }

    async fn finish(
        env: &TestEnv,
        svc: &MigrationService,
        job_uuid: Uuid,
        execution: JobExecution,
        transferred_bytes: Option<u64>,
    ) {
        let notification = JobFinishedNotification {
            job_uuid,
            execution,
            chain_results: if execution == JobExecution::Succeeded {
                Vec::new()
            } else {
                vec![common::models::ChainResult {
                    name: "migrate".into(),
                    result: None,
                    error: Some("transfer interrupted".into()),
                    started_at: None,
                    finished_at: None,
                }]
            },
            transferred_bytes,
        };
        let job = record_finished(env.store.as_ref(), &notification)
            .await
            .unwrap()
            .unwrap();
        svc.handle_job_finished(&job, &notification).await.unwrap();
    }

    async fn record_of(env: &TestEnv, vm: &Instance) -> MigrationRecord {
        env.store.get_migration(vm.uuid).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_begin_creates_record_and_submits_job() {
        let (env, svc, vm) = env_with_vm().await;

        let outcome = svc.begin(vm.uuid, MigrateOptions::default()).await.unwrap();
        let record = outcome.migration.unwrap();
        assert_eq!(record.phase, MigrationPhase::Begin);
        assert_eq!(record.state, MigrationState::Running);
        assert_eq!(record.target_node_id, "cn-2");
        assert_eq!(record.progress_history.len(), 1);

        let job = env.jobs.last_submitted();
        assert_eq!(job.kind, JobKind::MigrateBegin);
        assert_eq!(job.node_id, "cn-1");
        assert_eq!(Some(job.uuid), outcome.job_uuid);
        assert_eq!(record.job_uuid, outcome.job_uuid);
    }

    #[tokio::test]
    async fn test_excluded_roles_always_rejected() {
        for (key, value) in [(TAG_SMARTDC_TYPE, "core"), (TAG_SMARTDC_ROLE, "nat")] {
            let (env, svc, mut vm) = env_with_vm().await;
            vm.tags.insert(key.to_string(), json!(value));
            vm.state = InstanceState::Provisioning;
            env.add_instance(&vm).await;

            for action in [MigrationAction::Begin, MigrationAction::Estimate, MigrationAction::Sync] {
                let err = svc
                    .migrate(vm.uuid, action, MigrateOptions::default())
                    .await
                    .unwrap_err();
                assert!(matches!(err, Error::PreconditionFailed(_)), "{:?}", err);
            }
            assert!(env.jobs.submitted().is_empty());
        }
    }

    #[tokio::test]
    async fn test_actions_without_record_are_not_found() {
        let (_env, svc, vm) = env_with_vm().await;
        for action in [
            MigrationAction::Sync,
            MigrationAction::Switch,
            MigrationAction::Pause,
            MigrationAction::Abort,
            MigrationAction::Finalize,
        ] {
            let err = svc
                .migrate(vm.uuid, action, MigrateOptions::default())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::NotFound(_)), "{:?}", action);
        }
    }

    #[tokio::test]
    async fn test_second_begin_rejected() {
        let (_env, svc, vm) = env_with_vm().await;
        svc.begin(vm.uuid, MigrateOptions::default()).await.unwrap();

        let err = svc.begin(vm.uuid, MigrateOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn test_concurrent_begins_single_winner() {
        let (env, _svc, vm) = env_with_vm().await;
        let svc = Arc::new(MigrationService::new(env.state.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let svc = svc.clone();
            let vm_uuid = vm.uuid;
            handles.push(tokio::spawn(async move {
                svc.begin(vm_uuid, MigrateOptions::default()).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(e) => assert!(matches!(e, Error::PreconditionFailed(_))),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(env.jobs.submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_begin_rejects_insufficient_capacity() {
        let env = test_env();
        env.add_node("cn-1", 65536, 1_000_000).await;
        env.add_node("cn-2", 1024, 1_000_000).await;
        let vm = bhyve_instance();
        env.add_instance(&vm).await;
        let svc = MigrationService::new(env.state.clone());

        let err = svc.begin(vm.uuid, MigrateOptions::default()).await.unwrap_err();
        assert_eq!(err.code(), "InsufficientCapacity");
        assert_eq!(
            err.to_string(),
            "Required additional RAM (2048) exceeds the server's available RAM (1024)"
        );
        assert!(env.store.get_migration(vm.uuid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_begin_requires_running_or_stopped() {
        let (env, svc, mut vm) = env_with_vm().await;
        vm.state = InstanceState::Provisioning;
        env.add_instance(&vm).await;

        let err = svc.begin(vm.uuid, MigrateOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn test_same_node_migration_gets_override_uuid() {
        let (_env, svc, vm) = env_with_vm().await;
        let options = MigrateOptions {
            target_node_id: Some("cn-1".into()),
            ..Default::default()
        };
        let record = svc.begin(vm.uuid, options).await.unwrap().migration.unwrap();
        let target_vm = record.target_vm_uuid.unwrap();
        assert_ne!(target_vm, vm.uuid);
    }

    #[tokio::test]
    async fn test_sync_is_repeatable() {
        let (env, svc, vm) = env_with_vm().await;
        let job = svc.begin(vm.uuid, MigrateOptions::default()).await.unwrap().job_uuid.unwrap();
        finish(&env, &svc, job, JobExecution::Succeeded, None).await;

        for round in 1..=3 {
            let job = svc.sync(vm.uuid).await.unwrap().job_uuid.unwrap();
            finish(&env, &svc, job, JobExecution::Succeeded, Some(4096)).await;
            let record = record_of(&env, &vm).await;
            assert_eq!(record.state, MigrationState::Successful);
            assert_eq!(record.sync_rounds, round);
        }
        // begin + 三轮 sync
        assert_eq!(record_of(&env, &vm).await.progress_history.len(), 4);
    }

    #[tokio::test]
    async fn test_switch_requires_sync() {
        let (env, svc, vm) = env_with_vm().await;
        let job = svc.begin(vm.uuid, MigrateOptions::default()).await.unwrap().job_uuid.unwrap();

        let err = svc.switch(vm.uuid).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed(_)));

        finish(&env, &svc, job, JobExecution::Succeeded, None).await;
        let err = svc.switch(vm.uuid).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn test_full_manual_migration() {
        let (env, svc, vm) = env_with_vm().await;
        let job = svc.begin(vm.uuid, MigrateOptions::default()).await.unwrap().job_uuid.unwrap();
        finish(&env, &svc, job, JobExecution::Succeeded, None).await;
        let job = svc.sync(vm.uuid).await.unwrap().job_uuid.unwrap();
        finish(&env, &svc, job, JobExecution::Succeeded, Some(1024)).await;
        let job = svc.switch(vm.uuid).await.unwrap().job_uuid.unwrap();
        finish(&env, &svc, job, JobExecution::Succeeded, None).await;

        let record = record_of(&env, &vm).await;
        assert!(record.is_terminal());
        assert!(record.source_inactive);
        let instance = env.store.get_instance(vm.uuid).await.unwrap().unwrap();
        assert_eq!(instance.node_id.as_deref(), Some("cn-2"));

        // 切换后不能再中止
        assert!(matches!(svc.abort(vm.uuid).await, Err(Error::PreconditionFailed(_))));

        let job = svc.finalize(vm.uuid).await.unwrap().job_uuid.unwrap();
        assert_eq!(env.jobs.last_submitted().kind, JobKind::MigrateFinalize);
        finish(&env, &svc, job, JobExecution::Succeeded, None).await;
        assert!(env.store.get_migration(vm.uuid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_begin_rejected_while_disk_job_pending() {
        let (env, svc, vm) = env_with_vm().await;
        let job_uuid = Uuid::new_v4();
        env.store.claim_mutation(vm.uuid, job_uuid).await.unwrap();

        let err = svc.begin(vm.uuid, MigrateOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed(_)));
        assert!(err.to_string().contains(&job_uuid.to_string()));
        assert!(env.store.get_migration(vm.uuid).await.unwrap().is_none());

        env.store.release_mutation(vm.uuid, job_uuid).await.unwrap();
        svc.begin(vm.uuid, MigrateOptions::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_switch_only_moves_node() {
        let (env, svc, vm) = env_with_vm().await;
        let job = svc.begin(vm.uuid, MigrateOptions::default()).await.unwrap().job_uuid.unwrap();
        finish(&env, &svc, job, JobExecution::Succeeded, None).await;
        let job = svc.sync(vm.uuid).await.unwrap().job_uuid.unwrap();
        finish(&env, &svc, job, JobExecution::Succeeded, Some(1024)).await;
        let job = svc.switch(vm.uuid).await.unwrap().job_uuid.unwrap();

        // 切换期间实例的其他字段被改写
        env.store
            .update_instance(
                vm.uuid,
                Box::new(|instance| {
                    instance.state = InstanceState::Stopped;
                    instance.alias = Some("web-1-renamed".into());
                    Ok(())
                }),
            )
            .await
            .unwrap();
        finish(&env, &svc, job, JobExecution::Succeeded, None).await;

        let instance = env.store.get_instance(vm.uuid).await.unwrap().unwrap();
        assert_eq!(instance.node_id.as_deref(), Some("cn-2"));
        assert_eq!(instance.state, InstanceState::Stopped);
        assert_eq!(instance.alias.as_deref(), Some("web-1-renamed"));
    }

    #[tokio::test]
    async fn test_switch_failure_needs_manual_intervention() {
        let (env, svc, vm) = env_with_vm().await;
        let job = svc.begin(vm.uuid, MigrateOptions::default()).await.unwrap().job_uuid.unwrap();
        finish(&env, &svc, job, JobExecution::Succeeded, None).await;
        let job = svc.sync(vm.uuid).await.unwrap().job_uuid.unwrap();
        finish(&env, &svc, job, JobExecution::Succeeded, Some(1024)).await;
        let job = svc.switch(vm.uuid).await.unwrap().job_uuid.unwrap();
        finish(&env, &svc, job, JobExecution::Failed, None).await;

        let record = record_of(&env, &vm).await;
        assert_eq!((record.phase, record.state), (MigrationPhase::Switch, MigrationState::Failed));
        assert!(record.error.as_deref().unwrap().contains("transfer interrupted"));
        assert!(record.error.as_deref().unwrap().contains("manual intervention"));
        assert!(!record.source_inactive);

        // 源实例仍在原节点
        let instance = env.store.get_instance(vm.uuid).await.unwrap().unwrap();
        assert_eq!(instance.node_id.as_deref(), Some("cn-1"));

        assert!(matches!(svc.pause(vm.uuid).await, Err(Error::PreconditionFailed(_))));
        assert!(matches!(svc.switch(vm.uuid).await, Err(Error::PreconditionFailed(_))));
        assert!(svc.abort(vm.uuid).await.is_ok());
    }

    #[tokio::test]
    async fn test_pause_signals_running_job() {
        let (env, svc, vm) = env_with_vm().await;
        let job = svc.begin(vm.uuid, MigrateOptions::default()).await.unwrap().job_uuid.unwrap();
        finish(&env, &svc, job, JobExecution::Succeeded, None).await;
        let sync_job = svc.sync(vm.uuid).await.unwrap().job_uuid.unwrap();

        let record = svc.pause(vm.uuid).await.unwrap().migration.unwrap();
        assert_eq!(record.state, MigrationState::Paused);
        assert_eq!(env.jobs.signals(), vec![(sync_job, JobSignal::Pause)]);

        let err = svc.pause(vm.uuid).await.unwrap_err();
        assert!(err.to_string().contains("already paused"));

        // 暂停后任务以 cancelled 结束，记录保持 paused
        finish(&env, &svc, sync_job, JobExecution::Cancelled, None).await;
        assert_eq!(record_of(&env, &vm).await.state, MigrationState::Paused);

        // 从 paused 继续同步
        svc.sync(vm.uuid).await.unwrap();
        assert_eq!(record_of(&env, &vm).await.state, MigrationState::Running);
    }

    #[tokio::test]
    async fn test_abort_removes_record_and_cleans_target() {
        let (env, svc, vm) = env_with_vm().await;
        let begin_job = svc.begin(vm.uuid, MigrateOptions::default()).await.unwrap().job_uuid.unwrap();

        let outcome = svc.abort(vm.uuid).await.unwrap();
        assert!(outcome.migration.is_none());
        assert_eq!(env.jobs.signals(), vec![(begin_job, JobSignal::Abort)]);

        let cleanup = env.jobs.last_submitted();
        assert_eq!(cleanup.kind, JobKind::MigrateAbort);
        assert_eq!(cleanup.node_id, "cn-2");
        assert!(env.store.get_migration(vm.uuid).await.unwrap().is_none());

        // 中止后的迟到结果被忽略，可以重新开始
        finish(&env, &svc, begin_job, JobExecution::Succeeded, None).await;
        assert!(env.store.get_migration(vm.uuid).await.unwrap().is_none());
        assert!(svc.begin(vm.uuid, MigrateOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_submit_failure_marks_phase_failed() {
        let (env, svc, vm) = env_with_vm().await;
        env.jobs.fail_submissions(true);

        assert!(svc.begin(vm.uuid, MigrateOptions::default()).await.is_err());
        let record = record_of(&env, &vm).await;
        assert_eq!(record.state, MigrationState::Failed);

        // begin 失败后只能中止
        assert!(matches!(svc.sync(vm.uuid).await, Err(Error::PreconditionFailed(_))));
        env.jobs.fail_submissions(false);
        svc.abort(vm.uuid).await.unwrap();
    }

    #[tokio::test]
    async fn test_estimate() {
        let (_env, svc, vm) = env_with_vm().await;
        let estimate = svc.estimate(vm.uuid).await.unwrap();
        assert_eq!(estimate.size, 10240 * 1024 * 1024);
        assert_eq!(estimate.transfer_rate, 100 * 1024 * 1024);
        assert_eq!(estimate.duration, 103);
    }

    #[tokio::test]
    async fn test_watch_live_tail_ends_with_phase() {
        let (env, svc, vm) = env_with_vm().await;
        let job = svc.begin(vm.uuid, MigrateOptions::default()).await.unwrap().job_uuid.unwrap();
        let mut rx = svc.watch(vm.uuid).await.unwrap();

        let stored = env.store.get_job(job).await.unwrap().unwrap();
        let update = JobProgressNotification {
            job_uuid: job,
            current_progress: 40,
            total_progress: 100,
            message: Some("cloning".into()),
            transfer_bytes_second: None,
            eta_ms: None,
        };
        svc.handle_job_progress(&stored, &update).await.unwrap();
        finish(&env, &svc, job, JobExecution::Succeeded, None).await;

        match rx.recv().await.unwrap() {
            WatchEvent::Progress { current_progress, state, .. } => {
                assert_eq!(current_progress, 40);
                assert_eq!(state, MigrationState::Running);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            rx.recv().await,
            Some(WatchEvent::Progress { state: MigrationState::Successful, .. })
        ));
        assert_eq!(
            rx.recv().await,
            Some(WatchEvent::end(MigrationPhase::Begin, MigrationState::Successful))
        );
        assert_eq!(rx.recv().await, None);

        let record = record_of(&env, &vm).await;
        assert_eq!(record.progress_history[0].current_progress, 100);
    }

    #[tokio::test]
    async fn test_watch_after_phase_end_emits_last_end() {
        let (env, svc, vm) = env_with_vm().await;
        let job = svc.begin(vm.uuid, MigrateOptions::default()).await.unwrap().job_uuid.unwrap();
        finish(&env, &svc, job, JobExecution::Failed, None).await;

        let mut rx = svc.watch(vm.uuid).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(WatchEvent::end(MigrationPhase::Begin, MigrationState::Failed))
        );
        assert_eq!(rx.recv().await, None);
        assert_eq!(env.state.watch_hub().subscriber_count(vm.uuid).await, 0);
    }

    #[tokio::test]
    async fn test_watch_without_migration_is_not_found() {
        let (env, svc, vm) = env_with_vm().await;
        assert!(matches!(svc.watch(vm.uuid).await, Err(Error::NotFound(_))));
        assert_eq!(env.state.watch_hub().subscriber_count(vm.uuid).await, 0);
    }

    #[tokio::test]
    async fn test_automatic_mode_chains_phases() {
        let mut config = Config::default();
        config.migration.sync_threshold_bytes = 1000;
        config.migration.max_auto_syncs = 5;
        let env = test_env_with(config);
        env.add_node("cn-1", 65536, 1_000_000).await;
        env.add_node("cn-2", 65536, 1_000_000).await;
        let vm = bhyve_instance();
        env.add_instance(&vm).await;
        let svc = MigrationService::new(env.state.clone());

        let options = MigrateOptions {
            automatic: true,
            ..Default::default()
        };
        let begin_job = svc.begin(vm.uuid, options).await.unwrap().job_uuid.unwrap();
        let mut rx = svc.watch(vm.uuid).await.unwrap();

        finish(&env, &svc, begin_job, JobExecution::Succeeded, None).await;
        let sync1 = env.jobs.last_submitted();
        assert_eq!(sync1.kind, JobKind::MigrateSync);

        // 增量仍高于阈值，继续同步
        finish(&env, &svc, sync1.uuid, JobExecution::Succeeded, Some(50_000)).await;
        let sync2 = env.jobs.last_submitted();
        assert_eq!(sync2.kind, JobKind::MigrateSync);
        assert_ne!(sync2.uuid, sync1.uuid);

        finish(&env, &svc, sync2.uuid, JobExecution::Succeeded, Some(10)).await;
        let switch = env.jobs.last_submitted();
        assert_eq!(switch.kind, JobKind::MigrateSwitch);

        finish(&env, &svc, switch.uuid, JobExecution::Succeeded, None).await;
        assert!(record_of(&env, &vm).await.is_terminal());

        // 流跨越所有阶段，在 switch 结束后关闭
        let mut ends = Vec::new();
        while let Some(event) = rx.recv().await {
            if let WatchEvent::End { phase, state } = event {
                ends.push((phase, state));
            }
        }
        assert_eq!(
            ends,
            vec![
                (MigrationPhase::Begin, MigrationState::Successful),
                (MigrationPhase::Sync, MigrationState::Successful),
                (MigrationPhase::Sync, MigrationState::Successful),
                (MigrationPhase::Switch, MigrationState::Successful),
            ]
        );
    }

    #[tokio::test]
    async fn test_automatic_mode_halts_on_failure() {
        let (env, svc, vm) = env_with_vm().await;
        let options = MigrateOptions {
            automatic: true,
            ..Default::default()
        };
        let begin_job = svc.begin(vm.uuid, options).await.unwrap().job_uuid.unwrap();
        finish(&env, &svc, begin_job, JobExecution::Succeeded, None).await;
        let sync = env.jobs.last_submitted();

        finish(&env, &svc, sync.uuid, JobExecution::Failed, None).await;
        let record = record_of(&env, &vm).await;
        assert_eq!((record.phase, record.state), (MigrationPhase::Sync, MigrationState::Failed));
        assert_eq!(env.jobs.submitted().len(), 2);
    }

    #[tokio::test]
    async fn test_automatic_mode_stops_at_max_rounds() {
        let mut config = Config::default();
        config.migration.sync_threshold_bytes = 10;
        config.migration.max_auto_syncs = 2;
        let env = test_env_with(config);
        env.add_node("cn-1", 65536, 1_000_000).await;
        env.add_node("cn-2", 65536, 1_000_000).await;
        let vm = bhyve_instance();
        env.add_instance(&vm).await;
        let svc = MigrationService::new(env.state.clone());

        let options = MigrateOptions {
            automatic: true,
            ..Default::default()
        };
        let job = svc.begin(vm.uuid, options).await.unwrap().job_uuid.unwrap();
        finish(&env, &svc, job, JobExecution::Succeeded, None).await;
        for _ in 0..2 {
            let sync = env.jobs.last_submitted();
            assert_eq!(sync.kind, JobKind::MigrateSync);
            finish(&env, &svc, sync.uuid, JobExecution::Succeeded, Some(1_000_000)).await;
        }
        assert_eq!(env.jobs.last_submitted().kind, JobKind::MigrateSwitch);
    }
}
