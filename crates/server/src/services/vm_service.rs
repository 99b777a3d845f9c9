/// 虚拟机管理服务
///
/// 所有变更都先经过分配校验，再以任务形式交给计算节点执行；
/// 任务成功后由 `apply_finished_job` 把参数中携带的变更写回实例存储。

use chrono::Utc;
use common::models::{
    Brand, Disk, Instance, InstanceState, Job, JobExecution, JobKind, JobRequest,
};
use common::utils::generate_uuid;
use common::{Error, FieldError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;
use tracing::{error, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::allocation::{
    apply_create_disk, apply_delete_disk, apply_resize_disk, check_headroom, committed_disk,
    validate_create_disk, validate_delete_disk, validate_new_instance_disks,
    validate_package_resize, validate_resize_disk, CreateDiskRequest, DiskResize, NewDiskSpec,
    ResizeDiskRequest, ResizePlan,
};
use crate::app_state::AppState;
use crate::store::{require_instance, InstanceUpdate};

/// 创建实例请求
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateInstanceDto {
    /// 不指定时自动生成
    pub uuid: Option<Uuid>,
    #[validate(length(min = 1, max = 64))]
    pub alias: Option<String>,
    pub owner_uuid: Uuid,
    pub brand: Brand,
    pub billing_id: Uuid,
    #[validate(length(min = 1, max = 255))]
    pub node_id: String,
    #[serde(default)]
    pub disks: Vec<NewDiskSpec>,
    #[serde(default)]
    pub tags: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub do_not_inventory: bool,
}

/// 异步操作已受理
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobAccepted {
    pub vm_uuid: Uuid,
    pub job_uuid: Uuid,
}

pub struct VmService {
    state: AppState,
}

impl VmService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub async fn get_vm(&self, uuid: Uuid) -> Result<Instance> {
        require_instance(self.state.store(), uuid).await
    }

    pub async fn list_vms(&self, node_id: Option<&str>, state: Option<InstanceState>) -> Result<Vec<Instance>> {
        let mut instances = self.state.store().list_instances().await?;
        instances.retain(|i| {
            node_id.map_or(true, |n| i.node_id.as_deref() == Some(n))
                && state.map_or(true, |s| i.state == s)
        });
        instances.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(instances)
    }

    /// 创建虚拟机
    ///
    /// 校验磁盘布局与节点容量后以 provisioning 状态落库，并提交 provision 任务。
    pub async fn create_vm(&self, dto: CreateInstanceDto) -> Result<JobAccepted> {
        let package = self
            .state
            .store()
            .get_package(dto.billing_id)
            .await?
            .ok_or_else(|| FieldError::invalid("billing_id", format!("Package {} not found", dto.billing_id)))?;

        let disks = validate_new_instance_disks(dto.brand, &package, &dto.disks)?;

        let capacity = self.state.capacity().query(&dto.node_id).await?;
        let boot_size = disks.iter().find(|d| d.is_boot()).map(|d| d.size).unwrap_or(0);
        let required_disk = committed_disk(package.quota, package.flexible_disk_size, boot_size);
        check_headroom(package.ram as i64, required_disk as i64, &capacity)?;

        let uuid = dto.uuid.unwrap_or_else(generate_uuid);
        if self.state.store().get_instance(uuid).await?.is_some() {
            return Err(FieldError::duplicate("uuid", format!("VM {} already exists", uuid)).into());
        }

        let now = Utc::now();
        let instance = Instance {
            uuid,
            alias: dto.alias,
            owner_uuid: dto.owner_uuid,
            brand: dto.brand,
            state: InstanceState::Provisioning,
            node_id: Some(dto.node_id.clone()),
            billing_id: package.uuid,
            ram: package.ram,
            cpu_cap: package.cpu_cap,
            quota: package.quota,
            flexible_disk_size: package.flexible_disk_size,
            disks,
            tags: dto.tags,
            do_not_inventory: dto.do_not_inventory,
            created_at: now,
            updated_at: now,
        };
        self.state.store().put_instance(&instance).await?;
        info!("虚拟机已创建: vm={}, node={}, package={}", uuid, dto.node_id, package.name);

        let request = JobRequest::new(
            JobKind::Provision,
            uuid,
            dto.node_id,
            json!({ "instance": instance }),
        );
        match self.state.jobs().submit(request).await {
            Ok(job_uuid) => Ok(JobAccepted { vm_uuid: uuid, job_uuid }),
            Err(e) => {
                self.state
                    .store()
                    .update_instance(uuid, set_state(InstanceState::Failed))
                    .await?;
                Err(e)
            }
        }
    }

    pub async fn start_vm(&self, uuid: Uuid) -> Result<JobAccepted> {
        let instance = self.get_vm(uuid).await?;
        require_state(&instance, "start", &[InstanceState::Stopped])?;
        self.submit(&instance, JobKind::Start, json!({})).await
    }

    /// 停止虚拟机，提交后实例进入 stopping
    pub async fn stop_vm(&self, uuid: Uuid) -> Result<JobAccepted> {
        let instance = self.get_vm(uuid).await?;
        require_state(&instance, "stop", &[InstanceState::Running])?;
        let accepted = self.submit(&instance, JobKind::Stop, json!({})).await?;

        // 任务可能已先一步结束
        self.state
            .store()
            .update_instance(
                uuid,
                stamped(|instance| {
                    if instance.state == InstanceState::Running {
                        instance.state = InstanceState::Stopping;
                    }
                    Ok(())
                }),
            )
            .await?;
        Ok(accepted)
    }

    pub async fn reboot_vm(&self, uuid: Uuid) -> Result<JobAccepted> {
        let instance = self.get_vm(uuid).await?;
        require_state(&instance, "reboot", &[InstanceState::Running])?;
        self.submit(&instance, JobKind::Reboot, json!({})).await
    }

    /// 更换套餐
    pub async fn resize_vm(&self, uuid: Uuid, billing_id: Option<Uuid>) -> Result<JobAccepted> {
        let billing_id = billing_id.ok_or_else(|| FieldError::missing("billing_id"))?;
        let instance = self.get_vm(uuid).await?;
        self.ensure_not_migrating(&instance).await?;

        let package = self
            .state
            .store()
            .get_package(billing_id)
            .await?
            .ok_or_else(|| FieldError::invalid("billing_id", format!("Package {} not found", billing_id)))?;

        let capacity = match instance.node_id.as_deref() {
            Some(node_id) => Some(self.state.capacity().query(node_id).await?),
            None => None,
        };
        let plan = validate_package_resize(&instance, &package, capacity.as_ref())?;

        info!(
            "套餐变更通过校验: vm={}, package={}, additional_ram={}, additional_disk={}",
            uuid, package.name, plan.additional_ram, plan.additional_disk
        );
        self.submit_mutation(&instance, JobKind::Resize, json!({ "plan": plan })).await
    }

    pub async fn create_disk(&self, uuid: Uuid, request: CreateDiskRequest) -> Result<JobAccepted> {
        let instance = self.get_vm(uuid).await?;
        self.ensure_not_migrating(&instance).await?;

        let disk = validate_create_disk(&instance, &request)?;
        info!("添加磁盘: vm={}, disk={}, size={}, slot={}", uuid, disk.uuid, disk.size, disk.pci_slot);
        self.submit_mutation(&instance, JobKind::CreateDisk, json!({ "disk": disk })).await
    }

    pub async fn resize_disk(&self, uuid: Uuid, request: ResizeDiskRequest) -> Result<JobAccepted> {
        let instance = self.get_vm(uuid).await?;
        self.ensure_not_migrating(&instance).await?;

        let resize = validate_resize_disk(&instance, &request)?;
        if resize.new_size < resize.old_size {
            warn!("磁盘缩容: vm={}, disk={}, {} -> {}", uuid, resize.disk_uuid, resize.old_size, resize.new_size);
        }
        self.submit_mutation(&instance, JobKind::ResizeDisk, json!({ "resize": resize })).await
    }

    pub async fn delete_disk(&self, uuid: Uuid, disk_uuid: Option<Uuid>) -> Result<JobAccepted> {
        let instance = self.get_vm(uuid).await?;
        self.ensure_not_migrating(&instance).await?;

        let disk_uuid = validate_delete_disk(&instance, disk_uuid)?;
        self.submit_mutation(&instance, JobKind::DeleteDisk, json!({ "disk_uuid": disk_uuid })).await
    }

    /// 任务结束后更新实例
    ///
    /// 变更在存储内按实例当前状态重新校验后写入；磁盘/套餐任务结束即解除登记。
    pub async fn apply_finished_job(&self, job: &Job) -> Result<()> {
        let applied = self.apply_job_result(job).await;
        if job.kind.is_instance_mutation() {
            self.state.store().release_mutation(job.vm_uuid, job.uuid).await?;
        }

        match applied {
            Ok(Some(instance)) => {
                info!("实例已更新: vm={}, job={}, state={}", instance.uuid, job.uuid, instance.state.as_str());
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(Error::NotFound(_)) => {
                warn!("任务结束但实例已不存在: job={}, vm={}", job.uuid, job.vm_uuid);
                Ok(())
            }
            Err(e) => {
                error!(
                    "任务结果与实例当前配置冲突，未写入: job={}, kind={}, vm={}, error={}",
                    job.uuid,
                    job.kind.as_str(),
                    job.vm_uuid,
                    e
                );
                Err(e)
            }
        }
    }

    async fn apply_job_result(&self, job: &Job) -> Result<Option<Instance>> {
        let update = if job.execution != JobExecution::Succeeded {
            warn!(
                "任务未成功: job={}, kind={}, vm={}, error={}",
                job.uuid,
                job.kind.as_str(),
                job.vm_uuid,
                job.last_error().unwrap_or("unknown")
            );
            match job.kind {
                JobKind::Provision => set_state(InstanceState::Failed),
                // 停止失败，实例仍在运行
                JobKind::Stop => set_state(InstanceState::Running),
                _ => return Ok(None),
            }
        } else {
            match job.kind {
                JobKind::Provision | JobKind::Start | JobKind::Reboot => set_state(InstanceState::Running),
                JobKind::Stop => set_state(InstanceState::Stopped),
                JobKind::Resize => {
                    let plan: ResizePlan = job_param(job, "plan")?;
                    stamped(move |instance| {
                        plan.apply_to(instance);
                        Ok(())
                    })
                }
                JobKind::CreateDisk => {
                    let disk: Disk = job_param(job, "disk")?;
                    stamped(move |instance| apply_create_disk(instance, disk))
                }
                JobKind::ResizeDisk => {
                    let resize: DiskResize = job_param(job, "resize")?;
                    stamped(move |instance| apply_resize_disk(instance, &resize))
                }
                JobKind::DeleteDisk => {
                    let disk_uuid: Uuid = job_param(job, "disk_uuid")?;
                    stamped(move |instance| apply_delete_disk(instance, disk_uuid))
                }
                _ => return Ok(None),
            }
        };

        let instance = self.state.store().update_instance(job.vm_uuid, update).await?;
        Ok(Some(instance))
    }

    /// 迁移进行中不允许修改实例配置
    async fn ensure_not_migrating(&self, instance: &Instance) -> Result<()> {
        match self.state.store().get_migration(instance.uuid).await? {
            Some(record) if !record.is_terminal() => Err(Error::precondition(format!(
                "Cannot modify VM {} while a migration is in progress",
                instance.uuid
            ))),
            _ => Ok(()),
        }
    }

    async fn submit(&self, instance: &Instance, kind: JobKind, params: JsonValue) -> Result<JobAccepted> {
        let request = job_request(instance, kind, params)?;
        self.dispatch(request).await
    }

    /// 提交磁盘/套餐变更，同一实例已有未完成变更时拒绝
    async fn submit_mutation(&self, instance: &Instance, kind: JobKind, params: JsonValue) -> Result<JobAccepted> {
        let request = job_request(instance, kind, params)?;
        let (vm_uuid, job_uuid) = (request.vm_uuid, request.uuid);
        self.state.store().claim_mutation(vm_uuid, job_uuid).await?;

        match self.dispatch(request).await {
            Ok(accepted) => Ok(accepted),
            Err(e) => {
                if let Err(release_err) = self.state.store().release_mutation(vm_uuid, job_uuid).await {
                    warn!("解除变更登记失败: vm={}, job={}, error={}", vm_uuid, job_uuid, release_err);
                }
                Err(e)
            }
        }
    }

    async fn dispatch(&self, request: JobRequest) -> Result<JobAccepted> {
        let (vm_uuid, kind) = (request.vm_uuid, request.kind);
        let job_uuid = self.state.jobs().submit(request).await?;
        info!("虚拟机任务已提交: vm={}, kind={}, job={}", vm_uuid, kind.as_str(), job_uuid);
        Ok(JobAccepted { vm_uuid, job_uuid })
    }
}

fn job_request(instance: &Instance, kind: JobKind, params: JsonValue) -> Result<JobRequest> {
    let node_id = instance
        .node_id
        .clone()
        .ok_or_else(|| Error::precondition(format!("VM {} is not assigned to a server", instance.uuid)))?;
    Ok(JobRequest::new(kind, instance.uuid, node_id, params))
}

/// 附带更新时间戳的实例修改
fn stamped(update: impl FnOnce(&mut Instance) -> Result<()> + Send + 'static) -> InstanceUpdate {
    Box::new(move |instance| {
        update(instance)?;
        instance.updated_at = Utc::now();
        Ok(())
    })
}

fn set_state(state: InstanceState) -> InstanceUpdate {
    stamped(move |instance| {
        instance.state = state;
        Ok(())
    })
}

fn require_state(instance: &Instance, action: &str, allowed: &[InstanceState]) -> Result<()> {
    if allowed.contains(&instance.state) {
        return Ok(());
    }
    Err(Error::precondition(format!(
        "Cannot {} a VM in state {}",
        action,
        instance.state.as_str()
    )))
}

fn job_param<T: DeserializeOwned>(job: &Job, key: &str) -> Result<T> {
    let value = job
        .params
        .get(key)
        .cloned()
        .ok_or_else(|| Error::Internal(format!("Job {} is missing parameter {}", job.uuid, key)))?;
    Ok(serde_json::from_value(value)?)
}
