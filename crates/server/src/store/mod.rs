/// 实例存储抽象
///
/// 实例、套餐、迁移记录与任务记录的唯一读写入口。
/// 迁移记录的每次写入都是基于 version 的比较并交换；
/// 实例的局部修改通过 `update_instance` 在存储内部原子完成。

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use common::models::{Instance, Job, MigrationRecord, Package};
use common::{Error, Result};
use uuid::Uuid;

/// 实例修改函数，返回错误时不写入
pub type InstanceUpdate = Box<dyn FnOnce(&mut Instance) -> Result<()> + Send>;

#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn get_instance(&self, uuid: Uuid) -> Result<Option<Instance>>;

    async fn put_instance(&self, instance: &Instance) -> Result<()>;

    async fn list_instances(&self) -> Result<Vec<Instance>>;

    /// 读取、修改并写回实例，期间不会被其他写入打断
    ///
    /// 实例不存在时返回 NotFound。
    async fn update_instance(&self, uuid: Uuid, update: InstanceUpdate) -> Result<Instance>;

    /// 登记实例的待完成变更任务（磁盘/套餐），已有登记时返回 PreconditionFailed
    async fn claim_mutation(&self, vm_uuid: Uuid, job_uuid: Uuid) -> Result<()>;

    /// 解除登记，仅当登记的任务与 `job_uuid` 一致时生效
    async fn release_mutation(&self, vm_uuid: Uuid, job_uuid: Uuid) -> Result<()>;

    async fn pending_mutation(&self, vm_uuid: Uuid) -> Result<Option<Uuid>>;

    async fn get_package(&self, uuid: Uuid) -> Result<Option<Package>>;

    async fn put_package(&self, package: &Package) -> Result<()>;

    async fn list_packages(&self) -> Result<Vec<Package>>;

    async fn get_migration(&self, vm_uuid: Uuid) -> Result<Option<MigrationRecord>>;

    async fn list_migrations(&self) -> Result<Vec<MigrationRecord>>;

    /// 比较并写入迁移记录
    ///
    /// `expected_version` 为 None 时仅在记录不存在时插入；
    /// 为 Some(v) 时要求当前版本等于 v。成功后返回版本号已递增的记录。
    async fn save_migration(
        &self,
        record: MigrationRecord,
        expected_version: Option<u64>,
    ) -> Result<MigrationRecord>;

    /// 按版本删除迁移记录
    async fn delete_migration(&self, vm_uuid: Uuid, expected_version: u64) -> Result<()>;

    async fn get_job(&self, uuid: Uuid) -> Result<Option<Job>>;

    async fn put_job(&self, job: &Job) -> Result<()>;
}

/// 并发写入冲突
pub fn migration_conflict(vm_uuid: Uuid) -> Error {
    Error::precondition(format!(
        "Migration record for instance {} was modified concurrently",
        vm_uuid
    ))
}

/// 已有未完成的变更任务
pub fn mutation_pending(vm_uuid: Uuid, job_uuid: Uuid) -> Error {
    Error::precondition(format!(
        "VM {} has a pending disk or resize job {}",
        vm_uuid, job_uuid
    ))
}

pub(crate) fn instance_not_found(uuid: Uuid) -> Error {
    Error::not_found(format!("VM {} not found", uuid))
}

/// 读取实例，不存在时返回 NotFound
pub async fn require_instance(store: &dyn InstanceStore, uuid: Uuid) -> Result<Instance> {
    store
        .get_instance(uuid)
        .await?
        .ok_or_else(|| instance_not_found(uuid))
}
