/// 内存存储
///
/// 未配置数据库时使用，也是单元测试的存储实现。

use async_trait::async_trait;
use common::models::{Instance, Job, MigrationRecord, Package};
use common::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{instance_not_found, migration_conflict, mutation_pending, InstanceStore, InstanceUpdate};

#[derive(Default)]
struct Tables {
    instances: HashMap<Uuid, Instance>,
    packages: HashMap<Uuid, Package>,
    migrations: HashMap<Uuid, MigrationRecord>,
    jobs: HashMap<Uuid, Job>,
    /// vm_uuid -> 未完成的变更任务
    mutations: HashMap<Uuid, Uuid>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn get_instance(&self, uuid: Uuid) -> Result<Option<Instance>> {
        let tables = self.tables.read().await;
        Ok(tables.instances.get(&uuid).cloned())
    }

    async fn put_instance(&self, instance: &Instance) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.instances.insert(instance.uuid, instance.clone());
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<Instance>> {
        let tables = self.tables.read().await;
        let mut instances: Vec<Instance> = tables.instances.values().cloned().collect();
        instances.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(instances)
    }

    async fn update_instance(&self, uuid: Uuid, update: InstanceUpdate) -> Result<Instance> {
        let mut tables = self.tables.write().await;
        let mut instance = tables
            .instances
            .get(&uuid)
            .cloned()
            .ok_or_else(|| instance_not_found(uuid))?;
        update(&mut instance)?;
        tables.instances.insert(uuid, instance.clone());
        Ok(instance)
    }

    async fn claim_mutation(&self, vm_uuid: Uuid, job_uuid: Uuid) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(pending) = tables.mutations.get(&vm_uuid) {
            return Err(mutation_pending(vm_uuid, *pending));
        }
        tables.mutations.insert(vm_uuid, job_uuid);
        Ok(())
    }

    async fn release_mutation(&self, vm_uuid: Uuid, job_uuid: Uuid) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.mutations.get(&vm_uuid) == Some(&job_uuid) {
            tables.mutations.remove(&vm_uuid);
        }
        Ok(())
    }

    async fn pending_mutation(&self, vm_uuid: Uuid) -> Result<Option<Uuid>> {
        let tables = self.tables.read().await;
        Ok(tables.mutations.get(&vm_uuid).copied())
    }

    async fn get_package(&self, uuid: Uuid) -> Result<Option<Package>> {
        let tables = self.tables.read().await;
        Ok(tables.packages.get(&uuid).cloned())
    }

    async fn put_package(&self, package: &Package) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.packages.insert(package.uuid, package.clone());
        Ok(())
    }

    async fn list_packages(&self) -> Result<Vec<Package>> {
        let tables = self.tables.read().await;
        let mut packages: Vec<Package> = tables.packages.values().cloned().collect();
        packages.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(packages)
    }

    async fn get_migration(&self, vm_uuid: Uuid) -> Result<Option<MigrationRecord>> {
        let tables = self.tables.read().await;
        Ok(tables.migrations.get(&vm_uuid).cloned())
    }

    async fn list_migrations(&self) -> Result<Vec<MigrationRecord>> {
        let tables = self.tables.read().await;
        let mut records: Vec<MigrationRecord> = tables.migrations.values().cloned().collect();
        records.sort_by(|a, b| b.created_timestamp.cmp(&a.created_timestamp));
        Ok(records)
    }

    async fn save_migration(
        &self,
        mut record: MigrationRecord,
        expected_version: Option<u64>,
    ) -> Result<MigrationRecord> {
        let mut tables = self.tables.write().await;
        let current = tables.migrations.get(&record.vm_uuid).map(|r| r.version);
        if current != expected_version {
            return Err(migration_conflict(record.vm_uuid));
        }

        record.version = expected_version.map(|v| v + 1).unwrap_or(1);
        tables.migrations.insert(record.vm_uuid, record.clone());
        Ok(record)
    }

    async fn delete_migration(&self, vm_uuid: Uuid, expected_version: u64) -> Result<()> {
        let mut tables = self.tables.write().await;
        match tables.migrations.get(&vm_uuid) {
            Some(record) if record.version == expected_version => {
                tables.migrations.remove(&vm_uuid);
                Ok(())
            }
            _ => Err(migration_conflict(vm_uuid)),
        }
    }

    async fn get_job(&self, uuid: Uuid) -> Result<Option<Job>> {
        let tables = self.tables.read().await;
        Ok(tables.jobs.get(&uuid).cloned())
    }

    async fn put_job(&self, job: &Job) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.jobs.insert(job.uuid, job.clone());
        Ok(())
    }
}
