/// 数据库访问层

pub mod models;

use async_trait::async_trait;
use chrono::Utc;
use common::models::{Instance, Job, MigrationRecord, Package};
use common::Result;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, ConnectionTrait, Database, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Schema, Set, TransactionTrait,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::{
    instance_not_found, migration_conflict, mutation_pending, InstanceStore, InstanceUpdate,
};
use models::{db_err, parse_uuid};
use models::job::{Column as JobColumn, Entity as JobEntity};
use models::migration::{Column as MigrationColumn, Entity as MigrationEntity};
use models::package::{Column as PackageColumn, Entity as PackageEntity};
use models::pending_mutation::{Column as PendingMutationColumn, Entity as PendingMutationEntity};
use models::vm::{Column as VmColumn, Entity as VmEntity};

/// 建立数据库连接 (SeaORM)
pub async fn establish_connection(database_url: &str) -> anyhow::Result<DatabaseConnection> {
    info!("正在连接数据库");

    let db = Database::connect(database_url).await?;
    info!("数据库连接成功");

    Ok(db)
}

/// 按实体定义建表（已存在则跳过）
pub async fn ensure_schema(db: &DatabaseConnection) -> anyhow::Result<()> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    let mut tables = vec![
        schema.create_table_from_entity(VmEntity),
        schema.create_table_from_entity(PackageEntity),
        schema.create_table_from_entity(MigrationEntity),
        schema.create_table_from_entity(JobEntity),
        schema.create_table_from_entity(PendingMutationEntity),
    ];
    for table in tables.iter_mut() {
        db.execute(backend.build(table.if_not_exists())).await?;
    }

    info!("数据库表结构已就绪");
    Ok(())
}

/// 基于 SeaORM 的持久化存储
#[derive(Clone)]
pub struct SeaOrmStore {
    db: DatabaseConnection,
}

impl SeaOrmStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl InstanceStore for SeaOrmStore {
    async fn get_instance(&self, uuid: Uuid) -> Result<Option<Instance>> {
        VmEntity::find_by_id(uuid.to_string())
            .one(&self.db)
            .await
            .map_err(db_err)?
            .map(Instance::try_from)
            .transpose()
    }

    async fn put_instance(&self, instance: &Instance) -> Result<()> {
        let vm = models::vm::to_active_model(instance)?;
        VmEntity::insert(vm)
            .on_conflict(
                OnConflict::column(VmColumn::Id)
                    .update_columns([
                        VmColumn::Alias,
                        VmColumn::Brand,
                        VmColumn::State,
                        VmColumn::NodeId,
                        VmColumn::BillingId,
                        VmColumn::Ram,
                        VmColumn::CpuCap,
                        VmColumn::Quota,
                        VmColumn::FlexibleDiskSize,
                        VmColumn::Disks,
                        VmColumn::Tags,
                        VmColumn::DoNotInventory,
                        VmColumn::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<Instance>> {
        VmEntity::find()
            .order_by_desc(VmColumn::CreatedAt)
            .all(&self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(Instance::try_from)
            .collect()
    }

    /// 在事务中以行锁读取实例，修改后写回
    async fn update_instance(&self, uuid: Uuid, update: InstanceUpdate) -> Result<Instance> {
        let txn = self.db.begin().await.map_err(db_err)?;
        let model = VmEntity::find_by_id(uuid.to_string())
            .lock_exclusive()
            .one(&txn)
            .await
            .map_err(db_err)?
            .ok_or_else(|| instance_not_found(uuid))?;

        let mut instance = Instance::try_from(model)?;
        // 返回错误时事务随 txn 丢弃而回滚
        update(&mut instance)?;

        VmEntity::update_many()
            .set(models::vm::to_active_model(&instance)?)
            .filter(VmColumn::Id.eq(uuid.to_string()))
            .exec(&txn)
            .await
            .map_err(db_err)?;
        txn.commit().await.map_err(db_err)?;
        Ok(instance)
    }

    async fn claim_mutation(&self, vm_uuid: Uuid, job_uuid: Uuid) -> Result<()> {
        let active = models::pending_mutation::ActiveModel {
            vm_uuid: Set(vm_uuid.to_string()),
            job_uuid: Set(job_uuid.to_string()),
            created_at: Set(Utc::now().into()),
        };
        let inserted = PendingMutationEntity::insert(active)
            .on_conflict(
                OnConflict::column(PendingMutationColumn::VmUuid)
                    .do_nothing()
                    .to_owned(),
            )
            .exec(&self.db)
            .await;
        match inserted {
            Ok(_) => Ok(()),
            Err(DbErr::RecordNotInserted) => {
                let pending = self.pending_mutation(vm_uuid).await?.unwrap_or(job_uuid);
                Err(mutation_pending(vm_uuid, pending))
            }
            Err(e) => Err(db_err(e)),
        }
    }

    async fn release_mutation(&self, vm_uuid: Uuid, job_uuid: Uuid) -> Result<()> {
        PendingMutationEntity::delete_many()
            .filter(PendingMutationColumn::VmUuid.eq(vm_uuid.to_string()))
            .filter(PendingMutationColumn::JobUuid.eq(job_uuid.to_string()))
            .exec(&self.db)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn pending_mutation(&self, vm_uuid: Uuid) -> Result<Option<Uuid>> {
        PendingMutationEntity::find_by_id(vm_uuid.to_string())
            .one(&self.db)
            .await
            .map_err(db_err)?
            .map(|m| parse_uuid(&m.job_uuid))
            .transpose()
    }

    async fn get_package(&self, uuid: Uuid) -> Result<Option<Package>> {
        PackageEntity::find_by_id(uuid.to_string())
            .one(&self.db)
            .await
            .map_err(db_err)?
            .map(Package::try_from)
            .transpose()
    }

    async fn put_package(&self, package: &Package) -> Result<()> {
        PackageEntity::insert(models::package::to_active_model(package))
            .on_conflict(
                OnConflict::column(PackageColumn::Id)
                    .update_columns([
                        PackageColumn::Name,
                        PackageColumn::Ram,
                        PackageColumn::Quota,
                        PackageColumn::FlexibleDiskSize,
                        PackageColumn::CpuCap,
                        PackageColumn::Brand,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list_packages(&self) -> Result<Vec<Package>> {
        PackageEntity::find()
            .order_by_asc(PackageColumn::Name)
            .all(&self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(Package::try_from)
            .collect()
    }

    async fn get_migration(&self, vm_uuid: Uuid) -> Result<Option<MigrationRecord>> {
        MigrationEntity::find_by_id(vm_uuid.to_string())
            .one(&self.db)
            .await
            .map_err(db_err)?
            .map(MigrationRecord::try_from)
            .transpose()
    }

    async fn list_migrations(&self) -> Result<Vec<MigrationRecord>> {
        MigrationEntity::find()
            .order_by_desc(MigrationColumn::UpdatedAt)
            .all(&self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(MigrationRecord::try_from)
            .collect()
    }

    async fn save_migration(
        &self,
        mut record: MigrationRecord,
        expected_version: Option<u64>,
    ) -> Result<MigrationRecord> {
        record.version = expected_version.map(|v| v + 1).unwrap_or(1);
        let active = models::migration::to_active_model(&record)?;

        match expected_version {
            // 创建：主键冲突即表示已存在迁移记录
            None => {
                let inserted = MigrationEntity::insert(active)
                    .on_conflict(
                        OnConflict::column(MigrationColumn::VmUuid)
                            .do_nothing()
                            .to_owned(),
                    )
                    .exec(&self.db)
                    .await;
                match inserted {
                    Ok(_) => {}
                    Err(DbErr::RecordNotInserted) => return Err(migration_conflict(record.vm_uuid)),
                    Err(e) => return Err(db_err(e)),
                }
            }
            // 更新：仅当版本号未变化时写入
            Some(expected) => {
                let result = MigrationEntity::update_many()
                    .set(active)
                    .filter(MigrationColumn::VmUuid.eq(record.vm_uuid.to_string()))
                    .filter(MigrationColumn::Version.eq(expected as i64))
                    .exec(&self.db)
                    .await
                    .map_err(db_err)?;
                if result.rows_affected == 0 {
                    return Err(migration_conflict(record.vm_uuid));
                }
            }
        }

        debug!(
            "迁移记录已保存: vm={}, phase={}, state={}, version={}",
            record.vm_uuid, record.phase, record.state, record.version
        );
        Ok(record)
    }

    async fn delete_migration(&self, vm_uuid: Uuid, expected_version: u64) -> Result<()> {
        let result = MigrationEntity::delete_many()
            .filter(MigrationColumn::VmUuid.eq(vm_uuid.to_string()))
            .filter(MigrationColumn::Version.eq(expected_version as i64))
            .exec(&self.db)
            .await
            .map_err(db_err)?;
        if result.rows_affected == 0 {
            return Err(migration_conflict(vm_uuid));
        }
        Ok(())
    }

    async fn get_job(&self, uuid: Uuid) -> Result<Option<Job>> {
        JobEntity::find_by_id(uuid.to_string())
            .one(&self.db)
            .await
            .map_err(db_err)?
            .map(Job::try_from)
            .transpose()
    }

    async fn put_job(&self, job: &Job) -> Result<()> {
        JobEntity::insert(models::job::to_active_model(job)?)
            .on_conflict(
                OnConflict::column(JobColumn::Id)
                    .update_columns([
                        JobColumn::Execution,
                        JobColumn::Params,
                        JobColumn::ChainResults,
                        JobColumn::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
