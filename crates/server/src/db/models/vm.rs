/// 虚拟机实例数据模型

use chrono::Utc;
use common::models::{Brand, Instance, InstanceState};
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::{db_err, parse_uuid};

/// 虚拟机模型
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "vms")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub alias: Option<String>,
    pub owner_uuid: String,
    pub brand: String,
    pub state: String,
    pub node_id: Option<String>,
    pub billing_id: String,

    // 规格 (MiB)
    pub ram: i64,
    pub cpu_cap: Option<i32>,
    pub quota: i64,
    pub flexible_disk_size: Option<i64>,

    // 磁盘与标签 (JSON)
    pub disks: JsonValue,
    pub tags: JsonValue,

    pub do_not_inventory: bool,

    // 时间戳
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for Instance {
    type Error = common::Error;

    fn try_from(vm: Model) -> Result<Self, Self::Error> {
        Ok(Instance {
            uuid: parse_uuid(&vm.id)?,
            alias: vm.alias,
            owner_uuid: parse_uuid(&vm.owner_uuid)?,
            brand: Brand::from(vm.brand),
            state: InstanceState::from(vm.state),
            node_id: vm.node_id,
            billing_id: parse_uuid(&vm.billing_id)?,
            ram: vm.ram.max(0) as u64,
            cpu_cap: vm.cpu_cap.map(|c| c.max(0) as u32),
            quota: vm.quota.max(0) as u64,
            flexible_disk_size: vm.flexible_disk_size.map(|s| s.max(0) as u64),
            disks: serde_json::from_value(vm.disks)?,
            tags: serde_json::from_value(vm.tags)?,
            do_not_inventory: vm.do_not_inventory,
            created_at: vm.created_at.with_timezone(&Utc),
            updated_at: vm.updated_at.with_timezone(&Utc),
        })
    }
}

/// 由领域对象构造完整的 ActiveModel
pub fn to_active_model(instance: &Instance) -> Result<ActiveModel, common::Error> {
    Ok(ActiveModel {
        id: Set(instance.uuid.to_string()),
        alias: Set(instance.alias.clone()),
        owner_uuid: Set(instance.owner_uuid.to_string()),
        brand: Set(instance.brand.as_str().to_string()),
        state: Set(instance.state.as_str().to_string()),
        node_id: Set(instance.node_id.clone()),
        billing_id: Set(instance.billing_id.to_string()),
        ram: Set(i64::try_from(instance.ram).map_err(|e| db_err(e.to_string()))?),
        cpu_cap: Set(instance.cpu_cap.map(|c| c as i32)),
        quota: Set(i64::try_from(instance.quota).map_err(|e| db_err(e.to_string()))?),
        flexible_disk_size: Set(instance.flexible_disk_size.map(|s| s as i64)),
        disks: Set(serde_json::to_value(&instance.disks)?),
        tags: Set(serde_json::to_value(&instance.tags)?),
        do_not_inventory: Set(instance.do_not_inventory),
        created_at: Set(instance.created_at.into()),
        updated_at: Set(instance.updated_at.into()),
    })
}
