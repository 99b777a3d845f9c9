/// 实例待完成变更登记
///
/// 每个实例至多一行，主键冲突即表示已有磁盘/套餐变更任务在执行。

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "pending_mutations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub vm_uuid: String,
    pub job_uuid: String,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
