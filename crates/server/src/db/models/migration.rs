/// 迁移记录数据模型
///
/// 完整记录（含进度历史）以 JSON 存储，phase/state/version 单独成列用于查询与比较并交换。

use chrono::Utc;
use common::models::MigrationRecord;
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "migrations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub vm_uuid: String,
    pub phase: String,
    pub state: String,
    pub automatic: bool,
    pub version: i64,
    pub record: JsonValue,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for MigrationRecord {
    type Error = common::Error;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        let mut record: MigrationRecord = serde_json::from_value(model.record)?;
        record.version = model.version.max(0) as u64;
        Ok(record)
    }
}

pub fn to_active_model(record: &MigrationRecord) -> Result<ActiveModel, common::Error> {
    Ok(ActiveModel {
        vm_uuid: Set(record.vm_uuid.to_string()),
        phase: Set(record.phase.as_str().to_string()),
        state: Set(record.state.as_str().to_string()),
        automatic: Set(record.automatic),
        version: Set(record.version as i64),
        record: Set(serde_json::to_value(record)?),
        updated_at: Set(Utc::now().into()),
    })
}
