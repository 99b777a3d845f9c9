/// 任务数据模型

use chrono::Utc;
use common::models::{Job, JobExecution};
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::parse_uuid;

/// 任务模型
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub job_type: String,   // provision, migrate_begin, resize_disk, ...
    pub execution: String,  // queued, running, succeeded, failed, cancelled

    // 关联信息
    pub vm_uuid: String,
    pub node_id: String,

    // 任务数据
    pub params: JsonValue,
    pub chain_results: JsonValue,

    // 时间戳
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for Job {
    type Error = common::Error;

    fn try_from(task: Model) -> Result<Self, Self::Error> {
        Ok(Job {
            uuid: parse_uuid(&task.id)?,
            kind: serde_json::from_value(JsonValue::String(task.job_type))?,
            vm_uuid: parse_uuid(&task.vm_uuid)?,
            node_id: task.node_id,
            params: task.params,
            execution: JobExecution::from(task.execution),
            chain_results: serde_json::from_value(task.chain_results)?,
            created_at: task.created_at.with_timezone(&Utc),
            updated_at: task.updated_at.with_timezone(&Utc),
        })
    }
}

pub fn to_active_model(job: &Job) -> Result<ActiveModel, common::Error> {
    Ok(ActiveModel {
        id: Set(job.uuid.to_string()),
        job_type: Set(job.kind.as_str().to_string()),
        execution: Set(job.execution.as_str().to_string()),
        vm_uuid: Set(job.vm_uuid.to_string()),
        node_id: Set(job.node_id.clone()),
        params: Set(job.params.clone()),
        chain_results: Set(serde_json::to_value(&job.chain_results)?),
        created_at: Set(job.created_at.into()),
        updated_at: Set(job.updated_at.into()),
    })
}
