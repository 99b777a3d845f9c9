/// SeaORM 实体定义

pub mod job;
pub mod migration;
pub mod package;
pub mod pending_mutation;
pub mod vm;

use common::Error;
use uuid::Uuid;

/// 数据库错误转换
pub(crate) fn db_err(e: impl ToString) -> Error {
    Error::Database(e.to_string())
}

/// 解析存储为字符串的 UUID 列
pub(crate) fn parse_uuid(value: &str) -> Result<Uuid, Error> {
    Uuid::parse_str(value).map_err(|e| db_err(format!("无效的 UUID \"{}\": {}", value, e)))
}
