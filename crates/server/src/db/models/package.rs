/// 套餐数据模型

use common::models::{Brand, Package};
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};

use super::parse_uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "packages")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub name: String,
    pub ram: i64,
    pub quota: i64,
    pub flexible_disk_size: Option<i64>,
    pub cpu_cap: Option<i32>,
    pub brand: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for Package {
    type Error = common::Error;

    fn try_from(pkg: Model) -> Result<Self, Self::Error> {
        Ok(Package {
            uuid: parse_uuid(&pkg.id)?,
            name: pkg.name,
            ram: pkg.ram.max(0) as u64,
            quota: pkg.quota.max(0) as u64,
            flexible_disk_size: pkg.flexible_disk_size.map(|s| s.max(0) as u64),
            cpu_cap: pkg.cpu_cap.map(|c| c.max(0) as u32),
            brand: pkg.brand.map(Brand::from),
        })
    }
}

pub fn to_active_model(package: &Package) -> ActiveModel {
    ActiveModel {
        id: Set(package.uuid.to_string()),
        name: Set(package.name.clone()),
        ram: Set(package.ram as i64),
        quota: Set(package.quota as i64),
        flexible_disk_size: Set(package.flexible_disk_size.map(|s| s as i64)),
        cpu_cap: Set(package.cpu_cap.map(|c| c as i32)),
        brand: Set(package.brand.map(|b| b.as_str().to_string())),
    }
}
