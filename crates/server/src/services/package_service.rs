/// 套餐管理服务

use common::models::{Brand, Package};
use common::utils::generate_uuid;
use common::{FieldError, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use crate::app_state::AppState;

/// 创建套餐请求
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreatePackageDto {
    /// 不指定时自动生成
    pub uuid: Option<Uuid>,
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    /// 内存 (MiB)
    #[validate(range(min = 1))]
    pub ram: u64,
    #[serde(default)]
    pub quota: u64,
    #[validate(range(min = 1))]
    pub flexible_disk_size: Option<u64>,
    pub cpu_cap: Option<u32>,
    pub brand: Option<Brand>,
}

pub struct PackageService {
    state: AppState,
}

impl PackageService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub async fn create_package(&self, dto: CreatePackageDto) -> Result<Package> {
        let uuid = dto.uuid.unwrap_or_else(generate_uuid);
        if self.state.store().get_package(uuid).await?.is_some() {
            return Err(FieldError::duplicate("uuid", format!("Package {} already exists", uuid)).into());
        }

        let package = Package {
            uuid,
            name: dto.name,
            ram: dto.ram,
            quota: dto.quota,
            flexible_disk_size: dto.flexible_disk_size,
            cpu_cap: dto.cpu_cap,
            brand: dto.brand,
        };
        self.state.store().put_package(&package).await?;
        info!("套餐已创建: package={}, name={}, ram={}", package.uuid, package.name, package.ram);
        Ok(package)
    }

    pub async fn list_packages(&self) -> Result<Vec<Package>> {
        self.state.store().list_packages().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::test_env;
    use common::Error;

    fn dto(name: &str) -> CreatePackageDto {
        CreatePackageDto {
            uuid: None,
            name: name.into(),
            ram: 2048,
            quota: 0,
            flexible_disk_size: Some(20480),
            cpu_cap: Some(100),
            brand: Some(Brand::Bhyve),
        }
    }

    #[tokio::test]
    async fn test_create_and_list_packages() {
        let env = test_env();
        let svc = PackageService::new(env.state.clone());

        let large = svc.create_package(dto("large")).await.unwrap();
        svc.create_package(dto("small")).await.unwrap();

        let names: Vec<String> = svc.list_packages().await.unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["large", "small"]);

        let mut again = dto("large-copy");
        again.uuid = Some(large.uuid);
        let err = svc.create_package(again).await.unwrap_err();
        assert!(matches!(err, Error::ValidationFailed { .. }));
    }
}
