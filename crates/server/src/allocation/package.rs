/// 套餐变更校验（规则 6、7）

use common::models::{Instance, NodeCapacity, Package};
use common::{FieldError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{check_headroom, committed_disk, instance_committed_disk, DiskBudget};

/// 校验通过的套餐变更，任务成功后写回实例
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizePlan {
    pub billing_id: Uuid,
    pub ram: u64,
    pub quota: u64,
    pub flexible_disk_size: Option<u64>,
    pub cpu_cap: Option<u32>,
    /// 相对当前配置的增量，可能为负
    pub additional_ram: i64,
    pub additional_disk: i64,
}

impl ResizePlan {
    pub fn apply_to(&self, instance: &mut Instance) {
        instance.billing_id = self.billing_id;
        instance.ram = self.ram;
        instance.quota = self.quota;
        instance.flexible_disk_size = self.flexible_disk_size;
        instance.cpu_cap = self.cpu_cap;
    }
}

/// 套餐变更
///
/// `capacity` 为实例当前所在节点的容量；为 None 时（实例未落到节点上）跳过规则 7。
pub fn validate_package_resize(
    instance: &Instance,
    target: &Package,
    capacity: Option<&NodeCapacity>,
) -> Result<ResizePlan> {
    if let Some(brand) = target.brand {
        if brand != instance.brand {
            return Err(FieldError::invalid(
                "billing_id",
                format!(
                    "Package brand {} does not match instance brand {}",
                    brand.as_str(),
                    instance.brand.as_str()
                ),
            )
            .into());
        }
    }

    if instance.brand.has_disks() {
        match (instance.flexible_disk_size, target.flexible_disk_size) {
            // flexible -> 非 flexible 为单向转换，不可回退
            (Some(_), None) if instance.brand.supports_flexible_disk() => {
                return Err(FieldError::invalid(
                    "billing_id",
                    "Cannot resize a flexible_disk_size instance to a package without flexible_disk_size",
                )
                .into());
            }
            (_, Some(size)) if !instance.brand.supports_flexible_disk() => {
                return Err(FieldError::invalid(
                    "billing_id",
                    format!(
                        "flexible_disk_size ({}) is not supported for brand {}",
                        size,
                        instance.brand.as_str()
                    ),
                )
                .into());
            }
            _ => {}
        }

        // 目标预算口径下的用量不得超过目标预算
        let budget = DiskBudget::of_package(target);
        let used = budget.used(&instance.disks);
        if used > budget.limit() {
            let message = match budget {
                DiskBudget::Flexible(size) => format!(
                    "Instance disk usage ({}) exceeds the package's flexible_disk_size ({})",
                    used, size
                ),
                DiskBudget::Quota(quota) => format!(
                    "Instance disk usage ({}) exceeds the package's quota ({})",
                    used, quota
                ),
            };
            return Err(FieldError::invalid("billing_id", message).into());
        }
    }

    let boot = instance.boot_disk().map(|d| d.size).unwrap_or(0);
    let additional_ram = target.ram as i64 - instance.ram as i64;
    let additional_disk = committed_disk(target.quota, target.flexible_disk_size, boot) as i64
        - instance_committed_disk(instance) as i64;

    if let Some(capacity) = capacity {
        check_headroom(additional_ram, additional_disk, capacity)?;
    }

    Ok(ResizePlan {
        billing_id: target.uuid,
        ram: target.ram,
        quota: target.quota,
        flexible_disk_size: target.flexible_disk_size,
        cpu_cap: target.cpu_cap,
        additional_ram,
        additional_disk,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::models::{Brand, Disk, InstanceState, PciSlot};
    use std::collections::BTreeMap;

    fn disk(size: u64, function: u8, boot: bool) -> Disk {
        Disk {
            uuid: Uuid::new_v4(),
            pci_slot: PciSlot { bus: 0, device: 4, function },
            size,
            image_uuid: boot.then(Uuid::new_v4),
            boot,
        }
    }

    fn vm(ram: u64, quota: u64, flexible_disk_size: Option<u64>, disks: Vec<Disk>) -> Instance {
        Instance {
            uuid: Uuid::new_v4(),
            alias: Some("web-1".into()),
            owner_uuid: Uuid::new_v4(),
            brand: Brand::Bhyve,
            state: InstanceState::Running,
            node_id: Some("cn-1".into()),
            billing_id: Uuid::new_v4(),
            ram,
            cpu_cap: None,
            quota,
            flexible_disk_size,
            disks,
            tags: BTreeMap::new(),
            do_not_inventory: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn package(ram: u64, quota: u64, flexible_disk_size: Option<u64>) -> Package {
        Package {
            uuid: Uuid::new_v4(),
            name: "pkg".into(),
            ram,
            quota,
            flexible_disk_size,
            cpu_cap: Some(100),
            brand: Some(Brand::Bhyve),
        }
    }

    fn node(ram: i64, disk: i64) -> NodeCapacity {
        NodeCapacity {
            node_id: "cn-1".into(),
            available_ram: ram,
            available_disk: disk,
            available_cpu: 400,
            reported_at: Utc::now(),
        }
    }

    #[test]
    fn test_convert_to_flexible_counts_boot_disk() {
        // quota 22528，计入配额的只有 data 盘；flexible 口径下总用量 30720
        let instance = vm(1024, 22528, None, vec![disk(10240, 0, true), disk(20480, 1, false)]);
        let target = package(1024, 0, Some(10240 + 10240 + 4096));

        let err = validate_package_resize(&instance, &target, None).unwrap_err();
        assert_eq!(err.code(), "ValidationFailed");
        assert!(err.to_string().contains("(30720)"));
        assert!(err.to_string().contains("(24576)"));
    }

    #[test]
    fn test_convert_to_flexible_within_budget() {
        let instance = vm(1024, 22528, None, vec![disk(10240, 0, true), disk(10240, 1, false)]);
        let target = package(1024, 0, Some(24576));

        let plan = validate_package_resize(&instance, &target, None).unwrap();
        assert_eq!(plan.flexible_disk_size, Some(24576));

        let mut resized = instance.clone();
        plan.apply_to(&mut resized);
        assert!(resized.is_flexible());
        assert_eq!(resized.billing_id, target.uuid);
    }

    #[test]
    fn test_flexible_back_to_quota_rejected() {
        let instance = vm(1024, 0, Some(20480), vec![disk(10240, 0, true)]);
        let err = validate_package_resize(&instance, &package(1024, 40960, None), None).unwrap_err();
        assert_eq!(err.field_errors()[0].field, "billing_id");
    }

    #[test]
    fn test_ram_resize_checks_node() {
        let instance = vm(1024, 0, Some(20480), vec![disk(10240, 0, true)]);
        let target = package(1024 + 896, 0, Some(20480));

        let err = validate_package_resize(&instance, &target, Some(&node(500, 100_000))).unwrap_err();
        assert_eq!(err.code(), "InsufficientCapacity");
        assert_eq!(
            err.to_string(),
            "Required additional RAM (896) exceeds the server's available RAM (500)"
        );

        let plan = validate_package_resize(&instance, &target, Some(&node(1024, 100_000))).unwrap();
        assert_eq!(plan.additional_ram, 896);
        assert_eq!(plan.additional_disk, 0);
    }

    #[test]
    fn test_downsize_needs_no_headroom() {
        let instance = vm(4096, 0, Some(20480), vec![disk(10240, 0, true)]);
        let plan = validate_package_resize(&instance, &package(2048, 0, Some(20480)), Some(&node(-100, -100)))
            .unwrap();
        assert_eq!(plan.additional_ram, -2048);
    }

    #[test]
    fn test_brand_mismatch_rejected() {
        let instance = vm(1024, 0, Some(20480), vec![disk(10240, 0, true)]);
        let mut target = package(1024, 0, Some(20480));
        target.brand = Some(Brand::Kvm);
        assert!(validate_package_resize(&instance, &target, None).is_err());
    }
}
