/// 磁盘与容量分配校验
///
/// 纯同步的判定函数：输入实例当前的磁盘/套餐配置、请求的变更以及（需要时）节点容量，
/// 输出解析后的变更（PCI 插槽、"remaining" 大小）或第一条违反的规则。
/// 规则按以下优先级检查：
/// 1. 大小为正整数
/// 2. uuid / pci_slot 不冲突
/// 3. 预算（非 flexible 不计启动盘，flexible 计全部磁盘）
/// 4. "remaining" 解析
/// 5. 缩容需要显式确认
/// 6. 套餐 flexible 模式转换
/// 7. 节点容量

pub mod capacity;
pub mod disks;
pub mod package;

pub use capacity::{check_headroom, validate_migration_target};
pub use disks::{
    apply_create_disk, apply_delete_disk, apply_resize_disk, validate_create_disk,
    validate_delete_disk, validate_new_instance_disks, validate_resize_disk, DiskResize,
};
pub use package::{validate_package_resize, ResizePlan};

use common::models::{Disk, Instance, Package, PciSlot};
use common::{Error, FieldError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// "remaining" 字面量
pub const REMAINING: &str = "remaining";

/// 请求中的磁盘大小：整数 (MiB) 或 "remaining"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DiskSize {
    Number(i64),
    Text(String),
}

/// 校验后的磁盘大小
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeSpec {
    Explicit(u64),
    Remaining,
}

impl DiskSize {
    /// 规则 1：显式大小必须为正整数
    pub fn parse(&self, field: &str) -> Result<SizeSpec> {
        let value = match self {
            DiskSize::Number(n) => *n,
            DiskSize::Text(text) if text == REMAINING => return Ok(SizeSpec::Remaining),
            DiskSize::Text(text) => text.trim().parse::<i64>().map_err(|_| {
                FieldError::invalid(field, format!("Invalid disk size \"{}\"", text))
            })?,
        };

        if value <= 0 {
            return Err(FieldError::invalid(field, "Disk size must be a positive integer").into());
        }
        Ok(SizeSpec::Explicit(value as u64))
    }
}

/// 添加磁盘请求
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CreateDiskRequest {
    pub size: Option<DiskSize>,
    pub pci_slot: Option<String>,
    pub disk_uuid: Option<Uuid>,
}

/// 调整磁盘大小请求
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ResizeDiskRequest {
    pub disk_uuid: Option<Uuid>,
    pub size: Option<DiskSize>,
    #[serde(default)]
    pub dangerous_allow_shrink: bool,
}

/// 创建实例时的磁盘定义
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NewDiskSpec {
    pub uuid: Option<Uuid>,
    pub size: Option<DiskSize>,
    pub pci_slot: Option<String>,
    pub image_uuid: Option<Uuid>,
}

/// 磁盘预算口径
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskBudget {
    /// 非 flexible：不含启动盘的磁盘总和不超过 quota
    Quota(u64),
    /// flexible：全部磁盘总和不超过 flexible_disk_size
    Flexible(u64),
}

impl DiskBudget {
    pub fn of_instance(instance: &Instance) -> Self {
        match instance.flexible_disk_size {
            Some(size) => DiskBudget::Flexible(size),
            None => DiskBudget::Quota(instance.quota),
        }
    }

    pub fn of_package(package: &Package) -> Self {
        match package.flexible_disk_size {
            Some(size) => DiskBudget::Flexible(size),
            None => DiskBudget::Quota(package.quota),
        }
    }

    pub fn limit(&self) -> u64 {
        match self {
            DiskBudget::Quota(limit) | DiskBudget::Flexible(limit) => *limit,
        }
    }

    /// 按口径计算已用空间
    pub fn used(&self, disks: &[Disk]) -> u64 {
        match self {
            DiskBudget::Quota(_) => disks.iter().filter(|d| !d.is_boot()).map(|d| d.size).sum(),
            DiskBudget::Flexible(_) => disks.iter().map(|d| d.size).sum(),
        }
    }

    /// 规则 3
    pub fn check(&self, field: &str, disks: &[Disk]) -> Result<()> {
        let used = self.used(disks);
        if used <= self.limit() {
            return Ok(());
        }

        let message = match self {
            DiskBudget::Quota(quota) => {
                format!("Disk usage ({}) exceeds the instance's quota ({})", used, quota)
            }
            DiskBudget::Flexible(size) => format!(
                "Disk usage ({}) exceeds the instance's flexible_disk_size ({})",
                used, size
            ),
        };
        Err(FieldError::invalid(field, message).into())
    }
}

/// 规则 4："remaining" 解析为 flexible_disk_size - quota - 其他磁盘之和
pub fn resolve_remaining(
    field: &str,
    quota: u64,
    flexible_disk_size: Option<u64>,
    other_disks: u64,
) -> Result<u64> {
    let Some(flexible_disk_size) = flexible_disk_size else {
        return Err(FieldError::invalid(
            field,
            "Disk size \"remaining\" requires a package with flexible_disk_size",
        )
        .into());
    };

    let remaining = flexible_disk_size as i64 - quota as i64 - other_disks as i64;
    if remaining <= 0 {
        return Err(FieldError::invalid(
            field,
            format!(
                "No space left for a \"remaining\" disk: flexible_disk_size ({}) minus quota ({}) and existing disks ({}) is {}",
                flexible_disk_size, quota, other_disks, remaining
            ),
        )
        .into());
    }
    Ok(remaining as u64)
}

/// 节点上实际占用的磁盘空间
///
/// flexible 模式为整个预算；非 flexible 模式为 quota 加启动盘。
pub fn committed_disk(quota: u64, flexible_disk_size: Option<u64>, boot_disk: u64) -> u64 {
    match flexible_disk_size {
        Some(size) => size,
        None => quota + boot_disk,
    }
}

pub fn instance_committed_disk(instance: &Instance) -> u64 {
    let boot = instance.boot_disk().map(|d| d.size).unwrap_or(0);
    committed_disk(instance.quota, instance.flexible_disk_size, boot)
}

/// 解析显式请求的 PCI 插槽
pub fn parse_pci_slot(field: &str, raw: &str) -> Result<PciSlot> {
    raw.parse::<PciSlot>()
        .map_err(|e| Error::from(FieldError::invalid(field, e)))
}

/// 从基准插槽开始按升序找第一个空闲插槽
pub fn next_free_slot(used: &BTreeSet<PciSlot>) -> Option<PciSlot> {
    let mut candidate = Some(PciSlot::BASE);
    while let Some(slot) = candidate {
        if !used.contains(&slot) {
            return Some(slot);
        }
        candidate = slot.next();
    }
    None
}
