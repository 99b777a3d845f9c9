/// 磁盘变更校验：添加、调整大小、删除以及创建实例时的磁盘布局

use common::models::{Brand, Disk, Instance, Package, PciSlot};
use common::{FieldError, FieldErrorCode, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use uuid::Uuid;

use super::{
    next_free_slot, parse_pci_slot, resolve_remaining, CreateDiskRequest, DiskBudget, NewDiskSpec,
    ResizeDiskRequest, SizeSpec,
};

const SHRINK_MESSAGE: &str =
    "Reducing disk size is a dangerous operation and requires dangerous_allow_shrink";

/// 校验通过的磁盘大小调整
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskResize {
    pub disk_uuid: Uuid,
    pub old_size: u64,
    pub new_size: u64,
}

fn no_free_slot(field: &str) -> FieldError {
    FieldError::invalid(field, "No free PCI slot available")
}

fn require_disks(instance: &Instance) -> Result<()> {
    if !instance.brand.has_disks() {
        return Err(FieldError::invalid(
            "brand",
            format!("Brand {} does not support disk operations", instance.brand.as_str()),
        )
        .into());
    }
    Ok(())
}

/// 添加磁盘
pub fn validate_create_disk(instance: &Instance, request: &CreateDiskRequest) -> Result<Disk> {
    require_disks(instance)?;

    // 1. 大小
    let size = request
        .size
        .as_ref()
        .ok_or_else(|| FieldError::missing("size"))?
        .parse("size")?;

    // 2. 唯一性
    let uuid = match request.disk_uuid {
        Some(uuid) if instance.disk(&uuid).is_some() => {
            return Err(FieldError::duplicate(
                "disk_uuid",
                format!("Disk uuid {} is already in use", uuid),
            )
            .into());
        }
        Some(uuid) => uuid,
        None => Uuid::new_v4(),
    };

    let used_slots: BTreeSet<PciSlot> = instance.disks.iter().map(|d| d.pci_slot).collect();
    let pci_slot = match request.pci_slot.as_deref() {
        Some(raw) => {
            let slot = parse_pci_slot("pci_slot", raw)?;
            if used_slots.contains(&slot) {
                return Err(FieldError::duplicate(
                    "pci_slot",
                    format!("PCI slot {} is already in use", slot),
                )
                .into());
            }
            slot
        }
        None => next_free_slot(&used_slots).ok_or_else(|| no_free_slot("pci_slot"))?,
    };

    // 3/4. 预算与 remaining
    let size = match size {
        SizeSpec::Explicit(size) => size,
        SizeSpec::Remaining => resolve_remaining(
            "size",
            instance.quota,
            instance.flexible_disk_size,
            instance.total_disk_usage(),
        )?,
    };

    let disk = Disk {
        uuid,
        pci_slot,
        size,
        image_uuid: None,
        boot: false,
    };

    let mut candidate = instance.disks.clone();
    candidate.push(disk.clone());
    DiskBudget::of_instance(instance).check("size", &candidate)?;

    Ok(disk)
}

/// 调整磁盘大小
///
/// 缩容确认先于预算检查：缩容只会减少用量。
pub fn validate_resize_disk(instance: &Instance, request: &ResizeDiskRequest) -> Result<DiskResize> {
    require_disks(instance)?;

    let new_size = match request
        .size
        .as_ref()
        .ok_or_else(|| FieldError::missing("size"))?
        .parse("size")?
    {
        SizeSpec::Explicit(size) => size,
        SizeSpec::Remaining => {
            return Err(FieldError::invalid(
                "size",
                "Disk size \"remaining\" is only valid when creating a disk",
            )
            .into());
        }
    };

    let disk_uuid = request.disk_uuid.ok_or_else(|| FieldError::missing("disk_uuid"))?;
    let disk = instance.disk(&disk_uuid).ok_or_else(|| {
        FieldError::invalid("disk_uuid", format!("Disk {} not found on VM {}", disk_uuid, instance.uuid))
    })?;

    if new_size < disk.size && !request.dangerous_allow_shrink {
        return Err(FieldError::invalid("size", SHRINK_MESSAGE).into());
    }

    let candidate: Vec<Disk> = instance
        .disks
        .iter()
        .map(|d| {
            if d.uuid == disk_uuid {
                Disk { size: new_size, ..d.clone() }
            } else {
                d.clone()
            }
        })
        .collect();
    DiskBudget::of_instance(instance).check("size", &candidate)?;

    Ok(DiskResize {
        disk_uuid,
        old_size: disk.size,
        new_size,
    })
}

/// 删除磁盘
pub fn validate_delete_disk(instance: &Instance, disk_uuid: Option<Uuid>) -> Result<Uuid> {
    require_disks(instance)?;

    let disk_uuid = disk_uuid.ok_or_else(|| FieldError::missing("disk_uuid"))?;
    let disk = instance.disk(&disk_uuid).ok_or_else(|| {
        FieldError::invalid("disk_uuid", format!("Disk {} not found on VM {}", disk_uuid, instance.uuid))
    })?;
    if disk.is_boot() {
        return Err(FieldError::invalid("disk_uuid", "Cannot delete the boot disk").into());
    }
    Ok(disk_uuid)
}

/// 写入已完成的添加磁盘任务
///
/// 按实例当前的磁盘集合重新检查唯一性与预算，失败时不修改实例。
pub fn apply_create_disk(instance: &mut Instance, disk: Disk) -> Result<()> {
    require_disks(instance)?;
    if instance.disk(&disk.uuid).is_some() {
        return Err(FieldError::duplicate(
            "disk_uuid",
            format!("Disk uuid {} is already in use", disk.uuid),
        )
        .into());
    }
    if instance.disks.iter().any(|d| d.pci_slot == disk.pci_slot) {
        return Err(FieldError::duplicate(
            "pci_slot",
            format!("PCI slot {} is already in use", disk.pci_slot),
        )
        .into());
    }

    let mut candidate = instance.disks.clone();
    candidate.push(disk);
    DiskBudget::of_instance(instance).check("size", &candidate)?;
    instance.disks = candidate;
    Ok(())
}

/// 写入已完成的磁盘大小调整
pub fn apply_resize_disk(instance: &mut Instance, resize: &DiskResize) -> Result<()> {
    require_disks(instance)?;
    if instance.disk(&resize.disk_uuid).is_none() {
        return Err(FieldError::invalid(
            "disk_uuid",
            format!("Disk {} not found on VM {}", resize.disk_uuid, instance.uuid),
        )
        .into());
    }

    let mut candidate = instance.disks.clone();
    for disk in candidate.iter_mut().filter(|d| d.uuid == resize.disk_uuid) {
        disk.size = resize.new_size;
    }
    DiskBudget::of_instance(instance).check("size", &candidate)?;
    instance.disks = candidate;
    Ok(())
}

/// 写入已完成的删除磁盘任务
pub fn apply_delete_disk(instance: &mut Instance, disk_uuid: Uuid) -> Result<()> {
    let disk_uuid = validate_delete_disk(instance, Some(disk_uuid))?;
    instance.disks.retain(|d| d.uuid != disk_uuid);
    Ok(())
}

/// 创建实例时的磁盘布局
///
/// 有镜像的磁盘即启动盘，必须恰好一个；至多一个 "remaining"；未指定的插槽按顺序分配。
pub fn validate_new_instance_disks(
    brand: Brand,
    package: &Package,
    disks: &[NewDiskSpec],
) -> Result<Vec<Disk>> {
    if !brand.has_disks() {
        if !disks.is_empty() {
            return Err(FieldError::invalid(
                "disks",
                format!("Brand {} does not support disks", brand.as_str()),
            )
            .into());
        }
        return Ok(Vec::new());
    }
    if disks.is_empty() {
        return Err(FieldError::missing("disks").into());
    }
    if package.is_flexible() && !brand.supports_flexible_disk() {
        return Err(FieldError::invalid(
            "billing_id",
            format!("flexible_disk_size is not supported for brand {}", brand.as_str()),
        )
        .into());
    }

    // 1. 大小
    let mut sizes = Vec::with_capacity(disks.len());
    for (i, spec) in disks.iter().enumerate() {
        let field = format!("disks.{}.size", i);
        let size = spec
            .size
            .as_ref()
            .ok_or_else(|| FieldError::missing(field.clone()))?
            .parse(&field)?;
        sizes.push(size);
    }

    // 启动盘
    let images: Vec<usize> = disks
        .iter()
        .enumerate()
        .filter(|(_, d)| d.image_uuid.is_some())
        .map(|(i, _)| i)
        .collect();
    match images.as_slice() {
        [] => return Err(FieldError::missing("disks.0.image_uuid").into()),
        [_] => {}
        [_, extra, ..] => {
            return Err(FieldError::invalid(
                format!("disks.{}.image_uuid", extra),
                "Only one disk may have an image_uuid",
            )
            .into());
        }
    }

    // 2. 唯一性：先占用显式插槽，再为其余磁盘按顺序分配
    let mut seen_uuids = HashSet::new();
    for (i, spec) in disks.iter().enumerate() {
        if let Some(uuid) = spec.uuid {
            if !seen_uuids.insert(uuid) {
                return Err(FieldError::duplicate(
                    format!("disks.{}.uuid", i),
                    format!("Disk uuid {} is already in use", uuid),
                )
                .into());
            }
        }
    }

    let mut used_slots = BTreeSet::new();
    let mut slots: Vec<Option<PciSlot>> = Vec::with_capacity(disks.len());
    for (i, spec) in disks.iter().enumerate() {
        let slot = match spec.pci_slot.as_deref() {
            Some(raw) => {
                let field = format!("disks.{}.pci_slot", i);
                let slot = parse_pci_slot(&field, raw)?;
                if !used_slots.insert(slot) {
                    return Err(FieldError::duplicate(
                        field,
                        format!("PCI slot {} is already in use", slot),
                    )
                    .into());
                }
                Some(slot)
            }
            None => None,
        };
        slots.push(slot);
    }
    for (i, slot) in slots.iter_mut().enumerate() {
        if slot.is_none() {
            let assigned = next_free_slot(&used_slots)
                .ok_or_else(|| no_free_slot(&format!("disks.{}.pci_slot", i)))?;
            used_slots.insert(assigned);
            *slot = Some(assigned);
        }
    }

    // 4. remaining
    let remaining: Vec<usize> = sizes
        .iter()
        .enumerate()
        .filter(|(_, s)| **s == SizeSpec::Remaining)
        .map(|(i, _)| i)
        .collect();
    if remaining.len() > 1 {
        return Err(FieldError::new(
            format!("disks.{}.size", remaining[1]),
            FieldErrorCode::Invalid,
            "Only one disk may have size \"remaining\"",
        )
        .into());
    }
    let explicit_total: u64 = sizes
        .iter()
        .filter_map(|s| match s {
            SizeSpec::Explicit(size) => Some(*size),
            SizeSpec::Remaining => None,
        })
        .sum();

    let mut resolved = Vec::with_capacity(disks.len());
    for (i, (spec, size)) in disks.iter().zip(sizes).enumerate() {
        let size = match size {
            SizeSpec::Explicit(size) => size,
            SizeSpec::Remaining => resolve_remaining(
                &format!("disks.{}.size", i),
                package.quota,
                package.flexible_disk_size,
                explicit_total,
            )?,
        };
        let pci_slot = slots[i].ok_or_else(|| no_free_slot(&format!("disks.{}.pci_slot", i)))?;
        resolved.push(Disk {
            uuid: spec.uuid.unwrap_or_else(Uuid::new_v4),
            pci_slot,
            size,
            image_uuid: spec.image_uuid,
            boot: spec.image_uuid.is_some(),
        });
    }

    // 3. 预算
    DiskBudget::of_package(package).check("disks", &resolved)?;

    Ok(resolved)
}
