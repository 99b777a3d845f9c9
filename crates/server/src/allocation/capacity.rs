/// 节点容量检查（规则 7）

use common::models::{Instance, NodeCapacity};
use common::{Error, Result};

use super::instance_committed_disk;

/// 追加的 RAM/磁盘不能超过节点剩余容量；RAM 先于磁盘检查
pub fn check_headroom(required_ram: i64, required_disk: i64, capacity: &NodeCapacity) -> Result<()> {
    if required_ram > 0 && required_ram > capacity.available_ram {
        return Err(Error::insufficient_capacity(
            "RAM",
            "ram",
            required_ram,
            capacity.available_ram,
        ));
    }
    if required_disk > 0 && required_disk > capacity.available_disk {
        return Err(Error::insufficient_capacity(
            "disk",
            "disk",
            required_disk,
            capacity.available_disk,
        ));
    }
    Ok(())
}

/// 迁移目标节点需要容纳实例已承诺的全部 RAM 与磁盘
pub fn validate_migration_target(instance: &Instance, capacity: &NodeCapacity) -> Result<()> {
    check_headroom(
        instance.ram as i64,
        instance_committed_disk(instance) as i64,
        capacity,
    )
}
