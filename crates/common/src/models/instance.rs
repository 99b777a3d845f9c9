/// 实例、磁盘与套餐模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::constants::{TAG_SMARTDC_ROLE, TAG_SMARTDC_TYPE};

/// 实例生命周期状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Provisioning,
    Running,
    Stopping,
    Stopped,
    Failed,
    Destroyed,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Provisioning => "provisioning",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Failed => "failed",
            InstanceState::Destroyed => "destroyed",
        }
    }
}

impl From<String> for InstanceState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "provisioning" => InstanceState::Provisioning,
            "running" => InstanceState::Running,
            "stopping" => InstanceState::Stopping,
            "stopped" => InstanceState::Stopped,
            "destroyed" => InstanceState::Destroyed,
            _ => InstanceState::Failed,
        }
    }
}

/// 实例品牌（虚拟化类型）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Brand {
    Joyent,
    JoyentMinimal,
    Lx,
    Kvm,
    Bhyve,
}

impl Brand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Brand::Joyent => "joyent",
            Brand::JoyentMinimal => "joyent-minimal",
            Brand::Lx => "lx",
            Brand::Kvm => "kvm",
            Brand::Bhyve => "bhyve",
        }
    }

    /// 是否拥有独立磁盘列表
    pub fn has_disks(&self) -> bool {
        matches!(self, Brand::Kvm | Brand::Bhyve)
    }

    /// 是否依赖 flexible disk 模式
    pub fn supports_flexible_disk(&self) -> bool {
        matches!(self, Brand::Bhyve)
    }
}

impl From<String> for Brand {
    fn from(s: String) -> Self {
        match s.as_str() {
            "joyent-minimal" => Brand::JoyentMinimal,
            "lx" => Brand::Lx,
            "kvm" => Brand::Kvm,
            "bhyve" => Brand::Bhyve,
            _ => Brand::Joyent,
        }
    }
}

/// PCI 插槽 (bus:device:function)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PciSlot {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciSlot {
    /// 自动分配的起始插槽
    pub const BASE: PciSlot = PciSlot { bus: 0, device: 4, function: 0 };

    const MAX_DEVICE: u8 = 31;
    const MAX_FUNCTION: u8 = 7;

    /// 同一 bus 上的下一个插槽；超出 device 上限时返回 None
    pub fn next(self) -> Option<PciSlot> {
        if self.function < Self::MAX_FUNCTION {
            Some(PciSlot { function: self.function + 1, ..self })
        } else if self.device < Self::MAX_DEVICE {
            Some(PciSlot { device: self.device + 1, function: 0, ..self })
        } else {
            None
        }
    }
}

impl fmt::Display for PciSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.bus, self.device, self.function)
    }
}

impl FromStr for PciSlot {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(format!("invalid pci_slot \"{}\": expected bus:device:function", s));
        }

        let parse = |part: &str, max: u8, name: &str| -> Result<u8, String> {
            let value: u8 = part
                .parse()
                .map_err(|_| format!("invalid pci_slot \"{}\": bad {}", s, name))?;
            if value > max {
                return Err(format!("invalid pci_slot \"{}\": {} must be <= {}", s, name, max));
            }
            Ok(value)
        };

        Ok(PciSlot {
            bus: parse(parts[0], u8::MAX, "bus")?,
            device: parse(parts[1], Self::MAX_DEVICE, "device")?,
            function: parse(parts[2], Self::MAX_FUNCTION, "function")?,
        })
    }
}

impl TryFrom<String> for PciSlot {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PciSlot> for String {
    fn from(slot: PciSlot) -> Self {
        slot.to_string()
    }
}

/// 磁盘
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Disk {
    pub uuid: Uuid,
    pub pci_slot: PciSlot,
    /// 大小 (MiB)，已解析
    pub size: u64,
    /// 仅启动盘携带镜像
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_uuid: Option<Uuid>,
    #[serde(default)]
    pub boot: bool,
}

impl Disk {
    pub fn is_boot(&self) -> bool {
        self.boot || self.image_uuid.is_some()
    }
}

/// 套餐（计费规格）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Package {
    pub uuid: Uuid,
    pub name: String,
    /// 内存 (MiB)
    pub ram: u64,
    /// 非 flexible 模式的存储配额 (MiB)
    pub quota: u64,
    /// flexible 模式的总磁盘预算 (MiB)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flexible_disk_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cap: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<Brand>,
}

impl Package {
    pub fn is_flexible(&self) -> bool {
        self.flexible_disk_size.is_some()
    }
}

/// 实例
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub owner_uuid: Uuid,
    pub brand: Brand,
    pub state: InstanceState,
    /// 当前所在计算节点
    #[serde(default)]
    pub node_id: Option<String>,
    pub billing_id: Uuid,
    /// 内存 (MiB)
    pub ram: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cap: Option<u32>,
    /// 非 flexible 模式的存储配额 (MiB)
    pub quota: u64,
    /// flexible 模式的总磁盘预算 (MiB)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flexible_disk_size: Option<u64>,
    #[serde(default)]
    pub disks: Vec<Disk>,
    #[serde(default)]
    pub tags: BTreeMap<String, JsonValue>,
    /// 迁移切换后源实例被标记为不计入清单
    #[serde(default)]
    pub do_not_inventory: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    pub fn is_flexible(&self) -> bool {
        self.flexible_disk_size.is_some()
    }

    pub fn boot_disk(&self) -> Option<&Disk> {
        self.disks.iter().find(|d| d.is_boot())
    }

    pub fn disk(&self, uuid: &Uuid) -> Option<&Disk> {
        self.disks.iter().find(|d| &d.uuid == uuid)
    }

    /// 基础设施角色实例不允许迁移，返回拒绝原因
    pub fn migration_exclusion(&self) -> Option<&'static str> {
        let tag_is = |key: &str, value: &str| {
            self.tags
                .get(key)
                .and_then(|v| v.as_str())
                .map(|v| v == value)
                .unwrap_or(false)
        };

        if tag_is(TAG_SMARTDC_TYPE, "core") {
            Some("Cannot migrate a core instance")
        } else if tag_is(TAG_SMARTDC_ROLE, "nat") {
            Some("Cannot migrate a NAT instance")
        } else {
            None
        }
    }

    /// 磁盘总大小（flexible 模式计算口径，包含启动盘）
    pub fn total_disk_usage(&self) -> u64 {
        self.disks.iter().map(|d| d.size).sum()
    }
}
