/// 工具函数集合

use uuid::Uuid;

/// 生成任务/实例 UUID
pub fn generate_uuid() -> Uuid {
    Uuid::new_v4()
}

/// 格式化字节大小
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// MiB 转字节
pub fn mib_to_bytes(mib: u64) -> u64 {
    mib.saturating_mul(1024 * 1024)
}

/// 按速率估算传输耗时（秒，向上取整）
pub fn estimate_duration_secs(bytes: u64, rate_bytes_per_sec: u64) -> u64 {
    if rate_bytes_per_sec == 0 {
        return 0;
    }
    bytes.div_ceil(rate_bytes_per_sec)
}
