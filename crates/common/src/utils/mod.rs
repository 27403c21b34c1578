/// 工具函数集合

use uuid::Uuid;

/// 生成唯一 ID
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// MB 转换为字节
pub fn mb_to_bytes(mb: i64) -> i64 {
    mb * 1024 * 1024
}

/// 拆分完整主机名为 (主机部分, 域名)
pub fn split_hostname(fqdn: &str) -> (&str, Option<&str>) {
    match fqdn.split_once('.') {
        Some((host, domain)) => (host, Some(domain)),
        None => (fqdn, None),
    }
}
