/// 共享数据模型
///
/// 宿主机、模板与虚拟机记录。记录由数据存储持有，核心逻辑只在单次操作内持有副本。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::ipam;

/// 占位外部引用前缀
///
/// 本地记录在任何远程调用之前以该前缀的引用落库，表示"尚未在远端创建"。
pub const PLACEHOLDER_REF_PREFIX: &str = "TEMPREF";

/// 虚拟机状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Provisioning,
    Running,
    Starting,
    Stopping,
    Rebooting,
    Terminating,
    Stopped,
    Error,
}

impl VmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmStatus::Provisioning => "provisioning",
            VmStatus::Running => "running",
            VmStatus::Starting => "starting",
            VmStatus::Stopping => "stopping",
            VmStatus::Rebooting => "rebooting",
            VmStatus::Terminating => "terminating",
            VmStatus::Stopped => "stopped",
            VmStatus::Error => "error",
        }
    }
}

impl From<String> for VmStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "provisioning" => VmStatus::Provisioning,
            "running" => VmStatus::Running,
            "starting" => VmStatus::Starting,
            "stopping" => VmStatus::Stopping,
            "rebooting" => VmStatus::Rebooting,
            "terminating" => VmStatus::Terminating,
            "stopped" => VmStatus::Stopped,
            _ => VmStatus::Error,
        }
    }
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 宿主机记录
///
/// 内存单位为 MB，`cpu_utilization` 为百分比。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostRecord {
    pub id: String,
    pub hostname: String,
    pub zone: Option<String>,
    pub total_memory: i64,
    pub free_memory: i64,
    pub total_cores: i32,
    pub cpu_utilization: f64,
    pub subnet: String,
    pub version: i64,
    pub last_refreshed: Option<DateTime<Utc>>,
}

impl HostRecord {
    pub fn new(
        hostname: impl Into<String>,
        zone: Option<String>,
        total_memory: i64,
        total_cores: i32,
        subnet: impl Into<String>,
    ) -> Result<Self> {
        let hostname = hostname.into();
        let subnet = subnet.into();

        if hostname.trim().is_empty() {
            return Err(Error::InvalidArgument("宿主机名不能为空".to_string()));
        }
        if total_memory < 0 || total_cores < 0 {
            return Err(Error::InvalidArgument(format!(
                "宿主机 {} 的资源数值不能为负",
                hostname
            )));
        }
        ipam::parse_subnet(&subnet)?;

        Ok(Self {
            id: crate::utils::generate_id(),
            hostname,
            zone,
            total_memory,
            free_memory: total_memory,
            total_cores,
            cpu_utilization: 0.0,
            subnet,
            version: 0,
            last_refreshed: None,
        })
    }
}

/// 虚拟机模板
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemplateRecord {
    pub id: String,
    pub name: String,
    pub memory: i64,
    pub cores: i32,
    /// 安装引导（preseed）内容
    pub preseed: String,
    /// 引导 ISO 所在存储库名称，缺省时使用宿主机上的第一个 ISO 库
    pub iso_sr: Option<String>,
}

impl TemplateRecord {
    pub fn new(
        name: impl Into<String>,
        memory: i64,
        cores: i32,
        preseed: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        if memory <= 0 || cores <= 0 {
            return Err(Error::InvalidArgument(format!(
                "模板 {} 的内存和核数必须大于 0",
                name
            )));
        }

        Ok(Self {
            id: crate::utils::generate_id(),
            name,
            memory,
            cores,
            preseed: preseed.into(),
            iso_sr: None,
        })
    }
}

/// 虚拟机记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmRecord {
    pub id: String,
    pub name: String,
    pub status: VmStatus,
    /// hypervisor 侧对象引用，空串或占位值表示尚未在远端创建
    pub external_reference: String,
    pub host_id: String,
    pub template_id: Option<String>,
    pub memory: i64,
    pub cores: i32,
    pub ip: Option<String>,
    pub last_error: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VmRecord {
    /// 创建处于 Provisioning 状态、带占位引用的记录
    pub fn new_provisioning(
        name: impl Into<String>,
        host_id: impl Into<String>,
        template: &TemplateRecord,
        ip: Option<String>,
    ) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidArgument("虚拟机名称不能为空".to_string()));
        }

        let now = Utc::now();
        Ok(Self {
            id: crate::utils::generate_id(),
            name,
            status: VmStatus::Provisioning,
            external_reference: placeholder_reference(),
            host_id: host_id.into(),
            template_id: Some(template.id.clone()),
            memory: template.memory,
            cores: template.cores,
            ip,
            last_error: None,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// 接管远端已存在、本地没有记录的虚拟机
    pub fn adopted(
        name: impl Into<String>,
        host_id: impl Into<String>,
        external_reference: impl Into<String>,
        status: VmStatus,
        memory: i64,
        cores: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: crate::utils::generate_id(),
            name: name.into(),
            status,
            external_reference: external_reference.into(),
            host_id: host_id.into(),
            template_id: None,
            memory,
            cores,
            ip: None,
            last_error: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// 是否已拿到真实的远端引用
    pub fn has_remote_object(&self) -> bool {
        is_real_reference(&self.external_reference)
    }
}

/// 虚拟机性能指标序列，每个指标名一条，刷新时整体替换
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmMetricSeries {
    pub vm_id: String,
    pub key: String,
    /// Unix 秒
    pub timestamps: Vec<i64>,
    pub values: Vec<f64>,
    pub updated_at: DateTime<Utc>,
}

impl VmMetricSeries {
    pub fn new(vm_id: impl Into<String>, key: impl Into<String>, timestamps: Vec<i64>, values: Vec<f64>) -> Self {
        Self {
            vm_id: vm_id.into(),
            key: key.into(),
            timestamps,
            values,
            updated_at: Utc::now(),
        }
    }

    /// [毫秒时间戳, 取值] 点列，两个序列长度不一致时按较短者截断
    pub fn points(&self) -> Vec<(i64, f64)> {
        self.timestamps
            .iter()
            .zip(&self.values)
            .map(|(t, v)| (t * 1000, *v))
            .collect()
    }
}

/// 生成占位外部引用
pub fn placeholder_reference() -> String {
    format!("{}{}", PLACEHOLDER_REF_PREFIX, uuid::Uuid::new_v4().simple())
}

/// 判断引用是否为真实的 hypervisor 对象引用
pub fn is_real_reference(reference: &str) -> bool {
    !reference.is_empty() && !reference.starts_with(PLACEHOLDER_REF_PREFIX)
}

/// 常量定义
pub mod constants {
    /// 默认 Server 端口
    pub const DEFAULT_SERVER_PORT: u16 = 3000;

    /// 默认对账周期（秒）
    pub const DEFAULT_RECONCILE_INTERVAL: u64 = 60;

    /// 默认远程调用超时（秒）
    pub const DEFAULT_REMOTE_TIMEOUT: u64 = 30;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_status_round_trip_through_string() {
        for status in [
            VmStatus::Provisioning,
            VmStatus::Running,
            VmStatus::Terminating,
            VmStatus::Stopped,
        ] {
            assert_eq!(VmStatus::from(status.as_str().to_string()), status);
        }
        assert_eq!(VmStatus::from("bogus".to_string()), VmStatus::Error);
    }

    #[test]
    fn test_placeholder_reference() {
        let placeholder = placeholder_reference();
        assert!(placeholder.starts_with(PLACEHOLDER_REF_PREFIX));
        assert!(!is_real_reference(&placeholder));
        assert!(!is_real_reference(""));
        assert!(is_real_reference("OpaqueRef:1234"));
        assert_ne!(placeholder, placeholder_reference());
    }

    #[test]
    fn test_new_provisioning_vm() {
        let template = TemplateRecord::new("small", 512, 1, "d-i").unwrap();
        let vm = VmRecord::new_provisioning("web01.example.com", "host-1", &template, None).unwrap();

        assert_eq!(vm.status, VmStatus::Provisioning);
        assert_eq!(vm.memory, 512);
        assert!(!vm.has_remote_object());
        assert!(VmRecord::new_provisioning(" ", "host-1", &template, None).is_err());
    }

    #[test]
    fn test_metric_points_in_milliseconds() {
        let series = VmMetricSeries::new("vm-1", "cpu0", vec![100, 160, 220], vec![0.5, 0.25]);
        assert_eq!(series.points(), vec![(100_000, 0.5), (160_000, 0.25)]);
    }

    #[test]
    fn test_host_record_rejects_bad_subnet() {
        assert!(HostRecord::new("xs01", None, 8192, 8, "10.0.0.0/24").is_ok());
        assert!(matches!(
            HostRecord::new("xs01", None, 8192, 8, "10.0.0.0/40"),
            Err(Error::InvalidCidr(_))
        ));
    }
}
