/// 虚拟化平台接入
///
/// 核心只依赖 `HypervisorClient` 能力接口，远程协议由外部实现提供；
/// 会话管理器负责认证会话、版本协商、超时和重连退避。

pub mod session;
pub mod simulated;

use std::collections::BTreeMap;

use async_trait::async_trait;
use common::{HostRecord, Result};
use serde::{Deserialize, Serialize};

pub use session::{HostSession, SessionManager};
pub use simulated::SimulatedHypervisor;

/// 远端 API 版本
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
}

impl ApiVersion {
    /// 从该版本起，网卡/块设备列表直接携带所属虚拟机
    pub const JOINED_LISTINGS: ApiVersion = ApiVersion::new(1, 2);

    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn has_joined_listings(&self) -> bool {
        *self >= Self::JOINED_LISTINGS
    }
}

impl std::fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// 认证凭据
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// 已认证的远端会话
#[derive(Debug, Clone)]
pub struct HypervisorSession {
    pub host_id: String,
    pub hostname: String,
    /// 远端返回的会话句柄
    pub handle: String,
    pub api_version: ApiVersion,
}

/// 虚拟机电源状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    Running,
    Halted,
    Paused,
    Suspended,
}

/// 电源/销毁操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerOperation {
    Start,
    CleanShutdown,
    CleanReboot,
    /// 强制关机并删除虚拟机及其设备
    Destroy,
}

impl PowerOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerOperation::Start => "start",
            PowerOperation::CleanShutdown => "clean_shutdown",
            PowerOperation::CleanReboot => "clean_reboot",
            PowerOperation::Destroy => "destroy",
        }
    }
}

/// 块设备读写模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VbdMode {
    /// 只读光驱，挂载引导 ISO
    ReadOnly,
    /// 读写磁盘
    ReadWrite,
}

/// 创建虚拟机参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmCreateParams {
    pub name_label: String,
    pub name_description: String,
    pub vcpus_max: u32,
    pub vcpus_at_startup: u32,
    /// 字节
    pub memory_static_max: i64,
    pub memory_dynamic_max: i64,
    pub memory_static_min: i64,
    pub memory_dynamic_min: i64,
    pub pv_args: String,
    pub suspend_sr: String,
    pub other_config: BTreeMap<String, String>,
}

/// 远端虚拟机
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteVm {
    pub reference: String,
    pub name_label: String,
    pub power_state: PowerState,
    pub is_control_domain: bool,
    pub is_template: bool,
    /// 字节
    pub memory_static_max: i64,
    pub vcpus_max: u32,
    pub vifs: Vec<String>,
    pub vbds: Vec<String>,
    pub other_config: BTreeMap<String, String>,
}

/// 远端虚拟网卡
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteVif {
    pub reference: String,
    /// 旧版 API 不返回所属虚拟机
    pub vm: Option<String>,
    pub network: String,
    pub device: String,
}

/// 远端虚拟块设备
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteVbd {
    pub reference: String,
    /// 旧版 API 不返回所属虚拟机
    pub vm: Option<String>,
    pub sr: String,
    pub mode: VbdMode,
}

/// 远端网络
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteNetwork {
    pub reference: String,
    pub bridge: String,
    pub name_label: String,
}

/// 远端存储库
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSr {
    pub reference: String,
    pub name_label: String,
    pub content_type: String,
}

impl RemoteSr {
    pub fn is_iso(&self) -> bool {
        self.content_type == "iso"
    }
}

/// 宿主机实时指标（内存单位 MB）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostMetrics {
    pub total_memory: i64,
    pub free_memory: i64,
    pub cores: i32,
    pub cpu_utilization: f64,
}

/// 虚拟机性能指标序列，时间戳为 Unix 秒，与取值一一对应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMetricSeries {
    pub key: String,
    pub timestamps: Vec<i64>,
    pub values: Vec<f64>,
}

/// 虚拟化平台远程能力
///
/// 由外部系统提供实现；测试与模拟模式使用 `SimulatedHypervisor`。
#[async_trait]
pub trait HypervisorClient: Send + Sync {
    async fn connect(&self, host: &HostRecord, credentials: &Credentials) -> Result<HypervisorSession>;

    async fn create_vm(&self, session: &HypervisorSession, params: &VmCreateParams) -> Result<String>;

    async fn create_vif(
        &self,
        session: &HypervisorSession,
        vm_ref: &str,
        network_ref: &str,
        device: &str,
    ) -> Result<String>;

    async fn create_vbd(
        &self,
        session: &HypervisorSession,
        vm_ref: &str,
        sr_ref: &str,
        mode: VbdMode,
    ) -> Result<String>;

    async fn set_power(&self, session: &HypervisorSession, vm_ref: &str, op: PowerOperation) -> Result<()>;

    async fn list_vms(&self, session: &HypervisorSession) -> Result<Vec<RemoteVm>>;

    async fn list_vifs(&self, session: &HypervisorSession) -> Result<Vec<RemoteVif>>;

    async fn list_vbds(&self, session: &HypervisorSession) -> Result<Vec<RemoteVbd>>;

    async fn list_networks(&self, session: &HypervisorSession) -> Result<Vec<RemoteNetwork>>;

    async fn list_srs(&self, session: &HypervisorSession) -> Result<Vec<RemoteSr>>;

    async fn host_metrics(&self, session: &HypervisorSession) -> Result<HostMetrics>;

    /// 虚拟机最近一段时间的性能指标（按指标名分组）
    async fn vm_metrics(&self, session: &HypervisorSession, vm_ref: &str) -> Result<Vec<RemoteMetricSeries>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_version_capabilities() {
        assert!(!ApiVersion::new(1, 1).has_joined_listings());
        assert!(ApiVersion::new(1, 2).has_joined_listings());
        assert!(ApiVersion::new(2, 0).has_joined_listings());
        assert_eq!(ApiVersion::new(1, 2).to_string(), "1.2");
    }
}
