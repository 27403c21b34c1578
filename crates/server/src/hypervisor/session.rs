/// Hypervisor 会话管理
///
/// 会话按宿主机懒加载，只在一次编排/刷新操作内缓存复用，不跨操作共享。
/// 连接失败按指数退避加随机抖动重试，所有远程调用都带超时。

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use common::{Error, HostRecord, Result};
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    ApiVersion, Credentials, HostMetrics, HypervisorClient, HypervisorSession, PowerOperation,
    RemoteMetricSeries, RemoteNetwork, RemoteSr, RemoteVbd, RemoteVif, RemoteVm, VbdMode,
    VmCreateParams,
};
use crate::config::HypervisorConfig;

/// 会话参数
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub credentials: Credentials,
    pub timeout: Duration,
    pub connect_attempts: u32,
    pub backoff_base: Duration,
}

impl From<&HypervisorConfig> for SessionSettings {
    fn from(config: &HypervisorConfig) -> Self {
        Self {
            credentials: Credentials {
                username: config.username.clone(),
                password: config.password.clone(),
            },
            timeout: config.timeout(),
            connect_attempts: config.connect_attempts.max(1),
            backoff_base: config.backoff_base(),
        }
    }
}

/// 单次操作范围内的会话管理器
pub struct SessionManager {
    client: Arc<dyn HypervisorClient>,
    settings: SessionSettings,
    sessions: Mutex<HashMap<String, HostSession>>,
}

impl SessionManager {
    pub fn new(client: Arc<dyn HypervisorClient>, settings: SessionSettings) -> Self {
        Self {
            client,
            settings,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// 获取宿主机会话，首次使用时建立连接
    pub async fn session(&self, host: &HostRecord) -> Result<HostSession> {
        if let Some(session) = self.sessions.lock().await.get(&host.id) {
            return Ok(session.clone());
        }

        let session = HostSession {
            client: self.client.clone(),
            session: Arc::new(self.connect_with_retry(host).await?),
            timeout: self.settings.timeout,
        };

        // 并发建立的会话以先写入者为准
        let mut sessions = self.sessions.lock().await;
        let entry = sessions.entry(host.id.clone()).or_insert(session);
        Ok(entry.clone())
    }

    async fn connect_with_retry(&self, host: &HostRecord) -> Result<HypervisorSession> {
        let attempts = self.settings.connect_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let result = tokio::time::timeout(
                self.settings.timeout,
                self.client.connect(host, &self.settings.credentials),
            )
            .await;

            match result {
                Ok(Ok(session)) => {
                    info!(
                        "已连接宿主机 {} (API {})",
                        host.hostname, session.api_version
                    );
                    return Ok(session);
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("连接超时 ({:?})", self.settings.timeout),
            }

            if attempt < attempts {
                let delay = self.backoff(attempt);
                warn!(
                    "连接宿主机 {} 失败 ({}/{}): {}，{:?} 后重试",
                    host.hostname, attempt, attempts, last_error, delay
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(Error::host_unavailable(&host.hostname, last_error))
    }

    /// 第 n 次失败后的等待时间：base * 2^(n-1) 加上至多 base/2 的抖动
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.settings.backoff_base;
        let exp = base.saturating_mul(1u32 << (attempt - 1).min(16));
        let jitter_ms = base.as_millis() as u64 / 2;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        exp + Duration::from_millis(jitter)
    }
}

/// 已认证会话及其远程调用
#[derive(Clone)]
pub struct HostSession {
    client: Arc<dyn HypervisorClient>,
    session: Arc<HypervisorSession>,
    timeout: Duration,
}

impl std::fmt::Debug for HostSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSession")
            .field("hostname", &self.session.hostname)
            .field("api_version", &self.session.api_version)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HostSession {
    pub fn api_version(&self) -> ApiVersion {
        self.session.api_version
    }

    async fn timed<T, F>(&self, call: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::host_unavailable(
                &self.session.hostname,
                format!("{} 调用超时 ({:?})", call, self.timeout),
            )),
        }
    }

    pub async fn create_vm(&self, params: &VmCreateParams) -> Result<String> {
        self.timed("create_vm", self.client.create_vm(&self.session, params))
            .await
    }

    pub async fn create_vif(&self, vm_ref: &str, network_ref: &str, device: &str) -> Result<String> {
        self.timed(
            "create_vif",
            self.client.create_vif(&self.session, vm_ref, network_ref, device),
        )
        .await
    }

    pub async fn create_vbd(&self, vm_ref: &str, sr_ref: &str, mode: VbdMode) -> Result<String> {
        self.timed(
            "create_vbd",
            self.client.create_vbd(&self.session, vm_ref, sr_ref, mode),
        )
        .await
    }

    pub async fn set_power(&self, vm_ref: &str, op: PowerOperation) -> Result<()> {
        self.timed(op.as_str(), self.client.set_power(&self.session, vm_ref, op))
            .await
    }

    pub async fn list_vms(&self) -> Result<Vec<RemoteVm>> {
        self.timed("list_vms", self.client.list_vms(&self.session))
            .await
    }

    pub async fn list_networks(&self) -> Result<Vec<RemoteNetwork>> {
        self.timed("list_networks", self.client.list_networks(&self.session))
            .await
    }

    pub async fn list_srs(&self) -> Result<Vec<RemoteSr>> {
        self.timed("list_srs", self.client.list_srs(&self.session))
            .await
    }

    pub async fn host_metrics(&self) -> Result<HostMetrics> {
        self.timed("host_metrics", self.client.host_metrics(&self.session))
            .await
    }

    pub async fn vm_metrics(&self, vm_ref: &str) -> Result<Vec<RemoteMetricSeries>> {
        self.timed("vm_metrics", self.client.vm_metrics(&self.session, vm_ref))
            .await
    }

    /// 查找远端虚拟机
    pub async fn find_vm(&self, vm_ref: &str) -> Result<Option<RemoteVm>> {
        Ok(self
            .list_vms()
            .await?
            .into_iter()
            .find(|vm| vm.reference == vm_ref))
    }

    /// 查找 other_config 中带有指定标记值的远端虚拟机
    pub async fn find_tagged_vm(&self, key: &str, value: &str) -> Result<Option<RemoteVm>> {
        Ok(self
            .list_vms()
            .await?
            .into_iter()
            .find(|vm| vm.other_config.get(key).map(String::as_str) == Some(value)))
    }

    async fn vm_owned_refs(&self, vm_ref: &str) -> Result<RemoteVm> {
        self.find_vm(vm_ref)
            .await?
            .ok_or_else(|| Error::Hypervisor(format!("远端虚拟机 {} 不存在", vm_ref)))
    }

    /// 列出虚拟机已挂载的网卡
    ///
    /// 新版 API 的网卡列表携带所属虚拟机，直接过滤；
    /// 旧版 API 需要用虚拟机记录上的网卡引用做交叉比对。
    pub async fn vm_network_attachments(&self, vm_ref: &str) -> Result<Vec<RemoteVif>> {
        let vifs = self
            .timed("list_vifs", self.client.list_vifs(&self.session))
            .await?;

        if self.api_version().has_joined_listings() {
            return Ok(vifs
                .into_iter()
                .filter(|vif| vif.vm.as_deref() == Some(vm_ref))
                .collect());
        }

        let owned: HashSet<String> = self.vm_owned_refs(vm_ref).await?.vifs.into_iter().collect();
        debug!("API {} 交叉比对 {} 个网卡引用", self.api_version(), owned.len());

        Ok(vifs
            .into_iter()
            .filter(|vif| owned.contains(&vif.reference))
            .map(|mut vif| {
                vif.vm = Some(vm_ref.to_string());
                vif
            })
            .collect())
    }

    /// 列出虚拟机已挂载的块设备，版本处理同网卡
    pub async fn vm_block_attachments(&self, vm_ref: &str) -> Result<Vec<RemoteVbd>> {
        let vbds = self
            .timed("list_vbds", self.client.list_vbds(&self.session))
            .await?;

        if self.api_version().has_joined_listings() {
            return Ok(vbds
                .into_iter()
                .filter(|vbd| vbd.vm.as_deref() == Some(vm_ref))
                .collect());
        }

        let owned: HashSet<String> = self.vm_owned_refs(vm_ref).await?.vbds.into_iter().collect();

        Ok(vbds
            .into_iter()
            .filter(|vbd| owned.contains(&vbd.reference))
            .map(|mut vbd| {
                vbd.vm = Some(vm_ref.to_string());
                vbd
            })
            .collect())
    }
}
