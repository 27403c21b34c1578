/// 模拟 Hypervisor
///
/// 模拟模式下替代真实远程调用，同时供测试注入故障、检查远端对象。

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use common::{Error, HostRecord, Result};
use tracing::debug;

use super::{
    ApiVersion, Credentials, HostMetrics, HypervisorClient, HypervisorSession, PowerOperation,
    PowerState, RemoteMetricSeries, RemoteNetwork, RemoteSr, RemoteVbd, RemoteVif, RemoteVm,
    VbdMode, VmCreateParams,
};

/// 可注入的单次故障点
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimFault {
    CreateVm,
    CreateVif,
    CreateVbd,
    SetPower,
    ListVms,
    HostMetrics,
    VmMetrics,
}

struct SimHost {
    api_version: ApiVersion,
    fail_connect: bool,
    latency: Duration,
    faults: Vec<SimFault>,
    vms: BTreeMap<String, RemoteVm>,
    vifs: BTreeMap<String, RemoteVif>,
    vbds: BTreeMap<String, RemoteVbd>,
    networks: Vec<RemoteNetwork>,
    srs: Vec<RemoteSr>,
    /// 预置的虚拟机指标，缺省时按运行状态生成
    vm_metrics: HashMap<String, Vec<RemoteMetricSeries>>,
    #[cfg(test)]
    connects: usize,
    #[cfg(test)]
    params: HashMap<String, VmCreateParams>,
    #[cfg(test)]
    power_ops: Vec<(String, PowerOperation)>,
    total_memory: i64,
    cores: i32,
    cpu_utilization: f64,
}

fn opaque_ref() -> String {
    format!("OpaqueRef:{}", uuid::Uuid::new_v4())
}

impl SimHost {
    fn new(hostname: &str, api_version: ApiVersion) -> Self {
        let networks = (0..3)
            .map(|i| RemoteNetwork {
                reference: opaque_ref(),
                bridge: format!("xenbr{}", i),
                name_label: format!("Pool-wide network associated with eth{}", i),
            })
            .collect();
        let srs = vec![
            RemoteSr {
                reference: opaque_ref(),
                name_label: "Local storage".to_string(),
                content_type: "user".to_string(),
            },
            RemoteSr {
                reference: opaque_ref(),
                name_label: "ISO library".to_string(),
                content_type: "iso".to_string(),
            },
        ];

        let mut vms = BTreeMap::new();
        let dom0 = RemoteVm {
            reference: opaque_ref(),
            name_label: format!("Control domain on host: {}", hostname),
            power_state: PowerState::Running,
            is_control_domain: true,
            is_template: false,
            memory_static_max: 0,
            vcpus_max: 1,
            vifs: Vec::new(),
            vbds: Vec::new(),
            other_config: BTreeMap::new(),
        };
        vms.insert(dom0.reference.clone(), dom0);

        Self {
            api_version,
            fail_connect: false,
            latency: Duration::ZERO,
            faults: Vec::new(),
            vms,
            vifs: BTreeMap::new(),
            vbds: BTreeMap::new(),
            networks,
            srs,
            vm_metrics: HashMap::new(),
            #[cfg(test)]
            connects: 0,
            #[cfg(test)]
            params: HashMap::new(),
            #[cfg(test)]
            power_ops: Vec::new(),
            total_memory: 65536,
            cores: 16,
            cpu_utilization: 5.0,
        }
    }

    fn take_fault(&mut self, fault: SimFault) -> Result<()> {
        if let Some(pos) = self.faults.iter().position(|f| *f == fault) {
            self.faults.remove(pos);
            return Err(Error::Hypervisor(format!("注入故障: {:?}", fault)));
        }
        Ok(())
    }

    /// 运行中的虚拟机生成单点 CPU 与内存指标，停机时没有数据
    fn synthesize_metrics(&self, vm: &RemoteVm) -> Vec<RemoteMetricSeries> {
        if vm.power_state != PowerState::Running {
            return Vec::new();
        }
        let now = chrono::Utc::now().timestamp();
        vec![
            RemoteMetricSeries {
                key: "cpu0".to_string(),
                timestamps: vec![now],
                values: vec![self.cpu_utilization / 100.0],
            },
            RemoteMetricSeries {
                key: "memory".to_string(),
                timestamps: vec![now],
                values: vec![vm.memory_static_max as f64],
            },
        ]
    }

    fn vm_mut(&mut self, vm_ref: &str) -> Result<&mut RemoteVm> {
        self.vms
            .get_mut(vm_ref)
            .ok_or_else(|| Error::Hypervisor(format!("HANDLE_INVALID: VM {}", vm_ref)))
    }
}

/// 内存中的 Hypervisor，按主机名区分宿主机
pub struct SimulatedHypervisor {
    hosts: Mutex<HashMap<String, SimHost>>,
    default_version: ApiVersion,
}

impl Default for SimulatedHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedHypervisor {
    pub fn new() -> Self {
        Self {
            hosts: Mutex::new(HashMap::new()),
            default_version: ApiVersion::JOINED_LISTINGS,
        }
    }

    fn with_host<T>(&self, hostname: &str, f: impl FnOnce(&mut SimHost) -> T) -> T {
        let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        let host = hosts
            .entry(hostname.to_string())
            .or_insert_with(|| SimHost::new(hostname, self.default_version));
        f(host)
    }

    /// 先模拟网络延迟，再在锁内执行
    async fn remote<T>(&self, hostname: &str, f: impl FnOnce(&mut SimHost) -> Result<T>) -> Result<T> {
        let latency = self.with_host(hostname, |h| h.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.with_host(hostname, f)
    }
}

/// 测试用的宿主机配置、故障注入与远端对象检查
#[cfg(test)]
impl SimulatedHypervisor {
    /// 注册指定 API 版本的宿主机
    pub fn add_host(&self, hostname: &str, api_version: ApiVersion) {
        self.hosts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(hostname.to_string(), SimHost::new(hostname, api_version));
    }

    pub fn fail_connect(&self, hostname: &str, fail: bool) {
        self.with_host(hostname, |h| h.fail_connect = fail);
    }

    pub fn set_latency(&self, hostname: &str, latency: Duration) {
        self.with_host(hostname, |h| h.latency = latency);
    }

    /// 让下一次对应调用失败
    pub fn fail_next(&self, hostname: &str, fault: SimFault) {
        self.with_host(hostname, |h| h.faults.push(fault));
    }

    pub fn set_metrics(&self, hostname: &str, total_memory: i64, cores: i32, cpu_utilization: f64) {
        self.with_host(hostname, |h| {
            h.total_memory = total_memory;
            h.cores = cores;
            h.cpu_utilization = cpu_utilization;
        });
    }

    pub fn connect_count(&self, hostname: &str) -> usize {
        self.with_host(hostname, |h| h.connects)
    }

    /// 非控制域虚拟机
    pub fn vms(&self, hostname: &str) -> Vec<RemoteVm> {
        self.with_host(hostname, |h| {
            h.vms
                .values()
                .filter(|vm| !vm.is_control_domain)
                .cloned()
                .collect()
        })
    }

    pub fn vifs_of(&self, hostname: &str, vm_ref: &str) -> Vec<RemoteVif> {
        self.with_host(hostname, |h| {
            h.vifs
                .values()
                .filter(|vif| vif.vm.as_deref() == Some(vm_ref))
                .cloned()
                .collect()
        })
    }

    pub fn vbds_of(&self, hostname: &str, vm_ref: &str) -> Vec<RemoteVbd> {
        self.with_host(hostname, |h| {
            h.vbds
                .values()
                .filter(|vbd| vbd.vm.as_deref() == Some(vm_ref))
                .cloned()
                .collect()
        })
    }

    pub fn power_operations(&self, hostname: &str) -> Vec<(String, PowerOperation)> {
        self.with_host(hostname, |h| h.power_ops.clone())
    }

    pub fn created_params(&self, hostname: &str, vm_ref: &str) -> Option<VmCreateParams> {
        self.with_host(hostname, |h| h.params.get(vm_ref).cloned())
    }

    pub fn network_ref(&self, hostname: &str, bridge: &str) -> Option<String> {
        self.with_host(hostname, |h| {
            h.networks
                .iter()
                .find(|n| n.bridge == bridge)
                .map(|n| n.reference.clone())
        })
    }

    pub fn sr_ref(&self, hostname: &str, name_label: &str) -> Option<String> {
        self.with_host(hostname, |h| {
            h.srs
                .iter()
                .find(|sr| sr.name_label == name_label)
                .map(|sr| sr.reference.clone())
        })
    }

    /// 在远端直接放置一台虚拟机（绕过编排）
    pub fn insert_vm(&self, hostname: &str, name_label: &str, memory_mb: i64, state: PowerState) -> String {
        let reference = opaque_ref();
        let vm = RemoteVm {
            reference: reference.clone(),
            name_label: name_label.to_string(),
            power_state: state,
            is_control_domain: false,
            is_template: false,
            memory_static_max: common::utils::mb_to_bytes(memory_mb),
            vcpus_max: 1,
            vifs: Vec::new(),
            vbds: Vec::new(),
            other_config: BTreeMap::new(),
        };
        self.with_host(hostname, |h| h.vms.insert(reference.clone(), vm));
        reference
    }

    pub fn set_power_state(&self, hostname: &str, vm_ref: &str, state: PowerState) {
        self.with_host(hostname, |h| {
            if let Some(vm) = h.vms.get_mut(vm_ref) {
                vm.power_state = state;
            }
        });
    }

    pub fn remove_vm(&self, hostname: &str, vm_ref: &str) {
        self.with_host(hostname, |h| {
            h.vms.remove(vm_ref);
        });
    }

    pub fn set_vm_metrics(&self, hostname: &str, vm_ref: &str, series: Vec<RemoteMetricSeries>) {
        self.with_host(hostname, |h| {
            h.vm_metrics.insert(vm_ref.to_string(), series);
        });
    }
}

#[async_trait]
impl HypervisorClient for SimulatedHypervisor {
    async fn connect(&self, host: &HostRecord, credentials: &Credentials) -> Result<HypervisorSession> {
        let hostname = host.hostname.clone();
        let username = credentials.username.clone();
        self.remote(&host.hostname, |h| {
            #[cfg(test)]
            {
                h.connects += 1;
            }
            if h.fail_connect {
                return Err(Error::Hypervisor(format!("无法连接 {}", hostname)));
            }
            debug!("模拟登录 {}@{}", username, hostname);
            Ok(HypervisorSession {
                host_id: host.id.clone(),
                hostname: hostname.clone(),
                handle: opaque_ref(),
                api_version: h.api_version,
            })
        })
        .await
    }

    async fn create_vm(&self, session: &HypervisorSession, params: &VmCreateParams) -> Result<String> {
        self.remote(&session.hostname, |h| {
            h.take_fault(SimFault::CreateVm)?;
            let reference = opaque_ref();
            h.vms.insert(
                reference.clone(),
                RemoteVm {
                    reference: reference.clone(),
                    name_label: params.name_label.clone(),
                    power_state: PowerState::Halted,
                    is_control_domain: false,
                    is_template: false,
                    memory_static_max: params.memory_static_max,
                    vcpus_max: params.vcpus_max,
                    vifs: Vec::new(),
                    vbds: Vec::new(),
                    other_config: params.other_config.clone(),
                },
            );
            #[cfg(test)]
            {
                h.params.insert(reference.clone(), params.clone());
            }
            Ok(reference)
        })
        .await
    }

    async fn create_vif(
        &self,
        session: &HypervisorSession,
        vm_ref: &str,
        network_ref: &str,
        device: &str,
    ) -> Result<String> {
        self.remote(&session.hostname, |h| {
            h.take_fault(SimFault::CreateVif)?;
            if !h.networks.iter().any(|n| n.reference == network_ref) {
                return Err(Error::Hypervisor(format!("HANDLE_INVALID: network {}", network_ref)));
            }
            let reference = opaque_ref();
            h.vm_mut(vm_ref)?.vifs.push(reference.clone());
            h.vifs.insert(
                reference.clone(),
                RemoteVif {
                    reference: reference.clone(),
                    vm: Some(vm_ref.to_string()),
                    network: network_ref.to_string(),
                    device: device.to_string(),
                },
            );
            Ok(reference)
        })
        .await
    }

    async fn create_vbd(
        &self,
        session: &HypervisorSession,
        vm_ref: &str,
        sr_ref: &str,
        mode: VbdMode,
    ) -> Result<String> {
        self.remote(&session.hostname, |h| {
            h.take_fault(SimFault::CreateVbd)?;
            if !h.srs.iter().any(|sr| sr.reference == sr_ref) {
                return Err(Error::Hypervisor(format!("HANDLE_INVALID: SR {}", sr_ref)));
            }
            let reference = opaque_ref();
            h.vm_mut(vm_ref)?.vbds.push(reference.clone());
            h.vbds.insert(
                reference.clone(),
                RemoteVbd {
                    reference: reference.clone(),
                    vm: Some(vm_ref.to_string()),
                    sr: sr_ref.to_string(),
                    mode,
                },
            );
            Ok(reference)
        })
        .await
    }

    async fn set_power(&self, session: &HypervisorSession, vm_ref: &str, op: PowerOperation) -> Result<()> {
        self.remote(&session.hostname, |h| {
            h.take_fault(SimFault::SetPower)?;
            h.vm_mut(vm_ref)?;
            #[cfg(test)]
            {
                h.power_ops.push((vm_ref.to_string(), op));
            }

            match op {
                PowerOperation::Start | PowerOperation::CleanReboot => {
                    h.vm_mut(vm_ref)?.power_state = PowerState::Running;
                }
                PowerOperation::CleanShutdown => {
                    h.vm_mut(vm_ref)?.power_state = PowerState::Halted;
                }
                PowerOperation::Destroy => {
                    if let Some(vm) = h.vms.remove(vm_ref) {
                        for vif in vm.vifs {
                            h.vifs.remove(&vif);
                        }
                        for vbd in vm.vbds {
                            h.vbds.remove(&vbd);
                        }
                    }
                    h.vm_metrics.remove(vm_ref);
                    #[cfg(test)]
                    {
                        h.params.remove(vm_ref);
                    }
                }
            }
            Ok(())
        })
        .await
    }

    async fn list_vms(&self, session: &HypervisorSession) -> Result<Vec<RemoteVm>> {
        self.remote(&session.hostname, |h| {
            h.take_fault(SimFault::ListVms)?;
            Ok(h.vms.values().cloned().collect())
        })
        .await
    }

    async fn list_vifs(&self, session: &HypervisorSession) -> Result<Vec<RemoteVif>> {
        self.remote(&session.hostname, |h| {
            let joined = h.api_version.has_joined_listings();
            Ok(h.vifs
                .values()
                .cloned()
                .map(|mut vif| {
                    if !joined {
                        vif.vm = None;
                    }
                    vif
                })
                .collect())
        })
        .await
    }

    async fn list_vbds(&self, session: &HypervisorSession) -> Result<Vec<RemoteVbd>> {
        self.remote(&session.hostname, |h| {
            let joined = h.api_version.has_joined_listings();
            Ok(h.vbds
                .values()
                .cloned()
                .map(|mut vbd| {
                    if !joined {
                        vbd.vm = None;
                    }
                    vbd
                })
                .collect())
        })
        .await
    }

    async fn list_networks(&self, session: &HypervisorSession) -> Result<Vec<RemoteNetwork>> {
        self.remote(&session.hostname, |h| Ok(h.networks.clone()))
            .await
    }

    async fn list_srs(&self, session: &HypervisorSession) -> Result<Vec<RemoteSr>> {
        self.remote(&session.hostname, |h| Ok(h.srs.clone()))
            .await
    }

    async fn host_metrics(&self, session: &HypervisorSession) -> Result<HostMetrics> {
        self.remote(&session.hostname, |h| {
            h.take_fault(SimFault::HostMetrics)?;
            let used: i64 = h
                .vms
                .values()
                .filter(|vm| vm.power_state == PowerState::Running)
                .map(|vm| vm.memory_static_max / (1024 * 1024))
                .sum();
            Ok(HostMetrics {
                total_memory: h.total_memory,
                free_memory: (h.total_memory - used).max(0),
                cores: h.cores,
                cpu_utilization: h.cpu_utilization,
            })
        })
        .await
    }

    async fn vm_metrics(&self, session: &HypervisorSession, vm_ref: &str) -> Result<Vec<RemoteMetricSeries>> {
        self.remote(&session.hostname, |h| {
            h.take_fault(SimFault::VmMetrics)?;
            if let Some(series) = h.vm_metrics.get(vm_ref) {
                return Ok(series.clone());
            }
            let vm = h
                .vms
                .get(vm_ref)
                .ok_or_else(|| Error::Hypervisor(format!("HANDLE_INVALID: VM {}", vm_ref)))?;
            Ok(h.synthesize_metrics(vm))
        })
        .await
    }
}
