/// 虚拟机管理服务
///
/// 提交开通请求（选宿主机、解析地址、落库占位记录、投递开通任务）以及单步生命周期操作。

use std::collections::BTreeMap;

use common::ipam::{self, Addressing};
use common::{Error, HostRecord, Result, TemplateRecord, VmRecord, VmStatus};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use validator::Validate;

use crate::app_state::AppState;
use crate::db::{self, Repository};
use crate::hypervisor::PowerOperation;
use crate::tasks::{LifecycleOp, ProvisionJob, WorkItem};

use super::load_inventory;
use super::provision_service::PROVISION_TOKEN_KEY;

/// 开通请求
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ProvisionRequest {
    #[validate(length(min = 1, max = 64))]
    pub template_id: String,

    /// 指定宿主机时跳过调度
    pub host_id: Option<String>,

    /// 限定调度范围的可用区
    pub zone: Option<String>,

    /// 静态地址 "ip/prefix"，缺省时从宿主机子网自动分配
    #[validate(length(min = 9, max = 18))]
    pub static_cidr: Option<String>,

    /// 主网络之外的附加网段（网桥名），按顺序挂载
    #[serde(default)]
    pub extra_segments: Vec<String>,

    #[validate(length(min = 1, max = 63))]
    pub hostname_prefix: String,

    #[validate(length(min = 1, max = 190))]
    pub domain: Option<String>,
}

impl ProvisionRequest {
    /// 完整主机名，作为虚拟机名称
    pub fn fqdn(&self) -> String {
        match &self.domain {
            Some(domain) => format!("{}.{}", self.hostname_prefix, domain),
            None => self.hostname_prefix.clone(),
        }
    }
}

pub struct VmService {
    state: AppState,
}

impl VmService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    fn repo(&self) -> &dyn Repository {
        self.state.repo.as_ref()
    }

    pub async fn get_vm(&self, vm_id: &str) -> Result<VmRecord> {
        self.repo().get_vm(vm_id).await
    }

    /// 按指标名给出 [毫秒时间戳, 取值] 点列
    pub async fn get_metrics(&self, vm_id: &str) -> Result<BTreeMap<String, Vec<(i64, f64)>>> {
        self.repo().get_vm(vm_id).await?;
        Ok(self
            .repo()
            .list_vm_metrics(vm_id)
            .await?
            .into_iter()
            .map(|series| {
                let points = series.points();
                (series.key, points)
            })
            .collect())
    }

    /// 提交开通请求
    ///
    /// 校验、调度和地址解析错误同步返回；远端创建在任务队列中异步进行。
    pub async fn provision(&self, request: ProvisionRequest) -> Result<VmRecord> {
        request
            .validate()
            .map_err(|e| Error::InvalidArgument(format!("验证失败: {}", e)))?;
        if request.host_id.is_some() && request.zone.is_some() {
            return Err(Error::InvalidArgument(
                "不能同时指定宿主机和可用区".to_string(),
            ));
        }
        if request.extra_segments.iter().any(|s| s.trim().is_empty()) {
            return Err(Error::InvalidArgument("网段名称不能为空".to_string()));
        }

        let template = self.repo().get_template(&request.template_id).await?;
        let host = self.choose_host(&request, &template).await?;
        let name = request.fqdn();

        // 静态地址按其自身所在子网加锁
        let lock_scope = request.static_cidr.as_deref().unwrap_or(host.subnet.as_str());
        let (vm, addressing) = {
            let _guard = self.state.subnet_locks.lock(lock_scope).await?;

            let addressing = self
                .resolve_addressing(&host, request.static_cidr.as_deref())
                .await?;
            let record = VmRecord::new_provisioning(
                name,
                &host.id,
                &template,
                Some(addressing.ip.to_string()),
            )?;
            (self.repo().create_vm(record).await?, addressing)
        };

        info!(
            "虚拟机 {} 已登记: id={}, 宿主机={}, ip={}",
            vm.name, vm.id, host.hostname, addressing.ip
        );

        self.state
            .dispatcher
            .submit(WorkItem::Provision(ProvisionJob {
                vm_id: vm.id.clone(),
                addressing: Some(addressing),
                extra_segments: request.extra_segments,
            }))?;

        Ok(vm)
    }

    /// 重新投递一次失败的开通流程
    pub async fn retry_provision(&self, vm_id: &str, extra_segments: Vec<String>) -> Result<VmRecord> {
        let vm = self.repo().get_vm(vm_id).await?;
        if vm.status != VmStatus::Provisioning {
            return Err(Error::InvalidState(format!(
                "虚拟机 {} 当前状态为 {}，无需重试开通",
                vm.id, vm.status
            )));
        }

        let host = self.repo().get_host(&vm.host_id).await?;
        let addressing = recover_addressing(&vm, &host);

        info!("重新投递虚拟机 {} 的开通任务", vm.id);
        self.state
            .dispatcher
            .submit(WorkItem::Provision(ProvisionJob {
                vm_id: vm.id.clone(),
                addressing,
                extra_segments,
            }))?;

        Ok(vm)
    }

    pub async fn start_vm(&self, vm_id: &str) -> Result<VmRecord> {
        self.request_lifecycle(vm_id, LifecycleOp::Start).await
    }

    pub async fn stop_vm(&self, vm_id: &str) -> Result<VmRecord> {
        self.request_lifecycle(vm_id, LifecycleOp::Stop).await
    }

    pub async fn reboot_vm(&self, vm_id: &str) -> Result<VmRecord> {
        self.request_lifecycle(vm_id, LifecycleOp::Reboot).await
    }

    pub async fn terminate_vm(&self, vm_id: &str) -> Result<VmRecord> {
        self.request_lifecycle(vm_id, LifecycleOp::Terminate).await
    }

    /// 乐观设置状态并投递一次远程调用，结果由对账纠正
    ///
    /// 销毁可以重复请求，也适用于开通未完成、尚无真实引用的虚拟机。
    async fn request_lifecycle(&self, vm_id: &str, op: LifecycleOp) -> Result<VmRecord> {
        let vm = self.repo().get_vm(vm_id).await?;
        if op != LifecycleOp::Terminate {
            if vm.status == VmStatus::Terminating {
                return Err(Error::InvalidState(format!("虚拟机 {} 正在销毁", vm.id)));
            }
            if !vm.has_remote_object() {
                return Err(Error::InvalidState(format!(
                    "虚拟机 {} 尚未在远端创建",
                    vm.id
                )));
            }
        }

        let status = optimistic_status(op);
        let updated = db::modify_vm(self.repo(), vm_id, |record| {
            record.status = status;
            true
        })
        .await?;

        self.state.dispatcher.submit(WorkItem::Lifecycle {
            vm_id: vm_id.to_string(),
            op,
        })?;

        info!("虚拟机 {} 请求 {}，状态置为 {}", vm_id, op.as_str(), status);
        Ok(updated)
    }

    /// 执行生命周期操作的远程调用（任务队列中运行）
    pub async fn execute_lifecycle(&self, vm_id: &str, op: LifecycleOp) -> Result<()> {
        let vm = self.repo().get_vm(vm_id).await?;
        let host = self.repo().get_host(&vm.host_id).await?;

        let result = if op == LifecycleOp::Terminate && !vm.has_remote_object() {
            self.release_unmaterialized(&vm, &host).await
        } else {
            self.power_call(&vm, &host, op).await
        };

        if let Err(e) = &result {
            warn!("虚拟机 {} 的 {} 操作失败: {}", vm_id, op.as_str(), e);
            let message = e.to_string();
            db::modify_vm(self.repo(), vm_id, |record| {
                record.last_error = Some(message.clone());
                true
            })
            .await?;
        }

        result
    }

    async fn power_call(&self, vm: &VmRecord, host: &HostRecord, op: LifecycleOp) -> Result<()> {
        let sessions = self.state.session_manager();
        let session = sessions.session(host).await?;
        session
            .set_power(&vm.external_reference, power_operation(op))
            .await
    }

    /// 销毁开通未完成的虚拟机
    ///
    /// 在子网锁内按开通标记查找上一次尝试留下的远端对象，存在则销毁，然后删除本地记录，
    /// 释放其占用的地址与容量。
    async fn release_unmaterialized(&self, vm: &VmRecord, host: &HostRecord) -> Result<()> {
        let _guard = self.state.subnet_locks.lock(&host.subnet).await?;

        // 等锁期间开通任务可能已落库真实引用
        let vm = self.repo().get_vm(&vm.id).await?;
        if vm.has_remote_object() {
            return self.power_call(&vm, host, LifecycleOp::Terminate).await;
        }

        if !vm.external_reference.is_empty() {
            let sessions = self.state.session_manager();
            let session = sessions.session(host).await?;
            if let Some(remote) = session
                .find_tagged_vm(PROVISION_TOKEN_KEY, &vm.external_reference)
                .await?
            {
                session
                    .set_power(&remote.reference, PowerOperation::Destroy)
                    .await?;
                info!("已销毁虚拟机 {} 开通中途留下的远端对象 {}", vm.id, remote.reference);
            }
        }

        self.repo().delete_vm(&vm.id).await?;
        info!("虚拟机 {} 未完成开通，已删除本地记录", vm.name);
        Ok(())
    }

    async fn choose_host(&self, request: &ProvisionRequest, template: &TemplateRecord) -> Result<HostRecord> {
        if let Some(host_id) = &request.host_id {
            return self.repo().get_host(host_id).await;
        }

        let inventory = load_inventory(self.repo(), request.zone.as_deref()).await?;
        let host = common::placement::select_host(&inventory, template)?;
        info!(
            "模板 {} ({} MB) 调度到宿主机 {}",
            template.name, template.memory, host.hostname
        );
        Ok(host.clone())
    }

    /// 在子网锁内调用：静态地址校验范围与占用，否则取宿主机子网上的第一个空闲地址
    async fn resolve_addressing(&self, host: &HostRecord, static_cidr: Option<&str>) -> Result<Addressing> {
        match static_cidr {
            Some(cidr) => {
                let addressing = ipam::static_addressing(cidr)?;
                let used = db::used_addresses(self.repo(), &ipam::subnet_of(cidr)?).await?;
                if used.contains(&addressing.ip) {
                    return Err(Error::AddressInUse(addressing.ip.to_string()));
                }
                Ok(addressing)
            }
            None => {
                let used = db::used_addresses(self.repo(), &host.subnet).await?;
                ipam::allocate(&host.subnet, &used)
            }
        }
    }
}

fn optimistic_status(op: LifecycleOp) -> VmStatus {
    match op {
        LifecycleOp::Start => VmStatus::Starting,
        LifecycleOp::Stop => VmStatus::Stopping,
        LifecycleOp::Reboot => VmStatus::Rebooting,
        LifecycleOp::Terminate => VmStatus::Terminating,
    }
}

fn power_operation(op: LifecycleOp) -> PowerOperation {
    match op {
        LifecycleOp::Start => PowerOperation::Start,
        LifecycleOp::Stop => PowerOperation::CleanShutdown,
        LifecycleOp::Reboot => PowerOperation::CleanReboot,
        LifecycleOp::Terminate => PowerOperation::Destroy,
    }
}

/// 重试时从记录恢复地址信息；地址不在宿主机子网内（静态地址）时无法恢复网关与掩码
fn recover_addressing(vm: &VmRecord, host: &HostRecord) -> Option<Addressing> {
    let ip = vm.ip.as_deref()?.parse().ok()?;
    let subnet = ipam::parse_subnet(&host.subnet).ok()?;
    subnet.contains(ip).then(|| Addressing {
        ip,
        gateway: subnet.gateway(),
        netmask: subnet.netmask(),
    })
}
