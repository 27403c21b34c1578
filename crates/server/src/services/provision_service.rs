/// 开通编排
///
/// 在子网锁内依次执行：创建远端虚拟机 → 按顺序挂载网卡 → 挂载引导 ISO 与本地磁盘
/// → 落库真实引用 → 开机。每一步都先检查远端是否已完成，重试不会产生重复对象。
/// 任一步失败时记录保持 Provisioning 并写入失败原因，不回滚已创建的远端对象。

use std::collections::BTreeMap;

use common::ipam::Addressing;
use common::utils::{mb_to_bytes, split_hostname};
use common::{Error, HostRecord, Result, TemplateRecord, VmRecord, VmStatus};
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::db::{self, Repository};
use crate::hypervisor::{
    HostSession, PowerOperation, PowerState, RemoteNetwork, RemoteSr, VbdMode, VmCreateParams,
};
use crate::tasks::ProvisionJob;

/// 远端虚拟机上标记开通流程的键，值为本地记录的占位引用
pub const PROVISION_TOKEN_KEY: &str = "provision_token";

const BOOT_CONSOLE_ARGS: &str = "-- quiet console=hvc0";

/// 将远端错误归入失败步骤，宿主机不可用保持原样
fn at_step(step: &'static str) -> impl FnOnce(Error) -> Error {
    move |e| match e {
        Error::HostUnavailable { .. } => e,
        other => Error::remote_creation(step, other),
    }
}

pub struct ProvisionService {
    state: AppState,
}

impl ProvisionService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    fn repo(&self) -> &dyn Repository {
        self.state.repo.as_ref()
    }

    /// 执行开通任务
    pub async fn run(&self, job: &ProvisionJob) -> Result<()> {
        let queued = match self.pending_vm(&job.vm_id).await? {
            Some(vm) => vm,
            None => return Ok(()),
        };
        let host = self.repo().get_host(&queued.host_id).await?;

        let _guard = self.state.subnet_locks.lock(&host.subnet).await?;

        // 等锁期间记录可能已被销毁
        let vm = match self.pending_vm(&job.vm_id).await? {
            Some(vm) => vm,
            None => return Ok(()),
        };

        let template_id = vm.template_id.as_deref().ok_or_else(|| {
            Error::InvalidState(format!("虚拟机 {} 没有关联模板，无法开通", vm.id))
        })?;
        let template = self.repo().get_template(template_id).await?;

        match self.materialize(&vm, &host, &template, job).await {
            Ok(vm_ref) => {
                info!("虚拟机 {} 开通完成: {} @ {}", vm.name, vm_ref, host.hostname);
                Ok(())
            }
            Err(e) => {
                warn!("虚拟机 {} 开通失败: {}", vm.id, e);
                let message = e.to_string();
                db::modify_vm(self.repo(), &vm.id, |record| {
                    record.last_error = Some(message.clone());
                    true
                })
                .await?;
                Err(e)
            }
        }
    }

    /// 仍处于 Provisioning 的记录；已删除或状态已变化时返回 `None`
    async fn pending_vm(&self, vm_id: &str) -> Result<Option<VmRecord>> {
        match self.repo().get_vm(vm_id).await {
            Ok(vm) if vm.status == VmStatus::Provisioning => Ok(Some(vm)),
            Ok(vm) => {
                info!("虚拟机 {} 状态为 {}，跳过开通", vm.id, vm.status);
                Ok(None)
            }
            Err(Error::NotFound(_)) => {
                info!("虚拟机 {} 已删除，跳过开通", vm_id);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn materialize(
        &self,
        vm: &VmRecord,
        host: &HostRecord,
        template: &TemplateRecord,
        job: &ProvisionJob,
    ) -> Result<String> {
        let hv_config = &self.state.config.hypervisor;
        let sessions = self.state.session_manager();
        let session = sessions.session(host).await?;

        // 先解析全部网络与存储库，缺失时不创建任何远端对象
        let networks = session.list_networks().await.map_err(at_step("list_networks"))?;
        let mut bridges = vec![hv_config.primary_bridge.clone()];
        bridges.extend(job.extra_segments.iter().cloned());
        let network_refs = resolve_networks(&networks, &bridges)?;

        let srs = session.list_srs().await.map_err(at_step("list_srs"))?;
        let local_sr = find_sr(&srs, &hv_config.local_sr_name, "local_sr")?;
        let iso_sr = match &template.iso_sr {
            Some(name) => find_sr(&srs, name, "iso_sr")?,
            None => srs
                .iter()
                .find(|sr| sr.is_iso())
                .ok_or_else(|| Error::remote_creation("iso_sr", "宿主机上没有 ISO 存储库"))?,
        };

        // 创建虚拟机
        let vm_ref = match self.existing_remote_vm(&session, vm).await? {
            Some(vm_ref) => {
                info!("虚拟机 {} 已存在远端对象 {}，继续后续步骤", vm.id, vm_ref);
                vm_ref
            }
            None => {
                let preseed_url = format!(
                    "{}/preseed/{}",
                    self.state.config.public_base_url.trim_end_matches('/'),
                    template.id
                );
                let params = build_create_params(
                    vm,
                    template,
                    &preseed_url,
                    job.addressing.as_ref(),
                    &local_sr.reference,
                );
                let vm_ref = session
                    .create_vm(&params)
                    .await
                    .map_err(at_step("create_vm"))?;
                info!("已在 {} 上创建虚拟机 {} -> {}", host.hostname, vm.name, vm_ref);
                vm_ref
            }
        };

        // 网卡：设备号与网段顺序一致，已存在的设备号跳过
        let attached = session
            .vm_network_attachments(&vm_ref)
            .await
            .map_err(at_step("list_vifs"))?;
        for (index, network_ref) in network_refs.iter().enumerate() {
            let device = index.to_string();
            if attached.iter().any(|vif| vif.device == device) {
                debug!("虚拟机 {} 网卡 {} 已存在", vm_ref, device);
                continue;
            }
            session
                .create_vif(&vm_ref, network_ref, &device)
                .await
                .map_err(at_step("create_vif"))?;
            debug!("虚拟机 {} 挂载网卡 {} -> {}", vm_ref, device, bridges[index]);
        }

        // 块设备：引导 ISO（只读）与本地磁盘（读写），按存储库去重
        let attached = session
            .vm_block_attachments(&vm_ref)
            .await
            .map_err(at_step("list_vbds"))?;
        for (sr, mode) in [(iso_sr, VbdMode::ReadOnly), (local_sr, VbdMode::ReadWrite)] {
            if attached.iter().any(|vbd| vbd.sr == sr.reference) {
                debug!("虚拟机 {} 已挂载存储库 {}", vm_ref, sr.name_label);
                continue;
            }
            session
                .create_vbd(&vm_ref, &sr.reference, mode)
                .await
                .map_err(at_step("create_vbd"))?;
            debug!("虚拟机 {} 挂载存储库 {} ({:?})", vm_ref, sr.name_label, mode);
        }

        // 落库真实引用
        let reference = vm_ref.clone();
        db::modify_vm(self.repo(), &vm.id, |record| {
            record.external_reference = reference.clone();
            record.last_error = None;
            true
        })
        .await?;

        // 开机，已在运行时跳过
        let running = session
            .find_vm(&vm_ref)
            .await
            .map_err(at_step("power_on"))?
            .map(|remote| remote.power_state == PowerState::Running)
            .unwrap_or(false);
        if running {
            debug!("虚拟机 {} 已在运行", vm_ref);
        } else {
            session
                .set_power(&vm_ref, PowerOperation::Start)
                .await
                .map_err(at_step("power_on"))?;
        }

        Ok(vm_ref)
    }

    /// 已落库的真实引用，或上一次尝试留下的带开通标记的远端对象
    async fn existing_remote_vm(&self, session: &HostSession, vm: &VmRecord) -> Result<Option<String>> {
        if vm.has_remote_object() {
            return match session
                .find_vm(&vm.external_reference)
                .await
                .map_err(at_step("list_vms"))?
            {
                Some(r) => Ok(Some(r.reference)),
                None => Err(Error::remote_creation(
                    "create_vm",
                    format!("远端虚拟机 {} 已不存在", vm.external_reference),
                )),
            };
        }

        Ok(session
            .find_tagged_vm(PROVISION_TOKEN_KEY, &vm.external_reference)
            .await
            .map_err(at_step("list_vms"))?
            .map(|r| r.reference))
    }
}

fn resolve_networks(networks: &[RemoteNetwork], bridges: &[String]) -> Result<Vec<String>> {
    bridges
        .iter()
        .map(|bridge| {
            networks
                .iter()
                .find(|n| &n.bridge == bridge)
                .map(|n| n.reference.clone())
                .ok_or_else(|| {
                    Error::remote_creation("resolve_network", format!("找不到网桥 {}", bridge))
                })
        })
        .collect()
}

fn find_sr<'a>(srs: &'a [RemoteSr], name_label: &str, step: &'static str) -> Result<&'a RemoteSr> {
    srs.iter()
        .find(|sr| sr.name_label == name_label)
        .ok_or_else(|| Error::remote_creation(step, format!("找不到存储库 {}", name_label)))
}

/// 安装程序引导参数，末尾固定为控制台与静默参数
pub fn boot_args(vm_name: &str, preseed_url: &str, addressing: Option<&Addressing>) -> String {
    let (hostname, domain) = split_hostname(vm_name);
    let mut args = vec![
        "auto=true".to_string(),
        "priority=critical".to_string(),
        format!("url={}", preseed_url),
        format!("hostname={}", hostname),
    ];
    if let Some(domain) = domain {
        args.push(format!("domain={}", domain));
    }
    if let Some(addr) = addressing {
        args.push("netcfg/disable_autoconfig=true".to_string());
        args.push(format!("netcfg/get_ipaddress={}", addr.ip));
        args.push(format!("netcfg/get_netmask={}", addr.netmask));
        args.push(format!("netcfg/get_gateway={}", addr.gateway));
        args.push("netcfg/confirm_static=true".to_string());
    }

    format!("{} {}", args.join(" "), BOOT_CONSOLE_ARGS)
}

pub fn build_create_params(
    vm: &VmRecord,
    template: &TemplateRecord,
    preseed_url: &str,
    addressing: Option<&Addressing>,
    suspend_sr: &str,
) -> VmCreateParams {
    let memory = mb_to_bytes(template.memory);
    let mut other_config = BTreeMap::new();
    other_config.insert(PROVISION_TOKEN_KEY.to_string(), vm.external_reference.clone());
    other_config.insert("fleet_vm_id".to_string(), vm.id.clone());

    VmCreateParams {
        name_label: vm.name.clone(),
        name_description: format!("template {}", template.name),
        vcpus_max: 1,
        vcpus_at_startup: 1,
        memory_static_max: memory,
        memory_dynamic_max: memory,
        memory_static_min: memory,
        memory_dynamic_min: memory,
        pv_args: boot_args(&vm.name, preseed_url, addressing),
        suspend_sr: suspend_sr.to_string(),
        other_config,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::simulated::SimFault;
    use crate::hypervisor::ApiVersion;
    use crate::services::test_support::{fixture_with_version, Fixture};
    use crate::services::vm_service::{ProvisionRequest, VmService};
    use crate::tasks::WorkItem;

    async fn submit(fx: &Fixture, extra_segments: Vec<String>) -> ProvisionJob {
        let service = VmService::new(fx.state.clone());
        service
            .provision(ProvisionRequest {
                template_id: fx.template.id.clone(),
                host_id: Some(fx.host.id.clone()),
                zone: None,
                static_cidr: None,
                extra_segments,
                hostname_prefix: "db01".to_string(),
                domain: Some("example.com".to_string()),
            })
            .await
            .unwrap();

        match fx.recorder.take().pop() {
            Some(WorkItem::Provision(job)) => job,
            other => panic!("unexpected work item {:?}", other),
        }
    }

    const VERSIONS: [ApiVersion; 2] = [ApiVersion::new(1, 1), ApiVersion::new(1, 2)];

    #[tokio::test]
    async fn test_provision_without_extra_segments() {
        for version in VERSIONS {
            let fx = fixture_with_version(version).await;
            let job = submit(&fx, Vec::new()).await;

            ProvisionService::new(fx.state.clone()).run(&job).await.unwrap();

            let vm = fx.repo.get_vm(&job.vm_id).await.unwrap();
            assert!(vm.has_remote_object());
            assert_eq!(vm.status, VmStatus::Provisioning);
            let vm_ref = vm.external_reference.clone();

            let vifs = fx.sim.vifs_of("xs01", &vm_ref);
            assert_eq!(vifs.len(), 1, "API {}", version);
            assert_eq!(vifs[0].device, "0");
            assert_eq!(
                Some(vifs[0].network.clone()),
                fx.sim.network_ref("xs01", "xenbr0")
            );

            let vbds = fx.sim.vbds_of("xs01", &vm_ref);
            assert_eq!(vbds.len(), 2);
            assert!(vbds.iter().any(|v| v.mode == VbdMode::ReadOnly
                && Some(v.sr.clone()) == fx.sim.sr_ref("xs01", "ISO library")));
            assert!(vbds.iter().any(|v| v.mode == VbdMode::ReadWrite
                && Some(v.sr.clone()) == fx.sim.sr_ref("xs01", "Local storage")));

            assert_eq!(
                fx.sim.power_operations("xs01"),
                vec![(vm_ref.clone(), PowerOperation::Start)]
            );
        }
    }

    #[tokio::test]
    async fn test_provision_with_extra_segment_keeps_order() {
        for version in VERSIONS {
            let fx = fixture_with_version(version).await;
            let job = submit(&fx, vec!["xenbr2".to_string()]).await;

            ProvisionService::new(fx.state.clone()).run(&job).await.unwrap();

            let vm_ref = fx.repo.get_vm(&job.vm_id).await.unwrap().external_reference;
            let mut vifs = fx.sim.vifs_of("xs01", &vm_ref);
            vifs.sort_by(|a, b| a.device.cmp(&b.device));
            let devices: Vec<_> = vifs.iter().map(|v| v.device.as_str()).collect();
            assert_eq!(devices, vec!["0", "1"], "API {}", version);
            assert_eq!(Some(vifs[0].network.clone()), fx.sim.network_ref("xs01", "xenbr0"));
            assert_eq!(Some(vifs[1].network.clone()), fx.sim.network_ref("xs01", "xenbr2"));

            assert_eq!(fx.sim.vbds_of("xs01", &vm_ref).len(), 2);
            assert_eq!(fx.sim.power_operations("xs01").len(), 1);
        }
    }

    #[tokio::test]
    async fn test_create_params() {
        let fx = fixture_with_version(ApiVersion::new(1, 2)).await;
        let job = submit(&fx, Vec::new()).await;
        ProvisionService::new(fx.state.clone()).run(&job).await.unwrap();

        let vm = fx.repo.get_vm(&job.vm_id).await.unwrap();
        let params = fx.sim.created_params("xs01", &vm.external_reference).unwrap();
        assert_eq!(params.name_label, "db01.example.com");
        assert_eq!(params.vcpus_max, 1);
        assert_eq!(params.memory_static_max, 1024 * 1024 * 1024);
        assert_eq!(params.memory_dynamic_max, params.memory_static_max);
        assert_eq!(Some(params.suspend_sr), fx.sim.sr_ref("xs01", "Local storage"));
        assert!(params.pv_args.ends_with(" -- quiet console=hvc0"));
        assert!(params
            .pv_args
            .contains(&format!("url=http://fleet.local/preseed/{}", fx.template.id)));
        assert!(params.pv_args.contains("netcfg/get_ipaddress=10.0.0.2"));
    }

    #[test]
    fn test_boot_args_without_addressing() {
        let args = boot_args("web01", "http://x/preseed/t", None);
        assert_eq!(
            args,
            "auto=true priority=critical url=http://x/preseed/t hostname=web01 -- quiet console=hvc0"
        );
    }

    #[tokio::test]
    async fn test_retry_after_partial_failure_does_not_duplicate() {
        for version in VERSIONS {
            let fx = fixture_with_version(version).await;
            let job = submit(&fx, vec!["xenbr1".to_string()]).await;
            let service = ProvisionService::new(fx.state.clone());

            fx.sim.fail_next("xs01", SimFault::CreateVbd);
            let err = service.run(&job).await.unwrap_err();
            assert!(matches!(err, Error::RemoteObjectCreation { ref step, .. } if step == "create_vbd"));

            let vm = fx.repo.get_vm(&job.vm_id).await.unwrap();
            assert_eq!(vm.status, VmStatus::Provisioning);
            assert!(!vm.has_remote_object());
            assert!(vm.last_error.is_some());
            assert!(fx.sim.power_operations("xs01").is_empty());

            service.run(&job).await.unwrap();

            let remote = fx.sim.vms("xs01");
            assert_eq!(remote.len(), 1, "API {}", version);
            let vm = fx.repo.get_vm(&job.vm_id).await.unwrap();
            assert_eq!(vm.external_reference, remote[0].reference);
            assert!(vm.last_error.is_none());
            assert_eq!(fx.sim.vifs_of("xs01", &remote[0].reference).len(), 2);
            assert_eq!(fx.sim.vbds_of("xs01", &remote[0].reference).len(), 2);
            assert_eq!(fx.sim.power_operations("xs01").len(), 1);

            // 已完成的流程再次执行不会重复开机
            service.run(&job).await.unwrap();
            assert_eq!(fx.sim.power_operations("xs01").len(), 1);
        }
    }

    #[tokio::test]
    async fn test_unknown_segment_fails_before_remote_creation() {
        let fx = fixture_with_version(ApiVersion::new(1, 2)).await;
        let job = submit(&fx, vec!["xenbr9".to_string()]).await;

        let err = ProvisionService::new(fx.state.clone()).run(&job).await.unwrap_err();
        assert!(matches!(err, Error::RemoteObjectCreation { ref step, .. } if step == "resolve_network"));
        assert!(fx.sim.vms("xs01").is_empty());
    }

    #[tokio::test]
    async fn test_job_for_deleted_record_is_skipped() {
        let fx = fixture_with_version(ApiVersion::new(1, 2)).await;
        let job = submit(&fx, Vec::new()).await;
        fx.repo.delete_vm(&job.vm_id).await.unwrap();

        ProvisionService::new(fx.state.clone()).run(&job).await.unwrap();
        assert!(fx.sim.vms("xs01").is_empty());
        assert_eq!(fx.sim.connect_count("xs01"), 0);
    }

    #[tokio::test]
    async fn test_unreachable_host_keeps_record_provisioning() {
        let fx = fixture_with_version(ApiVersion::new(1, 2)).await;
        let job = submit(&fx, Vec::new()).await;
        fx.sim.fail_connect("xs01", true);

        let err = ProvisionService::new(fx.state.clone()).run(&job).await.unwrap_err();
        assert!(matches!(err, Error::HostUnavailable { .. }));

        let vm = fx.repo.get_vm(&job.vm_id).await.unwrap();
        assert_eq!(vm.status, VmStatus::Provisioning);
        assert!(vm.last_error.unwrap().contains("xs01"));
    }
}
