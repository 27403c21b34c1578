/// 对账服务
///
/// 每个周期为每台宿主机投递一个独立的刷新任务；刷新只覆盖观测字段与性能指标，
/// 不改动开通流程持有的字段，单台宿主机失败不影响其他宿主机。

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use common::{Error, HostRecord, Result, VmMetricSeries, VmRecord, VmStatus};
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::db::{self, Repository};
use crate::hypervisor::{HostSession, PowerState, RemoteVm};
use crate::tasks::WorkItem;

use super::provision_service::PROVISION_TOKEN_KEY;

/// 一次宿主机刷新的结果统计
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshSummary {
    pub updated: usize,
    pub removed: usize,
    pub adopted: usize,
    /// 写入了指标的虚拟机数量
    pub metrics: usize,
}

pub struct ReconcileService {
    state: AppState,
}

impl ReconcileService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    fn repo(&self) -> &dyn Repository {
        self.state.repo.as_ref()
    }

    /// 为每台宿主机投递一个刷新任务，返回投递数量
    pub async fn tick(&self) -> Result<usize> {
        let hosts = self.repo().list_hosts(None).await?;
        if hosts.is_empty() {
            debug!("没有登记的宿主机，跳过本轮对账");
            return Ok(0);
        }

        let mut dispatched = 0;
        for host in &hosts {
            match self.state.dispatcher.submit(WorkItem::RefreshHost {
                host_id: host.id.clone(),
            }) {
                Ok(()) => dispatched += 1,
                Err(e) => warn!("宿主机 {} 刷新任务投递失败: {}", host.hostname, e),
            }
        }

        info!("本轮对账投递 {}/{} 个宿主机刷新任务", dispatched, hosts.len());
        Ok(dispatched)
    }

    /// 刷新单台宿主机的指标与其上虚拟机的状态
    pub async fn refresh_host(&self, host_id: &str) -> Result<RefreshSummary> {
        let host = self.repo().get_host(host_id).await?;
        let sessions = self.state.session_manager();
        let session = sessions.session(&host).await?;

        let metrics = session.host_metrics().await?;
        db::modify_host(self.repo(), &host.id, |record| {
            record.total_memory = metrics.total_memory;
            record.free_memory = metrics.free_memory;
            record.total_cores = metrics.cores;
            record.cpu_utilization = metrics.cpu_utilization;
            record.last_refreshed = Some(Utc::now());
        })
        .await?;

        let remote: Vec<RemoteVm> = session
            .list_vms()
            .await?
            .into_iter()
            .filter(|vm| !vm.is_control_domain && !vm.is_template)
            .collect();
        let local = self.repo().list_vms_on_host(&host.id).await?;

        let mut summary = self.sync_vms(&host, &local, &remote).await?;
        summary.metrics = self.collect_metrics(&session, &host, &remote).await?;
        info!(
            "宿主机 {} 刷新完成: 空闲内存 {} MB, CPU {:.1}%, 更新 {} 台, 删除 {} 台, 接管 {} 台, 指标 {} 台",
            host.hostname,
            metrics.free_memory,
            metrics.cpu_utilization,
            summary.updated,
            summary.removed,
            summary.adopted,
            summary.metrics
        );
        Ok(summary)
    }

    /// 拉取远端仍存在的虚拟机的性能指标并整体替换，单台失败只记录日志
    async fn collect_metrics(
        &self,
        session: &HostSession,
        host: &HostRecord,
        remote: &[RemoteVm],
    ) -> Result<usize> {
        let present: HashSet<&str> = remote.iter().map(|vm| vm.reference.as_str()).collect();
        let mut stored = 0;

        // 重新读取，包含本轮接管的记录
        for vm in self.repo().list_vms_on_host(&host.id).await? {
            if !vm.has_remote_object() || !present.contains(vm.external_reference.as_str()) {
                continue;
            }

            let series = match session.vm_metrics(&vm.external_reference).await {
                Ok(series) => series,
                Err(e) => {
                    warn!("虚拟机 {} 指标拉取失败: {}", vm.name, e);
                    continue;
                }
            };
            let series = series
                .into_iter()
                .map(|s| VmMetricSeries::new(&vm.id, s.key, s.timestamps, s.values))
                .collect();

            match self.repo().replace_vm_metrics(&vm.id, series).await {
                Ok(()) => stored += 1,
                Err(Error::NotFound(_)) => debug!("虚拟机 {} 记录已删除，丢弃指标", vm.id),
                Err(e) => return Err(e),
            }
        }

        Ok(stored)
    }

    async fn sync_vms(
        &self,
        host: &HostRecord,
        local: &[VmRecord],
        remote: &[RemoteVm],
    ) -> Result<RefreshSummary> {
        let mut summary = RefreshSummary::default();
        let by_ref: HashMap<&str, &RemoteVm> =
            remote.iter().map(|vm| (vm.reference.as_str(), vm)).collect();

        for vm in local.iter().filter(|vm| vm.has_remote_object()) {
            let reference = vm.external_reference.clone();

            match by_ref.get(reference.as_str()) {
                Some(remote_vm) => {
                    let power = remote_vm.power_state;
                    let before = vm.version;
                    let updated = db::modify_vm(self.repo(), &vm.id, |record| {
                        if record.external_reference != reference {
                            return false;
                        }
                        match observed_status(record.status, power) {
                            Some(status) => {
                                record.status = status;
                                true
                            }
                            None => false,
                        }
                    })
                    .await?;
                    if updated.version != before {
                        debug!("虚拟机 {} 状态 {} -> {}", vm.name, vm.status, updated.status);
                        summary.updated += 1;
                    }
                }
                None if vm.status == VmStatus::Terminating => {
                    self.repo().delete_vm(&vm.id).await?;
                    info!("虚拟机 {} 已在远端销毁，删除本地记录", vm.name);
                    summary.removed += 1;
                }
                None if vm.status != VmStatus::Error => {
                    warn!("虚拟机 {} ({}) 在远端已不存在", vm.name, reference);
                    db::modify_vm(self.repo(), &vm.id, |record| {
                        if record.external_reference != reference {
                            return false;
                        }
                        record.status = VmStatus::Error;
                        record.last_error = Some("远端虚拟机已不存在".to_string());
                        true
                    })
                    .await?;
                    summary.updated += 1;
                }
                None => {}
            }
        }

        // 未登记的远端虚拟机：排除已知引用和开通中的占位标记
        let known: HashSet<&str> = local.iter().map(|vm| vm.external_reference.as_str()).collect();
        for remote_vm in remote {
            let token = remote_vm
                .other_config
                .get(PROVISION_TOKEN_KEY)
                .map(String::as_str);
            if known.contains(remote_vm.reference.as_str())
                || token.map_or(false, |t| known.contains(t))
            {
                continue;
            }

            let record = VmRecord::adopted(
                remote_vm.name_label.clone(),
                &host.id,
                remote_vm.reference.clone(),
                map_power_state(remote_vm.power_state),
                remote_vm.memory_static_max / (1024 * 1024),
                remote_vm.vcpus_max as i32,
            );
            self.repo().create_vm(record).await?;
            info!("接管宿主机 {} 上未登记的虚拟机 {}", host.hostname, remote_vm.name_label);
            summary.adopted += 1;
        }

        Ok(summary)
    }
}

fn map_power_state(state: PowerState) -> VmStatus {
    match state {
        PowerState::Running => VmStatus::Running,
        PowerState::Halted | PowerState::Paused | PowerState::Suspended => VmStatus::Stopped,
    }
}

/// 根据远端电源状态计算新的本地状态，无需变更时返回 `None`
///
/// Provisioning 只在远端运行后提升；Terminating 等待远端对象消失。
pub fn observed_status(current: VmStatus, power: PowerState) -> Option<VmStatus> {
    let observed = map_power_state(power);
    match current {
        VmStatus::Provisioning => (observed == VmStatus::Running).then_some(VmStatus::Running),
        VmStatus::Terminating => None,
        status if status == observed => None,
        _ => Some(observed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::simulated::SimFault;
    use crate::hypervisor::{ApiVersion, RemoteMetricSeries};
    use crate::services::test_support::{fixture, Fixture};
    use common::TemplateRecord;

    #[test]
    fn test_observed_status() {
        use PowerState::*;
        assert_eq!(observed_status(VmStatus::Starting, Running), Some(VmStatus::Running));
        assert_eq!(observed_status(VmStatus::Stopping, Halted), Some(VmStatus::Stopped));
        assert_eq!(observed_status(VmStatus::Rebooting, Running), Some(VmStatus::Running));
        assert_eq!(observed_status(VmStatus::Running, Suspended), Some(VmStatus::Stopped));
        assert_eq!(observed_status(VmStatus::Running, Running), None);
        assert_eq!(observed_status(VmStatus::Provisioning, Halted), None);
        assert_eq!(observed_status(VmStatus::Provisioning, Running), Some(VmStatus::Running));
        assert_eq!(observed_status(VmStatus::Terminating, Running), None);
        assert_eq!(observed_status(VmStatus::Error, Paused), Some(VmStatus::Stopped));
    }

    async fn add_host(fx: &Fixture, name: &str) -> HostRecord {
        fx.repo
            .insert_host(HostRecord::new(name, None, 16384, 8, "10.1.0.0/24").unwrap())
            .await
    }

    #[tokio::test]
    async fn test_tick_with_no_hosts_dispatches_nothing() {
        let fx = crate::services::test_support::empty_fixture().await;
        let dispatched = ReconcileService::new(fx.state.clone()).tick().await.unwrap();
        assert_eq!(dispatched, 0);
        assert!(fx.recorder.items().is_empty());
    }

    #[tokio::test]
    async fn test_tick_dispatches_one_unit_per_host() {
        let fx = fixture().await;
        add_host(&fx, "xs02").await;
        add_host(&fx, "xs03").await;

        let dispatched = ReconcileService::new(fx.state.clone()).tick().await.unwrap();
        assert_eq!(dispatched, 3);

        let mut host_ids: Vec<String> = fx
            .recorder
            .items()
            .into_iter()
            .map(|item| match item {
                WorkItem::RefreshHost { host_id } => host_id,
                other => panic!("unexpected work item {:?}", other),
            })
            .collect();
        host_ids.sort();
        host_ids.dedup();
        assert_eq!(host_ids.len(), 3);
    }

    #[tokio::test]
    async fn test_failing_host_does_not_block_others() {
        let fx = fixture().await;
        let xs02 = add_host(&fx, "xs02").await;
        let xs03 = add_host(&fx, "xs03").await;
        fx.sim.fail_connect("xs02", true);
        fx.sim.set_metrics("xs03", 32768, 12, 42.5);

        let service = ReconcileService::new(fx.state.clone());
        service.tick().await.unwrap();

        let mut failures = 0;
        for item in fx.recorder.take() {
            if let WorkItem::RefreshHost { host_id } = item {
                if service.refresh_host(&host_id).await.is_err() {
                    failures += 1;
                }
            }
        }
        assert_eq!(failures, 1);

        let refreshed = fx.repo.get_host(&xs03.id).await.unwrap();
        assert_eq!(refreshed.total_memory, 32768);
        assert_eq!(refreshed.total_cores, 12);
        assert_eq!(refreshed.cpu_utilization, 42.5);
        assert!(refreshed.last_refreshed.is_some());
        assert!(fx.repo.get_host(&xs02.id).await.unwrap().last_refreshed.is_none());
        assert!(fx.repo.get_host(&fx.host.id).await.unwrap().last_refreshed.is_some());
    }

    async fn local_vm(fx: &Fixture, name: &str, reference: &str, status: VmStatus) -> VmRecord {
        let mut record =
            VmRecord::new_provisioning(name, &fx.host.id, &fx.template, None).unwrap();
        if !reference.is_empty() {
            record.external_reference = reference.to_string();
        }
        record.status = status;
        fx.repo.create_vm(record).await.unwrap()
    }

    #[tokio::test]
    async fn test_refresh_maps_remote_state_onto_records() {
        let fx = fixture().await;
        let running = fx.sim.insert_vm("xs01", "a", 1024, PowerState::Running);
        let halted = fx.sim.insert_vm("xs01", "b", 1024, PowerState::Halted);
        let booting = fx.sim.insert_vm("xs01", "c", 1024, PowerState::Halted);

        let a = local_vm(&fx, "a", &running, VmStatus::Starting).await;
        let b = local_vm(&fx, "b", &halted, VmStatus::Stopping).await;
        let c = local_vm(&fx, "c", &booting, VmStatus::Provisioning).await;
        let gone = local_vm(&fx, "d", "OpaqueRef:gone", VmStatus::Running).await;
        let destroyed = local_vm(&fx, "e", "OpaqueRef:destroyed", VmStatus::Terminating).await;
        let pending = local_vm(&fx, "f", "", VmStatus::Provisioning).await;

        let summary = ReconcileService::new(fx.state.clone())
            .refresh_host(&fx.host.id)
            .await
            .unwrap();
        assert_eq!(summary.removed, 1);
        assert_eq!(summary.adopted, 0);

        let repo = &fx.repo;
        assert_eq!(repo.get_vm(&a.id).await.unwrap().status, VmStatus::Running);
        assert_eq!(repo.get_vm(&b.id).await.unwrap().status, VmStatus::Stopped);
        assert_eq!(repo.get_vm(&c.id).await.unwrap().status, VmStatus::Provisioning);
        assert_eq!(repo.get_vm(&gone.id).await.unwrap().status, VmStatus::Error);
        assert!(repo.get_vm(&destroyed.id).await.is_err());
        assert_eq!(repo.get_vm(&pending.id).await.unwrap(), pending);
    }

    #[tokio::test]
    async fn test_refresh_adopts_unknown_remote_vms() {
        let fx = fixture().await;
        fx.sim.insert_vm("xs01", "legacy.example.com", 2048, PowerState::Running);

        let service = ReconcileService::new(fx.state.clone());
        let summary = service.refresh_host(&fx.host.id).await.unwrap();
        assert_eq!(summary.adopted, 1);

        let vms = fx.repo.list_vms_on_host(&fx.host.id).await.unwrap();
        assert_eq!(vms.len(), 1);
        assert_eq!(vms[0].name, "legacy.example.com");
        assert_eq!(vms[0].status, VmStatus::Running);
        assert_eq!(vms[0].memory, 2048);
        assert!(vms[0].template_id.is_none());

        // 第二次刷新不会重复接管
        assert_eq!(service.refresh_host(&fx.host.id).await.unwrap().adopted, 0);
    }

    #[tokio::test]
    async fn test_refresh_leaves_in_flight_provisioning_alone() {
        let fx = crate::services::test_support::fixture_with_version(ApiVersion::new(1, 1)).await;
        let vm = local_vm(&fx, "web01", "", VmStatus::Provisioning).await;

        // 上一次开通留下的远端对象带有占位标记
        let sessions = fx.state.session_manager();
        let session = sessions.session(&fx.host).await.unwrap();
        let params = crate::services::provision_service::build_create_params(
            &vm,
            &TemplateRecord::new("t", 512, 1, "").unwrap(),
            "http://x/preseed/t",
            None,
            "sr",
        );
        session.create_vm(&params).await.unwrap();

        let summary = ReconcileService::new(fx.state.clone())
            .refresh_host(&fx.host.id)
            .await
            .unwrap();
        assert_eq!(summary.adopted, 0);
        assert_eq!(fx.repo.vm_count(), 1);
    }

    #[tokio::test]
    async fn test_refresh_stores_vm_metrics() {
        let fx = fixture().await;
        let running = fx.sim.insert_vm("xs01", "a", 1024, PowerState::Running);
        let halted = fx.sim.insert_vm("xs01", "b", 1024, PowerState::Halted);
        fx.sim.set_vm_metrics(
            "xs01",
            &running,
            vec![RemoteMetricSeries {
                key: "cpu0".to_string(),
                timestamps: vec![1_700_000_000, 1_700_000_060],
                values: vec![0.25, 0.5],
            }],
        );
        let a = local_vm(&fx, "a", &running, VmStatus::Running).await;
        let b = local_vm(&fx, "b", &halted, VmStatus::Stopped).await;
        let pending = local_vm(&fx, "c", "", VmStatus::Provisioning).await;

        let summary = ReconcileService::new(fx.state.clone())
            .refresh_host(&fx.host.id)
            .await
            .unwrap();
        assert_eq!(summary.metrics, 2);

        let stored = fx.repo.list_vm_metrics(&a.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].key, "cpu0");
        assert_eq!(stored[0].points(), vec![(1_700_000_000_000, 0.25), (1_700_000_060_000, 0.5)]);
        assert!(fx.repo.list_vm_metrics(&b.id).await.unwrap().is_empty());
        assert!(fx.repo.list_vm_metrics(&pending.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_vm_metrics_failure_does_not_fail_refresh() {
        let fx = fixture().await;
        let running = fx.sim.insert_vm("xs01", "a", 1024, PowerState::Running);
        local_vm(&fx, "a", &running, VmStatus::Running).await;
        fx.sim.fail_next("xs01", SimFault::VmMetrics);

        let summary = ReconcileService::new(fx.state.clone())
            .refresh_host(&fx.host.id)
            .await
            .unwrap();
        assert_eq!(summary.metrics, 0);
    }

    #[tokio::test]
    async fn test_metrics_failure_reports_error() {
        let fx = fixture().await;
        fx.sim.fail_next("xs01", SimFault::HostMetrics);
        assert!(ReconcileService::new(fx.state.clone())
            .refresh_host(&fx.host.id)
            .await
            .is_err());
    }
}
