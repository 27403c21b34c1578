/// 放置调度
///
/// 按内存余量分槽的装箱策略：优先填满"刚好够用"的最低档位，同档内选 CPU 最空闲的宿主机。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{Error, Result};
use crate::models::{HostRecord, TemplateRecord, VmRecord, VmStatus};

/// 内存分槽粒度（MB）
pub const SLOT_SIZE: i64 = 1024;

/// 一台宿主机及其上的虚拟机快照
#[derive(Debug, Clone)]
pub struct HostInventory {
    pub host: HostRecord,
    pub vms: Vec<VmRecord>,
}

impl HostInventory {
    pub fn new(host: HostRecord, vms: Vec<VmRecord>) -> Self {
        Self { host, vms }
    }

    /// 扣除尚未进入 Running 的虚拟机预占内存后的有效空闲内存
    pub fn effective_free_memory(&self) -> i64 {
        let in_flight: i64 = self
            .vms
            .iter()
            .filter(|vm| vm.status != VmStatus::Running)
            .map(|vm| vm.memory)
            .sum();

        self.host.free_memory - in_flight
    }
}

/// 为模板选择宿主机
pub fn select_host<'a>(
    candidates: &'a [HostInventory],
    template: &TemplateRecord,
) -> Result<&'a HostRecord> {
    let mut slots: BTreeMap<i64, Vec<&HostInventory>> = BTreeMap::new();

    for inventory in candidates {
        let free = inventory.effective_free_memory();
        if free <= template.memory {
            debug!(
                "宿主机 {} 有效空闲内存 {} MB 不足 {} MB",
                inventory.host.hostname, free, template.memory
            );
            continue;
        }

        slots
            .entry(free.div_euclid(SLOT_SIZE))
            .or_default()
            .push(inventory);
    }

    // 最低非空槽位；同槽内 CPU 利用率升序，相同时保持候选顺序
    slots
        .into_values()
        .next()
        .and_then(|hosts| {
            hosts.into_iter().min_by(|a, b| {
                a.host
                    .cpu_utilization
                    .total_cmp(&b.host.cpu_utilization)
            })
        })
        .map(|inventory| &inventory.host)
        .ok_or(Error::NoCapacity {
            required: template.memory,
        })
}

/// 单个模板在整个集群内还能放下的实例数
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemplateSlack {
    pub template_id: String,
    pub name: String,
    pub memory: i64,
    pub available_instances: i64,
}

/// 集群容量概览
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapacityReport {
    pub templates: Vec<TemplateSlack>,
    pub total_memory: i64,
    pub free_memory: i64,
    pub host_cores: i64,
    pub vm_cores: i64,
    /// 虚拟机核数 / 宿主机核数
    pub core_contention: f64,
}

pub fn capacity_report(inventory: &[HostInventory], templates: &[TemplateRecord]) -> CapacityReport {
    let total_memory = inventory.iter().map(|i| i.host.total_memory).sum();
    let free_memory = inventory.iter().map(|i| i.host.free_memory).sum();
    let host_cores: i64 = inventory.iter().map(|i| i.host.total_cores as i64).sum();
    let vm_cores: i64 = inventory
        .iter()
        .flat_map(|i| i.vms.iter())
        .map(|vm| vm.cores as i64)
        .sum();

    let mut slack: Vec<TemplateSlack> = templates
        .iter()
        .map(|template| {
            let available_instances = inventory
                .iter()
                .map(HostInventory::effective_free_memory)
                .filter(|free| template.memory < *free)
                .map(|free| free / template.memory)
                .sum();

            TemplateSlack {
                template_id: template.id.clone(),
                name: template.name.clone(),
                memory: template.memory,
                available_instances,
            }
        })
        .collect();
    slack.sort_by(|a, b| b.memory.cmp(&a.memory));

    let core_contention = if host_cores > 0 {
        vm_cores as f64 / host_cores as f64
    } else {
        0.0
    };

    CapacityReport {
        templates: slack,
        total_memory,
        free_memory,
        host_cores,
        vm_cores,
        core_contention,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(name: &str, free: i64, cpu: f64) -> HostRecord {
        let mut host = HostRecord::new(name, None, 65536, 16, "10.0.0.0/24").unwrap();
        host.free_memory = free;
        host.cpu_utilization = cpu;
        host
    }

    fn template(memory: i64) -> TemplateRecord {
        TemplateRecord::new("tmpl", memory, 1, "").unwrap()
    }

    fn vm_on(host: &HostRecord, memory: i64, status: VmStatus) -> VmRecord {
        let mut vm = VmRecord::new_provisioning("vm", &host.id, &template(memory), None).unwrap();
        vm.status = status;
        vm
    }

    #[test]
    fn test_lowest_slot_wins_regardless_of_cpu() {
        let candidates = vec![
            HostInventory::new(host("xs01", 1500, 1.0), vec![]),
            HostInventory::new(host("xs02", 500, 99.0), vec![]),
            HostInventory::new(host("xs03", 1600, 0.0), vec![]),
        ];

        let chosen = select_host(&candidates, &template(400)).unwrap();
        assert_eq!(chosen.hostname, "xs02");
    }

    #[test]
    fn test_cpu_tie_break_within_slot() {
        let candidates = vec![
            HostInventory::new(host("xs01", 3000, 70.0), vec![]),
            HostInventory::new(host("xs02", 2500, 30.0), vec![]),
        ];

        let chosen = select_host(&candidates, &template(512)).unwrap();
        assert_eq!(chosen.hostname, "xs02");
    }

    #[test]
    fn test_no_capacity_when_free_not_strictly_greater() {
        let candidates = vec![
            HostInventory::new(host("xs01", 1024, 0.0), vec![]),
            HostInventory::new(host("xs02", 800, 0.0), vec![]),
        ];

        assert!(matches!(
            select_host(&candidates, &template(1024)),
            Err(Error::NoCapacity { required: 1024 })
        ));
        assert!(matches!(
            select_host(&[], &template(1024)),
            Err(Error::NoCapacity { .. })
        ));
    }

    #[test]
    fn test_in_flight_vms_reduce_effective_memory() {
        let busy = host("xs01", 4096, 0.0);
        let in_flight = vec![
            vm_on(&busy, 2048, VmStatus::Provisioning),
            vm_on(&busy, 1024, VmStatus::Starting),
            vm_on(&busy, 8192, VmStatus::Running),
        ];
        let inventory = HostInventory::new(busy, in_flight);
        assert_eq!(inventory.effective_free_memory(), 1024);

        let candidates = vec![inventory, HostInventory::new(host("xs02", 6000, 50.0), vec![])];
        let chosen = select_host(&candidates, &template(2048)).unwrap();
        assert_eq!(chosen.hostname, "xs02");
    }

    #[test]
    fn test_capacity_report() {
        let a = host("xs01", 4096, 0.0);
        let b = host("xs02", 1000, 0.0);
        let vms = vec![vm_on(&a, 1024, VmStatus::Running)];
        let inventory = vec![HostInventory::new(a, vms), HostInventory::new(b, vec![])];

        let report = capacity_report(&inventory, &[template(1024), template(2048)]);

        assert_eq!(report.templates[0].memory, 2048);
        assert_eq!(report.templates[0].available_instances, 2);
        assert_eq!(report.templates[1].available_instances, 4);
        assert_eq!(report.free_memory, 5096);
        assert_eq!(report.host_cores, 32);
        assert_eq!(report.vm_cores, 1);
        assert!((report.core_contention - 1.0 / 32.0).abs() < f64::EPSILON);
    }
}
