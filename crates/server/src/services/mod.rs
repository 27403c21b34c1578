pub mod capacity_service;
pub mod provision_service;
pub mod reconcile_service;
pub mod vm_service;
pub mod worker;

use common::placement::HostInventory;
use common::Result;

use crate::db::Repository;

pub use worker::TaskWorker;

/// 读取宿主机及其虚拟机，作为调度与容量计算的输入
pub(crate) async fn load_inventory(
    repo: &dyn Repository,
    zone: Option<&str>,
) -> Result<Vec<HostInventory>> {
    let hosts = repo.list_hosts(zone).await?;
    let mut inventory = Vec::with_capacity(hosts.len());

    for host in hosts {
        let vms = repo.list_vms_on_host(&host.id).await?;
        inventory.push(HostInventory::new(host, vms));
    }

    Ok(inventory)
}
