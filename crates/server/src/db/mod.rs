/// 数据库访问层
///
/// 核心只通过 `Repository` 读写记录，单条记录粒度的事务，写入按版本号做条件更新。

pub mod memory;
pub mod models;
pub mod repository;

use async_trait::async_trait;
use common::{Error, HostRecord, Result, TemplateRecord, VmMetricSeries, VmRecord};
use sea_orm::{Database, DatabaseConnection};
use tracing::{info, warn};

pub use memory::MemoryRepository;
pub use repository::SeaOrmRepository;

/// 读改写遇到版本冲突时的最大重试次数
const MAX_STALE_RETRIES: usize = 3;

/// 建立数据库连接 (SeaORM)
pub async fn establish_connection(database_url: &str) -> Result<DatabaseConnection> {
    info!("正在连接数据库: {}", database_url);

    let db = Database::connect(database_url)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
    info!("数据库连接成功");

    Ok(db)
}

/// 数据存储接口
#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_host(&self, id: &str) -> Result<HostRecord>;

    /// 按主机名排序列出宿主机，可按可用区过滤
    async fn list_hosts(&self, zone: Option<&str>) -> Result<Vec<HostRecord>>;

    /// 条件更新，成功后返回新版本的记录
    async fn update_host(&self, host: &HostRecord) -> Result<HostRecord>;

    async fn get_template(&self, id: &str) -> Result<TemplateRecord>;

    async fn list_templates(&self) -> Result<Vec<TemplateRecord>>;

    async fn get_vm(&self, id: &str) -> Result<VmRecord>;

    /// 按名称排序列出宿主机上的虚拟机
    async fn list_vms_on_host(&self, host_id: &str) -> Result<Vec<VmRecord>>;

    async fn create_vm(&self, vm: VmRecord) -> Result<VmRecord>;

    /// 条件更新，成功后返回新版本的记录
    async fn update_vm(&self, vm: &VmRecord) -> Result<VmRecord>;

    /// 删除虚拟机记录及其指标
    async fn delete_vm(&self, id: &str) -> Result<()>;

    /// 整体替换虚拟机的指标序列
    async fn replace_vm_metrics(&self, vm_id: &str, series: Vec<VmMetricSeries>) -> Result<()>;

    /// 按指标名排序
    async fn list_vm_metrics(&self, vm_id: &str) -> Result<Vec<VmMetricSeries>>;
}

/// 重新读取并修改虚拟机记录，版本冲突时重试
///
/// 闭包返回 `false` 表示无需写入。
pub async fn modify_vm<F>(repo: &dyn Repository, id: &str, mut apply: F) -> Result<VmRecord>
where
    F: FnMut(&mut VmRecord) -> bool + Send,
{
    let mut attempt = 0;
    loop {
        let mut vm = repo.get_vm(id).await?;
        if !apply(&mut vm) {
            return Ok(vm);
        }
        vm.updated_at = chrono::Utc::now();

        match repo.update_vm(&vm).await {
            Err(Error::StaleState(msg)) if attempt + 1 < MAX_STALE_RETRIES => {
                attempt += 1;
                warn!("虚拟机 {} 写入冲突，重新读取后重试 ({}): {}", id, attempt, msg);
            }
            other => return other,
        }
    }
}

/// 重新读取并修改宿主机记录，版本冲突时重试
pub async fn modify_host<F>(repo: &dyn Repository, id: &str, mut apply: F) -> Result<HostRecord>
where
    F: FnMut(&mut HostRecord) + Send,
{
    let mut attempt = 0;
    loop {
        let mut host = repo.get_host(id).await?;
        apply(&mut host);

        match repo.update_host(&host).await {
            Err(Error::StaleState(msg)) if attempt + 1 < MAX_STALE_RETRIES => {
                attempt += 1;
                warn!("宿主机 {} 写入冲突，重新读取后重试 ({}): {}", id, attempt, msg);
            }
            other => return other,
        }
    }
}

/// 计算子网上已使用的地址
///
/// 同一子网可能跨多台宿主机，因此汇总所有同子网宿主机上的虚拟机地址。
pub async fn used_addresses(
    repo: &dyn Repository,
    subnet: &str,
) -> Result<std::collections::HashSet<std::net::Ipv4Addr>> {
    let target = common::ipam::parse_subnet(subnet)?;
    let mut used = std::collections::HashSet::new();

    for host in repo.list_hosts(None).await? {
        let same_subnet = common::ipam::parse_subnet(&host.subnet)
            .map(|s| s == target)
            .unwrap_or(false);
        if !same_subnet {
            continue;
        }

        let vms = repo.list_vms_on_host(&host.id).await?;
        used.extend(common::ipam::used_set(vms.iter().filter_map(|vm| vm.ip.as_deref())));
    }

    Ok(used)
}
